/// Public library interface of the MCP broker
///
/// The broker serves one MCP session over stdio and runs every installed
/// integration as a child MCP server in its own sandboxed container. This
/// module exports the building blocks so the binary and the tests can wire
/// them together.

pub mod broker;
pub mod config;
pub mod integrations;
pub mod jsonrpc;
pub mod mcp;
pub mod registry;
pub mod runner;
pub mod tools;

// Re-export the main types
pub use broker::{BrokerError, LocalBroker, SessionState, StartError};
pub use config::{BrokerConfig, RunnerConfig};
pub use integrations::{
    ChangeKind, InstalledIntegration, IntegrationsChangedEvent, IntegrationsRepository, RepositoryError,
    SqliteIntegrationsRepository, Subscription,
};
pub use jsonrpc::{CallError, Connection};
pub use registry::{BundledRegistry, IntegrationManifest, RegistryClient, RegistryError};
pub use runner::{
    ContainerServerRunner, RunOutcome, RunnerError, RunningServer, Runtime, RuntimeError, ServerDescription,
    ServerInstance, ServerRunner,
};
