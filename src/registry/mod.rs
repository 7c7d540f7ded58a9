/// Registry of installable MCP server packages
///
/// The registry describes what can be installed (`IntegrationManifest`) and
/// answers full-text lookups. The broker only uses it to answer the
/// `__mcp__search_registry` built-in; the CLI uses it to resolve packages
/// before installing them.

pub mod bundled;

pub use bundled::BundledRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while querying the registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Package catalog is malformed: {0}")]
    Catalog(#[from] serde_json::Error),

    #[error("Package not found: {}", package_ref(.name, .version))]
    NotFound {
        name: String,
        version: Option<String>,
    },
}

fn package_ref(name: &str, version: &Option<String>) -> String {
    match version {
        Some(version) => format!("{}@{}", name, version),
        None => name.to_string(),
    }
}

/// An environment variable a package expects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Value used when the installation does not provide one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Static description of an installable package
///
/// `runtime` is a runtime spec string (`"node"`, `"python@3.12.1"`) that is
/// validated when a server is created from it, not when the manifest is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationManifest {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub homepage: String,
    pub runtime: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env_vars: Vec<EnvVarSpec>,
}

/// One hit of a registry search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationSearchResult {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
}

impl From<&IntegrationManifest> for IntegrationSearchResult {
    fn from(manifest: &IntegrationManifest) -> Self {
        Self {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
        }
    }
}

/// Lookup interface over a package registry
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetch the manifest of a package; `None` version means any version
    async fn manifest(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<IntegrationManifest, RegistryError>;

    /// Full-text search over package names and descriptions
    async fn search(&self, terms: &[String]) -> Result<Vec<IntegrationSearchResult>, RegistryError>;
}

/// Split a `name[@version]` package reference
///
/// Scoped npm names start with `@`, so only an `@` after the first character
/// separates the version.
pub fn split_package_ref(reference: &str) -> (&str, Option<&str>) {
    match reference.rfind('@') {
        Some(at) if at > 0 => {
            let (name, version) = reference.split_at(at);
            let version = &version[1..];
            if version.is_empty() {
                (name, None)
            } else {
                (name, Some(version))
            }
        }
        _ => (reference, None),
    }
}
