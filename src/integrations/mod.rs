/// Catalog of installed integrations
///
/// The repository persists which packages are installed and tells
/// subscribers when that set changes. The broker reads it at startup and then
/// follows its change events for the rest of the session.

pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteIntegrationsRepository;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::IntegrationManifest;
use crate::runner::ServerDescription;

/// Errors that can occur during repository operations
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Database query error: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Integration not found: {id}")]
    NotFound { id: String },

    #[error("Integration already installed: {name}")]
    AlreadyInstalled { name: String },

    #[error("Migration error: {0}")]
    Migration(String),
}

/// A package installed into the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledIntegration {
    pub id: String,
    pub manifest: IntegrationManifest,
    /// Values supplied at install time; they override manifest defaults
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub installed_at: DateTime<Utc>,
}

impl InstalledIntegration {
    pub fn new(manifest: IntegrationManifest, env: BTreeMap<String, String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            manifest,
            env,
            installed_at: Utc::now(),
        }
    }

    /// Manifest defaults overlaid with the installed values
    pub fn resolved_env(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .manifest
            .env_vars
            .iter()
            .filter_map(|var| var.default.clone().map(|value| (var.name.clone(), value)))
            .collect();
        env.extend(self.env.clone());
        env
    }

    /// Declared variables that have neither a default nor an installed value
    pub fn missing_env(&self) -> Vec<&str> {
        self.manifest
            .env_vars
            .iter()
            .filter(|var| var.default.is_none() && !self.env.contains_key(&var.name))
            .map(|var| var.name.as_str())
            .collect()
    }

    /// What the runner needs to start this integration
    pub fn server_description(&self) -> ServerDescription {
        ServerDescription {
            runtime: self.manifest.runtime.clone(),
            command: self.manifest.command.clone(),
            args: self.manifest.args.clone(),
            env: self.resolved_env(),
            memory_limit_mb: None,
        }
    }
}

/// What happened to an integration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Removed,
}

/// Pushed to subscribers whenever the catalog changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationsChangedEvent {
    pub kind: ChangeKind,
    pub integration: InstalledIntegration,
}

pub type ChangeCallback = Arc<dyn Fn(&IntegrationsChangedEvent) + Send + Sync>;

/// Storage interface for installed integrations
#[async_trait]
pub trait IntegrationsRepository: Send + Sync {
    /// Install a package; fails if a package with the same name is installed
    async fn install(
        &self,
        manifest: IntegrationManifest,
        env: BTreeMap<String, String>,
    ) -> Result<InstalledIntegration, RepositoryError>;

    /// All installed integrations, oldest first
    async fn list(&self) -> Result<Vec<InstalledIntegration>, RepositoryError>;

    /// Remove an integration and return what was removed
    async fn uninstall(&self, id: &str) -> Result<InstalledIntegration, RepositoryError>;

    /// Receive change events until the returned subscription is dropped
    fn subscribe(&self, callback: ChangeCallback) -> Subscription;
}

#[derive(Default)]
struct Subscribers {
    next_key: u64,
    /// Keys grow with each subscription, so iteration follows registration order
    callbacks: BTreeMap<u64, ChangeCallback>,
}

/// Observer registry for change events
///
/// Callbacks run in registration order on the emitting task, outside the
/// registry lock, so a callback may subscribe or unsubscribe.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, callback: ChangeCallback) -> Subscription {
        let mut subscribers = self.lock();
        let key = subscribers.next_key;
        subscribers.next_key += 1;
        subscribers.callbacks.insert(key, callback);

        Subscription {
            key,
            subscribers: Arc::downgrade(&self.subscribers),
            active: AtomicBool::new(true),
        }
    }

    pub fn emit(&self, event: &IntegrationsChangedEvent) {
        let callbacks: Vec<ChangeCallback> = self.lock().callbacks.values().cloned().collect();

        for callback in callbacks {
            callback(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().callbacks.len()
    }
}

/// Handle to one registered callback
///
/// `unsubscribe` may be called any number of times; dropping the handle
/// unsubscribes as well.
pub struct Subscription {
    key: u64,
    subscribers: Weak<Mutex<Subscribers>>,
    active: AtomicBool,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .callbacks
                .remove(&self.key);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
