/// Registry of integrations that are starting or running
///
/// One mutex guards both maps. Every insert and removal happens under it;
/// readers take a snapshot and release the lock before doing any I/O.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::integrations::InstalledIntegration;
use crate::jsonrpc::Connection;
use crate::mcp::ToolDefinition;

/// A running integration as seen by request handlers
#[derive(Clone)]
pub struct ActiveServer {
    pub integration: InstalledIntegration,
    /// Distinguishes this run from earlier runs of the same integration;
    /// also orders tool registration
    pub key: u64,
    pub connection: Connection,
    pub tools: Vec<ToolDefinition>,
    token: CancellationToken,
}

/// Reservation held by one start attempt
struct Starting {
    key: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct ActiveState {
    next_key: u64,
    starting: HashMap<String, Starting>,
    running: HashMap<String, ActiveServer>,
}

impl ActiveState {
    fn next_key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    /// Take the reservation of `id` if it still belongs to attempt `key`
    fn take_starting(&mut self, id: &str, key: u64) -> Option<CancellationToken> {
        match self.starting.get(id) {
            Some(starting) if starting.key == key => self.starting.remove(id).map(|s| s.token),
            _ => None,
        }
    }
}

/// Integration id to starting or running instance
#[derive(Default)]
pub struct ActiveIntegrations {
    state: Mutex<ActiveState>,
}

impl ActiveIntegrations {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ActiveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `id` for a start attempt
    ///
    /// Returns the attempt's key, or `None` if `id` is already starting or
    /// running.
    pub fn begin_start(&self, id: &str, token: CancellationToken) -> Option<u64> {
        let mut state = self.lock();
        if state.starting.contains_key(id) || state.running.contains_key(id) {
            return None;
        }
        let key = state.next_key();
        state.starting.insert(id.to_string(), Starting { key, token });
        Some(key)
    }

    /// Drop the reservation of failed attempt `key`
    ///
    /// A later attempt that reserved the same id after a stop keeps its
    /// reservation.
    pub fn abandon_start(&self, id: &str, key: u64) {
        self.lock().take_starting(id, key);
    }

    /// Move the integration started by attempt `start_key` into the running set
    ///
    /// Returns the run's key, or `None` if that attempt was stopped meanwhile.
    pub fn promote(
        &self,
        start_key: u64,
        integration: InstalledIntegration,
        connection: Connection,
        tools: Vec<ToolDefinition>,
    ) -> Option<u64> {
        let mut state = self.lock();
        let token = state.take_starting(&integration.id, start_key)?;

        let key = state.next_key();
        state.running.insert(
            integration.id.clone(),
            ActiveServer {
                integration,
                key,
                connection,
                tools,
                token,
            },
        );
        Some(key)
    }

    /// Remove a running integration if it is still the run identified by `key`
    pub fn remove_run(&self, id: &str, key: u64) -> bool {
        let mut state = self.lock();
        match state.running.get(id) {
            Some(server) if server.key == key => {
                state.running.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Cancel and remove `id`, whether starting or running
    ///
    /// Returns whether a running instance was removed. Stopping an id that is
    /// neither starting nor running does nothing.
    pub fn stop(&self, id: &str) -> bool {
        let mut state = self.lock();
        if let Some(starting) = state.starting.remove(id) {
            starting.token.cancel();
        }
        match state.running.remove(id) {
            Some(server) => {
                server.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel and remove everything
    pub fn stop_all(&self) {
        let mut state = self.lock();
        for (_, starting) in state.starting.drain() {
            starting.token.cancel();
        }
        for (_, server) in state.running.drain() {
            server.token.cancel();
        }
    }

    /// Running integrations in the order they reached the running state
    pub fn snapshot(&self) -> Vec<ActiveServer> {
        let mut servers: Vec<ActiveServer> = self.lock().running.values().cloned().collect();
        servers.sort_by_key(|server| server.key);
        servers
    }

    pub fn get(&self, id: &str) -> Option<ActiveServer> {
        self.lock().running.get(id).cloned()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.lock().running.contains_key(id)
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .map(|server| server.integration.id)
            .collect()
    }

    pub fn starting_count(&self) -> usize {
        self.lock().starting.len()
    }

    pub fn running_count(&self) -> usize {
        self.lock().running.len()
    }
}
