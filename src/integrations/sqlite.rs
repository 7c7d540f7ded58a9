/// SQLite implementation of the integrations repository
///
/// Manifests and environment values are stored as JSON text next to the
/// columns the catalog queries on. Change events are emitted after the
/// database write has been committed.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::integrations::{
    migrations, ChangeCallback, ChangeKind, ChangeNotifier, InstalledIntegration,
    IntegrationsChangedEvent, IntegrationsRepository, RepositoryError, Subscription,
};
use crate::registry::IntegrationManifest;

/// Raw column values of one `integrations` row
struct StoredRow {
    id: String,
    manifest: String,
    env: String,
    installed_at: DateTime<Utc>,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            manifest: row.get(1)?,
            env: row.get(2)?,
            installed_at: row.get(3)?,
        })
    }

    fn decode(self) -> Result<InstalledIntegration, RepositoryError> {
        Ok(InstalledIntegration {
            id: self.id,
            manifest: serde_json::from_str(&self.manifest)?,
            env: serde_json::from_str(&self.env)?,
            installed_at: self.installed_at,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, manifest, env, installed_at FROM integrations";

/// SQLite-backed integration catalog
pub struct SqliteIntegrationsRepository {
    conn: Mutex<Connection>,
    notifier: ChangeNotifier,
}

impl SqliteIntegrationsRepository {
    /// Open (or create) the catalog at `db_path` and migrate its schema
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path)
            .map_err(|e| RepositoryError::Connection(format!("Failed to open database: {}", e)))?;

        let repository = Self::from_connection(conn)?;
        tracing::info!("Integration catalog opened at: {}", db_path.display());
        Ok(repository)
    }

    /// A catalog that lives only as long as this value
    pub fn open_in_memory() -> Result<Self, RepositoryError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RepositoryError::Connection(format!("Failed to open database: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, RepositoryError> {
        migrations::initialize_database(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            notifier: ChangeNotifier::new(),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(conn: &Connection, id: &str) -> Result<Option<InstalledIntegration>, RepositoryError> {
        let sql = format!("{} WHERE id = ?1", SELECT_COLUMNS);
        conn.query_row(&sql, params![id], StoredRow::from_row)
            .optional()?
            .map(StoredRow::decode)
            .transpose()
    }
}

#[async_trait]
impl IntegrationsRepository for SqliteIntegrationsRepository {
    async fn install(
        &self,
        manifest: IntegrationManifest,
        env: BTreeMap<String, String>,
    ) -> Result<InstalledIntegration, RepositoryError> {
        let integration = InstalledIntegration::new(manifest, env);

        {
            let conn = self.conn();
            let installed: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM integrations WHERE name = ?1)",
                params![integration.manifest.name],
                |row| row.get(0),
            )?;
            if installed {
                return Err(RepositoryError::AlreadyInstalled {
                    name: integration.manifest.name.clone(),
                });
            }

            conn.execute(
                "INSERT INTO integrations (id, name, version, manifest, env, installed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    integration.id,
                    integration.manifest.name,
                    integration.manifest.version,
                    serde_json::to_string(&integration.manifest)?,
                    serde_json::to_string(&integration.env)?,
                    integration.installed_at,
                ],
            )?;
        }

        tracing::info!(
            id = %integration.id,
            name = %integration.manifest.name,
            version = %integration.manifest.version,
            "installed integration"
        );
        self.notifier.emit(&IntegrationsChangedEvent {
            kind: ChangeKind::Added,
            integration: integration.clone(),
        });

        Ok(integration)
    }

    async fn list(&self) -> Result<Vec<InstalledIntegration>, RepositoryError> {
        let conn = self.conn();
        let sql = format!("{} ORDER BY installed_at, rowid", SELECT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;

        let rows = stmt
            .query_map([], StoredRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(StoredRow::decode).collect()
    }

    async fn uninstall(&self, id: &str) -> Result<InstalledIntegration, RepositoryError> {
        let integration = {
            let conn = self.conn();
            let integration = Self::find(&conn, id)?.ok_or_else(|| RepositoryError::NotFound {
                id: id.to_string(),
            })?;
            conn.execute("DELETE FROM integrations WHERE id = ?1", params![id])?;
            integration
        };

        tracing::info!(id = %integration.id, name = %integration.manifest.name, "uninstalled integration");
        self.notifier.emit(&IntegrationsChangedEvent {
            kind: ChangeKind::Removed,
            integration: integration.clone(),
        });

        Ok(integration)
    }

    fn subscribe(&self, callback: ChangeCallback) -> Subscription {
        self.notifier.subscribe(callback)
    }
}
