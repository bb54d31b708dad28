//! Durable storage for the server registry and the tool catalog
//!
//! Two repository traits, [`ServerRepository`] and [`ToolRepository`], with
//! two adapters:
//!
//! - [`MemoryStore`] keeps everything in process memory.
//! - [`SqliteStore`] persists to a SQLite file. Tools reference their server
//!   with `ON DELETE CASCADE`, so removing a server always removes its tools.
//!
//! Tool writes are upserts keyed by `(source_server_id, original_name)`. An
//! upsert keeps the stored `id`, `discovered_at` and classification so that
//! re-discovery never erases what the classifier merged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::RwLock;

use crate::aggregator::models::{AggregatedTool, ExternalServer, ToolClassification};
use crate::error::{AggregatorError, Result};

/// Persistence for [`ExternalServer`] records.
#[async_trait::async_trait]
pub trait ServerRepository: Send + Sync {
    /// Insert a new record. Fails with `DuplicateServer` if the name exists.
    async fn insert_server(&self, server: &ExternalServer) -> Result<()>;
    /// Replace an existing record. Fails with `ServerNotFound` if absent.
    async fn update_server(&self, server: &ExternalServer) -> Result<()>;
    async fn get_server(&self, id: &str) -> Result<Option<ExternalServer>>;
    async fn find_server_by_name(&self, name: &str) -> Result<Option<ExternalServer>>;
    /// All records, ordered by registration time.
    async fn list_servers(&self) -> Result<Vec<ExternalServer>>;
    /// Delete a record and, with it, its tools. Returns whether it existed.
    async fn delete_server(&self, id: &str) -> Result<bool>;
}

/// Persistence for the aggregated tool catalog.
#[async_trait::async_trait]
pub trait ToolRepository: Send + Sync {
    /// Insert or update keyed by `(source_server_id, original_name)` and
    /// return the stored row.
    async fn upsert_tool(&self, tool: &AggregatedTool) -> Result<AggregatedTool>;
    async fn list_tools(&self) -> Result<Vec<AggregatedTool>>;
    async fn list_server_tools(&self, server_id: &str) -> Result<Vec<AggregatedTool>>;
    async fn get_tool(&self, tool_id: &str) -> Result<Option<AggregatedTool>>;
    async fn find_tools_by_original_name(&self, name: &str) -> Result<Vec<AggregatedTool>>;
    async fn find_server_tool(
        &self,
        server_id: &str,
        original_name: &str,
    ) -> Result<Option<AggregatedTool>>;
    /// Set the classification and `is_classified`. Returns `false` when the
    /// tool no longer exists.
    async fn merge_classification(
        &self,
        tool_id: &str,
        classification: &ToolClassification,
    ) -> Result<bool>;
    async fn delete_tool(&self, tool_id: &str) -> Result<bool>;
    /// Delete every tool of `server_id` and return how many were removed.
    async fn delete_server_tools(&self, server_id: &str) -> Result<usize>;
}

/// Both repositories behind one handle.
pub trait Store: ServerRepository + ToolRepository {}

impl<T: ServerRepository + ToolRepository> Store for T {}

#[derive(Debug, Default)]
struct MemoryState {
    servers: HashMap<String, ExternalServer>,
    tools: HashMap<String, AggregatedTool>,
}

/// In-process store.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn merge_upsert(existing: Option<&AggregatedTool>, incoming: &AggregatedTool) -> AggregatedTool {
    match existing {
        Some(stored) => AggregatedTool {
            id: stored.id.clone(),
            discovered_at: stored.discovered_at,
            is_classified: stored.is_classified,
            classification: stored.classification.clone(),
            ..incoming.clone()
        },
        None => incoming.clone(),
    }
}

#[async_trait::async_trait]
impl ServerRepository for MemoryStore {
    async fn insert_server(&self, server: &ExternalServer) -> Result<()> {
        let mut state = self.state.write().await;
        if state.servers.values().any(|s| s.name == server.name) {
            return Err(AggregatorError::DuplicateServer(server.name.clone()).into());
        }
        state.servers.insert(server.id.clone(), server.clone());
        Ok(())
    }

    async fn update_server(&self, server: &ExternalServer) -> Result<()> {
        let mut state = self.state.write().await;
        match state.servers.get_mut(&server.id) {
            Some(slot) => {
                *slot = server.clone();
                Ok(())
            }
            None => Err(AggregatorError::ServerNotFound(server.id.clone()).into()),
        }
    }

    async fn get_server(&self, id: &str) -> Result<Option<ExternalServer>> {
        Ok(self.state.read().await.servers.get(id).cloned())
    }

    async fn find_server_by_name(&self, name: &str) -> Result<Option<ExternalServer>> {
        Ok(self
            .state
            .read()
            .await
            .servers
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn list_servers(&self) -> Result<Vec<ExternalServer>> {
        let mut servers: Vec<_> = self.state.read().await.servers.values().cloned().collect();
        servers.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(servers)
    }

    async fn delete_server(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let existed = state.servers.remove(id).is_some();
        state.tools.retain(|_, t| t.source_server_id != id);
        Ok(existed)
    }
}

#[async_trait::async_trait]
impl ToolRepository for MemoryStore {
    async fn upsert_tool(&self, tool: &AggregatedTool) -> Result<AggregatedTool> {
        let mut state = self.state.write().await;
        if !state.servers.contains_key(&tool.source_server_id) {
            return Err(AggregatorError::ServerNotFound(tool.source_server_id.clone()).into());
        }
        let existing = state
            .tools
            .values()
            .find(|t| {
                t.source_server_id == tool.source_server_id && t.original_name == tool.original_name
            })
            .cloned();
        let stored = merge_upsert(existing.as_ref(), tool);
        state.tools.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn list_tools(&self) -> Result<Vec<AggregatedTool>> {
        let mut tools: Vec<_> = self.state.read().await.tools.values().cloned().collect();
        tools.sort_by(|a, b| a.namespaced_name.cmp(&b.namespaced_name));
        Ok(tools)
    }

    async fn list_server_tools(&self, server_id: &str) -> Result<Vec<AggregatedTool>> {
        let mut tools: Vec<_> = self
            .state
            .read()
            .await
            .tools
            .values()
            .filter(|t| t.source_server_id == server_id)
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.original_name.cmp(&b.original_name));
        Ok(tools)
    }

    async fn get_tool(&self, tool_id: &str) -> Result<Option<AggregatedTool>> {
        Ok(self.state.read().await.tools.get(tool_id).cloned())
    }

    async fn find_tools_by_original_name(&self, name: &str) -> Result<Vec<AggregatedTool>> {
        let mut tools: Vec<_> = self
            .state
            .read()
            .await
            .tools
            .values()
            .filter(|t| t.original_name == name)
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.namespaced_name.cmp(&b.namespaced_name));
        Ok(tools)
    }

    async fn find_server_tool(
        &self,
        server_id: &str,
        original_name: &str,
    ) -> Result<Option<AggregatedTool>> {
        Ok(self
            .state
            .read()
            .await
            .tools
            .values()
            .find(|t| t.source_server_id == server_id && t.original_name == original_name)
            .cloned())
    }

    async fn merge_classification(
        &self,
        tool_id: &str,
        classification: &ToolClassification,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.tools.get_mut(tool_id) {
            Some(tool) => {
                tool.classification = Some(classification.clone());
                tool.is_classified = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_tool(&self, tool_id: &str) -> Result<bool> {
        Ok(self.state.write().await.tools.remove(tool_id).is_some())
    }

    async fn delete_server_tools(&self, server_id: &str) -> Result<usize> {
        let mut state = self.state.write().await;
        let before = state.tools.len();
        state.tools.retain(|_, t| t.source_server_id != server_id);
        Ok(before - state.tools.len())
    }
}

/// SQLite-backed store.
///
/// Every operation opens its own connection on a blocking thread, so the
/// store is cheap to clone and never blocks the async runtime.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

const SERVER_COLUMNS: &str = "id, name, transport_kind, connection_config, status, \
     health_check_url, consecutive_failures, tool_count, auto_connect, last_error, \
     registered_at, connected_at, last_health_check";

const TOOL_COLUMNS: &str = "id, source_server_id, server_name, original_name, namespaced_name, \
     description, input_schema, is_classified, classification, discovered_at, updated_at";

fn storage_err(e: anyhow::Error) -> anyhow::Error {
    AggregatorError::Storage(format!("{e:#}")).into()
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`.
    ///
    /// # Examples
    ///
    /// ```
    /// use toolmesh::aggregator::store::SqliteStore;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let store = SqliteStore::open(dir.path().join("toolmesh.db")).unwrap();
    /// ```
    pub fn open<P: Into<PathBuf>>(db_path: P) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create parent directory for database")
                    .map_err(storage_err)?;
            }
        }

        let store = Self { db_path };
        store.init()?;
        Ok(store)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn init(&self) -> Result<()> {
        let conn = open_connection(&self.db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS servers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                transport_kind TEXT NOT NULL,
                connection_config JSON NOT NULL,
                status TEXT NOT NULL,
                health_check_url TEXT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                tool_count INTEGER NOT NULL DEFAULT 0,
                auto_connect INTEGER NOT NULL DEFAULT 1,
                last_error TEXT,
                registered_at TEXT NOT NULL,
                connected_at TEXT,
                last_health_check TEXT
            );
            CREATE TABLE IF NOT EXISTS tools (
                id TEXT PRIMARY KEY,
                source_server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
                server_name TEXT NOT NULL,
                original_name TEXT NOT NULL,
                namespaced_name TEXT NOT NULL UNIQUE,
                description TEXT,
                input_schema JSON NOT NULL,
                is_classified INTEGER NOT NULL DEFAULT 0,
                classification JSON,
                discovered_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (source_server_id, original_name)
            );
            CREATE INDEX IF NOT EXISTS idx_tools_original_name ON tools(original_name);",
        )
        .context("Failed to create tables")
        .map_err(storage_err)?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&path)?;
            op(&mut conn)
        })
        .await
        .context("Storage task panicked")
        .map_err(storage_err)?
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .context("Failed to open database")
        .map_err(storage_err)?;
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
        .context("Failed to configure database")
        .map_err(storage_err)?;
    Ok(conn)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_opt_time(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_time).transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_enum<T: std::str::FromStr<Err = AggregatorError>>(raw: &str) -> rusqlite::Result<T> {
    raw.parse().map_err(|e: AggregatorError| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<ExternalServer> {
    let transport_kind: String = row.get(2)?;
    let config: String = row.get(3)?;
    let status: String = row.get(4)?;
    let registered_at: String = row.get(10)?;
    Ok(ExternalServer {
        id: row.get(0)?,
        name: row.get(1)?,
        transport_kind: parse_enum(&transport_kind)?,
        connection_config: parse_json(&config)?,
        status: parse_enum(&status)?,
        health_check_url: row.get(5)?,
        consecutive_failures: row.get(6)?,
        tool_count: row.get::<_, i64>(7)? as usize,
        auto_connect: row.get(8)?,
        last_error: row.get(9)?,
        registered_at: parse_time(&registered_at)?,
        connected_at: parse_opt_time(row.get(11)?)?,
        last_health_check: parse_opt_time(row.get(12)?)?,
    })
}

fn tool_from_row(row: &Row<'_>) -> rusqlite::Result<AggregatedTool> {
    let schema: String = row.get(6)?;
    let classification: Option<String> = row.get(8)?;
    let discovered_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    Ok(AggregatedTool {
        id: row.get(0)?,
        source_server_id: row.get(1)?,
        server_name: row.get(2)?,
        original_name: row.get(3)?,
        namespaced_name: row.get(4)?,
        description: row.get(5)?,
        input_schema: parse_json(&schema)?,
        is_classified: row.get(7)?,
        classification: classification.as_deref().map(parse_json).transpose()?,
        discovered_at: parse_time(&discovered_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

fn query_tools(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<AggregatedTool>> {
    let sql = format!("SELECT {TOOL_COLUMNS} FROM tools {filter} ORDER BY namespaced_name");
    let mut stmt = conn
        .prepare(&sql)
        .context("Failed to prepare tool query")
        .map_err(storage_err)?;
    let rows = stmt
        .query_map(params, tool_from_row)
        .context("Failed to query tools")
        .map_err(storage_err)?;
    let tools = rows
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read tool rows")
        .map_err(storage_err)?;
    Ok(tools)
}

fn query_tool(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Option<AggregatedTool>> {
    let sql = format!("SELECT {TOOL_COLUMNS} FROM tools {filter}");
    conn.query_row(&sql, params, tool_from_row)
        .optional()
        .context("Failed to query tool")
        .map_err(storage_err)
}

fn query_server(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Option<ExternalServer>> {
    let sql = format!("SELECT {SERVER_COLUMNS} FROM servers {filter}");
    conn.query_row(&sql, params, server_from_row)
        .optional()
        .context("Failed to query server")
        .map_err(storage_err)
}

fn opt_time(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(|t| t.to_rfc3339())
}

#[async_trait::async_trait]
impl ServerRepository for SqliteStore {
    async fn insert_server(&self, server: &ExternalServer) -> Result<()> {
        let s = server.clone();
        self.with_conn(move |conn| {
            let taken = query_server(conn, "WHERE name = ?1", params![s.name])?.is_some();
            if taken {
                return Err(AggregatorError::DuplicateServer(s.name.clone()).into());
            }
            let config = serde_json::to_string(&s.connection_config)?;
            conn.execute(
                &format!(
                    "INSERT INTO servers ({SERVER_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    s.id,
                    s.name,
                    s.transport_kind.as_str(),
                    config,
                    s.status.as_str(),
                    s.health_check_url,
                    s.consecutive_failures,
                    s.tool_count as i64,
                    s.auto_connect,
                    s.last_error,
                    s.registered_at.to_rfc3339(),
                    opt_time(s.connected_at),
                    opt_time(s.last_health_check),
                ],
            )
            .context("Failed to insert server")
            .map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    async fn update_server(&self, server: &ExternalServer) -> Result<()> {
        let s = server.clone();
        self.with_conn(move |conn| {
            let config = serde_json::to_string(&s.connection_config)?;
            let changed = conn
                .execute(
                    "UPDATE servers SET
                        name = ?2, transport_kind = ?3, connection_config = ?4, status = ?5,
                        health_check_url = ?6, consecutive_failures = ?7, tool_count = ?8,
                        auto_connect = ?9, last_error = ?10, registered_at = ?11,
                        connected_at = ?12, last_health_check = ?13
                     WHERE id = ?1",
                    params![
                        s.id,
                        s.name,
                        s.transport_kind.as_str(),
                        config,
                        s.status.as_str(),
                        s.health_check_url,
                        s.consecutive_failures,
                        s.tool_count as i64,
                        s.auto_connect,
                        s.last_error,
                        s.registered_at.to_rfc3339(),
                        opt_time(s.connected_at),
                        opt_time(s.last_health_check),
                    ],
                )
                .context("Failed to update server")
                .map_err(storage_err)?;
            if changed == 0 {
                return Err(AggregatorError::ServerNotFound(s.id.clone()).into());
            }
            Ok(())
        })
        .await
    }

    async fn get_server(&self, id: &str) -> Result<Option<ExternalServer>> {
        let id = id.to_string();
        self.with_conn(move |conn| query_server(conn, "WHERE id = ?1", params![id]))
            .await
    }

    async fn find_server_by_name(&self, name: &str) -> Result<Option<ExternalServer>> {
        let name = name.to_string();
        self.with_conn(move |conn| query_server(conn, "WHERE name = ?1", params![name]))
            .await
    }

    async fn list_servers(&self) -> Result<Vec<ExternalServer>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SERVER_COLUMNS} FROM servers ORDER BY registered_at, name"
                ))
                .context("Failed to prepare server query")
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([], server_from_row)
                .context("Failed to query servers")
                .map_err(storage_err)?;
            let servers = rows
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read server rows")
                .map_err(storage_err)?;
            Ok(servers)
        })
        .await
    }

    async fn delete_server(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn
                .execute("DELETE FROM servers WHERE id = ?1", params![id])
                .context("Failed to delete server")
                .map_err(storage_err)?;
            Ok(deleted > 0)
        })
        .await
    }
}

#[async_trait::async_trait]
impl ToolRepository for SqliteStore {
    async fn upsert_tool(&self, tool: &AggregatedTool) -> Result<AggregatedTool> {
        let t = tool.clone();
        self.with_conn(move |conn| {
            let schema = serde_json::to_string(&t.input_schema)?;
            let tx = conn
                .transaction()
                .context("Failed to start transaction")
                .map_err(storage_err)?;
            tx.execute(
                "INSERT INTO tools (id, source_server_id, server_name, original_name, namespaced_name,
                                    description, input_schema, is_classified, classification,
                                    discovered_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, NULL, ?8, ?9)
                 ON CONFLICT(source_server_id, original_name) DO UPDATE SET
                    server_name = excluded.server_name,
                    namespaced_name = excluded.namespaced_name,
                    description = excluded.description,
                    input_schema = excluded.input_schema,
                    updated_at = excluded.updated_at",
                params![
                    t.id,
                    t.source_server_id,
                    t.server_name,
                    t.original_name,
                    t.namespaced_name,
                    t.description,
                    schema,
                    t.discovered_at.to_rfc3339(),
                    t.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to upsert tool")
            .map_err(storage_err)?;
            let stored = query_tool(
                &tx,
                "WHERE source_server_id = ?1 AND original_name = ?2",
                params![t.source_server_id, t.original_name],
            )?
            .ok_or_else(|| AggregatorError::Storage("upserted tool vanished".into()))?;
            tx.commit()
                .context("Failed to commit transaction")
                .map_err(storage_err)?;
            Ok(stored)
        })
        .await
    }

    async fn list_tools(&self) -> Result<Vec<AggregatedTool>> {
        self.with_conn(|conn| query_tools(conn, "", [])).await
    }

    async fn list_server_tools(&self, server_id: &str) -> Result<Vec<AggregatedTool>> {
        let id = server_id.to_string();
        self.with_conn(move |conn| query_tools(conn, "WHERE source_server_id = ?1", params![id]))
            .await
    }

    async fn get_tool(&self, tool_id: &str) -> Result<Option<AggregatedTool>> {
        let id = tool_id.to_string();
        self.with_conn(move |conn| query_tool(conn, "WHERE id = ?1", params![id]))
            .await
    }

    async fn find_tools_by_original_name(&self, name: &str) -> Result<Vec<AggregatedTool>> {
        let name = name.to_string();
        self.with_conn(move |conn| query_tools(conn, "WHERE original_name = ?1", params![name]))
            .await
    }

    async fn find_server_tool(
        &self,
        server_id: &str,
        original_name: &str,
    ) -> Result<Option<AggregatedTool>> {
        let id = server_id.to_string();
        let name = original_name.to_string();
        self.with_conn(move |conn| {
            query_tool(
                conn,
                "WHERE source_server_id = ?1 AND original_name = ?2",
                params![id, name],
            )
        })
        .await
    }

    async fn merge_classification(
        &self,
        tool_id: &str,
        classification: &ToolClassification,
    ) -> Result<bool> {
        let id = tool_id.to_string();
        let raw = serde_json::to_string(classification)?;
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE tools SET is_classified = 1, classification = ?2 WHERE id = ?1",
                    params![id, raw],
                )
                .context("Failed to merge classification")
                .map_err(storage_err)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn delete_tool(&self, tool_id: &str) -> Result<bool> {
        let id = tool_id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn
                .execute("DELETE FROM tools WHERE id = ?1", params![id])
                .context("Failed to delete tool")
                .map_err(storage_err)?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn delete_server_tools(&self, server_id: &str) -> Result<usize> {
        let id = server_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM tools WHERE source_server_id = ?1", params![id])
                .context("Failed to delete server tools")
                .map_err(storage_err)
        })
        .await
    }
}
