//! Durable per-engine runtime configuration, backed by SQLite.
//!
//! The registry is the single source of truth for which engines the system
//! knows about. `EngineConfig` is an immutable value; every mutation goes
//! through one serialized update path that writes a whole new row.

use crate::{HangarError, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// What should run and how. Created on successful install, deleted on
/// removal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    pub id: String,
    pub version: String,
    pub install_path: PathBuf,
    /// Absolute path of the executable to spawn.
    pub executable: PathBuf,
    /// Argument template; `{port}` and `{install_dir}` substituted at spawn.
    pub args: Vec<String>,
    pub port: u16,
    pub health_url: Option<String>,
    pub start_on_launch: bool,
    pub auto_restart: bool,
}

impl EngineConfig {
    /// New value with a different port. Mutations build a new config and go
    /// through [`EngineRegistry::update`].
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    pub fn with_flags(&self, start_on_launch: bool, auto_restart: bool) -> Self {
        Self {
            start_on_launch,
            auto_restart,
            ..self.clone()
        }
    }
}

pub struct EngineRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl EngineRegistry {
    /// Open (creating if needed) the registry database.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HangarError::io_with_path(e, parent))?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS engines (
                id TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                install_path TEXT NOT NULL,
                executable TEXT NOT NULL,
                args TEXT NOT NULL DEFAULT '[]',
                port INTEGER NOT NULL,
                health_url TEXT,
                start_on_launch INTEGER NOT NULL DEFAULT 0,
                auto_restart INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        info!("Engine registry opened at {}", db_path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory registry for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS engines (
                id TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                install_path TEXT NOT NULL,
                executable TEXT NOT NULL,
                args TEXT NOT NULL DEFAULT '[]',
                port INTEGER NOT NULL,
                health_url TEXT,
                start_on_launch INTEGER NOT NULL DEFAULT 0,
                auto_restart INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace the whole row for an engine.
    pub fn register(&self, config: &EngineConfig) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let args_json = serde_json::to_string(&config.args)?;

        conn.execute(
            "INSERT OR REPLACE INTO engines
                (id, version, install_path, executable, args, port, health_url,
                 start_on_launch, auto_restart, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'))",
            params![
                config.id,
                config.version,
                config.install_path.to_string_lossy(),
                config.executable.to_string_lossy(),
                args_json,
                config.port,
                config.health_url,
                config.start_on_launch as i64,
                config.auto_restart as i64,
            ],
        )?;

        debug!("Registered engine {}", config.id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<EngineConfig>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, version, install_path, executable, args, port, health_url,
                    start_on_launch, auto_restart
             FROM engines WHERE id = ?1",
            params![id],
            row_to_config,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list(&self) -> Result<Vec<EngineConfig>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, version, install_path, executable, args, port, health_url,
                    start_on_launch, auto_restart
             FROM engines ORDER BY id",
        )?;

        let configs = stmt
            .query_map([], row_to_config)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(configs)
    }

    /// The one serialized mutation path: read the current row, apply `f`,
    /// write the full new row back while still holding the connection lock.
    pub fn update(
        &self,
        id: &str,
        f: impl FnOnce(EngineConfig) -> EngineConfig,
    ) -> Result<EngineConfig> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());

        let current = conn
            .query_row(
                "SELECT id, version, install_path, executable, args, port, health_url,
                        start_on_launch, auto_restart
                 FROM engines WHERE id = ?1",
                params![id],
                row_to_config,
            )
            .optional()?
            .ok_or_else(|| HangarError::EngineNotFound { id: id.to_string() })?;

        let updated = f(current);
        let args_json = serde_json::to_string(&updated.args)?;

        conn.execute(
            "INSERT OR REPLACE INTO engines
                (id, version, install_path, executable, args, port, health_url,
                 start_on_launch, auto_restart, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'))",
            params![
                updated.id,
                updated.version,
                updated.install_path.to_string_lossy(),
                updated.executable.to_string_lossy(),
                args_json,
                updated.port,
                updated.health_url,
                updated.start_on_launch as i64,
                updated.auto_restart as i64,
            ],
        )?;

        Ok(updated)
    }

    /// Returns `true` when a row was actually removed.
    pub fn unregister(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let affected = conn.execute("DELETE FROM engines WHERE id = ?1", params![id])?;
        if affected > 0 {
            debug!("Unregistered engine {}", id);
        }
        Ok(affected > 0)
    }
}

fn row_to_config(row: &Row) -> rusqlite::Result<EngineConfig> {
    let args_json: String = row.get(4)?;
    let args: Vec<String> = serde_json::from_str(&args_json).unwrap_or_default();
    let install_path: String = row.get(2)?;
    let executable: String = row.get(3)?;

    Ok(EngineConfig {
        id: row.get(0)?,
        version: row.get(1)?,
        install_path: PathBuf::from(install_path),
        executable: PathBuf::from(executable),
        args,
        port: row.get::<_, i64>(5)? as u16,
        health_url: row.get(6)?,
        start_on_launch: row.get::<_, i64>(7)? != 0,
        auto_restart: row.get::<_, i64>(8)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_config() -> EngineConfig {
        EngineConfig {
            id: "ollama".into(),
            version: "0.5.0".into(),
            install_path: PathBuf::from("/opt/hangar/engines/ollama"),
            executable: PathBuf::from("/opt/hangar/engines/ollama/bin/ollama"),
            args: vec!["serve".into(), "--port".into(), "{port}".into()],
            port: 11434,
            health_url: Some("http://127.0.0.1:11434/api/version".into()),
            start_on_launch: true,
            auto_restart: true,
        }
    }

    #[test]
    fn test_register_get_round_trip() {
        let registry = EngineRegistry::open_in_memory().unwrap();
        let config = sample_config();

        registry.register(&config).unwrap();
        let loaded = registry.get("ollama").unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_get_missing_is_none() {
        let registry = EngineRegistry::open_in_memory().unwrap();
        assert!(registry.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_update_writes_full_new_row() {
        let registry = EngineRegistry::open_in_memory().unwrap();
        registry.register(&sample_config()).unwrap();

        let updated = registry
            .update("ollama", |c| c.with_port(12000))
            .unwrap();
        assert_eq!(updated.port, 12000);

        let loaded = registry.get("ollama").unwrap().unwrap();
        assert_eq!(loaded.port, 12000);
        // Everything else carried over
        assert_eq!(loaded.version, "0.5.0");
        assert!(loaded.auto_restart);
    }

    #[test]
    fn test_update_missing_engine() {
        let registry = EngineRegistry::open_in_memory().unwrap();
        let err = registry.update("nope", |c| c).unwrap_err();
        assert!(matches!(err, HangarError::EngineNotFound { .. }));
    }

    #[test]
    fn test_unregister() {
        let registry = EngineRegistry::open_in_memory().unwrap();
        registry.register(&sample_config()).unwrap();

        assert!(registry.unregister("ollama").unwrap());
        assert!(registry.get("ollama").unwrap().is_none());
        assert!(!registry.unregister("ollama").unwrap());
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("registry.db");

        {
            let registry = EngineRegistry::open(&db_path).unwrap();
            registry.register(&sample_config()).unwrap();
        }

        let registry = EngineRegistry::open(&db_path).unwrap();
        assert_eq!(registry.list().unwrap().len(), 1);
    }
}
