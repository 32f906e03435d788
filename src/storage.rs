//! Durable local storage.
//!
//! The credential is the only state that survives a restart. It lives in a
//! small SQLite settings table under a single well-known key; removing that
//! key is the canonical "logged out" state.

use crate::error::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

const TOKEN_KEY: &str = "auth_token";

pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("linkup.db"))?;
        Self::with_connection(conn)
    }

    /// Non-durable store, used when the embedder opts out of persistence.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn save_token(&self, token: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![TOKEN_KEY, token],
        )?;
        Ok(())
    }

    pub fn load_token(&self) -> Option<String> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![TOKEN_KEY],
            |row| row.get(0),
        )
        .ok()
    }

    pub fn clear_token(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM settings WHERE key = ?1", params![TOKEN_KEY])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips() {
        let store = CredentialStore::in_memory().unwrap();
        assert!(store.load_token().is_none());

        store.save_token("abc").unwrap();
        assert_eq!(store.load_token().as_deref(), Some("abc"));

        store.save_token("def").unwrap();
        assert_eq!(store.load_token().as_deref(), Some("def"));

        store.clear_token().unwrap();
        assert!(store.load_token().is_none());
    }

    #[test]
    fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CredentialStore::open(dir.path()).unwrap();
            store.save_token("persisted").unwrap();
        }
        let store = CredentialStore::open(dir.path()).unwrap();
        assert_eq!(store.load_token().as_deref(), Some("persisted"));
    }
}
