//! SQLite-backed identity store and search result cache.
//!
//! The database is the working store for canonical entities, their aliases
//! (with an FTS5 index for fuzzy lookup), person↔org affiliations, and the
//! persistent web-search cache with its quota and backoff bookkeeping.
//! Opened in WAL mode with foreign keys enforced; schema managed by the
//! embedded migration framework.

use std::path::PathBuf;

use rusqlite::Connection;

pub mod types;
pub use types::*;

mod affiliations;
mod entities;
mod search_cache;

pub use entities::fts_escape;

pub struct EntityDb {
    conn: Connection,
}

impl EntityDb {
    /// Open (or create) the database at `~/.grounder/grounder.db` and apply
    /// the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path. Useful for testing and for
    /// embedding applications that manage their own data directory.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL for concurrent readers alongside the single writer.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn })
    }

    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Resolve the default database path: `~/.grounder/grounder.db`.
    fn db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".grounder").join("grounder.db"))
    }
}
