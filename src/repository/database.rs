use alloy_primitives::Address;
use anyhow::{Context, Result};
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::event_repository::EventRepository;
use super::sponsor_repository::SponsorRepository;
use super::transfer_repository::TransferRepository;

pub type SharedConnection = Arc<Mutex<Connection>>;

pub(crate) fn lock(conn: &SharedConnection) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| anyhow::anyhow!("Database connection mutex poisoned"))
}

/// SQLite handle plus the registry of per-contract transfer tables.
#[derive(Clone)]
pub struct Database {
    pub conn: SharedConnection,
    transfer_tables: Arc<Mutex<HashMap<Address, TransferRepository>>>,
}

impl Database {
    pub fn new(db_path: &str) -> Result<Self> {
        let db_path = db_path.strip_prefix("sqlite:").unwrap_or(db_path);
        let conn = Connection::open(db_path).context("Failed to open database")?;

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
            transfer_tables: Arc::new(Mutex::new(HashMap::new())),
        };
        db.create_tables()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn create_tables(&self) -> Result<()> {
        let conn = lock(&self.conn)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                contract TEXT NOT NULL,
                standard TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                start_block INTEGER NOT NULL,
                last_block INTEGER NOT NULL,
                name TEXT,
                symbol TEXT,
                decimals INTEGER,
                PRIMARY KEY (contract, standard)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sponsors (
                paymaster TEXT PRIMARY KEY,
                private_key TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    pub fn events(&self) -> EventRepository {
        EventRepository::new(self.conn.clone())
    }

    pub fn sponsors(&self) -> SponsorRepository {
        SponsorRepository::new(self.conn.clone())
    }

    /// Transfer handle for `contract`, creating its table on first use.
    pub fn transfers(&self, contract: &Address) -> Result<TransferRepository> {
        let mut tables = self
            .transfer_tables
            .lock()
            .map_err(|_| anyhow::anyhow!("Transfer table registry mutex poisoned"))?;

        if let Some(repo) = tables.get(contract) {
            return Ok(repo.clone());
        }

        let repo = TransferRepository::new(self.conn.clone(), contract);
        repo.create_table()
            .with_context(|| format!("Failed to create transfer table for {contract:?}"))?;
        tables.insert(*contract, repo.clone());
        Ok(repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_handles_are_cached_per_contract() {
        let db = Database::in_memory().unwrap();
        let contract = Address::repeat_byte(0x11);

        let first = db.transfers(&contract).unwrap();
        let second = db.transfers(&contract).unwrap();
        assert_eq!(first.table(), second.table());

        let other = db.transfers(&Address::repeat_byte(0x22)).unwrap();
        assert_ne!(first.table(), other.table());
    }
}
