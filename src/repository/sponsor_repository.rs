use super::database::{SharedConnection, lock};
use alloy_primitives::Address;
use anyhow::Result;
use chrono::Utc;
use rusqlite::{OptionalExtension, params};

/// Signing keys of paymasters, keyed by paymaster address.
#[derive(Clone)]
pub struct SponsorRepository {
    conn: SharedConnection,
}

impl SponsorRepository {
    const UPSERT_SPONSOR: &'static str =
        "INSERT OR REPLACE INTO sponsors (paymaster, private_key, created_at) VALUES (?1, ?2, ?3)";

    const GET_SPONSOR: &'static str = "SELECT private_key FROM sponsors WHERE paymaster = ?1";

    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    pub fn add_sponsor(&self, paymaster: &Address, private_key: &str) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            Self::UPSERT_SPONSOR,
            params![format!("{paymaster:?}"), private_key, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn get_sponsor(&self, paymaster: &Address) -> Result<Option<String>> {
        let conn = lock(&self.conn)?;
        let key: Option<String> = conn
            .query_row(
                Self::GET_SPONSOR,
                params![format!("{paymaster:?}")],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }
}
