use super::database::{SharedConnection, lock};
use super::event_repository::timestamp;
use super::models::{Transfer, TransferStatus, from_to_key};
use alloy_primitives::{Address, B256, U256};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, ToSql, params, params_from_iter};
use std::str::FromStr;

/// Handle on the transfer table of a single contract.
#[derive(Clone)]
pub struct TransferRepository {
    conn: SharedConnection,
    table: String,
}

impl TransferRepository {
    const COLUMNS: &'static str = "hash, tx_hash, token_id, created_at, from_address, to_address, \
         from_to, nonce, value, data, status";

    pub(crate) fn new(conn: SharedConnection, contract: &Address) -> Self {
        let table = format!("transfers_{}", hex_suffix(contract));
        Self { conn, table }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub(crate) fn create_table(&self) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    hash TEXT PRIMARY KEY,
                    tx_hash TEXT NOT NULL DEFAULT '',
                    token_id TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    from_address TEXT NOT NULL,
                    to_address TEXT NOT NULL,
                    from_to TEXT NOT NULL,
                    nonce TEXT NOT NULL,
                    value TEXT NOT NULL,
                    data TEXT,
                    status TEXT NOT NULL
                )",
                t = self.table
            ),
            [],
        )?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{t}_from_to ON {t}(from_to)",
                t = self.table
            ),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{t}_tx_hash ON {t}(tx_hash)",
                t = self.table
            ),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{t}_status_created ON {t}(status, created_at)",
                t = self.table
            ),
            [],
        )?;

        Ok(())
    }

    fn insert_sql(&self) -> String {
        format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            self.table,
            Self::COLUMNS
        )
    }

    fn select_sql(&self) -> String {
        format!("SELECT {} FROM {}", Self::COLUMNS, self.table)
    }

    pub fn add_transfer(&self, transfer: &Transfer) -> Result<bool> {
        let conn = lock(&self.conn)?;
        let params = transfer_params(transfer)?;
        let inserted = conn.execute(&self.insert_sql(), params_from_iter(params))?;
        Ok(inserted > 0)
    }

    /// Insert-or-ignore keyed by hash, in one transaction.
    pub fn add_transfers(&self, transfers: &[Transfer]) -> Result<usize> {
        let conn = lock(&self.conn)?;
        let tx = conn.unchecked_transaction()?;
        let mut count = 0;

        {
            let mut stmt = tx.prepare(&self.insert_sql())?;
            for transfer in transfers {
                count += stmt.execute(params_from_iter(transfer_params(transfer)?))?;
            }
        }

        tx.commit()?;
        Ok(count)
    }

    pub fn transfer_exists(&self, hash: &B256) -> Result<bool> {
        let conn = lock(&self.conn)?;
        let exists: Option<i64> = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE hash = ?1", self.table),
                params![format!("{hash:?}")],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Whether the scanner already recorded logs of `tx_hash`.
    pub fn tx_indexed(&self, tx_hash: &B256) -> Result<bool> {
        let conn = lock(&self.conn)?;
        let exists: Option<i64> = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE tx_hash = ?1 AND status = 'success' LIMIT 1",
                    self.table
                ),
                params![format!("{tx_hash:?}")],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Hash of a row already carrying this confirmed transfer, if any.
    ///
    /// A row with the same hash wins, then rows still waiting for their log,
    /// so equal transfers inside one transaction each confirm their own row.
    pub fn find_confirmed(&self, transfer: &Transfer) -> Result<Option<B256>> {
        let Some(tx_hash) = transfer.tx_hash else {
            return Ok(None);
        };

        let conn = lock(&self.conn)?;
        let query = format!(
            "SELECT hash FROM {}
             WHERE tx_hash = ?1 AND from_to = ?2 AND value = ?3 AND token_id = ?4
             ORDER BY hash = ?5 DESC, status = 'success', created_at LIMIT 1",
            self.table
        );
        let hash: Option<String> = conn
            .query_row(
                &query,
                params![
                    format!("{tx_hash:?}"),
                    transfer.from_to(),
                    transfer.value.to_string(),
                    transfer.token_id.to_string(),
                    format!("{:?}", transfer.hash)
                ],
                |row| row.get(0),
            )
            .optional()?;

        hash.map(|h| parse_b256(&h)).transpose()
    }

    /// Oldest optimistic row (no tx hash yet, `sending` or `pending`) with the
    /// same endpoints and value.
    pub fn find_similar_optimistic(
        &self,
        from: &Address,
        to: &Address,
        value: &U256,
    ) -> Result<Option<Transfer>> {
        let conn = lock(&self.conn)?;
        let query = format!(
            "{} WHERE from_to = ?1 AND value = ?2 AND tx_hash = '' AND status IN ('sending', 'pending')
             ORDER BY created_at LIMIT 1",
            self.select_sql()
        );
        let transfer = conn
            .query_row(
                &query,
                params![from_to_key(from, to), value.to_string()],
                Self::row_to_transfer,
            )
            .optional()?;
        Ok(transfer)
    }

    pub fn get_transfer(&self, hash: &B256) -> Result<Option<Transfer>> {
        let conn = lock(&self.conn)?;
        let query = format!("{} WHERE hash = ?1", self.select_sql());
        let transfer = conn
            .query_row(&query, params![format!("{hash:?}")], Self::row_to_transfer)
            .optional()?;
        Ok(transfer)
    }

    /// Updates the status unless the row already reached `success`.
    pub fn set_status(&self, hash: &B256, status: TransferStatus) -> Result<bool> {
        let conn = lock(&self.conn)?;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET status = ?1 WHERE hash = ?2 AND status != 'success'",
                self.table
            ),
            params![status.as_str(), format!("{hash:?}")],
        )?;
        Ok(updated > 0)
    }

    /// Confirms an optimistic row: backfills the tx hash (and the nonce when
    /// one is given) and marks it `success`.
    pub fn reconcile_tx(&self, hash: &B256, tx_hash: &B256, nonce: Option<U256>) -> Result<bool> {
        let conn = lock(&self.conn)?;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET tx_hash = ?1, nonce = COALESCE(?2, nonce), status = 'success'
                 WHERE hash = ?3 AND status != 'success'",
                self.table
            ),
            params![
                format!("{tx_hash:?}"),
                nonce.map(|n| n.to_string()),
                format!("{hash:?}")
            ],
        )?;
        Ok(updated > 0)
    }

    /// Links a row to its transaction without touching its status.
    pub fn set_tx_hash(&self, hash: &B256, tx_hash: &B256, nonce: Option<U256>) -> Result<bool> {
        let conn = lock(&self.conn)?;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET tx_hash = ?1, nonce = COALESCE(?2, nonce)
                 WHERE hash = ?3 AND status != 'success'",
                self.table
            ),
            params![
                format!("{tx_hash:?}"),
                nonce.map(|n| n.to_string()),
                format!("{hash:?}")
            ],
        )?;
        Ok(updated > 0)
    }

    pub fn remove_transfer(&self, hash: &B256) -> Result<bool> {
        let conn = lock(&self.conn)?;
        let removed = conn.execute(
            &format!(
                "DELETE FROM {} WHERE hash = ?1 AND status != 'success'",
                self.table
            ),
            params![format!("{hash:?}")],
        )?;
        Ok(removed > 0)
    }

    /// Rows in `status` created before `cutoff` and not yet linked to a
    /// transaction, oldest first.
    pub fn get_unlinked_before(
        &self,
        status: TransferStatus,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transfer>> {
        let conn = lock(&self.conn)?;
        let query = format!(
            "{} WHERE status = ?1 AND tx_hash = '' AND created_at < ?2 ORDER BY created_at LIMIT ?3",
            self.select_sql()
        );
        let mut stmt = conn.prepare(&query)?;
        let transfers = stmt
            .query_map(
                params![status.as_str(), cutoff.timestamp(), limit as i64],
                Self::row_to_transfer,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(transfers)
    }

    pub fn remove_stale(&self, status: TransferStatus, cutoff: DateTime<Utc>) -> Result<usize> {
        if status == TransferStatus::Success {
            return Ok(0);
        }

        let conn = lock(&self.conn)?;
        let removed = conn.execute(
            &format!(
                "DELETE FROM {} WHERE status = ?1 AND tx_hash = '' AND created_at < ?2",
                self.table
            ),
            params![status.as_str(), cutoff.timestamp()],
        )?;
        Ok(removed)
    }

    /// Drops `pending` rows linked to a transaction that never showed up in
    /// the logs before `cutoff`.
    pub fn remove_stale_linked(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = lock(&self.conn)?;
        let removed = conn.execute(
            &format!(
                "DELETE FROM {} WHERE status = 'pending' AND tx_hash != '' AND created_at < ?1",
                self.table
            ),
            params![cutoff.timestamp()],
        )?;
        Ok(removed)
    }

    pub fn query_transfers(
        &self,
        status: Option<TransferStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transfer>> {
        let mut query = self.select_sql();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = status {
            query.push_str(" WHERE status = ?");
            params.push(Box::new(status.as_str()));
        }

        query.push_str(&format!(
            " ORDER BY created_at DESC LIMIT {limit} OFFSET {offset}"
        ));

        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&query)?;
        let transfers = stmt
            .query_map(params_from_iter(params), Self::row_to_transfer)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(transfers)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = lock(&self.conn)?;
        let count: usize =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
                row.get(0)
            })?;
        Ok(count)
    }

    fn row_to_transfer(row: &Row) -> rusqlite::Result<Transfer> {
        let hash = parse_column(row, 0, |s| B256::from_str(s))?;
        let tx_hash = match row.get::<_, String>(1)?.as_str() {
            "" => None,
            s => Some(B256::from_str(s).map_err(|e| conversion_error(1, e))?),
        };
        let token_id = parse_column(row, 2, |s| U256::from_str(s))?;
        let from_address = parse_column(row, 4, |s| Address::from_str(s))?;
        let to_address = parse_column(row, 5, |s| Address::from_str(s))?;
        let nonce = parse_column(row, 7, |s| U256::from_str(s))?;
        let value = parse_column(row, 8, |s| U256::from_str(s))?;
        let data = row
            .get::<_, Option<String>>(9)?
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| conversion_error(9, e))?;
        let status = TransferStatus::from_str(&row.get::<_, String>(10)?).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, e.into())
        })?;

        Ok(Transfer {
            hash,
            tx_hash,
            token_id,
            created_at: timestamp(row.get(3)?),
            from_address,
            to_address,
            nonce,
            value,
            data,
            status,
        })
    }
}

fn transfer_params(transfer: &Transfer) -> Result<[Box<dyn ToSql>; 11]> {
    let data = transfer
        .data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    Ok([
        Box::new(format!("{:?}", transfer.hash)),
        Box::new(
            transfer
                .tx_hash
                .map(|h| format!("{h:?}"))
                .unwrap_or_default(),
        ),
        Box::new(transfer.token_id.to_string()),
        Box::new(transfer.created_at.timestamp()),
        Box::new(format!("{:?}", transfer.from_address)),
        Box::new(format!("{:?}", transfer.to_address)),
        Box::new(transfer.from_to()),
        Box::new(transfer.nonce.to_string()),
        Box::new(transfer.value.to_string()),
        Box::new(data),
        Box::new(transfer.status.as_str()),
    ])
}

fn hex_suffix(contract: &Address) -> String {
    let hex = format!("{contract:?}");
    hex.trim_start_matches("0x").to_string()
}

fn parse_b256(s: &str) -> Result<B256> {
    B256::from_str(s).map_err(|e| anyhow::anyhow!("Invalid hash in database {}: {}", s, e))
}

fn parse_column<T, E, F>(row: &Row, idx: usize, parse: F) -> rusqlite::Result<T>
where
    F: FnOnce(&str) -> Result<T, E>,
    E: std::error::Error + Send + Sync + 'static,
{
    let raw = row.get::<_, String>(idx)?;
    parse(&raw).map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}
