use super::database::{SharedConnection, lock};
use super::models::{Event, EventState, TokenStandard};
use alloy_primitives::Address;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use std::str::FromStr;

#[derive(Clone)]
pub struct EventRepository {
    conn: SharedConnection,
}

impl EventRepository {
    const INSERT_EVENT: &'static str = "INSERT OR IGNORE INTO events (
            contract, standard, state, created_at, updated_at,
            start_block, last_block, name, symbol, decimals
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

    const SET_STATE: &'static str =
        "UPDATE events SET state = ?1, updated_at = ?2 WHERE contract = ?3 AND standard = ?4";

    // MAX keeps the watermark monotonic even if a stale scanner writes late.
    const SET_LAST_BLOCK: &'static str = "UPDATE events
        SET last_block = MAX(last_block, ?1), updated_at = ?2
        WHERE contract = ?3 AND standard = ?4";

    const SELECT_EVENT: &'static str = "SELECT contract, standard, state, created_at, updated_at,
        start_block, last_block, name, symbol, decimals FROM events";

    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    pub fn add_event(&self, event: &Event) -> Result<bool> {
        let conn = lock(&self.conn)?;
        let inserted = conn.execute(
            Self::INSERT_EVENT,
            params![
                format!("{:?}", event.contract),
                event.standard.as_str(),
                event.state.as_str(),
                event.created_at.timestamp(),
                event.updated_at.timestamp(),
                event.start_block,
                event.last_block,
                event.name,
                event.symbol,
                event.decimals,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_event(&self, contract: &Address, standard: TokenStandard) -> Result<Option<Event>> {
        let conn = lock(&self.conn)?;
        let query = format!("{} WHERE contract = ?1 AND standard = ?2", Self::SELECT_EVENT);
        let event = conn
            .query_row(
                &query,
                params![format!("{contract:?}"), standard.as_str()],
                Self::row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    pub fn get_events(&self) -> Result<Vec<Event>> {
        let conn = lock(&self.conn)?;
        let query = format!("{} ORDER BY created_at", Self::SELECT_EVENT);
        let mut stmt = conn.prepare(&query)?;
        let events = stmt
            .query_map([], Self::row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Events whose watermark is behind `current_block`.
    pub fn get_outdated_events(&self, current_block: u64) -> Result<Vec<Event>> {
        let conn = lock(&self.conn)?;
        let query = format!(
            "{} WHERE last_block < ?1 ORDER BY created_at",
            Self::SELECT_EVENT
        );
        let mut stmt = conn.prepare(&query)?;
        let events = stmt
            .query_map(params![current_block], Self::row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Moves `event` to `to`, rejecting transitions the state machine forbids.
    pub fn set_event_state(&self, event: &mut Event, to: EventState) -> Result<()> {
        let next = event.state.transition(to)?;
        let now = Utc::now();

        let conn = lock(&self.conn)?;
        conn.execute(
            Self::SET_STATE,
            params![
                next.as_str(),
                now.timestamp(),
                format!("{:?}", event.contract),
                event.standard.as_str()
            ],
        )?;

        event.state = next;
        event.updated_at = now;
        Ok(())
    }

    pub fn set_event_last_block(&self, event: &mut Event, block_number: u64) -> Result<()> {
        let now = Utc::now();

        let conn = lock(&self.conn)?;
        conn.execute(
            Self::SET_LAST_BLOCK,
            params![
                block_number,
                now.timestamp(),
                format!("{:?}", event.contract),
                event.standard.as_str()
            ],
        )?;

        event.last_block = event.last_block.max(block_number);
        event.updated_at = now;
        Ok(())
    }

    fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
        let contract = Address::from_str(&row.get::<_, String>(0)?).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let standard = TokenStandard::from_str(&row.get::<_, String>(1)?).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let state = EventState::from_str(&row.get::<_, String>(2)?).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?;

        Ok(Event {
            contract,
            standard,
            state,
            created_at: timestamp(row.get(3)?),
            updated_at: timestamp(row.get(4)?),
            start_block: row.get(5)?,
            last_block: row.get(6)?,
            name: row.get(7)?,
            symbol: row.get(8)?,
            decimals: row.get(9)?,
        })
    }
}

pub(crate) fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Database;

    fn event(contract: Address, last_block: u64) -> Event {
        Event {
            contract,
            standard: TokenStandard::Erc20,
            state: EventState::Queued,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            start_block: 1,
            last_block,
            name: Some("Token".to_string()),
            symbol: Some("TKN".to_string()),
            decimals: Some(6),
        }
    }

    #[test]
    fn add_event_is_unique_per_contract_and_standard() {
        let db = Database::in_memory().unwrap();
        let repo = db.events();
        let contract = Address::repeat_byte(1);

        assert!(repo.add_event(&event(contract, 10)).unwrap());
        assert!(!repo.add_event(&event(contract, 99)).unwrap());

        let mut erc1155 = event(contract, 10);
        erc1155.standard = TokenStandard::Erc1155;
        assert!(repo.add_event(&erc1155).unwrap());

        assert_eq!(repo.get_events().unwrap().len(), 2);
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let db = Database::in_memory().unwrap();
        let repo = db.events();
        let contract = Address::repeat_byte(2);
        let mut ev = event(contract, 100);
        repo.add_event(&ev).unwrap();

        repo.set_event_last_block(&mut ev, 50).unwrap();
        let stored = repo.get_event(&contract, TokenStandard::Erc20).unwrap().unwrap();
        assert_eq!(stored.last_block, 100);
        assert_eq!(ev.last_block, 100);

        repo.set_event_last_block(&mut ev, 150).unwrap();
        let stored = repo.get_event(&contract, TokenStandard::Erc20).unwrap().unwrap();
        assert_eq!(stored.last_block, 150);
    }

    #[test]
    fn outdated_events_and_state_transitions() {
        let db = Database::in_memory().unwrap();
        let repo = db.events();
        let mut behind = event(Address::repeat_byte(3), 10);
        let current = event(Address::repeat_byte(4), 500);
        repo.add_event(&behind).unwrap();
        repo.add_event(&current).unwrap();

        let outdated = repo.get_outdated_events(100).unwrap();
        assert_eq!(outdated.len(), 1);
        assert_eq!(outdated[0].contract, behind.contract);

        repo.set_event_state(&mut behind, EventState::Indexing).unwrap();
        assert!(repo.set_event_state(&mut behind, EventState::Queued).is_err());
        let stored = repo
            .get_event(&behind.contract, TokenStandard::Erc20)
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, EventState::Indexing);
    }
}
