use alloy_primitives::{Address, B256, U256, keccak256};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::{DecodeError, InvalidTransition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TokenStandard {
    Erc20,
    Erc721,
    Erc1155,
}

impl TokenStandard {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStandard::Erc20 => "erc20",
            TokenStandard::Erc721 => "erc721",
            TokenStandard::Erc1155 => "erc1155",
        }
    }
}

impl fmt::Display for TokenStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenStandard {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "erc20" => Ok(TokenStandard::Erc20),
            "erc721" => Ok(TokenStandard::Erc721),
            "erc1155" => Ok(TokenStandard::Erc1155),
            other => Err(DecodeError::UnsupportedStandard(other.to_string())),
        }
    }
}

/// Indexing lifecycle of a tracked contract.
///
/// `Queued -> Indexing -> Indexed`, and back to `Indexing` whenever new
/// blocks appear. `transition` is the only way to move between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Queued,
    Indexing,
    Indexed,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Queued => "queued",
            EventState::Indexing => "indexing",
            EventState::Indexed => "indexed",
        }
    }

    pub fn transition(self, to: EventState) -> Result<EventState, InvalidTransition> {
        use EventState::*;
        match (self, to) {
            // An interrupted scan leaves the row in Indexing; the next cycle re-enters it.
            (Queued, Indexing) | (Indexing, Indexing) | (Indexed, Indexing) => Ok(to),
            (Queued, Indexed) | (Indexing, Indexed) | (Indexed, Indexed) => Ok(to),
            _ => Err(InvalidTransition { from: self, to }),
        }
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(EventState::Queued),
            "indexing" => Ok(EventState::Indexing),
            "indexed" => Ok(EventState::Indexed),
            other => Err(anyhow::anyhow!("Unknown event state: {}", other)),
        }
    }
}

/// One tracked (contract, standard) pair and its scan watermark.
#[derive(Debug, Clone)]
pub struct Event {
    pub contract: Address,
    pub standard: TokenStandard,
    pub state: EventState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub start_block: u64,
    pub last_block: u64,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Sending,
    Pending,
    Success,
    Fail,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Sending => "sending",
            TransferStatus::Pending => "pending",
            TransferStatus::Success => "success",
            TransferStatus::Fail => "fail",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sending" => Ok(TransferStatus::Sending),
            "pending" => Ok(TransferStatus::Pending),
            "success" => Ok(TransferStatus::Success),
            "fail" => Ok(TransferStatus::Fail),
            other => Err(anyhow::anyhow!("Unknown transfer status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub hash: B256,
    pub tx_hash: Option<B256>,
    pub token_id: U256,
    pub created_at: DateTime<Utc>,
    pub from_address: Address,
    pub to_address: Address,
    pub nonce: U256,
    pub value: U256,
    pub data: Option<serde_json::Value>,
    pub status: TransferStatus,
}

impl Transfer {
    /// Content hash of a confirmed transfer. The token id disambiguates the
    /// records of one ERC1155 `TransferBatch` log.
    pub fn content_hash(tx_hash: B256, log_index: u64, token_id: U256) -> B256 {
        let mut buf = Vec::with_capacity(32 + 8 + 32);
        buf.extend_from_slice(tx_hash.as_slice());
        buf.extend_from_slice(&log_index.to_be_bytes());
        buf.extend_from_slice(&token_id.to_be_bytes::<32>());
        keccak256(buf)
    }

    pub fn from_to(&self) -> String {
        from_to_key(&self.from_address, &self.to_address)
    }
}

pub fn from_to_key(from: &Address, to: &Address) -> String {
    format!("{from:?}_{to:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_rejects_return_to_queued() {
        assert!(EventState::Indexed.transition(EventState::Queued).is_err());
        assert!(EventState::Indexing.transition(EventState::Queued).is_err());
        assert_eq!(
            EventState::Queued.transition(EventState::Indexing).unwrap(),
            EventState::Indexing
        );
        assert_eq!(
            EventState::Indexed.transition(EventState::Indexing).unwrap(),
            EventState::Indexing
        );
    }

    #[test]
    fn content_hash_differs_per_token_id() {
        let tx = B256::repeat_byte(7);
        assert_ne!(
            Transfer::content_hash(tx, 3, U256::from(1)),
            Transfer::content_hash(tx, 3, U256::from(2))
        );
        assert_eq!(
            Transfer::content_hash(tx, 3, U256::from(1)),
            Transfer::content_hash(tx, 3, U256::from(1))
        );
    }

    #[test]
    fn parses_standards_case_insensitively() {
        assert_eq!("ERC1155".parse::<TokenStandard>().unwrap(), TokenStandard::Erc1155);
        assert!(matches!(
            "erc777".parse::<TokenStandard>(),
            Err(DecodeError::UnsupportedStandard(_))
        ));
    }
}
