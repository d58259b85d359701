use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy_primitives::{B256, U256};
use chrono::{DateTime, Utc};

use crate::error::DecodeError;
use crate::repository::{TokenStandard, Transfer, TransferStatus};

sol! {
    interface IERC20 {
        event Transfer(address indexed from, address indexed to, uint256 value);

        function name() external view returns (string);
        function symbol() external view returns (string);
        function decimals() external view returns (uint8);
    }

    interface IERC721 {
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);
    }

    interface IERC1155 {
        event TransferSingle(address indexed operator, address indexed from, address indexed to, uint256 id, uint256 value);
        event TransferBatch(address indexed operator, address indexed from, address indexed to, uint256[] ids, uint256[] values);
    }
}

/// Event signatures to filter on for `standard`.
pub fn topics(standard: TokenStandard) -> Vec<B256> {
    match standard {
        TokenStandard::Erc20 => vec![IERC20::Transfer::SIGNATURE_HASH],
        TokenStandard::Erc721 => vec![IERC721::Transfer::SIGNATURE_HASH],
        TokenStandard::Erc1155 => vec![
            IERC1155::TransferSingle::SIGNATURE_HASH,
            IERC1155::TransferBatch::SIGNATURE_HASH,
        ],
    }
}

/// Decodes one raw log into the transfers it carries, stamped with the
/// timestamp of its block.
pub fn decode_log(
    standard: TokenStandard,
    log: &Log,
    block_time: DateTime<Utc>,
) -> Result<Vec<Transfer>, DecodeError> {
    let tx_hash = log
        .transaction_hash
        .ok_or(DecodeError::MissingField("transaction hash"))?;
    let log_index = log.log_index.ok_or(DecodeError::MissingField("log index"))?;
    let topics = log.topics();
    let data = &log.data().data;

    let record = |from, to, token_id: U256, value: U256| Transfer {
        hash: Transfer::content_hash(tx_hash, log_index, token_id),
        tx_hash: Some(tx_hash),
        token_id,
        created_at: block_time,
        from_address: from,
        to_address: to,
        nonce: U256::ZERO,
        value,
        data: None,
        status: TransferStatus::Success,
    };

    let topic0 = *topics.first().ok_or(DecodeError::MissingField("topic0"))?;

    match standard {
        TokenStandard::Erc20 => {
            let event = IERC20::Transfer::decode_raw_log(topics, data)?;
            Ok(vec![record(event.from, event.to, U256::ZERO, event.value)])
        }
        TokenStandard::Erc721 => {
            // Some collections emit the token id unindexed, in the data section.
            let (from, to, token_id) = if topics.len() == 4 {
                let event = IERC721::Transfer::decode_raw_log(topics, data)?;
                (event.from, event.to, event.tokenId)
            } else {
                let event = IERC20::Transfer::decode_raw_log(topics, data)?;
                (event.from, event.to, event.value)
            };
            Ok(vec![record(from, to, token_id, U256::from(1))])
        }
        TokenStandard::Erc1155 if topic0 == IERC1155::TransferSingle::SIGNATURE_HASH => {
            let event = IERC1155::TransferSingle::decode_raw_log(topics, data)?;
            Ok(vec![record(event.from, event.to, event.id, event.value)])
        }
        TokenStandard::Erc1155 if topic0 == IERC1155::TransferBatch::SIGNATURE_HASH => {
            let event = IERC1155::TransferBatch::decode_raw_log(topics, data)?;
            if event.ids.len() != event.values.len() {
                return Err(DecodeError::LengthMismatch {
                    ids: event.ids.len(),
                    values: event.values.len(),
                });
            }

            Ok(event
                .ids
                .iter()
                .zip(event.values.iter())
                .map(|(id, value)| record(event.from, event.to, *id, *value))
                .collect())
        }
        TokenStandard::Erc1155 => Err(DecodeError::UnknownTopic(topic0)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloy::sol_types::SolValue;
    use alloy_primitives::{Address, Bytes, LogData};

    pub(crate) fn raw_log(topics: Vec<B256>, data: Vec<u8>, tx: u8, log_index: u64) -> Log {
        Log {
            inner: alloy_primitives::Log {
                address: Address::repeat_byte(0xcc),
                data: LogData::new_unchecked(topics, Bytes::from(data)),
            },
            block_hash: Some(B256::repeat_byte(0xbb)),
            block_number: Some(42),
            block_timestamp: None,
            transaction_hash: Some(B256::repeat_byte(tx)),
            transaction_index: Some(0),
            log_index: Some(log_index),
            removed: false,
        }
    }

    pub(crate) fn erc20_log(from: Address, to: Address, value: u64, tx: u8, log_index: u64) -> Log {
        raw_log(
            vec![
                IERC20::Transfer::SIGNATURE_HASH,
                from.into_word(),
                to.into_word(),
            ],
            U256::from(value).abi_encode(),
            tx,
            log_index,
        )
    }

    #[test]
    fn decodes_erc20_transfer() {
        let from = Address::repeat_byte(1);
        let to = Address::repeat_byte(2);
        let now = Utc::now();

        let transfers =
            decode_log(TokenStandard::Erc20, &erc20_log(from, to, 500, 9, 3), now).unwrap();
        assert_eq!(transfers.len(), 1);
        let t = &transfers[0];
        assert_eq!(t.from_address, from);
        assert_eq!(t.to_address, to);
        assert_eq!(t.value, U256::from(500));
        assert_eq!(t.token_id, U256::ZERO);
        assert_eq!(t.status, TransferStatus::Success);
        assert_eq!(t.tx_hash, Some(B256::repeat_byte(9)));
        assert_eq!(t.created_at, now);
    }

    #[test]
    fn decodes_erc721_token_id_from_topic_or_data() {
        let from = Address::repeat_byte(1);
        let to = Address::repeat_byte(2);

        let indexed = raw_log(
            vec![
                IERC721::Transfer::SIGNATURE_HASH,
                from.into_word(),
                to.into_word(),
                B256::from(U256::from(77)),
            ],
            vec![],
            1,
            0,
        );
        let t = &decode_log(TokenStandard::Erc721, &indexed, Utc::now()).unwrap()[0];
        assert_eq!(t.token_id, U256::from(77));
        assert_eq!(t.value, U256::from(1));

        let in_data = erc20_log(from, to, 78, 1, 1);
        let t = &decode_log(TokenStandard::Erc721, &in_data, Utc::now()).unwrap()[0];
        assert_eq!(t.token_id, U256::from(78));
        assert_eq!(t.value, U256::from(1));
    }

    #[test]
    fn decodes_erc1155_batch_into_one_record_per_id() {
        let operator = Address::repeat_byte(9);
        let from = Address::repeat_byte(1);
        let to = Address::repeat_byte(2);
        let ids = vec![U256::from(1), U256::from(2), U256::from(3)];
        let values = vec![U256::from(10), U256::from(20), U256::from(30)];

        let log = raw_log(
            vec![
                IERC1155::TransferBatch::SIGNATURE_HASH,
                operator.into_word(),
                from.into_word(),
                to.into_word(),
            ],
            (ids, values).abi_encode_params(),
            4,
            2,
        );

        let transfers = decode_log(TokenStandard::Erc1155, &log, Utc::now()).unwrap();
        assert_eq!(transfers.len(), 3);
        assert_eq!(transfers[1].token_id, U256::from(2));
        assert_eq!(transfers[1].value, U256::from(20));
        assert!(transfers.iter().all(|t| t.from_address == from && t.to_address == to));
        assert_ne!(transfers[0].hash, transfers[1].hash);
    }

    #[test]
    fn erc1155_batch_length_mismatch_yields_no_records() {
        let log = raw_log(
            vec![
                IERC1155::TransferBatch::SIGNATURE_HASH,
                Address::repeat_byte(9).into_word(),
                Address::repeat_byte(1).into_word(),
                Address::repeat_byte(2).into_word(),
            ],
            (vec![U256::from(1), U256::from(2)], vec![U256::from(10)]).abi_encode_params(),
            4,
            2,
        );

        let result = decode_log(TokenStandard::Erc1155, &log, Utc::now());
        assert!(matches!(
            result,
            Err(DecodeError::LengthMismatch { ids: 2, values: 1 })
        ));
    }

    #[test]
    fn decodes_erc1155_single_and_rejects_unknown_topic() {
        let log = raw_log(
            vec![
                IERC1155::TransferSingle::SIGNATURE_HASH,
                Address::repeat_byte(9).into_word(),
                Address::repeat_byte(1).into_word(),
                Address::repeat_byte(2).into_word(),
            ],
            (U256::from(5), U256::from(6)).abi_encode_params(),
            4,
            0,
        );
        let t = &decode_log(TokenStandard::Erc1155, &log, Utc::now()).unwrap()[0];
        assert_eq!(t.token_id, U256::from(5));
        assert_eq!(t.value, U256::from(6));

        let unknown = raw_log(vec![B256::repeat_byte(0xee)], vec![], 4, 1);
        assert!(matches!(
            decode_log(TokenStandard::Erc1155, &unknown, Utc::now()),
            Err(DecodeError::UnknownTopic(_))
        ));
    }
}
