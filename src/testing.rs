//! In-process stand-ins for the chain, bundler and notification channel.

use crate::bundler::{UserOpLookup, UserOperationLookup};
use crate::error::{BundlerError, ChainError};
use crate::notify::Notifier;
use crate::rpc::ChainClient;
use alloy::consensus::TxEnvelope;
use alloy::network::TransactionBuilder;
use alloy::rpc::types::{Log, TransactionRequest};
use alloy_primitives::{Address, B256, Bytes};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const CHAIN_ID: u64 = 1337;

#[derive(Default)]
struct ChainState {
    logs: Vec<Log>,
    filter_calls: Vec<(u64, u64)>,
    filter_error: Option<ChainError>,
    latest_block_error: Option<ChainError>,
    send_results: VecDeque<Result<(), ChainError>>,
    sent: Vec<TxEnvelope>,
    mined: bool,
    receipt_error: Option<ChainError>,
}

pub struct MockChain {
    latest_block: u64,
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new(latest_block: u64) -> Self {
        Self {
            latest_block,
            state: Mutex::new(ChainState {
                mined: true,
                ..Default::default()
            }),
        }
    }

    pub fn add_log_at(&self, block_number: u64, mut log: Log) {
        log.block_number = Some(block_number);
        self.state.lock().unwrap().logs.push(log);
    }

    pub fn filter_calls(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().filter_calls.clone()
    }

    pub fn fail_filter_logs(&self, error: ChainError) {
        self.state.lock().unwrap().filter_error = Some(error);
    }

    pub fn fail_latest_block(&self, error: ChainError) {
        self.state.lock().unwrap().latest_block_error = Some(error);
    }

    /// Outcome of the next `send_transaction` calls, in order; success once
    /// exhausted.
    pub fn push_send_result(&self, result: Result<(), ChainError>) {
        self.state.lock().unwrap().send_results.push_back(result);
    }

    pub fn set_mined(&self, mined: bool) {
        self.state.lock().unwrap().mined = mined;
    }

    pub fn fail_receipt(&self, error: ChainError) {
        self.state.lock().unwrap().receipt_error = Some(error);
    }

    pub fn sent(&self) -> Vec<TxEnvelope> {
        self.state.lock().unwrap().sent.clone()
    }
}

impl ChainClient for MockChain {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(CHAIN_ID)
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        match &self.state.lock().unwrap().latest_block_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.latest_block),
        }
    }

    async fn filter_logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
        _topics: &[B256],
    ) -> Result<Vec<Log>, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.filter_calls.push((from_block, to_block));
        if let Some(e) = &state.filter_error {
            return Err(e.clone());
        }

        Ok(state
            .logs
            .iter()
            .filter(|log| {
                let block = log.block_number.unwrap_or_default();
                block >= from_block
                    && block <= to_block
                    && (addresses.is_empty() || addresses.contains(&log.address()))
            })
            .cloned()
            .collect())
    }

    async fn block_time(&self, block_number: u64) -> Result<DateTime<Utc>, ChainError> {
        DateTime::from_timestamp(block_number as i64 * 12, 0)
            .ok_or(ChainError::MissingBlock(block_number))
    }

    async fn nonce_at(&self, _address: Address) -> Result<u64, ChainError> {
        Ok(self.state.lock().unwrap().sent.len() as u64)
    }

    async fn new_tx(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
        nonce: u64,
    ) -> Result<TransactionRequest, ChainError> {
        Ok(TransactionRequest::default()
            .with_from(from)
            .with_to(to)
            .with_input(data)
            .with_nonce(nonce)
            .with_chain_id(CHAIN_ID)
            .with_gas_limit(500_000)
            .with_max_fee_per_gas(2_000_000_000)
            .with_max_priority_fee_per_gas(1_000_000_000))
    }

    async fn send_transaction(&self, tx: TxEnvelope) -> Result<B256, ChainError> {
        let mut state = self.state.lock().unwrap();
        match state.send_results.pop_front() {
            Some(Err(e)) => Err(e),
            _ => {
                let hash = *tx.tx_hash();
                state.sent.push(tx);
                Ok(hash)
            }
        }
    }

    async fn wait_for_tx(&self, _tx_hash: B256) -> Result<bool, ChainError> {
        let state = self.state.lock().unwrap();
        match &state.receipt_error {
            Some(e) => Err(e.clone()),
            None => Ok(state.mined),
        }
    }
}

#[derive(Default)]
pub struct MockBundler {
    ops: Mutex<HashMap<B256, UserOperationLookup>>,
    failing: Mutex<bool>,
}

impl MockBundler {
    pub fn insert(&self, user_op_hash: B256, lookup: UserOperationLookup) {
        self.ops.lock().unwrap().insert(user_op_hash, lookup);
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

impl UserOpLookup for MockBundler {
    async fn get_user_operation_by_hash(
        &self,
        user_op_hash: B256,
    ) -> Result<UserOperationLookup, BundlerError> {
        if *self.failing.lock().unwrap() {
            return Err(BundlerError::Transport("connection refused".to_string()));
        }
        self.ops
            .lock()
            .unwrap()
            .get(&user_op_hash)
            .cloned()
            .ok_or(BundlerError::NotFound(user_op_hash))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }

    fn notify_error(&self, error: &(dyn std::error::Error + Send + Sync)) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}
