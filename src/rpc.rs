use alloy::consensus::TxEnvelope;
use alloy::eips::eip2718::Encodable2718;
use alloy::network::{ReceiptResponse, TransactionBuilder};
use alloy::providers::fillers::FillProvider;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log, TransactionRequest};
use alloy::sol_types::SolCall;
use alloy_primitives::{Address, B256, Bytes};
use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_retry::Retry;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, info, warn};

use crate::error::ChainError;

type AlloyFullProvider = FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider,
>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Capabilities the indexer and dispatcher need from an EVM chain.
pub trait ChainClient: Send + Sync + 'static {
    fn chain_id(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    fn latest_block(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    fn filter_logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
        topics: &[B256],
    ) -> impl Future<Output = Result<Vec<Log>, ChainError>> + Send;

    fn block_time(
        &self,
        block_number: u64,
    ) -> impl Future<Output = Result<DateTime<Utc>, ChainError>> + Send;

    fn nonce_at(&self, address: Address) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Unsigned transaction with chain id, gas and fees filled in.
    fn new_tx(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
        nonce: u64,
    ) -> impl Future<Output = Result<TransactionRequest, ChainError>> + Send;

    fn send_transaction(
        &self,
        tx: TxEnvelope,
    ) -> impl Future<Output = Result<B256, ChainError>> + Send;

    /// Status of the mined receipt. Errors when no receipt shows up in time,
    /// which says nothing about whether the transaction will still mine.
    fn wait_for_tx(&self, tx_hash: B256) -> impl Future<Output = Result<bool, ChainError>> + Send;
}

#[derive(Clone)]
pub struct RpcClient {
    providers: Vec<AlloyFullProvider>,
    urls: Vec<String>,
    current_provider: Arc<AtomicUsize>,
    max_retries: usize,
}

impl RpcClient {
    pub fn new(rpc_urls: &[String]) -> Result<Self> {
        if rpc_urls.is_empty() {
            return Err(anyhow::anyhow!("At least one RPC URL must be provided"));
        }

        let mut providers = Vec::new();
        for url in rpc_urls {
            let parsed_url = url
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid RPC URL: {}", url))?;
            let provider: AlloyFullProvider = ProviderBuilder::new().connect_http(parsed_url);
            providers.push(provider);
        }

        Ok(RpcClient {
            providers,
            urls: rpc_urls.to_vec(),
            current_provider: Arc::new(AtomicUsize::new(0)),
            max_retries: 5,
        })
    }

    fn get_provider(&self) -> &AlloyFullProvider {
        let index = self.current_provider.load(Ordering::Relaxed) % self.providers.len();
        &self.providers[index]
    }

    pub fn get_current_url(&self) -> &str {
        let index = self.current_provider.load(Ordering::Relaxed) % self.urls.len();
        &self.urls[index]
    }

    pub fn rotate_provider(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);

        if self.providers.len() > 1 {
            debug!("Rotating to RPC provider #{}", next);
        }
    }

    fn get_retry_strategy(&self) -> impl Iterator<Item = Duration> + use<> {
        ExponentialBackoff::from_millis(100)
            .factor(2)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries)
    }

    fn handle_error(&self, error_str: &str) {
        let current_url = self.get_current_url();
        warn!(
            "RPC error on {}: {}, rotating provider",
            current_url, error_str
        );
        self.rotate_provider();
    }

    fn handle_timeout(&self) -> ChainError {
        let current_url = self.get_current_url();
        warn!(
            "Request timeout after {} seconds on {}, rotating provider",
            REQUEST_TIMEOUT.as_secs(),
            current_url
        );
        self.rotate_provider();
        ChainError::Timeout(REQUEST_TIMEOUT.as_secs())
    }

    /// Runs `op` against the current provider with timeout, rotation and
    /// exponential backoff.
    async fn request<T, F, Fut>(&self, op: F) -> Result<T, ChainError>
    where
        F: Fn(AlloyFullProvider) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        Retry::spawn(self.get_retry_strategy(), || async {
            let provider = self.get_provider().clone();
            match timeout(REQUEST_TIMEOUT, op(provider)).await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(error_str)) => {
                    self.handle_error(&error_str);
                    Err(ChainError::Transport(error_str))
                }
                Err(_) => Err(self.handle_timeout()),
            }
        })
        .await
    }

    pub async fn get_code_at_block(&self, address: Address, block_number: u64) -> Result<Bytes> {
        let code = self
            .request(|provider| async move {
                provider
                    .get_code_at(address)
                    .block_id(BlockNumberOrTag::Number(block_number).into())
                    .await
                    .map_err(|e| e.to_string())
            })
            .await?;
        Ok(code)
    }

    /// `eth_call` of a view function on `address`.
    pub async fn call_contract<C>(&self, address: Address, call: C) -> Result<C::Return>
    where
        C: SolCall + Clone + Send + Sync,
    {
        let data = Bytes::from(call.abi_encode());
        let raw = self
            .request(|provider| {
                let tx = TransactionRequest::default()
                    .with_to(address)
                    .with_input(data.clone());
                async move { provider.call(tx).await.map_err(|e| e.to_string()) }
            })
            .await?;

        C::abi_decode_returns(&raw)
            .map_err(|e| anyhow::anyhow!("Failed to decode call result: {}", e))
    }

    async fn get_logs_internal(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
        topics: &[B256],
    ) -> Result<Result<Vec<Log>, String>, ChainError> {
        let filter = Filter::new()
            .address(addresses.to_vec())
            .event_signature(topics.to_vec())
            .from_block(from_block)
            .to_block(to_block);

        Retry::spawn(self.get_retry_strategy(), || async {
            let provider = self.get_provider();
            match timeout(REQUEST_TIMEOUT, provider.get_logs(&filter)).await {
                Ok(Ok(logs)) => Ok(Ok(logs)),
                Ok(Err(e)) => {
                    let error_str = e.to_string();

                    if error_str.contains("exceeds max results") {
                        debug!(
                            "Max results exceeded for blocks {}-{}, will split range",
                            from_block, to_block
                        );
                        // not retried: the caller splits the range instead
                        Ok(Err(error_str))
                    } else {
                        self.handle_error(&error_str);
                        Err(ChainError::Transport(error_str))
                    }
                }
                Err(_) => Err(self.handle_timeout()),
            }
        })
        .await
    }

    fn parse_max_results_error(error_str: &str) -> Option<(u64, u64)> {
        let re = Regex::new(r"retry with the range (\d+)-(\d+)").ok()?;
        let captures = re.captures(error_str)?;

        let from = captures.get(1)?.as_str().parse().ok()?;
        let to = captures.get(2)?.as_str().parse().ok()?;

        Some((from, to))
    }

    /// End of the shrunken window after a max-results error, kept inside
    /// `[from, to)` so every retry covers fewer blocks and none are skipped.
    fn split_window(from: u64, to: u64, suggested_to: u64) -> Option<u64> {
        let split_to = suggested_to.clamp(from, to);
        (split_to < to).then_some(split_to)
    }

    pub async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
        topics: &[B256],
    ) -> Result<Vec<Log>, ChainError> {
        let mut all_logs = Vec::new();
        let mut current_from = from_block;
        let mut current_to = to_block;

        while current_from <= to_block {
            match self
                .get_logs_internal(current_from, current_to, addresses, topics)
                .await?
            {
                Ok(logs) => {
                    all_logs.extend(logs);
                    if current_to >= to_block {
                        break;
                    }
                    current_from = current_to + 1;
                    current_to = to_block;
                }
                Err(error_str) => {
                    let split_to = Self::parse_max_results_error(&error_str).and_then(|(_, to)| {
                        Self::split_window(current_from, current_to, to)
                    });
                    let Some(split_to) = split_to else {
                        return Err(ChainError::Transport(error_str));
                    };

                    info!(
                        "Hit max results limit for blocks {}-{}, splitting at block {}",
                        current_from, current_to, split_to
                    );
                    current_to = split_to;
                }
            }
        }

        Ok(all_logs)
    }
}

impl ChainClient for RpcClient {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.request(|provider| async move {
            provider.get_chain_id().await.map_err(|e| e.to_string())
        })
        .await
    }

    async fn latest_block(&self) -> Result<u64, ChainError> {
        self.request(|provider| async move {
            provider.get_block_number().await.map_err(|e| e.to_string())
        })
        .await
    }

    async fn filter_logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
        topics: &[B256],
    ) -> Result<Vec<Log>, ChainError> {
        self.get_logs(from_block, to_block, addresses, topics).await
    }

    async fn block_time(&self, block_number: u64) -> Result<DateTime<Utc>, ChainError> {
        let block = self
            .request(|provider| async move {
                provider
                    .get_block_by_number(BlockNumberOrTag::Number(block_number))
                    .await
                    .map_err(|e| e.to_string())
            })
            .await?
            .ok_or(ChainError::MissingBlock(block_number))?;

        DateTime::from_timestamp(block.header.timestamp as i64, 0)
            .ok_or(ChainError::MissingBlock(block_number))
    }

    async fn nonce_at(&self, address: Address) -> Result<u64, ChainError> {
        self.request(|provider| async move {
            provider
                .get_transaction_count(address)
                .pending()
                .await
                .map_err(|e| e.to_string())
        })
        .await
    }

    async fn new_tx(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
        nonce: u64,
    ) -> Result<TransactionRequest, ChainError> {
        let chain_id = self.chain_id().await?;
        let tx = TransactionRequest::default()
            .with_from(from)
            .with_to(to)
            .with_input(data)
            .with_nonce(nonce)
            .with_chain_id(chain_id);

        let gas_limit = self
            .request(|provider| {
                let tx = tx.clone();
                async move { provider.estimate_gas(tx).await.map_err(|e| e.to_string()) }
            })
            .await?;
        let fees = self
            .request(|provider| async move {
                provider
                    .estimate_eip1559_fees()
                    .await
                    .map_err(|e| e.to_string())
            })
            .await?;

        Ok(tx
            .with_gas_limit(gas_limit)
            .with_max_fee_per_gas(fees.max_fee_per_gas)
            .with_max_priority_fee_per_gas(fees.max_priority_fee_per_gas))
    }

    // Not retried: a rejected submission is surfaced to the dispatcher as-is.
    async fn send_transaction(&self, tx: TxEnvelope) -> Result<B256, ChainError> {
        let encoded = tx.encoded_2718();
        let provider = self.get_provider();

        match timeout(REQUEST_TIMEOUT, provider.send_raw_transaction(&encoded)).await {
            Ok(Ok(pending)) => Ok(*pending.tx_hash()),
            Ok(Err(e)) => {
                let error_str = e.to_string();
                if error_str.to_lowercase().contains("insufficient funds") {
                    Err(ChainError::InsufficientFunds(error_str))
                } else {
                    self.handle_error(&error_str);
                    Err(ChainError::Transport(error_str))
                }
            }
            Err(_) => Err(self.handle_timeout()),
        }
    }

    async fn wait_for_tx(&self, tx_hash: B256) -> Result<bool, ChainError> {
        let deadline = tokio::time::Instant::now() + RECEIPT_TIMEOUT;

        loop {
            let receipt = self
                .request(|provider| async move {
                    provider
                        .get_transaction_receipt(tx_hash)
                        .await
                        .map_err(|e| e.to_string())
                })
                .await?;

            if let Some(receipt) = receipt {
                return Ok(receipt.status());
            }

            if tokio::time::Instant::now() >= deadline {
                warn!("Transaction {:?} not mined after {:?}", tx_hash, RECEIPT_TIMEOUT);
                return Err(ChainError::Timeout(RECEIPT_TIMEOUT.as_secs()));
            }
            sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suggested_range_from_provider_error() {
        let error = "query exceeds max results 10000, retry with the range 1200-1350";
        assert_eq!(RpcClient::parse_max_results_error(error), Some((1200, 1350)));
        assert_eq!(RpcClient::parse_max_results_error("rate limited"), None);
    }

    #[test]
    fn split_window_stays_inside_the_pending_range() {
        assert_eq!(RpcClient::split_window(100, 500, 250), Some(250));
        // a suggestion below the window still starts at its first block
        assert_eq!(RpcClient::split_window(100, 500, 40), Some(100));
        assert_eq!(RpcClient::split_window(100, 500, 900), None);
        assert_eq!(RpcClient::split_window(100, 500, 500), None);
        assert_eq!(RpcClient::split_window(100, 100, 100), None);
    }

    #[test]
    fn rejects_empty_url_list() {
        assert!(RpcClient::new(&[]).is_err());
    }
}
