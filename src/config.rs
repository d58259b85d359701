use alloy_primitives::Address;
use anyhow::{Context, Result, bail};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::queue::QueueOptions;
use crate::repository::TokenStandard;
use crate::scanner::DEFAULT_RATE;
use crate::sync::{DEFAULT_SYNC_RATE, SyncOptions};

#[derive(Debug, Clone)]
pub struct Config {
    pub json_rpc_urls: Vec<String>,
    pub database_url: String,
    pub contracts: Vec<(Address, TokenStandard)>,
    pub scan_rate: u64,
    pub scan_interval: Duration,
    pub retry_delay: Duration,
    pub bundler_url: Option<String>,
    pub sync_interval: Duration,
    pub sync: SyncOptions,
    pub queue_name: String,
    pub queue: QueueOptions,
    pub notify_webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let json_rpc_urls: Vec<String> = var("JSON_RPC_URLS")
            .context("JSON_RPC_URLS must be set in .env")?
            .split(',')
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if json_rpc_urls.is_empty() {
            bail!("JSON_RPC_URLS must contain at least one URL");
        }

        let database_url = var("DATABASE_URL")
            .unwrap_or_else(|| "sqlite:./indexer.db".to_string());
        let contracts = var("INDEXER_CONTRACTS")
            .map(|value| parse_contracts(&value))
            .transpose()
            .context("Invalid INDEXER_CONTRACTS")?
            .unwrap_or_default();

        let scan_rate: u64 = parse_or(&var, "SCAN_RATE", DEFAULT_RATE)?;
        if scan_rate == 0 {
            bail!("SCAN_RATE must be positive");
        }

        let pending_threshold = parse_or(&var, "PENDING_THRESHOLD_SECS", 60)?;
        let pending_expiry = parse_or(&var, "PENDING_EXPIRY_SECS", 3600)?;
        let sync = SyncOptions {
            rate: parse_or(&var, "SYNC_RATE", DEFAULT_SYNC_RATE)?,
            pending_threshold: chrono::Duration::seconds(pending_threshold),
            pending_expiry: chrono::Duration::seconds(pending_expiry),
        };

        let batch_window_ms = parse_or(&var, "QUEUE_BATCH_WINDOW_MS", 250)?;
        let retry_backoff_ms = parse_or(&var, "QUEUE_RETRY_BACKOFF_MS", 500)?;
        let queue = QueueOptions {
            capacity: parse_or(&var, "QUEUE_CAPACITY", 1000)?,
            max_batch_size: parse_or(&var, "QUEUE_MAX_BATCH", 100)?,
            batch_window: Duration::from_millis(batch_window_ms),
            max_retries: parse_or(&var, "QUEUE_MAX_RETRIES", 3)?,
            retry_backoff: Duration::from_millis(retry_backoff_ms),
        };
        if queue.capacity == 0 || queue.max_batch_size == 0 {
            bail!("QUEUE_CAPACITY and QUEUE_MAX_BATCH must be positive");
        }

        Ok(Config {
            json_rpc_urls,
            database_url,
            contracts,
            scan_rate,
            scan_interval: Duration::from_secs(parse_or(&var, "SCAN_INTERVAL_SECS", 12)?),
            retry_delay: Duration::from_secs(parse_or(&var, "RETRY_DELAY_SECS", 1)?),
            bundler_url: non_empty(var("BUNDLER_URL")),
            sync_interval: Duration::from_secs(parse_or(&var, "SYNC_INTERVAL_SECS", 30)?),
            sync,
            queue_name: var("QUEUE_NAME").unwrap_or_else(|| "userops".to_string()),
            queue,
            notify_webhook_url: non_empty(var("NOTIFY_WEBHOOK_URL")),
        })
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match var(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {} {:?}: {}", key, value, e)),
        None => Ok(default),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Parses `0xaddr:erc20,0xaddr:erc1155,...`.
pub fn parse_contracts(value: &str) -> Result<Vec<(Address, TokenStandard)>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (address, standard) = entry
                .split_once(':')
                .with_context(|| format!("expected <address>:<standard>, got {:?}", entry))?;
            let address = Address::from_str(address.trim())
                .with_context(|| format!("invalid contract address {:?}", address))?;
            let standard = TokenStandard::from_str(standard.trim())?;
            Ok((address, standard))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|key| vars.get(key).cloned())
    }

    fn with_contracts(value: &str) -> Result<Config> {
        config(&[("JSON_RPC_URLS", "http://a"), ("INDEXER_CONTRACTS", value)])
    }

    #[test]
    fn applies_defaults() {
        let config = config(&[("JSON_RPC_URLS", "http://a, http://b")]).unwrap();

        assert_eq!(config.json_rpc_urls, vec!["http://a", "http://b"]);
        assert_eq!(config.database_url, "sqlite:./indexer.db");
        assert!(config.contracts.is_empty());
        assert_eq!(config.scan_rate, 1000);
        assert_eq!(config.scan_interval, Duration::from_secs(12));
        assert_eq!(config.bundler_url, None);
        assert_eq!(config.queue_name, "userops");
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.sync.pending_expiry, chrono::Duration::hours(1));
    }

    #[test]
    fn reads_contracts_and_overrides() {
        let config = config(&[
            ("JSON_RPC_URLS", "http://a"),
            (
                "INDEXER_CONTRACTS",
                "0x0101010101010101010101010101010101010101:erc20, 0x0202020202020202020202020202020202020202:ERC1155",
            ),
            ("SCAN_RATE", "200"),
            ("QUEUE_BATCH_WINDOW_MS", "50"),
            ("BUNDLER_URL", "http://bundler"),
        ])
        .unwrap();

        assert_eq!(
            config.contracts,
            vec![
                (Address::repeat_byte(1), TokenStandard::Erc20),
                (Address::repeat_byte(2), TokenStandard::Erc1155),
            ]
        );
        assert_eq!(config.scan_rate, 200);
        assert_eq!(config.queue.batch_window, Duration::from_millis(50));
        assert_eq!(config.bundler_url.as_deref(), Some("http://bundler"));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(config(&[]).is_err());
        assert!(config(&[("JSON_RPC_URLS", " , ")]).is_err());
        assert!(config(&[("JSON_RPC_URLS", "http://a"), ("SCAN_RATE", "fast")]).is_err());
        assert!(config(&[("JSON_RPC_URLS", "http://a"), ("SCAN_RATE", "0")]).is_err());
        assert!(with_contracts("0x01:erc20").is_err());
        assert!(with_contracts("0x0101010101010101010101010101010101010101:erc777").is_err());
    }
}
