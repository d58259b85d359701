use crate::error::{DecodeError, ScanError};
use crate::events::{decode_log, topics};
use crate::reconcile::reconcile;
use crate::repository::{Database, Event, EventState, Transfer};
use crate::rpc::ChainClient;
use crate::scheduler::CycleError;
use alloy::rpc::types::Log;
use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_RATE: u64 = 1000; // Most public RPCs allow up to 1k logs per request
const BLOCK_TIME_CONCURRENCY: usize = 8;

/// Block windows covering `(last_block, current_block]`, newest first, each
/// at most `rate` blocks wide.
pub fn scan_windows(last_block: u64, current_block: u64, rate: u64) -> Vec<(u64, u64)> {
    let rate = rate.max(1);
    let lowest = last_block + 1;
    let mut windows = Vec::new();
    let mut block_num = current_block;

    while block_num >= lowest {
        let from = block_num.saturating_sub(rate - 1).max(lowest);
        windows.push((from, block_num));
        if from == 0 {
            break;
        }
        block_num = from - 1;
    }

    windows
}

pub struct Scanner<C: ChainClient> {
    client: Arc<C>,
    db: Database,
    rate: u64,
}

impl<C: ChainClient> Scanner<C> {
    pub fn new(client: Arc<C>, db: Database, rate: u64) -> Self {
        Scanner { client, db, rate }
    }

    /// Brings one tracked contract up to `current_block`.
    ///
    /// The watermark only moves once every window has been merged; an
    /// aborted scan leaves it untouched and the next cycle rescans.
    pub async fn scan_contract(
        &self,
        event: &mut Event,
        current_block: u64,
    ) -> Result<(), ScanError> {
        let events = self.db.events();

        if event.last_block >= current_block {
            events.set_event_state(event, EventState::Indexed)?;
            return Ok(());
        }

        events.set_event_state(event, EventState::Indexing)?;
        let transfers = self
            .db
            .transfers(&event.contract)
            .with_context(|| format!("opening transfer table of {:?}", event.contract))?;
        let topics = topics(event.standard);

        for (from, to) in scan_windows(event.last_block, current_block, self.rate) {
            let logs = self
                .client
                .filter_logs(from, to, &[event.contract], &topics)
                .await?;
            debug!(
                "Received {} logs for {:?} ({}) blocks {} to {}",
                logs.len(),
                event.contract,
                event.standard,
                from,
                to
            );

            if logs.is_empty() {
                continue;
            }

            let decoded = self.decode_logs(event, &logs).await?;
            let summary = reconcile(&transfers, &decoded).with_context(|| {
                format!(
                    "merging transfers of {:?} ({}) blocks {}-{}",
                    event.contract, event.standard, from, to
                )
            })?;
            info!(
                "{:?} ({}) blocks {}-{}: {} new, {} confirmed optimistic, {} already known",
                event.contract,
                event.standard,
                from,
                to,
                summary.inserted,
                summary.matched_optimistic,
                summary.confirmed
            );
        }

        events.set_event_last_block(event, current_block)?;
        events.set_event_state(event, EventState::Indexed)?;
        info!(
            "Indexed {:?} ({}) up to block {}",
            event.contract, event.standard, current_block
        );
        Ok(())
    }

    async fn decode_logs(&self, event: &Event, logs: &[Log]) -> Result<Vec<Transfer>, ScanError> {
        let block_numbers = logs
            .iter()
            .map(|log| {
                log.block_number
                    .ok_or(DecodeError::MissingField("block number"))
            })
            .collect::<Result<BTreeSet<_>, _>>()?;

        let block_times: HashMap<u64, DateTime<Utc>> = stream::iter(block_numbers)
            .map(|number| async move {
                let time = self.client.block_time(number).await?;
                Ok::<_, ScanError>((number, time))
            })
            .buffer_unordered(BLOCK_TIME_CONCURRENCY)
            .try_collect()
            .await?;

        let mut transfers = Vec::with_capacity(logs.len());
        for log in logs {
            let block_time = log
                .block_number
                .and_then(|n| block_times.get(&n))
                .copied()
                .unwrap_or_else(Utc::now);
            let decoded = decode_log(event.standard, log, block_time).map_err(|e| {
                ScanError::Fatal(anyhow::Error::new(e).context(format!(
                    "decoding log {:?} of {:?} ({})",
                    log.transaction_hash, event.contract, event.standard
                )))
            })?;
            transfers.extend(decoded);
        }

        Ok(transfers)
    }

    /// One pass over every tracked contract. A recoverable failure abandons
    /// only that contract for this cycle; a fatal one stops the pass.
    pub async fn scan_all(&self) -> Result<(), CycleError> {
        let current_block = self
            .client
            .latest_block()
            .await
            .map_err(|e| CycleError::Recoverable(e.into()))?;
        let events = self
            .db
            .events()
            .get_outdated_events(current_block)
            .map_err(CycleError::Fatal)?;
        let mut recoverable = None;

        for mut event in events {
            match self.scan_contract(&mut event, current_block).await {
                Ok(()) => {}
                Err(ScanError::Recoverable(e)) => {
                    warn!(
                        "Scan of {:?} ({}) abandoned for this cycle: {}",
                        event.contract, event.standard, e
                    );
                    recoverable = Some(e);
                }
                Err(ScanError::Fatal(e)) => {
                    return Err(CycleError::Fatal(e.context(format!(
                        "scanning {:?} ({})",
                        event.contract, event.standard
                    ))));
                }
            }
        }

        match recoverable {
            Some(e) => Err(CycleError::Recoverable(e.into())),
            None => Ok(()),
        }
    }
}
