use anyhow::Context;
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bundler::UserOpLookup;
use crate::error::BundlerError;
use crate::repository::{Database, TransferRepository, TransferStatus};
use crate::scheduler::CycleError;

pub const DEFAULT_SYNC_RATE: usize = 100;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Rows checked per contract and cycle.
    pub rate: usize,
    /// Minimum age of a pending row before the bundler is asked about it.
    pub pending_threshold: Duration,
    /// Age after which unconfirmable optimistic rows are removed.
    pub pending_expiry: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            rate: DEFAULT_SYNC_RATE,
            pending_threshold: Duration::seconds(60),
            pending_expiry: Duration::hours(1),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    pub merged: usize,
    pub backfilled: usize,
    pub expired: usize,
    pub swept: usize,
}

/// Resolves pending user operations into their bundle transactions.
pub struct Reconciler<B: UserOpLookup> {
    bundler: Arc<B>,
    db: Database,
    options: SyncOptions,
}

impl<B: UserOpLookup> Reconciler<B> {
    pub fn new(bundler: Arc<B>, db: Database, options: SyncOptions) -> Self {
        Self { bundler, db, options }
    }

    pub async fn sync(&self) -> Result<SyncSummary, CycleError> {
        let events = self.db.events().get_events().map_err(CycleError::Fatal)?;
        let mut contracts = HashSet::new();
        let mut summary = SyncSummary::default();

        for event in events {
            if !contracts.insert(event.contract) {
                continue;
            }
            let context = format!("syncing {:?}", event.contract);
            let repo = self
                .db
                .transfers(&event.contract)
                .map_err(CycleError::Fatal)?;
            let result = self.sync_contract(&repo, &mut summary).await;
            result.map_err(|e| match e {
                CycleError::Recoverable(e) => CycleError::Recoverable(e.context(context)),
                CycleError::Fatal(e) => CycleError::Fatal(e.context(context)),
            })?;
        }

        if summary != SyncSummary::default() {
            info!(
                "Bundler sync: {} merged, {} backfilled, {} expired, {} swept",
                summary.merged, summary.backfilled, summary.expired, summary.swept
            );
        }
        Ok(summary)
    }

    async fn sync_contract(
        &self,
        repo: &TransferRepository,
        summary: &mut SyncSummary,
    ) -> Result<(), CycleError> {
        let now = Utc::now();
        let expiry_cutoff = now - self.options.pending_expiry;

        summary.swept += repo
            .remove_stale(TransferStatus::Sending, expiry_cutoff)
            .map_err(CycleError::Fatal)?;
        summary.swept += repo
            .remove_stale_linked(expiry_cutoff)
            .map_err(CycleError::Fatal)?;

        let pending = repo
            .get_unlinked_before(
                TransferStatus::Pending,
                now - self.options.pending_threshold,
                self.options.rate,
            )
            .map_err(CycleError::Fatal)?;
        debug!(
            "{}: {} pending transfer(s) to resolve",
            repo.table(),
            pending.len()
        );

        for transfer in pending {
            let lookup = match self.bundler.get_user_operation_by_hash(transfer.hash).await {
                Ok(lookup) => lookup,
                Err(BundlerError::NotFound(hash)) => {
                    if transfer.created_at < expiry_cutoff {
                        warn!(
                            "User operation {:?} unknown to the bundler, removing expired transfer",
                            hash
                        );
                        if repo.remove_transfer(&hash).map_err(CycleError::Fatal)? {
                            summary.expired += 1;
                        }
                    }
                    continue;
                }
                Err(e) => return Err(CycleError::Recoverable(e.into())),
            };

            // known but not bundled yet
            let Some(tx_hash) = lookup.transaction_hash else {
                continue;
            };

            let already_indexed = repo
                .tx_indexed(&tx_hash)
                .context("checking transaction")
                .map_err(CycleError::Fatal)?;
            if already_indexed {
                // every log of the transaction is recorded, this row is a duplicate
                debug!(
                    "User operation {:?} already indexed in {:?}, removing pending transfer",
                    transfer.hash, tx_hash
                );
                if repo.remove_transfer(&transfer.hash).map_err(CycleError::Fatal)? {
                    summary.merged += 1;
                }
            } else {
                repo.set_tx_hash(&transfer.hash, &tx_hash, lookup.nonce())
                    .map_err(CycleError::Fatal)?;
                summary.backfilled += 1;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::UserOperationLookup;
    use crate::deployment::{TokenMetadata, new_event};
    use crate::reconcile::reconcile;
    use crate::repository::{TokenStandard, Transfer};
    use crate::testing::MockBundler;
    use alloy_primitives::{Address, B256, U256};

    fn token() -> Address {
        Address::repeat_byte(0xcc)
    }

    fn setup() -> (Arc<MockBundler>, Database, Reconciler<MockBundler>) {
        let db = Database::in_memory().unwrap();
        let event = new_event(
            token(),
            TokenStandard::Erc20,
            10,
            TokenMetadata::default(),
        );
        db.events().add_event(&event).unwrap();
        let bundler = Arc::new(MockBundler::default());
        let reconciler = Reconciler::new(bundler.clone(), db.clone(), SyncOptions::default());
        (bundler, db, reconciler)
    }

    fn provisional(seed: u8, status: TransferStatus, age: Duration) -> Transfer {
        Transfer {
            hash: B256::repeat_byte(seed),
            tx_hash: None,
            token_id: U256::ZERO,
            created_at: Utc::now() - age,
            from_address: Address::repeat_byte(1),
            to_address: Address::repeat_byte(2),
            nonce: U256::from(3),
            value: U256::from(seed),
            data: None,
            status,
        }
    }

    fn bundled(tx_hash: Option<B256>) -> UserOperationLookup {
        UserOperationLookup {
            user_operation: serde_json::json!({ "nonce": "0x7" }),
            entry_point: Address::repeat_byte(0xee),
            block_number: tx_hash.map(|_| U256::from(900)),
            block_hash: tx_hash.map(|_| B256::repeat_byte(0xbb)),
            transaction_hash: tx_hash,
        }
    }

    #[tokio::test]
    async fn backfills_tx_hash_so_the_scanner_confirms_the_row() {
        let (bundler, db, reconciler) = setup();
        let repo = db.transfers(&token()).unwrap();
        let row = provisional(1, TransferStatus::Pending, Duration::minutes(5));
        repo.add_transfer(&row).unwrap();

        let tx = B256::repeat_byte(0x7a);
        bundler.insert(row.hash, bundled(Some(tx)));

        let summary = reconciler.sync().await.unwrap();
        assert_eq!(summary.backfilled, 1);

        let stored = repo.get_transfer(&row.hash).unwrap().unwrap();
        assert_eq!(stored.tx_hash, Some(tx));
        assert_eq!(stored.nonce, U256::from(7));
        assert_eq!(stored.status, TransferStatus::Pending);

        // the confirmed log now matches the linked row exactly
        let confirmed = Transfer {
            hash: Transfer::content_hash(tx, 0, U256::ZERO),
            tx_hash: Some(tx),
            status: TransferStatus::Success,
            nonce: U256::ZERO,
            ..row.clone()
        };
        reconcile(&repo, &[confirmed]).unwrap();
        assert_eq!(repo.count().unwrap(), 1);
        assert_eq!(
            repo.get_transfer(&row.hash).unwrap().unwrap().status,
            TransferStatus::Success
        );
    }

    #[tokio::test]
    async fn pending_row_of_indexed_transaction_is_merged() {
        let (bundler, db, reconciler) = setup();
        let repo = db.transfers(&token()).unwrap();
        let tx = B256::repeat_byte(0x7b);

        let mut indexed = provisional(2, TransferStatus::Success, Duration::minutes(1));
        indexed.hash = Transfer::content_hash(tx, 4, U256::ZERO);
        indexed.tx_hash = Some(tx);
        let row = provisional(2, TransferStatus::Pending, Duration::minutes(5));
        repo.add_transfers(&[indexed.clone(), row.clone()]).unwrap();
        bundler.insert(row.hash, bundled(Some(tx)));

        let summary = reconciler.sync().await.unwrap();

        assert_eq!(summary.merged, 1);
        assert!(!repo.transfer_exists(&row.hash).unwrap());
        assert!(repo.transfer_exists(&indexed.hash).unwrap());
    }

    #[tokio::test]
    async fn equal_transfers_confirmed_out_of_order_end_with_one_row_each() {
        let (bundler, db, reconciler) = setup();
        let repo = db.transfers(&token()).unwrap();
        let first = provisional(4, TransferStatus::Pending, Duration::minutes(6));
        let mut second = provisional(4, TransferStatus::Pending, Duration::minutes(5));
        second.hash = B256::repeat_byte(5);

        let (tx_first, tx_second) = (B256::repeat_byte(0xa1), B256::repeat_byte(0xa2));
        bundler.insert(first.hash, bundled(Some(tx_first)));
        bundler.insert(second.hash, bundled(Some(tx_second)));
        repo.add_transfers(&[first.clone(), second]).unwrap();
        let log = |tx: B256| Transfer {
            hash: Transfer::content_hash(tx, 0, U256::ZERO),
            tx_hash: Some(tx),
            status: TransferStatus::Success,
            nonce: U256::ZERO,
            created_at: Utc::now(),
            ..first.clone()
        };

        // the second transaction lands first and is matched to the oldest row
        reconcile(&repo, &[log(tx_second)]).unwrap();
        reconciler.sync().await.unwrap();
        reconcile(&repo, &[log(tx_first)]).unwrap();
        reconciler.sync().await.unwrap();

        let rows = repo.query_transfers(None, 10, 0).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|t| t.status == TransferStatus::Success));
        let mut tx_hashes: Vec<_> = rows.iter().filter_map(|t| t.tx_hash).collect();
        tx_hashes.sort();
        assert_eq!(tx_hashes, vec![tx_first, tx_second]);
    }

    #[tokio::test]
    async fn linked_rows_never_confirmed_expire() {
        let (bundler, db, reconciler) = setup();
        let repo = db.transfers(&token()).unwrap();
        let row = provisional(6, TransferStatus::Pending, Duration::hours(2));
        repo.add_transfer(&row).unwrap();
        bundler.insert(row.hash, bundled(Some(B256::repeat_byte(0x7c))));

        let summary = reconciler.sync().await.unwrap();
        assert_eq!(summary.backfilled, 1);
        assert!(repo.transfer_exists(&row.hash).unwrap());

        let summary = reconciler.sync().await.unwrap();
        assert_eq!(summary.swept, 1);
        assert!(!repo.transfer_exists(&row.hash).unwrap());
    }

    #[tokio::test]
    async fn young_and_unbundled_rows_are_left_alone() {
        let (bundler, db, reconciler) = setup();
        let repo = db.transfers(&token()).unwrap();
        let young = provisional(3, TransferStatus::Pending, Duration::seconds(5));
        let unbundled = provisional(4, TransferStatus::Pending, Duration::minutes(5));
        let unknown = provisional(5, TransferStatus::Pending, Duration::minutes(5));
        repo.add_transfers(&[young.clone(), unbundled.clone(), unknown])
            .unwrap();
        bundler.insert(young.hash, bundled(Some(B256::repeat_byte(0x70))));
        bundler.insert(unbundled.hash, bundled(None));

        let summary = reconciler.sync().await.unwrap();

        assert_eq!(summary, SyncSummary::default());
        assert_eq!(repo.count().unwrap(), 3);
        assert_eq!(repo.get_transfer(&young.hash).unwrap().unwrap().tx_hash, None);
    }

    #[tokio::test]
    async fn expired_rows_are_removed() {
        let (_bundler, db, reconciler) = setup();
        let repo = db.transfers(&token()).unwrap();
        let unknown = provisional(6, TransferStatus::Pending, Duration::hours(2));
        let stuck = provisional(7, TransferStatus::Sending, Duration::hours(2));
        let sending = provisional(8, TransferStatus::Sending, Duration::minutes(1));
        repo.add_transfers(&[unknown.clone(), stuck.clone(), sending.clone()])
            .unwrap();

        let summary = reconciler.sync().await.unwrap();

        assert_eq!(summary.expired, 1);
        assert_eq!(summary.swept, 1);
        assert!(!repo.transfer_exists(&unknown.hash).unwrap());
        assert!(!repo.transfer_exists(&stuck.hash).unwrap());
        assert!(repo.transfer_exists(&sending.hash).unwrap());
    }

    #[tokio::test]
    async fn bundler_outage_aborts_cycle_as_recoverable() {
        let (bundler, db, reconciler) = setup();
        let repo = db.transfers(&token()).unwrap();
        let row = provisional(1, TransferStatus::Pending, Duration::hours(2));
        repo.add_transfer(&row).unwrap();
        bundler.set_failing(true);

        let result = reconciler.sync().await;

        assert!(matches!(result, Err(CycleError::Recoverable(_))));
        assert!(repo.transfer_exists(&row.hash).unwrap());
    }
}
