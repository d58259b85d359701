use anyhow::Result;
use tracing::debug;

use crate::repository::{Transfer, TransferRepository, TransferStatus};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub confirmed: usize,
    pub matched_optimistic: usize,
    pub inserted: usize,
}

/// Merges freshly decoded on-chain transfers into a contract's table.
///
/// Each incoming record is either already known (same tx hash, endpoints,
/// value and token id), the confirmation of an optimistic row with the same
/// endpoints and value but no tx hash yet, or new. New records are inserted
/// in one insert-or-ignore batch, so re-running over the same input leaves
/// the table unchanged.
pub fn reconcile(repo: &TransferRepository, incoming: &[Transfer]) -> Result<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();
    let mut new_transfers = Vec::new();

    for transfer in incoming {
        if let Some(existing) = repo.find_confirmed(transfer)? {
            repo.set_status(&existing, TransferStatus::Success)?;
            summary.confirmed += 1;
            continue;
        }

        if let Some(tx_hash) = transfer.tx_hash {
            if let Some(optimistic) = repo.find_similar_optimistic(
                &transfer.from_address,
                &transfer.to_address,
                &transfer.value,
            )? {
                debug!(
                    "Matched optimistic transfer {:?} to tx {:?}",
                    optimistic.hash, tx_hash
                );
                // Logs carry no nonce, keep the one recorded at submission.
                let nonce = (!transfer.nonce.is_zero()).then_some(transfer.nonce);
                repo.reconcile_tx(&optimistic.hash, &tx_hash, nonce)?;
                summary.matched_optimistic += 1;
                continue;
            }
        }

        new_transfers.push(transfer.clone());
    }

    if !new_transfers.is_empty() {
        summary.inserted = repo.add_transfers(&new_transfers)?;
    }

    Ok(summary)
}
