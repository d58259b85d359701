use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;
use alloy_primitives::{Address, B256, U256};
use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{IEntryPoint, UserOpMessage, parse_transfer};
use crate::error::{ChainError, ProcessError};
use crate::queue::{Message, Payload, Processor};
use crate::repository::{Database, SponsorRepository, Transfer, TransferRepository, TransferStatus};
use crate::rpc::ChainClient;

/// Resolves the signing key that pays for a paymaster's operations.
pub trait SponsorStore: Send + Sync + 'static {
    fn get_sponsor(&self, paymaster: &Address) -> Result<Option<String>>;
}

impl SponsorStore for SponsorRepository {
    fn get_sponsor(&self, paymaster: &Address) -> Result<Option<String>> {
        SponsorRepository::get_sponsor(self, paymaster)
    }
}

type Provisional = Vec<(TransferRepository, B256)>;

/// Bundles queued user operations into one `handleOps` transaction per
/// entry point.
pub struct UserOpDispatcher<C: ChainClient, S: SponsorStore> {
    client: Arc<C>,
    sponsors: S,
    db: Database,
}

impl<C: ChainClient, S: SponsorStore> UserOpDispatcher<C, S> {
    pub fn new(client: Arc<C>, sponsors: S, db: Database) -> Self {
        Self { client, sponsors, db }
    }

    async fn submit_group(
        &self,
        entry_point: Address,
        ops: &[&UserOpMessage],
    ) -> Result<B256, ProcessError> {
        let first = ops
            .first()
            .ok_or_else(|| ProcessError::InvalidPayload("empty group".to_string()))?;

        let key = self
            .sponsors
            .get_sponsor(&first.paymaster)
            .map_err(|e| ProcessError::Sponsor(e.to_string()))?
            .ok_or_else(|| {
                ProcessError::Sponsor(format!("no sponsor for paymaster {:?}", first.paymaster))
            })?;
        let signer: PrivateKeySigner = key
            .trim()
            .parse()
            .map_err(|e| ProcessError::Signing(format!("invalid sponsor key: {}", e)))?;
        let sponsor = signer.address();

        let nonce = self
            .client
            .nonce_at(sponsor)
            .await
            .map_err(|e| ProcessError::Submission(e.to_string()))?;

        let call = IEntryPoint::handleOpsCall {
            ops: ops.iter().map(|m| (&m.user_op).into()).collect(),
            beneficiary: sponsor,
        };
        let request = self
            .client
            .new_tx(sponsor, entry_point, call.abi_encode().into(), nonce)
            .await
            .map_err(|e| ProcessError::Submission(e.to_string()))?;

        let wallet = EthereumWallet::from(signer);
        let envelope = request
            .build(&wallet)
            .await
            .map_err(|e| ProcessError::Signing(e.to_string()))?;

        let provisional = self.insert_provisional(entry_point, ops)?;

        match self.client.send_transaction(envelope).await {
            Ok(tx_hash) => {
                // broadcast already happened, a store error must not fail the group
                for (repo, hash) in &provisional {
                    if let Err(e) = repo.set_status(hash, TransferStatus::Pending) {
                        error!("Failed to mark transfer {:?} as pending: {}", hash, e);
                    }
                }
                info!(
                    "Submitted {} user operation(s) to {:?} in {:?}",
                    ops.len(),
                    entry_point,
                    tx_hash
                );
                self.watch_mining(tx_hash, provisional);
                Ok(tx_hash)
            }
            Err(ChainError::InsufficientFunds(e)) => {
                // kept so the operator can see what is stuck behind the top-up
                for (repo, hash) in &provisional {
                    if let Err(e) = repo.set_status(hash, TransferStatus::Fail) {
                        error!("Failed to mark transfer {:?} as failed: {}", hash, e);
                    }
                }
                Err(ProcessError::InsufficientFunds(format!("{:?}: {}", sponsor, e)))
            }
            Err(e) => {
                rollback(&provisional);
                Err(ProcessError::Submission(e.to_string()))
            }
        }
    }

    fn insert_provisional(
        &self,
        entry_point: Address,
        ops: &[&UserOpMessage],
    ) -> Result<Provisional, ProcessError> {
        let mut provisional = Vec::new();

        for op in ops {
            let Some(call) = parse_transfer(op.user_op.sender, &op.call_data) else {
                continue;
            };
            let hash = super::user_op_hash(&op.user_op, entry_point, op.chain_id);
            let transfer = Transfer {
                hash,
                tx_hash: None,
                token_id: U256::ZERO,
                created_at: Utc::now(),
                from_address: call.from,
                to_address: call.to,
                nonce: op.user_op.nonce,
                value: call.value,
                data: op.extra_data.clone(),
                status: TransferStatus::Sending,
            };

            let inserted = self
                .db
                .transfers(&call.contract)
                .and_then(|repo| repo.add_transfer(&transfer).map(|_| repo));
            match inserted {
                Ok(repo) => provisional.push((repo, hash)),
                Err(e) => {
                    rollback(&provisional);
                    return Err(ProcessError::Store(e.to_string()));
                }
            }
        }

        debug!("Inserted {} provisional transfer(s)", provisional.len());
        Ok(provisional)
    }

    fn watch_mining(&self, tx_hash: B256, provisional: Provisional) {
        if provisional.is_empty() {
            return;
        }
        let client = self.client.clone();
        tokio::spawn(async move {
            match client.wait_for_tx(tx_hash).await {
                Ok(true) => debug!("Transaction {:?} mined", tx_hash),
                Ok(false) => {
                    warn!(
                        "Transaction {:?} reverted, removing provisional transfers",
                        tx_hash
                    );
                    rollback(&provisional);
                }
                // may still mine, the scanner and bundler sync settle the rows
                Err(e) => warn!("Failed to await transaction {:?}: {}", tx_hash, e),
            }
        });
    }
}

fn rollback(provisional: &[(TransferRepository, B256)]) {
    for (repo, hash) in provisional {
        if let Err(e) = repo.remove_transfer(hash) {
            error!("Failed to remove provisional transfer {:?}: {}", hash, e);
        }
    }
}

impl<C: ChainClient, S: SponsorStore> Processor for UserOpDispatcher<C, S> {
    async fn process(&self, batch: Vec<Message>) -> Vec<(Message, ProcessError)> {
        let mut failed = Vec::new();
        let mut groups: BTreeMap<Address, Vec<Message>> = BTreeMap::new();

        for message in batch {
            let entry_point = match &message.payload {
                Payload::UserOp(op) => Some(op.entry_point),
                Payload::Raw(_) => None,
            };
            match entry_point {
                Some(entry_point) => groups.entry(entry_point).or_default().push(message),
                None => {
                    let reason = format!("message {} is not a user operation", message.id);
                    failed.push((message, ProcessError::InvalidPayload(reason)));
                }
            }
        }

        for (entry_point, messages) in groups {
            let ops: Vec<&UserOpMessage> = messages
                .iter()
                .filter_map(|m| match &m.payload {
                    Payload::UserOp(op) => Some(op.as_ref()),
                    Payload::Raw(_) => None,
                })
                .collect();

            if let Err(e) = self.submit_group(entry_point, &ops).await {
                warn!(
                    "Batch for entry point {:?} failed ({} message(s)): {}",
                    entry_point,
                    messages.len(),
                    e
                );
                failed.extend(messages.into_iter().map(|m| (m, e.clone())));
            }
        }

        failed
    }
}
