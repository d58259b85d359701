use alloy::rpc::client::RpcClient as JsonRpcClient;
use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::error::BundlerError;

/// Bundler answer for `eth_getUserOperationByHash`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationLookup {
    pub user_operation: serde_json::Value,
    pub entry_point: Address,
    pub block_number: Option<U256>,
    pub block_hash: Option<B256>,
    pub transaction_hash: Option<B256>,
}

impl UserOperationLookup {
    /// Nonce of the bundled operation, when the bundler echoed one.
    pub fn nonce(&self) -> Option<U256> {
        let nonce = self.user_operation.get("nonce")?;
        serde_json::from_value(nonce.clone()).ok()
    }
}

pub trait UserOpLookup: Send + Sync + 'static {
    fn get_user_operation_by_hash(
        &self,
        user_op_hash: B256,
    ) -> impl Future<Output = Result<UserOperationLookup, BundlerError>> + Send;
}

/// A JSON-RPC client for an ERC-4337 bundler
#[derive(Debug, Clone)]
pub struct BundlerClient {
    inner: JsonRpcClient,
}

impl BundlerClient {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let url = url.parse()?;
        Ok(Self {
            inner: JsonRpcClient::new_http(url),
        })
    }
}

impl UserOpLookup for BundlerClient {
    async fn get_user_operation_by_hash(
        &self,
        user_op_hash: B256,
    ) -> Result<UserOperationLookup, BundlerError> {
        let lookup: Option<UserOperationLookup> = self
            .inner
            .request("eth_getUserOperationByHash", [user_op_hash])
            .await
            .map_err(|e| BundlerError::Transport(e.to_string()))?;

        lookup.ok_or(BundlerError::NotFound(user_op_hash))
    }
}
