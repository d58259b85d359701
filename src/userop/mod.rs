pub mod calldata;
pub mod dispatcher;

use alloy::rpc::types::UserOperation;
use alloy::sol;
use alloy::sol_types::SolValue;
use alloy_primitives::{Address, B256, Bytes, U256, keccak256};

pub use calldata::{CallTransfer, parse_transfer};
pub use dispatcher::{SponsorStore, UserOpDispatcher};

sol! {
    interface IEntryPoint {
        struct UserOperation {
            address sender;
            uint256 nonce;
            bytes initCode;
            bytes callData;
            uint256 callGasLimit;
            uint256 verificationGasLimit;
            uint256 preVerificationGas;
            uint256 maxFeePerGas;
            uint256 maxPriorityFeePerGas;
            bytes paymasterAndData;
            bytes signature;
        }

        function handleOps(UserOperation[] ops, address beneficiary);
    }
}

/// A user operation waiting to be bundled into an entry point transaction.
#[derive(Debug, Clone)]
pub struct UserOpMessage {
    pub paymaster: Address,
    pub entry_point: Address,
    /// Call data the account executes, checked for token transfers.
    pub call_data: Bytes,
    pub user_op: UserOperation,
    pub chain_id: u64,
    pub extra_data: Option<serde_json::Value>,
}

impl UserOpMessage {
    pub fn new(
        paymaster: Address,
        entry_point: Address,
        chain_id: u64,
        user_op: UserOperation,
    ) -> Self {
        Self {
            paymaster,
            entry_point,
            call_data: user_op.call_data.clone(),
            user_op,
            chain_id,
            extra_data: None,
        }
    }

    pub fn with_extra_data(mut self, data: serde_json::Value) -> Self {
        self.extra_data = Some(data);
        self
    }

    /// The bundler-visible hash of this operation.
    pub fn hash(&self) -> B256 {
        user_op_hash(&self.user_op, self.entry_point, self.chain_id)
    }
}

impl From<&UserOperation> for IEntryPoint::UserOperation {
    fn from(op: &UserOperation) -> Self {
        IEntryPoint::UserOperation {
            sender: op.sender,
            nonce: op.nonce,
            initCode: op.init_code.clone(),
            callData: op.call_data.clone(),
            callGasLimit: op.call_gas_limit,
            verificationGasLimit: op.verification_gas_limit,
            preVerificationGas: op.pre_verification_gas,
            maxFeePerGas: op.max_fee_per_gas,
            maxPriorityFeePerGas: op.max_priority_fee_per_gas,
            paymasterAndData: op.paymaster_and_data.clone(),
            signature: op.signature.clone(),
        }
    }
}

/// EntryPoint v0.6 `getUserOpHash`.
pub fn user_op_hash(op: &UserOperation, entry_point: Address, chain_id: u64) -> B256 {
    // the signature is not part of the hash
    let inner = (
        op.sender,
        op.nonce,
        keccak256(&op.init_code),
        keccak256(&op.call_data),
        op.call_gas_limit,
        op.verification_gas_limit,
        op.pre_verification_gas,
        op.max_fee_per_gas,
        op.max_priority_fee_per_gas,
        keccak256(&op.paymaster_and_data),
    );
    let inner_hash = keccak256(inner.abi_encode());

    keccak256((inner_hash, entry_point, U256::from(chain_id)).abi_encode())
}
