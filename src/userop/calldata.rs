use alloy::sol;
use alloy::sol_types::SolCall;
use alloy_primitives::{Address, U256};

sol! {
    interface IAccount {
        function execute(address dest, uint256 value, bytes func);
    }

    interface IToken {
        function transfer(address to, uint256 amount);
        function transferFrom(address from, address to, uint256 amount);
    }
}

/// A token transfer found inside an account's call data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTransfer {
    pub contract: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

/// Recognizes `execute(token, 0, transfer(..))` and
/// `execute(token, 0, transferFrom(..))` made by `sender`.
pub fn parse_transfer(sender: Address, call_data: &[u8]) -> Option<CallTransfer> {
    if !call_data.starts_with(&IAccount::executeCall::SELECTOR) {
        return None;
    }
    let execute = IAccount::executeCall::abi_decode(call_data).ok()?;
    let inner = execute.func.as_ref();

    if inner.starts_with(&IToken::transferCall::SELECTOR) {
        let call = IToken::transferCall::abi_decode(inner).ok()?;
        return Some(CallTransfer {
            contract: execute.dest,
            from: sender,
            to: call.to,
            value: call.amount,
        });
    }

    if inner.starts_with(&IToken::transferFromCall::SELECTOR) {
        let call = IToken::transferFromCall::abi_decode(inner).ok()?;
        return Some(CallTransfer {
            contract: execute.dest,
            from: call.from,
            to: call.to,
            value: call.amount,
        });
    }

    None
}

pub fn encode_transfer(token: Address, to: Address, amount: U256) -> Vec<u8> {
    IAccount::executeCall {
        dest: token,
        value: U256::ZERO,
        func: IToken::transferCall { to, amount }.abi_encode().into(),
    }
    .abi_encode()
}
