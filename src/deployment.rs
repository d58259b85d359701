use crate::events::IERC20::{decimalsCall, nameCall, symbolCall};
use crate::repository::{Event, EventRepository, EventState, TokenStandard};
use crate::rpc::{ChainClient, RpcClient};
use alloy_primitives::Address;
use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

pub async fn find_deployment_block(
    client: &RpcClient,
    address: Address,
    latest_block: u64,
) -> Result<u64> {
    info!("Searching for deployment block of contract {:?}", address);

    let code = client.get_code_at_block(address, latest_block).await?;
    if code.is_empty() {
        anyhow::bail!("Address {:?} is not a deployed contract", address);
    }

    let mut left = 0u64;
    let mut right = latest_block;

    while left < right {
        let mid = (left + right) / 2;

        let code = client.get_code_at_block(address, mid).await?;

        if code.is_empty() {
            left = mid + 1;
        } else {
            right = mid;
        }
    }

    info!("Contract deployed at block {}", left);
    Ok(left)
}

#[derive(Debug, Clone, Default)]
pub struct TokenMetadata {
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<u8>,
}

/// Best-effort: tokens that do not implement a getter simply leave it unset.
pub async fn fetch_token_metadata(client: &RpcClient, address: Address) -> TokenMetadata {
    info!("Fetching token metadata for {:?}", address);

    let name = match client.call_contract(address, nameCall {}).await {
        Ok(result) => Some(result),
        Err(e) => {
            warn!("Failed to fetch token name: {}", e);
            None
        }
    };

    let symbol = match client.call_contract(address, symbolCall {}).await {
        Ok(result) => Some(result),
        Err(e) => {
            warn!("Failed to fetch token symbol: {}", e);
            None
        }
    };

    let decimals = match client.call_contract(address, decimalsCall {}).await {
        Ok(result) => Some(result),
        Err(e) => {
            warn!("Failed to fetch token decimals: {}", e);
            None
        }
    };

    TokenMetadata {
        name,
        symbol,
        decimals,
    }
}

pub fn new_event(
    contract: Address,
    standard: TokenStandard,
    deployment_block: u64,
    metadata: TokenMetadata,
) -> Event {
    let now = Utc::now();
    Event {
        contract,
        standard,
        state: EventState::Queued,
        created_at: now,
        updated_at: now,
        start_block: deployment_block,
        last_block: deployment_block.saturating_sub(1),
        name: metadata.name,
        symbol: metadata.symbol,
        decimals: metadata.decimals,
    }
}

/// Starts tracking `contract` unless it is already registered.
pub async fn register_contract(
    client: &RpcClient,
    events: &EventRepository,
    contract: Address,
    standard: TokenStandard,
) -> Result<Event> {
    if let Some(event) = events.get_event(&contract, standard)? {
        info!(
            "Contract {:?} ({}) already tracked, watermark at block {}",
            contract, standard, event.last_block
        );
        return Ok(event);
    }

    let latest_block = client.latest_block().await?;
    let deployment_block = find_deployment_block(client, contract, latest_block).await?;
    let metadata = fetch_token_metadata(client, contract).await;

    let event = new_event(contract, standard, deployment_block, metadata);
    events.add_event(&event)?;
    info!(
        "Registered {:?} ({}) from block {}",
        contract, standard, deployment_block
    );
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_starts_queued_just_below_deployment() {
        let event = new_event(
            Address::repeat_byte(1),
            TokenStandard::Erc20,
            1_000,
            TokenMetadata {
                symbol: Some("USDC".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(event.state, EventState::Queued);
        assert_eq!(event.start_block, 1_000);
        assert_eq!(event.last_block, 999);
        assert_eq!(event.symbol.as_deref(), Some("USDC"));

        let genesis = new_event(Address::ZERO, TokenStandard::Erc721, 0, TokenMetadata::default());
        assert_eq!(genesis.last_block, 0);
    }
}
