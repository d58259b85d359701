use crate::query::formatters::{OutputFormat, format_events, format_transfers};
use crate::repository::{Database, TokenStandard, TransferStatus};
use alloy_primitives::Address;
use anyhow::Result;
use std::str::FromStr;

pub fn cmd_events(db: &Database, format: &OutputFormat) -> Result<String> {
    let events = db.events().get_events()?;
    Ok(format_events(&events, format))
}

#[derive(Debug)]
pub struct TransferQuery {
    pub contract: String,
    pub status: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

pub fn cmd_transfers(db: &Database, query: TransferQuery, format: &OutputFormat) -> Result<String> {
    let contract = Address::from_str(&query.contract)
        .map_err(|_| anyhow::anyhow!("Invalid contract address: {}", query.contract))?;
    let status = query
        .status
        .as_deref()
        .map(TransferStatus::from_str)
        .transpose()?;

    // The first tracked standard decides how values are rendered.
    let event = db
        .events()
        .get_events()?
        .into_iter()
        .find(|e| e.contract == contract);
    let Some(event) = event else {
        return Err(anyhow::anyhow!("Contract {:?} is not tracked", contract));
    };
    let decimals = match event.standard {
        TokenStandard::Erc20 => event.decimals,
        TokenStandard::Erc721 | TokenStandard::Erc1155 => None,
    };

    let transfers = db
        .transfers(&contract)?
        .query_transfers(status, query.limit, query.offset)?;
    Ok(format_transfers(&transfers, event.standard, decimals, format))
}
