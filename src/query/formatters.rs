use crate::repository::{Event, TokenStandard, Transfer};
use alloy_primitives::utils::format_units;
use comfy_table::{Cell, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use csv::Writer;
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "csv" => OutputFormat::Csv,
            _ => OutputFormat::Table,
        }
    }
}

pub fn format_events(events: &[Event], format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => format_events_table(events),
        OutputFormat::Json => format_events_json(events),
        OutputFormat::Csv => format_events_csv(events),
    }
}

fn format_events_table(events: &[Event]) -> String {
    if events.is_empty() {
        return "No contracts tracked.".to_string();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            "Contract",
            "Standard",
            "Token",
            "State",
            "Start Block",
            "Last Block",
            "Updated",
        ]);

    for event in events {
        table.add_row(vec![
            Cell::new(format!("{:#}", event.contract)),
            Cell::new(event.standard),
            Cell::new(token_label(event)),
            Cell::new(event.state),
            Cell::new(event.start_block),
            Cell::new(event.last_block),
            Cell::new(event.updated_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    table.to_string()
}

fn format_events_json(events: &[Event]) -> String {
    let json_events: Vec<_> = events
        .iter()
        .map(|e| {
            json!({
                "contract": format!("{:?}", e.contract),
                "standard": e.standard.as_str(),
                "name": e.name,
                "symbol": e.symbol,
                "decimals": e.decimals,
                "state": e.state.as_str(),
                "start_block": e.start_block,
                "last_block": e.last_block,
                "created_at": e.created_at.to_rfc3339(),
                "updated_at": e.updated_at.to_rfc3339(),
            })
        })
        .collect();

    serde_json::to_string_pretty(&json_events).unwrap_or_else(|_| "[]".to_string())
}

fn format_events_csv(events: &[Event]) -> String {
    let mut wtr = Writer::from_writer(vec![]);

    let _ = wtr.write_record([
        "contract",
        "standard",
        "symbol",
        "state",
        "start_block",
        "last_block",
        "updated_at",
    ]);

    for event in events {
        let _ = wtr.write_record([
            &format!("{:?}", event.contract),
            event.standard.as_str(),
            event.symbol.as_deref().unwrap_or(""),
            event.state.as_str(),
            &event.start_block.to_string(),
            &event.last_block.to_string(),
            &event.updated_at.to_rfc3339(),
        ]);
    }

    String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
}

fn token_label(event: &Event) -> String {
    match (&event.name, &event.symbol) {
        (Some(name), Some(symbol)) => format!("{name} ({symbol})"),
        (None, Some(symbol)) => symbol.clone(),
        (Some(name), None) => name.clone(),
        (None, None) => "-".to_string(),
    }
}

/// Value as shown to humans: scaled by `decimals` for fungible tokens, raw
/// otherwise.
fn display_value(transfer: &Transfer, standard: TokenStandard, decimals: Option<u8>) -> String {
    match standard {
        TokenStandard::Erc20 => format_units(transfer.value, decimals.unwrap_or(18))
            .unwrap_or_else(|_| transfer.value.to_string()),
        TokenStandard::Erc721 | TokenStandard::Erc1155 => transfer.value.to_string(),
    }
}

fn tx_hash_string(transfer: &Transfer) -> String {
    transfer
        .tx_hash
        .map(|h| format!("{h:?}"))
        .unwrap_or_default()
}

pub fn format_transfers(
    transfers: &[Transfer],
    standard: TokenStandard,
    decimals: Option<u8>,
    format: &OutputFormat,
) -> String {
    match format {
        OutputFormat::Table => format_transfers_table(transfers, standard, decimals),
        OutputFormat::Json => format_transfers_json(transfers, standard, decimals),
        OutputFormat::Csv => format_transfers_csv(transfers, standard, decimals),
    }
}

fn format_transfers_table(
    transfers: &[Transfer],
    standard: TokenStandard,
    decimals: Option<u8>,
) -> String {
    if transfers.is_empty() {
        return "No transfers found.".to_string();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            "Time",
            "From",
            "To",
            "Token Id",
            "Value",
            "Status",
            "Tx Hash",
        ]);

    for transfer in transfers {
        let tx_hash = match transfer.tx_hash {
            Some(hash) => format_tx_hash(&format!("{hash:?}")),
            None => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(transfer.created_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(format!("{:#}", transfer.from_address)),
            Cell::new(format!("{:#}", transfer.to_address)),
            Cell::new(transfer.token_id),
            Cell::new(display_value(transfer, standard, decimals)),
            Cell::new(transfer.status),
            Cell::new(tx_hash),
        ]);
    }

    table.to_string()
}

fn format_transfers_json(
    transfers: &[Transfer],
    standard: TokenStandard,
    decimals: Option<u8>,
) -> String {
    let json_transfers: Vec<_> = transfers
        .iter()
        .map(|t| {
            json!({
                "hash": format!("{:?}", t.hash),
                "tx_hash": t.tx_hash.map(|h| format!("{h:?}")),
                "created_at": t.created_at.to_rfc3339(),
                "from": format!("{:?}", t.from_address),
                "to": format!("{:?}", t.to_address),
                "token_id": t.token_id.to_string(),
                "nonce": t.nonce.to_string(),
                "value": display_value(t, standard, decimals),
                "value_raw": t.value.to_string(),
                "status": t.status.as_str(),
                "data": t.data,
            })
        })
        .collect();

    serde_json::to_string_pretty(&json_transfers).unwrap_or_else(|_| "[]".to_string())
}

fn format_transfers_csv(
    transfers: &[Transfer],
    standard: TokenStandard,
    decimals: Option<u8>,
) -> String {
    let mut wtr = Writer::from_writer(vec![]);

    let _ = wtr.write_record([
        "hash",
        "tx_hash",
        "created_at",
        "from",
        "to",
        "token_id",
        "value",
        "value_raw",
        "status",
    ]);

    for transfer in transfers {
        let _ = wtr.write_record([
            &format!("{:?}", transfer.hash),
            &tx_hash_string(transfer),
            &transfer.created_at.to_rfc3339(),
            &format!("{:?}", transfer.from_address),
            &format!("{:?}", transfer.to_address),
            &transfer.token_id.to_string(),
            &display_value(transfer, standard, decimals),
            &transfer.value.to_string(),
            transfer.status.as_str(),
        ]);
    }

    String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
}

fn format_tx_hash(hash: &str) -> String {
    if hash.len() <= 12 {
        return hash.to_string();
    }
    format!("{}...{}", &hash[..6], &hash[hash.len() - 4..])
}
