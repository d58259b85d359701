use anyhow::Result;
use clap::{Parser, Subcommand};
use token_indexer::query::commands::{TransferQuery, cmd_events, cmd_transfers};
use token_indexer::query::formatters::OutputFormat;
use token_indexer::repository::Database;

#[derive(Parser)]
#[command(name = "query")]
#[command(about = "Query indexed token transfers", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "table")]
    format: String,

    /// Overrides DATABASE_URL.
    #[arg(long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tracked contracts with their state and watermark
    Events,
    Transfers {
        contract: String,

        /// sending, pending, success or fail
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value = "100")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = OutputFormat::from(cli.format.as_str());

    dotenv::dotenv().ok();
    let database_url = cli
        .database
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .unwrap_or_else(|| "sqlite:./indexer.db".to_string());
    let db = Database::new(&database_url)?;

    let output = match cli.command {
        Commands::Events => cmd_events(&db, &format)?,
        Commands::Transfers {
            contract,
            status,
            limit,
            offset,
        } => {
            let query = TransferQuery {
                contract,
                status,
                limit,
                offset,
            };
            cmd_transfers(&db, query, &format)?
        }
    };
    println!("{output}");

    Ok(())
}
