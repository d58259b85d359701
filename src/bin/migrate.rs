use anyhow::Result;
use token_indexer::config::Config;
use token_indexer::repository::Database;

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let config = Config::from_env()?;

    println!("Running migrations on database: {}", config.database_url);

    let db = Database::new(&config.database_url)?;
    for (contract, standard) in &config.contracts {
        let repo = db.transfers(contract)?;
        println!("Transfer table {} ready for {:?} ({})", repo.table(), contract, standard);
    }

    println!("Migrations completed successfully!");

    Ok(())
}
