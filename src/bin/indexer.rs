use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use token_indexer::bundler::BundlerClient;
use token_indexer::config::Config;
use token_indexer::deployment::register_contract;
use token_indexer::notify::{LogNotifier, Notifier, WebhookNotifier};
use token_indexer::queue::RetryQueue;
use token_indexer::repository::Database;
use token_indexer::rpc::{ChainClient, RpcClient};
use token_indexer::scanner::Scanner;
use token_indexer::scheduler::Ticker;
use token_indexer::sync::Reconciler;
use token_indexer::userop::UserOpDispatcher;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting token indexer");

    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!(
        "RPC URLs: {} endpoint(s) configured",
        config.json_rpc_urls.len()
    );

    let db = Database::new(&config.database_url)?;
    info!("Database initialized");

    let client = Arc::new(RpcClient::new(&config.json_rpc_urls)?);
    let chain_id = client.chain_id().await?;
    info!("RPC client connected to chain {}", chain_id);

    for (contract, standard) in &config.contracts {
        register_contract(&client, &db.events(), *contract, *standard).await?;
    }

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.as_str(), "token-indexer")),
        None => Arc::new(LogNotifier),
    };

    let (quit_tx, quit_rx) = watch::channel(false);
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    let scanner = Arc::new(Scanner::new(client.clone(), db.clone(), config.scan_rate));
    let ticker = Ticker::new("scanner", config.scan_interval, config.retry_delay);
    let quit = quit_rx.clone();
    tasks.spawn(async move {
        ticker
            .run(quit, move || {
                let scanner = scanner.clone();
                async move { scanner.scan_all().await }
            })
            .await
    });

    match &config.bundler_url {
        Some(url) => {
            let bundler = Arc::new(BundlerClient::new(url)?);
            let reconciler = Arc::new(Reconciler::new(bundler, db.clone(), config.sync.clone()));
            let ticker = Ticker::new("bundler sync", config.sync_interval, config.retry_delay);
            let quit = quit_rx.clone();
            tasks.spawn(async move {
                ticker
                    .run(quit, move || {
                        let reconciler = reconciler.clone();
                        async move { reconciler.sync().await.map(|_| ()) }
                    })
                    .await
            });
        }
        None => warn!("BUNDLER_URL not set, bundler sync disabled"),
    }

    let queue = Arc::new(RetryQueue::new(
        config.queue_name.clone(),
        config.queue.clone(),
        notifier.clone(),
    ));
    let dispatcher = UserOpDispatcher::new(client.clone(), db.sponsors(), db.clone());
    let consumer = queue.clone();
    tasks.spawn(async move {
        consumer.start(dispatcher).await;
        Ok(())
    });

    let mut failure = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
        Some(joined) = tasks.join_next() => {
            warn!("A background loop exited early, shutting down");
            failure = task_error(joined);
        }
    }

    quit_tx.send_replace(true);
    queue.close();

    while let Some(joined) = tasks.join_next().await {
        if let Some(e) = task_error(joined) {
            failure.get_or_insert(e);
        }
    }

    match failure {
        Some(e) => {
            error!("Indexer stopped: {:#}", e);
            notifier.notify_error(e.as_ref());
            Err(e)
        }
        None => {
            info!("Indexer stopped");
            Ok(())
        }
    }
}

fn task_error(joined: Result<Result<()>, tokio::task::JoinError>) -> Option<anyhow::Error> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => Some(e.into()),
    }
}
