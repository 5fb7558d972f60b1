mod cli;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use cli::Cli;
use foldercache::storage::Database;
use foldercache::{gc, gc_dry_run};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let db = match &cli.db_path {
        Some(path) => Database::new_named(path).await?,
        None => Database::new_default().await?,
    };

    if cli.dry_run {
        let count = gc_dry_run(&db).await?;
        info!(count, "rows eligible for garbage collection");
    } else {
        let count = gc(&db).await?;
        info!(count, "rows garbage collected");
    }

    Ok(())
}

fn init_tracing() {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
