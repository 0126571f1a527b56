//! Buffer inspector - summarise or dump the transient buffer WAL

use anyhow::Result;
use clap::Parser;
use common::Symbol;
use price_sampler::storage::DEFAULT_MAX_RECORDS_PER_SYMBOL;
use price_sampler::{TransientStore, WalTransientStore};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "buffer-inspect")]
#[command(about = "Inspect the price sampler transient buffer")]
struct Cli {
    /// WAL directory
    #[arg(long, default_value = "./data/sampler-wal")]
    dir: PathBuf,

    /// Print every buffered record of this symbol
    #[arg(long)]
    symbol: Option<String>,

    /// Delete segments that no longer hold live records
    #[arg(long)]
    compact: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if !cli.dir.exists() {
        anyhow::bail!("Buffer directory not found: {}", cli.dir.display());
    }

    // the bound only applies to appends, inspection never appends
    let store = WalTransientStore::open(&cli.dir, None, DEFAULT_MAX_RECORDS_PER_SYMBOL)?;

    let stats = store.stats().await?;
    println!("Buffer at {}", cli.dir.display());
    println!(
        "  {} segments, {} bytes, {} log entries",
        stats.segment_count, stats.total_size, stats.total_entries
    );

    match cli.symbol {
        Some(symbol) => dump_symbol(&store, &Symbol::new(symbol)).await?,
        None => summarise(&store).await?,
    }

    if cli.compact {
        let removed = store.compact().await?;
        println!("\nCompaction removed {removed} segments");
    }

    Ok(())
}

async fn summarise(store: &WalTransientStore) -> Result<()> {
    let symbols = store.symbols().await?;
    if symbols.is_empty() {
        println!("\nNo buffered records");
        return Ok(());
    }

    println!("\n{:<12} {:>8}  {:<24}  {:<24}", "SYMBOL", "RECORDS", "FIRST", "LAST");
    for symbol in symbols {
        let records: Vec<_> = store.all(&symbol).await?.collect();
        let first = records.iter().map(|r| r.observed_at).min();
        let last = records.iter().map(|r| r.observed_at).max();
        println!(
            "{:<12} {:>8}  {:<24}  {:<24}",
            symbol.as_str(),
            records.len(),
            first.map(|t| t.to_string()).unwrap_or_default(),
            last.map(|t| t.to_string()).unwrap_or_default()
        );
    }
    Ok(())
}

async fn dump_symbol(store: &WalTransientStore, symbol: &Symbol) -> Result<()> {
    let records = store.all(symbol).await?;
    println!("\n{} buffered records of {}", records.len(), symbol);
    for record in records {
        println!("  {}  {}", record.observed_at, record.price);
    }
    Ok(())
}
