//! fi-tool: inspect and export a filter index
//!
//! Works on `-read` copies of the repositories, so it can run next to a
//! live indexer.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash, Network};
use clap::{Args, Parser, Subcommand};
use fi_01_golomb_filters::{build_block_filter, FilterModel, DEFAULT_P};
use fi_02_record_store::adapters::keyed_log::with_suffix;
use fi_02_record_store::{
    FilterCodec, FilterRepository, IndexEntryCodec, RecordLog, ScanReport, ScanStop, UtxoCodec,
    UtxoRepository, FILTER_DATA_FILE, FILTER_INDEX_FILE,
};
use fi_03_index_builder::config::parse_network;
use fi_03_index_builder::IndexerConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fi-tool")]
#[command(about = "Inspect and export compact block filter indexes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print filter lines, optionally only those after a block hash
    Export {
        #[command(flatten)]
        store: StoreArgs,
        /// Only print blocks after this hash
        #[arg(long)]
        after: Option<BlockHash>,
    },
    /// Scan the logs and report record counts and damage
    Verify {
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Print the filter line of a hex-encoded block
    FilterBlock {
        /// File holding the consensus-encoded block as hex
        #[arg(long)]
        block: PathBuf,
        #[arg(long, default_value_t = DEFAULT_P)]
        p: u8,
    },
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// JSON config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// bitcoin, testnet, signet or regtest
    #[arg(long, value_parser = parse_network)]
    network: Option<Network>,
}

impl StoreArgs {
    fn resolve(&self) -> Result<IndexerConfig> {
        let mut config = match &self.config {
            Some(path) => IndexerConfig::load(path)?,
            None => IndexerConfig::default(),
        };
        config.apply_env_overrides()?;
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(network) = self.network {
            config.network = network;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Export { store, after } => export(&store.resolve()?, after),
        Command::Verify { store } => verify(&store.resolve()?),
        Command::FilterBlock { block, p } => filter_block(&block, p),
    }
}

fn export(config: &IndexerConfig, after: Option<BlockHash>) -> Result<()> {
    let mut filters = FilterRepository::open_snapshot(config.filter_dir(), config.filter_p)
        .with_context(|| format!("opening filters in {}", config.filter_dir().display()))?;
    let start = config.resolved_start_height()?;

    let mut models = Vec::new();
    for (i, (key, filter)) in filters.entries()?.into_iter().enumerate() {
        let height = u32::try_from(u64::from(start) + i as u64).context("height overflow")?;
        models.push(FilterModel::new(height, BlockHash::from_byte_array(key), Some(filter)));
    }

    let skip = match after {
        Some(hash) => match models.iter().position(|m| m.block_hash == hash) {
            Some(i) => i + 1,
            None => bail!("block {hash} is not in the index"),
        },
        None => 0,
    };
    for model in &models[skip..] {
        println!("{}", model.to_line());
    }
    Ok(())
}

fn verify(config: &IndexerConfig) -> Result<()> {
    let filter_dir = config.filter_dir();
    let utxo_base = config.utxo_base();
    let codec = FilterCodec::new(config.filter_p);

    report("filters.dat", &RecordLog::inspect(filter_dir.join(FILTER_DATA_FILE), &codec)?);
    report("filters.idx", &RecordLog::inspect(filter_dir.join(FILTER_INDEX_FILE), &IndexEntryCodec)?);
    report("utxos.dat", &RecordLog::inspect(with_suffix(&utxo_base, ".dat"), &UtxoCodec)?);
    report("utxos.idx", &RecordLog::inspect(with_suffix(&utxo_base, ".idx"), &IndexEntryCodec)?);

    let filters = FilterRepository::open_snapshot(&filter_dir, config.filter_p)?;
    println!(
        "filters: {} live, {} tombstoned",
        filters.len(),
        filters.entry_count() - filters.len()
    );
    let utxos = UtxoRepository::open_snapshot(&utxo_base, config.utxo.clone())?;
    println!(
        "unspent outputs: {} live, {} tombstoned",
        utxos.len(),
        utxos.tombstones()
    );
    Ok(())
}

fn report(name: &str, scan: &ScanReport) {
    match &scan.stop {
        ScanStop::End => println!("{name}: {} records, {} bytes", scan.records, scan.valid_len),
        ScanStop::Corrupt { offset, reason } => println!(
            "{name}: {} records, corrupt at {offset} ({reason}), {} of {} bytes unreadable",
            scan.records,
            scan.file_len - scan.valid_len,
            scan.file_len
        ),
    }
}

fn filter_block(path: &Path, p: u8) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let bytes = hex::decode(text.trim()).context("block file is not hex")?;
    let block: Block = bitcoin::consensus::deserialize(&bytes).context("decoding block")?;

    let filter = build_block_filter(&block, p)?;
    let model = FilterModel::new(0, block.block_hash(), Some(filter));
    println!("{}", model.to_line());
    Ok(())
}
