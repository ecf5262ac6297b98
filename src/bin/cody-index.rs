//! Standalone indexer: walks a project and fills the on-disk vector index
//! the backend serves from. Same settings as `cody serve`.

use anyhow::{Context, Result};
use clap::Parser;
use cody::config::ServerConfig;
use cody::server::indexer::index_project;
use cody::server::vector::{LocalVectorIndex, OpenAiEmbedder};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "cody-index",
    about = "Index a codebase for retrieval-augmented prompting"
)]
struct Cli {
    /// Project root to index
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Optional cody.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the index file location
    #[arg(long)]
    index: Option<PathBuf>,

    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ServerConfig::load(cli.config.as_deref())?;
    cody::logging::init(cli.debug || config.debug);
    config.validate()?;
    if let Some(index) = cli.index {
        config.index_path = index;
    }

    let root = cli
        .path
        .canonicalize()
        .with_context(|| format!("cannot index {}", cli.path.display()))?;
    let embedder = OpenAiEmbedder::from_config(&config).context("embedding client unavailable")?;
    let index = LocalVectorIndex::open(&config.index_path, Arc::new(embedder))
        .with_context(|| format!("failed to open index at {}", config.index_path.display()))?;

    let report = index_project(&root, &index).await?;
    println!("{}", report.summary());
    if report.failed_batches > 0 {
        anyhow::bail!("{} batch(es) failed to index", report.failed_batches);
    }
    Ok(())
}
