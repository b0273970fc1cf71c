use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use distributed_fs::config::NodeConfig;
use distributed_fs::crypto::key::EncryptionKey;
use distributed_fs::node;
use distributed_fs::server::service::FileServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "dfs",
    version,
    about = "Peer-to-peer content-addressed file store"
)]
struct Cli {
    #[command(flatten)]
    node: NodeArgs,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct NodeArgs {
    /// TOML file with node settings
    #[arg(long, short = 'c', global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, global = true, env = "DFS_LISTEN", value_name = "ADDR")]
    listen: Option<String>,

    /// Owner ID to store files under. Nodes fetch each other's files only when they share
    /// it. When omitted, one is generated once and kept in the storage root
    #[arg(long, global = true, env = "DFS_OWNER_ID")]
    owner_id: Option<String>,

    /// Storage root directory
    #[arg(long, global = true, env = "DFS_ROOT", value_name = "DIR")]
    root: Option<PathBuf>,

    /// Cluster encryption key (64 hex characters)
    #[arg(long, global = true, env = "DFS_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Peers to dial on start
    #[arg(long, global = true, value_name = "ADDR", value_delimiter = ',')]
    bootstrap: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a node until Ctrl+C
    Start,
    /// Store a local file under its file name and replicate it
    Store { path: PathBuf },
    /// Fetch a key (locally or from the network)
    Get {
        key: String,
        /// Write the content here instead of stdout
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Delete a key locally and on every connected peer
    Delete { key: String },
    /// Print a fresh encryption key
    Keygen,
}

impl NodeArgs {
    fn load(self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_file(path)?,
            None => NodeConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if self.owner_id.is_some() {
            config.owner_id = self.owner_id;
        }
        if self.root.is_some() {
            config.storage_root = self.root;
        }
        if self.key.is_some() {
            config.encryption_key = self.key;
        }
        if !self.bootstrap.is_empty() {
            config.bootstrap_nodes = self.bootstrap;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Command::Keygen = cli.command {
        println!("{}", EncryptionKey::generate().to_hex());
        return Ok(());
    }

    let config = cli.node.load()?;
    if config.encryption_key.is_none() {
        tracing::warn!("No encryption key configured, generated one for this run only");
    }
    let expected_peers = config
        .bootstrap_nodes
        .iter()
        .filter(|addr| !addr.is_empty())
        .count();
    let fetch_timeout = Duration::from_millis(config.fetch_timeout_ms);

    let server = node::from_config(config)?;
    let addr = server.start().await?;
    tracing::info!("Node {} listening on {}", server.id(), addr);

    if let Command::Start = cli.command {
        tracing::info!("Press Ctrl+C to shutdown");
        tokio::signal::ctrl_c().await?;
        server.stop();
        return Ok(());
    }

    if !server.wait_for_peers(expected_peers, fetch_timeout).await {
        tracing::warn!(
            "Only {} of {} bootstrap peers connected",
            server.peer_count(),
            expected_peers
        );
    }

    let result = run_once(&server, cli.command).await;
    server.stop();
    result
}

async fn run_once(server: &Arc<FileServer>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Store { path } => {
            let key = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .with_context(|| format!("{} has no file name", path.display()))?;
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;

            let n = server.store(&key, file).await?;
            tracing::info!("Stored {} ({} bytes)", key, n);
        }
        Command::Get { key, out } => {
            let (size, mut file) = server.get(&key).await?;
            match out {
                Some(path) => {
                    let mut dst = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("failed to create {}", path.display()))?;
                    tokio::io::copy(&mut file, &mut dst).await?;
                    dst.flush().await?;
                    tracing::info!("Wrote {} ({} bytes) to {}", key, size, path.display());
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    tokio::io::copy(&mut file, &mut stdout).await?;
                    stdout.flush().await?;
                }
            }
        }
        Command::Delete { key } => {
            server.delete(&key).await?;
            tracing::info!("Deleted {}", key);
        }
        Command::Start | Command::Keygen => {}
    }

    Ok(())
}
