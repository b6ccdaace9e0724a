// Copyright 2024 Fused Structures Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

/// This is the main entry point for the Fusion CLI application.
///
/// The application builds an in-process cluster of primaries and backups, replays a demo or a
/// JSON scenario script against it and prints the outcome of every step as JSON.
/// It uses the `clap` crate for command-line argument parsing and `stderrlog` for logging.
use clap::{Args, Parser, Subcommand};
use clap_stdin::FileOrStdin;
use stderrlog::Timestamp;

use fusion::Config;
use fusion_transport::StructureKind;

mod script;
use script::Script;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Number of primaries in the cluster.
    #[arg(long, env = "FUSION_PRIMARIES", default_value_t = 3)]
    primaries: usize,

    /// Number of backups, which is also the number of tolerated faults.
    #[arg(long, env = "FUSION_FAULTS", default_value_t = 3)]
    faults: usize,

    /// Query the backups one after another during recovery.
    #[arg(long)]
    sequential_fetch: bool,

    /// Increase logging verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Silence all logging.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    Demo(DemoArgs),
    Replay(ReplayArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum KindArg {
    List,
    Map,
    Queue,
}

impl From<KindArg> for StructureKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::List => StructureKind::List,
            KindArg::Map => StructureKind::Map,
            KindArg::Queue => StructureKind::Queue,
        }
    }
}

#[derive(Args)]
struct DemoArgs {
    #[arg(short, long, value_enum, default_value_t = KindArg::List)]
    kind: KindArg,

    /// Comma separated ordinals of the primaries to fail and recover.
    #[arg(long, value_delimiter = ',', default_value = "0")]
    fail: Vec<usize>,
}

#[derive(Args)]
struct ReplayArgs {
    /// JSON scenario script, `-` reads it from stdin.
    script: FileOrStdin,
}

#[derive(Debug, thiserror::Error)]
enum ConfigError {
    #[error("Failed to read scenario script: {0}")]
    UnreadableScript(String),
    #[error("Invalid scenario script: {0}")]
    InvalidScript(#[from] serde_json::Error),
}

impl Cli {
    fn config(&self) -> Config {
        Config::new(!self.sequential_fetch)
    }
}

async fn read_script(input: FileOrStdin) -> Result<Script, ConfigError> {
    let contents = input
        .contents_async()
        .await
        .map_err(|e| ConfigError::UnreadableScript(e.to_string()))?;
    Ok(serde_json::from_str(&contents)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    stderrlog::new()
        .module(module_path!())
        .verbosity(1 + cli.verbose as usize)
        .quiet(cli.quiet)
        .timestamp(Timestamp::Millisecond)
        .init()?;

    let config = cli.config();
    let script = match cli.command {
        Commands::Demo(args) => Script::demo(args.kind.into(), cli.primaries, args.fail),
        Commands::Replay(args) => read_script(args.script).await?,
    };

    let outcomes = script.replay(cli.primaries, cli.faults, config).await?;
    println!("{}", serde_json::to_string_pretty(&outcomes)?);

    Ok(())
}
