use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "etxe",
    about = "Launch plugin processes and talk to them over a brokered gRPC transport",
    version,
    author,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output (use -vv for debug output)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the plugin described by a manifest and forward its output
    Launch {
        /// Path to the plugin manifest (YAML)
        manifest: PathBuf,
    },

    /// Parse and validate a plugin handshake line
    Handshake {
        /// The line a plugin printed on stdout
        line: String,

        /// Print the parsed record as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Launch { manifest } => commands::launch_command(&manifest).await?,
        Commands::Handshake { line, json } => commands::handshake_command(&line, json)?,
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbose {
        0 => EnvFilter::new("etxe=warn"),
        1 => EnvFilter::new("etxe=info"),
        _ => EnvFilter::new("etxe=debug"),
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}
