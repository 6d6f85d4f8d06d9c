use anyhow::{Context, Result};
use colored::Colorize;
use etxe::plugin::{Client, PluginManifest};
use std::path::Path;
use tracing::{info, warn};

pub async fn launch_command(manifest_path: &Path) -> Result<()> {
    let manifest = PluginManifest::load(manifest_path)?;
    let base_dir = manifest_path.parent().unwrap_or(Path::new("."));
    let config = manifest.into_client_config(base_dir)?;

    let client = Client::new(config);
    let result = run(&client).await;

    client.kill().await;
    if let Some(status) = client.exit_status() {
        println!("Plugin exited: {status}");
    }

    result
}

async fn run(client: &Client) -> Result<()> {
    let addr = client.start().await.context("Failed to start plugin")?;
    let rpc = client.client().await.context("Failed to connect to plugin")?;

    println!(
        "{} plugin at {} (protocol version {})",
        "Connected to".green().bold(),
        addr,
        rpc.negotiated().version
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            info!("interrupted, stopping plugin");
        }
        _ = client.wait_exit() => warn!("plugin exited on its own"),
    }

    Ok(())
}
