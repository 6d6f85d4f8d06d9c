use anyhow::Result;
use etxe::plugin::{HandshakeConfig, ServeConfig, serve};
use tokio::io::{AsyncWriteExt, duplex};

const PLUGIN_NAME: &str = "etxe-plugin-echo";
const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

fn handshake() -> HandshakeConfig {
    HandshakeConfig {
        protocol_version: 1,
        magic_cookie_key: "ETXE_PLUGIN".to_string(),
        magic_cookie_value: "d2a1c5e0".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Real stdout carries the handshake line, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("etxe_plugin_echo=info".parse()?),
        )
        .with_target(false)
        .without_time()
        .init();

    tracing::info!("Starting {PLUGIN_NAME} v{PLUGIN_VERSION}");

    let (mut stdout, stdout_source) = duplex(4096);
    let (mut stderr, stderr_source) = duplex(4096);

    let mut config = ServeConfig::new(handshake()).with_services(1, |router, _broker| router);
    config.stdout = Some(Box::new(stdout_source));
    config.stderr = Some(Box::new(stderr_source));

    tokio::spawn(async move {
        let greeting = format!("hello from {PLUGIN_NAME}\n");
        if stdout.write_all(greeting.as_bytes()).await.is_ok() {
            let _ = stderr.write_all(b"echo plugin ready\n").await;
        }
    });

    serve(config).await?;
    tracing::info!("{PLUGIN_NAME} stopped");
    Ok(())
}
