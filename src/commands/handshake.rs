use anyhow::{Context, Result};
use colored::Colorize;
use etxe::plugin::Handshake;
use etxe::plugin::certs::encode_handshake_cert;

pub fn handshake_command(line: &str, json: bool) -> Result<()> {
    let handshake = Handshake::parse(line).context("Invalid handshake line")?;
    let addr = handshake.addr().context("Invalid plugin address")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&handshake)?);
        return Ok(());
    }

    println!("{}", "Handshake OK".green().bold());
    println!("  core protocol: {}", handshake.core_protocol);
    println!("  app protocol:  {}", handshake.app_protocol);
    println!("  network:       {}", handshake.network);
    println!("  address:       {addr}");
    println!("  rpc protocol:  {}", handshake.rpc_protocol);
    match &handshake.server_cert {
        Some(cert) => {
            let encoded = encode_handshake_cert(cert);
            let preview = &encoded[..encoded.len().min(32)];
            println!("  server cert:   {} ({preview}...)", "present".cyan());
        }
        None => println!("  server cert:   {}", "none".dimmed()),
    }

    Ok(())
}
