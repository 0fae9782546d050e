//! Minimal terminal node.
//!
//! Starts the mesh core, prints decoded traffic and peer events, and
//! broadcasts stdin lines. Useful for bring-up against phones and other
//! nodes; the real UI is a separate collaborator.

use std::io::Write as _;

use anyhow::Result;
use bitmesh::{Config, MeshCore, PowerProfile};
use log::info;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let nickname = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "anonymous".to_string());
    let data_dir = std::env::var("BITMESH_DATA_DIR").unwrap_or_else(|_| ".bitmesh".to_string());

    // A real host supplies the master key from its keystore; the demo
    // derives one from an environment passphrase.
    let passphrase = std::env::var("BITMESH_PASSPHRASE").unwrap_or_default();
    let master_key: [u8; 32] = Sha256::digest(passphrase.as_bytes()).into();

    let mut config = Config::new(nickname.clone(), data_dir, master_key);
    config.power_profile = PowerProfile::Balanced;

    let core = MeshCore::start(config).await?;
    info!("node fingerprint: {}", core.fingerprint());

    core.subscribe(
        |message| {
            let text = String::from_utf8_lossy(&message.payload);
            println!("<{}> {}", message.sender, text);
            let _ = std::io::stdout().flush();
        },
        |event| {
            println!("* {:?}", event);
            let _ = std::io::stdout().flush();
        },
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim() == "/quit" => break,
                    Some(line) if !line.trim().is_empty() => {
                        core.broadcast(line.into_bytes()).await?;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    core.stop().await;
    Ok(())
}
