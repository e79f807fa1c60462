mod aefrp;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use aefrp::identity::Identity;

#[derive(Debug, Parser)]
#[command(
    name = "aefrp",
    version,
    about = "aefrp - fake-P2P rooms over a relay, keyed by certificate fingerprints"
)]
struct Cli {
    /// Path to aefrp config file (.toml/.yaml/.yml). If omitted, uses AEFRP_CONFIG; then auto-detects aefrp.toml > aefrp.yaml > aefrp.yml from CWD; then falls back to the OS default path (Linux: /etc/aefrp/aefrp.toml; others: user config dir).
    #[arg(long, env = "AEFRP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a new identity key and print its fingerprint.
    Keygen {
        #[arg(long, default_value = "aefrp.key")]
        out: PathBuf,
    },
    /// Print the fingerprint of an existing identity key.
    Fingerprint {
        #[arg(long, default_value = "aefrp.key")]
        key: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        None => aefrp::run(cli.config).await,
        Some(Command::Keygen { out }) => {
            if out.exists() {
                anyhow::bail!("keygen: {} already exists", out.display());
            }
            let id = Identity::generate()?;
            id.save(&out)?;
            println!("{}", id.fingerprint());
            Ok(())
        }
        Some(Command::Fingerprint { key }) => {
            let pem = std::fs::read_to_string(&key)
                .with_context(|| format!("fingerprint: read {}", key.display()))?;
            let id = Identity::from_pem(&pem)?;
            println!("{}", id.fingerprint());
            Ok(())
        }
    }
}
