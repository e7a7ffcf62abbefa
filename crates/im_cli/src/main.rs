use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use im_crypto::hash::hashed_nonce;
use im_intake::ProcessorSettings;
use im_proto::codec::decode_from_wire;
use im_proto::decoder::decode_body;
use im_proto::{Identity, MessageFlags, MessageType};
use im_store::ValidationLog;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "im-cli")]
#[command(about = "Inspect intake settings, message bodies and the validation log", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a message body and print it as JSON
    Decode {
        /// Message type byte, e.g. 0x01
        #[arg(short = 't', long = "type", value_parser = parse_byte)]
        type_byte: Option<u8>,

        /// Hex body. Without --type this is a padded plaintext with its type byte
        #[arg(short, long)]
        body: String,
    },

    /// Print the keyed hash the nonce store would see
    HashNonce {
        /// Receiving identity
        #[arg(short, long)]
        identity: String,

        /// 24-byte nonce in hex
        #[arg(short, long)]
        nonce: String,
    },

    /// Name the bits set in a flags byte
    Flags {
        #[arg(value_parser = parse_byte)]
        byte: u8,
    },

    /// List every known message type
    Types,

    /// Load and validate a settings file
    CheckSettings {
        path: PathBuf,
    },

    /// Show recent validation log entries
    Rejections {
        /// Settings file naming the log
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Log file, overrides the settings
        #[arg(short, long)]
        log: Option<PathBuf>,

        /// Maximum number of entries to print
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        /// Check the hash chain instead of printing entries
        #[arg(long)]
        verify: bool,
    },
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    parsed.map_err(|e| format!("invalid byte {s:?}: {e}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Decode { type_byte, body } => decode(type_byte, &body),
        Commands::HashNonce { identity, nonce } => hash_nonce(&identity, &nonce),
        Commands::Flags { byte } => {
            let names = MessageFlags(byte).names();
            if names.is_empty() {
                println!("0x{byte:02x}: none");
            } else {
                println!("0x{byte:02x}: {}", names.join(", "));
            }
            Ok(())
        }
        Commands::Types => {
            for &ty in MessageType::ALL {
                println!("0x{:02x}  {ty:?}", ty as u8);
            }
            Ok(())
        }
        Commands::CheckSettings { path } => check_settings(&path),
        Commands::Rejections {
            settings,
            log,
            limit,
            verify,
        } => rejections(settings, log, limit, verify),
    }
}

fn decode(type_byte: Option<u8>, body_hex: &str) -> Result<()> {
    let raw = hex::decode(body_hex.trim()).context("body is not valid hex")?;
    let (type_byte, body) = match type_byte {
        Some(b) => (b, raw.as_slice()),
        None => decode_from_wire(&raw).map_err(|e| anyhow!("bad padded plaintext: {e}"))?,
    };
    debug!(type_byte, len = body.len(), "decoding body");
    let decoded = decode_body(type_byte, body).with_context(|| format!("type 0x{type_byte:02x}"))?;
    println!("{}", serde_json::to_string_pretty(&decoded)?);
    Ok(())
}

fn hash_nonce(identity: &str, nonce_hex: &str) -> Result<()> {
    let identity: Identity = identity.parse().context("invalid identity")?;
    let nonce = hex::decode(nonce_hex.trim()).context("nonce is not valid hex")?;
    if nonce.len() != 24 {
        bail!("nonce must be 24 bytes, got {}", nonce.len());
    }
    let hashed = hashed_nonce(identity.as_str(), &nonce)?;
    println!("{}", hex::encode(hashed));
    Ok(())
}

fn check_settings(path: &Path) -> Result<()> {
    let settings = ProcessorSettings::load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let versions = settings.version_range()?;
    println!("settings ok");
    println!("  forward security: {}", if settings.forward_security.enabled { "enabled" } else { "disabled" });
    println!("  versions: {}..={}", versions.min, versions.max);
    println!("  max skip: {}", settings.forward_security.max_counter_skip);
    println!("  batch concurrency: {}", settings.limits.max_batch_concurrency);
    Ok(())
}

fn rejections(settings: Option<PathBuf>, log: Option<PathBuf>, limit: usize, verify: bool) -> Result<()> {
    let log = match (log, settings) {
        (Some(path), _) => ValidationLog::open(path, u64::MAX)?,
        (None, Some(path)) => ProcessorSettings::load(&path)?
            .open_validation_log()?
            .ok_or_else(|| anyhow!("validation log is disabled in {}", path.display()))?,
        (None, None) => bail!("pass --log or --settings"),
    };

    if verify {
        let count = log.verify().context("hash chain is broken")?;
        println!("{count} entries, chain intact");
        return Ok(());
    }

    for record in log.read_recent(Some(limit))? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}
