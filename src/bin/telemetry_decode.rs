//! Decode a captured station payload (file or stdin) and print the reading as JSON.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use newsfeeds::telemetry::decode::{decode, parse_fields};

#[derive(Parser)]
#[command(name = "telemetry-decode")]
#[command(about = "Decode a station telemetry payload into a canonical reading", long_about = None)]
struct Cli {
    /// Payload file; reads stdin when omitted or "-"
    input: Option<PathBuf>,

    /// Print the extracted key/value fields instead of the reading
    #[arg(long)]
    fields: bool,

    /// Single-line JSON
    #[arg(long)]
    compact: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let raw = match cli.input.as_deref() {
        Some(p) if p.as_os_str() != "-" => {
            std::fs::read(p).with_context(|| format!("reading {}", p.display()))?
        }
        _ => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("reading stdin")?;
            buf
        }
    };

    let value = if cli.fields {
        serde_json::to_value(parse_fields(&raw))?
    } else {
        serde_json::to_value(decode(&raw))?
    };
    let out = if cli.compact {
        serde_json::to_string(&value)?
    } else {
        serde_json::to_string_pretty(&value)?
    };
    println!("{out}");
    Ok(())
}
