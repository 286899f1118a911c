#![forbid(unused_must_use)]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

/// Decodes a PDB's types, enums, and public symbols into a JSON document.
#[derive(clap::Parser)]
struct CommandWithFlags {
    /// Path to the input PDB file.
    #[arg(long)]
    filename: PathBuf,

    /// Path to write the JSON document to.
    #[arg(long, default_value = "file.out")]
    output: PathBuf,

    /// Reduce logging to just warnings and errors.
    #[arg(long)]
    quiet: bool,

    /// Turn on debug-level logging. Noisy!
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = CommandWithFlags::parse();
    configure_tracing(&args);

    let filename = strip_file_scheme(&args.filename);
    let doc = pdbforensics::decode_pdb(&filename)
        .with_context(|| format!("decoding {}", filename.display()))?;

    let json = serde_json::to_string_pretty(&doc).context("serializing JSON document")?;
    std::fs::write(&args.output, json)
        .with_context(|| format!("writing {}", args.output.display()))?;

    Ok(())
}

/// Accepts `--filename` given as a `file:` URL (spec §6) in addition to a plain path.
fn strip_file_scheme(path: &std::path::Path) -> PathBuf {
    match path.to_str() {
        Some(s) if s.starts_with("file://") => PathBuf::from(&s["file://".len()..]),
        Some(s) if s.starts_with("file:") => PathBuf::from(&s["file:".len()..]),
        _ => path.to_path_buf(),
    }
}

fn configure_tracing(args: &CommandWithFlags) {
    use tracing_subscriber::filter::LevelFilter;

    let max_level = if args.quiet {
        LevelFilter::WARN
    } else if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let _ = tracing_subscriber::fmt().with_max_level(max_level).try_init();
}
