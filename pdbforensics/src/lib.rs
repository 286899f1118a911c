//! Decodes a Microsoft Program Database (PDB) file into a language-neutral JSON description of
//! its user-defined types, enumerations, primitive base types, and global symbols, for a
//! memory-forensics toolchain that has no access to the original compiler.
//!
//! The pipeline: open the MSF container, decode the TPI (type) and DBI (debug info) streams,
//! decode the global symbol stream using the sections and OMAP the DBI decoder produced, then
//! assemble everything into the emitted JSON document (see [`decode_pdb`]).

#![warn(missing_docs)]

mod dbi;
mod diag;
mod symbols;
mod tpi;

use anyhow::{bail, Context, Result};
use ms_pdb_msf::{Msf, MsfKind};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, trace_span, warn};

pub use diag::Diags;

/// Per-invocation mutable state accumulated while decoding one PDB (spec §9 "Global mutable
/// state"): every map here is emitted, sorted by key, into the final JSON document.
#[derive(Default)]
pub struct Session {
    bases: BTreeMap<String, serde_json::Value>,
    user_types: BTreeMap<String, serde_json::Value>,
    enumerations: BTreeMap<String, serde_json::Value>,
    symbols: BTreeMap<String, serde_json::Value>,
}

impl Session {
    /// Serializes the accumulated state into the emitted JSON document shape (spec §4.6 / §6).
    pub fn into_json(self) -> serde_json::Value {
        serde_json::json!({
            "user_types": self.user_types,
            "enums": self.enumerations,
            "base_types": self.bases,
            "symbols": self.symbols,
        })
    }
}

/// Decodes the PDB at `path` and returns the assembled JSON document (spec §4.6).
///
/// Fatal conditions (container corruption, grammar violations, out-of-range type references) are
/// returned as `Err`; semantic anomalies (spec §7 category 4) are logged through `tracing::warn!`
/// and the offending record is skipped, and the decode otherwise continues to completion.
pub fn decode_pdb(path: &Path) -> Result<serde_json::Value> {
    let _span = trace_span!("decode_pdb", path = %path.display()).entered();
    let mut diags = Diags::new();

    let msf = {
        let _span = trace_span!("open_msf").entered();
        let msf = Msf::open(path).with_context(|| format!("opening {}", path.display()))?;
        if msf.kind() == MsfKind::Small {
            bail!(
                "{} uses the obsolete Small MSF header; only Big MSF (\"MSF 7.0\") PDBs are supported",
                path.display()
            );
        }
        msf
    };
    info!(num_streams = msf.num_streams(), "opened MSF container");

    let type_table = {
        let _span = trace_span!("decode_tpi").entered();
        tpi::TypeTable::parse(&msf).context("decoding TPI stream")?
    };

    let dbi_info = {
        let _span = trace_span!("decode_dbi").entered();
        dbi::parse_dbi(&msf, &mut diags).context("decoding DBI stream")?
    };

    let symbols = {
        let _span = trace_span!("decode_symbols").entered();
        symbols::parse_symbols(&msf, &dbi_info, &mut diags).context("decoding symbol stream")?
    };

    let (user_types, enumerations, bases) = {
        let _span = trace_span!("emit_types").entered();
        type_table.emit_aggregates(&mut diags).context("emitting user types and enums")?
    };

    if !diags.messages().is_empty() {
        warn!(count = diags.messages().len(), "decode completed with anomalies");
    }

    let session = Session { bases, user_types, enumerations, symbols };
    Ok(session.into_json())
}
