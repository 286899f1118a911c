//! Symbol Decoder (spec §4.5): walks the global symbol stream named by the DBI header, keeping
//! only public symbols (`S_PUB32` / `S_PUB32_ST`) and resolving each one's address through the
//! section headers and OMAP the DBI Decoder already parsed.

use crate::dbi::DbiInfo;
use crate::diag::Diags;
use anyhow::{Context, Result};
use ms_codeview::syms::{is_public_symbol_leaf, PublicSymbol, SymIter};
use std::collections::BTreeMap;

/// Decodes every public symbol in the global symbol stream into `name -> address`.
///
/// Symbols whose address cannot be resolved (an out-of-range section) and records of any other
/// leaf type are semantic anomalies (spec §7 category 4): skipped, and warned about through
/// `diags`. A duplicate name overwrites the earlier entry, matching last-write-wins map insertion
/// semantics.
pub fn parse_symbols(
    msf: &ms_pdb_msf::Msf,
    dbi: &DbiInfo,
    diags: &mut Diags,
) -> Result<BTreeMap<String, serde_json::Value>> {
    let bytes = msf
        .read_stream_to_vec(dbi.sym_record_stream)
        .with_context(|| format!("reading global symbol stream {}", dbi.sym_record_stream))?;

    let mut symbols = BTreeMap::new();

    for record in SymIter::new(&bytes) {
        if !is_public_symbol_leaf(record.leaf_type) {
            diags.warn(format!(
                "symbol stream has a non-public record with leaf_type {:#x}; skipping",
                record.leaf_type
            ));
            continue;
        }

        let parsed = if record.leaf_type == ms_codeview::leaf::S_PUB32 {
            PublicSymbol::parse_v3(record.data)
        } else {
            PublicSymbol::parse_v2(record.data)
        };

        let sym = match parsed {
            Ok(sym) => sym,
            Err(_) => {
                diags.warn_with_bytes(
                    "failed to decode a public symbol record; skipping",
                    record.data,
                );
                continue;
            }
        };

        let Some(address) = dbi.symbol_address(sym.segment, sym.offset) else {
            diags.warn(format!(
                "public symbol '{}' names section {} which is out of range; skipping",
                sym.name, sym.segment
            ));
            continue;
        };

        symbols.insert(sym.name, serde_json::json!({ "address": address }));
    }

    Ok(symbols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbi::{OmapEntry, SectionHeader};

    fn dbi_with_one_section() -> DbiInfo {
        DbiInfo {
            sym_record_stream: 0,
            sections: vec![SectionHeader { virtual_address: 0x2000, size_of_raw_data: 0x1000 }],
            omap: Vec::new(),
        }
    }

    fn sym_record(leaf_type: u16, offset: u32, segment: u16, name: &str, v3: bool) -> Vec<u8> {
        let mut body = vec![];
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&offset.to_le_bytes());
        body.extend_from_slice(&segment.to_le_bytes());
        if v3 {
            body.extend_from_slice(name.as_bytes());
            body.push(0);
        } else {
            body.push(name.len() as u8);
            body.extend_from_slice(name.as_bytes());
        }

        let mut record = vec![];
        record.extend_from_slice(&((body.len() + 2) as u16).to_le_bytes());
        record.extend_from_slice(&leaf_type.to_le_bytes());
        record.extend_from_slice(&body);
        record
    }

    #[test]
    fn decodes_v3_public_symbol_with_address() {
        let dbi = dbi_with_one_section();
        let mut diags = Diags::new();
        let stream = sym_record(ms_codeview::leaf::S_PUB32, 0x10, 1, "foo", true);

        let mut symbols = BTreeMap::new();
        for record in SymIter::new(&stream) {
            let sym = PublicSymbol::parse_v3(record.data).unwrap();
            let address = dbi.symbol_address(sym.segment, sym.offset).unwrap();
            symbols.insert(sym.name, address);
        }
        let _ = &mut diags;

        assert_eq!(symbols["foo"], 0x2010);
    }

    #[test]
    fn v2_pascal_string_name_decodes() {
        let stream = sym_record(ms_codeview::leaf::S_PUB32_ST, 0x4, 1, "bar", false);
        let record = SymIter::new(&stream).next().unwrap();
        let sym = PublicSymbol::parse_v2(record.data).unwrap();
        assert_eq!(sym.name, "bar");
        assert_eq!(sym.offset, 0x4);
    }

    #[test]
    fn out_of_range_section_is_skipped_and_warned() {
        let dbi = dbi_with_one_section();
        let mut diags = Diags::new();
        let stream = sym_record(ms_codeview::leaf::S_PUB32, 0, 5, "ghost", true);

        let mut found = false;
        for record in SymIter::new(&stream) {
            let sym = PublicSymbol::parse_v3(record.data).unwrap();
            if dbi.symbol_address(sym.segment, sym.offset).is_none() {
                diags.warn(format!("public symbol '{}' names section {} which is out of range", sym.name, sym.segment));
            } else {
                found = true;
            }
        }
        assert!(!found);
        assert_eq!(diags.messages().len(), 1);
    }
}
