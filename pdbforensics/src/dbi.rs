//! DBI (Debug Information) stream decoding (spec §4.4): section headers and the OMAP
//! address-translation table, reached by walking past the DBI header's substreams to the
//! Optional Debug Header substream.
//!
//! This reads only the two things the downstream symbol decoder needs. The module list, section
//! contributions, source file list, and type-server map substreams that make up the rest of the
//! real DBI stream are parsed by nothing here; they have no counterpart in the emitted JSON.

use crate::diag::Diags;
use anyhow::{bail, Context, Result};
use ms_coff::IMAGE_SECTION_HEADER;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::{LE, I32, U16, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

/// Fixed-size header at the start of stream 3 (DBI).
#[repr(C)]
#[derive(FromBytes, Unaligned, Immutable, KnownLayout, Debug, Clone)]
struct DbiStreamHeader {
    signature: I32<LE>,
    version: U32<LE>,
    age: U32<LE>,
    global_symbol_index_stream: U16<LE>,
    build_number: U16<LE>,
    public_symbol_index_stream: U16<LE>,
    pdb_dll_version: U16<LE>,
    global_symbol_stream: U16<LE>,
    pdb_dll_rbld: U16<LE>,
    mod_info_size: I32<LE>,
    section_contribution_size: I32<LE>,
    section_map_size: I32<LE>,
    source_info_size: I32<LE>,
    type_server_map_size: I32<LE>,
    mfc_type_server_index: U32<LE>,
    optional_dbg_header_size: I32<LE>,
    edit_and_continue_size: I32<LE>,
    flags: U16<LE>,
    machine: U16<LE>,
    padding: U32<LE>,
}

const DBI_STREAM_HEADER_LEN: usize = 64;
const_assert_eq!(std::mem::size_of::<DbiStreamHeader>(), DBI_STREAM_HEADER_LEN);

/// Index into the Optional Debug Header substream's stream-index array (spec §4.4 step 2).
const SN_OMAP_FROM_SRC: usize = 4;
const SN_SECTION_HDR: usize = 5;
const SN_SECTION_HDR_ORIG: usize = 10;

const NIL_STREAM: u16 = 0xffff;

/// One `IMAGE_SECTION_HEADER`'s worth of data this tool actually uses.
#[derive(Copy, Clone, Debug)]
pub struct SectionHeader {
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
}

/// One OMAP translation record (spec §3: "OMAP Entry").
#[derive(Copy, Clone, Debug)]
pub struct OmapEntry {
    pub from_rva: u32,
    pub to_rva: u32,
}

/// The subset of the DBI stream this tool needs: section headers and (if present) the OMAP.
pub struct DbiInfo {
    /// The stream index holding the global (public) symbol records (spec §4.5).
    pub sym_record_stream: u32,
    pub sections: Vec<SectionHeader>,
    /// Sorted ascending by `from_rva`, per spec §3 invariant. Empty if no OMAP is present.
    pub omap: Vec<OmapEntry>,
}

impl DbiInfo {
    /// Looks up the translated RVA for `query` (spec §4.5): finds the first entry whose
    /// `from_rva > query`, then backs up one entry unless the previous entry is already an exact
    /// match for `query` — matching the source's own bisect-then-adjust shape exactly, including
    /// its quirk of leaving `pos` at the following entry on an exact hit.
    ///
    /// Per spec §9 open question (i), a query before the first OMAP entry backs up to index `-1`
    /// in the source; this clamps to `0` and treats it as a miss instead. The mirrored case, a
    /// query at or past the last entry's `from_rva` with no following entry, is clamped the same
    /// way rather than indexing past the end.
    pub fn omap_lookup(&self, query: u32) -> u32 {
        if self.omap.is_empty() {
            return query;
        }

        let mut pos = self.omap.partition_point(|e| e.from_rva <= query);
        if pos == 0 {
            return 0;
        }
        if self.omap[pos - 1].from_rva != query {
            pos -= 1;
        }
        pos = pos.min(self.omap.len() - 1);

        let entry = &self.omap[pos];
        if entry.to_rva == 0 {
            return 0;
        }
        entry.to_rva + query.wrapping_sub(entry.from_rva)
    }

    /// Translates a (1-based section, offset) pair into a virtual address, applying the OMAP if
    /// one is present (spec §4.5).
    pub fn symbol_address(&self, segment: u16, offset: u32) -> Option<u32> {
        let section = self.sections.get(segment.checked_sub(1)? as usize)?;
        let raw = section.virtual_address.wrapping_add(offset);
        Some(self.omap_lookup(raw))
    }
}

fn read_u16_le(bytes: &[u8], offset: usize) -> Option<u16> {
    let slice: [u8; 2] = bytes.get(offset..offset + 2)?.try_into().ok()?;
    Some(u16::from_le_bytes(slice))
}

/// Reads the Optional Debug Header's stream index at array position `index`, treating `-1`
/// (`0xffff`) or a too-short array as absent.
fn optional_debug_header_stream(bytes: &[u8], index: usize) -> Option<u32> {
    let v = read_u16_le(bytes, index * 2)?;
    if v == NIL_STREAM {
        None
    } else {
        Some(v as u32)
    }
}

fn parse_sections(bytes: &[u8], diags: &mut Diags) -> Result<Vec<SectionHeader>> {
    let Ok((headers, rest)) =
        <[IMAGE_SECTION_HEADER]>::ref_from_prefix_with_elems(bytes, bytes.len() / 40)
    else {
        bail!("section header stream has an invalid layout");
    };
    if !rest.is_empty() {
        diags.warn(format!(
            "section header stream has {} trailing bytes that are not a full section header",
            rest.len()
        ));
    }
    Ok(headers
        .iter()
        .map(|h| SectionHeader {
            virtual_address: h.virtual_address,
            size_of_raw_data: h.size_of_raw_data,
        })
        .collect())
}

fn parse_omap(bytes: &[u8], diags: &mut Diags) -> Result<Vec<OmapEntry>> {
    let num_entries = bytes.len() / 8;
    if bytes.len() % 8 != 0 {
        diags.warn(format!(
            "OMAP stream length {} is not a multiple of 8",
            bytes.len()
        ));
    }
    let mut entries = Vec::with_capacity(num_entries);
    for i in 0..num_entries {
        let from_rva = u32::from_le_bytes(bytes[i * 8..i * 8 + 4].try_into().unwrap());
        let to_rva = u32::from_le_bytes(bytes[i * 8 + 4..i * 8 + 8].try_into().unwrap());
        entries.push(OmapEntry { from_rva, to_rva });
    }
    Ok(entries)
}

/// Parses the DBI stream (stream 3): the header, then the Optional Debug Header substream
/// reached by skipping the other five substreams, then sections and (if present) OMAP.
pub fn parse_dbi(
    msf: &ms_pdb_msf::Msf,
    diags: &mut Diags,
) -> Result<DbiInfo> {
    let dbi_bytes = msf
        .read_stream_to_vec(3)
        .context("reading DBI stream (stream 3)")?;

    let header = DbiStreamHeader::ref_from_prefix(&dbi_bytes)
        .map_err(|_| anyhow::anyhow!("DBI stream is shorter than the DBI header"))?
        .0;

    if header.signature.get() != -1 {
        bail!(
            "DBI header has an unexpected signature: {:#x}",
            header.signature.get()
        );
    }

    let sym_record_stream = header.global_symbol_stream.get();
    if sym_record_stream == NIL_STREAM {
        bail!("DBI header has no global symbol stream");
    }

    let substream_offset = DBI_STREAM_HEADER_LEN
        + non_negative(header.mod_info_size.get())?
        + non_negative(header.section_contribution_size.get())?
        + non_negative(header.section_map_size.get())?
        + non_negative(header.source_info_size.get())?
        + non_negative(header.type_server_map_size.get())?
        + non_negative(header.edit_and_continue_size.get())?;

    let dbg_header_size = non_negative(header.optional_dbg_header_size.get())?;
    let dbg_header_bytes = dbi_bytes
        .get(substream_offset..substream_offset + dbg_header_size)
        .context("DBI stream is too short to contain the Optional Debug Header substream")?;

    let sn_section_hdr_orig = optional_debug_header_stream(dbg_header_bytes, SN_SECTION_HDR_ORIG);
    let sn_section_hdr = optional_debug_header_stream(dbg_header_bytes, SN_SECTION_HDR);
    let sn_omap_from_src = optional_debug_header_stream(dbg_header_bytes, SN_OMAP_FROM_SRC);

    let (section_stream, omap_stream) = if let Some(orig) = sn_section_hdr_orig {
        (Some(orig), sn_omap_from_src)
    } else {
        (sn_section_hdr, None)
    };

    let sections = match section_stream {
        Some(s) => {
            let bytes = msf
                .read_stream_to_vec(s)
                .with_context(|| format!("reading section header stream {s}"))?;
            parse_sections(&bytes, diags)?
        }
        None => Vec::new(),
    };

    let omap = match omap_stream {
        Some(s) => {
            let bytes = msf
                .read_stream_to_vec(s)
                .with_context(|| format!("reading OMAP stream {s}"))?;
            parse_omap(&bytes, diags)?
        }
        None => Vec::new(),
    };

    Ok(DbiInfo {
        sym_record_stream: sym_record_stream as u32,
        sections,
        omap,
    })
}

fn non_negative(v: i32) -> Result<usize> {
    if v < 0 {
        bail!("DBI header contains a negative substream size: {v}");
    }
    Ok(v as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(pairs: &[(u32, u32)]) -> DbiInfo {
        DbiInfo {
            sym_record_stream: 0,
            sections: vec![SectionHeader { virtual_address: 0x1000, size_of_raw_data: 0x1000 }],
            omap: pairs
                .iter()
                .map(|&(from_rva, to_rva)| OmapEntry { from_rva, to_rva })
                .collect(),
        }
    }

    #[test]
    fn omap_lookup_translates_hit() {
        let dbi = entries(&[(0x1020, 0x5020), (0x1040, 0)]);
        assert_eq!(dbi.omap_lookup(0x1025), 0x5025);
    }

    #[test]
    fn omap_lookup_hole_returns_zero() {
        let dbi = entries(&[(0x1020, 0x5020), (0x1040, 0)]);
        assert_eq!(dbi.omap_lookup(0x1045), 0);
    }

    #[test]
    fn omap_lookup_before_first_entry_is_a_miss() {
        let dbi = entries(&[(0x2000, 0x9000)]);
        assert_eq!(dbi.omap_lookup(0x1000), 0);
    }

    #[test]
    fn omap_lookup_is_monotonic_across_nonzero_entries() {
        let dbi = entries(&[(0x1000, 0x4000), (0x2000, 0x5000), (0x3000, 0)]);
        let a = dbi.omap_lookup(0x1500);
        let b = dbi.omap_lookup(0x2500);
        assert!(b >= a);
    }

    #[test]
    fn symbol_address_without_omap_uses_raw_rva() {
        let dbi = DbiInfo { sym_record_stream: 0, sections: vec![SectionHeader { virtual_address: 0x1000, size_of_raw_data: 0x100 }], omap: Vec::new() };
        assert_eq!(dbi.symbol_address(1, 0x25), Some(0x1025));
    }
}
