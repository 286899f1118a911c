//! Symbol-stream record decoding (§4.5): the two public-symbol leaf kinds this tool interprets,
//! and the iterator that walks a symbol stream's `length`-prefixed records.

use crate::leaf;
use crate::parser::Parser;
use crate::types::record::latin1_to_string;

/// A decoded public symbol (`S_PUB32` / `S_PUB32_ST`).
#[derive(Clone, Debug)]
pub struct PublicSymbol {
    /// `CV_PUBSYMFLAGS`, unused by the emitter but kept for completeness.
    pub flags: u32,
    /// Offset within `segment`.
    pub offset: u32,
    /// 1-based section index.
    pub segment: u16,
    /// Symbol name.
    pub name: String,
}

impl PublicSymbol {
    /// Decodes a `S_PUB32` (`leaf_type == 0x110e`) payload: `flags, offset, segment, name` with
    /// a NUL-terminated name.
    pub fn parse_v3(data: &[u8]) -> Result<Self, crate::parser::ParserError> {
        let mut p = Parser::new(data);
        let flags = p.u32()?;
        let offset = p.u32()?;
        let segment = p.u16()?;
        let name = latin1_to_string(p.strz()?.as_ref());
        Ok(Self { flags, offset, segment, name })
    }

    /// Decodes a `S_PUB32_ST` (`leaf_type == 0x1009`) payload: `flags, offset, segment, name`
    /// with a Pascal-string name.
    pub fn parse_v2(data: &[u8]) -> Result<Self, crate::parser::ParserError> {
        let mut p = Parser::new(data);
        let flags = p.u32()?;
        let offset = p.u32()?;
        let segment = p.u16()?;
        let name = latin1_to_string(p.strt_raw()?.as_ref());
        Ok(Self { flags, offset, segment, name })
    }
}

/// One raw record from a symbol stream, before leaf-specific decoding.
#[derive(Copy, Clone, Debug)]
pub struct SymRecord<'a> {
    /// The record's `leaf_type` tag.
    pub leaf_type: u16,
    /// The payload, i.e. everything after `length` and `leaf_type`.
    pub data: &'a [u8],
}

/// Iterates `length:u16, leaf_type:u16, payload` records in a symbol stream. Each record
/// consumes `length + 2` bytes total; a record whose declared length exceeds the remaining
/// stream data ends iteration (the caller should treat this as a fatal grammar violation, per
/// §7 category 3, if it happens before the stream is expected to end).
pub struct SymIter<'a> {
    data: &'a [u8],
}

impl<'a> SymIter<'a> {
    /// Creates a new symbol-record iterator over a stream's raw bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// The number of bytes not yet consumed.
    pub fn remaining_len(&self) -> usize {
        self.data.len()
    }
}

impl<'a> Iterator for SymIter<'a> {
    type Item = SymRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }

        let mut p = Parser::new(self.data);
        let length = p.u16().ok()? as usize;
        if length < 2 {
            return None;
        }
        let leaf_type = p.u16().ok()?;
        let data = p.bytes(length - 2).ok()?;
        self.data = p.take_rest();

        Some(SymRecord { leaf_type, data })
    }
}

/// Whether a symbol-record leaf type is one of the two public-symbol kinds this tool
/// interprets (§4.5). Any other leaf type is a semantic anomaly: skip the record and warn.
pub fn is_public_symbol_leaf(leaf_type: u16) -> bool {
    matches!(leaf_type, leaf::S_PUB32 | leaf::S_PUB32_ST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_two_records() {
        let mut data = vec![];
        data.extend_from_slice(&6u16.to_le_bytes());
        data.extend_from_slice(&leaf::S_PUB32.to_le_bytes());
        data.extend_from_slice(&[1, 2, 3, 4]);
        data.extend_from_slice(&4u16.to_le_bytes());
        data.extend_from_slice(&leaf::S_PUB32_ST.to_le_bytes());
        data.extend_from_slice(&[9, 9]);

        let recs: Vec<_> = SymIter::new(&data).collect();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].leaf_type, leaf::S_PUB32);
        assert_eq!(recs[0].data, &[1, 2, 3, 4]);
        assert_eq!(recs[1].data, &[9, 9]);
    }

    #[test]
    fn parses_v3_public_symbol() {
        let mut data = vec![];
        data.extend_from_slice(&0u32.to_le_bytes()); // flags
        data.extend_from_slice(&0x25u32.to_le_bytes()); // offset
        data.extend_from_slice(&1u16.to_le_bytes()); // segment
        data.extend_from_slice(b"MySymbol\0");

        let sym = PublicSymbol::parse_v3(&data).unwrap();
        assert_eq!(sym.offset, 0x25);
        assert_eq!(sym.segment, 1);
        assert_eq!(sym.name, "MySymbol");
    }

    #[test]
    fn parses_v2_public_symbol() {
        let mut data = vec![];
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0x40u32.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.push(3);
        data.extend_from_slice(b"abc");

        let sym = PublicSymbol::parse_v2(&data).unwrap();
        assert_eq!(sym.offset, 0x40);
        assert_eq!(sym.name, "abc");
    }
}
