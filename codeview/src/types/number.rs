//! Extended numeric values (§4.2): a 16-bit field that is either an inline value or a tag
//! introducing a wider value in the bytes that follow.

use crate::leaf;
use crate::parser::{Parse, Parser, ParserError};

/// A numeric value read from a record: either the inline 16-bit value, or a leaf-type tag
/// followed by the wider value it introduces.
///
/// Every aggregate size, member offset, array size, and enumerator value in the TPI grammar is
/// read through this type, per the Design Notes' "dedicated cursor primitive" guidance.
#[derive(Copy, Clone, Debug)]
pub struct Number {
    /// The effective value, sign-extended to 64 bits.
    value: i64,
    /// Number of bytes consumed after the leading `u16` tag (0 for an inline value).
    trailing_len: usize,
}

impl Number {
    /// The effective value.
    pub fn value(&self) -> i64 {
        self.value
    }

    /// Number of bytes consumed by the extension, beyond the leading `u16`. Zero for an inline
    /// value.
    pub fn trailing_len(&self) -> usize {
        self.trailing_len
    }

    /// Total size in bytes of this numeric value's on-disk encoding (2 for an inline value).
    pub fn encoded_len(&self) -> usize {
        2 + self.trailing_len
    }
}

impl<'a> Parse<'a> for Number {
    fn from_parser(p: &mut Parser<'a>) -> Result<Self, ParserError> {
        let tag = p.u16()?;
        if tag < leaf::LF_CHAR {
            return Ok(Self { value: tag as i64, trailing_len: 0 });
        }

        match tag {
            leaf::LF_CHAR => Ok(Self { value: p.i8()? as i64, trailing_len: 1 }),
            leaf::LF_SHORT => Ok(Self { value: p.i16()? as i64, trailing_len: 2 }),
            leaf::LF_USHORT => Ok(Self { value: p.u16()? as i64, trailing_len: 2 }),
            leaf::LF_LONG => Ok(Self { value: p.i32()? as i64, trailing_len: 4 }),
            leaf::LF_ULONG => Ok(Self { value: p.u32()? as i64, trailing_len: 4 }),
            _ => Err(ParserError::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_value() {
        let bytes = 0x1234u16.to_le_bytes();
        let n: Number = Parser::new(&bytes).parse().unwrap();
        assert_eq!(n.value(), 0x1234);
        assert_eq!(n.encoded_len(), 2);
    }

    #[test]
    fn long_extension() {
        let mut bytes = leaf::LF_LONG.to_le_bytes().to_vec();
        bytes.extend_from_slice(&70_000i32.to_le_bytes());
        let n: Number = Parser::new(&bytes).parse().unwrap();
        assert_eq!(n.value(), 70_000);
        assert_eq!(n.encoded_len(), 6);
    }

    #[test]
    fn ushort_extension() {
        let mut bytes = leaf::LF_USHORT.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0xabcdu16.to_le_bytes());
        let n: Number = Parser::new(&bytes).parse().unwrap();
        assert_eq!(n.value(), 0xabcd);
    }

    #[test]
    fn unrecognized_tag_is_error() {
        let bytes = 0x8005u16.to_le_bytes();
        let result: Result<Number, _> = Parser::new(&bytes).parse();
        assert!(result.is_err());
    }
}
