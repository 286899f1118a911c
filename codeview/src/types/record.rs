//! The CodeView type-record grammar (§4.3): decodes one TPI record body, given the `leaf_type`
//! tag that the caller has already split off the front of the record.

use crate::leaf;
use crate::parser::{Parser, ParserError};
use crate::types::{TypeRef, TypeRefLe};

/// One field of a `LF_FIELDLIST`.
#[derive(Clone, Debug)]
pub enum FieldRecord {
    /// `LF_MEMBER` / `LF_MEMBER_ST`.
    Member {
        /// `CV_fldattr_t`, unused by the emitter but kept for completeness.
        attributes: u16,
        /// Type of the field.
        field_type: TypeRef,
        /// Byte offset within the containing aggregate.
        offset: i64,
        /// Field name.
        name: String,
    },
    /// `LF_ENUMERATE`.
    Enumerate {
        /// `CV_fldattr_t`.
        attributes: u16,
        /// The constant's value.
        value: i64,
        /// Constant name.
        name: String,
    },
}

/// The decoded body of one TPI record.
#[derive(Clone, Debug)]
pub enum RecordKind {
    /// `LF_STRUCTURE[_ST]` / `LF_CLASS[_ST]` / `LF_INTERFACE`.
    Aggregate {
        /// `true` for `LF_UNION`, `false` for struct/class/interface.
        is_union: bool,
        /// `CV_prop_t`. Bit 0x80 is `forward_reference`; the spec only needs that one bit, but
        /// the whole field is kept since downstream consumers may want the rest (packed, etc).
        properties: u16,
        /// Reference to the `LF_FIELDLIST` record describing this aggregate's members.
        field_list: TypeRef,
        /// Size in bytes.
        size: i64,
    },
    /// `LF_ENUM[_ST]`.
    Enum {
        /// `CV_prop_t`.
        properties: u16,
        /// The enum's underlying integer type.
        subtype: TypeRef,
        /// Reference to the `LF_FIELDLIST` record listing the enumerators.
        fields: TypeRef,
    },
    /// `LF_POINTER`.
    Pointer {
        /// The pointee type.
        subtype: TypeRef,
        /// Pointer size in bytes, decoded from the attributes bitfield.
        size: u32,
    },
    /// `LF_MODIFIER`. Transparent: queries forward to `subtype`.
    Modifier {
        /// The modified type.
        subtype: TypeRef,
    },
    /// `LF_PROCEDURE` / `LF_MFUNCTION`. Opaque.
    Function,
    /// `LF_BITFIELD`.
    Bitfield {
        /// The field's underlying storage type.
        underlying_type: TypeRef,
        /// Bit-field width.
        length: u8,
        /// Bit-field starting position.
        position: u8,
    },
    /// `LF_ARRAY[_ST]` / `LF_STRIDED_ARRAY`.
    Array {
        /// Element type. Forward-referenced if `< 0x1000` is false and its name isn't resolved
        /// yet; rebound to the non-forward definition in pass 2.
        element_type: TypeRef,
        /// Index type (unused by the emitter, kept for completeness).
        index_type: TypeRef,
        /// Element count, computed in pass 2 from `total_size / size_of(element_type)`. `None`
        /// until pass 2 runs.
        count: Option<u64>,
        /// Total byte size, as encoded.
        total_size: i64,
    },
    /// `LF_FIELDLIST`.
    FieldList(Vec<FieldRecord>),
    /// `LF_ARGLIST`.
    ArgList(Vec<TypeRef>),
}

/// One decoded TPI record: a leaf tag, an optional name, and the decoded payload.
#[derive(Clone, Debug)]
pub struct TypeRecord {
    /// The raw `leaf_type` tag.
    pub leaf_type: u16,
    /// The record's name, if the grammar for this `leaf_type` carries one.
    pub name: Option<String>,
    /// The decoded payload.
    pub kind: RecordKind,
}

impl TypeRecord {
    /// `CV_prop_t` bit 0x80: the aggregate has no body yet, and will be superseded by a later
    /// non-forward record with the same name.
    pub fn is_forward_reference(&self) -> bool {
        match &self.kind {
            RecordKind::Aggregate { properties, .. } | RecordKind::Enum { properties, .. } => {
                properties & 0x80 != 0
            }
            _ => false,
        }
    }
}

/// Decodes the body of one TPI record (the bytes following the `u16 leaf_type` that the caller
/// already consumed).
pub fn parse_record(leaf_type: u16, body: &[u8]) -> Result<TypeRecord, ParserError> {
    let mut p = Parser::new(body);

    let (name, kind) = match leaf_type {
        leaf::LF_STRUCTURE
        | leaf::LF_STRUCTURE_ST
        | leaf::LF_CLASS
        | leaf::LF_CLASS_ST
        | leaf::LF_INTERFACE => {
            let _count = p.u16()?;
            let properties = p.u16()?;
            let field_list = p.get::<TypeRefLe>()?.get();
            let _derived = p.get::<TypeRefLe>()?.get();
            let _vshape = p.get::<TypeRefLe>()?.get();
            let size = p.number()?.value();
            let name = read_name(&mut p, leaf_type)?;
            (
                Some(name),
                RecordKind::Aggregate { is_union: false, properties, field_list, size },
            )
        }
        leaf::LF_UNION | leaf::LF_UNION_ST => {
            let _count = p.u16()?;
            let properties = p.u16()?;
            let field_list = p.get::<TypeRefLe>()?.get();
            let size = p.number()?.value();
            let name = read_name(&mut p, leaf_type)?;
            (
                Some(name),
                RecordKind::Aggregate { is_union: true, properties, field_list, size },
            )
        }
        leaf::LF_ENUM | leaf::LF_ENUM_ST => {
            let _count = p.u16()?;
            let properties = p.u16()?;
            let subtype = p.get::<TypeRefLe>()?.get();
            let fields = p.get::<TypeRefLe>()?.get();
            let name = read_name(&mut p, leaf_type)?;
            (Some(name), RecordKind::Enum { properties, subtype, fields })
        }
        leaf::LF_POINTER => {
            let subtype = p.get::<TypeRefLe>()?.get();
            let attributes = p.u32()?;
            let size_field = (attributes >> 13) & 0x3f;
            let size = if size_field != 0 { size_field } else { 4 };
            (None, RecordKind::Pointer { subtype, size })
        }
        leaf::LF_MODIFIER => {
            let subtype = p.get::<TypeRefLe>()?.get();
            let _modifiers = p.u16()?;
            (None, RecordKind::Modifier { subtype })
        }
        leaf::LF_PROCEDURE | leaf::LF_MFUNCTION => (None, RecordKind::Function),
        leaf::LF_BITFIELD => {
            let underlying_type = p.get::<TypeRefLe>()?.get();
            let length = p.u8()?;
            let position = p.u8()?;
            (None, RecordKind::Bitfield { underlying_type, length, position })
        }
        leaf::LF_ARRAY | leaf::LF_ARRAY_ST | leaf::LF_STRIDED_ARRAY => {
            let element_type = p.get::<TypeRefLe>()?.get();
            let index_type = p.get::<TypeRefLe>()?.get();
            let total_size = p.number()?.value();
            let name = read_name(&mut p, leaf_type)?;
            (
                Some(name),
                RecordKind::Array { element_type, index_type, count: None, total_size },
            )
        }
        leaf::LF_FIELDLIST => (None, RecordKind::FieldList(parse_field_list(p.take_rest())?)),
        leaf::LF_ARGLIST => {
            let count = p.u32()?;
            let mut args = Vec::with_capacity(count as usize);
            for _ in 0..count {
                args.push(p.get::<TypeRefLe>()?.get());
            }
            (None, RecordKind::ArgList(args))
        }
        _ => return Err(ParserError::new()),
    };

    Ok(TypeRecord { leaf_type, name, kind })
}

/// Decodes the sub-record stream of an `LF_FIELDLIST`, consuming padding between sub-records
/// (§4.2 padding rule). Only `LF_MEMBER[_ST]` and `LF_ENUMERATE` sub-records are meaningful to
/// this grammar; any other sub-record `leaf_type` is a decode error, matching the top-level
/// grammar's "unhandled leaf_type" rule.
pub fn parse_field_list(mut data: &[u8]) -> Result<Vec<FieldRecord>, ParserError> {
    let mut fields = Vec::new();

    while !data.is_empty() {
        let mut p = Parser::new(data);
        let leaf_type = p.u16()?;

        let field = match leaf_type {
            leaf::LF_MEMBER | leaf::LF_MEMBER_ST => {
                let attributes = p.u16()?;
                let field_type = p.get::<TypeRefLe>()?.get();
                let offset = p.number()?.value();
                let name = read_name(&mut p, leaf_type)?;
                FieldRecord::Member { attributes, field_type, offset, name }
            }
            leaf::LF_ENUMERATE => {
                let attributes = p.u16()?;
                let value = p.number()?.value();
                let name = read_name(&mut p, leaf_type)?;
                FieldRecord::Enumerate { attributes, value, name }
            }
            _ => return Err(ParserError::new()),
        };
        fields.push(field);

        data = p.take_rest();
        data = skip_field_list_padding(data);
    }

    Ok(fields)
}

/// Consumes padding bytes at a `LF_FIELDLIST` sub-record boundary: a byte whose high nibble is
/// `0xf` means `byte & 0x0f` bytes of padding, including the marker byte itself.
fn skip_field_list_padding(data: &[u8]) -> &[u8] {
    if let Some(&first) = data.first() {
        if first & 0xf0 == 0xf0 {
            let pad = (first & 0x0f) as usize;
            if pad <= data.len() {
                return &data[pad..];
            }
        }
    }
    data
}

/// Reads a record's trailing name, in C-string form for leaf types `>= LF_ST_MAX` and
/// Pascal-string form for the `_ST` variants (§4.3, "Unnamed-tag synthesis" is applied by the
/// caller, which knows the record's table index).
fn read_name(p: &mut Parser<'_>, leaf_type: u16) -> Result<String, ParserError> {
    let bytes = if leaf_type < leaf::LF_ST_MAX { p.strt_raw()? } else { p.strz()? };
    Ok(latin1_to_string(bytes.as_ref()))
}

/// Decodes a Latin-1 byte string into a `String`. Every byte value maps directly onto the
/// Unicode code point of the same number, so this never fails.
pub fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_with_inline_offset() {
        let mut data = leaf::LF_MEMBER.to_le_bytes().to_vec();
        data.extend_from_slice(&0u16.to_le_bytes()); // attributes
        data.extend_from_slice(&0x74u16.to_le_bytes()); // field_type = int
        data.extend_from_slice(&0u16.to_le_bytes()); // offset = 0 (inline)
        data.extend_from_slice(b"a\0");

        let fields = parse_field_list(&data).unwrap();

        assert_eq!(fields.len(), 1);
        match &fields[0] {
            FieldRecord::Member { offset, name, field_type, .. } => {
                assert_eq!(*offset, 0);
                assert_eq!(name, "a");
                assert_eq!(field_type.0, 0x74);
            }
            _ => panic!("expected member"),
        }
    }

    #[test]
    fn field_list_padding_is_consumed() {
        let mut data = leaf::LF_ENUMERATE.to_le_bytes().to_vec();
        data.extend_from_slice(&0u16.to_le_bytes()); // attributes
        data.extend_from_slice(&1u16.to_le_bytes()); // value = 1 (inline)
        data.extend_from_slice(b"x\0"); // name
        data.push(0xf3); // padding marker: 3 bytes including itself
        data.extend_from_slice(&[0, 0]);
        data.extend_from_slice(&leaf::LF_ENUMERATE.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(b"y\0");

        let fields = parse_field_list(&data).unwrap();
        assert_eq!(fields.len(), 2);
        match &fields[1] {
            FieldRecord::Enumerate { value, name, .. } => {
                assert_eq!(*value, 2);
                assert_eq!(name, "y");
            }
            _ => panic!("expected enumerate"),
        }
    }

    #[test]
    fn extended_member_offset() {
        // offset field = LF_SHORT tag followed by i16 = 70000 truncated... use LF_LONG instead.
        let mut data = leaf::LF_MEMBER.to_le_bytes().to_vec();
        data.extend_from_slice(&0u16.to_le_bytes()); // attributes
        data.extend_from_slice(&0x74u16.to_le_bytes()); // field_type
        data.extend_from_slice(&leaf::LF_LONG.to_le_bytes());
        data.extend_from_slice(&70_000i32.to_le_bytes());
        data.extend_from_slice(b"big\0");

        let fields = parse_field_list(&data).unwrap();
        match &fields[0] {
            FieldRecord::Member { offset, .. } => assert_eq!(*offset, 70_000),
            _ => panic!("expected member"),
        }
    }

    #[test]
    fn unhandled_leaf_type_is_error() {
        let body: &[u8] = &[0, 0, 0, 0];
        assert!(parse_record(0x9999, body).is_err());
    }

    #[test]
    fn unhandled_field_subrecord_is_error() {
        let mut data = 0x1400u16.to_le_bytes().to_vec(); // not LF_MEMBER/LF_ENUMERATE
        data.extend_from_slice(&[0, 0, 0, 0]);
        assert!(parse_field_list(&data).is_err());
    }

    #[test]
    fn struct_record_grammar() {
        let mut body = vec![];
        body.extend_from_slice(&0u16.to_le_bytes()); // count
        body.extend_from_slice(&0u16.to_le_bytes()); // properties (not forward)
        body.extend_from_slice(&0x1000u16.to_le_bytes()); // field_list
        body.extend_from_slice(&0u16.to_le_bytes()); // derived
        body.extend_from_slice(&0u16.to_le_bytes()); // vshape
        body.extend_from_slice(&4u16.to_le_bytes()); // size = 4 (inline)
        body.extend_from_slice(b"S\0");

        let rec = parse_record(leaf::LF_STRUCTURE, &body).unwrap();
        assert_eq!(rec.name.as_deref(), Some("S"));
        assert!(!rec.is_forward_reference());
        match rec.kind {
            RecordKind::Aggregate { is_union, size, field_list, .. } => {
                assert!(!is_union);
                assert_eq!(size, 4);
                assert_eq!(field_list.0, 0x1000);
            }
            _ => panic!("expected aggregate"),
        }
    }
}
