//! TPI (Type Information) stream decoding (spec §4.3): the CodeView type-record grammar, the
//! two-pass forward-reference resolution, and the primitive/record type-descriptor emission that
//! feeds the JSON emitter.

use crate::diag::Diags;
use anyhow::{bail, Context, Result};
use ms_codeview::leaf;
use ms_codeview::parser::Parser;
use ms_codeview::types::record::{parse_record, FieldRecord, RecordKind, TypeRecord};
use ms_codeview::types::{lookup_indirection, lookup_primitive, TypeRef};
use std::collections::HashMap;

const TPI_HEADER_MIN: usize = 56;
const TPI_HEADER_MAX: usize = 1024;
const FIRST_RECORD_INDEX: u32 = 0x1000;

/// The decoded TPI stream: an append-only table of records, indexed by `TypeRef - 0x1000`.
pub struct TypeTable {
    records: Vec<TypeRecord>,
    /// `name -> record_index`, built in pass 2; the non-forward definition wins over any
    /// forward declaration of the same name (spec §4.3 "Pass 2", step 1).
    type_references: HashMap<String, usize>,
}

impl TypeTable {
    /// Parses the TPI stream (stream 2): the header, then length-prefixed records until the
    /// stream is exhausted (spec §3 invariant: "TPI exhaustion").
    pub fn parse(msf: &ms_pdb_msf::Msf) -> Result<Self> {
        let bytes = msf
            .read_stream_to_vec(2)
            .context("reading TPI stream (stream 2)")?;

        if bytes.len() < 4 {
            bail!("TPI stream is too short to contain a header");
        }
        let header_size = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        if !(TPI_HEADER_MIN..TPI_HEADER_MAX).contains(&header_size) {
            bail!("TPI header_size {header_size} is out of the allowed range [{TPI_HEADER_MIN}, {TPI_HEADER_MAX})");
        }
        if bytes.len() < 12 {
            bail!("TPI stream is too short to contain index_min/index_max");
        }
        let index_min = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let index_max = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if index_min < FIRST_RECORD_INDEX {
            bail!("TPI index_min {index_min:#x} must be >= {FIRST_RECORD_INDEX:#x}");
        }
        if index_max < index_min {
            bail!("TPI index_max {index_max:#x} must be >= index_min {index_min:#x}");
        }

        if bytes.len() < header_size {
            bail!("TPI stream is shorter than its own header_size ({header_size})");
        }

        let mut records = Vec::new();
        let mut offset = header_size;
        while offset < bytes.len() {
            if offset + 2 > bytes.len() {
                bail!("TPI stream ends mid-record-length at offset {offset}");
            }
            let length = u16::from_le_bytes(bytes[offset..offset + 2].try_into().unwrap()) as usize;
            let record_start = offset + 2;
            let record_end = record_start + length;
            if record_end > bytes.len() {
                bail!(
                    "TPI record length {length} at offset {offset} overshoots the stream (len {})",
                    bytes.len()
                );
            }
            if length < 2 {
                bail!("TPI record at offset {offset} has a length too small to hold a leaf_type");
            }

            let mut p = Parser::new(&bytes[record_start..record_end]);
            let leaf_type = p
                .u16()
                .map_err(|_| anyhow::anyhow!("failed to read leaf_type at offset {offset}"))?;
            let record = parse_record(leaf_type, p.into_rest())
                .map_err(|_| anyhow::anyhow!("unhandled or malformed leaf_type {leaf_type:#x} at record index {:#x}", FIRST_RECORD_INDEX as usize + records.len()))?;
            records.push(record);

            offset = record_end;
        }

        if offset != bytes.len() {
            bail!(
                "TPI stream has {} residual bytes after the last record",
                bytes.len() - offset
            );
        }

        let mut table = Self { records, type_references: HashMap::new() };
        table.resolve_forward_references();
        Ok(table)
    }

    /// The name a record is emitted under: `<unnamed-tag>` is rewritten to
    /// `__unnamed_<hex(record_index)>` (spec §4.3 "Unnamed-tag synthesis") so that every emitted
    /// aggregate/enum name is unique.
    fn emitted_name(&self, record_index: usize) -> Option<String> {
        let name = self.records[record_index].name.as_deref()?;
        if name == leaf::UNNAMED_TAG {
            Some(format!("__unnamed_{:x}", FIRST_RECORD_INDEX as usize + record_index))
        } else {
            Some(name.to_string())
        }
    }

    /// Pass 2 (spec §4.3): builds the name -> record_index map, then rebinds every forward-
    /// referenced array element type and computes its element count.
    fn resolve_forward_references(&mut self) {
        for i in 0..self.records.len() {
            let Some(name) = self.emitted_name(i) else { continue };
            let is_forward = self.records[i].is_forward_reference();
            if is_forward {
                self.type_references.entry(name).or_insert(i);
            } else {
                self.type_references.insert(name, i);
            }
        }

        for i in 0..self.records.len() {
            let (element_type, total_size) = match &self.records[i].kind {
                RecordKind::Array { element_type, total_size, .. } => (*element_type, *total_size),
                _ => continue,
            };

            let mut resolved = element_type;
            if let Some(record_index) = element_type.record_index() {
                if let Some(name) = self.records.get(record_index).and_then(|r| r.name.as_deref()) {
                    if let Some(&target) = self.type_references.get(name) {
                        resolved = TypeRef::from_record_index(target);
                    }
                }
            }

            let element_size = self.get_size(resolved).unwrap_or(1).max(1) as u64;
            let count = (total_size.max(0) as u64) / element_size;

            if let RecordKind::Array { element_type: e, count: c, .. } = &mut self.records[i].kind {
                *e = resolved;
                *c = Some(count);
            }
        }
    }

    /// `get_size_from_index` (spec §4.3 "Size queries"): returns `-1` for functions, `1` for
    /// anything with no more specific rule, and otherwise the size implied by the referenced
    /// type.
    pub fn get_size(&self, r: TypeRef) -> Result<i64> {
        if r.is_primitive() {
            return Ok(primitive_size(r)? as i64);
        }
        let Some(i) = r.record_index() else { unreachable!() };
        let Some(record) = self.records.get(i) else {
            bail!("type reference {:#x} is out of range", r.0);
        };
        match &record.kind {
            RecordKind::Aggregate { size, .. } => Ok(*size),
            RecordKind::Array { total_size, .. } => Ok(*total_size),
            RecordKind::Pointer { size, .. } => Ok(*size as i64),
            RecordKind::Modifier { subtype } => self.get_size(*subtype),
            RecordKind::Bitfield { underlying_type, .. } => self.get_size(*underlying_type),
            RecordKind::Enum { subtype, .. } => self.get_size(*subtype),
            RecordKind::Function => Ok(-1),
            _ => Ok(1),
        }
    }

    /// `get_type_from_index` (spec §4.3 "Type descriptor emission"): builds the JSON type
    /// descriptor for a TypeRef, registering any primitive it touches into `bases` on first use
    /// (spec §4.6: `base_types` is populated lazily).
    pub fn get_type_json(
        &self,
        r: TypeRef,
        bases: &mut std::collections::BTreeMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value> {
        if r.is_primitive() {
            return Ok(self.primitive_type_json(r, bases)?);
        }

        let Some(i) = r.record_index() else { unreachable!() };
        let Some(record) = self.records.get(i) else {
            bail!("type reference {:#x} is out of range", r.0);
        };

        match &record.kind {
            RecordKind::Modifier { subtype } => self.get_type_json(*subtype, bases),
            RecordKind::Array { element_type, count, .. } => {
                let subtype = self.get_type_json(*element_type, bases)?;
                Ok(serde_json::json!({
                    "kind": "array",
                    "count": count.unwrap_or(0),
                    "subtype": subtype,
                }))
            }
            RecordKind::Bitfield { underlying_type, length, position } => {
                let underlying = self.get_type_json(*underlying_type, bases)?;
                Ok(serde_json::json!({
                    "kind": "bitfield",
                    "type": underlying,
                    "bit_length": length,
                    "bit_position": position,
                }))
            }
            RecordKind::Pointer { subtype, .. } => {
                let subtype = self.get_type_json(*subtype, bases)?;
                Ok(serde_json::json!({ "kind": "pointer", "subtype": subtype }))
            }
            RecordKind::Function => Ok(serde_json::json!({ "kind": "function" })),
            RecordKind::Aggregate { is_union, .. } => {
                let name = self.emitted_name(i).unwrap_or_default();
                let kind = if *is_union { "union" } else { "struct" };
                Ok(serde_json::json!({ "kind": kind, "name": name }))
            }
            RecordKind::Enum { .. } => {
                let name = self.emitted_name(i).unwrap_or_default();
                Ok(serde_json::json!({ "kind": "enum", "name": name }))
            }
            RecordKind::FieldList(_) | RecordKind::ArgList(_) => {
                bail!("type reference {:#x} names a field list or arg list, which is not a standalone type descriptor", r.0)
            }
        }
    }

    fn primitive_type_json(
        &self,
        r: TypeRef,
        bases: &mut std::collections::BTreeMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let code = (r.0 & 0xff) as u8;
        let Some(prim) = lookup_primitive(code) else {
            bail!("type reference {:#x} names an unrecognized primitive code {:#x}", r.0, code);
        };

        bases.entry(prim.name.to_string()).or_insert_with(|| {
            serde_json::json!({
                "endian": "little",
                "kind": prim.kind,
                "signed": prim.signed,
                "size": prim.size,
            })
        });

        let base = serde_json::json!({ "kind": "base", "name": prim.name });

        match lookup_indirection(r.0 & 0x0f00) {
            Some(ind) => Ok(serde_json::json!({ "kind": ind.name, "subtype": base })),
            None => Ok(base),
        }
    }

    /// Emits the `user_types` and `enums` maps (spec §4.6), skipping forward-declared records
    /// whose non-forward definition supersedes them (spec §3 invariant: "Name collision rule").
    pub fn emit_aggregates(
        &self,
        diags: &mut Diags,
    ) -> Result<(
        std::collections::BTreeMap<String, serde_json::Value>,
        std::collections::BTreeMap<String, serde_json::Value>,
        std::collections::BTreeMap<String, serde_json::Value>,
    )> {
        let mut user_types = std::collections::BTreeMap::new();
        let mut enums = std::collections::BTreeMap::new();
        let mut bases = std::collections::BTreeMap::new();

        for i in 0..self.records.len() {
            if self.records[i].is_forward_reference() {
                continue;
            }
            let Some(name) = self.emitted_name(i) else { continue };
            // A forward declaration may still be the winning entry in `type_references` if no
            // non-forward definition of the same name exists; only emit under the winning index.
            if self.type_references.get(&name) != Some(&i) {
                continue;
            }

            match &self.records[i].kind {
                RecordKind::Aggregate { is_union, field_list, size, .. } => {
                    let fields = self.emit_fields(*field_list, *size, *is_union, &mut bases, diags)?;
                    user_types.insert(
                        name,
                        serde_json::json!({
                            "kind": if *is_union { "union" } else { "struct" },
                            "size": size,
                            "fields": fields,
                        }),
                    );
                }
                RecordKind::Enum { subtype, fields, .. } => {
                    let base_json = self.get_type_json(*subtype, &mut bases)?;
                    let base_name = base_json
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let size = self.get_size(*subtype)?;
                    let constants = self.emit_enumerators(*fields, diags)?;
                    enums.insert(
                        name,
                        serde_json::json!({
                            "base": base_name,
                            "size": size,
                            "constants": constants,
                        }),
                    );
                }
                _ => {}
            }
        }

        Ok((user_types, enums, bases))
    }

    fn emit_fields(
        &self,
        field_list: TypeRef,
        container_size: i64,
        is_union: bool,
        bases: &mut std::collections::BTreeMap<String, serde_json::Value>,
        diags: &mut Diags,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        let Some(i) = field_list.record_index() else {
            bail!("field_list {:#x} is not a record reference", field_list.0);
        };
        let Some(record) = self.records.get(i) else {
            bail!("field_list {:#x} is out of range", field_list.0);
        };
        let RecordKind::FieldList(entries) = &record.kind else {
            bail!("field_list {:#x} does not name a LF_FIELDLIST record", field_list.0);
        };

        let mut fields = serde_json::Map::new();
        for entry in entries {
            if let FieldRecord::Member { field_type, offset, name, .. } = entry {
                if *offset < 0 || (!is_union && *offset >= container_size) {
                    diags.warn(format!(
                        "member {name} has offset {offset} outside of containing type (size {container_size}); skipping"
                    ));
                    continue;
                }
                let ty = self.get_type_json(*field_type, bases)?;
                fields.insert(
                    name.clone(),
                    serde_json::json!({ "offset": offset, "type": ty }),
                );
            }
        }
        Ok(fields)
    }

    fn emit_enumerators(
        &self,
        fields: TypeRef,
        diags: &mut Diags,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        let Some(i) = fields.record_index() else {
            bail!("enum fields {:#x} is not a record reference", fields.0);
        };
        let Some(record) = self.records.get(i) else {
            bail!("enum fields {:#x} is out of range", fields.0);
        };
        let RecordKind::FieldList(entries) = &record.kind else {
            diags.warn(format!("enum fields {:#x} does not name a LF_FIELDLIST record", fields.0));
            return Ok(serde_json::Map::new());
        };

        let mut constants = serde_json::Map::new();
        for entry in entries {
            if let FieldRecord::Enumerate { value, name, .. } = entry {
                constants.insert(name.clone(), serde_json::json!(value));
            }
        }
        Ok(constants)
    }

    #[cfg(test)]
    pub(crate) fn from_records(records: Vec<TypeRecord>) -> Self {
        let mut table = Self { records, type_references: HashMap::new() };
        table.resolve_forward_references();
        table
    }
}

fn primitive_size(r: TypeRef) -> Result<u32> {
    let code = (r.0 & 0xff) as u8;
    if let Some(ind) = lookup_indirection(r.0 & 0x0f00) {
        return Ok(ind.size);
    }
    let Some(prim) = lookup_primitive(code) else {
        bail!("type reference {:#x} names an unrecognized primitive code {:#x}", r.0, code);
    };
    Ok(prim.size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ms_codeview::types::record::{FieldRecord, RecordKind, TypeRecord};

    fn struct_record(name: &str, size: i64, forward: bool, field_list: u16) -> TypeRecord {
        TypeRecord {
            leaf_type: leaf::LF_STRUCTURE,
            name: Some(name.to_string()),
            kind: RecordKind::Aggregate {
                is_union: false,
                properties: if forward { 0x80 } else { 0 },
                field_list: TypeRef(field_list),
                size,
            },
        }
    }

    fn field_list(entries: Vec<FieldRecord>) -> TypeRecord {
        TypeRecord { leaf_type: leaf::LF_FIELDLIST, name: None, kind: RecordKind::FieldList(entries) }
    }

    #[test]
    fn forward_then_definition_wins() {
        // index 0x1000: FOO forward (size 0); index 0x1001: FOO real (size 16).
        let table = TypeTable::from_records(vec![
            struct_record("FOO", 0, true, 0),
            struct_record("FOO", 16, false, 0),
        ]);
        let mut diags = Diags::new();
        let (user_types, _, _) = table.emit_aggregates(&mut diags).unwrap();
        assert_eq!(user_types["FOO"]["size"], 16);
    }

    #[test]
    fn array_count_resolves_after_forward_definition() {
        // 0x1000: forward ELEM; 0x1001: ELEM real, size 8; 0x1002: array of forward ELEM, total 40.
        let records = vec![
            struct_record("ELEM", 0, true, 0),
            struct_record("ELEM", 8, false, 0),
            TypeRecord {
                leaf_type: leaf::LF_ARRAY,
                name: Some("Arr".to_string()),
                kind: RecordKind::Array {
                    element_type: TypeRef(0x1000),
                    index_type: TypeRef(0x74),
                    count: None,
                    total_size: 40,
                },
            },
        ];
        let table = TypeTable::from_records(records);
        let RecordKind::Array { count, element_type, .. } = &table.records[2].kind else {
            panic!("expected array")
        };
        assert_eq!(*count, Some(5));
        assert_eq!(element_type.0, 0x1001);
    }

    #[test]
    fn array_of_array_count_uses_inner_total_size() {
        // 0x1000: inner array, element int (size 4), total 16 (count 4).
        // 0x1001: outer array, element is the inner array, total 48 -> count 3.
        let records = vec![
            TypeRecord {
                leaf_type: leaf::LF_ARRAY,
                name: Some("Inner".to_string()),
                kind: RecordKind::Array {
                    element_type: TypeRef(0x74),
                    index_type: TypeRef(0x74),
                    count: None,
                    total_size: 16,
                },
            },
            TypeRecord {
                leaf_type: leaf::LF_ARRAY,
                name: Some("Outer".to_string()),
                kind: RecordKind::Array {
                    element_type: TypeRef(0x1000),
                    index_type: TypeRef(0x74),
                    count: None,
                    total_size: 48,
                },
            },
        ];
        let table = TypeTable::from_records(records);
        let RecordKind::Array { count: inner_count, .. } = &table.records[0].kind else {
            panic!("expected array")
        };
        assert_eq!(*inner_count, Some(4));
        let RecordKind::Array { count: outer_count, .. } = &table.records[1].kind else {
            panic!("expected array")
        };
        assert_eq!(*outer_count, Some(3));
    }

    #[test]
    fn unnamed_tag_is_synthesized() {
        let table = TypeTable::from_records(vec![struct_record(leaf::UNNAMED_TAG, 4, false, 0)]);
        let mut diags = Diags::new();
        let (user_types, _, _) = table.emit_aggregates(&mut diags).unwrap();
        assert!(user_types.contains_key("__unnamed_1000"));
    }

    #[test]
    fn trivial_struct_emits_base_type_and_field() {
        let records = vec![
            field_list(vec![FieldRecord::Member {
                attributes: 0,
                field_type: TypeRef(0x74), // int
                offset: 0,
                name: "a".to_string(),
            }]),
            struct_record("S", 4, false, 0x1000),
        ];
        let table = TypeTable::from_records(records);
        let mut diags = Diags::new();
        let (user_types, _, bases) = table.emit_aggregates(&mut diags).unwrap();
        assert_eq!(user_types["S"]["size"], 4);
        assert_eq!(user_types["S"]["fields"]["a"]["offset"], 0);
        assert_eq!(bases["int"]["size"], 4);
        assert_eq!(bases["int"]["signed"], true);
    }

    #[test]
    fn union_member_offsets_may_all_be_zero() {
        let records = vec![
            field_list(vec![
                FieldRecord::Member { attributes: 0, field_type: TypeRef(0x74), offset: 0, name: "a".to_string() },
                FieldRecord::Member { attributes: 0, field_type: TypeRef(0x74), offset: 0, name: "b".to_string() },
            ]),
            TypeRecord {
                leaf_type: leaf::LF_UNION,
                name: Some("U".to_string()),
                kind: RecordKind::Aggregate { is_union: true, properties: 0, field_list: TypeRef(0x1000), size: 4 },
            },
        ];
        let table = TypeTable::from_records(records);
        let mut diags = Diags::new();
        let (user_types, _, _) = table.emit_aggregates(&mut diags).unwrap();
        assert_eq!(user_types["U"]["fields"].as_object().unwrap().len(), 2);
    }
}
