//! Leaf-type tags: the 16-bit discriminant at the front of every CodeView type record and every
//! extended numeric value.
//!
//! Mirrors the subset of `LF_*` constants from `cvinfo.h` that the TPI grammar this crate
//! implements actually dispatches on.

#![allow(missing_docs)]

pub const LF_MODIFIER: u16 = 0x1001;
pub const LF_POINTER: u16 = 0x1002;
pub const LF_PROCEDURE: u16 = 0x1008;
pub const LF_MFUNCTION: u16 = 0x1009;
pub const LF_ARGLIST: u16 = 0x1201;
pub const LF_FIELDLIST: u16 = 0x1203;
pub const LF_BITFIELD: u16 = 0x1205;

pub const LF_STRUCTURE_ST: u16 = 0x0201;
pub const LF_CLASS_ST: u16 = 0x0202;
pub const LF_UNION_ST: u16 = 0x0205;
pub const LF_ENUM_ST: u16 = 0x0206;
pub const LF_ARRAY_ST: u16 = 0x0207;
pub const LF_MEMBER_ST: u16 = 0x020d;

pub const LF_ENUMERATE: u16 = 0x1502;
pub const LF_ARRAY: u16 = 0x1503;
pub const LF_CLASS: u16 = 0x1504;
pub const LF_STRUCTURE: u16 = 0x1505;
pub const LF_UNION: u16 = 0x1506;
pub const LF_ENUM: u16 = 0x1507;
pub const LF_MEMBER: u16 = 0x150d;
pub const LF_INTERFACE: u16 = 0x1519;
pub const LF_STRIDED_ARRAY: u16 = 0x1516;

/// Leaf types at or above this value use C-string names; below it, Pascal-string (`_ST`) names.
///
/// Matches the `_ST` / non-`_ST` split in `cvinfo.h`: every pre-"2.0" record kind that carries a
/// name stores it as a one-byte-length-prefixed Pascal string, while its modern counterpart
/// (same shape, different leaf tag) stores a NUL-terminated C string.
pub const LF_ST_MAX: u16 = 0x1000;

/// Tag marking a 16-bit value as an extension: the real value follows, in `size(tag)` bytes.
pub const LF_CHAR: u16 = 0x8000;
pub const LF_SHORT: u16 = 0x8001;
pub const LF_USHORT: u16 = 0x8002;
pub const LF_LONG: u16 = 0x8003;
pub const LF_ULONG: u16 = 0x8004;

/// v3 public symbol (`S_PUB32`): flags, offset, segment, NUL-terminated name.
pub const S_PUB32: u16 = 0x110e;
/// v2 public symbol (`S_PUB32_ST`): flags, offset, segment, Pascal-string name.
pub const S_PUB32_ST: u16 = 0x1009;

/// The placeholder name volatile/incremental-linker builds use for an anonymous struct/union tag.
pub const UNNAMED_TAG: &str = "<unnamed-tag>";
