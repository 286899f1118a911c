//! Definitions for Portable Executable (PE) COFF binaries (Windows binaries)
//!
//! Only the subset needed to read section headers out of a PDB's debug
//! header substream is kept here; relocations, the optional header, and
//! the DLL characteristics bitflags live in the original COFF spec but
//! have no reader in this tree.

#![allow(non_camel_case_types)]
#![forbid(unsafe_code)]

mod section;

pub use section::*;
