//! Debug symbol table: grouped records and their file format.
//!
//! The assembler's per-address symbol stream is dense; post-link
//! tooling wants one record per source construct. [`DebugSymbols`]
//! merges consecutive addresses that share a kind and a source region
//! into `{addr_min, addr_max}` ranges.
//!
//! The `.dbg` file is a self-describing little-endian serialization:
//!
//! ```text
//! header:  num_symbols u32 | num_strings u32 | string_pool_size u32
//! pool:    num_strings x (len u32 | bytes)
//! symbols: num_symbols x record
//! record:  type u8 | id u16 | addr_min u16 | addr_max u16 |
//!          filename_id u32 | start (line, col, byte as u32) |
//!          end (line, col, byte as u32)
//! ```
//!
//! Filenames are interned by the writer; `filename_id` indexes the
//! string pool in order of first appearance.

use crate::source::{Pos, Region};
use crate::sym::Symbol;
use rustc_hash::FxHashMap;
use std::io::{self, Read, Write};
use std::rc::Rc;
use thiserror::Error;

/// Record kinds, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugSymKind {
    Opcode = 0,
    LabelRef = 1,
    Number = 2,
    Text = 3,
    Label = 4,
}

impl DebugSymKind {
    fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::Opcode,
            1 => Self::LabelRef,
            2 => Self::Number,
            3 => Self::Text,
            4 => Self::Label,
            _ => return None,
        })
    }
}

/// One grouped debug record.
#[derive(Debug, Clone)]
pub struct DebugSym {
    pub kind: DebugSymKind,
    pub id: u16,
    pub addr_min: u16,
    pub addr_max: u16,
    pub region: Region,
}

/// Accumulates grouped records from the per-address symbol stream.
#[derive(Debug, Default)]
pub struct DebugSymbols {
    syms: Vec<DebugSym>,
    current: Option<DebugSym>,
}

impl DebugSymbols {
    pub fn push(&mut self, kind: DebugSymKind, addr: u16, sym: &Symbol) {
        if let Some(current) = &mut self.current {
            if current.kind == kind && current.region.same_span(&sym.region) {
                current.addr_max = addr;
                return;
            }
        }
        // Flush the previous record and start a new one
        if let Some(done) = self.current.take() {
            self.syms.push(done);
        }
        self.current = Some(DebugSym {
            kind,
            id: sym.id,
            addr_min: addr,
            addr_max: addr,
            region: sym.region.clone(),
        });
    }

    pub fn finish(mut self) -> Vec<DebugSym> {
        if let Some(done) = self.current.take() {
            self.syms.push(done);
        }
        self.syms
    }
}

#[derive(Debug, Error)]
pub enum SymtabError {
    #[error("I/O error")]
    Io(#[from] io::Error),
    #[error("malformed symbol table: {0}")]
    Malformed(&'static str),
}

/// Serialize grouped records to a `.dbg` stream.
pub fn write_symtab<W: Write>(writer: &mut W, syms: &[DebugSym]) -> Result<(), SymtabError> {
    // Build the string pool in order of first appearance
    let mut ids: FxHashMap<&str, u32> = FxHashMap::default();
    let mut pool: Vec<&str> = Vec::new();
    for sym in syms {
        let filename: &str = &sym.region.filename;
        ids.entry(filename).or_insert_with(|| {
            pool.push(filename);
            pool.len() as u32 - 1
        });
    }
    let pool_size: usize = pool.iter().map(|s| 4 + s.len()).sum();

    writer.write_all(&(syms.len() as u32).to_le_bytes())?;
    writer.write_all(&(pool.len() as u32).to_le_bytes())?;
    writer.write_all(&(pool_size as u32).to_le_bytes())?;

    for s in &pool {
        writer.write_all(&(s.len() as u32).to_le_bytes())?;
        writer.write_all(s.as_bytes())?;
    }

    for sym in syms {
        writer.write_all(&[sym.kind as u8])?;
        writer.write_all(&sym.id.to_le_bytes())?;
        writer.write_all(&sym.addr_min.to_le_bytes())?;
        writer.write_all(&sym.addr_max.to_le_bytes())?;
        writer.write_all(&ids[&*sym.region.filename].to_le_bytes())?;
        for pos in [sym.region.start, sym.region.end] {
            writer.write_all(&pos.line.to_le_bytes())?;
            writer.write_all(&pos.col.to_le_bytes())?;
            writer.write_all(&pos.byte.to_le_bytes())?;
        }
    }
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, SymtabError> {
    let mut buf = [0; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u16<R: Read>(reader: &mut R) -> Result<u16, SymtabError> {
    let mut buf = [0; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8, SymtabError> {
    let mut buf = [0; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

/// Deserialize a `.dbg` stream.
pub fn read_symtab<R: Read>(reader: &mut R) -> Result<Vec<DebugSym>, SymtabError> {
    let num_symbols = read_u32(reader)?;
    let num_strings = read_u32(reader)?;
    let pool_size = read_u32(reader)?;

    let mut pool: Vec<Rc<str>> = Vec::with_capacity(num_strings as usize);
    let mut read_bytes: u64 = 0;
    for _ in 0..num_strings {
        let len = read_u32(reader)?;
        read_bytes += 4 + len as u64;
        if read_bytes > pool_size as u64 {
            return Err(SymtabError::Malformed("string pool overrun"));
        }
        let mut buf = vec![0; len as usize];
        reader.read_exact(&mut buf)?;
        let s = String::from_utf8(buf)
            .map_err(|_| SymtabError::Malformed("filename is not valid UTF-8"))?;
        pool.push(Rc::from(s));
    }
    if read_bytes != pool_size as u64 {
        return Err(SymtabError::Malformed("string pool size mismatch"));
    }

    let mut syms = Vec::with_capacity(num_symbols.min(0x10000) as usize);
    for _ in 0..num_symbols {
        let kind = DebugSymKind::from_u8(read_u8(reader)?)
            .ok_or(SymtabError::Malformed("unknown symbol type"))?;
        let id = read_u16(reader)?;
        let addr_min = read_u16(reader)?;
        let addr_max = read_u16(reader)?;
        let filename_id = read_u32(reader)?;
        let filename = pool
            .get(filename_id as usize)
            .cloned()
            .ok_or(SymtabError::Malformed("filename id out of range"))?;
        let mut read_pos = || -> Result<Pos, SymtabError> {
            Ok(Pos {
                line: read_u32(reader)?,
                col: read_u32(reader)?,
                byte: read_u32(reader)?,
            })
        };
        let start = read_pos()?;
        let end = read_pos()?;
        syms.push(DebugSym {
            kind,
            id,
            addr_min,
            addr_max,
            region: Region {
                filename,
                start,
                end,
            },
        });
    }
    Ok(syms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Interner;
    use crate::sym::SymbolKind;

    fn sym(interner: &mut Interner, start_byte: u32, end_byte: u32) -> Symbol {
        Symbol {
            kind: SymbolKind::Opcode,
            id: 0x18,
            name: None,
            name_is_generated: false,
            region: Region {
                filename: interner.intern("main.tal"),
                start: Pos {
                    line: 1,
                    col: 1,
                    byte: start_byte,
                },
                end: Pos {
                    line: 1,
                    col: 4,
                    byte: end_byte,
                },
            },
        }
    }

    #[test]
    fn merges_consecutive_addresses() {
        let mut interner = Interner::default();
        let mut debug = DebugSymbols::default();
        let a = sym(&mut interner, 0, 3);
        debug.push(DebugSymKind::Number, 0x0100, &a);
        debug.push(DebugSymKind::Number, 0x0101, &a);
        let b = sym(&mut interner, 4, 7);
        debug.push(DebugSymKind::Number, 0x0102, &b);
        let syms = debug.finish();
        assert_eq!(syms.len(), 2);
        assert_eq!((syms[0].addr_min, syms[0].addr_max), (0x0100, 0x0101));
        assert_eq!((syms[1].addr_min, syms[1].addr_max), (0x0102, 0x0102));
    }

    #[test]
    fn round_trips_through_the_wire_format() {
        let mut interner = Interner::default();
        let mut debug = DebugSymbols::default();
        debug.push(DebugSymKind::Label, 0x0100, &sym(&mut interner, 0, 5));
        debug.push(DebugSymKind::Opcode, 0x0100, &sym(&mut interner, 6, 9));
        let syms = debug.finish();

        let mut buf = Vec::new();
        write_symtab(&mut buf, &syms).unwrap();
        let read = read_symtab(&mut buf.as_slice()).unwrap();
        assert_eq!(read.len(), syms.len());
        for (a, b) in syms.iter().zip(&read) {
            assert_eq!(a.kind, b.kind);
            assert_eq!(a.id, b.id);
            assert_eq!(a.addr_min, b.addr_min);
            assert_eq!(a.addr_max, b.addr_max);
            assert_eq!(&*a.region.filename, &*b.region.filename);
            assert_eq!(a.region.start, b.region.start);
            assert_eq!(a.region.end, b.region.end);
        }
    }

    #[test]
    fn rejects_truncated_input() {
        let mut interner = Interner::default();
        let mut debug = DebugSymbols::default();
        debug.push(DebugSymKind::Label, 0x0100, &sym(&mut interner, 0, 5));
        let mut buf = Vec::new();
        write_symtab(&mut buf, &debug.finish()).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(read_symtab(&mut buf.as_slice()).is_err());
    }
}
