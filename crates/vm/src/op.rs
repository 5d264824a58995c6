//! Opcode encoding tables.
//!
//! An opcode byte packs a 5-bit base operation with three mode flags:
//! `K` (0x80, keep), `R` (0x40, return stack) and `S` (0x20, short). A
//! base field of zero does not name a polymorphic operation; instead the
//! flag bits select one of eight immediate opcodes (`BRK`, `JCI`, `JMI`,
//! `JSI` and the four `LIT` forms).

/// Keep flag: pops read through a shadow stack pointer.
pub const FLAG_K: u8 = 0x80;
/// Return flag: the working and return stacks swap roles.
pub const FLAG_R: u8 = 0x40;
/// Short flag: operands are 2 bytes wide.
pub const FLAG_S: u8 = 0x20;

pub const BRK: u8 = 0x00;
pub const JCI: u8 = 0x20;
pub const JMI: u8 = 0x40;
pub const JSI: u8 = 0x60;
pub const LIT: u8 = 0x80;
pub const LIT2: u8 = 0xa0;
pub const LITR: u8 = 0xc0;
pub const LIT2R: u8 = 0xe0;

/// Base mnemonics in encoding order. `LIT` occupies slot 0; its encoded
/// form always carries the `K` bit, which is how it is distinguished
/// from the immediate jumps sharing the zero base field.
pub const MNEMONICS: [&str; 32] = [
    "LIT", "INC", "POP", "NIP", "SWP", "ROT", "DUP", "OVR", "EQU", "NEQ", "GTH", "LTH", "JMP",
    "JCN", "JSR", "STH", "LDZ", "STZ", "LDR", "STR", "LDA", "STA", "DEI", "DEO", "ADD", "SUB",
    "MUL", "DIV", "AND", "ORA", "EOR", "SFT",
];

/// A base operation, after the mode flags have been peeled off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseOp {
    Brk,
    Jci,
    Jmi,
    Jsi,
    Lit,
    Inc,
    Pop,
    Nip,
    Swp,
    Rot,
    Dup,
    Ovr,
    Equ,
    Neq,
    Gth,
    Lth,
    Jmp,
    Jcn,
    Jsr,
    Sth,
    Ldz,
    Stz,
    Ldr,
    Str,
    Lda,
    Sta,
    Dei,
    Deo,
    Add,
    Sub,
    Mul,
    Div,
    And,
    Ora,
    Eor,
    Sft,
}

const POLY_BASES: [BaseOp; 31] = [
    BaseOp::Inc,
    BaseOp::Pop,
    BaseOp::Nip,
    BaseOp::Swp,
    BaseOp::Rot,
    BaseOp::Dup,
    BaseOp::Ovr,
    BaseOp::Equ,
    BaseOp::Neq,
    BaseOp::Gth,
    BaseOp::Lth,
    BaseOp::Jmp,
    BaseOp::Jcn,
    BaseOp::Jsr,
    BaseOp::Sth,
    BaseOp::Ldz,
    BaseOp::Stz,
    BaseOp::Ldr,
    BaseOp::Str,
    BaseOp::Lda,
    BaseOp::Sta,
    BaseOp::Dei,
    BaseOp::Deo,
    BaseOp::Add,
    BaseOp::Sub,
    BaseOp::Mul,
    BaseOp::Div,
    BaseOp::And,
    BaseOp::Ora,
    BaseOp::Eor,
    BaseOp::Sft,
];

/// A fully decoded opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub base: BaseOp,
    pub keep: bool,
    pub ret: bool,
    pub short: bool,
}

/// Decode an opcode byte into its `(base, K, R, S)` quadruple.
///
/// `decode` and [`encode`] are inverses over all 256 byte values.
pub fn decode(byte: u8) -> Decoded {
    if byte & 0x1f == 0 {
        let (base, keep) = match byte {
            BRK => (BaseOp::Brk, false),
            JCI => (BaseOp::Jci, false),
            JMI => (BaseOp::Jmi, false),
            JSI => (BaseOp::Jsi, false),
            _ => (BaseOp::Lit, true),
        };
        Decoded {
            base,
            keep,
            ret: keep && byte & FLAG_R != 0,
            short: keep && byte & FLAG_S != 0,
        }
    } else {
        Decoded {
            base: POLY_BASES[(byte & 0x1f) as usize - 1],
            keep: byte & FLAG_K != 0,
            ret: byte & FLAG_R != 0,
            short: byte & FLAG_S != 0,
        }
    }
}

/// Re-encode a decoded opcode. Inverse of [`decode`].
pub fn encode(op: Decoded) -> u8 {
    let flags = |op: Decoded| {
        (if op.keep { FLAG_K } else { 0 })
            | (if op.ret { FLAG_R } else { 0 })
            | (if op.short { FLAG_S } else { 0 })
    };
    match op.base {
        BaseOp::Brk => BRK,
        BaseOp::Jci => JCI,
        BaseOp::Jmi => JMI,
        BaseOp::Jsi => JSI,
        BaseOp::Lit => LIT | (flags(op) & (FLAG_R | FLAG_S)),
        base => {
            let index = POLY_BASES.iter().position(|&b| b == base).unwrap() + 1;
            index as u8 | flags(op)
        }
    }
}

macro_rules! name_table {
    ($($code:expr => $m:ident,)*) => {{
        let mut names = [""; 256];
        names[0x00] = "BRK";
        names[0x20] = "JCI";
        names[0x40] = "JMI";
        names[0x60] = "JSI";
        names[0x80] = "LIT";
        names[0xa0] = "LIT2";
        names[0xc0] = "LITr";
        names[0xe0] = "LIT2r";
        $(
            names[$code] = stringify!($m);
            names[$code | 0x20] = concat!(stringify!($m), "2");
            names[$code | 0x40] = concat!(stringify!($m), "r");
            names[$code | 0x60] = concat!(stringify!($m), "2r");
            names[$code | 0x80] = concat!(stringify!($m), "k");
            names[$code | 0xa0] = concat!(stringify!($m), "2k");
            names[$code | 0xc0] = concat!(stringify!($m), "kr");
            names[$code | 0xe0] = concat!(stringify!($m), "2kr");
        )*
        names
    }};
}

static NAMES: [&str; 256] = name_table! {
    0x01 => INC,
    0x02 => POP,
    0x03 => NIP,
    0x04 => SWP,
    0x05 => ROT,
    0x06 => DUP,
    0x07 => OVR,
    0x08 => EQU,
    0x09 => NEQ,
    0x0a => GTH,
    0x0b => LTH,
    0x0c => JMP,
    0x0d => JCN,
    0x0e => JSR,
    0x0f => STH,
    0x10 => LDZ,
    0x11 => STZ,
    0x12 => LDR,
    0x13 => STR,
    0x14 => LDA,
    0x15 => STA,
    0x16 => DEI,
    0x17 => DEO,
    0x18 => ADD,
    0x19 => SUB,
    0x1a => MUL,
    0x1b => DIV,
    0x1c => AND,
    0x1d => ORA,
    0x1e => EOR,
    0x1f => SFT,
};

/// Canonical display name of an opcode byte, e.g. `ADD2kr`.
pub fn name(byte: u8) -> &'static str {
    NAMES[byte as usize]
}

/// Result of recognizing a mnemonic token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedOpcode {
    pub opcode: u8,
    /// A mode letter was given that was already implied or repeated.
    pub redundant_flag: bool,
}

/// Parse an assembler mnemonic: three upper-case base letters followed
/// by any combination of the mode letters `2`, `r` and `k`. `BRK` takes
/// no modes, and `LIT` always carries the keep bit.
pub fn parse_opcode(word: &str) -> Option<ParsedOpcode> {
    let bytes = word.as_bytes();
    if bytes.len() < 3 {
        return None;
    }
    if bytes[..3] == *b"BRK" {
        // BRK can only be written as-is
        return if bytes.len() == 3 {
            Some(ParsedOpcode {
                opcode: BRK,
                redundant_flag: false,
            })
        } else {
            None
        };
    }

    let base = MNEMONICS
        .iter()
        .position(|m| m.as_bytes() == &bytes[..3])?;
    let mut opcode = if base == 0 { LIT } else { base as u8 };

    let mut redundant_flag = false;
    for &flag in &bytes[3..] {
        let bit = match flag {
            b'2' => FLAG_S,
            b'r' => FLAG_R,
            b'k' => FLAG_K,
            // An unrecognized mode letter means the word is not an opcode
            _ => return None,
        };
        redundant_flag |= opcode & bit != 0;
        opcode |= bit;
    }

    Some(ParsedOpcode {
        opcode,
        redundant_flag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonics() {
        assert_eq!(parse_opcode("BRK").unwrap().opcode, 0x00);
        assert_eq!(parse_opcode("INC").unwrap().opcode, 0x01);
        assert_eq!(parse_opcode("ADD2k").unwrap().opcode, 0x18 | FLAG_S | FLAG_K);
        assert_eq!(parse_opcode("SFT2kr").unwrap().opcode, 0xff);
        assert_eq!(parse_opcode("LIT").unwrap().opcode, 0x80);
        assert_eq!(parse_opcode("LIT2").unwrap().opcode, 0xa0);
        assert!(parse_opcode("BRKk").is_none());
        assert!(parse_opcode("ADD2q").is_none());
        assert!(parse_opcode("add").is_none());
        assert!(parse_opcode("AD").is_none());
    }

    #[test]
    fn redundant_flags() {
        assert!(parse_opcode("LITk").unwrap().redundant_flag);
        assert!(parse_opcode("EQU2222").unwrap().redundant_flag);
        assert!(!parse_opcode("EQU2").unwrap().redundant_flag);
    }

    #[test]
    fn names() {
        assert_eq!(name(0x00), "BRK");
        assert_eq!(name(0x20), "JCI");
        assert_eq!(name(0x80), "LIT");
        assert_eq!(name(0xe0), "LIT2r");
        assert_eq!(name(0x18), "ADD");
        assert_eq!(name(0x38), "ADD2");
        assert_eq!(name(0xf8), "ADD2kr");
    }

    #[test]
    fn decode_immediates() {
        assert_eq!(decode(0x00).base, BaseOp::Brk);
        assert_eq!(decode(0x60).base, BaseOp::Jsi);
        let lit2r = decode(0xe0);
        assert_eq!(lit2r.base, BaseOp::Lit);
        assert!(lit2r.keep && lit2r.ret && lit2r.short);
    }
}
