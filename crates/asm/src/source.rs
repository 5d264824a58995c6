//! Source positions, regions and the filename/lexeme interner.
//!
//! Positions are 1-based for line and column and 0-based for the byte
//! offset. A line/column of zero marks a region with no real position
//! (file-level diagnostics, synthesized symbols).

use rustc_hash::FxHashSet;
use std::fmt;
use std::rc::Rc;

/// A position within a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub line: u32,
    pub col: u32,
    pub byte: u32,
}

impl Pos {
    /// The start of a file.
    pub fn start() -> Self {
        Self {
            line: 1,
            col: 1,
            byte: 0,
        }
    }

    /// The "no position" sentinel.
    pub fn none() -> Self {
        Self {
            line: 0,
            col: 0,
            byte: 0,
        }
    }

    pub fn is_none(self) -> bool {
        self.line == 0
    }
}

/// A span of source text within one file.
///
/// Filenames are interned, so clones share storage and identity can be
/// tested with [`Rc::ptr_eq`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub filename: Rc<str>,
    pub start: Pos,
    pub end: Pos,
}

impl Region {
    /// A region naming a file without pointing into it.
    pub fn file_only(filename: Rc<str>) -> Self {
        Self {
            filename,
            start: Pos::none(),
            end: Pos::none(),
        }
    }

    /// Whether two regions cover the same bytes of the same file.
    pub fn same_span(&self, other: &Region) -> bool {
        Rc::ptr_eq(&self.filename, &other.filename)
            && self.start.byte == other.start.byte
            && self.end.byte == other.end.byte
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start.is_none() {
            write!(f, "{}", self.filename)
        } else {
            write!(f, "{}:{}:{}", self.filename, self.start.line, self.start.col)
        }
    }
}

/// String interner. Interned strings are reference-counted and unique,
/// so pointer equality implies string equality.
#[derive(Debug, Default)]
pub struct Interner {
    pool: FxHashSet<Rc<str>>,
}

impl Interner {
    pub fn intern(&mut self, s: &str) -> Rc<str> {
        if let Some(interned) = self.pool.get(s) {
            return Rc::clone(interned);
        }
        let interned: Rc<str> = Rc::from(s);
        self.pool.insert(Rc::clone(&interned));
        interned
    }

    pub fn find(&self, s: &str) -> Option<Rc<str>> {
        self.pool.get(s).map(Rc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_identity() {
        let mut interner = Interner::default();
        let a = interner.intern("hello");
        let b = interner.intern("hello");
        assert!(Rc::ptr_eq(&a, &b));
        let c = interner.intern("world");
        assert!(!Rc::ptr_eq(&a, &c));
    }

    #[test]
    fn region_display() {
        let mut interner = Interner::default();
        let file = interner.intern("main.tal");
        let region = Region {
            filename: Rc::clone(&file),
            start: Pos {
                line: 3,
                col: 7,
                byte: 42,
            },
            end: Pos {
                line: 3,
                col: 9,
                byte: 44,
            },
        };
        assert_eq!(region.to_string(), "main.tal:3:7");
        assert_eq!(Region::file_only(file).to_string(), "main.tal");
    }
}
