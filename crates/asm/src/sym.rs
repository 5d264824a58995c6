//! Symbol records and diagnostics.
//!
//! The assembler narrates everything it does as a stream of symbol
//! records keyed by the address they affect: labels and references,
//! opcodes, raw numbers, text bytes, macro definitions and expansions,
//! comments and marks. Downstream consumers (the type-checker, debug
//! tooling) reconstruct whatever view they need from this stream.

use crate::source::Region;
use std::rc::Rc;

/// What a [`Symbol`] record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Macro,
    MacroRef,
    Label,
    LabelRef,
    Opcode,
    Number,
    Text,
    Comment,
    Mark,
}

/// One record of the emitted symbol stream.
///
/// The meaning of `id` depends on the kind: the opcode byte for
/// `Opcode`, the unique non-zero label id for `Label`/`LabelRef`, the
/// literal value for `Number`, the lexeme length for `Text`, the
/// nesting depth for `Comment`, and the definition ordinal for
/// `Macro`/`MacroRef`.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub id: u16,
    pub name: Option<Rc<str>>,
    pub name_is_generated: bool,
    pub region: Region,
}

/// Report severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// A diagnostic, as handed to the host's report callback.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub message: String,
    pub token: Option<String>,
    pub region: Option<Region>,
    pub related_message: Option<String>,
    pub related_region: Option<Region>,
}

impl Report {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_related(mut self, message: impl Into<String>, region: Region) -> Self {
        self.related_message = Some(message.into());
        self.related_region = Some(region);
        self
    }
}
