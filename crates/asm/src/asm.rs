//! Assembler core.
//!
//! A single pass over the token stream dispatches on the leading rune
//! of each token. Forward references are chained off the symbol table
//! and back-patched the moment the label is defined; includes and macro
//! expansions are processed by recursing into a new input unit with a
//! shared depth counter.

use crate::lex::{self, FileUnit, LexError, MacroCursor, Token};
use crate::source::{Interner, Region};
use crate::sym::{Report, Severity, Symbol, SymbolKind};
use crate::{Sink, Vfs};
use std::cell::Cell;
use std::rc::Rc;
use uxnkit_vm::op;

pub const RESET_VECTOR: u16 = 0x0100;
pub const MAX_PREPROCESSOR_DEPTH: u32 = 32;
const DEFAULT_LABEL_SCOPE: &str = "RESET";

/// How a reference site encodes the target address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefKind {
    /// Low byte of the address (zero-page).
    Zero,
    /// Full 16-bit address.
    Abs,
    /// Signed offset from the byte after the reference.
    Rel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefSize {
    Byte,
    Short,
}

#[derive(Debug, Clone)]
struct ForwardRef {
    token: Token,
    addr: u16,
    kind: RefKind,
    size: RefSize,
}

/// An open lambda: a reference site waiting for its matching `}`.
#[derive(Debug, Clone)]
struct Lambda {
    label_id: u16,
    lambda_id: u16,
    token: Token,
    addr: u16,
    kind: RefKind,
    size: RefSize,
}

/// A pending `@@` site, consumed LIFO by references to bare `@`.
#[derive(Debug, Clone)]
struct AtLabel {
    label_id: u16,
    token: Token,
    addr: u16,
}

#[derive(Debug)]
struct MacroDef {
    id: u16,
    tokens: Vec<Token>,
    expanding: Cell<bool>,
}

#[derive(Debug)]
enum EntryKind {
    Unknown,
    Macro(Rc<MacroDef>),
    Label { id: u16, addr: u16 },
    Forward { id: u16, refs: Vec<ForwardRef> },
}

#[derive(Debug)]
struct SymEntry {
    name: Rc<str>,
    defining_token: Token,
    referenced: bool,
    kind: EntryKind,
}

/// Everything needed to patch or emit a reference to a defined label.
struct LabelInfo {
    id: u16,
    addr: u16,
    name: Option<Rc<str>>,
    defining_token: Token,
}

enum Unit {
    File(FileUnit),
    Macro(MacroCursor),
}

struct Assembler<'a> {
    vfs: &'a mut dyn Vfs,
    sink: &'a mut dyn Sink,
    write_addr: u16,
    preprocessor_depth: u32,
    success: bool,
    num_labels: u16,
    num_lambdas: u16,
    num_macros: u16,
    interner: Interner,
    symtab: rustc_hash::FxHashMap<Rc<str>, usize>,
    entries: Vec<SymEntry>,
    label_scope: Rc<str>,
    lambdas: Vec<Lambda>,
    at_labels: Vec<AtLabel>,
}

/// Assemble `filename` (resolved through `vfs`), streaming the ROM
/// bytes, symbol records and diagnostics into `sink`. Returns whether
/// assembly succeeded.
pub fn assemble(vfs: &mut dyn Vfs, sink: &mut dyn Sink, filename: &str) -> bool {
    let mut interner = Interner::default();
    let scope = interner.intern(DEFAULT_LABEL_SCOPE);
    let mut asm = Assembler {
        vfs,
        sink,
        write_addr: RESET_VECTOR,
        preprocessor_depth: 0,
        success: true,
        num_labels: 0,
        num_lambdas: 0,
        num_macros: 0,
        interner,
        symtab: rustc_hash::FxHashMap::default(),
        entries: Vec::new(),
        label_scope: scope,
        lambdas: Vec::new(),
        at_labels: Vec::new(),
    };

    let filename = asm.interner.intern(filename);
    if !asm.process_file(filename) {
        return asm.success;
    }
    asm.resolve()
}

impl<'a> Assembler<'a> {
    // Error/Warning

    fn error_report(&mut self, report: Report) -> bool {
        self.success = false;
        self.sink.report(Severity::Error, &report);
        false
    }

    fn error(&mut self, token: &Token, message: &str) -> bool {
        self.error_report(
            Report::new(message)
                .with_token(token.lexeme.to_string())
                .with_region(token.region.clone()),
        )
    }

    fn error2(
        &mut self,
        token: &Token,
        message: &str,
        related_token: &Token,
        related_message: &str,
    ) -> bool {
        self.error_report(
            Report::new(message)
                .with_token(token.lexeme.to_string())
                .with_region(token.region.clone())
                .with_related(related_message, related_token.region.clone()),
        )
    }

    fn warning(&mut self, token: &Token, message: &str) {
        let report = Report::new(message)
            .with_token(token.lexeme.to_string())
            .with_region(token.region.clone());
        self.sink.report(Severity::Warning, &report);
    }

    fn warning_at(&mut self, region: Region, message: &str) {
        let report = Report::new(message).with_region(region);
        self.sink.report(Severity::Warning, &report);
    }

    // Tokens

    fn next_token(&mut self, unit: &mut Unit) -> Option<Token> {
        let result = match unit {
            Unit::File(file) => file.next_token(),
            Unit::Macro(cursor) => cursor.next_token(),
        };
        match result {
            Ok(token) => token,
            Err(LexError::TokenTooLong(region)) => {
                self.error_report(Report::new("Token is too long").with_region(region));
                None
            }
            Err(LexError::StringTooLong(region)) => {
                self.error_report(Report::new("String is too long").with_region(region));
                None
            }
            Err(LexError::UnterminatedString(region)) => {
                self.error_report(Report::new("Unterminated long string").with_region(region));
                None
            }
            Err(LexError::ExpandedTooLong(token)) => {
                self.error(&token, "Expanded token is too long");
                None
            }
        }
    }

    // Symbol table

    fn find_or_create_symbol(&mut self, token: &Token, name: &str) -> Option<usize> {
        if name.is_empty() {
            self.error(token, "Symbol name cannot be empty");
            return None;
        }
        if lex::is_runic(name.as_bytes()[0]) {
            self.error(token, "Symbol name cannot be runic");
            return None;
        }
        if op::parse_opcode(name).is_some() {
            self.error(token, "Symbol name cannot be an opcode");
            return None;
        }
        if lex::is_number(name) {
            self.error(token, "Symbol name cannot be numeric");
            return None;
        }

        let interned = self.interner.intern(name);
        if let Some(&index) = self.symtab.get(&interned) {
            return Some(index);
        }
        let index = self.entries.len();
        self.entries.push(SymEntry {
            name: Rc::clone(&interned),
            defining_token: token.clone(),
            referenced: false,
            kind: EntryKind::Unknown,
        });
        self.symtab.insert(interned, index);
        Some(index)
    }

    fn label_info(&self, index: usize) -> LabelInfo {
        let entry = &self.entries[index];
        let EntryKind::Label { id, addr } = entry.kind else {
            unreachable!("label info requested for a non-label");
        };
        LabelInfo {
            id,
            addr,
            name: Some(Rc::clone(&entry.name)),
            defining_token: entry.defining_token.clone(),
        }
    }

    // Codegen

    fn emit(&mut self, token: &Token, byte: u8) -> bool {
        let addr = self.write_addr;
        self.write_addr = self.write_addr.wrapping_add(1);
        if addr < RESET_VECTOR {
            return self.error(token, "Writing to zero page");
        }
        self.sink.put_rom(addr, byte);
        true
    }

    fn emit2(&mut self, token: &Token, short: u16) -> bool {
        self.emit(token, (short >> 8) as u8) && self.emit(token, (short & 0xff) as u8)
    }

    fn put_symbol2(&mut self, addr: u16, sym: &Symbol) {
        self.sink.put_symbol(addr, sym);
        self.sink.put_symbol(addr.wrapping_add(1), sym);
    }

    /// Shrink a token's region to just its rune prefix.
    fn rune_region(region: &Region) -> Region {
        let mut region = region.clone();
        region.end = region.start;
        region.end.col += 1;
        region.end.byte += 1;
        region
    }

    /// Shrink a token's region to everything after its rune prefix.
    fn skip_rune_region(region: &Region) -> Region {
        let mut region = region.clone();
        region.start.col += 1;
        region.start.byte += 1;
        region
    }

    fn emit_opcode(&mut self, token: &Token, opcode: u8, is_runic: bool) -> bool {
        let addr = self.write_addr;
        if !self.emit(token, opcode) {
            return false;
        }
        // Map only the rune to this opcode
        let region = if is_runic {
            Self::rune_region(&token.region)
        } else {
            token.region.clone()
        };
        self.sink.put_symbol(
            addr,
            &Symbol {
                kind: SymbolKind::Opcode,
                id: opcode as u16,
                name: None,
                name_is_generated: false,
                region,
            },
        );
        true
    }

    fn emit_byte(&mut self, token: &Token, byte: u8, is_runic: bool) -> bool {
        let addr = self.write_addr;
        if !self.emit(token, byte) {
            return false;
        }
        let region = if is_runic {
            Self::skip_rune_region(&token.region)
        } else {
            token.region.clone()
        };
        self.sink.put_symbol(
            addr,
            &Symbol {
                kind: SymbolKind::Number,
                id: byte as u16,
                name: None,
                name_is_generated: false,
                region,
            },
        );
        true
    }

    fn emit_short(&mut self, token: &Token, short: u16, is_runic: bool) -> bool {
        let addr = self.write_addr;
        if !self.emit2(token, short) {
            return false;
        }
        let region = if is_runic {
            Self::skip_rune_region(&token.region)
        } else {
            token.region.clone()
        };
        self.put_symbol2(
            addr,
            &Symbol {
                kind: SymbolKind::Number,
                id: short,
                name: None,
                name_is_generated: false,
                region,
            },
        );
        true
    }

    fn emit_addr_placeholder(
        &mut self,
        token: &Token,
        size: RefSize,
        named: Option<(Rc<str>, u16)>,
        is_runic: bool,
    ) -> bool {
        let region = if is_runic {
            Self::skip_rune_region(&token.region)
        } else {
            token.region.clone()
        };
        let (name, id) = match named {
            Some((name, id)) => (Some(name), id),
            None => {
                self.num_labels += 1;
                (None, self.num_labels)
            }
        };
        let sym = Symbol {
            kind: SymbolKind::LabelRef,
            id,
            name,
            name_is_generated: false,
            region,
        };

        let addr = self.write_addr;
        match size {
            RefSize::Byte => {
                if !self.emit(token, 0x01) {
                    return false;
                }
                self.sink.put_symbol(addr, &sym);
            }
            RefSize::Short => {
                if !self.emit2(token, 0x0001) {
                    return false;
                }
                self.put_symbol2(addr, &sym);
            }
        }
        true
    }

    fn emit_forward_ref(
        &mut self,
        token: &Token,
        kind: RefKind,
        size: RefSize,
        index: usize,
        is_runic: bool,
    ) -> bool {
        if matches!(self.entries[index].kind, EntryKind::Unknown) {
            self.num_labels += 1;
            self.entries[index].kind = EntryKind::Forward {
                id: self.num_labels,
                refs: Vec::new(),
            };
        }
        let (name, id) = match &self.entries[index].kind {
            EntryKind::Forward { id, .. } => (Rc::clone(&self.entries[index].name), *id),
            _ => unreachable!(),
        };

        let addr = self.write_addr;
        if !self.emit_addr_placeholder(token, size, Some((name, id)), is_runic) {
            return false;
        }

        let EntryKind::Forward { refs, .. } = &mut self.entries[index].kind else {
            unreachable!();
        };
        refs.push(ForwardRef {
            token: token.clone(),
            addr,
            kind,
            size,
        });
        true
    }

    fn emit_lambda_ref(
        &mut self,
        token: &Token,
        kind: RefKind,
        size: RefSize,
        is_runic: bool,
    ) -> bool {
        let addr = self.write_addr;
        if !self.emit_addr_placeholder(token, size, None, is_runic) {
            return false;
        }
        // The placeholder above reserved a fresh label id
        let lambda_id = self.num_lambdas;
        self.num_lambdas += 1;
        self.lambdas.push(Lambda {
            label_id: self.num_labels,
            lambda_id,
            token: token.clone(),
            addr,
            kind,
            size,
        });
        true
    }

    fn calculate_addr(&mut self, token: &Token, kind: RefKind, from: u16, to: u16) -> i32 {
        match kind {
            RefKind::Zero => {
                if to > 0xff {
                    self.warning(token, "Taking zero-address of a label past page zero");
                }
                (to & 0xff) as i32
            }
            RefKind::Abs => to as i32,
            RefKind::Rel => to as i32 - (from as i32 + 2),
        }
    }

    fn emit_addr(
        &mut self,
        token: &Token,
        kind: RefKind,
        size: RefSize,
        addr: i32,
        token_at_addr: &Token,
        sym: Option<&Symbol>,
    ) -> bool {
        let write_addr = self.write_addr;
        match size {
            RefSize::Byte => {
                if kind == RefKind::Rel && !(i8::MIN as i32..=i8::MAX as i32).contains(&addr) {
                    return self.error2(
                        token,
                        "Referenced address is too far",
                        token_at_addr,
                        "Label defined here",
                    );
                }
                if !self.emit(token, (addr as u16 & 0xff) as u8) {
                    return false;
                }
                if let Some(sym) = sym {
                    self.sink.put_symbol(write_addr, sym);
                }
            }
            RefSize::Short => {
                if !self.emit2(token, addr as u16) {
                    return false;
                }
                if let Some(sym) = sym {
                    self.put_symbol2(write_addr, sym);
                }
            }
        }
        true
    }

    fn emit_backward_ref(
        &mut self,
        token: &Token,
        kind: RefKind,
        size: RefSize,
        label: &LabelInfo,
        with_symbol: bool,
        is_runic: bool,
    ) -> bool {
        let write_addr = self.write_addr;
        let addr = self.calculate_addr(token, kind, write_addr, label.addr);

        let region = if is_runic {
            Self::skip_rune_region(&token.region)
        } else {
            token.region.clone()
        };
        let sym = Symbol {
            kind: SymbolKind::LabelRef,
            id: label.id,
            // An anonymous backward ref has no name
            name: label.name.clone(),
            name_is_generated: false,
            region,
        };

        self.emit_addr(
            token,
            kind,
            size,
            addr,
            &label.defining_token,
            with_symbol.then_some(&sym),
        )
    }

    fn pop_at_label(&mut self) -> Option<AtLabel> {
        self.at_labels.pop()
    }

    fn resolve_local_name(&mut self, token: &Token, local: &str) -> Option<String> {
        let scope = &self.label_scope;
        if local.len() + scope.len() + 1 > lex::MAX_TOKEN_LEN {
            self.error(token, "Label name is too long");
            return None;
        }
        Some(format!("{scope}/{local}"))
    }

    fn resolve_label_ref(&mut self, token: &Token, reference: &str) -> Option<String> {
        if reference.is_empty() {
            self.error(token, "Invalid reference");
            None
        } else if reference.starts_with('&') || reference.starts_with('/') {
            self.resolve_local_name(token, &reference[1..])
        } else {
            Some(reference.to_string())
        }
    }

    fn emit_label_ref(
        &mut self,
        token: &Token,
        kind: RefKind,
        size: RefSize,
        label_name: &str,
        is_runic: bool,
    ) -> bool {
        if label_name == "{" {
            return self.emit_lambda_ref(token, kind, size, is_runic);
        }

        let Some(full_name) = self.resolve_label_ref(token, label_name) else {
            return false;
        };

        if full_name == "@" {
            // Anonymous backward ref
            match self.pop_at_label() {
                Some(at) => {
                    let info = LabelInfo {
                        id: at.label_id,
                        addr: at.addr,
                        name: None,
                        defining_token: at.token,
                    };
                    self.emit_backward_ref(token, kind, size, &info, true, is_runic)
                }
                None => self.error(token, "No previously declared @-label"),
            }
        } else {
            if full_name.is_empty() || lex::is_runic(full_name.as_bytes()[0]) {
                return self.error(token, "Invalid reference");
            }
            let Some(index) = self.find_or_create_symbol(token, &full_name) else {
                return false;
            };
            match &self.entries[index].kind {
                EntryKind::Label { .. } => {
                    self.entries[index].referenced = true;
                    let info = self.label_info(index);
                    self.emit_backward_ref(token, kind, size, &info, true, is_runic)
                }
                EntryKind::Unknown | EntryKind::Forward { .. } => {
                    self.emit_forward_ref(token, kind, size, index, is_runic)
                }
                EntryKind::Macro(_) => self.error(token, "Invalid reference"),
            }
        }
    }

    fn emit_jsi(&mut self, token: &Token) -> bool {
        if !self.emit_opcode(token, op::JSI, false) {
            return false;
        }
        let lexeme = Rc::clone(&token.lexeme);
        self.emit_label_ref(token, RefKind::Rel, RefSize::Short, &lexeme, false)
    }

    // Runes

    fn process_comment(&mut self, start: &Token, unit: &mut Unit) -> bool {
        self.sink.put_symbol(
            self.write_addr,
            &Symbol {
                kind: SymbolKind::Comment,
                id: 0,
                name: Some(Rc::clone(&start.lexeme)),
                name_is_generated: false,
                region: start.region.clone(),
            },
        );

        let mut depth: u16 = 1;
        while depth > 0 {
            let Some(token) = self.next_token(unit) else {
                break;
            };
            self.sink.put_symbol(
                self.write_addr,
                &Symbol {
                    kind: SymbolKind::Comment,
                    id: depth,
                    name: Some(Rc::clone(&token.lexeme)),
                    name_is_generated: false,
                    region: token.region.clone(),
                },
            );
            match &*token.lexeme {
                "(" => depth += 1,
                ")" => depth -= 1,
                _ => {}
            }
        }

        if depth != 0 {
            return self
                .error_report(Report::new("Unbalanced comment").with_region(start.region.clone()));
        }
        true
    }

    fn process_mark(&mut self, token: &Token) {
        self.sink.put_symbol(
            self.write_addr,
            &Symbol {
                kind: SymbolKind::Mark,
                id: 0,
                name: Some(Rc::clone(&token.lexeme)),
                name_is_generated: false,
                region: token.region.clone(),
            },
        );
    }

    fn create_macro(&mut self, start: &Token, unit: &mut Unit, index: usize) -> bool {
        self.num_macros += 1;
        let id = self.num_macros;
        self.sink.put_symbol(
            0,
            &Symbol {
                kind: SymbolKind::Macro,
                id,
                name: Some(Rc::clone(&self.entries[index].name)),
                name_is_generated: false,
                region: start.region.clone(),
            },
        );

        // Scan for the opening brace; comments and marks may intervene
        let mut found_open_brace = false;
        while !found_open_brace {
            let Some(token) = self.next_token(unit) else {
                return self.error(start, "Macro must be followed by '{'");
            };
            match token.first_char() {
                b'(' => {
                    if !self.process_comment(&token, unit) {
                        return false;
                    }
                }
                b'[' => self.process_mark(&token),
                b']' => {
                    if token.lexeme.len() != 1 {
                        return self.error(&token, "Invalid runic token");
                    }
                    self.process_mark(&token);
                }
                b'{' => {
                    if token.lexeme.len() != 1 {
                        return self.error(&token, "Macro must be followed by '{'");
                    }
                    found_open_brace = true;
                }
                _ => return self.error(&token, "Macro must be followed by '{'"),
            }
        }

        let mut tokens = Vec::new();
        let mut depth: u32 = 1;
        while depth > 0 {
            let Some(token) = self.next_token(unit) else {
                break;
            };
            match token.first_char() {
                b'%' => {
                    return self.error2(
                        &token,
                        "Nested macro definition detected",
                        start,
                        "In this macro definition",
                    );
                }
                b'{' if token.lexeme.len() == 1 => depth += 1,
                b'}' if token.lexeme.len() == 1 => depth -= 1,
                _ => tokens.push(token),
            }
        }
        if depth != 0 {
            return self.error_report(
                Report::new("Macro has unbalanced `{`").with_region(start.region.clone()),
            );
        }

        self.entries[index].kind = EntryKind::Macro(Rc::new(MacroDef {
            id,
            tokens,
            expanding: Cell::new(false),
        }));
        true
    }

    fn process_macro(&mut self, start: &Token, unit: &mut Unit) -> bool {
        let macro_name = &start.lexeme[1..];
        let Some(index) = self.find_or_create_symbol(start, macro_name) else {
            return false;
        };
        match &self.entries[index].kind {
            EntryKind::Unknown => self.create_macro(start, unit, index),
            kind => {
                let related_message = if matches!(kind, EntryKind::Forward { .. }) {
                    "Previously seen here as a label"
                } else {
                    "Previously defined here"
                };
                let defining_token = self.entries[index].defining_token.clone();
                self.error2(
                    start,
                    "Conflicting definition",
                    &defining_token,
                    related_message,
                )
            }
        }
    }

    /// Labels cannot start with `@`, so generated names use it.
    fn make_lambda_name(&mut self, id: u16) -> Rc<str> {
        self.interner.intern(&format!("@{id:04x}"))
    }

    fn expand_macro(&mut self, token: &Token, index: usize, unit: &mut Unit) -> bool {
        let EntryKind::Macro(def) = &self.entries[index].kind else {
            unreachable!();
        };
        let def = Rc::clone(def);
        let name = Rc::clone(&self.entries[index].name);

        if self.preprocessor_depth >= MAX_PREPROCESSOR_DEPTH {
            return self.error(token, "Max preprocessor depth reached");
        }
        if def.expanding.get() {
            return self.error(token, "Macro recursion detected");
        }

        self.sink.put_symbol(
            0,
            &Symbol {
                kind: SymbolKind::MacroRef,
                id: def.id,
                name: Some(Rc::clone(&name)),
                name_is_generated: false,
                region: token.region.clone(),
            },
        );

        let trigger_token = Token {
            lexeme: name.clone(),
            region: token.region.clone(),
        };

        // A macro whose name ends with ':' expects an argument
        let argument = if name.ends_with(':') {
            match self.next_token(unit) {
                Some(arg) => Some(arg.lexeme),
                None => {
                    if self.success {
                        self.error(token, "Macro expects an argument");
                    }
                    return false;
                }
            }
        } else {
            None
        };

        def.expanding.set(true);
        self.preprocessor_depth += 1;
        let mut macro_unit = Unit::Macro(MacroCursor::new(def.tokens.clone(), argument));
        let success = self.process_unit(&mut macro_unit);
        self.preprocessor_depth -= 1;
        def.expanding.set(false);

        // Append an error to explain the expansion chain
        if !success {
            self.error(&trigger_token, "Error while expanding macro");
        }
        success
    }

    fn process_lambda_close(&mut self, token: &Token) -> bool {
        let Some(lambda) = self.lambdas.pop() else {
            return self.error(token, "Unbalanced lambda");
        };

        let current_addr = self.write_addr;
        let addr = self.calculate_addr(&lambda.token, lambda.kind, lambda.addr, current_addr);

        self.write_addr = lambda.addr;
        if !self.emit_addr(
            &lambda.token,
            lambda.kind,
            lambda.size,
            addr,
            token,
            None,
        ) {
            return false;
        }
        self.write_addr = current_addr;

        let name = self.make_lambda_name(lambda.lambda_id);
        self.sink.put_symbol(
            current_addr,
            &Symbol {
                kind: SymbolKind::Label,
                id: lambda.label_id,
                name: Some(name),
                name_is_generated: true,
                region: token.region.clone(),
            },
        );
        true
    }

    fn process_global_label(&mut self, start: &Token) -> bool {
        let label_name = &start.lexeme[1..];

        if label_name == "@" {
            // Anonymous backward label
            self.num_labels += 1;
            let label_id = self.num_labels;
            self.num_lambdas += 1;
            let addr = self.write_addr;
            self.at_labels.push(AtLabel {
                label_id,
                token: start.clone(),
                addr,
            });

            let name = self.make_lambda_name(label_id);
            self.sink.put_symbol(
                addr,
                &Symbol {
                    kind: SymbolKind::Label,
                    id: label_id,
                    name: Some(name),
                    name_is_generated: true,
                    region: start.region.clone(),
                },
            );
            true
        } else {
            let name = label_name.to_string();
            let Some(index) = self.register_label(start, &name) else {
                return false;
            };
            // The scope excludes everything from the first slash on
            let interned = Rc::clone(&self.entries[index].name);
            let scope = match interned.find('/') {
                Some(pos) => self.interner.intern(&interned[..pos]),
                None => interned,
            };
            self.label_scope = scope;
            true
        }
    }

    fn process_local_label(&mut self, start: &Token) -> bool {
        let Some(name) = self.resolve_local_name(start, &start.lexeme[1..]) else {
            return false;
        };
        self.register_label(start, &name).is_some()
    }

    fn register_label(&mut self, token: &Token, name: &str) -> Option<usize> {
        let index = self.find_or_create_symbol(token, name)?;
        match &self.entries[index].kind {
            EntryKind::Unknown | EntryKind::Forward { .. } => {
                let (id, refs) =
                    match std::mem::replace(&mut self.entries[index].kind, EntryKind::Unknown) {
                        EntryKind::Unknown => {
                            // Ids start from 1 since 0 means "no id"
                            self.num_labels += 1;
                            (self.num_labels, Vec::new())
                        }
                        EntryKind::Forward { id, refs } => (id, refs),
                        _ => unreachable!(),
                    };
                let addr = self.write_addr;
                self.entries[index].kind = EntryKind::Label { id, addr };
                self.entries[index].referenced = !refs.is_empty();

                // Resolve existing forward references
                let info = self.label_info(index);
                let saved_addr = self.write_addr;
                for fref in refs {
                    self.write_addr = fref.addr;
                    self.emit_backward_ref(&fref.token, fref.kind, fref.size, &info, false, false);
                }
                self.write_addr = saved_addr;

                self.sink.put_symbol(
                    addr,
                    &Symbol {
                        kind: SymbolKind::Label,
                        id,
                        name: Some(Rc::clone(&self.entries[index].name)),
                        name_is_generated: false,
                        region: token.region.clone(),
                    },
                );
                Some(index)
            }
            _ => {
                let defining_token = self.entries[index].defining_token.clone();
                self.error2(
                    token,
                    "Duplicated definition",
                    &defining_token,
                    "Previously defined here",
                );
                None
            }
        }
    }

    // Numbers and padding

    fn parse_number(&mut self, token: &Token, s: &str) -> Option<(u16, u8)> {
        if s.is_empty() {
            self.error(token, "Invalid number: Empty string");
            return None;
        }

        let bytes = s.as_bytes();
        let plusses = bytes.iter().take(2).take_while(|&&b| b == b'+').count();

        if plusses == 0 {
            // Hex
            if s.len() > 4 {
                self.error(token, "Invalid number: Too many characters");
                return None;
            }
            let mut number: u16 = 0;
            for &b in bytes {
                let digit = match b {
                    b'0'..=b'9' => b - b'0',
                    b'a'..=b'f' => b - b'a' + 10,
                    _ => {
                        self.error(token, "Invalid number: Unexpected character found");
                        return None;
                    }
                };
                number = (number << 4) | digit as u16;
            }
            Some((number, if s.len() <= 2 { 1 } else { 2 }))
        } else {
            // Decimal
            let limit: u32 = if plusses == 1 { 0xff } else { 0xffff };
            let mut number: u32 = 0;
            for &b in &bytes[plusses..] {
                if !b.is_ascii_digit() {
                    self.error(token, "Invalid number: Unexpected character found");
                    return None;
                }
                number = number * 10 + (b - b'0') as u32;
                if number > limit {
                    self.error(token, "Invalid number: Too big");
                    return None;
                }
            }
            Some((number as u16, plusses as u8))
        }
    }

    fn resolve_padding(&mut self, token: &Token) -> Option<u16> {
        let padding_str = &token.lexeme[1..];
        if padding_str.is_empty() {
            self.error(token, "Invalid padding");
            return None;
        }
        if lex::is_number(padding_str) {
            return self.parse_number(token, padding_str).map(|(n, _)| n);
        }

        let label = self.resolve_label_ref(token, padding_str)?;
        if label == "@" {
            match self.pop_at_label() {
                Some(at) => Some(at.addr),
                None => {
                    self.error(token, "No previously declared @-label");
                    None
                }
            }
        } else {
            let Some(interned) = self.interner.find(&label) else {
                self.error(token, "Undeclared label is used for padding");
                return None;
            };
            let Some(&index) = self.symtab.get(&interned) else {
                self.error(token, "Undeclared label is used for padding");
                return None;
            };
            match &self.entries[index].kind {
                EntryKind::Label { addr, .. } => {
                    let addr = *addr;
                    self.entries[index].referenced = true;
                    Some(addr)
                }
                _ => {
                    self.error(token, "Invalid symbol is being used for padding");
                    None
                }
            }
        }
    }

    fn process_abs_padding(&mut self, start: &Token) -> bool {
        match self.resolve_padding(start) {
            Some(padding) => {
                self.write_addr = padding;
                true
            }
            None => false,
        }
    }

    fn process_rel_padding(&mut self, start: &Token) -> bool {
        match self.resolve_padding(start) {
            Some(padding) => {
                let old_addr = self.write_addr;
                self.write_addr = self.write_addr.wrapping_add(padding);
                if self.write_addr < old_addr {
                    self.warning(start, "Relative padding caused wrap around");
                }
                true
            }
            None => false,
        }
    }

    fn process_lit_number(&mut self, start: &Token) -> bool {
        let s = start.lexeme[1..].to_string();
        if s.is_empty() {
            return self.error(start, "Invalid number: Empty string");
        }
        if !s.starts_with('+') && s.len() != 2 && s.len() != 4 {
            return self.error(start, "Invalid number: Invalid number of hex digits");
        }
        let Some((number, num_bytes)) = self.parse_number(start, &s) else {
            return false;
        };
        if num_bytes == 1 {
            self.emit_opcode(start, op::LIT, true) && self.emit_byte(start, number as u8, true)
        } else {
            self.emit_opcode(start, op::LIT2, true) && self.emit_short(start, number, true)
        }
    }

    fn process_raw_number(&mut self, token: &Token) -> bool {
        let s = token.lexeme.to_string();
        if s.is_empty() {
            return self.error(token, "Invalid number: Empty string");
        }
        if !s.starts_with('+') && s.len() != 2 && s.len() != 4 {
            return self.error(token, "Invalid number: Invalid number of hex digits");
        }
        let Some((number, num_bytes)) = self.parse_number(token, &s) else {
            return false;
        };
        if num_bytes == 1 {
            self.emit_byte(token, number as u8, false)
        } else {
            self.emit_short(token, number, false)
        }
    }

    fn process_word(&mut self, token: &Token, unit: &mut Unit) -> bool {
        debug_assert!(!lex::is_runic(token.first_char()));

        if let Some(parsed) = op::parse_opcode(&token.lexeme) {
            if parsed.redundant_flag {
                self.warning(token, "Opcode contains redundant flags");
            }
            return self.emit_opcode(token, parsed.opcode, false);
        }

        let name = token.lexeme.to_string();
        let Some(index) = self.find_or_create_symbol(token, &name) else {
            return false;
        };
        match &self.entries[index].kind {
            EntryKind::Macro(_) => {
                self.entries[index].referenced = true;
                self.expand_macro(token, index, unit)
            }
            EntryKind::Label { .. } => {
                self.entries[index].referenced = true;
                if !self.emit_opcode(token, op::JSI, false) {
                    return false;
                }
                let info = self.label_info(index);
                self.emit_backward_ref(token, RefKind::Rel, RefSize::Short, &info, true, false)
            }
            EntryKind::Unknown | EntryKind::Forward { .. } => {
                if !self.emit_opcode(token, op::JSI, false) {
                    return false;
                }
                self.emit_forward_ref(token, RefKind::Rel, RefSize::Short, index, false)
            }
        }
    }

    fn process_text(&mut self, token: &Token) -> bool {
        if token.lexeme.len() <= 1 {
            return self.error(token, "Invalid raw text");
        }

        let sym = Symbol {
            kind: SymbolKind::Text,
            id: token.lexeme.len() as u16,
            name: None,
            name_is_generated: false,
            region: token.region.clone(),
        };
        let addr = self.write_addr;
        let bytes = token.lexeme.as_bytes()[1..].to_vec();
        for (i, byte) in bytes.into_iter().enumerate() {
            if !self.emit(token, byte) {
                return false;
            }
            self.sink.put_symbol(addr.wrapping_add(i as u16), &sym);
        }
        true
    }

    fn process_include(&mut self, token: &Token) -> bool {
        if self.preprocessor_depth >= MAX_PREPROCESSOR_DEPTH {
            return self.error(token, "Max preprocessor depth reached");
        }

        let included = self.interner.intern(&token.lexeme[1..]);
        self.preprocessor_depth += 1;
        let success = self.process_file(Rc::clone(&included));
        self.preprocessor_depth -= 1;

        if !success {
            // Append another error to explain the include chain
            return self.error(
                &Token {
                    lexeme: included,
                    region: token.region.clone(),
                },
                "Error while processing include",
            );
        }
        true
    }

    fn process_unit(&mut self, unit: &mut Unit) -> bool {
        while let Some(token) = self.next_token(unit) {
            debug_assert!(!token.lexeme.is_empty());

            let ok = match token.first_char() {
                b'(' => self.process_comment(&token, unit),
                b')' => self.error(&token, "Unexpected rune"),
                b'[' => {
                    // [word is accepted and ignored
                    self.process_mark(&token);
                    true
                }
                b']' => {
                    if token.lexeme.len() != 1 {
                        self.error(&token, "Invalid runic token")
                    } else {
                        self.process_mark(&token);
                        true
                    }
                }
                b'~' => self.process_include(&token),
                b'%' => self.process_macro(&token, unit),
                b'@' => self.process_global_label(&token),
                b'&' => self.process_local_label(&token),
                b'!' => {
                    self.emit_opcode(&token, op::JMI, true)
                        && self.emit_label_ref(
                            &token,
                            RefKind::Rel,
                            RefSize::Short,
                            &token.lexeme[1..],
                            true,
                        )
                }
                b'?' => {
                    self.emit_opcode(&token, op::JCI, true)
                        && self.emit_label_ref(
                            &token,
                            RefKind::Rel,
                            RefSize::Short,
                            &token.lexeme[1..],
                            true,
                        )
                }
                b'}' => {
                    if token.lexeme.len() != 1 {
                        self.error(&token, "Invalid runic token")
                    } else {
                        self.process_lambda_close(&token)
                    }
                }
                b'{' => {
                    if token.lexeme.len() != 1 {
                        self.error(&token, "Invalid runic token")
                    } else {
                        self.emit_jsi(&token)
                    }
                }
                b'/' => self.emit_jsi(&token),
                b'|' => self.process_abs_padding(&token),
                b'$' => self.process_rel_padding(&token),
                b'#' => self.process_lit_number(&token),
                b'.' => {
                    self.emit_opcode(&token, op::LIT, true)
                        && self.emit_label_ref(
                            &token,
                            RefKind::Zero,
                            RefSize::Byte,
                            &token.lexeme[1..],
                            true,
                        )
                }
                b'-' => self.emit_label_ref(
                    &token,
                    RefKind::Zero,
                    RefSize::Byte,
                    &token.lexeme[1..],
                    true,
                ),
                b',' => {
                    self.emit_opcode(&token, op::LIT, true)
                        && self.emit_label_ref(
                            &token,
                            RefKind::Rel,
                            RefSize::Byte,
                            &token.lexeme[1..],
                            true,
                        )
                }
                b'_' => self.emit_label_ref(
                    &token,
                    RefKind::Rel,
                    RefSize::Byte,
                    &token.lexeme[1..],
                    true,
                ),
                b';' => {
                    self.emit_opcode(&token, op::LIT2, true)
                        && self.emit_label_ref(
                            &token,
                            RefKind::Abs,
                            RefSize::Short,
                            &token.lexeme[1..],
                            true,
                        )
                }
                b'=' => self.emit_label_ref(
                    &token,
                    RefKind::Abs,
                    RefSize::Short,
                    &token.lexeme[1..],
                    true,
                ),
                b'"' => self.process_text(&token),
                _ => {
                    if lex::is_number(&token.lexeme) {
                        self.process_raw_number(&token)
                    } else {
                        self.process_word(&token, unit)
                    }
                }
            };
            if !ok {
                return false;
            }
        }
        self.success
    }

    fn process_file(&mut self, filename: Rc<str>) -> bool {
        let bytes = match self.vfs.read(&filename) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::debug!("could not open {filename}: {err}");
                return self.error_report(
                    Report::new("Could not open file").with_region(Region::file_only(filename)),
                );
            }
        };
        let mut unit = Unit::File(FileUnit::new(filename, bytes));
        self.process_unit(&mut unit)
    }

    // Resolution pass

    fn resolve(&mut self) -> bool {
        let lambdas = std::mem::take(&mut self.lambdas);
        for lambda in &lambdas {
            self.error_report(
                Report::new("Unbalanced lambda").with_region(lambda.token.region.clone()),
            );
        }

        let at_labels = std::mem::take(&mut self.at_labels);
        for at in &at_labels {
            self.warning_at(at.token.region.clone(), "Unreferenced @-label");
        }

        enum Leftover {
            InvalidRefs(Vec<Token>),
            Internal(Token),
            Unreferenced(Token),
            Fine,
        }
        for index in 0..self.entries.len() {
            let leftover = {
                let entry = &self.entries[index];
                match &entry.kind {
                    EntryKind::Forward { refs, .. } => {
                        Leftover::InvalidRefs(refs.iter().map(|r| r.token.clone()).collect())
                    }
                    EntryKind::Unknown => Leftover::Internal(entry.defining_token.clone()),
                    kind => {
                        let is_uppercased = entry
                            .name
                            .as_bytes()
                            .first()
                            .is_some_and(|b| b.is_ascii_uppercase());
                        let is_reset_label =
                            matches!(kind, EntryKind::Label { addr, .. } if *addr == RESET_VECTOR);
                        if !entry.referenced && !is_uppercased && !is_reset_label {
                            Leftover::Unreferenced(entry.defining_token.clone())
                        } else {
                            Leftover::Fine
                        }
                    }
                }
            };
            match leftover {
                Leftover::InvalidRefs(tokens) => {
                    for token in &tokens {
                        self.error(token, "Invalid reference");
                    }
                }
                Leftover::Internal(token) => {
                    self.error(&token, "Internal error: Unknown symbol");
                }
                Leftover::Unreferenced(token) => self.warning(&token, "Unreferenced symbol"),
                Leftover::Fine => {}
            }
        }

        self.success
    }
}
