//! Symbolic type-checker for the assembler's output.
//!
//! The checker consumes the assembler's symbol stream alongside the
//! assembled ROM. Stack-effect annotations (a comment immediately
//! following a label, recognized by its `--` or `->` separator) define
//! entry points; each entry is abstractly executed over the byte-code,
//! forking at branches, short-circuiting calls into already-typed
//! routines, and bounding loops by tracking jump arcs. A routine
//! verifies when every surviving trace terminates with stacks matching
//! its declared outputs.

mod exec;
pub mod value;

use rustc_hash::{FxHashMap, FxHashSet};
use std::rc::Rc;
use uxnkit_asm::source::Region;
use uxnkit_asm::{Report, Severity, Symbol, SymbolKind};
use value::{Cast, RoutineKind, Sem, SigStack, Signature, Value, MAX_ARGS};

use exec::Entry;

/// Identifies one abstract execution; 0 means "no trace".
pub type TraceId = u32;

pub const NO_TRACE: TraceId = 0;

/// Longest annotation the parser will buffer before giving up: every
/// argument may carry brackets, a star and a separator.
const MAX_SIG_TOKENS: usize = MAX_ARGS * 4 + 1;

/// Receives checker diagnostics and trace lifecycle events.
///
/// Trace ids on reports let a consumer group diagnostics by execution
/// path; `begin_trace` carries the parent id so forks can be
/// reassembled into a tree.
pub trait Host {
    fn report(&mut self, trace_id: TraceId, severity: Severity, report: &Report);
    fn begin_trace(&mut self, _trace_id: TraceId, _parent_id: TraceId) {}
    fn end_trace(&mut self, _trace_id: TraceId, _success: bool) {}
}

/// What is known about one address: its label, signature and
/// verification status.
pub(crate) struct AddrInfo {
    pub addr: u16,
    pub value: Value,
    pub marked_for_verification: bool,
    pub terminated: bool,
    pub has_error: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SigPart {
    WstIn,
    RstIn,
    WstOut,
    RstOut,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ParsePhase {
    /// Buffering tokens until `--`/`->` proves this is a signature.
    SigScan,
    /// Replaying/consuming signature tokens.
    SigBody,
    /// Buffering tokens until a lone `!` proves this is a cast.
    CastScan,
    /// Replaying/consuming cast tokens.
    CastBody,
}

struct AnnoParse {
    phase: ParsePhase,
    buffered: Vec<(Rc<str>, Region)>,
    part: SigPart,
    sealed: bool,
}

/// The checker. Feed it every symbol the assembler emits, then call
/// [`Chess::end`] with the ROM.
pub struct Chess {
    success: bool,
    next_trace_id: TraceId,

    /// Deduplicated code symbols; `sym_at` indexes into this.
    syms: Vec<Symbol>,
    sym_at: Vec<Option<u32>>,

    addr_infos: Vec<AddrInfo>,
    addr_index: FxHashMap<u16, usize>,

    /// (from_pc << 16 | to_pc) arcs already taken; a second visit ends
    /// the trace.
    jump_arcs: FxHashSet<u32>,

    casts: FxHashMap<u16, Rc<Cast>>,
    pending_cast: Option<Cast>,

    worklist: Vec<Entry>,

    parser: Option<AnnoParse>,
    building_signature: Option<Signature>,
    building_cast: Option<Cast>,
    current_symbol: Option<(u16, Symbol)>,
}

impl Default for Chess {
    fn default() -> Self {
        Self::new()
    }
}

impl Chess {
    pub fn new() -> Self {
        Self {
            success: true,
            next_trace_id: 1,
            syms: Vec::new(),
            sym_at: vec![None; 0x10000],
            addr_infos: Vec::new(),
            addr_index: FxHashMap::default(),
            jump_arcs: FxHashSet::default(),
            casts: FxHashMap::default(),
            pending_cast: None,
            worklist: Vec::new(),
            parser: None,
            building_signature: None,
            building_cast: None,
            current_symbol: None,
        }
    }

    fn ensure_addr_info(&mut self, addr: u16) -> usize {
        if let Some(&index) = self.addr_index.get(&addr) {
            return index;
        }
        let index = self.addr_infos.len();
        self.addr_infos.push(AddrInfo {
            addr,
            value: Value::default(),
            marked_for_verification: false,
            terminated: false,
            has_error: false,
        });
        self.addr_index.insert(addr, index);
        index
    }

    pub(crate) fn addr_info_at(&self, addr: u16) -> Option<usize> {
        self.addr_index.get(&addr).copied()
    }

    fn warn(&mut self, host: &mut dyn Host, message: &str, region: &Region) {
        host.report(
            NO_TRACE,
            Severity::Warning,
            &Report::new(message).with_region(region.clone()),
        );
    }

    /// Route one symbol record from the assembler.
    pub fn handle_symbol(&mut self, addr: u16, sym: &Symbol, host: &mut dyn Host) {
        match sym.kind {
            SymbolKind::Comment => self.handle_comment(sym, host),
            SymbolKind::Label if !sym.name_is_generated => {
                self.current_symbol = Some((addr, sym.clone()));
                self.parser = None;

                let index = self.ensure_addr_info(addr);
                let info = &mut self.addr_infos[index];
                if let Some(name) = &sym.name {
                    info.value.name = Rc::clone(name);
                }
                info.value.region = Some(sym.region.clone());
            }
            SymbolKind::Opcode | SymbolKind::LabelRef | SymbolKind::Number | SymbolKind::Text => {
                // A short emits the same record at two consecutive
                // addresses; keep one symbol for both.
                let reuse = self
                    .syms
                    .last()
                    .is_some_and(|last| last.kind == sym.kind && last.region.same_span(&sym.region));
                let index = if reuse {
                    self.syms.len() as u32 - 1
                } else {
                    self.syms.push(sym.clone());
                    self.current_symbol = Some((addr, sym.clone()));
                    self.parser = None;
                    if let Some(cast) = self.pending_cast.take() {
                        self.casts.insert(addr, Rc::new(cast));
                    }
                    self.syms.len() as u32 - 1
                };
                self.sym_at[addr as usize] = Some(index);
            }
            _ => self.current_symbol = None,
        }
    }

    fn handle_comment(&mut self, sym: &Symbol, host: &mut dyn Host) {
        let name = sym.name.as_deref().unwrap_or("");
        if sym.id == 0 {
            // Comment start
            if name != "(" {
                return;
            }
            let Some((_, current)) = &self.current_symbol else {
                return;
            };
            match current.kind {
                SymbolKind::Label if !current.name_is_generated => {
                    self.parser = Some(AnnoParse {
                        phase: ParsePhase::SigScan,
                        buffered: Vec::new(),
                        part: SigPart::WstIn,
                        sealed: false,
                    });
                }
                SymbolKind::Opcode
                | SymbolKind::LabelRef
                | SymbolKind::Number
                | SymbolKind::Text => {
                    self.parser = Some(AnnoParse {
                        phase: ParsePhase::CastScan,
                        buffered: Vec::new(),
                        part: SigPart::WstIn,
                        sealed: false,
                    });
                }
                _ => {}
            }
        } else if sym.id == 1 && name == ")" {
            // Comment end
            if self.parser.is_some() {
                self.finish_annotation(host);
                self.current_symbol = None;
                self.parser = None;
            }
        } else if sym.id == 1 {
            if self.parser.is_some() {
                let lexeme: Rc<str> = sym.name.clone().unwrap_or_else(|| Rc::from(""));
                self.feed_annotation(&lexeme, &sym.region, host);
            }
        } else {
            // Nested comments cannot be annotations
            self.parser = None;
        }
    }

    fn feed_annotation(&mut self, token: &Rc<str>, region: &Region, host: &mut dyn Host) {
        let Some(parser) = &self.parser else {
            return;
        };
        match parser.phase {
            ParsePhase::SigScan => {
                if &**token == "--" || &**token == "->" {
                    self.building_signature = Some(Signature::empty(RoutineKind::Vector));
                    self.enter_body(ParsePhase::SigBody, token, region, host);
                } else {
                    self.buffer_token(token, region);
                }
            }
            ParsePhase::CastScan => {
                if &**token == "!" {
                    self.building_cast = Some(Cast::default());
                    self.enter_body(ParsePhase::CastBody, token, region, host);
                } else {
                    self.buffer_token(token, region);
                }
            }
            ParsePhase::SigBody => self.parse_signature_token(token, region, host),
            ParsePhase::CastBody => self.parse_cast_token(token, region, host),
        }
    }

    fn buffer_token(&mut self, token: &Rc<str>, region: &Region) {
        let parser = self.parser.as_mut().unwrap();
        if parser.buffered.len() < MAX_SIG_TOKENS {
            parser.buffered.push((Rc::clone(token), region.clone()));
        } else {
            self.parser = None;
        }
    }

    /// Replay everything buffered, then the trigger token, through the
    /// body parser.
    fn enter_body(
        &mut self,
        phase: ParsePhase,
        trigger: &Rc<str>,
        trigger_region: &Region,
        host: &mut dyn Host,
    ) {
        let parser = self.parser.as_mut().unwrap();
        parser.phase = phase;
        parser.part = SigPart::WstIn;
        parser.sealed = false;
        let buffered = std::mem::take(&mut parser.buffered);
        for (token, region) in &buffered {
            if self.parser.is_none() {
                return;
            }
            self.feed_annotation(token, region, host);
        }
        if self.parser.is_some() {
            self.feed_annotation(trigger, trigger_region, host);
        }
    }

    fn parse_value(token: &str, region: &Region) -> Value {
        let mut sem = Sem::empty();
        let mut name = token;
        if let Some(stripped) = name.strip_suffix('*') {
            sem |= Sem::SHORT;
            name = stripped;
        }
        if name.len() >= 2 && name.starts_with('[') && name.ends_with(']') {
            sem |= Sem::ADDRESS;
            name = &name[1..name.len() - 1];
        }

        let name: Rc<str> = Rc::from(name);
        let mut nominal = None;
        if token.as_bytes().first().is_some_and(|b| b.is_ascii_uppercase()) {
            sem |= Sem::NOMINAL;
            nominal = Some(Rc::clone(&name));
        }

        Value {
            name,
            nominal,
            region: Some(region.clone()),
            sem,
            ..Value::default()
        }
    }

    fn parse_signature_token(&mut self, token: &str, region: &Region, host: &mut dyn Host) {
        let parser = self.parser.as_mut().unwrap();
        if parser.sealed {
            self.warn(host, "Unexpected token in sealed signature", region);
            self.parser = None;
            return;
        }

        match token {
            "." => {
                let parser = self.parser.as_mut().unwrap();
                match parser.part {
                    SigPart::WstIn => parser.part = SigPart::RstIn,
                    SigPart::WstOut => parser.part = SigPart::RstOut,
                    _ => {
                        self.warn(host, "Unexpected token in signature", region);
                        self.parser = None;
                    }
                }
            }
            "!" => parser.sealed = true,
            "--" | "->" => {
                let kind = if token == "--" {
                    RoutineKind::Subroutine
                } else {
                    RoutineKind::Vector
                };
                let parser = self.parser.as_mut().unwrap();
                if matches!(parser.part, SigPart::WstIn | SigPart::RstIn) {
                    parser.part = SigPart::WstOut;
                    self.building_signature.as_mut().unwrap().kind = kind;
                } else {
                    self.warn(host, "Unexpected token in signature", region);
                    self.parser = None;
                }
            }
            _ => {
                let value = Self::parse_value(token, region);
                let parser = self.parser.as_ref().unwrap();
                let signature = self.building_signature.as_mut().unwrap();
                let stack: &mut SigStack = match parser.part {
                    SigPart::WstIn => &mut signature.wst_in,
                    SigPart::RstIn => &mut signature.rst_in,
                    SigPart::WstOut => &mut signature.wst_out,
                    SigPart::RstOut => &mut signature.rst_out,
                };
                if stack.len() < MAX_ARGS {
                    stack.push(value);
                } else {
                    self.warn(host, "Too many arguments", region);
                    self.parser = None;
                }
            }
        }
    }

    fn parse_cast_token(&mut self, token: &str, region: &Region, host: &mut dyn Host) {
        let parser = self.parser.as_mut().unwrap();
        if parser.sealed {
            self.warn(host, "Unexpected token in sealed cast", region);
            self.parser = None;
            return;
        }

        match token {
            "." => {
                let parser = self.parser.as_mut().unwrap();
                if parser.part == SigPart::WstIn {
                    parser.part = SigPart::RstIn;
                } else {
                    self.warn(host, "Unexpected token in cast", region);
                    self.parser = None;
                }
            }
            "!" => parser.sealed = true,
            "--" | "->" => {
                self.warn(host, "Unexpected token in cast", region);
                self.parser = None;
            }
            _ => {
                let value = Self::parse_value(token, region);
                let parser = self.parser.as_ref().unwrap();
                let cast = self.building_cast.as_mut().unwrap();
                let stack: &mut SigStack = match parser.part {
                    SigPart::WstIn => &mut cast.wst,
                    SigPart::RstIn => &mut cast.rst,
                    _ => {
                        self.parser = None;
                        return;
                    }
                };
                if stack.len() < MAX_ARGS {
                    stack.push(value);
                } else {
                    self.warn(host, "Too many arguments", region);
                    self.parser = None;
                }
            }
        }
    }

    fn finish_annotation(&mut self, host: &mut dyn Host) {
        let Some(parser) = &self.parser else {
            return;
        };
        match parser.phase {
            ParsePhase::SigBody => {
                let sealed = parser.sealed;
                let signature = self.building_signature.take().unwrap();
                let Some((addr, current)) = self.current_symbol.clone() else {
                    return;
                };
                let index = self.ensure_addr_info(addr);
                if !self.addr_infos[index].value.sem.contains(Sem::ROUTINE) {
                    self.addr_infos[index].value.sem |= Sem::ROUTINE;
                    self.addr_infos[index].value.sig = Some(Rc::new(signature));
                    // Trust a sealed signature and don't verify it
                    if !sealed {
                        self.mark_routine_for_verification(index);
                    }
                } else {
                    self.warn(host, "Routine already has a signature", &current.region);
                }
            }
            ParsePhase::CastBody => {
                if let Some(cast) = self.building_cast.take() {
                    self.pending_cast = Some(cast);
                }
            }
            // Never proved to be a signature or cast; plain text.
            ParsePhase::SigScan | ParsePhase::CastScan => {}
        }
    }

    fn mark_routine_for_verification(&mut self, index: usize) {
        let signature = Rc::clone(self.addr_infos[index].value.sig.as_ref().unwrap());
        let mut state = value::State::default();
        for value in &signature.wst_in {
            state.wst.push_raw(value.clone());
        }
        // A subroutine expects a return address on the return stack
        if signature.kind == RoutineKind::Subroutine {
            state.rst.push_raw(Value {
                name: Rc::from("RETURN"),
                sem: Sem::SHORT | Sem::ADDRESS | Sem::RETURN,
                ..Value::default()
            });
        }
        for value in &signature.rst_in {
            state.rst.push_raw(value.clone());
        }

        let trace_id = self.next_trace_id;
        self.next_trace_id += 1;
        self.addr_infos[index].marked_for_verification = true;
        self.worklist.push(Entry {
            info: index,
            state,
            trace_id,
            parent_trace_id: NO_TRACE,
            address: self.addr_infos[index].addr,
        });
    }

    /// Verify everything. `rom` holds the assembled bytes starting at
    /// address 0x0100.
    pub fn end(&mut self, rom: &[u8], host: &mut dyn Host) -> bool {
        // The reset vector is an implicit on-reset vector when not
        // otherwise annotated
        let reset = self.ensure_addr_info(uxnkit_asm::RESET_VECTOR);
        if self.addr_infos[reset].value.sig.is_none() {
            self.addr_infos[reset].value.sem |= Sem::ROUTINE;
            self.addr_infos[reset].value.sig =
                Some(Rc::new(Signature::empty(RoutineKind::Vector)));
            self.mark_routine_for_verification(reset);
        }
        if self.addr_infos[reset].value.name.is_empty() {
            self.addr_infos[reset].value.name = Rc::from("RESET");
        }

        while let Some(entry) = self.worklist.pop() {
            self.execute(entry, rom, host);
        }

        // A routine that was enqueued but never produced a successful
        // termination path loops forever
        for index in 0..self.addr_infos.len() {
            let info = &self.addr_infos[index];
            if info.marked_for_verification && !info.has_error && !info.terminated {
                let report = match &info.value.region {
                    Some(region) => Report::new(format!("{} does not terminate", info.value.describe()))
                        .with_region(region.clone()),
                    None => Report::new(format!("{} does not terminate", info.value.describe())),
                };
                host.report(NO_TRACE, Severity::Error, &report);
                self.success = false;
            }
        }

        self.success
    }
}

/// Replay an assembler symbol stream and verify the ROM in one call.
pub fn check(symbols: &[(u16, Symbol)], rom: &[u8], host: &mut dyn Host) -> bool {
    let mut chess = Chess::new();
    for (addr, sym) in symbols {
        chess.handle_symbol(*addr, sym, host);
    }
    chess.end(rom, host)
}
