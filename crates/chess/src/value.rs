//! Abstract values and stacks.
//!
//! The checker executes over descriptions of values rather than bytes.
//! A value remembers where it came from (for diagnostics), what is
//! known about it (semantic bits, a concrete value when constant), and
//! how it relates to other values: a short popped one byte at a time
//! splits into two halves that keep a shared handle on the whole, and
//! pushing both halves back in order re-merges the whole, restoring
//! whatever the split erased.

use bitflags::bitflags;
use smallvec::SmallVec;
use std::fmt;
use std::rc::Rc;
use uxnkit_asm::source::Region;

/// Signature stacks hold at most this many declared values.
pub const MAX_ARGS: usize = 8;

bitflags! {
    /// Semantic bits carried by an abstract value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Sem: u16 {
        /// 2 bytes wide; clear means 1 byte.
        const SHORT = 1 << 0;
        /// Concrete value known.
        const CONST = 1 << 1;
        /// Points into memory.
        const ADDRESS = 1 << 2;
        /// The implicit return address of a subroutine.
        const RETURN = 1 << 3;
        /// Target of a typed routine; jumps short-circuit through it.
        const ROUTINE = 1 << 4;
        /// Carries a nominal type name.
        const NOMINAL = 1 << 5;
        /// A boolean produced by a comparison that already forked.
        const FORKED = 1 << 6;
        /// High half of a split short.
        const HALF_HI = 1 << 7;
        /// Low half of a split short.
        const HALF_LO = 1 << 8;
    }
}

/// Whether a routine is entered by call or by vector dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineKind {
    Vector,
    Subroutine,
}

pub type SigStack = SmallVec<[Value; MAX_ARGS]>;

/// A parsed stack-effect annotation.
#[derive(Debug, Clone)]
pub struct Signature {
    pub wst_in: SigStack,
    pub rst_in: SigStack,
    pub wst_out: SigStack,
    pub rst_out: SigStack,
    pub kind: RoutineKind,
}

impl Signature {
    pub fn empty(kind: RoutineKind) -> Self {
        Self {
            wst_in: SigStack::new(),
            rst_in: SigStack::new(),
            wst_out: SigStack::new(),
            rst_out: SigStack::new(),
            kind,
        }
    }
}

/// An inline overwrite of the abstract stack state.
#[derive(Debug, Clone, Default)]
pub struct Cast {
    pub wst: SigStack,
    pub rst: SigStack,
}

/// One abstract value.
#[derive(Debug, Clone)]
pub struct Value {
    pub name: Rc<str>,
    /// Nominal type name, when `sem` carries `NOMINAL`.
    pub nominal: Option<Rc<str>>,
    pub sig: Option<Rc<Signature>>,
    /// The short this byte was split from; both halves share it.
    pub whole: Option<Rc<Value>>,
    pub region: Option<Region>,
    pub value: u16,
    pub sem: Sem,
}

impl Default for Value {
    fn default() -> Self {
        Self {
            name: Rc::from(""),
            nominal: None,
            sig: None,
            whole: None,
            region: None,
            value: 0,
            sem: Sem::empty(),
        }
    }
}

impl Value {
    pub fn named(name: impl AsRef<str>) -> Self {
        Self {
            name: Rc::from(name.as_ref()),
            ..Self::default()
        }
    }

    pub fn error() -> Self {
        Self::named("ERROR")
    }

    pub fn size(&self) -> u8 {
        if self.sem.contains(Sem::SHORT) {
            2
        } else {
            1
        }
    }

    /// An address for load/store purposes: a declared address or any
    /// known constant.
    pub fn is_address_like(&self) -> bool {
        self.sem.intersects(Sem::ADDRESS | Sem::CONST)
    }

    /// `name from file:line:col:byte`, for diagnostics.
    pub fn describe(&self) -> String {
        match &self.region {
            Some(region) => format!(
                "{} from {}:{}:{}:{}",
                self.name,
                region.filename,
                region.start.line,
                region.start.col,
                region.start.byte
            ),
            None => format!("{} from <unknown>", self.name),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sem.contains(Sem::ADDRESS) {
            write!(f, "[{}]", self.name)?;
        } else {
            write!(f, "{}", self.name)?;
        }
        if self.sem.contains(Sem::SHORT) {
            write!(f, "*")?;
        }
        Ok(())
    }
}

/// Format a run of values the way signatures are written, capped at
/// [`MAX_ARGS`] entries.
pub fn format_values(values: &[Value]) -> String {
    let mut out = String::new();
    for value in values.iter().take(MAX_ARGS) {
        out.push(' ');
        out.push_str(&value.to_string());
    }
    if values.len() > MAX_ARGS {
        out.push_str(" ...");
    }
    out
}

/// Total byte width of a signature stack.
pub fn sig_size(values: &[Value]) -> u16 {
    values.iter().map(|v| v.size() as u16).sum()
}

/// An abstract machine stack: values plus a running byte size.
///
/// Invariant: `bytes` is the sum of the element sizes and never
/// exceeds 256.
#[derive(Debug, Clone, Default)]
pub struct Stack {
    pub values: Vec<Value>,
    pub bytes: u16,
}

impl Stack {
    /// Push without merging or overflow checking; used to seed entry
    /// states from signatures.
    pub fn push_raw(&mut self, value: Value) {
        self.bytes += value.size() as u16;
        self.values.push(value);
    }

    pub fn format(&self) -> String {
        format_values(&self.values)
    }
}

/// Both machine stacks.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub wst: Stack,
    pub rst: Stack,
}
