//! Abstract execution of one trace.
//!
//! A trace starts from an entry state derived from a signature and
//! steps through the byte-code applying the machine semantics to
//! abstract values. Comparisons fork the trace (or fold, when both
//! operands are constants the checker itself produced); jumps into
//! typed routines apply the routine's signature instead of recursing;
//! a backward jump arc seen twice ends the trace. Termination checks
//! the final stacks against the routine's declared outputs.

use crate::value::{format_values, sig_size, Cast, RoutineKind, Sem, Stack, State, Value};
use crate::{Chess, Host, TraceId};
use std::rc::Rc;
use uxnkit_asm::source::Region;
use uxnkit_asm::{Report, Severity, SymbolKind};
use uxnkit_vm::op::{self, BaseOp};

/// An in-flight abstract execution.
pub struct Entry {
    pub(crate) info: usize,
    pub(crate) state: State,
    pub(crate) trace_id: TraceId,
    pub(crate) parent_trace_id: TraceId,
    pub(crate) address: u16,
}

/// Which stack a pop reads through; keep-mode pops use the shadow.
#[derive(Clone, Copy, PartialEq, Eq)]
enum StackSel {
    RealW,
    RealR,
    ShadowW,
    ShadowR,
}

struct Exec<'h> {
    host: &'h mut dyn Host,
    rom: &'h [u8],
    entry: Entry,
    init_wst: Stack,
    init_rst: Stack,
    saved_wst: Stack,
    saved_rst: Stack,
    shadow: Option<State>,
    pc: u16,
    current_opcode: u8,
    current_sym: Option<u32>,
    start_sym: Option<u32>,
    terminated: bool,
    error_region: Option<Region>,
    entry_reported: bool,
}

impl Exec<'_> {
    fn rom_byte(&self, addr: u16) -> u8 {
        addr.checked_sub(uxnkit_asm::RESET_VECTOR)
            .and_then(|offset| self.rom.get(offset as usize))
            .copied()
            .unwrap_or(0)
    }

    fn rom_short(&self, addr: u16) -> u16 {
        ((self.rom_byte(addr) as u16) << 8) | self.rom_byte(addr.wrapping_add(1)) as u16
    }

    fn flag_2(&self) -> bool {
        self.current_opcode & op::FLAG_S != 0
    }

    fn flag_k(&self) -> bool {
        self.current_opcode & op::FLAG_K != 0
    }

    fn flag_r(&self) -> bool {
        self.current_opcode & op::FLAG_R != 0
    }

    fn stack_mut(&mut self, sel: StackSel) -> &mut Stack {
        match sel {
            StackSel::RealW => &mut self.entry.state.wst,
            StackSel::RealR => &mut self.entry.state.rst,
            StackSel::ShadowW => &mut self.shadow.as_mut().unwrap().wst,
            StackSel::ShadowR => &mut self.shadow.as_mut().unwrap().rst,
        }
    }

    fn pop_sel(&self, flag_r: bool) -> StackSel {
        match (self.shadow.is_some(), flag_r) {
            (false, false) => StackSel::RealW,
            (false, true) => StackSel::RealR,
            (true, false) => StackSel::ShadowW,
            (true, true) => StackSel::ShadowR,
        }
    }

    fn terminate(&mut self) {
        self.terminated = true;
    }
}

impl Chess {
    fn sym_region(&self, index: Option<u32>) -> Option<Region> {
        index.map(|i| self.syms[i as usize].region.clone())
    }

    fn pc_region(&self, ex: &Exec) -> Option<Region> {
        self.sym_region(ex.current_sym)
    }

    fn format_address(&self, addr: u16) -> String {
        match self.sym_at[addr as usize] {
            Some(index) => {
                let region = &self.syms[index as usize].region;
                format!(
                    "{}:{}:{}",
                    region.filename, region.start.line, region.start.col
                )
            }
            None => format!("0x{addr:04x}"),
        }
    }

    fn trace_log(&self, ex: &Exec, message: &str) {
        log::trace!("[{}] {}", ex.entry.trace_id, message);
    }

    /// A trace's first diagnostic is prefixed with the entry state so
    /// the reader knows which path is being described.
    fn maybe_report_exec_begin(&mut self, ex: &mut Exec) {
        if ex.entry_reported {
            return;
        }
        ex.entry_reported = true;

        let info = &self.addr_infos[ex.entry.info];
        let signature = info.value.sig.as_ref();
        let init_rst = if signature.is_some_and(|sig| sig.kind == RoutineKind::Subroutine) {
            // Exclude the implicit return address
            format_values(ex.init_rst.values.get(1..).unwrap_or(&[]))
        } else {
            ex.init_rst.format()
        };
        let message = format!(
            "Found issues with {} starting with ({} .{} ) from here",
            info.value.name,
            ex.init_wst.format(),
            init_rst
        );
        let region = self
            .sym_region(ex.start_sym)
            .or_else(|| info.value.region.clone());
        let report = match region {
            Some(region) => Report::new(message).with_region(region),
            None => Report::new(message),
        };
        ex.host
            .report(ex.entry.trace_id, Severity::Warning, &report);
    }

    fn report_exec(&mut self, ex: &mut Exec, severity: Severity, message: String) {
        self.maybe_report_exec_begin(ex);
        let region = self
            .pc_region(ex)
            .or_else(|| self.addr_infos[ex.entry.info].value.region.clone());
        let report = match &region {
            Some(region) => Report::new(message).with_region(region.clone()),
            None => Report::new(message),
        };
        ex.host.report(ex.entry.trace_id, severity, &report);

        if severity == Severity::Error {
            ex.error_region = region;
            ex.terminate();
            self.success = false;
            self.addr_infos[ex.entry.info].has_error = true;
        }
    }

    fn exec_error(&mut self, ex: &mut Exec, message: String) {
        self.report_exec(ex, Severity::Error, message);
    }

    fn exec_warning(&mut self, ex: &mut Exec, message: String) {
        self.report_exec(ex, Severity::Warning, message);
    }

    // Stack operations

    fn pop_from(&mut self, ex: &mut Exec, sel: StackSel, size: u8) -> Value {
        if size as u16 > ex.stack_mut(sel).bytes {
            self.exec_error(ex, "Stack underflow".to_string());
            return Value::error();
        }

        let top = ex.stack_mut(sel).values.last().cloned().expect("non-empty");
        let top_size = top.size();
        if top_size == size {
            let stack = ex.stack_mut(sel);
            stack.values.pop();
            stack.bytes -= top_size as u16;
            top
        } else if top_size > size {
            // Break the top short into hi and lo halves
            let region = self.pc_region(ex);
            let whole = Rc::new(top.clone());
            let mut lo = Value {
                name: Rc::from(format!("{}-lo", top.name)),
                region: region.clone(),
                sem: Sem::HALF_LO,
                whole: Some(Rc::clone(&whole)),
                ..Value::default()
            };
            let mut hi = Value {
                name: Rc::from(format!("{}-hi", top.name)),
                region,
                sem: Sem::HALF_HI,
                whole: Some(whole),
                ..Value::default()
            };
            if top.sem.contains(Sem::CONST) {
                lo.sem |= Sem::CONST;
                lo.value = top.value & 0xff;
                hi.sem |= Sem::CONST;
                hi.value = top.value >> 8;
            }
            if top.sem.contains(Sem::FORKED) {
                lo.sem |= Sem::FORKED;
                hi.sem |= Sem::FORKED;
            }

            let stack = ex.stack_mut(sel);
            *stack.values.last_mut().expect("non-empty") = hi;
            stack.bytes -= 1;
            lo
        } else {
            // Merge the top byte with the next value's low part
            let lo = self.pop_from(ex, sel, 1);
            let hi = self.pop_from(ex, sel, 1);
            let mut result = Value {
                name: Rc::from(format!("{}\u{b7}{}", hi.name, lo.name)),
                sem: Sem::SHORT,
                region: self.pc_region(ex),
                ..Value::default()
            };
            if hi.sem.contains(Sem::CONST) && lo.sem.contains(Sem::CONST) {
                result.sem |= Sem::CONST;
                result.value = (hi.value << 8) | lo.value;
            }
            if hi.sem.contains(Sem::FORKED) && lo.sem.contains(Sem::FORKED) {
                result.sem |= Sem::FORKED;
            }
            if hi.sem.contains(Sem::ADDRESS) && lo.sem.contains(Sem::ADDRESS) {
                result.sem |= Sem::ADDRESS;
            }
            result
        }
    }

    fn pop_ex(&mut self, ex: &mut Exec, flag_2: bool, flag_r: bool) -> Value {
        if ex.terminated {
            return Value::error();
        }
        let sel = ex.pop_sel(flag_r);
        self.pop_from(ex, sel, if flag_2 { 2 } else { 1 })
    }

    fn pop(&mut self, ex: &mut Exec) -> Value {
        let (flag_2, flag_r) = (ex.flag_2(), ex.flag_r());
        self.pop_ex(ex, flag_2, flag_r)
    }

    fn push_ex(&mut self, ex: &mut Exec, flag_r: bool, mut value: Value) {
        if ex.terminated {
            return;
        }
        if value.region.is_none() {
            value.region = self.pc_region(ex);
        }

        let value_size = value.size() as u16;
        // Pushes always land on the real stack
        let stack = if flag_r {
            &mut ex.entry.state.rst
        } else {
            &mut ex.entry.state.wst
        };
        if stack.bytes + value_size > 256 {
            self.exec_error(ex, "Stack overflow".to_string());
            return;
        }

        // Re-merge a split short pushed back in order
        let merged = match (stack.values.last(), &value.whole) {
            (Some(top), Some(whole))
                if value.sem.contains(Sem::HALF_LO)
                    && top.sem.contains(Sem::HALF_HI)
                    && top
                        .whole
                        .as_ref()
                        .is_some_and(|top_whole| Rc::ptr_eq(top_whole, whole)) =>
            {
                Some((**whole).clone())
            }
            _ => None,
        };
        match merged {
            Some(whole) => {
                *stack.values.last_mut().expect("non-empty") = whole;
                stack.bytes += 1;
            }
            None => {
                stack.bytes += value_size;
                stack.values.push(value);
            }
        }
    }

    fn push(&mut self, ex: &mut Exec, value: Value) {
        let flag_r = ex.flag_r();
        self.push_ex(ex, flag_r, value);
    }

    // Signature checks

    fn check_stack(
        &mut self,
        ex: &mut Exec,
        at_least: bool,
        stack_name: &str,
        sel: StackSel,
        signature: &[Value],
    ) {
        let sig_bytes = sig_size(signature);
        let stack_bytes = ex.stack_mut(sel).bytes;
        let matches = if at_least {
            stack_bytes >= sig_bytes
        } else {
            stack_bytes == sig_bytes
        };
        if !matches {
            let sig_str = format_values(signature);
            let stack_str = ex.stack_mut(sel).format();
            let prefix = if at_least { "at least " } else { "" };
            self.exec_error(
                ex,
                format!(
                    "{stack_name} stack size mismatch: \
                     Expecting {prefix}{sig_bytes} ({sig_str} ), got {stack_bytes} ({stack_str} )"
                ),
            );
        }
        if ex.terminated {
            return;
        }

        // Type check individual elements
        for index in (0..signature.len()).rev() {
            let sig_value = signature[index].clone();
            let actual = self.pop_from(ex, sel, sig_value.size());

            if sig_value.sem.contains(Sem::ADDRESS)
                && !actual.sem.contains(Sem::ADDRESS)
                && !actual.sem.contains(Sem::CONST)
            {
                self.exec_warning(
                    ex,
                    format!(
                        "{stack_name} stack #{index}: An address value ({}) \
                         is constructed from a non-address ({})",
                        sig_value.describe(),
                        actual.describe()
                    ),
                );
            }

            if sig_value.sem.contains(Sem::ROUTINE) && !actual.sem.contains(Sem::ROUTINE) {
                self.exec_error(
                    ex,
                    format!(
                        "{stack_name} stack #{index}: A routine value ({}) \
                         cannot be constructed from a non-routine value ({})",
                        sig_value.name, actual.name
                    ),
                );
            }

            if sig_value.sem.contains(Sem::NOMINAL) {
                // A raw value can become nominal; a nominal value is
                // assignable when the declared type is a prefix of its
                // type ("Suits/Heart" fits "Suits/")
                let declared = sig_value.nominal.as_deref().unwrap_or("");
                let compatible = !actual.sem.contains(Sem::NOMINAL)
                    || actual
                        .nominal
                        .as_deref()
                        .is_some_and(|actual_type| actual_type.starts_with(declared));
                if !compatible {
                    self.exec_error(
                        ex,
                        format!(
                            "{stack_name} stack #{index}: A value of type \"{}\" ({}) \
                             cannot be constructed from a value of type \"{}\" ({})",
                            declared,
                            sig_value.name,
                            actual.nominal.as_deref().unwrap_or(""),
                            actual.name
                        ),
                    );
                }
            }
        }
    }

    fn check_return(&mut self, ex: &mut Exec) {
        let signature = Rc::clone(self.addr_infos[ex.entry.info].value.sig.as_ref().unwrap());
        self.check_stack(
            ex,
            false,
            "Output working",
            StackSel::RealW,
            &signature.wst_out,
        );
        self.check_stack(
            ex,
            false,
            "Output return",
            StackSel::RealR,
            &signature.rst_out,
        );
    }

    // Control flow

    fn fork(&mut self, ex: &mut Exec) -> Entry {
        let trace_id = self.next_trace_id;
        self.next_trace_id += 1;
        let entry = Entry {
            info: ex.entry.info,
            state: ex.entry.state.clone(),
            trace_id,
            parent_trace_id: ex.entry.trace_id,
            address: ex.pc,
        };
        self.trace_log(
            ex,
            &format!(
                "[{}] Forked {} at {}",
                trace_id,
                self.addr_infos[ex.entry.info].value.name,
                self.format_address(ex.pc)
            ),
        );
        entry
    }

    fn abs_jmp(&mut self, ex: &mut Exec, addr: Value) -> JumpOutcome {
        if addr.sem.contains(Sem::ADDRESS) && addr.sem.contains(Sem::RETURN) {
            let own_kind = self.addr_infos[ex.entry.info]
                .value
                .sig
                .as_ref()
                .unwrap()
                .kind;
            if own_kind == RoutineKind::Vector {
                self.exec_error(ex, "Vector routine makes a normal return".to_string());
            }
            self.trace_log(ex, "Terminated by jumping to return address");
            self.addr_infos[ex.entry.info].terminated = true;
            self.check_return(ex);
            ex.terminate();
            JumpOutcome::Returned
        } else if addr.sem.contains(Sem::CONST) {
            ex.pc = addr.value;
            JumpOutcome::Continue
        } else {
            self.exec_error(
                ex,
                format!("Jumping to an unknown address: {}", addr.describe()),
            );
            JumpOutcome::Continue
        }
    }

    /// Apply a typed routine's effect without executing its body.
    fn short_circuit(&mut self, ex: &mut Exec, target: usize) {
        let signature = Rc::clone(self.addr_infos[target].value.sig.as_ref().unwrap());
        let own_kind = self.addr_infos[ex.entry.info]
            .value
            .sig
            .as_ref()
            .unwrap()
            .kind;
        if own_kind == RoutineKind::Subroutine && signature.kind == RoutineKind::Vector {
            self.exec_error(ex, "Subroutine jumps into a vector".to_string());
            return;
        }

        // Divergent input fails the call site, not the callee
        self.check_stack(
            ex,
            true,
            "Input working",
            StackSel::RealW,
            &signature.wst_in,
        );
        self.check_stack(ex, true, "Input return", StackSel::RealR, &signature.rst_in);

        // Push outputs with the call site as their origin
        for output in &signature.wst_out {
            let mut output = output.clone();
            output.region = self.pc_region(ex);
            self.push_ex(ex, false, output);
        }
        for output in &signature.rst_out {
            let mut output = output.clone();
            output.region = self.pc_region(ex);
            self.push_ex(ex, true, output);
        }

        if signature.kind == RoutineKind::Subroutine {
            if ex.entry.state.rst.bytes >= 2 {
                let return_addr = self.pop_from(ex, StackSel::RealR, 2);
                // A termination caused by recursion proves nothing;
                // mutual recursion through short-circuiting is accepted
                // as the price of bounded analysis
                if self.abs_jmp(ex, return_addr) == JumpOutcome::Returned {
                    self.addr_infos[ex.entry.info].terminated = target != ex.entry.info;
                }
            } else {
                self.exec_error(
                    ex,
                    "RST is too small to contain a return address".to_string(),
                );
            }
        } else {
            self.trace_log(ex, "Terminated by jumping into a vector");
            self.check_return(ex);
            ex.terminate();
            self.addr_infos[ex.entry.info].terminated = target != ex.entry.info;
        }
    }

    fn jump(&mut self, ex: &mut Exec, addr: Value) {
        if ex.terminated {
            return;
        }

        let from_pc = ex.pc;
        if !addr.sem.contains(Sem::SHORT) {
            // Relative jump
            if addr.sem.contains(Sem::CONST) {
                ex.pc = ex.pc.wrapping_add((addr.value as u8 as i8) as u16);
            } else {
                self.exec_error(
                    ex,
                    format!("Jumping to an unknown address: {}", addr.describe()),
                );
            }
        } else {
            self.abs_jmp(ex, addr);
        }
        if ex.terminated {
            return;
        }

        let target = self.addr_info_at(ex.pc);
        if let Some(target) =
            target.filter(|&t| self.addr_infos[t].value.sem.contains(Sem::ROUTINE))
        {
            self.trace_log(
                ex,
                &format!(
                    "Short-circuited jump into {}",
                    self.addr_infos[target].value.describe()
                ),
            );
            self.short_circuit(ex, target);
        } else {
            // The first traversal of a loop body applies its effect
            // once; a second traversal applied to the fixpoint confirms
            // idempotence, so a repeated arc ends the trace
            let arc = ((from_pc as u32) << 16) | ex.pc as u32;
            if !self.jump_arcs.insert(arc) {
                self.trace_log(
                    ex,
                    &format!("Terminated by repeated jump to {}", self.format_address(ex.pc)),
                );
                ex.terminate();
            }
        }
    }

    fn jump_stash(&mut self, ex: &mut Exec, addr: Value, flag_r: bool) {
        let return_addr = Value {
            name: Rc::from("RETURN-SUB"),
            sem: Sem::SHORT | Sem::ADDRESS | Sem::CONST,
            value: ex.pc,
            ..Value::default()
        };
        self.push_ex(ex, !flag_r, return_addr);
        self.jump(ex, addr);
    }

    fn jump_conditional(&mut self, ex: &mut Exec, cond: Value, addr: Value) {
        if cond.sem.contains(Sem::CONST) && cond.sem.contains(Sem::FORKED) {
            // A forked boolean already knows which branch this trace is
            if cond.value != 0 {
                self.jump(ex, addr);
            }
        } else {
            let false_branch = self.fork(ex);
            self.worklist.push(false_branch);
            self.jump(ex, addr);
        }
    }

    fn immediate_jump_target(&mut self, ex: &mut Exec) -> Value {
        let hi_addr = ex.pc;
        let lo_addr = ex.pc.wrapping_add(1);
        ex.pc = ex.pc.wrapping_add(2);
        let sym_hi = self.sym_at[hi_addr as usize];
        let sym_lo = self.sym_at[lo_addr as usize];

        match sym_hi {
            Some(index)
                if sym_hi == sym_lo
                    && self.syms[index as usize].kind == SymbolKind::LabelRef =>
            {
                let distant = ex.rom_short(hi_addr);
                let target = ex.pc.wrapping_add(distant);
                let name = match &self.syms[index as usize].name {
                    Some(name) => Rc::clone(name),
                    None => Rc::from(format!("load@0x{target:04x}")),
                };
                Value {
                    name,
                    sem: Sem::SHORT | Sem::ADDRESS | Sem::CONST,
                    value: target,
                    ..Value::default()
                }
            }
            _ => {
                self.exec_error(ex, "Invalid jump address".to_string());
                Value::error()
            }
        }
    }

    // Memory

    fn load(&mut self, ex: &mut Exec, addr: Value) {
        if ex.terminated {
            return;
        }

        if !addr.is_address_like() {
            self.exec_warning(
                ex,
                format!(
                    "Load address ({}) is not a constant or an offset of one",
                    addr.describe()
                ),
            );
        }

        let mut value = Value::default();
        if addr.sem.contains(Sem::CONST) {
            if let Some(index) = self.addr_info_at(addr.value) {
                // A labelled location carries its declared value
                value = self.addr_infos[index].value.clone();
                value.region = self.pc_region(ex);
                value.name = Rc::from(format!("load@{}", self.addr_infos[index].value.name));
            } else {
                if self.sym_at[addr.value as usize]
                    .is_some_and(|i| self.syms[i as usize].kind == SymbolKind::Opcode)
                {
                    self.exec_warning(
                        ex,
                        format!(
                            "Load address ({}) points to an executable region",
                            addr.describe()
                        ),
                    );
                }
                value.name = Rc::from(format!("load@0x{:04x}", ex.pc));
            }
        } else {
            value.name = Rc::from(format!("load@0x{:04x}", ex.pc));
        }

        if ex.flag_2() {
            value.sem |= Sem::SHORT;
        }
        self.push(ex, value);
    }

    fn store(&mut self, ex: &mut Exec, addr: Value, _value: Value) {
        if ex.terminated {
            return;
        }

        if !addr.is_address_like() {
            self.exec_warning(
                ex,
                format!(
                    "Store address ({}) is not a constant or an offset of one",
                    addr.describe()
                ),
            );
        }

        if addr.sem.contains(Sem::CONST)
            && self.addr_info_at(addr.value).is_none()
            && self.sym_at[addr.value as usize]
                .is_some_and(|i| self.syms[i as usize].kind == SymbolKind::Opcode)
        {
            self.exec_warning(
                ex,
                format!(
                    "Store address ({}) points to an executable region",
                    addr.describe()
                ),
            );
        }
    }

    // Literals

    fn make_lit_byte(&mut self, ex: &mut Exec, addr: u16, sym: Option<u32>) -> Value {
        let mut value = Value::default();
        match sym {
            None => {
                self.exec_warning(ex, "Loading unlabelled literal".to_string());
                value.name = Rc::from(format!("lit@0x{addr:04x}"));
            }
            Some(index) if self.syms[index as usize].kind == SymbolKind::LabelRef => {
                value.sem |= Sem::ADDRESS | Sem::CONST;
                value.value = ex.rom_byte(addr) as u16;
                value.name = match &self.syms[index as usize].name {
                    Some(name) => Rc::clone(name),
                    None => Rc::from(format!("load@0x{:04x}", value.value)),
                };
            }
            Some(_) => {
                value.value = ex.rom_byte(addr) as u16;
                value.name = Rc::from(format!("0x{:02x}", value.value));
                value.sem |= Sem::CONST;
            }
        }
        value
    }

    fn op_lit(&mut self, ex: &mut Exec) {
        if !ex.flag_2() {
            let lit_addr = ex.pc;
            ex.pc = ex.pc.wrapping_add(1);
            let sym = self.sym_at[lit_addr as usize];
            let value = match self.addr_info_at(lit_addr) {
                Some(index) => {
                    // A labelled literal (a "door") reads as its
                    // declared value
                    let mut value = self.addr_infos[index].value.clone();
                    value.region = self.pc_region(ex);
                    value.sem &= !Sem::SHORT;
                    value
                }
                None if sym.is_some() => self.make_lit_byte(ex, lit_addr, sym),
                None => Value::default(),
            };
            self.push(ex, value);
        } else {
            let hi_addr = ex.pc;
            let lo_addr = ex.pc.wrapping_add(1);
            ex.pc = ex.pc.wrapping_add(2);
            let sym_hi = self.sym_at[hi_addr as usize];
            let sym_lo = self.sym_at[lo_addr as usize];
            let info_hi = self.addr_info_at(hi_addr);
            let info_lo = self.addr_info_at(lo_addr);

            if let Some(info_hi) = info_hi {
                if info_lo.is_none() && sym_lo.is_none() {
                    let mut value = self.addr_infos[info_hi].value.clone();
                    value.region = self.pc_region(ex);
                    value.sem |= Sem::SHORT;
                    self.push(ex, value);
                } else if let Some(info_lo) = info_lo {
                    let mut hi = self.addr_infos[info_hi].value.clone();
                    hi.region = self.pc_region(ex);
                    hi.sem &= !Sem::SHORT;
                    self.push(ex, hi);

                    let mut lo = self.addr_infos[info_lo].value.clone();
                    lo.region = self.pc_region(ex);
                    lo.sem &= !Sem::SHORT;
                    self.push(ex, lo);
                } else {
                    let mut hi = self.addr_infos[info_hi].value.clone();
                    hi.region = self.pc_region(ex);
                    hi.sem &= !Sem::SHORT;
                    self.push(ex, hi);

                    let lo = self.make_lit_byte(ex, lo_addr, sym_lo);
                    self.push(ex, lo);
                }
            } else if sym_hi == sym_lo {
                // One symbol covering both bytes
                match sym_hi {
                    Some(index) => {
                        let kind = self.syms[index as usize].kind;
                        let mut value = Value {
                            sem: Sem::SHORT,
                            ..Value::default()
                        };
                        match kind {
                            SymbolKind::LabelRef => {
                                value.sem |= Sem::ADDRESS | Sem::CONST;
                                value.value = ex.rom_short(hi_addr);
                                value.name = match &self.syms[index as usize].name {
                                    Some(name) => Rc::clone(name),
                                    None => Rc::from(format!("load@0x{:04x}", value.value)),
                                };
                            }
                            SymbolKind::Number | SymbolKind::Text | SymbolKind::Opcode => {
                                value.value = ex.rom_short(hi_addr);
                                value.name = Rc::from(format!("0x{:04x}", value.value));
                                value.sem |= Sem::CONST;
                            }
                            _ => {
                                self.exec_warning(ex, "Loading unlabelled literal".to_string());
                                value.name = Rc::from(format!("lit@0x{hi_addr:04x}"));
                            }
                        }
                        self.push(ex, value);
                    }
                    None => {
                        self.exec_warning(ex, "Loading unlabelled literal".to_string());
                        let value = Value {
                            name: Rc::from(format!("lit@0x{hi_addr:04x}")),
                            sem: Sem::SHORT,
                            ..Value::default()
                        };
                        self.push(ex, value);
                    }
                }
            } else {
                // Two unrelated symbols
                let hi = self.make_lit_byte(ex, hi_addr, sym_hi);
                self.push(ex, hi);
                let lo = self.make_lit_byte(ex, lo_addr, sym_lo);
                self.push(ex, lo);
            }
        }
    }

    // Operators

    fn name_binary(a: &Value, b: &Value) -> Rc<str> {
        Rc::from(format!("{}\u{b7}{}", a.name, b.name))
    }

    fn boolean_op(&mut self, ex: &mut Exec, op: fn(u16, u16) -> bool) {
        let b = self.pop(ex);
        let a = self.pop(ex);
        let mut result = Value {
            name: Self::name_binary(&a, &b),
            sem: Sem::CONST | Sem::FORKED,
            ..Value::default()
        };
        let both_const_forked = a.sem.contains(Sem::CONST | Sem::FORKED)
            && b.sem.contains(Sem::CONST | Sem::FORKED);
        if both_const_forked {
            // Both sides already belong to a decided path; just fold
            result.value = op(a.value, b.value) as u16;
            self.push(ex, result);
        } else {
            // `EQU ?addr` wants to follow each branch exactly once, so
            // the comparison itself forks: this trace takes true, the
            // fork takes false
            let mut false_branch = self.fork(ex);
            let flag_r = ex.flag_r();
            let stack = if flag_r {
                &mut false_branch.state.rst
            } else {
                &mut false_branch.state.wst
            };
            let mut false_value = result.clone();
            false_value.value = 0;
            stack.push_raw(false_value);
            self.worklist.push(false_branch);

            result.value = 1;
            self.push(ex, result);
        }
    }

    fn binary_op(&mut self, ex: &mut Exec, preserve_address: bool, op: fn(u16, u16) -> u16) {
        let b = self.pop(ex);
        let a = self.pop(ex);
        let mut result = Value {
            name: Self::name_binary(&a, &b),
            sem: if ex.flag_2() { Sem::SHORT } else { Sem::empty() },
            ..Value::default()
        };
        if a.sem.contains(Sem::CONST) && b.sem.contains(Sem::CONST) {
            result.sem |= Sem::CONST;
            result.value = op(a.value, b.value);
        }
        if preserve_address && (a.sem.contains(Sem::ADDRESS) || b.sem.contains(Sem::ADDRESS)) {
            result.sem |= Sem::ADDRESS;
        }
        self.push(ex, result);
    }

    // Dispatch

    fn apply_cast(&mut self, ex: &mut Exec, cast: &Cast) {
        for (sel, declared) in [(StackSel::RealW, &cast.wst), (StackSel::RealR, &cast.rst)] {
            for value in declared.iter().rev() {
                let size = value.size();
                self.pop_from(ex, sel, size);
                if ex.terminated {
                    return;
                }
            }
            for value in declared.iter() {
                let flag_r = sel == StackSel::RealR;
                self.push_ex(ex, flag_r, value.clone());
                if ex.terminated {
                    return;
                }
            }
        }
    }

    fn dump_stacks(&self, ex: &Exec) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }
        self.trace_log(
            ex,
            &format!(
                "WST({}):{}",
                ex.entry.state.wst.values.len(),
                ex.entry.state.wst.format()
            ),
        );
        self.trace_log(
            ex,
            &format!(
                "RST({}):{}",
                ex.entry.state.rst.values.len(),
                ex.entry.state.rst.format()
            ),
        );
    }

    pub(crate) fn execute(&mut self, entry: Entry, rom: &[u8], host: &mut dyn Host) {
        let start_sym = self.sym_at[entry.address as usize];
        let mut ex = Exec {
            host,
            rom,
            init_wst: entry.state.wst.clone(),
            init_rst: entry.state.rst.clone(),
            saved_wst: Stack::default(),
            saved_rst: Stack::default(),
            shadow: None,
            pc: entry.address,
            current_opcode: 0,
            current_sym: start_sym,
            start_sym,
            terminated: false,
            error_region: None,
            entry_reported: false,
            entry,
        };

        ex.host
            .begin_trace(ex.entry.trace_id, ex.entry.parent_trace_id);
        self.trace_log(
            &ex,
            &format!(
                "Analyzing {} starting from {}",
                self.addr_infos[ex.entry.info].value.name,
                self.format_address(ex.entry.address)
            ),
        );
        self.dump_stacks(&ex);

        if ex.start_sym.is_none() {
            self.exec_error(&mut ex, "Execution will reach non-opcode".to_string());
        }

        while !ex.terminated {
            if ex.pc < uxnkit_asm::RESET_VECTOR {
                self.exec_error(&mut ex, "Execution will reach zero page".to_string());
                break;
            }

            // Falling through into a typed routine applies its effect;
            // its own body is analyzed by its own traces
            loop {
                let Some(target) = self.addr_info_at(ex.pc) else {
                    break;
                };
                if ex.terminated
                    || target == ex.entry.info
                    || !self.addr_infos[target].value.sem.contains(Sem::ROUTINE)
                {
                    break;
                }
                self.trace_log(
                    &ex,
                    &format!(
                        "Executing ({}) at {}",
                        self.addr_infos[target].value.describe(),
                        self.format_address(ex.pc)
                    ),
                );
                ex.saved_wst = ex.entry.state.wst.clone();
                ex.saved_rst = ex.entry.state.rst.clone();
                self.short_circuit(&mut ex, target);
                self.dump_stacks(&ex);
            }
            if ex.terminated {
                break;
            }

            if let Some(cast) = self.casts.get(&ex.pc).cloned() {
                self.apply_cast(&mut ex, &cast);
                if ex.terminated {
                    break;
                }
            }

            let pc = ex.pc;
            ex.pc = ex.pc.wrapping_add(1);
            let current_sym = self.sym_at[pc as usize];
            ex.current_opcode = ex.rom_byte(pc);
            if log::log_enabled!(log::Level::Trace) {
                self.trace_log(
                    &ex,
                    &format!(
                        "Executing {} at {}",
                        op::name(ex.current_opcode),
                        self.format_address(pc)
                    ),
                );
            }
            if current_sym
                .map(|i| self.syms[i as usize].kind)
                .is_none_or(|kind| kind != SymbolKind::Opcode)
            {
                self.exec_error(&mut ex, "Execution will reach non-opcode".to_string());
                break;
            }
            ex.current_sym = current_sym;

            ex.saved_wst = ex.entry.state.wst.clone();
            ex.saved_rst = ex.entry.state.rst.clone();
            // Keep-mode pops read through a snapshot
            ex.shadow = if ex.flag_k() {
                Some(ex.entry.state.clone())
            } else {
                None
            };

            match op::decode(ex.current_opcode).base {
                BaseOp::Brk => {
                    let own_kind = self.addr_infos[ex.entry.info]
                        .value
                        .sig
                        .as_ref()
                        .unwrap()
                        .kind;
                    if own_kind == RoutineKind::Subroutine {
                        self.exec_error(&mut ex, "Subroutine called BRK".to_string());
                    }
                    self.trace_log(&ex, "Terminated by BRK");
                    self.addr_infos[ex.entry.info].terminated = true;
                    self.check_return(&mut ex);
                    ex.terminate();
                }
                BaseOp::Inc => {
                    let mut value = self.pop(&mut ex);
                    if value.sem.contains(Sem::CONST) {
                        value.value = value.value.wrapping_add(1);
                    }
                    value.sem &= !(Sem::NOMINAL | Sem::HALF_HI | Sem::HALF_LO);
                    value.whole = None;
                    value.name = Rc::from(format!("{}\u{2032}", value.name));
                    self.push(&mut ex, value);
                }
                BaseOp::Pop => {
                    self.pop(&mut ex);
                }
                BaseOp::Nip => {
                    let b = self.pop(&mut ex);
                    let _a = self.pop(&mut ex);
                    self.push(&mut ex, b);
                }
                BaseOp::Swp => {
                    let b = self.pop(&mut ex);
                    let a = self.pop(&mut ex);
                    self.push(&mut ex, b);
                    self.push(&mut ex, a);
                }
                BaseOp::Rot => {
                    let c = self.pop(&mut ex);
                    let b = self.pop(&mut ex);
                    let a = self.pop(&mut ex);
                    self.push(&mut ex, b);
                    self.push(&mut ex, c);
                    self.push(&mut ex, a);
                }
                BaseOp::Dup => {
                    let a = self.pop(&mut ex);
                    self.push(&mut ex, a.clone());
                    self.push(&mut ex, a);
                }
                BaseOp::Ovr => {
                    let b = self.pop(&mut ex);
                    let a = self.pop(&mut ex);
                    self.push(&mut ex, a.clone());
                    self.push(&mut ex, b);
                    self.push(&mut ex, a);
                }
                BaseOp::Equ => self.boolean_op(&mut ex, |a, b| a == b),
                BaseOp::Neq => self.boolean_op(&mut ex, |a, b| a != b),
                BaseOp::Gth => self.boolean_op(&mut ex, |a, b| a > b),
                BaseOp::Lth => self.boolean_op(&mut ex, |a, b| a < b),
                BaseOp::Jmp => {
                    let addr = self.pop(&mut ex);
                    self.jump(&mut ex, addr);
                }
                BaseOp::Jcn => {
                    let addr = self.pop(&mut ex);
                    let flag_r = ex.flag_r();
                    let cond = self.pop_ex(&mut ex, false, flag_r);
                    self.jump_conditional(&mut ex, cond, addr);
                }
                BaseOp::Jsr => {
                    let addr = self.pop(&mut ex);
                    let flag_r = ex.flag_r();
                    self.jump_stash(&mut ex, addr, flag_r);
                }
                BaseOp::Sth => {
                    let a = self.pop(&mut ex);
                    let flag_r = ex.flag_r();
                    self.push_ex(&mut ex, !flag_r, a);
                }
                BaseOp::Ldz => {
                    let flag_r = ex.flag_r();
                    let addr = self.pop_ex(&mut ex, false, flag_r);
                    self.load(&mut ex, addr);
                }
                BaseOp::Stz => {
                    let flag_r = ex.flag_r();
                    let addr = self.pop_ex(&mut ex, false, flag_r);
                    let value = self.pop(&mut ex);
                    self.store(&mut ex, addr, value);
                }
                BaseOp::Ldr => {
                    let flag_r = ex.flag_r();
                    let mut addr = self.pop_ex(&mut ex, false, flag_r);
                    if addr.sem.contains(Sem::CONST) {
                        addr.value = ex.pc.wrapping_add((addr.value as u8 as i8) as u16);
                    }
                    self.load(&mut ex, addr);
                }
                BaseOp::Str => {
                    let flag_r = ex.flag_r();
                    let mut addr = self.pop_ex(&mut ex, false, flag_r);
                    let value = self.pop(&mut ex);
                    if addr.sem.contains(Sem::CONST) {
                        addr.value = ex.pc.wrapping_add((addr.value as u8 as i8) as u16);
                    }
                    self.store(&mut ex, addr, value);
                }
                BaseOp::Lda => {
                    let flag_r = ex.flag_r();
                    let addr = self.pop_ex(&mut ex, true, flag_r);
                    self.load(&mut ex, addr);
                }
                BaseOp::Sta => {
                    let flag_r = ex.flag_r();
                    let addr = self.pop_ex(&mut ex, true, flag_r);
                    let value = self.pop(&mut ex);
                    self.store(&mut ex, addr, value);
                }
                BaseOp::Dei => {
                    let flag_r = ex.flag_r();
                    let addr = self.pop_ex(&mut ex, false, flag_r);
                    if !addr.is_address_like() {
                        self.exec_warning(
                            &mut ex,
                            format!("DEI from non-address value ({})", addr.describe()),
                        );
                    }
                    let value = Value {
                        name: Rc::from(format!("dei@{}", addr.name)),
                        sem: if ex.flag_2() { Sem::SHORT } else { Sem::empty() },
                        ..Value::default()
                    };
                    self.push(&mut ex, value);
                }
                BaseOp::Deo => {
                    let flag_r = ex.flag_r();
                    let addr = self.pop_ex(&mut ex, false, flag_r);
                    let _value = self.pop(&mut ex);
                    if !addr.is_address_like() {
                        self.exec_warning(
                            &mut ex,
                            format!("DEO from non-address value ({})", addr.describe()),
                        );
                    }
                }
                BaseOp::Add => self.binary_op(&mut ex, true, u16::wrapping_add),
                BaseOp::Sub => self.binary_op(&mut ex, true, u16::wrapping_sub),
                BaseOp::Mul => self.binary_op(&mut ex, false, u16::wrapping_mul),
                BaseOp::Div => {
                    self.binary_op(&mut ex, false, |a, b| if b != 0 { a / b } else { 0 })
                }
                BaseOp::And => self.binary_op(&mut ex, false, |a, b| a & b),
                BaseOp::Ora => self.binary_op(&mut ex, false, |a, b| a | b),
                BaseOp::Eor => self.binary_op(&mut ex, false, |a, b| a ^ b),
                BaseOp::Sft => {
                    let flag_r = ex.flag_r();
                    let shift = self.pop_ex(&mut ex, false, flag_r);
                    let value = self.pop(&mut ex);
                    let mut result = Value {
                        name: Self::name_binary(&value, &shift),
                        sem: if ex.flag_2() { Sem::SHORT } else { Sem::empty() },
                        ..Value::default()
                    };
                    if value.sem.contains(Sem::CONST) && shift.sem.contains(Sem::CONST) {
                        result.sem |= Sem::CONST;
                        result.value =
                            (value.value >> (shift.value & 0x0f)) << ((shift.value & 0xf0) >> 4);
                    }
                    self.push(&mut ex, result);
                }
                BaseOp::Jci => {
                    let addr = self.immediate_jump_target(&mut ex);
                    let cond = self.pop_ex(&mut ex, false, false);
                    self.jump_conditional(&mut ex, cond, addr);
                }
                BaseOp::Jmi => {
                    let addr = self.immediate_jump_target(&mut ex);
                    self.jump(&mut ex, addr);
                }
                BaseOp::Jsi => {
                    let addr = self.immediate_jump_target(&mut ex);
                    self.jump_stash(&mut ex, addr, false);
                }
                BaseOp::Lit => self.op_lit(&mut ex),
            }

            self.dump_stacks(&ex);
        }

        // Show the state leading into the failure
        if let Some(region) = ex.error_region.clone() {
            let message = format!(
                "Stack before error:{} .{}",
                ex.saved_wst.format(),
                ex.saved_rst.format()
            );
            ex.host.report(
                ex.entry.trace_id,
                Severity::Info,
                &Report::new(message).with_region(region),
            );
        }

        ex.host
            .end_trace(ex.entry.trace_id, ex.error_region.is_none());
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum JumpOutcome {
    Returned,
    Continue,
}
