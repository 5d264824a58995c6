//! A virtual machine for an 8-bit word / 16-bit address stack machine.
//!
//! The machine has two 256-byte stacks (working and return) with 8-bit
//! wrapping pointers, a 256-byte device page split into 16 devices of 16
//! ports each, and a linear byte memory of at least 64 KiB. Execution
//! starts at the reset vector (0x0100) and halts on `BRK` or when a
//! non-zero exit state is written to the system device.
//!
//! Dispatch is a single 256-arm `match` on the opcode byte; every
//! concrete opcode gets its own straight-line code path, with the
//! polymorphic K/R/S variants expanded by macros. The stack pointers and
//! program counter live in locals for the duration of the loop and are
//! flushed to the [`Vm`] around device and hook calls, which may mutate
//! them.

pub mod op;

use bitflags::bitflags;

/// Stack depth, in bytes.
pub const STACK_SIZE: usize = 256;
/// Fixed entry point; the assembler also refuses to emit below it.
pub const RESET_VECTOR: u16 = 0x0100;
/// Size of one directly addressable memory bank.
pub const BANK_SIZE: usize = 0x10000;

/// System device ports (device 0).
mod port {
    pub const EXPANSION: u8 = 0x03;
    pub const WSP: u8 = 0x04;
    pub const RSP: u8 = 0x05;
    pub const METADATA: u8 = 0x07;
    pub const RED: u8 = 0x09;
    pub const GREEN: u8 = 0x0b;
    pub const BLUE: u8 = 0x0d;
    pub const DEBUG: u8 = 0x0e;
    pub const STATE: u8 = 0x0f;
}

bitflags! {
    /// What [`Vm::reset`] clears.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Reset: u8 {
        const STACKS = 1 << 0;
        const DEVICE = 1 << 1;
        const ZERO_PAGE = 1 << 2;
        const HIGH_MEM = 1 << 3;
        const ALL = Self::STACKS.bits()
            | Self::DEVICE.bits()
            | Self::ZERO_PAGE.bits()
            | Self::HIGH_MEM.bits();
    }
}

/// Host-side device page handlers for devices 1..=15. Device 0 (the
/// system device) is handled inside the VM and never reaches these.
pub trait Device {
    /// Read a device port. The device page byte has not been touched;
    /// most devices return `vm.dev[addr]` for passive ports.
    fn dei(&mut self, vm: &mut Vm, addr: u8) -> u8;

    /// React to a write. The device page byte has already been updated.
    fn deo(&mut self, vm: &mut Vm, addr: u8);
}

/// A device backend with no behavior beyond the device page itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDevice;

impl Device for NullDevice {
    fn dei(&mut self, vm: &mut Vm, addr: u8) -> u8 {
        vm.dev[addr as usize]
    }

    fn deo(&mut self, _vm: &mut Vm, _addr: u8) {}
}

/// Machine state.
pub struct Vm {
    pub ws: [u8; STACK_SIZE],
    pub rs: [u8; STACK_SIZE],
    pub wsp: u8,
    pub rsp: u8,
    pub dev: [u8; 256],
    pub pc: u16,
    metadata_addr: u16,
    mem: Box<[u8]>,
}

impl Vm {
    /// Create a machine with `memory_size` bytes of linear memory,
    /// rounded up to at least one bank (64 KiB).
    pub fn new(memory_size: usize) -> Self {
        let memory_size = memory_size.max(BANK_SIZE);
        Self {
            ws: [0; STACK_SIZE],
            rs: [0; STACK_SIZE],
            wsp: 0,
            rsp: 0,
            dev: [0; 256],
            pc: 0,
            metadata_addr: 0,
            mem: vec![0; memory_size].into_boxed_slice(),
        }
    }

    pub fn memory(&self) -> &[u8] {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.mem
    }

    /// Copy a ROM image into memory starting at the reset vector.
    pub fn load_rom(&mut self, rom: &[u8]) {
        let start = RESET_VECTOR as usize;
        let len = rom.len().min(self.mem.len() - start);
        self.mem[start..start + len].copy_from_slice(&rom[..len]);
    }

    pub fn reset(&mut self, flags: Reset) {
        if flags.contains(Reset::STACKS) {
            self.wsp = 0;
            self.rsp = 0;
            self.ws.fill(0);
            self.rs.fill(0);
        }
        if flags.contains(Reset::DEVICE) {
            self.dev.fill(0);
            self.metadata_addr = 0;
        }
        if flags.contains(Reset::ZERO_PAGE) {
            self.mem[..RESET_VECTOR as usize].fill(0);
        }
        if flags.contains(Reset::HIGH_MEM) {
            self.mem[RESET_VECTOR as usize..].fill(0);
        }
    }

    /// Exit state written through the system device, if any. The high
    /// bit is reserved; `Some(0)` means "exit successfully".
    pub fn exit_code(&self) -> Option<u8> {
        let state = self.dev[port::STATE as usize];
        (state != 0).then(|| state & 0x7f)
    }

    /// Address of the metadata block the guest advertised, if any.
    pub fn metadata_addr(&self) -> u16 {
        self.metadata_addr
    }

    /// The four palette colors as `0xAARRGGBB`, widening each 4-bit
    /// channel by repetition.
    pub fn palette(&self) -> [u32; 4] {
        let r = self.dev_load2(0x08);
        let g = self.dev_load2(0x0a);
        let b = self.dev_load2(0x0c);
        let make = |r: u32, g: u32, b: u32| {
            0xff00_0000 | (r << 20) | (r << 16) | (g << 12) | (g << 8) | (b << 4) | b
        };
        let mut palette = [0; 4];
        for (i, slot) in palette.iter_mut().enumerate() {
            let shift = 12 - 4 * i;
            *slot = make(
                (r >> shift) as u32 & 0x0f,
                (g >> shift) as u32 & 0x0f,
                (b >> shift) as u32 & 0x0f,
            );
        }
        palette
    }

    fn dev_load2(&self, addr: u8) -> u16 {
        ((self.dev[addr as usize] as u16) << 8) | self.dev[addr.wrapping_add(1) as usize] as u16
    }

    fn mem_load2(&self, addr: u32) -> u16 {
        let lo = self.mem.len() - 1;
        ((self.mem[(addr as usize).min(lo)] as u16) << 8)
            | self.mem[(addr as usize + 1).min(lo)] as u16
    }

    fn system_dei(&mut self, addr: u8) -> u8 {
        match addr {
            port::WSP => self.wsp,
            port::RSP => self.rsp,
            _ => self.dev[addr as usize],
        }
    }

    fn system_deo(&mut self, addr: u8) {
        match addr {
            port::EXPANSION => self.expansion(),
            port::WSP => self.wsp = self.dev[addr as usize],
            port::RSP => self.rsp = self.dev[addr as usize],
            port::METADATA => self.metadata_addr = self.dev_load2(0x06),
            port::RED | port::GREEN | port::BLUE => {
                log::debug!("palette changed: {:08x?}", self.palette());
            }
            port::DEBUG => {
                if self.dev[addr as usize] != 0 {
                    self.debug_dump();
                }
            }
            _ => {}
        }
    }

    /// Expansion command: an op block in memory holding one of memset
    /// (0x00), copy-forward (0x01) or copy-backward (0x02), with
    /// bank-qualified addresses clamped to the configured memory size.
    fn expansion(&mut self) {
        let op_addr = self.dev_load2(0x02) as u32;
        let op = self.mem[(op_addr as usize).min(self.mem.len() - 1)];
        let memory_size = self.mem.len() as u32;
        let length = self.mem_load2(op_addr + 1) as u32;
        match op {
            0x00 => {
                let bank = self.mem_load2(op_addr + 3) as u32;
                let addr = self.mem_load2(op_addr + 5) as u32;
                let start = (bank * BANK_SIZE as u32 + addr).min(memory_size);
                let end = (start + length).min(memory_size);
                let fill_value = self.mem[(op_addr as usize + 7).min(self.mem.len() - 1)];
                self.mem[start as usize..end as usize].fill(fill_value);
            }
            0x01 | 0x02 => {
                let src_bank = self.mem_load2(op_addr + 3) as u32;
                let src_addr = self.mem_load2(op_addr + 5) as u32;
                let src = (src_bank * BANK_SIZE as u32 + src_addr).min(memory_size);
                let dst_bank = self.mem_load2(op_addr + 7) as u32;
                let dst_addr = self.mem_load2(op_addr + 9) as u32;
                let dst = (dst_bank * BANK_SIZE as u32 + dst_addr).min(memory_size);
                let end = (src.max(dst) + length).min(memory_size);
                let length = (end - src.max(dst)) as usize;
                let (src, dst) = (src as usize, dst as usize);
                if op == 0x01 {
                    for i in 0..length {
                        self.mem[dst + i] = self.mem[src + i];
                    }
                } else {
                    for i in (0..length).rev() {
                        self.mem[dst + i] = self.mem[src + i];
                    }
                }
            }
            _ => {}
        }
    }

    fn debug_dump(&self) {
        let fmt = |stack: &[u8], sp: u8| {
            stack[..sp as usize]
                .iter()
                .map(|byte| format!(" {byte:02x}"))
                .collect::<String>()
        };
        log::debug!("WST{}", fmt(&self.ws, self.wsp));
        log::debug!("RST{}", fmt(&self.rs, self.rsp));
    }

    /// Run from `vector` until `BRK` or a non-zero exit state. A zero
    /// vector is ignored.
    pub fn execute<D: Device>(&mut self, dev: &mut D, vector: u16) {
        if vector == 0 {
            return;
        }
        self.run(dev, vector, |_, _| {});
    }

    /// Like [`Vm::execute`] but invokes `hook` with the machine and the
    /// current program counter before every instruction fetch. The hook
    /// may mutate the stacks, the stack pointers and `pc`; the loop
    /// reloads all of them after each call.
    pub fn execute_hooked<D: Device>(
        &mut self,
        dev: &mut D,
        vector: u16,
        hook: impl FnMut(&mut Vm, u16),
    ) {
        if vector == 0 {
            return;
        }
        self.run(dev, vector, hook);
    }

    fn run<D: Device, H: FnMut(&mut Vm, u16)>(&mut self, dev: &mut D, vector: u16, mut hook: H) {
        let mut pc: u16 = vector;
        let mut wsp: u8 = self.wsp;
        let mut rsp: u8 = self.rsp;
        #[allow(unused_assignments)]
        let mut kwsp: u8 = 0;
        #[allow(unused_assignments)]
        let mut krsp: u8 = 0;

        macro_rules! save_state {
            () => {{
                self.wsp = wsp;
                self.rsp = rsp;
                self.pc = pc;
            }};
        }
        macro_rules! load_state {
            () => {{
                wsp = self.wsp;
                rsp = self.rsp;
                pc = self.pc;
            }};
        }

        // Raw stack cells; pointers wrap at 8 bits.
        macro_rules! pop1 {
            ($st:ident, $sp:ident) => {{
                $sp = $sp.wrapping_sub(1);
                self.$st[$sp as usize] as u16
            }};
        }
        macro_rules! pop2 {
            ($st:ident, $sp:ident) => {{
                $sp = $sp.wrapping_sub(2);
                ((self.$st[$sp as usize] as u16) << 8)
                    | self.$st[$sp.wrapping_add(1) as usize] as u16
            }};
        }
        macro_rules! push1 {
            ($st:ident, $sp:ident, $v:expr) => {{
                self.$st[$sp as usize] = ($v & 0xff) as u8;
                $sp = $sp.wrapping_add(1);
            }};
        }
        macro_rules! push2 {
            ($st:ident, $sp:ident, $v:expr) => {{
                let v: u16 = $v;
                self.$st[$sp as usize] = (v >> 8) as u8;
                self.$st[$sp.wrapping_add(1) as usize] = (v & 0xff) as u8;
                $sp = $sp.wrapping_add(2);
            }};
        }

        // Mode-selected pop/push: pop!(K, R, S), push!(R, S, value).
        // Keep-mode pops go through a shadow pointer so the popped
        // values stay on the real stack; pushes always hit the real
        // pointer.
        macro_rules! pop {
            (f, f, f) => { pop1!(ws, wsp) };
            (f, f, t) => { pop2!(ws, wsp) };
            (f, t, f) => { pop1!(rs, rsp) };
            (f, t, t) => { pop2!(rs, rsp) };
            (t, f, f) => { pop1!(ws, kwsp) };
            (t, f, t) => { pop2!(ws, kwsp) };
            (t, t, f) => { pop1!(rs, krsp) };
            (t, t, t) => { pop2!(rs, krsp) };
        }
        macro_rules! push {
            (f, f, $v:expr) => { push1!(ws, wsp, $v) };
            (f, t, $v:expr) => { push2!(ws, wsp, $v) };
            (t, f, $v:expr) => { push1!(rs, rsp, $v) };
            (t, t, $v:expr) => { push2!(rs, rsp, $v) };
        }
        macro_rules! shadow {
            (f, $r:tt) => {};
            (t, f) => {
                kwsp = wsp
            };
            (t, t) => {
                krsp = rsp
            };
        }

        // Memory accessors. Absolute addresses wrap modulo 65536;
        // zero-page addresses wrap modulo 256 in the low byte.
        macro_rules! load {
            (f, $a:expr) => {
                self.mem[($a as usize) & 0xffff] as u16
            };
            (t, $a:expr) => {{
                let a: u16 = $a;
                ((self.mem[(a as usize) & 0xffff] as u16) << 8)
                    | self.mem[(a.wrapping_add(1) as usize) & 0xffff] as u16
            }};
        }
        macro_rules! store {
            (f, $a:expr, $v:expr) => {
                self.mem[($a as usize) & 0xffff] = ($v & 0xff) as u8
            };
            (t, $a:expr, $v:expr) => {{
                let a: u16 = $a;
                let v: u16 = $v;
                self.mem[(a as usize) & 0xffff] = (v >> 8) as u8;
                self.mem[(a.wrapping_add(1) as usize) & 0xffff] = (v & 0xff) as u8;
            }};
        }
        macro_rules! loadz {
            (f, $a:expr) => {
                self.mem[($a as usize) & 0xff] as u16
            };
            (t, $a:expr) => {{
                let a: u16 = $a;
                ((self.mem[(a as usize) & 0xff] as u16) << 8)
                    | self.mem[(a.wrapping_add(1) as usize) & 0xff] as u16
            }};
        }
        macro_rules! storez {
            (f, $a:expr, $v:expr) => {
                self.mem[($a as usize) & 0xff] = ($v & 0xff) as u8
            };
            (t, $a:expr, $v:expr) => {{
                let a: u16 = $a;
                let v: u16 = $v;
                self.mem[(a as usize) & 0xff] = (v >> 8) as u8;
                self.mem[(a.wrapping_add(1) as usize) & 0xff] = (v & 0xff) as u8;
            }};
        }

        macro_rules! pc_rel {
            ($a:expr) => {
                pc.wrapping_add((($a & 0xff) as u8 as i8) as u16)
            };
        }
        macro_rules! jmp {
            (f, $a:expr) => {
                pc = pc_rel!($a)
            };
            (t, $a:expr) => {
                pc = $a
            };
        }

        // Device I/O routes through the host; the hook and the device
        // may re-enter the machine, so the cached registers are flushed
        // around every call.
        macro_rules! dev_in {
            (f, $a:expr) => {{
                let a = ($a & 0xff) as u8;
                save_state!();
                let v = self.dei_dispatch(dev, a) as u16;
                load_state!();
                v
            }};
            (t, $a:expr) => {{
                let a = ($a & 0xff) as u8;
                save_state!();
                let v = ((self.dei_dispatch(dev, a) as u16) << 8)
                    | self.dei_dispatch(dev, a.wrapping_add(1)) as u16;
                load_state!();
                v
            }};
        }
        macro_rules! dev_out {
            (f, $a:expr, $v:expr) => {{
                let a = ($a & 0xff) as u8;
                self.dev[a as usize] = ($v & 0xff) as u8;
                save_state!();
                self.deo_dispatch(dev, a);
                load_state!();
            }};
            (t, $a:expr, $v:expr) => {{
                let a = ($a & 0xff) as u8;
                let v: u16 = $v;
                self.dev[a as usize] = (v >> 8) as u8;
                self.dev[a.wrapping_add(1) as usize] = (v & 0xff) as u8;
                save_state!();
                self.deo_dispatch(dev, a);
                self.deo_dispatch(dev, a.wrapping_add(1));
                load_state!();
            }};
        }

        // One macro per base operation, instantiated for each of the
        // eight K/R/S combinations below.
        macro_rules! op_inc {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let a = pop!($k, $r, $s).wrapping_add(1);
                push!($r, $s, a);
            }};
        }
        macro_rules! op_pop {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let _ = pop!($k, $r, $s);
            }};
        }
        macro_rules! op_nip {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let b = pop!($k, $r, $s);
                let _ = pop!($k, $r, $s);
                push!($r, $s, b);
            }};
        }
        macro_rules! op_swp {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let b = pop!($k, $r, $s);
                let a = pop!($k, $r, $s);
                push!($r, $s, b);
                push!($r, $s, a);
            }};
        }
        macro_rules! op_rot {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let c = pop!($k, $r, $s);
                let b = pop!($k, $r, $s);
                let a = pop!($k, $r, $s);
                push!($r, $s, b);
                push!($r, $s, c);
                push!($r, $s, a);
            }};
        }
        macro_rules! op_dup {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let a = pop!($k, $r, $s);
                push!($r, $s, a);
                push!($r, $s, a);
            }};
        }
        macro_rules! op_ovr {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let b = pop!($k, $r, $s);
                let a = pop!($k, $r, $s);
                push!($r, $s, a);
                push!($r, $s, b);
                push!($r, $s, a);
            }};
        }
        macro_rules! op_cmp {
            ($k:tt, $r:tt, $s:tt, $cmp:expr) => {{
                shadow!($k, $r);
                let b = pop!($k, $r, $s);
                let a = pop!($k, $r, $s);
                let c = $cmp(&a, &b) as u16;
                push!($r, f, c);
            }};
        }
        macro_rules! op_jmp {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let a = pop!($k, $r, $s);
                jmp!($s, a);
            }};
        }
        macro_rules! op_jcn {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let b = pop!($k, $r, $s);
                let a = pop!($k, $r, f);
                if a != 0 {
                    jmp!($s, b);
                }
            }};
        }
        // The return address goes to whichever stack currently plays
        // the return role.
        macro_rules! op_jsr {
            ($k:tt, f, $s:tt) => {{
                shadow!($k, f);
                push2!(rs, rsp, pc);
                let a = pop!($k, f, $s);
                jmp!($s, a);
            }};
            ($k:tt, t, $s:tt) => {{
                shadow!($k, t);
                push2!(ws, wsp, pc);
                let a = pop!($k, t, $s);
                jmp!($s, a);
            }};
        }
        macro_rules! op_sth {
            ($k:tt, f, $s:tt) => {{
                shadow!($k, f);
                let a = pop!($k, f, $s);
                push!(t, $s, a);
            }};
            ($k:tt, t, $s:tt) => {{
                shadow!($k, t);
                let a = pop!($k, t, $s);
                push!(f, $s, a);
            }};
        }
        macro_rules! op_ldz {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let a = pop!($k, $r, f);
                let b = loadz!($s, a);
                push!($r, $s, b);
            }};
        }
        macro_rules! op_stz {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let a = pop!($k, $r, f);
                let b = pop!($k, $r, $s);
                storez!($s, a, b);
            }};
        }
        macro_rules! op_ldr {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let a = pop!($k, $r, f);
                let b = load!($s, pc_rel!(a));
                push!($r, $s, b);
            }};
        }
        macro_rules! op_str {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let a = pop!($k, $r, f);
                let b = pop!($k, $r, $s);
                store!($s, pc_rel!(a), b);
            }};
        }
        macro_rules! op_lda {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let a = pop!($k, $r, t);
                let b = load!($s, a);
                push!($r, $s, b);
            }};
        }
        macro_rules! op_sta {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let a = pop!($k, $r, t);
                let b = pop!($k, $r, $s);
                store!($s, a, b);
            }};
        }
        macro_rules! op_dei {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let a = pop!($k, $r, f);
                let b = dev_in!($s, a);
                push!($r, $s, b);
            }};
        }
        macro_rules! op_deo {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let a = pop!($k, $r, f);
                let b = pop!($k, $r, $s);
                dev_out!($s, a, b);
                if self.dev[port::STATE as usize] != 0 {
                    save_state!();
                    return;
                }
            }};
        }
        macro_rules! op_bin {
            ($k:tt, $r:tt, $s:tt, $f:expr) => {{
                shadow!($k, $r);
                let b = pop!($k, $r, $s);
                let a = pop!($k, $r, $s);
                let c = $f(a, b);
                push!($r, $s, c);
            }};
        }
        macro_rules! op_sft {
            ($k:tt, $r:tt, $s:tt) => {{
                shadow!($k, $r);
                let b = pop!($k, $r, f);
                let a = pop!($k, $r, $s);
                let c = (a >> (b & 0x0f)) << ((b & 0xf0) >> 4);
                push!($r, $s, c);
            }};
        }

        let div = |a: u16, b: u16| if b != 0 { a / b } else { 0 };
        let eq = |a: &u16, b: &u16| a == b;
        let ne = |a: &u16, b: &u16| a != b;
        let gt = |a: &u16, b: &u16| a > b;
        let lt = |a: &u16, b: &u16| a < b;

        loop {
            save_state!();
            hook(&mut *self, pc);
            load_state!();

            let opcode = self.mem[(pc as usize) & 0xffff];
            pc = pc.wrapping_add(1);

            match opcode {
                // Immediate opcodes
                0x00 => {
                    // BRK
                    save_state!();
                    return;
                }
                0x20 => {
                    // JCI: cond8 --
                    let a = pop1!(ws, wsp);
                    if a != 0 {
                        let b = load!(t, pc);
                        pc = pc.wrapping_add(b.wrapping_add(2));
                    } else {
                        pc = pc.wrapping_add(2);
                    }
                }
                0x40 => {
                    // JMI
                    let a = load!(t, pc);
                    pc = pc.wrapping_add(a.wrapping_add(2));
                }
                0x60 => {
                    // JSI
                    push2!(rs, rsp, pc.wrapping_add(2));
                    let a = load!(t, pc);
                    pc = pc.wrapping_add(a.wrapping_add(2));
                }
                0x80 => {
                    // LIT
                    let a = load!(f, pc);
                    pc = pc.wrapping_add(1);
                    push1!(ws, wsp, a);
                }
                0xa0 => {
                    // LIT2
                    let a = load!(t, pc);
                    pc = pc.wrapping_add(2);
                    push2!(ws, wsp, a);
                }
                0xc0 => {
                    // LITr
                    let a = load!(f, pc);
                    pc = pc.wrapping_add(1);
                    push1!(rs, rsp, a);
                }
                0xe0 => {
                    // LIT2r
                    let a = load!(t, pc);
                    pc = pc.wrapping_add(2);
                    push2!(rs, rsp, a);
                }

                0x01 => op_inc!(f, f, f),
                0x21 => op_inc!(f, f, t),
                0x41 => op_inc!(f, t, f),
                0x61 => op_inc!(f, t, t),
                0x81 => op_inc!(t, f, f),
                0xa1 => op_inc!(t, f, t),
                0xc1 => op_inc!(t, t, f),
                0xe1 => op_inc!(t, t, t),

                0x02 => op_pop!(f, f, f),
                0x22 => op_pop!(f, f, t),
                0x42 => op_pop!(f, t, f),
                0x62 => op_pop!(f, t, t),
                0x82 => op_pop!(t, f, f),
                0xa2 => op_pop!(t, f, t),
                0xc2 => op_pop!(t, t, f),
                0xe2 => op_pop!(t, t, t),

                0x03 => op_nip!(f, f, f),
                0x23 => op_nip!(f, f, t),
                0x43 => op_nip!(f, t, f),
                0x63 => op_nip!(f, t, t),
                0x83 => op_nip!(t, f, f),
                0xa3 => op_nip!(t, f, t),
                0xc3 => op_nip!(t, t, f),
                0xe3 => op_nip!(t, t, t),

                0x04 => op_swp!(f, f, f),
                0x24 => op_swp!(f, f, t),
                0x44 => op_swp!(f, t, f),
                0x64 => op_swp!(f, t, t),
                0x84 => op_swp!(t, f, f),
                0xa4 => op_swp!(t, f, t),
                0xc4 => op_swp!(t, t, f),
                0xe4 => op_swp!(t, t, t),

                0x05 => op_rot!(f, f, f),
                0x25 => op_rot!(f, f, t),
                0x45 => op_rot!(f, t, f),
                0x65 => op_rot!(f, t, t),
                0x85 => op_rot!(t, f, f),
                0xa5 => op_rot!(t, f, t),
                0xc5 => op_rot!(t, t, f),
                0xe5 => op_rot!(t, t, t),

                0x06 => op_dup!(f, f, f),
                0x26 => op_dup!(f, f, t),
                0x46 => op_dup!(f, t, f),
                0x66 => op_dup!(f, t, t),
                0x86 => op_dup!(t, f, f),
                0xa6 => op_dup!(t, f, t),
                0xc6 => op_dup!(t, t, f),
                0xe6 => op_dup!(t, t, t),

                0x07 => op_ovr!(f, f, f),
                0x27 => op_ovr!(f, f, t),
                0x47 => op_ovr!(f, t, f),
                0x67 => op_ovr!(f, t, t),
                0x87 => op_ovr!(t, f, f),
                0xa7 => op_ovr!(t, f, t),
                0xc7 => op_ovr!(t, t, f),
                0xe7 => op_ovr!(t, t, t),

                0x08 => op_cmp!(f, f, f, eq),
                0x28 => op_cmp!(f, f, t, eq),
                0x48 => op_cmp!(f, t, f, eq),
                0x68 => op_cmp!(f, t, t, eq),
                0x88 => op_cmp!(t, f, f, eq),
                0xa8 => op_cmp!(t, f, t, eq),
                0xc8 => op_cmp!(t, t, f, eq),
                0xe8 => op_cmp!(t, t, t, eq),

                0x09 => op_cmp!(f, f, f, ne),
                0x29 => op_cmp!(f, f, t, ne),
                0x49 => op_cmp!(f, t, f, ne),
                0x69 => op_cmp!(f, t, t, ne),
                0x89 => op_cmp!(t, f, f, ne),
                0xa9 => op_cmp!(t, f, t, ne),
                0xc9 => op_cmp!(t, t, f, ne),
                0xe9 => op_cmp!(t, t, t, ne),

                0x0a => op_cmp!(f, f, f, gt),
                0x2a => op_cmp!(f, f, t, gt),
                0x4a => op_cmp!(f, t, f, gt),
                0x6a => op_cmp!(f, t, t, gt),
                0x8a => op_cmp!(t, f, f, gt),
                0xaa => op_cmp!(t, f, t, gt),
                0xca => op_cmp!(t, t, f, gt),
                0xea => op_cmp!(t, t, t, gt),

                0x0b => op_cmp!(f, f, f, lt),
                0x2b => op_cmp!(f, f, t, lt),
                0x4b => op_cmp!(f, t, f, lt),
                0x6b => op_cmp!(f, t, t, lt),
                0x8b => op_cmp!(t, f, f, lt),
                0xab => op_cmp!(t, f, t, lt),
                0xcb => op_cmp!(t, t, f, lt),
                0xeb => op_cmp!(t, t, t, lt),

                0x0c => op_jmp!(f, f, f),
                0x2c => op_jmp!(f, f, t),
                0x4c => op_jmp!(f, t, f),
                0x6c => op_jmp!(f, t, t),
                0x8c => op_jmp!(t, f, f),
                0xac => op_jmp!(t, f, t),
                0xcc => op_jmp!(t, t, f),
                0xec => op_jmp!(t, t, t),

                0x0d => op_jcn!(f, f, f),
                0x2d => op_jcn!(f, f, t),
                0x4d => op_jcn!(f, t, f),
                0x6d => op_jcn!(f, t, t),
                0x8d => op_jcn!(t, f, f),
                0xad => op_jcn!(t, f, t),
                0xcd => op_jcn!(t, t, f),
                0xed => op_jcn!(t, t, t),

                0x0e => op_jsr!(f, f, f),
                0x2e => op_jsr!(f, f, t),
                0x4e => op_jsr!(f, t, f),
                0x6e => op_jsr!(f, t, t),
                0x8e => op_jsr!(t, f, f),
                0xae => op_jsr!(t, f, t),
                0xce => op_jsr!(t, t, f),
                0xee => op_jsr!(t, t, t),

                0x0f => op_sth!(f, f, f),
                0x2f => op_sth!(f, f, t),
                0x4f => op_sth!(f, t, f),
                0x6f => op_sth!(f, t, t),
                0x8f => op_sth!(t, f, f),
                0xaf => op_sth!(t, f, t),
                0xcf => op_sth!(t, t, f),
                0xef => op_sth!(t, t, t),

                0x10 => op_ldz!(f, f, f),
                0x30 => op_ldz!(f, f, t),
                0x50 => op_ldz!(f, t, f),
                0x70 => op_ldz!(f, t, t),
                0x90 => op_ldz!(t, f, f),
                0xb0 => op_ldz!(t, f, t),
                0xd0 => op_ldz!(t, t, f),
                0xf0 => op_ldz!(t, t, t),

                0x11 => op_stz!(f, f, f),
                0x31 => op_stz!(f, f, t),
                0x51 => op_stz!(f, t, f),
                0x71 => op_stz!(f, t, t),
                0x91 => op_stz!(t, f, f),
                0xb1 => op_stz!(t, f, t),
                0xd1 => op_stz!(t, t, f),
                0xf1 => op_stz!(t, t, t),

                0x12 => op_ldr!(f, f, f),
                0x32 => op_ldr!(f, f, t),
                0x52 => op_ldr!(f, t, f),
                0x72 => op_ldr!(f, t, t),
                0x92 => op_ldr!(t, f, f),
                0xb2 => op_ldr!(t, f, t),
                0xd2 => op_ldr!(t, t, f),
                0xf2 => op_ldr!(t, t, t),

                0x13 => op_str!(f, f, f),
                0x33 => op_str!(f, f, t),
                0x53 => op_str!(f, t, f),
                0x73 => op_str!(f, t, t),
                0x93 => op_str!(t, f, f),
                0xb3 => op_str!(t, f, t),
                0xd3 => op_str!(t, t, f),
                0xf3 => op_str!(t, t, t),

                0x14 => op_lda!(f, f, f),
                0x34 => op_lda!(f, f, t),
                0x54 => op_lda!(f, t, f),
                0x74 => op_lda!(f, t, t),
                0x94 => op_lda!(t, f, f),
                0xb4 => op_lda!(t, f, t),
                0xd4 => op_lda!(t, t, f),
                0xf4 => op_lda!(t, t, t),

                0x15 => op_sta!(f, f, f),
                0x35 => op_sta!(f, f, t),
                0x55 => op_sta!(f, t, f),
                0x75 => op_sta!(f, t, t),
                0x95 => op_sta!(t, f, f),
                0xb5 => op_sta!(t, f, t),
                0xd5 => op_sta!(t, t, f),
                0xf5 => op_sta!(t, t, t),

                0x16 => op_dei!(f, f, f),
                0x36 => op_dei!(f, f, t),
                0x56 => op_dei!(f, t, f),
                0x76 => op_dei!(f, t, t),
                0x96 => op_dei!(t, f, f),
                0xb6 => op_dei!(t, f, t),
                0xd6 => op_dei!(t, t, f),
                0xf6 => op_dei!(t, t, t),

                0x17 => op_deo!(f, f, f),
                0x37 => op_deo!(f, f, t),
                0x57 => op_deo!(f, t, f),
                0x77 => op_deo!(f, t, t),
                0x97 => op_deo!(t, f, f),
                0xb7 => op_deo!(t, f, t),
                0xd7 => op_deo!(t, t, f),
                0xf7 => op_deo!(t, t, t),

                0x18 => op_bin!(f, f, f, u16::wrapping_add),
                0x38 => op_bin!(f, f, t, u16::wrapping_add),
                0x58 => op_bin!(f, t, f, u16::wrapping_add),
                0x78 => op_bin!(f, t, t, u16::wrapping_add),
                0x98 => op_bin!(t, f, f, u16::wrapping_add),
                0xb8 => op_bin!(t, f, t, u16::wrapping_add),
                0xd8 => op_bin!(t, t, f, u16::wrapping_add),
                0xf8 => op_bin!(t, t, t, u16::wrapping_add),

                0x19 => op_bin!(f, f, f, u16::wrapping_sub),
                0x39 => op_bin!(f, f, t, u16::wrapping_sub),
                0x59 => op_bin!(f, t, f, u16::wrapping_sub),
                0x79 => op_bin!(f, t, t, u16::wrapping_sub),
                0x99 => op_bin!(t, f, f, u16::wrapping_sub),
                0xb9 => op_bin!(t, f, t, u16::wrapping_sub),
                0xd9 => op_bin!(t, t, f, u16::wrapping_sub),
                0xf9 => op_bin!(t, t, t, u16::wrapping_sub),

                0x1a => op_bin!(f, f, f, u16::wrapping_mul),
                0x3a => op_bin!(f, f, t, u16::wrapping_mul),
                0x5a => op_bin!(f, t, f, u16::wrapping_mul),
                0x7a => op_bin!(f, t, t, u16::wrapping_mul),
                0x9a => op_bin!(t, f, f, u16::wrapping_mul),
                0xba => op_bin!(t, f, t, u16::wrapping_mul),
                0xda => op_bin!(t, t, f, u16::wrapping_mul),
                0xfa => op_bin!(t, t, t, u16::wrapping_mul),

                0x1b => op_bin!(f, f, f, div),
                0x3b => op_bin!(f, f, t, div),
                0x5b => op_bin!(f, t, f, div),
                0x7b => op_bin!(f, t, t, div),
                0x9b => op_bin!(t, f, f, div),
                0xbb => op_bin!(t, f, t, div),
                0xdb => op_bin!(t, t, f, div),
                0xfb => op_bin!(t, t, t, div),

                0x1c => op_bin!(f, f, f, std::ops::BitAnd::bitand),
                0x3c => op_bin!(f, f, t, std::ops::BitAnd::bitand),
                0x5c => op_bin!(f, t, f, std::ops::BitAnd::bitand),
                0x7c => op_bin!(f, t, t, std::ops::BitAnd::bitand),
                0x9c => op_bin!(t, f, f, std::ops::BitAnd::bitand),
                0xbc => op_bin!(t, f, t, std::ops::BitAnd::bitand),
                0xdc => op_bin!(t, t, f, std::ops::BitAnd::bitand),
                0xfc => op_bin!(t, t, t, std::ops::BitAnd::bitand),

                0x1d => op_bin!(f, f, f, std::ops::BitOr::bitor),
                0x3d => op_bin!(f, f, t, std::ops::BitOr::bitor),
                0x5d => op_bin!(f, t, f, std::ops::BitOr::bitor),
                0x7d => op_bin!(f, t, t, std::ops::BitOr::bitor),
                0x9d => op_bin!(t, f, f, std::ops::BitOr::bitor),
                0xbd => op_bin!(t, f, t, std::ops::BitOr::bitor),
                0xdd => op_bin!(t, t, f, std::ops::BitOr::bitor),
                0xfd => op_bin!(t, t, t, std::ops::BitOr::bitor),

                0x1e => op_bin!(f, f, f, std::ops::BitXor::bitxor),
                0x3e => op_bin!(f, f, t, std::ops::BitXor::bitxor),
                0x5e => op_bin!(f, t, f, std::ops::BitXor::bitxor),
                0x7e => op_bin!(f, t, t, std::ops::BitXor::bitxor),
                0x9e => op_bin!(t, f, f, std::ops::BitXor::bitxor),
                0xbe => op_bin!(t, f, t, std::ops::BitXor::bitxor),
                0xde => op_bin!(t, t, f, std::ops::BitXor::bitxor),
                0xfe => op_bin!(t, t, t, std::ops::BitXor::bitxor),

                0x1f => op_sft!(f, f, f),
                0x3f => op_sft!(f, f, t),
                0x5f => op_sft!(f, t, f),
                0x7f => op_sft!(f, t, t),
                0x9f => op_sft!(t, f, f),
                0xbf => op_sft!(t, f, t),
                0xdf => op_sft!(t, t, f),
                0xff => op_sft!(t, t, t),
            }
        }
    }

    fn dei_dispatch<D: Device>(&mut self, dev: &mut D, addr: u8) -> u8 {
        if addr & 0xf0 == 0 {
            self.system_dei(addr)
        } else {
            dev.dei(self, addr)
        }
    }

    fn deo_dispatch<D: Device>(&mut self, dev: &mut D, addr: u8) {
        if addr & 0xf0 == 0 {
            self.system_deo(addr);
        } else {
            dev.deo(self, addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(code: &[u8]) -> Vm {
        let mut vm = Vm::new(BANK_SIZE);
        vm.load_rom(code);
        vm.execute(&mut NullDevice, RESET_VECTOR);
        vm
    }

    #[test]
    fn literals() {
        let vm = run(&[0x80, 0x12, 0xa0, 0x34, 0x56, 0x00]);
        assert_eq!(vm.wsp, 3);
        assert_eq!(&vm.ws[..3], &[0x12, 0x34, 0x56]);
    }

    #[test]
    fn keep_mode_leaves_operands() {
        // LIT 01 LIT 02 ADDk BRK
        let vm = run(&[0x80, 0x01, 0x80, 0x02, 0x98, 0x00]);
        assert_eq!(&vm.ws[..3], &[0x01, 0x02, 0x03]);
        assert_eq!(vm.wsp, 3);
    }

    #[test]
    fn return_mode_swaps_stacks() {
        // LITr 05 INCr BRK
        let vm = run(&[0xc0, 0x05, 0x41, 0x00]);
        assert_eq!(vm.rsp, 1);
        assert_eq!(vm.rs[0], 0x06);
    }

    #[test]
    fn division_by_zero_yields_zero() {
        let vm = run(&[0x80, 0x10, 0x80, 0x00, 0x1b, 0x00]);
        assert_eq!(vm.ws[0], 0x00);
        assert_eq!(vm.wsp, 1);
    }

    #[test]
    fn sft_nibbles() {
        // LIT 34 LIT 10 SFT => (0x34 >> 0) << 1
        let vm = run(&[0x80, 0x34, 0x80, 0x10, 0x1f, 0x00]);
        assert_eq!(vm.ws[0], 0x68);
    }

    #[test]
    fn exit_state_halts() {
        // LIT 12 LIT 0f DEO; the trailing INC must never run.
        let vm = run(&[0x80, 0x12, 0x80, 0x0f, 0x17, 0x01]);
        assert_eq!(vm.exit_code(), Some(0x12));
        assert_eq!(vm.wsp, 0);
    }

    #[test]
    fn jsi_and_return() {
        // JSI +0001; BRK; INC-less subroutine: JMP2r
        // 0x0100: 60 00 01  0x0103: 00  0x0104: 6c
        let vm = run(&[0x60, 0x00, 0x01, 0x00, 0x20 | 0x40 | 0x0c]);
        assert_eq!(vm.rsp, 0);
        assert_eq!(vm.pc, 0x0104);
    }

    #[test]
    fn stack_pointer_ports() {
        // LIT 01 LIT 02 LIT 04 DEI BRK -> reads wsp (2 at DEI time)
        let vm = run(&[0x80, 0x01, 0x80, 0x02, 0x80, 0x04, 0x16, 0x00]);
        assert_eq!(vm.ws[2], 2);
    }

    #[test]
    fn zero_page_wraps_low_byte() {
        // LIT2 ab cd LIT ff STZ2 -> mem[0xff]=ab, mem[0x00]=cd
        let vm = run(&[0xa0, 0xab, 0xcd, 0x80, 0xff, 0x31, 0x00]);
        assert_eq!(vm.memory()[0xff], 0xab);
        assert_eq!(vm.memory()[0x00], 0xcd);
    }

    #[test]
    fn absolute_wraps_16_bits() {
        // LIT2 ab cd LIT2 ff ff STA2 -> mem[0xffff]=ab, mem[0x0000]=cd
        let vm = run(&[0xa0, 0xab, 0xcd, 0xa0, 0xff, 0xff, 0x35, 0x00]);
        assert_eq!(vm.memory()[0xffff], 0xab);
        assert_eq!(vm.memory()[0x0000], 0xcd);
    }

    #[test]
    fn hook_sees_every_pc() {
        let mut vm = Vm::new(BANK_SIZE);
        vm.load_rom(&[0x80, 0x01, 0x01, 0x00]);
        let mut pcs = Vec::new();
        vm.execute_hooked(&mut NullDevice, RESET_VECTOR, |_, pc| pcs.push(pc));
        assert_eq!(pcs, vec![0x0100, 0x0102, 0x0103]);
    }

    #[test]
    fn expansion_memset() {
        let mut vm = Vm::new(BANK_SIZE);
        // Op block at 0x0200: 00 (memset), length 0004, bank 0000, addr 0300, value 7f
        let block = [0x00, 0x00, 0x04, 0x00, 0x00, 0x03, 0x00, 0x7f];
        vm.memory_mut()[0x0200..0x0208].copy_from_slice(&block);
        // LIT2 02 00 LIT 02 DEO2? -> write 0x0200 to ports 02/03
        vm.load_rom(&[0xa0, 0x02, 0x00, 0x80, 0x02, 0x37, 0x00]);
        vm.execute(&mut NullDevice, RESET_VECTOR);
        assert_eq!(&vm.memory()[0x0300..0x0306], &[0x7f, 0x7f, 0x7f, 0x7f, 0x00, 0x00]);
    }
}
