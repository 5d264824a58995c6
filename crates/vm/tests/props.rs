//! Machine-level invariants.

use proptest::prelude::*;
use uxnkit_vm::{op, NullDevice, Reset, Vm, BANK_SIZE, RESET_VECTOR};

fn run(code: &[u8]) -> Vm {
    let _ = env_logger::try_init();
    let mut vm = Vm::new(BANK_SIZE);
    vm.reset(Reset::ALL);
    vm.load_rom(code);
    vm.execute(&mut NullDevice, RESET_VECTOR);
    vm
}

#[test]
fn opcode_decoding_is_a_bijection() {
    for byte in 0..=0xffu8 {
        let decoded = op::decode(byte);
        assert_eq!(op::encode(decoded), byte, "{}", op::name(byte));
    }
}

#[test]
fn opcode_names_are_unique() {
    let mut seen = std::collections::HashSet::new();
    for byte in 0..=0xffu8 {
        assert!(seen.insert(op::name(byte)), "duplicate {}", op::name(byte));
    }
}

proptest! {
    // Pushing a literal and popping it back is the identity, on either
    // stack and at either width.
    #[test]
    fn push_pop_round_trip(value in any::<u16>(), ret in any::<bool>(), short in any::<bool>()) {
        let lit = match (ret, short) {
            (false, false) => op::LIT,
            (false, true) => op::LIT2,
            (true, false) => op::LITR,
            (true, true) => op::LIT2R,
        };
        let mut code = vec![lit];
        if short {
            code.extend_from_slice(&value.to_be_bytes());
        } else {
            code.push(value as u8);
        }
        code.push(op::BRK);

        let vm = run(&code);
        let (stack, sp) = if ret { (&vm.rs, vm.rsp) } else { (&vm.ws, vm.wsp) };
        if short {
            prop_assert_eq!(sp, 2);
            prop_assert_eq!(((stack[0] as u16) << 8) | stack[1] as u16, value);
        } else {
            prop_assert_eq!(sp, 1);
            prop_assert_eq!(stack[0], value as u8);
        }
    }

    // Popping one byte of a short leaves its high half on the stack
    // and yields its low half.
    #[test]
    fn split_short_keeps_the_high_half(value in any::<u16>()) {
        let mut code = vec![op::LIT2];
        code.extend_from_slice(&value.to_be_bytes());
        code.extend_from_slice(&[0x02, op::BRK]); // POP
        let vm = run(&code);
        prop_assert_eq!(vm.wsp, 1);
        prop_assert_eq!(vm.ws[0], (value >> 8) as u8);
    }

    // Absolute stores wrap modulo 65536.
    #[test]
    fn absolute_stores_wrap(addr in any::<u16>(), value in any::<u16>()) {
        // LIT2 value LIT2 addr STA2 BRK, patched to avoid clobbering
        // the code itself
        let mut code = vec![op::LIT2];
        code.extend_from_slice(&value.to_be_bytes());
        code.push(op::LIT2);
        code.extend_from_slice(&addr.to_be_bytes());
        code.extend_from_slice(&[0x35, op::BRK]); // STA2
        let code_end = RESET_VECTOR + code.len() as u16;
        prop_assume!(addr >= code_end || addr.wrapping_add(1) < RESET_VECTOR);

        let vm = run(&code);
        prop_assert_eq!(vm.memory()[addr as usize], (value >> 8) as u8);
        prop_assert_eq!(vm.memory()[addr.wrapping_add(1) as usize], value as u8);
    }

    // Zero-page stores wrap modulo 256 in the low byte.
    #[test]
    fn zero_page_stores_wrap(addr in any::<u8>(), value in any::<u16>()) {
        let mut code = vec![op::LIT2];
        code.extend_from_slice(&value.to_be_bytes());
        code.extend_from_slice(&[op::LIT, addr, 0x31, op::BRK]); // STZ2
        let vm = run(&code);
        prop_assert_eq!(vm.memory()[addr as usize], (value >> 8) as u8);
        prop_assert_eq!(vm.memory()[addr.wrapping_add(1) as usize], value as u8);
    }

    // Keep-mode arithmetic leaves its operands in place.
    #[test]
    fn keep_mode_preserves_operands(a in any::<u8>(), b in any::<u8>()) {
        let code = [op::LIT, a, op::LIT, b, 0x98, op::BRK]; // ADDk
        let vm = run(&code);
        prop_assert_eq!(vm.wsp, 3);
        prop_assert_eq!(&vm.ws[..3], &[a, b, a.wrapping_add(b)]);
    }
}
