//! Assembler invariants over arbitrary token soup: no panics, no
//! writes below the reset vector, and bit-for-bit determinism.

use proptest::prelude::*;
use uxnkit_asm::{assemble, MemVfs, Output, SymbolKind};

fn token() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("BRK".to_string()),
        Just("ADD2k".to_string()),
        Just("POP".to_string()),
        Just("#01".to_string()),
        Just("#abcd".to_string()),
        Just("+200".to_string()),
        Just("++40000".to_string()),
        Just("|0100".to_string()),
        Just("|00".to_string()),
        Just("$2".to_string()),
        Just("@@".to_string()),
        Just("?@".to_string()),
        Just("{".to_string()),
        Just("}".to_string()),
        Just("(".to_string()),
        Just(")".to_string()),
        Just("[".to_string()),
        Just("]".to_string()),
        Just("\"text".to_string()),
        "[a-z]{1,6}",
        "[a-z]{1,6}".prop_map(|name| format!("@{name}")),
        "[a-z]{1,6}".prop_map(|name| format!("&{name}")),
        "[a-z]{1,6}".prop_map(|name| format!(";{name}")),
        "[a-z]{1,6}".prop_map(|name| format!(".{name}")),
        "[a-z]{1,6}".prop_map(|name| format!(",{name}")),
        "[a-z]{1,6}".prop_map(|name| format!("!{name}")),
        "[a-z]{1,6}".prop_map(|name| format!("?{name}")),
        "[a-z]{1,6}".prop_map(|name| format!("%{name}")),
    ]
}

fn source() -> impl Strategy<Value = String> {
    prop::collection::vec(token(), 0..40).prop_map(|tokens| tokens.join(" "))
}

fn run(src: &str) -> (bool, Output) {
    let mut vfs = MemVfs::with_file("soup.tal", src);
    let mut output = Output::default();
    let ok = assemble(&mut vfs, &mut output, "soup.tal");
    (ok, output)
}

proptest! {
    // Assembly of arbitrary input must never panic, and every emitted
    // byte must land at or above the reset vector; the Output
    // collector relies on this and would panic otherwise.
    #[test]
    fn never_panics_or_writes_the_zero_page(src in source()) {
        let (_ok, output) = run(&src);
        prop_assert!(output.rom().len() <= uxnkit_asm::MAX_ROM_SIZE);
    }

    // Two runs over the same source produce identical results.
    #[test]
    fn assembly_is_deterministic(src in source()) {
        let (ok_a, a) = run(&src);
        let (ok_b, b) = run(&src);
        prop_assert_eq!(ok_a, ok_b);
        prop_assert_eq!(a.rom(), b.rom());
        prop_assert_eq!(a.num_errors, b.num_errors);
        prop_assert_eq!(a.num_warnings, b.num_warnings);
        prop_assert_eq!(a.symbols.len(), b.symbols.len());
        for ((addr_a, sym_a), (addr_b, sym_b)) in a.symbols.iter().zip(&b.symbols) {
            prop_assert_eq!(addr_a, addr_b);
            prop_assert_eq!(sym_a.kind, sym_b.kind);
            prop_assert_eq!(sym_a.id, sym_b.id);
            prop_assert_eq!(sym_a.name.as_deref(), sym_b.name.as_deref());
        }
    }

    // A successfully assembled image re-assembles from its own byte
    // dump: raw hex pairs are the identity encoding.
    #[test]
    fn raw_bytes_round_trip(bytes in prop::collection::vec(any::<u8>(), 1..32)) {
        let src = bytes
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        let (ok, output) = run(&src);
        prop_assert!(ok);
        prop_assert_eq!(output.rom(), &bytes[..]);
        prop_assert!(output
            .symbols
            .iter()
            .all(|(_, sym)| sym.kind == SymbolKind::Number));
    }
}
