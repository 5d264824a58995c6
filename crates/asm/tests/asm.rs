//! Assembler behavior tests: rune handling, symbol rules, diagnostics,
//! and end-to-end execution of small programs.

use uxnkit_asm::{assemble, MemVfs, Output};
use uxnkit_vm::{NullDevice, Reset, Vm, BANK_SIZE, RESET_VECTOR};

fn asm_str(src: &str) -> (bool, Output) {
    let _ = env_logger::try_init();
    let mut vfs = MemVfs::with_file("test.tal", src);
    let mut output = Output::default();
    let ok = assemble(&mut vfs, &mut output, "test.tal");
    (ok, output)
}

fn execute(output: &Output) -> Option<u8> {
    let mut vm = Vm::new(BANK_SIZE);
    vm.reset(Reset::ALL);
    vm.load_rom(output.rom());
    vm.execute(&mut NullDevice, RESET_VECTOR);
    vm.exit_code()
}

#[test]
fn warnings() {
    // Unused label
    let (ok, output) = asm_str("|00 @scope");
    assert!(ok);
    assert_eq!(output.num_warnings, 1);

    // Unused label starting with a capital letter
    let (ok, output) = asm_str("|00 @Main");
    assert!(ok);
    assert_eq!(output.num_warnings, 0);

    // Reset vector label
    let (ok, output) = asm_str("|0100 @on-reset");
    assert!(ok);
    assert_eq!(output.num_warnings, 0);

    // Redundant flags
    let (ok, output) = asm_str("EQU2222");
    assert!(ok);
    assert_eq!(output.num_warnings, 1);

    let (ok, output) = asm_str("LITk");
    assert!(ok);
    assert_eq!(output.num_warnings, 1);

    // Label used for padding counts as referenced
    let (ok, output) = asm_str("|01 @here |00 |here");
    assert!(ok);
    assert_eq!(output.num_warnings, 0);
}

#[test]
fn empty_label_is_a_zero_length_rom() {
    let (ok, output) = asm_str("@scope");
    assert!(ok);
    assert!(output.rom().is_empty());
    assert_eq!(output.num_warnings, 1);
}

#[test]
fn lone_runes_are_rejected() {
    for src in [
        "@scope ; @end",
        "@scope . @end",
        "@scope , @end",
        "@scope LIT2 = @end",
        "@scope LIT - @end",
        "@scope LIT _ @end",
        "@scope LIT | @end",
        "@scope \" @end",
        "@scope ! @end",
        "@scope ? @end",
        "@scope # @end",
    ] {
        let (ok, _) = asm_str(src);
        assert!(!ok, "{src:?} should not assemble");
    }
}

#[test]
fn overlong_tokens_are_rejected() {
    let long = "A".repeat(48);
    let (ok, _) = asm_str(&format!("@scope {long} @end @{long}"));
    assert!(!ok);
}

#[test]
fn unbalanced_comment_is_rejected() {
    let (ok, _) = asm_str("@scope ( BRK @end");
    assert!(!ok);

    let (ok, _) = asm_str("@scope ( a ( b ) @end");
    assert!(!ok);

    let (ok, output) = asm_str("@scope ( a ( b ) c ) @end");
    assert!(ok);
    assert!(output.rom().is_empty());
}

#[test]
fn zero_page_writes_are_rejected() {
    let (ok, _) = asm_str("@scope |80 #1234 @end");
    assert!(!ok);
}

#[test]
fn symbol_name_rules() {
    for src in [
        "@scope @foo @foo @end",
        "@scope @1234 @end",
        "@scope @-1234 @end",
        "@scope @LDA @end",
        "%label { SUB } @label",
        "@scope &foo &foo @end",
        "@AAAAAAAAAAAAAAAAAAAAAAAAA &BBBBBBBBBBBBBBBBBBBBBBB @end",
    ] {
        let (ok, _) = asm_str(src);
        assert!(!ok, "{src:?} should not assemble");
    }
}

#[test]
fn almost_opcodes_are_labels() {
    // An invalid mode letter means the word is a plain name
    let (ok, _) = asm_str("@scope ADD2q @end @ADD2q");
    assert!(ok);
    let (ok, _) = asm_str("@scope BRKk @end @BRKk");
    assert!(ok);
}

#[test]
fn number_shapes_are_checked() {
    for src in [
        "2", "123", "12345", "#2", "#123", "#12345", "@scope #1g", "@scope #123g",
    ] {
        let (ok, _) = asm_str(src);
        assert!(!ok, "{src:?} should not assemble");
    }

    let (ok, output) = asm_str("12 abcd");
    assert!(ok);
    assert_eq!(output.rom(), &[0x12, 0xab, 0xcd]);
}

#[test]
fn macro_shapes_are_checked() {
    for src in [
        "@scope %label { ADD } %label { SUB }",
        "@scope %label #1234",
        "@scope %test { BRK @end",
        "@scope %macro {BRK } #1234",
        "@scope %macro { BRK} #1234",
        "@scope %add2 { ADD } #1234",
        "@scope %-test { ADD } #1234",
        "@scope %JCN2 { ADD } #1234",
    ] {
        let (ok, _) = asm_str(src);
        assert!(!ok, "{src:?} should not assemble");
    }
}

#[test]
fn macro_bodies_expand() {
    let (ok, output) = asm_str("%emit { #01 ADD } #02 emit BRK");
    assert!(ok);
    assert_eq!(output.rom(), &[0x80, 0x02, 0x80, 0x01, 0x18, 0x00]);
}

#[test]
fn macro_recursion_is_detected() {
    let (ok, _) = asm_str("%loop { loop } loop");
    assert!(!ok);
}

#[test]
fn reference_ranges_are_checked() {
    for src in [
        "@scope LIT2 =label @end",
        "@scope ;label @end",
        "@scope .label @end",
        "@scope ,label @end",
        "@scope LIT _label @end",
        "@scope ,next $81 @next @end",
        "@back $7e @scope ,back @end",
    ] {
        let (ok, _) = asm_str(src);
        assert!(!ok, "{src:?} should not assemble");
    }
}

#[test]
fn forward_references_are_patched() {
    let (ok, output) = asm_str("|0100 ;end POP2 BRK @end");
    assert!(ok);
    // LIT2 01 05 POP2 BRK, label at 0x0105
    assert_eq!(output.rom(), &[0xa0, 0x01, 0x05, 0x22, 0x00]);
}

#[test]
fn relative_references_count_from_the_next_byte() {
    let (ok, output) = asm_str("|0100 @loop BRK !loop");
    assert!(ok);
    // JMI at 0x0101, operand at 0x0102: 0x0100 - 0x0104 = -4
    assert_eq!(output.rom(), &[0x00, 0x40, 0xff, 0xfc]);
}

#[test]
fn decimal_extensions() {
    let (ok, output) = asm_str("|00 |++256 BRK");
    assert!(ok);
    assert_eq!(output.rom().len(), 1);

    let (ok, output) = asm_str("|00 $++256 BRK");
    assert!(ok);
    assert_eq!(output.rom().len(), 1);

    let (ok, output) = asm_str("|00 $+255 $+1 BRK");
    assert!(ok);
    assert_eq!(output.rom().len(), 1);

    let (ok, output) = asm_str("+128");
    assert!(ok);
    assert_eq!(output.rom().len(), 1);

    let (ok, output) = asm_str("++128");
    assert!(ok);
    assert_eq!(output.rom().len(), 2);

    let (ok, output) = asm_str("|00 |++256 #+11 #0b EQU #0f DEO BRK");
    assert!(ok);
    assert_eq!(execute(&output), Some(1));

    let (ok, output) = asm_str("|00 |++256 #++1234 #04d2 EQU2 #0f DEO BRK");
    assert!(ok);
    assert_eq!(execute(&output), Some(1));

    // A one-plus literal pushes one byte, a two-plus literal two
    let (ok, output) = asm_str("|00 |++256 #+234 #04 DEI #01 EQU #0f DEO BRK");
    assert!(ok);
    assert_eq!(execute(&output), Some(1));

    let (ok, output) = asm_str("|00 |++256 #++1234 #04 DEI #02 EQU #0f DEO BRK");
    assert!(ok);
    assert_eq!(execute(&output), Some(1));

    for src in ["+279", "++999999999", "#+2b", "#++2b"] {
        let (ok, _) = asm_str(src);
        assert!(!ok, "{src:?} should not assemble");
    }
}

#[test]
fn anonymous_labels() {
    // Save/restore the write address through an @@ site
    let (ok, output) = asm_str("@@ |00 |@ POP BRK");
    assert!(ok);
    assert_eq!(output.rom().len(), 2);

    // Backward loop through ?@
    let (ok, _) = asm_str("#00 @@ INCk #08 NEQ ?@ POP BRK");
    assert!(ok);

    // Unconsumed sites warn
    let (ok, output) = asm_str("@@ @@");
    assert!(ok);
    assert_eq!(output.num_warnings, 2);

    // Each site is consumed at most once
    let (ok, _) = asm_str("#00 @@ INCk #08 NEQ ?@ POP !@ BRK");
    assert!(!ok);
}

#[test]
fn long_strings() {
    let text = "long  string is long my dude can you imagine how long it is?";
    let (ok, output) = asm_str(&format!("\" {text}\""));
    assert!(ok);
    assert_eq!(output.rom(), text.as_bytes());

    let (ok, _) = asm_str("\" ");
    assert!(!ok);
}

#[test]
fn raw_text_has_no_terminator() {
    let (ok, output) = asm_str("\"ab BRK");
    assert!(ok);
    assert_eq!(output.rom(), &[0x61, 0x62, 0x00]);
}

#[test]
fn macros_with_arguments() {
    let (ok, output) = asm_str(
        "%Macro-with-arg: { #^ }\n\
         Macro-with-arg: 02 #0f DEO BRK",
    );
    assert!(ok);
    assert_eq!(execute(&output), Some(2));

    // Chained expansion: the argument builds another macro's name
    let (ok, output) = asm_str(
        "%Macro1: { Macro^: 02 }\n\
         %Macro2: { #^ }\n\
         Macro1: 2 #0f DEO BRK",
    );
    assert!(ok);
    assert_eq!(execute(&output), Some(2));

    // Missing argument
    let (ok, _) = asm_str("%Macro: { ^ }\nMacro:");
    assert!(!ok);

    // Substitution past the token limit
    let (ok, _) = asm_str(
        "%Macro: { a-^ }\n\
         Macro: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
    );
    assert!(!ok);
}

#[test]
fn includes_resolve_through_the_vfs() {
    let _ = env_logger::try_init();
    let mut vfs = MemVfs::with_file("main.tal", "|0100 ~lib.tal BRK");
    vfs.add("lib.tal", "#1234");
    let mut output = Output::default();
    assert!(assemble(&mut vfs, &mut output, "main.tal"));
    assert_eq!(output.rom(), &[0xa0, 0x12, 0x34, 0x00]);

    let mut vfs = MemVfs::with_file("main.tal", "~missing.tal");
    let mut output = Output::default();
    assert!(!assemble(&mut vfs, &mut output, "main.tal"));
    // The failure and the include chain are both reported
    assert_eq!(output.num_errors, 2);
}

#[test]
fn include_depth_is_bounded() {
    let mut vfs = MemVfs::with_file("main.tal", "~main.tal");
    let mut output = Output::default();
    assert!(!assemble(&mut vfs, &mut output, "main.tal"));
}

#[test]
fn lambdas() {
    // A non-zero condition takes the jump over the lambda body
    let (ok, output) = asm_str("|0100 #01 ?{ #01 #0f DEO } BRK");
    assert!(ok);
    assert_eq!(execute(&output), None);

    let (ok, output) = asm_str("|0100 #00 ?{ #01 #0f DEO } BRK");
    assert!(ok);
    assert_eq!(execute(&output), Some(1));

    // Unbalanced forms
    let (ok, _) = asm_str("|0100 ?{ BRK");
    assert!(!ok);
    let (ok, _) = asm_str("|0100 } BRK");
    assert!(!ok);
}

#[test]
fn exit_port_round_trip() {
    // The low byte of the literal lands in the exit state
    let (ok, output) = asm_str("|0100 #1234 #0f DEO BRK");
    assert!(ok);
    assert_eq!(execute(&output), Some(0x34));
}

#[test]
fn scoped_names_resolve_against_the_current_scope() {
    let (ok, output) = asm_str(
        "|0100 @main ,&data LDR BRK &data 7f\n\
         |0200 @other ,/data LDR BRK &data 3f",
    );
    assert!(ok);
    let rom = output.rom();
    // main/data resolves within main's scope: LDR at 0x0102 reaches
    // the byte at 0x0104 through offset +1
    assert_eq!(rom[1], 1);
    assert_eq!(rom[4], 0x7f);
}

#[test]
fn sym_file_lists_labels() {
    let (ok, output) = asm_str("|0100 @main #01 POP BRK &done");
    assert!(ok);
    let mut bytes = Vec::new();
    uxnkit_asm::write_sym_file(&mut bytes, &output.labels).unwrap();
    // 0x0100 "main\0" then 0x0104 "main/done\0"
    assert_eq!(&bytes[..2], &[0x01, 0x00]);
    assert_eq!(&bytes[2..7], b"main\0");
    assert_eq!(&bytes[7..9], &[0x01, 0x04]);
    assert_eq!(&bytes[9..], b"main/done\0");

    let labels = uxnkit_asm::read_sym_file(&bytes).unwrap();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels[0], (0x0100, "main".to_string()));
    assert_eq!(labels[1], (0x0104, "main/done".to_string()));

    assert!(uxnkit_asm::read_sym_file(&bytes[..bytes.len() - 1]).is_err());
}
