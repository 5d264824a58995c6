//! Checker behavior tests: literals, branching, split/merge tracking,
//! termination, sealed signatures and casts.

use uxnkit_asm::{assemble, MemVfs, Output, Report, Severity};
use uxnkit_chess::{check, Host, TraceId};

#[derive(Default)]
struct Counting {
    errors: u32,
    warnings: u32,
    traces: u32,
}

impl Host for Counting {
    fn report(&mut self, _trace_id: TraceId, severity: Severity, report: &Report) {
        log::debug!("{severity:?}: {}", report.message);
        match severity {
            Severity::Error => self.errors += 1,
            Severity::Warning => self.warnings += 1,
            Severity::Info => {}
        }
    }

    fn begin_trace(&mut self, _trace_id: TraceId, _parent_id: TraceId) {
        self.traces += 1;
    }
}

struct Outcome {
    ok: bool,
    errors: u32,
    /// Assembler and checker warnings combined.
    warnings: u32,
    traces: u32,
}

fn check_str(src: &str) -> Outcome {
    let _ = env_logger::try_init();
    let mut vfs = MemVfs::with_file("test.tal", src);
    let mut output = Output::default();
    assert!(assemble(&mut vfs, &mut output, "test.tal"), "{src:?} must assemble");
    let mut host = Counting::default();
    let ok = check(&output.symbols, output.rom(), &mut host);
    Outcome {
        ok,
        errors: host.errors,
        warnings: output.num_warnings + host.warnings,
        traces: host.traces,
    }
}

#[test]
fn empty_program_is_rejected() {
    // The implicit reset vector lands on a non-opcode
    let outcome = check_str("");
    assert!(!outcome.ok);

    let outcome = check_str("BRK @Routine ( -- )");
    assert!(!outcome.ok);
}

#[test]
fn labelled_literals_are_quiet() {
    for src in [
        "LIT 02 POP BRK",
        "LIT &test $1 POP BRK",
        "LIT2 &test $2 POP2 BRK",
        "LIT2 &test $1 \"a POP2 BRK",
        "LIT2 01 \"a POP2 BRK",
        "LIT2 01 02 POP2 BRK",
        "LIT2 \"a 02 POP2 BRK",
        "LIT2 \"ab POP2 BRK",
    ] {
        let outcome = check_str(src);
        assert!(outcome.ok, "{src:?} must verify");
        assert_eq!(outcome.warnings, 0, "{src:?} must be quiet");
    }
}

#[test]
fn constant_jumps_follow_both_branches() {
    let outcome = check_str("#01 #02 GTHk JMP SWP POP POP BRK");
    assert!(outcome.ok);
    assert_eq!(outcome.warnings, 0);
    // The comparison forks once
    assert_eq!(outcome.traces, 2);
}

#[test]
fn self_jump_does_not_hang() {
    let outcome = check_str("&>l !/>l");
    assert!(!outcome.ok);
    assert_eq!(outcome.errors, 1);
}

#[test]
fn tail_recursion_verifies() {
    let outcome = check_str(
        "BRK\n\
         @print-string ( [str]* -- )\n\
         LDAk DUP ?{ POP POP2 JMP2r }\n\
         POP\n\
         INC2 !print-string",
    );
    assert!(outcome.ok);
    assert_eq!(outcome.warnings, 0);
}

#[test]
fn unknown_jump_target_is_an_error() {
    let outcome = check_str(
        "BRK\n\
         @Unknown ( [str]* -- )\n\
         JMP2\n",
    );
    assert!(!outcome.ok);
    assert_eq!(outcome.errors, 1);
}

#[test]
fn every_branch_must_match_the_signature() {
    let outcome = check_str(
        "BRK\n\
         @branching ( [a]* -- c )\n\
         LDAk #01 EQU ?&one\n\
         LDAk #02 EQU ?&two\n\
         POP2 #ff JMP2r\n\
         &one POP2 JMP2r\n\
         &two ADD JMP2r\n",
    );
    assert!(!outcome.ok);
    assert_eq!(outcome.errors, 1);

    let outcome = check_str(
        "BRK\n\
         @branching ( [a]* -- c )\n\
         LDAk #01 EQU ?&one\n\
         LDAk #02 EQU ?&two\n\
         POP2 JMP2r\n\
         &one POP2 #ff JMP2r\n\
         &two ADD JMP2r\n",
    );
    assert!(!outcome.ok);
    assert_eq!(outcome.errors, 1);
}

#[test]
fn split_halves_merge_back() {
    // ROT ROT reassembles the address short
    let outcome = check_str(
        "BRK\n\
         @Store ( [addr]* value -- )\n\
         ROT ROT STA JMP2r\n",
    );
    assert!(outcome.ok);
    assert_eq!(outcome.warnings, 0);

    // DUP does not break the address apart for good
    let outcome = check_str(
        "BRK\n\
         @Store ( value [addr]* -- )\n\
         DUP POP STA JMP2r\n",
    );
    assert!(outcome.ok);
    assert_eq!(outcome.warnings, 0);

    // Halves join back across SWP/OVR shuffling
    let outcome = check_str(
        "BRK\n\
         @Store ( [addr]* -- )\n\
         SWP OVR STA JMP2r\n",
    );
    assert!(outcome.ok);
    assert_eq!(outcome.warnings, 0);
}

#[test]
fn non_terminating_routines_are_reported() {
    let outcome = check_str(
        "BRK\n\
         @loop ( cond -- )\n\
         !loop JMP2r\n",
    );
    assert!(!outcome.ok);
    assert_eq!(outcome.errors, 1);

    let outcome = check_str(
        "BRK\n\
         @loop ( cond -- )\n\
         DUP #01 SUB ?loop POP JMP2r\n",
    );
    assert!(outcome.ok);
}

#[test]
fn subroutines_must_not_brk() {
    let outcome = check_str(
        "BRK\n\
         @Broken ( -- )\n\
         BRK\n",
    );
    assert!(!outcome.ok);
}

#[test]
fn vectors_must_not_return() {
    let outcome = check_str(
        "BRK\n\
         @on-frame ( -> )\n\
         JMP2r\n",
    );
    assert!(!outcome.ok);
}

#[test]
fn sealed_signatures_are_trusted() {
    let outcome = check_str(
        "BRK\n\
         @Trusted ( a b -- ! )\n",
    );
    assert!(outcome.ok);
    assert_eq!(outcome.warnings, 0);
}

#[test]
fn casts_overwrite_the_abstract_state() {
    let outcome = check_str(
        "BRK\n\
         @Store ( a [addr]* -- ) INC ( [addr]* ! ) STA JMP2r\n",
    );
    assert!(outcome.ok);
    assert_eq!(outcome.warnings, 0);

    // A cast may not declare more than is actually there
    let outcome = check_str(
        "BRK\n\
         @Store ( a [addr]* -- ) INC ( [addr]* [addr]* ! ) STA JMP2r\n",
    );
    assert!(!outcome.ok);

    // Casts delivered through a macro work the same
    let outcome = check_str(
        "BRK\n\
         %>ADDR { ( [addr]* ! ) }\n\
         @Store ( a [addr]* -- ) INC >ADDR STA JMP2r\n",
    );
    assert!(outcome.ok);
    assert_eq!(outcome.warnings, 0);
}

#[test]
fn macro_definitions_detach_annotations() {
    // The signature-shaped comment belongs to the macro, not to the
    // preceding label
    let outcome = check_str(
        "|00 @Device\n\
         %Macro ( -- ) {  }\n\
         |0100 @on-reset ( -> ) BRK\n",
    );
    assert!(outcome.ok);
    assert_eq!(outcome.warnings, 0);
}

#[test]
fn nominal_types_use_prefix_subtyping() {
    // "Suits/Heart" is assignable to "Suits/"
    let outcome = check_str(
        "BRK\n\
         @play ( Suits/ -- )\n\
         POP JMP2r\n\
         @Caller ( Suits/Heart -- )\n\
         play JMP2r\n",
    );
    assert!(outcome.ok);

    // "Rocks/" is not
    let outcome = check_str(
        "BRK\n\
         @play ( Suits/ -- )\n\
         POP JMP2r\n\
         @Caller ( Rocks/ -- )\n\
         play JMP2r\n",
    );
    assert!(!outcome.ok);
}

#[test]
fn stack_underflow_is_reported() {
    // The second POP underflows
    let outcome = check_str(
        "BRK\n\
         @F ( a -- )\n\
         POP POP JMP2r\n",
    );
    assert!(!outcome.ok);
}

#[test]
fn leftover_outputs_are_reported() {
    // Without the POP the counter is left behind
    let outcome = check_str(
        "BRK\n\
         @F ( a -- )\n\
         DUP #01 SUB ?F POP JMP2r\n",
    );
    assert!(outcome.ok);

    let outcome = check_str(
        "BRK\n\
         @F ( a -- )\n\
         DUP #01 SUB ?F JMP2r\n",
    );
    assert!(!outcome.ok);
}
