//! Concrete end-to-end dispatch scenarios, built directly as bytecode the
//! way the translator's lowering passes would emit it, rather than routed
//! through a real ARM64 decode (that path is exercised in
//! `vmforge-translator`'s own tests).

use std::sync::Arc;

use vmforge_engine::Engine;
use vmforge_function::{EncodedFunction, RuntimeFunction};
use vmforge_types::opcode::*;
use vmforge_types::tag;

/// Mirrors `vmforge_engine`'s private `CC_TEST_SENTINEL` and
/// `vmforge_translator::CC_TEST_SENTINEL`: marks an `OP_BRANCH_IF_CC` as a
/// condition-code test rather than a bit-test branch.
const CC_TEST_SENTINEL: u32 = u32::MAX;

fn run(f: EncodedFunction, params: &[u64], ret_buffer: u64) -> u64 {
    let offset = f.function_offset;
    let rf = RuntimeFunction::from_encoded(&f).unwrap();
    let engine = Engine::new();
    engine.cache_function("companion.so", Arc::new(rf));
    engine
        .execute("companion.so", offset, params, ret_buffer)
        .unwrap()
}

/// `fun_switch_dispatch(a, b)`: a chain of `OP_BRANCH_IF_CC` comparisons
/// against `a`, preceded by a countdown loop that only exists to exercise
/// a backward `OP_BRANCH`. `a == 2` selects the second case, returning 10.
#[test]
fn switch_dispatch_picks_the_matching_case_after_a_backward_branch() {
    let words = vec![
        OP_LOAD_IMM, 3, 3, 0, // x3 = 3 (countdown)
        OP_BINARY_IMM | BIN_UPDATE_FLAGS, BIN_SUB, 3, 3, 1, 0, // x3 -= 1 (loop target)
        OP_BRANCH_IF, 3, 1, 0, // if x3 != 0, branch backward to branch_id 0
        OP_BINARY_IMM | BIN_UPDATE_FLAGS, BIN_SUB, 2, 0, 1, 0, // x2 = a - 1
        OP_BRANCH_IF_CC, 0, CC_TEST_SENTINEL, 0, 1, // EQ -> case1 (branch_id 1)
        OP_BINARY_IMM | BIN_UPDATE_FLAGS, BIN_SUB, 2, 0, 2, 0, // x2 = a - 2
        OP_BRANCH_IF_CC, 0, CC_TEST_SENTINEL, 0, 2, // EQ -> case2 (branch_id 2)
        OP_BRANCH, 3, // -> default (branch_id 3)
        OP_LOAD_IMM, 0, 100, 0, // case1: x0 = 100
        OP_BRANCH, 4, // -> end (branch_id 4)
        OP_LOAD_IMM, 0, 10, 0, // case2: x0 = 10
        OP_BRANCH, 4, // -> end (branch_id 4)
        OP_LOAD_IMM, 0, 999, 0, // default: x0 = 999
        OP_RETURN,
    ];
    assert_eq!(words.len(), 55);

    let f = EncodedFunction {
        register_count: 8,
        inst_words: words,
        // branch_id -> pc: 0=loop(4), 1=case1(38), 2=case2(44), 3=default(50), 4=end(54)
        branch_words: vec![4, 38, 44, 50, 54],
        function_offset: 200,
        ..Default::default()
    };

    assert_eq!(run(f, &[2, 4], 0), 10);
}

/// `fun_bitmask_branch(2, 4)`: `BIN_AND|UPDATE_FLAGS` masks a 32-bit value,
/// `BIN_LSR` shifts it, and the 32-bit unsigned result is returned
/// zero-extended rather than sign-extended — `4294967294`, not
/// `0xFFFFFFFFFFFFFFFE`.
#[test]
fn bitmask_branch_returns_the_zero_extended_unsigned_result() {
    let words = vec![
        OP_LOAD_IMM, 2, 0xFFFF_FFFFu32, 0, // x2 = 0xFFFFFFFF
        OP_LOAD_IMM, 3, 0xFFFF_FFFEu32, 0, // x3 = 0xFFFFFFFE
        OP_BINARY | BIN_UPDATE_FLAGS, BIN_AND, 4, 2, 3, 0, // x4 = x2 & x3 (u32, flags)
        OP_LOAD_IMM, 5, 0, 0, // x5 = 0 (shift amount)
        OP_BINARY, BIN_LSR, 6, 4, 5, 0, // x6 = x4 >> x5 (u32)
        OP_MOV, 0, 6,
        OP_RETURN,
    ];
    let f = EncodedFunction {
        register_count: 8,
        type_tags: vec![tag::INT32_UNSIGNED],
        inst_words: words,
        function_offset: 201,
        ..Default::default()
    };

    assert_eq!(run(f, &[2, 4], 0), 4_294_967_294);
}

/// `fun_cpp_make_string(2, 4)`: writes `"A2:4"` into the caller-supplied
/// out-parameter buffer addressed by X8 (register index 8), the invisible
/// pointer return `vmforge_engine::Engine::execute`'s `ret_buffer` param
/// populates before the first guest opcode runs. The return register's
/// value is irrelevant, matching the spec's invisible-pointer-return note.
#[test]
fn object_return_writes_through_x8_into_the_callers_buffer() {
    let mut out = [0u8; 4];
    let buf_addr = out.as_mut_ptr() as u64;

    let bytes = [b'A', b'2', b':', b'4'];
    let mut words = Vec::new();
    for (i, &byte) in bytes.iter().enumerate() {
        words.extend_from_slice(&[OP_LOAD_IMM, 1, byte as u32, 0]);
        words.extend_from_slice(&[OP_SET_FIELD | FIELD_MEM_MODE, 1, 8, i as u32, 0]);
    }
    words.push(OP_RETURN);

    let f = EncodedFunction {
        register_count: 16,
        type_tags: vec![tag::INT8_UNSIGNED],
        inst_words: words,
        function_offset: 202,
        ..Default::default()
    };

    run(f, &[2, 4], buf_addr);
    assert_eq!(&out, b"A2:4");
}
