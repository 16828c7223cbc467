//! Arithmetic, coercion, comparison, and concatenation semantics.

use crate::helpers::*;
use mond_bytecode::builder::FunctionBuilder;
use mond_bytecode::module::Constant;
use mond_bytecode::opcode::{Instruction, OpCode};

fn binop(op: OpCode, a: f64, b: f64) -> f64 {
    let mut f = FunctionBuilder::new();
    f.load_number(0, a);
    f.load_number(1, b);
    f.emit(Instruction::abc(op, 2, 0, 1, false));
    f.return_(2, 2);
    let (_, results) = run(&module_of(f));
    results[0].as_number().expect("number result")
}

#[test]
fn test_basic_arithmetic() {
    assert_eq!(binop(OpCode::Add, 2.0, 3.0), 5.0);
    assert_eq!(binop(OpCode::Sub, 2.0, 3.0), -1.0);
    assert_eq!(binop(OpCode::Mul, 4.0, 2.5), 10.0);
    assert_eq!(binop(OpCode::Div, 7.0, 2.0), 3.5);
    assert_eq!(binop(OpCode::Pow, 2.0, 10.0), 1024.0);
}

#[test]
fn test_mod_floor_semantics() {
    assert_eq!(binop(OpCode::Mod, 5.0, 3.0), 2.0);
    assert_eq!(binop(OpCode::Mod, -5.0, 3.0), 1.0);
    assert_eq!(binop(OpCode::Mod, 5.0, -3.0), -1.0);
}

#[test]
fn test_division_by_zero_is_infinity() {
    assert_eq!(binop(OpCode::Div, 1.0, 0.0), f64::INFINITY);
    assert_eq!(binop(OpCode::Div, -1.0, 0.0), f64::NEG_INFINITY);
}

#[test]
fn test_constant_operand_variant() {
    let mut f = FunctionBuilder::new();
    f.load_number(0, 10.0);
    let k = f.number(4.0);
    f.emit(Instruction::abc(OpCode::AddK, 1, 0, k as u8, false));
    f.return_(1, 2);
    let (_, results) = run(&module_of(f));
    assert_num(&results, 0, 14.0);
}

#[test]
fn test_string_coercion_in_arithmetic() {
    let mut f = FunctionBuilder::new();
    f.load_string(0, "10");
    f.load_number(1, 5.0);
    f.emit(Instruction::abc(OpCode::Add, 2, 0, 1, false));
    f.return_(2, 2);
    let (_, results) = run(&module_of(f));
    assert_num(&results, 0, 15.0);
}

#[test]
fn test_arith_on_nil_is_type_error() {
    let mut f = FunctionBuilder::new();
    f.load_nil(0, 0);
    f.load_number(1, 1.0);
    f.emit(Instruction::abc(OpCode::Add, 2, 0, 1, false));
    f.return_(2, 2);
    let (_, err) = run_err(&module_of(f));
    assert_eq!(err.kind(), "TypeError");
}

#[test]
fn test_arith_on_bad_string_is_coercion_error() {
    let mut f = FunctionBuilder::new();
    f.load_string(0, "pear");
    f.load_number(1, 1.0);
    f.emit(Instruction::abc(OpCode::Add, 2, 0, 1, false));
    f.return_(2, 2);
    let (_, err) = run_err(&module_of(f));
    assert_eq!(err.kind(), "ArithCoercionError");
}

#[test]
fn test_unm_and_not() {
    let mut f = FunctionBuilder::new();
    f.load_number(0, 4.5);
    f.emit(Instruction::abc(OpCode::Unm, 1, 0, 0, false));
    f.load_false(2);
    f.emit(Instruction::abc(OpCode::Not, 3, 2, 0, false));
    f.return_(1, 4); // -4.5, false, true
    let (_, results) = run(&module_of(f));
    assert_num(&results, 0, -4.5);
    assert_bool(&results, 1, false);
    assert_bool(&results, 2, true);
}

#[test]
fn test_len_of_string() {
    let mut f = FunctionBuilder::new();
    f.load_string(0, "hello");
    f.emit(Instruction::abc(OpCode::Len, 1, 0, 0, false));
    f.return_(1, 2);
    let (_, results) = run(&module_of(f));
    assert_num(&results, 0, 5.0);
}

#[test]
fn test_concat_strings_and_numbers() {
    let mut f = FunctionBuilder::new();
    f.load_string(0, "x=");
    f.load_number(1, 3.0);
    f.load_string(2, "!");
    f.emit(Instruction::abc(OpCode::Concat, 0, 3, 0, false));
    f.return_(0, 2);
    let (vm, results) = run(&module_of(f));
    assert_str(&vm, &results, 0, "x=3!");
}

#[test]
fn test_concat_interns_result() {
    // Concatenation produces an interned string: equal results share
    // one id, so raw equality holds.
    let mut f = FunctionBuilder::new();
    f.load_string(0, "ab");
    f.load_string(1, "a");
    f.load_string(2, "b");
    f.emit(Instruction::abc(OpCode::Concat, 1, 2, 0, false));
    f.emit(Instruction::abc(OpCode::Eq, 0, 1, 0, true));
    let j = f.jmp();
    f.emit(Instruction::abc(OpCode::LFalseSkip, 2, 0, 0, false));
    let t = f.here();
    f.load_true(2);
    f.patch_jmp(j, t);
    f.return_(2, 2);
    let (_, results) = run(&module_of(f));
    assert_bool(&results, 0, true);
}

#[test]
fn test_comparison_materialization() {
    // R2 = (R0 < R1)
    for (a, b, expected) in [(1.0, 2.0, true), (2.0, 1.0, false), (2.0, 2.0, false)] {
        let mut f = FunctionBuilder::new();
        f.load_number(0, a);
        f.load_number(1, b);
        f.emit(Instruction::abc(OpCode::Lt, 0, 1, 0, true));
        let j = f.jmp();
        f.emit(Instruction::abc(OpCode::LFalseSkip, 2, 0, 0, false));
        let t = f.here();
        f.load_true(2);
        f.patch_jmp(j, t);
        f.return_(2, 2);
        let (_, results) = run(&module_of(f));
        assert_bool(&results, 0, expected);
    }
}

#[test]
fn test_string_ordering() {
    let mut f = FunctionBuilder::new();
    f.load_string(0, "apple");
    f.load_string(1, "banana");
    f.emit(Instruction::abc(OpCode::Lt, 0, 1, 0, true));
    let j = f.jmp();
    f.emit(Instruction::abc(OpCode::LFalseSkip, 2, 0, 0, false));
    let t = f.here();
    f.load_true(2);
    f.patch_jmp(j, t);
    f.return_(2, 2);
    let (_, results) = run(&module_of(f));
    assert_bool(&results, 0, true);
}

#[test]
fn test_compare_mixed_types_errors() {
    let mut f = FunctionBuilder::new();
    f.load_number(0, 1.0);
    f.load_string(1, "2");
    f.emit(Instruction::abc(OpCode::Lt, 0, 1, 0, true));
    f.load_true(2);
    f.return_(2, 2);
    let (_, err) = run_err(&module_of(f));
    assert_eq!(err.kind(), "TypeError");
}

#[test]
fn test_nan_compares_unequal() {
    let mut f = FunctionBuilder::new();
    let knan = f.constant(Constant::Number(f64::NAN));
    f.load_k(0, knan);
    f.emit(Instruction::abc(OpCode::EqK, 0, knan as u8, 0, true));
    let j = f.jmp();
    f.emit(Instruction::abc(OpCode::LFalseSkip, 2, 0, 0, false));
    let t = f.here();
    f.load_true(2);
    f.patch_jmp(j, t);
    f.return_(2, 2);
    let (_, results) = run(&module_of(f));
    assert_bool(&results, 0, false);
}

#[test]
fn test_numeric_for_loop() {
    // acc = 0; for i = 1, 10 do acc = acc + i end
    let mut f = FunctionBuilder::new();
    f.load_number(0, 0.0);
    f.load_number(1, 1.0);
    f.load_number(2, 10.0);
    f.load_number(3, 1.0);
    let prep = f.emit(Instruction::asbx(OpCode::ForPrep, 1, 0));
    let body = f.emit(Instruction::abc(OpCode::Add, 0, 0, 4, false));
    let looptop = f.emit(Instruction::asbx(OpCode::ForLoop, 1, 0));
    f.return_(0, 2);
    f.patch_sbx(prep, looptop);
    f.patch_sbx(looptop, body);
    let (_, results) = run(&module_of(f));
    assert_num(&results, 0, 55.0);
}

#[test]
fn test_for_loop_negative_step() {
    let mut f = FunctionBuilder::new();
    f.load_number(0, 0.0);
    f.load_number(1, 5.0);
    f.load_number(2, 1.0);
    f.load_number(3, -1.0);
    let prep = f.emit(Instruction::asbx(OpCode::ForPrep, 1, 0));
    let body = f.emit(Instruction::abc(OpCode::Add, 0, 0, 4, false));
    let looptop = f.emit(Instruction::asbx(OpCode::ForLoop, 1, 0));
    f.return_(0, 2);
    f.patch_sbx(prep, looptop);
    f.patch_sbx(looptop, body);
    let (_, results) = run(&module_of(f));
    // 5+4+3+2+1
    assert_num(&results, 0, 15.0);
}

#[test]
fn test_for_step_zero_errors() {
    let mut f = FunctionBuilder::new();
    f.load_number(0, 1.0);
    f.load_number(1, 10.0);
    f.load_number(2, 0.0);
    let prep = f.emit(Instruction::asbx(OpCode::ForPrep, 0, 0));
    let tail = f.emit(Instruction::asbx(OpCode::ForLoop, 0, 0));
    f.return_(0, 1);
    f.patch_sbx(prep, tail);
    f.patch_sbx(tail, tail);
    let (_, err) = run_err(&module_of(f));
    assert_eq!(err.kind(), "TypeError");
}

#[test]
fn test_test_and_testset() {
    // if R0 then R1 = 1 else R1 = 2 end, with R0 = false
    let mut f = FunctionBuilder::new();
    f.load_false(0);
    // k=false: the following jump-to-else runs exactly when R0 is falsy.
    f.emit(Instruction::abc(OpCode::Test, 0, 0, 0, false));
    let j_else = f.jmp();
    f.load_number(1, 1.0);
    let j_end = f.jmp();
    let else_pc = f.here();
    f.load_number(1, 2.0);
    let end_pc = f.here();
    f.return_(1, 2);
    f.patch_jmp(j_else, else_pc);
    f.patch_jmp(j_end, end_pc);
    let (_, results) = run(&module_of(f));
    assert_num(&results, 0, 2.0);
}
