
use milk_bytecode::Op;
use runtime_test_utils::*;

mod arithmetic {
    use super::*;

    #[test]
    fn constant_folding_free_expression() {
        // 1 + 2 * 3 + 4
        let mut b = proto_builder();
        let two = b.number_rk(2.0).unwrap();
        let three = b.number_rk(3.0).unwrap();
        let one = b.number_rk(1.0).unwrap();
        let four = b.number_rk(4.0).unwrap();
        b.abc(Op::Mul, 0, two, three).unwrap();
        b.abc(Op::Add, 0, one, 0).unwrap();
        b.abc(Op::Add, 0, 0, four).unwrap();
        b.abc(Op::Return, 0, 2, 0).unwrap();
        run_expecting(b.registers(2).build().unwrap(), &[number(11.0)]);
    }

    #[test]
    fn division_and_pow() {
        let mut b = proto_builder();
        let seven = b.number_rk(7.0).unwrap();
        let two = b.number_rk(2.0).unwrap();
        let ten = b.number_rk(10.0).unwrap();
        b.abc(Op::Div, 0, seven, two).unwrap();
        b.abc(Op::Pow, 1, two, ten).unwrap();
        b.abc(Op::Return, 0, 3, 0).unwrap();
        run_expecting(
            b.registers(2).build().unwrap(),
            &[number(3.5), number(1024.0)],
        );
    }

    #[test]
    fn modulo_is_floored() {
        let mut b = proto_builder();
        let lhs = b.number_rk(-1.0).unwrap();
        let rhs = b.number_rk(3.0).unwrap();
        b.abc(Op::Mod, 0, lhs, rhs).unwrap();
        b.abc(Op::Return, 0, 2, 0).unwrap();
        run_expecting(b.registers(1).build().unwrap(), &[number(2.0)]);
    }

    #[test]
    fn numeric_strings_coerce() {
        let mut b = proto_builder();
        let lhs = b.string_rk("10").unwrap();
        let rhs = b.number_rk(5.0).unwrap();
        b.abc(Op::Add, 0, lhs, rhs).unwrap();
        b.abc(Op::Return, 0, 2, 0).unwrap();
        run_expecting(b.registers(1).build().unwrap(), &[number(15.0)]);
    }

    #[test]
    fn arithmetic_on_nil_fails() {
        let mut b = proto_builder();
        b.abc(Op::LoadNil, 0, 0, 0).unwrap();
        let one = b.number_rk(1.0).unwrap();
        b.abc(Op::Add, 1, 0, one).unwrap();
        b.abc(Op::Return, 1, 2, 0).unwrap();
        run_expecting_error(
            b.registers(2).build().unwrap(),
            "attempt to perform arithmetic on a nil value",
        );
    }

    #[test]
    fn unary_minus_and_not() {
        let mut b = proto_builder();
        let five = b.number(5.0).unwrap();
        b.abx(Op::LoadK, 0, five).unwrap();
        b.abc(Op::Unm, 1, 0, 0).unwrap();
        b.abc(Op::Not, 2, 0, 0).unwrap();
        b.abc(Op::LoadNil, 3, 3, 0).unwrap();
        b.abc(Op::Not, 3, 3, 0).unwrap();
        b.abc(Op::Return, 1, 4, 0).unwrap();
        run_expecting(
            b.registers(4).build().unwrap(),
            &[number(-5.0), boolean(false), boolean(true)],
        );
    }
}

mod bitwise {
    use super::*;

    #[test]
    fn and_or() {
        let mut b = proto_builder();
        let lhs = b.number_rk(0b1100 as f64).unwrap();
        let rhs = b.number_rk(0b1010 as f64).unwrap();
        b.abc(Op::BAnd, 0, lhs, rhs).unwrap();
        b.abc(Op::BOr, 1, lhs, rhs).unwrap();
        b.abc(Op::Return, 0, 3, 0).unwrap();
        run_expecting(
            b.registers(2).build().unwrap(),
            &[number(0b1000 as f64), number(0b1110 as f64)],
        );
    }

    #[test]
    fn shifts() {
        let mut b = proto_builder();
        let one = b.number_rk(1.0).unwrap();
        let eight = b.number_rk(8.0).unwrap();
        let minus_eight = b.number_rk(-8.0).unwrap();
        let four = b.number_rk(4.0).unwrap();
        b.abc(Op::Shl, 0, one, four).unwrap();
        b.abc(Op::Shr, 1, eight, one).unwrap();
        b.abc(Op::Shr, 2, minus_eight, one).unwrap();
        b.abc(Op::Return, 0, 4, 0).unwrap();
        // the right shift is arithmetic
        run_expecting(
            b.registers(3).build().unwrap(),
            &[number(16.0), number(4.0), number(-4.0)],
        );
    }

    #[test]
    fn non_finite_operands_fail() {
        let mut b = proto_builder();
        let inf = b.number_rk(f64::INFINITY).unwrap();
        let one = b.number_rk(1.0).unwrap();
        b.abc(Op::BAnd, 0, inf, one).unwrap();
        b.abc(Op::Return, 0, 2, 0).unwrap();
        run_expecting_error(
            b.registers(1).build().unwrap(),
            "number has no integer representation",
        );
    }
}

mod control_flow {
    use super::*;

    #[test]
    fn equality_produces_bool() {
        // the standard EQ / JMP / LOADBOOL / LOADBOOL sequence
        let mut b = proto_builder();
        let one = b.number_rk(1.0).unwrap();
        b.abc(Op::Eq, 1, one, one).unwrap();
        b.asbx(Op::Jmp, 0, 1).unwrap();
        b.abc(Op::LoadBool, 0, 0, 1).unwrap();
        b.abc(Op::LoadBool, 0, 1, 0).unwrap();
        b.abc(Op::Return, 0, 2, 0).unwrap();
        run_expecting(b.registers(1).build().unwrap(), &[boolean(true)]);
    }

    #[test]
    fn inequality_skips_the_jump() {
        let mut b = proto_builder();
        let one = b.number_rk(1.0).unwrap();
        let two = b.number_rk(2.0).unwrap();
        b.abc(Op::Eq, 1, one, two).unwrap();
        b.asbx(Op::Jmp, 0, 1).unwrap();
        b.abc(Op::LoadBool, 0, 0, 1).unwrap();
        b.abc(Op::LoadBool, 0, 1, 0).unwrap();
        b.abc(Op::Return, 0, 2, 0).unwrap();
        run_expecting(b.registers(1).build().unwrap(), &[boolean(false)]);
    }

    #[test]
    fn string_comparison_is_bytewise() {
        let mut b = proto_builder();
        let abc = b.string_rk("abc").unwrap();
        let abd = b.string_rk("abd").unwrap();
        b.abc(Op::Lt, 1, abc, abd).unwrap();
        b.asbx(Op::Jmp, 0, 1).unwrap();
        b.abc(Op::LoadBool, 0, 0, 1).unwrap();
        b.abc(Op::LoadBool, 0, 1, 0).unwrap();
        b.abc(Op::Return, 0, 2, 0).unwrap();
        run_expecting(b.registers(1).build().unwrap(), &[boolean(true)]);
    }

    #[test]
    fn comparing_mixed_types_fails() {
        let mut b = proto_builder();
        let one = b.number_rk(1.0).unwrap();
        let s = b.string_rk("x").unwrap();
        b.abc(Op::Lt, 1, one, s).unwrap();
        b.asbx(Op::Jmp, 0, 1).unwrap();
        b.abc(Op::LoadBool, 0, 0, 1).unwrap();
        b.abc(Op::LoadBool, 0, 1, 0).unwrap();
        b.abc(Op::Return, 0, 2, 0).unwrap();
        run_expecting_error(
            b.registers(1).build().unwrap(),
            "attempt to compare number with string",
        );
    }

    #[test]
    fn test_and_testset() {
        // r2 = r0 && r1 in the TESTSET / MOVE shape
        let mut b = proto_builder();
        let t = b.number(7.0).unwrap();
        let u = b.number(9.0).unwrap();
        b.abx(Op::LoadK, 0, t).unwrap();
        b.abx(Op::LoadK, 1, u).unwrap();
        b.abc(Op::TestSet, 2, 0, 0).unwrap();
        b.asbx(Op::Jmp, 0, 1).unwrap();
        b.abc(Op::Move, 2, 1, 0).unwrap();
        b.abc(Op::Return, 2, 2, 0).unwrap();
        // r0 is truthy, so the TESTSET condition (c = 0) fails and r2 = r1
        run_expecting(b.registers(3).build().unwrap(), &[number(9.0)]);
    }

    #[test]
    fn loadbool_skip() {
        let mut b = proto_builder();
        b.abc(Op::LoadBool, 0, 1, 1).unwrap();
        b.abc(Op::LoadBool, 0, 0, 0).unwrap();
        b.abc(Op::Return, 0, 2, 0).unwrap();
        run_expecting(b.registers(1).build().unwrap(), &[boolean(true)]);
    }

    #[test]
    fn moven_folds_following_moves() {
        let mut b = proto_builder();
        let k = b.number(3.0).unwrap();
        b.abx(Op::LoadK, 0, k).unwrap();
        b.abc(Op::MoveN, 1, 0, 1).unwrap();
        b.abc(Op::Move, 2, 1, 0).unwrap();
        b.abc(Op::Return, 2, 2, 0).unwrap();
        run_expecting(b.registers(3).build().unwrap(), &[number(3.0)]);
    }

    #[test]
    fn nop_does_nothing() {
        let mut b = proto_builder();
        let k = b.number(1.0).unwrap();
        b.abx(Op::LoadK, 0, k).unwrap();
        b.abc(Op::Nop, 0, 0, 0).unwrap();
        b.abc(Op::Return, 0, 2, 0).unwrap();
        run_expecting(b.registers(1).build().unwrap(), &[number(1.0)]);
    }
}

mod for_loops {
    use super::*;

    #[test]
    fn numeric_for_doubles() {
        // a = 1.0; for i = 1, 3 { a = a * 2 }; return a
        let mut b = proto_builder();
        let one = b.number(1.0).unwrap();
        let three = b.number(3.0).unwrap();
        b.abx(Op::LoadK, 0, one).unwrap();
        b.abx(Op::LoadK, 1, three).unwrap();
        b.abx(Op::LoadK, 2, one).unwrap();
        b.abx(Op::LoadK, 4, one).unwrap();
        b.asbx(Op::ForPrep, 0, 1).unwrap();
        let two = b.number_rk(2.0).unwrap();
        b.abc(Op::Mul, 4, 4, two).unwrap();
        b.asbx(Op::ForLoop, 0, -2).unwrap();
        b.abc(Op::Return, 4, 2, 0).unwrap();
        run_expecting(b.registers(5).build().unwrap(), &[number(8.0)]);
    }

    #[test]
    fn descending_for() {
        // count iterations of for i = 3, 1, -1
        let mut b = proto_builder();
        let three = b.number(3.0).unwrap();
        let one = b.number(1.0).unwrap();
        let minus_one = b.number(-1.0).unwrap();
        let zero = b.number(0.0).unwrap();
        b.abx(Op::LoadK, 0, three).unwrap();
        b.abx(Op::LoadK, 1, one).unwrap();
        b.abx(Op::LoadK, 2, minus_one).unwrap();
        b.abx(Op::LoadK, 4, zero).unwrap();
        b.asbx(Op::ForPrep, 0, 1).unwrap();
        let k_one = b.number_rk(1.0).unwrap();
        b.abc(Op::Add, 4, 4, k_one).unwrap();
        b.asbx(Op::ForLoop, 0, -2).unwrap();
        b.abc(Op::Return, 4, 2, 0).unwrap();
        run_expecting(b.registers(5).build().unwrap(), &[number(3.0)]);
    }

    #[test]
    fn empty_range_never_runs() {
        // for i = 5, 1 (positive step, limit below init)
        let mut b = proto_builder();
        let five = b.number(5.0).unwrap();
        let one = b.number(1.0).unwrap();
        let zero = b.number(0.0).unwrap();
        b.abx(Op::LoadK, 0, five).unwrap();
        b.abx(Op::LoadK, 1, one).unwrap();
        b.abx(Op::LoadK, 2, one).unwrap();
        b.abx(Op::LoadK, 4, zero).unwrap();
        b.asbx(Op::ForPrep, 0, 1).unwrap();
        let k_one = b.number_rk(1.0).unwrap();
        b.abc(Op::Add, 4, 4, k_one).unwrap();
        b.asbx(Op::ForLoop, 0, -2).unwrap();
        b.abc(Op::Return, 4, 2, 0).unwrap();
        run_expecting(b.registers(5).build().unwrap(), &[number(0.0)]);
    }

    #[test]
    fn zero_step_fails() {
        let mut b = proto_builder();
        let one = b.number(1.0).unwrap();
        let zero = b.number(0.0).unwrap();
        b.abx(Op::LoadK, 0, one).unwrap();
        b.abx(Op::LoadK, 1, one).unwrap();
        b.abx(Op::LoadK, 2, zero).unwrap();
        b.asbx(Op::ForPrep, 0, 0).unwrap();
        b.asbx(Op::ForLoop, 0, -1).unwrap();
        b.abc(Op::Return, 0, 1, 0).unwrap();
        run_expecting_error(b.registers(4).build().unwrap(), "'for' step is zero");
    }

    #[test]
    fn non_numeric_limit_fails() {
        let mut b = proto_builder();
        let one = b.number(1.0).unwrap();
        let s = b.string("nope").unwrap();
        b.abx(Op::LoadK, 0, one).unwrap();
        b.abx(Op::LoadK, 1, s).unwrap();
        b.abx(Op::LoadK, 2, one).unwrap();
        b.asbx(Op::ForPrep, 0, 0).unwrap();
        b.asbx(Op::ForLoop, 0, -1).unwrap();
        b.abc(Op::Return, 0, 1, 0).unwrap();
        run_expecting_error(
            b.registers(4).build().unwrap(),
            "'for' limit must be a number",
        );
    }
}

mod tables {
    use super::*;
    use milk_runtime::MValue;

    #[test]
    fn set_and_get() {
        let mut b = proto_builder();
        b.abc(Op::NewTable, 0, 0, 0).unwrap();
        let key = b.string_rk("answer").unwrap();
        let value = b.number_rk(42.0).unwrap();
        b.abc(Op::SetTableKs, 0, key, value).unwrap();
        b.abc(Op::GetTableKs, 1, 0, key).unwrap();
        b.abc(Op::Return, 1, 2, 0).unwrap();
        run_expecting(b.registers(2).build().unwrap(), &[number(42.0)]);
    }

    #[test]
    fn missing_keys_read_nil() {
        let mut b = proto_builder();
        b.abc(Op::NewTable, 0, 0, 0).unwrap();
        let key = b.string_rk("missing").unwrap();
        b.abc(Op::GetTable, 1, 0, key).unwrap();
        b.abc(Op::Return, 1, 2, 0).unwrap();
        run_expecting(b.registers(2).build().unwrap(), &[MValue::Nil]);
    }

    #[test]
    fn setlist_fills_the_array_part() {
        let mut b = proto_builder();
        b.abc(Op::NewTable, 0, 3, 0).unwrap();
        for (i, n) in [10.0, 20.0, 30.0].iter().enumerate() {
            let k = b.number(*n).unwrap();
            b.abx(Op::LoadK, 1 + i as u32, k).unwrap();
        }
        b.abc(Op::SetList, 0, 3, 1).unwrap();
        b.abc(Op::Len, 1, 0, 0).unwrap();
        let two = b.number_rk(2.0).unwrap();
        b.abc(Op::GetTable, 2, 0, two).unwrap();
        b.abc(Op::Return, 1, 3, 0).unwrap();
        run_expecting(
            b.registers(4).build().unwrap(),
            &[number(3.0), number(20.0)],
        );
    }

    #[test]
    fn indexing_nil_fails() {
        let mut b = proto_builder();
        b.abc(Op::LoadNil, 0, 0, 0).unwrap();
        let key = b.string_rk("x").unwrap();
        b.abc(Op::GetTable, 1, 0, key).unwrap();
        b.abc(Op::Return, 1, 2, 0).unwrap();
        run_expecting_error(
            b.registers(2).build().unwrap(),
            "attempt to index a nil value",
        );
    }

    #[test]
    fn self_fetches_method_and_receiver() {
        let mut b = proto_builder();
        b.abc(Op::NewTable, 0, 0, 0).unwrap();
        let key = b.string_rk("m").unwrap();
        let value = b.number_rk(7.0).unwrap();
        b.abc(Op::SetTableKs, 0, key, value).unwrap();
        b.abc(Op::SelfOp, 1, 0, key).unwrap();
        // r1 is the method slot, r2 the receiver; return the method value
        b.abc(Op::Return, 1, 2, 0).unwrap();
        run_expecting(b.registers(3).build().unwrap(), &[number(7.0)]);
    }

    #[test]
    fn length_of_string_counts_bytes() {
        let mut b = proto_builder();
        let s = b.string("hello").unwrap();
        b.abx(Op::LoadK, 0, s).unwrap();
        b.abc(Op::Len, 1, 0, 0).unwrap();
        b.abc(Op::Return, 1, 2, 0).unwrap();
        run_expecting(b.registers(2).build().unwrap(), &[number(5.0)]);
    }
}

mod globals {
    use super::*;

    #[test]
    fn set_and_get_global() {
        let mut b = proto_builder();
        let forty_two = b.number(42.0).unwrap();
        let name = b.string("answer").unwrap();
        b.abx(Op::LoadK, 0, forty_two).unwrap();
        b.abx(Op::SetGlobal, 0, name).unwrap();
        b.abx(Op::GetGlobal, 1, name).unwrap();
        b.abc(Op::Return, 1, 2, 0).unwrap();
        run_expecting(b.registers(2).build().unwrap(), &[number(42.0)]);
    }

    #[test]
    fn unset_global_reads_nil() {
        let mut b = proto_builder();
        let name = b.string("nonexistent").unwrap();
        b.abx(Op::GetGlobal, 0, name).unwrap();
        b.abc(Op::Return, 0, 2, 0).unwrap();
        run_expecting(b.registers(1).build().unwrap(), &[milk_runtime::MValue::Nil]);
    }
}

mod concat {
    use super::*;

    #[test]
    fn concatenates_strings_and_numbers() {
        let mut b = proto_builder();
        let hello = b.string("hello").unwrap();
        let space = b.string(" ").unwrap();
        let one = b.number(1.0).unwrap();
        b.abx(Op::LoadK, 0, hello).unwrap();
        b.abx(Op::LoadK, 1, space).unwrap();
        b.abx(Op::LoadK, 2, one).unwrap();
        b.abc(Op::Concat, 3, 0, 2).unwrap();
        b.abc(Op::Return, 3, 2, 0).unwrap();
        run_expecting(b.registers(4).build().unwrap(), &[string("hello 1")]);
    }

    #[test]
    fn empty_range_is_empty_string() {
        let mut b = proto_builder();
        b.abc(Op::Concat, 0, 2, 1).unwrap();
        b.abc(Op::Return, 0, 2, 0).unwrap();
        run_expecting(b.registers(3).build().unwrap(), &[string("")]);
    }

    #[test]
    fn concatenating_nil_fails() {
        let mut b = proto_builder();
        let hello = b.string("hello").unwrap();
        b.abx(Op::LoadK, 0, hello).unwrap();
        b.abc(Op::LoadNil, 1, 1, 0).unwrap();
        b.abc(Op::Concat, 2, 0, 1).unwrap();
        b.abc(Op::Return, 2, 2, 0).unwrap();
        run_expecting_error(
            b.registers(3).build().unwrap(),
            "attempt to concatenate a nil value",
        );
    }
}

mod calls {
    use super::*;

    #[test]
    fn call_with_fixed_results() {
        // f = func(a, b) { return a + b }; return f(5, 6)
        let mut f = proto_builder().params(2).registers(4);
        f.abc(Op::Add, 2, 0, 1).unwrap();
        f.abc(Op::Return, 2, 2, 0).unwrap();
        let f = f.build().unwrap();

        let mut b = proto_builder();
        let proto = b.proto(f);
        b.abx(Op::Closure, 0, proto).unwrap();
        let five = b.number(5.0).unwrap();
        let six = b.number(6.0).unwrap();
        b.abx(Op::LoadK, 1, five).unwrap();
        b.abx(Op::LoadK, 2, six).unwrap();
        b.abc(Op::Call, 0, 3, 2).unwrap();
        b.abc(Op::Return, 0, 2, 0).unwrap();
        run_expecting(b.registers(4).build().unwrap(), &[number(11.0)]);
    }

    #[test]
    fn missing_arguments_are_nil() {
        // f = func(a, b) { return b }; return f(1)
        let mut f = proto_builder().params(2).registers(3);
        f.abc(Op::Return, 1, 2, 0).unwrap();
        let f = f.build().unwrap();

        let mut b = proto_builder();
        let proto = b.proto(f);
        b.abx(Op::Closure, 0, proto).unwrap();
        let one = b.number(1.0).unwrap();
        b.abx(Op::LoadK, 1, one).unwrap();
        b.abc(Op::Call, 0, 2, 2).unwrap();
        b.abc(Op::Return, 0, 2, 0).unwrap();
        run_expecting(b.registers(3).build().unwrap(), &[milk_runtime::MValue::Nil]);
    }

    #[test]
    fn multiple_results_flow_through_the_top() {
        // f = func() { return 1, 2, 3 }; return f()
        let mut f = proto_builder().registers(4);
        for (i, n) in [1.0, 2.0, 3.0].iter().enumerate() {
            let k = f.number(*n).unwrap();
            f.abx(Op::LoadK, i as u32, k).unwrap();
        }
        f.abc(Op::Return, 0, 4, 0).unwrap();
        let f = f.build().unwrap();

        let mut b = proto_builder();
        let proto = b.proto(f);
        b.abx(Op::Closure, 0, proto).unwrap();
        b.abc(Op::Call, 0, 1, 0).unwrap();
        b.abc(Op::Return, 0, 0, 0).unwrap();
        run_expecting(
            b.registers(2).build().unwrap(),
            &[number(1.0), number(2.0), number(3.0)],
        );
    }

    #[test]
    fn varargs_are_forwarded() {
        // f = func(...) { return ... }; return f(7, 8, 9)
        let mut f = proto_builder().vararg().registers(2);
        f.abc(Op::Vararg, 0, 0, 0).unwrap();
        f.abc(Op::Return, 0, 0, 0).unwrap();
        let f = f.build().unwrap();

        let mut b = proto_builder();
        let proto = b.proto(f);
        b.abx(Op::Closure, 0, proto).unwrap();
        for (i, n) in [7.0, 8.0, 9.0].iter().enumerate() {
            let k = b.number(*n).unwrap();
            b.abx(Op::LoadK, 1 + i as u32, k).unwrap();
        }
        b.abc(Op::Call, 0, 4, 0).unwrap();
        b.abc(Op::Return, 0, 0, 0).unwrap();
        run_expecting(
            b.registers(5).build().unwrap(),
            &[number(7.0), number(8.0), number(9.0)],
        );
    }

    #[test]
    fn fixed_count_vararg_copy_pads_with_nil() {
        // f = func(...) { local a, b = ...; return b }
        let mut f = proto_builder().vararg().registers(3);
        f.abc(Op::Vararg, 0, 3, 0).unwrap();
        f.abc(Op::Return, 1, 2, 0).unwrap();
        let f = f.build().unwrap();

        let mut b = proto_builder();
        let proto = b.proto(f);
        b.abx(Op::Closure, 0, proto).unwrap();
        let seven = b.number(7.0).unwrap();
        b.abx(Op::LoadK, 1, seven).unwrap();
        b.abc(Op::Call, 0, 2, 2).unwrap();
        b.abc(Op::Return, 0, 2, 0).unwrap();
        run_expecting(b.registers(3).build().unwrap(), &[milk_runtime::MValue::Nil]);
    }

    #[test]
    fn calling_a_number_fails() {
        let mut b = proto_builder();
        let k = b.number(1.0).unwrap();
        b.abx(Op::LoadK, 0, k).unwrap();
        b.abc(Op::Call, 0, 1, 1).unwrap();
        b.abc(Op::Return, 0, 1, 0).unwrap();
        run_expecting_error(
            b.registers(2).build().unwrap(),
            "attempt to call a number value",
        );
    }

    #[test]
    fn deep_recursion_overflows() {
        // f = func() { return 1 + f() } — the addition prevents a tail call
        let mut f = proto_builder().registers(4);
        let name = f.string("f").unwrap();
        f.abx(Op::GetGlobal, 0, name).unwrap();
        f.abc(Op::Call, 0, 1, 2).unwrap();
        let one = f.number_rk(1.0).unwrap();
        f.abc(Op::Add, 0, one, 0).unwrap();
        f.abc(Op::Return, 0, 2, 0).unwrap();
        let f = f.build().unwrap();

        let mut b = proto_builder();
        let proto = b.proto(f);
        let name = b.string("f").unwrap();
        b.abx(Op::Closure, 0, proto).unwrap();
        b.abx(Op::SetGlobal, 0, name).unwrap();
        b.abx(Op::GetGlobal, 1, name).unwrap();
        b.abc(Op::Call, 1, 1, 2).unwrap();
        b.abc(Op::Return, 1, 2, 0).unwrap();
        run_expecting_error(b.registers(3).build().unwrap(), "stack overflow");
    }

    #[test]
    fn tail_calls_do_not_grow_the_frame_stack() {
        // f = func(n) { if n <= 0 { return n }; return f(n - 1) }
        let mut f = proto_builder().params(1).registers(4);
        let zero = f.number_rk(0.0).unwrap();
        f.abc(Op::Le, 0, 0, zero).unwrap();
        f.asbx(Op::Jmp, 0, 1).unwrap();
        f.abc(Op::Return, 0, 2, 0).unwrap();
        let one = f.number_rk(1.0).unwrap();
        f.abc(Op::Sub, 1, 0, one).unwrap();
        let name = f.string("f").unwrap();
        f.abx(Op::GetGlobal, 2, name).unwrap();
        f.abc(Op::Move, 3, 1, 0).unwrap();
        f.abc(Op::TailCall, 2, 2, 0).unwrap();
        f.abc(Op::Return, 0, 1, 0).unwrap();
        let f = f.build().unwrap();

        let mut b = proto_builder();
        let proto = b.proto(f);
        let name = b.string("f").unwrap();
        b.abx(Op::Closure, 0, proto).unwrap();
        b.abx(Op::SetGlobal, 0, name).unwrap();
        b.abx(Op::GetGlobal, 1, name).unwrap();
        // far deeper than the 256 frame limit
        let depth = b.number(10000.0).unwrap();
        b.abx(Op::LoadK, 2, depth).unwrap();
        b.abc(Op::Call, 1, 2, 2).unwrap();
        b.abc(Op::Return, 1, 2, 0).unwrap();
        run_expecting(b.registers(3).build().unwrap(), &[number(0.0)]);
    }
}

mod closures {
    use super::*;

    #[test]
    fn upvalue_reads_and_writes_share_the_stack_slot() {
        // x = 10; inc = func() { x = x + 1; return x }; return inc(), x
        let mut inc = proto_builder().upvalues(1).registers(2);
        inc.abc(Op::GetUpval, 0, 0, 0).unwrap();
        let one = inc.number_rk(1.0).unwrap();
        inc.abc(Op::Add, 0, 0, one).unwrap();
        inc.abc(Op::SetUpval, 0, 0, 0).unwrap();
        inc.abc(Op::Return, 0, 2, 0).unwrap();
        let inc = inc.build().unwrap();

        let mut b = proto_builder();
        let proto = b.proto(inc);
        let ten = b.number(10.0).unwrap();
        b.abx(Op::LoadK, 0, ten).unwrap();
        b.abx(Op::Closure, 1, proto).unwrap();
        b.abc(Op::Move, 0, 0, 0).unwrap(); // pseudo-instruction: capture local 0
        b.abc(Op::Move, 2, 1, 0).unwrap();
        b.abc(Op::Call, 2, 1, 2).unwrap();
        b.abc(Op::Move, 3, 0, 0).unwrap();
        b.abc(Op::Return, 2, 3, 0).unwrap();
        run_expecting(
            b.registers(4).build().unwrap(),
            &[number(11.0), number(11.0)],
        );
    }

    #[test]
    fn two_closures_share_one_cell() {
        // x = 1; set = func() { x = 99 }; get = func() { return x }; set(); return get()
        let mut setter = proto_builder().upvalues(1).registers(1);
        let k99 = setter.number(99.0).unwrap();
        setter.abx(Op::LoadK, 0, k99).unwrap();
        setter.abc(Op::SetUpval, 0, 0, 0).unwrap();
        setter.abc(Op::Return, 0, 1, 0).unwrap();
        let setter = setter.build().unwrap();

        let mut getter = proto_builder().upvalues(1).registers(1);
        getter.abc(Op::GetUpval, 0, 0, 0).unwrap();
        getter.abc(Op::Return, 0, 2, 0).unwrap();
        let getter = getter.build().unwrap();

        let mut b = proto_builder();
        let setter = b.proto(setter);
        let getter = b.proto(getter);
        let one = b.number(1.0).unwrap();
        b.abx(Op::LoadK, 0, one).unwrap();
        b.abx(Op::Closure, 1, setter).unwrap();
        b.abc(Op::Move, 0, 0, 0).unwrap();
        b.abx(Op::Closure, 2, getter).unwrap();
        b.abc(Op::Move, 0, 0, 0).unwrap();
        b.abc(Op::Move, 3, 1, 0).unwrap();
        b.abc(Op::Call, 3, 1, 1).unwrap();
        b.abc(Op::Move, 3, 2, 0).unwrap();
        b.abc(Op::Call, 3, 1, 2).unwrap();
        b.abc(Op::Return, 3, 2, 0).unwrap();
        run_expecting(b.registers(4).build().unwrap(), &[number(99.0)]);
    }

    #[test]
    fn close_detaches_cells_from_the_stack() {
        // the closure keeps the value from before CLOSE
        let mut getter = proto_builder().upvalues(1).registers(1);
        getter.abc(Op::GetUpval, 0, 0, 0).unwrap();
        getter.abc(Op::Return, 0, 2, 0).unwrap();
        let getter = getter.build().unwrap();

        let mut b = proto_builder();
        let getter = b.proto(getter);
        let five = b.number(5.0).unwrap();
        let six = b.number(6.0).unwrap();
        b.abx(Op::LoadK, 0, five).unwrap();
        b.abx(Op::Closure, 1, getter).unwrap();
        b.abc(Op::Move, 0, 0, 0).unwrap();
        b.abc(Op::Close, 0, 0, 0).unwrap();
        b.abx(Op::LoadK, 0, six).unwrap();
        b.abc(Op::Move, 2, 1, 0).unwrap();
        b.abc(Op::Call, 2, 1, 2).unwrap();
        b.abc(Op::Return, 2, 2, 0).unwrap();
        run_expecting(b.registers(3).build().unwrap(), &[number(5.0)]);
    }

    #[test]
    fn nested_closures_inherit_upvalues() {
        // outer captures x; inner inherits it through GETUPVAL binding
        let mut inner = proto_builder().upvalues(1).registers(1);
        inner.abc(Op::GetUpval, 0, 0, 0).unwrap();
        inner.abc(Op::Return, 0, 2, 0).unwrap();
        let inner = inner.build().unwrap();

        let mut outer = proto_builder().upvalues(1).registers(2);
        let inner_index = outer.proto(inner);
        outer.abx(Op::Closure, 0, inner_index).unwrap();
        outer.abc(Op::GetUpval, 0, 0, 0).unwrap(); // pseudo: inherit upvalue 0
        outer.abc(Op::Call, 0, 1, 2).unwrap();
        outer.abc(Op::Return, 0, 2, 0).unwrap();
        let outer = outer.build().unwrap();

        let mut b = proto_builder();
        let outer = b.proto(outer);
        let k = b.number(123.0).unwrap();
        b.abx(Op::LoadK, 0, k).unwrap();
        b.abx(Op::Closure, 1, outer).unwrap();
        b.abc(Op::Move, 0, 0, 0).unwrap();
        b.abc(Op::Move, 2, 1, 0).unwrap();
        b.abc(Op::Call, 2, 1, 2).unwrap();
        b.abc(Op::Return, 2, 2, 0).unwrap();
        run_expecting(b.registers(3).build().unwrap(), &[number(123.0)]);
    }
}

mod metamethods {
    use super::*;

    #[test]
    fn add_dispatches_to_the_metatable() {
        // handler = func(a, b) { return 99 }
        let mut handler = proto_builder().params(2).registers(3);
        let k = handler.number(99.0).unwrap();
        handler.abx(Op::LoadK, 2, k).unwrap();
        handler.abc(Op::Return, 2, 2, 0).unwrap();
        let handler = handler.build().unwrap();

        let mut b = proto_builder();
        let handler = b.proto(handler);
        b.abc(Op::NewTable, 0, 0, 0).unwrap(); // t
        b.abc(Op::NewTable, 1, 0, 0).unwrap(); // mt
        b.abx(Op::Closure, 2, handler).unwrap();
        let add_key = b.string_rk("__add").unwrap();
        b.abc(Op::SetTableKs, 1, add_key, 2).unwrap();
        // SetMetatable(t, mt)
        let set_mt = b.string("SetMetatable").unwrap();
        b.abx(Op::GetGlobal, 3, set_mt).unwrap();
        b.abc(Op::Move, 4, 0, 0).unwrap();
        b.abc(Op::Move, 5, 1, 0).unwrap();
        b.abc(Op::Call, 3, 3, 1).unwrap();
        b.abc(Op::Add, 6, 0, 0).unwrap();
        b.abc(Op::Return, 6, 2, 0).unwrap();
        run_expecting(b.registers(7).build().unwrap(), &[number(99.0)]);
    }

    #[test]
    fn index_table_chain_and_newindex_raw_hit() {
        // t = {}; t.__index = t; SetMetatable(t, t)
        // u = {}; SetMetatable(u, t); u.x = 5; return u.x
        let mut b = proto_builder();
        b.abc(Op::NewTable, 0, 0, 0).unwrap(); // t
        let index_key = b.string_rk("__index").unwrap();
        b.abc(Op::SetTableKs, 0, index_key, 0).unwrap();
        let dbg = b.string("dbglib").unwrap();
        let set_mt = b.string_rk("SetMetatable").unwrap();
        b.abx(Op::GetGlobal, 1, dbg).unwrap();
        b.abc(Op::GetTableKs, 1, 1, set_mt).unwrap();
        b.abc(Op::Move, 2, 0, 0).unwrap();
        b.abc(Op::Move, 3, 0, 0).unwrap();
        b.abc(Op::Call, 1, 3, 1).unwrap();
        b.abc(Op::NewTable, 4, 0, 0).unwrap(); // u
        b.abx(Op::GetGlobal, 5, dbg).unwrap();
        b.abc(Op::GetTableKs, 5, 5, set_mt).unwrap();
        b.abc(Op::Move, 6, 4, 0).unwrap();
        b.abc(Op::Move, 7, 0, 0).unwrap();
        b.abc(Op::Call, 5, 3, 1).unwrap();
        let x_key = b.string_rk("x").unwrap();
        let five = b.number_rk(5.0).unwrap();
        b.abc(Op::SetTableKs, 4, x_key, five).unwrap();
        b.abc(Op::GetTableKs, 8, 4, x_key).unwrap();
        b.abc(Op::Return, 8, 2, 0).unwrap();
        run_expecting(b.registers(9).build().unwrap(), &[number(5.0)]);
    }

    #[test]
    fn index_function_receives_table_and_key() {
        // mt.__index = func(t, k) { return k }
        let mut handler = proto_builder().params(2).registers(3);
        handler.abc(Op::Return, 1, 2, 0).unwrap();
        let handler = handler.build().unwrap();

        let mut b = proto_builder();
        let handler = b.proto(handler);
        b.abc(Op::NewTable, 0, 0, 0).unwrap();
        b.abc(Op::NewTable, 1, 0, 0).unwrap();
        b.abx(Op::Closure, 2, handler).unwrap();
        let index_key = b.string_rk("__index").unwrap();
        b.abc(Op::SetTableKs, 1, index_key, 2).unwrap();
        let set_mt = b.string("SetMetatable").unwrap();
        b.abx(Op::GetGlobal, 3, set_mt).unwrap();
        b.abc(Op::Move, 4, 0, 0).unwrap();
        b.abc(Op::Move, 5, 1, 0).unwrap();
        b.abc(Op::Call, 3, 3, 1).unwrap();
        let probe = b.string_rk("probe").unwrap();
        b.abc(Op::GetTableKs, 6, 0, probe).unwrap();
        b.abc(Op::Return, 6, 2, 0).unwrap();
        run_expecting(b.registers(7).build().unwrap(), &[string("probe")]);
    }

    #[test]
    fn call_metamethod_makes_tables_callable() {
        // mt.__call = func(self, a) { return a * 2 }
        let mut handler = proto_builder().params(2).registers(3);
        let two = handler.number_rk(2.0).unwrap();
        handler.abc(Op::Mul, 2, 1, two).unwrap();
        handler.abc(Op::Return, 2, 2, 0).unwrap();
        let handler = handler.build().unwrap();

        let mut b = proto_builder();
        let handler = b.proto(handler);
        b.abc(Op::NewTable, 0, 0, 0).unwrap();
        b.abc(Op::NewTable, 1, 0, 0).unwrap();
        b.abx(Op::Closure, 2, handler).unwrap();
        let call_key = b.string_rk("__call").unwrap();
        b.abc(Op::SetTableKs, 1, call_key, 2).unwrap();
        let set_mt = b.string("SetMetatable").unwrap();
        b.abx(Op::GetGlobal, 3, set_mt).unwrap();
        b.abc(Op::Move, 4, 0, 0).unwrap();
        b.abc(Op::Move, 5, 1, 0).unwrap();
        b.abc(Op::Call, 3, 3, 1).unwrap();
        // t(21)
        b.abc(Op::Move, 6, 0, 0).unwrap();
        let k21 = b.number(21.0).unwrap();
        b.abx(Op::LoadK, 7, k21).unwrap();
        b.abc(Op::Call, 6, 2, 2).unwrap();
        b.abc(Op::Return, 6, 2, 0).unwrap();
        run_expecting(b.registers(8).build().unwrap(), &[number(42.0)]);
    }

    #[test]
    fn eq_metamethod_applies_to_distinct_tables() {
        let mut handler = proto_builder().params(2).registers(3);
        handler.abc(Op::LoadBool, 2, 1, 0).unwrap();
        handler.abc(Op::Return, 2, 2, 0).unwrap();
        let handler = handler.build().unwrap();

        let mut b = proto_builder();
        let handler = b.proto(handler);
        b.abc(Op::NewTable, 0, 0, 0).unwrap(); // a
        b.abc(Op::NewTable, 1, 0, 0).unwrap(); // b
        b.abc(Op::NewTable, 2, 0, 0).unwrap(); // mt
        b.abx(Op::Closure, 3, handler).unwrap();
        let eq_key = b.string_rk("__eq").unwrap();
        b.abc(Op::SetTableKs, 2, eq_key, 3).unwrap();
        let set_mt = b.string("SetMetatable").unwrap();
        for target in [0u32, 1] {
            b.abx(Op::GetGlobal, 4, set_mt).unwrap();
            b.abc(Op::Move, 5, target, 0).unwrap();
            b.abc(Op::Move, 6, 2, 0).unwrap();
            b.abc(Op::Call, 4, 3, 1).unwrap();
        }
        b.abc(Op::Eq, 1, 0, 1).unwrap();
        b.asbx(Op::Jmp, 0, 1).unwrap();
        b.abc(Op::LoadBool, 7, 0, 1).unwrap();
        b.abc(Op::LoadBool, 7, 1, 0).unwrap();
        b.abc(Op::Return, 7, 2, 0).unwrap();
        run_expecting(b.registers(8).build().unwrap(), &[boolean(true)]);
    }
}

mod type_assertions {
    use super::*;

    #[test]
    fn matching_tag_passes_the_value_through() {
        let mut b = proto_builder();
        let hello = b.string("hello").unwrap();
        b.abx(Op::LoadK, 0, hello).unwrap();
        let tag = b.string_rk("string").unwrap();
        b.abc(Op::TypeAssert, 1, 0, tag).unwrap();
        b.abc(Op::Return, 1, 2, 0).unwrap();
        run_expecting(b.registers(2).build().unwrap(), &[string("hello")]);
    }

    #[test]
    fn mismatched_tag_fails() {
        let mut b = proto_builder();
        let hello = b.string("hello").unwrap();
        b.abx(Op::LoadK, 0, hello).unwrap();
        let tag = b.string_rk("number").unwrap();
        b.abc(Op::TypeAssert, 1, 0, tag).unwrap();
        b.abc(Op::Return, 1, 2, 0).unwrap();
        run_expecting_error(
            b.registers(2).build().unwrap(),
            "type assertion failed: expected number, got string",
        );
    }

    #[test]
    fn channel_tag_matches_no_value() {
        let mut b = proto_builder();
        b.abc(Op::NewTable, 0, 0, 0).unwrap();
        let tag = b.string_rk("channel").unwrap();
        b.abc(Op::TypeAssert, 1, 0, tag).unwrap();
        b.abc(Op::Return, 1, 2, 0).unwrap();
        run_expecting_error(
            b.registers(2).build().unwrap(),
            "type assertion failed: expected channel, got table",
        );
    }
}

mod generic_for {
    use super::*;

    #[test]
    fn iterates_with_pairs() {
        // sum = 0; for _, v in Pairs({10, 20, 30}) { sum = sum + v }
        let mut b = proto_builder();
        b.abc(Op::NewTable, 0, 3, 0).unwrap();
        for (i, n) in [10.0, 20.0, 30.0].iter().enumerate() {
            let k = b.number(*n).unwrap();
            b.abx(Op::LoadK, 1 + i as u32, k).unwrap();
        }
        b.abc(Op::SetList, 0, 3, 1).unwrap();
        let zero = b.number(0.0).unwrap();
        b.abx(Op::LoadK, 4, zero).unwrap();
        let pairs = b.string("Pairs").unwrap();
        b.abx(Op::GetGlobal, 5, pairs).unwrap();
        b.abc(Op::Move, 6, 0, 0).unwrap();
        b.abc(Op::Call, 5, 2, 4).unwrap();
        let loop_jump = b.jump_placeholder(Op::Jmp, 0).unwrap();
        let body = b.next_ip();
        b.abc(Op::Add, 4, 4, 9).unwrap();
        let tfor = b.next_ip();
        b.abc(Op::TForLoop, 5, 0, 1).unwrap();
        let back = b.jump_placeholder(Op::Jmp, 0).unwrap();
        b.patch_jump(loop_jump, tfor).unwrap();
        b.patch_jump(back, body).unwrap();
        b.abc(Op::Return, 4, 2, 0).unwrap();
        run_expecting(b.registers(10).build().unwrap(), &[number(60.0)]);
    }
}
