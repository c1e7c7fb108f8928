//! Tests for the host-function interface: the 1-based value stack, argument
//! validation, value construction, and the protected-call surface.


use milk_runtime::{MValue, MilkUserData, MilkVm, MULTRET};
use runtime_test_utils::{boolean, number, string};

fn call_native(
    vm: &mut MilkVm,
    f: impl Fn(&mut MilkVm) -> milk_runtime::Result<i32> + 'static,
    args: &[MValue],
) -> milk_runtime::Result<Vec<MValue>> {
    let function = vm.new_function(Some("test_fn"), f);
    vm.call_value_multi(MValue::Function(function), args)
}

#[test]
fn stack_window_is_frame_scoped() {
    let mut vm = MilkVm::new();
    let results = call_native(
        &mut vm,
        |vm| {
            assert_eq!(vm.get_top(), 2);
            assert_eq!(vm.get(1), number(1.0));
            assert_eq!(vm.get(2), number(2.0));
            // negative indices count back from the top
            assert_eq!(vm.get(-1), number(2.0));
            assert_eq!(vm.get(-2), number(1.0));
            assert_eq!(vm.get(3), MValue::Nil);

            vm.push(number(3.0))?;
            assert_eq!(vm.get_top(), 3);
            vm.pop(1);
            assert_eq!(vm.get_top(), 2);

            vm.push(string("result"))?;
            Ok(1)
        },
        &[number(1.0), number(2.0)],
    )
    .unwrap();
    assert_eq!(results, vec![string("result")]);
}

#[test]
fn insert_shifts_the_window() {
    let mut vm = MilkVm::new();
    let results = call_native(
        &mut vm,
        |vm| {
            vm.insert(string("first"), 1)?;
            Ok(vm.get_top() as i32)
        },
        &[string("second"), string("third")],
    )
    .unwrap();
    assert_eq!(
        results,
        vec![string("first"), string("second"), string("third")]
    );
}

#[test]
fn check_errors_name_the_argument() {
    let mut vm = MilkVm::new();
    let error = call_native(
        &mut vm,
        |vm| {
            vm.check_table(1)?;
            Ok(0)
        },
        &[number(5.0)],
    )
    .unwrap_err();
    assert_eq!(
        error.to_string(),
        "bad argument #1 to 'test_fn' (table expected, got number)"
    );

    let error = call_native(
        &mut vm,
        |vm| {
            vm.check_any(1)?;
            Ok(0)
        },
        &[],
    )
    .unwrap_err();
    assert!(error.to_string().contains("value expected"));
}

#[test]
fn missing_arguments_read_as_no_value() {
    let mut vm = MilkVm::new();
    let error = call_native(
        &mut vm,
        |vm| {
            vm.check_string(2)?;
            Ok(0)
        },
        &[string("only one")],
    )
    .unwrap_err();
    assert!(error.to_string().contains("string expected, got no value"));
}

#[test]
fn opt_helpers_use_defaults() {
    let mut vm = MilkVm::new();
    call_native(
        &mut vm,
        |vm| {
            assert_eq!(vm.opt_int(1, 7)?, 3);
            assert_eq!(vm.opt_int(2, 7)?, 7);
            assert_eq!(vm.opt_string(3, "fallback")?.as_str(), "fallback");
            assert_eq!(vm.opt_number(4, 1.5)?, 1.5);
            Ok(0)
        },
        &[number(3.0)],
    )
    .unwrap();
}

#[test]
fn check_string_coerces_numbers() {
    let mut vm = MilkVm::new();
    call_native(
        &mut vm,
        |vm| {
            assert_eq!(vm.check_string(1)?.as_str(), "42");
            Ok(0)
        },
        &[number(42.0)],
    )
    .unwrap();
}

#[test]
fn userdata_payloads_downcast() {
    struct Counter {
        hits: u32,
    }
    impl MilkUserData for Counter {
        fn type_string(&self) -> String {
            "counter".to_string()
        }
    }

    let mut vm = MilkVm::new();
    let ud = vm.new_userdata(Counter { hits: 3 });
    let results = call_native(
        &mut vm,
        |vm| {
            let ud = vm.check_userdata(1)?;
            let hits = ud
                .data()
                .downcast_ref::<Counter>()
                .map(|c| c.hits)
                .unwrap_or(0);
            vm.push(number(hits as f64))?;
            Ok(1)
        },
        &[MValue::UserData(ud)],
    )
    .unwrap();
    assert_eq!(results, vec![number(3.0)]);
}

#[test]
fn native_upvalues_are_bound_at_construction() {
    let mut vm = MilkVm::new();
    let bound = vm.new_closure(
        None,
        |vm| {
            let bound_value = vm.upvalue(1);
            vm.push(bound_value)?;
            Ok(1)
        },
        vec![string("captured")],
    );
    let results = vm
        .call_value_multi(MValue::Function(bound), &[])
        .unwrap();
    assert_eq!(results, vec![string("captured")]);
}

#[test]
fn call_and_pcall_follow_the_stack_protocol() {
    let mut vm = MilkVm::new();
    call_native(
        &mut vm,
        |vm| {
            let doubler = vm.new_function(None, |vm| {
                let n = vm.check_number(1)?;
                vm.push(number(n * 2.0))?;
                Ok(1)
            });
            vm.push(MValue::Function(doubler))?;
            vm.push(number(21.0))?;
            vm.call(1, 1)?;
            assert_eq!(vm.get(-1), number(42.0));

            let failing = vm.new_function(None, |_| Err("inner failure".into()));
            vm.push(MValue::Function(failing))?;
            let error = vm.pcall(0, MULTRET, None).unwrap_err();
            assert!(error.to_string().contains("inner failure"));

            Ok(0)
        },
        &[],
    )
    .unwrap();
}

#[test]
fn pcall_handlers_transform_the_error() {
    let mut vm = MilkVm::new();
    call_native(
        &mut vm,
        |vm| {
            let failing = vm.new_function(None, |_| Err("original".into()));
            let handler = vm.new_function(None, |vm| {
                let message = vm.check_string(1)?;
                vm.push(MValue::Str(format!("handled: {message}").into()))?;
                Ok(1)
            });
            vm.push(MValue::Function(failing))?;
            let error = vm
                .pcall(0, MULTRET, Some(MValue::Function(handler)))
                .unwrap_err();
            assert!(error.value().to_string().starts_with("handled:"));
            Ok(0)
        },
        &[],
    )
    .unwrap();
}

#[test]
fn xmove_transfers_top_values() {
    let mut vm = MilkVm::new();
    let idle = vm.new_function(None, |_| Ok(0));
    let target = vm.new_thread(idle);
    call_native(
        &mut vm,
        move |vm| {
            vm.push(number(1.0))?;
            vm.push(number(2.0))?;
            let before = vm.get_top();
            vm.xmove_to(&vm.thread().clone(), 0)?; // zero moves are a no-op
            assert_eq!(vm.get_top(), before);
            Ok(0)
        },
        &[],
    )
    .unwrap();
    // the idle thread was never started
    assert_eq!(vm.status_of(&target), "suspended");
}

#[test]
fn yield_sentinel_is_rejected_outside_a_coroutine_boundary() {
    let mut vm = MilkVm::new();
    let error = call_native(&mut vm, |_| Ok(milk_runtime::YIELD), &[]).unwrap_err();
    let rendered = error.to_string();
    assert!(
        rendered.contains("yield"),
        "unexpected message: {rendered}"
    );
}

#[test]
fn set_top_adjusts_relative_and_absolute() {
    let mut vm = MilkVm::new();
    call_native(
        &mut vm,
        |vm| {
            vm.push(number(1.0))?;
            vm.push(number(2.0))?;
            vm.push(number(3.0))?;
            vm.set_top(2)?;
            assert_eq!(vm.get_top(), 2);
            vm.set_top(4)?;
            assert_eq!(vm.get_top(), 4);
            // the grown slots read as nil
            assert_eq!(vm.get(4), MValue::Nil);
            Ok(0)
        },
        &[],
    )
    .unwrap();
}

#[test]
fn metatable_surface() {
    let mut vm = MilkVm::new();
    let t = vm.new_table();
    let mt = vm.new_table();
    mt.raw_set_str("__len", MValue::Nil);
    vm.set_metatable(&MValue::Table(t.clone()), Some(mt.clone()))
        .unwrap();
    assert_eq!(vm.get_metatable(&MValue::Table(t.clone())), MValue::Table(mt));
    vm.set_metatable(&MValue::Table(t.clone()), None).unwrap();
    assert_eq!(vm.get_metatable(&MValue::Table(t)), MValue::Nil);
}

#[test]
fn get_and_set_field_follow_metamethods() {
    let mut vm = MilkVm::new();
    let t = vm.new_table();
    let mt = vm.new_table();
    let log = vm.new_table();
    // __newindex as a table redirects writes
    mt.raw_set_str("__newindex", MValue::Table(log.clone()));
    t.set_metatable(Some(mt));

    vm.set_field(&MValue::Table(t.clone()), "x", number(5.0))
        .unwrap();
    assert_eq!(t.raw_get_str("x"), MValue::Nil);
    assert_eq!(log.raw_get_str("x"), number(5.0));
}

#[test]
fn for_each_visits_pairs() {
    let mut vm = MilkVm::new();
    let t = vm.new_table();
    for i in 1..=3 {
        t.raw_set_int(i, number(i as f64 * 10.0));
    }
    let mut sum = 0.0;
    vm.for_each(&t, |_, _, value| {
        if let MValue::Number(n) = value {
            sum += n;
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(sum, 60.0);
}

#[test]
fn registry_growth_is_bounded() {
    let mut vm = MilkVm::new();
    let error = call_native(
        &mut vm,
        |vm| {
            vm.set_top(1_000_000)?;
            Ok(0)
        },
        &[],
    )
    .unwrap_err();
    assert!(error.to_string().contains("registry overflow"));
}

#[test]
fn to_string_meta_renders_values() {
    let mut vm = MilkVm::new();
    assert_eq!(vm.to_string_meta(&number(2.0)).unwrap().as_str(), "2");
    assert_eq!(vm.to_string_meta(&MValue::Nil).unwrap().as_str(), "nil");
    assert_eq!(vm.to_string_meta(&boolean(true)).unwrap().as_str(), "true");
    let rendered = vm
        .to_string_meta(&MValue::Table(vm.new_table()))
        .unwrap();
    assert!(rendered.starts_with("table: 0x"));
}
