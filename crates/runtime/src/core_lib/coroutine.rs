//! The coroutine library

use super::COROUTINE_LIB_NAME;
use crate::{vm::Resumed, MValue, MilkVm, Result, YIELD};

pub(crate) fn register(vm: &MilkVm) {
    let module = vm.new_table();

    vm.add_module_fn(&module, "Create", co_create);
    vm.add_module_fn(&module, "Yield", co_yield);
    vm.add_module_fn(&module, "Resume", co_resume);
    vm.add_module_fn(&module, "Running", co_running);
    vm.add_module_fn(&module, "Status", co_status);
    vm.add_module_fn(&module, "Wrap", co_wrap);

    vm.register_module(COROUTINE_LIB_NAME, module);
}

fn co_create(vm: &mut MilkVm) -> Result<i32> {
    let function = vm.check_function(1)?;
    let thread = vm.new_thread(function);
    vm.push(MValue::Thread(thread))?;
    Ok(1)
}

// The yield values are the arguments; the VM picks them up from this call's
// frame when it sees the sentinel.
fn co_yield(_vm: &mut MilkVm) -> Result<i32> {
    Ok(YIELD)
}

fn co_resume(vm: &mut MilkVm) -> Result<i32> {
    let thread = vm.check_thread(1)?;
    let mut args = Vec::with_capacity(vm.get_top().saturating_sub(1));
    for i in 2..=vm.get_top() {
        args.push(vm.get(i as i64));
    }

    match vm.resume_thread(&thread, &args) {
        Resumed::Return(values) | Resumed::Yield(values) => {
            vm.push(MValue::Bool(true))?;
            let count = values.len();
            for value in values {
                vm.push(value)?;
            }
            Ok(1 + count as i32)
        }
        Resumed::Error(error) => {
            if thread.is_wrapped() {
                Err(error)
            } else {
                vm.push(MValue::Bool(false))?;
                vm.push(error.value())?;
                Ok(2)
            }
        }
    }
}

fn co_running(vm: &mut MilkVm) -> Result<i32> {
    let current = vm.current_thread();
    if current.ptr_eq(&vm.main_thread()) {
        vm.push(MValue::Nil)?;
    } else {
        vm.push(MValue::Thread(current))?;
    }
    Ok(1)
}

fn co_status(vm: &mut MilkVm) -> Result<i32> {
    let thread = vm.check_thread(1)?;
    vm.push(MValue::Str(vm.status_of(&thread).into()))?;
    Ok(1)
}

fn wrap_aux(vm: &mut MilkVm) -> Result<i32> {
    let MValue::Thread(thread) = vm.upvalue(1) else {
        return vm.raise("wrapped coroutine is missing its thread");
    };
    let mut args = Vec::with_capacity(vm.get_top());
    for i in 1..=vm.get_top() {
        args.push(vm.get(i as i64));
    }

    match vm.resume_thread(&thread, &args) {
        Resumed::Return(values) | Resumed::Yield(values) => {
            let count = values.len();
            for value in values {
                vm.push(value)?;
            }
            Ok(count as i32)
        }
        Resumed::Error(error) => Err(error),
    }
}

fn co_wrap(vm: &mut MilkVm) -> Result<i32> {
    let function = vm.check_function(1)?;
    let thread = vm.new_thread(function);
    thread.set_wrapped(true);
    let wrapper = vm.new_closure(Some("Wrap"), wrap_aux, vec![MValue::Thread(thread)]);
    vm.push(MValue::Function(wrapper))?;
    Ok(1)
}
