//! The debug library

use super::DEBUG_LIB_NAME;
use crate::{MFunction, MValue, MilkVm, Result};

pub(crate) fn register(vm: &MilkVm) {
    let module = vm.new_table();

    vm.add_module_fn(&module, "GetMetatable", debug_get_metatable);
    vm.add_module_fn(&module, "SetMetatable", debug_set_metatable);
    vm.add_module_fn(&module, "GetUpvalue", debug_get_upvalue);
    vm.add_module_fn(&module, "SetUpvalue", debug_set_upvalue);
    vm.add_module_fn(&module, "GetInfo", debug_get_info);
    vm.add_module_fn(&module, "Traceback", debug_traceback);

    vm.register_module(DEBUG_LIB_NAME, module);
}

// The raw metatable, ignoring __metatable protection
fn debug_get_metatable(vm: &mut MilkVm) -> Result<i32> {
    let value = vm.check_any(1)?;
    match vm.metatable_of(&value) {
        Some(mt) => vm.push(MValue::Table(mt))?,
        None => vm.push(MValue::Nil)?,
    }
    Ok(1)
}

fn debug_set_metatable(vm: &mut MilkVm) -> Result<i32> {
    let value = vm.check_any(1)?;
    let metatable = match vm.get(2) {
        MValue::Nil => None,
        MValue::Table(t) => Some(t),
        _ => return vm.arg_error(2, "nil or table expected"),
    };
    vm.set_metatable_raw(&value, metatable)?;
    vm.set_top(1)?;
    Ok(1)
}

fn debug_get_upvalue(vm: &mut MilkVm) -> Result<i32> {
    let function = vm.check_function(1)?;
    let index = vm.check_int(2)?;
    if index < 1 {
        vm.push(MValue::Nil)?;
        return Ok(1);
    }
    match function.get_upvalue(index as usize - 1) {
        Some(value) => {
            let name = function
                .upvalue_name(index as usize - 1)
                .map(|n| n.to_string())
                .unwrap_or_default();
            vm.push(MValue::Str(name.into()))?;
            vm.push(value)?;
            Ok(2)
        }
        None => {
            vm.push(MValue::Nil)?;
            Ok(1)
        }
    }
}

fn debug_set_upvalue(vm: &mut MilkVm) -> Result<i32> {
    let function = vm.check_function(1)?;
    let index = vm.check_int(2)?;
    let value = vm.check_any(3)?;
    if index >= 1 && function.set_upvalue(index as usize - 1, value) {
        let name = function
            .upvalue_name(index as usize - 1)
            .map(|n| n.to_string())
            .unwrap_or_default();
        vm.push(MValue::Str(name.into()))?;
    } else {
        vm.push(MValue::Nil)?;
    }
    Ok(1)
}

// The function and current line at the given level, 1 being GetInfo's caller
fn frame_at_level(vm: &MilkVm, level: usize) -> Option<(MFunction, u32)> {
    let exec = vm.thread.0.exec.borrow();
    let frame = exec.frames.iter().rev().skip(1).nth(level.saturating_sub(1))?;
    let line = frame
        .proto()
        .map(|proto| proto.line_at(frame.pc.saturating_sub(1)))
        .unwrap_or(0);
    Some((frame.function.clone(), line))
}

fn info_table(vm: &MilkVm, function: &MFunction, current_line: u32) -> MValue {
    let info = vm.new_table();
    match function.proto() {
        Some(proto) => {
            info.raw_set_str("source", MValue::Str(proto.source.as_ref().into()));
            info.raw_set_str("what", MValue::Str("Lua".into()));
            info.raw_set_str("linedefined", MValue::Number(proto.line_defined as f64));
            info.raw_set_str(
                "lastlinedefined",
                MValue::Number(proto.last_line_defined as f64),
            );
        }
        None => {
            info.raw_set_str("source", MValue::Str("[host]".into()));
            info.raw_set_str("what", MValue::Str("G".into()));
            info.raw_set_str("linedefined", MValue::Number(-1.0));
            info.raw_set_str("lastlinedefined", MValue::Number(-1.0));
        }
    }
    match function.name() {
        Some(name) => info.raw_set_str("name", MValue::Str(name.as_ref().into())),
        None => info.raw_set_str("name", MValue::Nil),
    }
    info.raw_set_str("currentline", MValue::Number(current_line as f64));
    info.raw_set_str("nups", MValue::Number(function.upvalue_count() as f64));
    info.raw_set_str("func", MValue::Function(function.clone()));
    MValue::Table(info)
}

fn debug_get_info(vm: &mut MilkVm) -> Result<i32> {
    match vm.check_any(1)? {
        MValue::Function(function) => {
            let info = info_table(vm, &function, 0);
            vm.push(info)?;
            Ok(1)
        }
        MValue::Number(level) => match frame_at_level(vm, level as usize) {
            Some((function, line)) => {
                let info = info_table(vm, &function, line);
                vm.push(info)?;
                Ok(1)
            }
            None => {
                vm.push(MValue::Nil)?;
                Ok(1)
            }
        },
        _ => vm.arg_error(1, "function or level expected"),
    }
}

fn debug_traceback(vm: &mut MilkVm) -> Result<i32> {
    let message = vm.opt_string(1, "")?;
    let mut result = String::new();
    if !message.is_empty() {
        result.push_str(&message);
        result.push('\n');
    }
    result.push_str("stack traceback:");

    let lines: Vec<String> = {
        let exec = vm.thread.0.exec.borrow();
        exec.frames
            .iter()
            .rev()
            .skip(1)
            .map(|frame| match frame.proto() {
                Some(proto) => format!(
                    "\n\t{}:{}: in {}",
                    proto.source,
                    proto.line_at(frame.pc.saturating_sub(1)),
                    proto.name_for_display(),
                ),
                None => format!(
                    "\n\t[host]: in function '{}'",
                    frame.function.name_for_error()
                ),
            })
            .collect()
    };
    for line in lines {
        result.push_str(&line);
    }

    vm.push(MValue::Str(result.into()))?;
    Ok(1)
}
