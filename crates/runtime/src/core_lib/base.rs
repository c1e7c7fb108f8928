//! The base functions, registered directly into the globals

use crate::{Error, MFunction, MValue, MetaMethod, MilkVm, MilkWrite as _, Result, MULTRET};

pub(crate) fn register(vm: &MilkVm) {
    let globals = vm.globals();
    globals.raw_set_str("_G", MValue::Table(globals.clone()));
    globals.raw_set_str("_VERSION", MValue::Str("Lua 5.1".into()));

    let add = |name: &str, f: fn(&mut MilkVm) -> Result<i32>| {
        let function = MFunction::native(Some(name), globals.clone(), f);
        globals.raw_set_str(name, MValue::Function(function));
    };

    add("Assert", base_assert);
    add("Error", base_error);
    add("GetMetatable", base_get_metatable);
    add("SetMetatable", base_set_metatable);
    add("Next", base_next);
    add("PCall", base_pcall);
    add("XpCall", base_xpcall);
    add("Print", base_print);
    add("PrintLn", base_println);
    add("RawEqual", base_raw_equal);
    add("RawGet", base_raw_get);
    add("RawSet", base_raw_set);
    add("Select", base_select);
    add("ToNumber", base_to_number);
    add("ToString", base_to_string);
    add("Type", base_type);
    add("GetFEnv", base_get_fenv);
    add("SetFEnv", base_set_fenv);

    // Pairs and IPairs close over their iterator functions
    let pairs_aux = MFunction::native(Some("next"), globals.clone(), pairs_aux);
    let pairs = MFunction::native_with_upvalues(
        Some("Pairs"),
        globals.clone(),
        base_pairs,
        vec![MValue::Function(pairs_aux)],
    );
    globals.raw_set_str("Pairs", MValue::Function(pairs));

    let ipairs_aux = MFunction::native(Some("inext"), globals.clone(), ipairs_aux);
    let ipairs = MFunction::native_with_upvalues(
        Some("IPairs"),
        globals.clone(),
        base_ipairs,
        vec![MValue::Function(ipairs_aux)],
    );
    globals.raw_set_str("IPairs", MValue::Function(ipairs));
}

fn base_assert(vm: &mut MilkVm) -> Result<i32> {
    if !vm.check_any(1)?.is_truthy() {
        let message = vm.opt_string(2, "assertion failed!")?;
        return vm.raise(message);
    }
    Ok(vm.get_top() as i32)
}

fn base_error(vm: &mut MilkVm) -> Result<i32> {
    let value = vm.check_any(1)?;
    let level = vm.opt_int(2, 1)?;
    let value = match value {
        // string errors pick up a position prefix unless level is zero
        MValue::Str(s) if level > 0 => MValue::Str(format!("{}{}", vm.where_string(), s).into()),
        other => other,
    };
    Err(Error::from_value(value))
}

fn base_get_metatable(vm: &mut MilkVm) -> Result<i32> {
    let value = vm.check_any(1)?;
    let metatable = vm.get_metatable(&value);
    vm.push(metatable)?;
    Ok(1)
}

fn base_set_metatable(vm: &mut MilkVm) -> Result<i32> {
    let value = vm.check_any(1)?;
    let metatable = match vm.get(2) {
        MValue::Nil => None,
        MValue::Table(t) => Some(t),
        _ => return vm.arg_error(2, "nil or table expected"),
    };
    if value.is_nil() {
        return vm.raise("cannot set metatable to a nil object");
    }
    vm.set_metatable(&value, metatable)?;
    vm.set_top(1)?;
    Ok(1)
}

fn base_next(vm: &mut MilkVm) -> Result<i32> {
    let table = vm.check_table(1)?;
    let key = vm.get(2);
    match table.next(&key)? {
        Some((k, v)) => {
            vm.push(k)?;
            vm.push(v)?;
            Ok(2)
        }
        None => {
            vm.push(MValue::Nil)?;
            Ok(1)
        }
    }
}

fn pairs_aux(vm: &mut MilkVm) -> Result<i32> {
    let table = vm.check_table(1)?;
    let key = vm.get(2);
    match table.next(&key)? {
        Some((k, v)) => {
            vm.push(k)?;
            vm.push(v)?;
            Ok(2)
        }
        None => Ok(0),
    }
}

fn base_pairs(vm: &mut MilkVm) -> Result<i32> {
    let table = vm.check_table(1)?;
    vm.push(vm.upvalue(1))?;
    vm.push(MValue::Table(table))?;
    vm.push(MValue::Nil)?;
    Ok(3)
}

fn ipairs_aux(vm: &mut MilkVm) -> Result<i32> {
    let table = vm.check_table(1)?;
    let i = vm.check_int(2)? + 1;
    let value = table.raw_get_int(i);
    if value.is_nil() {
        Ok(0)
    } else {
        vm.push(MValue::Number(i as f64))?;
        vm.push(value)?;
        Ok(2)
    }
}

fn base_ipairs(vm: &mut MilkVm) -> Result<i32> {
    let table = vm.check_table(1)?;
    vm.push(vm.upvalue(1))?;
    vm.push(MValue::Table(table))?;
    vm.push(MValue::Number(0.0))?;
    Ok(3)
}

fn base_pcall(vm: &mut MilkVm) -> Result<i32> {
    let value = vm.check_any(1)?;
    let callable = matches!(value, MValue::Function(_))
        || matches!(
            vm.get_metamethod(&value, MetaMethod::Call),
            Some(MValue::Function(_))
        );
    if !callable {
        vm.push(MValue::Bool(false))?;
        vm.push(MValue::Str(
            format!("attempt to call a {} value", value.type_name()).into(),
        ))?;
        return Ok(2);
    }

    let nargs = vm.get_top() - 1;
    match vm.pcall(nargs, MULTRET, None) {
        Ok(()) => {
            vm.insert(MValue::Bool(true), 1)?;
            Ok(vm.get_top() as i32)
        }
        Err(error) => {
            vm.push(MValue::Bool(false))?;
            vm.push(error.value())?;
            Ok(2)
        }
    }
}

fn base_xpcall(vm: &mut MilkVm) -> Result<i32> {
    let function = vm.check_function(1)?;
    let handler = vm.check_function(2)?;

    let base_top = vm.get_top();
    vm.push(MValue::Function(function))?;
    match vm.pcall(0, MULTRET, Some(MValue::Function(handler))) {
        Ok(()) => {
            vm.insert(MValue::Bool(true), base_top + 1)?;
            Ok((vm.get_top() - base_top) as i32)
        }
        Err(error) => {
            vm.push(MValue::Bool(false))?;
            vm.push(error.value())?;
            Ok(2)
        }
    }
}

fn print_values(vm: &mut MilkVm) -> Result<String> {
    let top = vm.get_top();
    let mut line = String::new();
    for i in 1..=top {
        let value = vm.get(i as i64);
        line.push_str(&vm.to_string_meta(&value)?);
        if i != top {
            line.push(' ');
        }
    }
    Ok(line)
}

fn base_print(vm: &mut MilkVm) -> Result<i32> {
    let line = print_values(vm)?;
    vm.stdout().write(&line)?;
    Ok(0)
}

fn base_println(vm: &mut MilkVm) -> Result<i32> {
    let line = print_values(vm)?;
    vm.stdout().write_line(&line)?;
    Ok(0)
}

fn base_raw_equal(vm: &mut MilkVm) -> Result<i32> {
    let result = vm.check_any(1)? == vm.check_any(2)?;
    vm.push(MValue::Bool(result))?;
    Ok(1)
}

fn base_raw_get(vm: &mut MilkVm) -> Result<i32> {
    let table = vm.check_table(1)?;
    let key = vm.check_any(2)?;
    vm.push(table.raw_get(&key))?;
    Ok(1)
}

fn base_raw_set(vm: &mut MilkVm) -> Result<i32> {
    let table = vm.check_table(1)?;
    let key = vm.check_any(2)?;
    let value = vm.check_any(3)?;
    table.raw_set(key, value)?;
    Ok(0)
}

fn base_select(vm: &mut MilkVm) -> Result<i32> {
    match vm.check_any(1)? {
        MValue::Number(n) => {
            let count = vm.get_top() as i64;
            let mut index = n as i64;
            if index < 0 {
                index += count;
            } else if index > count {
                index = count;
            }
            if index < 1 {
                return vm.arg_error(1, "index out of range");
            }
            Ok((count - index) as i32)
        }
        MValue::Str(s) => {
            if s.as_str() != "#" {
                return vm.arg_error(1, format!("invalid string '{s}'"));
            }
            vm.push(MValue::Number(vm.get_top() as f64 - 1.0))?;
            Ok(1)
        }
        _ => vm.arg_error(1, "number or string expected"),
    }
}

fn base_to_number(vm: &mut MilkVm) -> Result<i32> {
    let base = vm.opt_int(2, 10)?;
    let no_base = vm.get(2).is_nil();
    if !(2..=36).contains(&base) {
        return vm.arg_error(2, "base out of range");
    }

    let result = match vm.check_any(1)? {
        MValue::Number(n) => MValue::Number(n),
        MValue::Str(s) => {
            let text = s.trim();
            if text.contains('.') || (no_base && (text.contains('e') || text.contains('E'))) {
                match text.parse::<f64>() {
                    Ok(n) => MValue::Number(n),
                    Err(_) => MValue::Nil,
                }
            } else {
                let lower = text.to_ascii_lowercase();
                let (radix, digits) = if no_base && lower.starts_with("0x") {
                    (16, &text[2..])
                } else if no_base && lower.starts_with("0b") {
                    (2, &text[2..])
                } else if no_base && lower.starts_with("0o") {
                    (8, &text[2..])
                } else {
                    (base as u32, text)
                };
                match i64::from_str_radix(digits, radix) {
                    Ok(n) => MValue::Number(n as f64),
                    Err(_) => MValue::Nil,
                }
            }
        }
        _ => MValue::Nil,
    };
    vm.push(result)?;
    Ok(1)
}

fn base_to_string(vm: &mut MilkVm) -> Result<i32> {
    let value = vm.check_any(1)?;
    let result = vm.to_string_meta(&value)?;
    vm.push(MValue::Str(result))?;
    Ok(1)
}

fn base_type(vm: &mut MilkVm) -> Result<i32> {
    let value = vm.check_any(1)?;
    vm.push(MValue::Str(value.type_name().into()))?;
    Ok(1)
}

fn base_get_fenv(vm: &mut MilkVm) -> Result<i32> {
    let env = match vm.get(1) {
        MValue::Function(f) if !f.is_native() => f.env(),
        _ => vm.globals(),
    };
    vm.push(MValue::Table(env))?;
    Ok(1)
}

fn base_set_fenv(vm: &mut MilkVm) -> Result<i32> {
    let function = vm.check_function(1)?;
    let env = vm.check_table(2)?;
    if !function.set_env(env) {
        return vm.raise("cannot change the environment of given object");
    }
    vm.push(MValue::Function(function))?;
    Ok(1)
}
