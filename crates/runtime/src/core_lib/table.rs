//! The table library

use super::TABLE_LIB_NAME;
use crate::{MFunction, MTable, MValue, MilkVm, Result};

// Recursion bound for deep equality over nested tables
const MAX_EQUAL_DEPTH: usize = 200;

pub(crate) fn register(vm: &MilkVm) {
    let module = vm.new_table();

    vm.add_module_fn(&module, "GetN", table_get_n);
    vm.add_module_fn(&module, "Concat", table_concat);
    vm.add_module_fn(&module, "Clone", table_clone);
    vm.add_module_fn(&module, "Equal", table_equal);
    vm.add_module_fn(&module, "Insert", table_insert);
    vm.add_module_fn(&module, "MaxN", table_max_n);
    vm.add_module_fn(&module, "Remove", table_remove);
    vm.add_module_fn(&module, "Sort", table_sort);
    vm.add_module_fn(&module, "Unpack", table_unpack);
    vm.add_module_fn(&module, "Pack", table_pack);

    vm.register_module(TABLE_LIB_NAME, module);
}

fn table_get_n(vm: &mut MilkVm) -> Result<i32> {
    let table = vm.check_table(1)?;
    vm.push(MValue::Number(table.len() as f64))?;
    Ok(1)
}

fn table_max_n(vm: &mut MilkVm) -> Result<i32> {
    let table = vm.check_table(1)?;
    vm.push(MValue::Number(table.max_n() as f64))?;
    Ok(1)
}

fn table_concat(vm: &mut MilkVm) -> Result<i32> {
    let table = vm.check_table(1)?;
    let separator = vm.opt_string(2, "")?;
    let len = table.len();
    let mut first = vm.opt_int(3, 1)?;
    let mut last = vm.opt_int(4, len)?;

    if vm.get_top() == 3 && (first > len || first < 1) {
        vm.push(MValue::Str("".into()))?;
        return Ok(1);
    }
    first = first.clamp(1, len.max(1));
    last = last.min(len);
    if first > last {
        vm.push(MValue::Str("".into()))?;
        return Ok(1);
    }

    let mut result = String::new();
    for i in first..=last {
        let value = table.raw_get_int(i);
        if !value.can_convert_to_string() {
            return vm.raise(format!(
                "invalid value ({}) at index {} in table for concat",
                value.type_name(),
                i
            ));
        }
        result.push_str(&value.to_string());
        if i != last {
            result.push_str(&separator);
        }
    }
    vm.push(MValue::Str(result.into()))?;
    Ok(1)
}

fn table_insert(vm: &mut MilkVm) -> Result<i32> {
    let table = vm.check_table(1)?;
    match vm.get_top() {
        1 => vm.arg_error(2, "value expected"),
        2 => {
            table.append(vm.check_any(2)?);
            Ok(0)
        }
        _ => {
            let position = vm.check_int(2)?;
            table.insert(position, vm.check_any(3)?);
            Ok(0)
        }
    }
}

fn table_remove(vm: &mut MilkVm) -> Result<i32> {
    let table = vm.check_table(1)?;
    let removed = if vm.get_top() == 1 {
        table.remove(-1)
    } else {
        table.remove(vm.check_int(2)?)
    };
    vm.push(removed)?;
    Ok(1)
}

fn table_sort(vm: &mut MilkVm) -> Result<i32> {
    let table = vm.check_table(1)?;
    let comparator = if vm.get_top() > 1 {
        Some(vm.check_function(2)?)
    } else {
        None
    };

    // the sort works over the array part; the hash part is left untouched
    let mut values = table.take_array();
    let result = sort_values(vm, &mut values, comparator.as_ref());
    table.set_array(values);
    result?;
    Ok(0)
}

fn sort_less(
    vm: &mut MilkVm,
    comparator: Option<&MFunction>,
    lhs: &MValue,
    rhs: &MValue,
) -> Result<bool> {
    match comparator {
        Some(f) => {
            let result =
                vm.call_value(MValue::Function(f.clone()), &[lhs.clone(), rhs.clone()])?;
            Ok(result.is_truthy())
        }
        None => vm.less_than(lhs, rhs),
    }
}

// A stable merge sort; the comparator can call back into the VM and fail, so
// the sort has to propagate errors instead of using the std sort adaptors.
fn sort_values(
    vm: &mut MilkVm,
    values: &mut Vec<MValue>,
    comparator: Option<&MFunction>,
) -> Result<()> {
    if values.len() <= 1 {
        return Ok(());
    }
    let sorted = merge_sort(vm, values.as_slice(), comparator)?;
    *values = sorted;
    Ok(())
}

fn merge_sort(
    vm: &mut MilkVm,
    values: &[MValue],
    comparator: Option<&MFunction>,
) -> Result<Vec<MValue>> {
    if values.len() <= 1 {
        return Ok(values.to_vec());
    }
    let middle = values.len() / 2;
    let left = merge_sort(vm, &values[..middle], comparator)?;
    let right = merge_sort(vm, &values[middle..], comparator)?;

    let mut result = Vec::with_capacity(values.len());
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        // take from the left unless the right element sorts strictly earlier
        if sort_less(vm, comparator, &right[j], &left[i])? {
            result.push(right[j].clone());
            j += 1;
        } else {
            result.push(left[i].clone());
            i += 1;
        }
    }
    result.extend_from_slice(&left[i..]);
    result.extend_from_slice(&right[j..]);
    Ok(result)
}

fn table_unpack(vm: &mut MilkVm) -> Result<i32> {
    let table = vm.check_table(1)?;
    let first = vm.opt_int(2, 1)?;
    let last = vm.opt_int(3, table.len())?;
    if first > last {
        return Ok(0);
    }
    for i in first..=last {
        vm.push(table.raw_get_int(i))?;
    }
    Ok((last - first + 1) as i32)
}

fn table_pack(vm: &mut MilkVm) -> Result<i32> {
    let top = vm.get_top();
    let table = vm.create_table(top, 0);
    for i in 1..=top {
        table.raw_set_int(i as i64, vm.get(i as i64));
    }
    vm.push(MValue::Table(table))?;
    Ok(1)
}

fn table_equal(vm: &mut MilkVm) -> Result<i32> {
    let lhs = vm.check_table(1)?;
    let rhs = vm.check_table(2)?;
    let result = deep_equal_tables(vm, &lhs, &rhs, 0)?;
    vm.push(MValue::Bool(result))?;
    Ok(1)
}

fn deep_equal_tables(vm: &MilkVm, lhs: &MTable, rhs: &MTable, depth: usize) -> Result<bool> {
    if lhs.ptr_eq(rhs) {
        return Ok(true);
    }
    if depth >= MAX_EQUAL_DEPTH {
        return vm.raise("tables too deeply nested for Equal");
    }
    if lhs.len() != rhs.len() {
        return Ok(false);
    }
    for (key, value) in lhs.pairs() {
        if !deep_equal(vm, &value, &rhs.raw_get(&key), depth + 1)? {
            return Ok(false);
        }
    }
    for (key, _) in rhs.pairs() {
        if lhs.raw_get(&key).is_nil() {
            return Ok(false);
        }
    }
    Ok(true)
}

fn deep_equal(vm: &MilkVm, lhs: &MValue, rhs: &MValue, depth: usize) -> Result<bool> {
    if lhs == rhs {
        return Ok(true);
    }
    match (lhs, rhs) {
        (MValue::Table(a), MValue::Table(b)) => deep_equal_tables(vm, a, b, depth),
        _ => Ok(false),
    }
}

// Returns a shallow copy: the contents are aliased, the container is fresh
fn table_clone(vm: &mut MilkVm) -> Result<i32> {
    let table = vm.check_table(1)?;
    let copy = vm.new_table();
    for (key, value) in table.pairs() {
        copy.raw_set_key(
            crate::ValueKey::new(key).expect("table keys are always valid"),
            value,
        );
    }
    copy.set_metatable(table.metatable());
    vm.push(MValue::Table(copy))?;
    Ok(1)
}
