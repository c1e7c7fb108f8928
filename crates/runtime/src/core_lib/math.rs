//! The math library

use super::MATH_LIB_NAME;
use crate::{MValue, MilkVm, Result};

pub(crate) fn register(vm: &MilkVm) {
    let module = vm.new_table();

    module.raw_set_str("Pi", MValue::Number(std::f64::consts::PI));
    module.raw_set_str("Huge", MValue::Number(f64::INFINITY));

    vm.add_module_fn(&module, "Abs", |vm| unary(vm, f64::abs));
    vm.add_module_fn(&module, "Acos", |vm| unary(vm, f64::acos));
    vm.add_module_fn(&module, "Asin", |vm| unary(vm, f64::asin));
    vm.add_module_fn(&module, "Atan", |vm| unary(vm, f64::atan));
    vm.add_module_fn(&module, "Ceil", |vm| unary(vm, f64::ceil));
    vm.add_module_fn(&module, "Cos", |vm| unary(vm, f64::cos));
    vm.add_module_fn(&module, "Cosh", |vm| unary(vm, f64::cosh));
    vm.add_module_fn(&module, "Deg", |vm| unary(vm, f64::to_degrees));
    vm.add_module_fn(&module, "Exp", |vm| unary(vm, f64::exp));
    vm.add_module_fn(&module, "Floor", |vm| unary(vm, f64::floor));
    vm.add_module_fn(&module, "Ln", |vm| unary(vm, f64::ln));
    vm.add_module_fn(&module, "Rad", |vm| unary(vm, f64::to_radians));
    vm.add_module_fn(&module, "Sin", |vm| unary(vm, f64::sin));
    vm.add_module_fn(&module, "Sinh", |vm| unary(vm, f64::sinh));
    vm.add_module_fn(&module, "Sqrt", |vm| unary(vm, f64::sqrt));
    vm.add_module_fn(&module, "Tan", |vm| unary(vm, f64::tan));
    vm.add_module_fn(&module, "Tanh", |vm| unary(vm, f64::tanh));

    vm.add_module_fn(&module, "Fmod", math_fmod);
    vm.add_module_fn(&module, "Frexp", math_frexp);
    vm.add_module_fn(&module, "Ldexp", math_ldexp);
    vm.add_module_fn(&module, "Log", math_log);
    vm.add_module_fn(&module, "Max", math_max);
    vm.add_module_fn(&module, "Min", math_min);
    vm.add_module_fn(&module, "Mod", math_mod);
    vm.add_module_fn(&module, "Modf", math_modf);
    vm.add_module_fn(&module, "Pow", math_pow);

    vm.register_module(MATH_LIB_NAME, module);
}

fn unary(vm: &mut MilkVm, f: fn(f64) -> f64) -> Result<i32> {
    let n = vm.check_number(1)?;
    vm.push(MValue::Number(f(n)))?;
    Ok(1)
}

fn math_fmod(vm: &mut MilkVm) -> Result<i32> {
    let a = vm.check_number(1)?;
    let b = vm.check_number(2)?;
    vm.push(MValue::Number(a % b))?;
    Ok(1)
}

// Floored modulo, matching the % operator
fn math_mod(vm: &mut MilkVm) -> Result<i32> {
    let a = vm.check_number(1)?;
    let b = vm.check_number(2)?;
    vm.push(MValue::Number(a - (a / b).floor() * b))?;
    Ok(1)
}

fn math_frexp(vm: &mut MilkVm) -> Result<i32> {
    let n = vm.check_number(1)?;
    let (mantissa, exponent) = frexp(n);
    vm.push(MValue::Number(mantissa))?;
    vm.push(MValue::Number(exponent as f64))?;
    Ok(2)
}

fn math_ldexp(vm: &mut MilkVm) -> Result<i32> {
    let mantissa = vm.check_number(1)?;
    let exponent = vm.check_int(2)?;
    vm.push(MValue::Number(mantissa * 2f64.powi(exponent as i32)))?;
    Ok(1)
}

fn math_log(vm: &mut MilkVm) -> Result<i32> {
    let n = vm.check_number(1)?;
    let base = vm.opt_number(2, 10.0)?;
    let result = if base == 10.0 {
        n.log10()
    } else if base == 2.0 {
        n.log2()
    } else {
        n.log(base)
    };
    vm.push(MValue::Number(result))?;
    Ok(1)
}

fn math_max(vm: &mut MilkVm) -> Result<i32> {
    let mut result = vm.check_number(1)?;
    for i in 2..=vm.get_top() {
        result = result.max(vm.check_number(i)?);
    }
    vm.push(MValue::Number(result))?;
    Ok(1)
}

fn math_min(vm: &mut MilkVm) -> Result<i32> {
    let mut result = vm.check_number(1)?;
    for i in 2..=vm.get_top() {
        result = result.min(vm.check_number(i)?);
    }
    vm.push(MValue::Number(result))?;
    Ok(1)
}

fn math_modf(vm: &mut MilkVm) -> Result<i32> {
    let n = vm.check_number(1)?;
    vm.push(MValue::Number(n.trunc()))?;
    vm.push(MValue::Number(n.fract()))?;
    Ok(2)
}

fn math_pow(vm: &mut MilkVm) -> Result<i32> {
    let a = vm.check_number(1)?;
    let b = vm.check_number(2)?;
    vm.push(MValue::Number(a.powf(b)))?;
    Ok(1)
}

// The mantissa/exponent split: |mantissa| is in [0.5, 1) and
// mantissa * 2^exponent == n for finite non-zero n
fn frexp(n: f64) -> (f64, i32) {
    if n == 0.0 || !n.is_finite() {
        return (n, 0);
    }
    let mut mantissa = n;
    let mut exponent = 0;
    while mantissa.abs() >= 1.0 {
        mantissa /= 2.0;
        exponent += 1;
    }
    while mantissa.abs() < 0.5 {
        mantissa *= 2.0;
        exponent -= 1;
    }
    (mantissa, exponent)
}

#[cfg(test)]
mod tests {
    use super::frexp;

    #[test]
    fn frexp_splits() {
        for n in [1.0, 8.0, 0.1, -3.5, 1e300, 5e-324] {
            let (m, e) = frexp(n);
            assert!(m.abs() >= 0.5 && m.abs() < 1.0, "{n}: mantissa {m}");
            assert_eq!(m * 2f64.powi(e), n, "{n}");
        }
        assert_eq!(frexp(0.0), (0.0, 0));
    }
}
