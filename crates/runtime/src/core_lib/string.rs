//! The string library, which doubles as the string type's metatable index
//!
//! Byte/Sub/Len/Reverse index by runes; the pattern entry points (Find, Match,
//! GSub, GMatch) report byte offsets, which is what the matcher operates on.

use super::STRING_LIB_NAME;
use crate::{
    number_to_string,
    pattern::{find_all, CaptureSpan, MatchData},
    MString, MTable, MValue, MilkUserData, MilkVm, Result,
};
use std::cell::Cell;

pub(crate) fn register(vm: &MilkVm) {
    let module = vm.new_table();

    vm.add_module_fn(&module, "Byte", str_byte);
    vm.add_module_fn(&module, "Char", str_char);
    vm.add_module_fn(&module, "Find", str_find);
    vm.add_module_fn(&module, "Format", str_format);
    vm.add_module_fn(&module, "GSub", str_gsub);
    vm.add_module_fn(&module, "Len", str_len);
    vm.add_module_fn(&module, "Lower", str_lower);
    vm.add_module_fn(&module, "Match", str_match);
    vm.add_module_fn(&module, "Rep", str_rep);
    vm.add_module_fn(&module, "Reverse", str_reverse);
    vm.add_module_fn(&module, "Sub", str_sub);
    vm.add_module_fn(&module, "Upper", str_upper);

    // GMatch closes over its iterator function, and GFind is an alias
    let iter = vm.new_function(Some("GMatchIter"), gmatch_iter);
    let gmatch = vm.new_closure(Some("GMatch"), str_gmatch, vec![MValue::Function(iter)]);
    module.raw_set_str("GMatch", MValue::Function(gmatch.clone()));
    module.raw_set_str("GFind", MValue::Function(gmatch));

    // the module is the string type's metatable, indexing into itself
    module.raw_set_str("__index", MValue::Table(module.clone()));
    vm.set_type_metatable("string", Some(module.clone()));

    vm.register_module(STRING_LIB_NAME, module);
}

fn runes(s: &str) -> Vec<char> {
    s.chars().collect()
}

// Converts a 1-based (possibly negative) script index to a byte offset
fn byte_offset(len: usize, index: i64, start: bool) -> usize {
    let mut i = index;
    if start && i != 0 {
        i -= 1;
    }
    if i < 0 {
        i += len as i64 + 1;
    }
    let i = i.max(0) as usize;
    if !start && i > len {
        len
    } else {
        i.min(len)
    }
}

// Byte-offset substring; pattern spans can fall inside multi-byte runes
fn substring(s: &str, start: usize, end: usize) -> String {
    String::from_utf8_lossy(&s.as_bytes()[start..end]).into_owned()
}

fn capture_value(s: &str, span: CaptureSpan) -> MValue {
    match span {
        CaptureSpan::Span { start, end } => MValue::Str(substring(s, start, end).into()),
        CaptureSpan::Position(p) => MValue::Number(p as f64),
    }
}

fn str_byte(vm: &mut MilkVm) -> Result<i32> {
    let s = vm.check_string(1)?;
    let runes = runes(&s);
    let length = runes.len() as i64;

    let mut start = vm.opt_int(2, 1)?;
    let mut end = vm.opt_int(3, start)?;
    if start < 0 {
        start += length + 1;
    }
    if end < 0 {
        end += length + 1;
    }
    if length == 0 {
        return Ok(0);
    }

    let start = (start.clamp(1, length) - 1) as usize;
    let end = (end.min(length).max(start as i64 + 1)) as usize;

    if vm.get_top() == 2 {
        vm.push(MValue::Number(runes[start] as u32 as f64))?;
        return Ok(1);
    }

    for rune in &runes[start..end] {
        vm.push(MValue::Number(*rune as u32 as f64))?;
    }
    Ok((end - start) as i32)
}

fn str_char(vm: &mut MilkVm) -> Result<i32> {
    let top = vm.get_top();
    let mut result = String::with_capacity(top);
    for i in 1..=top {
        let code = vm.check_int(i)?;
        result.push(char::from_u32(code as u32).unwrap_or(char::REPLACEMENT_CHARACTER));
    }
    vm.push(MValue::Str(result.into()))?;
    Ok(1)
}

fn str_find(vm: &mut MilkVm) -> Result<i32> {
    let s = vm.check_string(1)?;
    let pattern = vm.check_string(2)?;
    if pattern.is_empty() {
        vm.push(MValue::Number(1.0))?;
        vm.push(MValue::Number(0.0))?;
        return Ok(2);
    }

    let init = byte_offset(s.len(), vm.opt_int(3, 1)?, true);
    let plain = vm.get_top() == 4 && vm.get(4).is_truthy();

    if plain {
        let haystack = &s.as_bytes()[init..];
        let needle = pattern.as_bytes();
        let found = haystack
            .windows(needle.len())
            .position(|window| window == needle);
        match found {
            Some(pos) => {
                vm.push(MValue::Number((init + pos + 1) as f64))?;
                vm.push(MValue::Number((init + pos + pattern.len()) as f64))?;
                return Ok(2);
            }
            None => {
                vm.push(MValue::Nil)?;
                return Ok(1);
            }
        }
    }

    let matches = find_all(pattern.as_bytes(), s.as_bytes(), init, 1)?;
    match matches.first() {
        Some(m) => {
            vm.push(MValue::Number((m.start + 1) as f64))?;
            vm.push(MValue::Number(m.end as f64))?;
            for i in 0..m.capture_count() {
                vm.push(capture_value(&s, m.capture(i).expect("missing capture")))?;
            }
            Ok(2 + m.capture_count() as i32)
        }
        None => {
            vm.push(MValue::Nil)?;
            Ok(1)
        }
    }
}

fn str_match(vm: &mut MilkVm) -> Result<i32> {
    let s = vm.check_string(1)?;
    let pattern = vm.check_string(2)?;
    let init = byte_offset(s.len(), vm.opt_int(3, 1)?, true);

    let matches = find_all(pattern.as_bytes(), s.as_bytes(), init, 1)?;
    match matches.first() {
        Some(m) => {
            if m.capture_count() == 0 {
                vm.push(MValue::Str(substring(&s, m.start, m.end).into()))?;
                Ok(1)
            } else {
                for i in 0..m.capture_count() {
                    vm.push(capture_value(&s, m.capture(i).expect("missing capture")))?;
                }
                Ok(m.capture_count() as i32)
            }
        }
        None => {
            vm.push(MValue::Nil)?;
            Ok(1)
        }
    }
}

// Expands a replacement template, resolving %0..%9 back-references
fn expand_replacement(
    vm: &MilkVm,
    template: &str,
    s: &str,
    m: &MatchData,
) -> Result<String> {
    let bytes = template.as_bytes();
    let mut out = Vec::with_capacity(template.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b != b'%' {
            out.push(b);
            i += 1;
            continue;
        }
        i += 1;
        match bytes.get(i) {
            Some(d) if d.is_ascii_digit() => {
                let index = (d - b'0') as usize;
                let value = if index == 0 || (index == 1 && m.capture_count() == 0) {
                    MValue::Str(substring(s, m.start, m.end).into())
                } else {
                    match m.capture(index - 1) {
                        Some(span) => capture_value(s, span),
                        None => return vm.raise("invalid capture index"),
                    }
                };
                out.extend_from_slice(value.to_string().as_bytes());
                i += 1;
            }
            Some(other) => {
                out.push(b'%');
                out.push(*other);
                i += 1;
            }
            None => out.push(b'%'),
        }
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn str_gsub(vm: &mut MilkVm) -> Result<i32> {
    let s = vm.check_string(1)?;
    let pattern = vm.check_string(2)?;
    let repl = vm.check_any(3)?;
    match repl {
        MValue::Str(_) | MValue::Number(_) | MValue::Table(_) | MValue::Function(_) => {}
        other => {
            return vm.arg_error(3, format!("string/table/function expected, got {}", other.type_name()))
        }
    }
    let limit = vm.opt_int(4, -1)?;

    let matches = find_all(pattern.as_bytes(), s.as_bytes(), 0, limit)?;
    if matches.is_empty() {
        vm.push(MValue::Str(s))?;
        vm.push(MValue::Number(0.0))?;
        return Ok(2);
    }

    let mut out = String::with_capacity(s.len());
    let mut last_end = 0;
    for m in &matches {
        out.push_str(&substring(&s, last_end, m.start));
        let whole = substring(&s, m.start, m.end);

        let replacement = match &repl {
            MValue::Str(template) => Some(expand_replacement(vm, template, &s, m)?),
            MValue::Number(n) => {
                Some(expand_replacement(vm, &number_to_string(*n), &s, m)?)
            }
            MValue::Table(table) => {
                let key = m.captures_or_whole()[0];
                let value = vm.get_table(&MValue::Table(table.clone()), &capture_value(&s, key))?;
                replacement_value(vm, value, &whole)?
            }
            MValue::Function(f) => {
                let args: Vec<MValue> = m
                    .captures_or_whole()
                    .iter()
                    .map(|span| capture_value(&s, *span))
                    .collect();
                let value = vm.call_value(MValue::Function(f.clone()), &args)?;
                replacement_value(vm, value, &whole)?
            }
            _ => unreachable!(),
        };

        match replacement {
            Some(text) => out.push_str(&text),
            None => out.push_str(&whole),
        }
        last_end = m.end;
    }
    out.push_str(&substring(&s, last_end, s.len()));

    vm.push(MValue::Str(out.into()))?;
    vm.push(MValue::Number(matches.len() as f64))?;
    Ok(2)
}

// A falsy replacement keeps the matched text; strings and numbers substitute
fn replacement_value(vm: &MilkVm, value: MValue, _whole: &str) -> Result<Option<String>> {
    match value {
        MValue::Nil | MValue::Bool(false) => Ok(None),
        MValue::Str(s) => Ok(Some(s.to_string())),
        MValue::Number(n) => Ok(Some(number_to_string(n))),
        other => vm.raise(format!("invalid replacement value (a {} value)", other.type_name())),
    }
}

struct GmatchState {
    subject: MString,
    matches: Vec<MatchData>,
    position: Cell<usize>,
}

impl MilkUserData for GmatchState {}

fn str_gmatch(vm: &mut MilkVm) -> Result<i32> {
    let s = vm.check_string(1)?;
    let pattern = vm.check_string(2)?;
    let matches = match find_all(pattern.as_bytes(), s.as_bytes(), 0, -1) {
        Ok(matches) => matches,
        Err(error) => {
            vm.push(MValue::Nil)?;
            vm.push(MValue::Nil)?;
            vm.push(MValue::Str(
                format!("Failed to compile pattern: {error}").into(),
            ))?;
            return Ok(3);
        }
    };

    let state = vm.new_userdata(GmatchState {
        subject: s,
        matches,
        position: Cell::new(0),
    });
    vm.push(vm.upvalue(1))?;
    vm.push(MValue::UserData(state))?;
    Ok(2)
}

fn gmatch_iter(vm: &mut MilkVm) -> Result<i32> {
    let ud = vm.check_userdata(1)?;
    let (subject, next_match) = {
        let data = ud.data();
        let state = match data.downcast_ref::<GmatchState>() {
            Some(state) => state,
            None => return vm.arg_error(1, "gmatch iterator state expected"),
        };
        let index = state.position.get();
        state.position.set(index + 1);
        (state.subject.clone(), state.matches.get(index).cloned())
    };

    let Some(m) = next_match else {
        return Ok(0);
    };

    if m.capture_count() == 0 {
        vm.push(MValue::Str(substring(&subject, m.start, m.end).into()))?;
        Ok(1)
    } else {
        for i in 0..m.capture_count() {
            vm.push(capture_value(&subject, m.capture(i).expect("missing capture")))?;
        }
        Ok(m.capture_count() as i32)
    }
}

fn str_len(vm: &mut MilkVm) -> Result<i32> {
    let s = vm.check_string(1)?;
    vm.push(MValue::Number(s.chars().count() as f64))?;
    Ok(1)
}

fn str_lower(vm: &mut MilkVm) -> Result<i32> {
    let s = vm.check_string(1)?;
    vm.push(MValue::Str(s.to_lowercase().into()))?;
    Ok(1)
}

fn str_upper(vm: &mut MilkVm) -> Result<i32> {
    let s = vm.check_string(1)?;
    vm.push(MValue::Str(s.to_uppercase().into()))?;
    Ok(1)
}

fn str_rep(vm: &mut MilkVm) -> Result<i32> {
    let s = vm.check_string(1)?;
    let n = vm.opt_int(2, 1)?;
    let result = if n < 0 {
        MString::from("")
    } else {
        MString::from(s.repeat(n as usize))
    };
    vm.push(MValue::Str(result))?;
    Ok(1)
}

fn str_reverse(vm: &mut MilkVm) -> Result<i32> {
    let s = vm.check_string(1)?;
    let reversed: String = s.chars().rev().collect();
    vm.push(MValue::Str(reversed.into()))?;
    Ok(1)
}

fn str_sub(vm: &mut MilkVm) -> Result<i32> {
    let s = vm.check_string(1)?;
    let runes = runes(&s);
    let length = runes.len() as i64;

    let mut start = vm.check_int(2)?;
    let mut end = vm.opt_int(3, -1)?;

    if start < 0 {
        start += length + 1;
    }
    if start < 1 {
        start = 1;
    }
    let start = (start - 1) as usize;

    if end < 0 {
        end += length + 1;
    }
    let end = end.min(length).max(0) as usize;

    if start >= runes.len() || end <= start {
        vm.push(MValue::Str("".into()))?;
    } else {
        let result: String = runes[start..end].iter().collect();
        vm.push(MValue::Str(result.into()))?;
    }
    Ok(1)
}

// ----------------------------------------------------------------------------
// Format

fn str_format(vm: &mut MilkVm) -> Result<i32> {
    let fmt = vm.check_string(1)?;
    let bytes = fmt.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut arg = 2;

    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        i += 1;
        if bytes.get(i) == Some(&b'%') {
            out.push(b'%');
            i += 1;
            continue;
        }

        let mut left = false;
        let mut zero = false;
        let mut plus = false;
        let mut space = false;
        let mut alt = false;
        while let Some(&flag) = bytes.get(i) {
            match flag {
                b'-' => left = true,
                b'0' => zero = true,
                b'+' => plus = true,
                b' ' => space = true,
                b'#' => alt = true,
                _ => break,
            }
            i += 1;
        }

        let mut width = 0usize;
        while let Some(d) = bytes.get(i).filter(|b| b.is_ascii_digit()) {
            width = width * 10 + (d - b'0') as usize;
            i += 1;
        }

        let mut precision = None;
        if bytes.get(i) == Some(&b'.') {
            i += 1;
            let mut p = 0usize;
            while let Some(d) = bytes.get(i).filter(|b| b.is_ascii_digit()) {
                p = p * 10 + (d - b'0') as usize;
                i += 1;
            }
            precision = Some(p);
        }

        let Some(&verb) = bytes.get(i) else {
            return vm.raise("invalid format string to 'Format'");
        };
        i += 1;

        let piece = match verb {
            b'd' | b'i' | b'u' => {
                let n = vm.check_int(arg)?;
                arg += 1;
                with_sign(n >= 0, plus, space, n.to_string())
            }
            b'x' => {
                let n = vm.check_int(arg)?;
                arg += 1;
                let digits = format!("{:x}", n);
                if alt {
                    format!("0x{digits}")
                } else {
                    digits
                }
            }
            b'X' => {
                let n = vm.check_int(arg)?;
                arg += 1;
                let digits = format!("{:X}", n);
                if alt {
                    format!("0X{digits}")
                } else {
                    digits
                }
            }
            b'o' => {
                let n = vm.check_int(arg)?;
                arg += 1;
                format!("{:o}", n)
            }
            b'c' => {
                let n = vm.check_int(arg)?;
                arg += 1;
                char::from_u32(n as u32)
                    .unwrap_or(char::REPLACEMENT_CHARACTER)
                    .to_string()
            }
            b'f' | b'F' => {
                let n = vm.check_number(arg)?;
                arg += 1;
                with_sign(
                    n >= 0.0,
                    plus,
                    space,
                    format!("{:.*}", precision.unwrap_or(6), n),
                )
            }
            b'e' | b'E' => {
                let n = vm.check_number(arg)?;
                arg += 1;
                let formatted = format!("{:.*e}", precision.unwrap_or(6), n);
                let formatted = if verb == b'E' {
                    formatted.to_ascii_uppercase()
                } else {
                    formatted
                };
                with_sign(n >= 0.0, plus, space, formatted)
            }
            b'g' | b'G' => {
                let n = vm.check_number(arg)?;
                arg += 1;
                let formatted = format_g(n, precision.unwrap_or(6).max(1));
                let formatted = if verb == b'G' {
                    formatted.to_ascii_uppercase()
                } else {
                    formatted
                };
                with_sign(n >= 0.0, plus, space, formatted)
            }
            b's' => {
                let value = vm.check_any(arg)?;
                arg += 1;
                let mut text = vm.to_string_meta(&value)?.to_string();
                if let Some(p) = precision {
                    if text.len() > p {
                        text.truncate(p);
                    }
                }
                text
            }
            b'q' => {
                let s = vm.check_string(arg)?;
                arg += 1;
                quote_string(&s)
            }
            other => {
                return vm.raise(format!("invalid option '%{}' to 'Format'", other as char))
            }
        };

        out.extend_from_slice(pad(piece, width, left, zero).as_bytes());
    }

    vm.push(MValue::Str(
        String::from_utf8_lossy(&out).into_owned().into(),
    ))?;
    Ok(1)
}

fn with_sign(non_negative: bool, plus: bool, space: bool, digits: String) -> String {
    if non_negative && plus {
        format!("+{digits}")
    } else if non_negative && space {
        format!(" {digits}")
    } else {
        digits
    }
}

fn pad(piece: String, width: usize, left: bool, zero: bool) -> String {
    if piece.len() >= width {
        return piece;
    }
    let fill = width - piece.len();
    if left {
        format!("{piece}{}", " ".repeat(fill))
    } else if zero {
        // zero padding goes between the sign and the digits
        match piece.strip_prefix(['-', '+']) {
            Some(rest) => format!("{}{}{rest}", &piece[..1], "0".repeat(fill)),
            None => format!("{}{piece}", "0".repeat(fill)),
        }
    } else {
        format!("{}{piece}", " ".repeat(fill))
    }
}

fn format_g(n: f64, precision: usize) -> String {
    if n == 0.0 {
        return "0".to_string();
    }
    if !n.is_finite() {
        return number_to_string(n);
    }

    let exponent = n.abs().log10().floor() as i32;
    if exponent < -4 || exponent >= precision as i32 {
        let mantissa_digits = precision.saturating_sub(1);
        trim_zeros(&format!("{:.*e}", mantissa_digits, n))
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        trim_zeros(&format!("{:.*}", decimals, n))
    }
}

// Strips trailing fractional zeros, handling the exponent suffix
fn trim_zeros(s: &str) -> String {
    let (mantissa, exponent) = match s.find(['e', 'E']) {
        Some(pos) => (&s[..pos], &s[pos..]),
        None => (s, ""),
    };
    let trimmed = if mantissa.contains('.') {
        mantissa.trim_end_matches('0').trim_end_matches('.')
    } else {
        mantissa
    };
    format!("{trimmed}{exponent}")
}

fn quote_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push('"');
    for c in s.chars() {
        match c {
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\0' => result.push_str("\\0"),
            other => result.push(other),
        }
    }
    result.push('"');
    result
}
