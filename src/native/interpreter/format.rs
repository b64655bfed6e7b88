//! Format-spec mini-language shared by f-strings, `str.format` and `format()`.

use super::{
    error::{ErrorKind, Exception},
    value::{Value, format_float, key_error},
};
use crate::constants::{MAX_FORMAT_PRECISION, MAX_STRING_BYTES};

#[derive(Debug, Default, PartialEq)]
struct Spec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    alternate: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

fn parse_spec(spec: &str) -> Result<Spec, Exception> {
    let chars: Vec<char> = spec.chars().collect();
    let mut parsed = Spec::default();
    let mut i = 0;
    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');

    if chars.len() >= 2 && is_align(chars[1]) {
        parsed.fill = Some(chars[0]);
        parsed.align = Some(chars[1]);
        i = 2;
    } else if chars.first().is_some_and(|c| is_align(*c)) {
        parsed.align = Some(chars[0]);
        i = 1;
    }
    if let Some(c @ ('+' | '-' | ' ')) = chars.get(i).copied() {
        parsed.sign = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'#') {
        parsed.alternate = true;
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        if parsed.fill.is_none() {
            parsed.fill = Some('0');
        }
        if parsed.align.is_none() {
            parsed.align = Some('=');
        }
        i += 1;
    }
    let start = i;
    while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
        i += 1;
    }
    if i > start {
        let digits: String = chars[start..i].iter().collect();
        parsed.width = digits.parse().map_err(|_| too_many_digits())?;
        if parsed.width > MAX_STRING_BYTES {
            return Err(Exception::new(
                ErrorKind::MemoryError,
                format!("format width exceeds the sandbox limit of {} bytes", MAX_STRING_BYTES),
            ));
        }
    }
    if let Some(c @ (',' | '_')) = chars.get(i).copied() {
        parsed.grouping = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        let start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        if i == start {
            return Err(Exception::value_error("Format specifier missing precision"));
        }
        let digits: String = chars[start..i].iter().collect();
        let precision: usize = digits.parse().map_err(|_| too_many_digits())?;
        if precision > MAX_FORMAT_PRECISION {
            return Err(Exception::value_error("precision too big"));
        }
        parsed.precision = Some(precision);
    }
    if let Some(c) = chars.get(i) {
        parsed.kind = Some(*c);
        i += 1;
    }
    if i != chars.len() {
        return Err(invalid(spec));
    }
    Ok(parsed)
}

fn invalid(spec: &str) -> Exception {
    Exception::value_error(format!("Invalid format specifier '{}'", spec))
}

fn too_many_digits() -> Exception {
    Exception::value_error("Too many decimal digits in format string")
}

fn unknown_code(code: char, value: &Value) -> Exception {
    Exception::value_error(format!(
        "Unknown format code '{}' for object of type '{}'",
        code,
        value.type_name()
    ))
}

pub fn format_value(value: &Value, spec: &str) -> Result<String, Exception> {
    if spec.is_empty() {
        return Ok(value.to_str());
    }
    let parsed = parse_spec(spec)?;

    match value {
        Value::Str(s) => {
            if let Some(code) = parsed.kind.filter(|c| *c != 's') {
                return Err(unknown_code(code, value));
            }
            let mut text = s.to_string();
            if let Some(precision) = parsed.precision {
                text = text.chars().take(precision).collect();
            }
            Ok(pad(String::new(), text, &parsed, '<'))
        }
        Value::Int(_) | Value::Bool(_) | Value::Float(_) => format_number(value, &parsed),
        other => {
            if parsed.kind.is_some() || parsed.precision.is_some() || parsed.sign.is_some() {
                return Err(Exception::type_error(format!(
                    "unsupported format string passed to {}.__format__",
                    other.type_name()
                )));
            }
            Ok(pad(String::new(), other.to_str(), &parsed, '<'))
        }
    }
}

/// `str.format` replacement fields: `{}`, `{0}`, `{name}`, with `!r`/`!s` and a spec.
pub fn format_template(
    template: &str,
    args: &[Value],
    kwargs: &[(String, Value)],
) -> Result<String, Exception> {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut auto_index = 0usize;
    let mut numbering: Option<bool> = None;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                out.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                out.push('}');
                i += 2;
            }
            '}' => {
                return Err(Exception::value_error(
                    "Single '}' encountered in format string",
                ));
            }
            '{' => {
                let Some(len) = chars[i + 1..].iter().position(|c| *c == '}') else {
                    return Err(Exception::value_error(
                        "expected '}' before end of string",
                    ));
                };
                let field: String = chars[i + 1..i + 1 + len].iter().collect();
                i += len + 2;

                let (field, spec) = field.split_once(':').unwrap_or((field.as_str(), ""));
                let (name, conversion) = match field.split_once('!') {
                    Some((name, conversion)) => (name, Some(conversion)),
                    None => (field, None),
                };

                let value = if name.is_empty() {
                    if numbering == Some(false) {
                        return Err(Exception::value_error(
                            "cannot switch from manual field specification to automatic field numbering",
                        ));
                    }
                    numbering = Some(true);
                    auto_index += 1;
                    positional(args, auto_index - 1)?
                } else if let Ok(index) = name.parse::<usize>() {
                    if numbering == Some(true) {
                        return Err(Exception::value_error(
                            "cannot switch from automatic field numbering to manual field specification",
                        ));
                    }
                    numbering = Some(false);
                    positional(args, index)?
                } else {
                    kwargs
                        .iter()
                        .find(|(key, _)| key == name)
                        .map(|(_, value)| value.clone())
                        .ok_or_else(|| key_error(&Value::str(name)))?
                };

                let value = match conversion {
                    None | Some("s") => value,
                    Some("r") | Some("a") => Value::str(value.repr()),
                    Some(other) => {
                        return Err(Exception::value_error(format!(
                            "Unknown conversion specifier {}",
                            other
                        )));
                    }
                };
                out.push_str(&format_value(&value, spec)?);
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

fn positional(args: &[Value], index: usize) -> Result<Value, Exception> {
    args.get(index).cloned().ok_or_else(|| {
        Exception::new(
            ErrorKind::IndexError,
            format!(
                "Replacement index {} out of range for positional args tuple",
                index
            ),
        )
    })
}

/// printf-style `template % args`.
pub fn percent_format(template: &str, args: &Value) -> Result<String, Exception> {
    let values: Vec<Value> = match args {
        Value::Tuple(items) => items.to_vec(),
        other => vec![other.clone()],
    };
    let mut values = values.into_iter();
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        i += 1;
        if chars.get(i) == Some(&'%') {
            out.push('%');
            i += 1;
            continue;
        }

        let mut left = false;
        let mut sign = "";
        let mut zero = false;
        while let Some(flag) = chars.get(i).copied() {
            match flag {
                '-' => left = true,
                '+' => sign = "+",
                ' ' if sign.is_empty() => sign = " ",
                '0' => zero = true,
                '#' | ' ' => {}
                _ => break,
            }
            i += 1;
        }
        let mut width = String::new();
        while let Some(c) = chars.get(i).filter(|c| c.is_ascii_digit()) {
            width.push(*c);
            i += 1;
        }
        let mut precision = String::new();
        if chars.get(i) == Some(&'.') {
            precision.push('.');
            i += 1;
            while let Some(c) = chars.get(i).filter(|c| c.is_ascii_digit()) {
                precision.push(*c);
                i += 1;
            }
            if precision == "." {
                precision.push('0');
            }
        }
        let Some(code) = chars.get(i).copied() else {
            return Err(Exception::value_error("incomplete format"));
        };
        i += 1;

        let value = values
            .next()
            .ok_or_else(|| Exception::type_error("not enough arguments for format string"))?;
        let align = if left {
            "<"
        } else if zero && code != 's' && code != 'r' {
            "0="
        } else {
            ">"
        };

        let formatted = match code {
            's' | 'r' | 'a' => {
                let text = if code == 's' { value.to_str() } else { value.repr() };
                format_value(
                    &Value::str(text),
                    &format!("{}{}{}", if left { "<" } else { ">" }, width, precision),
                )?
            }
            'd' | 'i' | 'u' | 'x' | 'X' | 'o' | 'c' => {
                let number = match &value {
                    Value::Float(f) if code != 'c' => Value::Int(f.trunc() as i64),
                    Value::Int(_) | Value::Bool(_) => value.clone(),
                    other => {
                        return Err(Exception::type_error(format!(
                            "%{} format: a real number is required, not {}",
                            code,
                            other.type_name()
                        )));
                    }
                };
                let kind = if matches!(code, 'i' | 'u') { 'd' } else { code };
                format_value(&number, &format!("{}{}{}{}", align, sign, width, kind))?
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' => {
                if value.as_float().is_none() {
                    return Err(Exception::type_error(format!(
                        "must be real number, not {}",
                        value.type_name()
                    )));
                }
                format_value(
                    &value,
                    &format!("{}{}{}{}{}", align, sign, width, precision, code),
                )?
            }
            other => {
                return Err(Exception::value_error(format!(
                    "unsupported format character '{}' ({:#x}) at index {}",
                    other,
                    other as u32,
                    i - 1
                )));
            }
        };
        out.push_str(&formatted);
    }

    if values.next().is_some() {
        return Err(Exception::type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

fn format_number(value: &Value, spec: &Spec) -> Result<String, Exception> {
    let is_float = matches!(value, Value::Float(_));
    let kind = spec.kind.unwrap_or(if is_float { 'r' } else { 'd' });

    let (negative, body) = match kind {
        'd' | 'n' if !is_float => {
            let i = value.as_int().unwrap_or(0);
            (i < 0, group(&i.unsigned_abs().to_string(), spec.grouping))
        }
        'x' | 'X' | 'o' | 'b' if !is_float => {
            let i = value.as_int().unwrap_or(0);
            let magnitude = i.unsigned_abs();
            let (digits, prefix) = match kind {
                'x' => (format!("{:x}", magnitude), "0x"),
                'X' => (format!("{:X}", magnitude), "0X"),
                'o' => (format!("{:o}", magnitude), "0o"),
                _ => (format!("{:b}", magnitude), "0b"),
            };
            let body = if spec.alternate {
                format!("{}{}", prefix, digits)
            } else {
                digits
            };
            (i < 0, body)
        }
        'c' if !is_float => {
            let i = value.as_int().unwrap_or(0);
            let c = u32::try_from(i)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| {
                    Exception::new(ErrorKind::OverflowError, "%c arg not in range(0x110000)")
                })?;
            return Ok(pad(String::new(), c.to_string(), spec, '<'));
        }
        'f' | 'F' | 'e' | 'E' | 'g' | 'G' | '%' | 'r' => {
            let f = value.as_float().unwrap_or(0.0);
            let magnitude = f.abs();
            let body = match kind {
                'f' | 'F' => fixed(magnitude, spec.precision.unwrap_or(6), spec.grouping),
                'e' | 'E' => {
                    let text = scientific(magnitude, spec.precision.unwrap_or(6));
                    if kind == 'E' { text.to_uppercase() } else { text }
                }
                'g' | 'G' => {
                    let text = general(magnitude, spec.precision.unwrap_or(6), spec.alternate);
                    if kind == 'G' { text.to_uppercase() } else { text }
                }
                '%' => format!(
                    "{}%",
                    fixed(magnitude * 100.0, spec.precision.unwrap_or(6), spec.grouping)
                ),
                _ => match spec.precision {
                    Some(precision) => general(magnitude, precision, spec.alternate),
                    None => group_float(&format_float(magnitude), spec.grouping),
                },
            };
            (f.is_sign_negative() && !f.is_nan(), body)
        }
        other => return Err(unknown_code(other, value)),
    };

    let sign = if negative {
        "-"
    } else {
        match spec.sign {
            Some('+') => "+",
            Some(' ') => " ",
            _ => "",
        }
    };
    Ok(pad(sign.to_string(), body, spec, '>'))
}

fn fixed(f: f64, precision: usize, grouping: Option<char>) -> String {
    if !f.is_finite() {
        return format_float(f);
    }
    group_float(&format!("{:.*}", precision, f), grouping)
}

fn scientific(f: f64, precision: usize) -> String {
    if !f.is_finite() {
        return format_float(f);
    }
    let text = format!("{:.*e}", precision, f);
    let (mantissa, exponent) = text.split_once('e').unwrap_or((&text, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    format!(
        "{}e{}{:02}",
        mantissa,
        if exponent < 0 { '-' } else { '+' },
        exponent.abs()
    )
}

fn general(f: f64, precision: usize, keep_zeros: bool) -> String {
    if !f.is_finite() {
        return format_float(f);
    }
    let precision = precision.max(1);
    if f == 0.0 {
        return if keep_zeros {
            format!("{:.*}", precision - 1, 0.0)
        } else {
            "0".to_string()
        };
    }
    let sci = format!("{:.*e}", precision - 1, f);
    let exponent: i32 = sci
        .split_once('e')
        .and_then(|(_, e)| e.parse().ok())
        .unwrap_or(0);
    let text = if exponent >= -4 && exponent < precision as i32 {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        format!("{:.*}", decimals, f)
    } else {
        scientific(f, precision - 1)
    };
    if keep_zeros {
        return text;
    }
    strip_zeros(&text)
}

fn strip_zeros(text: &str) -> String {
    let (number, exponent) = match text.find('e') {
        Some(i) => text.split_at(i),
        None => (text, ""),
    };
    let number = if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    };
    format!("{}{}", number, exponent)
}

fn group(digits: &str, separator: Option<char>) -> String {
    let Some(separator) = separator else {
        return digits.to_string();
    };
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(separator);
        }
        out.push(c);
    }
    out
}

fn group_float(text: &str, separator: Option<char>) -> String {
    match text.split_once('.') {
        Some((int_part, rest)) if int_part.chars().all(|c| c.is_ascii_digit()) => {
            format!("{}.{}", group(int_part, separator), rest)
        }
        _ if text.chars().all(|c| c.is_ascii_digit()) => group(text, separator),
        _ => text.to_string(),
    }
}

fn pad(sign: String, body: String, spec: &Spec, default_align: char) -> String {
    let len = sign.chars().count() + body.chars().count();
    if spec.width <= len {
        return sign + &body;
    }
    let fill = spec.fill.unwrap_or(' ');
    let padding = spec.width - len;
    let repeat = |n: usize| std::iter::repeat_n(fill, n).collect::<String>();
    match spec.align.unwrap_or(default_align) {
        '<' => format!("{}{}{}", sign, body, repeat(padding)),
        '^' => format!(
            "{}{}{}{}",
            repeat(padding / 2),
            sign,
            body,
            repeat(padding - padding / 2)
        ),
        '=' => format!("{}{}{}", sign, repeat(padding), body),
        _ => format!("{}{}{}", repeat(padding), sign, body),
    }
}
