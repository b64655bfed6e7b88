use std::{cell::RefCell, num::IntErrorKind, rc::Rc};

use super::{
    ast::BinOp,
    error::{ErrorKind, Exception},
    eval::{Interpreter, float_divmod, floor_div, floor_mod},
    format::format_value,
    value::{Dict, Value, is_type_builtin, less_than, range_len},
};

const FUNCTIONS: &[&str] = &[
    "print", "input", "len", "range", "str", "int", "float", "bool", "list", "tuple", "dict",
    "set", "abs", "min", "max", "sum", "round", "sorted", "reversed", "enumerate", "zip", "type",
    "isinstance", "repr", "chr", "ord", "any", "all", "divmod", "pow", "map", "filter", "format",
    "hex", "bin", "oct",
];

/// Names that exist in Python but would reach outside the sandbox.
const FORBIDDEN: &[&str] = &[
    "open",
    "eval",
    "exec",
    "compile",
    "__import__",
    "globals",
    "locals",
    "breakpoint",
    "exit",
    "quit",
];

const MATH_FUNCTIONS: &[&str] = &[
    "math.sqrt",
    "math.floor",
    "math.ceil",
    "math.trunc",
    "math.fabs",
    "math.factorial",
    "math.gcd",
    "math.pow",
    "math.exp",
    "math.log",
    "math.log10",
    "math.log2",
    "math.sin",
    "math.cos",
    "math.tan",
    "math.asin",
    "math.acos",
    "math.atan",
    "math.atan2",
    "math.hypot",
    "math.degrees",
    "math.radians",
    "math.isqrt",
    "math.isfinite",
    "math.isinf",
    "math.isnan",
];

const MATH_CONSTANTS: &[(&str, f64)] = &[
    ("pi", std::f64::consts::PI),
    ("e", std::f64::consts::E),
    ("tau", std::f64::consts::TAU),
    ("inf", f64::INFINITY),
    ("nan", f64::NAN),
];

pub fn lookup(name: &str) -> Option<Value> {
    FUNCTIONS
        .iter()
        .chain(FORBIDDEN)
        .find(|builtin| **builtin == name)
        .map(|builtin| Value::Builtin(*builtin))
        .or_else(|| ErrorKind::from_name(name).map(Value::ExceptionType))
}

pub fn math_attr(name: &str) -> Option<Value> {
    if let Some((_, value)) = MATH_CONSTANTS.iter().find(|(constant, _)| *constant == name) {
        return Some(Value::Float(*value));
    }
    MATH_FUNCTIONS
        .iter()
        .find(|function| function.strip_prefix("math.") == Some(name))
        .map(|function| Value::Builtin(*function))
}

/// Everything `from math import *` binds.
pub fn math_exports() -> impl Iterator<Item = (&'static str, Value)> {
    MATH_CONSTANTS
        .iter()
        .map(|(name, value)| (*name, Value::Float(*value)))
        .chain(MATH_FUNCTIONS.iter().map(|function| {
            (
                function.strip_prefix("math.").unwrap_or(*function),
                Value::Builtin(*function),
            )
        }))
}

/// Positional and keyword arguments of a native call.
pub(super) struct Args {
    name: &'static str,
    positional: Vec<Value>,
    kwargs: Vec<(String, Value)>,
}

impl Args {
    pub(super) fn new(name: &'static str, positional: Vec<Value>, kwargs: Vec<(String, Value)>) -> Self {
        Self {
            name,
            positional,
            kwargs,
        }
    }

    pub(super) fn len(&self) -> usize {
        self.positional.len()
    }

    pub(super) fn count(&self, min: usize, max: usize) -> Result<(), Exception> {
        let given = self.positional.len();
        if given < min {
            return Err(Exception::type_error(if min == max {
                format!(
                    "{}() takes exactly {} argument{} ({} given)",
                    self.name,
                    min,
                    if min == 1 { "" } else { "s" },
                    given
                )
            } else {
                format!(
                    "{}() expected at least {} argument{}, got {}",
                    self.name,
                    min,
                    if min == 1 { "" } else { "s" },
                    given
                )
            }));
        }
        if given > max {
            return Err(Exception::type_error(format!(
                "{}() expected at most {} argument{}, got {}",
                self.name,
                max,
                if max == 1 { "" } else { "s" },
                given
            )));
        }
        Ok(())
    }

    pub(super) fn get(&self, at: usize) -> Option<&Value> {
        self.positional.get(at)
    }

    pub(super) fn arg(&self, at: usize) -> Value {
        self.positional.get(at).cloned().unwrap_or(Value::None)
    }

    pub(super) fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub(super) fn kwarg(&mut self, key: &str) -> Option<Value> {
        let at = self.kwargs.iter().position(|(name, _)| name == key)?;
        Some(self.kwargs.remove(at).1)
    }

    pub(super) fn take_kwargs(&mut self) -> Vec<(String, Value)> {
        std::mem::take(&mut self.kwargs)
    }

    /// Rejects keyword arguments nobody consumed.
    pub(super) fn finish(&self) -> Result<(), Exception> {
        match self.kwargs.first() {
            Some((key, _)) => Err(Exception::type_error(format!(
                "'{}' is an invalid keyword argument for {}()",
                key, self.name
            ))),
            None => Ok(()),
        }
    }
}

pub fn call(
    interp: &mut Interpreter,
    name: &'static str,
    positional: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, Exception> {
    let mut args = Args::new(name, positional, kwargs);

    if FORBIDDEN.contains(&name) {
        return Err(Exception::new(
            ErrorKind::PermissionError,
            format!("'{}' is not allowed in the sandbox", name),
        ));
    }
    if let Some(function) = name.strip_prefix("math.") {
        args.finish()?;
        return math(function, &args);
    }

    match name {
        "print" => {
            let sep = text_kwarg(&mut args, "sep", " ")?;
            let end = text_kwarg(&mut args, "end", "\n")?;
            args.kwarg("flush");
            args.finish()?;
            let mut line = args
                .positional()
                .iter()
                .map(Value::to_str)
                .collect::<Vec<_>>()
                .join(&sep);
            line.push_str(&end);
            interp.write_stdout(&line)?;
            Ok(Value::None)
        }
        "input" => {
            args.finish()?;
            args.count(0, 1)?;
            if let Some(prompt) = args.get(0) {
                interp.write_stdout(&prompt.to_str())?;
            }
            Ok(Value::str(interp.read_line()?))
        }
        "len" => {
            args.finish()?;
            args.count(1, 1)?;
            length(&args.arg(0)).map(Value::Int)
        }
        "range" => {
            args.finish()?;
            args.count(1, 3)?;
            let bounds = args
                .positional()
                .iter()
                .map(|value| integer(value))
                .collect::<Result<Vec<_>, _>>()?;
            let (start, stop, step) = match bounds.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => return Err(Exception::type_error("range expected at most 3 arguments")),
            };
            if step == 0 {
                return Err(Exception::value_error("range() arg 3 must not be zero"));
            }
            Ok(Value::Range { start, stop, step })
        }
        "str" => {
            args.finish()?;
            args.count(0, 1)?;
            Ok(Value::str(args.get(0).map(Value::to_str).unwrap_or_default()))
        }
        "repr" => {
            args.finish()?;
            args.count(1, 1)?;
            Ok(Value::str(args.arg(0).repr()))
        }
        "int" => {
            let base = args.kwarg("base");
            args.finish()?;
            args.count(0, 2)?;
            let base = base.or_else(|| args.get(1).cloned());
            to_int(args.get(0), base.as_ref())
        }
        "float" => {
            args.finish()?;
            args.count(0, 1)?;
            to_float(args.get(0))
        }
        "bool" => {
            args.finish()?;
            args.count(0, 1)?;
            Ok(Value::Bool(args.get(0).is_some_and(Value::truthy)))
        }
        "list" => {
            args.finish()?;
            args.count(0, 1)?;
            match args.get(0) {
                Some(value) => Ok(Value::list(interp.collect(value)?)),
                None => Ok(Value::list(Vec::new())),
            }
        }
        "tuple" => {
            args.finish()?;
            args.count(0, 1)?;
            match args.get(0) {
                Some(value) => Ok(Value::tuple(interp.collect(value)?)),
                None => Ok(Value::tuple(Vec::new())),
            }
        }
        "set" => {
            args.finish()?;
            args.count(0, 1)?;
            let items = match args.get(0) {
                Some(value) => interp.collect(value)?,
                None => Vec::new(),
            };
            interp.build_set(items)
        }
        "dict" => {
            args.count(0, 1)?;
            let mut dict = Dict::default();
            if let Some(source) = args.get(0) {
                update_dict(interp, &mut dict, source)?;
            }
            for (key, value) in args.take_kwargs() {
                dict.insert(Value::str(key), value);
            }
            interp.check_len(dict.len())?;
            Ok(Value::Dict(Rc::new(RefCell::new(dict))))
        }
        "abs" => {
            args.finish()?;
            args.count(1, 1)?;
            match args.arg(0) {
                Value::Float(f) => Ok(Value::Float(f.abs())),
                value => value
                    .as_int()
                    .ok_or_else(|| bad_operand("abs()", &value))?
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| {
                        Exception::new(
                            ErrorKind::OverflowError,
                            "integer result does not fit in 64 bits",
                        )
                    }),
            }
        }
        "min" | "max" => extremum(interp, args, name == "max"),
        "sum" => {
            let start = args.kwarg("start");
            args.finish()?;
            args.count(1, 2)?;
            let mut total = start.or_else(|| args.get(1).cloned()).unwrap_or(Value::Int(0));
            if matches!(total, Value::Str(_)) {
                return Err(Exception::type_error(
                    "sum() can't sum strings [use ''.join(seq) instead]",
                ));
            }
            for item in interp.iterate(&args.arg(0))? {
                interp.tick()?;
                total = interp.binop(BinOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        "round" => {
            let ndigits = args.kwarg("ndigits");
            args.finish()?;
            args.count(1, 2)?;
            let ndigits = ndigits.or_else(|| args.get(1).cloned()).unwrap_or(Value::None);
            round(&args.arg(0), &ndigits)
        }
        "sorted" => {
            let key = args.kwarg("key").unwrap_or(Value::None);
            let reverse = args.kwarg("reverse").is_some_and(|value| value.truthy());
            args.finish()?;
            args.count(1, 1)?;
            let items = interp.collect(&args.arg(0))?;
            Ok(Value::list(sort_values(interp, items, &key, reverse)?))
        }
        "reversed" => {
            args.finish()?;
            args.count(1, 1)?;
            let sequence = args.arg(0);
            if matches!(sequence, Value::Dict(_) | Value::Set(_)) {
                return Err(Exception::type_error(format!(
                    "'{}' object is not reversible",
                    sequence.type_name()
                )));
            }
            let mut items = interp.collect(&sequence)?;
            items.reverse();
            Ok(Value::list(items))
        }
        "enumerate" => {
            let start = args.kwarg("start");
            args.finish()?;
            args.count(1, 2)?;
            let start = match start.or_else(|| args.get(1).cloned()) {
                Some(value) => integer(&value)?,
                None => 0,
            };
            let items = interp.collect(&args.arg(0))?;
            Ok(Value::list(
                items
                    .into_iter()
                    .zip(start..)
                    .map(|(item, i)| Value::tuple(vec![Value::Int(i), item]))
                    .collect(),
            ))
        }
        "zip" => {
            args.finish()?;
            let columns = args
                .positional()
                .iter()
                .map(|value| interp.collect(value))
                .collect::<Result<Vec<_>, _>>()?;
            let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
            Ok(Value::list(
                (0..rows)
                    .map(|row| Value::tuple(columns.iter().map(|column| column[row].clone()).collect()))
                    .collect(),
            ))
        }
        "map" => {
            args.finish()?;
            args.count(2, 2)?;
            let function = args.arg(0);
            let mut out = Vec::new();
            for item in interp.collect(&args.arg(1))? {
                out.push(interp.call(&function, vec![item], Vec::new())?);
            }
            Ok(Value::list(out))
        }
        "filter" => {
            args.finish()?;
            args.count(2, 2)?;
            let function = args.arg(0);
            let mut out = Vec::new();
            for item in interp.collect(&args.arg(1))? {
                let keep = match function {
                    Value::None => item.truthy(),
                    _ => interp.call(&function, vec![item.clone()], Vec::new())?.truthy(),
                };
                if keep {
                    out.push(item);
                }
            }
            Ok(Value::list(out))
        }
        "type" => {
            args.finish()?;
            args.count(1, 1)?;
            Ok(match args.arg(0) {
                Value::Exception(exc) => Value::ExceptionType(exc.0),
                value => Value::Builtin(value.type_name()),
            })
        }
        "isinstance" => {
            args.finish()?;
            args.count(2, 2)?;
            is_instance(&args.arg(0), &args.arg(1)).map(Value::Bool)
        }
        "chr" => {
            args.finish()?;
            args.count(1, 1)?;
            let code = integer(&args.arg(0))?;
            u32::try_from(code)
                .ok()
                .and_then(char::from_u32)
                .map(|c| Value::str(c.to_string()))
                .ok_or_else(|| Exception::value_error("chr() arg not in range(0x110000)"))
        }
        "ord" => {
            args.finish()?;
            args.count(1, 1)?;
            match args.arg(0) {
                Value::Str(s) => {
                    let mut chars = s.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) => Ok(Value::Int(c as i64)),
                        _ => Err(Exception::type_error(format!(
                            "ord() expected a character, but string of length {} found",
                            s.chars().count()
                        ))),
                    }
                }
                other => Err(Exception::type_error(format!(
                    "ord() expected string of length 1, but {} found",
                    other.type_name()
                ))),
            }
        }
        "any" | "all" => {
            args.finish()?;
            args.count(1, 1)?;
            let want = name == "any";
            for item in interp.iterate(&args.arg(0))? {
                interp.tick()?;
                if item.truthy() == want {
                    return Ok(Value::Bool(want));
                }
            }
            Ok(Value::Bool(!want))
        }
        "divmod" => {
            args.finish()?;
            args.count(2, 2)?;
            divmod(&args.arg(0), &args.arg(1))
        }
        "pow" => {
            args.finish()?;
            args.count(2, 3)?;
            match args.get(2) {
                None | Some(Value::None) => {
                    interp.binop(BinOp::Pow, &args.arg(0), &args.arg(1))
                }
                Some(modulus) => modular_pow(&args.arg(0), &args.arg(1), modulus),
            }
        }
        "format" => {
            args.finish()?;
            args.count(1, 2)?;
            let spec = match args.get(1) {
                Some(Value::Str(spec)) => spec.to_string(),
                Some(other) => {
                    return Err(Exception::type_error(format!(
                        "format() argument 2 must be str, not {}",
                        other.type_name()
                    )));
                }
                None => String::new(),
            };
            Ok(Value::str(format_value(&args.arg(0), &spec)?))
        }
        "hex" | "bin" | "oct" => {
            args.finish()?;
            args.count(1, 1)?;
            let value = integer(&args.arg(0))?;
            let magnitude = value.unsigned_abs();
            let digits = match name {
                "hex" => format!("0x{:x}", magnitude),
                "bin" => format!("0b{:b}", magnitude),
                _ => format!("0o{:o}", magnitude),
            };
            Ok(Value::str(if value < 0 {
                format!("-{}", digits)
            } else {
                digits
            }))
        }
        type_name if is_type_builtin(type_name) => Err(Exception::type_error(format!(
            "cannot create '{}' instances",
            type_name
        ))),
        other => Err(Exception::new(
            ErrorKind::NameError,
            format!("name '{}' is not defined", other),
        )),
    }
}

fn text_kwarg(args: &mut Args, key: &str, default: &str) -> Result<String, Exception> {
    match args.kwarg(key) {
        None | Some(Value::None) => Ok(default.to_string()),
        Some(Value::Str(text)) => Ok(text.to_string()),
        Some(other) => Err(Exception::type_error(format!(
            "{} must be None or a string, not {}",
            key,
            other.type_name()
        ))),
    }
}

fn bad_operand(function: &str, value: &Value) -> Exception {
    Exception::type_error(format!(
        "bad operand type for {}: '{}'",
        function,
        value.type_name()
    ))
}

pub(super) fn integer(value: &Value) -> Result<i64, Exception> {
    value.as_int().ok_or_else(|| {
        Exception::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            value.type_name()
        ))
    })
}

fn real(value: &Value) -> Result<f64, Exception> {
    value.as_float().ok_or_else(|| {
        Exception::type_error(format!("must be real number, not {}", value.type_name()))
    })
}

pub(super) fn length(value: &Value) -> Result<i64, Exception> {
    let len = match value {
        Value::Str(s) => s.chars().count(),
        Value::List(items) | Value::Set(items) => items.borrow().len(),
        Value::Tuple(items) => items.len(),
        Value::Dict(dict) => dict.borrow().len(),
        Value::Range { start, stop, step } => return Ok(range_len(*start, *stop, *step)),
        other => {
            return Err(Exception::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )));
        }
    };
    Ok(len as i64)
}

fn float_to_int(f: f64) -> Result<i64, Exception> {
    if f.is_nan() {
        return Err(Exception::value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(Exception::new(
            ErrorKind::OverflowError,
            "cannot convert float infinity to integer",
        ));
    }
    let truncated = f.trunc();
    if truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
        return Err(Exception::new(
            ErrorKind::OverflowError,
            "integer result does not fit in 64 bits",
        ));
    }
    Ok(truncated as i64)
}

fn to_int(value: Option<&Value>, base: Option<&Value>) -> Result<Value, Exception> {
    let Some(value) = value else {
        return Ok(Value::Int(0));
    };
    let base = match base {
        None | Some(Value::None) => None,
        Some(base) => Some(integer(base)?),
    };
    match (value, base) {
        (Value::Float(f), None) => float_to_int(*f).map(Value::Int),
        (Value::Int(_) | Value::Bool(_), None) => Ok(Value::Int(integer(value)?)),
        (Value::Str(text), base) => {
            let base = base.unwrap_or(10);
            if !(2..=36).contains(&base) {
                return Err(Exception::value_error("int() base must be >= 2 and <= 36, or 0"));
            }
            parse_int(text, base as u32).map(Value::Int)
        }
        (_, Some(_)) => Err(Exception::type_error(
            "int() can't convert non-string with explicit base",
        )),
        (other, None) => Err(Exception::type_error(format!(
            "int() argument must be a string, a bytes-like object or a real number, not '{}'",
            other.type_name()
        ))),
    }
}

fn parse_int(text: &str, base: u32) -> Result<i64, Exception> {
    let invalid = || {
        Exception::value_error(format!(
            "invalid literal for int() with base {}: {}",
            base,
            Value::str(text).repr()
        ))
    };
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let digits = match base {
        16 => digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
            .unwrap_or(digits),
        8 => digits
            .strip_prefix("0o")
            .or_else(|| digits.strip_prefix("0O"))
            .unwrap_or(digits),
        2 => digits
            .strip_prefix("0b")
            .or_else(|| digits.strip_prefix("0B"))
            .unwrap_or(digits),
        _ => digits,
    };
    if digits.is_empty()
        || digits.starts_with('_')
        || digits.ends_with('_')
        || digits.contains("__")
        || digits.starts_with(['+', '-'])
    {
        return Err(invalid());
    }
    let cleaned: String = digits.chars().filter(|c| *c != '_').collect();
    let signed = if negative {
        format!("-{}", cleaned)
    } else {
        cleaned
    };
    i64::from_str_radix(&signed, base).map_err(|e| match e.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => Exception::new(
            ErrorKind::OverflowError,
            "integer result does not fit in 64 bits",
        ),
        _ => invalid(),
    })
}

fn to_float(value: Option<&Value>) -> Result<Value, Exception> {
    match value {
        None => Ok(Value::Float(0.0)),
        Some(Value::Str(text)) => {
            let trimmed = text.trim();
            let cleaned: String = trimmed.chars().filter(|c| *c != '_').collect();
            let valid_underscores = !trimmed.starts_with('_') && !trimmed.ends_with('_') && !trimmed.contains("__");
            match cleaned.parse::<f64>() {
                Ok(f) if valid_underscores && !cleaned.is_empty() => Ok(Value::Float(f)),
                _ => Err(Exception::value_error(format!(
                    "could not convert string to float: {}",
                    Value::str(text).repr()
                ))),
            }
        }
        Some(other) => other.as_float().map(Value::Float).ok_or_else(|| {
            Exception::type_error(format!(
                "float() argument must be a string or a real number, not '{}'",
                other.type_name()
            ))
        }),
    }
}

fn round(value: &Value, ndigits: &Value) -> Result<Value, Exception> {
    match (value, ndigits) {
        (Value::Float(f), Value::None) => float_to_int(f.round_ties_even()).map(Value::Int),
        (Value::Float(f), ndigits) => {
            let digits = integer(ndigits)?.clamp(-308, 308) as i32;
            let scale = 10f64.powi(digits);
            let scaled = f * scale;
            if !scaled.is_finite() {
                return Ok(Value::Float(*f));
            }
            Ok(Value::Float(scaled.round_ties_even() / scale))
        }
        (value, ndigits) => {
            let i = integer(value).map_err(|_| {
                Exception::type_error(format!(
                    "type {} doesn't define __round__ method",
                    value.type_name()
                ))
            })?;
            let digits = match ndigits {
                Value::None => 0,
                other => integer(other)?,
            };
            if digits >= 0 {
                return Ok(Value::Int(i));
            }
            let Some(factor) = u32::try_from(-digits).ok().and_then(|d| 10i64.checked_pow(d)) else {
                return Ok(Value::Int(0));
            };
            let remainder = floor_mod(i, factor);
            let base = i - remainder;
            let rounded = match (remainder * 2).cmp(&factor) {
                std::cmp::Ordering::Less => base,
                std::cmp::Ordering::Greater => base + factor,
                std::cmp::Ordering::Equal if floor_div(base, factor)? % 2 == 0 => base,
                std::cmp::Ordering::Equal => base + factor,
            };
            Ok(Value::Int(rounded))
        }
    }
}

fn divmod(a: &Value, b: &Value) -> Result<Value, Exception> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        if y == 0 {
            return Err(Exception::new(
                ErrorKind::ZeroDivisionError,
                "integer division or modulo by zero",
            ));
        }
        return Ok(Value::tuple(vec![
            Value::Int(floor_div(x, y)?),
            Value::Int(floor_mod(x, y)),
        ]));
    }
    match (a.as_float(), b.as_float()) {
        (Some(_), Some(y)) if y == 0.0 => Err(Exception::new(
            ErrorKind::ZeroDivisionError,
            "float divmod()",
        )),
        (Some(x), Some(y)) => {
            let (quotient, remainder) = float_divmod(x, y);
            Ok(Value::tuple(vec![Value::Float(quotient), Value::Float(remainder)]))
        }
        _ => Err(Exception::type_error(format!(
            "unsupported operand type(s) for divmod(): '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn modular_pow(base: &Value, exponent: &Value, modulus: &Value) -> Result<Value, Exception> {
    let (Some(base), Some(exponent), Some(modulus)) = (base.as_int(), exponent.as_int(), modulus.as_int())
    else {
        return Err(Exception::type_error(
            "pow() 3rd argument not allowed unless all arguments are integers",
        ));
    };
    if modulus == 0 {
        return Err(Exception::value_error("pow() 3rd argument cannot be 0"));
    }
    if exponent < 0 {
        return Err(Exception::value_error(
            "pow() negative exponent is not supported with a modulus",
        ));
    }
    let m = modulus as i128;
    let mut result: i128 = 1 % m;
    let mut base = (base as i128).rem_euclid(m);
    let mut exponent = exponent;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result * base % m;
        }
        base = base * base % m;
        exponent >>= 1;
    }
    let mut result = result.rem_euclid(m);
    if m < 0 && result != 0 {
        result += m;
    }
    Ok(Value::Int(result as i64))
}

fn is_instance(value: &Value, kind: &Value) -> Result<bool, Exception> {
    match kind {
        Value::Builtin(name) if is_type_builtin(name) => Ok(value.type_name() == *name
            || (*name == "int" && matches!(value, Value::Bool(_)))),
        Value::ExceptionType(kind) => Ok(matches!(value, Value::Exception(exc) if exc.0.is_subclass_of(*kind))),
        Value::Tuple(kinds) => {
            for kind in kinds.iter() {
                if is_instance(value, kind)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(Exception::type_error(
            "isinstance() arg 2 must be a type, a tuple of types, or a union",
        )),
    }
}

fn extremum(interp: &mut Interpreter, mut args: Args, want_max: bool) -> Result<Value, Exception> {
    let key = args.kwarg("key").unwrap_or(Value::None);
    let default = args.kwarg("default");
    args.finish()?;
    args.count(1, usize::MAX)?;
    let name = if want_max { "max" } else { "min" };

    let candidates = if args.len() == 1 {
        interp.collect(&args.arg(0))?
    } else {
        if default.is_some() {
            return Err(Exception::type_error(format!(
                "Cannot specify a default for {}() with multiple positional arguments",
                name
            )));
        }
        args.positional().to_vec()
    };

    let mut best: Option<(Value, Value)> = None;
    for candidate in candidates {
        interp.tick()?;
        let rank = match key {
            Value::None => candidate.clone(),
            _ => interp.call(&key, vec![candidate.clone()], Vec::new())?,
        };
        let better = match &best {
            None => true,
            Some((best_rank, _)) if want_max => less_than(best_rank, &rank)?,
            Some((best_rank, _)) => less_than(&rank, best_rank)?,
        };
        if better {
            best = Some((rank, candidate));
        }
    }
    match (best, default) {
        (Some((_, value)), _) => Ok(value),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(Exception::value_error(format!(
            "{}() arg is an empty sequence",
            name
        ))),
    }
}

/// Stable sort with an optional key function, shared by `sorted` and
/// `list.sort`.
pub(super) fn sort_values(
    interp: &mut Interpreter,
    items: Vec<Value>,
    key: &Value,
    reverse: bool,
) -> Result<Vec<Value>, Exception> {
    let mut decorated = Vec::with_capacity(items.len());
    for item in items {
        let rank = match key {
            Value::None => item.clone(),
            _ => interp.call(key, vec![item.clone()], Vec::new())?,
        };
        decorated.push((rank, item));
    }
    let sorted = merge_sort(interp, decorated, reverse)?;
    Ok(sorted.into_iter().map(|(_, item)| item).collect())
}

// A fallible comparator cannot go through `slice::sort_by`, so merge by hand.
fn merge_sort(
    interp: &mut Interpreter,
    mut items: Vec<(Value, Value)>,
    reverse: bool,
) -> Result<Vec<(Value, Value)>, Exception> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(interp, items, reverse)?;
    let right = merge_sort(interp, right, reverse)?;

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        let take_right = match (left.peek(), right.peek()) {
            (Some((l, _)), Some((r, _))) => {
                interp.tick()?;
                if reverse {
                    less_than(l, r)?
                } else {
                    less_than(r, l)?
                }
            }
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => break,
        };
        merged.extend(if take_right { right.next() } else { left.next() });
    }
    Ok(merged)
}

pub(super) fn update_dict(
    interp: &mut Interpreter,
    dict: &mut Dict,
    source: &Value,
) -> Result<(), Exception> {
    if let Value::Dict(other) = source {
        for (key, value) in &other.borrow().entries {
            dict.insert(key.clone(), value.clone());
        }
        return Ok(());
    }
    for (at, pair) in interp.collect(source)?.into_iter().enumerate() {
        let pair = interp.collect(&pair).map_err(|_| {
            Exception::type_error(format!(
                "cannot convert dictionary update sequence element #{} to a sequence",
                at
            ))
        })?;
        let [key, value]: [Value; 2] = pair.try_into().map_err(|pair: Vec<Value>| {
            Exception::value_error(format!(
                "dictionary update sequence element #{} has length {}; 2 is required",
                at,
                pair.len()
            ))
        })?;
        key.check_hashable()?;
        dict.insert(key, value);
    }
    interp.check_len(dict.len())
}

fn math(function: &str, args: &Args) -> Result<Value, Exception> {
    let domain = || Exception::value_error("math domain error");
    let range = || Exception::new(ErrorKind::OverflowError, "math range error");
    let unary = |apply: fn(f64) -> f64| -> Result<Value, Exception> {
        args.count(1, 1)?;
        Ok(Value::Float(apply(real(&args.arg(0))?)))
    };

    match function {
        "sqrt" => {
            args.count(1, 1)?;
            let x = real(&args.arg(0))?;
            if x < 0.0 {
                return Err(domain());
            }
            Ok(Value::Float(x.sqrt()))
        }
        "floor" | "ceil" | "trunc" => {
            args.count(1, 1)?;
            match args.arg(0) {
                Value::Float(f) => float_to_int(match function {
                    "floor" => f.floor(),
                    "ceil" => f.ceil(),
                    _ => f.trunc(),
                })
                .map(Value::Int),
                other => Ok(Value::Int(integer(&other).map_err(|_| {
                    Exception::type_error(format!("must be real number, not {}", other.type_name()))
                })?)),
            }
        }
        "fabs" => unary(f64::abs),
        "factorial" => {
            args.count(1, 1)?;
            let Value::Int(n) = args.arg(0) else {
                return Err(Exception::type_error(format!(
                    "'{}' object cannot be interpreted as an integer",
                    args.arg(0).type_name()
                )));
            };
            if n < 0 {
                return Err(Exception::value_error(
                    "factorial() not defined for negative values",
                ));
            }
            (1..=n)
                .try_fold(1i64, |acc, k| acc.checked_mul(k))
                .map(Value::Int)
                .ok_or_else(|| {
                    Exception::new(ErrorKind::OverflowError, "integer result does not fit in 64 bits")
                })
        }
        "gcd" => {
            let mut result: i64 = 0;
            for value in args.positional() {
                let mut a = result.unsigned_abs();
                let mut b = integer(value)?.unsigned_abs();
                while b != 0 {
                    (a, b) = (b, a % b);
                }
                result = i64::try_from(a).map_err(|_| {
                    Exception::new(ErrorKind::OverflowError, "integer result does not fit in 64 bits")
                })?;
            }
            Ok(Value::Int(result))
        }
        "isqrt" => {
            args.count(1, 1)?;
            let n = integer(&args.arg(0))?;
            if n < 0 {
                return Err(Exception::value_error(
                    "isqrt() argument must be nonnegative",
                ));
            }
            let mut root = (n as f64).sqrt() as i64;
            while root.checked_mul(root).is_none_or(|square| square > n) {
                root -= 1;
            }
            while (root + 1).checked_mul(root + 1).is_some_and(|square| square <= n) {
                root += 1;
            }
            Ok(Value::Int(root))
        }
        "pow" => {
            args.count(2, 2)?;
            let (x, y) = (real(&args.arg(0))?, real(&args.arg(1))?);
            if x == 0.0 && y < 0.0 {
                return Err(domain());
            }
            if x < 0.0 && y.fract() != 0.0 {
                return Err(domain());
            }
            let result = x.powf(y);
            if result.is_infinite() && x.is_finite() && y.is_finite() {
                return Err(range());
            }
            Ok(Value::Float(result))
        }
        "exp" => {
            args.count(1, 1)?;
            let result = real(&args.arg(0))?.exp();
            if result.is_infinite() {
                return Err(range());
            }
            Ok(Value::Float(result))
        }
        "log" | "log10" | "log2" => {
            args.count(1, if function == "log" { 2 } else { 1 })?;
            let x = real(&args.arg(0))?;
            if x <= 0.0 {
                return Err(domain());
            }
            let result = match (function, args.get(1)) {
                ("log10", _) => x.log10(),
                ("log2", _) => x.log2(),
                (_, Some(base)) => {
                    let base = real(base)?;
                    if base <= 0.0 || base == 1.0 {
                        return Err(domain());
                    }
                    x.ln() / base.ln()
                }
                _ => x.ln(),
            };
            Ok(Value::Float(result))
        }
        "sin" => unary(f64::sin),
        "cos" => unary(f64::cos),
        "tan" => unary(f64::tan),
        "atan" => unary(f64::atan),
        "degrees" => unary(f64::to_degrees),
        "radians" => unary(f64::to_radians),
        "asin" | "acos" => {
            args.count(1, 1)?;
            let x = real(&args.arg(0))?;
            if !(-1.0..=1.0).contains(&x) {
                return Err(domain());
            }
            Ok(Value::Float(if function == "asin" { x.asin() } else { x.acos() }))
        }
        "atan2" => {
            args.count(2, 2)?;
            Ok(Value::Float(real(&args.arg(0))?.atan2(real(&args.arg(1))?)))
        }
        "hypot" => {
            let mut total = 0.0f64;
            for value in args.positional() {
                total = total.hypot(real(value)?);
            }
            Ok(Value::Float(total))
        }
        "isfinite" | "isinf" | "isnan" => {
            args.count(1, 1)?;
            let x = real(&args.arg(0))?;
            Ok(Value::Bool(match function {
                "isfinite" => x.is_finite(),
                "isinf" => x.is_infinite(),
                _ => x.is_nan(),
            }))
        }
        other => Err(Exception::new(
            ErrorKind::AttributeError,
            format!("module 'math' has no attribute '{}'", other),
        )),
    }
}
