use std::{cell::RefCell, rc::Rc};

use super::{
    ast::BinOp,
    builtins::{Args, integer, sort_values, update_dict},
    error::{ErrorKind, Exception},
    eval::Interpreter,
    format::format_template,
    value::{Dict, Value, key_error, values_equal},
};

const STR_METHODS: &[&str] = &[
    "upper",
    "lower",
    "strip",
    "lstrip",
    "rstrip",
    "split",
    "splitlines",
    "join",
    "replace",
    "startswith",
    "endswith",
    "find",
    "rfind",
    "index",
    "rindex",
    "count",
    "title",
    "capitalize",
    "swapcase",
    "isdigit",
    "isnumeric",
    "isdecimal",
    "isalpha",
    "isalnum",
    "isspace",
    "isupper",
    "islower",
    "zfill",
    "center",
    "ljust",
    "rjust",
    "format",
];

const LIST_METHODS: &[&str] = &[
    "append", "extend", "insert", "pop", "remove", "index", "count", "sort", "reverse", "clear",
    "copy",
];

const TUPLE_METHODS: &[&str] = &["index", "count"];

const DICT_METHODS: &[&str] = &[
    "get",
    "keys",
    "values",
    "items",
    "pop",
    "popitem",
    "update",
    "setdefault",
    "clear",
    "copy",
];

const SET_METHODS: &[&str] = &[
    "add",
    "remove",
    "discard",
    "pop",
    "clear",
    "copy",
    "union",
    "intersection",
    "difference",
    "issubset",
    "issuperset",
];

fn table(receiver: &Value) -> &'static [&'static str] {
    match receiver {
        Value::Str(_) => STR_METHODS,
        Value::List(_) => LIST_METHODS,
        Value::Tuple(_) => TUPLE_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::Set(_) => SET_METHODS,
        _ => &[],
    }
}

pub fn has_method(receiver: &Value, name: &str) -> bool {
    table(receiver).contains(&name)
}

pub fn call(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    positional: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, Exception> {
    let Some(method) = table(receiver).iter().copied().find(|method| *method == name) else {
        return Err(Exception::new(
            ErrorKind::AttributeError,
            format!("'{}' object has no attribute '{}'", receiver.type_name(), name),
        ));
    };
    let args = Args::new(method, positional, kwargs);

    match receiver {
        Value::Str(s) => str_method(interp, s, method, args),
        Value::List(items) => list_method(interp, receiver, items, method, args),
        Value::Tuple(items) => {
            args.finish()?;
            sequence_method(items, method, &args, "tuple")
        }
        Value::Dict(dict) => dict_method(interp, dict, method, args),
        Value::Set(items) => set_method(interp, receiver, items, method, args),
        _ => unreachable_method(receiver, method),
    }
}

fn unreachable_method(receiver: &Value, name: &str) -> Result<Value, Exception> {
    Err(Exception::new(
        ErrorKind::AttributeError,
        format!("'{}' object has no attribute '{}'", receiver.type_name(), name),
    ))
}

fn text_arg(args: &Args, at: usize) -> Result<Rc<str>, Exception> {
    match args.arg(at) {
        Value::Str(text) => Ok(text),
        other => Err(Exception::type_error(format!(
            "must be str, not {}",
            other.type_name()
        ))),
    }
}

fn optional_text(args: &Args, at: usize) -> Result<Option<Rc<str>>, Exception> {
    match args.get(at) {
        None | Some(Value::None) => Ok(None),
        Some(_) => text_arg(args, at).map(Some),
    }
}

fn char_index(s: &str, byte: usize) -> i64 {
    s[..byte].chars().count() as i64
}

fn str_method(
    interp: &mut Interpreter,
    s: &Rc<str>,
    name: &'static str,
    mut args: Args,
) -> Result<Value, Exception> {
    if name == "format" {
        let kwargs = args.take_kwargs();
        return Ok(Value::str(format_template(s, args.positional(), &kwargs)?));
    }
    if name == "split" {
        let sep = args.kwarg("sep");
        let maxsplit = args.kwarg("maxsplit");
        args.finish()?;
        args.count(0, 2)?;
        let sep = match sep.or_else(|| args.get(0).cloned()) {
            None | Some(Value::None) => None,
            Some(Value::Str(sep)) => Some(sep),
            Some(other) => {
                return Err(Exception::type_error(format!(
                    "must be str or None, not {}",
                    other.type_name()
                )));
            }
        };
        let maxsplit = match maxsplit.or_else(|| args.get(1).cloned()) {
            Some(value) => integer(&value)?,
            None => -1,
        };
        let parts = split(s, sep.as_deref(), maxsplit)?;
        interp.check_len(parts.len())?;
        return Ok(Value::list(parts.into_iter().map(Value::str).collect()));
    }
    args.finish()?;
    if name.starts_with("is")
        || matches!(name, "upper" | "lower" | "swapcase" | "title" | "capitalize")
    {
        args.count(0, 0)?;
    }

    let predicate = |test: fn(char) -> bool| Value::Bool(!s.is_empty() && s.chars().all(test));
    match name {
        "upper" => Ok(Value::str(s.to_uppercase())),
        "lower" => Ok(Value::str(s.to_lowercase())),
        "swapcase" => Ok(Value::str(
            s.chars()
                .flat_map(|c| {
                    if c.is_uppercase() {
                        c.to_lowercase().collect::<Vec<_>>()
                    } else {
                        c.to_uppercase().collect::<Vec<_>>()
                    }
                })
                .collect::<String>(),
        )),
        "strip" | "lstrip" | "rstrip" => {
            args.count(0, 1)?;
            let chars = optional_text(&args, 0)?;
            let strip = |c: char| match &chars {
                Some(chars) => chars.contains(c),
                None => c.is_whitespace(),
            };
            Ok(Value::str(match name {
                "strip" => s.trim_matches(strip),
                "lstrip" => s.trim_start_matches(strip),
                _ => s.trim_end_matches(strip),
            }))
        }
        "splitlines" => {
            args.count(0, 0)?;
            Ok(Value::list(s.lines().map(Value::str).collect()))
        }
        "join" => {
            args.count(1, 1)?;
            let items = interp.collect(&args.arg(0))?;
            let mut parts = Vec::with_capacity(items.len());
            for (at, item) in items.iter().enumerate() {
                match item {
                    Value::Str(part) => parts.push(part.to_string()),
                    other => {
                        return Err(Exception::type_error(format!(
                            "sequence item {}: expected str instance, {} found",
                            at,
                            other.type_name()
                        )));
                    }
                }
            }
            let joined = parts.join(&**s);
            interp.check_str_len(joined.len())?;
            Ok(Value::str(joined))
        }
        "replace" => {
            args.count(2, 3)?;
            let old = text_arg(&args, 0)?;
            let new = text_arg(&args, 1)?;
            let count = match args.get(2) {
                Some(value) => integer(value)?,
                None => -1,
            };
            let replaced = match usize::try_from(count) {
                Ok(count) => s.replacen(&*old, &new, count),
                Err(_) => s.replace(&*old, &new),
            };
            interp.check_str_len(replaced.len())?;
            Ok(Value::str(replaced))
        }
        "startswith" | "endswith" => {
            args.count(1, 1)?;
            let candidates = match args.arg(0) {
                Value::Tuple(items) => items.to_vec(),
                other => vec![other],
            };
            for candidate in candidates {
                let Value::Str(affix) = candidate else {
                    return Err(Exception::type_error(format!(
                        "{} first arg must be str or a tuple of str, not {}",
                        name,
                        candidate.type_name()
                    )));
                };
                let found = if name == "startswith" {
                    s.starts_with(&*affix)
                } else {
                    s.ends_with(&*affix)
                };
                if found {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        "find" | "rfind" | "index" | "rindex" => {
            args.count(1, 1)?;
            let needle = text_arg(&args, 0)?;
            let found = if name.starts_with('r') {
                s.rfind(&*needle)
            } else {
                s.find(&*needle)
            };
            match found {
                Some(byte) => Ok(Value::Int(char_index(s, byte))),
                None if name.ends_with("find") => Ok(Value::Int(-1)),
                None => Err(Exception::value_error("substring not found")),
            }
        }
        "count" => {
            args.count(1, 1)?;
            let needle = text_arg(&args, 0)?;
            let count = if needle.is_empty() {
                s.chars().count() + 1
            } else {
                s.matches(&*needle).count()
            };
            Ok(Value::Int(count as i64))
        }
        "title" => {
            let mut out = String::with_capacity(s.len());
            let mut previous_cased = false;
            for c in s.chars() {
                if previous_cased {
                    out.extend(c.to_lowercase());
                } else {
                    out.extend(c.to_uppercase());
                }
                previous_cased = c.is_alphabetic();
            }
            Ok(Value::str(out))
        }
        "capitalize" => {
            let mut chars = s.chars();
            let out = match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            };
            Ok(Value::str(out))
        }
        "isdigit" | "isnumeric" | "isdecimal" => Ok(predicate(char::is_numeric)),
        "isalpha" => Ok(predicate(char::is_alphabetic)),
        "isalnum" => Ok(predicate(char::is_alphanumeric)),
        "isspace" => Ok(predicate(char::is_whitespace)),
        "isupper" | "islower" => {
            let upper = name == "isupper";
            let mut cased = false;
            for c in s.chars() {
                if c.is_lowercase() || c.is_uppercase() {
                    cased = true;
                    if c.is_uppercase() != upper {
                        return Ok(Value::Bool(false));
                    }
                }
            }
            Ok(Value::Bool(cased))
        }
        "zfill" => {
            args.count(1, 1)?;
            let width = usize::try_from(integer(&args.arg(0))?).unwrap_or(0);
            let len = s.chars().count();
            if width <= len {
                return Ok(Value::Str(s.clone()));
            }
            interp.check_str_len(width)?;
            let (sign, digits) = match s.chars().next() {
                Some(c @ ('+' | '-')) => (c.to_string(), &s[1..]),
                _ => (String::new(), &s[..]),
            };
            Ok(Value::str(format!("{}{}{}", sign, "0".repeat(width - len), digits)))
        }
        "center" | "ljust" | "rjust" => {
            args.count(1, 2)?;
            let width = usize::try_from(integer(&args.arg(0))?).unwrap_or(0);
            let fill = match optional_text(&args, 1)? {
                Some(fill) if fill.chars().count() == 1 => fill.chars().next().unwrap_or(' '),
                Some(_) => {
                    return Err(Exception::type_error(
                        "The fill character must be exactly one character long",
                    ));
                }
                None => ' ',
            };
            let len = s.chars().count();
            if width <= len {
                return Ok(Value::Str(s.clone()));
            }
            interp.check_str_len(width)?;
            let padding = width - len;
            let (left, right) = match name {
                "ljust" => (0, padding),
                "rjust" => (padding, 0),
                _ => {
                    let left = padding / 2 + (padding & width & 1);
                    (left, padding - left)
                }
            };
            let fill_run = |n: usize| std::iter::repeat_n(fill, n).collect::<String>();
            Ok(Value::str(format!("{}{}{}", fill_run(left), s, fill_run(right))))
        }
        other => unreachable_method(&Value::Str(s.clone()), other),
    }
}

fn split(s: &str, sep: Option<&str>, maxsplit: i64) -> Result<Vec<String>, Exception> {
    let Some(sep) = sep else {
        let mut parts = Vec::new();
        let mut rest = s.trim_start();
        while !rest.is_empty() {
            if maxsplit >= 0 && parts.len() as i64 == maxsplit {
                parts.push(rest.to_string());
                break;
            }
            match rest.find(char::is_whitespace) {
                Some(end) => {
                    parts.push(rest[..end].to_string());
                    rest = rest[end..].trim_start();
                }
                None => {
                    parts.push(rest.to_string());
                    break;
                }
            }
        }
        return Ok(parts);
    };
    if sep.is_empty() {
        return Err(Exception::value_error("empty separator"));
    }
    Ok(match usize::try_from(maxsplit) {
        Ok(maxsplit) => s.splitn(maxsplit.saturating_add(1), sep).map(str::to_string).collect(),
        Err(_) => s.split(sep).map(str::to_string).collect(),
    })
}

fn sequence_method(
    items: &[Value],
    name: &str,
    args: &Args,
    type_name: &str,
) -> Result<Value, Exception> {
    match name {
        "count" => {
            args.count(1, 1)?;
            let needle = args.arg(0);
            Ok(Value::Int(
                items.iter().filter(|item| values_equal(item, &needle)).count() as i64,
            ))
        }
        "index" => {
            args.count(1, 1)?;
            let needle = args.arg(0);
            items
                .iter()
                .position(|item| values_equal(item, &needle))
                .map(|at| Value::Int(at as i64))
                .ok_or_else(|| {
                    Exception::value_error(if type_name == "list" {
                        format!("{} is not in list", needle.repr())
                    } else {
                        format!("{}.index(x): x not in {}", type_name, type_name)
                    })
                })
        }
        other => Err(Exception::new(
            ErrorKind::AttributeError,
            format!("'{}' object has no attribute '{}'", type_name, other),
        )),
    }
}

fn list_method(
    interp: &mut Interpreter,
    receiver: &Value,
    items: &Rc<RefCell<Vec<Value>>>,
    name: &'static str,
    mut args: Args,
) -> Result<Value, Exception> {
    if name == "sort" {
        let key = args.kwarg("key").unwrap_or(Value::None);
        let reverse = args.kwarg("reverse").is_some_and(|value| value.truthy());
        args.finish()?;
        args.count(0, 0)?;
        let current = items.borrow().clone();
        let sorted = sort_values(interp, current, &key, reverse)?;
        *items.borrow_mut() = sorted;
        return Ok(Value::None);
    }
    args.finish()?;

    match name {
        "append" => {
            args.count(1, 1)?;
            interp.check_len(items.borrow().len() + 1)?;
            items.borrow_mut().push(args.arg(0));
            Ok(Value::None)
        }
        "extend" => {
            args.count(1, 1)?;
            let extra = interp.collect(&args.arg(0))?;
            interp.check_len(items.borrow().len() + extra.len())?;
            items.borrow_mut().extend(extra);
            Ok(Value::None)
        }
        "insert" => {
            args.count(2, 2)?;
            let len = items.borrow().len() as i64;
            let at = integer(&args.arg(0))?;
            let at = if at < 0 { (at + len).max(0) } else { at.min(len) };
            interp.check_len(items.borrow().len() + 1)?;
            items.borrow_mut().insert(at as usize, args.arg(1));
            Ok(Value::None)
        }
        "pop" => {
            args.count(0, 1)?;
            let mut items = items.borrow_mut();
            if items.is_empty() {
                return Err(Exception::new(ErrorKind::IndexError, "pop from empty list"));
            }
            let len = items.len() as i64;
            let at = match args.get(0) {
                Some(value) => integer(value)?,
                None => -1,
            };
            let at = if at < 0 { at + len } else { at };
            if !(0..len).contains(&at) {
                return Err(Exception::new(ErrorKind::IndexError, "pop index out of range"));
            }
            Ok(items.remove(at as usize))
        }
        "remove" => {
            args.count(1, 1)?;
            let needle = args.arg(0);
            let found = items.borrow().iter().position(|item| values_equal(item, &needle));
            match found {
                Some(at) => {
                    items.borrow_mut().remove(at);
                    Ok(Value::None)
                }
                None => Err(Exception::value_error("list.remove(x): x not in list")),
            }
        }
        "index" | "count" => {
            let snapshot = items.borrow().clone();
            sequence_method(&snapshot, name, &args, "list")
        }
        "reverse" => {
            args.count(0, 0)?;
            items.borrow_mut().reverse();
            Ok(Value::None)
        }
        "clear" => {
            args.count(0, 0)?;
            items.borrow_mut().clear();
            Ok(Value::None)
        }
        "copy" => {
            args.count(0, 0)?;
            Ok(Value::list(items.borrow().clone()))
        }
        other => unreachable_method(receiver, other),
    }
}

fn dict_method(
    interp: &mut Interpreter,
    dict: &Rc<RefCell<Dict>>,
    name: &'static str,
    mut args: Args,
) -> Result<Value, Exception> {
    if name == "update" {
        args.count(0, 1)?;
        let mut updated = dict.borrow().clone();
        if let Some(source) = args.get(0) {
            update_dict(interp, &mut updated, source)?;
        }
        for (key, value) in args.take_kwargs() {
            updated.insert(Value::str(key), value);
        }
        interp.check_len(updated.len())?;
        *dict.borrow_mut() = updated;
        return Ok(Value::None);
    }
    args.finish()?;

    match name {
        "get" => {
            args.count(1, 2)?;
            let key = args.arg(0);
            key.check_hashable()?;
            Ok(dict.borrow().get(&key).cloned().unwrap_or_else(|| args.arg(1)))
        }
        "keys" => {
            args.count(0, 0)?;
            Ok(Value::list(dict.borrow().keys()))
        }
        "values" => {
            args.count(0, 0)?;
            Ok(Value::list(
                dict.borrow().entries.iter().map(|(_, value)| value.clone()).collect(),
            ))
        }
        "items" => {
            args.count(0, 0)?;
            Ok(Value::list(
                dict.borrow()
                    .entries
                    .iter()
                    .map(|(key, value)| Value::tuple(vec![key.clone(), value.clone()]))
                    .collect(),
            ))
        }
        "pop" => {
            args.count(1, 2)?;
            let key = args.arg(0);
            key.check_hashable()?;
            let removed = dict.borrow_mut().remove(&key);
            match (removed, args.get(1)) {
                (Some(value), _) => Ok(value),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(key_error(&key)),
            }
        }
        "popitem" => {
            args.count(0, 0)?;
            let last = dict.borrow_mut().entries.pop();
            last.map(|(key, value)| Value::tuple(vec![key, value]))
                .ok_or_else(|| Exception::new(ErrorKind::KeyError, "'popitem(): dictionary is empty'"))
        }
        "setdefault" => {
            args.count(1, 2)?;
            let key = args.arg(0);
            key.check_hashable()?;
            if let Some(existing) = dict.borrow().get(&key) {
                return Ok(existing.clone());
            }
            let default = args.arg(1);
            interp.check_len(dict.borrow().len() + 1)?;
            dict.borrow_mut().insert(key, default.clone());
            Ok(default)
        }
        "clear" => {
            args.count(0, 0)?;
            dict.borrow_mut().entries.clear();
            Ok(Value::None)
        }
        "copy" => {
            args.count(0, 0)?;
            Ok(Value::Dict(Rc::new(RefCell::new(dict.borrow().clone()))))
        }
        other => unreachable_method(&Value::Dict(dict.clone()), other),
    }
}

fn set_method(
    interp: &mut Interpreter,
    receiver: &Value,
    items: &Rc<RefCell<Vec<Value>>>,
    name: &'static str,
    args: Args,
) -> Result<Value, Exception> {
    args.finish()?;
    let position = |needle: &Value| items.borrow().iter().position(|item| values_equal(item, needle));

    match name {
        "add" => {
            args.count(1, 1)?;
            let item = args.arg(0);
            item.check_hashable()?;
            if position(&item).is_none() {
                interp.check_len(items.borrow().len() + 1)?;
                items.borrow_mut().push(item);
            }
            Ok(Value::None)
        }
        "remove" | "discard" => {
            args.count(1, 1)?;
            let item = args.arg(0);
            item.check_hashable()?;
            match position(&item) {
                Some(at) => {
                    items.borrow_mut().remove(at);
                    Ok(Value::None)
                }
                None if name == "discard" => Ok(Value::None),
                None => Err(key_error(&item)),
            }
        }
        "pop" => {
            args.count(0, 0)?;
            let mut items = items.borrow_mut();
            if items.is_empty() {
                return Err(Exception::new(ErrorKind::KeyError, "'pop from an empty set'"));
            }
            Ok(items.remove(0))
        }
        "clear" => {
            args.count(0, 0)?;
            items.borrow_mut().clear();
            Ok(Value::None)
        }
        "copy" => {
            args.count(0, 0)?;
            Ok(Value::Set(Rc::new(RefCell::new(items.borrow().clone()))))
        }
        "union" | "intersection" | "difference" => {
            let op = match name {
                "union" => BinOp::BitOr,
                "intersection" => BinOp::BitAnd,
                _ => BinOp::Sub,
            };
            let mut result = Value::Set(Rc::new(RefCell::new(items.borrow().clone())));
            for other in args.positional() {
                let other = interp.collect(other)?;
                let other = interp.build_set(other)?;
                result = interp.binop(op, &result, &other)?;
            }
            Ok(result)
        }
        "issubset" | "issuperset" => {
            args.count(1, 1)?;
            let other = interp.collect(&args.arg(0))?;
            let mine = items.borrow();
            let contained = |outer: &[Value], inner: &[Value]| {
                inner
                    .iter()
                    .all(|item| outer.iter().any(|candidate| values_equal(item, candidate)))
            };
            Ok(Value::Bool(if name == "issubset" {
                contained(&other[..], &mine[..])
            } else {
                contained(&mine[..], &other[..])
            }))
        }
        other => unreachable_method(receiver, other),
    }
}
