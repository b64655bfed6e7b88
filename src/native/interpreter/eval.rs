use std::{
    collections::{HashSet, VecDeque},
    rc::Rc,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{
    constants::MAX_STRING_BYTES,
    core::domain::{ExecutionLimits, RunRequest},
};

use super::{
    ast::{
        BinOp, BoolOp, CmpOp, Comprehension, Constant, Expr, FStringPart, FunctionDef, Handler,
        Stmt, StmtKind, UnaryOp,
    },
    builtins,
    error::{ErrorKind, Exception},
    format::{format_value, percent_format},
    methods,
    value::{
        BoundMethod, Dict, Env, Function, Module, Scope, Value, compare, is_same, key_error,
        less_than, range_len, values_equal,
    },
};

/// Statements between two deadline/interrupt checks.
const CHECK_INTERVAL: u32 = 64;

pub(super) enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

struct CallFrame {
    locals: Scope,
    globals_declared: HashSet<String>,
    name: String,
}

#[derive(Clone, Debug)]
pub(super) enum Index {
    Item(Value),
    Slice(Option<i64>, Option<i64>, Option<i64>),
}

/// Lazily walks an iterable; ranges never materialise.
pub(super) enum ValueIter {
    Range { next: i64, stop: i64, step: i64 },
    Items(std::vec::IntoIter<Value>),
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            ValueIter::Range { next, stop, step } => {
                let more = if *step > 0 { *next < *stop } else { *next > *stop };
                if !more {
                    return None;
                }
                let current = *next;
                match current.checked_add(*step) {
                    Some(following) => *next = following,
                    None => *next = *stop,
                }
                Some(Value::Int(current))
            }
            ValueIter::Items(items) => items.next(),
        }
    }
}

pub struct Interpreter {
    globals: Scope,
    frames: Vec<CallFrame>,
    stdout: Arc<Mutex<String>>,
    stdin: VecDeque<String>,
    limits: ExecutionLimits,
    timeout_ms: u64,
    deadline: Instant,
    interrupt: Arc<AtomicBool>,
    steps: u32,
    depth: usize,
    loops: usize,
    /// Exceptions currently being handled, for bare `raise`.
    handling: Vec<Exception>,
}

impl Interpreter {
    pub fn new(
        request: &RunRequest,
        stdout: Arc<Mutex<String>>,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        let globals = Env::child(None);
        globals
            .borrow_mut()
            .vars
            .insert("__name__".to_string(), Value::str("__main__"));

        Self {
            globals,
            frames: Vec::new(),
            stdout,
            stdin: request.stdin.lines().map(str::to_string).collect(),
            limits: request.limits,
            timeout_ms: request.timeout_ms,
            deadline: Instant::now() + Duration::from_millis(request.timeout_ms),
            interrupt,
            steps: 0,
            depth: 0,
            loops: 0,
            handling: Vec::new(),
        }
    }

    pub fn exec_module(&mut self, program: &[Stmt]) -> Result<(), Exception> {
        self.check_interrupts()?;
        self.exec_block(program).map(|_| ())
    }

    pub(super) fn tick(&mut self) -> Result<(), Exception> {
        self.steps = self.steps.wrapping_add(1);
        if self.steps % CHECK_INTERVAL != 0 {
            return Ok(());
        }
        self.check_interrupts()
    }

    fn check_interrupts(&self) -> Result<(), Exception> {
        if self.interrupt.load(Ordering::Relaxed) {
            return Err(Exception::new(ErrorKind::Cancelled, "execution cancelled"));
        }
        if Instant::now() >= self.deadline {
            return Err(Exception::new(
                ErrorKind::Timeout,
                format!("execution exceeded {} ms", self.timeout_ms),
            ));
        }
        Ok(())
    }

    pub(super) fn write_stdout(&mut self, text: &str) -> Result<(), Exception> {
        let limit = self.limits.stdout_size_bytes;
        let mut out = self.stdout.lock().unwrap_or_else(PoisonError::into_inner);
        let room = limit.saturating_sub(out.len());
        if text.len() <= room {
            out.push_str(text);
            return Ok(());
        }
        let mut cut = room;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        out.push_str(&text[..cut]);
        Err(Exception::new(
            ErrorKind::OutputLimitExceeded,
            format!("output exceeded the {} byte limit", limit),
        ))
    }

    pub(super) fn read_line(&mut self) -> Result<String, Exception> {
        self.stdin
            .pop_front()
            .ok_or_else(|| Exception::new(ErrorKind::EOFError, "EOF when reading a line"))
    }

    pub(super) fn check_len(&self, len: usize) -> Result<(), Exception> {
        if len > self.limits.max_collection_len {
            return Err(Exception::new(
                ErrorKind::MemoryError,
                format!(
                    "collection exceeds the sandbox limit of {} items",
                    self.limits.max_collection_len
                ),
            ));
        }
        Ok(())
    }

    pub(super) fn check_str_len(&self, len: usize) -> Result<(), Exception> {
        if len > MAX_STRING_BYTES {
            return Err(Exception::new(
                ErrorKind::MemoryError,
                format!("string exceeds the sandbox limit of {} bytes", MAX_STRING_BYTES),
            ));
        }
        Ok(())
    }

    fn scope_name(&self) -> &str {
        self.frames
            .last()
            .map(|frame| frame.name.as_str())
            .unwrap_or("<module>")
    }

    // Statements

    pub(super) fn exec_block(&mut self, body: &[Stmt]) -> Result<Flow, Exception> {
        for stmt in body {
            let flow = self
                .exec_stmt(stmt)
                .map_err(|e| e.at(stmt.line, self.scope_name()))?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow, Exception> {
        self.tick()?;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, *op, value)?,
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval(test)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                return self.exec_block(orelse);
            }
            StmtKind::While { test, body, orelse } => {
                self.loops += 1;
                let flow = self.exec_while(test, body);
                self.loops -= 1;
                match flow? {
                    Some(flow) => return Ok(flow),
                    None => return self.exec_block(orelse),
                }
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let iterable = self.eval(iter)?;
                self.loops += 1;
                let flow = self.exec_for(target, &iterable, body);
                self.loops -= 1;
                match flow? {
                    Some(flow) => return Ok(flow),
                    None => return self.exec_block(orelse),
                }
            }
            StmtKind::Break | StmtKind::Continue if self.loops == 0 => {
                let keyword = if matches!(stmt.kind, StmtKind::Break) {
                    "break"
                } else {
                    "continue"
                };
                return Err(Exception::syntax(
                    stmt.line,
                    format!("'{}' outside loop", keyword),
                ));
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass => {}
            StmtKind::FunctionDef(def) => {
                let function = self.make_function(def)?;
                self.store(&def.name, function);
            }
            StmtKind::Return(value) => {
                if self.depth == 0 {
                    return Err(Exception::syntax(stmt.line, "'return' outside function"));
                }
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Global(names) => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.globals_declared.extend(names.iter().cloned());
                }
            }
            StmtKind::Import { module, alias } => {
                let module_value = import(module)?;
                self.store(alias.as_deref().unwrap_or(module), module_value);
            }
            StmtKind::ImportFrom { module, names } => {
                import(module)?;
                for (name, alias) in names {
                    if name == "*" {
                        for (name, value) in builtins::math_exports() {
                            self.store(name, value);
                        }
                        continue;
                    }
                    let value = builtins::math_attr(name).ok_or_else(|| {
                        Exception::new(
                            ErrorKind::ImportError,
                            format!("cannot import name '{}' from '{}'", name, module),
                        )
                    })?;
                    self.store(alias.as_deref().unwrap_or(name), value);
                }
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => return self.exec_try(body, handlers, orelse, finalbody),
            StmtKind::Raise(expr) => return Err(self.raise(expr.as_ref())?),
            StmtKind::Assert { test, msg } => {
                if !self.eval(test)?.truthy() {
                    let msg = match msg {
                        Some(msg) => self.eval(msg)?.to_str(),
                        None => String::new(),
                    };
                    return Err(Exception::new(ErrorKind::AssertionError, msg));
                }
            }
            StmtKind::Del(targets) => {
                for target in targets {
                    self.delete(target)?;
                }
            }
        }
        Ok(Flow::Normal)
    }

    /// `None` means the loop ran to completion and `else` applies.
    fn exec_while(&mut self, test: &Expr, body: &[Stmt]) -> Result<Option<Flow>, Exception> {
        loop {
            self.tick()?;
            if !self.eval(test)?.truthy() {
                return Ok(None);
            }
            match self.exec_block(body)? {
                Flow::Break => return Ok(Some(Flow::Normal)),
                Flow::Normal | Flow::Continue => {}
                flow @ Flow::Return(_) => return Ok(Some(flow)),
            }
        }
    }

    fn exec_for(
        &mut self,
        target: &Expr,
        iterable: &Value,
        body: &[Stmt],
    ) -> Result<Option<Flow>, Exception> {
        for item in self.iterate(iterable)? {
            self.tick()?;
            self.assign(target, item)?;
            match self.exec_block(body)? {
                Flow::Break => return Ok(Some(Flow::Normal)),
                Flow::Normal | Flow::Continue => {}
                flow @ Flow::Return(_) => return Ok(Some(flow)),
            }
        }
        Ok(None)
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[Handler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
    ) -> Result<Flow, Exception> {
        let outcome = match self.exec_block(body) {
            Ok(Flow::Normal) => self.exec_block(orelse),
            Ok(flow) => Ok(flow),
            Err(err) if !err.kind.is_catchable() => return Err(err),
            Err(err) => self.handle(handlers, err),
        };
        if let Err(err) = &outcome {
            if !err.kind.is_catchable() {
                return outcome;
            }
        }
        if finalbody.is_empty() {
            return outcome;
        }
        match self.exec_block(finalbody)? {
            Flow::Normal => outcome,
            flow => Ok(flow),
        }
    }

    fn handle(&mut self, handlers: &[Handler], err: Exception) -> Result<Flow, Exception> {
        for handler in handlers {
            if let Some(kind) = &handler.kind {
                let kind = self
                    .eval(kind)
                    .map_err(|e| e.at(handler.line, self.scope_name()))?;
                let matched =
                    exception_matches(&kind, err.kind).map_err(|e| e.at(handler.line, self.scope_name()))?;
                if !matched {
                    continue;
                }
            }

            if let Some(name) = &handler.name {
                self.store(name, Value::Exception(Rc::new((err.kind, err.msg.clone()))));
            }
            self.handling.push(err);
            let result = self.exec_block(&handler.body);
            self.handling.pop();
            if let Some(name) = &handler.name {
                self.unbind(name);
            }
            return result;
        }
        Err(err)
    }

    fn raise(&mut self, expr: Option<&Expr>) -> Result<Exception, Exception> {
        let Some(expr) = expr else {
            return Ok(self.handling.last().cloned().unwrap_or_else(|| {
                Exception::new(ErrorKind::RuntimeError, "No active exception to reraise")
            }));
        };
        match self.eval(expr)? {
            Value::ExceptionType(kind) => Ok(Exception::new(kind, "")),
            Value::Exception(exc) => Ok(Exception::new(exc.0, exc.1.clone())),
            _ => Err(Exception::type_error("exceptions must derive from BaseException")),
        }
    }

    fn make_function(&mut self, def: &Rc<FunctionDef>) -> Result<Value, Exception> {
        let mut defaults = Vec::with_capacity(def.params.len());
        for param in &def.params {
            defaults.push(match &param.default {
                Some(expr) => Some(self.eval(expr)?),
                None => None,
            });
        }
        Ok(Value::Function(Rc::new(Function {
            def: def.clone(),
            defaults,
            closure: self.frames.last().map(|frame| frame.locals.clone()),
        })))
    }

    // Names

    fn store(&mut self, name: &str, value: Value) {
        match self.frames.last() {
            Some(frame) if !frame.globals_declared.contains(name) => {
                frame.locals.borrow_mut().vars.insert(name.to_string(), value);
            }
            _ => {
                self.globals.borrow_mut().vars.insert(name.to_string(), value);
            }
        }
    }

    fn unbind(&mut self, name: &str) -> Option<Value> {
        match self.frames.last() {
            Some(frame) if !frame.globals_declared.contains(name) => {
                frame.locals.borrow_mut().vars.remove(name)
            }
            _ => self.globals.borrow_mut().vars.remove(name),
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, Exception> {
        let mut current = match self.frames.last() {
            Some(frame) if !frame.globals_declared.contains(name) => Some(frame.locals.clone()),
            _ => None,
        };
        while let Some(scope) = current {
            let env = scope.borrow();
            if let Some(value) = env.vars.get(name) {
                return Ok(value.clone());
            }
            current = env.parent.clone();
        }
        if let Some(value) = self.globals.borrow().vars.get(name) {
            return Ok(value.clone());
        }
        builtins::lookup(name).ok_or_else(|| {
            Exception::new(
                ErrorKind::NameError,
                format!("name '{}' is not defined", name),
            )
        })
    }

    // Targets

    fn assign(&mut self, target: &Expr, value: Value) -> Result<(), Exception> {
        match target {
            Expr::Name(name) => {
                self.store(name, value);
                Ok(())
            }
            Expr::Tuple(targets) | Expr::List(targets) => {
                let items = self.collect(&value)?;
                if items.len() < targets.len() {
                    return Err(Exception::value_error(format!(
                        "not enough values to unpack (expected {}, got {})",
                        targets.len(),
                        items.len()
                    )));
                }
                if items.len() > targets.len() {
                    return Err(Exception::value_error(format!(
                        "too many values to unpack (expected {})",
                        targets.len()
                    )));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
                Ok(())
            }
            Expr::Subscript { value: container, index } => {
                let container = self.eval(container)?;
                let index = self.eval_index(index)?;
                self.set_item(&container, index, value)
            }
            Expr::Attribute { value: object, attr } => {
                let object = self.eval(object)?;
                Err(read_only(&object, attr))
            }
            _ => Err(Exception::new(ErrorKind::SyntaxError, "cannot assign to expression")),
        }
    }

    fn aug_assign(&mut self, target: &Expr, op: BinOp, value: &Expr) -> Result<(), Exception> {
        match target {
            Expr::Name(name) => {
                let current = self.lookup(name)?;
                let rhs = self.eval(value)?;
                let result = self.inplace(op, current, rhs)?;
                self.store(name, result);
                Ok(())
            }
            Expr::Subscript { value: container, index } => {
                let container = self.eval(container)?;
                let index = self.eval_index(index)?;
                let current = self.get_item(&container, &index)?;
                let rhs = self.eval(value)?;
                let result = self.inplace(op, current, rhs)?;
                self.set_item(&container, index, result)
            }
            Expr::Attribute { value: object, attr } => {
                let object = self.eval(object)?;
                Err(read_only(&object, attr))
            }
            _ => Err(Exception::new(
                ErrorKind::SyntaxError,
                "illegal expression for augmented assignment",
            )),
        }
    }

    /// `+=` on a list extends it in place so aliases observe the change.
    fn inplace(&mut self, op: BinOp, current: Value, rhs: Value) -> Result<Value, Exception> {
        if let (BinOp::Add, Value::List(items)) = (op, &current) {
            let extra = self.collect(&rhs)?;
            self.check_len(items.borrow().len() + extra.len())?;
            items.borrow_mut().extend(extra);
            return Ok(current);
        }
        self.binop(op, &current, &rhs)
    }

    fn delete(&mut self, target: &Expr) -> Result<(), Exception> {
        match target {
            Expr::Name(name) => match self.unbind(name) {
                Some(_) => Ok(()),
                None => Err(Exception::new(
                    ErrorKind::NameError,
                    format!("name '{}' is not defined", name),
                )),
            },
            Expr::Subscript { value, index } => {
                let container = self.eval(value)?;
                let index = self.eval_index(index)?;
                self.del_item(&container, &index)
            }
            Expr::Tuple(targets) | Expr::List(targets) => {
                for target in targets {
                    self.delete(target)?;
                }
                Ok(())
            }
            _ => Err(Exception::new(ErrorKind::SyntaxError, "cannot delete expression")),
        }
    }

    // Expressions

    pub(super) fn eval(&mut self, expr: &Expr) -> Result<Value, Exception> {
        match expr {
            Expr::Constant(constant) => Ok(match constant {
                Constant::None => Value::None,
                Constant::Bool(b) => Value::Bool(*b),
                Constant::Int(i) => Value::Int(*i),
                Constant::Float(f) => Value::Float(*f),
                Constant::Str(s) => Value::str(s),
            }),
            Expr::Name(name) => self.lookup(name),
            Expr::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FStringPart::Literal(text) => out.push_str(text),
                        FStringPart::Field { expr, repr, spec } => {
                            let mut value = self.eval(expr)?;
                            if *repr {
                                value = Value::str(value.repr());
                            }
                            out.push_str(&format_value(&value, spec)?);
                        }
                    }
                    self.check_str_len(out.len())?;
                }
                Ok(Value::str(out))
            }
            Expr::List(items) => {
                let items = self.eval_all(items)?;
                self.check_len(items.len())?;
                Ok(Value::list(items))
            }
            Expr::Tuple(items) => Ok(Value::tuple(self.eval_all(items)?)),
            Expr::Set(items) => {
                let items = self.eval_all(items)?;
                self.build_set(items)
            }
            Expr::Dict(entries) => {
                let mut dict = Dict::default();
                for (key, value) in entries {
                    let key = self.eval(key)?;
                    key.check_hashable()?;
                    let value = self.eval(value)?;
                    dict.insert(key, value);
                }
                self.check_len(dict.len())?;
                Ok(Value::Dict(Rc::new(std::cell::RefCell::new(dict))))
            }
            Expr::BinOp { left, op, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binop(*op, &left, &right)
            }
            Expr::UnaryOp { op, operand } => {
                let operand = self.eval(operand)?;
                unary(*op, &operand)
            }
            Expr::BoolOp { op, values } => {
                let mut result = Value::None;
                for value in values {
                    result = self.eval(value)?;
                    let done = match op {
                        BoolOp::And => !result.truthy(),
                        BoolOp::Or => result.truthy(),
                    };
                    if done {
                        break;
                    }
                }
                Ok(result)
            }
            Expr::Compare { left, ops } => {
                let mut lhs = self.eval(left)?;
                for (op, rhs) in ops {
                    let rhs = self.eval(rhs)?;
                    if !compare_op(*op, &lhs, &rhs)? {
                        return Ok(Value::Bool(false));
                    }
                    lhs = rhs;
                }
                Ok(Value::Bool(true))
            }
            Expr::Call { func, args, kwargs } => {
                let func = self.eval(func)?;
                let args = self.eval_all(args)?;
                let mut evaluated = Vec::with_capacity(kwargs.len());
                for (name, value) in kwargs {
                    evaluated.push((name.clone(), self.eval(value)?));
                }
                self.call(&func, args, evaluated)
            }
            Expr::Attribute { value, attr } => {
                let object = self.eval(value)?;
                get_attr(&object, attr)
            }
            Expr::Subscript { value, index } => {
                let container = self.eval(value)?;
                let index = self.eval_index(index)?;
                self.get_item(&container, &index)
            }
            Expr::Slice { .. } => Err(Exception::type_error(
                "slices are only supported inside subscripts",
            )),
            Expr::IfExp { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::Lambda(def) => self.make_function(def),
            Expr::ListComp { elt, generators } => {
                let mut out = Vec::new();
                self.in_comprehension(|this| {
                    this.run_generators(generators, &mut |this: &mut Interpreter| {
                        out.push(this.eval(elt)?);
                        this.check_len(out.len())
                    })
                })?;
                Ok(Value::list(out))
            }
            Expr::SetComp { elt, generators } => {
                let mut out = Vec::new();
                self.in_comprehension(|this| {
                    this.run_generators(generators, &mut |this: &mut Interpreter| {
                        out.push(this.eval(elt)?);
                        this.check_len(out.len())
                    })
                })?;
                self.build_set(out)
            }
            Expr::DictComp {
                key,
                value,
                generators,
            } => {
                let mut dict = Dict::default();
                self.in_comprehension(|this| {
                    this.run_generators(generators, &mut |this: &mut Interpreter| {
                        let key = this.eval(key)?;
                        key.check_hashable()?;
                        let value = this.eval(value)?;
                        dict.insert(key, value);
                        this.check_len(dict.len())
                    })
                })?;
                Ok(Value::Dict(Rc::new(std::cell::RefCell::new(dict))))
            }
        }
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> Result<Vec<Value>, Exception> {
        exprs.iter().map(|expr| self.eval(expr)).collect()
    }

    fn eval_index(&mut self, index: &Expr) -> Result<Index, Exception> {
        let Expr::Slice { lower, upper, step } = index else {
            return Ok(Index::Item(self.eval(index)?));
        };
        let bound = |this: &mut Self, expr: &Option<Box<Expr>>| -> Result<Option<i64>, Exception> {
            let Some(expr) = expr else {
                return Ok(None);
            };
            match this.eval(expr)? {
                Value::None => Ok(None),
                value => value.as_int().map(Some).ok_or_else(|| {
                    Exception::type_error(
                        "slice indices must be integers or None or have an __index__ method",
                    )
                }),
            }
        };
        let lower = bound(self, lower)?;
        let upper = bound(self, upper)?;
        let step = bound(self, step)?;
        Ok(Index::Slice(lower, upper, step))
    }

    /// Comprehension variables live in their own scope, as in Python 3.
    fn in_comprehension<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, Exception>,
    ) -> Result<T, Exception> {
        let (parent, globals_declared, name) = match self.frames.last() {
            Some(frame) => (
                frame.locals.clone(),
                frame.globals_declared.clone(),
                frame.name.clone(),
            ),
            None => (self.globals.clone(), HashSet::new(), "<module>".to_string()),
        };
        self.frames.push(CallFrame {
            locals: Env::child(Some(parent)),
            globals_declared,
            name,
        });
        let result = body(self);
        self.frames.pop();
        result
    }

    fn run_generators(
        &mut self,
        generators: &[Comprehension],
        emit: &mut dyn FnMut(&mut Self) -> Result<(), Exception>,
    ) -> Result<(), Exception> {
        let Some((first, rest)) = generators.split_first() else {
            return emit(self);
        };
        let iterable = self.eval(&first.iter)?;
        'items: for item in self.iterate(&iterable)? {
            self.tick()?;
            self.assign(&first.target, item)?;
            for condition in &first.ifs {
                if !self.eval(condition)?.truthy() {
                    continue 'items;
                }
            }
            self.run_generators(rest, emit)?;
        }
        Ok(())
    }

    // Calls

    pub(super) fn call(
        &mut self,
        func: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, Exception> {
        self.tick()?;
        match func {
            Value::Function(function) => self.call_function(function, args, kwargs),
            Value::Builtin(name) => builtins::call(self, *name, args, kwargs),
            Value::Method(method) => methods::call(self, &method.receiver, &method.name, args, kwargs),
            Value::ExceptionType(kind) => {
                if !kwargs.is_empty() {
                    return Err(Exception::type_error(format!(
                        "{}() takes no keyword arguments",
                        kind.name()
                    )));
                }
                let msg = match args.len() {
                    0 => String::new(),
                    1 => args[0].to_str(),
                    _ => Value::tuple(args).repr(),
                };
                Ok(Value::Exception(Rc::new((*kind, msg))))
            }
            other => Err(Exception::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_function(
        &mut self,
        function: &Rc<Function>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, Exception> {
        if self.depth >= self.limits.max_recursion_depth {
            return Err(Exception::new(
                ErrorKind::RecursionError,
                "maximum recursion depth exceeded",
            ));
        }
        let locals = bind_arguments(function, args, kwargs)?;

        self.depth += 1;
        let loops = std::mem::take(&mut self.loops);
        self.frames.push(CallFrame {
            locals,
            globals_declared: HashSet::new(),
            name: function.def.name.clone(),
        });
        let result = self.exec_block(&function.def.body);
        self.frames.pop();
        self.loops = loops;
        self.depth -= 1;

        match result {
            Ok(Flow::Return(value)) => Ok(value),
            Ok(_) => Ok(Value::None),
            Err(err) => Err(err.unwind()),
        }
    }

    // Iteration

    pub(super) fn iterate(&self, value: &Value) -> Result<ValueIter, Exception> {
        let items = match value {
            Value::Range { start, stop, step } => {
                return Ok(ValueIter::Range {
                    next: *start,
                    stop: *stop,
                    step: *step,
                });
            }
            Value::List(items) | Value::Set(items) => items.borrow().clone(),
            Value::Tuple(items) => items.to_vec(),
            Value::Str(s) => s.chars().map(|c| Value::str(c.to_string())).collect(),
            Value::Dict(dict) => dict.borrow().keys(),
            other => {
                return Err(Exception::type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                )));
            }
        };
        Ok(ValueIter::Items(items.into_iter()))
    }

    pub(super) fn collect(&self, value: &Value) -> Result<Vec<Value>, Exception> {
        if let Value::Range { start, stop, step } = value {
            self.check_len(usize::try_from(range_len(*start, *stop, *step)).unwrap_or(usize::MAX))?;
        }
        Ok(self.iterate(value)?.collect())
    }

    pub(super) fn build_set(&self, items: Vec<Value>) -> Result<Value, Exception> {
        let mut unique: Vec<Value> = Vec::with_capacity(items.len());
        for item in items {
            item.check_hashable()?;
            if !unique.iter().any(|existing| values_equal(existing, &item)) {
                unique.push(item);
            }
        }
        self.check_len(unique.len())?;
        Ok(Value::Set(Rc::new(std::cell::RefCell::new(unique))))
    }

    // Subscripts

    pub(super) fn get_item(&self, container: &Value, index: &Index) -> Result<Value, Exception> {
        match (container, index) {
            (Value::List(items), Index::Item(i)) => {
                let items = items.borrow();
                Ok(items[position(i, items.len(), "list")?].clone())
            }
            (Value::List(items), Index::Slice(lower, upper, step)) => {
                let items = items.borrow();
                let picked = slice_indices(items.len(), *lower, *upper, *step)?;
                Ok(Value::list(picked.into_iter().map(|i| items[i].clone()).collect()))
            }
            (Value::Tuple(items), Index::Item(i)) => {
                Ok(items[position(i, items.len(), "tuple")?].clone())
            }
            (Value::Tuple(items), Index::Slice(lower, upper, step)) => {
                let picked = slice_indices(items.len(), *lower, *upper, *step)?;
                Ok(Value::tuple(picked.into_iter().map(|i| items[i].clone()).collect()))
            }
            (Value::Str(s), Index::Item(i)) => {
                let chars: Vec<char> = s.chars().collect();
                let at = position(i, chars.len(), "string")?;
                Ok(Value::str(chars[at].to_string()))
            }
            (Value::Str(s), Index::Slice(lower, upper, step)) => {
                let chars: Vec<char> = s.chars().collect();
                let picked = slice_indices(chars.len(), *lower, *upper, *step)?;
                Ok(Value::str(picked.into_iter().map(|i| chars[i]).collect::<String>()))
            }
            (Value::Range { start, stop, step }, Index::Item(i)) => {
                let len = usize::try_from(range_len(*start, *stop, *step)).unwrap_or(usize::MAX);
                let at = position(i, len, "range object")? as i64;
                Ok(Value::Int(start + at * step))
            }
            (Value::Range { .. }, Index::Slice(..)) => {
                let items = self.collect(container)?;
                self.get_item(&Value::list(items), index)
            }
            (Value::Dict(dict), Index::Item(key)) => {
                key.check_hashable()?;
                dict.borrow().get(key).cloned().ok_or_else(|| key_error(key))
            }
            (Value::Dict(_), Index::Slice(..)) => {
                Err(Exception::type_error("unhashable type: 'slice'"))
            }
            (other, _) => Err(Exception::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    fn set_item(&mut self, container: &Value, index: Index, value: Value) -> Result<(), Exception> {
        match (container, index) {
            (Value::List(items), Index::Item(i)) => {
                let mut items = items.borrow_mut();
                let len = items.len();
                let at = position(&i, len, "list assignment")?;
                items[at] = value;
                Ok(())
            }
            (Value::List(items), Index::Slice(lower, upper, step)) => {
                let replacement = self.collect(&value)?;
                let mut items = items.borrow_mut();
                let len = items.len();
                if step.unwrap_or(1) == 1 {
                    let (start, stop) = simple_bounds(len, lower, upper);
                    self.check_len(len - (stop - start) + replacement.len())?;
                    let _replaced: Vec<Value> = items.splice(start..stop, replacement).collect();
                    return Ok(());
                }
                let picked = slice_indices(len, lower, upper, step)?;
                if picked.len() != replacement.len() {
                    return Err(Exception::value_error(format!(
                        "attempt to assign sequence of size {} to extended slice of size {}",
                        replacement.len(),
                        picked.len()
                    )));
                }
                for (at, item) in picked.into_iter().zip(replacement) {
                    items[at] = item;
                }
                Ok(())
            }
            (Value::Dict(dict), Index::Item(key)) => {
                key.check_hashable()?;
                let mut dict = dict.borrow_mut();
                dict.insert(key, value);
                self.check_len(dict.len())
            }
            (other, _) => Err(Exception::type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    fn del_item(&mut self, container: &Value, index: &Index) -> Result<(), Exception> {
        match (container, index) {
            (Value::List(items), Index::Item(i)) => {
                let mut items = items.borrow_mut();
                let len = items.len();
                let at = position(i, len, "list assignment")?;
                items.remove(at);
                Ok(())
            }
            (Value::List(items), Index::Slice(lower, upper, step)) => {
                let mut items = items.borrow_mut();
                let mut picked = slice_indices(items.len(), *lower, *upper, *step)?;
                picked.sort_unstable_by(|a, b| b.cmp(a));
                for at in picked {
                    items.remove(at);
                }
                Ok(())
            }
            (Value::Dict(dict), Index::Item(key)) => {
                key.check_hashable()?;
                dict.borrow_mut()
                    .remove(key)
                    .map(|_| ())
                    .ok_or_else(|| key_error(key))
            }
            (other, _) => Err(Exception::type_error(format!(
                "'{}' object doesn't support item deletion",
                other.type_name()
            ))),
        }
    }

    // Operators

    pub(super) fn binop(&self, op: BinOp, a: &Value, b: &Value) -> Result<Value, Exception> {
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
            return int_binop(op, x, y);
        }
        if let (Some(x), Some(y)) = (a.as_float(), b.as_float()) {
            return float_binop(op, x, y).unwrap_or_else(|| Err(unsupported(op, a, b)));
        }

        match (op, a, b) {
            (BinOp::Add, Value::Str(x), Value::Str(y)) => {
                self.check_str_len(x.len() + y.len())?;
                Ok(Value::str(format!("{}{}", x, y)))
            }
            (BinOp::Add, Value::List(x), Value::List(y)) => {
                let mut items = x.borrow().clone();
                items.extend(y.borrow().iter().cloned());
                self.check_len(items.len())?;
                Ok(Value::list(items))
            }
            (BinOp::Add, Value::Tuple(x), Value::Tuple(y)) => {
                self.check_len(x.len() + y.len())?;
                Ok(Value::tuple(x.iter().chain(y.iter()).cloned().collect()))
            }
            (BinOp::Add, Value::Str(_) | Value::List(_) | Value::Tuple(_), other) => {
                Err(Exception::type_error(format!(
                    "can only concatenate {} (not \"{}\") to {}",
                    a.type_name(),
                    other.type_name(),
                    a.type_name()
                )))
            }
            (BinOp::Mul, seq @ (Value::Str(_) | Value::List(_) | Value::Tuple(_)), count)
            | (BinOp::Mul, count, seq @ (Value::Str(_) | Value::List(_) | Value::Tuple(_)))
                if count.as_int().is_some() =>
            {
                let times = usize::try_from(count.as_int().unwrap_or(0).max(0)).unwrap_or(0);
                self.repeat(seq, times)
            }
            (BinOp::Mod, Value::Str(template), args) => Ok(Value::str(percent_format(template, args)?)),
            (BinOp::Sub | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor, Value::Set(x), Value::Set(y)) => {
                let (x, y) = (x.borrow(), y.borrow());
                let in_y = |item: &Value| y.iter().any(|other| values_equal(item, other));
                let in_x = |item: &Value| x.iter().any(|other| values_equal(item, other));
                let items: Vec<Value> = match op {
                    BinOp::Sub => x.iter().filter(|item| !in_y(*item)).cloned().collect(),
                    BinOp::BitAnd => x.iter().filter(|item| in_y(*item)).cloned().collect(),
                    BinOp::BitOr => x
                        .iter()
                        .cloned()
                        .chain(y.iter().filter(|item| !in_x(*item)).cloned())
                        .collect(),
                    _ => x
                        .iter()
                        .filter(|item| !in_y(*item))
                        .cloned()
                        .chain(y.iter().filter(|item| !in_x(*item)).cloned())
                        .collect(),
                };
                self.check_len(items.len())?;
                Ok(Value::Set(Rc::new(std::cell::RefCell::new(items))))
            }
            (BinOp::BitOr, Value::Dict(x), Value::Dict(y)) => {
                let mut merged = x.borrow().clone();
                for (key, value) in &y.borrow().entries {
                    merged.insert(key.clone(), value.clone());
                }
                self.check_len(merged.len())?;
                Ok(Value::Dict(Rc::new(std::cell::RefCell::new(merged))))
            }
            _ => Err(unsupported(op, a, b)),
        }
    }

    fn repeat(&self, seq: &Value, times: usize) -> Result<Value, Exception> {
        match seq {
            Value::Str(s) => {
                self.check_str_len(s.len().saturating_mul(times))?;
                Ok(Value::str(s.repeat(times)))
            }
            Value::List(items) => {
                let items = items.borrow();
                self.check_len(items.len().saturating_mul(times))?;
                Ok(Value::list(
                    std::iter::repeat_n(items.iter(), times).flatten().cloned().collect(),
                ))
            }
            Value::Tuple(items) => {
                self.check_len(items.len().saturating_mul(times))?;
                Ok(Value::tuple(
                    std::iter::repeat_n(items.iter(), times).flatten().cloned().collect(),
                ))
            }
            other => Err(Exception::type_error(format!(
                "can't multiply sequence by non-int of type '{}'",
                other.type_name()
            ))),
        }
    }
}

fn import(module: &str) -> Result<Value, Exception> {
    if module == "math" {
        return Ok(Value::Module(Module::Math));
    }
    Err(Exception::new(
        ErrorKind::ImportError,
        format!("module '{}' is not available in the sandbox", module),
    ))
}

fn read_only(object: &Value, attr: &str) -> Exception {
    Exception::new(
        ErrorKind::AttributeError,
        format!(
            "'{}' object attribute '{}' is read-only",
            object.type_name(),
            attr
        ),
    )
}

fn exception_matches(kind: &Value, raised: ErrorKind) -> Result<bool, Exception> {
    match kind {
        Value::ExceptionType(kind) => Ok(raised.is_subclass_of(*kind)),
        Value::Tuple(kinds) => {
            for kind in kinds.iter() {
                if exception_matches(kind, raised)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(Exception::type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

pub(super) fn get_attr(object: &Value, attr: &str) -> Result<Value, Exception> {
    match object {
        Value::Module(Module::Math) => builtins::math_attr(attr).ok_or_else(|| {
            Exception::new(
                ErrorKind::AttributeError,
                format!("module 'math' has no attribute '{}'", attr),
            )
        }),
        Value::Exception(exc) if attr == "args" => Ok(Value::tuple(if exc.1.is_empty() {
            Vec::new()
        } else {
            vec![Value::str(&exc.1)]
        })),
        _ if methods::has_method(object, attr) => Ok(Value::Method(Rc::new(BoundMethod {
            receiver: object.clone(),
            name: attr.to_string(),
        }))),
        _ => Err(Exception::new(
            ErrorKind::AttributeError,
            format!("'{}' object has no attribute '{}'", object.type_name(), attr),
        )),
    }
}

fn bind_arguments(
    function: &Function,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Scope, Exception> {
    let def = &function.def;
    let params = &def.params;
    let required = function.defaults.iter().filter(|d| d.is_none()).count();

    if args.len() > params.len() {
        let expected = if required == params.len() {
            format!("{}", params.len())
        } else {
            format!("from {} to {}", required, params.len())
        };
        return Err(Exception::type_error(format!(
            "{}() takes {} positional argument{} but {} {} given",
            def.name,
            expected,
            if params.len() == 1 { "" } else { "s" },
            args.len(),
            if args.len() == 1 { "was" } else { "were" }
        )));
    }

    let mut slots: Vec<Option<Value>> = vec![None; params.len()];
    for (slot, arg) in slots.iter_mut().zip(args) {
        *slot = Some(arg);
    }
    for (key, value) in kwargs {
        let Some(at) = params.iter().position(|param| param.name == key) else {
            return Err(Exception::type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                def.name, key
            )));
        };
        if slots[at].is_some() {
            return Err(Exception::type_error(format!(
                "{}() got multiple values for argument '{}'",
                def.name, key
            )));
        }
        slots[at] = Some(value);
    }

    let mut missing = Vec::new();
    for (at, slot) in slots.iter_mut().enumerate() {
        if slot.is_none() {
            match &function.defaults[at] {
                Some(default) => *slot = Some(default.clone()),
                None => missing.push(format!("'{}'", params[at].name)),
            }
        }
    }
    if !missing.is_empty() {
        let names = match missing.len() {
            1 => missing[0].clone(),
            2 => format!("{} and {}", missing[0], missing[1]),
            n => format!("{}, and {}", missing[..n - 1].join(", "), missing[n - 1]),
        };
        return Err(Exception::type_error(format!(
            "{}() missing {} required positional argument{}: {}",
            def.name,
            missing.len(),
            if missing.len() == 1 { "" } else { "s" },
            names
        )));
    }

    let locals = Env::child(function.closure.clone());
    {
        let mut env = locals.borrow_mut();
        for (param, value) in params.iter().zip(slots) {
            env.vars.insert(param.name.clone(), value.unwrap_or(Value::None));
        }
    }
    Ok(locals)
}

fn position(index: &Value, len: usize, what: &str) -> Result<usize, Exception> {
    let Some(i) = index.as_int() else {
        let owner = what.split(' ').next().unwrap_or(what);
        return Err(Exception::type_error(format!(
            "{} indices must be integers or slices, not {}",
            owner,
            index.type_name()
        )));
    };
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let at = if i < 0 { i + len } else { i };
    if at < 0 || at >= len {
        return Err(Exception::new(
            ErrorKind::IndexError,
            format!("{} index out of range", what),
        ));
    }
    Ok(at as usize)
}

fn simple_bounds(len: usize, lower: Option<i64>, upper: Option<i64>) -> (usize, usize) {
    let len = len as i64;
    let norm = |v: i64| (if v < 0 { v + len } else { v }).clamp(0, len);
    let start = lower.map(norm).unwrap_or(0);
    let stop = upper.map(norm).unwrap_or(len).max(start);
    (start as usize, stop as usize)
}

pub(super) fn slice_indices(
    len: usize,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> Result<Vec<usize>, Exception> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(Exception::value_error("slice step cannot be zero"));
    }
    let len = len as i64;
    let norm = |v: i64| if v < 0 { v + len } else { v };

    let mut picked = Vec::new();
    if step > 0 {
        let start = lower.map(|v| norm(v).clamp(0, len)).unwrap_or(0);
        let stop = upper.map(|v| norm(v).clamp(0, len)).unwrap_or(len);
        let mut i = start;
        while i < stop {
            picked.push(i as usize);
            let Some(next) = i.checked_add(step) else {
                break;
            };
            i = next;
        }
    } else {
        let start = lower.map(|v| norm(v).clamp(-1, len - 1)).unwrap_or(len - 1);
        let stop = upper.map(|v| norm(v).clamp(-1, len - 1)).unwrap_or(-1);
        let mut i = start;
        while i > stop {
            picked.push(i as usize);
            let Some(next) = i.checked_add(step) else {
                break;
            };
            i = next;
        }
    }
    Ok(picked)
}

fn unsupported(op: BinOp, a: &Value, b: &Value) -> Exception {
    Exception::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        a.type_name(),
        b.type_name()
    ))
}

fn overflow() -> Exception {
    Exception::new(
        ErrorKind::OverflowError,
        "integer result does not fit in 64 bits",
    )
}

fn int_binop(op: BinOp, x: i64, y: i64) -> Result<Value, Exception> {
    let zero_division = |msg: &str| Exception::new(ErrorKind::ZeroDivisionError, msg);
    let result = match op {
        BinOp::Add => x.checked_add(y).ok_or_else(overflow)?,
        BinOp::Sub => x.checked_sub(y).ok_or_else(overflow)?,
        BinOp::Mul => x.checked_mul(y).ok_or_else(overflow)?,
        BinOp::Div => {
            if y == 0 {
                return Err(zero_division("division by zero"));
            }
            return Ok(Value::Float(x as f64 / y as f64));
        }
        BinOp::FloorDiv => {
            if y == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            floor_div(x, y)?
        }
        BinOp::Mod => {
            if y == 0 {
                return Err(zero_division("integer modulo by zero"));
            }
            floor_mod(x, y)
        }
        BinOp::Pow => {
            if y < 0 {
                if x == 0 {
                    return Err(zero_division("0.0 cannot be raised to a negative power"));
                }
                return Ok(Value::Float((x as f64).powf(y as f64)));
            }
            let exponent = u32::try_from(y).map_err(|_| overflow())?;
            x.checked_pow(exponent).ok_or_else(overflow)?
        }
        BinOp::BitAnd => x & y,
        BinOp::BitOr => x | y,
        BinOp::BitXor => x ^ y,
        BinOp::LShift => {
            if y < 0 {
                return Err(Exception::value_error("negative shift count"));
            }
            if x == 0 {
                0
            } else if y >= 63 {
                return Err(overflow());
            } else {
                let shifted = x << y;
                if shifted >> y != x {
                    return Err(overflow());
                }
                shifted
            }
        }
        BinOp::RShift => {
            if y < 0 {
                return Err(Exception::value_error("negative shift count"));
            }
            if y >= 64 {
                if x < 0 { -1 } else { 0 }
            } else {
                x >> y
            }
        }
    };
    Ok(Value::Int(result))
}

pub(super) fn floor_div(x: i64, y: i64) -> Result<i64, Exception> {
    let quotient = x.checked_div(y).ok_or_else(overflow)?;
    if x % y != 0 && ((x < 0) != (y < 0)) {
        Ok(quotient - 1)
    } else {
        Ok(quotient)
    }
}

pub(super) fn floor_mod(x: i64, y: i64) -> i64 {
    let remainder = x.wrapping_rem(y);
    if remainder != 0 && ((remainder < 0) != (y < 0)) {
        remainder + y
    } else {
        remainder
    }
}

/// Python's float `divmod`.
pub(super) fn float_divmod(x: f64, y: f64) -> (f64, f64) {
    let mut modulo = x % y;
    let mut div = (x - modulo) / y;
    if modulo != 0.0 {
        if (y < 0.0) != (modulo < 0.0) {
            modulo += y;
            div -= 1.0;
        }
    } else {
        modulo = 0.0_f64.copysign(y);
    }
    let floored = if div != 0.0 {
        let floored = div.floor();
        if div - floored > 0.5 { floored + 1.0 } else { floored }
    } else {
        0.0_f64.copysign(x / y)
    };
    (floored, modulo)
}

/// `None` when the operator has no float meaning.
fn float_binop(op: BinOp, x: f64, y: f64) -> Option<Result<Value, Exception>> {
    let zero_division = |msg: &str| Err(Exception::new(ErrorKind::ZeroDivisionError, msg));
    let result = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Some(zero_division("float division by zero"));
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Some(zero_division("float floor division by zero"));
            }
            float_divmod(x, y).0
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Some(zero_division("float modulo by zero"));
            }
            float_divmod(x, y).1
        }
        BinOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Some(zero_division("0.0 cannot be raised to a negative power"));
            }
            if x < 0.0 && y.fract() != 0.0 {
                return Some(Err(Exception::value_error(
                    "negative number cannot be raised to a fractional power",
                )));
            }
            x.powf(y)
        }
        _ => return None,
    };
    Some(Ok(Value::Float(result)))
}

fn unary(op: UnaryOp, operand: &Value) -> Result<Value, Exception> {
    let bad = |symbol: &str| {
        Exception::type_error(format!(
            "bad operand type for unary {}: '{}'",
            symbol,
            operand.type_name()
        ))
    };
    match (op, operand) {
        (UnaryOp::Not, value) => Ok(Value::Bool(!value.truthy())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, value) => value
            .as_int()
            .ok_or_else(|| bad("-"))
            .and_then(|i| i.checked_neg().ok_or_else(overflow))
            .map(Value::Int),
        (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (UnaryOp::Pos, value) => value.as_int().map(Value::Int).ok_or_else(|| bad("+")),
        (UnaryOp::Invert, value) => value
            .as_int()
            .map(|i| Value::Int(!i))
            .ok_or_else(|| bad("~")),
    }
}

fn compare_op(op: CmpOp, a: &Value, b: &Value) -> Result<bool, Exception> {
    match op {
        CmpOp::Eq => Ok(values_equal(a, b)),
        CmpOp::NotEq => Ok(!values_equal(a, b)),
        CmpOp::Lt => less_than(a, b),
        CmpOp::Gt => less_than(b, a).map_err(|_| ordering_error(op, a, b)),
        CmpOp::LtE | CmpOp::GtE => {
            if let (Some(x), Some(y)) = (a.as_float(), b.as_float()) {
                if x.is_nan() || y.is_nan() {
                    return Ok(false);
                }
            }
            let ordering = compare(a, b, op.symbol())?;
            Ok(if op == CmpOp::LtE {
                ordering.is_le()
            } else {
                ordering.is_ge()
            })
        }
        CmpOp::In => contains(b, a),
        CmpOp::NotIn => contains(b, a).map(|found| !found),
        CmpOp::Is => Ok(is_same(a, b)),
        CmpOp::IsNot => Ok(!is_same(a, b)),
    }
}

fn ordering_error(op: CmpOp, a: &Value, b: &Value) -> Exception {
    Exception::type_error(format!(
        "'{}' not supported between instances of '{}' and '{}'",
        op.symbol(),
        a.type_name(),
        b.type_name()
    ))
}

pub(super) fn contains(container: &Value, item: &Value) -> Result<bool, Exception> {
    match container {
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(needle.as_ref())),
            other => Err(Exception::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) | Value::Set(items) => {
            Ok(items.borrow().iter().any(|candidate| values_equal(candidate, item)))
        }
        Value::Tuple(items) => Ok(items.iter().any(|candidate| values_equal(candidate, item))),
        Value::Dict(dict) => {
            item.check_hashable()?;
            Ok(dict.borrow().get(item).is_some())
        }
        Value::Range { start, stop, step } => {
            let i = match item {
                Value::Float(f) if f.fract() == 0.0 => *f as i64,
                other => match other.as_int() {
                    Some(i) => i,
                    None => return Ok(false),
                },
            };
            let (i, start, stop, step) = (i as i128, *start as i128, *stop as i128, *step as i128);
            let inside = if step > 0 {
                start <= i && i < stop
            } else {
                stop < i && i <= start
            };
            Ok(inside && (i - start) % step == 0)
        }
        other => Err(Exception::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_integer_division() {
        assert_eq!(floor_div(7, 2).unwrap(), 3);
        assert_eq!(floor_div(-7, 2).unwrap(), -4);
        assert_eq!(floor_mod(-7, 2), 1);
        assert_eq!(floor_mod(7, -2), -1);
        assert!(floor_div(i64::MIN, -1).is_err());
        assert_eq!(float_divmod(-7.5, 2.0), (-4.0, 0.5));
    }

    #[test]
    fn test_slice_indices() {
        assert_eq!(slice_indices(5, None, None, None).unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(slice_indices(5, Some(1), Some(-1), None).unwrap(), vec![1, 2, 3]);
        assert_eq!(slice_indices(5, None, None, Some(-1)).unwrap(), vec![4, 3, 2, 1, 0]);
        assert_eq!(slice_indices(5, Some(-2), None, Some(-2)).unwrap(), vec![3, 1]);
        assert_eq!(slice_indices(3, Some(10), Some(20), None).unwrap(), Vec::<usize>::new());
        assert!(slice_indices(3, None, None, Some(0)).is_err());
    }

    #[test]
    fn test_slice_indices_with_extreme_steps() {
        assert_eq!(slice_indices(3, Some(2), None, Some(i64::MAX)).unwrap(), vec![2]);
        assert_eq!(slice_indices(3, None, None, Some(i64::MIN)).unwrap(), vec![2]);
        assert_eq!(slice_indices(3, Some(0), None, Some(i64::MIN + 1)).unwrap(), vec![0]);
    }

    #[test]
    fn test_range_membership() {
        let range = Value::Range {
            start: 0,
            stop: 10,
            step: 3,
        };
        assert!(contains(&range, &Value::Int(9)).unwrap());
        assert!(!contains(&range, &Value::Int(10)).unwrap());
        assert!(!contains(&range, &Value::Int(4)).unwrap());
    }

    #[test]
    fn test_int_overflow_is_an_error() {
        let err = int_binop(BinOp::Mul, i64::MAX, 2).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OverflowError);
        let err = int_binop(BinOp::Mod, 1, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ZeroDivisionError);
    }
}
