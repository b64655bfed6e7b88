use std::rc::Rc;

use super::{
    ast::{
        BinOp, BoolOp, CmpOp, Comprehension, Constant, Expr, FStringPart, FunctionDef, Handler,
        Param, Stmt, StmtKind, UnaryOp,
    },
    error::{ErrorKind, Exception},
    lexer::{Tok, Token, tokenize},
};

const MAX_NESTING: usize = 200;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

pub fn parse(source: &str) -> Result<Vec<Stmt>, Exception> {
    let tokens = tokenize(source)?;
    Parser::new(tokens).program()
}

/// Parses a single expression, as found inside an f-string field.
pub fn parse_expression(source: &str, line: usize) -> Result<Expr, Exception> {
    let mut tokens = tokenize(source.trim()).map_err(|e| relocate(e, line))?;
    for token in tokens.iter_mut() {
        token.line = line;
    }
    let mut parser = Parser::new(tokens);
    let expr = parser.testlist()?;
    parser.eat(&Tok::Newline);
    if !parser.check(&Tok::Eof) {
        return Err(parser.error("f-string: invalid syntax"));
    }
    Ok(expr)
}

fn relocate(mut err: Exception, line: usize) -> Exception {
    for frame in err.traceback.iter_mut() {
        frame.line = line;
    }
    err
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> &Tok {
        self.tokens
            .get(self.pos)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn peek_next(&self) -> &Tok {
        self.tokens
            .get(self.pos + 1)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.check(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn check_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.check_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), Exception> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", op)))
        }
    }

    fn check_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.check_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<(), Exception> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", kw)))
        }
    }

    fn expect_name(&mut self) -> Result<String, Exception> {
        match self.peek().clone() {
            Tok::Name(name) if !KEYWORDS.contains(&name.as_str()) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error("invalid syntax")),
        }
    }

    fn error(&self, msg: impl Into<String>) -> Exception {
        Exception::syntax(self.line(), msg)
    }

    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, Exception>,
    ) -> Result<T, Exception> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("too many nested expressions or blocks"));
        }
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn starts_expr(&self) -> bool {
        match self.peek() {
            Tok::Name(name) => {
                !KEYWORDS.contains(&name.as_str())
                    || matches!(
                        name.as_str(),
                        "None" | "True" | "False" | "not" | "lambda"
                    )
            }
            Tok::Int(_) | Tok::Float(_) | Tok::Str(_) | Tok::FStr(_) => true,
            Tok::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+" | "~"),
            _ => false,
        }
    }

    // Statements

    fn program(mut self) -> Result<Vec<Stmt>, Exception> {
        let mut body = Vec::new();
        while !self.check(&Tok::Eof) {
            if self.eat(&Tok::Newline) {
                continue;
            }
            if self.check(&Tok::Indent) {
                return Err(Exception::syntax_kind(
                    ErrorKind::IndentationError,
                    self.line(),
                    "unexpected indent",
                ));
            }
            body.extend(self.statement()?);
        }
        Ok(body)
    }

    fn statement(&mut self) -> Result<Vec<Stmt>, Exception> {
        let line = self.line();
        let keyword = match self.peek() {
            Tok::Name(name) => name.clone(),
            _ => return self.simple_stmt(),
        };
        let kind = match keyword.as_str() {
            "if" => self.if_stmt()?,
            "while" => self.while_stmt()?,
            "for" => self.for_stmt()?,
            "def" => self.def_stmt()?,
            "try" => self.try_stmt()?,
            "class" | "with" | "async" | "yield" | "await" | "nonlocal" => {
                return Err(self.error(format!(
                    "'{}' is not supported in the sandbox",
                    keyword
                )));
            }
            _ => return self.simple_stmt(),
        };
        Ok(vec![Stmt { line, kind }])
    }

    fn block(&mut self) -> Result<Vec<Stmt>, Exception> {
        self.expect_op(":")?;
        if !self.eat(&Tok::Newline) {
            return self.simple_stmt();
        }
        if !self.eat(&Tok::Indent) {
            return Err(Exception::syntax_kind(
                ErrorKind::IndentationError,
                self.line(),
                "expected an indented block",
            ));
        }
        self.nested(|p| {
            let mut body = Vec::new();
            loop {
                if p.eat(&Tok::Dedent) || p.check(&Tok::Eof) {
                    break;
                }
                if p.eat(&Tok::Newline) {
                    continue;
                }
                body.extend(p.statement()?);
            }
            Ok(body)
        })
    }

    fn else_block(&mut self) -> Result<Vec<Stmt>, Exception> {
        if self.eat_kw("else") {
            self.block()
        } else {
            Ok(Vec::new())
        }
    }

    fn if_stmt(&mut self) -> Result<StmtKind, Exception> {
        self.advance();
        let test = self.test()?;
        let body = self.block()?;
        let mut branches = vec![(test, body)];
        while self.eat_kw("elif") {
            let test = self.test()?;
            let body = self.block()?;
            branches.push((test, body));
        }
        let orelse = self.else_block()?;
        Ok(StmtKind::If { branches, orelse })
    }

    fn while_stmt(&mut self) -> Result<StmtKind, Exception> {
        self.advance();
        let test = self.test()?;
        let body = self.block()?;
        let orelse = self.else_block()?;
        Ok(StmtKind::While { test, body, orelse })
    }

    fn for_stmt(&mut self) -> Result<StmtKind, Exception> {
        self.advance();
        let target = self.target_list()?;
        self.expect_kw("in")?;
        let iter = self.testlist()?;
        let body = self.block()?;
        let orelse = self.else_block()?;
        Ok(StmtKind::For {
            target,
            iter,
            body,
            orelse,
        })
    }

    fn def_stmt(&mut self) -> Result<StmtKind, Exception> {
        self.advance();
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.params(")")?;
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.test()?;
        }
        let body = self.block()?;
        Ok(StmtKind::FunctionDef(Rc::new(FunctionDef { name, params, body })))
    }

    fn params(&mut self, close: &str) -> Result<Vec<Param>, Exception> {
        let mut params: Vec<Param> = Vec::new();
        while !self.check_op(close) {
            if self.check_op("*") || self.check_op("**") || self.check_op("/") {
                return Err(self.error("variadic and positional-only parameters are not supported"));
            }
            let name = self.expect_name()?;
            if params.iter().any(|p| p.name == name) {
                return Err(self.error(format!(
                    "duplicate argument '{}' in function definition",
                    name
                )));
            }
            if close == ")" && self.eat_op(":") {
                self.test()?;
            }
            let default = if self.eat_op("=") {
                Some(self.test()?)
            } else {
                None
            };
            if default.is_none() && params.iter().any(|p| p.default.is_some()) {
                return Err(self.error("non-default argument follows default argument"));
            }
            params.push(Param { name, default });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    fn try_stmt(&mut self) -> Result<StmtKind, Exception> {
        self.advance();
        let body = self.block()?;
        let mut handlers = Vec::new();
        while self.check_kw("except") {
            let line = self.line();
            self.advance();
            let kind = if self.check_op(":") {
                None
            } else {
                Some(self.test()?)
            };
            let name = if self.eat_kw("as") {
                Some(self.expect_name()?)
            } else {
                None
            };
            let body = self.block()?;
            handlers.push(Handler {
                line,
                kind,
                name,
                body,
            });
        }
        let orelse = if handlers.is_empty() {
            Vec::new()
        } else {
            self.else_block()?
        };
        let finalbody = if self.eat_kw("finally") {
            self.block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.error("expected 'except' or 'finally' block"));
        }
        Ok(StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        })
    }

    fn simple_stmt(&mut self) -> Result<Vec<Stmt>, Exception> {
        let mut stmts = vec![self.small_stmt()?];
        while self.eat_op(";") {
            if self.check(&Tok::Newline) || self.check(&Tok::Eof) {
                break;
            }
            stmts.push(self.small_stmt()?);
        }
        if !self.eat(&Tok::Newline) && !self.check(&Tok::Eof) {
            return Err(self.error("invalid syntax"));
        }
        Ok(stmts)
    }

    fn at_stmt_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof) || self.check_op(";")
    }

    fn small_stmt(&mut self) -> Result<Stmt, Exception> {
        let line = self.line();
        let keyword = match self.peek() {
            Tok::Name(name) => Some(name.clone()),
            _ => None,
        };
        let kind = match keyword.as_deref() {
            Some("pass") => {
                self.advance();
                StmtKind::Pass
            }
            Some("break") => {
                self.advance();
                StmtKind::Break
            }
            Some("continue") => {
                self.advance();
                StmtKind::Continue
            }
            Some("return") => {
                self.advance();
                if self.at_stmt_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.testlist()?))
                }
            }
            Some("global") => {
                self.advance();
                let mut names = vec![self.expect_name()?];
                while self.eat_op(",") {
                    names.push(self.expect_name()?);
                }
                StmtKind::Global(names)
            }
            Some("import") => {
                self.advance();
                let module = self.dotted_name()?;
                let alias = if self.eat_kw("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                if self.check_op(",") {
                    return Err(self.error("import one module per statement"));
                }
                StmtKind::Import { module, alias }
            }
            Some("from") => {
                self.advance();
                let module = self.dotted_name()?;
                self.expect_kw("import")?;
                let names = self.import_names()?;
                StmtKind::ImportFrom { module, names }
            }
            Some("raise") => {
                self.advance();
                if self.at_stmt_end() {
                    StmtKind::Raise(None)
                } else {
                    let exc = self.test()?;
                    if self.check_kw("from") {
                        return Err(self.error("'raise ... from' is not supported"));
                    }
                    StmtKind::Raise(Some(exc))
                }
            }
            Some("assert") => {
                self.advance();
                let test = self.test()?;
                let msg = if self.eat_op(",") {
                    Some(self.test()?)
                } else {
                    None
                };
                StmtKind::Assert { test, msg }
            }
            Some("del") => {
                self.advance();
                let mut targets = vec![self.bitor()?];
                while self.eat_op(",") {
                    targets.push(self.bitor()?);
                }
                for target in &targets {
                    self.validate_target(target)?;
                }
                StmtKind::Del(targets)
            }
            _ => self.expr_stmt()?,
        };
        Ok(Stmt { line, kind })
    }

    fn dotted_name(&mut self) -> Result<String, Exception> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn import_names(&mut self) -> Result<Vec<(String, Option<String>)>, Exception> {
        if self.eat_op("*") {
            return Ok(vec![("*".to_string(), None)]);
        }
        let parens = self.eat_op("(");
        let mut names = Vec::new();
        loop {
            let name = self.expect_name()?;
            let alias = if self.eat_kw("as") {
                Some(self.expect_name()?)
            } else {
                None
            };
            names.push((name, alias));
            if !self.eat_op(",") {
                break;
            }
            if parens && self.check_op(")") {
                break;
            }
        }
        if parens {
            self.expect_op(")")?;
        }
        Ok(names)
    }

    fn expr_stmt(&mut self) -> Result<StmtKind, Exception> {
        let first = self.testlist()?;

        let augmented = match self.peek() {
            Tok::Op(op) => BinOp::from_augmented(op),
            _ => None,
        };
        if let Some(bin_op) = augmented {
            self.advance();
            if !matches!(
                first,
                Expr::Name(_) | Expr::Subscript { .. } | Expr::Attribute { .. }
            ) {
                return Err(self.error("illegal expression for augmented assignment"));
            }
            let value = self.testlist()?;
            return Ok(StmtKind::AugAssign {
                target: first,
                op: bin_op,
                value,
            });
        }

        if self.check_op(":") && matches!(first, Expr::Name(_) | Expr::Subscript { .. }) {
            self.advance();
            self.test()?;
            if !self.eat_op("=") {
                return Ok(StmtKind::Pass);
            }
            let value = self.testlist()?;
            self.validate_target(&first)?;
            return Ok(StmtKind::Assign {
                targets: vec![first],
                value,
            });
        }

        if self.check_op("=") {
            let mut exprs = vec![first];
            while self.eat_op("=") {
                exprs.push(self.testlist()?);
            }
            let value = exprs.pop().unwrap_or(Expr::Constant(Constant::None));
            for target in &exprs {
                self.validate_target(target)?;
            }
            return Ok(StmtKind::Assign {
                targets: exprs,
                value,
            });
        }

        if self.check_op(":=") {
            return Err(self.error("assignment expressions are not supported"));
        }

        Ok(StmtKind::Expr(first))
    }

    fn validate_target(&self, target: &Expr) -> Result<(), Exception> {
        match target {
            Expr::Name(_) | Expr::Subscript { .. } | Expr::Attribute { .. } => Ok(()),
            Expr::Tuple(items) | Expr::List(items) => {
                items.iter().try_for_each(|item| self.validate_target(item))
            }
            Expr::Constant(_) => Err(self.error("cannot assign to literal")),
            Expr::Call { .. } => Err(self.error("cannot assign to function call")),
            _ => Err(self.error("cannot assign to expression")),
        }
    }

    // Expressions

    fn testlist(&mut self) -> Result<Expr, Exception> {
        let first = self.test()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expr() {
                break;
            }
            items.push(self.test()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn target_list(&mut self) -> Result<Expr, Exception> {
        let first = self.bitor()?;
        let target = if self.check_op(",") {
            let mut items = vec![first];
            while self.eat_op(",") {
                if !self.starts_expr() {
                    break;
                }
                items.push(self.bitor()?);
            }
            Expr::Tuple(items)
        } else {
            first
        };
        self.validate_target(&target)?;
        Ok(target)
    }

    fn test(&mut self) -> Result<Expr, Exception> {
        self.nested(|p| {
            if p.check_kw("lambda") {
                return p.lambda();
            }
            let body = p.or_test()?;
            if !p.eat_kw("if") {
                return Ok(body);
            }
            let test = p.or_test()?;
            p.expect_kw("else")?;
            let orelse = p.test()?;
            Ok(Expr::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            })
        })
    }

    fn lambda(&mut self) -> Result<Expr, Exception> {
        let line = self.line();
        self.advance();
        let params = self.params(":")?;
        self.expect_op(":")?;
        let body = self.test()?;
        Ok(Expr::Lambda(Rc::new(FunctionDef {
            name: "<lambda>".to_string(),
            params,
            body: vec![Stmt {
                line,
                kind: StmtKind::Return(Some(body)),
            }],
        })))
    }

    fn or_test(&mut self) -> Result<Expr, Exception> {
        let first = self.and_test()?;
        if !self.check_kw("or") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw("or") {
            values.push(self.and_test()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOp::Or,
            values,
        })
    }

    fn and_test(&mut self) -> Result<Expr, Exception> {
        let first = self.not_test()?;
        if !self.check_kw("and") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw("and") {
            values.push(self.not_test()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOp::And,
            values,
        })
    }

    fn not_test(&mut self) -> Result<Expr, Exception> {
        if self.eat_kw("not") {
            let operand = self.nested(|p| p.not_test())?;
            return Ok(Expr::UnaryOp {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, Exception> {
        let left = self.bitor()?;
        let mut ops = Vec::new();
        loop {
            let next_is = |p: &Self, kw: &str| matches!(p.peek_next(), Tok::Name(m) if m == kw);
            let (op, width) = match self.peek() {
                Tok::Op("==") => (CmpOp::Eq, 1),
                Tok::Op("!=") => (CmpOp::NotEq, 1),
                Tok::Op("<") => (CmpOp::Lt, 1),
                Tok::Op("<=") => (CmpOp::LtE, 1),
                Tok::Op(">") => (CmpOp::Gt, 1),
                Tok::Op(">=") => (CmpOp::GtE, 1),
                Tok::Name(n) if n == "in" => (CmpOp::In, 1),
                Tok::Name(n) if n == "not" && next_is(self, "in") => (CmpOp::NotIn, 2),
                Tok::Name(n) if n == "is" && next_is(self, "not") => (CmpOp::IsNot, 2),
                Tok::Name(n) if n == "is" => (CmpOp::Is, 1),
                _ => break,
            };
            for _ in 0..width {
                self.advance();
            }
            ops.push((op, self.bitor()?));
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                ops,
            })
        }
    }

    fn binary_level(
        &mut self,
        table: &[(&str, BinOp)],
        next: fn(&mut Self) -> Result<Expr, Exception>,
    ) -> Result<Expr, Exception> {
        let mut left = next(self)?;
        'outer: loop {
            for (symbol, op) in table {
                if self.eat_op(symbol) {
                    let right = next(self)?;
                    left = Expr::BinOp {
                        left: Box::new(left),
                        op: *op,
                        right: Box::new(right),
                    };
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn bitor(&mut self) -> Result<Expr, Exception> {
        self.binary_level(&[("|", BinOp::BitOr)], Self::bitxor)
    }

    fn bitxor(&mut self) -> Result<Expr, Exception> {
        self.binary_level(&[("^", BinOp::BitXor)], Self::bitand)
    }

    fn bitand(&mut self) -> Result<Expr, Exception> {
        self.binary_level(&[("&", BinOp::BitAnd)], Self::shift)
    }

    fn shift(&mut self) -> Result<Expr, Exception> {
        self.binary_level(&[("<<", BinOp::LShift), (">>", BinOp::RShift)], Self::arith)
    }

    fn arith(&mut self) -> Result<Expr, Exception> {
        self.binary_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::term)
    }

    fn term(&mut self) -> Result<Expr, Exception> {
        self.binary_level(
            &[
                ("*", BinOp::Mul),
                ("/", BinOp::Div),
                ("//", BinOp::FloorDiv),
                ("%", BinOp::Mod),
            ],
            Self::factor,
        )
    }

    fn factor(&mut self) -> Result<Expr, Exception> {
        let op = match self.peek() {
            Tok::Op("-") => UnaryOp::Neg,
            Tok::Op("+") => UnaryOp::Pos,
            Tok::Op("~") => UnaryOp::Invert,
            _ => return self.power(),
        };
        self.advance();
        let operand = self.nested(|p| p.factor())?;
        Ok(Expr::UnaryOp {
            op,
            operand: Box::new(operand),
        })
    }

    fn power(&mut self) -> Result<Expr, Exception> {
        let base = self.atom_expr()?;
        if self.eat_op("**") {
            let exponent = self.nested(|p| p.factor())?;
            return Ok(Expr::BinOp {
                left: Box::new(base),
                op: BinOp::Pow,
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn atom_expr(&mut self) -> Result<Expr, Exception> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op("(") {
                expr = self.call(expr)?;
            } else if self.eat_op("[") {
                let index = self.subscript()?;
                self.expect_op("]")?;
                expr = Expr::Subscript {
                    value: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_op(".") {
                let attr = self.expect_name()?;
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    attr,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn call(&mut self, func: Expr) -> Result<Expr, Exception> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.check_op(")") {
            if self.check_op("*") || self.check_op("**") {
                return Err(self.error("argument unpacking is not supported"));
            }
            let is_kwarg = matches!(self.peek(), Tok::Name(_))
                && matches!(self.peek_next(), Tok::Op("="));
            if is_kwarg {
                let name = self.expect_name()?;
                self.advance();
                if kwargs.iter().any(|(existing, _)| *existing == name) {
                    return Err(self.error(format!("keyword argument repeated: {}", name)));
                }
                kwargs.push((name, self.test()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                let arg = self.test()?;
                if self.check_kw("for") {
                    let generators = self.comprehension()?;
                    args.push(Expr::ListComp {
                        elt: Box::new(arg),
                        generators,
                    });
                } else {
                    args.push(arg);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok(Expr::Call {
            func: Box::new(func),
            args,
            kwargs,
        })
    }

    fn subscript(&mut self) -> Result<Expr, Exception> {
        let first = self.slice_item()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("]") {
                break;
            }
            items.push(self.slice_item()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn slice_item(&mut self) -> Result<Expr, Exception> {
        let lower = if self.check_op(":") {
            None
        } else {
            Some(self.test()?)
        };
        if !self.eat_op(":") {
            return lower.ok_or_else(|| self.error("invalid syntax"));
        }
        let bound_ends = |p: &Self| p.check_op(":") || p.check_op("]") || p.check_op(",");
        let upper = if bound_ends(self) {
            None
        } else {
            Some(Box::new(self.test()?))
        };
        let step = if self.eat_op(":") && !(self.check_op("]") || self.check_op(",")) {
            Some(Box::new(self.test()?))
        } else {
            None
        };
        Ok(Expr::Slice {
            lower: lower.map(Box::new),
            upper,
            step,
        })
    }

    fn comprehension(&mut self) -> Result<Vec<Comprehension>, Exception> {
        let mut generators = Vec::new();
        while self.eat_kw("for") {
            let target = self.target_list()?;
            self.expect_kw("in")?;
            let iter = self.or_test()?;
            let mut ifs = Vec::new();
            while self.eat_kw("if") {
                ifs.push(self.or_test()?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(generators)
    }

    fn atom(&mut self) -> Result<Expr, Exception> {
        match self.peek().clone() {
            Tok::Op("(") => self.nested(|p| p.paren()),
            Tok::Op("[") => self.nested(|p| p.list_display()),
            Tok::Op("{") => self.nested(|p| p.brace_display()),
            Tok::Name(name) => {
                let constant = match name.as_str() {
                    "None" => Some(Constant::None),
                    "True" => Some(Constant::Bool(true)),
                    "False" => Some(Constant::Bool(false)),
                    _ => None,
                };
                if let Some(constant) = constant {
                    self.advance();
                    return Ok(Expr::Constant(constant));
                }
                Ok(Expr::Name(self.expect_name()?))
            }
            Tok::Int(value) => {
                self.advance();
                Ok(Expr::Constant(Constant::Int(value)))
            }
            Tok::Float(value) => {
                self.advance();
                Ok(Expr::Constant(Constant::Float(value)))
            }
            Tok::Str(_) | Tok::FStr(_) => self.strings(),
            Tok::Newline | Tok::Eof => Err(self.error("invalid syntax")),
            Tok::Indent => Err(Exception::syntax_kind(
                ErrorKind::IndentationError,
                self.line(),
                "unexpected indent",
            )),
            _ => Err(self.error("invalid syntax")),
        }
    }

    fn paren(&mut self) -> Result<Expr, Exception> {
        self.advance();
        if self.eat_op(")") {
            return Ok(Expr::Tuple(Vec::new()));
        }
        let first = self.test()?;
        let expr = if self.check_kw("for") {
            let generators = self.comprehension()?;
            Expr::ListComp {
                elt: Box::new(first),
                generators,
            }
        } else if self.check_op(",") {
            let mut items = vec![first];
            while self.eat_op(",") {
                if self.check_op(")") {
                    break;
                }
                items.push(self.test()?);
            }
            Expr::Tuple(items)
        } else {
            first
        };
        self.expect_op(")")?;
        Ok(expr)
    }

    fn list_display(&mut self) -> Result<Expr, Exception> {
        self.advance();
        if self.eat_op("]") {
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.test()?;
        if self.check_kw("for") {
            let generators = self.comprehension()?;
            self.expect_op("]")?;
            return Ok(Expr::ListComp {
                elt: Box::new(first),
                generators,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("]") {
                break;
            }
            items.push(self.test()?);
        }
        self.expect_op("]")?;
        Ok(Expr::List(items))
    }

    fn brace_display(&mut self) -> Result<Expr, Exception> {
        self.advance();
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        let first = self.test()?;
        if self.eat_op(":") {
            let value = self.test()?;
            if self.check_kw("for") {
                let generators = self.comprehension()?;
                self.expect_op("}")?;
                return Ok(Expr::DictComp {
                    key: Box::new(first),
                    value: Box::new(value),
                    generators,
                });
            }
            let mut pairs = vec![(first, value)];
            while self.eat_op(",") {
                if self.check_op("}") {
                    break;
                }
                let key = self.test()?;
                self.expect_op(":")?;
                pairs.push((key, self.test()?));
            }
            self.expect_op("}")?;
            return Ok(Expr::Dict(pairs));
        }
        if self.check_kw("for") {
            let generators = self.comprehension()?;
            self.expect_op("}")?;
            return Ok(Expr::SetComp {
                elt: Box::new(first),
                generators,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("}") {
                break;
            }
            items.push(self.test()?);
        }
        self.expect_op("}")?;
        Ok(Expr::Set(items))
    }

    fn strings(&mut self) -> Result<Expr, Exception> {
        let line = self.line();
        let mut parts = Vec::new();
        let mut formatted = false;
        loop {
            match self.peek().clone() {
                Tok::Str(value) => {
                    self.advance();
                    parts.push(FStringPart::Literal(value));
                }
                Tok::FStr(body) => {
                    self.advance();
                    formatted = true;
                    parts.extend(parse_fstring(&body, line)?);
                }
                _ => break,
            }
        }
        if formatted {
            return Ok(Expr::FString(parts));
        }
        let text = parts
            .into_iter()
            .map(|part| match part {
                FStringPart::Literal(text) => text,
                FStringPart::Field { .. } => String::new(),
            })
            .collect();
        Ok(Expr::Constant(Constant::Str(text)))
    }
}

fn parse_fstring(body: &str, line: usize) -> Result<Vec<FStringPart>, Exception> {
    let chars: Vec<char> = body.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                literal.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                literal.push('}');
                i += 2;
            }
            '}' => {
                return Err(Exception::syntax(line, "f-string: single '}' is not allowed"));
            }
            '{' => {
                if !literal.is_empty() {
                    parts.push(FStringPart::Literal(std::mem::take(&mut literal)));
                }
                let (part, next) = fstring_field(&chars, i + 1, line)?;
                parts.push(part);
                i = next;
            }
            c => {
                literal.push(c);
                i += 1;
            }
        }
    }
    if !literal.is_empty() {
        parts.push(FStringPart::Literal(literal));
    }
    Ok(parts)
}

/// Parses `expr[!r][:spec]}` starting right after the opening brace.
/// Returns the field and the index just past the closing brace.
fn fstring_field(
    chars: &[char],
    start: usize,
    line: usize,
) -> Result<(FStringPart, usize), Exception> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut expr_end = None;
    let mut repr = false;
    let mut i = start;

    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            '}' if depth > 0 => depth -= 1,
            '!' if depth == 0
                && matches!(chars.get(i + 1), Some('r' | 's' | 'a'))
                && matches!(chars.get(i + 2), Some(':' | '}')) =>
            {
                expr_end = Some(i);
                repr = chars[i + 1] != 's';
                i += 2;
                break;
            }
            ':' | '}' if depth == 0 => {
                expr_end = Some(i);
                break;
            }
            _ => {}
        }
        i += 1;
    }

    let Some(expr_end) = expr_end else {
        return Err(Exception::syntax(line, "f-string: expecting '}'"));
    };
    let text: String = chars[start..expr_end].iter().collect();
    if text.trim().is_empty() {
        return Err(Exception::syntax(line, "f-string: empty expression not allowed"));
    }
    let expr = parse_expression(&text, line)?;

    let mut spec = String::new();
    if chars.get(i) == Some(&':') {
        i += 1;
        while i < chars.len() && chars[i] != '}' {
            spec.push(chars[i]);
            i += 1;
        }
    }
    if chars.get(i) != Some(&'}') {
        return Err(Exception::syntax(line, "f-string: expecting '}'"));
    }
    Ok((FStringPart::Field { expr, repr, spec }, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(source: &str) -> StmtKind {
        let mut stmts = parse(source).unwrap();
        assert_eq!(stmts.len(), 1, "{:?}", stmts);
        stmts.remove(0).kind
    }

    fn name(n: &str) -> Expr {
        Expr::Name(n.to_string())
    }

    fn int(v: i64) -> Expr {
        Expr::Constant(Constant::Int(v))
    }

    #[test]
    fn test_precedence() {
        let StmtKind::Expr(expr) = parse_one("1 + 2 * 3 ** 2") else {
            panic!("expected expression statement");
        };
        assert_eq!(
            expr,
            Expr::BinOp {
                left: Box::new(int(1)),
                op: BinOp::Add,
                right: Box::new(Expr::BinOp {
                    left: Box::new(int(2)),
                    op: BinOp::Mul,
                    right: Box::new(Expr::BinOp {
                        left: Box::new(int(3)),
                        op: BinOp::Pow,
                        right: Box::new(int(2)),
                    }),
                }),
            }
        );
    }

    #[test]
    fn test_chained_assignment_and_unpacking() {
        let StmtKind::Assign { targets, value } = parse_one("a, b = c = 1, 2") else {
            panic!("expected assignment");
        };
        assert_eq!(targets, vec![Expr::Tuple(vec![name("a"), name("b")]), name("c")]);
        assert_eq!(value, Expr::Tuple(vec![int(1), int(2)]));
    }

    #[test]
    fn test_compound_statements() {
        let source = "\
def f(x, y=2):
    if x > y:
        return x
    elif x == y:
        pass
    else:
        return y

for i in range(3):
    try:
        f(i)
    except ValueError as e:
        print(e)
    finally:
        print('done')
";
        let stmts = parse(source).unwrap();
        assert_eq!(stmts.len(), 2);
        let StmtKind::FunctionDef(def) = &stmts[0].kind else {
            panic!("expected def");
        };
        assert_eq!(def.params.len(), 2);
        assert!(def.params[1].default.is_some());
        let StmtKind::For { body, .. } = &stmts[1].kind else {
            panic!("expected for");
        };
        assert!(matches!(
            &body[0].kind,
            StmtKind::Try { handlers, finalbody, .. }
                if handlers.len() == 1
                    && handlers[0].name.as_deref() == Some("e")
                    && finalbody.len() == 1
        ));
        assert_eq!(stmts[1].line, 9);
    }

    #[test]
    fn test_comparisons_and_membership() {
        let StmtKind::Expr(Expr::Compare { ops, .. }) = parse_one("a < b <= c not in d is not e")
        else {
            panic!("expected comparison");
        };
        let ops: Vec<CmpOp> = ops.into_iter().map(|(op, _)| op).collect();
        assert_eq!(ops, vec![CmpOp::Lt, CmpOp::LtE, CmpOp::NotIn, CmpOp::IsNot]);
    }

    #[test]
    fn test_comprehensions_and_slices() {
        assert!(matches!(
            parse_one("[x * 2 for x in xs if x]"),
            StmtKind::Expr(Expr::ListComp { .. })
        ));
        assert!(matches!(
            parse_one("{k: v for k, v in pairs}"),
            StmtKind::Expr(Expr::DictComp { .. })
        ));
        assert!(matches!(
            parse_one("sum(x for x in xs)"),
            StmtKind::Expr(Expr::Call { ref args, .. }) if matches!(args[0], Expr::ListComp { .. })
        ));
        assert!(matches!(
            parse_one("xs[::-1]"),
            StmtKind::Expr(Expr::Subscript { ref index, .. })
                if matches!(**index, Expr::Slice { lower: None, upper: None, step: Some(_) })
        ));
    }

    #[test]
    fn test_fstring_fields() {
        let StmtKind::Expr(Expr::FString(parts)) = parse_one("f'{name!r} has {n:>5} {{x}}'")
        else {
            panic!("expected f-string");
        };
        assert_eq!(parts.len(), 4);
        assert!(matches!(&parts[0], FStringPart::Field { repr: true, .. }));
        assert_eq!(parts[1], FStringPart::Literal(" has ".to_string()));
        assert!(matches!(&parts[2], FStringPart::Field { spec, .. } if spec == ">5"));
        assert_eq!(parts[3], FStringPart::Literal(" {x}".to_string()));
    }

    #[test]
    fn test_syntax_errors_carry_line() {
        let err = parse("x = 1\nprint('a'\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SyntaxError);

        let err = parse("x = 1\nif x\n    pass\n").unwrap_err();
        assert_eq!(err.line(), Some(2));

        let err = parse("1 = x\n").unwrap_err();
        assert_eq!(err.msg, "cannot assign to literal");

        let err = parse("class A:\n    pass\n").unwrap_err();
        assert!(err.msg.contains("not supported"));

        let err = parse("def f(a=1, b):\n    pass\n").unwrap_err();
        assert_eq!(err.msg, "non-default argument follows default argument");
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let source = format!("x = {}1{}\n", "(".repeat(500), ")".repeat(500));
        let err = parse(&source).unwrap_err();
        assert!(err.msg.contains("too many nested"));
    }
}
