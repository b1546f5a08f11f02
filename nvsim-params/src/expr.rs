//! Evaluator for the numeric subset of Python used in the cell description: int and float
//! literals, `+ - * / // % **`, parentheses, names bound earlier and a few `math` functions.
//! Integers stay integers until an operation turns them into floats, as in Python.
use derive_more::From;
use std::{collections::HashMap, f64::consts, fmt};

use crate::{error::ParamError, pyfmt::float_repr};

#[derive(Debug, Clone, Copy, PartialEq, From)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Int(i) => i as f64,
            Value::Float(f) => f,
        }
    }

    fn is_zero(self) -> bool {
        self.as_f64() == 0.0
    }

    pub fn add(self, rhs: Value) -> Result<Value, ParamError> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => a.checked_add(b).map(Value::Int).ok_or(ParamError::Overflow("+")),
            (a, b) => Ok(Value::Float(a.as_f64() + b.as_f64())),
        }
    }

    pub fn sub(self, rhs: Value) -> Result<Value, ParamError> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => a.checked_sub(b).map(Value::Int).ok_or(ParamError::Overflow("-")),
            (a, b) => Ok(Value::Float(a.as_f64() - b.as_f64())),
        }
    }

    pub fn mul(self, rhs: Value) -> Result<Value, ParamError> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => a.checked_mul(b).map(Value::Int).ok_or(ParamError::Overflow("*")),
            (a, b) => Ok(Value::Float(a.as_f64() * b.as_f64())),
        }
    }

    /// `/` always yields a float.
    pub fn true_div(self, rhs: Value) -> Result<Value, ParamError> {
        if rhs.is_zero() {
            return Err(ParamError::ZeroDivision("division by zero"));
        }
        Ok(Value::Float(self.as_f64() / rhs.as_f64()))
    }

    pub fn floor_div(self, rhs: Value) -> Result<Value, ParamError> {
        match (self, rhs) {
            (Value::Int(_), Value::Int(0)) => Err(ParamError::ZeroDivision(
                "integer division or modulo by zero",
            )),
            (Value::Int(a), Value::Int(b)) => {
                let q = a.checked_div(b).ok_or(ParamError::Overflow("//"))?;
                Ok(Value::Int(if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q }))
            }
            (a, b) => {
                if b.is_zero() {
                    return Err(ParamError::ZeroDivision("float floor division by zero"));
                }
                Ok(Value::Float(float_divmod(a.as_f64(), b.as_f64()).0))
            }
        }
    }

    pub fn modulo(self, rhs: Value) -> Result<Value, ParamError> {
        match (self, rhs) {
            (Value::Int(_), Value::Int(0)) => Err(ParamError::ZeroDivision(
                "integer division or modulo by zero",
            )),
            (Value::Int(a), Value::Int(b)) => {
                let r = a.checked_rem(b).ok_or(ParamError::Overflow("%"))?;
                Ok(Value::Int(if r != 0 && (r < 0) != (b < 0) { r + b } else { r }))
            }
            (a, b) => {
                if b.is_zero() {
                    return Err(ParamError::ZeroDivision("float modulo"));
                }
                Ok(Value::Float(float_divmod(a.as_f64(), b.as_f64()).1))
            }
        }
    }

    pub fn pow(self, rhs: Value) -> Result<Value, ParamError> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) if b >= 0 => {
                let exp = u32::try_from(b).map_err(|_| ParamError::Overflow("**"))?;
                a.checked_pow(exp).map(Value::Int).ok_or(ParamError::Overflow("**"))
            }
            (a, b) => {
                let (a, b) = (a.as_f64(), b.as_f64());
                if a == 0.0 && b < 0.0 {
                    return Err(ParamError::ZeroDivision(
                        "0.0 cannot be raised to a negative power",
                    ));
                }
                if a < 0.0 && b.fract() != 0.0 {
                    return Err(ParamError::Domain(format!(
                        "{} ** {} (complex result)",
                        float_repr(a),
                        float_repr(b)
                    )));
                }
                let result = a.powf(b);
                if result.is_infinite() && a.is_finite() && b.is_finite() {
                    return Err(ParamError::Overflow("**"));
                }
                Ok(Value::Float(result))
            }
        }
    }

    pub fn neg(self) -> Result<Value, ParamError> {
        match self {
            Value::Int(i) => i.checked_neg().map(Value::Int).ok_or(ParamError::Overflow("-")),
            Value::Float(f) => Ok(Value::Float(-f)),
        }
    }
}

/// CPython's `float_divmod`: the floor quotient and a remainder with the sign of `b`.
fn float_divmod(a: f64, b: f64) -> (f64, f64) {
    let mut rem = a % b;
    let mut div = (a - rem) / b;
    if rem != 0.0 {
        if (b < 0.0) != (rem < 0.0) {
            rem += b;
            div -= 1.0;
        }
    } else {
        rem = 0.0f64.copysign(b);
    }
    let floor = if div != 0.0 {
        let mut floor = div.floor();
        if div - floor > 0.5 {
            floor += 1.0;
        }
        floor
    } else {
        0.0f64.copysign(a / b)
    };
    (floor, rem)
}

/// Formats like Python's `str`: integers as is, floats with the shortest round-trip repr.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", float_repr(*x)),
        }
    }
}

/// Names visible to an expression, in addition to the `math` constants and functions.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: HashMap<String, Value>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Result<Value, ParamError> {
        if let Some(v) = self.vars.get(name) {
            return Ok(*v);
        }
        match name {
            "math.pi" | "np.pi" => Ok(Value::Float(consts::PI)),
            "math.e" | "np.e" => Ok(Value::Float(consts::E)),
            "math.tau" => Ok(Value::Float(consts::TAU)),
            _ => Err(ParamError::UnknownName(name.to_string())),
        }
    }

    /// Parses and evaluates `source`.
    pub fn eval(&self, source: &str) -> Result<Value, ParamError> {
        parse(source)?.eval(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(Value),
    /// possibly dotted, e.g. `math.pi`
    Name(String),
    Neg(Box<Expr>),
    Pos(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

impl Expr {
    pub fn eval(&self, env: &Env) -> Result<Value, ParamError> {
        match self {
            Expr::Num(v) => Ok(*v),
            Expr::Name(name) => env.get(name),
            Expr::Neg(e) => e.eval(env)?.neg(),
            Expr::Pos(e) => e.eval(env),
            Expr::Binary(op, lhs, rhs) => {
                let (a, b) = (lhs.eval(env)?, rhs.eval(env)?);
                match op {
                    BinOp::Add => a.add(b),
                    BinOp::Sub => a.sub(b),
                    BinOp::Mul => a.mul(b),
                    BinOp::Div => a.true_div(b),
                    BinOp::FloorDiv => a.floor_div(b),
                    BinOp::Mod => a.modulo(b),
                    BinOp::Pow => a.pow(b),
                }
            }
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|a| a.eval(env))
                    .collect::<Result<Vec<_>, _>>()?;
                call(name, &args)
            }
        }
    }
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<(), ParamError> {
    if args.len() != expected {
        return Err(ParamError::Type(format!(
            "{}() takes exactly {} argument(s) ({} given)",
            name,
            expected,
            args.len()
        )));
    }
    Ok(())
}

fn positive_log(name: &str, x: f64) -> Result<f64, ParamError> {
    if x <= 0.0 {
        return Err(ParamError::Domain(format!("{}({})", name, float_repr(x))));
    }
    Ok(x.ln())
}

fn call(name: &str, args: &[Value]) -> Result<Value, ParamError> {
    let float = |v: f64| -> Result<Value, ParamError> { Ok(Value::Float(v)) };
    match name {
        "math.sqrt" | "np.sqrt" => {
            arity(name, args, 1)?;
            let x = args[0].as_f64();
            if x < 0.0 {
                return Err(ParamError::Domain(format!("sqrt({})", float_repr(x))));
            }
            float(x.sqrt())
        }
        "math.log" | "np.log" => match args {
            [x] => float(positive_log(name, x.as_f64())?),
            [x, base] => {
                let num = positive_log(name, x.as_f64())?;
                let den = positive_log(name, base.as_f64())?;
                if den == 0.0 {
                    return Err(ParamError::ZeroDivision("float division by zero"));
                }
                float(num / den)
            }
            _ => Err(ParamError::Type(format!(
                "{} expected 1 or 2 arguments, got {}",
                name,
                args.len()
            ))),
        },
        "math.log2" | "np.log2" => {
            arity(name, args, 1)?;
            positive_log(name, args[0].as_f64())?;
            float(args[0].as_f64().log2())
        }
        "math.log10" | "np.log10" => {
            arity(name, args, 1)?;
            positive_log(name, args[0].as_f64())?;
            float(args[0].as_f64().log10())
        }
        "math.exp" | "np.exp" => {
            arity(name, args, 1)?;
            let result = args[0].as_f64().exp();
            if result.is_infinite() && args[0].as_f64().is_finite() {
                return Err(ParamError::Overflow("exp"));
            }
            float(result)
        }
        "math.pow" => {
            arity(name, args, 2)?;
            let (x, y) = (args[0].as_f64(), args[1].as_f64());
            if (x == 0.0 && y < 0.0) || (x < 0.0 && y.fract() != 0.0) {
                return Err(ParamError::Domain(format!(
                    "pow({}, {})",
                    float_repr(x),
                    float_repr(y)
                )));
            }
            float(x.powf(y))
        }
        "pow" => {
            arity(name, args, 2)?;
            args[0].pow(args[1])
        }
        "abs" | "math.fabs" => {
            arity(name, args, 1)?;
            match args[0] {
                Value::Int(i) if name == "abs" => {
                    i.checked_abs().map(Value::Int).ok_or(ParamError::Overflow("abs"))
                }
                v => float(v.as_f64().abs()),
            }
        }
        "math.floor" | "math.ceil" | "int" => {
            arity(name, args, 1)?;
            let x = match args[0] {
                Value::Int(i) => return Ok(Value::Int(i)),
                Value::Float(x) => x,
            };
            let rounded = match name {
                "math.floor" => x.floor(),
                "math.ceil" => x.ceil(),
                _ => x.trunc(),
            };
            if !rounded.is_finite() || rounded.abs() >= 9.2e18 {
                return Err(ParamError::Overflow("int conversion"));
            }
            Ok(Value::Int(rounded as i64))
        }
        "float" => {
            arity(name, args, 1)?;
            float(args[0].as_f64())
        }
        "min" | "max" => {
            let Some((first, rest)) = args.split_first() else {
                return Err(ParamError::Type(format!(
                    "{} expected at least 1 argument, got 0",
                    name
                )));
            };
            Ok(rest.iter().fold(*first, |best, v| {
                let better = if name == "min" {
                    v.as_f64() < best.as_f64()
                } else {
                    v.as_f64() > best.as_f64()
                };
                if better { *v } else { best }
            }))
        }
        _ => Err(ParamError::UnknownName(name.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(Value),
    Name(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ParamError> {
    let syntax = |pos: usize, msg: &str| ParamError::Syntax {
        expr: source.to_string(),
        pos,
        msg: msg.to_string(),
    };
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        let start = i;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            let mut is_float = false;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'_') {
                i += 1;
            }
            if i < bytes.len() && bytes[i] == b'.' {
                is_float = true;
                i += 1;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'_') {
                    i += 1;
                }
            }
            if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                is_float = true;
                i += 1;
                if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
                    i += 1;
                }
                let digits = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if digits == i {
                    return Err(syntax(start, "invalid exponent"));
                }
            }
            let literal = source[start..i].replace('_', "");
            let value = if is_float {
                literal
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| syntax(start, "invalid float literal"))?
            } else {
                if literal.len() > 1 && literal.starts_with('0') && literal.bytes().any(|b| b != b'0') {
                    return Err(syntax(start, "leading zeros in decimal integer literals are not permitted"));
                }
                literal
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| ParamError::Overflow("int literal"))?
            };
            tokens.push((start, Token::Num(value)));
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            while i < bytes.len() {
                let b = bytes[i];
                let continues_dotted = b == b'.'
                    && bytes
                        .get(i + 1)
                        .is_some_and(|n| n.is_ascii_alphabetic() || *n == b'_');
                if b.is_ascii_alphanumeric() || b == b'_' || continues_dotted {
                    i += 1;
                } else {
                    break;
                }
            }
            tokens.push((start, Token::Name(source[start..i].to_string())));
            continue;
        }
        let two = source.get(i..i + 2);
        let token = match (c, two) {
            (_, Some("**")) => Token::Op("**"),
            (_, Some("//")) => Token::Op("//"),
            ('+', _) => Token::Op("+"),
            ('-', _) => Token::Op("-"),
            ('*', _) => Token::Op("*"),
            ('/', _) => Token::Op("/"),
            ('%', _) => Token::Op("%"),
            ('(', _) => Token::LParen,
            (')', _) => Token::RParen,
            (',', _) => Token::Comma,
            _ => return Err(syntax(start, &format!("unexpected character {:?}", c))),
        };
        i += match &token {
            Token::Op(op) => op.len(),
            _ => 1,
        };
        tokens.push((start, token));
    }
    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, msg: &str) -> ParamError {
        let pos = self
            .tokens
            .get(self.pos)
            .map_or(self.source.len(), |(p, _)| *p);
        ParamError::Syntax {
            expr: self.source.to_string(),
            pos,
            msg: msg.to_string(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn arith(&mut self) -> Result<Expr, ParamError> {
        let mut lhs = self.term()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let rhs = self.term()?;
            let op = if op == "+" { BinOp::Add } else { BinOp::Sub };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ParamError> {
        let mut lhs = self.factor()?;
        while let Some(op) = self.eat_op(&["*", "/", "//", "%"]) {
            let rhs = self.factor()?;
            let op = match op {
                "*" => BinOp::Mul,
                "/" => BinOp::Div,
                "//" => BinOp::FloorDiv,
                _ => BinOp::Mod,
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    /// Unary signs bind looser than `**` on their right: `-2 ** 2 == -4`.
    fn factor(&mut self) -> Result<Expr, ParamError> {
        match self.eat_op(&["-", "+"]) {
            Some("-") => Ok(Expr::Neg(Box::new(self.factor()?))),
            Some(_) => Ok(Expr::Pos(Box::new(self.factor()?))),
            None => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, ParamError> {
        let base = self.atom()?;
        if self.eat_op(&["**"]).is_some() {
            let exponent = self.factor()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, ParamError> {
        let Some((_, token)) = self.tokens.get(self.pos).cloned() else {
            return Err(self.error("unexpected end of expression"));
        };
        self.pos += 1;
        match token {
            Token::Num(v) => Ok(Expr::Num(v)),
            Token::Name(name) => {
                if !self.eat(&Token::LParen) {
                    return Ok(Expr::Name(name));
                }
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.arith()?);
                        if self.eat(&Token::RParen) {
                            break;
                        }
                        if !self.eat(&Token::Comma) {
                            return Err(self.error("expected ',' or ')'"));
                        }
                        // trailing comma
                        if self.eat(&Token::RParen) {
                            break;
                        }
                    }
                }
                Ok(Expr::Call(name, args))
            }
            Token::LParen => {
                let inner = self.arith()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.error("expected ')'"));
                }
                Ok(inner)
            }
            _ => {
                self.pos -= 1;
                Err(self.error("expected a number, a name or '('"))
            }
        }
    }
}

pub fn parse(source: &str) -> Result<Expr, ParamError> {
    let mut parser = Parser {
        source,
        tokens: tokenize(source)?,
        pos: 0,
    };
    let expr = parser.arith()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}
