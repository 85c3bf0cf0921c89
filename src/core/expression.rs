//! Arithmetic expressions over named fields.
//!
//! Values are `Option<f64>`: `None` is the absent value. It propagates
//! through every operator and function, and is also produced by
//! division by zero and by results that are not finite.

use crate::types::{ProfileError, ProfileResult};
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Deepest nesting of parentheses, calls and unary signs accepted
pub const MAX_NESTING: usize = 256;

/// Longest expression accepted, in tokens
pub const MAX_TOKENS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Abs,
    Sqrt,
    Ln,
    Log10,
    Exp,
    Min,
    Max,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "abs" => Some(Function::Abs),
            "sqrt" => Some(Function::Sqrt),
            "ln" => Some(Function::Ln),
            "log10" => Some(Function::Log10),
            "exp" => Some(Function::Exp),
            "min" => Some(Function::Min),
            "max" => Some(Function::Max),
            _ => None,
        }
    }

    fn arity_ok(&self, n: usize) -> bool {
        match self {
            Function::Min | Function::Max => n >= 1,
            _ => n == 1,
        }
    }

    fn apply(&self, args: &[f64]) -> Option<f64> {
        let x = args[0];
        match self {
            Function::Abs => Some(x.abs()),
            Function::Sqrt => (x >= 0.0).then(|| x.sqrt()),
            Function::Ln => (x > 0.0).then(|| x.ln()),
            Function::Log10 => (x > 0.0).then(|| x.log10()),
            Function::Exp => Some(x.exp()),
            Function::Min => args.iter().copied().reduce(f64::min),
            Function::Max => args.iter().copied().reduce(f64::max),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Field(String),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

impl Expr {
    fn eval(&self, lookup: &dyn Fn(&str) -> Option<f64>) -> Option<f64> {
        let value = match self {
            Expr::Number(v) => Some(*v),
            Expr::Field(name) => lookup(name),
            Expr::Neg(inner) => inner.eval(lookup).map(|v| -v),
            Expr::Binary(op, lhs, rhs) => {
                let a = lhs.eval(lookup)?;
                let b = rhs.eval(lookup)?;
                match op {
                    BinaryOp::Add => Some(a + b),
                    BinaryOp::Sub => Some(a - b),
                    BinaryOp::Mul => Some(a * b),
                    BinaryOp::Div => (b != 0.0).then(|| a / b),
                    BinaryOp::Pow => Some(a.powf(b)),
                }
            }
            Expr::Call(function, args) => {
                let values = args.iter().map(|a| a.eval(lookup)).collect::<Option<Vec<f64>>>()?;
                function.apply(&values)
            }
        };
        value.filter(|v| v.is_finite())
    }

    fn collect_fields(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Field(name) => {
                out.insert(name.clone());
            }
            Expr::Neg(inner) => inner.collect_fields(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_fields(out);
                rhs.collect_fields(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.collect_fields(out)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Symbol(char),
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\s*(?:(?P<num>(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?)|(?P<ident>[A-Za-z_][A-Za-z0-9_]*)|(?P<sym>\S))")
            .expect("token pattern is valid")
    })
}

fn tokenize(source: &str) -> ProfileResult<Vec<Token>> {
    let mut tokens = Vec::new();
    for caps in token_pattern().captures_iter(source) {
        if tokens.len() == MAX_TOKENS {
            return Err(ProfileError::Expression(format!(
                "expression longer than {} tokens",
                MAX_TOKENS
            )));
        }
        if let Some(num) = caps.name("num") {
            let value = num
                .as_str()
                .parse::<f64>()
                .map_err(|e| ProfileError::Expression(format!("bad number '{}': {}", num.as_str(), e)))?;
            tokens.push(Token::Number(value));
        } else if let Some(ident) = caps.name("ident") {
            tokens.push(Token::Ident(ident.as_str().to_string()));
        } else if let Some(sym) = caps.name("sym") {
            let c = sym.as_str().chars().next().unwrap_or(' ');
            if !"+-*/^(),".contains(c) {
                return Err(ProfileError::Expression(format!("unexpected character '{}'", c)));
            }
            tokens.push(Token::Symbol(c));
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, symbol: char) -> bool {
        if self.peek() == Some(&Token::Symbol(symbol)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, symbol: char) -> ProfileResult<()> {
        if self.eat(symbol) {
            Ok(())
        } else {
            Err(ProfileError::Expression(format!(
                "expected '{}' at token {}",
                symbol,
                self.pos + 1
            )))
        }
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> ProfileResult<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = if self.eat('+') {
                BinaryOp::Add
            } else if self.eat('-') {
                BinaryOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> ProfileResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat('*') {
                BinaryOp::Mul
            } else if self.eat('/') {
                BinaryOp::Div
            } else {
                return Ok(lhs);
            };
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    // every recursive rule passes through here
    fn unary(&mut self) -> ProfileResult<Expr> {
        if self.depth == MAX_NESTING {
            return Err(ProfileError::Expression(format!(
                "expression nested deeper than {} levels",
                MAX_NESTING
            )));
        }
        self.depth += 1;
        let expr = self.unary_inner();
        self.depth -= 1;
        expr
    }

    // unary := '-' unary | '+' unary | power
    fn unary_inner(&mut self) -> ProfileResult<Expr> {
        if self.eat('-') {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat('+') {
            return self.unary();
        }
        self.power()
    }

    // power := primary ('^' unary)?   (right associative)
    fn power(&mut self) -> ProfileResult<Expr> {
        let base = self.primary()?;
        if self.eat('^') {
            let exponent = self.unary()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> ProfileResult<Expr> {
        match self.next() {
            Some(Token::Number(v)) => Ok(Expr::Number(v)),
            Some(Token::Ident(name)) => {
                if !self.eat('(') {
                    return Ok(Expr::Field(name));
                }
                let function = Function::from_name(&name)
                    .ok_or_else(|| ProfileError::Expression(format!("unknown function '{}'", name)))?;
                let mut args = Vec::new();
                if !self.eat(')') {
                    loop {
                        args.push(self.expr()?);
                        if self.eat(')') {
                            break;
                        }
                        self.expect(',')?;
                    }
                }
                if !function.arity_ok(args.len()) {
                    return Err(ProfileError::Expression(format!(
                        "{}() does not take {} arguments",
                        name,
                        args.len()
                    )));
                }
                Ok(Expr::Call(function, args))
            }
            Some(Token::Symbol('(')) => {
                let inner = self.expr()?;
                self.expect(')')?;
                Ok(inner)
            }
            Some(Token::Symbol(c)) => Err(ProfileError::Expression(format!("unexpected '{}'", c))),
            None => Err(ProfileError::Expression("unexpected end of expression".to_string())),
        }
    }
}

/// A parsed expression such as `(b4-b3)/(b4+b3)`
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> ProfileResult<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ProfileError::Expression("empty expression".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0, depth: 0 };
        let root = parser.expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(ProfileError::Expression(format!(
                "unexpected trailing input in '{}'",
                source
            )));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Field names referenced by the expression
    pub fn fields(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.root.collect_fields(&mut out);
        out
    }

    /// Evaluate with `lookup` resolving field names; `None` is absent.
    pub fn evaluate(&self, lookup: &dyn Fn(&str) -> Option<f64>) -> Option<f64> {
        self.root.eval(lookup)
    }
}

impl FromStr for Expression {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::HashMap;

    fn eval(source: &str, fields: &[(&str, f64)]) -> Option<f64> {
        let map: HashMap<&str, f64> = fields.iter().copied().collect();
        Expression::parse(source).unwrap().evaluate(&|name: &str| map.get(name).copied())
    }

    #[test]
    fn test_ndvi() {
        let v = eval("(b4-b3)/(b4+b3)", &[("b3", 0.2), ("b4", 0.5)]).unwrap();
        assert_relative_eq!(v, 0.3 / 0.7);
    }

    #[test]
    fn test_precedence_and_unary() {
        assert_eq!(eval("1 + 2 * 3", &[]), Some(7.0));
        assert_eq!(eval("-2 ^ 2", &[]), Some(-4.0));
        assert_eq!(eval("2 ^ 3 ^ 2", &[]), Some(512.0));
        assert_eq!(eval("10 - 4 - 3", &[]), Some(3.0));
        assert_eq!(eval("1.5e1 / .5", &[]), Some(30.0));
        assert_eq!(eval("max(1, b1, 3)", &[("b1", 7.0)]), Some(7.0));
        assert_eq!(eval("sqrt(abs(-16))", &[]), Some(4.0));
    }

    #[test]
    fn test_absent_propagates() {
        assert_eq!(eval("b1 + b2", &[("b1", 1.0)]), None);
        assert_eq!(eval("b1 / 0", &[("b1", 1.0)]), None);
        assert_eq!(eval("ln(0)", &[]), None);
        assert_eq!(eval("min(b9, 1)", &[]), None);
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "b1 +", "(b1", "b1 b2", "foo(1)", "sqrt(1, 2)", "b1 % 2", "1,2"] {
            assert!(Expression::parse(bad).is_err(), "{:?} should not parse", bad);
        }
    }

    #[test]
    fn test_nesting_limit() {
        let nested = |n: usize| format!("{}b1{}", "(".repeat(n), ")".repeat(n));
        assert_eq!(eval(&nested(100), &[("b1", 2.0)]), Some(2.0));
        assert!(matches!(Expression::parse(&nested(300)), Err(ProfileError::Expression(_))));
        assert!(matches!(Expression::parse(&"-".repeat(500)), Err(ProfileError::Expression(_))));
        assert!(matches!(
            Expression::parse(&nested(200_000)),
            Err(ProfileError::Expression(_))
        ));
    }

    #[test]
    fn test_length_limit() {
        let long_sum = vec!["b1"; 600].join(" + ");
        assert!(matches!(Expression::parse(&long_sum), Err(ProfileError::Expression(_))));
        let short_sum = vec!["b1"; 100].join(" + ");
        assert_eq!(eval(&short_sum, &[("b1", 1.0)]), Some(100.0));
    }

    #[test]
    fn test_fields() {
        let e: Expression = "(b4 - b3) / (std4 + doy)".parse().unwrap();
        let fields: Vec<_> = e.fields().into_iter().collect();
        assert_eq!(fields, vec!["b3", "b4", "doy", "std4"]);
        assert_eq!(e.to_string(), "(b4 - b3) / (std4 + doy)");
    }
}
