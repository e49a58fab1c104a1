//! Derived-dimension formulas.
//!
//! A formula is a small arithmetic expression over a fixed allow-list of
//! source dimensions, e.g. `max(cpu_core_hours, memory_byte_hours / 2**30)`.
//! Formulas are parsed once into an expression tree and evaluated per
//! entity. Nothing beyond arithmetic and the functions below is reachable.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/' | '//' | '%') unary)*
//! unary   := ('-' | '+') unary | power
//! power   := primary ('**' unary)?
//! primary := number | input | function '(' expr (',' expr)* ')' | '(' expr ')'
//! ```
//!
//! Functions: `abs`, `min`, `max`, `round`, `int`, `float`.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, error, info, warn};

use crate::error::{CoreError, Result};
use crate::usage::AggregatedQuantity;

/// Deepest nesting of parentheses, calls and unary operators a formula may use.
pub const MAX_NESTING: usize = 32;

/// Longest accepted formula source, in characters.
pub const MAX_FORMULA_LEN: usize = 1024;

/// Source dimensions a formula may read. Missing ones evaluate to zero.
pub const ALLOWED_INPUTS: [&str; 3] = [
    "cpu_core_hours",
    "memory_byte_hours",
    "storage_allocated_byte_hours",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Rem,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Abs,
    Min,
    Max,
    Round,
    Int,
    Float,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "abs" => Some(Self::Abs),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "round" => Some(Self::Round),
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            _ => None,
        }
    }

    fn accepts(self, arity: usize) -> bool {
        match self {
            Self::Abs | Self::Int | Self::Float => arity == 1,
            Self::Round => arity == 1 || arity == 2,
            Self::Min | Self::Max => arity >= 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Input(&'static str),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

impl Expr {
    fn evaluate(&self, inputs: &BTreeMap<String, u64>) -> std::result::Result<f64, String> {
        let value = match self {
            Self::Number(n) => *n,
            #[allow(clippy::cast_precision_loss)]
            Self::Input(name) => inputs.get(*name).copied().unwrap_or(0) as f64,
            Self::Neg(inner) => -inner.evaluate(inputs)?,
            Self::Binary(op, lhs, rhs) => {
                let lhs = lhs.evaluate(inputs)?;
                let rhs = rhs.evaluate(inputs)?;
                apply(*op, lhs, rhs)?
            }
            Self::Call(function, args) => {
                let args = args
                    .iter()
                    .map(|arg| arg.evaluate(inputs))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                call(*function, &args)
            }
        };

        if value.is_finite() {
            Ok(value)
        } else {
            Err("result is not a finite number".into())
        }
    }
}

fn apply(op: BinaryOp, lhs: f64, rhs: f64) -> std::result::Result<f64, String> {
    let zero_divisor = rhs == 0.0;
    match op {
        BinaryOp::Add => Ok(lhs + rhs),
        BinaryOp::Sub => Ok(lhs - rhs),
        BinaryOp::Mul => Ok(lhs * rhs),
        BinaryOp::Div if zero_divisor => Err("division by zero".into()),
        BinaryOp::Div => Ok(lhs / rhs),
        BinaryOp::FloorDiv if zero_divisor => Err("division by zero".into()),
        BinaryOp::FloorDiv => Ok((lhs / rhs).floor()),
        BinaryOp::Rem if zero_divisor => Err("modulo by zero".into()),
        // Floored modulo: the result takes the sign of the divisor.
        BinaryOp::Rem => Ok(lhs - rhs * (lhs / rhs).floor()),
        BinaryOp::Pow => Ok(lhs.powf(rhs)),
    }
}

fn call(function: Function, args: &[f64]) -> f64 {
    match function {
        Function::Abs => args[0].abs(),
        Function::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
        Function::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Function::Round => match args.get(1) {
            None => round_half_even(args[0]),
            Some(digits) => {
                let scale = 10f64.powf(digits.trunc());
                round_half_even(args[0] * scale) / scale
            }
        },
        Function::Int => args[0].trunc(),
        Function::Float => args[0],
    }
}

#[allow(clippy::float_cmp)]
fn round_half_even(x: f64) -> f64 {
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        x.round()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,
    Percent,
    LParen,
    RParen,
    Comma,
}

fn tokenize(source: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::StarStar);
                i += 2;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                tokens.push(Token::SlashSlash);
                i += 2;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '_')
                {
                    i += 1;
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    i += 1;
                    if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                        i += 1;
                    }
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number literal '{text}'"))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{other}'")),
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

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: &Token) -> std::result::Result<(), String> {
        match self.bump() {
            Some(ref token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {expected:?}, found {token:?}")),
            None => Err(format!("expected {expected:?}, found end of input")),
        }
    }

    fn expr(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::SlashSlash) => BinaryOp::FloorDiv,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> std::result::Result<Expr, String> {
        // Every nesting construct recurses through here.
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(format!("expression nested deeper than {MAX_NESTING} levels"));
        }
        let expr = self.unary_inner();
        self.depth -= 1;
        expr
    }

    fn unary_inner(&mut self) -> std::result::Result<Expr, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> std::result::Result<Expr, String> {
        let base = self.primary()?;
        if self.peek() == Some(&Token::StarStar) {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> std::result::Result<Expr, String> {
        match self.bump() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    self.call(&name)
                } else {
                    ALLOWED_INPUTS
                        .iter()
                        .find(|allowed| **allowed == name)
                        .map(|allowed| Expr::Input(*allowed))
                        .ok_or_else(|| format!("unknown input '{name}'"))
                }
            }
            Some(token) => Err(format!("unexpected token {token:?}")),
            None => Err("unexpected end of input".into()),
        }
    }

    fn call(&mut self, name: &str) -> std::result::Result<Expr, String> {
        let function = Function::lookup(name).ok_or_else(|| format!("unknown function '{name}'"))?;
        let mut args = vec![self.expr()?];
        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            args.push(self.expr()?);
        }
        self.expect(&Token::RParen)?;

        if !function.accepts(args.len()) {
            return Err(format!("{name}() does not take {} arguments", args.len()));
        }
        Ok(Expr::Call(function, args))
    }
}

/// A compiled derived-dimension formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    /// Parse a formula.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::FormulaSyntax` for malformed expressions, unknown
    /// inputs, unknown functions, wrong argument counts, nesting deeper than
    /// `MAX_NESTING`, or sources longer than `MAX_FORMULA_LEN`.
    pub fn parse(source: &str) -> Result<Self> {
        let syntax = |message: String| CoreError::FormulaSyntax {
            formula: source.to_string(),
            message,
        };

        if source.chars().count() > MAX_FORMULA_LEN {
            return Err(syntax(format!(
                "formula longer than {MAX_FORMULA_LEN} characters"
            )));
        }

        let tokens = tokenize(source).map_err(syntax)?;
        if tokens.is_empty() {
            return Err(syntax("empty formula".into()));
        }

        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr().map_err(syntax)?;
        if let Some(token) = parser.peek() {
            return Err(syntax(format!("unexpected trailing token {token:?}")));
        }

        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// The formula source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against one entity's dimension totals.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::FormulaEvaluation` on division by zero, a
    /// non-finite result, or a negative result.
    pub fn evaluate(&self, inputs: &BTreeMap<String, u64>) -> Result<f64> {
        let value = self
            .expr
            .evaluate(inputs)
            .map_err(CoreError::FormulaEvaluation)?;
        if value < 0.0 {
            return Err(CoreError::FormulaEvaluation(format!(
                "formula must evaluate to a non-negative number, got {value}"
            )));
        }
        Ok(value)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Named derived dimensions, applied in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DimensionFormulas {
    formulas: Vec<(String, Formula)>,
}

impl DimensionFormulas {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named formula.
    ///
    /// # Errors
    ///
    /// Returns an error if the formula does not parse or the name is
    /// already defined.
    pub fn insert(&mut self, name: impl Into<String>, source: &str) -> Result<()> {
        let name = name.into();
        if self.formulas.iter().any(|(existing, _)| *existing == name) {
            return Err(CoreError::FormulaSyntax {
                formula: source.to_string(),
                message: format!("duplicate dimension name '{name}'"),
            });
        }
        let formula = Formula::parse(source)?;
        self.formulas.push((name, formula));
        Ok(())
    }

    /// Whether no formulas are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }

    /// Number of configured formulas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    /// Iterate `(name, formula)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Formula)> {
        self.formulas.iter().map(|(name, formula)| (name.as_str(), formula))
    }

    /// Replace each entity's dimensions with the derived ones.
    ///
    /// An entity whose formulas do not all succeed contributes nothing:
    /// partially derived usage is never returned.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn derive(&self, aggregated: &AggregatedQuantity) -> AggregatedQuantity {
        if self.formulas.is_empty() {
            return aggregated.clone();
        }

        let mut derived = AggregatedQuantity::new();
        'entities: for (entity_id, dimensions) in aggregated.by_entity() {
            let mut values = Vec::with_capacity(self.formulas.len());
            for (name, formula) in &self.formulas {
                match formula.evaluate(&dimensions) {
                    Ok(value) => {
                        debug!(
                            entity_id = %entity_id,
                            dimension = %name,
                            value,
                            formula = %formula,
                            "Derived dimension"
                        );
                        values.push((name, value.trunc() as u64));
                    }
                    Err(e) => {
                        error!(
                            entity_id = %entity_id,
                            dimension = %name,
                            formula = %formula,
                            error = %e,
                            "Formula failed, dropping all derived usage for entity"
                        );
                        continue 'entities;
                    }
                }
            }
            for (name, quantity) in values {
                derived.set(&entity_id, name, quantity);
            }
        }

        if derived.is_empty() {
            warn!("No valid derived dimension data was generated; check the dimension formulas");
        } else {
            info!(
                source_entries = aggregated.len(),
                derived_entries = derived.len(),
                "Derived custom dimensions"
            );
        }
        derived
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    fn eval(source: &str, pairs: &[(&str, u64)]) -> Result<f64> {
        Formula::parse(source)?.evaluate(&inputs(pairs))
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(eval("1 + 2 * 3", &[]).unwrap(), 7.0);
        assert_eq!(eval("(1 + 2) * 3", &[]).unwrap(), 9.0);
        assert_eq!(eval("2 ** 3 ** 2", &[]).unwrap(), 512.0);
        assert_eq!(eval("10 - 4 - 3", &[]).unwrap(), 3.0);
        assert_eq!(eval("7 // 2 + 7 % 3", &[]).unwrap(), 4.0);
        assert_eq!(eval("-2 ** 2 + 10", &[]).unwrap(), 6.0);
    }

    #[test]
    fn reads_allowed_inputs() {
        let value = eval(
            "cpu_core_hours * 2 + memory_byte_hours / 1024",
            &[("cpu_core_hours", 5), ("memory_byte_hours", 2048)],
        )
        .unwrap();
        assert_eq!(value, 12.0);
    }

    #[test]
    fn missing_inputs_are_zero() {
        assert_eq!(eval("storage_allocated_byte_hours + 1", &[]).unwrap(), 1.0);
    }

    #[test]
    fn functions() {
        assert_eq!(eval("max(1, 5, 3)", &[]).unwrap(), 5.0);
        assert_eq!(eval("min(4, 2)", &[]).unwrap(), 2.0);
        assert_eq!(eval("abs(0 - 3)", &[]).unwrap(), 3.0);
        assert_eq!(eval("int(3.9)", &[]).unwrap(), 3.0);
        assert_eq!(eval("round(2.5)", &[]).unwrap(), 2.0);
        assert_eq!(eval("round(3.5)", &[]).unwrap(), 4.0);
        assert_eq!(eval("round(1.234, 2)", &[]).unwrap(), 1.23);
        assert_eq!(eval("float(2)", &[]).unwrap(), 2.0);
    }

    #[test]
    fn rejects_unknown_names() {
        assert!(matches!(
            Formula::parse("__import__('os')"),
            Err(CoreError::FormulaSyntax { .. })
        ));
        assert!(Formula::parse("gpu_hours * 2").is_err());
        assert!(Formula::parse("exec(1)").is_err());
    }

    #[test]
    fn deep_nesting_is_a_syntax_error() {
        let parens = format!("{}1{}", "(".repeat(5000), ")".repeat(5000));
        let negations = format!("{}1", "-".repeat(5000));
        for source in [parens, negations] {
            assert!(matches!(
                Formula::parse(&source),
                Err(CoreError::FormulaSyntax { .. })
            ));
        }

        let within = format!("{}1{}", "(".repeat(MAX_NESTING - 1), ")".repeat(MAX_NESTING - 1));
        assert_eq!(eval(&within, &[]).unwrap(), 1.0);

        let too_deep = format!("{}1{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(Formula::parse(&too_deep).is_err());
    }

    #[test]
    fn overlong_formula_is_a_syntax_error() {
        let long = vec!["1"; MAX_FORMULA_LEN].join("+");
        assert!(matches!(
            Formula::parse(&long),
            Err(CoreError::FormulaSyntax { .. })
        ));
    }

    #[test]
    fn rejects_malformed_syntax() {
        assert!(Formula::parse("").is_err());
        assert!(Formula::parse("1 +").is_err());
        assert!(Formula::parse("(1 + 2").is_err());
        assert!(Formula::parse("1 2").is_err());
        assert!(Formula::parse("abs(1, 2)").is_err());
        assert!(Formula::parse("max(1)").is_err());
        assert!(Formula::parse("cpu_core_hours; 1").is_err());
    }

    #[test]
    fn evaluation_failures() {
        assert!(matches!(
            eval("1 / cpu_core_hours", &[]),
            Err(CoreError::FormulaEvaluation(_))
        ));
        assert!(eval("0 - 1", &[]).is_err());
        assert!(eval("10 ** 400", &[]).is_err());
    }

    #[test]
    fn derive_replaces_source_dimensions() {
        let mut formulas = DimensionFormulas::new();
        formulas.insert("compute_units", "cpu_core_hours * 2").unwrap();

        let mut aggregated = AggregatedQuantity::new();
        aggregated.add("E1", "cpu_core_hours", 3);
        aggregated.add("E1", "memory_byte_hours", 100);

        let derived = formulas.derive(&aggregated);
        assert_eq!(derived.len(), 1);
        assert_eq!(derived.get("E1", "compute_units"), Some(6));
    }

    #[test]
    fn derive_is_fail_closed_per_entity() {
        let mut formulas = DimensionFormulas::new();
        formulas.insert("ok", "cpu_core_hours + 1").unwrap();
        formulas.insert("ratio", "cpu_core_hours / memory_byte_hours").unwrap();

        let mut aggregated = AggregatedQuantity::new();
        aggregated.add("E1", "cpu_core_hours", 4);
        aggregated.add("E1", "memory_byte_hours", 2);
        aggregated.add("E2", "cpu_core_hours", 4);

        let derived = formulas.derive(&aggregated);
        assert_eq!(derived.get("E1", "ok"), Some(5));
        assert_eq!(derived.get("E1", "ratio"), Some(2));
        assert_eq!(derived.get("E2", "ok"), None);
        assert_eq!(derived.get("E2", "ratio"), None);
        assert_eq!(derived.entities(), vec!["E1".to_string()]);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut formulas = DimensionFormulas::new();
        formulas.insert("a", "1").unwrap();
        assert!(formulas.insert("a", "2").is_err());
        assert_eq!(formulas.len(), 1);
    }

    #[test]
    fn empty_set_passes_through() {
        let formulas = DimensionFormulas::new();
        let mut aggregated = AggregatedQuantity::new();
        aggregated.add("E1", "dimA", 1);
        assert_eq!(formulas.derive(&aggregated), aggregated);
    }
}
