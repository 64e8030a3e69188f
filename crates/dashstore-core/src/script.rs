//! Compiled scripts: the expressions behind calculated cells
//!
//! A script is written in prefix notation, e.g. `!(+ A B)` or, with tab
//! separators, `!(+\tA\t(* B 2))`. Tokens are:
//!
//! - `( op arg… )`, where `op` is looked up in a static operator table
//! - numbers, `"quoted"` strings, `@millis` dates, `TAG`, `null`
//! - data names, relative to the calculating cell's prefix; names holding
//!   spaces or parentheses are written in brackets: `[Estimated Size]`
//!
//! Running a script never panics on bad data: problems come back as
//! [`EvalError`], which the calculating cell turns into an undefined value.

use std::fmt;

use thiserror::Error;

use crate::error::{DataError, DataResult};
use crate::names::{create_data_name, inheritable_lookup};
use crate::value::{format_number, parse_number, Value, NULL_LITERAL, TAG_LITERAL};

/// Failure while executing a script.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

type EvalResult = Result<Option<Value>, EvalError>;

/// Read access to live cell values during a script run.
pub trait EvalContext {
    /// Prefix that relative names are resolved against.
    fn prefix(&self) -> &str;

    /// Current simple value of an absolute name.
    fn get(&mut self, name: &str) -> Option<Value>;
}

/// A parsed script, ready to run any number of times.
#[derive(Debug, Clone)]
pub struct Script {
    text: String,
    root: Expr,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Option<Value>),
    Name(String),
    Call { op: &'static Operator, args: Vec<Expr> },
}

struct Operator {
    token: &'static str,
    min_args: usize,
    max_args: Option<usize>,
    eval: fn(&mut Evaluator<'_>, &[Expr]) -> EvalResult,
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operator({})", self.token)
    }
}

static OPERATORS: &[Operator] = &[
    Operator { token: "+", min_args: 1, max_args: None, eval: op_add },
    Operator { token: "-", min_args: 1, max_args: None, eval: op_sub },
    Operator { token: "*", min_args: 1, max_args: None, eval: op_mul },
    Operator { token: "/", min_args: 2, max_args: Some(2), eval: op_div },
    Operator { token: "min", min_args: 1, max_args: None, eval: op_min },
    Operator { token: "max", min_args: 1, max_args: None, eval: op_max },
    Operator { token: "=", min_args: 2, max_args: Some(2), eval: op_eq },
    Operator { token: "!=", min_args: 2, max_args: Some(2), eval: op_ne },
    Operator { token: "<", min_args: 2, max_args: Some(2), eval: op_lt },
    Operator { token: ">", min_args: 2, max_args: Some(2), eval: op_gt },
    Operator { token: "<=", min_args: 2, max_args: Some(2), eval: op_le },
    Operator { token: ">=", min_args: 2, max_args: Some(2), eval: op_ge },
    Operator { token: "and", min_args: 1, max_args: None, eval: op_and },
    Operator { token: "or", min_args: 1, max_args: None, eval: op_or },
    Operator { token: "not", min_args: 1, max_args: Some(1), eval: op_not },
    Operator { token: "if", min_args: 2, max_args: Some(3), eval: op_if },
    Operator { token: "defined", min_args: 1, max_args: Some(1), eval: op_defined },
    Operator { token: "concat", min_args: 1, max_args: None, eval: op_concat },
    Operator { token: "list", min_args: 0, max_args: None, eval: op_list },
    Operator { token: "inherit", min_args: 1, max_args: Some(1), eval: op_inherit },
];

fn lookup_operator(token: &str) -> Option<&'static Operator> {
    OPERATORS.iter().find(|op| op.token == token)
}

/// Compile script text. A leading `!` or `{` is accepted and ignored.
pub fn compile(text: &str) -> DataResult<Script> {
    let body = text.strip_prefix('!').or_else(|| text.strip_prefix('{')).unwrap_or(text);
    let tokens = tokenize(body).map_err(|reason| DataError::malformed(text, reason))?;
    let mut pos = 0;
    let root = parse_expr(&tokens, &mut pos).map_err(|reason| DataError::malformed(text, reason))?;
    if pos != tokens.len() {
        return Err(DataError::malformed(text, "unexpected tokens after expression"));
    }
    Ok(Script { text: format!("!{}", body.trim()), root })
}

impl Script {
    /// Text that compiles back to this script.
    pub fn save_string(&self) -> &str {
        &self.text
    }

    /// Evaluate against live values.
    pub fn run(&self, ctx: &mut dyn EvalContext) -> Result<Option<Value>, EvalError> {
        let mut evaluator = Evaluator { ctx };
        evaluator.eval(&self.root)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    Quoted(String),
    Bracketed(String),
    Word(String),
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => return Err("dangling escape in string".into()),
                        },
                        '"' => {
                            closed = true;
                            break;
                        }
                        c => s.push(c),
                    }
                }
                if !closed {
                    return Err("unterminated string".into());
                }
                tokens.push(Token::Quoted(s));
            }
            '[' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    s.push(c);
                }
                if !closed {
                    return Err("unterminated [name]".into());
                }
                tokens.push(Token::Bracketed(s));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

fn parse_expr(tokens: &[Token], pos: &mut usize) -> Result<Expr, String> {
    let token = tokens.get(*pos).ok_or("unexpected end of script")?;
    *pos += 1;
    match token {
        Token::Open => {
            let op_token = match tokens.get(*pos) {
                Some(Token::Word(w)) => w.clone(),
                _ => return Err("expected an operator after '('".into()),
            };
            *pos += 1;
            let op = lookup_operator(&op_token).ok_or_else(|| format!("unknown operator {}", op_token))?;
            let mut args = Vec::new();
            loop {
                match tokens.get(*pos) {
                    Some(Token::Close) => {
                        *pos += 1;
                        break;
                    }
                    Some(_) => args.push(parse_expr(tokens, pos)?),
                    None => return Err("missing ')'".into()),
                }
            }
            if args.len() < op.min_args || op.max_args.is_some_and(|max| args.len() > max) {
                return Err(format!("wrong number of arguments for {}", op.token));
            }
            Ok(Expr::Call { op, args })
        }
        Token::Close => Err("unexpected ')'".into()),
        Token::Quoted(s) => Ok(Expr::Literal(Some(Value::text(s.clone())))),
        Token::Bracketed(name) => Ok(Expr::Name(name.clone())),
        Token::Word(w) => Ok(parse_atom(w)),
    }
}

fn parse_atom(word: &str) -> Expr {
    if word == NULL_LITERAL {
        return Expr::Literal(None);
    }
    if word == TAG_LITERAL {
        return Expr::Literal(Some(Value::Tag));
    }
    if let Some(millis) = word.strip_prefix('@').and_then(|d| d.parse::<i64>().ok()) {
        return Expr::Literal(Some(Value::date(millis)));
    }
    let looks_numeric = word.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '.');
    match parse_number(word) {
        Some(n) if looks_numeric || word == "NaN" => Expr::Literal(Some(Value::number(n))),
        _ => Expr::Name(word.to_string()),
    }
}

struct Evaluator<'a> {
    ctx: &'a mut dyn EvalContext,
}

impl Evaluator<'_> {
    fn eval(&mut self, expr: &Expr) -> EvalResult {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Name(name) => {
                let absolute = create_data_name(Some(self.ctx.prefix()), name);
                Ok(self.ctx.get(&absolute))
            }
            Expr::Call { op, args } => (op.eval)(self, args),
        }
    }

    /// Evaluate every argument as a number; `None` entries are undefined operands.
    fn numbers(&mut self, args: &[Expr], op: &str) -> Result<Vec<Option<f64>>, EvalError> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            match self.eval(arg)? {
                None => out.push(None),
                Some(Value::Number { value, defined, .. }) => out.push(defined.then_some(value)),
                Some(other) => {
                    return Err(EvalError::new(format!(
                        "{} expects numbers, got {}",
                        op,
                        other.save_string()
                    )))
                }
            }
        }
        Ok(out)
    }
}

fn number_result(value: f64, defined: bool) -> EvalResult {
    Ok(Some(Value::number(value).with_defined(defined)))
}

fn bool_result(b: bool) -> EvalResult {
    number_result(if b { 1.0 } else { 0.0 }, true)
}

fn fold_numbers(
    ev: &mut Evaluator<'_>,
    args: &[Expr],
    op: &str,
    f: impl Fn(f64, f64) -> f64,
) -> EvalResult {
    let nums = ev.numbers(args, op)?;
    let defined = nums.iter().all(Option::is_some);
    let mut iter = nums.into_iter().map(|n| n.unwrap_or(0.0));
    let first = iter.next().unwrap_or(0.0);
    number_result(iter.fold(first, f), defined)
}

fn op_add(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    fold_numbers(ev, args, "+", |a, b| a + b)
}

fn op_sub(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    if args.len() == 1 {
        let n = ev.numbers(args, "-")?;
        return number_result(-n[0].unwrap_or(0.0), n[0].is_some());
    }
    fold_numbers(ev, args, "-", |a, b| a - b)
}

fn op_mul(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    fold_numbers(ev, args, "*", |a, b| a * b)
}

fn op_div(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    let n = ev.numbers(args, "/")?;
    match (n[0], n[1]) {
        (Some(_), Some(d)) if d == 0.0 => number_result(f64::NAN, false),
        (Some(a), Some(b)) => number_result(a / b, true),
        (a, b) => number_result(a.unwrap_or(0.0) / b.unwrap_or(1.0), false),
    }
}

fn op_min(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    fold_numbers(ev, args, "min", f64::min)
}

fn op_max(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    fold_numbers(ev, args, "max", f64::max)
}

fn same_value(a: &Option<Value>, b: &Option<Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => match (x.as_number(), y.as_number()) {
            (Some(p), Some(q)) => p == q,
            _ => x.format() == y.format(),
        },
        _ => false,
    }
}

fn op_eq(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    let a = ev.eval(&args[0])?;
    let b = ev.eval(&args[1])?;
    bool_result(same_value(&a, &b))
}

fn op_ne(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    let a = ev.eval(&args[0])?;
    let b = ev.eval(&args[1])?;
    bool_result(!same_value(&a, &b))
}

fn compare(ev: &mut Evaluator<'_>, args: &[Expr], op: &str, f: fn(f64, f64) -> bool) -> EvalResult {
    let n = ev.numbers(args, op)?;
    match (n[0], n[1]) {
        (Some(a), Some(b)) => bool_result(f(a, b)),
        _ => number_result(0.0, false),
    }
}

fn op_lt(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    compare(ev, args, "<", |a, b| a < b)
}

fn op_gt(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    compare(ev, args, ">", |a, b| a > b)
}

fn op_le(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    compare(ev, args, "<=", |a, b| a <= b)
}

fn op_ge(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    compare(ev, args, ">=", |a, b| a >= b)
}

fn truthy(v: &Option<Value>) -> bool {
    v.as_ref().is_some_and(Value::test)
}

fn op_and(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    for arg in args {
        if !truthy(&ev.eval(arg)?) {
            return bool_result(false);
        }
    }
    bool_result(true)
}

fn op_or(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    for arg in args {
        if truthy(&ev.eval(arg)?) {
            return bool_result(true);
        }
    }
    bool_result(false)
}

fn op_not(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    let v = ev.eval(&args[0])?;
    bool_result(!truthy(&v))
}

fn op_if(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    if truthy(&ev.eval(&args[0])?) {
        ev.eval(&args[1])
    } else if let Some(otherwise) = args.get(2) {
        ev.eval(otherwise)
    } else {
        Ok(None)
    }
}

fn op_defined(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    let v = ev.eval(&args[0])?;
    bool_result(v.is_some_and(|v| v.is_defined()))
}

fn op_concat(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    let mut out = String::new();
    for arg in args {
        if let Some(v) = ev.eval(arg)? {
            out.push_str(&v.format());
        }
    }
    Ok(Some(Value::text(out)))
}

fn op_list(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    let mut items = Vec::new();
    for arg in args {
        match ev.eval(arg)? {
            Some(Value::List(inner)) => items.extend(inner),
            Some(v) => items.push(v.format()),
            None => {}
        }
    }
    Ok(Some(Value::List(items)))
}

fn op_inherit(ev: &mut Evaluator<'_>, args: &[Expr]) -> EvalResult {
    let bare = match &args[0] {
        Expr::Name(n) => n.clone(),
        Expr::Literal(Some(Value::Text { value, .. })) => value.clone(),
        Expr::Literal(Some(Value::Number { value, .. })) => format_number(*value),
        _ => return Err(EvalError::new("inherit expects a bare data name")),
    };
    let prefix = ev.ctx.prefix().to_string();
    let ctx = &mut *ev.ctx;
    Ok(inheritable_lookup(&prefix, &bare, |name| ctx.get(name)).map(|(_, v)| v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapContext {
        prefix: String,
        values: HashMap<String, Value>,
        seen: Vec<String>,
    }

    impl MapContext {
        fn new(prefix: &str, values: &[(&str, Value)]) -> Self {
            Self {
                prefix: prefix.to_string(),
                values: values.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
                seen: Vec::new(),
            }
        }
    }

    impl EvalContext for MapContext {
        fn prefix(&self) -> &str {
            &self.prefix
        }

        fn get(&mut self, name: &str) -> Option<Value> {
            self.seen.push(name.to_string());
            self.values.get(name).cloned()
        }
    }

    fn run(text: &str, ctx: &mut MapContext) -> Option<Value> {
        compile(text).unwrap().run(ctx).unwrap()
    }

    #[test]
    fn test_tab_separated_sum() {
        let mut ctx = MapContext::new("/proj", &[("/proj/A", Value::number(5.0)), ("/proj/B", Value::number(3.0))]);
        assert_eq!(run("!(+\tA\tB)", &mut ctx), Some(Value::number(8.0)));
        assert_eq!(ctx.seen, vec!["/proj/A", "/proj/B"]);
    }

    #[test]
    fn test_nested_and_relative_names() {
        let mut ctx = MapContext::new(
            "/proj/task",
            &[("/proj/Rate", Value::number(2.0)), ("/proj/task/Est Size", Value::number(10.0))],
        );
        assert_eq!(run("!(* ../Rate (+ [Est Size] 1))", &mut ctx), Some(Value::number(22.0)));
    }

    #[test]
    fn test_undefined_operand_propagates() {
        let mut ctx = MapContext::new("/p", &[("/p/A", Value::number(5.0))]);
        let v = run("!(+ A Missing)", &mut ctx).unwrap();
        assert!(!v.is_defined());
    }

    #[test]
    fn test_division_by_zero_is_undefined_nan() {
        let mut ctx = MapContext::new("/p", &[]);
        let v = run("!(/ 1 0)", &mut ctx).unwrap();
        assert!(!v.is_defined());
        assert!(matches!(v, Value::Number { value, .. } if value.is_nan()));
    }

    #[test]
    fn test_if_short_circuits() {
        let mut ctx = MapContext::new("/p", &[("/p/Flag", Value::Tag), ("/p/A", Value::number(1.0))]);
        assert_eq!(run("!(if Flag A B)", &mut ctx), Some(Value::number(1.0)));
        assert!(!ctx.seen.contains(&"/p/B".to_string()));
    }

    #[test]
    fn test_inherit_walks_up() {
        let mut ctx = MapContext::new("/a/b/c", &[("/a/Rate", Value::number(7.0))]);
        assert_eq!(run("!(inherit Rate)", &mut ctx), Some(Value::number(7.0)));
    }

    #[test]
    fn test_type_error_is_eval_error() {
        let mut ctx = MapContext::new("/p", &[("/p/T", Value::text("x"))]);
        let err = compile("!(+ T 1)").unwrap().run(&mut ctx).unwrap_err();
        assert!(err.message.contains("expects numbers"));
    }

    #[test]
    fn test_compile_errors() {
        assert!(compile("!(bogus A)").is_err());
        assert!(compile("!(+ A").is_err());
        assert!(compile("!(/ A)").is_err());
        assert!(compile("!(+ A) B").is_err());
        assert!(compile("!(concat \"open)").is_err());
    }

    #[test]
    fn test_save_string_normalizes_prefix() {
        assert_eq!(compile("{(+ A B)").unwrap().save_string(), "!(+ A B)");
        assert_eq!(compile("!(+\tA\tB)").unwrap().save_string(), "!(+\tA\tB)");
    }

    #[test]
    fn test_concat_and_list() {
        let mut ctx = MapContext::new("/p", &[("/p/N", Value::text("x"))]);
        assert_eq!(run("!(concat N \"-\" 2)", &mut ctx), Some(Value::text("x-2")));
        assert_eq!(run("!(list N 2 null)", &mut ctx), Some(Value::list(["x", "2"])));
    }
}
