//! `if:` condition evaluation
//!
//! Expressions are small boolean formulas over strings:
//!
//! ```text
//! $DEPLOY_ENV == 'prod' && !defined("SKIP_DEPLOY")
//! exists("Cargo.toml") || context == "ci"
//! ```
//!
//! Variables resolve against the node's inherited environment, then the
//! orchestrator's environment; a missing variable is the empty string.

use crate::error::ConditionError;
use crate::runner::env::InheritedEnv;
use std::env;
use std::iter::Peekable;
use std::path::Path;
use std::str::CharIndices;

/// Outcome of a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Run,
    Skip,
}

/// What a condition may look at
#[derive(Debug, Clone, Copy)]
pub struct ConditionScope<'a> {
    pub context: Option<&'a str>,
    pub inherited: &'a InheritedEnv,
    pub working_dir: &'a Path,
}

impl ConditionScope<'_> {
    fn var(&self, name: &str) -> Option<String> {
        self.inherited
            .get(name)
            .map(str::to_string)
            .or_else(|| env::var(name).ok())
    }
}

/// Parse and evaluate a condition
pub fn evaluate(expression: &str, scope: &ConditionScope) -> Result<Decision, ConditionError> {
    let expr = parse(expression)?;
    Ok(if expr.eval(scope).is_truthy() {
        Decision::Run
    } else {
        Decision::Skip
    })
}

/// Parse a condition without evaluating it
pub fn parse(expression: &str) -> Result<Expr, ConditionError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or()?;
    match parser.next() {
        None => Ok(expr),
        Some(token) => Err(ConditionError::UnexpectedToken(token.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Str(String),
    Ident(String),
    Var(String),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Not => write!(f, "!"),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Var(s) => write!(f, "${}", s),
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((offset, ch)) = chars.next() {
        let token = match ch {
            c if c.is_whitespace() => continue,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '!' if next_is(&mut chars, '=') => Token::Ne,
            '!' => Token::Not,
            '=' if next_is(&mut chars, '=') => Token::Eq,
            '&' if next_is(&mut chars, '&') => Token::And,
            '|' if next_is(&mut chars, '|') => Token::Or,
            '\'' | '"' => Token::Str(read_string(&mut chars, ch)?),
            '$' => Token::Var(read_variable(&mut chars, offset)?),
            c if is_name_char(c) => {
                let mut name = c.to_string();
                while let Some(&(_, c)) = chars.peek() {
                    if !is_name_char(c) {
                        break;
                    }
                    name.push(c);
                    chars.next();
                }
                Token::Ident(name)
            }
            ch => return Err(ConditionError::UnexpectedChar { ch, offset }),
        };
        tokens.push(token);
    }

    Ok(tokens)
}

fn next_is(chars: &mut Peekable<CharIndices>, expected: char) -> bool {
    chars.next_if(|&(_, c)| c == expected).is_some()
}

fn read_string(chars: &mut Peekable<CharIndices>, quote: char) -> Result<String, ConditionError> {
    let mut value = String::new();
    while let Some((_, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, escaped)) => value.push(escaped),
                None => return Err(ConditionError::UnterminatedString),
            },
            c if c == quote => return Ok(value),
            c => value.push(c),
        }
    }
    Err(ConditionError::UnterminatedString)
}

fn read_variable(chars: &mut Peekable<CharIndices>, offset: usize) -> Result<String, ConditionError> {
    let braced = next_is(chars, '{');
    let mut name = String::new();
    while let Some(&(_, c)) = chars.peek() {
        if !is_name_char(c) {
            break;
        }
        name.push(c);
        chars.next();
    }

    if braced && !next_is(chars, '}') {
        return match chars.peek() {
            Some(&(offset, ch)) => Err(ConditionError::UnexpectedChar { ch, offset }),
            None => Err(ConditionError::UnexpectedEnd),
        };
    }
    if name.is_empty() {
        return Err(ConditionError::UnexpectedChar { ch: '$', offset });
    }
    Ok(name)
}

/// Parsed condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(String),
    Bool(bool),
    Context,
    Var(String),
    Exists(String),
    Defined(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Equal(Box<Expr>, Box<Expr>),
    NotEqual(Box<Expr>, Box<Expr>),
}

enum Value {
    Bool(bool),
    Str(String),
}

impl Value {
    fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty() && s != "0" && s != "false",
        }
    }

    fn into_string(self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => s,
        }
    }
}

impl Expr {
    fn eval(&self, scope: &ConditionScope) -> Value {
        match self {
            Expr::Literal(s) => Value::Str(s.clone()),
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Context => Value::Str(scope.context.unwrap_or_default().to_string()),
            Expr::Var(name) => Value::Str(scope.var(name).unwrap_or_default()),
            Expr::Exists(path) => Value::Bool(scope.working_dir.join(path).exists()),
            Expr::Defined(name) => Value::Bool(scope.var(name).is_some()),
            Expr::Not(inner) => Value::Bool(!inner.eval(scope).is_truthy()),
            Expr::And(l, r) => Value::Bool(l.eval(scope).is_truthy() && r.eval(scope).is_truthy()),
            Expr::Or(l, r) => Value::Bool(l.eval(scope).is_truthy() || r.eval(scope).is_truthy()),
            Expr::Equal(l, r) => Value::Bool(l.eval(scope).into_string() == r.eval(scope).into_string()),
            Expr::NotEqual(l, r) => {
                Value::Bool(l.eval(scope).into_string() != r.eval(scope).into_string())
            }
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
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

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ConditionError> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            Some(t) => Err(ConditionError::UnexpectedToken(t.to_string())),
            None => Err(ConditionError::UnexpectedEnd),
        }
    }

    fn or(&mut self) -> Result<Expr, ConditionError> {
        let mut expr = self.and()?;
        while self.eat(&Token::Or) {
            expr = Expr::Or(Box::new(expr), Box::new(self.and()?));
        }
        Ok(expr)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        let mut expr = self.unary()?;
        while self.eat(&Token::And) {
            expr = Expr::And(Box::new(expr), Box::new(self.unary()?));
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ConditionError> {
        let left = self.primary()?;
        if self.eat(&Token::Eq) {
            return Ok(Expr::Equal(Box::new(left), Box::new(self.primary()?)));
        }
        if self.eat(&Token::Ne) {
            return Ok(Expr::NotEqual(Box::new(left), Box::new(self.primary()?)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        match self.next().ok_or(ConditionError::UnexpectedEnd)? {
            Token::LParen => {
                let expr = self.or()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Token::Str(s) => Ok(Expr::Literal(s)),
            Token::Var(name) => Ok(Expr::Var(name)),
            Token::Ident(ident) => match ident.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "context" => Ok(Expr::Context),
                _ if self.peek() == Some(&Token::LParen) => self.call(ident),
                _ => Err(ConditionError::UnexpectedToken(ident)),
            },
            token => Err(ConditionError::UnexpectedToken(token.to_string())),
        }
    }

    fn call(&mut self, function: String) -> Result<Expr, ConditionError> {
        self.expect(Token::LParen)?;
        let argument = match self.next() {
            Some(Token::Str(s)) => s,
            Some(token) => return Err(ConditionError::UnexpectedToken(token.to_string())),
            None => return Err(ConditionError::UnexpectedEnd),
        };
        self.expect(Token::RParen)?;

        match function.as_str() {
            "exists" => Ok(Expr::Exists(argument)),
            "defined" => Ok(Expr::Defined(argument)),
            _ => Err(ConditionError::UnknownFunction(function)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::env::{ChannelData, Exported};
    use std::fs;
    use tempfile::TempDir;

    fn inherited(pairs: &[(&str, &str)]) -> InheritedEnv {
        let data = ChannelData {
            env: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        };
        let exported = Exported::from_node("setup", &InheritedEnv::default(), data);
        InheritedEnv::merge([("setup", &exported)])
    }

    fn check(expression: &str, env: &InheritedEnv, context: Option<&str>) -> Decision {
        let scope = ConditionScope {
            context,
            inherited: env,
            working_dir: Path::new("/"),
        };
        evaluate(expression, &scope).unwrap()
    }

    #[test]
    fn test_literals() {
        let env = InheritedEnv::default();
        assert_eq!(check("true", &env, None), Decision::Run);
        assert_eq!(check("false", &env, None), Decision::Skip);
        assert_eq!(check("'yes'", &env, None), Decision::Run);
        assert_eq!(check("''", &env, None), Decision::Skip);
        assert_eq!(check("'0'", &env, None), Decision::Skip);
    }

    #[test]
    fn test_variables_and_comparison() {
        let env = inherited(&[("TARGET", "prod"), ("FLAG", "false")]);
        assert_eq!(check("$TARGET == 'prod'", &env, None), Decision::Run);
        assert_eq!(check("${TARGET} != \"prod\"", &env, None), Decision::Skip);
        assert_eq!(check("$FLAG", &env, None), Decision::Skip);
        assert_eq!(check("$RUNBOOK_CONDITION_UNSET == ''", &env, None), Decision::Run);
    }

    #[test]
    fn test_boolean_operators_and_precedence() {
        let env = inherited(&[("A", "1")]);
        assert_eq!(check("false || $A && true", &env, None), Decision::Run);
        assert_eq!(check("!(false || $A)", &env, None), Decision::Skip);
        assert_eq!(check("!false && !''", &env, None), Decision::Run);
        assert_eq!(check("true == 'true'", &env, None), Decision::Run);
    }

    #[test]
    fn test_context() {
        let env = InheritedEnv::default();
        assert_eq!(check("context == 'ci'", &env, Some("ci")), Decision::Run);
        assert_eq!(check("context", &env, None), Decision::Skip);
    }

    #[test]
    fn test_defined_prefers_inherited() {
        let env = inherited(&[("FROM_UPSTREAM", "")]);
        assert_eq!(check("defined('FROM_UPSTREAM')", &env, None), Decision::Run);
        assert_eq!(check("defined('RUNBOOK_CONDITION_UNSET')", &env, None), Decision::Skip);
    }

    #[test]
    fn test_exists_is_relative_to_working_dir() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("marker"), "").unwrap();
        let env = InheritedEnv::default();
        let scope = ConditionScope {
            context: None,
            inherited: &env,
            working_dir: dir.path(),
        };
        assert_eq!(evaluate("exists('marker')", &scope).unwrap(), Decision::Run);
        assert_eq!(evaluate("exists(\"missing\")", &scope).unwrap(), Decision::Skip);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse(""), Err(ConditionError::UnexpectedEnd));
        assert_eq!(parse("'open"), Err(ConditionError::UnterminatedString));
        assert_eq!(parse("a = b"), Err(ConditionError::UnexpectedChar { ch: '=', offset: 2 }));
        assert_eq!(parse("(true"), Err(ConditionError::UnexpectedEnd));
        assert_eq!(parse("true true"), Err(ConditionError::UnexpectedToken("true".to_string())));
        assert_eq!(parse("prod"), Err(ConditionError::UnexpectedToken("prod".to_string())));
        assert_eq!(
            parse("shell('ls')"),
            Err(ConditionError::UnknownFunction("shell".to_string()))
        );
        assert_eq!(parse("$"), Err(ConditionError::UnexpectedChar { ch: '$', offset: 0 }));
    }

    #[test]
    fn test_parse_tree() {
        assert_eq!(
            parse("!$A == 'x'").unwrap(),
            Expr::Not(Box::new(Expr::Equal(
                Box::new(Expr::Var("A".to_string())),
                Box::new(Expr::Literal("x".to_string()))
            )))
        );
    }
}
