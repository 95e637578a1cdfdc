//! Job run predicates.
//!
//! A predicate is a small boolean tree over category flags and event
//! metadata. It can be written in YAML as a tree:
//!
//! ```yaml
//! when:
//!   any:
//!     - changed: non-rust
//!     - all: [{ event: pull_request }, { branch: main }]
//! ```
//!
//! or as an expression string:
//!
//! ```text
//! changed(non-rust) || (event == pull_request && branch == main)
//! ```

use crate::glob::GlobPattern;
use crate::run::CategoryFlags;
use crate::trigger::EventKind;
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    #[default]
    Always,
    Never,
    /// True when the named category saw a relevant change.
    Changed(String),
    Event(EventKind),
    /// Glob over the target branch (PR base, or pushed branch).
    Branch(String),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
}

/// Inputs a predicate is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub categories: &'a CategoryFlags,
    pub event: EventKind,
    pub target_branch: &'a str,
}

impl Predicate {
    /// Parse an expression string.
    pub fn parse(expression: &str) -> Result<Self> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser {
            expression,
            tokens,
            pos: 0,
        };
        let predicate = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(parser.error(format!("unexpected `{token}`")));
        }
        Ok(predicate)
    }

    /// Compile branch globs so the predicate can be evaluated repeatedly.
    pub fn compile(&self) -> Result<CompiledPredicate> {
        Ok(CompiledPredicate {
            root: Node::compile(self)?,
            source: self.clone(),
        })
    }

    /// Category names referenced anywhere in the tree.
    pub fn categories(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_categories(&mut out);
        out
    }

    fn collect_categories<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Predicate::Changed(category) => {
                out.insert(category.as_str());
            }
            Predicate::All(items) | Predicate::Any(items) => {
                for item in items {
                    item.collect_categories(out);
                }
            }
            Predicate::Not(inner) => inner.collect_categories(out),
            _ => {}
        }
    }

    /// Check that every branch glob compiles.
    pub fn validate(&self) -> Result<()> {
        Node::compile(self).map(|_| ())
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All(items) | Predicate::Any(items) if items.len() > 1 => {
                write!(f, "({self})")
            }
            _ => write!(f, "{self}"),
        }
    }
}

impl FromStr for Predicate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Predicate::parse(s)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Always => f.write_str("true"),
            Predicate::Never => f.write_str("false"),
            Predicate::Changed(category) => write!(f, "changed({category})"),
            Predicate::Event(kind) => write!(f, "event == {kind}"),
            Predicate::Branch(pattern) => write!(f, "branch == {pattern}"),
            Predicate::Not(inner) => match inner.as_ref() {
                Predicate::Event(kind) => write!(f, "event != {kind}"),
                Predicate::Branch(pattern) => write!(f, "branch != {pattern}"),
                other => {
                    f.write_str("!")?;
                    match other {
                        Predicate::All(_) | Predicate::Any(_) => write!(f, "({other})"),
                        _ => other.fmt_operand(f),
                    }
                }
            },
            Predicate::All(items) | Predicate::Any(items) => {
                let op = if matches!(self, Predicate::All(_)) {
                    " && "
                } else {
                    " || "
                };
                match items.len() {
                    0 if matches!(self, Predicate::All(_)) => f.write_str("true"),
                    0 => f.write_str("false"),
                    _ => {
                        for (idx, item) in items.iter().enumerate() {
                            if idx > 0 {
                                f.write_str(op)?;
                            }
                            item.fmt_operand(f)?;
                        }
                        Ok(())
                    }
                }
            }
        }
    }
}

/// A predicate whose branch globs are compiled once, at load time.
#[derive(Debug, Clone)]
pub struct CompiledPredicate {
    source: Predicate,
    root: Node,
}

#[derive(Debug, Clone)]
enum Node {
    Const(bool),
    Changed(String),
    Event(EventKind),
    Branch(GlobPattern),
    All(Vec<Node>),
    Any(Vec<Node>),
    Not(Box<Node>),
}

impl Node {
    fn compile(predicate: &Predicate) -> Result<Self> {
        Ok(match predicate {
            Predicate::Always => Node::Const(true),
            Predicate::Never => Node::Const(false),
            Predicate::Changed(category) => Node::Changed(category.clone()),
            Predicate::Event(kind) => Node::Event(*kind),
            Predicate::Branch(pattern) => Node::Branch(GlobPattern::branch(pattern)?),
            Predicate::All(items) => Node::All(items.iter().map(Node::compile).collect::<Result<_>>()?),
            Predicate::Any(items) => Node::Any(items.iter().map(Node::compile).collect::<Result<_>>()?),
            Predicate::Not(inner) => Node::Not(Box::new(Node::compile(inner)?)),
        })
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> bool {
        match self {
            Node::Const(value) => *value,
            Node::Changed(category) => ctx.categories.get(category),
            Node::Event(kind) => *kind == ctx.event,
            Node::Branch(glob) => glob.matches(ctx.target_branch),
            Node::All(items) => items.iter().all(|n| n.evaluate(ctx)),
            Node::Any(items) => items.iter().any(|n| n.evaluate(ctx)),
            Node::Not(inner) => !inner.evaluate(ctx),
        }
    }
}

impl CompiledPredicate {
    pub fn source(&self) -> &Predicate {
        &self.source
    }

    pub fn evaluate(&self, ctx: &EvaluationContext<'_>) -> bool {
        self.root.evaluate(ctx)
    }
}

impl fmt::Display for CompiledPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.source.fmt(f)
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
    NotEq,
    Word(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Not => f.write_str("!"),
            Token::And => f.write_str("&&"),
            Token::Or => f.write_str("||"),
            Token::Eq => f.write_str("=="),
            Token::NotEq => f.write_str("!="),
            Token::Word(w) => f.write_str(w),
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '*' | '?')
}

fn tokenize(expression: &str) -> Result<Vec<Token>> {
    let invalid = |reason: String| Error::InvalidPredicate {
        expression: expression.to_string(),
        reason,
    };

    let mut tokens = Vec::new();
    let mut chars = expression.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '&' | '|' | '=' => {
                chars.next();
                if chars.next_if_eq(&c).is_none() {
                    return Err(invalid(format!("expected `{c}{c}`")));
                }
                tokens.push(match c {
                    '&' => Token::And,
                    '|' => Token::Or,
                    _ => Token::Eq,
                });
            }
            '\'' | '"' => {
                chars.next();
                let mut word = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == c => break,
                        Some(ch) => word.push(ch),
                        None => return Err(invalid("unterminated string".to_string())),
                    }
                }
                tokens.push(Token::Word(word));
            }
            c if is_word_char(c) => {
                let mut word = String::new();
                while let Some(ch) = chars.next_if(|ch| is_word_char(*ch)) {
                    word.push(ch);
                }
                tokens.push(Token::Word(word));
            }
            other => return Err(invalid(format!("unexpected character `{other}`"))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: impl Into<String>) -> Error {
        Error::InvalidPredicate {
            expression: self.expression.to_string(),
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(self.error(format!("expected `{expected}`, found `{token}`"))),
            None => Err(self.error(format!("expected `{expected}`, found end of input"))),
        }
    }

    fn word(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Word(word)) => Ok(word),
            Some(token) => Err(self.error(format!("expected a name, found `{token}`"))),
            None => Err(self.error("expected a name, found end of input")),
        }
    }

    fn parse_or(&mut self) -> Result<Predicate> {
        let mut items = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Predicate::Any(items)
        })
    }

    fn parse_and(&mut self) -> Result<Predicate> {
        let mut items = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            items.push(self.parse_unary()?);
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Predicate::All(items)
        })
    }

    fn parse_unary(&mut self) -> Result<Predicate> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Predicate::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Predicate> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Word(word)) => match word.as_str() {
                "true" | "always" => Ok(Predicate::Always),
                "false" | "never" => Ok(Predicate::Never),
                "changed" => {
                    self.expect(Token::LParen)?;
                    let category = self.word()?;
                    self.expect(Token::RParen)?;
                    Ok(Predicate::Changed(category))
                }
                "event" => {
                    let negate = self.comparison()?;
                    let value = self.word()?;
                    let kind = value.parse::<EventKind>().map_err(|e| self.error(e))?;
                    Ok(negated(Predicate::Event(kind), negate))
                }
                "branch" => {
                    let negate = self.comparison()?;
                    let pattern = self.word()?;
                    Ok(negated(Predicate::Branch(pattern), negate))
                }
                other => Err(self.error(format!("unknown term `{other}`"))),
            },
            Some(token) => Err(self.error(format!("unexpected `{token}`"))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    /// Consume `==` or `!=`; returns true for `!=`.
    fn comparison(&mut self) -> Result<bool> {
        match self.next() {
            Some(Token::Eq) => Ok(false),
            Some(Token::NotEq) => Ok(true),
            Some(token) => Err(self.error(format!("expected `==` or `!=`, found `{token}`"))),
            None => Err(self.error("expected `==` or `!=`, found end of input")),
        }
    }
}

fn negated(predicate: Predicate, negate: bool) -> Predicate {
    if negate {
        Predicate::Not(Box::new(predicate))
    } else {
        predicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn flags(pairs: &[(&str, bool)]) -> CategoryFlags {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn eval(p: &Predicate, categories: &CategoryFlags, event: EventKind, branch: &str) -> bool {
        p.compile().unwrap().evaluate(&EvaluationContext {
            categories,
            event,
            target_branch: branch,
        })
    }

    #[test]
    fn test_parse_or_of_changed_and_event_branch() {
        let p = Predicate::parse("changed(non-rust) || (event == pull_request && branch == main)")
            .unwrap();
        assert_eq!(
            p,
            Predicate::Any(vec![
                Predicate::Changed("non-rust".into()),
                Predicate::All(vec![
                    Predicate::Event(EventKind::PullRequest),
                    Predicate::Branch("main".into()),
                ]),
            ])
        );
    }

    #[test]
    fn test_or_runs_if_either_holds() {
        let p = Predicate::parse("changed(non-rust) || (event == pull_request && branch == main)")
            .unwrap();
        let none = flags(&[("non-rust", false)]);
        let some = flags(&[("non-rust", true)]);

        assert!(eval(&p, &some, EventKind::Push, "feature"));
        assert!(eval(&p, &none, EventKind::PullRequest, "main"));
        assert!(!eval(&p, &none, EventKind::PullRequest, "develop"));
        assert!(!eval(&p, &none, EventKind::Push, "main"));
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let p = Predicate::parse("true || false && false").unwrap();
        assert_eq!(
            p,
            Predicate::Any(vec![
                Predicate::Always,
                Predicate::All(vec![Predicate::Never, Predicate::Never]),
            ])
        );
    }

    #[test]
    fn test_not_and_inequality() {
        let p = Predicate::parse("!changed(docs) && event != push").unwrap();
        let categories = flags(&[("docs", false)]);
        assert!(eval(&p, &categories, EventKind::PullRequest, "main"));
        assert!(!eval(&p, &categories, EventKind::Push, "main"));
    }

    #[test]
    fn test_branch_glob_and_quotes() {
        let p = Predicate::parse("branch == 'release/*'").unwrap();
        let categories = CategoryFlags::default();
        assert!(eval(&p, &categories, EventKind::Push, "release/v2"));
        assert!(!eval(&p, &categories, EventKind::Push, "main"));
    }

    #[test]
    fn test_unknown_category_is_false() {
        let p = Predicate::Changed("missing".into());
        assert!(!eval(&p, &CategoryFlags::default(), EventKind::Push, "main"));
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "",
            "changed(",
            "changed(a) &&",
            "event == tag",
            "branch main",
            "a & b",
            "(true",
            "true false",
            "frobnicate",
            "'open",
        ] {
            assert!(
                matches!(Predicate::parse(bad), Err(Error::InvalidPredicate { .. })),
                "expected `{bad}` to be rejected"
            );
        }
    }

    #[test]
    fn test_display_parses_back() {
        let source = "(changed(a) || changed(b)) && !(event == push || branch != main)";
        let p = Predicate::parse(source).unwrap();
        let reparsed = Predicate::parse(&p.to_string()).unwrap();
        assert_eq!(p, reparsed);
    }

    #[test]
    fn test_categories_collects_nested() {
        let p = Predicate::parse("changed(b) || !(changed(a) && changed(b))").unwrap();
        assert_eq!(p.categories().into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_validate_rejects_bad_branch_glob() {
        assert!(Predicate::Branch("!main".into()).validate().is_err());
        assert!(Predicate::parse("branch == main").unwrap().validate().is_ok());
        assert!(matches!(
            Predicate::Any(vec![
                Predicate::Changed("a".into()),
                Predicate::Not(Box::new(Predicate::Branch("!main".into()))),
            ])
            .compile(),
            Err(Error::InvalidGlob { .. })
        ));
    }

    #[test]
    fn test_compiled_predicate_keeps_source() {
        let p = Predicate::parse("branch == 'release/**' && event == push").unwrap();
        let compiled = p.compile().unwrap();
        assert_eq!(compiled.source(), &p);
        assert_eq!(compiled.to_string(), p.to_string());

        let categories = CategoryFlags::default();
        let ctx = |branch| EvaluationContext {
            categories: &categories,
            event: EventKind::Push,
            target_branch: branch,
        };
        assert!(compiled.evaluate(&ctx("release/1.2/hotfix")));
        assert!(!compiled.evaluate(&ctx("main")));
    }

    #[test]
    fn test_yaml_tree_form() {
        let yaml = "any:\n  - changed: non-rust\n  - all:\n      - event: pull_request\n      - branch: main\n";
        let p: Predicate = serde_yaml::with::singleton_map_recursive::deserialize(
            serde_yaml::Deserializer::from_str(yaml),
        )
        .unwrap();
        assert_eq!(
            p,
            Predicate::parse("changed(non-rust) || (event == pull_request && branch == main)")
                .unwrap()
        );
    }
}
