//! Glob patterns over item ids.
//!
//! `*` matches any run of characters except `/`, `**` any run including `/`,
//! and `?` exactly one character. Everything else matches literally.

use std::fmt;

use crate::types::{FolioError, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    Segment,
    AnyRun,
}

/// A compiled item-id pattern.
#[derive(Clone, PartialEq, Eq)]
pub struct GlobPattern {
    source: String,
    tokens: Vec<Token>,
}

impl GlobPattern {
    /// Compiles `pattern`. Empty patterns are rejected.
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(FolioError::config("empty item pattern"));
        }
        let mut tokens = Vec::new();
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            let token = match c {
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    Token::AnyRun
                }
                '*' => Token::Segment,
                '?' => Token::AnyChar,
                other => Token::Literal(other),
            };
            tokens.push(token);
        }
        Ok(Self {
            source: pattern.to_owned(),
            tokens,
        })
    }

    /// The pattern text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the whole of `item_id` matches.
    pub fn matches(&self, item_id: &str) -> bool {
        let text: Vec<char> = item_id.chars().collect();
        // reachable[j]: the tokens consumed so far can match text[..j].
        let mut reachable = vec![false; text.len() + 1];
        reachable[0] = true;
        for token in &self.tokens {
            let mut next = vec![false; text.len() + 1];
            match token {
                Token::Literal(c) => {
                    for j in 0..text.len() {
                        next[j + 1] = reachable[j] && text[j] == *c;
                    }
                }
                Token::AnyChar => {
                    for j in 0..text.len() {
                        next[j + 1] = reachable[j];
                    }
                }
                Token::Segment => {
                    next[0] = reachable[0];
                    for j in 0..text.len() {
                        next[j + 1] = reachable[j + 1] || (next[j] && text[j] != '/');
                    }
                }
                Token::AnyRun => {
                    next[0] = reachable[0];
                    for j in 0..text.len() {
                        next[j + 1] = reachable[j + 1] || next[j];
                    }
                }
            }
            reachable = next;
        }
        reachable[text.len()]
    }
}

impl fmt::Debug for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobPattern({:?})", self.source)
    }
}

impl fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Compiles every pattern of an index's `from` list.
pub fn compile_all(patterns: &[String]) -> Result<Vec<GlobPattern>> {
    patterns.iter().map(|p| GlobPattern::new(p)).collect()
}
