//! Key expressions.
//!
//! A key expression is a `/`-separated path of chunks naming one or more
//! resources:
//!
//! - `*` matches exactly one chunk
//! - `**` matches zero or more chunks
//! - `$*` inside a chunk matches any run of characters within that chunk
//! - `{v1,v2}` as a whole chunk matches exactly one of the listed values
//! - a chunk starting with `@` is verbatim: only that exact chunk matches it,
//!   wildcards never do
//!
//! ```
//! use trellis_core::keyexpr::KeyExpr;
//!
//! let sub = KeyExpr::new("robot/*/temp").unwrap();
//! let key = KeyExpr::new("robot/arm/temp").unwrap();
//! assert!(sub.intersects(&key));
//! assert!(sub.includes(&key));
//! ```

mod chunk;
mod matcher;

use crate::error::KeyExprError;
use chunk::{canonical_chunk, parse_chunk, Chunk};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

struct Inner {
    text: Box<str>,
    chunks: Box<[Chunk]>,
}

/// An immutable, validated key expression.
///
/// Cloning is a reference-count bump. Equality, ordering and hashing use the
/// textual form.
#[derive(Clone)]
pub struct KeyExpr(Arc<Inner>);

impl KeyExpr {
    /// Validate `expr` and build a key expression.
    ///
    /// Non-canonical spellings (`a/**/**/b`, `a/$*`, `x$*$*`) are rejected with
    /// [`KeyExprError::NotCanonical`]; use [`KeyExpr::autocanonize`] to accept them.
    pub fn new(expr: &str) -> Result<Self, KeyExprError> {
        let chunks = parse(expr)?;
        let canonical = canonical_form(expr);
        if canonical != expr {
            return Err(KeyExprError::NotCanonical {
                expr: expr.to_owned(),
                canonical,
            });
        }
        Ok(Self::from_parts(expr.into(), chunks))
    }

    /// Validate `expr`, rewriting it into canonical form first.
    pub fn autocanonize(expr: &str) -> Result<Self, KeyExprError> {
        parse(expr)?;
        let canonical = canonical_form(expr);
        let chunks = parse(&canonical)?;
        Ok(Self::from_parts(canonical.into_boxed_str(), chunks))
    }

    /// Build a key expression from a trusted literal without validating it.
    ///
    /// Chunks that would fail validation are matched as plain literals.
    pub fn from_string_unchecked(expr: impl Into<String>) -> Self {
        let text: String = expr.into();
        let chunks = text
            .split('/')
            .map(|c| parse_chunk(&text, c).unwrap_or_else(|_| Chunk::Literal(c.into())))
            .collect::<Vec<_>>();
        Self::from_parts(text.into_boxed_str(), chunks.into_boxed_slice())
    }

    fn from_parts(text: Box<str>, chunks: Box<[Chunk]>) -> Self {
        Self(Arc::new(Inner { text, chunks }))
    }

    /// The textual form.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0.text
    }

    /// Does some concrete key match both `self` and `other`?
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || self.0.text == other.0.text
            || matcher::intersects(&self.0.chunks, &other.0.chunks)
    }

    /// Is every key matched by `other` also matched by `self`?
    #[must_use]
    pub fn includes(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || self.0.text == other.0.text
            || matcher::includes(&self.0.chunks, &other.0.chunks)
    }

    /// Does this expression match more than one concrete key?
    #[must_use]
    pub fn is_wild(&self) -> bool {
        self.0.chunks.iter().any(Chunk::is_wild)
    }

    /// Number of chunks.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.0.chunks.len()
    }

    /// Concatenate `self` and `suffix` with a `/` separator.
    ///
    /// The result is canonized, so `a/**` joined with `**/b` gives `a/**/b`.
    pub fn join(&self, suffix: &str) -> Result<Self, KeyExprError> {
        let suffix = suffix.trim_start_matches('/');
        if suffix.is_empty() {
            return Ok(self.clone());
        }
        Self::autocanonize(&format!("{}/{}", self.as_str(), suffix))
    }
}

/// `intersects(a, b)`: free-function form of [`KeyExpr::intersects`].
#[must_use]
pub fn intersects(a: &KeyExpr, b: &KeyExpr) -> bool {
    a.intersects(b)
}

/// `includes(a, b)`: free-function form of [`KeyExpr::includes`].
#[must_use]
pub fn includes(a: &KeyExpr, b: &KeyExpr) -> bool {
    a.includes(b)
}

fn parse(expr: &str) -> Result<Box<[Chunk]>, KeyExprError> {
    if expr.is_empty() {
        return Err(KeyExprError::Empty);
    }
    expr.split('/')
        .map(|c| parse_chunk(expr, c))
        .collect::<Result<Vec<_>, _>>()
        .map(Vec::into_boxed_slice)
}

/// Canonical spelling of a syntactically valid expression.
fn canonical_form(expr: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    for chunk in expr.split('/') {
        let chunk = canonical_chunk(chunk);
        if chunk == "**" && out.last().is_some_and(|prev| prev == "**") {
            continue;
        }
        out.push(chunk);
    }
    out.join("/")
}

impl fmt::Display for KeyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for KeyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyExpr({:?})", self.as_str())
    }
}

impl PartialEq for KeyExpr {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for KeyExpr {}

impl Hash for KeyExpr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl PartialOrd for KeyExpr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyExpr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl AsRef<str> for KeyExpr {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl FromStr for KeyExpr {
    type Err = KeyExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for KeyExpr {
    type Error = KeyExprError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl TryFrom<String> for KeyExpr {
    type Error = KeyExprError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(&s)
    }
}

/// Anything a session operation accepts as a key expression.
pub trait IntoKeyExpr {
    fn into_key_expr(self) -> Result<KeyExpr, KeyExprError>;
}

impl IntoKeyExpr for KeyExpr {
    fn into_key_expr(self) -> Result<KeyExpr, KeyExprError> {
        Ok(self)
    }
}

impl IntoKeyExpr for &KeyExpr {
    fn into_key_expr(self) -> Result<KeyExpr, KeyExprError> {
        Ok(self.clone())
    }
}

impl IntoKeyExpr for &str {
    fn into_key_expr(self) -> Result<KeyExpr, KeyExprError> {
        KeyExpr::new(self)
    }
}

impl IntoKeyExpr for String {
    fn into_key_expr(self) -> Result<KeyExpr, KeyExprError> {
        KeyExpr::new(&self)
    }
}

impl IntoKeyExpr for &String {
    fn into_key_expr(self) -> Result<KeyExpr, KeyExprError> {
        KeyExpr::new(self)
    }
}
