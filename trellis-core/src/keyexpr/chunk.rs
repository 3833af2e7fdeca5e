//! Chunk grammar and chunk-level matching.
//!
//! A chunk is one `/`-separated segment. `**` is handled by the sequence
//! matcher; everything here compares single-chunk forms.
//!
//! Chunks starting with `@` are verbatim: no wildcard matches them, only the
//! identical chunk does.

use crate::error::KeyExprError;
use smallvec::SmallVec;

/// Character-level token of an in-chunk pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tok {
    Char(char),
    /// `$*`: any (possibly empty) run of characters
    Star,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Chunk {
    /// `**`
    DoubleWild,
    /// `*`
    Wild,
    /// `{v1,v2,...}`
    Values(SmallVec<[Box<str>; 4]>),
    /// Plain chunk without wildcards
    Literal(Box<str>),
    /// Chunk containing at least one `$*`
    Pattern(Box<[Tok]>),
}

impl Chunk {
    #[inline]
    pub(crate) const fn is_double_wild(&self) -> bool {
        matches!(self, Self::DoubleWild)
    }

    /// Matches more than one concrete chunk
    #[inline]
    pub(crate) const fn is_wild(&self) -> bool {
        !matches!(self, Self::Literal(_))
    }

    #[inline]
    pub(crate) fn is_verbatim(&self) -> bool {
        matches!(self, Self::Literal(l) if l.starts_with(VERBATIM))
    }
}

/// First character of a verbatim chunk.
pub(crate) const VERBATIM: char = '@';

/// Parse and validate one chunk of `expr`.
pub(crate) fn parse_chunk(expr: &str, chunk: &str) -> Result<Chunk, KeyExprError> {
    match chunk {
        "" => return Err(KeyExprError::EmptyChunk(expr.to_owned())),
        "**" => return Ok(Chunk::DoubleWild),
        "*" | "$*" => return Ok(Chunk::Wild),
        _ => {}
    }

    if let Some(ch) = chunk.chars().find(|c| matches!(c, '#' | '?')) {
        return Err(KeyExprError::ForbiddenChar {
            expr: expr.to_owned(),
            ch,
        });
    }

    if chunk.starts_with('{') && chunk.ends_with('}') && chunk.len() >= 2 {
        return parse_value_set(expr, chunk);
    }
    if chunk.contains(['{', '}']) {
        return Err(KeyExprError::InvalidValueSet {
            expr: expr.to_owned(),
            chunk: chunk.to_owned(),
        });
    }

    let invalid_wildcard = || KeyExprError::InvalidWildcard {
        expr: expr.to_owned(),
        chunk: chunk.to_owned(),
    };

    if chunk.starts_with(VERBATIM) {
        if chunk.contains(['$', '*']) {
            return Err(invalid_wildcard());
        }
        return Ok(Chunk::Literal(chunk.into()));
    }

    let mut toks = Vec::with_capacity(chunk.len());
    let mut chars = chunk.chars();
    let mut has_star = false;
    while let Some(c) = chars.next() {
        match c {
            '$' => match chars.next() {
                Some('*') => {
                    has_star = true;
                    toks.push(Tok::Star);
                }
                _ => return Err(invalid_wildcard()),
            },
            '*' => return Err(invalid_wildcard()),
            c => toks.push(Tok::Char(c)),
        }
    }

    if has_star {
        Ok(Chunk::Pattern(toks.into_boxed_slice()))
    } else {
        Ok(Chunk::Literal(chunk.into()))
    }
}

fn parse_value_set(expr: &str, chunk: &str) -> Result<Chunk, KeyExprError> {
    let inner = &chunk[1..chunk.len() - 1];
    let mut values: SmallVec<[Box<str>; 4]> = SmallVec::new();
    for value in inner.split(',') {
        if value.is_empty() || value.starts_with(VERBATIM) || value.contains(['*', '$', '{', '}']) {
            return Err(KeyExprError::InvalidValueSet {
                expr: expr.to_owned(),
                chunk: chunk.to_owned(),
            });
        }
        if !values.iter().any(|v| &**v == value) {
            values.push(value.into());
        }
    }
    if values.len() == 1 {
        return Ok(Chunk::Literal(values.remove(0)));
    }
    Ok(Chunk::Values(values))
}

/// Canonical spelling of an already-valid chunk.
pub(crate) fn canonical_chunk(chunk: &str) -> String {
    if chunk == "$*" {
        return "*".to_owned();
    }
    if chunk.starts_with('{') && chunk.ends_with('}') && chunk.len() >= 2 {
        let mut seen: SmallVec<[&str; 4]> = SmallVec::new();
        for v in chunk[1..chunk.len() - 1].split(',') {
            if !seen.contains(&v) {
                seen.push(v);
            }
        }
        if let [single] = seen.as_slice() {
            return (*single).to_owned();
        }
        return format!("{{{}}}", seen.join(","));
    }
    let mut out = chunk.to_owned();
    while out.contains("$*$*") {
        out = out.replace("$*$*", "$*");
    }
    if out == "$*" {
        "*".to_owned()
    } else {
        out
    }
}

fn literal_toks(s: &str) -> SmallVec<[Tok; 32]> {
    s.chars().map(Tok::Char).collect()
}

/// Does some string match both token patterns?
pub(crate) fn glob_intersects(a: &[Tok], b: &[Tok]) -> bool {
    let (n, m) = (a.len(), b.len());
    let w = m + 1;
    let mut dp = vec![false; (n + 1) * w];
    dp[n * w + m] = true;
    for i in (0..=n).rev() {
        for j in (0..=m).rev() {
            if i == n && j == m {
                continue;
            }
            let v = if i < n && a[i] == Tok::Star {
                dp[(i + 1) * w + j] || (j < m && dp[i * w + j + 1])
            } else if j < m && b[j] == Tok::Star {
                dp[i * w + j + 1] || (i < n && dp[(i + 1) * w + j])
            } else if i == n || j == m {
                false
            } else {
                a[i] == b[j] && dp[(i + 1) * w + j + 1]
            };
            dp[i * w + j] = v;
        }
    }
    dp[0]
}

/// Is every string matched by `b` also matched by `a`?
///
/// Sound but possibly conservative when both sides carry several `$*`.
pub(crate) fn glob_includes(a: &[Tok], b: &[Tok]) -> bool {
    let (n, m) = (a.len(), b.len());
    let w = m + 1;
    let mut dp = vec![false; (n + 1) * w];
    dp[n * w + m] = true;
    for i in (0..=n).rev() {
        for j in (0..=m).rev() {
            if i == n && j == m {
                continue;
            }
            let v = if i < n && a[i] == Tok::Star {
                dp[(i + 1) * w + j] || (j < m && dp[i * w + j + 1])
            } else if i == n || j == m {
                false
            } else {
                match (a[i], b[j]) {
                    (Tok::Char(x), Tok::Char(y)) => x == y && dp[(i + 1) * w + j + 1],
                    _ => false,
                }
            };
            dp[i * w + j] = v;
        }
    }
    dp[0]
}

fn pattern_matches(p: &[Tok], s: &str) -> bool {
    glob_intersects(p, &literal_toks(s))
}

/// Intersection of two single-chunk forms (neither may be `**`).
pub(crate) fn chunk_intersects(a: &Chunk, b: &Chunk) -> bool {
    use Chunk::{DoubleWild, Literal, Pattern, Values, Wild};
    if a.is_verbatim() || b.is_verbatim() {
        return a == b;
    }
    match (a, b) {
        (DoubleWild, _) | (_, DoubleWild) | (Wild, _) | (_, Wild) => true,
        (Literal(x), Literal(y)) => x == y,
        (Values(vs), Values(ws)) => vs.iter().any(|v| ws.contains(v)),
        (Values(vs), Literal(l)) | (Literal(l), Values(vs)) => vs.contains(l),
        (Values(vs), Pattern(p)) | (Pattern(p), Values(vs)) => {
            vs.iter().any(|v| pattern_matches(p, v))
        }
        (Literal(l), Pattern(p)) | (Pattern(p), Literal(l)) => pattern_matches(p, l),
        (Pattern(p), Pattern(q)) => glob_intersects(p, q),
    }
}

/// Inclusion of two single-chunk forms (neither may be `**`).
pub(crate) fn chunk_includes(a: &Chunk, b: &Chunk) -> bool {
    use Chunk::{DoubleWild, Literal, Pattern, Values, Wild};
    if b.is_verbatim() {
        return a == b;
    }
    match (a, b) {
        (DoubleWild | Wild, _) => true,
        (_, DoubleWild | Wild) => false,
        (Literal(x), Literal(y)) => x == y,
        (Literal(x), Values(ws)) => ws.iter().all(|w| w == x),
        (Values(vs), Literal(l)) => vs.contains(l),
        (Values(vs), Values(ws)) => ws.iter().all(|w| vs.contains(w)),
        (Literal(_) | Values(_), Pattern(_)) => false,
        (Pattern(p), Literal(l)) => pattern_matches(p, l),
        (Pattern(p), Values(ws)) => ws.iter().all(|w| pattern_matches(p, w)),
        (Pattern(p), Pattern(q)) => glob_includes(p, q),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(s: &str) -> Chunk {
        parse_chunk(s, s).unwrap()
    }

    #[test]
    fn parses_chunk_forms() {
        assert_eq!(chunk("**"), Chunk::DoubleWild);
        assert_eq!(chunk("*"), Chunk::Wild);
        assert_eq!(chunk("$*"), Chunk::Wild);
        assert!(matches!(chunk("abc"), Chunk::Literal(_)));
        assert!(matches!(chunk("a$*c"), Chunk::Pattern(_)));
        assert!(matches!(chunk("{x,y}"), Chunk::Values(ref v) if v.len() == 2));
    }

    #[test]
    fn rejects_bad_chunks() {
        assert!(matches!(parse_chunk("a/", ""), Err(KeyExprError::EmptyChunk(_))));
        assert!(matches!(
            parse_chunk("a*", "a*"),
            Err(KeyExprError::InvalidWildcard { .. })
        ));
        assert!(matches!(
            parse_chunk("***", "***"),
            Err(KeyExprError::InvalidWildcard { .. })
        ));
        assert!(matches!(
            parse_chunk("a$b", "a$b"),
            Err(KeyExprError::InvalidWildcard { .. })
        ));
        assert!(matches!(
            parse_chunk("a#", "a#"),
            Err(KeyExprError::ForbiddenChar { ch: '#', .. })
        ));
        assert!(matches!(
            parse_chunk("{a,}", "{a,}"),
            Err(KeyExprError::InvalidValueSet { .. })
        ));
        assert!(matches!(
            parse_chunk("a{b", "a{b"),
            Err(KeyExprError::InvalidValueSet { .. })
        ));
    }

    #[test]
    fn in_chunk_wildcards() {
        assert!(chunk_intersects(&chunk("ab$*"), &chunk("abc")));
        assert!(chunk_intersects(&chunk("ab$*"), &chunk("ab")));
        assert!(!chunk_intersects(&chunk("ab$*"), &chunk("ba")));
        assert!(chunk_intersects(&chunk("$*x"), &chunk("y$*")));
        assert!(chunk_includes(&chunk("a$*"), &chunk("ab$*")));
        assert!(!chunk_includes(&chunk("ab$*"), &chunk("a$*")));
    }

    #[test]
    fn value_sets() {
        assert!(chunk_intersects(&chunk("{a,b}"), &chunk("b")));
        assert!(!chunk_intersects(&chunk("{a,b}"), &chunk("c")));
        assert!(chunk_intersects(&chunk("{ax,b}"), &chunk("a$*")));
        assert!(chunk_includes(&chunk("{a,b,c}"), &chunk("{c,a}")));
        assert!(!chunk_includes(&chunk("{a,b}"), &chunk("{a,d}")));
        assert!(chunk_includes(&chunk("a$*"), &chunk("{ab,ac}")));
    }

    #[test]
    fn verbatim_chunks() {
        let admin = chunk("@admin");
        assert!(admin.is_verbatim());
        assert!(chunk_intersects(&admin, &chunk("@admin")));
        assert!(!chunk_intersects(&chunk("*"), &admin));
        assert!(!chunk_intersects(&admin, &chunk("$*admin")));
        assert!(!chunk_includes(&chunk("*"), &admin));
        assert!(chunk_includes(&admin, &chunk("@admin")));
        assert!(matches!(
            parse_chunk("@a$*", "@a$*"),
            Err(KeyExprError::InvalidWildcard { .. })
        ));
        assert!(matches!(
            parse_chunk("{@a,b}", "{@a,b}"),
            Err(KeyExprError::InvalidValueSet { .. })
        ));
    }

    #[test]
    fn single_value_set_is_literal() {
        assert_eq!(chunk("{a}"), Chunk::Literal("a".into()));
        assert_eq!(chunk("{a,a}"), Chunk::Literal("a".into()));
        assert!(!chunk("{a}").is_wild());
        assert_eq!(canonical_chunk("{a,a}"), "a");
    }

    #[test]
    fn canonical_chunks() {
        assert_eq!(canonical_chunk("$*"), "*");
        assert_eq!(canonical_chunk("a$*$*b"), "a$*b");
        assert_eq!(canonical_chunk("$*$*"), "*");
        assert_eq!(canonical_chunk("{a,b,a}"), "{a,b}");
        assert_eq!(canonical_chunk("plain"), "plain");
    }
}
