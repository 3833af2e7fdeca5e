//! Chunk-sequence matching with `**` backtracking.
//!
//! Both relations are computed bottom-up over a `(n + 1) x (m + 1)` table,
//! where cell `(i, j)` answers the question for `a[i..]` against `b[j..]`.

use super::chunk::{chunk_includes, chunk_intersects, Chunk};

pub(crate) fn intersects(a: &[Chunk], b: &[Chunk]) -> bool {
    let (n, m) = (a.len(), b.len());
    let w = m + 1;
    let mut dp = vec![false; (n + 1) * w];
    dp[n * w + m] = true;

    for i in (0..=n).rev() {
        for j in (0..=m).rev() {
            if i == n && j == m {
                continue;
            }
            let v = if i < n && a[i].is_double_wild() {
                // `**` matches nothing here, or swallows a non-verbatim b[j]
                dp[(i + 1) * w + j] || (j < m && !b[j].is_verbatim() && dp[i * w + j + 1])
            } else if j < m && b[j].is_double_wild() {
                dp[i * w + j + 1] || (i < n && !a[i].is_verbatim() && dp[(i + 1) * w + j])
            } else if i == n || j == m {
                false
            } else {
                chunk_intersects(&a[i], &b[j]) && dp[(i + 1) * w + j + 1]
            };
            dp[i * w + j] = v;
        }
    }
    dp[0]
}

pub(crate) fn includes(a: &[Chunk], b: &[Chunk]) -> bool {
    let (n, m) = (a.len(), b.len());
    let w = m + 1;
    let mut dp = vec![false; (n + 1) * w];
    dp[n * w + m] = true;

    for i in (0..=n).rev() {
        for j in (0..=m).rev() {
            if i == n && j == m {
                continue;
            }
            let v = if i < n && a[i].is_double_wild() {
                dp[(i + 1) * w + j] || (j < m && !b[j].is_verbatim() && dp[i * w + j + 1])
            } else if i == n || j == m || b[j].is_double_wild() {
                false
            } else {
                chunk_includes(&a[i], &b[j]) && dp[(i + 1) * w + j + 1]
            };
            dp[i * w + j] = v;
        }
    }
    dp[0]
}
