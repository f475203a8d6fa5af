//! # Similarity filter
//!
//! Near-duplicate removal for passage batches before they are embedded.
//!
//! Scores are the classic sequence-matcher ratio `2·M / T`, where `M` is the
//! number of characters in the matching blocks found by recursively taking the
//! longest common substring (Ratcliff/Obershelp) and `T` is the combined
//! length of both strings. Characters are Unicode scalar values, so CJK text
//! scores the same way ASCII does.
//!
//! The matcher reproduces the "popular element" heuristic: when the second
//! string has 200 or more characters, characters that occur more than
//! `len / 100 + 1` times in it are never used to seed a match (they can still
//! extend one). This keeps scores comparable with existing thresholds tuned
//! against that behavior; set [`SimilarityFilter::autojunk`] to `false` to
//! score without it.
//!
//! ```
//! use iris_rag::similarity::{SimilarityFilter, ratio};
//!
//! assert_eq!(ratio("abcd", "abce"), 0.75);
//!
//! let filter = SimilarityFilter::default();
//! let kept = filter.dedup(&[
//!     "A short passage about glaucoma symptoms.",
//!     "A short passage about glaucoma symptoms!!",
//!     "   ",
//! ]);
//! assert_eq!(kept, vec!["A short passage about glaucoma symptoms."]);
//! ```

use std::collections::HashMap;

use tracing::debug;

/// Default deduplication threshold θ.
pub const DEFAULT_THRESHOLD: f64 = 0.85;

/// Passages shorter than this (after trimming, in characters) are never kept.
pub const DEFAULT_MIN_CHARS: usize = 2;

/// Length of the second sequence at which the popular-element heuristic kicks in.
const AUTOJUNK_MIN_LEN: usize = 200;

/// Similarity ratio in `[0, 1]` with the popular-element heuristic enabled.
///
/// Argument order matters only when `b` is long enough for the heuristic to
/// apply; `b` is the sequence that gets indexed.
pub fn ratio(a: &str, b: &str) -> f64 {
    SequenceMatcher::new(a, b, true).ratio()
}

/// Longest-common-substring matcher over two character sequences.
struct SequenceMatcher {
    a: Vec<char>,
    b: Vec<char>,
    /// Positions of each non-popular character of `b`, ascending.
    b2j: HashMap<char, Vec<usize>>,
}

impl SequenceMatcher {
    fn new(a: &str, b: &str, autojunk: bool) -> Self {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();

        let mut b2j: HashMap<char, Vec<usize>> = HashMap::new();
        for (j, ch) in b.iter().enumerate() {
            b2j.entry(*ch).or_default().push(j);
        }

        if autojunk && b.len() >= AUTOJUNK_MIN_LEN {
            let ntest = b.len() / 100 + 1;
            b2j.retain(|_, positions| positions.len() <= ntest);
        }

        Self { a, b, b2j }
    }

    /// Longest matching block in `a[alo..ahi]` × `b[blo..bhi]`.
    ///
    /// Among equally long blocks the one starting earliest in `a` wins, then
    /// earliest in `b`. Returns `(i, j, size)`.
    fn find_longest_match(
        &self,
        alo: usize,
        ahi: usize,
        blo: usize,
        bhi: usize,
    ) -> (usize, usize, usize) {
        let (mut besti, mut bestj, mut bestsize) = (alo, blo, 0usize);

        // j2len[j] = length of the match ending at a[i-1], b[j]
        let mut j2len: HashMap<usize, usize> = HashMap::new();
        for i in alo..ahi {
            let mut next: HashMap<usize, usize> = HashMap::new();
            if let Some(positions) = self.b2j.get(&self.a[i]) {
                for &j in positions {
                    if j < blo {
                        continue;
                    }
                    if j >= bhi {
                        break;
                    }
                    let k = j
                        .checked_sub(1)
                        .and_then(|prev| j2len.get(&prev))
                        .copied()
                        .unwrap_or(0)
                        + 1;
                    next.insert(j, k);
                    if k > bestsize {
                        besti = i + 1 - k;
                        bestj = j + 1 - k;
                        bestsize = k;
                    }
                }
            }
            j2len = next;
        }

        // Popular characters never seed a match but may extend one.
        while besti > alo && bestj > blo && self.a[besti - 1] == self.b[bestj - 1] {
            besti -= 1;
            bestj -= 1;
            bestsize += 1;
        }
        while besti + bestsize < ahi
            && bestj + bestsize < bhi
            && self.a[besti + bestsize] == self.b[bestj + bestsize]
        {
            bestsize += 1;
        }

        (besti, bestj, bestsize)
    }

    /// Total number of matched characters across all matching blocks.
    fn matched_chars(&self) -> usize {
        let mut queue = vec![(0, self.a.len(), 0, self.b.len())];
        let mut matched = 0;

        while let Some((alo, ahi, blo, bhi)) = queue.pop() {
            let (i, j, k) = self.find_longest_match(alo, ahi, blo, bhi);
            if k == 0 {
                continue;
            }
            matched += k;
            if alo < i && blo < j {
                queue.push((alo, i, blo, j));
            }
            if i + k < ahi && j + k < bhi {
                queue.push((i + k, ahi, j + k, bhi));
            }
        }

        matched
    }

    fn ratio(&self) -> f64 {
        let total = self.a.len() + self.b.len();
        if total == 0 {
            return 1.0;
        }
        2.0 * self.matched_chars() as f64 / total as f64
    }
}

/// Greedy, order-preserving near-duplicate filter.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityFilter {
    /// Candidates scoring strictly above this against any kept passage are dropped.
    pub threshold: f64,
    /// Minimum trimmed length, in characters, for a passage to be considered at all.
    pub min_chars: usize,
    /// Whether the popular-element heuristic is applied while scoring.
    pub autojunk: bool,
}

impl Default for SimilarityFilter {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_chars: DEFAULT_MIN_CHARS,
            autojunk: true,
        }
    }
}

impl SimilarityFilter {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    /// Score `candidate` against an already accepted passage.
    pub fn score(&self, candidate: &str, accepted: &str) -> f64 {
        SequenceMatcher::new(candidate, accepted, self.autojunk).ratio()
    }

    /// Remove blank, too-short and near-duplicate passages.
    ///
    /// Walks `passages` in order; a passage is kept unless it is shorter than
    /// [`min_chars`](Self::min_chars) after trimming or its score against some
    /// passage kept earlier is strictly greater than [`threshold`](Self::threshold).
    /// Kept passages are returned verbatim (untrimmed) in their original order.
    ///
    /// Runs in `O(n²)` comparisons.
    pub fn dedup<S: AsRef<str>>(&self, passages: &[S]) -> Vec<String> {
        let mut kept: Vec<String> = Vec::new();
        let mut dropped_short = 0usize;
        let mut dropped_similar = 0usize;

        for passage in passages {
            let passage = passage.as_ref();
            if passage.trim().chars().count() < self.min_chars.max(1) {
                dropped_short += 1;
                continue;
            }

            let duplicate = kept
                .iter()
                .any(|existing| self.score(passage, existing) > self.threshold);
            if duplicate {
                dropped_similar += 1;
                continue;
            }

            kept.push(passage.to_string());
        }

        debug!(
            total = passages.len(),
            kept = kept.len(),
            dropped_short,
            dropped_similar,
            threshold = self.threshold,
            "Deduplicated passage batch"
        );

        kept
    }
}
