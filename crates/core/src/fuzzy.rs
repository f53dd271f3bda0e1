//! Approximate caption matching.
//!
//! [`partial_ratio`] is the best Indel similarity (0-100) between the shorter
//! string and any equally long window of the longer one, including windows
//! cut short at either end. LCS lengths come from a bit-parallel recurrence
//! over 64-bit words, so each window costs `O(len * len / 64)`.

use std::collections::HashMap;

pub trait CaptionMatcher: Send + Sync {
    /// Similarity of `needle` to its best-matching span of `haystack`, or
    /// `None` when no matcher is available.
    fn partial_score(&self, needle: &str, haystack: &str) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PartialRatioMatcher;

impl CaptionMatcher for PartialRatioMatcher {
    fn partial_score(&self, needle: &str, haystack: &str) -> Option<f64> {
        Some(partial_ratio(needle, haystack))
    }
}

/// Stands in when fuzzy matching is switched off; never scores anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledMatcher;

impl CaptionMatcher for DisabledMatcher {
    fn partial_score(&self, _needle: &str, _haystack: &str) -> Option<f64> {
        None
    }
}

pub fn partial_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return if a.is_empty() && b.is_empty() { 100.0 } else { 0.0 };
    }

    let (needle, haystack) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    let best = best_alignment(needle, haystack);
    if needle.len() == haystack.len() && best < 100.0 {
        best.max(best_alignment(haystack, needle))
    } else {
        best
    }
}

fn similarity(lcs: usize, needle_len: usize, window_len: usize) -> f64 {
    200.0 * lcs as f64 / (needle_len + window_len) as f64
}

fn best_alignment(needle: &[char], haystack: &[char]) -> f64 {
    let m = needle.len();
    let n = haystack.len();
    let mut best: f64 = 0.0;

    // Windows cut short by the start of the haystack.
    let forward = Pattern::new(needle.iter().copied());
    let mut state = forward.fresh();
    for (index, &c) in haystack.iter().take(m - 1).enumerate() {
        forward.step(&mut state, c);
        best = best.max(similarity(forward.lcs(&state), m, index + 1));
    }

    // Windows cut short by its end, read backwards against the reversed needle.
    let backward = Pattern::new(needle.iter().rev().copied());
    let mut state = backward.fresh();
    for (index, &c) in haystack.iter().rev().take(m - 1).enumerate() {
        backward.step(&mut state, c);
        best = best.max(similarity(backward.lcs(&state), m, index + 1));
    }

    // Full-length windows, pruned by a character-histogram upper bound.
    let mut wanted: HashMap<char, usize> = HashMap::new();
    for &c in needle {
        *wanted.entry(c).or_default() += 1;
    }
    let mut window: HashMap<char, usize> = HashMap::new();
    let mut overlap = 0usize;
    let add = |window: &mut HashMap<char, usize>, overlap: &mut usize, c: char| {
        let count = window.entry(c).or_default();
        if *count < wanted.get(&c).copied().unwrap_or(0) {
            *overlap += 1;
        }
        *count += 1;
    };
    for &c in &haystack[..m] {
        add(&mut window, &mut overlap, c);
    }

    for start in 0..=n - m {
        if start > 0 {
            let leaving = haystack[start - 1];
            if let Some(count) = window.get_mut(&leaving) {
                *count -= 1;
                if *count < wanted.get(&leaving).copied().unwrap_or(0) {
                    overlap -= 1;
                }
            }
            add(&mut window, &mut overlap, haystack[start + m - 1]);
        }

        if best >= 100.0 {
            break;
        }
        if similarity(overlap, m, m) <= best {
            continue;
        }

        let mut state = forward.fresh();
        for &c in &haystack[start..start + m] {
            forward.step(&mut state, c);
        }
        best = best.max(similarity(forward.lcs(&state), m, m));
    }

    best
}

/// Match masks of one string for the bit-parallel LCS recurrence.
struct Pattern {
    len: usize,
    words: usize,
    masks: HashMap<char, Vec<u64>>,
}

impl Pattern {
    fn new(chars: impl Iterator<Item = char>) -> Self {
        let chars: Vec<char> = chars.collect();
        let len = chars.len();
        let words = len.div_ceil(64).max(1);
        let mut masks: HashMap<char, Vec<u64>> = HashMap::new();
        for (index, c) in chars.into_iter().enumerate() {
            masks.entry(c).or_insert_with(|| vec![0; words])[index / 64] |= 1 << (index % 64);
        }
        Self { len, words, masks }
    }

    fn fresh(&self) -> Vec<u64> {
        vec![u64::MAX; self.words]
    }

    fn step(&self, state: &mut [u64], c: char) {
        let Some(mask) = self.masks.get(&c) else {
            return;
        };
        let mut carry = false;
        for (word, &matches) in state.iter_mut().zip(mask) {
            let v = *word;
            let u = v & matches;
            let (partial, first) = v.overflowing_add(u);
            let (sum, second) = partial.overflowing_add(carry as u64);
            carry = first || second;
            *word = sum | (v & !matches);
        }
    }

    fn lcs(&self, state: &[u64]) -> usize {
        let mut remaining = self.len;
        let mut zeros = 0;
        for &word in state {
            let bits = remaining.min(64);
            if bits == 0 {
                break;
            }
            let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
            zeros += bits - (word & mask).count_ones() as usize;
            remaining -= bits;
        }
        zeros
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_lcs(a: &[char], b: &[char]) -> usize {
        let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
        for i in 1..=a.len() {
            for j in 1..=b.len() {
                table[i][j] = if a[i - 1] == b[j - 1] {
                    table[i - 1][j - 1] + 1
                } else {
                    table[i - 1][j].max(table[i][j - 1])
                };
            }
        }
        table[a.len()][b.len()]
    }

    fn pseudo_random_text(seed: u64, len: usize) -> Vec<char> {
        let alphabet: Vec<char> = "acgt ".chars().collect();
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                alphabet[(state >> 33) as usize % alphabet.len()]
            })
            .collect()
    }

    #[test]
    fn identical_strings_score_full() {
        assert_eq!(partial_ratio("Fig. 2. Habitus", "Fig. 2. Habitus"), 100.0);
    }

    #[test]
    fn embedded_caption_scores_full() {
        let chunk = "Measurements are given below. Fig. 4. Epigyne, ventral view. The vulva is small.";
        assert_eq!(partial_ratio("Fig. 4. Epigyne, ventral view.", chunk), 100.0);
        assert_eq!(partial_ratio(chunk, "Fig. 4. Epigyne, ventral view."), 100.0);
    }

    #[test]
    fn unrelated_and_empty_inputs_score_zero() {
        assert_eq!(partial_ratio("zzzz", "abcdefgh"), 0.0);
        assert_eq!(partial_ratio("", "abcdefgh"), 0.0);
        assert_eq!(partial_ratio("caption", ""), 0.0);
    }

    #[test]
    fn caption_cut_at_chunk_end_still_matches() {
        let caption = "Fig. 3. Male palp, retrolateral view";
        let chunk = "The tibial apophysis is short and blunt. Fig. 3. Male palp, retrolat";
        let score = partial_ratio(caption, chunk);
        assert!(score >= 85.0, "score {score}");
        assert!(score < 100.0);
    }

    #[test]
    fn either_edge_window_is_considered() {
        // "view" only survives at the start of the haystack.
        let score = partial_ratio("Fig. 9 lateral view", "ral view, and then unrelated prose follows");
        assert!(score > 50.0, "score {score}");
    }

    #[test]
    fn bit_parallel_lcs_agrees_with_dynamic_programming() {
        for seed in 0..20 {
            let a = pseudo_random_text(seed, 70 + seed as usize * 5);
            let b = pseudo_random_text(seed + 100, 90 + seed as usize * 3);
            let pattern = Pattern::new(a.iter().copied());
            let mut state = pattern.fresh();
            for &c in &b {
                pattern.step(&mut state, c);
            }
            assert_eq!(pattern.lcs(&state), naive_lcs(&a, &b), "seed {seed}");
        }
    }

    #[test]
    fn disabled_matcher_never_scores() {
        assert_eq!(DisabledMatcher.partial_score("a", "a"), None);
        assert_eq!(PartialRatioMatcher.partial_score("a", "a"), Some(100.0));
    }
}
