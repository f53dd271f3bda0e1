//! Decides whether a page's embedded text is genuine content or an encoding artifact.
//!
//! Two artifact families are recognised. PDFs with a broken ToUnicode map
//! produce raw glyph codes, which shows up as very few letters among many
//! symbols and digits. Older publications set in a custom glyph encoding
//! store native-script letters as look-alike Latin codepoints; their digits
//! then land inside words (`H3yqaJIHCb`, `pa6oTa`), which authentic prose
//! almost never does.
//!
//! Substantial non-Latin script content short-circuits both checks, so a
//! Cyrillic page dominated by numeric tables stays trusted.

use crate::models::Reliability;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReliabilityThresholds {
    /// Share of non-ASCII letters at or above which text is always trusted.
    pub non_latin_share: f64,
    /// Letters per non-whitespace character below which text is garbled.
    pub min_alpha_ratio: f64,
    /// Digit-inside-word occurrences per non-whitespace character above which text is garbled.
    pub max_digit_in_word_rate: f64,
}

impl Default for ReliabilityThresholds {
    fn default() -> Self {
        Self {
            non_latin_share: 0.15,
            min_alpha_ratio: 0.4,
            max_digit_in_word_rate: 0.005,
        }
    }
}

pub fn nonws_len(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

/// Returns [`Reliability::Reliable`] or [`Reliability::Garbled`]; never `Sparse`.
pub fn classify(text: &str, thresholds: &ReliabilityThresholds) -> Reliability {
    let non_ws = nonws_len(text);
    if non_ws == 0 {
        return Reliability::Reliable;
    }
    let total = non_ws as f64;

    let non_latin = text
        .chars()
        .filter(|c| c.is_alphabetic() && !c.is_ascii())
        .count();
    if non_latin as f64 / total >= thresholds.non_latin_share {
        return Reliability::Reliable;
    }

    let alpha = text.chars().filter(|c| c.is_alphabetic()).count();
    if (alpha as f64 / total) < thresholds.min_alpha_ratio {
        return Reliability::Garbled;
    }

    if digits_inside_words(text) as f64 / total > thresholds.max_digit_in_word_rate {
        Reliability::Garbled
    } else {
        Reliability::Reliable
    }
}

fn digits_inside_words(text: &str) -> usize {
    let chars: Vec<char> = text.chars().collect();
    chars
        .windows(3)
        .filter(|window| {
            window[0].is_alphabetic() && window[1].is_ascii_digit() && window[2].is_alphabetic()
        })
        .count()
}
