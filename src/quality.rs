//! Detectors for degenerate model output.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::TranslationStyle;

const INCOMPLETE_MIN_SOURCE_CHARS: usize = 40;
const INCOMPLETE_MAX_CHARS: usize = 20;
const INCOMPLETE_MAX_TOKENS: usize = 2;
const REPETITION_THRESHOLD: usize = 6;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\.{3,}|…+|<\s*[A-Za-z_]+\s*>|\[\s*[A-Z_]+\s*\])$").expect("valid regex")
});

static SENTENCE_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?。！？\n]+").expect("valid regex"));

/// Near-empty English output for a long source.
pub fn looks_incomplete(source: &str, translated: &str) -> bool {
    let source = source.trim();
    if source.chars().count() < INCOMPLETE_MIN_SOURCE_CHARS {
        return false;
    }
    let translated = translated.trim();
    if translated.is_empty() {
        return true;
    }
    translated.chars().count() <= INCOMPLETE_MAX_CHARS
        && translated.split_whitespace().count() <= INCOMPLETE_MAX_TOKENS
}

/// True when the whole output is one sentence unit repeated at least six times.
///
/// Output without sentence punctuation counts when it tiles with a period of two or
/// more characters that carries text, so rule lines such as `------` never match.
pub fn looks_repetitive(translated: &str) -> bool {
    let units: Vec<String> = SENTENCE_SPLIT
        .split(translated)
        .map(|unit| unit.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|unit| !unit.is_empty())
        .collect();
    match units.as_slice() {
        [] => false,
        [only] => repeats_periodically(only),
        [first, rest @ ..] => {
            units.len() >= REPETITION_THRESHOLD && rest.iter().all(|unit| unit == first)
        }
    }
}

fn repeats_periodically(text: &str) -> bool {
    let chars: Vec<char> = text.chars().filter(|ch| !ch.is_whitespace()).collect();
    let len = chars.len();
    if len < REPETITION_THRESHOLD * 2 {
        return false;
    }
    (2..=len / REPETITION_THRESHOLD)
        .filter(|period| len % period == 0)
        .any(|period| {
            let unit = &chars[..period];
            unit.iter().any(|ch| ch.is_alphanumeric())
                && unit.iter().any(|ch| *ch != unit[0])
                && chars.chunks(period).all(|chunk| chunk == unit)
        })
}

pub fn is_placeholder(text: &str) -> bool {
    PLACEHOLDER.is_match(text.trim())
}

/// `...` or `<TRANSLATION>` echoed back for a source that was real text.
pub fn is_placeholder_output(source: &str, translated: &str) -> bool {
    is_placeholder(translated) && !is_placeholder(source)
}

pub fn exceeds_length_limit(source: &str, translated: &str, style: TranslationStyle) -> bool {
    let source_chars = source.trim().chars().count();
    if source_chars == 0 {
        return false;
    }
    let limit = source_chars as f64 * style.length_ratio();
    translated.trim().chars().count() as f64 > limit
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG_SOURCE: &str =
        "当社グループの当連結会計年度の業績は、売上高、営業利益ともに前年を上回り、過去最高を更新しました。";

    #[test]
    fn incomplete_only_for_long_sources() {
        assert!(looks_incomplete(LONG_SOURCE, ""));
        assert!(looks_incomplete(LONG_SOURCE, "Record results"));
        assert!(!looks_incomplete(
            LONG_SOURCE,
            "Group net sales and operating income both exceeded the prior year."
        ));
        assert!(!looks_incomplete("売上", ""));
    }

    #[test]
    fn repetition_needs_six_units() {
        let five = "Sales rose. ".repeat(5);
        let six = "Sales rose. ".repeat(6);
        assert!(!looks_repetitive(&five));
        assert!(looks_repetitive(&six));
        assert!(looks_repetitive(&"売上高".repeat(8)));
        assert!(!looks_repetitive("Sales rose. Profit fell. Margins held."));
    }

    #[test]
    fn separators_are_not_loops() {
        for line in ["------------", "============", "★★★★★★★★★★★★", "ーーーーーーーーーーーー"] {
            assert!(!looks_repetitive(line), "{line}");
        }
        assert!(!looks_repetitive(&"ab".repeat(5)));
    }

    #[test]
    fn repeated_unit_among_other_content_is_not_a_loop() {
        let mixed = format!("Results improved. {}Outlook is stable.", "Sales rose. ".repeat(6));
        assert!(!looks_repetitive(&mixed));
        let table = "Q1 sales: 10 oku yen.\n".repeat(3) + &"N/A\n".repeat(6);
        assert!(!looks_repetitive(&table));
    }

    #[test]
    fn placeholders_are_detected() {
        assert!(is_placeholder_output("売上", "..."));
        assert!(is_placeholder_output("売上", "<TRANSLATION>"));
        assert!(!is_placeholder_output("...", "..."));
        assert!(!is_placeholder_output("売上", "Sales"));
    }

    #[test]
    fn length_limit_depends_on_style() {
        let source = "売上高";
        assert!(!exceeds_length_limit(source, "Net sales", TranslationStyle::Standard));
        assert!(exceeds_length_limit(source, "Net sales", TranslationStyle::Minimal));
        assert!(!exceeds_length_limit("", "anything", TranslationStyle::Minimal));
    }
}
