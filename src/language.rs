//! Script-based language detection and output-language guards.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use unicode_normalization::UnicodeNormalization;

use crate::models::OutputLanguage;
use crate::notation::{Decimal, INT_WITH_OPTIONAL_COMMAS as INT};

const MAX_ANALYSIS_LENGTH: usize = 500;
const JAPANESE_THRESHOLD: f64 = 0.3;
const JAPANESE_PUNCTUATION: [char; 6] = ['、', '・', '「', '」', '『', '』'];
const CHINESE_PUNCTUATION_HINTS: [char; 3] = ['，', '；', '：'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DetectedLanguage {
    Japanese,
    English,
    Chinese,
    Korean,
}

impl DetectedLanguage {
    /// Display label used in results and prompts.
    pub fn label(&self) -> &'static str {
        match self {
            DetectedLanguage::Japanese => "日本語",
            DetectedLanguage::English => "英語",
            DetectedLanguage::Chinese => "中国語",
            DetectedLanguage::Korean => "韓国語",
        }
    }

    /// Japanese input is translated to English, everything else to Japanese.
    pub fn output_language(&self) -> OutputLanguage {
        match self {
            DetectedLanguage::Japanese => OutputLanguage::En,
            _ => OutputLanguage::Jp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionReason {
    Empty,
    Kana,
    Hangul,
    Latin,
    CjkFallback,
    Default,
}

fn is_hiragana(ch: char) -> bool {
    ('\u{3040}'..='\u{309F}').contains(&ch)
}

fn is_katakana(ch: char) -> bool {
    ('\u{30A0}'..='\u{30FF}').contains(&ch)
        || ('\u{31F0}'..='\u{31FF}').contains(&ch)
        || ('\u{FF65}'..='\u{FF9F}').contains(&ch)
}

fn is_kana(ch: char) -> bool {
    is_hiragana(ch) || is_katakana(ch)
}

fn is_cjk_ideograph(ch: char) -> bool {
    ('\u{4E00}'..='\u{9FFF}').contains(&ch)
}

fn is_hangul(ch: char) -> bool {
    ('\u{AC00}'..='\u{D7AF}').contains(&ch)
        || ('\u{1100}'..='\u{11FF}').contains(&ch)
        || ('\u{3130}'..='\u{318F}').contains(&ch)
}

fn is_latin(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ('\u{00C0}'..='\u{024F}').contains(&ch)
}

fn is_japanese_char(ch: char) -> bool {
    is_kana(ch) || is_cjk_ideograph(ch)
}

fn is_punctuation(ch: char) -> bool {
    ch.is_ascii_punctuation()
        || ('\u{2010}'..='\u{2027}').contains(&ch)
        || ('\u{2030}'..='\u{205E}').contains(&ch)
        || ('\u{3001}'..='\u{3003}').contains(&ch)
        || ('\u{3008}'..='\u{3011}').contains(&ch)
        || ('\u{3014}'..='\u{301F}').contains(&ch)
        || ch == '\u{30FB}'
        || matches!(
            ch,
            '！' | '＂' | '＃' | '％' | '＆' | '＇' | '（' | '）' | '＊' | '，' | '－' | '．'
                | '／' | '：' | '；' | '？' | '＠' | '［' | '＼' | '］' | '＿' | '｛' | '｝'
                | '｡' | '｢' | '｣' | '､'
        )
}

fn meaningful_chars(text: &str) -> impl Iterator<Item = char> + '_ {
    text.chars()
        .take(MAX_ANALYSIS_LENGTH)
        .filter(|ch| !ch.is_whitespace() && !is_punctuation(*ch))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LanguageDetector;

impl LanguageDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&self, text: &str) -> DetectedLanguage {
        self.detect_with_reason(text).0
    }

    pub fn detect_with_reason(&self, text: &str) -> (DetectedLanguage, DetectionReason) {
        let mut total = 0usize;
        let mut latin = 0usize;
        let mut has_cjk = false;
        for ch in meaningful_chars(text) {
            total += 1;
            if is_kana(ch) {
                return (DetectedLanguage::Japanese, DetectionReason::Kana);
            }
            if is_hangul(ch) {
                return (DetectedLanguage::Korean, DetectionReason::Hangul);
            }
            if is_cjk_ideograph(ch) {
                has_cjk = true;
            } else if is_latin(ch) {
                latin += 1;
            }
        }
        if total == 0 {
            return (DetectedLanguage::Japanese, DetectionReason::Empty);
        }
        if latin as f64 / total as f64 > 0.5 {
            return (DetectedLanguage::English, DetectionReason::Latin);
        }
        if has_cjk {
            return (DetectedLanguage::Japanese, DetectionReason::CjkFallback);
        }
        (DetectedLanguage::Japanese, DetectionReason::Default)
    }

    pub fn is_japanese(&self, text: &str) -> bool {
        self.is_japanese_with_threshold(text, JAPANESE_THRESHOLD)
    }

    /// Share of kana/kanji among meaningful characters is at least `threshold`.
    pub fn is_japanese_with_threshold(&self, text: &str, threshold: f64) -> bool {
        let mut total = 0usize;
        let mut japanese = 0usize;
        for ch in meaningful_chars(text) {
            total += 1;
            if is_japanese_char(ch) {
                japanese += 1;
            }
        }
        total > 0 && japanese as f64 / total as f64 >= threshold
    }
}

/// Kana-less CJK text that reads as Chinese rather than a Japanese heading.
pub fn looks_like_chinese(text: &str) -> bool {
    if text.is_empty() || text.chars().any(is_kana) {
        return false;
    }
    let cjk_count = text.chars().filter(|ch| is_cjk_ideograph(*ch)).count();
    if cjk_count == 0 {
        return false;
    }
    if text.contains(CHINESE_PUNCTUATION_HINTS) {
        return true;
    }
    if text.contains(JAPANESE_PUNCTUATION) {
        return false;
    }
    (text.ends_with('。') && cjk_count >= 8) || cjk_count >= 25
}

static JP_OKU_AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?:(?P<sign>[▲+\-])\s*)?(?:(?P<trillion>{INT})兆(?:(?P<oku>{INT})億)?|(?P<oku_only>{INT})億)(?P<yen>円)?"
    ))
    .expect("valid oku regex")
});

static JP_MAN_YEN_AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?:(?P<sign>[▲+\-])\s*)?(?P<man>{INT})万円"))
        .expect("valid man regex")
});

static JP_YEN_AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?:(?P<sign>[▲+\-])\s*)?(?P<yen>{INT})円")).expect("valid yen regex")
});

fn signed(value: Decimal, sign: &str) -> String {
    match sign.trim() {
        "" => value.format_grouped(),
        "▲" => format!("-{}", value.format_grouped()),
        other => format!("{other}{}", value.format_grouped()),
    }
}

/// Rewrites leftover JP punctuation and yen units so the EN guard only sees real script leaks.
pub fn normalize_en_for_language_guard(text: &str) -> String {
    let normalized: String = text.nfkc().collect::<String>().trim().to_string();
    if normalized.is_empty() {
        return normalized;
    }
    let normalized: String = normalized
        .chars()
        .map(|ch| match ch {
            '、' => ',',
            '・' => '·',
            '「' | '」' | '『' | '』' => '"',
            other => other,
        })
        .collect();
    let normalized = JP_OKU_AMOUNT.replace_all(&normalized, |caps: &Captures| {
        let total = match (caps.name("trillion"), caps.name("oku"), caps.name("oku_only")) {
            (Some(trillion), oku, _) => Decimal::parse(trillion.as_str())
                .and_then(|value| value.checked_mul_int(10_000))
                .and_then(|value| match oku {
                    Some(oku) => value.checked_add(Decimal::parse(oku.as_str())?),
                    None => Some(value),
                }),
            (None, _, Some(oku_only)) => Decimal::parse(oku_only.as_str()),
            _ => None,
        };
        let Some(total) = total else {
            return caps[0].to_string();
        };
        let sign = caps.name("sign").map_or("", |sign| sign.as_str());
        let unit = if caps.name("yen").is_some() { "oku yen" } else { "oku" };
        format!("{} {unit}", signed(total, sign))
    });
    let normalized = JP_MAN_YEN_AMOUNT.replace_all(&normalized, |caps: &Captures| {
        match Decimal::parse(&caps["man"]).and_then(|man| man.checked_mul_int(10)) {
            Some(thousands) => {
                let sign = caps.name("sign").map_or("", |sign| sign.as_str());
                format!("{}k yen", signed(thousands, sign))
            }
            None => caps[0].to_string(),
        }
    });
    JP_YEN_AMOUNT
        .replace_all(&normalized, |caps: &Captures| match Decimal::parse(&caps["yen"]) {
            Some(value) => {
                let sign = caps.name("sign").map_or("", |sign| sign.as_str());
                format!("{} yen", signed(value, sign))
            }
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// True when `text` is acceptable as `output_language` output. Empty text passes.
pub fn is_expected_output_language(text: &str, output_language: OutputLanguage) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    match output_language {
        OutputLanguage::En => !trimmed.chars().any(|ch| {
            JAPANESE_PUNCTUATION.contains(&ch) || is_kana(ch) || is_cjk_ideograph(ch) || is_hangul(ch)
        }),
        OutputLanguage::Jp => LanguageDetector.detect(trimmed) == DetectedLanguage::Japanese,
    }
}

fn is_jp_output_mismatch(text: &str) -> bool {
    match LanguageDetector.detect_with_reason(text) {
        (DetectedLanguage::Chinese | DetectedLanguage::Korean, _) => true,
        // Short single tokens like `OK`, `PDF` or `FY2025` are fine in Japanese output.
        (DetectedLanguage::English, _) => {
            text.contains([' ', '\n', '\t']) || text.chars().count() >= 12
        }
        (DetectedLanguage::Japanese, DetectionReason::CjkFallback) => looks_like_chinese(text),
        (DetectedLanguage::Japanese, _) => false,
    }
}

/// Output-language check used by the retry policy.
pub fn is_output_language_mismatch(text: &str, output_language: OutputLanguage) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    match output_language {
        OutputLanguage::En => {
            let normalized = normalize_en_for_language_guard(trimmed);
            !is_expected_output_language(&normalized, OutputLanguage::En)
        }
        OutputLanguage::Jp => is_jp_output_mismatch(trimmed),
    }
}

pub fn contains_hangul(text: &str) -> bool {
    text.chars().any(is_hangul)
}
