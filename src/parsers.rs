//! Tolerant parsing of model output: fenced or truncated JSON, `[[ID:n]]` markers,
//! numbered lists and labeled sections.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::BatchParseError;
use crate::models::TranslationStyle;

pub const INPUT_MARKER: &str = "===INPUT_TEXT===";

const SPLIT_REQUEST_MARKERS: [&str; 8] = [
    "入力テキスト量が非常に多いため",
    "メッセージ上限",
    "複数回に分割",
    "分割して送信",
    "ご希望は",
    "どちらですか",
    "split the request",
    "too long to translate",
];
const SPLIT_REQUEST_MIN_MATCHES: usize = 2;
const SPLIT_REQUEST_SAMPLE: usize = 5;

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*```(?:json)?\s*$").expect("valid regex"));
static TRAILING_COMMAS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",(\s*[}\]])").expect("valid regex"));
static ID_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[ID:([0-9]+)\]\]").expect("valid regex"));
static NUMBERED_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([0-9]+)\.\s*(.+?)\s*$").expect("valid regex"));
static TARGET_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<target>(.*?)</target>").expect("valid regex"));
static TRANSLATION_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)[#>*\s-]*[\[\(]?\**(?:訳文[:：]?|翻訳[:：]|(?:translation|translated)[:：])\**[\]\)]?\s*",
    )
    .expect("valid regex")
});
static EXPLANATION_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:^|\n)[#>*\s-]*[\[\(]?\**(?:解説|説明|explanation|notes?|commentary)\**[\]\)]?[:：]?\s*",
    )
    .expect("valid regex")
});
static STYLE_SECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*(?:>\s*)?(?:#{1,6}\s*)?[\[［]\s*(standard|concise|minimal)\s*[\]］]")
        .expect("valid regex")
});
static LEADING_TRANSLATION_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:英語翻訳|日本語翻訳|english\s*translation|japanese\s*translation)\s*")
        .expect("valid regex")
});
static MARKDOWN_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n?\s*[*\-]{3,}\s*$").expect("valid regex"));
static INPUT_MARKER_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:###\s*INPUT\b.*|<<<INPUT_TEXT>>>|<<<END_INPUT_TEXT>>>|===INPUT_TEXT===|===END_INPUT_TEXT===)\s*$",
    )
    .expect("valid regex")
});
static ITEM_ID_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\[\[ID:[0-9]+\]\]\s*").expect("valid regex"));
static TRAILING_ATTACHMENT_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\s*\[[^\]]+?\|\s*(?:excel|word|powerpoint|pdf|csv|text|txt|file)\s*\]\([^)]+\)\s*$",
    )
    .expect("valid regex")
});
static TRAILING_ATTACHMENT_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*\[[^\]]+?\|\s*(?:excel|word|powerpoint|pdf|csv|text|txt|file)\s*\]\s*$")
        .expect("valid regex")
});
static TRAILING_FILENAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)[\s。．.、,]*(?:glossary(?:_old)?|translation_rules|abbreviations|用語集|略語集)(?:\.[a-z]{2,4})?\s*$",
    )
    .expect("valid regex")
});
static JSON_ROOT_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""(options|items|translation)"\s*:"#).expect("valid regex"));

/// A translation with its optional explanation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTranslation {
    pub translation: String,
    pub explanation: String,
}

impl ParsedTranslation {
    fn new(translation: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            translation: translation.into(),
            explanation: explanation.into(),
        }
    }
}

pub fn strip_code_fences(text: &str) -> String {
    if !text.contains("```") {
        return text.to_string();
    }
    text.lines()
        .filter(|line| !CODE_FENCE.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn extract_json_substring(text: &str) -> Option<&str> {
    let text = text.trim();
    let start = [text.find('{'), text.find('[')].into_iter().flatten().min()?;
    let closer = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(closer)?;
    (end > start).then(|| text[start..=end].trim())
}

/// Rewrites Python-literal syntax (single quotes, `True`/`False`/`None`) into JSON.
fn python_literal_to_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    let mut quote: Option<char> = None;
    let mut word = String::new();
    let flush_word = |word: &mut String, out: &mut String| {
        match word.as_str() {
            "True" => out.push_str("true"),
            "False" => out.push_str("false"),
            "None" => out.push_str("null"),
            other => out.push_str(other),
        }
        word.clear();
    };
    while let Some(ch) = chars.next() {
        match quote {
            Some(open) => match ch {
                '\\' => {
                    if let Some(next) = chars.next() {
                        if next == '\'' {
                            out.push('\'');
                        } else {
                            out.push('\\');
                            out.push(next);
                        }
                    }
                }
                '"' if open == '\'' => out.push_str("\\\""),
                c if c == open => {
                    out.push('"');
                    quote = None;
                }
                c => out.push(c),
            },
            None => {
                if ch.is_ascii_alphabetic() {
                    word.push(ch);
                    continue;
                }
                flush_word(&mut word, &mut out);
                if ch == '\'' || ch == '"' {
                    quote = Some(ch);
                    out.push('"');
                } else {
                    out.push(ch);
                }
            }
        }
    }
    flush_word(&mut word, &mut out);
    out
}

/// Best-effort JSON extraction. Never fails; `None` when nothing parses.
pub fn loads_json_loose(text: &str) -> Option<Value> {
    let cleaned = strip_code_fences(text);
    let candidate = extract_json_substring(&cleaned)
        .map(str::to_string)
        .unwrap_or_else(|| cleaned.trim().to_string());
    if candidate.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(&candidate) {
        return Some(value);
    }
    let without_trailing_commas = TRAILING_COMMAS.replace_all(&candidate, "$1").into_owned();
    if let Ok(value) = serde_json::from_str(&without_trailing_commas) {
        return Some(value);
    }
    serde_json::from_str::<Value>(&python_literal_to_json(&without_trailing_commas))
        .ok()
        .filter(|value| value.is_object() || value.is_array())
}

/// True when the first JSON value in `text` was cut off mid-structure.
pub fn is_truncated_json(text: &str) -> bool {
    let cleaned = strip_code_fences(text);
    let cleaned = cleaned.trim();
    let Some(start) = [cleaned.find('{'), cleaned.find('[')].into_iter().flatten().min() else {
        return false;
    };
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escape = false;
    for ch in cleaned[start..].chars() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            '{' | '[' => stack.push(ch),
            '}' => {
                if stack.pop() != Some('{') {
                    return false;
                }
            }
            ']' => {
                if stack.pop() != Some('[') {
                    return false;
                }
            }
            _ => {}
        }
    }
    in_string || !stack.is_empty()
}

fn item_id(value: &Value) -> Option<usize> {
    let id = match value {
        Value::Number(number) => usize::try_from(number.as_u64()?).ok()?,
        Value::String(raw) => raw.trim().parse::<usize>().ok()?,
        _ => return None,
    };
    (id > 0).then_some(id)
}

fn slots_from(by_id: &BTreeMap<usize, String>, expected_count: usize) -> Vec<String> {
    (1..=expected_count)
        .map(|id| by_id.get(&id).cloned().unwrap_or_default())
        .collect()
}

fn parse_batch_items_json(value: &Value, expected_count: usize) -> Option<Vec<String>> {
    let items = value.get("items")?.as_array()?;
    let by_id: BTreeMap<usize, String> = items
        .iter()
        .filter_map(|item| {
            let id = item_id(item.get("id")?)?;
            let translation = item
                .get("translation")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Some((id, translation))
        })
        .collect();
    (!by_id.is_empty()).then(|| slots_from(&by_id, expected_count))
}

fn parse_id_marker_blocks(text: &str, expected_count: usize) -> Option<Vec<String>> {
    let markers: Vec<_> = ID_MARKER.captures_iter(text).collect();
    let mut by_id = BTreeMap::new();
    for (idx, caps) in markers.iter().enumerate() {
        let (Some(whole), Ok(id)) = (caps.get(0), caps[1].parse::<usize>()) else {
            continue;
        };
        let end = markers
            .get(idx + 1)
            .and_then(|next| next.get(0))
            .map_or(text.len(), |next| next.start());
        let body = text[whole.end()..end].trim();
        if !body.is_empty() {
            by_id.insert(id, body.to_string());
        }
    }
    (!by_id.is_empty()).then(|| slots_from(&by_id, expected_count))
}

fn parse_numbered_lines(text: &str, expected_count: usize) -> Option<Vec<String>> {
    let mut lines: Vec<String> = text
        .lines()
        .filter_map(|line| NUMBERED_LINE.captures(line).map(|caps| caps[2].trim().to_string()))
        .collect();
    if lines.is_empty() {
        return None;
    }
    lines.resize(expected_count, String::new());
    Some(lines)
}

/// Parses a batch response into exactly `expected_count` slots (missing ids become `""`).
pub fn parse_batch_translations(
    raw: &str,
    expected_count: usize,
) -> Result<Vec<String>, BatchParseError> {
    if let Some(parsed) =
        loads_json_loose(raw).and_then(|value| parse_batch_items_json(&value, expected_count))
    {
        return Ok(parsed);
    }
    if let Some(parsed) = parse_id_marker_blocks(raw, expected_count) {
        return Ok(parsed);
    }
    if let Some(parsed) = parse_numbered_lines(raw, expected_count) {
        return Ok(parsed);
    }
    if is_truncated_json(raw) {
        return Err(BatchParseError::Truncated);
    }
    Err(BatchParseError::Unrecognized)
}

fn parse_labeled_sections(text: &str) -> Option<ParsedTranslation> {
    let label = TRANSLATION_LABEL.find(text)?;
    let rest = &text[label.end()..];
    let (translation, explanation) = match EXPLANATION_LABEL.find(rest) {
        Some(found) => (&rest[..found.start()], rest[found.end()..].trim()),
        None => (rest, ""),
    };
    let translation = translation.trim();
    (!translation.is_empty()).then(|| ParsedTranslation::new(translation, explanation))
}

/// `{"translation", "explanation"}`, then `<target>` tags, then `訳文:`/`Translation:` sections.
pub fn parse_text_single_translation(raw: &str) -> Option<ParsedTranslation> {
    if let Some(value) = loads_json_loose(raw) {
        if let Some(translation) = value.get("translation").and_then(Value::as_str) {
            let explanation = value
                .get("explanation")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return Some(ParsedTranslation::new(translation, explanation));
        }
    }
    if let Some(caps) = TARGET_TAG.captures(raw) {
        let translation = caps[1].trim();
        if !translation.is_empty() {
            let after = caps.get(0).map_or("", |whole| &raw[whole.end()..]);
            let explanation = EXPLANATION_LABEL
                .find(after)
                .map_or("", |found| after[found.end()..].trim());
            return Some(ParsedTranslation::new(translation, explanation));
        }
    }
    parse_labeled_sections(raw)
}

/// Plain-text reading of a reply that carried no recognizable structure.
pub fn parse_plain_translation(raw: &str) -> Option<String> {
    let cleaned = strip_input_markers(raw);
    let text = match parse_labeled_sections(&cleaned) {
        Some(parsed) => parsed.translation,
        None => match EXPLANATION_LABEL.find(&cleaned) {
            Some(found) if found.start() > 0 => cleaned[..found.start()].trim().to_string(),
            _ => cleaned.trim().to_string(),
        },
    };
    let text = MARKDOWN_SEPARATOR.replace(&text, "");
    let text = LEADING_TRANSLATION_LABEL.replace(text.trim(), "");
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn parse_style_sections(raw: &str) -> BTreeMap<TranslationStyle, ParsedTranslation> {
    let headers: Vec<_> = STYLE_SECTION.captures_iter(raw).collect();
    let mut by_style = BTreeMap::new();
    for (idx, caps) in headers.iter().enumerate() {
        let (Some(whole), Some(style)) = (caps.get(0), TranslationStyle::parse(&caps[1])) else {
            continue;
        };
        let end = headers
            .get(idx + 1)
            .and_then(|next| next.get(0))
            .map_or(raw.len(), |next| next.start());
        let section = &raw[whole.end()..end];
        if let Some(text) = parse_plain_translation(section) {
            by_style
                .entry(style)
                .or_insert_with(|| ParsedTranslation::new(text, ""));
        }
    }
    by_style
}

fn parse_styles_with_fallback(
    raw: &str,
    fallback_style: TranslationStyle,
) -> BTreeMap<TranslationStyle, ParsedTranslation> {
    let value = loads_json_loose(raw);
    let Some(options) = value
        .as_ref()
        .and_then(|value| value.get("options"))
        .and_then(Value::as_array)
    else {
        let sections = parse_style_sections(raw);
        if !sections.is_empty() {
            return sections;
        }
        return value
            .as_ref()
            .and_then(|value| value.get("translation"))
            .and_then(Value::as_str)
            .map(|translation| {
                let explanation = value
                    .as_ref()
                    .and_then(|value| value.get("explanation"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                BTreeMap::from([(fallback_style, ParsedTranslation::new(translation, explanation))])
            })
            .unwrap_or_default();
    };

    let mut by_style = BTreeMap::new();
    let mut unlabeled = Vec::new();
    for option in options {
        let Some(translation) = option.get("translation").and_then(Value::as_str) else {
            continue;
        };
        if translation.trim().is_empty() {
            continue;
        }
        let explanation = option
            .get("explanation")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let parsed = ParsedTranslation::new(translation, explanation);
        match option
            .get("style")
            .and_then(Value::as_str)
            .and_then(TranslationStyle::parse)
        {
            Some(style) if !by_style.contains_key(&style) => {
                by_style.insert(style, parsed);
            }
            Some(_) => {}
            None => unlabeled.push(parsed),
        }
    }
    let mut unlabeled = unlabeled.into_iter();
    for style in TranslationStyle::ALL {
        if by_style.contains_key(&style) {
            continue;
        }
        match unlabeled.next() {
            Some(parsed) => {
                by_style.insert(style, parsed);
            }
            None => break,
        }
    }
    by_style
}

/// Options keyed by style from a `{"options": [...]}` reply.
pub fn parse_text_to_en_3style(raw: &str) -> BTreeMap<TranslationStyle, ParsedTranslation> {
    parse_styles_with_fallback(raw, TranslationStyle::Minimal)
}

/// Same as [`parse_text_to_en_3style`] restricted to `styles`.
pub fn parse_text_to_en_style_subset(
    raw: &str,
    styles: &[TranslationStyle],
) -> BTreeMap<TranslationStyle, ParsedTranslation> {
    let fallback = match styles {
        [only] => *only,
        _ => TranslationStyle::Minimal,
    };
    let mut by_style = parse_styles_with_fallback(raw, fallback);
    by_style.retain(|style, _| styles.contains(style));
    by_style
}

/// The JSON root key a prompt asks for, if any.
pub fn expected_json_root_key(prompt: &str) -> Option<&'static str> {
    let mut found = [false; 3];
    for caps in JSON_ROOT_KEY.captures_iter(prompt) {
        match &caps[1] {
            "options" => found[0] = true,
            "items" => found[1] = true,
            _ => found[2] = true,
        }
    }
    ["options", "items", "translation"]
        .into_iter()
        .zip(found)
        .find_map(|(key, present)| present.then_some(key))
}

/// Places `extra` right before the input marker, or at the top when there is none.
pub fn insert_extra_instruction(prompt: &str, extra: &str) -> String {
    let extra = extra.trim();
    if extra.is_empty() {
        return prompt.to_string();
    }
    if prompt.contains(INPUT_MARKER) {
        return prompt.replacen(INPUT_MARKER, &format!("{extra}\n{INPUT_MARKER}"), 1);
    }
    format!("{extra}\n{prompt}")
}

pub fn strip_input_markers(text: &str) -> String {
    text.lines()
        .filter(|line| !INPUT_MARKER_LINE.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Removes echoed markers, `[[ID:n]]` prefixes and trailing attachment artifacts.
pub fn clean_batch_translation(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut cleaned = strip_input_markers(text);
    cleaned = ITEM_ID_PREFIX.replace(&cleaned, "").trim().to_string();
    loop {
        let updated = TRAILING_ATTACHMENT_LINK.replace(&cleaned, "").trim().to_string();
        if updated == cleaned {
            break;
        }
        cleaned = updated;
    }
    cleaned = TRAILING_ATTACHMENT_LABEL.replace(&cleaned, "").trim().to_string();
    let without_filename = TRAILING_FILENAME.replace(&cleaned, "").trim().to_string();
    if without_filename.is_empty() {
        cleaned
    } else {
        without_filename
    }
}

/// True when the first replies read like "your input is too long, shall I split it?".
pub fn looks_like_split_request(translations: &[String]) -> bool {
    let sample = translations
        .iter()
        .take(SPLIT_REQUEST_SAMPLE)
        .filter(|text| !text.is_empty())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n");
    if sample.trim().is_empty() {
        return false;
    }
    let lowered = sample.to_lowercase();
    SPLIT_REQUEST_MARKERS
        .iter()
        .filter(|marker| lowered.contains(&marker.to_lowercase()))
        .count()
        >= SPLIT_REQUEST_MIN_MATCHES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_items_are_reordered_by_id() {
        let raw = r#"{"items":[{"id":2,"translation":"B"},{"id":1,"translation":"A"}]}"#;
        assert_eq!(parse_batch_translations(raw, 2).unwrap(), vec!["A", "B"]);

        let fenced = format!("prefix\n```json\n{raw}\n```\nsuffix");
        assert_eq!(parse_batch_translations(&fenced, 2).unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn batch_gaps_and_string_ids() {
        let raw = r#"{"items":[{"id":"3","translation":"C"},{"id":0,"translation":"zero"},]}"#;
        assert_eq!(parse_batch_translations(raw, 3).unwrap(), vec!["", "", "C"]);
    }

    #[test]
    fn batch_falls_back_to_markers_and_numbered_lines() {
        let markers = "[[ID:2]] Second\n[[ID:1]] First";
        assert_eq!(parse_batch_translations(markers, 2).unwrap(), vec!["First", "Second"]);

        let numbered = "1. One\n2. Two\n3. Three";
        assert_eq!(parse_batch_translations(numbered, 2).unwrap(), vec!["One", "Two"]);
        assert_eq!(
            parse_batch_translations("1. Only", 2).unwrap(),
            vec!["Only".to_string(), String::new()]
        );
    }

    #[test]
    fn batch_errors_distinguish_truncation() {
        assert_eq!(
            parse_batch_translations("I cannot help with that.", 2),
            Err(BatchParseError::Unrecognized)
        );
        assert_eq!(
            parse_batch_translations(r#"{"items":[{"id":1,"translation":"A"#, 2),
            Err(BatchParseError::Truncated)
        );
    }

    #[test]
    fn truncation_tracks_strings_and_brackets() {
        assert!(is_truncated_json(r#"{"a": [1, 2"#));
        assert!(is_truncated_json(r#"{"a": "unterminated"#));
        assert!(!is_truncated_json(r#"{"a": "b}"}"#));
        assert!(!is_truncated_json("no json"));
        assert!(!is_truncated_json("{]"));
    }

    #[test]
    fn loose_json_accepts_python_literals() {
        let value = loads_json_loose("{'translation': 'It\\'s \"fine\"', 'ok': True}").unwrap();
        assert_eq!(value["translation"], "It's \"fine\"");
        assert_eq!(value["ok"], true);
        assert!(loads_json_loose("plain prose").is_none());
    }

    #[test]
    fn single_translation_fallbacks() {
        let json = parse_text_single_translation(r#"{"translation":"Sales","explanation":"n"}"#);
        assert_eq!(json, Some(ParsedTranslation::new("Sales", "n")));

        let tagged = parse_text_single_translation("<target>Net sales</target>");
        assert_eq!(tagged, Some(ParsedTranslation::new("Net sales", "")));

        let labeled = parse_text_single_translation("訳文: 売上高\n解説: 財務用語です");
        assert_eq!(labeled, Some(ParsedTranslation::new("売上高", "財務用語です")));

        let english = parse_text_single_translation("Translation: Net sales\nNotes: formal");
        assert_eq!(english, Some(ParsedTranslation::new("Net sales", "formal")));

        assert_eq!(parse_text_single_translation("翻訳してください"), None);
    }

    #[test]
    fn plain_translation_strips_markers_and_labels() {
        assert_eq!(
            parse_plain_translation("===INPUT_TEXT===\nEnglish Translation Net sales\n---"),
            Some("Net sales".to_string())
        );
        assert_eq!(parse_plain_translation("   "), None);
    }

    #[test]
    fn three_style_dedupes_and_fills_missing() {
        let raw = r#"{"options":[
            {"style":"standard","translation":"S1"},
            {"style":"standard","translation":"S2"},
            {"translation":"U1"},
            {"style":"minimal","translation":"M"}
        ]}"#;
        let parsed = parse_text_to_en_3style(raw);
        assert_eq!(parsed[&TranslationStyle::Standard].translation, "S1");
        assert_eq!(parsed[&TranslationStyle::Concise].translation, "U1");
        assert_eq!(parsed[&TranslationStyle::Minimal].translation, "M");
    }

    #[test]
    fn three_style_single_fallback_goes_to_minimal() {
        let parsed = parse_text_to_en_3style(r#"{"translation":"Sales"}"#);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[&TranslationStyle::Minimal].translation, "Sales");

        let subset =
            parse_text_to_en_style_subset(r#"{"translation":"Sales"}"#, &[TranslationStyle::Concise]);
        assert_eq!(subset[&TranslationStyle::Concise].translation, "Sales");
    }

    #[test]
    fn style_sections_are_parsed() {
        let raw = "[standard]\nTranslation: Net sales rose\n[concise]\nTranslation: Sales rose";
        let parsed = parse_text_to_en_3style(raw);
        assert_eq!(parsed[&TranslationStyle::Standard].translation, "Net sales rose");
        assert_eq!(parsed[&TranslationStyle::Concise].translation, "Sales rose");
    }

    #[test]
    fn root_key_prefers_outer_keys() {
        assert_eq!(
            expected_json_root_key(r#"Return {"items":[{"id":1,"translation":"..."}]}"#),
            Some("items")
        );
        assert_eq!(
            expected_json_root_key(r#"{"translation": "...", "explanation": "..."}"#),
            Some("translation")
        );
        assert_eq!(expected_json_root_key("Translate this."), None);
    }

    #[test]
    fn extra_instruction_goes_before_input_marker() {
        assert_eq!(
            insert_extra_instruction("Rules\n===INPUT_TEXT===\nabc", "CRITICAL"),
            "Rules\nCRITICAL\n===INPUT_TEXT===\nabc"
        );
        assert_eq!(insert_extra_instruction("Rules", "CRITICAL"), "CRITICAL\nRules");
        assert_eq!(insert_extra_instruction("Rules", "  "), "Rules");
    }

    #[test]
    fn batch_cleaning_removes_artifacts() {
        assert_eq!(clean_batch_translation("[[ID:3]] Net sales"), "Net sales");
        assert_eq!(
            clean_batch_translation("Net sales [glossary | CSV](https://example.invalid/x)"),
            "Net sales"
        );
        assert_eq!(clean_batch_translation("Net sales. glossary.csv"), "Net sales");
        assert_eq!(
            clean_batch_translation("===INPUT_TEXT===\nNet sales\n===END_INPUT_TEXT==="),
            "Net sales"
        );
    }

    #[test]
    fn split_requests_need_two_markers() {
        let reply = vec![
            "入力テキスト量が非常に多いため、複数回に分割して送信してください。".to_string(),
            String::new(),
        ];
        assert!(looks_like_split_request(&reply));
        assert!(!looks_like_split_request(&["メッセージ上限".to_string()]));
        assert!(!looks_like_split_request(&[]));
    }
}
