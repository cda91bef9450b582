//! Glossary CSV loading and input-driven term selection.

use std::collections::{BTreeSet, HashSet};

use unicode_normalization::UnicodeNormalization;

pub const GLOSSARY_MAX_LINES: usize = 40;
const COMPACT_MIN_CHARS: usize = 4;
const GENERATED_HEADER: &str = "### Glossary (generated; apply verbatim)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlossaryEntry {
    pub source: String,
    pub target: String,
    source_folded: String,
    target_folded: String,
    source_compact: String,
    target_compact: String,
}

impl GlossaryEntry {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into().trim().to_string();
        let target = target.into().trim().to_string();
        let source_folded = fold(&source);
        let target_folded = fold(&target);
        Self {
            source_compact: compact(&source_folded),
            target_compact: compact(&target_folded),
            source,
            target,
            source_folded,
            target_folded,
        }
    }

    fn specificity(&self) -> usize {
        self.source_folded
            .chars()
            .count()
            .max(self.target_folded.chars().count())
    }
}

/// Parses `source,target` rows; blank lines and `#` comments are skipped.
pub fn parse_glossary_csv(raw: &str) -> Vec<GlossaryEntry> {
    let raw = raw.trim_start_matches('\u{feff}');
    raw.lines()
        .filter_map(|line| {
            let fields = split_csv_line(line);
            let source = fields.first()?.trim();
            if source.is_empty() || source.starts_with('#') {
                return None;
            }
            let target = fields.get(1).map(|value| value.trim()).unwrap_or("");
            Some(GlossaryEntry::new(source, target))
        })
        .collect()
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    fields.push(current);
    fields
}

fn fold(text: &str) -> String {
    text.nfkc()
        .collect::<String>()
        .replace('\u{3000}', " ")
        .to_lowercase()
}

fn compact(folded: &str) -> String {
    folded
        .chars()
        .filter(|ch| !ch.is_whitespace() && !matches!(ch, '_' | '/' | '\\' | '-'))
        .collect()
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, matched)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + matched.len()..].chars().next();
        !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
    })
}

fn matches_term(text_folded: &str, text_compact: &str, term_folded: &str, term_compact: &str) -> bool {
    let term_folded = term_folded.trim();
    if term_folded.is_empty() {
        return false;
    }
    let ascii_word = term_folded
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit());
    let direct = if ascii_word {
        contains_word(text_folded, term_folded)
    } else {
        text_folded.contains(term_folded)
    };
    if direct {
        return true;
    }
    term_compact.chars().count() >= COMPACT_MIN_CHARS && text_compact.contains(term_compact)
}

/// Entries whose source or target occurs in `input`, most specific first.
///
/// The flag is true when more entries matched than `max_lines`.
pub fn select_entries(
    entries: &[GlossaryEntry],
    input: &str,
    max_lines: usize,
    excluded_sources: &BTreeSet<String>,
) -> (Vec<(String, String)>, bool) {
    let input = input.trim();
    if input.is_empty() || max_lines == 0 {
        return (Vec::new(), false);
    }
    let text_folded = fold(input);
    let text_compact = compact(&text_folded);

    let mut seen = HashSet::new();
    let mut matched: Vec<(usize, usize, &GlossaryEntry)> = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        if entry.source.is_empty()
            || excluded_sources.contains(&entry.source)
            || seen.contains(entry.source.as_str())
        {
            continue;
        }
        let hit = matches_term(
            &text_folded,
            &text_compact,
            &entry.source_folded,
            &entry.source_compact,
        ) || (!entry.target.is_empty()
            && matches_term(
                &text_folded,
                &text_compact,
                &entry.target_folded,
                &entry.target_compact,
            ));
        if !hit {
            continue;
        }
        seen.insert(entry.source.as_str());
        matched.push((entry.specificity(), index, entry));
    }

    let truncated = matched.len() > max_lines;
    matched.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    let selected = matched
        .into_iter()
        .take(max_lines)
        .map(|(_, _, entry)| (entry.source.clone(), entry.target.clone()))
        .collect();
    (selected, truncated)
}

pub fn format_pair(source: &str, target: &str) -> String {
    format!("- JP: {source} | EN: {target}")
}

/// Prompt block for pairs derived from the input itself.
pub fn generated_section(pairs: &[(String, String)]) -> String {
    if pairs.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = pairs
        .iter()
        .map(|(source, target)| format_pair(source, target))
        .collect();
    format!("{GENERATED_HEADER}\n{}", lines.join("\n"))
}
