use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::normalize_source;

const MONTHS: [(&str, &str, &[&str]); 12] = [
    ("January", "Jan.", &["Jan"]),
    ("February", "Feb.", &["Feb"]),
    ("March", "Mar.", &["Mar"]),
    ("April", "Apr.", &["Apr"]),
    ("May", "May", &[]),
    ("June", "Jun.", &["Jun"]),
    ("July", "Jul.", &["Jul"]),
    ("August", "Aug.", &["Aug"]),
    ("September", "Sep.", &["Sept", "Sep"]),
    ("October", "Oct.", &["Oct"]),
    ("November", "Nov.", &["Nov"]),
    ("December", "Dec.", &["Dec"]),
];

static JP_MONTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?P<month>[0-9]+)月").expect("valid month regex"));

static EN_MONTH: Lazy<Regex> = Lazy::new(|| {
    let mut names: Vec<&str> = MONTHS
        .iter()
        .flat_map(|(full, _, abbrevs)| std::iter::once(*full).chain(abbrevs.iter().copied()))
        .collect();
    // Longest alternatives first so `Sept` wins over `Sep`.
    names.sort_by_key(|name| std::cmp::Reverse(name.len()));
    Regex::new(&format!(r"\b(?P<name>{})\b(?P<dot>\.)?", names.join("|")))
        .expect("valid month name regex")
});

/// Canonical abbreviation for a month number (1-12).
pub fn canonical_month_abbrev(month: u32) -> Option<&'static str> {
    let index = usize::try_from(month).ok()?.checked_sub(1)?;
    MONTHS.get(index).map(|(_, abbrev, _)| *abbrev)
}

fn month_index(name: &str) -> Option<usize> {
    MONTHS
        .iter()
        .position(|(full, _, abbrevs)| *full == name || abbrevs.contains(&name))
}

fn expected_months(source: &str) -> BTreeSet<usize> {
    let normalized = normalize_source(source);
    JP_MONTH
        .captures_iter(&normalized)
        .filter_map(|caps| caps["month"].parse::<usize>().ok())
        .filter(|month| (1..=12).contains(month))
        .map(|month| month - 1)
        .collect()
}

fn is_wrong_form(caps: &Captures<'_>, expected: &BTreeSet<usize>) -> Option<&'static str> {
    let name = &caps["name"];
    let index = month_index(name)?;
    if !expected.contains(&index) {
        return None;
    }
    let canonical = MONTHS[index].1;
    let written = format!("{name}{}", caps.name("dot").map_or("", |dot| dot.as_str()));
    if written == canonical || (canonical == "May" && name == "May") {
        return None;
    }
    Some(canonical)
}

pub fn needs_month_retry(source: &str, translated: &str) -> bool {
    let expected = expected_months(source);
    if expected.is_empty() {
        return false;
    }
    EN_MONTH
        .captures_iter(translated)
        .any(|caps| is_wrong_form(&caps, &expected).is_some())
}

/// Rewrites `January`, `Sept.` and friends to the canonical abbreviation.
pub fn fix_month_abbrev(source: &str, translated: &str) -> (String, bool) {
    let expected = expected_months(source);
    if expected.is_empty() || translated.is_empty() {
        return (translated.to_string(), false);
    }
    let fixed = EN_MONTH.replace_all(translated, |caps: &Captures| {
        match is_wrong_form(caps, &expected) {
            Some(canonical) => canonical.to_string(),
            None => caps[0].to_string(),
        }
    });
    let changed = fixed != translated;
    (fixed.into_owned(), changed)
}

pub(crate) fn glossary_pairs(text: &str) -> Vec<(String, String)> {
    expected_months(text)
        .into_iter()
        .filter_map(|index| {
            let month = u32::try_from(index + 1).ok()?;
            Some((format!("{month}月"), canonical_month_abbrev(month)?.to_string()))
        })
        .collect()
}
