use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::{
    format_signed, is_negative_marker, normalize_source, Amount, Decimal, Unit,
    INT_WITH_OPTIONAL_COMMAS as INT,
};

const MAX_NUMERIC_HINTS: usize = 12;
const NUMERIC_HINTS_HEADER: &str = "### Numeric conversion hints (use verbatim)";

static JP_OKU_AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?:(?P<sign>[▲△+\-−])\s*)?(?:(?P<trillion>{INT}(?:\.[0-9]+)?)兆(?:(?P<oku>{INT}(?:\.[0-9]+)?)億)?|(?P<oku_only>{INT}(?:\.[0-9]+)?)億)(?P<yen>円)?"
    ))
    .expect("valid oku amount regex")
});

static JP_LARGE_UNIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[兆億]").expect("valid regex"));

static EN_LARGE_UNIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[^a-z])(?:billion|trillion|bn)\b").expect("valid large unit regex")
});

static EN_OKU: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\boku\b").expect("valid regex"));

static EN_NUMBER_WITH_LARGE_UNIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)(?P<prefix>[▲+\-]?\(?)(?P<number>{INT}(?:\.[0-9]+)?)(?P<suffix>\)?)(?P<sep>\s*)(?P<unit>billion|trillion|bn)\b"
    ))
    .expect("valid large unit amount regex")
});

/// An oku-denominated amount found in Japanese text.
#[derive(Debug, Clone)]
pub(crate) struct OkuAmount {
    pub raw: String,
    pub amount: Amount,
    pub has_yen: bool,
}

pub(crate) fn oku_amounts(text: &str) -> Vec<OkuAmount> {
    let normalized = normalize_source(text);
    JP_OKU_AMOUNT
        .captures_iter(&normalized)
        .filter_map(|caps| {
            let negative = caps
                .name("sign")
                .map(|sign| is_negative_marker(sign.as_str()))
                .unwrap_or(false);
            let value = match (caps.name("trillion"), caps.name("oku"), caps.name("oku_only")) {
                (Some(trillion), oku, _) => {
                    let base = Decimal::parse(trillion.as_str())?.checked_mul_int(10_000)?;
                    match oku {
                        Some(oku) => base.checked_add(Decimal::parse(oku.as_str())?)?,
                        None => base,
                    }
                }
                (None, _, Some(oku_only)) => Decimal::parse(oku_only.as_str())?,
                _ => return None,
            };
            Some(OkuAmount {
                raw: caps.get(0)?.as_str().trim().to_string(),
                amount: Amount::new(value, negative, Unit::Oku),
                has_yen: caps.name("yen").is_some(),
            })
        })
        .collect()
}

fn expected_oku_values(source: &str) -> HashSet<Decimal> {
    oku_amounts(source)
        .into_iter()
        .map(|found| found.amount.magnitude)
        .collect()
}

/// True when the text still carries `billion`, `trillion` or `bn`.
pub fn has_large_unit(text: &str) -> bool {
    EN_LARGE_UNIT.is_match(text)
}

pub fn needs_oku_retry(source: &str, translated: &str) -> bool {
    if has_large_unit(translated) {
        return true;
    }
    JP_LARGE_UNIT.is_match(source)
        && !EN_OKU.is_match(translated)
        && !JP_LARGE_UNIT.is_match(translated)
}

pub fn needs_oku_retry_after_auto_fix(source: &str, translated: &str) -> bool {
    let (fixed, _) = fix_oku_units(source, translated);
    needs_oku_retry(source, &fixed)
}

/// Rewrites `N billion/trillion/bn` to `N oku` when N maps to an oku amount in the source.
pub fn fix_oku_units(source: &str, translated: &str) -> (String, bool) {
    if translated.is_empty() || !has_large_unit(translated) {
        return (translated.to_string(), false);
    }
    let expected = expected_oku_values(source);
    if expected.is_empty() {
        return (translated.to_string(), false);
    }
    let fixed = EN_NUMBER_WITH_LARGE_UNIT.replace_all(translated, |caps: &Captures| {
        let whole = &caps[0];
        let Some(number) = Decimal::parse(&caps["number"]) else {
            return whole.to_string();
        };
        let prefix = &caps["prefix"];
        let suffix = &caps["suffix"];
        if expected.contains(&number) {
            return format!("{prefix}{}{suffix} oku", &caps["number"]);
        }
        let unit = match caps["unit"].to_lowercase().as_str() {
            "trillion" => Unit::Trillion,
            _ => Unit::Billion,
        };
        match Amount::new(number, false, unit).in_oku() {
            Some(converted) if converted.is_integer() && expected.contains(&converted) => {
                format!("{prefix}{}{suffix} oku", converted.format_grouped())
            }
            _ => whole.to_string(),
        }
    });
    let changed = fixed != translated;
    (fixed.into_owned(), changed)
}

/// Prompt block listing each oku amount and the English form it must take.
pub fn numeric_hints(text: &str) -> String {
    let mut seen = HashSet::new();
    let lines: Vec<String> = oku_amounts(text)
        .into_iter()
        .filter(|found| seen.insert(found.raw.clone()))
        .take(MAX_NUMERIC_HINTS)
        .map(|found| {
            let unit = if found.has_yen { "oku yen" } else { "oku" };
            format!(
                "- {} -> {} {unit}",
                found.raw,
                format_signed(&found.amount.magnitude, found.amount.negative)
            )
        })
        .collect();
    if lines.is_empty() {
        return String::new();
    }
    format!("{NUMERIC_HINTS_HEADER}\n{}\n", lines.join("\n"))
}

pub(crate) fn glossary_pairs(text: &str) -> Vec<(String, String)> {
    oku_amounts(text)
        .into_iter()
        .map(|found| {
            let unit = if found.has_yen { "oku yen" } else { "oku" };
            (
                found.raw,
                format!(
                    "{} {unit}",
                    format_signed(&found.amount.magnitude, found.amount.negative)
                ),
            )
        })
        .collect()
}
