//! Japanese financial numeral grammar and the JP→EN notation rules built on it.
//!
//! Every rule exposes a pure detector (`needs_*_retry`) and a pure, idempotent
//! fixer (`fix_*`) returning `(text, changed)`. Fixers only rewrite tokens whose
//! quantity can be traced back to an amount found in the source text.

use unicode_normalization::UnicodeNormalization;

mod decimal;
mod k;
mod month;
mod negative;
mod oku;

pub use decimal::Decimal;
pub use k::{fix_k_notation, needs_k_retry};
pub use month::{canonical_month_abbrev, fix_month_abbrev, needs_month_retry};
pub use negative::{fix_negative_parens, needs_negative_retry};
pub use oku::{
    fix_oku_units, has_large_unit, needs_oku_retry, needs_oku_retry_after_auto_fix,
    numeric_hints,
};

pub(crate) const INT_WITH_OPTIONAL_COMMAS: &str = r"(?:[0-9]{1,3}(?:,[0-9]{3})+|[0-9]+)";
pub(crate) const DEFAULT_MAX_GLOSSARY_PAIRS: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    /// 億 (10^8)
    Oku,
    /// 万 (10^4)
    Man,
    /// 千 (10^3)
    Sen,
    Billion,
    Trillion,
    Million,
    Thousand,
    Plain,
}

/// A numeral split into quantity, sign and unit label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Amount {
    pub magnitude: Decimal,
    pub negative: bool,
    pub unit: Unit,
}

impl Amount {
    pub fn new(magnitude: Decimal, negative: bool, unit: Unit) -> Self {
        Self {
            magnitude: magnitude.abs(),
            negative,
            unit,
        }
    }

    /// Quantity expressed in oku (10^8), when the unit is a large unit.
    pub fn in_oku(&self) -> Option<Decimal> {
        match self.unit {
            Unit::Oku => Some(self.magnitude),
            Unit::Billion => self.magnitude.checked_mul_int(10),
            Unit::Trillion => self.magnitude.checked_mul_int(10_000),
            _ => None,
        }
    }

    /// Quantity expressed in thousands (the `k` unit).
    pub fn in_thousands(&self) -> Option<Decimal> {
        match self.unit {
            Unit::Man => self.magnitude.checked_mul_int(10),
            Unit::Sen | Unit::Thousand => Some(self.magnitude),
            Unit::Million => self.magnitude.checked_mul_int(1_000),
            Unit::Plain => {
                let value = self.magnitude.to_integer()?;
                (value % 1_000 == 0).then(|| Decimal::from_int(value / 1_000))
            }
            _ => None,
        }
    }
}

pub(crate) fn is_negative_marker(sign: &str) -> bool {
    matches!(sign.trim(), "▲" | "△" | "-" | "−")
}

pub(crate) fn normalize_source(text: &str) -> String {
    text.nfkc().collect()
}

/// Formats a signed quantity the way English output must show it: `(N)` for negatives.
pub(crate) fn format_signed(value: &Decimal, negative: bool) -> String {
    let formatted = value.abs().format_grouped();
    if negative {
        format!("({formatted})")
    } else {
        formatted
    }
}

/// One JP→EN notation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotationRule {
    LargeUnit,
    KNotation,
    Negative,
    Month,
}

impl NotationRule {
    /// Order in which rules are checked; the first violation drives a retry.
    pub const ALL: [NotationRule; 4] = [
        NotationRule::LargeUnit,
        NotationRule::KNotation,
        NotationRule::Negative,
        NotationRule::Month,
    ];

    pub fn needs_retry(self, source: &str, translated: &str) -> bool {
        match self {
            NotationRule::LargeUnit => needs_oku_retry(source, translated),
            NotationRule::KNotation => needs_k_retry(source, translated),
            NotationRule::Negative => needs_negative_retry(source, translated),
            NotationRule::Month => needs_month_retry(source, translated),
        }
    }

    pub fn fix(self, source: &str, translated: &str) -> (String, bool) {
        match self {
            NotationRule::LargeUnit => fix_oku_units(source, translated),
            NotationRule::KNotation => fix_k_notation(source, translated),
            NotationRule::Negative => fix_negative_parens(source, translated),
            NotationRule::Month => fix_month_abbrev(source, translated),
        }
    }

    pub fn correction_key(self) -> &'static str {
        match self {
            NotationRule::LargeUnit => "to_en_numeric_unit_correction",
            NotationRule::KNotation => "to_en_k_correction",
            NotationRule::Negative => "to_en_negative_correction",
            NotationRule::Month => "to_en_month_abbrev_correction",
        }
    }

    pub fn retry_instruction(self) -> &'static str {
        match self {
            NotationRule::LargeUnit => {
                "CRITICAL: Follow numeric conversion rules. Do not use 'billion', 'trillion', or 'bn'. Use 'oku' (and 'k') as specified. If numeric conversion hints are provided, use them verbatim."
            }
            NotationRule::KNotation => {
                "CRITICAL: Amounts written with 万/千 must use k notation (e.g. 22万円 -> 220k yen). Do not write full digits such as 220,000."
            }
            NotationRule::Negative => {
                "CRITICAL: Negative numbers marked with ▲ must be written in parentheses without a sign (e.g. ▲50 -> (50)). Never output ▲ or a leading minus."
            }
            NotationRule::Month => {
                "CRITICAL: Months must use the abbreviations Jan., Feb., Mar., Apr., May, Jun., Jul., Aug., Sep., Oct., Nov., Dec. Never spell out month names."
            }
        }
    }

    /// Applies every rule's fixer in order.
    pub fn fix_all(source: &str, translated: &str) -> (String, Vec<NotationRule>) {
        let mut text = translated.to_string();
        let mut applied = Vec::new();
        for rule in Self::ALL {
            let (fixed, changed) = rule.fix(source, &text);
            if changed {
                text = fixed;
                applied.push(rule);
            }
        }
        (text, applied)
    }

    pub fn first_violation(source: &str, translated: &str) -> Option<NotationRule> {
        Self::ALL
            .into_iter()
            .find(|rule| rule.needs_retry(source, translated))
    }
}

/// `(source, target)` glossary pairs for numerals and months found in `text`.
pub fn to_en_glossary_pairs(text: &str, max_pairs: usize) -> Vec<(String, String)> {
    if text.trim().is_empty() || max_pairs == 0 {
        return Vec::new();
    }
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut push = |source: String, target: String, pairs: &mut Vec<(String, String)>| {
        if pairs.len() >= max_pairs || pairs.iter().any(|(existing, _)| *existing == source) {
            return;
        }
        pairs.push((source, target));
    };
    for (raw, target) in oku::glossary_pairs(text) {
        push(raw, target, &mut pairs);
    }
    for (raw, target) in k::glossary_pairs(text) {
        push(raw, target, &mut pairs);
    }
    for (raw, target) in month::glossary_pairs(text) {
        push(raw, target, &mut pairs);
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glossary_pairs_cover_oku_k_and_months() {
        let pairs = to_en_glossary_pairs("売上高は▲10億円。22万円。3月。", DEFAULT_MAX_GLOSSARY_PAIRS);
        assert!(pairs.contains(&("▲10億円".to_string(), "(10) oku yen".to_string())));
        assert!(pairs.contains(&("22万円".to_string(), "220k yen".to_string())));
        assert!(pairs.contains(&("3月".to_string(), "Mar.".to_string())));
    }

    #[test]
    fn glossary_pairs_respect_cap_and_dedupe() {
        let capped = to_en_glossary_pairs("売上高は▲10億円。22万円。3月。", 2);
        assert_eq!(capped.len(), 2);
        assert!(!capped.iter().any(|(source, _)| source == "3月"));

        let deduped = to_en_glossary_pairs("▲10億円。▲10億円。", DEFAULT_MAX_GLOSSARY_PAIRS);
        assert_eq!(deduped.iter().filter(|(source, _)| source == "▲10億円").count(), 1);

        assert!(to_en_glossary_pairs("", DEFAULT_MAX_GLOSSARY_PAIRS).is_empty());
    }

    #[test]
    fn amount_unit_conversions() {
        let billion = Amount::new(Decimal::parse("2,238.5").unwrap(), false, Unit::Billion);
        assert_eq!(billion.in_oku(), Some(Decimal::from_int(22385)));
        let man = Amount::new(Decimal::from_int(22), false, Unit::Man);
        assert_eq!(man.in_thousands(), Some(Decimal::from_int(220)));
        let plain = Amount::new(Decimal::from_int(220_000), false, Unit::Plain);
        assert_eq!(plain.in_thousands(), Some(Decimal::from_int(220)));
        let odd = Amount::new(Decimal::from_int(220_500), false, Unit::Plain);
        assert_eq!(odd.in_thousands(), None);
    }

    #[test]
    fn fix_all_reaches_a_fixed_point() {
        let source = "前年差は▲496億円、1月の初任給は22万円です。";
        let translated = "YoY change was -496 billion yen; starting salary in January was 220,000 yen.";
        let (once, applied) = NotationRule::fix_all(source, translated);
        assert!(!applied.is_empty());
        let (twice, applied_again) = NotationRule::fix_all(source, &once);
        assert_eq!(once, twice);
        assert!(applied_again.is_empty());
        assert_eq!(NotationRule::first_violation(source, &once), None);
        assert!(once.contains("(496) oku yen"));
        assert!(once.contains("Jan."));
        assert!(once.contains("220k yen"));
    }
}
