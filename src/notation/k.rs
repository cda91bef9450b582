use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::{
    is_negative_marker, normalize_source, Amount, Decimal, Unit, INT_WITH_OPTIONAL_COMMAS as INT,
};

static JP_MAN_SEN_YEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?:(?P<sign>[▲△\-−])\s*)?(?P<number>{INT}(?:\.[0-9]+)?)(?P<unit>万|千)円"
    ))
    .expect("valid man/sen regex")
});

static EN_AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)(?P<prefix>[¥￥]?)(?P<number>{INT}(?:\.[0-9]+)?)(?P<unit>\s*(?:man|sen|million|thousand)\b|万|千|k\b)?"
    ))
    .expect("valid amount regex")
});

/// A 万円/千円 amount in the source with its `k` and full-yen equivalents.
#[derive(Debug, Clone)]
pub(crate) struct YenAmount {
    pub raw: String,
    pub amount: Amount,
    pub thousands: Decimal,
    pub full: Decimal,
}

pub(crate) fn yen_amounts(text: &str) -> Vec<YenAmount> {
    let normalized = normalize_source(text);
    JP_MAN_SEN_YEN
        .captures_iter(&normalized)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            // `1億2,000万円` belongs to the oku rule.
            if normalized[..whole.start()].ends_with(|ch: char| ch == '億' || ch == '兆') {
                return None;
            }
            let negative = caps
                .name("sign")
                .map(|sign| is_negative_marker(sign.as_str()))
                .unwrap_or(false);
            let number = Decimal::parse(&caps["number"])?;
            let (unit, factor) = match &caps["unit"] {
                "万" => (Unit::Man, 10_000),
                _ => (Unit::Sen, 1_000),
            };
            let amount = Amount::new(number, negative, unit);
            Some(YenAmount {
                raw: whole.as_str().trim().to_string(),
                thousands: amount.in_thousands()?,
                full: number.abs().checked_mul_int(factor)?,
                amount,
            })
        })
        .collect()
}

enum Token {
    Fine,
    Rewrite(Decimal),
}

fn classify(caps: &Captures<'_>, expected: &[YenAmount]) -> Token {
    let Some(number) = Decimal::parse(&caps["number"]) else {
        return Token::Fine;
    };
    let unit = caps
        .name("unit")
        .map(|unit| unit.as_str().trim().to_lowercase())
        .unwrap_or_default();
    let matched = match unit.as_str() {
        "k" => None,
        "" => expected.iter().find(|yen| {
            yen.full == number && yen.full.to_integer().is_some_and(|value| value >= 1_000)
        }),
        "man" | "万" => expected
            .iter()
            .find(|yen| yen.amount.unit == Unit::Man && yen.amount.magnitude == number),
        "sen" | "千" => expected
            .iter()
            .find(|yen| yen.amount.unit == Unit::Sen && yen.amount.magnitude == number),
        "million" => {
            let thousands = Amount::new(number, false, Unit::Million).in_thousands();
            expected.iter().find(|yen| Some(yen.thousands) == thousands)
        }
        "thousand" => expected.iter().find(|yen| yen.thousands == number),
        _ => None,
    };
    match matched {
        Some(yen) => Token::Rewrite(yen.thousands),
        None => Token::Fine,
    }
}

pub fn needs_k_retry(source: &str, translated: &str) -> bool {
    let expected = yen_amounts(source);
    if expected.is_empty() {
        return false;
    }
    EN_AMOUNT
        .captures_iter(translated)
        .any(|caps| matches!(classify(&caps, &expected), Token::Rewrite(_)))
}

/// Rewrites `220,000 yen`, `22 man yen` and `0.22 million yen` to `220k yen`.
pub fn fix_k_notation(source: &str, translated: &str) -> (String, bool) {
    let expected = yen_amounts(source);
    if expected.is_empty() || translated.is_empty() {
        return (translated.to_string(), false);
    }
    let fixed = EN_AMOUNT.replace_all(translated, |caps: &Captures| {
        match classify(caps, &expected) {
            Token::Rewrite(thousands) => {
                format!("{}{}k", &caps["prefix"], thousands.format_grouped())
            }
            Token::Fine => caps[0].to_string(),
        }
    });
    let changed = fixed != translated;
    (fixed.into_owned(), changed)
}

pub(crate) fn glossary_pairs(text: &str) -> Vec<(String, String)> {
    yen_amounts(text)
        .into_iter()
        .map(|yen| {
            let target = format!("{}k", yen.thousands.format_grouped());
            let target = if yen.amount.negative {
                format!("({target}) yen")
            } else {
                format!("{target} yen")
            };
            (yen.raw, target)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "初任給は22万円です。";

    #[test]
    fn full_digits_become_k() {
        assert!(needs_k_retry(SOURCE, "The starting salary is 220,000 yen."));
        let (fixed, changed) = fix_k_notation(SOURCE, "The starting salary is 220,000 yen.");
        assert!(changed);
        assert_eq!(fixed, "The starting salary is 220k yen.");
        assert!(!needs_k_retry(SOURCE, &fixed));
    }

    #[test]
    fn man_and_million_forms_become_k() {
        let (man, _) = fix_k_notation(SOURCE, "The starting salary is 22 man yen.");
        assert_eq!(man, "The starting salary is 220k yen.");
        let (million, _) = fix_k_notation(SOURCE, "The starting salary is 0.22 million yen.");
        assert_eq!(million, "The starting salary is 220k yen.");
    }

    #[test]
    fn unrelated_numbers_stay() {
        let translated = "In 2025, 220k yen was paid to 30 people.";
        let (fixed, changed) = fix_k_notation(SOURCE, translated);
        assert!(!changed);
        assert_eq!(fixed, translated);
        assert!(!needs_k_retry("売上は伸びた。", "220,000 yen"));
    }

    #[test]
    fn sen_amounts_map_one_to_one() {
        let source = "手数料は5千円。";
        let (fixed, _) = fix_k_notation(source, "The fee is 5,000 yen.");
        assert_eq!(fixed, "The fee is 5k yen.");
    }

    #[test]
    fn man_following_oku_is_ignored() {
        assert!(yen_amounts("1億2,000万円").is_empty());
    }
}
