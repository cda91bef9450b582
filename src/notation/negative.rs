use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::k::yen_amounts;
use super::oku::oku_amounts;
use super::{normalize_source, Decimal, INT_WITH_OPTIONAL_COMMAS as INT};

static JP_TRIANGLE_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"[▲△]\s*(?P<number>{INT}(?:\.[0-9]+)?)"))
        .expect("valid triangle regex")
});

static EN_SIGNED_NUMBER: Lazy<Regex> = Lazy::new(|| {
    let num = format!(r"{INT}(?:\.[0-9]+)?(?:k\b)?");
    Regex::new(&format!(
        r"\(\s*(?P<sign_a>[\-−▲△])\s*(?P<a>{num})\s*\)|(?P<sign_b>[\-−▲△])\s*\(\s*(?P<b>{num})\s*\)|(?P<sign_c>[\-−▲△])\s*(?P<c>{num})"
    ))
    .expect("valid signed number regex")
});

fn expected_negatives(source: &str) -> HashSet<Decimal> {
    let normalized = normalize_source(source);
    let mut expected: HashSet<Decimal> = JP_TRIANGLE_NUMBER
        .captures_iter(&normalized)
        .filter_map(|caps| Decimal::parse(&caps["number"]))
        .map(Decimal::abs)
        .collect();
    for found in oku_amounts(source) {
        if found.amount.negative {
            expected.insert(found.amount.magnitude);
        }
    }
    for yen in yen_amounts(source) {
        if yen.amount.negative {
            expected.insert(yen.thousands);
            expected.insert(yen.full);
        }
    }
    expected
}

struct SignedToken<'t> {
    sign: &'t str,
    number: &'t str,
}

fn signed_token<'t>(caps: &Captures<'t>) -> Option<SignedToken<'t>> {
    [("sign_a", "a"), ("sign_b", "b"), ("sign_c", "c")]
        .into_iter()
        .find_map(|(sign, number)| {
            Some(SignedToken {
                sign: caps.name(sign)?.as_str(),
                number: caps.name(number)?.as_str(),
            })
        })
}

fn should_rewrite(
    token: &SignedToken<'_>,
    preceding: Option<char>,
    expected: &HashSet<Decimal>,
) -> bool {
    if matches!(token.sign, "▲" | "△") {
        return true;
    }
    if preceding.is_some_and(char::is_alphanumeric) {
        return false;
    }
    Decimal::parse(token.number.trim_end_matches(['k', 'K']))
        .is_some_and(|number| expected.contains(&number))
}

pub fn needs_negative_retry(source: &str, translated: &str) -> bool {
    if translated.contains(['▲', '△']) {
        return true;
    }
    let expected = expected_negatives(source);
    if expected.is_empty() {
        return false;
    }
    EN_SIGNED_NUMBER.captures_iter(translated).any(|caps| {
        let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
        let preceding = translated[..start].chars().next_back();
        signed_token(&caps).is_some_and(|token| should_rewrite(&token, preceding, &expected))
    })
}

/// Rewrites `▲50`, `-50`, `(-50)` and `-(50)` to `(50)` for negatives present in the source.
pub fn fix_negative_parens(source: &str, translated: &str) -> (String, bool) {
    if translated.is_empty() {
        return (translated.to_string(), false);
    }
    let expected = expected_negatives(source);
    let fixed = EN_SIGNED_NUMBER.replace_all(translated, |caps: &Captures| {
        let whole = &caps[0];
        let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
        let preceding = translated[..start].chars().next_back();
        match signed_token(caps) {
            Some(token) if should_rewrite(&token, preceding, &expected) => {
                format!("({})", token.number)
            }
            _ => whole.to_string(),
        }
    });
    let changed = fixed != translated;
    (fixed.into_owned(), changed)
}
