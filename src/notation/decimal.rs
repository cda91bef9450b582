use std::fmt;
use std::hash::{Hash, Hasher};

const MAX_SCALE: u32 = 18;

/// Exact base-10 number (`mantissa / 10^scale`) used for unit arithmetic.
#[derive(Debug, Clone, Copy)]
pub struct Decimal {
    mantissa: i128,
    scale: u32,
}

impl Decimal {
    pub const ZERO: Decimal = Decimal {
        mantissa: 0,
        scale: 0,
    };

    pub fn from_int(value: i128) -> Self {
        Self {
            mantissa: value,
            scale: 0,
        }
    }

    /// Parses `1,234`, `2,238.5`, `-50` style numerals. Commas are ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        let cleaned: String = raw.trim().chars().filter(|ch| *ch != ',').collect();
        let (negative, digits) = match cleaned.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, cleaned.as_str()),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((int_part, frac_part)) => (int_part, frac_part),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }
        if !int_part.chars().all(|ch| ch.is_ascii_digit())
            || !frac_part.chars().all(|ch| ch.is_ascii_digit())
        {
            return None;
        }
        let scale = u32::try_from(frac_part.len()).ok()?;
        if scale > MAX_SCALE {
            return None;
        }
        let mut mantissa: i128 = 0;
        for ch in int_part.chars().chain(frac_part.chars()) {
            let digit = i128::from(ch.to_digit(10)?);
            mantissa = mantissa.checked_mul(10)?.checked_add(digit)?;
        }
        if negative {
            mantissa = -mantissa;
        }
        Some(Self { mantissa, scale }.normalized())
    }

    pub fn checked_mul_int(self, factor: i128) -> Option<Self> {
        Some(
            Self {
                mantissa: self.mantissa.checked_mul(factor)?,
                scale: self.scale,
            }
            .normalized(),
        )
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        let scale = self.scale.max(other.scale);
        let left = self.rescale(scale)?;
        let right = other.rescale(scale)?;
        Some(
            Self {
                mantissa: left.checked_add(right)?,
                scale,
            }
            .normalized(),
        )
    }

    pub fn is_integer(&self) -> bool {
        self.normalized().scale == 0
    }

    pub fn to_integer(&self) -> Option<i128> {
        let normalized = self.normalized();
        (normalized.scale == 0).then_some(normalized.mantissa)
    }

    pub fn is_negative(&self) -> bool {
        self.mantissa < 0
    }

    pub fn abs(self) -> Self {
        Self {
            mantissa: self.mantissa.abs(),
            scale: self.scale,
        }
    }

    /// Formats with thousands separators: `22,385`, `2,238.5`.
    pub fn format_grouped(&self) -> String {
        let normalized = self.normalized();
        let digits = normalized.mantissa.unsigned_abs().to_string();
        let scale = normalized.scale as usize;
        let (int_digits, frac_digits) = if scale == 0 {
            (digits, String::new())
        } else if digits.len() > scale {
            let split = digits.len() - scale;
            (digits[..split].to_string(), digits[split..].to_string())
        } else {
            ("0".to_string(), format!("{:0>width$}", digits, width = scale))
        };
        let mut grouped = String::new();
        for (idx, ch) in int_digits.chars().enumerate() {
            if idx > 0 && (int_digits.len() - idx) % 3 == 0 {
                grouped.push(',');
            }
            grouped.push(ch);
        }
        let sign = if normalized.mantissa < 0 { "-" } else { "" };
        if frac_digits.is_empty() {
            format!("{sign}{grouped}")
        } else {
            format!("{sign}{grouped}.{frac_digits}")
        }
    }

    fn normalized(self) -> Self {
        let mut mantissa = self.mantissa;
        let mut scale = self.scale;
        while scale > 0 && mantissa % 10 == 0 {
            mantissa /= 10;
            scale -= 1;
        }
        if mantissa == 0 {
            scale = 0;
        }
        Self { mantissa, scale }
    }

    fn rescale(&self, scale: u32) -> Option<i128> {
        let diff = scale.checked_sub(self.scale)?;
        self.mantissa.checked_mul(10i128.checked_pow(diff)?)
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        let left = self.normalized();
        let right = other.normalized();
        left.mantissa == right.mantissa && left.scale == right.scale
    }
}

impl Eq for Decimal {}

impl Hash for Decimal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let normalized = self.normalized();
        normalized.mantissa.hash(state);
        normalized.scale.hash(state);
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_grouped())
    }
}
