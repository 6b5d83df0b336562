use crate::Quantity;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("quantity is empty")]
    Empty,

    #[error("invalid quantity '{0}'")]
    Invalid(String),

    #[error("quantity '{0}' has an unknown suffix")]
    Suffix(String),

    #[error("quantity '{0}' does not fit in a byte count")]
    Overflow(String),
}

/// Parses a storage quantity (e.g. `10Gi`, `1.5G`, `1e9`) into bytes.
///
/// Fractional byte counts are rounded up, as the API server does.
pub fn parse_bytes(Quantity(value): &Quantity) -> Result<i64, QuantityError> {
    let s = value.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }
    let s = s.strip_prefix('+').unwrap_or(s);

    let number_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(number_end);
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
        return Err(QuantityError::Invalid(value.clone()));
    }

    let overflow = || QuantityError::Overflow(value.clone());
    let (numerator, denominator) = multiplier(suffix).ok_or_else(|| {
        // A well-formed exponent only fails to produce a multiplier when it
        // is too large.
        match suffix.strip_prefix(['e', 'E']).map(str::parse::<i32>) {
            Some(Ok(_)) => overflow(),
            _ => QuantityError::Suffix(value.clone()),
        }
    })?;

    // The mantissa is `whole.fraction` scaled by 10^len(fraction).
    let mut mantissa: i128 = 0;
    for digit in whole.bytes().chain(fraction.bytes()) {
        mantissa = mantissa
            .checked_mul(10)
            .and_then(|m| m.checked_add(i128::from(digit - b'0')))
            .ok_or_else(overflow)?;
    }
    let scale = u32::try_from(fraction.len())
        .ok()
        .and_then(|len| 10i128.checked_pow(len))
        .ok_or_else(overflow)?;

    let scaled = mantissa.checked_mul(numerator).ok_or_else(overflow)?;
    let divisor = scale.checked_mul(denominator).ok_or_else(overflow)?;
    let bytes = scaled / divisor + i128::from(scaled % divisor != 0);
    i64::try_from(bytes).map_err(|_| overflow())
}

/// Returns the multiplier for a suffix as a fraction.
fn multiplier(suffix: &str) -> Option<(i128, i128)> {
    let m = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        "k" => 10i128.pow(3),
        "M" => 10i128.pow(6),
        "G" => 10i128.pow(9),
        "T" => 10i128.pow(12),
        "P" => 10i128.pow(15),
        "E" => 10i128.pow(18),
        "m" => return Some((1, 1000)),
        _ => return exponent(suffix),
    };
    Some((m, 1))
}

/// Decimal exponent suffixes, e.g. `e3` or `E-2`.
fn exponent(suffix: &str) -> Option<(i128, i128)> {
    let exp = suffix.strip_prefix(['e', 'E'])?.parse::<i32>().ok()?;
    let pow = 10i128.checked_pow(exp.unsigned_abs())?;
    if exp < 0 {
        Some((1, pow))
    } else {
        Some((pow, 1))
    }
}
