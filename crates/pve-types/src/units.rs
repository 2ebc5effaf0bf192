// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Conversions between suffixed size strings, fixed-point decimals, and the
//! integer units the configuration model stores.
//!
//! Sizes are stored as kibibyte counts. On the wire they appear either with a
//! unit suffix (`32G`, `4100K`) or, in disk creation tokens, as a fractional
//! number of gibibytes (`0.5`). Fractional rates are stored as integers scaled
//! by a fixed power of ten and rendered with trailing zeros trimmed.

use thiserror::Error;

/// One kibibyte, the base unit for every stored size.
pub const KIBIBYTE: u64 = 1;
/// One mebibyte, in kibibytes.
pub const MEBIBYTE: u64 = 1 << 10;
/// One gibibyte, in kibibytes.
pub const GIBIBYTE: u64 = 1 << 20;
/// One tebibyte, in kibibytes.
pub const TEBIBYTE: u64 = 1 << 30;

const MAX_FRACTION_DIGITS: usize = 18;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UnitError {
    #[error("unrecognized unit suffix in {0:?}")]
    UnknownSuffix(String),

    #[error("{0:?} is not a number")]
    NotANumber(String),

    #[error("{0:?} has more than {1} decimal places")]
    TooPrecise(String, u32),

    #[error("{0:?} is too large")]
    Overflow(String),
}

/// A decimal number split into its integral digits and fractional digits.
struct Decimal<'a> {
    integral: &'a str,
    fraction: &'a str,
}

impl<'a> Decimal<'a> {
    fn parse(s: &'a str) -> Option<Self> {
        let (integral, fraction) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };

        if integral.is_empty() && fraction.is_empty() {
            return None;
        }

        let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if !digits(integral) || !digits(fraction) {
            return None;
        }

        Some(Self { integral, fraction })
    }

    /// Scales this decimal by `multiplier`, truncating any remainder.
    fn scale(&self, multiplier: u128) -> Option<u128> {
        let integral = if self.integral.is_empty() {
            0
        } else {
            self.integral.parse::<u128>().ok()?
        };
        let mut value = integral.checked_mul(multiplier)?;

        if !self.fraction.is_empty() {
            let numerator = self.fraction.parse::<u128>().ok()?;
            let denominator =
                10u128.checked_pow(self.fraction.len() as u32)?;
            value = value
                .checked_add(numerator.checked_mul(multiplier)? / denominator)?;
        }

        Some(value)
    }
}

fn suffix_multiplier(suffix: char) -> Option<u64> {
    match suffix.to_ascii_uppercase() {
        'K' => Some(KIBIBYTE),
        'M' => Some(MEBIBYTE),
        'G' => Some(GIBIBYTE),
        'T' => Some(TEBIBYTE),
        _ => None,
    }
}

/// Parses a size such as `512`, `4100K`, `1.5G` or `2T` into kibibytes.
///
/// A missing suffix means kibibytes. Fractions are truncated to a whole
/// number of kibibytes.
pub fn parse_size(s: &str) -> Result<u64, UnitError> {
    let trimmed = s.trim();
    let (body, multiplier) = match trimmed.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let multiplier = suffix_multiplier(c)
                .ok_or_else(|| UnitError::UnknownSuffix(s.to_owned()))?;
            (&trimmed[..trimmed.len() - 1], multiplier)
        }
        Some(_) => (trimmed, KIBIBYTE),
        None => return Err(UnitError::NotANumber(s.to_owned())),
    };

    let decimal = Decimal::parse(body)
        .ok_or_else(|| UnitError::NotANumber(s.to_owned()))?;
    if decimal.fraction.len() > MAX_FRACTION_DIGITS {
        return Err(UnitError::TooPrecise(
            s.to_owned(),
            MAX_FRACTION_DIGITS as u32,
        ));
    }

    decimal
        .scale(u128::from(multiplier))
        .and_then(|kib| u64::try_from(kib).ok())
        .ok_or_else(|| UnitError::Overflow(s.to_owned()))
}

/// Formats a kibibyte count using the largest unit that divides it exactly.
pub fn format_size(kib: u64) -> String {
    if kib == 0 {
        return "0K".to_owned();
    }

    for (unit, suffix) in [(TEBIBYTE, 'T'), (GIBIBYTE, 'G'), (MEBIBYTE, 'M')] {
        if kib % unit == 0 {
            return format!("{}{}", kib / unit, suffix);
        }
    }

    format!("{}K", kib)
}

/// Formats a kibibyte count as a number of gibibytes with at most three
/// decimal places, as used by disk creation tokens (`local-lvm:0.5`).
///
/// Nonzero sizes never round down to zero.
pub fn format_gibibytes(kib: u64) -> String {
    let gib = u128::from(GIBIBYTE);
    let thousandths = (u128::from(kib) * 1000 + gib / 2) / gib;
    let thousandths = match thousandths {
        0 if kib > 0 => 1,
        t => t,
    };
    format_decimal(u64::try_from(thousandths).unwrap_or(u64::MAX), 3)
}

/// Parses a decimal string into an integer scaled by `10^places`, so that
/// `parse_decimal("1.5", 3)` is `1500`.
pub fn parse_decimal(s: &str, places: u32) -> Result<u64, UnitError> {
    let trimmed = s.trim();
    let decimal = Decimal::parse(trimmed)
        .ok_or_else(|| UnitError::NotANumber(s.to_owned()))?;

    let significant = decimal.fraction.trim_end_matches('0');
    if significant.len() > places as usize {
        return Err(UnitError::TooPrecise(s.to_owned(), places));
    }
    let decimal = Decimal { integral: decimal.integral, fraction: significant };

    let multiplier = 10u128.pow(places);
    decimal
        .scale(multiplier)
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| UnitError::Overflow(s.to_owned()))
}

/// Renders an integer scaled by `10^places` as a decimal with trailing zeros
/// (and a trailing point) removed.
pub fn format_decimal(value: u64, places: u32) -> String {
    let scale = 10u64.pow(places);
    let integral = value / scale;
    let fraction = value % scale;
    if fraction == 0 {
        return integral.to_string();
    }

    let digits = format!("{:0width$}", fraction, width = places as usize);
    format!("{}.{}", integral, digits.trim_end_matches('0'))
}

/// Converts a floating point value into an integer scaled by `10^places`,
/// rounding to the nearest representable value. Negative and non-finite
/// inputs yield `None`.
pub fn scale_float(value: f64, places: u32) -> Option<u64> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let scaled = (value * 10f64.powi(places as i32)).round();
    if scaled > u64::MAX as f64 {
        return None;
    }
    Some(scaled as u64)
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    const SIZE_CASES: &[(&str, Result<u64, ()>)] = &[
        ("512", Ok(512)),
        ("4100K", Ok(4100)),
        ("4100k", Ok(4100)),
        ("16M", Ok(16 * MEBIBYTE)),
        ("32G", Ok(32 * GIBIBYTE)),
        ("1.5G", Ok(1_572_864)),
        ("0.001G", Ok(1048)),
        ("2T", Ok(2 * TEBIBYTE)),
        (" 8G ", Ok(8 * GIBIBYTE)),
        (".5M", Ok(512)),
        ("32X", Err(())),
        ("G", Err(())),
        ("", Err(())),
        ("1.2.3G", Err(())),
        ("-1G", Err(())),
        ("99999999999999999999T", Err(())),
    ];

    #[test]
    fn size_parsing() {
        for (input, expected) in SIZE_CASES {
            match parse_size(input) {
                Ok(kib) => assert_eq!(
                    kib,
                    expected.unwrap(),
                    "parsing {:?}",
                    input
                ),
                Err(_) => assert!(
                    expected.is_err(),
                    "Expected error parsing size {:?}",
                    input
                ),
            }
        }
    }

    #[test]
    fn size_parse_errors() {
        assert_eq!(
            parse_size("10Q"),
            Err(UnitError::UnknownSuffix("10Q".to_owned()))
        );
        assert_eq!(
            parse_size("ten"),
            Err(UnitError::UnknownSuffix("ten".to_owned()))
        );
        assert_eq!(
            parse_size("1x0"),
            Err(UnitError::NotANumber("1x0".to_owned()))
        );
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(0), "0K");
        assert_eq!(format_size(4097), "4097K");
        assert_eq!(format_size(2048), "2M");
        assert_eq!(format_size(33_554_432), "32G");
        assert_eq!(format_size(1_572_864), "1536M");
        assert_eq!(format_size(3 * TEBIBYTE), "3T");
    }

    #[test]
    fn gibibyte_formatting() {
        assert_eq!(format_gibibytes(33_554_432), "32");
        assert_eq!(format_gibibytes(GIBIBYTE / 2), "0.5");
        assert_eq!(format_gibibytes(4097), "0.004");
        assert_eq!(format_gibibytes(1), "0.001");
        assert_eq!(format_gibibytes(0), "0");
    }

    #[test]
    fn decimal_conversions() {
        assert_eq!(parse_decimal("1.5", 3), Ok(1500));
        assert_eq!(parse_decimal("0.001", 3), Ok(1));
        assert_eq!(parse_decimal("12", 2), Ok(1200));
        assert_eq!(parse_decimal("1.2500", 2), Ok(125));
        assert!(parse_decimal("1.234", 2).is_err());
        assert!(parse_decimal("abc", 2).is_err());

        assert_eq!(format_decimal(1500, 3), "1.5");
        assert_eq!(format_decimal(1, 3), "0.001");
        assert_eq!(format_decimal(1200, 2), "12");
        assert_eq!(format_decimal(1205, 2), "12.05");
        assert_eq!(format_decimal(0, 3), "0");
    }

    #[test]
    fn float_scaling() {
        assert_eq!(scale_float(1.1, 3), Some(1100));
        assert_eq!(scale_float(0.1 + 0.2, 2), Some(30));
        assert_eq!(scale_float(-1.0, 2), None);
        assert_eq!(scale_float(f64::NAN, 2), None);
    }

    proptest! {
        #[test]
        fn formatted_sizes_reparse(kib in any::<u64>()) {
            prop_assert_eq!(parse_size(&format_size(kib)), Ok(kib));
        }

        #[test]
        fn parsed_sizes_survive_reformatting(
            whole in 0u64..1_000_000,
            suffix in prop::sample::select(vec!["", "K", "M", "G", "T"]),
        ) {
            let input = format!("{}{}", whole, suffix);
            let kib = parse_size(&input).unwrap();
            prop_assert_eq!(parse_size(&format_size(kib)), Ok(kib));
        }

        #[test]
        fn decimals_round_trip(value in any::<u64>(), places in 0u32..6) {
            let rendered = format_decimal(value, places);
            prop_assert_eq!(parse_decimal(&rendered, places), Ok(value));
        }
    }
}
