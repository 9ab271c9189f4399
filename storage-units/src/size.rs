// SPDX-License-Identifier: GPL-3.0-only

//! Storage size representation and arithmetic.
//!
//! Sizes are exact signed byte counts. String parsing accepts an optional
//! sign, decimal fraction, scientific exponent and unit suffix; a bare
//! number in a string is interpreted as KiB, while integer constructors are
//! always bytes. Fractional byte results truncate toward zero.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};
use std::str::FromStr;

use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for size parsing and arithmetic
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SizeError {
    #[error("invalid size string: {0:?}")]
    InvalidSizeString(String),

    #[error("max_places must be non-negative, got {0}")]
    InvalidPlaces(i32),

    #[error("division or modulo by zero size")]
    DivisionByZero,

    #[error("invalid rounding target: {0}")]
    InvalidRounding(String),

    #[error("size arithmetic overflow")]
    Overflow,
}

/// Named byte units, IEC (binary) and SI (decimal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    B,
    KiB,
    MiB,
    GiB,
    TiB,
    PiB,
    EiB,
    ZiB,
    YiB,
    KB,
    MB,
    GB,
    TB,
    PB,
    EB,
    ZB,
    YB,
}

/// The binary units in ladder order, used for human-readable rendering.
const BINARY_LADDER: [Unit; 9] = [
    Unit::B,
    Unit::KiB,
    Unit::MiB,
    Unit::GiB,
    Unit::TiB,
    Unit::PiB,
    Unit::EiB,
    Unit::ZiB,
    Unit::YiB,
];

impl Unit {
    /// Number of bytes in one of this unit.
    pub fn factor(self) -> i128 {
        match self {
            Unit::B => 1,
            Unit::KiB => 1 << 10,
            Unit::MiB => 1 << 20,
            Unit::GiB => 1 << 30,
            Unit::TiB => 1 << 40,
            Unit::PiB => 1 << 50,
            Unit::EiB => 1 << 60,
            Unit::ZiB => 1 << 70,
            Unit::YiB => 1 << 80,
            Unit::KB => 10i128.pow(3),
            Unit::MB => 10i128.pow(6),
            Unit::GB => 10i128.pow(9),
            Unit::TB => 10i128.pow(12),
            Unit::PB => 10i128.pow(15),
            Unit::EB => 10i128.pow(18),
            Unit::ZB => 10i128.pow(21),
            Unit::YB => 10i128.pow(24),
        }
    }

    /// Canonical unit symbol, e.g. "KiB".
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::B => "B",
            Unit::KiB => "KiB",
            Unit::MiB => "MiB",
            Unit::GiB => "GiB",
            Unit::TiB => "TiB",
            Unit::PiB => "PiB",
            Unit::EiB => "EiB",
            Unit::ZiB => "ZiB",
            Unit::YiB => "YiB",
            Unit::KB => "KB",
            Unit::MB => "MB",
            Unit::GB => "GB",
            Unit::TB => "TB",
            Unit::PB => "PB",
            Unit::EB => "EB",
            Unit::ZB => "ZB",
            Unit::YB => "YB",
        }
    }

    /// Position in the binary ladder, if this is a binary unit.
    fn binary_index(self) -> Option<usize> {
        BINARY_LADDER.iter().position(|u| *u == self)
    }

    /// Parse a unit symbol, case-insensitively.
    pub fn parse_symbol(symbol: &str) -> Option<Unit> {
        let all = [
            Unit::B,
            Unit::KiB,
            Unit::MiB,
            Unit::GiB,
            Unit::TiB,
            Unit::PiB,
            Unit::EiB,
            Unit::ZiB,
            Unit::YiB,
            Unit::KB,
            Unit::MB,
            Unit::GB,
            Unit::TB,
            Unit::PB,
            Unit::EB,
            Unit::ZB,
            Unit::YB,
        ];
        all.into_iter()
            .find(|u| u.symbol().eq_ignore_ascii_case(symbol))
    }
}

/// Rounding direction for [`Size::round_to_nearest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundMode {
    /// Round toward positive infinity.
    Up,
    /// Round toward negative infinity.
    Down,
    /// Round to the nearest multiple, ties toward positive infinity.
    HalfUp,
}

/// An exact byte quantity.
///
/// Negative values are allowed; they arise from subtraction in free-space
/// accounting and render with a leading minus sign.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Size(i128);

impl Size {
    pub const ZERO: Size = Size(0);

    pub const fn from_bytes(bytes: i128) -> Size {
        Size(bytes)
    }

    pub const fn kib(n: i128) -> Size {
        Size(n << 10)
    }

    pub const fn mib(n: i128) -> Size {
        Size(n << 20)
    }

    pub const fn gib(n: i128) -> Size {
        Size(n << 30)
    }

    pub const fn tib(n: i128) -> Size {
        Size(n << 40)
    }

    pub const fn bytes(self) -> i128 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn abs(self) -> Size {
        Size(self.0.abs())
    }

    /// Parse a size string such as `"500 MiB"`, `"1.5e+2 KB"` or `"-0.5 TiB"`.
    ///
    /// A string without a unit suffix is interpreted as KiB. Fractional byte
    /// results are truncated toward zero.
    pub fn parse(input: &str) -> Result<Size, SizeError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(SizeError::InvalidSizeString(input.to_string()));
        }

        let bytes_chars: Vec<char> = trimmed.chars().collect();
        let mut pos = 0;

        let negative = match bytes_chars.first() {
            Some('-') => {
                pos += 1;
                true
            }
            Some('+') => {
                pos += 1;
                false
            }
            _ => false,
        };

        let mut int_digits = String::new();
        while pos < bytes_chars.len() && bytes_chars[pos].is_ascii_digit() {
            int_digits.push(bytes_chars[pos]);
            pos += 1;
        }

        let mut frac_digits = String::new();
        if pos < bytes_chars.len() && bytes_chars[pos] == '.' {
            pos += 1;
            while pos < bytes_chars.len() && bytes_chars[pos].is_ascii_digit() {
                frac_digits.push(bytes_chars[pos]);
                pos += 1;
            }
        }

        if int_digits.is_empty() && frac_digits.is_empty() {
            return Err(SizeError::InvalidSizeString(input.to_string()));
        }

        let mut exponent: i32 = 0;
        if pos < bytes_chars.len() && (bytes_chars[pos] == 'e' || bytes_chars[pos] == 'E') {
            // distinguish an exponent from a unit starting with 'E' (EiB/EB)
            let mut look = pos + 1;
            let exp_negative = match bytes_chars.get(look) {
                Some('-') => {
                    look += 1;
                    true
                }
                Some('+') => {
                    look += 1;
                    false
                }
                _ => false,
            };
            let mut exp_digits = String::new();
            while look < bytes_chars.len() && bytes_chars[look].is_ascii_digit() {
                exp_digits.push(bytes_chars[look]);
                look += 1;
            }
            if !exp_digits.is_empty() {
                let magnitude: i32 = exp_digits
                    .parse()
                    .map_err(|_| SizeError::InvalidSizeString(input.to_string()))?;
                exponent = if exp_negative { -magnitude } else { magnitude };
                pos = look;
            } else if exp_negative {
                // a dangling "e+" / "e-" is not a unit
                return Err(SizeError::InvalidSizeString(input.to_string()));
            }
        }

        let unit_str: String = bytes_chars[pos..].iter().collect();
        let unit_str = unit_str.trim();
        let unit = if unit_str.is_empty() {
            Unit::KiB
        } else {
            Unit::parse_symbol(unit_str)
                .ok_or_else(|| SizeError::InvalidSizeString(input.to_string()))?
        };

        // exact value: mantissa * 10^exponent / 10^frac_len * unit_factor
        let mut mantissa: i128 = 0;
        for c in int_digits.chars().chain(frac_digits.chars()) {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add((c as u8 - b'0') as i128))
                .ok_or(SizeError::Overflow)?;
        }

        let scale = frac_digits.len() as i32;
        let net_exp = exponent - scale;

        let mut numerator = mantissa.checked_mul(unit.factor()).ok_or(SizeError::Overflow)?;
        let mut denominator: i128 = 1;
        if net_exp >= 0 {
            numerator = numerator
                .checked_mul(checked_pow10(net_exp as u32)?)
                .ok_or(SizeError::Overflow)?;
        } else {
            denominator = checked_pow10((-net_exp) as u32)?;
        }

        let magnitude = numerator / denominator;
        Ok(Size(if negative { -magnitude } else { magnitude }))
    }

    /// The exact value of this size in `unit` as a float.
    pub fn convert_to(self, unit: Unit) -> f64 {
        self.0 as f64 / unit.factor() as f64
    }

    /// Dimensionless ratio of this size to another.
    pub fn in_units_of(self, other: Size) -> Result<f64, SizeError> {
        if other.is_zero() {
            return Err(SizeError::DivisionByZero);
        }
        Ok(self.0 as f64 / other.0 as f64)
    }

    /// Remainder of this size modulo another size.
    pub fn checked_rem(self, other: Size) -> Result<Size, SizeError> {
        if other.is_zero() {
            return Err(SizeError::DivisionByZero);
        }
        Ok(Size(self.0 % other.0))
    }

    /// Round to the nearest whole multiple of `unit`.
    pub fn round_to_nearest(self, unit: Unit, mode: RoundMode) -> Size {
        // unit factors are positive, so this cannot fail
        self.round_to_size(Size(unit.factor()), mode)
            .unwrap_or(Size::ZERO)
    }

    /// Round to the nearest whole multiple of an arbitrary step size.
    ///
    /// A zero step yields `Size(0)`; a negative step is an error.
    pub fn round_to_size(self, step: Size, mode: RoundMode) -> Result<Size, SizeError> {
        if step.0 < 0 {
            return Err(SizeError::InvalidRounding(format!("{step}")));
        }
        if step.0 == 0 {
            return Ok(Size::ZERO);
        }

        let s = step.0;
        let rounded = match mode {
            RoundMode::Down => self.0.div_euclid(s) * s,
            RoundMode::Up => {
                let down = self.0.div_euclid(s) * s;
                if down == self.0 { down } else { down + s }
            }
            RoundMode::HalfUp => (self.0 + s / 2).div_euclid(s) * s,
        };
        Ok(Size(rounded))
    }

    /// Grow this size so that `percent` of the result is reserve on top of
    /// the original value. `ensure_percent_reserve(20)` of 8 GiB is 10 GiB.
    pub fn ensure_percent_reserve(self, percent: u32) -> Result<Size, SizeError> {
        if percent >= 100 {
            return Err(SizeError::InvalidRounding(format!("{percent}%")));
        }
        let grown = self
            .0
            .checked_mul(100)
            .ok_or(SizeError::Overflow)?
            / (100 - percent as i128);
        Ok(Size(grown))
    }

    /// Human-readable rendering using binary units.
    ///
    /// The largest unit (at or above `min_unit`) in which the magnitude is
    /// at least one whole unit is chosen. `max_places` of `None` renders all
    /// significant digits; sizes are dyadic, so the expansion terminates.
    /// Trailing zeros are stripped. `locale` applies digit-group separators
    /// to the integer part.
    pub fn human_readable(
        self,
        max_places: Option<i32>,
        min_unit: Unit,
        locale: Option<&Locale>,
    ) -> Result<String, SizeError> {
        if let Some(places) = max_places {
            if places < 0 {
                return Err(SizeError::InvalidPlaces(places));
            }
        }

        let magnitude = self.0.unsigned_abs();
        let start = min_unit.binary_index().unwrap_or(0);

        let mut idx = start;
        while idx < BINARY_LADDER.len() - 1 && (magnitude >> (10 * idx)) >= 1024 {
            idx += 1;
        }

        let shift = 10 * idx as u32;
        let mut int_part = magnitude >> shift;
        let mask: u128 = (1u128 << shift) - 1;
        let mut frac = magnitude & mask;

        let mut digits: Vec<u8> = Vec::new();
        match max_places {
            None => {
                while frac != 0 {
                    frac *= 10;
                    digits.push((frac >> shift) as u8);
                    frac &= mask;
                }
            }
            Some(places) => {
                let places = places as usize;
                for _ in 0..=places {
                    frac *= 10;
                    digits.push((frac >> shift) as u8);
                    frac &= mask;
                }
                // decimal half-up on the extra digit
                let round_up = digits.pop().is_some_and(|d| d >= 5);
                if round_up {
                    let mut carry = true;
                    for d in digits.iter_mut().rev() {
                        if carry {
                            *d += 1;
                            carry = *d == 10;
                            if carry {
                                *d = 0;
                            }
                        }
                    }
                    if carry {
                        int_part += 1;
                    }
                }
            }
        }

        while digits.last() == Some(&0) {
            digits.pop();
        }

        let int_text = match locale {
            Some(locale) => int_part.to_formatted_string(locale),
            None => int_part.to_string(),
        };

        let sign = if self.0 < 0 { "-" } else { "" };
        let unit = BINARY_LADDER[idx];
        if digits.is_empty() {
            Ok(format!("{sign}{int_text} {}", unit.symbol()))
        } else {
            let frac_text: String = digits.iter().map(|d| (b'0' + d) as char).collect();
            Ok(format!("{sign}{int_text}.{frac_text} {}", unit.symbol()))
        }
    }
}

fn checked_pow10(exp: u32) -> Result<i128, SizeError> {
    10i128.checked_pow(exp).ok_or(SizeError::Overflow)
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // max_places of 2 is non-negative, so this cannot fail
        let text = self
            .human_readable(Some(2), Unit::B, None)
            .unwrap_or_else(|_| format!("{} B", self.0));
        f.write_str(&text)
    }
}

impl FromStr for Size {
    type Err = SizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Size::parse(s)
    }
}

impl From<u64> for Size {
    fn from(bytes: u64) -> Size {
        Size(bytes as i128)
    }
}

impl From<i128> for Size {
    fn from(bytes: i128) -> Size {
        Size(bytes)
    }
}

impl Add for Size {
    type Output = Size;

    fn add(self, rhs: Size) -> Size {
        Size(self.0 + rhs.0)
    }
}

impl AddAssign for Size {
    fn add_assign(&mut self, rhs: Size) {
        self.0 += rhs.0;
    }
}

impl Sub for Size {
    type Output = Size;

    fn sub(self, rhs: Size) -> Size {
        Size(self.0 - rhs.0)
    }
}

impl SubAssign for Size {
    fn sub_assign(&mut self, rhs: Size) {
        self.0 -= rhs.0;
    }
}

impl Neg for Size {
    type Output = Size;

    fn neg(self) -> Size {
        Size(-self.0)
    }
}

impl Mul<i128> for Size {
    type Output = Size;

    fn mul(self, rhs: i128) -> Size {
        Size(self.0 * rhs)
    }
}

impl Mul<Size> for i128 {
    type Output = Size;

    fn mul(self, rhs: Size) -> Size {
        Size(self * rhs.0)
    }
}

impl Div<i128> for Size {
    type Output = Size;

    fn div(self, rhs: i128) -> Size {
        Size(self.0 / rhs)
    }
}

impl Sum for Size {
    fn sum<I: Iterator<Item = Size>>(iter: I) -> Size {
        iter.fold(Size::ZERO, |acc, s| acc + s)
    }
}

impl<'a> Sum<&'a Size> for Size {
    fn sum<I: Iterator<Item = &'a Size>>(iter: I) -> Size {
        iter.fold(Size::ZERO, |acc, s| acc + *s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hr(size: Size, places: Option<i32>) -> String {
        size.human_readable(places, Unit::B, None).unwrap()
    }

    #[test]
    fn parses_plain_and_suffixed_strings() {
        assert_eq!(Size::parse("0.0").unwrap(), Size::ZERO);
        assert_eq!(Size::parse("500 MiB").unwrap(), Size::mib(500));
        assert_eq!(Size::parse("500MiB").unwrap(), Size::mib(500));
        assert_eq!(Size::parse("1 KB").unwrap(), Size::from_bytes(1000));
        // a bare number in a string is KiB
        assert_eq!(Size::parse("1024").unwrap(), Size::mib(1));
        assert_eq!(Size::parse("1").unwrap(), Size::kib(1));
    }

    #[test]
    fn parses_fractions_and_truncates_partial_bytes() {
        assert_eq!(Size::parse("0.5 KiB").unwrap(), Size::from_bytes(512));
        assert_eq!(Size::parse(".5 KiB").unwrap(), Size::from_bytes(512));
        assert_eq!(Size::parse("+.5 KiB").unwrap(), Size::from_bytes(512));
        assert_eq!(Size::parse("1. KiB").unwrap(), Size::kib(1));
        assert_eq!(Size::parse("-1. KiB").unwrap(), -Size::kib(1));
        assert_eq!(Size::parse("0.9 KiB").unwrap(), Size::from_bytes(921));
        assert_eq!(Size::parse("1024.6 B").unwrap(), Size::from_bytes(1024));
    }

    #[test]
    fn parses_scientific_notation() {
        assert_eq!(Size::parse("1e+0 KiB").unwrap(), Size::kib(1));
        assert_eq!(Size::parse("1.5e+0 KiB").unwrap(), Size::from_bytes(1536));
        assert_eq!(Size::parse("1e-1 KB").unwrap(), Size::from_bytes(100));
        assert_eq!(Size::parse("1E-4KB").unwrap(), Size::ZERO);
        assert_eq!(Size::parse("1e+01").unwrap(), Size::kib(10));
        assert_eq!(Size::parse(" 1e+0KiB").unwrap(), Size::kib(1));
    }

    #[test]
    fn parses_whitespace_and_signs() {
        assert_eq!(Size::parse(" 1 KiB ").unwrap(), Size::kib(1));
        assert_eq!(Size::parse(" 1KiB").unwrap(), Size::kib(1));
        assert_eq!(Size::parse("001 KiB").unwrap(), Size::kib(1));
        assert_eq!(Size::parse("-500MiB").unwrap(), -Size::mib(500));
        assert_eq!(Size::parse("-500MiB").unwrap().bytes(), -524288000);
    }

    #[test]
    fn rejects_malformed_strings() {
        for bad in [
            "",
            "e+0",
            "+ 1 KiB",
            "- 1 KiB",
            ". KiB",
            "1.0e+ KiB",
            "1.0.0",
            "1 KiB just a lot of stray characters",
            "just 1 KiB",
            "1 XiB",
        ] {
            assert!(
                matches!(Size::parse(bad), Err(SizeError::InvalidSizeString(_))),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn distinguishes_exponents_from_e_units() {
        assert_eq!(Size::parse("1 EiB").unwrap(), Size::from_bytes(1 << 60));
        assert_eq!(Size::parse("1EB").unwrap(), Size::from_bytes(10i128.pow(18)));
        assert_eq!(Size::parse("2e2").unwrap(), Size::kib(200));
    }

    #[test]
    fn human_readable_picks_sensible_units() {
        assert_eq!(hr(Size::from_bytes(58929971), Some(2)), "56.2 MiB");
        assert_eq!(hr(Size::from_bytes(478360371), Some(2)), "456.2 MiB");
        assert_eq!(hr(Size::from_bytes(500), Some(0)), "500 B");
        assert_eq!(hr(Size::from_bytes(0xff), Some(2)), "255 B");
        assert_eq!(hr(Size::ZERO, Some(2)), "0 B");
        assert_eq!(hr(-Size::mib(500), Some(2)), "-500 MiB");
    }

    #[test]
    fn human_readable_is_stable_for_exact_inputs() {
        for text in ["56.19 MiB", "26.55 MiB", "300 MiB", "12.68 TiB"] {
            let size = Size::parse(text).unwrap();
            assert_eq!(hr(size, Some(2)), text);
        }
    }

    #[test]
    fn human_readable_rounds_half_up_at_max_places() {
        assert_eq!(hr(Size::parse("12.687 TiB").unwrap(), Some(2)), "12.69 TiB");
        assert_eq!(hr(Size::parse("23.7874 TiB").unwrap(), Some(3)), "23.787 TiB");
        assert_eq!(hr(Size::parse("12.6998 TiB").unwrap(), Some(2)), "12.7 TiB");
        // close to the next whole unit the fraction rounds away entirely
        assert_eq!(hr(Size::from_bytes(16384 - 5), Some(2)), "16 KiB");
        assert_eq!(hr(Size::from_bytes(16384 - 11), Some(2)), "15.99 KiB");
        assert_eq!(hr(Size::from_bytes(0xffff), Some(2)), "64 KiB");
    }

    #[test]
    fn human_readable_all_places_is_exact() {
        assert_eq!(hr(Size::from_bytes(0x10000), None), "64 KiB");
        assert_eq!(hr(Size::from_bytes(0x10001), None), "64.0009765625 KiB");
        assert_eq!(hr(Size::from_bytes(0xffff), None), "63.9990234375 KiB");
        assert_eq!(
            hr(Size::from_bytes(0xfffffffffffff), None),
            "3.99999999999999911182158029987476766109466552734375 PiB"
        );
        assert_eq!(hr(Size::from_bytes(0xfffffffffffff), Some(2)), "4 PiB");
    }

    #[test]
    fn human_readable_tops_out_at_yib() {
        let yib = 1i128 << 80;
        assert_eq!(hr(Size::from_bytes(yib * 1024), Some(2)), "1024 YiB");
        assert_eq!(hr(Size::from_bytes(yib * 1024 - 1), Some(2)), "1024 YiB");
        assert_eq!(hr(Size::from_bytes(yib * 1024 * 1024), Some(2)), "1048576 YiB");
    }

    #[test]
    fn human_readable_rejects_negative_places() {
        let size = Size::kib(1);
        assert_eq!(
            size.human_readable(Some(-1), Unit::B, None),
            Err(SizeError::InvalidPlaces(-1))
        );
    }

    #[test]
    fn human_readable_respects_locale_grouping() {
        let text = Size::from_bytes((1 << 80) * 1048576)
            .human_readable(Some(2), Unit::B, Some(&Locale::en))
            .unwrap();
        assert_eq!(text, "1,048,576 YiB");
    }

    #[test]
    fn parse_human_readable_round_trips() {
        for bytes in [0i128, 1, 512, 58929971, 0x10001, 0xfffffffffffff, -524288000] {
            let size = Size::from_bytes(bytes);
            let text = size.human_readable(None, Unit::B, None).unwrap();
            assert_eq!(Size::parse(&text).unwrap(), size, "{text}");
        }
    }

    #[test]
    fn converts_to_units() {
        let size = Size::from_bytes(1835008);
        assert_eq!(size.convert_to(Unit::B), 1835008.0);
        assert_eq!(size.convert_to(Unit::KiB), 1792.0);
        assert_eq!(size.convert_to(Unit::MiB), 1.75);
        assert_eq!(Size::from_bytes(512).in_units_of(Size::kib(1)).unwrap(), 0.5);
        assert_eq!(Size::kib(1).in_units_of(Size::from_bytes(512)).unwrap(), 2.0);
        assert_eq!(
            Size::kib(1).in_units_of(Size::ZERO),
            Err(SizeError::DivisionByZero)
        );
    }

    #[test]
    fn rounds_to_nearest_unit() {
        let size = Size::from_bytes(1500);
        assert_eq!(size.round_to_nearest(Unit::KiB, RoundMode::Down), Size::kib(1));
        assert_eq!(size.round_to_nearest(Unit::KiB, RoundMode::Up), Size::kib(2));
        assert_eq!(size.round_to_nearest(Unit::KiB, RoundMode::HalfUp), Size::kib(1));
        assert_eq!(
            Size::from_bytes(1536).round_to_nearest(Unit::KiB, RoundMode::HalfUp),
            Size::kib(2)
        );
        assert_eq!(Size::kib(4).round_to_nearest(Unit::KiB, RoundMode::Up), Size::kib(4));
    }

    #[test]
    fn rounds_to_step_sizes() {
        let size = Size::mib(300);
        assert_eq!(size.round_to_size(Size::mib(4), RoundMode::Down).unwrap(), Size::mib(300));
        assert_eq!(
            Size::mib(301).round_to_size(Size::mib(4), RoundMode::Up).unwrap(),
            Size::mib(304)
        );
        assert_eq!(size.round_to_size(Size::ZERO, RoundMode::Up).unwrap(), Size::ZERO);
        assert!(size.round_to_size(-Size::mib(1), RoundMode::Up).is_err());
    }

    #[test]
    fn modulo_by_size() {
        let total = Size::mib(300);
        let chunk = Size::kib(512);
        assert_eq!(total.checked_rem(chunk).unwrap(), Size::ZERO);
        assert_eq!(
            Size::from_bytes(1500).checked_rem(chunk).unwrap(),
            Size::from_bytes(1500)
        );
        assert_eq!(total.checked_rem(Size::ZERO), Err(SizeError::DivisionByZero));
    }

    #[test]
    fn percent_reserve_grows_proportionally() {
        let size = Size::gib(8);
        let grown = size.ensure_percent_reserve(20).unwrap();
        let expected = Size::gib(10);
        assert!((grown - expected).abs() < Size::mib(1), "{grown} vs {expected}");
        assert!(Size::gib(1).ensure_percent_reserve(100).is_err());
    }

    #[test]
    fn arithmetic_and_sum() {
        assert_eq!(Size::kib(1) + Size::kib(1), Size::kib(2));
        assert_eq!(Size::kib(2) - Size::kib(3), -Size::kib(1));
        assert_eq!(Size::kib(2) * 3, Size::kib(6));
        assert_eq!(3 * Size::kib(2), Size::kib(6));
        assert_eq!(Size::kib(3) / 2, Size::from_bytes(1536));
        let total: Size = [Size::mib(1), Size::mib(2), Size::mib(3)].iter().sum();
        assert_eq!(total, Size::mib(6));
    }

    #[test]
    fn serde_round_trips_as_bytes() {
        let size = Size::mib(500);
        let json = serde_json::to_string(&size).unwrap();
        assert_eq!(json, "524288000");
        assert_eq!(serde_json::from_str::<Size>(&json).unwrap(), size);
    }

    proptest::proptest! {
        #[test]
        fn human_readable_round_trips_for_any_size(bytes in -(1i128 << 90)..(1i128 << 90)) {
            let size = Size::from_bytes(bytes);
            let text = size.human_readable(None, Unit::B, None).unwrap();
            proptest::prop_assert_eq!(Size::parse(&text).unwrap(), size);
        }

        #[test]
        fn rounding_down_never_grows(bytes in 0i128..(1i128 << 70), step in 1i128..(1i128 << 30)) {
            let size = Size::from_bytes(bytes);
            let rounded = size.round_to_size(Size::from_bytes(step), RoundMode::Down).unwrap();
            proptest::prop_assert!(rounded <= size);
            proptest::prop_assert_eq!(rounded.checked_rem(Size::from_bytes(step)).unwrap(), Size::ZERO);
        }
    }
}
