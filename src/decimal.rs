//! Fixed-point balance amount with 4 decimal places.
//!
//! Account balances are stored as `rust_decimal` values rescaled to four
//! places, so summing the same balances in the same order always yields the
//! same bits regardless of which strategy or thread performed the addition.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub};
use std::str::FromStr;

/// A signed monetary amount with exactly 4 decimal places.
///
/// # Examples
///
/// ```
/// use std::str::FromStr;
/// use bms_batch::Decimal4;
///
/// let a = Decimal4::from_str("100").unwrap();
/// let b = Decimal4::from_str("-30.5").unwrap();
/// assert_eq!((a + b).to_string(), "69.5000");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Decimal4(Decimal);

impl Decimal4 {
    pub const SCALE: u32 = 4;

    pub const ZERO: Self = Decimal4(Decimal::ZERO);

    /// Wraps a `Decimal`, rescaling it to 4 places.
    ///
    /// Returns `None` when the value is too large to carry 4 decimal places.
    pub fn try_new(value: Decimal) -> Option<Self> {
        let mut scaled = value;
        scaled.rescale(Self::SCALE);
        (scaled.scale() == Self::SCALE).then_some(Decimal4(scaled))
    }

    /// Whole-unit amount, e.g. `Decimal4::from_units(250)` is `250.0000`.
    pub fn from_units(units: i64) -> Self {
        // Every i64 fits in 96 bits at scale 4.
        let mut scaled = Decimal::from(units);
        scaled.rescale(Self::SCALE);
        Decimal4(scaled)
    }

    /// Addition that returns `None` instead of overflowing or dropping scale.
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).and_then(Decimal4::try_new)
    }

    /// Left fold of `checked_add` from `ZERO`, in iterator order.
    pub fn checked_sum<I>(iter: I) -> Option<Self>
    where
        I: IntoIterator<Item = Self>,
    {
        iter.into_iter()
            .try_fold(Decimal4::ZERO, |acc, x| acc.checked_add(x))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    /// Underlying decimal value.
    pub fn inner(&self) -> Decimal {
        self.0
    }
}

impl From<i64> for Decimal4 {
    fn from(units: i64) -> Self {
        Decimal4::from_units(units)
    }
}

impl FromStr for Decimal4 {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let value = Decimal::from_str(s.trim())?;
        Decimal4::try_new(value).ok_or_else(|| {
            rust_decimal::Error::ErrorString(format!(
                "{} cannot be held with {} decimal places",
                value,
                Self::SCALE
            ))
        })
    }
}

impl fmt::Display for Decimal4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

/// Panics on overflow, like primitive integer arithmetic in debug builds.
/// Aggregation uses [`Decimal4::checked_add`] instead.
impl Add for Decimal4 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        match self.checked_add(rhs) {
            Some(sum) => sum,
            None => panic!("Decimal4 overflow: {} + {}", self, rhs),
        }
    }
}

impl AddAssign for Decimal4 {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Decimal4 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        self + (-rhs)
    }
}

impl Neg for Decimal4 {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Decimal4(-self.0)
    }
}

/// Left fold from `ZERO`; panics on overflow like `Add`.
impl Sum for Decimal4 {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Decimal4::ZERO, |acc, x| acc + x)
    }
}

impl<'a> Sum<&'a Decimal4> for Decimal4 {
    fn sum<I: Iterator<Item = &'a Decimal4>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

impl Serialize for Decimal4 {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Decimal4 {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Decimal4::from_str(&s).map_err(serde::de::Error::custom)
    }
}
