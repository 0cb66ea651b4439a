//! Integer money and day-count primitives.
//!
//! All monetary values handled by the engine are stored as a signed
//! count of minor units (cents, paise).  Floating point never takes
//! part in accumulation, so running the same calculation twice always
//! yields byte-identical totals.  Day counts that can include half
//! days are stored as a number of halves for the same reason.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};

/// An amount of money in minor units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(pub i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn minor_units(self) -> i64 {
        self.0
    }

    /// Multiply by a whole count.
    pub fn times(self, count: i64) -> Money {
        Money(self.0 * count)
    }

    /// Multiply by `numerator / denominator`, flooring the result.
    ///
    /// The product is formed in `i128` so large salaries multiplied by
    /// minute counts cannot overflow before the division.
    pub fn scale(self, numerator: i64, denominator: i64) -> Money {
        if denominator == 0 {
            return Money::ZERO;
        }
        let product = self.0 as i128 * numerator as i128;
        Money(product.div_euclid(denominator as i128) as i64)
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A number of days with half-day resolution.
///
/// Serialised as a plain JSON number (`2.5`) so downstream consumers
/// see the familiar representation, but arithmetic stays integral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "f64", try_from = "f64")]
pub struct DayCount {
    halves: u32,
}

impl DayCount {
    pub const ZERO: DayCount = DayCount { halves: 0 };

    pub fn whole(days: u32) -> Self {
        Self { halves: days * 2 }
    }

    pub fn half() -> Self {
        Self { halves: 1 }
    }

    pub fn from_halves(halves: u32) -> Self {
        Self { halves }
    }

    pub fn halves(self) -> u32 {
        self.halves
    }

    pub fn as_f64(self) -> f64 {
        self.halves as f64 / 2.0
    }
}

impl Add for DayCount {
    type Output = DayCount;
    fn add(self, rhs: DayCount) -> DayCount {
        DayCount {
            halves: self.halves + rhs.halves,
        }
    }
}

impl AddAssign for DayCount {
    fn add_assign(&mut self, rhs: DayCount) {
        self.halves += rhs.halves;
    }
}

impl From<DayCount> for f64 {
    fn from(value: DayCount) -> f64 {
        value.as_f64()
    }
}

impl TryFrom<f64> for DayCount {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        let halves = value * 2.0;
        if value < 0.0 || halves.fract() != 0.0 || !halves.is_finite() {
            return Err(format!("{value} is not a whole or half day count"));
        }
        Ok(DayCount {
            halves: halves as u32,
        })
    }
}

impl fmt::Display for DayCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_floors() {
        assert_eq!(Money(1000).scale(3, 2), Money(1500));
        assert_eq!(Money(1001).scale(1, 2), Money(500));
        assert_eq!(Money(10).scale(1, 0), Money::ZERO);
    }

    #[test]
    fn test_day_count_serialises_as_number() {
        let days = DayCount::whole(2) + DayCount::half();
        assert_eq!(serde_json::to_string(&days).unwrap(), "2.5");
        let back: DayCount = serde_json::from_str("1.5").unwrap();
        assert_eq!(back.halves(), 3);
        assert!(serde_json::from_str::<DayCount>("0.3").is_err());
    }
}
