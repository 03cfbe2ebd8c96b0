use derive_more::{Add, AddAssign, Sub, SubAssign, Sum};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use thiserror::Error;

pub type ResourceUnits = u64;
pub type ResourceMillis = u32;

pub const MILLIS_PER_UNIT: u64 = 1000;

/// An amount of a resource, stored as a whole number of milli-units.
///
/// Milli-units are the finest granularity the admission engine accounts in:
/// "1500m" of cpu is 1500 milli-units, "3Gi" of memory is 3 * 2^30 * 1000.
/// The representation is exact; no floating point is involved in accounting.
#[derive(
    Debug,
    Clone,
    Copy,
    Hash,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Default,
    Add,
    AddAssign,
    Sub,
    SubAssign,
    Sum,
)]
pub struct ResourceAmount(u64);

impl ResourceAmount {
    pub const ZERO: ResourceAmount = ResourceAmount(0);

    pub fn new(units: ResourceUnits, millis: ResourceMillis) -> Self {
        assert!((millis as u64) < MILLIS_PER_UNIT);
        ResourceAmount(units * MILLIS_PER_UNIT + millis as u64)
    }

    pub fn units(units: ResourceUnits) -> Self {
        ResourceAmount(units * MILLIS_PER_UNIT)
    }

    pub fn millis(millis: u64) -> Self {
        ResourceAmount(millis)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn whole_units(&self) -> ResourceUnits {
        self.0 / MILLIS_PER_UNIT
    }

    pub fn total_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_sub(self, other: ResourceAmount) -> ResourceAmount {
        ResourceAmount(self.0.saturating_sub(other.0))
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / MILLIS_PER_UNIT as f64
    }
}

impl std::ops::Mul<u32> for ResourceAmount {
    type Output = ResourceAmount;

    fn mul(self, count: u32) -> ResourceAmount {
        ResourceAmount(self.0 * count as u64)
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
#[error("invalid resource quantity: {0:?}")]
pub struct InvalidQuantity(pub String);

const BINARY_SUFFIXES: [(&str, u64); 5] = [
    ("Pi", 1 << 50),
    ("Ti", 1 << 40),
    ("Gi", 1 << 30),
    ("Mi", 1 << 20),
    ("Ki", 1 << 10),
];

const DECIMAL_SUFFIXES: [(&str, u64); 4] = [
    ("T", 1_000_000_000_000),
    ("G", 1_000_000_000),
    ("M", 1_000_000),
    ("k", 1_000),
];

/// Parses the decimal body of a quantity into milli-units.
/// At most three fractional digits are representable.
fn parse_body_millis(body: &str) -> Result<u64, InvalidQuantity> {
    let err = || InvalidQuantity(body.to_string());
    let (units, frac) = match body.split_once('.') {
        Some((units, frac)) => (units, frac),
        None => (body, ""),
    };
    if units.is_empty() && frac.is_empty() {
        return Err(err());
    }
    if frac.len() > 3 {
        return Err(err());
    }
    let units: u64 = if units.is_empty() {
        0
    } else {
        units.parse().map_err(|_| err())?
    };
    let mut millis = 0u64;
    if !frac.is_empty() {
        let frac_value: u64 = frac.parse().map_err(|_| err())?;
        millis = frac_value * 10u64.pow(3 - frac.len() as u32);
    }
    Ok(units * MILLIS_PER_UNIT + millis)
}

impl FromStr for ResourceAmount {
    type Err = InvalidQuantity;

    /// Accepts the quantity forms the engine deals with: plain decimals
    /// ("6", "1.5"), milli-units ("1500m") and binary or decimal SI suffixes
    /// ("3Gi", "500Ki", "2M").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(body) = s.strip_suffix('m') {
            let millis: u64 = body
                .parse()
                .map_err(|_| InvalidQuantity(s.to_string()))?;
            return Ok(ResourceAmount::millis(millis));
        }
        for (suffix, multiplier) in BINARY_SUFFIXES.iter().chain(DECIMAL_SUFFIXES.iter()) {
            if let Some(body) = s.strip_suffix(suffix) {
                let millis = parse_body_millis(body)?;
                let scaled = millis
                    .checked_mul(*multiplier)
                    .ok_or_else(|| InvalidQuantity(s.to_string()))?;
                return Ok(ResourceAmount(scaled));
            }
        }
        parse_body_millis(s)
            .map(ResourceAmount)
            .map_err(|_| InvalidQuantity(s.to_string()))
    }
}

impl std::fmt::Display for ResourceAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.0 % MILLIS_PER_UNIT != 0 {
            return write!(f, "{}m", self.0);
        }
        let units = self.whole_units();
        for (suffix, multiplier) in &BINARY_SUFFIXES {
            if units >= *multiplier && units % *multiplier == 0 {
                return write!(f, "{}{}", units / multiplier, suffix);
            }
        }
        write!(f, "{units}")
    }
}

impl Serialize for ResourceAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
