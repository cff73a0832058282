//! Signing thresholds
//!
//! Serialized the way KERI events carry `kt`: a hex string for a simple count,
//! a list of fractions for a weighted threshold, and a list of such lists for a
//! multi-clause weighted threshold.

use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{codec::IndexedSignature, error::KelError};

/// A non-negative rational weight such as `1/2` or `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Weight {
    numerator: u64,
    denominator: u64,
}

impl Weight {
    pub fn new(numerator: u64, denominator: u64) -> Result<Self, KelError> {
        if denominator == 0 {
            return Err(KelError::InvalidThreshold(
                "weight denominator is zero".to_string(),
            ));
        }
        if numerator > denominator {
            return Err(KelError::InvalidThreshold(format!(
                "weight {}/{} exceeds one",
                numerator, denominator
            )));
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.denominator == 1 {
            write!(f, "{}", self.numerator)
        } else {
            write!(f, "{}/{}", self.numerator, self.denominator)
        }
    }
}

impl FromStr for Weight {
    type Err = KelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map_err(|_| KelError::InvalidThreshold(format!("invalid weight: {}", s)))
        };
        match s.split_once('/') {
            Some((numerator, denominator)) => Self::new(parse(numerator)?, parse(denominator)?),
            None => Self::new(parse(s)?, 1),
        }
    }
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Exact sum of the weights at `indices`. Indices past the end of `weights` count
/// for nothing. Returns `None` on arithmetic overflow.
fn weight_reaches_one(weights: &[Weight], indices: &BTreeSet<u32>) -> Option<bool> {
    let (mut numerator, mut denominator) = (0u128, 1u128);
    for index in indices {
        let Some(weight) = weights.get(*index as usize) else {
            continue;
        };
        let (n, d) = (weight.numerator as u128, weight.denominator as u128);
        numerator = numerator
            .checked_mul(d)?
            .checked_add(n.checked_mul(denominator)?)?;
        denominator = denominator.checked_mul(d)?;
        let divisor = gcd(numerator, denominator).max(1);
        numerator /= divisor;
        denominator /= divisor;
    }
    Some(numerator >= denominator)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ThresholdRepr", into = "ThresholdRepr")]
pub enum Threshold {
    Simple(u64),
    Weighted(Vec<Weight>),
    MultiWeighted(Vec<Vec<Weight>>),
}

impl Default for Threshold {
    fn default() -> Self {
        Self::Simple(1)
    }
}

impl Threshold {
    /// Whether the distinct key indices of `signatures` authorize an event.
    pub fn satisfied(&self, signatures: &[IndexedSignature]) -> bool {
        let indices: BTreeSet<u32> = signatures.iter().map(|s| s.index).collect();
        match self {
            Self::Simple(count) => indices.len() as u64 >= *count,
            Self::Weighted(weights) => weight_reaches_one(weights, &indices).unwrap_or(false),
            Self::MultiWeighted(clauses) => clauses
                .iter()
                .all(|weights| weight_reaches_one(weights, &indices).unwrap_or(false)),
        }
    }

    /// Checks that the threshold is attainable by `key_count` keys.
    pub fn validate(&self, key_count: usize) -> Result<(), KelError> {
        let all: BTreeSet<u32> = (0..key_count as u32).collect();
        let check_clause = |weights: &[Weight]| {
            if weights.len() > key_count {
                return Err(KelError::InvalidThreshold(format!(
                    "{} weights for {} keys",
                    weights.len(),
                    key_count
                )));
            }
            if weight_reaches_one(weights, &all) != Some(true) {
                return Err(KelError::InvalidThreshold(
                    "weights can never reach one".to_string(),
                ));
            }
            Ok(())
        };
        match self {
            Self::Simple(0) => Err(KelError::InvalidThreshold(
                "threshold must be at least one".to_string(),
            )),
            Self::Simple(count) if *count as usize > key_count => {
                Err(KelError::InvalidThreshold(format!(
                    "threshold {} exceeds {} keys",
                    count, key_count
                )))
            }
            Self::Simple(_) => Ok(()),
            Self::Weighted(weights) => check_clause(weights),
            Self::MultiWeighted(clauses) if clauses.is_empty() => Err(
                KelError::InvalidThreshold("no weighted clauses".to_string()),
            ),
            Self::MultiWeighted(clauses) => clauses.iter().try_for_each(|c| check_clause(c)),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ThresholdRepr {
    Simple(String),
    Weighted(Vec<String>),
    MultiWeighted(Vec<Vec<String>>),
}

impl TryFrom<ThresholdRepr> for Threshold {
    type Error = KelError;

    fn try_from(repr: ThresholdRepr) -> Result<Self, Self::Error> {
        let weights = |list: Vec<String>| {
            list.iter()
                .map(|w| w.parse::<Weight>())
                .collect::<Result<Vec<_>, _>>()
        };
        match repr {
            ThresholdRepr::Simple(hex) => u64::from_str_radix(&hex, 16)
                .map(Self::Simple)
                .map_err(|_| KelError::InvalidThreshold(format!("invalid hex threshold: {}", hex))),
            ThresholdRepr::Weighted(list) => Ok(Self::Weighted(weights(list)?)),
            ThresholdRepr::MultiWeighted(clauses) => Ok(Self::MultiWeighted(
                clauses.into_iter().map(weights).collect::<Result<_, _>>()?,
            )),
        }
    }
}

impl From<Threshold> for ThresholdRepr {
    fn from(threshold: Threshold) -> Self {
        let strings = |weights: Vec<Weight>| weights.iter().map(|w| w.to_string()).collect();
        match threshold {
            Threshold::Simple(count) => ThresholdRepr::Simple(format!("{:x}", count)),
            Threshold::Weighted(weights) => ThresholdRepr::Weighted(strings(weights)),
            Threshold::MultiWeighted(clauses) => {
                ThresholdRepr::MultiWeighted(clauses.into_iter().map(strings).collect())
            }
        }
    }
}
