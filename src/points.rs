//! Earn-rule configuration and the pure points computation.

use serde::{Deserialize, Serialize};

/// Rounding applied when converting a currency amount to points.
///
/// Floor is the only defined policy. Unrecognized policy strings fall back
/// to Floor at parse time instead of erroring, so a config typo degrades to
/// the strictest rounding rather than stalling the earn pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundingPolicy {
    Floor,
}

impl RoundingPolicy {
    /// Lenient parse: anything unrecognized is Floor.
    pub fn parse_or_floor(s: &str) -> Self {
        match s {
            "floor" => RoundingPolicy::Floor,
            _ => RoundingPolicy::Floor,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoundingPolicy::Floor => "floor",
        }
    }
}

/// How a merchant's program converts payments into points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EarnRule {
    /// `rate` points per whole currency unit (100 minor units), applied to
    /// payments of at least `min_subtotal_minor`.
    PointsPerCurrencyUnit {
        rate: f64,
        rounding: RoundingPolicy,
        min_subtotal_minor: i64,
    },
}

/// Result of applying an earn rule to a payment amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarnOutcome {
    pub points: i64,
    pub eligible: bool,
}

impl EarnOutcome {
    const INELIGIBLE: EarnOutcome = EarnOutcome {
        points: 0,
        eligible: false,
    };
}

/// Compute points earned for a payment of `amount_minor` minor currency
/// units under `rule`.
///
/// Amounts below the rule's minimum are ineligible and earn nothing.
pub fn compute_earned(amount_minor: i64, rule: &EarnRule) -> EarnOutcome {
    match rule {
        EarnRule::PointsPerCurrencyUnit {
            rate,
            rounding,
            min_subtotal_minor,
        } => {
            if amount_minor < *min_subtotal_minor {
                return EarnOutcome::INELIGIBLE;
            }
            let units = amount_minor as f64 / 100.0;
            let points = match rounding {
                RoundingPolicy::Floor => (units * rate).floor() as i64,
            };
            EarnOutcome {
                points,
                eligible: true,
            }
        }
    }
}
