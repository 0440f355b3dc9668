use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use cineweave_core::DomainError;

/// Subscription tier of a user.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    #[default]
    Starter,
    Creator,
    Studio,
}

impl PlanTier {
    pub const ALL: [PlanTier; 3] = [PlanTier::Starter, PlanTier::Creator, PlanTier::Studio];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Starter => "starter",
            PlanTier::Creator => "creator",
            PlanTier::Studio => "studio",
        }
    }

    /// Catalog details for this tier.
    pub fn details(&self) -> Plan {
        match self {
            PlanTier::Starter => Plan {
                tier: *self,
                name: "Starter",
                monthly_credits: 80,
                price_cents: 1000,
                features: &[
                    "80 credits/month",
                    "~6-7 minutes of video",
                    "720p @ 24fps",
                    "24-hour video access",
                    "Email support",
                ],
            },
            PlanTier::Creator => Plan {
                tier: *self,
                name: "Creator",
                monthly_credits: 250,
                price_cents: 3100,
                features: &[
                    "250 credits/month",
                    "~20 minutes of video",
                    "720p @ 24fps",
                    "24-hour video access",
                    "Priority queue",
                    "Email support",
                ],
            },
            PlanTier::Studio => Plan {
                tier: *self,
                name: "Studio",
                monthly_credits: 500,
                price_cents: 6000,
                features: &[
                    "500 credits/month",
                    "~40 minutes of video",
                    "720p @ 24fps",
                    "24-hour video access",
                    "Priority queue",
                    "Dedicated support",
                ],
            },
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starter" => Ok(PlanTier::Starter),
            "creator" => Ok(PlanTier::Creator),
            "studio" => Ok(PlanTier::Studio),
            other => Err(DomainError::validation(format!("unknown plan: {other}"))),
        }
    }
}

/// Static description of a plan tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub tier: PlanTier,
    pub name: &'static str,
    pub monthly_credits: i64,
    pub price_cents: i64,
    pub features: &'static [&'static str],
}

/// All plans, cheapest first.
pub fn plan_catalog() -> Vec<Plan> {
    PlanTier::ALL.iter().map(PlanTier::details).collect()
}
