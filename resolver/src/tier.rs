use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// One strategy level of the fallback chain, from most to least complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Candidate files restricted through the entity and date indexes.
    Indexed,
    /// Unindexed scan of every BASE file plus covering OVERRIDE files.
    Optimized,
    /// OVERRIDE files only, short per-file timeout.
    Simple,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Indexed => "indexed",
            Tier::Optimized => "optimized",
            Tier::Simple => "simple",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time budgets for one tier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TierPlan {
    pub tier: Tier,
    /// Whole-tier deadline; `None` means the tier waits on per-file timeouts only.
    pub overall_budget: Option<Duration>,
    /// Sub-batch size; `None` dispatches every (file, day) task at once.
    pub batch_size: Option<usize>,
    pub batch_timeout: Option<Duration>,
    pub file_timeout: Duration,
}

impl TierPlan {
    pub fn indexed() -> Self {
        Self {
            tier: Tier::Indexed,
            overall_budget: Some(Duration::from_secs(30)),
            batch_size: Some(10),
            batch_timeout: Some(Duration::from_secs(20)),
            file_timeout: Duration::from_secs(15),
        }
    }

    pub fn optimized() -> Self {
        Self {
            tier: Tier::Optimized,
            overall_budget: None,
            batch_size: None,
            batch_timeout: None,
            file_timeout: Duration::from_secs(15),
        }
    }

    pub fn simple() -> Self {
        Self {
            tier: Tier::Simple,
            overall_budget: None,
            batch_size: None,
            batch_timeout: None,
            file_timeout: Duration::from_secs(2),
        }
    }

    pub fn default_chain() -> Vec<TierPlan> {
        vec![Self::indexed(), Self::optimized(), Self::simple()]
    }
}
