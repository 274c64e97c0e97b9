//! Lane weights and the weighted round-robin lane scheduler

use std::fmt;
use std::str::FromStr;

use crate::envelope::Lane;
use crate::error::{QueueError, QueueResult};

/// Relative dispatch weights for the three lanes
///
/// Every lane carries a positive weight so none can starve under load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneWeights {
    weights: [u32; 3],
}

impl LaneWeights {
    pub fn new(default: u32, critical: u32, low: u32) -> QueueResult<Self> {
        let weights = [default, critical, low];
        if let Some(lane) = Lane::ALL.into_iter().find(|lane| weights[lane.index()] == 0) {
            return Err(QueueError::Configuration(format!(
                "lane {} needs a weight of at least 1",
                lane
            )));
        }
        Ok(Self { weights })
    }

    pub fn weight(&self, lane: Lane) -> u32 {
        self.weights[lane.index()]
    }

    pub fn total(&self) -> u32 {
        self.weights.iter().sum()
    }
}

impl Default for LaneWeights {
    fn default() -> Self {
        Self { weights: [6, 3, 1] }
    }
}

/// Parses `default=6,critical=3,low=1`. Every lane must be listed once.
impl FromStr for LaneWeights {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut weights: [Option<u32>; 3] = [None; 3];
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                QueueError::Configuration(format!("expected lane=weight, got '{}'", pair))
            })?;
            let lane: Lane = name.parse()?;
            let weight = value.trim().parse().map_err(|_| {
                QueueError::Configuration(format!("invalid weight for lane {}: '{}'", lane, value))
            })?;
            if weights[lane.index()].replace(weight).is_some() {
                return Err(QueueError::Configuration(format!(
                    "lane {} listed more than once",
                    lane
                )));
            }
        }

        let weight_of = |lane: Lane| {
            weights[lane.index()].ok_or_else(|| {
                QueueError::Configuration(format!("missing weight for lane {}", lane))
            })
        };
        Self::new(
            weight_of(Lane::Default)?,
            weight_of(Lane::Critical)?,
            weight_of(Lane::Low)?,
        )
    }
}

impl fmt::Display for LaneWeights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = Lane::ALL
            .iter()
            .map(|lane| format!("{}={}", lane, self.weight(*lane)))
            .collect();
        f.write_str(&parts.join(","))
    }
}

/// Smooth weighted round-robin over lanes
///
/// Over any window of `total()` picks each lane is chosen exactly `weight`
/// times, interleaved rather than in bursts.
#[derive(Debug, Clone)]
pub struct LaneScheduler {
    weights: LaneWeights,
    current: [i64; 3],
    fallback: [Lane; 3],
}

impl LaneScheduler {
    pub fn new(weights: LaneWeights) -> Self {
        let mut fallback = Lane::ALL;
        // stable sort keeps declaration order among equal weights
        fallback.sort_by_key(|lane| std::cmp::Reverse(weights.weight(*lane)));
        Self {
            weights,
            current: [0; 3],
            fallback,
        }
    }

    pub fn weights(&self) -> LaneWeights {
        self.weights
    }

    pub fn next_lane(&mut self) -> Lane {
        let total = i64::from(self.weights.total());
        let mut best: Option<Lane> = None;

        for lane in Lane::ALL {
            self.current[lane.index()] += i64::from(self.weights.weight(lane));
            match best {
                Some(b) if self.current[b.index()] >= self.current[lane.index()] => {}
                _ => best = Some(lane),
            }
        }

        // every lane has a positive weight, so one is always chosen
        let chosen = best.unwrap_or(Lane::Default);
        self.current[chosen.index()] -= total;
        chosen
    }

    /// Lanes to try for the next claim: the scheduled lane first, then the
    /// others by descending weight so an empty lane never idles a worker.
    pub fn next_order(&mut self) -> [Lane; 3] {
        let first = self.next_lane();
        let mut order = [first; 3];
        let mut slot = 1;
        for lane in self.fallback {
            if lane != first {
                order[slot] = lane;
                slot += 1;
            }
        }
        order
    }
}
