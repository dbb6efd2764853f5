//! Terminal risk management arithmetic, ref. EMV Book 3, 10.6

use crate::config::ConfigError;
use log::{debug, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Approved offline transaction kept by the terminal for floor limit checking.
#[derive(Serialize, Deserialize, Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct OfflineTransaction {
    /// PAN digits.
    pub pan: String,
    /// Amount in the minor unit of the transaction currency.
    pub amount: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct OfflineLog {
    #[serde(default)]
    pub transactions: Vec<OfflineTransaction>,
}

impl OfflineLog {
    pub fn from_yaml(yaml: &str) -> Result<OfflineLog, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(file: &str) -> Result<OfflineLog, ConfigError> {
        OfflineLog::from_yaml(&fs::read_to_string(file)?)
    }

    /// Sum of the logged amounts for `pan` (digits).
    pub fn total_for(&self, pan: &str) -> u64 {
        self.transactions
            .iter()
            .filter(|t| t.pan == pan)
            .fold(0u64, |total, t| total.saturating_add(t.amount))
    }
}

/// Parameters for random transaction selection, ref. EMV Book 3, 10.6.2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomSelection {
    pub threshold: u64,
    pub target_percentage: u8,
    pub max_target_percentage: u8,
}

impl RandomSelection {
    /// Target percentage for `amount`. Below the threshold the base target
    /// applies, from the threshold up to the floor limit it rises linearly
    /// towards the maximum.
    pub fn target_for(&self, amount: u64, floor_limit: u64) -> u64 {
        let target = self.target_percentage as u64;
        let max_target = (self.max_target_percentage as u64).max(target);

        if amount < self.threshold {
            return target;
        }
        if floor_limit <= self.threshold {
            return max_target;
        }

        let range = (floor_limit - self.threshold) as u128;
        let over_threshold = ((amount - self.threshold) as u128).min(range);
        target + ((max_target - target) as u128 * over_threshold / range) as u64
    }

    /// Whether a transaction below the floor limit goes online. `draw` is a
    /// percentage in 1..=99, equal to the target selects.
    pub fn is_selected(&self, amount: u64, floor_limit: u64, draw: u8) -> bool {
        let target = self.target_for(amount, floor_limit);
        let selected = draw as u64 <= target;

        debug!(
            "Random transaction selection: amount:{}, threshold:{}, target:{}%, draw:{}, selected:{}",
            amount, self.threshold, target, draw, selected
        );

        selected
    }
}

pub fn draw_percentage<R: Rng>(rng: &mut R) -> u8 {
    rng.gen_range(1..=99)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Velocity {
    pub lower_limit_exceeded: bool,
    pub upper_limit_exceeded: bool,
    pub new_card: bool,
}

/// Consecutive offline transaction counts against the card's limits,
/// ref. EMV Book 3, 10.6.3
///
/// An ATC not ahead of the last online ATC exceeds both limits.
pub fn check_velocity(atc: u16, last_online_atc: u16, lower_limit: u8, upper_limit: u8) -> Velocity {
    if atc <= last_online_atc {
        debug!("ATC:{} not above last online ATC:{}", atc, last_online_atc);
        return Velocity {
            lower_limit_exceeded: true,
            upper_limit_exceeded: true,
            new_card: last_online_atc == 0,
        };
    }

    let offline_count = atc - last_online_atc;
    trace!(
        "ATC:{}, last online ATC:{}, consecutive offline:{}",
        atc,
        last_online_atc,
        offline_count
    );

    Velocity {
        lower_limit_exceeded: offline_count > lower_limit as u16,
        upper_limit_exceeded: offline_count > upper_limit as u16,
        new_card: last_online_atc == 0,
    }
}
