//! Reward rule engine
//!
//! Pure mapping from a reported event (plus the account's current balance,
//! for debits) to a point delta and its breakdown. No I/O.

use crate::config::RewardConfig;
use crate::error::LedgerError;
use crate::models::{Breakdown, RewardEvent};

/// Breakdown keys
pub const KEY_BASE: &str = "base";
pub const KEY_QUALITY: &str = "quality";
pub const KEY_LARGE_DATASET: &str = "largeDataset";
pub const KEY_FIRST_UPLOAD: &str = "firstUpload";
pub const KEY_WITHDRAWAL: &str = "withdrawal";

/// Computed effect of one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardComputation {
    pub delta: i64,
    pub breakdown: Breakdown,
}

impl RewardComputation {
    fn from_breakdown(breakdown: Breakdown) -> Result<Self, LedgerError> {
        let delta = breakdown
            .total()
            .ok_or_else(|| LedgerError::InvalidInput("reward total overflows".to_string()))?;
        Ok(Self { delta, breakdown })
    }
}

#[derive(Debug, Clone)]
pub struct RewardEngine {
    config: RewardConfig,
}

impl RewardEngine {
    pub fn new(config: RewardConfig) -> Self {
        Self { config }
    }

    pub fn rates(&self) -> &RewardConfig {
        &self.config
    }

    /// Evaluate an event against the account's current materialized balance.
    pub fn evaluate(
        &self,
        event: &RewardEvent,
        balance: i64,
    ) -> Result<RewardComputation, LedgerError> {
        let breakdown = match event {
            RewardEvent::Signup => Breakdown::single(KEY_BASE, self.config.signup_bonus),
            RewardEvent::Upload {
                quality_score,
                row_count,
                is_first_upload,
            } => self.upload_breakdown(*quality_score, *row_count, *is_first_upload)?,
            RewardEvent::Review => Breakdown::single(KEY_BASE, self.config.review_reward),
            RewardEvent::Verification => {
                Breakdown::single(KEY_BASE, self.config.verification_reward)
            }
            RewardEvent::Withdrawal { amount } => {
                if *amount <= 0 {
                    return Err(LedgerError::InvalidInput(format!(
                        "withdrawal amount must be positive, got {}",
                        amount
                    )));
                }
                if *amount > balance {
                    return Err(LedgerError::InsufficientBalance {
                        requested: *amount,
                        available: balance,
                    });
                }
                Breakdown::single(KEY_WITHDRAWAL, -amount)
            }
            RewardEvent::ManualAdjustment { delta, reason } => {
                if reason.trim().is_empty() {
                    return Err(LedgerError::InvalidInput(
                        "manual adjustment requires a reason".to_string(),
                    ));
                }
                let resulting = balance.checked_add(*delta).ok_or_else(|| {
                    LedgerError::InvalidInput("adjustment overflows balance".to_string())
                })?;
                if resulting < 0 {
                    return Err(LedgerError::InsufficientBalance {
                        requested: -delta,
                        available: balance,
                    });
                }
                Breakdown::single(reason.as_str(), *delta)
            }
        };

        RewardComputation::from_breakdown(breakdown)
    }

    fn upload_breakdown(
        &self,
        quality_score: i64,
        row_count: i64,
        is_first_upload: bool,
    ) -> Result<Breakdown, LedgerError> {
        if !(0..=100).contains(&quality_score) {
            return Err(LedgerError::InvalidInput(format!(
                "qualityScore must be within 0-100, got {}",
                quality_score
            )));
        }
        if row_count < 0 {
            return Err(LedgerError::InvalidInput(format!(
                "rowCount must be non-negative, got {}",
                row_count
            )));
        }

        let mut breakdown = Breakdown::single(KEY_BASE, self.config.upload_base);
        if let Some(bonus) = self.quality_bonus(quality_score) {
            breakdown.push(KEY_QUALITY, bonus);
        }
        if row_count >= self.config.large_dataset_rows {
            breakdown.push(KEY_LARGE_DATASET, self.config.large_dataset_bonus);
        }
        if is_first_upload {
            breakdown.push(KEY_FIRST_UPLOAD, self.config.first_upload_bonus);
        }
        Ok(breakdown)
    }

    /// Exactly one tier applies; tiers never stack.
    fn quality_bonus(&self, score: i64) -> Option<i64> {
        let c = &self.config;
        if score >= c.quality_top_threshold {
            Some(c.quality_top)
        } else if score >= c.quality_high_threshold {
            Some(c.quality_high)
        } else if score >= c.quality_mid_threshold {
            Some(c.quality_mid)
        } else {
            None
        }
    }
}

impl Default for RewardEngine {
    fn default() -> Self {
        Self::new(RewardConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(quality_score: i64, row_count: i64, is_first_upload: bool) -> RewardEvent {
        RewardEvent::Upload {
            quality_score,
            row_count,
            is_first_upload,
        }
    }

    #[test]
    fn test_signup_is_flat_bonus() {
        let result = RewardEngine::default().evaluate(&RewardEvent::Signup, 0).unwrap();
        assert_eq!(result.delta, 100);
        assert_eq!(result.breakdown.get(KEY_BASE), Some(100));
    }

    #[test]
    fn test_full_upload_breakdown() {
        let result = RewardEngine::default()
            .evaluate(&upload(92, 1500, true), 100)
            .unwrap();

        assert_eq!(result.delta, 230);
        assert_eq!(
            result.breakdown.keys().collect::<Vec<_>>(),
            vec![KEY_BASE, KEY_QUALITY, KEY_LARGE_DATASET, KEY_FIRST_UPLOAD]
        );
        assert_eq!(result.breakdown.get(KEY_QUALITY), Some(100));
    }

    #[test]
    fn test_quality_tiers_are_exclusive() {
        let engine = RewardEngine::default();

        let top = engine.evaluate(&upload(95, 10, false), 0).unwrap();
        assert_eq!(top.breakdown.get(KEY_QUALITY), Some(100));
        assert_eq!(top.delta, 150);

        let high = engine.evaluate(&upload(89, 10, false), 0).unwrap();
        assert_eq!(high.breakdown.get(KEY_QUALITY), Some(50));

        let mid = engine.evaluate(&upload(70, 10, false), 0).unwrap();
        assert_eq!(mid.breakdown.get(KEY_QUALITY), Some(25));

        let none = engine.evaluate(&upload(69, 10, false), 0).unwrap();
        assert!(!none.breakdown.contains(KEY_QUALITY));
        assert_eq!(none.delta, 50);
    }

    #[test]
    fn test_large_dataset_threshold_is_inclusive() {
        let engine = RewardEngine::default();
        let at = engine.evaluate(&upload(0, 1000, false), 0).unwrap();
        assert_eq!(at.breakdown.get(KEY_LARGE_DATASET), Some(30));

        let below = engine.evaluate(&upload(0, 999, false), 0).unwrap();
        assert!(!below.breakdown.contains(KEY_LARGE_DATASET));
    }

    #[test]
    fn test_upload_inputs_out_of_domain() {
        let engine = RewardEngine::default();
        for event in [upload(101, 10, false), upload(-1, 10, false), upload(50, -5, false)] {
            assert!(matches!(
                engine.evaluate(&event, 0),
                Err(LedgerError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn test_withdrawal_debits_and_checks_balance() {
        let engine = RewardEngine::default();

        let ok = engine
            .evaluate(&RewardEvent::Withdrawal { amount: 200 }, 500)
            .unwrap();
        assert_eq!(ok.delta, -200);
        assert_eq!(ok.breakdown.get(KEY_WITHDRAWAL), Some(-200));

        assert_eq!(
            engine.evaluate(&RewardEvent::Withdrawal { amount: 400 }, 330),
            Err(LedgerError::InsufficientBalance {
                requested: 400,
                available: 330
            })
        );
        assert!(matches!(
            engine.evaluate(&RewardEvent::Withdrawal { amount: 0 }, 330),
            Err(LedgerError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_manual_adjustment_records_reason_verbatim() {
        let engine = RewardEngine::default();
        let result = engine
            .evaluate(
                &RewardEvent::ManualAdjustment {
                    delta: -30,
                    reason: "duplicate upload correction".to_string(),
                },
                100,
            )
            .unwrap();
        assert_eq!(result.delta, -30);
        assert_eq!(result.breakdown.get("duplicate upload correction"), Some(-30));

        assert!(matches!(
            engine.evaluate(
                &RewardEvent::ManualAdjustment {
                    delta: -300,
                    reason: "too much".to_string()
                },
                100
            ),
            Err(LedgerError::InsufficientBalance { .. })
        ));
        assert!(matches!(
            engine.evaluate(
                &RewardEvent::ManualAdjustment {
                    delta: 10,
                    reason: "   ".to_string()
                },
                0
            ),
            Err(LedgerError::InvalidInput(_))
        ));
    }
}
