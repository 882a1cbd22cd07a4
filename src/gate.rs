use crate::config::GateConfig;
use crate::types::ConfidenceScore;
use std::fmt;
use tracing::debug;

/// Stages whose outcome is a confidence judgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatedStage {
    Identification,
    Verification,
}

impl fmt::Display for GatedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identification => f.write_str("identification"),
            Self::Verification => f.write_str("verification"),
        }
    }
}

/// Decision for one scored attempt
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Accept,
    /// Try again, seeding the next attempt with what this one found
    RetryWithFeedback(String),
    Reject(String),
}

/// Threshold policy for identification and verification scores.
///
/// Identification demands the highest bar on the first attempt and loosens
/// only on later attempts; verification is a single check with no retry.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceGate {
    identification: Vec<f64>,
    verification: f64,
}

impl ConfidenceGate {
    pub fn new(config: &GateConfig) -> Self {
        Self {
            identification: config.identification_thresholds.clone(),
            verification: config.verification_threshold,
        }
    }

    /// Number of identification attempts before a reject is final
    pub fn max_identification_attempts(&self) -> u32 {
        self.identification.len() as u32
    }

    /// Threshold the identification score must exceed on `attempt` (1-based)
    pub fn identification_threshold(&self, attempt: u32) -> Option<f64> {
        let idx = attempt.checked_sub(1)? as usize;
        self.identification.get(idx).copied()
    }

    pub fn verification_threshold(&self) -> f64 {
        self.verification
    }

    pub fn evaluate(&self, score: &ConfidenceScore, stage: GatedStage, attempt: u32) -> GateDecision {
        let value = score.value();
        let decision = match stage {
            GatedStage::Identification => {
                let Some(threshold) = self.identification_threshold(attempt) else {
                    return GateDecision::Reject(format!(
                        "attempt {attempt} exceeds the {} allowed identification attempts",
                        self.max_identification_attempts()
                    ));
                };
                if value > threshold {
                    GateDecision::Accept
                } else {
                    let reason = format!(
                        "attempt {attempt}: confidence {value:.2} not above {threshold:.2} ({})",
                        score.reasoning
                    );
                    if attempt < self.max_identification_attempts() {
                        GateDecision::RetryWithFeedback(reason)
                    } else {
                        GateDecision::Reject(reason)
                    }
                }
            }
            GatedStage::Verification => {
                if value >= self.verification {
                    GateDecision::Accept
                } else {
                    GateDecision::Reject(format!(
                        "lyrics verification confidence {value:.2} below {:.2} ({})",
                        self.verification, score.reasoning
                    ))
                }
            }
        };
        debug!(
            stage = %stage,
            attempt = attempt,
            confidence = value,
            decision = ?decision,
            "Confidence gate evaluated"
        );
        decision
    }
}

impl Default for ConfidenceGate {
    fn default() -> Self {
        Self::new(&GateConfig::default())
    }
}
