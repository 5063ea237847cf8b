//! Onboarding Stages
//!
//! The onboarding flow is an ordered list of stages. Each stage carries the
//! instruction the voice agent follows while the student is in it and the
//! hidden criteria the agent checks before calling the promotion tool.

use serde::{Deserialize, Serialize};
use tracing::info;

/// A single step of the onboarding flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: u32,
    pub order_index: u32,
    pub title: String,
    pub system_instruction: String,
    pub validation_criteria: String,
    #[serde(default)]
    pub cta_label: String,
    #[serde(default)]
    pub cta_url: String,
}

impl Stage {
    fn builtin(id: u32, title: &str, instruction: &str, criteria: &str, cta: &str) -> Self {
        Self {
            id,
            order_index: id,
            title: title.to_string(),
            system_instruction: instruction.to_string(),
            validation_criteria: criteria.to_string(),
            cta_label: cta.to_string(),
            cta_url: "#".to_string(),
        }
    }
}

/// The global instruction plus every stage, in flow order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCatalog {
    pub global_instruction: String,
    pub stages: Vec<Stage>,
}

impl StageCatalog {
    /// Builds a catalog, ordering stages by `order_index`.
    pub fn new(global_instruction: String, mut stages: Vec<Stage>) -> Self {
        stages.sort_by_key(|s| s.order_index);
        Self {
            global_instruction,
            stages,
        }
    }

    /// Parses a catalog from JSON. Stages are re-sorted by `order_index`.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let parsed: StageCatalog = serde_json::from_str(json)?;
        Ok(Self::new(parsed.global_instruction, parsed.stages))
    }

    /// The default seven-stage student onboarding flow.
    pub fn builtin() -> Self {
        Self::new(
            "You are an efficient, secure, and friendly AI Onboarding Assistant for NxtWave. \
             Your goal is to guide students through the payment and KYC process quickly while \
             making them feel secure."
                .to_string(),
            vec![
                Stage::builtin(
                    1,
                    "Greeting & Identity",
                    "Verify identity. Warmly welcome the user to NxtWave.",
                    "User confirms name and student ID.",
                    "Verify",
                ),
                Stage::builtin(
                    2,
                    "Need & Program Fit",
                    "Discuss the CCBP 4.0 program benefits. Ensure user understands the career outcome.",
                    "User acknowledges program value.",
                    "View Syllabus",
                ),
                Stage::builtin(
                    3,
                    "Payment Options",
                    "Present Full Payment vs EMI options. Explain the 5% discount for full payment.",
                    "User selects a payment method.",
                    "View Plans",
                ),
                Stage::builtin(
                    4,
                    "NBFC / Loan Offer",
                    "If EMI selected: Collect employment details for loan approval. Explain interest rates.",
                    "User agrees to credit check or selects lender.",
                    "Check Eligibility",
                ),
                Stage::builtin(
                    5,
                    "KYC Verification",
                    "Ask user to upload Aadhaar/PAN. Verify details verbally.",
                    "Documents uploaded and verified.",
                    "Upload Docs",
                ),
                Stage::builtin(
                    6,
                    "Confirmation",
                    "Confirm the final amount and transaction date. Get explicit consent.",
                    "User says 'Yes' to charge.",
                    "Confirm",
                ),
                Stage::builtin(
                    7,
                    "Onboarding Complete",
                    "Congratulations. Provide LMS login details.",
                    "Final farewell.",
                    "Go to LMS",
                ),
            ],
        )
    }
}

/// Outcome of a promotion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// The student moved from stage index `from` to `to`.
    Advanced { from: usize, to: usize },
    /// Already at the last stage; nothing changed.
    AtFinalStage,
}

/// Tracks which stage of a catalog the student is currently in.
#[derive(Debug, Clone)]
pub struct StageTrack {
    catalog: StageCatalog,
    current: usize,
}

impl StageTrack {
    /// Starts at `start`, clamped to the last stage.
    pub fn new(catalog: StageCatalog, start: usize) -> Self {
        let current = start.min(catalog.stages.len().saturating_sub(1));
        Self { catalog, current }
    }

    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    /// The stage the student is in, or `None` for an empty catalog.
    pub fn current(&self) -> Option<&Stage> {
        self.catalog.stages.get(self.current)
    }

    pub fn is_final(&self) -> bool {
        self.current + 1 >= self.catalog.stages.len()
    }

    /// The stage `increment` promotions would reach, or `None` at the final
    /// stage. Leaves the track where it is.
    pub fn promotion_target(&self, increment: u32) -> Option<usize> {
        if self.is_final() || increment == 0 {
            return None;
        }
        let last = self.catalog.stages.len() - 1;
        Some((self.current + increment as usize).min(last))
    }

    /// Advances by `increment` stages, stopping at the last one.
    pub fn promote(&mut self, increment: u32) -> Promotion {
        let Some(to) = self.promotion_target(increment) else {
            return Promotion::AtFinalStage;
        };
        let from = self.current;
        self.current = to;
        info!(from, to, "Student promoted to next stage");
        Promotion::Advanced { from, to }
    }
}
