//! Confirmed-identity debounce.
//!
//! Keeps the expensive token challenge from re-running on every frame while
//! the same person stays in front of the camera.

use crate::types::Identity;
use crate::verifier::Outcome;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// When the confirmed identity is updated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfirmPolicy {
    /// Confirm as soon as a candidate is admitted, before its token challenge
    /// completes. A failed challenge still blocks that identity until someone
    /// else is admitted.
    #[default]
    AssignBeforeVerify,
    /// Confirm only after an accepted challenge, so a failed candidate is
    /// challenged again on the next frame it appears in.
    OnAccept,
}

impl FromStr for ConfirmPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "assign-before-verify" => Ok(ConfirmPolicy::AssignBeforeVerify),
            "on-accept" => Ok(ConfirmPolicy::OnAccept),
            other => Err(format!(
                "unknown confirm policy {other:?} (expected assign-before-verify or on-accept)"
            )),
        }
    }
}

/// Single-slot confirmed identity, owned by the loop controller.
#[derive(Debug, Clone, Default)]
pub struct SessionDebouncer {
    confirmed: Option<String>,
    policy: ConfirmPolicy,
}

impl SessionDebouncer {
    pub fn new(policy: ConfirmPolicy) -> Self {
        Self {
            confirmed: None,
            policy,
        }
    }

    pub fn policy(&self) -> ConfirmPolicy {
        self.policy
    }

    pub fn confirmed(&self) -> Option<&str> {
        self.confirmed.as_deref()
    }

    /// Whether `candidate` should start a verification session.
    pub fn admit(&self, candidate: &Identity) -> bool {
        match candidate.label() {
            Some(label) => self.confirmed.as_deref() != Some(label),
            None => false,
        }
    }

    /// Called when a candidate has been admitted, before verification.
    pub fn on_admitted(&mut self, label: &str) {
        if self.policy == ConfirmPolicy::AssignBeforeVerify {
            self.confirm(label);
        }
    }

    /// Called with the terminal outcome of the candidate's session.
    pub fn on_outcome(&mut self, label: &str, outcome: &Outcome) {
        if self.policy == ConfirmPolicy::OnAccept && outcome.is_accepted() {
            self.confirm(label);
        }
    }

    fn confirm(&mut self, label: &str) {
        tracing::debug!(label, previous = ?self.confirmed, "confirmed identity updated");
        self.confirmed = Some(label.to_string());
    }
}
