//! Submission controller
//!
//! Orchestrates one marking round trip:
//! `Idle → Validating → (Gated | Submitting) → (Succeeded | Failed)`.
//!
//! - Both document roles must be populated before the gate is consulted
//! - A denied gate issues no remote call
//! - At most one submission is in flight; re-entrant calls are ignored
//! - Success starts a ledger resync before the phase becomes terminal

use crate::document::{Document, DocumentRole, ExampleAssets};
use crate::error::{ExaminerError, Notice, Result, ValidationError};
use crate::ledger::{EntitlementLedger, EntitlementState};
use crate::remote::{ExaminerApi, MarkingResult, MarkingSubmission};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubmissionPhase {
    /// Waiting for input
    #[default]
    Idle,
    /// Checking documents and allowance
    Validating,
    /// Blocked by the entitlement gate
    Gated,
    /// Marking call in flight
    Submitting,
    /// Result available
    Succeeded,
    /// Marking call failed; retryable
    Failed,
}

impl SubmissionPhase {
    /// Check if the phase ends a submission attempt
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Gated | Self::Succeeded | Self::Failed)
    }
}

/// Result of a `submit()` call that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Another submission was in flight; nothing was done
    Ignored,
    /// Marking succeeded
    Marked(MarkingResult),
}

/// Presentation view of the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionSnapshot {
    /// Current phase
    pub phase: SubmissionPhase,
    /// Last marking result
    pub result: Option<MarkingResult>,
    /// Notice raised by the last attempt
    pub notice: Option<Notice>,
    /// Name of the selected paper
    pub primary: Option<String>,
    /// Name of the selected mark scheme
    pub reference: Option<String>,
    /// Remaining allowance, if known
    pub remaining: Option<u32>,
    /// Whether a submission would currently be attempted
    pub can_submit: bool,
}

#[derive(Debug, Default)]
struct ControllerState {
    phase: SubmissionPhase,
    primary: Option<Document>,
    reference: Option<Document>,
    result: Option<MarkingResult>,
    notice: Option<Notice>,
    resync: Option<JoinHandle<EntitlementState>>,
}

impl ControllerState {
    fn slot(&mut self, role: DocumentRole) -> &mut Option<Document> {
        match role {
            DocumentRole::Primary => &mut self.primary,
            DocumentRole::Reference => &mut self.reference,
        }
    }

    fn missing_role(&self) -> Option<DocumentRole> {
        if self.primary.is_none() {
            Some(DocumentRole::Primary)
        } else if self.reference.is_none() {
            Some(DocumentRole::Reference)
        } else {
            None
        }
    }
}

/// Drives document validation, gating and the marking call
pub struct SubmissionController {
    ledger: Arc<EntitlementLedger>,
    api: Arc<dyn ExaminerApi>,
    examples: Option<ExampleAssets>,
    state: Mutex<ControllerState>,
    phase: watch::Sender<SubmissionPhase>,
}

impl std::fmt::Debug for SubmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionController")
            .field("phase", &self.phase())
            .field("examples", &self.examples.is_some())
            .finish_non_exhaustive()
    }
}

impl SubmissionController {
    /// Create controller
    #[must_use]
    pub fn new(ledger: Arc<EntitlementLedger>, api: Arc<dyn ExaminerApi>) -> Self {
        let (phase, _) = watch::channel(SubmissionPhase::Idle);
        Self {
            ledger,
            api,
            examples: None,
            state: Mutex::new(ControllerState::default()),
            phase,
        }
    }

    /// Enable `load_example`
    #[inline]
    #[must_use]
    pub fn with_examples(mut self, examples: ExampleAssets) -> Self {
        self.examples = Some(examples);
        self
    }

    /// Current phase
    #[inline]
    #[must_use]
    pub fn phase(&self) -> SubmissionPhase {
        *self.phase.borrow()
    }

    /// Watch phase changes
    #[inline]
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SubmissionPhase> {
        self.phase.subscribe()
    }

    /// Ledger this controller gates against
    #[inline]
    #[must_use]
    pub fn ledger(&self) -> &Arc<EntitlementLedger> {
        &self.ledger
    }

    /// Presentation snapshot
    #[must_use]
    pub fn snapshot(&self) -> SubmissionSnapshot {
        let state = self.state.lock();
        let ready = state.missing_role().is_none() && state.phase != SubmissionPhase::Submitting;
        SubmissionSnapshot {
            phase: state.phase,
            result: state.result.clone(),
            notice: state.notice.clone(),
            primary: state.primary.as_ref().map(|d| d.name().to_string()),
            reference: state.reference.as_ref().map(|d| d.name().to_string()),
            remaining: self.ledger.remaining(),
            can_submit: ready && self.ledger.would_allow().is_allow(),
        }
    }

    /// Select a document for a role, replacing any previous one
    pub fn select(&self, role: DocumentRole, document: Document) {
        tracing::debug!(role = %role, document = document.name(), "Document selected");
        let mut state = self.state.lock();
        *state.slot(role) = Some(document);
    }

    /// Load the bundled example for a role and select it
    ///
    /// # Errors
    /// - `ExaminerError::Config` if no example assets are configured
    /// - `ExaminerError::Network`/`Storage` if the asset cannot be loaded
    pub async fn load_example(&self, role: DocumentRole) -> Result<Document> {
        let examples = self
            .examples
            .as_ref()
            .ok_or_else(|| ExaminerError::Config("example assets not configured".to_string()))?;
        let document = examples.load(role).await?;
        self.select(role, document.clone());
        Ok(document)
    }

    /// Deselect a role
    pub fn clear(&self, role: DocumentRole) {
        self.state.lock().slot(role).take();
    }

    /// Selected document for a role
    #[must_use]
    pub fn document(&self, role: DocumentRole) -> Option<Document> {
        self.state.lock().slot(role).clone()
    }

    /// Return to `Idle`, dropping documents, result and notice
    ///
    /// Ignored while a submission is in flight.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.phase == SubmissionPhase::Submitting {
            return;
        }
        state.primary = None;
        state.reference = None;
        state.result = None;
        state.notice = None;
        self.set_phase(&mut state, SubmissionPhase::Idle);
    }

    /// Check that both document roles are populated
    ///
    /// # Errors
    /// `ValidationError::MissingDocument` naming the first empty role
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        match self.state.lock().missing_role() {
            Some(role) => Err(ValidationError::MissingDocument(role)),
            None => Ok(()),
        }
    }

    /// Validate, gate and submit the selected documents for marking
    ///
    /// Returns `SubmitOutcome::Ignored` if a submission is already in flight.
    ///
    /// # Errors
    /// - `ExaminerError::Validation` if a document is missing (phase `Idle`)
    /// - `ExaminerError::Gate` if the allowance is exhausted (phase `Gated`)
    /// - any marking failure (phase `Failed`, documents kept for retry)
    pub async fn submit(&self) -> Result<SubmitOutcome> {
        let (primary, reference) = {
            let mut state = self.state.lock();
            if state.phase == SubmissionPhase::Submitting {
                tracing::debug!("Submission already in flight, ignoring");
                return Ok(SubmitOutcome::Ignored);
            }
            self.set_phase(&mut state, SubmissionPhase::Validating);
            state.notice = None;

            let documents = state.primary.clone().zip(state.reference.clone());
            let Some((primary, reference)) = documents else {
                let err = ExaminerError::from(ValidationError::MissingDocument(
                    state.missing_role().unwrap_or(DocumentRole::Primary),
                ));
                state.notice = err.notice();
                self.set_phase(&mut state, SubmissionPhase::Idle);
                return Err(err);
            };

            if let Err(gate) = self.ledger.admit() {
                let err = ExaminerError::from(gate);
                state.notice = err.notice();
                self.set_phase(&mut state, SubmissionPhase::Gated);
                return Err(err);
            }

            self.set_phase(&mut state, SubmissionPhase::Submitting);
            (primary, reference)
        };

        match self.mark(primary.clone(), reference.clone()).await {
            Ok(result) => {
                let resync = {
                    let ledger = self.ledger.clone();
                    tokio::spawn(async move { ledger.resync().await })
                };

                let mut state = self.state.lock();
                state.result = Some(result.clone());
                state.resync = Some(resync);
                // Release only what was submitted; a newer selection stays.
                if state.primary.as_ref() == Some(&primary) {
                    state.primary = None;
                }
                if state.reference.as_ref() == Some(&reference) {
                    state.reference = None;
                }
                self.set_phase(&mut state, SubmissionPhase::Succeeded);

                tracing::info!(
                    questions = result.questions.len(),
                    total = %result.total,
                    "Marking succeeded"
                );
                Ok(SubmitOutcome::Marked(result))
            }
            Err(e) => {
                tracing::warn!(kind = ?e.kind(), "Marking failed: {}", e);
                let mut state = self.state.lock();
                state.notice = e.notice();
                self.set_phase(&mut state, SubmissionPhase::Failed);
                Err(e)
            }
        }
    }

    /// Wait for the resync started by the last successful submission
    pub async fn settle(&self) -> Option<EntitlementState> {
        let handle = self.state.lock().resync.take()?;
        match handle.await {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!("Resync task failed: {}", e);
                None
            }
        }
    }

    async fn mark(&self, primary: Document, reference: Document) -> Result<MarkingResult> {
        let identity = self.ledger.identity();
        let credential = identity.credential().await?;
        let submission = MarkingSubmission {
            primary,
            reference,
            identity: identity.kind(),
            credential,
        };
        self.api.mark(submission).await
    }

    fn set_phase(&self, state: &mut ControllerState, phase: SubmissionPhase) {
        state.phase = phase;
        self.phase.send_replace(phase);
    }
}
