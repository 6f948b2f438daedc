use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fitswap_core::{ConversionId, DomainError, DomainResult, ImageId, UserId};

/// Error message stamped on a record cancelled by its owner.
pub const CANCELLED_MESSAGE: &str = "cancelled by user";

const MAX_STYLE_LEN: usize = 64;

/// Conversion status lifecycle.
///
/// `pending → processing → {completed, failed}`, plus `pending → failed` for
/// cancellation. `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ConversionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConversionStatus::Completed | ConversionStatus::Failed)
    }

    /// Position in the lifecycle; a legal transition never lowers it.
    pub fn rank(self) -> u8 {
        match self {
            ConversionStatus::Pending => 0,
            ConversionStatus::Processing => 1,
            ConversionStatus::Completed | ConversionStatus::Failed => 2,
        }
    }

    pub fn can_transition_to(self, next: ConversionStatus) -> bool {
        use ConversionStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConversionStatus::Pending => "pending",
            ConversionStatus::Processing => "processing",
            ConversionStatus::Completed => "completed",
            ConversionStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ConversionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(ConversionStatus::Pending),
            "processing" => Ok(ConversionStatus::Processing),
            "completed" => Ok(ConversionStatus::Completed),
            "failed" => Ok(ConversionStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown conversion status '{other}'"
            ))),
        }
    }
}

/// A requested status change that the lifecycle graph does not allow.
///
/// This is a programming error (e.g. `completed → processing`), never a user error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("illegal transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: ConversionStatus,
    pub to: ConversionStatus,
}

impl From<IllegalTransition> for DomainError {
    fn from(value: IllegalTransition) -> Self {
        DomainError::invariant(value.to_string())
    }
}

/// Input for creating a conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConversion {
    pub user_id: UserId,
    pub source_image_id: ImageId,
    pub target_image_id: ImageId,
    pub style: Option<String>,
}

impl NewConversion {
    pub fn new(
        user_id: UserId,
        source_image_id: ImageId,
        target_image_id: ImageId,
        style: Option<String>,
    ) -> Self {
        Self {
            user_id,
            source_image_id,
            target_image_id,
            style,
        }
    }

    /// Validate request shape: distinct images and a sane style label.
    pub fn validate(&self) -> DomainResult<()> {
        if self.source_image_id == self.target_image_id {
            return Err(DomainError::validation(
                "source and target image must be different",
            ));
        }
        if let Some(style) = &self.style {
            validate_style(style)?;
        }
        Ok(())
    }
}

fn validate_style(style: &str) -> DomainResult<()> {
    if style.trim().is_empty() {
        return Err(DomainError::validation("style must not be blank"));
    }
    if style.chars().count() > MAX_STYLE_LEN {
        return Err(DomainError::validation(format!(
            "style must be at most {MAX_STYLE_LEN} characters"
        )));
    }
    Ok(())
}

/// A requested lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "to", rename_all = "snake_case")]
pub enum ConversionTransition {
    StartProcessing,
    Complete {
        result_image_id: ImageId,
        processing_time_ms: u64,
    },
    /// Processing failed; only legal from `processing`.
    Fail {
        error_message: String,
    },
    /// Owner cancellation; the only way out of `pending` into `failed`.
    Cancel,
}

impl ConversionTransition {
    pub fn cancel() -> Self {
        Self::Cancel
    }

    pub fn target_status(&self) -> ConversionStatus {
        match self {
            ConversionTransition::StartProcessing => ConversionStatus::Processing,
            ConversionTransition::Complete { .. } => ConversionStatus::Completed,
            ConversionTransition::Fail { .. } | ConversionTransition::Cancel => {
                ConversionStatus::Failed
            }
        }
    }

    /// Narrows the status graph per step: both `Fail` and `Cancel` land in
    /// `failed` but from different sources.
    pub fn allowed_from(&self, from: ConversionStatus) -> bool {
        match self {
            ConversionTransition::Fail { .. } => from == ConversionStatus::Processing,
            ConversionTransition::Cancel => from == ConversionStatus::Pending,
            _ => from.can_transition_to(self.target_status()),
        }
    }
}

/// Partial update of a stored record.
///
/// `expected_status` is a guard: the store applies the patch only while the
/// stored status still equals it, which serialises concurrent writers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionUpdate {
    pub expected_status: ConversionStatus,
    pub status: Option<ConversionStatus>,
    /// `Some(None)` clears the style label.
    pub style: Option<Option<String>>,
    pub result_image_id: Option<ImageId>,
    pub error_message: Option<String>,
    pub processing_time_ms: Option<u64>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ConversionUpdate {
    /// Metadata-only edit of the style label, allowed while `pending`.
    pub fn restyle(style: Option<String>, now: DateTime<Utc>) -> DomainResult<Self> {
        if let Some(s) = &style {
            validate_style(s)?;
        }
        Ok(Self {
            expected_status: ConversionStatus::Pending,
            status: None,
            style: Some(style),
            result_image_id: None,
            error_message: None,
            processing_time_ms: None,
            completed_at: None,
            updated_at: now,
        })
    }

    fn status_change(from: ConversionStatus, to: ConversionStatus, now: DateTime<Utc>) -> Self {
        Self {
            expected_status: from,
            status: Some(to),
            style: None,
            result_image_id: None,
            error_message: None,
            processing_time_ms: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

/// The central entity: one compositing job and its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionRecord {
    pub id: ConversionId,
    pub user_id: UserId,
    pub source_image_id: ImageId,
    pub target_image_id: ImageId,
    pub style: Option<String>,
    pub status: ConversionStatus,
    pub result_image_id: Option<ImageId>,
    pub error_message: Option<String>,
    pub processing_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ConversionRecord {
    /// Create a fresh `pending` record.
    pub fn new(id: ConversionId, new: NewConversion, now: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id: new.user_id,
            source_image_id: new.source_image_id,
            target_image_id: new.target_image_id,
            style: new.style,
            status: ConversionStatus::Pending,
            result_image_id: None,
            error_message: None,
            processing_time_ms: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_owned_by(&self, user_id: UserId) -> bool {
        self.user_id == user_id
    }

    /// Decide the patch for `transition` against the current state.
    ///
    /// Only the fields relevant to the target status are set; `completed_at`
    /// is stamped on entry to a terminal state.
    pub fn plan_transition(
        &self,
        transition: &ConversionTransition,
        now: DateTime<Utc>,
    ) -> Result<ConversionUpdate, IllegalTransition> {
        let to = transition.target_status();
        if !self.status.can_transition_to(to) || !transition.allowed_from(self.status) {
            return Err(IllegalTransition {
                from: self.status,
                to,
            });
        }

        let mut update = ConversionUpdate::status_change(self.status, to, now);
        match transition {
            ConversionTransition::StartProcessing => {}
            ConversionTransition::Complete {
                result_image_id,
                processing_time_ms,
            } => {
                update.result_image_id = Some(*result_image_id);
                update.processing_time_ms = Some(*processing_time_ms);
                update.completed_at = Some(now);
            }
            ConversionTransition::Fail { error_message } => {
                let message = if error_message.trim().is_empty() {
                    "unknown error".to_string()
                } else {
                    error_message.clone()
                };
                update.error_message = Some(message);
                update.completed_at = Some(now);
            }
            ConversionTransition::Cancel => {
                update.error_message = Some(CANCELLED_MESSAGE.to_string());
                update.completed_at = Some(now);
            }
        }
        Ok(update)
    }

    /// Apply a patch produced by [`plan_transition`](Self::plan_transition) or
    /// [`ConversionUpdate::restyle`]. The caller has already checked the guard.
    pub fn apply_update(&mut self, update: &ConversionUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(style) = &update.style {
            self.style = style.clone();
        }
        if let Some(result) = update.result_image_id {
            self.result_image_id = Some(result);
        }
        if let Some(message) = &update.error_message {
            self.error_message = Some(message.clone());
        }
        if let Some(ms) = update.processing_time_ms {
            self.processing_time_ms = Some(ms);
        }
        if let Some(at) = update.completed_at {
            self.completed_at = Some(at);
        }
        self.updated_at = update.updated_at;
    }

    /// Check the record-level invariants.
    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.source_image_id == self.target_image_id {
            return Err(DomainError::invariant("source image equals target image"));
        }
        if self.result_image_id.is_some() != (self.status == ConversionStatus::Completed) {
            return Err(DomainError::invariant(format!(
                "result_image_id presence does not match status {}",
                self.status
            )));
        }
        if self.error_message.is_some() != (self.status == ConversionStatus::Failed) {
            return Err(DomainError::invariant(format!(
                "error_message presence does not match status {}",
                self.status
            )));
        }
        if self.completed_at.is_some() != self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "completed_at presence does not match status {}",
                self.status
            )));
        }
        Ok(())
    }

    pub fn status_view(&self) -> ConversionStatusView {
        ConversionStatusView {
            id: self.id,
            status: self.status,
            result_image_id: self.result_image_id,
            error_message: self.error_message.clone(),
            processing_time_ms: self.processing_time_ms,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        }
    }
}

/// Lightweight status projection for polling clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionStatusView {
    pub id: ConversionId,
    pub status: ConversionStatus,
    pub result_image_id: Option<ImageId>,
    pub error_message: Option<String>,
    pub processing_time_ms: Option<u64>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
