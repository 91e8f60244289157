//! The run state machine and the fold that derives it from the log.
//!
//! Nothing in the core trusts an in-memory run state across an await point
//! it does not own: the authoritative state of a run is always
//! [`fold`]-of-events, and every cache is advisory. Fold determinism is a
//! tested law — any reader folding the same events gets the same snapshot.

use std::collections::HashSet;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use uuid::Uuid;

use webpilot_protocol::Mode;
use webpilot_protocol::Observation;
use webpilot_protocol::Surface;

use crate::error::CoreErr;
use crate::error::Result;
use crate::events::CheckpointSummary;
use crate::events::Event;
use crate::events::EventPayload;
use crate::events::RunId;
use crate::policy::CrossSiteGrant;
use crate::policy::Decision;
use crate::policy::ReasonCode;
use crate::tools::IdempotencyCategory;

/// States of the run state machine. Every transition is recorded as a
/// `run.state` event before it becomes visible to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Authorizing,
    Observing,
    Planning,
    AwaitingApproval,
    Executing,
    Verifying,
    Paused,
    Takeover,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Cancelled | RunStatus::Failed
        )
    }

    /// Legal transitions. The orchestrator refuses (and logs) anything else;
    /// the fold tolerates whatever is durable, since the log is the truth.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        if self == next {
            return false;
        }
        // Cancellation, takeover, and failure are reachable from any live
        // state.
        if !self.is_terminal() && matches!(next, Cancelled | Failed | Takeover | Paused) {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Authorizing)
                | (Idle, Observing)
                | (Authorizing, Observing)
                | (Observing, Planning)
                | (Planning, AwaitingApproval)
                | (Planning, Executing)
                | (Planning, Observing)
                | (Planning, Completed)
                | (AwaitingApproval, Executing)
                | (AwaitingApproval, Planning)
                | (Executing, Verifying)
                | (Executing, Observing)
                | (Verifying, Observing)
                | (Verifying, Planning)
                | (Verifying, Completed)
                | (Paused, Observing)
                | (Paused, Authorizing)
                | (Takeover, Paused)
                | (Takeover, Observing)
        )
    }
}

/// A tool call that has been handed to the executor but has no recorded
/// result yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InflightTool {
    pub request_id: Uuid,
    pub tool: String,
    pub category: IdempotencyCategory,
}

/// Everything the orchestrator needs to know about a run, derived purely
/// from its events.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub status: RunStatus,
    pub head_seq: u64,
    pub head_event_id: Option<Uuid>,
    pub origin: String,
    pub surface: Surface,
    /// Mode requested at run start.
    pub initial_mode: Mode,
    /// Current mode after any autonomy downgrades.
    pub mode: Mode,
    pub profile_id: String,
    pub goal: String,
    pub last_user_instruction: Option<String>,
    /// Approval id the run is blocked on.
    pub pending_approval: Option<String>,
    pub inflight_tool: Option<InflightTool>,
    pub cross_site_grants: Vec<CrossSiteGrant>,
    /// Scope keys approved for the remainder of the run.
    pub session_approvals: HashSet<String>,
    pub last_reason_code: Option<ReasonCode>,
    /// Set once an observation looked injected; planning over that content
    /// requires explicit confirmation.
    pub injection_flagged: bool,
    pub latest_observation: Option<Observation>,
    pub latest_checkpoint: Option<(u64, CheckpointSummary)>,
    /// Count of tool requests issued so far.
    pub steps_taken: u32,
    /// Seq of the last event covered by a checkpoint, for prune eligibility.
    pub checkpoint_covered_through: Option<u64>,
}

impl RunSnapshot {
    fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            status: RunStatus::Idle,
            head_seq: 0,
            head_event_id: None,
            origin: String::new(),
            surface: Surface::Isolated,
            initial_mode: Mode::ReadOnly,
            mode: Mode::ReadOnly,
            profile_id: String::new(),
            goal: String::new(),
            last_user_instruction: None,
            pending_approval: None,
            inflight_tool: None,
            cross_site_grants: Vec::new(),
            session_approvals: HashSet::new(),
            last_reason_code: None,
            injection_flagged: false,
            latest_observation: None,
            latest_checkpoint: None,
            steps_taken: 0,
            checkpoint_covered_through: None,
        }
    }

    /// Resume-after-restart normalization.
    ///
    /// Capability tokens do not survive a restart and a mutating step that
    /// was `executing` must never be replayed automatically, so every
    /// non-terminal run comes back `paused` and needs a fresh observation
    /// (and re-authorization on connected surfaces) before it moves again.
    pub fn into_resumed(mut self) -> Self {
        if !self.status.is_terminal() && self.status != RunStatus::Idle {
            self.status = RunStatus::Paused;
        }
        // The observation predates the restart; never plan from it.
        self.latest_observation = None;
        self
    }

    /// True when a side-effecting request is pending with no result. Such a
    /// step is reported, never replayed.
    pub fn has_unresolved_side_effect(&self) -> bool {
        self.inflight_tool
            .as_ref()
            .is_some_and(|t| t.category == IdempotencyCategory::SideEffectingOnce)
    }
}

/// Select the events that are live after honoring rollbacks: a
/// `run.rollback` truncates the effective timeline back to its target, and
/// appends continue from there. Skipped events remain in the log but no
/// longer contribute to state.
fn effective_timeline(events: &[Event]) -> Vec<&Event> {
    let mut effective: Vec<&Event> = Vec::with_capacity(events.len());
    for event in events {
        if let Some(EventPayload::RunRollback { target_seq }) = &event.payload {
            effective.retain(|e| e.seq <= *target_seq);
            continue;
        }
        effective.push(event);
    }
    effective
}

/// Fold a run's events into a snapshot. Pure: no clock, no I/O, no
/// randomness.
pub fn fold(run_id: RunId, events: &[Event]) -> Result<RunSnapshot> {
    let mut snap = RunSnapshot::new(run_id);
    let Some(first) = events.first() else {
        return Ok(snap);
    };
    if first.seq != 0 {
        return Err(CoreErr::SchemaViolation(
            "fold requires the full event prefix".to_string(),
        ));
    }

    if let Some(last) = events.last() {
        snap.head_seq = last.seq;
        snap.head_event_id = Some(last.event_id);
    }

    for event in effective_timeline(events) {
        let Some(payload) = &event.payload else {
            // Pruned body: only observations are prunable, and a pruned
            // observation simply stops being the latest one.
            continue;
        };
        apply(&mut snap, event, payload);
    }
    Ok(snap)
}

fn apply(snap: &mut RunSnapshot, event: &Event, payload: &EventPayload) {
    match payload {
        EventPayload::UserMessage {
            text,
            origin,
            surface,
            mode,
            profile_id,
        } => {
            if snap.goal.is_empty() {
                snap.goal = text.clone();
                snap.origin = origin.clone();
                snap.surface = *surface;
                snap.initial_mode = *mode;
                snap.mode = *mode;
                snap.profile_id = profile_id.clone();
            } else {
                snap.last_user_instruction = Some(text.clone());
            }
        }
        EventPayload::UserApproval {
            approval_id,
            for_session,
            scope_key,
        } => {
            if snap.pending_approval.as_deref() == Some(approval_id.as_str()) {
                snap.pending_approval = None;
            }
            if *for_session {
                if let Some(key) = scope_key {
                    snap.session_approvals.insert(key.clone());
                }
            }
        }
        EventPayload::UserDenial { approval_id } => {
            if snap.pending_approval.as_deref() == Some(approval_id.as_str()) {
                snap.pending_approval = None;
            }
        }
        EventPayload::UserCancel { .. } => {
            // The matching run.state transition carries the status change.
        }
        EventPayload::UserTakeover => {}
        EventPayload::UserCrossSiteIntent {
            from_origin,
            to_origin,
            source_document,
        } => {
            snap.cross_site_grants.push(CrossSiteGrant {
                from_origin: from_origin.clone(),
                to_origin: to_origin.clone(),
                source_document: source_document.clone(),
            });
        }
        EventPayload::PageObserve { observation, .. } => {
            snap.latest_observation = Some(observation.clone());
        }
        EventPayload::ModelPlanRequest { .. } => {}
        EventPayload::ModelPlanResult { .. } => {}
        EventPayload::ToolRequest {
            request_id,
            tool,
            category,
            ..
        } => {
            snap.inflight_tool = Some(InflightTool {
                request_id: *request_id,
                tool: tool.clone(),
                category: *category,
            });
            snap.steps_taken += 1;
        }
        EventPayload::ToolResult { request_id, .. } => {
            if snap
                .inflight_tool
                .as_ref()
                .is_some_and(|t| t.request_id == *request_id)
            {
                snap.inflight_tool = None;
            }
        }
        EventPayload::PolicyDecision {
            request_id,
            decision,
            reason_code,
            ..
        } => {
            snap.last_reason_code = Some(*reason_code);
            if *decision == Decision::Ask {
                snap.pending_approval = request_id.map(|id| id.to_string());
            }
        }
        EventPayload::RunCheckpoint {
            summary,
            covered_through_seq,
            ..
        } => {
            snap.latest_checkpoint = Some((event.seq, summary.clone()));
            snap.checkpoint_covered_through = Some(*covered_through_seq);
        }
        EventPayload::RunRollback { .. } | EventPayload::RunBranch { .. } => {}
        EventPayload::RunState { to, .. } => {
            snap.status = *to;
        }
        EventPayload::EventRedaction { .. } => {}
        EventPayload::AuditFlag { reason_code, .. } => {
            match reason_code {
                ReasonCode::AutonomyDowngraded => {
                    snap.mode = snap.mode.downgraded();
                }
                ReasonCode::InjectionSuspected => {
                    snap.injection_flagged = true;
                }
                _ => {}
            }
            snap.last_reason_code = Some(*reason_code);
        }
    }
}
