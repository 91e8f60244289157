// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! The orchestrator: observe → plan → gate → act → verify, per run.
//!
//! The public surface is a queue pair: submissions go in, events come out.
//! One tokio task per run drives the loop and is the *only* writer to that
//! run's event log; approvals, cancellation, and user input reach it through
//! the session's shared state. Every state transition is durable before it
//! is visible anywhere else.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use async_channel::Receiver;
use async_channel::Sender;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use webpilot_protocol::BridgeOutMsg;
use webpilot_protocol::Mode;
use webpilot_protocol::Observation;
use webpilot_protocol::PageBinding;
use webpilot_protocol::RunControls;
use webpilot_protocol::RunStatePayload;
use webpilot_protocol::RunSummary;
use webpilot_protocol::Surface;

use crate::bridge::Bridge;
use crate::bridge::envelope;
use crate::capability::CapabilityToken;
use crate::capability::RotationReason;
use crate::capability::TokenService;
use crate::clock::Clock;
use crate::config::Config;
use crate::context_pack;
use crate::context_pack::PackOutcome;
use crate::context_pack::PackParams;
use crate::error::CoreErr;
use crate::error::ErrorCode;
use crate::error::Result as CoreResult;
use crate::event_store::EventStore;
use crate::event_store::RunLog;
use crate::events::CheckpointSummary;
use crate::events::Event;
use crate::events::EventPayload;
use crate::events::RunMeta;
use crate::grounding;
use crate::grounding::GroundingOutcome;
use crate::planner::PlanInput;
use crate::planner::Planner;
use crate::planner::ToolProposal;
use crate::planner::parse_planner_output;
use crate::policy;
use crate::policy::Decision;
use crate::policy::PolicyCtx;
use crate::policy::ProposedCall;
use crate::policy::ReasonCode;
use crate::redact;
use crate::run_state::RunSnapshot;
use crate::run_state::RunStatus;
use crate::run_state::fold;
use crate::tool_router::DispatchRequest;
use crate::tool_router::ToolRouter;
use crate::tools::ToolRegistry;
use crate::util::backoff;

/// How long an `awaiting_approval` step waits before pausing the run.
const APPROVAL_WAIT: Duration = Duration::from_secs(600);

/// Degraded context packs tolerated before the run fails.
const MAX_DEGRADED_PACKS: u32 = 2;

/// Submission Queue Entry - requests from the embedding app.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Submission {
    /// Unique id for this Submission to correlate with AgentEvents
    pub id: String,
    /// Payload
    pub op: Op,
}

/// User decision on a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    /// Approve, and auto-approve identical proposals on this document for
    /// the remainder of the run.
    ApprovedForSession,
    Denied,
}

/// Submission operation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    /// Start a new run from a user goal.
    StartRun {
        goal: String,
        origin: String,
        surface: Surface,
        tab_id: u64,
        frame_id: u64,
        /// Defaults to the configured mode.
        mode: Option<Mode>,
    },

    /// Additional instruction for a running task; queued until the next
    /// planning step.
    UserInput { run_id: Uuid, text: String },

    /// Resolve an `awaiting_approval` step.
    Approval {
        run_id: Uuid,
        approval_id: String,
        decision: ApprovalDecision,
    },

    /// Durable grant to carry data across origins, for this run only.
    GrantCrossSiteIntent {
        run_id: Uuid,
        from_origin: String,
        to_origin: String,
    },

    /// Stop one run.
    Cancel { run_id: Uuid },

    /// The user started driving the page themselves.
    Takeover { run_id: Uuid },

    /// Resume a paused run. Counts as explicit re-authorization.
    Resume { run_id: Uuid },

    /// Emergency stop: wipe the keyring, cancel everything, lock connected
    /// mode until explicit re-authorization.
    Panic,

    /// Stop all runs and exit the submission loop.
    Shutdown,
}

/// Event Queue Entry - events from the agent.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentEvent {
    /// Submission `id` this event correlates with.
    pub id: String,
    /// Payload
    pub msg: EventMsg,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventMsg {
    /// Ack after startup: profile plus runs that resumed `paused`.
    SessionConfigured {
        profile_id: String,
        resumed_runs: Vec<Uuid>,
    },

    RunStarted {
        run_id: Uuid,
    },

    /// Durable state transition, with the same snapshot the bridge gets.
    StateChanged {
        state: RunStatePayload,
    },

    /// A step is waiting on the user.
    ApprovalRequest {
        run_id: Uuid,
        approval_id: String,
        tool: String,
        summary: String,
        reason_code: String,
        requires_gesture: bool,
    },

    /// Rendered answer document for the user.
    Answer {
        run_id: Uuid,
        markdown: String,
        citations: Vec<u32>,
    },

    Error {
        run_id: Option<Uuid>,
        code: String,
        message: String,
    },

    /// Terminal notice.
    RunFinished {
        run_id: Uuid,
        status: String,
    },
}

/// Everything the orchestrator composes over.
pub struct AgentComponents {
    pub config: Config,
    pub store: EventStore,
    pub bridge: Arc<dyn Bridge>,
    pub planner: Arc<dyn Planner>,
    pub clock: Clock,
}

/// The high-level interface to the agent core. Operates as a queue pair:
/// submit operations, receive events.
pub struct Agent {
    next_id: AtomicU64,
    tx_sub: Sender<Submission>,
    rx_event: Receiver<AgentEvent>,
}

impl Agent {
    /// Spawn the agent: resume whatever the log says was alive, then start
    /// the submission loop. Returns the instance and the id of the
    /// `SessionConfigured` event.
    pub async fn spawn(components: AgentComponents) -> CoreResult<(Agent, String)> {
        let (tx_sub, rx_sub) = async_channel::bounded(64);
        let (tx_event, rx_event) = async_channel::bounded(64);

        let tokens = Arc::new(TokenService::new(components.clock.clone()));
        let router = ToolRouter::new(
            Arc::clone(&components.bridge),
            Arc::clone(&tokens),
            components.clock.clone(),
        );
        let matrix = match components.config.policy_matrix_version.as_deref() {
            None => policy::DecisionMatrix::load_default()?,
            Some(version) => {
                let matrix = policy::DecisionMatrix::load_default()?;
                if matrix.version() != version {
                    return Err(CoreErr::Unsupported(format!(
                        "policy matrix {version} is not available (built-in is {})",
                        matrix.version()
                    )));
                }
                matrix
            }
        };

        let sess = Arc::new(Session {
            config: components.config,
            store: components.store,
            bridge: components.bridge,
            planner: components.planner,
            clock: components.clock,
            tokens,
            registry: ToolRegistry::v1(),
            matrix,
            router,
            tx_event: tx_event.clone(),
            state: Mutex::new(SessionState::default()),
        });

        // Capability tokens did not survive the restart; fold every live run
        // back to paused before accepting new work.
        let resumed = resume_interrupted_runs(&sess).await?;

        let agent = Agent {
            next_id: AtomicU64::new(0),
            tx_sub,
            rx_event,
        };
        let init_id = agent
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            .to_string();
        let configured = AgentEvent {
            id: init_id.clone(),
            msg: EventMsg::SessionConfigured {
                profile_id: sess.config.profile_id.clone(),
                resumed_runs: resumed,
            },
        };
        tx_event
            .send(configured)
            .await
            .map_err(|_| CoreErr::Internal("event queue closed during spawn".to_string()))?;

        tokio::spawn(submission_loop(sess, rx_sub));
        Ok((agent, init_id))
    }

    /// Submit the `op` wrapped in a `Submission` with a unique ID.
    pub async fn submit(&self, op: Op) -> CoreResult<String> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            .to_string();
        let sub = Submission { id: id.clone(), op };
        self.tx_sub
            .send(sub)
            .await
            .map_err(|_| CoreErr::Internal("agent loop died unexpectedly".to_string()))?;
        Ok(id)
    }

    pub async fn next_event(&self) -> CoreResult<AgentEvent> {
        self.rx_event
            .recv()
            .await
            .map_err(|_| CoreErr::Internal("agent loop died unexpectedly".to_string()))
    }
}

/// A running run task.
struct RunTask {
    cancel: CancellationToken,
    handle: AbortHandle,
}

#[derive(Default)]
struct SessionState {
    tasks: HashMap<Uuid, RunTask>,
    pending_approvals: HashMap<String, oneshot::Sender<ApprovalDecision>>,
    /// Instructions and grants queued for a run's next loop iteration.
    pending_inputs: HashMap<Uuid, Vec<EventPayload>>,
}

/// Context for an initialized agent session. A session drives many runs,
/// each with at most one task at a time.
struct Session {
    config: Config,
    store: EventStore,
    bridge: Arc<dyn Bridge>,
    planner: Arc<dyn Planner>,
    clock: Clock,
    tokens: Arc<TokenService>,
    registry: ToolRegistry,
    matrix: policy::DecisionMatrix,
    router: ToolRouter,
    tx_event: Sender<AgentEvent>,
    state: Mutex<SessionState>,
}

impl Session {
    /// Sends the given event to the client, logging on failure.
    async fn send_event(&self, event: AgentEvent) {
        if let Err(e) = self.tx_event.send(event).await {
            error!("failed to send agent event: {e}");
        }
    }

    async fn send_error(&self, sub_id: &str, run_id: Option<Uuid>, code: ErrorCode) {
        self.send_event(AgentEvent {
            id: sub_id.to_string(),
            msg: EventMsg::Error {
                run_id,
                code: code.to_string(),
                message: code.user_message().to_string(),
            },
        })
        .await;
    }

    fn register_approval(&self, approval_id: String) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .unwrap()
            .pending_approvals
            .insert(approval_id, tx);
        rx
    }

    fn notify_approval(&self, approval_id: &str, decision: ApprovalDecision) {
        let mut state = self.state.lock().unwrap();
        if let Some(tx) = state.pending_approvals.remove(approval_id) {
            tx.send(decision).ok();
        }
    }

    fn queue_input(&self, run_id: Uuid, payload: EventPayload) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.tasks.contains_key(&run_id) {
            state.pending_inputs.entry(run_id).or_default().push(payload);
            true
        } else {
            false
        }
    }

    fn drain_inputs(&self, run_id: Uuid) -> Vec<EventPayload> {
        let mut state = self.state.lock().unwrap();
        state.pending_inputs.remove(&run_id).unwrap_or_default()
    }

    fn remove_task(&self, run_id: Uuid) {
        let mut state = self.state.lock().unwrap();
        state.tasks.remove(&run_id);
    }

    fn abort_task(&self, run_id: Uuid) -> Option<RunTask> {
        let mut state = self.state.lock().unwrap();
        let task = state.tasks.remove(&run_id)?;
        task.cancel.cancel();
        task.handle.abort();
        Some(task)
    }

    fn build_ui_state(&self, snapshot: &RunSnapshot, next_step: Option<String>) -> RunStatePayload {
        let status = snapshot.status;
        RunStatePayload {
            app_state: if self.tokens.is_locked() {
                "locked".to_string()
            } else {
                "running".to_string()
            },
            origin: snapshot.origin.clone(),
            mode: snapshot.mode,
            surface: snapshot.surface,
            run: RunSummary {
                run_id: snapshot.run_id,
                status: status.to_string(),
                attached_target: Some(snapshot.origin.clone()),
                last_action: snapshot
                    .inflight_tool
                    .as_ref()
                    .map(|t| format!("{} in flight", t.tool)),
                next_step,
                pending_approval: snapshot.pending_approval.clone(),
                last_reason_code: snapshot.last_reason_code.map(|c| c.to_string()),
            },
            controls: RunControls {
                can_stop: !status.is_terminal(),
                can_resume: status == RunStatus::Paused,
                needs_gesture: false,
            },
            next_policy_decision: snapshot.last_reason_code.map(|c| c.to_string()),
        }
    }

    /// Emit the run-state payload to both the UI queue and the bridge.
    async fn publish_state(&self, sub_id: &str, snapshot: &RunSnapshot, next_step: Option<String>) {
        let payload = self.build_ui_state(snapshot, next_step);
        self.bridge.emit_ui_state(payload.clone()).await;
        self.send_event(AgentEvent {
            id: sub_id.to_string(),
            msg: EventMsg::StateChanged { state: payload },
        })
        .await;
    }
}

/// Fold every non-terminal run back to `paused` on startup. Mutating steps
/// that were `executing` without a result are *not* replayed.
async fn resume_interrupted_runs(sess: &Arc<Session>) -> CoreResult<Vec<Uuid>> {
    let mut resumed = Vec::new();
    for meta in sess.store.list_resumable().await? {
        let events = sess.store.read_all(meta.run_id).await?;
        let snapshot = fold(meta.run_id, &events)?;
        if snapshot.has_unresolved_side_effect() {
            warn!(
                run_id = %meta.run_id,
                "run restarted with an unresolved side-effecting step; pausing"
            );
        }
        let resumed_snapshot = snapshot.clone().into_resumed();
        if resumed_snapshot.status == RunStatus::Paused && snapshot.status != RunStatus::Paused {
            let tip = events.last().map(|e| e.event_id);
            sess.store
                .append(
                    meta.run_id,
                    tip,
                    EventPayload::RunState {
                        from: snapshot.status,
                        to: RunStatus::Paused,
                        reason_code: None,
                    },
                )
                .await?;
            resumed.push(meta.run_id);
        }
    }
    Ok(resumed)
}

async fn submission_loop(sess: Arc<Session>, rx_sub: Receiver<Submission>) {
    while let Ok(sub) = rx_sub.recv().await {
        debug!(id = %sub.id, "submission");
        match sub.op {
            Op::StartRun {
                goal,
                origin,
                surface,
                tab_id,
                frame_id,
                mode,
            } => {
                let mode = mode.unwrap_or(sess.config.mode);
                match start_run(&sess, &sub.id, goal, origin, surface, tab_id, frame_id, mode).await
                {
                    Ok(run_id) => {
                        sess.send_event(AgentEvent {
                            id: sub.id.clone(),
                            msg: EventMsg::RunStarted { run_id },
                        })
                        .await;
                    }
                    Err(e) => {
                        error!("failed to start run: {e}");
                        sess.send_error(&sub.id, None, e.code()).await;
                    }
                }
            }
            Op::UserInput { run_id, text } => {
                let screened = redact::screen_text(&text).text;
                let queued = sess.queue_input(
                    run_id,
                    EventPayload::UserMessage {
                        text: screened,
                        origin: String::new(),
                        surface: Surface::Isolated,
                        mode: Mode::ReadOnly,
                        profile_id: sess.config.profile_id.clone(),
                    },
                );
                if !queued {
                    sess.send_error(&sub.id, Some(run_id), ErrorCode::NotFound).await;
                }
            }
            Op::Approval {
                run_id: _,
                approval_id,
                decision,
            } => {
                sess.notify_approval(&approval_id, decision);
            }
            Op::GrantCrossSiteIntent {
                run_id,
                from_origin,
                to_origin,
            } => {
                // The source document identity is pinned by the task when it
                // writes the event; the grant dies with the run.
                let queued = sess.queue_input(
                    run_id,
                    EventPayload::UserCrossSiteIntent {
                        from_origin,
                        to_origin,
                        source_document: webpilot_protocol::DocumentIdentity {
                            document_id: String::new(),
                            navigation_generation: 0,
                        },
                    },
                );
                if !queued {
                    sess.send_error(&sub.id, Some(run_id), ErrorCode::NotFound).await;
                }
            }
            Op::Cancel { run_id } => {
                finish_externally(&sess, &sub.id, run_id, RunStatus::Cancelled, "user").await;
            }
            Op::Takeover { run_id } => {
                if sess.abort_task(run_id).is_some() {
                    let takeover: CoreResult<()> = async {
                        let Some((_, tip_id)) = sess.store.tip(run_id).await? else {
                            return Err(CoreErr::Internal(format!("run {run_id} has no events")));
                        };
                        sess.store
                            .append(run_id, Some(tip_id), EventPayload::UserTakeover)
                            .await?;
                        write_transition(&sess, run_id, RunStatus::Takeover).await?;
                        write_transition(&sess, run_id, RunStatus::Paused).await?;
                        Ok(())
                    }
                    .await;
                    if let Err(e) = takeover {
                        error!("takeover handling failed: {e}");
                    }
                    publish_folded_state(&sess, &sub.id, run_id).await;
                }
            }
            Op::Resume { run_id } => {
                // Explicit user action: this is the re-authorization that
                // unlocks a panic-locked keyring.
                sess.tokens.unlock();
                match resume_run(&sess, &sub.id, run_id).await {
                    Ok(()) => {}
                    Err(e) => {
                        error!("resume failed: {e}");
                        sess.send_error(&sub.id, Some(run_id), e.code()).await;
                    }
                }
            }
            Op::Panic => {
                info!("panic: wiping keyring and cancelling all runs");
                sess.tokens.rotate(RotationReason::Panic);
                let run_ids: Vec<Uuid> = {
                    let state = sess.state.lock().unwrap();
                    state.tasks.keys().copied().collect()
                };
                for run_id in run_ids {
                    finish_externally(&sess, &sub.id, run_id, RunStatus::Cancelled, "panic").await;
                }
            }
            Op::Shutdown => {
                let run_ids: Vec<Uuid> = {
                    let state = sess.state.lock().unwrap();
                    state.tasks.keys().copied().collect()
                };
                for run_id in run_ids {
                    sess.abort_task(run_id);
                }
                break;
            }
        }
    }
    debug!("agent loop exited");
}

/// Abort a task (if any) and write the cancel/state events from outside it.
/// Safe with respect to the single-writer rule: the task is gone before we
/// touch the log.
async fn finish_externally(
    sess: &Arc<Session>,
    sub_id: &str,
    run_id: Uuid,
    status: RunStatus,
    reason: &str,
) {
    sess.abort_task(run_id);
    sess.tokens.revoke_all();

    // The aborted task may have had one last append in the writer queue; a
    // ChainConflict on the first attempt just means our tip was stale.
    let mut recorded = Ok(());
    for attempt in 0..2 {
        recorded = async {
            let events = sess.store.read_all(run_id).await?;
            let snapshot = fold(run_id, &events)?;
            if snapshot.status.is_terminal() {
                return Ok(());
            }
            let Some(tip_id) = events.last().map(|e| e.event_id) else {
                return Err(CoreErr::Internal(format!("run {run_id} has no events")));
            };
            let cancel_event = sess
                .store
                .append(
                    run_id,
                    Some(tip_id),
                    EventPayload::UserCancel {
                        reason: reason.to_string(),
                    },
                )
                .await?;
            sess.store
                .append(
                    run_id,
                    Some(cancel_event.event_id),
                    EventPayload::RunState {
                        from: snapshot.status,
                        to: status,
                        reason_code: None,
                    },
                )
                .await?;
            Ok(())
        }
        .await;
        match &recorded {
            Err(CoreErr::ChainConflict) if attempt == 0 => continue,
            _ => break,
        }
    }
    if let Err(e) = recorded {
        error!("failed to record cancellation: {e}");
    }

    sess.send_event(AgentEvent {
        id: sub_id.to_string(),
        msg: EventMsg::RunFinished {
            run_id,
            status: status.to_string(),
        },
    })
    .await;
    publish_folded_state(sess, sub_id, run_id).await;
}

async fn write_transition(sess: &Arc<Session>, run_id: Uuid, to: RunStatus) -> CoreResult<()> {
    let Some((_, tip_id)) = sess.store.tip(run_id).await? else {
        return Err(CoreErr::Internal(format!("run {run_id} has no events")));
    };
    let events = sess.store.read_all(run_id).await?;
    let snapshot = fold(run_id, &events)?;
    if snapshot.status == to {
        return Ok(());
    }
    sess.store
        .append(
            run_id,
            Some(tip_id),
            EventPayload::RunState {
                from: snapshot.status,
                to,
                reason_code: None,
            },
        )
        .await?;
    Ok(())
}

async fn publish_folded_state(sess: &Arc<Session>, sub_id: &str, run_id: Uuid) {
    if let Ok(events) = sess.store.read_all(run_id).await
        && let Ok(snapshot) = fold(run_id, &events)
    {
        sess.publish_state(sub_id, &snapshot, None).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn start_run(
    sess: &Arc<Session>,
    sub_id: &str,
    goal: String,
    origin: String,
    surface: Surface,
    tab_id: u64,
    frame_id: u64,
    mode: Mode,
) -> CoreResult<Uuid> {
    let run_id = Uuid::new_v4();
    let screened_goal = redact::screen_text(&goal).text;
    let genesis = sess
        .store
        .create_run(
            RunMeta {
                run_id,
                created_at: sess.clock.now(),
                status: RunStatus::Idle,
                surface,
                origin: origin.clone(),
                mode,
                profile_id: sess.config.profile_id.clone(),
                head_event_id: None,
            },
            EventPayload::UserMessage {
                text: screened_goal,
                origin,
                surface,
                mode,
                profile_id: sess.config.profile_id.clone(),
            },
        )
        .await?;

    let log = RunLog::new(sess.store.clone(), run_id, Some(genesis.event_id));
    spawn_run_task(sess, sub_id.to_string(), log, tab_id, frame_id);
    Ok(run_id)
}

async fn resume_run(sess: &Arc<Session>, sub_id: &str, run_id: Uuid) -> CoreResult<()> {
    let events = sess.store.read_all(run_id).await?;
    let snapshot = fold(run_id, &events)?;
    if snapshot.status != RunStatus::Paused {
        return Err(CoreErr::PreconditionFailed(format!(
            "run is {}, not paused",
            snapshot.status
        )));
    }
    let tip = events.last().map(|e| e.event_id);
    let log = RunLog::new(sess.store.clone(), run_id, tip);
    // Tab and frame bindings are re-established by the first observation.
    spawn_run_task(sess, sub_id.to_string(), log, 0, 0);
    Ok(())
}

fn spawn_run_task(sess: &Arc<Session>, sub_id: String, log: RunLog, tab_id: u64, frame_id: u64) {
    let run_id = log.run_id();
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let task_sess = Arc::clone(sess);
    let task_sub = sub_id;
    let handle = tokio::spawn(async move {
        let sess = task_sess;
        if let Err(e) = run_task(&sess, &task_sub, log, tab_id, frame_id, task_cancel).await {
            error!(run_id = %run_id, "run task failed: {e}");
            sess.send_error(&task_sub, Some(run_id), e.code()).await;
            if let Err(e2) = write_transition(&sess, run_id, RunStatus::Failed).await {
                error!("could not record failure: {e2}");
            }
            sess.send_event(AgentEvent {
                id: task_sub.clone(),
                msg: EventMsg::RunFinished {
                    run_id,
                    status: RunStatus::Failed.to_string(),
                },
            })
            .await;
        }
        sess.remove_task(run_id);
    })
    .abort_handle();

    let mut state = sess.state.lock().unwrap();
    if let Some(old) = state.tasks.insert(run_id, RunTask { cancel, handle }) {
        old.cancel.cancel();
        old.handle.abort();
    }
}

/// Outcome of one loop step, steering the next phase.
enum StepFlow {
    /// Take a fresh observation, optionally scoped.
    Reobserve { scope_handle: Option<String> },
    /// Plan again against the observation we already hold.
    Replan,
    /// Terminal.
    Finished(RunStatus),
}

struct TaskCtx {
    snapshot: RunSnapshot,
    binding: Option<PageBinding>,
    observation: Option<Observation>,
    tab_id: u64,
    frame_id: u64,
    degraded_packs: u32,
    step_retries: u32,
}

async fn run_task(
    sess: &Arc<Session>,
    sub_id: &str,
    mut log: RunLog,
    tab_id: u64,
    frame_id: u64,
    cancel: CancellationToken,
) -> CoreResult<()> {
    let run_id = log.run_id();
    let events = sess.store.read_all(run_id).await?;
    let mut ctx = TaskCtx {
        snapshot: fold(run_id, &events)?,
        binding: None,
        observation: None,
        tab_id,
        frame_id,
        degraded_packs: 0,
        step_retries: 0,
    };

    // Connected surfaces require an explicit gesture before the first
    // observation; isolated ones go straight to observing.
    if ctx.snapshot.surface == Surface::Connected
        && matches!(ctx.snapshot.status, RunStatus::Idle | RunStatus::Paused)
    {
        transition(sess, sub_id, &mut log, &mut ctx, RunStatus::Authorizing, None).await?;
        let env = envelope(
            Uuid::new_v4(),
            None,
            placeholder_binding(&ctx),
            sess.clock.now_ms() + APPROVAL_WAIT.as_millis() as u64,
            None,
            BridgeOutMsg::UiGestureRequired {
                reason_code: ReasonCode::GestureRequired.to_string(),
            },
        );
        if sess.bridge.require_gesture(env, cancel.clone()).await.is_err() {
            transition(sess, sub_id, &mut log, &mut ctx, RunStatus::Paused, None).await?;
            return Ok(());
        }
    }

    let mut flow = StepFlow::Reobserve { scope_handle: None };
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        // Instructions and grants queued while we were busy become durable
        // events now, before they can influence a plan.
        for mut payload in sess.drain_inputs(run_id) {
            match &mut payload {
                EventPayload::UserCrossSiteIntent { source_document, .. } => {
                    if let Some(obs) = &ctx.observation {
                        *source_document = obs.document.clone();
                    }
                }
                EventPayload::UserMessage { text, .. } => {
                    ctx.snapshot.last_user_instruction = Some(text.clone());
                }
                _ => {}
            }
            let appended = log.append(payload).await?;
            if let Some(EventPayload::UserCrossSiteIntent {
                from_origin,
                to_origin,
                source_document,
            }) = appended.payload
            {
                ctx.snapshot.cross_site_grants.push(policy::CrossSiteGrant {
                    from_origin,
                    to_origin,
                    source_document,
                });
            }
        }

        match flow {
            StepFlow::Reobserve { scope_handle } => {
                transition(sess, sub_id, &mut log, &mut ctx, RunStatus::Observing, None).await?;
                match observe_once(sess, &mut log, &mut ctx, scope_handle, &cancel).await? {
                    ObserveOutcome::Ok => {
                        flow = StepFlow::Replan;
                    }
                    ObserveOutcome::Unavailable => {
                        sess.tokens.rotate(RotationReason::DocumentChange);
                        transition(sess, sub_id, &mut log, &mut ctx, RunStatus::Paused, None)
                            .await?;
                        sess.send_error(sub_id, Some(run_id), ErrorCode::Unavailable).await;
                        return Ok(());
                    }
                }
            }
            StepFlow::Replan => {
                if ctx.snapshot.steps_taken >= sess.config.max_steps_per_run {
                    warn!(run_id = %run_id, "step budget exhausted");
                    transition(sess, sub_id, &mut log, &mut ctx, RunStatus::Failed, None).await?;
                    flow = StepFlow::Finished(RunStatus::Failed);
                    continue;
                }
                flow = plan_and_act(sess, sub_id, &mut log, &mut ctx, &cancel).await?;
            }
            StepFlow::Finished(status) => {
                if status.is_terminal() {
                    sess.send_event(AgentEvent {
                        id: sub_id.to_string(),
                        msg: EventMsg::RunFinished {
                            run_id,
                            status: status.to_string(),
                        },
                    })
                    .await;
                }
                return Ok(());
            }
        }

        maybe_checkpoint(sess, &mut log, &mut ctx).await?;
    }
}

fn placeholder_binding(ctx: &TaskCtx) -> PageBinding {
    PageBinding {
        origin: ctx.snapshot.origin.clone(),
        tab_id: ctx.tab_id,
        frame_id: ctx.frame_id,
        document: webpilot_protocol::DocumentIdentity {
            document_id: String::new(),
            navigation_generation: 0,
        },
        mode: ctx.snapshot.mode,
    }
}

async fn transition(
    sess: &Arc<Session>,
    sub_id: &str,
    log: &mut RunLog,
    ctx: &mut TaskCtx,
    to: RunStatus,
    reason_code: Option<ReasonCode>,
) -> CoreResult<()> {
    let from = ctx.snapshot.status;
    if from == to {
        return Ok(());
    }
    if !from.can_transition_to(to) {
        return Err(CoreErr::Internal(format!(
            "illegal transition {from} -> {to}"
        )));
    }
    log.append(EventPayload::RunState {
        from,
        to,
        reason_code,
    })
    .await?;
    ctx.snapshot.status = to;
    ctx.snapshot.head_seq += 1;
    sess.publish_state(sub_id, &ctx.snapshot, None).await;
    Ok(())
}

enum ObserveOutcome {
    Ok,
    Unavailable,
}

async fn observe_once(
    sess: &Arc<Session>,
    log: &mut RunLog,
    ctx: &mut TaskCtx,
    scope_handle: Option<String>,
    cancel: &CancellationToken,
) -> CoreResult<ObserveOutcome> {
    let env = envelope(
        Uuid::new_v4(),
        None,
        ctx.binding.clone().unwrap_or_else(|| placeholder_binding(ctx)),
        sess.clock.now_ms() + sess.config.observe_deadline.as_millis() as u64,
        None,
        BridgeOutMsg::ObserveRequest {
            scope_handle: scope_handle.clone(),
        },
    );

    let observed = tokio::select! {
        _ = cancel.cancelled() => return Err(CoreErr::Cancelled),
        result = tokio::time::timeout(
            sess.config.observe_deadline,
            sess.bridge.observe(env, cancel.clone()),
        ) => match result {
            Ok(inner) => inner,
            Err(_) => Err(CoreErr::TimedOut),
        },
    };
    let raw = match observed {
        Ok(obs) => obs,
        Err(CoreErr::Unavailable) => return Ok(ObserveOutcome::Unavailable),
        Err(e) => return Err(e),
    };
    let observation = redact::sanitize_observation(raw);

    // Token bindings follow the page identity.
    let mut new_binding = PageBinding {
        origin: observation.origin.clone(),
        tab_id: ctx.tab_id,
        frame_id: ctx.frame_id,
        document: observation.document.clone(),
        mode: ctx.snapshot.mode,
    };
    if let Some(previous) = &ctx.binding {
        if previous.document.document_id != new_binding.document.document_id {
            sess.tokens.rotate(RotationReason::DocumentChange);
        } else if previous.document.navigation_generation
            != new_binding.document.navigation_generation
        {
            sess.tokens.rotate(RotationReason::NavGenChange);
        } else if previous.mode != new_binding.mode {
            sess.tokens.rotate(RotationReason::ModeChange);
        }
    }

    // Injection and overlay screening happens before the observation can
    // influence any plan.
    if let Some(reason) = grounding::inspect_observation(&observation)
        && !ctx.snapshot.injection_flagged
    {
        warn!(run_id = %log.run_id(), reason = %reason, "suspicious observation");
        log.append(EventPayload::AuditFlag {
            reason_code: reason,
            detail: "observation flagged before planning".to_string(),
        })
        .await?;
        log.append(EventPayload::AuditFlag {
            reason_code: ReasonCode::AutonomyDowngraded,
            detail: "autonomy reduced one step after suspicious observation".to_string(),
        })
        .await?;
        ctx.snapshot.injection_flagged = true;
        ctx.snapshot.mode = ctx.snapshot.mode.downgraded();
        new_binding.mode = ctx.snapshot.mode;
    }

    let observe_verdict = policy::decide_observation(&new_binding, &sess.matrix);
    log.append(EventPayload::PolicyDecision {
        request_id: None,
        tool: "page.observe".to_string(),
        decision: observe_verdict.decision,
        reason_code: observe_verdict.reason_code,
        requires_gesture: observe_verdict.requires_gesture,
        binding: observe_verdict.binding,
        matrix_version: observe_verdict.matrix_version,
    })
    .await?;
    log.append(EventPayload::PageObserve {
        observation: observation.clone(),
        scope_handle,
    })
    .await?;

    ctx.snapshot.latest_observation = Some(observation.clone());
    ctx.binding = Some(new_binding);
    ctx.observation = Some(observation);
    Ok(ObserveOutcome::Ok)
}

async fn plan_once(
    sess: &Arc<Session>,
    log: &mut RunLog,
    ctx: &mut TaskCtx,
    cancel: &CancellationToken,
) -> CoreResult<std::result::Result<(crate::planner::PlannerOutput, u32), StepFlow>> {
    let allowed_tools = sess.registry.allowed_in_mode(ctx.snapshot.mode);
    let trail = sess.store.read_all(log.run_id()).await?;
    let pack = context_pack::build_pack(PackParams {
        budget_tokens: sess.config.context_budget_tokens,
        mode: ctx.snapshot.mode,
        allowed_tools: &allowed_tools,
        goal: &ctx.snapshot.goal,
        instruction: ctx.snapshot.last_user_instruction.as_deref(),
        observation: ctx.observation.as_ref(),
        trail: &trail,
        checkpoint: ctx.snapshot.latest_checkpoint.as_ref().map(|(_, s)| s),
    })?;

    let pack = match pack {
        PackOutcome::Ready(pack) => pack,
        PackOutcome::ReobserveTighterScope { needed_tokens, .. } => {
            ctx.degraded_packs += 1;
            if ctx.degraded_packs > MAX_DEGRADED_PACKS {
                return Err(CoreErr::Unsupported(format!(
                    "context budget too small for this page ({needed_tokens} tokens needed)"
                )));
            }
            // Scope the next observation to the first interactive element's
            // subtree; the extraction layer narrows from there.
            let scope = ctx
                .observation
                .as_ref()
                .and_then(|obs| obs.interactive.first())
                .map(|el| el.handle.clone());
            return Ok(Err(StepFlow::Reobserve { scope_handle: scope }));
        }
    };

    let rendered = if sess.config.cloud_enabled {
        pack.render_for_egress()
    } else {
        pack.render()
    };
    log.append(EventPayload::ModelPlanRequest {
        pack_digest: pack.digest()?,
        estimated_tokens: pack.estimated_tokens,
        degraded: pack.degraded,
    })
    .await?;

    let raw = tokio::select! {
        _ = cancel.cancelled() => return Err(CoreErr::Cancelled),
        result = tokio::time::timeout(
            sess.config.planner_deadline,
            sess.planner.plan(
                PlanInput {
                    text: rendered,
                    estimated_tokens: pack.estimated_tokens,
                },
                sess.config.planner_deadline,
                cancel.clone(),
            ),
        ) => match result {
            Ok(inner) => inner?,
            Err(_) => return Err(CoreErr::TimedOut),
        },
    };

    let output = parse_planner_output(&raw);
    let dropped = output.proposals.len().saturating_sub(1) as u32;
    Ok(Ok((output, dropped)))
}

async fn plan_and_act(
    sess: &Arc<Session>,
    sub_id: &str,
    log: &mut RunLog,
    ctx: &mut TaskCtx,
    cancel: &CancellationToken,
) -> CoreResult<StepFlow> {
    let run_id = log.run_id();
    transition(sess, sub_id, log, ctx, RunStatus::Planning, None).await?;

    let (output, dropped) = match plan_once(sess, log, ctx, cancel).await? {
        Ok(ok) => ok,
        Err(flow) => return Ok(flow),
    };

    // Resolve the first proposal naming a known tool; unknown names are
    // ignored, though the very first one gets a recorded deny for the audit
    // trail.
    let binding = ctx
        .binding
        .clone()
        .ok_or_else(|| CoreErr::Internal("planning without a binding".to_string()))?;
    let mut proposal: Option<&ToolProposal> = None;
    for (index, candidate) in output.proposals.iter().enumerate() {
        if sess.registry.get(&candidate.tool).is_some() {
            proposal = Some(candidate);
            break;
        }
        warn!(tool = %candidate.tool, "planner proposed an unknown tool");
        if index == 0 {
            let deny = policy::deny_unknown_tool(&binding, &sess.matrix);
            log.append(EventPayload::PolicyDecision {
                request_id: None,
                tool: candidate.tool.clone(),
                decision: deny.decision,
                reason_code: deny.reason_code,
                requires_gesture: deny.requires_gesture,
                binding: deny.binding,
                matrix_version: deny.matrix_version,
            })
            .await?;
        }
    }

    let Some(proposal) = proposal else {
        // Document-only result: ground it, fall back if needed, finish.
        return finish_with_document(sess, sub_id, log, ctx, output.document, dropped).await;
    };

    let spec = sess
        .registry
        .get(&proposal.tool)
        .ok_or_else(|| CoreErr::UnknownTool(proposal.tool.clone()))?;
    let args = match spec.validate(&proposal.arguments) {
        Ok(args) => args,
        Err(e) => {
            warn!(tool = %proposal.tool, "proposal failed schema validation: {e}");
            log.append(EventPayload::ModelPlanResult {
                document: output.document.clone(),
                proposal: None,
                dropped_proposals: dropped + 1,
                fallback_applied: false,
            })
            .await?;
            sess.send_error(sub_id, Some(run_id), e.code()).await;
            return Ok(StepFlow::Reobserve { scope_handle: None });
        }
    };

    // Record the plan with the proposal that will actually be considered.
    // Arguments are logged in redacted form: typed text never persists.
    log.append(EventPayload::ModelPlanResult {
        document: output.document.clone(),
        proposal: Some(ToolProposal {
            tool: proposal.tool.clone(),
            arguments: args.redacted(),
            summary: proposal.summary.clone(),
        }),
        dropped_proposals: dropped,
        fallback_applied: false,
    })
    .await?;

    // Gate.
    let request_id = Uuid::new_v4();
    let observation = ctx
        .observation
        .clone()
        .ok_or_else(|| CoreErr::Internal("acting without an observation".to_string()))?;
    let carry_from = ctx
        .snapshot
        .cross_site_grants
        .iter()
        .map(|g| g.from_origin.clone())
        .find(|o| o != &binding.origin);
    let call = ProposedCall {
        spec,
        args: &args,
        request_id,
        carry_from_origin: carry_from.as_deref(),
    };
    let verdict = policy::decide(
        &PolicyCtx {
            mode: ctx.snapshot.mode,
            binding: &binding,
            observation: Some(&observation),
            cross_site_grants: &ctx.snapshot.cross_site_grants,
            overrides: &sess.config.overrides,
            session_approvals: &ctx.snapshot.session_approvals,
            curated_sensitive: &sess.config.curated_sensitive_origins,
            injection_flagged: ctx.snapshot.injection_flagged,
            locked: sess.tokens.is_locked(),
            matrix: &sess.matrix,
            now_ms: sess.clock.now_ms(),
        },
        &call,
    );
    log.append(EventPayload::PolicyDecision {
        request_id: Some(request_id),
        tool: spec.name.to_string(),
        decision: verdict.decision,
        reason_code: verdict.reason_code,
        requires_gesture: verdict.requires_gesture,
        binding: verdict.binding.clone(),
        matrix_version: verdict.matrix_version.clone(),
    })
    .await?;
    ctx.snapshot.last_reason_code = Some(verdict.reason_code);

    match verdict.decision {
        Decision::Deny => {
            return handle_denial(sess, sub_id, log, ctx, verdict.reason_code).await;
        }
        Decision::Ask => {
            let approval_id = request_id.to_string();
            transition(sess, sub_id, log, ctx, RunStatus::AwaitingApproval, Some(verdict.reason_code))
                .await?;
            let rx = sess.register_approval(approval_id.clone());
            sess.send_event(AgentEvent {
                id: sub_id.to_string(),
                msg: EventMsg::ApprovalRequest {
                    run_id,
                    approval_id: approval_id.clone(),
                    tool: spec.name.to_string(),
                    summary: proposal
                        .summary
                        .clone()
                        .unwrap_or_else(|| spec.name.to_string()),
                    reason_code: verdict.reason_code.to_string(),
                    requires_gesture: verdict.requires_gesture,
                },
            })
            .await;

            let decision = tokio::select! {
                _ = cancel.cancelled() => return Err(CoreErr::Cancelled),
                decision = tokio::time::timeout(APPROVAL_WAIT, rx) => match decision {
                    Ok(Ok(d)) => d,
                    Ok(Err(_)) => return Err(CoreErr::Cancelled),
                    Err(_) => {
                        transition(sess, sub_id, log, ctx, RunStatus::Paused, None).await?;
                        return Ok(StepFlow::Finished(RunStatus::Paused));
                    }
                },
            };
            match decision {
                ApprovalDecision::Denied => {
                    log.append(EventPayload::UserDenial {
                        approval_id: approval_id.clone(),
                    })
                    .await?;
                    // A denied ask is reported, then the planner may try a
                    // different approach.
                    sess.send_error(sub_id, Some(run_id), ErrorCode::PolicyDenied).await;
                    transition(sess, sub_id, log, ctx, RunStatus::Planning, None).await?;
                    return Ok(StepFlow::Replan);
                }
                ApprovalDecision::Approved | ApprovalDecision::ApprovedForSession => {
                    let for_session = decision == ApprovalDecision::ApprovedForSession;
                    let scope_key = if for_session {
                        let key = call.scope_key(&binding.document.document_id)?;
                        ctx.snapshot.session_approvals.insert(key.clone());
                        Some(key)
                    } else {
                        None
                    };
                    log.append(EventPayload::UserApproval {
                        approval_id,
                        for_session,
                        scope_key,
                    })
                    .await?;
                }
            }
        }
        Decision::Allow => {}
    }

    if verdict.requires_gesture {
        let env = envelope(
            Uuid::new_v4(),
            None,
            binding.clone(),
            sess.clock.now_ms() + APPROVAL_WAIT.as_millis() as u64,
            None,
            BridgeOutMsg::UiGestureRequired {
                reason_code: verdict.reason_code.to_string(),
            },
        );
        if sess.bridge.require_gesture(env, cancel.clone()).await.is_err() {
            transition(sess, sub_id, log, ctx, RunStatus::Paused, None).await?;
            return Ok(StepFlow::Finished(RunStatus::Paused));
        }
    }

    // Act.
    transition(sess, sub_id, log, ctx, RunStatus::Executing, None).await?;
    let token = mint_step_token(sess, ctx, &binding, spec.name)?;
    let outcome = match sess
        .router
        .dispatch(
            log,
            &observation,
            DispatchRequest {
                request_id,
                spec,
                args: &args,
                idempotency_key: None,
                binding: binding.clone(),
                token: &token,
                deadline: sess.config.tool_deadline,
                cancel: cancel.clone(),
            },
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            // Pre-dispatch failure: provably no side effect.
            return match e {
                CoreErr::RateLimited => {
                    sess.send_error(sub_id, Some(run_id), ErrorCode::RateLimited).await;
                    Ok(StepFlow::Reobserve { scope_handle: None })
                }
                CoreErr::StaleHandle(_) | CoreErr::BindingMismatch => {
                    sess.tokens.rotate(RotationReason::NavGenChange);
                    Ok(StepFlow::Reobserve { scope_handle: None })
                }
                CoreErr::PreconditionFailed(_) | CoreErr::Tool(_) => {
                    Ok(StepFlow::Reobserve { scope_handle: None })
                }
                CoreErr::Backpressure => {
                    tokio::time::sleep(backoff(1)).await;
                    Ok(StepFlow::Reobserve { scope_handle: None })
                }
                other => Err(other),
            };
        }
    };
    ctx.snapshot.steps_taken += 1;

    if let Some(ErrorCode::Unavailable) = outcome.error_code {
        sess.tokens.rotate(RotationReason::DocumentChange);
        transition(sess, sub_id, log, ctx, RunStatus::Paused, None).await?;
        sess.send_error(sub_id, Some(run_id), ErrorCode::Unavailable).await;
        return Ok(StepFlow::Finished(RunStatus::Paused));
    }
    if let Some(ErrorCode::Cancelled) = outcome.error_code {
        return Err(CoreErr::Cancelled);
    }

    if !outcome.ok {
        let code = outcome.error_code.unwrap_or(ErrorCode::Internal);
        let idempotent = spec.idempotency != crate::tools::IdempotencyCategory::SideEffectingOnce;
        if code.retryable() && idempotent && ctx.step_retries < sess.config.step_max_retries {
            ctx.step_retries += 1;
            return Ok(StepFlow::Reobserve { scope_handle: None });
        }
        if ctx.step_retries >= sess.config.step_max_retries {
            downgrade_autonomy(log, ctx, "step retries exhausted").await?;
            ctx.step_retries = 0;
        }
        // Errors recover by observation, never by blind retry.
        return Ok(StepFlow::Reobserve { scope_handle: None });
    }
    ctx.step_retries = 0;

    // Verify: fresh tight-scope observation plus the tool's postcondition.
    transition(sess, sub_id, log, ctx, RunStatus::Verifying, None).await?;
    let before = observation;
    match observe_once(sess, log, ctx, args.target_handle().map(str::to_string), cancel).await? {
        ObserveOutcome::Unavailable => {
            sess.tokens.rotate(RotationReason::DocumentChange);
            transition(sess, sub_id, log, ctx, RunStatus::Paused, None).await?;
            return Ok(StepFlow::Finished(RunStatus::Paused));
        }
        ObserveOutcome::Ok => {}
    }
    let after = ctx
        .observation
        .clone()
        .ok_or_else(|| CoreErr::Internal("verification without an observation".to_string()))?;
    if let Err(e) = spec.postcondition(&args, &before, &after) {
        warn!(run_id = %run_id, tool = %spec.name, "postcondition failed: {e}");
        sess.send_error(sub_id, Some(run_id), ErrorCode::VerificationFailed).await;
        transition(sess, sub_id, log, ctx, RunStatus::Planning, None).await?;
        return Ok(StepFlow::Replan);
    }

    transition(sess, sub_id, log, ctx, RunStatus::Planning, None).await?;
    Ok(StepFlow::Replan)
}

/// Hard denials end the step with a safe, locally derived instruction;
/// matrix denials let the planner try another approach.
async fn handle_denial(
    sess: &Arc<Session>,
    sub_id: &str,
    log: &mut RunLog,
    ctx: &mut TaskCtx,
    reason: ReasonCode,
) -> CoreResult<StepFlow> {
    let run_id = log.run_id();
    sess.send_error(sub_id, Some(run_id), ErrorCode::PolicyDenied).await;

    let hard = matches!(
        reason,
        ReasonCode::CredentialField
            | ReasonCode::PaymentField
            | ReasonCode::CrossOriginCarryDenied
            | ReasonCode::SiteBlockedByUser
            | ReasonCode::ServiceLocked
            | ReasonCode::ModeReadOnly
    );
    if !hard {
        transition(sess, sub_id, log, ctx, RunStatus::Planning, None).await?;
        return Ok(StepFlow::Replan);
    }

    log.append(EventPayload::AuditFlag {
        reason_code: reason,
        detail: "hard policy denial ended the step".to_string(),
    })
    .await?;

    let markdown = safe_manual_instruction(reason);
    sess.store
        .record_chat(run_id, "assistant", &markdown, Vec::new())
        .await?;
    sess.send_event(AgentEvent {
        id: sub_id.to_string(),
        msg: EventMsg::Answer {
            run_id,
            markdown,
            citations: Vec::new(),
        },
    })
    .await;
    transition(sess, sub_id, log, ctx, RunStatus::Completed, Some(reason)).await?;
    Ok(StepFlow::Finished(RunStatus::Completed))
}

/// UI copy for a hard denial. Derived from the reason code alone.
fn safe_manual_instruction(reason: ReasonCode) -> String {
    let body = match reason {
        ReasonCode::CredentialField => {
            "I can't enter credentials for you. Please type your password or code yourself, \
             then ask me to continue."
        }
        ReasonCode::PaymentField => {
            "I can't fill payment details or move money. Please complete the payment step \
             yourself, then ask me to continue."
        }
        ReasonCode::CrossOriginCarryDenied => {
            "I can't carry information from that site over here without your explicit go-ahead. \
             Grant cross-site use for this run, or do this step manually."
        }
        ReasonCode::SiteBlockedByUser => {
            "You've blocked me from acting on this site. Complete this step manually, or change \
             the site's label."
        }
        ReasonCode::ServiceLocked => {
            "Actions are locked after the emergency stop. Re-authorize me to continue."
        }
        _ => "I can't perform this action here. You can complete it manually, or open the page \
              in an isolated workspace.",
    };
    body.to_string()
}

async fn finish_with_document(
    sess: &Arc<Session>,
    sub_id: &str,
    log: &mut RunLog,
    ctx: &mut TaskCtx,
    document: crate::planner::AnswerDocument,
    dropped: u32,
) -> CoreResult<StepFlow> {
    let run_id = log.run_id();
    let observation = ctx
        .observation
        .as_ref()
        .ok_or_else(|| CoreErr::Internal("answer without an observation".to_string()))?;

    let (document, fallback_applied) = match grounding::check_document(&document, observation) {
        GroundingOutcome::Grounded => (document, false),
        GroundingOutcome::Fallback(fallback) => (fallback, true),
    };
    if fallback_applied {
        log.append(EventPayload::AuditFlag {
            reason_code: ReasonCode::UngroundedFallback,
            detail: "answer replaced by extractive fallback".to_string(),
        })
        .await?;
    }
    log.append(EventPayload::ModelPlanResult {
        document: document.clone(),
        proposal: None,
        dropped_proposals: dropped,
        fallback_applied,
    })
    .await?;

    let citations: Vec<u32> = document
        .claims
        .iter()
        .flat_map(|c| c.cites.iter().copied())
        .collect();
    sess.store
        .record_chat(run_id, "assistant", &document.markdown, citations.clone())
        .await?;
    sess.send_event(AgentEvent {
        id: sub_id.to_string(),
        msg: EventMsg::Answer {
            run_id,
            markdown: document.markdown.clone(),
            citations,
        },
    })
    .await;
    transition(sess, sub_id, log, ctx, RunStatus::Completed, None).await?;
    Ok(StepFlow::Finished(RunStatus::Completed))
}

fn mint_step_token(
    sess: &Arc<Session>,
    ctx: &TaskCtx,
    binding: &PageBinding,
    tool: &str,
) -> CoreResult<CapabilityToken> {
    sess.tokens.mint(
        ctx.snapshot.run_id,
        &sess.config.profile_id,
        binding,
        vec![tool.to_string()],
        sess.config.token_ttl,
    )
}

async fn downgrade_autonomy(log: &mut RunLog, ctx: &mut TaskCtx, detail: &str) -> CoreResult<()> {
    log.append(EventPayload::AuditFlag {
        reason_code: ReasonCode::AutonomyDowngraded,
        detail: detail.to_string(),
    })
    .await?;
    ctx.snapshot.mode = ctx.snapshot.mode.downgraded();
    if let Some(binding) = &mut ctx.binding {
        binding.mode = ctx.snapshot.mode;
    }
    Ok(())
}

/// Write a checkpoint when the cadence says so, then prune covered
/// observation bodies.
async fn maybe_checkpoint(sess: &Arc<Session>, log: &mut RunLog, ctx: &mut TaskCtx) -> CoreResult<()> {
    if ctx.snapshot.status.is_terminal() {
        return Ok(());
    }
    let Some((tip_seq, _)) = sess.store.tip(log.run_id()).await? else {
        return Ok(());
    };
    let covered = ctx.snapshot.checkpoint_covered_through.unwrap_or(0);
    if tip_seq.saturating_sub(covered) < sess.config.checkpoint_every_events {
        return Ok(());
    }

    // Sign the head hash for tamper-evident export.
    let events = sess.store.read_all(log.run_id()).await?;
    let signature = match events.last() {
        Some(last) => last
            .hash_bytes()
            .ok()
            .and_then(|hash| sess.tokens.sign_head(&hash)),
        None => None,
    };

    let summary = CheckpointSummary {
        goal: ctx.snapshot.goal.clone(),
        key_facts: Vec::new(),
        succeeded: summarize_trail(&events, true),
        failed: summarize_trail(&events, false),
        next_intent: "continue toward the goal".to_string(),
    };
    let (sig, key_id) = match signature {
        Some((sig, key_id)) => (Some(sig), Some(key_id)),
        None => (None, None),
    };
    let checkpoint = log
        .append(EventPayload::RunCheckpoint {
            summary: summary.clone(),
            covered_through_seq: tip_seq,
            head_signature: sig,
            signing_key_id: key_id,
        })
        .await?;
    ctx.snapshot.latest_checkpoint = Some((checkpoint.seq, summary));
    ctx.snapshot.checkpoint_covered_through = Some(tip_seq);

    let pruned = sess.store.prune_covered(log.run_id(), tip_seq).await?;
    debug!(run_id = %log.run_id(), pruned, "checkpoint written");
    Ok(())
}

fn summarize_trail(events: &[Event], succeeded: bool) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match &event.payload {
            Some(EventPayload::ToolResult {
                tool,
                ok,
                error_code,
                ..
            }) if *ok == succeeded => Some(match error_code {
                Some(code) => format!("{tool} ({code})"),
                None => tool.clone(),
            }),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_instructions_never_quote_page_content() {
        for reason in [
            ReasonCode::CredentialField,
            ReasonCode::PaymentField,
            ReasonCode::CrossOriginCarryDenied,
            ReasonCode::SiteBlockedByUser,
            ReasonCode::ServiceLocked,
            ReasonCode::MatrixDeny,
        ] {
            let text = safe_manual_instruction(reason);
            assert!(!text.is_empty());
        }
    }

    #[test]
    fn approval_decision_serializes_snake_case() {
        let json = serde_json::to_value(ApprovalDecision::ApprovedForSession).unwrap();
        assert_eq!(json, "approved_for_session");
    }
}
