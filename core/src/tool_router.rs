//! Tool-call validation and dispatch.
//!
//! The router is the only path from a plan to the page. Order of checks is
//! load-bearing: capability token, at-most-once, precondition — all before
//! the `tool.request` event is written or the executor is reached. Failures
//! before that point provably had no side effect and surface as errors;
//! failures after it are recorded as `tool.result` events with stable codes.
//!
//! Mutating calls are serialized per (tab, frame) with a small waiting
//! queue; overflow is `RateLimited` and forces a re-plan. Read-only calls
//! share a global concurrency bound.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use webpilot_protocol::BridgeOutMsg;
use webpilot_protocol::Observation;
use webpilot_protocol::PageBinding;

use crate::bridge::Bridge;
use crate::bridge::envelope;
use crate::canonical;
use crate::capability::CapabilityToken;
use crate::capability::TokenService;
use crate::clock::Clock;
use crate::error::CoreErr;
use crate::error::ErrorCode;
use crate::error::Result;
use crate::event_store::RunLog;
use crate::events::EventPayload;
use crate::tools::IdempotencyCategory;
use crate::tools::ToolArgs;
use crate::tools::ToolSpec;

/// Mutating requests allowed to wait per (tab, frame) lane before overflow.
const LANE_QUEUE: usize = 2;

/// Global bound on concurrent read-only dispatches.
const READ_CONCURRENCY: usize = 4;

/// Outcome of one dispatch that reached (or short-circuited at) the
/// executor. Mirrors the `tool.result` event.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub request_id: Uuid,
    pub ok: bool,
    pub error_code: Option<ErrorCode>,
    pub payload: Option<Value>,
    pub content_hash: Option<String>,
    /// True when an existing `tool.result` was returned instead of
    /// executing again.
    pub cached: bool,
}

pub struct DispatchRequest<'a> {
    pub request_id: Uuid,
    pub spec: &'static ToolSpec,
    pub args: &'a ToolArgs,
    pub idempotency_key: Option<String>,
    pub binding: PageBinding,
    pub token: &'a CapabilityToken,
    pub deadline: Duration,
    pub cancel: CancellationToken,
}

struct Lane {
    busy: Arc<tokio::sync::Mutex<()>>,
    waiting: Arc<AtomicUsize>,
}

pub struct ToolRouter {
    bridge: Arc<dyn Bridge>,
    tokens: Arc<TokenService>,
    clock: Clock,
    lanes: std::sync::Mutex<HashMap<(u64, u64), Lane>>,
    read_slots: Arc<Semaphore>,
}

impl ToolRouter {
    pub fn new(bridge: Arc<dyn Bridge>, tokens: Arc<TokenService>, clock: Clock) -> Self {
        Self {
            bridge,
            tokens,
            clock,
            lanes: std::sync::Mutex::new(HashMap::new()),
            read_slots: Arc::new(Semaphore::new(READ_CONCURRENCY)),
        }
    }

    fn lane(&self, key: (u64, u64)) -> (Arc<tokio::sync::Mutex<()>>, Arc<AtomicUsize>) {
        let mut lanes = match self.lanes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let lane = lanes.entry(key).or_insert_with(|| Lane {
            busy: Arc::new(tokio::sync::Mutex::new(())),
            waiting: Arc::new(AtomicUsize::new(0)),
        });
        (Arc::clone(&lane.busy), Arc::clone(&lane.waiting))
    }

    /// Look for an existing `tool.result` matching the request id or
    /// idempotency key. At-most-once for side-effecting tools hinges on
    /// consulting the durable log, not an in-memory cache.
    async fn cached_result(
        &self,
        log: &RunLog,
        request_id: Uuid,
        idempotency_key: Option<&str>,
    ) -> Result<Option<ToolOutcome>> {
        let events = log.store().read_all(log.run_id()).await?;
        // Map idempotency keys back to the request ids that carried them.
        let mut matching_requests: Vec<Uuid> = vec![request_id];
        if let Some(key) = idempotency_key {
            for event in &events {
                if let Some(EventPayload::ToolRequest {
                    request_id: rid,
                    idempotency_key: Some(k),
                    ..
                }) = &event.payload
                    && k == key
                {
                    matching_requests.push(*rid);
                }
            }
        }
        for event in &events {
            if let Some(EventPayload::ToolResult {
                request_id: rid,
                ok,
                error_code,
                content_hash,
                ..
            }) = &event.payload
                && matching_requests.contains(rid)
            {
                return Ok(Some(ToolOutcome {
                    request_id: *rid,
                    ok: *ok,
                    error_code: *error_code,
                    payload: None,
                    content_hash: content_hash.clone(),
                    cached: true,
                }));
            }
        }
        Ok(None)
    }

    /// Validate, serialize, execute, and record one tool call.
    ///
    /// Returns `Err` only for failures that provably preceded any dispatch
    /// (no `tool.request` written). Executor-phase failures come back as
    /// `Ok(outcome)` with `ok == false` and a stable code, already recorded.
    pub async fn dispatch(
        &self,
        log: &mut RunLog,
        observation: &Observation,
        req: DispatchRequest<'_>,
    ) -> Result<ToolOutcome> {
        // 1. Capability token, bound to this exact page state and tool.
        self.tokens
            .verify(&req.token.wire, &req.binding, req.spec.name)?;

        // 2. At-most-once.
        if let Some(cached) = self
            .cached_result(log, req.request_id, req.idempotency_key.as_deref())
            .await?
        {
            tracing::debug!(request_id = %req.request_id, "returning cached tool result");
            return Ok(cached);
        }

        // 3. Tool precondition against the latest observation.
        req.spec.precondition(req.args, observation)?;

        // 4. Serialization: one mutating call per (tab, frame) at a time.
        let _permit;
        let _lane_guard;
        if req.spec.is_mutating() {
            let key = (req.binding.tab_id, req.binding.frame_id);
            let (busy, waiting) = self.lane(key);
            if waiting.load(Ordering::SeqCst) >= LANE_QUEUE {
                return Err(CoreErr::RateLimited);
            }
            waiting.fetch_add(1, Ordering::SeqCst);
            let guard = busy.lock_owned().await;
            waiting.fetch_sub(1, Ordering::SeqCst);
            _lane_guard = Some(guard);
            _permit = None;
        } else {
            let permit = Arc::clone(&self.read_slots)
                .acquire_owned()
                .await
                .map_err(|_| CoreErr::Cancelled)?;
            _permit = Some(permit);
            _lane_guard = None;
        }

        // 5. Durable request record, redacted arguments only.
        log.append(EventPayload::ToolRequest {
            request_id: req.request_id,
            tool: req.spec.name.to_string(),
            arguments: req.args.redacted(),
            idempotency_key: req.idempotency_key.clone(),
            binding: req.binding.clone(),
            category: req.spec.idempotency,
        })
        .await?;

        // 6. Execute with a hard deadline and cancellation.
        let env = envelope(
            req.request_id,
            Some(req.token.wire.clone()),
            req.binding.clone(),
            self.clock.now_ms().saturating_add(req.deadline.as_millis() as u64),
            req.idempotency_key.clone(),
            BridgeOutMsg::ToolRequest {
                tool: req.spec.name.to_string(),
                arguments: req.args.to_wire()?,
            },
        );
        let executed = tokio::select! {
            _ = req.cancel.cancelled() => Err(CoreErr::Cancelled),
            result = tokio::time::timeout(req.deadline, self.bridge.execute(env, req.cancel.clone())) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(CoreErr::TimedOut),
                }
            }
        };

        // 7. Durable result record, success or stable error code.
        let outcome = match executed {
            Ok(payload) => {
                let bytes = canonical::canonical_json_bytes(&payload)?;
                let hash = canonical::to_hex(&canonical::sha256(&bytes));
                ToolOutcome {
                    request_id: req.request_id,
                    ok: true,
                    error_code: None,
                    payload: Some(payload),
                    content_hash: Some(hash),
                    cached: false,
                }
            }
            Err(err) => ToolOutcome {
                request_id: req.request_id,
                ok: false,
                error_code: Some(err.code()),
                payload: None,
                content_hash: None,
                cached: false,
            },
        };
        log.append(EventPayload::ToolResult {
            request_id: req.request_id,
            tool: req.spec.name.to_string(),
            ok: outcome.ok,
            error_code: outcome.error_code,
            content_hash: outcome.content_hash.clone(),
        })
        .await?;
        Ok(outcome)
    }

    /// Number of read-only dispatch slots currently free. Test hook.
    #[cfg(test)]
    fn read_slots_available(&self) -> usize {
        self.read_slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::event_store::EventStore;
    use crate::events::EventKind;
    use crate::events::RunMeta;
    use crate::run_state::RunStatus;
    use crate::tools::ToolRegistry;
    use webpilot_protocol::DocumentIdentity;
    use webpilot_protocol::Envelope;
    use webpilot_protocol::Mode;
    use webpilot_protocol::RunStatePayload;
    use webpilot_protocol::Surface;

    struct ScriptedBridge {
        executions: AtomicU32,
        fail_with: Option<ErrorCode>,
        delay: Option<Duration>,
    }

    impl ScriptedBridge {
        fn ok() -> Self {
            Self {
                executions: AtomicU32::new(0),
                fail_with: None,
                delay: None,
            }
        }
    }

    #[async_trait]
    impl Bridge for ScriptedBridge {
        async fn observe(
            &self,
            _envelope: Envelope<BridgeOutMsg>,
            _cancel: CancellationToken,
        ) -> Result<Observation> {
            unreachable!("router tests never observe")
        }

        async fn execute(
            &self,
            _envelope: Envelope<BridgeOutMsg>,
            _cancel: CancellationToken,
        ) -> Result<Value> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.fail_with {
                Some(code) => Err(CoreErr::Tool(code)),
                None => Ok(json!({ "clicked": true })),
            }
        }

        async fn require_gesture(
            &self,
            _envelope: Envelope<BridgeOutMsg>,
            _cancel: CancellationToken,
        ) -> Result<()> {
            Ok(())
        }

        async fn emit_ui_state(&self, _state: RunStatePayload) {}
    }

    fn binding() -> PageBinding {
        PageBinding {
            origin: "https://example.com".to_string(),
            tab_id: 1,
            frame_id: 0,
            document: DocumentIdentity {
                document_id: "D1".to_string(),
                navigation_generation: 1,
            },
            mode: Mode::Assist,
        }
    }

    fn observation() -> Observation {
        Observation {
            url: "https://example.com/a".to_string(),
            title: "Example".to_string(),
            origin: "https://example.com".to_string(),
            document: binding().document,
            observed_at: Utc::now(),
            visible_text: Vec::new(),
            interactive: vec![webpilot_protocol::InteractiveElement {
                handle: "h1".to_string(),
                role: "button".to_string(),
                accessible_name: "Go".to_string(),
                bounds: webpilot_protocol::BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 10.0,
                    height: 10.0,
                },
                form: None,
                attributes: Vec::new(),
            }],
            access_signals: Vec::new(),
            redactions: Vec::new(),
        }
    }

    async fn run_log(store: &EventStore) -> RunLog {
        let run_id = Uuid::new_v4();
        let genesis = store
            .create_run(
                RunMeta {
                    run_id,
                    created_at: Utc::now(),
                    status: RunStatus::Idle,
                    surface: Surface::Isolated,
                    origin: "https://example.com".to_string(),
                    mode: Mode::Assist,
                    profile_id: "default".to_string(),
                    head_event_id: None,
                },
                EventPayload::UserMessage {
                    text: "click the button".to_string(),
                    origin: "https://example.com".to_string(),
                    surface: Surface::Isolated,
                    mode: Mode::Assist,
                    profile_id: "default".to_string(),
                },
            )
            .await
            .unwrap();
        RunLog::new(store.clone(), run_id, Some(genesis.event_id))
    }

    struct Fixture {
        router: ToolRouter,
        tokens: Arc<TokenService>,
        store: EventStore,
        _dir: tempfile::TempDir,
    }

    fn fixture(bridge: ScriptedBridge) -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let clock = Clock::system();
        let store = EventStore::open(dir.path(), clock.clone()).unwrap();
        let tokens = Arc::new(TokenService::new(clock.clone()));
        let router = ToolRouter::new(Arc::new(bridge), Arc::clone(&tokens), clock);
        Fixture {
            router,
            tokens,
            store,
            _dir: dir,
        }
    }

    fn token(fixture: &Fixture, run_id: Uuid) -> CapabilityToken {
        fixture
            .tokens
            .mint(
                run_id,
                "default",
                &binding(),
                vec!["browser.click".to_string()],
                Duration::from_secs(30),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn dispatch_records_request_and_result() {
        let f = fixture(ScriptedBridge::ok());
        let mut log = run_log(&f.store).await;
        let registry = ToolRegistry::v1();
        let spec = registry.get("browser.click").unwrap();
        let args = spec.validate(&json!({ "handle": "h1" })).unwrap();
        let tok = token(&f, log.run_id());

        let outcome = f
            .router
            .dispatch(
                &mut log,
                &observation(),
                DispatchRequest {
                    request_id: Uuid::new_v4(),
                    spec,
                    args: &args,
                    idempotency_key: None,
                    binding: binding(),
                    token: &tok,
                    deadline: Duration::from_secs(5),
                    cancel: CancellationToken::new(),
                },
            )
            .await
            .unwrap();
        assert!(outcome.ok);
        assert!(outcome.content_hash.is_some());

        let events = f.store.read_all(log.run_id()).await.unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::ToolRequest));
        assert!(kinds.contains(&EventKind::ToolResult));
    }

    #[tokio::test]
    async fn duplicate_request_id_returns_cached_result() {
        let f = fixture(ScriptedBridge::ok());
        let mut log = run_log(&f.store).await;
        let registry = ToolRegistry::v1();
        let spec = registry.get("browser.click").unwrap();
        let args = spec.validate(&json!({ "handle": "h1" })).unwrap();
        let tok = token(&f, log.run_id());
        let request_id = Uuid::new_v4();

        fn make<'a>(
            request_id: Uuid,
            spec: &'static ToolSpec,
            args: &'a ToolArgs,
            tok: &'a CapabilityToken,
        ) -> DispatchRequest<'a> {
            DispatchRequest {
                request_id,
                spec,
                args,
                idempotency_key: None,
                binding: binding(),
                token: tok,
                deadline: Duration::from_secs(5),
                cancel: CancellationToken::new(),
            }
        }
        // Two dispatches with the same request id: exactly one execution.
        let first = f
            .router
            .dispatch(&mut log, &observation(), make(request_id, spec, &args, &tok))
            .await
            .unwrap();
        let second = f
            .router
            .dispatch(&mut log, &observation(), make(request_id, spec, &args, &tok))
            .await
            .unwrap();
        assert!(!first.cached);
        assert!(second.cached);

        let events = f.store.read_all(log.run_id()).await.unwrap();
        let results = events
            .iter()
            .filter(|e| e.kind == EventKind::ToolResult)
            .count();
        assert_eq!(results, 1);
    }

    #[tokio::test]
    async fn token_for_other_generation_never_reaches_the_bridge() {
        let f = fixture(ScriptedBridge::ok());
        let mut log = run_log(&f.store).await;
        let registry = ToolRegistry::v1();
        let spec = registry.get("browser.click").unwrap();
        let args = spec.validate(&json!({ "handle": "h1" })).unwrap();

        // Token minted against generation 2; dispatch still bound to 1.
        let stale_binding = PageBinding {
            document: DocumentIdentity {
                document_id: "D1".to_string(),
                navigation_generation: 2,
            },
            ..binding()
        };
        let tok = f
            .tokens
            .mint(
                log.run_id(),
                "default",
                &stale_binding,
                vec!["browser.click".to_string()],
                Duration::from_secs(30),
            )
            .unwrap();

        let err = f
            .router
            .dispatch(
                &mut log,
                &observation(),
                DispatchRequest {
                    request_id: Uuid::new_v4(),
                    spec,
                    args: &args,
                    idempotency_key: None,
                    binding: binding(),
                    token: &tok,
                    deadline: Duration::from_secs(5),
                    cancel: CancellationToken::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreErr::BindingMismatch));
        // Nothing was recorded: the failure provably preceded dispatch.
        let events = f.store.read_all(log.run_id()).await.unwrap();
        assert!(events.iter().all(|e| e.kind != EventKind::ToolRequest));
    }

    #[tokio::test]
    async fn executor_failure_is_recorded_with_its_code() {
        let f = fixture(ScriptedBridge {
            executions: AtomicU32::new(0),
            fail_with: Some(ErrorCode::BlockedByOverlay),
            delay: None,
        });
        let mut log = run_log(&f.store).await;
        let registry = ToolRegistry::v1();
        let spec = registry.get("browser.click").unwrap();
        let args = spec.validate(&json!({ "handle": "h1" })).unwrap();
        let tok = token(&f, log.run_id());

        let outcome = f
            .router
            .dispatch(
                &mut log,
                &observation(),
                DispatchRequest {
                    request_id: Uuid::new_v4(),
                    spec,
                    args: &args,
                    idempotency_key: None,
                    binding: binding(),
                    token: &tok,
                    deadline: Duration::from_secs(5),
                    cancel: CancellationToken::new(),
                },
            )
            .await
            .unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.error_code, Some(ErrorCode::BlockedByOverlay));
    }

    #[tokio::test]
    async fn concurrent_mutations_on_one_frame_are_serialized() {
        struct ConcurrencyBridge {
            inflight: AtomicU32,
            max_seen: AtomicU32,
        }

        #[async_trait]
        impl Bridge for ConcurrencyBridge {
            async fn observe(
                &self,
                _envelope: Envelope<BridgeOutMsg>,
                _cancel: CancellationToken,
            ) -> Result<Observation> {
                unreachable!()
            }

            async fn execute(
                &self,
                _envelope: Envelope<BridgeOutMsg>,
                _cancel: CancellationToken,
            ) -> Result<Value> {
                let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.inflight.fetch_sub(1, Ordering::SeqCst);
                Ok(json!({ "clicked": true }))
            }

            async fn require_gesture(
                &self,
                _envelope: Envelope<BridgeOutMsg>,
                _cancel: CancellationToken,
            ) -> Result<()> {
                Ok(())
            }

            async fn emit_ui_state(&self, _state: RunStatePayload) {}
        }

        let dir = tempfile::TempDir::new().unwrap();
        let clock = Clock::system();
        let store = EventStore::open(dir.path(), clock.clone()).unwrap();
        let tokens = Arc::new(TokenService::new(clock.clone()));
        let bridge = Arc::new(ConcurrencyBridge {
            inflight: AtomicU32::new(0),
            max_seen: AtomicU32::new(0),
        });
        let router = Arc::new(ToolRouter::new(
            Arc::clone(&bridge) as Arc<dyn Bridge>,
            Arc::clone(&tokens),
            clock,
        ));

        // Two runs target the same (tab, frame); their mutations must not
        // overlap.
        let registry = ToolRegistry::v1();
        let spec = registry.get("browser.click").unwrap();
        let mut handles = Vec::new();
        for _ in 0..2 {
            let mut log = run_log(&store).await;
            let tok = tokens
                .mint(
                    log.run_id(),
                    "default",
                    &binding(),
                    vec!["browser.click".to_string()],
                    Duration::from_secs(30),
                )
                .unwrap();
            let router = Arc::clone(&router);
            let args = spec.validate(&json!({ "handle": "h1" })).unwrap();
            handles.push(tokio::spawn(async move {
                router
                    .dispatch(
                        &mut log,
                        &observation(),
                        DispatchRequest {
                            request_id: Uuid::new_v4(),
                            spec,
                            args: &args,
                            idempotency_key: None,
                            binding: binding(),
                            token: &tok,
                            deadline: Duration::from_secs(5),
                            cancel: CancellationToken::new(),
                        },
                    )
                    .await
            }));
        }
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            assert!(outcome.ok);
        }
        assert_eq!(bridge.max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_handle_fails_the_precondition_before_dispatch() {
        let f = fixture(ScriptedBridge::ok());
        let mut log = run_log(&f.store).await;
        let registry = ToolRegistry::v1();
        let spec = registry.get("browser.click").unwrap();
        let args = spec.validate(&json!({ "handle": "gone" })).unwrap();
        let tok = token(&f, log.run_id());

        let err = f
            .router
            .dispatch(
                &mut log,
                &observation(),
                DispatchRequest {
                    request_id: Uuid::new_v4(),
                    spec,
                    args: &args,
                    idempotency_key: None,
                    binding: binding(),
                    token: &tok,
                    deadline: Duration::from_secs(5),
                    cancel: CancellationToken::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreErr::StaleHandle(_)));
        assert_eq!(f.router.read_slots_available(), READ_CONCURRENCY);
    }
}
