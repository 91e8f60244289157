//! Shared support for the end-to-end scenario suite: a scripted planner, a
//! mock bridge, and an agent fixture wired over a temp profile directory.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use webpilot_core::Agent;
use webpilot_core::AgentComponents;
use webpilot_core::AgentEvent;
use webpilot_core::Bridge;
use webpilot_core::Clock;
use webpilot_core::Config;
use webpilot_core::ConfigOverrides;
use webpilot_core::CoreErr;
use webpilot_core::EventMsg;
use webpilot_core::EventStore;
use webpilot_core::Planner;
use webpilot_core::error::ErrorCode;
use webpilot_core::planner::PlanInput;
use webpilot_protocol::AccessSignal;
use webpilot_protocol::BoundingBox;
use webpilot_protocol::BridgeOutMsg;
use webpilot_protocol::DocumentIdentity;
use webpilot_protocol::Envelope;
use webpilot_protocol::FormFieldMeta;
use webpilot_protocol::InteractiveElement;
use webpilot_protocol::Mode;
use webpilot_protocol::Observation;
use webpilot_protocol::RunStatePayload;
use webpilot_protocol::TextSegment;

/// Bridge whose observations and tool results are scripted per test.
pub struct MockBridge {
    observations: Mutex<VecDeque<Observation>>,
    /// Returned (cloned) once the queue runs dry.
    default_observation: Mutex<Option<Observation>>,
    tool_results: Mutex<VecDeque<Result<serde_json::Value, CoreErr>>>,
    pub executions: AtomicU32,
    pub gestures: AtomicU32,
    execute_delay: Mutex<Option<Duration>>,
    unavailable: AtomicBool,
    pub ui_states: Mutex<Vec<RunStatePayload>>,
}

impl MockBridge {
    pub fn new() -> Self {
        Self {
            observations: Mutex::new(VecDeque::new()),
            default_observation: Mutex::new(None),
            tool_results: Mutex::new(VecDeque::new()),
            executions: AtomicU32::new(0),
            gestures: AtomicU32::new(0),
            execute_delay: Mutex::new(None),
            unavailable: AtomicBool::new(false),
            ui_states: Mutex::new(Vec::new()),
        }
    }

    pub fn push_observation(&self, obs: Observation) {
        self.observations.lock().unwrap().push_back(obs);
    }

    pub fn set_default_observation(&self, obs: Observation) {
        *self.default_observation.lock().unwrap() = Some(obs);
    }

    pub fn push_tool_result(&self, result: Result<serde_json::Value, CoreErr>) {
        self.tool_results.lock().unwrap().push_back(result);
    }

    pub fn set_execute_delay(&self, delay: Duration) {
        *self.execute_delay.lock().unwrap() = Some(delay);
    }

    pub fn go_unavailable(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Bridge for MockBridge {
    async fn observe(
        &self,
        _envelope: Envelope<BridgeOutMsg>,
        _cancel: CancellationToken,
    ) -> Result<Observation, CoreErr> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoreErr::Unavailable);
        }
        if let Some(obs) = self.observations.lock().unwrap().pop_front() {
            return Ok(obs);
        }
        match self.default_observation.lock().unwrap().clone() {
            Some(obs) => Ok(obs),
            None => Err(CoreErr::Unavailable),
        }
    }

    async fn execute(
        &self,
        _envelope: Envelope<BridgeOutMsg>,
        _cancel: CancellationToken,
    ) -> Result<serde_json::Value, CoreErr> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoreErr::Unavailable);
        }
        self.executions.fetch_add(1, Ordering::SeqCst);
        let delay = *self.execute_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.tool_results.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(serde_json::json!({ "ok": true })),
        }
    }

    async fn require_gesture(
        &self,
        _envelope: Envelope<BridgeOutMsg>,
        _cancel: CancellationToken,
    ) -> Result<(), CoreErr> {
        self.gestures.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn emit_ui_state(&self, state: RunStatePayload) {
        self.ui_states.lock().unwrap().push(state);
    }
}

/// Planner that replays a scripted sequence of raw outputs.
pub struct ScriptedPlanner {
    outputs: Mutex<VecDeque<String>>,
}

impl ScriptedPlanner {
    pub fn new(outputs: Vec<&str>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into_iter().map(str::to_string).collect()),
        }
    }

    pub fn push(&self, output: &str) {
        self.outputs.lock().unwrap().push_back(output.to_string());
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(
        &self,
        _input: PlanInput,
        _deadline: Duration,
        _cancel: CancellationToken,
    ) -> Result<String, CoreErr> {
        Ok(self
            .outputs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| r#"{"document":{"markdown":""},"tool_calls":[]}"#.to_string()))
    }
}

pub struct TestAgent {
    pub agent: Agent,
    pub bridge: Arc<MockBridge>,
    pub planner: Arc<ScriptedPlanner>,
    pub store: EventStore,
    pub clock: Clock,
    pub home: TempDir,
}

pub fn test_config(home: &TempDir, mode: Mode) -> Config {
    let mut config = Config::load(
        home.path(),
        ConfigOverrides {
            mode: Some(mode),
            ..Default::default()
        },
    )
    .unwrap();
    config.planner_deadline = Duration::from_secs(5);
    config.tool_deadline = Duration::from_secs(5);
    config.observe_deadline = Duration::from_secs(5);
    config.max_steps_per_run = 8;
    config
}

pub async fn spawn_agent(mode: Mode, planner_outputs: Vec<&str>) -> TestAgent {
    let home = TempDir::new().unwrap();
    let config = test_config(&home, mode);
    let clock = Clock::system();
    let store = EventStore::open(&config.profile_dir, clock.clone()).unwrap();
    let bridge = Arc::new(MockBridge::new());
    let planner = Arc::new(ScriptedPlanner::new(planner_outputs));
    let (agent, _init) = Agent::spawn(AgentComponents {
        config,
        store: store.clone(),
        bridge: Arc::clone(&bridge) as Arc<dyn Bridge>,
        planner: Arc::clone(&planner) as Arc<dyn Planner>,
        clock: clock.clone(),
    })
    .await
    .unwrap();
    // Consume the SessionConfigured ack.
    let configured = agent.next_event().await.unwrap();
    assert!(matches!(configured.msg, EventMsg::SessionConfigured { .. }));
    TestAgent {
        agent,
        bridge,
        planner,
        store,
        clock,
        home,
    }
}

/// Await the first event satisfying `pred`, ignoring the rest.
pub async fn wait_for<F>(agent: &Agent, mut pred: F) -> AgentEvent
where
    F: FnMut(&EventMsg) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = agent.next_event().await.unwrap();
            if pred(&event.msg) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for agent event")
}

pub fn article_observation(doc_id: &str, nav_gen: u64, text: &str) -> Observation {
    Observation {
        url: "https://news.example/article".to_string(),
        title: "Release notes".to_string(),
        origin: "https://news.example".to_string(),
        document: DocumentIdentity {
            document_id: doc_id.to_string(),
            navigation_generation: nav_gen,
        },
        observed_at: Utc::now(),
        visible_text: vec![TextSegment {
            segment_index: 0,
            text: text.to_string(),
        }],
        interactive: Vec::new(),
        access_signals: Vec::new(),
        redactions: Vec::new(),
    }
}

pub fn button(handle: &str, name: &str) -> InteractiveElement {
    InteractiveElement {
        handle: handle.to_string(),
        role: "button".to_string(),
        accessible_name: name.to_string(),
        bounds: BoundingBox {
            x: 10.0,
            y: 10.0,
            width: 120.0,
            height: 32.0,
        },
        form: None,
        attributes: Vec::new(),
    }
}

pub fn password_input(handle: &str) -> InteractiveElement {
    InteractiveElement {
        handle: handle.to_string(),
        role: "textbox".to_string(),
        accessible_name: "Password".to_string(),
        bounds: BoundingBox {
            x: 10.0,
            y: 48.0,
            width: 200.0,
            height: 32.0,
        },
        form: Some(FormFieldMeta {
            input_type: Some("password".to_string()),
            label: Some("Password".to_string()),
            required: true,
            autocomplete: Some("current-password".to_string()),
            name: Some("password".to_string()),
        }),
        attributes: Vec::new(),
    }
}

pub fn with_elements(mut obs: Observation, elements: Vec<InteractiveElement>) -> Observation {
    obs.interactive = elements;
    obs
}

pub fn with_signals(mut obs: Observation, signals: Vec<AccessSignal>) -> Observation {
    obs.access_signals = signals;
    obs
}

pub fn error_code_name(code: ErrorCode) -> String {
    code.to_string()
}
