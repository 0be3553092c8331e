use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::model::{ModelError, ModelService};

// ========================= Action Vocabulary =========================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn as_str(&self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

/// The nine abstract UI operations the model may request, plus a carrier for
/// kinds this build does not know about. Unknown kinds are logged and skipped
/// by the dispatcher; they never reach the backend.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Screenshot,
    Click { x: i64, y: i64, button: MouseButton },
    DoubleClick { x: i64, y: i64 },
    Type { text: String },
    Scroll { x: i64, y: i64, dx: i64, dy: i64 },
    Wait { duration_ms: u64 },
    Move { x: i64, y: i64 },
    Keypress { keys: Vec<String> },
    Drag { path: Vec<Point> },
    Unknown { kind: String },
}

// ========================= Conversation State =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the conversation. Append-only: a turn is never mutated after
/// it lands in history. Assistant turns keep the raw action payloads exactly
/// as the model sent them so retransmission on later turns is byte-faithful.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: Option<String>,
    pub image_b64: Option<String>,
    pub actions: Vec<Value>,
}

impl Turn {
    pub fn user(text: Option<String>, image_b64: String) -> Self {
        Self {
            role: Role::User,
            text,
            image_b64: Some(image_b64),
            actions: Vec::new(),
        }
    }

    pub fn assistant(text: Option<String>, actions: Vec<Value>) -> Self {
        Self {
            role: Role::Assistant,
            text,
            image_b64: None,
            actions,
        }
    }
}

// ========================= Capability Interface =========================

#[derive(Debug, Error)]
#[error("backend unavailable: {0}")]
pub struct ComputerError(pub String);

impl ComputerError {
    pub fn new(err: impl std::fmt::Display) -> Self {
        Self(err.to_string())
    }
}

/// A controllable visual environment. One implementation per backend; the
/// dispatcher only ever talks through this trait.
///
/// Coordinates are backend pixels and pass through unclamped. `type_text`
/// targets whatever control currently has focus. `keypress` presses each key
/// as a discrete press-and-release, in order (no chord semantics). `drag`
/// with fewer than two points is a no-op. Any operation may fail with
/// `ComputerError` once the underlying connection is gone; that is fatal to
/// the session and never retried here.
#[async_trait]
pub trait Computer: Send + Sync {
    /// Current visual state as an encodable raster (PNG bytes).
    async fn screenshot(&self) -> Result<Vec<u8>, ComputerError>;
    async fn click(&self, x: i64, y: i64, button: MouseButton) -> Result<(), ComputerError>;
    async fn double_click(&self, x: i64, y: i64) -> Result<(), ComputerError>;
    async fn type_text(&self, text: &str) -> Result<(), ComputerError>;
    /// Move the cursor to (x, y), then apply a wheel delta of (dx, dy).
    async fn scroll(&self, x: i64, y: i64, dx: i64, dy: i64) -> Result<(), ComputerError>;
    /// Blocking pause of the calling flow.
    async fn wait(&self, ms: u64) -> Result<(), ComputerError>;
    async fn move_cursor(&self, x: i64, y: i64) -> Result<(), ComputerError>;
    async fn keypress(&self, keys: &[String]) -> Result<(), ComputerError>;
    async fn drag(&self, path: &[Point]) -> Result<(), ComputerError>;
    /// Release the backend connection. Idempotent.
    async fn close(&self) -> Result<(), ComputerError>;
}

// ========================= Policy Seams =========================

pub const DEFAULT_SETTLE: Duration = Duration::from_millis(500);

/// Pause inserted after each executed action so the UI can stabilize before
/// the next action or the next capture. The default is a blind fixed delay;
/// a backend able to report render quiescence can substitute its own signal.
#[async_trait]
pub trait SettlePolicy: Send + Sync {
    async fn settle(&self);
}

pub struct FixedDelay(pub Duration);

impl Default for FixedDelay {
    fn default() -> Self {
        Self(DEFAULT_SETTLE)
    }
}

#[async_trait]
impl SettlePolicy for FixedDelay {
    async fn settle(&self) {
        sleep(self.0).await;
    }
}

/// Chooses which turns go to the model. The default resends everything,
/// images included, every turn; request size grows with turn count. Swapping
/// in a windowing policy touches nothing in the dispatch path.
pub trait HistoryPolicy: Send + Sync {
    fn assemble(&self, turns: &[Turn]) -> Vec<Turn>;
}

pub struct FullHistory;

impl HistoryPolicy for FullHistory {
    fn assemble(&self, turns: &[Turn]) -> Vec<Turn> {
        turns.to_vec()
    }
}

// ========================= Agent Core =========================

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Backend(#[from] ComputerError),
    #[error("model request failed: {0}")]
    Model(#[from] ModelError),
}

/// The turn loop. Owns the capability handle and the conversation; strictly
/// sequential, one turn in flight at a time.
pub struct Agent<C, M>
where
    C: Computer,
    M: ModelService,
{
    computer: C,
    model: M,
    history: Vec<Turn>,
    settle: Box<dyn SettlePolicy>,
    window: Box<dyn HistoryPolicy>,
    artifacts_dir: Option<PathBuf>,
    session_id: String,
    turn_index: usize,
    closed: bool,
}

impl<C, M> Agent<C, M>
where
    C: Computer,
    M: ModelService,
{
    pub fn new(computer: C, model: M) -> Self {
        Self {
            computer,
            model,
            history: Vec::new(),
            settle: Box::new(FixedDelay::default()),
            window: Box::new(FullHistory),
            artifacts_dir: None,
            session_id: nanoid!(),
            turn_index: 0,
            closed: false,
        }
    }

    pub fn with_settle_policy(mut self, settle: Box<dyn SettlePolicy>) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_history_policy(mut self, window: Box<dyn HistoryPolicy>) -> Self {
        self.window = window;
        self
    }

    /// Write each turn's screenshot under `<dir>/<session_id>/turn_NNN.png`.
    pub fn with_artifacts_dir(mut self, dir: PathBuf) -> Self {
        self.artifacts_dir = Some(dir);
        self
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run one full turn: capture, consult the model, execute its actions in
    /// order with a settle pause after each, and return the textual reply
    /// (empty string when the model said nothing).
    ///
    /// On a model failure the just-appended user turn stays in history and
    /// the error propagates; there is no retry or partial-turn recovery.
    pub async fn run_turn(&mut self, instruction: Option<&str>) -> Result<String, AgentError> {
        let png = self.computer.screenshot().await?;
        let image_b64 = B64.encode(&png);
        self.save_artifact(&png).await;

        self.history
            .push(Turn::user(instruction.map(|s| s.to_string()), image_b64));
        self.turn_index += 1;

        let outbound = self.window.assemble(&self.history);
        debug!(turns = outbound.len(), instruction = ?instruction, "sending turn to model");
        let reply = self.model.respond(&outbound).await?;

        info!(
            actions = reply.actions.len(),
            has_text = reply.text.is_some(),
            "model reply"
        );
        for action in &reply.actions {
            self.execute(action).await?;
            self.settle.settle().await;
        }

        let text = reply.text.clone().unwrap_or_default();
        self.history
            .push(Turn::assistant(reply.text, reply.raw_actions));
        Ok(text)
    }

    async fn execute(&self, action: &Action) -> Result<(), ComputerError> {
        debug!(?action, "dispatching action");
        match action {
            Action::Screenshot => {
                // Nothing retains this capture; the next turn takes its own.
                let _ = self.computer.screenshot().await?;
            }
            Action::Click { x, y, button } => self.computer.click(*x, *y, *button).await?,
            Action::DoubleClick { x, y } => self.computer.double_click(*x, *y).await?,
            Action::Type { text } => self.computer.type_text(text).await?,
            Action::Scroll { x, y, dx, dy } => self.computer.scroll(*x, *y, *dx, *dy).await?,
            Action::Wait { duration_ms } => self.computer.wait(*duration_ms).await?,
            Action::Move { x, y } => self.computer.move_cursor(*x, *y).await?,
            Action::Keypress { keys } => self.computer.keypress(keys).await?,
            Action::Drag { path } => {
                if path.len() < 2 {
                    debug!(points = path.len(), "drag path too short, skipping");
                } else {
                    self.computer.drag(path).await?;
                }
            }
            Action::Unknown { kind } => {
                warn!(kind = %kind, "unrecognized action kind, skipping");
            }
        }
        Ok(())
    }

    async fn save_artifact(&self, png: &[u8]) {
        let Some(base) = &self.artifacts_dir else {
            return;
        };
        let dir = base.join(&self.session_id);
        if let Err(e) = async_fs::create_dir_all(&dir).await {
            warn!("artifacts dir: {}", e);
            return;
        }
        let path = dir.join(format!("turn_{:03}.png", self.turn_index));
        match async_fs::write(&path, png).await {
            Ok(()) => info!(path = %path.display(), "screenshot saved"),
            Err(e) => warn!("screenshot save: {}", e),
        }
    }

    /// Release the capability handle. Safe to call more than once; only the
    /// first call reaches the backend.
    pub async fn shutdown(&mut self) -> Result<(), AgentError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.computer.close().await?;
        info!(session = %self.session_id, "session closed");
        Ok(())
    }
}

// ========================= Tests =========================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelReply;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct CallLog(Arc<Mutex<Vec<String>>>);

    impl CallLog {
        fn push(&self, call: impl Into<String>) {
            self.0.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct MockComputer {
        log: CallLog,
        png: Vec<u8>,
    }

    impl MockComputer {
        fn new(log: CallLog) -> Self {
            Self {
                log,
                png: vec![0x89, b'P', b'N', b'G', 1, 2, 3],
            }
        }
    }

    #[async_trait]
    impl Computer for MockComputer {
        async fn screenshot(&self) -> Result<Vec<u8>, ComputerError> {
            self.log.push("screenshot");
            Ok(self.png.clone())
        }

        async fn click(&self, x: i64, y: i64, button: MouseButton) -> Result<(), ComputerError> {
            self.log.push(format!("click({x},{y},{})", button.as_str()));
            Ok(())
        }

        async fn double_click(&self, x: i64, y: i64) -> Result<(), ComputerError> {
            self.log.push(format!("double_click({x},{y})"));
            Ok(())
        }

        async fn type_text(&self, text: &str) -> Result<(), ComputerError> {
            self.log.push(format!("type({text})"));
            Ok(())
        }

        async fn scroll(&self, x: i64, y: i64, dx: i64, dy: i64) -> Result<(), ComputerError> {
            self.log.push(format!("scroll({x},{y},{dx},{dy})"));
            Ok(())
        }

        async fn wait(&self, ms: u64) -> Result<(), ComputerError> {
            self.log.push(format!("wait({ms})"));
            Ok(())
        }

        async fn move_cursor(&self, x: i64, y: i64) -> Result<(), ComputerError> {
            self.log.push(format!("move({x},{y})"));
            Ok(())
        }

        async fn keypress(&self, keys: &[String]) -> Result<(), ComputerError> {
            // One discrete press-and-release per key, in order.
            for key in keys {
                self.log.push(format!("press({key})"));
            }
            Ok(())
        }

        async fn drag(&self, path: &[Point]) -> Result<(), ComputerError> {
            self.log.push(format!("drag({} points)", path.len()));
            Ok(())
        }

        async fn close(&self) -> Result<(), ComputerError> {
            self.log.push("close");
            Ok(())
        }
    }

    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<ModelReply, ModelError>>>,
        seen_lens: Arc<Mutex<Vec<usize>>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<ModelReply, ModelError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                seen_lens: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl ModelService for ScriptedModel {
        async fn respond(&self, turns: &[Turn]) -> Result<ModelReply, ModelError> {
            self.seen_lens.lock().unwrap().push(turns.len());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted model ran out of replies")
        }
    }

    struct CountingSettle(CallLog);

    #[async_trait]
    impl SettlePolicy for CountingSettle {
        async fn settle(&self) {
            self.0.push("settle");
        }
    }

    fn reply(text: Option<&str>, actions: Vec<Action>) -> Result<ModelReply, ModelError> {
        Ok(ModelReply {
            text: text.map(|s| s.to_string()),
            actions,
            raw_actions: Vec::new(),
        })
    }

    fn agent_with(
        replies: Vec<Result<ModelReply, ModelError>>,
    ) -> (
        Agent<MockComputer, ScriptedModel>,
        CallLog,
        Arc<Mutex<Vec<usize>>>,
    ) {
        let log = CallLog::default();
        let model = ScriptedModel::new(replies);
        let seen = model.seen_lens.clone();
        let agent = Agent::new(MockComputer::new(log.clone()), model)
            .with_settle_policy(Box::new(CountingSettle(log.clone())));
        (agent, log, seen)
    }

    #[tokio::test]
    async fn click_then_type_dispatches_in_order() {
        let (mut agent, log, _) = agent_with(vec![reply(
            Some("done"),
            vec![
                Action::Click {
                    x: 100,
                    y: 200,
                    button: MouseButton::Left,
                },
                Action::Type {
                    text: "hello".into(),
                },
            ],
        )]);

        let out = agent.run_turn(Some("click the search box")).await.unwrap();
        assert_eq!(out, "done");
        assert_eq!(
            log.calls(),
            vec![
                "screenshot",
                "click(100,200,left)",
                "settle",
                "type(hello)",
                "settle",
            ]
        );
    }

    #[tokio::test]
    async fn short_drag_path_never_reaches_backend() {
        let (mut agent, log, _) = agent_with(vec![reply(
            None,
            vec![Action::Drag {
                path: vec![Point { x: 10, y: 10 }],
            }],
        )]);

        agent.run_turn(None).await.unwrap();
        assert_eq!(log.calls(), vec!["screenshot", "settle"]);
    }

    #[tokio::test]
    async fn two_point_drag_is_dispatched() {
        let (mut agent, log, _) = agent_with(vec![reply(
            None,
            vec![Action::Drag {
                path: vec![Point { x: 0, y: 0 }, Point { x: 50, y: 60 }],
            }],
        )]);

        agent.run_turn(None).await.unwrap();
        assert_eq!(log.calls(), vec!["screenshot", "drag(2 points)", "settle"]);
    }

    #[tokio::test]
    async fn keypress_is_discrete_per_key() {
        let (mut agent, log, _) = agent_with(vec![reply(
            None,
            vec![Action::Keypress {
                keys: vec!["Control".into(), "a".into()],
            }],
        )]);

        agent.run_turn(None).await.unwrap();
        assert_eq!(
            log.calls(),
            vec!["screenshot", "press(Control)", "press(a)", "settle"]
        );
    }

    #[tokio::test]
    async fn unknown_kind_is_skipped_without_backend_call() {
        let (mut agent, log, _) = agent_with(vec![reply(
            None,
            vec![
                Action::Unknown {
                    kind: "hover".into(),
                },
                Action::Click {
                    x: 1,
                    y: 2,
                    button: MouseButton::Right,
                },
            ],
        )]);

        agent.run_turn(None).await.unwrap();
        assert_eq!(
            log.calls(),
            vec!["screenshot", "settle", "click(1,2,right)", "settle"]
        );
    }

    #[tokio::test]
    async fn wait_action_dispatches_to_backend() {
        let (mut agent, log, _) =
            agent_with(vec![reply(None, vec![Action::Wait { duration_ms: 1200 }])]);

        agent.run_turn(None).await.unwrap();
        assert_eq!(log.calls(), vec!["screenshot", "wait(1200)", "settle"]);
    }

    #[tokio::test]
    async fn history_grows_two_entries_per_turn_and_resends_everything() {
        let (mut agent, _, seen) = agent_with(vec![
            reply(Some("first"), vec![]),
            reply(Some("second"), vec![]),
        ]);

        agent.run_turn(Some("one")).await.unwrap();
        assert_eq!(agent.history().len(), 2);
        agent.run_turn(Some("two")).await.unwrap();
        assert_eq!(agent.history().len(), 4);

        let roles: Vec<Role> = agent.history().iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        // Full resend: the second call carries the two prior turns plus the new one.
        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn omitted_instruction_sends_image_only() {
        let (mut agent, _, _) = agent_with(vec![reply(None, vec![])]);

        let out = agent.run_turn(None).await.unwrap();
        assert_eq!(out, "");
        let turn = &agent.history()[0];
        assert!(turn.text.is_none());
        assert!(turn.image_b64.is_some());
    }

    #[tokio::test]
    async fn encoded_screenshot_round_trips() {
        let (mut agent, _, _) = agent_with(vec![reply(None, vec![])]);

        agent.run_turn(None).await.unwrap();
        let encoded = agent.history()[0].image_b64.as_ref().unwrap();
        let decoded = B64.decode(encoded).unwrap();
        assert_eq!(decoded, vec![0x89, b'P', b'N', b'G', 1, 2, 3]);
    }

    #[tokio::test]
    async fn model_failure_leaves_user_turn_appended() {
        let (mut agent, _, _) =
            agent_with(vec![Err(ModelError::Malformed("no output array".into()))]);

        let err = agent.run_turn(Some("try this")).await.unwrap_err();
        assert!(matches!(err, AgentError::Model(_)));
        assert_eq!(agent.history().len(), 1);
        assert_eq!(agent.history()[0].role, Role::User);
    }

    #[tokio::test]
    async fn shutdown_releases_handle_exactly_once() {
        let (mut agent, log, _) = agent_with(vec![Err(ModelError::Malformed("boom".into()))]);

        let _ = agent.run_turn(Some("x")).await;
        agent.shutdown().await.unwrap();
        agent.shutdown().await.unwrap();

        let closes = log.calls().iter().filter(|c| c.as_str() == "close").count();
        assert_eq!(closes, 1);
    }
}
