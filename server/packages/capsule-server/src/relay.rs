//! Bridges a callback-driven generation to a frame stream.
//!
//! Producers (generator callbacks, the keepalive ticker and the timeout timer)
//! push frames into a bounded channel; the single consumer is the stream handed
//! to the HTTP layer. Exactly one terminal frame is produced per request: every
//! terminal path first wins [`GenerationSession::try_complete`].
//!
//! Two cancellation tokens scope the tasks:
//! - `abort` stops the generation itself (timeout, client gone);
//! - `timers` is a child of `abort` and additionally stops on any terminal frame.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capsule_error::CapsuleError;
use futures::{stream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;

use crate::config::RelayConfig;
use crate::frames::{now_timestamp, ErrorFrameDetails, StreamFrame};
use crate::generator::prompt::build_prompt;
use crate::generator::{CodeGenerator, GenerationInput, GenerationRequest, GenerationResult};
use crate::sandbox::SandboxConnector;
use crate::session::GenerationSession;
use crate::store::{ProjectStatus, ProjectStore, ProjectUpdate};
use crate::usage::{estimate_tokens, UsageTracker};

pub type RelayStream = Pin<Box<dyn Stream<Item = StreamFrame> + Send>>;

/// How long a generator that already delivered its terminal callback may keep
/// running (e.g. waiting for its child process) once the stream is gone.
const GENERATOR_EXIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct GenerationRelay {
    config: RelayConfig,
    sandboxes: Arc<dyn SandboxConnector>,
    generator: Arc<dyn CodeGenerator>,
    usage: Arc<dyn UsageTracker>,
    projects: Arc<dyn ProjectStore>,
}

impl GenerationRelay {
    pub fn new(
        config: RelayConfig,
        sandboxes: Arc<dyn SandboxConnector>,
        generator: Arc<dyn CodeGenerator>,
        usage: Arc<dyn UsageTracker>,
        projects: Arc<dyn ProjectStore>,
    ) -> Self {
        Self {
            config,
            sandboxes,
            generator,
            usage,
            projects,
        }
    }

    /// Starts the generation and returns its frame stream.
    ///
    /// The stream ends right after the terminal frame. Dropping it early
    /// cancels the generation and both timers.
    pub fn start(&self, session: GenerationSession, input: GenerationInput) -> RelayStream {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let abort = CancellationToken::new();
        let timers = abort.child_token();
        let span = tracing::info_span!(
            "generation",
            user_id = %session.user_id,
            project_id = %session.project_id,
            sandbox_id = %session.sandbox_id,
            team_id = ?session.team_id,
            message_id = ?session.message_id,
        );

        let shared = Arc::new(RelayShared {
            session: Arc::new(session),
            tx,
            abort: abort.clone(),
            timers: timers.clone(),
            usage: self.usage.clone(),
            projects: self.projects.clone(),
            config: self.config.clone(),
            preview_url: Mutex::new(None),
            prompt_chars: Mutex::new(0),
            timed_out: AtomicBool::new(false),
        });

        tokio::spawn(run_keepalive(shared.clone()).instrument(span.clone()));
        tokio::spawn(run_timeout(shared.clone()).instrument(span.clone()));
        tokio::spawn(
            drive(
                shared,
                self.sandboxes.clone(),
                self.generator.clone(),
                input,
            )
            .instrument(span),
        );

        frame_stream(rx, abort.drop_guard())
    }
}

struct FrameStreamState {
    rx: mpsc::Receiver<StreamFrame>,
    done: bool,
    _guard: DropGuard,
}

fn frame_stream(rx: mpsc::Receiver<StreamFrame>, guard: DropGuard) -> RelayStream {
    let state = FrameStreamState {
        rx,
        done: false,
        _guard: guard,
    };
    Box::pin(stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        let frame = state.rx.recv().await?;
        if frame.is_terminal() {
            state.done = true;
        }
        Some((frame, state))
    })
    .fuse())
}

#[derive(Debug)]
struct RelayShared {
    session: Arc<GenerationSession>,
    tx: mpsc::Sender<StreamFrame>,
    abort: CancellationToken,
    timers: CancellationToken,
    usage: Arc<dyn UsageTracker>,
    projects: Arc<dyn ProjectStore>,
    config: RelayConfig,
    preview_url: Mutex<Option<String>>,
    prompt_chars: Mutex<u64>,
    timed_out: AtomicBool,
}

impl RelayShared {
    async fn send(&self, frame: StreamFrame) {
        let kind = frame.kind();
        if self.tx.send(frame).await.is_err() {
            tracing::debug!(frame = kind, "stream closed, dropping frame");
            return;
        }
        self.session.touch();
    }

    /// Sends a non-terminal frame. Gives up as soon as the session finishes,
    /// including while waiting for channel capacity.
    async fn emit(&self, frame: StreamFrame) {
        let kind = frame.kind();
        if self.session.is_completed() {
            tracing::debug!(frame = kind, "session complete, dropping frame");
            return;
        }
        tokio::select! {
            biased;
            _ = self.timers.cancelled() => {
                tracing::debug!(frame = kind, "session complete, dropping frame");
            }
            _ = self.send(frame) => {}
        }
    }

    fn error_details(&self) -> ErrorFrameDetails {
        ErrorFrameDetails {
            project_id: self.session.project_id.clone(),
            sandbox_id: Some(self.session.sandbox_id.clone()),
            message_id: self.session.message_id.clone(),
            message_count: self.session.message_count(),
            elapsed_ms: self.session.elapsed().as_millis() as u64,
        }
    }

    fn preview_url(&self) -> Option<String> {
        self.preview_url.lock().ok().and_then(|url| url.clone())
    }

    fn tokens_used(&self, result: &GenerationResult) -> u64 {
        match result.usage {
            Some(usage) => usage.total(),
            None => {
                let prompt_chars = self.prompt_chars.lock().map(|chars| *chars).unwrap_or(0);
                estimate_tokens(prompt_chars + self.session.relayed_chars())
            }
        }
    }

    async fn complete(self: &Arc<Self>, result: GenerationResult) {
        if !self.session.try_complete() {
            tracing::warn!("completion after terminal frame ignored");
            return;
        }
        self.timers.cancel();
        let shared = self.clone();
        run_detached(async move { shared.finish_completion(result).await }).await;
    }

    async fn finish_completion(&self, result: GenerationResult) {
        let session = &self.session;
        let tokens = self.tokens_used(&result);
        let file_count = result.files_changed.len() as u64;

        if let Err(err) = self
            .usage
            .track_token_usage(&session.user_id, tokens, &self.config.model, &session.project_id)
            .await
        {
            tracing::warn!(error = %err, "failed to track token usage");
        }
        if let Err(err) = self
            .usage
            .track_code_generation(&session.user_id, &session.project_id, file_count, tokens)
            .await
        {
            tracing::warn!(error = %err, "failed to track code generation");
        }

        let update = ProjectUpdate {
            conversation_id: result.session_id.clone(),
            status: Some(ProjectStatus::Ready),
        };
        if let Err(err) = self.projects.update(&session.project_id, update).await {
            tracing::warn!(error = %err, "failed to persist conversation id");
        }

        tracing::info!(
            messages = session.message_count(),
            tokens,
            files = file_count,
            turns = ?result.num_turns,
            cost_usd = ?result.cost_usd,
            elapsed_ms = session.elapsed().as_millis() as u64,
            "generation completed"
        );

        self.send(StreamFrame::Completion {
            session_id: result.session_id,
            result: result.result,
            message_count: session.message_count(),
            tokens_used: tokens,
            files_changed: result.files_changed,
            preview_url: self.preview_url(),
            timestamp: now_timestamp(),
        })
        .await;
    }

    /// Emits the terminal error frame if nothing terminated the session yet.
    async fn fail(self: &Arc<Self>, message: String) {
        if !self.session.try_complete() {
            tracing::debug!(error = %message, "error after terminal frame ignored");
            return;
        }
        self.timers.cancel();
        let shared = self.clone();
        run_detached(async move { shared.finish_failure(message).await }).await;
    }

    /// Stops the generation before queueing the error frame, so a client that
    /// stopped reading cannot keep it running.
    async fn time_out(&self) {
        if !self.session.try_complete() {
            return;
        }
        self.timed_out.store(true, Ordering::SeqCst);
        self.abort.cancel();
        let err = CapsuleError::timeout(format!(
            "Stream timeout: generation did not complete within {}",
            self.config.timeout_label()
        ));
        self.finish_failure(err.client_message()).await;
    }

    async fn finish_failure(&self, message: String) {
        tracing::warn!(
            error = %message,
            messages = self.session.message_count(),
            elapsed_ms = self.session.elapsed().as_millis() as u64,
            "generation failed"
        );

        let update = ProjectUpdate {
            conversation_id: None,
            status: Some(ProjectStatus::Failed),
        };
        if let Err(err) = self.projects.update(&self.session.project_id, update).await {
            tracing::warn!(error = %err, "failed to record project failure");
        }

        self.send(StreamFrame::error(message, self.error_details())).await;
    }
}

/// Runs terminal bookkeeping on its own task. The caller may be the generator
/// task, which `drive` aborts once the stream is gone.
async fn run_detached(work: impl Future<Output = ()> + Send + 'static) {
    let handle = tokio::spawn(work.instrument(tracing::Span::current()));
    if let Err(err) = handle.await {
        tracing::warn!(error = %err, "terminal bookkeeping task failed");
    }
}

/// Handle given to a [`CodeGenerator`] to report progress.
#[derive(Debug, Clone)]
pub struct GenerationCallbacks {
    shared: Arc<RelayShared>,
}

impl GenerationCallbacks {
    pub async fn on_message(&self, text: impl Into<String>) {
        let text = text.into();
        if self.shared.session.is_completed() {
            return;
        }
        self.shared.session.record_message(&text);
        self.shared.emit(StreamFrame::message(text)).await;
    }

    pub async fn on_complete(&self, result: GenerationResult) {
        self.shared.complete(result).await;
    }

    pub async fn on_error(&self, message: impl Into<String>) {
        self.shared.fail(message.into()).await;
    }

    pub fn is_completed(&self) -> bool {
        self.shared.session.is_completed()
    }
}

async fn run_keepalive(shared: Arc<RelayShared>) {
    let interval = shared.config.keepalive_interval;
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shared.timers.cancelled() => break,
            _ = ticker.tick() => {
                if shared.session.is_completed() {
                    break;
                }
                if shared.session.idle_for() >= interval {
                    tracing::trace!("sending keepalive");
                    shared.emit(StreamFrame::keepalive()).await;
                }
            }
        }
    }
}

async fn run_timeout(shared: Arc<RelayShared>) {
    tokio::select! {
        biased;
        _ = shared.timers.cancelled() => {}
        _ = sleep(shared.config.stream_timeout) => shared.time_out().await,
    }
}

async fn drive(
    shared: Arc<RelayShared>,
    sandboxes: Arc<dyn SandboxConnector>,
    generator: Arc<dyn CodeGenerator>,
    input: GenerationInput,
) {
    let session = shared.session.clone();

    let handle = tokio::select! {
        _ = shared.abort.cancelled() => return,
        connected = sandboxes.connect(&session.sandbox_id) => match connected {
            Ok(handle) => handle,
            Err(err) => {
                shared.fail(connect_error_message(&err)).await;
                return;
            }
        },
    };

    let preview_url = handle.host(shared.config.preview_port);
    if let Ok(mut slot) = shared.preview_url.lock() {
        *slot = Some(preview_url.clone());
    }
    let prompt = build_prompt(&input, &preview_url);
    if let Ok(mut chars) = shared.prompt_chars.lock() {
        *chars = prompt.chars().count() as u64;
    }

    let request = GenerationRequest {
        prompt,
        user_message: input.user_message,
        conversation_id: session.conversation_id.clone(),
        sandbox: handle,
        preview_url,
    };
    let callbacks = GenerationCallbacks {
        shared: shared.clone(),
    };

    tracing::info!(resume = request.conversation_id.is_some(), "starting generation");
    let mut task = tokio::spawn(
        async move { generator.generate(request, callbacks).await }
            .instrument(tracing::Span::current()),
    );

    tokio::select! {
        joined = &mut task => {
            let message = match joined {
                Ok(Ok(())) => {
                    if session.is_completed() {
                        return;
                    }
                    "Generation ended without a completion event".to_string()
                }
                Ok(Err(err)) => err.client_message(),
                Err(err) if err.is_panic() => "Generation task panicked".to_string(),
                Err(err) => format!("Generation task cancelled: {err}"),
            };
            shared.fail(message).await;
        }
        _ = shared.abort.cancelled() => {
            // After a completion or error callback the generator may still be
            // reaping its child process.
            if session.is_completed() && !shared.timed_out.load(Ordering::SeqCst) {
                if timeout(GENERATOR_EXIT_GRACE, &mut task).await.is_ok() {
                    tracing::debug!("generator exited after stream closed");
                    return;
                }
            }
            task.abort();
            tracing::debug!("generation aborted");
        }
    }
}

fn connect_error_message(err: &CapsuleError) -> String {
    match err {
        CapsuleError::SandboxNotFound { sandbox_id } => {
            format!("Sandbox {sandbox_id} not found")
        }
        other => other.client_message(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::StreamExt;

    use crate::generator::{MockGenerator, MockOutcome, TokenUsage};
    use crate::sandbox::{SandboxHandle, StaticSandboxConnector};
    use crate::store::{InMemoryProjectStore, ProjectRecord};
    use crate::usage::{InMemoryUsageTracker, UsageTotals};

    struct Harness {
        relay: GenerationRelay,
        usage: Arc<InMemoryUsageTracker>,
        projects: Arc<InMemoryProjectStore>,
    }

    fn harness(generator: impl CodeGenerator + 'static, config: RelayConfig) -> Harness {
        harness_with_sandboxes(generator, config, Arc::new(StaticSandboxConnector::default()))
    }

    fn harness_with_sandboxes(
        generator: impl CodeGenerator + 'static,
        config: RelayConfig,
        sandboxes: Arc<dyn SandboxConnector>,
    ) -> Harness {
        let usage = Arc::new(InMemoryUsageTracker::new());
        let projects = Arc::new(InMemoryProjectStore::with_projects([ProjectRecord::new(
            "proj_1", "user_1",
        )
        .with_sandbox("sbx_1")]));
        let relay = GenerationRelay::new(
            config,
            sandboxes,
            Arc::new(generator),
            usage.clone(),
            projects.clone(),
        );
        Harness {
            relay,
            usage,
            projects,
        }
    }

    fn session() -> GenerationSession {
        GenerationSession::new("user_1", "proj_1", "sbx_1")
    }

    fn input(message: &str) -> GenerationInput {
        GenerationInput {
            user_message: message.to_string(),
            ..Default::default()
        }
    }

    fn kinds(frames: &[StreamFrame]) -> Vec<&'static str> {
        frames.iter().map(StreamFrame::kind).collect()
    }

    fn terminal_count(frames: &[StreamFrame]) -> usize {
        frames.iter().filter(|frame| frame.is_terminal()).count()
    }

    #[tokio::test]
    async fn messages_then_single_completion() {
        let generator = MockGenerator::new(["one", "two", "three"])
            .with_delay(Duration::ZERO)
            .with_session_id(Some("conv_1".to_string()));
        let h = harness(generator, RelayConfig::default());

        let frames: Vec<_> = h.relay.start(session(), input("build")).collect().await;

        assert_eq!(kinds(&frames), vec!["message", "message", "message", "completion"]);
        let StreamFrame::Completion {
            session_id,
            message_count,
            preview_url,
            ..
        } = &frames[3]
        else {
            panic!("expected completion, got {:?}", frames[3]);
        };
        assert_eq!(session_id.as_deref(), Some("conv_1"));
        assert_eq!(*message_count, 3);
        assert_eq!(preview_url.as_deref(), Some("https://8081-sbx_1.e2b.app"));

        let project = h.projects.get("proj_1").await.expect("get").expect("project");
        assert_eq!(project.conversation_id.as_deref(), Some("conv_1"));
        assert_eq!(project.status, ProjectStatus::Ready);
    }

    #[tokio::test]
    async fn reported_usage_is_tracked() {
        let generator = MockGenerator::new(["hi"])
            .with_delay(Duration::ZERO)
            .with_files_changed(["a.tsx", "b.tsx"])
            .with_usage(TokenUsage {
                input_tokens: 70,
                output_tokens: 30,
            });
        let h = harness(generator, RelayConfig::default());

        let frames: Vec<_> = h.relay.start(session(), input("x")).collect().await;
        let Some(StreamFrame::Completion { tokens_used, .. }) = frames.last() else {
            panic!("expected completion");
        };
        assert_eq!(*tokens_used, 100);

        let totals = h.usage.totals("user_1").await;
        assert_eq!(totals.tokens, 100);
        assert_eq!(totals.generations, 1);
        assert_eq!(totals.files_generated, 2);
    }

    #[tokio::test]
    async fn usage_is_estimated_without_report() {
        let generator = MockGenerator::new(["abcdefgh"]).with_delay(Duration::ZERO);
        let h = harness(generator, RelayConfig::default());

        let frames: Vec<_> = h.relay.start(session(), input("x")).collect().await;
        let Some(StreamFrame::Completion { tokens_used, .. }) = frames.last() else {
            panic!("expected completion");
        };
        assert!(*tokens_used > 2, "prompt and message chars are both counted");
        assert_eq!(h.usage.totals("user_1").await.tokens, *tokens_used);
    }

    #[tokio::test]
    async fn generator_error_yields_single_error_frame() {
        let generator = MockGenerator::new(["working"])
            .with_delay(Duration::ZERO)
            .with_outcome(MockOutcome::Error("model overloaded".to_string()));
        let h = harness(generator, RelayConfig::default());

        let frames: Vec<_> = h.relay.start(session(), input("x")).collect().await;
        assert_eq!(kinds(&frames), vec!["message", "error"]);
        let StreamFrame::Error { error, details, .. } = &frames[1] else {
            panic!("expected error frame");
        };
        assert_eq!(error, "model overloaded");
        assert_eq!(details.project_id, "proj_1");
        assert_eq!(details.message_count, 1);

        let project = h.projects.get("proj_1").await.expect("get").expect("project");
        assert_eq!(project.status, ProjectStatus::Failed);
        assert_eq!(h.usage.totals("user_1").await.generations, 0);
    }

    #[tokio::test]
    async fn thrown_error_becomes_error_frame() {
        let generator = MockGenerator::new(Vec::<String>::new())
            .with_delay(Duration::ZERO)
            .with_outcome(MockOutcome::Throw("spawn failed".to_string()));
        let h = harness(generator, RelayConfig::default());

        let frames: Vec<_> = h.relay.start(session(), input("x")).collect().await;
        assert_eq!(kinds(&frames), vec!["error"]);
        let StreamFrame::Error { error, .. } = &frames[0] else {
            panic!("expected error frame");
        };
        assert!(error.contains("spawn failed"));
    }

    #[tokio::test]
    async fn silent_stop_still_terminates() {
        let generator = MockGenerator::new(["a", "b"])
            .with_delay(Duration::ZERO)
            .with_outcome(MockOutcome::Stop);
        let h = harness(generator, RelayConfig::default());

        let frames: Vec<_> = h.relay.start(session(), input("x")).collect().await;
        assert_eq!(kinds(&frames), vec!["message", "message", "error"]);
    }

    #[derive(Debug)]
    struct PanickingGenerator;

    #[async_trait]
    impl CodeGenerator for PanickingGenerator {
        async fn generate(
            &self,
            _request: GenerationRequest,
            callbacks: GenerationCallbacks,
        ) -> Result<(), CapsuleError> {
            callbacks.on_message("before panic").await;
            panic!("generator bug");
        }
    }

    #[tokio::test]
    async fn panicking_generator_terminates_with_error() {
        let h = harness(PanickingGenerator, RelayConfig::default());
        let frames: Vec<_> = h.relay.start(session(), input("x")).collect().await;
        assert_eq!(kinds(&frames), vec!["message", "error"]);
    }

    #[derive(Debug)]
    struct DoubleTerminalGenerator;

    #[async_trait]
    impl CodeGenerator for DoubleTerminalGenerator {
        async fn generate(
            &self,
            _request: GenerationRequest,
            callbacks: GenerationCallbacks,
        ) -> Result<(), CapsuleError> {
            callbacks.on_complete(GenerationResult::default()).await;
            callbacks.on_error("late failure").await;
            callbacks.on_message("late message").await;
            callbacks.on_complete(GenerationResult::default()).await;
            Err(CapsuleError::generation_failed("late throw"))
        }
    }

    #[tokio::test]
    async fn only_first_terminal_callback_counts() {
        let h = harness(DoubleTerminalGenerator, RelayConfig::default());
        let frames: Vec<_> = h.relay.start(session(), input("x")).collect().await;
        assert_eq!(kinds(&frames), vec!["completion"]);
        assert_eq!(h.usage.totals("user_1").await.generations, 1);
    }

    #[derive(Debug)]
    struct MissingSandbox;

    #[async_trait]
    impl SandboxConnector for MissingSandbox {
        async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle, CapsuleError> {
            Err(CapsuleError::SandboxNotFound {
                sandbox_id: sandbox_id.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn sandbox_connect_failure_is_an_error_frame() {
        let h = harness_with_sandboxes(
            MockGenerator::default(),
            RelayConfig::default(),
            Arc::new(MissingSandbox),
        );
        let frames: Vec<_> = h.relay.start(session(), input("x")).collect().await;
        assert_eq!(kinds(&frames), vec!["error"]);
        let StreamFrame::Error { error, .. } = &frames[0] else {
            panic!("expected error frame");
        };
        assert_eq!(error, "Sandbox sbx_1 not found");
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_sent_while_idle() {
        let generator = MockGenerator::new(["slow"]).with_delay(Duration::from_secs(75));
        let h = harness(generator, RelayConfig::default());

        let frames: Vec<_> = h.relay.start(session(), input("x")).collect().await;
        assert_eq!(
            kinds(&frames),
            vec!["keepalive", "keepalive", "message", "completion"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn activity_defers_keepalive() {
        let generator = MockGenerator::new(["a", "b", "c", "d"]).with_delay(Duration::from_secs(20));
        let h = harness(generator, RelayConfig::default());

        let frames: Vec<_> = h.relay.start(session(), input("x")).collect().await;
        assert_eq!(
            kinds(&frames),
            vec!["message", "message", "message", "message", "completion"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_emits_error_and_closes() {
        let generator = MockGenerator::new(["started"])
            .with_delay(Duration::ZERO)
            .with_outcome(MockOutcome::Hang);
        let h = harness(generator, RelayConfig::default());

        let frames: Vec<_> = h.relay.start(session(), input("x")).collect().await;

        assert_eq!(frames.first().map(StreamFrame::kind), Some("message"));
        assert_eq!(terminal_count(&frames), 1);
        let Some(StreamFrame::Error { error, .. }) = frames.last() else {
            panic!("expected trailing error frame");
        };
        assert_eq!(
            error,
            "Stream timeout: generation did not complete within 15 minutes"
        );
        // 15 minutes of idling at a 30 second cadence.
        let keepalives = frames.iter().filter(|f| f.kind() == "keepalive").count();
        assert!(keepalives >= 28, "got {keepalives} keepalives");
    }

    fn relay_shared(config: RelayConfig) -> (Arc<RelayShared>, mpsc::Receiver<StreamFrame>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let abort = CancellationToken::new();
        let shared = Arc::new(RelayShared {
            session: Arc::new(session()),
            tx,
            timers: abort.child_token(),
            abort,
            usage: Arc::new(InMemoryUsageTracker::new()),
            projects: Arc::new(InMemoryProjectStore::default()),
            config,
            preview_url: Mutex::new(None),
            prompt_chars: Mutex::new(0),
            timed_out: AtomicBool::new(false),
        });
        (shared, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn no_keepalive_after_completion() {
        let (shared, mut rx) = relay_shared(RelayConfig::default());
        tokio::spawn(run_keepalive(shared.clone()));

        sleep(Duration::from_secs(31)).await;
        assert_eq!(rx.try_recv().ok().map(|f| f.kind()), Some("keepalive"));

        shared.complete(GenerationResult::default()).await;
        sleep(Duration::from_secs(120)).await;

        assert_eq!(rx.try_recv().ok().map(|f| f.kind()), Some("completion"));
        assert!(rx.try_recv().is_err(), "nothing may follow the terminal frame");
    }

    #[tokio::test]
    async fn finished_stream_keeps_returning_none() {
        let generator = MockGenerator::new(["done"]).with_delay(Duration::ZERO);
        let h = harness(generator, RelayConfig::default());

        let mut stream = h.relay.start(session(), input("x"));
        let mut frames = Vec::new();
        while let Some(frame) = stream.next().await {
            frames.push(frame);
        }
        assert_eq!(kinds(&frames), vec!["message", "completion"]);
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }

    /// Sets a flag when the generator future is dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Debug)]
    struct ChattyHangingGenerator {
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl CodeGenerator for ChattyHangingGenerator {
        async fn generate(
            &self,
            _request: GenerationRequest,
            callbacks: GenerationCallbacks,
        ) -> Result<(), CapsuleError> {
            let _flag = DropFlag(self.dropped.clone());
            for index in 0..10 {
                callbacks.on_message(format!("chunk {index}")).await;
            }
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_stops_generation_when_client_stops_reading() {
        let dropped = Arc::new(AtomicBool::new(false));
        let config = RelayConfig {
            channel_capacity: 2,
            ..RelayConfig::default()
        }
        .with_stream_timeout(Duration::from_secs(60));
        let h = harness(
            ChattyHangingGenerator {
                dropped: dropped.clone(),
            },
            config,
        );

        // Held but never polled: the channel fills and every send blocks.
        let _stream = h.relay.start(session(), input("x"));
        sleep(Duration::from_secs(120)).await;

        assert!(dropped.load(Ordering::SeqCst), "generator still running");
        let project = h.projects.get("proj_1").await.expect("get").expect("project");
        assert_eq!(project.status, ProjectStatus::Failed);
    }

    #[derive(Debug)]
    struct SlowUsageTracker {
        inner: InMemoryUsageTracker,
    }

    #[async_trait]
    impl UsageTracker for SlowUsageTracker {
        async fn track_token_usage(
            &self,
            user_id: &str,
            tokens: u64,
            model: &str,
            project_id: &str,
        ) -> Result<(), CapsuleError> {
            sleep(Duration::from_secs(10)).await;
            self.inner
                .track_token_usage(user_id, tokens, model, project_id)
                .await
        }

        async fn track_code_generation(
            &self,
            user_id: &str,
            project_id: &str,
            file_count: u64,
            tokens: u64,
        ) -> Result<(), CapsuleError> {
            self.inner
                .track_code_generation(user_id, project_id, file_count, tokens)
                .await
        }

        async fn user_totals(&self, user_id: &str) -> Result<UsageTotals, CapsuleError> {
            self.inner.user_totals(user_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completion_bookkeeping_survives_disconnect() {
        let usage = Arc::new(SlowUsageTracker {
            inner: InMemoryUsageTracker::new(),
        });
        let projects = Arc::new(InMemoryProjectStore::with_projects([ProjectRecord::new(
            "proj_1", "user_1",
        )
        .with_sandbox("sbx_1")]));
        let relay = GenerationRelay::new(
            RelayConfig::default(),
            Arc::new(StaticSandboxConnector::default()),
            Arc::new(
                MockGenerator::new(Vec::<String>::new())
                    .with_delay(Duration::ZERO)
                    .with_session_id(Some("conv_9".to_string())),
            ),
            usage.clone(),
            projects.clone(),
        );

        let stream = relay.start(session(), input("x"));
        sleep(Duration::from_secs(1)).await;
        drop(stream);
        sleep(Duration::from_secs(60)).await;

        let project = projects.get("proj_1").await.expect("get").expect("project");
        assert_eq!(project.status, ProjectStatus::Ready);
        assert_eq!(project.conversation_id.as_deref(), Some("conv_9"));
        assert_eq!(usage.inner.totals("user_1").await.generations, 1);
    }

    #[derive(Debug)]
    struct LingeringGenerator {
        exited: Arc<AtomicBool>,
    }

    #[async_trait]
    impl CodeGenerator for LingeringGenerator {
        async fn generate(
            &self,
            _request: GenerationRequest,
            callbacks: GenerationCallbacks,
        ) -> Result<(), CapsuleError> {
            callbacks.on_complete(GenerationResult::default()).await;
            // Stands in for reaping a child process after the result event.
            sleep(Duration::from_secs(1)).await;
            self.exited.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn generator_may_exit_after_completion() {
        let exited = Arc::new(AtomicBool::new(false));
        let h = harness(
            LingeringGenerator {
                exited: exited.clone(),
            },
            RelayConfig::default(),
        );

        let frames: Vec<_> = h.relay.start(session(), input("x")).collect().await;
        assert_eq!(kinds(&frames), vec!["completion"]);
        sleep(Duration::from_secs(10)).await;
        assert!(exited.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_stream_cancels_generation() {
        let generator = MockGenerator::new(["one"])
            .with_delay(Duration::ZERO)
            .with_outcome(MockOutcome::Hang);
        let h = harness(generator, RelayConfig::default());

        let mut stream = h.relay.start(session(), input("x"));
        assert_eq!(stream.next().await.map(|f| f.kind()), Some("message"));
        drop(stream);
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(16 * 60)).await;
        tokio::task::yield_now().await;
        let project = h.projects.get("proj_1").await.expect("get").expect("project");
        assert_eq!(project.status, ProjectStatus::Idle);
    }
}
