//! Controller scenarios driven by scripted worker events.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use hearth_types::{
    AccessToken, Capability, ChatMessage, FailureKind, GenerationId, LoadErrorKind, LoadProgress,
    ModelSpec, Role,
};
use hearth_worker::{WorkerEvent, WorkerGone, WorkerPort, WorkerRequest};

use super::*;

#[derive(Clone, Default)]
struct RecordingPort {
    sent: Rc<RefCell<Vec<WorkerRequest>>>,
    gone: Rc<Cell<bool>>,
}

impl RecordingPort {
    fn take(&self) -> Vec<WorkerRequest> {
        self.sent.borrow_mut().drain(..).collect()
    }
}

impl WorkerPort for RecordingPort {
    fn send(&self, request: WorkerRequest) -> Result<(), WorkerGone> {
        if self.gone.get() {
            return Err(WorkerGone);
        }
        self.sent.borrow_mut().push(request);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RecordingRenderer {
    frames: Rc<RefCell<Vec<Vec<String>>>>,
    states: Rc<RefCell<Vec<&'static str>>>,
}

impl RecordingRenderer {
    fn frame_count(&self) -> usize {
        self.frames.borrow().len()
    }
}

impl Renderer for RecordingRenderer {
    fn render(&mut self, turns: &[Turn]) {
        let frame = turns
            .iter()
            .map(|turn| turn.display_text().into_owned())
            .collect();
        self.frames.borrow_mut().push(frame);
    }

    fn state_changed(&mut self, state: &SessionState) {
        self.states.borrow_mut().push(state.name());
    }
}

struct Harness {
    controller: SessionController,
    port: RecordingPort,
    renderer: RecordingRenderer,
}

impl Harness {
    fn new() -> Self {
        Self::with(|builder| builder)
    }

    fn with(configure: impl FnOnce(ControllerBuilder) -> ControllerBuilder) -> Self {
        let port = RecordingPort::default();
        let renderer = RecordingRenderer::default();
        let builder = SessionController::builder("org/tiny")
            .worker(port.clone())
            .renderer(renderer.clone());
        let controller = configure(builder).build().expect("all collaborators set");
        Self {
            controller,
            port,
            renderer,
        }
    }

    /// Drive the startup handshake through to `Ready`.
    fn ready(mut self) -> Self {
        self.controller.start().unwrap();
        self.event(WorkerEvent::CapabilityResult {
            capability: Capability::Supported {
                adapter: "test".to_string(),
            },
        });
        self.event(WorkerEvent::Ready);
        assert_eq!(self.controller.state(), &SessionState::Ready);
        self.port.take();
        self
    }

    fn event(&mut self, event: WorkerEvent) {
        self.controller.handle_event(event);
    }

    fn fragment(&mut self, id: GenerationId, text: &str) {
        self.event(WorkerEvent::Fragment {
            id,
            text: text.to_string(),
        });
    }

    fn complete(&mut self, id: GenerationId, text: &str) {
        self.event(WorkerEvent::Complete {
            id,
            text: text.to_string(),
        });
    }

    fn exchange(&mut self, question: &str, answer: &str) {
        let id = self.controller.submit(question).unwrap();
        self.event(WorkerEvent::Started { id });
        self.complete(id, answer);
    }

    fn transcript(&self) -> Vec<String> {
        self.controller
            .transcript()
            .iter()
            .map(|turn| turn.display_text().into_owned())
            .collect()
    }
}

fn draft(controller: &SessionController) -> SettingsDraft {
    SettingsDraft::from_settings(controller.settings())
}

fn load_spec(request: &WorkerRequest) -> &ModelSpec {
    match request {
        WorkerRequest::Load { spec } => spec,
        other => panic!("expected load, got {other:?}"),
    }
}

#[test]
fn builder_requires_collaborators() {
    let err = SessionController::builder("org/tiny")
        .renderer(RecordingRenderer::default())
        .build()
        .unwrap_err();
    assert_eq!(err, ControllerError::MissingCollaborator("worker port"));

    let err = SessionController::builder("org/tiny")
        .worker(RecordingPort::default())
        .build()
        .unwrap_err();
    assert_eq!(err, ControllerError::MissingCollaborator("renderer"));
}

#[test]
fn startup_checks_capability_then_loads() {
    let mut h = Harness::new();
    assert_eq!(h.controller.affordance().label, "Configure Settings");

    h.controller.start().unwrap();
    assert!(matches!(h.port.take().as_slice(), [WorkerRequest::Check]));
    assert_eq!(h.controller.state(), &SessionState::CheckingCapability);

    h.event(WorkerEvent::CapabilityResult {
        capability: Capability::Supported {
            adapter: "gpu0".to_string(),
        },
    });
    let sent = h.port.take();
    assert_eq!(load_spec(&sent[0]).id, "org/tiny");
    assert!(h.controller.banner().unwrap().text().contains("gpu0"));

    h.event(WorkerEvent::Progress {
        loaded: 10,
        total: Some(40),
    });
    assert_eq!(
        h.controller.state(),
        &SessionState::LoadingModel(LoadProgress::new(10, Some(40)))
    );
    h.event(WorkerEvent::Loading {
        note: "Compiling shaders and warming up model...".to_string(),
    });
    assert_eq!(
        h.controller.banner().unwrap().text(),
        "Compiling shaders and warming up model..."
    );

    h.event(WorkerEvent::Ready);
    assert_eq!(h.controller.state(), &SessionState::Ready);
    assert!(h.controller.affordance().enabled);
    assert_eq!(
        *h.renderer.states.borrow(),
        [
            "checking_capability",
            "loading_model",
            "loading_model",
            "ready"
        ]
    );
}

#[test]
fn start_twice_is_invalid() {
    let mut h = Harness::new().ready();
    assert!(matches!(
        h.controller.start(),
        Err(ControllerError::InvalidState { action: "start", .. })
    ));
    assert!(h.port.take().is_empty());
}

#[test]
fn unsupported_capability_is_fatal() {
    let mut h = Harness::new();
    h.controller.start().unwrap();
    h.event(WorkerEvent::CapabilityResult {
        capability: Capability::Unsupported {
            reason: "no adapter".to_string(),
        },
    });

    match h.controller.state() {
        SessionState::Failed(failure) => {
            assert_eq!(failure.kind, FailureKind::CapabilityUnsupported);
        }
        other => panic!("unexpected state: {other:?}"),
    }
    assert_eq!(h.controller.affordance().label, "Error Occurred");
    assert!(h.controller.banner().unwrap().is_error());
    assert!(h.controller.retry().is_err());
    assert!(h.controller.save_settings(draft(&h.controller)).is_err());
    assert!(h.controller.submit("hello").is_err());
}

#[test]
fn submit_hello_streams_into_transcript() {
    let mut h = Harness::new().ready();
    let frames_before = h.renderer.frame_count();

    let id = h.controller.submit("  hello ").unwrap();
    assert_eq!(h.controller.state(), &SessionState::Generating);
    assert!(h.controller.affordance().interrupt_visible);

    match h.port.take().as_slice() {
        [
            WorkerRequest::Generate {
                id: sent,
                messages,
                temperature,
                top_k,
                max_new_tokens,
            },
        ] => {
            assert_eq!(*sent, id);
            assert_eq!(
                messages,
                &[
                    ChatMessage::system("You are a helpful assistant."),
                    ChatMessage::user("hello"),
                ]
            );
            assert!((temperature.value() - 0.7).abs() < f64::EPSILON);
            assert_eq!(top_k.value(), 50);
            assert_eq!(*max_new_tokens, 1024);
        }
        other => panic!("unexpected requests: {other:?}"),
    }

    // Placeholder is visible before the worker acknowledges.
    assert_eq!(h.transcript(), ["hello", ""]);

    h.event(WorkerEvent::Started { id });
    h.fragment(id, "Hi");
    h.fragment(id, " there");
    assert_eq!(h.transcript(), ["hello", "Hi there"]);

    h.complete(id, "Hi there!");
    assert_eq!(h.controller.state(), &SessionState::Ready);
    assert_eq!(h.transcript(), ["hello", "Hi there!"]);
    assert_eq!(
        h.controller.store().model_history(),
        &[ChatMessage::user("hello"), ChatMessage::assistant("Hi there!")]
    );
    assert_eq!(
        h.renderer.frames.borrow().last().unwrap(),
        &["hello".to_string(), "Hi there!".to_string()]
    );
    assert!(h.renderer.frame_count() > frames_before);
}

#[test]
fn empty_submit_changes_nothing() {
    let mut h = Harness::new().ready();
    let version = h.controller.store().version();

    assert_eq!(h.controller.submit("   \n"), Err(ControllerError::EmptyInput));
    assert_eq!(h.controller.state(), &SessionState::Ready);
    assert_eq!(h.controller.store().version(), version);
    assert!(h.port.take().is_empty());
}

#[test]
fn submit_outside_ready_is_invalid() {
    let mut h = Harness::new();
    assert!(matches!(
        h.controller.submit("hello"),
        Err(ControllerError::InvalidState {
            action: "submit",
            state: "idle"
        })
    ));

    let mut h = Harness::new().ready();
    h.controller.submit("first").unwrap();
    assert!(matches!(
        h.controller.submit("second"),
        Err(ControllerError::InvalidState {
            state: "generating",
            ..
        })
    ));
}

#[test]
fn interrupt_preserves_partial_text() {
    let mut h = Harness::new().ready();
    let id = h.controller.submit("tell me a story").unwrap();
    h.event(WorkerEvent::Started { id });
    h.fragment(id, "Once upon");
    h.fragment(id, " a time");
    h.port.take();

    assert!(h.controller.interrupt().unwrap());
    assert_eq!(h.controller.state(), &SessionState::Ready);
    assert!(matches!(h.port.take().as_slice(), [WorkerRequest::Interrupt]));
    assert_eq!(h.transcript()[1], "Once upon a time\n\n[Interrupted]");

    // The worker's own terminal signal for the stopped generation is stale.
    h.fragment(id, ", there was");
    h.complete(id, "Once upon a time, there was");
    assert_eq!(h.transcript()[1], "Once upon a time\n\n[Interrupted]");
    assert_eq!(
        h.controller.store().model_history().last(),
        Some(&ChatMessage::assistant("Once upon a time"))
    );

    assert!(!h.controller.interrupt().unwrap());
    let next = h.controller.submit("go on").unwrap();
    assert_ne!(next, id);
}

#[test]
fn interrupt_before_first_fragment_rolls_back_question() {
    let mut h = Harness::new().ready();
    h.controller.submit("hello").unwrap();
    h.controller.interrupt().unwrap();

    assert_eq!(h.transcript(), ["hello", "[Interrupted]"]);
    assert!(h.controller.store().model_history().is_empty());
}

#[test]
fn generation_error_returns_to_ready_with_annotation() {
    let mut h = Harness::new().ready();
    h.exchange("first", "answer");
    let id = h.controller.submit("second").unwrap();
    h.fragment(id, "par");
    h.event(WorkerEvent::generation_error(id, "device lost"));

    assert_eq!(h.controller.state(), &SessionState::Ready);
    assert_eq!(
        h.transcript()[3],
        "par\n\n[Error generating response: device lost. Please try again.]"
    );
    let history = h.controller.store().model_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history.last().unwrap().role, Role::Assistant);
}

#[test]
fn settings_bounds_are_inclusive() {
    let mut h = Harness::new().ready();
    h.exchange("keep", "me");
    let before = h.controller.settings().clone();

    for (temperature, top_k) in [(-0.1, 50), (1.1, 50), (0.7, 0), (0.7, 101), (f64::NAN, 50)] {
        let mut candidate = draft(&h.controller);
        candidate.temperature = temperature;
        candidate.top_k = top_k;
        assert!(matches!(
            h.controller.save_settings(candidate),
            Err(ControllerError::Validation(_))
        ));
        assert_eq!(h.controller.settings(), &before);
        assert_eq!(h.controller.state(), &SessionState::Ready);
        assert_eq!(h.transcript(), ["keep", "me"]);
    }
    assert!(h.port.take().is_empty());

    for (temperature, top_k) in [(0.0, 1), (1.0, 100)] {
        let mut candidate = draft(&h.controller);
        candidate.temperature = temperature;
        candidate.top_k = top_k;
        h.controller.save_settings(candidate).unwrap();
        h.event(WorkerEvent::Ready);
        assert_eq!(i64::from(h.controller.settings().top_k().value()), top_k);
    }
}

#[test]
fn prompt_only_save_clears_history_without_reload() {
    let mut h = Harness::new().ready();
    h.exchange("hello", "hi");
    h.port.take();

    let mut candidate = draft(&h.controller);
    candidate.system_prompt = "Answer in French.".to_string();
    let change = h.controller.save_settings(candidate).unwrap();

    assert_eq!(change, SettingsChange::PromptOnly);
    assert_eq!(h.controller.state(), &SessionState::Ready);
    assert!(matches!(h.port.take().as_slice(), [WorkerRequest::Reset]));
    assert!(h.transcript().is_empty());
    assert!(h.controller.store().model_history().is_empty());
    assert_eq!(h.controller.settings().system_prompt(), "Answer in French.");

    let id = h.controller.submit("bonjour").unwrap();
    h.event(WorkerEvent::Started { id });
    match h.port.take().as_slice() {
        [WorkerRequest::Generate { messages, .. }] => {
            assert_eq!(messages[0], ChatMessage::system("Answer in French."));
            assert_eq!(messages.len(), 2);
        }
        other => panic!("unexpected requests: {other:?}"),
    }
}

#[test]
fn blank_system_prompt_falls_back_to_default() {
    let mut h = Harness::new().ready();
    let mut candidate = draft(&h.controller);
    candidate.system_prompt = "   ".to_string();
    h.controller.save_settings(candidate).unwrap();
    assert_eq!(
        h.controller.settings().system_prompt(),
        "You are a helpful assistant."
    );
}

#[test]
fn top_k_change_reloads_model() {
    let mut h = Harness::new().ready();
    h.exchange("hello", "hi");
    h.port.take();

    let mut candidate = draft(&h.controller);
    candidate.top_k = 10;
    let change = h.controller.save_settings(candidate).unwrap();

    assert_eq!(change, SettingsChange::ReloadRequired);
    assert!(matches!(
        h.controller.state(),
        SessionState::LoadingModel(_)
    ));
    let sent = h.port.take();
    assert!(matches!(sent[0], WorkerRequest::Reset));
    assert_eq!(load_spec(&sent[1]).id, "org/tiny");
    assert!(h.transcript().is_empty());
    assert!(!h.controller.affordance().enabled);

    h.event(WorkerEvent::Ready);
    assert_eq!(h.controller.state(), &SessionState::Ready);
    assert_eq!(h.controller.settings().top_k().value(), 10);
}

#[test]
fn save_during_generation_abandons_stream() {
    let mut h = Harness::new().ready();
    let id = h.controller.submit("hello").unwrap();
    h.fragment(id, "Hel");
    h.port.take();

    let mut candidate = draft(&h.controller);
    candidate.system_prompt = "New prompt.".to_string();
    h.controller.save_settings(candidate).unwrap();

    assert!(matches!(
        h.port.take().as_slice(),
        [WorkerRequest::Interrupt, WorkerRequest::Reset]
    ));
    assert_eq!(h.controller.state(), &SessionState::Ready);
    assert_eq!(h.controller.active_generation(), None);

    h.fragment(id, "lo");
    h.complete(id, "Hello");
    assert!(h.transcript().is_empty());
}

#[test]
fn save_during_generation_with_dead_worker_leaves_generating() {
    let mut h = Harness::new().ready();
    let id = h.controller.submit("hello").unwrap();
    h.fragment(id, "Hel");
    h.port.gone.set(true);

    let mut candidate = draft(&h.controller);
    candidate.system_prompt = "New prompt.".to_string();
    assert!(matches!(
        h.controller.save_settings(candidate),
        Err(ControllerError::WorkerGone(_))
    ));

    assert!(matches!(
        h.controller.state(),
        SessionState::Failed(failure) if failure.kind == FailureKind::Load(LoadErrorKind::Other)
    ));
    assert!(h.controller.banner().unwrap().is_error());
    assert_eq!(h.controller.affordance().label, "Retry Load");
    assert!(!h.controller.affordance().interrupt_visible);
    assert_eq!(h.controller.active_generation(), None);
    assert!(!h.controller.interrupt().unwrap());
}

#[test]
fn six_pairs_keep_last_five() {
    let mut h = Harness::new().ready();
    for n in 1..=6 {
        h.exchange(&format!("question {n}"), &format!("answer {n}"));
    }

    let history = h.controller.store().model_history();
    assert_eq!(history.len(), 10);
    assert_eq!(history[0], ChatMessage::user("question 2"));
    assert_eq!(history[9], ChatMessage::assistant("answer 6"));

    let transcript = h.transcript();
    assert_eq!(transcript.len(), 10);
    assert_eq!(transcript[0], "question 2");
}

#[test]
fn auth_failure_recovers_through_settings() {
    let mut h = Harness::new();
    h.controller.start().unwrap();
    h.event(WorkerEvent::CapabilityResult {
        capability: Capability::Supported {
            adapter: "test".to_string(),
        },
    });
    h.port.take();
    h.event(WorkerEvent::load_error(
        LoadErrorKind::AuthRequired,
        "gated repository",
    ));

    assert!(matches!(
        h.controller.state(),
        SessionState::Failed(failure) if failure.kind == FailureKind::Load(LoadErrorKind::AuthRequired)
    ));
    assert!(h.controller.banner().unwrap().text().contains("access token"));
    assert!(h.controller.retry().is_err());

    let mut candidate = draft(&h.controller);
    candidate.access_token = Some("hf_secret".to_string());
    h.controller.save_settings(candidate).unwrap();

    let sent = h.port.take();
    assert_eq!(
        load_spec(&sent[1]).access_token,
        AccessToken::new("hf_secret")
    );
    assert!(matches!(
        h.controller.state(),
        SessionState::LoadingModel(_)
    ));
}

#[test]
fn network_failure_is_retryable() {
    let mut h = Harness::new();
    h.controller.start().unwrap();
    h.event(WorkerEvent::CapabilityResult {
        capability: Capability::Supported {
            adapter: "test".to_string(),
        },
    });
    h.event(WorkerEvent::load_error(LoadErrorKind::Network, "offline"));
    assert_eq!(h.controller.affordance().label, "Retry Load");
    h.port.take();

    h.controller.retry().unwrap();
    assert!(matches!(h.port.take().as_slice(), [WorkerRequest::Load { .. }]));
    h.event(WorkerEvent::Ready);
    assert_eq!(h.controller.state(), &SessionState::Ready);
}

#[test]
fn generation_timeout_stops_stream() {
    let mut h = Harness::with(|builder| builder.generation_timeout(Some(Duration::from_secs(30))))
        .ready();
    let id = h.controller.submit("slow").unwrap();
    h.fragment(id, "thinking");
    h.port.take();

    assert!(!h.controller.check_timeout(Instant::now()));
    assert!(
        h.controller
            .check_timeout(Instant::now() + Duration::from_secs(31))
    );

    assert_eq!(h.controller.state(), &SessionState::Ready);
    assert!(matches!(h.port.take().as_slice(), [WorkerRequest::Interrupt]));
    assert_eq!(h.transcript()[1], "thinking\n\n[Timed out]");
    assert!(h.controller.banner().unwrap().is_error());
}

#[test]
fn timeout_disabled_never_fires() {
    let mut h = Harness::new().ready();
    h.controller.submit("slow").unwrap();
    assert!(
        !h.controller
            .check_timeout(Instant::now() + Duration::from_secs(3600))
    );
    assert_eq!(h.controller.state(), &SessionState::Generating);
}

#[test]
fn renders_only_when_transcript_changes() {
    let mut h = Harness::new().ready();
    let id = h.controller.submit("hello").unwrap();
    let frames = h.renderer.frame_count();

    h.event(WorkerEvent::Started { id });
    h.event(WorkerEvent::Unknown);
    assert_eq!(h.renderer.frame_count(), frames);

    h.fragment(id, "x");
    assert_eq!(h.renderer.frame_count(), frames + 1);
}

#[test]
fn dead_worker_rejects_submit_cleanly() {
    let mut h = Harness::new().ready();
    h.port.gone.set(true);

    assert!(matches!(
        h.controller.submit("hello"),
        Err(ControllerError::Stream(StreamError::WorkerGone(_)))
    ));
    assert_eq!(h.controller.state(), &SessionState::Ready);
    assert!(h.controller.store().incomplete_turn().is_none());
    assert!(h.controller.store().model_history().is_empty());
}

#[test]
fn clear_conversation_is_prompt_only() {
    let mut h = Harness::new().ready();
    h.exchange("hello", "hi");
    h.port.take();

    assert_eq!(
        h.controller.clear_conversation().unwrap(),
        SettingsChange::PromptOnly
    );
    assert!(h.transcript().is_empty());
    assert!(matches!(h.port.take().as_slice(), [WorkerRequest::Reset]));
}

#[test]
fn lockstep_display_can_be_unbounded() {
    let mut h = Harness::with(|builder| {
        builder.retention(Retention::new(4, DisplayWindow::Unbounded))
    })
    .ready();
    for n in 1..=4 {
        h.exchange(&format!("q{n}"), &format!("a{n}"));
    }
    assert_eq!(h.controller.store().model_history().len(), 4);
    assert_eq!(h.transcript().len(), 8);
}
