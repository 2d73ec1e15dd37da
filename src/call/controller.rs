//! Call controller: owns the single call slot and the phone state machine.
//!
//! Every operator intent and every session event funnels through one task,
//! so each state transition happens in exactly one place and the one-call
//! policy cannot be raced. The UI observes the controller through a watch
//! channel of [`PhoneSnapshot`] values and never touches call state
//! directly.

use std::collections::VecDeque;
use std::future;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};

use crate::call::log::CallLog;
use crate::call::media::{self, MediaStream, MediaWarning};
use crate::call::{fmt_duration, Call, CallId, CallOutcome, CallState, HistoryEntry};
use crate::config::Config;
use crate::session::{self, ConnectionStatus, SessionCommand, SessionEvent, SessionHandle};

/// Terminated calls kept in the in-memory history.
const HISTORY_LIMIT: usize = 200;

/// What the operator can ask the phone to do. The TUI and the headless
/// CLI commands both speak this vocabulary.
#[derive(Debug)]
pub enum Intent {
    Connect,
    Disconnect,
    Dial { number: String },
    /// Answer the ringing call.
    Accept,
    /// Decline the ringing call. Leaves no history entry.
    Reject,
    /// End the current call. The state machine picks CANCEL for a call
    /// that has no final answer yet and BYE for an established one.
    Hangup,
    ToggleMute,
    ToggleHold,
}

/// Everything the UI needs to render one frame.
#[derive(Debug, Clone, Default)]
pub struct PhoneSnapshot {
    pub connection: ConnectionStatus,
    pub call: Option<Call>,
    /// Newest first, capped at [`HISTORY_LIMIT`].
    pub history: Vec<HistoryEntry>,
    /// Microphone permission was denied at least once this session.
    pub mic_denied: bool,
    /// Most recent operator-facing notice (fallback warnings, refusals).
    pub notice: Option<String>,
    /// Quantized microphone input level, 0..=8, while media runs.
    pub mic_level: u8,
}

/// Handle for talking to the controller task.
#[derive(Clone)]
pub struct PhoneHandle {
    intents: mpsc::UnboundedSender<Intent>,
    snapshots: watch::Receiver<PhoneSnapshot>,
}

impl PhoneHandle {
    /// Send an intent (non-blocking).
    pub fn send(&self, intent: Intent) {
        if self.intents.send(intent).is_err() {
            tracing::error!("Phone controller gone; intent dropped");
        }
    }

    /// Current state, cloned out of the watch slot.
    pub fn snapshot(&self) -> PhoneSnapshot {
        self.snapshots.borrow().clone()
    }

    /// A fresh watch receiver for awaiting state changes.
    pub fn watch(&self) -> watch::Receiver<PhoneSnapshot> {
        self.snapshots.clone()
    }

    /// Handle wired to caller-owned channels, with no controller task behind it.
    #[cfg(test)]
    pub fn detached(
        intents: mpsc::UnboundedSender<Intent>,
        snapshots: watch::Receiver<PhoneSnapshot>,
    ) -> Self {
        Self { intents, snapshots }
    }
}

/// Start the controller task and hand back its handle.
pub fn spawn(config: Config) -> PhoneHandle {
    let (intent_tx, intent_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(PhoneSnapshot::default());
    let controller = Controller::new(config, snapshot_tx);
    tokio::spawn(controller.run(intent_rx));
    PhoneHandle { intents: intent_tx, snapshots: snapshot_rx }
}

// ---------------------------------------------------------------------------

struct Controller {
    config: Config,
    snapshots: watch::Sender<PhoneSnapshot>,
    connection: ConnectionStatus,
    session: Option<SessionHandle>,
    /// In-flight connect attempt; resolved by the spawned task.
    connecting: Option<oneshot::Receiver<Result<SessionHandle>>>,
    /// The single call slot. `None` is the idle state.
    current: Option<Call>,
    media: Option<MediaStream>,
    /// One-second duration ticker. Exists only while the call is Active;
    /// dropped on every transition out, so it can never double-schedule.
    ticker: Option<Interval>,
    history: VecDeque<HistoryEntry>,
    call_log: Option<CallLog>,
    mic_denied: bool,
    notice: Option<String>,
    mic_level: u8,
}

impl Controller {
    fn new(config: Config, snapshots: watch::Sender<PhoneSnapshot>) -> Self {
        let call_log = if config.call_log {
            match Config::call_log_path() {
                Ok(path) => Some(CallLog::new(path)),
                Err(e) => {
                    tracing::warn!("Call log disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };
        Controller {
            config,
            snapshots,
            connection: ConnectionStatus::default(),
            session: None,
            connecting: None,
            current: None,
            media: None,
            ticker: None,
            history: VecDeque::new(),
            call_log,
            mic_denied: false,
            notice: None,
            mic_level: 0,
        }
    }

    async fn run(mut self, mut intents: mpsc::UnboundedReceiver<Intent>) {
        self.publish();
        loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(intent) => self.handle_intent(intent),
                    None => break,
                },
                result = await_connect(&mut self.connecting), if self.connecting.is_some() => {
                    self.connecting = None;
                    self.finish_connect(result);
                }
                event = next_session_event(&mut self.session), if self.session.is_some() => {
                    match event {
                        Some(event) => self.handle_session_event(event),
                        None => self.session_gone("session task ended".to_string()),
                    }
                }
                _ = next_tick(&mut self.ticker), if self.ticker.is_some() => {
                    self.on_tick();
                }
                frame = next_media_frame(&mut self.media), if self.media.is_some() => {
                    if !self.on_media_frame(frame) {
                        continue;
                    }
                }
            }
            self.publish();
        }

        // All intent senders dropped: the app is exiting.
        if let Some(session) = &self.session {
            let _ = session.commands.send(SessionCommand::Disconnect);
        }
    }

    fn publish(&self) {
        let snapshot = PhoneSnapshot {
            connection: self.connection.clone(),
            call: self.current.clone(),
            history: self.history.iter().cloned().collect(),
            mic_denied: self.mic_denied,
            notice: self.notice.clone(),
            mic_level: self.mic_level,
        };
        let _ = self.snapshots.send(snapshot);
    }

    // -- intents -----------------------------------------------------------

    fn handle_intent(&mut self, intent: Intent) {
        tracing::debug!("Intent: {:?}", intent);
        match intent {
            Intent::Connect => self.start_connect(),
            Intent::Disconnect => self.disconnect(),
            Intent::Dial { number } => self.dial(&number),
            Intent::Accept => self.accept(),
            Intent::Reject => self.reject(),
            Intent::Hangup => self.hangup(),
            Intent::ToggleMute => self.toggle_mute(),
            Intent::ToggleHold => self.toggle_hold(),
        }
    }

    fn start_connect(&mut self) {
        if self.session.is_some() || self.connecting.is_some() {
            self.notice = Some("already connected".to_string());
            return;
        }
        let config = self.config.clone();
        let (tx, rx) = oneshot::channel();
        // Connecting takes seconds (probe, TLS, registration); run it off
        // the controller so intents stay responsive meanwhile.
        tokio::spawn(async move {
            let _ = tx.send(session::connect(&config).await);
        });
        self.connecting = Some(rx);
        self.connection = ConnectionStatus::Connecting;
        self.notice = None;
        tracing::info!("Connecting to {}", self.config.server_url);
    }

    fn finish_connect(&mut self, result: Result<SessionHandle>) {
        match result {
            Ok(handle) => {
                self.connection = ConnectionStatus::Connected {
                    registered_as: handle.registered_as().to_string(),
                };
                self.session = Some(handle);
                tracing::info!("Session established");
            }
            Err(e) => {
                let reason = format!("{e:#}");
                tracing::warn!("Connect failed: {}", reason);
                self.connection = ConnectionStatus::Error(reason);
            }
        }
    }

    fn disconnect(&mut self) {
        // Abandoning an in-flight attempt drops the oneshot; if the
        // session lands afterwards its handle is dropped and the session
        // task shuts itself down.
        self.connecting = None;

        let Some(session) = &self.session else {
            self.connection = ConnectionStatus::Disconnected;
            return;
        };
        if let Some(call) = self.current.take() {
            match call.state {
                CallState::Establishing => {
                    let _ = session.commands.send(SessionCommand::Cancel { call: call.id });
                    self.finish_call(call, Some(CallOutcome::Canceled));
                }
                CallState::Ringing => {
                    let _ = session
                        .commands
                        .send(SessionCommand::Reject { call: call.id, busy: false });
                    self.finish_call(call, None);
                }
                CallState::Active | CallState::Held => {
                    let _ = session.commands.send(SessionCommand::Hangup { call: call.id });
                    self.finish_call(call, Some(CallOutcome::Completed));
                }
                CallState::Terminated => self.finish_call(call, None),
            }
        }
        let Some(session) = &self.session else { return };
        let _ = session.commands.send(SessionCommand::Disconnect);
        tracing::info!("Disconnect requested");
        // The Closed event completes the teardown.
    }

    fn dial(&mut self, number: &str) {
        let number = number.trim();
        if number.is_empty() {
            self.notice = Some("nothing to dial".to_string());
            return;
        }
        if self.session.is_none() {
            // Refused outright: no call object, no history entry.
            self.notice = Some("not connected to the PBX".to_string());
            tracing::info!("Dial refused while disconnected");
            return;
        }
        if self.current.is_some() {
            self.notice = Some("a call is already in progress".to_string());
            return;
        }

        // Media first, so the INVITE can advertise the right direction.
        let acquisition = media::acquire();
        let listen_only = acquisition.stream.is_listen_only();
        self.note_media_warning(acquisition.warning.as_ref());

        let mut call = Call::outbound(number);
        call.listen_only = listen_only;
        tracing::info!("Dialing {} (call {})", number, call.id);
        if let Some(session) = &self.session {
            let _ = session.commands.send(SessionCommand::Dial {
                call: call.id,
                number: number.to_string(),
                listen_only,
            });
        }
        self.media = Some(acquisition.stream);
        self.current = Some(call);
    }

    fn accept(&mut self) {
        if self.session.is_none() {
            return;
        }
        let Some(call) = &self.current else {
            self.notice = Some("no call to answer".to_string());
            return;
        };
        if call.state != CallState::Ringing {
            tracing::debug!("Accept ignored in state {:?}", call.state);
            return;
        }
        let id = call.id;

        let acquisition = media::acquire();
        let listen_only = acquisition.stream.is_listen_only();
        self.note_media_warning(acquisition.warning.as_ref());

        if let Some(call) = &mut self.current {
            call.listen_only = listen_only;
        }
        if let Some(session) = &self.session {
            let _ = session
                .commands
                .send(SessionCommand::Accept { call: id, listen_only });
        }
        self.media = Some(acquisition.stream);
        tracing::info!("Answering call {}", id);
        // The slot flips to Active on the session's Accepted event.
    }

    fn reject(&mut self) {
        if self.session.is_none() {
            return;
        }
        let Some(call) = self.current.take() else {
            self.notice = Some("no call to reject".to_string());
            return;
        };
        if call.state != CallState::Ringing {
            tracing::debug!("Reject ignored in state {:?}", call.state);
            self.current = Some(call);
            return;
        }
        if let Some(session) = &self.session {
            let _ = session
                .commands
                .send(SessionCommand::Reject { call: call.id, busy: false });
        }
        tracing::info!("Rejected call {} from {}", call.id, call.who());
        // A declined call leaves no history entry.
        self.finish_call(call, None);
    }

    fn hangup(&mut self) {
        if self.session.is_none() {
            return;
        }
        let Some(call) = self.current.take() else {
            self.notice = Some("no call to hang up".to_string());
            return;
        };
        match call.state {
            CallState::Establishing => {
                if let Some(session) = &self.session {
                    let _ = session.commands.send(SessionCommand::Cancel { call: call.id });
                }
                tracing::info!("Canceling call {} to {}", call.id, call.remote);
                self.finish_call(call, Some(CallOutcome::Canceled));
            }
            CallState::Active | CallState::Held => {
                if let Some(session) = &self.session {
                    let _ = session.commands.send(SessionCommand::Hangup { call: call.id });
                }
                tracing::info!("Hanging up call {} with {}", call.id, call.who());
                self.finish_call(call, Some(CallOutcome::Completed));
            }
            CallState::Ringing => {
                // Hanging up on a ringing call is a reject.
                self.current = Some(call);
                self.reject();
            }
            CallState::Terminated => self.finish_call(call, None),
        }
    }

    fn toggle_mute(&mut self) {
        let Some(call) = &mut self.current else { return };
        if !matches!(call.state, CallState::Active | CallState::Held) {
            return;
        }
        call.muted = !call.muted;
        let muted = call.muted || call.state == CallState::Held;
        if let Some(media) = &mut self.media {
            media.set_muted(muted);
        }
        tracing::info!("Microphone {}", if muted { "muted" } else { "open" });
    }

    fn toggle_hold(&mut self) {
        let Some(call) = &mut self.current else { return };
        match call.state {
            CallState::Active => {
                call.state = CallState::Held;
                // Duration freezes while held.
                self.ticker = None;
                if let Some(media) = &mut self.media {
                    media.set_muted(true);
                }
                tracing::info!("Call {} held", call.id);
            }
            CallState::Held => {
                call.state = CallState::Active;
                self.ticker = Some(active_ticker());
                let muted = call.muted;
                if let Some(media) = &mut self.media {
                    media.set_muted(muted);
                }
                tracing::info!("Call {} resumed", call.id);
            }
            _ => {}
        }
    }

    // -- session events ----------------------------------------------------

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::IncomingInvite { call, remote, display_name } => {
                self.on_incoming(call, remote, display_name)
            }
            SessionEvent::DialProgress { call } => {
                tracing::debug!("Call {} ringing at the far end", call);
            }
            SessionEvent::DialAnswered { call } | SessionEvent::Accepted { call } => {
                self.on_established(call)
            }
            SessionEvent::DialFailed { call, status, reason } => {
                self.on_call_refused(call, format!("{status} {reason}"))
            }
            SessionEvent::AcceptFailed { call, reason } => self.on_call_refused(call, reason),
            SessionEvent::RemoteCanceled { call } => self.on_remote_canceled(call),
            SessionEvent::RemoteHangup { call } => self.on_remote_hangup(call),
            SessionEvent::RegistrationLost { reason } => {
                if let Some(session) = &self.session {
                    let _ = session.commands.send(SessionCommand::Disconnect);
                }
                self.session_gone(format!("registration lost: {reason}"));
            }
            SessionEvent::TransportLost { reason } => self.session_gone(reason),
            SessionEvent::Closed => self.on_closed(),
        }
    }

    fn on_incoming(&mut self, id: CallId, remote: String, display_name: Option<String>) {
        if self.current.is_some() {
            // One call at a time: the second caller gets 486 Busy Here
            // without the slot ever noticing.
            tracing::info!("Busy; auto-rejecting incoming call from {}", remote);
            if let Some(session) = &self.session {
                let _ = session
                    .commands
                    .send(SessionCommand::Reject { call: id, busy: true });
            }
            return;
        }
        let call = Call::inbound(id, &remote, display_name);
        tracing::info!("Incoming call from {}", call.who());
        self.notice = None;
        self.current = Some(call);
    }

    fn on_established(&mut self, id: CallId) {
        let Some(call) = &mut self.current else {
            tracing::debug!("Establish event for stale call {}", id);
            return;
        };
        if call.id != id || matches!(call.state, CallState::Active | CallState::Held) {
            return;
        }
        call.state = CallState::Active;
        self.ticker = Some(active_ticker());
        tracing::info!("Call {} active", id);
    }

    fn on_call_refused(&mut self, id: CallId, reason: String) {
        let Some(call) = self.current.take() else { return };
        if call.id != id {
            self.current = Some(call);
            return;
        }
        tracing::warn!("Call {} refused: {}", id, reason);
        self.notice = Some(format!("call failed: {reason}"));
        self.finish_call(call, Some(CallOutcome::Failed));
    }

    fn on_remote_canceled(&mut self, id: CallId) {
        let Some(call) = self.current.take() else { return };
        if call.id != id {
            self.current = Some(call);
            return;
        }
        self.notice = Some(format!("missed call from {}", call.who()));
        self.finish_call(call, Some(CallOutcome::Missed));
    }

    fn on_remote_hangup(&mut self, id: CallId) {
        let Some(call) = self.current.take() else { return };
        if call.id != id {
            self.current = Some(call);
            return;
        }
        let outcome = match call.state {
            CallState::Active | CallState::Held => CallOutcome::Completed,
            // A BYE instead of a CANCEL on a ringing call still means the
            // caller went away.
            CallState::Ringing => CallOutcome::Missed,
            _ => CallOutcome::Failed,
        };
        tracing::info!("Remote ended call {}", id);
        self.finish_call(call, Some(outcome));
    }

    fn session_gone(&mut self, reason: String) {
        tracing::warn!("Session ended: {}", reason);
        self.session = None;
        self.connecting = None;
        self.end_current_for_loss();
        self.connection = ConnectionStatus::Error(reason);
    }

    fn on_closed(&mut self) {
        self.session = None;
        self.end_current_for_loss();
        if !matches!(self.connection, ConnectionStatus::Error(_)) {
            self.connection = ConnectionStatus::Disconnected;
        }
        tracing::info!("Session closed");
    }

    fn end_current_for_loss(&mut self) {
        let Some(call) = self.current.take() else { return };
        let outcome = match call.state {
            // The conversation happened; the transport just beat the BYE.
            CallState::Active | CallState::Held => Some(CallOutcome::Completed),
            CallState::Ringing => Some(CallOutcome::Missed),
            CallState::Establishing => Some(CallOutcome::Failed),
            CallState::Terminated => None,
        };
        self.finish_call(call, outcome);
    }

    // -- call teardown -----------------------------------------------------

    /// Free the slot. `Some(outcome)` records the call in history and the
    /// call log; `None` leaves no trace.
    fn finish_call(&mut self, call: Call, outcome: Option<CallOutcome>) {
        if let Some(outcome) = outcome {
            let entry = HistoryEntry::from_call(&call, outcome);
            tracing::info!(
                "Call {} with {} ended: {} after {}",
                call.id,
                call.who(),
                outcome.label(),
                fmt_duration(entry.duration_secs)
            );
            if let Some(log) = &self.call_log {
                if let Err(e) = log.append(&entry) {
                    tracing::warn!("Call log write failed: {:#}", e);
                }
            }
            self.history.push_front(entry);
            self.history.truncate(HISTORY_LIMIT);
        } else {
            tracing::debug!("Call {} dismissed without a history entry", call.id);
        }
        if let Some(mut media) = self.media.take() {
            media.stop();
        }
        self.ticker = None;
        self.mic_level = 0;
    }

    // -- timers and media --------------------------------------------------

    fn on_tick(&mut self) {
        if let Some(call) = &mut self.current {
            if call.state == CallState::Active {
                call.duration_secs += 1;
            }
        }
    }

    /// Update the quantized input level; true when the snapshot changed.
    fn on_media_frame(&mut self, frame: Option<Vec<i16>>) -> bool {
        let Some(frame) = frame else {
            // Stream ended on its own; drop it so the branch goes quiet.
            if let Some(mut media) = self.media.take() {
                media.stop();
            }
            let changed = self.mic_level != 0;
            self.mic_level = 0;
            return changed;
        };
        let peak = frame.iter().map(|s| u32::from(s.unsigned_abs())).max().unwrap_or(0);
        let level = ((peak * 8 + 32767) / 32768).min(8) as u8;
        let changed = level != self.mic_level;
        self.mic_level = level;
        changed
    }

    fn note_media_warning(&mut self, warning: Option<&MediaWarning>) {
        match warning {
            Some(warning) => {
                if matches!(warning, MediaWarning::PermissionDenied(_)) {
                    // Sticky across further failures; only a working
                    // capture clears it.
                    self.mic_denied = true;
                }
                tracing::warn!("Media fallback: {}", warning);
                self.notice = Some(warning.to_string());
            }
            None => {
                // A successful live capture retires any earlier denial.
                self.mic_denied = false;
                self.notice = None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Optional-source select helpers. Each suspends forever when its slot is
// empty; the matching `if` guard keeps the branch disabled anyway.
// ---------------------------------------------------------------------------

async fn await_connect(
    slot: &mut Option<oneshot::Receiver<Result<SessionHandle>>>,
) -> Result<SessionHandle> {
    match slot {
        Some(rx) => match rx.await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("connect task dropped")),
        },
        None => future::pending().await,
    }
}

async fn next_session_event(slot: &mut Option<SessionHandle>) -> Option<SessionEvent> {
    match slot {
        Some(handle) => handle.events.recv().await,
        None => future::pending().await,
    }
}

async fn next_tick(slot: &mut Option<Interval>) -> Instant {
    match slot {
        Some(interval) => interval.tick().await,
        None => future::pending().await,
    }
}

async fn next_media_frame(slot: &mut Option<MediaStream>) -> Option<Vec<i16>> {
    match slot {
        Some(stream) => stream.next_frame().await,
        None => future::pending().await,
    }
}

/// `interval_at` one second out sidesteps tokio's immediate first tick,
/// which would otherwise count a phantom second.
fn active_ticker() -> Interval {
    let mut interval = time::interval_at(
        Instant::now() + Duration::from_secs(1),
        Duration::from_secs(1),
    );
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    fn test_config() -> Config {
        Config {
            server_url: "wss://pbx.example.org:8089/ws".to_string(),
            extension: "4471".to_string(),
            secret: "hunter2".to_string(),
            enabled: true,
            call_log: false,
        }
    }

    fn idle_controller() -> Controller {
        let (snapshot_tx, _snapshot_rx) = watch::channel(PhoneSnapshot::default());
        Controller::new(test_config(), snapshot_tx)
    }

    fn connected_controller() -> (Controller, mpsc::UnboundedReceiver<SessionCommand>) {
        let mut controller = idle_controller();
        let (handle, cmd_rx, _evt_tx) = SessionHandle::fake();
        controller.connection = ConnectionStatus::Connected {
            registered_as: handle.registered_as().to_string(),
        };
        controller.session = Some(handle);
        (controller, cmd_rx)
    }

    fn ringing_inbound(controller: &mut Controller) -> CallId {
        let id = CallId::new();
        controller.handle_session_event(SessionEvent::IncomingInvite {
            call: id,
            remote: "2001".to_string(),
            display_name: Some("North Desk".to_string()),
        });
        id
    }

    #[tokio::test]
    async fn test_dial_refused_when_disconnected() {
        let mut controller = idle_controller();
        controller.handle_intent(Intent::Dial { number: "911".to_string() });

        assert!(controller.current.is_none());
        assert!(controller.history.is_empty());
        assert!(controller.notice.as_deref().unwrap().contains("not connected"));
    }

    #[tokio::test]
    async fn test_dial_sends_invite_and_enters_establishing() {
        let (mut controller, mut cmd_rx) = connected_controller();
        controller.handle_intent(Intent::Dial { number: " 112 ".to_string() });

        let call = controller.current.as_ref().unwrap();
        assert_eq!(call.state, CallState::Establishing);
        assert_eq!(call.remote, "112");
        match cmd_rx.try_recv().unwrap() {
            SessionCommand::Dial { call: id, number, .. } => {
                assert_eq!(id, call.id);
                assert_eq!(number, "112");
            }
            other => panic!("unexpected command: {other:?}"),
        }
        // Without capture support the call proceeds listen-only.
        #[cfg(not(feature = "audio"))]
        assert!(call.listen_only);
        assert!(controller.media.is_some());
    }

    #[tokio::test]
    async fn test_second_incoming_call_gets_busy_rejected() {
        let (mut controller, mut cmd_rx) = connected_controller();
        controller.handle_intent(Intent::Dial { number: "911".to_string() });
        let first = controller.current.as_ref().unwrap().id;
        let _ = cmd_rx.try_recv();

        let second = CallId::new();
        controller.handle_session_event(SessionEvent::IncomingInvite {
            call: second,
            remote: "2002".to_string(),
            display_name: None,
        });

        // The slot still belongs to the first call.
        assert_eq!(controller.current.as_ref().unwrap().id, first);
        match cmd_rx.try_recv().unwrap() {
            SessionCommand::Reject { call, busy } => {
                assert_eq!(call, second);
                assert!(busy);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_outbound_call_answer_then_hangup_records_completed() {
        let (mut controller, mut cmd_rx) = connected_controller();
        controller.handle_intent(Intent::Dial { number: "911".to_string() });
        let id = controller.current.as_ref().unwrap().id;
        let _ = cmd_rx.try_recv();

        controller.handle_session_event(SessionEvent::DialAnswered { call: id });
        assert_eq!(controller.current.as_ref().unwrap().state, CallState::Active);
        assert!(controller.ticker.is_some());

        controller.on_tick();
        controller.on_tick();

        controller.handle_intent(Intent::Hangup);
        match cmd_rx.try_recv().unwrap() {
            SessionCommand::Hangup { call } => assert_eq!(call, id),
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(controller.current.is_none());
        assert!(controller.ticker.is_none());
        assert!(controller.media.is_none());
        assert_eq!(controller.history.len(), 1);
        let entry = &controller.history[0];
        assert_eq!(entry.outcome, CallOutcome::Completed);
        assert_eq!(entry.duration_secs, 2);
    }

    #[tokio::test]
    async fn test_hangup_before_answer_cancels() {
        let (mut controller, mut cmd_rx) = connected_controller();
        controller.handle_intent(Intent::Dial { number: "911".to_string() });
        let id = controller.current.as_ref().unwrap().id;
        let _ = cmd_rx.try_recv();

        controller.handle_session_event(SessionEvent::DialProgress { call: id });
        assert_eq!(controller.current.as_ref().unwrap().state, CallState::Establishing);

        controller.handle_intent(Intent::Hangup);
        match cmd_rx.try_recv().unwrap() {
            SessionCommand::Cancel { call } => assert_eq!(call, id),
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(controller.history.len(), 1);
        assert_eq!(controller.history[0].outcome, CallOutcome::Canceled);
        assert_eq!(controller.history[0].duration_secs, 0);
    }

    #[tokio::test]
    async fn test_reject_leaves_no_history_entry() {
        let (mut controller, mut cmd_rx) = connected_controller();
        let id = ringing_inbound(&mut controller);
        assert_eq!(controller.current.as_ref().unwrap().state, CallState::Ringing);

        controller.handle_intent(Intent::Reject);
        match cmd_rx.try_recv().unwrap() {
            SessionCommand::Reject { call, busy } => {
                assert_eq!(call, id);
                assert!(!busy);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(controller.current.is_none());
        assert!(controller.history.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_inbound_records_missed() {
        let (mut controller, _cmd_rx) = connected_controller();
        let id = ringing_inbound(&mut controller);

        controller.handle_session_event(SessionEvent::RemoteCanceled { call: id });
        assert!(controller.current.is_none());
        assert_eq!(controller.history.len(), 1);
        assert_eq!(controller.history[0].outcome, CallOutcome::Missed);
        assert!(controller.notice.as_deref().unwrap().contains("North Desk"));
    }

    #[tokio::test]
    async fn test_accept_activates_only_on_session_confirmation() {
        let (mut controller, mut cmd_rx) = connected_controller();
        let id = ringing_inbound(&mut controller);

        controller.handle_intent(Intent::Accept);
        match cmd_rx.try_recv().unwrap() {
            SessionCommand::Accept { call, .. } => assert_eq!(call, id),
            other => panic!("unexpected command: {other:?}"),
        }
        // Still ringing until the 200 is actually on the wire.
        assert_eq!(controller.current.as_ref().unwrap().state, CallState::Ringing);
        assert!(controller.ticker.is_none());

        controller.handle_session_event(SessionEvent::Accepted { call: id });
        assert_eq!(controller.current.as_ref().unwrap().state, CallState::Active);
        assert!(controller.ticker.is_some());
    }

    #[tokio::test]
    async fn test_hold_freezes_duration_and_resume_continues() {
        let (mut controller, mut cmd_rx) = connected_controller();
        controller.handle_intent(Intent::Dial { number: "911".to_string() });
        let id = controller.current.as_ref().unwrap().id;
        let _ = cmd_rx.try_recv();
        controller.handle_session_event(SessionEvent::DialAnswered { call: id });

        controller.on_tick();
        controller.on_tick();
        controller.on_tick();
        assert_eq!(controller.current.as_ref().unwrap().duration_secs, 3);

        controller.handle_intent(Intent::ToggleHold);
        assert_eq!(controller.current.as_ref().unwrap().state, CallState::Held);
        assert!(controller.ticker.is_none());
        // Held calls send silence regardless of the mute flag.
        assert!(controller.media.as_ref().unwrap().is_muted());
        // A stray tick while held must not advance the clock.
        controller.on_tick();
        assert_eq!(controller.current.as_ref().unwrap().duration_secs, 3);

        controller.handle_intent(Intent::ToggleHold);
        assert_eq!(controller.current.as_ref().unwrap().state, CallState::Active);
        assert!(controller.ticker.is_some());
        assert!(!controller.media.as_ref().unwrap().is_muted());
        controller.on_tick();
        assert_eq!(controller.current.as_ref().unwrap().duration_secs, 4);
    }

    #[tokio::test]
    async fn test_mute_survives_hold_cycle() {
        let (mut controller, _cmd_rx) = connected_controller();
        controller.handle_intent(Intent::Dial { number: "911".to_string() });
        let id = controller.current.as_ref().unwrap().id;
        controller.handle_session_event(SessionEvent::DialAnswered { call: id });

        controller.handle_intent(Intent::ToggleMute);
        assert!(controller.current.as_ref().unwrap().muted);
        assert!(controller.media.as_ref().unwrap().is_muted());

        controller.handle_intent(Intent::ToggleHold);
        controller.handle_intent(Intent::ToggleHold);
        // Back to active: the operator's mute choice is still in force.
        assert!(controller.current.as_ref().unwrap().muted);
        assert!(controller.media.as_ref().unwrap().is_muted());

        controller.handle_intent(Intent::ToggleMute);
        assert!(!controller.current.as_ref().unwrap().muted);
        assert!(!controller.media.as_ref().unwrap().is_muted());
    }

    #[tokio::test]
    async fn test_dial_failure_records_failed_with_reason() {
        let (mut controller, _cmd_rx) = connected_controller();
        controller.handle_intent(Intent::Dial { number: "911".to_string() });
        let id = controller.current.as_ref().unwrap().id;

        controller.handle_session_event(SessionEvent::DialFailed {
            call: id,
            status: 486,
            reason: "Busy Here".to_string(),
        });
        assert!(controller.current.is_none());
        assert_eq!(controller.history.len(), 1);
        assert_eq!(controller.history[0].outcome, CallOutcome::Failed);
        assert!(controller.notice.as_deref().unwrap().contains("486"));
    }

    #[tokio::test]
    async fn test_transport_loss_ends_established_call() {
        let (mut controller, _cmd_rx) = connected_controller();
        controller.handle_intent(Intent::Dial { number: "911".to_string() });
        let id = controller.current.as_ref().unwrap().id;
        controller.handle_session_event(SessionEvent::DialAnswered { call: id });
        controller.on_tick();

        controller.handle_session_event(SessionEvent::TransportLost {
            reason: "connection closed by server".to_string(),
        });
        assert!(controller.session.is_none());
        assert!(controller.current.is_none());
        assert!(matches!(controller.connection, ConnectionStatus::Error(_)));
        assert_eq!(controller.history.len(), 1);
        assert_eq!(controller.history[0].outcome, CallOutcome::Completed);
        assert_eq!(controller.history[0].duration_secs, 1);
    }

    #[tokio::test]
    async fn test_mic_denied_sticky_until_live_capture() {
        let mut controller = idle_controller();
        controller.note_media_warning(Some(&MediaWarning::PermissionDenied(
            "denied by the system".to_string(),
        )));
        assert!(controller.mic_denied);

        // Other failure kinds leave the denial in place.
        controller.note_media_warning(Some(&MediaWarning::NoDevice));
        assert!(controller.mic_denied);

        // A clean acquisition clears both the flag and the notice.
        controller.note_media_warning(None);
        assert!(!controller.mic_denied);
        assert!(controller.notice.is_none());
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let (mut controller, _cmd_rx) = connected_controller();
        for n in 0..(HISTORY_LIMIT + 5) {
            controller.handle_intent(Intent::Dial { number: format!("{n}") });
            controller.handle_intent(Intent::Hangup);
        }
        assert_eq!(controller.history.len(), HISTORY_LIMIT);
        // Newest first.
        assert_eq!(controller.history[0].remote, format!("{}", HISTORY_LIMIT + 4));
    }

    #[tokio::test]
    async fn test_disconnect_hangs_up_active_call_first() {
        let (mut controller, mut cmd_rx) = connected_controller();
        controller.handle_intent(Intent::Dial { number: "911".to_string() });
        let id = controller.current.as_ref().unwrap().id;
        let _ = cmd_rx.try_recv();
        controller.handle_session_event(SessionEvent::DialAnswered { call: id });

        controller.handle_intent(Intent::Disconnect);
        match cmd_rx.try_recv().unwrap() {
            SessionCommand::Hangup { call } => assert_eq!(call, id),
            other => panic!("unexpected command: {other:?}"),
        }
        match cmd_rx.try_recv().unwrap() {
            SessionCommand::Disconnect => {}
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(cmd_rx.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(controller.history[0].outcome, CallOutcome::Completed);

        controller.handle_session_event(SessionEvent::Closed);
        assert!(controller.session.is_none());
        assert_eq!(controller.connection, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_stale_events_do_not_touch_the_slot() {
        let (mut controller, _cmd_rx) = connected_controller();
        let id = ringing_inbound(&mut controller);

        // Events for some other call id leave the ringing call alone.
        let stale = CallId::new();
        controller.handle_session_event(SessionEvent::RemoteHangup { call: stale });
        controller.handle_session_event(SessionEvent::DialFailed {
            call: stale,
            status: 500,
            reason: "Server Internal Error".to_string(),
        });
        let call = controller.current.as_ref().unwrap();
        assert_eq!(call.id, id);
        assert_eq!(call.state, CallState::Ringing);
        assert!(controller.history.is_empty());
    }
}
