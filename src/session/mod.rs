//! Signaling session: the single authenticated SIP-over-WebSocket
//! connection to the PBX.
//!
//! `connect` validates the URL, runs the transport probe (advisory only),
//! opens the WebSocket and completes registration. It then spawns a task
//! that owns the socket: commands from the call controller are serialized
//! through it and inbound frames are demultiplexed into [`SessionEvent`]s.
//! There is no automatic reconnection; when the transport drops the
//! session ends and reconnecting is an explicit operator action.

pub mod probe;
pub mod registrar;
pub mod transport;

use std::collections::HashMap;
use std::pin::Pin;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc;
use tokio::time::{self, Duration};

use crate::call::CallId;
use crate::config::Config;
use crate::sip::auth;
use crate::sip::msg::{self, Message, Method, Request, Response};
use crate::sip::sdp;
use registrar::Registrar;
use transport::SignalSocket;

/// WebSocket keep-alive ping interval.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for each step of the registration handshake.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// How long disconnect waits for the un-REGISTER confirmation.
const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection indicator shown in the UI header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    /// Registered to the PBX under this address of record.
    Connected { registered_as: String },
    Error(String),
}

impl ConnectionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "OFFLINE",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Connected { .. } => "REGISTERED",
            ConnectionStatus::Error(_) => "ERROR",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected { .. })
    }
}

/// What the call controller can ask of the session.
#[derive(Debug)]
pub enum SessionCommand {
    Dial { call: CallId, number: String, listen_only: bool },
    Accept { call: CallId, listen_only: bool },
    /// 486 for the busy auto-reject, 603 for an operator decline.
    Reject { call: CallId, busy: bool },
    /// CANCEL an outbound INVITE that has no final answer yet.
    Cancel { call: CallId },
    /// BYE an established call.
    Hangup { call: CallId },
    /// Un-register and close; the session task exits afterwards.
    Disconnect,
}

/// What the session reports back to the controller.
#[derive(Debug)]
pub enum SessionEvent {
    IncomingInvite { call: CallId, remote: String, display_name: Option<String> },
    /// 180/183 received for an outbound INVITE.
    DialProgress { call: CallId },
    /// 200 received for an outbound INVITE; the ACK has been sent.
    DialAnswered { call: CallId },
    /// Final non-2xx for an outbound INVITE.
    DialFailed { call: CallId, status: u16, reason: String },
    /// The 200 for an inbound INVITE went out; the call is live.
    Accepted { call: CallId },
    /// Accepting failed before the 200 could be sent.
    AcceptFailed { call: CallId, reason: String },
    /// The caller gave up before we answered.
    RemoteCanceled { call: CallId },
    /// BYE from the peer on an established call.
    RemoteHangup { call: CallId },
    /// A registration refresh was rejected; the PBX no longer knows us.
    RegistrationLost { reason: String },
    /// The transport failed; the session is gone.
    TransportLost { reason: String },
    /// Clean shutdown after a Disconnect command.
    Closed,
}

/// Handle returned by [`connect`]: a command sender plus the event stream.
pub struct SessionHandle {
    pub commands: mpsc::UnboundedSender<SessionCommand>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    registered_as: String,
}

impl SessionHandle {
    pub fn registered_as(&self) -> &str {
        &self.registered_as
    }

    /// Detached handle wired to in-memory channels, for driving the call
    /// controller without a PBX.
    #[cfg(test)]
    pub fn fake() -> (
        Self,
        mpsc::UnboundedReceiver<SessionCommand>,
        mpsc::UnboundedSender<SessionEvent>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            commands: cmd_tx,
            events: evt_rx,
            registered_as: "4471@pbx.example.org".to_string(),
        };
        (handle, cmd_rx, evt_tx)
    }
}

/// Validate the configuration, probe the endpoint, connect and register.
/// On success the session loop is spawned and a handle returned.
pub async fn connect(config: &Config) -> Result<SessionHandle> {
    let url = config.signaling_url()?;
    let domain = config.sip_domain()?;

    let report = probe::run(&url, probe::DEFAULT_TIMEOUT).await;
    if !report.is_reachable() {
        // Advisory only: the real attempt below produces the hard error.
        tracing::warn!("Transport probe failed ({}); attempting anyway", report.outcome);
    }

    let mut socket = match SignalSocket::connect(&url).await {
        Ok(socket) => socket,
        Err(e) => {
            return Err(anyhow!(e))
                .with_context(|| format!("connection to {url} failed; {}", report.advice()));
        }
    };

    let mut registrar = Registrar::new(config, &domain);
    let first_refresh = register(&mut socket, &mut registrar).await?;
    let registered_as = registrar.aor();
    tracing::info!("Registered as {} (refresh in {:?})", registered_as, first_refresh);

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (evt_tx, evt_rx) = mpsc::unbounded_channel();

    let session = SessionLoop {
        socket,
        registrar,
        domain,
        commands: cmd_rx,
        events: evt_tx,
        legs: HashMap::new(),
        by_sip_id: HashMap::new(),
        refresh: RefreshState::Idle,
    };
    tokio::spawn(session.run(first_refresh));

    Ok(SessionHandle { commands: cmd_tx, events: evt_rx, registered_as })
}

/// Drive the REGISTER handshake to completion, answering at most one
/// digest challenge. Returns the delay until the first refresh.
async fn register(socket: &mut SignalSocket, registrar: &mut Registrar) -> Result<Duration> {
    let request = registrar.request();
    socket.send_text(&request.to_wire()).await?;
    let mut challenged = false;

    loop {
        let frame = time::timeout(REGISTER_TIMEOUT, socket.recv_frame())
            .await
            .context("timed out waiting for the registrar")??
            .context("connection closed during registration")?;

        let message = match Message::parse(&frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Unparseable frame during registration ignored: {}", e);
                continue;
            }
        };

        let response = match message {
            Message::Response(r) if registrar.owns(r.call_id().unwrap_or_default()) => r,
            Message::Response(r) => {
                tracing::debug!("Stray response during registration (status {})", r.status);
                continue;
            }
            Message::Request(req) => {
                answer_stray_request(socket, &req).await;
                continue;
            }
        };

        match response.status {
            200 => return Ok(registrar.apply_grant(&response)),
            401 | 407 if !challenged => {
                challenged = true;
                let Some((challenge_header, _)) = auth::header_names(response.status) else {
                    continue;
                };
                let value = response.headers.get(challenge_header).ok_or_else(|| {
                    anyhow!("{} response carried no {} header", response.status, challenge_header)
                })?;
                let challenge = auth::parse_challenge(value)?;
                let retry = registrar.authenticated(response.status, &challenge)?;
                socket.send_text(&retry.to_wire()).await?;
            }
            401 | 407 => {
                bail!("registration rejected: check extension and secret (status {})", response.status)
            }
            status => bail!("registration failed: {} {}", status, response.reason),
        }
    }
}

/// 200 for OPTIONS and NOTIFY, 501 for anything else we do not serve.
/// Keeps the PBX qualify machinery happy.
async fn answer_stray_request(socket: &mut SignalSocket, req: &Request) {
    let mut resp = match req.method {
        Method::Options | Method::Notify => Response::reply_to(req, 200, "OK"),
        // ACK never gets a response.
        Method::Ack => return,
        _ => Response::reply_to(req, 501, "Not Implemented"),
    };
    resp.set_to_tag(&msg::new_tag());
    if req.method == Method::Options {
        resp.headers.push("Allow", msg::ALLOW);
    }
    if let Err(e) = socket.send_text(&resp.to_wire()).await {
        tracing::warn!("Failed to answer {} request: {:#}", req.method, e);
    }
}

// ---------------------------------------------------------------------------
// Session loop
// ---------------------------------------------------------------------------

/// Per-call dialog state owned by the session loop.
struct Leg {
    sip_call_id: String,
    /// Our tag: From on outbound legs, To on inbound ones.
    local_tag: String,
    remote_tag: Option<String>,
    local_uri: String,
    remote_uri: String,
    /// Peer Contact; preferred request target once learned.
    remote_target: Option<String>,
    /// Our CSeq counter for requests within the dialog.
    cseq: u32,
    state: LegState,
    /// Outbound: the INVITE as sent (CANCEL and the auth retry need it).
    /// Inbound: the INVITE as received (responses are built from it).
    invite: Request,
    auth_retried: bool,
    listen_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegState {
    /// Outbound INVITE sent, no final response yet.
    Calling,
    /// CANCEL sent, waiting for the 487.
    Canceling,
    /// Inbound INVITE ringing, 180 sent.
    RingingIn,
    /// Answer exchanged in both directions.
    Established,
    /// BYE sent, waiting for its 200.
    Closing,
}

enum RefreshState {
    Idle,
    /// A refresh REGISTER is outstanding; `retried` after a challenge.
    Waiting { retried: bool },
}

struct SessionLoop {
    socket: SignalSocket,
    registrar: Registrar,
    domain: String,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    legs: HashMap<CallId, Leg>,
    /// SIP Call-ID of each live leg, for routing inbound messages.
    by_sip_id: HashMap<String, CallId>,
    refresh: RefreshState,
}

impl SessionLoop {
    async fn run(mut self, first_refresh: Duration) {
        let mut keepalive = time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await; // immediate first tick
        let mut refresh_deadline: Pin<Box<time::Sleep>> = Box::pin(time::sleep(first_refresh));

        let failure = loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(SessionCommand::Disconnect) | None => {
                            self.shutdown().await;
                            break None;
                        }
                        Some(cmd) => {
                            if let Err(e) = self.handle_command(cmd).await {
                                break Some(format!("send failed: {e:#}"));
                            }
                        }
                    }
                }
                frame = self.socket.recv_frame() => {
                    match frame {
                        Ok(Some(text)) => {
                            if let Err(e) = self.handle_frame(&text, &mut refresh_deadline).await {
                                break Some(format!("send failed: {e:#}"));
                            }
                        }
                        Ok(None) => break Some("connection closed by server".to_string()),
                        Err(e) => break Some(format!("{e:#}")),
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = self.socket.ping().await {
                        break Some(format!("keep-alive failed: {e:#}"));
                    }
                }
                _ = &mut refresh_deadline => {
                    self.refresh = RefreshState::Waiting { retried: false };
                    let request = self.registrar.request();
                    tracing::debug!("Refreshing registration");
                    if let Err(e) = self.socket.send_text(&request.to_wire()).await {
                        break Some(format!("re-register failed: {e:#}"));
                    }
                    // Re-armed properly when the 200 lands; this fallback
                    // only matters if the registrar never answers.
                    refresh_deadline = Box::pin(time::sleep(self.registrar.refresh_interval()));
                }
            }
        };

        match failure {
            None => {
                let _ = self.events.send(SessionEvent::Closed);
            }
            Some(reason) => {
                tracing::warn!("Signaling transport lost: {}", reason);
                let _ = self.events.send(SessionEvent::TransportLost { reason });
            }
        }
    }

    /// Best-effort un-REGISTER, then close the socket. Waits briefly for
    /// the confirmation so the PBX marks the extension offline before the
    /// transport drops.
    async fn shutdown(&mut self) {
        let request = self.registrar.unregister();
        if self.socket.send_text(&request.to_wire()).await.is_ok() {
            let confirmed = time::timeout(UNREGISTER_TIMEOUT, async {
                loop {
                    match self.socket.recv_frame().await {
                        Ok(Some(text)) => {
                            if let Ok(Message::Response(r)) = Message::parse(&text) {
                                if self.registrar.owns(r.call_id().unwrap_or_default())
                                    && r.is_success()
                                {
                                    break;
                                }
                            }
                        }
                        _ => break,
                    }
                }
            })
            .await;
            if confirmed.is_err() {
                tracing::debug!("No un-register confirmation before timeout");
            }
        }
        self.socket.close().await;
        tracing::info!("Unregistered and disconnected");
    }

    // -- commands ----------------------------------------------------------

    async fn handle_command(&mut self, cmd: SessionCommand) -> Result<()> {
        match cmd {
            SessionCommand::Dial { call, number, listen_only } => {
                self.start_dial(call, &number, listen_only).await
            }
            SessionCommand::Accept { call, listen_only } => self.accept(call, listen_only).await,
            SessionCommand::Reject { call, busy } => self.reject(call, busy).await,
            SessionCommand::Cancel { call } => self.cancel(call).await,
            SessionCommand::Hangup { call } => self.hangup(call).await,
            // Handled by the loop before we get here.
            SessionCommand::Disconnect => Ok(()),
        }
    }

    async fn start_dial(&mut self, call: CallId, number: &str, listen_only: bool) -> Result<()> {
        let remote_uri = format!("sip:{}@{}", number, self.domain);
        let mut leg = Leg {
            sip_call_id: msg::new_call_id(),
            local_tag: msg::new_tag(),
            remote_tag: None,
            local_uri: self.registrar.local_uri(),
            remote_uri,
            remote_target: None,
            cseq: 1,
            state: LegState::Calling,
            invite: Request::new(Method::Invite, String::new()),
            auth_retried: false,
            listen_only,
        };
        let invite = build_invite(
            &leg,
            self.registrar.via_host(),
            &self.registrar.contact_uri(),
            None,
        );
        self.socket.send_text(&invite.to_wire()).await?;
        leg.invite = invite;
        self.by_sip_id.insert(leg.sip_call_id.clone(), call);
        self.legs.insert(call, leg);
        tracing::info!("INVITE sent to {} (call {})", number, call);
        Ok(())
    }

    async fn accept(&mut self, call: CallId, listen_only: bool) -> Result<()> {
        let Some(leg) = self.legs.get_mut(&call) else {
            tracing::warn!("Accept for unknown call {}", call);
            return Ok(());
        };
        if leg.state != LegState::RingingIn {
            tracing::warn!("Accept for call {} in state {:?}", call, leg.state);
            return Ok(());
        }
        leg.listen_only = listen_only;

        let answer = match sdp::parse_audio(&leg.invite.body) {
            Ok(info) => sdp::answer(&info, listen_only),
            // Delayed offer: the INVITE carried no SDP, ours goes in the 200.
            Err(_) if leg.invite.body.trim().is_empty() => sdp::offer(listen_only),
            Err(e) => {
                let reason = format!("unusable SDP offer: {e}");
                tracing::warn!("Call {}: {}", call, reason);
                let mut resp = Response::reply_to(&leg.invite, 488, "Not Acceptable Here");
                resp.set_to_tag(&leg.local_tag);
                self.socket.send_text(&resp.to_wire()).await?;
                self.drop_leg(call);
                let _ = self.events.send(SessionEvent::AcceptFailed { call, reason });
                return Ok(());
            }
        };

        let mut resp = Response::reply_to(&leg.invite, 200, "OK");
        resp.set_to_tag(&leg.local_tag);
        resp.headers
            .push("Contact", format!("<{}>", self.registrar.contact_uri()));
        resp.headers.push("Allow", msg::ALLOW);
        resp.set_body("application/sdp", answer);
        self.socket.send_text(&resp.to_wire()).await?;
        leg.state = LegState::Established;
        tracing::info!("Accepted call {}", call);
        let _ = self.events.send(SessionEvent::Accepted { call });
        Ok(())
    }

    async fn reject(&mut self, call: CallId, busy: bool) -> Result<()> {
        let Some(leg) = self.legs.get(&call) else {
            tracing::warn!("Reject for unknown call {}", call);
            return Ok(());
        };
        let (status, reason) = if busy { (486, "Busy Here") } else { (603, "Decline") };
        let mut resp = Response::reply_to(&leg.invite, status, reason);
        resp.set_to_tag(&leg.local_tag);
        self.socket.send_text(&resp.to_wire()).await?;
        tracing::info!("Rejected call {} with {} {}", call, status, reason);
        self.drop_leg(call);
        Ok(())
    }

    async fn cancel(&mut self, call: CallId) -> Result<()> {
        let Some(leg) = self.legs.get_mut(&call) else {
            tracing::warn!("Cancel for unknown call {}", call);
            return Ok(());
        };
        if leg.state != LegState::Calling {
            tracing::warn!("Cancel for call {} in state {:?}", call, leg.state);
            return Ok(());
        }
        let request = cancel_for(&leg.invite);
        leg.state = LegState::Canceling;
        self.socket.send_text(&request.to_wire()).await?;
        tracing::info!("CANCEL sent for call {}", call);
        Ok(())
    }

    async fn hangup(&mut self, call: CallId) -> Result<()> {
        let Some(leg) = self.legs.get_mut(&call) else {
            tracing::warn!("Hangup for unknown call {}", call);
            return Ok(());
        };
        if leg.state != LegState::Established {
            tracing::warn!("Hangup for call {} in state {:?}", call, leg.state);
            return Ok(());
        }
        let request = in_dialog_request(
            leg,
            self.registrar.via_host(),
            &self.registrar.contact_uri(),
            Method::Bye,
        );
        leg.state = LegState::Closing;
        self.socket.send_text(&request.to_wire()).await?;
        tracing::info!("BYE sent for call {}", call);
        Ok(())
    }

    // -- inbound frames ----------------------------------------------------

    async fn handle_frame(
        &mut self,
        text: &str,
        refresh_deadline: &mut Pin<Box<time::Sleep>>,
    ) -> Result<()> {
        let message = match Message::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Unparseable frame ignored: {}", e);
                return Ok(());
            }
        };
        match message {
            Message::Request(req) => self.handle_request(req).await,
            Message::Response(resp) => self.handle_response(resp, refresh_deadline).await,
        }
    }

    async fn handle_request(&mut self, req: Request) -> Result<()> {
        let sip_call_id = req.call_id().unwrap_or_default().to_string();
        match req.method {
            Method::Invite => self.handle_invite(req).await,
            Method::Cancel => self.handle_cancel(&sip_call_id, req).await,
            Method::Bye => self.handle_bye(&sip_call_id, req).await,
            Method::Ack => {
                tracing::debug!("ACK received for {}", sip_call_id);
                Ok(())
            }
            _ => {
                answer_stray_request(&mut self.socket, &req).await;
                Ok(())
            }
        }
    }

    async fn handle_invite(&mut self, req: Request) -> Result<()> {
        let sip_call_id = match req.call_id() {
            Some(id) => id.to_string(),
            None => {
                tracing::warn!("INVITE without Call-ID ignored");
                return Ok(());
            }
        };
        if self.by_sip_id.contains_key(&sip_call_id) {
            // Retransmission or re-INVITE; neither changes our answer.
            tracing::debug!("Duplicate INVITE for {} ignored", sip_call_id);
            return Ok(());
        }

        let from = req.headers.get("From").unwrap_or_default().to_string();
        let remote_uri = msg::addr_spec(&from).to_string();
        let remote = msg::uri_user(&remote_uri).unwrap_or("unknown").to_string();
        let display_name = msg::display_name(&from);
        let remote_tag = msg::addr_param(&from, "tag").map(str::to_string);
        let to_uri = msg::addr_spec(req.headers.get("To").unwrap_or_default()).to_string();
        let remote_target = req.headers.get("Contact").map(|c| msg::addr_spec(c).to_string());

        let call = CallId::new();
        let local_tag = msg::new_tag();

        // 100 quenches upstream retransmissions, 180 starts ringback.
        let trying = Response::reply_to(&req, 100, "Trying");
        self.socket.send_text(&trying.to_wire()).await?;
        let mut ringing = Response::reply_to(&req, 180, "Ringing");
        ringing.set_to_tag(&local_tag);
        self.socket.send_text(&ringing.to_wire()).await?;

        let leg = Leg {
            sip_call_id: sip_call_id.clone(),
            local_tag,
            remote_tag,
            local_uri: if to_uri.is_empty() { self.registrar.local_uri() } else { to_uri },
            remote_uri,
            remote_target,
            cseq: 1,
            state: LegState::RingingIn,
            invite: req,
            auth_retried: false,
            listen_only: false,
        };
        self.by_sip_id.insert(sip_call_id, call);
        self.legs.insert(call, leg);

        tracing::info!("Incoming call {} from {}", call, remote);
        let _ = self.events.send(SessionEvent::IncomingInvite { call, remote, display_name });
        Ok(())
    }

    async fn handle_cancel(&mut self, sip_call_id: &str, req: Request) -> Result<()> {
        // 200 for the CANCEL itself, then 487 for the INVITE it kills.
        let ok = Response::reply_to(&req, 200, "OK");
        self.socket.send_text(&ok.to_wire()).await?;

        let Some(call) = self.by_sip_id.get(sip_call_id).copied() else {
            tracing::debug!("CANCEL for unknown dialog {}", sip_call_id);
            return Ok(());
        };
        let Some(leg) = self.legs.get(&call) else {
            return Ok(());
        };
        if leg.state != LegState::RingingIn {
            tracing::debug!("CANCEL for call {} in state {:?}", call, leg.state);
            return Ok(());
        }
        // A CANCEL matches its INVITE by the top Via branch (RFC 3261
        // section 9.2).
        if req.branch() != leg.invite.branch() {
            tracing::debug!("CANCEL branch mismatch for call {}", call);
            return Ok(());
        }
        let mut terminated = Response::reply_to(&leg.invite, 487, "Request Terminated");
        terminated.set_to_tag(&leg.local_tag);
        self.socket.send_text(&terminated.to_wire()).await?;
        self.drop_leg(call);
        tracing::info!("Caller abandoned call {}", call);
        let _ = self.events.send(SessionEvent::RemoteCanceled { call });
        Ok(())
    }

    async fn handle_bye(&mut self, sip_call_id: &str, req: Request) -> Result<()> {
        let ok = Response::reply_to(&req, 200, "OK");
        self.socket.send_text(&ok.to_wire()).await?;

        let Some(call) = self.by_sip_id.get(sip_call_id).copied() else {
            tracing::debug!("BYE for unknown dialog {}", sip_call_id);
            return Ok(());
        };
        self.drop_leg(call);
        tracing::info!("Remote hangup on call {}", call);
        let _ = self.events.send(SessionEvent::RemoteHangup { call });
        Ok(())
    }

    async fn handle_response(
        &mut self,
        resp: Response,
        refresh_deadline: &mut Pin<Box<time::Sleep>>,
    ) -> Result<()> {
        let sip_call_id = resp.call_id().unwrap_or_default().to_string();
        if self.registrar.owns(&sip_call_id) {
            return self.handle_register_response(resp, refresh_deadline).await;
        }
        let Some(call) = self.by_sip_id.get(&sip_call_id).copied() else {
            tracing::debug!("Response {} for unknown dialog {}", resp.status, sip_call_id);
            return Ok(());
        };
        match resp.cseq() {
            Some((_, Method::Invite)) => self.handle_invite_response(call, resp).await,
            Some((_, Method::Bye)) => {
                tracing::debug!("BYE completed for call {} ({})", call, resp.status);
                self.drop_leg(call);
                Ok(())
            }
            Some((_, Method::Cancel)) => {
                tracing::debug!("CANCEL confirmed for call {} ({})", call, resp.status);
                Ok(())
            }
            other => {
                tracing::debug!("Response {} with unexpected CSeq {:?} ignored", resp.status, other);
                Ok(())
            }
        }
    }

    async fn handle_invite_response(&mut self, call: CallId, resp: Response) -> Result<()> {
        let Some(leg) = self.legs.get_mut(&call) else {
            return Ok(());
        };

        if resp.is_provisional() {
            if resp.status == 100 {
                return Ok(());
            }
            if leg.remote_tag.is_none() {
                if let Some(to) = resp.headers.get("To") {
                    leg.remote_tag = msg::addr_param(to, "tag").map(str::to_string);
                }
            }
            if leg.state == LegState::Calling {
                let _ = self.events.send(SessionEvent::DialProgress { call });
            }
            return Ok(());
        }

        if resp.is_success() {
            if let Some(to) = resp.headers.get("To") {
                leg.remote_tag = msg::addr_param(to, "tag").map(str::to_string);
            }
            if let Some(contact) = resp.headers.get("Contact") {
                leg.remote_target = Some(msg::addr_spec(contact).to_string());
            }
            let ack = ack_for_success(
                leg,
                self.registrar.via_host(),
                &self.registrar.contact_uri(),
                &resp,
            );
            self.socket.send_text(&ack.to_wire()).await?;

            if leg.state == LegState::Canceling {
                // The answer crossed our CANCEL; close the dialog cleanly
                // without bothering the controller.
                tracing::info!("Call {} answered after cancel, sending BYE", call);
                let bye = in_dialog_request(
                    leg,
                    self.registrar.via_host(),
                    &self.registrar.contact_uri(),
                    Method::Bye,
                );
                leg.state = LegState::Closing;
                self.socket.send_text(&bye.to_wire()).await?;
                return Ok(());
            }

            leg.state = LegState::Established;
            let _ = self.events.send(SessionEvent::DialAnswered { call });
            return Ok(());
        }

        // Final failure: ACK it within the INVITE transaction, then retry
        // once with credentials or give up.
        let ack = ack_for_failure(&leg.invite, &resp);
        self.socket.send_text(&ack.to_wire()).await?;

        if let Some((challenge_header, answer_header)) = auth::header_names(resp.status) {
            if !leg.auth_retried && leg.state == LegState::Calling {
                if let Some(value) = resp.headers.get(challenge_header) {
                    match auth::parse_challenge(value) {
                        Ok(challenge) => {
                            let (username, secret) = self.registrar.credentials();
                            match auth::authorization(
                                &challenge,
                                username,
                                secret,
                                "INVITE",
                                &leg.remote_uri,
                                &msg::new_tag(),
                            ) {
                                Ok(authz) => {
                                    leg.auth_retried = true;
                                    leg.cseq += 1;
                                    let invite = build_invite(
                                        leg,
                                        self.registrar.via_host(),
                                        &self.registrar.contact_uri(),
                                        Some((answer_header, authz)),
                                    );
                                    self.socket.send_text(&invite.to_wire()).await?;
                                    leg.invite = invite;
                                    tracing::info!("Retrying INVITE with credentials (call {})", call);
                                    return Ok(());
                                }
                                Err(e) => {
                                    tracing::warn!("Cannot answer challenge on call {}: {}", call, e)
                                }
                            }
                        }
                        Err(e) => tracing::warn!("Unusable challenge on call {}: {}", call, e),
                    }
                }
            }
        }

        if leg.state == LegState::Canceling {
            // The 487 confirms the cancel; the controller already moved on.
            tracing::debug!("Call {} canceled ({} {})", call, resp.status, resp.reason);
            self.drop_leg(call);
            return Ok(());
        }

        let status = resp.status;
        let reason = resp.reason.clone();
        self.drop_leg(call);
        tracing::info!("Call {} failed: {} {}", call, status, reason);
        let _ = self.events.send(SessionEvent::DialFailed { call, status, reason });
        Ok(())
    }

    async fn handle_register_response(
        &mut self,
        resp: Response,
        refresh_deadline: &mut Pin<Box<time::Sleep>>,
    ) -> Result<()> {
        match resp.status {
            200 => {
                let next = self.registrar.apply_grant(&resp);
                self.refresh = RefreshState::Idle;
                *refresh_deadline = Box::pin(time::sleep(next));
                tracing::debug!("Registration refreshed (next in {:?})", next);
                Ok(())
            }
            401 | 407 => {
                if matches!(self.refresh, RefreshState::Waiting { retried: true }) {
                    let reason =
                        format!("registration refresh rejected (status {})", resp.status);
                    tracing::warn!("{}", reason);
                    self.refresh = RefreshState::Idle;
                    let _ = self.events.send(SessionEvent::RegistrationLost { reason });
                    return Ok(());
                }
                let Some((challenge_header, _)) = auth::header_names(resp.status) else {
                    return Ok(());
                };
                let Some(value) = resp.headers.get(challenge_header) else {
                    let reason = format!("challenge without {challenge_header} header");
                    let _ = self.events.send(SessionEvent::RegistrationLost { reason });
                    return Ok(());
                };
                let retry = auth::parse_challenge(value)
                    .and_then(|challenge| self.registrar.authenticated(resp.status, &challenge));
                match retry {
                    Ok(request) => {
                        self.refresh = RefreshState::Waiting { retried: true };
                        self.socket.send_text(&request.to_wire()).await?;
                        Ok(())
                    }
                    Err(e) => {
                        self.refresh = RefreshState::Idle;
                        let _ = self
                            .events
                            .send(SessionEvent::RegistrationLost { reason: e.to_string() });
                        Ok(())
                    }
                }
            }
            status => {
                let reason = format!("registration refresh failed: {} {}", status, resp.reason);
                tracing::warn!("{}", reason);
                self.refresh = RefreshState::Idle;
                let _ = self.events.send(SessionEvent::RegistrationLost { reason });
                Ok(())
            }
        }
    }

    fn drop_leg(&mut self, call: CallId) {
        if let Some(leg) = self.legs.remove(&call) {
            self.by_sip_id.remove(&leg.sip_call_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Request builders
// ---------------------------------------------------------------------------

/// INVITE for `leg` with a fresh branch and an SDP offer. The optional
/// auth header carries the answer to a 401/407 on retry.
fn build_invite(
    leg: &Leg,
    via_host: &str,
    contact_uri: &str,
    auth_header: Option<(&'static str, String)>,
) -> Request {
    let mut req = Request::new(Method::Invite, leg.remote_uri.clone());
    req.headers
        .push("Via", format!("SIP/2.0/WSS {via_host};branch={}", msg::new_branch()));
    req.headers.push("Max-Forwards", "70");
    req.headers
        .push("From", format!("<{}>;tag={}", leg.local_uri, leg.local_tag));
    req.headers.push("To", format!("<{}>", leg.remote_uri));
    req.headers.push("Call-ID", leg.sip_call_id.clone());
    req.headers.push("CSeq", format!("{} INVITE", leg.cseq));
    req.headers.push("Contact", format!("<{contact_uri}>"));
    req.headers.push("Allow", msg::ALLOW);
    req.headers.push("User-Agent", msg::USER_AGENT);
    if let Some((name, value)) = auth_header {
        req.headers.push(name, value);
    }
    req.set_body("application/sdp", sdp::offer(leg.listen_only));
    req
}

/// CANCEL mirrors its INVITE: same branch, Call-ID and CSeq number
/// (RFC 3261 section 9.1).
fn cancel_for(invite: &Request) -> Request {
    let mut req = Request::new(Method::Cancel, invite.uri.clone());
    if let Some(via) = invite.headers.get("Via") {
        req.headers.push("Via", via);
    }
    req.headers.push("Max-Forwards", "70");
    for name in ["From", "To", "Call-ID"] {
        if let Some(value) = invite.headers.get(name) {
            req.headers.push(name, value);
        }
    }
    let cseq_num = invite.cseq().map(|(n, _)| n).unwrap_or(1);
    req.headers.push("CSeq", format!("{cseq_num} CANCEL"));
    req.headers.push("User-Agent", msg::USER_AGENT);
    req
}

/// ACK for a 2xx: a new transaction addressed to the peer's Contact
/// (RFC 3261 section 13.2.2.4).
fn ack_for_success(leg: &Leg, via_host: &str, contact_uri: &str, resp: &Response) -> Request {
    let target = leg
        .remote_target
        .clone()
        .unwrap_or_else(|| leg.remote_uri.clone());
    let mut req = Request::new(Method::Ack, target);
    req.headers
        .push("Via", format!("SIP/2.0/WSS {via_host};branch={}", msg::new_branch()));
    req.headers.push("Max-Forwards", "70");
    req.headers
        .push("From", format!("<{}>;tag={}", leg.local_uri, leg.local_tag));
    if let Some(to) = resp.headers.get("To") {
        req.headers.push("To", to);
    }
    req.headers.push("Call-ID", leg.sip_call_id.clone());
    let cseq_num = leg.invite.cseq().map(|(n, _)| n).unwrap_or(leg.cseq);
    req.headers.push("CSeq", format!("{cseq_num} ACK"));
    req.headers.push("Contact", format!("<{contact_uri}>"));
    req
}

/// ACK for a non-2xx final: stays in the INVITE transaction, so it reuses
/// the INVITE's Via branch (RFC 3261 section 17.1.1.3).
fn ack_for_failure(invite: &Request, resp: &Response) -> Request {
    let mut req = Request::new(Method::Ack, invite.uri.clone());
    if let Some(via) = invite.headers.get("Via") {
        req.headers.push("Via", via);
    }
    req.headers.push("Max-Forwards", "70");
    if let Some(from) = invite.headers.get("From") {
        req.headers.push("From", from);
    }
    if let Some(to) = resp.headers.get("To").or_else(|| invite.headers.get("To")) {
        req.headers.push("To", to);
    }
    if let Some(call_id) = invite.call_id() {
        req.headers.push("Call-ID", call_id);
    }
    let cseq_num = invite.cseq().map(|(n, _)| n).unwrap_or(1);
    req.headers.push("CSeq", format!("{cseq_num} ACK"));
    req
}

/// Request within an established dialog (BYE today). Bumps our CSeq and
/// targets the peer's Contact when one was learned.
fn in_dialog_request(leg: &mut Leg, via_host: &str, contact_uri: &str, method: Method) -> Request {
    leg.cseq += 1;
    let target = leg
        .remote_target
        .clone()
        .unwrap_or_else(|| leg.remote_uri.clone());
    let mut req = Request::new(method.clone(), target);
    req.headers
        .push("Via", format!("SIP/2.0/WSS {via_host};branch={}", msg::new_branch()));
    req.headers.push("Max-Forwards", "70");
    req.headers
        .push("From", format!("<{}>;tag={}", leg.local_uri, leg.local_tag));
    let to = match &leg.remote_tag {
        Some(tag) => format!("<{}>;tag={}", leg.remote_uri, tag),
        None => format!("<{}>", leg.remote_uri),
    };
    req.headers.push("To", to);
    req.headers.push("Call-ID", leg.sip_call_id.clone());
    req.headers.push("CSeq", format!("{} {}", leg.cseq, method));
    req.headers.push("Contact", format!("<{contact_uri}>"));
    req.headers.push("User-Agent", msg::USER_AGENT);
    req
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const VIA_HOST: &str = "ab12cd34ef56.invalid";
    const CONTACT: &str = "sip:4471@ab12cd34ef56.invalid;transport=ws";

    fn outbound_leg() -> Leg {
        Leg {
            sip_call_id: "test-call-id-1".to_string(),
            local_tag: "localtag001".to_string(),
            remote_tag: None,
            local_uri: "sip:4471@pbx.example.org".to_string(),
            remote_uri: "sip:911@pbx.example.org".to_string(),
            remote_target: None,
            cseq: 1,
            state: LegState::Calling,
            invite: Request::new(Method::Invite, String::new()),
            auth_retried: false,
            listen_only: false,
        }
    }

    #[test]
    fn test_invite_shape() {
        let leg = outbound_leg();
        let invite = build_invite(&leg, VIA_HOST, CONTACT, None);

        assert_eq!(invite.uri, "sip:911@pbx.example.org");
        let via = invite.headers.get("Via").unwrap();
        assert!(via.starts_with("SIP/2.0/WSS ab12cd34ef56.invalid;branch=z9hG4bK"));
        assert_eq!(invite.headers.get("CSeq"), Some("1 INVITE"));
        assert_eq!(invite.headers.get("Call-ID"), Some("test-call-id-1"));
        assert_eq!(invite.headers.get("Content-Type"), Some("application/sdp"));
        assert!(invite.body.contains("m=audio"));
        assert!(invite.headers.get("From").unwrap().contains(";tag=localtag001"));
        // The To of a fresh INVITE has no tag yet.
        assert!(!invite.headers.get("To").unwrap().contains("tag="));
    }

    #[test]
    fn test_listen_only_invite_offers_recvonly() {
        let mut leg = outbound_leg();
        leg.listen_only = true;
        let invite = build_invite(&leg, VIA_HOST, CONTACT, None);
        assert!(invite.body.contains("a=recvonly"));
        assert!(!invite.body.contains("a=sendrecv"));
    }

    #[test]
    fn test_cancel_mirrors_invite_transaction() {
        let leg = outbound_leg();
        let invite = build_invite(&leg, VIA_HOST, CONTACT, None);
        let cancel = cancel_for(&invite);

        assert_eq!(cancel.method, Method::Cancel);
        assert_eq!(cancel.uri, invite.uri);
        assert_eq!(cancel.branch(), invite.branch());
        assert_eq!(cancel.call_id(), invite.call_id());
        assert_eq!(cancel.headers.get("From"), invite.headers.get("From"));
        assert_eq!(cancel.headers.get("To"), invite.headers.get("To"));
        assert_eq!(cancel.headers.get("CSeq"), Some("1 CANCEL"));
    }

    #[test]
    fn test_failure_ack_stays_in_invite_transaction() {
        let leg = outbound_leg();
        let invite = build_invite(&leg, VIA_HOST, CONTACT, None);
        let mut resp = Response::reply_to(&invite, 486, "Busy Here");
        resp.set_to_tag("remotetag99");
        let ack = ack_for_failure(&invite, &resp);

        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.uri, invite.uri);
        assert_eq!(ack.branch(), invite.branch());
        assert_eq!(ack.headers.get("CSeq"), Some("1 ACK"));
        // To comes from the response so the peer's tag is echoed.
        assert!(ack.headers.get("To").unwrap().contains("tag=remotetag99"));
    }

    #[test]
    fn test_success_ack_opens_new_transaction_toward_contact() {
        let mut leg = outbound_leg();
        leg.invite = build_invite(&leg, VIA_HOST, CONTACT, None);
        leg.remote_tag = Some("remotetag42".to_string());
        leg.remote_target = Some("sip:911@10.0.0.5:5060".to_string());

        let mut resp = Response::reply_to(&leg.invite, 200, "OK");
        resp.set_to_tag("remotetag42");
        let ack = ack_for_success(&leg, VIA_HOST, CONTACT, &resp);

        assert_eq!(ack.uri, "sip:911@10.0.0.5:5060");
        assert_ne!(ack.branch(), leg.invite.branch());
        assert_eq!(ack.headers.get("CSeq"), Some("1 ACK"));
        assert!(ack.headers.get("To").unwrap().contains("tag=remotetag42"));
    }

    #[test]
    fn test_bye_bumps_cseq_and_carries_both_tags() {
        let mut leg = outbound_leg();
        leg.invite = build_invite(&leg, VIA_HOST, CONTACT, None);
        leg.remote_tag = Some("remotetag42".to_string());
        leg.state = LegState::Established;

        let bye = in_dialog_request(&mut leg, VIA_HOST, CONTACT, Method::Bye);
        assert_eq!(bye.method, Method::Bye);
        assert_eq!(bye.headers.get("CSeq"), Some("2 BYE"));
        assert!(bye.headers.get("From").unwrap().contains("tag=localtag001"));
        assert!(bye.headers.get("To").unwrap().contains("tag=remotetag42"));
        assert_eq!(bye.call_id(), Some("test-call-id-1"));
        // A fresh transaction gets a fresh branch.
        assert_ne!(bye.branch(), leg.invite.branch());
        assert_eq!(leg.cseq, 2);
    }
}
