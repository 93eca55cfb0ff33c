//! Transport channel driver.
//!
//! One task per session owns the connection end-to-end: dialing, the
//! heartbeat, liveness detection, reconnection with capped backoff, and
//! flushing the outbound queue on reconnect. All of it interleaves inside
//! one `select!`-driven loop, so there is no locking and no timer can
//! outlive the state that scheduled it.
//!
//! Protocol-level `ping`/`pong` envelopes are consumed here — `last_pong_at`
//! belongs to the connection state machine. Everything else is decoded and
//! forwarded to the session loop as [`ChannelEvent::Inbound`].

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crew_protocol::{ClientEnvelope, Envelope, ServerEnvelope, SessionId, codec};

use super::outbound_queue::{OutboundQueue, QueueFull};
use super::state::{CloseReason, ClosedOutcome, ConnState, Connection};
use super::ws::{Dialer, WireConn, WireEvent};
use crate::config::ChannelConfig;
use crate::error::TransportError;

/// Events surfaced to the session loop.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The wire is open (first connect or any reconnect).
    Opened,
    /// The wire was lost; reconnect number `attempt` fires after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Retry budget exhausted. The session must be restarted.
    Lost,
    /// Clean shutdown: explicit `close()` or a normal closure from the
    /// orchestrator.
    Closed,
    /// A send was rejected because the outbound queue is at capacity.
    SendRejected(QueueFull),
    /// A decoded orchestrator envelope (never `pong`).
    Inbound(Envelope<ServerEnvelope>),
}

enum Command {
    Send(Envelope<ClientEnvelope>),
    Close,
}

/// Cheap cloneable handle for submitting envelopes to the driver.
#[derive(Clone)]
pub struct ChannelHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ChannelHandle {
    /// Submit an envelope. Transmitted immediately while open, queued in
    /// submission order otherwise.
    pub async fn send(&self, envelope: Envelope<ClientEnvelope>) -> Result<(), TransportError> {
        self.cmd_tx
            .send(Command::Send(envelope))
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Explicitly close the channel. Terminal — no reconnection.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.cmd_tx
            .send(Command::Close)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }
}

/// The driver. Construct with [`TransportChannel::new`], then spawn
/// [`TransportChannel::run`] on the runtime.
pub struct TransportChannel {
    session_id: SessionId,
    config: ChannelConfig,
    dialer: Box<dyn Dialer>,
    conn: Connection,
    queue: OutboundQueue,
    retry_delay: Option<Duration>,
    cmd_rx: mpsc::Receiver<Command>,
    events: mpsc::Sender<ChannelEvent>,
}

impl TransportChannel {
    pub fn new(
        session_id: SessionId,
        config: ChannelConfig,
        dialer: Box<dyn Dialer>,
    ) -> (Self, ChannelHandle, mpsc::Receiver<ChannelEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let queue = OutboundQueue::new(config.queue_limit);
        let channel = Self {
            session_id,
            config,
            dialer,
            conn: Connection::new(),
            queue,
            retry_delay: None,
            cmd_rx,
            events: event_tx,
        };
        (channel, ChannelHandle { cmd_tx }, event_rx)
    }

    /// Drive the connection until it is closed or lost.
    pub async fn run(mut self) {
        loop {
            match self.conn.state() {
                // The connection is created at session start: dial right
                // away. `Disconnected` is transient inside `closed()` but
                // handled the same way if ever observed.
                ConnState::Idle | ConnState::Disconnected => {
                    self.conn.begin_connect();
                }
                ConnState::Connecting => {
                    if let Some(wire) = self.establish().await {
                        self.run_open(wire).await;
                    }
                }
                // `Open` is only entered inside `establish`, which hands
                // the wire straight to `run_open`. Observing it here means
                // the wire is gone without a recorded transition.
                ConnState::Open => {
                    self.handle_wire_loss(CloseReason::Abnormal("wire lost".into()))
                        .await;
                }
                ConnState::ReconnectWait => {
                    self.wait_retry().await;
                }
                ConnState::Closing => {
                    info!(session = %self.session_id, "channel closed");
                    let _ = self.events.send(ChannelEvent::Closed).await;
                    self.conn.finish_close();
                }
                ConnState::Closed => break,
            }
        }
    }

    /// Dial the orchestrator, processing commands (enqueue, close) that
    /// arrive while the dial is in flight.
    async fn establish(&mut self) -> Option<WireConn> {
        debug!(session = %self.session_id, attempt = self.conn.reconnect_attempt(), "dialing orchestrator");
        let mut dial = self.dialer.dial(&self.session_id);
        loop {
            tokio::select! {
                result = &mut dial => {
                    match result {
                        Ok(wire) => {
                            self.conn.opened(Instant::now());
                            info!(session = %self.session_id, "channel open");
                            return Some(wire);
                        }
                        Err(e) => {
                            warn!(session = %self.session_id, error = %e, "dial failed");
                            self.handle_wire_loss(CloseReason::Abnormal(e.to_string())).await;
                            return None;
                        }
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    if self.handle_cmd_while_down(cmd).await {
                        return None;
                    }
                }
            }
        }
    }

    /// The open phase: flush the backlog, then interleave wire events,
    /// commands, and the heartbeat until the wire goes away.
    async fn run_open(&mut self, mut wire: WireConn) {
        if let Err(reason) = self.flush(&mut wire).await {
            self.handle_wire_loss(reason).await;
            return;
        }
        let _ = self.events.send(ChannelEvent::Opened).await;

        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                ev = wire.rx.recv() => {
                    match ev {
                        Some(WireEvent::Frame(frame)) => self.handle_frame(frame).await,
                        Some(WireEvent::Closed(reason)) => {
                            self.handle_wire_loss(reason).await;
                            return;
                        }
                        None => {
                            self.handle_wire_loss(CloseReason::Abnormal("wire task ended".into())).await;
                            return;
                        }
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Send(envelope)) => {
                            match transmit(&mut wire, &envelope).await {
                                Ok(()) => {}
                                Err(Some(envelope)) => {
                                    // keep it at the head for the post-reconnect flush
                                    self.queue.requeue_front(envelope);
                                    self.handle_wire_loss(CloseReason::Abnormal("wire send failed".into())).await;
                                    return;
                                }
                                // unencodable envelope was logged and dropped
                                Err(None) => {}
                            }
                        }
                        Some(Command::Close) | None => {
                            drop(wire);
                            self.conn.begin_close();
                            return;
                        }
                    }
                }
                _ = ping.tick() => {
                    let now = Instant::now();
                    if self.conn.liveness_expired(now, self.config.ping_interval, self.config.pong_timeout) {
                        warn!(session = %self.session_id, "no pong within liveness window, forcing reconnect");
                        drop(wire);
                        self.handle_wire_loss(CloseReason::LivenessTimeout).await;
                        return;
                    }
                    let ping_env = Envelope::new(self.session_id.clone(), ClientEnvelope::Ping);
                    if let Err(Some(_)) = transmit(&mut wire, &ping_env).await {
                        self.handle_wire_loss(CloseReason::Abnormal("ping send failed".into())).await;
                        return;
                    }
                }
            }
        }
    }

    /// Sleep out the scheduled backoff, still accepting commands. The
    /// explicit `ReconnectWait` state is the re-entrancy guard: exactly one
    /// timer exists, and `begin_connect` fires exactly once when it ends.
    async fn wait_retry(&mut self) {
        let delay = self.retry_delay.take().unwrap_or(self.config.reconnect.base);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => {
                    self.conn.begin_connect();
                    return;
                }
                cmd = self.cmd_rx.recv() => {
                    if self.handle_cmd_while_down(cmd).await {
                        return;
                    }
                }
            }
        }
    }

    /// Handle a command while no wire exists. Returns `true` when the
    /// current phase must end (close requested).
    async fn handle_cmd_while_down(&mut self, cmd: Option<Command>) -> bool {
        match cmd {
            Some(Command::Send(envelope)) => {
                // a connect is already in flight or scheduled; just buffer
                if let Err(e) = self.queue.enqueue(envelope) {
                    warn!(session = %self.session_id, error = %e, "outbound queue full, rejecting send");
                    let _ = self.events.send(ChannelEvent::SendRejected(e)).await;
                }
                false
            }
            Some(Command::Close) | None => {
                self.conn.begin_close();
                true
            }
        }
    }

    /// Drain the queue head-first. On wire failure the popped envelope goes
    /// back to the head and the remainder stays put, so no partial flush
    /// can reorder.
    async fn flush(&mut self, wire: &mut WireConn) -> Result<(), CloseReason> {
        while let Some(envelope) = self.queue.pop_front() {
            match transmit(wire, &envelope).await {
                Ok(()) => {}
                Err(Some(envelope)) => {
                    self.queue.requeue_front(envelope);
                    return Err(CloseReason::Abnormal("wire dropped mid-flush".into()));
                }
                // unencodable envelope was logged and dropped
                Err(None) => {}
            }
        }
        Ok(())
    }

    async fn handle_frame(&mut self, frame: String) {
        match codec::decode_server(&frame) {
            Ok(envelope) => match envelope.payload {
                ServerEnvelope::Pong => {
                    self.conn.pong(Instant::now());
                }
                _ => {
                    let _ = self.events.send(ChannelEvent::Inbound(envelope)).await;
                }
            },
            // Forward-compatible decoding: log and drop, never fail.
            Err(e) => warn!(
                session = %self.session_id,
                type_tag = e.type_tag().unwrap_or("<none>"),
                error = %e,
                "dropping undecodable frame"
            ),
        }
    }

    async fn handle_wire_loss(&mut self, reason: CloseReason) {
        match self.conn.closed(&reason, &self.config.reconnect) {
            ClosedOutcome::Terminal => {
                info!(session = %self.session_id, "channel closed by peer");
                let _ = self.events.send(ChannelEvent::Closed).await;
            }
            ClosedOutcome::GiveUp => {
                error!(
                    session = %self.session_id,
                    attempts = self.conn.reconnect_attempt(),
                    "reconnect budget exhausted, giving up"
                );
                let _ = self.events.send(ChannelEvent::Lost).await;
            }
            ClosedOutcome::Retry { attempt, delay } => {
                info!(
                    session = %self.session_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = ?reason,
                    "connection lost, reconnect scheduled"
                );
                self.retry_delay = Some(delay);
                let _ = self
                    .events
                    .send(ChannelEvent::Reconnecting { attempt, delay })
                    .await;
            }
        }
    }
}

/// Serialize and hand one envelope to the wire.
///
/// `Err(Some(_))` returns the envelope on a dead wire so the caller can
/// requeue it; `Err(None)` means the envelope itself would not encode (it
/// was logged and must be dropped, not retried).
async fn transmit(
    wire: &mut WireConn,
    envelope: &Envelope<ClientEnvelope>,
) -> Result<(), Option<Envelope<ClientEnvelope>>> {
    let frame = match codec::encode(envelope) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "dropping unencodable envelope");
            return Err(None);
        }
    };
    wire.tx
        .send(frame)
        .await
        .map_err(|_| Some(envelope.clone()))
}
