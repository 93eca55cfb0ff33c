//! End-to-end session tests over an in-memory wire.
//!
//! These prove the full pipeline — driver, state machine, outbound queue,
//! codec, router, store, aggregator — against induced disconnects, without
//! a real socket: the `MemoryDialer` hands the driver paired channels and
//! the test plays orchestrator on the other end.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crew_protocol::{
    AgentRequest, BackendId, ClientEnvelope, ClientId, CorrelationId, Envelope, LocalId,
    RequestTarget, Role, ServerEnvelope, SessionId, UsageCounter, codec,
};

use crate::config::ChannelConfig;
use crate::conversation::PersistedRecord;
use crate::dispatch::SessionEvent;
use crate::error::{SessionError, TransportError};
use crate::session::{Session, SessionConfig};
use crate::transport::channel::{ChannelEvent, TransportChannel};
use crate::transport::state::ReconnectPolicy;
use crate::transport::ws::{Dialer, WireConn, WireEvent};

/// Timeout for each async operation in tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The orchestrator's end of one dialed wire.
struct ServerEnd {
    /// Frames the client transmitted, in arrival order.
    from_client: mpsc::Receiver<String>,
    /// Inject frames (or closes) toward the client.
    to_client: mpsc::Sender<WireEvent>,
}

impl ServerEnd {
    async fn send_server(&self, payload: ServerEnvelope) {
        let frame = codec::encode(&Envelope::new(SessionId::from("s-1"), payload)).unwrap();
        let _ = self.to_client.send(WireEvent::Frame(frame)).await;
    }

    async fn send_server_corr(&self, payload: ServerEnvelope, corr: &str) {
        let env = Envelope::new(SessionId::from("s-1"), payload)
            .with_correlation(CorrelationId::from(corr));
        let frame = codec::encode(&env).unwrap();
        let _ = self.to_client.send(WireEvent::Frame(frame)).await;
    }

    /// Next decoded non-ping client envelope.
    async fn recv_client(&mut self) -> Option<ClientEnvelope> {
        loop {
            let frame = timeout(TEST_TIMEOUT, self.from_client.recv()).await.ok()??;
            let env = codec::decode_client(&frame).expect("client sent an undecodable frame");
            match env.payload {
                ClientEnvelope::Ping => continue,
                other => return Some(other),
            }
        }
    }

    /// Next non-ping request message text.
    async fn recv_message(&mut self) -> Option<String> {
        match self.recv_client().await? {
            ClientEnvelope::UserMessage { request } | ClientEnvelope::Edit { request, .. } => {
                Some(request.message)
            }
            ClientEnvelope::Cancel => Some("<cancel>".into()),
            ClientEnvelope::Ping => unreachable!("pings are filtered"),
        }
    }

    /// True when nothing (beyond pings) arrives for 100ms.
    async fn is_quiet(&mut self) -> bool {
        loop {
            match timeout(Duration::from_millis(100), self.from_client.recv()).await {
                Err(_) => return true,
                Ok(None) => return true,
                Ok(Some(frame)) => {
                    let env = codec::decode_client(&frame).unwrap();
                    if !matches!(env.payload, ClientEnvelope::Ping) {
                        return false;
                    }
                }
            }
        }
    }
}

/// Dialer handing out in-memory wires; the test drives the server ends.
#[derive(Clone)]
struct MemoryDialer {
    conns: mpsc::Sender<ServerEnd>,
    accept: Arc<AtomicBool>,
    dials: Arc<AtomicU32>,
}

impl MemoryDialer {
    fn new() -> (Self, mpsc::Receiver<ServerEnd>) {
        let (conns, rx) = mpsc::channel(16);
        (
            Self {
                conns,
                accept: Arc::new(AtomicBool::new(true)),
                dials: Arc::new(AtomicU32::new(0)),
            },
            rx,
        )
    }
}

impl Dialer for MemoryDialer {
    fn dial(&self, _session: &SessionId) -> BoxFuture<'static, Result<WireConn, TransportError>> {
        let conns = self.conns.clone();
        let accept = self.accept.clone();
        let dials = self.dials.clone();
        Box::pin(async move {
            dials.fetch_add(1, Ordering::SeqCst);
            if !accept.load(Ordering::SeqCst) {
                return Err(TransportError::Dial("connection refused".into()));
            }
            let (out_tx, out_rx) = mpsc::channel(64);
            let (in_tx, in_rx) = mpsc::channel(64);
            conns
                .send(ServerEnd {
                    from_client: out_rx,
                    to_client: in_tx,
                })
                .await
                .map_err(|_| TransportError::Dial("test harness gone".into()))?;
            Ok(WireConn {
                tx: out_tx,
                rx: in_rx,
            })
        })
    }
}

/// Heartbeat effectively off, reconnection fast and deterministic.
fn fast_config() -> ChannelConfig {
    ChannelConfig {
        ping_interval: Duration::from_secs(3600),
        pong_timeout: Duration::from_secs(3600),
        reconnect: ReconnectPolicy {
            base: Duration::from_millis(5),
            growth: 1.5,
            max_delay: Duration::from_millis(50),
            max_attempts: 20,
            jitter: Duration::ZERO,
        },
        queue_limit: 64,
    }
}

fn user_env(message: &str) -> Envelope<ClientEnvelope> {
    Envelope::new(
        SessionId::from("s-1"),
        ClientEnvelope::UserMessage {
            request: AgentRequest {
                message: message.into(),
                target: RequestTarget::Crew("crew-1".into()),
                model: None,
                client_id: ClientId::from("c-1"),
                is_edit: false,
            },
        },
    )
}

fn session_config() -> SessionConfig {
    SessionConfig {
        session_id: SessionId::from("s-1"),
        client_id: ClientId::from("c-1"),
        target: RequestTarget::Crew("crew-1".into()),
        model: None,
    }
}

async fn next_event(events: &mut mpsc::Receiver<ChannelEvent>) -> ChannelEvent {
    timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for channel event")
        .expect("channel event stream ended")
}

async fn next_server(conns: &mut mpsc::Receiver<ServerEnd>) -> ServerEnd {
    timeout(TEST_TIMEOUT, conns.recv())
        .await
        .expect("timed out waiting for a dial")
        .expect("dialer gone")
}

async fn wait_opened(events: &mut mpsc::Receiver<ChannelEvent>) {
    loop {
        if matches!(next_event(events).await, ChannelEvent::Opened) {
            return;
        }
    }
}

// ── transport-level properties ──────────────────────────────────────────

#[tokio::test]
async fn queued_envelopes_flush_in_order_across_reconnects() {
    let (dialer, mut conns) = MemoryDialer::new();
    let (driver, handle, mut events) =
        TransportChannel::new(SessionId::from("s-1"), fast_config(), Box::new(dialer));
    tokio::spawn(driver.run());

    let mut server1 = next_server(&mut conns).await;
    wait_opened(&mut events).await;

    handle.send(user_env("m1")).await.unwrap();
    assert_eq!(server1.recv_message().await.as_deref(), Some("m1"));

    // kill the wire, then submit while disconnected
    drop(server1);
    handle.send(user_env("m2")).await.unwrap();
    handle.send(user_env("m3")).await.unwrap();

    let mut server2 = next_server(&mut conns).await;
    assert_eq!(server2.recv_message().await.as_deref(), Some("m2"));
    assert_eq!(server2.recv_message().await.as_deref(), Some("m3"));
    // m1 was delivered on the first wire and must not be replayed
    assert!(server2.is_quiet().await);
}

#[tokio::test]
async fn message_sent_before_disconnect_is_delivered_exactly_once() {
    let (dialer, mut conns) = MemoryDialer::new();
    let (driver, handle, mut events) =
        TransportChannel::new(SessionId::from("s-1"), fast_config(), Box::new(dialer));
    tokio::spawn(driver.run());

    let mut server1 = next_server(&mut conns).await;
    wait_opened(&mut events).await;

    // "A" reaches the wire, then the connection drops before any
    // acknowledgment ever comes back
    handle.send(user_env("A")).await.unwrap();
    assert_eq!(server1.recv_message().await.as_deref(), Some("A"));
    drop(server1);

    let mut server2 = next_server(&mut conns).await;
    wait_opened(&mut events).await;
    assert!(server2.is_quiet().await, "duplicate of A after reconnect");
}

#[tokio::test]
async fn liveness_failure_reconnects_exactly_once() {
    let (dialer, mut conns) = MemoryDialer::new();
    let config = ChannelConfig {
        ping_interval: Duration::from_millis(50),
        pong_timeout: Duration::from_millis(25),
        ..fast_config()
    };
    let (driver, _handle, mut events) =
        TransportChannel::new(SessionId::from("s-1"), config, Box::new(dialer));
    tokio::spawn(driver.run());

    // first wire: swallow pings, never answer
    let _server1 = next_server(&mut conns).await;

    let mut opens = 0;
    let mut reconnects = 0;
    while opens < 2 {
        match next_event(&mut events).await {
            ChannelEvent::Opened => opens += 1,
            ChannelEvent::Reconnecting { .. } => reconnects += 1,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(reconnects, 1, "one liveness violation, one reconnect");

    let _server2 = next_server(&mut conns).await;
}

#[tokio::test]
async fn pongs_keep_the_channel_alive() {
    let (dialer, mut conns) = MemoryDialer::new();
    let config = ChannelConfig {
        ping_interval: Duration::from_millis(30),
        pong_timeout: Duration::from_millis(30),
        ..fast_config()
    };
    let (driver, _handle, mut events) =
        TransportChannel::new(SessionId::from("s-1"), config, Box::new(dialer));
    tokio::spawn(driver.run());

    let server = next_server(&mut conns).await;
    wait_opened(&mut events).await;

    // answer every ping
    let ServerEnd {
        mut from_client,
        to_client,
    } = server;
    tokio::spawn(async move {
        while let Some(frame) = from_client.recv().await {
            let env = codec::decode_client(&frame).unwrap();
            if matches!(env.payload, ClientEnvelope::Ping) {
                let pong =
                    codec::encode(&Envelope::new(SessionId::from("s-1"), ServerEnvelope::Pong))
                        .unwrap();
                if to_client.send(WireEvent::Frame(pong)).await.is_err() {
                    return;
                }
            }
        }
    });

    // several liveness windows pass without a reconnect
    let quiet = timeout(Duration::from_millis(250), events.recv()).await;
    assert!(quiet.is_err(), "channel produced {quiet:?} while healthy");
}

#[tokio::test]
async fn gives_up_with_lost_after_exhausting_attempts() {
    let (dialer, mut conns) = MemoryDialer::new();
    dialer.accept.store(false, Ordering::SeqCst);
    let dials = dialer.dials.clone();

    let config = ChannelConfig {
        reconnect: ReconnectPolicy {
            base: Duration::from_millis(1),
            growth: 1.0,
            max_delay: Duration::from_millis(5),
            max_attempts: 3,
            jitter: Duration::ZERO,
        },
        ..fast_config()
    };
    let (driver, _handle, mut events) =
        TransportChannel::new(SessionId::from("s-1"), config, Box::new(dialer));
    tokio::spawn(driver.run());

    let mut reconnects = 0;
    loop {
        match next_event(&mut events).await {
            ChannelEvent::Reconnecting { attempt, .. } => {
                reconnects += 1;
                assert_eq!(attempt, reconnects);
            }
            ChannelEvent::Lost => break,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(reconnects, 3);
    // initial dial + three retries
    assert_eq!(dials.load(Ordering::SeqCst), 4);
    assert!(conns.try_recv().is_err());
}

// ── session-level scenarios ─────────────────────────────────────────────

#[tokio::test]
async fn edit_truncates_locally_and_notifies_orchestrator() {
    let (dialer, mut conns) = MemoryDialer::new();
    let mut session = Session::connect(session_config(), fast_config(), Box::new(dialer));

    // conversation [1,2,3,4] hydrated from persistence
    session.hydrate(
        (1..=4)
            .map(|i| PersistedRecord {
                backend_id: BackendId::from(format!("b-{i}").as_str()),
                role: Role::User,
                content: i.to_string(),
                created_at: chrono::Utc::now(),
            })
            .collect(),
    );

    let mut server = next_server(&mut conns).await;
    session.edit_message(LocalId(2), "2'").await.unwrap();

    // locally: a strict prefix plus the replacement
    let contents: Vec<&str> = session.history().iter().map(|r| r.content.as_str()).collect();
    assert_eq!(contents, vec!["1", "2'"]);

    // on the wire: the edit request plus the suffix to discard
    match server.recv_client().await {
        Some(ClientEnvelope::Edit { request, discarded }) => {
            assert_eq!(request.message, "2'");
            assert!(request.is_edit);
            assert_eq!(
                discarded,
                vec![
                    BackendId::from("b-2"),
                    BackendId::from("b-3"),
                    BackendId::from("b-4")
                ]
            );
        }
        other => panic!("expected edit envelope, got {other:?}"),
    }

    // the orchestrator confirms; the replacement record gets its backend id
    server
        .send_server(ServerEnvelope::EditAck {
            backend_id: Some(BackendId::from("b-5")),
        })
        .await;
    loop {
        match timeout(TEST_TIMEOUT, session.next_event()).await.unwrap() {
            Some(SessionEvent::EditAcknowledged { local_id }) => {
                assert_eq!(local_id, Some(LocalId(5)));
                break;
            }
            Some(SessionEvent::Connected) => continue,
            other => panic!("expected EditAcknowledged, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn turn_usage_sums_tools_and_agent_exactly_once() {
    let (dialer, mut conns) = MemoryDialer::new();
    let mut session = Session::connect(session_config(), fast_config(), Box::new(dialer));

    let mut server = next_server(&mut conns).await;
    session.send_message("do the research").await.unwrap();
    assert_eq!(server.recv_message().await.as_deref(), Some("do the research"));

    // a second send during the turn is rejected
    assert!(matches!(
        session.send_message("impatient").await,
        Err(SessionError::TurnInProgress)
    ));

    // sub-invocation X: (10,5); sub-invocation Y: (7,3); agent itself: (4,2)
    server
        .send_server_corr(
            ServerEnvelope::ToolStart {
                name: "x".into(),
                input: serde_json::json!({}),
            },
            "t-x",
        )
        .await;
    server
        .send_server_corr(
            ServerEnvelope::ToolResult {
                output: serde_json::json!({"usage": {"input_tokens": 10, "output_tokens": 5}}),
            },
            "t-x",
        )
        .await;
    server
        .send_server_corr(
            ServerEnvelope::ToolStart {
                name: "y".into(),
                input: serde_json::json!({}),
            },
            "t-y",
        )
        .await;
    server
        .send_server_corr(
            ServerEnvelope::ToolEnd {
                output: serde_json::json!({"usage": {"input_tokens": 7, "output_tokens": 3}}),
            },
            "t-y",
        )
        .await;
    server
        .send_server(ServerEnvelope::AgentFinish {
            content: "all done".into(),
            backend_id: Some(BackendId::from("b-agent")),
            user_backend_id: Some(BackendId::from("b-user")),
            usage: Some(UsageCounter::new(4, 2)),
        })
        .await;

    loop {
        match timeout(TEST_TIMEOUT, session.next_event()).await.unwrap() {
            Some(SessionEvent::AgentFinished { record }) => {
                assert_eq!(record.content, "all done");
                break;
            }
            Some(_) => continue,
            None => panic!("event stream ended early"),
        }
    }

    assert_eq!(session.usage(), UsageCounter::new(21, 10));
    // turn completion re-enables input
    assert!(session.input_enabled());

    // the initiating user record was acknowledged on agent_finish
    let user = &session.history()[0];
    assert_eq!(user.backend_id, Some(BackendId::from("b-user")));
}

#[tokio::test]
async fn cancel_suppresses_turn_updates_until_terminal_envelope() {
    let (dialer, mut conns) = MemoryDialer::new();
    let mut session = Session::connect(session_config(), fast_config(), Box::new(dialer));

    let mut server = next_server(&mut conns).await;
    session.send_message("long job").await.unwrap();
    assert_eq!(server.recv_message().await.as_deref(), Some("long job"));

    session.cancel().await.unwrap();
    assert_eq!(server.recv_message().await.as_deref(), Some("<cancel>"));

    // updates that race the cancel are not rendered; the terminal
    // envelope is
    server
        .send_server_corr(
            ServerEnvelope::ToolStart {
                name: "slow".into(),
                input: serde_json::json!({}),
            },
            "t-1",
        )
        .await;
    server.send_server(ServerEnvelope::Cancelled).await;

    loop {
        match timeout(TEST_TIMEOUT, session.next_event()).await.unwrap() {
            Some(SessionEvent::Cancelled) => break,
            Some(SessionEvent::Connected) => continue,
            other => panic!("expected only Cancelled, got {other:?}"),
        }
    }
    assert!(session.input_enabled());
}

#[tokio::test]
async fn orchestrator_error_is_distinct_and_nonfatal() {
    let (dialer, mut conns) = MemoryDialer::new();
    let mut session = Session::connect(session_config(), fast_config(), Box::new(dialer));

    let mut server = next_server(&mut conns).await;
    session.send_message("hello").await.unwrap();
    assert_eq!(server.recv_message().await.as_deref(), Some("hello"));

    server
        .send_server(ServerEnvelope::Error {
            message: "tool budget exceeded".into(),
        })
        .await;

    loop {
        match timeout(TEST_TIMEOUT, session.next_event()).await.unwrap() {
            Some(SessionEvent::OrchestratorError { message }) => {
                assert_eq!(message, "tool budget exceeded");
                break;
            }
            Some(_) => continue,
            None => panic!("event stream ended early"),
        }
    }

    // history untouched (just the user message), input re-enabled,
    // connection still up
    assert_eq!(session.history().len(), 1);
    assert!(session.input_enabled());
    session.send_message("retry then").await.unwrap();
    assert_eq!(server.recv_message().await.as_deref(), Some("retry then"));
}
