//! End-to-end relay behavior over real WebSocket connections.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rendezvous::server::SignalingRelay;
use rendezvous::signaling::{Candidate, Description};
use rendezvous::{
    AgentConfig, AgentStatus, ClientMessage, EngineEvent, Error, LocalMedia, MediaSource,
    NegotiationAgent, NegotiationEngine, NegotiationState, Result, Role, ServerConfig,
    ServerMessage, SignalingClient, SignalingEndpoint, SignalingServer,
};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

async fn start_server() -> (SocketAddr, Arc<SignalingRelay>) {
    start_server_with(ServerConfig::default()).await
}

async fn start_server_with(config: ServerConfig) -> (SocketAddr, Arc<SignalingRelay>) {
    let config = ServerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        ..config
    };
    let server = SignalingServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let relay = server.relay();
    tokio::spawn(server.serve());
    (addr, relay)
}

struct RawPeer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawPeer {
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        Self { ws }
    }

    async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.ws.send(Message::Text(json)).await.unwrap();
    }

    async fn join(&mut self, room: &str) {
        self.send(ClientMessage::JoinRoom {
            room_id: room.into(),
        })
        .await;
    }

    async fn try_recv(&mut self, wait: Duration) -> Option<ServerMessage> {
        loop {
            let frame = timeout(wait, self.ws.next()).await.ok()??.ok()?;
            if let Message::Text(text) = frame {
                return Some(serde_json::from_str(&text).unwrap());
            }
        }
    }

    async fn recv(&mut self) -> ServerMessage {
        self.try_recv(WAIT).await.expect("expected a frame")
    }

    async fn expect_silence(&mut self) {
        assert_eq!(self.try_recv(QUIET).await, None);
    }
}

fn joined(room: &str) -> ServerMessage {
    ServerMessage::JoinedRoom {
        room_id: room.into(),
    }
}

async fn wait_for_members(relay: &SignalingRelay, room: &str, count: usize) {
    timeout(WAIT, async {
        while relay.members_of(room, None).await.len() != count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("membership did not settle");
}

#[tokio::test]
async fn joins_are_announced_to_the_whole_room() {
    let (addr, relay) = start_server().await;
    let mut x = RawPeer::connect(addr).await;
    let mut y = RawPeer::connect(addr).await;

    x.join("abc").await;
    assert_eq!(x.recv().await, joined("abc"));

    y.join("abc").await;
    assert_eq!(x.recv().await, joined("abc"));
    assert_eq!(y.recv().await, joined("abc"));
    x.expect_silence().await;
    y.expect_silence().await;

    x.join("abc").await;
    assert_eq!(x.recv().await, joined("abc"));
    assert_eq!(y.recv().await, joined("abc"));
    x.expect_silence().await;
    assert_eq!(relay.members_of("abc", None).await.len(), 2);
}

#[tokio::test]
async fn offer_answer_and_candidates_are_relayed_verbatim_in_order() {
    let (addr, _relay) = start_server().await;
    let mut a = RawPeer::connect(addr).await;
    let mut b = RawPeer::connect(addr).await;
    a.join("abc").await;
    a.recv().await;
    b.join("abc").await;
    a.recv().await;
    b.recv().await;

    let offer = json!({"type": "offer", "sdp": "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n", "x-extra": {"kept": true}});
    a.send(ClientMessage::Offer {
        room_id: "abc".into(),
        description: offer.clone(),
    })
    .await;
    for n in 0..3 {
        a.send(ClientMessage::IceCandidate {
            room_id: "abc".into(),
            candidate: json!({"candidate": format!("c{}", n)}),
        })
        .await;
    }

    assert_eq!(b.recv().await, ServerMessage::Offer { description: offer });
    for n in 0..3 {
        assert_eq!(
            b.recv().await,
            ServerMessage::IceCandidate {
                candidate: json!({"candidate": format!("c{}", n)})
            }
        );
    }
    a.expect_silence().await;

    let answer = json!({"type": "answer", "sdp": "v=0\r\n"});
    b.send(ClientMessage::Answer {
        room_id: "abc".into(),
        description: answer.clone(),
    })
    .await;
    assert_eq!(a.recv().await, ServerMessage::Answer { description: answer });
    b.expect_silence().await;
}

#[tokio::test]
async fn candidate_in_a_lone_room_goes_nowhere() {
    let (addr, _relay) = start_server().await;
    let mut x = RawPeer::connect(addr).await;
    let mut bystander = RawPeer::connect(addr).await;
    x.join("abc").await;
    x.recv().await;
    bystander.join("other").await;
    bystander.recv().await;

    x.send(ClientMessage::IceCandidate {
        room_id: "abc".into(),
        candidate: json!({"candidate": "c1"}),
    })
    .await;
    x.expect_silence().await;
    bystander.expect_silence().await;

    // The connection is still served.
    x.join("abc").await;
    assert_eq!(x.recv().await, joined("abc"));
}

#[tokio::test]
async fn disconnect_is_silent_but_cleans_membership() {
    let (addr, relay) = start_server().await;
    let mut x = RawPeer::connect(addr).await;
    let mut y = RawPeer::connect(addr).await;
    x.join("abc").await;
    x.recv().await;
    y.join("abc").await;
    x.recv().await;
    y.recv().await;

    x.send(ClientMessage::Offer {
        room_id: "abc".into(),
        description: json!({"type": "offer", "sdp": "v=0"}),
    })
    .await;
    y.recv().await;
    drop(x);

    wait_for_members(&relay, "abc", 1).await;
    y.expect_silence().await;

    y.send(ClientMessage::Answer {
        room_id: "abc".into(),
        description: json!({"type": "answer", "sdp": "v=0"}),
    })
    .await;
    y.expect_silence().await;
}

#[tokio::test]
async fn malformed_frames_are_ignored() {
    let (addr, _relay) = start_server().await;
    let mut x = RawPeer::connect(addr).await;

    x.ws.send(Message::Text("not json".into())).await.unwrap();
    x.ws
        .send(Message::Text(r#"{"event":"leave","roomId":"abc"}"#.into()))
        .await
        .unwrap();
    x.join("abc").await;
    assert_eq!(x.recv().await, joined("abc"));
}

#[tokio::test]
async fn empty_rooms_are_swept_periodically() {
    let (addr, relay) = start_server_with(ServerConfig {
        sweep_interval: Some(Duration::from_millis(20)),
        ..ServerConfig::default()
    })
    .await;
    let mut x = RawPeer::connect(addr).await;
    x.join("abc").await;
    x.recv().await;
    assert_eq!(relay.room_count().await, 1);

    drop(x);
    timeout(WAIT, async {
        while relay.room_count().await != 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("empty room was not swept");
}

#[derive(Default)]
struct EngineState {
    local: Option<Description>,
    remote: Option<Description>,
    applied: Vec<Candidate>,
}

#[derive(Clone, Default)]
struct LoopbackEngine {
    state: Arc<Mutex<EngineState>>,
}

#[async_trait]
impl NegotiationEngine for LoopbackEngine {
    async fn attach_media(&self, _media: &LocalMedia) -> Result<()> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<Description> {
        Ok(json!({"type": "offer", "sdp": "loopback-offer"}))
    }

    async fn create_answer(&self) -> Result<Description> {
        Ok(json!({"type": "answer", "sdp": "loopback-answer"}))
    }

    async fn set_local_description(&self, description: Description) -> Result<()> {
        self.state.lock().unwrap().local = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: Description) -> Result<()> {
        self.state.lock().unwrap().remote = Some(description);
        Ok(())
    }

    async fn discard_local_offer(&self) -> Result<()> {
        self.state.lock().unwrap().local = None;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(Error::DescriptionApplication("remote description not set".into()));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct AlwaysMedia;

#[async_trait]
impl MediaSource for AlwaysMedia {
    async fn acquire(&self) -> Result<LocalMedia> {
        Ok(LocalMedia::default())
    }
}

async fn wait_status(
    rx: &mut tokio::sync::watch::Receiver<AgentStatus>,
    predicate: impl FnMut(&AgentStatus) -> bool,
) -> AgentStatus {
    let status = timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("timed out waiting for agent")
        .unwrap()
        .clone();
    status
}

#[tokio::test]
async fn two_agents_negotiate_through_the_relay() {
    let (addr, relay) = start_server().await;
    let endpoint = SignalingEndpoint::from(addr);

    let client_a = SignalingClient::connect(&endpoint).await.unwrap();
    let client_b = SignalingClient::connect(&endpoint).await.unwrap();
    let engine_a = LoopbackEngine::default();
    let engine_b = LoopbackEngine::default();
    let (events_a, events_a_rx) = mpsc::unbounded_channel();
    let (_events_b, events_b_rx) = mpsc::unbounded_channel();

    let a = NegotiationAgent::spawn(
        AgentConfig::new("abc"),
        engine_a.clone(),
        events_a_rx,
        AlwaysMedia,
        client_a.sender(),
        client_a.subscribe(),
    );
    let mut status_a = a.subscribe();
    wait_status(&mut status_a, |s| s.announcements >= 1).await;

    let b = NegotiationAgent::spawn(
        AgentConfig::new("abc"),
        engine_b.clone(),
        events_b_rx,
        AlwaysMedia,
        client_b.sender(),
        client_b.subscribe(),
    );
    let mut status_b = b.subscribe();
    wait_status(&mut status_b, |s| s.state == NegotiationState::MediaReady && s.announcements >= 1).await;
    wait_status(&mut status_a, |s| s.announcements >= 2).await;
    wait_for_members(&relay, "abc", 2).await;

    assert!(a.start_offer());
    let done_a = wait_status(&mut status_a, |s| s.state == NegotiationState::Connected).await;
    assert_eq!(done_a.role, Some(Role::Offerer));
    let done_b = wait_status(&mut status_b, |s| s.state == NegotiationState::Negotiating).await;
    assert_eq!(done_b.role, Some(Role::Answerer));
    assert_eq!(
        engine_a.state.lock().unwrap().remote,
        Some(json!({"type": "answer", "sdp": "loopback-answer"}))
    );

    events_a
        .send(EngineEvent::LocalCandidate(json!({"candidate": "from-a"})))
        .unwrap();
    wait_status(&mut status_b, |s| s.candidates_applied == 1).await;
    assert_eq!(engine_b.state.lock().unwrap().applied, vec![json!({"candidate": "from-a"})]);

    a.close();
    b.close();
    a.closed().await;
    b.closed().await;
    drop(client_a);
    wait_for_members(&relay, "abc", 1).await;
}

#[tokio::test]
async fn offer_lost_in_an_empty_room_is_sent_again() {
    let (addr, _relay) = start_server().await;
    let endpoint = SignalingEndpoint::from(addr);

    let client_a = SignalingClient::connect(&endpoint).await.unwrap();
    let (_events_a, events_a_rx) = mpsc::unbounded_channel();
    let a = NegotiationAgent::spawn(
        AgentConfig::new("abc"),
        LoopbackEngine::default(),
        events_a_rx,
        AlwaysMedia,
        client_a.sender(),
        client_a.subscribe(),
    );
    let mut status_a = a.subscribe();
    wait_status(&mut status_a, |s| s.state == NegotiationState::MediaReady && s.announcements >= 1).await;

    // Nobody else is in the room yet, so this offer goes nowhere.
    assert!(a.start_offer());
    wait_status(&mut status_a, |s| s.state == NegotiationState::Negotiating).await;

    let client_b = SignalingClient::connect(&endpoint).await.unwrap();
    let engine_b = LoopbackEngine::default();
    let (_events_b, events_b_rx) = mpsc::unbounded_channel();
    let b = NegotiationAgent::spawn(
        AgentConfig::new("abc"),
        engine_b.clone(),
        events_b_rx,
        AlwaysMedia,
        client_b.sender(),
        client_b.subscribe(),
    );
    let mut status_b = b.subscribe();
    wait_status(&mut status_b, |s| s.state == NegotiationState::MediaReady && s.announcements >= 1).await;
    wait_status(&mut status_a, |s| s.announcements >= 2).await;
    assert_eq!(b.status().role, None);

    assert!(a.start_offer());
    let done_a = wait_status(&mut status_a, |s| s.state == NegotiationState::Connected).await;
    assert_eq!(done_a.role, Some(Role::Offerer));
    let done_b = wait_status(&mut status_b, |s| s.role == Some(Role::Answerer)).await;
    assert_eq!(done_b.last_error, None);
    assert_eq!(
        engine_b.state.lock().unwrap().remote,
        Some(json!({"type": "offer", "sdp": "loopback-offer"}))
    );

    a.close();
    b.close();
    a.closed().await;
    b.closed().await;
}
