//! Headless participant: joins a room and negotiates a session with
//! whoever else is in it.
//!
//! ```bash
//! rendezvous-peer --room abc                 # waits for an offer
//! rendezvous-peer --room abc --offer         # offers once media is ready
//! ```
//!
//! Type `offer` on stdin to start negotiating, `quit` (or Ctrl-C) to leave.

use anyhow::Context;
use clap::Parser;
use rendezvous::config::{DEFAULT_PORT, DEFAULT_STUN_SERVER};
use rendezvous::{
    AgentConfig, CandidatePolicy, CpalMicrophone, NegotiationAgent, NegotiationState, Scheme,
    SignalingClient, SignalingEndpoint, WebRtcEngine,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "rendezvous-peer", version, about = "WebRTC signaling peer", long_about = None)]
struct Args {
    /// Signaling server host
    #[arg(long, default_value = "localhost", env = "SIGNALING_HOST")]
    server_host: String,

    /// Signaling server port
    #[arg(long, default_value_t = DEFAULT_PORT, env = "SIGNALING_PORT")]
    server_port: u16,

    /// Use wss:// instead of ws://
    #[arg(long)]
    secure: bool,

    /// Room to join
    #[arg(long)]
    room: String,

    /// STUN/TURN servers (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = DEFAULT_STUN_SERVER)]
    stun: Vec<String>,

    /// Send an offer as soon as local media is ready
    #[arg(long)]
    offer: bool,

    /// Apply remote candidates immediately even without a remote description
    #[arg(long)]
    drop_early_candidates: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let scheme = if args.secure { Scheme::Wss } else { Scheme::Ws };
    let endpoint = SignalingEndpoint::new(scheme, args.server_host, args.server_port);

    let mut config = AgentConfig::new(args.room);
    config.ice_servers = args.stun;
    if args.drop_early_candidates {
        config.candidate_policy = CandidatePolicy::DropOnRace;
    }

    let client = SignalingClient::connect(&endpoint)
        .await
        .with_context(|| format!("cannot reach signaling server at {}", endpoint.url()))?;
    let (engine, events) = WebRtcEngine::new(&config.ice_servers).await?;
    let microphone = CpalMicrophone::new(format!("rendezvous-{}", rand::random::<u32>()));

    let agent = NegotiationAgent::spawn(
        config,
        engine,
        events,
        microphone,
        client.sender(),
        client.subscribe(),
    );

    let mut status = agent.subscribe();
    if args.offer {
        match status.wait_for(|s| s.state != NegotiationState::Idle || s.last_error.is_some()).await {
            Ok(s) if s.state == NegotiationState::MediaReady => {
                drop(s);
                agent.start_offer();
            }
            Ok(s) => warn!("Not offering: {:?}", s.last_error),
            Err(_) => {}
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim() == "offer" => {
                    agent.start_offer();
                }
                Some(line) if line.trim() == "quit" => break,
                Some(_) => {}
                None => stdin_open = false,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow().clone();
                info!("Agent state: {} (role: {:?})", current.state, current.role);
                if current.state == NegotiationState::Closed {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    agent.close();
    agent.closed().await;
    client.close();
    Ok(())
}
