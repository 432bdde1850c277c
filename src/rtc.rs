use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::engine::{EngineEvent, LocalMedia, NegotiationEngine};
use crate::error::{Error, Result};
use crate::signaling::{Candidate, Description};

/// [`NegotiationEngine`] backed by a webrtc-rs peer connection.
///
/// The peer connection is swapped for a fresh one when a local offer is
/// discarded; webrtc-rs cannot roll back `have-local-offer`.
pub struct WebRtcEngine {
    api: API,
    config: RTCConfiguration,
    events: mpsc::UnboundedSender<EngineEvent>,
    tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
    peer_connection: RwLock<Arc<RTCPeerConnection>>,
}

impl WebRtcEngine {
    /// Builds the peer connection and returns it with its event stream.
    pub async fn new(ice_servers: &[String]) -> Result<(Self, mpsc::UnboundedReceiver<EngineEvent>)> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer_connection = open_peer_connection(&api, &config, &events_tx).await?;
        let engine = Self {
            api,
            config,
            events: events_tx,
            tracks: Mutex::new(Vec::new()),
            peer_connection: RwLock::new(peer_connection),
        };
        Ok((engine, events_rx))
    }

    async fn current(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&*self.peer_connection.read().await)
    }
}

async fn open_peer_connection(
    api: &API,
    config: &RTCConfiguration,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> Result<Arc<RTCPeerConnection>> {
    let peer_connection = Arc::new(api.new_peer_connection(config.clone()).await?);

    // Trickle every gathered candidate; `None` marks the end of gathering.
    let candidates = events.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let candidates = candidates.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                debug!("ICE gathering complete");
                return;
            };
            match candidate.to_json().map(|init| serde_json::to_value(init)) {
                Ok(Ok(value)) => {
                    let _ = candidates.send(EngineEvent::LocalCandidate(value));
                }
                Ok(Err(e)) => warn!("Failed to encode local candidate: {}", e),
                Err(e) => warn!("Failed to read local candidate: {}", e),
            }
        })
    }));

    let states = events.clone();
    peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        info!("Peer Connection State has changed: {}", s);
        let event = match s {
            RTCPeerConnectionState::Connected => Some(EngineEvent::Connected),
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                Some(EngineEvent::Failed(s.to_string()))
            }
            RTCPeerConnectionState::Closed => Some(EngineEvent::Closed),
            _ => None,
        };
        if let Some(event) = event {
            // The agent may already be gone; late events are dropped.
            let _ = states.send(event);
        }
        Box::pin(async {})
    }));

    Ok(peer_connection)
}

async fn add_tracks(peer_connection: &RTCPeerConnection, tracks: &[Arc<TrackLocalStaticSample>]) -> Result<()> {
    for track in tracks {
        peer_connection
            .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaAcquisition(format!("cannot attach track: {}", e)))?;
    }
    Ok(())
}

fn description_from(description: Description) -> Result<RTCSessionDescription> {
    serde_json::from_value(description)
        .map_err(|e| Error::DescriptionApplication(format!("malformed description: {}", e)))
}

fn description_to(description: RTCSessionDescription) -> Result<Description> {
    Ok(serde_json::to_value(description)?)
}

#[async_trait]
impl NegotiationEngine for WebRtcEngine {
    async fn attach_media(&self, media: &LocalMedia) -> Result<()> {
        add_tracks(&*self.current().await, &media.tracks).await?;
        self.tracks.lock().await.extend(media.tracks.iter().cloned());
        Ok(())
    }

    async fn create_offer(&self) -> Result<Description> {
        let offer = self
            .current()
            .await
            .create_offer(None)
            .await
            .map_err(|e| Error::DescriptionApplication(e.to_string()))?;
        description_to(offer)
    }

    async fn create_answer(&self) -> Result<Description> {
        let answer = self
            .current()
            .await
            .create_answer(None)
            .await
            .map_err(|e| Error::DescriptionApplication(e.to_string()))?;
        description_to(answer)
    }

    async fn set_local_description(&self, description: Description) -> Result<()> {
        self.current()
            .await
            .set_local_description(description_from(description)?)
            .await
            .map_err(|e| Error::DescriptionApplication(e.to_string()))
    }

    async fn set_remote_description(&self, description: Description) -> Result<()> {
        self.current()
            .await
            .set_remote_description(description_from(description)?)
            .await
            .map_err(|e| Error::DescriptionApplication(e.to_string()))
    }

    async fn discard_local_offer(&self) -> Result<()> {
        let mut current = self.peer_connection.write().await;
        if current.pending_local_description().await.is_none() {
            return Ok(());
        }

        let replacement = open_peer_connection(&self.api, &self.config, &self.events).await?;
        add_tracks(&replacement, &self.tracks.lock().await).await?;

        // Detach the old connection first so its shutdown is not reported
        // as the end of the session.
        current.on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| Box::pin(async {})));
        current.on_peer_connection_state_change(Box::new(|_: RTCPeerConnectionState| Box::pin(async {})));
        let previous = std::mem::replace(&mut *current, replacement);
        if let Err(e) = previous.close().await {
            warn!("Failed to close discarded peer connection: {}", e);
        }
        info!("Discarded unanswered local offer");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)
            .map_err(|e| Error::DescriptionApplication(format!("malformed candidate: {}", e)))?;
        self.current()
            .await
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::DescriptionApplication(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.current()
            .await
            .close()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptions_convert_both_ways() {
        let value = json!({"type": "offer", "sdp": "v=0\r\n"});
        let description = description_from(value.clone()).unwrap();
        assert_eq!(description.sdp, "v=0\r\n");
        assert_eq!(description_to(description).unwrap(), value);
    }

    #[test]
    fn malformed_description_is_an_application_failure() {
        let err = description_from(json!({"sdp": 42})).unwrap_err();
        assert_eq!(err.kind(), "description-application");
    }

    #[tokio::test]
    async fn candidate_before_remote_description_fails() {
        let (engine, _events) = WebRtcEngine::new(&[]).await.unwrap();
        let err = engine
            .add_ice_candidate(json!({"candidate": "candidate:1 1 UDP 2130706431 192.168.1.1 54321 typ host", "sdpMid": "0", "sdpMLineIndex": 0}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "description-application");
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn two_engines_complete_offer_answer() {
        let (offerer, _a) = WebRtcEngine::new(&[]).await.unwrap();
        let (answerer, _b) = WebRtcEngine::new(&[]).await.unwrap();
        offerer
            .current()
            .await
            .create_data_channel("chat", None)
            .await
            .unwrap();

        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer.clone()).await.unwrap();

        assert_eq!(answer["type"], "answer");
        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
    }

    #[tokio::test]
    async fn discarded_offer_makes_room_for_a_remote_offer() {
        let (local, mut events) = WebRtcEngine::new(&[]).await.unwrap();
        let (remote, _remote_events) = WebRtcEngine::new(&[]).await.unwrap();
        for engine in [&local, &remote] {
            engine.current().await.create_data_channel("chat", None).await.unwrap();
        }

        let ours = local.create_offer().await.unwrap();
        local.set_local_description(ours).await.unwrap();
        let theirs = remote.create_offer().await.unwrap();
        remote.set_local_description(theirs.clone()).await.unwrap();

        local.discard_local_offer().await.unwrap();
        local.set_remote_description(theirs).await.unwrap();
        let answer = local.create_answer().await.unwrap();
        local.set_local_description(answer.clone()).await.unwrap();
        remote.set_remote_description(answer).await.unwrap();

        // The replaced connection went away quietly.
        while let Ok(event) = events.try_recv() {
            assert_ne!(event, EngineEvent::Closed);
        }
        local.close().await.unwrap();
        remote.close().await.unwrap();
    }

    #[tokio::test]
    async fn discard_without_local_offer_keeps_the_connection() {
        let (engine, _events) = WebRtcEngine::new(&[]).await.unwrap();
        let before = engine.current().await;
        engine.discard_local_offer().await.unwrap();
        assert!(Arc::ptr_eq(&before, &engine.current().await));
        engine.close().await.unwrap();
    }
}
