//! Peer transport behind a trait seam.
//!
//! Call orchestration never touches the WebRTC stack directly; it talks to a
//! [`PeerTransport`] handed out by a [`TransportFactory`]. The production
//! factory builds one peer connection per call with opus and vp8 registered,
//! surfaces trickled ICE candidates over a channel, and mirrors connection
//! state into a watch.

use crate::error::{Error, Result};
use crate::models::{IceCandidate, NegotiationState};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()>;

    /// Produce a local offer and install it as the local description.
    async fn create_offer(&self) -> Result<String>;

    /// Install the remote offer and produce a local answer.
    async fn create_answer(&self, remote_offer: &str) -> Result<String>;

    /// Install the remote answer to a previously created offer.
    async fn apply_answer(&self, remote_answer: &str) -> Result<()>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Tear the connection down. Idempotent at the call site.
    async fn close(&self);
}

/// A freshly built transport plus the streams it reports through.
pub struct PeerHandle {
    pub transport: Arc<dyn PeerTransport>,
    pub candidates: mpsc::UnboundedReceiver<IceCandidate>,
    pub states: watch::Receiver<NegotiationState>,
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn build(&self) -> Result<PeerHandle>;
}

pub struct WebRtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransportFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        let ice_servers = vec![RTCIceServer {
            urls: stun_servers,
            ..Default::default()
        }];
        Self { ice_servers }
    }
}

impl Default for WebRtcTransportFactory {
    fn default() -> Self {
        Self::new(vec!["stun:stun.l.google.com:19302".to_string()])
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn build(&self) -> Result<PeerHandle> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer = Arc::new(api.new_peer_connection(config).await?);

        // Trickle ICE: candidates go out as they are gathered, the answer
        // never waits for gathering to finish.
        let (candidates_tx, candidates_rx) = mpsc::unbounded_channel();
        peer.on_ice_candidate(Box::new(move |candidate| {
            let candidates_tx = candidates_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidates_tx.send(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        });
                    }
                    Err(e) => warn!("Dropping unserializable ICE candidate: {e}"),
                }
            })
        }));

        let (states_tx, states_rx) = watch::channel(NegotiationState::New);
        peer.on_peer_connection_state_change(Box::new(move |state| {
            let negotiation = match state {
                RTCPeerConnectionState::New => NegotiationState::New,
                RTCPeerConnectionState::Connecting => NegotiationState::Connecting,
                RTCPeerConnectionState::Connected => NegotiationState::Connected,
                RTCPeerConnectionState::Disconnected => NegotiationState::Disconnected,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                    NegotiationState::Failed
                }
                RTCPeerConnectionState::Unspecified => NegotiationState::New,
            };
            debug!("Peer connection state: {state:?}");
            let _ = states_tx.send(negotiation);
            Box::pin(async {})
        }));

        Ok(PeerHandle {
            transport: Arc::new(WebRtcTransport { peer }),
            candidates: candidates_rx,
            states: states_rx,
        })
    }
}

pub struct WebRtcTransport {
    peer: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()> {
        let sender = self.peer.add_track(track).await?;
        // Drain RTCP so the interceptors keep working.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self.peer.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.peer.set_local_description(offer).await?;
        Ok(sdp)
    }

    async fn create_answer(&self, remote_offer: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(remote_offer.to_string())?;
        self.peer.set_remote_description(offer).await?;
        let answer = self.peer.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.peer.set_local_description(answer).await?;
        Ok(sdp)
    }

    async fn apply_answer(&self, remote_answer: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(remote_answer.to_string())?;
        self.peer.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Signaling(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.peer.close().await {
            debug!("Peer connection close: {e}");
        }
    }
}
