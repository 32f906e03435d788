//! One-to-one call orchestration.
//!
//! [`CallSignaling`] owns at most one call at a time and drives it through
//! the signaling events on the realtime channel: initiate and incoming on
//! one side, offer/answer/ICE on the other, with media devices and the peer
//! transport acquired only once both sides have committed. Remote candidates
//! that arrive before the remote description are buffered and flushed in
//! arrival order. Device and transport resources are released exactly once
//! no matter which path ends the call.

pub mod media;
pub mod state;
pub mod transport;

use crate::api::ApiClient;
use crate::auth::{AuthEvent, CredentialGuard};
use crate::channel::ChannelManager;
use crate::error::{Error, Result};
use crate::events::{ClientEvent, ServerEvent};
use crate::models::{CallSession, CallStatus, IceCandidate, MediaControls, NegotiationState};
use async_trait::async_trait;
use log::{debug, info, warn};
use media::{MediaDevices, MediaSession};
use state::{apply_transition, CallTransition};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use transport::{PeerTransport, TransportFactory};

/// Server-side call registration, behind a seam so tests can script it.
#[async_trait]
pub trait CallDirectory: Send + Sync {
    async fn create_call(
        &self,
        conversation_id: &str,
        participant_id: &str,
    ) -> Result<CallSession>;
}

#[async_trait]
impl CallDirectory for ApiClient {
    async fn create_call(
        &self,
        conversation_id: &str,
        participant_id: &str,
    ) -> Result<CallSession> {
        ApiClient::create_call(self, conversation_id, participant_id).await
    }
}

/// What call orchestration surfaces to the UI layer.
#[derive(Debug, Clone)]
pub enum CallUpdate {
    Outgoing(CallSession),
    Incoming(CallSession),
    StatusChanged(CallSession),
    RemoteMedia {
        call_id: String,
        is_muted: bool,
        is_camera_off: bool,
    },
    Error {
        call_id: Option<String>,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallDirection {
    Outgoing,
    Incoming,
}

struct ActiveCall {
    session: CallSession,
    direction: CallDirection,
    wants_video: bool,
    controls: MediaControls,
    media: Option<Box<dyn MediaSession>>,
    transport: Option<Arc<dyn PeerTransport>>,
    /// Remote candidates received before the remote description is in place.
    pending_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    pumps: Vec<JoinHandle<()>>,
}

impl ActiveCall {
    fn new(session: CallSession, direction: CallDirection, wants_video: bool) -> Self {
        Self {
            session,
            direction,
            wants_video,
            controls: MediaControls::default(),
            media: None,
            transport: None,
            pending_candidates: Vec::new(),
            remote_description_set: false,
            pumps: Vec::new(),
        }
    }

    fn is_live(&self) -> bool {
        !self.session.status.is_terminal()
    }
}

pub struct CallSignaling {
    channel: Arc<ChannelManager>,
    directory: Arc<dyn CallDirectory>,
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn TransportFactory>,
    inner: tokio::sync::Mutex<Option<ActiveCall>>,
    updates_tx: mpsc::UnboundedSender<CallUpdate>,
}

impl CallSignaling {
    pub fn new(
        channel: Arc<ChannelManager>,
        guard: Arc<CredentialGuard>,
        directory: Arc<dyn CallDirectory>,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn TransportFactory>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CallUpdate>) {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let signaling = Arc::new(Self {
            channel: channel.clone(),
            directory,
            devices,
            factory,
            inner: tokio::sync::Mutex::new(None),
            updates_tx,
        });
        tokio::spawn(
            signaling
                .clone()
                .run(channel.subscribe_events(), guard.subscribe()),
        );
        (signaling, updates_rx)
    }

    pub async fn current_call(&self) -> Option<CallSession> {
        self.inner.lock().await.as_ref().map(|c| c.session.clone())
    }

    /// Register a call with the server and ring the participant. Fails
    /// without side effects when a call is already live or the host has no
    /// media devices.
    pub async fn initiate_call(
        &self,
        conversation_id: &str,
        participant_id: &str,
        video: bool,
    ) -> Result<CallSession> {
        if !self.devices.is_supported() {
            return Err(Error::MediaUnsupported);
        }
        let mut slot = self.inner.lock().await;
        if slot.as_ref().is_some_and(ActiveCall::is_live) {
            return Err(Error::Busy);
        }

        let mut session = self
            .directory
            .create_call(conversation_id, participant_id)
            .await?;
        session.status = CallStatus::Calling;
        self.channel.send(&ClientEvent::CallInitiate {
            call_id: session.id.clone(),
            conversation_id: conversation_id.to_string(),
            participant_id: participant_id.to_string(),
        })?;

        info!("Initiated call {} to {participant_id}", session.id);
        *slot = Some(ActiveCall::new(
            session.clone(),
            CallDirection::Outgoing,
            video,
        ));
        self.emit(CallUpdate::Outgoing(session.clone()));
        Ok(session)
    }

    /// Accept the ringing incoming call. Media starts when the initiator's
    /// offer arrives.
    pub async fn accept_call(&self) -> Result<()> {
        if !self.devices.is_supported() {
            return Err(Error::MediaUnsupported);
        }
        let slot = self.inner.lock().await;
        let call = slot
            .as_ref()
            .filter(|c| {
                c.direction == CallDirection::Incoming && c.session.status == CallStatus::Ringing
            })
            .ok_or_else(|| Error::InvalidCallState("no ringing incoming call".to_string()))?;
        self.channel.send(&ClientEvent::CallAccept {
            call_id: call.session.id.clone(),
        })
    }

    /// Decline the ringing incoming call.
    pub async fn reject_call(&self) -> Result<()> {
        let mut slot = self.inner.lock().await;
        let matches = slot.as_ref().is_some_and(|c| {
            c.direction == CallDirection::Incoming && c.session.status == CallStatus::Ringing
        });
        if !matches {
            return Err(Error::InvalidCallState(
                "no ringing incoming call".to_string(),
            ));
        }
        let Some(mut call) = slot.take() else {
            return Err(Error::InvalidCallState(
                "no ringing incoming call".to_string(),
            ));
        };
        self.channel.send(&ClientEvent::CallReject {
            call_id: call.session.id.clone(),
            reason: None,
        })?;
        apply_transition(&mut call.session, CallTransition::Rejected)?;
        self.emit(CallUpdate::StatusChanged(call.session.clone()));
        release_resources(&mut call);
        Ok(())
    }

    /// Hang up the live call and release devices.
    pub async fn end_call(&self) -> Result<()> {
        let mut slot = self.inner.lock().await;
        if !slot.as_ref().is_some_and(ActiveCall::is_live) {
            return Err(Error::InvalidCallState("no live call".to_string()));
        }
        let Some(mut call) = slot.take() else {
            return Err(Error::InvalidCallState("no live call".to_string()));
        };
        let _ = self.channel.send(&ClientEvent::CallEnd {
            call_id: call.session.id.clone(),
        });
        apply_transition(&mut call.session, CallTransition::Ended)?;
        info!(
            "Call {} ended after {:?}s",
            call.session.id, call.session.duration_secs
        );
        self.emit(CallUpdate::StatusChanged(call.session.clone()));
        release_resources(&mut call);
        Ok(())
    }

    pub async fn toggle_mute(&self) -> Result<MediaControls> {
        self.with_live_call(|call| {
            call.controls.is_muted = !call.controls.is_muted;
            if let Some(media) = &call.media {
                media.set_audio_enabled(!call.controls.is_muted);
            }
            true
        })
        .await
    }

    pub async fn toggle_camera(&self) -> Result<MediaControls> {
        self.with_live_call(|call| {
            call.controls.is_camera_off = !call.controls.is_camera_off;
            if let Some(media) = &call.media {
                media.set_video_enabled(!call.controls.is_camera_off);
            }
            true
        })
        .await
    }

    /// Speaker state is local playback only; the peer is not told.
    pub async fn toggle_speaker(&self) -> Result<MediaControls> {
        self.with_live_call(|call| {
            call.controls.is_speaker_muted = !call.controls.is_speaker_muted;
            false
        })
        .await
    }

    /// Flip a control on the live call; `announce` decides whether the new
    /// state is mirrored to the peer. Never triggers renegotiation.
    async fn with_live_call(
        &self,
        flip: impl FnOnce(&mut ActiveCall) -> bool,
    ) -> Result<MediaControls> {
        let mut slot = self.inner.lock().await;
        let call = slot
            .as_mut()
            .filter(|c| c.is_live())
            .ok_or_else(|| Error::InvalidCallState("no live call".to_string()))?;
        let announce = flip(call);
        if announce {
            let _ = self.channel.send(&ClientEvent::CallMediaStatus {
                call_id: call.session.id.clone(),
                is_muted: call.controls.is_muted,
                is_camera_off: call.controls.is_camera_off,
            });
        }
        Ok(call.controls)
    }

    /// Tear down any live call without signaling the peer, for logout and
    /// client shutdown.
    pub async fn shutdown(&self) {
        let mut slot = self.inner.lock().await;
        let Some(mut call) = slot.take() else {
            return;
        };
        if apply_transition(&mut call.session, CallTransition::Ended).is_ok() {
            self.emit(CallUpdate::StatusChanged(call.session.clone()));
        }
        release_resources(&mut call);
    }

    async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<ServerEvent>,
        mut auth: broadcast::Receiver<AuthEvent>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Call event stream lagged, {n} events lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                event = auth.recv() => match event {
                    Ok(AuthEvent::LoggedOut) => self.shutdown().await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::CallIncoming { call } => self.on_incoming(call).await,
            ServerEvent::CallAccepted { call_id } => self.on_accepted(&call_id).await,
            ServerEvent::CallOffer { call_id, sdp } => self.on_offer(&call_id, &sdp).await,
            ServerEvent::CallAnswer { call_id, sdp } => self.on_answer(&call_id, &sdp).await,
            ServerEvent::CallIceCandidate { call_id, candidate } => {
                self.on_remote_candidate(&call_id, candidate).await;
            }
            ServerEvent::CallRejected { call_id, reason } => {
                self.on_terminated(&call_id, CallTransition::Rejected, reason.as_deref())
                    .await;
            }
            ServerEvent::CallEnded { call_id } => {
                self.on_terminated(&call_id, CallTransition::Ended, None).await;
            }
            ServerEvent::CallMediaStatus {
                call_id,
                is_muted,
                is_camera_off,
            } => {
                self.emit(CallUpdate::RemoteMedia {
                    call_id,
                    is_muted,
                    is_camera_off,
                });
            }
            ServerEvent::CallError { call_id, message } => {
                let active = self.current_call().await.map(|c| c.id);
                match (&call_id, &active) {
                    (Some(id), Some(current)) if id == current => {
                        self.fail_active(id, &message).await;
                    }
                    _ => self.emit(CallUpdate::Error { call_id, message }),
                }
            }
            _ => {}
        }
    }

    async fn on_incoming(&self, mut call: CallSession) {
        let mut slot = self.inner.lock().await;
        if slot.as_ref().is_some_and(ActiveCall::is_live) {
            info!("Busy, rejecting incoming call {}", call.id);
            let _ = self.channel.send(&ClientEvent::CallReject {
                call_id: call.id,
                reason: Some("busy".to_string()),
            });
            return;
        }
        call.status = CallStatus::Ringing;
        *slot = Some(ActiveCall::new(call.clone(), CallDirection::Incoming, true));
        self.emit(CallUpdate::Incoming(call));
    }

    /// Initiator side: the callee accepted, start media and send the offer.
    async fn on_accepted(self: &Arc<Self>, call_id: &str) {
        let mut slot = self.inner.lock().await;
        let matches = slot.as_ref().is_some_and(|c| {
            c.session.id == call_id
                && c.direction == CallDirection::Outgoing
                && c.session.status == CallStatus::Calling
        });
        if !matches {
            debug!("Ignoring acceptance for unknown call {call_id}");
            return;
        }
        let Some(call) = slot.as_mut() else { return };

        let offer = async {
            self.start_media(call).await?;
            let transport = call.transport.as_ref().ok_or(Error::ChannelDown)?;
            transport.create_offer().await
        }
        .await;
        match offer {
            Ok(sdp) => {
                let send = self.channel.send(&ClientEvent::CallOffer {
                    call_id: call_id.to_string(),
                    sdp,
                });
                if let Err(e) = send {
                    self.fail_slot(&mut slot, &e.to_string());
                }
            }
            Err(e) => {
                warn!("Offer setup failed: {e}");
                self.fail_slot(&mut slot, "couldn't start call media");
            }
        }
    }

    /// Callee side: the initiator's offer arrived, start media and answer.
    /// The remote description is now in place, so buffered candidates flush.
    async fn on_offer(self: &Arc<Self>, call_id: &str, sdp: &str) {
        let mut slot = self.inner.lock().await;
        let matches = slot.as_ref().is_some_and(|c| {
            c.session.id == call_id && c.direction == CallDirection::Incoming && c.is_live()
        });
        if !matches {
            debug!("Ignoring offer for unknown call {call_id}");
            return;
        }
        let Some(call) = slot.as_mut() else { return };

        let answer = async {
            self.start_media(call).await?;
            let transport = call.transport.as_ref().ok_or(Error::ChannelDown)?;
            let answer = transport.create_answer(sdp).await?;
            call.remote_description_set = true;
            Ok::<_, Error>(answer)
        }
        .await;
        match answer {
            Ok(sdp) => {
                flush_candidates(call).await;
                let send = self.channel.send(&ClientEvent::CallAnswer {
                    call_id: call_id.to_string(),
                    sdp,
                });
                if let Err(e) = send {
                    self.fail_slot(&mut slot, &e.to_string());
                }
            }
            Err(e) => {
                warn!("Answer setup failed: {e}");
                self.fail_slot(&mut slot, "couldn't start call media");
            }
        }
    }

    /// Initiator side: the callee's answer arrived.
    async fn on_answer(&self, call_id: &str, sdp: &str) {
        let mut slot = self.inner.lock().await;
        let matches = slot
            .as_ref()
            .is_some_and(|c| c.session.id == call_id && c.is_live() && c.transport.is_some());
        if !matches {
            debug!("Ignoring answer for unknown call {call_id}");
            return;
        }
        let Some(call) = slot.as_mut() else { return };
        let Some(transport) = call.transport.clone() else {
            return;
        };
        match transport.apply_answer(sdp).await {
            Ok(()) => {
                call.remote_description_set = true;
                flush_candidates(call).await;
            }
            Err(e) => {
                warn!("Applying answer failed: {e}");
                self.fail_slot(&mut slot, "couldn't apply call answer");
            }
        }
    }

    async fn on_remote_candidate(&self, call_id: &str, candidate: IceCandidate) {
        let mut slot = self.inner.lock().await;
        let Some(call) = slot
            .as_mut()
            .filter(|c| c.session.id == call_id && c.is_live())
        else {
            debug!("Dropping candidate for unknown call {call_id}");
            return;
        };
        if call.remote_description_set {
            if let Some(transport) = &call.transport {
                if let Err(e) = transport.add_remote_candidate(candidate).await {
                    warn!("Candidate rejected by transport: {e}");
                }
                return;
            }
        }
        call.pending_candidates.push(candidate);
    }

    async fn on_terminated(
        &self,
        call_id: &str,
        transition: CallTransition,
        reason: Option<&str>,
    ) {
        let mut slot = self.inner.lock().await;
        if !slot.as_ref().is_some_and(|c| c.session.id == call_id) {
            debug!("Ignoring termination for unknown call {call_id}");
            return;
        }
        let Some(mut call) = slot.take() else { return };
        if let Some(reason) = reason {
            info!("Call {call_id} rejected: {reason}");
        }
        if apply_transition(&mut call.session, transition).is_ok() {
            self.emit(CallUpdate::StatusChanged(call.session.clone()));
        }
        release_resources(&mut call);
    }

    /// Transport reports media flowing; only now does the call go active.
    async fn mark_connected(&self, call_id: &str) {
        let mut slot = self.inner.lock().await;
        let Some(call) = slot
            .as_mut()
            .filter(|c| c.session.id == call_id && !c.session.status.is_terminal())
        else {
            return;
        };
        if apply_transition(&mut call.session, CallTransition::Connected).is_ok() {
            info!("Call {call_id} is active");
            self.emit(CallUpdate::StatusChanged(call.session.clone()));
        }
    }

    async fn fail_active(&self, call_id: &str, message: &str) {
        let mut slot = self.inner.lock().await;
        if slot.as_ref().is_some_and(|c| c.session.id == call_id) {
            self.fail_slot(&mut slot, message);
        }
    }

    fn fail_slot(&self, slot: &mut Option<ActiveCall>, message: &str) {
        let Some(mut call) = slot.take() else { return };
        warn!("Call {} failed: {message}", call.session.id);
        if apply_transition(&mut call.session, CallTransition::Failed).is_ok() {
            self.emit(CallUpdate::StatusChanged(call.session.clone()));
        }
        self.emit(CallUpdate::Error {
            call_id: Some(call.session.id.clone()),
            message: message.to_string(),
        });
        release_resources(&mut call);
    }

    /// Acquire devices, build the peer transport, attach local tracks, and
    /// start the candidate and state pumps.
    async fn start_media(self: &Arc<Self>, call: &mut ActiveCall) -> Result<()> {
        let media = self.devices.acquire(call.wants_video).await?;
        let handle = self.factory.build().await?;
        for track in media.tracks() {
            handle.transport.add_track(track).await?;
        }
        call.media = Some(media);
        call.transport = Some(handle.transport);
        self.spawn_pumps(call, handle.candidates, handle.states);
        Ok(())
    }

    fn spawn_pumps(
        self: &Arc<Self>,
        call: &mut ActiveCall,
        mut candidates: mpsc::UnboundedReceiver<IceCandidate>,
        mut states: watch::Receiver<NegotiationState>,
    ) {
        let call_id = call.session.id.clone();
        let channel = self.channel.clone();
        let candidate_call_id = call_id.clone();
        call.pumps.push(tokio::spawn(async move {
            while let Some(candidate) = candidates.recv().await {
                let _ = channel.send(&ClientEvent::CallIceCandidate {
                    call_id: candidate_call_id.clone(),
                    candidate,
                });
            }
        }));

        let this = Arc::downgrade(self);
        call.pumps.push(tokio::spawn(async move {
            loop {
                if states.changed().await.is_err() {
                    return;
                }
                let state = *states.borrow_and_update();
                let Some(this) = this.upgrade() else { return };
                match state {
                    NegotiationState::Connected => this.mark_connected(&call_id).await,
                    NegotiationState::Failed => {
                        this.fail_active(&call_id, "media connection failed").await;
                        return;
                    }
                    NegotiationState::Disconnected => {
                        warn!("Call {call_id} transport disconnected, waiting for recovery");
                    }
                    _ => {}
                }
            }
        }));
    }

    fn emit(&self, update: CallUpdate) {
        let _ = self.updates_tx.send(update);
    }
}

async fn flush_candidates(call: &mut ActiveCall) {
    let Some(transport) = &call.transport else {
        return;
    };
    for candidate in call.pending_candidates.drain(..) {
        if let Err(e) = transport.add_remote_candidate(candidate).await {
            warn!("Buffered candidate rejected by transport: {e}");
        }
    }
}

/// Release the call's device and transport resources. Safe to reach from
/// several paths; each resource is taken out of its slot so a second pass
/// finds nothing to do. The transport close runs detached so a pump ending
/// its own call cannot cancel the cleanup mid-way.
fn release_resources(call: &mut ActiveCall) {
    if let Some(mut media) = call.media.take() {
        media.release();
    }
    if let Some(transport) = call.transport.take() {
        tokio::spawn(async move { transport.close().await });
    }
    for pump in call.pumps.drain(..) {
        pump.abort();
    }
}
