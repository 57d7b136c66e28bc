use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

use super::{
    ConnectionState, LocalDescription, SignalingState, Transport, TransportError, TransportEvent,
};
use crate::chat::{ChatChannel, ChatError};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

const DATA_CHANNEL_LABEL: &str = "jetty-chat";

#[derive(Clone, Copy, Debug)]
pub enum WebRtcRole {
    Offerer,
    Answerer,
}

/// Transport backed by a real `RTCPeerConnection`. The offerer creates the
/// chat data channel up front; the answerer adopts it when it arrives.
///
/// The engine has no description rollback, so the impolite glare path reports
/// a recoverable apply failure here. Deployments on this adapter give the two
/// peers fixed offerer/answerer roles and never collide; full glare coverage
/// runs against the in-memory engine instead.
pub struct WebRtcTransport {
    role: WebRtcRole,
    pc: Arc<RTCPeerConnection>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    have_remote: AtomicBool,
    /// Candidates that arrived before the remote description; flushed once it
    /// is applied. Real engines reject them outright.
    pending_candidates: AsyncMutex<Vec<IceCandidate>>,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<String>>,
    dc_open: Arc<AtomicBool>,
    _router: Option<Arc<AsyncMutex<Router>>>,
}

impl WebRtcTransport {
    pub async fn new(role: WebRtcRole) -> Result<Arc<Self>, TransportError> {
        Self::with_engine(role, default_setting_engine(), RTCConfiguration::default(), None).await
    }

    /// Build an offerer/answerer pair joined by a virtual network, so the
    /// whole establishment can run without OS networking access.
    pub async fn vnet_pair() -> Result<(Arc<Self>, Arc<Self>), TransportError> {
        let wan = Arc::new(AsyncMutex::new(
            Router::new(RouterConfig {
                cidr: "10.0.0.0/24".to_owned(),
                ..Default::default()
            })
            .map_err(to_setup_error)?,
        ));

        let offer_vnet = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec!["10.0.0.2".to_owned()],
            ..Default::default()
        })));
        attach_vnet_to_router(&offer_vnet, &wan).await?;

        let answer_vnet = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec!["10.0.0.3".to_owned()],
            ..Default::default()
        })));
        attach_vnet_to_router(&answer_vnet, &wan).await?;

        {
            let mut router = wan.lock().await;
            router.start().await.map_err(to_setup_error)?;
        }

        let mut offer_setting = default_setting_engine();
        offer_setting.set_vnet(Some(offer_vnet));
        let mut answer_setting = default_setting_engine();
        answer_setting.set_vnet(Some(answer_vnet));

        let offerer = Self::with_engine(
            WebRtcRole::Offerer,
            offer_setting,
            RTCConfiguration::default(),
            Some(Arc::clone(&wan)),
        )
        .await?;
        let answerer = Self::with_engine(
            WebRtcRole::Answerer,
            answer_setting,
            RTCConfiguration::default(),
            Some(wan),
        )
        .await?;
        Ok((offerer, answerer))
    }

    async fn with_engine(
        role: WebRtcRole,
        setting: SettingEngine,
        config: RTCConfiguration,
        router: Option<Arc<AsyncMutex<Router>>>,
    ) -> Result<Arc<Self>, TransportError> {
        let api = build_api(setting)?;
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        let outbound_slot = Arc::new(AsyncMutex::new(Some(outbound_rx)));
        let dc_open = Arc::new(AtomicBool::new(false));
        let dc_ready = Arc::new(Notify::new());

        let candidate_events = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(json) => {
                        let _ = events.send(TransportEvent::CandidateDiscovered(IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index.map(|idx| idx as u32),
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "webrtc",
                            error = %err,
                            "failed to serialize local candidate"
                        );
                    }
                }
            })
        }));

        let renegotiation_events = events_tx.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let events = renegotiation_events.clone();
            Box::pin(async move {
                let _ = events.send(TransportEvent::RenegotiationNeeded);
            })
        }));

        let signaling_events = events_tx.clone();
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            let events = signaling_events.clone();
            Box::pin(async move {
                let _ = events.send(TransportEvent::SignalingStateChanged(map_signaling_state(
                    state,
                )));
            })
        }));

        let connection_events = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = connection_events.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", ?state, "peer connection state changed");
                let _ = events.send(TransportEvent::ConnectionStateChanged(map_connection_state(
                    state,
                )));
            })
        }));

        match role {
            WebRtcRole::Offerer => {
                let dc_init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let dc = pc
                    .create_data_channel(DATA_CHANNEL_LABEL, Some(dc_init))
                    .await
                    .map_err(to_setup_error)?;
                wire_data_channel(
                    dc,
                    inbound_tx,
                    Arc::clone(&outbound_slot),
                    Arc::clone(&dc_open),
                    Arc::clone(&dc_ready),
                );
            }
            WebRtcRole::Answerer => {
                let inbound_for_dc = inbound_tx.clone();
                let slot_for_dc = Arc::clone(&outbound_slot);
                let open_for_dc = Arc::clone(&dc_open);
                let ready_for_dc = Arc::clone(&dc_ready);
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let inbound = inbound_for_dc.clone();
                    let slot = slot_for_dc.clone();
                    let open = open_for_dc.clone();
                    let ready = ready_for_dc.clone();
                    Box::pin(async move {
                        tracing::debug!(
                            target = "webrtc",
                            label = dc.label(),
                            "remote data channel arrived"
                        );
                        wire_data_channel(dc, inbound, slot, open, ready);
                    })
                }));
            }
        }

        Ok(Arc::new(Self {
            role,
            pc,
            events_rx: Mutex::new(Some(events_rx)),
            have_remote: AtomicBool::new(false),
            pending_candidates: AsyncMutex::new(Vec::new()),
            outbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            dc_open,
            _router: router,
        }))
    }

    pub fn role(&self) -> WebRtcRole {
        self.role
    }

    #[cfg(test)]
    async fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.lock().await.len()
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: LocalDescription,
    ) -> Result<(), TransportError> {
        match description {
            LocalDescription::Apply(desc) => {
                let rtc_desc = to_rtc_description(&desc)?;
                self.pc
                    .set_local_description(rtc_desc)
                    .await
                    .map_err(to_setup_error)
            }
            LocalDescription::Rollback => Err(TransportError::Setup(
                "description rollback is not supported by this engine".into(),
            )),
        }
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let rtc_desc = to_rtc_description(&description)?;
        self.pc
            .set_remote_description(rtc_desc)
            .await
            .map_err(to_setup_error)?;

        // Flush candidates that beat the description here. The flag flips
        // under the same lock the buffering path takes, so nothing can slip
        // into the buffer afterwards.
        let buffered = {
            let mut pending = self.pending_candidates.lock().await;
            self.have_remote.store(true, Ordering::SeqCst);
            std::mem::take(&mut *pending)
        };
        for candidate in buffered {
            if let Err(err) = self.apply_candidate(candidate).await {
                tracing::warn!(
                    target = "webrtc",
                    error = %err,
                    "failed to apply buffered candidate"
                );
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        {
            let mut pending = self.pending_candidates.lock().await;
            if !self.have_remote.load(Ordering::SeqCst) {
                tracing::debug!(
                    target = "webrtc",
                    "buffering candidate until remote description arrives"
                );
                pending.push(candidate);
                return Ok(());
            }
        }
        self.apply_candidate(candidate).await
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state())
    }

    fn events(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        self.events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::Setup("event stream already taken".into()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(to_setup_error)
    }
}

impl WebRtcTransport {
    async fn apply_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index.map(|idx| idx as u16),
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(to_setup_error)
    }
}

#[async_trait]
impl ChatChannel for WebRtcTransport {
    fn send_text(&self, text: &str) -> Result<(), ChatError> {
        if !self.dc_open.load(Ordering::SeqCst) {
            return Err(ChatError::NotOpen);
        }
        self.outbound_tx
            .send(text.as_bytes().to_vec())
            .map_err(|_| ChatError::Closed)
    }

    async fn recv_text(&self) -> Option<String> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await
    }
}

fn wire_data_channel(
    dc: Arc<RTCDataChannel>,
    inbound_tx: mpsc::UnboundedSender<String>,
    outbound_slot: Arc<AsyncMutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>>,
    dc_open: Arc<AtomicBool>,
    dc_ready: Arc<Notify>,
) {
    let open_flag = Arc::clone(&dc_open);
    let ready = Arc::clone(&dc_ready);
    dc.on_open(Box::new(move || {
        let open_flag = Arc::clone(&open_flag);
        let ready = Arc::clone(&ready);
        Box::pin(async move {
            tracing::debug!(target = "webrtc", "data channel opened");
            open_flag.store(true, Ordering::SeqCst);
            ready.notify_waiters();
            ready.notify_one();
        })
    }));

    let close_flag = Arc::clone(&dc_open);
    dc.on_close(Box::new(move || {
        let close_flag = Arc::clone(&close_flag);
        Box::pin(async move {
            tracing::debug!(target = "webrtc", "data channel closed");
            close_flag.store(false, Ordering::SeqCst);
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let inbound = inbound_tx.clone();
        Box::pin(async move {
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            if inbound.send(text).is_err() {
                tracing::debug!(target = "webrtc", "inbound chat receiver dropped");
            }
        })
    }));

    let dc_for_sender = Arc::clone(&dc);
    tokio::spawn(async move {
        let mut outbound_rx = match outbound_slot.lock().await.take() {
            Some(rx) => rx,
            // A second channel with the same label; the first one already
            // owns the outbound queue.
            None => return,
        };
        if !dc_open.load(Ordering::SeqCst) {
            dc_ready.notified().await;
        }
        while let Some(data) = outbound_rx.recv().await {
            let payload = Bytes::from(data);
            if let Err(err) = dc_for_sender.send(&payload).await {
                tracing::warn!(target = "webrtc", error = %err, "data channel send error");
                break;
            }
        }
        tracing::trace!(target = "webrtc", "chat sender loop ended");
    });
}

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn default_setting_engine() -> SettingEngine {
    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(Duration::from_secs(3)),
        Some(Duration::from_secs(10)),
        Some(Duration::from_millis(500)),
    );
    setting
}

async fn attach_vnet_to_router(
    vnet: &Arc<Net>,
    router: &Arc<AsyncMutex<Router>>,
) -> Result<(), TransportError> {
    let nic = vnet.get_nic().map_err(to_setup_error)?;
    {
        let nic_clone = Arc::clone(&nic);
        let mut router_guard = router.lock().await;
        router_guard
            .add_net(nic_clone)
            .await
            .map_err(to_setup_error)?;
    }
    {
        let nic_guard = nic.lock().await;
        nic_guard
            .set_router(Arc::clone(router))
            .await
            .map_err(to_setup_error)?;
    }
    Ok(())
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()).map_err(to_setup_error),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()).map_err(to_setup_error),
    }
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed | RTCSignalingState::Unspecified => SignalingState::Closed,
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}
