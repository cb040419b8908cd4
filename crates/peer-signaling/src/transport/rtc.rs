//! webrtc-rs backend.
//!
//! Every peer connection pre-creates one negotiated, ordered data channel
//! (stream id 0) so both ends agree on it without an in-band open, and the
//! SCTP section is already part of the first offer. Local media tracks
//! handed to the factory are attached before that channel.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    DataChannel, LinkState, MediaKind, PeerTransport, SdpKind, TransportEvent, TransportEvents,
    TransportFactory,
};
use crate::candidate::{IceCandidate, CANDIDATE_MLINE_INDEX, CANDIDATE_SDP_MID};
use crate::error::TransportError;
use crate::identity::PeerId;
use crate::shared::{Holder, SharedResource};

const CHANNEL_STREAM_ID: u16 = 0;

static RTC_API: SharedResource<API> = SharedResource::new();

fn build_api() -> Result<API, webrtc::Error> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media)?;
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

/// The process-wide webrtc API, built on first use by either holder.
pub fn rtc_api(holder: Holder) -> Result<Arc<API>, TransportError> {
    RTC_API
        .acquire(holder, build_api)
        .map_err(|err| TransportError::Setup(format!("webrtc api: {err}")))
}

/// Drops the holder's claim; the API is freed once no holder remains.
pub fn release_rtc_api(holder: Holder) -> bool {
    RTC_API.release(holder)
}

pub struct RtcTransportFactory {
    ice_servers: Vec<String>,
    channel_label: String,
    holder: Holder,
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: Vec<String>, channel_label: impl Into<String>) -> Self {
        Self {
            ice_servers,
            channel_label: channel_label.into(),
            holder: Holder::Foreground,
            tracks: Vec::new(),
        }
    }

    /// Attaches `track` to every connection this factory builds. The
    /// caller owns the capture side and writes samples into the track.
    pub fn with_track(mut self, track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        self.tracks.push(track);
        self
    }

    pub fn with_holder(mut self, holder: Holder) -> Self {
        self.holder = holder;
        self
    }
}

fn setup_err(err: webrtc::Error) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn description_err(err: webrtc::Error) -> TransportError {
    TransportError::Description(err.to_string())
}

fn media_kind(kind: RTPCodecType) -> MediaKind {
    match kind {
        RTPCodecType::Audio => MediaKind::Audio,
        RTPCodecType::Video => MediaKind::Video,
        _ => MediaKind::Unknown,
    }
}

fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        peer: &PeerId,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let api = rtc_api(self.holder)?;
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let connection = Arc::new(api.new_peer_connection(config).await.map_err(setup_err)?);

        let candidate_events = events.clone();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.emit(TransportEvent::LocalCandidate(init.candidate)),
                    Err(err) => warn!(target = "signaling.rtc", error = %err, "unserializable local candidate"),
                }
            })
        }));

        let state_events = events.clone();
        let state_peer = peer.clone();
        connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            let peer = state_peer.clone();
            Box::pin(async move {
                debug!(target = "signaling.rtc", peer = %peer, state = %state, "peer connection state");
                if let Some(link) = link_state(state) {
                    events.emit(TransportEvent::Link(link));
                }
            })
        }));

        let track_events = events.clone();
        connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    events.emit(TransportEvent::RemoteTrack {
                        id: track.id(),
                        kind: media_kind(track.kind()),
                    });
                })
            },
        ));

        for track in &self.tracks {
            let sender = connection.add_track(track.clone()).await.map_err(setup_err)?;
            debug!(target = "signaling.rtc", peer = %peer, track = track.id(), "local track attached");
            // drain RTCP so the interceptors keep running
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        let init = RTCDataChannelInit {
            ordered: Some(true),
            negotiated: Some(CHANNEL_STREAM_ID),
            ..Default::default()
        };
        let channel = connection
            .create_data_channel(&self.channel_label, Some(init))
            .await
            .map_err(setup_err)?;
        wire_channel(&channel, &events);

        Ok(Arc::new(RtcTransport {
            peer: peer.clone(),
            connection,
            channel: Arc::new(RtcDataChannel { inner: channel }),
        }))
    }
}

fn wire_channel(channel: &Arc<RTCDataChannel>, events: &TransportEvents) {
    let message_events = events.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => events.emit(TransportEvent::ChannelMessage(text)),
                Err(_) => debug!(target = "signaling.rtc", bytes = msg.data.len(), "binary channel message ignored"),
            }
        })
    }));
    let close_events = events.clone();
    channel.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            events.emit(TransportEvent::ChannelClosed);
        })
    }));
}

struct RtcTransport {
    peer: PeerId,
    connection: Arc<RTCPeerConnection>,
    channel: Arc<RtcDataChannel>,
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(description_err)?;
        let sdp = offer.sdp.clone();
        self.connection
            .set_local_description(offer)
            .await
            .map_err(description_err)?;
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(description_err)?;
        let sdp = answer.sdp.clone();
        self.connection
            .set_local_description(answer)
            .await
            .map_err(description_err)?;
        Ok(sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), TransportError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(description_err)?;
        self.connection
            .set_remote_description(description)
            .await
            .map_err(description_err)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.as_str().to_string(),
            sdp_mid: Some(CANDIDATE_SDP_MID.to_string()),
            sdp_mline_index: Some(CANDIDATE_MLINE_INDEX),
            username_fragment: None,
        };
        self.connection
            .add_ice_candidate(init)
            .await
            .map_err(|err| TransportError::Candidate(err.to_string()))
    }

    async fn open_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        if label != self.channel.label() {
            return Err(TransportError::Channel(format!(
                "only the negotiated channel '{}' is available",
                self.channel.label()
            )));
        }
        if self.channel.inner.ready_state() == RTCDataChannelState::Closed {
            return Err(TransportError::Channel("negotiated channel already closed".into()));
        }
        Ok(self.channel.clone())
    }

    async fn close(&self) -> Result<(), TransportError> {
        debug!(target = "signaling.rtc", peer = %self.peer, "closing peer connection");
        self.connection
            .close()
            .await
            .map_err(|err| TransportError::Other(err.to_string()))
    }
}

struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, payload: &str) -> Result<(), TransportError> {
        self.inner
            .send_text(payload.to_string())
            .await
            .map(|_| ())
            .map_err(|err| TransportError::Channel(err.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.inner.ready_state() == RTCDataChannelState::Closed {
            return Ok(());
        }
        self.inner
            .close()
            .await
            .map_err(|err| TransportError::Channel(err.to_string()))
    }
}
