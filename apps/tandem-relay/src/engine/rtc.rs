use std::sync::Arc;

use async_trait::async_trait;
use tandem_proto::{IceCandidateInit, PeerRole, SdpKind, SessionDescription};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::{
    configure_nack, configure_rtcp_reports, configure_twcc_sender_only,
};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpHeaderExtensionCapability, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::sdp::extmap::{
    AUDIO_LEVEL_URI, SDES_MID_URI, SDES_REPAIR_RTP_STREAM_ID_URI, SDES_RTP_STREAM_ID_URI,
};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc_ice::udp_network::{EphemeralUDP, UDPNetwork};

use super::{
    ConnectionState, IceState, MediaKind, PeerSession, SessionContext, SessionEvent,
    SessionFactory,
};
use crate::config::AppConfig;
use crate::error::EngineError;
use crate::metrics;
use crate::registry::ClientId;

const MEDIA_READ_BUFFER: usize = 1400;
const RTCP_READ_BUFFER: usize = 1500;

#[derive(Debug, Clone, Default)]
pub struct RtcSettings {
    pub port_range: Option<(u16, u16)>,
    pub public_ips: Vec<String>,
    pub stun_urls: Vec<String>,
}

impl From<&AppConfig> for RtcSettings {
    fn from(cfg: &AppConfig) -> Self {
        RtcSettings {
            port_range: Some(cfg.port_range()),
            public_ips: cfg.public_ips(),
            stun_urls: cfg.stun_servers(),
        }
    }
}

/// Session factory backed by the `webrtc` crate. The API (codecs,
/// interceptors, network settings) is assembled once, so configuration
/// mistakes surface at startup rather than on the first client.
pub struct RtcSessionFactory {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcSessionFactory {
    pub fn new(settings: &RtcSettings) -> Result<Self, EngineError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = configure_nack(registry, &mut media);
        registry = configure_rtcp_reports(registry);
        registry = configure_twcc_sender_only(registry, &mut media)?;
        // Simulcast needs mid and rid on video.
        for uri in [
            SDES_MID_URI,
            SDES_RTP_STREAM_ID_URI,
            SDES_REPAIR_RTP_STREAM_ID_URI,
        ] {
            media.register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: uri.to_owned(),
                },
                RTPCodecType::Video,
                None,
            )?;
        }
        media.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: AUDIO_LEVEL_URI.to_owned(),
            },
            RTPCodecType::Audio,
            None,
        )?;

        let mut setting = SettingEngine::default();
        if let Some((start, end)) = settings.port_range {
            let ephemeral = EphemeralUDP::new(start, end).map_err(|err| EngineError::PortRange {
                start,
                end,
                reason: err.to_string(),
            })?;
            setting.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }
        if !settings.public_ips.is_empty() {
            setting.set_nat_1to1_ips(settings.public_ips.clone(), RTCIceCandidateType::Host);
        }

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting)
            .build();

        let ice_servers = if settings.stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: settings.stun_urls.clone(),
                ..Default::default()
            }]
        };

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
        })
    }

    async fn new_peer(
        &self,
        role: PeerRole,
        ctx: &SessionContext,
    ) -> Result<Arc<RTCPeerConnection>, EngineError> {
        let cfg = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(cfg).await?);
        forward_connection_events(&pc, role, ctx);
        Ok(pc)
    }
}

#[async_trait]
impl SessionFactory for RtcSessionFactory {
    async fn download_session(
        &self,
        ctx: &SessionContext,
    ) -> Result<Arc<dyn PeerSession>, EngineError> {
        let role = PeerRole::Receiver;
        let pc = self.new_peer(role, ctx).await?;
        if let Err(err) = attach_receive_transceivers(&pc).await {
            abandon(&pc, &ctx.client_id, role).await;
            return Err(err);
        }
        drain_inbound_tracks(&pc, role, ctx);
        Ok(Arc::new(RtcPeerSession { role, pc }))
    }

    async fn upload_session(
        &self,
        ctx: &SessionContext,
    ) -> Result<Arc<dyn PeerSession>, EngineError> {
        let role = PeerRole::Sender;
        let pc = self.new_peer(role, ctx).await?;
        if let Err(err) = attach_placeholder_tracks(&pc, &ctx.cancel).await {
            abandon(&pc, &ctx.client_id, role).await;
            return Err(err);
        }
        Ok(Arc::new(RtcPeerSession { role, pc }))
    }
}

async fn abandon(pc: &RTCPeerConnection, client_id: &ClientId, role: PeerRole) {
    if let Err(err) = pc.close().await {
        debug!(client_id = %client_id, role = %role, error = %err, "close after failed setup");
    }
}

async fn attach_receive_transceivers(pc: &RTCPeerConnection) -> Result<(), EngineError> {
    for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
        let init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        };
        pc.add_transceiver_from_kind(kind, Some(init)).await?;
    }
    Ok(())
}

/// Send-only audio and video slots backed by tracks nothing writes to yet.
async fn attach_placeholder_tracks(
    pc: &RTCPeerConnection,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    for mime_type in [MIME_TYPE_OPUS, MIME_TYPE_VP8] {
        let track: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            Uuid::new_v4().to_string(),
            Uuid::new_v4().to_string(),
        ));
        let init = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Sendonly,
            send_encodings: vec![],
        };
        let transceiver = pc.add_transceiver_from_track(track, Some(init)).await?;
        // NACK responder and RTCP reports only run while someone reads.
        tokio::spawn(drain_sender_rtcp(transceiver.sender().await, cancel.clone()));
    }
    Ok(())
}

fn forward_connection_events(pc: &RTCPeerConnection, role: PeerRole, ctx: &SessionContext) {
    let events = ctx.events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = events.send(SessionEvent::LocalCandidate {
                        role,
                        candidate: candidate_from_rtc(init),
                    });
                }
                Err(err) => warn!(role = %role, error = %err, "failed to encode local candidate"),
            }
        })
    }));

    let events = ctx.events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = events.clone();
        Box::pin(async move {
            if let Some(state) = connection_state(state) {
                let _ = events.send(SessionEvent::ConnectionStateChanged { role, state });
            }
        })
    }));

    let events = ctx.events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let events = events.clone();
        Box::pin(async move {
            if let Some(state) = ice_state(state) {
                let _ = events.send(SessionEvent::IceStateChanged { role, state });
            }
        })
    }));
}

fn drain_inbound_tracks(pc: &RTCPeerConnection, role: PeerRole, ctx: &SessionContext) {
    let events = ctx.events.clone();
    let cancel = ctx.cancel.clone();
    let client_id = ctx.client_id.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let events = events.clone();
            let cancel = cancel.clone();
            let client_id = client_id.clone();
            Box::pin(async move {
                let kind = media_kind(track.kind());
                let _ = events.send(SessionEvent::TrackReceived {
                    role,
                    kind,
                    ssrc: track.ssrc(),
                });
                // The engine holds its handler lock while this future runs, so
                // the read loops must live on their own tasks.
                tokio::spawn(drain_receiver_rtcp(receiver, client_id, cancel.clone()));
                tokio::spawn(drain_track(track, kind, role, events, cancel));
            })
        },
    ));
}

async fn drain_track(
    track: Arc<TrackRemote>,
    kind: MediaKind,
    role: PeerRole,
    events: tokio::sync::mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    let counter = metrics::INBOUND_PACKETS.with_label_values(&[kind.as_str()]);
    let mut buf = vec![0u8; MEDIA_READ_BUFFER];
    let mut packets = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = track.read(&mut buf) => match read {
                Ok(_) => {
                    packets += 1;
                    counter.inc();
                }
                Err(err) => {
                    debug!(kind = kind.as_str(), error = %err, "inbound track read ended");
                    break;
                }
            },
        }
    }
    let _ = events.send(SessionEvent::TrackEnded {
        role,
        kind,
        packets,
    });
}

async fn drain_receiver_rtcp(
    receiver: Arc<RTCRtpReceiver>,
    client_id: ClientId,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RTCP_READ_BUFFER];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = receiver.read(&mut buf) => {
                if let Err(err) = read {
                    debug!(client_id = %client_id, error = %err, "receiver RTCP read ended");
                    break;
                }
            }
        }
    }
}

async fn drain_sender_rtcp(sender: Arc<RTCRtpSender>, cancel: CancellationToken) {
    let mut buf = vec![0u8; RTCP_READ_BUFFER];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = sender.read(&mut buf) => {
                if read.is_err() {
                    break;
                }
            }
        }
    }
}

pub struct RtcPeerSession {
    role: PeerRole,
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerSession for RtcPeerSession {
    fn role(&self) -> PeerRole {
        self.role
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        description_from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        description_from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_local_description(description_to_rtc(desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(description_to_rtc(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(candidate_to_rtc(candidate))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pc.close().await?;
        Ok(())
    }
}

fn description_to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpKind::Rollback => return Err(EngineError::UnsupportedSdp("rollback")),
    };
    Ok(rtc)
}

fn description_from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => return Err(EngineError::UnsupportedSdp("unspecified")),
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn candidate_to_rtc(candidate: IceCandidateInit) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn candidate_from_rtc(init: RTCIceCandidateInit) -> IceCandidateInit {
    IceCandidateInit {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn media_kind(kind: RTPCodecType) -> MediaKind {
    match kind {
        RTPCodecType::Audio => MediaKind::Audio,
        RTPCodecType::Video => MediaKind::Video,
        _ => MediaKind::Unknown,
    }
}

fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    match state {
        RTCIceConnectionState::New => Some(IceState::New),
        RTCIceConnectionState::Checking => Some(IceState::Checking),
        RTCIceConnectionState::Connected => Some(IceState::Connected),
        RTCIceConnectionState::Completed => Some(IceState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceState::Failed),
        RTCIceConnectionState::Closed => Some(IceState::Closed),
        _ => None,
    }
}
