//! `webrtc` peer connections behind the `MediaTransport` boundary.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::{pump_opus, OpusDepacketizer, PcmBuffer, PcmTaps, OPUS_FRAME_DURATION, OPUS_SAMPLE_RATE};
use crate::error::Result;
use crate::media::{BasicTrack, ConnectionKey, MediaKind, MediaStream, MediaTrack, TrackKind};
use crate::peers::transport::{
    IceConnectionState, MediaTransport, MediaTransportFactory, TransportEventKind, TransportEventSink,
};
use crate::signaling::{IceCandidate, IceServer};

pub struct RtcTransportFactory {
    api: API,
    taps: PcmTaps,
}

impl RtcTransportFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            taps: PcmTaps::new(),
        })
    }

    /// Shares the capture registry: local microphones are read from it and
    /// decoded remote audio is published to it.
    pub fn with_taps(mut self, taps: PcmTaps) -> Self {
        self.taps = taps;
        self
    }
}

/// Feeds the microphone behind `stream` into `track` from a dedicated thread.
fn spawn_encoder(
    key: &ConnectionKey,
    stream: &MediaStream,
    taps: &PcmTaps,
    track: Arc<TrackLocalStaticSample>,
    closed: Arc<AtomicBool>,
) -> Result<()> {
    let Some(pcm) = taps.for_stream(stream) else {
        warn!("{}: no capture behind stream {}, sending silence", key, stream.id());
        return Ok(());
    };
    let chunks = pcm.subscribe();
    let sample_rate = pcm.sample_rate();
    drop(pcm);

    let key = key.clone();
    std::thread::Builder::new()
        .name("meetroom-opus".to_string())
        .spawn(move || {
            let result = pump_opus(chunks, sample_rate, closed, |packet| {
                let sample = Sample {
                    data: packet.into(),
                    duration: OPUS_FRAME_DURATION,
                    ..Default::default()
                };
                if let Err(e) = futures::executor::block_on(track.write_sample(&sample)) {
                    warn!("{}: failed to write audio sample: {}", key, e);
                }
            });
            match result {
                Ok(()) => debug!("{}: encoder stopped", key),
                Err(e) => error!("{}: encoder failed: {}", key, e),
            }
        })?;
    Ok(())
}

/// Decodes remote Opus into `pcm` until the track ends.
async fn decode_remote(key: ConnectionKey, track: Arc<TrackRemote>, pcm: Arc<PcmBuffer>) {
    let mut depacketizer = match OpusDepacketizer::new() {
        Ok(d) => d,
        Err(e) => {
            error!("{}: {}", key, e);
            return;
        }
    };
    while let Ok((packet, _)) = track.read_rtp().await {
        if packet.payload.is_empty() {
            continue;
        }
        match depacketizer.decode(&packet.payload) {
            Ok(samples) => pcm.push(&samples),
            Err(e) => debug!("{}: dropping undecodable packet: {}", key, e),
        }
    }
    debug!("{}: remote audio ended", key);
}

fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

#[async_trait]
impl MediaTransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        local_media: Option<&MediaStream>,
        events: TransportEventSink,
    ) -> Result<Box<dyn MediaTransport>> {
        let key = events.key().clone();
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice_servers),
            ..Default::default()
        };
        let peer_connection = Arc::new(self.api.new_peer_connection(config).await?);
        let closed = Arc::new(AtomicBool::new(false));

        match (key.kind, local_media) {
            (MediaKind::Audio, Some(stream)) => {
                let track = Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48000,
                        channels: 2,
                        ..Default::default()
                    },
                    "audio".to_owned(),
                    stream.id().to_owned(),
                ));
                spawn_encoder(&key, stream, &self.taps, track.clone(), closed.clone())?;
                peer_connection
                    .add_transceiver_from_track(
                        track as Arc<dyn TrackLocal + Send + Sync>,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Sendrecv,
                            send_encodings: vec![],
                        }),
                    )
                    .await?;
            }
            (MediaKind::Audio, None) => {
                peer_connection
                    .add_transceiver_from_kind(
                        RTPCodecType::Audio,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await?;
            }
            (MediaKind::Screen, local) => {
                let direction = if local.is_some() {
                    RTCRtpTransceiverDirection::Sendonly
                } else {
                    RTCRtpTransceiverDirection::Recvonly
                };
                peer_connection
                    .add_transceiver_from_kind(
                        RTPCodecType::Video,
                        Some(RTCRtpTransceiverInit {
                            direction,
                            send_encodings: vec![],
                        }),
                    )
                    .await?;
            }
        }

        let sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(TransportEventKind::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!("Failed to serialize local candidate for {}: {}", sink.key(), e),
                }
            })
        }));

        let sink = events.clone();
        peer_connection.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            debug!("ICE connection state for {} has changed: {}", sink.key(), state);
            if let Some(state) = ice_state(state) {
                sink.emit(TransportEventKind::IceState(state));
            }
            Box::pin(async {})
        }));

        let sink = events;
        let taps = self.taps.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                // Remote track ids repeat across peers; the tap needs a unique one.
                let track_id = format!("{}#{}:{}", sink.key(), sink.generation(), track.id());
                let remote: Arc<dyn MediaTrack> = Arc::new(BasicTrack::new(track_id.clone(), kind));
                let stream_id = match track.stream_id() {
                    id if id.is_empty() => sink.key().to_string(),
                    id => id,
                };
                info!("Remote {:?} track {} from {}", kind, track.id(), sink.key());

                let decoder = (kind == TrackKind::Audio).then(|| {
                    let pcm = Arc::new(PcmBuffer::new(OPUS_SAMPLE_RATE));
                    taps.register(&track_id, &pcm);
                    decode_remote(sink.key().clone(), track, pcm)
                });
                sink.emit(TransportEventKind::RemoteStream(MediaStream::new(stream_id, vec![remote])));
                Box::pin(async move {
                    if let Some(decoder) = decoder {
                        tokio::spawn(decoder);
                    }
                })
            },
        ));

        Ok(Box::new(RtcTransport {
            peer_connection,
            closed,
        }))
    }
}

pub struct RtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn create_offer(&self) -> Result<String> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    async fn apply_remote_offer(&self, sdp: &str) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp.to_owned())?;
        self.peer_connection.set_remote_description(offer).await?;
        Ok(())
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection.set_local_description(answer.clone()).await?;
        Ok(answer.sdp)
    }

    async fn apply_remote_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_owned())?;
        self.peer_connection.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.peer_connection.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.peer_connection.close().await?;
        Ok(())
    }
}
