//! [`Connection`] over a real `webrtc` peer connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::IceConfig;
use crate::connection::{Connection, ConnectionError, ConnectionEvent, MediaKind, RemoteTrack};
use crate::schema::{IceCandidateBlob, SdpType, SessionDescription};

const OPUS_FRAME: Duration = Duration::from_millis(20);
/// A single Opus frame that decodes to 20ms of silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const MEDIA_STREAM_ID: &str = "beach-huddle";

/// Supplies the local tracks offered to the peer.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn attach(&self, peer: &Arc<RTCPeerConnection>) -> Result<(), ConnectionError>;
}

pub struct RtcConnection {
    peer: Arc<RTCPeerConnection>,
    remote: AsyncMutex<RemoteState>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    _capture: Arc<dyn MediaCapture>,
}

/// Remote candidates received before the remote description are parked here
/// and applied right after it is set.
#[derive(Default)]
struct RemoteState {
    description_set: bool,
    pending: Vec<RTCIceCandidateInit>,
}

impl RtcConnection {
    pub async fn new(
        ice: &IceConfig,
        capture: Arc<dyn MediaCapture>,
    ) -> Result<Self, ConnectionError> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice.stun_urls.clone(),
                ..Default::default()
            }],
            ice_candidate_pool_size: ice.candidate_pool_size,
            ..Default::default()
        };
        let peer = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|err| ConnectionError::failed("new_peer_connection", err))?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let candidate_tx = events_tx.clone();
        peer.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let event = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => ConnectionEvent::LocalCandidate(blob_from_init(init)),
                        Err(err) => {
                            tracing::warn!(
                                target = "huddle::rtc",
                                error = %err,
                                "failed to serialize local candidate"
                            );
                            return;
                        }
                    },
                    None => ConnectionEvent::GatheringComplete,
                };
                let _ = tx.send(event);
            })
        }));

        let track_tx = events_tx;
        peer.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = track_tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    other => {
                        tracing::debug!(
                            target = "huddle::rtc",
                            kind = %other,
                            "ignoring remote track"
                        );
                        return;
                    }
                };
                let _ = tx.send(ConnectionEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                }));
                // Drain RTP so the receiver keeps flowing; playback is out of scope.
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    while track.read(&mut buf).await.is_ok() {}
                });
            })
        }));

        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            Box::pin(async move {
                tracing::debug!(
                    target = "huddle::rtc",
                    state = %state,
                    "peer connection state changed"
                );
            })
        }));

        capture.attach(&peer).await?;

        Ok(Self {
            peer,
            remote: AsyncMutex::new(RemoteState::default()),
            events: Mutex::new(Some(events_rx)),
            _capture: capture,
        })
    }

    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.peer
            .close()
            .await
            .map_err(|err| ConnectionError::failed("close", err))
    }
}

impl Drop for RtcConnection {
    fn drop(&mut self) {
        let peer = self.peer.clone();
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                let _ = peer.close().await;
            });
        }
    }
}

#[async_trait]
impl Connection for RtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError> {
        let offer = self
            .peer
            .create_offer(None)
            .await
            .map_err(|err| ConnectionError::failed("create_offer", err))?;
        description_from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError> {
        let answer = self
            .peer
            .create_answer(None)
            .await
            .map_err(|err| ConnectionError::failed("create_answer", err))?;
        description_from_rtc(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let description = description_to_rtc(description)?;
        self.peer
            .set_local_description(description)
            .await
            .map_err(|err| ConnectionError::failed("set_local_description", err))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let mut remote = self.remote.lock().await;
        if remote.description_set || self.peer.remote_description().await.is_some() {
            return Err(ConnectionError::RemoteDescriptionAlreadySet);
        }
        let description = description_to_rtc(description)?;
        self.peer
            .set_remote_description(description)
            .await
            .map_err(|err| ConnectionError::failed("set_remote_description", err))?;
        remote.description_set = true;

        let pending = std::mem::take(&mut remote.pending);
        if !pending.is_empty() {
            tracing::debug!(
                target = "huddle::rtc",
                count = pending.len(),
                "applying buffered remote candidates"
            );
        }
        for init in pending {
            if let Err(err) = self.peer.add_ice_candidate(init).await {
                tracing::warn!(
                    target = "huddle::rtc",
                    error = %err,
                    "failed to apply buffered remote candidate"
                );
            }
        }
        Ok(())
    }

    async fn current_remote_description(&self) -> Option<SessionDescription> {
        let description = self.peer.remote_description().await?;
        description_from_rtc(description).ok()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateBlob) -> Result<(), ConnectionError> {
        let init = init_from_blob(candidate);
        let mut remote = self.remote.lock().await;
        if !remote.description_set {
            remote.pending.push(init);
            return Ok(());
        }
        drop(remote);
        self.peer
            .add_ice_candidate(init)
            .await
            .map_err(|err| ConnectionError::failed("add_ice_candidate", err))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.lock().take()
    }
}

fn build_api() -> Result<API, ConnectionError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|err| ConnectionError::failed("register_default_codecs", err))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|err| ConnectionError::failed("register_default_interceptors", err))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn description_from_rtc(
    description: RTCSessionDescription,
) -> Result<SessionDescription, ConnectionError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(ConnectionError::failed(
            "session_description",
            format!("unsupported sdp type {other}"),
        )),
    }
}

fn description_to_rtc(
    description: SessionDescription,
) -> Result<RTCSessionDescription, ConnectionError> {
    let result = match description.kind {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|err| ConnectionError::failed("session_description", err))
}

fn blob_from_init(init: RTCIceCandidateInit) -> IceCandidateBlob {
    IceCandidateBlob {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn init_from_blob(blob: IceCandidateBlob) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: blob.candidate,
        sdp_mid: blob.sdp_mid,
        sdp_mline_index: blob.sdp_mline_index,
        username_fragment: blob.username_fragment,
    }
}

/// Offers an Opus audio track carrying silence and a VP8 video track, for
/// hosts without capture devices.
#[derive(Default)]
pub struct SilentCapture {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SilentCapture {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaCapture for SilentCapture {
    async fn attach(&self, peer: &Arc<RTCPeerConnection>) -> Result<(), ConnectionError> {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            MEDIA_STREAM_ID.to_owned(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            MEDIA_STREAM_ID.to_owned(),
        ));

        let mut tasks = Vec::new();
        for track in [
            Arc::clone(&audio) as Arc<dyn TrackLocal + Send + Sync>,
            Arc::clone(&video) as Arc<dyn TrackLocal + Send + Sync>,
        ] {
            let sender = peer
                .add_track(track)
                .await
                .map_err(|err| ConnectionError::failed("add_track", err))?;
            // RTCP has to be read for interceptors to run.
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            }));
        }

        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(OPUS_FRAME);
            loop {
                ticker.tick().await;
                let sample = Sample {
                    data: Bytes::from_static(&OPUS_SILENCE),
                    duration: OPUS_FRAME,
                    ..Default::default()
                };
                if let Err(err) = audio.write_sample(&sample).await {
                    tracing::debug!(target = "huddle::rtc", error = %err, "silence writer stopped");
                    return;
                }
            }
        }));

        self.tasks.lock().extend(tasks);
        Ok(())
    }
}

impl Drop for SilentCapture {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_keep_all_browser_fields() {
        let blob = IceCandidateBlob {
            candidate: "candidate:1 1 udp 2122260223 192.0.2.1 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some("frag".into()),
        };
        assert_eq!(blob_from_init(init_from_blob(blob.clone())), blob);
    }

    fn local_ice() -> IceConfig {
        IceConfig {
            stun_urls: Vec::new(),
            candidate_pool_size: 0,
        }
    }

    #[test_timeout::timeout(20)]
    async fn generated_offer_keeps_its_type() {
        let conn = RtcConnection::new(&local_ice(), Arc::new(SilentCapture::new()))
            .await
            .expect("connection");
        let offer = conn.create_offer().await.expect("offer");
        assert_eq!(offer.kind, SdpType::Offer);

        let rtc = description_to_rtc(offer.clone()).expect("convert");
        assert_eq!(rtc.sdp_type, RTCSdpType::Offer);
        let back = description_from_rtc(rtc).expect("convert back");
        assert_eq!(back, offer);
        conn.close().await.expect("close");
    }

    #[test]
    fn unparsable_sdp_is_a_connection_error() {
        let err = description_to_rtc(SessionDescription::answer("not sdp")).expect_err("garbage");
        assert!(matches!(err, ConnectionError::Failed { operation: "session_description", .. }));
    }

    #[test_timeout::timeout(20)]
    async fn early_candidates_wait_for_remote_description() {
        let ice = local_ice();
        let offerer = RtcConnection::new(&ice, Arc::new(SilentCapture::new()))
            .await
            .expect("offerer");
        let answerer = RtcConnection::new(&ice, Arc::new(SilentCapture::new()))
            .await
            .expect("answerer");

        answerer
            .add_ice_candidate(IceCandidateBlob {
                candidate: "candidate:1 1 udp 2122260223 192.0.2.1 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            })
            .await
            .expect("buffered");
        assert_eq!(answerer.remote.lock().await.pending.len(), 1);

        let offer = offerer.create_offer().await.expect("offer");
        offerer
            .set_local_description(offer.clone())
            .await
            .expect("local offer");
        answerer
            .set_remote_description(offer.clone())
            .await
            .expect("remote offer");
        assert!(answerer.remote.lock().await.pending.is_empty());
        assert!(answerer.current_remote_description().await.is_some());

        let err = answerer
            .set_remote_description(offer)
            .await
            .expect_err("second remote description");
        assert!(matches!(err, ConnectionError::RemoteDescriptionAlreadySet));

        offerer.close().await.expect("close offerer");
        answerer.close().await.expect("close answerer");
    }
}
