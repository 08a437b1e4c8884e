//! Microphone capture and per-peer playback sinks. Thin by design: mute is a
//! gate on the capture callback (no renegotiation), and RTP payloads are fed
//! to the output device as-is. Codec work belongs to the peer-connection
//! stack, not here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample as _, SampleFormat, SizedSample};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::config::AudioOptions;
use crate::error::{Error, Result};
use crate::signaling::ParticipantId;

const SAMPLE_DURATION: Duration = Duration::from_millis(20);

/// Local capture device plus remote playback sinks. Implementations must be
/// injectable; the session layer never touches devices directly.
#[async_trait]
pub trait MediaGateway: Send + Sync {
    /// Requests the capture device. Each failure cause is distinct because
    /// the remediation differs: granting permission, plugging in a device,
    /// closing the other app, or changing browsers/hosts.
    async fn acquire(&self) -> Result<()>;

    /// Stops all tracks and releases the device.
    async fn release(&self);

    /// Gates outgoing audio without renegotiating any connection.
    async fn set_muted(&self, muted: bool);

    fn muted(&self) -> bool;

    fn local_track(&self) -> Option<Arc<TrackLocalStaticSample>>;

    /// Creates or reuses the playback sink for `peer`.
    async fn attach_remote(&self, peer: &ParticipantId, track: Arc<TrackRemote>);

    async fn detach_remote(&self, peer: &ParticipantId);

    /// One-shot retry for sinks whose playback start was refused by the
    /// output policy; call on the next user interaction.
    async fn user_interaction(&self);
}

enum SinkCmd {
    Retry,
    Stop,
}

struct SinkHandle {
    cmd: std_mpsc::Sender<SinkCmd>,
    deferred: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
}

struct CaptureHandle {
    stop: std_mpsc::Sender<()>,
}

struct GatewayInner {
    capture: Option<CaptureHandle>,
    sinks: HashMap<ParticipantId, SinkHandle>,
}

pub struct CpalMediaGateway {
    options: AudioOptions,
    muted: Arc<AtomicBool>,
    track: StdMutex<Option<Arc<TrackLocalStaticSample>>>,
    inner: Mutex<GatewayInner>,
}

impl CpalMediaGateway {
    pub fn new(options: AudioOptions) -> Self {
        Self {
            options,
            muted: Arc::new(AtomicBool::new(false)),
            track: StdMutex::new(None),
            inner: Mutex::new(GatewayInner {
                capture: None,
                sinks: HashMap::new(),
            }),
        }
    }
}

#[async_trait]
impl MediaGateway for CpalMediaGateway {
    async fn acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.capture.is_some() {
            return Ok(());
        }

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "voice-mesh".to_owned(),
        ));

        let capture = spawn_capture(track.clone(), self.muted.clone(), self.options.clone()).await?;
        *self.track.lock().unwrap() = Some(track);
        inner.capture = Some(capture);
        debug!("capture device acquired");
        Ok(())
    }

    async fn release(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(capture) = inner.capture.take() {
            let _ = capture.stop.send(());
        }
        for (_, sink) in inner.sinks.drain() {
            let _ = sink.cmd.send(SinkCmd::Stop);
            sink.reader.abort();
        }
        *self.track.lock().unwrap() = None;
        debug!("capture device released");
    }

    async fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn local_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.track.lock().unwrap().clone()
    }

    async fn attach_remote(&self, peer: &ParticipantId, track: Arc<TrackRemote>) {
        let mut inner = self.inner.lock().await;
        if inner.sinks.contains_key(peer) {
            return;
        }

        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let (pcm_tx, pcm_rx) = std_mpsc::channel::<Vec<u8>>();
        let deferred = Arc::new(AtomicBool::new(false));

        // Pull RTP payloads off the remote track and hand the bytes to the
        // playback thread.
        let reader = tokio::spawn(async move {
            while let Ok((packet, _)) = track.read_rtp().await {
                if pcm_tx.send(packet.payload.to_vec()).is_err() {
                    break;
                }
            }
        });

        let peer_label = peer.to_string();
        let thread_deferred = deferred.clone();
        std::thread::spawn(move || playback_thread(peer_label, cmd_rx, pcm_rx, thread_deferred));

        inner.sinks.insert(
            peer.clone(),
            SinkHandle {
                cmd: cmd_tx,
                deferred,
                reader,
            },
        );
    }

    async fn detach_remote(&self, peer: &ParticipantId) {
        let mut inner = self.inner.lock().await;
        if let Some(sink) = inner.sinks.remove(peer) {
            let _ = sink.cmd.send(SinkCmd::Stop);
            sink.reader.abort();
        }
    }

    async fn user_interaction(&self) {
        let inner = self.inner.lock().await;
        for sink in inner.sinks.values() {
            if sink.deferred.swap(false, Ordering::SeqCst) {
                let _ = sink.cmd.send(SinkCmd::Retry);
            }
        }
    }
}

/// cpal streams are not `Send`; each one lives on its own thread and is
/// controlled over a channel.
async fn spawn_capture(
    track: Arc<TrackLocalStaticSample>,
    muted: Arc<AtomicBool>,
    options: AudioOptions,
) -> Result<CaptureHandle> {
    let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(data) = frame_rx.recv().await {
            let sample = Sample {
                data: data.into(),
                duration: SAMPLE_DURATION,
                ..Default::default()
            };
            if track.write_sample(&sample).await.is_err() {
                break;
            }
        }
    });

    std::thread::spawn(move || match build_capture_stream(frame_tx, muted, &options) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            let _ = stop_rx.recv();
            drop(stream);
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
        }
    });

    tokio::task::spawn_blocking(move || ready_rx.recv())
        .await
        .map_err(|_| Error::Unsupported)?
        .map_err(|_| Error::Unsupported)??;
    Ok(CaptureHandle { stop: stop_tx })
}

fn build_capture_stream(
    frames: mpsc::UnboundedSender<Vec<u8>>,
    muted: Arc<AtomicBool>,
    options: &AudioOptions,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(Error::DeviceNotFound)?;
    let config = device
        .default_input_config()
        .map_err(|_| Error::Unsupported)?;
    debug!(
        echo_cancellation = options.echo_cancellation,
        noise_suppression = options.noise_suppression,
        auto_gain_control = options.auto_gain_control,
        "opening capture stream"
    );

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_input::<f32>(&device, &config.into(), frames, muted)?,
        SampleFormat::I16 => build_input::<i16>(&device, &config.into(), frames, muted)?,
        SampleFormat::U16 => build_input::<u16>(&device, &config.into(), frames, muted)?,
        _ => return Err(Error::Unsupported),
    };
    stream.play().map_err(classify_play)?;
    Ok(stream)
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    muted: Arc<AtomicBool>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let err_fn = |e| warn!(error = %e, "input stream error");
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if muted.load(Ordering::SeqCst) {
                    return;
                }
                let mut bytes = Vec::with_capacity(data.len() * 2);
                for &s in data {
                    bytes.extend_from_slice(&i16::from_sample(s).to_le_bytes());
                }
                let _ = frames.send(bytes);
            },
            err_fn,
            None,
        )
        .map_err(classify_build)
}

fn playback_thread(
    peer: String,
    cmd: std_mpsc::Receiver<SinkCmd>,
    pcm: std_mpsc::Receiver<Vec<u8>>,
    deferred: Arc<AtomicBool>,
) {
    let stream = match build_playback_stream(pcm) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%peer, %e, "no playback sink for peer");
            return;
        }
    };

    if let Err(e) = stream.play() {
        // Start refused (output policy); park until the next user
        // interaction and retry once.
        warn!(%peer, error = %e, "playback start deferred");
        deferred.store(true, Ordering::SeqCst);
        match cmd.recv() {
            Ok(SinkCmd::Retry) => {
                if let Err(e) = stream.play() {
                    warn!(%peer, error = %e, "playback retry failed");
                    return;
                }
            }
            Ok(SinkCmd::Stop) | Err(_) => return,
        }
    }

    loop {
        match cmd.recv() {
            Ok(SinkCmd::Retry) => {}
            Ok(SinkCmd::Stop) | Err(_) => break,
        }
    }
}

fn build_playback_stream(pcm: std_mpsc::Receiver<Vec<u8>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(Error::DeviceNotFound)?;
    let config = device
        .default_output_config()
        .map_err(|_| Error::Unsupported)?;
    if config.sample_format() != SampleFormat::I16 && config.sample_format() != SampleFormat::F32 {
        return Err(Error::Unsupported);
    }

    let err_fn = |e| warn!(error = %e, "output stream error");
    let stream = match config.sample_format() {
        SampleFormat::I16 => {
            let mut leftover: Vec<i16> = Vec::new();
            device.build_output_stream(
                &config.into(),
                move |out: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    fill_output(out, &pcm, &mut leftover);
                },
                err_fn,
                None,
            )
        }
        _ => {
            let mut leftover: Vec<i16> = Vec::new();
            device.build_output_stream(
                &config.into(),
                move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut staging = vec![0i16; out.len()];
                    fill_output(&mut staging, &pcm, &mut leftover);
                    for (o, s) in out.iter_mut().zip(staging) {
                        *o = s as f32 / i16::MAX as f32;
                    }
                },
                err_fn,
                None,
            )
        }
    };
    stream.map_err(classify_build)
}

fn fill_output(out: &mut [i16], pcm: &std_mpsc::Receiver<Vec<u8>>, leftover: &mut Vec<i16>) {
    while leftover.len() < out.len() {
        match pcm.try_recv() {
            Ok(bytes) => {
                leftover.extend(
                    bytes
                        .chunks_exact(2)
                        .map(|c| i16::from_le_bytes([c[0], c[1]])),
                );
            }
            Err(_) => break,
        }
    }
    let available = leftover.len().min(out.len());
    for (o, s) in out[..available].iter_mut().zip(leftover.drain(..available)) {
        *o = s;
    }
    // Silence when the buffer runs dry.
    for o in &mut out[available..] {
        *o = 0;
    }
}

fn classify_build(e: cpal::BuildStreamError) -> Error {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => Error::DeviceBusy,
        cpal::BuildStreamError::StreamConfigNotSupported => Error::Unsupported,
        // Permission problems surface as backend-specific errors.
        cpal::BuildStreamError::BackendSpecific { .. } => Error::PermissionDenied,
        _ => Error::Unsupported,
    }
}

fn classify_play(e: cpal::PlayStreamError) -> Error {
    match e {
        cpal::PlayStreamError::DeviceNotAvailable => Error::DeviceBusy,
        cpal::PlayStreamError::BackendSpecific { .. } => Error::PermissionDenied,
    }
}
