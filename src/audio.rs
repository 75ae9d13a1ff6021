use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::collections::{HashMap, VecDeque};
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::levels::{AudioSource, FrequencyAnalyser};
use crate::media::{BasicTrack, MediaStream, MediaTrack, TrackKind};
use crate::room::{AudioDevice, GainControl, MediaDevices};

/// Samples kept per microphone for level analysis.
const PCM_CAPACITY: usize = 4096;
/// Analysis window, in samples.
const WINDOW: usize = 256;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;
/// Chunks a slow subscriber may fall behind by before it skips ahead.
const CHUNK_BACKLOG: usize = 64;

/// Opus runs at 48 kHz; one packet carries 20 ms.
pub const OPUS_SAMPLE_RATE: u32 = 48_000;
pub const OPUS_FRAME: usize = 960;
pub const OPUS_FRAME_DURATION: Duration = Duration::from_millis(20);
const MAX_PACKET: usize = 4000;

/// Most recent mono samples of one capture or remote track. Every pushed
/// chunk is also published to subscribers, which is how the encoder sees
/// microphone audio.
#[derive(Debug)]
pub struct PcmBuffer {
    samples: Mutex<VecDeque<f32>>,
    sample_rate: u32,
    chunks: broadcast::Sender<Arc<[f32]>>,
}

impl PcmBuffer {
    pub fn new(sample_rate: u32) -> Self {
        let (chunks, _) = broadcast::channel(CHUNK_BACKLOG);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(PCM_CAPACITY)),
            sample_rate,
            chunks,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<[f32]>> {
        self.chunks.subscribe()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn push(&self, data: &[f32]) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.extend(data.iter().copied());
            let excess = samples.len().saturating_sub(PCM_CAPACITY);
            samples.drain(..excess);
        }
        if self.chunks.receiver_count() > 0 {
            let _ = self.chunks.send(Arc::from(data));
        }
    }

    pub fn latest(&self, count: usize) -> Vec<f32> {
        match self.samples.lock() {
            Ok(samples) => {
                let skip = samples.len().saturating_sub(count);
                samples.iter().skip(skip).copied().collect()
            }
            Err(_) => Vec::new(),
        }
    }
}

/// Sample buffers by track id. Shared by capture, the transports and level
/// analysis; entries vanish once their buffer is dropped.
#[derive(Clone, Debug, Default)]
pub struct PcmTaps {
    inner: Arc<Mutex<HashMap<String, Weak<PcmBuffer>>>>,
}

impl PcmTaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, track_id: &str, pcm: &Arc<PcmBuffer>) {
        if let Ok(mut taps) = self.inner.lock() {
            taps.retain(|_, weak| weak.strong_count() > 0);
            taps.insert(track_id.to_string(), Arc::downgrade(pcm));
        }
    }

    pub fn get(&self, track_id: &str) -> Option<Arc<PcmBuffer>> {
        let taps = self.inner.lock().ok()?;
        taps.get(track_id).and_then(Weak::upgrade)
    }

    /// Buffer behind the first audio track of `stream` that has one.
    pub fn for_stream(&self, stream: &MediaStream) -> Option<Arc<PcmBuffer>> {
        stream.audio_tracks().find_map(|t| self.get(t.id()))
    }
}

/// Microphone track backed by a cpal input stream. The stream lives on its
/// own thread (cpal streams are not `Send`) until the track is stopped.
#[derive(Debug)]
pub struct MicrophoneTrack {
    inner: Arc<BasicTrack>,
    stop_tx: Mutex<Option<std_mpsc::Sender<()>>>,
    pcm: Arc<PcmBuffer>,
}

impl MicrophoneTrack {
    pub fn pcm(&self) -> &Arc<PcmBuffer> {
        &self.pcm
    }
}

impl MediaTrack for MicrophoneTrack {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.inner.set_enabled(enabled);
    }

    fn stop(&self) {
        self.inner.stop();
        if let Ok(mut stop_tx) = self.stop_tx.lock() {
            if let Some(tx) = stop_tx.take() {
                let _ = tx.send(());
                debug!("Microphone track {} stopped", self.inner.id());
            }
        }
    }

    fn is_live(&self) -> bool {
        self.inner.is_live()
    }
}

impl Drop for MicrophoneTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct CpalDevices {
    taps: PcmTaps,
}

impl CpalDevices {
    pub fn new() -> Self {
        Self::with_taps(PcmTaps::new())
    }

    pub fn with_taps(taps: PcmTaps) -> Self {
        Self { taps }
    }

    /// Registry the microphones opened here are published to.
    pub fn taps(&self) -> PcmTaps {
        self.taps.clone()
    }

    /// Level analysis over every tapped track, local or remote.
    pub fn audio_source(&self) -> PcmAudioSource {
        PcmAudioSource::new(self.taps.clone())
    }
}

impl Default for CpalDevices {
    fn default() -> Self {
        Self::new()
    }
}

fn list_devices<I>(devices: I, default_name: Option<String>) -> Vec<AudioDevice>
where
    I: Iterator<Item = cpal::Device>,
{
    devices
        .filter_map(|device| device.name().ok())
        .map(|name| AudioDevice {
            is_default: default_name.as_deref() == Some(name.as_str()),
            id: name.clone(),
            name,
        })
        .collect()
}

impl MediaDevices for CpalDevices {
    fn input_devices(&self) -> Result<Vec<AudioDevice>> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        let devices = host
            .input_devices()
            .map_err(|e| Error::Device(format!("Failed to enumerate input devices: {}", e)))?;
        Ok(list_devices(devices, default_name))
    }

    fn output_devices(&self) -> Result<Vec<AudioDevice>> {
        let host = cpal::default_host();
        let default_name = host.default_output_device().and_then(|d| d.name().ok());
        let devices = host
            .output_devices()
            .map_err(|e| Error::Device(format!("Failed to enumerate output devices: {}", e)))?;
        Ok(list_devices(devices, default_name))
    }

    fn open_microphone(&self, device_id: Option<&str>, gain: Arc<GainControl>) -> Result<MediaStream> {
        let track_id = format!("mic-{:08x}", rand::random::<u32>());
        let inner = Arc::new(BasicTrack::new(track_id.clone(), TrackKind::Audio));
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<Arc<PcmBuffer>>>();

        let device_id = device_id.map(str::to_string);
        let enabled = inner.clone();
        std::thread::Builder::new()
            .name("meetroom-mic".to_string())
            .spawn(move || {
                let stream = match build_capture(device_id.as_deref(), gain, enabled) {
                    Ok((stream, pcm)) => {
                        let _ = ready_tx.send(Ok(pcm));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Parked until the track is stopped or dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        let pcm = ready_rx
            .recv()
            .map_err(|_| Error::Device("Capture thread exited before starting".to_string()))??;
        info!("Microphone capture started at {} Hz", pcm.sample_rate());

        self.taps.register(&track_id, &pcm);
        let track = Arc::new(MicrophoneTrack {
            inner,
            stop_tx: Mutex::new(Some(stop_tx)),
            pcm,
        });
        Ok(MediaStream::new(format!("local-{}", track_id), vec![track as Arc<dyn MediaTrack>]))
    }

    fn open_screen(&self) -> Result<MediaStream> {
        Err(Error::Device(
            "Screen capture is not available on this platform".to_string(),
        ))
    }
}

fn build_capture(
    device_id: Option<&str>,
    gain: Arc<GainControl>,
    flag: Arc<BasicTrack>,
) -> Result<(cpal::Stream, Arc<PcmBuffer>)> {
    let host = cpal::default_host();
    let device = match device_id {
        Some(id) => host
            .input_devices()
            .map_err(|e| Error::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
            .ok_or_else(|| Error::Device(format!("Input device not found: {}", id)))?,
        None => host
            .default_input_device()
            .ok_or_else(|| Error::Device("No input device available".to_string()))?,
    };

    let config = device
        .default_input_config()
        .map_err(|e| Error::PermissionDenied(format!("Cannot open input device: {}", e)))?;
    debug!("Input config: {:?}", config);

    let pcm = Arc::new(PcmBuffer::new(config.sample_rate().0));
    let stream_config: cpal::StreamConfig = config.clone().into();
    let stream = match config.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &stream_config, pcm.clone(), gain, flag)?,
        SampleFormat::I16 => build_input_stream::<i16>(&device, &stream_config, pcm.clone(), gain, flag)?,
        SampleFormat::U16 => build_input_stream::<u16>(&device, &stream_config, pcm.clone(), gain, flag)?,
        sample_format => {
            return Err(Error::Device(format!(
                "Unsupported sample format: {:?}",
                sample_format
            )))
        }
    };

    stream
        .play()
        .map_err(|e| Error::Device(format!("Failed to start capture: {}", e)))?;
    Ok((stream, pcm))
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    pcm: Arc<PcmBuffer>,
    gain: Arc<GainControl>,
    flag: Arc<BasicTrack>,
) -> Result<cpal::Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let err_fn = |err: cpal::StreamError| error!("An error occurred on the input audio stream: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !flag.is_enabled() {
                    return;
                }
                let gain = gain.get();
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| {
                        let sum: f32 = frame.iter().map(|s| s.to_sample::<f32>()).sum();
                        (sum / frame.len() as f32 * gain).clamp(-1.0, 1.0)
                    })
                    .collect();
                pcm.push(&mono);
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::PermissionDenied(format!("Failed to build input stream: {}", e)))
}

/// Computes level-analysis input from tapped PCM.
pub struct PcmAudioSource {
    taps: PcmTaps,
}

impl PcmAudioSource {
    pub fn new(taps: PcmTaps) -> Self {
        Self { taps }
    }
}

impl AudioSource for PcmAudioSource {
    fn analyser(&self, stream: &MediaStream) -> Result<Box<dyn FrequencyAnalyser>> {
        let pcm = self
            .taps
            .for_stream(stream)
            .ok_or_else(|| Error::Device(format!("No PCM available for stream {}", stream.id())))?;
        Ok(Box::new(PcmAnalyser { pcm: Arc::downgrade(&pcm) }))
    }
}

struct PcmAnalyser {
    pcm: Weak<PcmBuffer>,
}

impl FrequencyAnalyser for PcmAnalyser {
    fn frequency_data(&mut self, out: &mut [u8]) -> Result<()> {
        let pcm = self
            .pcm
            .upgrade()
            .ok_or_else(|| Error::Device("capture closed".to_string()))?;
        byte_frequency_data(&pcm.latest(WINDOW), out);
        Ok(())
    }
}

/// Hann-windowed DFT magnitudes mapped onto 0-255 over a fixed decibel range.
pub fn byte_frequency_data(samples: &[f32], out: &mut [u8]) {
    let n = samples.len();
    if n < 2 {
        out.fill(0);
        return;
    }

    let windowed: Vec<f32> = samples
        .iter()
        .enumerate()
        .map(|(i, s)| s * 0.5 * (1.0 - (2.0 * PI * i as f32 / (n - 1) as f32).cos()))
        .collect();

    for (k, bin) in out.iter_mut().enumerate() {
        if k >= n / 2 {
            *bin = 0;
            continue;
        }
        let (mut re, mut im) = (0.0f32, 0.0f32);
        for (i, x) in windowed.iter().enumerate() {
            let angle = 2.0 * PI * (k * i) as f32 / n as f32;
            re += x * angle.cos();
            im -= x * angle.sin();
        }
        let magnitude = (re * re + im * im).sqrt() / n as f32;
        let db = 20.0 * (magnitude + 1e-12).log10();
        let scaled = (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS) * 255.0;
        *bin = scaled.clamp(0.0, 255.0) as u8;
    }
}

/// Turns mono PCM at any rate into 20 ms Opus packets at 48 kHz.
pub struct OpusPacketizer {
    encoder: opus::Encoder,
    step: f64,
    position: f64,
    previous: f32,
    pending: Vec<f32>,
}

impl OpusPacketizer {
    pub fn new(input_rate: u32) -> Result<Self> {
        let encoder = opus::Encoder::new(OPUS_SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
            .map_err(|e| Error::Device(format!("Opus encoder init: {}", e)))?;
        Ok(Self {
            encoder,
            step: input_rate.max(1) as f64 / OPUS_SAMPLE_RATE as f64,
            position: 0.0,
            previous: 0.0,
            pending: Vec::with_capacity(OPUS_FRAME * 2),
        })
    }

    /// Feeds captured samples and returns every packet completed by them.
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<Vec<u8>>> {
        self.resample(samples);

        let mut packets = Vec::new();
        while self.pending.len() >= OPUS_FRAME {
            let frame: Vec<f32> = self.pending.drain(..OPUS_FRAME).collect();
            let mut packet = vec![0u8; MAX_PACKET];
            let written = self
                .encoder
                .encode_float(&frame, &mut packet)
                .map_err(|e| Error::Device(format!("Opus encode: {}", e)))?;
            packet.truncate(written);
            packets.push(packet);
        }
        Ok(packets)
    }

    // Linear interpolation between the previous chunk's last sample and this
    // chunk. `position` is measured from that previous sample.
    fn resample(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let at = |i: usize, previous: f32| if i == 0 { previous } else { samples[i - 1] };
        while self.position < samples.len() as f64 {
            let index = self.position.floor() as usize;
            let frac = (self.position - index as f64) as f32;
            let a = at(index, self.previous);
            let b = samples[index.min(samples.len() - 1)];
            self.pending.push(a + (b - a) * frac);
            self.position += self.step;
        }
        self.position -= samples.len() as f64;
        self.previous = samples[samples.len() - 1];
    }
}

/// Encodes every chunk published by `chunks` and hands each packet to
/// `write`. Blocks until the capture goes away or `closed` is set; meant for
/// a dedicated thread.
pub fn pump_opus<F>(
    mut chunks: broadcast::Receiver<Arc<[f32]>>,
    sample_rate: u32,
    closed: Arc<AtomicBool>,
    mut write: F,
) -> Result<()>
where
    F: FnMut(Vec<u8>),
{
    let mut packetizer = OpusPacketizer::new(sample_rate)?;
    loop {
        let chunk = match chunks.blocking_recv() {
            Ok(chunk) => chunk,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Encoder fell behind, skipped {} chunks", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if closed.load(Ordering::SeqCst) {
            break;
        }
        for packet in packetizer.push(&chunk)? {
            write(packet);
        }
    }
    Ok(())
}

/// Decodes a remote peer's Opus packets to mono 48 kHz PCM.
pub struct OpusDepacketizer {
    decoder: opus::Decoder,
}

impl OpusDepacketizer {
    pub fn new() -> Result<Self> {
        let decoder = opus::Decoder::new(OPUS_SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| Error::Device(format!("Opus decoder init: {}", e)))?;
        Ok(Self { decoder })
    }

    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>> {
        // Up to 120 ms per packet.
        let mut out = vec![0.0f32; OPUS_FRAME * 6];
        let decoded = self
            .decoder
            .decode_float(packet, &mut out, false)
            .map_err(|e| Error::Device(format!("Opus decode: {}", e)))?;
        out.truncate(decoded);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::levels::{average_magnitude, LevelThresholds};

    #[test]
    fn silence_maps_to_zero() {
        let mut out = [0u8; 64];
        byte_frequency_data(&[0.0; WINDOW], &mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn noise_registers_as_activity() {
        let mut seed: u32 = 0x1234_5678;
        let noise: Vec<f32> = (0..WINDOW)
            .map(|_| {
                seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (seed >> 8) as f32 / (1u32 << 24) as f32 - 0.5
            })
            .collect();

        let mut out = [0u8; 64];
        byte_frequency_data(&noise, &mut out);
        let level = LevelThresholds::default().classify(average_magnitude(&out));
        assert!(level >= 2, "level {level}");
    }

    #[test]
    fn pcm_buffer_keeps_latest_samples() {
        let pcm = PcmBuffer::new(48_000);
        pcm.push(&vec![0.1; PCM_CAPACITY]);
        pcm.push(&[0.9, 1.0]);
        let latest = pcm.latest(2);
        assert_eq!(latest, vec![0.9, 1.0]);
        assert_eq!(pcm.latest(PCM_CAPACITY * 2).len(), PCM_CAPACITY);
    }

    #[test]
    fn analyser_requires_local_capture() {
        let devices = CpalDevices::new();
        let source = devices.audio_source();
        let remote = MediaStream::new("remote", vec![BasicTrack::audio("r1")]);
        assert!(source.analyser(&remote).is_err());

        let pcm = Arc::new(PcmBuffer::new(16_000));
        devices.taps().register("r1", &pcm);
        assert!(source.analyser(&remote).is_ok());

        drop(pcm);
        assert!(source.analyser(&remote).is_err());
    }

    #[test]
    fn pushed_chunks_reach_subscribers() {
        let pcm = PcmBuffer::new(48_000);
        pcm.push(&[0.5; 4]);
        let mut rx = pcm.subscribe();
        pcm.push(&[0.25, 0.75]);
        assert_eq!(&*rx.try_recv().unwrap(), &[0.25, 0.75]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn packetizer_emits_one_packet_per_20ms() {
        let mut at_48k = OpusPacketizer::new(48_000).unwrap();
        let packets = at_48k.push(&vec![0.0; 48_000 / 10]).unwrap();
        assert_eq!(packets.len(), 5);
        assert!(packets.iter().all(|p| !p.is_empty()));

        // 100 ms of 44.1 kHz capture, delivered in uneven chunks.
        let mut at_44k = OpusPacketizer::new(44_100).unwrap();
        let mut total = 0;
        for chunk in [441usize, 1000, 2969] {
            total += at_44k.push(&vec![0.1; chunk]).unwrap().len();
        }
        assert!((4..=5).contains(&total), "{total} packets");
    }

    #[test]
    fn pump_encodes_until_capture_ends() {
        let pcm = Arc::new(PcmBuffer::new(48_000));
        let chunks = pcm.subscribe();
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = std_mpsc::channel();
        let pump = std::thread::spawn(move || pump_opus(chunks, 48_000, closed, |p| tx.send(p).unwrap()));

        for _ in 0..10 {
            pcm.push(&[0.0; 480]);
        }
        drop(pcm);
        pump.join().unwrap().unwrap();
        assert_eq!(rx.try_iter().count(), 5);
    }

    #[test]
    fn pump_stops_once_closed() {
        let pcm = Arc::new(PcmBuffer::new(48_000));
        let chunks = pcm.subscribe();
        let closed = Arc::new(AtomicBool::new(true));
        let (tx, rx) = std_mpsc::channel();
        let pump = std::thread::spawn(move || pump_opus(chunks, 48_000, closed, |p| tx.send(p).unwrap()));

        pcm.push(&[0.0; OPUS_FRAME * 2]);
        pump.join().unwrap().unwrap();
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn encoded_tone_survives_a_round_trip() {
        let tone: Vec<f32> = (0..OPUS_FRAME * 10)
            .map(|i| 0.5 * (2.0 * PI * 440.0 * i as f32 / OPUS_SAMPLE_RATE as f32).sin())
            .collect();
        let mut packetizer = OpusPacketizer::new(OPUS_SAMPLE_RATE).unwrap();
        let mut depacketizer = OpusDepacketizer::new().unwrap();

        let mut decoded = Vec::new();
        for packet in packetizer.push(&tone).unwrap() {
            decoded.extend(depacketizer.decode(&packet).unwrap());
        }
        assert_eq!(decoded.len(), tone.len());
        let energy = decoded[OPUS_FRAME * 5..].iter().map(|s| s * s).sum::<f32>();
        assert!(energy > 1.0, "energy {energy}");
    }
}
