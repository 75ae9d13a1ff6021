//! Coarse audio activity levels (0-3) for speaking indicators.
//!
//! Analysis is best effort: a stream whose audio graph cannot be built
//! reports silence instead of failing. The analyzer only reads streams and
//! never stops their tracks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::error::Result;
use crate::media::MediaStream;

/// Bins requested from each analyser per tick.
pub const FREQUENCY_BINS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelThresholds {
    pub low: f32,
    pub medium: f32,
    pub high: f32,
}

impl Default for LevelThresholds {
    fn default() -> Self {
        Self {
            low: 10.0,
            medium: 30.0,
            high: 60.0,
        }
    }
}

impl LevelThresholds {
    pub fn classify(&self, average: f32) -> u8 {
        if average < self.low {
            0
        } else if average < self.medium {
            1
        } else if average < self.high {
            2
        } else {
            3
        }
    }
}

pub fn average_magnitude(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    bins.iter().map(|&b| b as f32).sum::<f32>() / bins.len() as f32
}

/// One node of a platform audio graph, yielding byte frequency magnitudes
/// (0-255 per bin).
pub trait FrequencyAnalyser: Send {
    fn frequency_data(&mut self, out: &mut [u8]) -> Result<()>;
}

/// Builds analysers for streams. Dropping an analyser disconnects it.
pub trait AudioSource: Send + Sync {
    fn analyser(&self, stream: &MediaStream) -> Result<Box<dyn FrequencyAnalyser>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioLevelSample {
    pub subject_id: String,
    pub level: u8,
}

struct Probe {
    stream: MediaStream,
    analyser: Option<Box<dyn FrequencyAnalyser>>,
    buffer: Vec<u8>,
}

impl Probe {
    fn new(source: &dyn AudioSource, stream: MediaStream) -> Self {
        let analyser = match source.analyser(&stream) {
            Ok(analyser) => Some(analyser),
            Err(e) => {
                debug!("No analyser for stream {}, reporting silence: {}", stream.id(), e);
                None
            }
        };
        Self {
            stream,
            analyser,
            buffer: vec![0; FREQUENCY_BINS],
        }
    }

    fn level(&mut self, thresholds: &LevelThresholds) -> u8 {
        let audible = self
            .stream
            .audio_tracks()
            .any(|t| t.is_live() && t.is_enabled());
        if !audible {
            return 0;
        }
        let Some(analyser) = self.analyser.as_mut() else {
            return 0;
        };
        if let Err(e) = analyser.frequency_data(&mut self.buffer) {
            debug!("Analyser for stream {} failed, dropping it: {}", self.stream.id(), e);
            self.analyser = None;
            return 0;
        }
        thresholds.classify(average_magnitude(&self.buffer))
    }
}

/// Single-subject meter: one analyser bound to at most one stream.
pub struct LevelMeter {
    source: Arc<dyn AudioSource>,
    thresholds: LevelThresholds,
    probe: Option<Probe>,
}

impl LevelMeter {
    pub fn new(source: Arc<dyn AudioSource>, thresholds: LevelThresholds) -> Self {
        Self {
            source,
            thresholds,
            probe: None,
        }
    }

    pub fn set_stream(&mut self, stream: Option<MediaStream>) {
        self.probe = stream.map(|s| Probe::new(self.source.as_ref(), s));
    }

    pub fn level(&mut self) -> u8 {
        match self.probe.as_mut() {
            Some(probe) => probe.level(&self.thresholds),
            None => 0,
        }
    }

    /// Recomputes on every `period` tick in a background task.
    pub fn start(self, period: Duration) -> LevelMeterHandle {
        let (stream_tx, stream_rx) = watch::channel::<Option<MediaStream>>(None);
        let (level_tx, level_rx) = watch::channel(0u8);
        let task = tokio::spawn(run_meter(self, period, stream_rx, level_tx));
        LevelMeterHandle {
            stream_tx,
            level_rx,
            task,
        }
    }
}

async fn run_meter(
    mut meter: LevelMeter,
    period: Duration,
    mut stream_rx: watch::Receiver<Option<MediaStream>>,
    level_tx: watch::Sender<u8>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let level = meter.level();
                level_tx.send_if_modified(|current| {
                    let changed = *current != level;
                    *current = level;
                    changed
                });
            }
            changed = stream_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let stream = stream_rx.borrow_and_update().clone();
                let absent = stream.is_none();
                meter.set_stream(stream);
                if absent {
                    let _ = level_tx.send(0);
                }
            }
        }
    }
}

pub struct LevelMeterHandle {
    stream_tx: watch::Sender<Option<MediaStream>>,
    level_rx: watch::Receiver<u8>,
    task: JoinHandle<()>,
}

impl LevelMeterHandle {
    pub fn set_stream(&self, stream: Option<MediaStream>) {
        let _ = self.stream_tx.send(stream);
    }

    pub fn level(&self) -> u8 {
        *self.level_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u8> {
        self.level_rx.clone()
    }
}

impl Drop for LevelMeterHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Multi-subject registry: one probe per subject, all recomputed together.
pub struct AudioLevelRegistry {
    source: Arc<dyn AudioSource>,
    thresholds: LevelThresholds,
    probes: BTreeMap<String, Probe>,
    levels: BTreeMap<String, u8>,
}

impl AudioLevelRegistry {
    pub fn new(source: Arc<dyn AudioSource>, thresholds: LevelThresholds) -> Self {
        Self {
            source,
            thresholds,
            probes: BTreeMap::new(),
            levels: BTreeMap::new(),
        }
    }

    /// Adds a subject, or rebinds it if its stream changed.
    pub fn register(&mut self, subject_id: &str, stream: MediaStream) {
        if let Some(existing) = self.probes.get(subject_id) {
            if existing.stream.id() == stream.id() {
                return;
            }
        }
        debug!("Analysing {} (stream {})", subject_id, stream.id());
        let probe = Probe::new(self.source.as_ref(), stream);
        self.probes.insert(subject_id.to_string(), probe);
        self.levels.insert(subject_id.to_string(), 0);
    }

    pub fn unregister(&mut self, subject_id: &str) -> bool {
        self.levels.remove(subject_id);
        self.probes.remove(subject_id).is_some()
    }

    /// Makes the registry match `subjects` exactly.
    pub fn sync(&mut self, subjects: &[(String, MediaStream)]) {
        let gone: Vec<String> = self
            .probes
            .keys()
            .filter(|id| !subjects.iter().any(|(s, _)| s == *id))
            .cloned()
            .collect();
        for id in gone {
            self.unregister(&id);
        }
        for (id, stream) in subjects {
            self.register(id, stream.clone());
        }
    }

    pub fn tick(&mut self) -> Vec<AudioLevelSample> {
        let thresholds = self.thresholds;
        let mut samples = Vec::with_capacity(self.probes.len());
        for (id, probe) in self.probes.iter_mut() {
            let level = probe.level(&thresholds);
            self.levels.insert(id.clone(), level);
            samples.push(AudioLevelSample {
                subject_id: id.clone(),
                level,
            });
        }
        samples
    }

    pub fn level(&self, subject_id: &str) -> Option<u8> {
        self.levels.get(subject_id).copied()
    }

    pub fn levels(&self) -> &BTreeMap<String, u8> {
        &self.levels
    }

    pub fn subjects(&self) -> Vec<String> {
        self.probes.keys().cloned().collect()
    }

    /// Moves the registry onto a background task driven by one shared timer.
    pub fn start(self, period: Duration) -> AudioLevelsHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (levels_tx, levels_rx) = watch::channel(BTreeMap::new());
        let task = tokio::spawn(run_registry(self, period, commands_rx, levels_tx));
        AudioLevelsHandle {
            commands: commands_tx,
            levels_rx,
            task,
        }
    }
}

enum RegistryCommand {
    Register(String, MediaStream),
    Unregister(String),
    Sync(Vec<(String, MediaStream)>),
}

async fn run_registry(
    mut registry: AudioLevelRegistry,
    period: Duration,
    mut commands: mpsc::UnboundedReceiver<RegistryCommand>,
    levels_tx: watch::Sender<BTreeMap<String, u8>>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                registry.tick();
            }
            command = commands.recv() => {
                match command {
                    Some(RegistryCommand::Register(id, stream)) => registry.register(&id, stream),
                    Some(RegistryCommand::Unregister(id)) => {
                        registry.unregister(&id);
                    }
                    Some(RegistryCommand::Sync(subjects)) => registry.sync(&subjects),
                    None => break,
                }
            }
        }
        levels_tx.send_if_modified(|current| {
            if current == registry.levels() {
                false
            } else {
                *current = registry.levels().clone();
                true
            }
        });
    }
}

pub struct AudioLevelsHandle {
    commands: mpsc::UnboundedSender<RegistryCommand>,
    levels_rx: watch::Receiver<BTreeMap<String, u8>>,
    task: JoinHandle<()>,
}

impl AudioLevelsHandle {
    pub fn register(&self, subject_id: impl Into<String>, stream: MediaStream) {
        let _ = self
            .commands
            .send(RegistryCommand::Register(subject_id.into(), stream));
    }

    pub fn unregister(&self, subject_id: impl Into<String>) {
        let _ = self.commands.send(RegistryCommand::Unregister(subject_id.into()));
    }

    pub fn sync(&self, subjects: Vec<(String, MediaStream)>) {
        let _ = self.commands.send(RegistryCommand::Sync(subjects));
    }

    pub fn levels(&self) -> BTreeMap<String, u8> {
        self.levels_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<String, u8>> {
        self.levels_rx.clone()
    }
}

impl Drop for AudioLevelsHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::BasicTrack;
    use crate::tests::fakes::FakeAudioSource;

    fn stream(id: &str) -> MediaStream {
        MediaStream::new(id, vec![BasicTrack::audio(format!("{id}-track"))])
    }

    #[test]
    fn threshold_boundaries() {
        let thresholds = LevelThresholds::default();
        let levels: Vec<u8> = [9.0, 10.0, 29.0, 30.0, 59.0, 60.0]
            .iter()
            .map(|&avg| thresholds.classify(avg))
            .collect();
        assert_eq!(levels, vec![0, 1, 1, 2, 2, 3]);
    }

    #[test]
    fn average_of_bins() {
        assert_eq!(average_magnitude(&[]), 0.0);
        assert_eq!(average_magnitude(&[10, 20, 30, 40]), 25.0);
    }

    #[test]
    fn meter_reports_zero_without_stream() {
        let source = FakeAudioSource::new();
        let mut meter = LevelMeter::new(Arc::new(source.clone()), LevelThresholds::default());
        assert_eq!(meter.level(), 0);

        let mic = stream("mic");
        source.set_magnitude("mic", 45);
        meter.set_stream(Some(mic.clone()));
        assert_eq!(meter.level(), 2);

        mic.tracks()[0].set_enabled(false);
        assert_eq!(meter.level(), 0);
        assert!(mic.tracks()[0].is_live());

        meter.set_stream(None);
        assert_eq!(meter.level(), 0);
    }

    #[test]
    fn unbuildable_graph_reports_silence() {
        let source = FakeAudioSource::new();
        source.fail_for("broken");
        let mut registry = AudioLevelRegistry::new(Arc::new(source), LevelThresholds::default());
        registry.register("remote", stream("broken"));

        let samples = registry.tick();
        assert_eq!(
            samples,
            vec![AudioLevelSample {
                subject_id: "remote".into(),
                level: 0
            }]
        );
    }

    #[test]
    fn registry_follows_subjects_without_stopping_tracks() {
        let source = FakeAudioSource::new();
        source.set_magnitude("a", 70);
        source.set_magnitude("b", 15);
        let mut registry = AudioLevelRegistry::new(Arc::new(source.clone()), LevelThresholds::default());

        let a = stream("a");
        let b = stream("b");
        registry.sync(&[("alice".into(), a.clone()), ("bob".into(), b.clone())]);
        registry.tick();
        assert_eq!(registry.level("alice"), Some(3));
        assert_eq!(registry.level("bob"), Some(1));

        registry.sync(&[("alice".into(), a.clone())]);
        assert_eq!(registry.subjects(), vec!["alice"]);
        assert_eq!(registry.level("bob"), None);
        assert!(b.is_live());
        assert_eq!(source.open_analysers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_timer_publishes_levels() {
        let source = FakeAudioSource::new();
        source.set_magnitude("a", 35);
        let registry = AudioLevelRegistry::new(Arc::new(source.clone()), LevelThresholds::default());
        let handle = registry.start(Duration::from_millis(100));
        let mut levels = handle.subscribe();

        handle.register("alice", stream("a"));
        levels.changed().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handle.levels().get("alice"), Some(&2));

        handle.unregister("alice");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.levels().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn meter_drops_to_zero_when_stream_removed() {
        let source = FakeAudioSource::new();
        source.set_magnitude("mic", 80);
        let meter = LevelMeter::new(Arc::new(source), LevelThresholds::default());
        let handle = meter.start(Duration::from_millis(100));

        handle.set_stream(Some(stream("mic")));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(handle.level(), 3);

        handle.set_stream(None);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.level(), 0);
    }
}
