use std::{
    process::Command,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use pipewire::{
    self as pw,
    context::Context,
    main_loop::MainLoop,
    properties::properties,
    spa::{
        self,
        param::format::{MediaSubtype, MediaType},
        pod::Pod,
        utils::Direction,
    },
    stream::{StreamFlags, StreamState},
};
use ringbuf::{
    traits::{Consumer, Observer, Producer},
    HeapRb,
};

use crate::types::config::AudioSourceConfig;
use crate::types::error::{ReplayError, Result};
use crate::utils::{CANONICAL_BYTE_RATE, CANONICAL_FRAME_BYTES, CANONICAL_SAMPLE_RATE};

use super::Terminate;

/// Per-source ring capacity: two seconds of canonical PCM.
const SOURCE_RING_BYTES: usize = (CANONICAL_BYTE_RATE * 2) as usize;

/// Sample encodings we accept from a device before canonicalizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SampleKind {
    S16,
    S24,
    S32,
    /// 32-bit float, covering float payloads advertised under both the
    /// plain and the extended PCM format tags.
    F32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CaptureFormat {
    pub rate: u32,
    pub channels: u32,
    pub sample: SampleKind,
}

impl SampleKind {
    fn bytes_per_sample(self) -> usize {
        match self {
            SampleKind::S16 => 2,
            SampleKind::S24 => 3,
            SampleKind::S32 | SampleKind::F32 => 4,
        }
    }
}

/// Decode device samples to i16, take the first two channels (duplicating
/// mono), and linearly resample to the canonical rate. Returns canonical
/// interleaved s16le bytes aligned to whole sample frames.
pub(crate) fn canonicalize(bytes: &[u8], fmt: CaptureFormat) -> Vec<u8> {
    if fmt.channels == 0 || fmt.rate == 0 {
        return Vec::new();
    }
    let bytes = &bytes[..bytes.len() - bytes.len() % fmt.sample.bytes_per_sample()];
    let decoded = decode_samples(bytes, fmt.sample);
    let stereo = to_stereo(&decoded, fmt.channels as usize);
    let resampled = resample_linear(&stereo, fmt.rate, CANONICAL_SAMPLE_RATE);

    let mut out = Vec::with_capacity(resampled.len() * 2);
    for s in resampled {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

fn decode_samples(bytes: &[u8], kind: SampleKind) -> Vec<i16> {
    match kind {
        SampleKind::S16 => bytemuck::pod_collect_to_vec(bytes),
        SampleKind::S24 => bytes
            .chunks_exact(3)
            .map(|b| {
                let wide = (b[2] as i8 as i32) << 16 | (b[1] as i32) << 8 | b[0] as i32;
                (wide >> 8) as i16
            })
            .collect(),
        SampleKind::S32 => {
            let wide: Vec<i32> = bytemuck::pod_collect_to_vec(bytes);
            wide.into_iter().map(|s| (s >> 16) as i16).collect()
        }
        SampleKind::F32 => {
            let floats: Vec<f32> = bytemuck::pod_collect_to_vec(bytes);
            floats
                .into_iter()
                .map(|f| (f.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .collect()
        }
    }
}

fn to_stereo(samples: &[i16], channels: usize) -> Vec<i16> {
    match channels {
        0 => Vec::new(),
        1 => {
            let mut out = Vec::with_capacity(samples.len() * 2);
            for &s in samples {
                out.push(s);
                out.push(s);
            }
            out
        }
        2 => samples.to_vec(),
        n => {
            // Keep the front pair, drop the rest.
            let mut out = Vec::with_capacity(samples.len() / n * 2);
            for frame in samples.chunks_exact(n) {
                out.push(frame[0]);
                out.push(frame[1]);
            }
            out
        }
    }
}

fn resample_linear(stereo: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || stereo.len() < 2 {
        return stereo.to_vec();
    }
    let in_frames = stereo.len() / 2;
    let out_frames = (in_frames as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_frames * 2);
    for i in 0..out_frames {
        let pos = i as f64 * from_rate as f64 / to_rate as f64;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let next = (idx + 1).min(in_frames - 1);
        for ch in 0..2 {
            let a = stereo[idx * 2 + ch] as f64;
            let b = stereo[next * 2 + ch] as f64;
            out.push((a + (b - a) * frac).round() as i16);
        }
    }
    out
}

/// State shared between a source's capture thread and the mixer.
pub(crate) struct SourceState {
    ring: Mutex<HeapRb<u8>>,
    last_packet: Mutex<Option<Instant>>,
    produced: AtomicBool,
}

impl SourceState {
    pub(crate) fn new() -> Self {
        Self {
            ring: Mutex::new(HeapRb::new(SOURCE_RING_BYTES)),
            last_packet: Mutex::new(None),
            produced: AtomicBool::new(false),
        }
    }

    /// Append canonical bytes, dropping the oldest when full.
    pub(crate) fn push(&self, bytes: &[u8]) {
        let mut ring = self.ring.lock().unwrap();
        let overflow = bytes.len().saturating_sub(ring.vacant_len());
        if overflow > 0 {
            ring.skip(overflow);
        }
        ring.push_slice(bytes);
        drop(ring);

        *self.last_packet.lock().unwrap() = Some(Instant::now());
        self.produced.store(true, Ordering::Release);
    }

    pub(crate) fn available(&self) -> usize {
        self.ring.lock().unwrap().occupied_len()
    }

    /// Pop up to `max` bytes, aligned down to whole sample frames.
    pub(crate) fn read(&self, max: usize) -> Vec<u8> {
        let want = max - max % CANONICAL_FRAME_BYTES;
        let mut buf = vec![0u8; want];
        let got = self.ring.lock().unwrap().pop_slice(&mut buf);
        buf.truncate(got - got % CANONICAL_FRAME_BYTES);
        buf
    }

    pub(crate) fn has_produced(&self) -> bool {
        self.produced.load(Ordering::Acquire)
    }

    /// Time since the last packet, measured at `now`.
    pub(crate) fn packet_age(&self, now: Instant) -> Option<Duration> {
        self.last_packet
            .lock()
            .unwrap()
            .map(|at| now.saturating_duration_since(at))
    }
}

/// One capture device, canonicalized to 48 kHz s16le stereo.
///
/// `start` spawns a PipeWire loop thread that fills the per-source ring;
/// the mixer drains it through [`AudioSource::read`].
pub struct AudioSource {
    state: Arc<SourceState>,
    volume: u32,
    device_id: Option<u32>,
    loopback: bool,
    terminate_tx: Option<pw::channel::Sender<Terminate>>,
    worker: Option<std::thread::JoinHandle<Result<()>>>,
}

impl AudioSource {
    pub fn create(config: &AudioSourceConfig) -> Self {
        Self {
            state: Arc::new(SourceState::new()),
            volume: config.volume.min(100),
            device_id: config.device_id,
            loopback: config.loopback,
            terminate_tx: None,
            worker: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(ReplayError::Validation("audio source already started".into()));
        }

        let (pw_sender, pw_recv) = pw::channel::channel();
        self.terminate_tx = Some(pw_sender);

        let state = Arc::clone(&self.state);
        let target = match self.device_id {
            Some(id) => Some(id),
            None if self.loopback => get_default_sink_node_id(),
            None => None,
        };
        let loopback = self.loopback;

        let worker = std::thread::Builder::new()
            .name("pw-audio-capture".into())
            .spawn(move || -> Result<()> {
                log::debug!("starting audio capture stream (target {target:?})");
                run_capture_stream(state, target, loopback, pw_recv)
            })
            .map_err(|e| ReplayError::DeviceInit(format!("could not spawn audio thread: {e}")))?;

        self.worker = Some(worker);
        Ok(())
    }

    /// Canonical-PCM bytes, aligned to whole sample frames.
    pub fn read(&self, max_bytes: usize) -> Vec<u8> {
        self.state.read(max_bytes)
    }

    pub fn volume(&self) -> u32 {
        self.volume
    }

    pub(crate) fn state(&self) -> Arc<SourceState> {
        Arc::clone(&self.state)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.terminate_tx.take() {
            let _ = tx.send(Terminate);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone, Copy, Default)]
struct UserData {
    audio_format: spa::param::audio::AudioInfoRaw,
}

fn map_capture_format(info: &spa::param::audio::AudioInfoRaw) -> Option<CaptureFormat> {
    use spa::param::audio::AudioFormat;
    let sample = match info.format() {
        AudioFormat::S16LE => SampleKind::S16,
        AudioFormat::S24LE => SampleKind::S24,
        AudioFormat::S32LE => SampleKind::S32,
        AudioFormat::F32LE => SampleKind::F32,
        _ => return None,
    };
    Some(CaptureFormat {
        rate: info.rate(),
        channels: info.channels(),
        sample,
    })
}

fn run_capture_stream(
    state: Arc<SourceState>,
    target_node: Option<u32>,
    loopback: bool,
    termination_recv: pw::channel::Receiver<Terminate>,
) -> Result<()> {
    let pw_loop = MainLoop::new(None)?;
    let terminate_loop = pw_loop.clone();

    let _recv = termination_recv.attach(pw_loop.loop_(), move |_| {
        log::debug!("Terminating audio capture loop");
        terminate_loop.quit();
    });

    let pw_context = Context::new(&pw_loop)?;
    let audio_core = pw_context.connect(None)?;

    let _audio_core_listener = audio_core
        .add_listener_local()
        .info(|i| log::debug!("AUDIO CORE:\n{i:#?}"))
        .error(|e, f, g, h| log::error!("pipewire audio error: {e},{f},{g},{h}"))
        .done(|d, _| log::debug!("DONE: {d}"))
        .register();

    let data = UserData::default();

    let audio_stream = pw::stream::Stream::new(
        &audio_core,
        "replaycap-audio",
        properties! {
            *pw::keys::MEDIA_TYPE => "Audio",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Music",
            *pw::keys::NODE_LATENCY => "1024/48000",
            *pw::keys::STREAM_CAPTURE_SINK => if loopback { "true" } else { "false" },
        },
    )?;

    let _listener = audio_stream
        .add_local_listener_with_user_data(data)
        .state_changed(|_, _, old, new| {
            log::debug!("Audio Stream State Changed: {old:?} -> {new:?}");
            if matches!(new, StreamState::Error(_)) {
                log::error!("audio stream entered error state");
            }
        })
        .param_changed(|_, udata, id, param| {
            let Some(param) = param else {
                return;
            };
            if id != pw::spa::param::ParamType::Format.as_raw() {
                return;
            }

            let (media_type, media_subtype) =
                match pw::spa::param::format_utils::parse_format(param) {
                    Ok(v) => v,
                    Err(_) => return,
                };

            // only accept raw audio
            if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
                return;
            }

            if udata.audio_format.parse(param).is_err() {
                log::error!("failed to parse negotiated audio format");
                return;
            }

            log::debug!(
                "Capturing Rate:{} channels:{}, format: {}",
                udata.audio_format.rate(),
                udata.audio_format.channels(),
                udata.audio_format.format().as_raw()
            );
        })
        .process(move |stream, udata| match stream.dequeue_buffer() {
            None => log::debug!("Out of audio buffers"),
            Some(mut buffer) => {
                let datas = buffer.datas_mut();
                if datas.is_empty() {
                    return;
                }

                let Some(fmt) = map_capture_format(&udata.audio_format) else {
                    return;
                };

                let data = &mut datas[0];
                let n_bytes = data.chunk().size() as usize;
                if n_bytes == 0 {
                    return;
                }
                let n_bytes = n_bytes - n_bytes % fmt.sample.bytes_per_sample();

                match data.data() {
                    Some(samples) => {
                        state.push(&canonicalize(&samples[..n_bytes.min(samples.len())], fmt));
                    }
                    None => {
                        // Silence packet: same canonical byte count as the
                        // equivalent non-silent packet, all zeros.
                        let zeros = vec![0u8; n_bytes];
                        state.push(&canonicalize(&zeros, fmt));
                    }
                }
            }
        })
        .register()?;

    let audio_spa_obj = pw::spa::pod::object! {
        pw::spa::utils::SpaTypes::ObjectParamFormat,
        pw::spa::param::ParamType::EnumFormat,
        pw::spa::pod::property!(
            pw::spa::param::format::FormatProperties::MediaType,
            Id,
            pw::spa::param::format::MediaType::Audio
            ),
        pw::spa::pod::property!(
            pw::spa::param::format::FormatProperties::MediaSubtype,
            Id,
            pw::spa::param::format::MediaSubtype::Raw
        ),
        pw::spa::pod::property!(
            pw::spa::param::format::FormatProperties::AudioFormat,
            Choice,
            Enum,
            Id,
            pw::spa::param::audio::AudioFormat::F32LE,
            pw::spa::param::audio::AudioFormat::S16LE,
            pw::spa::param::audio::AudioFormat::S24LE,
            pw::spa::param::audio::AudioFormat::S32LE,
        )
    };

    let audio_spa_values: Vec<u8> = pw::spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &pw::spa::pod::Value::Object(audio_spa_obj),
    )
    .map_err(|e| ReplayError::PipeWire(format!("could not serialize audio pod: {e:?}")))?
    .0
    .into_inner();

    let mut audio_params = [Pod::from_bytes(&audio_spa_values)
        .ok_or_else(|| ReplayError::PipeWire("invalid audio format pod".into()))?];

    audio_stream.connect(
        Direction::Input,
        target_node,
        StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS | StreamFlags::RT_PROCESS,
        &mut audio_params,
    )?;

    log::debug!("Audio Stream: {audio_stream:?}");

    pw_loop.run();
    Ok(())
}

// Theres gotta be a less goofy way to do this
fn get_default_sink_node_id() -> Option<u32> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(r#"pactl list sinks | awk -v sink="$(pactl info | grep 'Default Sink' | cut -d' ' -f3)" '$0 ~ "Name: " sink { found=1 } found && /object.id/ { print $NF; exit }'"#)
        .output()
        .ok()?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    let cleaned = stdout.replace('"', "");

    cleaned.trim().parse::<u32>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(rate: u32, channels: u32, sample: SampleKind) -> CaptureFormat {
        CaptureFormat {
            rate,
            channels,
            sample,
        }
    }

    #[test]
    fn s16_stereo_at_canonical_rate_passes_through() {
        let samples: Vec<u8> = [100i16, -100, 2000, -2000]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let out = canonicalize(&samples, fmt(48_000, 2, SampleKind::S16));
        assert_eq!(out, samples);
    }

    #[test]
    fn mono_duplicates_into_both_channels() {
        let samples: Vec<u8> = [1000i16, -1000]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let out = canonicalize(&samples, fmt(48_000, 1, SampleKind::S16));
        let decoded: Vec<i16> = out
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(decoded, vec![1000, 1000, -1000, -1000]);
    }

    #[test]
    fn f32_scales_and_clamps() {
        let input: Vec<u8> = [0.5f32, -0.5, 2.0, -2.0]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let out = canonicalize(&input, fmt(48_000, 2, SampleKind::F32));
        let decoded: Vec<i16> = out
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(decoded[0], (0.5 * i16::MAX as f32) as i16);
        assert_eq!(decoded[2], i16::MAX);
        assert_eq!(decoded[3], -i16::MAX);
    }

    #[test]
    fn s24_and_s32_reduce_to_top_bits() {
        // 0x123456 as signed 24-bit -> 0x1234 as i16.
        let s24 = [0x56u8, 0x34, 0x12, 0x56, 0x34, 0x12];
        let out = canonicalize(&s24, fmt(48_000, 2, SampleKind::S24));
        let first = i16::from_le_bytes([out[0], out[1]]);
        assert_eq!(first, 0x1234);

        let s32 = (0x1234_0000i32).to_le_bytes().repeat(2);
        let out = canonicalize(&s32, fmt(48_000, 2, SampleKind::S32));
        let first = i16::from_le_bytes([out[0], out[1]]);
        assert_eq!(first, 0x1234);
    }

    #[test]
    fn resample_changes_length_proportionally() {
        // 100 frames at 44.1 kHz -> ~108 frames at 48 kHz.
        let stereo: Vec<i16> = (0..200).map(|i| i as i16).collect();
        let out = resample_linear(&stereo, 44_100, 48_000);
        let out_frames = out.len() / 2;
        assert_eq!(out_frames, 100 * 48_000 / 44_100);
        // Endpoints interpolate within the input range.
        assert!(out.iter().all(|&s| (0..200).contains(&(s as i32))));
    }

    #[test]
    fn ring_drops_oldest_on_overflow() {
        let state = SourceState::new();
        state.push(&vec![1u8; SOURCE_RING_BYTES]);
        state.push(&[2u8; 8]);
        assert_eq!(state.available(), SOURCE_RING_BYTES);
        // Skip ahead to the end: the newest bytes must have survived.
        let drained = state.read(SOURCE_RING_BYTES);
        assert_eq!(&drained[drained.len() - 8..], &[2u8; 8]);
    }

    #[test]
    fn read_aligns_to_sample_frames() {
        let state = SourceState::new();
        state.push(&[7u8; 10]);
        let out = state.read(7);
        assert_eq!(out.len(), 4);
    }
}
