use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use ringbuf::{
    traits::{Consumer, Observer, Producer},
    HeapRb,
};

use crate::types::error::{ReplayError, Result};
use crate::utils::{CANONICAL_BYTE_RATE, CANONICAL_FRAME_BYTES};

use super::audio::{AudioSource, SourceState};

/// How often the mix thread scans the sources.
const SCAN_INTERVAL: Duration = Duration::from_millis(1);

/// A source that produced packets but has been silent this long with an
/// empty ring is treated as dormant and mixed as implicit silence.
pub const DORMANCY_TIMEOUT: Duration = Duration::from_millis(100);

/// Mix output ring capacity: five seconds of canonical PCM.
const MIX_RING_BYTES: usize = (CANONICAL_BYTE_RATE * 5) as usize;

/// Largest chunk emitted per scan; bounds how far a single iteration can
/// catch up after the thread was starved.
const MAX_CHUNK_BYTES: usize = 19_200;

struct MixInput {
    state: Arc<SourceState>,
    volume: u32,
}

/// The clock-driven mixing step, separated from the thread so it can be
/// exercised with explicit instants.
struct MixerCore {
    inputs: Vec<MixInput>,
    started_at: Instant,
    produced_bytes: u64,
}

enum MixStep {
    /// Nothing to emit this scan
    Idle,
    /// Mixed canonical bytes ready for the output ring
    Out(Vec<u8>),
}

impl MixerCore {
    fn new(inputs: Vec<MixInput>, started_at: Instant) -> Self {
        Self {
            inputs,
            started_at,
            produced_bytes: 0,
        }
    }

    /// Produce at most one chunk of mixed output, never running ahead of
    /// wall-clock: total output is capped at elapsed x byte-rate.
    fn step(&mut self, now: Instant) -> MixStep {
        let elapsed = now.saturating_duration_since(self.started_at);
        let target = (elapsed.as_nanos() as u64 * CANONICAL_BYTE_RATE / 1_000_000_000) as usize;
        let target = target - target % CANONICAL_FRAME_BYTES;
        let budget = target
            .saturating_sub(self.produced_bytes as usize)
            .min(MAX_CHUNK_BYTES);
        if budget == 0 {
            return MixStep::Idle;
        }

        // A source with packets in flight (produced recently, ring briefly
        // empty) holds the mix back; a dormant or never-started source
        // contributes silence instead of stalling everyone.
        let mut chunk = budget;
        for input in &self.inputs {
            if !input.state.has_produced() {
                continue;
            }
            let available = input.state.available();
            if available == 0 {
                match input.state.packet_age(now) {
                    Some(age) if age <= DORMANCY_TIMEOUT => return MixStep::Idle,
                    _ => continue,
                }
            } else {
                chunk = chunk.min(available - available % CANONICAL_FRAME_BYTES);
            }
        }
        let chunk = chunk - chunk % CANONICAL_FRAME_BYTES;
        if chunk == 0 {
            return MixStep::Idle;
        }

        let mut mixed = vec![0i32; chunk / 2];
        for input in &self.inputs {
            if !input.state.has_produced() || input.state.available() == 0 {
                continue;
            }
            let bytes = input.state.read(chunk);
            for (i, pair) in bytes.chunks_exact(2).enumerate() {
                let sample = i16::from_le_bytes([pair[0], pair[1]]) as i32;
                // Per-source volume, no division by source count: one
                // silent source must not attenuate the others.
                mixed[i] += sample * input.volume as i32 / 100;
            }
        }

        let mut out = Vec::with_capacity(chunk);
        for acc in mixed {
            let clamped = acc.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            out.extend_from_slice(&clamped.to_le_bytes());
        }
        self.produced_bytes += out.len() as u64;
        MixStep::Out(out)
    }
}

/// Combines up to three audio sources into one canonical-PCM stream.
///
/// Owns its sources and a scan thread; downstream drains the mixed ring
/// through [`AudioMixer::read`].
pub struct AudioMixer {
    sources: Vec<AudioSource>,
    mix_ring: Arc<Mutex<HeapRb<u8>>>,
    stop_flag: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl AudioMixer {
    pub fn new(sources: Vec<AudioSource>) -> Self {
        Self {
            sources,
            mix_ring: Arc::new(Mutex::new(HeapRb::new(MIX_RING_BYTES))),
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Start every source and the scan thread.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(ReplayError::Validation("mixer already started".into()));
        }
        for source in &mut self.sources {
            source.start()?;
        }

        let inputs: Vec<MixInput> = self
            .sources
            .iter()
            .map(|s| MixInput {
                state: s.state(),
                volume: s.volume(),
            })
            .collect();
        let ring = Arc::clone(&self.mix_ring);
        let stop = Arc::clone(&self.stop_flag);

        let worker = std::thread::Builder::new()
            .name("audio-mixer".into())
            .spawn(move || {
                let mut core = MixerCore::new(inputs, Instant::now());
                while !stop.load(Ordering::Acquire) {
                    if let MixStep::Out(bytes) = core.step(Instant::now()) {
                        let mut ring = ring.lock().unwrap();
                        let overflow = bytes.len().saturating_sub(ring.vacant_len());
                        if overflow > 0 {
                            ring.skip(overflow);
                        }
                        ring.push_slice(&bytes);
                    }
                    std::thread::sleep(SCAN_INTERVAL);
                }
                log::debug!("audio mixer thread exiting");
            })
            .map_err(|e| ReplayError::DeviceInit(format!("could not spawn mixer: {e}")))?;

        self.worker = Some(worker);
        Ok(())
    }

    /// Drain up to `max_bytes` of mixed canonical PCM.
    pub fn read(&self, max_bytes: usize) -> Vec<u8> {
        let want = max_bytes - max_bytes % CANONICAL_FRAME_BYTES;
        let mut buf = vec![0u8; want];
        let got = self.mix_ring.lock().unwrap().pop_slice(&mut buf);
        buf.truncate(got - got % CANONICAL_FRAME_BYTES);
        buf
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        for source in &mut self.sources {
            source.stop();
        }
    }
}

impl Drop for AudioMixer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_of(sample: i16, frames: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(frames * 4);
        for _ in 0..frames * 2 {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }

    fn decode(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    fn input(volume: u32) -> (Arc<SourceState>, MixInput) {
        let state = Arc::new(SourceState::new());
        (
            Arc::clone(&state),
            MixInput {
                state,
                volume,
            },
        )
    }

    #[test]
    fn pacing_never_runs_ahead_of_wall_clock() {
        let (state, inp) = input(100);
        state.push(&pcm_of(100, 48_000)); // one full second buffered
        let t0 = Instant::now();
        let mut core = MixerCore::new(vec![inp], t0);

        // 10 ms of wall clock allows at most 1920 bytes plus one chunk.
        let mut emitted = 0usize;
        for _ in 0..50 {
            if let MixStep::Out(bytes) = core.step(t0 + Duration::from_millis(10)) {
                emitted += bytes.len();
            }
        }
        let allowance = (CANONICAL_BYTE_RATE / 100) as usize + MAX_CHUNK_BYTES;
        assert!(emitted <= allowance, "emitted {emitted} > {allowance}");
        assert!(emitted >= 1_920);
    }

    #[test]
    fn silent_partner_does_not_halve_volume() {
        // E4 shape: A plays, B exists but never produces.
        let (a, inp_a) = input(100);
        let (_b, inp_b) = input(100);
        a.push(&pcm_of(1_000, 4_800));

        let t0 = Instant::now();
        let mut core = MixerCore::new(vec![inp_a, inp_b], t0);
        let MixStep::Out(bytes) = core.step(t0 + Duration::from_millis(50)) else {
            panic!("expected output");
        };
        assert!(decode(&bytes).iter().all(|&s| s == 1_000));
    }

    #[test]
    fn in_flight_source_stalls_the_scan_until_dormant() {
        let (a, inp_a) = input(100);
        let (b, inp_b) = input(100);
        a.push(&pcm_of(500, 4_800));
        b.push(&pcm_of(500, 48)); // b produced once, then went quiet
        let t0 = Instant::now();
        let mut core = MixerCore::new(vec![inp_a, inp_b], t0);

        // Drain b's little buffer.
        match core.step(t0 + Duration::from_millis(20)) {
            MixStep::Out(bytes) => assert!(decode(&bytes).iter().all(|&s| s == 1_000)),
            MixStep::Idle => panic!("expected output"),
        }

        // b is empty but recent: the mix must wait rather than emit.
        assert!(matches!(
            core.step(t0 + Duration::from_millis(30)),
            MixStep::Idle
        ));

        // Once b has been quiet past the dormancy window it contributes
        // silence and a flows again at full volume.
        let late = t0 + DORMANCY_TIMEOUT + Duration::from_millis(150);
        match core.step(late) {
            MixStep::Out(bytes) => assert!(decode(&bytes).iter().all(|&s| s == 500)),
            MixStep::Idle => panic!("expected output after dormancy"),
        }
    }

    #[test]
    fn volume_scales_and_sum_saturates() {
        let (a, inp_a) = input(50);
        let (b, inp_b) = input(100);
        a.push(&pcm_of(1_000, 480));
        b.push(&pcm_of(i16::MAX, 480));

        let t0 = Instant::now();
        let mut core = MixerCore::new(vec![inp_a, inp_b], t0);
        let MixStep::Out(bytes) = core.step(t0 + Duration::from_millis(10)) else {
            panic!("expected output");
        };
        // 1000 * 0.5 + 32767 saturates.
        assert!(decode(&bytes).iter().all(|&s| s == i16::MAX));
    }

    #[test]
    fn all_dormant_sources_yield_paced_silence() {
        let (a, inp_a) = input(100);
        a.push(&pcm_of(123, 12)); // produced once
        let t0 = Instant::now();
        let mut core = MixerCore::new(vec![inp_a], t0);

        // Drain the few frames, then let dormancy kick in.
        let _ = core.step(t0 + Duration::from_millis(5));
        let late = t0 + Duration::from_millis(500);
        match core.step(late) {
            MixStep::Out(bytes) => {
                assert!(!bytes.is_empty());
                assert!(decode(&bytes).iter().all(|&s| s == 0));
            }
            MixStep::Idle => panic!("dormant source must not stall the mix"),
        }
    }
}
