//! In-process receiver generating tones, for tests and benchmarks.
//!
//! Reads can be scripted to return timeouts, overflows or fatal codes so that
//! every branch of the acquisition loop can be driven without hardware.

use std::collections::VecDeque;
use std::f64::consts::TAU;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::codec::{WireBuffer, WireFormat};
use crate::hardware::{Device, ReadStatus, RxStream};
use crate::utils::lock;
use crate::{DEFAULT_SAMP_RATE, Error, Result};

/// Complex exponential on one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Tone {
    /// Baseband frequency in Hz, negative below centre.
    pub freq: f64,
    /// Peak amplitude as a fraction of full scale.
    pub amplitude: f64,
}

/// Forced outcome of the next read, consumed in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedRead {
    Timeout,
    Overflow,
    Fatal(i32),
}

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Reported by the native format probe.
    pub native_format: String,
    pub full_scale: f64,
    pub mtu: usize,
    /// Tone per channel index; missing channels carry only noise.
    pub tones: Vec<Tone>,
    /// Gaussian noise standard deviation as a fraction of full scale.
    pub noise: f64,
    /// Pace reads at the configured sample rate.
    pub realtime: bool,
    /// Successful reads served per stream before every read times out.
    pub max_reads: Option<u64>,
    /// Time a timed-out read blocks, capped by the caller's timeout.
    pub idle_sleep: Duration,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            native_format: "CS16".to_string(),
            full_scale: 32768.0,
            mtu: 4096,
            tones: Vec::new(),
            noise: 0.0,
            realtime: false,
            max_reads: None,
            idle_sleep: Duration::from_millis(1),
            seed: 0,
        }
    }
}

/// What the device has been asked to do, for assertions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceStats {
    pub streams_opened: u64,
    pub streams_closed: u64,
    /// Channel count of every stream opened, in order.
    pub channel_counts: Vec<usize>,
    /// Wire format of every stream opened, in order.
    pub formats: Vec<WireFormat>,
    pub reads: u64,
    /// Reads issued on a stream after it returned a fatal code.
    pub reads_after_fatal: u64,
    pub sample_rate: u32,
}

struct DeviceState {
    stats: DeviceStats,
    script: VecDeque<ScriptedRead>,
    fail_opens: u32,
}

pub struct SyntheticDevice {
    config: SyntheticConfig,
    state: Arc<Mutex<DeviceState>>,
}

impl SyntheticDevice {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(DeviceState {
                stats: DeviceStats {
                    sample_rate: DEFAULT_SAMP_RATE,
                    ..Default::default()
                },
                script: VecDeque::new(),
                fail_opens: 0,
            })),
        }
    }

    /// Queue forced read outcomes, served before any generated data.
    pub fn push_script(&self, reads: impl IntoIterator<Item = ScriptedRead>) {
        lock(&self.state).script.extend(reads);
    }

    /// Make the next `count` calls to `open_stream` fail.
    pub fn fail_next_opens(&self, count: u32) {
        lock(&self.state).fail_opens = count;
    }

    pub fn stats(&self) -> DeviceStats {
        lock(&self.state).stats.clone()
    }
}

impl Device for SyntheticDevice {
    fn label(&self) -> String {
        format!("synthetic ({})", self.config.native_format)
    }

    fn set_sample_rate(&self, _channel: usize, rate: u32) -> Result<()> {
        lock(&self.state).stats.sample_rate = rate;
        Ok(())
    }

    fn native_format(&self, _channel: usize) -> (String, f64) {
        (self.config.native_format.clone(), self.config.full_scale)
    }

    fn open_stream(&self, format: WireFormat, channels: &[usize]) -> Result<Box<dyn RxStream>> {
        let sample_rate = {
            let mut state = lock(&self.state);
            if state.fail_opens > 0 {
                state.fail_opens -= 1;
                return Err(Error::Hardware("synthetic setupStream failed".to_string()));
            }
            state.stats.streams_opened += 1;
            state.stats.channel_counts.push(channels.len());
            state.stats.formats.push(format);
            state.stats.sample_rate
        };

        let noise = if self.config.noise > 0.0 {
            Normal::new(0.0, self.config.noise).ok()
        } else {
            None
        };

        Ok(Box::new(SyntheticStream {
            state: self.state.clone(),
            format,
            tones: channels
                .iter()
                .map(|&c| self.config.tones.get(c).copied().unwrap_or_default())
                .collect(),
            phases: vec![0.0; channels.len()],
            sample_rate: if sample_rate == 0 { DEFAULT_SAMP_RATE } else { sample_rate },
            mtu: self.config.mtu,
            realtime: self.config.realtime,
            max_reads: self.config.max_reads,
            idle_sleep: self.config.idle_sleep,
            rng: StdRng::seed_from_u64(self.config.seed),
            noise,
            reads_served: 0,
            fatal_seen: false,
        }))
    }
}

struct SyntheticStream {
    state: Arc<Mutex<DeviceState>>,
    format: WireFormat,
    tones: Vec<Tone>,
    phases: Vec<f64>,
    sample_rate: u32,
    mtu: usize,
    realtime: bool,
    max_reads: Option<u64>,
    idle_sleep: Duration,
    rng: StdRng,
    noise: Option<Normal<f64>>,
    reads_served: u64,
    fatal_seen: bool,
}

impl SyntheticStream {
    /// Largest wire value of one scalar.
    fn peak(&self) -> f64 {
        match self.format {
            WireFormat::Cf32 => 1.0,
            f => f.full_scale() - 1.0,
        }
    }

    fn skip(&mut self, n: usize) {
        for (phase, tone) in self.phases.iter_mut().zip(&self.tones) {
            *phase = (*phase + TAU * tone.freq * n as f64 / self.sample_rate as f64) % TAU;
        }
    }

    fn fill(&mut self, buffers: &mut [WireBuffer], n: usize) {
        let peak = self.peak();
        let step_scale = TAU / self.sample_rate as f64;

        for (ch, buffer) in buffers.iter_mut().enumerate().take(self.tones.len()) {
            let tone = self.tones[ch];
            let step = step_scale * tone.freq;
            let mut phase = self.phases[ch];

            for k in 0..n {
                let (sin, cos) = phase.sin_cos();
                let mut i = tone.amplitude * cos;
                let mut q = tone.amplitude * sin;
                if let Some(noise) = &self.noise {
                    i += noise.sample(&mut self.rng);
                    q += noise.sample(&mut self.rng);
                }
                let (i, q) = ((i * peak).clamp(-peak, peak), (q * peak).clamp(-peak, peak));

                match buffer {
                    WireBuffer::I8(b) => {
                        b[2 * k] = i.round() as i8;
                        b[2 * k + 1] = q.round() as i8;
                    }
                    WireBuffer::I16(b) => {
                        b[2 * k] = i.round() as i16;
                        b[2 * k + 1] = q.round() as i16;
                    }
                    WireBuffer::F32(b) => {
                        b[2 * k] = i as f32;
                        b[2 * k + 1] = q as f32;
                    }
                }
                phase += step;
            }
            self.phases[ch] = phase % TAU;
        }
    }

    fn idle(&self, timeout: Duration) -> ReadStatus {
        std::thread::sleep(self.idle_sleep.min(timeout));
        ReadStatus::Timeout
    }
}

impl RxStream for SyntheticStream {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn activate(&mut self) -> Result<()> {
        Ok(())
    }

    fn deactivate(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(
        &mut self,
        buffers: &mut [WireBuffer],
        max_samples: usize,
        timeout: Duration,
    ) -> ReadStatus {
        let scripted = {
            let mut state = lock(&self.state);
            state.stats.reads += 1;
            if self.fatal_seen {
                state.stats.reads_after_fatal += 1;
            }
            state.script.pop_front()
        };

        let capacity = buffers.iter().map(WireBuffer::capacity).min().unwrap_or(0);
        let n = max_samples.min(self.mtu).min(capacity);

        match scripted {
            Some(ScriptedRead::Timeout) => return self.idle(timeout),
            Some(ScriptedRead::Fatal(code)) => {
                self.fatal_seen = true;
                return ReadStatus::Fatal(code);
            }
            Some(ScriptedRead::Overflow) => {
                // one block lost upstream, the next one lands in the buffers
                self.skip(n);
                self.fill(buffers, n);
                return ReadStatus::Overflow;
            }
            None => {}
        }

        if self.max_reads.is_some_and(|max| self.reads_served >= max) {
            return self.idle(timeout);
        }

        self.fill(buffers, n);
        self.reads_served += 1;

        if self.realtime {
            std::thread::sleep(Duration::from_secs_f64(n as f64 / self.sample_rate as f64));
        }

        ReadStatus::Samples(n)
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        lock(&self.state).stats.streams_closed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_generation() {
        let dev = SyntheticDevice::new(SyntheticConfig {
            tones: vec![Tone { freq: 256_000.0, amplitude: 0.5 }],
            ..Default::default()
        });
        let mut stream = dev.open_stream(WireFormat::Cs16, &[0]).expect("stream");
        let mut buffers = vec![WireBuffer::new(WireFormat::Cs16, stream.mtu())];

        let status = stream.read(&mut buffers, 4096, Duration::from_millis(10));
        assert_eq!(status, ReadStatus::Samples(4096));
        let WireBuffer::I16(b) = &buffers[0] else {
            panic!("wrong buffer type");
        };
        // fs/4 tone: 1, j, -1, -j
        assert_eq!(&b[..8], &[16384, 0, 0, 16384, -16384, 0, 0, -16384]);
    }

    #[test]
    fn test_script_and_stats() {
        let dev = SyntheticDevice::new(SyntheticConfig {
            max_reads: Some(1),
            ..Default::default()
        });
        dev.push_script([ScriptedRead::Timeout, ScriptedRead::Fatal(-2)]);

        {
            let mut stream = dev.open_stream(WireFormat::Cs16, &[0, 1]).expect("stream");
            let mut buffers = vec![WireBuffer::new(WireFormat::Cs16, 16); 2];
            let t = Duration::from_millis(5);
            assert_eq!(stream.read(&mut buffers, 16, t), ReadStatus::Timeout);
            assert_eq!(stream.read(&mut buffers, 16, t), ReadStatus::Fatal(-2));
            assert_eq!(stream.read(&mut buffers, 16, t), ReadStatus::Samples(16));
            assert_eq!(stream.read(&mut buffers, 16, t), ReadStatus::Timeout);
        }

        let stats = dev.stats();
        assert_eq!(stats.streams_opened, 1);
        assert_eq!(stats.streams_closed, 1);
        assert_eq!(stats.channel_counts, vec![2]);
        assert_eq!(stats.reads, 4);
        assert_eq!(stats.reads_after_fatal, 2);
    }

    #[test]
    fn test_fail_open() {
        let dev = SyntheticDevice::new(SyntheticConfig::default());
        dev.fail_next_opens(1);
        assert!(dev.open_stream(WireFormat::Cs8, &[0]).is_err());
        assert_eq!(dev.stats().streams_opened, 0);
        assert!(dev.open_stream(WireFormat::Cs8, &[0]).is_ok());
    }
}
