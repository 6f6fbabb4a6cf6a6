//! Acquisition thread: one blocking read loop per physical device feeding
//! every channel slot from the same hardware read.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::codec::{ScalarOrder, WireBuffer, WireFormat, WireSlice};
use crate::config::AcquisitionConfig;
use crate::decimators::{ChannelDecimator, Placement};
use crate::fifo::SampleFifo;
use crate::hardware::{Device, ReadStatus, RxStream, err_to_str};
use crate::sample::Sample;
use crate::utils::lock;
use crate::{Error, MAX_LOG2_DECIM, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// What a consumer asks of one channel: where its output goes, how much
/// rate reduction and which part of the spectrum to keep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    pub fifo: Option<SampleFifo>,
    pub log2_decim: u32,
    pub placement: Placement,
}

impl ChannelConfig {
    pub fn is_active(&self) -> bool {
        self.fifo.is_some()
    }
}

/// Per-channel state owned by the running thread.
pub struct ChannelSlot {
    config: ChannelConfig,
    decimator: Option<ChannelDecimator>,
    output: Vec<Sample>,
    seq: u64,
    discontinuity: bool,
}

impl ChannelSlot {
    pub fn new(config: ChannelConfig, format: WireFormat, order: ScalarOrder) -> Self {
        let mut slot = Self {
            config: ChannelConfig::default(),
            decimator: None,
            output: Vec::new(),
            seq: 0,
            discontinuity: true,
        };
        slot.configure(config, format, order);
        slot
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Apply a new configuration. The decimator is rebuilt, losing its delay
    /// lines, only if the rate, the placement or the consumer changed.
    pub fn configure(&mut self, config: ChannelConfig, format: WireFormat, order: ScalarOrder) {
        let rebuild = self.decimator.is_none()
            || config.log2_decim != self.config.log2_decim
            || config.placement != self.config.placement;
        let new_consumer = config.fifo != self.config.fifo;

        if rebuild {
            self.decimator = match ChannelDecimator::new(
                format,
                config.log2_decim,
                config.placement,
                order,
            ) {
                Ok(d) => Some(d),
                Err(e) => {
                    log::error!("{}, channel output disabled", e);
                    None
                }
            };
        } else if new_consumer {
            if let Some(d) = self.decimator.as_mut() {
                d.reset();
            }
        }

        if rebuild || new_consumer {
            self.seq = 0;
            self.discontinuity = true;
        }
        self.config = config;
    }

    /// Rebuild the decimator from scratch, e.g. after a scalar order change.
    pub fn rebuild(&mut self, format: WireFormat, order: ScalarOrder) {
        self.decimator = None;
        self.configure(self.config.clone(), format, order);
    }

    /// Flag the next delivered block as following a gap.
    pub fn mark_discontinuity(&mut self) {
        self.discontinuity = true;
    }

    /// Decimate one read's worth of this channel and hand it to the
    /// destination, if any. Returns the number of output samples produced.
    pub fn dispatch(&mut self, input: WireSlice<'_>) -> usize {
        let Some(decimator) = self.decimator.as_mut() else {
            return 0;
        };
        self.output.clear();
        let n = decimator.decimate(input, &mut self.output);

        if n == 0 {
            return 0;
        }
        if let Some(fifo) = &self.config.fifo {
            if !fifo.write(self.seq, self.discontinuity, &self.output) {
                log::debug!("destination reader gone, block discarded");
            }
            self.seq += 1;
            self.discontinuity = false;
        }
        n
    }
}

/// Counters maintained by the read loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub reads: u64,
    pub timeouts: u64,
    pub overflows: u64,
    pub fatal_errors: u64,
    /// Samples per channel received from hardware.
    pub samples: u64,
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    timeouts: AtomicU64,
    overflows: AtomicU64,
    fatal_errors: AtomicU64,
    samples: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RunStats {
        RunStats {
            reads: self.reads.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
        }
    }
}

struct Settings {
    channels: Vec<ChannelConfig>,
    order: ScalarOrder,
    sample_rate: u32,
}

/// State shared between the controlling object and the worker.
struct Control {
    state: Mutex<ThreadState>,
    cond: Condvar,
    stop: AtomicBool,
    settings: Mutex<Settings>,
    generation: AtomicU64,
    start_error: Mutex<Option<Error>>,
    counters: Counters,
}

impl Control {
    fn set_state(&self, state: ThreadState) {
        *lock(&self.state) = state;
        self.cond.notify_all();
    }

    fn update<F: FnOnce(&mut Settings)>(&self, f: F) {
        f(&mut lock(&self.settings));
        self.generation.fetch_add(1, Ordering::Release);
    }
}

/// Owner of the hardware stream and of the channel slots of one device.
pub struct AcquisitionThread {
    device: Arc<dyn Device>,
    config: AcquisitionConfig,
    control: Arc<Control>,
    nb_channels: usize,
    handle: Option<JoinHandle<()>>,
}

impl AcquisitionThread {
    pub fn new(device: Arc<dyn Device>, nb_channels: usize, config: AcquisitionConfig) -> Self {
        let control = Control {
            state: Mutex::new(ThreadState::Idle),
            cond: Condvar::new(),
            stop: AtomicBool::new(false),
            settings: Mutex::new(Settings {
                channels: vec![ChannelConfig::default(); nb_channels],
                order: ScalarOrder::default(),
                sample_rate: config.sample_rate,
            }),
            generation: AtomicU64::new(0),
            start_error: Mutex::new(None),
            counters: Counters::default(),
        };

        Self {
            device,
            config,
            control: Arc::new(control),
            nb_channels,
            handle: None,
        }
    }

    pub fn nb_channels(&self) -> usize {
        self.nb_channels
    }

    pub fn state(&self) -> ThreadState {
        *lock(&self.control.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == ThreadState::Running
    }

    pub fn stats(&self) -> RunStats {
        self.control.counters.snapshot()
    }

    fn check_index(&self, channel: usize) -> Result<()> {
        if channel < self.nb_channels {
            Ok(())
        } else {
            Err(Error::ChannelOutOfRange {
                index: channel,
                count: self.nb_channels,
            })
        }
    }

    pub fn set_channel_decimation(&self, channel: usize, log2_decim: u32) -> Result<()> {
        self.check_index(channel)?;
        if log2_decim > MAX_LOG2_DECIM {
            return Err(Error::InvalidDecimation(log2_decim));
        }
        self.control
            .update(|s| s.channels[channel].log2_decim = log2_decim);
        Ok(())
    }

    pub fn set_channel_placement(&self, channel: usize, placement: Placement) -> Result<()> {
        self.check_index(channel)?;
        self.control
            .update(|s| s.channels[channel].placement = placement);
        Ok(())
    }

    /// Attach or park (`None`) the destination of a channel.
    pub fn set_channel_destination(&self, channel: usize, fifo: Option<SampleFifo>) -> Result<()> {
        self.check_index(channel)?;
        self.control.update(|s| s.channels[channel].fifo = fifo);
        Ok(())
    }

    /// Replace a whole channel configuration at once.
    pub fn set_channel_config(&self, channel: usize, config: ChannelConfig) -> Result<()> {
        self.check_index(channel)?;
        if config.log2_decim > MAX_LOG2_DECIM {
            return Err(Error::InvalidDecimation(config.log2_decim));
        }
        self.control.update(|s| s.channels[channel] = config);
        Ok(())
    }

    /// Takes effect at the next start.
    pub fn set_sample_rate(&self, rate: u32) {
        lock(&self.control.settings).sample_rate = rate;
    }

    pub fn sample_rate(&self) -> u32 {
        lock(&self.control.settings).sample_rate
    }

    pub fn set_byte_order(&self, order: ScalarOrder) {
        self.control.update(|s| s.order = order);
    }

    pub fn byte_order(&self) -> ScalarOrder {
        lock(&self.control.settings).order
    }

    pub fn channel_config(&self, channel: usize) -> Option<ChannelConfig> {
        lock(&self.control.settings).channels.get(channel).cloned()
    }

    pub fn channel_configs(&self) -> Vec<ChannelConfig> {
        lock(&self.control.settings).channels.clone()
    }

    pub fn highest_active_channel(&self) -> Option<usize> {
        lock(&self.control.settings)
            .channels
            .iter()
            .rposition(ChannelConfig::is_active)
    }

    /// Spawn the read loop and wait until it is running.
    ///
    /// Does nothing if the thread is already running. A worker still winding
    /// down after a fatal read is joined first. Fails if no channel has a
    /// destination or if the stream cannot be set up.
    pub fn start_work(&mut self) -> Result<()> {
        if self.state() == ThreadState::Running {
            return Ok(());
        }
        self.join();

        if self.highest_active_channel().is_none() {
            return Err(Error::NoActiveChannel);
        }

        self.control.stop.store(false, Ordering::Release);
        *lock(&self.control.start_error) = None;
        self.control.set_state(ThreadState::Starting);

        let device = self.device.clone();
        let control = self.control.clone();
        let config = self.config.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("rx {}", self.device.label()))
            .spawn(move || run(device, control, config));

        match spawned {
            Ok(h) => self.handle = Some(h),
            Err(e) => {
                self.control.set_state(ThreadState::Idle);
                return Err(e.into());
            }
        }

        let mut state = lock(&self.control.state);
        while *state == ThreadState::Starting {
            state = self
                .control
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(state);

        let start_error = lock(&self.control.start_error).take();
        if let Some(e) = start_error {
            self.join();
            return Err(e);
        }
        Ok(())
    }

    /// Ask the read loop to stop and wait for the worker to exit. Does
    /// nothing when idle.
    pub fn stop_work(&mut self) {
        if self.handle.is_none() {
            return;
        }
        self.control.stop.store(true, Ordering::Release);
        self.join();
    }

    fn join(&mut self) {
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                log::error!("acquisition thread panicked");
            }
            self.control.set_state(ThreadState::Idle);
        }
    }
}

impl Drop for AcquisitionThread {
    fn drop(&mut self) {
        self.stop_work();
    }
}

struct Armed {
    stream: Box<dyn RxStream>,
    buffers: Vec<WireBuffer>,
    slots: Vec<ChannelSlot>,
    format: WireFormat,
    order: ScalarOrder,
    mtu: usize,
    sample_rate: u32,
    generation: u64,
}

fn arm(device: &dyn Device, control: &Control, config: &AcquisitionConfig) -> Result<Armed> {
    let generation = control.generation.load(Ordering::Acquire);
    let (channels, order, sample_rate) = {
        let s = lock(&control.settings);
        (s.channels.clone(), s.order, s.sample_rate)
    };

    for channel in 0..channels.len() {
        device.set_sample_rate(channel, sample_rate)?;
    }

    let (native, full_scale) = device.native_format(0);
    let format = WireFormat::from_native(&native, full_scale);
    log::info!(
        "{}: native format {} full scale {} -> {}",
        device.label(),
        native,
        full_scale,
        format.stream_format()
    );

    let indices: Vec<usize> = (0..channels.len()).collect();
    let mut stream = device.open_stream(format, &indices)?;
    let mtu = match stream.mtu() {
        0 => config.fallback_mtu,
        n => n,
    };
    log::debug!(
        "{} channels, MTU {} samples, {} bytes per element",
        channels.len(),
        mtu,
        format.element_size()
    );

    let buffers = vec![WireBuffer::new(format, mtu); channels.len()];
    let slots = channels
        .into_iter()
        .map(|c| ChannelSlot::new(c, format, order))
        .collect();

    stream.activate()?;

    Ok(Armed {
        stream,
        buffers,
        slots,
        format,
        order,
        mtu,
        sample_rate,
        generation,
    })
}

fn resync(control: &Control, armed: &mut Armed) {
    let generation = control.generation.load(Ordering::Acquire);
    if generation == armed.generation {
        return;
    }
    armed.generation = generation;

    let s = lock(&control.settings);
    let reorder = s.order != armed.order;
    armed.order = s.order;
    for (slot, config) in armed.slots.iter_mut().zip(&s.channels) {
        if slot.config() != config {
            slot.configure(config.clone(), armed.format, armed.order);
        }
        if reorder {
            slot.rebuild(armed.format, armed.order);
        }
    }
}

fn dispatch(armed: &mut Armed, n: usize) {
    for (slot, buffer) in armed.slots.iter_mut().zip(&armed.buffers) {
        slot.dispatch(buffer.slice(n));
    }
}

fn run(device: Arc<dyn Device>, control: Arc<Control>, config: AcquisitionConfig) {
    let mut armed = match arm(device.as_ref(), &control, &config) {
        Ok(a) => a,
        Err(e) => {
            log::error!("{}: failed to start stream: {}", device.label(), e);
            *lock(&control.start_error) = Some(e);
            control.set_state(ThreadState::Idle);
            return;
        }
    };

    let timeout = config.read_timeout(armed.mtu, armed.sample_rate);
    log::debug!("read timeout {:?}", timeout);
    log::info!(
        "{}: streaming {} channels at {} S/s",
        device.label(),
        armed.slots.len(),
        armed.sample_rate
    );
    control.set_state(ThreadState::Running);

    let counters = &control.counters;
    while !control.stop.load(Ordering::Acquire) {
        resync(&control, &mut armed);

        let status = armed.stream.read(&mut armed.buffers, armed.mtu, timeout);
        Counters::bump(&counters.reads, 1);

        match status {
            ReadStatus::Samples(n) => {
                Counters::bump(&counters.samples, n as u64);
                dispatch(&mut armed, n);
            }
            ReadStatus::Timeout => {
                Counters::bump(&counters.timeouts, 1);
                log::warn!("readStream timeout");
            }
            ReadStatus::Overflow => {
                Counters::bump(&counters.overflows, 1);
                log::warn!("readStream overflow");
                armed.slots.iter_mut().for_each(ChannelSlot::mark_discontinuity);
                let n = armed.mtu;
                Counters::bump(&counters.samples, n as u64);
                dispatch(&mut armed, n);
            }
            ReadStatus::Fatal(code) => {
                Counters::bump(&counters.fatal_errors, 1);
                log::error!("readStream failed: {} ({})", err_to_str(code), code);
                break;
            }
        }
    }

    control.set_state(ThreadState::Stopping);
    if let Err(e) = armed.stream.deactivate() {
        log::error!("{}: failed to deactivate stream: {}", device.label(), e);
    }
    drop(armed);
    log::info!("{}: stream closed", device.label());
    control.set_state(ThreadState::Idle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::sample_fifo;
    use crate::synthetic::{ScriptedRead, SyntheticConfig, SyntheticDevice};

    #[test]
    fn test_slot_without_destination_discards() {
        let mut slot = ChannelSlot::new(ChannelConfig::default(), WireFormat::Cs16, ScalarOrder::Iq);
        let wire = vec![100i16; 64];
        assert_eq!(slot.dispatch(WireSlice::I16(&wire)), 32);
    }

    #[test]
    fn test_slot_sequence_and_discontinuity() {
        let (fifo, reader) = sample_fifo(8);
        let config = ChannelConfig {
            fifo: Some(fifo),
            log2_decim: 1,
            placement: Placement::Center,
        };
        let mut slot = ChannelSlot::new(config.clone(), WireFormat::Cs8, ScalarOrder::Iq);
        let wire = vec![1i8; 128];
        assert_eq!(slot.dispatch(WireSlice::I8(&wire)), 32);
        assert_eq!(slot.dispatch(WireSlice::I8(&wire)), 32);
        slot.mark_discontinuity();
        slot.dispatch(WireSlice::I8(&wire));

        let blocks = reader.drain();
        let flags: Vec<(u64, bool)> = blocks.iter().map(|b| (b.seq, b.discontinuity)).collect();
        assert_eq!(flags, vec![(0, true), (1, false), (2, true)]);

        // same settings, same decimator
        slot.configure(config, WireFormat::Cs8, ScalarOrder::Iq);
        slot.dispatch(WireSlice::I8(&wire));
        assert_eq!(reader.try_recv().map(|b| b.seq), Some(3));
    }

    #[test]
    fn test_setters_validate() {
        let dev = Arc::new(SyntheticDevice::new(SyntheticConfig::default()));
        let thread = AcquisitionThread::new(dev, 2, AcquisitionConfig::default());
        assert!(matches!(
            thread.set_channel_decimation(2, 1),
            Err(Error::ChannelOutOfRange { index: 2, count: 2 })
        ));
        assert!(matches!(
            thread.set_channel_decimation(0, 7),
            Err(Error::InvalidDecimation(7))
        ));
        thread.set_channel_placement(1, Placement::Supra).expect("placement");
        assert_eq!(
            thread.channel_config(1).map(|c| c.placement),
            Some(Placement::Supra)
        );
        assert_eq!(thread.highest_active_channel(), None);
    }

    #[test]
    fn test_start_without_destination_fails() {
        let dev = Arc::new(SyntheticDevice::new(SyntheticConfig::default()));
        let mut thread = AcquisitionThread::new(dev.clone(), 1, AcquisitionConfig::default());
        assert!(matches!(thread.start_work(), Err(Error::NoActiveChannel)));
        assert_eq!(dev.stats().streams_opened, 0);
        assert_eq!(thread.state(), ThreadState::Idle);
    }

    #[test]
    fn test_start_failure_reported() {
        let dev = Arc::new(SyntheticDevice::new(SyntheticConfig::default()));
        dev.fail_next_opens(1);
        let mut thread = AcquisitionThread::new(dev, 1, AcquisitionConfig::default());
        let (fifo, _reader) = sample_fifo(4);
        thread.set_channel_destination(0, Some(fifo)).expect("destination");
        assert!(matches!(thread.start_work(), Err(Error::Hardware(_))));
        assert!(!thread.is_running());
    }

    #[test]
    fn test_restart_after_fatal_read() {
        let dev = Arc::new(SyntheticDevice::new(SyntheticConfig::default()));
        dev.push_script([ScriptedRead::Fatal(-1)]);
        let mut thread = AcquisitionThread::new(dev.clone(), 1, AcquisitionConfig::default());
        let (fifo, _reader) = sample_fifo(4);
        thread.set_channel_destination(0, Some(fifo)).expect("destination");
        thread.start_work().expect("start");

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while thread.stats().fatal_errors == 0 && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(thread.stats().fatal_errors, 1);

        // the worker may still be winding down here
        thread.start_work().expect("restart");
        assert!(thread.is_running());
        assert_eq!(dev.stats().streams_opened, 2);
        thread.stop_work();
        assert_eq!(dev.stats().streams_closed, 2);
    }
}
