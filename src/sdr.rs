//! Device broker: hands out channels of one physical receiver to logical
//! consumers and keeps the acquisition thread sized to the highest channel
//! in use.
//!
//! The thread of record lives in an [`OwnershipToken`] that names the
//! consumer currently responsible for it. Growing past the current channel
//! count, or releasing the top channel, reallocates the thread and carries
//! the configuration of every surviving slot across. Releasing any other
//! channel only parks its slot so that the channels above keep their
//! indices and their decimator state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::codec::ScalarOrder;
use crate::config::AcquisitionConfig;
use crate::decimators::{Placement, frequency_shift, output_rate};
use crate::fifo::{FifoReader, SampleFifo, sample_fifo};
use crate::hardware::Device;
use crate::pipeline::{AcquisitionThread, ChannelConfig, RunStats};
use crate::utils::lock;
use crate::{Error, MAX_LOG2_DECIM, Result};

pub type ConsumerId = u64;

/// The acquisition thread of a device together with its current owner.
pub struct OwnershipToken {
    thread: AcquisitionThread,
    owner: ConsumerId,
}

impl OwnershipToken {
    pub fn owner(&self) -> ConsumerId {
        self.owner
    }

    pub fn thread(&self) -> &AcquisitionThread {
        &self.thread
    }
}

struct BrokerInner {
    token: Option<OwnershipToken>,
    consumers: HashMap<ConsumerId, usize>,
    next_id: ConsumerId,
    sample_rate: u32,
    order: ScalarOrder,
}

pub struct DeviceBroker {
    device: Arc<dyn Device>,
    config: AcquisitionConfig,
    inner: Mutex<BrokerInner>,
}

impl DeviceBroker {
    pub fn new(device: Arc<dyn Device>, config: AcquisitionConfig) -> Arc<Self> {
        let inner = BrokerInner {
            token: None,
            consumers: HashMap::new(),
            next_id: 1,
            sample_rate: config.sample_rate,
            order: ScalarOrder::default(),
        };
        Arc::new(Self {
            device,
            config,
            inner: Mutex::new(inner),
        })
    }

    /// Register a consumer for `channel`. The channel does not stream until
    /// [`RxConsumer::start`] is called.
    pub fn attach(self: &Arc<Self>, channel: usize) -> Result<RxConsumer> {
        let mut inner = lock(&self.inner);
        if inner.consumers.values().any(|&c| c == channel) {
            return Err(Error::ChannelInUse(channel));
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.consumers.insert(id, channel);
        drop(inner);

        let (fifo, reader) = sample_fifo(self.config.fifo_depth);
        log::debug!("consumer {} attached to channel {}", id, channel);

        Ok(RxConsumer {
            broker: self.clone(),
            id,
            channel,
            fifo,
            reader,
            log2_decim: 0,
            placement: Placement::Center,
            streaming: false,
        })
    }

    /// Forget consumer `id`. If it owned the thread of record, ownership
    /// moves to the consumer of the lowest channel still streaming.
    fn detach(&self, id: ConsumerId) {
        let mut inner = lock(&self.inner);
        inner.consumers.remove(&id);
        let BrokerInner {
            token, consumers, ..
        } = &mut *inner;
        let Some(token) = token.as_mut().filter(|t| t.owner == id) else {
            return;
        };

        let buddy = consumers
            .iter()
            .filter(|&(_, &channel)| {
                token
                    .thread
                    .channel_config(channel)
                    .is_some_and(|c| c.is_active())
            })
            .min_by_key(|&(_, &channel)| channel)
            .map(|(&buddy, _)| buddy);

        match buddy {
            Some(buddy) => {
                token.owner = buddy;
                log::info!(
                    "{}: owner {} detached, thread moved to consumer {}",
                    self.device.label(),
                    id,
                    buddy
                );
            }
            None => log::warn!(
                "{}: owner {} detached with no streaming consumer left",
                self.device.label(),
                id
            ),
        }
    }

    fn new_thread(&self, inner: &BrokerInner, nb_channels: usize) -> AcquisitionThread {
        let thread = AcquisitionThread::new(self.device.clone(), nb_channels, self.config.clone());
        thread.set_sample_rate(inner.sample_rate);
        thread.set_byte_order(inner.order);
        thread
    }

    /// Build a thread of `nb_channels` slots from `configs` and start it.
    /// Nothing is installed on failure.
    fn reallocate(
        &self,
        inner: &BrokerInner,
        nb_channels: usize,
        configs: Vec<ChannelConfig>,
    ) -> Result<AcquisitionThread> {
        let mut thread = self.new_thread(inner, nb_channels);
        for (channel, config) in configs.into_iter().take(nb_channels).enumerate() {
            thread.set_channel_config(channel, config)?;
        }
        thread.start_work()?;
        Ok(thread)
    }

    /// Swap the thread of record for a freshly started one of
    /// `nb_channels` slots. If the new thread cannot start, the previous one
    /// is put back as it was.
    fn replace(
        &self,
        inner: &mut BrokerInner,
        owner: ConsumerId,
        nb_channels: usize,
        configs: Vec<ChannelConfig>,
    ) -> Result<()> {
        let mut old = inner.token.take();
        let was_running = old.as_ref().is_some_and(|t| t.thread.is_running());
        if let Some(t) = old.as_mut() {
            t.thread.stop_work();
        }

        match self.reallocate(inner, nb_channels, configs) {
            Ok(thread) => {
                log::info!(
                    "{}: acquisition thread sized {} -> {} channels, owner {}",
                    self.device.label(),
                    old.as_ref().map_or(0, |t| t.thread.nb_channels()),
                    nb_channels,
                    owner
                );
                inner.token = Some(OwnershipToken { thread, owner });
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "{}: cannot allocate {} channels: {}",
                    self.device.label(),
                    nb_channels,
                    e
                );
                if let Some(t) = old.as_mut().filter(|_| was_running) {
                    if let Err(e) = t.thread.start_work() {
                        log::error!("{}: cannot restart previous thread: {}", self.device.label(), e);
                    }
                }
                inner.token = old;
                Err(Error::Refused(Box::new(e)))
            }
        }
    }

    fn start_channel(&self, id: ConsumerId, channel: usize, config: ChannelConfig) -> Result<()> {
        let mut inner = lock(&self.inner);

        let Some(token) = inner.token.as_mut() else {
            let mut configs = vec![ChannelConfig::default(); channel + 1];
            configs[channel] = config;
            return self.replace(&mut inner, id, channel + 1, configs);
        };

        if channel >= token.thread.nb_channels() {
            let mut configs = token.thread.channel_configs();
            configs.resize(channel + 1, ChannelConfig::default());
            configs[channel] = config;
            return self.replace(&mut inner, id, channel + 1, configs);
        }

        token.thread.set_channel_config(channel, config)?;
        if let Err(e) = token.thread.start_work() {
            token.thread.set_channel_destination(channel, None)?;
            return Err(Error::Refused(Box::new(e)));
        }
        log::info!("{}: channel {} started by consumer {}", self.device.label(), channel, id);
        Ok(())
    }

    fn stop_channel(&self, id: ConsumerId, channel: usize) -> Result<()> {
        let mut inner = lock(&self.inner);
        let Some(token) = inner.token.as_mut() else {
            return Ok(());
        };
        let nb_channels = token.thread.nb_channels();
        if channel >= nb_channels {
            return Ok(());
        }

        token.thread.set_channel_destination(channel, None)?;
        log::info!("{}: channel {} stopped by consumer {}", self.device.label(), channel, id);

        match token.thread.highest_active_channel() {
            None => {
                token.thread.stop_work();
                inner.token = None;
                log::info!("{}: no active channel left, thread released", self.device.label());
                Ok(())
            }
            Some(highest) if channel > highest => {
                let configs = token.thread.channel_configs();
                let owner = token.owner;
                self.replace(&mut inner, owner, highest + 1, configs)
            }
            // lower channels are parked, the hardware keeps streaming them
            Some(_) => Ok(()),
        }
    }

    /// Hand the thread of record from one consumer to another. The thread
    /// is stopped for the hand-off and restarted if it was running.
    pub fn transfer_ownership(&self, from: ConsumerId, to: ConsumerId) -> Result<()> {
        let mut inner = lock(&self.inner);
        if !inner.consumers.contains_key(&to) {
            return Err(Error::UnknownConsumer(to));
        }
        let token = match inner.token.as_mut() {
            Some(t) if t.owner == from => t,
            _ => return Err(Error::NotOwner(from)),
        };

        let was_running = token.thread.is_running();
        token.thread.stop_work();
        token.owner = to;
        log::info!("{}: thread ownership {} -> {}", self.device.label(), from, to);
        if was_running {
            token.thread.start_work().map_err(|e| Error::Refused(Box::new(e)))?;
        }
        Ok(())
    }

    pub fn owner(&self) -> Option<ConsumerId> {
        lock(&self.inner).token.as_ref().map(OwnershipToken::owner)
    }

    /// Hardware channel count of the current thread, zero without one.
    pub fn nb_channels(&self) -> usize {
        lock(&self.inner)
            .token
            .as_ref()
            .map_or(0, |t| t.thread.nb_channels())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner)
            .token
            .as_ref()
            .is_some_and(|t| t.thread.is_running())
    }

    pub fn channel_config(&self, channel: usize) -> Option<ChannelConfig> {
        lock(&self.inner)
            .token
            .as_ref()
            .and_then(|t| t.thread.channel_config(channel))
    }

    pub fn stats(&self) -> Option<RunStats> {
        lock(&self.inner).token.as_ref().map(|t| t.thread.stats())
    }

    /// Device sample rate, applied at the next (re)start.
    pub fn set_sample_rate(&self, rate: u32) {
        let mut inner = lock(&self.inner);
        inner.sample_rate = rate;
        if let Some(t) = &inner.token {
            t.thread.set_sample_rate(rate);
        }
    }

    pub fn sample_rate(&self) -> u32 {
        lock(&self.inner).sample_rate
    }

    pub fn set_byte_order(&self, order: ScalarOrder) {
        let mut inner = lock(&self.inner);
        inner.order = order;
        if let Some(t) = &inner.token {
            t.thread.set_byte_order(order);
        }
    }

    fn with_thread<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&AcquisitionThread) -> Result<()>,
    {
        match &lock(&self.inner).token {
            Some(t) => f(&t.thread),
            None => Ok(()),
        }
    }
}

/// A logical consumer of one channel of a shared device.
///
/// Dropping the consumer stops its channel and releases it.
pub struct RxConsumer {
    broker: Arc<DeviceBroker>,
    id: ConsumerId,
    channel: usize,
    fifo: SampleFifo,
    reader: FifoReader,
    log2_decim: u32,
    placement: Placement,
    streaming: bool,
}

impl RxConsumer {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Writer half handed to the acquisition thread when streaming.
    pub fn destination(&self) -> &SampleFifo {
        &self.fifo
    }

    pub fn reader(&self) -> &FifoReader {
        &self.reader
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn log2_decim(&self) -> u32 {
        self.log2_decim
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            fifo: Some(self.fifo.clone()),
            log2_decim: self.log2_decim,
            placement: self.placement,
        }
    }

    /// Begin streaming this channel. Does nothing if already streaming.
    pub fn start(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        self.broker
            .start_channel(self.id, self.channel, self.channel_config())?;
        self.streaming = true;
        Ok(())
    }

    /// Stop streaming this channel. Does nothing if not streaming.
    pub fn stop(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        self.streaming = false;
        self.broker.stop_channel(self.id, self.channel)
    }

    pub fn set_log2_decimation(&mut self, log2_decim: u32) -> Result<()> {
        if log2_decim > MAX_LOG2_DECIM {
            return Err(Error::InvalidDecimation(log2_decim));
        }
        self.log2_decim = log2_decim;
        if self.streaming {
            let channel = self.channel;
            self.broker
                .with_thread(|t| t.set_channel_decimation(channel, log2_decim))?;
        }
        Ok(())
    }

    pub fn set_placement(&mut self, placement: Placement) -> Result<()> {
        self.placement = placement;
        if self.streaming {
            let channel = self.channel;
            self.broker
                .with_thread(|t| t.set_channel_placement(channel, placement))?;
        }
        Ok(())
    }

    /// Offset of this channel's band from the hardware centre frequency.
    pub fn frequency_shift(&self) -> i64 {
        frequency_shift(self.log2_decim, self.placement, self.broker.sample_rate())
    }

    pub fn output_rate(&self) -> u32 {
        output_rate(self.broker.sample_rate(), self.log2_decim)
    }
}

impl Drop for RxConsumer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("consumer {}: stop failed: {}", self.id, e);
        }
        self.broker.detach(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticConfig, SyntheticDevice};

    fn broker() -> (Arc<SyntheticDevice>, Arc<DeviceBroker>) {
        let dev = Arc::new(SyntheticDevice::new(SyntheticConfig {
            realtime: true,
            ..Default::default()
        }));
        let broker = DeviceBroker::new(dev.clone(), AcquisitionConfig::default());
        (dev, broker)
    }

    #[test]
    fn test_channel_in_use() {
        let (_dev, broker) = broker();
        let _a = broker.attach(1).expect("attach");
        assert!(matches!(broker.attach(1), Err(Error::ChannelInUse(1))));
    }

    #[test]
    fn test_first_start_owns_thread() {
        let (dev, broker) = broker();
        let mut a = broker.attach(1).expect("attach");
        assert_eq!(broker.owner(), None);
        a.start().expect("start");
        assert_eq!(broker.owner(), Some(a.id()));
        assert_eq!(broker.nb_channels(), 2);
        assert!(broker.is_running());
        assert_eq!(dev.stats().channel_counts, vec![2]);

        a.stop().expect("stop");
        assert_eq!(broker.nb_channels(), 0);
        assert_eq!(dev.stats().streams_closed, 1);
    }

    #[test]
    fn test_transfer_ownership() {
        let (dev, broker) = broker();
        let mut a = broker.attach(0).expect("attach");
        let b = broker.attach(1).expect("attach");
        a.start().expect("start");

        assert!(matches!(
            broker.transfer_ownership(b.id(), a.id()),
            Err(Error::NotOwner(_))
        ));
        assert!(matches!(
            broker.transfer_ownership(a.id(), 999),
            Err(Error::UnknownConsumer(999))
        ));
        broker.transfer_ownership(a.id(), b.id()).expect("transfer");
        assert_eq!(broker.owner(), Some(b.id()));
        assert!(broker.is_running());
        assert_eq!(dev.stats().streams_opened, 2);
    }

    #[test]
    fn test_refused_start_leaves_nothing_installed() {
        let (dev, broker) = broker();
        dev.fail_next_opens(1);
        let mut a = broker.attach(0).expect("attach");
        assert!(matches!(a.start(), Err(Error::Refused(_))));
        assert!(!a.is_streaming());
        assert_eq!(broker.nb_channels(), 0);
        assert_eq!(broker.owner(), None);
    }

    #[test]
    fn test_refused_grow_keeps_previous_thread() {
        let (dev, broker) = broker();
        let mut a = broker.attach(0).expect("attach");
        a.set_log2_decimation(2).expect("decim");
        a.start().expect("start");

        dev.fail_next_opens(1);
        let mut b = broker.attach(3).expect("attach");
        assert!(matches!(b.start(), Err(Error::Refused(_))));

        assert_eq!(broker.nb_channels(), 1);
        assert_eq!(broker.owner(), Some(a.id()));
        assert!(broker.is_running());
        assert_eq!(broker.channel_config(0).map(|c| c.log2_decim), Some(2));
    }

    #[test]
    fn test_dropped_owner_hands_thread_to_buddy() {
        let (_dev, broker) = broker();
        let mut a = broker.attach(0).expect("attach");
        let mut b = broker.attach(1).expect("attach");
        a.start().expect("start");
        b.start().expect("start");
        assert_eq!(broker.owner(), Some(b.id()));

        b.stop().expect("stop");
        assert_eq!(broker.nb_channels(), 1);
        drop(b);
        assert_eq!(broker.owner(), Some(a.id()));
        assert!(broker.is_running());

        let c = broker.attach(2).expect("attach");
        broker.transfer_ownership(a.id(), c.id()).expect("transfer");
        assert_eq!(broker.owner(), Some(c.id()));
    }

    #[test]
    fn test_refused_shrink_then_shrink_to_highest_active() {
        let (dev, broker) = broker();
        let mut consumers: Vec<RxConsumer> = (0..3)
            .map(|ch| broker.attach(ch).expect("attach"))
            .collect();
        for c in consumers.iter_mut() {
            c.start().expect("start");
        }
        assert_eq!(broker.nb_channels(), 3);

        dev.fail_next_opens(1);
        assert!(matches!(consumers[2].stop(), Err(Error::Refused(_))));
        assert_eq!(broker.nb_channels(), 3);
        assert!(broker.is_running());
        assert!(broker.channel_config(2).is_some_and(|c| c.fifo.is_none()));
        assert!(broker.channel_config(1).is_some_and(|c| c.is_active()));

        consumers[1].stop().expect("stop");
        assert_eq!(broker.nb_channels(), 1);
        assert!(broker.is_running());
    }

    #[test]
    fn test_consumer_frequency_helpers() {
        let (_dev, broker) = broker();
        let mut a = broker.attach(0).expect("attach");
        a.set_log2_decimation(3).expect("decim");
        a.set_placement(Placement::Infra).expect("placement");
        assert_eq!(a.frequency_shift(), -256_000);
        assert_eq!(a.output_rate(), 128_000);
        assert!(a.set_log2_decimation(7).is_err());
    }
}
