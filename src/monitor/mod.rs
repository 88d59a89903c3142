pub mod wait_set;

use crate::config::{MonitorConfig, MAX_READ_BATCH};
use crate::device::event::{decode_batch, RECORD_SIZE};
use crate::device::{DeviceBackend, DeviceHandle, DeviceRegistry};
use crate::notify::{NotifyChannel, RecordCursor};
use crate::sink::{EventSink, MonitorEvent};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use wait_set::{build_wait_set, WaitSource};

// Comfortably above one maximal record (header + NAME_MAX + 1)
const NOTIFY_BUF_LEN: usize = 4096;

/// What one pass through the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// Nothing to wait on; slept for the idle interval.
    Idle,
    /// The wait returned an error (usually EINTR).
    Interrupted,
    TimedOut,
    Dispatched { notify: bool, devices: usize },
}

/// Single-threaded multiplexer over the notification channel and every open
/// device. Owns the registry and the sink outright.
pub struct Monitor<B: DeviceBackend, S: EventSink> {
    registry: DeviceRegistry<B>,
    notify: Option<NotifyChannel>,
    sink: S,
    idle_retry: Duration,
    rescan_when_idle: bool,
    read_buf: Vec<u8>,
    notify_buf: Vec<u8>,
    idle: bool,
}

impl<B: DeviceBackend, S: EventSink> Monitor<B, S> {
    pub fn new(
        registry: DeviceRegistry<B>,
        notify: Option<NotifyChannel>,
        sink: S,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            registry,
            notify,
            sink,
            idle_retry: config.idle_retry(),
            rescan_when_idle: config.rescan_when_idle,
            read_buf: vec![0u8; config.read_batch.clamp(1, MAX_READ_BATCH) * RECORD_SIZE],
            notify_buf: vec![0u8; NOTIFY_BUF_LEN],
            idle: false,
        }
    }

    /// Initial scan, then the change watch, then one resync to cover the gap
    /// between the two. A watch that cannot be set up leaves the monitor
    /// running on the scan alone.
    pub fn start(config: &MonitorConfig, backend: B, sink: S) -> Self {
        let registry = DeviceRegistry::from_config(config, backend);
        let mut monitor = Self::new(registry, None, sink, config);

        match monitor.registry.scan(&mut monitor.sink) {
            Ok(count) => tracing::info!("Initial scan opened {} device(s)", count),
            Err(e) => tracing::warn!("Initial scan failed: {}", e),
        }

        match NotifyChannel::watch(&config.device_dir) {
            Ok(channel) => {
                monitor.notify = Some(channel);
                // Nodes created between the scan and the watch
                match monitor.registry.resync(&mut monitor.sink) {
                    Ok((0, _)) => {}
                    Ok((opened, _)) => tracing::info!("Picked up {} device(s) added during startup", opened),
                    Err(e) => tracing::debug!("Post-watch rescan failed: {}", e),
                }
            }
            Err(e) => tracing::warn!("{}; device hot-plug will not be tracked", e),
        }
        monitor
    }

    #[cfg(test)]
    pub fn registry(&self) -> &DeviceRegistry<B> {
        &self.registry
    }

    #[cfg(test)]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    #[cfg(test)]
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn has_notify_channel(&self) -> bool {
        self.notify.is_some()
    }

    pub fn run(&mut self) -> ! {
        tracing::info!(
            "Monitoring {:?} ({} device(s) open)",
            self.registry.dir(),
            self.registry.len()
        );
        if !self.has_notify_channel() {
            tracing::warn!("Running on the initial scan only");
        }
        loop {
            self.cycle(None);
        }
    }

    /// Rebuild the wait-set, wait, and dispatch whatever became ready.
    /// Channel records are always applied before any device is read.
    pub fn cycle(&mut self, timeout: Option<Duration>) -> Cycle {
        let notify_fd = self.notify.as_ref().map(AsRawFd::as_raw_fd);
        let mut wait_set = build_wait_set(notify_fd, &self.registry);

        if wait_set.is_empty() {
            self.idle_pass();
            return Cycle::Idle;
        }
        self.idle = false;
        tracing::trace!("Waiting on {} source(s)", wait_set.len());

        match wait_set.wait(timeout) {
            Ok(0) => return Cycle::TimedOut,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("poll interrupted: {}", e);
                return Cycle::Interrupted;
            }
        }

        let mut notify_ready = false;
        let mut ready_devices = Vec::new();
        for source in wait_set.ready() {
            match source {
                WaitSource::Notify => notify_ready = true,
                WaitSource::Device { fd, serial } => ready_devices.push((fd, serial)),
            }
        }

        if notify_ready {
            self.drain_notifications();
        }
        for &(fd, serial) in &ready_devices {
            self.read_device(fd, serial);
        }

        Cycle::Dispatched {
            notify: notify_ready,
            devices: ready_devices.len(),
        }
    }

    fn idle_pass(&mut self) {
        if !self.idle {
            tracing::debug!("Nothing to wait on, retrying every {:?}", self.idle_retry);
            self.idle = true;
        }

        if self.notify.is_none() && self.rescan_when_idle {
            if let Err(e) = self.registry.resync(&mut self.sink) {
                tracing::debug!("Idle rescan failed: {}", e);
            }
            if !self.registry.is_empty() {
                return;
            }
        }
        std::thread::sleep(self.idle_retry);
    }

    /// Read the channel until it would block, applying each batch in order.
    fn drain_notifications(&mut self) {
        let mut buf = std::mem::take(&mut self.notify_buf);
        loop {
            let Some(channel) = self.notify.as_ref() else {
                break;
            };
            match channel.read_batch(&mut buf) {
                Ok(0) => {
                    tracing::warn!("Notification channel closed; device hot-plug will not be tracked");
                    self.notify = None;
                }
                Ok(n) => {
                    if !self.apply_notifications(&buf[..n]) {
                        tracing::warn!("Watch on {:?} was removed; device hot-plug will not be tracked", self.registry.dir());
                        self.notify = None;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("Notification channel read failed: {}; device hot-plug will not be tracked", e);
                    self.notify = None;
                }
            }
        }
        self.notify_buf = buf;
    }

    /// Apply one read's worth of records. Returns false once the watch is
    /// gone.
    fn apply_notifications(&mut self, bytes: &[u8]) -> bool {
        let mut watch_alive = true;
        let mut cursor = RecordCursor::new(bytes);

        for record in cursor.by_ref() {
            if record.is_overflow() {
                tracing::warn!("Notification queue overflowed, rescanning {:?}", self.registry.dir());
                if let Err(e) = self.registry.resync(&mut self.sink) {
                    tracing::warn!("Rescan failed: {}", e);
                }
                continue;
            }
            if record.is_create() {
                self.registry.open(&record.name, &mut self.sink);
            }
            if record.is_delete() {
                self.registry.close_entry(&record.name, &mut self.sink);
            }
            if record.is_watch_gone() {
                watch_alive = false;
            }
        }

        if cursor.discarded() > 0 {
            tracing::debug!("Discarded {} byte(s) of truncated notification data", cursor.discarded());
        }
        watch_alive
    }

    fn read_device(&mut self, fd: RawFd, serial: u64) {
        let Self {
            registry,
            notify,
            sink,
            read_buf,
            ..
        } = self;

        // Closed (or closed and recycled) by this cycle's notifications
        let Some(handle) = registry.lookup(fd).filter(|h| h.serial() == serial) else {
            return;
        };

        let vanished = match handle.read_raw(read_buf) {
            Ok(0) => true,
            Ok(n) => {
                Self::emit_records(handle, &read_buf[..n], sink);
                false
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => {
                tracing::debug!("Read from {:?} failed: {}", handle.path(), e);
                e.raw_os_error() == Some(libc::ENODEV)
            }
        };

        // Without a channel no deletion record will ever arrive, and a hung-up
        // descriptor stays ready forever.
        if vanished && notify.is_none() {
            let path = handle.path().to_path_buf();
            tracing::info!("{:?} went away while hot-plug is not tracked", path);
            registry.close(&path, sink);
        }
    }

    fn emit_records(handle: &DeviceHandle, bytes: &[u8], sink: &mut S) {
        let n = bytes.len();
        if n < RECORD_SIZE {
            tracing::debug!("Short read of {} byte(s) from {:?}", n, handle.path());
            return;
        }

        for record in decode_batch(bytes) {
            sink.emit(MonitorEvent::Reading {
                name: handle.name().to_string(),
                record,
            });
        }
    }
}
