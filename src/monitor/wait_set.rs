use crate::device::{DeviceBackend, DeviceRegistry};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

const READY: libc::c_short = libc::POLLIN | libc::POLLERR | libc::POLLHUP;

/// What a slot in the wait-set stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitSource {
    Notify,
    /// `serial` identifies the handle the slot was built for, so a
    /// descriptor recycled mid-cycle is not mistaken for it.
    Device { fd: RawFd, serial: u64 },
}

/// One cycle's worth of `poll(2)` input, built fresh from current state.
#[derive(Debug, Default)]
pub struct WaitSet {
    fds: Vec<libc::pollfd>,
    sources: Vec<WaitSource>,
}

/// Notification channel first, then every registered device in registry
/// order.
pub fn build_wait_set<B: DeviceBackend>(notify: Option<RawFd>, registry: &DeviceRegistry<B>) -> WaitSet {
    let mut set = WaitSet::default();
    if let Some(fd) = notify {
        set.push(fd, WaitSource::Notify);
    }
    for (fd, handle) in registry.snapshot_for_poll() {
        set.push(
            fd,
            WaitSource::Device {
                fd,
                serial: handle.serial(),
            },
        );
    }
    set
}

impl WaitSet {
    fn push(&mut self, fd: RawFd, source: WaitSource) {
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        self.sources.push(source);
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    #[cfg(test)]
    pub fn sources(&self) -> &[WaitSource] {
        &self.sources
    }

    /// Block until something is ready. `None` waits indefinitely. Returns
    /// the number of ready slots; zero means the timeout expired.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        };
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Sources reported ready by the last `wait`, in slot order.
    pub fn ready(&self) -> impl Iterator<Item = WaitSource> + '_ {
        self.fds
            .iter()
            .zip(&self.sources)
            .filter(|(pfd, _)| pfd.revents & READY != 0)
            .map(|(_, source)| *source)
    }
}
