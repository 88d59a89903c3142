pub mod event;
pub mod evdev;

use crate::config::MonitorConfig;
use crate::sink::{EventSink, MonitorEvent};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use self::evdev::EvdevBackend;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Failed to read device directory {path:?}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// OS-facing half of device handling. Opening must be non-blocking and
/// read-only; name and grab queries are best-effort.
pub trait DeviceBackend {
    fn open(&mut self, path: &Path) -> io::Result<File>;
    fn query_name(&self, device: &File) -> io::Result<String>;
    fn grab(&self, device: &File) -> io::Result<()>;
}

/// Outcome of the exclusive-access request made when a device is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrabStatus {
    Acquired,
    NotAcquired,
    NotAttempted,
}

impl fmt::Display for GrabStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GrabStatus::Acquired => "acquired",
            GrabStatus::NotAcquired => "not_acquired",
            GrabStatus::NotAttempted => "not_attempted",
        })
    }
}

/// One open input source. Dropping it closes the descriptor, which also
/// releases any grab.
#[derive(Debug)]
pub struct DeviceHandle {
    file: File,
    serial: u64,
    path: PathBuf,
    name: String,
    grab: GrabStatus,
}

impl DeviceHandle {
    /// Unique for the lifetime of the registry, unlike the descriptor.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn grab(&self) -> GrabStatus {
        self.grab
    }

    /// Single non-blocking read of raw event bytes.
    pub fn read_raw(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened(RawFd),
    /// Name does not look like an input source
    Rejected,
    /// Node could not be opened (usually vanished already)
    Skipped,
}

/// Live set of open devices, keyed by descriptor.
pub struct DeviceRegistry<B: DeviceBackend = EvdevBackend> {
    dir: PathBuf,
    name_prefix: String,
    grab: bool,
    backend: B,
    devices: BTreeMap<RawFd, DeviceHandle>,
    next_serial: u64,
}

impl<B: DeviceBackend> DeviceRegistry<B> {
    pub fn new(dir: impl Into<PathBuf>, name_prefix: impl Into<String>, grab: bool, backend: B) -> Self {
        Self {
            dir: dir.into(),
            name_prefix: name_prefix.into(),
            grab,
            backend,
            devices: BTreeMap::new(),
            next_serial: 0,
        }
    }

    pub fn from_config(config: &MonitorConfig, backend: B) -> Self {
        Self::new(&config.device_dir, &config.name_prefix, config.grab, backend)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn matches(&self, entry_name: &str) -> bool {
        entry_name.starts_with(&self.name_prefix) && !entry_name.contains('/')
    }

    pub fn open<S: EventSink>(&mut self, entry_name: &str, sink: &mut S) -> OpenOutcome {
        if !self.matches(entry_name) {
            return OpenOutcome::Rejected;
        }

        let path = self.dir.join(entry_name);
        let file = match self.backend.open(&path) {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!("Skipping {:?}: {}", path, e);
                return OpenOutcome::Skipped;
            }
        };

        let name = self.backend.query_name(&file).unwrap_or_else(|e| {
            tracing::debug!("No name for {:?}: {}", path, e);
            String::new()
        });

        let grab = if !self.grab {
            GrabStatus::NotAttempted
        } else {
            match self.backend.grab(&file) {
                Ok(()) => GrabStatus::Acquired,
                Err(e) => {
                    tracing::debug!("Grab failed for {:?} ({}): {}", path, name, e);
                    GrabStatus::NotAcquired
                }
            }
        };

        let fd = file.as_raw_fd();
        let serial = self.next_serial;
        self.next_serial += 1;
        tracing::info!("Opened {:?} ({}) fd={} grab={}", path, name, fd, grab);
        sink.emit(MonitorEvent::Opened {
            path: path.clone(),
            name: name.clone(),
            grab,
        });
        self.devices.insert(
            fd,
            DeviceHandle {
                file,
                serial,
                path,
                name,
                grab,
            },
        );
        OpenOutcome::Opened(fd)
    }

    /// Close every handle registered under `path`. Unknown paths are a no-op.
    pub fn close<S: EventSink>(&mut self, path: &Path, sink: &mut S) -> usize {
        let fds: Vec<RawFd> = self
            .devices
            .iter()
            .filter(|(_, handle)| handle.path == path)
            .map(|(fd, _)| *fd)
            .collect();

        for fd in &fds {
            if let Some(handle) = self.devices.remove(fd) {
                tracing::info!("Closed {:?} ({}) fd={}", handle.path, handle.name, fd);
                sink.emit(MonitorEvent::Closed {
                    path: handle.path.clone(),
                    name: handle.name.clone(),
                });
            }
        }
        fds.len()
    }

    pub fn close_entry<S: EventSink>(&mut self, entry_name: &str, sink: &mut S) -> usize {
        let path = self.dir.join(entry_name);
        self.close(&path, sink)
    }

    /// Membership at call time, in descriptor order.
    pub fn snapshot_for_poll(&self) -> impl Iterator<Item = (RawFd, &DeviceHandle)> + Clone + '_ {
        self.devices.iter().map(|(fd, handle)| (*fd, handle))
    }

    pub fn lookup(&self, fd: RawFd) -> Option<&DeviceHandle> {
        self.devices.get(&fd)
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.devices.values().any(|handle| handle.path == path)
    }

    /// Matching entries in the device directory, sorted by name.
    pub fn candidates(&self) -> Result<Vec<String>, DeviceError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| DeviceError::ReadDir {
            path: self.dir.clone(),
            source,
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.') && self.matches(name))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Open every candidate in the directory. Already-open paths are opened
    /// again; see `resync` for the deduplicating variant.
    pub fn scan<S: EventSink>(&mut self, sink: &mut S) -> Result<usize, DeviceError> {
        let mut opened = 0;
        for name in self.candidates()? {
            if let OpenOutcome::Opened(_) = self.open(&name, sink) {
                opened += 1;
            }
        }
        Ok(opened)
    }

    /// Bring membership in line with the directory: close handles whose node
    /// is gone, open candidates not yet registered. Returns (opened, closed).
    pub fn resync<S: EventSink>(&mut self, sink: &mut S) -> Result<(usize, usize), DeviceError> {
        let present: BTreeSet<PathBuf> = self
            .candidates()?
            .into_iter()
            .map(|name| self.dir.join(name))
            .collect();

        let stale: BTreeSet<PathBuf> = self
            .devices
            .values()
            .filter(|handle| !present.contains(&handle.path))
            .map(|handle| handle.path.clone())
            .collect();
        let mut closed = 0;
        for path in &stale {
            closed += self.close(path, sink);
        }

        let mut opened = 0;
        for path in &present {
            if self.contains_path(path) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let OpenOutcome::Opened(_) = self.open(name, sink) {
                opened += 1;
            }
        }
        Ok((opened, closed))
    }

    /// Open a candidate just long enough to read its name. Never grabs.
    pub fn probe(&mut self, entry_name: &str) -> io::Result<String> {
        let file = self.backend.open(&self.dir.join(entry_name))?;
        self.backend.query_name(&file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;
    use proptest::prelude::*;

    fn registry(dir: &Path, backend: FakeBackend) -> DeviceRegistry<FakeBackend> {
        DeviceRegistry::new(dir, "event", true, backend)
    }

    #[test]
    fn open_registers_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::new();
        let _w = backend.add_device(dir.path().join("event3"), Some("TestPad"), true);
        let mut reg = registry(dir.path(), backend);
        let mut events: Vec<MonitorEvent> = Vec::new();

        let OpenOutcome::Opened(fd) = reg.open("event3", &mut events) else {
            panic!("expected open");
        };
        let handle = reg.lookup(fd).unwrap();
        assert_eq!(handle.name(), "TestPad");
        assert_eq!(handle.grab(), GrabStatus::Acquired);
        assert_eq!(handle.path(), dir.path().join("event3"));
        assert_eq!(
            events,
            vec![MonitorEvent::Opened {
                path: dir.path().join("event3"),
                name: "TestPad".to_string(),
                grab: GrabStatus::Acquired,
            }]
        );
    }

    #[test]
    fn grab_failure_still_registers() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::new();
        let _w = backend.add_device(dir.path().join("event1"), None, false);
        let mut reg = registry(dir.path(), backend);
        let mut events: Vec<MonitorEvent> = Vec::new();

        let OpenOutcome::Opened(fd) = reg.open("event1", &mut events) else {
            panic!("expected open");
        };
        let handle = reg.lookup(fd).unwrap();
        assert_eq!(handle.grab(), GrabStatus::NotAcquired);
        assert_eq!(handle.name(), "");
    }

    #[test]
    fn grab_disabled_is_not_attempted() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::new();
        let _w = backend.add_device(dir.path().join("event1"), Some("kbd"), true);
        let mut reg = DeviceRegistry::new(dir.path(), "event", false, backend);

        let OpenOutcome::Opened(fd) = reg.open("event1", &mut Vec::<MonitorEvent>::new()) else {
            panic!("expected open");
        };
        assert_eq!(reg.lookup(fd).unwrap().grab(), GrabStatus::NotAttempted);
    }

    #[test]
    fn non_matching_and_vanished_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(dir.path(), FakeBackend::new());
        let mut events: Vec<MonitorEvent> = Vec::new();

        assert_eq!(reg.open("mouse0", &mut events), OpenOutcome::Rejected);
        assert_eq!(reg.open("by-id", &mut events), OpenOutcome::Rejected);
        assert_eq!(reg.open("event42", &mut events), OpenOutcome::Skipped);
        assert!(reg.is_empty());
        assert!(events.is_empty());
    }

    #[test]
    fn duplicate_open_yields_independent_handles() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::new();
        let _w = backend.add_device(dir.path().join("event2"), Some("pad"), true);
        let mut reg = registry(dir.path(), backend);
        let mut events: Vec<MonitorEvent> = Vec::new();

        let first = reg.open("event2", &mut events);
        let second = reg.open("event2", &mut events);
        assert_ne!(first, second);
        assert_eq!(reg.len(), 2);

        let fds: Vec<RawFd> = reg.snapshot_for_poll().map(|(fd, _)| fd).collect();
        let unique: BTreeSet<RawFd> = fds.iter().copied().collect();
        assert_eq!(fds.len(), unique.len());

        assert_eq!(reg.close_entry("event2", &mut events), 2);
        assert!(reg.is_empty());
    }

    #[test]
    fn close_removes_and_reports_and_tolerates_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::new();
        let _a = backend.add_device(dir.path().join("event0"), Some("a"), true);
        let _b = backend.add_device(dir.path().join("event1"), Some("b"), true);
        let mut reg = registry(dir.path(), backend);
        let mut events: Vec<MonitorEvent> = Vec::new();
        reg.open("event0", &mut events);
        reg.open("event1", &mut events);
        events.clear();

        assert_eq!(reg.close(&dir.path().join("event0"), &mut events), 1);
        assert_eq!(reg.close(&dir.path().join("event0"), &mut events), 0);
        assert_eq!(reg.close(Path::new("/nowhere/event9"), &mut events), 0);

        assert!(!reg.contains_path(&dir.path().join("event0")));
        assert!(reg
            .snapshot_for_poll()
            .all(|(_, h)| h.path() != dir.path().join("event0")));
        assert_eq!(
            events,
            vec![MonitorEvent::Closed {
                path: dir.path().join("event0"),
                name: "a".to_string(),
            }]
        );
    }

    #[test]
    fn snapshot_is_restartable_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::new();
        let _a = backend.add_device(dir.path().join("event0"), Some("a"), true);
        let _b = backend.add_device(dir.path().join("event1"), Some("b"), true);
        let mut reg = registry(dir.path(), backend);
        reg.open("event1", &mut Vec::<MonitorEvent>::new());
        reg.open("event0", &mut Vec::<MonitorEvent>::new());

        let snapshot = reg.snapshot_for_poll();
        let first: Vec<RawFd> = snapshot.clone().map(|(fd, _)| fd).collect();
        let second: Vec<RawFd> = snapshot.map(|(fd, _)| fd).collect();
        assert_eq!(first, second);
        assert!(first.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn scan_skips_hidden_and_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["event0", "event1", "mice", ".event5"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("by-path")).unwrap();

        let mut backend = FakeBackend::new();
        let _a = backend.add_device(dir.path().join("event0"), Some("a"), true);
        let _b = backend.add_device(dir.path().join("event1"), Some("b"), true);
        let _h = backend.add_device(dir.path().join(".event5"), Some("hidden"), true);
        let mut reg = registry(dir.path(), backend);
        let mut events: Vec<MonitorEvent> = Vec::new();

        assert_eq!(reg.candidates().unwrap(), vec!["event0", "event1"]);
        assert_eq!(reg.scan(&mut events).unwrap(), 2);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn scan_of_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(&dir.path().join("gone"), FakeBackend::new());
        assert!(matches!(
            reg.scan(&mut Vec::<MonitorEvent>::new()),
            Err(DeviceError::ReadDir { .. })
        ));
    }

    #[test]
    fn resync_closes_stale_and_opens_new_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("event0"), b"").unwrap();
        let mut backend = FakeBackend::new();
        let _a = backend.add_device(dir.path().join("event0"), Some("a"), true);
        let _b = backend.add_device(dir.path().join("event1"), Some("b"), true);
        let mut reg = registry(dir.path(), backend);
        let mut events: Vec<MonitorEvent> = Vec::new();
        reg.scan(&mut events).unwrap();

        std::fs::remove_file(dir.path().join("event0")).unwrap();
        std::fs::write(dir.path().join("event1"), b"").unwrap();

        assert_eq!(reg.resync(&mut events).unwrap(), (1, 1));
        assert_eq!(reg.resync(&mut events).unwrap(), (0, 0));
        assert!(reg.contains_path(&dir.path().join("event1")));
        assert!(!reg.contains_path(&dir.path().join("event0")));
    }

    #[test]
    fn probe_reads_name_without_registering() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::new();
        let _w = backend.add_device(dir.path().join("event4"), Some("Lid Switch"), true);
        let mut reg = registry(dir.path(), backend);

        assert_eq!(reg.probe("event4").unwrap(), "Lid Switch");
        assert!(reg.is_empty());
    }

    proptest! {
        #[test]
        fn membership_follows_any_open_close_sequence(
            ops in proptest::collection::vec((any::<bool>(), 0usize..3), 0..24)
        ) {
            let dir = tempfile::tempdir().unwrap();
            let names = ["event0", "event1", "event2"];
            let mut backend = FakeBackend::new();
            let _writers: Vec<File> = names
                .iter()
                .map(|name| backend.add_device(dir.path().join(name), Some(*name), true))
                .collect();
            let mut reg = registry(dir.path(), backend);
            let mut events: Vec<MonitorEvent> = Vec::new();
            let mut open_count = [0usize; 3];

            for (open, i) in ops {
                let path = dir.path().join(names[i]);
                if open {
                    prop_assert!(matches!(reg.open(names[i], &mut events), OpenOutcome::Opened(_)));
                    open_count[i] += 1;
                } else {
                    prop_assert_eq!(reg.close(&path, &mut events), open_count[i]);
                    open_count[i] = 0;
                    prop_assert!(!reg.contains_path(&path));
                }

                let fds: Vec<RawFd> = reg.snapshot_for_poll().map(|(fd, _)| fd).collect();
                let unique: BTreeSet<RawFd> = fds.iter().copied().collect();
                prop_assert_eq!(unique.len(), fds.len());
                prop_assert_eq!(fds.len(), open_count.iter().sum::<usize>());
                for (j, name) in names.iter().enumerate() {
                    prop_assert_eq!(reg.contains_path(&dir.path().join(name)), open_count[j] > 0);
                }
            }
        }
    }
}
