//! Pipe-backed stand-ins for device nodes and the notification channel.

use crate::device::DeviceBackend;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

/// Non-blocking pipe as (read end, write end).
pub fn pipe() -> (File, File) {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(rc, 0, "pipe2: {}", io::Error::last_os_error());
    unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) }
}

struct FakeNode {
    reader: File,
    name: Option<String>,
    grab_ok: bool,
}

/// Serves registered paths as pipes. Each open dups the read end, so two
/// opens of one path are two descriptors on the same stream.
#[derive(Default)]
pub struct FakeBackend {
    nodes: HashMap<PathBuf, FakeNode>,
    opened: HashMap<RawFd, PathBuf>,
    side_effects: HashMap<PathBuf, PathBuf>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and return the writer that feeds it.
    pub fn add_device(&mut self, path: PathBuf, name: Option<&str>, grab_ok: bool) -> File {
        let (reader, writer) = pipe();
        self.nodes.insert(
            path,
            FakeNode {
                reader,
                name: name.map(str::to_string),
                grab_ok,
            },
        );
        writer
    }

    /// Create the file `created` the first time `trigger` is opened, like a
    /// node appearing while a scan is under way.
    pub fn create_on_open(&mut self, trigger: PathBuf, created: PathBuf) {
        self.side_effects.insert(trigger, created);
    }

    fn node(&self, device: &File) -> io::Result<&FakeNode> {
        self.opened
            .get(&device.as_raw_fd())
            .and_then(|path| self.nodes.get(path))
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }
}

impl DeviceBackend for FakeBackend {
    fn open(&mut self, path: &Path) -> io::Result<File> {
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;
        let file = node.reader.try_clone()?;
        self.opened.insert(file.as_raw_fd(), path.to_path_buf());
        if let Some(created) = self.side_effects.remove(path) {
            std::fs::write(created, b"")?;
        }
        Ok(file)
    }

    fn query_name(&self, device: &File) -> io::Result<String> {
        self.node(device)?
            .name
            .clone()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOTTY))
    }

    fn grab(&self, device: &File) -> io::Result<()> {
        if self.node(device)?.grab_ok {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EBUSY))
        }
    }
}

/// Bytes of one kernel notification record for `name`.
pub fn notify_record(mask: u32, name: &str) -> Vec<u8> {
    let header = std::mem::size_of::<libc::inotify_event>();
    // names are NUL-padded to a multiple of the header alignment
    let padded = if name.is_empty() {
        0
    } else {
        (name.len() + 1).div_ceil(header) * header
    };

    let mut buf = Vec::with_capacity(header + padded);
    buf.extend_from_slice(&1i32.to_ne_bytes());
    buf.extend_from_slice(&mask.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&(padded as u32).to_ne_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf.resize(header + padded, 0);
    buf
}
