use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read};
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fixed part of every kernel notification record.
pub const HEADER_SIZE: usize = size_of::<libc::inotify_event>();

// wd, mask, cookie, len
const MASK_OFFSET: usize = 4;
const LEN_OFFSET: usize = 12;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Failed to initialize notification channel: {0}")]
    Init(#[source] io::Error),
    #[error("Failed to watch {path:?}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Watch path contains a NUL byte: {0:?}")]
    InvalidPath(PathBuf),
}

/// One parsed record: the event flags and the entry name it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyRecord {
    pub mask: u32,
    pub name: String,
}

impl NotifyRecord {
    pub fn is_create(&self) -> bool {
        self.mask & libc::IN_CREATE != 0
    }

    pub fn is_delete(&self) -> bool {
        self.mask & libc::IN_DELETE != 0
    }

    /// The kernel dropped records; membership must be re-derived.
    pub fn is_overflow(&self) -> bool {
        self.mask & libc::IN_Q_OVERFLOW != 0
    }

    /// The watched directory itself went away.
    pub fn is_watch_gone(&self) -> bool {
        self.mask & (libc::IN_IGNORED | libc::IN_DELETE_SELF | libc::IN_UNMOUNT) != 0
    }
}

/// Walks a read buffer record by record. Iteration ends at the first record
/// that does not fit in what is left; the rest of the buffer is discarded.
#[derive(Debug, Clone)]
pub struct RecordCursor<'a> {
    buf: &'a [u8],
    offset: usize,
    discarded: usize,
}

impl<'a> RecordCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            discarded: 0,
        }
    }

    /// Bytes dropped because the trailing record was truncated.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    fn stop(&mut self) {
        self.discarded = self.buf.len() - self.offset;
        self.offset = self.buf.len();
    }
}

impl Iterator for RecordCursor<'_> {
    type Item = NotifyRecord;

    fn next(&mut self) -> Option<NotifyRecord> {
        let rest = &self.buf[self.offset..];
        if rest.is_empty() {
            return None;
        }
        if rest.len() < HEADER_SIZE {
            self.stop();
            return None;
        }

        let mask = read_u32(rest, MASK_OFFSET);
        let name_len = read_u32(rest, LEN_OFFSET) as usize;
        let total = match HEADER_SIZE.checked_add(name_len) {
            Some(total) if total <= rest.len() => total,
            _ => {
                self.stop();
                return None;
            }
        };

        let name_bytes = &rest[HEADER_SIZE..total];
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();

        self.offset += total;
        Some(NotifyRecord { mask, name })
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Non-blocking channel reporting entry creation and deletion in one
/// directory.
#[derive(Debug)]
pub struct NotifyChannel {
    file: File,
}

impl NotifyChannel {
    pub fn watch(dir: &Path) -> Result<Self, NotifyError> {
        let c_path = CString::new(dir.as_os_str().as_bytes())
            .map_err(|_| NotifyError::InvalidPath(dir.to_path_buf()))?;

        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(NotifyError::Init(io::Error::last_os_error()));
        }
        // Owned from here on so every error path closes it
        let file = unsafe { File::from_raw_fd(fd) };

        let wd = unsafe {
            libc::inotify_add_watch(fd, c_path.as_ptr(), libc::IN_CREATE | libc::IN_DELETE)
        };
        if wd < 0 {
            return Err(NotifyError::Watch {
                path: dir.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }

        tracing::info!("Watching {:?} for device changes", dir);
        Ok(Self { file })
    }

    /// Wrap an already-open, non-blocking record stream.
    #[cfg(test)]
    pub fn from_file(file: File) -> Self {
        Self { file }
    }

    pub fn read_batch(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }
}

impl AsRawFd for NotifyChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
