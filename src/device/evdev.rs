use super::DeviceBackend;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

const NAME_BUF_LEN: usize = 256;

/// Talks to real `/dev/input/event*` nodes through the evdev ioctl interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvdevBackend;

impl DeviceBackend for EvdevBackend {
    fn open(&mut self, path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
    }

    fn query_name(&self, device: &File) -> io::Result<String> {
        let mut buf = [0u8; NAME_BUF_LEN];
        let result = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                evdev_ioctl::eviocgname(NAME_BUF_LEN) as _,
                buf.as_mut_ptr(),
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        // The kernel NUL-terminates, but never trust the length it returns
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    fn grab(&self, device: &File) -> io::Result<()> {
        let result = unsafe {
            libc::ioctl(device.as_raw_fd(), evdev_ioctl::EVIOCGRAB as _, 1 as libc::c_int)
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

// evdev ioctl request numbers, built like the kernel's `_IOC` macro. The
// direction bits and the width of the size field vary by architecture.
mod evdev_ioctl {
    #[cfg(any(
        target_arch = "powerpc",
        target_arch = "powerpc64",
        target_arch = "mips",
        target_arch = "mips64",
        target_arch = "mips32r6",
        target_arch = "mips64r6",
        target_arch = "sparc",
        target_arch = "sparc64"
    ))]
    mod arch {
        pub const SIZE_BITS: u32 = 13;
        pub const READ: u32 = 2;
        pub const WRITE: u32 = 4;
    }

    #[cfg(not(any(
        target_arch = "powerpc",
        target_arch = "powerpc64",
        target_arch = "mips",
        target_arch = "mips64",
        target_arch = "mips32r6",
        target_arch = "mips64r6",
        target_arch = "sparc",
        target_arch = "sparc64"
    )))]
    mod arch {
        pub const SIZE_BITS: u32 = 14;
        pub const READ: u32 = 2;
        pub const WRITE: u32 = 1;
    }

    const SIZE_SHIFT: u32 = 16;
    const DIR_SHIFT: u32 = SIZE_SHIFT + arch::SIZE_BITS;
    const EV_TYPE: u32 = b'E' as u32;

    const fn ioc(dir: u32, nr: u32, size: u32) -> u32 {
        (dir << DIR_SHIFT) | ((size & ((1 << arch::SIZE_BITS) - 1)) << SIZE_SHIFT) | (EV_TYPE << 8) | nr
    }

    /// `EVIOCGRAB`: `_IOW('E', 0x90, int)`
    pub const EVIOCGRAB: u32 = ioc(arch::WRITE, 0x90, std::mem::size_of::<libc::c_int>() as u32);

    /// `EVIOCGNAME(len)`: `_IOC(_IOC_READ, 'E', 0x06, len)`
    pub fn eviocgname(len: usize) -> u32 {
        ioc(arch::READ, 0x06, len as u32)
    }
}
