//! Device and object-descriptor capabilities
//!
//! `CacheDevice` is the control channel (`/dev/cachefiles`); `ObjectFile` is a
//! per-object descriptor handed over in an OPEN message. Both are traits so the
//! bridge and servicer run against in-memory fakes in tests.

use super::wire::{Command, CACHEFILES_IOC_READ_COMPLETE};
use crate::error::DaemonError;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready,
    Timeout,
    Closed,
}

pub trait CacheDevice: Send + Sync {
    fn write_command(&self, cmd: &Command) -> Result<(), DaemonError>;

    /// Wait up to `timeout` for a message.
    fn poll_readable(&self, timeout: Duration) -> Result<PollOutcome, DaemonError>;

    /// Read one pending message into `buf`. `Ok(None)` when nothing is pending.
    fn read_message(&self, buf: &mut [u8]) -> Result<Option<usize>, DaemonError>;

    /// Adopt the object descriptor carried by an OPEN message.
    fn object_file(&self, fd: u32) -> Result<Arc<dyn ObjectFile>, DaemonError>;

    /// Close the device; a concurrent poll observes `Closed`.
    fn close(&self);
}

pub trait ObjectFile: Send + Sync {
    fn write_at(&self, data: &[u8], off: u64) -> Result<(), DaemonError>;

    /// Tell the kernel the read request `msg_id` is finished.
    fn complete_read(&self, msg_id: u32) -> Result<(), DaemonError>;
}

/// The real cachefiles device.
///
/// `close` only marks the device closed and wakes the poller through an
/// eventfd. The descriptor itself is closed when the last handle is dropped,
/// so its number cannot be reused while a poll or write may still use it.
pub struct DevCacheFiles {
    fd: OwnedFd,
    wake: OwnedFd,
    closed: AtomicBool,
}

impl DevCacheFiles {
    pub fn open(path: &Path) -> Result<Self, DaemonError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| DaemonError::ConfigError(format!("open {}: {}", path.display(), e)))?;
        // SAFETY: plain syscall, the result is checked before use
        let wake = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake < 0 {
            return Err(DaemonError::Io(io::Error::last_os_error()));
        }
        debug!(path = %path.display(), "Opened cachefiles device");
        Ok(Self {
            fd: file.into(),
            // SAFETY: eventfd returned a fresh descriptor we now own
            wake: unsafe { OwnedFd::from_raw_fd(wake) },
            closed: AtomicBool::new(false),
        })
    }

    fn raw(&self) -> Result<RawFd, DaemonError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DaemonError::Io(io::Error::from_raw_os_error(libc::EBADF)));
        }
        Ok(self.fd.as_raw_fd())
    }
}

impl CacheDevice for DevCacheFiles {
    fn write_command(&self, cmd: &Command) -> Result<(), DaemonError> {
        let fd = self.raw()?;
        let line = cmd.to_string();
        // SAFETY: fd is open and the buffer outlives the call
        let n = unsafe { libc::write(fd, line.as_ptr() as *const libc::c_void, line.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return Err(DaemonError::Io(io::Error::new(
                err.kind(),
                format!("{:?}: {}", line, err),
            )));
        }
        Ok(())
    }

    fn poll_readable(&self, timeout: Duration) -> Result<PollOutcome, DaemonError> {
        let fd = match self.raw() {
            Ok(fd) => fd,
            Err(_) => return Ok(PollOutcome::Closed),
        };
        let mut pfds = [
            libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.wake.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        // SAFETY: two valid pollfds
        let n = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(PollOutcome::Timeout);
            }
            return Err(DaemonError::Io(err));
        }
        if pfds[1].revents != 0 || self.closed.load(Ordering::Acquire) {
            return Ok(PollOutcome::Closed);
        }
        if n == 0 {
            return Ok(PollOutcome::Timeout);
        }
        let revents = pfds[0].revents;
        if revents & libc::POLLNVAL != 0 {
            return Ok(PollOutcome::Closed);
        }
        if revents & (libc::POLLERR | libc::POLLHUP) != 0 {
            return Err(DaemonError::Protocol(format!("device poll revents {:#x}", revents)));
        }
        Ok(PollOutcome::Ready)
    }

    fn read_message(&self, buf: &mut [u8]) -> Result<Option<usize>, DaemonError> {
        let fd = self.raw()?;
        // SAFETY: buf is valid for buf.len() bytes
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
                _ => Err(DaemonError::Io(err)),
            };
        }
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(n as usize))
    }

    fn object_file(&self, fd: u32) -> Result<Arc<dyn ObjectFile>, DaemonError> {
        Ok(Arc::new(KernelObject::adopt(fd as RawFd)?))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let one: u64 = 1;
        // SAFETY: eventfd writes take exactly eight bytes
        let n = unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            warn!(error = %io::Error::last_os_error(), "Waking device poller failed");
        }
    }
}

/// Object descriptor from an OPEN message. Closed on drop.
pub struct KernelObject {
    file: File,
}

impl KernelObject {
    pub fn adopt(fd: RawFd) -> Result<Self, DaemonError> {
        if fd < 0 {
            return Err(DaemonError::Protocol(format!("invalid object fd {}", fd)));
        }
        // SAFETY: the kernel installed fd for us and ownership passes here
        Ok(Self {
            file: unsafe { File::from_raw_fd(fd) },
        })
    }
}

impl ObjectFile for KernelObject {
    fn write_at(&self, data: &[u8], off: u64) -> Result<(), DaemonError> {
        self.file.write_all_at(data, off)?;
        Ok(())
    }

    fn complete_read(&self, msg_id: u32) -> Result<(), DaemonError> {
        // SAFETY: plain integer argument on an open descriptor
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                CACHEFILES_IOC_READ_COMPLETE as _,
                msg_id as libc::c_ulong,
            )
        };
        if rc < 0 {
            return Err(DaemonError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::time::Instant;

    /// A FIFO opened read-write never becomes readable on its own.
    fn fifo_device(dir: &tempfile::TempDir) -> DevCacheFiles {
        let path = dir.path().join("dev");
        let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);
        DevCacheFiles::open(&path).unwrap()
    }

    #[test]
    fn test_close_wakes_blocked_poll() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(fifo_device(&dir));
        let poller = {
            let device = device.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                let outcome = device.poll_readable(Duration::from_secs(30)).unwrap();
                (outcome, started.elapsed())
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        device.close();
        let (outcome, waited) = poller.join().unwrap();
        assert_eq!(outcome, PollOutcome::Closed);
        assert!(waited < Duration::from_secs(10));

        // the descriptor stays owned until drop; the device refuses use meanwhile
        assert!(device.write_command(&Command::BindOndemand).is_err());
        assert_eq!(device.poll_readable(Duration::ZERO).unwrap(), PollOutcome::Closed);
    }
}
