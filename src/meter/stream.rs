use std::fs::OpenOptions;
use std::io::{self, Read};
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// How long a read waits for data before re-checking the shutdown flag
const POLL_INTERVAL_MS: i32 = 250;

/// Handle to an opened serial device. `shutdown` marks the stream dead and
/// closes the fd exactly once; it may be called from any task while a reader
/// is blocked, which is the release primitive paired with the blocking decode
/// call.
pub struct StreamGuard {
    fd: RawFd,
    closed: AtomicBool,
}

impl StreamGuard {
    /// Opens the device read-only, without becoming its controlling terminal.
    pub fn open(device: &str) -> io::Result<Arc<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(device)?;

        return Ok(Arc::new(StreamGuard {
            fd: file.into_raw_fd(),
            closed: AtomicBool::new(false),
        }));
    }

    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            unsafe { libc::close(self.fd) };
        }
    }

    pub fn is_closed(&self) -> bool {
        return self.closed.load(Ordering::SeqCst);
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Blocking `Read` view over a `StreamGuard` for the decoder. Waits for data
/// in poll() slices, re-checking the shutdown flag between slices, so a
/// reader parked on a silent device still notices `shutdown` within a bounded
/// interval.
pub struct DeviceStream {
    guard: Arc<StreamGuard>,
}

impl DeviceStream {
    pub fn new(guard: Arc<StreamGuard>) -> Self {
        return DeviceStream { guard };
    }
}

impl Read for DeviceStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // Flag first, the fd may already be gone
            if self.guard.is_closed() {
                return Err(io::Error::new(io::ErrorKind::Other, "stream closed"));
            }

            let mut pollfd = libc::pollfd {
                fd: self.guard.fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let ready = unsafe { libc::poll(&mut pollfd, 1, POLL_INTERVAL_MS) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if ready == 0 {
                continue;
            }

            if self.guard.is_closed() {
                return Err(io::Error::new(io::ErrorKind::Other, "stream closed"));
            }

            let n = unsafe {
                libc::read(self.guard.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n >= 0 {
                return Ok(n as usize);
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => continue,
                _ => return Err(err),
            }
        }
    }
}
