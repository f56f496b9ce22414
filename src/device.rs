//! Positioned access to the device under test.

use std::{
    fs::{File, OpenOptions},
    io::{self, Seek},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};

/// The device path could not be opened; nothing has been written yet.
#[derive(Debug, Error)]
#[error("could not open {path:?}: {source}")]
pub struct OpenError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("operation did not complete within {0:?}")]
    Timeout(Duration),

    #[error("short read: {read} of {expected} bytes")]
    ShortRead { read: usize, expected: usize },

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("device handle is no longer usable: {0}")]
    Gone(String),
}

impl DeviceError {
    /// Whether the handle itself is unusable, as opposed to a single
    /// operation having failed.
    pub fn is_fatal(&self) -> bool {
        match self {
            DeviceError::Gone(_) => true,
            // ENXIO, EBADF, ENODEV: the device went away underneath us.
            DeviceError::Io(e) => matches!(e.raw_os_error(), Some(6) | Some(9) | Some(19)),
            DeviceError::Timeout(_)
            | DeviceError::ShortRead { .. }
            | DeviceError::ShortWrite { .. } => false,
        }
    }
}

/// A raw, linear byte space that can be written and read at any offset.
///
/// The size hint is what the device claims; nothing here trusts it.
/// Dropping the handle closes the device.
pub(crate) trait BlockDevice {
    fn size_hint(&self) -> u64;

    /// Fills all of `buf` from `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Writes all of `data` at `offset` in a single operation.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError>;

    fn sync(&mut self) -> Result<(), DeviceError>;

    /// Makes sure subsequent reads come from the medium, not from a cache.
    fn drop_caches(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// A block device (or image file) opened through the filesystem.
#[derive(Debug)]
pub(crate) struct FileDevice {
    file: File,
    path: PathBuf,
    size: u64,
}

impl FileDevice {
    /// Opens the device and determines its claimed size by seeking to the end.
    pub(crate) fn open(path: &Path, writable: bool) -> Result<Self, OpenError> {
        let open_error = |source| OpenError {
            path: path.to_path_buf(),
            source,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(open_error)?;
        let size = file.seek(io::SeekFrom::End(0)).map_err(open_error)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
        })
    }
}

impl BlockDevice for FileDevice {
    fn size_hint(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let expected = buf.len();
        let mut read = 0;
        while read < expected {
            match self.file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => return Err(DeviceError::ShortRead { read, expected }),
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let expected = data.len();
        loop {
            match self.file.write_at(data, offset) {
                Ok(written) if written == expected => return Ok(()),
                Ok(written) => return Err(DeviceError::ShortWrite { written, expected }),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn sync(&mut self) -> Result<(), DeviceError> {
        Ok(self.file.sync_all()?)
    }

    #[cfg(target_os = "linux")]
    fn drop_caches(&mut self) -> Result<(), DeviceError> {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor is owned by `self.file` and stays open for the call.
        let ret = unsafe {
            libc::posix_fadvise(self.file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED)
        };
        if ret != 0 {
            let error = io::Error::from_raw_os_error(ret);
            warn!(
                path = ?self.path,
                %error,
                "Could not drop cached pages; reads may be served from memory"
            );
        }
        Ok(())
    }
}

enum Request {
    Read { offset: u64, buf: Vec<u8> },
    Write { offset: u64, data: Vec<u8> },
    Sync,
    DropCaches,
}

/// Runs a device on its own I/O thread so that every operation can be
/// bounded by a timeout.
///
/// Once an operation times out the worker is presumed hung: the handle is
/// wedged and every further call fails with [`DeviceError::Gone`]. A hung
/// worker is never joined, so the device it owns stays open until the
/// process exits.
pub(crate) struct TimedDevice {
    requests: Option<mpsc::Sender<Request>>,
    replies: mpsc::Receiver<Result<Vec<u8>, DeviceError>>,
    worker: Option<thread::JoinHandle<()>>,
    size: u64,
    timeout: Duration,
    wedged: bool,
}

impl TimedDevice {
    pub(crate) fn spawn<D>(mut device: D, timeout: Duration) -> io::Result<Self>
    where
        D: BlockDevice + Send + 'static,
    {
        let size = device.size_hint();
        let (requests, incoming) = mpsc::channel::<Request>();
        let (outgoing, replies) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("device-io".to_string())
            .spawn(move || {
                for request in incoming {
                    let reply = match request {
                        Request::Read { offset, mut buf } => {
                            device.read_at(offset, &mut buf).map(|()| buf)
                        }
                        Request::Write { offset, data } => {
                            device.write_at(offset, &data).map(|()| data)
                        }
                        Request::Sync => device.sync().map(|()| Vec::new()),
                        Request::DropCaches => device.drop_caches().map(|()| Vec::new()),
                    };
                    if outgoing.send(reply).is_err() {
                        break;
                    }
                }
                debug!("Device I/O thread exiting");
            })?;
        Ok(Self {
            requests: Some(requests),
            replies,
            worker: Some(worker),
            size,
            timeout,
            wedged: false,
        })
    }

    fn call(&mut self, request: Request) -> Result<Vec<u8>, DeviceError> {
        if self.wedged {
            return Err(DeviceError::Gone(format!(
                "an earlier operation did not finish within {:?}",
                self.timeout
            )));
        }
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| DeviceError::Gone("device is closed".to_string()))?;
        requests
            .send(request)
            .map_err(|_| DeviceError::Gone("device I/O thread exited".to_string()))?;
        match self.replies.recv_timeout(self.timeout) {
            Ok(reply) => reply,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.wedged = true;
                Err(DeviceError::Timeout(self.timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(DeviceError::Gone("device I/O thread exited".to_string()))
            }
        }
    }
}

impl BlockDevice for TimedDevice {
    fn size_hint(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let filled = self.call(Request::Read {
            offset,
            buf: vec![0; buf.len()],
        })?;
        buf.copy_from_slice(&filled);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.call(Request::Write {
            offset,
            data: data.to_vec(),
        })
        .map(|_| ())
    }

    fn sync(&mut self) -> Result<(), DeviceError> {
        self.call(Request::Sync).map(|_| ())
    }

    fn drop_caches(&mut self) -> Result<(), DeviceError> {
        self.call(Request::DropCaches).map(|_| ())
    }
}

impl Drop for TimedDevice {
    fn drop(&mut self) {
        // Closing the request channel lets the worker drop (and close) the device.
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if self.wedged {
                warn!("Device I/O thread is hung; leaving it behind with the device still open");
            } else if worker.join().is_err() {
                warn!("Device I/O thread panicked");
            }
        }
    }
}

/// In-memory devices that misbehave in well-defined ways.
#[cfg(test)]
pub(crate) mod testing {
    use super::{BlockDevice, DeviceError};
    use std::{io, thread, time::Duration};

    fn check_read(size: u64, offset: u64, len: usize) -> Result<(), DeviceError> {
        if offset.saturating_add(len as u64) > size {
            return Err(DeviceError::ShortRead {
                read: size.saturating_sub(offset) as usize,
                expected: len,
            });
        }
        Ok(())
    }

    fn check_write(size: u64, offset: u64, len: usize) -> Result<(), DeviceError> {
        if offset.saturating_add(len as u64) > size {
            return Err(DeviceError::ShortWrite {
                written: 0,
                expected: len,
            });
        }
        Ok(())
    }

    /// Stores exactly what it claims.
    #[derive(Debug, Clone)]
    pub(crate) struct MemDevice {
        pub(crate) data: Vec<u8>,
    }

    impl MemDevice {
        pub(crate) fn new(size: usize) -> Self {
            Self {
                data: vec![0; size],
            }
        }
    }

    impl BlockDevice for MemDevice {
        fn size_hint(&self) -> u64 {
            self.data.len() as u64
        }

        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
            check_read(self.size_hint(), offset, buf.len())?;
            let start = offset as usize;
            buf.copy_from_slice(&self.data[start..start + buf.len()]);
            Ok(())
        }

        fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
            check_write(self.size_hint(), offset, data.len())?;
            let start = offset as usize;
            self.data[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn sync(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    /// Claims `nominal` bytes but only has `physical` bytes of storage;
    /// every address maps onto `address % physical`.
    #[derive(Debug, Clone)]
    pub(crate) struct WrappingDevice {
        nominal: u64,
        physical: Vec<u8>,
    }

    impl WrappingDevice {
        pub(crate) fn new(nominal: u64, physical: usize) -> Self {
            Self {
                nominal,
                physical: vec![0; physical],
            }
        }
    }

    impl BlockDevice for WrappingDevice {
        fn size_hint(&self) -> u64 {
            self.nominal
        }

        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
            check_read(self.nominal, offset, buf.len())?;
            let physical = self.physical.len() as u64;
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = self.physical[((offset + i as u64) % physical) as usize];
            }
            Ok(())
        }

        fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
            check_write(self.nominal, offset, data.len())?;
            let physical = self.physical.len() as u64;
            for (i, byte) in data.iter().enumerate() {
                self.physical[((offset + i as u64) % physical) as usize] = *byte;
            }
            Ok(())
        }

        fn sync(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    /// Flips a bit in every read that covers `corrupt_at`.
    #[derive(Debug, Clone)]
    pub(crate) struct CorruptingDevice {
        pub(crate) inner: MemDevice,
        pub(crate) corrupt_at: u64,
    }

    impl BlockDevice for CorruptingDevice {
        fn size_hint(&self) -> u64 {
            self.inner.size_hint()
        }

        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
            self.inner.read_at(offset, buf)?;
            if (offset..offset + buf.len() as u64).contains(&self.corrupt_at) {
                buf[(self.corrupt_at - offset) as usize] ^= 0x10;
            }
            Ok(())
        }

        fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
            self.inner.write_at(offset, data)
        }

        fn sync(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    /// Fails reads (and optionally writes) in `[bad_from, bad_until)`.
    #[derive(Debug, Clone)]
    pub(crate) struct FailingDevice {
        pub(crate) inner: MemDevice,
        pub(crate) bad_from: u64,
        pub(crate) bad_until: u64,
        pub(crate) fail_writes: bool,
        pub(crate) fatal: bool,
    }

    impl FailingDevice {
        fn failure(&self) -> DeviceError {
            if self.fatal {
                DeviceError::Gone("unplugged".to_string())
            } else {
                io::Error::new(io::ErrorKind::Other, "medium error").into()
            }
        }

        fn is_bad(&self, offset: u64) -> bool {
            (self.bad_from..self.bad_until).contains(&offset)
        }
    }

    impl BlockDevice for FailingDevice {
        fn size_hint(&self) -> u64 {
            self.inner.size_hint()
        }

        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
            if self.is_bad(offset) {
                return Err(self.failure());
            }
            self.inner.read_at(offset, buf)
        }

        fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
            if self.fail_writes && self.is_bad(offset) {
                return Err(self.failure());
            }
            self.inner.write_at(offset, data)
        }

        fn sync(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    /// Sleeps on every read.
    #[derive(Debug, Clone)]
    pub(crate) struct StallingDevice {
        pub(crate) inner: MemDevice,
        pub(crate) stall: Duration,
    }

    impl BlockDevice for StallingDevice {
        fn size_hint(&self) -> u64 {
            self.inner.size_hint()
        }

        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
            thread::sleep(self.stall);
            self.inner.read_at(offset, buf)
        }

        fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
            self.inner.write_at(offset, data)
        }

        fn sync(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
    }
}
