// Serial link to the base controller
//
// Opens the port once and splits it into a reader half and a writer half.
// Each half is owned by its own worker thread, so blocking port I/O never
// runs on the async executor.

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, error, info};

use super::protocol::{Frame, FrameSynchronizer};
use crate::shared::Snapshot;

/// Default serial configuration for the base controller
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Bytes discarded right after opening, before acquisition starts
const STARTUP_FLUSH_BYTES: usize = 50;
const STARTUP_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Back-off after an unexpected read error
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Error types for the serial link
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;

/// Open serial connection to the base
pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    /// Open the port; reads block for at most `timeout`
    pub fn open(port_name: &str, baudrate: u32, timeout: Duration) -> Result<Self> {
        info!("Opening base link on {} @ {} baud", port_name, baudrate);
        let port = serialport::new(port_name, baudrate)
            .timeout(timeout)
            .open()?;
        Ok(Self { port })
    }

    /// Discard whatever the controller emitted before we were listening
    pub fn flush_startup(&mut self) {
        info!("Flushing first {} bytes ...", STARTUP_FLUSH_BYTES);
        let mut byte = [0u8; 1];
        for _ in 0..STARTUP_FLUSH_BYTES {
            // timeouts here just mean the line is quiet
            let _ = self.port.read(&mut byte);
            thread::sleep(STARTUP_FLUSH_INTERVAL);
        }
    }

    /// Split into independent reader and writer handles on the same port
    pub fn split(self) -> Result<(Box<dyn SerialPort>, Box<dyn SerialPort>)> {
        let reader = self.port.try_clone()?;
        Ok((reader, self.port))
    }
}

/// Continuously recover frames from `source` and publish each valid one.
///
/// Runs until `shutdown` is set. Each valid frame replaces the previous
/// one; nothing else is ever written to `latest`.
pub fn run_acquisition<R: Read + ?Sized>(
    source: &mut R,
    latest: &Snapshot<Option<Frame>>,
    shutdown: &AtomicBool,
) {
    let mut sync = FrameSynchronizer::new();
    let mut frames: u64 = 0;

    while !shutdown.load(Ordering::Relaxed) {
        match sync.poll(source) {
            Ok(Some(frame)) => {
                latest.publish(Some(frame));
                frames += 1;
            }
            Ok(None) => {}
            Err(e) => {
                error!("Serial read error: {}", e);
                thread::sleep(READ_ERROR_BACKOFF);
            }
        }
    }

    info!(
        "Acquisition stopped after {} frames ({} bytes resynced)",
        frames,
        sync.discarded()
    );
}

/// A named thread that works on one half of the port.
///
/// Stopping (or dropping) the handle raises the shutdown flag and joins the
/// thread, so the port half it owns is released before this returns.
#[derive(Debug)]
pub struct PortWorker {
    name: String,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PortWorker {
    pub fn spawn<F>(name: &str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(&AtomicBool) + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(&flag))?;
        debug!("Started {} thread", name);
        Ok(Self {
            name: name.to_string(),
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Signal the thread and wait for it to exit
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{} thread panicked", self.name);
            }
        }
    }
}

impl Drop for PortWorker {
    fn drop(&mut self) {
        self.halt();
    }
}

/// Start frame acquisition on a dedicated thread that owns `reader`
pub fn spawn_acquisition<R>(
    mut reader: R,
    latest: Snapshot<Option<Frame>>,
) -> std::io::Result<PortWorker>
where
    R: Read + Send + 'static,
{
    PortWorker::spawn("frame-acquisition", move |shutdown| {
        run_acquisition(&mut reader, &latest, shutdown);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Replays a byte script, then requests shutdown once drained
    struct Scripted<'a> {
        data: &'a [u8],
        shutdown: &'a AtomicBool,
    }

    impl Read for Scripted<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.is_empty() {
                self.shutdown.store(true, Ordering::Relaxed);
                return Err(io::Error::new(io::ErrorKind::TimedOut, "timeout"));
            }
            let n = buf.len().min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_acquisition_keeps_latest_frame() {
        let first = [0xFF, 0xFE, 0x01, 0xF4, 0x01, 0xF4, 0x04, 0xB0];
        let second = [0xFF, 0xFE, 0x02, 0x00, 0x02, 0x00, 0x04, 0xAF];
        let mut stream = vec![0x00, 0x13];
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&[0xFF, 0x00, 0x01]); // garbage, incl. half a header
        stream.extend_from_slice(&second);
        stream.extend_from_slice(&[0xFF, 0xFE, 0x00]); // truncated trailing frame

        let shutdown = AtomicBool::new(false);
        let latest = Snapshot::new(None);
        let mut source = Scripted {
            data: &stream,
            shutdown: &shutdown,
        };

        run_acquisition(&mut source, &latest, &shutdown);

        let frame = latest.load().expect("a frame should have been published");
        assert_eq!(frame.as_bytes(), &second);
    }

    /// Endless quiet line that records when it is dropped
    struct QuietPort {
        released: Arc<AtomicBool>,
    }

    impl Read for QuietPort {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(5));
            Err(io::Error::new(io::ErrorKind::TimedOut, "timeout"))
        }
    }

    impl Drop for QuietPort {
        fn drop(&mut self) {
            self.released.store(true, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_dropping_worker_releases_reader() {
        let released = Arc::new(AtomicBool::new(false));
        let worker = spawn_acquisition(
            QuietPort {
                released: released.clone(),
            },
            Snapshot::new(None),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        assert!(!worker.is_finished());
        assert!(!released.load(Ordering::Relaxed));

        // e.g. an early `?` return in the caller
        drop(worker);
        assert!(released.load(Ordering::Relaxed));
    }

    #[test]
    fn test_stop_joins_worker() {
        let released = Arc::new(AtomicBool::new(false));
        let worker = spawn_acquisition(
            QuietPort {
                released: released.clone(),
            },
            Snapshot::new(None),
        )
        .unwrap();
        worker.stop();
        assert!(released.load(Ordering::Relaxed));
    }

    #[test]
    fn test_acquisition_without_frames_publishes_nothing() {
        let shutdown = AtomicBool::new(false);
        let latest = Snapshot::new(None);
        let mut source = Scripted {
            data: &[0x01, 0x02, 0x03, 0xFF],
            shutdown: &shutdown,
        };

        run_acquisition(&mut source, &latest, &shutdown);
        assert!(latest.load().is_none());
    }
}
