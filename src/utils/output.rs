/// Bounded capture of a child's stdout/stderr.
///
/// Each stream is drained on its own thread. Bytes past the cap are read and
/// discarded rather than left in the pipe, so a chatty program is never
/// blocked on a full pipe and misreported as a timeout.
use crossbeam_channel::{bounded, Receiver};
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapturedStream {
    pub bytes: Vec<u8>,
    pub truncated: bool,
    /// Everything the program wrote, including discarded bytes
    pub total_bytes: u64,
}

impl CapturedStream {
    /// Decode as UTF-8. A multi-byte character split by the cap is dropped
    /// rather than replaced, so the text never exceeds the cap.
    pub fn to_text(&self) -> String {
        let mut bytes = self.bytes.as_slice();
        if self.truncated {
            if let Err(e) = std::str::from_utf8(bytes) {
                if e.error_len().is_none() {
                    bytes = &bytes[..e.valid_up_to()];
                }
            }
        }
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Reader thread for one stream.
pub struct StreamCapture {
    shared: Arc<Mutex<CapturedStream>>,
    done: Receiver<()>,
    label: &'static str,
}

impl StreamCapture {
    pub fn spawn<R: Read + Send + 'static>(stream: R, limit: usize, label: &'static str) -> Self {
        let shared = Arc::new(Mutex::new(CapturedStream::default()));
        let (done_tx, done) = bounded(1);
        let sink = Arc::clone(&shared);

        thread::spawn(move || {
            drain(stream, limit, &sink);
            let _ = done_tx.send(());
        });

        Self {
            shared,
            done,
            label,
        }
    }

    /// Wait up to `grace` for EOF, then take whatever was captured.
    ///
    /// EOF can be delayed forever by a descendant that escaped the process
    /// group and still holds the pipe; the reader thread is then abandoned
    /// and exits when that process dies.
    pub fn finish(self, grace: Duration) -> CapturedStream {
        if self.done.recv_timeout(grace).is_err() {
            log::warn!(
                "{} still open {}ms after the step ended; keeping partial output",
                self.label,
                grace.as_millis()
            );
        }
        match self.shared.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

fn drain<R: Read>(mut stream: R, limit: usize, sink: &Mutex<CapturedStream>) {
    let mut chunk = [0u8; 8192];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("stream read ended: {}", e);
                break;
            }
        };
        let Ok(mut captured) = sink.lock() else {
            break;
        };
        captured.total_bytes += n as u64;
        let room = limit.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        let keep = n.min(room);
        captured.bytes.extend_from_slice(&chunk[..keep]);
    }
}
