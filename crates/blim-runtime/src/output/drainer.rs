//! Streams pipe output to writers.

use super::{OutputPipe, OutputRecord, OutputSource};
use crossbeam::channel::{self, Receiver, Sender};
use std::io::Write;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default window for draining records still queued after cancellation.
pub const DEFAULT_FINAL_DRAIN: Duration = Duration::from_millis(100);

type BoxWriter = Box<dyn Write + Send>;

/// Copies stdout records to one writer and stderr records to another.
///
/// Reads the pipe through its raw port. After [`cancel`](Self::cancel) the
/// drainer keeps copying whatever is still queued for up to the final drain
/// window, then exits.
pub struct OutputDrainer {
    cancel_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<(BoxWriter, BoxWriter)>>,
}

impl OutputDrainer {
    /// Starts draining `pipe` on a background thread.
    pub fn start(
        pipe: &Arc<OutputPipe>,
        stdout: BoxWriter,
        stderr: BoxWriter,
        final_drain: Duration,
    ) -> std::io::Result<Self> {
        let port = pipe.port();
        let (cancel_tx, cancel_rx) = channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("blim-output-drainer".into())
            .spawn(move || drain(&port, &cancel_rx, stdout, stderr, final_drain))?;
        Ok(Self {
            cancel_tx: Some(cancel_tx),
            handle: Some(handle),
        })
    }

    /// Requests the drainer to finish.
    pub fn cancel(&mut self) {
        self.cancel_tx.take();
    }

    /// Waits for the drainer thread and returns the writers.
    pub fn wait(mut self) -> Option<(BoxWriter, BoxWriter)> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(writers) => Some(writers),
            Err(_) => {
                warn!("output drainer panicked");
                None
            }
        }
    }

    /// Cancels and waits.
    pub fn stop(mut self) -> Option<(BoxWriter, BoxWriter)> {
        self.cancel();
        self.wait()
    }
}

impl Drop for OutputDrainer {
    fn drop(&mut self) {
        self.cancel_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn write_record(record: &OutputRecord, stdout: &mut BoxWriter, stderr: &mut BoxWriter) {
    let target = match record.source {
        OutputSource::Stdout => stdout,
        OutputSource::Stderr => stderr,
    };
    if let Err(e) = target.write_all(record.content.as_bytes()) {
        warn!(error = %e, source = %record.source, "failed to write script output");
    }
}

fn drain(
    port: &Receiver<OutputRecord>,
    cancel_rx: &Receiver<()>,
    mut stdout: BoxWriter,
    mut stderr: BoxWriter,
    final_drain: Duration,
) -> (BoxWriter, BoxWriter) {
    loop {
        crossbeam::select! {
            recv(cancel_rx) -> _ => break,
            recv(port) -> msg => match msg {
                Ok(record) => write_record(&record, &mut stdout, &mut stderr),
                Err(_) => {
                    let _ = stdout.flush();
                    let _ = stderr.flush();
                    return (stdout, stderr);
                }
            },
        }
    }

    let deadline = Instant::now() + final_drain;
    let mut drained = 0usize;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match port.recv_timeout(remaining.min(Duration::from_millis(10))) {
            Ok(record) => {
                write_record(&record, &mut stdout, &mut stderr);
                drained += 1;
            }
            Err(e) if e.is_disconnected() => break,
            Err(_) if port.is_empty() => break,
            Err(_) => {}
        }
    }
    debug!(drained, "output drainer finished");

    let _ = stdout.flush();
    let _ = stderr.flush();
    (stdout, stderr)
}
