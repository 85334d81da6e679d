//! Real-time PCM scheduler.
//!
//! Streams a PCM buffer to the outbound media socket in fixed 20 ms frames.
//! Each frame's send deadline is computed from the stream start
//! (`start + index * 20 ms`), never by chaining interval timers: chained
//! timers accumulate scheduler error linearly and produce audible clicks
//! within half a minute.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

/// Frame cadence on the media socket.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Suspend scheduling when this much is queued on the socket...
pub const HIGH_WATER_BYTES: usize = 64 * 1024;

/// ...and resume once the queue drains below this.
pub const LOW_WATER_BYTES: usize = 32 * 1024;

/// Poll cadence while suspended on backpressure or draining.
pub const BACKPRESSURE_POLL: Duration = Duration::from_millis(5);

/// Upper bound on the final drain wait, so a hangup immediately after the
/// last frame cannot park the caller.
pub const DRAIN_DEADLINE: Duration = Duration::from_millis(500);

/// Why a stream resolved. None of these are errors: cancellation and a
/// concurrently-closed socket are ordinary call-lifecycle outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    SocketClosed,
}

/// Writer-side view of the outbound queue.
pub struct SinkQueue {
    pub rx: mpsc::UnboundedReceiver<Vec<u8>>,
    buffered: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
}

impl SinkQueue {
    /// Account for `len` bytes having left the queue onto the wire.
    pub fn complete_write(&self, len: usize) {
        self.buffered.fetch_sub(len, Ordering::SeqCst);
    }

    /// Mark the socket gone; the scheduler observes this at the next frame
    /// boundary and resolves cleanly.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Scheduler-side handle for the outbound media socket.
///
/// The socket itself is written only by its writer task; the scheduler
/// observes queue depth through the shared byte counter.
#[derive(Clone)]
pub struct OutboundSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    buffered: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
}

impl OutboundSink {
    /// Create the sink/queue pair. The queue half belongs to the socket
    /// writer task.
    pub fn channel() -> (OutboundSink, SinkQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicBool::new(true));
        (
            OutboundSink {
                tx,
                buffered: buffered.clone(),
                open: open.clone(),
            },
            SinkQueue { rx, buffered, open },
        )
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn enqueue(&self, frame: Vec<u8>) -> bool {
        self.buffered.fetch_add(frame.len(), Ordering::SeqCst);
        if self.tx.send(frame).is_err() {
            self.open.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }
}

/// Stream `pcm` (mono s16le at `sample_rate`) to the sink in real time.
///
/// `cancelled` is checked at every frame boundary and inside the
/// backpressure poll; on cancel the stream resolves immediately without
/// error. A closed socket likewise resolves cleanly, since the call may
/// have ended concurrently.
pub async fn stream_pcm<F>(
    sink: &OutboundSink,
    pcm: &[u8],
    sample_rate: u32,
    cancelled: F,
) -> StreamOutcome
where
    F: Fn() -> bool,
{
    // 20 ms of mono 16-bit audio.
    let frame_bytes = (sample_rate as usize / 50) * 2;
    if frame_bytes == 0 || pcm.is_empty() {
        return StreamOutcome::Completed;
    }

    let start = tokio::time::Instant::now();
    for (index, frame) in pcm.chunks(frame_bytes).enumerate() {
        if cancelled() {
            return StreamOutcome::Cancelled;
        }
        if !sink.is_open() {
            return StreamOutcome::SocketClosed;
        }

        // Backpressure: past the high-water mark, poll until the writer has
        // drained below the low-water mark.
        if sink.buffered_bytes() > HIGH_WATER_BYTES {
            loop {
                tokio::time::sleep(BACKPRESSURE_POLL).await;
                if cancelled() {
                    return StreamOutcome::Cancelled;
                }
                if !sink.is_open() {
                    return StreamOutcome::SocketClosed;
                }
                if sink.buffered_bytes() < LOW_WATER_BYTES {
                    break;
                }
            }
        }

        // Absolute deadline for this frame; a late scheduler sends
        // immediately rather than pushing every later frame out.
        let target = start + FRAME_INTERVAL * index as u32;
        tokio::time::sleep_until(target).await;

        if !sink.enqueue(frame.to_vec()) {
            return StreamOutcome::SocketClosed;
        }
    }

    // Drain: wait for the wire to catch up so an immediate hangup does not
    // clip the final syllable.
    let drain_deadline = tokio::time::Instant::now() + DRAIN_DEADLINE;
    while sink.buffered_bytes() > 0 {
        if cancelled() {
            return StreamOutcome::Cancelled;
        }
        if !sink.is_open() || tokio::time::Instant::now() >= drain_deadline {
            break;
        }
        tokio::time::sleep(BACKPRESSURE_POLL).await;
    }

    debug!(
        frames = pcm.len().div_ceil(frame_bytes),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "pcm stream completed"
    );
    StreamOutcome::Completed
}
