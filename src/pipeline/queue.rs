//! Bounded FIFO between the admission controller and the capture worker.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use serde::Serialize;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureOrigin {
    /// Periodic capture timer.
    Timer,
    /// Requested from the front end.
    Interactive,
}

/// A request to take one photo. Consumed exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureCommand {
    pub origin: CaptureOrigin,
    /// Milliseconds since the Unix epoch at admission.
    pub timestamp_ms: u64,
    /// Admission ticket, increasing in enqueue order.
    pub sequence: u64,
}

impl CaptureCommand {
    pub fn requested(&self) -> bool {
        self.origin == CaptureOrigin::Interactive
    }
}

pub fn capture_queue(capacity: usize) -> (CaptureSender, CaptureReceiver) {
    let (tx, rx) = bounded(capacity);
    (CaptureSender { tx, capacity }, CaptureReceiver { rx })
}

#[derive(Clone)]
pub struct CaptureSender {
    tx: Sender<CaptureCommand>,
    capacity: usize,
}

impl CaptureSender {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.tx.len())
    }

    /// Enqueue, waiting at most `timeout` for a slot. On failure the command
    /// is handed back and must not be retried synchronously.
    pub fn enqueue_within(
        &self,
        command: CaptureCommand,
        timeout: Duration,
    ) -> Result<(), CaptureCommand> {
        self.tx.send_timeout(command, timeout).map_err(|err| match err {
            SendTimeoutError::Timeout(cmd) | SendTimeoutError::Disconnected(cmd) => cmd,
        })
    }
}

pub struct CaptureReceiver {
    rx: Receiver<CaptureCommand>,
}

impl CaptureReceiver {
    /// Next command, or `None` after `timeout`. A disconnected queue also
    /// returns `None` so the caller's loop keeps its liveness cadence.
    pub fn next_within(&self, timeout: Duration) -> Option<CaptureCommand> {
        match self.rx.recv_timeout(timeout) {
            Ok(command) => Some(command),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(sequence: u64) -> CaptureCommand {
        CaptureCommand {
            origin: CaptureOrigin::Timer,
            timestamp_ms: 0,
            sequence,
        }
    }

    #[test]
    fn delivers_in_fifo_order() {
        let (tx, rx) = capture_queue(3);
        for seq in 1..=3 {
            tx.enqueue_within(command(seq), Duration::from_millis(1))
                .unwrap();
        }
        assert_eq!(tx.free_slots(), 0);
        let got: Vec<u64> = std::iter::from_fn(|| rx.next_within(Duration::from_millis(1)))
            .map(|cmd| cmd.sequence)
            .collect();
        assert_eq!(got, vec![1, 2, 3]);
        assert!(rx.is_empty());
    }

    #[test]
    fn full_queue_hands_the_command_back() {
        let (tx, _rx) = capture_queue(1);
        tx.enqueue_within(command(1), Duration::from_millis(1))
            .unwrap();
        let rejected = tx
            .enqueue_within(command(2), Duration::from_millis(5))
            .unwrap_err();
        assert_eq!(rejected.sequence, 2);
        assert_eq!(tx.len(), 1);
    }

    #[test]
    fn empty_queue_times_out() {
        let (_tx, rx) = capture_queue(2);
        assert!(rx.next_within(Duration::from_millis(5)).is_none());
    }
}
