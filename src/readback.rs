//! Completion gating for asynchronous GPU readback.
//!
//! A mapped-buffer request may be observed before the transfer has finished;
//! the payload must be ignored until the map callback has signaled done. The
//! gate wraps the signal channel so that contract lives (and is tested) in
//! one place, independent of any GPU device.

use std::sync::mpsc::{Receiver, RecvError, TryRecvError};

/// Errors surfaced through a readback gate.
#[derive(Debug, thiserror::Error)]
pub enum ReadbackError {
    #[error("buffer mapping failed: {0}")]
    Map(String),
    #[error("readback abandoned before completion")]
    Abandoned,
}

/// One-shot completion gate fed by a buffer map callback.
///
/// `E` is the error type delivered by the callback (a `wgpu::BufferAsyncError`
/// in production, anything printable in tests).
pub(crate) struct CompletionGate<E> {
    rx: Receiver<Result<(), E>>,
    done: bool,
}

impl<E: std::fmt::Display> CompletionGate<E> {
    pub(crate) fn new(rx: Receiver<Result<(), E>>) -> Self {
        Self { rx, done: false }
    }

    /// Non-blocking check. Returns `Ok(false)` while the map callback has not
    /// fired yet; once it reports success the gate stays done.
    pub(crate) fn check(&mut self) -> Result<bool, ReadbackError> {
        if self.done {
            return Ok(true);
        }
        match self.rx.try_recv() {
            Ok(Ok(())) => {
                self.done = true;
                Ok(true)
            }
            Ok(Err(e)) => Err(ReadbackError::Map(e.to_string())),
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Disconnected) => Err(ReadbackError::Abandoned),
        }
    }

    /// Blocking variant: waits for the callback. The caller must have asked
    /// the device to make progress first, or this never returns.
    pub(crate) fn wait(&mut self) -> Result<(), ReadbackError> {
        if self.done {
            return Ok(());
        }
        match self.rx.recv() {
            Ok(Ok(())) => {
                self.done = true;
                Ok(())
            }
            Ok(Err(e)) => Err(ReadbackError::Map(e.to_string())),
            Err(RecvError) => Err(ReadbackError::Abandoned),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn test_not_ready_until_signaled() {
        let (tx, rx) = channel::<Result<(), String>>();
        let mut gate = CompletionGate::new(rx);

        // the transfer has not completed; the payload must not be consumed
        assert!(!gate.check().unwrap());
        assert!(!gate.check().unwrap());

        tx.send(Ok(())).unwrap();
        assert!(gate.check().unwrap());
        // completion is sticky
        assert!(gate.check().unwrap());
    }

    #[test]
    fn test_map_failure_is_an_error() {
        let (tx, rx) = channel::<Result<(), String>>();
        let mut gate = CompletionGate::new(rx);

        tx.send(Err("device lost".to_string())).unwrap();
        match gate.check() {
            Err(ReadbackError::Map(msg)) => assert!(msg.contains("device lost")),
            other => panic!("expected map error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_dropped_sender_means_abandoned() {
        let (tx, rx) = channel::<Result<(), String>>();
        let mut gate = CompletionGate::new(rx);
        drop(tx);

        assert!(matches!(gate.check(), Err(ReadbackError::Abandoned)));
    }

    #[test]
    fn test_blocking_wait_consumes_signal() {
        let (tx, rx) = channel::<Result<(), String>>();
        let mut gate = CompletionGate::new(rx);

        tx.send(Ok(())).unwrap();
        gate.wait().unwrap();
        assert!(gate.check().unwrap());
    }
}
