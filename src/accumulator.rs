//! Chunk accumulator actor
//!
//! Buffers captured chunks for one recording attempt under a maximum length.
//! The bookkeeping lives in [`ChunkBuffer`], a plain struct with no I/O; the
//! actor around it only moves messages in and out.
//!
//! ```text
//!   PUSH ──▶ accepting ──(timeUnits == max)──▶ completed ──▶ DATA(artifact)
//!   CLEAR ─┘     │                                  ▲
//!                └──────────────── STOP ────────────┘
//! ```

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::artifact::{Artifact, DataChunk};
use crate::format::CaptureFormat;
use crate::state_machine::{Event, SessionMailbox};

/// Messages the accumulator accepts.
#[derive(Debug)]
pub enum AccumulatorCommand {
    /// Append a chunk; the new time count goes back to `reply_to`.
    Push {
        chunk: DataChunk,
        reply_to: SessionMailbox,
    },
    Stop,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    Accepting,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Chunk stored; carries the new time count.
    Accepted(u32),
    /// Bound reached. The chunk was dropped and the buffer is now completed.
    Overflow,
    /// Buffer already completed; nothing happened.
    Ignored,
}

/// Ordered chunk storage with an admission gate.
///
/// Invariant: `time_units == chunks.len()` and `time_units <= max_time_units`.
#[derive(Debug)]
pub struct ChunkBuffer {
    state: AccumulatorState,
    chunks: Vec<DataChunk>,
    time_units: u32,
    max_time_units: u32,
    truncated: bool,
}

impl ChunkBuffer {
    pub fn new(max_time_units: u32) -> Self {
        Self {
            state: AccumulatorState::Accepting,
            chunks: Vec::with_capacity(max_time_units.min(1024) as usize),
            time_units: 0,
            max_time_units,
            truncated: false,
        }
    }

    pub fn state(&self) -> AccumulatorState {
        self.state
    }

    pub fn time_units(&self) -> u32 {
        self.time_units
    }

    pub fn max_time_units(&self) -> u32 {
        self.max_time_units
    }

    pub fn chunks(&self) -> &[DataChunk] {
        &self.chunks
    }

    pub fn push(&mut self, chunk: DataChunk) -> PushOutcome {
        if self.state == AccumulatorState::Completed {
            return PushOutcome::Ignored;
        }

        if self.time_units + 1 <= self.max_time_units {
            self.chunks.push(chunk);
            self.time_units += 1;
            PushOutcome::Accepted(self.time_units)
        } else {
            self.truncated = true;
            self.state = AccumulatorState::Completed;
            PushOutcome::Overflow
        }
    }

    /// Discard everything. Only effective while accepting.
    pub fn clear(&mut self) -> bool {
        if self.state != AccumulatorState::Accepting {
            return false;
        }
        self.chunks.clear();
        self.time_units = 0;
        true
    }

    /// Move to `completed`. Returns false if already there.
    pub fn complete(&mut self) -> bool {
        let was_accepting = self.state == AccumulatorState::Accepting;
        self.state = AccumulatorState::Completed;
        was_accepting
    }

    /// Join the chunks into the final artifact, leaving the buffer empty.
    pub fn finalize(&mut self, format: CaptureFormat) -> Artifact {
        self.state = AccumulatorState::Completed;
        let chunks = std::mem::take(&mut self.chunks);
        Artifact::assemble(format, chunks, self.truncated)
    }
}

/// Handle to a running accumulator, held by the session's supervisor.
pub struct AccumulatorHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<AccumulatorCommand>,
    join: JoinHandle<()>,
}

impl AccumulatorHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns false once the accumulator has finished.
    pub fn send(&self, command: AccumulatorCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    /// Close the mailbox and wait for the task. Queued commands are still
    /// processed; an accumulator that never completed produces no artifact.
    pub async fn destroy(self) {
        let AccumulatorHandle { id, tx, join } = self;
        drop(tx);
        if let Err(e) = join.await {
            log::error!("Accumulator {} task failed: {}", id, e);
        }
    }
}

/// Spawn a fresh accumulator generation. The artifact is sent to `result_to`
/// as [`Event::Data`].
pub fn spawn_accumulator(
    id: Uuid,
    format: CaptureFormat,
    max_time_units: u32,
    result_to: SessionMailbox,
) -> AccumulatorHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let buffer = ChunkBuffer::new(max_time_units);
    log::debug!(
        "Accumulator {}: spawned (max {} time units)",
        id,
        max_time_units
    );
    let join = tokio::spawn(run_accumulator(id, format, buffer, rx, result_to));
    AccumulatorHandle { id, tx, join }
}

async fn run_accumulator(
    id: Uuid,
    format: CaptureFormat,
    mut buffer: ChunkBuffer,
    mut rx: mpsc::UnboundedReceiver<AccumulatorCommand>,
    result_to: SessionMailbox,
) {
    while let Some(command) = rx.recv().await {
        match command {
            AccumulatorCommand::Push { chunk, reply_to } => match buffer.push(chunk) {
                PushOutcome::Accepted(time_units) => {
                    let _ = reply_to.send(Event::Time { id, time_units });
                }
                PushOutcome::Overflow => {
                    log::warn!(
                        "Accumulator {}: maximum of {} time units reached, dropping chunk",
                        id,
                        buffer.max_time_units()
                    );
                    break;
                }
                PushOutcome::Ignored => {}
            },
            AccumulatorCommand::Stop => {
                buffer.complete();
                break;
            }
            AccumulatorCommand::Clear => {
                buffer.clear();
                log::debug!("Accumulator {}: cleared", id);
            }
        }
    }

    if buffer.state() != AccumulatorState::Completed {
        log::debug!("Accumulator {}: mailbox closed before completion", id);
        return;
    }

    let artifact = buffer.finalize(format);
    log::info!(
        "Accumulator {}: finalized {} chunks, {} bytes",
        id,
        artifact.chunk_count(),
        artifact.len()
    );
    if result_to.send(Event::Data { id, artifact }).is_err() {
        log::debug!("Accumulator {}: session gone, artifact dropped", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> CaptureFormat {
        CaptureFormat::new("audio/ogg").unwrap()
    }

    fn chunk(n: u8) -> DataChunk {
        DataChunk::new(vec![n])
    }

    #[test]
    fn admission_bound_completes_on_overflowing_push() {
        let max = 4;
        let mut buffer = ChunkBuffer::new(max);

        for n in 1..=max {
            assert_eq!(buffer.push(chunk(n as u8)), PushOutcome::Accepted(n));
            assert_eq!(buffer.state(), AccumulatorState::Accepting);
        }

        assert_eq!(buffer.push(chunk(99)), PushOutcome::Overflow);
        assert_eq!(buffer.state(), AccumulatorState::Completed);
        assert_eq!(buffer.chunks().len(), max as usize);
        assert_eq!(buffer.time_units(), max);

        // completed is final
        assert_eq!(buffer.push(chunk(100)), PushOutcome::Ignored);
        assert_eq!(buffer.chunks().len(), max as usize);

        let artifact = buffer.finalize(format());
        assert_eq!(artifact.bytes(), &[1, 2, 3, 4]);
        assert!(artifact.truncated());
    }

    #[test]
    fn clear_is_idempotent() {
        let mut buffer = ChunkBuffer::new(10);
        buffer.push(chunk(1));
        buffer.push(chunk(2));

        for _ in 0..3 {
            assert!(buffer.clear());
            assert_eq!(buffer.time_units(), 0);
            assert!(buffer.chunks().is_empty());
            assert_eq!(buffer.state(), AccumulatorState::Accepting);
        }

        assert_eq!(buffer.push(chunk(3)), PushOutcome::Accepted(1));
    }

    #[test]
    fn clear_after_completion_is_refused() {
        let mut buffer = ChunkBuffer::new(10);
        buffer.push(chunk(1));
        assert!(buffer.complete());
        assert!(!buffer.clear());
        assert_eq!(buffer.time_units(), 1);
    }

    #[test]
    fn zero_bound_accepts_nothing() {
        let mut buffer = ChunkBuffer::new(0);
        assert_eq!(buffer.push(chunk(1)), PushOutcome::Overflow);
        assert!(buffer.finalize(format()).is_empty());
    }

    #[tokio::test]
    async fn push_replies_with_time_to_sender() {
        let (session_tx, mut session_rx) = mpsc::unbounded_channel();
        let (other_tx, mut other_rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let handle = spawn_accumulator(id, format(), 10, session_tx.clone());

        handle.send(AccumulatorCommand::Push {
            chunk: chunk(1),
            reply_to: other_tx,
        });
        handle.send(AccumulatorCommand::Push {
            chunk: chunk(2),
            reply_to: session_tx,
        });

        match other_rx.recv().await.unwrap() {
            Event::Time { id: got, time_units } => {
                assert_eq!(got, id);
                assert_eq!(time_units, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        match session_rx.recv().await.unwrap() {
            Event::Time { time_units, .. } => assert_eq!(time_units, 2),
            other => panic!("unexpected {:?}", other),
        }

        handle.destroy().await;
    }

    #[tokio::test]
    async fn stop_after_queued_pushes_keeps_every_chunk_in_order() {
        let (session_tx, mut session_rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let handle = spawn_accumulator(id, format(), 10, session_tx.clone());

        for n in [5u8, 6, 7] {
            handle.send(AccumulatorCommand::Push {
                chunk: chunk(n),
                reply_to: session_tx.clone(),
            });
        }
        handle.send(AccumulatorCommand::Stop);

        let mut times = Vec::new();
        let artifact = loop {
            match session_rx.recv().await.unwrap() {
                Event::Time { time_units, .. } => times.push(time_units),
                Event::Data { id: got, artifact } => {
                    assert_eq!(got, id);
                    break artifact;
                }
                other => panic!("unexpected {:?}", other),
            }
        };

        assert_eq!(times, vec![1, 2, 3]);
        assert_eq!(artifact.bytes(), &[5, 6, 7]);
        assert!(!artifact.truncated());
        handle.destroy().await;
    }

    #[tokio::test]
    async fn overflow_finalizes_without_stop() {
        let (session_tx, mut session_rx) = mpsc::unbounded_channel();
        let handle = spawn_accumulator(Uuid::new_v4(), format(), 2, session_tx.clone());

        for n in 1..=3u8 {
            handle.send(AccumulatorCommand::Push {
                chunk: chunk(n),
                reply_to: session_tx.clone(),
            });
        }

        let artifact = loop {
            if let Event::Data { artifact, .. } = session_rx.recv().await.unwrap() {
                break artifact;
            }
        };
        assert_eq!(artifact.chunk_count(), 2);
        assert_eq!(artifact.bytes(), &[1, 2]);
        assert!(artifact.truncated());

        // finished actors refuse further commands
        handle.join_for_test().await;
    }

    #[tokio::test]
    async fn destroy_without_stop_produces_no_artifact() {
        let (session_tx, mut session_rx) = mpsc::unbounded_channel();
        let handle = spawn_accumulator(Uuid::new_v4(), format(), 10, session_tx.clone());
        handle.send(AccumulatorCommand::Push {
            chunk: chunk(1),
            reply_to: session_tx.clone(),
        });
        handle.send(AccumulatorCommand::Clear);
        handle.destroy().await;
        drop(session_tx);

        while let Some(event) = session_rx.recv().await {
            assert!(
                !matches!(event, Event::Data { .. }),
                "unexpected artifact: {:?}",
                event
            );
        }
    }

    impl AccumulatorHandle {
        async fn join_for_test(self) {
            self.join.await.unwrap();
            assert!(self.tx.send(AccumulatorCommand::Stop).is_err());
        }
    }
}
