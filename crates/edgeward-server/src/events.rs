//! Progress event delivery for one orchestrator operation
//!
//! A bounded single-producer/single-consumer channel. The producer side enforces step
//! ordering and a single terminal event; the consumer side also carries the operation's
//! join handle so callers can await the final outcome.

use std::pin::Pin;
use std::task::{Context, Poll};

use edgeward_protocol::{EventStatus, ProgressEvent, SIMULATION_MARKER};
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::orchestrator::{OperationOutcome, OrchestratorError};

/// Buffer size of the event channel; an operation emits at most five events
const EVENT_BUFFER: usize = 8;

/// Producer half, owned by the running operation
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressEvent>,
    simulated: bool,
    last_step: u8,
    connected: bool,
}

pub(crate) fn channel(simulated: bool) -> (ProgressSender, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let sender = ProgressSender {
        tx,
        simulated,
        last_step: 0,
        connected: true,
    };
    (sender, rx)
}

impl ProgressSender {
    /// A step completed and more follow
    pub async fn progress(&mut self, step: u8, message: impl Into<String>) {
        self.emit(step, message.into(), EventStatus::InProgress).await;
    }

    /// Terminal success; consumes the sender so nothing can follow it
    pub async fn success(mut self, step: u8, message: impl Into<String>) {
        self.emit(step, message.into(), EventStatus::Success).await;
    }

    /// Terminal failure at `step`
    pub async fn failure(mut self, step: u8, message: impl Into<String>) {
        self.emit(step, message.into(), EventStatus::Failure).await;
    }

    async fn emit(&mut self, step: u8, message: String, status: EventStatus) {
        debug_assert!(step > self.last_step, "progress steps must strictly increase");
        self.last_step = step;

        let message = if self.simulated {
            format!("{SIMULATION_MARKER} {message}")
        } else {
            message
        };

        if !self.connected {
            return;
        }

        let event = ProgressEvent {
            step,
            message,
            status,
            simulated: self.simulated,
        };

        // A gone subscriber only loses delivery; the operation keeps running
        if self.tx.send(event).await.is_err() {
            tracing::debug!(step, "Progress subscriber disconnected, continuing without events");
            self.connected = false;
        }
    }
}

/// Consumer half handed to the caller of a register/deregister operation
///
/// Dropping the stream does not cancel the operation.
pub struct ProgressStream {
    rx: mpsc::Receiver<ProgressEvent>,
    handle: JoinHandle<OperationOutcome>,
}

impl ProgressStream {
    pub(crate) fn new(rx: mpsc::Receiver<ProgressEvent>, handle: JoinHandle<OperationOutcome>) -> Self {
        Self { rx, handle }
    }

    /// Next event, or `None` once the terminal event has been delivered
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Stop listening and wait for the operation's outcome
    pub async fn outcome(self) -> Result<OperationOutcome, OrchestratorError> {
        let Self { rx, handle } = self;
        drop(rx);
        join(handle).await
    }

    /// Drain every event, then wait for the outcome
    pub async fn collect(mut self) -> Result<(Vec<ProgressEvent>, OperationOutcome), OrchestratorError> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        let outcome = join(self.handle).await?;
        Ok((events, outcome))
    }

    /// Drop the subscriber side immediately and keep only the running operation
    pub fn detach(self) -> JoinHandle<OperationOutcome> {
        self.handle
    }
}

async fn join(handle: JoinHandle<OperationOutcome>) -> Result<OperationOutcome, OrchestratorError> {
    handle
        .await
        .map_err(|e| OrchestratorError::Internal(format!("Operation task failed: {e}")))
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
