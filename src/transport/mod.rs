pub mod accumulator;
pub mod http;
pub mod sse;

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;
use crate::events::Event;

pub use accumulator::{RunAccumulator, TerminalOutcome};
pub use http::HttpAgentClient;
pub use sse::{decode_sse, encode_sse, sse_body};

/// A stream of decoded events, whatever the transport underneath.
pub type BoxEventStream = Pin<Box<dyn Stream<Item = Result<Event, AgentError>> + Send>>;

/// Ordered push channel for one run. The engine writes to the sink, exactly
/// one consumer reads the stream.
pub fn event_channel(capacity: usize) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let cancel = CancellationToken::new();
    (
        EventSink { tx },
        EventStream {
            rx,
            cancel,
        },
    )
}

/// Producer half. Stamps each event with the send time.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    /// Fails with `Cancelled` once the consumer is gone.
    pub async fn send(&self, event: Event) -> Result<(), AgentError> {
        self.tx
            .send(event.stamped())
            .await
            .map_err(|_| AgentError::Cancelled)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half. Dropping it, or calling [`EventStream::cancel`], stops the run.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
    cancel: CancellationToken,
}

impl EventStream {
    /// Token the producer should watch. Cancelled by [`EventStream::cancel`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the run mid-stream. Events already queued are still readable.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn boxed(self) -> BoxEventStream {
        use futures::StreamExt;
        Box::pin(self.map(Ok))
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
