//! Event delivery for streaming runs.
//!
//! [`EventSink`] wraps the caller's channel sender together with the run's
//! cancellation token. Sends never block a cancelled run: every emit is a
//! select between the channel and cancellation. A sink can be a no-op
//! (blocking `execute` path), so emit sites don't branch on stream mode.
//!
//! Channel-closure contract: the caller allocates the channel (buffered,
//! 64 recommended) and hands the sink to `execute_stream`; the runtime
//! drops every sink clone before returning, which closes the channel
//! exactly once.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use stream_event::StreamEvent;

/// Cancellation-aware sender for [`StreamEvent`]s. Cheap to clone; nested
/// agents and tool workers write to clones of the outermost sink.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<StreamEvent>>,
    cancel: CancellationToken,
}

impl EventSink {
    /// Wraps a channel sender with the run's cancellation token.
    pub fn new(tx: mpsc::Sender<StreamEvent>, cancel: CancellationToken) -> Self {
        Self {
            tx: Some(tx),
            cancel,
        }
    }

    /// Allocates a buffered channel and returns the sink plus the receiver.
    pub fn channel(
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx, cancel), rx)
    }

    /// A sink that drops every event. Used by the blocking `execute` path.
    pub fn noop() -> Self {
        Self {
            tx: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Whether events actually go anywhere.
    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Sends one event. Returns `false` when the sink is a no-op, the
    /// receiver is gone, or the run was cancelled mid-send.
    pub async fn emit(&self, event: StreamEvent) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = tx.send(event) => sent.is_ok(),
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_delivers_to_receiver() {
        let (sink, mut rx) = EventSink::channel(4, CancellationToken::new());
        assert!(
            sink.emit(StreamEvent::TextDelta {
                content: "x".into()
            })
            .await
        );
        drop(sink);
        let ev = rx.recv().await.expect("one event");
        assert_eq!(ev.kind(), "text_delta");
        assert!(rx.recv().await.is_none(), "channel closed after sink drop");
    }

    #[tokio::test]
    async fn noop_sink_reports_disabled() {
        let sink = EventSink::noop();
        assert!(!sink.is_enabled());
        assert!(
            !sink
                .emit(StreamEvent::TextDelta {
                    content: "x".into()
                })
                .await
        );
    }

    #[tokio::test]
    async fn cancelled_sink_refuses_to_block() {
        let cancel = CancellationToken::new();
        // Capacity 1, fill it so the next send would block.
        let (sink, _rx) = EventSink::channel(1, cancel.clone());
        assert!(
            sink.emit(StreamEvent::TextDelta {
                content: "a".into()
            })
            .await
        );
        cancel.cancel();
        assert!(
            !sink
                .emit(StreamEvent::TextDelta {
                    content: "b".into()
                })
                .await
        );
    }
}
