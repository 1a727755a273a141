//! Message subscriptions (pub/sub channels, queue consumers).
//!
//! A single producer task drains the backend's native stream into a bounded
//! queue; the consumer side is a [`futures::Stream`] plus a cancellable
//! [`Subscription::next_message`]. Dropping the subscription or calling
//! [`Subscription::unsubscribe`] aborts the producer, which drops the native
//! stream and with it the backend subscription.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cancel::race;
use crate::error::{Classify, Error};
use crate::policy::CallOptions;

/// Default queue depth between producer and consumer.
pub const DEFAULT_CAPACITY: usize = 64;

/// Live subscription yielding messages of type `T`.
pub struct Subscription<T> {
    label: String,
    rx: mpsc::Receiver<Result<T, Error>>,
    producer: JoinHandle<()>,
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("label", &self.label)
            .field("finished", &self.producer.is_finished())
            .finish()
    }
}

impl<T: Send + 'static> Subscription<T> {
    /// Start a producer task forwarding `stream` into the queue.
    ///
    /// Native errors are classified as they are forwarded.
    pub fn from_stream<S, E>(label: impl Into<String>, stream: S) -> Self
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        E: Classify + Send + 'static,
    {
        let label = label.into();
        let (tx, rx) = mpsc::channel(DEFAULT_CAPACITY);
        let task_label = label.clone();

        let producer = tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            while let Some(item) = stream.next().await {
                if tx.send(item.map_err(Classify::classify)).await.is_err() {
                    break;
                }
            }
            debug!(subscription = %task_label, "subscription producer finished");
        });

        debug!(subscription = %label, "subscription started");
        Self {
            label,
            rx,
            producer,
        }
    }

    /// Channel, queue or topic this subscription listens on.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Wait for the next message.
    ///
    /// Returns `Ok(None)` once the producer has finished and the queue is
    /// drained. Timeout and cancellation are returned as `Err`.
    pub async fn next_message(&mut self, call: &CallOptions) -> Result<Option<T>, Error> {
        let received = race(
            async { Ok::<_, std::convert::Infallible>(self.rx.recv().await) },
            call.timeout,
            call.signal.as_ref(),
        )
        .await
        .map_err(Classify::classify)?;

        received.transpose()
    }

    /// Stop the producer and drop the backend subscription.
    pub fn unsubscribe(self) {
        debug!(subscription = %self.label, "unsubscribed");
    }
}

impl<T> Stream for Subscription<T> {
    type Item = Result<T, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.producer.abort();
        self.rx.close();
    }
}
