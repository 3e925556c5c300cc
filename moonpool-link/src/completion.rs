//! Single-assignment completion handles.
//!
//! Every caller-facing operation returns a [`Completion`] right away. The
//! engine task keeps the matching [`Completer`] and fulfils it exactly once.
//! Completing never blocks the engine: it is a oneshot send.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{LinkError, LinkResult};

/// Create a connected completer/completion pair.
pub fn completion<T>() -> (Completer<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Completer { tx },
        Completion {
            inner: CompletionInner::Pending(rx),
        },
    )
}

/// Producer half of a completion. Owned by the engine.
#[derive(Debug)]
pub struct Completer<T> {
    tx: oneshot::Sender<LinkResult<T>>,
}

impl<T> Completer<T> {
    /// Fulfil the completion.
    ///
    /// Returns the result back when the caller already dropped its handle,
    /// so the engine can reclaim anything it was about to hand over.
    pub fn complete(self, result: LinkResult<T>) -> Result<(), LinkResult<T>> {
        self.tx.send(result)
    }

    /// Whether the caller dropped its [`Completion`].
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a completion: a `Send` future resolving to the result.
///
/// If the engine goes away without answering, the completion resolves to a
/// [`ErrorKind::Cancelled`](crate::ErrorKind::Cancelled) error.
#[derive(Debug)]
#[must_use = "completions do nothing unless awaited"]
pub struct Completion<T> {
    inner: CompletionInner<T>,
}

#[derive(Debug)]
enum CompletionInner<T> {
    Pending(oneshot::Receiver<LinkResult<T>>),
    Ready(Option<LinkResult<T>>),
}

impl<T> Completion<T> {
    /// A completion that is already resolved.
    pub fn ready(result: LinkResult<T>) -> Self {
        Self {
            inner: CompletionInner::Ready(Some(result)),
        }
    }

    /// A completion already failed with `error`.
    pub fn failed(error: LinkError) -> Self {
        Self::ready(Err(error))
    }
}

// The result is only ever moved out, never pinned.
impl<T> Unpin for Completion<T> {}

impl<T> Future for Completion<T> {
    type Output = LinkResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            CompletionInner::Ready(result) => Poll::Ready(result.take().unwrap_or_else(|| {
                Err(LinkError::illegal_state("completion polled after it resolved"))
            })),
            CompletionInner::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(LinkError::cancelled(
                    "link manager stopped before completing the operation",
                ))),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
