//! Suspension points
//!
//! A guest instance runs synchronously from its own point of view, but some
//! host operations (native-backed lookups, pipe reads) have to wait. Those
//! operations return a [`Completion`]: either the value is already there, or
//! a boxed future that the bridge awaits while wasmtime parks the guest on
//! its fiber. Awaiting a ready completion never yields.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

pub use futures::future::BoxFuture;

/// Result of an operation that may have to suspend
pub enum Completion<'a, T> {
    /// Finished synchronously
    Ready(Option<T>),
    /// Needs asynchronous backing-store I/O
    Pending(BoxFuture<'a, T>),
}

impl<'a, T> Completion<'a, T> {
    pub fn ready(value: T) -> Self {
        Completion::Ready(Some(value))
    }

    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'a,
    {
        Completion::Pending(Box::pin(future))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Completion::Ready(_))
    }

    /// Take the value if the operation already finished, otherwise hand the
    /// completion back untouched.
    pub fn now(self) -> Result<T, Self> {
        match self {
            Completion::Ready(Some(value)) => Ok(value),
            other => Err(other),
        }
    }

    /// Transform the eventual value without forcing a suspension.
    pub fn map<U, F>(self, f: F) -> Completion<'a, U>
    where
        F: FnOnce(T) -> U + Send + 'a,
        T: 'a,
    {
        match self {
            Completion::Ready(value) => Completion::Ready(value.map(f)),
            Completion::Pending(future) => Completion::pending(async move { f(future.await) }),
        }
    }
}

// The ready value is moved out by value, never pinned in place.
impl<T> Unpin for Completion<'_, T> {}

impl<T> Future for Completion<'_, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        match self.get_mut() {
            Completion::Ready(value) => match value.take() {
                Some(value) => Poll::Ready(value),
                None => panic!("Completion polled after it resolved"),
            },
            Completion::Pending(future) => future.as_mut().poll(cx),
        }
    }
}

impl<T> std::fmt::Debug for Completion<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Ready(_) => f.write_str("Completion::Ready"),
            Completion::Pending(_) => f.write_str("Completion::Pending"),
        }
    }
}
