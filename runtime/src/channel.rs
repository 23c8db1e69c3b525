//! A bounded channel between exactly one writer and one reader.
//!
//! Backpressure is expressed purely through suspension: writing to a full channel
//! suspends the writer until the reader frees a slot and reading from an empty channel
//! suspends the reader until the writer provides a value. No value is ever dropped or
//! reordered.
//!
//! The channel has no notion of time. It only stores the [Waker] of a suspended endpoint
//! and calls it once the endpoint can make progress, leaving it to the runtime to decide
//! when the woken task is polled again.
//!
//! # Single Writer, Single Reader
//!
//! [Sender] and [Receiver] do not implement [Clone], so a channel can only ever have one
//! writer and one reader. Each side therefore has at most one suspended task at a time.

use crate::Error;
use futures::future::poll_fn;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};
use tracing::trace;

struct Shared<T> {
    capacity: usize,
    buffer: VecDeque<T>,

    writer: Option<Waker>,
    reader: Option<Waker>,
}

/// Create a channel that buffers at most `capacity` values.
///
/// Returns [Error::InvalidCapacity] if `capacity` is zero.
pub fn bounded<T>(capacity: usize) -> Result<(Sender<T>, Receiver<T>), Error> {
    if capacity == 0 {
        return Err(Error::InvalidCapacity);
    }
    let shared = Arc::new(Mutex::new(Shared {
        capacity,
        buffer: VecDeque::with_capacity(capacity),
        writer: None,
        reader: None,
    }));
    Ok((
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    ))
}

/// Writing side of a [bounded] channel.
pub struct Sender<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Sender<T> {
    /// Append `value` to the channel, suspending while the channel is full.
    ///
    /// If there is space, the value is appended without yielding to the runtime. If the
    /// reader is suspended on an empty channel, it is woken.
    pub async fn write(&mut self, value: T) {
        let mut value = Some(value);
        poll_fn(|cx| self.poll_write(cx, &mut value)).await
    }

    fn poll_write(&mut self, cx: &mut Context<'_>, value: &mut Option<T>) -> Poll<()> {
        let reader = {
            let mut shared = self.shared.lock().unwrap();
            if shared.buffer.len() >= shared.capacity {
                trace!(capacity = shared.capacity, "channel full, writer suspended");
                shared.writer = Some(cx.waker().clone());
                return Poll::Pending;
            }
            let value = value.take().expect("write polled after completion");
            shared.buffer.push_back(value);
            assert!(
                shared.buffer.len() <= shared.capacity,
                "channel buffer exceeded capacity"
            );
            shared.reader.take()
        };
        if let Some(reader) = reader {
            trace!("waking reader");
            reader.wake();
        }
        Poll::Ready(())
    }

    /// Maximum number of values the channel can buffer.
    pub fn capacity(&self) -> usize {
        self.shared.lock().unwrap().capacity
    }

    /// Number of values currently buffered.
    pub fn len(&self) -> usize {
        self.shared.lock().unwrap().buffer.len()
    }

    /// Whether no values are currently buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reading side of a [bounded] channel.
pub struct Receiver<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Receiver<T> {
    /// Remove and return the oldest value, suspending while the channel is empty.
    ///
    /// If a value is buffered, it is returned without yielding to the runtime. If the
    /// writer is suspended on a full channel, it is woken.
    pub async fn read(&mut self) -> T {
        poll_fn(|cx| self.poll_read(cx)).await
    }

    fn poll_read(&mut self, cx: &mut Context<'_>) -> Poll<T> {
        let (value, writer) = {
            let mut shared = self.shared.lock().unwrap();
            let Some(value) = shared.buffer.pop_front() else {
                trace!("channel empty, reader suspended");
                shared.reader = Some(cx.waker().clone());
                return Poll::Pending;
            };
            (value, shared.writer.take())
        };
        if let Some(writer) = writer {
            trace!("waking writer");
            writer.wake();
        }
        Poll::Ready(value)
    }

    /// Maximum number of values the channel can buffer.
    pub fn capacity(&self) -> usize {
        self.shared.lock().unwrap().capacity
    }

    /// Number of values currently buffered.
    pub fn len(&self) -> usize {
        self.shared.lock().unwrap().buffer.len()
    }

    /// Whether no values are currently buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
