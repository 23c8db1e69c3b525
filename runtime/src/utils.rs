//! Utility functions for interacting with any runtime.

use crate::Error;
use futures::channel::oneshot;
use prometheus_client::metrics::gauge::Gauge;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// Converts bytes to a hexadecimal string.
pub(crate) fn hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter() {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Handle to a spawned task.
///
/// Resolves to the output of the task or to [Error::Closed] if the task was
/// abandoned before it completed.
pub struct Handle<T>
where
    T: Send + 'static,
{
    receiver: oneshot::Receiver<T>,
}

impl<T> Handle<T>
where
    T: Send + 'static,
{
    pub(crate) fn init<F>(f: F, running: Gauge) -> (impl Future<Output = ()>, Self)
    where
        F: Future<Output = T> + Send + 'static,
    {
        // Increment running counter (decremented when the task completes or is dropped)
        running.inc();
        let running = Running { gauge: running };

        // Forward the result once the task completes
        let (sender, receiver) = oneshot::channel();
        let wrapped = async move {
            let result = f.await;
            drop(running);
            let _ = sender.send(result);
        };
        (wrapped, Self { receiver })
    }
}

/// Decrements the running gauge of a task exactly once.
struct Running {
    gauge: Gauge,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

impl<T> Future for Handle<T>
where
    T: Send + 'static,
{
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|res| res.map_err(|_| Error::Closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{executor::block_on, FutureExt};

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[]), "");
        assert_eq!(hex(&[0x00, 0x0f, 0xab, 0xff]), "000fabff");
    }

    #[test]
    fn test_handle_resolves_output() {
        let running = Gauge::default();
        let (task, handle) = Handle::init(async { 7u32 }, running.clone());
        assert_eq!(running.get(), 1);
        block_on(task);
        assert_eq!(running.get(), 0);
        assert_eq!(handle.now_or_never(), Some(Ok(7)));
    }

    #[test]
    fn test_handle_closed_when_task_dropped() {
        let running = Gauge::default();
        let (task, handle) = Handle::init(async { 7u32 }, running.clone());
        assert_eq!(running.get(), 1);
        drop(task);
        assert_eq!(running.get(), 0);
        assert_eq!(handle.now_or_never(), Some(Err(Error::Closed)));
    }

    #[test]
    fn test_running_gauge_decremented_once() {
        let running = Gauge::default();
        let (pending, _pending) = Handle::init(futures::future::pending::<()>(), running.clone());
        let (task, handle) = Handle::init(async { 1u8 }, running.clone());
        assert_eq!(running.get(), 2);

        // Poll the pending task once, then abandon it
        let mut pending = Box::pin(pending);
        assert!(pending.as_mut().now_or_never().is_none());
        drop(pending);
        assert_eq!(running.get(), 1);

        // Completed tasks are not decremented again when dropped
        block_on(task);
        assert_eq!(running.get(), 0);
        assert_eq!(handle.now_or_never(), Some(Ok(1)));
    }
}
