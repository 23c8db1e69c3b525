//! Producer and consumer logic exchanged over a bounded channel.

use lockstep_runtime::{
    channel::{Receiver, Sender},
    Clock,
};
use std::time::Duration;
use tracing::info;

/// Write `items` values (`0..items`), sleeping for `interval` before each one.
///
/// Returns the number of values written.
pub async fn produce<E: Clock>(
    context: E,
    mut sender: Sender<u64>,
    items: u64,
    interval: Duration,
) -> u64 {
    for i in 0..items {
        context.sleep(interval).await;
        info!(now = ?context.current(), value = i, "sending");
        sender.write(i).await;
    }
    items
}

/// Read and log values forever.
pub async fn consume<E: Clock>(context: E, mut receiver: Receiver<u64>) {
    loop {
        let value = receiver.read().await;
        info!(now = ?context.current(), value, "received");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use lockstep_macros::test_traced;
    use lockstep_runtime::{channel, deterministic::Executor, Metrics, Runner, Spawner, State};

    #[test_traced("INFO")]
    fn test_produce_and_consume() {
        let (executor, context, _) = Executor::default();
        let (sender, receiver) = channel::bounded(10).unwrap();
        let producer = context.with_label("producer").spawn(|context| {
            produce(context, sender, 5, Duration::from_secs(1))
        });
        context
            .with_label("consumer")
            .spawn(|context| consume(context, receiver));

        let summary = executor.run(Duration::from_secs(10)).unwrap();
        assert_eq!(summary.now, Duration::from_secs(10));
        assert_eq!(summary.state("producer"), Some(State::Terminated));
        assert_eq!(summary.state("consumer"), Some(State::WaitingOnChannel));
        assert_eq!(producer.now_or_never(), Some(Ok(5)));
    }
}
