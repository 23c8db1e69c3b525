use lockstep_macros::test_traced;
use lockstep_runtime::{
    channel::{self, Receiver, Sender},
    deterministic::{Context, Executor},
    Clock, Metrics, Runner, Spawner, State,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

type Received = Arc<Mutex<Vec<(Duration, u32)>>>;

fn producer(context: Context, mut sender: Sender<u32>, items: u32, interval: Duration) {
    context.with_label("producer").spawn(move |context| async move {
        for i in 0..items {
            context.sleep(interval).await;
            sender.write(i).await;
        }
    });
}

fn consumer(context: Context, mut receiver: Receiver<u32>) -> Received {
    let received = Received::default();
    context.with_label("consumer").spawn({
        let received = received.clone();
        move |context| async move {
            loop {
                let value = receiver.read().await;
                received.lock().unwrap().push((context.current(), value));
            }
        }
    });
    received
}

#[test_traced("INFO")]
fn test_five_items_one_second_apart() {
    let (executor, context, _) = Executor::default();
    let (sender, receiver) = channel::bounded(10).unwrap();
    producer(context.clone(), sender, 5, Duration::from_secs(1));
    let received = consumer(context, receiver);

    let summary = executor.run(Duration::from_secs(10)).unwrap();
    let expected = (0..5u32)
        .map(|i| (Duration::from_secs(u64::from(i) + 1), i))
        .collect::<Vec<_>>();
    assert_eq!(*received.lock().unwrap(), expected);
    assert_eq!(summary.now, Duration::from_secs(10));
    assert_eq!(summary.state("producer"), Some(State::Terminated));
    assert_eq!(summary.state("consumer"), Some(State::WaitingOnChannel));
}

#[test_traced("INFO")]
fn test_budget_cuts_producer_short() {
    let (executor, context, _) = Executor::default();
    let (sender, receiver) = channel::bounded(10).unwrap();
    producer(context.clone(), sender, 5, Duration::from_secs(1));
    let received = consumer(context, receiver);

    let summary = executor.run(Duration::from_millis(2_500)).unwrap();
    let values = received
        .lock()
        .unwrap()
        .iter()
        .map(|(_, v)| *v)
        .collect::<Vec<_>>();
    assert_eq!(values, vec![0, 1]);
    assert_eq!(summary.state("producer"), Some(State::WaitingOnTime));
    assert_eq!(summary.state("consumer"), Some(State::WaitingOnChannel));
}

#[test_traced("INFO")]
fn test_slow_consumer_applies_backpressure() {
    let (executor, context, _) = Executor::default();
    let (mut sender, mut receiver) = channel::bounded(2).unwrap();
    let written = Received::default();
    let received = Received::default();

    // Producer writes as fast as the channel allows
    context.with_label("producer").spawn({
        let written = written.clone();
        move |context| async move {
            for i in 0..6u32 {
                sender.write(i).await;
                written.lock().unwrap().push((context.current(), i));
            }
        }
    });

    // Consumer takes one value per second
    context.with_label("consumer").spawn({
        let received = received.clone();
        move |context| async move {
            loop {
                context.sleep(Duration::from_secs(1)).await;
                assert!(receiver.len() <= 2);
                let value = receiver.read().await;
                received.lock().unwrap().push((context.current(), value));
            }
        }
    });
    executor.run(Duration::from_secs(10)).unwrap();

    // First two writes fill the buffer immediately, the rest follow each read
    let secs = |s| Duration::from_secs(s);
    assert_eq!(
        *written.lock().unwrap(),
        vec![
            (secs(0), 0),
            (secs(0), 1),
            (secs(1), 2),
            (secs(2), 3),
            (secs(3), 4),
            (secs(4), 5),
        ]
    );
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 6);
    for (i, (time, value)) in received.iter().enumerate() {
        assert_eq!(*value, i as u32);
        assert_eq!(*time, secs(i as u64 + 1));
    }
}

#[test]
fn test_runs_are_reproducible() {
    let run = || {
        let (executor, context, auditor) = Executor::default();
        let (sender, receiver) = channel::bounded(3).unwrap();
        producer(context.clone(), sender, 20, Duration::from_millis(250));
        let received = consumer(context, receiver);
        let summary = executor.run(Duration::from_secs(10)).unwrap();
        let received = received.lock().unwrap().clone();
        (auditor.state(), summary, received)
    };
    let first = run();
    assert_eq!(first.2.len(), 20);
    assert_eq!(run(), first);
}

#[test]
fn test_invalid_capacity() {
    assert!(channel::bounded::<u32>(0).is_err());
}
