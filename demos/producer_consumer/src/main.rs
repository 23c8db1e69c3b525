//! Exchange values between a producer and a consumer in simulated time.
//!
//! A producer writes `items` integers to a bounded channel, sleeping `interval` before each
//! write. A consumer reads from the channel forever. Both run on the `deterministic` runtime,
//! so the whole exchange completes instantly in wall-clock time.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release -- --capacity 10 --items 5 --interval-ms 1000 --budget-ms 10000
//! ```
//!
//! ```txt
//! INFO lockstep_producer_consumer::application: sending now=1s value=0
//! INFO lockstep_producer_consumer::application: received now=1s value=0
//! ...
//! INFO lockstep_producer_consumer: run finished now=10s polls=12 producer=Some(Terminated) consumer=Some(WaitingOnChannel)
//! ```

mod application;

use clap::{value_parser, Arg, Command};
use lockstep_runtime::{channel, deterministic::Executor, Metrics, Runner, Spawner};
use std::{str::FromStr, time::Duration};
use tracing::{error, info, Level};

fn main() {
    // Parse arguments
    let matches = Command::new("lockstep-producer-consumer")
        .about("exchange values between a producer and a consumer in simulated time")
        .arg(
            Arg::new("capacity")
                .long("capacity")
                .default_value("10")
                .value_parser(value_parser!(usize))
                .help("Maximum number of values buffered in the channel"),
        )
        .arg(
            Arg::new("items")
                .long("items")
                .default_value("5")
                .value_parser(value_parser!(u64))
                .help("Number of values the producer writes"),
        )
        .arg(
            Arg::new("interval-ms")
                .long("interval-ms")
                .default_value("1000")
                .value_parser(value_parser!(u64))
                .help("Simulated milliseconds the producer sleeps before each write"),
        )
        .arg(
            Arg::new("budget-ms")
                .long("budget-ms")
                .default_value("10000")
                .value_parser(value_parser!(u64))
                .help("Simulated milliseconds to run for"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .help("Maximum log level (trace, debug, info, warn, error)"),
        )
        .get_matches();

    // Create logger
    let level = matches
        .get_one::<String>("log-level")
        .and_then(|level| Level::from_str(level).ok())
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    // Load configuration (defaults are always present)
    let capacity = matches.get_one::<usize>("capacity").copied().unwrap_or(10);
    let items = matches.get_one::<u64>("items").copied().unwrap_or(5);
    let interval = matches.get_one::<u64>("interval-ms").copied().unwrap_or(1_000);
    let interval = Duration::from_millis(interval);
    let budget = matches.get_one::<u64>("budget-ms").copied().unwrap_or(10_000);
    let budget = Duration::from_millis(budget);
    info!(capacity, items, ?interval, ?budget, "loaded configuration");

    // Construct channel
    let (sender, receiver) = match channel::bounded(capacity) {
        Ok(endpoints) => endpoints,
        Err(err) => {
            error!(?err, capacity, "failed to create channel");
            return;
        }
    };

    // Register processes
    let (executor, context, auditor) = Executor::default();
    context.with_label("producer").spawn(move |context| {
        application::produce(context, sender, items, interval)
    });
    context
        .with_label("consumer")
        .spawn(|context| application::consume(context, receiver));

    // Run until the budget is exhausted
    match executor.run(budget) {
        Ok(summary) => info!(
            now = ?summary.now,
            polls = summary.polls,
            producer = ?summary.state("producer"),
            consumer = ?summary.state("consumer"),
            state = %auditor.state(),
            "run finished"
        ),
        Err(err) => error!(?err, "run failed"),
    }
}
