//! posepipe - headless runner
//!
//! Loads a manager configuration (first argument, `.toml` or `.json`; the
//! built-in sample otherwise) and runs a small demo session: two tracked
//! hands averaged by a merger, a local head pipe distributed to a simulated
//! peer, and the peer's head pipe fed back over the loopback network.
//!
//! Usage: `posepipe [config.toml] [seconds]`

use anyhow::Context;
use posepipe::config::ManagerConfig;
use posepipe::pipeline::{
    ChannelEventBus, LoopbackNetwork, NetworkChannel, OpenPipeEvent, OwnerId, PipeIdFields,
    PipeKey, StaticOwnerRegistry, TransformManager, TransformUpdate, Transport, TRANSFORM_CHANNEL,
};
use posepipe::pipeline::modifiers::TracingSink;
use posepipe::Transformation;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOCAL: OwnerId = OwnerId(1);
const PEER: OwnerId = OwnerId(2);
const DEFAULT_RUN_SECONDS: f32 = 3.0;

fn init_logging(config: &ManagerConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match &config.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("log_file {:?} has no file name", path))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,posepipe=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(guard)
}

fn hand(src_id: u32) -> anyhow::Result<PipeIdFields> {
    Ok(PipeIdFields::new(src_id, 1, 0, 0, 0, 1, false)?)
}

fn head() -> anyhow::Result<PipeIdFields> {
    Ok(PipeIdFields::new(0, 2, 0, 0, 0, 1, false)?)
}

/// Wobble around `base` so the change interrupter lets values through.
fn wobble(base: [f32; 3], t: f32) -> Transformation {
    Transformation::from_position([base[0] + 0.05 * t.sin(), base[1], base[2] + 0.05 * t.cos()])
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => ManagerConfig::load(&path)
            .with_context(|| format!("Failed to load configuration {}", path))?,
        None => ManagerConfig::sample(),
    };
    let run_for = match args.next() {
        Some(secs) => secs
            .parse::<f32>()
            .with_context(|| format!("Invalid run time '{}'", secs))?,
        None => DEFAULT_RUN_SECONDS,
    };

    let _log_guard = init_logging(&config)?;
    tracing::info!("Starting posepipe ({} pipe templates)", config.pipes.len());

    // Manager and collaborators
    let mut manager = TransformManager::new(StaticOwnerRegistry::new(LOCAL).with_remote(PEER));
    manager.modifiers_mut().set_sink(Rc::new(TracingSink));
    manager
        .load_config(&config)
        .context("Configuration rejected")?;

    let (mut peer, network) = LoopbackNetwork::pair();
    manager.set_network(Box::new(network));
    let (events, bus) = ChannelEventBus::new();
    manager.set_event_bus(Box::new(bus));

    // Session setup goes through the event bus like a remote request would
    events.send(OpenPipeEvent::single(hand(0)?, 70, LOCAL, true))?;
    events.send(OpenPipeEvent::single(hand(1)?, 71, LOCAL, true))?;
    events.send(OpenPipeEvent::single(head()?, 50, LOCAL, false))?;
    events.send(OpenPipeEvent::single(head()?, 40, PEER, false))?;
    manager.step(0.0, 0);

    let hand_producers = [hand(0)?, hand(1)?]
        .iter()
        .map(|fields| {
            manager
                .get_pipe(fields, LOCAL)
                .and_then(|key| manager.producer(key))
                .with_context(|| format!("Hand pipe {} was not opened", fields.pack()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let local_head: PipeKey = manager
        .get_pipe(&head()?, LOCAL)
        .context("Head pipe was not opened")?;

    // Tracker thread feeding the hand pipes
    let running = Arc::new(AtomicBool::new(true));
    let tracker = {
        let running = Arc::clone(&running);
        std::thread::spawn(move || {
            let start = Instant::now();
            while running.load(Ordering::Relaxed) {
                let t = start.elapsed().as_secs_f32();
                for (i, producer) in hand_producers.iter().enumerate() {
                    let side = if i == 0 { -0.3 } else { 0.3 };
                    producer.push(wobble([side, 1.2, 0.4], t * 3.0));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        })
    };

    let tick = config.tick_interval();
    let dt = tick.as_secs_f32();
    let start = Instant::now();
    let mut received = 0usize;
    while start.elapsed().as_secs_f32() < run_for {
        let t = start.elapsed().as_secs_f32();
        manager.push(local_head, wobble([0.0, 0.0, 0.0], t))?;

        let update = TransformUpdate {
            owner: PEER.0,
            pipe_id: head()?.pack(),
            value: wobble([1.0, 0.0, 2.0], t),
        };
        peer.send(update.to_message(), TRANSFORM_CHANNEL, Transport::Udp);

        manager.step(dt, 0);
        received += peer.pop_all(TRANSFORM_CHANNEL).len();
        std::thread::sleep(tick);
    }

    running.store(false, Ordering::Relaxed);
    if tracker.join().is_err() {
        tracing::error!("Tracker thread panicked");
    }

    let stats = manager.stats();
    tracing::info!(
        cycles = stats.cycles,
        executions = stats.executions,
        merges = stats.merger_emissions,
        network_in = stats.network_updates,
        dropped = stats.dropped_updates,
        network_out = received,
        "Session finished"
    );

    let log = manager.modifiers().transform_log().clone();
    manager.shutdown();

    if let Some(path) = &config.transform_log_file {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create transform log {:?}", path))?;
        let written = log
            .dump(std::io::BufWriter::new(file))
            .context("Failed to write transform log")?;
        tracing::info!("Wrote {} transform log records to {:?}", written, path);
    }

    tracing::info!("Shutting down...");
    Ok(())
}
