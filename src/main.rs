// EGM Edge Agent
//
// Orchestrator: loads configuration, wires the components in dependency
// order (durable sink, serial transport, poll engine, command ingress),
// and owns lifecycle and shutdown. The poll loop runs on its own OS
// thread; backend and store I/O run on the tokio runtime; the two sides
// talk only through bounded channels.

use egm_agent::config::Config;
use egm_agent::engine::PollEngine;
use egm_agent::ingress::CommandIngress;
use egm_agent::sink::{DurableSink, EventStore, Journal};
use egm_agent::transport::SasTransport;
use egm_agent::types::{AgentEvent, EngineCommand};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const COMMAND_MAILBOX: usize = 64;
const EVENT_CHANNEL: usize = 1024;
const HARD_STOP: Duration = Duration::from_secs(5);

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "agent.json".to_string());
    let config = match Config::load(std::path::Path::new(&config_path)) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, path = %config_path, "configuration rejected");
            return ExitCode::from(2);
        }
    };
    info!(port = %config.com_port, address = config.address, "egm agent starting");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "tokio runtime failed to start");
            return ExitCode::FAILURE;
        }
    };

    // Durable sink first: journal corruption must stop the agent before it
    // touches hardware.
    let store = match EventStore::connect(&config) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "store configuration rejected");
            return ExitCode::from(2);
        }
    };
    let (journal, backlog) = match Journal::open(&config.journal_path, config.max_journal_bytes) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, path = %config.journal_path.display(), "journal unusable");
            return ExitCode::from(2);
        }
    };
    let sink = DurableSink::new(store, journal, backlog);

    // A serial device that cannot be opened at startup is an unrecoverable
    // hardware error; link loss later is handled by the engine's reopen.
    let transport = match SasTransport::open(&config) {
        Ok(transport) => transport,
        Err(e) => {
            error!(error = %e, port = %config.com_port, "serial device unusable");
            return ExitCode::from(3);
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let (command_tx, command_rx) = mpsc::sync_channel::<EngineCommand>(COMMAND_MAILBOX);
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<AgentEvent>(EVENT_CHANNEL);

    let reopen_config = config.clone();
    let engine = PollEngine::new(
        config.clone(),
        transport,
        Box::new(move || SasTransport::open(&reopen_config)),
        command_rx,
        event_tx,
        shutdown.clone(),
    );
    let poll_thread = match std::thread::Builder::new()
        .name("sas-poll".to_string())
        .spawn(move || engine.run())
    {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "poll thread failed to start");
            return ExitCode::FAILURE;
        }
    };

    let sink_task = runtime.spawn(sink.run(event_rx, shutdown.clone()));
    let ingress = CommandIngress::new(config.clone(), command_tx, shutdown.clone());
    let ingress_task = runtime.spawn(ingress.run());

    runtime.block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "signal handler failed, stopping");
        }
    });
    info!("shutdown requested");
    shutdown.store(true, Ordering::Relaxed);

    // Let the poll thread finish its in-flight frame, bounded by the hard
    // stop; a stuck thread is abandoned, not joined.
    let deadline = Instant::now() + HARD_STOP;
    while !poll_thread.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    if poll_thread.is_finished() {
        let _ = poll_thread.join();
    } else {
        warn!("poll thread did not stop in time");
    }

    // The engine dropped its event sender; the sink drains the channel,
    // flushes to the journal, and exits.
    runtime.block_on(async {
        let _ = tokio::time::timeout(HARD_STOP, sink_task).await;
    });
    ingress_task.abort();
    runtime.shutdown_timeout(Duration::from_secs(1));

    info!("egm agent stopped");
    ExitCode::SUCCESS
}
