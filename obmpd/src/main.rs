mod config;
mod producer;
mod supervisor;

use anyhow::{Context, Result};
use clap::Parser;
use config::{AppConfig, Cli};
use metrics_exporter_prometheus::PrometheusBuilder;
use obmpd_lib::bus;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_graceful::Shutdown;
use tracing::{debug, error, info, warn};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let cfg = match config::load(&cli) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("configuration error: {:#}", e);
            return ExitCode::from(2);
        }
    };
    if let Err(e) = config::init_tracing(&cli, &cfg) {
        eprintln!("configuration error: {:#}", e);
        return ExitCode::from(2);
    }

    match run(cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{:#}", e), "collector failed");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(cfg: Arc<AppConfig>) -> Result<()> {
    info!(
        collector = %cfg.collector_name,
        group = %cfg.collector_group,
        "starting bmp collector"
    );
    if cfg.daemon {
        warn!("daemon mode is not supported, staying in the foreground");
    }
    set_metrics(&cfg)?;

    let _pid_file = cfg
        .pid_file
        .as_ref()
        .map(|path| PidFile::write(path.clone()))
        .transpose()?;

    let shutdown = Shutdown::new(shutdown_signal());
    let (tx, rx) = bus::channel(bus::DEFAULT_CHANNEL_CAPACITY);

    let supervisor_task = shutdown.spawn_task_fn({
        let cfg = cfg.clone();
        let tx = tx.clone();
        move |guard| supervisor::run(cfg, tx, guard)
    });
    let producer_task = tokio::spawn(producer::handle(cfg.clone(), rx));
    drop(tx);

    tokio::select! {
        _ = shutdown.shutdown_with_limit(Duration::from_secs(15)) => {
            info!("shutdown signal handled, sessions quiesced");
        }
        result = supervisor_task => {
            match result {
                Ok(Ok(())) => info!("supervisor finished"),
                Ok(Err(e)) => return Err(e),
                Err(e) => anyhow::bail!("supervisor task panicked: {}", e),
            }
        }
    }

    // every bus sender is gone by now; the producer drains and flushes with
    // its own bounded wait
    if tokio::time::timeout(Duration::from_secs(10), producer_task)
        .await
        .is_err()
    {
        warn!("timed out waiting for the producer to flush");
    }
    info!("collector stopped");
    Ok(())
}

/// The full legacy signal set; any of them means "stop cleanly".
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).expect("signal handler");
    let mut terminate = signal(SignalKind::terminate()).expect("signal handler");
    let mut quit = signal(SignalKind::quit()).expect("signal handler");
    let mut hangup = signal(SignalKind::hangup()).expect("signal handler");
    let mut pipe = signal(SignalKind::pipe()).expect("signal handler");
    tokio::select! {
        _ = interrupt.recv() => debug!("received SIGINT"),
        _ = terminate.recv() => debug!("received SIGTERM"),
        _ = quit.recv() => debug!("received SIGQUIT"),
        _ = hangup.recv() => debug!("received SIGHUP"),
        _ = pipe.recv() => debug!("received SIGPIPE"),
    }
}

fn set_metrics(cfg: &AppConfig) -> Result<()> {
    let Some(addr) = cfg.metrics_listen else {
        return Ok(());
    };
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("cannot install the prometheus exporter")?;

    metrics::describe_counter!(
        "obmpd_bmp_messages_total",
        "Total BMP messages framed across all routers"
    );
    metrics::describe_counter!(
        "obmpd_invalid_frames_total",
        "BMP messages that failed framing"
    );
    metrics::describe_counter!(
        "obmpd_bus_records_dropped_total",
        "Records dropped because the bus channel was full"
    );
    metrics::describe_counter!(
        "obmpd_kafka_messages_total",
        "Kafka produce outcomes by status"
    );
    metrics::describe_counter!(
        "obmpd_admission_rejected_total",
        "Connections refused by the admission gates"
    );
    metrics::describe_counter!("obmpd_sessions_total", "Router sessions accepted");
    metrics::describe_counter!(
        "obmpd_collector_records_total",
        "Collector heartbeat/stopped records published"
    );
    metrics::describe_gauge!("obmpd_workers", "Live router sessions");
    metrics::describe_gauge!(
        "obmpd_cpu_utilization",
        "Rolling 1s system CPU utilization (0-1)"
    );
    info!(%addr, "prometheus exporter listening");
    Ok(())
}

/// One line, decimal PID, trailing newline; removed again on clean exit.
struct PidFile {
    path: std::path::PathBuf,
}

impl PidFile {
    fn write(path: std::path::PathBuf) -> Result<Self> {
        std::fs::write(&path, format!("{}\n", std::process::id()))
            .with_context(|| format!("cannot write pid file {}", path.display()))?;
        Ok(PidFile { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "cannot remove pid file");
        }
    }
}
