//! Listener and worker lifecycle: accepts router connections, enforces the
//! admission gates, emits collector heartbeats, and quiesces every session
//! on shutdown. Workers are owned one-way: the supervisor keeps a handle
//! and reads status flags; workers never see the supervisor.

use crate::config::AppConfig;
use anyhow::{Context, Result};
use metrics::{counter, gauge};
use obmpd_lib::bus::{BusRecord, BusSender};
use obmpd_lib::envelope::{
    CaptureTime, EnvelopeEncoder, DEFAULT_MAJOR_VERSION, DEFAULT_MINOR_VERSION,
    MSG_TYPE_COLLECTOR_HEARTBEAT, MSG_TYPE_COLLECTOR_STOPPED,
};
use obmpd_lib::identity::RouterIdentity;
use obmpd_lib::topic::{self, HostnameResolver, TopicBuilder};
use obmpd_lib::worker::{self, WorkerContext, WorkerShared, WorkerStatus};
use socket2::{Domain, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_graceful::ShutdownGuard;
use tracing::{debug, info, warn};

/// Accept poll cadence; also bounds how fast stop requests are observed.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Back-off after a refused admission.
const ADMISSION_BACKOFF: Duration = Duration::from_secs(1);

struct WorkerEntry {
    shared: Arc<WorkerShared>,
    handle: JoinHandle<()>,
    addr: SocketAddr,
}

/// Rolling 1 s CPU utilization sample, shared with the monitor task as
/// raw f32 bits.
#[derive(Clone)]
struct CpuGauge(Arc<AtomicU32>);

impl CpuGauge {
    fn new() -> Self {
        CpuGauge(Arc::new(AtomicU32::new(0f32.to_bits())))
    }

    /// Utilization as a fraction in [0, 1].
    fn load(&self) -> f64 {
        f32::from_bits(self.0.load(Ordering::Relaxed)) as f64
    }

    fn store(&self, fraction: f32) {
        self.0.store(fraction.to_bits(), Ordering::Relaxed);
    }
}

pub async fn run(cfg: Arc<AppConfig>, tx: BusSender, guard: ShutdownGuard) -> Result<()> {
    let listener_v4 = cfg
        .listen_v4
        .map(|addr| bind_listener(addr).with_context(|| format!("cannot listen on {}", addr)))
        .transpose()?;
    let listener_v6 = cfg
        .listen_v6
        .map(|addr| bind_listener(addr).with_context(|| format!("cannot listen on {}", addr)))
        .transpose()?;
    if let Some(addr) = cfg.listen_v4 {
        info!(%addr, "listening for bmp routers");
    }
    if let Some(addr) = cfg.listen_v6 {
        info!(%addr, "listening for bmp routers");
    }
    serve(cfg, tx, guard, listener_v4, listener_v6).await
}

/// The accept/heartbeat/reap loop, split from `run` so tests can hand in
/// pre-bound listeners.
async fn serve(
    cfg: Arc<AppConfig>,
    tx: BusSender,
    guard: ShutdownGuard,
    mut listener_v4: Option<TcpListener>,
    mut listener_v6: Option<TcpListener>,
) -> Result<()> {
    let cpu = CpuGauge::new();
    guard.spawn_task(cpu_monitor(cpu.clone(), guard.clone()));

    let encoder = EnvelopeEncoder::new_collector(
        &cfg.collector_name,
        &cfg.collector_hash,
        DEFAULT_MAJOR_VERSION,
        DEFAULT_MINOR_VERSION,
    );
    let collector_topic: Arc<str> =
        topic::collector_topic(&cfg.templates, &cfg.collector_group, &cfg.collector_name).into();
    debug!(topic = %collector_topic, "collector topic resolved");

    let mut workers: Vec<WorkerEntry> = Vec::new();
    let mut last_heartbeat = Instant::now();
    // announce ourselves right away, then every heartbeat_interval
    publish_collector(&cfg, &tx, &encoder, &collector_topic, MSG_TYPE_COLLECTOR_HEARTBEAT);

    loop {
        reap_stopped(&mut workers);
        gauge!("obmpd_workers").set(workers.len() as f64);

        if last_heartbeat.elapsed() >= cfg.heartbeat {
            publish_collector(&cfg, &tx, &encoder, &collector_topic, MSG_TYPE_COLLECTOR_HEARTBEAT);
            last_heartbeat = Instant::now();
        }

        if listener_v4.is_none() && listener_v6.is_none() {
            anyhow::bail!("all listeners failed");
        }

        tokio::select! {
            _ = guard.cancelled() => break,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            result = accept_on(&listener_v4) => match result {
                Ok((stream, addr)) => {
                    admit(&cfg, &guard, &tx, &cpu, &mut workers, stream, addr).await;
                }
                Err(e) => {
                    warn!(error = %e, "ipv4 listener failed, closing it");
                    listener_v4 = None;
                }
            },
            result = accept_on(&listener_v6) => match result {
                Ok((stream, addr)) => {
                    admit(&cfg, &guard, &tx, &cpu, &mut workers, stream, addr).await;
                }
                Err(e) => {
                    warn!(error = %e, "ipv6 listener failed, closing it");
                    listener_v6 = None;
                }
            },
        }
    }

    // quiesce: cooperative stop, then wait for every session to wind down
    info!(workers = workers.len(), "stopping router sessions");
    for entry in &workers {
        entry.shared.request_stop();
    }
    for entry in workers {
        if entry.handle.await.is_err() {
            warn!(router = %entry.addr, "worker task panicked");
        }
    }
    publish_collector(&cfg, &tx, &encoder, &collector_topic, MSG_TYPE_COLLECTOR_STOPPED);
    info!("supervisor stopped");
    Ok(())
}

/// REUSEADDR on both families, V6ONLY on the v6 socket so the two
/// listeners never collide on dual-stack hosts.
fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Accept on an optional listener; a closed listener never resolves.
async fn accept_on(listener: &Option<TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

fn reap_stopped(workers: &mut Vec<WorkerEntry>) {
    workers.retain(|entry| {
        if entry.shared.status() == WorkerStatus::Stopped {
            debug!(router = %entry.addr, "reaped stopped worker");
            false
        } else {
            true
        }
    });
}

/// Admission gates: a cap on sessions still waiting for their RIB dump,
/// and a CPU ceiling. A refused connection is dropped on the floor and
/// the loop backs off for a second.
async fn admit(
    cfg: &Arc<AppConfig>,
    guard: &ShutdownGuard,
    tx: &BusSender,
    cpu: &CpuGauge,
    workers: &mut Vec<WorkerEntry>,
    stream: TcpStream,
    addr: SocketAddr,
) {
    let waiting = workers
        .iter()
        .filter(|entry| !entry.shared.rib_dump_started())
        .count();
    if waiting >= cfg.max_rib_waiting_workers {
        counter!("obmpd_admission_rejected_total", "gate" => "rib_waiting").increment(1);
        warn!(router = %addr, waiting, "too many sessions waiting on rib dumps, refusing connection");
        drop(stream);
        tokio::time::sleep(ADMISSION_BACKOFF).await;
        return;
    }
    let utilization = cpu.load();
    if utilization > cfg.max_cpu_utilization {
        counter!("obmpd_admission_rejected_total", "gate" => "cpu").increment(1);
        warn!(router = %addr, utilization, "cpu utilization too high, refusing connection");
        drop(stream);
        tokio::time::sleep(ADMISSION_BACKOFF).await;
        return;
    }

    let shared = Arc::new(WorkerShared::default());
    let handle = guard.spawn_task(session(
        cfg.clone(),
        stream,
        addr,
        tx.clone(),
        shared.clone(),
    ));
    workers.push(WorkerEntry {
        shared,
        handle,
        addr,
    });
    counter!("obmpd_sessions_total").increment(1);
}

/// Builds a session's identity and context, then runs the pipeline.
async fn session(
    cfg: Arc<AppConfig>,
    stream: TcpStream,
    addr: SocketAddr,
    tx: BusSender,
    shared: Arc<WorkerShared>,
) {
    if let Err(e) = socket2::SockRef::from(&stream).set_keepalive(true) {
        debug!(router = %addr, error = %e, "cannot enable tcp keepalive");
    }

    let ip = addr.ip();
    let hostname = resolve_hostname(ip).await.unwrap_or_else(|| ip.to_string());
    let group = topic::match_router_group(&cfg.rules, &hostname, ip).to_string();
    let router = RouterIdentity::new(ip, addr.port(), hostname.clone(), group.clone());
    let encoder = EnvelopeEncoder::new(
        &cfg.collector_name,
        &cfg.collector_hash,
        DEFAULT_MAJOR_VERSION,
        DEFAULT_MINOR_VERSION,
        &router,
    );
    let topics = TopicBuilder::new(
        cfg.templates.clone(),
        cfg.rules.clone(),
        blocking_resolver(),
        cfg.collector_group.clone(),
        cfg.collector_name.clone(),
        ip,
        hostname,
        group,
    );
    let ctx = WorkerContext {
        router,
        encoder,
        topics,
        tx,
        tuning: cfg.tuning.clone(),
    };

    let reason = worker::run(shared, stream, ctx).await;
    debug!(router = %addr, ?reason, "session finished");
}

/// Reverse lookup for the router address, off the async threads. Failure
/// falls back to the IP literal at the call site.
async fn resolve_hostname(ip: IpAddr) -> Option<String> {
    tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip).ok())
        .await
        .ok()
        .flatten()
}

/// Peer-hostname resolver handed to the topic builder; it caches per IP,
/// so the blocking lookup runs at most once per distinct peer.
fn blocking_resolver() -> HostnameResolver {
    Arc::new(|ip| dns_lookup::lookup_addr(&ip).ok())
}

fn publish_collector(
    cfg: &Arc<AppConfig>,
    tx: &BusSender,
    encoder: &EnvelopeEncoder,
    topic: &Arc<str>,
    msg_type: u8,
) {
    let ts = CaptureTime::now();
    let payload = encoder.encode(msg_type, None, &[], ts);
    let record = BusRecord {
        topic: topic.clone(),
        key: cfg.collector_hash,
        payload: payload.into(),
        timestamp_ms: ts.as_millis(),
    };
    if tx.try_send(record).is_err() {
        warn!("cannot enqueue collector record, bus channel unavailable");
        return;
    }
    counter!("obmpd_collector_records_total").increment(1);
    debug!(msg_type, "collector record published");
}

/// Samples system CPU once per second for the admission gate.
async fn cpu_monitor(cpu: CpuGauge, guard: ShutdownGuard) {
    let mut system = sysinfo::System::new();
    loop {
        tokio::select! {
            _ = guard.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        system.refresh_cpu_usage();
        let fraction = system.global_cpu_usage() / 100.0;
        cpu.store(fraction);
        gauge!("obmpd_cpu_utilization").set(fraction as f64);
    }
}
