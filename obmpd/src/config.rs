//! Configuration: clap CLI merged over the optional YAML file, validated
//! into one immutable `AppConfig` that the rest of the daemon shares.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use config::{File, FileFormat};
use obmpd_lib::identity::{collector_hash, HASH_LEN};
use obmpd_lib::topic::{GroupRule, GroupRules, TopicTemplates};
use obmpd_lib::worker::{WorkerTuning, DEFAULT_REFILL_SIZE};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

pub const MIN_RING_MIB: u64 = 2;
pub const MAX_RING_MIB: u64 = 384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListenMode {
    V4,
    V6,
    V4v6,
}

#[derive(Parser, Debug)]
#[command(name = "obmpd", version, about = "OpenBMP-compatible BMP collector", long_about = None)]
pub struct Cli {
    /// Config filename (YAML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Admin ID for this collector, unique per collector; a hostname or IP
    /// is a good choice. Required unless the config file sets
    /// base.collector_name.
    #[arg(short = 'a', long = "admin-id")]
    pub admin_id: Option<String>,

    /// Log filename, default is stdout
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Debug log filename, receives debug-level records in addition to the
    /// main log
    #[arg(short = 'd', long = "debug-log-file")]
    pub debug_log_file: Option<PathBuf>,

    /// PID filename, default is no PID file
    #[arg(long = "pid-file")]
    pub pid_file: Option<PathBuf>,

    /// Run in foreground (daemonizing is never performed; this silences the
    /// warning when the config file asks for a daemon)
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// BMP listening port
    #[arg(short = 'p', long, value_parser = clap::value_parser!(u16).range(25..))]
    pub port: Option<u16>,

    /// Enable IPv4 and/or IPv6 BMP listeners
    #[arg(short = 'm', long = "listen-mode", value_enum)]
    pub listen_mode: Option<ListenMode>,

    /// Kafka broker list, host:port[,...]
    #[arg(short = 'k', long = "kafka-brokers")]
    pub kafka_brokers: Option<String>,

    /// Per-router ring buffer size in MiB (2-384)
    #[arg(short = 'b', long = "buffer-size", value_parser = clap::value_parser!(u64).range(MIN_RING_MIB..=MAX_RING_MIB))]
    pub buffer_size: Option<u64>,

    /// Collector heartbeat interval in minutes (the config file key
    /// base.heartbeat_interval is in seconds)
    #[arg(short = 'i', long = "heartbeat-interval")]
    pub heartbeat_minutes: Option<u64>,

    /// Debug everything
    #[arg(long)]
    pub debug: bool,

    /// Debug the BMP framer and workers
    #[arg(long = "debug-bmp")]
    pub debug_bmp: bool,

    /// Debug the message bus publisher
    #[arg(long = "debug-msgbus")]
    pub debug_msgbus: bool,

    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    base: BaseSection,
    kafka_topic_template: TemplateSection,
    librdkafka_config: HashMap<String, String>,
    grouping: GroupingSection,
    debug: DebugSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct BaseSection {
    collector_name: Option<String>,
    collector_group: String,
    /// Seconds between collector heartbeats.
    heartbeat_interval: u64,
    listen_port: u16,
    listen_ipv4: Option<String>,
    listen_ipv6: Option<String>,
    listen_mode: String,
    /// MiB per router.
    bmp_ring_buffer_size: u64,
    max_rib_waiting_workers: usize,
    max_cpu_utilization: f64,
    daemon: bool,
    /// Optional host:port for the Prometheus exporter.
    metrics_listen: Option<String>,
    log_filename: Option<PathBuf>,
    debug_filename: Option<PathBuf>,
    pid_filename: Option<PathBuf>,
}

impl Default for BaseSection {
    fn default() -> Self {
        BaseSection {
            collector_name: None,
            collector_group: "default".to_string(),
            heartbeat_interval: 300,
            listen_port: 5000,
            listen_ipv4: None,
            listen_ipv6: None,
            listen_mode: "v4".to_string(),
            bmp_ring_buffer_size: 15,
            max_rib_waiting_workers: 3,
            max_cpu_utilization: 0.8,
            daemon: false,
            metrics_listen: None,
            log_filename: None,
            debug_filename: None,
            pid_filename: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TemplateSection {
    collector: String,
    router: String,
    bmp_raw: String,
}

impl Default for TemplateSection {
    fn default() -> Self {
        let defaults = TopicTemplates::default();
        TemplateSection {
            collector: defaults.collector,
            router: defaults.router,
            bmp_raw: defaults.bmp_raw,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GroupingSection {
    router_group: Vec<GroupEntry>,
    peer_group: Vec<GroupEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GroupEntry {
    name: String,
    regexp_hostname: Vec<String>,
    prefix_range: Vec<String>,
    asn: Vec<u32>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct DebugSection {
    pub all: bool,
    pub collector: bool,
    pub worker: bool,
    pub encapsulator: bool,
    pub message_bus: bool,
}

#[derive(Debug)]
pub struct AppConfig {
    pub collector_name: String,
    pub collector_group: String,
    pub collector_hash: [u8; HASH_LEN],
    pub heartbeat: Duration,
    pub listen_v4: Option<SocketAddr>,
    pub listen_v6: Option<SocketAddr>,
    pub tuning: WorkerTuning,
    pub max_rib_waiting_workers: usize,
    pub max_cpu_utilization: f64,
    pub templates: Arc<TopicTemplates>,
    pub rules: Arc<GroupRules>,
    pub kafka_brokers: String,
    pub librdkafka: HashMap<String, String>,
    pub metrics_listen: Option<SocketAddr>,
    pub pid_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub debug_log_file: Option<PathBuf>,
    pub daemon: bool,
    pub debug: DebugSection,
}

/// Loads and validates the configuration. Any error here is fatal at
/// startup (exit code 2).
pub fn load(cli: &Cli) -> Result<AppConfig> {
    let mut file = FileConfig::default();
    if let Some(path) = &cli.config {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("config path is not valid UTF-8"))?;
        let settings = config::Config::builder()
            .add_source(File::new(path_str, FileFormat::Yaml))
            .build()
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        file = settings
            .try_deserialize()
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
    }

    let collector_name = cli
        .admin_id
        .clone()
        .or(file.base.collector_name.clone())
        .ok_or_else(|| {
            anyhow!("collector admin id is required: pass -a or set base.collector_name")
        })?;

    let mode = match cli.listen_mode {
        Some(mode) => mode,
        None => match file.base.listen_mode.as_str() {
            "v4" => ListenMode::V4,
            "v6" => ListenMode::V6,
            "v4v6" => ListenMode::V4v6,
            other => bail!("base.listen_mode {:?} is invalid, expected v4, v6 or v4v6", other),
        },
    };
    let port = cli.port.unwrap_or(file.base.listen_port);
    let listen_v4 = matches!(mode, ListenMode::V4 | ListenMode::V4v6)
        .then(|| parse_bind_v4(file.base.listen_ipv4.as_deref(), port))
        .transpose()?;
    let listen_v6 = matches!(mode, ListenMode::V6 | ListenMode::V4v6)
        .then(|| parse_bind_v6(file.base.listen_ipv6.as_deref(), port))
        .transpose()?;

    let ring_mib = cli.buffer_size.unwrap_or(file.base.bmp_ring_buffer_size);
    if !(MIN_RING_MIB..=MAX_RING_MIB).contains(&ring_mib) {
        bail!(
            "base.bmp_ring_buffer_size {} MiB is out of range, expected {}-{}",
            ring_mib,
            MIN_RING_MIB,
            MAX_RING_MIB
        );
    }

    let max_cpu_utilization = file.base.max_cpu_utilization;
    if !(0.0..=1.0).contains(&max_cpu_utilization) || max_cpu_utilization == 0.0 {
        bail!(
            "base.max_cpu_utilization {} is out of range, expected (0, 1]",
            max_cpu_utilization
        );
    }

    // CLI flag is minutes, the file key is seconds
    let heartbeat = match cli.heartbeat_minutes {
        Some(minutes) => Duration::from_secs(minutes * 60),
        None => Duration::from_secs(file.base.heartbeat_interval),
    };
    if heartbeat.is_zero() {
        bail!("heartbeat interval must be positive");
    }

    let rules = GroupRules {
        routers: compile_entries(&file.grouping.router_group)?,
        peers: compile_entries(&file.grouping.peer_group)?,
    };

    let metrics_listen = file
        .base
        .metrics_listen
        .as_deref()
        .map(|s| {
            s.parse::<SocketAddr>()
                .with_context(|| format!("base.metrics_listen {:?} is not host:port", s))
        })
        .transpose()?;

    let mut debug = file.debug;
    debug.all |= cli.debug;
    debug.worker |= cli.debug_bmp;
    debug.message_bus |= cli.debug_msgbus;

    Ok(AppConfig {
        collector_hash: collector_hash(&collector_name),
        collector_name,
        collector_group: file.base.collector_group,
        heartbeat,
        listen_v4,
        listen_v6,
        tuning: WorkerTuning {
            ring_capacity: (ring_mib as usize) * 1024 * 1024,
            refill_size: DEFAULT_REFILL_SIZE,
            slow_start: true,
        },
        max_rib_waiting_workers: file.base.max_rib_waiting_workers,
        max_cpu_utilization,
        templates: Arc::new(TopicTemplates {
            collector: file.kafka_topic_template.collector,
            router: file.kafka_topic_template.router,
            bmp_raw: file.kafka_topic_template.bmp_raw,
        }),
        rules: Arc::new(rules),
        kafka_brokers: cli
            .kafka_brokers
            .clone()
            .unwrap_or_else(|| "127.0.0.1:9092".to_string()),
        librdkafka: file.librdkafka_config,
        metrics_listen,
        pid_file: cli.pid_file.clone().or(file.base.pid_filename),
        log_file: cli.log_file.clone().or(file.base.log_filename),
        debug_log_file: cli.debug_log_file.clone().or(file.base.debug_filename),
        daemon: file.base.daemon,
        debug,
    })
}

fn parse_bind_v4(bind: Option<&str>, port: u16) -> Result<SocketAddr> {
    let ip = match bind {
        Some(s) => s
            .parse::<Ipv4Addr>()
            .with_context(|| format!("base.listen_ipv4 {:?} is not an IPv4 address", s))?,
        None => Ipv4Addr::UNSPECIFIED,
    };
    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}

fn parse_bind_v6(bind: Option<&str>, port: u16) -> Result<SocketAddr> {
    let ip = match bind {
        Some(s) => s
            .parse::<Ipv6Addr>()
            .with_context(|| format!("base.listen_ipv6 {:?} is not an IPv6 address", s))?,
        None => Ipv6Addr::UNSPECIFIED,
    };
    Ok(SocketAddr::new(IpAddr::V6(ip), port))
}

fn compile_entries(entries: &[GroupEntry]) -> Result<Vec<GroupRule>> {
    entries
        .iter()
        .map(|e| {
            GroupRule::compile(&e.name, &e.regexp_hostname, &e.prefix_range, &e.asn)
                .map_err(Into::into)
        })
        .collect()
}

/// Sets up tracing: verbosity from the CLI plus per-component directives
/// from the debug section, main records to stdout or the log file, and an
/// optional second sink that also receives debug records.
pub fn init_tracing(cli: &Cli, cfg: &AppConfig) -> Result<()> {
    let mut filter = EnvFilter::default().add_directive(cli.verbose.tracing_level_filter().into());
    let mut directives: Vec<&str> = Vec::new();
    if cfg.debug.all {
        directives.extend(["obmpd=debug", "obmpd_lib=debug"]);
    }
    if cfg.debug.collector {
        directives.push("obmpd::supervisor=debug");
    }
    if cfg.debug.worker {
        directives.extend(["obmpd_lib::worker=debug", "obmpd_lib::frame=debug"]);
    }
    if cfg.debug.encapsulator {
        directives.push("obmpd_lib::envelope=debug");
    }
    if cfg.debug.message_bus {
        directives.push("obmpd::producer=debug");
    }
    for directive in directives {
        filter = filter.add_directive(directive.parse()?);
    }

    let main_layer = match &cfg.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .boxed()
        }
        None => tracing_subscriber::fmt::layer().compact().boxed(),
    };

    let debug_layer = cfg
        .debug_log_file
        .as_ref()
        .map(|path| {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open debug log file {}", path.display()))?;
            Ok::<_, anyhow::Error>(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG)
                    .boxed(),
            )
        })
        .transpose()?;

    tracing_subscriber::registry()
        .with(main_layer.with_filter(filter))
        .with(debug_layer)
        .try_init()
        .map_err(|e| anyhow!("cannot install tracing subscriber: {}", e))?;
    Ok(())
}
