//! Configuration: CLI flags plus an optional TOML file, with CLI taking
//! precedence. Validation happens here, before any socket is opened; a bad
//! configuration never reaches the engine.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use engine::settings::{
    BufferPlan, IoMode, MediaSettings, Options, PatternVariant, Protocol, Role, Settings,
    TcpShutdownMode,
};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(String),
    #[error("failed to parse config file: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug, Default)]
#[command(name = "trafficgen")]
#[command(about = "Configurable network traffic generator and measurement tool")]
#[command(version)]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Listen address (server role); repeatable
    #[arg(long)]
    pub listen: Vec<SocketAddr>,

    /// Target address (client role); repeatable
    #[arg(long)]
    pub target: Vec<SocketAddr>,

    /// Local bind address for outgoing connections; repeatable
    #[arg(long)]
    pub bind: Vec<SocketAddr>,

    /// Transport protocol (tcp, udp)
    #[arg(long)]
    pub protocol: Option<String>,

    /// I/O pattern (push, pull, pushpull, duplex, mediastream)
    #[arg(long)]
    pub pattern: Option<String>,

    /// TCP teardown after the completion marker (server, graceful, hard)
    #[arg(long)]
    pub shutdown: Option<String>,

    /// I/O engine strategy (pipelined, serial)
    #[arg(long)]
    pub io: Option<String>,

    /// Total bytes to transfer per connection
    #[arg(long)]
    pub transfer: Option<u64>,

    /// Buffer size per operation
    #[arg(long)]
    pub buffer: Option<u32>,

    /// Lower bound for randomized buffer sizes
    #[arg(long)]
    pub min_buffer: Option<u32>,

    /// Upper bound for randomized buffer sizes
    #[arg(long)]
    pub max_buffer: Option<u32>,

    /// Bytes per push segment (push-pull pattern)
    #[arg(long)]
    pub push_bytes: Option<u32>,

    /// Bytes per pull segment (push-pull pattern)
    #[arg(long)]
    pub pull_bytes: Option<u32>,

    /// Target send rate in bytes per second (0 disables throttling)
    #[arg(long)]
    pub rate: Option<u64>,

    /// Rate-limit accounting window in milliseconds
    #[arg(long)]
    pub rate_period: Option<u64>,

    /// Receives to keep posted per connection
    #[arg(long)]
    pub prepost_recvs: Option<u32>,

    /// Sends to keep posted per connection
    #[arg(long)]
    pub prepost_sends: Option<u32>,

    /// Concurrent connections (client)
    #[arg(long)]
    pub connections: Option<u32>,

    /// Cap on concurrent outgoing connection attempts
    #[arg(long)]
    pub throttle: Option<u32>,

    /// Concurrent accepts to service (server)
    #[arg(long)]
    pub accept_limit: Option<u32>,

    /// Rounds of `connections` to run; 0 runs until interrupted
    #[arg(long)]
    pub iterations: Option<u64>,

    /// Total connections a server fields before exiting; 0 runs until
    /// interrupted
    #[arg(long)]
    pub server_exit_limit: Option<u64>,

    /// Overall run time limit in milliseconds
    #[arg(long)]
    pub time_limit: Option<u64>,

    /// Low end of the local port range for outgoing connections
    #[arg(long)]
    pub port_low: Option<u16>,

    /// High end of the local port range for outgoing connections
    #[arg(long)]
    pub port_high: Option<u16>,

    /// Enable TCP keepalive
    #[arg(long)]
    pub keepalive: bool,

    /// Enable SO_REUSEPORT on outgoing sockets
    #[arg(long)]
    pub reuse_port: bool,

    /// Accumulate receives until the buffer is full
    #[arg(long)]
    pub msg_wait_all: bool,

    /// Accept the loopback fast-path option (no effect on this platform)
    #[arg(long)]
    pub loopback_fast_path: bool,

    /// Accept the non-blocking I/O option (sockets are always non-blocking
    /// on this platform)
    #[arg(long)]
    pub non_blocking_io: bool,

    /// Interface index to pin outgoing traffic to
    #[arg(long)]
    pub outgoing_if: Option<u32>,

    /// Handle completions inline where the platform allows
    #[arg(long)]
    pub inline_completions: bool,

    /// Accept the circular-queueing option (no effect on this platform)
    #[arg(long)]
    pub circular_queueing: bool,

    /// Explicit SO_RCVBUF value
    #[arg(long)]
    pub recv_buf: Option<u32>,

    /// Explicit SO_SNDBUF value
    #[arg(long)]
    pub send_buf: Option<u32>,

    /// Media stream rate in bits per second
    #[arg(long)]
    pub bits_per_second: Option<u64>,

    /// Media stream frame rate
    #[arg(long)]
    pub frame_rate: Option<u32>,

    /// Media stream client buffer depth in seconds
    #[arg(long)]
    pub buffer_depth: Option<u32>,

    /// Media stream length in seconds
    #[arg(long)]
    pub stream_length: Option<u32>,

    /// Status update interval in milliseconds
    #[arg(long)]
    pub status_interval: Option<u64>,

    /// Status output format (console, csv)
    #[arg(long)]
    pub format: Option<String>,
}

/// Optional TOML file, mirroring the CLI surface in sections.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub general: GeneralSection,
    pub connection: ConnectionSection,
    pub transfer: TransferSection,
    pub rate: RateSection,
    pub media: MediaSection,
    pub options: OptionsSection,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralSection {
    pub protocol: Option<String>,
    pub pattern: Option<String>,
    pub shutdown: Option<String>,
    pub io: Option<String>,
    pub listen: Vec<SocketAddr>,
    pub target: Vec<SocketAddr>,
    pub bind: Vec<SocketAddr>,
    pub time_limit_ms: Option<u64>,
    pub status_interval_ms: Option<u64>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub connections: Option<u32>,
    pub throttle: Option<u32>,
    pub accept_limit: Option<u32>,
    pub iterations: Option<u64>,
    pub server_exit_limit: Option<u64>,
    pub port_low: Option<u16>,
    pub port_high: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    pub transfer: Option<u64>,
    pub buffer: Option<u32>,
    pub min_buffer: Option<u32>,
    pub max_buffer: Option<u32>,
    pub push_bytes: Option<u32>,
    pub pull_bytes: Option<u32>,
    pub prepost_recvs: Option<u32>,
    pub prepost_sends: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct RateSection {
    pub bytes_per_second: Option<u64>,
    pub period_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct MediaSection {
    pub bits_per_second: Option<u64>,
    pub frame_rate: Option<u32>,
    pub buffer_depth_seconds: Option<u32>,
    pub stream_length_seconds: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct OptionsSection {
    pub keepalive: bool,
    pub reuse_port: bool,
    pub msg_wait_all: bool,
    pub loopback_fast_path: bool,
    pub inline_completions: bool,
    pub circular_queueing: bool,
    pub recv_buf: Option<u32>,
    pub send_buf: Option<u32>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Status output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Console,
    Csv,
}

/// The resolved run configuration.
pub struct Config {
    pub settings: Settings,
    pub time_limit: Option<Duration>,
    pub status_interval: Duration,
    pub format: OutputFormat,
}

/// Merge the CLI over the file config and validate the result.
pub fn resolve(cli: Cli) -> Result<Config, ConfigError> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let listens = pick_addrs(&cli.listen, &file.general.listen);
    let targets = pick_addrs(&cli.target, &file.general.target);
    let role = match (listens.is_empty(), targets.is_empty()) {
        (false, true) => Role::Server,
        (true, false) => Role::Client,
        (false, false) => {
            return Err(ConfigError::Invalid(
                "specify either listen addresses or target addresses, not both".to_string(),
            ));
        }
        (true, true) => {
            return Err(ConfigError::Invalid(
                "one of --listen (server) or --target (client) is required".to_string(),
            ));
        }
    };

    let protocol = match cli
        .protocol
        .or(file.general.protocol)
        .as_deref()
        .unwrap_or("tcp")
    {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        other => {
            return Err(ConfigError::Invalid(format!("unknown protocol '{other}'")));
        }
    };

    let pattern = match cli
        .pattern
        .or(file.general.pattern)
        .as_deref()
        .unwrap_or(if protocol == Protocol::Udp {
            "mediastream"
        } else {
            "push"
        }) {
        "push" => PatternVariant::Push,
        "pull" => PatternVariant::Pull,
        "pushpull" | "push-pull" => PatternVariant::PushPull,
        "duplex" => PatternVariant::Duplex,
        "mediastream" | "media-stream" => PatternVariant::MediaStream,
        other => {
            return Err(ConfigError::Invalid(format!("unknown pattern '{other}'")));
        }
    };

    if (pattern == PatternVariant::MediaStream) != (protocol == Protocol::Udp) {
        return Err(ConfigError::Invalid(
            "the mediastream pattern requires udp, and udp requires mediastream".to_string(),
        ));
    }

    let shutdown = match cli
        .shutdown
        .or(file.general.shutdown)
        .as_deref()
        .unwrap_or("graceful")
    {
        "server" => TcpShutdownMode::ServerSide,
        "graceful" => TcpShutdownMode::Graceful,
        "hard" | "rude" => TcpShutdownMode::Hard,
        other => {
            return Err(ConfigError::Invalid(format!("unknown shutdown mode '{other}'")));
        }
    };

    let io_mode = match cli.io.or(file.general.io).as_deref().unwrap_or("pipelined") {
        "pipelined" => IoMode::Pipelined,
        "serial" => IoMode::Serial,
        other => {
            return Err(ConfigError::Invalid(format!("unknown io strategy '{other}'")));
        }
    };

    let format = match cli
        .format
        .or(file.general.format)
        .as_deref()
        .unwrap_or("console")
    {
        "console" => OutputFormat::Console,
        "csv" => OutputFormat::Csv,
        other => {
            return Err(ConfigError::Invalid(format!("unknown output format '{other}'")));
        }
    };

    let defaults = Settings::default();

    // buffer plan: explicit min/max wins over a fixed size
    let min_buffer = cli.min_buffer.or(file.transfer.min_buffer);
    let max_buffer = cli.max_buffer.or(file.transfer.max_buffer);
    let buffer = match (min_buffer, max_buffer) {
        (Some(lo), Some(hi)) => {
            if lo == 0 || lo > hi {
                return Err(ConfigError::Invalid(format!(
                    "invalid buffer range {lo}..{hi}"
                )));
            }
            BufferPlan::Range(lo, hi)
        }
        (None, None) => {
            let fixed = cli
                .buffer
                .or(file.transfer.buffer)
                .unwrap_or(defaults.buffer.max());
            if fixed == 0 {
                return Err(ConfigError::Invalid("buffer size cannot be zero".to_string()));
            }
            BufferPlan::Fixed(fixed)
        }
        _ => {
            return Err(ConfigError::Invalid(
                "min-buffer and max-buffer must be given together".to_string(),
            ));
        }
    };

    let local_port_range = match (
        cli.port_low.or(file.connection.port_low),
        cli.port_high.or(file.connection.port_high),
    ) {
        (Some(lo), Some(hi)) if lo > 0 && lo <= hi => Some((lo, hi)),
        (Some(lo), None) if lo > 0 => Some((lo, lo)),
        (None, None) => None,
        _ => {
            return Err(ConfigError::Invalid("invalid local port range".to_string()));
        }
    };

    // media geometry and the transfer size it implies
    let mut transfer_size = cli
        .transfer
        .or(file.transfer.transfer)
        .unwrap_or(defaults.transfer_size);
    let media = if pattern == PatternVariant::MediaStream {
        let bits = cli
            .bits_per_second
            .or(file.media.bits_per_second)
            .unwrap_or(1_000_000);
        let fps = cli.frame_rate.or(file.media.frame_rate).unwrap_or(60);
        let depth = cli
            .buffer_depth
            .or(file.media.buffer_depth_seconds)
            .unwrap_or(1);
        let length = cli
            .stream_length
            .or(file.media.stream_length_seconds)
            .unwrap_or(60);
        let (media, total) = MediaSettings::calculate(bits, fps, depth, length)
            .map_err(ConfigError::Invalid)?;
        transfer_size = total;
        Some(media)
    } else {
        None
    };
    if transfer_size == 0 {
        return Err(ConfigError::Invalid("transfer size cannot be zero".to_string()));
    }

    let iterations = match cli.iterations.or(file.connection.iterations) {
        None => defaults.iterations,
        Some(0) => None, // unbounded
        Some(n) => Some(n),
    };
    let server_exit_limit = match cli.server_exit_limit.or(file.connection.server_exit_limit) {
        None | Some(0) => u64::MAX,
        Some(n) => n,
    };

    let connection_limit = cli
        .connections
        .or(file.connection.connections)
        .unwrap_or(defaults.connection_limit);
    if role == Role::Client && connection_limit == 0 {
        return Err(ConfigError::Invalid(
            "connection limit cannot be zero".to_string(),
        ));
    }

    let rate = cli.rate.or(file.rate.bytes_per_second).filter(|&r| r > 0);

    let options = Options {
        loopback_fast_path: cli.loopback_fast_path || file.options.loopback_fast_path,
        keepalive: cli.keepalive || file.options.keepalive,
        non_blocking_io: true,
        inline_completions: cli.inline_completions || file.options.inline_completions,
        reuse_unicast_port: cli.reuse_port || file.options.reuse_port,
        recv_buf: cli.recv_buf.or(file.options.recv_buf),
        send_buf: cli.send_buf.or(file.options.send_buf),
        circular_queueing: cli.circular_queueing || file.options.circular_queueing,
        msg_wait_all: cli.msg_wait_all || file.options.msg_wait_all,
    };
    if options.loopback_fast_path {
        tracing::info!("loopback fast path has no effect on this platform");
    }
    if options.circular_queueing {
        tracing::info!("circular queueing has no effect on this platform");
    }

    let settings = Settings {
        role,
        protocol,
        pattern,
        shutdown,
        io_mode,
        transfer_size,
        buffer,
        push_bytes: cli
            .push_bytes
            .or(file.transfer.push_bytes)
            .unwrap_or(defaults.push_bytes),
        pull_bytes: cli
            .pull_bytes
            .or(file.transfer.pull_bytes)
            .unwrap_or(defaults.pull_bytes),
        bytes_per_second: rate,
        quantum_ms: cli
            .rate_period
            .or(file.rate.period_ms)
            .unwrap_or(defaults.quantum_ms)
            .max(1),
        pre_post_recvs: cli
            .prepost_recvs
            .or(file.transfer.prepost_recvs)
            .unwrap_or(defaults.pre_post_recvs)
            .max(1),
        pre_post_sends: cli
            .prepost_sends
            .or(file.transfer.prepost_sends)
            .unwrap_or(defaults.pre_post_sends)
            .max(1),
        connection_limit,
        connection_throttle: cli
            .throttle
            .or(file.connection.throttle)
            .unwrap_or(defaults.connection_throttle)
            .max(1),
        accept_limit: cli
            .accept_limit
            .or(file.connection.accept_limit)
            .unwrap_or(defaults.accept_limit)
            .max(1),
        iterations,
        server_exit_limit,
        tick_ms: defaults.tick_ms,
        options,
        media,
        targets,
        listens,
        binds: pick_addrs(&cli.bind, &file.general.bind),
        local_port_range,
        outgoing_if_index: cli.outgoing_if.unwrap_or(0),
    };

    Ok(Config {
        settings,
        time_limit: cli
            .time_limit
            .or(file.general.time_limit_ms)
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis),
        status_interval: Duration::from_millis(
            cli.status_interval
                .or(file.general.status_interval_ms)
                .unwrap_or(5000)
                .max(100),
        ),
        format,
    })
}

fn pick_addrs(cli: &[SocketAddr], file: &[SocketAddr]) -> Vec<SocketAddr> {
    if cli.is_empty() { file.to_vec() } else { cli.to_vec() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("trafficgen").chain(args.iter().copied()))
    }

    #[test]
    fn client_role_from_target() {
        let config = resolve(cli(&["--target", "10.0.0.1:4444"])).unwrap();
        assert_eq!(config.settings.role, Role::Client);
        assert_eq!(config.settings.protocol, Protocol::Tcp);
        assert_eq!(config.settings.pattern, PatternVariant::Push);
    }

    #[test]
    fn server_role_from_listen() {
        let config = resolve(cli(&["--listen", "0.0.0.0:4444"])).unwrap();
        assert_eq!(config.settings.role, Role::Server);
    }

    #[test]
    fn listen_and_target_conflict() {
        let result = resolve(cli(&[
            "--listen", "0.0.0.0:4444", "--target", "10.0.0.1:4444",
        ]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn neither_role_is_an_error() {
        assert!(matches!(resolve(cli(&[])), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn udp_defaults_to_mediastream() {
        let config = resolve(cli(&[
            "--target", "10.0.0.1:4444", "--protocol", "udp",
            "--bits-per-second", "1000000", "--frame-rate", "60",
            "--stream-length", "10",
        ]))
        .unwrap();
        assert_eq!(config.settings.pattern, PatternVariant::MediaStream);
        let media = config.settings.media.unwrap();
        assert_eq!(media.stream_length_frames, 600);
        // transfer size is derived from the stream geometry
        assert_eq!(
            config.settings.transfer_size,
            media.frame_size_bytes as u64 * 600
        );
    }

    #[test]
    fn mediastream_over_tcp_is_rejected() {
        let result = resolve(cli(&["--target", "10.0.0.1:4444", "--pattern", "mediastream"]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn buffer_range_requires_both_bounds() {
        let result = resolve(cli(&["--target", "10.0.0.1:4444", "--min-buffer", "512"]));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let config = resolve(cli(&[
            "--target", "10.0.0.1:4444", "--min-buffer", "512", "--max-buffer", "4096",
        ]))
        .unwrap();
        assert_eq!(config.settings.buffer, BufferPlan::Range(512, 4096));
    }

    #[test]
    fn zero_iterations_means_unbounded() {
        let config = resolve(cli(&["--target", "10.0.0.1:4444", "--iterations", "0"])).unwrap();
        assert_eq!(config.settings.iterations, None);
        assert_eq!(config.settings.total_connections(), u64::MAX);
    }

    #[test]
    fn hard_shutdown_alias() {
        let config = resolve(cli(&["--target", "10.0.0.1:4444", "--shutdown", "rude"])).unwrap();
        assert_eq!(config.settings.shutdown, TcpShutdownMode::Hard);
        assert!(config.settings.shutdown.is_hard());
    }

    #[test]
    fn file_values_yield_to_cli() {
        let dir = std::env::temp_dir().join(format!(
            "trafficgen-config-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("run.toml");
        std::fs::write(
            &path,
            r#"
[general]
target = ["192.168.1.1:4444"]

[transfer]
transfer = 1048576
buffer = 8192

[rate]
bytes_per_second = 1000000
period_ms = 100
"#,
        )
        .unwrap();

        let config = resolve(cli(&[
            "--config",
            path.to_str().unwrap(),
            "--transfer",
            "2048",
        ]))
        .unwrap();
        assert_eq!(config.settings.transfer_size, 2048);
        assert_eq!(config.settings.buffer, BufferPlan::Fixed(8192));
        assert_eq!(config.settings.bytes_per_second, Some(1_000_000));
        assert_eq!(
            config.settings.targets,
            vec!["192.168.1.1:4444".parse::<SocketAddr>().unwrap()]
        );

        std::fs::remove_dir_all(&dir).ok();
    }
}
