//! Engine settings.
//!
//! A single read-only settings value is constructed at startup and threaded
//! through the component constructors; nothing in the engine reads ambient
//! global state.

use std::net::SocketAddr;
use std::sync::Arc;

use rand::RngCore;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

/// Which side of the exchange this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn is_listening(self) -> bool {
        self == Role::Server
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// The byte-flow pattern for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternVariant {
    /// Client sends, server receives.
    Push,
    /// Server sends, client receives.
    Pull,
    /// Alternating push and pull segments.
    PushPull,
    /// Both directions concurrently.
    Duplex,
    /// UDP datagram streaming, server to client.
    MediaStream,
}

/// How the client tears the connection down after the completion marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpShutdownMode {
    /// Let the server observe the teardown; the client half-closes.
    ServerSide,
    /// FIN-based four-way teardown.
    Graceful,
    /// Abortive reset.
    Hard,
}

impl TcpShutdownMode {
    /// The pattern only branches on graceful vs hard; server-side shutdown
    /// behaves as graceful from the client's perspective.
    pub fn is_hard(self) -> bool {
        self == TcpShutdownMode::Hard
    }
}

/// Which I/O engine strategy drives each connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Multiple outstanding operations, capped by the pre-post counts.
    Pipelined,
    /// One outstanding operation at a time.
    Serial,
}

/// Per-task buffer sizing: a fixed size, or uniformly random within a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPlan {
    Fixed(u32),
    Range(u32, u32),
}

impl BufferPlan {
    pub fn max(&self) -> u32 {
        match *self {
            BufferPlan::Fixed(n) => n,
            BufferPlan::Range(_, hi) => hi,
        }
    }
}

/// Socket option toggles.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    pub loopback_fast_path: bool,
    pub keepalive: bool,
    pub non_blocking_io: bool,
    pub inline_completions: bool,
    pub reuse_unicast_port: bool,
    pub recv_buf: Option<u32>,
    pub send_buf: Option<u32>,
    pub circular_queueing: bool,
    pub msg_wait_all: bool,
}

/// Media-stream shape, derived from the rate, frame rate, and duration.
#[derive(Debug, Clone, Copy)]
pub struct MediaSettings {
    pub bits_per_second: u64,
    pub frames_per_second: u32,
    pub buffer_depth_seconds: u32,
    pub stream_length_seconds: u32,
    // derived
    pub frame_size_bytes: u32,
    pub stream_length_frames: u32,
}

impl MediaSettings {
    /// Compute the derived frame geometry and total transfer size. The total
    /// stream length is trimmed so it aligns evenly with the frame count.
    pub fn calculate(
        bits_per_second: u64,
        frames_per_second: u32,
        buffer_depth_seconds: u32,
        stream_length_seconds: u32,
    ) -> Result<(Self, u64), String> {
        if bits_per_second == 0 || bits_per_second % 8 != 0 {
            return Err(format!(
                "bits-per-second ({bits_per_second}) must be nonzero and divisible by 8"
            ));
        }
        if frames_per_second == 0 {
            return Err("frame rate cannot be zero".to_string());
        }
        if stream_length_seconds == 0 {
            return Err("stream length cannot be zero".to_string());
        }

        let total_frames = stream_length_seconds as u64 * frames_per_second as u64;
        if total_frames > u32::MAX as u64 {
            return Err(format!("stream length of {total_frames} frames exceeds 2^32"));
        }

        let mut total_bytes = bits_per_second / 8 * stream_length_seconds as u64;
        total_bytes -= total_bytes % total_frames;

        let frame_size = total_bytes / total_frames;
        if frame_size > u32::MAX as u64 {
            return Err(format!("frame size of {frame_size} bytes exceeds 2^32"));
        }
        if frame_size < 40 {
            return Err(format!(
                "frame size of {frame_size} bytes is too small - it must be at least 40 bytes"
            ));
        }
        if frame_size > protocol_traffic::MAX_DATAGRAM_BYTES as u64 {
            return Err(format!(
                "frame size of {frame_size} bytes exceeds the maximum datagram size ({}); \
                 raise the frame rate or lower the bit rate",
                protocol_traffic::MAX_DATAGRAM_BYTES
            ));
        }

        let media = MediaSettings {
            bits_per_second,
            frames_per_second,
            buffer_depth_seconds,
            stream_length_seconds,
            frame_size_bytes: frame_size as u32,
            stream_length_frames: total_frames as u32,
        };
        Ok((media, total_bytes))
    }

    /// Milliseconds between frames at the configured frame rate.
    pub fn frame_interval_ms(&self) -> u64 {
        (1000 / self.frames_per_second).max(1) as u64
    }
}

/// Read-only engine configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub role: Role,
    pub protocol: Protocol,
    pub pattern: PatternVariant,
    pub shutdown: TcpShutdownMode,
    pub io_mode: IoMode,

    /// Total bytes each connection transfers.
    pub transfer_size: u64,
    pub buffer: BufferPlan,
    /// Bytes per push segment and pull segment for the push-pull pattern.
    pub push_bytes: u32,
    pub pull_bytes: u32,

    /// Target send rate; `None` disables throttling.
    pub bytes_per_second: Option<u64>,
    /// Rate-limit accounting window.
    pub quantum_ms: u64,

    pub pre_post_recvs: u32,
    pub pre_post_sends: u32,

    pub connection_limit: u32,
    pub connection_throttle: u32,
    pub accept_limit: u32,
    /// Client: rounds of `connection_limit` connections; `None` is unbounded.
    pub iterations: Option<u64>,
    /// Server: total connections to field before signalling done.
    pub server_exit_limit: u64,

    /// Broker pool maintenance period.
    pub tick_ms: u64,

    pub options: Options,
    pub media: Option<MediaSettings>,

    pub targets: Vec<SocketAddr>,
    pub listens: Vec<SocketAddr>,
    pub binds: Vec<SocketAddr>,
    pub local_port_range: Option<(u16, u16)>,
    /// Interface index to pin outgoing traffic to; zero leaves routing to
    /// the stack.
    pub outgoing_if_index: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            role: Role::Client,
            protocol: Protocol::Tcp,
            pattern: PatternVariant::Push,
            shutdown: TcpShutdownMode::Graceful,
            io_mode: IoMode::Pipelined,
            transfer_size: 0x10_0000,
            buffer: BufferPlan::Fixed(65_536),
            push_bytes: 0x10_0000,
            pull_bytes: 0x10_0000,
            bytes_per_second: None,
            quantum_ms: 100,
            pre_post_recvs: 1,
            pre_post_sends: 1,
            connection_limit: 8,
            connection_throttle: 1000,
            accept_limit: 100,
            iterations: Some(1),
            server_exit_limit: u64::MAX,
            tick_ms: 333,
            options: Options::default(),
            media: None,
            targets: Vec::new(),
            listens: Vec::new(),
            binds: Vec::new(),
            local_port_range: None,
            outgoing_if_index: 0,
        }
    }
}

impl Settings {
    /// Total connections this run will attempt (the broker's budget).
    pub fn total_connections(&self) -> u64 {
        match self.role {
            Role::Server => self.server_exit_limit,
            Role::Client => match self.iterations {
                None => u64::MAX,
                Some(n) => n.saturating_mul(self.connection_limit as u64),
            },
        }
    }

    /// The broker's pending cap: connection limit for clients, accept limit
    /// for servers.
    pub fn pending_limit(&self) -> u32 {
        let limit = match self.role {
            Role::Server => self.accept_limit,
            Role::Client => self.connection_limit,
        };
        // the pending cap can never usefully exceed the total budget
        limit.min(self.total_connections().min(u32::MAX as u64) as u32)
    }

    /// Advisory cap on concurrently scheduled send bytes.
    pub fn ideal_send_backlog(&self) -> u64 {
        let sends = self.pre_post_sends.max(1) as u64;
        self.buffer.max() as u64 * sends
    }

    /// Shared payload bytes sends are sliced from, deterministically filled.
    pub fn build_payload(&self) -> Arc<[u8]> {
        let len = (self.buffer.max() as usize).max(protocol_traffic::MAX_DATAGRAM_BYTES);
        let mut payload = vec![0u8; len];
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        rng.fill_bytes(&mut payload);
        payload.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_budget_is_iterations_times_limit() {
        let settings = Settings {
            connection_limit: 10,
            iterations: Some(10),
            ..Default::default()
        };
        assert_eq!(settings.total_connections(), 100);
        assert_eq!(settings.pending_limit(), 10);
    }

    #[test]
    fn unbounded_iterations_never_exhaust() {
        let settings = Settings {
            iterations: None,
            ..Default::default()
        };
        assert_eq!(settings.total_connections(), u64::MAX);
    }

    #[test]
    fn pending_limit_clamps_to_budget() {
        let settings = Settings {
            connection_limit: 100,
            iterations: Some(1),
            ..Default::default()
        };
        // only 100 total, pending limit stays at 100
        assert_eq!(settings.pending_limit(), 100);

        let settings = Settings {
            role: Role::Server,
            accept_limit: 100,
            server_exit_limit: 5,
            ..Default::default()
        };
        assert_eq!(settings.pending_limit(), 5);
    }

    #[test]
    fn media_geometry_aligns_frames() {
        // 1 Mbps for 10 seconds at 60 fps
        let (media, total) = MediaSettings::calculate(1_000_000, 60, 1, 10).unwrap();
        assert_eq!(media.stream_length_frames, 600);
        assert_eq!(total % media.stream_length_frames as u64, 0);
        assert_eq!(media.frame_size_bytes as u64 * 600, total);
        // 1,250,000 bytes trimmed to frame alignment
        assert!(total <= 1_250_000);
    }

    #[test]
    fn media_rejects_degenerate_shapes() {
        assert!(MediaSettings::calculate(0, 60, 1, 10).is_err());
        assert!(MediaSettings::calculate(1_000_001, 60, 1, 10).is_err());
        assert!(MediaSettings::calculate(1_000_000, 0, 1, 10).is_err());
        assert!(MediaSettings::calculate(1_000_000, 60, 1, 0).is_err());
        // 8 bits/sec -> 1 byte frames, far below the header floor
        assert!(MediaSettings::calculate(8, 1, 1, 10).is_err());
        // 1 Gbps at 1 fps -> frames far beyond the datagram bound
        assert!(MediaSettings::calculate(1_000_000_000, 1, 1, 10).is_err());
    }
}
