//! The pattern layer.
//!
//! [`IoPattern`] sits between the protocol state machine and the I/O engine.
//! The state machine decides *when* bytes may flow and when the transfer is
//! done; the pattern decides *which direction* each more-io task runs, sizes
//! its buffer, consults the rate limiter, and keeps the per-direction
//! scheduling budgets. It is the single object the engine talks to for a
//! connection, and it serializes itself with a short internal lock.

pub mod media;
pub mod state;
pub mod throttle;

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::error::TransferError;
use crate::metrics;
use crate::settings::{BufferPlan, PatternVariant, Protocol, Role, Settings};
use crate::task::{BufferType, IoTask, TaskAction};
use media::{FrameCounts, FrameOutcome, MediaTracker};
use protocol_traffic::{
    CONNECTION_ID_DATAGRAM_LEN, CONNECTION_ID_LEN, COMPLETION_MARKER, DATAGRAM_HEADER_LEN,
    DatagramHeader, START_VERB, decode_connection_id_datagram, encode_connection_id_datagram,
    is_start_verb,
};
use state::{PatternState, ProtocolError, ProtocolTask};
use throttle::RateLimiter;

/// What the engine should do after a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Ask for the next task.
    Continue,
    /// The transfer finished successfully.
    Completed,
    /// The connection failed; `IoPattern::last_error` has the cause.
    Failed,
}

/// Pre-stream handshake position for the UDP media pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaPhase {
    ClientSendStart,
    ClientRecvId,
    ServerAwaitStart,
    ServerSendId,
    Streaming,
}

struct MediaCore {
    tracker: MediaTracker,
    phase: MediaPhase,
    frame_size: u32,
    next_send_sequence: i64,
    epoch: Instant,
}

struct PushPullPlan {
    push_segment: u64,
    pull_segment: u64,
    in_push: bool,
    segment_left: u64,
}

struct PatternCore {
    state: PatternState,
    limiter: RateLimiter,
    variant: PatternVariant,
    role: Role,
    protocol: Protocol,

    buffer: BufferPlan,
    rng: Xoshiro256PlusPlus,
    payload: Arc<[u8]>,
    connection_id: [u8; CONNECTION_ID_LEN],

    /// Bytes not yet handed out as tasks, per direction.
    send_budget: u64,
    recv_budget: u64,
    /// Tracked operations currently outstanding, per direction.
    outstanding_sends: u32,
    outstanding_recvs: u32,
    /// Tracked send bytes currently outstanding (ideal-send-backlog cap).
    send_inflight_bytes: u64,
    pre_post_sends: u32,
    pre_post_recvs: u32,

    pushpull: Option<PushPullPlan>,
    media: Option<MediaCore>,
    /// A handshake task is in flight; hold further tasks until it lands.
    control_inflight: bool,
    msg_wait_all: bool,

    last_error: Option<TransferError>,
}

pub struct IoPattern {
    core: Mutex<PatternCore>,
}

impl IoPattern {
    pub fn new(
        settings: &Settings,
        connection_id: [u8; CONNECTION_ID_LEN],
        payload: Arc<[u8]>,
    ) -> Self {
        let max_transfer = settings.transfer_size;
        let role = settings.role;
        let variant = settings.pattern;

        // direction budgets depend on who pushes and who pulls
        let (send_budget, recv_budget) = match (variant, role) {
            (PatternVariant::Push, Role::Client) => (max_transfer, 0),
            (PatternVariant::Push, Role::Server) => (0, max_transfer),
            (PatternVariant::Pull, Role::Client) => (0, max_transfer),
            (PatternVariant::Pull, Role::Server) => (max_transfer, 0),
            (PatternVariant::Duplex, _) => {
                let half = max_transfer / 2;
                (half, max_transfer - half)
            }
            // push-pull budgets are governed by the segment plan
            (PatternVariant::PushPull, _) => (max_transfer, max_transfer),
            (PatternVariant::MediaStream, Role::Client) => (0, max_transfer),
            (PatternVariant::MediaStream, Role::Server) => (max_transfer, 0),
        };

        let pushpull = (variant == PatternVariant::PushPull).then(|| PushPullPlan {
            push_segment: settings.push_bytes as u64,
            pull_segment: settings.pull_bytes as u64,
            in_push: true,
            segment_left: (settings.push_bytes as u64).min(max_transfer),
        });

        let media = settings.media.map(|m| MediaCore {
            tracker: MediaTracker::new(m.frame_size_bytes),
            phase: match role {
                Role::Client => MediaPhase::ClientSendStart,
                Role::Server => MediaPhase::ServerAwaitStart,
            },
            frame_size: m.frame_size_bytes,
            next_send_sequence: 0,
            epoch: Instant::now(),
        });

        // the media server paces one frame's bytes per frame interval;
        // everything else uses the configured target rate
        let limiter = match (&settings.media, role) {
            (Some(m), Role::Server) => {
                RateLimiter::new(Some(m.bits_per_second / 8), m.frame_interval_ms())
            }
            _ => RateLimiter::new(settings.bytes_per_second, settings.quantum_ms),
        };

        let seed = u64::from_le_bytes(connection_id[0..8].try_into().expect("id is 36 bytes"));
        Self {
            core: Mutex::new(PatternCore {
                state: PatternState::new(
                    role,
                    settings.protocol,
                    settings.shutdown,
                    max_transfer,
                    settings.ideal_send_backlog(),
                ),
                limiter,
                variant,
                role,
                protocol: settings.protocol,
                buffer: settings.buffer,
                rng: Xoshiro256PlusPlus::seed_from_u64(seed),
                payload,
                connection_id,
                send_budget,
                recv_budget,
                outstanding_sends: 0,
                outstanding_recvs: 0,
                send_inflight_bytes: 0,
                pre_post_sends: settings.pre_post_sends.max(1),
                pre_post_recvs: settings.pre_post_recvs.max(1),
                pushpull,
                media,
                control_inflight: false,
                msg_wait_all: settings.options.msg_wait_all,
                last_error: None,
            }),
        }
    }

    /// Pull the next task. Returns an action of `None` when nothing may be
    /// issued right now; the engine should stop and wait for completions.
    pub fn initiate_io(&self) -> IoTask {
        let mut core = self.core.lock();

        if core.control_inflight {
            return IoTask::none();
        }
        if let Some(task) = core.next_media_handshake_task() {
            return task;
        }

        let tag = core.state.next_task();
        let mut task = match tag {
            ProtocolTask::NoIo => return IoTask::none(),
            ProtocolTask::SendConnectionId => IoTask::send(
                core.connection_id.to_vec(),
                BufferType::TcpConnectionId,
                false,
            ),
            ProtocolTask::RecvConnectionId => {
                IoTask::recv(CONNECTION_ID_LEN, BufferType::TcpConnectionId, false)
            }
            ProtocolTask::MoreIo => match core.next_more_io_task() {
                Some(task) => task,
                None => return IoTask::none(),
            },
            ProtocolTask::SendCompletion => IoTask::send_static(COMPLETION_MARKER),
            ProtocolTask::RecvCompletion => IoTask::recv(
                protocol_traffic::COMPLETION_MARKER_LEN,
                BufferType::Payload,
                false,
            ),
            ProtocolTask::GracefulShutdown => IoTask::shutdown(TaskAction::GracefulShutdown),
            ProtocolTask::HardShutdown => IoTask::shutdown(TaskAction::HardShutdown),
            ProtocolTask::RequestFin => IoTask::recv(16, BufferType::Payload, false),
        };

        core.state.notify_task(&task);

        if task.track_io {
            match task.action {
                TaskAction::Send => {
                    core.outstanding_sends += 1;
                    core.send_inflight_bytes += task.len() as u64;
                    task.time_offset_ms = core.limiter.schedule_send(task.len() as u64);
                }
                TaskAction::Recv => core.outstanding_recvs += 1,
                _ => {}
            }
        }

        task
    }

    /// Route a completion back into the pattern.
    pub fn complete_io(
        &self,
        task: &IoTask,
        bytes_transferred: u64,
        error: Option<TransferError>,
    ) -> Verdict {
        let mut core = self.core.lock();

        // release the scheduling bookkeeping taken at initiate time
        if task.track_io {
            match task.action {
                TaskAction::Send => {
                    core.outstanding_sends = core.outstanding_sends.saturating_sub(1);
                    core.send_inflight_bytes =
                        core.send_inflight_bytes.saturating_sub(task.len() as u64);
                    // a shortfall re-enters the budget so the direction can finish
                    core.send_budget += task.len() as u64 - bytes_transferred;
                    metrics::BYTES_SENT.add(bytes_transferred);
                }
                TaskAction::Recv => {
                    core.outstanding_recvs = core.outstanding_recvs.saturating_sub(1);
                    core.recv_budget += task.len() as u64 - bytes_transferred;
                    metrics::BYTES_RECV.add(bytes_transferred);
                }
                _ => {}
            }
        }

        if core.control_inflight {
            core.control_inflight = false;
            return core.complete_media_handshake(task, bytes_transferred, error);
        }

        match core.state.update_error(error) {
            ProtocolError::IoFailed => {
                core.set_last_error(error.unwrap_or(TransferError::Io(
                    std::io::ErrorKind::ConnectionAborted,
                )));
                return Verdict::Failed;
            }
            _ => {
                // benign or absent; fall through to the completion accounting
            }
        }

        // the client adopts the server-assigned identifier
        if task.buffer_type == BufferType::TcpConnectionId
            && task.action == TaskAction::Recv
            && bytes_transferred == CONNECTION_ID_LEN as u64
        {
            core.connection_id.copy_from_slice(&task.read_slice()[..CONNECTION_ID_LEN]);
        }

        // media frames are classified before the byte accounting so loss
        // gaps can advance the stream position
        let mut skipped = 0u64;
        let mut counted_bytes = bytes_transferred;
        if core.is_streaming_media_recv(task) && error.is_none() && bytes_transferred > 0 {
            match core.classify_frame(task, bytes_transferred) {
                FrameOutcome::Accepted { advance } => {
                    skipped = advance.saturating_sub(bytes_transferred);
                }
                FrameOutcome::Duplicate | FrameOutcome::Invalid => counted_bytes = 0,
            }
        }

        let mut outcome = core.state.completed_task(task, counted_bytes);
        if skipped > 0 && outcome == ProtocolError::NoError {
            outcome = core.state.account_skipped(skipped);
        }

        match outcome {
            ProtocolError::NoError => Verdict::Continue,
            ProtocolError::Completed => Verdict::Completed,
            ProtocolError::TooFewBytes => {
                core.set_last_error(TransferError::TooFewBytes);
                Verdict::Failed
            }
            ProtocolError::TooManyBytes => {
                core.set_last_error(TransferError::TooManyBytes);
                Verdict::Failed
            }
            ProtocolError::IoFailed => {
                core.set_last_error(error.unwrap_or(TransferError::Io(
                    std::io::ErrorKind::ConnectionAborted,
                )));
                Verdict::Failed
            }
        }
    }

    pub fn last_error(&self) -> Option<TransferError> {
        self.core.lock().last_error
    }

    pub fn confirmed_bytes(&self) -> u64 {
        self.core.lock().state.confirmed_bytes()
    }

    pub fn is_completed(&self) -> bool {
        self.core.lock().state.is_completed()
    }

    pub fn connection_id(&self) -> [u8; CONNECTION_ID_LEN] {
        self.core.lock().connection_id
    }

    pub fn frame_counts(&self) -> Option<FrameCounts> {
        self.core.lock().media.as_ref().map(|m| m.tracker.counts())
    }

    /// Whether a recv should accumulate until its buffer is full. Control
    /// frames are fixed-length and must arrive whole; push-pull segments
    /// stay lock-step; payload recvs follow the MsgWaitAll option. Datagram
    /// reads never accumulate.
    pub fn wants_wait_all(&self, task: &IoTask) -> bool {
        let core = self.core.lock();
        if core.protocol != Protocol::Tcp || task.action != TaskAction::Recv {
            return false;
        }
        !task.track_io || core.msg_wait_all || core.variant == PatternVariant::PushPull
    }
}

impl PatternCore {
    fn set_last_error(&mut self, error: TransferError) {
        if self.last_error.is_none() {
            self.last_error = Some(error);
        }
    }

    fn next_buffer_len(&mut self) -> u64 {
        match self.buffer {
            BufferPlan::Fixed(n) => n as u64,
            BufferPlan::Range(lo, hi) => self.rng.random_range(lo..=hi) as u64,
        }
    }

    fn payload_slice(&self, len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        let mut copied = 0;
        while copied < len {
            let chunk = (len - copied).min(self.payload.len());
            bytes[copied..copied + chunk].copy_from_slice(&self.payload[..chunk]);
            copied += chunk;
        }
        bytes
    }

    /// Direction decision for a more-io task.
    fn next_more_io_task(&mut self) -> Option<IoTask> {
        match self.variant {
            PatternVariant::PushPull => self.next_pushpull_task(),
            PatternVariant::MediaStream => self.next_media_task(),
            _ => {
                let sends_first = self.send_budget > 0;
                if sends_first && let Some(task) = self.try_send_task() {
                    return Some(task);
                }
                self.try_recv_task()
            }
        }
    }

    fn try_send_task(&mut self) -> Option<IoTask> {
        if self.send_budget == 0 || self.outstanding_sends >= self.pre_post_sends {
            return None;
        }
        if self.send_inflight_bytes >= self.state.ideal_send_backlog() {
            return None;
        }
        let len = self.next_buffer_len().min(self.send_budget) as usize;
        self.send_budget -= len as u64;
        Some(IoTask::send(
            self.payload_slice(len),
            BufferType::Payload,
            true,
        ))
    }

    fn try_recv_task(&mut self) -> Option<IoTask> {
        if self.recv_budget == 0 || self.outstanding_recvs >= self.pre_post_recvs {
            return None;
        }
        let len = self.next_buffer_len().min(self.recv_budget) as usize;
        self.recv_budget -= len as u64;
        Some(IoTask::recv(len, BufferType::Payload, true))
    }

    /// Push-pull runs lock-step: one outstanding task, alternating segments.
    fn next_pushpull_task(&mut self) -> Option<IoTask> {
        if self.outstanding_sends + self.outstanding_recvs > 0 {
            return None;
        }
        let remaining = self.state.remaining_transfer();
        if remaining == 0 {
            return None;
        }
        let buffer_len = self.next_buffer_len();
        let plan = self.pushpull.as_mut().expect("push-pull plan exists");
        if plan.segment_left == 0 {
            plan.in_push = !plan.in_push;
            plan.segment_left = if plan.in_push {
                plan.push_segment
            } else {
                plan.pull_segment
            };
        }

        let len = buffer_len.min(plan.segment_left).min(remaining) as usize;
        plan.segment_left -= len as u64;

        // the client sends the push segments; the server receives them
        let client_sends = plan.in_push;
        let this_side_sends = match self.role {
            Role::Client => client_sends,
            Role::Server => !client_sends,
        };
        Some(if this_side_sends {
            IoTask::send(self.payload_slice(len), BufferType::Payload, true)
        } else {
            IoTask::recv(len, BufferType::Payload, true)
        })
    }

    fn next_media_task(&mut self) -> Option<IoTask> {
        let media = self.media.as_mut().expect("media settings exist");
        debug_assert_eq!(media.phase, MediaPhase::Streaming);
        let frame_size = media.frame_size as usize;
        match self.role {
            Role::Client => {
                if self.recv_budget == 0 || self.outstanding_recvs >= self.pre_post_recvs {
                    return None;
                }
                let len = (frame_size as u64).min(self.recv_budget) as usize;
                self.recv_budget -= len as u64;
                Some(IoTask::recv(len, BufferType::Payload, true))
            }
            Role::Server => {
                if self.send_budget == 0 || self.outstanding_sends >= self.pre_post_sends {
                    return None;
                }
                let len = (frame_size as u64).min(self.send_budget) as usize;
                self.send_budget -= len as u64;

                let mut frame = self.payload_slice(len);
                let media = self.media.as_mut().expect("media settings exist");
                if len >= DATAGRAM_HEADER_LEN {
                    DatagramHeader {
                        sequence: media.next_send_sequence,
                        sender_clock: media.epoch.elapsed().as_nanos() as i64,
                        sender_clock_frequency: 1_000_000_000,
                    }
                    .encode(&mut frame);
                }
                media.next_send_sequence += 1;
                Some(IoTask::send(frame, BufferType::Payload, true))
            }
        }
    }

    /// The START / connection-id exchange that precedes a media stream.
    fn next_media_handshake_task(&mut self) -> Option<IoTask> {
        let media = self.media.as_mut()?;
        let task = match media.phase {
            MediaPhase::Streaming => return None,
            MediaPhase::ClientSendStart => IoTask::send_static(START_VERB),
            MediaPhase::ClientRecvId => IoTask::recv(
                CONNECTION_ID_DATAGRAM_LEN,
                BufferType::UdpConnectionId,
                false,
            ),
            MediaPhase::ServerAwaitStart => {
                IoTask::recv(START_VERB.len() + 11, BufferType::Payload, false)
            }
            MediaPhase::ServerSendId => {
                let mut datagram = vec![0u8; CONNECTION_ID_DATAGRAM_LEN];
                encode_connection_id_datagram(&mut datagram, &self.connection_id);
                IoTask::send(datagram, BufferType::UdpConnectionId, false)
            }
        };
        self.control_inflight = true;
        Some(task)
    }

    fn complete_media_handshake(
        &mut self,
        task: &IoTask,
        bytes_transferred: u64,
        error: Option<TransferError>,
    ) -> Verdict {
        if let Some(error) = error {
            self.set_last_error(error);
            self.state.update_error(Some(error));
            return Verdict::Failed;
        }
        let media = self.media.as_mut().expect("handshake implies media");
        match media.phase {
            MediaPhase::ClientSendStart => {
                media.phase = MediaPhase::ClientRecvId;
                Verdict::Continue
            }
            MediaPhase::ClientRecvId => {
                let datagram = &task.read_slice()[..bytes_transferred as usize];
                match decode_connection_id_datagram(datagram) {
                    Ok(id) => {
                        self.connection_id = id;
                        self.media.as_mut().expect("media").phase = MediaPhase::Streaming;
                        Verdict::Continue
                    }
                    Err(e) => {
                        tracing::debug!("bad connection-id datagram: {e}");
                        self.set_last_error(TransferError::CorruptFrame);
                        self.state.update_error(Some(TransferError::CorruptFrame));
                        Verdict::Failed
                    }
                }
            }
            MediaPhase::ServerAwaitStart => {
                let payload = &task.read_slice()[..bytes_transferred as usize];
                if is_start_verb(payload) {
                    media.phase = MediaPhase::ServerSendId;
                    Verdict::Continue
                } else {
                    tracing::debug!("expected START, received {bytes_transferred} bytes");
                    self.set_last_error(TransferError::CorruptFrame);
                    self.state.update_error(Some(TransferError::CorruptFrame));
                    Verdict::Failed
                }
            }
            MediaPhase::ServerSendId => {
                media.phase = MediaPhase::Streaming;
                Verdict::Continue
            }
            MediaPhase::Streaming => unreachable!("no handshake in flight while streaming"),
        }
    }

    fn is_streaming_media_recv(&self, task: &IoTask) -> bool {
        self.variant == PatternVariant::MediaStream
            && self.role == Role::Client
            && task.action == TaskAction::Recv
            && task.track_io
            && self
                .media
                .as_ref()
                .is_some_and(|m| m.phase == MediaPhase::Streaming)
    }

    fn classify_frame(&mut self, task: &IoTask, bytes_transferred: u64) -> FrameOutcome {
        let media = self.media.as_mut().expect("classify implies media");
        media
            .tracker
            .record_datagram(&task.read_slice()[..bytes_transferred as usize])
    }
}
