//! The per-connection protocol state machine.
//!
//! Tracks confirmed and in-flight byte counts against the transfer goal and
//! walks the connection through the application-level framing: the
//! connection-id exchange, the payload exchange, the server's completion
//! marker, and the configured teardown. The machine is transport-agnostic -
//! it sees only task tags, completed byte counts, and error codes.

use crate::error::TransferError;
use crate::settings::{Protocol, Role, TcpShutdownMode};
use crate::task::IoTask;
use protocol_traffic::CONNECTION_ID_LEN;

/// Abstract task the pattern layer should perform next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolTask {
    NoIo,
    SendConnectionId,
    RecvConnectionId,
    MoreIo,
    SendCompletion,
    RecvCompletion,
    GracefulShutdown,
    HardShutdown,
    RequestFin,
}

/// Outcome of a completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    NoError,
    TooManyBytes,
    TooFewBytes,
    IoFailed,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InternalState {
    Initialized,
    MoreIo,
    ServerSendConnectionId,
    ClientRecvConnectionId,
    ServerSendCompletion,
    ClientRecvCompletion,
    /// Instruct the engine to half-close the send side.
    GracefulShutdown,
    /// Force a reset instead of the four-way FIN.
    HardShutdown,
    /// The next request will be a recv for the zero-byte FIN.
    RequestFin,
    CompletedTransfer,
    ErrorIoFailed,
}

pub struct PatternState {
    confirmed_bytes: u64,
    inflight_bytes: u64,
    max_transfer: u64,
    /// Advisory cap on concurrently scheduled send bytes.
    ideal_send_backlog: u64,
    state: InternalState,
    /// Waiting for the task we just emitted to complete.
    pended: bool,
    role: Role,
    protocol: Protocol,
    shutdown: TcpShutdownMode,
}

impl PatternState {
    pub fn new(
        role: Role,
        protocol: Protocol,
        shutdown: TcpShutdownMode,
        max_transfer: u64,
        ideal_send_backlog: u64,
    ) -> Self {
        Self {
            confirmed_bytes: 0,
            inflight_bytes: 0,
            max_transfer,
            ideal_send_backlog,
            state: match protocol {
                // no connection-id handshake and no completion frame over UDP
                Protocol::Udp => InternalState::MoreIo,
                Protocol::Tcp => InternalState::Initialized,
            },
            pended: false,
            role,
            protocol,
            shutdown,
        }
    }

    pub fn confirmed_bytes(&self) -> u64 {
        self.confirmed_bytes
    }

    pub fn inflight_bytes(&self) -> u64 {
        self.inflight_bytes
    }

    pub fn max_transfer(&self) -> u64 {
        self.max_transfer
    }

    pub fn set_max_transfer(&mut self, max_transfer: u64) {
        self.max_transfer = max_transfer;
    }

    pub fn ideal_send_backlog(&self) -> u64 {
        self.ideal_send_backlog
    }

    pub fn remaining_transfer(&self) -> u64 {
        let already = self.confirmed_bytes + self.inflight_bytes;
        debug_assert!(already <= self.max_transfer);
        self.max_transfer - already
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            self.state,
            InternalState::CompletedTransfer | InternalState::ErrorIoFailed
        )
    }

    pub fn is_current_task_more_io(&self) -> bool {
        self.state == InternalState::MoreIo
    }

    /// Emit the next abstract task. States that must finish before the
    /// machine advances set `pended`; while pended, only `NoIo` is emitted.
    pub fn next_task(&mut self) -> ProtocolTask {
        if self.pended {
            return ProtocolTask::NoIo;
        }

        match self.state {
            InternalState::Initialized => {
                if self.role.is_listening() {
                    self.pended = true;
                    self.state = InternalState::ServerSendConnectionId;
                    ProtocolTask::SendConnectionId
                } else {
                    self.pended = true;
                    self.state = InternalState::ClientRecvConnectionId;
                    ProtocolTask::RecvConnectionId
                }
            }

            // both sides start IO once the connection id has been shared
            InternalState::ServerSendConnectionId | InternalState::ClientRecvConnectionId => {
                self.state = InternalState::MoreIo;
                ProtocolTask::MoreIo
            }

            InternalState::MoreIo => {
                if self.confirmed_bytes + self.inflight_bytes < self.max_transfer {
                    ProtocolTask::MoreIo
                } else {
                    ProtocolTask::NoIo
                }
            }

            InternalState::ServerSendCompletion => {
                self.pended = true;
                ProtocolTask::SendCompletion
            }

            InternalState::ClientRecvCompletion => {
                self.pended = true;
                ProtocolTask::RecvCompletion
            }

            InternalState::GracefulShutdown => {
                self.pended = true;
                ProtocolTask::GracefulShutdown
            }

            InternalState::HardShutdown => {
                self.pended = true;
                ProtocolTask::HardShutdown
            }

            InternalState::RequestFin => {
                self.pended = true;
                ProtocolTask::RequestFin
            }

            InternalState::CompletedTransfer | InternalState::ErrorIoFailed => ProtocolTask::NoIo,
        }
    }

    /// Account a task the engine is about to issue.
    pub fn notify_task(&mut self, task: &IoTask) {
        if task.track_io {
            self.inflight_bytes += task.len() as u64;
        }
    }

    /// Account stream bytes consumed by datagrams that never arrived. Only
    /// meaningful for UDP, where completion is purely byte-count based: the
    /// stream position advances over a loss gap so the transfer still
    /// terminates.
    pub fn account_skipped(&mut self, bytes: u64) -> ProtocolError {
        debug_assert_eq!(self.protocol, Protocol::Udp);
        let headroom = self.max_transfer - self.confirmed_bytes - self.inflight_bytes;
        self.confirmed_bytes += bytes.min(headroom);
        if self.confirmed_bytes + self.inflight_bytes == self.max_transfer
            && self.inflight_bytes == 0
        {
            self.state = InternalState::CompletedTransfer;
            ProtocolError::Completed
        } else {
            ProtocolError::NoError
        }
    }

    /// Fold a transport error into the machine. A nonzero error fails the
    /// connection unless the server is waiting for the client's FIN and the
    /// client reset instead - the expected teardown in hard-shutdown mode.
    pub fn update_error(&mut self, error: Option<TransferError>) -> ProtocolError {
        if self.state == InternalState::ErrorIoFailed {
            return ProtocolError::IoFailed;
        }
        let Some(error) = error else {
            return ProtocolError::NoError;
        };

        match self.protocol {
            Protocol::Udp => {
                self.state = InternalState::ErrorIoFailed;
                ProtocolError::IoFailed
            }
            Protocol::Tcp => {
                if self.is_completed() {
                    return ProtocolError::NoError;
                }
                if self.role.is_listening()
                    && self.state == InternalState::RequestFin
                    && error.is_benign_reset()
                {
                    ProtocolError::NoError
                } else {
                    self.state = InternalState::ErrorIoFailed;
                    ProtocolError::IoFailed
                }
            }
        }
    }

    /// Account a completed task and advance the protocol.
    pub fn completed_task(&mut self, task: &IoTask, bytes_transferred: u64) -> ProtocolError {
        if self.state == InternalState::ErrorIoFailed {
            return ProtocolError::IoFailed;
        }
        // a straggling completion after the transfer finished (the close
        // path flushing queued operations) has nothing left to advance
        if self.state == InternalState::CompletedTransfer {
            return ProtocolError::NoError;
        }

        // the connection-id exchange must complete in full before any
        // payload accounting happens
        if matches!(
            self.state,
            InternalState::ServerSendConnectionId | InternalState::ClientRecvConnectionId
        ) {
            if bytes_transferred != CONNECTION_ID_LEN as u64 {
                tracing::debug!(
                    bytes_transferred,
                    expected = CONNECTION_ID_LEN,
                    "connection id exchange fell short"
                );
                self.state = InternalState::ErrorIoFailed;
                return ProtocolError::TooFewBytes;
            }
            self.pended = false;
        }

        if task.track_io {
            let task_bytes = task.len() as u64;
            assert!(
                bytes_transferred <= self.inflight_bytes,
                "completed more bytes ({bytes_transferred}) than were in flight ({})",
                self.inflight_bytes
            );
            assert!(
                task_bytes <= self.inflight_bytes,
                "task requested more bytes ({task_bytes}) than were in flight ({})",
                self.inflight_bytes
            );
            assert!(
                bytes_transferred <= task_bytes,
                "completed more bytes ({bytes_transferred}) than were posted ({task_bytes})"
            );
            self.inflight_bytes -= task_bytes;
            self.confirmed_bytes += bytes_transferred;
        }

        let already_transferred = self.confirmed_bytes + self.inflight_bytes;

        // UDP just tracks bytes
        if self.protocol == Protocol::Udp {
            return if already_transferred == self.max_transfer {
                self.state = InternalState::CompletedTransfer;
                ProtocolError::Completed
            } else {
                ProtocolError::NoError
            };
        }

        if already_transferred < self.max_transfer {
            // a zero-byte completion is the peer exiting before the
            // transfer finished
            if bytes_transferred == 0 {
                tracing::debug!(
                    already_transferred,
                    max_transfer = self.max_transfer,
                    "transfer ended early"
                );
                self.state = InternalState::ErrorIoFailed;
                return ProtocolError::TooFewBytes;
            }
        } else if already_transferred == self.max_transfer {
            // pended IO must drain before the shutdown sequence starts
            if self.inflight_bytes == 0 {
                if self.role.is_listening() {
                    return self.advance_server(bytes_transferred);
                }
                return self.advance_client(bytes_transferred);
            }
        } else {
            tracing::debug!(
                already_transferred,
                max_transfer = self.max_transfer,
                "transfer overran"
            );
            self.state = InternalState::ErrorIoFailed;
            return ProtocolError::TooManyBytes;
        }

        ProtocolError::NoError
    }

    /// Servers send their completion marker, then wait for the client's FIN.
    fn advance_server(&mut self, bytes_transferred: u64) -> ProtocolError {
        match self.state {
            InternalState::MoreIo => {
                self.state = InternalState::ServerSendCompletion;
                self.pended = false;
                ProtocolError::NoError
            }
            InternalState::ServerSendCompletion => {
                self.state = InternalState::RequestFin;
                self.pended = false;
                ProtocolError::NoError
            }
            InternalState::RequestFin => {
                if bytes_transferred != 0 {
                    self.state = InternalState::ErrorIoFailed;
                    ProtocolError::TooManyBytes
                } else {
                    self.state = InternalState::CompletedTransfer;
                    ProtocolError::Completed
                }
            }
            other => unreachable!("server completed a task in state {other:?}"),
        }
    }

    /// Clients receive the completion marker, then run their configured
    /// teardown.
    fn advance_client(&mut self, bytes_transferred: u64) -> ProtocolError {
        match self.state {
            InternalState::MoreIo => {
                self.state = InternalState::ClientRecvCompletion;
                self.pended = false;
                ProtocolError::NoError
            }
            InternalState::ClientRecvCompletion => {
                if bytes_transferred != protocol_traffic::COMPLETION_MARKER_LEN as u64 {
                    tracing::debug!(
                        bytes_transferred,
                        "server did not return a completion marker"
                    );
                    self.state = InternalState::ErrorIoFailed;
                    return ProtocolError::TooFewBytes;
                }
                self.state = if self.shutdown.is_hard() {
                    InternalState::HardShutdown
                } else {
                    InternalState::GracefulShutdown
                };
                self.pended = false;
                ProtocolError::NoError
            }
            InternalState::GracefulShutdown => {
                self.state = InternalState::RequestFin;
                self.pended = false;
                ProtocolError::NoError
            }
            InternalState::RequestFin => {
                if bytes_transferred != 0 {
                    self.state = InternalState::ErrorIoFailed;
                    ProtocolError::TooManyBytes
                } else {
                    self.state = InternalState::CompletedTransfer;
                    ProtocolError::Completed
                }
            }
            InternalState::HardShutdown => {
                self.state = InternalState::CompletedTransfer;
                ProtocolError::Completed
            }
            other => unreachable!("client completed a task in state {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::BufferType;

    fn tracked(len: usize) -> IoTask {
        IoTask::recv(len, BufferType::Payload, true)
    }

    fn untracked(len: usize) -> IoTask {
        IoTask::recv(len, BufferType::TcpConnectionId, false)
    }

    fn client(max: u64) -> PatternState {
        PatternState::new(
            Role::Client,
            Protocol::Tcp,
            TcpShutdownMode::Graceful,
            max,
            u64::MAX,
        )
    }

    fn server(max: u64) -> PatternState {
        PatternState::new(
            Role::Server,
            Protocol::Tcp,
            TcpShutdownMode::Graceful,
            max,
            u64::MAX,
        )
    }

    #[test]
    fn pended_state_emits_no_io_until_completed() {
        let mut state = client(100);
        assert_eq!(state.next_task(), ProtocolTask::RecvConnectionId);
        // pended until the exchange completes
        assert_eq!(state.next_task(), ProtocolTask::NoIo);
        assert_eq!(state.next_task(), ProtocolTask::NoIo);

        let id_task = untracked(CONNECTION_ID_LEN);
        assert_eq!(
            state.completed_task(&id_task, CONNECTION_ID_LEN as u64),
            ProtocolError::NoError
        );
        assert_eq!(state.next_task(), ProtocolTask::MoreIo);
    }

    #[test]
    fn short_connection_id_fails_with_too_few_bytes() {
        let mut state = client(100);
        state.next_task();
        let id_task = untracked(CONNECTION_ID_LEN);
        assert_eq!(
            state.completed_task(&id_task, 20),
            ProtocolError::TooFewBytes
        );
        assert!(state.is_completed());
        assert_eq!(state.next_task(), ProtocolTask::NoIo);
    }

    #[test]
    fn udp_completes_purely_on_byte_count() {
        let mut state = PatternState::new(
            Role::Client,
            Protocol::Udp,
            TcpShutdownMode::Graceful,
            200,
            u64::MAX,
        );
        assert_eq!(state.next_task(), ProtocolTask::MoreIo);

        let task = tracked(100);
        state.notify_task(&task);
        assert_eq!(state.completed_task(&task, 100), ProtocolError::NoError);

        state.notify_task(&task);
        assert_eq!(state.completed_task(&task, 100), ProtocolError::Completed);
        assert!(state.is_completed());
        assert_eq!(state.confirmed_bytes(), 200);
    }

    #[test]
    fn invariant_confirmed_plus_inflight_bounded() {
        let mut state = client(300);
        state.next_task();
        let id = untracked(CONNECTION_ID_LEN);
        state.completed_task(&id, CONNECTION_ID_LEN as u64);

        for _ in 0..3 {
            assert_eq!(state.next_task(), ProtocolTask::MoreIo);
            let task = tracked(100);
            state.notify_task(&task);
            assert!(state.confirmed_bytes() + state.inflight_bytes() <= 300);
            state.completed_task(&task, 100);
            assert!(state.confirmed_bytes() + state.inflight_bytes() <= 300);
        }
        assert_eq!(state.confirmed_bytes(), 300);
    }

    #[test]
    fn zero_byte_read_mid_transfer_is_too_few_bytes() {
        let mut state = server(1000);
        assert_eq!(state.next_task(), ProtocolTask::SendConnectionId);
        let id = untracked(CONNECTION_ID_LEN);
        state.completed_task(&id, CONNECTION_ID_LEN as u64);
        assert_eq!(state.next_task(), ProtocolTask::MoreIo);

        let task = tracked(1000);
        state.notify_task(&task);
        assert_eq!(state.completed_task(&task, 0), ProtocolError::TooFewBytes);
        assert!(state.is_completed());
    }

    #[test]
    fn client_graceful_shutdown_sequence() {
        let mut state = client(100);
        state.next_task();
        let id = untracked(CONNECTION_ID_LEN);
        state.completed_task(&id, CONNECTION_ID_LEN as u64);

        assert_eq!(state.next_task(), ProtocolTask::MoreIo);
        let task = tracked(100);
        state.notify_task(&task);
        assert_eq!(state.completed_task(&task, 100), ProtocolError::NoError);

        assert_eq!(state.next_task(), ProtocolTask::RecvCompletion);
        let marker = untracked(4);
        state.notify_task(&marker);
        assert_eq!(state.completed_task(&marker, 4), ProtocolError::NoError);

        assert_eq!(state.next_task(), ProtocolTask::GracefulShutdown);
        let shutdown = IoTask::shutdown(crate::task::TaskAction::GracefulShutdown);
        assert_eq!(state.completed_task(&shutdown, 0), ProtocolError::NoError);

        assert_eq!(state.next_task(), ProtocolTask::RequestFin);
        let fin = untracked(16);
        assert_eq!(state.completed_task(&fin, 0), ProtocolError::Completed);
        assert!(state.is_completed());
    }

    #[test]
    fn client_hard_shutdown_skips_the_fin_wait() {
        let mut state = PatternState::new(
            Role::Client,
            Protocol::Tcp,
            TcpShutdownMode::Hard,
            100,
            u64::MAX,
        );
        state.next_task();
        let id = untracked(CONNECTION_ID_LEN);
        state.completed_task(&id, CONNECTION_ID_LEN as u64);

        state.next_task();
        let task = tracked(100);
        state.notify_task(&task);
        state.completed_task(&task, 100);

        assert_eq!(state.next_task(), ProtocolTask::RecvCompletion);
        let marker = untracked(4);
        state.notify_task(&marker);
        state.completed_task(&marker, 4);

        assert_eq!(state.next_task(), ProtocolTask::HardShutdown);
        let shutdown = IoTask::shutdown(crate::task::TaskAction::HardShutdown);
        assert_eq!(state.completed_task(&shutdown, 0), ProtocolError::Completed);
    }

    #[test]
    fn short_completion_marker_fails() {
        let mut state = client(100);
        state.next_task();
        let id = untracked(CONNECTION_ID_LEN);
        state.completed_task(&id, CONNECTION_ID_LEN as u64);
        state.next_task();
        let task = tracked(100);
        state.notify_task(&task);
        state.completed_task(&task, 100);

        assert_eq!(state.next_task(), ProtocolTask::RecvCompletion);
        let marker = untracked(4);
        state.notify_task(&marker);
        assert_eq!(state.completed_task(&marker, 2), ProtocolError::TooFewBytes);
    }

    #[test]
    fn server_sequence_requires_a_zero_byte_fin() {
        let mut state = server(100);
        state.next_task();
        let id = untracked(CONNECTION_ID_LEN);
        state.completed_task(&id, CONNECTION_ID_LEN as u64);

        assert_eq!(state.next_task(), ProtocolTask::MoreIo);
        let task = tracked(100);
        state.notify_task(&task);
        assert_eq!(state.completed_task(&task, 100), ProtocolError::NoError);

        assert_eq!(state.next_task(), ProtocolTask::SendCompletion);
        let marker = untracked(4);
        state.notify_task(&marker);
        assert_eq!(state.completed_task(&marker, 4), ProtocolError::NoError);

        assert_eq!(state.next_task(), ProtocolTask::RequestFin);
        let fin = untracked(16);
        assert_eq!(state.completed_task(&fin, 0), ProtocolError::Completed);
    }

    #[test]
    fn server_fin_with_data_is_too_many_bytes() {
        let mut state = server(100);
        state.next_task();
        let id = untracked(CONNECTION_ID_LEN);
        state.completed_task(&id, CONNECTION_ID_LEN as u64);
        state.next_task();
        let task = tracked(100);
        state.notify_task(&task);
        state.completed_task(&task, 100);
        state.next_task();
        let marker = untracked(4);
        state.notify_task(&marker);
        state.completed_task(&marker, 4);
        state.next_task();

        let fin = untracked(16);
        assert_eq!(state.completed_task(&fin, 7), ProtocolError::TooManyBytes);
    }

    #[test]
    fn reset_while_server_awaits_fin_is_benign() {
        let mut state = server(100);
        state.next_task();
        let id = untracked(CONNECTION_ID_LEN);
        state.completed_task(&id, CONNECTION_ID_LEN as u64);
        state.next_task();
        let task = tracked(100);
        state.notify_task(&task);
        state.completed_task(&task, 100);
        state.next_task();
        let marker = untracked(4);
        state.notify_task(&marker);
        state.completed_task(&marker, 4);
        assert_eq!(state.next_task(), ProtocolTask::RequestFin);

        // the client may RST rather than FIN after it has the completion
        assert_eq!(
            state.update_error(Some(TransferError::Io(
                std::io::ErrorKind::ConnectionReset
            ))),
            ProtocolError::NoError
        );
        assert!(!state.is_completed());

        // but an unrelated failure is still terminal
        assert_eq!(
            state.update_error(Some(TransferError::Io(
                std::io::ErrorKind::BrokenPipe
            ))),
            ProtocolError::IoFailed
        );
        assert!(state.is_completed());
    }

    #[test]
    fn waits_for_inflight_io_before_shutdown() {
        let mut state = server(200);
        state.next_task();
        let id = untracked(CONNECTION_ID_LEN);
        state.completed_task(&id, CONNECTION_ID_LEN as u64);

        state.next_task();
        let first = tracked(100);
        let second = tracked(100);
        state.notify_task(&first);
        state.next_task();
        state.notify_task(&second);

        // first completion: transfer total reached but IO is still in flight
        assert_eq!(state.completed_task(&first, 100), ProtocolError::NoError);
        assert_eq!(state.next_task(), ProtocolTask::NoIo);

        // second completion drains the in-flight count and advances
        assert_eq!(state.completed_task(&second, 100), ProtocolError::NoError);
        assert_eq!(state.next_task(), ProtocolTask::SendCompletion);
    }
}
