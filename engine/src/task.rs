//! The unit of work exchanged between the pattern layer and the I/O engine.

/// What the I/O engine should do with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    /// Nothing to do right now.
    None,
    Send,
    Recv,
    /// Half-close the send side and observe the peer's FIN.
    GracefulShutdown,
    /// Abortive close; the peer sees a reset.
    HardShutdown,
}

/// What the task's bytes are for. Connection-id and static buffers never
/// count toward transfer totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    Payload,
    TcpConnectionId,
    UdpConnectionId,
    Static,
}

/// Backing bytes for a task. Owned buffers hold send payloads or receive
/// space; static buffers are protocol constants that are never written.
#[derive(Debug)]
pub enum TaskBuffer {
    Owned(Vec<u8>),
    Static(&'static [u8]),
    None,
}

/// A single I/O request: created by the pattern, consumed once by the
/// engine, handed back on completion, never retained afterwards.
#[derive(Debug)]
pub struct IoTask {
    pub action: TaskAction,
    pub buffer: TaskBuffer,
    pub buffer_type: BufferType,
    /// Whether this task's bytes count toward the transfer totals.
    pub track_io: bool,
    /// Delay before the engine may issue this task (rate limiting).
    pub time_offset_ms: u64,
}

impl IoTask {
    pub fn none() -> Self {
        Self {
            action: TaskAction::None,
            buffer: TaskBuffer::None,
            buffer_type: BufferType::Static,
            track_io: false,
            time_offset_ms: 0,
        }
    }

    pub fn send(bytes: Vec<u8>, buffer_type: BufferType, track_io: bool) -> Self {
        Self {
            action: TaskAction::Send,
            buffer: TaskBuffer::Owned(bytes),
            buffer_type,
            track_io,
            time_offset_ms: 0,
        }
    }

    pub fn send_static(bytes: &'static [u8]) -> Self {
        Self {
            action: TaskAction::Send,
            buffer: TaskBuffer::Static(bytes),
            buffer_type: BufferType::Static,
            track_io: false,
            time_offset_ms: 0,
        }
    }

    pub fn recv(len: usize, buffer_type: BufferType, track_io: bool) -> Self {
        Self {
            action: TaskAction::Recv,
            buffer: TaskBuffer::Owned(vec![0u8; len]),
            buffer_type,
            track_io,
            time_offset_ms: 0,
        }
    }

    pub fn shutdown(action: TaskAction) -> Self {
        debug_assert!(matches!(
            action,
            TaskAction::GracefulShutdown | TaskAction::HardShutdown
        ));
        Self {
            action,
            buffer: TaskBuffer::None,
            buffer_type: BufferType::Static,
            track_io: false,
            time_offset_ms: 0,
        }
    }

    /// Length of the task's buffer in bytes.
    pub fn len(&self) -> usize {
        match &self.buffer {
            TaskBuffer::Owned(v) => v.len(),
            TaskBuffer::Static(s) => s.len(),
            TaskBuffer::None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes to transmit for a send task.
    pub fn read_slice(&self) -> &[u8] {
        match &self.buffer {
            TaskBuffer::Owned(v) => v,
            TaskBuffer::Static(s) => s,
            TaskBuffer::None => &[],
        }
    }

    /// Receive space for a recv task; `None` for static buffers.
    pub fn write_slice(&mut self) -> Option<&mut [u8]> {
        match &mut self.buffer {
            TaskBuffer::Owned(v) => Some(v.as_mut_slice()),
            _ => None,
        }
    }
}
