//! Readiness-driven reactor with a completion-style surface.
//!
//! A single poll thread owns the registered sockets and their queued
//! operations. Submissions arrive from any thread through the shared table
//! and a waker. When a socket turns ready the poll thread performs the
//! non-blocking syscall and hands the finished operation - task, byte count,
//! error - to the completion pool, so callbacks for different connections run
//! in parallel.
//!
//! Sends complete once the full buffer has been written. Receives complete
//! with whatever a single read returns (zero at EOF), unless the operation
//! asks to accumulate until the buffer is full.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream, UdpSocket as MioUdpSocket};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;

use crate::pool::JobPool;
use crate::task::{IoTask, TaskAction};

const WAKER_TOKEN: Token = Token(usize::MAX - 1);
const LISTENER_TOKEN_OFFSET: usize = 1 << 30;

/// Completion callback: receives the task back together with the result.
pub type IoCallback = Box<dyn FnOnce(IoTask, io::Result<usize>) + Send>;
/// Connect completion callback; receives the registration handle so the
/// caller can adopt or close it.
pub type ConnectCallback = Box<dyn FnOnce(ConnHandle, io::Result<()>) + Send>;
/// Invoked on the completion pool for every accepted connection.
pub type AcceptHandler = Arc<dyn Fn(MioTcpStream, SocketAddr) + Send + Sync>;

/// Handle to a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnHandle(usize);

/// Handle to a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(usize);

enum ConnIo {
    Tcp(MioTcpStream),
    Udp(MioUdpSocket),
}

struct ReadOp {
    task: IoTask,
    progress: usize,
    /// Accumulate until the buffer is full rather than completing on the
    /// first read (MsgWaitAll).
    wait_all: bool,
    done: IoCallback,
}

enum WriteOp {
    Connect { done: ConnectCallback },
    Io { task: IoTask, progress: usize, done: IoCallback },
}

struct Conn {
    io: ConnIo,
    read_queue: VecDeque<ReadOp>,
    write_queue: VecDeque<WriteOp>,
    readable: bool,
    writable: bool,
    /// UDP sockets lock on to the first peer that sends to them.
    udp_connected: bool,
}

struct ListenerEntry {
    listener: MioTcpListener,
    handler: AcceptHandler,
    local_addr: SocketAddr,
    paused: bool,
}

struct Shared {
    conns: Slab<Conn>,
    listeners: Slab<ListenerEntry>,
    dirty: Vec<usize>,
    shutdown: bool,
}

pub struct Reactor {
    registry: Registry,
    waker: Waker,
    shared: Mutex<Shared>,
    jobs: JobPool,
}

impl Reactor {
    /// Spawn the poll thread and the completion pool.
    pub fn spawn(completion_threads: usize) -> io::Result<Arc<Reactor>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let reactor = Arc::new(Reactor {
            registry,
            waker,
            shared: Mutex::new(Shared {
                conns: Slab::with_capacity(1024),
                listeners: Slab::with_capacity(8),
                dirty: Vec::with_capacity(256),
                shutdown: false,
            }),
            jobs: JobPool::new(completion_threads),
        });

        let weak = Arc::downgrade(&reactor);
        thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || poll_loop(weak, poll))?;

        Ok(reactor)
    }

    /// Stop the poll thread; queued operations are dropped.
    pub fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        let _ = self.waker.wake();
    }

    /// Register an already-connected TCP stream (the accept path).
    pub fn register_tcp(&self, mut stream: MioTcpStream) -> io::Result<ConnHandle> {
        let mut shared = self.shared.lock();
        let entry = shared.conns.vacant_entry();
        let token = Token(entry.key());
        self.registry
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
        let key = entry.key();
        entry.insert(Conn {
            io: ConnIo::Tcp(stream),
            read_queue: VecDeque::new(),
            write_queue: VecDeque::new(),
            readable: false,
            writable: true,
            udp_connected: true,
        });
        Ok(ConnHandle(key))
    }

    /// Start a non-blocking connect on a prepared socket. The callback fires
    /// once the connect resolves.
    pub fn connect_tcp(
        &self,
        socket: socket2::Socket,
        addr: SocketAddr,
        done: ConnectCallback,
    ) -> io::Result<ConnHandle> {
        socket.set_nonblocking(true)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }
        let std_stream: std::net::TcpStream = socket.into();
        let mut stream = MioTcpStream::from_std(std_stream);

        let mut shared = self.shared.lock();
        let entry = shared.conns.vacant_entry();
        let token = Token(entry.key());
        self.registry
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
        let key = entry.key();
        entry.insert(Conn {
            io: ConnIo::Tcp(stream),
            read_queue: VecDeque::new(),
            write_queue: VecDeque::from([WriteOp::Connect { done }]),
            readable: false,
            writable: false,
            udp_connected: true,
        });
        Ok(ConnHandle(key))
    }

    /// Register a UDP socket. If it has not been connected, the first
    /// datagram received locks it on to that peer.
    pub fn register_udp(&self, socket: std::net::UdpSocket, connected: bool) -> io::Result<ConnHandle> {
        socket.set_nonblocking(true)?;
        let mut socket = MioUdpSocket::from_std(socket);

        let mut shared = self.shared.lock();
        let entry = shared.conns.vacant_entry();
        let token = Token(entry.key());
        self.registry
            .register(&mut socket, token, Interest::READABLE | Interest::WRITABLE)?;
        let key = entry.key();
        entry.insert(Conn {
            io: ConnIo::Udp(socket),
            read_queue: VecDeque::new(),
            write_queue: VecDeque::new(),
            readable: false,
            writable: true,
            udp_connected: connected,
        });
        Ok(ConnHandle(key))
    }

    /// Submit a send or recv. The callback always fires - on the completion
    /// pool once the operation resolves, or immediately with
    /// `ConnectionAborted` if the connection is gone.
    pub fn submit(&self, conn: ConnHandle, mut task: IoTask, wait_all: bool, done: IoCallback) {
        let mut shared = self.shared.lock();
        if shared.shutdown || !shared.conns.contains(conn.0) {
            drop(shared);
            self.jobs.execute(Box::new(move || {
                done(task, Err(io::Error::from(io::ErrorKind::ConnectionAborted)))
            }));
            return;
        }
        let entry = &mut shared.conns[conn.0];
        match task.action {
            TaskAction::Send => {
                entry.write_queue.push_back(WriteOp::Io { task, progress: 0, done });
            }
            TaskAction::Recv => {
                debug_assert!(task.write_slice().is_some());
                entry.read_queue.push_back(ReadOp { task, progress: 0, wait_all, done });
            }
            _ => {
                drop(shared);
                self.jobs.execute(Box::new(move || {
                    done(task, Err(io::Error::from(io::ErrorKind::InvalidInput)))
                }));
                return;
            }
        }
        if !shared.dirty.contains(&conn.0) {
            shared.dirty.push(conn.0);
        }
        drop(shared);
        let _ = self.waker.wake();
    }

    /// Half-close the send side.
    pub fn shutdown_send(&self, conn: ConnHandle) -> io::Result<()> {
        let shared = self.shared.lock();
        match shared.conns.get(conn.0) {
            Some(Conn { io: ConnIo::Tcp(stream), .. }) => stream.shutdown(Shutdown::Write),
            Some(_) => Err(io::Error::from(io::ErrorKind::InvalidInput)),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Close a connection. A hard close sets zero linger first so the peer
    /// observes a reset. Queued operations complete with `ConnectionAborted`.
    pub fn close(&self, conn: ConnHandle, hard: bool) {
        let removed = {
            let mut shared = self.shared.lock();
            if !shared.conns.contains(conn.0) {
                return;
            }
            shared.conns.remove(conn.0)
        };
        let mut entry = removed;
        match &mut entry.io {
            ConnIo::Tcp(stream) => {
                if hard {
                    set_abortive_linger(stream.as_raw_fd());
                }
                let _ = self.registry.deregister(stream);
            }
            ConnIo::Udp(socket) => {
                let _ = self.registry.deregister(socket);
            }
        }
        drop(entry.io);
        for op in entry.read_queue {
            self.jobs.execute(Box::new(move || {
                (op.done)(op.task, Err(io::Error::from(io::ErrorKind::ConnectionAborted)))
            }));
        }
        for op in entry.write_queue {
            match op {
                WriteOp::Connect { done } => self.jobs.execute(Box::new(move || {
                    done(conn, Err(io::Error::from(io::ErrorKind::ConnectionAborted)))
                })),
                WriteOp::Io { task, done, .. } => self.jobs.execute(Box::new(move || {
                    done(task, Err(io::Error::from(io::ErrorKind::ConnectionAborted)))
                })),
            }
        }
    }

    pub fn local_addr(&self, conn: ConnHandle) -> Option<SocketAddr> {
        let shared = self.shared.lock();
        match shared.conns.get(conn.0)? {
            Conn { io: ConnIo::Tcp(s), .. } => s.local_addr().ok(),
            Conn { io: ConnIo::Udp(s), .. } => s.local_addr().ok(),
        }
    }

    pub fn peer_addr(&self, conn: ConnHandle) -> Option<SocketAddr> {
        let shared = self.shared.lock();
        match shared.conns.get(conn.0)? {
            Conn { io: ConnIo::Tcp(s), .. } => s.peer_addr().ok(),
            Conn { io: ConnIo::Udp(s), .. } => s.peer_addr().ok(),
        }
    }

    /// Bind and register a listener; `handler` runs on the completion pool
    /// for every accepted connection.
    pub fn listen(
        &self,
        addr: SocketAddr,
        backlog: u32,
        handler: AcceptHandler,
    ) -> io::Result<ListenerHandle> {
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog as i32)?;

        let std_listener: std::net::TcpListener = socket.into();
        let local_addr = std_listener.local_addr()?;
        let mut listener = MioTcpListener::from_std(std_listener);

        let mut shared = self.shared.lock();
        let entry = shared.listeners.vacant_entry();
        let key = entry.key();
        self.registry.register(
            &mut listener,
            Token(key + LISTENER_TOKEN_OFFSET),
            Interest::READABLE,
        )?;
        entry.insert(ListenerEntry {
            listener,
            handler,
            local_addr,
            paused: false,
        });
        Ok(ListenerHandle(key))
    }

    pub fn listener_addr(&self, listener: ListenerHandle) -> Option<SocketAddr> {
        self.shared
            .lock()
            .listeners
            .get(listener.0)
            .map(|entry| entry.local_addr)
    }

    /// Stop accepting on a listener (backpressure when the ready queue is
    /// full); already-established connections stay in the kernel backlog.
    pub fn pause_listener(&self, listener: ListenerHandle) {
        let mut shared = self.shared.lock();
        if let Some(entry) = shared.listeners.get_mut(listener.0)
            && !entry.paused
        {
            entry.paused = true;
            let _ = self.registry.deregister(&mut entry.listener);
        }
    }

    pub fn resume_listener(&self, listener: ListenerHandle) {
        let mut shared = self.shared.lock();
        if let Some(entry) = shared.listeners.get_mut(listener.0)
            && entry.paused
        {
            entry.paused = false;
            let _ = self.registry.register(
                &mut entry.listener,
                Token(listener.0 + LISTENER_TOKEN_OFFSET),
                Interest::READABLE,
            );
        }
    }
}

fn set_abortive_linger(fd: i32) {
    let linger = libc::linger { l_onoff: 1, l_linger: 0 };
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        );
    }
}

fn poll_loop(weak: Weak<Reactor>, mut poll: Poll) {
    let mut events = Events::with_capacity(1024);
    loop {
        match poll.poll(&mut events, Some(Duration::from_millis(100))) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!("reactor poll failed: {e}");
                return;
            }
        }
        let Some(reactor) = weak.upgrade() else { return };
        if reactor.shared.lock().shutdown {
            return;
        }
        reactor.dispatch(&events);
    }
}

impl Reactor {
    fn dispatch(&self, events: &Events) {
        let mut shared = self.shared.lock();

        for event in events.iter() {
            let token = event.token().0;
            if event.token() == WAKER_TOKEN {
                continue;
            }
            if token >= LISTENER_TOKEN_OFFSET {
                self.accept_ready(&mut shared, token - LISTENER_TOKEN_OFFSET);
                continue;
            }
            let mut known = false;
            if let Some(conn) = shared.conns.get_mut(token) {
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    conn.readable = true;
                }
                if event.is_writable() || event.is_write_closed() || event.is_error() {
                    conn.writable = true;
                }
                known = true;
            }
            if known && !shared.dirty.contains(&token) {
                shared.dirty.push(token);
            }
        }

        let dirty = std::mem::take(&mut shared.dirty);
        for token in dirty {
            self.drive(&mut shared, token);
        }
    }

    fn accept_ready(&self, shared: &mut Shared, listener_idx: usize) {
        loop {
            let Some(entry) = shared.listeners.get(listener_idx) else { return };
            match entry.listener.accept() {
                Ok((stream, addr)) => {
                    let handler = Arc::clone(&entry.handler);
                    self.jobs.execute(Box::new(move || handler(stream, addr)));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!("accept failed: {e}");
                    return;
                }
            }
        }
    }

    fn drive(&self, shared: &mut Shared, token: usize) {
        self.drive_reads(shared, token);
        self.drive_writes(shared, token);
    }

    fn drive_reads(&self, shared: &mut Shared, token: usize) {
        loop {
            let Some(conn) = shared.conns.get_mut(token) else { return };
            let Conn { io, read_queue, readable, udp_connected, .. } = conn;
            if !*readable || read_queue.is_empty() {
                return;
            }
            let op = read_queue.front_mut().unwrap();
            let progress = op.progress;
            let task_len = op.task.len();
            let buf = op
                .task
                .write_slice()
                .expect("recv task without writable buffer");
            let is_tcp = matches!(io, ConnIo::Tcp(_));
            let result = match io {
                ConnIo::Tcp(stream) => stream.read(&mut buf[progress..]),
                ConnIo::Udp(socket) => {
                    // single datagram per operation; lock on to the first peer
                    match socket.recv_from(&mut buf[progress..]) {
                        Ok((n, from)) => {
                            if !*udp_connected && socket.connect(from).is_ok() {
                                *udp_connected = true;
                            }
                            Ok(n)
                        }
                        Err(e) => Err(e),
                    }
                }
            };
            match result {
                Ok(0) => {
                    // EOF; report whatever was accumulated (zero means FIN)
                    let op = read_queue.pop_front().unwrap();
                    let n = op.progress;
                    self.jobs.execute(Box::new(move || (op.done)(op.task, Ok(n))));
                }
                Ok(n) => {
                    let total = progress + n;
                    let wait_all = op.wait_all;
                    if wait_all && total < task_len && is_tcp {
                        op.progress = total;
                        continue;
                    }
                    let op = read_queue.pop_front().unwrap();
                    self.jobs
                        .execute(Box::new(move || (op.done)(op.task, Ok(total))));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    *readable = false;
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let op = read_queue.pop_front().unwrap();
                    self.jobs.execute(Box::new(move || (op.done)(op.task, Err(e))));
                }
            }
        }
    }

    fn drive_writes(&self, shared: &mut Shared, token: usize) {
        loop {
            let Some(conn) = shared.conns.get_mut(token) else { return };
            let Conn { io, write_queue, writable, .. } = conn;
            if !*writable || write_queue.is_empty() {
                return;
            }
            match write_queue.front_mut().unwrap() {
                WriteOp::Connect { .. } => {
                    let result = match &*io {
                        ConnIo::Tcp(stream) => match stream.take_error() {
                            Ok(Some(e)) => Some(Err(e)),
                            Ok(None) => match stream.peer_addr() {
                                Ok(_) => Some(Ok(())),
                                Err(e) if e.kind() == io::ErrorKind::NotConnected => None,
                                Err(e) => Some(Err(e)),
                            },
                            Err(e) => Some(Err(e)),
                        },
                        ConnIo::Udp(_) => Some(Ok(())),
                    };
                    match result {
                        Some(outcome) => {
                            let Some(WriteOp::Connect { done }) = write_queue.pop_front() else {
                                unreachable!()
                            };
                            let handle = ConnHandle(token);
                            self.jobs.execute(Box::new(move || done(handle, outcome)));
                        }
                        None => {
                            // connect still in flight
                            *writable = false;
                            return;
                        }
                    }
                }
                WriteOp::Io { task, progress, .. } => {
                    let data = task.read_slice();
                    let data_len = data.len();
                    let is_udp = matches!(io, ConnIo::Udp(_));
                    let result = match io {
                        ConnIo::Tcp(stream) => stream.write(&data[*progress..]),
                        ConnIo::Udp(socket) => socket.send(data),
                    };
                    match result {
                        Ok(n) => {
                            let total = if is_udp { data_len } else { *progress + n };
                            if total < data_len {
                                *progress = total;
                                continue;
                            }
                            let Some(WriteOp::Io { task, done, .. }) = write_queue.pop_front()
                            else {
                                unreachable!()
                            };
                            self.jobs.execute(Box::new(move || done(task, Ok(total))));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            *writable = false;
                            return;
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            let Some(WriteOp::Io { task, done, .. }) = write_queue.pop_front()
                            else {
                                unreachable!()
                            };
                            self.jobs.execute(Box::new(move || done(task, Err(e))));
                        }
                    }
                }
            }
        }
    }
}
