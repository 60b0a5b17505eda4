//! The server event loop.
//!
//! A single `Poll` multiplexes the listener and every connection, with
//! the timer queue supplying the poll timeout. Connections live in a
//! slab keyed by their `Token`; delayed handler replies live in a
//! second slab and are delivered by timers, validated against the
//! connection generation so a reply never lands on a reused slot.
//! Closing deregisters the socket before it is dropped and is a no-op
//! for an already-closed connection.

use crate::chunk::{decode_header, Chunk, ChunkId};
use crate::config::Config;
use crate::handlers::{Fields, Handler, HandlerTable, Outcome};
use crate::runtime::connection::{Connection, Phase, Progress};
use crate::runtime::timer::{TimerEvent, TimerQueue};
use crate::runtime::ConnError;
use mio::net::UnixListener;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::fs;
use std::io;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 128;

/// A delayed handler reply waiting on its deadline. Held here, not on
/// the connection, so the slab entry keeps the reply alive until it is
/// delivered or the connection goes away.
#[derive(Debug)]
struct DelayedTask {
    conn_id: usize,
    gen: u64,
    reply: Chunk,
}

/// The server: listener, live connections, timers and shutdown state.
pub struct Server {
    config: Config,
    handlers: HandlerTable,
    poll: Poll,
    listener: UnixListener,
    connections: Slab<Connection>,
    tasks: Slab<DelayedTask>,
    timers: TimerQueue,
    shutting_down: bool,
    next_gen: u64,
}

impl Server {
    /// Bind the listening socket, removing a stale socket file first.
    pub fn bind(config: Config, handlers: HandlerTable) -> io::Result<Self> {
        match fs::remove_file(&config.socket) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let mut listener = UnixListener::bind(&config.socket)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Server {
            connections: Slab::with_capacity(config.max_connections),
            config,
            handlers,
            poll,
            listener,
            tasks: Slab::new(),
            timers: TimerQueue::new(),
            shutting_down: false,
            next_gen: 1,
        })
    }

    /// Drive the loop until a shutdown request drains every connection.
    pub fn run(&mut self) -> io::Result<()> {
        info!(socket = %self.config.socket.display(), "listening");
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            if self.shutting_down && self.connections.is_empty() {
                break;
            }

            let timeout = self
                .timers
                .next_deadline()
                .map(|at| at.saturating_duration_since(Instant::now()));
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_ready(),
                    Token(conn_id) => self.connection_ready(conn_id, event),
                }
            }

            self.fire_timers();
        }

        info!("server stopped");
        Ok(())
    }

    /// Accept pending connections until the listener would block.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if self.shutting_down {
                        // Drop the socket immediately; no Connection is built.
                        debug!("refusing connection during shutdown");
                        continue;
                    }
                    if self.connections.len() >= self.config.max_connections {
                        warn!("connection limit reached, rejecting connection");
                        continue;
                    }

                    let gen = self.next_gen;
                    self.next_gen += 1;
                    let conn_id = {
                        let entry = self.connections.vacant_entry();
                        let key = entry.key();
                        let mut conn = Connection::new(stream, gen);
                        if let Err(e) = self.poll.registry().register(
                            &mut conn.stream,
                            Token(key),
                            Interest::READABLE,
                        ) {
                            error!(error = %e, "failed to register connection");
                            continue;
                        }
                        entry.insert(conn);
                        key
                    };
                    self.touch_idle(conn_id);
                    debug!(conn = gen, "accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // A failed accept is transient; keep draining the
                    // backlog so queued connections are not stranded.
                    error!(error = %e, "accept error");
                    continue;
                }
            }
        }
    }

    fn connection_ready(&mut self, conn_id: usize, event: &mio::event::Event) {
        if !self.connections.contains(conn_id) {
            return; // stale event for a connection closed earlier this batch
        }

        if event.is_readable() {
            if let Err(e) = self.handle_readable(conn_id) {
                self.close_connection(conn_id, &e.to_string());
                return;
            }
        }

        if !self.connections.contains(conn_id) {
            return;
        }

        if event.is_writable() {
            if let Err(e) = self.handle_writable(conn_id) {
                self.close_connection(conn_id, &e.to_string());
            }
        }
    }

    /// Advance header/body reads; hand a completed request to dispatch.
    fn handle_readable(&mut self, conn_id: usize) -> Result<(), ConnError> {
        loop {
            match self.connections[conn_id].phase {
                Phase::Header | Phase::Body { .. } => {}
                _ => return Ok(()),
            }

            let before = self.connections[conn_id].fill_level();
            let progress = self.connections[conn_id].fill()?;
            if self.connections[conn_id].fill_level() > before {
                self.touch_idle(conn_id);
            }

            match progress {
                Progress::Blocked => return Ok(()),
                Progress::Eof => {
                    let conn = &self.connections[conn_id];
                    if matches!(conn.phase, Phase::Header) && conn.fill_level() == 0 {
                        return Err(ConnError::Disconnected);
                    }
                    return Err(ConnError::UnexpectedEof);
                }
                Progress::Complete => match self.connections[conn_id].phase {
                    Phase::Header => {
                        let (id, length) = decode_header(self.connections[conn_id].buffer())?;
                        let length = length as usize;
                        if length > self.config.max_request_size {
                            return Err(ConnError::OversizedRequest {
                                declared: length,
                                limit: self.config.max_request_size,
                            });
                        }
                        if length == 0 {
                            self.begin_dispatch(conn_id, id, Vec::new())?;
                            return Ok(());
                        }
                        self.connections[conn_id].begin_body(id, length);
                        // Loop again: body bytes may already be buffered.
                    }
                    Phase::Body { id } => {
                        let payload = self.connections[conn_id].take_body();
                        self.begin_dispatch(conn_id, id, payload)?;
                        return Ok(());
                    }
                    _ => return Ok(()),
                },
            }
        }
    }

    /// Drop the read registration and run the handler. The idle timeout
    /// is cleared first: a slow handler holds the connection open for
    /// as long as it needs.
    fn begin_dispatch(
        &mut self,
        conn_id: usize,
        id: ChunkId,
        payload: Vec<u8>,
    ) -> Result<(), ConnError> {
        {
            let conn = &mut self.connections[conn_id];
            conn.idle_deadline = None;
            conn.enter_dispatch();
            self.poll.registry().deregister(&mut conn.stream)?;
        }
        debug!(
            conn = self.connections[conn_id].gen,
            opcode = %id,
            len = payload.len(),
            "dispatching request"
        );
        self.dispatch(conn_id, id, payload)
    }

    fn dispatch(&mut self, conn_id: usize, id: ChunkId, payload: Vec<u8>) -> Result<(), ConnError> {
        let handler = self
            .handlers
            .get(id)
            .ok_or(ConnError::UnknownOpcode(id))?;

        let outcome = match handler {
            Handler::Raw(run) => run(&payload)?,
            Handler::Parsed(run) => {
                let fields = Fields::parse(&payload)?;
                run(&fields)?
            }
        };

        match outcome {
            Outcome::Reply(reply) => self.enqueue_response(conn_id, reply),
            Outcome::Shutdown { reply } => {
                info!("shutdown requested, draining connections");
                self.shutting_down = true;
                self.enqueue_response(conn_id, reply)
            }
            Outcome::DelayedReply { after, reply } => {
                let gen = self.connections[conn_id].gen;
                let task_id = self.tasks.insert(DelayedTask {
                    conn_id,
                    gen,
                    reply,
                });
                self.connections[conn_id].task = Some(task_id);
                self.timers
                    .schedule(Instant::now() + after, TimerEvent::Task { task_id });
                Ok(())
            }
            Outcome::Abandon => {
                self.close_connection(conn_id, "abandoned by handler");
                Ok(())
            }
        }
    }

    /// Queue exactly one response chunk and arm for writing. Also
    /// re-arms the idle timeout, which was cleared for the dispatch.
    fn enqueue_response(&mut self, conn_id: usize, reply: Chunk) -> Result<(), ConnError> {
        {
            let conn = &mut self.connections[conn_id];
            conn.begin_write(&reply);
            self.poll
                .registry()
                .register(&mut conn.stream, Token(conn_id), Interest::WRITABLE)?;
        }
        self.touch_idle(conn_id);
        Ok(())
    }

    /// Advance the response write; on completion either re-arm for the
    /// next request or, during shutdown, close.
    fn handle_writable(&mut self, conn_id: usize) -> Result<(), ConnError> {
        if self.connections[conn_id].phase != Phase::Write {
            return Ok(());
        }

        let before = self.connections[conn_id].write_level();
        let progress = self.connections[conn_id].flush()?;
        if self.connections[conn_id].write_level() > before {
            self.touch_idle(conn_id);
        }

        match progress {
            Progress::Blocked => Ok(()),
            Progress::Complete => {
                if self.shutting_down {
                    self.close_connection(conn_id, "server shutting down");
                    return Ok(());
                }
                let conn = &mut self.connections[conn_id];
                conn.begin_header();
                self.poll
                    .registry()
                    .reregister(&mut conn.stream, Token(conn_id), Interest::READABLE)?;
                self.touch_idle(conn_id);
                Ok(())
            }
            Progress::Eof => Ok(()), // flush never reports EOF
        }
    }

    /// Reset the idle deadline, ensuring one heap entry tracks it.
    fn touch_idle(&mut self, conn_id: usize) {
        if self.config.idle_timeout.is_zero() {
            return;
        }
        let deadline = Instant::now() + self.config.idle_timeout;
        let conn = &mut self.connections[conn_id];
        conn.idle_deadline = Some(deadline);
        if !conn.idle_timer_armed {
            conn.idle_timer_armed = true;
            let gen = conn.gen;
            self.timers
                .schedule(deadline, TimerEvent::Idle { conn_id, gen });
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(event) = self.timers.pop_due(now) {
            match event {
                TimerEvent::Idle { conn_id, gen } => self.idle_fired(conn_id, gen, now),
                TimerEvent::Task { task_id } => self.task_due(task_id),
            }
        }
    }

    fn idle_fired(&mut self, conn_id: usize, gen: u64, now: Instant) {
        let deadline = {
            let Some(conn) = self.connections.get_mut(conn_id) else {
                return;
            };
            if conn.gen != gen {
                return; // slot was reused, stale entry
            }
            conn.idle_timer_armed = false;
            conn.idle_deadline
        };
        match deadline {
            Some(at) if at <= now => self.close_connection(conn_id, "idle timeout"),
            Some(at) => {
                // The deadline moved; chase it with a fresh entry.
                let conn = &mut self.connections[conn_id];
                conn.idle_timer_armed = true;
                self.timers.schedule(at, TimerEvent::Idle { conn_id, gen });
            }
            None => {} // dispatch in progress, no timeout applies
        }
    }

    fn task_due(&mut self, task_id: usize) {
        let Some(task) = self.tasks.try_remove(task_id) else {
            return;
        };
        let alive = self
            .connections
            .get(task.conn_id)
            .is_some_and(|conn| conn.gen == task.gen);
        if !alive {
            debug!("dropping delayed reply for closed connection");
            return;
        }
        self.connections[task.conn_id].task = None;
        if let Err(e) = self.enqueue_response(task.conn_id, task.reply) {
            self.close_connection(task.conn_id, &e.to_string());
        }
    }

    /// Remove and drop a connection. Idempotent; deregisters before the
    /// socket is released so no stale event can fire against it.
    fn close_connection(&mut self, conn_id: usize, reason: &str) {
        let Some(mut conn) = self.connections.try_remove(conn_id) else {
            return;
        };
        if conn.registered() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
        if let Some(task_id) = conn.task.take() {
            self.tasks.try_remove(task_id);
        }
        debug!(conn = conn.gen, reason, "connection closed");
        if self.shutting_down && self.connections.is_empty() {
            debug!("all connections drained");
        }
    }
}
