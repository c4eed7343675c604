//! The session: one multiplexed connection over one byte transport.
//!
//! A [`Session`] owns the stream table and everything connection-scoped:
//! frame reassembly over arbitrary transport chunking, per-type dispatch,
//! stream admission and backlog control, the ping/keepalive exchange, the
//! GoAway handshake, and teardown. It consumes the transport through two
//! primitives only — an injected outbound byte sink, and [`Session::receive`]
//! for inbound bytes — so it makes no assumptions about chunk sizes or how
//! the caller drives the socket.
//!
//! All connection state sits behind one mutex; frames are constructed under
//! the lock and emitted after it is released, so the lock is never held
//! across a transport write or a user callback.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::config::{BacklogMode, Config, ConfigError};
use crate::error::Error;
use crate::frame::{Flags, FrameType, GoAwayCode, Header, HEADER_LEN, PROTOCOL_VERSION};
use crate::stream::{Stream, StreamSlot, StreamState};

/// Which side of the connection this session is, deciding stream-id parity:
/// clients allocate odd ids starting at 1, servers even ids starting at 2,
/// so the two sides never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The peer that initiated the connection.
    Client,
    /// The peer that accepted the connection.
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// Callback invoked exactly once per accepted inbound stream.
pub type StreamCallback = Box<dyn FnMut(Stream) + Send>;

/// Callback invoked for terminal connection errors and keepalive failures.
pub type ErrorCallback = Box<dyn FnMut(&Error) + Send>;

struct Callbacks {
    on_stream: Option<StreamCallback>,
    on_error: Option<ErrorCallback>,
}

/// Connection-scoped mutable state, serialized behind one lock.
struct State {
    next_stream_id: u32,
    streams: BTreeMap<u32, Arc<StreamSlot>>,
    local_goaway: bool,
    remote_goaway: bool,
    shutdown: bool,
    ping_id: u32,
    pending_pings: BTreeSet<u32>,
    /// In-progress header when a chunk boundary split a frame.
    current_header: Option<Header>,
    /// Inbound bytes not yet consumed by reassembly.
    recv_buf: BytesMut,
    /// Streams ever registered, both directions; never decremented.
    total_registered: u64,
    terminal_error: Option<Error>,
}

pub(crate) struct SessionInner {
    pub(crate) config: Config,
    state: Mutex<State>,
    /// Wakes the keepalive thread on ping acknowledgement and shutdown.
    wake: Condvar,
    /// Outbound sink; `None` once the outbound side has ended.
    sink: Mutex<Option<Box<dyn Write + Send>>>,
    callbacks: Mutex<Callbacks>,
}

impl SessionInner {
    /// Serialize one frame to the transport.
    pub(crate) fn send_frame(&self, hdr: &Header, body: &[u8]) -> Result<(), Error> {
        let mut sink = self.sink.lock();
        let Some(writer) = sink.as_mut() else {
            return Err(Error::SessionShutdown);
        };
        let result = writer
            .write_all(&hdr.encode())
            .and_then(|()| writer.write_all(body))
            .and_then(|()| writer.flush());
        result.map_err(|err| {
            warn!(error = %err, "transport write failed");
            Error::from_io(&err)
        })
    }

    /// Drop a stream from the table; late frames for its id are discarded.
    pub(crate) fn unregister_stream(&self, id: u32) {
        self.state.lock().streams.remove(&id);
    }

    /// Report an error through the callback and retain the first one.
    fn surface_error(&self, err: &Error) {
        let mut callbacks = self.callbacks.lock();
        if let Some(cb) = callbacks.on_error.as_mut() {
            cb(err);
        }
        drop(callbacks);
        let mut state = self.state.lock();
        if state.terminal_error.is_none() {
            state.terminal_error = Some(err.clone());
        }
    }
}

/// A multiplexed connection.
///
/// Cheap to clone; clones share the same connection. See the module docs
/// for the threading model.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session with an explicit role.
    ///
    /// `sink` receives every outbound byte; `on_stream` (typically for
    /// servers) is handed each accepted inbound stream. The configuration
    /// is validated up front. When keepalive is enabled a background timer
    /// thread is spawned; it exits on [`Session::close`].
    pub fn new(
        role: Role,
        config: Config,
        sink: Box<dyn Write + Send>,
        on_stream: Option<StreamCallback>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let keep_alive = config.enable_keep_alive;
        let inner = Arc::new(SessionInner {
            config,
            state: Mutex::new(State {
                next_stream_id: role.first_stream_id(),
                streams: BTreeMap::new(),
                local_goaway: false,
                remote_goaway: false,
                shutdown: false,
                ping_id: 0,
                pending_pings: BTreeSet::new(),
                current_header: None,
                recv_buf: BytesMut::new(),
                total_registered: 0,
                terminal_error: None,
            }),
            wake: Condvar::new(),
            sink: Mutex::new(Some(sink)),
            callbacks: Mutex::new(Callbacks {
                on_stream,
                on_error: None,
            }),
        });

        let session = Self { inner };
        if keep_alive {
            let clone = session.clone();
            let spawned = thread::Builder::new()
                .name("filament-keepalive".into())
                .spawn(move || clone.keepalive_loop());
            if let Err(err) = spawned {
                warn!(error = %err, "failed to spawn keepalive thread");
            }
        }
        Ok(session)
    }

    /// Client-role session (odd stream ids).
    pub fn client(config: Config, sink: Box<dyn Write + Send>) -> Result<Self, ConfigError> {
        Self::new(Role::Client, config, sink, None)
    }

    /// Server-role session (even stream ids) with an accept callback.
    pub fn server(
        config: Config,
        sink: Box<dyn Write + Send>,
        on_stream: StreamCallback,
    ) -> Result<Self, ConfigError> {
        Self::new(Role::Server, config, sink, Some(on_stream))
    }

    /// Install the error callback. Expected to be wired before the
    /// transport starts delivering bytes.
    pub fn set_error_callback(&self, cb: ErrorCallback) {
        self.inner.callbacks.lock().on_error = Some(cb);
    }

    /// Whether teardown has begun.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Number of currently registered streams.
    #[must_use]
    pub fn num_streams(&self) -> usize {
        self.inner.state.lock().streams.len()
    }

    /// The first terminal error recorded, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<Error> {
        self.inner.state.lock().terminal_error.clone()
    }

    /// Open a new locally-initiated stream.
    ///
    /// The stream id is consumed even when the open is rejected, matching
    /// the reference behavior. Fails with [`Error::SessionShutdown`] after
    /// close and [`Error::RemoteGoAway`] once the remote stopped accepting
    /// streams.
    pub fn open(&self) -> Result<Stream, Error> {
        let (slot, id) = {
            let mut state = self.inner.state.lock();
            let id = state.next_stream_id;
            state.next_stream_id = state.next_stream_id.wrapping_add(2);
            if state.shutdown {
                return Err(Error::SessionShutdown);
            }
            if state.remote_goaway {
                return Err(Error::RemoteGoAway);
            }
            let slot = Arc::new(StreamSlot::new(id, StreamState::Init));
            state.streams.insert(id, slot.clone());
            state.total_registered += 1;
            (slot, id)
        };

        // The window update doubles as the SYN carrier.
        let update = slot
            .core
            .lock()
            .window_update_frame(self.inner.config.max_stream_window_size);
        if let Some(hdr) = update {
            self.inner.send_frame(&hdr, &[])?;
        }
        Ok(Stream::new(self.inner.clone(), slot, id))
    }

    /// Feed inbound transport bytes into the session.
    ///
    /// Chunks may split frames at any byte boundary; incomplete frames are
    /// buffered until completed by later input. Frame processing for one
    /// session must stay serialized — call this from a single driver.
    /// Fatal protocol errors close the session and are returned.
    pub fn receive(&self, chunk: &[u8]) -> Result<(), Error> {
        let mut to_send: Vec<Header> = Vec::new();
        let mut deliver: Vec<(u32, Arc<StreamSlot>)> = Vec::new();
        let mut fatal: Option<Error> = None;

        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                trace!(bytes = chunk.len(), "dropping input after shutdown");
                return Ok(());
            }
            state.recv_buf.extend_from_slice(chunk);

            while fatal.is_none() {
                let hdr = match state.current_header {
                    Some(hdr) => hdr,
                    None => {
                        if state.recv_buf.len() < HEADER_LEN {
                            break;
                        }
                        let hdr = Header::decode(&state.recv_buf[..HEADER_LEN]);
                        let _ = state.recv_buf.split_to(HEADER_LEN);
                        if hdr.version != PROTOCOL_VERSION {
                            error!(version = hdr.version, "invalid protocol version");
                            fatal = Some(Error::InvalidVersion(hdr.version));
                            break;
                        }
                        state.current_header = Some(hdr);
                        hdr
                    }
                };

                match hdr.frame_type() {
                    Some(FrameType::Data) => {
                        let body_len = hdr.length as usize;
                        if state.recv_buf.len() < body_len {
                            break; // await more input
                        }
                        let body = state.recv_buf.split_to(body_len);
                        state.current_header = None;
                        self.handle_stream_frame(
                            &mut state,
                            hdr,
                            Some(&body[..]),
                            &mut to_send,
                            &mut deliver,
                            &mut fatal,
                        );
                    }
                    Some(FrameType::WindowUpdate) => {
                        state.current_header = None;
                        self.handle_stream_frame(
                            &mut state,
                            hdr,
                            None,
                            &mut to_send,
                            &mut deliver,
                            &mut fatal,
                        );
                    }
                    Some(FrameType::Ping) => {
                        state.current_header = None;
                        if hdr.flags.contains(Flags::SYN) {
                            to_send.push(Header::ping(Flags::ACK, hdr.length));
                        } else if hdr.flags.contains(Flags::ACK)
                            && state.pending_pings.remove(&hdr.length)
                        {
                            self.inner.wake.notify_all();
                        }
                    }
                    Some(FrameType::GoAway) => {
                        state.current_header = None;
                        match GoAwayCode::from_u32(hdr.length) {
                            Some(GoAwayCode::Normal) => {
                                debug!("remote is no longer accepting streams");
                                state.remote_goaway = true;
                            }
                            Some(GoAwayCode::ProtocolError) => {
                                error!("received protocol error go away");
                                fatal = Some(Error::RemoteProtocolError);
                            }
                            Some(GoAwayCode::InternalError) => {
                                error!("received internal error go away");
                                fatal = Some(Error::RemoteInternalError);
                            }
                            None => {
                                error!(code = hdr.length, "received unexpected go away");
                                fatal = Some(Error::InvalidGoAwayCode(hdr.length));
                            }
                        }
                    }
                    None => {
                        error!(ty = hdr.ty, "invalid frame type");
                        fatal = Some(Error::InvalidFrameType(hdr.ty));
                    }
                }
            }
        }

        for hdr in &to_send {
            let _ = self.inner.send_frame(hdr, &[]);
        }
        for (id, slot) in deliver {
            self.deliver_stream(id, slot);
        }
        if let Some(err) = fatal {
            self.close_with(Some(err.clone()));
            return Err(err);
        }
        Ok(())
    }

    /// Route a `Data`/`WindowUpdate` frame to its stream.
    fn handle_stream_frame(
        &self,
        state: &mut State,
        hdr: Header,
        body: Option<&[u8]>,
        to_send: &mut Vec<Header>,
        deliver: &mut Vec<(u32, Arc<StreamSlot>)>,
        fatal: &mut Option<Error>,
    ) {
        if hdr.flags.contains(Flags::SYN) {
            self.incoming_stream(state, hdr.stream_id, to_send, deliver, fatal);
            return;
        }

        let Some(slot) = state.streams.get(&hdr.stream_id).cloned() else {
            // Likely a stream this side already reset; not an error.
            warn!(stream_id = hdr.stream_id, "discarding frame for unknown stream");
            return;
        };

        let mut core = slot.core.lock();
        let unregister = match core.process_flags(hdr.flags) {
            Ok(unregister) => unregister,
            Err(err) => {
                error!(
                    stream_id = hdr.stream_id,
                    state = ?core.state,
                    "unexpected FIN flag"
                );
                core.error = Some(err);
                drop(core);
                slot.wake.notify_all();
                return;
            }
        };

        match body {
            // Window update: flags first, then credit.
            None => {
                core.send_window = core.send_window.saturating_add(hdr.length);
            }
            Some(body) => {
                if !body.is_empty() {
                    if let Err(err) = core.recv_data(body) {
                        warn!(
                            stream_id = hdr.stream_id,
                            remain = core.recv_window,
                            size = body.len(),
                            "receive window exceeded"
                        );
                        core.error = Some(err);
                    }
                }
            }
        }
        drop(core);
        slot.wake.notify_all();

        if unregister {
            state.streams.remove(&hdr.stream_id);
        }
    }

    /// Admit (or reject) an inbound SYN.
    fn incoming_stream(
        &self,
        state: &mut State,
        id: u32,
        to_send: &mut Vec<Header>,
        deliver: &mut Vec<(u32, Arc<StreamSlot>)>,
        fatal: &mut Option<Error>,
    ) {
        if state.local_goaway {
            to_send.push(Header::window_update(Flags::RST, id, 0));
            return;
        }

        if state.streams.contains_key(&id) {
            error!(stream_id = id, "duplicate stream declared");
            to_send.push(Header::go_away(GoAwayCode::ProtocolError));
            *fatal = Some(Error::DuplicateStream);
            return;
        }

        let slot = Arc::new(StreamSlot::new(id, StreamState::SynReceived));
        state.streams.insert(id, slot.clone());
        state.total_registered += 1;

        let admitted = match self.inner.config.backlog_mode {
            BacklogMode::Cumulative => {
                state.total_registered <= u64::from(self.inner.config.accept_backlog)
            }
            BacklogMode::Live => state.streams.len() <= self.inner.config.accept_backlog as usize,
        };
        if !admitted {
            warn!(stream_id = id, "backlog exceeded, forcing stream reset");
            state.streams.remove(&id);
            to_send.push(Header::window_update(Flags::RST, id, 0));
            return;
        }

        deliver.push((id, slot));
    }

    fn deliver_stream(&self, id: u32, slot: Arc<StreamSlot>) {
        let stream = Stream::new(self.inner.clone(), slot, id);
        let mut callbacks = self.inner.callbacks.lock();
        match callbacks.on_stream.as_mut() {
            Some(cb) => cb(stream),
            None => debug!(stream_id = id, "no accept callback, inbound stream parked"),
        }
    }

    /// Close the session and every stream on it.
    ///
    /// Idempotent. Sends a best-effort `GoAway(normal)`, stops the
    /// keepalive thread, force-closes all streams (waking any blocked
    /// readers and writers), and ends the outbound side.
    pub fn close(&self) {
        self.close_with(None);
    }

    /// Close the session, surfacing `reason` through the error callback and
    /// the terminal-error slot.
    pub fn close_with_error(&self, reason: Error) {
        self.close_with(Some(reason));
    }

    pub(crate) fn close_with(&self, reason: Option<Error>) {
        let slots: Vec<Arc<StreamSlot>> = {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.pending_pings.clear();
            std::mem::take(&mut state.streams).into_values().collect()
        };

        let _ = self.inner.send_frame(&Header::go_away(GoAwayCode::Normal), &[]);

        for slot in slots {
            slot.core.lock().force_close();
            slot.wake.notify_all();
        }
        self.inner.wake.notify_all();

        if let Some(err) = reason {
            self.inner.surface_error(&err);
        }

        *self.inner.sink.lock() = None;
    }

    /// Block reading `transport` and feeding the session until EOF,
    /// shutdown, or a fatal error. Convenience for callers who own a
    /// blocking reader half; [`Session::receive`] is the primitive.
    pub fn drive<R: Read>(&self, mut transport: R) -> Result<(), Error> {
        let mut buf = [0u8; 16 * 1024];
        loop {
            if self.is_closed() {
                return Ok(());
            }
            match transport.read(&mut buf) {
                Ok(0) => {
                    self.close();
                    return Ok(());
                }
                Ok(n) => self.receive(&buf[..n])?,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    let err = Error::from_io(&err);
                    self.close_with(Some(err.clone()));
                    return Err(err);
                }
            }
        }
    }

    /// Periodic ping loop; one round per interval, each with its own
    /// acknowledgement deadline.
    fn keepalive_loop(&self) {
        let interval = self.inner.config.keep_alive_interval;
        let timeout = self.inner.config.connection_write_timeout;

        let mut state = self.inner.state.lock();
        loop {
            // Sleep one interval, leaving early only on shutdown.
            let tick = Instant::now() + interval;
            while !state.shutdown {
                if self.inner.wake.wait_until(&mut state, tick).timed_out() {
                    break;
                }
            }
            if state.shutdown {
                return;
            }

            let ping_id = state.ping_id;
            state.ping_id = state.ping_id.wrapping_add(1);
            state.pending_pings.insert(ping_id);
            drop(state);

            if let Err(err) = self.inner.send_frame(&Header::ping(Flags::SYN, ping_id), &[]) {
                debug!(error = %err, "keepalive ping not sent");
            }

            state = self.inner.state.lock();
            let deadline = Instant::now() + timeout;
            let mut timed_out = false;
            while !state.shutdown && state.pending_pings.contains(&ping_id) {
                if self.inner.wake.wait_until(&mut state, deadline).timed_out() {
                    timed_out = state.pending_pings.contains(&ping_id);
                    break;
                }
            }
            if state.shutdown {
                return;
            }
            if timed_out {
                state.pending_pings.remove(&ping_id);
                drop(state);
                error!(ping_id, "keepalive ping unacknowledged");
                self.inner.surface_error(&Error::KeepAliveTimeout);
                self.close_with(Some(Error::Timeout));
                return;
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Session")
            .field("streams", &state.streams.len())
            .field("shutdown", &state.shutdown)
            .field("local_goaway", &state.local_goaway)
            .field("remote_goaway", &state.remote_goaway)
            .finish_non_exhaustive()
    }
}
