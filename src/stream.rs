//! Per-stream state machine, flow-control windows, and the app-facing
//! stream handle.
//!
//! Protocol state for every stream lives in a [`StreamCore`] owned by the
//! session's stream table; the public [`Stream`] handle reaches that state
//! through a shared slot and talks to the session only to emit frames and
//! to request its own removal. State-machine methods mutate the core and
//! return what the caller must send, keeping the transition logic free of
//! I/O.
//!
//! # Lifecycle
//!
//! ```text
//!  Init ──first send──▶ SynSent ──ACK──▶ Established
//!  SynReceived ──first send (ACK)──────▶ Established
//!  {SynSent,SynReceived,Established} ──local close──▶ LocalClose ──FIN──▶ Closed
//!  {SynSent,SynReceived,Established} ──peer FIN───▶ RemoteClose
//!  any ──RST──▶ Reset        any ──session teardown──▶ Closed
//! ```

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::error::Error;
use crate::frame::{Flags, Header, INITIAL_STREAM_WINDOW};
use crate::session::SessionInner;

/// Stream lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Locally opened, nothing sent yet.
    Init,
    /// SYN emitted, awaiting the peer's ACK.
    SynSent,
    /// Inbound SYN accepted, ACK not yet emitted.
    SynReceived,
    /// Both sides have seen the handshake.
    Established,
    /// We sent FIN; the peer may still send.
    LocalClose,
    /// The peer sent FIN; we may still send.
    RemoteClose,
    /// Fully closed.
    Closed,
    /// Hard reset.
    Reset,
}

/// What a local `close()` must do after the state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseAction {
    /// Send FIN, stay registered awaiting the peer's FIN.
    SendFin,
    /// Send FIN and unregister (the peer already half-closed, or this is a
    /// repeated close).
    SendFinUnregister,
    /// Nothing to do.
    None,
}

/// Protocol state of one stream. All access is serialized through the
/// owning [`StreamSlot`]'s mutex.
#[derive(Debug)]
pub(crate) struct StreamCore {
    pub(crate) id: u32,
    pub(crate) state: StreamState,
    /// Bytes we may still send without further credit from the peer.
    pub(crate) send_window: u32,
    /// Bytes the peer may still send without further credit from us.
    pub(crate) recv_window: u32,
    /// Received, not yet consumed by the application.
    pub(crate) recv_buf: VecDeque<u8>,
    /// Sticky per-stream error (unexpected flag, window exceeded).
    pub(crate) error: Option<Error>,
}

impl StreamCore {
    pub(crate) fn new(id: u32, state: StreamState) -> Self {
        Self {
            id,
            state,
            send_window: INITIAL_STREAM_WINDOW,
            recv_window: INITIAL_STREAM_WINDOW,
            recv_buf: VecDeque::new(),
            error: None,
        }
    }

    /// Flags to attach to the next outbound frame, advancing the handshake
    /// phase as a side effect.
    pub(crate) fn send_flags(&mut self) -> Flags {
        match self.state {
            StreamState::Init => {
                self.state = StreamState::SynSent;
                Flags::SYN
            }
            StreamState::SynReceived => {
                self.state = StreamState::Established;
                Flags::ACK
            }
            _ => Flags::empty(),
        }
    }

    /// Apply inbound header flags to the state machine.
    ///
    /// Returns `Ok(true)` when the stream reached a terminal state and must
    /// be unregistered from the session's table. A FIN in a state that
    /// cannot accept one yields [`Error::UnexpectedFlag`] and leaves the
    /// state untouched.
    pub(crate) fn process_flags(&mut self, flags: Flags) -> Result<bool, Error> {
        let mut unregister = false;

        if flags.contains(Flags::ACK) && self.state == StreamState::SynSent {
            self.state = StreamState::Established;
        }

        if flags.contains(Flags::FIN) {
            match self.state {
                StreamState::SynSent | StreamState::SynReceived | StreamState::Established => {
                    self.state = StreamState::RemoteClose;
                }
                StreamState::LocalClose => {
                    self.state = StreamState::Closed;
                    unregister = true;
                }
                _ => return Err(Error::UnexpectedFlag),
            }
        }

        if flags.contains(Flags::RST) {
            self.state = StreamState::Reset;
            unregister = true;
        }

        Ok(unregister)
    }

    /// Local close per the transition table.
    pub(crate) fn local_close(&mut self) -> CloseAction {
        match self.state {
            StreamState::SynSent | StreamState::SynReceived | StreamState::Established => {
                self.state = StreamState::LocalClose;
                CloseAction::SendFin
            }
            StreamState::LocalClose | StreamState::RemoteClose => {
                self.state = StreamState::LocalClose;
                CloseAction::SendFinUnregister
            }
            StreamState::Init | StreamState::Closed | StreamState::Reset => CloseAction::None,
        }
    }

    /// Buffer an inbound data payload against the receive window.
    pub(crate) fn recv_data(&mut self, body: &[u8]) -> Result<(), Error> {
        let len = body.len() as u32;
        if len > self.recv_window {
            return Err(Error::ReceiveWindowExceeded);
        }
        self.recv_window -= len;
        self.recv_buf.extend(body);
        Ok(())
    }

    /// Compute the window-update frame to send, if any.
    ///
    /// The delta restores the window to `max_window` minus what is still
    /// buffered. Small deltas are suppressed to avoid chatty updates unless
    /// a handshake flag must be carried; when a frame is produced the local
    /// window is credited immediately.
    pub(crate) fn window_update_frame(&mut self, max_window: u32) -> Option<Header> {
        let used = self.recv_buf.len() as u64 + u64::from(self.recv_window);
        let delta = u64::from(max_window).saturating_sub(used) as u32;

        let flags = self.send_flags();
        if delta < max_window / 2 && flags.is_empty() {
            return None;
        }

        self.recv_window += delta;
        Some(Header::window_update(flags, self.id, delta))
    }

    /// Forced close on session teardown; no frame exchange.
    pub(crate) fn force_close(&mut self) {
        self.state = StreamState::Closed;
    }
}

/// Shared slot: the core plus the condvar that wakes blocked readers and
/// writers on it.
#[derive(Debug)]
pub(crate) struct StreamSlot {
    pub(crate) core: Mutex<StreamCore>,
    pub(crate) wake: Condvar,
}

impl StreamSlot {
    pub(crate) fn new(id: u32, state: StreamState) -> Self {
        Self {
            core: Mutex::new(StreamCore::new(id, state)),
            wake: Condvar::new(),
        }
    }
}

/// A single logical bidirectional channel multiplexed over a session.
///
/// Implements blocking [`io::Read`] and [`io::Write`]. Writes fragment to
/// the current send window and block while the window is exhausted, waking
/// the moment a window update is processed; if no credit arrives within the
/// session's `connection_write_timeout` the write fails. Reads block until
/// data, end-of-stream (`Ok(0)` after the peer's FIN), or a stream error.
///
/// Dropping a handle does not close the stream; call [`Stream::close`].
pub struct Stream {
    session: Arc<SessionInner>,
    slot: Arc<StreamSlot>,
    id: u32,
}

impl Stream {
    pub(crate) fn new(session: Arc<SessionInner>, slot: Arc<StreamSlot>, id: u32) -> Self {
        Self { session, slot, id }
    }

    /// Stream id; odd for client-initiated streams, even for server ones.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.slot.core.lock().state
    }

    /// Remaining outbound credit, in bytes.
    #[must_use]
    pub fn send_window(&self) -> u32 {
        self.slot.core.lock().send_window
    }

    /// Remaining inbound credit, in bytes.
    #[must_use]
    pub fn recv_window(&self) -> u32 {
        self.slot.core.lock().recv_window
    }

    /// Half-close this side of the stream by sending FIN.
    ///
    /// Idempotent; the first call transitions to `LocalClose` and awaits
    /// the peer's FIN, a repeated call (or a close after the peer already
    /// half-closed) also unregisters the stream. Best-effort once the
    /// session is shut down.
    pub fn close(&self) {
        let action = self.slot.core.lock().local_close();
        match action {
            CloseAction::SendFin => {
                let hdr = Header::window_update(Flags::FIN, self.id, 0);
                let _ = self.session.send_frame(&hdr, &[]);
            }
            CloseAction::SendFinUnregister => {
                let hdr = Header::window_update(Flags::FIN, self.id, 0);
                let _ = self.session.send_frame(&hdr, &[]);
                self.session.unregister_stream(self.id);
            }
            CloseAction::None => {}
        }
        self.slot.wake.notify_all();
    }

    fn read_inner(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut core = self.slot.core.lock();
        loop {
            if core.state == StreamState::Reset {
                return Err(Error::ConnectionReset);
            }
            if let Some(err) = &core.error {
                return Err(err.clone());
            }
            if !core.recv_buf.is_empty() {
                let n = buf.len().min(core.recv_buf.len());
                for (dst, byte) in buf.iter_mut().zip(core.recv_buf.drain(..n)) {
                    *dst = byte;
                }
                let update = core.window_update_frame(self.session.config.max_stream_window_size);
                drop(core);
                if let Some(hdr) = update {
                    let _ = self.session.send_frame(&hdr, &[]);
                }
                return Ok(n);
            }
            match core.state {
                StreamState::RemoteClose | StreamState::Closed => return Ok(0),
                _ => self.slot.wake.wait(&mut core),
            }
        }
    }

    fn write_inner(&self, buf: &[u8]) -> Result<(), Error> {
        let mut rest = buf;
        while !rest.is_empty() {
            let (hdr, take) = {
                let mut core = self.slot.core.lock();
                loop {
                    match core.state {
                        StreamState::LocalClose | StreamState::RemoteClose | StreamState::Closed => {
                            return Err(Error::StreamClosed)
                        }
                        StreamState::Reset => return Err(Error::ConnectionReset),
                        _ => {}
                    }
                    if let Some(err) = &core.error {
                        return Err(err.clone());
                    }
                    if core.send_window == 0 {
                        // Blocked on credit: wait for the window-update wake,
                        // bounded by the connection write timeout.
                        let deadline =
                            Instant::now() + self.session.config.connection_write_timeout;
                        let mut timed_out = false;
                        while core.send_window == 0
                            && core.error.is_none()
                            && writable(core.state)
                        {
                            if self.slot.wake.wait_until(&mut core, deadline).timed_out() {
                                timed_out = true;
                                break;
                            }
                        }
                        if timed_out
                            && core.send_window == 0
                            && core.error.is_none()
                            && writable(core.state)
                        {
                            return Err(Error::ConnectionWriteTimeout);
                        }
                        continue;
                    }
                    let take = rest.len().min(core.send_window as usize);
                    let flags = core.send_flags();
                    core.send_window -= take as u32;
                    break (Header::data(flags, self.id, take as u32), take);
                }
            };
            self.session.send_frame(&hdr, &rest[..take])?;
            rest = &rest[take..];
        }
        Ok(())
    }
}

fn writable(state: StreamState) -> bool {
    matches!(
        state,
        StreamState::Init
            | StreamState::SynSent
            | StreamState::SynReceived
            | StreamState::Established
    )
}

impl io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_inner(buf).map_err(io::Error::from)
    }
}

impl io::Write for Stream {
    /// Writes the whole buffer, fragmenting to the send window; a short
    /// write never happens — the call either drains `buf` or errors.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_inner(buf).map_err(io::Error::from)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("state", &self.slot.core.lock().state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_send_from_init_carries_syn() {
        let mut core = StreamCore::new(1, StreamState::Init);
        assert_eq!(core.send_flags(), Flags::SYN);
        assert_eq!(core.state, StreamState::SynSent);
        // Subsequent sends carry nothing.
        assert_eq!(core.send_flags(), Flags::empty());
    }

    #[test]
    fn first_send_from_syn_received_carries_ack() {
        let mut core = StreamCore::new(2, StreamState::SynReceived);
        assert_eq!(core.send_flags(), Flags::ACK);
        assert_eq!(core.state, StreamState::Established);
    }

    #[test]
    fn ack_establishes_syn_sent() {
        let mut core = StreamCore::new(1, StreamState::SynSent);
        assert_eq!(core.process_flags(Flags::ACK), Ok(false));
        assert_eq!(core.state, StreamState::Established);
    }

    #[test]
    fn fin_half_closes_open_states() {
        for state in [
            StreamState::SynSent,
            StreamState::SynReceived,
            StreamState::Established,
        ] {
            let mut core = StreamCore::new(1, state);
            assert_eq!(core.process_flags(Flags::FIN), Ok(false));
            assert_eq!(core.state, StreamState::RemoteClose);
        }
    }

    #[test]
    fn fin_after_local_close_fully_closes() {
        let mut core = StreamCore::new(1, StreamState::LocalClose);
        assert_eq!(core.process_flags(Flags::FIN), Ok(true));
        assert_eq!(core.state, StreamState::Closed);
    }

    #[test]
    fn fin_in_invalid_state_is_rejected_without_transition() {
        for state in [StreamState::RemoteClose, StreamState::Closed, StreamState::Reset] {
            let mut core = StreamCore::new(1, state);
            assert_eq!(core.process_flags(Flags::FIN), Err(Error::UnexpectedFlag));
            assert_eq!(core.state, state);
        }
    }

    #[test]
    fn rst_resets_from_any_state() {
        for state in [
            StreamState::Init,
            StreamState::SynSent,
            StreamState::SynReceived,
            StreamState::Established,
            StreamState::LocalClose,
            StreamState::RemoteClose,
        ] {
            let mut core = StreamCore::new(1, state);
            assert_eq!(core.process_flags(Flags::RST), Ok(true));
            assert_eq!(core.state, StreamState::Reset);
        }
    }

    #[test]
    fn local_close_transitions() {
        let mut core = StreamCore::new(1, StreamState::Established);
        assert_eq!(core.local_close(), CloseAction::SendFin);
        assert_eq!(core.state, StreamState::LocalClose);

        // Repeated close is idempotent but unregisters.
        assert_eq!(core.local_close(), CloseAction::SendFinUnregister);
        assert_eq!(core.state, StreamState::LocalClose);

        let mut core = StreamCore::new(1, StreamState::RemoteClose);
        assert_eq!(core.local_close(), CloseAction::SendFinUnregister);
        assert_eq!(core.state, StreamState::LocalClose);

        let mut core = StreamCore::new(1, StreamState::Reset);
        assert_eq!(core.local_close(), CloseAction::None);
    }

    #[test]
    fn recv_data_consumes_window() {
        let mut core = StreamCore::new(1, StreamState::Established);
        core.recv_data(&[0x42; 1024]).unwrap();
        assert_eq!(core.recv_window, INITIAL_STREAM_WINDOW - 1024);
        assert_eq!(core.recv_buf.len(), 1024);
    }

    #[test]
    fn recv_data_past_window_is_rejected() {
        let mut core = StreamCore::new(1, StreamState::Established);
        core.recv_window = 16;
        assert_eq!(core.recv_data(&[0; 17]), Err(Error::ReceiveWindowExceeded));
        // Window and buffer untouched on rejection.
        assert_eq!(core.recv_window, 16);
        assert!(core.recv_buf.is_empty());
    }

    #[test]
    fn small_window_delta_is_suppressed() {
        let mut core = StreamCore::new(1, StreamState::Established);
        core.recv_window = INITIAL_STREAM_WINDOW - 1024;
        assert_eq!(core.window_update_frame(INITIAL_STREAM_WINDOW), None);
        assert_eq!(core.recv_window, INITIAL_STREAM_WINDOW - 1024);
    }

    #[test]
    fn large_window_delta_is_sent() {
        let mut core = StreamCore::new(1, StreamState::Established);
        core.recv_window = 56 * 1024; // 200 KiB consumed and read
        let hdr = core.window_update_frame(INITIAL_STREAM_WINDOW).unwrap();
        assert_eq!(hdr.length, 200 * 1024);
        assert_eq!(hdr.flags, Flags::empty());
        assert_eq!(core.recv_window, INITIAL_STREAM_WINDOW);
    }

    #[test]
    fn handshake_flag_forces_window_update() {
        // A fresh stream has a zero delta but must still carry its SYN.
        let mut core = StreamCore::new(1, StreamState::Init);
        let hdr = core.window_update_frame(INITIAL_STREAM_WINDOW).unwrap();
        assert_eq!(hdr.flags, Flags::SYN);
        assert_eq!(hdr.length, 0);
        assert_eq!(core.state, StreamState::SynSent);
    }

    #[test]
    fn buffered_bytes_shrink_the_delta() {
        let mut core = StreamCore::new(1, StreamState::Established);
        core.recv_window = 0;
        core.recv_buf.extend(std::iter::repeat(0u8).take(64 * 1024));
        let hdr = core.window_update_frame(INITIAL_STREAM_WINDOW).unwrap();
        assert_eq!(hdr.length, 192 * 1024);
        assert_eq!(core.recv_window, 192 * 1024);
    }

    #[test]
    fn force_close_is_unconditional() {
        let mut core = StreamCore::new(1, StreamState::SynSent);
        core.force_close();
        assert_eq!(core.state, StreamState::Closed);
    }
}
