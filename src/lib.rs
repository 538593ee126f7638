// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Pure Rust implementation of the CMT Speech Data protocol
// (libcmtspeechdata). Carries bidirectional real-time speech frames
// between the application processor and a cellular modem on a 20 ms
// cadence, with a small out-of-band command channel for session setup,
// rate changes, timing and teardown.
//
// Two backends share one protocol engine: `NokiaModem` speaks to the
// /dev/cmt_speech kernel interface over read/write plus an mmap'ed slot
// area, `DummyBackend` emulates the modem in-process for development and
// tests. Both expose the `CmtSpeech` surface.

#[cfg(unix)]
use std::os::fd::RawFd;

use bitflags::bitflags;
use thiserror::Error as ThisError;

pub mod msgs;
pub mod protocol;
pub mod ring;
pub mod trace;

mod buffer;
#[cfg(unix)]
mod kernel;

#[cfg(unix)]
mod dummy;
#[cfg(unix)]
mod nokiamodem;

pub use buffer::{
    FrameBuffer, SpcFlags, BUFFER_TYPE_PCM_S16_LE, DATA_TYPE_INVALID, DATA_TYPE_VALID,
    DATA_TYPE_ZERO,
};
#[cfg(unix)]
pub use dummy::DummyBackend;
#[cfg(unix)]
pub use nokiamodem::NokiaModem;
pub use protocol::{
    event_to_state_transition, ControlIo, Event, EventPayload, ProtocolState, StateMachine,
    StateTransition, Timestamp, Transaction, WakelineUser,
};
pub use trace::{
    set_trace_handler, trace_toggle, TraceHandler, TRACE_DEBUG, TRACE_ERROR, TRACE_INFO,
    TRACE_INTERNAL, TRACE_IO, TRACE_STATE_CHANGE,
};

/// Highest implemented CMT Speech Data protocol version. Older versions
/// remain interoperable.
pub const PROTOCOL_VERSION: u32 = 2;

/// Library implementation version.
pub fn version_str() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Implemented CMT Speech Data protocol version.
pub fn protocol_version() -> u32 {
    PROTOCOL_VERSION
}

bitflags! {
    /// Pending work reported by [`CmtSpeech::check_pending`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PendingFlags: u32 {
        /// A control event is available via [`CmtSpeech::read_event`].
        const CONTROL = 1 << 0;
        /// A DL frame is available via [`CmtSpeech::dl_buffer_acquire`].
        const DL_DATA = 1 << 1;
        /// A DL overrun occurred.
        const XRUN    = 1 << 2;
    }
}

/// Operation errors, with the errno semantics of the wire-compatible C
/// library (see [`Error::errno`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum Error {
    /// Invalid parameters or state for the operation.
    #[error("invalid parameters or state")]
    Invalid,
    /// No free uplink buffer slots.
    #[error("no free buffer slots")]
    NoBufs,
    /// No downlink frame available.
    #[error("no downlink data available")]
    NoData,
    /// An overrun occurred, or the protocol state changed while the
    /// buffer was held.
    #[error("overrun, or protocol state changed since acquire")]
    Xrun,
    /// The transport is busy; acquire a new buffer and retry later.
    #[error("transport busy, retry later")]
    Busy,
    /// Persistent transport I/O failure.
    #[error("transport i/o error")]
    Io,
    /// The buffer does not match any acquired slot.
    #[error("no matching buffer")]
    NotFound,
}

impl Error {
    /// The matching negative errno value.
    #[cfg(unix)]
    pub fn errno(self) -> i32 {
        -(match self {
            Error::Invalid => libc::EINVAL,
            Error::NoBufs => libc::ENOBUFS,
            Error::NoData => libc::ENODATA,
            Error::Xrun => libc::EPIPE,
            Error::Busy => libc::EBUSY,
            Error::Io => libc::EIO,
            Error::NotFound => libc::ENOENT,
        })
    }
}

#[cfg(unix)]
/// The CMT Speech Data session surface, implemented by every backend.
///
/// A session is opened with the backend's `open()` constructor and closed
/// by dropping it. All calls are non-blocking; the application waits for
/// work by polling [`descriptor`](Self::descriptor) for readability and
/// then calling [`check_pending`](Self::check_pending).
pub trait CmtSpeech {
    /// File descriptor to wait on (level-triggered readability) for
    /// events.
    fn descriptor(&self) -> RawFd;

    /// Reads and classifies one pending transport word. Call whenever
    /// [`descriptor`](Self::descriptor) becomes readable.
    fn check_pending(&mut self) -> Result<PendingFlags, Error>;

    /// Dequeues one control event. Call when
    /// [`check_pending`](Self::check_pending) reported
    /// [`PendingFlags::CONTROL`].
    fn read_event(&mut self) -> Result<Event, Error>;

    /// Current protocol state.
    fn protocol_state(&self) -> ProtocolState;

    /// Whether a successful SSI_CONFIG transaction has completed.
    fn is_ssi_connection_enabled(&self) -> bool;

    /// Whether the speech data stream is active (DL, or DL and UL).
    fn is_active(&self) -> bool;

    /// Signals a change in call signaling server status. This reflects
    /// call signaling, not the protocol state.
    fn state_change_call_status(&mut self, state: bool) -> Result<(), Error>;

    /// Signals a change in call connected status.
    fn state_change_call_connect(&mut self, state: bool) -> Result<(), Error>;

    /// Signals an error; the protocol state is reset.
    fn state_change_error(&mut self) -> Result<(), Error>;

    /// Sets the wideband (16kHz) preference advertised to the modem at
    /// session setup. The modem makes the final sampling-rate choice.
    /// Fails while a session is enabled.
    fn set_wb_preference(&mut self, enabled: bool) -> Result<(), Error>;

    /// Acquires the next uplink buffer slot to fill with 20 ms of
    /// samples.
    fn ul_buffer_acquire(&mut self) -> Result<FrameBuffer, Error>;

    /// Releases a filled uplink buffer; the frame is sent immediately, so
    /// release in sync with the negotiated timing.
    fn ul_buffer_release(&mut self, buf: FrameBuffer) -> Result<(), Error>;

    /// Acquires the next received downlink frame. The buffer contents
    /// must not be written.
    fn dl_buffer_acquire(&mut self) -> Result<FrameBuffer, Error>;

    /// Releases a downlink buffer back to the slot ring.
    fn dl_buffer_release(&mut self, buf: FrameBuffer) -> Result<(), Error>;

    /// Descriptor of the downlink slot whose raw frame starts at `data`.
    fn dl_buffer_find_with_data(&self, data: *const u8) -> Option<FrameBuffer>;

    /// Descriptor of the downlink slot whose payload starts at `payload`.
    fn dl_buffer_find_with_payload(&self, payload: *const u8) -> Option<FrameBuffer>;

    /// Sends a NEW_TIMING_CONFIG_REQ to the modem.
    fn send_timing_request(&mut self) -> Result<(), Error>;

    /// Sends an SSI_CONFIG_REQ to enable or disable the session.
    fn send_ssi_config_request(&mut self, active: bool) -> Result<(), Error>;

    /// Requests a test data ramp from the peer: `ramplen` 32-bit words of
    /// octets counting up from `rampstart`. Only valid while
    /// disconnected; not supported by all backends.
    fn test_data_ramp_req(&mut self, rampstart: u8, ramplen: u8) -> Result<(), Error>;

    /// Identifies the backend implementation.
    fn backend_name(&self) -> &'static str;
}
