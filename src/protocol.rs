// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Protocol state machine shared by all backends.
//
// The machine tracks the pair (protocol state, transaction): the protocol
// state is what the application observes through events, the transaction
// records which request is outstanding (`InSync` = none). Inputs are
// decoded peer messages, observations of our own sent commands, and local
// call-signaling changes; transport I/O goes through the `ControlIo` seam
// so the machine can be driven by a mock in tests.

use std::io;

use crate::msgs::{self, CmtCmd, Message};
use crate::trace::{soft_assert, trace_debug, trace_error, trace_info, trace_io, trace_state_change};
use crate::Error;

/// Protocol states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolState {
    Invalid = 0,
    Disconnected = 1,
    Connected = 2,
    ActiveDl = 3,
    ActiveDlUl = 4,
    TestRampPingActive = 5,
}

impl ProtocolState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ProtocolState::Invalid => "INVALID",
            ProtocolState::Disconnected => "DISCONNECTED",
            ProtocolState::Connected => "CONNECTED",
            ProtocolState::ActiveDl => "ACTIVE_DL",
            ProtocolState::ActiveDlUl => "ACTIVE_DLUL",
            ProtocolState::TestRampPingActive => "TEST_RAMP_PING_ACTIVE",
        }
    }
}

/// Auxiliary transaction state: which request is currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transaction {
    /// No transaction in flight; the protocol state is authoritative.
    InSync,
    /// A NEW_TIMING_CONFIG_REQ is in progress.
    Timing,
    ResetBeforeConnect,
    /// SSI_CONFIG_REQ(1) has been sent.
    Connecting,
    /// SSI_CONFIG_REQ(0) has been sent.
    Disconnecting,
    /// Waiting for a previous SSI_CONFIG transaction to complete.
    SsiConfigPend,
    /// SPEECH_CONFIG_REQ(1) being processed, reply not yet sent.
    ConfigActPend,
    /// SPEECH_CONFIG_REQ(0) being processed, reply not yet sent.
    ConfigDeactPend,
}

/// State transitions as reported via events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum StateTransition {
    Invalid = -1,
    NoChange = 0,
    Connected = 1,
    Disconnected = 2,
    DlStart = 3,
    DlUlStop = 4,
    ParamUpdate = 5,
    TimingUpdate = 6,
    /// Timing update in reply to our own request. Not distinguishable
    /// from `TimingUpdate` on the wire; never returned.
    TimingUpdateReq = 7,
    Reset = 10,
    UlStop = 11,
    UlStart = 12,
}

/// CLOCK_MONOTONIC timestamp captured by the transport driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub sec: u32,
    pub nsec: u32,
}

/// Payload of a protocol event, a copy of the message that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPayload {
    None,
    SsiConfigResp {
        layout: u8,
        result: u8,
    },
    SpeechConfigReq {
        speech_data_stream: u8,
        call_user_connect_ind: u8,
        codec_info: u8,
        cellular_info: u8,
        sample_rate: u8,
        data_format: u8,
        /// If true, previously acquired buffers are invalid and must be
        /// released before new ones can be acquired.
        layout_changed: bool,
    },
    TimingConfigNtf {
        msec: u16,
        usec: u16,
        tstamp: Timestamp,
    },
    Reset {
        /// Whether the peer initiated the reset.
        cmt_sent_req: bool,
    },
}

/// Protocol state change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// New state after the message was processed.
    pub state: ProtocolState,
    /// State before the message was processed.
    pub prev_state: ProtocolState,
    /// Type of the message that caused the change (`msgs::*` codes, or
    /// `msgs::EVENT_RESET`).
    pub msg_type: u16,
    pub msg: EventPayload,
}

/// Wakeline users. The wakeline stays raised while any user holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakelineUser {
    Call,
    Reset,
    TestRampPing,
}

/// Transport seam used by the state machine: command output plus
/// wakeline control. Implemented by the backends and by test mocks.
pub trait ControlIo {
    /// Write one 4-octet control word to the transport.
    fn write_cmd(&mut self, cmd: CmtCmd) -> io::Result<()>;
    /// Raise the wakeline on behalf of `user`.
    fn acquire_wakeline(&mut self, user: WakelineUser);
    /// Drop `user`'s claim on the wakeline.
    fn release_wakeline(&mut self, user: WakelineUser);
}

/// Backend work requested by the state machine that needs transport
/// resources beyond `ControlIo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// Issue a protocol error reset (RESET_CONN_REQ plus local buffer
    /// teardown). When `reset_before_connect` is set, the machine expects
    /// to reconnect once the reset response arrives.
    ErrorReset { reset_before_connect: bool },
}

/// The backend-common protocol engine.
pub struct StateMachine {
    call_server_active: bool,
    call_connected: bool,
    proto_state: ProtocolState,
    transaction: Transaction,
    sample_layout: Option<u8>,
    io_errors: u32,
    conf_proto_version: u8,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let mut sm = Self {
            call_server_active: false,
            call_connected: false,
            proto_state: ProtocolState::Invalid,
            transaction: Transaction::InSync,
            sample_layout: None,
            io_errors: 0,
            // Protocol versions: v1 is 8kHz/NB only, v2 transfers 16kHz/WB
            // frames independently of the active codec.
            conf_proto_version: 1,
        };
        sm.reset_to_disconnected();
        sm
    }

    /* Accessors */

    pub fn protocol_state(&self) -> ProtocolState {
        self.proto_state
    }

    pub fn transaction(&self) -> Transaction {
        self.transaction
    }

    pub fn call_server_active(&self) -> bool {
        self.call_server_active
    }

    pub fn call_connected(&self) -> bool {
        self.call_connected
    }

    pub fn io_errors(&self) -> u32 {
        self.io_errors
    }

    /// Records a local I/O fault (e.g. event-queue overflow) so that a
    /// later call-status change can infer a broken peer.
    pub fn note_io_error(&mut self) {
        self.io_errors += 1;
    }

    /// Negotiated sample layout (`msgs::SAMPLE_LAYOUT_*`), once known.
    pub fn sample_layout(&self) -> Option<u8> {
        self.sample_layout
    }

    /// The connection is enabled once a successful SSI_CONFIG
    /// transaction has completed.
    pub fn is_ssi_connection_enabled(&self) -> bool {
        matches!(
            self.proto_state,
            ProtocolState::Connected | ProtocolState::ActiveDl | ProtocolState::ActiveDlUl
        )
    }

    /// The speech data stream is active when downlink (or both downlink
    /// and uplink) frames are flowing.
    pub fn is_active(&self) -> bool {
        matches!(
            self.proto_state,
            ProtocolState::ActiveDl | ProtocolState::ActiveDlUl
        )
    }

    /// Sets the wideband (16kHz) preference advertised at session setup.
    /// Fails while a session is enabled.
    pub fn set_wb_preference(&mut self, enabled: bool) -> Result<(), Error> {
        if self.is_ssi_connection_enabled() {
            return Err(Error::Invalid);
        }
        self.conf_proto_version = if enabled { 2 } else { 1 };
        Ok(())
    }

    /* State bookkeeping */

    fn change_state(&mut self, new_state: Option<ProtocolState>, transaction: Transaction) {
        match new_state {
            None => {
                trace_state_change!(
                    "PROTOCOL_STATE <{}> ({:?}->{:?})",
                    self.proto_state.as_str(),
                    self.transaction,
                    transaction
                );
            }
            Some(s) => {
                trace_state_change!(
                    "PROTOCOL_STATE <{}> --> <{}> ({:?}->{:?})",
                    self.proto_state.as_str(),
                    s.as_str(),
                    self.transaction,
                    transaction
                );
                self.proto_state = s;
            }
        }
        self.transaction = transaction;
    }

    fn reset_to_disconnected(&mut self) {
        self.call_server_active = false;
        self.call_connected = false;
        self.sample_layout = None;
        self.proto_state = ProtocolState::Invalid;
        self.io_errors = 0;
        self.change_state(Some(ProtocolState::Disconnected), Transaction::InSync);
    }

    /// Resets the machine after the peer endpoint has reset its state.
    pub fn reset(&mut self) {
        self.reset_to_disconnected();
    }

    pub fn mark_reset_before_connect(&mut self) {
        self.change_state(None, Transaction::ResetBeforeConnect);
    }

    /* Command output */

    /// Writes `cmd` through the transport, observing it afterwards so
    /// sent replies advance the machine. Successful control writes clear
    /// the I/O-error counter; failures bump it.
    pub fn write_command(&mut self, io: &mut dyn ControlIo, cmd: CmtCmd) -> io::Result<()> {
        let res = io.write_cmd(cmd);
        let b = cmd.logical_bytes();
        match res {
            Ok(()) => {
                trace_io!(
                    "wrote {} ({:02X}:{:02X}:{:02X}:{:02X})",
                    cmd.type_to_str(),
                    b[0],
                    b[1],
                    b[2],
                    b[3]
                );
                if cmd.domain() != msgs::DOMAIN_INTERNAL {
                    self.post_command(io, cmd);
                }
                self.io_errors = 0;
                Ok(())
            }
            Err(e) => {
                trace_error!("sending cmd {} failed ({})", cmd.type_to_str(), e);
                self.io_errors += 1;
                Err(e)
            }
        }
    }

    /// Updates the machine after command `cmd` has been sent.
    pub fn post_command(&mut self, io: &mut dyn ControlIo, cmd: CmtCmd) {
        if cmd.domain() != msgs::DOMAIN_CONTROL {
            return;
        }
        match cmd.msg_type() {
            msgs::RESET_CONN_REQ => {
                // RESET_CONN_REQ is only sent on error, so the current
                // state has no significance any more.
                self.change_state(Some(ProtocolState::Invalid), Transaction::InSync);
            }
            msgs::SPEECH_CONFIG_RESP => {
                let result = cmd.logical_bytes()[3] & 0x1;

                soft_assert!(matches!(
                    self.transaction,
                    Transaction::ConfigActPend | Transaction::ConfigDeactPend
                ));

                if result != 0 {
                    // The transaction failed locally; do not change state.
                    trace_error!(
                        "unable to change {} state due to local error",
                        if self.transaction == Transaction::ConfigActPend {
                            "to ACTIVE_DL"
                        } else {
                            "back to CONNECTED"
                        }
                    );
                    self.change_state(None, Transaction::InSync);
                    return;
                }

                match self.proto_state {
                    ProtocolState::Connected => {
                        if self.transaction == Transaction::ConfigActPend {
                            self.change_state(Some(ProtocolState::ActiveDl), Transaction::InSync);
                            let _ = self.send_timing_request(io);
                        }
                    }
                    ProtocolState::ActiveDl | ProtocolState::ActiveDlUl => {
                        if self.transaction == Transaction::ConfigActPend {
                            if self.proto_state == ProtocolState::ActiveDlUl {
                                self.change_state(
                                    Some(ProtocolState::ActiveDl),
                                    Transaction::InSync,
                                );
                            } else {
                                // Parameter update, no state change.
                                self.change_state(None, Transaction::InSync);
                            }
                        } else if self.transaction == Transaction::ConfigDeactPend {
                            self.change_state(Some(ProtocolState::Connected), Transaction::InSync);

                            if !self.call_server_active {
                                trace_debug!(
                                    "Call Server already inactive, closing SSI connection."
                                );
                                let _ = self.send_ssi_config_request(io, false);
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    /// Sends the NEW_TIMING_CONFIG_REQ message to the peer.
    pub fn send_timing_request(&mut self, io: &mut dyn ControlIo) -> Result<(), Error> {
        let cmd = Message::NewTimingConfigReq.encode();
        if self.write_command(io, cmd).is_err() {
            return Err(Error::Io);
        }
        self.change_state(None, Transaction::Timing);
        Ok(())
    }

    /// Sends SSI_CONFIG_REQ to enable (`active`) or disable the session.
    /// Enabling raises the wakeline for the call before the write.
    pub fn send_ssi_config_request(
        &mut self,
        io: &mut dyn ControlIo,
        active: bool,
    ) -> Result<(), Error> {
        if active {
            io.acquire_wakeline(WakelineUser::Call);
        }

        let msg = Message::SsiConfigReq {
            layout: msgs::SAMPLE_LAYOUT_INORDER_LE,
            version: self.conf_proto_version,
            state: active as u8,
        };
        trace_debug!(
            "Trying to send SSI_CONFIG_REQ with version {} and status {}.",
            self.conf_proto_version,
            active as u8
        );

        if !active {
            soft_assert!(
                self.proto_state == ProtocolState::Connected
                    || self.transaction == Transaction::SsiConfigPend
            );
            if self.transaction == Transaction::Disconnecting {
                trace_error!("SSI_CONFIG_REQ(0) already pending!");
                return Err(Error::Invalid);
            }
            self.change_state(None, Transaction::Disconnecting);
        } else {
            soft_assert!(
                self.proto_state == ProtocolState::Disconnected
                    || self.transaction == Transaction::SsiConfigPend
            );
            trace_info!("CMT Speech Data state machine activated with SSI_CONFIG_REQ.");
            self.change_state(None, Transaction::Connecting);
        }

        if self.write_command(io, msg.encode()).is_err() {
            self.change_state(None, Transaction::InSync);
            return Err(Error::Io);
        }
        Ok(())
    }

    /// Sends a TEST_RAMP_PING. Only allowed while disconnected.
    pub fn test_data_ramp_req(
        &mut self,
        io: &mut dyn ControlIo,
        domain: u8,
        reply_domain: u8,
        rampstart: u8,
        ramplen: u8,
    ) -> Result<(), Error> {
        soft_assert!(self.proto_state == ProtocolState::Disconnected);
        if self.proto_state != ProtocolState::Disconnected {
            trace_error!("call ongoing, cannot send TEST_RAMP_PING!");
            return Err(Error::Invalid);
        }

        let msg = Message::TestRampPing {
            domain,
            reply_domain,
            rampstart,
            ramplen,
        };
        if self.write_command(io, msg.encode()).is_err() {
            return Err(Error::Io);
        }

        self.change_state(Some(ProtocolState::TestRampPingActive), Transaction::InSync);
        Ok(())
    }

    /// A reply to our TEST_RAMP_PING arrived on the data path.
    pub fn test_sequence_received(&mut self) {
        soft_assert!(self.proto_state == ProtocolState::TestRampPingActive);
        self.change_state(Some(ProtocolState::Disconnected), Transaction::InSync);
    }

    /* Local call-signaling inputs */

    /// Signals a change in call-server status. May emit requests through
    /// `io`; the returned follow-up, if any, must be executed by the
    /// backend.
    pub fn state_change_call_status(
        &mut self,
        io: &mut dyn ControlIo,
        server_state: bool,
    ) -> Option<FollowUp> {
        let mut follow_up = None;

        if !server_state {
            if self.transaction == Transaction::ConfigDeactPend {
                // The transition back to CONNECTED is not complete as
                // SPEECH_CONFIG_RESP has not been sent yet (locked
                // buffers). Cannot happen in normal conditions, so record
                // an I/O error (possible peer reset).
                soft_assert!(self.proto_state == ProtocolState::Connected);
                self.io_errors += 1;
                trace_info!("Call termination blocked due to pending SPEECH_CONFIG_RESP.");
            } else if self.proto_state == ProtocolState::Connected {
                let _ = self.send_ssi_config_request(io, false);
            } else if self.transaction == Transaction::Connecting {
                // Wait until the previous transaction completes.
                self.change_state(None, Transaction::SsiConfigPend);
            }
            // DISCONNECTED: nothing to do. ACTIVE_*: the peer is about to
            // send SPEECH_CONFIG_REQ(0).
        } else {
            match self.proto_state {
                ProtocolState::Disconnected => {
                    let _ = self.send_ssi_config_request(io, true);
                }
                ProtocolState::Connected if self.transaction == Transaction::Disconnecting => {
                    // Previous SSI_CONFIG transaction must complete before
                    // reconnecting.
                    self.change_state(None, Transaction::SsiConfigPend);
                }
                ProtocolState::Invalid | ProtocolState::TestRampPingActive => {
                    follow_up = Some(FollowUp::ErrorReset {
                        reset_before_connect: true,
                    });
                }
                ProtocolState::ActiveDl | ProtocolState::ActiveDlUl => {
                    if self.call_server_active {
                        trace_debug!("Spurious call status change during active call, ignoring..");
                    } else if self.io_errors > 0 {
                        // The peer has not acked the pending call
                        // termination and we have seen I/O errors since:
                        // treat as a peer crash and start over.
                        trace_error!(
                            "CMT reset detected, continuing from DISCONNECTED state (prev {}/{:?})",
                            self.proto_state.as_str(),
                            self.transaction
                        );
                        self.reset_to_disconnected();
                        let _ = self.send_ssi_config_request(io, true);
                    }
                }
                ProtocolState::Connected => {}
            }
        }

        self.call_server_active = server_state;
        follow_up
    }

    /// Signals a change in call-connected status.
    pub fn state_change_call_connect(&mut self, connect_state: bool) {
        self.call_connected = connect_state;
    }

    /* Peer message input */

    /// Handles one control message from the peer and drafts the matching
    /// event. The caller must run the returned follow-up (if any), finish
    /// transport-side handling, and then call
    /// [`complete_event`](Self::complete_event).
    pub fn handle_command(
        &mut self,
        io: &mut dyn ControlIo,
        cmd: CmtCmd,
    ) -> Result<(Event, Option<FollowUp>), Error> {
        let mut follow_up = None;
        let mut event = Event {
            state: self.proto_state,
            prev_state: self.proto_state,
            msg_type: cmd.msg_type() as u16,
            msg: EventPayload::None,
        };

        let Some(msg) = Message::decode(cmd) else {
            trace_error!("Unknown protocol message {}", cmd.msg_type());
            return Err(Error::Invalid);
        };

        match msg {
            Message::SpeechConfigReq {
                speech_data_stream,
                call_user_connecting_ind,
                codec_info,
                cellular_info,
                sample_rate,
                data_format,
            } => {
                event.msg = EventPayload::SpeechConfigReq {
                    speech_data_stream,
                    call_user_connect_ind: call_user_connecting_ind,
                    codec_info,
                    cellular_info,
                    sample_rate,
                    data_format,
                    layout_changed: false,
                };

                trace_debug!(
                    "Generating event: SPEECH_CONFIG_REQ (conn {})",
                    call_user_connecting_ind
                );

                soft_assert!(matches!(
                    self.proto_state,
                    ProtocolState::Connected | ProtocolState::ActiveDl | ProtocolState::ActiveDlUl
                ));

                if speech_data_stream != 0 {
                    self.change_state(None, Transaction::ConfigActPend);
                } else {
                    self.change_state(None, Transaction::ConfigDeactPend);
                }
            }
            Message::UplinkConfigNtf => {
                trace_debug!("Generating event: UPLINK_CONFIG_NTF");

                soft_assert!(self.proto_state == ProtocolState::ActiveDl);

                if self.proto_state == ProtocolState::ActiveDl {
                    self.change_state(Some(ProtocolState::ActiveDlUl), Transaction::InSync);
                }
            }
            Message::TimingConfigNtf { msec, usec } => {
                trace_debug!("Generating event: TIMING_CONFIG_NTF");

                event.msg = EventPayload::TimingConfigNtf {
                    msec,
                    usec,
                    tstamp: Timestamp::default(),
                };

                soft_assert!(matches!(
                    self.proto_state,
                    ProtocolState::ActiveDl | ProtocolState::ActiveDlUl
                ));

                // Legacy peers do not send UPLINK_CONFIG_NTF; the first
                // timing notification starts the uplink instead.
                if self.proto_state == ProtocolState::ActiveDl {
                    self.change_state(Some(ProtocolState::ActiveDlUl), Transaction::InSync);
                    trace_info!(
                        "detected an old CMT firmware that does not send UPLINK_CONFIG_NTF."
                    );
                }

                if self.transaction == Transaction::Timing {
                    self.change_state(None, Transaction::InSync);
                }
            }
            Message::SsiConfigResp { layout, result } => {
                event.msg = EventPayload::SsiConfigResp { layout, result };

                trace_io!(
                    "Generating event: SSI_CONFIG_RESP (layout {}, res {})",
                    layout,
                    result
                );

                // It is possible to go DISCONNECTED -> CONNECTING ->
                // DISCONNECTING -> DISCONNECTED without ever being
                // CONNECTED.
                soft_assert!(matches!(
                    self.proto_state,
                    ProtocolState::Connected | ProtocolState::Disconnected
                ));

                if result == msgs::SSI_CONFIG_RES_SUCCESS {
                    match self.transaction {
                        Transaction::Connecting => {
                            self.change_state(Some(ProtocolState::Connected), Transaction::InSync);

                            // Resolve the advertised layout; no preference
                            // defaults to the swapped configuration.
                            self.sample_layout =
                                Some(if layout == msgs::SAMPLE_LAYOUT_NO_PREF {
                                    msgs::SAMPLE_LAYOUT_SWAPPED_LE
                                } else {
                                    layout
                                });
                        }
                        Transaction::Disconnecting => {
                            self.reset_to_disconnected();
                            trace_info!("CMT Speech Data state machine deactivated.");
                        }
                        Transaction::SsiConfigPend => {
                            // Re-issue the deferred request in the now
                            // correct direction.
                            if self.call_server_active {
                                let _ = self.send_ssi_config_request(io, true);
                                self.change_state(
                                    Some(ProtocolState::Disconnected),
                                    Transaction::Connecting,
                                );
                            } else {
                                let _ = self.send_ssi_config_request(io, false);
                                self.change_state(
                                    Some(ProtocolState::Connected),
                                    Transaction::Disconnecting,
                                );
                            }
                        }
                        _ => {}
                    }
                } else {
                    trace_error!("SSI_CONFIG_RESP returned an error {}", result);
                    // Do not reset internal state unless it was set for
                    // SSI_CONFIG_REQ.
                    if matches!(
                        self.transaction,
                        Transaction::Connecting | Transaction::Disconnecting
                    ) {
                        self.change_state(None, Transaction::InSync);
                    }
                    // No other way to recover than a protocol reset.
                    follow_up = Some(FollowUp::ErrorReset {
                        reset_before_connect: false,
                    });
                }
            }
            Message::ResetConnReq => {
                trace_io!("Generating event: EVENT_RESET (CMT initiated)");
                event.msg_type = msgs::EVENT_RESET;
                event.msg = EventPayload::Reset { cmt_sent_req: true };

                soft_assert!(self.proto_state != ProtocolState::Disconnected);

                self.reset_to_disconnected();
            }
            Message::ResetConnResp => {
                let cached_transaction = self.transaction;
                trace_io!("Generating event: EVENT_RESET (APE initiated)");
                event.msg_type = msgs::EVENT_RESET;
                event.msg = EventPayload::Reset {
                    cmt_sent_req: false,
                };

                soft_assert!(self.proto_state != ProtocolState::Disconnected);

                self.reset_to_disconnected();

                if cached_transaction == Transaction::ResetBeforeConnect {
                    let _ = self.send_ssi_config_request(io, true);
                }
            }
            Message::TestRampPing { .. } => {
                soft_assert!(self.proto_state == ProtocolState::Disconnected);
                // The response goes out directly on the data path, so no
                // state is tracked for inbound pings.
            }
            Message::SsiConfigReq { .. }
            | Message::SpeechConfigResp { .. }
            | Message::NewTimingConfigReq => {
                trace_error!("Unknown protocol message {}", cmd.msg_type());
                return Err(Error::Invalid);
            }
        }

        Ok((event, follow_up))
    }

    /// Completes command processing: stamps the event with the final
    /// protocol state.
    pub fn complete_event(&self, event: &mut Event) {
        event.state = self.proto_state;
    }
}

/// Returns the state transition matching `event`.
pub fn event_to_state_transition(event: &Event) -> StateTransition {
    use ProtocolState::*;

    if event.prev_state == Disconnected && event.state == Connected {
        StateTransition::Connected
    } else if event.prev_state == Connected && event.state == Disconnected {
        StateTransition::Disconnected
    } else if event.prev_state == Connected && event.state == ActiveDl {
        StateTransition::DlStart
    } else if matches!(event.prev_state, ActiveDl | ActiveDlUl) && event.state == Connected {
        StateTransition::DlUlStop
    } else if event.prev_state == ActiveDl && event.state == ActiveDl {
        StateTransition::ParamUpdate
    } else if event.msg_type == msgs::TIMING_CONFIG_NTF as u16 {
        // A timing update in reply to our own request cannot be told
        // apart from a peer-initiated one.
        StateTransition::TimingUpdate
    } else if event.msg_type == msgs::EVENT_RESET {
        StateTransition::Reset
    } else if event.prev_state == ActiveDlUl && event.state == ActiveDl {
        StateTransition::UlStop
    } else if event.prev_state == ActiveDl && event.state == ActiveDlUl {
        StateTransition::UlStart
    } else {
        StateTransition::Invalid
    }
}
