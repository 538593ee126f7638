// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// State machine tests driven through a mock transport: the call-status
// policy table, transition labelling, deferred transactions, crash
// recovery and wakeline accounting.

use std::io;

use libcmtspeech::msgs::{self, CmtCmd, Message};
use libcmtspeech::protocol::{
    event_to_state_transition, ControlIo, Event, EventPayload, FollowUp, ProtocolState,
    StateMachine, StateTransition, Transaction, Timestamp, WakelineUser,
};
use libcmtspeech::Error;

/// Records every command and wakeline transition; can be told to fail
/// writes.
#[derive(Default)]
struct MockIo {
    sent: Vec<CmtCmd>,
    acquired: Vec<WakelineUser>,
    released: Vec<WakelineUser>,
    fail_writes: bool,
}

impl MockIo {
    fn last_message(&self) -> Option<Message> {
        self.sent.last().and_then(|c| Message::decode(*c))
    }

    fn clear(&mut self) {
        self.sent.clear();
    }
}

impl ControlIo for MockIo {
    fn write_cmd(&mut self, cmd: CmtCmd) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        self.sent.push(cmd);
        Ok(())
    }

    fn acquire_wakeline(&mut self, user: WakelineUser) {
        self.acquired.push(user);
    }

    fn release_wakeline(&mut self, user: WakelineUser) {
        self.released.push(user);
    }
}

fn feed(sm: &mut StateMachine, io: &mut MockIo, msg: Message) -> Event {
    let (mut event, follow_up) = sm
        .handle_command(io, msg.encode())
        .expect("message accepted");
    assert!(follow_up.is_none(), "unexpected follow-up");
    sm.complete_event(&mut event);
    event
}

/// Drives a fresh machine into CONNECTED.
fn connect(sm: &mut StateMachine, io: &mut MockIo, layout: u8) -> Event {
    sm.state_change_call_status(io, true);
    assert_eq!(sm.transaction(), Transaction::Connecting);
    feed(
        sm,
        io,
        Message::SsiConfigResp {
            layout,
            result: msgs::SSI_CONFIG_RES_SUCCESS,
        },
    )
}

/// Drives a connected machine into ACTIVE_DL via a speech config cycle.
fn activate_dl(sm: &mut StateMachine, io: &mut MockIo, sample_rate: u8) -> Event {
    let event = feed(
        sm,
        io,
        Message::SpeechConfigReq {
            speech_data_stream: 1,
            call_user_connecting_ind: 1,
            codec_info: msgs::CODEC_INFO_AMR_NB,
            cellular_info: msgs::CELLULAR_INFO_GSM,
            sample_rate,
            data_format: msgs::DATA_FORMAT_S16LINPCM,
        },
    );
    assert_eq!(sm.transaction(), Transaction::ConfigActPend);

    // The backend sends SPEECH_CONFIG_RESP(0) and observes it.
    sm.post_command(io, Message::SpeechConfigResp { result: 0 }.encode());
    event
}

// --- Session setup and teardown ---

#[test]
fn call_status_connects_from_disconnected() {
    let mut sm = StateMachine::new();
    let mut io = MockIo::default();

    assert_eq!(sm.protocol_state(), ProtocolState::Disconnected);
    sm.state_change_call_status(&mut io, true);

    // SSI_CONFIG_REQ(1) goes out and the call wakeline is held.
    assert_eq!(
        io.last_message(),
        Some(Message::SsiConfigReq {
            layout: msgs::SAMPLE_LAYOUT_INORDER_LE,
            version: 1,
            state: 1
        })
    );
    assert_eq!(io.acquired, vec![WakelineUser::Call]);
    assert!(sm.call_server_active());

    let event = feed(
        &mut sm,
        &mut io,
        Message::SsiConfigResp {
            layout: msgs::SAMPLE_LAYOUT_INORDER_LE,
            result: msgs::SSI_CONFIG_RES_SUCCESS,
        },
    );

    assert_eq!(sm.protocol_state(), ProtocolState::Connected);
    assert_eq!(sm.transaction(), Transaction::InSync);
    assert!(sm.is_ssi_connection_enabled());
    assert!(!sm.is_active());
    assert_eq!(event_to_state_transition(&event), StateTransition::Connected);
}

#[test]
fn no_pref_layout_resolves_to_swapped() {
    let mut sm = StateMachine::new();
    let mut io = MockIo::default();

    connect(&mut sm, &mut io, msgs::SAMPLE_LAYOUT_NO_PREF);
    assert_eq!(sm.sample_layout(), Some(msgs::SAMPLE_LAYOUT_SWAPPED_LE));

    let mut sm = StateMachine::new();
    connect(&mut sm, &mut io, msgs::SAMPLE_LAYOUT_INORDER_LE);
    assert_eq!(sm.sample_layout(), Some(msgs::SAMPLE_LAYOUT_INORDER_LE));
}

#[test]
fn media_activation_reaches_active_dlul() {
    let mut sm = StateMachine::new();
    let mut io = MockIo::default();

    connect(&mut sm, &mut io, msgs::SAMPLE_LAYOUT_SWAPPED_LE);
    io.clear();

    let event = activate_dl(&mut sm, &mut io, msgs::SAMPLE_RATE_16KHZ);
    assert_eq!(sm.protocol_state(), ProtocolState::ActiveDl);
    assert!(sm.is_active());

    // The machine auto-requests timing after the DL start.
    assert_eq!(io.last_message(), Some(Message::NewTimingConfigReq));
    assert_eq!(sm.transaction(), Transaction::Timing);

    // Event labelling: the event was drafted before the reply went out,
    // so its final state already reflects ACTIVE_DL.
    let transition = event_to_state_transition(&Event {
        state: ProtocolState::ActiveDl,
        prev_state: event.prev_state,
        msg_type: event.msg_type,
        msg: event.msg,
    });
    assert_eq!(transition, StateTransition::DlStart);

    // UPLINK_CONFIG_NTF starts the uplink.
    let event = feed(&mut sm, &mut io, Message::UplinkConfigNtf);
    assert_eq!(sm.protocol_state(), ProtocolState::ActiveDlUl);
    assert_eq!(event_to_state_transition(&event), StateTransition::UlStart);
}

#[test]
fn legacy_timing_ntf_starts_uplink() {
    let mut sm = StateMachine::new();
    let mut io = MockIo::default();

    connect(&mut sm, &mut io, msgs::SAMPLE_LAYOUT_INORDER_LE);
    activate_dl(&mut sm, &mut io, msgs::SAMPLE_RATE_8KHZ);

    // Old peer firmware sends no UPLINK_CONFIG_NTF; the first timing
    // notification starts the uplink instead.
    let event = feed(
        &mut sm,
        &mut io,
        Message::TimingConfigNtf {
            msec: 431,
            usec: 987,
        },
    );
    assert_eq!(sm.protocol_state(), ProtocolState::ActiveDlUl);
    assert_eq!(sm.transaction(), Transaction::InSync);
    assert_eq!(
        event.msg,
        EventPayload::TimingConfigNtf {
            msec: 431,
            usec: 987,
            tstamp: Timestamp::default()
        }
    );
    assert_eq!(
        event_to_state_transition(&event),
        StateTransition::TimingUpdate
    );
}

#[test]
fn graceful_teardown() {
    let mut sm = StateMachine::new();
    let mut io = MockIo::default();

    connect(&mut sm, &mut io, msgs::SAMPLE_LAYOUT_INORDER_LE);
    activate_dl(&mut sm, &mut io, msgs::SAMPLE_RATE_8KHZ);
    feed(&mut sm, &mut io, Message::UplinkConfigNtf);
    assert_eq!(sm.protocol_state(), ProtocolState::ActiveDlUl);

    // Call server goes down; no protocol action yet, the peer is about
    // to stop the stream.
    sm.state_change_call_status(&mut io, false);
    assert!(!sm.call_server_active());

    io.clear();
    let event = feed(
        &mut sm,
        &mut io,
        Message::SpeechConfigReq {
            speech_data_stream: 0,
            call_user_connecting_ind: 0,
            codec_info: 0,
            cellular_info: 0,
            sample_rate: 0,
            data_format: 0,
        },
    );
    assert_eq!(sm.transaction(), Transaction::ConfigDeactPend);

    sm.post_command(&mut io, Message::SpeechConfigResp { result: 0 }.encode());

    // Back to CONNECTED, and since the call server is already inactive
    // the machine immediately starts the SSI teardown.
    assert_eq!(sm.protocol_state(), ProtocolState::Connected);
    assert_eq!(sm.transaction(), Transaction::Disconnecting);
    assert_eq!(
        io.last_message(),
        Some(Message::SsiConfigReq {
            layout: msgs::SAMPLE_LAYOUT_INORDER_LE,
            version: 1,
            state: 0
        })
    );

    let transition = event_to_state_transition(&Event {
        state: ProtocolState::Connected,
        ..event
    });
    assert_eq!(transition, StateTransition::DlUlStop);

    let event = feed(
        &mut sm,
        &mut io,
        Message::SsiConfigResp {
            layout: msgs::SAMPLE_LAYOUT_INORDER_LE,
            result: msgs::SSI_CONFIG_RES_SUCCESS,
        },
    );
    assert_eq!(sm.protocol_state(), ProtocolState::Disconnected);
    assert_eq!(
        event_to_state_transition(&event),
        StateTransition::Disconnected
    );
}

// --- Deferred and overlapping transactions ---

#[test]
fn reconnect_while_disconnecting_is_deferred() {
    let mut sm = StateMachine::new();
    let mut io = MockIo::default();

    connect(&mut sm, &mut io, msgs::SAMPLE_LAYOUT_INORDER_LE);
    sm.state_change_call_status(&mut io, false);
    assert_eq!(sm.transaction(), Transaction::Disconnecting);

    // Call comes back before the teardown completed.
    sm.state_change_call_status(&mut io, true);
    assert_eq!(sm.transaction(), Transaction::SsiConfigPend);

    io.clear();
    feed(
        &mut sm,
        &mut io,
        Message::SsiConfigResp {
            layout: msgs::SAMPLE_LAYOUT_INORDER_LE,
            result: msgs::SSI_CONFIG_RES_SUCCESS,
        },
    );

    // The request was re-issued in the connect direction.
    assert_eq!(
        io.last_message(),
        Some(Message::SsiConfigReq {
            layout: msgs::SAMPLE_LAYOUT_INORDER_LE,
            version: 1,
            state: 1
        })
    );
    assert_eq!(sm.protocol_state(), ProtocolState::Disconnected);
    assert_eq!(sm.transaction(), Transaction::Connecting);
}

#[test]
fn disconnect_while_connecting_is_deferred() {
    let mut sm = StateMachine::new();
    let mut io = MockIo::default();

    sm.state_change_call_status(&mut io, true);
    assert_eq!(sm.transaction(), Transaction::Connecting);

    sm.state_change_call_status(&mut io, false);
    assert_eq!(sm.transaction(), Transaction::SsiConfigPend);

    io.clear();
    feed(
        &mut sm,
        &mut io,
        Message::SsiConfigResp {
            layout: msgs::SAMPLE_LAYOUT_INORDER_LE,
            result: msgs::SSI_CONFIG_RES_SUCCESS,
        },
    );

    // Re-issued in the disconnect direction.
    assert_eq!(
        io.last_message(),
        Some(Message::SsiConfigReq {
            layout: msgs::SAMPLE_LAYOUT_INORDER_LE,
            version: 1,
            state: 0
        })
    );
    assert_eq!(sm.protocol_state(), ProtocolState::Connected);
    assert_eq!(sm.transaction(), Transaction::Disconnecting);
}

#[test]
fn call_status_true_in_invalid_requests_reset() {
    let mut sm = StateMachine::new();
    let mut io = MockIo::default();

    // Our own RESET_CONN_REQ leaves the machine in INVALID.
    sm.post_command(&mut io, Message::ResetConnReq.encode());
    assert_eq!(sm.protocol_state(), ProtocolState::Invalid);

    let follow_up = sm.state_change_call_status(&mut io, true);
    assert_eq!(
        follow_up,
        Some(FollowUp::ErrorReset {
            reset_before_connect: true
        })
    );

    // The backend sends the reset and marks the reconnect intent.
    sm.post_command(&mut io, Message::ResetConnReq.encode());
    sm.mark_reset_before_connect();

    io.clear();
    feed(&mut sm, &mut io, Message::ResetConnResp);

    // The reset response triggers the deferred connect.
    assert_eq!(
        io.last_message(),
        Some(Message::SsiConfigReq {
            layout: msgs::SAMPLE_LAYOUT_INORDER_LE,
            version: 1,
            state: 1
        })
    );
    assert_eq!(sm.transaction(), Transaction::Connecting);
}

#[test]
fn peer_reset_reports_initiator() {
    let mut sm = StateMachine::new();
    let mut io = MockIo::default();

    connect(&mut sm, &mut io, msgs::SAMPLE_LAYOUT_INORDER_LE);
    activate_dl(&mut sm, &mut io, msgs::SAMPLE_RATE_8KHZ);

    let event = feed(&mut sm, &mut io, Message::ResetConnReq);
    assert_eq!(sm.protocol_state(), ProtocolState::Disconnected);
    assert_eq!(event.msg_type, msgs::EVENT_RESET);
    assert_eq!(event.msg, EventPayload::Reset { cmt_sent_req: true });
    assert_eq!(event_to_state_transition(&event), StateTransition::Reset);
}

#[test]
fn crash_recovery_from_io_errors() {
    let mut sm = StateMachine::new();
    let mut io = MockIo::default();

    connect(&mut sm, &mut io, msgs::SAMPLE_LAYOUT_INORDER_LE);
    activate_dl(&mut sm, &mut io, msgs::SAMPLE_RATE_8KHZ);

    // Call server drops; the peer never acks.
    sm.state_change_call_status(&mut io, false);

    // A failing control write records the I/O error.
    io.fail_writes = true;
    assert_eq!(sm.send_timing_request(&mut io), Err(Error::Io));
    assert!(sm.io_errors() > 0);
    io.fail_writes = false;

    // Call server comes back: treat as a peer crash and start over.
    io.clear();
    sm.state_change_call_status(&mut io, true);
    assert_eq!(
        io.last_message(),
        Some(Message::SsiConfigReq {
            layout: msgs::SAMPLE_LAYOUT_INORDER_LE,
            version: 1,
            state: 1
        })
    );
    assert_eq!(sm.protocol_state(), ProtocolState::Disconnected);
    assert_eq!(sm.transaction(), Transaction::Connecting);
}

#[test]
fn failed_ssi_config_resp_requests_reset() {
    let mut sm = StateMachine::new();
    let mut io = MockIo::default();

    sm.state_change_call_status(&mut io, true);

    let (mut event, follow_up) = sm
        .handle_command(
            &mut io,
            Message::SsiConfigResp {
                layout: msgs::SAMPLE_LAYOUT_INORDER_LE,
                result: msgs::SSI_CONFIG_RES_GENERAL_ERROR,
            }
            .encode(),
        )
        .unwrap();
    sm.complete_event(&mut event);

    assert_eq!(
        follow_up,
        Some(FollowUp::ErrorReset {
            reset_before_connect: false
        })
    );
    assert_eq!(sm.transaction(), Transaction::InSync);
    assert_eq!(sm.protocol_state(), ProtocolState::Disconnected);
}

// --- Wideband preference ---

#[test]
fn wb_preference_changes_advertised_version() {
    let mut sm = StateMachine::new();
    let mut io = MockIo::default();

    sm.set_wb_preference(true).unwrap();
    sm.state_change_call_status(&mut io, true);
    assert_eq!(
        io.last_message(),
        Some(Message::SsiConfigReq {
            layout: msgs::SAMPLE_LAYOUT_INORDER_LE,
            version: 2,
            state: 1
        })
    );
}

#[test]
fn wb_preference_rejected_while_enabled() {
    let mut sm = StateMachine::new();
    let mut io = MockIo::default();

    connect(&mut sm, &mut io, msgs::SAMPLE_LAYOUT_INORDER_LE);
    assert_eq!(sm.set_wb_preference(true), Err(Error::Invalid));
    // Still possible once the session is gone.
    sm.reset();
    assert_eq!(sm.set_wb_preference(true), Ok(()));
}

// --- Test ramp ---

#[test]
fn test_ramp_round() {
    let mut sm = StateMachine::new();
    let mut io = MockIo::default();

    sm.test_data_ramp_req(&mut io, msgs::DOMAIN_CONTROL, msgs::DOMAIN_DATA, 0x10, 8)
        .unwrap();
    assert_eq!(sm.protocol_state(), ProtocolState::TestRampPingActive);
    assert_eq!(
        io.last_message(),
        Some(Message::TestRampPing {
            domain: msgs::DOMAIN_CONTROL,
            reply_domain: msgs::DOMAIN_DATA,
            rampstart: 0x10,
            ramplen: 8
        })
    );

    sm.test_sequence_received();
    assert_eq!(sm.protocol_state(), ProtocolState::Disconnected);
}

#[test]
fn test_ramp_rejected_during_session() {
    let mut sm = StateMachine::new();
    let mut io = MockIo::default();

    connect(&mut sm, &mut io, msgs::SAMPLE_LAYOUT_INORDER_LE);
    assert_eq!(
        sm.test_data_ramp_req(&mut io, msgs::DOMAIN_CONTROL, msgs::DOMAIN_DATA, 0, 8),
        Err(Error::Invalid)
    );
}

// --- Wakeline accounting at the machine boundary ---

#[test]
fn wakeline_acquired_once_per_connect() {
    let mut sm = StateMachine::new();
    let mut io = MockIo::default();

    connect(&mut sm, &mut io, msgs::SAMPLE_LAYOUT_INORDER_LE);
    sm.state_change_call_status(&mut io, false);
    feed(
        &mut sm,
        &mut io,
        Message::SsiConfigResp {
            layout: msgs::SAMPLE_LAYOUT_INORDER_LE,
            result: msgs::SSI_CONFIG_RES_SUCCESS,
        },
    );

    // One acquisition for the whole connect/disconnect cycle; releasing
    // is the backend's task when it sees the teardown response.
    assert_eq!(io.acquired, vec![WakelineUser::Call]);
}

// --- Safety: states stay within the declared set ---

#[test]
fn arbitrary_input_stays_in_declared_states() {
    let inputs = [
        Message::ResetConnReq,
        Message::ResetConnResp,
        Message::UplinkConfigNtf,
        Message::TimingConfigNtf { msec: 5, usec: 0 },
        Message::SsiConfigResp {
            layout: 0,
            result: 0,
        },
        Message::SpeechConfigReq {
            speech_data_stream: 1,
            call_user_connecting_ind: 0,
            codec_info: 0,
            cellular_info: 0,
            sample_rate: 1,
            data_format: 1,
        },
    ];

    // Exercise all input pairs in sequence from a fresh machine.
    for first in &inputs {
        for second in &inputs {
            let mut sm = StateMachine::new();
            let mut io = MockIo::default();
            for msg in [first, second] {
                if let Ok((mut ev, _)) = sm.handle_command(&mut io, msg.encode()) {
                    sm.complete_event(&mut ev);
                    assert!(matches!(
                        ev.state,
                        ProtocolState::Invalid
                            | ProtocolState::Disconnected
                            | ProtocolState::Connected
                            | ProtocolState::ActiveDl
                            | ProtocolState::ActiveDlUl
                            | ProtocolState::TestRampPingActive
                    ));
                }
            }
        }
    }
}

// --- Transition table ---

#[test]
fn transition_table_matches_state_pairs() {
    use ProtocolState::*;

    let ev = |prev, state, msg_type: u16| Event {
        state,
        prev_state: prev,
        msg_type,
        msg: EventPayload::None,
    };

    let ssi = msgs::SSI_CONFIG_RESP as u16;
    let speech = msgs::SPEECH_CONFIG_REQ as u16;

    assert_eq!(
        event_to_state_transition(&ev(Disconnected, Connected, ssi)),
        StateTransition::Connected
    );
    assert_eq!(
        event_to_state_transition(&ev(Connected, Disconnected, ssi)),
        StateTransition::Disconnected
    );
    assert_eq!(
        event_to_state_transition(&ev(Connected, ActiveDl, speech)),
        StateTransition::DlStart
    );
    assert_eq!(
        event_to_state_transition(&ev(ActiveDlUl, Connected, speech)),
        StateTransition::DlUlStop
    );
    assert_eq!(
        event_to_state_transition(&ev(ActiveDl, Connected, speech)),
        StateTransition::DlUlStop
    );
    assert_eq!(
        event_to_state_transition(&ev(ActiveDl, ActiveDl, speech)),
        StateTransition::ParamUpdate
    );
    assert_eq!(
        event_to_state_transition(&ev(ActiveDlUl, ActiveDlUl, msgs::TIMING_CONFIG_NTF as u16)),
        StateTransition::TimingUpdate
    );
    assert_eq!(
        event_to_state_transition(&ev(ActiveDl, Disconnected, msgs::EVENT_RESET)),
        StateTransition::Reset
    );
    assert_eq!(
        event_to_state_transition(&ev(ActiveDlUl, ActiveDl, speech)),
        StateTransition::UlStop
    );
    assert_eq!(
        event_to_state_transition(&ev(ActiveDl, ActiveDlUl, msgs::UPLINK_CONFIG_NTF as u16)),
        StateTransition::UlStart
    );
    assert_eq!(
        event_to_state_transition(&ev(Disconnected, Disconnected, 0)),
        StateTransition::Invalid
    );
}
