// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Peer-emulation backend. A worker thread plays the modem: it answers
// session setup over a pipe and paces DL frame wakeups on a 20 ms timer.
// The application side talks to it through the same surface as the
// hardware backend, with the read end of the control pipe as the poll
// descriptor.

mod common;

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::buffer::{FrameBuffer, DATA_TYPE_VALID};
use crate::msgs::{self, CmtCmd, Message, CTRL_LEN, DATA_HEADER_LEN};
use crate::protocol::{ControlIo, Event, FollowUp, ProtocolState, StateMachine, WakelineUser};
use crate::ring::RingBuffer;
use crate::trace::{soft_assert, trace_debug, trace_error, trace_info, trace_io};
use crate::{CmtSpeech, Error, PendingFlags};

use common::{PollTimer, Tone};

const SAL_BUFFER_SLOTS: usize = 5;
const SAL_MSG_BUFFER: usize = 256;
const SAL_TIMEOUT_LONG_MS: i32 = 300_000; // 5min

const SAL_SAMPLE_RATE: u8 = msgs::SAMPLE_RATE_8KHZ;
const SAL_FRAME_SIZE_OCTETS: usize = 320; // 20ms at mono/8kHz
const SLOT_SIZE: usize = DATA_HEADER_LEN + SAL_FRAME_SIZE_OCTETS;

const BACKEND_ID: &str = "cmtspeech_dummy";

/* Worker call state */

const STATE_IDLE: u8 = 0;
const STATE_INITIALIZED: u8 = 1;
const STATE_MEDIA_FLOWING: u8 = 2;
const STATE_TERMINATING: u8 = 3;

/* Worker thread lifecycle */

const THREAD_STARTED: u8 = 1;
const THREAD_RUNNING: u8 = 2;
const THREAD_EXIT_REQ: u8 = 3;
const THREAD_TERMINATED: u8 = 4;

/* Internal message types on the pipes */

const DUMMY_DL_DATA_AVAIL: u8 = 0x01;
const DUMMY_EXIT_REQUEST: u8 = 0x04;

fn dummy_internal_message(msg_type: u8) -> CmtCmd {
    CmtCmd::from_logical([(msg_type << 4) | msgs::DOMAIN_INTERNAL, 0, 0, 0])
}

fn write_cmd_fd(fd: RawFd, cmd: CmtCmd) -> io::Result<()> {
    let wire = cmd.wire_bytes();
    let n = unsafe { libc::write(fd, wire.as_ptr() as *const libc::c_void, CTRL_LEN) };
    if n == CTRL_LEN as isize {
        Ok(())
    } else if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Err(io::Error::new(io::ErrorKind::WriteZero, "short pipe write"))
    }
}

fn read_cmd_fd(fd: RawFd) -> Option<CmtCmd> {
    let mut wire = [0u8; CTRL_LEN];
    let n = unsafe { libc::read(fd, wire.as_mut_ptr() as *mut libc::c_void, CTRL_LEN) };
    if n == CTRL_LEN as isize {
        Some(CmtCmd::from_wire(wire))
    } else {
        None
    }
}

fn poll_in(fd: RawFd, timeout_ms: i32) -> i32 {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    unsafe { libc::poll(&mut pfd, 1, timeout_ms) }
}

// ---------------------------------------------------------------------------
// State shared with the worker thread
// ---------------------------------------------------------------------------

struct WorkerShared {
    state: AtomicU8,
    dl_active: AtomicBool,
    thread_running: AtomicU8,
    // Guards all writers of `state`; readers go lock-free.
    write_lock: Mutex<()>,
}

impl WorkerShared {
    fn change_state(&self, new_state: u8) {
        if self.state.load(Ordering::Acquire) != new_state {
            let _guard = self.write_lock.lock().unwrap();
            self.state.store(new_state, Ordering::Release);
            trace_io!("dummy backend changed state to {}.", new_state);
        }
    }
}

// ---------------------------------------------------------------------------
// Worker thread — the emulated modem
// ---------------------------------------------------------------------------

/// Handles one APE-to-modem message read from the thread pipe.
fn worker_handle_message(shared: &WorkerShared, control_tx: RawFd, cmd: CmtCmd) {
    trace_io!(
        "worker read APE message {} on domain {}.",
        cmd.type_to_str(),
        cmd.domain()
    );

    if cmd.domain() == msgs::DOMAIN_CONTROL {
        match Message::decode(cmd) {
            Some(Message::SsiConfigReq { state, .. }) => {
                let resp = Message::SsiConfigResp {
                    layout: msgs::SAMPLE_LAYOUT_INORDER_LE,
                    result: msgs::SSI_CONFIG_RES_SUCCESS,
                }
                .encode();
                let _ = write_cmd_fd(control_tx, resp);
                if state == 0 {
                    shared.change_state(STATE_IDLE);
                }
            }
            Some(Message::NewTimingConfigReq) => {
                if shared.state.load(Ordering::Acquire) == STATE_MEDIA_FLOWING {
                    let _ = write_cmd_fd(control_tx, Message::UplinkConfigNtf.encode());
                }
                let _ = write_cmd_fd(
                    control_tx,
                    Message::TimingConfigNtf { msec: 5, usec: 0 }.encode(),
                );
            }
            Some(Message::SpeechConfigResp { .. }) => {}
            Some(
                Message::SsiConfigResp { .. }
                | Message::SpeechConfigReq { .. }
                | Message::TimingConfigNtf { .. },
            ) => {
                trace_error!(
                    "modem-to-APE message received by the emulated modem, type {}.",
                    cmd.msg_type()
                );
            }
            _ => {
                trace_error!("unknown control message of type {}.", cmd.msg_type());
            }
        }
    } else if cmd.domain() == msgs::DOMAIN_INTERNAL {
        if cmd.msg_type() == DUMMY_EXIT_REQUEST {
            trace_info!("exit request received by worker thread.");
        }
    } else {
        trace_error!("message on unknown domain {}.", cmd.domain());
    }
}

fn worker_thread(shared: Arc<WorkerShared>, thread_rx: RawFd, control_tx: RawFd) {
    if shared.thread_running.load(Ordering::Acquire) == THREAD_STARTED {
        shared.thread_running.store(THREAD_RUNNING, Ordering::Release);
    }

    trace_debug!("dummy backend worker thread started");

    let mut timer = PollTimer::new(20);

    loop {
        if shared.thread_running.load(Ordering::Acquire) >= THREAD_EXIT_REQ {
            break;
        }

        let cur_state = shared.state.load(Ordering::Acquire);
        match cur_state {
            STATE_MEDIA_FLOWING => {
                // Wake up at least every 20 ms to pace DL frames.
                let timeout = if shared.dl_active.load(Ordering::Acquire) {
                    timer.pre_poll_timeout()
                } else {
                    100
                };

                let res = poll_in(thread_rx, timeout);
                if res > 0 {
                    if let Some(cmd) = read_cmd_fd(thread_rx) {
                        worker_handle_message(&shared, control_tx, cmd);
                    }
                } else if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    trace_error!("error in dummy backend worker thread ({})", err);
                    shared.thread_running.store(THREAD_EXIT_REQ, Ordering::Release);
                }

                // Announce a DL frame if enough time has passed.
                if shared.dl_active.load(Ordering::Acquire)
                    && timer.is_elapsed(Duration::from_micros(5000))
                {
                    let msg = dummy_internal_message(DUMMY_DL_DATA_AVAIL);
                    let _ = write_cmd_fd(control_tx, msg);
                    timer.elapsed_fixed_period();
                }
            }
            _ => {
                // Idle states: wait for control messages.
                let res = poll_in(thread_rx, SAL_TIMEOUT_LONG_MS);
                if res > 0 {
                    if let Some(cmd) = read_cmd_fd(thread_rx) {
                        worker_handle_message(&shared, control_tx, cmd);
                    }
                } else if res < 0 {
                    trace_debug!("poll error in worker thread.");
                } else {
                    trace_io!("dummy backend thread idle (state={})", cur_state);
                }
            }
        }
    }

    trace_debug!("dummy backend worker thread stopping");
    shared.thread_running.store(THREAD_TERMINATED, Ordering::Release);
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

struct SlotBuf {
    data: Box<[u8]>,
    locked: bool,
}

impl SlotBuf {
    fn new() -> Self {
        Self {
            data: vec![0u8; SLOT_SIZE].into_boxed_slice(),
            locked: false,
        }
    }

    fn descriptor(&mut self, index: usize) -> FrameBuffer {
        FrameBuffer::init(self.data.as_mut_ptr(), SLOT_SIZE, 0, index)
    }
}

struct DummyIo {
    thread_tx: RawFd,
}

impl ControlIo for DummyIo {
    fn write_cmd(&mut self, cmd: CmtCmd) -> io::Result<()> {
        write_cmd_fd(self.thread_tx, cmd)
    }

    // The emulated transport has no wakeline.
    fn acquire_wakeline(&mut self, _user: WakelineUser) {}
    fn release_wakeline(&mut self, _user: WakelineUser) {}
}

/// CMT Speech Data session against the emulated modem.
pub struct DummyBackend {
    sm: StateMachine,
    io: DummyIo,
    shared: Arc<WorkerShared>,
    worker: Option<JoinHandle<()>>,
    /// Pipe pair worker -> client; the read end is the poll descriptor.
    control_rx: OwnedFd,
    control_tx: OwnedFd,
    /// Pipe pair client -> worker. The read end stays owned here so the
    /// worker's fd outlives the session.
    _thread_rx: OwnedFd,
    thread_tx: OwnedFd,
    /// Received words queued between check_pending and read_event.
    pubbuf: RingBuffer,
    ul_bufs: Vec<SlotBuf>,
    dl_bufs: Vec<SlotBuf>,
    ul_buf_idx: usize,
    dl_buf_idx: usize,
    dl_frame_counter: u16,
    call_server_status: bool,
    tone: Tone,
}

fn make_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

impl DummyBackend {
    /// Opens an emulated speech data session. The worker thread playing
    /// the modem starts immediately.
    pub fn open() -> io::Result<DummyBackend> {
        crate::trace::initialize_tracing();

        let (control_rx, control_tx) = make_pipe()?;
        let (thread_rx, thread_tx) = make_pipe()?;
        set_nonblocking(control_rx.as_raw_fd());

        let tone = Tone::initialize("sine").ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "unable to set up a tone source")
        })?;

        let shared = Arc::new(WorkerShared {
            state: AtomicU8::new(STATE_IDLE),
            dl_active: AtomicBool::new(false),
            thread_running: AtomicU8::new(THREAD_STARTED),
            write_lock: Mutex::new(()),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_thread_rx = thread_rx.as_raw_fd();
        let worker_control_tx = control_tx.as_raw_fd();
        let worker = std::thread::Builder::new()
            .name("cmtspeech-dummy".into())
            .spawn(move || worker_thread(worker_shared, worker_thread_rx, worker_control_tx))?;

        Ok(DummyBackend {
            sm: StateMachine::new(),
            io: DummyIo {
                thread_tx: thread_tx.as_raw_fd(),
            },
            shared,
            worker: Some(worker),
            control_rx,
            control_tx,
            _thread_rx: thread_rx,
            thread_tx,
            pubbuf: RingBuffer::new(SAL_MSG_BUFFER),
            ul_bufs: (0..SAL_BUFFER_SLOTS).map(|_| SlotBuf::new()).collect(),
            dl_bufs: (0..SAL_BUFFER_SLOTS).map(|_| SlotBuf::new()).collect(),
            ul_buf_idx: 0,
            dl_buf_idx: 0,
            dl_frame_counter: 0,
            call_server_status: false,
            tone,
        })
    }

    /// Emits a SPEECH_CONFIG_REQ towards the application, as the modem
    /// would after session setup or teardown.
    fn emit_speech_config_req(&mut self, speech_data: u8, user_connect: u8) {
        let msg = Message::SpeechConfigReq {
            speech_data_stream: speech_data,
            call_user_connecting_ind: user_connect,
            codec_info: msgs::CODEC_INFO_GSM_HR,
            cellular_info: msgs::CELLULAR_INFO_GSM,
            sample_rate: SAL_SAMPLE_RATE,
            data_format: msgs::DATA_FORMAT_S16LINPCM,
        };
        let _ = write_cmd_fd(self.control_tx.as_raw_fd(), msg.encode());
    }

    fn run_follow_up(&mut self, follow_up: FollowUp) {
        match follow_up {
            FollowUp::ErrorReset {
                reset_before_connect,
            } => {
                // The emulated transport has no reset path; only keep the
                // reconnect bookkeeping.
                if reset_before_connect {
                    self.sm.mark_reset_before_connect();
                }
            }
        }
    }
}

impl CmtSpeech for DummyBackend {
    fn descriptor(&self) -> RawFd {
        self.control_rx.as_raw_fd()
    }

    fn check_pending(&mut self) -> Result<PendingFlags, Error> {
        if self.pubbuf.avail_for_write() < CTRL_LEN {
            // Queue full: drop the oldest queued word and account the
            // loss as an I/O error.
            trace_error!("event queue overflow, dropping oldest message!");
            self.pubbuf.move_read(CTRL_LEN);
            self.sm.note_io_error();
        }

        let wi = self.pubbuf.write_idx();
        let n = unsafe {
            libc::read(
                self.control_rx.as_raw_fd(),
                self.pubbuf.data_mut()[wi..].as_mut_ptr() as *mut libc::c_void,
                CTRL_LEN,
            )
        };
        if n != CTRL_LEN as isize {
            return Ok(PendingFlags::empty());
        }

        let wire: [u8; 4] = self.pubbuf.data()[wi..wi + CTRL_LEN].try_into().unwrap();
        let cmd = CmtCmd::from_wire(wire);

        let mut flags = PendingFlags::empty();
        if cmd.domain() == msgs::DOMAIN_CONTROL {
            // Only control words are queued; data wakeups are consumed
            // right here.
            self.pubbuf.move_write(CTRL_LEN);
            flags |= PendingFlags::CONTROL;
        } else if cmd.domain() == msgs::DOMAIN_INTERNAL && cmd.msg_type() == DUMMY_DL_DATA_AVAIL {
            flags |= PendingFlags::DL_DATA;
        }

        Ok(flags)
    }

    fn read_event(&mut self) -> Result<Event, Error> {
        if self.pubbuf.avail_for_read() < CTRL_LEN {
            return Err(Error::NoData);
        }

        let ri = self.pubbuf.read_idx();
        let wire: [u8; 4] = self.pubbuf.data()[ri..ri + CTRL_LEN].try_into().unwrap();
        let cmd = CmtCmd::from_wire(wire);

        let handled = self.sm.handle_command(&mut self.io, cmd);
        let (mut event, follow_up) = match handled {
            Ok(v) => v,
            Err(e) => {
                self.pubbuf.move_read(CTRL_LEN);
                return Err(e);
            }
        };
        if let Some(f) = follow_up {
            self.run_follow_up(f);
        }

        if event.msg_type == msgs::SSI_CONFIG_RESP as u16 {
            // Connected: the emulated modem starts the media stream.
            if self.sm.protocol_state() == ProtocolState::Connected {
                trace_io!("Emitting SPEECH_CONFIG_REQ(enable)");
                self.emit_speech_config_req(1, 1);
            }
        } else if event.msg_type == msgs::SPEECH_CONFIG_REQ as u16 {
            // Accept the stream configuration unconditionally.
            let respcmd = Message::SpeechConfigResp { result: 0 }.encode();
            self.sm.post_command(&mut self.io, respcmd);
            self.shared.dl_active.store(true, Ordering::Release);
        }

        self.sm.complete_event(&mut event);

        if event.state == ProtocolState::Connected && event.prev_state == ProtocolState::Disconnected
        {
            self.shared.change_state(STATE_MEDIA_FLOWING);
        }

        trace_debug!(
            "POP pubbuf r-old:{} r-new:{} w:{}",
            ri,
            (ri + CTRL_LEN) % SAL_MSG_BUFFER,
            self.pubbuf.write_idx()
        );
        self.pubbuf.move_read(CTRL_LEN);

        Ok(event)
    }

    fn protocol_state(&self) -> ProtocolState {
        self.sm.protocol_state()
    }

    fn is_ssi_connection_enabled(&self) -> bool {
        self.sm.is_ssi_connection_enabled()
    }

    fn is_active(&self) -> bool {
        self.sm.is_active()
    }

    fn state_change_call_status(&mut self, status: bool) -> Result<(), Error> {
        let follow_up = self.sm.state_change_call_status(&mut self.io, status);
        if let Some(f) = follow_up {
            self.run_follow_up(f);
        }

        trace_io!("ServerStatus - {}", status);
        if !status {
            self.shared.dl_active.store(false, Ordering::Release);
        }

        if self.call_server_status != status {
            self.call_server_status = status;
            if status {
                self.shared.change_state(STATE_INITIALIZED);
            } else {
                self.shared.change_state(STATE_TERMINATING);
                if self.sm.is_active() {
                    trace_io!("Emitting SPEECH_CONFIG_REQ(disable)");
                    self.emit_speech_config_req(0, 0);
                }
            }
        } else {
            trace_io!("No change, ignoring ServerStatus indication");
        }

        Ok(())
    }

    fn state_change_call_connect(&mut self, state: bool) -> Result<(), Error> {
        trace_io!("AudioConnect state:{}", state);
        self.shared.dl_active.store(state, Ordering::Release);
        self.sm.state_change_call_connect(state);
        Ok(())
    }

    fn state_change_error(&mut self) -> Result<(), Error> {
        // No reset path towards the emulated modem.
        Err(Error::Invalid)
    }

    fn set_wb_preference(&mut self, enabled: bool) -> Result<(), Error> {
        self.sm.set_wb_preference(enabled)
    }

    fn ul_buffer_acquire(&mut self) -> Result<FrameBuffer, Error> {
        let idx = self.ul_buf_idx;
        let buf = self.ul_bufs[idx].descriptor(idx);
        self.ul_bufs[idx].locked = true;

        self.ul_buf_idx = (self.ul_buf_idx + 1) % SAL_BUFFER_SLOTS;
        Ok(buf)
    }

    fn ul_buffer_release(&mut self, buf: FrameBuffer) -> Result<(), Error> {
        let idx = buf.index();
        if idx >= SAL_BUFFER_SLOTS || !self.ul_bufs[idx].locked {
            trace_info!("trying to release an unlocked UL buffer.");
            return Err(Error::Invalid);
        }
        if self.ul_bufs[idx].data.as_ptr() as *const u8 != buf.data as *const u8 {
            trace_info!("trying to release an invalid UL buffer.");
            return Err(Error::Invalid);
        }
        self.ul_bufs[idx].locked = false;
        Ok(())
    }

    fn dl_buffer_acquire(&mut self) -> Result<FrameBuffer, Error> {
        // One frame per DL_DATA wakeup: generate the next tone frame into
        // the next slot.
        let next = (self.dl_buf_idx + 1) % SAL_BUFFER_SLOTS;
        if self.dl_bufs[next].locked {
            trace_info!("buffer overrun in DL direction.");
        }
        self.dl_buf_idx = next;

        let counter = self.dl_frame_counter;
        self.dl_frame_counter = self.dl_frame_counter.wrapping_add(1);
        self.tone
            .fill_slot(&mut self.dl_bufs[next].data, counter, SAL_SAMPLE_RATE);

        let mut buf = self.dl_bufs[next].descriptor(next);
        buf.frame_flags = DATA_TYPE_VALID;
        self.dl_bufs[next].locked = true;
        Ok(buf)
    }

    fn dl_buffer_release(&mut self, buf: FrameBuffer) -> Result<(), Error> {
        let idx = buf.index();
        if idx >= SAL_BUFFER_SLOTS || !self.dl_bufs[idx].locked {
            trace_info!("trying to release an unlocked DL buffer.");
            return Err(Error::NotFound);
        }
        if self.dl_bufs[idx].data.as_ptr() as *const u8 != buf.data as *const u8 {
            trace_info!("trying to release an invalid DL buffer.");
            return Err(Error::Invalid);
        }
        self.dl_bufs[idx].locked = false;
        Ok(())
    }

    fn dl_buffer_find_with_data(&self, data: *const u8) -> Option<FrameBuffer> {
        for (i, slot) in self.dl_bufs.iter().enumerate() {
            if slot.data.as_ptr() as *const u8 == data {
                let mut buf =
                    FrameBuffer::init(slot.data.as_ptr() as *mut u8, SLOT_SIZE, 0, i);
                buf.frame_flags = DATA_TYPE_VALID;
                return Some(buf);
            }
        }
        None
    }

    fn dl_buffer_find_with_payload(&self, payload: *const u8) -> Option<FrameBuffer> {
        for (i, slot) in self.dl_bufs.iter().enumerate() {
            if unsafe { slot.data.as_ptr().add(DATA_HEADER_LEN) } as *const u8 == payload {
                let mut buf =
                    FrameBuffer::init(slot.data.as_ptr() as *mut u8, SLOT_SIZE, 0, i);
                buf.frame_flags = DATA_TYPE_VALID;
                return Some(buf);
            }
        }
        None
    }

    fn send_timing_request(&mut self) -> Result<(), Error> {
        self.sm.send_timing_request(&mut self.io)
    }

    fn send_ssi_config_request(&mut self, active: bool) -> Result<(), Error> {
        self.sm.send_ssi_config_request(&mut self.io, active)
    }

    fn test_data_ramp_req(&mut self, rampstart: u8, ramplen: u8) -> Result<(), Error> {
        self.sm.test_data_ramp_req(
            &mut self.io,
            msgs::DOMAIN_CONTROL,
            msgs::DOMAIN_DATA,
            rampstart,
            ramplen,
        )
    }

    fn backend_name(&self) -> &'static str {
        BACKEND_ID
    }
}

impl Drop for DummyBackend {
    fn drop(&mut self) {
        if self.shared.thread_running.load(Ordering::Acquire) >= THREAD_STARTED {
            self.shared
                .thread_running
                .store(THREAD_EXIT_REQ, Ordering::Release);
        }

        let msg = dummy_internal_message(DUMMY_EXIT_REQUEST);
        let _ = write_cmd_fd(self.thread_tx.as_raw_fd(), msg);

        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
            soft_assert!(
                self.shared.thread_running.load(Ordering::Acquire) == THREAD_TERMINATED
            );
        }

        // Pipe fds close with their OwnedFd drops, after the join above,
        // so the worker never sees EBADF.
    }
}
