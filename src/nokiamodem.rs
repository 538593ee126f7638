// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Backend for Nokia hardware (e.g. the N900), speaking to the cellular
// modem through the /dev/cmt_speech character device. Control words are
// exchanged over read/write, speech frames through slots in the driver's
// mmap'ed shared area; the rolling rx pointer and an ioctl-driven
// wakeline complete the transport contract (see `kernel`).

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use bitflags::bitflags;

use crate::buffer::{BufferStatus, FrameBuffer, DATA_TYPE_INVALID, DATA_TYPE_VALID};
use crate::kernel::{
    cs_command, CsBufferConfig, MmapView, CS_CONFIG_BUFS, CS_DEV_FILE_NAME, CS_FEAT_ROLLING_RX_COUNTER,
    CS_FEAT_TSTAMP_RX_CTRL, CS_GET_IF_VERSION, CS_PARAM_MASK, CS_PEER_RESET_DONE, CS_RX_DATA_RECEIVED,
    CS_SET_WAKELINE, CS_TX_DATA_READY, CS_TX_DATA_SENT, SHARED_MEMORY_AREA_PAGE,
};
use crate::msgs::{
    self, CmtCmd, DlFrameHeader, Message, UlFrameHeader, CTRL_LEN, DATA_HEADER_LEN,
};
use crate::protocol::{
    ControlIo, Event, EventPayload, FollowUp, ProtocolState, StateMachine, Transaction, WakelineUser,
};
use crate::ring::RingBuffer;
use crate::trace::{soft_assert, trace_debug, trace_error, trace_info, trace_io};
use crate::{CmtSpeech, Error, PendingFlags};

/* Build-time configuration */

const EVENT_BUFFER_SIZE: usize = 64;
const PCM_SAMPLE_SIZE: usize = 2; // mono/16bit
const MAX_SLOT_SIZE: usize = PCM_SAMPLE_SIZE * 320 + DATA_HEADER_LEN;
const UL_SLOTS: usize = 2;
const DL_SLOTS: usize = 3;
const MAX_UL_ERRORS_PAUSE: u32 = 5; // pause UL after this many errors

const PM_VDD2_LOCK_INTERFACE: &str = "/sys/power/vdd2_lock";
const PM_VDD2_LOCK_TO_OPP3: &[u8] = b"3";
const PM_VDD2_UNLOCK: &[u8] = b"0";

const BACKEND_ID: &str = "cmtspeech_nokiamodem";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct WakelineUsers: u32 {
        const CALL           = 1 << 0;
        const RESET          = 1 << 1;
        const TEST_RAMP_PING = 1 << 2;
    }
}

impl From<WakelineUser> for WakelineUsers {
    fn from(user: WakelineUser) -> Self {
        match user {
            WakelineUser::Call => WakelineUsers::CALL,
            WakelineUser::Reset => WakelineUsers::RESET,
            WakelineUser::TestRampPing => WakelineUsers::TEST_RAMP_PING,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct DriverFeatures: u32 {
        const ROLLING_RX_PTR = 1 << 0;
    }
}

#[derive(Default, Clone)]
struct BufferDesc {
    bd: FrameBuffer,
    flags: BufferStatus,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SlotDir {
    Ul,
    Dl,
}

// ---------------------------------------------------------------------------
// Event queue — events stored in the byte ring, oldest dropped on overflow
// ---------------------------------------------------------------------------

const EVENT_SIZE: usize = std::mem::size_of::<Event>();

struct EventQueue {
    ring: RingBuffer,
}

impl EventQueue {
    fn new() -> Self {
        Self {
            ring: RingBuffer::new(EVENT_BUFFER_SIZE * EVENT_SIZE),
        }
    }

    /// Queues `event`. Returns true if the queue was full and the oldest
    /// entry was dropped to make room.
    fn push(&mut self, event: &Event) -> bool {
        let mut overflow = false;
        if self.ring.cavail_for_write() < EVENT_SIZE {
            trace_error!(
                "control event queue overflow (newmsg:{}, avail={}, cavail={})",
                event.msg_type,
                self.ring.avail_for_write(),
                self.ring.cavail_for_write()
            );
            self.ring.move_read(EVENT_SIZE);
            overflow = true;
        }
        soft_assert!(self.ring.cavail_for_write() >= EVENT_SIZE);

        let wi = self.ring.write_idx();
        unsafe {
            (self.ring.data_mut().as_mut_ptr().add(wi) as *mut Event).write_unaligned(*event);
        }
        self.ring.move_write(EVENT_SIZE);
        overflow
    }

    fn pop(&mut self) -> Option<Event> {
        if self.ring.cavail_for_read() < EVENT_SIZE {
            trace_io!(
                "notice: control event dequeue with no data (avail={})",
                self.ring.avail_for_read()
            );
            return None;
        }
        let ri = self.ring.read_idx();
        let event =
            unsafe { (self.ring.data().as_ptr().add(ri) as *const Event).read_unaligned() };
        self.ring.move_read(EVENT_SIZE);
        Some(event)
    }
}

// ---------------------------------------------------------------------------
// DriverIo — fd, mmap area, wakeline and the VDD2 lock side effect
// ---------------------------------------------------------------------------

struct DriverIo {
    fd: OwnedFd,
    wakeline_users: WakelineUsers,
    features: DriverFeatures,
    mmap: MmapView,
    dl_swap: Box<[u8]>,
    events: EventQueue,
    rx_offsets: [u32; DL_SLOTS],
    tx_offsets: [u32; UL_SLOTS],
}

impl DriverIo {
    fn write_raw(&self, cmd: CmtCmd) -> io::Result<()> {
        let wire = cmd.wire_bytes();
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                wire.as_ptr() as *const libc::c_void,
                CTRL_LEN,
            )
        };
        if n == CTRL_LEN as isize {
            Ok(())
        } else if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Err(io::Error::new(io::ErrorKind::WriteZero, "short command write"))
        }
    }

    /// Data-path write: no protocol bookkeeping, the I/O-error counter is
    /// not updated for data wakeups.
    fn write_data(&self, cmd: CmtCmd) -> io::Result<()> {
        trace_debug!("wrote {}, fd {}.", cmd.type_to_str(), self.fd.as_raw_fd());
        self.write_raw(cmd)
    }

    fn ioctl_set_wakeline(&self, status: u32) -> i32 {
        unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                CS_SET_WAKELINE as libc::c_ulong,
                &status as *const u32,
            )
        }
    }

    /// Locks or unlocks the VDD2 DVFS operating point so that clock
    /// changes cannot disturb SSI transfers while the peer may transmit.
    fn set_ssi_lock(&self, enabled: bool) {
        let val = if enabled {
            PM_VDD2_LOCK_TO_OPP3
        } else {
            PM_VDD2_UNLOCK
        };
        match std::fs::write(PM_VDD2_LOCK_INTERFACE, val) {
            Ok(()) => trace_io!("setting VDD2 lock to '{}'.", if enabled { "3" } else { "0" }),
            Err(e) => trace_io!(
                "Unable to lock VDD2, dev {} ('{}').",
                PM_VDD2_LOCK_INTERFACE,
                e
            ),
        }
    }

    /// Drops all wakeline users and lowers the wakeline unconditionally.
    fn reset_wakeline_state(&mut self) {
        trace_io!(
            "Reseting SSI wakeline state (user mask {:x} at reset).",
            self.wakeline_users.bits()
        );

        if !self.wakeline_users.is_empty() {
            self.set_ssi_lock(false);
        }

        let res = self.ioctl_set_wakeline(0);
        soft_assert!(res == 0);
        self.wakeline_users = WakelineUsers::empty();
    }
}

impl ControlIo for DriverIo {
    fn write_cmd(&mut self, cmd: CmtCmd) -> io::Result<()> {
        self.write_raw(cmd)
    }

    fn acquire_wakeline(&mut self, user: WakelineUser) {
        let id = WakelineUsers::from(user);
        if self.wakeline_users.is_empty() {
            let res = self.ioctl_set_wakeline(1);
            trace_io!(
                "Toggled SSI wakeline to 1 by id {:02x} (res {}).",
                id.bits(),
                res
            );
            // Lock VDD2 whenever the modem needs to be able to send
            // messages towards us.
            self.set_ssi_lock(true);
        }
        self.wakeline_users |= id;
    }

    fn release_wakeline(&mut self, user: WakelineUser) {
        let id = WakelineUsers::from(user);
        soft_assert!(!self.wakeline_users.is_empty());
        if !self.wakeline_users.is_empty() {
            self.wakeline_users &= !id;
            if self.wakeline_users.is_empty() {
                let res = self.ioctl_set_wakeline(0);
                trace_io!(
                    "Toggled SSI wakeline to 0 by id {:02x} (res {}).",
                    id.bits(),
                    res
                );
                self.set_ssi_lock(false);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// NokiaModem — the backend proper
// ---------------------------------------------------------------------------

/// CMT Speech Data session over the /dev/cmt_speech kernel interface.
pub struct NokiaModem {
    sm: StateMachine,
    io: DriverIo,
    /// A SPEECH_CONFIG_RESP is waiting for locked buffers to be released.
    speech_config_resp_pend: bool,
    /// Data frame slot size (header + payload) in octets; 0 when the data
    /// path is not configured.
    slot_size: u32,
    conf_sample_rate: u8,
    conf_data_length: u8,
    /// Consecutive UL transfer errors.
    ul_errors: u32,
    ul_frame_counter: u16,
    /// Next pointer the hw driver will write to; None until the first DL
    /// wakeup after (re)configuration.
    rx_ptr_hw: Option<u32>,
    /// Next pointer to give out to the application.
    rx_ptr_appl: Option<u32>,
    /// Next UL slot to give to the application.
    ul_slot_app: Option<usize>,
    dl_bufs: [BufferDesc; DL_SLOTS],
    ul_bufs: [BufferDesc; UL_SLOTS],
}

fn driver_message(cmd_word: u32, param: u8) -> CmtCmd {
    CmtCmd::from_logical([
        (cs_command(cmd_word) << 4) | msgs::DOMAIN_INTERNAL,
        0,
        0,
        param,
    ])
}

/// In-place swap of every 32-bit word in `buf` (0xaabbccdd becomes
/// 0xccddaabb).
fn inplace_halfword_swap(buf: *mut u8, n: usize) {
    debug_assert!(n % 4 == 0);
    for i in 0..n / 4 {
        unsafe {
            let p = buf.add(i * 4) as *mut u32;
            let v = p.read_unaligned();
            p.write_unaligned(v.rotate_left(16));
        }
    }
}

impl NokiaModem {
    /// Opens the speech data connection to the modem.
    pub fn open() -> io::Result<NokiaModem> {
        crate::trace::initialize_tracing();
        trace_info!("Opening device, libcmtspeech v{}.", crate::version_str());

        let path = CString::new(CS_DEV_FILE_NAME).unwrap();
        let rawfd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
        if rawfd < 0 {
            let err = io::Error::last_os_error();
            trace_error!("unable to open device {} ('{}').", CS_DEV_FILE_NAME, err);
            return Err(err);
        }
        let fd = unsafe { OwnedFd::from_raw_fd(rawfd) };

        let mmap = MmapView::map(fd.as_raw_fd(), SHARED_MEMORY_AREA_PAGE).map_err(|err| {
            trace_error!("unable to map device {} ('{}').", CS_DEV_FILE_NAME, err);
            err
        })?;

        trace_io!(
            "Succesfully opened device {} (fd {}), mapped {} octets.",
            CS_DEV_FILE_NAME,
            fd.as_raw_fd(),
            mmap.len()
        );

        let mut modem = NokiaModem {
            sm: StateMachine::new(),
            io: DriverIo {
                fd,
                wakeline_users: WakelineUsers::empty(),
                features: DriverFeatures::empty(),
                mmap,
                dl_swap: vec![0u8; MAX_SLOT_SIZE * DL_SLOTS].into_boxed_slice(),
                events: EventQueue::new(),
                rx_offsets: [0; DL_SLOTS],
                tx_offsets: [0; UL_SLOTS],
            },
            speech_config_resp_pend: false,
            slot_size: 0,
            conf_sample_rate: 0xff,
            conf_data_length: 0xff,
            ul_errors: 0,
            ul_frame_counter: 0,
            rx_ptr_hw: None,
            rx_ptr_appl: None,
            ul_slot_app: None,
            dl_bufs: Default::default(),
            ul_bufs: Default::default(),
        };
        modem.reset_buf_state_to_disconnected();
        Ok(modem)
    }

    /* Buffer descriptor setup */

    fn sample_swap_active(&self) -> bool {
        self.sm.sample_layout() == Some(msgs::SAMPLE_LAYOUT_SWAPPED_LE)
    }

    fn dl_slot_ptr(&mut self, i: usize) -> *mut u8 {
        if self.sample_swap_active() {
            // Descriptors point at the private swap buffer; acquire fills
            // it from the mmap slot.
            unsafe {
                self.io
                    .dl_swap
                    .as_mut_ptr()
                    .add(i * self.slot_size as usize)
            }
        } else {
            self.io.mmap.slot_ptr(self.io.rx_offsets[i])
        }
    }

    fn initialize_tx_buffer_descriptors(&mut self) {
        for i in 0..UL_SLOTS {
            let slotbuf = self.io.mmap.slot_ptr(self.io.tx_offsets[i]);
            self.ul_bufs[i] = BufferDesc {
                bd: FrameBuffer::init(slotbuf, self.slot_size as usize, 0, i),
                flags: BufferStatus::empty(),
            };
        }
    }

    fn initialize_rx_buffer_descriptors(&mut self) {
        for i in 0..DL_SLOTS {
            let slotbuf = self.dl_slot_ptr(i);
            self.dl_bufs[i] = BufferDesc {
                bd: FrameBuffer::init(slotbuf, self.slot_size as usize, 0, i),
                flags: BufferStatus::empty(),
            };
        }
    }

    /// Repoints the DL descriptors after the sample layout has changed.
    /// UL needs no update as sample swapping is done in place.
    fn update_dl_buffer_descriptors(&mut self) {
        for i in 0..DL_SLOTS {
            let slotbuf = self.dl_slot_ptr(i);
            let frame_flags = self.dl_bufs[i].bd.frame_flags;
            self.dl_bufs[i] = BufferDesc {
                bd: FrameBuffer::init(slotbuf, self.slot_size as usize, frame_flags, i),
                flags: BufferStatus::empty(),
            };
        }
    }

    fn locked_bufdescs(&self, verbose: bool) -> usize {
        let mut locked = 0;
        for (i, desc) in self.ul_bufs.iter().enumerate() {
            if desc.flags.contains(BufferStatus::LOCKED) {
                locked += 1;
                if verbose {
                    trace_io!("UL buf {} (data:{:p}) locked.", i, desc.bd.data);
                }
            }
        }
        for (i, desc) in self.dl_bufs.iter().enumerate() {
            if desc.flags.contains(BufferStatus::LOCKED) {
                locked += 1;
                if verbose {
                    trace_io!("DL buf {} (data:{:p}) locked.", i, desc.bd.data);
                }
            }
        }
        locked
    }

    /// Marks all descriptors invalid. Needed when the slot geometry has to
    /// change while the application holds buffers: the change is postponed
    /// until every invalid buffer has been released.
    fn invalidate_buffer_slots(&mut self) {
        for desc in self.ul_bufs.iter_mut() {
            desc.flags |= BufferStatus::INVALID;
        }
        for desc in self.dl_bufs.iter_mut() {
            desc.flags |= BufferStatus::INVALID;
        }
    }

    fn reset_buf_state_to_disconnected(&mut self) {
        self.slot_size = 0;
        self.conf_sample_rate = 0xff;
        self.conf_data_length = 0xff;
        self.speech_config_resp_pend = false;
        self.ul_errors = 0;
        self.rx_ptr_hw = None;
        self.rx_ptr_appl = None;
        self.ul_slot_app = None;
        self.dl_bufs = Default::default();
        self.ul_bufs = Default::default();
        self.invalidate_buffer_slots();
        soft_assert!(self.locked_bufdescs(true) == 0);
    }

    /* Driver buffer configuration */

    fn setup_driver_bufconfig_v2api(&mut self) -> io::Result<()> {
        let drvcfg = CsBufferConfig {
            rx_bufs: DL_SLOTS as u32,
            tx_bufs: UL_SLOTS as u32,
            buf_size: self.slot_size,
            flags: CS_FEAT_TSTAMP_RX_CTRL | CS_FEAT_ROLLING_RX_COUNTER,
            reserved: [0; 4],
        };

        let mut if_ver: u32 = 0;
        let res = unsafe {
            libc::ioctl(
                self.io.fd.as_raw_fd(),
                CS_GET_IF_VERSION as libc::c_ulong,
                &mut if_ver as *mut u32,
            )
        };
        if res < 0 {
            if_ver = 0;
        }

        let res = unsafe {
            libc::ioctl(
                self.io.fd.as_raw_fd(),
                CS_CONFIG_BUFS as libc::c_ulong,
                &drvcfg as *const CsBufferConfig,
            )
        };
        trace_io!(
            "Initialized driver buffer: res {}, params size={}.",
            res,
            drvcfg.buf_size
        );
        if res != 0 {
            let err = io::Error::last_os_error();
            trace_error!("CS_CONFIG_BUFS returned an error: {}", err);
            return Err(err);
        }

        trace_io!(
            "mmap_cfg: ver={}, buf_size={}, rxbufs={}, txbufs={}",
            if_ver,
            self.io.mmap.buf_size(),
            self.io.mmap.rx_bufs(),
            self.io.mmap.tx_bufs()
        );

        // The rolling rx pointer feature was introduced in interface v1.
        if if_ver > 0 {
            self.io.features |= DriverFeatures::ROLLING_RX_PTR;
        }

        // Only run the following when activating.
        if self.slot_size > 0 {
            for i in 0..DL_SLOTS {
                self.io.rx_offsets[i] = self.io.mmap.rx_offset(i);
                trace_io!("mmap_cfg: rxbuf #{} = {}", i, self.io.rx_offsets[i]);
            }
            for i in 0..UL_SLOTS {
                self.io.tx_offsets[i] = self.io.mmap.tx_offset(i);
                trace_io!("mmap_cfg: txbuf #{} = {}", i, self.io.tx_offsets[i]);
            }

            self.initialize_rx_buffer_descriptors();
            self.initialize_tx_buffer_descriptors();
        }

        Ok(())
    }

    /// Configures the driver for data frame exchange with the current
    /// slot geometry.
    fn setup_driver_bufconfig(&mut self) -> io::Result<()> {
        if self.slot_size == 0 {
            // Speech data transfer terminated, reset buffer state.
            self.reset_buf_state_to_disconnected();
        } else {
            // Driver speech frame layout changed.
            self.ul_errors = 0;
            self.rx_ptr_hw = None;
            self.rx_ptr_appl = None;
            self.ul_slot_app = Some(0);
        }

        self.setup_driver_bufconfig_v2api().map_err(|e| {
            trace_error!("Unable to set up buffer config for call");
            e
        })
    }

    /// Applies the pending geometry and replies with SPEECH_CONFIG_RESP.
    fn setup_and_send_speech_config_reply(&mut self) -> Result<(), Error> {
        self.speech_config_resp_pend = false;
        let res = self.setup_driver_bufconfig();

        let reply_result = if res.is_ok() { 0 } else { 1 };
        let respcmd = Message::SpeechConfigResp {
            result: reply_result,
        }
        .encode();

        match self.sm.write_command(&mut self.io, respcmd) {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::Io),
        }
    }

    /// Completes a postponed SPEECH_CONFIG_REQ: once the application has
    /// released the last locked buffer, the driver is reconfigured and the
    /// response goes out.
    fn drvbuf_layout_change_buffer_released(&mut self, dir: SlotDir, index: usize) {
        {
            let desc = match dir {
                SlotDir::Ul => &mut self.ul_bufs[index],
                SlotDir::Dl => &mut self.dl_bufs[index],
            };
            soft_assert!(desc.flags.contains(BufferStatus::LOCKED));
            soft_assert!(desc.flags.contains(BufferStatus::INVALID));
            desc.flags.remove(BufferStatus::LOCKED);
        }
        soft_assert!(self.speech_config_resp_pend);

        let locked = self.locked_bufdescs(true);
        trace_io!("Buffer release during layout change, locked {}.", locked);

        if locked == 0 {
            if let Err(e) = self.setup_and_send_speech_config_reply() {
                trace_info!("Sending SPEECH_CONFIG_RESP (delayed) failed with {}.", e);
                self.invalidate_buffer_slots();
            }
            soft_assert!(!self.speech_config_resp_pend);
        }
    }

    /* Reset handling */

    /// Sends RESET_CONN_REQ. The peer cannot toggle the wakeline itself,
    /// so it stays raised until the response arrives; the buffer
    /// configuration is reset already now in case the peer never answers.
    fn send_reset(&mut self) -> Result<(), Error> {
        self.io.acquire_wakeline(WakelineUser::Reset);

        let msg = Message::ResetConnReq.encode();
        let res = self.sm.write_command(&mut self.io, msg);
        if res.is_err() {
            self.io.release_wakeline(WakelineUser::Reset);
        }

        self.slot_size = 0;
        let _ = self.setup_driver_bufconfig();

        res.map_err(|_| Error::Io)
    }

    fn initialize_after_peer_reset(&mut self) {
        trace_io!("Peer reset, initializing local state.");
        self.slot_size = 0;
        let _ = self.setup_driver_bufconfig();
        self.sm.reset();
        self.io.reset_wakeline_state();
    }

    /// Replies to an incoming RESET_CONN_REQ and tears local state down.
    /// As the reset was initiated by the peer, the wakeline can be
    /// dropped right away.
    fn handle_reset_conn_req(&mut self) {
        let respcmd = Message::ResetConnResp.encode();
        let _ = self.sm.write_command(&mut self.io, respcmd);
        self.initialize_after_peer_reset();
    }

    fn run_follow_up(&mut self, follow_up: FollowUp) {
        match follow_up {
            FollowUp::ErrorReset {
                reset_before_connect,
            } => {
                let _ = self.send_reset();
                if reset_before_connect {
                    self.sm.mark_reset_before_connect();
                }
            }
        }
    }

    /* Inbound message handling */

    fn handle_ssi_config_resp(&mut self) {
        if self.sm.protocol_state() == ProtocolState::Disconnected
            && self.sm.transaction() != Transaction::Connecting
        {
            // Only disable the wakeline when the call terminated, not
            // after each transaction.
            self.io.release_wakeline(WakelineUser::Call);
        } else if self.slot_size > 0 {
            // Sample buffers are already set up; re-point the DL
            // descriptors in case the modem asked for a different sample
            // layout. UL swaps in place, so no update is needed there.
            self.update_dl_buffer_descriptors();
        }
    }

    fn handle_speech_config(&mut self, event: &mut Event) {
        let EventPayload::SpeechConfigReq {
            speech_data_stream,
            sample_rate,
            ..
        } = event.msg
        else {
            return;
        };

        if speech_data_stream != 0 {
            // Call is started or updated.
            self.conf_sample_rate = sample_rate;
            self.conf_data_length = msgs::DATA_LENGTH_20MS;

            let frame_size: i32 = match sample_rate {
                msgs::SAMPLE_RATE_8KHZ => (160 * PCM_SAMPLE_SIZE) as i32,
                msgs::SAMPLE_RATE_16KHZ => (320 * PCM_SAMPLE_SIZE) as i32,
                _ => {
                    trace_error!("Invalid sample rate ({}) in SPEECH_CONFIG_REQ.", sample_rate);
                    self.slot_size = 0;
                    -1
                }
            };

            if frame_size > 0 {
                self.slot_size = frame_size as u32 + DATA_HEADER_LEN as u32;
            }
        } else {
            // Call terminated.
            self.slot_size = 0;
            trace_debug!("Parsing SPEECH_CONFIG_REQ, call terminated.");
        }

        // DMA reconfiguration is needed in all cases, so the layout is
        // marked changed even when the frame size stays the same.
        if let EventPayload::SpeechConfigReq { layout_changed, .. } = &mut event.msg {
            *layout_changed = true;
        }

        if self.locked_bufdescs(false) == 0 {
            // No buffers are held by the application: execute the change
            // immediately. This cancels pending DMA transfers in both
            // directions and resets the mmap area state.
            let _ = self.setup_and_send_speech_config_reply();
        } else {
            trace_io!(
                "Buffer layout changed, but application is holding {} locked buffers. Postponing SPEECH_CONFIG_RESP reply.",
                self.locked_bufdescs(true)
            );
            self.speech_config_resp_pend = true;
            self.invalidate_buffer_slots();
        }
    }

    fn init_bufconfig_for_test_ramp_ping(&mut self, ramplen: u8) -> Result<(), Error> {
        trace_debug!(
            "Initializing driver for TEST_RAMP_PING (ramplen {} words).",
            ramplen
        );

        let new_slot_size = DATA_HEADER_LEN as u32 + ramplen as u32 * 4;
        if self.slot_size != new_slot_size {
            self.slot_size = new_slot_size;
            self.setup_driver_bufconfig().map_err(|_| Error::Io)?;
        }
        Ok(())
    }

    /// Answers an inbound TEST_RAMP_PING directly on the data path.
    fn handle_test_ramp_ping(&mut self, cmd: CmtCmd) {
        let Some(Message::TestRampPing {
            domain,
            reply_domain,
            rampstart,
            ramplen,
        }) = Message::decode(cmd)
        else {
            return;
        };

        trace_io!(
            "Handling inbound TEST_RAMP_PING (ch:{}, replych:{}, start-val:{:#04x}, ramplen {} words).",
            domain,
            reply_domain,
            rampstart,
            ramplen
        );

        self.io.acquire_wakeline(WakelineUser::TestRampPing);

        if self.init_bufconfig_for_test_ramp_ping(ramplen).is_err() {
            return;
        }
        soft_assert!(self.slot_size == DATA_HEADER_LEN as u32 + ramplen as u32 * 4);

        const UL_SLOT: usize = 0;
        let slotbuf = self.io.mmap.slot_ptr(self.io.tx_offsets[UL_SLOT]);
        let slot = unsafe {
            std::slice::from_raw_parts_mut(slotbuf, self.slot_size as usize)
        };

        UlFrameHeader {
            frame_counter: 0xffff,
            data_length: msgs::DATA_LENGTH_NONE,
            sample_rate: msgs::SAMPLE_RATE_NONE,
            data_type: DATA_TYPE_INVALID,
        }
        .encode(slot);

        // Override some header bits: ramp length and a marker octet.
        slot[msgs::BYTE1] = ramplen;
        slot[msgs::BYTE2] = 0x80;

        let mut value = rampstart;
        for octet in slot[DATA_HEADER_LEN..DATA_HEADER_LEN + ramplen as usize * 4].iter_mut() {
            *octet = value;
            value = value.wrapping_add(1);
        }

        // Notify the driver that slot 0 is ready for sending.
        let msg = driver_message(CS_TX_DATA_READY, UL_SLOT as u8);
        let _ = self.sm.write_command(&mut self.io, msg);
    }

    /* DL pointer arithmetic */

    /// Difference between the position the hw driver will write next
    /// (from the mmap segment) and the application position. In normal
    /// conditions between zero and DL_SLOTS-1.
    fn rx_hw_delay(&self) -> u32 {
        let boundary = self.io.mmap.rx_ptr_boundary();
        if boundary == 0 {
            return 0;
        }
        let appl = self.rx_ptr_appl.unwrap_or(0);
        (boundary + self.io.mmap.rx_ptr() - appl) % boundary
    }

    /// Number of RX slots ready for the application. Excludes frames still
    /// queued in the driver (see `rx_hw_delay`).
    fn rx_ptr_avail(&self) -> u32 {
        let boundary = self.io.mmap.rx_ptr_boundary();
        if boundary == 0 {
            return 0;
        }
        let hw = self.rx_ptr_hw.unwrap_or(0);
        let appl = self.rx_ptr_appl.unwrap_or(0);
        (boundary + hw - appl) % boundary
    }

    /// The RX slot to give out to the application, or the error to return
    /// when the application has no frame (`NoData`) or has fallen behind
    /// the driver (`Xrun`).
    fn rx_appl_slot(&self) -> Result<usize, Error> {
        if self.io.features.contains(DriverFeatures::ROLLING_RX_PTR) {
            let boundary = self.io.mmap.rx_ptr_boundary();
            let avail = self.rx_ptr_avail();
            let delay = self.rx_hw_delay();

            if boundary > 0 && avail == boundary - 1 {
                trace_info!(
                    "no frames available (hw {:?}, appl {:?}, avail {}, boundary {}).",
                    self.rx_ptr_hw,
                    self.rx_ptr_appl,
                    avail,
                    boundary
                );
                return Err(Error::NoData);
            } else if delay >= DL_SLOTS as u32 {
                trace_info!(
                    "late appl wakeup (hw {:?}, appl {:?}, delay {}, boundary {}).",
                    self.rx_ptr_hw,
                    self.rx_ptr_appl,
                    delay,
                    boundary
                );
                return Err(Error::Xrun);
            }
        }

        Ok(self.rx_ptr_appl.unwrap_or(0) as usize % DL_SLOTS)
    }

    fn bump_rx_ptr_appl(&mut self) {
        let boundary = if self.io.features.contains(DriverFeatures::ROLLING_RX_PTR) {
            self.io.mmap.rx_ptr_boundary()
        } else {
            DL_SLOTS as u32
        };
        if let Some(appl) = self.rx_ptr_appl {
            self.rx_ptr_appl = Some(if boundary > 0 {
                (appl + 1) % boundary
            } else {
                appl + 1
            });
        }
    }

    /// Resyncs the application pointer after an RX overrun.
    fn rx_ptr_appl_handle_xrun(&mut self) {
        soft_assert!(self.io.features.contains(DriverFeatures::ROLLING_RX_PTR));
        trace_io!("DL xrun, reset hw/appl at {:?}", self.rx_ptr_hw);
        self.rx_ptr_appl = self.rx_ptr_hw;
    }

    fn handle_rx_data_received(&mut self, cmd: CmtCmd, flags: &mut PendingFlags) {
        trace_debug!("internal event DL_DATA_RECEIVED.");

        *flags |= PendingFlags::DL_DATA;
        self.rx_ptr_hw = Some(cmd.word() & CS_PARAM_MASK);

        if self.rx_ptr_appl.is_none() {
            self.rx_ptr_appl = self.rx_ptr_hw;
        }

        let last_slot = self.rx_ptr_hw.unwrap_or(0) as usize % DL_SLOTS;
        let next_slot = (last_slot + 1) % DL_SLOTS;

        if self.io.features.contains(DriverFeatures::ROLLING_RX_PTR)
            && self.rx_hw_delay() >= DL_SLOTS as u32
        {
            // xrun case 1: we have not reacted to driver wakeups fast
            // enough and the driver has overrun the rx buffer.
            trace_info!(
                "DL buffer overrun (mmaphw {}, hw {:?}, appl {:?}, slot {}, hwdelay {}).",
                self.io.mmap.rx_ptr(),
                self.rx_ptr_hw,
                self.rx_ptr_appl,
                last_slot,
                self.rx_hw_delay()
            );
            self.dl_bufs[last_slot].flags |= BufferStatus::XRUN;
            *flags |= PendingFlags::XRUN;
        }

        if self.dl_bufs[next_slot].flags.contains(BufferStatus::LOCKED) {
            // xrun case 2: the slot the driver will write next is still
            // owned by the application. Overrun is not certain, but data
            // coherency cannot be guaranteed.
            trace_info!(
                "possible DL buffer overrun (hw {:?}, appl {:?}, slot {}).",
                self.rx_ptr_hw,
                self.rx_ptr_appl,
                next_slot
            );
            self.dl_bufs[next_slot].flags |= BufferStatus::XRUN;
            *flags |= PendingFlags::XRUN;
        }

        if self.dl_bufs[last_slot].flags.contains(BufferStatus::LOCKED) {
            // xrun case 3: the slot last written by the driver is still
            // owned by the application.
            trace_info!(
                "DL buffer overrun (hw {:?}, appl {:?}, slot {}).",
                self.rx_ptr_hw,
                self.rx_ptr_appl,
                last_slot
            );
            self.dl_bufs[last_slot].flags |= BufferStatus::XRUN;
            *flags |= PendingFlags::XRUN;
        }

        // Seeing DL traffic means the link is alive: re-enable UL if it
        // was paused.
        if self.ul_errors > 0 {
            self.ul_errors = 0;
            trace_io!("DL frame received, reactivating UL transfers.");
        }
    }

    fn queue_control_event(&mut self, event: &Event) {
        if self.io.events.push(event) {
            self.sm.note_io_error();
        }
    }

    /// Parses one inbound word and updates protocol plus buffer state.
    fn handle_inbound_message(
        &mut self,
        cmd: CmtCmd,
        flags: &mut PendingFlags,
    ) -> Result<(), Error> {
        let b = cmd.logical_bytes();
        trace_debug!(
            "handling bytes {:02X}:{:02X}:{:02X}:{:02X}, on domain {}.",
            b[0],
            b[1],
            b[2],
            b[3],
            cmd.domain()
        );

        if cmd.domain() == msgs::DOMAIN_CONTROL {
            trace_io!(
                "read bytes {:02X}:{:02X}:{:02X}:{:02X}, control channel message ({}).",
                b[0],
                b[1],
                b[2],
                b[3],
                cmd.type_to_str()
            );

            let (mut event, follow_up) = self.sm.handle_command(&mut self.io, cmd)?;
            if let Some(f) = follow_up {
                self.run_follow_up(f);
            }

            match cmd.msg_type() {
                msgs::RESET_CONN_REQ => self.handle_reset_conn_req(),
                msgs::RESET_CONN_RESP => self.io.release_wakeline(WakelineUser::Reset),
                msgs::SSI_CONFIG_RESP => self.handle_ssi_config_resp(),
                msgs::SPEECH_CONFIG_REQ => self.handle_speech_config(&mut event),
                msgs::TIMING_CONFIG_NTF => {
                    // Stamp the event with the kernel receive timestamp.
                    if let EventPayload::TimingConfigNtf { tstamp, .. } = &mut event.msg {
                        *tstamp = self.io.mmap.tstamp_rx_ctrl();
                    }
                }
                msgs::UPLINK_CONFIG_NTF => {}
                msgs::TEST_RAMP_PING => self.handle_test_ramp_ping(cmd),
                _ => {
                    trace_error!("unknown control message of type {}.", cmd.msg_type());
                    soft_assert!(false);
                }
            }

            self.sm.complete_event(&mut event);

            if cmd.msg_type() != msgs::TEST_RAMP_PING {
                self.queue_control_event(&event);
                *flags |= PendingFlags::CONTROL;
            }
            Ok(())
        } else if cmd.domain() == msgs::DOMAIN_INTERNAL {
            // Internal wakeups are generated by the driver, never sent by
            // the peer.
            const RX_DATA_RECEIVED: u8 = cs_command(CS_RX_DATA_RECEIVED);
            const TX_DATA_SENT: u8 = cs_command(CS_TX_DATA_SENT);
            const PEER_RESET_DONE: u8 = cs_command(CS_PEER_RESET_DONE);

            match cs_command(cmd.word()) {
                RX_DATA_RECEIVED => {
                    self.handle_rx_data_received(cmd, flags);
                }
                TX_DATA_SENT => {
                    trace_debug!("internal event UL_DATA_SENT.");
                }
                PEER_RESET_DONE => {
                    trace_error!("PEER_RESET received, reseting state");
                    let mut event = Event {
                        msg_type: msgs::EVENT_RESET,
                        prev_state: self.sm.protocol_state(),
                        state: self.sm.protocol_state(),
                        msg: EventPayload::Reset { cmt_sent_req: true },
                    };
                    self.initialize_after_peer_reset();
                    event.state = self.sm.protocol_state();
                    self.queue_control_event(&event);
                    *flags |= PendingFlags::CONTROL;
                }
                id => {
                    trace_error!(
                        "unknown internal message of type {} ({:02X}:{:02X}:{:02X}:{:02X}).",
                        id,
                        b[0],
                        b[1],
                        b[2],
                        b[3]
                    );
                }
            }
            Ok(())
        } else {
            Err(Error::Invalid)
        }
    }
}

impl CmtSpeech for NokiaModem {
    fn descriptor(&self) -> RawFd {
        self.io.fd.as_raw_fd()
    }

    fn check_pending(&mut self) -> Result<PendingFlags, Error> {
        let mut flags = PendingFlags::empty();
        let mut wire = [0u8; CTRL_LEN];

        let n = unsafe {
            libc::read(
                self.io.fd.as_raw_fd(),
                wire.as_mut_ptr() as *mut libc::c_void,
                CTRL_LEN,
            )
        };
        if n >= CTRL_LEN as isize {
            let cmd = CmtCmd::from_wire(wire);
            self.handle_inbound_message(cmd, &mut flags)?;
        } else {
            trace_error!("read returned {}.", n);
        }

        Ok(flags)
    }

    fn read_event(&mut self) -> Result<Event, Error> {
        self.io.events.pop().ok_or(Error::NoData)
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

    fn state_change_call_status(&mut self, state: bool) -> Result<(), Error> {
        let follow_up = self.sm.state_change_call_status(&mut self.io, state);
        if let Some(f) = follow_up {
            self.run_follow_up(f);
        }
        Ok(())
    }

    fn state_change_call_connect(&mut self, state: bool) -> Result<(), Error> {
        self.sm.state_change_call_connect(state);
        Ok(())
    }

    fn state_change_error(&mut self) -> Result<(), Error> {
        self.send_reset()
    }

    fn set_wb_preference(&mut self, enabled: bool) -> Result<(), Error> {
        self.sm.set_wb_preference(enabled)
    }

    fn ul_buffer_acquire(&mut self) -> Result<FrameBuffer, Error> {
        if !self.sm.is_active() {
            return Err(Error::Invalid);
        }
        let Some(slot) = self.ul_slot_app else {
            return Err(Error::Invalid);
        };

        let desc = &mut self.ul_bufs[slot];
        if desc.flags.contains(BufferStatus::INVALID) {
            return Err(Error::Invalid);
        }
        if desc.flags.contains(BufferStatus::LOCKED) {
            return Err(Error::NoBufs);
        }

        desc.bd.frame_flags = 0;
        desc.flags |= BufferStatus::LOCKED;

        soft_assert!(desc.bd.count == desc.bd.size);
        soft_assert!(desc.bd.pcount == desc.bd.count - DATA_HEADER_LEN);
        soft_assert!(desc.bd.index == slot);

        let out = desc.bd.clone();
        self.ul_slot_app = Some((slot + 1) % UL_SLOTS);
        Ok(out)
    }

    fn ul_buffer_release(&mut self, buf: FrameBuffer) -> Result<(), Error> {
        soft_assert!(self.sm.protocol_state() == ProtocolState::ActiveDlUl);

        let index = buf.index;
        if index >= UL_SLOTS {
            return Err(Error::Invalid);
        }

        // Special case: a geometry change is waiting for this buffer.
        if self.speech_config_resp_pend {
            self.drvbuf_layout_change_buffer_released(SlotDir::Ul, index);
            soft_assert!(self.ul_bufs[index].flags.is_empty());
            return Ok(());
        }

        soft_assert!(self.ul_bufs[index].bd.data == buf.data);
        soft_assert!(self.ul_bufs[index].bd.payload == buf.payload);

        let res = if self.ul_errors >= MAX_UL_ERRORS_PAUSE {
            if self.sm.io_errors() > 0 {
                // With some peer firmware releases UL DMA transfers fail on
                // loss of network coverage; only report a hard I/O error
                // once control-channel errors have accumulated as well.
                Err(Error::Io)
            } else {
                // Enough consecutive errors: stop sending UL frames until
                // a DL frame shows the link is alive again.
                Err(Error::Busy)
            }
        } else if self.sm.protocol_state() == ProtocolState::ActiveDlUl {
            trace_debug!("filling UL slot {}, size {}.", index, buf.pcount);

            let desc = &self.ul_bufs[index];
            if self.sample_swap_active() && desc.bd.pcount > 0 {
                inplace_halfword_swap(desc.bd.payload, desc.bd.pcount);
            }

            let slot =
                unsafe { std::slice::from_raw_parts_mut(desc.bd.data, DATA_HEADER_LEN) };
            UlFrameHeader {
                frame_counter: self.ul_frame_counter,
                data_length: self.conf_data_length,
                sample_rate: self.conf_sample_rate,
                data_type: buf.frame_flags,
            }
            .encode(slot);

            let msg = driver_message(CS_TX_DATA_READY, index as u8);
            match self.io.write_data(msg) {
                Ok(()) => {
                    // One frame is 4 x 5ms.
                    self.ul_frame_counter = self.ul_frame_counter.wrapping_add(4);
                    Ok(())
                }
                Err(e) => {
                    trace_io!("UL frame send failed ({})", e);
                    if e.raw_os_error() == Some(libc::EBUSY) {
                        self.ul_errors += 1;
                        Err(Error::Busy)
                    } else {
                        // Transport in an invalid state, stop sending more
                        // UL frames immediately.
                        self.ul_errors = MAX_UL_ERRORS_PAUSE;
                        Err(Error::Invalid)
                    }
                }
            }
        } else {
            Err(Error::Xrun)
        };

        self.ul_bufs[index].flags.remove(BufferStatus::LOCKED);
        res
    }

    fn dl_buffer_acquire(&mut self) -> Result<FrameBuffer, Error> {
        if self.rx_ptr_appl.is_none() {
            return Err(Error::Invalid);
        }

        let slot = match self.rx_appl_slot() {
            Ok(slot) => slot,
            Err(e) => {
                if e == Error::Xrun {
                    self.rx_ptr_appl_handle_xrun();
                }
                return Err(e);
            }
        };

        debug_assert!(slot < DL_SLOTS);

        // The pointer must be bumped before the checks below that may
        // return with an error.
        self.bump_rx_ptr_appl();

        if self.dl_bufs[slot].flags.contains(BufferStatus::INVALID) {
            return Err(Error::Invalid);
        }

        let mmap_slot = self.io.mmap.slot_ptr(self.io.rx_offsets[slot]);
        let header = DlFrameHeader::decode(unsafe {
            std::slice::from_raw_parts(mmap_slot, DATA_HEADER_LEN)
        });

        trace_debug!(
            "DL frame received (hw {:?}, appl {:?}, slot {}, {} bytes, frame-counter {}, type {}):",
            self.rx_ptr_hw,
            self.rx_ptr_appl,
            slot,
            self.slot_size,
            header.frame_counter,
            header.data_type
        );

        let swap = self.sample_swap_active();
        let desc = &mut self.dl_bufs[slot];

        desc.bd.frame_flags = DATA_TYPE_VALID;
        desc.bd.spc_flags = crate::SpcFlags::from_bits_truncate(header.spc_flags);
        desc.flags |= BufferStatus::LOCKED;

        if swap {
            // Copy the frame from the mmap area into the private buffer
            // the descriptor points at, then swap the payload half-words.
            soft_assert!(desc.bd.data != mmap_slot);
            unsafe {
                std::ptr::copy_nonoverlapping(mmap_slot, desc.bd.data, desc.bd.count);
            }
            if desc.bd.pcount > 0 {
                inplace_halfword_swap(desc.bd.payload, desc.bd.pcount);
            }
        }

        soft_assert!(desc.bd.count == self.slot_size as usize);
        soft_assert!(desc.bd.pcount == desc.bd.count - DATA_HEADER_LEN);
        soft_assert!(desc.bd.index == slot);

        let out = desc.bd.clone();

        if self.sm.protocol_state() == ProtocolState::TestRampPingActive {
            self.sm.test_sequence_received();
        }

        Ok(out)
    }

    fn dl_buffer_release(&mut self, buf: FrameBuffer) -> Result<(), Error> {
        let index = buf.index;
        if index >= DL_SLOTS || !self.dl_bufs[index].flags.contains(BufferStatus::LOCKED) {
            return Err(Error::NotFound);
        }

        // Special case: a geometry change is waiting for this buffer.
        if self.speech_config_resp_pend {
            self.drvbuf_layout_change_buffer_released(SlotDir::Dl, index);
            soft_assert!(self.dl_bufs[index].flags.is_empty());
            return Ok(());
        }

        soft_assert!(self.dl_bufs[index].bd.data == buf.data);
        soft_assert!(self.dl_bufs[index].bd.payload == buf.payload);

        self.dl_bufs[index].flags.remove(BufferStatus::LOCKED);

        if self.dl_bufs[index].flags.contains(BufferStatus::XRUN) {
            self.dl_bufs[index].flags.remove(BufferStatus::XRUN);
            return Err(Error::Xrun);
        }

        Ok(())
    }

    fn dl_buffer_find_with_data(&self, data: *const u8) -> Option<FrameBuffer> {
        self.dl_bufs
            .iter()
            .find(|desc| desc.bd.data as *const u8 == data)
            .map(|desc| desc.bd.clone())
    }

    fn dl_buffer_find_with_payload(&self, payload: *const u8) -> Option<FrameBuffer> {
        self.dl_bufs
            .iter()
            .find(|desc| desc.bd.payload as *const u8 == payload)
            .map(|desc| desc.bd.clone())
    }

    fn send_timing_request(&mut self) -> Result<(), Error> {
        self.sm.send_timing_request(&mut self.io)
    }

    fn send_ssi_config_request(&mut self, active: bool) -> Result<(), Error> {
        self.sm.send_ssi_config_request(&mut self.io, active)
    }

    fn test_data_ramp_req(&mut self, rampstart: u8, ramplen: u8) -> Result<(), Error> {
        self.init_bufconfig_for_test_ramp_ping(ramplen)?;
        self.io.acquire_wakeline(WakelineUser::TestRampPing);
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

impl Drop for NokiaModem {
    fn drop(&mut self) {
        self.io.reset_wakeline_state();
        // The mmap view and the device fd are released by their own drops.
    }
}
