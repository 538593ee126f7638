// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Frame buffer descriptors. A descriptor points at one slot of the
// transport's slot ring (header plus payload); acquiring a slot hands the
// application a descriptor, releasing it returns the slot to the ring.

use bitflags::bitflags;

use crate::msgs::{DlFrameHeader, DATA_HEADER_LEN};

/// A continuous stream of little-endian 16-bit PCM samples.
pub const BUFFER_TYPE_PCM_S16_LE: u8 = 0;

/* Frame data types ('frame_flags' field) */

pub const DATA_TYPE_ZERO: u8 = 0x00;
pub const DATA_TYPE_INVALID: u8 = 0x01;
pub const DATA_TYPE_VALID: u8 = 0x02;

bitflags! {
    /// Speech codec flags carried by downlink frames. Always zero for
    /// uplink frames.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SpcFlags: u8 {
        const SPEECH    = 1 << 0;
        const BFI       = 1 << 1;
        const ATTENUATE = 1 << 2;
        const DEC_RESET = 1 << 3;
        const MUTE      = 1 << 4;
        const PREV      = 1 << 5;
        const DTX_USED  = 1 << 6;
    }
}

bitflags! {
    // Slot bookkeeping, library internal.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct BufferStatus: u8 {
        /// Currently held by the application.
        const LOCKED  = 1 << 0;
        /// Slot geometry changed since acquisition; must be released
        /// before any further use.
        const INVALID = 1 << 1;
        /// An overrun was detected during this slot's lifetime.
        const XRUN    = 1 << 2;
        const LAST    = 1 << 3;
    }
}

/// Frame data buffer descriptor.
///
/// `data` spans the whole slot (header plus payload), `payload` the
/// payload only. For uplink buffers the application fills
/// [`payload_mut`](Self::payload_mut) and sets `frame_flags`; for
/// downlink buffers the contents must not be written.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    /// Buffer type (`BUFFER_TYPE_*`).
    pub buf_type: u8,
    /// Frame flags (`DATA_TYPE_*`).
    pub frame_flags: u8,
    /// Speech codec flags; zero for uplink.
    pub spc_flags: SpcFlags,
    pub(crate) count: usize,
    pub(crate) pcount: usize,
    pub(crate) size: usize,
    pub(crate) data: *mut u8,
    pub(crate) payload: *mut u8,
    pub(crate) index: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self {
            buf_type: BUFFER_TYPE_PCM_S16_LE,
            frame_flags: 0,
            spc_flags: SpcFlags::empty(),
            count: 0,
            pcount: 0,
            size: 0,
            data: std::ptr::null_mut(),
            payload: std::ptr::null_mut(),
            index: 0,
        }
    }
}

impl FrameBuffer {
    pub(crate) fn init(
        slotbuf: *mut u8,
        slot_size: usize,
        frame_flags: u8,
        index: usize,
    ) -> FrameBuffer {
        FrameBuffer {
            buf_type: BUFFER_TYPE_PCM_S16_LE,
            frame_flags,
            spc_flags: SpcFlags::empty(),
            count: slot_size,
            pcount: slot_size - DATA_HEADER_LEN,
            size: slot_size,
            data: slotbuf,
            payload: unsafe { slotbuf.add(DATA_HEADER_LEN) },
            index,
        }
    }

    /// Octets of valid data, including the 4-octet header.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Octets of valid payload data.
    pub fn pcount(&self) -> usize {
        self.pcount
    }

    /// Octets of allocated slot space.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Slot index within the ring.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The whole slot: header plus payload.
    pub fn data(&self) -> &[u8] {
        if self.data.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.data, self.count) }
    }

    /// The frame payload.
    pub fn payload(&self) -> &[u8] {
        if self.payload.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.payload, self.pcount) }
    }

    /// Mutable access to the frame payload. Only valid for uplink
    /// buffers.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        if self.payload.is_null() {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.payload, self.pcount) }
    }

    /// Sample rate of the frame (`SAMPLE_RATE_*`), decoded from the slot
    /// header.
    pub fn sample_rate(&self) -> u8 {
        if self.count < DATA_HEADER_LEN {
            return crate::msgs::SAMPLE_RATE_NONE;
        }
        DlFrameHeader::decode(self.data()).sample_rate
    }

    /// Codec sample rate as used on the radio interface
    /// (`SAMPLE_RATE_*`). May differ from [`sample_rate`](Self::sample_rate)
    /// when the modem resamples decoded frames.
    pub fn codec_sample_rate(&self) -> u8 {
        if self.count < DATA_HEADER_LEN {
            return crate::msgs::SAMPLE_RATE_NONE;
        }
        DlFrameHeader::decode(self.data()).codec_sample_rate
    }
}
