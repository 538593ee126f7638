// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Helpers for the peer-emulation backend: the DL tone source and the
// fixed-period pacing timer.

use std::time::{Duration, Instant};

use crate::buffer::{SpcFlags, DATA_TYPE_VALID};
use crate::msgs::{self, DlFrameHeader, DATA_HEADER_LEN};
use crate::trace::{trace_info, trace_io};

/// 400 Hz sine wave, signed 16-bit, one period at 8kHz.
const SINE_WAVE: [i16; 20] = [
    0, 2531, 4814, 6626, 7790, 8191, 7790, 6626, 4814, 2531, 0, -2531, -4814, -6626, -7790, -8191,
    -7790, -6626, -4814, -2531,
];

/// Endless source of 16-bit samples for generated DL frames.
pub(crate) struct Tone {
    buf: Vec<i16>,
    pos: usize,
}

impl Tone {
    /// Creates a tone source. The DUMMYSRC environment variable overrides
    /// `typestr`; "sine" selects the built-in table, anything else is
    /// read as a raw little-endian 16-bit sample file.
    pub fn initialize(typestr: &str) -> Option<Tone> {
        let src = std::env::var("DUMMYSRC").unwrap_or_else(|_| typestr.to_string());

        if src == "sine" {
            trace_io!("tone buf created of length {}, sine tone", SINE_WAVE.len() * 2);
            return Some(Tone {
                buf: SINE_WAVE.to_vec(),
                pos: 0,
            });
        }

        match std::fs::read(&src) {
            Ok(bytes) if !bytes.is_empty() => {
                let samples: Vec<i16> = bytes
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]))
                    .collect();
                trace_io!("tone buf created of length {}, file {}.", bytes.len(), src);
                Some(Tone {
                    buf: samples,
                    pos: 0,
                })
            }
            _ => {
                trace_info!("unable to open tone file {}", src);
                None
            }
        }
    }

    fn next_sample(&mut self) -> i16 {
        let value = self.buf[self.pos];
        self.pos = (self.pos + 1) % self.buf.len();
        value
    }

    /// Fills `slot` with a DL frame header followed by tone samples.
    pub fn fill_slot(&mut self, slot: &mut [u8], counter: u16, sample_rate: u8) {
        DlFrameHeader {
            frame_counter: counter,
            spc_flags: SpcFlags::SPEECH.bits(),
            data_length: msgs::DATA_LENGTH_20MS,
            sample_rate,
            codec_sample_rate: msgs::SAMPLE_RATE_NONE,
            data_type: DATA_TYPE_VALID,
        }
        .encode(slot);

        for frame in slot[DATA_HEADER_LEN..].chunks_exact_mut(2) {
            frame.copy_from_slice(&self.next_sample().to_le_bytes());
        }
    }
}

/// Pacing timer for the DL frame generator. Catch-up uses fixed periods
/// so the long-run rate stays at one frame per period.
pub(crate) struct PollTimer {
    last_elapsed: Option<Instant>,
    base_period: Duration,
}

impl PollTimer {
    pub fn new(period_ms: u64) -> Self {
        Self {
            last_elapsed: None,
            base_period: Duration::from_millis(period_ms),
        }
    }

    /// Poll timeout in milliseconds until the next frame is due.
    pub fn pre_poll_timeout(&self) -> i32 {
        match self.last_elapsed {
            Some(last) => {
                let cycle = last.elapsed();
                if cycle >= self.base_period {
                    0
                } else {
                    (self.base_period - cycle).as_millis() as i32 + 1
                }
            }
            None => self.base_period.as_millis() as i32,
        }
    }

    /// Whether the next frame deadline has been reached, allowing
    /// `margin` of early wakeup.
    pub fn is_elapsed(&self, margin: Duration) -> bool {
        match self.last_elapsed {
            Some(last) => last.elapsed() + margin >= self.base_period,
            None => true,
        }
    }

    /// Advances the deadline by one fixed base period.
    pub fn elapsed_fixed_period(&mut self) {
        self.last_elapsed = Some(match self.last_elapsed {
            Some(last) => last + self.base_period,
            None => Instant::now(),
        });
    }
}
