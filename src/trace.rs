// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Leveled trace facility. Each priority maps to one bit in a global
// mask; emission is a bit-test followed by formatted output through an
// overridable handler. The mask is seeded once from the CMTSPEECHDEBUG
// environment variable.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, Once};

/* Trace priorities */

pub const TRACE_ERROR: u32 = 0;
pub const TRACE_INFO: u32 = 3;
pub const TRACE_STATE_CHANGE: u32 = 4;
pub const TRACE_IO: u32 = 5;
pub const TRACE_DEBUG: u32 = 8;
pub const TRACE_INTERNAL: u32 = 16;

const BIT_ERROR: u32 = 1 << TRACE_ERROR;
const BIT_INFO: u32 = 1 << TRACE_INFO;
const BIT_STATE_CHANGE: u32 = 1 << TRACE_STATE_CHANGE;
const BIT_IO: u32 = 1 << TRACE_IO;
const BIT_DEBUG: u32 = 1 << TRACE_DEBUG;
const BIT_TOKEN: u32 = 1 << TRACE_INTERNAL;

/// Handler invoked for every emitted trace line.
pub type TraceHandler = fn(priority: u32, message: &str);

static TRACE_MASK: AtomicU32 = AtomicU32::new(BIT_ERROR | BIT_INFO);
static TRACE_HANDLER: Mutex<Option<TraceHandler>> = Mutex::new(None);
static TRACE_INIT: Once = Once::new();

/// Enables or disables trace messages of the given priority.
pub fn trace_toggle(priority: u32, enabled: bool) {
    if enabled {
        TRACE_MASK.fetch_or(1 << priority, Ordering::Relaxed);
    } else {
        TRACE_MASK.fetch_and(!(1 << priority), Ordering::Relaxed);
    }
}

/// Sets the function called when the library emits a trace message, or
/// resets back to the default stdout handler with `None`.
pub fn set_trace_handler(handler: Option<TraceHandler>) {
    *TRACE_HANDLER.lock().unwrap() = handler;
}

#[inline]
pub(crate) fn enabled(priority: u32) -> bool {
    TRACE_MASK.load(Ordering::Relaxed) & (1 << priority) != 0
}

pub(crate) fn emit(priority: u32, args: fmt::Arguments<'_>) {
    let handler = *TRACE_HANDLER.lock().unwrap();
    match handler {
        Some(f) => f(priority, &args.to_string()),
        None => {
            if priority == TRACE_ERROR {
                println!("ERROR: CMTSPEECH: {args}");
            } else {
                println!("CMTSPEECH: {args}");
            }
        }
    }
}

/// Seeds the trace mask from the CMTSPEECHDEBUG environment variable.
/// Recognised keywords: `info`, `trace`, `debug`, `token` and their
/// `no`-prefixed counterparts. Runs once per process.
pub(crate) fn initialize_tracing() {
    TRACE_INIT.call_once(|| {
        let Ok(debstr) = std::env::var("CMTSPEECHDEBUG") else {
            return;
        };
        let mut mask = TRACE_MASK.load(Ordering::Relaxed);

        if debstr.contains("noinfo") {
            mask &= !BIT_INFO;
        } else if debstr.contains("info") {
            mask |= BIT_INFO;
        }

        if debstr.contains("notrace") {
            mask &= !(BIT_STATE_CHANGE | BIT_IO);
        } else if debstr.contains("trace") {
            mask |= BIT_STATE_CHANGE | BIT_IO;
        }

        if debstr.contains("nodebug") {
            mask &= !BIT_DEBUG;
        } else if debstr.contains("debug") {
            mask |= BIT_DEBUG;
        }

        if debstr.contains("notoken") {
            mask &= !BIT_TOKEN;
        } else if debstr.contains("token") {
            mask |= BIT_TOKEN;
        }

        TRACE_MASK.store(mask, Ordering::Relaxed);
    });
}

macro_rules! trace_error {
    ($($arg:tt)*) => {
        if $crate::trace::enabled($crate::trace::TRACE_ERROR) {
            $crate::trace::emit($crate::trace::TRACE_ERROR, format_args!($($arg)*));
        }
    };
}

macro_rules! trace_info {
    ($($arg:tt)*) => {
        if $crate::trace::enabled($crate::trace::TRACE_INFO) {
            $crate::trace::emit($crate::trace::TRACE_INFO, format_args!($($arg)*));
        }
    };
}

macro_rules! trace_state_change {
    ($($arg:tt)*) => {
        if $crate::trace::enabled($crate::trace::TRACE_STATE_CHANGE) {
            $crate::trace::emit($crate::trace::TRACE_STATE_CHANGE, format_args!($($arg)*));
        }
    };
}

macro_rules! trace_io {
    ($($arg:tt)*) => {
        if $crate::trace::enabled($crate::trace::TRACE_IO) {
            $crate::trace::emit($crate::trace::TRACE_IO, format_args!($($arg)*));
        }
    };
}

macro_rules! trace_debug {
    ($($arg:tt)*) => {
        if $crate::trace::enabled($crate::trace::TRACE_DEBUG) {
            $crate::trace::emit($crate::trace::TRACE_DEBUG, format_args!($($arg)*));
        }
    };
}

// Non-fatal invariant check: traces on failure in debug builds, never
// aborts.
macro_rules! soft_assert {
    ($cond:expr) => {
        if cfg!(debug_assertions) && !$cond {
            $crate::trace::trace_info!(
                "ASSERT FAILED: {}:{} '{}'",
                file!(),
                line!(),
                stringify!($cond)
            );
        }
    };
}

pub(crate) use {soft_assert, trace_debug, trace_error, trace_info, trace_io, trace_state_change};
