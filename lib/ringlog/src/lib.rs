// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing boot events before any I/O channel exists.
//!
//! The bootloader's decision pass runs before the USB stack, before flash
//! drivers, often before a UART is clocked. The only diagnostic channel that
//! is always available is memory itself: each crate declares a small static
//! ring of events, records into it as it runs, and a debugger reads the ring
//! back after the fact.
//!
//! Declare a ring with [`ringlog!`], giving the event type, entry count, and
//! a static initializer for the payload:
//!
//! ```ignore
//! ringlog!(Event, 16, Event::None);
//! ```
//!
//! and record into it with [`ringlog_entry!`]:
//!
//! ```ignore
//! ringlog_entry!(Event::WindowElapsed);
//! ```
//!
//! Each entry carries the source line of the recording site, a generation
//! counter, and a repeat count: recording the same event from the same line
//! twice in a row bumps the count of the existing entry instead of consuming
//! a new slot, so a busy-polled path does not flush the ring.

#![cfg_attr(not(test), no_std)]

use spin::Mutex;

/// One slot of a [`RingLog`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Entry<E: Copy + PartialEq> {
    /// Source line of the recording site, from `line!()`.
    pub line: u16,
    /// Incremented each time this slot is rewritten; lets a reader tell a
    /// live entry from the static initializer.
    pub generation: u16,
    /// Number of consecutive identical recordings coalesced into this slot.
    pub count: u32,
    pub payload: E,
}

struct Inner<E: Copy + PartialEq, const N: usize> {
    /// Index of the most recent entry, or `None` if nothing has been
    /// recorded yet.
    last: Option<usize>,
    buffer: [Entry<E>; N],
}

/// A fixed-size event ring. Declare statics with [`ringlog!`] rather than
/// naming this type directly.
pub struct RingLog<E: Copy + PartialEq, const N: usize> {
    inner: Mutex<Inner<E, N>>,
}

impl<E: Copy + PartialEq, const N: usize> RingLog<E, N> {
    /// Creates an empty ring. `init` fills the unused slots; it never shows
    /// up as a recorded entry because generations start at zero.
    pub const fn new(init: E) -> Self {
        Self {
            inner: Mutex::new(Inner {
                last: None,
                buffer: [Entry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: init,
                }; N],
            }),
        }
    }

    /// Records `payload` from source line `line`, coalescing with the most
    /// recent entry when both line and payload match. The oldest entry is
    /// overwritten once the ring is full.
    pub fn record(&self, line: u16, payload: E) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let ndx = match inner.last {
            None => 0,
            Some(last) => {
                let ent = &mut inner.buffer[last];
                if ent.line == line && ent.payload == payload {
                    ent.count += 1;
                    return;
                }
                if last + 1 >= N {
                    0
                } else {
                    last + 1
                }
            }
        };

        let ent = &mut inner.buffer[ndx];
        ent.line = line;
        ent.payload = payload;
        ent.count = 1;
        ent.generation += 1;
        inner.last = Some(ndx);
    }

    /// Copies the ring out: the buffer contents and the index of the most
    /// recent entry. Intended for tests and host-side tooling; on target the
    /// ring is read in place by the debugger.
    pub fn snapshot(&self) -> ([Entry<E>; N], Option<usize>) {
        let inner = self.inner.lock();
        (inner.buffer, inner.last)
    }
}

/// Declares a static event ring named `RINGLOG` in the current scope, for
/// use with [`ringlog_entry!`].
#[macro_export]
macro_rules! ringlog {
    ($etype:ty, $n:tt, $init:expr) => {
        static RINGLOG: $crate::RingLog<$etype, $n> =
            $crate::RingLog::new($init);
    };
}

/// Records an entry, with the call site's line number, into the ring
/// declared by [`ringlog!`] in the enclosing scope.
#[macro_export]
macro_rules! ringlog_entry {
    ($payload:expr) => {
        RINGLOG.record(line!() as u16, $payload);
    };
}
