// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boot-mode decision engine.
//!
//! This is the logic that runs once per reset, before any peripheral stack
//! is initialized, and produces the one decision the bootloader exists to
//! make: boot the flashed application, or stay resident in update mode. It
//! consumes exactly three inputs and nothing else:
//!
//! - the application's validity, re-queried from the board every pass;
//! - the retained tap register (see the `tapreg` crate);
//! - a bounded real-time window, counted in ticks that a board timer
//!   interrupt delivers through a [`Ticker`].
//!
//! The double-tap protocol works by arming the register and then waiting:
//! the engine writes [`Signal::TapPending`], busy-polls the tick count for
//! the configured window, and clears the register if nothing happens. A
//! reset arriving inside the window restarts the whole pass, which then
//! finds `TapPending` still set and enters update mode. The engine never
//! observes the second reset directly; it only ever sees its own breadcrumb
//! from the previous pass. A crash inside the window followed by a reset is
//! indistinguishable from a deliberate double tap, which is accepted
//! behavior.
//!
//! There are no recoverable errors here: every combination of register
//! pattern and validity input maps to a defined outcome, because nothing
//! capable of reporting an error exists yet when this code runs.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicU32, Ordering};

use ringlog::{ringlog, ringlog_entry};
use tapreg::{Signal, TapRegister};

/// Tick period the engine asks the board timer for, so that tick counts are
/// directly comparable to the millisecond window configuration.
pub const TICK_PERIOD_MS: u32 = 1;

/// Terminal decision of one boot pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootMode {
    /// Hand control to the flashed application.
    Application,
    /// Stay resident and run the firmware-update stack.
    Update,
    /// Erase the application image first, then run the firmware-update
    /// stack. Erasing first means a reset during the update cannot boot the
    /// half-dead image: the next pass fails the validity check instead.
    EraseThenUpdate,
}

/// Application validity as reported by the board this pass.
///
/// The secondary check is an optional collaborator: boards with a single
/// validity mechanism report `None`, which is not the same as passing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AppValidity {
    pub primary: bool,
    pub secondary: Option<bool>,
}

impl AppValidity {
    /// Validity of a board with only the primary check.
    pub fn single(primary: bool) -> Self {
        Self {
            primary,
            secondary: None,
        }
    }

    /// True only if every check that exists passed.
    pub fn is_valid(&self) -> bool {
        self.primary && self.secondary.unwrap_or(true)
    }
}

/// Double-tap window configuration, fixed at build time by the integrator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TapWindow {
    /// How long the armed register waits for a second reset.
    pub window_ms: u32,
    /// Board-supplied peripheral warm-up delay, run with the register
    /// already armed and before the window proper. Most boards need none;
    /// some want a few ticks for an indicator LED to come up.
    pub warmup_ms: u32,
}

impl TapWindow {
    pub const DEFAULT: Self = Self {
        window_ms: 500,
        warmup_ms: 0,
    };
}

/// The engine's only view of time: a startable tick source.
///
/// `ticks()` reports periods elapsed since `start()`. The expected backing
/// is a board timer interrupt incrementing a [`TickCounter`].
pub trait Ticker {
    fn start(&mut self, period_ms: u32);
    fn stop(&mut self);
    fn ticks(&self) -> u32;
}

/// Tick count shared between a timer interrupt handler and the engine's
/// poll loop.
///
/// The counter has exactly one writer (the interrupt handler, via
/// [`increment`]) and one reader (the poll loop, via [`read`]), and the two
/// never race on a write, so relaxed ordering is all that is required. The
/// increment is a load/store pair rather than a fetch-add so the type also
/// works on ARMv6-M parts, which have no atomic read-modify-write.
///
/// [`increment`]: TickCounter::increment
/// [`read`]: TickCounter::read
pub struct TickCounter(AtomicU32);

impl TickCounter {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Advances the count by one. Must only be called from the single
    /// writer, normally the board's periodic timer interrupt.
    pub fn increment(&self) {
        let n = self.0.load(Ordering::Relaxed);
        self.0.store(n.wrapping_add(1), Ordering::Relaxed);
    }

    pub fn read(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Restarts the count. Must not race `increment`; callers reset before
    /// starting the timer that drives the writer.
    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

impl Default for TickCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine trace, read from a debugger. One entry per decision path taken.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    None,
    AppInvalid,
    QuickBoot,
    DoubleTap,
    EraseRequested,
    /// Window armed; carries the raw word found in the register, which is
    /// nonzero only when a stray value was treated as "no signal".
    Armed(u32),
    WindowElapsed,
}

ringlog!(Event, 16, Event::None);

/// Decides the boot mode for this pass.
///
/// Precedence is fixed: validity first (a broken application is never
/// booted, gesture or not), then the detection-enabled checks, then the
/// register dispatch. The register is committed before return: it ends
/// [`Signal::Empty`] on every path except the armed window itself, which
/// deliberately leaves [`Signal::TapPending`] visible to a pass that
/// preempts the wait.
///
/// `scratch` is `None` on boards without retained storage and `window` is
/// `None` when double-tap detection is configured out; either one disables
/// detection and boots the valid application untimed, with the ticker
/// untouched.
pub fn decide<R: TapRegister, T: Ticker>(
    app: AppValidity,
    scratch: Option<&mut R>,
    ticker: &mut T,
    window: Option<TapWindow>,
) -> BootMode {
    if !app.is_valid() {
        ringlog_entry!(Event::AppInvalid);
        return BootMode::Update;
    }

    let (Some(reg), Some(window)) = (scratch, window) else {
        return BootMode::Application;
    };

    match reg.read() {
        Signal::QuickBoot => {
            ringlog_entry!(Event::QuickBoot);
            reg.write(Signal::Empty);
            BootMode::Application
        }
        Signal::TapPending => {
            // Our own breadcrumb from a pass that was reset mid-window: the
            // gesture fired.
            ringlog_entry!(Event::DoubleTap);
            reg.write(Signal::Empty);
            BootMode::Update
        }
        Signal::EraseApp => {
            ringlog_entry!(Event::EraseRequested);
            reg.write(Signal::Empty);
            BootMode::EraseThenUpdate
        }
        signal @ (Signal::Empty | Signal::Other(_)) => {
            // No pending signal. Arm the register and wait out the window;
            // a reset from here on re-enters the bootloader and takes the
            // TapPending arm above.
            ringlog_entry!(Event::Armed(signal.raw()));
            reg.write(Signal::TapPending);

            let deadline = window.warmup_ms.saturating_add(window.window_ms);
            ticker.start(TICK_PERIOD_MS);
            while ticker.ticks() < deadline {
                core::hint::spin_loop();
            }
            ticker.stop();

            // Fully elapsed. Disarm before returning so a reset racing the
            // boundary resolves to a plain boot, not a phantom double tap.
            reg.write(Signal::Empty);
            ringlog_entry!(Event::WindowElapsed);
            BootMode::Application
        }
    }
}
