// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed access to the retained tap register.
//!
//! The tap register is a single machine word that survives a warm reset
//! (battery-backed RAM, an always-on scratch register, or equivalent). It is
//! the only state the bootloader carries from one boot pass to the next, and
//! it is how one pass signals the next one:
//!
//! - The decision engine arms it with [`Signal::TapPending`] while it waits
//!   out the double-tap window; a second reset arriving inside the window
//!   re-enters the bootloader with the value still set.
//! - A running application can arm it with [`Signal::QuickBoot`] before a
//!   deliberate self-reset to skip the double-tap delay on the way back, or
//!   with [`Signal::EraseApp`] to ask the bootloader to erase it.
//!
//! The raw magic values are shared with cooperating agents that write the
//! word without linking this crate, so they are published here as constants.
//! Everything else treats the word through the closed [`Signal`] enumeration;
//! an unrecognized bit pattern decodes to [`Signal::Other`] rather than being
//! silently folded into one of the recognized states.

#![cfg_attr(not(test), no_std)]

/// Raw value the engine stores while it waits for a second tap.
pub const TAP_PENDING_MAGIC: u32 = 0xf016_69ef;

/// Raw value a cooperating agent stores to request an immediate return to
/// the application, skipping the double-tap window.
pub const QUICK_BOOT_MAGIC: u32 = 0xf026_69ef;

/// Raw value a cooperating agent stores to request that the application be
/// erased before update mode is entered.
pub const ERASE_APP_MAGIC: u32 = 0xf5e8_0ab4;

/// Decoded state of the tap register.
///
/// The enumeration is closed: decoding is total, and any word that is not
/// one of the published magic values (including zero) has its own arm.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    /// No signal left by a previous pass. Raw zero.
    Empty,
    /// A cooperating agent asked for a fast boot back into the application.
    QuickBoot,
    /// A previous pass armed the double-tap window and has not cleared it.
    TapPending,
    /// A cooperating agent asked for the application to be erased.
    EraseApp,
    /// Any other bit pattern. Treated as "no signal" by the engine, but the
    /// raw word is preserved so diagnostics can report it.
    Other(u32),
}

impl Signal {
    /// Decodes a raw register word.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Signal::Empty,
            QUICK_BOOT_MAGIC => Signal::QuickBoot,
            TAP_PENDING_MAGIC => Signal::TapPending,
            ERASE_APP_MAGIC => Signal::EraseApp,
            other => Signal::Other(other),
        }
    }

    /// Encodes the signal back to a raw register word. Lossless with respect
    /// to [`Signal::from_raw`].
    pub fn raw(self) -> u32 {
        match self {
            Signal::Empty => 0,
            Signal::QuickBoot => QUICK_BOOT_MAGIC,
            Signal::TapPending => TAP_PENDING_MAGIC,
            Signal::EraseApp => ERASE_APP_MAGIC,
            Signal::Other(other) => other,
        }
    }
}

/// A retained word with tap-register semantics.
///
/// Implementations supply raw word access; the typed [`read`]/[`write`]
/// operations are provided on top. Both must complete synchronously, and the
/// backing storage must be a single word so that an asynchronous reset can
/// never observe a torn value.
///
/// There is no error path. A board whose retained storage is unusable simply
/// does not offer a register, and double-tap detection is disabled upstream.
///
/// [`read`]: TapRegister::read
/// [`write`]: TapRegister::write
pub trait TapRegister {
    /// Reads the raw word.
    fn load(&mut self) -> u32;

    /// Stores a raw word.
    fn store(&mut self, raw: u32);

    /// Reads and decodes the current signal.
    fn read(&mut self) -> Signal {
        Signal::from_raw(self.load())
    }

    /// Encodes and stores a signal.
    fn write(&mut self, signal: Signal) {
        self.store(signal.raw());
    }
}

/// Tap register backed by a raw word in retained memory.
///
/// This covers the common case where the board's retained storage is a
/// memory-mapped cell: an RTC backup register, a word of battery-backed
/// SRAM, or a power-domain scratch register.
pub struct RetainedCell {
    word: *mut u32,
}

impl RetainedCell {
    /// Creates a cell over the word at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be the address of a word that is valid for volatile reads
    /// and writes for the life of the cell, retained across warm resets, and
    /// not accessed through any other path while the cell exists.
    pub const unsafe fn at(addr: usize) -> Self {
        Self {
            word: addr as *mut u32,
        }
    }
}

impl TapRegister for RetainedCell {
    fn load(&mut self) -> u32 {
        // Volatile: the hardware may retain this word across resets in a
        // power domain the compiler knows nothing about.
        unsafe { self.word.read_volatile() }
    }

    fn store(&mut self, raw: u32) {
        unsafe { self.word.write_volatile(raw) }
    }
}

/// Arms a fast return to the application on the next reset.
///
/// Intended for a running application about to perform a deliberate
/// self-reset (for example right after being flashed): the next bootloader
/// pass boots it back immediately instead of waiting out the double-tap
/// window.
pub fn arm_quick_boot<R: TapRegister>(reg: &mut R) {
    reg.write(Signal::QuickBoot);
}

/// Requests update mode on the next reset, as if the user had double-tapped.
pub fn request_update_mode<R: TapRegister>(reg: &mut R) {
    reg.write(Signal::TapPending);
}

/// Requests that the application image be erased and update mode entered on
/// the next reset.
pub fn request_app_erase<R: TapRegister>(reg: &mut R) {
    reg.write(Signal::EraseApp);
}
