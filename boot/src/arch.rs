// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cortex-M transfer of control.
//!
//! Boards build their [`Board::jump_to_application`] on this: point it at
//! the application's vector table and do not come back. Relocating the
//! vector table offset register, if the part needs it, is the board's job
//! before calling in here.
//!
//! [`Board::jump_to_application`]: crate::Board::jump_to_application

use cortex_m::interrupt;

/// Hands the core to the image whose vector table is at `vector_table`:
/// loads the main stack pointer from the table's first word and branches to
/// the reset vector in its second.
///
/// Interrupts are disabled first and stay disabled; the application's own
/// startup re-enables what it wants.
///
/// # Safety
///
/// `vector_table` must point to a valid vector table for an image that is
/// actually present; the first two words are loaded as SP and PC with no
/// further checking.
pub unsafe fn jump_to_image(vector_table: *const u32) -> ! {
    interrupt::disable();
    cortex_m::asm::bootload(vector_table)
}
