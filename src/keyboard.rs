//! PS/2 keyboard driver.
//!
//! The IRQ1 handler translates set-1 scan codes into signed key bytes and
//! deposits them in a one-slot mailbox (0 = empty). The slot is only
//! written when the consumer has drained it, so bursts are lossy by
//! design. Arrow keys and editing keys become sentinel codes the shell
//! understands; everything else goes through the base/shift tables.

use core::sync::atomic::{AtomicBool, AtomicI8, Ordering};
use x86_64::instructions::hlt;
use x86_64::instructions::port::Port;

use crate::pic;
use crate::task;

const STATUS_PORT: u16 = 0x64;
const DATA_PORT: u16 = 0x60;

/// Status register bit 0: output buffer full.
const STATUS_OUT_FULL: u8 = 0x01;
/// Status register bit 5: data came from the auxiliary (mouse) port.
const STATUS_AUX: u8 = 0x20;

const IRQ_KEYBOARD: u8 = 1;

pub const KEY_BACKSPACE: i8 = 8;
pub const KEY_ENTER: i8 = 10;
pub const KEY_ARROW_LEFT: i8 = -1;
pub const KEY_ARROW_RIGHT: i8 = -2;

/// US-QWERTY set 1, unshifted. Index = make code; 0 = no translation.
const BASE_MAP: [i8; 58] = [
    0, 27, b'1' as i8, b'2' as i8, b'3' as i8, b'4' as i8, b'5' as i8, b'6' as i8, b'7' as i8,
    b'8' as i8, b'9' as i8, b'0' as i8, b'-' as i8, b'=' as i8, 8, 9, b'q' as i8, b'w' as i8,
    b'e' as i8, b'r' as i8, b't' as i8, b'y' as i8, b'u' as i8, b'i' as i8, b'o' as i8, b'p' as i8,
    b'[' as i8, b']' as i8, 10, 0, b'a' as i8, b's' as i8, b'd' as i8, b'f' as i8, b'g' as i8,
    b'h' as i8, b'j' as i8, b'k' as i8, b'l' as i8, b';' as i8, b'\'' as i8, b'`' as i8, 0,
    b'\\' as i8, b'z' as i8, b'x' as i8, b'c' as i8, b'v' as i8, b'b' as i8, b'n' as i8, b'm' as i8,
    b',' as i8, b'.' as i8, b'/' as i8, 0, b'*' as i8, 0, b' ' as i8,
];

/// US-QWERTY set 1 with shift held.
const SHIFT_MAP: [i8; 58] = [
    0, 27, b'!' as i8, b'@' as i8, b'#' as i8, b'$' as i8, b'%' as i8, b'^' as i8, b'&' as i8,
    b'*' as i8, b'(' as i8, b')' as i8, b'_' as i8, b'+' as i8, 8, 9, b'Q' as i8, b'W' as i8,
    b'E' as i8, b'R' as i8, b'T' as i8, b'Y' as i8, b'U' as i8, b'I' as i8, b'O' as i8, b'P' as i8,
    b'{' as i8, b'}' as i8, 10, 0, b'A' as i8, b'S' as i8, b'D' as i8, b'F' as i8, b'G' as i8,
    b'H' as i8, b'J' as i8, b'K' as i8, b'L' as i8, b':' as i8, b'"' as i8, b'~' as i8, 0,
    b'|' as i8, b'Z' as i8, b'X' as i8, b'C' as i8, b'V' as i8, b'B' as i8, b'N' as i8, b'M' as i8,
    b'<' as i8, b'>' as i8, b'?' as i8, 0, b'*' as i8, 0, b' ' as i8,
];

static SHIFT_PRESSED: AtomicBool = AtomicBool::new(false);
static SYSTEM_READY: AtomicBool = AtomicBool::new(false);

/// Single-slot mailbox between the ISR and the consumer task. 0 = empty.
static MAILBOX: AtomicI8 = AtomicI8::new(0);

/// Drains stale bytes from the controller and unmasks IRQ1.
pub fn init() {
    unsafe {
        let mut status = Port::<u8>::new(STATUS_PORT);
        let mut data = Port::<u8>::new(DATA_PORT);
        while status.read() & STATUS_OUT_FULL != 0 {
            let _ = data.read();
        }
    }
    pic::enable_irq(IRQ_KEYBOARD);
}

/// Keys are only delivered once the consumer side is up.
pub fn set_system_ready(ready: bool) {
    SYSTEM_READY.store(ready, Ordering::SeqCst);
}

/// Looks up a make code in the translation tables.
fn translate(scancode: u8, shift: bool) -> Option<i8> {
    let table = if shift { &SHIFT_MAP } else { &BASE_MAP };
    match table.get(scancode as usize) {
        Some(&key) if key != 0 => Some(key),
        _ => None,
    }
}

/// Full scan-code state machine: shift tracking, sentinel keys, table
/// lookup, mailbox deposit. Shared by the IRQ handler and by tests that
/// inject synthetic codes.
pub fn process_scancode(scancode: u8) {
    match scancode {
        0x2A | 0x36 => {
            SHIFT_PRESSED.store(true, Ordering::SeqCst);
            return;
        }
        0xAA | 0xB6 => {
            SHIFT_PRESSED.store(false, Ordering::SeqCst);
            return;
        }
        _ => {}
    }

    // Break codes never produce a key.
    if scancode & 0x80 != 0 {
        return;
    }

    let key = match scancode {
        0x0E => Some(KEY_BACKSPACE),
        0x1C => Some(KEY_ENTER),
        0x4B => Some(KEY_ARROW_LEFT),
        0x4D => Some(KEY_ARROW_RIGHT),
        _ => translate(scancode, SHIFT_PRESSED.load(Ordering::SeqCst)),
    };

    if let Some(key) = key {
        deposit(key);
    }
}

/// Writes the slot only when the system is up and the slot is empty;
/// a still-pending key wins over the newcomer.
fn deposit(key: i8) {
    if SYSTEM_READY.load(Ordering::SeqCst) {
        let _ = MAILBOX.compare_exchange(0, key, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// IRQ1 entry: gated on the status register so mouse bytes and empty
/// buffers are ignored. Sends its own EOI.
pub fn handle_irq() {
    unsafe {
        let mut status_port = Port::<u8>::new(STATUS_PORT);
        let status = status_port.read();
        if status & STATUS_OUT_FULL != 0 && status & STATUS_AUX == 0 {
            let scancode = Port::<u8>::new(DATA_PORT).read();
            process_scancode(scancode);
        }
    }
    pic::send_eoi(IRQ_KEYBOARD);
}

/// Non-blocking read from the mailbox; clears the slot.
pub fn poll_key() -> Option<i8> {
    match MAILBOX.swap(0, Ordering::SeqCst) {
        0 => None,
        key => Some(key),
    }
}

/// Task-context read that parks on `hlt` between polls so the CPU sleeps
/// until the next interrupt.
pub fn wait_for_key() -> i8 {
    loop {
        if let Some(key) = poll_key() {
            return key;
        }
        task::task_yield();
        hlt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset() {
        SHIFT_PRESSED.store(false, Ordering::SeqCst);
        SYSTEM_READY.store(true, Ordering::SeqCst);
        MAILBOX.store(0, Ordering::SeqCst);
    }

    #[test_case]
    fn shift_cycle_produces_both_cases() {
        reset();
        // shift down, 'a' key, shift up, 'a' key
        process_scancode(0x2A);
        process_scancode(0x1E);
        assert_eq!(poll_key(), Some(b'A' as i8));
        process_scancode(0xAA);
        process_scancode(0x1E);
        assert_eq!(poll_key(), Some(b'a' as i8));
    }

    #[test_case]
    fn arrow_keys_are_sentinels() {
        reset();
        process_scancode(0x4B);
        assert_eq!(poll_key(), Some(KEY_ARROW_LEFT));
        process_scancode(0x4D);
        assert_eq!(poll_key(), Some(KEY_ARROW_RIGHT));
    }

    #[test_case]
    fn release_codes_never_enqueue() {
        reset();
        process_scancode(0x9E); // 'a' break
        assert_eq!(poll_key(), None);
    }

    #[test_case]
    fn mailbox_keeps_first_key_under_burst() {
        reset();
        process_scancode(0x1E); // 'a'
        process_scancode(0x30); // 'b' arrives before the consumer reads
        assert_eq!(poll_key(), Some(b'a' as i8));
        assert_eq!(poll_key(), None);
    }

    #[test_case]
    fn not_ready_drops_keys() {
        reset();
        SYSTEM_READY.store(false, Ordering::SeqCst);
        process_scancode(0x1E);
        assert_eq!(poll_key(), None);
    }

    #[test_case]
    fn table_translation_matches_layout() {
        assert_eq!(translate(0x10, false), Some(b'q' as i8));
        assert_eq!(translate(0x10, true), Some(b'Q' as i8));
        assert_eq!(translate(0x02, true), Some(b'!' as i8));
        // 0x1D is left ctrl: no printable translation
        assert_eq!(translate(0x1D, false), None);
    }
}
