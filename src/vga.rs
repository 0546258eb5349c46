use core::fmt::Write;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::port::Port;

use crate::paging::KERNEL_VIRT_OFFSET;

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;
const BUFFER_CELLS: usize = BUFFER_WIDTH * BUFFER_HEIGHT;

/// The text buffer is reached through its higher-half alias; the low
/// identity mapping is gone once the kernel runs in the upper window.
const VGA_BUFFER_ADDR: usize = KERNEL_VIRT_OFFSET as usize + 0xB8000;

const SERIAL_IO_BASE: u16 = 0x3F8;

const CRTC_INDEX: u16 = 0x3D4;
const CRTC_DATA: u16 = 0x3D5;

lazy_static! {
    pub static ref VGA_WRITER: Mutex<VgaWriter> = Mutex::new(VgaWriter::new());
    pub static ref SERIAL: Mutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(SERIAL_IO_BASE) };
        port.init();
        Mutex::new(port)
    };
}

// ---- print plumbing ----

/// Output routing for [`_print`]: console output mirrors to serial so it
/// survives screen clears; log output goes to serial alone.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    Console,
    Serial,
}

/// Shared formatter behind the print macros. One lock scope per sink.
#[doc(hidden)]
pub fn _print(sink: Sink, args: core::fmt::Arguments, newline: bool) {
    if sink == Sink::Console {
        let mut writer = VGA_WRITER.lock();
        let _ = writer.write_fmt(args);
        if newline {
            writer.put_char('\n');
        }
    }
    let mut serial = SERIAL.lock();
    let _ = serial.write_fmt(args);
    if newline {
        let _ = serial.write_str("\n");
    }
}

#[macro_export]
macro_rules! vprint {
    ($($arg:tt)*) => ($crate::vga::_print($crate::vga::Sink::Console, format_args!($($arg)*), false));
}
#[macro_export]
macro_rules! vprintln {
    () => ($crate::vga::_print($crate::vga::Sink::Console, format_args!(""), true));
    ($($arg:tt)*) => ($crate::vga::_print($crate::vga::Sink::Console, format_args!($($arg)*), true));
}
#[macro_export]
macro_rules! sprint {
    ($($arg:tt)*) => ($crate::vga::_print($crate::vga::Sink::Serial, format_args!($($arg)*), false));
}
#[macro_export]
macro_rules! sprintln {
    () => ($crate::vga::_print($crate::vga::Sink::Serial, format_args!(""), true));
    ($($arg:tt)*) => ($crate::vga::_print($crate::vga::Sink::Serial, format_args!($($arg)*), true));
}

// ---- Hardware cursor (CRTC registers) ----

/// Hides the blinking hardware cursor by setting bit 5 of the
/// Cursor Start register (index 0x0A).
pub fn hide_hardware_cursor() {
    unsafe {
        let mut idx = Port::<u8>::new(CRTC_INDEX);
        let mut data = Port::<u8>::new(CRTC_DATA);
        idx.write(0x0A);
        let cur = data.read();
        idx.write(0x0A);
        data.write(cur | 0x20);
    }
}

/// Re-enables hardware cursor rendering at the current position.
pub fn show_hardware_cursor() {
    unsafe {
        let mut idx = Port::<u8>::new(CRTC_INDEX);
        let mut data = Port::<u8>::new(CRTC_DATA);
        idx.write(0x0A);
        let cur = data.read();
        idx.write(0x0A);
        data.write(cur & !0x20);
    }
}

fn read_cursor_pos() -> u16 {
    unsafe {
        let mut idx = Port::<u8>::new(CRTC_INDEX);
        let mut data = Port::<u8>::new(CRTC_DATA);
        idx.write(0x0F);
        let mut pos = data.read() as u16;
        idx.write(0x0E);
        pos |= (data.read() as u16) << 8;
        pos
    }
}

pub fn get_cursor_x() -> usize {
    read_cursor_pos() as usize % BUFFER_WIDTH
}

pub fn get_cursor_y() -> usize {
    read_cursor_pos() as usize / BUFFER_WIDTH
}

pub fn set_cursor(x: usize, y: usize) {
    let pos = (y * BUFFER_WIDTH + x) as u16;
    unsafe {
        let mut idx = Port::<u8>::new(CRTC_INDEX);
        let mut data = Port::<u8>::new(CRTC_DATA);
        idx.write(0x0F);
        data.write((pos & 0xFF) as u8);
        idx.write(0x0E);
        data.write((pos >> 8) as u8);
    }
}

// ---- VGA Writer ----

/// Writes to the 80x25 text buffer, one u16 cell (attribute byte in the
/// high half) per character.
pub struct VgaWriter {
    column: usize,
    row: usize,
    color: u8,
    buffer: *mut u16,
}

// Safety: VgaWriter writes directly to a memory-mapped buffer.
// Only one global instance exists, behind VGA_WRITER.
unsafe impl Send for VgaWriter {}
unsafe impl Sync for VgaWriter {}

impl VgaWriter {
    pub const fn new() -> Self {
        Self {
            column: 0,
            row: 0,
            color: 0x0f,
            buffer: VGA_BUFFER_ADDR as *mut u16,
        }
    }

    /// A full cell for `ch` in the current color.
    fn cell(&self, ch: u8) -> u16 {
        (self.color as u16) << 8 | ch as u16
    }

    /// The whole buffer as one cell slice, for bulk scroll/clear moves.
    fn cells(&mut self) -> &mut [u16] {
        unsafe { core::slice::from_raw_parts_mut(self.buffer, BUFFER_CELLS) }
    }

    pub fn put_char(&mut self, c: char) {
        match c {
            '\n' => self.new_line(),
            '\r' => self.column = 0,
            _ => {
                if self.column >= BUFFER_WIDTH {
                    self.new_line();
                }
                let idx = self.row * BUFFER_WIDTH + self.column;
                let cell = self.cell(c as u8);
                unsafe {
                    core::ptr::write_volatile(self.buffer.add(idx), cell);
                }
                self.column += 1;
            }
        }
        self.sync_cursor();
    }

    fn new_line(&mut self) {
        self.column = 0;
        if self.row + 1 < BUFFER_HEIGHT {
            self.row += 1;
            return;
        }
        // At the bottom: shift everything up one row, blank the last.
        let blank = self.cell(b' ');
        let cells = self.cells();
        cells.copy_within(BUFFER_WIDTH.., 0);
        cells[BUFFER_CELLS - BUFFER_WIDTH..].fill(blank);
    }

    pub fn clear_screen(&mut self) {
        let blank = self.cell(b' ');
        self.cells().fill(blank);
        self.row = 0;
        self.column = 0;
        self.sync_cursor();
    }

    /// Repositions where the next character lands. Rows and columns are
    /// clamped to the buffer.
    pub fn set_position(&mut self, x: usize, y: usize) {
        self.column = x.min(BUFFER_WIDTH - 1);
        self.row = y.min(BUFFER_HEIGHT - 1);
        self.sync_cursor();
    }

    /// Keeps the CRTC cursor registers in step with the software position,
    /// so the shell can read coordinates back through the ports.
    fn sync_cursor(&self) {
        set_cursor(self.column, self.row);
    }
}

impl core::fmt::Write for VgaWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for c in s.chars() {
            self.put_char(c);
        }
        Ok(())
    }
}
