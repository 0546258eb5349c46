//! QEMU isa-debug-exit device, used by the test harness to report results.
//!
//! Requires `-device isa-debug-exit,iobase=0xf4,iosize=0x04` on the QEMU
//! command line; the written value v becomes host exit code (v << 1) | 1.

use x86_64::instructions::port::Port;

const QEMU_EXIT_PORT: u16 = 0xF4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

pub fn exit_qemu(exit_code: QemuExitCode) -> ! {
    unsafe {
        let mut port = Port::<u8>::new(QEMU_EXIT_PORT);
        port.write(exit_code as u8);
    }

    // Not running under QEMU with the exit device: nothing left to do.
    loop {
        x86_64::instructions::hlt();
    }
}
