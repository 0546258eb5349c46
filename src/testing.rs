//! Bare-metal test framework.
//!
//! Tests run inside QEMU and report over the serial port. Integration test
//! binaries in `tests/` enable the custom framework and route their entry
//! point here:
//!
//! ```ignore
//! #![feature(custom_test_frameworks)]
//! #![test_runner(basalt::testing::test_runner)]
//! #![reexport_test_harness_main = "test_main"]
//! ```
//!
//! Functions marked `#[test_case]` are collected by the compiler and passed
//! to [`test_runner`]; call `test_main()` once the required subsystems are up.

use crate::qemu::{exit_qemu, QemuExitCode};
use crate::{sprint, sprintln};

pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        sprint!("{}...", core::any::type_name::<T>());
        self();
        sprintln!(" [ok]");
    }
}

pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    sprintln!("running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    sprintln!("all {} tests passed", tests.len());
    exit_qemu(QemuExitCode::Success)
}

/// Panic path for test builds: report the failure and exit QEMU.
pub fn test_panic_handler(info: &core::panic::PanicInfo) -> ! {
    sprintln!(" [FAILED]");
    sprintln!("{}", info);
    exit_qemu(QemuExitCode::Failed)
}
