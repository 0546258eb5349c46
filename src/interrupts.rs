//! IDT setup and interrupt service routines.
//!
//! Every hardware vector gets at least a stub that acknowledges the PIC,
//! so a stray line can never wedge the controller. The timer and keyboard
//! vectors get real handlers; page faults are terminal in this kernel.

use lazy_static::lazy_static;
use x86_64::instructions::interrupts;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::keyboard;
use crate::pic;
use crate::pit;
use crate::vprintln;

pub const TIMER_VECTOR: u8 = pic::PIC1_VECTOR_OFFSET;
pub const KEYBOARD_VECTOR: u8 = pic::PIC1_VECTOR_OFFSET + 1;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_handler);
        idt.double_fault.set_handler_fn(double_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);

        for vector in 32..256usize {
            idt[vector].set_handler_fn(spurious_handler);
        }
        idt[TIMER_VECTOR as usize].set_handler_fn(timer_handler);
        idt[KEYBOARD_VECTOR as usize].set_handler_fn(keyboard_handler);

        idt
    };
}

pub fn init() {
    IDT.load();
}

pub fn enable() {
    interrupts::enable();
}

pub fn disable() {
    interrupts::disable();
}

pub fn are_enabled() -> bool {
    interrupts::are_enabled()
}

extern "x86-interrupt" fn timer_handler(_frame: InterruptStackFrame) {
    pit::on_tick();
    pic::send_eoi(0);
}

extern "x86-interrupt" fn keyboard_handler(_frame: InterruptStackFrame) {
    // handle_irq sends its own EOI after draining the controller.
    keyboard::handle_irq();
}

/// Catch-all for vectors nothing claimed.
extern "x86-interrupt" fn spurious_handler(_frame: InterruptStackFrame) {
    pic::send_eoi(0);
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::warn!("breakpoint at {:?}", frame.instruction_pointer);
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    panic!("invalid opcode at {:?}", frame.instruction_pointer);
}

extern "x86-interrupt" fn general_protection_handler(frame: InterruptStackFrame, error_code: u64) {
    panic!(
        "general protection fault ({:#x}) at {:?}",
        error_code, frame.instruction_pointer
    );
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, _error_code: u64) -> ! {
    panic!("double fault\n{:#?}", frame);
}

/// Page faults are not recoverable here: report and stop.
extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let address = Cr2::read();
    vprintln!(
        "PAGE FAULT at {:?} (error {:?}), rip {:?}",
        address,
        error_code,
        frame.instruction_pointer
    );
    loop {
        core::hint::spin_loop();
    }
}
