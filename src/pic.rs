//! Legacy 8259 PIC pair.
//!
//! The power-on vector ranges collide with CPU exceptions, so init remaps
//! IRQ0..15 to vectors 0x20..0x2F. All port traffic to the pair goes
//! through one lock; task-context callers additionally mask interrupts for
//! the duration so the EOI path in IRQ handlers can never spin against them.

use spin::Mutex;
use x86_64::instructions::interrupts;
use x86_64::instructions::port::Port;

pub const PIC1_COMMAND: u16 = 0x20;
pub const PIC1_DATA: u16 = 0x21;
pub const PIC2_COMMAND: u16 = 0xA0;
pub const PIC2_DATA: u16 = 0xA1;

/// Vector base after remapping: master 0x20..0x27, slave 0x28..0x2F.
pub const PIC1_VECTOR_OFFSET: u8 = 0x20;
pub const PIC2_VECTOR_OFFSET: u8 = 0x28;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;
const PIC_EOI: u8 = 0x20;

static PIC_LOCK: Mutex<()> = Mutex::new(());

/// The 8259 needs a moment between initialization words.
fn io_delay() {
    for _ in 0..1000 {
        core::hint::spin_loop();
    }
}

fn remap(offset1: u8, offset2: u8) {
    let _g = PIC_LOCK.lock();
    unsafe {
        let mut cmd1 = Port::<u8>::new(PIC1_COMMAND);
        let mut cmd2 = Port::<u8>::new(PIC2_COMMAND);
        let mut data1 = Port::<u8>::new(PIC1_DATA);
        let mut data2 = Port::<u8>::new(PIC2_DATA);

        // save current masks
        let mask1 = data1.read();
        let mask2 = data2.read();

        // start the init sequence on both chips
        cmd1.write(ICW1_INIT | ICW1_ICW4);
        io_delay();
        cmd2.write(ICW1_INIT | ICW1_ICW4);
        io_delay();

        // vector offsets
        data1.write(offset1);
        io_delay();
        data2.write(offset2);
        io_delay();

        // master: slave on IRQ2; slave: cascade identity 2
        data1.write(4);
        io_delay();
        data2.write(2);
        io_delay();

        // 8086 mode
        data1.write(ICW4_8086);
        io_delay();
        data2.write(ICW4_8086);
        io_delay();

        // restore masks
        data1.write(mask1);
        data2.write(mask2);
    }
}

/// Remaps the pair and masks every line; drivers unmask what they own.
pub fn init() {
    interrupts::without_interrupts(|| {
        remap(PIC1_VECTOR_OFFSET, PIC2_VECTOR_OFFSET);
        mask_all();
    });
}

/// Acknowledges `irq`; lines on the slave need an EOI on both chips.
pub fn send_eoi(irq: u8) {
    let _g = PIC_LOCK.lock();
    unsafe {
        if irq >= 8 {
            Port::<u8>::new(PIC2_COMMAND).write(PIC_EOI);
        }
        Port::<u8>::new(PIC1_COMMAND).write(PIC_EOI);
    }
}

fn mask_port(irq: u8) -> (u16, u8) {
    if irq < 8 {
        (PIC1_DATA, irq)
    } else {
        (PIC2_DATA, irq - 8)
    }
}

/// Clears the mask bit for one IRQ line.
pub fn enable_irq(irq: u8) {
    interrupts::without_interrupts(|| {
        let _g = PIC_LOCK.lock();
        let (port, bit) = mask_port(irq);
        unsafe {
            let mut data = Port::<u8>::new(port);
            let value = data.read() & !(1 << bit);
            data.write(value);
        }
    });
}

/// Sets the mask bit for one IRQ line.
pub fn disable_irq(irq: u8) {
    interrupts::without_interrupts(|| {
        let _g = PIC_LOCK.lock();
        let (port, bit) = mask_port(irq);
        unsafe {
            let mut data = Port::<u8>::new(port);
            let value = data.read() | (1 << bit);
            data.write(value);
        }
    });
}

fn mask_all() {
    let _g = PIC_LOCK.lock();
    unsafe {
        Port::<u8>::new(PIC1_DATA).write(0xFF);
        Port::<u8>::new(PIC2_DATA).write(0xFF);
    }
}

/// Combined Interrupt Request Register of both chips, slave in the high byte.
pub fn read_irr() -> u16 {
    read_reg(0x0A)
}

/// Combined In-Service Register of both chips, slave in the high byte.
pub fn read_isr() -> u16 {
    read_reg(0x0B)
}

fn read_reg(ocw3: u8) -> u16 {
    interrupts::without_interrupts(|| {
        let _g = PIC_LOCK.lock();
        unsafe {
            let mut cmd1 = Port::<u8>::new(PIC1_COMMAND);
            let mut cmd2 = Port::<u8>::new(PIC2_COMMAND);
            cmd1.write(ocw3);
            let mut value = cmd1.read() as u16;
            cmd2.write(ocw3);
            value |= (cmd2.read() as u16) << 8;
            value
        }
    })
}
