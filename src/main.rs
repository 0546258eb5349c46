#![no_std]
#![no_main]
#![cfg_attr(test, feature(custom_test_frameworks))]
#![cfg_attr(test, test_runner(basalt::testing::test_runner))]
#![cfg_attr(test, reexport_test_harness_main = "test_main")]

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicU64, Ordering};

use basalt::multiboot::{BootInfo, BOOTLOADER_MAGIC};
use basalt::vga::VGA_WRITER;
use basalt::{interrupts, keyboard, logging, pic, pit, shell, task, vprintln};

/// Entry from the boot assembly, already running in the higher half with
/// interrupts off. `mbi_phys` is the physical address of the Multiboot2
/// info structure.
#[no_mangle]
pub extern "C" fn kmain(magic: u64, mbi_phys: u64) -> ! {
    VGA_WRITER.lock().clear_screen();
    vprintln!("=== basalt kernel ===");
    vprintln!();

    if magic != BOOTLOADER_MAGIC {
        vprintln!("bad bootloader magic {:#x}, refusing to boot", magic);
        loop {
            core::hint::spin_loop();
        }
    }

    logging::init();

    let boot_info = unsafe { BootInfo::from_phys(mbi_phys) };
    basalt::init(&boot_info);

    pit::init(pit::TIMER_HZ);
    pic::enable_irq(0);
    keyboard::init();

    /// Background task exercising create/yield; its counter shows up in
    /// the trace log.
    extern "C" fn heartbeat_task() {
        static BEATS: AtomicU64 = AtomicU64::new(0);
        loop {
            let n = BEATS.fetch_add(1, Ordering::Relaxed);
            if n % 100_000 == 0 {
                log::trace!("heartbeat {}", n);
            }
            task::task_yield();
        }
    }

    if task::spawn(shell::shell_task, "shell").is_none() {
        vprintln!("failed to start shell task");
    }
    if task::spawn(heartbeat_task, "heartbeat").is_none() {
        vprintln!("failed to start heartbeat task");
    }

    keyboard::set_system_ready(true);
    interrupts::enable();

    log::info!("boot complete, {} ticks/s", pit::TIMER_HZ);

    #[cfg(test)]
    test_main();

    // The boot thread is the idle path: hand the CPU to the tasks and
    // sleep until the next interrupt whenever control comes back.
    loop {
        task::task_yield();
        x86_64::instructions::hlt();
    }
}

/// Boot smoke test for `cargo test --bin`: by the time the harness runs,
/// the memory managers must be live.
#[cfg(test)]
#[test_case]
fn boot_brings_up_memory() {
    use basalt::pmm::PMM;
    assert!(PMM.get_total_kb() > 0);
    assert!(basalt::heap::check_integrity());
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    vprintln!("KERNEL PANIC: {}", info);
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    basalt::testing::test_panic_handler(info)
}
