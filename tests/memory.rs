//! Memory subsystem tests against the real boot environment: PMM seeded
//! from the loader's map, live page tables, VMM-backed heap growth.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(basalt::testing::test_runner)]
#![reexport_test_harness_main = "test_main"]

use basalt::multiboot::{BootInfo, BOOTLOADER_MAGIC};
use basalt::pmm::{FRAME_SIZE, PMM};
use basalt::{heap, paging, vmm};
use x86_64::structures::paging::PageTableFlags;

#[no_mangle]
pub extern "C" fn kmain(magic: u64, mbi_phys: u64) -> ! {
    assert_eq!(magic, BOOTLOADER_MAGIC);
    let boot_info = unsafe { BootInfo::from_phys(mbi_phys) };
    basalt::init(&boot_info);
    test_main();
    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    basalt::testing::test_panic_handler(info)
}

#[test_case]
fn boot_seeding_is_consistent() {
    let total = PMM.get_total_kb();
    assert!(total > 0);
    assert_eq!(PMM.get_used_kb() + PMM.get_free_kb(), total);
    // The first 2 MiB never shows up as free capacity.
    assert!(PMM.get_free_kb() <= total - 2048);
}

#[test_case]
fn page_allocations_round_trip() {
    let initial_free = PMM.get_free_kb();
    let mut pages = [0u64; 100];
    for slot in pages.iter_mut() {
        let p = PMM.alloc_page().expect("out of frames");
        *slot = p.as_ptr() as u64;
        // Returned pointers are real kernel memory.
        unsafe {
            core::ptr::write_volatile(p.as_ptr(), 0xA5);
            assert_eq!(core::ptr::read_volatile(p.as_ptr()), 0xA5);
        }
    }
    for i in 0..pages.len() {
        for j in i + 1..pages.len() {
            assert!(pages[i] != pages[j]);
        }
    }
    for &p in pages.iter().rev() {
        PMM.free_page(p);
    }
    assert_eq!(PMM.get_free_kb(), initial_free);
}

#[test_case]
fn map_translate_round_trip() {
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    let virt = 0xFFFF_FFFF_D000_0000u64;
    let phys = 0x0100_0000u64;
    paging::map(virt, phys, flags).expect("map failed");

    assert_eq!(paging::translate(virt), Some(phys));
    assert_eq!(paging::translate(virt + 4095), Some(phys + 0xFFF));
    // The neighboring page was never mapped.
    assert_eq!(paging::translate(virt + 4096), None);
}

#[test_case]
fn map_range_covers_every_page() {
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    let virt = 0xFFFF_FFFF_D800_0000u64;
    let phys = 0x0200_0000u64;
    vmm::map_range(virt, phys, 3 * FRAME_SIZE, flags).expect("map_range failed");

    for i in 0..3 {
        assert_eq!(
            vmm::translate(virt + i * FRAME_SIZE),
            Some(phys + i * FRAME_SIZE)
        );
    }
    assert_eq!(vmm::translate(virt + 3 * FRAME_SIZE), None);
}

#[test_case]
fn huge_boot_mapping_translates() {
    // The boot tables map the kernel image with 2 MiB pages; walking a
    // higher-half text address must compose the huge-entry offset.
    let probe = paging::translate as usize as u64;
    assert_eq!(paging::translate(probe), Some(paging::virt_to_phys(probe)));
}

#[test_case]
fn vmm_alloc_is_contiguous_and_writable() {
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    let region = vmm::alloc(4, flags).expect("vmm alloc failed");
    let virt = region.as_ptr() as u64;
    assert!(virt >= vmm::VMM_WINDOW_BASE);

    let phys = vmm::translate(virt).expect("unmapped vmm region");
    for i in 1..4 {
        assert_eq!(vmm::translate(virt + i * FRAME_SIZE), Some(phys + i * FRAME_SIZE));
    }

    unsafe {
        core::ptr::write_bytes(region.as_ptr(), 0xAB, (4 * FRAME_SIZE) as usize);
        assert_eq!(core::ptr::read_volatile(region.as_ptr().add(0x2FFF)), 0xAB);
    }
}

#[test_case]
fn heap_grows_past_the_bootstrap_page() {
    let big = heap::alloc(16 * 1024);
    assert!(!big.is_null());
    unsafe {
        core::ptr::write_bytes(big, 0x5A, 16 * 1024);
        assert_eq!(core::ptr::read_volatile(big.add(16 * 1024 - 1)), 0x5A);
    }
    heap::free(big);
    assert!(heap::check_integrity());
}
