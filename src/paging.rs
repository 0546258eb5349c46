//! 4-level page table maintenance.
//!
//! Every physical frame the walker touches is reached through the
//! higher-half identity window, so table manipulation never depends on a
//! low identity mapping. Intermediate tables are allocated on demand from
//! the PMM and never freed.

use core::ptr;
use spin::Mutex;
use x86_64::instructions::tlb;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

use crate::pmm::{FRAME_SIZE, PMM};

/// Fixed delta between physical addresses and their kernel-visible alias.
/// Must match the boot assembly and the linker script.
pub const KERNEL_VIRT_OFFSET: u64 = 0xFFFF_FFFF_8000_0000;

pub fn phys_to_virt(phys: u64) -> *mut u8 {
    (phys + KERNEL_VIRT_OFFSET) as *mut u8
}

pub fn virt_to_phys(virt: u64) -> u64 {
    virt - KERNEL_VIRT_OFFSET
}

extern "C" {
    /// Top-level table set up by the boot assembly, linked in the higher half.
    static p4_table: u8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The PMM could not supply a frame for an intermediate table.
    OutOfFrames,
}

static PAGING_LOCK: Mutex<()> = Mutex::new(());

/// Points CR3 at the boot-provided PML4. Halts if the symbol is somehow
/// missing; nothing can run without a root table.
pub fn init() {
    let pml4_virt = unsafe { ptr::addr_of!(p4_table) as u64 };
    if pml4_virt == 0 {
        log::error!("no PML4 present, halting");
        loop {
            core::hint::spin_loop();
        }
    }
    let pml4_phys = virt_to_phys(pml4_virt);
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(pml4_phys)),
            Cr3Flags::empty(),
        );
    }
}

fn active_pml4() -> *mut PageTable {
    let (frame, _) = Cr3::read();
    phys_to_virt(frame.start_address().as_u64()) as *mut PageTable
}

/// Maps one 4 KiB page. Missing intermediate levels are created with
/// present|writable|user so the leaf flags alone decide access.
pub fn map(virt: u64, phys: u64, flags: PageTableFlags) -> Result<(), MapError> {
    let _g = PAGING_LOCK.lock();

    let addr = VirtAddr::new(virt);
    let mut table = unsafe { &mut *active_pml4() };

    for index in [addr.p4_index(), addr.p3_index(), addr.p2_index()] {
        let entry = &mut table[index];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            let fresh = PMM.alloc_page().ok_or(MapError::OutOfFrames)?;
            unsafe {
                ptr::write_bytes(fresh.as_ptr(), 0, FRAME_SIZE as usize);
            }
            let fresh_phys = virt_to_phys(fresh.as_ptr() as u64);
            entry.set_addr(
                PhysAddr::new(fresh_phys),
                PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
            );
        }
        let next = entry.addr().as_u64();
        table = unsafe { &mut *(phys_to_virt(next) as *mut PageTable) };
    }

    table[addr.p1_index()].set_addr(PhysAddr::new(phys), flags);
    tlb::flush(addr);
    Ok(())
}

/// Maps `size` bytes page by page.
pub fn map_range(virt: u64, phys: u64, size: u64, flags: PageTableFlags) -> Result<(), MapError> {
    let mut offset = 0;
    while offset < size {
        map(virt + offset, phys + offset, flags)?;
        offset += FRAME_SIZE;
    }
    Ok(())
}

/// Walks the active tables without modifying them. Honors 1 GiB and
/// 2 MiB huge entries; returns None at the first non-present level.
pub fn translate(virt: u64) -> Option<u64> {
    let addr = VirtAddr::new(virt);
    let pml4 = unsafe { &*active_pml4() };

    let entry = &pml4[addr.p4_index()];
    if !entry.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    let pdpt = unsafe { &*(phys_to_virt(entry.addr().as_u64()) as *const PageTable) };

    let entry = &pdpt[addr.p3_index()];
    if !entry.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
        return Some(entry.addr().as_u64() + (virt & 0x3FFF_FFFF));
    }
    let pd = unsafe { &*(phys_to_virt(entry.addr().as_u64()) as *const PageTable) };

    let entry = &pd[addr.p2_index()];
    if !entry.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
        return Some(entry.addr().as_u64() + (virt & 0x1F_FFFF));
    }
    let pt = unsafe { &*(phys_to_virt(entry.addr().as_u64()) as *const PageTable) };

    let entry = &pt[addr.p1_index()];
    if !entry.flags().contains(PageTableFlags::PRESENT) {
        return None;
    }
    Some(entry.addr().as_u64() + (virt & 0xFFF))
}
