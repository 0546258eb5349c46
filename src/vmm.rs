//! Virtual memory manager.
//!
//! A thin layer over paging plus a coarse virtual range allocator: a
//! monotonic bump cursor over a dedicated kernel window. Ranges are never
//! reclaimed; the window is large enough to outlive any realistic boot.

use core::ptr::NonNull;
use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;

use crate::paging::{self, virt_to_phys, MapError};
use crate::pmm::{FRAME_SIZE, PMM};

/// Start of the kernel window handed out by [`alloc`].
pub const VMM_WINDOW_BASE: u64 = 0xFFFF_FFFF_C000_0000;

static NEXT_VIRT: Mutex<u64> = Mutex::new(VMM_WINDOW_BASE);

pub fn init() {
    paging::init();
}

pub fn map(virt: u64, phys: u64, flags: PageTableFlags) -> Result<(), MapError> {
    paging::map(virt, phys, flags)
}

pub fn map_range(virt: u64, phys: u64, size: u64, flags: PageTableFlags) -> Result<(), MapError> {
    paging::map_range(virt, phys, size, flags)
}

/// Backs `pages` of fresh virtual address space with physically contiguous
/// frames and maps them with `flags`. Returns the start of the range, or
/// None when physical memory is exhausted.
pub fn alloc(pages: u64, flags: PageTableFlags) -> Option<NonNull<u8>> {
    let backing = PMM.alloc_pages(pages)?;
    let phys = virt_to_phys(backing.as_ptr() as u64);

    let mut cursor = NEXT_VIRT.lock();
    let start = *cursor;
    for i in 0..pages {
        if paging::map(start + i * FRAME_SIZE, phys + i * FRAME_SIZE, flags).is_err() {
            // Give the data frames back; partially created page tables stay.
            for f in 0..pages {
                PMM.free_page(phys + f * FRAME_SIZE);
            }
            return None;
        }
    }
    *cursor += pages * FRAME_SIZE;

    NonNull::new(start as *mut u8)
}

/// Resolves a kernel virtual address to its physical backing.
pub fn translate(virt: u64) -> Option<u64> {
    paging::translate(virt)
}
