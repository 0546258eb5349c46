//! Kernel heap: a first-fit free list with in-band headers.
//!
//! Each block is preceded by a header carrying a magic value, the payload
//! size (multiple of 8), a next pointer in address order, and a free flag.
//! The heap bootstraps from a static page so very early allocations work
//! before paging, then grows by appending VMM-backed regions whenever the
//! tail cannot satisfy a request.
//!
//! The list also backs the crate's `#[global_allocator]`, so `alloc`
//! collections are available everywhere in the kernel.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;

use crate::pmm::FRAME_SIZE;
use crate::vmm;

const HEAP_MAGIC: u32 = 0xBA5A_110C;

/// A block is only split when the remainder can hold a header plus this
/// much payload.
const MIN_SPLIT_PAYLOAD: u64 = 32;

const BOOTSTRAP_SIZE: usize = 4096;

#[repr(C)]
struct HeapNode {
    magic: u32,
    free: u32,
    size: u64,
    next: *mut HeapNode,
}

const HEADER_SIZE: u64 = core::mem::size_of::<HeapNode>() as u64;

#[repr(C, align(4096))]
struct BootstrapArea([u8; BOOTSTRAP_SIZE]);

static mut BOOTSTRAP: BootstrapArea = BootstrapArea([0; BOOTSTRAP_SIZE]);

struct HeapList {
    head: *mut HeapNode,
}

// Safety: the list is only walked under the mutex.
unsafe impl Send for HeapList {}

static HEAP: Mutex<HeapList> = Mutex::new(HeapList {
    head: ptr::null_mut(),
});

unsafe fn init_node(node: *mut HeapNode, size: u64, next: *mut HeapNode) {
    (*node).magic = HEAP_MAGIC;
    (*node).free = 1;
    (*node).size = size;
    (*node).next = next;
}

/// Seeds the free list with the static bootstrap page.
pub fn init() {
    let mut heap = HEAP.lock();
    let head = unsafe { ptr::addr_of_mut!(BOOTSTRAP) as *mut HeapNode };
    unsafe {
        init_node(head, BOOTSTRAP_SIZE as u64 - HEADER_SIZE, ptr::null_mut());
    }
    heap.head = head;
}

/// First-fit allocation. The request is rounded up to 8 bytes; returns
/// null when the heap cannot be grown.
pub fn alloc(size: u64) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }
    let size = (size + 7) & !7;

    let heap = HEAP.lock();
    if heap.head.is_null() {
        return ptr::null_mut();
    }

    let mut curr = heap.head;
    loop {
        unsafe {
            if (*curr).free == 1 && (*curr).size >= size {
                // Split when the tail end is big enough to stand alone.
                if (*curr).size > size + HEADER_SIZE + MIN_SPLIT_PAYLOAD {
                    let remainder =
                        (curr as *mut u8).add((HEADER_SIZE + size) as usize) as *mut HeapNode;
                    init_node(remainder, (*curr).size - size - HEADER_SIZE, (*curr).next);
                    (*curr).size = size;
                    (*curr).next = remainder;
                }
                (*curr).free = 0;
                return (curr as *mut u8).add(HEADER_SIZE as usize);
            }

            if (*curr).next.is_null() {
                // Tail reached without a fit: append a VMM-backed region
                // big enough for this request.
                let pages = (size + HEADER_SIZE + FRAME_SIZE - 1) / FRAME_SIZE;
                let region = match vmm::alloc(
                    pages,
                    PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
                ) {
                    Some(p) => p.as_ptr() as *mut HeapNode,
                    None => return ptr::null_mut(),
                };
                init_node(region, pages * FRAME_SIZE - HEADER_SIZE, ptr::null_mut());
                (*curr).next = region;
            }
            curr = (*curr).next;
        }
    }
}

/// Marks a block free and coalesces. A pointer that was never returned by
/// [`alloc`] fails the magic check and is ignored.
pub fn free(payload: *mut u8) {
    if payload.is_null() {
        return;
    }

    let heap = HEAP.lock();
    let node = unsafe { payload.sub(HEADER_SIZE as usize) } as *mut HeapNode;

    unsafe {
        if (*node).magic != HEAP_MAGIC {
            return;
        }
        (*node).free = 1;

        // Single pass merging free neighbors. List order is address order,
        // but grown regions are not contiguous with the bootstrap page, so
        // only merge blocks that actually touch in memory.
        let mut curr = heap.head;
        while !curr.is_null() {
            let next = (*curr).next;
            if (*curr).free == 1
                && !next.is_null()
                && (*next).free == 1
                && (curr as u64) + HEADER_SIZE + (*curr).size == next as u64
            {
                (*curr).size += HEADER_SIZE + (*next).size;
                (*curr).next = (*next).next;
                continue;
            }
            curr = next;
        }
    }
}

/// Walks the list verifying every header still carries the init magic.
pub fn check_integrity() -> bool {
    let heap = HEAP.lock();
    let mut curr = heap.head;
    while !curr.is_null() {
        unsafe {
            if (*curr).magic != HEAP_MAGIC {
                return false;
            }
            curr = (*curr).next;
        }
    }
    true
}

/// Total free payload bytes currently on the list.
pub fn free_bytes() -> u64 {
    let heap = HEAP.lock();
    let mut total = 0;
    let mut curr = heap.head;
    while !curr.is_null() {
        unsafe {
            if (*curr).free == 1 {
                total += (*curr).size;
            }
            curr = (*curr).next;
        }
    }
    total
}

// ---- global allocator ----

pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(1) as u64;
        if layout.align() <= 8 {
            return alloc(size);
        }
        // Headers only guarantee 8-byte payload alignment. For larger
        // alignments, over-allocate and stash the real block address in
        // the word below the aligned pointer.
        let align = layout.align() as u64;
        let raw = alloc(size + align + 8);
        if raw.is_null() {
            return raw;
        }
        let aligned = (raw as u64 + 8 + align - 1) & !(align - 1);
        *((aligned - 8) as *mut u64) = raw as u64;
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, payload: *mut u8, layout: Layout) {
        if layout.align() <= 8 {
            free(payload);
        } else {
            let raw = *((payload as u64 - 8) as *const u64);
            free(raw as *mut u8);
        }
    }
}

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn first_fit_reuses_freed_block() {
        let a = alloc(24);
        let b = alloc(40);
        assert!(!a.is_null() && !b.is_null());
        assert!(a != b);
        assert_eq!(a as u64 % 8, 0);
        assert_eq!(b as u64 % 8, 0);

        free(a);
        let c = alloc(16);
        // The 16-byte request lands in the freed 24-byte region.
        assert_eq!(c, a);
        assert!(check_integrity());

        free(b);
        free(c);
    }

    #[test_case]
    fn live_blocks_never_overlap() {
        let sizes = [16u64, 48, 8, 96];
        let mut blocks = [(0u64, 0u64); 4];
        for (i, &s) in sizes.iter().enumerate() {
            let p = alloc(s) as u64;
            assert!(p != 0);
            blocks[i] = (p, p + s);
        }
        for i in 0..blocks.len() {
            for j in i + 1..blocks.len() {
                let (a0, a1) = blocks[i];
                let (b0, b1) = blocks[j];
                assert!(a1 <= b0 || b1 <= a0);
            }
        }
        for &(p, _) in &blocks {
            free(p as *mut u8);
        }
        assert!(check_integrity());
    }

    #[test_case]
    fn coalescing_restores_large_blocks() {
        let before = free_bytes();
        let a = alloc(64);
        let b = alloc(64);
        free(a);
        free(b);
        // Both blocks and the split remainder fold back together.
        assert_eq!(free_bytes(), before);

        let big = alloc(256);
        assert!(!big.is_null());
        free(big);
        assert_eq!(free_bytes(), before);
    }

    #[test_case]
    fn foreign_pointer_free_is_ignored() {
        let mut decoy = [0u8; 64];
        let before = free_bytes();
        free(decoy.as_mut_ptr().wrapping_add(32));
        assert_eq!(free_bytes(), before);
        assert!(check_integrity());
    }

    #[test_case]
    fn zero_sized_request_returns_null() {
        assert!(alloc(0).is_null());
    }

    #[test_case]
    fn global_allocator_honors_large_alignment() {
        use ::alloc::boxed::Box;

        #[repr(align(32))]
        struct Wide([u8; 40]);

        let boxed = Box::new(Wide([7; 40]));
        assert_eq!(&*boxed as *const Wide as usize % 32, 0);
        drop(boxed);
        assert!(check_integrity());
    }
}
