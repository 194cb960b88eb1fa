//! Physical frame allocation seam.
//!
//! The core never builds page tables; it only needs frames for
//! kernel stacks and anonymous user pages, plus the promise that a
//! frame stays valid until freed. The platform installs its
//! allocator once at boot; host tests install a heap-backed double.

use spin::Once;

pub const PAGE_SIZE: usize = 4096;

/// Direct-map offset of the higher half. Frame addresses below this
/// are physical; adding it yields the kernel-visible alias.
pub const HIGH_VMA: usize = 0xFFFF_8000_0000_0000;

pub trait FrameAllocator: Sync {
    /// Allocates `count` contiguous zeroed frames, returning the
    /// physical address of the first, or `None` when exhausted.
    fn alloc_frames(&self, count: usize) -> Option<usize>;

    /// Returns frames obtained from [`alloc_frames`](Self::alloc_frames).
    fn free_frames(&self, addr: usize, count: usize);
}

static FRAME_ALLOCATOR: Once<&'static dyn FrameAllocator> = Once::new();

/// Installs the platform allocator. First caller wins; later calls
/// are ignored (kernel runtime, no teardown).
pub fn install_frame_allocator(alloc: &'static dyn FrameAllocator) {
    FRAME_ALLOCATOR.call_once(|| alloc);
}

/// The installed allocator.
///
/// Panics if called before [`install_frame_allocator`]; scheduling
/// before memory exists is an init-order bug, not a runtime error.
pub fn frame_allocator() -> &'static dyn FrameAllocator {
    *FRAME_ALLOCATOR
        .get()
        .unwrap_or_else(|| panic!("frame allocator not installed"))
}

/// Kernel-visible alias of a physical address.
#[inline]
pub fn phys_to_virt(phys: usize) -> usize {
    #[cfg(feature = "std")]
    {
        // Host doubles hand out heap memory already in our address
        // space; the identity map is the direct map.
        phys
    }
    #[cfg(not(feature = "std"))]
    {
        phys + HIGH_VMA
    }
}

/// Heap-backed allocator for host tests. Frames are leaked; tests
/// are short-lived processes.
#[cfg(feature = "std")]
pub struct TestFrameAllocator;

#[cfg(feature = "std")]
impl FrameAllocator for TestFrameAllocator {
    fn alloc_frames(&self, count: usize) -> Option<usize> {
        let layout = std::alloc::Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).ok()?;
        // SAFETY: layout is non-zero and page-aligned.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() { None } else { Some(ptr as usize) }
    }

    fn free_frames(&self, _addr: usize, _count: usize) {}
}

#[cfg(feature = "std")]
static TEST_FRAMES: TestFrameAllocator = TestFrameAllocator;

/// Installs the host test allocator (idempotent).
#[cfg(feature = "std")]
pub fn install_test_frame_allocator() {
    install_frame_allocator(&TEST_FRAMES);
}
