//! Address-space ledger.
//!
//! Page-table hardware format, fault handling and file-backed mmap
//! belong to the external memory manager. What the core owns is the
//! accounting its invariants depend on: which user pages a task
//! maps, and a shared reference count per physical page so that
//! copy-on-write forks free a frame only on the last release.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use vos_error::define_kernel_error;
use vos_hal::memory::{self, PAGE_SIZE};
use vos_utils::HashMap;

use crate::arch;

bitflags::bitflags! {
    /// Page protection, mirrored into the hardware tables by the VMM.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
    }
}

define_kernel_error! {
    pub enum VmError(0x01) {
        OutOfFrames = 0x01 => "out of physical frames",
        Unmapped = 0x02 => "address not mapped",
        BadRange = 0x03 => "bad user range",
    }
}

/// One mapped user page. `reference` is shared with every address
/// space that inherited the page over fork.
#[derive(Clone)]
pub struct Page {
    pub vaddr: u64,
    pub paddr: usize,
    pub prot: Prot,
    pub reference: Arc<AtomicUsize>,
}

/// Highest address handed out by anonymous mappings; allocation
/// walks down from here.
const MMAP_TOP: u64 = 0x0000_7FFF_FFFF_0000;

pub struct AddressSpace {
    /// Physical address of the top-level table (CR3 payload).
    root: usize,
    pages: HashMap<u64, Page>,
    mmap_cursor: u64,
}

impl AddressSpace {
    /// Fresh address space with the kernel half premapped by the VMM.
    pub fn new() -> Result<Self, VmError> {
        let root = memory::frame_allocator()
            .alloc_frames(1)
            .ok_or(VmError::OutOfFrames)?;
        Ok(Self {
            root,
            pages: HashMap::new(),
            mmap_cursor: MMAP_TOP,
        })
    }

    pub fn root(&self) -> usize {
        self.root
    }

    /// Activates this space on the calling core.
    pub fn load(&self) {
        // SAFETY: root was allocated by `new` and stays live until drop.
        unsafe { arch::load_page_table(self.root as u64) };
    }

    /// Maps fresh zeroed frames over `[vaddr, vaddr + len)`. Pages
    /// already present are left in place (ELF segments may share a
    /// page boundary).
    pub fn map_fixed(&mut self, vaddr: u64, len: usize, prot: Prot) -> Result<(), VmError> {
        if len == 0 {
            return Err(VmError::BadRange);
        }
        let start = vaddr & !(PAGE_SIZE as u64 - 1);
        let end = (vaddr + len as u64).next_multiple_of(PAGE_SIZE as u64);
        let mut page = start;
        while page < end {
            if !self.pages.contains_key(&page) {
                let paddr = memory::frame_allocator()
                    .alloc_frames(1)
                    .ok_or(VmError::OutOfFrames)?;
                self.pages.insert(
                    page,
                    Page {
                        vaddr: page,
                        paddr,
                        prot,
                        reference: Arc::new(AtomicUsize::new(1)),
                    },
                );
            }
            page += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Anonymous mapping below the cursor; returns the base address.
    pub fn map_anonymous(&mut self, len: usize, prot: Prot) -> Result<u64, VmError> {
        let span = (len.max(1) as u64).next_multiple_of(PAGE_SIZE as u64);
        let base = self
            .mmap_cursor
            .checked_sub(span)
            .ok_or(VmError::BadRange)?;
        self.map_fixed(base, span as usize, prot)?;
        self.mmap_cursor = base;
        Ok(base)
    }

    /// Copy-on-write clone: the child shares every frame and each
    /// page's reference count goes up by one.
    pub fn fork(&self) -> Result<Self, VmError> {
        let root = memory::frame_allocator()
            .alloc_frames(1)
            .ok_or(VmError::OutOfFrames)?;
        let mut pages = HashMap::with_capacity(self.pages.len());
        for (vaddr, page) in &self.pages {
            page.reference.fetch_add(1, Ordering::AcqRel);
            pages.insert(*vaddr, page.clone());
        }
        Ok(Self {
            root,
            pages,
            mmap_cursor: self.mmap_cursor,
        })
    }

    fn page_slice(&self, vaddr: u64, len: usize) -> Result<(usize, usize), VmError> {
        let base = vaddr & !(PAGE_SIZE as u64 - 1);
        let offset = (vaddr - base) as usize;
        let page = self.pages.get(&base).ok_or(VmError::Unmapped)?;
        let chunk = len.min(PAGE_SIZE - offset);
        Ok((memory::phys_to_virt(page.paddr) + offset, chunk))
    }

    /// Copies `bytes` into the space at `vaddr`, page by page.
    pub fn write(&self, vaddr: u64, bytes: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < bytes.len() {
            let (dst, chunk) = self.page_slice(vaddr + done as u64, bytes.len() - done)?;
            // SAFETY: page_slice resolved a live frame of at least
            // `chunk` bytes past `dst`.
            unsafe {
                core::ptr::copy_nonoverlapping(bytes.as_ptr().add(done), dst as *mut u8, chunk);
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copies from the space at `vaddr` into `buf`.
    pub fn read(&self, vaddr: u64, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let (src, chunk) = self.page_slice(vaddr + done as u64, buf.len() - done)?;
            // SAFETY: as in `write`.
            unsafe {
                core::ptr::copy_nonoverlapping(src as *const u8, buf.as_mut_ptr().add(done), chunk);
            }
            done += chunk;
        }
        Ok(())
    }

    pub fn read_u64(&self, vaddr: u64) -> Result<u64, VmError> {
        let mut raw = [0u8; 8];
        self.read(vaddr, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    pub fn write_u64(&self, vaddr: u64, value: u64) -> Result<(), VmError> {
        self.write(vaddr, &value.to_le_bytes())
    }

    /// Drops the pages covering `[vaddr, vaddr + len)`.
    pub fn unmap_range(&mut self, vaddr: u64, len: usize) -> Result<(), VmError> {
        if len == 0 {
            return Err(VmError::BadRange);
        }
        let start = vaddr & !(PAGE_SIZE as u64 - 1);
        let end = (vaddr + len as u64).next_multiple_of(PAGE_SIZE as u64);
        let mut page = start;
        while page < end {
            if let Some(entry) = self.pages.remove(&page) {
                release_page(&entry);
            }
            page += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Walks the whole page list, dropping each reference and
    /// freeing frames that reach zero. The exit path.
    pub fn release_all(&mut self) {
        for (_, page) in self.pages.drain() {
            release_page(&page);
        }
    }

    /// Shared reference count of the page holding `vaddr`, if mapped.
    pub fn page_refcount(&self, vaddr: u64) -> Option<usize> {
        let base = vaddr & !(PAGE_SIZE as u64 - 1);
        self.pages
            .get(&base)
            .map(|p| p.reference.load(Ordering::Acquire))
    }

    pub fn mapped_pages(&self) -> usize {
        self.pages.len()
    }
}

fn release_page(page: &Page) {
    if page.reference.fetch_sub(1, Ordering::AcqRel) == 1 {
        memory::frame_allocator().free_frames(page.paddr, 1);
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.release_all();
        if self.root != 0 {
            memory::frame_allocator().free_frames(self.root, 1);
            self.root = 0;
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    fn space() -> AddressSpace {
        vos_hal::memory::install_test_frame_allocator();
        AddressSpace::new().unwrap()
    }

    #[test]
    fn anonymous_map_then_rw_across_pages() {
        let mut s = space();
        let base = s.map_anonymous(3 * PAGE_SIZE, Prot::READ | Prot::WRITE | Prot::USER).unwrap();
        // Straddle the first page boundary.
        let at = base + PAGE_SIZE as u64 - 3;
        let payload = [0xAAu8, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        s.write(at, &payload).unwrap();
        let mut back = [0u8; 6];
        s.read(at, &mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn unmapped_access_is_an_error() {
        let s = space();
        let mut buf = [0u8; 4];
        assert_eq!(s.read(0x4000, &mut buf), Err(VmError::Unmapped));
        assert_eq!(s.write(0x4000, &buf), Err(VmError::Unmapped));
    }

    #[test]
    fn fork_shares_frames_and_counts_references() {
        let mut parent = space();
        let base = parent.map_anonymous(PAGE_SIZE, Prot::READ | Prot::WRITE).unwrap();
        parent.write(base, b"shared").unwrap();
        assert_eq!(parent.page_refcount(base), Some(1));

        let child = parent.fork().unwrap();
        assert_eq!(parent.page_refcount(base), Some(2));
        assert_eq!(child.page_refcount(base), Some(2));

        // Both sides observe identical memory prior to any write.
        let mut buf = [0u8; 6];
        child.read(base, &mut buf).unwrap();
        assert_eq!(&buf, b"shared");

        drop(child);
        assert_eq!(parent.page_refcount(base), Some(1));
    }

    #[test]
    fn release_all_empties_the_ledger() {
        let mut s = space();
        s.map_anonymous(2 * PAGE_SIZE, Prot::READ).unwrap();
        assert_eq!(s.mapped_pages(), 2);
        s.release_all();
        assert_eq!(s.mapped_pages(), 0);
    }

    #[test]
    fn unmap_range_releases_only_the_range() {
        let mut s = space();
        let base = s.map_anonymous(4 * PAGE_SIZE, Prot::READ | Prot::WRITE).unwrap();
        s.unmap_range(base, 2 * PAGE_SIZE).unwrap();
        assert_eq!(s.mapped_pages(), 2);
        assert!(s.page_refcount(base).is_none());
        assert!(s.page_refcount(base + 2 * PAGE_SIZE as u64).is_some());
    }
}
