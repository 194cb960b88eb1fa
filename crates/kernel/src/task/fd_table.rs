//! Per-task file descriptors.
//!
//! Descriptor numbers come from a bitmap (lowest free wins, POSIX
//! style) and the table maps each set bit to a handle. A descriptor
//! is a thin record over a shared, reference-counted `FileHandle`;
//! fork shallow-copies the records so both tables move the same file
//! position, and the last close releases the underlying asset.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use vos_utils::{Bitmap, HashMap};

use crate::fs::{self, VfsNode};
use crate::syscall::errno;

/// Open flags (status flags live on the file, O_CLOEXEC on the
/// descriptor).
pub const O_RDONLY: u32 = 0o0;
pub const O_WRONLY: u32 = 0o1;
pub const O_RDWR: u32 = 0o2;
pub const O_ACCMODE: u32 = 0o3;
pub const O_APPEND: u32 = 0o2000;
pub const O_CLOEXEC: u32 = 0o2000000;

/// fcntl descriptor flag.
pub const FD_CLOEXEC: u32 = 1;

pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;

/// Shared open-file state: node, status flags, file position.
pub struct FileHandle {
    pub node: Arc<VfsNode>,
    pub flags: AtomicU32,
    pub position: AtomicI64,
}

impl FileHandle {
    pub fn open(node: Arc<VfsNode>, flags: u32) -> Arc<Self> {
        Arc::new(Self {
            node,
            flags: AtomicU32::new(flags & !O_CLOEXEC),
            position: AtomicI64::new(0),
        })
    }

    pub fn readable(&self) -> bool {
        self.flags.load(Ordering::Acquire) & O_ACCMODE != O_WRONLY
    }

    pub fn writable(&self) -> bool {
        self.flags.load(Ordering::Acquire) & O_ACCMODE != O_RDONLY
    }
}

/// One descriptor: the shared file plus per-descriptor flags.
#[derive(Clone)]
pub struct FdHandle {
    pub file: Arc<FileHandle>,
    pub flags: u32,
}

impl FdHandle {
    pub fn close_on_exec(&self) -> bool {
        self.flags & FD_CLOEXEC != 0
    }
}

#[derive(Default)]
pub struct FdTable {
    map: HashMap<i32, FdHandle>,
    bitmap: Bitmap,
}

impl FdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the lowest free descriptor for `file`.
    pub fn install(&mut self, file: Arc<FileHandle>, flags: u32) -> i32 {
        let fd = self.bitmap.alloc() as i32;
        self.map.insert(fd, FdHandle { file, flags });
        fd
    }

    /// Places `file` at a specific number, closing whatever was
    /// there (dup2).
    pub fn install_at(&mut self, fd: i32, file: Arc<FileHandle>, flags: u32) {
        self.bitmap.set(fd as usize);
        self.map.insert(fd, FdHandle { file, flags });
    }

    pub fn get(&self, fd: i32) -> Option<FdHandle> {
        self.map.get(&fd).cloned()
    }

    pub fn close(&mut self, fd: i32) -> Result<(), i32> {
        if fd < 0 {
            return Err(errno::EBADF);
        }
        match self.map.remove(&fd) {
            Some(_) => {
                self.bitmap.clear(fd as usize);
                Ok(())
            }
            None => Err(errno::EBADF),
        }
    }

    /// Exit path: release every descriptor whose bit is set.
    pub fn close_all(&mut self) {
        self.map.clear();
        self.bitmap = Bitmap::new();
    }

    /// Duplicates `fd` to the lowest free number at or above `min`.
    pub fn dup_from(&mut self, fd: i32, min: i32) -> Result<i32, i32> {
        let handle = self.map.get(&fd).cloned().ok_or(errno::EBADF)?;
        let mut candidate = min.max(0);
        while self.bitmap.test(candidate as usize) {
            candidate += 1;
        }
        self.bitmap.set(candidate as usize);
        // dup clears the close-on-exec flag on the new descriptor.
        self.map.insert(
            candidate,
            FdHandle {
                file: handle.file,
                flags: handle.flags & !FD_CLOEXEC,
            },
        );
        Ok(candidate)
    }

    pub fn dup(&mut self, fd: i32) -> Result<i32, i32> {
        self.dup_from(fd, 0)
    }

    pub fn dup2(&mut self, oldfd: i32, newfd: i32) -> Result<i32, i32> {
        if newfd < 0 {
            return Err(errno::EBADF);
        }
        let handle = self.map.get(&oldfd).cloned().ok_or(errno::EBADF)?;
        if oldfd == newfd {
            return Ok(newfd);
        }
        self.install_at(
            newfd,
            handle.file,
            handle.flags & !FD_CLOEXEC,
        );
        Ok(newfd)
    }

    pub fn set_fd_flags(&mut self, fd: i32, flags: u32) -> Result<(), i32> {
        let handle = self.map.get_mut(&fd).ok_or(errno::EBADF)?;
        handle.flags = flags;
        Ok(())
    }

    /// Fork: shallow-copy every descriptor (bumping each file's
    /// refcount) and duplicate the bitmap.
    pub fn clone_for_fork(&self) -> Self {
        Self {
            map: self.map.clone(),
            bitmap: self.bitmap.duplicate(),
        }
    }

    /// Execve sweep: drop every descriptor marked close-on-exec.
    pub fn close_cloexec(&mut self) {
        let doomed: alloc::vec::Vec<i32> = self
            .map
            .iter()
            .filter(|(_, h)| h.close_on_exec())
            .map(|(fd, _)| *fd)
            .collect();
        for fd in doomed {
            let _ = self.close(fd);
        }
    }

    /// Wires fd 0/1/2 to the terminal callbacks (task_exec).
    pub fn attach_stdio(&mut self) {
        let console = fs::console_node();
        self.install_at(0, FileHandle::open(console.clone(), O_RDONLY), 0);
        self.install_at(1, FileHandle::open(console.clone(), O_WRONLY), 0);
        self.install_at(2, FileHandle::open(console, O_WRONLY), 0);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Every set bit has an entry and vice versa.
    pub fn consistent(&self) -> bool {
        self.map.keys().all(|fd| self.bitmap.test(*fd as usize))
            && self
                .bitmap
                .iter_set()
                .all(|fd| self.map.contains_key(&(fd as i32)))
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use alloc::string::String;
    use crate::fs::{Asset, Stat};

    struct NullAsset;

    impl Asset for NullAsset {
        fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, i32> {
            Ok(0)
        }
        fn write(&self, _offset: u64, buf: &[u8]) -> Result<usize, i32> {
            Ok(buf.len())
        }
    }

    fn node() -> Arc<VfsNode> {
        VfsNode::new(String::from("/dev/null"), Stat::default(), Arc::new(NullAsset))
    }

    #[test]
    fn lowest_free_number_wins() {
        let mut table = FdTable::new();
        table.attach_stdio();
        let file = FileHandle::open(node(), O_RDWR);
        assert_eq!(table.install(file.clone(), 0), 3);
        table.close(1).unwrap();
        assert_eq!(table.install(file, 0), 1); // freed slot reused first
        assert!(table.consistent());
    }

    #[test]
    fn clone_for_fork_shares_file_handles() {
        let mut table = FdTable::new();
        let file = FileHandle::open(node(), O_RDWR);
        let fd = table.install(file.clone(), 0);
        let refs_before = Arc::strong_count(&file);

        let forked = table.clone_for_fork();
        assert_eq!(Arc::strong_count(&file), refs_before + 1);

        // Same file handle: positions move together.
        let a = table.get(fd).unwrap();
        let b = forked.get(fd).unwrap();
        a.file.position.store(40, Ordering::Release);
        assert_eq!(b.file.position.load(Ordering::Acquire), 40);
        assert!(forked.consistent());
    }

    #[test]
    fn cloexec_sweep_closes_exactly_the_marked_fds() {
        let mut table = FdTable::new();
        table.attach_stdio();
        let keep = table.install(FileHandle::open(node(), O_RDWR), 0);
        let drop_me = table.install(FileHandle::open(node(), O_RDWR), FD_CLOEXEC);
        table.close_cloexec();
        assert!(table.get(keep).is_some());
        assert!(table.get(drop_me).is_none());
        assert!(table.get(0).is_some()); // stdio untouched
        assert!(table.consistent());
    }

    #[test]
    fn dup_clears_cloexec_and_dup2_replaces() {
        let mut table = FdTable::new();
        let orig = table.install(FileHandle::open(node(), O_RDWR), FD_CLOEXEC);
        let copy = table.dup(orig).unwrap();
        assert!(!table.get(copy).unwrap().close_on_exec());

        let other = FileHandle::open(node(), O_RDONLY);
        table.install_at(9, other, 0);
        assert_eq!(table.dup2(orig, 9).unwrap(), 9);
        assert!(Arc::ptr_eq(
            &table.get(9).unwrap().file,
            &table.get(orig).unwrap().file
        ));
        assert!(table.consistent());
    }

    #[test]
    fn close_all_empties_table_and_bitmap() {
        let mut table = FdTable::new();
        table.attach_stdio();
        table.close_all();
        assert!(table.is_empty());
        assert!(table.consistent());
        assert_eq!(table.install(FileHandle::open(node(), O_RDWR), 0), 0);
    }
}
