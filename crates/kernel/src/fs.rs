//! Filesystem seam.
//!
//! The VFS proper (mounts, paths, directories, caches) lives outside
//! this crate. The core needs exactly this much: resolve a path to a
//! node, a node's stat, and an asset with read/write/ioctl. That
//! covers execve, the fd table and the three stdio descriptors.

use alloc::string::String;
use alloc::sync::Arc;

use vos_hal::IrqSafeLock;

use crate::syscall::errno;

/// Set-uid / set-gid mode bits, honored by execve.
pub const S_ISUID: u32 = 0o4000;
pub const S_ISGID: u32 = 0o2000;

/// Access-check masks (`faccessat`, execve).
pub const R_OK: u32 = 4;
pub const W_OK: u32 = 2;
pub const X_OK: u32 = 1;

pub const TIOCGWINSZ: u64 = 0x5413;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Stat {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_rdev: u64,
    pub st_size: i64,
    pub st_blksize: i64,
    pub st_blocks: i64,
}

/// Permission test against a stat's owner/group/other bits. Root
/// passes everything.
pub fn stat_allows(stat: &Stat, uid: u32, gid: u32, want: u32) -> bool {
    if uid == 0 {
        return true;
    }
    let shift = if stat.st_uid == uid {
        6
    } else if stat.st_gid == gid {
        3
    } else {
        0
    };
    (stat.st_mode >> shift) & want == want
}

/// What a file is underneath: the device or filesystem object the
/// descriptor layer reads, writes and ioctls.
pub trait Asset: Send + Sync {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, i32>;

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, i32>;

    fn ioctl(&self, request: u64, _arg: u64) -> Result<i64, i32> {
        let _ = request;
        Err(errno::ENOTTY)
    }
}

pub struct VfsNode {
    pub path: String,
    pub stat: IrqSafeLock<Stat>,
    pub asset: Arc<dyn Asset>,
}

impl VfsNode {
    pub fn new(path: String, stat: Stat, asset: Arc<dyn Asset>) -> Arc<Self> {
        Arc::new(Self {
            path,
            stat: IrqSafeLock::new(stat),
            asset,
        })
    }

    pub fn stat(&self) -> Stat {
        *self.stat.lock()
    }
}

/// Path resolution, implemented by the external VFS and installed at
/// boot.
pub trait Filesystem: Send + Sync {
    fn resolve(&self, path: &str) -> Option<Arc<VfsNode>>;
}

static ROOT_FS: IrqSafeLock<Option<Arc<dyn Filesystem>>> = IrqSafeLock::new(None);

pub fn install_root(fs: Arc<dyn Filesystem>) {
    *ROOT_FS.lock() = Some(fs);
}

#[cfg(all(test, feature = "std"))]
pub(crate) fn reset_root() {
    *ROOT_FS.lock() = None;
}

/// Resolves `path` against the root filesystem; relative paths are
/// joined onto `cwd`.
pub fn resolve(cwd: Option<&Arc<VfsNode>>, path: &str) -> Option<Arc<VfsNode>> {
    let fs = ROOT_FS.lock().clone()?;
    if path.starts_with('/') {
        return fs.resolve(path);
    }
    let mut joined = cwd.map_or_else(String::new, |node| node.path.clone());
    if !joined.ends_with('/') {
        joined.push('/');
    }
    joined.push_str(path);
    fs.resolve(&joined)
}

// ============================================================================
// Console asset (stdio)
// ============================================================================

/// Terminal asset behind fd 0/1/2. Input belongs to the TTY driver;
/// until one registers, reads report end-of-file.
pub struct ConsoleAsset;

impl Asset for ConsoleAsset {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, i32> {
        Ok(0)
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> Result<usize, i32> {
        #[cfg(all(not(feature = "std"), target_arch = "x86_64"))]
        if let Ok(text) = core::str::from_utf8(buf) {
            vos_hal::x86_64::serial::write_fmt(format_args!("{text}"));
        }
        #[cfg(feature = "std")]
        CONSOLE_SINK.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn ioctl(&self, request: u64, _arg: u64) -> Result<i64, i32> {
        if request == TIOCGWINSZ {
            return Ok(0);
        }
        Err(errno::ENOTTY)
    }
}

#[cfg(feature = "std")]
static CONSOLE_SINK: IrqSafeLock<alloc::vec::Vec<u8>> = IrqSafeLock::new(alloc::vec::Vec::new());

/// Bytes written to the console asset on host builds.
#[cfg(feature = "std")]
pub fn console_sink_take() -> alloc::vec::Vec<u8> {
    core::mem::take(&mut *CONSOLE_SINK.lock())
}

/// The node stdio descriptors point at.
pub fn console_node() -> Arc<VfsNode> {
    VfsNode::new(
        String::from("/dev/console"),
        Stat {
            st_mode: 0o620,
            st_rdev: 1,
            ..Stat::default()
        },
        Arc::new(ConsoleAsset),
    )
}

// ============================================================================
// Host-test filesystem double
// ============================================================================


#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn access_check_walks_owner_group_other() {
        let stat = Stat {
            st_mode: 0o754,
            st_uid: 10,
            st_gid: 20,
            ..Stat::default()
        };
        assert!(stat_allows(&stat, 0, 0, X_OK)); // root
        assert!(stat_allows(&stat, 10, 99, X_OK)); // owner rwx
        assert!(stat_allows(&stat, 11, 20, R_OK)); // group r-x
        assert!(!stat_allows(&stat, 11, 20, W_OK));
        assert!(stat_allows(&stat, 11, 21, R_OK)); // other r--
        assert!(!stat_allows(&stat, 11, 21, X_OK));
    }

    #[test]
    fn console_rejects_unknown_ioctl() {
        let console = ConsoleAsset;
        assert_eq!(console.ioctl(TIOCGWINSZ, 0), Ok(0));
        assert_eq!(console.ioctl(0xdead, 0), Err(errno::ENOTTY));
    }
}
