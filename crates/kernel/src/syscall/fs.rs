//! Descriptor syscalls over the fd table and the filesystem seam.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::arch::Registers;
use crate::fs::{self, R_OK, W_OK, X_OK, stat_allows};
use crate::syscall::errno;
use crate::syscall::helpers::{
    complete, read_user_bytes, read_user_string, with_current, write_user_bytes,
    write_user_struct,
};
use crate::task::fd_table::{
    FD_CLOEXEC, FileHandle, O_CLOEXEC, SEEK_CUR, SEEK_END, SEEK_SET,
};
use crate::task::Task;

/// dirfd sentinel: resolve relative to the working directory.
pub const AT_FDCWD: i32 = -100;

pub const F_DUPFD: i32 = 0;
pub const F_GETFD: i32 = 1;
pub const F_SETFD: i32 = 2;
pub const F_GETFL: i32 = 3;
pub const F_SETFL: i32 = 4;

/// Cap on one read/write transfer (keeps kernel bounce buffers sane).
const IO_MAX: usize = 1 << 20;

fn resolve_at(task: &Arc<Task>, dirfd: i32, path: &str) -> Result<Arc<fs::VfsNode>, i32> {
    if dirfd != AT_FDCWD && !path.starts_with('/') {
        // Directory-relative resolution belongs to the external VFS.
        return Err(errno::EBADF);
    }
    let cwd = task.cwd.lock().clone();
    fs::resolve(cwd.as_ref(), path).ok_or(errno::ENOENT)
}

pub fn sys_open(regs: &mut Registers) {
    let dirfd = regs.rdi as i32;
    let path_addr = regs.rsi;
    let flags = regs.rdx as u32;

    let result = with_current(|task| {
        let path = {
            let guard = task.space.lock();
            let space = guard.as_ref().ok_or(errno::EFAULT)?;
            read_user_string(space, path_addr)?
        };
        let node = resolve_at(task, dirfd, &path)?;
        let file = FileHandle::open(node, flags);
        let descriptor_flags = if flags & O_CLOEXEC != 0 { FD_CLOEXEC } else { 0 };
        let fd = task.fds.lock().install(file, descriptor_flags);
        log::trace!("[FD] open '{path}' -> {fd}");
        Ok(fd as u64)
    });
    complete(regs, result);
}

pub fn sys_close(regs: &mut Registers) {
    let fd = regs.rdi as i32;
    let result = with_current(|task| task.fds.lock().close(fd).map(|()| 0));
    complete(regs, result);
}

pub fn sys_read(regs: &mut Registers) {
    let fd = regs.rdi as i32;
    let buf_addr = regs.rsi;
    let count = (regs.rdx as usize).min(IO_MAX);

    let result = with_current(|task| {
        let handle = task.fds.lock().get(fd).ok_or(errno::EBADF)?;
        if !handle.file.readable() {
            return Err(errno::EBADF);
        }
        let offset = handle.file.position.load(Ordering::Acquire);
        let mut buf = alloc::vec![0u8; count];
        let got = handle.file.node.asset.read(offset as u64, &mut buf)?;
        {
            let guard = task.space.lock();
            let space = guard.as_ref().ok_or(errno::EFAULT)?;
            write_user_bytes(space, buf_addr, &buf[..got])?;
        }
        handle
            .file
            .position
            .store(offset + got as i64, Ordering::Release);
        Ok(got as u64)
    });
    complete(regs, result);
}

pub fn sys_write(regs: &mut Registers) {
    let fd = regs.rdi as i32;
    let buf_addr = regs.rsi;
    let count = (regs.rdx as usize).min(IO_MAX);

    let result = with_current(|task| {
        let handle = task.fds.lock().get(fd).ok_or(errno::EBADF)?;
        if !handle.file.writable() {
            return Err(errno::EBADF);
        }
        let bytes = {
            let guard = task.space.lock();
            let space = guard.as_ref().ok_or(errno::EFAULT)?;
            read_user_bytes(space, buf_addr, count)?
        };
        let offset = handle.file.position.load(Ordering::Acquire);
        let put = handle.file.node.asset.write(offset as u64, &bytes)?;
        handle
            .file
            .position
            .store(offset + put as i64, Ordering::Release);
        Ok(put as u64)
    });
    complete(regs, result);
}

pub fn sys_seek(regs: &mut Registers) {
    let fd = regs.rdi as i32;
    let offset = regs.rsi as i64;
    let whence = regs.rdx as i32;

    let result = with_current(|task| {
        let handle = task.fds.lock().get(fd).ok_or(errno::EBADF)?;
        let base = match whence {
            SEEK_SET => 0,
            SEEK_CUR => handle.file.position.load(Ordering::Acquire),
            SEEK_END => handle.file.node.stat().st_size,
            _ => return Err(errno::EINVAL),
        };
        let target = base.checked_add(offset).ok_or(errno::EINVAL)?;
        if target < 0 {
            return Err(errno::EINVAL);
        }
        handle.file.position.store(target, Ordering::Release);
        Ok(target as u64)
    });
    complete(regs, result);
}

pub fn sys_dup(regs: &mut Registers) {
    let fd = regs.rdi as i32;
    let result = with_current(|task| task.fds.lock().dup(fd).map(|new| new as u64));
    complete(regs, result);
}

pub fn sys_dup2(regs: &mut Registers) {
    let oldfd = regs.rdi as i32;
    let newfd = regs.rsi as i32;
    let result = with_current(|task| task.fds.lock().dup2(oldfd, newfd).map(|new| new as u64));
    complete(regs, result);
}

pub fn sys_fcntl(regs: &mut Registers) {
    let fd = regs.rdi as i32;
    let cmd = regs.rsi as i32;
    let arg = regs.rdx;

    let result = with_current(|task| {
        let mut fds = task.fds.lock();
        match cmd {
            F_DUPFD => fds.dup_from(fd, arg as i32).map(|new| new as u64),
            F_GETFD => fds
                .get(fd)
                .map(|handle| u64::from(handle.flags & FD_CLOEXEC))
                .ok_or(errno::EBADF),
            F_SETFD => fds
                .set_fd_flags(fd, arg as u32 & FD_CLOEXEC)
                .map(|()| 0),
            F_GETFL => fds
                .get(fd)
                .map(|handle| u64::from(handle.file.flags.load(Ordering::Acquire)))
                .ok_or(errno::EBADF),
            F_SETFL => {
                let handle = fds.get(fd).ok_or(errno::EBADF)?;
                // Only the status flags move; access mode is fixed.
                let keep = handle.file.flags.load(Ordering::Acquire) & 0o3;
                handle
                    .file
                    .flags
                    .store(keep | (arg as u32 & !0o3), Ordering::Release);
                Ok(0)
            }
            _ => Err(errno::EINVAL),
        }
    });
    complete(regs, result);
}

pub fn sys_fstat(regs: &mut Registers) {
    let fd = regs.rdi as i32;
    let stat_addr = regs.rsi;
    let result = with_current(|task| {
        let handle = task.fds.lock().get(fd).ok_or(errno::EBADF)?;
        let stat = handle.file.node.stat();
        let guard = task.space.lock();
        let space = guard.as_ref().ok_or(errno::EFAULT)?;
        // SAFETY: Stat is repr(C) plain data.
        unsafe { write_user_struct(space, stat_addr, &stat) }?;
        Ok(0)
    });
    complete(regs, result);
}

pub fn sys_fstatat(regs: &mut Registers) {
    let dirfd = regs.rdi as i32;
    let path_addr = regs.rsi;
    let stat_addr = regs.rdx;

    let result = with_current(|task| {
        let path = {
            let guard = task.space.lock();
            let space = guard.as_ref().ok_or(errno::EFAULT)?;
            read_user_string(space, path_addr)?
        };
        let node = resolve_at(task, dirfd, &path)?;
        let stat = node.stat();
        let guard = task.space.lock();
        let space = guard.as_ref().ok_or(errno::EFAULT)?;
        // SAFETY: Stat is repr(C) plain data.
        unsafe { write_user_struct(space, stat_addr, &stat) }?;
        Ok(0)
    });
    complete(regs, result);
}

pub fn sys_ioctl(regs: &mut Registers) {
    let fd = regs.rdi as i32;
    let request = regs.rsi;
    let arg = regs.rdx;
    let result = with_current(|task| {
        let handle = task.fds.lock().get(fd).ok_or(errno::EBADF)?;
        let value = handle.file.node.asset.ioctl(request, arg)?;
        Ok(value as u64)
    });
    complete(regs, result);
}

/// Access check against the real ids, as POSIX specifies for access.
pub fn sys_faccessat(regs: &mut Registers) {
    let dirfd = regs.rdi as i32;
    let path_addr = regs.rsi;
    let mode = regs.rdx as u32 & (R_OK | W_OK | X_OK);

    let result = with_current(|task| {
        let path = {
            let guard = task.space.lock();
            let space = guard.as_ref().ok_or(errno::EFAULT)?;
            read_user_string(space, path_addr)?
        };
        let node = resolve_at(task, dirfd, &path)?;
        let creds = *task.creds.lock();
        if stat_allows(&node.stat(), creds.real_uid, creds.real_gid, mode) {
            Ok(0)
        } else {
            Err(errno::EACCES)
        }
    });
    complete(regs, result);
}

pub fn sys_chdir(regs: &mut Registers) {
    let path_addr = regs.rdi;
    let result = with_current(|task| {
        let path = {
            let guard = task.space.lock();
            let space = guard.as_ref().ok_or(errno::EFAULT)?;
            read_user_string(space, path_addr)?
        };
        let node = resolve_at(task, AT_FDCWD, &path)?;
        *task.cwd.lock() = Some(node);
        Ok(0)
    });
    complete(regs, result);
}

pub fn sys_getcwd(regs: &mut Registers) {
    let buf_addr = regs.rdi;
    let size = regs.rsi as usize;

    let result = with_current(|task| {
        let path = task
            .cwd
            .lock()
            .as_ref()
            .map(|node| node.path.clone())
            .unwrap_or_else(|| alloc::string::String::from("/"));
        if path.len() + 1 > size {
            return Err(errno::ERANGE);
        }
        let guard = task.space.lock();
        let space = guard.as_ref().ok_or(errno::EFAULT)?;
        write_user_bytes(space, buf_addr, path.as_bytes())?;
        write_user_bytes(space, buf_addr + path.len() as u64, &[0])?;
        Ok(buf_addr)
    });
    complete(regs, result);
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::test_support::{become_current, install_ramfs, kernel_test, task_with_user_page};

    fn regs3(rdi: u64, rsi: u64, rdx: u64) -> Registers {
        Registers {
            rdi,
            rsi,
            rdx,
            ..Registers::default()
        }
    }

    #[test]
    fn open_read_close_round_trip() {
        let _guard = kernel_test();
        let ramfs = install_ramfs();
        ramfs.add("/etc/motd", b"hello, vesper".to_vec(), 0o644, 0, 0);

        let (task, thread, scratch) = task_with_user_page();
        become_current(&task, &thread);

        // Path string into user memory.
        {
            let guard = task.space.lock();
            guard.as_ref().unwrap().write(scratch, b"/etc/motd\0").unwrap();
        }

        let mut regs = regs3(AT_FDCWD as u64, scratch, 0);
        sys_open(&mut regs);
        let fd = regs.rax;
        assert_ne!(fd, u64::MAX);

        let mut regs = regs3(fd, scratch + 256, 64);
        sys_read(&mut regs);
        assert_eq!(regs.rax, 13);
        {
            let guard = task.space.lock();
            let mut back = [0u8; 13];
            guard.as_ref().unwrap().read(scratch + 256, &mut back).unwrap();
            assert_eq!(&back, b"hello, vesper");
        }

        // Sequential read continues at the file position.
        let mut regs = regs3(fd, scratch + 512, 64);
        sys_read(&mut regs);
        assert_eq!(regs.rax, 0); // EOF

        let mut regs = regs3(fd, 0, 0);
        sys_close(&mut regs);
        assert_eq!(regs.rax, 0);
        let mut regs = regs3(fd, 0, 0);
        sys_close(&mut regs);
        assert_eq!(regs.rax, u64::MAX); // EBADF on double close
    }

    #[test]
    fn seek_whence_variants() {
        let _guard = kernel_test();
        let ramfs = install_ramfs();
        ramfs.add("/data", alloc::vec![7u8; 100], 0o644, 0, 0);

        let (task, thread, scratch) = task_with_user_page();
        become_current(&task, &thread);
        {
            let guard = task.space.lock();
            guard.as_ref().unwrap().write(scratch, b"/data\0").unwrap();
        }
        let mut regs = regs3(AT_FDCWD as u64, scratch, 0);
        sys_open(&mut regs);
        let fd = regs.rax;

        let mut regs = regs3(fd, 10, SEEK_SET as u64);
        sys_seek(&mut regs);
        assert_eq!(regs.rax, 10);
        let mut regs = regs3(fd, 5, SEEK_CUR as u64);
        sys_seek(&mut regs);
        assert_eq!(regs.rax, 15);
        let mut regs = regs3(fd, 0, SEEK_END as u64);
        sys_seek(&mut regs);
        assert_eq!(regs.rax, 100);
        let mut regs = regs3(fd, 0, 99);
        sys_seek(&mut regs);
        assert_eq!(regs.rax, u64::MAX); // bad whence
    }

    #[test]
    fn fcntl_cloexec_round_trip() {
        let _guard = kernel_test();
        let ramfs = install_ramfs();
        ramfs.add("/f", b"x".to_vec(), 0o644, 0, 0);

        let (task, thread, scratch) = task_with_user_page();
        become_current(&task, &thread);
        {
            let guard = task.space.lock();
            guard.as_ref().unwrap().write(scratch, b"/f\0").unwrap();
        }
        let mut regs = regs3(AT_FDCWD as u64, scratch, 0);
        sys_open(&mut regs);
        let fd = regs.rax;

        let mut regs = regs3(fd, F_GETFD as u64, 0);
        sys_fcntl(&mut regs);
        assert_eq!(regs.rax, 0);

        let mut regs = regs3(fd, F_SETFD as u64, u64::from(FD_CLOEXEC));
        sys_fcntl(&mut regs);
        assert_eq!(regs.rax, 0);

        let mut regs = regs3(fd, F_GETFD as u64, 0);
        sys_fcntl(&mut regs);
        assert_eq!(regs.rax, u64::from(FD_CLOEXEC));
    }

    #[test]
    fn faccessat_honors_real_ids() {
        let _guard = kernel_test();
        let ramfs = install_ramfs();
        ramfs.add("/secret", b"".to_vec(), 0o700, 10, 10);

        let (task, thread, scratch) = task_with_user_page();
        become_current(&task, &thread);
        {
            let mut creds = task.creds.lock();
            creds.real_uid = 11;
            creds.effective_uid = 10; // effective would pass; real must rule
            creds.real_gid = 11;
        }
        {
            let guard = task.space.lock();
            guard.as_ref().unwrap().write(scratch, b"/secret\0").unwrap();
        }
        let mut regs = regs3(AT_FDCWD as u64, scratch, u64::from(R_OK));
        sys_faccessat(&mut regs);
        assert_eq!(regs.rax, u64::MAX);
        assert_eq!(crate::cpu::errno(), errno::EACCES);
    }

    #[test]
    fn getcwd_reports_erange_on_tiny_buffers() {
        let _guard = kernel_test();
        let ramfs = install_ramfs();
        ramfs.add("/home/user", b"".to_vec(), 0o755, 0, 0);

        let (task, thread, scratch) = task_with_user_page();
        become_current(&task, &thread);
        {
            let guard = task.space.lock();
            guard.as_ref().unwrap().write(scratch, b"/home/user\0").unwrap();
        }
        let mut regs = regs3(scratch, 0, 0);
        sys_chdir(&mut regs);
        assert_eq!(regs.rax, 0);

        let mut regs = regs3(scratch + 256, 4, 0);
        sys_getcwd(&mut regs);
        assert_eq!(regs.rax, u64::MAX);
        assert_eq!(crate::cpu::errno(), errno::ERANGE);

        let mut regs = regs3(scratch + 256, 64, 0);
        sys_getcwd(&mut regs);
        assert_eq!(regs.rax, scratch + 256);
        let guard = task.space.lock();
        let mut back = [0u8; 11];
        guard.as_ref().unwrap().read(scratch + 256, &mut back).unwrap();
        assert_eq!(&back, b"/home/user\0");
    }
}
