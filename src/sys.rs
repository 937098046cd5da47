// Thin wrappers around the raw libc calls the native driver needs.

use std::io;
use std::os::unix::io::RawFd;

pub(crate) fn lseek(fd: RawFd, pos: u64) -> io::Result<()> {
    let result = unsafe { libc::lseek(fd, pos as libc::off_t, libc::SEEK_SET) };
    if result == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn read(fd: RawFd, buffer: &mut [u8]) -> io::Result<usize> {
    let count = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) };
    if count < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(count as usize)
}

pub(crate) fn write(fd: RawFd, buffer: &[u8]) -> io::Result<usize> {
    let count = unsafe { libc::write(fd, buffer.as_ptr().cast(), buffer.len()) };
    if count < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(count as usize)
}

pub(crate) fn file_size(fd: RawFd) -> io::Result<u64> {
    let mut data: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut data) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(data.st_size as u64)
}

pub(crate) fn mmap(fd: RawFd, length: usize) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            length,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr.cast())
}

pub(crate) fn munmap(ptr: *mut u8, length: usize) -> io::Result<()> {
    if unsafe { libc::munmap(ptr.cast(), length) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
