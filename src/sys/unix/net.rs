use std::io;
use std::os::fd::RawFd;

/// One non-blocking read.
pub(crate) fn read(fd: RawFd, dst: &mut [u8]) -> io::Result<usize> {
    syscall!(read(fd, dst.as_mut_ptr() as *mut libc::c_void, dst.len())).map(|n| n as usize)
}

/// One non-blocking write. `MSG_NOSIGNAL` maps a broken pipe to `EPIPE`
/// instead of raising `SIGPIPE` at the process.
pub(crate) fn write(fd: RawFd, src: &[u8]) -> io::Result<usize> {
    syscall!(send(
        fd,
        src.as_ptr() as *const libc::c_void,
        src.len(),
        libc::MSG_NOSIGNAL,
    ))
    .map(|n| n as usize)
}
