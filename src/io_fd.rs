//! Thin raw-fd read/write helpers for the process's standard input and
//! output endpoints (§3 "Stream" lifecycle: "Input stream / output stream:
//! created at startup, live for process lifetime").
//!
//! `mio::unix::SourceFd` only lets the reactor watch a raw fd for
//! readiness; it does not provide the actual read/write syscalls, so those
//! are done here directly with `libc`, the way the original C engine talks
//! to fd 0 and fd 1 without ever wrapping them in a higher-level stream
//! type.

use std::io;
use std::os::fd::RawFd;

/// Reads up to `buf.len()` bytes from `fd`.
///
/// `Ok(None)` means the read would have blocked (nothing pending right now,
/// despite the reactor's readiness notification — a legal spurious wakeup).
/// `Ok(Some(0))` is a genuine EOF. `Ok(Some(n > 0))` is `n` bytes of data.
/// Collapsing would-block and EOF into the same `Ok(0)` would make a closed
/// input stream indistinguishable from "nothing to read yet", which is
/// exactly the distinction §7 needs (EOF on the input stream is fatal;
/// would-block is not).
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some(n as usize))
}

/// Writes all of `buf` to `fd`, returning the number of bytes actually
/// written by the single underlying `write(2)` call (no retry loop — a
/// short write is the caller's signal to treat this stream as failed,
/// mirroring the "short write = close" policy applied to client sockets).
pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn write_then_read_round_trips_through_a_pipe() {
        let (reader, writer) = unsafe {
            let mut fds = [0i32; 2];
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
            (fds[0], fds[1])
        };

        let written = write_fd(writer, b"hello").unwrap();
        assert_eq!(written, 5);

        let mut buf = [0u8; 16];
        let read = read_fd(reader, &mut buf).unwrap().unwrap();
        assert_eq!(&buf[..read], b"hello");

        unsafe {
            libc::close(reader);
            libc::close(writer);
        }
    }

    #[test]
    fn fd_helpers_work_on_owned_file_fds() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        assert_eq!(write_fd(fd, b"abc").unwrap(), 3);
    }
}
