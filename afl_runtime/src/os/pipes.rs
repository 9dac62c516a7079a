//! Unix `pipe` helper, mainly to stand in for the supervisor end of the
//! forkserver channel in tests and single-process harnesses.

use std::{
    io::{self, Read, Write},
    os::unix::io::{AsRawFd, OwnedFd, RawFd},
};

use nix::unistd::pipe;

use crate::Error;

/// A unix pipe pair with individually closable ends
#[derive(Debug)]
pub struct Pipe {
    read_end: Option<OwnedFd>,
    write_end: Option<OwnedFd>,
}

impl Pipe {
    /// Create a new pipe pair
    pub fn new() -> Result<Self, Error> {
        let (read_end, write_end) = pipe()?;
        Ok(Self {
            read_end: Some(read_end),
            write_end: Some(write_end),
        })
    }

    /// The raw fd of the read end, if still open
    #[must_use]
    pub fn read_end(&self) -> Option<RawFd> {
        self.read_end.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// The raw fd of the write end, if still open
    #[must_use]
    pub fn write_end(&self) -> Option<RawFd> {
        self.write_end.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Take ownership of the read end
    pub fn take_read_end(&mut self) -> Option<OwnedFd> {
        self.read_end.take()
    }

    /// Take ownership of the write end
    pub fn take_write_end(&mut self) -> Option<OwnedFd> {
        self.write_end.take()
    }

    /// Close the read end
    pub fn close_read_end(&mut self) {
        self.read_end = None;
    }

    /// Close the write end
    pub fn close_write_end(&mut self) {
        self.write_end = None;
    }
}

impl Read for Pipe {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.read_end {
            Some(fd) => {
                let ret = unsafe {
                    libc::read(
                        fd.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "read from closed pipe end",
            )),
        }
    }
}

impl Write for Pipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.write_end {
            Some(fd) => {
                let ret = unsafe {
                    libc::write(
                        fd.as_raw_fd(),
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                    )
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write to closed pipe end",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
