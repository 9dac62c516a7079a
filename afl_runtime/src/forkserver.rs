//! The target end of the forkserver protocol.
//!
//! The supervisor wires two pipes onto well-known descriptor numbers before
//! the target is created: commands come in on [`FORKSRV_FD`], status values
//! go out on `FORKSRV_FD + 1`. Every message is exactly four bytes, a
//! native-endian `u32`, no header, no checksum. A transfer of any other
//! length means the pipe or the supervisor is unusable and surfaces as
//! [`Error::Protocol`].
//!
//! All operations block; wall-clock limits are the supervisor's problem (it
//! kills the target). The state machine is
//! `Unstarted → Handshaked → {read ⇄ write} → Closed`.

use std::os::unix::io::RawFd;

use crate::Error;

/// The descriptor the supervisor sends commands on. `FORKSRV_FD + 1` carries
/// status responses. A wire contract; never reassign or close these from
/// unrelated code.
pub const FORKSRV_FD: RawFd = 198;

const FRAME_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Unstarted,
    Handshaked,
    Closed,
}

/// Synchronous, blocking channel to the fuzzing supervisor.
///
/// The host harness drives it around its own fork+exec+wait loop:
/// [`Self::handshake`] once, then [`Self::read_command`] /
/// [`Self::write_status`] per execution, [`Self::close`] to fall back to
/// single-shot mode when no supervisor negotiated the protocol.
#[derive(Debug)]
pub struct ForkserverChannel {
    ctl_fd: RawFd,
    st_fd: RawFd,
    state: ChannelState,
}

impl Default for ForkserverChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ForkserverChannel {
    /// A channel over the well-known forkserver descriptors
    #[must_use]
    pub fn new() -> Self {
        Self::from_raw_fds(FORKSRV_FD, FORKSRV_FD + 1)
    }

    fn from_raw_fds(ctl_fd: RawFd, st_fd: RawFd) -> Self {
        Self {
            ctl_fd,
            st_fd,
            state: ChannelState::Unstarted,
        }
    }

    /// Announce readiness by writing four zero bytes on the status
    /// descriptor.
    ///
    /// Whether anything reads them is how the supervisor negotiates the
    /// protocol; a failure here usually means there is no forkserver-aware
    /// supervisor on the other end and the harness should [`Self::close`]
    /// and run single-shot.
    pub fn handshake(&mut self) -> Result<(), Error> {
        match self.state {
            ChannelState::Unstarted => {}
            ChannelState::Handshaked => {
                return Err(Error::illegal_state("Forkserver already handshaked"))
            }
            ChannelState::Closed => {
                return Err(Error::illegal_state("Forkserver channel is closed"))
            }
        }
        self.write_frame(0)?;
        log::debug!("Forkserver handshake sent on fd {}", self.st_fd);
        self.state = ChannelState::Handshaked;
        Ok(())
    }

    /// Blocking read of one command frame from the supervisor.
    ///
    /// The value's meaning ("proceed", a run mode, ...) belongs to the
    /// calling harness. A clean peer close shows up as a short read, so the
    /// caller can decide that it means "shut down".
    pub fn read_command(&mut self) -> Result<u32, Error> {
        self.check_handshaked()?;
        let mut buf = [0_u8; FRAME_LEN];
        let mut done = 0;
        while done < FRAME_LEN {
            let ret = unsafe {
                libc::read(
                    self.ctl_fd,
                    buf[done..].as_mut_ptr() as *mut libc::c_void,
                    FRAME_LEN - done,
                )
            };
            match ret {
                0 => {
                    return Err(Error::protocol(format!(
                        "Short read on fd {}: peer closed after {done} of {FRAME_LEN} bytes",
                        self.ctl_fd
                    )))
                }
                r if r < 0 => {
                    let err = std::io::Error::last_os_error();
                    if err.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(Error::protocol(format!(
                        "Failed to read command frame from fd {}: {err}",
                        self.ctl_fd
                    )));
                }
                r => done += r as usize,
            }
        }
        let value = u32::from_ne_bytes(buf);
        log::trace!("Forkserver command {value:#x}");
        Ok(value)
    }

    /// Blocking write of one status frame (conventionally a child pid, then
    /// later its wait status) to the supervisor.
    pub fn write_status(&mut self, value: u32) -> Result<(), Error> {
        self.check_handshaked()?;
        self.write_frame(value)
    }

    /// Close both descriptors. Idempotent.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.state == ChannelState::Closed {
            return Ok(());
        }
        unsafe {
            libc::close(self.ctl_fd);
            libc::close(self.st_fd);
        }
        self.state = ChannelState::Closed;
        log::debug!("Forkserver channel closed");
        Ok(())
    }

    fn check_handshaked(&self) -> Result<(), Error> {
        match self.state {
            ChannelState::Handshaked => Ok(()),
            ChannelState::Unstarted => {
                Err(Error::illegal_state("Forkserver channel not handshaked"))
            }
            ChannelState::Closed => Err(Error::illegal_state("Forkserver channel is closed")),
        }
    }

    fn write_frame(&mut self, value: u32) -> Result<(), Error> {
        let buf = value.to_ne_bytes();
        let mut done = 0;
        while done < FRAME_LEN {
            let ret = unsafe {
                libc::write(
                    self.st_fd,
                    buf[done..].as_ptr() as *const libc::c_void,
                    FRAME_LEN - done,
                )
            };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::protocol(format!(
                    "Failed to write frame to fd {}: {err}, {done} of {FRAME_LEN} bytes sent",
                    self.st_fd
                )));
            }
            done += ret as usize;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        os::unix::io::IntoRawFd,
    };

    use super::ForkserverChannel;
    use crate::{os::pipes::Pipe, Error};

    /// Channel wired to fresh pipes, plus the supervisor-side ends.
    fn pipe_channel() -> (ForkserverChannel, Pipe, Pipe) {
        let mut ctl = Pipe::new().unwrap();
        let mut st = Pipe::new().unwrap();
        let chan = ForkserverChannel::from_raw_fds(
            ctl.take_read_end().unwrap().into_raw_fd(),
            st.take_write_end().unwrap().into_raw_fd(),
        );
        (chan, ctl, st)
    }

    #[test]
    fn test_handshake_and_frames() {
        let (mut chan, mut ctl, mut st) = pipe_channel();

        chan.handshake().unwrap();
        let mut buf = [0xFF_u8; 4];
        st.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0], "handshake must be four zero bytes");

        // supervisor says "go"
        ctl.write_all(&0_u32.to_ne_bytes()).unwrap();
        assert_eq!(chan.read_command().unwrap(), 0);

        chan.write_status(0xDEAD_u32).unwrap();
        st.read_exact(&mut buf).unwrap();
        assert_eq!(u32::from_ne_bytes(buf), 0xDEAD);

        chan.close().unwrap();
    }

    #[test]
    fn test_read_before_handshake() {
        let (mut chan, _ctl, _st) = pipe_channel();
        match chan.read_command() {
            Err(Error::IllegalState(..)) => {}
            other => panic!("expected IllegalState, got {other:?}"),
        }
        chan.close().unwrap();
    }

    #[test]
    fn test_peer_close_is_protocol_error() {
        let (mut chan, mut ctl, _st) = pipe_channel();
        chan.handshake().unwrap();

        // two bytes, then the supervisor goes away
        ctl.write_all(&[0xAB, 0xCD]).unwrap();
        ctl.close_write_end();
        match chan.read_command() {
            Err(Error::Protocol(..)) => {}
            other => panic!("expected Protocol error, got {other:?}"),
        }
        chan.close().unwrap();
    }

    #[test]
    fn test_clean_peer_close_is_protocol_error() {
        let (mut chan, mut ctl, _st) = pipe_channel();
        chan.handshake().unwrap();

        ctl.close_write_end();
        match chan.read_command() {
            Err(Error::Protocol(..)) => {}
            other => panic!("expected Protocol error on 0-byte read, got {other:?}"),
        }
        chan.close().unwrap();
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut chan, _ctl, _st) = pipe_channel();
        chan.handshake().unwrap();
        chan.close().unwrap();
        chan.close().unwrap();
        match chan.handshake() {
            Err(Error::IllegalState(..)) => {}
            other => panic!("expected IllegalState after close, got {other:?}"),
        }
    }
}
