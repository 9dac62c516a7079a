//! Operating System specific primitives for the instrumented target

use nix::sys::signal::{raise, Signal};

use crate::Error;

pub mod pipes;

/// End the process right now, skipping destructors, exit handlers and
/// unwinding.
///
/// Once the supervisor considers an iteration finished, any further work in
/// this process would only smear misleading coverage into the shared map, so
/// the one thing done before `_exit` is flushing the registered [`log`]
/// logger. Never returns.
pub fn terminate(code: i32) -> ! {
    log::logger().flush();
    unsafe { libc::_exit(code) }
}

/// Report this iteration as a crash by raising `SIGUSR1` against the current
/// process, the signal supervisors book as a crash without a core dump.
pub fn raise_crash() -> Result<(), Error> {
    raise(Signal::SIGUSR1)?;
    Ok(())
}
