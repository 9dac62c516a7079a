//! The per-process instrumentation context.
//!
//! One target process gets exactly one [`AflRuntime`], owned by the host
//! harness and threaded through every instrumentation call. The
//! single-instance assumption comes from "one target process per run", not
//! from global mutability: there are no process-wide statics here.

use std::panic::{catch_unwind, UnwindSafe};

use crate::{
    coverage::CoverageRecorder,
    forkserver::ForkserverChannel,
    os::{self, raise_crash},
    shmem::AflShMem,
    Error,
};

/// Instrumentation context for one fuzzed process.
///
/// Typical harness flow: [`Self::init_coverage`] once after all expensive,
/// test-case independent setup, then [`Self::record_edge`] from every
/// instrumented call site. In persistent mode, additionally
/// [`Self::handshake`] and the [`Self::read_command`] /
/// [`Self::write_status`] cycle around the harness's own fork+exec+wait
/// loop. Any fork must happen after `init_coverage`, so children inherit
/// the attached mapping.
#[derive(Debug, Default)]
pub struct AflRuntime {
    recorder: Option<CoverageRecorder<AflShMem>>,
    channel: ForkserverChannel,
}

impl AflRuntime {
    /// A fresh, unattached runtime
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to the coverage map announced in the environment.
    ///
    /// Fails with [`Error::IllegalState`] on a second call,
    /// [`Error::Config`] when no segment id is in the environment and
    /// [`Error::OsError`] when mapping it fails. Until this succeeds the
    /// runtime is provably uninitialized, never half-configured.
    pub fn init_coverage(&mut self) -> Result<(), Error> {
        if self.recorder.is_some() {
            return Err(Error::illegal_state("Coverage map already attached"));
        }
        let map = AflShMem::from_env()?;
        self.recorder = Some(CoverageRecorder::new(map));
        log::debug!("Coverage recording initialized");
        Ok(())
    }

    /// Whether [`Self::init_coverage`] has succeeded
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.recorder.is_some()
    }

    /// Record one executed code site into the shared map.
    ///
    /// Fails with [`Error::IllegalState`] before [`Self::init_coverage`];
    /// silently skipping the update would corrupt the supervisor's feedback
    /// signal.
    pub fn record_edge(&mut self, key: &str, offset: u64) -> Result<(), Error> {
        match &mut self.recorder {
            Some(recorder) => {
                recorder.record(key, offset);
                Ok(())
            }
            None => Err(Error::illegal_state(
                "Coverage map not attached, call init_coverage first",
            )),
        }
    }

    /// Forget the previous-location history, e.g. between test cases
    pub fn reset_edge_history(&mut self) -> Result<(), Error> {
        match &mut self.recorder {
            Some(recorder) => {
                recorder.reset();
                Ok(())
            }
            None => Err(Error::illegal_state(
                "Coverage map not attached, call init_coverage first",
            )),
        }
    }

    /// Announce forkserver readiness to the supervisor
    pub fn handshake(&mut self) -> Result<(), Error> {
        self.channel.handshake()
    }

    /// Read the next supervisor command frame
    pub fn read_command(&mut self) -> Result<u32, Error> {
        self.channel.read_command()
    }

    /// Send a status frame (child pid or wait status) to the supervisor
    pub fn write_status(&mut self, value: u32) -> Result<(), Error> {
        self.channel.write_status(value)
    }

    /// Close the forkserver descriptors and fall back to single-shot mode
    pub fn close_channel(&mut self) -> Result<(), Error> {
        self.channel.close()
    }

    /// End the process immediately, see [`os::terminate`]
    pub fn terminate(&self, code: i32) -> ! {
        os::terminate(code)
    }
}

/// Run `f`, turning a panic into a crash the supervisor records.
///
/// The counterpart of rescuing every exception in an interpreted harness:
/// the panic is caught, `SIGUSR1` is raised, and `None` is returned should
/// the process live on (e.g. when the signal is blocked in a bare test
/// environment).
pub fn with_panics_as_crashes<F, R>(f: F) -> Option<R>
where
    F: FnOnce() -> R + UnwindSafe,
{
    match catch_unwind(f) {
        Ok(val) => Some(val),
        Err(_) => {
            log::debug!("Panic in harness, raising crash signal");
            let _ = raise_crash();
            None
        }
    }
}
