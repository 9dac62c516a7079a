//! Attach to the supervisor-owned `SysV` shared memory coverage segment.
//!
//! The fuzzing supervisor creates the segment before the target starts and
//! announces its id through [`AFL_SHM_ENV_VAR`]. The target only ever
//! *attaches*; ownership (and `IPC_RMID`) stays with the supervisor.

use core::{
    ops::{Deref, DerefMut},
    ptr, slice,
};
use std::env;

use libc::{c_uchar, shmat, shmdt};

use crate::Error;

/// The environment variable holding the decimal id of the coverage segment.
/// Must stay in sync with the supervisor.
pub const AFL_SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// Power of two size of the coverage map
pub const MAP_SIZE_POW2: usize = 16;
/// The size of the coverage map in bytes. A wire contract with the
/// supervisor: any other size is a protocol violation we cannot detect
/// locally.
pub const MAP_SIZE: usize = 1 << MAP_SIZE_POW2;

/// A coverage map attached from an existing `SysV` shared memory segment,
/// using `shmat`.
///
/// Derefs to the raw `[u8]` of [`MAP_SIZE`] wrapping 8-bit counters.
/// Forked children inherit the mapping and increment without
/// synchronization.
#[derive(Debug)]
pub struct AflShMem {
    id: i32,
    map: *mut u8,
}

impl AflShMem {
    /// Attach to the segment whose decimal id is in [`AFL_SHM_ENV_VAR`].
    ///
    /// Fails with [`Error::Config`] when the variable is unset or not a
    /// decimal integer, with [`Error::OsError`] when `shmat` refuses the id.
    pub fn from_env() -> Result<Self, Error> {
        let id_str = env::var(AFL_SHM_ENV_VAR).map_err(|_| {
            Error::config(format!(
                "No shared memory segment specified. {AFL_SHM_ENV_VAR} is not set. Are we actually running under a fuzzer?"
            ))
        })?;
        let id: i32 = id_str.parse()?;
        Self::from_id(id)
    }

    /// Attach to the existing segment identified by `id`
    pub fn from_id(id: i32) -> Result<Self, Error> {
        // # Safety
        // shmat with a null addr lets the kernel pick the mapping address.
        let map = unsafe { shmat(id, ptr::null(), 0) } as *mut c_uchar;

        if map as isize == -1 || map.is_null() {
            return Err(Error::last_os_error(format!(
                "Failed to map the shared mapping with id {id}"
            )));
        }

        log::debug!("Attached coverage map, shm id {id}");
        Ok(Self { id, map })
    }

    /// The `SysV` id this map was attached from
    #[must_use]
    pub fn id(&self) -> i32 {
        self.id
    }
}

impl Deref for AflShMem {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.map, MAP_SIZE) }
    }
}

impl DerefMut for AflShMem {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.map, MAP_SIZE) }
    }
}

/// Detaches the mapping. The segment itself belongs to the supervisor and is
/// left alone.
impl Drop for AflShMem {
    fn drop(&mut self) {
        unsafe {
            shmdt(self.map as *mut _);
        }
    }
}
