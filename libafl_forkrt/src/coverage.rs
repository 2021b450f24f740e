//! The edge coverage map shared with the fuzzer

use core::{fmt, mem::ManuallyDrop, ptr::NonNull};

use libafl_bolts::shmem::{ShMem, ShMemId, ShMemProvider, UnixShMemProvider};

use crate::Error;

/// Log2 of [`MAP_SIZE`].
pub const MAP_SIZE_POW2: u32 = 16;
/// The map size for the edges map. Must match the fuzzer, which never tells us.
pub const MAP_SIZE: usize = 1 << MAP_SIZE_POW2;

/// The byte map the fuzzer reads after every run.
///
/// A `CoverageMap` is a handle, copying it does not copy the cells. Cells are
/// written with plain stores: one process has exactly one writer, and the
/// fuzzer only reads the map after it has seen the child's exit status.
#[derive(Clone, Copy)]
pub struct CoverageMap {
    map: NonNull<u8>,
}

// Single writer per process, see the type docs.
unsafe impl Send for CoverageMap {}
unsafe impl Sync for CoverageMap {}

impl CoverageMap {
    /// Attach the fuzzer's map with the given id.
    ///
    /// The mapping lives until the process exits, and forked children share it.
    pub fn attach(id: ShMemId) -> Result<Self, Error> {
        let mut shmem_provider = UnixShMemProvider::new()?;
        let shmem = shmem_provider.shmem_from_id_and_size(id, MAP_SIZE)?;
        Self::from_shmem(shmem)
    }

    /// Use an already mapped segment as coverage map.
    ///
    /// The segment is leaked: dropping a [`ShMem`] may unmap it, or even
    /// remove it while the fuzzer still owns it.
    pub fn from_shmem<SHM: ShMem>(shmem: SHM) -> Result<Self, Error> {
        if shmem.len() < MAP_SIZE {
            return Err(Error::illegal_argument(format!(
                "shared map of {} bytes is smaller than {MAP_SIZE}",
                shmem.len()
            )));
        }
        let mut manually_dropped = ManuallyDrop::new(shmem);
        NonNull::new(manually_dropped.as_mut_ptr())
            .map(|map| Self { map })
            .ok_or_else(|| Error::illegal_state("shared map is mapped at null"))
    }

    /// A map on the heap of this process, to run instrumented code without a
    /// fuzzer and look at the result. It is leaked.
    #[must_use]
    pub fn in_process() -> Self {
        let cells: &'static mut [u8] = Box::leak(vec![0u8; MAP_SIZE].into_boxed_slice());
        Self {
            map: NonNull::from(cells).cast(),
        }
    }

    /// Bump the hit count of `offset`, wrapping at 255.
    #[inline]
    pub fn increment(&self, offset: usize) {
        unsafe {
            let cell = self.map.as_ptr().add(offset & (MAP_SIZE - 1));
            *cell = (*cell).wrapping_add(1);
        }
    }

    /// The first cell, for hooks that cannot afford a function call
    #[must_use]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.map.as_ptr()
    }

    /// Read a single cell
    #[must_use]
    pub fn get(&self, offset: usize) -> u8 {
        unsafe { *self.map.as_ptr().add(offset & (MAP_SIZE - 1)) }
    }

    /// Copy the current cells out.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        unsafe { core::slice::from_raw_parts(self.map.as_ptr(), MAP_SIZE) }.to_vec()
    }

    /// Zero every cell.
    pub fn clear(&self) {
        unsafe { core::ptr::write_bytes(self.map.as_ptr(), 0, MAP_SIZE) }
    }

    /// Always [`MAP_SIZE`]
    #[must_use]
    #[allow(clippy::unused_self)]
    pub fn len(&self) -> usize {
        MAP_SIZE
    }

    /// Never empty
    #[must_use]
    #[allow(clippy::unused_self)]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Debug for CoverageMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoverageMap")
            .field("map", &self.map)
            .field("size", &MAP_SIZE)
            .finish()
    }
}
