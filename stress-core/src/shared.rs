// stress-core/src/shared.rs
// Shared memory region visible to the supervisor and every forked worker

use crate::error::*;
use crate::{MEM_CACHE_SIZE, PROCS_MAX};
use memmap2::MmapMut;
use std::cell::UnsafeCell;
use std::ffi::CString;
use std::fs::File;
use std::mem;
use std::os::fd::FromRawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use tracing::{debug, info};

#[repr(C, align(64))]
struct Align64<T>(T);

/// Run-wide flags shared across processes
#[repr(C)]
struct RunFlags {
    stop: AtomicU32,
    interrupted: AtomicU32,
    sem_ok: AtomicU32,
}

/// Fixed part of the region; the counters live in their own mapping
#[repr(C)]
struct ControlBlock {
    flags: Align64<RunFlags>,
    semaphore: Align64<UnsafeCell<libc::sem_t>>,
    cache: Align64<[AtomicU8; MEM_CACHE_SIZE]>,
    wait_words: Align64<[AtomicU32; PROCS_MAX]>,
    wait_deadlines: Align64<[AtomicU64; PROCS_MAX]>,
}

/// A MAP_SHARED mapping over an anonymous memfd
struct SharedMapping {
    _map: MmapMut,
    ptr: NonNull<u8>,
    len: usize,
}

impl SharedMapping {
    fn create(name: &str, len: usize) -> Result<Self> {
        let mapping_error = |source: std::io::Error| StressError::Mapping {
            what: name.to_string(),
            source,
        };

        let c_name = CString::new(name).map_err(|e| mapping_error(e.into()))?;
        let fd = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(mapping_error(std::io::Error::last_os_error()));
        }
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(len as u64).map_err(mapping_error)?;

        // MmapMut::map_mut maps MAP_SHARED, so forked children keep seeing the same pages
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(mapping_error)?;
        let ptr = NonNull::new(map.as_mut_ptr()).ok_or_else(|| {
            mapping_error(std::io::Error::from_raw_os_error(libc::EFAULT))
        })?;

        Ok(Self { _map: map, ptr, len })
    }
}

/// Memory shared by the supervisor and all workers of one run.
///
/// Holds the run/stop flag, the process-shared semaphore, the cache
/// buffer, `PROCS_MAX` wait words with their deadlines, and one bogo-op
/// counter per launched instance. Created once before the first fork and
/// never resized.
pub struct SharedRegion {
    control: SharedMapping,
    counters: SharedMapping,
    slots: usize,
    sem_name: String,
    owner: libc::pid_t,
}

// All cross-thread and cross-process access goes through atomics or the
// process-shared semaphore.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map a region with `slots` counter slots
    pub fn create(slots: usize) -> Result<Self> {
        if slots > PROCS_MAX {
            return Err(StressError::TooManyInstances {
                requested: slots,
                max: PROCS_MAX,
            });
        }
        let slots = slots.max(1);

        let control = SharedMapping::create("stress-control", mem::size_of::<ControlBlock>())?;
        let counters = SharedMapping::create("stress-counters", slots * mem::size_of::<AtomicU64>())?;
        let owner = unsafe { libc::getpid() };

        info!(
            "Shared region mapped: {} KiB control, {} counter slots",
            control.len / 1024,
            slots
        );

        Ok(Self {
            control,
            counters,
            slots,
            sem_name: format!("stress-sem-{owner}"),
            owner,
        })
    }

    fn block(&self) -> &ControlBlock {
        unsafe { &*(self.control.ptr.as_ptr() as *const ControlBlock) }
    }

    fn counter_cells(&self) -> &[AtomicU64] {
        unsafe {
            std::slice::from_raw_parts(self.counters.ptr.as_ptr() as *const AtomicU64, self.slots)
        }
    }

    /// Number of counter slots
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// The counter cell for a slot
    pub fn counter(&self, slot: usize) -> Result<&AtomicU64> {
        self.counter_cells().get(slot).ok_or(StressError::SlotOutOfRange {
            slot,
            slots: self.slots,
        })
    }

    /// Whole-word snapshot of a counter
    pub fn counter_value(&self, slot: usize) -> u64 {
        self.counter_cells()
            .get(slot)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Snapshot of every counter, indexed by slot
    pub fn snapshot_counters(&self) -> Vec<u64> {
        self.counter_cells()
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    /// Set the run/stop flag
    pub fn request_stop(&self, interrupted: bool) {
        let flags = &self.block().flags.0;
        if interrupted {
            flags.interrupted.store(1, Ordering::Release);
        }
        flags.stop.store(1, Ordering::Release);
        debug!("Stop flag set (interrupted: {})", interrupted);
    }

    /// Clear the run/stop flag between sequential batches
    pub fn reset_stop(&self) {
        self.block().flags.0.stop.store(0, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.block().flags.0.stop.load(Ordering::Acquire) != 0
    }

    pub fn was_interrupted(&self) -> bool {
        self.block().flags.0.interrupted.load(Ordering::Acquire) != 0
    }

    /// Scratch buffer for cache workloads; contents carry no meaning
    pub fn cache_buffer(&self) -> &[AtomicU8] {
        &self.block().cache.0
    }

    pub(crate) fn wait_word(&self, slot: usize) -> Result<&AtomicU32> {
        self.block().wait_words.0.get(slot).ok_or(StressError::SlotOutOfRange {
            slot,
            slots: PROCS_MAX,
        })
    }

    pub(crate) fn wait_deadline(&self, slot: usize) -> Result<&AtomicU64> {
        self.block()
            .wait_deadlines
            .0
            .get(slot)
            .ok_or(StressError::SlotOutOfRange {
                slot,
                slots: PROCS_MAX,
            })
    }

    pub(crate) fn sem_ptr(&self) -> *mut libc::sem_t {
        self.block().semaphore.0.get()
    }

    pub(crate) fn sem_name(&self) -> &str {
        &self.sem_name
    }

    pub(crate) fn set_sem_ok(&self, ok: bool) {
        self.block().flags.0.sem_ok.store(ok as u32, Ordering::Release);
    }

    pub(crate) fn sem_ok(&self) -> bool {
        self.block().flags.0.sem_ok.load(Ordering::Acquire) != 0
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // Only the creating process tears down the semaphore
        if self.sem_ok() && unsafe { libc::getpid() } == self.owner {
            unsafe { libc::sem_destroy(self.sem_ptr()) };
        }
        debug!("Shared region unmapped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_rejects_oversized_slot_count() {
        let result = SharedRegion::create(PROCS_MAX + 1);
        assert!(matches!(
            result,
            Err(StressError::TooManyInstances { requested, .. }) if requested == PROCS_MAX + 1
        ));
    }

    #[test]
    fn test_counters_start_zeroed() {
        let region = SharedRegion::create(8).unwrap();
        assert_eq!(region.slots(), 8);
        assert_eq!(region.snapshot_counters(), vec![0; 8]);
    }

    #[test]
    fn test_counter_round_trip() {
        let region = SharedRegion::create(4).unwrap();
        let cell = region.counter(2).unwrap();
        for _ in 0..37 {
            cell.store(cell.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
        }
        assert_eq!(region.counter_value(2), 37);
        assert_eq!(region.counter_value(3), 0);
    }

    #[test]
    fn test_counter_out_of_range() {
        let region = SharedRegion::create(2).unwrap();
        assert!(matches!(
            region.counter(2),
            Err(StressError::SlotOutOfRange { slot: 2, slots: 2 })
        ));
        assert_eq!(region.counter_value(99), 0);
    }

    #[test]
    fn test_stop_flags() {
        let region = SharedRegion::create(1).unwrap();
        assert!(!region.stop_requested());

        region.request_stop(false);
        assert!(region.stop_requested());
        assert!(!region.was_interrupted());

        region.reset_stop();
        assert!(!region.stop_requested());

        region.request_stop(true);
        assert!(region.stop_requested());
        assert!(region.was_interrupted());
    }

    #[test]
    fn test_zero_slots_still_maps_one() {
        let region = SharedRegion::create(0).unwrap();
        assert_eq!(region.slots(), 1);
    }

    #[test]
    fn test_cache_buffer_size_and_alignment() {
        let region = SharedRegion::create(1).unwrap();
        let cache = region.cache_buffer();
        assert_eq!(cache.len(), MEM_CACHE_SIZE);
        assert_eq!(cache.as_ptr() as usize % 64, 0);
    }
}
