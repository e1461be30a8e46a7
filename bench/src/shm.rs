//! Shared coordination state for the multi-process run.
//!
//! The parent creates one POSIX shared-memory region before forking:
//! a header with a process-shared mutex + condition for the start
//! rendezvous, the atomic dispatch index, and the pre-generated key
//! table every participant draws from. Children inherit the mapping
//! (and the named completion semaphore) through fork, so nothing needs
//! to be re-attached. The names are fixed constants; one benchmark per
//! host at a time.

use std::io;
use std::mem;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use anyhow::{bail, Result};

pub const SHM_NAME: &[u8] = b"/bptree_bench_shm\0";
pub const SEM_NAME: &[u8] = b"/bptree_bench_done\0";

/// Fixed key slot, large enough for `benchmark_%08d`.
pub const KEY_CAP: usize = 64;

#[repr(C)]
pub struct KeyValue {
    pub len: u8,
    pub key: [u8; KEY_CAP],
    pub value: u64,
}

impl KeyValue {
    pub fn key(&self) -> &[u8] {
        &self.key[..self.len as usize]
    }
}

#[repr(C)]
pub struct BenchHeader {
    mutex: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
    /// Workers checked in and parked on the condition.
    pub ready_threads: AtomicU32,
    /// Flipped once by the parent to release every worker.
    start: AtomicU32,
    /// Dispatch cursor over the key table.
    pub index: AtomicU64,
    pub rounds: u64,
}

pub struct SharedRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: everything mutable behind the pointer is either atomic or a
// pthread primitive built with the process-shared attribute.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Creates and maps the region, sized for `rounds` keys, and
    /// initializes the process-shared primitives.
    pub fn create(rounds: usize) -> Result<SharedRegion> {
        let len = mem::size_of::<BenchHeader>() + rounds * mem::size_of::<KeyValue>();
        // SAFETY: plain POSIX shm + pthread-attr FFI; every return code
        // is checked before the memory is used.
        unsafe {
            // A crashed previous run may have left the name behind.
            let _ = libc::shm_unlink(SHM_NAME.as_ptr() as *const libc::c_char);
            let fd = libc::shm_open(
                SHM_NAME.as_ptr() as *const libc::c_char,
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            );
            if fd < 0 {
                bail!("shm_open: {}", io::Error::last_os_error());
            }
            if libc::ftruncate(fd, len as libc::off_t) != 0 {
                let e = io::Error::last_os_error();
                let _ = libc::close(fd);
                bail!("ftruncate: {}", e);
            }
            let ptr = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            let _ = libc::close(fd);
            if ptr == libc::MAP_FAILED {
                bail!("mmap: {}", io::Error::last_os_error());
            }

            let hdr = ptr as *mut BenchHeader;
            // The process-shared attribute is what lets forked
            // children block on these; the default is process-private.
            let mut mattr: libc::pthread_mutexattr_t = mem::zeroed();
            let _ = libc::pthread_mutexattr_init(&mut mattr);
            let _ = libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED);
            if libc::pthread_mutex_init(&mut (*hdr).mutex, &mattr) != 0 {
                bail!("pthread_mutex_init failed");
            }
            let _ = libc::pthread_mutexattr_destroy(&mut mattr);

            let mut cattr: libc::pthread_condattr_t = mem::zeroed();
            let _ = libc::pthread_condattr_init(&mut cattr);
            let _ = libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED);
            if libc::pthread_cond_init(&mut (*hdr).cond, &cattr) != 0 {
                bail!("pthread_cond_init failed");
            }
            let _ = libc::pthread_condattr_destroy(&mut cattr);

            (*hdr).rounds = rounds as u64;

            Ok(SharedRegion {
                ptr: ptr as *mut u8,
                len,
            })
        }
    }

    fn hdr(&self) -> *mut BenchHeader {
        self.ptr as *mut BenchHeader
    }

    pub fn header(&self) -> &BenchHeader {
        // SAFETY: the region outlives every borrower (workers join
        // before the parent unmaps).
        unsafe { &*self.hdr() }
    }

    pub fn kvs(&self) -> &[KeyValue] {
        let rounds = self.header().rounds as usize;
        // SAFETY: the table follows the header; `create` sized the
        // region for exactly `rounds` entries.
        unsafe {
            let base = self.ptr.add(mem::size_of::<BenchHeader>()) as *const KeyValue;
            slice::from_raw_parts(base, rounds)
        }
    }

    pub fn kvs_mut(&mut self) -> &mut [KeyValue] {
        let rounds = self.header().rounds as usize;
        // SAFETY: as above, plus `&mut self` (pre-fork only).
        unsafe {
            let base = self.ptr.add(mem::size_of::<BenchHeader>()) as *mut KeyValue;
            slice::from_raw_parts_mut(base, rounds)
        }
    }

    /// Worker half of the rendezvous: check in, park until released.
    pub fn ready_and_wait(&self) {
        // SAFETY: the primitives were built process-shared in `create`.
        unsafe {
            let h = self.hdr();
            let _ = libc::pthread_mutex_lock(&mut (*h).mutex);
            let _ = (*h).ready_threads.fetch_add(1, Ordering::SeqCst);
            while (*h).start.load(Ordering::SeqCst) == 0 {
                let _ = libc::pthread_cond_wait(&mut (*h).cond, &mut (*h).mutex);
            }
            let _ = libc::pthread_mutex_unlock(&mut (*h).mutex);
        }
    }

    /// Parent half: release every parked worker.
    pub fn release_workers(&self) {
        // SAFETY: as above.
        unsafe {
            let h = self.hdr();
            let _ = libc::pthread_mutex_lock(&mut (*h).mutex);
            (*h).start.store(1, Ordering::SeqCst);
            let _ = libc::pthread_cond_broadcast(&mut (*h).cond);
            let _ = libc::pthread_mutex_unlock(&mut (*h).mutex);
        }
    }

    /// Removes the name. The mapping itself lives until drop.
    pub fn unlink() {
        // SAFETY: plain unlink of a fixed name.
        unsafe {
            let _ = libc::shm_unlink(SHM_NAME.as_ptr() as *const libc::c_char);
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: exactly the mapping created in `create`.
        unsafe {
            let _ = libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// The named completion semaphore. Each worker posts once on exit; the
/// parent collects one post per worker.
pub struct DoneSem {
    sem: *mut libc::sem_t,
}

// SAFETY: sem_t operations are async-signal- and thread-safe.
unsafe impl Send for DoneSem {}
unsafe impl Sync for DoneSem {}

impl DoneSem {
    pub fn create() -> Result<DoneSem> {
        // SAFETY: checked sem_open of a fixed name.
        unsafe {
            let _ = libc::sem_unlink(SEM_NAME.as_ptr() as *const libc::c_char);
            let sem = libc::sem_open(
                SEM_NAME.as_ptr() as *const libc::c_char,
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::mode_t,
                0 as libc::c_uint,
            );
            if sem == libc::SEM_FAILED {
                bail!("sem_open: {}", io::Error::last_os_error());
            }
            Ok(DoneSem { sem })
        }
    }

    pub fn post(&self) {
        // SAFETY: valid semaphore from `create`, inherited over fork.
        unsafe {
            let _ = libc::sem_post(self.sem);
        }
    }

    pub fn wait(&self) {
        // SAFETY: as above; EINTR restarts the wait.
        unsafe {
            while libc::sem_wait(self.sem) != 0 {
                if io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
                    break;
                }
            }
        }
    }

    pub fn unlink() {
        // SAFETY: plain unlink of a fixed name.
        unsafe {
            let _ = libc::sem_unlink(SEM_NAME.as_ptr() as *const libc::c_char);
        }
    }
}

impl Drop for DoneSem {
    fn drop(&mut self) {
        // SAFETY: closes the handle, not the name.
        unsafe {
            let _ = libc::sem_close(self.sem);
        }
    }
}
