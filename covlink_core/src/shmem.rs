use crate::config::MAP_SIZE;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use thiserror::Error;

/// Errors raised while creating or attaching the shared coverage bitmap.
#[derive(Error, Debug)]
pub enum ShMemError {
    /// `shmget` failed while allocating a new SysV segment.
    #[error("shmget failed: {0}")]
    Allocate(std::io::Error),
    /// `shmat` failed for the given segment id.
    #[error("shmat failed for shm id {id}: {source}")]
    Attach { id: i32, source: std::io::Error },
    /// Anonymous shared mapping failed.
    #[error("anonymous shared mmap failed: {0}")]
    Map(nix::errno::Errno),
}

enum Backing {
    /// Attached SysV segment, detached with `shmdt` on drop.
    SysV,
    /// Anonymous `MAP_SHARED` mapping, unmapped on drop.
    Anonymous,
}

/// The shared coverage bitmap: `MAP_SIZE` byte-wide edge counters visible to
/// the controller process, the fork-server parent, and every forked child.
///
/// The map is deliberately unsynchronized. Counters may be bumped from
/// several threads of one process at once; a single-byte increment is treated
/// as effectively atomic because the consumer only needs "was this edge hit",
/// never an exact count.
pub struct SharedMap {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// The raw pointer targets memory shared across processes by construction;
// concurrent byte writes are part of the documented contract.
unsafe impl Send for SharedMap {}
unsafe impl Sync for SharedMap {}

impl SharedMap {
    /// Attaches the SysV segment the controller exported through the
    /// environment. The segment must be at least `MAP_SIZE` bytes.
    pub fn attach(shm_id: i32) -> Result<Self, ShMemError> {
        let ptr = unsafe { libc::shmat(shm_id, std::ptr::null(), 0) };
        if ptr as isize == -1 {
            return Err(ShMemError::Attach {
                id: shm_id,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(SharedMap {
            ptr: NonNull::new(ptr as *mut u8).expect("shmat returned a non-null mapping"),
            len: MAP_SIZE,
            backing: Backing::SysV,
        })
    }

    /// Allocates a fresh SysV segment and attaches it, returning the id to
    /// hand to the target process. Used by the controller side.
    ///
    /// The segment is marked for removal immediately. Linux still allows
    /// attaching a marked segment while it has attachments, and the mark
    /// guarantees cleanup even if the controller crashes.
    pub fn create() -> Result<(i32, Self), ShMemError> {
        let id = unsafe { libc::shmget(libc::IPC_PRIVATE, MAP_SIZE, libc::IPC_CREAT | 0o600) };
        if id < 0 {
            return Err(ShMemError::Allocate(std::io::Error::last_os_error()));
        }
        let map = Self::attach(id)?;
        unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };
        Ok((id, map))
    }

    /// Allocates an anonymous `MAP_SHARED` region. The mapping survives
    /// `fork`, so parent and children observe the same counters. Used by
    /// in-process harnesses and tests.
    pub fn anonymous() -> Result<Self, ShMemError> {
        let len = NonZeroUsize::new(MAP_SIZE).expect("MAP_SIZE is non-zero");
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
            .map_err(ShMemError::Map)?
        };
        Ok(SharedMap {
            ptr: ptr.cast(),
            len: MAP_SIZE,
            backing: Backing::Anonymous,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Increments the counter at `idx` (taken modulo the map length) with
    /// explicit wrap at 256. The wrap is load-bearing: lossy byte-wide
    /// counting is the accepted trade-off, not saturation.
    #[inline]
    pub fn bump(&self, idx: usize) {
        unsafe {
            let slot = self.ptr.as_ptr().add(idx & (self.len - 1));
            slot.write(slot.read().wrapping_add(1));
        }
    }

    /// Overwrites the counter at `idx` (taken modulo the map length).
    #[inline]
    pub fn set(&self, idx: usize, value: u8) {
        unsafe {
            self.ptr.as_ptr().add(idx & (self.len - 1)).write(value);
        }
    }

    /// Reads the counter at `idx` (taken modulo the map length).
    #[inline]
    pub fn get(&self, idx: usize) -> u8 {
        unsafe { self.ptr.as_ptr().add(idx & (self.len - 1)).read() }
    }

    /// Copies the current counters out for inspection. A snapshot rather
    /// than a borrow, since another process may be writing concurrently.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), out.as_mut_ptr(), self.len);
        }
        out
    }

    /// Number of non-zero counters, i.e. distinct edges hit so far.
    pub fn count_nonzero(&self) -> usize {
        self.snapshot().iter().filter(|&&b| b != 0).count()
    }

    /// Zeroes every counter. The controller does this between iterations.
    pub fn clear(&self) {
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.len);
        }
    }
}

impl Drop for SharedMap {
    fn drop(&mut self) {
        match self.backing {
            Backing::SysV => unsafe {
                libc::shmdt(self.ptr.as_ptr() as *const c_void);
            },
            Backing::Anonymous => unsafe {
                let _ = munmap(self.ptr.cast::<c_void>(), self.len);
            },
        }
    }
}
