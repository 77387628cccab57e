use std::ptr;

use crate::CodegenError;

/// Default reservation: 64MB virtual address space.
const DEFAULT_RESERVE: usize = 64 * 1024 * 1024;

/// Initial committed region: 64KB.
const INITIAL_COMMIT: usize = 64 * 1024;

/// Executable memory buffer for JIT-compiled code.
///
/// Uses a reservation model: reserves a large virtual address range via
/// mmap with PROT_NONE (free — no physical pages), then commits pages on
/// demand as code is copied in.
///
/// Lifecycle:
/// 1. `new(size)` — reserves virtual address space, commits initial pages
/// 2. `emit(bytes)` — appends encoded x86-64 bytes (auto-grows committed region)
/// 3. `finalize()` — flips committed pages to read+execute
/// 4. `entry()` — returns a pointer to the start of emitted code
///
/// A guard page at the end of the reserved region catches overflows.
/// The buffer is unmapped on drop. x86-64 has a coherent instruction
/// cache, so no cache maintenance is needed after the protection flip.
#[derive(Debug)]
pub struct CodeBuffer {
    base: *mut u8,
    /// Total mmap'd size (reserved + guard page).
    reserved: usize,
    /// Bytes currently committed (RW). Always page-aligned.
    committed: usize,
    /// Bytes emitted so far.
    len: usize,
    finalized: bool,
}

// CodeBuffer holds a raw mmap'd pointer — safe to send across threads
// since we never alias it.
unsafe impl Send for CodeBuffer {}
unsafe impl Sync for CodeBuffer {}

impl CodeBuffer {
    /// Allocate a code buffer with at least `min_size` bytes initially committed.
    ///
    /// Reserves 64MB of virtual address space (costs no physical memory),
    /// then commits enough pages to hold `min_size` bytes. A guard page
    /// (PROT_NONE) sits at the end of the reserved region.
    pub fn new(min_size: usize) -> Result<Self, CodegenError> {
        let page_size = page_size();
        let initial_commit = align_up(min_size.max(INITIAL_COMMIT), page_size);
        let reserve = align_up(DEFAULT_RESERVE.max(initial_commit), page_size);
        let total = reserve + page_size; // + guard page

        // Reserve entire range as PROT_NONE (no physical pages).
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(CodegenError::OutOfMemory("code buffer mmap failed".into()));
        }

        // Commit the initial region as writable.
        let ret =
            unsafe { libc::mprotect(base, initial_commit, libc::PROT_READ | libc::PROT_WRITE) };
        if ret != 0 {
            unsafe { libc::munmap(base, total) };
            return Err(CodegenError::OutOfMemory(
                "code buffer mprotect (RW) failed".into(),
            ));
        }

        Ok(CodeBuffer {
            base: base as *mut u8,
            reserved: total,
            committed: initial_commit,
            len: 0,
            finalized: false,
        })
    }

    /// Append a slice of encoded instruction bytes.
    ///
    /// Automatically commits more pages if needed.
    pub fn emit(&mut self, bytes: &[u8]) {
        debug_assert!(!self.finalized, "cannot emit after finalize");
        self.ensure_capacity(bytes.len());
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(self.len), bytes.len());
        }
        self.len += bytes.len();
    }

    /// Flip the buffer to read+execute.
    pub fn finalize(&mut self) -> Result<(), CodegenError> {
        debug_assert!(!self.finalized, "already finalized");

        let ret = unsafe {
            libc::mprotect(
                self.base as *mut libc::c_void,
                self.committed,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if ret != 0 {
            return Err(CodegenError::OutOfMemory(
                "code buffer mprotect (RX) failed".into(),
            ));
        }

        self.finalized = true;
        Ok(())
    }

    /// Pointer to the start of emitted code. Only valid after `finalize()`.
    pub fn entry(&self) -> *const u8 {
        debug_assert!(self.finalized, "must finalize before calling entry()");
        self.base as *const u8
    }

    /// Number of bytes emitted so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Commit more pages if `additional` bytes would exceed the committed region.
    fn ensure_capacity(&mut self, additional: usize) {
        let needed = self.len + additional;
        if needed <= self.committed {
            return;
        }

        let page_size = page_size();
        // Guard page sits at reserved - page_size.
        let max_commit = self.reserved - page_size;

        // Double committed size until it covers the need.
        let mut new_committed = self.committed;
        while new_committed < needed {
            new_committed = new_committed.saturating_mul(2);
        }
        new_committed = align_up(new_committed, page_size).min(max_commit);

        assert!(
            needed <= new_committed,
            "code buffer exhausted: need {needed} bytes, max {max_commit}"
        );

        // Commit the new pages (from old committed to new committed).
        let ret = unsafe {
            libc::mprotect(
                self.base.add(self.committed) as *mut libc::c_void,
                new_committed - self.committed,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        assert!(ret == 0, "code buffer grow mprotect failed");

        self.committed = new_committed;
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.reserved);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}
