//! The process-wide code arena.
//!
//! One reserved mapping serves every generated function, the appended
//! IC entries, and the shared constant data region, so that all
//! intra-program references stay within rel32 range of each other.
//! Allocation is bump-only; the arena lives for the process.

use crate::stencil::CodegenError;

/// Reserved arena size. Virtual reservation only; pages are touched as
/// code is written.
pub const ARENA_RESERVE: usize = 64 * 1024 * 1024;

pub struct CodeArena {
    base: *mut u8,
    cap: usize,
    used: usize,
}

// The VM is single-threaded; the arena singleton sits behind a Mutex
// and is only touched from the active thread.
unsafe impl Send for CodeArena {}

impl CodeArena {
    #[cfg(unix)]
    pub fn new() -> Result<Self, CodegenError> {
        // Read+write+execute in one mapping: patches to installed code
        // (IC chain growth) happen in place. MAP_JIT where required.
        #[cfg(target_os = "macos")]
        let flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT;
        #[cfg(not(target_os = "macos"))]
        let flags = libc::MAP_ANON | libc::MAP_PRIVATE;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                ARENA_RESERVE,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CodegenError::ArenaUnavailable);
        }
        Ok(CodeArena {
            base: ptr as *mut u8,
            cap: ARENA_RESERVE,
            used: 0,
        })
    }

    /// Non-unix fallback: plain heap memory. The stencil pipeline and
    /// patch passes remain fully testable; the result is never
    /// executed (attach() refuses to install the tier there).
    #[cfg(not(unix))]
    pub fn new() -> Result<Self, CodegenError> {
        let cap = ARENA_RESERVE / 16;
        let layout = std::alloc::Layout::from_size_align(cap, 16).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(CodegenError::ArenaUnavailable);
        }
        Ok(CodeArena {
            base: ptr,
            cap,
            used: 0,
        })
    }

    /// Bump-allocate a block, returning its absolute address.
    pub fn alloc(&mut self, size: usize, align: usize) -> Result<usize, CodegenError> {
        debug_assert!(align.is_power_of_two());
        let start = (self.used + align - 1) & !(align - 1);
        let end = start.checked_add(size).ok_or(CodegenError::ArenaExhausted)?;
        if end > self.cap {
            return Err(CodegenError::ArenaExhausted);
        }
        self.used = end;
        Ok(self.base as usize + start)
    }

    /// Copy an assembled image into the arena at `addr` (previously
    /// returned by `alloc`).
    ///
    /// # Safety
    /// `addr` must come from this arena's `alloc` with room for
    /// `bytes.len()` bytes.
    pub unsafe fn install(&mut self, addr: usize, bytes: &[u8]) {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
    }

    pub fn bytes_used(&self) -> usize {
        self.used
    }
}
