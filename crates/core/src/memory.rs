//! Guarded access to foreign memory
//!
//! Target pages can be unmapped or reprotected by the host program at any
//! moment, so every read of hooked code goes through a probe of the OS
//! mapping first and fails closed. Writes happen only inside a scoped
//! protection change that is rolled back on every path.

use crate::error::{EngineError, EngineResult};

/// Copy `buf.len()` bytes from `addr`, verifying first that the whole
/// range is mapped and readable. Returns `false` on any doubt.
pub fn try_read_bytes(addr: usize, buf: &mut [u8]) -> bool {
    if addr == 0 || buf.is_empty() {
        return false;
    }
    if !range_is(addr, buf.len(), |r| r.is_readable()) {
        return false;
    }
    unsafe {
        std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len());
    }
    true
}

/// Read one machine word, guarded as `try_read_bytes`.
pub fn try_read_word(addr: usize) -> Option<usize> {
    let mut buf = [0u8; std::mem::size_of::<usize>()];
    if try_read_bytes(addr, &mut buf) {
        Some(usize::from_ne_bytes(buf))
    } else {
        None
    }
}

/// Compare memory at `addr` against `expected`.
///
/// Returns `true` only when the bytes are readable *and* differ; an
/// unreadable range is reported as "no change" so a racing unmap never
/// produces a spurious overwrite report.
pub fn is_memory_diff(addr: usize, expected: &[u8]) -> bool {
    let mut current = [0u8; 32];
    if expected.len() > current.len() {
        return false;
    }
    let current = &mut current[..expected.len()];
    if !try_read_bytes(addr, current) {
        return false;
    }
    current != expected
}

/// Copy `bytes` to `addr` if the range is mapped and writable.
/// Expected to run inside a [`ProtectGuard`] scope.
pub fn try_write_bytes(addr: usize, bytes: &[u8]) -> bool {
    if addr == 0 || bytes.is_empty() {
        return false;
    }
    if !range_is(addr, bytes.len(), |r| r.is_writable()) {
        return false;
    }
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
    }
    true
}

fn range_is(addr: usize, len: usize, pred: impl Fn(&region::Region) -> bool) -> bool {
    let iter = match unsafe { region::query_range(addr as *const u8, len) } {
        Ok(iter) => iter,
        Err(_) => return false,
    };
    // The regions must tile [addr, addr + len) without gaps.
    let mut cursor = addr;
    for item in iter {
        let r = match item {
            Ok(r) if r.is_committed() && pred(&r) => r,
            _ => return false,
        };
        let range = r.as_range();
        if range.start > cursor {
            return false;
        }
        cursor = cursor.max(range.end);
        if cursor >= addr + len {
            return true;
        }
    }
    cursor >= addr + len
}

/// Scoped page-protection change; the original protection comes back
/// when the guard drops, whether or not the write succeeded.
pub struct PatchGuard {
    _inner: region::ProtectGuard,
}

impl PatchGuard {
    /// Make `[addr, addr+len)` writable and executable for the lifetime
    /// of the guard.
    pub fn unprotect(addr: usize, len: usize) -> EngineResult<Self> {
        let inner = unsafe {
            region::protect_with_handle(
                addr as *const u8,
                len,
                region::Protection::READ_WRITE_EXECUTE,
            )
        }
        .map_err(|e| EngineError::ProtectFailed(e.to_string()))?;
        Ok(Self { _inner: inner })
    }
}

/// Flush the instruction cache after rewriting code bytes.
#[cfg(windows)]
pub fn flush_instruction_cache(addr: usize, len: usize) {
    use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows::Win32::System::Threading::GetCurrentProcess;
    unsafe {
        let _ = FlushInstructionCache(GetCurrentProcess(), Some(addr as *const _), len);
    }
}

/// x86 keeps data and instruction views coherent; nothing to do.
#[cfg(not(windows))]
pub fn flush_instruction_cache(_addr: usize, _len: usize) {}

/// OS last-error value of the current thread.
#[cfg(windows)]
pub fn last_os_error() -> u32 {
    unsafe { windows::Win32::Foundation::GetLastError().0 }
}

#[cfg(windows)]
pub fn set_last_os_error(value: u32) {
    unsafe { windows::Win32::Foundation::SetLastError(windows::Win32::Foundation::WIN32_ERROR(value)) }
}

#[cfg(all(unix, target_os = "linux"))]
pub fn last_os_error() -> u32 {
    unsafe { *libc::__errno_location() as u32 }
}

#[cfg(all(unix, target_os = "linux"))]
pub fn set_last_os_error(value: u32) {
    unsafe { *libc::__errno_location() = value as i32 }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn last_os_error() -> u32 {
    unsafe { *libc::__error() as u32 }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn set_last_os_error(value: u32) {
    unsafe { *libc::__error() = value as i32 }
}
