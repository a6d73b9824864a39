//! Fiber stack memory
//!
//! Each fiber owns an anonymous mmap'd region with a PROT_NONE guard page
//! at the low end, so an overflow faults instead of silently corrupting a
//! neighboring allocation. Stacks grow down from `top()`.

use strand_core::error::{MemoryError, SchedResult};

const PAGE_SIZE: usize = 4096;

/// Largest stack we will hand out (1 GiB of virtual space).
const MAX_STACK_SIZE: usize = 1 << 30;

/// An owned, guard-paged fiber stack.
pub struct FiberStack {
    /// Mapping base, guard page included
    base: *mut u8,
    /// Total mapping length, guard page included
    total: usize,
}

// The mapping is owned exclusively by one fiber; the runtime guarantees a
// single thread executes on it at a time.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Map a stack with at least `size` usable bytes.
    pub fn alloc(size: usize) -> SchedResult<Self> {
        if size < PAGE_SIZE || size > MAX_STACK_SIZE {
            return Err(MemoryError::BadSize(size).into());
        }
        let usable = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let total = usable + PAGE_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed.into());
        }

        // Guard page at the low end; remains unmapped-equivalent for the
        // lifetime of the stack.
        let ret = unsafe { libc::mprotect(base, PAGE_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            unsafe { libc::munmap(base, total) };
            return Err(MemoryError::ProtectionFailed.into());
        }

        Ok(Self {
            base: base as *mut u8,
            total,
        })
    }

    /// High end of the stack; the initial stack pointer.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes (excludes the guard page).
    #[inline]
    pub fn size(&self) -> usize {
        self.total - PAGE_SIZE
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_use() {
        let stack = FiberStack::alloc(64 * 1024).unwrap();
        assert_eq!(stack.size(), 64 * 1024);

        // The usable region is writable right up to the top.
        unsafe {
            let top = stack.top();
            *top.sub(1) = 0xAB;
            *top.sub(stack.size()) = 0xCD;
            assert_eq!(*top.sub(1), 0xAB);
        }
    }

    #[test]
    fn test_size_rounds_to_page() {
        let stack = FiberStack::alloc(4097).unwrap();
        assert_eq!(stack.size(), 8192);
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert!(FiberStack::alloc(0).is_err());
        assert!(FiberStack::alloc(100).is_err());
        assert!(FiberStack::alloc(MAX_STACK_SIZE + 1).is_err());
    }
}
