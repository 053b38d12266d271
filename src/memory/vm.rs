use std::alloc::Layout;
use std::io;
use std::ptr::NonNull;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] io::Error),
}

/// Abstract interface for the address-space reservation primitive.
///
/// Chunk sources only ever ask for one large range up front; there is no
/// commit/decommit cycle because chunks are never handed back to the OS.
pub(crate) trait VmOps {
    /// Reserve `size` bytes of readable, writable address space.
    ///
    /// `align` is a hint: implementations that can honour it return a
    /// pointer aligned to it, others return page-aligned memory and leave
    /// the caller to absorb the slack.
    unsafe fn reserve(size: usize, align: usize) -> Result<NonNull<u8>, VmError>;

    /// Release a range obtained from `reserve` with the same `size`/`align`.
    unsafe fn release(ptr: NonNull<u8>, size: usize, align: usize) -> Result<(), VmError>;
}

/// The real OS primitive. Backs the one process reservation.
pub(crate) struct PlatformVmOps;

/// Heap-backed primitive. Backs scratch reservations and stands in for
/// [`PlatformVmOps`] under loom/Miri, where no real mmap can be issued.
pub(crate) struct HeapVmOps;

const HEAP_PAGE_SIZE: usize = 4096;

impl HeapVmOps {
    fn layout(size: usize, align: usize) -> Result<Layout, io::Error> {
        Layout::from_size_align(size, align.max(HEAP_PAGE_SIZE)).map_err(io::Error::other)
    }
}

impl VmOps for HeapVmOps {
    unsafe fn reserve(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = Self::layout(size, align).map_err(VmError::ReservationFailed)?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize, align: usize) -> Result<(), VmError> {
        let layout = Self::layout(size, align).map_err(VmError::ReleaseFailed)?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }
}

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize, _align: usize) -> Result<NonNull<u8>, VmError> {
            // Physical pages are only materialised on first touch, so a
            // multi-GiB reservation costs address space and nothing else.
            #[cfg(target_os = "linux")]
            let flags = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE;
            #[cfg(not(target_os = "linux"))]
            let flags = libc::MAP_PRIVATE | libc::MAP_ANON;

            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    flags,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize, _align: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// loom / Miri / non-unix: heap-backed PlatformVmOps
//
// Under `cfg(loom)` we cannot issue real VM syscalls, and Miri cannot model
// mmap. Every "reservation" is a plain heap allocation instead; this is
// sufficient for exercising the bookkeeping, which never depends on page
// faults.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(unix)))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: forwarded contract.
        unsafe { HeapVmOps::reserve(size, align) }
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize, align: usize) -> Result<(), VmError> {
        // Safety: forwarded contract.
        unsafe { HeapVmOps::release(ptr, size, align) }
    }
}
