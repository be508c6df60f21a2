//! The aligned page allocator collaborator.
//!
//! Arenas and the buddy allocator do not talk to the operating system
//! directly: they go through a `PageAllocator`, so that tests (and
//! alternative hosts) can swap in a different source of pages.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Mutex;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_range_map;

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to find page_size");
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Reserves `size` bytes of address space with no read/write access.
fn reserve_region(size: usize) -> Result<NonNull<u8>, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ret == libc::MAP_FAILED {
        return Err(errno());
    }

    Ok(NonNull::new(ret as *mut u8).expect("mmap must not return null on success"))
}

/// Releases a region of `size` bytes starting at `base`.
fn release_region(base: NonNull<u8>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, size) };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Backs an already-reserved region with zero-filled, read/write
/// anonymous memory.
fn commit_anonymous_region(base: NonNull<u8>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe {
        libc::mprotect(
            base.as_ptr() as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Backs an already-reserved region with a shared mapping of `file`,
/// starting at `offset` in the file.
fn commit_file_region(file: &File, base: NonNull<u8>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    let ret = unsafe {
        libc::mmap(
            base.as_ptr() as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            file.as_raw_fd(),
            0,
        )
    };

    if ret == libc::MAP_FAILED {
        return Err(errno());
    }

    Ok(())
}

#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub trait PageAllocator: std::fmt::Debug + Sync {
    /// Returns the mapping granularity for this allocator.  All
    /// addresses and sizes passed to `commit`/`release` must be a
    /// multiple of this value.
    #[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
    fn page_size(&self) -> usize;

    /// Reserves `size` bytes of address space, with no read or write
    /// access yet.  `size` must be a multiple of `page_size()`.
    #[requires(size > 0)]
    #[requires(size % self.page_size() == 0)]
    #[ensures(ret.is_ok() -> debug_range_map::reserve_range(ret.unwrap().as_ptr() as usize, size).is_ok())]
    fn reserve(&self, size: usize) -> Result<NonNull<u8>, i32>;

    /// Makes `size` bytes starting at `base` readable and writable,
    /// zero-filled.  `base` and `size` must have been obtained from a
    /// single `reserve` call (or a subrange thereof).
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    #[ensures(ret.is_ok() -> debug_range_map::mark_committed(base.as_ptr() as usize, size).is_ok())]
    fn commit(&self, base: NonNull<u8>, size: usize) -> Result<(), i32>;

    /// Releases a range of address space previously obtained from
    /// `reserve`.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    #[ensures(ret.is_ok() -> debug_range_map::release_range(base.as_ptr() as usize, size).is_ok())]
    fn release(&self, base: NonNull<u8>, size: usize) -> Result<(), i32>;
}

/// The default allocator: anonymous, demand-paged memory straight
/// from the kernel.
#[derive(Debug, Default)]
pub struct OsPageAllocator {}

#[contract_trait]
impl PageAllocator for OsPageAllocator {
    fn page_size(&self) -> usize {
        crate::page::page_size()
    }

    fn reserve(&self, size: usize) -> Result<NonNull<u8>, i32> {
        reserve_region(size)
    }

    fn commit(&self, base: NonNull<u8>, size: usize) -> Result<(), i32> {
        commit_anonymous_region(base, size)
    }

    fn release(&self, base: NonNull<u8>, size: usize) -> Result<(), i32> {
        release_region(base, size)
    }
}

/// Backs committed ranges with private temporary files instead of
/// anonymous memory, so the operating system can eagerly swap out
/// cold pages under memory pressure.
#[derive(Debug, Default)]
pub struct FileBackedPageAllocator {}

lazy_static::lazy_static! {
    static ref FILE_BACKED_DIRECTORY: Mutex<Option<PathBuf>> = Default::default();
}

/// Updates the parent directory used for the file-backed allocator's
/// temporary files.
pub fn set_file_backed_directory(path: Option<PathBuf>) {
    let mut global_path = FILE_BACKED_DIRECTORY.lock().unwrap();

    *global_path = path;
}

fn get_temp_file(size: usize) -> Result<File, i32> {
    let path = FILE_BACKED_DIRECTORY.lock().unwrap();

    let file = match &*path {
        Some(dir) => tempfile::tempfile_in(dir),
        None => tempfile::tempfile(),
    }
    .map_err(|e| e.raw_os_error().unwrap_or(0))?;

    if unsafe { libc::ftruncate(file.as_raw_fd(), size as libc::off_t) } != 0 {
        return Err(errno());
    }

    Ok(file)
}

#[contract_trait]
impl PageAllocator for FileBackedPageAllocator {
    fn page_size(&self) -> usize {
        crate::page::page_size()
    }

    fn reserve(&self, size: usize) -> Result<NonNull<u8>, i32> {
        reserve_region(size)
    }

    fn commit(&self, base: NonNull<u8>, size: usize) -> Result<(), i32> {
        let file = get_temp_file(size)?;

        commit_file_region(&file, base, size)
    }

    fn release(&self, base: NonNull<u8>, size: usize) -> Result<(), i32> {
        release_region(base, size)
    }
}

lazy_static::lazy_static! {
    static ref DEFAULT_PAGE_ALLOCATOR: OsPageAllocator = OsPageAllocator::default();
}

/// Returns the process-wide default page allocator.
pub fn default_page_allocator() -> &'static dyn PageAllocator {
    &*DEFAULT_PAGE_ALLOCATOR
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_page_size() {
        assert_ne!(page_size(), 0);
        assert_eq!(page_size(), 4096);
    }

    #[test]
    fn smoke_test_os_allocator() {
        let alloc = OsPageAllocator::default();
        let size = 4 * page_size();

        let base = alloc.reserve(size).expect("reserve should succeed");
        alloc
            .commit(base, page_size())
            .expect("should commit first page");

        unsafe {
            *base.as_ptr() = 42;
            assert_eq!(*base.as_ptr(), 42);
        }

        alloc.release(base, size).expect("should release everything");
    }

    #[test]
    fn smoke_test_file_backed_allocator() {
        let alloc = FileBackedPageAllocator::default();
        let size = 2 * page_size();

        let base = alloc.reserve(size).expect("reserve should succeed");
        alloc.commit(base, size).expect("should commit");

        unsafe {
            *base.as_ptr() = 7;
            assert_eq!(*base.as_ptr(), 7);
        }

        alloc.release(base, size).expect("should release everything");
    }
}
