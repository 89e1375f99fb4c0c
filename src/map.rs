//! Rust bindings for the support code in C that calls out to mmap.
//!
//! All failures are reported as the raw `errno`.
use std::ffi::c_void;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

// These helpers are declared in `c/map.h`.
extern "C" {
    fn mmapext__page_size() -> i64;
    fn mmapext__reserve_region(
        size: usize,
        hint: *mut c_void,
        OUT_errno: *mut i32,
    ) -> Option<NonNull<c_void>>;
    fn mmapext__release_region(base: NonNull<c_void>, size: usize) -> i32;
    fn mmapext__map_file_region(base: NonNull<c_void>, size: usize, fd: i32, offset: u64) -> i32;
    fn mmapext__close_fd(fd: i32) -> i32;
}

fn page_size_or_die() -> usize {
    let ret = unsafe { mmapext__page_size() };

    if ret <= 0 {
        panic!("Unable to find page_size: errno={}", -ret);
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

/// Attempts to reserve an *address space* region of `size` bytes.
/// The region is inaccessible until parts of it are replaced with
/// `map_file_region`.
///
/// If `hint` is provided, the kernel tries to place the region
/// there, but may pick any other address.
///
/// The `size` argument must be a multiple of the page size.
pub fn reserve_region(size: usize, hint: Option<NonNull<c_void>>) -> Result<NonNull<c_void>, i32> {
    let mut errno: i32 = 0;

    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let hint_ptr = hint.map_or(std::ptr::null_mut(), NonNull::as_ptr);
    if let Some(base) = unsafe { mmapext__reserve_region(size, hint_ptr, &mut errno) } {
        Ok(base)
    } else {
        Err(errno)
    }
}

/// Releases a region of `size` bytes starting at `base`, whether it
/// is only reserved or backed by a file mapping.
///
/// The size argument must be a multiple of the page size.
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe { mmapext__release_region(base, size) };

    if ret == 0 {
        Ok(())
    } else {
        Err(-ret)
    }
}

/// Backs a region of `size` bytes starting at `base` with a shared
/// read-write mapping of `fd`, starting at file `offset`.  The file
/// must already be at least `offset + size` bytes long.
///
/// The size and offset must be multiples of the page size.
pub fn map_file_region(
    base: NonNull<c_void>,
    size: usize,
    fd: RawFd,
    offset: u64,
) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0 && (offset % page_size() as u64) == 0,
        "Bad file region size={} offset={} page_size={}",
        size,
        offset,
        page_size()
    );

    let ret = unsafe { mmapext__map_file_region(base, size, fd, offset) };

    if ret == 0 {
        Ok(())
    } else {
        Err(-ret)
    }
}

/// Closes `fd`, reporting failures instead of swallowing them like
/// `File`'s `Drop` does.
pub fn close_fd(fd: RawFd) -> Result<(), i32> {
    let ret = unsafe { mmapext__close_fd(fd) };

    if ret == 0 {
        Ok(())
    } else {
        Err(-ret)
    }
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);
    assert_eq!(page_size() & (page_size() - 1), 0);
}

// Reserve a range, back its first half with a file, write through
// the mapping, and read the bytes back with regular file I/O.
#[test]
fn smoke_test() {
    use std::io::Read;
    use std::os::unix::io::AsRawFd;

    let region_size = 8 * page_size();
    let base = reserve_region(region_size, None).expect("reserve should succeed");

    let mut file = tempfile::tempfile().expect("tempfile should open");
    file.set_len((region_size / 2) as u64)
        .expect("set_len should succeed");

    map_file_region(base, region_size / 2, file.as_raw_fd(), 0).expect("map should succeed");

    let bytes =
        unsafe { std::slice::from_raw_parts_mut(base.as_ptr() as *mut u8, region_size / 2) };
    bytes[0] = 42;
    bytes[region_size / 2 - 1] = 24;

    release_region(base, region_size).expect("should release everything");

    let mut contents = Vec::new();
    file.read_to_end(&mut contents).expect("read should succeed");
    assert_eq!(contents.len(), region_size / 2);
    assert_eq!(contents[0], 42);
    assert_eq!(contents[region_size / 2 - 1], 24);
}

// A hint right after a fresh reservation is usually honoured, but
// the kernel is free to ignore it.  Either way, both regions must be
// releasable.
#[test]
fn hinted_reservation() {
    let size = 4 * page_size();
    let base = reserve_region(size, None).expect("reserve should succeed");
    let hint = NonNull::new((base.as_ptr() as usize + size) as *mut c_void)
        .expect("Should be non-null");

    let next = reserve_region(size, Some(hint)).expect("hinted reserve should succeed");
    if next == hint {
        release_region(base, 2 * size).expect("should release both at once");
    } else {
        release_region(base, size).expect("should release the first region");
        release_region(next, size).expect("should release the second region");
    }
}

#[test]
fn close_bad_fd() {
    assert!(close_fd(-1).is_err());
}
