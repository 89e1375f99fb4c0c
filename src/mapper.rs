//! A `Mapper` is responsible for acquiring address space from the
//! operating system, and for backing parts of that address space with
//! a file.  Each `MappingManager` is parameterised on such a
//! `Mapper`.
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

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::Mutex;

#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub trait Mapper: std::fmt::Debug + Sync {
    /// Returns the mapping granularity for this mapper.  Chunk sizes
    /// must be a multiple of that page size.
    ///
    /// The page size must be constant for the lifetime of a process.
    #[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
    fn page_size(&self) -> usize;

    /// Attempts to reserve a range of `size` bytes of inaccessible
    /// address space.  On success, returns the address of the first
    /// byte in the reserved range.
    ///
    /// When `hint` is provided, the mapper should try to place the
    /// range at that address, but may return any other page-aligned
    /// address.
    #[requires(size > 0)]
    #[requires(size % self.page_size() == 0)]
    #[ensures(ret.is_ok() -> ret.unwrap().as_ptr() as usize % self.page_size() == 0,
              "Reserved ranges are page-aligned")]
    #[ensures(ret.is_ok() -> size <= usize::MAX - ret.unwrap().as_ptr() as usize,
              "The reserved range never overflows")]
    fn reserve(&self, size: usize, hint: Option<NonNull<c_void>>) -> Result<NonNull<c_void>, i32>;

    /// Releases a page-aligned range that was previously obtained
    /// with `reserve`, along with any file mapping in that range.
    /// The range may span consecutive reservations.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;

    /// Replaces a page-aligned subrange of a reservation with a
    /// shared read-write mapping of `fd` at `offset`.  The file must
    /// already cover `[offset, offset + size)`.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    #[requires(offset % self.page_size() as u64 == 0)]
    fn map_file(
        &self,
        base: NonNull<c_void>,
        size: usize,
        fd: RawFd,
        offset: u64,
    ) -> Result<(), i32>;
}

#[derive(Debug)]
struct DefaultMapper {}

lazy_static::lazy_static! {
    static ref NAMED_MAPPERS: Mutex<HashMap<String, &'static dyn Mapper>> = Default::default();
}

/// Upserts the mapper associated with `name`.
pub fn register_mapper(name: String, mapper: &'static dyn Mapper) {
    let mut mappers = NAMED_MAPPERS.lock().unwrap();

    mappers.insert(name, mapper);
}

/// Returns the mapper for the given `name`, if one exists, or the
/// default mapper if `name` is `None`.
///
/// # Errors
///
/// Returns `Err` if no such mapper is defined.
pub fn get_mapper(name: Option<&str>) -> Result<&'static dyn Mapper, &'static str> {
    lazy_static::lazy_static! {
        static ref DEFAULT_MAPPER: DefaultMapper = DefaultMapper{};
    }

    match name {
        Some(key) => {
            let mappers = NAMED_MAPPERS.lock().unwrap();

            Ok(*mappers.get(key).ok_or("Mapper not found")?)
        }
        None => Ok(&*DEFAULT_MAPPER),
    }
}

#[contract_trait]
impl Mapper for DefaultMapper {
    fn page_size(&self) -> usize {
        crate::map::page_size()
    }

    fn reserve(&self, size: usize, hint: Option<NonNull<c_void>>) -> Result<NonNull<c_void>, i32> {
        crate::map::reserve_region(size, hint)
    }

    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        crate::map::release_region(base, size)
    }

    fn map_file(
        &self,
        base: NonNull<c_void>,
        size: usize,
        fd: RawFd,
        offset: u64,
    ) -> Result<(), i32> {
        crate::map::map_file_region(base, size, fd, offset)
    }
}

/// A `FlakyMapper` forwards to the default mapper, but fails with
/// `ENOMEM` once its budget of `reserve`, `map_file` or `release`
/// calls is exhausted.  When `refuse_hints` is set, every hinted
/// `reserve` fails, so growth can never extend a reservation in
/// place.  Tests register it under a name to exercise error paths.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct FlakyMapper {
    pub reserve_budget: std::sync::atomic::AtomicUsize,
    pub map_budget: std::sync::atomic::AtomicUsize,
    pub release_budget: std::sync::atomic::AtomicUsize,
    pub refuse_hints: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
const ENOMEM: i32 = 12;

#[cfg(test)]
impl FlakyMapper {
    /// Registers a fresh `FlakyMapper` under `name` and returns it.
    pub fn register(name: &str, reserve_budget: usize, map_budget: usize) -> &'static FlakyMapper {
        let mapper: &'static FlakyMapper = Box::leak(Box::new(FlakyMapper {
            reserve_budget: reserve_budget.into(),
            map_budget: map_budget.into(),
            release_budget: usize::MAX.into(),
            refuse_hints: false.into(),
        }));

        register_mapper(name.to_string(), mapper);
        mapper
    }

    /// Decrements `budget`, and returns false if it was already zero.
    fn consume(budget: &std::sync::atomic::AtomicUsize) -> bool {
        use std::sync::atomic::Ordering;

        budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[cfg(test)]
#[contract_trait]
impl Mapper for FlakyMapper {
    fn page_size(&self) -> usize {
        crate::map::page_size()
    }

    fn reserve(&self, size: usize, hint: Option<NonNull<c_void>>) -> Result<NonNull<c_void>, i32> {
        if hint.is_some() && self.refuse_hints.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(ENOMEM);
        }

        if !FlakyMapper::consume(&self.reserve_budget) {
            return Err(ENOMEM);
        }

        crate::map::reserve_region(size, hint)
    }

    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        if !FlakyMapper::consume(&self.release_budget) {
            return Err(ENOMEM);
        }

        crate::map::release_region(base, size)
    }

    fn map_file(
        &self,
        base: NonNull<c_void>,
        size: usize,
        fd: RawFd,
        offset: u64,
    ) -> Result<(), i32> {
        if !FlakyMapper::consume(&self.map_budget) {
            return Err(ENOMEM);
        }

        crate::map::map_file_region(base, size, fd, offset)
    }
}

#[test]
fn test_get_mapper() {
    let default_mapper = get_mapper(None).expect("default mapper must exist");
    assert_eq!(default_mapper.page_size(), crate::map::page_size());

    assert!(get_mapper(Some("no_such_mapper")).is_err());

    let flaky = FlakyMapper::register("test_get_mapper", 1, 1);
    let found = get_mapper(Some("test_get_mapper")).expect("registered mapper must exist");
    assert_eq!(found.page_size(), flaky.page_size());
}
