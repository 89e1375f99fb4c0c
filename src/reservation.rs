//! A `Reservation` is a contiguous range of address space, measured
//! in chunks, whose prefix is backed by a shared mapping of the
//! backing file.  The layout looks like
//!
//! | mapped ... mapped | reserved ... reserved |
//! ^ base              ^ base + chunks_mapped * chunk_size
//!
//! where the mapped prefix mirrors the file's first `chunks_mapped`
//! chunks, byte for byte, and the rest of the range is inaccessible:
//! touching it faults.
//!
//! A `Reservation` does not release its range on drop.  Owners must
//! call `release` (or let `populate` do it on failure).
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

use log::{debug, error};
use std::ffi::c_void;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use crate::Mapper;

#[derive(Debug)]
pub struct Reservation {
    mapper: &'static dyn Mapper,
    base: NonNull<c_void>,
    chunk_size: usize,
    chunks_reserved: usize,
    chunks_mapped: usize,
}

/// A reservation is exclusively owned by a single manager; nothing
/// else refers to its range.  That's why it's safe to `Send` it.
unsafe impl Send for Reservation {}

impl Reservation {
    /// Attempts to reserve `chunks` chunks of address space from
    /// `mapper`, with nothing mapped yet.
    ///
    /// # Errors
    ///
    /// Returns the mapper's `errno` on failure.
    #[requires(chunks > 0)]
    #[requires(chunk_size > 0 && chunk_size % mapper.page_size() == 0)]
    #[requires(chunks.checked_mul(chunk_size).is_some())]
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().chunks_mapped == 0)]
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().chunks_reserved == chunks)]
    pub fn new(
        mapper: &'static dyn Mapper,
        chunk_size: usize,
        chunks: usize,
    ) -> Result<Reservation, i32> {
        let base = mapper.reserve(chunks * chunk_size, None)?;
        let ret = Reservation {
            mapper,
            base,
            chunk_size,
            chunks_reserved: chunks,
            chunks_mapped: 0,
        };

        ret.check_rep();
        Ok(ret)
    }

    #[inline]
    pub fn mapper(&self) -> &'static dyn Mapper {
        self.mapper
    }

    #[inline]
    pub fn base(&self) -> NonNull<c_void> {
        self.base
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn chunks_reserved(&self) -> usize {
        self.chunks_reserved
    }

    #[inline]
    pub fn chunks_mapped(&self) -> usize {
        self.chunks_mapped
    }

    #[inline]
    pub fn reserved_bytes(&self) -> usize {
        self.chunks_reserved * self.chunk_size
    }

    #[inline]
    pub fn mapped_bytes(&self) -> usize {
        self.chunks_mapped * self.chunk_size
    }

    /// Returns the address `offset` bytes into the reservation.
    fn address_at(&self, offset: usize) -> NonNull<c_void> {
        NonNull::new((self.base.as_ptr() as usize + offset) as *mut c_void)
            .expect("reservations never wrap around")
    }

    /// Asserts against internal invariants.
    pub fn check_rep(&self) {
        let page_size = self.mapper.page_size();

        assert_eq!(self.chunk_size % page_size, 0, "self: {:?}", self);
        assert_eq!(
            self.base.as_ptr() as usize % page_size,
            0,
            "self: {:?}",
            self
        );
        assert!(self.chunks_reserved > 0, "self: {:?}", self);
        assert!(
            self.chunks_mapped <= self.chunks_reserved,
            "self: {:?}",
            self
        );
        assert!(
            self.chunks_reserved
                .checked_mul(self.chunk_size)
                .and_then(|size| size.checked_add(self.base.as_ptr() as usize))
                .is_some(),
            "self: {:?}",
            self
        );
    }

    /// Maps the next `count` chunks of `fd` right after the currently
    /// mapped prefix.  The file must already cover them.
    ///
    /// # Errors
    ///
    /// Returns the mapper's `errno` on failure, in which case the
    /// mapped prefix is unchanged.
    #[requires(self.chunks_mapped + count <= self.chunks_reserved,
               "mapping stays inside the reservation")]
    #[ensures(ret.is_ok() -> self.chunks_mapped == old(self.chunks_mapped) + count)]
    #[ensures(ret.is_err() -> self.chunks_mapped == old(self.chunks_mapped))]
    pub fn map_in_place(&mut self, fd: RawFd, count: usize) -> Result<(), i32> {
        if count == 0 {
            return Ok(());
        }

        let offset = self.mapped_bytes();
        self.mapper.map_file(
            self.address_at(offset),
            count * self.chunk_size,
            fd,
            offset as u64,
        )?;

        self.chunks_mapped += count;
        debug!(
            "mapped {} chunks at tail, {} of {} chunks now mapped",
            count, self.chunks_mapped, self.chunks_reserved
        );
        Ok(())
    }

    /// Attempts to grow the reservation by `extra` chunks without
    /// moving it, by reserving the range right after it.
    ///
    /// Returns `Ok(true)` if the reservation grew, and `Ok(false)` if
    /// the adjacent range is not available.
    ///
    /// # Errors
    ///
    /// Returns `Err` if we failed to release a misplaced range.
    #[requires(extra > 0)]
    #[ensures(ret == Ok(true) -> self.chunks_reserved == old(self.chunks_reserved) + extra)]
    #[ensures(ret != Ok(true) -> self.chunks_reserved == old(self.chunks_reserved))]
    pub fn try_extend_in_place(&mut self, extra: usize) -> Result<bool, i32> {
        let size = match extra.checked_mul(self.chunk_size) {
            Some(size) => size,
            None => return Ok(false),
        };

        let end = self.base.as_ptr() as usize + self.reserved_bytes();
        if end.checked_add(size).is_none() {
            return Ok(false);
        }

        let hint = self.address_at(self.reserved_bytes());
        let got = match self.mapper.reserve(size, Some(hint)) {
            Ok(got) => got,
            Err(errno) => {
                debug!("unable to reserve {} bytes at {:p}: errno={}", size, hint, errno);
                return Ok(false);
            }
        };

        if got == hint {
            self.chunks_reserved += extra;
            return Ok(true);
        }

        self.mapper.release(got, size)?;
        Ok(false)
    }

    /// Releases every reserved chunk past the first `chunks`.
    #[requires(chunks > 0)]
    #[requires(chunks >= self.chunks_mapped && chunks <= self.chunks_reserved)]
    #[ensures(ret.is_ok() -> self.chunks_reserved == chunks)]
    #[ensures(ret.is_err() -> self.chunks_reserved == old(self.chunks_reserved))]
    pub fn shrink_to(&mut self, chunks: usize) -> Result<(), i32> {
        let keep = chunks * self.chunk_size;

        self.mapper
            .release(self.address_at(keep), self.reserved_bytes() - keep)?;
        self.chunks_reserved = chunks;
        Ok(())
    }

    /// Calls `f` on a fresh reservation.  If `f` fails, releases the
    /// reservation; if `f` succeeds, returns it.
    pub fn populate(mut self, f: impl FnOnce(&mut Self) -> Result<(), i32>) -> Result<Self, i32> {
        self.check_rep();

        match f(&mut self) {
            Ok(()) => {
                self.check_rep();
                Ok(self)
            }
            Err(errno) => {
                if let Err((leaked, release_errno)) = self.release() {
                    error!(
                        "failed to release abandoned reservation {:p} ({} bytes): errno={}",
                        leaked.base,
                        leaked.reserved_bytes(),
                        release_errno
                    );
                }

                Err(errno)
            }
        }
    }

    /// Releases the whole reserved range, mapped or not.
    ///
    /// # Errors
    ///
    /// On failure, hands the reservation back with the `errno`.
    pub fn release(self) -> Result<(), (Reservation, i32)> {
        match self.mapper.release(self.base, self.reserved_bytes()) {
            Ok(()) => Ok(()),
            Err(errno) => Err((self, errno)),
        }
    }
}
