//! A `MappingManager` owns a backing file and a `Reservation` of
//! address space for it.  Callers ask it to map more of the file,
//! chunk by chunk; when the reservation is exhausted, the manager
//! grows the file and the reservation, moving the mapping to a new
//! base address if the kernel can't extend it in place.
//!
//! A manager goes through three states:
//!
//! - created: the reservation exists, with zero chunks mapped;
//! - mapped(n): `n` chunks of the file are mapped at the base;
//! - deleted: the reservation and file descriptor are released, and
//!   every further call fails with `ErrorKind::NotAlive`.
//!
//! Views of the mapping borrow the manager, so they can't outlive a
//! call that may move the mapping, nor the manager itself.
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

use log::{debug, error, info, warn};
use std::convert::TryFrom;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::ErrorKind as IoErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::IntoRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::ptr::NonNull;

use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::mapper::get_mapper;
use crate::reservation::Reservation;
use crate::size::align_forward;
use crate::size::bytes_for_chunks;
use crate::size::format_memory_size;
use crate::CreateOptions;
use crate::MapNextOptions;
use crate::MapNextOutcome;
use crate::Mapper;

#[derive(Debug)]
pub struct MappingManager {
    /// `None` once deleted.
    live: Option<Live>,
    /// Constant for the manager's lifetime, even after deletion.
    chunk_size: usize,
    last_error: Option<Error>,
}

/// The resources held by a manager that hasn't been deleted yet.
#[derive(Debug)]
struct Live {
    reservation: Reservation,
    file: File,
    path: PathBuf,
}

/// Opens `path` for reading and writing, creating it if necessary.
/// Returns the file and whether this call created it.
fn open_backing_file(path: &Path) -> std::io::Result<(File, bool)> {
    let mut options = OpenOptions::new();

    options.read(true).write(true).mode(0o644);
    match options.clone().create_new(true).open(path) {
        Ok(file) => Ok((file, true)),
        Err(e) if e.kind() == IoErrorKind::AlreadyExists => Ok((options.open(path)?, false)),
        Err(e) => Err(e),
    }
}

/// Undoes the side effects of a failed `MappingManager::create` on
/// the backing file: removes it if we created it, or restores its
/// original length.
fn abandon_backing_file(file: File, path: &Path, created: bool, original_len: Option<u64>) {
    let ret = if created {
        std::fs::remove_file(path)
    } else if let Some(len) = original_len {
        file.set_len(len)
    } else {
        Ok(())
    };

    if let Err(e) = ret {
        warn!(
            "failed to restore backing file {} after failed creation: {}",
            path.display(),
            e
        );
    }
}

/// Returns the current size of `file`.
fn file_size(file: &File, path: &Path) -> Result<u64> {
    file.metadata().map(|meta| meta.len()).map_err(|e| {
        Error::io(
            ErrorKind::FailedToStatFile,
            format!("failed to stat backing file {}", path.display()),
            &e,
        )
    })
}

/// Converts a chunk count to bytes, with overflow reported as an
/// invalid argument.
fn chunk_bytes(chunks: usize, chunk_size: usize) -> Result<usize> {
    bytes_for_chunks(chunks, chunk_size).ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidArgument,
            format!(
                "{} chunks of {} bytes overflow the address space",
                chunks, chunk_size
            ),
        )
    })
}

/// Computes the number of chunks to reserve initially.
fn initial_reservation_chunks(options: &CreateOptions, aligned_file_size: u64) -> Result<usize> {
    let chunk_size = options.chunk_size as u64;
    let too_large = || {
        Error::new(
            ErrorKind::InvalidArgument,
            format!(
                "initial reservation of {} bytes is too large",
                options.initial_reserved_size
            ),
        )
    };

    let mut reserved_size = align_forward(options.initial_reserved_size.max(chunk_size), chunk_size)
        .ok_or_else(too_large)?;
    if options.reserve_existing_file_size && aligned_file_size > reserved_size {
        reserved_size = aligned_file_size;
    }

    let chunks = usize::try_from(reserved_size / chunk_size).map_err(|_| too_large())?;
    chunk_bytes(chunks, options.chunk_size)?;
    Ok(chunks)
}

impl Live {
    fn file_size(&self) -> Result<u64> {
        file_size(&self.file, &self.path)
    }

    /// Extends the backing file to at least `wanted` bytes.  Returns
    /// the number of bytes added.
    fn ensure_file_size(&self, current: u64, wanted: u64) -> Result<u64> {
        if current >= wanted {
            return Ok(0);
        }

        self.file.set_len(wanted).map_err(|e| {
            Error::io(
                ErrorKind::FailedToFtruncate,
                format!(
                    "failed to extend backing file {} to {} bytes",
                    self.path.display(),
                    wanted
                ),
                &e,
            )
        })?;

        debug!(
            "extended {} from {} to {}",
            self.path.display(),
            format_memory_size(current),
            format_memory_size(wanted)
        );
        Ok(wanted - current)
    }

    fn map_next_chunk(&mut self, options: MapNextOptions) -> Result<MapNextOutcome> {
        let chunk_size = self.reservation.chunk_size();
        let reserved = self.reservation.chunks_reserved();
        let mapped = self.reservation.chunks_mapped();
        let current_file_size = self.file_size()?;

        let wanted = mapped
            .checked_add(options.chunks_to_map_next)
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "too many chunks to map"))?;

        if wanted <= reserved {
            let file_extension_size =
                self.ensure_file_size(current_file_size, chunk_bytes(wanted, chunk_size)? as u64)?;

            self.reservation
                .map_in_place(self.file.as_raw_fd(), options.chunks_to_map_next)
                .map_err(|errno| {
                    Error::os(
                        ErrorKind::FailedToRemap,
                        format!(
                            "failed to extend mapping from {} to {} chunks within reserved address space",
                            mapped, wanted
                        ),
                        errno,
                    )
                })?;

            return Ok(MapNextOutcome {
                mapping_was_moved: false,
                file_extension_size,
            });
        }

        let extra = options.extra_chunks_to_reserve_on_grow;
        if options.dont_grow_if_fully_mapped || extra == 0 {
            return Err(Error::new(
                ErrorKind::FullyMapped,
                format!(
                    "{} chunks requested, but only {} of {} reserved chunks are unmapped, and growth is {}",
                    options.chunks_to_map_next,
                    reserved - mapped,
                    reserved,
                    if options.dont_grow_if_fully_mapped {
                        "disabled"
                    } else {
                        "zero chunks"
                    }
                ),
            ));
        }

        let new_reserved = reserved.checked_add(extra).ok_or_else(|| {
            Error::new(ErrorKind::InvalidArgument, "too many chunks to reserve")
        })?;
        if wanted > new_reserved {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!(
                    "growing by {} chunks leaves no room to map {} more chunks",
                    extra, options.chunks_to_map_next
                ),
            ));
        }

        let new_reserved_size = chunk_bytes(new_reserved, chunk_size)?;
        let file_extension_size =
            self.ensure_file_size(current_file_size, new_reserved_size as u64)?;
        let mapping_was_moved = self.grow_reservation(extra, options.chunks_to_map_next)?;

        Ok(MapNextOutcome {
            mapping_was_moved,
            file_extension_size,
        })
    }

    /// Grows the reservation by `extra` chunks, and maps `count` more
    /// chunks.  The file must already cover the grown reservation.
    ///
    /// Returns whether the mapping moved.  On failure, the old
    /// reservation and its mapping are left as they were.
    fn grow_reservation(&mut self, extra: usize, count: usize) -> Result<bool> {
        let fd = self.file.as_raw_fd();
        let old_reserved = self.reservation.chunks_reserved();
        let old_size = self.reservation.reserved_bytes();

        let extended = self.reservation.try_extend_in_place(extra).map_err(|errno| {
            Error::os(
                ErrorKind::FailedToUnmap,
                "failed to release misplaced address space",
                errno,
            )
        })?;

        if extended {
            if let Err(errno) = self.reservation.map_in_place(fd, count) {
                if let Err(shrink_errno) = self.reservation.shrink_to(old_reserved) {
                    error!(
                        "failed to give back {} chunks of address space after failed mapping: errno={}",
                        extra, shrink_errno
                    );
                }

                return Err(Error::os(
                    ErrorKind::FailedToMmap,
                    format!(
                        "failed to map {} chunks after extending address space in place",
                        count
                    ),
                    errno,
                ));
            }

            info!(
                "grew reserved address space at {:p} in place from {} to {}",
                self.reservation.base(),
                format_memory_size(old_size as u64),
                format_memory_size(self.reservation.reserved_bytes() as u64)
            );
            return Ok(false);
        }

        let mapper = self.reservation.mapper();
        let chunk_size = self.reservation.chunk_size();
        let wanted = self.reservation.chunks_mapped() + count;
        let fresh = Reservation::new(mapper, chunk_size, old_reserved + extra)
            .map_err(|errno| {
                Error::os(
                    ErrorKind::FailedToMmap,
                    format!(
                        "failed to reserve {} of address space",
                        format_memory_size(((old_reserved + extra) * chunk_size) as u64)
                    ),
                    errno,
                )
            })?
            .populate(|r| r.map_in_place(fd, wanted))
            .map_err(|errno| {
                Error::os(
                    ErrorKind::FailedToMmap,
                    format!(
                        "failed to map {} chunks after extending file and address space",
                        wanted
                    ),
                    errno,
                )
            })?;

        let old = std::mem::replace(&mut self.reservation, fresh);
        let old_base = old.base();
        if let Err((old, errno)) = old.release() {
            let fresh = std::mem::replace(&mut self.reservation, old);

            if let Err((leaked, release_errno)) = fresh.release() {
                error!(
                    "failed to release new reservation {:p} after failing to release the old one: errno={}",
                    leaked.base(),
                    release_errno
                );
            }

            return Err(Error::os(
                ErrorKind::FailedToUnmap,
                "failed to unmap previously reserved address space",
                errno,
            ));
        }

        info!(
            "moved mapping from {:p} to {:p}, grew reserved address space from {} to {}, {} chunks mapped",
            old_base,
            self.reservation.base(),
            format_memory_size(old_size as u64),
            format_memory_size(self.reservation.reserved_bytes() as u64),
            self.reservation.chunks_mapped()
        );
        Ok(true)
    }

    fn map_full_file(&mut self) -> Result<MapNextOutcome> {
        let chunk_size = self.reservation.chunk_size() as u64;
        let mapped_size = self.reservation.mapped_bytes() as u64;
        let file_size = self.file_size()?;

        // Never map past the end of the file.
        let tail_chunks = file_size.saturating_sub(mapped_size) / chunk_size;
        if tail_chunks == 0 {
            return Ok(MapNextOutcome::default());
        }

        let tail_chunks = usize::try_from(tail_chunks)
            .map_err(|_| Error::new(ErrorKind::InvalidArgument, "backing file is too large"))?;
        let wanted = self
            .reservation
            .chunks_mapped()
            .checked_add(tail_chunks)
            .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "backing file is too large"))?;

        self.map_next_chunk(MapNextOptions {
            dont_grow_if_fully_mapped: false,
            extra_chunks_to_reserve_on_grow: wanted.saturating_sub(self.reservation.chunks_reserved()),
            chunks_to_map_next: tail_chunks,
        })
    }

    /// Releases the reservation and closes the file, in that order,
    /// even if the first step fails.  Returns the first error.
    fn close(self) -> Result<()> {
        let Live {
            reservation,
            file,
            path,
        } = self;
        let mut first_error = None;

        let base = reservation.base();
        let size = reservation.reserved_bytes();
        if let Err((_, errno)) = reservation.release() {
            error!("failed to unmap reserved address space {:p}: errno={}", base, errno);
            first_error = Some(Error::os(
                ErrorKind::FailedToUnmap,
                format!(
                    "failed to unmap {} of reserved address space",
                    format_memory_size(size as u64)
                ),
                errno,
            ));
        }

        if let Err(errno) = crate::map::close_fd(file.into_raw_fd()) {
            error!("failed to close {}: errno={}", path.display(), errno);
            first_error.get_or_insert_with(|| {
                Error::os(
                    ErrorKind::FailedToCloseFile,
                    format!("failed to close {} after unmapping", path.display()),
                    errno,
                )
            });
        }

        info!(
            "deleted manager for {} with address space {:p} ({})",
            path.display(),
            base,
            format_memory_size(size as u64)
        );
        first_error.map_or(Ok(()), Err)
    }
}

impl MappingManager {
    /// Opens (or creates) the backing file, and reserves address
    /// space for it, with no chunk mapped yet.
    ///
    /// The chunk size is validated before the file is touched.  On
    /// failure, no descriptor is leaked, and the backing file is
    /// removed if this call created it, or restored to its original
    /// size otherwise.
    ///
    /// # Errors
    ///
    /// Returns `PageSizeNonMultiple` for a bad chunk size,
    /// `FailedToOpenFile`, `FailedToStatFile` and `FailedToFtruncate`
    /// for file failures, and `FailedToMmap` if the address space
    /// can't be reserved.
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().num_chunks_mapped() == 0)]
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().num_chunks_reserved() > 0)]
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().file_covers_mapping())]
    pub fn create(options: CreateOptions) -> Result<MappingManager> {
        let mapper: &'static dyn Mapper = get_mapper(options.mapper_name.as_deref())
            .map_err(|msg| {
                Error::new(
                    ErrorKind::InvalidArgument,
                    format!("{}: {:?}", msg, options.mapper_name),
                )
            })?;

        let chunk_size = options.chunk_size;
        if chunk_size == 0 || chunk_size % mapper.page_size() != 0 {
            return Err(Error::new(
                ErrorKind::PageSizeNonMultiple,
                format!(
                    "chunk size {} is not a multiple of the page size {}",
                    chunk_size,
                    mapper.page_size()
                ),
            ));
        }

        let path = options.backing_file.clone();
        let (file, created) = open_backing_file(&path).map_err(|e| {
            error!("failed to open backing file {}: {}", path.display(), e);
            Error::io(
                ErrorKind::FailedToOpenFile,
                format!("failed to open backing file {}", path.display()),
                &e,
            )
        })?;

        let mut original_len = None;
        let ret = (|| {
            let existing_file_size = file_size(&file, &path)?;
            original_len = Some(existing_file_size);
            info!(
                "existing size of {} = {}",
                path.display(),
                existing_file_size
            );

            let aligned_file_size = align_forward(existing_file_size, chunk_size as u64)
                .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, "backing file is too large"))?;
            if aligned_file_size != existing_file_size {
                file.set_len(aligned_file_size).map_err(|e| {
                    error!(
                        "failed to extend {} from {} bytes to a chunk multiple: {}",
                        path.display(),
                        existing_file_size,
                        e
                    );
                    Error::io(
                        ErrorKind::FailedToFtruncate,
                        "failed to extend file size to a chunk multiple",
                        &e,
                    )
                })?;
            }

            let chunks = initial_reservation_chunks(&options, aligned_file_size)?;
            Reservation::new(mapper, chunk_size, chunks).map_err(|errno| {
                Error::os(
                    ErrorKind::FailedToMmap,
                    format!(
                        "failed to reserve initial address space of {}",
                        format_memory_size((chunks * chunk_size) as u64)
                    ),
                    errno,
                )
            })
        })();

        let reservation = match ret {
            Ok(reservation) => reservation,
            Err(e) => {
                abandon_backing_file(file, &path, created, original_len);
                return Err(e);
            }
        };

        info!(
            "created manager for {} with address space {:p} and size {} (= {})",
            path.display(),
            reservation.base(),
            format_memory_size(reservation.reserved_bytes() as u64),
            reservation.reserved_bytes()
        );

        Ok(MappingManager {
            live: Some(Live {
                reservation,
                file,
                path,
            }),
            chunk_size,
            last_error: None,
        })
    }

    /// Records the outcome of the latest call in `last_error`.
    fn record<T>(&mut self, ret: Result<T>) -> Result<T> {
        self.last_error = ret.as_ref().err().cloned();
        ret
    }

    /// Maps `options.chunks_to_map_next` more chunks of the backing
    /// file, extending the file as needed.
    ///
    /// When the reservation has room, the mapping is extended in
    /// place.  Otherwise, unless `dont_grow_if_fully_mapped` is set
    /// or `extra_chunks_to_reserve_on_grow` is zero, the file and the
    /// reservation grow by `extra_chunks_to_reserve_on_grow` chunks,
    /// which may move the mapping.  Callers must re-fetch any raw
    /// pointer into the mapping when `mapping_was_moved` is true.
    ///
    /// # Errors
    ///
    /// Returns `FullyMapped` if the reservation must grow but growth
    /// is disabled, `InvalidArgument` if the growth is too small for
    /// the request, and OS failure kinds otherwise.  On error, the
    /// mapping and chunk counts are unchanged (the file may have
    /// grown).
    #[ensures(self.num_chunks_mapped() <= self.num_chunks_reserved(),
              "The mapping never exceeds the reservation")]
    #[ensures(ret.is_ok() -> self.num_chunks_mapped() == old(self.num_chunks_mapped()) + options.chunks_to_map_next)]
    #[ensures(ret.is_ok() -> self.file_covers_mapping())]
    #[ensures(ret.is_ok() && !ret.as_ref().unwrap().mapping_was_moved -> self.base_address() == old(self.base_address()),
              "The base only changes when we say so")]
    #[ensures(ret.is_err() -> self.num_chunks_mapped() == old(self.num_chunks_mapped()) &&
              self.num_chunks_reserved() == old(self.num_chunks_reserved()) &&
              self.base_address() == old(self.base_address()),
              "Failures leave the manager unchanged")]
    pub fn map_next_chunk(&mut self, options: MapNextOptions) -> Result<MapNextOutcome> {
        let ret = match self.live.as_mut() {
            Some(live) => live.map_next_chunk(options),
            None => Err(Error::not_alive()),
        };

        match &ret {
            Err(e) if e.kind() == ErrorKind::FullyMapped => debug!("{}", e),
            Err(e) => error!("failed to map next {} chunks: {}", options.chunks_to_map_next, e),
            Ok(_) => {}
        }

        self.record(ret)
    }

    /// Maps every whole chunk of the backing file that isn't mapped
    /// yet, growing the reservation exactly as much as needed.
    /// Never maps past the end of the file; calling this again
    /// without growing the file is a no-op.
    ///
    /// # Errors
    ///
    /// Same as `map_next_chunk`.
    #[ensures(self.num_chunks_mapped() <= self.num_chunks_reserved())]
    #[ensures(ret.is_ok() -> self.file_covers_mapping())]
    #[ensures(ret.is_err() -> self.num_chunks_mapped() == old(self.num_chunks_mapped()))]
    pub fn map_full_file(&mut self) -> Result<MapNextOutcome> {
        let ret = match self.live.as_mut() {
            Some(live) => live.map_full_file(),
            None => Err(Error::not_alive()),
        };

        self.record(ret)
    }

    /// Unmaps the whole reservation, closes the backing file, and
    /// marks the manager as deleted.  Both steps are attempted even
    /// if the first fails; the first error is returned.
    ///
    /// # Errors
    ///
    /// Returns `FailedToUnmap` or `FailedToCloseFile`, or `NotAlive`
    /// if the manager was already deleted.
    #[ensures(!self.is_alive())]
    pub fn delete(&mut self) -> Result<()> {
        let ret = match self.live.take() {
            Some(live) => live.close(),
            None => Err(Error::not_alive()),
        };

        self.record(ret)
    }

    /// Returns the mapped region: exactly `mapped_size()` bytes from
    /// the base address, or an empty slice once deleted.
    pub fn mapped(&self) -> &[u8] {
        match &self.live {
            Some(live) => unsafe {
                std::slice::from_raw_parts(
                    live.reservation.base().as_ptr() as *const u8,
                    live.reservation.mapped_bytes(),
                )
            },
            None => &[],
        }
    }

    /// Mutable version of `mapped()`.
    pub fn mapped_mut(&mut self) -> &mut [u8] {
        match &mut self.live {
            Some(live) => unsafe {
                std::slice::from_raw_parts_mut(
                    live.reservation.base().as_ptr() as *mut u8,
                    live.reservation.mapped_bytes(),
                )
            },
            None => &mut [],
        }
    }

    /// Returns the start of the reservation, or `None` once deleted.
    /// The pointer is invalidated by any call that reports
    /// `mapping_was_moved`, and by deletion.
    #[inline]
    pub fn base_address(&self) -> Option<NonNull<u8>> {
        self.live
            .as_ref()
            .map(|live| live.reservation.base().cast::<u8>())
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn num_chunks_reserved(&self) -> usize {
        self.live
            .as_ref()
            .map_or(0, |live| live.reservation.chunks_reserved())
    }

    #[inline]
    pub fn num_chunks_mapped(&self) -> usize {
        self.live
            .as_ref()
            .map_or(0, |live| live.reservation.chunks_mapped())
    }

    #[inline]
    pub fn reserved_size(&self) -> u64 {
        self.num_chunks_reserved() as u64 * self.chunk_size as u64
    }

    #[inline]
    pub fn mapped_size(&self) -> u64 {
        self.num_chunks_mapped() as u64 * self.chunk_size as u64
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.live.is_some()
    }

    /// Returns true if every reserved chunk is mapped.  Always false
    /// once deleted, even though both counts are then zero.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.is_alive() && self.num_chunks_mapped() == self.num_chunks_reserved()
    }

    /// Returns the path of the backing file, or `None` once deleted.
    pub fn backing_file(&self) -> Option<&Path> {
        self.live.as_ref().map(|live| live.path.as_path())
    }

    /// Returns the error from the latest mapping or deletion call,
    /// if it failed.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Returns true if the backing file is at least as large as the
    /// mapped region (or the manager is deleted).
    pub(crate) fn file_covers_mapping(&self) -> bool {
        match &self.live {
            Some(live) => live
                .file_size()
                .map_or(false, |size| size >= live.reservation.mapped_bytes() as u64),
            None => true,
        }
    }
}

impl Drop for MappingManager {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            if let Err(e) = live.close() {
                warn!("failed to clean up dropped manager: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::collection::vec;
    use proptest::prelude::*;
    use std::path::Path;
    use std::path::PathBuf;

    use crate::mapper::FlakyMapper;
    use crate::CreateOptions;
    use crate::ErrorKind;
    use crate::MapNextOptions;
    use crate::MappingManager;

    fn chunk_size() -> usize {
        crate::DEFAULT_CHUNK_SIZE.max(crate::map::page_size())
    }

    fn file_len(path: &Path) -> u64 {
        std::fs::metadata(path).expect("stat should succeed").len()
    }

    fn create(path: &Path, initial_chunks: usize) -> MappingManager {
        MappingManager::create(
            CreateOptions::new(path)
                .with_chunk_size(chunk_size())
                .with_initial_reserved_size((initial_chunks * chunk_size()) as u64),
        )
        .expect("create should succeed")
    }

    fn map_next(dont_grow: bool, extra: usize, next: usize) -> MapNextOptions {
        MapNextOptions {
            dont_grow_if_fully_mapped: dont_grow,
            extra_chunks_to_reserve_on_grow: extra,
            chunks_to_map_next: next,
        }
    }

    fn check_invariants(manager: &MappingManager, path: &Path) {
        assert!(manager.num_chunks_mapped() <= manager.num_chunks_reserved());
        assert!(file_len(path) >= manager.mapped_size());
        assert_eq!(manager.mapped().len() as u64, manager.mapped_size());
    }

    #[test]
    fn smoke_test() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("smoke");
        let mut manager = create(&path, 4);

        assert!(manager.is_alive());
        assert!(!manager.is_full());
        assert_eq!(manager.chunk_size(), chunk_size());
        assert_eq!(manager.num_chunks_reserved(), 4);
        assert_eq!(manager.num_chunks_mapped(), 0);
        assert_eq!(manager.reserved_size(), 4 * chunk_size() as u64);
        assert_eq!(manager.mapped_size(), 0);
        assert!(manager.mapped().is_empty());
        assert_eq!(manager.backing_file(), Some(path.as_path()));
        assert_eq!(file_len(&path), 0);

        let outcome = manager
            .map_next_chunk(map_next(true, 0, 1))
            .expect("in-place mapping should succeed");
        assert!(!outcome.mapping_was_moved);
        assert_eq!(outcome.file_extension_size, chunk_size() as u64);
        assert_eq!(manager.num_chunks_mapped(), 1);
        assert_eq!(file_len(&path), chunk_size() as u64);

        manager.mapped_mut()[0] = b'a';
        manager.mapped_mut()[chunk_size() - 1] = b'z';

        manager.delete().expect("delete should succeed");
        assert!(!manager.is_alive());

        let contents = std::fs::read(&path).expect("read should succeed");
        assert_eq!(contents.len(), chunk_size());
        assert_eq!(contents[0], b'a');
        assert_eq!(contents[chunk_size() - 1], b'z');
    }

    #[test]
    fn map_zero_chunks() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("zero");
        let mut manager = create(&path, 2);
        let base = manager.base_address();

        let outcome = manager
            .map_next_chunk(map_next(true, 0, 0))
            .expect("mapping nothing should succeed");
        assert!(!outcome.mapping_was_moved);
        assert_eq!(outcome.file_extension_size, 0);
        assert_eq!(manager.num_chunks_mapped(), 0);
        assert_eq!(manager.base_address(), base);
    }

    #[test]
    fn fill_reservation_in_steps() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("steps");
        let mut manager = create(&path, 8);
        let base = manager.base_address();

        for _ in 0..4 {
            let outcome = manager
                .map_next_chunk(map_next(true, 0, 2))
                .expect("in-place mapping should succeed");
            assert!(!outcome.mapping_was_moved);
            assert_eq!(outcome.file_extension_size, 2 * chunk_size() as u64);
            check_invariants(&manager, &path);
        }

        assert!(manager.is_full());
        assert_eq!(manager.num_chunks_mapped(), 8);
        assert_eq!(manager.base_address(), base);

        let err = manager
            .map_next_chunk(map_next(true, 0, 1))
            .expect_err("must refuse to grow");
        assert_eq!(err.kind(), ErrorKind::FullyMapped);
        assert_eq!(manager.last_error(), Some(&err));
    }

    // A fully mapped manager grows by the extra chunks, and maps the
    // requested ones.  Data written before the growth survives it.
    #[test]
    fn grow_when_full() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("grow");
        let mut manager = create(&path, 3);

        manager
            .map_next_chunk(map_next(true, 0, 3))
            .expect("in-place mapping should succeed");
        assert!(manager.is_full());

        for (i, byte) in manager.mapped_mut().iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }

        let outcome = manager
            .map_next_chunk(map_next(false, 2, 1))
            .expect("growth should succeed");
        assert_eq!(manager.num_chunks_reserved(), 5);
        assert_eq!(manager.num_chunks_mapped(), 4);
        assert_eq!(outcome.file_extension_size, 2 * chunk_size() as u64);
        assert_eq!(file_len(&path), 5 * chunk_size() as u64);
        assert!(manager.last_error().is_none());
        check_invariants(&manager, &path);

        let mapped = manager.mapped();
        for (i, byte) in mapped[..3 * chunk_size()].iter().enumerate() {
            assert_eq!(*byte, (i % 251) as u8);
        }
        assert!(mapped[3 * chunk_size()..].iter().all(|b| *b == 0));

        // The remaining reserved chunk is mapped in place.
        let base = manager.base_address();
        let outcome = manager
            .map_next_chunk(map_next(true, 0, 1))
            .expect("in-place mapping should succeed");
        assert!(!outcome.mapping_was_moved);
        assert_eq!(outcome.file_extension_size, 0);
        assert_eq!(manager.base_address(), base);
        assert!(manager.is_full());
    }

    #[test]
    fn refuse_growth() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("refuse");
        let mut manager = create(&path, 2);

        manager
            .map_next_chunk(map_next(true, 0, 2))
            .expect("in-place mapping should succeed");
        let base = manager.base_address();

        for options in [map_next(true, 0, 1), map_next(false, 0, 1), map_next(true, 4, 1)].iter() {
            let err = manager
                .map_next_chunk(*options)
                .expect_err("must refuse to grow");

            assert_eq!(err.kind(), ErrorKind::FullyMapped);
            assert_eq!(manager.num_chunks_reserved(), 2);
            assert_eq!(manager.num_chunks_mapped(), 2);
            assert_eq!(manager.base_address(), base);
            assert_eq!(file_len(&path), 2 * chunk_size() as u64);
        }

        // Growing by too little is a caller error.
        let err = manager
            .map_next_chunk(map_next(false, 1, 2))
            .expect_err("growth is too small");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(manager.num_chunks_reserved(), 2);
        assert_eq!(manager.num_chunks_mapped(), 2);

        // A successful call clears the last error.
        manager
            .map_next_chunk(map_next(false, 0, 0))
            .expect("mapping nothing should succeed");
        assert!(manager.last_error().is_none());
    }

    #[test]
    fn reserve_existing_file_size() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("existing");
        let existing = 5 * chunk_size() + chunk_size() / 2;

        std::fs::write(&path, vec![1u8; existing]).expect("write should succeed");

        let manager = MappingManager::create(
            CreateOptions::new(&path)
                .with_chunk_size(chunk_size())
                .with_reserve_existing_file_size(true),
        )
        .expect("create should succeed");

        assert!(manager.num_chunks_reserved() >= 6);
        assert_eq!(manager.num_chunks_mapped(), 0);
        // The file is rounded up to a whole number of chunks.
        assert_eq!(file_len(&path), 6 * chunk_size() as u64);

        // Without the flag, the initial size wins.
        drop(manager);
        let manager = create(&path, 2);
        assert_eq!(manager.num_chunks_reserved(), 2);
    }

    #[test]
    fn initial_size_is_chunk_rounded() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("rounded");

        let manager = MappingManager::create(
            CreateOptions::new(&path)
                .with_chunk_size(chunk_size())
                .with_initial_reserved_size(chunk_size() as u64 + 1),
        )
        .expect("create should succeed");
        assert_eq!(manager.num_chunks_reserved(), 2);
        drop(manager);

        // Zero still reserves one chunk.
        let manager = create(&path, 0);
        assert_eq!(manager.num_chunks_reserved(), 1);
    }

    #[test]
    fn map_full_file() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("full");
        let mut manager = create(&path, 2);

        // Somebody else grows the file well past our reservation.
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("open should succeed")
            .set_len(7 * chunk_size() as u64)
            .expect("set_len should succeed");

        let outcome = manager.map_full_file().expect("map_full_file should succeed");
        assert_eq!(outcome.file_extension_size, 0);
        assert_eq!(manager.num_chunks_mapped(), 7);
        assert_eq!(manager.num_chunks_reserved(), 7);
        assert_eq!(file_len(&path), 7 * chunk_size() as u64);
        check_invariants(&manager, &path);

        // Nothing new to map the second time around.
        let base = manager.base_address();
        let outcome = manager.map_full_file().expect("map_full_file should succeed");
        assert!(!outcome.mapping_was_moved);
        assert_eq!(outcome.file_extension_size, 0);
        assert_eq!(manager.num_chunks_mapped(), 7);
        assert_eq!(manager.base_address(), base);
    }

    // A partial chunk at the end of the file is never mapped.
    #[test]
    fn map_full_file_partial_tail() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("partial");
        let mut manager = create(&path, 4);

        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("open should succeed")
            .set_len(2 * chunk_size() as u64 + 100)
            .expect("set_len should succeed");

        let outcome = manager.map_full_file().expect("map_full_file should succeed");
        assert!(!outcome.mapping_was_moved);
        assert_eq!(manager.num_chunks_mapped(), 2);
        assert_eq!(manager.num_chunks_reserved(), 4);
        assert_eq!(file_len(&path), 2 * chunk_size() as u64 + 100);
    }

    #[test]
    fn bad_chunk_size() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("bad_chunk");
        let page_size = crate::map::page_size();

        for bad in [0, page_size / 2, page_size + page_size / 2].iter() {
            let err = MappingManager::create(CreateOptions::new(&path).with_chunk_size(*bad))
                .expect_err("bad chunk size must fail");

            assert_eq!(err.kind(), ErrorKind::PageSizeNonMultiple);
            // We didn't touch the file system.
            assert!(!path.exists());
        }
    }

    #[test]
    fn open_failure() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path: PathBuf = dir.path().join("no_such_dir").join("file");

        let err = MappingManager::create(CreateOptions::new(&path).with_chunk_size(chunk_size()))
            .expect_err("open must fail");
        assert_eq!(err.kind(), ErrorKind::FailedToOpenFile);
        assert!(err.raw_os_error().is_some());
    }

    #[test]
    fn unknown_mapper() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("unknown_mapper");

        let err = MappingManager::create(
            CreateOptions::new(&path)
                .with_chunk_size(chunk_size())
                .with_mapper_name("manager_no_such_mapper"),
        )
        .expect_err("unknown mapper must fail");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(!path.exists());
    }

    // Failing to reserve the initial range must not leave the file
    // behind, or change a pre-existing one.
    #[test]
    fn reserve_failure_on_create() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("reserve_failure");
        FlakyMapper::register("manager_reserve_failure_on_create", 0, 0);

        let options = CreateOptions::new(&path)
            .with_chunk_size(chunk_size())
            .with_mapper_name("manager_reserve_failure_on_create");
        let err = MappingManager::create(options.clone()).expect_err("reserve must fail");
        assert_eq!(err.kind(), ErrorKind::FailedToMmap);
        assert!(!path.exists());

        std::fs::write(&path, vec![3u8; 10]).expect("write should succeed");
        let err = MappingManager::create(options).expect_err("reserve must fail");
        assert_eq!(err.kind(), ErrorKind::FailedToMmap);
        assert_eq!(file_len(&path), 10);
    }

    // When growth fails, the manager keeps its old mapping.
    #[test]
    fn growth_failure_keeps_mapping() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("growth_failure");
        // One reservation for create; growth fails to reserve.
        FlakyMapper::register("manager_growth_failure", 1, 10);

        let mut manager = MappingManager::create(
            CreateOptions::new(&path)
                .with_chunk_size(chunk_size())
                .with_initial_reserved_size(2 * chunk_size() as u64)
                .with_mapper_name("manager_growth_failure"),
        )
        .expect("create should succeed");

        manager
            .map_next_chunk(map_next(true, 0, 2))
            .expect("in-place mapping should succeed");
        manager.mapped_mut()[chunk_size()] = 99;
        let base = manager.base_address();

        let err = manager
            .map_next_chunk(map_next(false, 4, 1))
            .expect_err("growth must fail");
        assert_eq!(err.kind(), ErrorKind::FailedToMmap);
        assert_eq!(manager.last_error().map(|e| e.kind()), Some(ErrorKind::FailedToMmap));
        assert_eq!(manager.num_chunks_reserved(), 2);
        assert_eq!(manager.num_chunks_mapped(), 2);
        assert_eq!(manager.base_address(), base);
        assert_eq!(manager.mapped()[chunk_size()], 99);
        check_invariants(&manager, &path);
    }

    // Growth that can't extend the reservation in place moves the
    // mapping, and the data written before the move comes along.
    #[test]
    fn grow_by_moving() {
        use std::sync::atomic::Ordering;

        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("moving");
        let mapper = FlakyMapper::register("manager_grow_by_moving", usize::MAX, usize::MAX);
        mapper.refuse_hints.store(true, Ordering::Relaxed);

        let mut manager = MappingManager::create(
            CreateOptions::new(&path)
                .with_chunk_size(chunk_size())
                .with_initial_reserved_size(3 * chunk_size() as u64)
                .with_mapper_name("manager_grow_by_moving"),
        )
        .expect("create should succeed");

        manager
            .map_next_chunk(map_next(true, 0, 3))
            .expect("in-place mapping should succeed");
        for (i, byte) in manager.mapped_mut().iter_mut().enumerate() {
            *byte = (i % 241) as u8;
        }

        let old_base = manager.base_address();
        let outcome = manager
            .map_next_chunk(map_next(false, 2, 1))
            .expect("growth should succeed");

        assert!(outcome.mapping_was_moved);
        assert_eq!(outcome.file_extension_size, 2 * chunk_size() as u64);
        assert_ne!(manager.base_address(), old_base);
        assert!(manager.base_address().is_some());
        assert_eq!(manager.num_chunks_reserved(), 5);
        assert_eq!(manager.num_chunks_mapped(), 4);
        assert_eq!(file_len(&path), 5 * chunk_size() as u64);
        check_invariants(&manager, &path);

        let mapped = manager.mapped();
        for (i, byte) in mapped[..3 * chunk_size()].iter().enumerate() {
            assert_eq!(*byte, (i % 241) as u8);
        }
        assert!(mapped[3 * chunk_size()..].iter().all(|b| *b == 0));

        // Writes at the new base reach the file.
        manager.mapped_mut()[4 * chunk_size() - 1] = 0x5A;
        manager.delete().expect("delete should succeed");

        let contents = std::fs::read(&path).expect("read should succeed");
        assert_eq!(contents[0], 0);
        assert_eq!(contents[chunk_size() + 1], ((chunk_size() + 1) % 241) as u8);
        assert_eq!(contents[4 * chunk_size() - 1], 0x5A);
    }

    /// Counts the open descriptors that refer to `path`.
    fn open_descriptors_for(path: &Path) -> usize {
        std::fs::read_dir("/proc/self/fd")
            .expect("/proc/self/fd should be readable")
            .filter_map(|entry| std::fs::read_link(entry.ok()?.path()).ok())
            .filter(|target| target == path)
            .count()
    }

    // A failure to unmap still closes the file, and leaves the
    // manager deleted.
    #[test]
    fn delete_failure_is_best_effort() {
        use std::sync::atomic::Ordering;

        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir
            .path()
            .canonicalize()
            .expect("canonicalize should succeed")
            .join("best_effort");
        let mapper =
            FlakyMapper::register("manager_delete_failure_is_best_effort", usize::MAX, usize::MAX);

        let mut manager = MappingManager::create(
            CreateOptions::new(&path)
                .with_chunk_size(chunk_size())
                .with_initial_reserved_size(2 * chunk_size() as u64)
                .with_mapper_name("manager_delete_failure_is_best_effort"),
        )
        .expect("create should succeed");
        manager
            .map_next_chunk(map_next(true, 0, 1))
            .expect("in-place mapping should succeed");
        assert_eq!(open_descriptors_for(&path), 1);

        mapper.release_budget.store(0, Ordering::Relaxed);
        let err = manager.delete().expect_err("unmap must fail");

        assert_eq!(err.kind(), ErrorKind::FailedToUnmap);
        assert_eq!(err.raw_os_error(), Some(12));
        assert_eq!(manager.last_error(), Some(&err));
        assert!(!manager.is_alive());
        assert_eq!(open_descriptors_for(&path), 0);

        let err = manager.delete().expect_err("already deleted");
        assert_eq!(err.kind(), ErrorKind::NotAlive);
    }

    // When the mapping fails after an in-place reservation or a
    // relocation, nothing changes either.
    #[test]
    fn map_failure_keeps_mapping() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("map_failure");
        FlakyMapper::register("manager_map_failure", 10, 1);

        let mut manager = MappingManager::create(
            CreateOptions::new(&path)
                .with_chunk_size(chunk_size())
                .with_initial_reserved_size(chunk_size() as u64)
                .with_mapper_name("manager_map_failure"),
        )
        .expect("create should succeed");

        manager
            .map_next_chunk(map_next(true, 0, 1))
            .expect("in-place mapping should succeed");
        let base = manager.base_address();

        let err = manager
            .map_next_chunk(map_next(false, 2, 1))
            .expect_err("mapping must fail");
        assert_eq!(err.kind(), ErrorKind::FailedToMmap);
        assert_eq!(manager.num_chunks_reserved(), 1);
        assert_eq!(manager.num_chunks_mapped(), 1);
        assert_eq!(manager.base_address(), base);

        assert_eq!(manager.mapped().len(), chunk_size());
        let err = manager
            .map_next_chunk(map_next(false, 0, 1))
            .expect_err("fully mapped");
        assert_eq!(err.kind(), ErrorKind::FullyMapped);
    }

    #[test]
    fn delete_is_terminal() {
        let dir = tempfile::tempdir().expect("tempdir should succeed");
        let path = dir.path().join("terminal");
        let mut manager = create(&path, 2);

        manager
            .map_next_chunk(map_next(true, 0, 1))
            .expect("in-place mapping should succeed");
        manager.delete().expect("delete should succeed");

        assert!(!manager.is_alive());
        assert!(!manager.is_full());
        assert_eq!(manager.base_address(), None);
        assert_eq!(manager.backing_file(), None);
        assert!(manager.mapped().is_empty());
        assert!(manager.mapped_mut().is_empty());
        assert_eq!(manager.num_chunks_mapped(), 0);
        assert_eq!(manager.num_chunks_reserved(), 0);
        assert_eq!(manager.chunk_size(), chunk_size());

        let err = manager
            .map_next_chunk(map_next(false, 1, 1))
            .expect_err("deleted managers can't map");
        assert_eq!(err.kind(), ErrorKind::NotAlive);
        let err = manager.map_full_file().expect_err("deleted managers can't map");
        assert_eq!(err.kind(), ErrorKind::NotAlive);
        let err = manager.delete().expect_err("deleted managers can't be deleted");
        assert_eq!(err.kind(), ErrorKind::NotAlive);

        // The file outlives the manager.
        assert_eq!(file_len(&path), chunk_size() as u64);
    }

    proptest! {
        // Any sequence of map requests keeps the chunk counts and the
        // file size consistent.
        #[test]
        fn random_requests(requests in vec((proptest::bool::ANY, 0..4usize, 0..4usize), 1..24)) {
            let dir = tempfile::tempdir().expect("tempdir should succeed");
            let path = dir.path().join("random");
            let mut manager = create(&path, 2);

            for (dont_grow, extra, next) in requests.iter().cloned() {
                let before = (manager.num_chunks_reserved(), manager.num_chunks_mapped());
                let base = manager.base_address();

                match manager.map_next_chunk(map_next(dont_grow, extra, next)) {
                    Ok(outcome) => {
                        prop_assert_eq!(manager.num_chunks_mapped(), before.1 + next);
                        if outcome.mapping_was_moved {
                            prop_assert_eq!(manager.num_chunks_reserved(), before.0 + extra);
                        } else if manager.num_chunks_reserved() == before.0 {
                            prop_assert_eq!(manager.base_address(), base);
                        }
                    }
                    Err(e) => {
                        prop_assert!(e.kind() == ErrorKind::FullyMapped
                                     || e.kind() == ErrorKind::InvalidArgument);
                        prop_assert_eq!((manager.num_chunks_reserved(), manager.num_chunks_mapped()), before);
                        prop_assert_eq!(manager.base_address(), base);
                    }
                }

                prop_assert!(manager.num_chunks_mapped() <= manager.num_chunks_reserved());
                prop_assert!(file_len(&path) >= manager.mapped_size());
            }

            // The last mapped byte is always accessible.
            let mapped = manager.mapped_size() as usize;
            if mapped > 0 {
                manager.mapped_mut()[mapped - 1] = 1;
            }

            manager.delete().expect("delete should succeed");
        }
    }
}
