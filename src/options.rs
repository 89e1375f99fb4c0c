//! Option and result structs for `MappingManager` operations, along
//! with the `#[repr(C)]` versions the extern "C" interface uses.
use std::convert::TryFrom;
use std::ffi::CStr;
use std::ffi::OsStr;
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use crate::error::ForeignError;

/// Chunks are 8 KB by default, which is a multiple of the page size
/// on every platform we care about.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

static_assertions::const_assert!(DEFAULT_CHUNK_SIZE & (DEFAULT_CHUNK_SIZE - 1) == 0);
static_assertions::const_assert_eq!(DEFAULT_CHUNK_SIZE % 4096, 0);

/// When created, a manager is configured with a backing file, an
/// initial reservation and a chunk size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateOptions {
    /// The file is created if it doesn't exist.
    pub backing_file: PathBuf,
    /// Initial address space to reserve, rounded up to whole chunks
    /// (at least one).
    pub initial_reserved_size: u64,
    /// If the existing file is larger than `initial_reserved_size`,
    /// reserve enough address space for the whole file instead.
    pub reserve_existing_file_size: bool,
    /// Must be a multiple of the mapper's page size.
    pub chunk_size: usize,
    /// Name of a registered `Mapper`, or `None` for the default one.
    pub mapper_name: Option<String>,
}

impl CreateOptions {
    pub fn new(backing_file: impl Into<PathBuf>) -> CreateOptions {
        CreateOptions {
            backing_file: backing_file.into(),
            initial_reserved_size: 0,
            reserve_existing_file_size: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            mapper_name: None,
        }
    }

    pub fn with_initial_reserved_size(mut self, size: u64) -> CreateOptions {
        self.initial_reserved_size = size;
        self
    }

    pub fn with_reserve_existing_file_size(mut self, reserve: bool) -> CreateOptions {
        self.reserve_existing_file_size = reserve;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> CreateOptions {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_mapper_name(mut self, name: impl Into<String>) -> CreateOptions {
        self.mapper_name = Some(name.into());
        self
    }
}

/// Parameters for `MappingManager::map_next_chunk`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapNextOptions {
    /// If the reservation has no room for `chunks_to_map_next` more
    /// chunks, fail with `FullyMapped` instead of growing it.
    pub dont_grow_if_fully_mapped: bool,
    /// When the reservation must grow, grow it (and the file) by
    /// this many chunks.  Zero means the reservation never grows.
    pub extra_chunks_to_reserve_on_grow: usize,
    /// Number of chunks to add to the mapped region.  Should be at
    /// most `extra_chunks_to_reserve_on_grow` when growing.
    pub chunks_to_map_next: usize,
}

/// What a successful `map_next_chunk` (or `map_full_file`) did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapNextOutcome {
    /// The base address changed: every previously obtained view or
    /// pointer into the mapping is now dangling.
    pub mapping_was_moved: bool,
    /// How many bytes were appended to the backing file.
    pub file_extension_size: u64,
}

/// The extern "C" interface uses this version of `CreateOptions`.
#[repr(C)]
pub struct ForeignCreateOptions {
    backing_file: *const c_char,
    initial_reserved_size: u64,
    reserve_existing_file_size: bool,
    /// 0 selects `DEFAULT_CHUNK_SIZE`.
    chunk_size: u64,
    mapper_name: *const c_char,
}

/// The extern "C" interface uses this version of `MapNextOptions`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ForeignMapNextOptions {
    dont_grow_if_fully_mapped: bool,
    extra_chunks_to_reserve_on_grow: u64,
    chunks_to_map_next: u64,
}

/// The extern "C" interface returns this version of `MapNextOutcome`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ForeignMapNextResult {
    pub error: ForeignError,
    pub mapping_was_moved: bool,
    pub file_extension_size: u64,
}

impl CreateOptions {
    /// Attempts to convert a `ForeignCreateOptions` pointer to native
    /// `CreateOptions`.
    ///
    /// # Safety
    ///
    /// This function assumes `options_ptr` is NULL or valid.
    pub unsafe fn from_c(options_ptr: *const ForeignCreateOptions) -> Option<CreateOptions> {
        // Attempts to convert a C string to an optional String.
        fn to_nullable_str(ptr: *const c_char) -> Result<Option<String>, std::str::Utf8Error> {
            if ptr.is_null() {
                Ok(None)
            } else {
                Ok(Some(unsafe { CStr::from_ptr(ptr) }.to_str()?.to_owned()))
            }
        }

        if options_ptr.is_null() {
            return None;
        }

        let options: &ForeignCreateOptions = &*options_ptr;
        // Paths are arbitrary bytes on Unix.
        if options.backing_file.is_null() {
            return None;
        }
        let backing_file = OsStr::from_bytes(CStr::from_ptr(options.backing_file).to_bytes());
        let chunk_size = match options.chunk_size {
            0 => DEFAULT_CHUNK_SIZE,
            size => usize::try_from(size).ok()?,
        };

        Some(CreateOptions {
            backing_file: PathBuf::from(backing_file),
            initial_reserved_size: options.initial_reserved_size,
            reserve_existing_file_size: options.reserve_existing_file_size,
            chunk_size,
            mapper_name: to_nullable_str(options.mapper_name).ok()?,
        })
    }
}

#[cfg(test)]
impl ForeignCreateOptions {
    pub(crate) fn for_test(
        backing_file: *const c_char,
        initial_reserved_size: u64,
        chunk_size: u64,
    ) -> ForeignCreateOptions {
        ForeignCreateOptions {
            backing_file,
            initial_reserved_size,
            reserve_existing_file_size: false,
            chunk_size,
            mapper_name: std::ptr::null(),
        }
    }
}

#[cfg(test)]
impl ForeignMapNextOptions {
    pub(crate) fn for_test(dont_grow: bool, extra: u64, next: u64) -> ForeignMapNextOptions {
        ForeignMapNextOptions {
            dont_grow_if_fully_mapped: dont_grow,
            extra_chunks_to_reserve_on_grow: extra,
            chunks_to_map_next: next,
        }
    }
}

impl MapNextOptions {
    /// Converts the C version of the options.  Returns `None` if the
    /// chunk counts do not fit in a `usize`.
    pub fn from_c(options: ForeignMapNextOptions) -> Option<MapNextOptions> {
        Some(MapNextOptions {
            dont_grow_if_fully_mapped: options.dont_grow_if_fully_mapped,
            extra_chunks_to_reserve_on_grow: usize::try_from(
                options.extra_chunks_to_reserve_on_grow,
            )
            .ok()?,
            chunks_to_map_next: usize::try_from(options.chunks_to_map_next).ok()?,
        })
    }
}

impl From<&crate::error::Result<MapNextOutcome>> for ForeignMapNextResult {
    fn from(result: &crate::error::Result<MapNextOutcome>) -> ForeignMapNextResult {
        let outcome = result.as_ref().copied().unwrap_or_default();

        ForeignMapNextResult {
            error: result.into(),
            mapping_was_moved: outcome.mapping_was_moved,
            file_extension_size: outcome.file_extension_size,
        }
    }
}
