//! `mmapext` maps a backing file into memory, chunk by chunk, inside
//! a reservation of address space that grows (and may move) with the
//! file.
mod error;
mod manager;
mod map;
mod mapper;
mod options;
mod reservation;
mod size;

use std::ffi::c_void;
use std::ptr::NonNull;

pub use error::Error;
pub use error::ErrorKind;
pub use error::ForeignError;
pub use error::Result;
pub use manager::MappingManager;
pub use mapper::get_mapper;
pub use mapper::register_mapper;
pub use mapper::Mapper;
pub use options::CreateOptions;
pub use options::ForeignCreateOptions;
pub use options::ForeignMapNextOptions;
pub use options::ForeignMapNextResult;
pub use options::MapNextOptions;
pub use options::MapNextOutcome;
pub use options::DEFAULT_CHUNK_SIZE;

fn invalid_argument<T>(message: &str) -> Result<T> {
    Err(Error::new(ErrorKind::InvalidArgument, message))
}

/// Creates a new manager, or returns NULL and fills `out_error`.
///
/// # Safety
///
/// This function assumes `options_ptr` and `out_error` are NULL or
/// valid.
#[no_mangle]
pub unsafe extern "C" fn mmapext_create_manager(
    options_ptr: *const ForeignCreateOptions,
    out_error: *mut ForeignError,
) -> *mut MappingManager {
    let ret = match CreateOptions::from_c(options_ptr) {
        Some(options) => MappingManager::create(options),
        None => invalid_argument("mmapext_create_options must be valid"),
    };

    if let Some(out) = out_error.as_mut() {
        *out = (&ret).into();
    }

    match ret {
        Ok(manager) => Box::into_raw(Box::new(manager)),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Deletes the manager at `*manager_ptr`, frees it, and sets the
/// handle to NULL.  The handle is freed even if deletion fails.
///
/// # Safety
///
/// This function assumes `manager_ptr` is NULL, or points to NULL or
/// to a handle returned by `mmapext_create_manager`.
#[no_mangle]
pub unsafe extern "C" fn mmapext_delete_manager(
    manager_ptr: *mut *mut MappingManager,
) -> ForeignError {
    let handle = match manager_ptr.as_mut() {
        Some(handle) if !handle.is_null() => handle,
        _ => return ForeignError::from(&Error::not_alive()),
    };

    let mut manager = Box::from_raw(*handle);
    *handle = std::ptr::null_mut();

    let ret = manager.delete();
    ForeignError::from(&ret)
}

/// Maps the next chunks of the backing file.
///
/// # Safety
///
/// This function assumes `manager` is NULL or valid.
#[no_mangle]
pub unsafe extern "C" fn mmapext_map_next_file_chunk(
    manager: *mut MappingManager,
    options: ForeignMapNextOptions,
) -> ForeignMapNextResult {
    let ret = match (manager.as_mut(), MapNextOptions::from_c(options)) {
        (None, _) => Err(Error::not_alive()),
        (Some(_), None) => invalid_argument("chunk counts must fit in the address space"),
        (Some(manager), Some(options)) => manager.map_next_chunk(options),
    };

    (&ret).into()
}

/// Maps every whole chunk of the backing file not yet mapped.
///
/// # Safety
///
/// This function assumes `manager` is NULL or valid.
#[no_mangle]
pub unsafe extern "C" fn mmapext_map_full_file(
    manager: *mut MappingManager,
) -> ForeignMapNextResult {
    let ret = match manager.as_mut() {
        Some(manager) => manager.map_full_file(),
        None => Err(Error::not_alive()),
    };

    (&ret).into()
}

/// # Safety
///
/// This function assumes `manager` is NULL or valid.
#[no_mangle]
pub unsafe extern "C" fn mmapext_full(manager: *const MappingManager) -> bool {
    manager.as_ref().map_or(false, MappingManager::is_full)
}

/// # Safety
///
/// This function assumes `manager` is NULL or valid.
#[no_mangle]
pub unsafe extern "C" fn mmapext_is_alive(manager: *const MappingManager) -> bool {
    manager.as_ref().map_or(false, MappingManager::is_alive)
}

/// # Safety
///
/// This function assumes `manager` is NULL or valid.
#[no_mangle]
pub unsafe extern "C" fn mmapext_reserved_size(manager: *const MappingManager) -> u64 {
    manager.as_ref().map_or(0, MappingManager::reserved_size)
}

/// # Safety
///
/// This function assumes `manager` is NULL or valid.
#[no_mangle]
pub unsafe extern "C" fn mmapext_mapped_size(manager: *const MappingManager) -> u64 {
    manager.as_ref().map_or(0, MappingManager::mapped_size)
}

/// Returns the base of the mapping, or NULL for a deleted manager.
/// The address changes whenever a mapping call reports that the
/// mapping moved.
///
/// # Safety
///
/// This function assumes `manager` is NULL or valid.
#[no_mangle]
pub unsafe extern "C" fn mmapext_address(manager: *const MappingManager) -> *mut c_void {
    manager
        .as_ref()
        .and_then(MappingManager::base_address)
        .map_or(std::ptr::null_mut(), |base: NonNull<u8>| {
            base.as_ptr() as *mut c_void
        })
}

/// # Safety
///
/// This function assumes `manager` is NULL or valid.
#[no_mangle]
pub unsafe extern "C" fn mmapext_manager_chunk_size(manager: *const MappingManager) -> u64 {
    manager
        .as_ref()
        .map_or(0, |manager| manager.chunk_size() as u64)
}

/// Returns the chunk size used when the create options leave it at 0.
#[no_mangle]
pub extern "C" fn mmapext_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE as u64
}
