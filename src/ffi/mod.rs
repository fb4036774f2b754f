use serde::Serialize;
use std::ffi::{c_char, CStr, CString};
use std::os::raw::c_int;

use crate::ffi::error::{ErrorCode, FFIError};

pub mod error;
pub mod export;

pub use error::FFIResult;

/// Error handling helper for FFI boundaries (returns error code)
pub fn handle_status_result<F>(func: F) -> c_int
where
    F: FnOnce() -> FFIResult<()>,
{
    match func() {
        Ok(_) => ErrorCode::Success as c_int,
        Err(e) => {
            log::error!(
                "FFI call failed. Code: {:?}, Message: {}, Details: {}",
                e.code,
                e.message,
                e.details.as_deref().unwrap_or("None")
            );
            e.code as c_int
        }
    }
}

/// Serialize `value` into a C string owned by the caller (free with `export_free`).
pub fn to_json_c_string<T: Serialize>(value: &T) -> FFIResult<*mut c_char> {
    let json = serde_json::to_string(value)
        .map_err(|e| FFIError::internal(format!("JSON serialization failed: {}", e)))?;
    let c_string = CString::new(json)
        .map_err(|e| FFIError::internal(format!("CString creation failed: {}", e)))?;
    Ok(c_string.into_raw())
}

/// Borrow a required C string argument.
///
/// # Safety
/// `ptr` must be null or point to a valid null-terminated string.
pub unsafe fn required_str<'a>(ptr: *const c_char, name: &str) -> FFIResult<&'a str> {
    if ptr.is_null() {
        return Err(FFIError::null_pointer(&format!("{} is null", name)));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| FFIError::new(ErrorCode::InvalidUtf8, &format!("{} is not valid UTF-8", name)))
}

/// Run a future to completion on the library runtime.
pub fn block_on_async<F, T>(future: F) -> FFIResult<T>
where
    F: std::future::Future<Output = FFIResult<T>>,
{
    crate::globals::runtime()?.block_on(future)
}
