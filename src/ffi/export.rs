// FFI bindings for the `ExportService`.
//
// Every function decodes its C-string arguments, forwards to the service on the
// library runtime and hands JSON back through a `result` out-parameter.
// Strings returned to the caller must be released with `export_free`.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::ffi::{c_char, CString};
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::config::ExportConfig;
use crate::domains::export::schema::Record;
use crate::domains::export::types::RawExportRequest;
use crate::ffi::error::{FFIError, FFIResult};
use crate::ffi::{block_on_async, handle_status_result, required_str, to_json_c_string};
use crate::types::UserRole;

/// Requester identity as sent by the host application.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthDto {
    user_id: String,
    tenant_id: String,
    role: String,
}

fn parse_uuid(value: &str, field: &str) -> FFIResult<Uuid> {
    Uuid::parse_str(value.trim()).map_err(|_| {
        FFIError::new(
            crate::ffi::error::ErrorCode::InvalidUuid,
            &format!("Invalid UUID for {}: {}", field, value),
        )
    })
}

fn parse_json_payload<T: serde::de::DeserializeOwned>(json_str: &str, what: &str) -> FFIResult<T> {
    serde_json::from_str(json_str).map_err(|e| FFIError::invalid_argument(&format!("Invalid {} JSON: {}", what, e)))
}

fn parse_auth(json_str: &str) -> FFIResult<AuthContext> {
    let dto: AuthDto = parse_json_payload(json_str, "auth")?;
    let role = UserRole::from_str(&dto.role.trim().to_ascii_lowercase())
        .ok_or_else(|| FFIError::invalid_argument(&format!("Invalid role: {}", dto.role)))?;
    Ok(AuthContext::new(
        parse_uuid(&dto.user_id, "userId")?,
        parse_uuid(&dto.tenant_id, "tenantId")?,
        role,
    ))
}

/// Write `value` as JSON into the caller's out-parameter.
///
/// # Safety
/// `result` must be a valid, non-null pointer.
unsafe fn write_result<T: Serialize>(result: *mut *mut c_char, value: &T) -> FFIResult<()> {
    if result.is_null() {
        return Err(FFIError::null_pointer("result is null"));
    }
    let json = to_json_c_string(value)?;
    unsafe { *result = json };
    Ok(())
}

/// Initialize the export core. `storage_path` may be null to keep the configured one.
///
/// # Safety
/// `db_url` must be a valid null-terminated string; `storage_path` null or valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn export_initialize(db_url: *const c_char, storage_path: *const c_char) -> c_int {
    handle_status_result(|| unsafe {
        let db_url = required_str(db_url, "db_url")?;
        let mut config = ExportConfig::from_env();
        if !storage_path.is_null() {
            config.storage_path = PathBuf::from(required_str(storage_path, "storage_path")?);
        }
        block_on_async(crate::globals::initialize(db_url, config))
    })
}

/// Drain the worker pool and close the database.
#[unsafe(no_mangle)]
pub extern "C" fn export_shutdown() -> c_int {
    handle_status_result(|| block_on_async(crate::globals::shutdown()))
}

/// Sibling path the sync export writes to until it completes.
fn partial_path(output_path: &Path) -> PathBuf {
    let mut name = output_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    output_path.with_file_name(name)
}

/// Run an export synchronously, writing the artifact to `output_path`.
/// The request is validated before any file is touched, and `output_path` is
/// only replaced once the artifact is complete.
///
/// # Safety
/// All pointers must be valid; `result` receives an `ExportOutcome` JSON.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn export_run_sync(
    request_json: *const c_char,
    auth_json: *const c_char,
    output_path: *const c_char,
    result: *mut *mut c_char,
) -> c_int {
    handle_status_result(|| unsafe {
        let request: RawExportRequest = parse_json_payload(required_str(request_json, "request_json")?, "request")?;
        let auth = parse_auth(required_str(auth_json, "auth_json")?)?;
        let output_path = PathBuf::from(required_str(output_path, "output_path")?);
        let service = crate::globals::get_export_service()?;

        let outcome = block_on_async(async {
            let prepared = service.prepare_sync(&request, &auth).await?;
            let partial = partial_path(&output_path);
            let file = tokio::fs::File::create(&partial)
                .await
                .map_err(|e| FFIError::invalid_argument(&format!("Cannot create {}: {}", partial.display(), e)))?;
            let mut sink = BufWriter::new(file);
            let written = async {
                let outcome = service.run_sync(&prepared, &auth, &mut sink).await?;
                sink.shutdown().await.map_err(crate::errors::ExportError::from)?;
                drop(sink);
                tokio::fs::rename(&partial, &output_path).await?;
                Ok::<_, crate::errors::ExportError>(outcome)
            }
            .await;
            match written {
                Ok(outcome) => Ok(outcome),
                Err(e) => {
                    if let Err(remove_err) = tokio::fs::remove_file(&partial).await {
                        log::warn!("Could not remove partial export {}: {}", partial.display(), remove_err);
                    }
                    Err(FFIError::from(e))
                }
            }
        })?;
        write_result(result, &outcome)
    })
}

/// Queue a background export. `result` receives `{jobId, status}` or `{jobId, url}`.
///
/// # Safety
/// All pointers must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn export_enqueue(
    request_json: *const c_char,
    auth_json: *const c_char,
    result: *mut *mut c_char,
) -> c_int {
    handle_status_result(|| unsafe {
        let request: RawExportRequest = parse_json_payload(required_str(request_json, "request_json")?, "request")?;
        let auth = parse_auth(required_str(auth_json, "auth_json")?)?;
        let service = crate::globals::get_export_service()?;
        let outcome = block_on_async(async { Ok::<_, FFIError>(service.enqueue(&request, &auth).await?) })?;
        write_result(result, &outcome)
    })
}

/// # Safety
/// All pointers must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn export_job_status(
    job_id: *const c_char,
    auth_json: *const c_char,
    result: *mut *mut c_char,
) -> c_int {
    handle_status_result(|| unsafe {
        let job_id = parse_uuid(required_str(job_id, "job_id")?, "jobId")?;
        let auth = parse_auth(required_str(auth_json, "auth_json")?)?;
        let service = crate::globals::get_export_service()?;
        let view = block_on_async(async { Ok::<_, FFIError>(service.job_status(job_id, &auth).await?) })?;
        write_result(result, &view)
    })
}

/// Copy the artifact of a READY job to `output_path`.
///
/// # Safety
/// All pointers must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn export_retrieve(
    job_id: *const c_char,
    auth_json: *const c_char,
    output_path: *const c_char,
) -> c_int {
    handle_status_result(|| unsafe {
        let job_id = parse_uuid(required_str(job_id, "job_id")?, "jobId")?;
        let auth = parse_auth(required_str(auth_json, "auth_json")?)?;
        let output_path = PathBuf::from(required_str(output_path, "output_path")?);
        let service = crate::globals::get_export_service()?;
        block_on_async(async {
            let bytes = service.retrieve(job_id, &auth).await.map_err(FFIError::from)?;
            tokio::fs::write(&output_path, bytes)
                .await
                .map_err(|e| FFIError::internal(format!("Cannot write {}: {}", output_path.display(), e)))
        })
    })
}

/// # Safety
/// All pointers must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn export_get_columns(
    entity_type: *const c_char,
    auth_json: *const c_char,
    result: *mut *mut c_char,
) -> c_int {
    handle_status_result(|| unsafe {
        let entity_type = required_str(entity_type, "entity_type")?;
        let auth = parse_auth(required_str(auth_json, "auth_json")?)?;
        let service = crate::globals::get_export_service()?;
        let columns = block_on_async(async { Ok::<_, FFIError>(service.columns(&auth, entity_type).await?) })?;
        write_result(result, &json!({ "entityType": entity_type, "columns": columns }))
    })
}

/// Save the caller's column preference; an empty array restores the defaults.
///
/// # Safety
/// All pointers must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn export_set_columns(
    entity_type: *const c_char,
    columns_json: *const c_char,
    auth_json: *const c_char,
    result: *mut *mut c_char,
) -> c_int {
    handle_status_result(|| unsafe {
        let entity_type = required_str(entity_type, "entity_type")?;
        let columns: Vec<String> = parse_json_payload(required_str(columns_json, "columns_json")?, "columns")?;
        let auth = parse_auth(required_str(auth_json, "auth_json")?)?;
        let service = crate::globals::get_export_service()?;
        let saved = block_on_async(async { Ok::<_, FFIError>(service.set_columns(&auth, entity_type, &columns).await?) })?;
        write_result(result, &json!({ "entityType": entity_type, "columns": saved }))
    })
}

/// # Safety
/// All pointers must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn export_schema(entity_type: *const c_char, result: *mut *mut c_char) -> c_int {
    handle_status_result(|| unsafe {
        let entity_type = required_str(entity_type, "entity_type")?;
        let schema = crate::globals::get_export_service()?.schema(entity_type)?;
        write_result(result, &schema)
    })
}

/// # Safety
/// All pointers must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn export_analytics(
    days: i64,
    compare: bool,
    auth_json: *const c_char,
    result: *mut *mut c_char,
) -> c_int {
    handle_status_result(|| unsafe {
        let auth = parse_auth(required_str(auth_json, "auth_json")?)?;
        let service = crate::globals::get_export_service()?;
        let report = block_on_async(async { Ok::<_, FFIError>(service.analytics(&auth, days, compare).await?) })?;
        write_result(result, &report)
    })
}

/// Load a JSON array of records into the caller's tenant. `result` receives `{ids}`.
///
/// # Safety
/// All pointers must be valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn export_ingest_records(
    entity_type: *const c_char,
    records_json: *const c_char,
    auth_json: *const c_char,
    result: *mut *mut c_char,
) -> c_int {
    handle_status_result(|| unsafe {
        let entity_type = required_str(entity_type, "entity_type")?;
        let records: Vec<Record> = parse_json_payload(required_str(records_json, "records_json")?, "records")?;
        let auth = parse_auth(required_str(auth_json, "auth_json")?)?;
        let service = crate::globals::get_export_service()?;
        let ids = block_on_async(async { Ok::<_, FFIError>(service.ingest_records(&auth, entity_type, records).await?) })?;
        write_result(result, &json!({ "ids": ids }))
    })
}

/// Free a string returned by any `export_*` function.
///
/// # Safety
/// `ptr` must come from this library and must not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn export_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            let _ = CString::from_raw(ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use tempfile::TempDir;

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    unsafe fn take_json(ptr: *mut c_char) -> serde_json::Value {
        let value = serde_json::from_str(unsafe { CStr::from_ptr(ptr) }.to_str().unwrap()).unwrap();
        unsafe { export_free(ptr) };
        value
    }

    #[test]
    fn auth_payload_is_parsed() {
        let user = Uuid::new_v4();
        let tenant = Uuid::new_v4();
        let auth = parse_auth(&format!(r#"{{"userId":"{}","tenantId":"{}","role":"Staff"}}"#, user, tenant)).unwrap();
        assert_eq!(auth.user_id, user);
        assert_eq!(auth.role, UserRole::Staff);

        let err = parse_auth(r#"{"userId":"nope","tenantId":"x","role":"admin"}"#).unwrap_err();
        assert_eq!(err.code, crate::ffi::error::ErrorCode::InvalidUuid);
    }

    #[test]
    fn end_to_end_through_the_c_surface() {
        let dir = TempDir::new().unwrap();
        let db_url = format!("sqlite://{}", dir.path().join("portal.db").display());
        let storage = dir.path().join("artifacts");
        let auth = c(&format!(
            r#"{{"userId":"{}","tenantId":"{}","role":"admin"}}"#,
            Uuid::new_v4(),
            Uuid::new_v4()
        ));

        unsafe {
            assert_eq!(export_initialize(c(&db_url).as_ptr(), c(storage.to_str().unwrap()).as_ptr()), 0);

            let mut out: *mut c_char = std::ptr::null_mut();
            let records = c(r#"[{"id":"m1","subject":"Hello, \"world\"","sent_at":"2025-05-01T08:00:00Z"}]"#);
            assert_eq!(export_ingest_records(c("message").as_ptr(), records.as_ptr(), auth.as_ptr(), &mut out), 0);
            assert_eq!(take_json(out)["ids"][0], "m1");

            let target = dir.path().join("messages.csv");
            let request = c(r#"{"entityType":"message","format":"csv","columns":["id","subject"]}"#);
            let code = export_run_sync(request.as_ptr(), auth.as_ptr(), c(target.to_str().unwrap()).as_ptr(), &mut out);
            assert_eq!(code, 0);
            assert_eq!(take_json(out)["rowCount"], 1);
            let written = std::fs::read_to_string(&target).unwrap();
            assert!(written.ends_with("m1,\"Hello, \"\"world\"\"\"\r\n"));

            let bad = c(r#"{"entityType":"message","format":"csv","columns":["nope"]}"#);
            let code = export_run_sync(bad.as_ptr(), auth.as_ptr(), c(target.to_str().unwrap()).as_ptr(), &mut out);
            assert_eq!(code, crate::ffi::error::ErrorCode::UnknownColumn as c_int);
            assert_eq!(std::fs::read_to_string(&target).unwrap(), written);
            assert!(!partial_path(&target).exists());

            assert_eq!(export_enqueue(request.as_ptr(), auth.as_ptr(), &mut out), 0);
            let job_id = take_json(out)["jobId"].as_str().unwrap().to_string();
            assert!(Uuid::parse_str(&job_id).is_ok());
        }
        assert_eq!(export_shutdown(), 0);
    }
}
