use std::path::{Component, Path};

use crate::TransferError;

/// Validates a file name received from a peer before it is used to
/// create output.
///
/// Rejects:
/// - Empty names and names containing NUL
/// - Any path separator (`/` or `\`)
/// - `.` and `..`
/// - Absolute paths and Windows prefixes (`C:`)
pub fn validate_file_name(file_name: &str) -> Result<(), TransferError> {
    if file_name.is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }
    if file_name.contains('\0') {
        return Err(TransferError::InvalidPath(format!(
            "NUL byte in file name: {file_name:?}"
        )));
    }
    if file_name.contains(['/', '\\']) {
        return Err(TransferError::InvalidPath(format!(
            "path separators not allowed: {file_name}"
        )));
    }

    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TransferError::InvalidPath(format!(
            "not a plain file name: {file_name}"
        ))),
    }
}
