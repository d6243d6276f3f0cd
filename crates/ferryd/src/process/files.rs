use std::fs::Permissions;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tempfile::Builder;

const RUNTIME_FILE_MODE: u32 = 0o600;

/// Replaces a runtime file (pid or health snapshot) in one rename.
///
/// The payload is staged next to `target`, synced, then persisted over it.
pub(super) fn replace_runtime_file(target: &Path, payload: &[u8]) -> io::Result<()> {
    let Some(directory) = target.parent() else {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("runtime file {} has no parent directory", target.display()),
        ));
    };
    let stem = target
        .file_name()
        .and_then(|name| name.to_str())
        .map_or_else(|| String::from(".ferryd"), |name| format!(".{name}"));

    let mut staged = Builder::new()
        .prefix(&stem)
        .suffix(".tmp")
        .permissions(Permissions::from_mode(RUNTIME_FILE_MODE))
        .tempfile_in(directory)?;
    staged.write_all(payload)?;
    staged.as_file().sync_all()?;
    staged.persist(target).map_err(|failed| failed.error)?;
    Ok(())
}
