//! One-shot writer that seeds the shared volume with the test file

use std::path::PathBuf;

use tracing::info;

use crate::error::Result;
use crate::volume::Volume;

/// Write `contents` to `name` on the RWX volume, replacing any existing file
pub async fn write_test_file(rwx: &Volume, name: &str, contents: &str) -> Result<PathBuf> {
    let path = rwx.write(name, contents.as_bytes()).await?;
    info!(path = %path.display(), "Wrote test file");
    Ok(path)
}
