//! Atomic bundle persistence.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::info;

use folio_shared::{FolioError, Result, slugify};

use crate::BundleMeta;

/// `<slug-of-title>-<id>.<ext>`, or `<id>.<ext>` when the title slugs to nothing.
pub fn bundle_file_name(meta: &BundleMeta, extension: &str) -> String {
    let slug = slugify(&meta.title);
    if slug.is_empty() || slug == meta.id {
        format!("{}.{extension}", meta.id)
    } else {
        format!("{slug}-{}.{extension}", meta.id)
    }
}

/// Write bundle bytes into `output_dir` (write to temp, then rename) and return the final path.
///
/// Failures surface as [`FolioError::Assembly`]: a bundle that cannot be
/// persisted is treated like one that could not be built.
pub fn write_bundle(
    output_dir: &Path,
    meta: &BundleMeta,
    extension: &str,
    bytes: &[u8],
) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir).map_err(|e| assembly_io(output_dir, e))?;

    let filename = bundle_file_name(meta, extension);
    let target = output_dir.join(&filename);
    let temp = output_dir.join(format!(".{filename}.tmp"));

    std::fs::write(&temp, bytes).map_err(|e| assembly_io(&temp, e))?;
    std::fs::rename(&temp, &target).map_err(|e| assembly_io(&target, e))?;

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let sha256 = format!("{:x}", hasher.finalize());

    info!(
        id = %meta.id,
        path = %target.display(),
        size_bytes = bytes.len(),
        %sha256,
        "bundle written"
    );

    Ok(target)
}

fn assembly_io(path: &Path, source: std::io::Error) -> FolioError {
    FolioError::Assembly(FolioError::io(path, source).to_string())
}
