use std::fs;
use std::io::{self, Cursor};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;
use zip::ZipArchive;

use crate::domain::WorkUnit;
use crate::error::IngestError;

/// Unpacks `archive` into `output_dir` and renames every CSV entry to
/// `<stem>__<year>Q<q>.csv` directly under `output_dir`, replacing any file
/// already at that name. Other entries stay where they were extracted.
pub fn materialize(
    archive: &[u8],
    output_dir: &Utf8Path,
    unit: &WorkUnit,
) -> Result<Utf8PathBuf, IngestError> {
    fs::create_dir_all(output_dir.as_std_path())
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    let mut zip =
        ZipArchive::new(Cursor::new(archive)).map_err(|err| IngestError::Archive(err.to_string()))?;

    let mut extracted = Vec::new();
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|err| IngestError::Archive(err.to_string()))?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            IngestError::Archive("zip entry path traversal detected".to_string())
        })?;
        let entry_path = Utf8PathBuf::from_path_buf(output_dir.as_std_path().join(relative))
            .map_err(|_| IngestError::Archive("non-utf8 entry name".to_string()))?;

        if entry.is_dir() {
            fs::create_dir_all(entry_path.as_std_path())
                .map_err(|err| IngestError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(entry_path.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| IngestError::Archive(err.to_string()))?;
        extracted.push(entry_path);
    }
    debug!(entries = extracted.len(), dir = %output_dir, "archive extracted");

    for path in extracted {
        if !is_csv(&path) {
            continue;
        }
        let target = output_dir.join(suffixed_name(&path, unit));
        if target == path {
            continue;
        }
        if target.as_std_path().exists() {
            fs::remove_file(target.as_std_path())
                .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
        fs::rename(path.as_std_path(), target.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        debug!(file = %target, "renamed CSV");
    }

    Ok(output_dir.to_path_buf())
}

fn is_csv(path: &Utf8Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false)
}

/// `data.csv` for 2001 Q3 becomes `data__2001Q3.csv`.
pub fn suffixed_name(path: &Utf8Path, unit: &WorkUnit) -> String {
    let stem = path.file_stem().unwrap_or_default();
    match path.extension() {
        Some(ext) => format!("{stem}{}.{ext}", unit.file_suffix()),
        None => format!("{stem}{}", unit.file_suffix()),
    }
}
