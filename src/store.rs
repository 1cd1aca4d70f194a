use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use crate::config::PipelineConfig;
use crate::domain::{Dataset, WorkUnit};
use crate::error::IngestError;

pub const CURATED_SUFFIX: &str = "__with_metrics";

/// Local working directory:
///
/// ```text
/// <root>/<dataset>/year=<Y>/Q<q>/download/   extracted CSVs
/// <root>/<dataset>/year=<Y>/Q<q>/updated/    curated CSVs
/// <root>/<dataset>/markers/<Y>-Q<q>.done
/// <root>/<dataset>/diagnostics/
/// ```
#[derive(Debug, Clone)]
pub struct LocalLayout {
    root: Utf8PathBuf,
    dataset: Dataset,
}

impl LocalLayout {
    pub fn new(root: Utf8PathBuf, dataset: Dataset) -> Self {
        Self { root, dataset }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, IngestError> {
        let root = Utf8PathBuf::from_path_buf(config.work_dir.clone())
            .map_err(|_| IngestError::Filesystem("invalid work directory path".to_string()))?;
        Ok(Self::new(root, config.dataset))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn dataset_root(&self) -> Utf8PathBuf {
        self.root.join(self.dataset.slug())
    }

    pub fn unit_dir(&self, unit: &WorkUnit) -> Utf8PathBuf {
        self.dataset_root()
            .join(format!("year={}", unit.year))
            .join(format!("Q{}", unit.q()))
    }

    pub fn download_dir(&self, unit: &WorkUnit) -> Utf8PathBuf {
        self.unit_dir(unit).join("download")
    }

    pub fn updated_dir(&self, unit: &WorkUnit) -> Utf8PathBuf {
        self.unit_dir(unit).join("updated")
    }

    pub fn marker_path(&self, unit: &WorkUnit) -> Utf8PathBuf {
        self.dataset_root()
            .join("markers")
            .join(format!("{}-Q{}.done", unit.year, unit.q()))
    }

    pub fn diagnostics_dir(&self) -> Utf8PathBuf {
        self.dataset_root().join("diagnostics")
    }

    pub fn marker_exists(&self, unit: &WorkUnit) -> bool {
        self.marker_path(unit).as_std_path().exists()
    }

    pub fn write_marker(&self, unit: &WorkUnit) -> Result<(), IngestError> {
        Self::write_bytes_atomic(&self.marker_path(unit), b"ok")
    }

    pub fn has_curated(&self, unit: &WorkUnit) -> bool {
        let dir = self.updated_dir(unit);
        let Ok(entries) = fs::read_dir(dir.as_std_path()) else {
            return false;
        };
        entries.filter_map(Result::ok).any(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.ends_with(&format!("{CURATED_SUFFIX}.csv")))
                .unwrap_or(false)
        })
    }

    pub fn save_diagnostic(&self, name: &str, content: &[u8]) -> Utf8PathBuf {
        let path = self.diagnostics_dir().join(name);
        if let Err(err) = Self::write_bytes_atomic(&path, content) {
            warn!(path = %path, error = %err, "could not save diagnostic snapshot");
        }
        path
    }

    pub fn ensure_dir(path: &Utf8Path) -> Result<(), IngestError> {
        fs::create_dir_all(path.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))
    }

    pub fn remove_dir(path: &Utf8Path) {
        if path.as_std_path().exists() {
            if let Err(err) = fs::remove_dir_all(path.as_std_path()) {
                warn!(path = %path, error = %err, "could not remove working directory");
            }
        }
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), IngestError> {
        let parent = path
            .parent()
            .ok_or_else(|| IngestError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".bts-ingest")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

pub fn files_with_extension(dir: &Utf8Path, ext: &str) -> Result<Vec<Utf8PathBuf>, IngestError> {
    let mut files = Vec::new();
    let entries =
        fs::read_dir(dir.as_std_path()).map_err(|err| IngestError::Filesystem(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let path = Utf8PathBuf::from_path_buf(entry.path())
            .map_err(|_| IngestError::Filesystem("non-utf8 file path".to_string()))?;
        let matches = path
            .extension()
            .map(|found| found.eq_ignore_ascii_case(ext))
            .unwrap_or(false);
        if path.is_file() && matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
