use std::fs;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::archive::materialize;
use crate::clock::{Clock, courtesy_pause};
use crate::config::PipelineConfig;
use crate::domain::{Dataset, WorkUnit};
use crate::error::IngestError;
use crate::form::{FormPayload, FormSession};
use crate::object_store::{ObjectStore, UploadOutcome, upload_bytes};
use crate::progress::{
    ClaimOutcome, ProgressOracle, StoreProgressOracle, release_claim, try_claim,
};
use crate::store::{LocalLayout, files_with_extension};
use crate::transform::{add_metrics, curated_name};
use crate::transport::FormTransport;

// Curated files are written under this suffix until their upload succeeded.
const PENDING_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    AlreadyDone,
    ClaimedElsewhere,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub unit: WorkUnit,
    pub outcome: UnitOutcome,
    pub curated: Vec<String>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl UnitReport {
    fn new(unit: WorkUnit, outcome: UnitOutcome) -> Self {
        Self {
            unit,
            outcome,
            curated: Vec::new(),
            error: None,
            elapsed_ms: 0,
        }
    }

    pub fn attempted(&self) -> bool {
        matches!(self.outcome, UnitOutcome::Completed | UnitOutcome::Failed)
    }
}

/// Processes one unit end to end. Never fails: errors are logged and
/// reported, and the unit stays pending.
pub trait ProcessUnit {
    fn process(&self, unit: &WorkUnit, geography: &str) -> UnitReport;

    /// For callers that already asked the oracle and found the unit pending.
    fn process_pending(&self, unit: &WorkUnit, geography: &str) -> UnitReport {
        self.process(unit, geography)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub keep_local: bool,
    pub unit_deadline: Duration,
    pub claim_ttl: Duration,
    pub invocation: String,
}

impl ProcessOptions {
    pub fn from_config(config: &PipelineConfig, invocation: String) -> Self {
        Self {
            keep_local: config.keep_local,
            unit_deadline: config.unit_deadline(),
            claim_ttl: config.claim_ttl(),
            invocation,
        }
    }
}

pub struct Pipeline<T: FormTransport, C: Clock, S: ObjectStore> {
    session: FormSession<T, C>,
    store: S,
    layout: LocalLayout,
    dataset: Dataset,
    container: String,
    options: ProcessOptions,
}

impl<T: FormTransport, C: Clock, S: ObjectStore> Pipeline<T, C, S> {
    pub fn new(
        session: FormSession<T, C>,
        store: S,
        layout: LocalLayout,
        dataset: Dataset,
        container: String,
        options: ProcessOptions,
    ) -> Self {
        Self {
            session,
            store,
            layout,
            dataset,
            container,
            options,
        }
    }

    pub fn oracle(&self) -> StoreProgressOracle<'_, S> {
        StoreProgressOracle::new(&self.layout, &self.store, &self.container)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn layout(&self) -> &LocalLayout {
        &self.layout
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    fn check_deadline(&self, started: Instant, stage: &str) -> Result<(), IngestError> {
        let elapsed = self
            .session
            .clock()
            .now()
            .saturating_duration_since(started);
        if elapsed > self.options.unit_deadline {
            warn!(stage, elapsed_s = elapsed.as_secs(), "unit exceeded its deadline");
            return Err(IngestError::DeadlineExceeded {
                limit_secs: self.options.unit_deadline.as_secs(),
            });
        }
        Ok(())
    }

    fn run_unit(
        &self,
        unit: &WorkUnit,
        geography: &str,
        started: Instant,
    ) -> Result<Vec<String>, IngestError> {
        let page = self.session.acquire_tokens()?;
        page.ensure_offers(unit)?;
        let payload = FormPayload::for_unit(&page.tokens, self.dataset, geography, unit);

        self.check_deadline(started, "before download")?;
        let archive = self.session.submit(&payload)?;
        self.check_deadline(started, "after download")?;

        let download_dir = self.layout.download_dir(unit);
        LocalLayout::remove_dir(&download_dir);
        materialize(&archive, &download_dir, unit)?;
        drop(archive);
        courtesy_pause(self.session.clock(), self.session.settings().courtesy_delay);

        let raw_files = files_with_extension(&download_dir, "csv")?;
        if raw_files.is_empty() {
            return Err(IngestError::Archive(
                "archive contained no CSV files".to_string(),
            ));
        }

        let updated_dir = self.layout.updated_dir(unit);
        LocalLayout::ensure_dir(&updated_dir)?;
        let mut curated = Vec::with_capacity(raw_files.len());
        let mut kept = Vec::new();
        for raw in &raw_files {
            let (key, pending) = self.ingest_file(unit, raw, &updated_dir)?;
            curated.push(key);
            kept.extend(pending);
        }
        // curated files only get their final names once every upload succeeded
        for (pending, target) in kept {
            fs::rename(pending.as_std_path(), target.as_std_path())
                .map_err(|err| IngestError::Filesystem(format!("{target}: {err}")))?;
        }

        self.layout.write_marker(unit)?;
        if let Err(err) = upload_bytes(
            &self.store,
            &self.container,
            &unit.marker_key(),
            b"ok",
            Some("text/plain"),
            true,
        ) {
            // the curated objects already mark the unit as done remotely
            warn!(%unit, error = %err, "could not write remote marker");
        }
        Ok(curated)
    }

    /// Uploads the raw CSV, derives and uploads the curated CSV. Returns the
    /// curated object key and, when local files are kept, the pending curated
    /// file with its final path.
    fn ingest_file(
        &self,
        unit: &WorkUnit,
        raw: &Utf8Path,
        updated_dir: &Utf8Path,
    ) -> Result<(String, Option<(Utf8PathBuf, Utf8PathBuf)>), IngestError> {
        let raw_name = raw
            .file_name()
            .ok_or_else(|| IngestError::Filesystem(format!("no file name: {raw}")))?;

        let raw_bytes =
            fs::read(raw.as_std_path()).map_err(|err| IngestError::Filesystem(err.to_string()))?;
        if let Err(err) = upload_bytes(
            &self.store,
            &self.container,
            &unit.raw_key(raw_name),
            &raw_bytes,
            Some("text/csv"),
            true,
        ) {
            warn!(%unit, file = raw_name, error = %err, "raw upload failed; continuing");
        }
        drop(raw_bytes);

        let name = curated_name(raw_name);
        let final_file = updated_dir.join(&name);
        let curated_file = updated_dir.join(format!("{name}{PENDING_SUFFIX}"));
        add_metrics(raw, &curated_file, self.dataset.metrics())?;
        let curated_key = unit.curated_key(&name);
        let curated_bytes = fs::read(curated_file.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        let outcome = upload_bytes(
            &self.store,
            &self.container,
            &curated_key,
            &curated_bytes,
            Some("text/csv"),
            false,
        )?;
        if outcome == UploadOutcome::Skipped {
            info!(%unit, key = %curated_key, "curated object already present");
        }

        if self.options.keep_local {
            return Ok((curated_key, Some((curated_file, final_file))));
        }
        for path in [raw, curated_file.as_path()] {
            if let Err(err) = fs::remove_file(path.as_std_path()) {
                warn!(file = %path, error = %err, "could not remove local file");
            }
        }
        Ok((curated_key, None))
    }
}

impl<T: FormTransport, C: Clock, S: ObjectStore> ProcessUnit for Pipeline<T, C, S> {
    fn process(&self, unit: &WorkUnit, geography: &str) -> UnitReport {
        if self.oracle().is_done(unit) {
            info!(%unit, "already done; skipping");
            return UnitReport::new(*unit, UnitOutcome::AlreadyDone);
        }
        self.process_pending(unit, geography)
    }

    fn process_pending(&self, unit: &WorkUnit, geography: &str) -> UnitReport {
        match try_claim(
            &self.store,
            &self.container,
            unit,
            &self.options.invocation,
            self.options.claim_ttl,
            chrono::Utc::now(),
        ) {
            Ok(ClaimOutcome::Acquired) => {}
            Ok(ClaimOutcome::HeldElsewhere { invocation, age }) => {
                info!(
                    %unit,
                    holder = %invocation,
                    age_s = age.as_secs(),
                    "claimed by another invocation; skipping"
                );
                return UnitReport::new(*unit, UnitOutcome::ClaimedElsewhere);
            }
            Err(err) => {
                warn!(%unit, error = %err, "could not write claim; proceeding unclaimed");
            }
        }

        info!(%unit, geography, dataset = %self.dataset, "processing unit");
        let started = self.session.clock().now();
        let result = self.run_unit(unit, geography, started);
        let elapsed_ms = self
            .session
            .clock()
            .now()
            .saturating_duration_since(started)
            .as_millis() as u64;

        if !self.options.keep_local {
            LocalLayout::remove_dir(&self.layout.download_dir(unit));
        }
        if !self.options.keep_local || result.is_err() {
            // a curated file left behind would make the oracle report the unit done
            LocalLayout::remove_dir(&self.layout.updated_dir(unit));
        }

        match result {
            Ok(curated) => {
                info!(%unit, files = curated.len(), elapsed_ms, "unit done (marker written)");
                UnitReport {
                    curated,
                    elapsed_ms,
                    ..UnitReport::new(*unit, UnitOutcome::Completed)
                }
            }
            Err(err) => {
                error!(%unit, error = %err, "unit failed; left pending");
                if let Err(release) =
                    release_claim(&self.store, &self.container, unit, &self.options.invocation)
                {
                    warn!(%unit, error = %release, "could not release claim");
                }
                UnitReport {
                    error: Some(err.to_string()),
                    elapsed_ms,
                    ..UnitReport::new(*unit, UnitOutcome::Failed)
                }
            }
        }
    }
}
