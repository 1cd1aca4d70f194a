use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::WorkUnit;
use crate::error::IngestError;
use crate::object_store::ObjectStore;
use crate::store::LocalLayout;

pub trait ProgressOracle {
    fn is_done(&self, unit: &WorkUnit) -> bool;
}

/// Local curated output, local marker, remote curated prefix, remote marker,
/// checked in that order. Remote errors count as "not found".
pub struct StoreProgressOracle<'a, S: ObjectStore + ?Sized> {
    layout: &'a LocalLayout,
    store: &'a S,
    container: &'a str,
}

impl<'a, S: ObjectStore + ?Sized> StoreProgressOracle<'a, S> {
    pub fn new(layout: &'a LocalLayout, store: &'a S, container: &'a str) -> Self {
        Self {
            layout,
            store,
            container,
        }
    }

    fn remote_curated(&self, unit: &WorkUnit) -> bool {
        match self.store.list(self.container, &unit.curated_prefix()) {
            Ok(names) => !names.is_empty(),
            Err(err) => {
                debug!(%unit, error = %err, "curated listing failed; treating as absent");
                false
            }
        }
    }

    fn remote_marker(&self, unit: &WorkUnit) -> bool {
        match self.store.exists(self.container, &unit.marker_key()) {
            Ok(found) => found,
            Err(err) => {
                debug!(%unit, error = %err, "marker lookup failed; treating as absent");
                false
            }
        }
    }
}

impl<S: ObjectStore + ?Sized> ProgressOracle for StoreProgressOracle<'_, S> {
    fn is_done(&self, unit: &WorkUnit) -> bool {
        self.layout.has_curated(unit)
            || self.layout.marker_exists(unit)
            || self.remote_curated(unit)
            || self.remote_marker(unit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub invocation: String,
    pub claimed_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Acquired,
    HeldElsewhere { invocation: String, age: Duration },
}

pub fn new_invocation_id() -> String {
    format!("{:016x}", rand::rng().random::<u64>())
}

/// Best-effort lease: create the claim object if absent; if present, take it
/// over only when it is ours or older than `ttl`.
pub fn try_claim<S: ObjectStore + ?Sized>(
    store: &S,
    container: &str,
    unit: &WorkUnit,
    invocation: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<ClaimOutcome, IngestError> {
    let key = unit.claim_key();
    let claim = Claim {
        invocation: invocation.to_string(),
        claimed_at: now.to_rfc3339(),
    };
    let body =
        serde_json::to_vec(&claim).map_err(|err| IngestError::ObjectStore(err.to_string()))?;

    match store.put(container, &key, &body, Some("application/json"), false) {
        Ok(()) => return Ok(ClaimOutcome::Acquired),
        Err(IngestError::AlreadyExists { .. }) => {}
        Err(err) => return Err(err),
    }

    let existing = store
        .get(container, &key)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Claim>(&bytes).ok());
    if let Some(existing) = existing {
        // unreadable timestamps count as stale, future ones as fresh
        let age = match DateTime::parse_from_rfc3339(&existing.claimed_at) {
            Ok(at) => (now - at.with_timezone(&Utc))
                .to_std()
                .unwrap_or(Duration::ZERO),
            Err(_) => ttl,
        };
        if existing.invocation != invocation && age < ttl {
            return Ok(ClaimOutcome::HeldElsewhere {
                invocation: existing.invocation,
                age,
            });
        }
        info!(%unit, previous = %existing.invocation, age_s = age.as_secs(), "taking over claim");
    }

    store.put(container, &key, &body, Some("application/json"), true)?;
    Ok(ClaimOutcome::Acquired)
}

/// Expires our own claim so the next invocation can pick the unit up at once.
pub fn release_claim<S: ObjectStore + ?Sized>(
    store: &S,
    container: &str,
    unit: &WorkUnit,
    invocation: &str,
) -> Result<(), IngestError> {
    let claim = Claim {
        invocation: invocation.to_string(),
        claimed_at: DateTime::<Utc>::UNIX_EPOCH.to_rfc3339(),
    };
    let body =
        serde_json::to_vec(&claim).map_err(|err| IngestError::ObjectStore(err.to_string()))?;
    store.put(container, &unit.claim_key(), &body, Some("application/json"), true)
}
