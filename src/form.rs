use std::collections::BTreeSet;
use std::time::Duration;

use rand::Rng;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use crate::clock::{Clock, courtesy_pause};
use crate::config::PipelineConfig;
use crate::domain::{Dataset, WorkUnit};
use crate::error::IngestError;
use crate::retry::{DownloadState, FailureKind, NextAction, RetryPolicy};
use crate::store::LocalLayout;
use crate::transport::{FormTransport, HttpReply, StreamOptions};

pub const VIEWSTATE: &str = "__VIEWSTATE";
pub const VIEWSTATE_GENERATOR: &str = "__VIEWSTATEGENERATOR";
pub const EVENT_VALIDATION: &str = "__EVENTVALIDATION";

/// Hidden fields from one GET. Valid only for the POST that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormTokens {
    pub view_state: String,
    pub view_state_generator: String,
    pub event_validation: String,
}

#[derive(Debug, Clone)]
pub struct FormPage {
    pub tokens: FormTokens,
    pub available_years: BTreeSet<String>,
    pub available_periods: BTreeSet<String>,
    pub html: String,
}

impl FormPage {
    pub fn parse(html: &str) -> Result<Self, IngestError> {
        let document = Html::parse_document(html);
        let tokens = FormTokens {
            view_state: hidden_value(&document, VIEWSTATE)?,
            view_state_generator: hidden_value(&document, VIEWSTATE_GENERATOR)?,
            event_validation: hidden_value(&document, EVENT_VALIDATION)?,
        };
        Ok(Self {
            tokens,
            available_years: numeric_options(&document, "cboYear")?,
            available_periods: numeric_options(&document, "cboPeriod")?,
            html: html.to_string(),
        })
    }

    /// Fails when the form does not offer the unit's year or quarter.
    pub fn ensure_offers(&self, unit: &WorkUnit) -> Result<(), IngestError> {
        let year = unit.year.to_string();
        if !self.available_years.contains(&year) {
            return Err(IngestError::NotOffered {
                what: "year",
                value: year,
                available: summarize(&self.available_years),
            });
        }
        let period = unit.quarter.to_string();
        if !self.available_periods.contains(&period) {
            return Err(IngestError::NotOffered {
                what: "quarter",
                value: period,
                available: summarize(&self.available_periods),
            });
        }
        Ok(())
    }
}

/// Both ASP.NET state markers must be present for the body to be the form.
pub fn has_form_markers(html: &str) -> bool {
    html.contains(VIEWSTATE) && html.contains(EVENT_VALIDATION)
}

fn selector(css: &str) -> Result<Selector, IngestError> {
    Selector::parse(css).map_err(|err| IngestError::PageParse(format!("{css}: {err}")))
}

fn hidden_value(document: &Html, name: &str) -> Result<String, IngestError> {
    let sel = selector(&format!("input[name=\"{name}\"]"))?;
    document
        .select(&sel)
        .next()
        .and_then(|input| input.value().attr("value"))
        .map(|value| value.to_string())
        .ok_or_else(|| IngestError::MissingHiddenField(name.to_string()))
}

fn numeric_options(document: &Html, select_name: &str) -> Result<BTreeSet<String>, IngestError> {
    let sel = selector(&format!("select[name=\"{select_name}\"] option"))?;
    Ok(document
        .select(&sel)
        .filter_map(|option| option.value().attr("value"))
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.chars().all(|ch| ch.is_ascii_digit()))
        .map(str::to_string)
        .collect())
}

fn summarize(values: &BTreeSet<String>) -> String {
    let shown: Vec<&str> = values.iter().take(6).map(String::as_str).collect();
    if values.len() > shown.len() {
        format!("{}, ...", shown.join(", "))
    } else {
        shown.join(", ")
    }
}

/// The POST body as an ordered list of fields. The server only cares about
/// presence, the fixed order keeps fixtures stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPayload {
    fields: Vec<(String, String)>,
}

impl FormPayload {
    pub fn for_unit(
        tokens: &FormTokens,
        dataset: Dataset,
        geography: &str,
        unit: &WorkUnit,
    ) -> Self {
        let mut fields: Vec<(String, String)> = vec![
            ("__EVENTTARGET".into(), String::new()),
            ("__EVENTARGUMENT".into(), String::new()),
            ("__LASTFOCUS".into(), String::new()),
            (VIEWSTATE.into(), tokens.view_state.clone()),
            (VIEWSTATE_GENERATOR.into(), tokens.view_state_generator.clone()),
            (EVENT_VALIDATION.into(), tokens.event_validation.clone()),
            ("txtSearch".into(), String::new()),
            ("cboGeography".into(), geography.to_string()),
            ("cboYear".into(), unit.year.to_string()),
            ("cboPeriod".into(), unit.quarter.to_string()),
        ];
        for flag in dataset.extra_flags().iter().chain(dataset.fields()) {
            fields.push((flag.to_string(), "on".to_string()));
        }
        fields.push(("btnDownload".into(), "Download".into()));
        Self { fields }
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub form_url: String,
    pub read_timeout: Duration,
    pub patient_read_timeout: Duration,
    pub stream: StreamOptions,
    pub unit_deadline: Duration,
    pub courtesy_delay: (Duration, Duration),
    pub policy: RetryPolicy,
}

impl SessionSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            form_url: config.dataset.form_url().to_string(),
            read_timeout: config.read_timeout(),
            patient_read_timeout: config.patient_read_timeout(),
            stream: StreamOptions {
                chunk_size: config.stream_chunk_size,
                stall: config.stall_window(),
                total: config.unit_deadline(),
            },
            unit_deadline: config.unit_deadline(),
            courtesy_delay: config.courtesy_delay(),
            policy: RetryPolicy::from_config(config),
        }
    }
}

/// One HTTP session against the download form. Owns the transport (and with
/// it the cookie jar) for the lifetime of a pipeline run.
pub struct FormSession<T: FormTransport, C: Clock> {
    pub(crate) transport: T,
    pub(crate) clock: C,
    pub(crate) settings: SessionSettings,
    pub(crate) layout: LocalLayout,
}

impl<T: FormTransport, C: Clock> FormSession<T, C> {
    pub fn new(transport: T, clock: C, settings: SessionSettings, layout: LocalLayout) -> Self {
        Self {
            transport,
            clock,
            settings,
            layout,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn acquire_tokens(&self) -> Result<FormPage, IngestError> {
        let policy = self.settings.policy;
        let mut last: Option<FailureKind> = None;

        for attempt in 1..=policy.max_attempts {
            courtesy_pause(&self.clock, self.settings.courtesy_delay);
            let read_timeout = if policy.is_patient(attempt) {
                self.settings.patient_read_timeout
            } else {
                self.settings.read_timeout
            };

            let failure = match self.transport.get(&self.settings.form_url, read_timeout) {
                Ok(reply) if reply.is_success() => return self.read_landing(reply),
                Ok(reply) => FailureKind::Status(reply.status),
                Err(err) => FailureKind::Transport(err),
            };

            match policy.next_action(attempt, &failure, rand::rng().random::<f64>()) {
                NextAction::Retry(delay) | NextAction::SwitchToPatient(delay) => {
                    warn!(
                        state = ?DownloadState::Backoff { attempt },
                        failure = %failure,
                        delay_ms = delay.as_millis() as u64,
                        next_attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        "GET form failed; retrying"
                    );
                    self.clock.sleep(delay);
                    last = Some(failure);
                }
                NextAction::Fail => return Err(failure_error("GET form", attempt, failure)),
            }
        }

        Err(IngestError::DownloadExhausted {
            stage: "GET form",
            attempts: policy.max_attempts,
            last: last.map(|f| f.to_string()).unwrap_or_default(),
        })
    }

    fn read_landing(&self, reply: HttpReply) -> Result<FormPage, IngestError> {
        info!(url = %reply.url, bytes = reply.body.len(), "landed on download form");
        let html = reply.text();
        if !has_form_markers(&html) {
            let path = self.layout.save_diagnostic("page_debug.html", &reply.body);
            return Err(IngestError::NotAForm(path.into_std_path_buf()));
        }
        let page = FormPage::parse(&html)?;
        debug!(
            years = page.available_years.len(),
            periods = page.available_periods.len(),
            "form tokens harvested"
        );
        Ok(page)
    }
}

pub(crate) fn failure_error(
    stage: &'static str,
    attempt: u32,
    failure: FailureKind,
) -> IngestError {
    match failure {
        FailureKind::Status(status) => IngestError::HttpStatus {
            status,
            message: format!("{stage} rejected"),
        },
        FailureKind::BadContentType(content_type) => {
            IngestError::UnexpectedContentType { content_type }
        }
        FailureKind::Transport(err) if !err.is_transient() => IngestError::Http(err.to_string()),
        FailureKind::Transport(err) => IngestError::DownloadExhausted {
            stage,
            attempts: attempt,
            last: err.to_string(),
        },
    }
}
