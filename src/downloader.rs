use rand::Rng;
use tracing::{debug, info, warn};

use crate::clock::{Clock, courtesy_pause};
use crate::error::IngestError;
use crate::form::{FormPayload, FormSession, failure_error};
use crate::retry::{DownloadState, FailureKind, NextAction};
use crate::transport::{FormTransport, HttpReply, is_archive_content_type};

impl<T: FormTransport, C: Clock> FormSession<T, C> {
    /// POST the form and return the archive bytes. With patient mode on, the
    /// last attempt is streamed. The unit deadline is checked before every attempt.
    pub fn submit(&self, payload: &FormPayload) -> Result<Vec<u8>, IngestError> {
        let settings = &self.settings;
        let policy = settings.policy;
        let started = self.clock.now();
        let mut last: Option<FailureKind> = None;

        for attempt in 1..=policy.max_attempts {
            let elapsed = self.clock.now().saturating_duration_since(started);
            if elapsed > settings.unit_deadline {
                warn!(
                    attempt,
                    elapsed_s = elapsed.as_secs(),
                    "per-unit deadline exceeded before attempt"
                );
                return Err(IngestError::DeadlineExceeded {
                    limit_secs: settings.unit_deadline.as_secs(),
                });
            }

            courtesy_pause(&self.clock, settings.courtesy_delay);

            let patient = policy.is_patient(attempt);
            let state = if patient {
                DownloadState::PatientFinal { attempt }
            } else {
                DownloadState::Attempting { attempt }
            };
            if patient {
                warn!(
                    ?state,
                    max_attempts = policy.max_attempts,
                    read_timeout_s = settings.patient_read_timeout.as_secs(),
                    "switching to patient streaming mode"
                );
            } else {
                debug!(?state, "POST form");
            }

            let outcome = if patient {
                self.transport.post_form_streamed(
                    &settings.form_url,
                    payload.fields(),
                    settings.patient_read_timeout,
                    settings.stream,
                )
            } else {
                self.transport
                    .post_form(&settings.form_url, payload.fields(), settings.read_timeout)
            };

            let failure = match outcome {
                Ok(reply) => match self.check_archive(reply) {
                    Ok(body) => {
                        info!(
                            state = ?DownloadState::Succeeded { attempt },
                            bytes = body.len(),
                            "archive received"
                        );
                        return Ok(body);
                    }
                    Err(failure) => failure,
                },
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
                        "POST form failed; retrying"
                    );
                    self.clock.sleep(delay);
                    last = Some(failure);
                }
                NextAction::Fail => {
                    warn!(
                        state = ?DownloadState::Failed { attempt },
                        failure = %failure,
                        "POST form failed"
                    );
                    return Err(failure_error("POST form", attempt, failure));
                }
            }
        }

        Err(IngestError::DownloadExhausted {
            stage: "POST form",
            attempts: policy.max_attempts,
            last: last.map(|f| f.to_string()).unwrap_or_default(),
        })
    }

    fn check_archive(&self, reply: HttpReply) -> Result<Vec<u8>, FailureKind> {
        if !reply.is_success() {
            return Err(FailureKind::Status(reply.status));
        }
        if !is_archive_content_type(&reply.content_type) {
            let path = self.layout.save_diagnostic("error_not_zip.html", &reply.body);
            warn!(
                content_type = %reply.content_type,
                snapshot = %path,
                "expected a ZIP archive"
            );
            return Err(FailureKind::BadContentType(reply.content_type));
        }
        Ok(reply.body)
    }
}
