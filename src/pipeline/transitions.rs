//! Step implementations for [`Attempt`].

use std::time::Duration;

use metrics::counter;

use super::state::{
    Aborted, Attempt, Classified, Done, Pacing, Parsing, Resolving, StepResult, Submitting,
};
use crate::batch::Classification;
use crate::error::Result;
use crate::http::HttpClient;
use crate::storage::{StorageResolver, remove_quietly};
use crate::upstream::UpstreamClient;

fn step_failed(step: &'static str, error: &crate::error::CourierError) {
    counter!("courier_pipeline_step_failures_total", "step" => step, "reason" => error.kind())
        .increment(1);
}

impl Attempt<Resolving> {
    /// Make the job's file available locally.
    pub async fn resolve(self, resolver: &StorageResolver) -> Result<Attempt<Parsing>> {
        let file = resolver.resolve(&self.data.file_ref).await.inspect_err(|e| {
            step_failed("resolve", e);
            tracing::warn!(file_ref = %self.data.file_ref, error = %e, "Failed to resolve file");
        })?;

        tracing::debug!(path = %file.path.display(), fetched = file.fetched, "File resolved");
        Ok(Attempt {
            data: self.data,
            state: Parsing { file },
        })
    }
}

impl Attempt<Parsing> {
    /// Send the file to the parser.
    pub async fn parse<H: HttpClient>(self, upstream: &UpstreamClient<H>) -> StepResult<Submitting> {
        let file = self.state.file;
        match upstream
            .parse(
                &file.path,
                &self.data.original_name,
                self.data.location.as_deref(),
            )
            .await
        {
            Ok(candidate) => Ok(Attempt {
                data: self.data,
                state: Submitting { file, candidate },
            }),
            Err(error) => {
                step_failed("parse", &error);
                Err(Aborted { error, file })
            }
        }
    }
}

impl Attempt<Submitting> {
    /// Submit the file and parsed data to the backend and classify its answer.
    pub async fn submit<H: HttpClient>(self, upstream: &UpstreamClient<H>) -> StepResult<Classified> {
        let Submitting { file, candidate } = self.state;
        match upstream
            .apply(
                &self.data.target_id,
                &file.path,
                &self.data.original_name,
                &candidate,
                self.data.auth_token.as_deref(),
            )
            .await
        {
            Ok(classification) => {
                if classification == Classification::AlreadyProcessed {
                    tracing::info!(file = %self.data.original_name, "Already applied (403)");
                }
                Ok(Attempt {
                    data: self.data,
                    state: Classified {
                        file,
                        classification,
                    },
                })
            }
            Err(error) => {
                step_failed("submit", &error);
                Err(Aborted { error, file })
            }
        }
    }
}

impl Attempt<Classified> {
    /// Delete the local file; the job has reached a terminal classification.
    pub async fn clean_up(self) -> Attempt<Pacing> {
        remove_quietly(&self.state.file.path).await;
        Attempt {
            data: self.data,
            state: Pacing {
                classification: self.state.classification,
            },
        }
    }
}

impl Attempt<Pacing> {
    /// Throttle before the worker takes its next job.
    pub async fn pace(self, delay: Duration) -> Attempt<Done> {
        if !delay.is_zero() {
            tracing::debug!(delay_ms = delay.as_millis() as u64, "Pacing");
            tokio::time::sleep(delay).await;
        }
        Attempt {
            data: self.data,
            state: Done {
                classification: self.state.classification,
            },
        }
    }
}
