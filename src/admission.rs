//! Admission: everything that happens before a request is handed off.
//!
//! Order is fixed: authenticate, check model permission, check budget, apply
//! the rate limit, consult the cache, then create a `PENDING` ledger row and
//! enqueue. Failures before the ledger step leave no trace in the ledger.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::projects::{Project, ProjectRegistry};
use crate::budget::{BudgetCheck, BudgetGuard};
use crate::cache::ResponseCache;
use crate::dispatch::{DispatchTask, Dispatcher, Executor};
use crate::error::AppError;
use crate::ledger::{Ledger, Outcome, RequestRecord, RequestStatus};
use crate::limits::RateLimiter;
use crate::providers::ProviderInput;
use crate::providers::pattern::matches_any;
use crate::providers::rotation::{KeyPoolStatus, KeyRotation, RotationScope};

/// What a successful admission produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Served from the response cache; `request_id` is the originating request.
    Cached {
        request_id: String,
        content: String,
        model: String,
    },
    /// Queued for out-of-band execution.
    Accepted { request_id: String },
    /// Executed synchronously (audio).
    Completed { request_id: String, content: String },
}

#[derive(Debug, Clone)]
pub struct Submitted {
    pub outcome: SubmitOutcome,
    /// Set when the project is past its warning or emergency threshold.
    pub budget_warning: Option<String>,
}

/// Response shape for `/status/{id}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub request_id: String,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    pub message: String,
}

pub struct Admission {
    pub projects: ProjectRegistry,
    pub limiter: RateLimiter,
    pub budget: Arc<BudgetGuard>,
    pub cache: Arc<ResponseCache>,
    pub ledger: Ledger,
    pub rotation: Arc<KeyRotation>,
    pub dispatcher: Dispatcher,
    /// Used directly for synchronous audio transcription.
    pub executor: Arc<Executor>,
    /// Give each project its own round-robin cursor.
    pub per_project_rotation: bool,
    /// Transcription model used when the caller names none, or names one
    /// outside `audio_model_patterns`.
    pub audio_model: String,
    /// Caller models forwarded to the transcription endpoint unchanged.
    pub audio_model_patterns: Vec<String>,
}

impl Admission {
    /// Admit a text or chat request. Audio inputs are transcribed synchronously.
    pub async fn submit(
        &self,
        token: &str,
        model: &str,
        input: ProviderInput,
    ) -> Result<Submitted, AppError> {
        let input = match input {
            ProviderInput::Audio { bytes, format } => {
                let model = (!model.trim().is_empty()).then_some(model);
                return self.submit_audio(token, model, bytes, &format).await;
            }
            other => other,
        };

        let model = model.trim();
        if model.is_empty() {
            return Err(AppError::BadRequest("model is required".to_string()));
        }
        if input.prompt_text().trim().is_empty() {
            return Err(AppError::BadRequest(
                "input, messages or audio is required".to_string(),
            ));
        }

        let (project, check) = self.admit(token, model)?;
        let budget_warning = check.warning_message();

        match self.cache.get(model, &input) {
            Ok(Some(hit)) => {
                debug!(project_id = %project.id, model, "Serving cached response");
                return Ok(Submitted {
                    outcome: SubmitOutcome::Cached {
                        request_id: hit.request_id,
                        content: hit.content,
                        model: model.to_string(),
                    },
                    budget_warning,
                });
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Cache lookup failed, treating as miss"),
        }

        let task = self.open_request(&project, model, input)?;
        let request_id = task.request_id.clone();
        if let Err(e) = self.dispatcher.enqueue(task).await {
            self.ledger
                .finalize(&request_id, &Outcome::failure(None, e.to_string(), 0))?;
            return Err(e);
        }
        debug!(request_id = %request_id, project_id = %project.id, model, "Request accepted");

        Ok(Submitted {
            outcome: SubmitOutcome::Accepted { request_id },
            budget_warning,
        })
    }

    /// Admit and synchronously transcribe an audio clip.
    pub async fn submit_audio(
        &self,
        token: &str,
        model: Option<&str>,
        bytes: Vec<u8>,
        format: &str,
    ) -> Result<Submitted, AppError> {
        if bytes.is_empty() {
            return Err(AppError::BadRequest("audio payload is empty".to_string()));
        }
        let requested = model.map(str::trim).filter(|m| !m.is_empty());
        let upstream = self.transcription_model(requested).to_string();
        if let Some(requested) = requested.filter(|m| *m != upstream) {
            debug!(requested, model = %upstream, "Substituting transcription model");
        }

        // Permission is checked against what the caller asked for.
        let (project, check) = self.admit(token, requested.unwrap_or(upstream.as_str()))?;
        let input = ProviderInput::Audio {
            bytes,
            format: format.to_string(),
        };
        let task = self.open_request(&project, &upstream, input)?;
        let completion = self.executor.execute(&task).await?;

        Ok(Submitted {
            outcome: SubmitOutcome::Completed {
                request_id: task.request_id,
                content: completion.content,
            },
            budget_warning: check.warning_message(),
        })
    }

    /// Status of a request as seen by the calling project. Unknown ids and
    /// other projects' ids both read as pending.
    pub fn get_status(&self, token: &str, request_id: &str) -> Result<StatusView, AppError> {
        let project = self.projects.authenticate(token)?;
        let view = match self.ledger.get_for_project(&project.id, request_id)? {
            Some(record) => StatusView {
                request_id: record.id,
                status: record.status,
                created_at: Some(record.created_at),
                message: match record.status {
                    RequestStatus::Pending => "Request is being processed".to_string(),
                    RequestStatus::Success => "Request completed".to_string(),
                    RequestStatus::Error => record
                        .error
                        .unwrap_or_else(|| "Request failed".to_string()),
                },
            },
            None => StatusView {
                request_id: request_id.to_string(),
                status: RequestStatus::Pending,
                created_at: None,
                message: "Request is pending or not yet recorded".to_string(),
            },
        };
        Ok(view)
    }

    /// Full ledger record owned by the calling project.
    pub fn get_result(
        &self,
        token: &str,
        request_id: &str,
    ) -> Result<RequestRecord, AppError> {
        let project = self.projects.authenticate(token)?;
        self.ledger
            .get_for_project(&project.id, request_id)?
            .ok_or_else(|| AppError::NotFound(format!("Request not found: {request_id}")))
    }

    /// Key pool status in the caller's rotation scope.
    pub fn key_status(&self, token: &str) -> Result<Vec<KeyPoolStatus>, AppError> {
        let project = self.projects.authenticate(token)?;
        self.rotation.status(&self.scope_for(&project))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Model sent upstream for a clip. Text model names never reach the
    /// transcription endpoint.
    fn transcription_model<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        match requested {
            Some(m) if m == self.audio_model || matches_any(&self.audio_model_patterns, m) => m,
            _ => &self.audio_model,
        }
    }

    /// Steps 1-4: authenticate, permission, budget, rate limit.
    fn admit(&self, token: &str, model: &str) -> Result<(Project, BudgetCheck), AppError> {
        let project = self.projects.authenticate(token)?;

        if !project.allows_model(model) {
            return Err(AppError::Forbidden(format!(
                "Model {model} is not permitted for this project"
            )));
        }

        let check = self.budget.check(&project);
        if !check.within_budget {
            return Err(AppError::BudgetExceeded {
                project_id: project.id,
            });
        }

        self.limiter
            .admit(&project.id, &project.rate_limits())?
            .into_result()?;

        Ok((project, check))
    }

    fn scope_for(&self, project: &Project) -> RotationScope {
        if self.per_project_rotation {
            RotationScope::Project(project.id.clone())
        } else {
            RotationScope::Global
        }
    }

    /// Create the `PENDING` ledger row and the task that will finalize it.
    fn open_request(
        &self,
        project: &Project,
        model: &str,
        input: ProviderInput,
    ) -> Result<DispatchTask, AppError> {
        let request_id = format!("req_{}", Uuid::new_v4().simple());
        let request_body = serde_json::to_string(&serde_json::json!({
            "model": model,
            "input": &input,
        }))?;
        self.ledger
            .create_pending(&request_id, &project.id, model, &request_body)?;
        Ok(DispatchTask {
            request_id,
            project_id: project.id.clone(),
            model: model.to_string(),
            input,
            scope: self.scope_for(project),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
