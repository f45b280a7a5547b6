use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::budget::BudgetGuard;
use crate::cache::ResponseCache;
use crate::dispatch::DispatchTask;
use crate::error::AppError;
use crate::ledger::{Ledger, Outcome};
use crate::providers::cost::CostCalculator;
use crate::providers::retry::{RetryPolicy, execute_provider_with_retry};
use crate::providers::rotation::KeyRotation;
use crate::providers::router::ProviderRouter;
use crate::providers::{AdapterSet, Completion, Provider, ProviderError, ProviderFamily};

/// Runs one dispatched request end to end.
///
/// Route, select a key, call the adapter (retrying transient failures with
/// the same key), price the result, finalize the ledger row, then populate the
/// cache and charge the project. A failure at any step finalizes the row as
/// `ERROR` with no charge and no cache write.
pub struct Executor {
    pub router: ProviderRouter,
    pub rotation: Arc<KeyRotation>,
    pub adapters: AdapterSet,
    pub costs: CostCalculator,
    pub ledger: Ledger,
    pub cache: Arc<ResponseCache>,
    pub budget: Arc<BudgetGuard>,
    pub retry: RetryPolicy,
    /// Log prompt and completion text at debug level.
    pub log_content: bool,
}

impl Executor {
    /// Execute `task` and return the completion. The ledger row is terminal
    /// when this returns, whichever way it returns.
    pub async fn execute(&self, task: &DispatchTask) -> Result<Completion, AppError> {
        let started = Instant::now();
        let provider = self.router.route(&task.model, task.input.has_audio());

        if self.log_content {
            debug!(
                request_id = %task.request_id,
                prompt = %task.input.prompt_text(),
                "Dispatching request"
            );
        }

        let result = self.call_provider(provider, task).await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(completion) => {
                let cost = match provider.family() {
                    ProviderFamily::AudioTranscription => self.costs.audio_cost(),
                    ProviderFamily::TextCompletion => {
                        self.costs.text_cost(&task.model, &completion.usage)
                    }
                };
                let outcome = Outcome::success(provider, &completion, cost, latency_ms)?;
                if self.ledger.finalize(&task.request_id, &outcome)? {
                    if let Err(e) = self.cache.put(
                        &task.model,
                        &task.input,
                        &completion.content,
                        &task.request_id,
                    ) {
                        warn!(request_id = %task.request_id, error = %e, "Cache write failed");
                    }
                    self.budget.record_usage(&task.project_id, cost)?;
                }
                if self.log_content {
                    debug!(request_id = %task.request_id, content = %completion.content, "Completion");
                }
                info!(
                    request_id = %task.request_id,
                    project_id = %task.project_id,
                    provider = %provider,
                    model = %task.model,
                    cost,
                    latency_ms,
                    "Request succeeded"
                );
                Ok(completion)
            }
            Err(e) => {
                let message = e.to_string();
                self.ledger.finalize(
                    &task.request_id,
                    &Outcome::failure(Some(provider), message.clone(), latency_ms),
                )?;
                warn!(
                    request_id = %task.request_id,
                    project_id = %task.project_id,
                    provider = %provider,
                    model = %task.model,
                    error = %message,
                    "Request failed"
                );
                Err(AppError::Provider(message))
            }
        }
    }

    /// [`execute`](Self::execute) for fire-and-forget callers. Outcomes are
    /// already in the ledger, so only unexpected errors are logged here.
    pub async fn run(&self, task: DispatchTask) {
        match self.execute(&task).await {
            Ok(_) | Err(AppError::Provider(_)) => {}
            Err(e) => {
                tracing::error!(request_id = %task.request_id, error = %e, "Dispatch bookkeeping failed");
            }
        }
    }

    async fn call_provider(
        &self,
        provider: Provider,
        task: &DispatchTask,
    ) -> Result<Completion, ProviderError> {
        let adapter = self
            .adapters
            .get(provider)
            .ok_or_else(|| ProviderError::Other(format!("No adapter registered for {provider}")))?;

        let credential = match self.rotation.next_key(provider, &task.scope, Some(&task.model)) {
            Ok(credential) => credential,
            Err(AppError::Provider(message)) => return Err(ProviderError::Other(message)),
            Err(other) => return Err(ProviderError::Other(other.to_string())),
        };

        let adapter = adapter.as_ref();
        let credential = &credential;
        let model = task.model.as_str();
        let input = &task.input;
        execute_provider_with_retry(&self.retry, move || adapter.invoke(credential, model, input))
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
