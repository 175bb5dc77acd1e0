//! Validate a request, admit it, run the diagnostic and store its output.

use crate::config::Settings;
use diagnostics::{Category, IpVersion, Programs, RequestError};
use lg_core::ratelimiter::{Admission, RateLimited};
use lg_core::runner::{CommandRunner, RunStatus};
use results_sqlite::{Db, StoreError, Token};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid request: {0}")]
    InvalidInput(#[from] RequestError),
    #[error(transparent)]
    RateLimited(#[from] RateLimited),
    #[error("{category} produced no usable output ({status:?})")]
    Execution { category: Category, status: RunStatus },
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("shutting down")]
    ShuttingDown,
}

pub struct Jobs {
    store: Arc<Db>,
    admission: Admission,
    runner: CommandRunner,
    programs: Programs,
    cancel: CancellationToken,
}

impl Jobs {
    pub fn new(store: Arc<Db>, admission: Admission, runner: CommandRunner, programs: Programs) -> Self {
        Jobs { store, admission, runner, programs, cancel: CancellationToken::new() }
    }

    pub fn from_settings(store: Arc<Db>, s: &Settings) -> Self {
        let admission = Admission::new(s.client_bucket, s.client_mode, s.client_idle, s.global_bucket);
        let runner = CommandRunner::new(s.run_timeout, s.max_output_bytes);
        Jobs::new(store, admission, runner, s.programs.clone())
    }

    pub fn store(&self) -> &Arc<Db> { &self.store }

    /// Run one diagnostic on behalf of `client_key` and return the token under
    /// which its output was stored.
    pub async fn run(&self, category: Category, target: &str, version: IpVersion, client_key: &str) -> Result<Token, JobError> {
        if self.cancel.is_cancelled() {
            return Err(JobError::ShuttingDown);
        }
        let inv = diagnostics::build(category, target, version, &self.programs)?;

        tokio::select! {
            res = self.admission.admit(client_key) => {
                if let Err(e) = res {
                    debug!(%category, client = client_key, retry_after = ?e.retry_after, "rate limited");
                    return Err(e.into());
                }
            }
            _ = self.cancel.cancelled() => return Err(JobError::ShuttingDown),
        }

        let out = self.runner.run(&inv.program, &inv.args, &self.cancel).await;
        let payload = trim_ascii_ws(&out.output);
        let keep = match out.status {
            RunStatus::Success => true,
            RunStatus::SpawnFailed { .. } | RunStatus::Cancelled => false,
            _ => !payload.is_empty(),
        };
        if !keep {
            warn!(%category, target, status = ?out.status, "diagnostic failed, nothing stored");
            return Err(JobError::Execution { category, status: out.status });
        }

        let store = Arc::clone(&self.store);
        let payload = payload.to_vec();
        let token = tokio::task::spawn_blocking(move || store.put(category.as_str(), &payload))
            .await?
            .map_err(|e| {
                error!(%category, error = %e, "failed to store result");
                e
            })?;
        info!(
            %category,
            target,
            %token,
            status = ?out.status,
            elapsed_ms = out.elapsed.as_millis() as u64,
            "diagnostic stored"
        );
        Ok(token)
    }

    /// Look up a stored result. Malformed ids are simply not found.
    pub async fn fetch(&self, category: Category, id: &str) -> Result<Option<Vec<u8>>, JobError> {
        let store = Arc::clone(&self.store);
        let id = id.to_string();
        let res = tokio::task::spawn_blocking(move || store.get(category.as_str(), &id)).await??;
        Ok(res)
    }

    /// Refuse new runs and kill the ones in flight.
    pub fn cancel_running(&self) { self.cancel.cancel(); }

    pub fn close(&self) {
        self.cancel.cancel();
        self.store.close();
    }
}

fn trim_ascii_ws(b: &[u8]) -> &[u8] {
    let start = b.iter().position(|c| !c.is_ascii_whitespace()).unwrap_or(b.len());
    let end = b.iter().rposition(|c| !c.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &b[start..end]
}
