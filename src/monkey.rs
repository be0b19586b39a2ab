//! In-flight build tasks.
//!
//! A `Monkey` is the record of one job executing on this worker. The
//! [`JobTable`] holds exactly one record per job id for as long as the task
//! runs; the task's [`TableEntry`] guard removes it on every exit path,
//! including a panic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ContextCache;
use crate::clients::{JobQueueClient, NameResolver, ResolutionPath, ResolveError};
use crate::fanout::{FanOut, JobStatus, StatusUpdate};
use crate::types::{BranchName, ChannelName, CommitId, Fingerprint, JobId, ProjectId};
use crate::vm::{Context, InvocationError, Vm, VmError};

/// Payload of a job-queue notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub id: JobId,
    pub meta: JobMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    pub repository: Repository,
    /// Commit to build; the branch head when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub project: ProjectId,
    #[serde(default = "default_branch")]
    pub branch: BranchName,
}

fn default_branch() -> BranchName {
    BranchName::new("master")
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed job message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("job message has an empty {0}")]
    Empty(&'static str),
}

impl JobMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let message: JobMessage = serde_json::from_slice(payload)?;
        if message.id.as_str().trim().is_empty() {
            return Err(DecodeError::Empty("id"));
        }
        if message.meta.repository.project.as_str().trim().is_empty() {
            return Err(DecodeError::Empty("project"));
        }
        Ok(message)
    }
}

/// Build instructions published for a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Script identifier handed to the VM.
    pub script: String,
    /// Function invoked to run the build.
    #[serde(default = "default_entry")]
    pub entry: String,
    #[serde(default)]
    pub args: Vec<Value>,
    /// Spec revision; part of the fingerprint.
    #[serde(default)]
    pub version: String,
}

fn default_entry() -> String {
    "build".to_string()
}

/// Why a job failed.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("invalid build spec at `{path}`: {message}")]
    InvalidSpec { path: String, message: String },

    #[error("compilation failed: {0}")]
    Compile(#[from] VmError),

    #[error("invocation failed: {0}")]
    Invocation(#[from] InvocationError),

    #[error("worker is shutting down")]
    Shutdown,

    #[error("task aborted: {0}")]
    Aborted(String),
}

/// Record of one in-flight job.
#[derive(Debug, Clone)]
pub struct Monkey {
    pub id: JobId,
    pub fingerprint: Option<Fingerprint>,
    pub status: JobStatus,
    pub token: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl Monkey {
    pub fn new(id: JobId, token: CancellationToken) -> Self {
        Self {
            id,
            fingerprint: None,
            status: JobStatus::Pending,
            token,
            started_at: Utc::now(),
        }
    }
}

/// Serializable view of a [`Monkey`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    pub started_at: DateTime<Utc>,
}

/// Job id → in-flight record.
#[derive(Clone, Default)]
pub struct JobTable {
    inner: Arc<Mutex<HashMap<JobId, Monkey>>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Monkey>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `monkey` unless its id is already in flight.
    ///
    /// The returned guard removes the record when dropped.
    pub fn try_insert(&self, monkey: Monkey) -> Option<TableEntry> {
        let mut jobs = self.lock();
        if jobs.contains_key(&monkey.id) {
            return None;
        }
        let id = monkey.id.clone();
        jobs.insert(id.clone(), monkey);
        Some(TableEntry {
            table: self.clone(),
            id,
        })
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn get(&self, id: &JobId) -> Option<Monkey> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Summaries of every in-flight job, oldest first.
    pub fn snapshot(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<JobSummary> = self
            .lock()
            .values()
            .map(|m| JobSummary {
                id: m.id.clone(),
                status: m.status,
                fingerprint: m.fingerprint.clone(),
                started_at: m.started_at,
            })
            .collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    fn update(&self, id: &JobId, f: impl FnOnce(&mut Monkey)) {
        if let Some(monkey) = self.lock().get_mut(id) {
            f(monkey);
        }
    }

    fn remove(&self, id: &JobId) -> Option<Monkey> {
        self.lock().remove(id)
    }
}

/// Ownership of one table record. Dropping it removes the record.
pub struct TableEntry {
    table: JobTable,
    id: JobId,
}

impl TableEntry {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn set_status(&self, status: JobStatus) {
        self.table.update(&self.id, |m| m.status = status);
    }

    pub fn set_fingerprint(&self, fingerprint: Fingerprint) {
        self.table.update(&self.id, |m| m.fingerprint = Some(fingerprint));
    }
}

impl Drop for TableEntry {
    fn drop(&mut self) {
        if self.table.remove(&self.id).is_some() {
            debug!(job_id = %self.id, "Job removed from table");
        }
    }
}

/// Everything a build task needs from the service.
pub struct JobRunner {
    pub queue: Arc<dyn JobQueueClient>,
    pub resolver: Arc<dyn NameResolver>,
    pub vm: Arc<dyn Vm>,
    pub cache: Arc<ContextCache>,
    pub fanout: Arc<FanOut>,
    /// Admission limit; `None` admits every job at once.
    pub admission: Option<Arc<Semaphore>>,
}

impl JobRunner {
    /// Run one job to a terminal outcome.
    ///
    /// Publishes `running` once execution starts and exactly one terminal
    /// update; reports the outcome to the job queue; drops `entry` last.
    pub async fn run(&self, entry: TableEntry, job: JobMessage, token: CancellationToken) {
        let channel = ChannelName::for_job(&job.id);
        info!(job_id = %job.id, project = %job.meta.repository.project, "Job started");

        let update = match self.execute(&entry, &job, &channel, &token).await {
            Ok(result) => {
                info!(job_id = %job.id, "Job succeeded");
                StatusUpdate::succeeded(job.id.clone(), result)
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Job failed");
                StatusUpdate::failed(job.id.clone(), e.to_string())
            }
        };

        entry.set_status(update.status);
        self.fanout.publish(&channel, &update).await;
        if let Err(e) = self.queue.report(&update).await {
            warn!(job_id = %job.id, error = %e, "Failed to report job outcome");
        }

        drop(entry);
    }

    async fn execute(
        &self,
        entry: &TableEntry,
        job: &JobMessage,
        channel: &ChannelName,
        token: &CancellationToken,
    ) -> Result<Value, JobError> {
        let _permit = match &self.admission {
            Some(admission) => Some(tokio::select! {
                permit = admission.clone().acquire_owned() => {
                    permit.map_err(|_| JobError::Shutdown)?
                }
                _ = token.cancelled() => return Err(JobError::Shutdown),
            }),
            None => None,
        };

        let repository = &job.meta.repository;
        let commit = match &job.meta.commit {
            Some(commit) => commit.clone(),
            None => {
                let path = ResolutionPath::current(&repository.project, &repository.branch);
                let value = self.resolve(&path, token).await?;
                commit_from(&path, value)?
            }
        };

        let path = ResolutionPath::build(&repository.project, &repository.branch, &commit);
        let value = self.resolve(&path, token).await?;
        let spec: JobSpec = serde_json::from_value(value).map_err(|e| JobError::InvalidSpec {
            path: path.to_string(),
            message: e.to_string(),
        })?;

        let fingerprint = Fingerprint::derive(&[
            repository.project.as_str(),
            commit.as_str(),
            &spec.script,
            &spec.version,
        ]);
        entry.set_fingerprint(fingerprint.clone());
        debug!(job_id = %job.id, %fingerprint, script = %spec.script, "Resolved build spec");

        let context = self.context_for(&fingerprint, &spec.script).await?;
        if token.is_cancelled() {
            return Err(JobError::Shutdown);
        }

        entry.set_status(JobStatus::Running);
        self.fanout
            .publish(channel, &StatusUpdate::running(job.id.clone()))
            .await;

        let JobSpec { entry: function, args, .. } = spec;
        let result = tokio::task::spawn_blocking(move || context.call_host(&function, args))
            .await
            .map_err(|e| JobError::Aborted(e.to_string()))?;

        Ok(result?)
    }

    async fn resolve(&self, path: &ResolutionPath, token: &CancellationToken) -> Result<Value, JobError> {
        tokio::select! {
            result = self.resolver.resolve(path) => Ok(result?),
            _ = token.cancelled() => Err(JobError::Shutdown),
        }
    }

    async fn context_for(&self, fingerprint: &Fingerprint, script: &str) -> Result<Arc<dyn Context>, JobError> {
        let vm = self.vm.clone();
        let script = script.to_string();

        self.cache
            .get_or_compile(fingerprint, || async move {
                tokio::task::spawn_blocking(move || vm.compile(&script))
                    .await
                    .map_err(|e| JobError::Aborted(e.to_string()))?
                    .map_err(JobError::from)
            })
            .await
    }
}

/// The branch head is published either as a bare string or as
/// `{ "commit": "<id>" }`.
fn commit_from(path: &ResolutionPath, value: Value) -> Result<CommitId, JobError> {
    let commit = match &value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("commit").and_then(Value::as_str),
        _ => None,
    };

    match commit {
        Some(c) if !c.trim().is_empty() => Ok(CommitId::new(c)),
        _ => Err(JobError::InvalidSpec {
            path: path.to_string(),
            message: "expected a commit id".to_string(),
        }),
    }
}
