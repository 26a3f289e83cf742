//! Running user work on leased activities.
//!
//! A [`Work`] is an async function of a [`WorkContext`]. Work managers obtain
//! activities, run the work and wrap its outcome in a [`WorkResult`]. Policies
//! such as retries and redundancy are [`WorkPlugin`]s: functions turning one
//! [`DoWork`] into another. Manager plugins wrap the base call first, then the
//! plugins attached to the work itself wrap the result.

mod asynchronous;
mod concurrent;
mod plugins;
mod sequential;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::manager::{ActivitySource, Manager, ManagerError};
use crate::resource::{Activity, BatchEvent, Command, Properties, ResourceError};

pub use asynchronous::AsynchronousWorkManager;
pub use concurrent::ConcurrentWorkManager;
pub use plugins::{redundancy_cancel_others_on_first_done, retry, retry_with_backoff};
pub use sequential::SequentialWorkManager;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    #[error("Work failed: {0}")]
    Failed(String),
    #[error("Work cancelled")]
    Cancelled,
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// Outcome of one work call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkResult {
    pub result: Option<Value>,
    #[serde(serialize_with = "error_message")]
    pub error: Option<WorkError>,
    /// Data attached by plugins, keyed by plugin name.
    pub extras: Properties,
}

fn error_message<S: Serializer>(error: &Option<WorkError>, serializer: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_some(&error.to_string()),
        None => serializer.serialize_none(),
    }
}

impl WorkResult {
    pub fn success(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn failure(error: WorkError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub type WorkFn = Arc<dyn Fn(WorkContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Runs one work item, returning its result. Never fails outright.
pub type DoWork = Arc<dyn Fn(Work) -> BoxFuture<'static, WorkResult> + Send + Sync>;

/// Wraps a [`DoWork`] with some policy.
pub type WorkPlugin = Arc<dyn Fn(DoWork) -> DoWork + Send + Sync>;

/// Identifies one work item across retries and redundant attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkId(uuid::Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone)]
pub struct Work {
    id: WorkId,
    name: String,
    func: WorkFn,
    plugins: Vec<WorkPlugin>,
}

impl Work {
    pub fn new(name: impl Into<String>, func: WorkFn) -> Self {
        Self {
            id: WorkId::new(),
            name: name.into(),
            func,
            plugins: Vec::new(),
        }
    }

    /// Attach a plugin applied only to this work, outside the manager's plugins.
    pub fn with_plugin(mut self, plugin: WorkPlugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn id(&self) -> WorkId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the work on `context`. Errors are captured in the result.
    pub async fn call(&self, context: WorkContext) -> WorkResult {
        match (self.func)(context).await {
            Ok(value) => WorkResult::success(value),
            Err(e) => match e.downcast::<WorkError>() {
                Ok(error) => WorkResult::failure(error),
                Err(e) => WorkResult::failure(WorkError::Failed(format!("{e:#}"))),
            },
        }
    }
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Work")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

/// Handle through which work drives its activity.
#[derive(Debug, Clone)]
pub struct WorkContext {
    activity: Activity,
}

impl WorkContext {
    pub fn new(activity: Activity) -> Self {
        Self { activity }
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    pub async fn deploy(&self, args: Option<Value>) -> Result<(), WorkError> {
        self.batch().deploy(args).execute().await.map(|_| ())
    }

    pub async fn start(&self) -> Result<(), WorkError> {
        self.batch().start().execute().await.map(|_| ())
    }

    pub async fn run(
        &self,
        entry_point: impl Into<String>,
        args: Vec<String>,
    ) -> Result<Vec<BatchEvent>, WorkError> {
        self.batch().run(entry_point, args).execute().await
    }

    /// Destroy the activity.
    pub async fn terminate(&self) -> Result<(), WorkError> {
        self.activity.destroy().await?;
        Ok(())
    }

    pub fn batch(&self) -> Batch {
        Batch {
            activity: self.activity.clone(),
            script: Vec::new(),
            timeout: None,
        }
    }
}

/// A script of commands executed on the activity in one round trip.
#[derive(Debug)]
#[must_use = "a batch does nothing until executed"]
pub struct Batch {
    activity: Activity,
    script: Vec<Command>,
    timeout: Option<Duration>,
}

impl Batch {
    pub fn deploy(mut self, args: Option<Value>) -> Self {
        self.script.push(Command::Deploy { args });
        self
    }

    pub fn start(mut self) -> Self {
        self.script.push(Command::Start);
        self
    }

    pub fn run(mut self, entry_point: impl Into<String>, args: Vec<String>) -> Self {
        self.script.push(Command::Run {
            entry_point: entry_point.into(),
            args,
        });
        self
    }

    pub fn send_file(mut self, src: impl Into<String>, dst: impl Into<String>) -> Self {
        self.script.push(Command::SendFile {
            src: src.into(),
            dst: dst.into(),
        });
        self
    }

    pub fn download_file(mut self, src: impl Into<String>, dst: impl Into<String>) -> Self {
        self.script.push(Command::DownloadFile {
            src: src.into(),
            dst: dst.into(),
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn execute(self) -> Result<Vec<BatchEvent>, WorkError> {
        let events = self.activity.run_script(self.script, self.timeout).await?;
        Ok(events)
    }
}

#[async_trait]
pub trait WorkManager: Manager {
    async fn do_work(&self, work: Work) -> WorkResult;

    async fn do_work_list(&self, works: Vec<Work>) -> Vec<WorkResult>;
}

/// Wrap `base` in the manager plugins, then in the plugins attached to `work`.
pub(crate) fn with_plugins(base: DoWork, manager_plugins: &[WorkPlugin], work: &Work) -> DoWork {
    let wrapped = manager_plugins
        .iter()
        .fold(base, |do_work, plugin| plugin(do_work));
    work.plugins
        .iter()
        .fold(wrapped, |do_work, plugin| plugin(do_work))
}

/// Base call: lease an activity from `source` and run the work on it.
pub(crate) fn on_leased_activity(source: ActivitySource) -> DoWork {
    Arc::new(move |work: Work| {
        let source = Arc::clone(&source);
        async move {
            match source().await {
                Ok(activity) => {
                    tracing::debug!(target: "reqlet::work", work_id = %work.id(), work = %work.name(), activity_id = %activity.id(), "Running work");
                    work.call(WorkContext::new(activity)).await
                }
                Err(e) => {
                    tracing::warn!(target: "reqlet::work", work = %work.name(), error = %e, "No activity for work");
                    WorkResult::failure(e.into())
                }
            }
        }
        .boxed()
    })
}
