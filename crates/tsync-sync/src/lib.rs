//! Sync pipeline orchestration: per project, per record type, fetch the
//! records updated since the last watermark, flatten them, upsert them and
//! advance the watermark.

mod config;
mod gate;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use tsync_core::{format_watermark, instance_key, ProjectTarget, RecordType, SyncState};
use tsync_fetch::{HttpFetcher, JsonTransport, RecordTypeFields, TrackerClient};
use tsync_store::{SyncStore, TableSink, WatermarkStore};
use tsync_transform::{RecordTransformer, StatusCatalog};
use uuid::Uuid;

pub use config::{load_credentials, ConfigError, SyncConfig};
pub use gate::{BlacklistGate, GatedClient};

pub const CRATE_NAME: &str = "tsync-sync";

/// Search query for one (project, record type) pass, oldest updates first.
pub fn record_query(project_key: &str, last_sync: &str, record_type: &str) -> String {
    format!(
        "project={project_key} AND updated >= \"{last_sync}\" \
         AND issuetype = \"{record_type}\" ORDER BY updated ASC"
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordTypeOutcome {
    pub instance: String,
    pub project_key: String,
    /// `None` when the whole project was skipped before record types were known.
    pub record_type: Option<String>,
    pub state: SyncState,
    pub fetched: usize,
    pub upserted: usize,
    pub allowed_fields: usize,
    pub watermark: Option<String>,
}

impl RecordTypeOutcome {
    fn new(target: &ProjectTarget, record_type: Option<&str>) -> Self {
        Self {
            instance: target.instance.clone(),
            project_key: target.project.clone(),
            record_type: record_type.map(str::to_string),
            state: SyncState::Pending,
            fetched: 0,
            upserted: 0,
            allowed_fields: 0,
            watermark: None,
        }
    }

    fn finish(mut self, state: SyncState) -> Self {
        self.state = state;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub projects: usize,
    pub outcomes: Vec<RecordTypeOutcome>,
}

impl SyncRunSummary {
    pub fn count(&self, state: SyncState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }
}

/// One async mutex per (project, record type), handed out on demand.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, project_key: &str, record_type: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry((project_key.to_string(), record_type.to_lowercase()))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }
}

/// State shared by every project of a single run.
pub struct SyncSession {
    run_id: Uuid,
    default_fields: Mutex<HashMap<String, BTreeSet<String>>>,
    locks: KeyedLocks,
}

impl SyncSession {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            default_fields: Mutex::new(HashMap::new()),
            locks: KeyedLocks::default(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Default field set for the client's instance, fetched once per run.
    async fn default_fields(
        &self,
        client: &GatedClient<'_>,
    ) -> Result<BTreeSet<String>, tsync_fetch::FetchError> {
        let key = instance_key(client.instance());
        if let Some(cached) = self.default_fields.lock().await.get(&key) {
            return Ok(cached.clone());
        }
        match client.default_fields().await? {
            Some(fields) => {
                self.default_fields.lock().await.insert(key, fields.clone());
                Ok(fields)
            }
            None => {
                warn!(instance = client.instance(), "default field catalog unavailable");
                Ok(BTreeSet::new())
            }
        }
    }
}

/// Metadata gathered once per project connect.
#[derive(Debug, Clone, Default)]
pub struct ProjectContext {
    pub record_types: Vec<String>,
    pub status_catalog: StatusCatalog,
    pub record_type_fields: Option<BTreeMap<String, RecordTypeFields>>,
    pub default_fields: BTreeSet<String>,
}

impl ProjectContext {
    /// Looks up the record type id by name in the create metadata.
    pub fn resolve(&self, name: &str) -> Option<RecordType> {
        let (id, fields) = self
            .record_type_fields
            .as_ref()?
            .iter()
            .find(|(_, f)| f.name.eq_ignore_ascii_case(name))?;
        Some(RecordType {
            id: id.clone(),
            name: name.to_string(),
            allowed_fields: self.default_fields.union(&fields.fields).cloned().collect(),
        })
    }
}

pub struct SyncOrchestrator {
    base_url_template: String,
    transport: Arc<dyn JsonTransport>,
    gate: BlacklistGate,
    watermarks: WatermarkStore,
    sink: TableSink,
    max_parallel_projects: usize,
}

impl SyncOrchestrator {
    pub async fn new(
        config: &SyncConfig,
        store: &SyncStore,
        transport: Arc<dyn JsonTransport>,
    ) -> Result<Self> {
        let gate = BlacklistGate::load(store.blacklist(config.blacklist_table.clone())).await?;
        Ok(Self {
            base_url_template: config.base_url_template.clone(),
            transport,
            gate,
            watermarks: store.watermarks(config.watermark_table.clone()),
            sink: store.sink(config.table_prefix.clone()),
            max_parallel_projects: config.max_parallel_projects.max(1),
        })
    }

    pub fn gate(&self) -> &BlacklistGate {
        &self.gate
    }

    pub async fn run_once(self: &Arc<Self>, targets: Vec<ProjectTarget>) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let session = Arc::new(SyncSession::new());
        let projects = targets.len();
        info!(
            run_id = %session.run_id(),
            projects,
            parallel = self.max_parallel_projects,
            "sync run starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_parallel_projects));
        let mut tasks = JoinSet::new();
        for (index, target) in targets.into_iter().enumerate() {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .context("acquiring project permit")?;
            let this = Arc::clone(self);
            let session = Arc::clone(&session);
            tasks.spawn(async move {
                let _permit = permit;
                (index, this.sync_project(&session, &target).await)
            });
        }

        let mut per_project = Vec::with_capacity(projects);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => per_project.push(result),
                Err(err) => error!(error = %err, "project task aborted"),
            }
        }
        per_project.sort_by_key(|(index, _)| *index);

        let summary = SyncRunSummary {
            run_id: session.run_id(),
            started_at,
            finished_at: Utc::now(),
            projects,
            outcomes: per_project.into_iter().flat_map(|(_, outcomes)| outcomes).collect(),
        };
        info!(
            run_id = %summary.run_id,
            advanced = summary.count(SyncState::WatermarkAdvanced),
            empty = summary.count(SyncState::Empty),
            skipped = summary.count(SyncState::Skipped),
            failed = summary.count(SyncState::Failed),
            "sync complete"
        );
        Ok(summary)
    }

    async fn sync_project(
        &self,
        session: &SyncSession,
        target: &ProjectTarget,
    ) -> Vec<RecordTypeOutcome> {
        let span =
            info_span!("sync_project", instance = %target.instance, project = %target.project);
        async {
            if self.gate.is_blocked(&target.instance).await {
                warn!("instance is blacklisted; skipping project");
                return vec![RecordTypeOutcome::new(target, None).finish(SyncState::Skipped)];
            }
            self.gate.refresh().await;
            if self.gate.is_blocked(&target.instance).await {
                warn!("instance was blacklisted during this run; skipping project");
                return vec![RecordTypeOutcome::new(target, None).finish(SyncState::Skipped)];
            }

            let client = self.gate.client(TrackerClient::for_instance(
                &target.instance,
                &self.base_url_template,
                Arc::clone(&self.transport),
            ));
            let context = match self.project_context(session, &client, &target.project).await {
                Ok(context) => context,
                Err(err) => {
                    error!(error = %err, "project metadata unavailable; skipping project");
                    return vec![RecordTypeOutcome::new(target, None).finish(SyncState::Skipped)];
                }
            };
            if context.record_types.is_empty() {
                warn!("no record types found for project");
            }

            let mut outcomes = Vec::with_capacity(context.record_types.len());
            for name in &context.record_types {
                let outcome = self
                    .sync_record_type(session, &client, target, &context, name)
                    .instrument(info_span!("sync_record_type", record_type = %name))
                    .await;
                outcomes.push(outcome);
            }
            outcomes
        }
        .instrument(span)
        .await
    }

    async fn project_context(
        &self,
        session: &SyncSession,
        client: &GatedClient<'_>,
        project_key: &str,
    ) -> Result<ProjectContext, tsync_fetch::FetchError> {
        let statuses = client.project_statuses(project_key).await?;
        let record_type_fields = client.record_type_fields(project_key).await?;
        let default_fields = session.default_fields(client).await?;
        Ok(ProjectContext {
            record_types: statuses.record_types,
            status_catalog: statuses.status_catalog,
            record_type_fields,
            default_fields,
        })
    }

    async fn sync_record_type(
        &self,
        session: &SyncSession,
        client: &GatedClient<'_>,
        target: &ProjectTarget,
        context: &ProjectContext,
        name: &str,
    ) -> RecordTypeOutcome {
        let project = target.project.as_str();
        let mut outcome = RecordTypeOutcome::new(target, Some(name));
        let _guard = session.locks.lock(project, name).await;

        if self.gate.is_blocked(&target.instance).await {
            warn!("instance is blacklisted; skipping record type");
            return outcome.finish(SyncState::Skipped);
        }
        let Some(record_type) = context.resolve(name) else {
            error!("no record type id in create metadata; skipping");
            return outcome.finish(SyncState::Skipped);
        };
        outcome.allowed_fields = record_type.allowed_fields.len();

        let last_sync = match self.watermarks.get_last_sync(project, name).await {
            Ok(last_sync) => last_sync,
            Err(err) => {
                error!(error = %err, "watermark read failed");
                return outcome.finish(SyncState::Failed);
            }
        };
        outcome.watermark = Some(last_sync.clone());

        outcome.state = SyncState::Fetching;
        // Captured before the search so records updated mid-fetch are picked up next run.
        let fetch_started = format_watermark(Local::now());
        let result = match client.search(&record_query(project, &last_sync, name)).await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "search rejected; skipping record type");
                return outcome.finish(SyncState::Skipped);
            }
        };
        outcome.fetched = result.records.len();
        if result.records.is_empty() {
            info!(%last_sync, "no records updated since last sync");
            return outcome.finish(SyncState::Empty);
        }

        outcome.state = SyncState::Transforming;
        let rows = RecordTransformer::new(&context.status_catalog)
            .transform_all(&result.records, &result.names);

        outcome.state = SyncState::Upserting;
        let report = match self.sink.upsert(rows, project, name).await {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "upsert failed; watermark left in place");
                return outcome.finish(SyncState::Failed);
            }
        };
        outcome.upserted = report.written;

        if let Err(err) = self.watermarks.advance(project, name, &fetch_started).await {
            error!(error = %err, "watermark advance failed");
            return outcome.finish(SyncState::Failed);
        }
        info!(
            table = %report.table,
            fetched = outcome.fetched,
            upserted = outcome.upserted,
            watermark = %fetch_started,
            "record type synced"
        );
        outcome.watermark = Some(fetch_started);
        outcome.finish(SyncState::WatermarkAdvanced)
    }
}

/// Creates the state tables ahead of the first run.
pub async fn migrate(config: &SyncConfig) -> Result<()> {
    let store = SyncStore::connect(&config.database_url).await?;
    store.blacklist(config.blacklist_table.clone()).ensure_table().await?;
    store.watermarks(config.watermark_table.clone()).ensure_table().await?;
    info!(database_url = %config.database_url, "state tables ready");
    Ok(())
}

pub async fn run_sync_once(config: &SyncConfig) -> Result<SyncRunSummary> {
    let credentials = load_credentials(&config.credentials_path)?;
    let fetcher = HttpFetcher::new(
        config.http_client_config(),
        &credentials.username,
        &credentials.token,
    )?;
    let store = SyncStore::connect(&config.database_url).await?;
    let orchestrator = Arc::new(SyncOrchestrator::new(config, &store, Arc::new(fetcher)).await?);
    orchestrator.run_once(credentials.projects).await
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    run_sync_once(&SyncConfig::from_env()).await
}

pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_config = config.clone();
    let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let config = job_config.clone();
        Box::pin(async move {
            match run_sync_once(&config).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    outcomes = summary.outcomes.len(),
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
