//! Session orchestration with single-flight per tenant
//!
//! The coordinator runs the pull phase over every entity type, then the
//! push phase, walking the registry's dependency levels in order. Entity
//! types within one level run concurrently up to `parallelism`. Only one
//! session per tenant runs at a time; a request that arrives while a
//! session is in flight waits for that session and receives its result.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use farmsync_remote::{RemoteClient, ScopedRemote};
use farmsync_schema::{EntityDescriptor, SchemaRegistry, TenantId};
use farmsync_store::LocalStore;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::pull::PullReconciler;
use crate::push::PushPublisher;
use crate::session::{
    FailureKind, SessionStatus, SyncMode, SyncProgress, SyncRequest, SyncSession, SyncTrigger,
};
use crate::{Error, Result};

struct InFlight {
    session_id: Uuid,
    done: watch::Receiver<Option<SyncSession>>,
    cancel: CancellationToken,
}

/// Removes the tenant's in-flight entry when the session task ends,
/// including by panic.
struct InFlightGuard {
    coordinator: Arc<SyncCoordinator>,
    tenant: TenantId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.coordinator
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.tenant);
    }
}

#[derive(Debug, Clone, Copy)]
struct Tracker {
    completed: usize,
    total: usize,
}

pub struct SyncCoordinator {
    store: Arc<dyn LocalStore>,
    remote: ScopedRemote,
    registry: Arc<SchemaRegistry>,
    config: SyncConfig,
    inflight: Mutex<HashMap<TenantId, InFlight>>,
    progress: Mutex<HashMap<TenantId, watch::Sender<SyncProgress>>>,
    shutdown: CancellationToken,
}

impl SyncCoordinator {
    /// Build a coordinator over the given adapters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` fails validation.
    pub fn new(
        store: Arc<dyn LocalStore>,
        client: Arc<dyn RemoteClient>,
        registry: Arc<SchemaRegistry>,
        config: SyncConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let remote = ScopedRemote::new(client, Arc::clone(&registry))
            .with_policy(config.retry.clone())
            .with_page_size(config.page_size);
        Ok(Arc::new(Self {
            store,
            remote,
            registry,
            config,
            inflight: Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_full_sync(self: &Arc<Self>, tenant: &TenantId) -> SyncSession {
        self.run(tenant, SyncRequest::new(SyncMode::Full, SyncTrigger::User))
            .await
    }

    pub async fn run_pull_only(self: &Arc<Self>, tenant: &TenantId) -> SyncSession {
        self.run(tenant, SyncRequest::new(SyncMode::PullOnly, SyncTrigger::User))
            .await
    }

    pub async fn run_push_only(self: &Arc<Self>, tenant: &TenantId) -> SyncSession {
        self.run(tenant, SyncRequest::new(SyncMode::PushOnly, SyncTrigger::User))
            .await
    }

    /// Run a session for `tenant`, or join the one already in flight.
    ///
    /// A joined session keeps the mode and trigger it was started with.
    pub async fn run(self: &Arc<Self>, tenant: &TenantId, request: SyncRequest) -> SyncSession {
        let mut done = self.join_or_start(tenant, request);
        let finished = match done.wait_for(Option::is_some).await {
            Ok(session) => (*session).clone(),
            Err(_) => None,
        };
        finished.unwrap_or_else(|| {
            let mut session = SyncSession::new(tenant.clone(), request);
            session.fail(FailureKind::Internal, "sync task ended without a result");
            session
        })
    }

    pub fn is_running(&self, tenant: &TenantId) -> bool {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(tenant)
    }

    /// Cancel the tenant's in-flight session. Returns false if none runs.
    ///
    /// The session stops at the next batch boundary or network wait.
    pub fn cancel(&self, tenant: &TenantId) -> bool {
        let inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        match inflight.get(tenant) {
            Some(running) => {
                info!(tenant = %tenant, session = %running.session_id, "Cancelling sync");
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every session and stop periodic triggers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Progress of the tenant's sessions, as completed entity-type phases.
    pub fn progress(&self, tenant: &TenantId) -> watch::Receiver<SyncProgress> {
        self.progress_sender(tenant).subscribe()
    }

    /// Run a full sync for `tenant` every `every` until [`shutdown`](Self::shutdown).
    ///
    /// The first sync starts immediately.
    pub fn spawn_periodic(self: &Arc<Self>, tenant: TenantId, every: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let stop = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let request = SyncRequest::new(SyncMode::Full, SyncTrigger::Periodic);
                        let session = this.run(&tenant, request).await;
                        debug!(tenant = %tenant, status = ?session.status, "Periodic sync finished");
                    }
                }
            }
        })
    }

    fn progress_sender(&self, tenant: &TenantId) -> watch::Sender<SyncProgress> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(tenant.clone())
            .or_insert_with(|| watch::channel(SyncProgress::idle(tenant.clone())).0)
            .clone()
    }

    fn report(&self, session: &SyncSession, tracker: Tracker) {
        self.progress_sender(&session.tenant)
            .send_replace(SyncProgress {
                tenant: session.tenant.clone(),
                status: session.status,
                completed: tracker.completed,
                total: tracker.total,
            });
    }

    fn join_or_start(
        self: &Arc<Self>,
        tenant: &TenantId,
        request: SyncRequest,
    ) -> watch::Receiver<Option<SyncSession>> {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = inflight.get(tenant) {
            debug!(tenant = %tenant, session = %running.session_id, "Joining in-flight sync");
            return running.done.clone();
        }

        let session = SyncSession::new(tenant.clone(), request);
        let (tx, rx) = watch::channel(None);
        let cancel = self.shutdown.child_token();
        inflight.insert(
            tenant.clone(),
            InFlight {
                session_id: session.id,
                done: rx.clone(),
                cancel: cancel.clone(),
            },
        );
        drop(inflight);

        let guard = InFlightGuard {
            coordinator: Arc::clone(self),
            tenant: tenant.clone(),
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let session = this.execute(session, request, &cancel).await;
            drop(guard);
            tx.send_replace(Some(session));
        });
        rx
    }

    async fn execute(
        &self,
        mut session: SyncSession,
        request: SyncRequest,
        cancel: &CancellationToken,
    ) -> SyncSession {
        let levels = self.registry.levels();
        let phases = usize::from(request.mode.pulls()) + usize::from(request.mode.pushes());
        let mut tracker = Tracker {
            completed: 0,
            total: self.registry.len() * phases,
        };
        let mut blocked: HashSet<String> = HashSet::new();

        info!(
            tenant = %session.tenant,
            session = %session.id,
            mode = ?request.mode,
            trigger = ?request.trigger,
            "Sync session started"
        );

        let mut phase_result = Ok(());
        if request.mode.pulls() {
            session.status = SessionStatus::Pulling;
            self.report(&session, tracker);
            phase_result = self
                .pull_phase(&mut session, &levels, request.full_reconcile, &mut blocked, &mut tracker, cancel)
                .await;
        }
        if phase_result.is_ok() && request.mode.pushes() {
            session.status = SessionStatus::Pushing;
            self.report(&session, tracker);
            phase_result = self
                .push_phase(&mut session, &levels, &mut blocked, &mut tracker, cancel)
                .await;
        }

        match phase_result {
            Err(Error::Cancelled) => {
                info!(tenant = %session.tenant, session = %session.id, "Sync session cancelled");
                session.fail_with(&Error::Cancelled);
            }
            Err(err) => {
                error!(tenant = %session.tenant, session = %session.id, error = %err, "Sync session aborted");
                session.fail_with(&err);
            }
            Ok(()) if blocked.is_empty() => session.succeed(),
            Ok(()) => {
                let mut entities: Vec<&str> = blocked.iter().map(String::as_str).collect();
                entities.sort_unstable();
                session.fail(
                    FailureKind::Remote,
                    format!("entity types not synced: {}", entities.join(", ")),
                );
            }
        }

        let summary = session.summary();
        info!(
            tenant = %session.tenant,
            session = %session.id,
            status = ?session.status,
            applied = summary.applied,
            pushed = summary.pushed,
            failed = summary.failed_records,
            parked = summary.parked_records,
            "Sync session finished"
        );
        self.report(&session, tracker);
        session
    }

    /// Mark `entity` and everything depending on it as not to be processed.
    fn block(&self, blocked: &mut HashSet<String>, entity: &str) {
        blocked.insert(entity.to_string());
        blocked.extend(self.registry.descendants(entity).into_iter().map(String::from));
    }

    /// Split a level into runnable entity types, marking blocked ones skipped.
    fn runnable(
        &self,
        session: &mut SyncSession,
        level: &[&EntityDescriptor],
        blocked: &HashSet<String>,
        tracker: &mut Tracker,
    ) -> Vec<String> {
        let mut runnable = Vec::new();
        for descriptor in level {
            if blocked.contains(&descriptor.entity) {
                session.stats_mut(&descriptor.entity).skipped = true;
                tracker.completed += 1;
            } else {
                runnable.push(descriptor.entity.clone());
            }
        }
        runnable
    }

    async fn pull_phase(
        &self,
        session: &mut SyncSession,
        levels: &[Vec<&EntityDescriptor>],
        force_full: bool,
        blocked: &mut HashSet<String>,
        tracker: &mut Tracker,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let reconciler = PullReconciler::new(self.store.as_ref(), &self.remote, &self.config);
        let tenant = session.tenant.clone();

        for level in levels {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let runnable = self.runnable(session, level, blocked, tracker);

            let reconciler = &reconciler;
            let tenant = &tenant;
            let mut results = stream::iter(runnable)
                .map(|entity| async move {
                    let result = reconciler.pull(&entity, tenant, force_full, cancel).await;
                    (entity, result)
                })
                .buffer_unordered(self.config.parallelism);

            let mut fatal = None;
            while let Some((entity, result)) = results.next().await {
                tracker.completed += 1;
                match result {
                    Ok(outcome) => {
                        let stats = session.stats_mut(&entity);
                        stats.applied += outcome.report.applied();
                        stats.tombstoned += outcome.report.tombstoned;
                        stats.orphaned += outcome.report.orphaned;
                        stats.malformed += outcome.issues.len();
                        stats.failed += outcome.issues.len();
                        for issue in outcome.issues {
                            session.record_issue(&entity, issue.id, issue.reason);
                        }
                    }
                    Err(err) if err.is_session_fatal() => {
                        fatal.get_or_insert(err);
                    }
                    Err(err) => {
                        warn!(tenant = %tenant, entity = %entity, error = %err, "Pull failed, skipping dependants");
                        session.stats_mut(&entity).errored = true;
                        session.record_issue(&entity, None, err.to_string());
                        self.block(blocked, &entity);
                    }
                }
                self.report(session, *tracker);
            }
            if let Some(err) = fatal {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn push_phase(
        &self,
        session: &mut SyncSession,
        levels: &[Vec<&EntityDescriptor>],
        blocked: &mut HashSet<String>,
        tracker: &mut Tracker,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let publisher = PushPublisher::new(self.store.as_ref(), &self.remote, &self.config);
        let tenant = session.tenant.clone();

        for level in levels {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let runnable = self.runnable(session, level, blocked, tracker);

            let publisher = &publisher;
            let tenant = &tenant;
            let mut results = stream::iter(runnable)
                .map(|entity| async move {
                    let result = publisher.push(&entity, tenant, cancel).await;
                    (entity, result)
                })
                .buffer_unordered(self.config.parallelism);

            let mut fatal = None;
            while let Some((entity, result)) = results.next().await {
                tracker.completed += 1;
                match result {
                    Ok(report) => {
                        let stats = session.stats_mut(&entity);
                        stats.pushed += report.pushed;
                        stats.failed += report.failed;
                        stats.parked += report.parked;
                        stats.conflicts += report.conflicts;
                        for (id, reason) in report.failures {
                            session.record_issue(&entity, Some(id), reason);
                        }
                    }
                    Err(err) if err.is_session_fatal() => {
                        fatal.get_or_insert(err);
                    }
                    Err(err) => {
                        warn!(tenant = %tenant, entity = %entity, error = %err, "Push failed, skipping dependants");
                        session.stats_mut(&entity).errored = true;
                        session.record_issue(&entity, None, err.to_string());
                        self.block(blocked, &entity);
                    }
                }
                self.report(session, *tracker);
            }
            if let Some(err) = fatal {
                return Err(err);
            }
        }
        Ok(())
    }
}
