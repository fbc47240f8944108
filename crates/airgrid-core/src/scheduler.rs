//! Concurrent bulk refresh of point-indexed domains.
//!
//! [`RefreshScheduler::run`] flattens the points of every [`RefreshTarget`] into one
//! queue and spawns exactly `concurrency` workers that drain it. For each point a
//! worker derives a fresh deadline of `point_timeout` and refreshes every enabled
//! domain in turn. Outcomes stream back over a channel and are folded into a
//! [`RefreshResult`] once every worker has finished.
//!
//! Cancelling the run context stops workers from taking new points. A point that is
//! already in flight finishes under its own deadline, and everything collected so
//! far is returned.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize, Serializer};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::{CacheMode, FetchThroughCache, SnapshotCache};
use crate::config::SchedulerConfig;
use crate::context::FetchContext;
use crate::error::{ConfigError, FetchError};
use crate::provider::{BoxFuture, FeatureFlags};

/// Coordinate to refresh. Validated by the caches, not on construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub latitude: f64,
    pub longitude: f64,
}

impl Point {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

impl Display for Point {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4},{:.4}", self.latitude, self.longitude)
    }
}

/// Named group of points. Lower `priority` values are queued first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshTarget {
    pub name: String,
    pub priority: u32,
    pub points: Vec<Point>,
}

impl RefreshTarget {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
            points: Vec::new(),
        }
    }

    pub fn with_point(mut self, latitude: f64, longitude: f64) -> Self {
        self.points.push(Point::new(latitude, longitude));
        self
    }

    pub fn with_points(mut self, points: impl IntoIterator<Item = Point>) -> Self {
        self.points.extend(points);
        self
    }
}

/// Failed refresh of one domain at one point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshError {
    pub provider: String,
    pub point: Point,
    #[serde(serialize_with = "serialize_error")]
    pub error: FetchError,
}

/// Outcome of one scheduler run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshResult {
    pub run_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub duration: Duration,
    pub total_points: usize,
    /// Points whose enabled domains all succeeded or were skipped.
    pub successful: usize,
    /// Points with at least one failed domain.
    pub failed: usize,
    /// Domain refreshes skipped because their feature was disabled.
    pub skipped: usize,
    pub errors: Vec<RefreshError>,
    /// The run context ended before every point was processed.
    pub cancelled: bool,
}

impl RefreshResult {
    fn new(total_points: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: OffsetDateTime::now_utc(),
            duration: Duration::ZERO,
            total_points,
            successful: 0,
            failed: 0,
            skipped: 0,
            errors: Vec::new(),
            cancelled: false,
        }
    }

    pub fn processed(&self) -> usize {
        self.successful + self.failed
    }

    pub fn is_complete(&self) -> bool {
        self.processed() == self.total_points
    }

    fn record(&mut self, outcome: PointOutcome) {
        self.skipped += outcome.skipped;
        if outcome.errors.is_empty() {
            self.successful += 1;
        } else {
            self.failed += 1;
            self.errors.extend(outcome.errors);
        }
    }
}

fn serialize_error<S>(error: &FetchError, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(error)
}

/// A point-indexed domain the scheduler can warm.
pub trait PointRefresh: Send + Sync {
    fn name(&self) -> &str;

    fn refresh<'a>(
        &'a self,
        context: &'a FetchContext,
        point: Point,
        mode: CacheMode,
    ) -> BoxFuture<'a, Result<(), FetchError>>;
}

/// A domain holding a single value, such as transit.
pub trait GlobalRefresh: Send + Sync {
    fn name(&self) -> &str;

    fn refresh<'a>(
        &'a self,
        context: &'a FetchContext,
        mode: CacheMode,
    ) -> BoxFuture<'a, Result<(), FetchError>>;
}

impl<T> PointRefresh for FetchThroughCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.provider_name()
    }

    fn refresh<'a>(
        &'a self,
        context: &'a FetchContext,
        point: Point,
        mode: CacheMode,
    ) -> BoxFuture<'a, Result<(), FetchError>> {
        Box::pin(async move {
            self.get_with_mode(context, point.latitude, point.longitude, mode)
                .await
                .map(drop)
        })
    }
}

impl<T> GlobalRefresh for SnapshotCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.provider_name()
    }

    fn refresh<'a>(
        &'a self,
        context: &'a FetchContext,
        mode: CacheMode,
    ) -> BoxFuture<'a, Result<(), FetchError>> {
        Box::pin(async move { self.get_with_mode(context, mode).await.map(drop) })
    }
}

/// Point domain registration.
#[derive(Clone)]
pub struct RefreshDomain {
    refresh: Arc<dyn PointRefresh>,
    flag: Option<String>,
    enabled: bool,
}

impl RefreshDomain {
    pub fn new(refresh: Arc<dyn PointRefresh>) -> Self {
        Self {
            refresh,
            flag: None,
            enabled: true,
        }
    }

    /// Marks the domain optional: failures while `flag` is off count as skips.
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flag = Some(flag.into());
        self
    }

    /// Disabled domains are never called.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn name(&self) -> &str {
        self.refresh.name()
    }

    pub fn flag(&self) -> Option<&str> {
        self.flag.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Non-point domain registration.
#[derive(Clone)]
pub struct GlobalDomain {
    refresh: Arc<dyn GlobalRefresh>,
    flag: Option<String>,
}

impl GlobalDomain {
    pub fn new(refresh: Arc<dyn GlobalRefresh>) -> Self {
        Self {
            refresh,
            flag: None,
        }
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flag = Some(flag.into());
        self
    }

    pub fn name(&self) -> &str {
        self.refresh.name()
    }
}

pub struct RefreshScheduler {
    config: SchedulerConfig,
    targets: Vec<RefreshTarget>,
    domains: Vec<RefreshDomain>,
    global_domains: Vec<GlobalDomain>,
    flags: Option<Arc<dyn FeatureFlags>>,
}

impl RefreshScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            targets: Vec::new(),
            domains: Vec::new(),
            global_domains: Vec::new(),
            flags: None,
        })
    }

    pub fn with_target(mut self, target: RefreshTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_domain(mut self, domain: RefreshDomain) -> Self {
        self.domains.push(domain);
        self
    }

    pub fn with_global_domain(mut self, domain: GlobalDomain) -> Self {
        self.global_domains.push(domain);
        self
    }

    pub fn with_feature_flags(mut self, flags: Arc<dyn FeatureFlags>) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn targets(&self) -> &[RefreshTarget] {
        &self.targets
    }

    /// Refreshes every point of every target. Never fails: per-domain errors are
    /// reported in the result.
    pub async fn run(&self, context: &FetchContext) -> RefreshResult {
        let queue = self.flatten_points();
        let mut result = RefreshResult::new(queue.len());
        let started = Instant::now();
        let run_id = result.run_id;
        info!(
            %run_id,
            points = result.total_points,
            domains = self.domains.len(),
            concurrency = self.config.concurrency,
            "refresh run started"
        );

        let shared = Arc::new(WorkerShared {
            queue: Mutex::new(queue),
            domains: self.domains.iter().filter(|d| d.enabled).cloned().collect(),
            flags: self.flags.clone(),
            config: self.config,
            run_context: context.clone(),
        });
        let (sender, mut receiver) = mpsc::channel(self.config.concurrency);

        let mut workers = JoinSet::new();
        for worker in 0..self.config.concurrency {
            let span = info_span!("refresh_worker", %run_id, worker);
            workers.spawn(run_worker(Arc::clone(&shared), sender.clone()).instrument(span));
        }
        drop(sender);

        while let Some(outcome) = receiver.recv().await {
            result.record(outcome);
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(error) = joined {
                warn!(%run_id, error = %error, "refresh worker terminated abnormally");
            }
        }

        result.duration = started.elapsed();
        result.cancelled = context.check().is_err() && !result.is_complete();
        info!(
            %run_id,
            successful = result.successful,
            failed = result.failed,
            skipped = result.skipped,
            cancelled = result.cancelled,
            duration_ms = result.duration.as_millis() as u64,
            "refresh run finished"
        );
        result
    }

    /// Refreshes the non-point domain registered under `name`.
    pub async fn refresh_single_domain(
        &self,
        context: &FetchContext,
        name: &str,
    ) -> Result<(), FetchError> {
        let domain = self
            .global_domains
            .iter()
            .find(|domain| domain.name() == name)
            .ok_or_else(|| FetchError::provider(format!("unknown refresh domain `{name}`")))?;

        let domain_context = context.child_with_timeout(self.config.point_timeout);
        match domain
            .refresh
            .refresh(&domain_context, self.config.cache_mode)
            .await
        {
            Ok(()) => Ok(()),
            Err(error) => {
                let flags = self.flags.as_deref();
                if is_skip(&error, domain.flag.as_deref(), flags, &domain_context).await {
                    debug!(domain = name, "domain disabled, skipping refresh");
                    return Ok(());
                }
                warn!(domain = name, error = %error, "domain refresh failed");
                Err(error)
            }
        }
    }

    fn flatten_points(&self) -> VecDeque<Point> {
        let mut targets = self.targets.iter().collect::<Vec<_>>();
        targets.sort_by_key(|target| target.priority);
        targets
            .into_iter()
            .flat_map(|target| target.points.iter().copied())
            .collect()
    }
}

struct WorkerShared {
    queue: Mutex<VecDeque<Point>>,
    domains: Vec<RefreshDomain>,
    flags: Option<Arc<dyn FeatureFlags>>,
    config: SchedulerConfig,
    run_context: FetchContext,
}

impl WorkerShared {
    fn next_point(&self) -> Option<Point> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

struct PointOutcome {
    errors: Vec<RefreshError>,
    skipped: usize,
}

async fn run_worker(shared: Arc<WorkerShared>, sender: mpsc::Sender<PointOutcome>) {
    loop {
        if shared.run_context.check().is_err() {
            debug!("run context ended, worker stopping");
            break;
        }
        let Some(point) = shared.next_point() else {
            break;
        };

        // Detached from the run context so an in-flight point is not aborted by cancellation.
        let point_context = FetchContext::with_timeout(shared.config.point_timeout);
        let outcome = refresh_point(&shared, &point_context, point).await;
        if sender.send(outcome).await.is_err() {
            break;
        }
    }
}

async fn refresh_point(
    shared: &WorkerShared,
    context: &FetchContext,
    point: Point,
) -> PointOutcome {
    let mut outcome = PointOutcome {
        errors: Vec::new(),
        skipped: 0,
    };

    for domain in &shared.domains {
        let provider = domain.name();
        match domain
            .refresh
            .refresh(context, point, shared.config.cache_mode)
            .await
        {
            Ok(()) => debug!(provider, %point, "domain refreshed"),
            Err(error) => {
                if is_skip(&error, domain.flag(), shared.flags.as_deref(), context).await {
                    debug!(provider, %point, "domain disabled, skipping");
                    outcome.skipped += 1;
                    continue;
                }
                warn!(provider, %point, error = %error, "domain refresh failed");
                outcome.errors.push(RefreshError {
                    provider: provider.to_owned(),
                    point,
                    error,
                });
            }
        }
    }

    outcome
}

/// A failure is a skip when it reports a disabled feature, or when the domain is
/// optional and its flag is currently off.
async fn is_skip(
    error: &FetchError,
    flag: Option<&str>,
    flags: Option<&dyn FeatureFlags>,
    context: &FetchContext,
) -> bool {
    if matches!(error, FetchError::FeatureDisabled { .. }) {
        return true;
    }
    match (flag, flags) {
        (Some(flag), Some(flags)) => !flags.is_enabled(flag, context).await,
        _ => false,
    }
}
