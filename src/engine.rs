//! Engine and service façade
//!
//! `Engine` wires the registry, cache, metrics, balancer and executor into
//! the synchronous `complete` path. `Switchboard` adds the request queue,
//! persistence and the background maintenance loop on top of it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{Backend, Embedder};
use crate::balancer::{LoadBalancer, RuleBook};
use crate::cache::{CacheConfig, CacheEntry, CacheFilter, CacheLookup, CacheStore, MatchKind};
use crate::error::{EngineError, EngineResult};
use crate::executor::{
    CompleteOptions, Completion, Executor, ExecutorConfig, RequestJournal, RequestRecord,
};
use crate::queue::{CompletionRunner, Priority, QueueConfig, RequestQueue, TaskStatus};
use crate::registry::{ModelConfig, ModelFilter, ModelRegistry, RegisteredModel};
use crate::store::Store;
use crate::telemetry::{export, MetricsCollector, ModelStats, TelemetryConfig};
use crate::types::LlmRequest;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub executor: ExecutorConfig,
    pub telemetry: TelemetryConfig,
    /// Request records kept for lookup by id
    pub journal_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            executor: ExecutorConfig::default(),
            telemetry: TelemetryConfig::default(),
            journal_capacity: 1000,
        }
    }
}

/// Routing, caching and execution for one set of models
pub struct Engine {
    registry: Arc<ModelRegistry>,
    metrics: Arc<MetricsCollector>,
    cache: Arc<CacheStore>,
    balancer: LoadBalancer,
    executor: Executor,
    rules: RwLock<Arc<RuleBook>>,
    journal: RequestJournal,
    http_client: reqwest::Client,
}

impl Engine {
    pub fn new(config: EngineConfig, rules: RuleBook, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self::with_http_client(config, rules, embedder, reqwest::Client::new())
    }

    /// Engine whose HTTP backends share `http_client`
    pub fn with_http_client(
        config: EngineConfig,
        rules: RuleBook,
        embedder: Option<Arc<dyn Embedder>>,
        http_client: reqwest::Client,
    ) -> Self {
        let registry = Arc::new(ModelRegistry::new());
        let metrics = Arc::new(MetricsCollector::with_config(
            registry.clone(),
            config.telemetry,
        ));
        let cache = Arc::new(CacheStore::new(config.cache, embedder, metrics.clone()));
        let balancer = LoadBalancer::new(registry.clone(), metrics.clone());
        let executor = Executor::new(
            registry.clone(),
            metrics.clone(),
            cache.clone(),
            config.executor,
        );

        Self {
            registry,
            metrics,
            cache,
            balancer,
            executor,
            rules: RwLock::new(Arc::new(rules)),
            journal: RequestJournal::new(config.journal_capacity),
            http_client,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn metrics_collector(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn rules(&self) -> Arc<RuleBook> {
        self.rules.read().clone()
    }

    /// Register a model served by `backend`
    pub fn register_model(
        &self,
        config: ModelConfig,
        backend: Backend,
    ) -> EngineResult<RegisteredModel> {
        let model = self.registry.register(config)?;
        self.executor.attach_backend(&model.id, backend)?;
        Ok(model)
    }

    /// Register a model served over its catalog endpoint
    ///
    /// The backend is built first, so a missing API key leaves nothing
    /// registered.
    pub fn register_endpoint_model(&self, config: ModelConfig) -> EngineResult<RegisteredModel> {
        let backend = self.endpoint_backend(&config)?;
        self.register_model(config, backend)
    }

    /// Replace a model's configuration, keeping its runtime state
    ///
    /// A config carrying an endpoint also gets a freshly built backend.
    pub fn update_model(&self, config: ModelConfig) -> EngineResult<RegisteredModel> {
        let backend = match config.endpoint {
            Some(_) => Some(self.endpoint_backend(&config)?),
            None => None,
        };
        let model = self.registry.update_config(config)?;
        if let Some(backend) = backend {
            self.executor.attach_backend(&model.id, backend)?;
        }
        Ok(model)
    }

    fn endpoint_backend(&self, config: &ModelConfig) -> EngineResult<Backend> {
        let endpoint = config.endpoint.as_ref().ok_or_else(|| {
            EngineError::Configuration(format!("model {} has no endpoint", config.id()))
        })?;
        Backend::from_endpoint(endpoint, self.http_client.clone())
    }

    /// Swap the routing rules used by subsequent requests
    pub fn reload_rules(&self, rules: RuleBook) {
        for name in rules.names() {
            if let Ok(rule) = rules.get(Some(name)) {
                for id in rule.pool.iter().filter(|id| !self.registry.contains(id)) {
                    warn!(rule = %name, model = %id, "Rule pool names an unregistered model");
                }
            }
        }
        info!(rules = ?rules.names(), default_rule = %rules.default_rule(), "Routing rules reloaded");
        *self.rules.write() = Arc::new(rules);
    }

    /// Synchronous path: cache, then balancer, then executor
    #[instrument(skip_all, fields(kind = %request.kind, rule = ?options.rule))]
    pub async fn complete(
        &self,
        request: LlmRequest,
        options: CompleteOptions,
    ) -> EngineResult<Completion> {
        if request.is_empty() {
            export::record_request("rejected");
            return Err(EngineError::BadRequest("request has no content".into()));
        }
        let rules = self.rules();
        let rule = match rules.get(options.rule.as_deref()) {
            Ok(rule) => rule,
            Err(e) => {
                export::record_request("rejected");
                return Err(e);
            }
        };
        let mut record = RequestRecord::new(request);

        let miss = if options.skip_cache {
            None
        } else {
            match self
                .cache
                .lookup(&record.request, options.similarity_threshold)
                .await
            {
                CacheLookup::Hit(hit) => {
                    record.mark_cached(&hit.entry.model)?;
                    let completion = Completion {
                        request_id: record.id,
                        response: hit.entry.response.clone(),
                        model: hit.entry.model.clone(),
                        cached: true,
                        similarity: match hit.kind {
                            MatchKind::Exact => None,
                            MatchKind::Semantic { similarity } => Some(similarity),
                        },
                        attempts: 0,
                        tokens_in: hit.entry.tokens_in,
                        tokens_out: hit.entry.tokens_out,
                        cost: 0.0,
                    };
                    self.journal.push(record);
                    export::record_request("cached");
                    return Ok(completion);
                }
                CacheLookup::Miss(miss) => Some(miss),
            }
        };

        let candidates = self.balancer.select_candidates(&record.request, rule);
        debug!(candidates = ?candidates, strategy = %rule.strategy, "Selected candidates");

        let result = if candidates.is_empty() {
            let err = EngineError::NoAvailableModel(rule.name.clone());
            warn!(rule = %rule.name, "No eligible model");
            record.exhaust(&err)?;
            Err(err)
        } else {
            self.executor
                .execute(&mut record, &candidates, &options, miss)
                .await
        };

        export::record_request(record.status.as_str());
        self.journal.push(record);
        result
    }

    /// Statistics of one model over the trailing `window`
    pub fn metrics(&self, model: &str, window: Duration) -> EngineResult<ModelStats> {
        if !self.registry.contains(model) {
            return Err(EngineError::ModelNotFound(model.to_string()));
        }
        Ok(self.metrics.stats(model, window))
    }

    /// Health score of every registered model
    pub fn health(&self) -> BTreeMap<String, f64> {
        self.metrics.health_map()
    }

    pub fn list_models(&self, filter: &ModelFilter) -> Vec<RegisteredModel> {
        self.registry.list(filter)
    }

    /// Drop every cache entry the predicate selects
    pub fn invalidate_cache(&self, predicate: impl Fn(&CacheEntry) -> bool) -> usize {
        let removed = self.cache.invalidate(predicate);
        info!(removed = removed, "Cache invalidated");
        removed
    }

    pub fn invalidate_cache_matching(&self, filter: &CacheFilter) -> usize {
        let removed = self.cache.invalidate_matching(filter);
        info!(removed = removed, filter = ?filter, "Cache invalidated");
        removed
    }

    /// Record of a recent request, failed ones included
    pub fn request_record(&self, id: Uuid) -> Option<RequestRecord> {
        self.journal.get(id)
    }

    /// Periodic upkeep: health refresh and expired cache entries
    pub fn maintain(&self) {
        self.metrics.refresh_all();
        let purged = self.cache.purge_expired();
        if purged > 0 {
            debug!(purged = purged, "Purged expired cache entries");
        }
    }
}

#[async_trait]
impl CompletionRunner for Engine {
    async fn run(&self, request: LlmRequest, options: CompleteOptions) -> EngineResult<Completion> {
        self.complete(request, options).await
    }
}

#[derive(Debug, Clone)]
pub struct SwitchboardConfig {
    pub queue: QueueConfig,
    pub maintenance_interval: Duration,
    pub snapshot_interval: Duration,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            maintenance_interval: Duration::from_secs(30),
            snapshot_interval: Duration::from_secs(300),
        }
    }
}

/// The engine plus its asynchronous path, persistence and upkeep
pub struct Switchboard {
    engine: Arc<Engine>,
    queue: Arc<RequestQueue>,
    store: Option<Arc<dyn Store>>,
    shutdown: watch::Sender<bool>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Switchboard {
    /// Restore persisted state, then start the queue workers and the
    /// maintenance loop
    pub async fn start(
        engine: Arc<Engine>,
        config: SwitchboardConfig,
        store: Option<Arc<dyn Store>>,
    ) -> Self {
        if let Some(store) = &store {
            restore(&engine, store.as_ref()).await;
        }

        let runner: Arc<dyn CompletionRunner> = engine.clone();
        let queue = Arc::new(RequestQueue::start(config.queue.clone(), runner));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let maintenance = tokio::spawn(maintenance_loop(
            engine.clone(),
            queue.clone(),
            store.clone(),
            config.maintenance_interval,
            config.snapshot_interval,
            shutdown_rx,
        ));

        Self {
            engine,
            queue,
            store,
            shutdown,
            maintenance: Mutex::new(Some(maintenance)),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn complete(
        &self,
        request: LlmRequest,
        options: CompleteOptions,
    ) -> EngineResult<Completion> {
        self.engine.complete(request, options).await
    }

    pub fn enqueue(&self, request: LlmRequest, priority: Priority) -> EngineResult<Uuid> {
        self.queue.enqueue(request, priority)
    }

    pub fn enqueue_with(
        &self,
        request: LlmRequest,
        priority: Priority,
        options: CompleteOptions,
    ) -> EngineResult<Uuid> {
        self.queue.enqueue_with(request, priority, options)
    }

    pub fn status(&self, task_id: Uuid) -> EngineResult<TaskStatus> {
        self.queue.status(task_id)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn metrics(&self, model: &str, window: Duration) -> EngineResult<ModelStats> {
        self.engine.metrics(model, window)
    }

    pub fn health(&self) -> BTreeMap<String, f64> {
        self.engine.health()
    }

    pub fn invalidate_cache(&self, predicate: impl Fn(&CacheEntry) -> bool) -> usize {
        self.engine.invalidate_cache(predicate)
    }

    pub fn invalidate_cache_matching(&self, filter: &CacheFilter) -> usize {
        self.engine.invalidate_cache_matching(filter)
    }

    /// Register a model and persist its config
    pub async fn register_model(
        &self,
        config: ModelConfig,
        backend: Backend,
    ) -> EngineResult<RegisteredModel> {
        let model = self.engine.register_model(config, backend)?;
        self.persist_model(&model).await;
        Ok(model)
    }

    pub async fn register_endpoint_model(
        &self,
        config: ModelConfig,
    ) -> EngineResult<RegisteredModel> {
        let model = self.engine.register_endpoint_model(config)?;
        self.persist_model(&model).await;
        Ok(model)
    }

    async fn persist_model(&self, model: &RegisteredModel) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_model(&model.config).await {
                warn!(model = %model.id, error = %e, "Failed to persist model config");
            }
        }
    }

    pub fn reload_rules(&self, rules: RuleBook) {
        self.engine.reload_rules(rules);
    }

    pub fn request_record(&self, id: Uuid) -> Option<RequestRecord> {
        self.engine.request_record(id)
    }

    /// Write models, cache entries and metrics to the store now
    pub async fn snapshot(&self) -> EngineResult<()> {
        match &self.store {
            Some(store) => persist(&self.engine, store.as_ref()).await,
            None => Ok(()),
        }
    }

    /// Stop background work and write a final snapshot
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let maintenance = self.maintenance.lock().take();
        if let Some(handle) = maintenance {
            if let Err(e) = handle.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
        self.queue.shutdown().await;
        if let Err(e) = self.snapshot().await {
            error!(error = %e, "Final snapshot failed");
        }
        info!("Switchboard stopped");
    }
}

/// Load persisted models, cache entries and metrics into a fresh engine
async fn restore(engine: &Engine, store: &dyn Store) {
    match store.load_models().await {
        Ok(configs) => {
            for config in configs {
                let id = config.id();
                if engine.registry().contains(&id) {
                    continue;
                }
                if config.endpoint.is_none() {
                    debug!(model = %id, "Skipping stored model without endpoint");
                    continue;
                }
                if let Err(e) = engine.register_endpoint_model(config) {
                    warn!(model = %id, error = %e, "Failed to restore model");
                }
            }
        }
        Err(e) => warn!(error = %e, "Failed to load stored models"),
    }

    match store.load_cache().await {
        Ok(entries) => {
            engine.cache().restore(entries);
        }
        Err(e) => warn!(error = %e, "Failed to load stored cache entries"),
    }

    match store.load_metrics().await {
        Ok(Some(snapshot)) => {
            let restored = engine.metrics_collector().restore(snapshot);
            info!(models = restored, "Restored metrics snapshot");
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Failed to load metrics snapshot"),
    }
}

async fn persist(engine: &Engine, store: &dyn Store) -> EngineResult<()> {
    let configs = engine.registry().configs();
    try_join_all(configs.iter().map(|config| store.save_model(config))).await?;
    let entries = engine.cache().snapshot();
    store.save_cache(&entries).await?;
    store
        .save_metrics(&engine.metrics_collector().snapshot())
        .await?;
    debug!(cache_entries = entries.len(), "Snapshot persisted");
    Ok(())
}

async fn maintenance_loop(
    engine: Arc<Engine>,
    queue: Arc<RequestQueue>,
    store: Option<Arc<dyn Store>>,
    maintenance_interval: Duration,
    snapshot_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        maintenance_interval_s = maintenance_interval.as_secs(),
        snapshot_interval_s = snapshot_interval.as_secs(),
        persistence = store.is_some(),
        "Starting maintenance loop"
    );
    let mut maintenance = tokio::time::interval(maintenance_interval);
    let mut snapshot = tokio::time::interval(snapshot_interval);
    // Both intervals fire immediately on the first tick
    maintenance.tick().await;
    snapshot.tick().await;

    loop {
        tokio::select! {
            _ = maintenance.tick() => {
                engine.maintain();
                queue.purge_finished();
            }
            _ = snapshot.tick() => {
                if let Some(store) = &store {
                    if let Err(e) = persist(&engine, store.as_ref()).await {
                        warn!(error = %e, "Periodic snapshot failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("Maintenance loop shutting down");
                break;
            }
        }
    }
}
