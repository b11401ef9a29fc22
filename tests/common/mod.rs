//! Common test utilities for Switchboard
//!
//! Shared fixtures for building engines over scripted backends, starting a
//! switchboard with fast timings and serving the router in-process.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use switchboard::backend::{Backend, Embedder, ScriptedBackend};
use switchboard::balancer::RuleBook;
use switchboard::executor::ExecutorConfig;
use switchboard::queue::{QueueConfig, TaskStatus};
use switchboard::registry::ModelConfig;
use switchboard::store::Store;
use switchboard::{routes, AppState, Config, Engine, EngineConfig, Switchboard, SwitchboardConfig};
use uuid::Uuid;

/// Test configuration constants
pub mod constants {
    /// Provider name used for scripted models
    pub const TEST_PROVIDER: &str = "test";
    /// API key sent to mocked providers
    pub const TEST_API_KEY: &str = "test-api-key";
    /// How long to wait for a queued task before failing the test
    pub const TASK_WAIT_SECS: u64 = 5;
}

/// Engine config with millisecond backoff so failover tests stay fast
pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        executor: ExecutorConfig {
            slot_wait: Duration::from_millis(20),
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            ..ExecutorConfig::default()
        },
        ..EngineConfig::default()
    }
}

pub fn test_engine(rules: RuleBook) -> Arc<Engine> {
    Arc::new(Engine::new(fast_engine_config(), rules, None))
}

pub fn test_engine_with_embedder(
    config: EngineConfig,
    rules: RuleBook,
    embedder: Arc<dyn Embedder>,
) -> Arc<Engine> {
    Arc::new(Engine::new(config, rules, Some(embedder)))
}

/// Config for `test/<name>` with default capabilities
pub fn model(name: &str) -> ModelConfig {
    ModelConfig::new(constants::TEST_PROVIDER, name)
}

pub fn model_with_priority(name: &str, priority: u32) -> ModelConfig {
    let mut config = model(name);
    config.priority = priority;
    config
}

/// Register a scripted model, keeping `backend` usable as a call counter
pub fn register(engine: &Engine, config: ModelConfig, backend: &ScriptedBackend) -> String {
    engine
        .register_model(config, Backend::Scripted(backend.clone()))
        .expect("Failed to register scripted model")
        .id
}

/// Switchboard config with short queue backoff and no periodic snapshots
pub fn fast_switchboard_config() -> SwitchboardConfig {
    SwitchboardConfig {
        queue: QueueConfig {
            workers: 2,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            ..QueueConfig::default()
        },
        maintenance_interval: Duration::from_secs(60),
        snapshot_interval: Duration::from_secs(3600),
    }
}

pub async fn start(engine: Arc<Engine>, store: Option<Arc<dyn Store>>) -> Arc<Switchboard> {
    Arc::new(Switchboard::start(engine, fast_switchboard_config(), store).await)
}

/// Serve the full router over `switchboard` without Redis
pub fn test_server(switchboard: Arc<Switchboard>) -> TestServer {
    let state = Arc::new(AppState::new_for_testing(Config::default(), switchboard));
    TestServer::new(routes::create_router(state)).expect("Failed to create test server")
}

/// Poll a task until it reaches a terminal state
pub async fn wait_for_task(switchboard: &Switchboard, id: Uuid) -> TaskStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(constants::TASK_WAIT_SECS);
    loop {
        let status = switchboard.status(id).expect("Task should be known");
        if status.state.is_terminal() {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "Task {} did not finish, last state {:?}",
            id,
            status.state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
