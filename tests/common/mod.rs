#![allow(dead_code)]

use std::sync::Arc;

use d_coord::service::MemoryEnsemble;
use d_coord::ConnectRetryPolicy;
use d_coord::Connection;
use d_coord::CoordinatorConfig;
use d_coord::PayloadFormat;
use serde::Deserialize;
use serde::Serialize;

pub const CHROOT: &str = "/d-coord-it";

// watch callbacks run on spawned tasks; waking should take far less than this
pub const WATCH_WAKE_LATENCY_MS: u64 = 200;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Task {
    pub id: u32,
    pub payload: String,
}

impl Task {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            payload: format!("task-{id}"),
        }
    }
}

pub fn test_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.connection.hosts = vec![
        "127.0.0.1:2181".to_string(),
        "127.0.0.1:2182".to_string(),
        "127.0.0.1:2183".to_string(),
    ];
    config.connection.chroot = Some(CHROOT.to_string());
    config.retry = ConnectRetryPolicy {
        max_attempts: 3,
        timeout_ms: 500,
        base_delay_ms: 10,
        max_delay_ms: 50,
    };
    config.codec = PayloadFormat::Json;
    config.validate().expect("test config should be valid")
}

/// Opens one client session against `ensemble`, rooted at [`CHROOT`]
pub async fn connect(ensemble: &MemoryEnsemble) -> Arc<Connection> {
    let conn = Connection::new(Arc::new(ensemble.clone()), test_config());
    conn.open().await.expect("open should succeed");
    Arc::new(conn)
}
