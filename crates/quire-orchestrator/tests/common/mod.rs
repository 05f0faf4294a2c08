//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use quire_orchestrator::config::{OrchestratorConfig, SectionConfig};
use quire_orchestrator::{ConnectionId, DisconnectCallback, StreamEvent, Transport, TransportError};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Transport that records every event per connection.
#[derive(Default)]
pub struct RecordingTransport {
    delivered: Mutex<HashMap<ConnectionId, Vec<StreamEvent>>>,
    closed: Mutex<HashSet<ConnectionId>>,
    stalled: Mutex<HashSet<ConnectionId>>,
    callbacks: Mutex<HashMap<ConnectionId, Vec<DisconnectCallback>>>,
}

impl RecordingTransport {
    pub fn events(&self, connection: &ConnectionId) -> Vec<StreamEvent> {
        self.delivered.lock().unwrap().get(connection).cloned().unwrap_or_default()
    }

    /// Deltas of the chunk events delivered to `connection`, in order.
    pub fn chunks(&self, connection: &ConnectionId) -> Vec<String> {
        self.events(connection)
            .into_iter()
            .filter_map(|event| match event {
                StreamEvent::Chunk { delta, .. } => Some(delta),
                _ => None,
            })
            .collect()
    }

    pub fn last_event(&self, connection: &ConnectionId) -> Option<StreamEvent> {
        self.events(connection).pop()
    }

    /// Simulates the client going away.
    pub fn disconnect(&self, connection: &ConnectionId) {
        self.closed.lock().unwrap().insert(connection.clone());
        let callbacks = self.callbacks.lock().unwrap().remove(connection).unwrap_or_default();
        for callback in callbacks {
            callback();
        }
    }

    /// Makes every send to `connection` hang forever.
    pub fn stall(&self, connection: &ConnectionId) {
        self.stalled.lock().unwrap().insert(connection.clone());
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, connection: &ConnectionId, event: &StreamEvent) -> Result<(), TransportError> {
        if self.closed.lock().unwrap().contains(connection) {
            return Err(TransportError::Disconnected);
        }
        let stalled = self.stalled.lock().unwrap().contains(connection);
        if stalled {
            futures::future::pending::<()>().await;
        }
        self.delivered.lock().unwrap().entry(connection.clone()).or_default().push(event.clone());
        Ok(())
    }

    fn on_disconnect(&self, connection: &ConnectionId, callback: DisconnectCallback) {
        self.callbacks.lock().unwrap().entry(connection.clone()).or_default().push(callback);
    }
}

/// Polls `condition` until it holds, failing the test after a while.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not met in time");
}

/// Deterministic configuration: no jitter, short backoff, two retries.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.upstream.max_retries = 2;
    config.upstream.base_delay_ms = 100;
    config.upstream.max_delay_ms = 1000;
    config.upstream.jitter_ratio = 0.0;
    config.upstream.timeout_secs = 5;
    config.rate_limit.quota = 10;
    config.sections.insert(
        "intro".to_string(),
        SectionConfig {
            system_prompt: "Help the user write the introduction of their business plan.".to_string(),
            fallback: Some("Tell us who your customers are and what problem you solve for them.".to_string()),
            ..SectionConfig::default()
        },
    );
    config
}
