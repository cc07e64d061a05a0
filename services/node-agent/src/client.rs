//! Control plane API client for the node agent.
//!
//! Implements both cluster-facing collaborators over HTTP:
//! - Publishing instance events (the event bus)
//! - Upserting instance snapshots (the replicated cluster store)

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleet_events::InstanceEvent;
use fleet_id::{InstanceId, NodeId};
use serde::Serialize;
use tracing::{debug, error};

use crate::config::Config;
use crate::instance::{ClusterReplicator, EventBus, Instance};

/// Control plane API client.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    node_id: NodeId,
}

/// Body of an event publish request.
#[derive(Debug, Serialize)]
struct PublishEventRequest<'a> {
    node_id: NodeId,
    subject: &'a str,
    event: &'a InstanceEvent,
}

impl ControlPlaneClient {
    /// Create a new control plane client.
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.control_plane_url.trim_end_matches('/').to_string(),
            node_id: config.node_id,
        })
    }

    /// Maps a bus subject such as `machines.{m}.instances.{i}.events` onto
    /// its REST resource.
    fn event_url(&self, subject: &str) -> String {
        format!("{}/v1/{}", self.base_url, subject.replace('.', "/"))
    }

    fn instance_url(&self, id: InstanceId) -> String {
        format!("{}/v1/instances/{}", self.base_url, id)
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<()> {
        if !response.status().is_success() {
            let status_code = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status_code, body = %body, "Failed to {what}");
            anyhow::bail!("Failed to {}: {} - {}", what, status_code, body);
        }
        Ok(())
    }
}

#[async_trait]
impl EventBus for ControlPlaneClient {
    async fn request(&self, subject: &str, event: &InstanceEvent) -> Result<()> {
        let url = self.event_url(subject);
        debug!(
            url = %url,
            event_id = %event.id,
            event_type = %event.event_type(),
            "Publishing instance event"
        );

        let body = PublishEventRequest {
            node_id: self.node_id,
            subject,
            event,
        };
        let response = self.client.post(&url).json(&body).send().await?;
        Self::check(response, "publish event").await
    }
}

#[async_trait]
impl ClusterReplicator for ControlPlaneClient {
    async fn upsert_instance(&self, instance: &Instance) -> Result<()> {
        let url = self.instance_url(instance.id);
        debug!(
            instance_id = %instance.id,
            status = %instance.status(),
            "Replicating instance"
        );

        let response = self.client.put(&url).json(instance).send().await?;
        Self::check(response, "upsert instance").await
    }
}
