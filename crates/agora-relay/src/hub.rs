//! The relay hub: composition root tying registry, pipeline, guardian,
//! backbone, and migration together behind one handle.
//!
//! Publishes never deliver directly. Every publish goes out over the
//! backbone and comes back through the receive task like everyone else's,
//! so a message is delivered exactly once no matter how many instances
//! share the backbone. When the backbone is down the hub falls back to
//! direct local delivery, which is the degraded single-instance mode.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agora_core::errors::{ProtocolError, RelayError, ResourceError};
use agora_core::ids::ConnectionId;
use agora_core::protocol::{
    self, ClientFrame, ServerFrame, SystemEvent, TopicMessage,
};

use crate::backbone::{Backbone, BackboneEvent, BackoffPolicy, ReconnectSupervisor};
use crate::connection::{Connection, HealthState, Identity};
use crate::memory::{MemoryConfig, MemoryGuardian};
use crate::migration::{HandoffReport, MigrationCoordinator};
use crate::pipeline::{self, OutboundMessage, Pipeline, PipelineConfig};
use crate::registry::ConnectionRegistry;
use crate::stats::{StatsCollector, StatsSnapshot};
use crate::transport::{OutboundFrame, TransportAdapter};

/// Live connection gauge.
pub const GAUGE_CONNECTIONS: &str = "agora_connections";
/// Messages accepted by `publish`.
pub const COUNTER_PUBLISHED: &str = "agora_messages_published_total";
/// Publishes served via direct local delivery while the backbone was down.
pub const COUNTER_LOCAL_FALLBACK: &str = "agora_publish_local_fallback_total";

/// How often the reconnect supervisor polls backbone connectivity.
const BACKBONE_POLL: Duration = Duration::from_secs(5);

/// Tunables for one hub instance.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HubConfig {
    /// Batching thresholds.
    pub pipeline: PipelineConfig,
    /// Memory guardian thresholds.
    pub memory: MemoryConfig,
    /// How often the sweeper checks for due batches.
    pub sweep_interval_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            memory: MemoryConfig::default(),
            sweep_interval_ms: 25,
        }
    }
}

/// One relay instance.
pub struct RelayHub {
    registry: Arc<ConnectionRegistry>,
    pipeline: Arc<Pipeline>,
    guardian: Arc<MemoryGuardian>,
    backbone: Arc<dyn Backbone>,
    stats: Arc<StatsCollector>,
    migration: Arc<MigrationCoordinator>,
    config: HubConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayHub {
    /// Build a hub over the given backbone. Call [`RelayHub::start`] before
    /// attaching connections.
    #[must_use]
    pub fn new(config: HubConfig, backbone: Arc<dyn Backbone>) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let guardian = Arc::new(MemoryGuardian::new(config.memory));
        let stats = Arc::new(StatsCollector::new());
        let pipeline = Arc::new(Pipeline::new(
            config.pipeline,
            registry.clone(),
            guardian.clone(),
            stats.clone(),
        ));
        Arc::new(Self {
            registry,
            pipeline,
            guardian,
            backbone,
            stats,
            migration: Arc::new(MigrationCoordinator::new()),
            config,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the backbone receive task, the batch sweeper, and the backbone
    /// reconnect supervisor.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let hub = self.clone();
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(async move {
            hub.receive_loop(cancel).await;
        }));

        tasks.push(pipeline::spawn_sweeper(
            self.pipeline.clone(),
            Duration::from_millis(self.config.sweep_interval_ms),
            self.cancel.clone(),
        ));

        let supervisor = ReconnectSupervisor::new(
            self.backbone.clone(),
            self.stats.clone(),
            BackoffPolicy::default(),
            BACKBONE_POLL,
        );
        tasks.push(tokio::spawn(supervisor.run(self.cancel.clone())));
    }

    /// Stop background tasks, flushing pending batches on the way out.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Attach a new connection over `transport`.
    ///
    /// Issues a handle, registers it, opens its pipeline lane, and sends the
    /// `connection.established` greeting. Refused while draining.
    pub async fn attach(
        &self,
        transport: Arc<dyn TransportAdapter>,
    ) -> Result<ConnectionId, RelayError> {
        if !self.migration.accepting_connections() {
            return Err(ResourceError::Draining.into());
        }
        let conn = Arc::new(Connection::new(ConnectionId::new(), transport));
        let id = conn.id.clone();
        self.registry.register(conn.clone()).await?;
        self.pipeline.open_lane(&id);

        let greeting = ServerFrame::Connected {
            connection_id: id.clone(),
            timestamp: chrono::Utc::now(),
        };
        if let Err(e) = self.send_control(&conn, &greeting).await {
            self.pipeline.teardown(&id).await;
            return Err(e);
        }
        conn.set_health(HealthState::Active);
        // Absolute set: evictions inside the pipeline bypass attach/detach,
        // so a delta gauge would drift.
        metrics::gauge!(GAUGE_CONNECTIONS).set(self.registry.count().await as f64);
        info!(connection_id = %id, "connection attached");
        Ok(id)
    }

    /// Detach and fully tear down a connection. Idempotent.
    pub async fn detach(&self, id: &ConnectionId) {
        self.pipeline.teardown(id).await;
        metrics::gauge!(GAUGE_CONNECTIONS).set(self.registry.count().await as f64);
        debug!(connection_id = %id, "connection detached");
    }

    /// Record the authenticated identity for `id`.
    pub async fn authenticate(&self, id: &ConnectionId, identity: Identity) {
        if let Some(conn) = self.registry.lookup(id).await {
            debug!(connection_id = %id, identity = identity.as_str(), "authenticated");
            conn.set_identity(identity);
        }
    }

    /// Handle one inbound client frame.
    ///
    /// Protocol violations are answered with a `system.error` frame and the
    /// connection stays open. Any inbound frame counts as liveness.
    pub async fn handle_frame(&self, id: &ConnectionId, frame: ClientFrame) {
        let Some(conn) = self.registry.lookup(id).await else {
            return;
        };
        conn.mark_alive();

        match frame {
            ClientFrame::Connect { .. } => {
                // Token verification happens at the session boundary; by the
                // time a frame reaches the hub the greeting is already out.
            }
            ClientFrame::Subscribe { topics } => {
                for topic in topics {
                    if let Err(e) = protocol::validate_topic(&topic) {
                        self.reply_error(&conn, &e).await;
                        continue;
                    }
                    match self.registry.subscribe(id, &topic).await {
                        Ok(added) => {
                            if added {
                                debug!(connection_id = %id, topic, "subscribed");
                            }
                        }
                        Err(e) => warn!(connection_id = %id, error = %e, "subscribe failed"),
                    }
                }
            }
            ClientFrame::Unsubscribe { topics } => {
                for topic in topics {
                    if let Err(e) = protocol::validate_topic(&topic) {
                        self.reply_error(&conn, &e).await;
                        continue;
                    }
                    if self.registry.unsubscribe(id, &topic).await {
                        debug!(connection_id = %id, topic, "unsubscribed");
                    }
                }
            }
            ClientFrame::Ping => {
                let _ = self.send_control(&conn, &ServerFrame::Pong).await;
            }
            ClientFrame::Pong => {}
            ClientFrame::ReconnectAck => {
                self.migration.acknowledge(id);
            }
        }
    }

    /// Report a protocol violation to an inbound text frame that did not
    /// parse. The connection stays open.
    pub async fn reject_frame(&self, id: &ConnectionId, error: &ProtocolError) {
        if let Some(conn) = self.registry.lookup(id).await {
            conn.mark_alive();
            self.reply_error(&conn, error).await;
        }
    }

    /// Publish a topic message to every subscriber on every instance.
    ///
    /// The publisher returns as soon as the backbone accepts the event; slow
    /// consumers never block this call. If the backbone is down the message
    /// is delivered to local subscribers directly and the degraded state is
    /// recorded.
    pub async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<(), RelayError> {
        protocol::validate_topic(topic)?;
        let message = TopicMessage::new(topic, payload);
        let bytes = serde_json::to_vec(&message).map_err(|e| ProtocolError::InvalidFrame {
            detail: e.to_string(),
        })?;
        metrics::counter!(COUNTER_PUBLISHED).increment(1);

        let event = BackboneEvent {
            topic: topic.to_owned(),
            payload: Bytes::from(bytes),
        };
        match self.backbone.publish(event).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(topic, error = %e, "backbone publish failed, delivering locally");
                self.stats.set_backbone_connected(false);
                metrics::counter!(COUNTER_LOCAL_FALLBACK).increment(1);
                self.deliver_local(message).await;
                Ok(())
            }
        }
    }

    /// Begin refusing new connections ahead of a handoff.
    pub fn begin_drain(&self) -> bool {
        self.migration.begin_drain()
    }

    /// Hand every connection off to `endpoint`, closing each on ack or at
    /// the `grace` boundary.
    pub async fn handoff(&self, endpoint: &str, grace: Duration) -> HandoffReport {
        self.pipeline.flush_all().await;
        self.migration
            .run_handoff(&self.registry, &self.pipeline, endpoint, grace)
            .await
    }

    /// Operational snapshot for the stats surface.
    pub async fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(
            self.registry.count().await,
            self.registry.index().topic_histogram(),
            self.guardian.pressure(),
            self.guardian.global_buffered(),
        )
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The migration coordinator.
    #[must_use]
    pub fn migration(&self) -> &Arc<MigrationCoordinator> {
        &self.migration
    }

    /// The memory guardian.
    #[must_use]
    pub fn guardian(&self) -> &Arc<MemoryGuardian> {
        &self.guardian
    }

    /// Fan a message out to local subscribers through the pipeline.
    async fn deliver_local(&self, message: TopicMessage) {
        let subscribers = self.registry.subscribers_of(&message.topic);
        for id in subscribers {
            self.pipeline
                .enqueue(&id, OutboundMessage::normal(message.clone()))
                .await;
        }
    }

    /// Pump backbone events into local delivery until cancelled.
    async fn receive_loop(&self, cancel: CancellationToken) {
        let mut rx = self.backbone.subscribe();
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                event = rx.recv() => match event {
                    Ok(event) => {
                        match serde_json::from_slice::<TopicMessage>(&event.payload) {
                            Ok(message) => self.deliver_local(message).await,
                            Err(e) => {
                                warn!(topic = event.topic, error = %e,
                                    "undecodable backbone payload dropped");
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "backbone receiver lagged, messages skipped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        warn!("backbone channel closed, local delivery only");
                        return;
                    }
                },
            }
        }
    }

    async fn send_control(
        &self,
        conn: &Arc<Connection>,
        frame: &ServerFrame,
    ) -> Result<(), RelayError> {
        let json = frame.to_json()?;
        conn.transport()
            .send(OutboundFrame::Control(json))
            .await
            .map_err(Into::into)
    }

    async fn reply_error(&self, conn: &Arc<Connection>, error: &ProtocolError) {
        let frame = ServerFrame::System {
            event: SystemEvent::Error {
                code: error.code().to_owned(),
                message: error.to_string(),
            },
        };
        let _ = self.send_control(conn, &frame).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
