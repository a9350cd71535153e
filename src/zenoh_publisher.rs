//! Zenoh Publishing Module
//!
//! Publishes motor frames and controller health to separate Zenoh topics
//! under a common prefix, as an alternative to JSON on stdout.

#[cfg(feature = "zenoh-integration")]
use {
    crate::telemetry::{HealthData, MotorsData, TelemetryPublisher},
    anyhow::{anyhow, Context, Result},
    async_trait::async_trait,
    std::sync::Arc,
    tracing::{debug, info},
    zenoh::{pubsub::Publisher, Session},
};

/// Zenoh publisher for assembly telemetry
///
/// Topics, for a prefix `armature`:
/// - `armature/motors` - motor frames
/// - `armature/health` - controller health
/// - `armature/<topic>` - custom payloads
#[cfg(feature = "zenoh-integration")]
#[derive(Clone)]
pub struct ZenohPublisher {
    prefix: String,
    motors_publisher: Arc<Publisher<'static>>,
    health_publisher: Arc<Publisher<'static>>,
    session: Arc<Session>,
}

#[cfg(feature = "zenoh-integration")]
impl ZenohPublisher {
    pub async fn new(prefix: &str) -> Result<Self> {
        info!("Initializing Zenoh session for telemetry under '{}'", prefix);

        let session = zenoh::open(zenoh::Config::default())
            .await
            .map_err(|e| anyhow!("Failed to open Zenoh session: {}", e))?;

        let motors_topic = format!("{}/motors", prefix);
        let health_topic = format!("{}/health", prefix);

        let motors_publisher = session
            .declare_publisher(motors_topic.clone())
            .await
            .map_err(|e| anyhow!("Failed to create motors publisher: {}", e))?;
        let health_publisher = session
            .declare_publisher(health_topic.clone())
            .await
            .map_err(|e| anyhow!("Failed to create health publisher: {}", e))?;

        debug!("Zenoh publishers ready: {}, {}", motors_topic, health_topic);

        Ok(Self {
            prefix: prefix.to_string(),
            motors_publisher: Arc::new(motors_publisher),
            health_publisher: Arc::new(health_publisher),
            session: Arc::new(session),
        })
    }

    pub fn topics(&self) -> Vec<String> {
        vec![format!("{}/motors", self.prefix), format!("{}/health", self.prefix)]
    }
}

#[cfg(feature = "zenoh-integration")]
#[async_trait]
impl TelemetryPublisher for ZenohPublisher {
    async fn publish_motors(&self, data: &MotorsData) -> Result<()> {
        let payload = serde_json::to_vec(data).context("Failed to serialize motor frame")?;
        self.motors_publisher
            .put(payload)
            .await
            .map_err(|e| anyhow!("Failed to publish motor frame: {}", e))?;
        Ok(())
    }

    async fn publish_health(&self, data: &HealthData) -> Result<()> {
        let payload = serde_json::to_vec(data).context("Failed to serialize health frame")?;
        self.health_publisher
            .put(payload)
            .await
            .map_err(|e| anyhow!("Failed to publish health frame: {}", e))?;
        Ok(())
    }

    async fn publish_custom(&self, topic: &str, data: &serde_json::Value) -> Result<()> {
        let payload = serde_json::to_vec(data).context("Failed to serialize custom payload")?;
        let key = format!("{}/{}", self.prefix, topic);
        self.session
            .put(key.clone(), payload)
            .await
            .map_err(|e| anyhow!("Failed to publish to {}: {}", key, e))?;
        Ok(())
    }
}

#[cfg(not(feature = "zenoh-integration"))]
pub struct ZenohPublisher;

#[cfg(not(feature = "zenoh-integration"))]
impl ZenohPublisher {
    pub async fn new(_prefix: &str) -> anyhow::Result<Self> {
        Err(anyhow::anyhow!(
            "Zenoh integration not enabled. Enable with --features zenoh-integration"
        ))
    }

    pub fn topics(&self) -> Vec<String> {
        vec![]
    }
}
