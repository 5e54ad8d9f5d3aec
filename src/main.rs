//! GPS tracker service

use std::future::IntoFuture;
use std::sync::Arc;

use gps_tracker::{
    api,
    config::AppConfig,
    database::Database,
    errors::TrackerError,
    mqtt::{MqttClient, MqttClientBuilder},
    notifier::{HttpNotifier, Notifier, UnconfiguredNotifier},
    pipeline::{IngestPipeline, SpeedPolicy},
    retention::RetentionStore,
    storage::StorageMonitor,
};
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), TrackerError> {
    #[cfg(feature = "dotenvy")]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Configuration file layered under environment variables
    let config = AppConfig::load()?;

    let db = Arc::new(Database::from_config(&config.database).await?);

    let store = Arc::new(RetentionStore::new(&config.retention));
    store.restore_from(db.as_ref()).await?;

    let notifier: Arc<dyn Notifier> = match &config.alert {
        Some(alert) => Arc::new(HttpNotifier::new(alert.clone()).map_err(|e| {
            TrackerError::Configuration {
                message: format!("Could not build alert notifier: {}", e),
            }
        })?),
        None => {
            warn!("No alert transport configured, storage alerts will only be logged");
            Arc::new(UnconfiguredNotifier)
        }
    };
    let mut monitor = StorageMonitor::new(&config.storage, notifier);
    if let Some(alert) = &config.alert {
        monitor = monitor.notify_timeout(alert.timeout);
    }

    let pipeline = Arc::new(
        IngestPipeline::new(db.clone(), store, Arc::new(monitor))
            .archive(db.clone())
            .speed_policy(SpeedPolicy::new(&config.speed))
            .ingest_config(&config.ingest),
    );

    let mqtt_client = match &config.mqtt {
        Some(mqtt) => Some(
            MqttClientBuilder::new(mqtt)?
                .connect(&mqtt.topics)
                .await?,
        ),
        None => None,
    };

    let listener = TcpListener::bind(config.http.bind).await?;
    info!("Listening on {}", config.http.bind);
    let state = api::AppState {
        pipeline: pipeline.clone(),
        freshness_window: config.retention.freshness_window,
    };
    let server = axum::serve(listener, api::router(state)).into_future();

    // Setup signal handling for graceful shutdown
    let shutdown_signal = signal::ctrl_c();

    tokio::select! {
        result = server => {
            info!("HTTP server stopped: {:?}", result);
        }
        _ = run_mqtt_ingest(mqtt_client, pipeline) => {
            info!("MQTT ingestion stopped");
        }
        _ = shutdown_signal => {
            info!("Received shutdown signal");
        }
    }

    Ok(())
}

async fn run_mqtt_ingest(mqtt_client: Option<MqttClient>, pipeline: Arc<IngestPipeline>) {
    let Some(mut mqtt_client) = mqtt_client else {
        // Nothing to ingest; let the HTTP server run
        return std::future::pending().await;
    };

    while let Some(upload) = mqtt_client.recv().await {
        if let Err(e) = pipeline
            .ingest_batch(&upload.device_id, upload.locations)
            .await
        {
            error!("Upload processing error: {}", e);
        }
    }
}
