use std::sync::Arc;

use anyhow::Result;
use grid_client::{
    db::{create_schema, PgStore},
    domain::Reading,
    store::{AggregateQueries, MemoryStore, ReadingStore},
};
use sqlx::postgres::PgPoolOptions;
use telemetry_service::{
    channel::{InboundMessage, MqttSubscription},
    config::{AppConfig, StoreKind},
    metrics_server, observability,
    pipeline::{Decode, Pipeline, Transform},
    query_api,
    sinks::{FileDeadLetterSink, StoreSink, StoreSinkSettings},
    transform::{ReadingDecoder, ReadingValidation},
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("shutdown requested, draining"),
                Err(e) => tracing::error!(error = %e, "failed to listen for ctrl-c"),
            }
            cancel.cancel();
        });
    }

    match cfg.store.kind {
        StoreKind::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(cfg.store.max_connections)
                .connect(&cfg.store.uri)
                .await?;
            create_schema(&pool, cfg.store.timescale_options()).await?;
            let store = PgStore::new(pool, cfg.store.aggregation());
            run_service(&cfg, Arc::new(store.clone()), Arc::new(store), cancel).await
        }
        StoreKind::Memory => {
            tracing::warn!("using the in-memory store; readings are lost on exit");
            let store = MemoryStore::new(cfg.store.aggregation());
            run_service(&cfg, Arc::new(store.clone()), Arc::new(store), cancel).await
        }
    }
}

async fn run_service(
    cfg: &AppConfig,
    writer: Arc<dyn ReadingStore>,
    queries: Arc<dyn AggregateQueries>,
    cancel: CancellationToken,
) -> Result<()> {
    let api = match &cfg.query_api {
        Some(api_cfg) => Some(query_api::serve(&api_cfg.bind_addr, queries, cancel.clone())?),
        None => None,
    };

    let subscription = Arc::new(MqttSubscription::connect(
        &cfg.broker,
        &cfg.consumer.topic_filter,
        cancel.clone(),
    ));

    let sink = StoreSink::new(
        writer,
        Arc::new(FileDeadLetterSink::new(&cfg.consumer.dead_letter_path)),
        StoreSinkSettings::from(&cfg.consumer),
    );

    let pipeline: Pipeline<_, InboundMessage, Reading, _> = Pipeline {
        source: subscription.clone(),
        decoder: Arc::new(ReadingDecoder) as Arc<dyn Decode<InboundMessage, Reading>>,
        transforms: vec![
            Arc::new(ReadingValidation::new(cfg.validation.clone())) as Arc<dyn Transform<Reading, Reading>>
        ],
        sink,
    };

    let result = pipeline.run().await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "pipeline failed, shutting down");
    }

    cancel.cancel();
    subscription.shutdown().await;

    if let Some(api) = api {
        let _ = api.await;
    }

    result?;
    tracing::info!("telemetry service stopped");
    Ok(())
}
