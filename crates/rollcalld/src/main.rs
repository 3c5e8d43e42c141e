use anyhow::Result;
use rollcall_core::{BatchRecognizer, EventPublisher};
use rollcall_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod events;

use config::{BusKind, Config};
use dbus_interface::{RollcallService, SignalSubscriber, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env()?;
    tracing::info!(
        db_path = %config.db_path.display(),
        threshold = config.match_threshold,
        descriptor_dim = config.descriptor_dim,
        bus = ?config.bus,
        "configuration loaded"
    );

    let store = SqliteStore::open(&config.db_path)?;
    let counts = store.counts()?;
    tracing::info!(
        identities = counts.identities,
        descriptors = counts.descriptors,
        records = counts.records,
        "store opened"
    );

    let engine = engine::spawn_engine(store, config.descriptor_dim, config.request_timeout())?;

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let conn = builder.build().await?;

    let bus = events::EventBus::new(config.event_capacity);
    let event_log = tokio::spawn(events::log_events(bus.subscribe()));

    let mut publisher = EventPublisher::new();
    publisher.subscribe(Box::new(bus.subscriber()));
    publisher.subscribe(Box::new(SignalSubscriber::new(
        &conn,
        tokio::runtime::Handle::current(),
    )?));

    let service = RollcallService::new(
        engine,
        Arc::new(publisher),
        BatchRecognizer::new(config.match_threshold),
        config.descriptor_dim,
        config.db_path.clone(),
    );
    conn.object_server().at(OBJECT_PATH, service).await?;
    conn.request_name(BUS_NAME).await?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    // Dropping the connection releases the service and the engine handle it holds.
    drop(conn);
    drop(bus);
    event_log.abort();

    Ok(())
}
