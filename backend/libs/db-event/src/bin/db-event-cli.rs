use std::env;

use db_event::{
    ConsumerConfig, ConsumerMetrics, DbConfig, EventBuilder, EventStore, PgDriverConfig,
    PgEventDriver,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

fn usage() -> ! {
    eprintln!("Usage (DATABASE_URL must be set):");
    eprintln!("  db-event-cli provision");
    eprintln!("  db-event-cli produce <count>");
    eprintln!("  db-event-cli consume <node_id> <read_group>");
    eprintln!("  db-event-cli offset <read_group>");
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage();
    }

    let db_config = DbConfig::from_env()?;
    let mut driver_config = PgDriverConfig::from_env();

    match args[1].as_str() {
        "provision" if args.len() == 2 => {
            let driver = PgEventDriver::connect(&db_config, driver_config).await?;
            let store = EventStore::new(driver).await?;
            println!("Event tables provisioned");
            store.close().await?;
        }
        "produce" if args.len() == 3 => {
            let count: usize = args[2].parse()?;
            let driver = PgEventDriver::connect(&db_config, driver_config).await?;
            let store = EventStore::new(driver).await?;

            for _ in 0..count {
                let id = Uuid::new_v4();
                let event = EventBuilder::new("testtype")
                    .aggregate("aggType", "agg1")
                    .data(&serde_json::json!({ "id": id }))?
                    .build();

                store.produce(&[event]).await?;
                println!("event '{}' produced", id);
            }

            store.close().await?;
        }
        "consume" if args.len() == 4 => {
            driver_config.node_id = args[2].clone();
            let read_group = args[3].clone();
            let node_id = driver_config.node_id.clone();

            let driver = PgEventDriver::connect(&db_config, driver_config).await?;
            let store = EventStore::new(driver).await?;
            let consumer = store
                .new_consumer(read_group.clone(), ConsumerConfig::from_env())
                .with_metrics(ConsumerMetrics::new(&read_group));

            consumer.consume(move |event| {
                let node_id = node_id.clone();
                async move {
                    info!(
                        node_id = %node_id,
                        event_id = event.id,
                        event_type = %event.event_type,
                        "Got event"
                    );
                    Ok(())
                }
            })?;

            println!("Consumer ready");
            tokio::signal::ctrl_c().await?;

            consumer.close_and_wait().await;
            store.driver().release_lease(&read_group).await?;
            store.close().await?;
            println!("Done");
        }
        "offset" if args.len() == 3 => {
            let driver = PgEventDriver::connect(&db_config, driver_config).await?;
            let offset = driver.current_offset(&args[2]).await?;
            println!("{}", offset);
            driver.pool().close().await;
        }
        _ => usage(),
    }

    Ok(())
}
