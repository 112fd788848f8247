use std::time::Duration;

use tapbus::*;

#[tokio::main]
async fn main() -> Result {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let source = ManualSource::new();
    let registry = InstanceRegistry::new(source.clone());

    // A chart that only wants prices, flushed in small batches
    let chart = registry.create_named_instance(
        "chart",
        Some(
            Config::default()
                .with_whitelist(["price"])
                .with_max_batch_size(10)
                .with_history_size(500),
        ),
    )?;
    // An audit log that sees everything except heartbeats, one event at a time
    let audit = registry.create_named_instance(
        "audit",
        Some(
            Config::default()
                .with_blacklist(["heartbeat"])
                .with_batching(false)
                .with_error_mode(ErrorMode::Suppress),
        ),
    )?;

    chart.on(
        "price",
        Listener::new(|e| {
            println!("[chart] {}", e.payload());
            Ok(())
        }),
    );
    audit.on(
        "*",
        Listener::new(|e| {
            println!("[audit] {}", e.event_type());
            Ok(())
        }),
    );

    println!("{}", serde_json::to_string_pretty(&registry.info()).unwrap_or_default());

    // Survey the feed while it runs
    let census = chart.discover(Duration::from_millis(200));
    for i in 0..20 {
        source.push(&format!(r#"{{"type":"price","px":{}}}"#, 100 + i));
        if i % 5 == 0 {
            source.push(r#"{"type":"heartbeat"}"#);
            source.push(r#"{"type":"order","side":"buy"}"#);
        }
    }

    for event in census.await? {
        println!("{:>4} x {}", event.count, event.event_type);
    }

    println!("chart dropped {} events", chart.metrics().dropped_events);
    println!("audit dropped {} events", audit.metrics().dropped_events);

    chart.destroy();
    audit.destroy();
    assert!(!registry.is_installed());
    Ok(())
}
