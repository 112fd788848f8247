use std::time::Duration;

use tapbus::*;

#[tokio::main]
async fn main() -> Result {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // The source stands in for an intercepted socket
    let source = ManualSource::new();
    let registry = InstanceRegistry::new(source.clone());
    let pipeline = registry.create_instance(None)?;
    pipeline.wait_for_ready().await?;

    // Subscribe to one literal type and one pattern
    pipeline.on(
        "greeting",
        Listener::new(|envelope| {
            let name = envelope.get("name").and_then(|v| v.as_str()).unwrap_or("?");
            println!("Hello, {name}! (event #{})", envelope.sequence());
            Ok(())
        }),
    );
    pipeline.on(
        "user_*",
        Listener::new(|envelope| {
            println!("user activity: {envelope}");
            Ok(())
        }),
    );

    source.push(r#"{"type":"greeting","name":"World"}"#);
    source.push(r#"[{"type":"user_joined","id":1},{"type":"user_left","id":2}]"#);
    source.push("not json at all");

    // Let the batch timer fire
    tokio::time::sleep(Duration::from_millis(50)).await;

    println!("{:#?}", pipeline.metrics());
    pipeline.destroy();
    Ok(())
}
