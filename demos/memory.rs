use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use typedq::observability::InMemoryCounter;
use typedq::prelude::*;

#[derive(Debug, Serialize, Deserialize)]
struct HelloJob {
    name: String,
    message: String,
}

typedq::job!(HelloJob, "hello");

#[tokio::main]
async fn main() -> QueueResult<()> {
    LoggingConfig::default().init()?;

    println!("🚀 typedq in-memory example");

    let counter = Arc::new(InMemoryCounter::new());
    let config = QueueConfig::development()
        .with_max_retries(2)
        .with_backoff(FixedBackoff::new(Duration::from_millis(200)))
        .with_counter(counter.clone());

    let queue = Arc::new(Queue::<HelloJob>::new(Arc::new(MemoryBroker::new()), config)?);
    let token = CancellationToken::new();

    let consumer = {
        let queue = Arc::clone(&queue);
        let token = token.clone();
        tokio::spawn(async move {
            queue
                .consume(token, |_ctx: CancellationToken, job: Arc<HelloJob>| async move {
                    if job.name == "Mallory" {
                        return Err::<(), BoxError>("Mallory is not welcome".into());
                    }
                    println!("👋 Hello {}: {}", job.name, job.message);
                    Ok(())
                })
                .await
        })
    };

    for (name, message) in [
        ("Alice", "Hello from Wonderland!"),
        ("Bob", "Greetings from the Builder!"),
        ("Mallory", "Let me in"),
    ] {
        let job = HelloJob {
            name: name.to_string(),
            message: message.to_string(),
        };
        queue.produce(&token, &job).await?;
        println!("📥 Job produced: {}", name);
    }

    println!("🔨 Consuming! Press Ctrl+C to stop...");
    signal::ctrl_c().await.expect("Failed to listen for ctrl+c");

    token.cancel();
    let _ = consumer.await;
    queue.close().await?;

    let snapshot = counter.snapshot();
    println!(
        "📊 success: {}, retries: {}, dead-lettered: {}",
        snapshot.processed(queue.topic(), typedq::observability::ProcessStatus::Success),
        snapshot.retries(queue.topic()),
        snapshot.dlq(queue.topic()),
    );
    Ok(())
}
