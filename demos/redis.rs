use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use typedq::prelude::*;

#[derive(Debug, Serialize, Deserialize)]
struct HelloJob {
    name: String,
    message: String,
}

typedq::job!(HelloJob, "hello");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    LoggingConfig::default().init()?;

    println!("🚀 typedq Redis Streams example");

    let broker_config = RedisBrokerConfig::new("redis://localhost:6379")
        .with_consumer_group("typedq-demo")
        .with_processing_timeout(Duration::from_secs(30))
        .with_claim_interval(Duration::from_secs(5))
        .with_max_len(10_000, true);

    println!("🔗 Connecting to Redis at {}", broker_config.connection_string);
    let broker = Arc::new(RedisBroker::new(broker_config).await?);

    let config = QueueConfig::default()
        .with_concurrency(4)
        .with_topic_prefix("demo")
        .with_dlq(true);
    let queue = Arc::new(Queue::<HelloJob>::new(broker, config)?);
    let token = CancellationToken::new();

    let consumer = {
        let queue = Arc::clone(&queue);
        let token = token.clone();
        tokio::spawn(async move {
            queue
                .consume(token, |ctx: CancellationToken, job: Arc<HelloJob>| async move {
                    println!("👋 Hello {}: {}", job.name, job.message);
                    tokio::select! {
                        _ = ctx.cancelled() => Err::<(), BoxError>("interrupted".into()),
                        _ = tokio::time::sleep(Duration::from_millis(500)) => {
                            println!("✅ Job completed for {}", job.name);
                            Ok(())
                        }
                    }
                })
                .await
        })
    };

    for (name, message) in [
        ("User", "Welcome to typedq"),
        ("Redis", "Job successfully produced!"),
        ("Alice", "Hello from Wonderland!"),
        ("Bob", "Greetings from the Builder!"),
    ] {
        let job = HelloJob {
            name: name.to_string(),
            message: message.to_string(),
        };
        queue.produce(&token, &job).await?;
        println!("📥 Job produced on {}: {}", queue.topic(), name);
    }

    signal::ctrl_c().await.expect("Failed to listen for ctrl+c");

    token.cancel();
    let _ = consumer.await;
    queue.close().await?;
    Ok(())
}
