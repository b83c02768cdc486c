use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use weft_core::{
    CatchMap, Effect, ErrorTag, Failure, Provider, RetryPolicy, Runtime, RuntimeConfig, SpanBody,
    SpanOutcome, Token, Tracer, TracingTracer,
};

#[derive(Debug, Deserialize)]
struct GreeterConfig {
    greeting: String,
    name: String,
}

/// Fails a fixed number of times before answering.
struct Greeter {
    greeting: String,
    remaining_failures: AtomicU32,
}

#[derive(Debug)]
struct Unavailable {
    left: u32,
}

const CONFIG: Token<GreeterConfig> = Token::new("GreeterConfig");
const GREETER: Token<Greeter> = Token::new("Greeter");
const UNAVAILABLE: ErrorTag<Unavailable> = ErrorTag::new("Greeter.Unavailable");

impl Greeter {
    fn greet(&self, name: &str) -> Result<String, Failure> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(UNAVAILABLE.failure(Unavailable { left }));
        }
        Ok(format!("{}, {}!", self.greeting, name))
    }
}

/// Prints how long each span took, then defers to `TracingTracer`.
struct TimingTracer;

#[async_trait]
impl Tracer for TimingTracer {
    async fn span(&self, name: &str, attributes: &[(String, String)], body: SpanBody) -> SpanOutcome {
        let started = Instant::now();
        let outcome = TracingTracer.span(name, attributes, body).await;
        println!("span {name}: {:?} ok={}", started.elapsed(), outcome.is_success());
        outcome
    }
}

fn provider(config_json: &str) -> Result<Provider, serde_json::Error> {
    let config: GreeterConfig = serde_json::from_str(config_json)?;
    Ok(Provider::new()
        .value(CONFIG, config)
        .provide(GREETER, |r| async move {
            let config = r.get(CONFIG).await?;
            Ok(Greeter {
                greeting: config.greeting.clone(),
                remaining_failures: AtomicU32::new(2),
            })
        })
        .tracer(TimingTracer))
}

fn greet() -> Effect<String> {
    Effect::service(CONFIG)
        .with_service(GREETER, |config, greeter| {
            let name = config.name.clone();
            Effect::sync(move || greeter.greet(&name))
        })
        .tap_error(|failure| {
            if let Some(unavailable) = UNAVAILABLE.payload(failure) {
                println!("greeter unavailable (left={})", unavailable.left);
            }
            Effect::succeed(())
        })
}

fn slow(label: &'static str, ms: u64) -> Effect<&'static str> {
    Effect::sleep(Duration::from_millis(ms)).map(move |_| label)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    tracing::info!("weft demo starting");

    let provider = provider(r#"{ "greeting": "Hello", "name": "weft" }"#)?;
    let runtime = Runtime::builder()
        .provide(&provider)
        .config(RuntimeConfig::from_json(r#"{ "label": "demo", "deadline_ms": 5000 }"#)?)
        .expect_tokens(&[CONFIG.key(), GREETER.key()])
        .build()?;

    // (A) retry until the greeter recovers
    let retried = greet()
        .retry(RetryPolicy::exponential(3, Duration::from_millis(20)).retry_while(|f| UNAVAILABLE.matches(f)))
        .span("greet", [("attempts", "4")]);
    println!("retry: {:?}", runtime.run(retried).await);

    // (B) a fresh run builds a fresh greeter, so it fails again without retry
    let handled = greet().catch_tags(CatchMap::new().on_tag(UNAVAILABLE, |u| {
        Effect::succeed(format!("try again later ({} left)", u.left))
    }));
    println!("catch: {:?}", runtime.run(handled).await);

    // (C) timeout with and without fallback
    println!(
        "timeout: {:?}",
        runtime.run(slow("late", 200).timeout(Duration::from_millis(50))).await
    );
    println!(
        "timeout_or: {:?}",
        runtime
            .run(slow("late", 200).timeout_or(Duration::from_millis(50), Effect::succeed("fallback")))
            .await
    );

    // (D) combinators
    let all = Effect::all_with_concurrency([slow("a", 30), slow("b", 10), slow("c", 20)], 2);
    println!("all: {:?}", runtime.run(all).await);

    let any = Effect::any([
        Effect::fail(UNAVAILABLE.failure(Unavailable { left: 0 })),
        slow("second", 40),
        slow("third", 10),
    ]);
    println!("any: {:?}", runtime.run(any).await);

    let race = Effect::race([
        slow("tortoise", 100).finally(|| Effect::sync(|| {
            println!("tortoise cleaned up");
            Ok(())
        })),
        slow("hare", 10),
    ]);
    println!("race: {:?}", runtime.run(race).await);

    Ok(())
}
