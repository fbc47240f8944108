//! # Refresh Demo
//!
//! Wires every layer together against in-memory transports:
//!
//! - an air-quality provider behind a resilient client that fails every third request
//! - a pollen provider gated behind a feature flag that is switched off
//! - a refresh run over two targets, followed by cached reads and a health report
//!
//! Run with `RUST_LOG=airgrid_core=debug` to watch retries and cache hits.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use airgrid_core::{
    init_tracing, AirgridConfig, FeatureGated, FetchContext, FetchError, FetchThroughCache,
    HealthRegistry, HttpClient, HttpFuture, HttpPointProvider, HttpRequest, HttpResponse,
    RefreshDomain, RefreshScheduler, RefreshTarget, ResilientClient, StaticFeatureFlags,
    TelemetryConfig,
};

/// Transport answering 503 on every third request.
struct FlakyTransport {
    requests: AtomicU32,
}

impl HttpClient for FlakyTransport {
    fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a> {
        let count = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        let response = if count % 3 == 0 {
            HttpResponse::new(503, "upstream busy")
        } else {
            HttpResponse::ok_json(format!("{{\"url\":\"{}\"}}", request.full_url()))
        };
        Box::pin(async move { Ok(response) })
    }
}

fn decode_body(response: &HttpResponse) -> Result<String, FetchError> {
    let value: serde_json::Value = serde_json::from_str(&response.body)
        .map_err(|error| FetchError::provider(error.to_string()))?;
    Ok(value["url"].as_str().unwrap_or_default().to_owned())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(TelemetryConfig::default())?;

    let config = AirgridConfig::from_env()?;
    let registry = Arc::new(HealthRegistry::new());
    let transport: Arc<dyn HttpClient> = Arc::new(FlakyTransport {
        requests: AtomicU32::new(0),
    });

    let air_client = Arc::new(
        ResilientClient::new("air_quality", config.resilience)?
            .with_registry(registry.clone()),
    );
    let air_quality = FetchThroughCache::new(
        Arc::new(HttpPointProvider::new(
            air_client,
            transport.clone(),
            "https://air.example.test/v1/current",
            decode_body,
        )),
        config.cache,
    )?;

    let flags = Arc::new(StaticFeatureFlags::new(false));
    let pollen_client = Arc::new(
        ResilientClient::new("pollen", config.resilience)?.with_registry(registry.clone()),
    );
    let pollen = FetchThroughCache::new(
        Arc::new(FeatureGated::new(
            HttpPointProvider::new(
                pollen_client,
                transport,
                "https://pollen.example.test/v2/forecast",
                decode_body,
            ),
            flags.clone(),
            "pollen_enabled",
        )),
        config.cache,
    )?;

    let scheduler = RefreshScheduler::new(config.scheduler)?
        .with_target(
            RefreshTarget::new("benelux", 1)
                .with_point(52.370, 4.895)
                .with_point(50.850, 4.351)
                .with_point(49.611, 6.131),
        )
        .with_target(RefreshTarget::new("alps", 2).with_point(46.948, 7.447))
        .with_domain(RefreshDomain::new(Arc::new(air_quality.clone())))
        .with_domain(RefreshDomain::new(Arc::new(pollen.clone())).with_flag("pollen_enabled"))
        .with_feature_flags(flags);

    let result = scheduler.run(&FetchContext::new()).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    // Served from the cache warmed by the run.
    let reading = air_quality.get(&FetchContext::new(), 52.37, 4.895).await?;
    println!("amsterdam air quality source: {reading}");
    println!("cache: {:?}", air_quality.stats().await);

    match pollen.get(&FetchContext::new(), 52.37, 4.895).await {
        Ok(value) => println!("pollen: {value}"),
        Err(error) => println!("pollen skipped: {error}"),
    }

    println!("{}", serde_json::to_string_pretty(&registry.get_all_health())?);
    println!("{:?}", registry.summary());
    Ok(())
}
