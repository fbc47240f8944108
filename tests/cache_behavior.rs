//! Behavior-driven tests for the fetch-through cache
//!
//! These tests verify HOW cached provider data is bucketed, refreshed and
//! served stale during outages, focusing on what callers observe.

use airgrid_core::{
    CacheConfig, CacheMode, Coordinates, FetchContext, FetchError, FetchThroughCache,
    FnPointProvider, HealthRegistry, HttpClient, HttpError, HttpFuture, HttpPointProvider,
    HttpRequest, HttpResponse, ResilienceConfig, ResilientClient, RetryPolicy,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

const HOUR: Duration = Duration::from_secs(60 * 60);

fn config(grid_size: f64) -> CacheConfig {
    CacheConfig {
        ttl: HOUR,
        grid_size,
        stale_if_error_ttl: 6 * HOUR,
    }
}

/// Provider returning the call number, failing while `failing` is set.
fn counting_cache(
    grid_size: f64,
    calls: Arc<AtomicU32>,
    failing: Arc<AtomicBool>,
) -> FetchThroughCache<u32> {
    let provider = FnPointProvider::new("air_quality", move |_, _| {
        let calls = Arc::clone(&calls);
        let failing = Arc::clone(&failing);
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if failing.load(Ordering::SeqCst) {
                Err(FetchError::Server { status: 503 })
            } else {
                Ok(call)
            }
        }
    });
    FetchThroughCache::new(Arc::new(provider), config(grid_size)).expect("valid config")
}

/// Transport answering with a JSON body until `down` is set, then 503.
struct SwitchableTransport {
    down: AtomicBool,
    requests: AtomicU32,
}

impl HttpClient for SwitchableTransport {
    fn execute<'a>(&'a self, _request: HttpRequest) -> HttpFuture<'a> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let response = if self.down.load(Ordering::SeqCst) {
            HttpResponse::new(503, "maintenance")
        } else {
            HttpResponse::ok_json("{\"aqi\":42}")
        };
        Box::pin(async move { Ok::<_, HttpError>(response) })
    }
}

fn decode_aqi(response: &HttpResponse) -> Result<u32, FetchError> {
    let value: serde_json::Value = serde_json::from_str(&response.body)
        .map_err(|error| FetchError::provider(error.to_string()))?;
    value["aqi"]
        .as_u64()
        .map(|aqi| aqi as u32)
        .ok_or_else(|| FetchError::provider("missing aqi"))
}

// =============================================================================
// Geo Bucketing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_nearby_points_are_requested_system_calls_provider_once_per_cell() {
    // Given: A 0.5 degree grid with a one hour TTL
    let calls = Arc::new(AtomicU32::new(0));
    let cache = counting_cache(0.5, Arc::clone(&calls), Arc::default());
    let context = FetchContext::new();

    // When: Two points in the same cell are requested
    cache.get(&context, 52.370, 4.895).await.expect("fetch");
    cache.get(&context, 52.400, 4.850).await.expect("cached");

    // Then: Only one provider call was made
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // When: A point in a neighbouring cell is requested
    cache.get(&context, 53.0, 5.0).await.expect("fetch");

    // Then: A second provider call is made
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn when_many_callers_race_for_one_cell_system_fetches_once() {
    // Given: A cold cache and a slow provider
    let calls = Arc::new(AtomicU32::new(0));
    let cache = counting_cache(0.5, Arc::clone(&calls), Arc::default());

    // When: Ten callers request points of the same cell concurrently
    let mut callers = JoinSet::new();
    for i in 0..10 {
        let cache = cache.clone();
        callers.spawn(async move {
            cache
                .get(&FetchContext::new(), 52.30 + f64::from(i) * 0.01, 4.60)
                .await
        });
    }
    let mut values = Vec::new();
    while let Some(joined) = callers.join_next().await {
        values.push(joined.expect("task").expect("value"));
    }

    // Then: Every caller sees the single fetched value
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(values.iter().all(|value| *value == 1));
}

#[tokio::test]
async fn when_one_cell_is_slow_system_still_serves_other_cells() {
    // Given: A provider that blocks for the southern cell until released
    let gate = Arc::new(tokio::sync::Notify::new());
    let provider_gate = Arc::clone(&gate);
    let provider = FnPointProvider::new("weather", move |_, coordinates: Coordinates| {
        let gate = Arc::clone(&provider_gate);
        async move {
            if coordinates.latitude() < 10.0 {
                gate.notified().await;
            }
            Ok::<_, FetchError>(coordinates.latitude() as u32)
        }
    });
    let cache = FetchThroughCache::new(Arc::new(provider), config(1.0)).expect("valid config");

    // When: The blocked cell is in flight and another cell is requested
    let blocked = tokio::spawn({
        let cache = cache.clone();
        async move { cache.get(&FetchContext::new(), 5.5, 5.5).await }
    });
    tokio::task::yield_now().await;
    let other = tokio::time::timeout(
        Duration::from_secs(1),
        cache.get(&FetchContext::new(), 40.5, 5.5),
    )
    .await;

    // Then: The other cell is not held up by the blocked one
    assert_eq!(other.expect("not blocked"), Ok(40));
    gate.notify_one();
    assert_eq!(blocked.await.expect("task"), Ok(5));
}

#[tokio::test]
async fn when_coordinates_are_out_of_range_system_rejects_them_before_fetching() {
    // Given: A cache
    let calls = Arc::new(AtomicU32::new(0));
    let cache = counting_cache(0.1, Arc::clone(&calls), Arc::default());

    // When: A caller passes an invalid longitude
    let result = cache.get(&FetchContext::new(), 10.0, 181.0).await;

    // Then: The request is rejected without a provider call
    assert_eq!(
        result,
        Err(FetchError::InvalidCoordinates {
            latitude: 10.0,
            longitude: 181.0,
        })
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Freshness and Stale-If-Error
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_provider_fails_within_stale_window_system_serves_stale_value() {
    // Given: An entry that expired two hours ago
    let calls = Arc::new(AtomicU32::new(0));
    let failing = Arc::new(AtomicBool::new(false));
    let cache = counting_cache(0.1, Arc::clone(&calls), Arc::clone(&failing));
    let context = FetchContext::new();
    cache.get(&context, 48.85, 2.35).await.expect("fetch");
    tokio::time::advance(3 * HOUR).await;

    // When: The provider is down
    failing.store(true, Ordering::SeqCst);
    let value = cache.get(&context, 48.85, 2.35).await;

    // Then: The stale value is returned without an error
    assert_eq!(value, Ok(1));
    assert_eq!(calls.load(Ordering::SeqCst), 2, "a refresh was attempted");
}

#[tokio::test(start_paused = true)]
async fn when_provider_fails_past_stale_window_system_reports_unavailable() {
    // Given: An entry older than the stale window
    let failing = Arc::new(AtomicBool::new(false));
    let cache = counting_cache(0.1, Arc::default(), Arc::clone(&failing));
    let context = FetchContext::new();
    cache.get(&context, 48.85, 2.35).await.expect("fetch");
    tokio::time::advance(7 * HOUR).await;

    // When: The provider is down
    failing.store(true, Ordering::SeqCst);
    let result = cache.get(&context, 48.85, 2.35).await;

    // Then: The caller gets an explicit unavailable error
    assert!(matches!(
        result,
        Err(FetchError::ProviderUnavailable { ref provider, .. }) if provider == "air_quality"
    ));
}

#[tokio::test(start_paused = true)]
async fn when_cache_is_invalidated_system_fetches_again_exactly_once() {
    // Given: A warm cache
    let calls = Arc::new(AtomicU32::new(0));
    let cache = counting_cache(0.1, Arc::clone(&calls), Arc::default());
    let context = FetchContext::new();
    cache.get(&context, 40.71, -74.0).await.expect("fetch");

    // When: Everything is invalidated and the key is requested twice
    cache.invalidate_all().await;
    cache.get(&context, 40.71, -74.0).await.expect("refetch");
    cache.get(&context, 40.71, -74.0).await.expect("cached");

    // Then: Exactly one new provider call was made
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn when_stats_are_requested_system_reports_fresh_and_total_entries() {
    // Given: One expired and one fresh entry
    let cache = counting_cache(0.1, Arc::default(), Arc::default());
    let context = FetchContext::new();
    cache.get(&context, 10.0, 10.0).await.expect("fetch");
    tokio::time::advance(2 * HOUR).await;
    cache.get(&context, 20.0, 20.0).await.expect("fetch");

    // When: Stats are read
    let stats = cache.stats().await;

    // Then: Both entries are counted but only one is fresh
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.fresh_entries, 1);
    assert_eq!(stats.provider, "air_quality");
}

#[tokio::test(start_paused = true)]
async fn when_refresh_mode_is_used_system_bypasses_fresh_entries() {
    // Given: A fresh entry
    let calls = Arc::new(AtomicU32::new(0));
    let cache = counting_cache(0.1, Arc::clone(&calls), Arc::default());
    let context = FetchContext::new();
    cache.get(&context, 10.0, 10.0).await.expect("fetch");

    // When: The same key is fetched in refresh mode
    let refreshed = cache
        .get_with_mode(&context, 10.0, 10.0, CacheMode::Refresh)
        .await;

    // Then: The provider was called again and the new value is cached
    assert_eq!(refreshed, Ok(2));
    assert_eq!(cache.get(&context, 10.0, 10.0).await, Ok(2));
}

// =============================================================================
// End-to-End Through the Resilient Client
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_http_provider_goes_down_system_serves_stale_and_records_failure() {
    // Given: An HTTP-backed cache registered with a health registry
    let registry = Arc::new(HealthRegistry::new());
    let client = Arc::new(
        ResilientClient::new(
            "air_quality",
            ResilienceConfig {
                retry: RetryPolicy::fixed(Duration::from_millis(10), 2),
                ..ResilienceConfig::default()
            },
        )
        .expect("valid config")
        .with_registry(Arc::clone(&registry)),
    );
    let transport = Arc::new(SwitchableTransport {
        down: AtomicBool::new(false),
        requests: AtomicU32::new(0),
    });
    let provider = HttpPointProvider::new(
        client,
        transport.clone(),
        "https://air.example.test/v1/current",
        decode_aqi,
    );
    let cache = FetchThroughCache::new(Arc::new(provider), config(0.1)).expect("valid config");
    let context = FetchContext::new();
    assert_eq!(cache.get(&context, 51.5, -0.12).await, Ok(42));

    // When: The entry expires and the provider answers 503
    tokio::time::advance(2 * HOUR).await;
    transport.down.store(true, Ordering::SeqCst);
    let value = cache.get(&context, 51.5, -0.12).await;

    // Then: The stale reading is served, the retries happened and the failure is visible
    assert_eq!(value, Ok(42));
    assert_eq!(transport.requests.load(Ordering::SeqCst), 3);
    let health = registry.get_health("air_quality").expect("registered");
    assert!(health.last_failure.is_some());
    assert!(health.last_success.is_some());
}
