//! Provider and feature-flag capabilities consumed by the caches and the scheduler.
//!
//! | Trait | Description |
//! |-------|-------------|
//! | [`PointProvider`] | Fetches a domain value for a coordinate pair |
//! | [`GlobalProvider`] | Fetches a domain value that is not point-indexed (e.g. transit) |
//! | [`FeatureFlags`] | Boolean flag lookup used to skip optional domains |
//!
//! Wire-format parsing stays with the caller: [`HttpPointProvider`] only builds the
//! request, runs it through a [`ResilientClient`] and hands the response to a decoder.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use crate::context::FetchContext;
use crate::error::FetchError;
use crate::geo::Coordinates;
use crate::http_client::{HttpAuth, HttpClient, HttpRequest, HttpResponse};
use crate::resilient_client::ResilientClient;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait PointProvider<T>: Send + Sync {
    fn name(&self) -> &str;

    fn fetch<'a>(
        &'a self,
        context: &'a FetchContext,
        coordinates: Coordinates,
    ) -> BoxFuture<'a, Result<T, FetchError>>;
}

pub trait GlobalProvider<T>: Send + Sync {
    fn name(&self) -> &str;

    fn fetch<'a>(&'a self, context: &'a FetchContext) -> BoxFuture<'a, Result<T, FetchError>>;
}

pub trait FeatureFlags: Send + Sync {
    fn is_enabled<'a>(&'a self, flag: &'a str, context: &'a FetchContext) -> BoxFuture<'a, bool>;
}

/// In-memory flag table. Unknown flags resolve to `default`.
#[derive(Debug, Default)]
pub struct StaticFeatureFlags {
    flags: RwLock<HashMap<String, bool>>,
    default: bool,
}

impl StaticFeatureFlags {
    pub fn new(default: bool) -> Self {
        Self {
            flags: RwLock::new(HashMap::new()),
            default,
        }
    }

    pub fn with_flag(self, flag: impl Into<String>, enabled: bool) -> Self {
        self.set(flag, enabled);
        self
    }

    pub fn set(&self, flag: impl Into<String>, enabled: bool) {
        self.flags
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(flag.into(), enabled);
    }

    pub fn get(&self, flag: &str) -> bool {
        self.flags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(flag)
            .copied()
            .unwrap_or(self.default)
    }
}

impl FeatureFlags for StaticFeatureFlags {
    fn is_enabled<'a>(&'a self, flag: &'a str, _context: &'a FetchContext) -> BoxFuture<'a, bool> {
        let enabled = self.get(flag);
        Box::pin(async move { enabled })
    }
}

/// Provider wrapper that short-circuits with [`FetchError::FeatureDisabled`] while its flag is off.
pub struct FeatureGated<P> {
    inner: P,
    flags: Arc<dyn FeatureFlags>,
    flag: String,
}

impl<P> FeatureGated<P> {
    pub fn new(inner: P, flags: Arc<dyn FeatureFlags>, flag: impl Into<String>) -> Self {
        Self {
            inner,
            flags,
            flag: flag.into(),
        }
    }

    pub fn flag(&self) -> &str {
        &self.flag
    }

    async fn ensure_enabled(&self, context: &FetchContext) -> Result<(), FetchError> {
        if self.flags.is_enabled(&self.flag, context).await {
            Ok(())
        } else {
            Err(FetchError::feature_disabled(self.flag.as_str()))
        }
    }
}

impl<T, P> PointProvider<T> for FeatureGated<P>
where
    P: PointProvider<T>,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn fetch<'a>(
        &'a self,
        context: &'a FetchContext,
        coordinates: Coordinates,
    ) -> BoxFuture<'a, Result<T, FetchError>> {
        Box::pin(async move {
            self.ensure_enabled(context).await?;
            self.inner.fetch(context, coordinates).await
        })
    }
}

impl<T, P> GlobalProvider<T> for FeatureGated<P>
where
    P: GlobalProvider<T>,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn fetch<'a>(&'a self, context: &'a FetchContext) -> BoxFuture<'a, Result<T, FetchError>> {
        Box::pin(async move {
            self.ensure_enabled(context).await?;
            self.inner.fetch(context).await
        })
    }
}

/// Point provider backed by a closure, handy for wiring and tests.
pub struct FnPointProvider<F> {
    name: String,
    fetch: F,
}

impl<F> FnPointProvider<F> {
    pub fn new<Fut>(name: impl Into<String>, fetch: F) -> Self
    where
        F: Fn(FetchContext, Coordinates) -> Fut,
    {
        Self {
            name: name.into(),
            fetch,
        }
    }
}

impl<T, F, Fut> PointProvider<T> for FnPointProvider<F>
where
    F: Fn(FetchContext, Coordinates) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch<'a>(
        &'a self,
        context: &'a FetchContext,
        coordinates: Coordinates,
    ) -> BoxFuture<'a, Result<T, FetchError>> {
        Box::pin((self.fetch)(context.clone(), coordinates))
    }
}

/// Turns a final provider response into a domain value.
pub type Decoder<T> = fn(&HttpResponse) -> Result<T, FetchError>;

/// Point provider issuing `GET {base_url}?lat=..&lon=..` through a resilient client.
pub struct HttpPointProvider<T> {
    client: Arc<ResilientClient>,
    http: Arc<dyn HttpClient>,
    base_url: String,
    auth: HttpAuth,
    decode: Decoder<T>,
    _value: PhantomData<fn() -> T>,
}

impl<T> HttpPointProvider<T> {
    pub fn new(
        client: Arc<ResilientClient>,
        http: Arc<dyn HttpClient>,
        base_url: impl Into<String>,
        decode: Decoder<T>,
    ) -> Self {
        Self {
            client,
            http,
            base_url: base_url.into(),
            auth: HttpAuth::None,
            decode,
            _value: PhantomData,
        }
    }

    pub fn with_auth(mut self, auth: HttpAuth) -> Self {
        self.auth = auth;
        self
    }

    fn request(&self, coordinates: Coordinates) -> HttpRequest {
        HttpRequest::get(self.base_url.as_str())
            .with_query("lat", coordinates.latitude())
            .with_query("lon", coordinates.longitude())
            .with_auth(&self.auth)
    }
}

impl<T> PointProvider<T> for HttpPointProvider<T>
where
    T: Send,
{
    fn name(&self) -> &str {
        self.client.name()
    }

    fn fetch<'a>(
        &'a self,
        context: &'a FetchContext,
        coordinates: Coordinates,
    ) -> BoxFuture<'a, Result<T, FetchError>> {
        Box::pin(async move {
            let response = self
                .client
                .send(context, self.http.as_ref(), self.request(coordinates))
                .await?
                .into_inner();

            if response.is_server_error() || response.status == 408 || response.status == 429 {
                return Err(FetchError::Server {
                    status: response.status,
                });
            }
            if !response.is_success() {
                return Err(FetchError::provider(format!(
                    "{} rejected request with status {}",
                    self.client.name(),
                    response.status
                )));
            }

            (self.decode)(&response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceConfig;
    use crate::http_client::StaticHttpClient;
    use crate::retry::RetryPolicy;

    fn coords() -> Coordinates {
        Coordinates::new(52.37, 4.895).expect("valid")
    }

    fn decode_len(response: &HttpResponse) -> Result<usize, FetchError> {
        Ok(response.body.len())
    }

    fn http_provider(response: HttpResponse) -> HttpPointProvider<usize> {
        let config = ResilienceConfig {
            retry: RetryPolicy::no_retry(),
            ..ResilienceConfig::default()
        };
        let client = Arc::new(ResilientClient::new("air_quality", config).expect("valid config"));
        HttpPointProvider::new(
            client,
            Arc::new(StaticHttpClient::new(response)),
            "https://api.example.test/air",
            decode_len,
        )
    }

    #[tokio::test]
    async fn static_flags_fall_back_to_default() {
        let flags = StaticFeatureFlags::new(false).with_flag("pollen", true);
        let context = FetchContext::new();

        assert!(flags.is_enabled("pollen", &context).await);
        assert!(!flags.is_enabled("unknown", &context).await);
    }

    #[tokio::test]
    async fn gated_provider_skips_upstream_when_flag_is_off() {
        let flags = Arc::new(StaticFeatureFlags::new(false));
        let gated = FeatureGated::new(
            FnPointProvider::new("pollen", |_, _| async { Ok::<u32, FetchError>(1) }),
            flags.clone(),
            "pollen_enabled",
        );
        let context = FetchContext::new();

        let disabled = PointProvider::fetch(&gated, &context, coords()).await;
        flags.set("pollen_enabled", true);
        let enabled = PointProvider::fetch(&gated, &context, coords()).await;

        assert_eq!(disabled, Err(FetchError::feature_disabled("pollen_enabled")));
        assert_eq!(enabled, Ok(1));
    }

    #[tokio::test]
    async fn http_provider_decodes_successful_response() {
        let provider = http_provider(HttpResponse::ok_json("{\"aqi\":3}"));

        let value = provider.fetch(&FetchContext::new(), coords()).await;

        assert_eq!(value, Ok(9));
        assert_eq!(PointProvider::<usize>::name(&provider), "air_quality");
    }

    #[tokio::test]
    async fn http_provider_maps_exhausted_server_error() {
        let provider = http_provider(HttpResponse::new(503, "down"));

        let value = provider.fetch(&FetchContext::new(), coords()).await;

        assert_eq!(value, Err(FetchError::Server { status: 503 }));
    }

    #[tokio::test]
    async fn http_provider_maps_client_error_to_provider_error() {
        let provider = http_provider(HttpResponse::new(401, "bad key"));

        let value = provider.fetch(&FetchContext::new(), coords()).await;

        assert!(matches!(value, Err(FetchError::Provider { .. })));
    }

    #[test]
    fn request_carries_coordinates_and_auth() {
        let provider = http_provider(HttpResponse::ok_json("{}")).with_auth(HttpAuth::QueryKey {
            name: String::from("appid"),
            value: String::from("k"),
        });

        assert_eq!(
            provider.request(coords()).full_url(),
            "https://api.example.test/air?lat=52.37&lon=4.895&appid=k"
        );
    }
}
