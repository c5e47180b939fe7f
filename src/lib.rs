use anyhow::{anyhow, Context, Result};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

pub mod normalize;
pub mod npm_name;
pub mod package_url;
pub mod query;

use normalize::{normalize, Decision, RawRequest, RequestContext};
use npm_name::{PackageNameValidator, RegistryNameRules};

// Constants
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_CONCURRENT_ORIGIN_FETCHES: usize = 10;
pub const MAX_CACHED_OBJECT_SIZE: usize = 2 * 1024 * 1024; // 2 MB

// Configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub origin: OriginConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub listen: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OriginConfig {
    base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    ttl: String,
    negative_ttl: String,
}

impl ServerConfig {
    pub fn new(port: u16, listen: Vec<String>) -> Self {
        Self { port, listen }
    }
}

impl OriginConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl CacheConfig {
    pub fn new(ttl: impl Into<String>, negative_ttl: impl Into<String>) -> Self {
        Self {
            ttl: ttl.into(),
            negative_ttl: negative_ttl.into(),
        }
    }
}

impl AppConfig {
    pub fn new(server: ServerConfig, origin: OriginConfig, cache: CacheConfig) -> Self {
        Self {
            server,
            origin,
            cache,
        }
    }
}

pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.server.port == 0 {
        return Err(anyhow!("Invalid port"));
    }
    if config.origin.base_url.is_empty() {
        return Err(anyhow!("Origin base URL required"));
    }
    if config.origin.base_url.ends_with('/') {
        return Err(anyhow!("Origin base URL must not end with a slash"));
    }
    humantime::parse_duration(&config.cache.ttl).context("invalid cache ttl")?;
    humantime::parse_duration(&config.cache.negative_ttl).context("invalid negative ttl")?;
    Ok(())
}

// Cached origin response
#[derive(Debug, Clone)]
pub struct CachedResponse {
    status_code: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    expires_at: u64, // unix seconds
}

// Health status
#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    cache_entries: usize,
    inflight: usize,
}

// Server state
pub struct PackageServer {
    config: AppConfig,
    validator: Arc<dyn PackageNameValidator>,
    http_client: reqwest::Client,
    cache: DashMap<String, CachedResponse>,
    inflight: DashMap<String, watch::Receiver<Option<CachedResponse>>>,
    origin_sem: Arc<Semaphore>, // bounds parallel fetches against the origin
    ttl: Duration,
    negative_ttl: Duration,
}

impl PackageServer {
    pub fn new(config: AppConfig) -> Result<Arc<Self>> {
        validate_config(&config)?;

        let ttl = humantime::parse_duration(&config.cache.ttl)?;
        let negative_ttl = humantime::parse_duration(&config.cache.negative_ttl)?;

        let http_client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Arc::new(Self {
            config,
            validator: Arc::new(RegistryNameRules),
            http_client,
            cache: DashMap::new(),
            inflight: DashMap::new(),
            origin_sem: Arc::new(Semaphore::new(MAX_CONCURRENT_ORIGIN_FETCHES)),
            ttl,
            negative_ttl,
        }))
    }

    /// Entry point for every content request: normalize the URL, then
    /// redirect, reject, or relay from the origin.
    pub async fn handle_request(
        State(server): State<Arc<PackageServer>>,
        req: Request,
    ) -> Result<Response, StatusCode> {
        if req.method() != axum::http::Method::GET {
            return Err(StatusCode::METHOD_NOT_ALLOWED);
        }

        let path = req.uri().path().to_string();
        let raw_query = req.uri().query().unwrap_or("");
        let raw = RawRequest::new(path, raw_query);

        match normalize(&raw, server.validator.as_ref()) {
            Decision::Redirect(location) => Ok(redirect_response(&location)),
            Decision::Reject(status, body) => Ok(reject_response(status, body)),
            Decision::Forward(ctx) => server.serve_content(&raw.path, &ctx).await,
        }
    }

    /// The content stage: relay the canonical URL from the origin, with an
    /// in-memory cache and single-flight coalescing keyed by it. The
    /// normalizer has already bounded the key space.
    async fn serve_content(
        &self,
        path: &str,
        ctx: &RequestContext,
    ) -> Result<Response, StatusCode> {
        let cache_key = format!("{}{}", path, ctx.search);

        if let Some(cached) = self.get_cached(&cache_key) {
            return Ok(self.write_response(cached, "HIT"));
        }

        // Single-flight
        let (mut rx, is_leader, tx_opt) = match self.inflight.entry(cache_key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(e) => (e.get().clone(), false, None),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let (tx, rx) = watch::channel(None);
                e.insert(rx.clone());
                (rx, true, Some(tx))
            }
        };

        // Follower path
        if !is_leader {
            match rx.wait_for(|val| val.is_some()).await {
                Ok(guard) => {
                    if let Some(cached) = guard.as_ref() {
                        return Ok(self.write_response(cached.clone(), "COALESCED"));
                    }
                }
                Err(_) => {
                    // Leader dropped the channel without publishing
                    return Err(StatusCode::BAD_GATEWAY);
                }
            }
            return Err(StatusCode::BAD_GATEWAY);
        }

        // Leader path
        let tx = tx_opt.unwrap();
        let result = self.fetch_from_origin(&cache_key, ctx).await;

        if let Ok(ref cached) = result {
            let _ = tx.send(Some(cached.clone()));
        }
        self.inflight.remove(&cache_key);

        match result {
            Ok(cached) => Ok(self.write_response(cached, "MISS")),
            Err(e) => {
                warn!("origin fetch failed for {}: {:?}", ctx.package_spec, e);
                Err(StatusCode::BAD_GATEWAY)
            }
        }
    }

    fn get_cached(&self, key: &str) -> Option<CachedResponse> {
        let now = unix_now();
        let expired = match self.cache.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.value().clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.cache.remove_if(key, |_, v| v.expires_at <= now);
        }
        None
    }

    async fn fetch_from_origin(
        &self,
        cache_key: &str,
        ctx: &RequestContext,
    ) -> Result<CachedResponse> {
        let _permit = self.origin_sem.clone().acquire_owned().await?;

        debug!("fetching {} from origin", ctx.package_spec);

        let url = format!("{}{}", self.config.origin.base_url, cache_key);
        let resp = self.http_client.get(&url).send().await?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect::<HashMap<_, _>>();
        let body = resp.bytes().await?.to_vec();

        // Errors get a short TTL so a flapping origin is shielded without
        // pinning failures in the cache.
        let ttl = if status < 400 { self.ttl } else { self.negative_ttl };
        let expires_at = (SystemTime::now() + ttl)
            .duration_since(UNIX_EPOCH)?
            .as_secs();

        let cached = CachedResponse {
            status_code: status,
            headers,
            body,
            expires_at,
        };

        if cached.body.len() <= MAX_CACHED_OBJECT_SIZE {
            self.cache.insert(cache_key.to_string(), cached.clone());
        }

        Ok(cached)
    }

    fn write_response(&self, cached: CachedResponse, tier: &str) -> Response {
        let mut builder = Response::builder()
            .status(cached.status_code)
            .header("X-Cache", tier);

        for (k, v) in cached.headers {
            builder = builder.header(k, v);
        }

        builder.body(Body::from(cached.body)).unwrap()
    }

    pub async fn handle_health(State(server): State<Arc<PackageServer>>) -> impl IntoResponse {
        let status = HealthStatus {
            status: "healthy".to_string(),
            cache_entries: server.cache.len(),
            inflight: server.inflight.len(),
        };

        let body = serde_json::to_vec(&status).unwrap_or_else(|_| b"{}".to_vec());

        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

fn redirect_response(location: &str) -> Response {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .body(Body::empty())
        .unwrap()
}

fn reject_response(status: StatusCode, body: String) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body))
        .unwrap()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
