//! # AZ Finance Service Worker
//!
//! Offline cache engine for the AZ Finance investment dashboard.
//!
//! ## Features
//!
//! - **Cache versioning**: `{prefix}-static-v{version}` and `{prefix}-assets-v{version}` partitions
//! - **Lifecycle**: install (shell pre-cache), activate (stale-cache cleanup, client claim)
//! - **Fetch routing**: API pass-through, stale-while-revalidate for assets, cache-first for navigations
//! - **Offline fallback**: cached application shell, or a synthetic 503 "Offline" response
//!
//! ## Architecture
//!
//! ```text
//! WorkerEvent {Install, Activate, Fetch(request)}
//!     │
//!     └── ServiceWorkerEngine
//!             ├── CacheConfig (version registry, classifier)
//!             ├── CacheStorage
//!             │       ├── az-finance-static-v{version}
//!             │       └── az-finance-assets-v{version}
//!             ├── Registration (worker lifecycle)
//!             └── Clients (controlled pages)
//! ```
//!
//! The host dispatches lifecycle and fetch events through
//! [`ServiceWorkerEngine::handle_event`] and must await the returned
//! outcome, including any [`RevalidationFuture`] a fetch outcome
//! carries, before considering the event handled.

use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::future::BoxFuture;
use hashbrown::HashMap;
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};
use url::Url;

// ==================== Errors ====================

/// Errors that can occur in worker operations.
#[derive(Error, Debug, Clone)]
pub enum SwError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid state: {0}")]
    State(String),
}

// ==================== Configuration ====================

/// Cache version registry and request classifier.
///
/// A pure value object constructed once at worker startup and passed
/// into every handler. Changing [`CacheConfig::version`] and
/// redeploying is the only supported cache-invalidation mechanism;
/// there is no runtime bust API.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Origin the worker is scoped to.
    pub origin: Url,

    /// Cache namespace prefix, e.g. `az-finance`.
    pub prefix: String,

    /// Deployed build version embedded in cache names.
    pub version: String,

    /// Paths pre-cached into the static partition at install.
    pub precache_manifest: Vec<String>,

    /// Path prefix for backend API requests, never cached.
    pub api_prefix: String,

    /// File extensions served with the stale-while-revalidate strategy.
    pub asset_extensions: Vec<String>,

    /// Application shell path served for offline navigations.
    pub shell_path: String,
}

impl CacheConfig {
    /// Create a configuration for the given origin and build version,
    /// with the dashboard's deployed defaults for everything else.
    pub fn new(origin: Url, version: impl Into<String>) -> Self {
        Self {
            origin,
            prefix: "az-finance".to_string(),
            version: version.into(),
            precache_manifest: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
                "/icons/icon-192.png".to_string(),
                "/icons/icon-512.png".to_string(),
            ],
            api_prefix: "/api/".to_string(),
            asset_extensions: [
                "js", "css", "woff", "woff2", "ttf", "png", "jpg", "jpeg", "gif", "svg", "ico",
                "webp",
            ]
            .iter()
            .map(|e| e.to_string())
            .collect(),
            shell_path: "/index.html".to_string(),
        }
    }

    /// Replace the pre-cache manifest.
    pub fn with_precache_manifest(mut self, manifest: Vec<String>) -> Self {
        self.precache_manifest = manifest;
        self
    }

    /// Replace the cache namespace prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Name of the static (application shell) cache partition.
    pub fn static_cache_name(&self) -> String {
        format!("{}-static-v{}", self.prefix, self.version)
    }

    /// Name of the opportunistically updated assets cache partition.
    pub fn assets_cache_name(&self) -> String {
        format!("{}-assets-v{}", self.prefix, self.version)
    }

    /// Prefix identifying cache partitions owned by this application.
    pub fn owned_cache_prefix(&self) -> String {
        format!("{}-", self.prefix)
    }

    /// Absolute URL of the application shell.
    pub fn shell_url(&self) -> Result<Url, SwError> {
        self.resource_url(&self.shell_path)
    }

    /// Resolve a site-relative path against the configured origin.
    pub fn resource_url(&self, path: &str) -> Result<Url, SwError> {
        self.origin
            .join(path)
            .map_err(|e| SwError::InvalidUrl(format!("{path}: {e}")))
    }

    /// Classify a request by URL shape.
    ///
    /// Total over all requests. The API prefix check runs before the
    /// extension check so a path matching both is always `Api`.
    pub fn classify(&self, request: &SwRequest) -> RequestClass {
        let path = request.url.path();
        if path.starts_with(&self.api_prefix) {
            RequestClass::Api
        } else if self.is_asset_path(path) {
            RequestClass::Asset
        } else {
            RequestClass::Other
        }
    }

    fn is_asset_path(&self, path: &str) -> bool {
        match path.rsplit_once('.') {
            Some((_, ext)) => self
                .asset_extensions
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }
}

/// Request classification driving strategy dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Backend API call; always goes to the network.
    Api,
    /// Versioned build artifact; stale-while-revalidate.
    Asset,
    /// Navigation or anything else; cache-first with offline fallback.
    Other,
}

// ==================== Requests & Responses ====================

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct SwRequest {
    /// Request URL.
    pub url: Url,

    /// Request method.
    pub method: Method,

    /// Client that issued the request, if known.
    pub client_id: Option<String>,

    /// Whether the browser is loading a new top-level document.
    pub is_navigation: bool,
}

impl SwRequest {
    /// Create a subresource GET request.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            client_id: None,
            is_navigation: false,
        }
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self {
            is_navigation: true,
            ..Self::get(url)
        }
    }

    /// Create a request with an explicit method.
    pub fn with_method(url: Url, method: Method) -> Self {
        Self {
            method,
            ..Self::get(url)
        }
    }

    /// Attach the issuing client's id.
    pub fn from_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// A response delivered to the page.
#[derive(Debug, Clone)]
pub struct SwResponse {
    /// Status code.
    pub status: StatusCode,

    /// Reason phrase.
    pub status_text: String,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Bytes,

    /// Whether this response was served from a cache partition.
    pub from_cache: bool,
}

impl SwResponse {
    /// Create a 200 OK response.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::with_status(StatusCode::OK, body)
    }

    /// Create a response with an explicit status.
    pub fn with_status(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers: HashMap::new(),
            body: body.into(),
            from_cache: false,
        }
    }

    /// The synthetic response returned when neither cache nor network
    /// can satisfy a request.
    pub fn offline() -> Self {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            status_text: "Service Unavailable".to_string(),
            headers,
            body: Bytes::from_static(b"Offline"),
            from_cache: false,
        }
    }

    /// Rehydrate a response from a stored cache entry.
    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            status: StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK),
            status_text: StatusCode::from_u16(entry.status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("")
                .to_string(),
            headers: entry.headers.clone(),
            body: Bytes::from(entry.body.clone()),
            from_cache: true,
        }
    }

    /// Set a header, replacing any prior value.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

// ==================== Network ====================

/// Network primitive the worker fetches through.
///
/// The engine only inspects success/failure and the status code;
/// everything else is passed along untouched. One attempt per request:
/// retry policy belongs to the caller, not this layer.
pub trait NetworkFetch: Send + Sync {
    fn fetch(&self, request: SwRequest) -> BoxFuture<'static, Result<SwResponse, SwError>>;
}

/// Pending background cache write handed back to the host.
///
/// The host keeps the worker alive until it settles, mirroring the
/// extendable-event contract. Dropping it abandons the write.
pub type RevalidationFuture = BoxFuture<'static, ()>;

// ==================== Cache ====================

/// A stored request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Stored-at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for storage under the given URL.
    pub fn from_response(url: &str, response: &SwResponse) -> Self {
        Self {
            url: url.to_string(),
            method: Method::GET.to_string(),
            status: response.status.as_u16(),
            headers: response.headers.clone(),
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }
}

/// A named cache partition.
#[derive(Debug, Default)]
pub struct Cache {
    /// Partition name.
    pub name: String,

    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create an empty partition.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Look up an entry by request identity.
    pub fn match_key(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, overwriting any prior value for the key.
    pub fn put(&mut self, key: &str, entry: CacheEntry) {
        self.entries.insert(key.to_string(), entry);
    }

    /// Delete an entry.
    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All stored keys.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the partition is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// Named cache partitions.
///
/// Storage outlives any single worker version; a new deployment sees
/// its predecessor's partitions until activation deletes them.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a partition, creating it if absent.
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a partition without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Whether a partition exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a partition.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Names of all partitions.
    pub fn cache_names(&self) -> Vec<String> {
        self.caches.keys().cloned().collect()
    }

    /// Look up a request identity across every partition.
    pub fn match_any(&self, key: &str) -> Option<&CacheEntry> {
        for cache in self.caches.values() {
            if let Some(entry) = cache.match_key(key) {
                return Some(entry);
            }
        }
        None
    }
}

// ==================== Worker Lifecycle ====================

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Initial state.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed, parked in the waiting slot.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and governing requests.
    Activated,
    /// Replaced by a newer version.
    Redundant,
}

/// One versioned worker instance tracked by the registration.
#[derive(Debug, Clone)]
pub struct WorkerVersion {
    /// Build version string.
    pub version: String,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl WorkerVersion {
    fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }
}

/// Tracks the installing, waiting, and active worker versions.
///
/// Install and activate are serialized by the host: activate never
/// begins until install has settled for a given version.
#[derive(Debug, Default)]
pub struct Registration {
    /// Worker currently installing.
    pub installing: Option<WorkerVersion>,

    /// Worker installed but not yet active.
    pub waiting: Option<WorkerVersion>,

    /// Worker governing requests.
    pub active: Option<WorkerVersion>,

    skip_waiting_requested: bool,
}

impl Registration {
    /// Start installing a new worker version.
    pub fn begin_install(&mut self, version: impl Into<String>) {
        let mut worker = WorkerVersion::new(version);
        worker.set_state(ServiceWorkerState::Installing);
        self.installing = Some(worker);
    }

    /// Park the installing worker in the waiting slot.
    pub fn install_complete(&mut self) {
        if let Some(mut worker) = self.installing.take() {
            worker.set_state(ServiceWorkerState::Installed);
            self.waiting = Some(worker);
        }
    }

    /// Request activation without waiting for old clients to close.
    pub fn request_skip_waiting(&mut self) {
        self.skip_waiting_requested = true;
    }

    /// Whether immediate activation has been requested.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting_requested
    }

    /// Promote the waiting worker to active.
    ///
    /// Returns the retired worker, marked redundant, so the host can
    /// notify its clients of the controller change.
    pub fn activate(&mut self) -> Option<WorkerVersion> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);

        let mut retired = self.active.take();
        if let Some(ref mut old) = retired {
            old.set_state(ServiceWorkerState::Redundant);
        }

        worker.set_state(ServiceWorkerState::Activated);
        self.active = Some(worker);
        self.skip_waiting_requested = false;
        retired
    }
}

// ==================== Clients ====================

/// A page open under the worker's scope.
#[derive(Debug, Clone)]
pub struct Client {
    /// Client id.
    pub id: String,

    /// Document URL.
    pub url: Url,

    /// Whether this worker governs the client's requests.
    pub controlled: bool,
}

impl Client {
    /// Create an uncontrolled client.
    pub fn new(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: id.into(),
            url,
            controlled: false,
        }
    }
}

/// Registry of open clients.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by id.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Track a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Stop tracking a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Take control of every open client without a reload.
    ///
    /// Returns the number of clients claimed.
    pub fn claim(&mut self) -> usize {
        for client in self.clients.values_mut() {
            client.controlled = true;
        }
        self.clients.len()
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no clients are tracked.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

// ==================== Events ====================

/// An event dispatched by the host.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// New worker version registered.
    Install,
    /// This version transitioned to active.
    Activate,
    /// A network request was intercepted.
    Fetch(SwRequest),
}

/// Result of handling a [`WorkerEvent`].
#[derive(Debug)]
pub enum EventOutcome {
    Install(InstallReport),
    Activate(ActivateReport),
    Fetch(FetchDecision),
}

/// What the worker decided to do with an intercepted request.
pub enum FetchDecision {
    /// Not intercepted; the host performs the request natively.
    Passthrough,
    /// Response produced by the worker.
    Respond {
        response: SwResponse,
        /// Background cache write the host must stay alive for.
        extend_until: Option<RevalidationFuture>,
    },
}

impl FetchDecision {
    fn respond(response: SwResponse) -> Self {
        Self::Respond {
            response,
            extend_until: None,
        }
    }

    /// Whether the host handles this request natively.
    pub fn is_passthrough(&self) -> bool {
        matches!(self, Self::Passthrough)
    }

    /// The response, if the worker produced one.
    pub fn response(&self) -> Option<&SwResponse> {
        match self {
            Self::Respond { response, .. } => Some(response),
            Self::Passthrough => None,
        }
    }

    /// Split into response and pending work, if the worker responded.
    pub fn into_parts(self) -> Option<(SwResponse, Option<RevalidationFuture>)> {
        match self {
            Self::Respond {
                response,
                extend_until,
            } => Some((response, extend_until)),
            Self::Passthrough => None,
        }
    }
}

impl fmt::Debug for FetchDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passthrough => f.write_str("Passthrough"),
            Self::Respond {
                response,
                extend_until,
            } => f
                .debug_struct("Respond")
                .field("response", response)
                .field("pending_revalidation", &extend_until.is_some())
                .finish(),
        }
    }
}

/// Outcome of the install phase.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    /// Manifest paths requested.
    pub requested: usize,

    /// Paths stored in the static cache.
    pub cached: usize,

    /// Paths that could not be pre-cached.
    pub failed: Vec<String>,
}

/// Outcome of the activate phase.
#[derive(Debug, Clone, Default)]
pub struct ActivateReport {
    /// Stale partitions deleted.
    pub deleted: Vec<String>,

    /// Partitions that could not be deleted.
    pub failed: Vec<String>,

    /// Clients claimed by the new worker.
    pub claimed_clients: usize,
}

// ==================== Engine ====================

/// The installable worker: intercepts requests, tiers cached content,
/// and resolves offline fallbacks.
pub struct ServiceWorkerEngine<N: NetworkFetch> {
    config: CacheConfig,
    network: Arc<N>,
    caches: Arc<RwLock<CacheStorage>>,
    registration: Arc<RwLock<Registration>>,
    clients: Arc<RwLock<Clients>>,
}

impl<N: NetworkFetch + 'static> ServiceWorkerEngine<N> {
    /// Create an engine with fresh cache storage.
    pub fn new(config: CacheConfig, network: N) -> Self {
        Self::with_storage(
            config,
            network,
            Arc::new(RwLock::new(CacheStorage::new())),
        )
    }

    /// Create an engine over existing cache storage.
    ///
    /// Storage persists across worker versions; a version bump engine
    /// is handed its predecessor's partitions and cleans them up at
    /// activation.
    pub fn with_storage(
        config: CacheConfig,
        network: N,
        caches: Arc<RwLock<CacheStorage>>,
    ) -> Self {
        Self {
            config,
            network: Arc::new(network),
            caches,
            registration: Arc::new(RwLock::new(Registration::default())),
            clients: Arc::new(RwLock::new(Clients::new())),
        }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Shared cache storage.
    pub fn caches(&self) -> Arc<RwLock<CacheStorage>> {
        Arc::clone(&self.caches)
    }

    /// Shared worker registration.
    pub fn registration(&self) -> Arc<RwLock<Registration>> {
        Arc::clone(&self.registration)
    }

    /// Shared client registry.
    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        Arc::clone(&self.clients)
    }

    /// Dispatch one host event.
    pub async fn handle_event(&self, event: WorkerEvent) -> Result<EventOutcome, SwError> {
        match event {
            WorkerEvent::Install => Ok(EventOutcome::Install(self.handle_install().await)),
            WorkerEvent::Activate => Ok(EventOutcome::Activate(self.handle_activate().await)),
            WorkerEvent::Fetch(request) => {
                Ok(EventOutcome::Fetch(self.handle_fetch(request).await?))
            }
        }
    }

    /// Install phase: pre-cache the application shell.
    ///
    /// Individual failures are swallowed; a degraded static cache is
    /// acceptable, a failed install is not. Requests immediate
    /// activation eligibility on completion.
    pub async fn handle_install(&self) -> InstallReport {
        let static_name = self.config.static_cache_name();

        self.registration
            .write()
            .await
            .begin_install(self.config.version.clone());

        // The partition must exist even if every fetch fails.
        self.caches.write().await.open(&static_name);

        let mut report = InstallReport {
            requested: self.config.precache_manifest.len(),
            ..Default::default()
        };
        for path in &self.config.precache_manifest {
            match self.precache(&static_name, path).await {
                Ok(()) => report.cached += 1,
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to pre-cache resource");
                    report.failed.push(path.clone());
                }
            }
        }

        {
            let mut registration = self.registration.write().await;
            registration.install_complete();
            registration.request_skip_waiting();
        }

        info!(
            cache = %static_name,
            requested = report.requested,
            cached = report.cached,
            "Install finished"
        );
        report
    }

    async fn precache(&self, cache_name: &str, path: &str) -> Result<(), SwError> {
        let url = self.config.resource_url(path)?;
        let request = SwRequest::get(url);
        let key = request.url.as_str().to_string();

        let response = self.network.fetch(request).await?;
        if !response.status.is_success() {
            return Err(SwError::Cache(format!(
                "unexpected status {} for {path}",
                response.status
            )));
        }

        let entry = CacheEntry::from_response(&key, &response);
        self.caches.write().await.open(cache_name).put(&key, entry);
        Ok(())
    }

    /// Activate phase: delete cache partitions from prior versions and
    /// claim all open clients.
    ///
    /// Deletions are fault-isolated per partition; one failure never
    /// aborts the rest of the cleanup.
    pub async fn handle_activate(&self) -> ActivateReport {
        if let Some(retired) = self.registration.write().await.activate() {
            debug!(version = %retired.version, "Previous worker is now redundant");
        }

        let expected = [
            self.config.static_cache_name(),
            self.config.assets_cache_name(),
        ];
        let owned = self.config.owned_cache_prefix();

        let mut report = ActivateReport::default();
        {
            let mut caches = self.caches.write().await;
            let stale: Vec<String> = caches
                .cache_names()
                .into_iter()
                .filter(|name| name.starts_with(&owned) && !expected.contains(name))
                .collect();
            for name in stale {
                if caches.delete(&name) {
                    debug!(cache = %name, "Deleted stale cache");
                    report.deleted.push(name);
                } else {
                    warn!(cache = %name, "Failed to delete stale cache");
                    report.failed.push(name);
                }
            }
        }

        report.claimed_clients = self.clients.write().await.claim();

        info!(
            deleted = report.deleted.len(),
            claimed = report.claimed_clients,
            version = %self.config.version,
            "Activate finished"
        );
        report
    }

    /// Route one intercepted request.
    ///
    /// Non-GET requests are never intercepted. Errors surface only for
    /// API requests and uncached assets; navigations and other requests
    /// always resolve to a response.
    pub async fn handle_fetch(&self, request: SwRequest) -> Result<FetchDecision, SwError> {
        if request.method != Method::GET {
            trace!(method = %request.method, url = %request.url, "Passing through non-GET request");
            return Ok(FetchDecision::Passthrough);
        }

        match self.config.classify(&request) {
            RequestClass::Api => {
                trace!(url = %request.url, "API request goes to the network");
                let response = self.network.fetch(request).await?;
                Ok(FetchDecision::respond(response))
            }
            RequestClass::Asset => self.stale_while_revalidate(request).await,
            RequestClass::Other => Ok(self.cache_first(request).await),
        }
    }

    // ==================== Strategies ====================

    /// Serve an asset from the assets cache when possible, refreshing
    /// the cache from the network for next time.
    async fn stale_while_revalidate(
        &self,
        request: SwRequest,
    ) -> Result<FetchDecision, SwError> {
        let assets_name = self.config.assets_cache_name();
        let key = request.url.as_str().to_string();

        let cached = {
            let caches = self.caches.read().await;
            caches
                .get(&assets_name)
                .and_then(|cache| cache.match_key(&key))
                .cloned()
        };

        if let Some(entry) = cached {
            trace!(url = %key, "Serving asset from cache, revalidating in background");
            let revalidation = self.revalidate(assets_name, key, request);
            return Ok(FetchDecision::Respond {
                response: SwResponse::from_entry(&entry),
                extend_until: Some(revalidation),
            });
        }

        let response = self.network.fetch(request).await?;
        if response.status == StatusCode::OK {
            let entry = CacheEntry::from_response(&key, &response);
            self.caches.write().await.open(&assets_name).put(&key, entry);
            debug!(url = %key, "Asset cached on first fetch");
        }
        Ok(FetchDecision::respond(response))
    }

    /// The background half of stale-while-revalidate: refetch and, on a
    /// 200, overwrite the stored entry. Never surfaces failures.
    fn revalidate(
        &self,
        cache_name: String,
        key: String,
        request: SwRequest,
    ) -> RevalidationFuture {
        let network = Arc::clone(&self.network);
        let caches = Arc::clone(&self.caches);
        Box::pin(async move {
            match network.fetch(request).await {
                Ok(response) if response.status == StatusCode::OK => {
                    let entry = CacheEntry::from_response(&key, &response);
                    caches.write().await.open(&cache_name).put(&key, entry);
                    debug!(url = %key, "Asset revalidated");
                }
                Ok(response) => {
                    debug!(url = %key, status = %response.status, "Not caching non-200 revalidation");
                }
                Err(e) => {
                    debug!(url = %key, error = %e, "Asset revalidation failed");
                }
            }
        })
    }

    /// Serve navigations and unclassified requests from any cache
    /// partition, falling back to the network and then offline.
    async fn cache_first(&self, request: SwRequest) -> FetchDecision {
        let key = request.url.as_str().to_string();

        let cached = { self.caches.read().await.match_any(&key).cloned() };
        if let Some(entry) = cached {
            trace!(url = %key, "Serving from cache without network");
            return FetchDecision::respond(SwResponse::from_entry(&entry));
        }

        match self.network.fetch(request.clone()).await {
            Ok(response) => FetchDecision::respond(response),
            Err(e) => {
                debug!(url = %key, error = %e, "Network unavailable, resolving offline fallback");
                FetchDecision::respond(self.offline_fallback(&request).await)
            }
        }
    }

    // ==================== Offline Fallback ====================

    /// Resolve a response when network and cache both fail.
    ///
    /// Navigations get the cached application shell so client-side
    /// routing can take over; everything else gets a synthetic 503.
    async fn offline_fallback(&self, request: &SwRequest) -> SwResponse {
        if request.is_navigation {
            if let Ok(shell_url) = self.config.shell_url() {
                let cached = {
                    let caches = self.caches.read().await;
                    caches.match_any(shell_url.as_str()).cloned()
                };
                if let Some(entry) = cached {
                    debug!(url = %request.url, "Serving application shell for offline navigation");
                    return SwResponse::from_entry(&entry);
                }
            }
            warn!(url = %request.url, "Application shell not cached, returning offline response");
        }
        SwResponse::offline()
    }
}

// ==================== Helpers ====================

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
