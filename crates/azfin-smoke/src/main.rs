//! AZ Finance offline smoke harness.
//!
//! Drives the service worker engine through a scripted install →
//! activate → fetch sequence against an in-memory copy of the dashboard
//! site, flips the network offline halfway through, and prints a JSON
//! summary of every step. Exits non-zero if any step behaves
//! unexpectedly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use azfin_common::{init_logging, LogConfig};
use azfin_sw::{
    CacheConfig, EventOutcome, FetchDecision, NetworkFetch, ServiceWorkerEngine, SwError,
    SwRequest, SwResponse, WorkerEvent,
};
use futures::future::BoxFuture;
use http::StatusCode;
use serde_json::json;
use tracing::{info, Level};
use url::Url;

const ORIGIN: &str = "https://app.az-finance.example";

/// In-memory stand-in for the deployed dashboard site and its API.
struct SiteInner {
    pages: Mutex<HashMap<String, (String, String)>>,
    online: AtomicBool,
    fetches: AtomicUsize,
}

#[derive(Clone)]
struct DemoSite {
    inner: Arc<SiteInner>,
}

impl DemoSite {
    fn new() -> Self {
        let mut pages = HashMap::new();
        let shell = "<html><div id=\"app\"></div></html>".to_string();
        for path in ["/", "/index.html"] {
            pages.insert(path.to_string(), ("text/html".to_string(), shell.clone()));
        }
        pages.insert(
            "/manifest.json".to_string(),
            (
                "application/json".to_string(),
                "{\"name\":\"AZ Finance\",\"lang\":\"ar\"}".to_string(),
            ),
        );
        pages.insert(
            "/icons/icon-192.png".to_string(),
            ("image/png".to_string(), "png-192".to_string()),
        );
        pages.insert(
            "/icons/icon-512.png".to_string(),
            ("image/png".to_string(), "png-512".to_string()),
        );
        pages.insert(
            "/assets/app.js".to_string(),
            (
                "text/javascript".to_string(),
                "console.log('dashboard')".to_string(),
            ),
        );
        pages.insert(
            "/assets/styles.css".to_string(),
            ("text/css".to_string(), "body{direction:rtl}".to_string()),
        );
        pages.insert(
            "/api/portfolio/summary".to_string(),
            (
                "application/json".to_string(),
                "{\"total\":125000,\"roi\":0.124}".to_string(),
            ),
        );

        Self {
            inner: Arc::new(SiteInner {
                pages: Mutex::new(pages),
                online: AtomicBool::new(true),
                fetches: AtomicUsize::new(0),
            }),
        }
    }

    fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    fn fetches(&self) -> usize {
        self.inner.fetches.load(Ordering::SeqCst)
    }
}

impl NetworkFetch for DemoSite {
    fn fetch(&self, request: SwRequest) -> BoxFuture<'static, Result<SwResponse, SwError>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            inner.fetches.fetch_add(1, Ordering::SeqCst);
            if !inner.online.load(Ordering::SeqCst) {
                return Err(SwError::Network("offline".to_string()));
            }
            let page = {
                let pages = inner.pages.lock().unwrap();
                pages.get(request.url.path()).cloned()
            };
            match page {
                Some((content_type, body)) => {
                    Ok(SwResponse::ok(body).header("content-type", content_type))
                }
                None => Ok(SwResponse::with_status(StatusCode::NOT_FOUND, "not found")),
            }
        })
    }
}

/// Parse command line arguments.
struct Args {
    quiet: bool,
    verbose: bool,
}

impl Args {
    fn parse() -> Self {
        let mut quiet = false;
        let mut verbose = false;
        for arg in std::env::args().skip(1) {
            match arg.as_str() {
                "--quiet" | "-q" => quiet = true,
                "--verbose" | "-v" => verbose = true,
                other => {
                    eprintln!("unknown argument: {other}");
                    eprintln!("usage: azfin-smoke [--quiet] [--verbose]");
                    std::process::exit(2);
                }
            }
        }
        Self { quiet, verbose }
    }
}

struct StepLog {
    steps: Vec<serde_json::Value>,
    failures: usize,
}

impl StepLog {
    fn new() -> Self {
        Self {
            steps: Vec::new(),
            failures: 0,
        }
    }

    fn record(&mut self, name: &str, ok: bool, detail: serde_json::Value) {
        if !ok {
            self.failures += 1;
        }
        self.steps.push(json!({
            "step": name,
            "ok": ok,
            "detail": detail,
        }));
    }
}

async fn run_fetch(
    engine: &ServiceWorkerEngine<DemoSite>,
    log: &mut StepLog,
    name: &str,
    request: SwRequest,
    expect_status: StatusCode,
    expect_from_cache: bool,
) {
    let started = Instant::now();
    match engine.handle_fetch(request).await {
        Ok(FetchDecision::Respond {
            response,
            extend_until,
        }) => {
            let revalidated = extend_until.is_some();
            if let Some(pending) = extend_until {
                pending.await;
            }
            let ok = response.status == expect_status && response.from_cache == expect_from_cache;
            log.record(
                name,
                ok,
                json!({
                    "status": response.status.as_u16(),
                    "from_cache": response.from_cache,
                    "revalidated": revalidated,
                    "elapsed_us": started.elapsed().as_micros() as u64,
                }),
            );
        }
        Ok(FetchDecision::Passthrough) => {
            log.record(name, false, json!({ "passthrough": true }));
        }
        Err(e) => {
            log.record(name, false, json!({ "error": e.to_string() }));
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), SwError> {
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else if args.quiet {
        Level::WARN
    } else {
        Level::INFO
    };
    init_logging(LogConfig {
        level,
        ..Default::default()
    });

    let origin = Url::parse(ORIGIN).map_err(|e| SwError::InvalidUrl(e.to_string()))?;
    let config = CacheConfig::new(origin, env!("CARGO_PKG_VERSION"));
    let site = DemoSite::new();
    let engine = ServiceWorkerEngine::new(config, site.clone());
    let mut log = StepLog::new();

    let page = |path: &str| -> Result<Url, SwError> { engine.config().resource_url(path) };

    // Lifecycle: install pre-caches the shell, activate claims clients
    // and cleans up prior versions.
    match engine.handle_event(WorkerEvent::Install).await? {
        EventOutcome::Install(report) => {
            let ok = report.failed.is_empty() && report.cached == report.requested;
            log.record(
                "install",
                ok,
                json!({ "requested": report.requested, "cached": report.cached }),
            );
        }
        other => info!(?other, "unexpected install outcome"),
    }
    match engine.handle_event(WorkerEvent::Activate).await? {
        EventOutcome::Activate(report) => {
            log.record(
                "activate",
                report.failed.is_empty(),
                json!({ "deleted": report.deleted, "claimed": report.claimed_clients }),
            );
        }
        other => info!(?other, "unexpected activate outcome"),
    }

    // Online: shell navigation is already cached, assets warm up the
    // assets partition, API calls always hit the network.
    run_fetch(
        &engine,
        &mut log,
        "navigate-shell-warm",
        SwRequest::navigate(page("/")?),
        StatusCode::OK,
        true,
    )
    .await;
    run_fetch(
        &engine,
        &mut log,
        "asset-cold",
        SwRequest::get(page("/assets/app.js")?),
        StatusCode::OK,
        false,
    )
    .await;
    run_fetch(
        &engine,
        &mut log,
        "asset-warm-revalidates",
        SwRequest::get(page("/assets/app.js")?),
        StatusCode::OK,
        true,
    )
    .await;
    run_fetch(
        &engine,
        &mut log,
        "api-online",
        SwRequest::get(page("/api/portfolio/summary")?),
        StatusCode::OK,
        false,
    )
    .await;

    // Offline: navigations fall back to the cached shell, warm assets
    // keep serving stale copies, everything uncached resolves to 503.
    site.set_online(false);
    info!("Network is now offline");

    run_fetch(
        &engine,
        &mut log,
        "navigate-offline-shell-fallback",
        SwRequest::navigate(page("/investments")?),
        StatusCode::OK,
        true,
    )
    .await;
    run_fetch(
        &engine,
        &mut log,
        "asset-offline-stale",
        SwRequest::get(page("/assets/app.js")?),
        StatusCode::OK,
        true,
    )
    .await;
    run_fetch(
        &engine,
        &mut log,
        "uncached-offline-503",
        SwRequest::get(page("/export/holdings")?),
        StatusCode::SERVICE_UNAVAILABLE,
        false,
    )
    .await;
    match engine
        .handle_fetch(SwRequest::get(page("/api/portfolio/summary")?))
        .await
    {
        Err(e) => log.record("api-offline-propagates", true, json!({ "error": e.to_string() })),
        Ok(decision) => log.record(
            "api-offline-propagates",
            false,
            json!({ "unexpected": format!("{decision:?}") }),
        ),
    }

    // Cache partition summary.
    let mut partitions = serde_json::Map::new();
    {
        let caches = engine.caches();
        let caches = caches.read().await;
        let mut names = caches.cache_names();
        names.sort();
        for name in names {
            let entries = caches.get(&name).map(|c| c.len()).unwrap_or(0);
            partitions.insert(name, json!(entries));
        }
    }

    let summary = json!({
        "origin": ORIGIN,
        "version": engine.config().version.clone(),
        "steps": log.steps,
        "failures": log.failures,
        "network_fetches": site.fetches(),
        "caches": partitions,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).unwrap_or_else(|_| "{}".to_string())
    );

    if log.failures > 0 {
        return Err(SwError::State(format!("{} step(s) failed", log.failures)));
    }
    info!("Smoke run passed");
    Ok(())
}
