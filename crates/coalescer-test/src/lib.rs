//! Helpers for testing the coordinator, its stores and the fetcher.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Dropping it deletes the directory along with everything a
//!    store has written into it.
//!
//!  - When using [`HitCounter`], make sure that the server is held until all requests to it
//!    have been made. The server stops serving once it is dropped.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{self, OriginalUri, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use reqwest::{StatusCode, Url};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the coalescer crates and mutes all
///    other logs (such as hyper or redis).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("coalescer_service=trace,coalescer=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type Hits = Arc<Mutex<BTreeMap<String, usize>>>;

async fn count_hits(
    State(hits): State<Hits>,
    OriginalUri(uri): OriginalUri,
    req: Request,
    next: Next,
) -> Response {
    {
        let mut hits = hits.lock().unwrap();
        let hits = hits.entry(uri.to_string()).or_default();
        *hits += 1;
    }

    next.run(req).await
}

/// A web server counting every request it receives, per path.
///
/// It serves the following routes:
///
///  - `/echo/*tail`: responds with `tail` as the body.
///  - `/delay/:time/*tail`: waits for the given humantime duration, then echoes `tail`.
///  - `/respond_statuscode/:num/*tail`: responds with the given status code and an empty body.
pub struct HitCounter {
    server: Server,
    hits: Hits,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Hits::default();

        let router = Router::new()
            .route(
                "/echo/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .route(
                "/delay/:time/*tail",
                get(
                    |extract::Path((time, tail)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;
                        tail
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .layer(middleware::from_fn_with_state(hits.clone(), count_hits));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns the total number of requests since the last call, and resets the counts.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the number of requests per path since the last call, and resets the counts.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the URL of the redis server used for testing, if one is configured.
///
/// Use the `redis_url!()` macro instead which will skip correctly.
pub fn redis_url_from_env() -> Option<String> {
    match std::env::var("COALESCER_TEST_REDIS_URL") {
        Ok(url) if !url.is_empty() => Some(url),
        _ => None,
    }
}

/// Returns the URL of the redis server used for testing.
///
/// If no server is configured this will exit the test early, as a poor substitute for skipping
/// tests.
#[macro_export]
macro_rules! redis_url {
    () => {
        match $crate::redis_url_from_env() {
            Some(url) => url,
            None => {
                println!("Skipping due to missing COALESCER_TEST_REDIS_URL");
                return;
            }
        }
    };
}
