// aggregation server
// request handlers merge the presented logical time and then either enqueue a
// write into the pipeline or wait on the synchronizer before serving the
// published aggregate. axum owns the connections, every response leaves through
// `stamped` which ticks the clock for the send event
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Request, State},
    http::{
        header::{CONNECTION, RETRY_AFTER, TRANSFER_ENCODING},
        HeaderMap, HeaderValue, Method, StatusCode, Uri,
    },
    middleware::{self, Next},
    response::{IntoResponse as _, Response},
    routing::get,
    Router,
};
use serde_json::json;
use tokio::{net::TcpListener, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    clock::{LamportClock, LogicalTime, MAX_PRESENTED},
    config::ServerConfig,
    expiry::{unix_millis, FixedTtl, Freshness},
    pipeline::{pipeline, Enqueue, PendingUpdate, Pipeline, View},
    protocol::{header_str, Reply, LAMPORT_CLOCK, LAMPORT_NODE, MAX_BODY, SOURCE_ID},
    register::{Aggregate, Reading},
    snapshot::FileSnapshotStore,
    sync::Synchronizer,
};

pub const WEATHER_PATH: &str = "/weather.json";
pub const HEALTH_PATH: &str = "/health";

pub const NO_DATA: &str = "no data available";
pub const EXPIRED: &str = "data expired";

#[derive(Debug)]
pub struct Server {
    node_id: String,
    node_header: HeaderValue,
    clock: LamportClock,
    synchronizer: Arc<Synchronizer>,
    enqueue: Enqueue,
    view: View,
    ttl: FixedTtl,
    read_wait: Duration,
    io_timeout: Duration,
    validation_status: StatusCode,
}

fn error(status: StatusCode, message: &str) -> Reply {
    Reply::json(status, &json!({ "error": message }))
}

fn presented_time(headers: &HeaderMap) -> anyhow::Result<LogicalTime> {
    let Some(value) = headers.get(LAMPORT_CLOCK) else {
        return Ok(0);
    };
    let time = value
        .to_str()
        .map_err(|err| anyhow::anyhow!("invalid {LAMPORT_CLOCK}: {err}"))?
        .trim()
        .parse::<LogicalTime>()
        .map_err(|err| anyhow::anyhow!("invalid {LAMPORT_CLOCK} {value:?}: {err}"))?;
    anyhow::ensure!(
        time <= MAX_PRESENTED,
        "{LAMPORT_CLOCK} {time} exceeds {MAX_PRESENTED}"
    );
    Ok(time)
}

impl Server {
    /// Restores the latest snapshot and wires up the apply pipeline. The
    /// returned worker must be run for writes to make progress.
    pub async fn open(config: &ServerConfig) -> anyhow::Result<(Self, Pipeline)> {
        config.validate()?;
        let node_header = HeaderValue::from_str(&config.node_id)
            .map_err(|err| anyhow::anyhow!("node id {:?} is not a header value: {err}", config.node_id))?;
        let snapshots = config.snapshot_dir.as_ref().map(|dir| {
            FileSnapshotStore::new(dir, &config.snapshot_base_name, config.snapshot_history)
        });
        let mut initial = Aggregate::new();
        if let Some(snapshots) = &snapshots {
            match snapshots.load().await {
                Ok(state) => initial = state.unwrap_or_default(),
                // start empty rather than refuse to serve
                Err(err) => warn!("load snapshot from {}: {err:#}", snapshots.dir().display()),
            }
            if let Err(err) = snapshots.prune().await {
                warn!("prune snapshots in {}: {err:#}", snapshots.dir().display())
            }
        }
        // everything after restart orders after the restored records
        let restored = initial.max_lamport();
        info!(
            entities = initial.len(),
            lamport = restored,
            "restored aggregate"
        );
        let synchronizer = Arc::new(Synchronizer::new(restored));
        let (pipeline, enqueue, view) = pipeline(initial, snapshots, synchronizer.clone());
        let server = Self {
            node_id: config.node_id.clone(),
            node_header,
            clock: LamportClock::starting_at(restored),
            synchronizer,
            enqueue,
            view,
            ttl: config.ttl(),
            read_wait: config.read_wait(),
            io_timeout: config.io_timeout(),
            validation_status: StatusCode::from_u16(config.validation_status)?,
        };
        Ok((server, pipeline))
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    // the send event
    pub fn stamp(&self, headers: &mut HeaderMap) {
        headers.insert(LAMPORT_CLOCK, HeaderValue::from(self.clock.tick()));
        headers.insert(LAMPORT_NODE, self.node_header.clone());
    }

    pub async fn put(&self, headers: &HeaderMap, body: &[u8]) -> Reply {
        let presented = match presented_time(headers) {
            Ok(time) => time,
            Err(err) => return error(StatusCode::BAD_REQUEST, &err.to_string()),
        };
        let lamport = self.clock.on_receive(presented);
        if let Some(encoding) = headers.get(TRANSFER_ENCODING) {
            if !encoding.as_bytes().eq_ignore_ascii_case(b"identity") {
                return error(StatusCode::BAD_REQUEST, "unsupported transfer encoding");
            }
        }
        if body.is_empty() {
            return Reply::new(StatusCode::NO_CONTENT);
        }
        let Some((entity_id, payload)) = serde_json::from_slice::<Reading>(body)
            .ok()
            .and_then(|payload| Some((payload.entity_id()?, payload)))
        else {
            return error(self.validation_status, "invalid JSON or missing id");
        };
        let source_id = [SOURCE_ID, LAMPORT_NODE]
            .into_iter()
            .filter_map(|name| header_str(headers, name))
            .map(str::trim)
            .find(|id| !id.is_empty())
            .unwrap_or("anonymous")
            .to_string();
        let update = PendingUpdate {
            entity_id: entity_id.clone(),
            payload,
            source_id,
            lamport,
        };
        let applied = match self.enqueue.enqueue(update) {
            Ok(applied) => applied,
            Err(err) => {
                warn!("{err:#}");
                return unavailable();
            }
        };
        let Ok(applied) = applied.await else {
            warn!("apply pipeline stopped before applying {entity_id}@{lamport}");
            return unavailable();
        };
        let status = if applied.first_write {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        };
        Reply::json(
            status,
            &json!({
                "id": entity_id,
                "lamport": applied.lamport,
                "resolution": applied.resolution,
            }),
        )
    }

    pub async fn get(&self, headers: &HeaderMap) -> Reply {
        let presented = match presented_time(headers) {
            Ok(time) => time,
            Err(err) => return error(StatusCode::BAD_REQUEST, &err.to_string()),
        };
        let reader_time = self.clock.on_receive(presented);
        // the watermark only ever reaches lamports of enqueued writes
        let wanted = reader_time.min(self.enqueue.last_enqueued());
        if !self.synchronizer.await_at_least(wanted, self.read_wait).await {
            warn!(
                wanted,
                watermark = self.synchronizer.last_applied(),
                "causal wait timed out, serving potentially stale state"
            )
        }
        let state = self.view.current();
        match self.ttl.freshness(state.last_applied_at(), unix_millis()) {
            Freshness::Fresh if !state.is_empty() => {
                Reply::json(StatusCode::OK, &state.payloads().into())
            }
            Freshness::Expired => error(StatusCode::NOT_FOUND, EXPIRED),
            Freshness::Fresh | Freshness::NeverWritten => error(StatusCode::NOT_FOUND, NO_DATA),
        }
    }

    pub fn health(&self) -> Reply {
        Reply::json(
            StatusCode::OK,
            &json!({
                "status": "ok",
                "serverId": self.node_id,
                "lamport": self.clock.current(),
                "applied": self.synchronizer.last_applied(),
                "entities": self.view.current().len(),
            }),
        )
    }
}

fn unavailable() -> Reply {
    error(StatusCode::SERVICE_UNAVAILABLE, "apply pipeline unavailable")
        .with_header(RETRY_AFTER, 1u64)
}

async fn write(
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Reply {
    match body {
        Ok(body) => server.put(&headers, &body).await,
        Err(err) => error(StatusCode::BAD_REQUEST, &err.body_text()),
    }
}

async fn read(State(server): State<Arc<Server>>, headers: HeaderMap) -> Reply {
    server.get(&headers).await
}

async fn health(State(server): State<Arc<Server>>) -> Reply {
    server.health()
}

async fn unsupported(method: Method, uri: Uri) -> Reply {
    error(
        StatusCode::BAD_REQUEST,
        &format!("unsupported {method} {}", uri.path()),
    )
}

async fn stamped(State(server): State<Arc<Server>>, request: Request, next: Next) -> Response {
    let mut response = match timeout(server.io_timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!("request not finished within {:?}", server.io_timeout);
            error(StatusCode::REQUEST_TIMEOUT, "request timed out").into_response()
        }
    };
    server.stamp(response.headers_mut());
    // one request per connection
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route(WEATHER_PATH, get(read).put(write).fallback(unsupported))
        .route(HEALTH_PATH, get(health).fallback(unsupported))
        .fallback(unsupported)
        .layer(middleware::from_fn_with_state(server.clone(), stamped))
        .layer(DefaultBodyLimit::max(MAX_BODY))
        .with_state(server)
}

pub async fn serve(config: ServerConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.listen).await?;
    serve_on(listener, &config, shutdown).await
}

/// Serves on an already bound listener until `shutdown` fires, then waits for
/// the pipeline to apply everything that was accepted.
pub async fn serve_on(
    listener: TcpListener,
    config: &ServerConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let (server, mut pipeline) = Server::open(config).await?;
    let worker = tokio::spawn(async move { pipeline.run().await });
    let local_addr: SocketAddr = listener.local_addr()?;
    info!(node_id = %config.node_id, "listening on {local_addr}");
    // failed accepts are logged and retried inside `axum::serve`, only the
    // listener itself going away ends it
    axum::serve(listener, router(Arc::new(server)))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    // the router held the last enqueue handles, the worker stops once the
    // queue is drained
    info!("shutting down");
    worker.await?
}
