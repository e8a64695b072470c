use crate::daemon::bus::{LocationBus, Subscription};
use crate::daemon::listener::{self, BoundListener, ListenAddr};
use crate::daemon::obfuscate::{obfuscate, ObfuscateConfig};
use crate::daemon::records::{format_timestamp, BroadcastEvent, LocationRecord};
use crate::daemon::runtime::{ThreadHandle, ThreadRegistry};
use crate::daemon::store::{LocationStore, MongoStore};
use crate::util::config::AppConfig;
use crate::util::logging::{debug, error, info, warn};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::Stream;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tower::Service;
use tower_http::cors::CorsLayer;

/// Exact-match sentinel: any other value of the header, including its
/// absence, is an untrusted observer.
pub const TRUSTED_HEADER: &str = "x-memory-private";
pub const TRUSTED_SENTINEL: &str = "true";

pub struct AppState {
    pub store: Arc<dyn LocationStore>,
    pub bus: LocationBus,
    pub obfuscation: ObfuscateConfig,
}

#[derive(Debug, Deserialize)]
pub struct LocationBatch {
    pub locations: Vec<LocationRecord>,
    #[serde(default)]
    pub trip: Option<LocationRecord>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/location", get(get_location).post(post_location))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Persist the batch (and the trip marker, when present), then publish
/// one broadcast event per location in batch order. Nothing is
/// published unless every write succeeded.
async fn ingest(state: &AppState, mut batch: LocationBatch) -> Result<usize> {
    state
        .store
        .insert_locations(&mut batch.locations)
        .await
        .context("persist location batch")?;
    if let Some(trip) = batch.trip.as_mut() {
        state.store.insert_trip(trip).await.context("persist trip")?;
    }

    let count = batch.locations.len();
    for location in batch.locations {
        state.bus.publish(BroadcastEvent::for_location(location));
    }
    Ok(count)
}

async fn post_location(
    State(state): State<Arc<AppState>>,
    Json(batch): Json<LocationBatch>,
) -> Response {
    match ingest(&state, batch).await {
        Ok(count) => {
            debug!("ingested {count} locations ({} observers)", state.bus.observers());
            Json(json!({ "result": "ok" })).into_response()
        }
        Err(e) => {
            error!("ingest failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "persistence failure" })),
            )
                .into_response()
        }
    }
}

fn is_trusted(headers: &HeaderMap) -> bool {
    headers
        .get(TRUSTED_HEADER)
        .and_then(|value| value.to_str().ok())
        == Some(TRUSTED_SENTINEL)
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|accept| {
            accept
                .split(',')
                .any(|part| part.trim().split(';').next() == Some("text/event-stream"))
        })
        .unwrap_or(false)
}

async fn get_location(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let trusted = is_trusted(&headers);
    let latest = match state.store.latest_location().await {
        Ok(latest) => latest,
        Err(e) => {
            error!("latest location fetch failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "store unavailable" })),
            )
                .into_response();
        }
    };

    if !wants_event_stream(&headers) {
        return match latest {
            Some(location) => {
                Json(obfuscate(&location, trusted, &state.obfuscation)).into_response()
            }
            None => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "no location recorded" })),
            )
                .into_response(),
        };
    }

    info!("observer connected (trusted: {trusted})");
    let subscription = state.bus.subscribe();
    observer_sse(latest, subscription, trusted, state.obfuscation.clone()).into_response()
}

/// The observer state machine: initial emit of the latest stored
/// record (skipped on an empty store), then live relay until the
/// client disconnects. Teardown is the stream drop.
fn observer_sse(
    latest: Option<LocationRecord>,
    subscription: Subscription,
    trusted: bool,
    obfuscation: ObfuscateConfig,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let initial = latest.map(BroadcastEvent::for_location);
    let stream = tokio_stream::iter(initial)
        .chain(subscription.into_stream())
        .map(move |event| Ok(sse_event(&event, trusted, &obfuscation)));
    Sse::new(stream)
}

/// Event-level id (the timestamp resumption hint) survives for both
/// trust levels; only the record itself is obfuscated.
fn event_payload(
    event: &BroadcastEvent,
    trusted: bool,
    obfuscation: &ObfuscateConfig,
) -> BroadcastEvent {
    BroadcastEvent {
        id: event.id,
        data: obfuscate(&event.data, trusted, obfuscation),
    }
}

fn sse_event(event: &BroadcastEvent, trusted: bool, obfuscation: &ObfuscateConfig) -> Event {
    let payload = event_payload(event, trusted, obfuscation);
    let mut out = Event::default();
    if let Some(id) = payload.id {
        out = out.id(format_timestamp(&id));
    }
    out.data(serde_json::to_string(&payload).unwrap_or_else(|_| "{}".into()))
}

/// Spawn the serving thread: connect the store gateway, run the
/// 3-attempt listener acquisition, signal the bind outcome back over a
/// bounded channel, then accept connections until the process exits.
pub fn spawn_http_server(
    config: AppConfig,
    bus: LocationBus,
    threads: &ThreadRegistry,
) -> Result<(ThreadHandle, ListenAddr)> {
    let addr = ListenAddr::parse(&config.listen);
    let addr_for_thread = addr.clone();
    let (tx, rx) = crossbeam_channel::bounded(1);

    let handle = threads
        .spawn("http-server", move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("build runtime");
            rt.block_on(async move {
                let startup = async {
                    let store = MongoStore::connect(&config.mongo_url, &config.database).await?;
                    let bound = listener::acquire(&addr_for_thread).await?;
                    anyhow::Ok((store, bound))
                };
                let (store, bound) = match startup.await {
                    Ok(ready) => ready,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };

                let store = Arc::new(store);
                // Fire-and-forget; serving does not wait on index creation.
                let index_store = Arc::clone(&store);
                tokio::task::spawn(async move {
                    if let Err(e) = index_store.ensure_indexes().await {
                        warn!("index creation failed: {e:#}");
                    }
                });

                let state = Arc::new(AppState {
                    store,
                    bus,
                    obfuscation: ObfuscateConfig::from_config(&config),
                });
                let app = router(state);
                let _ = tx.send(Ok(()));
                info!("listening on {addr_for_thread}");
                serve(bound, app).await;
            });
        })
        .context("spawn HTTP server thread")?;

    match rx.recv_timeout(Duration::from_secs(5)) {
        Ok(Ok(())) => Ok((handle, addr)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(anyhow::anyhow!(
            "HTTP server failed to signal readiness within 5s"
        )),
    }
}

async fn serve(listener: BoundListener, app: Router) {
    let make_service = app.into_make_service();
    match listener {
        BoundListener::Tcp(listener) => loop {
            match listener.accept().await {
                Ok((stream, _)) => spawn_connection(TokioIo::new(stream), make_service.clone()),
                Err(e) => warn!("accept failed: {e}"),
            }
        },
        BoundListener::Unix(listener) => loop {
            match listener.accept().await {
                Ok((stream, _)) => spawn_connection(TokioIo::new(stream), make_service.clone()),
                Err(e) => warn!("accept failed: {e}"),
            }
        },
    }
}

fn spawn_connection<I>(io: TokioIo<I>, mut make_service: axum::routing::IntoMakeService<Router>)
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::task::spawn(async move {
        let service = make_service.call(()).await.expect("create service");
        let hyper_service = TowerToHyperService::new(service);
        if let Err(err) = http1::Builder::new().serve_connection(io, hyper_service).await {
            // Client-initiated disconnects (an observer closing its
            // event stream) surface as IncompleteMessage; that's a
            // normal exit, not an error.
            if err.is_incomplete_message() {
                debug!("client disconnected while streaming");
            } else {
                warn!("error serving connection: {err:?}");
            }
        }
    });
}
