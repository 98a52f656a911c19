use std::{
    future::poll_fn,
    net::{Ipv4Addr, SocketAddr},
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::IntoResponse,
    Router,
};
use tokio::{net::TcpListener, sync::oneshot};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use climate_common::{
    monotonic_ms, Actuator, ActuatorError, ConnectivityEvent, ConnectivityMonitor, DeferredQueue,
    DeliveryError, Dispatcher, Method, NodeConfig, OutputPin, Response, ResponseSink, Route,
    Sampler, Sensor, SensorError, SensorSample, SharedActuator, SharedMonitor, TelemetryStore,
    WorkQueue,
};

const HOST_HTTP_PORT: u16 = 8080;

type SharedQueue = Arc<dyn WorkQueue<ReplySink> + Send + Sync>;

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    queue: SharedQueue,
    deferred_timeout: Duration,
}

/// Oneshot back to the request task that is awaiting the deferred answer.
struct ReplySink(oneshot::Sender<Response>);

impl ResponseSink for ReplySink {
    fn deliver(self, response: Response) -> Result<(), DeliveryError> {
        self.0.send(response).map_err(|_| DeliveryError::Closed)
    }
}

/// Stand-in for the DHT11: slow drift with a checksum fault every seventh read.
struct SimulatedSensor {
    tick: u64,
}

impl Sensor for SimulatedSensor {
    fn sample(&mut self, _timeout: Duration) -> Result<SensorSample, SensorError> {
        self.tick = self.tick.saturating_add(1);
        if self.tick % 7 == 0 {
            return Err(SensorError::ChecksumMismatch);
        }

        Ok(SensorSample {
            temperature: 21.0 + ((self.tick % 8) as f32 * 0.5),
            humidity: 42.0 + ((self.tick % 6) as f32 * 1.0),
        })
    }
}

struct LoggedLed {
    pin: i32,
}

impl OutputPin for LoggedLed {
    fn set_output(&mut self, level: bool) -> Result<(), ActuatorError> {
        info!("GPIO{} -> {}", self.pin, if level { "HIGH" } else { "LOW" });
        Ok(())
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = load_config().unwrap_or_else(|err| {
        warn!("failed to load node config: {err:#}");
        host_defaults()
    });
    config.sanitize();

    let store = Arc::new(TelemetryStore::new());
    let monitor: SharedMonitor = Arc::new(Mutex::new(ConnectivityMonitor::new(Arc::clone(&store))));

    let sampler = Sampler::new(
        SimulatedSensor { tick: 0 },
        Arc::clone(&store),
        config.sensor_timeout(),
        config.stale_after_ms,
    );
    let sampler_stats = sampler.stats();
    sampler
        .spawn(config.sample_period())
        .context("failed to spawn sampler thread")?;

    let led: Box<dyn OutputPin + Send> = Box::new(LoggedLed {
        pin: config.led_pin,
    });
    let actuator: SharedActuator = Arc::new(Actuator::new(led)?);

    let queue = DeferredQueue::start(config.deferred_capacity, config.deferred_workers)
        .context("failed to start deferred workers")?;

    let dispatcher = Dispatcher::new(
        &config,
        store,
        actuator,
        Arc::clone(&monitor),
        sampler_stats,
    );

    let app = router(AppState {
        dispatcher: Arc::new(dispatcher),
        queue: Arc::new(queue),
        deferred_timeout: config.deferred_timeout(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind node server at {addr}"))?;

    bring_link_up(&monitor, link_address());

    info!("node listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(monitor))
        .await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .fallback(handle_request)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_request(
    State(state): State<AppState>,
    method: axum::http::Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> axum::response::Response {
    let dispatcher = &state.dispatcher;

    let response = match Route::resolve(Method::parse(method.as_str()), uri.path()) {
        Route::Index => dispatcher.index(),
        Route::Data => dispatcher.data(),
        Route::Status => dispatcher.status(state.queue.counters(), monotonic_ms()),
        Route::Led => handle_led(&state, &headers, body).await,
        Route::NotFound => Response::not_found(),
    };

    into_axum(response)
}

async fn handle_led(state: &AppState, headers: &HeaderMap, body: Body) -> Response {
    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(usize::MAX);

    let mut buf = state.dispatcher.body_buffer();
    let received = match read_body_prefix(body, declared_len, &mut buf).await {
        Ok(received) => received,
        Err(err) => {
            warn!("failed to read request body: {err}");
            return Response::text(400, "unreadable body");
        }
    };

    let (tx, rx) = oneshot::channel();
    if let Err(response) =
        state
            .dispatcher
            .post_led(&buf[..received], ReplySink(tx), state.queue.as_ref())
    {
        return response;
    }

    match tokio::time::timeout(state.deferred_timeout, rx).await {
        Ok(Ok(response)) => response,
        Ok(Err(_)) => {
            warn!("deferred job released without a response");
            Response::busy()
        }
        Err(_) => {
            warn!("deferred response not produced within {:?}", state.deferred_timeout);
            Response::error(504, "deferred response timed out")
        }
    }
}

/// Streams at most `buf.len()` bytes of the body into `buf` and discards the
/// rest without buffering it. Returns the length of the kept prefix.
async fn read_body_prefix(
    mut body: Body,
    declared_len: usize,
    buf: &mut [u8],
) -> Result<usize, axum::Error> {
    let want = declared_len.min(buf.len());
    let mut filled = 0;

    while let Some(frame) = poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        let take = data.len().min(want - filled);
        buf[filled..filled + take].copy_from_slice(&data[..take]);
        filled += take;
    }
    Ok(filled)
}

fn into_axum(response: Response) -> axum::response::Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = (
        status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body,
    )
        .into_response();

    if let Some(secs) = response.retry_after_secs {
        out.headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    out
}

fn host_defaults() -> NodeConfig {
    NodeConfig {
        http_port: HOST_HTTP_PORT,
        ..NodeConfig::default()
    }
}

fn load_config() -> anyhow::Result<NodeConfig> {
    let mut config = match std::env::var("NODE_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read node config `{path}`"))?;
            parse_config(&raw).with_context(|| format!("invalid node config `{path}`"))?
        }
        Err(_) => host_defaults(),
    };

    if let Some(port) = std::env::var("NODE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.http_port = port;
    }
    Ok(config)
}

/// Parses a JSON node config; a missing `http_port` means the host port.
fn parse_config(raw: &str) -> anyhow::Result<NodeConfig> {
    let mut value: serde_json::Value = serde_json::from_str(raw)?;
    if let Some(fields) = value.as_object_mut() {
        fields
            .entry("http_port")
            .or_insert_with(|| HOST_HTTP_PORT.into());
    }
    Ok(serde_json::from_value(value)?)
}

fn link_address() -> Ipv4Addr {
    std::env::var("NODE_ADDRESS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(Ipv4Addr::LOCALHOST)
}

/// There is no radio on a workstation; replay the association sequence a
/// station goes through so the address shows up like it would on hardware.
fn bring_link_up(monitor: &SharedMonitor, address: Ipv4Addr) {
    let mut monitor = monitor.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    for event in [
        ConnectivityEvent::Associating,
        ConnectivityEvent::Associated,
        ConnectivityEvent::AddressAssigned(address),
    ] {
        monitor.handle(event);
    }
}

async fn shutdown_signal(monitor: SharedMonitor) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }

    info!("shutting down");
    monitor
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .handle(ConnectivityEvent::Lost);
}
