use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use dht_sensor::{dht11, DhtError};
use embedded_svc::{
    http::Method,
    io::Write,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, IOPin, InputOutput, Level, Output, OutputPin as _, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::{EspSubscription, EspSystemEventLoop, System},
    handle::RawHandle,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    netif::IpEvent,
    nvs::EspDefaultNvsPartition,
    wifi::{BlockingWifi, EspWifi, WifiEvent},
};
use log::{info, warn};

use climate_common::{
    http::reason_phrase, monotonic_ms, Actuator, ActuatorError, ConnectivityEvent,
    ConnectivityMonitor, Dispatcher, NodeConfig, OutputPin, Response, Sampler, Sensor,
    SensorError, SensorSample, SharedActuator, SharedMonitor, TelemetryStore, WorkQueue,
};

use crate::httpd::{register_led_route, HttpdWorkQueue, LedRoute};

const DHT11_PIN: i32 = 4;
const LED_PIN: i32 = 2;

const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 2_000;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;

struct DhtSensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

impl DhtSensor {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self { pin, delay: Ets })
    }
}

impl Sensor for DhtSensor {
    fn sample(&mut self, timeout: Duration) -> Result<SensorSample, SensorError> {
        self.pin
            .set_high()
            .map_err(|err| SensorError::Bus(format!("{err:?}")))?;

        let started = Instant::now();
        let result = dht11::blocking::read(&mut self.delay, &mut self.pin);
        if started.elapsed() > timeout {
            return Err(SensorError::Timeout);
        }

        match result {
            Ok(reading) => Ok(SensorSample {
                temperature: reading.temperature as f32,
                humidity: reading.relative_humidity as f32,
            }),
            Err(DhtError::Timeout) => Err(SensorError::Timeout),
            Err(DhtError::ChecksumMismatch) => Err(SensorError::ChecksumMismatch),
            Err(err) => Err(SensorError::Bus(format!("{err:?}"))),
        }
    }
}

struct GpioLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl OutputPin for GpioLed {
    fn set_output(&mut self, level: bool) -> Result<(), ActuatorError> {
        self.pin
            .set_level(Level::from(level))
            .map_err(|err| ActuatorError::Pin(format!("GPIO{LED_PIN}: {err}")))
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut config = NodeConfig::default();
    ensure_wifi_defaults(&mut config);
    config.sanitize();
    if config.led_pin != LED_PIN || config.dht_pin != DHT11_PIN {
        warn!(
            "configured pins (led {}, dht {}) differ from the wired GPIO{LED_PIN}/GPIO{DHT11_PIN}",
            config.led_pin, config.dht_pin
        );
    }

    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let store = Arc::new(TelemetryStore::new());
    let monitor: SharedMonitor = Arc::new(Mutex::new(ConnectivityMonitor::new(Arc::clone(&store))));

    let station_up = Arc::new(AtomicBool::new(false));
    let _subscriptions = subscribe_link_events(&sys_loop, &monitor, &station_up)?;

    let wifi = connect_wifi(modem, sys_loop.clone(), nvs_partition, &config)
        .context("wifi startup failed")?;
    station_up.store(true, Ordering::Release);
    disable_wifi_power_save();

    let led = PinDriver::output(pins.gpio2.downgrade_output())?;
    let led: Box<dyn OutputPin + Send> = Box::new(GpioLed { pin: led });
    let actuator: SharedActuator = Arc::new(Actuator::new(led)?);

    let sensor = DhtSensor::new(pins.gpio4.downgrade()).context("failed to initialize DHT11")?;
    let sampler = Sampler::new(
        sensor,
        Arc::clone(&store),
        config.sensor_timeout(),
        config.stale_after_ms,
    );
    let sampler_stats = sampler.stats();
    sampler
        .spawn(config.sample_period())
        .context("failed to spawn sampler thread")?;

    let dispatcher = Arc::new(Dispatcher::new(
        &config,
        store,
        actuator,
        Arc::clone(&monitor),
        sampler_stats,
    ));
    let server = create_http_server(&config, dispatcher)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;
    let mut wifi_disconnected_since: Option<Instant> = None;

    loop {
        maintain_wifi_health(&mut wifi_disconnected_since);
        thread::sleep(Duration::from_secs(1));
    }
}

fn create_http_server(
    config: &NodeConfig,
    dispatcher: Arc<Dispatcher>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: config.http_port,
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;
    let queue = Arc::new(HttpdWorkQueue::new(server.handle(), config.deferred_capacity));

    // Registered first so the wildcard fallback below cannot shadow it.
    register_led_route(
        server.handle(),
        LedRoute {
            dispatcher: Arc::clone(&dispatcher),
            queue: Arc::clone(&queue),
        },
    )
    .context("failed to register /ws")?;

    {
        let dispatcher = Arc::clone(&dispatcher);
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            write_response(req, dispatcher.index())
        })?;
    }

    {
        let dispatcher = Arc::clone(&dispatcher);
        server.fn_handler::<anyhow::Error, _>("/data", Method::Get, move |req| {
            write_response(req, dispatcher.data())
        })?;
    }

    {
        let dispatcher = Arc::clone(&dispatcher);
        let queue = Arc::clone(&queue);
        server.fn_handler::<anyhow::Error, _>("/api/status", Method::Get, move |req| {
            write_response(req, dispatcher.status(queue.counters(), monotonic_ms()))
        })?;
    }

    for method in [Method::Get, Method::Post] {
        server.fn_handler::<anyhow::Error, _>("/*", method, |req| {
            write_response(req, Response::not_found())
        })?;
    }

    info!("http server listening on port {}", config.http_port);
    Ok(server)
}

fn write_response(
    req: Request<&mut EspHttpConnection<'_>>,
    response: Response,
) -> anyhow::Result<()> {
    let retry_after = response.retry_after_secs.map(|secs| secs.to_string());
    let mut headers = vec![("Content-Type", response.content_type)];
    if let Some(retry_after) = retry_after.as_deref() {
        headers.push(("Retry-After", retry_after));
    }

    req.into_response(
        response.status,
        Some(reason_phrase(response.status)),
        &headers,
    )?
    .write_all(&response.body)?;
    Ok(())
}

/// Feeds Wi-Fi and IP events into the connectivity monitor. Once the initial
/// connection is up, a dropped station is asked to reassociate.
fn subscribe_link_events(
    sys_loop: &EspSystemEventLoop,
    monitor: &SharedMonitor,
    station_up: &Arc<AtomicBool>,
) -> anyhow::Result<[EspSubscription<'static, System>; 2]> {
    let wifi_monitor = Arc::clone(monitor);
    let station_up = Arc::clone(station_up);
    let wifi = sys_loop.subscribe::<WifiEvent, _>(move |event| {
        let mut monitor = wifi_monitor.lock().unwrap_or_else(PoisonError::into_inner);
        match event {
            WifiEvent::StaStarted => {
                monitor.handle(ConnectivityEvent::Associating);
            }
            WifiEvent::StaConnected(_) => {
                monitor.handle(ConnectivityEvent::Associated);
            }
            WifiEvent::StaDisconnected(_) => {
                monitor.handle(ConnectivityEvent::Lost);
                if station_up.load(Ordering::Acquire) {
                    let rc = unsafe { esp_idf_svc::sys::esp_wifi_connect() };
                    if rc == esp_idf_svc::sys::ESP_OK {
                        info!("retrying wifi association");
                        monitor.handle(ConnectivityEvent::Associating);
                    } else {
                        warn!("wifi reconnect request failed: esp_err_t={rc}");
                    }
                }
            }
            _ => {}
        }
    })?;

    let ip_monitor = Arc::clone(monitor);
    let ip = sys_loop.subscribe::<IpEvent, _>(move |event| {
        let mut monitor = ip_monitor.lock().unwrap_or_else(PoisonError::into_inner);
        match event {
            IpEvent::DhcpIpAssigned(assignment) => {
                monitor.handle(ConnectivityEvent::AddressAssigned(assignment.ip()));
            }
            IpEvent::DhcpIpDeassigned(_) => {
                monitor.handle(ConnectivityEvent::Lost);
            }
            _ => {}
        }
    })?;

    Ok([wifi, ip])
}

fn ensure_wifi_defaults(config: &mut NodeConfig) {
    if config.network.wifi_ssid.is_empty() {
        config.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }

    if config.network.wifi_pass.is_empty() {
        config.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or("CHANGE_ME").to_string();
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    config: &NodeConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let network = &config.network;
    if !network.has_station_credentials() {
        bail!("wifi credentials missing; build with WIFI_SSID and WIFI_PASS set");
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect() {
            Ok(()) => match wifi.wait_netif_up() {
                Ok(()) => {
                    info!("wifi connected and netif up on attempt {attempt}");
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!("wifi netif up failed on attempt {attempt}: {err:#}");
                    last_err = Some(err);
                }
            },
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        let _ = wifi.disconnect();
        let _ = wifi.stop();
        return Err(anyhow!(err)
            .context(format!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed")));
    }

    drop(wifi);
    Ok(esp_wifi)
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn maintain_wifi_health(wifi_disconnected_since: &mut Option<Instant>) {
    if is_wifi_station_connected() {
        *wifi_disconnected_since = None;
        return;
    }

    match wifi_disconnected_since {
        Some(disconnected_since)
            if disconnected_since.elapsed().as_millis() as u64 >= WIFI_RESTART_GRACE_MS =>
        {
            warn!(
                "wifi disconnected for {}s; restarting device for recovery",
                WIFI_RESTART_GRACE_MS / 1000
            );
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        Some(_) => {}
        None => *wifi_disconnected_since = Some(Instant::now()),
    }
}
