use core::convert::{Infallible, TryInto};
use std::{
    ffi::CStr,
    fs,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    http::client::{
        Configuration as HttpClientConfiguration, EspHttpConnection, FollowRedirectsPolicy,
    },
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::EspDefaultNvsPartition,
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use sha2::{Digest, Sha256};

use relaynode_common::{
    config::defaults,
    error::{TRANSPORT_CONNECTION_LOST, TRANSPORT_CONNECTION_REFUSED},
    format_mac,
    io::{INSTALL_NO_PARTITION, INSTALL_NO_SIZE, INSTALL_TOO_LESS_SPACE},
    locator::Source,
    CommandAction, Device, ErrorKind, FileStore, FirmwareInstaller, HttpResponse, HttpSession,
    InstallFailure, Network, NodeSettings, Restarter, StatusSink, Topics,
};

const SPIFFS_ROOT: &str = "/spiffs";
const SPIFFS_BASE: &CStr = c"/spiffs";
const SPIFFS_MAX_FILES: usize = 5;
const MAX_HTTP_BODY: usize = 16 * 1024;
const OTA_CHUNK_SIZE: usize = 4096;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;

type Mqtt = Arc<Mutex<EspMqttClient<'static>>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, .. } = Peripherals::take()?;

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mac = format_mac(
        esp_wifi
            .sta_netif()
            .get_mac()
            .context("failed to read station MAC")?,
    );
    if let Err(err) = connect_wifi(&mut esp_wifi, sys_loop) {
        warn!("wifi unavailable ({err:#}); update checks will report NO_NETWORK");
    }

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let mut device = Device::new(
        compiled_settings(),
        mac.clone(),
        SpiffsStore::default(),
        EspNetwork,
        EspOtaInstaller,
        EspRestarter,
    );
    let provisioned = device.boot();
    info!(
        "node {mac} booted (firmware {}, provisioned: {provisioned})",
        device.config().settings().firmware_version
    );

    let (client, conn) = create_mqtt_client(&mac)?;
    let mqtt: Mqtt = Arc::new(Mutex::new(client));
    let topics = Arc::new(Mutex::new(device.config().topics().clone()));
    let (command_tx, command_rx) = mpsc::channel();
    spawn_mqtt_receiver(conn, mqtt.clone(), topics.clone(), command_tx);

    // The esp wifi driver must outlive the loop.
    let _wifi = esp_wifi;
    run_device_loop(&mut device, &mqtt, &topics, &command_rx);
    Ok(())
}

fn compiled_settings() -> NodeSettings {
    let mut settings = NodeSettings::default();
    let prefixes = [
        (option_env!("NODE_OTA_PRIMARY"), Source::Primary, false),
        (option_env!("NODE_OTA_SECONDARY"), Source::Secondary, false),
        (option_env!("NODE_CERT_PRIMARY"), Source::Primary, true),
        (option_env!("NODE_CERT_SECONDARY"), Source::Secondary, true),
    ];
    for (prefix, source, certificates) in prefixes {
        let Some(prefix) = prefix else {
            continue;
        };
        let endpoint = if certificates {
            &mut settings.certificates
        } else {
            &mut settings.firmware
        };
        endpoint.set_prefix(source, prefix);
    }
    settings
}

fn connect_wifi(
    esp_wifi: &mut EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
) -> anyhow::Result<()> {
    let ssid = option_env!("WIFI_SSID").unwrap_or_default();
    let pass = option_env!("WIFI_PASS").unwrap_or_default();
    if ssid.is_empty() {
        return Err(anyhow!("no wifi credentials compiled in"));
    }

    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: pass
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method: if pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        },
        ..Default::default()
    }))?;
    wifi.start()?;

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} to `{ssid}`");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                return Ok(());
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }
        let _ = wifi.disconnect();
        thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
    }
    Err(last_err.map_or_else(|| anyhow!("wifi connect failed"), anyhow::Error::from))
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn maintain_wifi_health(disconnected_since: &mut Option<Instant>) {
    if is_wifi_station_connected() {
        *disconnected_since = None;
        return;
    }
    match disconnected_since {
        Some(since) if since.elapsed().as_millis() as u64 >= WIFI_RESTART_GRACE_MS => {
            warn!(
                "wifi disconnected for {}s; restarting",
                WIFI_RESTART_GRACE_MS / 1000
            );
            restart_device()
        }
        Some(_) => {}
        None => *disconnected_since = Some(Instant::now()),
    }
}

fn create_mqtt_client(
    mac: &str,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = option_env!("MQTT_URL").unwrap_or("mqtt://192.168.0.101:1883");
    let client_id = format!("relaynode-{mac}");
    let user = option_env!("MQTT_USER").filter(|user| !user.is_empty());
    let conf = MqttClientConfiguration {
        client_id: Some(client_id.as_str()),
        username: user,
        password: user.and(option_env!("MQTT_PASS")),
        ..Default::default()
    };
    EspMqttClient::new(url, &conf).with_context(|| format!("failed to connect to {url}"))
}

fn current_topics(topics: &Mutex<Topics>) -> Topics {
    topics
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn subscribe_all(mqtt: &Mqtt, topics: &Topics) {
    let mut client = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
    for topic in topics.subscriptions() {
        if let Err(err) = client.subscribe(topic, QoS::AtLeastOnce) {
            warn!("failed to subscribe to {topic}: {err:?}");
        }
    }
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    mqtt: Mqtt,
    topics: Arc<Mutex<Topics>>,
    command_tx: Sender<Vec<u8>>,
) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        let topics = current_topics(&topics);
                        info!("mqtt connected; subscribing to {}", topics.subscribe);
                        subscribe_all(&mqtt, &topics);
                    }
                    EventPayload::Received {
                        data,
                        details: Details::Complete,
                        ..
                    } => {
                        if command_tx.send(data.to_vec()).is_err() {
                            warn!("device loop is gone; dropping command");
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn run_device_loop(
    device: &mut Device<SpiffsStore, EspNetwork, EspOtaInstaller, EspRestarter>,
    mqtt: &Mqtt,
    topics: &Mutex<Topics>,
    command_rx: &Receiver<Vec<u8>>,
) {
    let mut sink = MqttSink { client: mqtt.clone() };
    let mut wifi_disconnected_since = None;
    let tick = Duration::from_millis(defaults::CHECK_INTERVAL_MS);
    loop {
        match command_rx.recv_timeout(tick) {
            Ok(payload) => {
                for action in device.handle_message(&payload, monotonic_ms(), &mut sink) {
                    if let CommandAction::Resubscribe { old, new } = action {
                        resubscribe(mqtt, topics, &old, new);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("mqtt receiver stopped; restarting");
                restart_device()
            }
        }
        maintain_wifi_health(&mut wifi_disconnected_since);
        device.tick(monotonic_ms(), &mut sink);
    }
}

fn resubscribe(mqtt: &Mqtt, shared: &Mutex<Topics>, old: &Topics, new: Topics) {
    {
        let mut client = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
        for topic in old.subscriptions() {
            if let Err(err) = client.unsubscribe(topic) {
                warn!("failed to unsubscribe from {topic}: {err:?}");
            }
        }
    }
    subscribe_all(mqtt, &new);
    info!("resubscribed to {}", new.subscribe);
    *shared.lock().unwrap_or_else(PoisonError::into_inner) = new;
}

struct MqttSink {
    client: Mqtt,
}

impl StatusSink for MqttSink {
    fn publish(&mut self, topic: &str, payload: &str) {
        let mut client = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = client.publish(topic, QoS::AtLeastOnce, false, payload.as_bytes()) {
            warn!("failed to publish status to {topic}: {err:?}");
        }
    }
}

#[derive(Default)]
struct SpiffsStore {
    mounted: bool,
}

impl SpiffsStore {
    fn path(name: &str) -> PathBuf {
        Path::new(SPIFFS_ROOT).join(name.trim_start_matches('/'))
    }

    fn ensure_mounted(&self) -> Result<(), ErrorKind> {
        if self.mounted {
            Ok(())
        } else {
            Err(ErrorKind::StorageUnavailable)
        }
    }
}

impl FileStore for SpiffsStore {
    fn mount(&mut self) -> Result<(), ErrorKind> {
        if self.mounted {
            return Ok(());
        }
        let conf = esp_idf_sys::esp_vfs_spiffs_conf_t {
            base_path: SPIFFS_BASE.as_ptr(),
            partition_label: core::ptr::null(),
            max_files: SPIFFS_MAX_FILES,
            format_if_mount_failed: false,
        };
        let rc = unsafe { esp_idf_sys::esp_vfs_spiffs_register(&conf) };
        if rc != esp_idf_sys::ESP_OK {
            warn!("spiffs mount failed: esp_err_t={rc}");
            return Err(ErrorKind::StorageUnavailable);
        }
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self) {
        if !self.mounted {
            return;
        }
        let rc = unsafe { esp_idf_sys::esp_vfs_spiffs_unregister(core::ptr::null()) };
        if rc != esp_idf_sys::ESP_OK {
            warn!("spiffs unmount failed: esp_err_t={rc}");
        }
        self.mounted = false;
    }

    fn exists(&self, path: &str) -> bool {
        self.mounted && Self::path(path).is_file()
    }

    fn size(&self, path: &str) -> Result<u64, ErrorKind> {
        self.ensure_mounted()?;
        fs::metadata(Self::path(path))
            .map(|meta| meta.len())
            .map_err(|_| ErrorKind::FileOpenError)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, ErrorKind> {
        self.ensure_mounted()?;
        fs::read(Self::path(path)).map_err(|_| ErrorKind::FileOpenError)
    }

    fn write(&mut self, path: &str, contents: &[u8]) -> Result<usize, ErrorKind> {
        self.ensure_mounted()?;
        let target = Self::path(path);
        let partial = Self::path(&format!("{}.part", path.trim_start_matches('/')));
        fs::write(&partial, contents).map_err(|_| ErrorKind::FileOpenError)?;
        fs::rename(&partial, &target).map_err(|err| {
            warn!("failed to replace {}: {err}", target.display());
            ErrorKind::FileWriteError
        })?;
        Ok(contents.len())
    }

    fn list(&self) -> Vec<(String, u64)> {
        if !self.mounted {
            return Vec::new();
        }
        let Ok(entries) = fs::read_dir(Self::path("/")) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let meta = entry.metadata().ok()?;
                (!name.ends_with(".part")).then(|| (format!("/{name}"), meta.len()))
            })
            .collect()
    }
}

struct EspNetwork;

impl Network for EspNetwork {
    type Session = EspSession;

    fn is_connected(&self) -> bool {
        is_wifi_station_connected()
    }

    fn open_session(&self) -> EspSession {
        let client = EspHttpConnection::new(&http_configuration())
            .map(HttpClient::wrap)
            .map_err(|err| warn!("failed to open http connection: {err:?}"))
            .ok();
        EspSession { client }
    }
}

fn http_configuration() -> HttpClientConfiguration {
    HttpClientConfiguration {
        timeout: Some(HTTP_TIMEOUT),
        follow_redirects_policy: FollowRedirectsPolicy::FollowNone,
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    }
}

fn is_http_url(url: &str) -> bool {
    ["http://", "https://"].iter().any(|scheme| {
        url.strip_prefix(scheme)
            .is_some_and(|rest| !rest.is_empty() && !rest.starts_with('/'))
    })
}

struct EspSession {
    client: Option<HttpClient<EspHttpConnection>>,
}

impl HttpSession for EspSession {
    fn get(&mut self, url: &str) -> Result<HttpResponse, ErrorKind> {
        if !is_http_url(url) {
            return Err(ErrorKind::MalformedUrl);
        }
        let Some(client) = self.client.as_mut() else {
            return Ok(HttpResponse::transport_failure(TRANSPORT_CONNECTION_REFUSED));
        };
        let request = match client.request(Method::Get, url, &[]) {
            Ok(request) => request,
            Err(err) => {
                warn!("GET {url} failed: {err:?}");
                return Ok(HttpResponse::transport_failure(TRANSPORT_CONNECTION_REFUSED));
            }
        };
        let mut response = match request.submit() {
            Ok(response) => response,
            Err(err) => {
                warn!("GET {url} failed: {err:?}");
                return Ok(HttpResponse::transport_failure(TRANSPORT_CONNECTION_LOST));
            }
        };

        let status = i32::from(response.status());
        let mut body = Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            match response.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) if body.len() + read <= MAX_HTTP_BODY => {
                    body.extend_from_slice(&chunk[..read]);
                }
                Ok(_) => {
                    warn!("response from {url} exceeds {MAX_HTTP_BODY} bytes");
                    return Ok(HttpResponse::transport_failure(TRANSPORT_CONNECTION_LOST));
                }
                Err(err) => {
                    warn!("reading {url} failed: {err:?}");
                    return Ok(HttpResponse::transport_failure(TRANSPORT_CONNECTION_LOST));
                }
            }
        }
        Ok(HttpResponse { status, body })
    }
}

struct EspOtaInstaller;

impl EspOtaInstaller {
    fn flash(url: &str) -> Result<(u64, String), InstallFailure> {
        let connection = EspHttpConnection::new(&http_configuration())
            .map_err(|err| InstallFailure::new(TRANSPORT_CONNECTION_REFUSED, format!("{err:?}")))?;
        let mut client = HttpClient::wrap(connection);
        let request = client
            .request(Method::Get, url, &[])
            .map_err(|err| InstallFailure::new(TRANSPORT_CONNECTION_REFUSED, format!("{err:?}")))?;
        let mut response = request
            .submit()
            .map_err(|err| InstallFailure::new(TRANSPORT_CONNECTION_LOST, format!("{err:?}")))?;

        let status = i32::from(response.status());
        if status != 200 {
            return Err(InstallFailure::for_status(status));
        }

        let mut ota = EspOta::new()
            .map_err(|err| InstallFailure::new(INSTALL_NO_PARTITION, format!("{err:?}")))?;
        let mut update = ota
            .initiate_update()
            .map_err(|err| InstallFailure::new(INSTALL_NO_PARTITION, format!("{err:?}")))?;

        let mut hasher = Sha256::new();
        let mut total_written = 0_u64;
        let mut chunk = [0_u8; OTA_CHUNK_SIZE];
        loop {
            let read = response
                .read(&mut chunk)
                .map_err(|err| InstallFailure::new(TRANSPORT_CONNECTION_LOST, format!("{err:?}")))?;
            if read == 0 {
                break;
            }
            update.write(&chunk[..read]).map_err(|err| {
                InstallFailure::new(INSTALL_TOO_LESS_SPACE, format!("write failed: {err:?}"))
            })?;
            hasher.update(&chunk[..read]);
            total_written = total_written.saturating_add(read as u64);
        }

        if total_written == 0 {
            return Err(InstallFailure::new(INSTALL_NO_SIZE, "empty firmware image"));
        }

        let mut digest_hex = String::with_capacity(64);
        for byte in hasher.finalize() {
            use core::fmt::Write as _;
            let _ = write!(&mut digest_hex, "{byte:02x}");
        }

        update.complete().map_err(|err| {
            InstallFailure::new(INSTALL_TOO_LESS_SPACE, format!("finalize failed: {err:?}"))
        })?;
        Ok((total_written, digest_hex))
    }
}

impl FirmwareInstaller for EspOtaInstaller {
    fn install(&mut self, url: &str) -> Result<Infallible, InstallFailure> {
        let (written, digest) = Self::flash(url)?;
        info!("flashed {written} bytes (sha256 {digest}); rebooting");
        restart_device()
    }
}

struct EspRestarter;

impl Restarter for EspRestarter {
    fn restart(&mut self) -> ! {
        restart_device()
    }
}

fn restart_device() -> ! {
    thread::sleep(Duration::from_millis(100));
    esp_idf_hal::reset::restart()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}
