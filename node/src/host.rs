use std::{
    convert::Infallible,
    fs,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::Utc;
use reqwest::{
    blocking::{Client, Response},
    redirect::Policy,
    Url,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use relaynode_common::{
    config::defaults,
    error::{
        HTTP_OK, TRANSPORT_CONNECTION_LOST, TRANSPORT_CONNECTION_REFUSED, TRANSPORT_READ_TIMEOUT,
    },
    format_mac,
    io::INSTALL_NO_SIZE,
    locator::Source,
    CommandAction, Device, ErrorKind, FileStore, FirmwareInstaller, HttpResponse, HttpSession,
    InstallFailure, Network, NodeSettings, Restarter, StatusSink, Topics,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const STAGED_IMAGE: &str = "firmware.bin";
const STAGED_MANIFEST: &str = "staged.json";

type HostDevice = Device<DirStore, HttpNetwork, StagingInstaller, ExitRestarter>;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = PathBuf::from(
        std::env::var("NODE_DATA_DIR").unwrap_or_else(|_| "./.relaynode".to_string()),
    );
    let mac = std::env::var("NODE_MAC")
        .map(|mac| mac.to_ascii_uppercase())
        .unwrap_or_else(|_| host_mac());

    let mut device = Device::new(
        settings_from_env(),
        mac.clone(),
        DirStore::new(data_dir.join("spiffs")),
        HttpNetwork,
        StagingInstaller::new(data_dir.join("ota")),
        ExitRestarter,
    );
    let provisioned = device.boot();
    info!(
        "node {mac} booted at {} (firmware {}, provisioned: {provisioned})",
        Utc::now().to_rfc3339(),
        device.config().settings().firmware_version
    );

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new(format!("relaynode-{mac}"), mqtt_host, mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    let topics = Arc::new(Mutex::new(device.config().topics().clone()));
    let (command_tx, command_rx) = mpsc::channel();

    spawn_mqtt_loop(mqtt.clone(), eventloop, topics.clone(), command_tx);
    spawn_device_loop(device, mqtt, topics, command_rx)?;

    info!("relay node started");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    Ok(())
}

fn settings_from_env() -> NodeSettings {
    let mut settings = NodeSettings::default();
    let prefixes = [
        ("NODE_OTA_PRIMARY", Source::Primary, false),
        ("NODE_OTA_SECONDARY", Source::Secondary, false),
        ("NODE_CERT_PRIMARY", Source::Primary, true),
        ("NODE_CERT_SECONDARY", Source::Secondary, true),
    ];
    for (var, source, certificates) in prefixes {
        let Ok(prefix) = std::env::var(var) else {
            continue;
        };
        let endpoint = if certificates {
            &mut settings.certificates
        } else {
            &mut settings.firmware
        };
        endpoint.set_prefix(source, &prefix);
    }
    if let Some(version) = std::env::var("NODE_FW_VERSION")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
    {
        settings.firmware_version = version;
    }
    settings
}

fn host_mac() -> String {
    let seed = std::env::var("HOSTNAME").unwrap_or_else(|_| "relaynode".to_string());
    let digest = Sha256::digest(seed.as_bytes());
    format_mac([0x02, digest[0], digest[1], digest[2], digest[3], digest[4]])
}

fn current_topics(topics: &Mutex<Topics>) -> Topics {
    topics
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn subscribe_all(mqtt: &AsyncClient, topics: &Topics) {
    for topic in topics.subscriptions() {
        if let Err(err) = mqtt.try_subscribe(topic, QoS::AtLeastOnce) {
            warn!("failed to subscribe to {topic}: {err}");
        }
    }
}

fn spawn_mqtt_loop(
    mqtt: AsyncClient,
    mut eventloop: EventLoop,
    topics: Arc<Mutex<Topics>>,
    command_tx: Sender<Vec<u8>>,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    debug!("command on {}", publish.topic);
                    if command_tx.send(publish.payload.to_vec()).is_err() {
                        warn!("device loop is gone; dropping command");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    let topics = current_topics(&topics);
                    info!("mqtt connected; subscribing to {}", topics.subscribe);
                    subscribe_all(&mqtt, &topics);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

// The device runs blocking HTTP, so it lives on its own thread and is fed
// commands over a channel.
fn spawn_device_loop(
    mut device: HostDevice,
    mqtt: AsyncClient,
    topics: Arc<Mutex<Topics>>,
    command_rx: Receiver<Vec<u8>>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("device".to_string())
        .spawn(move || {
            let mut sink = MqttSink {
                client: mqtt.clone(),
            };
            let tick = Duration::from_millis(defaults::CHECK_INTERVAL_MS);
            loop {
                match command_rx.recv_timeout(tick) {
                    Ok(payload) => {
                        let actions = device.handle_message(&payload, monotonic_ms(), &mut sink);
                        for action in actions {
                            if let CommandAction::Resubscribe { old, new } = action {
                                resubscribe(&mqtt, &topics, &old, new);
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        warn!("command channel closed; device loop stopping");
                        return;
                    }
                }
                device.tick(monotonic_ms(), &mut sink);
            }
        })
        .context("failed to spawn device thread")?;
    Ok(())
}

fn resubscribe(mqtt: &AsyncClient, shared: &Mutex<Topics>, old: &Topics, new: Topics) {
    for topic in old.subscriptions() {
        if let Err(err) = mqtt.try_unsubscribe(topic) {
            warn!("failed to unsubscribe from {topic}: {err}");
        }
    }
    subscribe_all(mqtt, &new);
    info!("resubscribed to {}", new.subscribe);
    *shared.lock().unwrap_or_else(PoisonError::into_inner) = new;
}

struct MqttSink {
    client: AsyncClient,
}

impl StatusSink for MqttSink {
    fn publish(&mut self, topic: &str, payload: &str) {
        if let Err(err) = self
            .client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
        {
            warn!("failed to publish status to {topic}: {err}");
        }
    }
}

struct DirStore {
    root: PathBuf,
    mounted: bool,
}

impl DirStore {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            mounted: false,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name.trim_start_matches('/'))
    }

    fn ensure_mounted(&self) -> Result<(), ErrorKind> {
        if self.mounted {
            Ok(())
        } else {
            Err(ErrorKind::StorageUnavailable)
        }
    }
}

impl FileStore for DirStore {
    fn mount(&mut self) -> Result<(), ErrorKind> {
        fs::create_dir_all(&self.root).map_err(|err| {
            warn!("failed to mount store at {}: {err}", self.root.display());
            ErrorKind::StorageUnavailable
        })?;
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self) {
        self.mounted = false;
    }

    fn exists(&self, path: &str) -> bool {
        self.mounted && self.path(path).is_file()
    }

    fn size(&self, path: &str) -> Result<u64, ErrorKind> {
        self.ensure_mounted()?;
        fs::metadata(self.path(path))
            .map(|meta| meta.len())
            .map_err(|_| ErrorKind::FileOpenError)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, ErrorKind> {
        self.ensure_mounted()?;
        fs::read(self.path(path)).map_err(|_| ErrorKind::FileOpenError)
    }

    fn write(&mut self, path: &str, contents: &[u8]) -> Result<usize, ErrorKind> {
        self.ensure_mounted()?;
        let target = self.path(path);
        let partial = self
            .root
            .join(format!(".{}.part", path.trim_start_matches('/')));
        write_atomic(&partial, &target, contents).map_err(|err| {
            warn!("failed to write {}: {err:#}", target.display());
            ErrorKind::FileWriteError
        })?;
        Ok(contents.len())
    }

    fn list(&self) -> Vec<(String, u64)> {
        if !self.mounted {
            return Vec::new();
        }
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut files: Vec<_> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let meta = entry.metadata().ok()?;
                (meta.is_file() && !name.starts_with('.'))
                    .then(|| (format!("/{name}"), meta.len()))
            })
            .collect();
        files.sort();
        files
    }
}

fn write_atomic(partial: &Path, target: &Path, contents: &[u8]) -> anyhow::Result<()> {
    fs::write(partial, contents)
        .with_context(|| format!("failed to write {}", partial.display()))?;
    fs::rename(partial, target)
        .with_context(|| format!("failed to move into {}", target.display()))
}

#[derive(Debug, Clone, Copy)]
struct HttpNetwork;

impl Network for HttpNetwork {
    type Session = HttpClientSession;

    fn is_connected(&self) -> bool {
        true
    }

    fn open_session(&self) -> HttpClientSession {
        HttpClientSession::new()
    }
}

struct HttpClientSession {
    client: Option<Client>,
}

impl HttpClientSession {
    fn new() -> Self {
        let client = build_client()
            .map_err(|err| warn!("failed to build http client: {err}"))
            .ok();
        Self { client }
    }
}

impl HttpSession for HttpClientSession {
    fn get(&mut self, url: &str) -> Result<HttpResponse, ErrorKind> {
        let url = Url::parse(url).map_err(|_| ErrorKind::MalformedUrl)?;
        let Some(client) = &self.client else {
            return Ok(HttpResponse::transport_failure(TRANSPORT_CONNECTION_REFUSED));
        };
        let response = match client.get(url.clone()).send() {
            Ok(response) => response,
            Err(err) => {
                warn!("GET {url} failed: {err}");
                return Ok(HttpResponse::transport_failure(transport_code(&err)));
            }
        };
        let status = status_code(&response);
        match response.bytes() {
            Ok(body) => Ok(HttpResponse {
                status,
                body: body.to_vec(),
            }),
            Err(err) => {
                warn!("reading {url} failed: {err}");
                Ok(HttpResponse::transport_failure(transport_code(&err)))
            }
        }
    }
}

// Redirects are reported, not followed.
fn build_client() -> reqwest::Result<Client> {
    Client::builder()
        .redirect(Policy::none())
        .timeout(HTTP_TIMEOUT)
        .build()
}

fn status_code(response: &Response) -> i32 {
    i32::from(response.status().as_u16())
}

fn transport_code(err: &reqwest::Error) -> i32 {
    if err.is_timeout() {
        TRANSPORT_READ_TIMEOUT
    } else if err.is_connect() {
        TRANSPORT_CONNECTION_REFUSED
    } else {
        TRANSPORT_CONNECTION_LOST
    }
}

struct StagingInstaller {
    dir: PathBuf,
}

impl StagingInstaller {
    fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn stage(&self, url: &str) -> Result<PathBuf, InstallFailure> {
        let url = Url::parse(url).map_err(|err| {
            InstallFailure::new(TRANSPORT_CONNECTION_REFUSED, format!("bad url: {err}"))
        })?;
        let client = build_client()
            .map_err(|err| InstallFailure::new(TRANSPORT_CONNECTION_REFUSED, err.to_string()))?;
        let response = client
            .get(url.clone())
            .send()
            .map_err(|err| InstallFailure::new(transport_code(&err), err.to_string()))?;
        let status = status_code(&response);
        if status != HTTP_OK {
            return Err(InstallFailure::for_status(status));
        }
        let image = response
            .bytes()
            .map_err(|err| InstallFailure::new(transport_code(&err), err.to_string()))?;
        if image.is_empty() {
            return Err(InstallFailure::new(INSTALL_NO_SIZE, "empty firmware image"));
        }

        let sha256 = hex_digest(&image);
        let image_path = self.dir.join(STAGED_IMAGE);
        let manifest = serde_json::json!({
            "url": url.as_str(),
            "bytes": image.len(),
            "sha256": sha256,
            "staged_at": Utc::now().to_rfc3339(),
        });
        self.persist(&image_path, &image, &manifest)
            .map_err(|err| InstallFailure::new(INSTALL_NO_SIZE, format!("{err:#}")))?;
        info!("staged {} bytes (sha256 {sha256})", image.len());
        Ok(image_path)
    }

    fn persist(
        &self,
        image_path: &Path,
        image: &[u8],
        manifest: &serde_json::Value,
    ) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        write_atomic(&self.dir.join(".firmware.part"), image_path, image)?;
        let manifest = serde_json::to_vec_pretty(manifest).context("failed to encode manifest")?;
        write_atomic(
            &self.dir.join(".staged.part"),
            &self.dir.join(STAGED_MANIFEST),
            &manifest,
        )
    }
}

impl FirmwareInstaller for StagingInstaller {
    fn install(&mut self, url: &str) -> Result<Infallible, InstallFailure> {
        let staged = self.stage(url)?;
        info!("new firmware at {}; restarting", staged.display());
        restart_process()
    }
}

struct ExitRestarter;

impl Restarter for ExitRestarter {
    fn restart(&mut self) -> ! {
        restart_process()
    }
}

fn restart_process() -> ! {
    info!("restarting process");
    std::process::exit(0)
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}
