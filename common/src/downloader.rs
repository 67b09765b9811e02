use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use crate::{
    certs::{BUNDLE_FILES, CONFIG_FILE},
    config::NodeSettings,
    error::{classify_status, ErrorKind},
    failover::{parse_version, Negotiated, Negotiation, VersionStatus},
    io::{FileStore, HttpSession, Mounted, Network, StatusSink},
    locator::{ArtifactKind, ArtifactLocator, ArtifactUrl, Source},
    status::StatusMessage,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileResult {
    pub name: String,
    pub outcome: Result<usize, ErrorKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub source: Source,
    pub available_version: i64,
    pub files: Vec<FileResult>,
}

impl DownloadReport {
    pub fn all_saved(&self) -> bool {
        self.files.iter().all(|file| file.outcome.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &ErrorKind)> {
        self.files.iter().filter_map(|file| match &file.outcome {
            Ok(_) => None,
            Err(err) => Some((file.name.as_str(), err)),
        })
    }
}

pub struct ArtifactDownloader<'n, N: Network> {
    network: &'n N,
}

impl<'n, N: Network> ArtifactDownloader<'n, N> {
    pub fn new(network: &'n N) -> Self {
        Self { network }
    }

    pub fn fetch(session: &mut N::Session, url: &str) -> Result<Vec<u8>, ErrorKind> {
        debug!("GET {url}");
        let response = session.get(url)?;
        classify_status(response.status)?;
        Ok(response.body)
    }

    pub fn check_version(
        &self,
        url: &ArtifactUrl,
        current: i64,
    ) -> Result<VersionStatus, ErrorKind> {
        let mut session = self.network.open_session();
        let body = Self::fetch(&mut session, url.as_str())?;
        let available = parse_version(&body);
        info!("version check {url}: current {current}, available {available}");
        Ok(VersionStatus::compare(current, available))
    }

    pub fn save_all<S: FileStore + ?Sized>(
        &self,
        store: &mut S,
        server_root: &str,
        files: &[&str],
        locator: &mut ArtifactLocator,
    ) -> Result<Vec<FileResult>, ErrorKind> {
        let mut store = Mounted::new(store)?;
        let mut session = self.network.open_session();

        let results: Vec<FileResult> = files
            .iter()
            .map(|name| {
                let url = locator.url(server_root, name, ArtifactKind::Certificate);
                let outcome = Self::fetch(&mut session, url.as_str())
                    .and_then(|body| write_file(&mut *store, name, &body));
                match &outcome {
                    Ok(bytes) => info!("saved {name} ({bytes} bytes)"),
                    Err(err) => warn!("failed to save {name}: {err}"),
                }
                FileResult {
                    name: name.to_string(),
                    outcome,
                }
            })
            .collect();

        log_listing(&*store);
        Ok(results)
    }

    pub fn download_certificates<S: FileStore + ?Sized>(
        &self,
        store: &mut S,
        settings: &NodeSettings,
        locator: &mut ArtifactLocator,
        topic: &str,
        sink: &mut dyn StatusSink,
    ) -> Result<DownloadReport, ErrorKind> {
        if !self.network.is_connected() {
            warn!("no network; certificate download skipped");
            return Err(ErrorKind::NoNetwork);
        }

        let endpoint = &settings.certificates;
        let mut negotiation = Negotiation::new();
        let outcome = negotiation.run(|source| {
            let url = locator.certificate_version_url(endpoint, source);
            self.check_version(&url, settings.certificate_version)
                .map_err(|err| {
                    sink.publish(topic, &StatusMessage::version_check_failed(&err).to_json());
                    err
                })
        });

        let (source, available_version) = match outcome {
            Negotiated::Proceed { source, available } => (source, available),
            Negotiated::UpToDate { .. } | Negotiated::NotNewerOnSecondary { .. } => {
                info!("device already has the latest certificates");
                return Err(ErrorKind::NoUpdateAvailable);
            }
            Negotiated::Failed { last_error } => {
                warn!("certificate version check failed on both servers: {last_error}");
                return Err(ErrorKind::VersionCheckFailed);
            }
        };

        info!(
            "downloading certificate bundle version {available_version} from the {} server",
            source.as_str()
        );
        let files = self.save_all(store, endpoint.prefix(source), &BUNDLE_FILES, locator)?;
        Ok(DownloadReport {
            source,
            available_version,
            files,
        })
    }
}

fn write_file<S: FileStore + ?Sized>(
    store: &mut S,
    name: &str,
    body: &[u8],
) -> Result<usize, ErrorKind> {
    let written = store.write(name, body)?;
    if written == 0 {
        return Err(ErrorKind::FileWriteError);
    }

    let digest = Sha256::digest(body);
    let mut digest_hex = String::with_capacity(64);
    for byte in digest {
        use core::fmt::Write as _;
        let _ = write!(&mut digest_hex, "{byte:02x}");
    }
    debug!("{name} sha256 {digest_hex}");
    Ok(written)
}

fn log_listing<S: FileStore + ?Sized>(store: &S) {
    for (name, size) in store.list() {
        info!("  {name}  {size}");
    }
    if let Ok(raw) = store.read(CONFIG_FILE) {
        info!("config file contents: {}", String::from_utf8_lossy(&raw).trim());
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{MemoryStore, RecordingSink, ScriptedNetwork};

    const CERT1: &str = "http://cert.one/c1";
    const CERT2: &str = "http://cert.two/c2";
    const TOPIC: &str = "Myorg/bath/status/Grpid/AABBCCDDEEFF";

    fn settings() -> NodeSettings {
        let mut settings = NodeSettings::default();
        settings.certificates = crate::locator::ServerEndpoint::new(CERT1, CERT2);
        settings.certificate_version = 2;
        settings
    }

    fn serve_bundle(network: ScriptedNetwork, root: &str) -> ScriptedNetwork {
        network
            .serve_ok(&format!("{root}/config.txt"), r#"{"GRP":"G2"}"#)
            .serve_ok(&format!("{root}/ca.der"), "ca")
            .serve_ok(&format!("{root}/cert.der"), "cert")
            .serve_ok(&format!("{root}/private.der"), "key")
    }

    #[test]
    fn fetch_classifies_status() {
        let network = ScriptedNetwork::new()
            .serve_ok("http://h/a", "body")
            .serve("http://h/moved", 302, "")
            .serve("http://h/down", -1, "");
        let mut session = network.open_session();

        assert_eq!(
            ArtifactDownloader::<ScriptedNetwork>::fetch(&mut session, "http://h/a?X=1"),
            Ok(b"body".to_vec())
        );
        assert_eq!(
            ArtifactDownloader::<ScriptedNetwork>::fetch(&mut session, "http://h/moved"),
            Err(ErrorKind::Redirected(302))
        );
        assert_eq!(
            ArtifactDownloader::<ScriptedNetwork>::fetch(&mut session, "http://h/down"),
            Err(ErrorKind::TransportFailure(-1))
        );
        assert_eq!(
            ArtifactDownloader::<ScriptedNetwork>::fetch(&mut session, "ftp://h/a"),
            Err(ErrorKind::MalformedUrl)
        );
    }

    #[test]
    fn save_all_attempts_every_file() {
        let network = ScriptedNetwork::new()
            .serve_ok("http://h/root/config.txt", "{}")
            .serve_ok("http://h/root/cert.der", "cert")
            .serve_ok("http://h/root/private.der", "key");
        let mut store = MemoryStore::default();
        store.empty_writes.insert("/config.txt".to_string());
        store.failing_writes.insert("/cert.der".to_string());
        let mut locator = ArtifactLocator::with_seed(5);

        let results = ArtifactDownloader::new(&network)
            .save_all(&mut store, "http://h/root", &BUNDLE_FILES, &mut locator)
            .unwrap();

        let outcomes: Vec<_> = results.iter().map(|r| r.outcome.clone()).collect();
        assert_eq!(
            outcomes,
            vec![
                Err(ErrorKind::FileWriteError),
                Err(ErrorKind::HttpFailure(404)),
                Err(ErrorKind::FileOpenError),
                Ok(3),
            ]
        );
        assert_eq!(network.requests().len(), 4);
        assert_eq!(network.request_sessions(), vec![1, 1, 1, 1]);
        assert!(!store.files.contains_key("/ca.der"));
        assert!(!store.files.contains_key("/cert.der"));
        assert_eq!(store.files["/private.der"], b"key".to_vec());
        assert!(!store.mounted);
    }

    #[test]
    fn save_all_needs_a_store() {
        let network = ScriptedNetwork::new();
        let mut store = MemoryStore {
            unmountable: true,
            ..MemoryStore::default()
        };
        let mut locator = ArtifactLocator::with_seed(5);

        let result = ArtifactDownloader::new(&network).save_all(
            &mut store,
            "http://h",
            &BUNDLE_FILES,
            &mut locator,
        );
        assert_eq!(result, Err(ErrorKind::StorageUnavailable));
        assert!(network.requests().is_empty());
    }

    #[test]
    fn certificates_from_primary() {
        let network = serve_bundle(
            ScriptedNetwork::new().serve_ok(&format!("{CERT1}/certversion.txt"), "3"),
            CERT1,
        );
        let mut store = MemoryStore::default();
        let mut locator = ArtifactLocator::with_seed(9);
        let mut sink = RecordingSink::default();

        let report = ArtifactDownloader::new(&network)
            .download_certificates(&mut store, &settings(), &mut locator, TOPIC, &mut sink)
            .unwrap();

        assert_eq!(report.source, Source::Primary);
        assert_eq!(report.available_version, 3);
        assert!(report.all_saved());
        assert_eq!(store.files.get("/cert.der").unwrap(), b"cert");
        // version check and bundle use separate sessions
        assert_eq!(network.request_sessions(), vec![1, 2, 2, 2, 2]);
    }

    #[test]
    fn certificates_fail_over_to_secondary() {
        let network = serve_bundle(
            ScriptedNetwork::new()
                .serve(&format!("{CERT1}/certversion.txt"), -11, "")
                .serve_ok(&format!("{CERT2}/certversion.txt"), "4"),
            CERT2,
        );
        let mut store = MemoryStore::default();
        let mut locator = ArtifactLocator::with_seed(9);
        let mut sink = RecordingSink::default();

        let report = ArtifactDownloader::new(&network)
            .download_certificates(&mut store, &settings(), &mut locator, TOPIC, &mut sink)
            .unwrap();

        assert_eq!(report.source, Source::Secondary);
        assert!(report.all_saved());
        assert_eq!(
            network.requests()[..2].to_vec(),
            vec![
                format!("{CERT1}/certversion.txt"),
                format!("{CERT2}/certversion.txt")
            ]
        );
        assert!(network.requests()[2..].iter().all(|url| url.starts_with(CERT2)));
    }

    #[test]
    fn certificates_not_newer() {
        let network = ScriptedNetwork::new().serve_ok(&format!("{CERT1}/certversion.txt"), "2");
        let mut store = MemoryStore::default();
        let mut locator = ArtifactLocator::with_seed(9);
        let mut sink = RecordingSink::default();

        let result = ArtifactDownloader::new(&network).download_certificates(
            &mut store,
            &settings(),
            &mut locator,
            TOPIC,
            &mut sink,
        );
        assert_eq!(result, Err(ErrorKind::NoUpdateAvailable));
        assert_eq!(network.requests().len(), 1);
        assert!(store.files.is_empty());
    }

    #[test]
    fn certificates_both_servers_down() {
        let network = ScriptedNetwork::new();
        let mut store = MemoryStore::default();
        let mut locator = ArtifactLocator::with_seed(9);
        let mut sink = RecordingSink::default();

        let result = ArtifactDownloader::new(&network).download_certificates(
            &mut store,
            &settings(),
            &mut locator,
            TOPIC,
            &mut sink,
        );
        assert_eq!(result, Err(ErrorKind::VersionCheckFailed));
        assert_eq!(network.requests().len(), 2);
        assert_eq!(
            sink.payloads(),
            vec![
                r#"{"C":"Version check failed: HTTP_ERROR (404)"}"#,
                r#"{"C":"Version check failed: HTTP_ERROR (404)"}"#,
            ]
        );
    }

    #[test]
    fn certificates_need_network() {
        let network = ScriptedNetwork::offline();
        let mut store = MemoryStore::default();
        let mut locator = ArtifactLocator::with_seed(9);
        let mut sink = RecordingSink::default();

        let result = ArtifactDownloader::new(&network).download_certificates(
            &mut store,
            &settings(),
            &mut locator,
            TOPIC,
            &mut sink,
        );
        assert_eq!(result, Err(ErrorKind::NoNetwork));
    }
}
