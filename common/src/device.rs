use log::{info, warn};

use crate::{
    command::{dispatch, CommandAction, RemoteCommand},
    config::NodeSettings,
    downloader::ArtifactDownloader,
    error::ErrorKind,
    io::{FileStore, FirmwareInstaller, Network, Restarter, StatusSink},
    locator::ArtifactLocator,
    manager::ConfigManager,
    ota::UpdateOrchestrator,
    retry::UpdateSchedule,
    status::{describe, StatusMessage},
};

pub struct Device<S, N, I, R>
where
    S: FileStore,
    N: Network,
    I: FirmwareInstaller,
    R: Restarter,
{
    config: ConfigManager,
    store: S,
    network: N,
    installer: I,
    restarter: R,
    locator: ArtifactLocator,
    schedule: UpdateSchedule,
    provisioned: bool,
}

impl<S, N, I, R> Device<S, N, I, R>
where
    S: FileStore,
    N: Network,
    I: FirmwareInstaller,
    R: Restarter,
{
    pub fn new(
        settings: NodeSettings,
        mac: String,
        store: S,
        network: N,
        installer: I,
        restarter: R,
    ) -> Self {
        Self {
            config: ConfigManager::new(settings, mac),
            store,
            network,
            installer,
            restarter,
            locator: ArtifactLocator::new(),
            schedule: UpdateSchedule::default(),
            provisioned: false,
        }
    }

    pub fn with_schedule(mut self, schedule: UpdateSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn config(&self) -> &ConfigManager {
        &self.config
    }

    pub fn schedule(&self) -> &UpdateSchedule {
        &self.schedule
    }

    pub fn is_provisioned(&self) -> bool {
        self.provisioned
    }

    pub fn boot(&mut self) -> bool {
        self.provisioned = self.config.init(&mut self.store);
        if !self.provisioned {
            let reason = self
                .config
                .provisioning_error()
                .map_or_else(|| "unknown".to_string(), describe);
            warn!("secure pathway disabled ({reason}); send CER to provision");
        }
        self.provisioned
    }

    pub fn tick(&mut self, now_ms: u64, sink: &mut dyn StatusSink) {
        if self.schedule.is_due(now_ms) {
            self.check_for_updates(now_ms, sink);
        }
    }

    pub fn handle_message(
        &mut self,
        payload: &[u8],
        now_ms: u64,
        sink: &mut dyn StatusSink,
    ) -> Vec<CommandAction> {
        let command = match RemoteCommand::parse(payload) {
            Ok(command) => command,
            Err(err) => {
                warn!("ignoring command payload: {err}");
                return Vec::new();
            }
        };
        info!("command: {command:?}");

        let mut transport = Vec::new();
        for action in dispatch(command, &mut self.config) {
            match action {
                CommandAction::Publish(message) => self.publish(sink, &message),
                CommandAction::CheckForUpdates => self.check_for_updates(now_ms, sink),
                CommandAction::ProvisionCertificates => self.provision_certificates(sink),
                CommandAction::Reboot => {
                    info!("rebooting on request");
                    self.restarter.restart()
                }
                resubscribe @ CommandAction::Resubscribe { .. } => transport.push(resubscribe),
            }
        }
        transport
    }

    fn publish(&self, sink: &mut dyn StatusSink, message: &StatusMessage) {
        sink.publish(&self.config.topics().publish, &message.to_json());
    }

    fn check_for_updates(&mut self, now_ms: u64, sink: &mut dyn StatusSink) {
        let topic = self.config.topics().publish.clone();
        if !self.provisioned {
            let err = self
                .config
                .provisioning_error()
                .cloned()
                .unwrap_or(ErrorKind::CertificateMissing);
            warn!("firmware check refused: {err}");
            sink.publish(
                &topic,
                &StatusMessage::failure("Firmware update failed", &err).to_json(),
            );
            self.schedule.record_failure(now_ms);
            return;
        }

        let settings = self.config.settings();
        let mut orchestrator =
            UpdateOrchestrator::new(&self.network, &mut self.installer, &mut self.locator);
        match orchestrator.check_and_update(settings, &topic, sink) {
            Ok(never) => match never {},
            Err(ErrorKind::NoUpdateAvailable) => self.schedule.record_success(now_ms),
            Err(err) => {
                warn!("firmware update run failed: {err}");
                self.schedule.record_failure(now_ms);
            }
        }
    }

    fn provision_certificates(&mut self, sink: &mut dyn StatusSink) {
        let topic = self.config.topics().publish.clone();
        let downloader = ArtifactDownloader::new(&self.network);
        let outcome = downloader.download_certificates(
            &mut self.store,
            self.config.settings(),
            &mut self.locator,
            &topic,
            sink,
        );

        let failure = match outcome {
            Ok(report) if report.all_saved() => {
                info!(
                    "certificate bundle version {} saved; restarting",
                    report.available_version
                );
                self.publish(sink, &StatusMessage::info("TLS certificates updated."));
                self.restarter.restart()
            }
            Ok(report) => report
                .failures()
                .map(|(name, err)| format!("{name} {}", describe(err)))
                .collect::<Vec<_>>()
                .join(", "),
            Err(err) => describe(&err),
        };

        warn!("certificate provisioning failed: {failure}");
        self.publish(
            sink,
            &StatusMessage::info(format!("TLS certificates failed: {failure}")),
        );
    }
}
