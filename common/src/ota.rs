use std::convert::Infallible;

use log::{info, warn};

use crate::{
    config::NodeSettings,
    downloader::ArtifactDownloader,
    error::ErrorKind,
    failover::{Negotiated, Negotiation, UpdateState},
    io::{FirmwareInstaller, Network, StatusSink},
    locator::{ArtifactLocator, Source},
    status::StatusMessage,
};

// A successful apply reboots the device, so `check_and_update` only ever
// returns an error. `Err(NoUpdateAvailable)` is the normal "up to date"
// outcome.
pub struct UpdateOrchestrator<'a, N: Network, I: FirmwareInstaller + ?Sized> {
    network: &'a N,
    installer: &'a mut I,
    locator: &'a mut ArtifactLocator,
    negotiation: Negotiation,
}

impl<'a, N: Network, I: FirmwareInstaller + ?Sized> UpdateOrchestrator<'a, N, I> {
    pub fn new(network: &'a N, installer: &'a mut I, locator: &'a mut ArtifactLocator) -> Self {
        Self {
            network,
            installer,
            locator,
            negotiation: Negotiation::new(),
        }
    }

    pub fn state(&self) -> UpdateState {
        self.negotiation.state()
    }

    pub fn history(&self) -> &[UpdateState] {
        self.negotiation.history()
    }

    pub fn check_and_update(
        &mut self,
        settings: &NodeSettings,
        topic: &str,
        sink: &mut dyn StatusSink,
    ) -> Result<Infallible, ErrorKind> {
        if !self.network.is_connected() {
            warn!("no network connection; firmware check skipped");
            return Err(report(sink, topic, ErrorKind::NoNetwork));
        }

        info!("checking for new firmware");
        self.negotiation = Negotiation::new();
        sink.publish(
            topic,
            &StatusMessage::command(format!(
                "Current firmware version: {}",
                settings.firmware_version
            ))
            .to_json(),
        );

        let source = if settings.version_check_enabled {
            self.negotiate(settings, topic, sink)?
        } else {
            self.negotiation.bypass();
            Source::Primary
        };

        self.apply(settings, source, topic, sink)
    }

    fn negotiate(
        &mut self,
        settings: &NodeSettings,
        topic: &str,
        sink: &mut dyn StatusSink,
    ) -> Result<Source, ErrorKind> {
        let downloader = ArtifactDownloader::new(self.network);
        let locator = &mut *self.locator;
        let outcome = self.negotiation.run(|source| {
            let url = locator.firmware_version_url(&settings.firmware, source, &settings.app_id);
            downloader
                .check_version(&url, settings.firmware_version)
                .map_err(|err| {
                    sink.publish(topic, &StatusMessage::version_check_failed(&err).to_json());
                    err
                })
        });

        match outcome {
            Negotiated::Proceed { source, available } => {
                info!(
                    "firmware version {available} available on the {} server",
                    source.as_str()
                );
                Ok(source)
            }
            Negotiated::UpToDate { .. } | Negotiated::NotNewerOnSecondary { .. } => {
                info!("this device already has the latest firmware");
                sink.publish(
                    topic,
                    &StatusMessage::command("No new FW updates.").to_json(),
                );
                Err(ErrorKind::NoUpdateAvailable)
            }
            Negotiated::Failed { last_error } => {
                warn!("firmware version check failed on both servers: {last_error}");
                Err(ErrorKind::VersionCheckFailed)
            }
        }
    }

    fn apply(
        &mut self,
        settings: &NodeSettings,
        source: Source,
        topic: &str,
        sink: &mut dyn StatusSink,
    ) -> Result<Infallible, ErrorKind> {
        let url = self
            .locator
            .firmware_url(&settings.firmware, source, &settings.app_id);
        info!("updating firmware from {url}");
        sink.publish(
            topic,
            &StatusMessage::command("Updating firmware..").to_json(),
        );

        self.negotiation.transition(UpdateState::Rebooting);
        let failure = match self.installer.install(url.as_str()) {
            Ok(never) => match never {},
            Err(failure) => failure,
        };

        self.negotiation.transition(UpdateState::Failed);
        warn!(
            "firmware update failed ({}): {}",
            failure.code, failure.message
        );
        let err = ErrorKind::UpdateFailed {
            code: failure.code,
            message: failure.message,
        };
        Err(report(sink, topic, err))
    }
}

fn report(sink: &mut dyn StatusSink, topic: &str, err: ErrorKind) -> ErrorKind {
    sink.publish(topic, &StatusMessage::failure("Firmware update failed", &err).to_json());
    err
}
