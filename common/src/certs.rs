use log::{info, warn};

use crate::{
    config::{defaults, ConfigOverride},
    error::ErrorKind,
    io::{FileStore, Mounted},
};

pub const CERT_VERSION_FILE: &str = "certversion.txt";
pub const CONFIG_FILE: &str = "/config.txt";

// Download order matters: the config override is always index 0.
pub const BUNDLE_FILES: [&str; 4] = [CONFIG_FILE, "/ca.der", "/cert.der", "/private.der"];

pub fn mandatory_files() -> &'static [&'static str] {
    &BUNDLE_FILES[1..]
}

pub struct CertificateStore<'a, S: FileStore + ?Sized> {
    store: &'a mut S,
}

impl<'a, S: FileStore + ?Sized> CertificateStore<'a, S> {
    pub fn new(store: &'a mut S) -> Self {
        Self { store }
    }

    pub fn is_provisioned(&mut self) -> bool {
        self.verify().is_ok()
    }

    pub fn verify(&mut self) -> Result<(), ErrorKind> {
        let store = Mounted::new(&mut *self.store)?;
        for name in mandatory_files() {
            if !store.exists(name) {
                warn!("tls certificate file missing: {name}");
                return Err(ErrorKind::CertificateMissing);
            }
        }
        info!("tls certificate files present");
        Ok(())
    }

    pub fn load_overrides(&mut self) -> Result<Option<ConfigOverride>, ErrorKind> {
        let store = Mounted::new(&mut *self.store)?;
        if !store.exists(CONFIG_FILE) {
            info!("no config override file; using compiled defaults");
            return Ok(None);
        }

        let size = store.size(CONFIG_FILE)?;
        if size > defaults::CONFIG_FILE_SIZE {
            warn!(
                "config override file is {size} bytes (limit {})",
                defaults::CONFIG_FILE_SIZE
            );
            return Err(ErrorKind::FileTooLarge);
        }

        let raw = store.read(CONFIG_FILE)?;
        let overrides = ConfigOverride::from_json(&raw).map_err(|err| {
            warn!("failed to parse config override file");
            err
        })?;
        info!("config override file loaded ({size} bytes)");
        Ok(Some(overrides))
    }
}
