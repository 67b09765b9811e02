use std::{
    convert::Infallible,
    ops::{Deref, DerefMut},
};

use crate::error::ErrorKind;

pub trait FileStore {
    fn mount(&mut self) -> Result<(), ErrorKind>;
    fn unmount(&mut self);
    fn exists(&self, path: &str) -> bool;
    fn size(&self, path: &str) -> Result<u64, ErrorKind>;
    fn read(&self, path: &str) -> Result<Vec<u8>, ErrorKind>;
    fn write(&mut self, path: &str, contents: &[u8]) -> Result<usize, ErrorKind>;
    fn list(&self) -> Vec<(String, u64)>;
}

pub struct Mounted<'a, S: FileStore + ?Sized> {
    store: &'a mut S,
}

impl<'a, S: FileStore + ?Sized> Mounted<'a, S> {
    pub fn new(store: &'a mut S) -> Result<Self, ErrorKind> {
        store.mount()?;
        Ok(Self { store })
    }
}

impl<S: FileStore + ?Sized> Deref for Mounted<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.store
    }
}

impl<S: FileStore + ?Sized> DerefMut for Mounted<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.store
    }
}

impl<S: FileStore + ?Sized> Drop for Mounted<'_, S> {
    fn drop(&mut self) {
        self.store.unmount();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: i32,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn transport_failure(code: i32) -> Self {
        Self {
            status: code,
            body: Vec::new(),
        }
    }
}

// One client connection. Connection and redirect state stay inside a
// session, so a session must only ever talk to a single server root.
pub trait HttpSession {
    fn get(&mut self, url: &str) -> Result<HttpResponse, ErrorKind>;
}

pub trait Network {
    type Session: HttpSession;

    fn is_connected(&self) -> bool;
    fn open_session(&self) -> Self::Session;
}

pub const INSTALL_TOO_LESS_SPACE: i32 = -100;
pub const INSTALL_NO_SIZE: i32 = -101;
pub const INSTALL_FILE_NOT_FOUND: i32 = -102;
pub const INSTALL_FORBIDDEN: i32 = -103;
pub const INSTALL_WRONG_HTTP_CODE: i32 = -104;
pub const INSTALL_NO_PARTITION: i32 = -108;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallFailure {
    pub code: i32,
    pub message: String,
}

impl InstallFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn for_status(status: i32) -> Self {
        match status {
            404 => Self::new(INSTALL_FILE_NOT_FOUND, "File Not Found (404)"),
            403 => Self::new(INSTALL_FORBIDDEN, "Forbidden (403)"),
            code if code <= 0 => Self::new(code, "connection failed"),
            code => Self::new(INSTALL_WRONG_HTTP_CODE, format!("Wrong HTTP Code ({code})")),
        }
    }
}

pub trait FirmwareInstaller {
    // Streams the image at `url` into the update slot and reboots into it.
    // Returns only on failure.
    fn install(&mut self, url: &str) -> Result<Infallible, InstallFailure>;
}

pub trait Restarter {
    fn restart(&mut self) -> !;
}

pub trait StatusSink {
    fn publish(&mut self, topic: &str, payload: &str);
}
