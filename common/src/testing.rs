use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap, HashSet},
    convert::Infallible,
    panic::{catch_unwind, AssertUnwindSafe},
    rc::Rc,
};

use crate::{
    error::{ErrorKind, HTTP_OK},
    io::{
        FileStore, FirmwareInstaller, HttpResponse, HttpSession, InstallFailure, Network,
        Restarter, StatusSink,
    },
};

#[derive(Debug)]
pub struct Rebooted;

pub fn ends_in_reboot<F: FnOnce()>(f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => false,
        Err(payload) => {
            if payload.downcast_ref::<Rebooted>().is_some() {
                true
            } else {
                std::panic::resume_unwind(payload)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    pub files: BTreeMap<String, Vec<u8>>,
    pub unmountable: bool,
    pub mounted: bool,
    pub mounts: usize,
    pub unmounts: usize,
    pub failing_writes: HashSet<String>,
    pub empty_writes: HashSet<String>,
}

impl MemoryStore {
    pub fn provisioned() -> Self {
        let mut store = Self::default();
        for name in ["/ca.der", "/cert.der", "/private.der"] {
            store.files.insert(name.to_string(), vec![0x30, 0x82, 0x01]);
        }
        store
    }

    pub fn with_file(mut self, path: &str, contents: &[u8]) -> Self {
        self.files.insert(path.to_string(), contents.to_vec());
        self
    }
}

impl FileStore for MemoryStore {
    fn mount(&mut self) -> Result<(), ErrorKind> {
        if self.unmountable {
            return Err(ErrorKind::StorageUnavailable);
        }
        assert!(!self.mounted, "store mounted twice");
        self.mounted = true;
        self.mounts += 1;
        Ok(())
    }

    fn unmount(&mut self) {
        self.mounted = false;
        self.unmounts += 1;
    }

    fn exists(&self, path: &str) -> bool {
        assert!(self.mounted, "store accessed while unmounted");
        self.files.contains_key(path)
    }

    fn size(&self, path: &str) -> Result<u64, ErrorKind> {
        assert!(self.mounted, "store accessed while unmounted");
        self.files
            .get(path)
            .map(|contents| contents.len() as u64)
            .ok_or(ErrorKind::FileOpenError)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, ErrorKind> {
        assert!(self.mounted, "store accessed while unmounted");
        self.files.get(path).cloned().ok_or(ErrorKind::FileOpenError)
    }

    fn write(&mut self, path: &str, contents: &[u8]) -> Result<usize, ErrorKind> {
        assert!(self.mounted, "store accessed while unmounted");
        if self.failing_writes.contains(path) {
            return Err(ErrorKind::FileOpenError);
        }
        if self.empty_writes.contains(path) {
            return Ok(0);
        }
        self.files.insert(path.to_string(), contents.to_vec());
        Ok(contents.len())
    }

    fn list(&self) -> Vec<(String, u64)> {
        self.files
            .iter()
            .map(|(name, contents)| (name.clone(), contents.len() as u64))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct NetworkLog {
    pub sessions: usize,
    pub requests: Vec<(usize, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedNetwork {
    pub offline: bool,
    routes: Rc<RefCell<HashMap<String, HttpResponse>>>,
    log: Rc<RefCell<NetworkLog>>,
}

impl ScriptedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    pub fn serve(self, url: &str, status: i32, body: &str) -> Self {
        self.routes.borrow_mut().insert(
            url.to_string(),
            HttpResponse {
                status,
                body: body.as_bytes().to_vec(),
            },
        );
        self
    }

    pub fn serve_ok(self, url: &str, body: &str) -> Self {
        self.serve(url, HTTP_OK, body)
    }

    pub fn requests(&self) -> Vec<String> {
        self.log
            .borrow()
            .requests
            .iter()
            .map(|(_, url)| url.clone())
            .collect()
    }

    pub fn request_sessions(&self) -> Vec<usize> {
        self.log
            .borrow()
            .requests
            .iter()
            .map(|(session, _)| *session)
            .collect()
    }
}

pub struct ScriptedSession {
    id: usize,
    routes: Rc<RefCell<HashMap<String, HttpResponse>>>,
    log: Rc<RefCell<NetworkLog>>,
}

impl HttpSession for ScriptedSession {
    fn get(&mut self, url: &str) -> Result<HttpResponse, ErrorKind> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ErrorKind::MalformedUrl);
        }
        let path = url.split_once('?').map_or(url, |(path, _)| path);
        self.log
            .borrow_mut()
            .requests
            .push((self.id, path.to_string()));
        Ok(self
            .routes
            .borrow()
            .get(path)
            .cloned()
            .unwrap_or(HttpResponse {
                status: 404,
                body: Vec::new(),
            }))
    }
}

impl Network for ScriptedNetwork {
    type Session = ScriptedSession;

    fn is_connected(&self) -> bool {
        !self.offline
    }

    fn open_session(&self) -> ScriptedSession {
        let mut log = self.log.borrow_mut();
        log.sessions += 1;
        ScriptedSession {
            id: log.sessions,
            routes: self.routes.clone(),
            log: self.log.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub messages: Vec<(String, String)>,
}

impl RecordingSink {
    pub fn payloads(&self) -> Vec<&str> {
        self.messages
            .iter()
            .map(|(_, payload)| payload.as_str())
            .collect()
    }
}

impl StatusSink for RecordingSink {
    fn publish(&mut self, topic: &str, payload: &str) {
        self.messages.push((topic.to_string(), payload.to_string()));
    }
}

#[derive(Debug, Default)]
pub struct FakeInstaller {
    pub failure: Option<InstallFailure>,
    pub urls: Vec<String>,
}

impl FakeInstaller {
    pub fn failing(code: i32, message: &str) -> Self {
        Self {
            failure: Some(InstallFailure {
                code,
                message: message.to_string(),
            }),
            urls: Vec::new(),
        }
    }
}

impl FirmwareInstaller for FakeInstaller {
    fn install(&mut self, url: &str) -> Result<Infallible, InstallFailure> {
        self.urls.push(url.to_string());
        match &self.failure {
            Some(failure) => Err(failure.clone()),
            None => std::panic::panic_any(Rebooted),
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeRestarter;

impl Restarter for FakeRestarter {
    fn restart(&mut self) -> ! {
        std::panic::panic_any(Rebooted)
    }
}
