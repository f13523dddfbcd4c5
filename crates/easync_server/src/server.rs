//! Command dispatch.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::HandlerContext;
use crate::request::{foldersync, ping, sync};
use easync_engine::{Clock, Driver, SystemClock};
use easync_protocol::{Element, EventReader, EventWriter, ProtocolVersion};
use easync_state::{DeviceRecord, StateBackend, StateError, StateStore};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// The commands this server answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `Sync`.
    Sync,
    /// `Ping`.
    Ping,
    /// `FolderSync`.
    FolderSync,
}

impl Command {
    /// Returns the command name as sent in the request URI.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Sync => "Sync",
            Command::Ping => "Ping",
            Command::FolderSync => "FolderSync",
        }
    }
}

impl FromStr for Command {
    type Err = ServerError;

    fn from_str(s: &str) -> ServerResult<Self> {
        match s {
            "Sync" => Ok(Command::Sync),
            "Ping" => Ok(Command::Ping),
            "FolderSync" => Ok(Command::FolderSync),
            other => Err(ServerError::InvalidRequest(format!(
                "unsupported command: {other}"
            ))),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded request, as handed over by the transport.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Device id.
    pub device_id: String,
    /// Authenticated user.
    pub user: String,
    /// Device type; empty if the transport did not send one.
    pub device_type: String,
    /// Negotiated protocol version.
    pub version: ProtocolVersion,
    /// Command to run.
    pub command: Command,
    /// Request body as element events; empty for an empty body.
    pub body: Vec<Element>,
}

impl CommandRequest {
    /// Creates a request with an empty body.
    pub fn new(device_id: impl Into<String>, user: impl Into<String>, command: Command) -> Self {
        Self {
            device_id: device_id.into(),
            user: user.into(),
            device_type: String::new(),
            version: ProtocolVersion::default(),
            command,
            body: Vec::new(),
        }
    }

    /// Sets the protocol version.
    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    /// Sets the device type.
    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = device_type.into();
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: Vec<Element>) -> Self {
        self.body = body;
        self
    }
}

/// A handler's answer.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    /// False if the request stepped aside for a newer one from the same
    /// device; the transport should drop the connection without a body.
    pub handled: bool,
    /// Response body; empty means an empty response.
    pub body: Vec<Element>,
}

/// The ActiveSync command server.
///
/// Stateless between requests: everything a request needs is loaded from
/// the state backend, so any number of requests may run on separate
/// threads.
///
/// # Example
///
/// ```
/// use easync_engine::MemoryDriver;
/// use easync_protocol::{Element, SyncKey, Tag};
/// use easync_server::{ActiveSyncServer, Command, CommandRequest, ServerConfig};
/// use easync_state::MemoryBackend;
/// use std::sync::Arc;
///
/// let server = ActiveSyncServer::new(
///     ServerConfig::default(),
///     Arc::new(MemoryBackend::new()),
///     Arc::new(MemoryDriver::new()),
/// );
/// let body = vec![
///     Element::Start(Tag::FolderSync),
///     Element::Start(Tag::HierarchySyncKey),
///     Element::Content(SyncKey::Initial.to_string()),
///     Element::End,
///     Element::End,
/// ];
/// let request = CommandRequest::new("dev1", "alice", Command::FolderSync).with_body(body);
/// let response = server.handle(request).unwrap();
/// assert!(response.handled);
/// ```
pub struct ActiveSyncServer {
    config: ServerConfig,
    backend: Arc<dyn StateBackend>,
    driver: Arc<dyn Driver>,
    clock: Arc<dyn Clock>,
}

impl ActiveSyncServer {
    /// Creates a server on the wall clock.
    pub fn new(
        config: ServerConfig,
        backend: Arc<dyn StateBackend>,
        driver: Arc<dyn Driver>,
    ) -> Self {
        Self {
            config,
            backend,
            driver,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handles one command.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for a request without device id or user,
    /// and any backend failure the handler could not answer in-band.
    pub fn handle(&self, request: CommandRequest) -> ServerResult<CommandResponse> {
        if request.device_id.is_empty() || request.user.is_empty() {
            return Err(ServerError::InvalidRequest(
                "device id and user are required".into(),
            ));
        }

        let device = self.touch_device(&request)?;
        let mut ctx = HandlerContext::new(
            self.config.clone(),
            self.backend.clone(),
            self.driver.clone(),
            self.clock.clone(),
            device,
            request.version,
        );

        let mut decoder = EventReader::new(request.body);
        let mut encoder = EventWriter::new();
        let handled = match request.command {
            Command::Sync => sync::handle(&mut ctx, &mut decoder, &mut encoder)?,
            Command::Ping => ping::handle(&mut ctx, &mut decoder, &mut encoder)?,
            Command::FolderSync => foldersync::handle(&mut ctx, &mut decoder, &mut encoder)?,
        };
        debug!(
            device = %request.device_id,
            command = %request.command,
            handled,
            events = encoder.elements().len(),
            "request finished"
        );

        Ok(CommandResponse {
            handled,
            body: encoder.into_elements(),
        })
    }

    /// Loads the device record, creating it on first contact, and records
    /// this request.
    fn touch_device(&self, request: &CommandRequest) -> ServerResult<DeviceRecord> {
        let store = StateStore::new(self.backend.clone());
        let now = self.clock.now();
        let device = store.update_device(&request.device_id, &request.user, |current| {
            let mut device = current.unwrap_or_else(|| {
                info!(device = %request.device_id, user = %request.user, "new device");
                DeviceRecord::new(&request.device_id, &request.user, now)
            });
            if !request.device_type.is_empty() {
                device.device_type.clone_from(&request.device_type);
            }
            device.version = request.version;
            device.last_seen = now;
            Some(device)
        })?;
        device.ok_or_else(|| StateError::DeviceNotFound(request.device_id.clone()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easync_engine::{ManualClock, MemoryDriver};
    use easync_protocol::{Folder, FolderType, Tag};
    use easync_state::MemoryBackend;

    fn server() -> (ActiveSyncServer, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let driver = Arc::new(MemoryDriver::new());
        driver.add_folder(Folder::new("INBOX", "Inbox", FolderType::INBOX));
        let server = ActiveSyncServer::new(ServerConfig::default(), backend.clone(), driver)
            .with_clock(Arc::new(ManualClock::new(1_000)));
        (server, backend)
    }

    #[test]
    fn command_names() {
        assert_eq!("Sync".parse::<Command>().unwrap(), Command::Sync);
        assert_eq!("FolderSync".parse::<Command>().unwrap(), Command::FolderSync);
        assert_eq!(Command::Ping.to_string(), "Ping");
        assert!("MoveItems".parse::<Command>().unwrap_err().is_client_error());
    }

    #[test]
    fn first_contact_creates_device() {
        let (server, backend) = server();
        let request = CommandRequest::new("dev1", "alice", Command::Ping)
            .with_device_type("iPhone")
            .with_version(ProtocolVersion::V12_1);
        let response = server.handle(request).unwrap();
        assert!(response.handled);

        let store = StateStore::new(backend);
        let device = store.load_device("dev1", "alice").unwrap().unwrap();
        assert_eq!(device.device_type, "iPhone");
        assert_eq!(device.version, ProtocolVersion::V12_1);
        assert_eq!(device.first_seen, 1_000);
    }

    #[test]
    fn missing_identity_is_rejected() {
        let (server, _) = server();
        let err = server
            .handle(CommandRequest::new("", "alice", Command::Sync))
            .unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn malformed_foldersync_is_answered_in_band() {
        let (server, _) = server();
        let request = CommandRequest::new("dev1", "alice", Command::FolderSync)
            .with_body(vec![Element::Start(Tag::Ping), Element::End]);
        let response = server.handle(request).unwrap();
        assert_eq!(
            response.body,
            vec![
                Element::Start(Tag::FolderSync),
                Element::Start(Tag::HierarchyStatus),
                Element::Content("10".into()),
                Element::End,
                Element::End,
            ]
        );
    }
}
