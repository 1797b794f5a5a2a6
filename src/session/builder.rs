//! Builder for [`Session`].

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;

use super::{
    Session,
    SessionId,
    SessionInner,
    SessionRegistry,
    Shared,
    connection::Connection,
    controller::Controller,
    stats::SessionLease,
};
use crate::{
    backoff::BackoffConfig,
    config::{CmdSnPolicy, SessionConfig},
    digest::Digests,
    error::SessionError,
    transport::{Connector, Transport},
};

const COMMAND_CAPACITY: usize = 8;

/// Configures and starts a [`Session`].
///
/// # Examples
///
/// ```no_run
/// use iscsi_initiator::{session::SessionBuilder, transport::TcpTransport};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransport::connect("192.0.2.10:3260").await?;
/// let session = SessionBuilder::new()
///     .target("iqn.2003-01.org.example:disk1", "192.0.2.10:3260")
///     .max_burst_length(65_536)
///     .start(transport)?;
/// session.enter_full_feature().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    connector: Option<Arc<dyn Connector>>,
    registry: Option<Arc<SessionRegistry>>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .field("connector", &self.connector.is_some())
            .field("registry", &self.registry.is_some())
            .finish()
    }
}

impl SessionBuilder {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the target name and portal address.
    #[must_use]
    pub fn target(mut self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.config.target_name = name.into();
        self.config.target_address = address.into();
        self
    }

    #[must_use]
    pub fn max_burst_length(mut self, bytes: u32) -> Self {
        self.config.max_burst_length = bytes;
        self
    }

    #[must_use]
    pub fn max_recv_data_segment_length(mut self, bytes: u32) -> Self {
        self.config.max_recv_data_segment_length = bytes;
        self
    }

    #[must_use]
    pub fn max_send_data_segment_length(mut self, bytes: u32) -> Self {
        self.config.max_send_data_segment_length = bytes;
        self
    }

    /// Number of inbound PDUs that may be buffered before the receive
    /// engine stops reading.
    #[must_use]
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.config.pool_capacity = capacity;
        self
    }

    /// Quiet period after which a NOP-Out asks the target to reopen a closed window.
    #[must_use]
    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.config.idle_interval = interval;
        self
    }

    /// Bound on waiting for each engine during teardown.
    #[must_use]
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = timeout;
        self
    }

    #[must_use]
    pub fn initial_cmd_sn(mut self, sn: u32) -> Self {
        self.config.initial_cmd_sn = sn;
        self
    }

    #[must_use]
    pub fn cmd_sn_policy(mut self, policy: CmdSnPolicy) -> Self {
        self.config.cmd_sn_policy = policy;
        self
    }

    #[must_use]
    pub fn digests(mut self, digests: Digests) -> Self {
        self.config.digests = digests;
        self
    }

    /// Reconnect automatically after link loss using `connector`.
    #[must_use]
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    #[must_use]
    pub fn reconnect(mut self, backoff: BackoffConfig) -> Self {
        self.config.reconnect = backoff;
        self
    }

    /// Register the session in `registry` until it stops.
    #[must_use]
    pub fn registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate the configuration and start the session on `transport`.
    ///
    /// The session begins in the login phase: only immediate PDUs flow until
    /// [`Session::enter_full_feature`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] if the configuration is invalid.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start(self, transport: impl Transport + 'static) -> Result<Session, SessionError> {
        self.start_shared(Arc::new(transport))
    }

    /// Like [`start`](Self::start) for a transport that is already shared.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] if the configuration is invalid.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start_shared(self, transport: Arc<dyn Transport>) -> Result<Session, SessionError> {
        let config = self.config.validated()?;
        let shared = Arc::new(Shared::new(SessionId::next(), config));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let session = Session(Arc::new(SessionInner {
            shared: Arc::clone(&shared),
            commands: commands_tx,
        }));
        if let Some(registry) = &self.registry {
            registry.insert(&session);
        }

        let controller = Controller {
            connection: Some(Connection::start(&shared, transport)),
            shared,
            commands: commands_rx,
            connector: self.connector,
            registry: self.registry,
            lease: Some(SessionLease::acquire(session.id())),
        };
        log::info!(
            "session started: session_id={}, target={}",
            session.id(),
            session.config().target_name
        );
        tokio::spawn(controller.run());
        Ok(session)
    }
}
