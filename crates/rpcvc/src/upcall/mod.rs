//! Upcall channels to the handshake daemons.
//!
//! One [`UpcallChannel`] per [`Direction`]. Each holds the daemon's socket
//! path and two lazily connected local RPC clients behind its own lock, plus
//! the handshake slot that serializes sessions in that direction. Handshakes
//! ride one client; disconnect, handle-record and ping calls ride the other,
//! so they never wait on a daemon that is still handshaking.
//!
//! Reconfiguring swaps the client handles atomically; calls already running
//! on an old handle keep their `Arc` and finish or fail on their own.

pub mod daemon;
pub(crate) mod fdpass;
pub mod protocol;

pub use protocol::{AcceptRes, ConnectArgs, ConnectRes, UpcallStatus};

use std::fmt;
use std::io;
use std::net::Shutdown;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::net::UnixStream;
use tokio::sync::{Mutex, MutexGuard};

use crate::client::{CallOptions, ClientError, VcClient};
use crate::endpoint::StreamEndpoint;
use crate::tls::{DelegationResult, TlsError};
use protocol::{
    ACCEPT_PROGRAM, CONNECT_PROGRAM, PROC_DISCONNECT, PROC_HANDLE_RECORD, PROC_HANDSHAKE,
    PROC_NULL, UPCALL_VERSION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Client side: we connected and start TLS.
    Connect,
    /// Server side: we accepted and the peer asked for TLS.
    Accept,
}

impl Direction {
    pub fn program(self) -> u32 {
        match self {
            Direction::Connect => CONNECT_PROGRAM,
            Direction::Accept => ACCEPT_PROGRAM,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Connect => f.write_str("connect"),
            Direction::Accept => f.write_str("accept"),
        }
    }
}

/// Upcall settings for both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpcallConfig {
    pub connect_socket: Option<PathBuf>,
    pub accept_socket: Option<PathBuf>,
    /// Bound on each daemon call.
    pub timeout: Duration,
    pub tries: u32,
    /// After a daemon timeout, fully close the connection once this much more
    /// time has passed. `None` leaves the socket to the daemon.
    pub force_shutdown_after: Option<Duration>,
}

impl Default for UpcallConfig {
    fn default() -> Self {
        Self {
            connect_socket: None,
            accept_socket: None,
            timeout: Duration::from_secs(30),
            tries: 1,
            force_shutdown_after: None,
        }
    }
}

impl UpcallConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `RPCVC_TLS_CONNECT_SOCKET`,
    /// `RPCVC_TLS_ACCEPT_SOCKET` and `RPCVC_TLS_UPCALL_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("RPCVC_TLS_CONNECT_SOCKET")
            && !path.is_empty()
        {
            config.connect_socket = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("RPCVC_TLS_ACCEPT_SOCKET")
            && !path.is_empty()
        {
            config.accept_socket = Some(PathBuf::from(path));
        }
        if let Ok(raw) = std::env::var("RPCVC_TLS_UPCALL_TIMEOUT_SECS") {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => config.timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %raw, "Ignoring invalid RPCVC_TLS_UPCALL_TIMEOUT_SECS"),
            }
        }
        config
    }

    pub fn with_connect_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.connect_socket = Some(path.into());
        self
    }

    pub fn with_accept_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.accept_socket = Some(path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    pub fn with_force_shutdown_after(mut self, after: Duration) -> Self {
        self.force_shutdown_after = Some(after);
        self
    }

    pub fn call_options(&self) -> CallOptions {
        CallOptions::default()
            .with_timeout(self.timeout)
            .with_tries(self.tries)
    }

    pub fn socket(&self, direction: Direction) -> Option<&PathBuf> {
        match direction {
            Direction::Connect => self.connect_socket.as_ref(),
            Direction::Accept => self.accept_socket.as_ref(),
        }
    }
}

/// Counters for one channel.
#[derive(Debug, Default)]
pub struct UpcallStats {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    disconnects: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpcallStatsSnapshot {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub disconnects: u64,
}

impl UpcallStats {
    pub fn snapshot(&self) -> UpcallStatsSnapshot {
        UpcallStatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Which daemon connection a call rides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    /// Handshakes; one at a time under the slot, each as long as the daemon takes.
    Handshake,
    /// Short calls from any connection.
    Control,
}

#[derive(Default)]
struct ChannelConfig {
    path: Option<PathBuf>,
    handshake: Option<Arc<VcClient>>,
    control: Option<Arc<VcClient>>,
    /// Bumped on every reconfiguration so a handle created for an old path
    /// is never installed.
    generation: u64,
}

impl ChannelConfig {
    fn handle(&mut self, lane: Lane) -> &mut Option<Arc<VcClient>> {
        match lane {
            Lane::Handshake => &mut self.handshake,
            Lane::Control => &mut self.control,
        }
    }

    fn reset(&mut self) {
        self.handshake = None;
        self.control = None;
        self.generation += 1;
    }
}

/// Local RPC channel to one direction's handshake daemon.
pub struct UpcallChannel {
    direction: Direction,
    config: StdMutex<ChannelConfig>,
    /// At most one handshake session per direction; waiters queue FIFO.
    slot: Mutex<()>,
    options: CallOptions,
    force_shutdown_after: Option<Duration>,
    stats: UpcallStats,
}

impl UpcallChannel {
    /// An unconfigured channel. Handshakes fail with `NoTlsSupport` until
    /// [`configure`](Self::configure) is called.
    pub fn new(direction: Direction) -> Self {
        let defaults = UpcallConfig::default();
        Self {
            direction,
            config: StdMutex::new(ChannelConfig::default()),
            slot: Mutex::new(()),
            options: defaults.call_options(),
            force_shutdown_after: None,
            stats: UpcallStats::default(),
        }
    }

    pub fn from_config(direction: Direction, config: &UpcallConfig) -> Self {
        let channel = Self::new(direction).with_options(config.call_options());
        let channel = match config.force_shutdown_after {
            Some(after) => channel.with_force_shutdown_after(after),
            None => channel,
        };
        if let Some(path) = config.socket(direction) {
            channel.configure(path.clone());
        }
        channel
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_force_shutdown_after(mut self, after: Duration) -> Self {
        self.force_shutdown_after = Some(after);
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn stats(&self) -> UpcallStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_configured(&self) -> bool {
        crate::lock(&self.config).path.is_some()
    }

    /// Point the channel at a (new) daemon socket.
    pub fn configure(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut config = crate::lock(&self.config);
        tracing::info!(direction = %self.direction, path = %path.display(), "Configured upcall channel");
        config.path = Some(path);
        config.reset();
    }

    /// Forget the daemon. Later handshakes fail with `NoTlsSupport`.
    pub fn teardown(&self) {
        let mut config = crate::lock(&self.config);
        if config.path.take().is_some() {
            tracing::info!(direction = %self.direction, "Tore down upcall channel");
        }
        config.reset();
    }

    /// Current client handle for `lane`, connecting one if needed.
    async fn client(&self, lane: Lane) -> Result<Arc<VcClient>, TlsError> {
        let (path, generation) = {
            let mut config = crate::lock(&self.config);
            if let Some(handle) = config.handle(lane) {
                return Ok(Arc::clone(handle));
            }
            let Some(path) = config.path.clone() else {
                return Err(TlsError::NoTlsSupport(self.direction));
            };
            (path, config.generation)
        };

        let stream = UnixStream::connect(&path)
            .await
            .map_err(|e| TlsError::DaemonUnavailable(ClientError::Io(e)))?;
        tracing::debug!(direction = %self.direction, ?lane, path = %path.display(), "Connected to handshake daemon");
        let client = Arc::new(
            VcClient::new(Arc::new(stream), self.direction.program(), UPCALL_VERSION)
                .with_options(self.options),
        );

        let mut config = crate::lock(&self.config);
        if config.generation == generation {
            let slot = config.handle(lane);
            // Lost a race with another caller; use theirs.
            if let Some(existing) = slot.as_ref() {
                return Ok(Arc::clone(existing));
            }
            *slot = Some(Arc::clone(&client));
        }
        Ok(client)
    }

    /// Drop `stale` as a current handle so the next call on its lane reconnects.
    fn invalidate(&self, stale: &Arc<VcClient>) {
        let mut config = crate::lock(&self.config);
        for lane in [Lane::Handshake, Lane::Control] {
            let slot = config.handle(lane);
            if slot
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, stale))
            {
                *slot = None;
            }
        }
    }

    fn daemon_error(&self, client: &Arc<VcClient>, err: ClientError) -> TlsError {
        match err {
            ClientError::TimedOut(after) => TlsError::DaemonTimeout(after),
            err @ (ClientError::Io(_) | ClientError::Closed | ClientError::Framing(_)) => {
                self.invalidate(client);
                TlsError::DaemonUnavailable(err)
            }
            err => TlsError::DaemonUnavailable(err),
        }
    }

    /// Ping the daemon.
    pub async fn null(&self) -> Result<(), TlsError> {
        let client = self.client(Lane::Control).await?;
        client
            .call::<_, ()>(PROC_NULL, &())
            .await
            .map_err(|e| self.daemon_error(&client, e))
    }

    /// Open a handshake session for `endpoint`.
    ///
    /// Fails at once with `NoTlsSupport` when unconfigured. Otherwise waits
    /// (FIFO) for this direction's slot, which the session holds until dropped.
    pub async fn begin_session(
        &self,
        endpoint: Arc<dyn StreamEndpoint>,
    ) -> Result<UpcallSession<'_>, TlsError> {
        if !self.is_configured() {
            return Err(TlsError::NoTlsSupport(self.direction));
        }
        let slot = self.slot.lock().await;
        let client = self.client(Lane::Handshake).await?;
        Ok(UpcallSession {
            channel: self,
            endpoint,
            client,
            _slot: slot,
        })
    }

    /// Release daemon-side state for an ended session.
    pub async fn disconnect(&self, session: DelegationResult) -> Result<UpcallStatus, TlsError> {
        UpcallStats::bump(&self.stats.disconnects);
        let client = self.client(Lane::Control).await?;
        let status = client
            .call::<_, UpcallStatus>(PROC_DISCONNECT, &session)
            .await
            .map_err(|e| self.daemon_error(&client, e))?;
        tracing::debug!(direction = %self.direction, token = session.token, %status, "Disconnect upcall");
        Ok(status)
    }

    /// Forward a non-application TLS record to the daemon.
    pub async fn handle_record(&self, session: DelegationResult) -> Result<UpcallStatus, TlsError> {
        let client = self.client(Lane::Control).await?;
        let status = client
            .call::<_, UpcallStatus>(PROC_HANDLE_RECORD, &session)
            .await
            .map_err(|e| self.daemon_error(&client, e))?;
        tracing::debug!(direction = %self.direction, token = session.token, %status, "Handle-record upcall");
        Ok(status)
    }
}

impl fmt::Debug for UpcallChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpcallChannel")
            .field("direction", &self.direction)
            .field("configured", &self.is_configured())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// One in-progress handshake: the connection's endpoint, the daemon client,
/// and this direction's slot. Dropping it frees the slot for the next waiter.
pub struct UpcallSession<'a> {
    channel: &'a UpcallChannel,
    endpoint: Arc<dyn StreamEndpoint>,
    client: Arc<VcClient>,
    _slot: MutexGuard<'a, ()>,
}

impl UpcallSession<'_> {
    pub fn direction(&self) -> Direction {
        self.channel.direction
    }

    /// Connect-side handshake on the shared endpoint.
    pub async fn connect(self, cert_hint: Option<String>) -> Result<DelegationResult, TlsError> {
        let args = ConnectArgs { cert_hint };
        let res: ConnectRes = self.handshake(&args).await?;
        self.finish(res.status)?;
        Ok(res.session)
    }

    /// Accept-side handshake on the shared endpoint.
    pub async fn accept(self) -> Result<AcceptRes, TlsError> {
        let res: AcceptRes = self.handshake(&()).await?;
        self.finish(res.status)?;
        Ok(res)
    }

    async fn handshake<A, R>(&self, args: &A) -> Result<R, TlsError>
    where
        A: crate::xdr::XdrEncode + Sync,
        R: crate::xdr::XdrDecode,
    {
        let stats = &self.channel.stats;
        UpcallStats::bump(&stats.started);
        tracing::debug!(direction = %self.direction(), "Handshake upcall");

        let fd = self.endpoint.as_fd();
        match self.client.call_with_fd(PROC_HANDSHAKE, args, fd).await {
            Ok(res) => Ok(res),
            Err(ClientError::TimedOut(after)) => {
                UpcallStats::bump(&stats.timed_out);
                tracing::warn!(direction = %self.direction(), timeout = ?after, "Handshake daemon timed out; shutting down read side");
                self.cancel();
                Err(TlsError::DaemonTimeout(after))
            }
            Err(e) => {
                UpcallStats::bump(&stats.failed);
                tracing::warn!(direction = %self.direction(), error = %e, "Handshake upcall failed");
                Err(self.channel.daemon_error(&self.client, e))
            }
        }
    }

    fn finish(&self, status: UpcallStatus) -> Result<(), TlsError> {
        let stats = &self.channel.stats;
        if status == UpcallStatus::Ok {
            UpcallStats::bump(&stats.succeeded);
            Ok(())
        } else {
            UpcallStats::bump(&stats.failed);
            tracing::info!(direction = %self.direction(), %status, "Handshake rejected by daemon");
            Err(TlsError::Rejected(status))
        }
    }

    /// Unblock a daemon stuck on the shared socket: half-close our read side,
    /// which the daemon sees as EOF. The socket itself stays open.
    fn cancel(&self) {
        if let Err(e) = self.endpoint.shutdown(Shutdown::Read)
            && e.kind() != io::ErrorKind::NotConnected
        {
            tracing::warn!(error = %e, "Read-side shutdown failed");
        }
        if let Some(after) = self.channel.force_shutdown_after {
            let endpoint = Arc::clone(&self.endpoint);
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                tracing::info!(grace = ?after, "Force-closing connection abandoned by handshake daemon");
                if let Err(e) = endpoint.shutdown(Shutdown::Both)
                    && e.kind() != io::ErrorKind::NotConnected
                {
                    tracing::warn!(error = %e, "Forced shutdown failed");
                }
            });
        }
    }
}
