//! Tunnel connection supervision.
//!
//! The [`Supervisor`] owns the connection lifecycle: it dials the server,
//! authorizes, configures the interface address and publishes the resulting
//! [`Link`] for the relay pumps. When a pump reports the link as broken the
//! supervisor clears it and runs the same cycle again, handing the server the
//! previously assigned address so the interface can keep it.

use crate::config::SessionConfig;
use crate::netconf::NetConfigurator;
use async_trait::async_trait;
use gtun_core::{authorize, ConnectionError, TunnelError, TunnelResult};
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Capacity of the failure report channel.
const FAILURE_CHANNEL_CAPACITY: usize = 16;

/// Byte stream a link can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Opens transport connections to the tunnel server.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Stream: Transport;

    async fn dial(&self, addr: &str) -> io::Result<Self::Stream>;
}

/// Plain TCP dialer.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Lifecycle states of a tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Dialing,
    Authorizing,
    Established,
    Failed,
    Terminated,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Disconnected => write!(f, "disconnected"),
            SupervisorState::Dialing => write!(f, "dialing"),
            SupervisorState::Authorizing => write!(f, "authorizing"),
            SupervisorState::Established => write!(f, "established"),
            SupervisorState::Failed => write!(f, "failed"),
            SupervisorState::Terminated => write!(f, "terminated"),
        }
    }
}

/// One authorized server connection.
///
/// Links are never reused: a reconnect always produces a new link with a
/// higher generation. Each half has a single user (one pump per direction),
/// so the locks are uncontended.
pub struct Link<S> {
    generation: u64,
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
}

impl<S: Transport> Link<S> {
    fn new(generation: u64, stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            generation,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn reader(&self) -> MutexGuard<'_, ReadHalf<S>> {
        self.reader.lock().await
    }

    pub async fn writer(&self) -> MutexGuard<'_, WriteHalf<S>> {
        self.writer.lock().await
    }
}

/// Read handle on the currently published link.
pub struct LinkSlot<S> {
    rx: watch::Receiver<Option<Arc<Link<S>>>>,
}

impl<S> Clone for LinkSlot<S> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<S> LinkSlot<S> {
    /// Wait until a link other than generation `stale` is published.
    ///
    /// Returns `None` once the supervisor is gone.
    pub async fn acquire(&mut self, stale: Option<u64>) -> Option<Arc<Link<S>>> {
        let current = self
            .rx
            .wait_for(|slot| matches!(slot, Some(link) if Some(link.generation) != stale))
            .await
            .ok()?;
        current.as_ref().cloned()
    }

    /// Resolve once `generation` stops being the published link.
    pub async fn replaced(&mut self, generation: u64) {
        let _ = self
            .rx
            .wait_for(|slot| !matches!(slot, Some(link) if link.generation == generation))
            .await;
    }
}

/// A pump's report that a link stopped working.
#[derive(Debug)]
pub struct LinkFailure {
    pub generation: u64,
    pub error: TunnelError,
}

/// Sending side of failure reports, one clone per pump.
#[derive(Debug, Clone)]
pub struct FailureReporter {
    tx: mpsc::Sender<LinkFailure>,
}

impl FailureReporter {
    /// Report `generation` as broken. Returns false if nobody is listening.
    pub async fn report(&self, generation: u64, error: impl Into<TunnelError>) -> bool {
        self.tx
            .send(LinkFailure {
                generation,
                error: error.into(),
            })
            .await
            .is_ok()
    }
}

/// Receiving side of failure reports, consumed by [`Supervisor::run`].
pub struct FailureReceiver {
    rx: mpsc::Receiver<LinkFailure>,
}

impl FailureReceiver {
    pub(crate) async fn recv(&mut self) -> Option<LinkFailure> {
        self.rx.recv().await
    }
}

/// Create the channel pumps use to report broken links.
pub fn failure_channel() -> (FailureReporter, FailureReceiver) {
    let (tx, rx) = mpsc::channel(FAILURE_CHANNEL_CAPACITY);
    (FailureReporter { tx }, FailureReceiver { rx })
}

/// State of one tunnel session across any number of reconnects.
pub struct Session<S> {
    config: SessionConfig,
    /// Address from the most recent successful handshake.
    assigned: Option<Ipv4Addr>,
    current: watch::Sender<Option<Arc<Link<S>>>>,
    generation: u64,
    reconnects: u64,
}

impl<S: Transport> Session<S> {
    pub(crate) fn new(config: SessionConfig) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            config,
            assigned: None,
            current,
            generation: 0,
            reconnects: 0,
        }
    }

    pub fn assigned_address(&self) -> Option<Ipv4Addr> {
        self.assigned
    }

    pub fn server_address(&self) -> &str {
        &self.config.server
    }

    /// Successful reconnects since the session was first established.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub(crate) fn links(&self) -> LinkSlot<S> {
        LinkSlot {
            rx: self.current.subscribe(),
        }
    }

    /// Replace the current link with one over `stream`.
    pub(crate) fn publish(&mut self, stream: S) -> u64 {
        self.generation += 1;
        let link = Arc::new(Link::new(self.generation, stream));
        self.current.send_replace(Some(link));
        self.generation
    }

    /// Withdraw the current link; pumps block until the next publish.
    pub(crate) fn clear(&mut self) {
        self.current.send_replace(None);
    }
}

/// Drives a [`Session`] through dial, authorize, establish and reconnect.
pub struct Supervisor<D: Dialer, C> {
    session: Session<D::Stream>,
    dialer: D,
    configurator: C,
    state: watch::Sender<SupervisorState>,
    interface_up: bool,
    /// Address actually applied to the interface.
    configured: Option<Ipv4Addr>,
}

impl<D: Dialer, C: NetConfigurator> Supervisor<D, C> {
    pub fn new(config: SessionConfig, dialer: D, configurator: C) -> Self {
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        Self {
            session: Session::new(config),
            dialer,
            configurator,
            state,
            interface_up: false,
            configured: None,
        }
    }

    pub fn session(&self) -> &Session<D::Stream> {
        &self.session
    }

    /// Handle the pumps use to find the current link.
    pub fn links(&self) -> LinkSlot<D::Stream> {
        self.session.links()
    }

    /// Watch the lifecycle state.
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Bring the session up for the first time.
    ///
    /// Any failure here is fatal, including failing to configure the interface.
    pub async fn establish(&mut self) -> TunnelResult<Ipv4Addr> {
        info!("Connecting to {}", self.session.config.server);
        match self.cycle(true).await {
            Ok(addr) => Ok(addr),
            Err(e) => {
                self.transition(SupervisorState::Terminated);
                Err(e)
            }
        }
    }

    /// React to link failures until the session terminates.
    ///
    /// Returns `Ok(())` when every failure reporter has been dropped, which
    /// means the relay has stopped.
    pub async fn run(&mut self, mut failures: FailureReceiver) -> TunnelResult<()> {
        while let Some(failure) = failures.recv().await {
            let established = *self.state.borrow() == SupervisorState::Established;
            if failure.generation != self.session.generation || !established {
                debug!(
                    "Ignoring failure of stale link {}: {}",
                    failure.generation, failure.error
                );
                continue;
            }

            self.transition(SupervisorState::Failed);
            warn!("Connection lost: {}", failure.error);
            self.session.clear();

            if let Err(e) = self.cycle(false).await {
                self.transition(SupervisorState::Terminated);
                error!("Giving up on {}: {}", self.session.config.server, e);
                return Err(e);
            }
            self.session.reconnects += 1;
            info!("Reconnected (reconnect #{})", self.session.reconnects);
        }

        debug!("All relay pumps stopped");
        Ok(())
    }

    /// Connect, authorize, configure and publish one link.
    async fn cycle(&mut self, startup: bool) -> TunnelResult<Ipv4Addr> {
        let (stream, addr) = self.connect().await?;

        if let Err(e) = self.apply_address(addr).await {
            if startup {
                return Err(e.into());
            }
            warn!("Interface reconfiguration failed, keeping the old address: {}", e);
        }

        self.session.assigned = Some(addr);
        let generation = self.session.publish(stream);
        self.transition(SupervisorState::Established);
        info!("Tunnel established as {} (link {})", addr, generation);
        Ok(addr)
    }

    /// Dial and authorize, retrying transient failures up to the attempt cap.
    async fn connect(&self) -> TunnelResult<(D::Stream, Ipv4Addr)> {
        let max_attempts = self.session.config.max_attempts;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match self.attempt().await {
                Ok(connected) => return Ok(connected),
                Err(e) if !e.is_retryable() => {
                    error!("Cannot recover from {} error: {}", e.category(), e);
                    return Err(e);
                }
                Err(e) => e,
            };

            if attempt >= max_attempts {
                return Err(TunnelError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            warn!(
                "Attempt {}/{} failed: {}; retrying in {:?}",
                attempt, max_attempts, err, self.session.config.retry_delay
            );
            tokio::time::sleep(self.session.config.retry_delay).await;
        }
    }

    async fn attempt(&self) -> TunnelResult<(D::Stream, Ipv4Addr)> {
        self.transition(SupervisorState::Dialing);
        let server = &self.session.config.server;
        let mut stream = self
            .dialer
            .dial(server)
            .await
            .map_err(|source| ConnectionError::DialFailed {
                addr: server.clone(),
                source,
            })?;

        self.transition(SupervisorState::Authorizing);
        let addr = authorize(&mut stream, self.session.assigned, &self.session.config.key).await?;
        Ok((stream, addr))
    }

    /// Bring the interface up once and assign `addr` if it differs from what
    /// is already configured.
    async fn apply_address(&mut self, addr: Ipv4Addr) -> Result<(), gtun_core::ConfigError> {
        let device = &self.session.config.device;

        if !self.interface_up {
            self.configurator.bring_up(device).await?;
            self.interface_up = true;
        }

        if self.configured == Some(addr) {
            debug!("Address {} unchanged, leaving {} as is", addr, device);
            return Ok(());
        }

        self.configurator
            .assign_address(device, addr, self.session.config.prefix_len)
            .await?;
        self.configured = Some(addr);
        Ok(())
    }

    fn transition(&self, next: SupervisorState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!("Supervisor {} -> {}", prev, next);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use gtun_core::{AuthorizeError, AuthorizeResponse, ConfigError};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test]
    async fn test_established_after_six_attempts() {
        let (dialer, harness) = scripted(|n| n <= 5, fixed_address);
        let configurator = RecordingConfigurator::default();
        let mut supervisor = Supervisor::new(test_config(), dialer, configurator.clone());
        let state = supervisor.state();

        let addr = supervisor.establish().await.unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(harness.attempts.load(Ordering::SeqCst), 6);
        assert_eq!(*state.borrow(), SupervisorState::Established);
        assert_eq!(supervisor.session().assigned_address(), Some(addr));

        let link = supervisor.links().acquire(None).await.unwrap();
        assert_eq!(link.generation(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(harness.attempts.load(Ordering::SeqCst), 6);
        assert_eq!(*state.borrow(), SupervisorState::Established);
        assert_eq!(
            configurator.calls(),
            vec!["up gtun".to_string(), "addr gtun 10.0.0.2/24".to_string()]
        );
    }

    #[tokio::test]
    async fn test_terminates_when_dial_always_fails() {
        let (dialer, harness) = scripted(|_| true, fixed_address);
        let configurator = RecordingConfigurator::default();
        let mut supervisor = Supervisor::new(test_config(), dialer, configurator.clone());
        let state = supervisor.state();

        let err = supervisor.establish().await.unwrap_err();
        assert!(matches!(err, TunnelError::Exhausted { attempts: 10, .. }));
        assert_eq!(harness.attempts.load(Ordering::SeqCst), 10);
        assert_eq!(*state.borrow(), SupervisorState::Terminated);
        assert!(configurator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_bad_key_terminates_without_retry() {
        let (dialer, harness) = scripted(|_| false, |_| AuthorizeResponse::failure());
        let configurator = RecordingConfigurator::default();
        let mut supervisor = Supervisor::new(test_config(), dialer, configurator.clone());
        let state = supervisor.state();

        let err = supervisor.establish().await.unwrap_err();
        assert!(matches!(err, TunnelError::Authorize(AuthorizeError::BadKey)));
        assert_eq!(harness.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(*state.borrow(), SupervisorState::Terminated);
        assert!(supervisor.session().assigned_address().is_none());
        assert!(configurator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_config_error_at_startup_is_fatal() {
        let (dialer, _harness) = scripted(|_| false, fixed_address);
        let configurator = RecordingConfigurator::default();
        configurator.fail_assign_from(1);
        let mut supervisor = Supervisor::new(test_config(), dialer, configurator);
        let state = supervisor.state();

        let err = supervisor.establish().await.unwrap_err();
        assert!(matches!(err, TunnelError::Config(ConfigError::AddressAssign { .. })));
        assert_eq!(*state.borrow(), SupervisorState::Terminated);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_address() {
        let (dialer, mut harness) = scripted(|_| false, fixed_address);
        let configurator = RecordingConfigurator::default();
        let mut supervisor = Supervisor::new(test_config(), dialer, configurator.clone());
        supervisor.establish().await.unwrap();
        let _first_peer = harness.peers.recv().await.unwrap();

        let mut links = supervisor.links();
        let (reporter, failures) = failure_channel();
        let run = tokio::spawn(async move { supervisor.run(failures).await });

        assert!(reporter.report(1, ConnectionError::Closed).await);
        let link = links.acquire(Some(1)).await.unwrap();
        assert_eq!(link.generation(), 2);

        let requests = harness.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].access_address.is_empty());
        assert_eq!(requests[1].access_address, "10.0.0.2");
        assert_eq!(harness.attempts.load(Ordering::SeqCst), 2);

        // Same address: the interface is not touched again.
        assert_eq!(
            configurator.calls(),
            vec!["up gtun".to_string(), "addr gtun 10.0.0.2/24".to_string()]
        );

        drop(reporter);
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stale_failure_is_ignored() {
        let (dialer, harness) = scripted(|_| false, fixed_address);
        let mut supervisor = Supervisor::new(test_config(), dialer, RecordingConfigurator::default());
        supervisor.establish().await.unwrap();
        let state = supervisor.state();

        let (reporter, failures) = failure_channel();
        let run = tokio::spawn(async move { supervisor.run(failures).await });

        assert!(reporter.report(7, ConnectionError::Closed).await);
        drop(reporter);
        run.await.unwrap().unwrap();

        assert_eq!(harness.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(*state.borrow(), SupervisorState::Established);
    }

    #[tokio::test]
    async fn test_changed_address_is_reconfigured() {
        let (dialer, harness) = scripted(|_| false, |n| {
            AuthorizeResponse::success(if n == 0 { "10.0.0.2" } else { "10.0.0.9" })
        });
        let configurator = RecordingConfigurator::default();
        let mut supervisor = Supervisor::new(test_config(), dialer, configurator.clone());
        supervisor.establish().await.unwrap();

        let mut links = supervisor.links();
        let (reporter, failures) = failure_channel();
        let run = tokio::spawn(async move { supervisor.run(failures).await });

        reporter.report(1, ConnectionError::Closed).await;
        links.acquire(Some(1)).await.unwrap();

        assert_eq!(
            configurator.calls(),
            vec![
                "up gtun".to_string(),
                "addr gtun 10.0.0.2/24".to_string(),
                "addr gtun 10.0.0.9/24".to_string(),
            ]
        );
        assert_eq!(harness.requests.lock().unwrap()[1].access_address, "10.0.0.2");

        drop(reporter);
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_config_error_on_reconnect_is_not_fatal() {
        let (dialer, _harness) = scripted(|_| false, |n| {
            AuthorizeResponse::success(if n == 0 { "10.0.0.2" } else { "10.0.0.9" })
        });
        let configurator = RecordingConfigurator::default();
        configurator.fail_assign_from(2);
        let mut supervisor = Supervisor::new(test_config(), dialer, configurator.clone());
        supervisor.establish().await.unwrap();
        let state = supervisor.state();

        let mut links = supervisor.links();
        let (reporter, failures) = failure_channel();
        let run = tokio::spawn(async move { supervisor.run(failures).await });

        reporter.report(1, ConnectionError::Closed).await;
        let link = links.acquire(Some(1)).await.unwrap();
        assert_eq!(link.generation(), 2);
        assert_eq!(*state.borrow(), SupervisorState::Established);
        assert_eq!(configurator.calls().len(), 2);

        drop(reporter);
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_terminates() {
        // The first connection works, then the server is gone for good.
        let (dialer, harness) = scripted(|n| n > 1, fixed_address);
        let mut config = test_config();
        config.max_attempts = 3;
        let mut supervisor = Supervisor::new(config, dialer, RecordingConfigurator::default());
        supervisor.establish().await.unwrap();
        let state = supervisor.state();

        let (reporter, failures) = failure_channel();
        let run = tokio::spawn(async move { supervisor.run(failures).await });
        reporter.report(1, ConnectionError::Closed).await;

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, TunnelError::Exhausted { attempts: 3, .. }));
        assert_eq!(harness.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(*state.borrow(), SupervisorState::Terminated);
    }

    #[tokio::test]
    async fn test_handshake_failures_are_retried() {
        // Hang up mid-handshake, then answer garbage, then behave.
        let (dialer, harness) = scripted(|_| false, |n| match n {
            0 => Reply::HangUp,
            1 => Reply::Garbage,
            _ => fixed_address(n).into(),
        });
        let mut supervisor = Supervisor::new(test_config(), dialer, RecordingConfigurator::default());
        let state = supervisor.state();

        let addr = supervisor.establish().await.unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(harness.dials(), 3);
        assert_eq!(harness.requests.lock().unwrap().len(), 3);
        assert_eq!(*state.borrow(), SupervisorState::Established);
    }

    #[tokio::test]
    async fn test_handshake_failures_use_attempt_budget() {
        let (dialer, harness) = scripted(|_| false, |n| {
            if n % 2 == 0 {
                Reply::HangUp
            } else {
                Reply::Garbage
            }
        });
        let mut config = test_config();
        config.max_attempts = 4;
        let mut supervisor = Supervisor::new(config, dialer, RecordingConfigurator::default());
        let state = supervisor.state();

        let err = supervisor.establish().await.unwrap_err();
        match err {
            TunnelError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 4);
                assert!(matches!(
                    *last,
                    TunnelError::Authorize(AuthorizeError::MalformedResponse(_))
                ));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(harness.dials(), 4);
        assert_eq!(*state.borrow(), SupervisorState::Terminated);
    }

    #[tokio::test]
    async fn test_lost_handshake_is_connection_lost() {
        let (dialer, _harness) = scripted(|_| false, |_| Reply::HangUp);
        let mut config = test_config();
        config.max_attempts = 1;
        let mut supervisor = Supervisor::new(config, dialer, RecordingConfigurator::default());

        let err = supervisor.establish().await.unwrap_err();
        match err {
            TunnelError::Exhausted { attempts: 1, last } => assert!(matches!(
                *last,
                TunnelError::Authorize(AuthorizeError::ConnectionLost(ConnectionError::Closed))
            )),
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_key_on_reconnect_terminates() {
        let (dialer, harness) = scripted(|_| false, |n| {
            if n == 0 {
                fixed_address(n)
            } else {
                AuthorizeResponse::failure()
            }
        });
        let mut supervisor = Supervisor::new(test_config(), dialer, RecordingConfigurator::default());
        supervisor.establish().await.unwrap();
        let state = supervisor.state();
        let mut links = supervisor.links();

        let (reporter, failures) = failure_channel();
        let run = tokio::spawn(async move { supervisor.run(failures).await });
        reporter.report(1, ConnectionError::Closed).await;

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, TunnelError::Authorize(AuthorizeError::BadKey)));
        assert_eq!(harness.dials(), 2);
        assert_eq!(*state.borrow(), SupervisorState::Terminated);

        // The slot was cleared and nothing replaced it.
        assert!(
            tokio::time::timeout(Duration::from_millis(20), links.acquire(Some(1)))
                .await
                .map_or(true, |link| link.is_none())
        );
    }
}
