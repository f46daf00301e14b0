//! Bridge lifecycle and the control dispatcher.
//!
//! A [`Bridge`] owns one device (anything implementing [`DeviceBridge`]) and
//! the inbound half of its control channel.  [`Bridge::start`] spawns the
//! device's background tasks and then dispatches control messages on the
//! caller's task until the shared [`Shutdown`] flag is set, either by
//! [`BridgeHandle::quit`] or because the server closed the channel.
//!
//! Teardown always happens in the same order: background tasks are joined,
//! the device releases its sockets, the control source is dropped, and only
//! then is the bridge reported as stopped.

use std::time::Duration;

use async_trait::async_trait;
use fleetbridge_middleware::{ControlSource, LinkMonitor, Shutdown};
use fleetbridge_protocol::ControlRequest;
use fleetbridge_types::{LinkError, LinkState};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, field, info, instrument, warn, Span};

/// How often every blocking wait re-checks the shutdown flag.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Fixed backoff between discovery queries.
pub const DEFAULT_DISCOVERY_RETRY: Duration = Duration::from_secs(1);

/// Settings shared by every bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Base WebSocket URL, e.g. `ws://10.29.105.201:8000/ws/client`.
    pub control_url: String,
    pub client_id: String,
    pub poll_interval: Duration,
    pub discovery_retry: Duration,
    /// How long one mDNS query listens for answers.
    pub query_window: Duration,
}

impl BridgeConfig {
    pub fn new(control_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            control_url: control_url.into(),
            client_id: client_id.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            discovery_retry: DEFAULT_DISCOVERY_RETRY,
            query_window: fleetbridge_middleware::discovery::DEFAULT_QUERY_WINDOW,
        }
    }

    /// `{control_url}/{client_id}/{channel}/`
    pub fn channel_url(&self, channel: &str) -> String {
        format!(
            "{}/{}/{channel}/",
            self.control_url.trim_end_matches('/'),
            self.client_id
        )
    }
}

/// The device-specific half of a bridge.
#[async_trait]
pub trait DeviceBridge: Send + 'static {
    /// Short name used in logs, e.g. `"camera"`.
    const NAME: &'static str;

    /// Control requests this device accepts.
    type Request: ControlRequest;

    fn link(&self) -> &LinkMonitor;

    /// Spawn the device's background tasks.  Called once, before the first
    /// request is dispatched.  Every task must return soon after `shutdown`
    /// is triggered.
    fn spawn_tasks(&mut self, shutdown: &Shutdown) -> Vec<JoinHandle<()>>;

    /// Carry out one validated request.
    async fn handle(&mut self, request: Self::Request, shutdown: &Shutdown) -> Result<(), LinkError>;

    /// Release sockets and advertisements.  Called once, after every task
    /// spawned by [`DeviceBridge::spawn_tasks`] has finished.
    async fn close(&mut self);
}

/// A connected bridge, ready to [`start`](Bridge::start).
pub struct Bridge<D: DeviceBridge> {
    device: D,
    source: Box<dyn ControlSource>,
    shutdown: Shutdown,
    poll_interval: Duration,
    stopped: watch::Sender<bool>,
}

impl<D: DeviceBridge> Bridge<D> {
    pub fn new(device: D, source: Box<dyn ControlSource>, poll_interval: Duration) -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            device,
            source,
            shutdown: Shutdown::new(),
            poll_interval,
            stopped,
        }
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            name: D::NAME,
            shutdown: self.shutdown.clone(),
            stopped: self.stopped.subscribe(),
            link: self.device.link().subscribe(),
        }
    }

    /// Run the bridge until it is told to quit, then tear it down.
    pub async fn start(mut self) {
        let tasks = self.device.spawn_tasks(&self.shutdown);
        info!(bridge = D::NAME, tasks = tasks.len(), "bridge started");

        self.dispatch_until_shutdown().await;

        for task in tasks {
            if let Err(e) = task.await {
                error!(bridge = D::NAME, error = %e, "bridge task panicked");
            }
        }
        self.device.close().await;
        self.device.link().set(LinkState::Disconnected);
        drop(self.source);

        info!(bridge = D::NAME, "bridge stopped");
        self.stopped.send_replace(true);
    }

    async fn dispatch_until_shutdown(&mut self) {
        while !self.shutdown.is_triggered() {
            let message = match tokio::time::timeout(self.poll_interval, self.source.next_text()).await {
                Err(_) => continue,
                Ok(message) => message,
            };
            match message {
                Some(Ok(text)) => self.dispatch(&text).await,
                Some(Err(e)) => {
                    error!(bridge = D::NAME, error = %e, "control channel failed, shutting down");
                    self.shutdown.trigger();
                }
                None => {
                    info!(bridge = D::NAME, "control channel closed by server, shutting down");
                    self.shutdown.trigger();
                }
            }
        }
    }

    #[instrument(name = "dispatch", skip_all, fields(bridge = D::NAME, request = field::Empty))]
    async fn dispatch(&mut self, text: &str) {
        let request = match <D::Request as ControlRequest>::parse(text) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "dropping control message");
                return;
            }
        };
        Span::current().record("request", field::debug(&request));
        debug!("dispatching");
        if let Err(e) = self.device.handle(request, &self.shutdown).await {
            warn!(bridge = D::NAME, error = %e, "request failed");
        }
    }
}

/// Cloneable remote control for a running [`Bridge`].
#[derive(Clone, Debug)]
pub struct BridgeHandle {
    name: &'static str,
    shutdown: Shutdown,
    stopped: watch::Receiver<bool>,
    link: watch::Receiver<LinkState>,
}

impl BridgeHandle {
    /// Stop the bridge and wait until every task has exited and every
    /// socket has been released.  Calling it again returns immediately.
    pub async fn quit(&self) {
        if self.shutdown.trigger() {
            info!(bridge = self.name, "quit requested");
        }
        let mut stopped = self.stopped.clone();
        if stopped.wait_for(|done| *done).await.is_err() {
            debug!(bridge = self.name, "bridge dropped without starting");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.clone()
    }
}
