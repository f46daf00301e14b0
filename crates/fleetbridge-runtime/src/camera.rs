//! ESP32-CAM bridge.
//!
//! Three cloud channels and two device sockets:
//!
//! * `…/cam/` – control requests in, live video frames out.
//! * `…/analyze/` – captured stills out.
//! * TCP to the camera – commands out, capture responses in.
//! * UDP from the camera – the live video stream, reassembled by the relay.
//!
//! The bridge advertises its UDP endpoint over mDNS so the camera knows where
//! to stream, then resolves the camera's own TCP endpoint.
//!
//! The camera never speaks unprompted, so its TCP socket is only read while a
//! capture is in flight.  A camera that drops off the network is noticed by
//! the next command or capture, which marks the link
//! [`LinkState::Degraded`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetbridge_middleware::discovery::{ServiceAdvertisement, ServiceQuery};
use fleetbridge_middleware::{
    connect_control, drain_control, publish_frames, receive_frames, resolve_device, CommandChannel, ControlSink,
    ControlSource, DeviceReader, FrameQueue, LinkMonitor, MdnsDiscovery, Shutdown,
};
use fleetbridge_protocol::CameraRequest;
use fleetbridge_types::{LinkError, LinkState};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::bridge::{Bridge, BridgeConfig, DeviceBridge};

pub const CAMERA_SERVICE: &str = "_video._tcp.local.";
pub const CAMERA_INSTANCE: &str = "esp32-cam._video._tcp.local.";

pub const VIDEO_SERVICE: &str = "_video._udp.local.";
pub const VIDEO_INSTANCE_LABEL: &str = "host";
pub const VIDEO_HOST_NAME: &str = "host.local.";

pub const DEFAULT_VIDEO_PORT: u16 = 9876;
/// Hotspot address the cameras join.
pub const DEFAULT_ADVERTISE_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 137, 1));
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSettings {
    pub video_port: u16,
    pub advertise_address: IpAddr,
    pub queue_capacity: usize,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            video_port: DEFAULT_VIDEO_PORT,
            advertise_address: DEFAULT_ADVERTISE_ADDRESS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Everything a [`CameraBridge`] owns once connected.
pub struct CameraLinks {
    /// Command socket to the camera.
    pub device: TcpStream,
    /// Bound datagram socket the camera streams to.
    pub video: UdpSocket,
    /// Control channel sink; receives the live frames.
    pub frames: Box<dyn ControlSink>,
    /// Analysis channel sink; receives captured stills.
    pub analysis: Box<dyn ControlSink>,
    /// Inbound half of the analysis channel.  Nothing arrives on it, but it
    /// is read so server pings get answered.
    pub analysis_replies: Box<dyn ControlSource>,
    pub discovery: Option<MdnsDiscovery>,
}

pub struct CameraBridge {
    link: LinkMonitor,
    commands: CommandChannel<OwnedWriteHalf>,
    replies: DeviceReader<OwnedReadHalf>,
    analysis: Box<dyn ControlSink>,
    analysis_replies: Option<Box<dyn ControlSource>>,
    relay: Option<(UdpSocket, Box<dyn ControlSink>)>,
    queue: Arc<FrameQueue>,
    poll_interval: Duration,
    discovery: Option<MdnsDiscovery>,
}

impl CameraBridge {
    pub fn new(
        links: CameraLinks,
        queue_capacity: usize,
        poll_interval: Duration,
        link: LinkMonitor,
    ) -> Self {
        let endpoint = peer_name(&links.device);
        let (reader, writer) = links.device.into_split();
        Self {
            link,
            commands: CommandChannel::new(endpoint.clone(), writer),
            replies: DeviceReader::new(endpoint, reader, poll_interval),
            analysis: links.analysis,
            analysis_replies: Some(links.analysis_replies),
            relay: Some((links.video, links.frames)),
            queue: Arc::new(FrameQueue::new(queue_capacity)),
            poll_interval,
            discovery: links.discovery,
        }
    }

    /// Open both cloud channels, bind and advertise the video socket, then
    /// wait for the camera to appear and connect to it.
    ///
    /// Discovery retries until the camera answers.  Anything acquired before
    /// a failure is released when this returns.
    pub async fn connect(config: &BridgeConfig, settings: &CameraSettings) -> Result<Bridge<Self>, LinkError> {
        let link = LinkMonitor::new(Self::NAME);

        let (frames, source) = connect_control(&config.channel_url("cam")).await?;
        let (analysis, analysis_replies) = connect_control(&config.channel_url("analyze")).await?;

        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), settings.video_port);
        let video = UdpSocket::bind(bind)
            .await
            .map_err(|e| LinkError::connection(bind.to_string(), e))?;

        let mut discovery = MdnsDiscovery::new(config.query_window)?;
        discovery.advertise(&ServiceAdvertisement {
            service_type: VIDEO_SERVICE.to_string(),
            instance_label: VIDEO_INSTANCE_LABEL.to_string(),
            host_name: VIDEO_HOST_NAME.to_string(),
            address: settings.advertise_address,
            port: settings.video_port,
        })?;

        link.set(LinkState::Discovering);
        let query = ServiceQuery::new(CAMERA_SERVICE, CAMERA_INSTANCE);
        let record = resolve_device(&discovery, &query, config.discovery_retry).await;
        let endpoint = record.socket_addr();
        let device = TcpStream::connect(endpoint)
            .await
            .map_err(|e| LinkError::connection(endpoint.to_string(), e))?;
        link.set(LinkState::Connected);

        let camera = Self::new(
            CameraLinks {
                device,
                video,
                frames: Box::new(frames),
                analysis: Box::new(analysis),
                analysis_replies: Box::new(analysis_replies),
                discovery: Some(discovery),
            },
            settings.queue_capacity,
            config.poll_interval,
            link,
        );
        Ok(Bridge::new(camera, Box::new(source), config.poll_interval))
    }

    async fn send(&mut self, request: CameraRequest) -> Result<(), LinkError> {
        let sent = self.commands.send(&request.command()).await;
        if sent.is_err() {
            self.link.set(LinkState::Degraded);
        }
        sent
    }

    /// Send `TakePicture`, read the still and forward it for analysis.
    #[instrument(name = "take_picture", skip_all, fields(endpoint = %self.commands.endpoint()))]
    async fn take_picture(&mut self, shutdown: &Shutdown) -> Result<(), LinkError> {
        self.send(CameraRequest::Capture).await?;
        let still = match self.replies.read_capture(shutdown).await {
            Ok(still) => still,
            Err(e) => {
                if !e.is_transient() {
                    self.link.set(LinkState::Degraded);
                }
                return Err(e);
            }
        };
        info!(bytes = still.len(), "forwarding capture for analysis");
        self.analysis.send_binary(still).await
    }
}

pub(crate) fn peer_name(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "device".to_string())
}

#[async_trait]
impl DeviceBridge for CameraBridge {
    const NAME: &'static str = "camera";
    type Request = CameraRequest;

    fn link(&self) -> &LinkMonitor {
        &self.link
    }

    fn spawn_tasks(&mut self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let poll = self.poll_interval;
        let mut tasks = Vec::new();

        if let Some(mut replies) = self.analysis_replies.take() {
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                drain_control(replies.as_mut(), &shutdown, poll).await;
            }));
        }

        let Some((socket, mut sink)) = self.relay.take() else {
            return tasks;
        };

        let receiver = {
            let queue = self.queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                receive_frames(&socket, &queue, &shutdown, poll).await;
            })
        };
        let publisher = {
            let queue = self.queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                publish_frames(&queue, sink.as_mut(), &shutdown, poll).await;
                sink.close().await;
            })
        };
        tasks.push(receiver);
        tasks.push(publisher);
        tasks
    }

    async fn handle(&mut self, request: CameraRequest, shutdown: &Shutdown) -> Result<(), LinkError> {
        match request {
            CameraRequest::Capture => self.take_picture(shutdown).await,
            CameraRequest::VideoStream(_) | CameraRequest::Led(_) => self.send(request).await,
        }
    }

    async fn close(&mut self) {
        self.commands.close().await;
        self.analysis.close().await;
        if let Some(mut discovery) = self.discovery.take() {
            discovery.shutdown();
        }
        let dropped = self.queue.dropped();
        if dropped > 0 {
            info!(dropped, "video frames dropped while the publisher lagged");
        }
    }
}
