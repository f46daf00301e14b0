//! ESP32 quadruped ("sentry") bridge.
//!
//! One cloud channel (`…/command/`) carries movement requests in and servo
//! telemetry / obstacle events out.  The device side is a single TCP socket:
//! the dispatcher writes commands, a background listener decodes the
//! device's unsolicited responses.

use std::time::Duration;

use async_trait::async_trait;
use fleetbridge_middleware::discovery::ServiceQuery;
use fleetbridge_middleware::{
    connect_control, listen_responses, resolve_device, CommandChannel, ControlSink, DeviceReader,
    LinkMonitor, MdnsDiscovery, Shutdown,
};
use fleetbridge_protocol::{SentryEvent, SentryRequest};
use fleetbridge_types::{LinkError, LinkState};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::bridge::{Bridge, BridgeConfig, DeviceBridge};
use crate::camera::peer_name;

pub const SENTRY_SERVICE: &str = "_driver._tcp.local.";
pub const SENTRY_INSTANCE: &str = "esp32-bot._driver._tcp.local.";

pub struct SentryBridge {
    link: LinkMonitor,
    commands: CommandChannel<OwnedWriteHalf>,
    listener: Option<(DeviceReader<OwnedReadHalf>, Box<dyn ControlSink>)>,
    discovery: Option<MdnsDiscovery>,
}

impl SentryBridge {
    /// `events` receives every decoded device response as JSON.
    pub fn new(
        device: TcpStream,
        events: Box<dyn ControlSink>,
        discovery: Option<MdnsDiscovery>,
        poll_interval: Duration,
        link: LinkMonitor,
    ) -> Self {
        let endpoint = peer_name(&device);
        let (reader, writer) = device.into_split();
        Self {
            link,
            commands: CommandChannel::new(endpoint.clone(), writer),
            listener: Some((DeviceReader::new(endpoint, reader, poll_interval), events)),
            discovery,
        }
    }

    /// Open the command channel, then wait for the robot to appear and
    /// connect to it.
    pub async fn connect(config: &BridgeConfig) -> Result<Bridge<Self>, LinkError> {
        let link = LinkMonitor::new(Self::NAME);
        let (events, source) = connect_control(&config.channel_url("command")).await?;

        let discovery = MdnsDiscovery::new(config.query_window)?;
        link.set(LinkState::Discovering);
        let query = ServiceQuery::new(SENTRY_SERVICE, SENTRY_INSTANCE);
        let record = resolve_device(&discovery, &query, config.discovery_retry).await;
        let endpoint = record.socket_addr();
        let device = TcpStream::connect(endpoint)
            .await
            .map_err(|e| LinkError::connection(endpoint.to_string(), e))?;
        link.set(LinkState::Connected);

        let sentry = Self::new(
            device,
            Box::new(events),
            Some(discovery),
            config.poll_interval,
            link,
        );
        Ok(Bridge::new(sentry, Box::new(source), config.poll_interval))
    }
}

#[async_trait]
impl DeviceBridge for SentryBridge {
    const NAME: &'static str = "sentry";
    type Request = SentryRequest;

    fn link(&self) -> &LinkMonitor {
        &self.link
    }

    fn spawn_tasks(&mut self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let Some((mut reader, mut events)) = self.listener.take() else {
            return Vec::new();
        };
        let shutdown = shutdown.clone();
        let link = self.link.clone();
        vec![tokio::spawn(async move {
            listen_responses::<SentryEvent, _>(&mut reader, events.as_mut(), &shutdown, &link).await;
            events.close().await;
        })]
    }

    async fn handle(&mut self, request: SentryRequest, _shutdown: &Shutdown) -> Result<(), LinkError> {
        let sent = self.commands.send(&request.command()).await;
        if sent.is_err() {
            self.link.set(LinkState::Degraded);
        }
        sent
    }

    async fn close(&mut self) {
        self.commands.close().await;
        if let Some(mut discovery) = self.discovery.take() {
            discovery.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbridge_middleware::{ChannelSink, ChannelSource, ControlMessage};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct Rig {
        bridge: Bridge<SentryBridge>,
        device: TcpStream,
        control: mpsc::UnboundedSender<String>,
        events: mpsc::UnboundedReceiver<ControlMessage>,
    }

    async fn rig() -> Result<Rig, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let bridge_side = TcpStream::connect(listener.local_addr()?).await?;
        let (device, _) = listener.accept().await?;
        let (sink, events) = ChannelSink::new();
        let (control, source) = ChannelSource::new();

        let poll = Duration::from_millis(50);
        let link = LinkMonitor::new("sentry");
        link.set(LinkState::Connected);
        let sentry = SentryBridge::new(bridge_side, Box::new(sink), None, poll, link);
        Ok(Rig {
            bridge: Bridge::new(sentry, Box::new(source), poll),
            device,
            control,
            events,
        })
    }

    #[tokio::test]
    async fn forward_five_writes_exactly_one_int_command() -> Result<(), Box<dyn std::error::Error>> {
        let Rig { bridge, mut device, control, .. } = rig().await?;
        let handle = bridge.handle();
        let running = tokio::spawn(bridge.start());

        control.send(r#"["forward", 5, 1, 2]"#.to_string())?;
        control.send(r#"["forward", 5]"#.to_string())?;

        let mut written = [0u8; 16];
        device.read_exact(&mut written).await?;
        let fields: Vec<u32> = written
            .chunks(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        // opcode FORWARD, one operand, tag INT, value 5
        assert_eq!(fields, vec![3, 1, 0, 5]);

        handle.quit().await;
        running.await?;

        let mut rest = Vec::new();
        device.read_to_end(&mut rest).await?;
        assert!(rest.is_empty(), "the four-element message must not reach the device");
        Ok(())
    }

    #[tokio::test]
    async fn servo_report_reaches_the_control_channel() -> Result<(), Box<dyn std::error::Error>> {
        let Rig { bridge, mut device, control: _control, mut events } = rig().await?;
        let handle = bridge.handle();
        let running = tokio::spawn(bridge.start());

        let mut report = 0u32.to_le_bytes().to_vec();
        for angle in 0..12u32 {
            report.extend_from_slice(&angle.to_le_bytes());
        }
        report.extend_from_slice(&1u32.to_le_bytes());
        device.write_all(&report).await?;

        assert_eq!(
            events.recv().await,
            Some(ControlMessage::Text("[\"servo\",[0,1,2,3,4,5,6,7,8,9,10,11]]".into()))
        );
        assert_eq!(events.recv().await, Some(ControlMessage::Text("[\"obstacle\"]".into())));

        handle.quit().await;
        running.await?;
        Ok(())
    }

    #[tokio::test]
    async fn device_disconnect_degrades_the_link_until_quit() -> Result<(), Box<dyn std::error::Error>> {
        let Rig { bridge, device, control, .. } = rig().await?;
        let handle = bridge.handle();
        let mut link = handle.link_state();
        let running = tokio::spawn(bridge.start());

        drop(device);
        link.wait_for(|s| *s == LinkState::Degraded).await?;

        // Still dispatching; the write may or may not fail, but nothing hangs.
        control.send(r#"["stand"]"#.to_string())?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!running.is_finished());

        handle.quit().await;
        running.await?;
        assert_eq!(*link.borrow(), LinkState::Disconnected);
        Ok(())
    }
}
