//! mDNS / DNS-SD service discovery.
//!
//! A bridge plays two roles on the LAN:
//!
//! * **Publisher** – the camera bridge advertises its own datagram endpoint
//!   (e.g. `host._video._udp.local.`) so the device knows where to stream.
//! * **Consumer** – every bridge resolves the device's control endpoint
//!   (e.g. `esp32-bot._driver._tcp.local.`) before opening the command
//!   socket.
//!
//! Resolution never gives up: the device may be powered on long after the
//! bridge, so [`resolve_device`] polls with a fixed backoff until an address
//! shows up.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleetbridge_types::{LinkError, ServiceRecord};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, instrument, warn};

/// How long a single mDNS query listens for answers.
pub const DEFAULT_QUERY_WINDOW: Duration = Duration::from_secs(3);

/// A device service to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceQuery {
    /// e.g. `"_video._tcp.local."`
    pub service_type: String,
    /// Full instance name, e.g. `"esp32-cam._video._tcp.local."`.
    pub instance: String,
}

impl ServiceQuery {
    pub fn new(service_type: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            instance: instance.into(),
        }
    }
}

/// This bridge's own endpoint, as advertised to devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAdvertisement {
    /// e.g. `"_video._udp.local."`
    pub service_type: String,
    /// Instance label without the service type, e.g. `"host"`.
    pub instance_label: String,
    /// e.g. `"host.local."`
    pub host_name: String,
    pub address: IpAddr,
    pub port: u16,
}

/// Performs a single discovery query.
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    /// Query once.  `Ok(None)` when no record carrying an address answered.
    async fn query(&self, query: &ServiceQuery) -> Result<Option<ServiceRecord>, LinkError>;
}

/// Resolve `query`, retrying every `retry_interval` until it succeeds.
///
/// Never returns without a record.  Query errors are logged and retried like
/// empty answers.
#[instrument(skip_all, fields(service = %query.service_type, instance = %query.instance))]
pub async fn resolve_device<R>(
    resolver: &R,
    query: &ServiceQuery,
    retry_interval: Duration,
) -> ServiceRecord
where
    R: ServiceResolver + ?Sized,
{
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        match resolver.query(query).await {
            Ok(Some(record)) => {
                info!(
                    instance = %record.instance,
                    endpoint = %record.socket_addr(),
                    attempt,
                    "device resolved"
                );
                return record;
            }
            Ok(None) => {
                debug!(instance = %query.instance, attempt, "device not found yet");
            }
            Err(e) => {
                warn!(instance = %query.instance, attempt, error = %e, "discovery query failed");
            }
        }
        tokio::time::sleep(retry_interval).await;
    }
}

/// [`ServiceResolver`] and advertiser backed by an `mdns-sd` daemon.
///
/// Dropping it unregisters the advertisement and stops the daemon.
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    query_window: Duration,
    advertised: Option<String>,
    closed: bool,
}

impl MdnsDiscovery {
    /// Start an mDNS daemon.
    ///
    /// # Errors
    ///
    /// [`LinkError::Discovery`] if the daemon cannot open its sockets.
    pub fn new(query_window: Duration) -> Result<Self, LinkError> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| LinkError::Discovery(format!("mdns daemon start: {e}")))?;
        Ok(Self {
            daemon,
            query_window,
            advertised: None,
            closed: false,
        })
    }

    /// Advertise `ad`.  Advertising the same service again is a no-op.
    pub fn advertise(&mut self, ad: &ServiceAdvertisement) -> Result<(), LinkError> {
        let info = ServiceInfo::new(
            &ad.service_type,
            &ad.instance_label,
            &ad.host_name,
            ad.address.to_string().as_str(),
            ad.port,
            HashMap::<String, String>::new(),
        )
        .map_err(|e| LinkError::Discovery(format!("invalid advertisement: {e}")))?;

        let fullname = info.get_fullname().to_string();
        if self.advertised.as_deref() == Some(fullname.as_str()) {
            return Ok(());
        }
        self.daemon
            .register(info)
            .map_err(|e| LinkError::Discovery(format!("register {fullname}: {e}")))?;
        info!(service = %fullname, address = %ad.address, port = ad.port, "advertised bridge endpoint");
        self.advertised = Some(fullname);
        Ok(())
    }

    /// Withdraw the advertisement and stop the daemon.  Idempotent.
    pub fn shutdown(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        if let Some(fullname) = self.advertised.take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                warn!(service = %fullname, error = %e, "mdns unregister failed");
            }
        }
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "mdns daemon shutdown");
        }
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl ServiceResolver for MdnsDiscovery {
    async fn query(&self, query: &ServiceQuery) -> Result<Option<ServiceRecord>, LinkError> {
        let daemon = self.daemon.clone();
        let query = query.clone();
        let window = self.query_window;
        tokio::task::spawn_blocking(move || browse_once(&daemon, &query, window))
            .await
            .map_err(|e| LinkError::Discovery(format!("browse task failed: {e}")))?
    }
}

/// Browse `query.service_type` for up to `window`, stopping at the first
/// matching instance that carries an address.
fn browse_once(
    daemon: &ServiceDaemon,
    query: &ServiceQuery,
    window: Duration,
) -> Result<Option<ServiceRecord>, LinkError> {
    let receiver = daemon
        .browse(&query.service_type)
        .map_err(|e| LinkError::Discovery(format!("browse {}: {e}", query.service_type)))?;

    let deadline = Instant::now() + window;
    let mut found = None;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match receiver.recv_timeout(remaining) {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                found = record_from_info(query, &info);
                if found.is_some() {
                    break;
                }
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }

    if let Err(e) = daemon.stop_browse(&query.service_type) {
        debug!(error = %e, "mdns stop_browse");
    }
    Ok(found)
}

/// Turn a resolved mDNS answer into a record if it is the instance we want
/// and has at least one address.  IPv4 is preferred.
fn record_from_info(query: &ServiceQuery, info: &ServiceInfo) -> Option<ServiceRecord> {
    if info.get_fullname() != query.instance {
        return None;
    }
    let addresses = info.get_addresses();
    let address = addresses
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addresses.iter().next())
        .copied()?;
    Some(ServiceRecord {
        service_type: query.service_type.clone(),
        instance: query.instance.clone(),
        address,
        port: info.get_port(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers nothing for the first `misses` queries, then a fixed record.
    struct ScriptedResolver {
        misses: usize,
        fail_instead_of_miss: bool,
        calls: AtomicUsize,
    }

    impl ScriptedResolver {
        fn new(misses: usize) -> Self {
            Self {
                misses,
                fail_instead_of_miss: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ServiceResolver for ScriptedResolver {
        async fn query(&self, query: &ServiceQuery) -> Result<Option<ServiceRecord>, LinkError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.misses {
                if self.fail_instead_of_miss {
                    return Err(LinkError::Discovery("no route".into()));
                }
                return Ok(None);
            }
            Ok(Some(ServiceRecord {
                service_type: query.service_type.clone(),
                instance: query.instance.clone(),
                address: IpAddr::V4(Ipv4Addr::new(192, 168, 137, 20)),
                port: 80,
            }))
        }
    }

    fn cam_query() -> ServiceQuery {
        ServiceQuery::new("_video._tcp.local.", "esp32-cam._video._tcp.local.")
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_fixed_backoff_until_found() {
        let resolver = ScriptedResolver::new(3);
        let started = tokio::time::Instant::now();

        let record = resolve_device(&resolver, &cam_query(), Duration::from_secs(1)).await;

        assert_eq!(record.port, 80);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn never_returns_while_device_is_absent() {
        let resolver = ScriptedResolver::new(usize::MAX);

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            resolve_device(&resolver, &cam_query(), Duration::from_secs(1)),
        )
        .await;

        assert!(outcome.is_err(), "resolution must not return without a record");
        let calls = resolver.calls.load(Ordering::SeqCst);
        assert!((10..=11).contains(&calls), "expected ~1 query per second, got {calls}");
    }

    #[tokio::test(start_paused = true)]
    async fn query_errors_are_retried() {
        let resolver = ScriptedResolver {
            misses: 2,
            fail_instead_of_miss: true,
            calls: AtomicUsize::new(0),
        };
        let record = resolve_device(&resolver, &cam_query(), Duration::from_secs(1)).await;
        assert_eq!(record.instance, "esp32-cam._video._tcp.local.");
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn record_from_info_matches_instance_name() {
        let info = ServiceInfo::new(
            "_video._tcp.local.",
            "esp32-cam",
            "esp32-cam.local.",
            "192.168.137.7",
            81,
            HashMap::<String, String>::new(),
        )
        .unwrap();

        let record = record_from_info(&cam_query(), &info).expect("instance matches");
        assert_eq!(record.socket_addr().to_string(), "192.168.137.7:81");

        let other = ServiceQuery::new("_video._tcp.local.", "other._video._tcp.local.");
        assert!(record_from_info(&other, &info).is_none());
    }
}
