use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    action::{ActionDesc, ActionError},
    device_description::{DeviceData, DeviceDataBuilder},
    eventing::subscriber::NOTIFY_CONNECT_TIMEOUT,
    router::{make_router, HostState},
    service::Service,
    ssdp::{
        advertisements, bind_interface_socket, outbound_interface_for, sleep_rand_millis,
        usable_interfaces, Announce, Announcer, BroadcastMessage, NotificationType,
        SsdpListener, SsdpMessageSink, DEFAULT_SSDP_TTL, DLNA_GROUP_SPACING, SSDP_ADDR,
    },
    templates::UpnpAgent,
};

/// Smallest re-announcement period regardless of the advertised lease
const MIN_ANNOUNCE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DeviceHostConfig {
    pub user_agent: UpnpAgent<'static>,
    /// 0 binds an ephemeral port; the description url is rewritten to match
    pub port: u16,
    pub description_path: String,
    /// Clear stale cache entries from peers before the first alive sweep
    pub byebye_first: bool,
    /// Spec strict DLNA pacing: spaced advertisement groups and doubled
    /// search responses
    pub strict_dlna_pacing: bool,
    /// Verify Soap envelope namespace and encoding style on control requests
    pub strict_soap: bool,
    pub ssdp_ttl: u32,
}

impl Default for DeviceHostConfig {
    fn default() -> Self {
        Self {
            user_agent: UpnpAgent::default(),
            port: 0,
            description_path: "/".to_string(),
            byebye_first: true,
            strict_dlna_pacing: false,
            strict_soap: true,
            ssdp_ttl: DEFAULT_SSDP_TTL,
        }
    }
}

/// Profile hook invoked for every validated Soap action. Arguments arrive
/// decoded in descriptor order; the returned pairs become the out arguments
/// of the response envelope.
#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
    async fn on_action(
        &self,
        service: Arc<Service>,
        action: &ActionDesc,
        arguments: Vec<(String, String)>,
    ) -> Result<Vec<(String, String)>, ActionError>;
}

/// Hosts a device tree on the network: advertises over SSDP, serves
/// description/SCPD documents, dispatches control and event requests
pub struct DeviceHost {
    device: Arc<DeviceData>,
    location: String,
    config: DeviceHostConfig,
    token: CancellationToken,
    ssdp: Arc<SsdpListener>,
    responder: Arc<dyn SsdpMessageSink>,
}

impl DeviceHost {
    /// Binds the http server, finalizes the device tree with the bound
    /// address, starts announcing and registers with the shared SSDP listener
    pub async fn start(
        builder: DeviceDataBuilder,
        handler: Arc<dyn ActionHandler>,
        ssdp: Arc<SsdpListener>,
        config: DeviceHostConfig,
    ) -> anyhow::Result<Self> {
        let listener = match tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port))
            .await
        {
            Ok(listener) => listener,
            Err(e) if config.port != 0 => {
                tracing::warn!(port = config.port, "Bind failed ({e}), retrying ephemeral");
                tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?
            }
            Err(e) => return Err(e.into()),
        };
        let port = listener.local_addr()?.port();
        let local_ip = outbound_interface_for(SSDP_ADDR)
            .ok()
            .or_else(|| usable_interfaces().first().copied().map(IpAddr::V4))
            .context("no usable network interface")?;
        let url_base = reqwest::Url::parse(&format!("http://{local_ip}:{port}/"))
            .expect("constructed url is valid");
        let location = format!(
            "http://{local_ip}:{port}{path}",
            path = config.description_path
        );

        let device = builder.build(url_base);
        for service in device.all_services(usize::MAX) {
            service.attach();
        }

        let server_header = config.user_agent.to_string();
        let token = CancellationToken::new();
        let notify_client = reqwest::Client::builder()
            .connect_timeout(NOTIFY_CONNECT_TIMEOUT)
            .build()
            .context("build notify client")?;

        let state = Arc::new(HostState {
            device: device.clone(),
            handler,
            notify_client,
            token: token.clone(),
            server_header: server_header.clone(),
            strict_soap: config.strict_soap,
            description_path: config.description_path.clone(),
        });
        let router = make_router(state);
        let server_token = token.clone();
        tokio::spawn(async move {
            let result = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(server_token.cancelled_owned())
            .await;
            if let Err(e) = result {
                tracing::error!("Device host http server failed: {e}");
            }
        });

        tokio::spawn(announcement_task(
            device.clone(),
            location.clone(),
            server_header.clone(),
            config.clone(),
            token.clone(),
        ));

        let responder: Arc<dyn SsdpMessageSink> = Arc::new(SearchResponder {
            device: device.clone(),
            location: location.clone(),
            server_header: server_header.clone(),
            config: config.clone(),
        });
        ssdp.register_sink(responder.clone());

        tracing::info!(uuid = %device.uuid(), location, "Device host started");

        Ok(Self {
            device,
            location,
            config,
            token,
            ssdp,
            responder,
        })
    }

    pub fn device(&self) -> &Arc<DeviceData> {
        &self.device
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Announces departure and tears everything down. The byebye sweep goes
    /// out before the http server stops serving.
    pub async fn stop(self) {
        self.ssdp.unregister_sink(&self.responder);
        byebye_sweep(&self.device, self.config.ssdp_ttl).await;
        self.token.cancel();
        tracing::info!(uuid = %self.device.uuid(), "Device host stopped");
    }
}

/// Alive sweep over every usable interface
async fn alive_sweep(
    device: &DeviceData,
    location: &str,
    server: &str,
    config: &DeviceHostConfig,
) {
    for interface in usable_interfaces() {
        let socket = match bind_interface_socket(interface, config.ssdp_ttl) {
            Ok(socket) => socket,
            Err(e) => {
                tracing::debug!("Failed to bind announce socket on {interface}: {e}");
                continue;
            }
        };
        let mut announcer = Announcer::new(Arc::new(socket), SSDP_ADDR);
        if let Err(e) = announcer
            .announce_alive(device, location, server, config.strict_dlna_pacing)
            .await
        {
            tracing::warn!("Failed to announce on {interface}: {e}");
        }
    }
}

async fn byebye_sweep(device: &DeviceData, ttl: u32) {
    tracing::info!(uuid = %device.uuid(), "Sending bye bye sweep");
    for interface in usable_interfaces() {
        let socket = match bind_interface_socket(interface, ttl) {
            Ok(socket) => socket,
            Err(e) => {
                tracing::debug!("Failed to bind announce socket on {interface}: {e}");
                continue;
            }
        };
        let mut announcer = Announcer::new(Arc::new(socket), SSDP_ADDR);
        if let Err(e) = announcer.announce_byebye(device).await {
            tracing::warn!("Failed to send byebye on {interface}: {e}");
        }
    }
}

/// Periodic advertisement: jittered initial alive, then re-announce at
/// `max(30s, lease/2 - 10s)` until cancelled
async fn announcement_task(
    device: Arc<DeviceData>,
    location: String,
    server: String,
    config: DeviceHostConfig,
    token: CancellationToken,
) {
    // initial alive is delayed by a uniform random 0-100 ms
    sleep_rand_millis(0..100).await;
    if config.byebye_first {
        byebye_sweep(&device, config.ssdp_ttl).await;
    }
    let lease = device.lease_time();
    let period = MIN_ANNOUNCE_PERIOD.max((lease / 2).saturating_sub(Duration::from_secs(10)));
    loop {
        alive_sweep(&device, &location, &server, &config).await;
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = token.cancelled() => return,
        }
    }
}

/// Answers M-SEARCH queries for the hosted device tree. The kernel routed
/// interface must be one of ours so a single query yields one response per
/// interface.
struct SearchResponder {
    device: Arc<DeviceData>,
    location: String,
    server_header: String,
    config: DeviceHostConfig,
}

impl SearchResponder {
    fn matching_announces(&self, st: &NotificationType) -> Vec<Announce> {
        let lease = self.device.lease_time().as_secs() as usize;
        advertisements(&self.device, true)
            .into_iter()
            .filter(|(nt, _)| match (st, nt) {
                (NotificationType::All, _) => true,
                (NotificationType::RootDevice, NotificationType::RootDevice) => true,
                (NotificationType::Uuid(want), NotificationType::Uuid(have)) => want == have,
                (NotificationType::Urn(want), NotificationType::Urn(have)) => want == have,
                _ => false,
            })
            .map(|(nt, usn)| Announce {
                cache_control: lease,
                location: self.location.clone(),
                server: self.server_header.clone(),
                notification_type: nt,
                usn,
            })
            .collect()
    }
}

impl SsdpMessageSink for SearchResponder {
    fn on_ssdp_message(&self, message: &BroadcastMessage<'_>, sender: SocketAddr) {
        let BroadcastMessage::Search(search) = message else {
            return;
        };
        // MX is mandatory on multicast searches; zero maps to zero delay,
        // never to an unbounded one
        let Some(mx) = search.mx else {
            return;
        };
        let matches = self.matching_announces(&search.st);
        if matches.is_empty() {
            return;
        }
        tracing::debug!(
            st = %search.st,
            user_agent = ?search.user_agent,
            mx = ?search.mx,
            addr = %sender,
            "Search message"
        );

        // one response per interface: the kernel picks the outbound interface
        // for this querier, and only that interface answers
        let Ok(IpAddr::V4(interface)) = outbound_interface_for(sender) else {
            return;
        };
        if !usable_interfaces().contains(&interface) {
            return;
        }

        let mx = mx.min(5) as u64;
        let strict = self.config.strict_dlna_pacing;
        let ttl = self.config.ssdp_ttl;
        tokio::spawn(async move {
            sleep_rand_millis(0..mx * 1000).await;
            let socket = bind_interface_socket(interface, ttl)?;
            let mut announcer = Announcer::new(Arc::new(socket), sender);
            for announce in &matches {
                announcer.answer_search(announce).await?;
                if strict {
                    // spec strict mode repeats each response
                    tokio::time::sleep(DLNA_GROUP_SPACING).await;
                    announcer.answer_search(announce).await?;
                }
            }
            Ok::<_, anyhow::Error>(())
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        service::{Service, ServiceUrls},
        ssdp::NotificationType,
        urn::{ServiceType, URN},
    };

    use super::{DeviceHostConfig, SearchResponder};

    fn test_responder() -> (SearchResponder, uuid::Uuid) {
        let uuid = uuid::Uuid::new_v4();
        let device = crate::device_description::DeviceData::builder(
            URN::media_server(),
            "Search target",
        )
        .uuid(uuid)
        .service(Service::new(
            URN::upnp_service(ServiceType::ContentDirectory, 1),
            "urn:upnp-org:serviceId:ContentDirectory",
            ServiceUrls::for_service("content_directory", uuid),
        ))
        .build(reqwest::Url::parse("http://192.168.1.5:8000/").unwrap());
        let responder = SearchResponder {
            device,
            location: "http://192.168.1.5:8000/".to_string(),
            server_header: "test/1.0 UPnP/1.0 upnp/0.1".to_string(),
            config: DeviceHostConfig::default(),
        };
        (responder, uuid)
    }

    #[test]
    fn search_matching_covers_every_usn_form() {
        let (responder, uuid) = test_responder();

        // root + uuid + device type + one service
        assert_eq!(
            responder.matching_announces(&NotificationType::All).len(),
            4
        );
        assert_eq!(
            responder
                .matching_announces(&NotificationType::RootDevice)
                .len(),
            1
        );
        assert_eq!(
            responder
                .matching_announces(&NotificationType::Uuid(uuid))
                .len(),
            1
        );
        assert_eq!(
            responder
                .matching_announces(&NotificationType::Uuid(uuid::Uuid::new_v4()))
                .len(),
            0
        );
        let service_urn = NotificationType::Urn(URN::upnp_service(
            ServiceType::ContentDirectory,
            1,
        ));
        assert_eq!(responder.matching_announces(&service_urn).len(), 1);
        let wrong_version =
            NotificationType::Urn(URN::upnp_service(ServiceType::ContentDirectory, 2));
        assert_eq!(responder.matching_announces(&wrong_version).len(), 0);
    }
}
