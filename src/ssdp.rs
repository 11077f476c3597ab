use core::str;
use std::{
    borrow::Cow,
    fmt::Display,
    io::{Cursor, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use socket2::{Domain, Protocol, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::{
    device_description::{DeviceData, Udn},
    urn::URN,
};

pub(crate) const SSDP_IP_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub(crate) const SSDP_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(SSDP_IP_ADDR, 1900));
pub const DEFAULT_SSDP_TTL: u32 = 2;

/// Spacing between packets of one alive burst
pub(crate) const ALIVE_PACKET_SPACING: Duration = Duration::from_millis(50);
/// Spacing between advertisement groups under strict DLNA pacing
pub(crate) const DLNA_GROUP_SPACING: Duration = Duration::from_millis(200);

pub(crate) async fn sleep_rand_millis(range: std::ops::Range<u64>) {
    if range.is_empty() {
        return;
    }
    let millis = {
        use rand::Rng;
        let mut rng = rand::rng();
        rng.random_range(range)
    };
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

/// Host interfaces usable for SSDP: up with a non-zero unicast IPv4 address
/// that is not loopback
pub fn usable_interfaces() -> Vec<Ipv4Addr> {
    let mut addrs: Vec<Ipv4Addr> = NetworkInterface::show()
        .into_iter()
        .flatten()
        .flat_map(|nic| nic.addr.into_iter())
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
            _ => None,
        })
        .collect();
    addrs.sort();
    addrs.dedup();
    addrs
}

/// Lets the kernel route a datagram to `target` and reports the local address
/// it picked. The search responder compares it against the interface it is
/// answering for so every interface produces exactly one response.
pub fn outbound_interface_for(target: SocketAddr) -> anyhow::Result<IpAddr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(target)?;
    Ok(socket.local_addr()?.ip())
}

pub(crate) fn bind_ssdp_socket(ttl: Option<u32>) -> anyhow::Result<UdpSocket> {
    let local_ip = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 1900);
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_ttl(ttl.unwrap_or(DEFAULT_SSDP_TTL))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.set_multicast_loop_v4(true)?;
    socket.join_multicast_v4(&SSDP_IP_ADDR, &Ipv4Addr::UNSPECIFIED)?;
    for interface in usable_interfaces() {
        if let Err(e) = socket.join_multicast_v4(&SSDP_IP_ADDR, &interface) {
            tracing::debug!("Failed to join multicast group on {interface}: {e}");
        }
    }
    socket.bind(&SocketAddr::V4(local_ip).into())?;
    let socket = UdpSocket::from_std(socket.into())?;
    Ok(socket)
}

/// Datagram socket bound to one interface, used for outbound advertisement
pub(crate) fn bind_interface_socket(interface: Ipv4Addr, ttl: u32) -> anyhow::Result<UdpSocket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_ttl(ttl)?;
    socket.set_nonblocking(true)?;
    socket.set_multicast_if_v4(&interface)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(interface, 0)).into())?;
    let socket = UdpSocket::from_std(socket.into())?;
    Ok(socket)
}

///  Unique Service Name. Identifies a unique instance of a device or service.
#[derive(Debug, Clone)]
pub struct USN {
    udn: Udn,
    kind: USNkind,
}

#[derive(Debug, Clone)]
pub enum USNkind {
    RootDevice,
    DeviceUuid,
    URN(URN),
}

impl USN {
    pub const fn root_device(udn: Udn) -> Self {
        Self {
            udn,
            kind: USNkind::RootDevice,
        }
    }
    pub const fn device_uuid(udn: Udn) -> Self {
        Self {
            udn,
            kind: USNkind::DeviceUuid,
        }
    }
    pub const fn urn(udn: Udn, urn: URN) -> Self {
        Self {
            udn,
            kind: USNkind::URN(urn),
        }
    }

    pub fn uuid(&self) -> uuid::Uuid {
        self.udn.uuid()
    }

    pub fn kind(&self) -> &USNkind {
        &self.kind
    }
}

impl Display for USN {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.udn)?;
        match &self.kind {
            USNkind::RootDevice => write!(f, "::upnp:rootdevice"),
            USNkind::DeviceUuid => Ok(()),
            USNkind::URN(urn) => write!(f, "::{urn}"),
        }
    }
}

impl FromStr for USN {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((start, rest)) = s.split_once("::") else {
            let udn = Udn::from_str(s)?;
            return Ok(Self::device_uuid(udn));
        };
        let udn = Udn::from_str(start)?;

        if rest == "upnp:rootdevice" {
            return Ok(Self::root_device(udn));
        }

        let urn = URN::from_str(rest)?;
        Ok(Self {
            udn,
            kind: USNkind::URN(urn),
        })
    }
}

#[derive(Debug, Clone)]
pub enum NotificationType {
    /// `ssdp:all` matches every device and service on the network
    All,
    /// `upnp:rootdevice` matches root devices only
    RootDevice,
    Uuid(uuid::Uuid),
    Urn(URN),
}

impl FromStr for NotificationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ssdp:all" => Self::All,
            "upnp:rootdevice" => Self::RootDevice,
            rest if rest.starts_with("urn:") => Self::Urn(URN::from_str(rest)?),
            rest if rest.starts_with("uuid:") => Self::Uuid(
                rest.strip_prefix("uuid:")
                    .expect("prefix checked above")
                    .parse()?,
            ),
            rest => Err(anyhow::anyhow!("Unknown notification type: {rest}"))?,
        })
    }
}

impl Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationType::All => write!(f, "ssdp:all"),
            NotificationType::RootDevice => write!(f, "upnp:rootdevice"),
            NotificationType::Uuid(id) => write!(f, "uuid:{id}"),
            NotificationType::Urn(urn) => write!(f, "{urn}"),
        }
    }
}

/// Notification subtype. Specifies type of notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationSubType {
    /// Sent when a device joins the network or to periodically reaffirm its
    /// presence
    Alive,
    /// Sent when a device is being removed from the network or shutting down
    ByeBye,
    /// Sent when details of the device changed
    Update,
}

impl Display for NotificationSubType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            NotificationSubType::Alive => "alive",
            NotificationSubType::ByeBye => "byebye",
            NotificationSubType::Update => "update",
        };
        write!(f, "ssdp:{msg}")
    }
}

impl FromStr for NotificationSubType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ssdp:alive" => Self::Alive,
            "ssdp:byebye" => Self::ByeBye,
            "ssdp:update" => Self::Update,
            rest => Err(anyhow::anyhow!("Unknown notification sub type: {rest}"))?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SearchMessage<'a> {
    pub host: SocketAddr,
    pub st: NotificationType,
    /// Maximum wait time in seconds. Device responses are delayed a random
    /// duration between 0 and this many seconds to balance load on the
    /// control point.
    pub mx: Option<usize>,
    pub user_agent: Option<&'a str>,
}

impl Display for SearchMessage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "M-SEARCH * HTTP/1.1\r\n\
HOST: {host}\r\n\
MAN: \"ssdp:discover\"\r\n\
ST: {search_target}\r\n",
            host = self.host,
            search_target = self.st,
        )?;
        if let Some(mx) = self.mx {
            write!(f, "MX: {mx}\r\n")?;
        }
        if let Some(user_agent) = self.user_agent {
            write!(f, "USER-AGENT: {user_agent}\r\n")?;
        }
        write!(f, "\r\n")
    }
}

/// Responses to search requests are intentionally parallel to advertisements:
/// same fields as a NOTIFY with ssdp:alive, except the NT header becomes ST.
#[derive(Debug, Clone)]
pub struct Announce {
    /// Lease time in seconds, carried as `CACHE-CONTROL: max-age=N`
    pub cache_control: usize,
    pub location: String,
    pub server: String,
    pub notification_type: NotificationType,
    pub usn: USN,
}

pub trait AnnounceHandler {
    fn handle_announce(announce: &Announce, f: impl Write) -> anyhow::Result<()>;
    fn parse_announce(announce: &str) -> anyhow::Result<Announce>;
}

fn parse_announce_headers<'a>(
    first_line: &'static str,
    nt_header: &'static str,
    announce: &'a str,
) -> anyhow::Result<Announce> {
    let mut cache_control = None;
    let mut location = None;
    let mut server = None;
    let mut notification_type = None;
    let mut usn = None;
    let mut lines = announce.lines();
    anyhow::ensure!(lines.next().map(str::trim) == Some(first_line));
    let headers = lines.filter_map(|l| l.split_once(':'));

    for (name, value) in headers {
        let value = value.trim();
        let name = name.to_ascii_lowercase();
        match name.as_str() {
            "cache-control" => {
                let (prefix, cache_duration) =
                    value.split_once('=').context("split cache control")?;
                anyhow::ensure!(prefix.trim() == "max-age");
                cache_control = Some(cache_duration.parse().context("parse duration seconds")?)
            }
            "location" => location = Some(value.to_owned()),
            "server" => server = Some(value.to_owned()),
            "nts" => anyhow::ensure!(value == "ssdp:alive"),
            "usn" => usn = USN::from_str(value).map(Some)?,
            name if name == nt_header => {
                notification_type = NotificationType::from_str(value).map(Some)?
            }
            _ => (),
        }
    }

    Ok(Announce {
        cache_control: cache_control.context("parse cache_control")?,
        location: location.context("parse location")?,
        server: server.context("parse server")?,
        notification_type: notification_type.context("parse notification_type")?,
        usn: usn.context("parse usn")?,
    })
}

/// Multicast announce aka NOTIFY with nts: ssdp:alive
pub struct MulticastAnnounce;

impl AnnounceHandler for MulticastAnnounce {
    fn handle_announce(a: &Announce, mut f: impl Write) -> anyhow::Result<()> {
        write!(
            f,
            "NOTIFY * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
CACHE-CONTROL: max-age={cache_control}\r\n\
LOCATION: {location}\r\n\
NT: {nt}\r\n\
NTS: ssdp:alive\r\n\
SERVER: {server}\r\n\
USN: {usn}\r\n\r\n",
            cache_control = a.cache_control,
            location = a.location,
            nt = a.notification_type,
            server = a.server,
            usn = a.usn,
        )?;
        Ok(())
    }

    fn parse_announce(announce: &str) -> anyhow::Result<Announce> {
        parse_announce_headers("NOTIFY * HTTP/1.1", "nt", announce)
    }
}

/// Unicast announce aka search response
pub struct UnicastAnnounce;

impl AnnounceHandler for UnicastAnnounce {
    fn handle_announce(a: &Announce, mut f: impl Write) -> anyhow::Result<()> {
        let now = time::OffsetDateTime::now_utc();
        let format = time::format_description::parse_borrowed::<2>("[weekday repr:short], [day padding:zero] [month repr:short] [year] [hour]:[minute]:[second] GMT").expect("infallible");
        let formatted_date = now.format(&format).expect("infallible");
        write!(
            f,
            "HTTP/1.1 200 OK\r\n\
CACHE-CONTROL: max-age={cache_control}\r\n\
DATE: {date}\r\n\
EXT:\r\n\
LOCATION: {location}\r\n\
SERVER: {server}\r\n\
ST: {st}\r\n\
USN: {usn}\r\n\r\n",
            cache_control = a.cache_control,
            date = formatted_date,
            location = a.location,
            server = a.server,
            st = a.notification_type,
            usn = a.usn,
        )?;
        Ok(())
    }

    fn parse_announce(announce: &str) -> anyhow::Result<Announce> {
        parse_announce_headers("HTTP/1.1 200 OK", "st", announce)
    }
}

#[derive(Debug, Clone)]
pub struct NotifyAliveMessage<'a> {
    pub host: SocketAddr,
    /// Url of the device description
    pub location: Cow<'a, str>,
    pub usn: USN,
    pub nt: NotificationType,
    pub nts: NotificationSubType,
    /// Cache life time in seconds
    pub cache_control: usize,
    pub server: &'a str,
}

#[derive(Debug, Clone)]
pub struct NotifyByeByeMessage {
    pub host: SocketAddr,
    pub usn: USN,
    pub nt: NotificationType,
    pub nts: NotificationSubType,
}

impl Display for NotifyByeByeMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NOTIFY * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
NT: {nt}\r\n\
NTS: {nts}\r\n\
USN: {usn}\r\n\r\n",
            nt = self.nt,
            nts = self.nts,
            usn = self.usn,
        )
    }
}

#[derive(Debug, Clone)]
pub struct NotifyUpdateMessage<'a> {
    pub host: SocketAddr,
    pub usn: &'a str,
    pub location: &'a str,
    pub nt: NotificationType,
    pub nts: NotificationSubType,
}

#[derive(Debug)]
pub enum BroadcastMessage<'a> {
    Search(SearchMessage<'a>),
    NotifyAlive(NotifyAliveMessage<'a>),
    NotifyByeBye(NotifyByeByeMessage),
    NotifyUpdate(NotifyUpdateMessage<'a>),
}

impl BroadcastMessage<'_> {
    pub fn parse_ssdp_payload(s: &str) -> anyhow::Result<BroadcastMessage<'_>> {
        let mut lines = s.lines();
        let request_line = lines.next().context("request line")?.trim();
        let (method, rest) = request_line.split_once(' ').context("split request line")?;
        let headers = lines.filter_map(|l| l.split_once(':'));
        match method {
            "M-SEARCH" => {
                anyhow::ensure!(
                    rest == "* HTTP/1.1",
                    "malformed search request line: {request_line}"
                );
                let mut host = None;
                let mut man = None;
                let mut st = None;
                let mut mx = None;
                let mut user_agent = None;
                for (name, value) in headers {
                    let value = value.trim();
                    match name.to_ascii_lowercase().as_str() {
                        "host" => {
                            host = Some(SocketAddr::V4(
                                SocketAddrV4::from_str(value).context("parse host address")?,
                            ));
                        }
                        "man" => man = Some(value),
                        "st" => st = Some(NotificationType::from_str(value)?),
                        "mx" => mx = Some(value.parse()?),
                        "user-agent" => user_agent = Some(value),
                        _ => (),
                    }
                }
                anyhow::ensure!(
                    man == Some("\"ssdp:discover\""),
                    "missing mandatory discover header"
                );
                let host = host.context("missing host")?;
                let st = st.context("missing st")?;
                let search_message = SearchMessage {
                    host,
                    st,
                    mx,
                    user_agent,
                };
                Ok(BroadcastMessage::Search(search_message))
            }
            "NOTIFY" => {
                let mut host = None;
                let mut nts = None;
                let mut location = None;
                let mut nt = None;
                let mut usn = None;
                let mut cache_control = None;
                let mut server = None;
                for (name, value) in headers {
                    let value = value.trim();
                    match name.to_ascii_lowercase().as_str() {
                        "host" => {
                            host = Some(SocketAddr::V4(
                                SocketAddrV4::from_str(value).context("parse host address")?,
                            ));
                        }
                        "location" => location = Some(value),
                        "usn" => usn = Some(value),
                        "nt" => nt = Some(NotificationType::from_str(value)?),
                        "nts" => nts = Some(NotificationSubType::from_str(value)?),
                        "server" => server = Some(value),
                        "cache-control" => {
                            let (prefix, cache_duration) =
                                value.split_once('=').context("split cache control")?;
                            anyhow::ensure!(prefix.trim() == "max-age");
                            cache_control =
                                Some(cache_duration.parse().context("parse duration seconds")?)
                        }
                        _ => (),
                    }
                }
                let nt = nt.context("missing nt")?;
                let nts = nts.context("missing nts")?;
                let host = host.context("missing host")?;
                let usn = usn.context("missing usn")?;
                match nts {
                    NotificationSubType::Alive => {
                        let location = location.context("missing location")?;
                        let cache_control = cache_control.context("missing cache control")?;
                        let server = server.context("missing server")?;
                        let notify_message = NotifyAliveMessage {
                            host,
                            location: Cow::Borrowed(location),
                            usn: USN::from_str(usn)?,
                            nt,
                            nts,
                            cache_control,
                            server,
                        };
                        Ok(BroadcastMessage::NotifyAlive(notify_message))
                    }
                    NotificationSubType::ByeBye => {
                        let byebye_message = NotifyByeByeMessage {
                            host,
                            usn: USN::from_str(usn)?,
                            nt,
                            nts,
                        };
                        Ok(BroadcastMessage::NotifyByeBye(byebye_message))
                    }
                    NotificationSubType::Update => {
                        let location = location.context("missing location")?;
                        let update_message = NotifyUpdateMessage {
                            location,
                            host,
                            usn,
                            nt,
                            nts,
                        };
                        Ok(BroadcastMessage::NotifyUpdate(update_message))
                    }
                }
            }
            _ => Err(anyhow::anyhow!("Unknown method encountered: {method}")),
        }
    }
}

/// Inbound discovery messages fan out to every registered sink: device hosts
/// answer searches, control points track advertisements
pub trait SsdpMessageSink: Send + Sync {
    fn on_ssdp_message(&self, message: &BroadcastMessage<'_>, sender: SocketAddr);
}

#[derive(Debug, Clone, Default)]
pub struct SsdpListenerConfig {
    pub ttl: Option<u32>,
}

/// Single shared multicast listener. Both device hosts and control points
/// register as sinks; one socket serves the whole process.
pub struct SsdpListener {
    socket: Arc<UdpSocket>,
    sinks: Mutex<Vec<Arc<dyn SsdpMessageSink>>>,
}

impl std::fmt::Debug for SsdpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsdpListener")
            .field("socket", &self.socket)
            .field("sinks", &self.sinks.lock().unwrap().len())
            .finish()
    }
}

impl SsdpListener {
    pub fn bind(config: SsdpListenerConfig) -> anyhow::Result<Self> {
        let socket = bind_ssdp_socket(config.ttl).context("failed to bind ssdp socket")?;
        Ok(Self {
            socket: Arc::new(socket),
            sinks: Mutex::new(Vec::new()),
        })
    }

    pub fn register_sink(&self, sink: Arc<dyn SsdpMessageSink>) {
        self.sinks.lock().unwrap().push(sink);
    }

    pub fn unregister_sink(&self, sink: &Arc<dyn SsdpMessageSink>) {
        self.sinks
            .lock()
            .unwrap()
            .retain(|s| !Arc::ptr_eq(s, sink));
    }

    pub async fn listen(&self, cancellation_token: CancellationToken) -> anyhow::Result<()> {
        let mut buf = [0; 2048];
        loop {
            tokio::select! {
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((read, sender)) => {
                            if let Err(e) = self.handle_message(&buf[..read], sender) {
                                tracing::trace!("Failed to handle ssdp message: {e}");
                            }
                        }
                        Err(e) => tracing::warn!("ssdp recv failed: {e}"),
                    }
                }
                _ = cancellation_token.cancelled() => {
                    return Ok(())
                }
            }
        }
    }

    fn handle_message(&self, data: &[u8], sender: SocketAddr) -> anyhow::Result<()> {
        let payload = str::from_utf8(data).context("construct string from bytes")?;
        let message = BroadcastMessage::parse_ssdp_payload(payload)?;
        let sinks = self.sinks.lock().unwrap().clone();
        for sink in sinks {
            sink.on_ssdp_message(&message, sender);
        }
        Ok(())
    }
}

/// Advertisement entries grouped per device in the tree; the announcer spaces
/// groups apart under strict DLNA pacing
pub(crate) fn advertisement_groups(device: &DeviceData) -> Vec<Vec<(NotificationType, USN)>> {
    fn collect(device: &DeviceData, root: bool, groups: &mut Vec<Vec<(NotificationType, USN)>>) {
        let udn = device.udn().clone();
        let mut entries = Vec::new();
        if root {
            entries.push((
                NotificationType::RootDevice,
                USN::root_device(udn.clone()),
            ));
        }
        entries.push((
            NotificationType::Uuid(device.uuid()),
            USN::device_uuid(udn.clone()),
        ));
        entries.push((
            NotificationType::Urn(device.device_type().clone()),
            USN::urn(udn.clone(), device.device_type().clone()),
        ));
        for service in device.services() {
            entries.push((
                NotificationType::Urn(service.urn()),
                USN::urn(udn.clone(), service.urn()),
            ));
        }
        groups.push(entries);
        for embedded in device.embedded_devices() {
            collect(embedded, false, groups);
        }
    }
    let mut groups = Vec::new();
    collect(device, true, &mut groups);
    groups
}

/// One advertisement entry of a device tree: what to put into NT and USN
pub(crate) fn advertisements(device: &DeviceData, root: bool) -> Vec<(NotificationType, USN)> {
    let udn = device.udn().clone();
    let mut entries = Vec::new();
    if root {
        entries.push((
            NotificationType::RootDevice,
            USN::root_device(udn.clone()),
        ));
    }
    entries.push((
        NotificationType::Uuid(device.uuid()),
        USN::device_uuid(udn.clone()),
    ));
    entries.push((
        NotificationType::Urn(device.device_type().clone()),
        USN::urn(udn.clone(), device.device_type().clone()),
    ));
    for service in device.services() {
        entries.push((
            NotificationType::Urn(service.urn()),
            USN::urn(udn.clone(), service.urn()),
        ));
    }
    for embedded in device.embedded_devices() {
        entries.extend(advertisements(embedded, false));
    }
    entries
}

/// Writes and sends one advertisement burst for the whole device tree.
/// Alive packets are spaced ~50 ms apart (plus ~200 ms between groups under
/// strict DLNA pacing); byebye bursts skip pacing so shutdown is prompt.
pub(crate) struct Announcer {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    buf: Cursor<Vec<u8>>,
}

impl Announcer {
    pub fn new(socket: Arc<UdpSocket>, target: SocketAddr) -> Self {
        Self {
            socket,
            target,
            buf: Cursor::new(Vec::new()),
        }
    }

    async fn send<H: AnnounceHandler>(&mut self, announce: &Announce) -> anyhow::Result<()> {
        self.buf.get_mut().clear();
        self.buf.set_position(0);
        H::handle_announce(announce, &mut self.buf)?;
        let pos = self.buf.position() as usize;
        self.socket
            .send_to(&self.buf.get_ref()[..pos], self.target)
            .await?;
        Ok(())
    }

    pub async fn announce_alive(
        &mut self,
        device: &DeviceData,
        location: &str,
        server: &str,
        strict_pacing: bool,
    ) -> anyhow::Result<()> {
        let lease = device.lease_time().as_secs() as usize;
        for (group, device_entries) in advertisement_groups(device).into_iter().enumerate() {
            if group > 0 && strict_pacing {
                tokio::time::sleep(DLNA_GROUP_SPACING).await;
            }
            for (packet, (nt, usn)) in device_entries.into_iter().enumerate() {
                if group > 0 || packet > 0 {
                    tokio::time::sleep(ALIVE_PACKET_SPACING).await;
                }
                let announce = Announce {
                    cache_control: lease,
                    location: location.to_string(),
                    server: server.to_string(),
                    notification_type: nt,
                    usn,
                };
                self.send::<MulticastAnnounce>(&announce).await?;
            }
        }
        tracing::debug!(
            uuid = %device.uuid(),
            "Finished announcing device tree to {}",
            self.target
        );
        Ok(())
    }

    pub async fn announce_byebye(&mut self, device: &DeviceData) -> anyhow::Result<()> {
        for (nt, usn) in advertisements(device, true) {
            let message = NotifyByeByeMessage {
                host: SSDP_ADDR,
                usn,
                nt,
                nts: NotificationSubType::ByeBye,
            };
            self.socket
                .send_to(message.to_string().as_bytes(), self.target)
                .await?;
        }
        Ok(())
    }

    /// Search response for a single matching advertisement
    pub async fn answer_search(&mut self, announce: &Announce) -> anyhow::Result<()> {
        self.send::<UnicastAnnounce>(announce).await
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{BroadcastMessage, NotificationType, USN};

    #[test]
    fn parse_broadcast_message() {
        let notify = "NOTIFY * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
CACHE-CONTROL: max-age=1800\r\n\
LOCATION: http://192.168.1.1:49152/devicedesc.xml\r\n\
NT: urn:schemas-upnp-org:service:ContentDirectory:1\r\n\
NTS: ssdp:alive\r\n\
SERVER: Linux/3.14 UPnP/1.0 media-server/0.1\r\n\
USN: uuid:ebf5a0a0-1dd1-11b2-a92f-e89f80eb7241::urn:schemas-upnp-org:service:ContentDirectory:1\r\n\r\n";

        let notify_message = BroadcastMessage::parse_ssdp_payload(notify).unwrap();
        assert!(matches!(
            notify_message,
            BroadcastMessage::NotifyAlive { .. }
        ));

        let m_search = "M-SEARCH * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
MAN: \"ssdp:discover\"\r\n\
MX: 1\r\n\
ST: upnp:rootdevice\r\n\r\n";
        let m_search_message = BroadcastMessage::parse_ssdp_payload(m_search).unwrap();
        let BroadcastMessage::Search(search) = m_search_message else {
            panic!("expected search message");
        };
        assert!(matches!(search.st, NotificationType::RootDevice));
        assert_eq!(search.mx, Some(1));
    }

    #[test]
    fn search_without_discover_man_is_rejected() {
        let m_search = "M-SEARCH * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
MX: 1\r\n\
ST: upnp:rootdevice\r\n\r\n";
        assert!(BroadcastMessage::parse_ssdp_payload(m_search).is_err());
    }

    #[test]
    fn byebye_without_location_parses() {
        let notify = "NOTIFY * HTTP/1.1\r\n\
HOST: 239.255.255.250:1900\r\n\
NT: upnp:rootdevice\r\n\
NTS: ssdp:byebye\r\n\
USN: uuid:ebf5a0a0-1dd1-11b2-a92f-e89f80eb7241::upnp:rootdevice\r\n\r\n";
        assert!(matches!(
            BroadcastMessage::parse_ssdp_payload(notify).unwrap(),
            BroadcastMessage::NotifyByeBye { .. }
        ));
    }

    #[test]
    fn usn_forms() {
        let root = USN::from_str("uuid:ebf5a0a0-1dd1-11b2-a92f-e89f80eb7241::upnp:rootdevice")
            .unwrap();
        assert_eq!(
            root.to_string(),
            "uuid:ebf5a0a0-1dd1-11b2-a92f-e89f80eb7241::upnp:rootdevice"
        );
        let bare = USN::from_str("uuid:ebf5a0a0-1dd1-11b2-a92f-e89f80eb7241").unwrap();
        assert_eq!(
            bare.to_string(),
            "uuid:ebf5a0a0-1dd1-11b2-a92f-e89f80eb7241"
        );
        let service = USN::from_str(
            "uuid:ebf5a0a0-1dd1-11b2-a92f-e89f80eb7241::urn:schemas-upnp-org:service:ContentDirectory:1",
        )
        .unwrap();
        assert!(matches!(service.kind(), super::USNkind::URN(_)));
    }
}
