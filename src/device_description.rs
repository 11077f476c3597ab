use std::{
    fmt::Display,
    net::IpAddr,
    str::FromStr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::Context;
use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};

use crate::{
    service::{Service, ServiceUrls},
    templates::SpecVersion,
    urn::URN,
    FromXml, IntoXml, XmlReaderExt,
};

pub const DEVICE_NS: &str = "urn:schemas-upnp-org:device-1-0";
pub const DLNA_NS: &str = "urn:schemas-dlna-org:device-1-0";

/// Advertisement lease used when peers send nothing usable
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(1800);
/// Leases below this are treated as invalid input
pub const MIN_LEASE_TIME: Duration = Duration::from_secs(10);

/// Invalid leases fall back to the default instead of expiring immediately
pub fn clamp_lease(requested: Duration) -> Duration {
    if requested < MIN_LEASE_TIME {
        DEFAULT_LEASE_TIME
    } else {
        requested
    }
}

/// Unique Device Name. Universally unique identifier for the device, whether
/// root or embedded. Shall be the same over time for a specific device
/// instance (i.e. shall survive reboots).
#[derive(Debug, Clone, Serialize)]
pub struct Udn(String);

impl Udn {
    pub fn new(uuid: uuid::Uuid) -> Self {
        Self(format!("uuid:{uuid}"))
    }

    pub fn uuid(&self) -> uuid::Uuid {
        self.0
            .strip_prefix("uuid:")
            .expect("constructed with uuid prefix")
            .parse()
            .expect("constructed from a valid uuid")
    }
}

impl Display for Udn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Udn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = s
            .strip_prefix("uuid:")
            .context("udn should start with uuid:")?
            .parse()
            .context("parse uuid")?;
        Ok(Self::new(uuid))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Icon {
    pub mimetype: String,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub url: String,
}

impl IntoXml for Icon {
    fn write_xml(&self, w: &mut crate::XmlWriter) -> quick_xml::Result<()> {
        w.write_serializable("icon", self)
            .expect("serialization not fail");
        Ok(())
    }
}

impl<'a> FromXml<'a> for Icon {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut mimetype = None;
        let mut width = None;
        let mut height = None;
        let mut depth = None;
        let mut url = None;

        while let Ok(event) = r.read_event() {
            match event {
                Event::Start(start) => {
                    let end = start.name().to_owned();
                    match start.local_name().as_ref() {
                        b"mimetype" => mimetype = Some(r.read_text(end)?.to_string()),
                        b"width" => width = Some(r.read_text(end)?.trim().parse()?),
                        b"height" => height = Some(r.read_text(end)?.trim().parse()?),
                        b"depth" => depth = Some(r.read_text(end)?.trim().parse()?),
                        b"url" => url = Some(r.read_text(end)?.to_string()),
                        _ => {
                            // skip unknown tags
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"icon");
                    break;
                }
                _ => {}
            }
        }

        Ok(Self {
            mimetype: mimetype.context("get mimetype")?,
            width: width.context("get width")?,
            height: height.context("get height")?,
            depth: depth.context("get depth")?,
            url: url.unwrap_or_default(),
        })
    }
}

/// Service entry of a description document. SCPD parsing is deferred until
/// the control point fetches the SCPD url.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStub {
    #[serde(rename = "serviceType")]
    pub service_type: String,
    #[serde(rename = "serviceId")]
    pub service_id: String,
    #[serde(rename = "SCPDURL")]
    pub scpd_url: String,
    #[serde(rename = "controlURL")]
    pub control_url: String,
    #[serde(rename = "eventSubURL")]
    pub event_sub_url: String,
}

impl<'a> FromXml<'a> for ServiceStub {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut service_type = None;
        let mut service_id = None;
        let mut scpdurl = None;
        let mut control_url = None;
        let mut event_sub_url = None;

        while let Ok(event) = r.read_event() {
            match event {
                Event::Start(start) => {
                    let end = start.name().to_owned();
                    match start.local_name().as_ref() {
                        b"serviceType" => service_type = Some(r.read_text(end)?.trim().to_string()),
                        b"serviceId" => service_id = Some(r.read_text(end)?.trim().to_string()),
                        b"SCPDURL" => scpdurl = Some(r.read_text(end)?.trim().to_string()),
                        b"controlURL" => control_url = Some(r.read_text(end)?.trim().to_string()),
                        b"eventSubURL" => {
                            event_sub_url = Some(r.read_text(end)?.trim().to_string())
                        }
                        _ => {
                            // skip unknown tags
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"service");
                    break;
                }
                _ => {}
            }
        }

        Ok(Self {
            service_type: service_type.context("service type")?,
            service_id: service_id.context("service id")?,
            scpd_url: scpdurl.context("scpdurl")?,
            control_url: control_url.context("control url")?,
            event_sub_url: event_sub_url.context("event sub url")?,
        })
    }
}

/// Device element of a description document
#[derive(Debug)]
pub struct DeviceEntry {
    pub device_type: String,
    pub friendly_name: String,
    /// Manufacturer name. Should be < 64 characters.
    pub manufacturer: String,
    pub manufacturer_url: Option<String>,
    /// Should be < 128 characters
    pub model_description: Option<String>,
    pub model_name: String,
    pub model_number: Option<String>,
    pub model_url: Option<String>,
    pub serial_number: Option<String>,
    pub udn: Udn,
    pub dlna_doc: Option<String>,
    pub dlna_cap: Option<String>,
    pub icon_list: Vec<Icon>,
    pub service_list: Vec<ServiceStub>,
    pub device_list: Vec<DeviceEntry>,
    pub presentation_url: Option<String>,
}

impl<'a> FromXml<'a> for DeviceEntry {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut device_type = None;
        let mut friendly_name = None;
        let mut manufacturer = None;
        let mut manufacturer_url = None;
        let mut model_description = None;
        let mut model_name = None;
        let mut model_number = None;
        let mut model_url = None;
        let mut serial_number = None;
        let mut udn = None;
        let mut dlna_doc = None;
        let mut dlna_cap = None;
        let mut icon_list = Vec::new();
        let mut service_list = Vec::new();
        let mut device_list = Vec::new();
        let mut presentation_url = None;

        while let Ok(event) = r.read_event_err_eof() {
            match event {
                Event::Start(start) => {
                    let start = start.to_owned();
                    let end_name = start.name();
                    match start.local_name().as_ref() {
                        b"deviceType" => device_type = Some(r.read_text(end_name)?.trim().to_string()),
                        b"friendlyName" => {
                            friendly_name = Some(r.read_text(end_name)?.trim().to_string())
                        }
                        b"manufacturer" => {
                            manufacturer = Some(r.read_text(end_name)?.trim().to_string())
                        }
                        b"manufacturerURL" => {
                            manufacturer_url = Some(r.read_text(end_name)?.to_string())
                        }
                        b"modelDescription" => {
                            model_description = Some(r.read_text(end_name)?.to_string())
                        }
                        b"modelName" => model_name = Some(r.read_text(end_name)?.trim().to_string()),
                        b"modelNumber" => model_number = Some(r.read_text(end_name)?.to_string()),
                        b"modelURL" => model_url = Some(r.read_text(end_name)?.to_string()),
                        b"serialNumber" => serial_number = Some(r.read_text(end_name)?.to_string()),
                        b"UDN" => {
                            udn = Some(Udn::from_str(r.read_text(end_name)?.trim())?);
                        }
                        b"X_DLNADOC" => dlna_doc = Some(r.read_text(end_name)?.to_string()),
                        b"X_DLNACAP" => dlna_cap = Some(r.read_text(end_name)?.to_string()),
                        b"iconList" => {
                            while let Ok(e) = r.read_event() {
                                match e {
                                    Event::Start(start) => {
                                        anyhow::ensure!(start.local_name().as_ref() == b"icon");
                                        icon_list.push(Icon::read_xml(r)?);
                                    }
                                    Event::End(end) => {
                                        anyhow::ensure!(end.local_name().as_ref() == b"iconList");
                                        break;
                                    }
                                    Event::Text(_) => {}
                                    e => Err(anyhow::anyhow!(
                                        "Expected icon start or list end, got {:?}",
                                        e
                                    ))?,
                                }
                            }
                        }
                        b"serviceList" => {
                            while let Ok(e) = r.read_event() {
                                match e {
                                    Event::Start(start) => {
                                        anyhow::ensure!(start.local_name().as_ref() == b"service");
                                        service_list.push(ServiceStub::read_xml(r)?);
                                    }
                                    Event::End(end) => {
                                        anyhow::ensure!(
                                            end.local_name().as_ref() == b"serviceList"
                                        );
                                        break;
                                    }
                                    Event::Text(_) => {}
                                    e => Err(anyhow::anyhow!(
                                        "Expected service start or list end, got {:?}",
                                        e
                                    ))?,
                                }
                            }
                        }
                        b"deviceList" => {
                            while let Ok(e) = r.read_event() {
                                match e {
                                    Event::Start(start) => {
                                        anyhow::ensure!(start.local_name().as_ref() == b"device");
                                        device_list.push(DeviceEntry::read_xml(r)?);
                                    }
                                    Event::End(end) => {
                                        anyhow::ensure!(end.local_name().as_ref() == b"deviceList");
                                        break;
                                    }
                                    Event::Text(_) => {}
                                    e => Err(anyhow::anyhow!(
                                        "Expected device start or list end, got {:?}",
                                        e
                                    ))?,
                                }
                            }
                        }
                        b"presentationURL" => {
                            presentation_url = Some(r.read_text(end_name)?.to_string())
                        }
                        _ => {
                            r.read_to_end(end_name)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(
                        end.local_name().as_ref() == b"device",
                        "expected device end, got {:?}",
                        end
                    );
                    break;
                }
                _ => {}
            }
        }

        Ok(Self {
            device_type: device_type.context("device type")?,
            friendly_name: friendly_name.context("friendly name")?,
            manufacturer: manufacturer.context("manufacturer name")?,
            manufacturer_url,
            model_description,
            model_name: model_name.context("model name")?,
            model_number,
            model_url,
            serial_number,
            udn: udn.context("udn")?,
            dlna_doc,
            dlna_cap,
            icon_list,
            service_list,
            device_list,
            presentation_url,
        })
    }
}

/// Parsed description document
#[derive(Debug)]
pub struct DeviceDescription {
    pub config_id: Option<String>,
    pub spec_version: SpecVersion,
    pub url_base: Option<String>,
    pub device: DeviceEntry,
}

impl<'a> FromXml<'a> for DeviceDescription {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let root = r.read_to_start()?;
        anyhow::ensure!(root.local_name().as_ref() == b"root");
        for attr in root.attributes().flatten() {
            if attr.key.as_ref() == b"xmlns" {
                let value = attr.unescape_value()?;
                anyhow::ensure!(
                    value == DEVICE_NS,
                    "unexpected description namespace: {value}"
                );
            }
        }

        let config_id = root
            .attributes()
            .flatten()
            .find_map(|attr| {
                (attr.key.local_name().as_ref() == b"configId")
                    .then(|| attr.unescape_value().map(|v| v.to_string()))
            })
            .transpose()
            .context("unescape config id")?;

        let root = root.to_owned();

        let mut spec_version = None;
        let mut url_base = None;
        let mut device = None;

        loop {
            match r.read_event_err_eof()? {
                Event::Start(start) => {
                    let end = start.name().to_owned();
                    match start.local_name().as_ref() {
                        b"specVersion" => {
                            spec_version = Some(SpecVersion::read_xml_body(r)?);
                        }
                        b"URLBase" => url_base = Some(r.read_text(end)?.trim().to_string()),
                        b"device" => device = Some(DeviceEntry::read_xml(r)?),
                        _ => {
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::End(end) if end.name() == root.name() => break,
                _ => {}
            }
        }

        Ok(Self {
            config_id,
            spec_version: spec_version.unwrap_or(SpecVersion::upnp_v1()),
            url_base,
            device: device.context("device element")?,
        })
    }
}

/// Base url the relative service urls of a description resolve against.
/// A trailing filename is stripped so the base always ends with `/`.
pub fn url_base_from(location: &reqwest::Url) -> anyhow::Result<reqwest::Url> {
    location.join(".").context("derive url base")
}

/// Resolves a service url against the device base. Absolute http urls pass
/// through unchanged.
pub fn resolve_url(base: &reqwest::Url, relative: &str) -> anyhow::Result<reqwest::Url> {
    if relative.starts_with("http://") || relative.starts_with("https://") {
        return reqwest::Url::parse(relative).context("parse absolute service url");
    }
    base.join(relative).context("resolve service url")
}

/// Misbehaving peers advertise themselves as loopback; rewrite to the address
/// the description actually came from
pub fn fixup_local_host(url: &mut reqwest::Url, remote_ip: IpAddr) {
    let host_is_local = matches!(url.host_str(), Some("localhost") | Some("127.0.0.1"));
    if host_is_local {
        url.set_ip_host(remote_ip).expect("http urls accept ip hosts");
    }
}

/// Runtime device tree. A device owns its services and embedded devices;
/// children never reach back to the parent. The control point hands out
/// `Arc` handles so in-flight requests keep the graph alive across expiration.
#[derive(Debug)]
pub struct DeviceData {
    uuid: uuid::Uuid,
    udn: Udn,
    device_type: URN,
    friendly_name: String,
    manufacturer: String,
    manufacturer_url: Option<String>,
    model_description: Option<String>,
    model_name: String,
    model_number: Option<String>,
    model_url: Option<String>,
    serial_number: Option<String>,
    presentation_url: Option<String>,
    dlna_doc: Option<String>,
    dlna_cap: Option<String>,
    icons: Vec<Icon>,
    services: Vec<Arc<Service>>,
    embedded: Vec<Arc<DeviceData>>,
    url_base: reqwest::Url,
    description_url: Option<reqwest::Url>,
    /// Local interface the description was fetched on
    local_addr: Option<IpAddr>,
    lease_time: Duration,
    last_update: Mutex<Instant>,
}

impl DeviceData {
    pub fn builder(device_type: URN, friendly_name: impl Into<String>) -> DeviceDataBuilder {
        DeviceDataBuilder::new(device_type, friendly_name.into())
    }

    /// Builds the runtime tree from a parsed description. Relative service
    /// urls resolve against `URLBase` (or the description location when
    /// absent) and loopback hosts are rewritten to `remote_ip`.
    pub fn from_description(
        description: DeviceDescription,
        location: reqwest::Url,
        remote_ip: IpAddr,
        local_addr: IpAddr,
        lease_time: Duration,
    ) -> anyhow::Result<Arc<Self>> {
        let mut url_base = match &description.url_base {
            Some(raw) => {
                let mut base = reqwest::Url::parse(raw).context("parse URLBase")?;
                if !base.path().ends_with('/') {
                    base = url_base_from(&base)?;
                }
                base
            }
            None => url_base_from(&location)?,
        };
        fixup_local_host(&mut url_base, remote_ip);

        Self::from_entry(
            description.device,
            &url_base,
            Some(location),
            Some(local_addr),
            clamp_lease(lease_time),
        )
    }

    fn from_entry(
        entry: DeviceEntry,
        url_base: &reqwest::Url,
        description_url: Option<reqwest::Url>,
        local_addr: Option<IpAddr>,
        lease_time: Duration,
    ) -> anyhow::Result<Arc<Self>> {
        let device_type = URN::from_str(&entry.device_type).context("parse device type")?;
        let services = entry
            .service_list
            .into_iter()
            .map(|stub| {
                let service_type = URN::from_str(&stub.service_type)?;
                let urls = ServiceUrls {
                    scpd: resolve_url(url_base, &stub.scpd_url)?.to_string(),
                    control: resolve_url(url_base, &stub.control_url)?.to_string(),
                    event_sub: resolve_url(url_base, &stub.event_sub_url)?.to_string(),
                };
                Ok(Arc::new(Service::new(service_type, stub.service_id, urls)))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let embedded = entry
            .device_list
            .into_iter()
            .map(|embedded| {
                Self::from_entry(embedded, url_base, None, local_addr, lease_time)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Arc::new(Self {
            uuid: entry.udn.uuid(),
            udn: entry.udn,
            device_type,
            friendly_name: entry.friendly_name,
            manufacturer: entry.manufacturer,
            manufacturer_url: entry.manufacturer_url,
            model_description: entry.model_description,
            model_name: entry.model_name,
            model_number: entry.model_number,
            model_url: entry.model_url,
            serial_number: entry.serial_number,
            presentation_url: entry.presentation_url,
            dlna_doc: entry.dlna_doc,
            dlna_cap: entry.dlna_cap,
            icons: entry.icon_list,
            services,
            embedded,
            url_base: url_base.clone(),
            description_url,
            local_addr,
            lease_time,
            last_update: Mutex::new(Instant::now()),
        }))
    }

    pub fn uuid(&self) -> uuid::Uuid {
        self.uuid
    }

    pub fn udn(&self) -> &Udn {
        &self.udn
    }

    pub fn device_type(&self) -> &URN {
        &self.device_type
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn url_base(&self) -> &reqwest::Url {
        &self.url_base
    }

    pub fn description_url(&self) -> Option<&reqwest::Url> {
        self.description_url.as_ref()
    }

    pub fn local_addr(&self) -> Option<IpAddr> {
        self.local_addr
    }

    pub fn lease_time(&self) -> Duration {
        self.lease_time
    }

    pub fn services(&self) -> &[Arc<Service>] {
        &self.services
    }

    pub fn embedded_devices(&self) -> &[Arc<DeviceData>] {
        &self.embedded
    }

    pub fn icons(&self) -> &[Icon] {
        &self.icons
    }

    /// All services of the tree, embedded devices included, down to `depth`
    /// levels
    pub fn all_services(&self, depth: usize) -> Vec<Arc<Service>> {
        let mut services: Vec<_> = self.services.iter().cloned().collect();
        if depth > 0 {
            for device in &self.embedded {
                services.extend(device.all_services(depth - 1));
            }
        }
        services
    }

    /// A device is ready once every service has a parsed SCPD and it exposes
    /// at least one service or embedded device
    pub fn is_ready(&self) -> bool {
        if self.services.is_empty() && self.embedded.is_empty() {
            return false;
        }
        self.services.iter().all(|s| s.has_scpd())
            && self.embedded.iter().all(|d| d.is_ready())
    }

    pub fn refresh_lease(&self) {
        *self.last_update.lock().unwrap() = Instant::now();
    }

    /// Expired when more than twice the lease elapsed since the last
    /// advertisement; the double allowance handles missed renewals
    pub fn is_expired(&self, now: Instant) -> bool {
        let last_update = *self.last_update.lock().unwrap();
        now > last_update + self.lease_time * 2
    }

    pub fn find_service_by_id(&self, id: &str, recursive: bool) -> Option<Arc<Service>> {
        self.find_service(recursive, |s| s.service_id() == id)
    }

    /// Type lookup supports a trailing `*` wildcard matching any version
    pub fn find_service_by_type(&self, pattern: &str, recursive: bool) -> Option<Arc<Service>> {
        self.find_service(recursive, |s| s.urn().matches_pattern(pattern))
    }

    pub fn find_service_by_scpd_url(&self, url: &str, recursive: bool) -> Option<Arc<Service>> {
        self.find_service(recursive, |s| s.urls().scpd == url)
    }

    pub fn find_service_by_control_url(&self, url: &str, recursive: bool) -> Option<Arc<Service>> {
        self.find_service(recursive, |s| s.urls().control == url)
    }

    pub fn find_service_by_event_url(&self, url: &str, recursive: bool) -> Option<Arc<Service>> {
        self.find_service(recursive, |s| s.urls().event_sub == url)
    }

    fn find_service(
        &self,
        recursive: bool,
        predicate: impl Fn(&Service) -> bool + Copy,
    ) -> Option<Arc<Service>> {
        if let Some(service) = self.services.iter().find(|s| predicate(s)) {
            return Some(service.clone());
        }
        if recursive {
            for device in &self.embedded {
                if let Some(service) = device.find_service(true, predicate) {
                    return Some(service);
                }
            }
        }
        None
    }

    pub fn find_device_by_uuid(
        self: &Arc<Self>,
        uuid: uuid::Uuid,
        recursive: bool,
    ) -> Option<Arc<DeviceData>> {
        if self.uuid == uuid {
            return Some(self.clone());
        }
        if recursive {
            for device in &self.embedded {
                if let Some(found) = device.find_device_by_uuid(uuid, true) {
                    return Some(found);
                }
            }
        }
        None
    }

    pub fn find_device_by_friendly_name(
        self: &Arc<Self>,
        name: &str,
        recursive: bool,
    ) -> Option<Arc<DeviceData>> {
        if self.friendly_name == name {
            return Some(self.clone());
        }
        if recursive {
            for device in &self.embedded {
                if let Some(found) = device.find_device_by_friendly_name(name, true) {
                    return Some(found);
                }
            }
        }
        None
    }

    pub fn find_device_by_type(
        self: &Arc<Self>,
        pattern: &str,
        recursive: bool,
    ) -> Option<Arc<DeviceData>> {
        if self.device_type.matches_pattern(pattern) {
            return Some(self.clone());
        }
        if recursive {
            for device in &self.embedded {
                if let Some(found) = device.find_device_by_type(pattern, true) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// The largest icon not exceeding any of the constraints. Entries with an
    /// empty url are skipped.
    pub fn select_icon(
        &self,
        mimetype: Option<&str>,
        max_size: Option<usize>,
        max_depth: Option<usize>,
    ) -> Option<&Icon> {
        self.icons
            .iter()
            .filter(|icon| !icon.url.is_empty())
            .filter(|icon| mimetype.is_none_or(|m| icon.mimetype == m))
            .filter(|icon| max_size.is_none_or(|s| icon.width <= s && icon.height <= s))
            .filter(|icon| max_depth.is_none_or(|d| icon.depth <= d))
            .max_by_key(|icon| icon.width * icon.height)
    }

    /// Composes the description document served at the description url
    pub fn description_xml(&self) -> anyhow::Result<String> {
        let mut w = quick_xml::Writer::new(Vec::new());
        w.write_event(Event::Decl(BytesDecl::new("1.0", None, None)))?;
        let root = BytesStart::new("root")
            .with_attributes([("xmlns", DEVICE_NS), ("xmlns:dlna", DLNA_NS)]);
        let root_end = root.to_end().into_owned();
        w.write_event(Event::Start(root))?;
        SpecVersion::upnp_v1().write_xml(&mut w)?;
        w.create_element("URLBase")
            .write_text_content(BytesText::new(self.url_base.as_str()))?;
        self.write_device_xml(&mut w)?;
        w.write_event(Event::End(root_end))?;
        Ok(String::from_utf8(w.into_inner())?)
    }

    fn write_device_xml(&self, w: &mut crate::XmlWriter) -> quick_xml::Result<()> {
        let device = BytesStart::new("device");
        let device_end = device.to_end().into_owned();
        w.write_event(Event::Start(device))?;
        w.create_element("deviceType")
            .write_text_content(BytesText::new(&self.device_type.to_string()))?;
        w.create_element("friendlyName")
            .write_text_content(BytesText::new(&self.friendly_name))?;
        w.create_element("manufacturer")
            .write_text_content(BytesText::new(&self.manufacturer))?;
        if let Some(manufacturer_url) = &self.manufacturer_url {
            w.create_element("manufacturerURL")
                .write_text_content(BytesText::new(manufacturer_url))?;
        }
        if let Some(model_description) = &self.model_description {
            w.create_element("modelDescription")
                .write_text_content(BytesText::new(model_description))?;
        }
        w.create_element("modelName")
            .write_text_content(BytesText::new(&self.model_name))?;
        if let Some(model_number) = &self.model_number {
            w.create_element("modelNumber")
                .write_text_content(BytesText::new(model_number))?;
        }
        if let Some(model_url) = &self.model_url {
            w.create_element("modelURL")
                .write_text_content(BytesText::new(model_url))?;
        }
        if let Some(serial_number) = &self.serial_number {
            w.create_element("serialNumber")
                .write_text_content(BytesText::new(serial_number))?;
        }
        let udn = self.udn.to_string();
        w.create_element("UDN")
            .write_text_content(BytesText::new(&udn))?;
        if let Some(dlna_doc) = &self.dlna_doc {
            w.create_element("dlna:X_DLNADOC")
                .write_text_content(BytesText::new(dlna_doc))?;
        }
        if let Some(dlna_cap) = &self.dlna_cap {
            w.create_element("dlna:X_DLNACAP")
                .write_text_content(BytesText::new(dlna_cap))?;
        }
        if !self.icons.is_empty() {
            w.create_element("iconList").write_inner_content(|w| {
                for icon in &self.icons {
                    w.write_serializable("icon", icon)
                        .expect("serialization not fail");
                }
                Ok::<(), quick_xml::Error>(())
            })?;
        }
        w.create_element("serviceList").write_inner_content(|w| {
            for service in &self.services {
                let stub = ServiceStub {
                    service_type: service.urn().to_string(),
                    service_id: service.service_id().to_string(),
                    scpd_url: service.urls().scpd.clone(),
                    control_url: service.urls().control.clone(),
                    event_sub_url: service.urls().event_sub.clone(),
                };
                w.write_serializable("service", &stub)
                    .expect("serialization not fail");
            }
            Ok::<(), quick_xml::Error>(())
        })?;
        if !self.embedded.is_empty() {
            w.create_element("deviceList").write_inner_content(|w| {
                for device in &self.embedded {
                    device.write_device_xml(w)?;
                }
                Ok::<(), quick_xml::Error>(())
            })?;
        }
        if let Some(presentation_url) = &self.presentation_url {
            w.create_element("presentationURL")
                .write_text_content(BytesText::new(presentation_url))?;
        }
        w.write_event(Event::End(device_end))
    }
}

/// Host side construction of a device tree. The url base is supplied by the
/// device host once its server port is known.
#[derive(Debug)]
pub struct DeviceDataBuilder {
    uuid: uuid::Uuid,
    device_type: URN,
    friendly_name: String,
    manufacturer: String,
    manufacturer_url: Option<String>,
    model_description: Option<String>,
    model_name: String,
    model_number: Option<String>,
    model_url: Option<String>,
    serial_number: Option<String>,
    presentation_url: Option<String>,
    dlna_doc: Option<String>,
    dlna_cap: Option<String>,
    icons: Vec<Icon>,
    services: Vec<Arc<Service>>,
    embedded: Vec<DeviceDataBuilder>,
    lease_time: Duration,
}

impl DeviceDataBuilder {
    fn new(device_type: URN, friendly_name: String) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4(),
            device_type,
            model_name: friendly_name.clone(),
            friendly_name,
            manufacturer: env!("CARGO_PKG_NAME").to_string(),
            manufacturer_url: None,
            model_description: None,
            model_number: None,
            model_url: None,
            serial_number: None,
            presentation_url: None,
            dlna_doc: None,
            dlna_cap: None,
            icons: Vec::new(),
            services: Vec::new(),
            embedded: Vec::new(),
            lease_time: DEFAULT_LEASE_TIME,
        }
    }

    pub fn uuid(mut self, uuid: uuid::Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = manufacturer.into();
        self
    }

    pub fn model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn model_description(mut self, description: impl Into<String>) -> Self {
        self.model_description = Some(description.into());
        self
    }

    pub fn serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    pub fn presentation_url(mut self, url: impl Into<String>) -> Self {
        self.presentation_url = Some(url.into());
        self
    }

    pub fn dlna_doc(mut self, doc: impl Into<String>) -> Self {
        self.dlna_doc = Some(doc.into());
        self
    }

    pub fn dlna_cap(mut self, cap: impl Into<String>) -> Self {
        self.dlna_cap = Some(cap.into());
        self
    }

    pub fn icon(mut self, icon: Icon) -> Self {
        self.icons.push(icon);
        self
    }

    pub fn service(mut self, service: Service) -> Self {
        self.services.push(Arc::new(service));
        self
    }

    pub fn embedded_device(mut self, device: DeviceDataBuilder) -> Self {
        self.embedded.push(device);
        self
    }

    pub fn lease_time(mut self, lease_time: Duration) -> Self {
        self.lease_time = clamp_lease(lease_time);
        self
    }

    pub fn device_uuid(&self) -> uuid::Uuid {
        self.uuid
    }

    /// Finalizes the tree with the url base the host server ended up bound to
    pub fn build(self, url_base: reqwest::Url) -> Arc<DeviceData> {
        let lease_time = self.lease_time;
        self.build_inner(&url_base, lease_time)
    }

    fn build_inner(self, url_base: &reqwest::Url, lease_time: Duration) -> Arc<DeviceData> {
        let embedded = self
            .embedded
            .into_iter()
            .map(|builder| builder.build_inner(url_base, lease_time))
            .collect();
        Arc::new(DeviceData {
            uuid: self.uuid,
            udn: Udn::new(self.uuid),
            device_type: self.device_type,
            friendly_name: self.friendly_name,
            manufacturer: self.manufacturer,
            manufacturer_url: self.manufacturer_url,
            model_description: self.model_description,
            model_name: self.model_name,
            model_number: self.model_number,
            model_url: self.model_url,
            serial_number: self.serial_number,
            presentation_url: self.presentation_url,
            dlna_doc: self.dlna_doc,
            dlna_cap: self.dlna_cap,
            icons: self.icons,
            services: self.services,
            embedded,
            url_base: url_base.clone(),
            description_url: None,
            local_addr: None,
            lease_time,
            last_update: Mutex::new(Instant::now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        time::Duration,
    };

    use crate::FromXml;

    use super::{
        clamp_lease, fixup_local_host, url_base_from, DeviceData, DeviceDescription,
        DEFAULT_LEASE_TIME,
    };

    const DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
<specVersion><major>1</major><minor>0</minor></specVersion>
<device>
<deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>
<friendlyName>Bedroom server</friendlyName>
<manufacturer>acme</manufacturer>
<modelName>Shelf</modelName>
<UDN>uuid:править-invalid</UDN>
</device>
</root>"#;

    const FULL_DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
<specVersion><major>1</major><minor>0</minor></specVersion>
<URLBase>http://localhost:9999/upnp/base.html</URLBase>
<device>
<deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>
<friendlyName>Bedroom server</friendlyName>
<manufacturer>acme</manufacturer>
<modelName>Shelf</modelName>
<UDN>uuid:0ba41e4a-d2b2-4bb7-bdb7-f45457ef6ab7</UDN>
<iconList>
<icon><mimetype>image/png</mimetype><width>32</width><height>32</height><depth>24</depth><url>/icon32.png</url></icon>
<icon><mimetype>image/png</mimetype><width>128</width><height>128</height><depth>24</depth><url>/icon128.png</url></icon>
<icon><mimetype>image/png</mimetype><width>256</width><height>256</height><depth>24</depth><url></url></icon>
</iconList>
<serviceList>
<service>
<serviceType>urn:schemas-upnp-org:service:ContentDirectory:1</serviceType>
<serviceId>urn:upnp-org:serviceId:ContentDirectory</serviceId>
<SCPDURL>cd/scpd.xml</SCPDURL>
<controlURL>cd/control.xml</controlURL>
<eventSubURL>cd/event.xml</eventSubURL>
</service>
</serviceList>
<deviceList>
<device>
<deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
<friendlyName>Embedded renderer</friendlyName>
<manufacturer>acme</manufacturer>
<modelName>Shelf</modelName>
<UDN>uuid:4d7cd5d8-62a1-433c-9643-b9384fe4a19b</UDN>
<serviceList>
<service>
<serviceType>urn:schemas-upnp-org:service:RenderingControl:2</serviceType>
<serviceId>urn:upnp-org:serviceId:RenderingControl</serviceId>
<SCPDURL>rc/scpd.xml</SCPDURL>
<controlURL>http://10.0.0.7:1400/rc/control.xml</controlURL>
<eventSubURL>rc/event.xml</eventSubURL>
</service>
</serviceList>
</device>
</deviceList>
</device>
</root>"#;

    fn parse_full() -> std::sync::Arc<DeviceData> {
        let description =
            DeviceDescription::read_xml(&mut quick_xml::Reader::from_str(FULL_DESCRIPTION))
                .unwrap();
        DeviceData::from_description(
            description,
            reqwest::Url::parse("http://192.168.1.44:9999/upnp/device.xml").unwrap(),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 44)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)),
            Duration::from_secs(1800),
        )
        .unwrap()
    }

    #[test]
    fn invalid_udn_is_rejected() {
        assert!(
            DeviceDescription::read_xml(&mut quick_xml::Reader::from_str(DESCRIPTION)).is_err()
        );
    }

    #[test]
    fn url_base_strips_trailing_filename() {
        let location = reqwest::Url::parse("http://192.168.1.44:9999/upnp/device.xml").unwrap();
        let base = url_base_from(&location).unwrap();
        assert_eq!(base.as_str(), "http://192.168.1.44:9999/upnp/");
    }

    #[test]
    fn localhost_rewritten_to_remote_ip() {
        let mut url = reqwest::Url::parse("http://localhost:9999/upnp/").unwrap();
        fixup_local_host(&mut url, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)));
        assert_eq!(url.as_str(), "http://10.0.0.9:9999/upnp/");

        let mut untouched = reqwest::Url::parse("http://192.168.1.3:9999/upnp/").unwrap();
        fixup_local_host(&mut untouched, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)));
        assert_eq!(untouched.host_str(), Some("192.168.1.3"));
    }

    #[test]
    fn relative_urls_resolve_against_rewritten_base() {
        let device = parse_full();
        // URLBase pointed at localhost with a trailing filename
        assert_eq!(device.url_base().as_str(), "http://192.168.1.44:9999/upnp/");
        let cd = device
            .find_service_by_id("urn:upnp-org:serviceId:ContentDirectory", false)
            .unwrap();
        assert_eq!(
            cd.urls().scpd,
            "http://192.168.1.44:9999/upnp/cd/scpd.xml"
        );
        // absolute control urls pass through unchanged
        let rc = device
            .find_service_by_type("urn:schemas-upnp-org:service:RenderingControl:*", true)
            .unwrap();
        assert_eq!(rc.urls().control, "http://10.0.0.7:1400/rc/control.xml");
    }

    #[test]
    fn type_finders_support_version_wildcard() {
        let device = parse_full();
        assert!(device
            .find_service_by_type("urn:schemas-upnp-org:service:RenderingControl:1", true)
            .is_none());
        assert!(device
            .find_service_by_type("urn:schemas-upnp-org:service:RenderingControl:*", true)
            .is_some());
        // non recursive lookup does not see embedded services
        assert!(device
            .find_service_by_type("urn:schemas-upnp-org:service:RenderingControl:*", false)
            .is_none());
        assert!(device
            .find_device_by_type("urn:schemas-upnp-org:device:MediaRenderer:*", true)
            .is_some());
    }

    #[test]
    fn icon_selection_prefers_largest_within_constraints() {
        let device = parse_full();
        let icon = device.select_icon(Some("image/png"), Some(128), None).unwrap();
        assert_eq!(icon.width, 128);
        let icon = device.select_icon(Some("image/png"), Some(64), None).unwrap();
        assert_eq!(icon.width, 32);
        // the 256px icon has an empty url and is never returned
        let icon = device.select_icon(Some("image/png"), None, None).unwrap();
        assert_eq!(icon.width, 128);
        assert!(device.select_icon(Some("image/webp"), None, None).is_none());
    }

    #[test]
    fn readiness_requires_scpd_everywhere() {
        let device = parse_full();
        assert!(!device.is_ready());
        for service in device.all_services(5) {
            service.set_scpd(crate::templates::service_description::Scpd::new());
        }
        assert!(device.is_ready());
    }

    #[test]
    fn lease_clamping() {
        assert_eq!(clamp_lease(Duration::from_secs(5)), DEFAULT_LEASE_TIME);
        assert_eq!(clamp_lease(Duration::ZERO), DEFAULT_LEASE_TIME);
        assert_eq!(
            clamp_lease(Duration::from_secs(60)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn description_roundtrip_from_builder() {
        let uuid = uuid::Uuid::new_v4();
        let device = DeviceData::builder(
            crate::urn::URN::media_server(),
            "Living room",
        )
        .uuid(uuid)
        .dlna_doc("DMS-1.50")
        .build(reqwest::Url::parse("http://192.168.1.5:8000/").unwrap());

        let xml = device.description_xml().unwrap();
        let parsed =
            DeviceDescription::read_xml(&mut quick_xml::Reader::from_str(&xml)).unwrap();
        assert_eq!(parsed.device.friendly_name, "Living room");
        assert_eq!(parsed.device.udn.uuid(), uuid);
        assert_eq!(parsed.device.dlna_doc.as_deref(), Some("DMS-1.50"));
        assert_eq!(parsed.spec_version.major, 1);
    }
}
