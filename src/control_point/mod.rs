use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::Display,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    sync::{Arc, Mutex, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
};
use tokio_util::sync::CancellationToken;

use crate::{
    action::{
        ActionError, ActionResponse, InArgumentPayload, SoapMessage, WritableAction,
    },
    device_description::{clamp_lease, DeviceData, DeviceDescription},
    eventing::{parse_last_change, parse_property_set, NT_UPNP_EVENT},
    search::{search_task, SearchResponseSink},
    service::{Service, LAST_CHANGE},
    ssdp::{
        outbound_interface_for, usable_interfaces, Announce, BroadcastMessage, NotificationType,
        SsdpListener, SsdpMessageSink, SSDP_ADDR,
    },
    templates::UpnpAgent,
    FromXml, UpnpError,
};

mod object_id;
mod subscription;

pub use object_id::{format_object_id, split_object_id, ObjectIdPath};

use subscription::OutboundSubscription;

/// Debounce between an advertisement and the description fetch, so a
/// immediately following byebye cancels the inspection
const INSPECTION_DELAY: Duration = Duration::from_millis(500);
/// Embedded device recursion limit during inspection
const INSPECTION_MAX_DEPTH: usize = 5;
/// Housekeeping scans devices and subscriptions this often
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);
/// Notifications for a SID we have not processed the SUBSCRIBE response of
/// yet; oldest dropped beyond the cap
const MAX_PENDING_NOTIFICATIONS: usize = 20;
/// A soap round trip blocks the caller at most this long
const SOAP_TIMEOUT: Duration = Duration::from_secs(10);

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Device lifecycle and event callbacks of a control point. Implementations
/// must not block; everything heavier belongs on a task.
pub trait ControlPointListener: Send + Sync + 'static {
    fn on_device_added(&self, _device: Arc<DeviceData>) {}
    fn on_device_removed(&self, _device: Arc<DeviceData>) {}
    fn on_event(&self, _service: Arc<Service>, _updates: Vec<(String, String)>) {}
}

#[derive(Debug)]
pub enum ActionCallError {
    /// The service does not declare this action
    NotSupported,
    /// The device expired or said byebye; no network io was attempted
    DeviceGone,
    HttpError,
    Timeout,
    Other(anyhow::Error),
    /// The remote answered with a soap fault
    Action(ActionError),
}

pub type ActionCallResult<T> = Result<T, ActionCallError>;

impl Display for ActionCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionCallError::NotSupported => write!(f, "Action not supported"),
            ActionCallError::DeviceGone => write!(f, "Device is gone"),
            ActionCallError::HttpError => write!(f, "Http error"),
            ActionCallError::Timeout => write!(f, "Timed out"),
            ActionCallError::Other(e) => write!(f, "Other: {e}"),
            ActionCallError::Action(action_error) => action_error.fmt(f),
        }
    }
}

impl std::error::Error for ActionCallError {}

impl From<reqwest::Error> for ActionCallError {
    fn from(_value: reqwest::Error) -> Self {
        Self::HttpError
    }
}

impl From<anyhow::Error> for ActionCallError {
    fn from(value: anyhow::Error) -> Self {
        Self::Other(value)
    }
}

impl From<ActionError> for ActionCallError {
    fn from(value: ActionError) -> Self {
        Self::Action(value)
    }
}

#[derive(Debug, Clone)]
pub struct ControlPointConfig {
    pub user_agent: UpnpAgent<'static>,
    pub search_target: NotificationType,
    pub search_frequency: Duration,
    pub search_mx: usize,
    /// Local devices shared with a host in the same process
    pub ignored_uuids: Vec<uuid::Uuid>,
    pub strict_soap: bool,
}

impl Default for ControlPointConfig {
    fn default() -> Self {
        Self {
            user_agent: UpnpAgent::default(),
            search_target: NotificationType::RootDevice,
            search_frequency: Duration::from_secs(30),
            search_mx: 5,
            ignored_uuids: Vec::new(),
            strict_soap: true,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingNotification {
    sid: String,
    seq: u32,
    properties: Vec<(String, String)>,
}

#[derive(Default)]
struct CpState {
    devices: HashMap<uuid::Uuid, Arc<DeviceData>>,
    subscriptions: HashMap<String, OutboundSubscription>,
    pending_inspections: HashSet<uuid::Uuid>,
    pending_notifications: VecDeque<PendingNotification>,
    ignored: HashSet<uuid::Uuid>,
    listeners: Vec<Arc<dyn ControlPointListener>>,
}

/// Tracks live devices discovered over SSDP, inspects their descriptions,
/// invokes actions and manages outbound event subscriptions.
///
/// One mutex guards all shared state; anything that does network io collects
/// its work under the lock, releases it, then runs.
pub struct ControlPoint {
    state: Mutex<CpState>,
    http: reqwest::Client,
    config: ControlPointConfig,
    token: CancellationToken,
    local_ip: IpAddr,
    event_port: OnceLock<u16>,
    sink: OnceLock<Arc<dyn SsdpMessageSink>>,
}

impl ControlPoint {
    /// Starts the event callback server, the housekeeping task and the
    /// periodic search, and registers with the shared SSDP listener
    pub async fn start(
        config: ControlPointConfig,
        ssdp: Arc<SsdpListener>,
    ) -> anyhow::Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("build http client")?;
        let local_ip = outbound_interface_for(SSDP_ADDR)
            .ok()
            .or_else(|| usable_interfaces().first().copied().map(IpAddr::V4))
            .context("no usable network interface")?;

        let mut ignored = HashSet::new();
        ignored.extend(config.ignored_uuids.iter().copied());

        let control_point = Arc::new(Self {
            state: Mutex::new(CpState {
                ignored,
                ..Default::default()
            }),
            http,
            config,
            token: CancellationToken::new(),
            local_ip,
            event_port: OnceLock::new(),
            sink: OnceLock::new(),
        });

        // event callback surface: NOTIFY on /<device-uuid>/<service-id>
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("bind event callback server")?;
        let event_port = listener.local_addr()?.port();
        control_point
            .event_port
            .set(event_port)
            .expect("event port set once");
        let router = axum::Router::new()
            .fallback(handle_notify)
            .with_state(control_point.clone());
        let server_token = control_point.token.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(server_token.cancelled_owned())
                .await;
            if let Err(e) = result {
                tracing::error!("Event callback server failed: {e}");
            }
        });

        let sink: Arc<dyn SsdpMessageSink> = Arc::new(CpSink(control_point.clone()));
        ssdp.register_sink(sink.clone());
        if control_point.sink.set(sink).is_err() {
            panic!("sink set once");
        }

        tokio::spawn(housekeeping_task(
            control_point.clone(),
            control_point.token.clone(),
        ));

        let search_sink: Arc<dyn SearchResponseSink> = Arc::new(CpSink(control_point.clone()));
        let search_token = control_point.token.child_token();
        let search_config = control_point.config.clone();
        tokio::spawn(async move {
            let result = search_task(
                search_config.search_target.clone(),
                search_config.search_mx,
                search_config.search_frequency,
                None,
                Some(search_config.user_agent.to_string()),
                search_sink,
                search_token,
            )
            .await;
            if let Err(e) = result {
                tracing::error!("Ssdp search task failed: {e}");
            }
        });

        tracing::info!(
            event_port,
            %local_ip,
            "Control point started"
        );
        Ok(control_point)
    }

    pub fn register_listener(&self, listener: Arc<dyn ControlPointListener>) {
        self.state.lock().unwrap().listeners.push(listener);
    }

    /// Skip advertisements for a device this process hosts itself
    pub fn ignore_uuid(&self, uuid: uuid::Uuid) {
        self.state.lock().unwrap().ignored.insert(uuid);
    }

    pub fn devices(&self) -> Vec<Arc<DeviceData>> {
        self.state.lock().unwrap().devices.values().cloned().collect()
    }

    pub fn find_device(&self, uuid: uuid::Uuid) -> Option<Arc<DeviceData>> {
        self.state.lock().unwrap().devices.get(&uuid).cloned()
    }

    /// Cancels every task, tears down the event server and drops all state
    pub fn stop(&self, ssdp: &SsdpListener) {
        self.token.cancel();
        if let Some(sink) = self.sink.get() {
            ssdp.unregister_sink(sink);
        }
        let mut state = self.state.lock().unwrap();
        state.devices.clear();
        state.subscriptions.clear();
        state.pending_inspections.clear();
        state.pending_notifications.clear();
        tracing::info!("Control point stopped");
    }

    /// Builds the soap envelope for `action_name`, posts it to the service
    /// control url and decodes the response. The call completes or fails
    /// within a bounded wait; a device that said byebye or expired fails
    /// without any network io.
    pub async fn invoke_action(
        &self,
        device: &Arc<DeviceData>,
        service: &Arc<Service>,
        action_name: &str,
        arguments: &[(&str, &str)],
    ) -> ActionCallResult<Vec<(String, String)>> {
        if self.find_device(device.uuid()).is_none() {
            return Err(ActionCallError::DeviceGone);
        }
        let action = service
            .find_action(action_name)
            .ok_or(ActionCallError::NotSupported)?;

        let urn = service.urn();
        let mut writable = WritableAction::new(action.name(), &urn)
            .context("start soap request")?;
        for declared in action.in_args() {
            let value = arguments
                .iter()
                .find(|(name, _)| *name == declared.name)
                .map(|(_, value)| *value)
                .with_context(|| format!("missing in argument {}", declared.name))?;
            writable
                .write_argument(&declared.name, value)
                .context("write soap argument")?;
        }
        let payload = writable.finish()?;

        let soap_action = format!("\"{urn}#{name}\"", name = action.name());
        let request = self
            .http
            .post(&service.urls().control)
            .header("SOAPAction", soap_action)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=\"utf-8\"")
            .body(payload);

        let response = tokio::time::timeout(SOAP_TIMEOUT, request.send())
            .await
            .map_err(|_| ActionCallError::Timeout)??;
        tracing::trace!(
            action = action.name(),
            status = %response.status(),
            "Action response"
        );
        let text = tokio::time::timeout(SOAP_TIMEOUT, response.text())
            .await
            .map_err(|_| ActionCallError::Timeout)??;

        let parsed = SoapMessage::<Result<ActionResponse<InArgumentPayload>, ActionError>>::from_xml(
            text.as_bytes(),
            self.config.strict_soap,
        )?;
        let response = parsed.into_inner()?;

        // the response element must answer the invoked action in the service
        // type namespace; a FooResponse is never accepted for a Bar call
        response
            .verify(action.name(), &urn)
            .map_err(ActionCallError::Other)?;

        // every declared out argument must be present
        for declared in action.out_args() {
            if !response.args.iter().any(|a| a.name == declared.name) {
                return Err(ActionCallError::Other(anyhow::anyhow!(
                    "missing out argument {} in {} response",
                    declared.name,
                    action.name(),
                )));
            }
        }

        Ok(response
            .args
            .into_iter()
            .map(|arg| (arg.name, arg.value.into_owned()))
            .collect())
    }

    /// Subscribes to service events. Returns the SID the device will key its
    /// notifications with.
    pub async fn subscribe(
        &self,
        device: &Arc<DeviceData>,
        service: &Arc<Service>,
    ) -> Result<String, UpnpError> {
        if self.find_device(device.uuid()).is_none() {
            return Err(UpnpError::NotFound("device"));
        }
        let event_port = self
            .event_port
            .get()
            .ok_or(UpnpError::InvalidState("control point is not started"))?;
        let callback_url = format!(
            "http://{ip}:{port}/{uuid}/{service_id}",
            ip = self.local_ip,
            port = event_port,
            uuid = device.uuid(),
            service_id = service.service_id(),
        );
        let (sid, timeout) = subscription::subscribe(&self.http, service, &callback_url)
            .await
            .map_err(UpnpError::InvalidSyntax)?;
        tracing::debug!(sid, service = service.service_id(), "Subscribed");

        let replay = {
            let mut state = self.state.lock().unwrap();
            state.subscriptions.insert(
                sid.clone(),
                OutboundSubscription {
                    sid: sid.clone(),
                    device: device.clone(),
                    service: service.clone(),
                    expiration: Instant::now() + timeout,
                    latest_event_key: 0,
                    callback_url,
                },
            );
            // notifications that raced the subscribe response replay now
            let (matching, rest): (VecDeque<_>, VecDeque<_>) = state
                .pending_notifications
                .drain(..)
                .partition(|n| n.sid == sid);
            state.pending_notifications = rest;
            matching
        };
        for notification in replay {
            self.dispatch_notification(&notification.sid, notification.seq, notification.properties);
        }
        Ok(sid)
    }

    /// Removes the subscription record immediately and tells the device on a
    /// background task; the response is not awaited
    pub fn unsubscribe(&self, sid: &str) {
        let removed = self.state.lock().unwrap().subscriptions.remove(sid);
        let Some(subscription) = removed else {
            return;
        };
        let client = self.http.clone();
        let sid = sid.to_string();
        tokio::spawn(async move {
            if let Err(e) =
                subscription::unsubscribe(&client, &subscription.service, &sid).await
            {
                tracing::debug!(sid, "Unsubscribe request failed: {e}");
            }
        });
    }

    fn is_ignored(&self, uuid: uuid::Uuid) -> bool {
        self.state.lock().unwrap().ignored.contains(&uuid)
    }

    /// Alive advertisement or search response: refresh a known device or
    /// start inspecting an unknown one
    fn handle_alive(
        self: &Arc<Self>,
        uuid: uuid::Uuid,
        location: &str,
        lease: Duration,
        sender: SocketAddr,
    ) {
        if self.is_ignored(uuid) {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            if let Some(device) = state.devices.get(&uuid) {
                device.refresh_lease();
                return;
            }
            // dedup concurrent inspections of the same device
            if !state.pending_inspections.insert(uuid) {
                return;
            }
        }
        let control_point = self.clone();
        let location = location.to_string();
        let token = self.token.child_token();
        tokio::spawn(async move {
            tokio::select! {
                result = control_point.inspect(uuid, location, lease, sender) => {
                    if let Err(e) = result {
                        tracing::debug!(%uuid, "Inspection failed: {e}");
                        control_point
                            .state
                            .lock()
                            .unwrap()
                            .pending_inspections
                            .remove(&uuid);
                    }
                }
                _ = token.cancelled() => {}
            }
        });
    }

    /// Fetches and parses the description, then every SCPD of the tree.
    /// `DeviceAdded` fires exactly once, after all of it succeeded.
    async fn inspect(
        self: &Arc<Self>,
        uuid: uuid::Uuid,
        location: String,
        lease: Duration,
        sender: SocketAddr,
    ) -> anyhow::Result<()> {
        // debounce against an immediately following byebye
        tokio::time::sleep(INSPECTION_DELAY).await;
        if !self
            .state
            .lock()
            .unwrap()
            .pending_inspections
            .contains(&uuid)
        {
            // a byebye cancelled this inspection mid-flight
            return Ok(());
        }

        let location_url = reqwest::Url::parse(&location).context("parse location url")?;
        let local_addr =
            outbound_interface_for(sender).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let description = self
            .http
            .get(location_url.clone())
            .send()
            .await
            .context("fetch description")?
            .text()
            .await
            .context("read description")?;
        let description =
            DeviceDescription::read_xml(&mut quick_xml::Reader::from_str(&description))
                .context("parse description")?;
        let device = DeviceData::from_description(
            description,
            location_url,
            sender.ip(),
            local_addr,
            clamp_lease(lease),
        )?;

        // one pipelined client fetches every scpd; any failure drops the
        // whole device
        for service in device.all_services(INSPECTION_MAX_DEPTH) {
            let scpd = self
                .http
                .get(&service.urls().scpd)
                .send()
                .await
                .with_context(|| format!("fetch scpd of {}", service.service_id()))?
                .text()
                .await
                .context("read scpd")?;
            service
                .set_scpd_xml(&scpd)
                .map_err(|e| anyhow::anyhow!("parse scpd of {}: {e}", service.service_id()))?;
        }
        anyhow::ensure!(device.is_ready(), "device failed the readiness check");

        let listeners = {
            let mut state = self.state.lock().unwrap();
            if !state.pending_inspections.remove(&uuid) {
                return Ok(());
            }
            state.devices.insert(uuid, device.clone());
            state.listeners.clone()
        };
        tracing::info!(%uuid, name = device.friendly_name(), "Device added");
        for listener in listeners {
            listener.on_device_added(device.clone());
        }
        Ok(())
    }

    /// Byebye: forget the device, cancel its subscriptions, tell listeners
    fn handle_byebye(&self, uuid: uuid::Uuid) {
        let (device, listeners) = {
            let mut state = self.state.lock().unwrap();
            state.pending_inspections.remove(&uuid);
            let Some(device) = state.devices.remove(&uuid) else {
                return;
            };
            state
                .subscriptions
                .retain(|_, subscription| subscription.device.uuid() != uuid);
            (device, state.listeners.clone())
        };
        tracing::info!(%uuid, name = device.friendly_name(), "Device removed");
        for listener in listeners {
            listener.on_device_removed(device.clone());
        }
    }

    /// Queues a notification for an unknown SID, otherwise applies it
    fn dispatch_notification(
        &self,
        sid: &str,
        seq: u32,
        properties: Vec<(String, String)>,
    ) {
        let (subscription, listeners) = {
            let mut state = self.state.lock().unwrap();
            if !state.subscriptions.contains_key(sid) {
                // the SUBSCRIBE response may not have been processed yet
                if state.pending_notifications.len() >= MAX_PENDING_NOTIFICATIONS {
                    state.pending_notifications.pop_front();
                }
                state.pending_notifications.push_back(PendingNotification {
                    sid: sid.to_string(),
                    seq,
                    properties,
                });
                return;
            }
            let subscription = state
                .subscriptions
                .get_mut(sid)
                .expect("presence checked above");
            if seq < subscription.latest_event_key {
                tracing::debug!(sid, seq, "Dropping out of order notification");
                return;
            }
            subscription.latest_event_key = seq;
            (subscription.clone(), state.listeners.clone())
        };

        let mut updates = Vec::new();
        for (name, value) in properties {
            if subscription.service.set_state_variable(&name, &value).is_err() {
                tracing::trace!(name, "Notification for unknown state variable");
            }
            let last_change = (name == LAST_CHANGE).then(|| value.clone());
            updates.push((name, value));
            // decompose the aggregator into per variable updates
            if let Some(payload) = last_change {
                if let Ok(decomposed) = parse_last_change(&payload) {
                    for (inner_name, inner_value) in decomposed {
                        let _ = subscription
                            .service
                            .set_state_variable(&inner_name, &inner_value);
                        updates.push((inner_name, inner_value));
                    }
                }
            }
        }
        for listener in listeners {
            listener.on_event(subscription.service.clone(), updates.clone());
        }
    }
}

/// Periodic housekeeping: expire devices past twice their lease and renew
/// subscriptions close to expiring. Renewal requests are collected under the
/// lock and sent after releasing it.
async fn housekeeping_task(control_point: Arc<ControlPoint>, token: CancellationToken) {
    let mut interval = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = token.cancelled() => return,
        }
        let now = Instant::now();

        let (expired, renewals, listeners) = {
            let mut state = control_point.state.lock().unwrap();
            let expired: Vec<_> = state
                .devices
                .iter()
                .filter(|(_, device)| device.is_expired(now))
                .map(|(uuid, device)| (*uuid, device.clone()))
                .collect();
            for (uuid, _) in &expired {
                state.devices.remove(uuid);
                state
                    .subscriptions
                    .retain(|_, subscription| subscription.device.uuid() != *uuid);
            }
            let renewals: Vec<_> = state
                .subscriptions
                .values()
                .filter(|subscription| subscription.needs_renewal(now))
                .cloned()
                .collect();
            (expired, renewals, state.listeners.clone())
        };

        for (uuid, device) in expired {
            tracing::info!(%uuid, "Device lease expired");
            for listener in &listeners {
                listener.on_device_removed(device.clone());
            }
        }

        for renewal in renewals {
            match subscription::renew(&control_point.http, &renewal.service, &renewal.sid).await
            {
                Ok(timeout) => {
                    let mut state = control_point.state.lock().unwrap();
                    if let Some(subscription) = state.subscriptions.get_mut(&renewal.sid) {
                        subscription.expiration = Instant::now() + timeout;
                    }
                }
                Err(e) => {
                    tracing::warn!(sid = renewal.sid, "Renewal failed: {e}");
                    control_point
                        .state
                        .lock()
                        .unwrap()
                        .subscriptions
                        .remove(&renewal.sid);
                }
            }
        }
    }
}

/// Adapter registered with the SSDP listener and the search task
struct CpSink(Arc<ControlPoint>);

impl SsdpMessageSink for CpSink {
    fn on_ssdp_message(&self, message: &BroadcastMessage<'_>, sender: SocketAddr) {
        match message {
            BroadcastMessage::NotifyAlive(alive) => {
                self.0.handle_alive(
                    alive.usn.uuid(),
                    &alive.location,
                    Duration::from_secs(alive.cache_control as u64),
                    sender,
                );
            }
            BroadcastMessage::NotifyByeBye(byebye) => {
                self.0.handle_byebye(byebye.usn.uuid());
            }
            BroadcastMessage::NotifyUpdate(update) => {
                // treated as a lease refresh for cache purposes
                if let Ok(usn) = crate::ssdp::USN::from_str(update.usn) {
                    if let Some(device) = self.0.find_device(usn.uuid()) {
                        device.refresh_lease();
                    }
                }
            }
            BroadcastMessage::Search(_) => {}
        }
    }
}

impl SearchResponseSink for CpSink {
    fn on_search_response(&self, response: &Announce, sender: SocketAddr) {
        self.0.handle_alive(
            response.usn.uuid(),
            &response.location,
            Duration::from_secs(response.cache_control as u64),
            sender,
        );
    }
}

/// Inbound NOTIFY on the event callback server
async fn handle_notify(
    State(control_point): State<Arc<ControlPoint>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    if method.as_str() != "NOTIFY" {
        return StatusCode::METHOD_NOT_ALLOWED;
    }
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let Some(sid) = header("sid") else {
        return StatusCode::PRECONDITION_FAILED;
    };
    if header("nt") != Some(NT_UPNP_EVENT) || header("nts").is_none() {
        return StatusCode::PRECONDITION_FAILED;
    }
    let Some(seq) = header("seq").and_then(|s| s.parse::<u32>().ok()) else {
        return StatusCode::PRECONDITION_FAILED;
    };
    let Ok(properties) = parse_property_set(&body) else {
        tracing::debug!(path = uri.path(), "Unparseable notify body");
        return StatusCode::PRECONDITION_FAILED;
    };
    control_point.dispatch_notification(sid, seq, properties);
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::{Arc, Mutex, OnceLock},
        time::{Duration, Instant},
    };

    use tokio_util::sync::CancellationToken;

    use crate::{
        service::{Service, ServiceUrls},
        service_variables::{DataType, StateVariable},
        templates::service_description::Scpd,
        urn::{ServiceType, URN},
    };

    use super::{
        subscription::OutboundSubscription, ControlPoint, ControlPointConfig,
        ControlPointListener, CpState, MAX_PENDING_NOTIFICATIONS,
    };

    struct RecordingListener {
        events: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl ControlPointListener for RecordingListener {
        fn on_event(&self, service: Arc<Service>, updates: Vec<(String, String)>) {
            self.events
                .lock()
                .unwrap()
                .push((service.service_id().to_string(), updates));
        }
    }

    fn bare_control_point() -> ControlPoint {
        ControlPoint {
            state: Mutex::new(CpState::default()),
            http: reqwest::Client::new(),
            config: ControlPointConfig::default(),
            token: CancellationToken::new(),
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            event_port: OnceLock::new(),
            sink: OnceLock::new(),
        }
    }

    fn rendering_control_service() -> Arc<Service> {
        let scpd = Scpd::new()
            .with_state_variable(
                StateVariable::new("LastChange", DataType::String).with_send_events(true),
            )
            .with_state_variable(StateVariable::new("Volume", DataType::Ui2).with_default("0"));
        Arc::new(
            Service::new(
                URN::upnp_service(ServiceType::RenderingControl, 1),
                "urn:upnp-org:serviceId:RenderingControl",
                ServiceUrls {
                    scpd: "http://192.168.1.9:9999/rc/scpd.xml".to_string(),
                    control: "http://192.168.1.9:9999/rc/control.xml".to_string(),
                    event_sub: "http://192.168.1.9:9999/rc/event.xml".to_string(),
                },
            )
            .with_scpd(scpd),
        )
    }

    fn test_subscription(service: Arc<Service>) -> OutboundSubscription {
        let device = crate::device_description::DeviceData::builder(URN::media_server(), "test")
            .build(reqwest::Url::parse("http://192.168.1.9:9999/").unwrap());
        OutboundSubscription {
            sid: "uuid:sub-1".to_string(),
            device,
            service,
            expiration: Instant::now() + Duration::from_secs(300),
            latest_event_key: 0,
            callback_url: String::new(),
        }
    }

    #[test]
    fn renewal_window() {
        let now = Instant::now();
        let subscription = test_subscription(rendering_control_service());
        assert!(!subscription.needs_renewal(now));
        assert!(subscription.needs_renewal(now + Duration::from_secs(250)));
        assert!(subscription.needs_renewal(now + Duration::from_secs(400)));
    }

    #[test]
    fn unknown_sid_notifications_queue_bounded() {
        let control_point = bare_control_point();
        for i in 0..(MAX_PENDING_NOTIFICATIONS + 5) {
            control_point.dispatch_notification(
                "uuid:unknown",
                i as u32,
                vec![("SystemUpdateID".to_string(), i.to_string())],
            );
        }
        let state = control_point.state.lock().unwrap();
        assert_eq!(
            state.pending_notifications.len(),
            MAX_PENDING_NOTIFICATIONS
        );
        // oldest entries were dropped
        assert_eq!(state.pending_notifications.front().unwrap().seq, 5);
    }

    #[test]
    fn out_of_order_notifications_are_dropped() {
        let control_point = bare_control_point();
        let listener = Arc::new(RecordingListener {
            events: Mutex::new(Vec::new()),
        });
        let service = rendering_control_service();
        let subscription = test_subscription(service);
        control_point
            .state
            .lock()
            .unwrap()
            .subscriptions
            .insert(subscription.sid.clone(), subscription.clone());
        control_point.register_listener(listener.clone());

        control_point.dispatch_notification(
            &subscription.sid,
            4,
            vec![("Volume".to_string(), "10".to_string())],
        );
        control_point.dispatch_notification(
            &subscription.sid,
            2,
            vec![("Volume".to_string(), "3".to_string())],
        );
        let events = listener.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, vec![("Volume".to_string(), "10".to_string())]);
    }

    #[test]
    fn last_change_notifications_decompose() {
        let control_point = bare_control_point();
        let listener = Arc::new(RecordingListener {
            events: Mutex::new(Vec::new()),
        });
        let service = rendering_control_service();
        let subscription = test_subscription(service.clone());
        control_point
            .state
            .lock()
            .unwrap()
            .subscriptions
            .insert(subscription.sid.clone(), subscription.clone());
        control_point.register_listener(listener.clone());

        let payload = r#"<Event xmlns="urn:schemas-upnp-org:metadata-1-0/RCS/"><InstanceID val="0"><Volume val="42"/></InstanceID></Event>"#;
        control_point.dispatch_notification(
            &subscription.sid,
            1,
            vec![("LastChange".to_string(), payload.to_string())],
        );

        let events = listener.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0]
            .1
            .contains(&("Volume".to_string(), "42".to_string())));
        assert_eq!(service.state_variable_value("Volume").unwrap(), "42");
    }
}
