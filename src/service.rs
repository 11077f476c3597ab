use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::{
    action::ActionDesc,
    eventing::{subscriber::Subscriber, write_last_change},
    templates::service_description::Scpd,
    urn::URN,
    FromXml, UpnpError,
};

/// Name of the aggregator variable used by the UPnP-AV service templates
pub const LAST_CHANGE: &str = "LastChange";

/// Concurrent subscribers allowed per service
pub(crate) const MAX_SUBSCRIBERS: usize = 30;

/// Relative urls a service is reachable at, resolved against the device url base
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUrls {
    pub scpd: String,
    pub control: String,
    pub event_sub: String,
}

impl ServiceUrls {
    /// Default layout used by the device host
    pub fn for_service(name: &str, uuid: uuid::Uuid) -> Self {
        Self {
            scpd: format!("/{name}/{uuid}/scpd.xml"),
            control: format!("/{name}/{uuid}/control.xml"),
            event_sub: format!("/{name}/{uuid}/event.xml"),
        }
    }
}

#[derive(Debug)]
struct ServiceInner {
    service_type: URN,
    scpd: Option<Scpd>,
    /// Indirectly eventing variables changed since the last `LastChange`
    /// publication
    indirect_changed: Vec<String>,
    /// Until the service is attached to a running host, value changes stay
    /// silent. Used for default initialization.
    attached: bool,
    subscribers: Vec<Subscriber>,
    event_task_started: bool,
}

/// Runtime UPnP service: the typed schema plus its live state variable values
/// and, on the device side, the subscriber set. The service owns its own lock;
/// parents are never reached back through it.
#[derive(Debug)]
pub struct Service {
    service_id: String,
    urls: ServiceUrls,
    last_change_namespace: Option<String>,
    inner: Mutex<ServiceInner>,
}

impl Service {
    pub fn new(service_type: URN, service_id: impl Into<String>, urls: ServiceUrls) -> Self {
        Self {
            service_id: service_id.into(),
            urls,
            last_change_namespace: None,
            inner: Mutex::new(ServiceInner {
                service_type,
                scpd: None,
                indirect_changed: Vec::new(),
                attached: false,
                subscribers: Vec::new(),
                event_task_started: false,
            }),
        }
    }

    /// Namespace of the `LastChange` event document, e.g.
    /// `urn:schemas-upnp-org:metadata-1-0/AVT/`
    pub fn with_last_change_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.last_change_namespace = Some(namespace.into());
        self
    }

    pub fn with_scpd(self, scpd: Scpd) -> Self {
        self.set_scpd(scpd);
        self
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn urn(&self) -> URN {
        self.inner.lock().unwrap().service_type.clone()
    }

    pub fn urls(&self) -> &ServiceUrls {
        &self.urls
    }

    pub fn last_change_namespace(&self) -> Option<&str> {
        self.last_change_namespace.as_deref()
    }

    /// Rewrites the version digit of the service type urn so a control point
    /// with older knowledge can keep talking to this service
    pub fn force_version(&self, version: u8) -> Result<(), UpnpError> {
        self.inner
            .lock()
            .unwrap()
            .service_type
            .force_version(version)
    }

    pub fn set_scpd(&self, scpd: Scpd) {
        let mut inner = self.inner.lock().unwrap();
        let mut scpd = scpd;
        // variables participating in a LastChange aggregator never emit their
        // own events
        if self.last_change_namespace.is_some()
            && scpd.find_state_variable(LAST_CHANGE).is_some()
        {
            for variable in &mut scpd.state_variables {
                if !variable.sends_events() && variable.name() != LAST_CHANGE {
                    variable.set_send_events_indirectly(true);
                }
            }
        }
        inner.scpd = Some(scpd);
    }

    /// Parses SCPD text fetched from a remote peer
    pub fn set_scpd_xml(&self, raw: &str) -> Result<(), UpnpError> {
        let scpd = Scpd::read_xml(&mut quick_xml::Reader::from_str(raw))
            .map_err(UpnpError::InvalidSyntax)?;
        self.set_scpd(scpd);
        Ok(())
    }

    pub fn has_scpd(&self) -> bool {
        self.inner.lock().unwrap().scpd.is_some()
    }

    pub fn scpd_xml(&self) -> Result<String, UpnpError> {
        let inner = self.inner.lock().unwrap();
        let scpd = inner
            .scpd
            .as_ref()
            .ok_or(UpnpError::InvalidState("scpd is not populated"))?;
        scpd.into_xml().map_err(UpnpError::InvalidSyntax)
    }

    /// Case insensitive action lookup
    pub fn find_action(&self, name: &str) -> Option<ActionDesc> {
        let inner = self.inner.lock().unwrap();
        inner.scpd.as_ref()?.find_action(name).cloned()
    }

    pub fn action_names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .scpd
            .as_ref()
            .map(|scpd| scpd.actions.iter().map(|a| a.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Case insensitive state variable value lookup
    pub fn state_variable_value(&self, name: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .scpd
            .as_ref()?
            .find_state_variable(name)
            .map(|v| v.value().to_string())
    }

    /// Validates `value` against the state variable an argument references.
    /// Used by the action dispatcher before handing values to the profile.
    pub fn validate_argument_value(
        &self,
        related_state_variable: &str,
        value: &str,
    ) -> Result<(), UpnpError> {
        let inner = self.inner.lock().unwrap();
        let scpd = inner
            .scpd
            .as_ref()
            .ok_or(UpnpError::InvalidState("scpd is not populated"))?;
        let variable = scpd
            .find_state_variable(related_state_variable)
            .ok_or(UpnpError::NotFound("state variable"))?;
        variable.validate_value(value)
    }

    pub(crate) fn attach(&self) {
        self.inner.lock().unwrap().attached = true;
    }

    /// Validates and stores the value. Once the service is attached to a
    /// running host the change enters the pending publish set; unchanged
    /// values emit nothing.
    pub fn set_state_variable(&self, name: &str, value: &str) -> Result<(), UpnpError> {
        let mut inner = self.inner.lock().unwrap();
        let attached = inner.attached;
        let (changed, canonical_name, indirect) = {
            let scpd = inner
                .scpd
                .as_mut()
                .ok_or(UpnpError::InvalidState("scpd is not populated"))?;
            let variable = scpd
                .find_state_variable_mut(name)
                .ok_or(UpnpError::NotFound("state variable"))?;
            let changed = variable.set_value(value)?;
            if changed && attached && variable.sends_events() {
                variable.mark_pending();
            }
            (
                changed,
                variable.name().to_string(),
                !variable.sends_events() && variable.sends_events_indirectly(),
            )
        };
        if !changed || !attached {
            return Ok(());
        }
        if indirect {
            if !inner.indirect_changed.contains(&canonical_name) {
                inner.indirect_changed.push(canonical_name);
            }
            self.regenerate_last_change(&mut inner, false);
        }
        Ok(())
    }

    /// Parses the current value as an integer and stores value + 1
    pub fn increment_state_variable(&self, name: &str) -> Result<(), UpnpError> {
        let current = self
            .state_variable_value(name)
            .ok_or(UpnpError::NotFound("state variable"))?;
        let num: i64 = current.trim().parse().map_err(|_| {
            UpnpError::InvalidParameters(format!("{current:?} is not an integer"))
        })?;
        self.set_state_variable(name, &(num + 1).to_string())
    }

    /// Minimum wall clock interval between notifications of the variable
    pub fn set_state_variable_rate(
        &self,
        name: &str,
        rate: Option<Duration>,
    ) -> Result<(), UpnpError> {
        let mut inner = self.inner.lock().unwrap();
        let scpd = inner
            .scpd
            .as_mut()
            .ok_or(UpnpError::InvalidState("scpd is not populated"))?;
        let variable = scpd
            .find_state_variable_mut(name)
            .ok_or(UpnpError::NotFound("state variable"))?;
        variable.set_rate(rate);
        Ok(())
    }

    /// Extra serialization attribute carried by the variable in event
    /// documents, e.g. `channel="Master"`
    pub fn set_state_variable_attribute(
        &self,
        name: &str,
        attribute: &str,
        value: &str,
    ) -> Result<(), UpnpError> {
        let mut inner = self.inner.lock().unwrap();
        let scpd = inner
            .scpd
            .as_mut()
            .ok_or(UpnpError::InvalidState("scpd is not populated"))?;
        let variable = scpd
            .find_state_variable_mut(name)
            .ok_or(UpnpError::NotFound("state variable"))?;
        variable.set_extra_attribute(attribute, value);
        Ok(())
    }

    /// Rewrites the `LastChange` variable from the indirectly eventing
    /// variables. `all` selects every variable (new subscriber initial event),
    /// otherwise only the ones changed since the last publication.
    fn regenerate_last_change(&self, inner: &mut ServiceInner, all: bool) {
        let Some(namespace) = &self.last_change_namespace else {
            return;
        };
        let changed = inner.indirect_changed.clone();
        let Some(scpd) = inner.scpd.as_mut() else {
            return;
        };
        if scpd.find_state_variable(LAST_CHANGE).is_none() {
            return;
        }
        let payload = {
            let selected: Vec<_> = scpd
                .state_variables
                .iter()
                .filter(|v| {
                    v.sends_events_indirectly()
                        && (all || changed.iter().any(|n| n == v.name()))
                })
                .collect();
            if selected.is_empty() {
                None
            } else {
                Some(write_last_change(namespace, &selected))
            }
        };
        let last_change = scpd
            .find_state_variable_mut(LAST_CHANGE)
            .expect("LastChange presence checked above");
        match payload {
            Some(payload) => {
                last_change.set_value_unchecked(payload);
                last_change.mark_pending();
            }
            None => last_change.clear_pending(),
        }
    }

    // Device side eventing, called by the router and the service event task.

    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }

    /// Snapshot of every directly sendable variable for a brand new
    /// subscriber. The `LastChange` aggregator is temporarily populated from
    /// all indirectly eventing variables and restored afterwards.
    pub(crate) fn initial_property_set(&self) -> Result<Vec<(String, String)>, UpnpError> {
        let mut inner = self.inner.lock().unwrap();
        self.regenerate_last_change(&mut inner, true);
        let scpd = inner
            .scpd
            .as_ref()
            .ok_or(UpnpError::InvalidState("scpd is not populated"))?;
        let properties = scpd
            .state_variables
            .iter()
            .filter(|v| v.sends_events())
            .map(|v| (v.name().to_string(), v.value().to_string()))
            .collect();
        self.regenerate_last_change(&mut inner, false);
        Ok(properties)
    }

    pub(crate) fn insert_subscriber(&self, subscriber: Subscriber) {
        self.inner.lock().unwrap().subscribers.push(subscriber);
    }

    /// Renewal only succeeds while the subscriber exists and has not expired;
    /// an expired one is dropped on the spot
    pub(crate) fn renew_subscriber(
        &self,
        sid: &str,
        timeout: Duration,
        local_addr: std::net::IpAddr,
        now: Instant,
    ) -> Result<(), UpnpError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(position) = inner.subscribers.iter().position(|s| s.sid == sid) else {
            return Err(UpnpError::NotFound("subscriber"));
        };
        if inner.subscribers[position].expiration <= now {
            tracing::debug!(sid, "Subscriber did not renew in time");
            inner.subscribers.remove(position);
            return Err(UpnpError::NotFound("subscriber"));
        }
        let subscriber = &mut inner.subscribers[position];
        // the subscriber may have reconnected through a different path
        subscriber.local_addr = local_addr;
        subscriber.expiration = now + timeout;
        Ok(())
    }

    pub(crate) fn remove_subscriber(&self, sid: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.sid != sid);
        inner.subscribers.len() != before
    }

    /// Collects variables whose pending publish flag is set and whose
    /// moderation rate permits publishing now. Publishing `LastChange` also
    /// clears the indirectly eventing changed set.
    pub(crate) fn take_publishable(&self, now: Instant) -> Vec<(String, String)> {
        let mut inner = self.inner.lock().unwrap();
        let Some(scpd) = inner.scpd.as_mut() else {
            return Vec::new();
        };
        let mut published = Vec::new();
        let mut last_change_published = false;
        for variable in &mut scpd.state_variables {
            if variable.sends_events() && variable.ready_to_publish(now) {
                variable.mark_published(now);
                published.push((variable.name().to_string(), variable.value().to_string()));
                if variable.name() == LAST_CHANGE {
                    last_change_published = true;
                }
            }
        }
        if last_change_published {
            inner.indirect_changed.clear();
        }
        published
    }

    /// Clones of the current subscribers for delivery outside the lock
    pub(crate) fn subscribers_snapshot(&self) -> Vec<Subscriber> {
        self.inner.lock().unwrap().subscribers.clone()
    }

    /// Evicts a subscriber that stayed expired beyond the grace window with a
    /// failing endpoint
    pub(crate) fn evict_subscriber(&self, sid: &str) {
        tracing::debug!(sid, service = self.service_id, "Evicting subscriber");
        self.remove_subscriber(sid);
    }

    /// Applies the delivery outcome: the event key always moves forward so
    /// sequence numbers stay strictly increasing per subscriber
    pub(crate) fn record_delivery(&self, sid: &str, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(subscriber) = inner.subscribers.iter_mut().find(|s| s.sid == sid) {
            subscriber.event_key.increment();
            subscriber.last_delivery_failed = !success;
        }
    }

    /// Returns true exactly once, when the caller should spawn the event task
    pub(crate) fn begin_event_task(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        !std::mem::replace(&mut inner.event_task_started, true)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::{
        eventing::parse_last_change,
        service_variables::{DataType, StateVariable},
        templates::service_description::Scpd,
        urn::{ServiceType, URN},
    };

    use super::{Service, ServiceUrls, LAST_CHANGE};

    fn rendering_control() -> Service {
        let scpd = Scpd::new()
            .with_state_variable(
                StateVariable::new(LAST_CHANGE, DataType::String).with_send_events(true),
            )
            .with_state_variable(StateVariable::new("Volume", DataType::Ui2).with_default("30"))
            .with_state_variable(StateVariable::new("Mute", DataType::Boolean).with_default("0"));
        let service = Service::new(
            URN::upnp_service(ServiceType::RenderingControl, 1),
            "urn:upnp-org:serviceId:RenderingControl",
            ServiceUrls::for_service("rendering_control", uuid::Uuid::new_v4()),
        )
        .with_last_change_namespace("urn:schemas-upnp-org:metadata-1-0/RCS/")
        .with_scpd(scpd);
        service.attach();
        service
    }

    #[test]
    fn changes_are_silent_before_attach() {
        let scpd = Scpd::new().with_state_variable(
            StateVariable::new("SystemUpdateID", DataType::Ui4)
                .with_send_events(true)
                .with_default("0"),
        );
        let service = Service::new(
            URN::upnp_service(ServiceType::ContentDirectory, 1),
            "urn:upnp-org:serviceId:ContentDirectory",
            ServiceUrls::for_service("content_directory", uuid::Uuid::new_v4()),
        )
        .with_scpd(scpd);

        service.set_state_variable("SystemUpdateID", "1").unwrap();
        assert!(service.take_publishable(Instant::now()).is_empty());

        service.attach();
        service.set_state_variable("SystemUpdateID", "2").unwrap();
        let published = service.take_publishable(Instant::now());
        assert_eq!(
            published,
            vec![("SystemUpdateID".to_string(), "2".to_string())]
        );
        // publishing cleared the pending flag
        assert!(service.take_publishable(Instant::now()).is_empty());
    }

    #[test]
    fn last_change_collapses_to_latest_values() {
        let service = rendering_control();
        service.set_state_variable("Volume", "10").unwrap();
        service.set_state_variable("Mute", "1").unwrap();
        service.set_state_variable("Volume", "25").unwrap();

        let published = service.take_publishable(Instant::now());
        assert_eq!(published.len(), 1);
        let (name, payload) = &published[0];
        assert_eq!(name, LAST_CHANGE);
        let updates = parse_last_change(payload).unwrap();
        assert!(updates.contains(&("Volume".to_string(), "25".to_string())));
        assert!(updates.contains(&("Mute".to_string(), "1".to_string())));
        assert!(!updates.contains(&("Volume".to_string(), "10".to_string())));
    }

    #[test]
    fn last_change_changed_set_clears_after_publish() {
        let service = rendering_control();
        service.set_state_variable("Volume", "10").unwrap();
        assert_eq!(service.take_publishable(Instant::now()).len(), 1);

        service.set_state_variable("Mute", "1").unwrap();
        let published = service.take_publishable(Instant::now());
        let updates = parse_last_change(&published[0].1).unwrap();
        // only the union of variables changed since the last publish
        assert_eq!(updates, vec![("Mute".to_string(), "1".to_string())]);
    }

    #[test]
    fn initial_property_set_carries_all_indirect_variables() {
        let service = rendering_control();
        service.set_state_variable("Volume", "42").unwrap();
        service.take_publishable(Instant::now());

        let initial = service.initial_property_set().unwrap();
        assert_eq!(initial.len(), 1);
        let updates = parse_last_change(&initial[0].1).unwrap();
        assert!(updates.contains(&("Volume".to_string(), "42".to_string())));
        assert!(updates.contains(&("Mute".to_string(), "0".to_string())));
    }

    #[test]
    fn moderation_rate_delays_publication() {
        let service = rendering_control();
        service
            .set_state_variable_rate(LAST_CHANGE, Some(Duration::from_millis(200)))
            .unwrap();
        let start = Instant::now();
        service.set_state_variable("Volume", "1").unwrap();
        assert_eq!(service.take_publishable(start).len(), 1);

        service.set_state_variable("Volume", "2").unwrap();
        // rate has not elapsed yet
        assert!(service.take_publishable(start + Duration::from_millis(100)).is_empty());
        let late = service.take_publishable(start + Duration::from_millis(250));
        assert_eq!(late.len(), 1);
    }

    #[test]
    fn increment_state_variable() {
        let scpd = Scpd::new().with_state_variable(
            StateVariable::new("SystemUpdateID", DataType::Ui4)
                .with_send_events(true)
                .with_default("6"),
        );
        let service = Service::new(
            URN::upnp_service(ServiceType::ContentDirectory, 1),
            "urn:upnp-org:serviceId:ContentDirectory",
            ServiceUrls::for_service("content_directory", uuid::Uuid::new_v4()),
        )
        .with_scpd(scpd);
        service.increment_state_variable("SystemUpdateID").unwrap();
        assert_eq!(
            service.state_variable_value("SystemUpdateID").unwrap(),
            "7"
        );
    }
}
