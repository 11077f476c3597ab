use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

use crate::service::Service;

use super::{write_property_set, EventKey, NTS_PROPCHANGE, NT_UPNP_EVENT};

/// How often the event task wakes up to look for publishable variables
pub(crate) const EVENT_TASK_INTERVAL: Duration = Duration::from_millis(100);
/// An expired subscriber survives this long before eviction, as long as its
/// endpoint keeps failing
pub(crate) const EXPIRATION_GRACE: Duration = Duration::from_secs(30);
/// Connect timeout for NOTIFY delivery, short to avoid hanging on dead
/// subscribers
pub(crate) const NOTIFY_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Device side subscriber of a service
#[derive(Debug, Clone)]
pub struct Subscriber {
    /// Opaque token in the form `uuid:<hex>`
    pub sid: String,
    /// Callback urls in preference order; delivery stops at the first success
    pub callbacks: Vec<String>,
    /// Local interface the SUBSCRIBE arrived on
    pub local_addr: IpAddr,
    pub event_key: EventKey,
    pub expiration: Instant,
    pub last_delivery_failed: bool,
}

impl Subscriber {
    pub fn new(callbacks: Vec<String>, local_addr: IpAddr, timeout: Duration) -> Self {
        Self {
            sid: format!("uuid:{}", uuid::Uuid::new_v4()),
            callbacks,
            local_addr,
            event_key: EventKey::initial(),
            expiration: Instant::now() + timeout,
            last_delivery_failed: false,
        }
    }

    pub(crate) fn should_evict(&self, now: Instant) -> bool {
        self.last_delivery_failed && self.expiration + EXPIRATION_GRACE <= now
    }
}

/// Sends one NOTIFY to the subscriber, trying its callback urls in order
pub(crate) async fn send_notify(
    client: &reqwest::Client,
    callbacks: &[String],
    sid: &str,
    seq: u32,
    body: &str,
) -> anyhow::Result<()> {
    let method = reqwest::Method::from_bytes(b"NOTIFY").expect("valid method name");
    let mut last_error = anyhow::anyhow!("no callback urls");
    for callback in callbacks {
        let response = client
            .request(method.clone(), callback)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=\"utf-8\"")
            .header("NT", NT_UPNP_EVENT)
            .header("NTS", NTS_PROPCHANGE)
            .header("SID", sid)
            .header("SEQ", seq.to_string())
            .body(body.to_string())
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => last_error = anyhow::anyhow!("notify status {}", response.status()),
            Err(e) => last_error = e.into(),
        }
    }
    Err(last_error)
}

/// Recurring notification task of a service. Runs once subscribers exist and
/// keeps draining the pending publish set until the host shuts down.
pub(crate) async fn service_event_task(
    service: Arc<Service>,
    client: reqwest::Client,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(EVENT_TASK_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = token.cancelled() => return,
        }
        let now = Instant::now();
        let published = service.take_publishable(now);
        if published.is_empty() {
            continue;
        }
        let body = write_property_set(&published);
        for subscriber in service.subscribers_snapshot() {
            if subscriber.should_evict(now) {
                service.evict_subscriber(&subscriber.sid);
                continue;
            }
            let result = send_notify(
                &client,
                &subscriber.callbacks,
                &subscriber.sid,
                subscriber.event_key.get(),
                &body,
            )
            .await;
            if let Err(e) = &result {
                tracing::debug!(
                    sid = subscriber.sid,
                    "Failed to notify subscriber: {e}"
                );
            }
            service.record_delivery(&subscriber.sid, result.is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        time::{Duration, Instant},
    };

    use super::{Subscriber, EXPIRATION_GRACE};

    #[test]
    fn eviction_requires_grace_and_failure() {
        let mut subscriber = Subscriber::new(
            vec!["http://192.168.1.9:9999/cb".to_string()],
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Duration::from_secs(0),
        );
        let now = Instant::now();
        // expired but the last delivery worked
        assert!(!subscriber.should_evict(now + EXPIRATION_GRACE * 2));

        subscriber.last_delivery_failed = true;
        // failing but still inside the grace window
        assert!(!subscriber.should_evict(now + Duration::from_secs(1)));
        assert!(subscriber.should_evict(now + EXPIRATION_GRACE * 2));
    }

    #[test]
    fn sid_is_an_opaque_uuid_token() {
        let subscriber = Subscriber::new(
            vec![],
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Duration::from_secs(300),
        );
        let hex = subscriber.sid.strip_prefix("uuid:").unwrap();
        assert!(hex.parse::<uuid::Uuid>().is_ok());
    }
}
