use std::{
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;

use crate::{
    device_description::DeviceData,
    eventing::{SubscriptionTimeout, DEFAULT_SUBSCRIPTION_TIMEOUT, NT_UPNP_EVENT},
    service::Service,
};

/// Renewal fires once a subscription is this close to expiring
pub(crate) const RENEWAL_WINDOW: Duration = Duration::from_secs(90);

/// Outbound subscription of a control point. Holds a root device handle so
/// an in-flight callback keeps the whole service graph alive even if the
/// device expires concurrently.
#[derive(Debug, Clone)]
pub(crate) struct OutboundSubscription {
    pub sid: String,
    pub device: Arc<DeviceData>,
    pub service: Arc<Service>,
    pub expiration: Instant,
    /// Events with a lower sequence arrive out of order and are dropped
    pub latest_event_key: u32,
    pub callback_url: String,
}

impl OutboundSubscription {
    pub fn needs_renewal(&self, now: Instant) -> bool {
        self.expiration.saturating_duration_since(now) <= RENEWAL_WINDOW
    }
}

fn subscribe_method() -> reqwest::Method {
    reqwest::Method::from_bytes(b"SUBSCRIBE").expect("valid method name")
}

fn parse_subscribe_response(response: &reqwest::Response) -> anyhow::Result<(String, Duration)> {
    anyhow::ensure!(
        response.status().is_success(),
        "subscribe failed with status {}",
        response.status()
    );
    let sid = response
        .headers()
        .get("sid")
        .and_then(|v| v.to_str().ok())
        .context("sid header")?
        .to_string();
    let timeout = response
        .headers()
        .get("timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(|t| SubscriptionTimeout::from_str(t).ok())
        .map(|t| t.duration())
        .unwrap_or(DEFAULT_SUBSCRIPTION_TIMEOUT);
    Ok((sid, timeout))
}

/// SUBSCRIBE with a callback url; the device answers with the SID that keys
/// every NOTIFY it will send us
pub(crate) async fn subscribe(
    client: &reqwest::Client,
    service: &Service,
    callback_url: &str,
) -> anyhow::Result<(String, Duration)> {
    let response = client
        .request(subscribe_method(), &service.urls().event_sub)
        .header("CALLBACK", format!("<{callback_url}>"))
        .header("NT", NT_UPNP_EVENT)
        .header(
            "TIMEOUT",
            SubscriptionTimeout::Seconds(DEFAULT_SUBSCRIPTION_TIMEOUT.as_secs() as u32)
                .to_string(),
        )
        .send()
        .await
        .context("send subscribe request")?;
    parse_subscribe_response(&response)
}

/// Renewal carries the SID and no NT/CALLBACK headers
pub(crate) async fn renew(
    client: &reqwest::Client,
    service: &Service,
    sid: &str,
) -> anyhow::Result<Duration> {
    let response = client
        .request(subscribe_method(), &service.urls().event_sub)
        .header("SID", sid)
        .header(
            "TIMEOUT",
            SubscriptionTimeout::Seconds(DEFAULT_SUBSCRIPTION_TIMEOUT.as_secs() as u32)
                .to_string(),
        )
        .send()
        .await
        .context("send renew request")?;
    let (_, timeout) = parse_subscribe_response(&response)?;
    Ok(timeout)
}

pub(crate) async fn unsubscribe(
    client: &reqwest::Client,
    service: &Service,
    sid: &str,
) -> anyhow::Result<()> {
    let method = reqwest::Method::from_bytes(b"UNSUBSCRIBE").expect("valid method name");
    client
        .request(method, &service.urls().event_sub)
        .header("SID", sid)
        .send()
        .await
        .context("send unsubscribe request")?;
    Ok(())
}
