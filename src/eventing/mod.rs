use std::{fmt::Display, str::FromStr, time::Duration};

use anyhow::Context;
use axum::http::HeaderMap;
use quick_xml::events::{BytesStart, BytesText, Event};
use reqwest::StatusCode;

use crate::{service_variables::StateVariable, XmlReaderExt};

pub mod subscriber;

pub const EVENT_NS: &str = "urn:schemas-upnp-org:event-1-0";
pub const NT_UPNP_EVENT: &str = "upnp:event";
pub const NTS_PROPCHANGE: &str = "upnp:propchange";

/// Default subscription duration when the subscriber asks for
/// `Second-infinite` or sends nothing usable
pub const DEFAULT_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Event sequence number of a subscriber. Starts at 0 for the initial event
/// and wraps `0xFFFFFFFF` to 1, never back to 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventKey(u32);

impl EventKey {
    pub fn initial() -> Self {
        Self(0)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn increment(&mut self) {
        self.0 = if self.0 == u32::MAX { 1 } else { self.0 + 1 };
    }
}

impl Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `TIMEOUT` header value: `Second-N` or `Second-infinite`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionTimeout {
    Seconds(u32),
    Infinite,
}

impl SubscriptionTimeout {
    /// Resolved duration; infinite falls back to the default
    pub fn duration(&self) -> Duration {
        match self {
            SubscriptionTimeout::Seconds(secs) => Duration::from_secs(*secs as u64),
            SubscriptionTimeout::Infinite => DEFAULT_SUBSCRIPTION_TIMEOUT,
        }
    }
}

impl Display for SubscriptionTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionTimeout::Seconds(secs) => write!(f, "Second-{secs}"),
            SubscriptionTimeout::Infinite => write!(f, "Second-infinite"),
        }
    }
}

impl FromStr for SubscriptionTimeout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("Second-")
            .or_else(|| s.strip_prefix("second-"))
            .context("timeout must start with Second-")?;
        if rest.eq_ignore_ascii_case("infinite") {
            return Ok(Self::Infinite);
        }
        Ok(Self::Seconds(rest.parse().context("parse timeout seconds")?))
    }
}

/// Parsed GENA request on a service event url
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeRequest {
    New {
        callbacks: Vec<String>,
        timeout: Duration,
    },
    Renew {
        sid: String,
        timeout: Duration,
    },
}

/// Protocol visible subscription failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeError {
    /// An SID header and one of NT or CALLBACK headers are present
    IncompatibleHeaders,
    /// CALLBACK is missing or not a valid http url, NT is not `upnp:event`,
    /// or the SID is unknown/expired
    PreconditionFailed,
}

impl SubscribeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SubscribeError::IncompatibleHeaders => StatusCode::BAD_REQUEST,
            SubscribeError::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
        }
    }
}

impl SubscribeRequest {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, SubscribeError> {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let sid = header("sid");
        let nt = header("nt");
        let callback = header("callback");
        let timeout = header("timeout")
            .and_then(|t| SubscriptionTimeout::from_str(t).ok())
            .map(|t| t.duration())
            .unwrap_or(DEFAULT_SUBSCRIPTION_TIMEOUT);

        if let Some(sid) = sid {
            if nt.is_some() || callback.is_some() {
                return Err(SubscribeError::IncompatibleHeaders);
            }
            return Ok(Self::Renew {
                sid: sid.to_string(),
                timeout,
            });
        }

        if nt != Some(NT_UPNP_EVENT) {
            return Err(SubscribeError::PreconditionFailed);
        }
        let callbacks = parse_callbacks(callback.ok_or(SubscribeError::PreconditionFailed)?);
        if callbacks.is_empty() {
            return Err(SubscribeError::PreconditionFailed);
        }
        Ok(Self::New { callbacks, timeout })
    }
}

/// Extracts `<url>` bracketed callback urls, keeping only valid http ones
pub fn parse_callbacks(raw: &str) -> Vec<String> {
    let mut urls = Vec::new();
    let mut rest = raw;
    while let Some(open) = rest.find('<') {
        let Some(close) = rest[open..].find('>') else {
            break;
        };
        let url = &rest[open + 1..open + close];
        if url.starts_with("http://") && reqwest::Url::parse(url).is_ok() {
            urls.push(url.to_string());
        }
        rest = &rest[open + close + 1..];
    }
    urls
}

/// Writes the NOTIFY body: one `<e:property>` per variable
pub fn write_property_set(properties: &[(String, String)]) -> String {
    let mut w = quick_xml::Writer::new(Vec::new());
    let parent = BytesStart::new("e:propertyset").with_attributes([("xmlns:e", EVENT_NS)]);
    let parent_end = parent.to_end().into_owned();
    w.write_event(Event::Start(parent)).expect("write to vec");
    for (name, value) in properties {
        w.create_element("e:property")
            .write_inner_content(|w| {
                w.create_element(name.as_str())
                    .write_text_content(BytesText::new(value))?;
                Ok::<(), quick_xml::Error>(())
            })
            .expect("write to vec");
    }
    w.write_event(Event::End(parent_end)).expect("write to vec");
    String::from_utf8(w.into_inner()).expect("produced value to be utf-8")
}

/// Parses an inbound NOTIFY body into `(variable, value)` pairs
pub fn parse_property_set(raw: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut r = quick_xml::Reader::from_str(raw);
    let root = r.read_to_start()?;
    anyhow::ensure!(
        root.local_name().as_ref() == b"propertyset",
        "expected propertyset root"
    );
    let mut properties = Vec::new();
    loop {
        match r.read_event_err_eof()? {
            Event::Start(start) if start.local_name().as_ref() == b"property" => loop {
                match r.read_event_err_eof()? {
                    Event::Start(var) => {
                        let name = String::from_utf8(var.local_name().as_ref().to_vec())?;
                        let value = r.read_text(var.name())?.to_string();
                        properties.push((name, value));
                    }
                    Event::Empty(var) => {
                        let name = String::from_utf8(var.local_name().as_ref().to_vec())?;
                        properties.push((name, String::new()));
                    }
                    Event::End(end) if end.local_name().as_ref() == b"property" => break,
                    Event::Text(_) => {}
                    e => anyhow::bail!("expected property contents, got {:?}", e),
                }
            },
            Event::End(end) if end.local_name().as_ref() == b"propertyset" => break,
            Event::Start(other) => {
                r.read_to_end(other.name().to_owned())?;
            }
            _ => {}
        }
    }
    Ok(properties)
}

/// Builds the `LastChange` payload: an `<Event>` document carrying the given
/// variables with their extra serialization attributes
pub fn write_last_change(namespace: &str, variables: &[&StateVariable]) -> String {
    let mut w = quick_xml::Writer::new(Vec::new());
    let event = BytesStart::new("Event").with_attributes([("xmlns", namespace)]);
    let event_end = event.to_end().into_owned();
    w.write_event(Event::Start(event)).expect("write to vec");
    let instance = BytesStart::new("InstanceID").with_attributes([("val", "0")]);
    let instance_end = instance.to_end().into_owned();
    w.write_event(Event::Start(instance)).expect("write to vec");
    for variable in variables {
        let mut var = BytesStart::new(variable.name());
        var.push_attribute(("val", variable.value()));
        for (name, value) in variable.extra_attributes() {
            var.push_attribute((name.as_str(), value.as_str()));
        }
        w.write_event(Event::Empty(var)).expect("write to vec");
    }
    w.write_event(Event::End(instance_end)).expect("write to vec");
    w.write_event(Event::End(event_end)).expect("write to vec");
    String::from_utf8(w.into_inner()).expect("produced value to be utf-8")
}

/// Decomposes a `LastChange` payload into per variable updates
pub fn parse_last_change(raw: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut r = quick_xml::Reader::from_str(raw);
    let root = r.read_to_start()?;
    anyhow::ensure!(root.local_name().as_ref() == b"Event", "expected Event root");
    let mut updates = Vec::new();
    loop {
        match r.read_event_err_eof()? {
            Event::Start(start) | Event::Empty(start)
                if start.local_name().as_ref() == b"InstanceID" => {}
            Event::Start(var) | Event::Empty(var) => {
                let name = String::from_utf8(var.local_name().as_ref().to_vec())?;
                let value = var
                    .attributes()
                    .flatten()
                    .find(|attr| attr.key.local_name().as_ref() == b"val")
                    .map(|attr| attr.unescape_value().map(|v| v.to_string()))
                    .transpose()?
                    .context("variable val attribute")?;
                updates.push((name, value));
            }
            Event::End(end) if end.local_name().as_ref() == b"Event" => break,
            Event::End(_) => {}
            Event::Text(_) => {}
            e => anyhow::bail!("expected InstanceID contents, got {:?}", e),
        }
    }
    Ok(updates)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::HeaderMap;

    use crate::service_variables::{DataType, StateVariable};

    use super::{
        parse_callbacks, parse_last_change, parse_property_set, write_last_change,
        write_property_set, EventKey, SubscribeError, SubscribeRequest, SubscriptionTimeout,
    };

    #[test]
    fn event_key_wraps_to_one() {
        let mut key = EventKey::initial();
        assert_eq!(key.get(), 0);
        key.increment();
        assert_eq!(key.get(), 1);
        let mut key = EventKey(u32::MAX);
        key.increment();
        assert_eq!(key.get(), 1);
    }

    #[test]
    fn timeout_header_parsing() {
        assert_eq!(
            "Second-300".parse::<SubscriptionTimeout>().unwrap(),
            SubscriptionTimeout::Seconds(300)
        );
        assert_eq!(
            "Second-infinite".parse::<SubscriptionTimeout>().unwrap(),
            SubscriptionTimeout::Infinite
        );
        assert_eq!(
            SubscriptionTimeout::Infinite.duration(),
            Duration::from_secs(300)
        );
        assert!("300".parse::<SubscriptionTimeout>().is_err());
    }

    #[test]
    fn callback_extraction() {
        let urls =
            parse_callbacks("<http://192.168.1.5:3400/cb><https://skip.me><http://10.0.0.2/x>");
        assert_eq!(urls, ["http://192.168.1.5:3400/cb", "http://10.0.0.2/x"]);
        assert!(parse_callbacks("no brackets").is_empty());
    }

    #[test]
    fn subscribe_request_discrimination() {
        let mut headers = HeaderMap::new();
        headers.insert("NT", "upnp:event".parse().unwrap());
        headers.insert(
            "CALLBACK",
            "<http://192.168.1.5:3400/cb>".parse().unwrap(),
        );
        headers.insert("TIMEOUT", "Second-1800".parse().unwrap());
        let request = SubscribeRequest::from_headers(&headers).unwrap();
        assert_eq!(
            request,
            SubscribeRequest::New {
                callbacks: vec!["http://192.168.1.5:3400/cb".to_string()],
                timeout: Duration::from_secs(1800),
            }
        );

        let mut renew = HeaderMap::new();
        renew.insert("SID", "uuid:abc".parse().unwrap());
        assert!(matches!(
            SubscribeRequest::from_headers(&renew).unwrap(),
            SubscribeRequest::Renew { .. }
        ));

        // SID mixed with NT is incompatible
        renew.insert("NT", "upnp:event".parse().unwrap());
        assert_eq!(
            SubscribeRequest::from_headers(&renew).unwrap_err(),
            SubscribeError::IncompatibleHeaders
        );

        let mut bad_nt = HeaderMap::new();
        bad_nt.insert("NT", "upnp:rootdevice".parse().unwrap());
        bad_nt.insert(
            "CALLBACK",
            "<http://192.168.1.5:3400/cb>".parse().unwrap(),
        );
        assert_eq!(
            SubscribeRequest::from_headers(&bad_nt).unwrap_err(),
            SubscribeError::PreconditionFailed
        );
    }

    #[test]
    fn property_set_roundtrip() {
        let properties = vec![
            ("SystemUpdateID".to_string(), "7".to_string()),
            ("ContainerUpdateIDs".to_string(), "0,12".to_string()),
        ];
        let raw = write_property_set(&properties);
        assert!(raw.starts_with("<e:propertyset"));
        let parsed = parse_property_set(&raw).unwrap();
        assert_eq!(parsed, properties);
    }

    #[test]
    fn last_change_roundtrip_with_attributes() {
        let mut volume = StateVariable::new("Volume", DataType::Ui2).with_default("30");
        volume.set_extra_attribute("channel", "Master");
        let mute = StateVariable::new("Mute", DataType::Boolean).with_default("0");
        let raw = write_last_change(
            "urn:schemas-upnp-org:metadata-1-0/RCS/",
            &[&volume, &mute],
        );
        assert!(raw.contains(r#"channel="Master""#));
        let updates = parse_last_change(&raw).unwrap();
        assert_eq!(
            updates,
            vec![
                ("Volume".to_string(), "30".to_string()),
                ("Mute".to_string(), "0".to_string()),
            ]
        );
    }
}
