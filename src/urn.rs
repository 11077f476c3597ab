use std::{borrow::Cow, fmt::Display, str::FromStr};

use anyhow::Context;
use serde::Serialize;

use crate::UpnpError;

const UPNP_DOMAIN: &str = "schemas-upnp-org";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceType {
    MediaServer,
    MediaRenderer,
    Printer,
    Other(String),
}

impl From<&str> for DeviceType {
    fn from(value: &str) -> DeviceType {
        match value {
            "MediaServer" => DeviceType::MediaServer,
            "MediaRenderer" => DeviceType::MediaRenderer,
            "Printer" => DeviceType::Printer,
            _ => DeviceType::Other(value.to_string()),
        }
    }
}

impl Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceType::MediaServer => "MediaServer",
            DeviceType::MediaRenderer => "MediaRenderer",
            DeviceType::Printer => "Printer",
            DeviceType::Other(other) => other,
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceType {
    ContentDirectory,
    AVTransport,
    RenderingControl,
    ConnectionManager,
    Other(String),
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceType::ContentDirectory => "ContentDirectory",
            ServiceType::AVTransport => "AVTransport",
            ServiceType::RenderingControl => "RenderingControl",
            ServiceType::ConnectionManager => "ConnectionManager",
            ServiceType::Other(other) => other,
        };
        write!(f, "{name}")
    }
}

impl From<&str> for ServiceType {
    fn from(value: &str) -> ServiceType {
        match value {
            "ContentDirectory" => ServiceType::ContentDirectory,
            "AVTransport" => ServiceType::AVTransport,
            "RenderingControl" => ServiceType::RenderingControl,
            "ConnectionManager" => ServiceType::ConnectionManager,
            other => ServiceType::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrnType {
    Device(DeviceType),
    Service(ServiceType),
}

/// Uniform Resource Name. Provides a unique and persistent identifier for a
/// device or service type, e.g. `urn:schemas-upnp-org:service:ContentDirectory:1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct URN {
    /// `schemas-upnp-org` for standard types, vendor domain otherwise
    pub domain: Cow<'static, str>,
    pub version: u8,
    pub urn_type: UrnType,
}

impl Serialize for URN {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl URN {
    pub const fn upnp_device(device: DeviceType, version: u8) -> Self {
        Self {
            domain: Cow::Borrowed(UPNP_DOMAIN),
            version,
            urn_type: UrnType::Device(device),
        }
    }

    pub const fn upnp_service(service: ServiceType, version: u8) -> Self {
        Self {
            domain: Cow::Borrowed(UPNP_DOMAIN),
            version,
            urn_type: UrnType::Service(service),
        }
    }

    pub fn media_server() -> Self {
        Self::upnp_device(DeviceType::MediaServer, 1)
    }

    /// Rewrite the trailing version of the type. A control point with v1
    /// knowledge uses this to talk to a v2+ device safely.
    pub fn force_version(&mut self, version: u8) -> Result<(), UpnpError> {
        if version < 1 {
            return Err(UpnpError::InvalidParameters(format!(
                "version must be at least 1, got {version}"
            )));
        }
        self.version = version;
        Ok(())
    }

    /// Matches `pattern` against the string form of this urn. A trailing `*`
    /// in the pattern matches any version suffix.
    pub fn matches_pattern(&self, pattern: &str) -> bool {
        let own = self.to_string();
        match pattern.strip_suffix('*') {
            Some(prefix) => own.starts_with(prefix),
            None => own == pattern,
        }
    }

    pub fn is_same_type(&self, other: &URN) -> bool {
        self.domain == other.domain && self.urn_type == other.urn_type
    }
}

impl Display for URN {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (urn_type, name) = match &self.urn_type {
            UrnType::Device(device) => ("device", device.to_string()),
            UrnType::Service(service) => ("service", service.to_string()),
        };

        write!(
            f,
            "urn:{domain}:{urn_type}:{name}:{version}",
            domain = self.domain,
            version = self.version
        )
    }
}

impl FromStr for URN {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(5, ':');
        let urn = parts.next().context("urn prefix")?;
        anyhow::ensure!(urn == "urn");
        let domain = parts.next().context("domain")?;
        let schema_type = parts.next().context("schema type")?;
        let name = parts.next().context("service/device name")?;
        let version = parts
            .next()
            .context("service/device version")?
            .parse()
            .context("parse version")?;
        let urn_type = match schema_type {
            "device" => UrnType::Device(DeviceType::from(name)),
            "service" => UrnType::Service(ServiceType::from(name)),
            rest => return Err(anyhow::anyhow!("unknown urn type: {rest}")),
        };
        let domain = if domain == UPNP_DOMAIN {
            Cow::Borrowed(UPNP_DOMAIN)
        } else {
            Cow::Owned(domain.to_string())
        };
        Ok(URN {
            domain,
            version,
            urn_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{ServiceType, UrnType, URN};

    #[test]
    fn parse_roundtrip() {
        let raw = "urn:schemas-upnp-org:service:ContentDirectory:1";
        let urn = URN::from_str(raw).unwrap();
        assert_eq!(
            urn.urn_type,
            UrnType::Service(ServiceType::ContentDirectory)
        );
        assert_eq!(urn.to_string(), raw);

        let vendor = "urn:schemas-sony-com:service:ScalarWebAPI:2";
        let urn = URN::from_str(vendor).unwrap();
        assert_eq!(urn.version, 2);
        assert_eq!(urn.to_string(), vendor);
    }

    #[test]
    fn force_version_rewrites_only_version() {
        let mut urn = URN::from_str("urn:schemas-upnp-org:service:AVTransport:2").unwrap();
        urn.force_version(1).unwrap();
        assert_eq!(urn.to_string(), "urn:schemas-upnp-org:service:AVTransport:1");
        assert!(urn.force_version(0).is_err());
    }

    #[test]
    fn wildcard_matches_any_version() {
        let urn = URN::from_str("urn:schemas-upnp-org:service:RenderingControl:3").unwrap();
        assert!(urn.matches_pattern("urn:schemas-upnp-org:service:RenderingControl:*"));
        assert!(urn.matches_pattern("urn:schemas-upnp-org:service:RenderingControl:3"));
        assert!(!urn.matches_pattern("urn:schemas-upnp-org:service:RenderingControl:1"));
    }
}
