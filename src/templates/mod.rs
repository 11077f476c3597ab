use std::fmt::Display;

use anyhow::Context;
use quick_xml::events::{BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};

use crate::{FromXml, IntoXml, XmlReaderExt, XmlWriter};

pub mod service_description;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecVersion {
    pub major: usize,
    pub minor: usize,
}

impl SpecVersion {
    pub const fn upnp_v1() -> Self {
        Self { major: 1, minor: 0 }
    }
    pub const fn upnp_v1_1() -> Self {
        Self { major: 1, minor: 1 }
    }
}

impl IntoXml for SpecVersion {
    fn write_xml(&self, w: &mut XmlWriter) -> quick_xml::Result<()> {
        let parent = BytesStart::new("specVersion");
        w.write_event(Event::Start(parent.clone()))?;
        w.create_element("major")
            .write_text_content(BytesText::new(&self.major.to_string()))?;
        w.create_element("minor")
            .write_text_content(BytesText::new(&self.minor.to_string()))?;
        w.write_event(Event::End(parent.to_end()))
    }
}

impl<'a> FromXml<'a> for SpecVersion {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let spec_version = r.read_to_start()?;
        anyhow::ensure!(spec_version.local_name().as_ref() == b"specVersion");
        Self::read_xml_body(r)
    }
}

impl SpecVersion {
    /// Parses the element contents once the caller consumed the start tag
    pub(crate) fn read_xml_body(r: &mut quick_xml::Reader<&[u8]>) -> anyhow::Result<Self> {
        let mut major = None;
        let mut minor = None;
        loop {
            match r.read_event_err_eof()? {
                Event::Start(start) => {
                    let end = start.name().to_owned();
                    match start.local_name().as_ref() {
                        b"major" => major = Some(r.read_text(end)?.trim().parse()?),
                        b"minor" => minor = Some(r.read_text(end)?.trim().parse()?),
                        _ => {
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"specVersion");
                    break;
                }
                _ => {}
            }
        }
        Ok(Self {
            major: major.context("major version")?,
            minor: minor.context("minor version")?,
        })
    }
}

impl Display for SpecVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Value of the SSDP `SERVER` / `USER-AGENT` headers:
/// `OS/version UPnP/1.0 product/version`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpnpAgent<'a> {
    pub os: &'a str,
    pub os_version: &'a str,
    pub product: &'a str,
    pub product_version: &'a str,
}

impl Default for UpnpAgent<'static> {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS,
            os_version: "1.0",
            product: env!("CARGO_PKG_NAME"),
            product_version: env!("CARGO_PKG_VERSION"),
        }
    }
}

impl Display for UpnpAgent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{os}/{os_version} UPnP/1.0 {product}/{product_version}",
            os = self.os,
            os_version = self.os_version,
            product = self.product,
            product_version = self.product_version,
        )
    }
}
