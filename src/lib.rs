#![doc = include_str!("../README.md")]
pub mod action;
/// UPnP control point: discovery cache, description/SCPD inspection, action
/// invocation and outbound event subscriptions
pub mod control_point;
pub mod device_description;
/// UPnP device host: network advertisement, description/SCPD serving and
/// SOAP action dispatch
pub mod device_host;
/// GENA eventing: subscriptions, moderated notification delivery, property sets
pub mod eventing;
/// Axum router used to setup description, control and event endpoints
mod router;
/// SSDP search task used by control points
pub mod search;
pub mod service;
mod service_variables;
/// Simple Service Discovery Protocol ([SSDP](https://en.wikipedia.org/wiki/Simple_Service_Discovery_Protocol)) implementation
pub mod ssdp;
pub mod templates;
pub mod urn;

pub use service_variables::{DataType, Range, StateVariable};

/// Useful utility functions for [Reader](quick_xml::Reader)
pub trait XmlReaderExt<'a> {
    fn read_event_err_eof(&mut self) -> anyhow::Result<quick_xml::events::Event<'a>>;
    fn read_to_start(&mut self) -> anyhow::Result<quick_xml::events::BytesStart<'a>>;
    fn read_to_start_or_empty(
        &mut self,
    ) -> anyhow::Result<(bool, quick_xml::events::BytesStart<'a>)>;
    fn read_end(&mut self) -> anyhow::Result<quick_xml::events::BytesEnd<'a>>;
}

impl<'a> XmlReaderExt<'a> for quick_xml::Reader<&'a [u8]> {
    fn read_event_err_eof(&mut self) -> anyhow::Result<quick_xml::events::Event<'a>> {
        let event = self.read_event()?;
        match event {
            quick_xml::events::Event::Eof => Err(anyhow::anyhow!("early eof")),
            _ => Ok(event),
        }
    }
    fn read_to_start(&mut self) -> anyhow::Result<quick_xml::events::BytesStart<'a>> {
        loop {
            let event = self.read_event_err_eof()?.into_owned();
            if let quick_xml::events::Event::Start(e) = event {
                break Ok(e);
            }
        }
    }
    fn read_to_start_or_empty(
        &mut self,
    ) -> anyhow::Result<(bool, quick_xml::events::BytesStart<'a>)> {
        loop {
            let event = self.read_event_err_eof()?.into_owned();
            match event {
                quick_xml::events::Event::Start(e) => break Ok((false, e)),
                quick_xml::events::Event::Empty(e) => break Ok((true, e)),
                _ => (),
            }
        }
    }
    fn read_end(&mut self) -> anyhow::Result<quick_xml::events::BytesEnd<'a>> {
        let event = self.read_event()?;
        match event {
            quick_xml::events::Event::End(e) => Ok(e),
            e => anyhow::bail!("expected end, got {:?}", e),
        }
    }
}

pub type XmlWriter = quick_xml::Writer<Vec<u8>>;

/// Allows structs to serialize themselves into xml fragments
pub trait IntoXml {
    fn write_xml(&self, w: &mut XmlWriter) -> quick_xml::Result<()>;

    fn into_string(&self) -> quick_xml::Result<String> {
        let mut w = quick_xml::Writer::new(Vec::new());
        self.write_xml(&mut w)?;
        Ok(String::from_utf8(w.into_inner()).expect("produced value to be utf-8"))
    }
}

/// Allows structs to deserialize themselves from xml reader
pub trait FromXml<'a> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self>
    where
        Self: Sized;
}

impl<T: IntoXml> IntoXml for Vec<T> {
    fn write_xml(&self, w: &mut XmlWriter) -> quick_xml::Result<()> {
        for el in self {
            el.write_xml(w)?;
        }
        Ok(())
    }
}

/// Internal error taxonomy shared by the whole stack. Protocol visible errors
/// (SOAP faults, HTTP statuses) are authored separately in [action] and [router].
#[derive(Debug)]
pub enum UpnpError {
    /// Malformed XML, SCPD or description document. Unrecoverable for the
    /// affected request.
    InvalidSyntax(anyhow::Error),
    /// Uuid, service, action, argument or subscriber lookup failed
    NotFound(&'static str),
    /// Start/stop called in the wrong phase or the component is shutting down
    InvalidState(&'static str),
    Timeout,
    /// Value failed state variable validation
    InvalidParameters(String),
    /// Optional operation not overridden by a profile
    NotImplemented,
}

impl std::fmt::Display for UpnpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpnpError::InvalidSyntax(e) => write!(f, "invalid syntax: {e}"),
            UpnpError::NotFound(what) => write!(f, "not found: {what}"),
            UpnpError::InvalidState(what) => write!(f, "invalid state: {what}"),
            UpnpError::Timeout => write!(f, "timed out"),
            UpnpError::InvalidParameters(what) => write!(f, "invalid parameters: {what}"),
            UpnpError::NotImplemented => write!(f, "not implemented"),
        }
    }
}

impl std::error::Error for UpnpError {}

impl From<anyhow::Error> for UpnpError {
    fn from(err: anyhow::Error) -> Self {
        Self::InvalidSyntax(err)
    }
}
