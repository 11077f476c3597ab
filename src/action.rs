use core::str;
use std::{borrow::Cow, fmt::Display, str::FromStr};

use anyhow::Context;
use axum::{http::HeaderMap, response::IntoResponse};
use axum_extra::headers::{self, HeaderMapExt};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use reqwest::StatusCode;

use crate::XmlReaderExt;

use super::{urn::URN, FromXml, IntoXml, XmlWriter};

pub const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP_ENCODING: &str = "http://schemas.xmlsoap.org/soap/encoding/";
pub const UPNP_CONTROL_NS: &str = "urn:schemas-upnp-org:control-1-0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentDirection {
    In,
    Out,
}

impl FromStr for ArgumentDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            _ => Err(anyhow::anyhow!("expected in or out, got {s}")),
        }
    }
}

impl From<ArgumentDirection> for &str {
    fn from(value: ArgumentDirection) -> Self {
        match value {
            ArgumentDirection::In => "in",
            ArgumentDirection::Out => "out",
        }
    }
}

/// Declared argument of an action. Position is the index in the owning
/// action's argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentDesc {
    pub name: String,
    pub direction: ArgumentDirection,
    /// Must resolve to a state variable of the owning service
    pub related_state_variable: String,
    pub retval: bool,
}

impl ArgumentDesc {
    pub fn write_xml(&self, w: &mut XmlWriter) -> quick_xml::Result<()> {
        let parent = BytesStart::new("argument");
        w.write_event(Event::Start(parent.clone()))?;
        w.create_element("name")
            .write_text_content(BytesText::new(&self.name))?;
        w.create_element("direction")
            .write_text_content(BytesText::new(self.direction.into()))?;
        if self.retval {
            w.write_event(Event::Empty(BytesStart::new("retval")))?;
        }
        w.create_element("relatedStateVariable")
            .write_text_content(BytesText::new(&self.related_state_variable))?;
        w.write_event(Event::End(parent.to_end()))
    }
}

/// Declared action of a service with its ordered argument list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDesc {
    pub name: String,
    pub arguments: Vec<ArgumentDesc>,
}

impl ActionDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_args(&self) -> impl Iterator<Item = &ArgumentDesc> {
        self.arguments
            .iter()
            .filter(|a| a.direction == ArgumentDirection::In)
    }

    pub fn out_args(&self) -> impl Iterator<Item = &ArgumentDesc> {
        self.arguments
            .iter()
            .filter(|a| a.direction == ArgumentDirection::Out)
    }

    pub fn retval(&self) -> Option<&ArgumentDesc> {
        self.arguments.iter().find(|a| a.retval)
    }
}

impl IntoXml for ActionDesc {
    fn write_xml(&self, w: &mut XmlWriter) -> quick_xml::Result<()> {
        let parent = BytesStart::new("action");
        w.write_event(Event::Start(parent.clone()))?;

        w.create_element("name")
            .write_text_content(BytesText::new(&self.name))?;

        let argument_list = BytesStart::new("argumentList");
        w.write_event(Event::Start(argument_list.clone()))?;
        for argument in &self.arguments {
            argument.write_xml(w)?;
        }
        w.write_event(Event::End(argument_list.to_end()))?;

        w.write_event(Event::End(parent.to_end()))
    }
}

/// Soap envelope around a control payload
#[derive(Debug)]
pub struct SoapMessage<T> {
    inner: T,
}

impl<T> SoapMessage<T> {
    pub fn new(payload: T) -> Self {
        Self { inner: payload }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

fn verify_envelope(envelope: &BytesStart<'_>) -> anyhow::Result<()> {
    let mut ns_ok = false;
    let mut encoding_ok = true;
    for attr in envelope.attributes().flatten() {
        let key = attr.key;
        let value = attr.unescape_value()?;
        if key.as_ref().starts_with(b"xmlns") && value == SOAP_ENVELOPE_NS {
            ns_ok = true;
        }
        if key.local_name().as_ref() == b"encodingStyle" {
            encoding_ok = value == SOAP_ENCODING;
        }
    }
    anyhow::ensure!(ns_ok, "missing soap envelope namespace");
    anyhow::ensure!(encoding_ok, "unexpected soap encoding style");
    Ok(())
}

impl<'a, T: FromXml<'a>> SoapMessage<T> {
    /// In strict mode the envelope namespace and encoding style are checked.
    /// The relaxed mode accepts peers that omit them.
    pub fn from_xml(raw_xml: &'a [u8], strict: bool) -> anyhow::Result<Self> {
        use quick_xml::Reader;
        let mut r = Reader::from_reader(raw_xml);

        let envelope = r.read_to_start()?;
        anyhow::ensure!(envelope.local_name().as_ref() == b"Envelope");
        if strict {
            verify_envelope(&envelope)?;
        }
        let envelope = envelope.into_owned();
        let body = r.read_to_start()?.into_owned();
        anyhow::ensure!(body.local_name().as_ref() == b"Body");

        let payload = T::read_xml(&mut r)?;

        r.read_to_end(body.name())?;
        r.read_to_end(envelope.name())?;
        Ok(Self { inner: payload })
    }
}

impl<T: IntoXml> SoapMessage<T> {
    pub fn into_xml(self) -> anyhow::Result<String> {
        use quick_xml::Writer;
        let mut w = Writer::new(Vec::new());
        w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let envelope = BytesStart::new("s:Envelope")
            .with_attributes([("xmlns:s", SOAP_ENVELOPE_NS), ("s:encodingStyle", SOAP_ENCODING)]);
        let envelope_end = envelope.to_end().into_owned();
        w.write_event(Event::Start(envelope.clone()))?;

        let body = BytesStart::new("s:Body");
        let body_end = body.to_end().into_owned();
        w.write_event(Event::Start(body))?;

        self.inner.write_xml(&mut w)?;

        w.write_event(Event::End(body_end))?;
        w.write_event(Event::End(envelope_end))?;
        Ok(String::from_utf8(w.into_inner())?)
    }
}

impl<T: IntoXml> IntoResponse for SoapMessage<T> {
    fn into_response(self) -> axum::response::Response {
        let mut header_map = HeaderMap::new();
        header_map.typed_insert(headers::ContentType::xml());
        let body = self.into_xml().expect("serialization not fail");
        (header_map, body).into_response()
    }
}

/// An action invocation inside a Soap message
#[derive(Debug, Clone)]
pub struct ActionPayload<T> {
    pub name: String,
    pub arguments: Vec<T>,
}

impl<'a> FromXml<'a> for ActionPayload<InArgumentPayload<'a>> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self>
    where
        Self: Sized,
    {
        let action_name_tag = r.read_to_start()?;
        let action_name_tag_end = action_name_tag.to_end().into_owned();
        let action_name = String::from_utf8(action_name_tag.local_name().into_inner().to_vec())?;
        let mut arguments = Vec::new();

        loop {
            let next = r.read_event_err_eof()?.into_owned();
            match next {
                Event::Start(var) => {
                    let name = String::from_utf8(var.local_name().into_inner().to_vec())?;
                    let value = r.read_text(var.name())?;
                    arguments.push(InArgumentPayload {
                        name,
                        value: Cow::Owned(value.into_owned()),
                    });
                }
                Event::Empty(var) => {
                    let name = String::from_utf8(var.local_name().into_inner().to_vec())?;
                    arguments.push(InArgumentPayload {
                        name,
                        value: Cow::Borrowed(""),
                    });
                }
                Event::End(end) if end == action_name_tag_end => {
                    break;
                }
                _ => (),
            }
        }

        Ok(Self {
            name: action_name,
            arguments,
        })
    }
}

impl<T> ActionPayload<T> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
pub struct InArgumentPayload<'a> {
    pub name: String,
    pub value: Cow<'a, str>,
}

impl InArgumentPayload<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Named out argument value produced by an action handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutArgumentPayload {
    pub name: String,
    pub value: String,
}

/// Helps to produce a Soap message with an action request using a single
/// buffer. Arguments are appended in descriptor order.
pub struct WritableAction {
    w: quick_xml::Writer<Vec<u8>>,
    action_name: String,
}

impl WritableAction {
    pub fn new(action_name: &str, urn: &URN) -> quick_xml::Result<Self> {
        let mut w = quick_xml::Writer::new(Vec::new());
        w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let envelope = BytesStart::new("s:Envelope")
            .with_attributes([("xmlns:s", SOAP_ENVELOPE_NS), ("s:encodingStyle", SOAP_ENCODING)]);
        w.write_event(Event::Start(envelope))?;
        let body = BytesStart::new("s:Body");
        w.write_event(Event::Start(body))?;

        let action_name = format!("u:{action_name}");
        let urn = urn.to_string();
        let action = BytesStart::new(&action_name).with_attributes([("xmlns:u", urn.as_str())]);
        w.write_event(Event::Start(action))?;

        Ok(Self { w, action_name })
    }

    pub fn write_argument(&mut self, name: &str, value: &str) -> quick_xml::Result<()> {
        self.w
            .create_element(name)
            .write_text_content(BytesText::new(value))?;
        Ok(())
    }

    /// Writes the end of the message and returns the raw Soap request
    pub fn finish(mut self) -> anyhow::Result<String> {
        self.w
            .write_event(Event::End(BytesEnd::new(self.action_name)))?;
        self.w.write_event(Event::End(BytesEnd::new("s:Body")))?;
        self.w
            .write_event(Event::End(BytesEnd::new("s:Envelope")))?;
        Ok(String::from_utf8(self.w.into_inner())?)
    }
}

/// Action response element (`<u:NameResponse>` in the service type namespace)
#[derive(Debug)]
pub struct ActionResponse<T> {
    pub action_name: String,
    pub service_urn: URN,
    pub args: Vec<T>,
}

impl<T> ActionResponse<T> {
    /// The response element must be `<ActionName>Response` in the service
    /// type namespace; anything else is rejected even if the child elements
    /// look plausible
    pub fn verify(&self, action_name: &str, service_urn: &URN) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.action_name.eq_ignore_ascii_case(action_name),
            "expected {action_name}Response element, got {}Response",
            self.action_name,
        );
        anyhow::ensure!(
            self.service_urn
                .to_string()
                .eq_ignore_ascii_case(&service_urn.to_string()),
            "response namespace {} does not match service type {service_urn}",
            self.service_urn,
        );
        Ok(())
    }
}

impl IntoXml for ActionResponse<OutArgumentPayload> {
    fn write_xml(&self, w: &mut XmlWriter) -> quick_xml::Result<()> {
        let action = BytesStart::new(format!("u:{}Response", self.action_name))
            .with_attributes([("xmlns:u", self.service_urn.to_string().as_str())]);
        let action_end = action.to_end().into_owned();
        w.write_event(Event::Start(action))?;

        for argument in &self.args {
            w.create_element(&argument.name)
                .write_text_content(BytesText::new(&argument.value))?;
        }

        w.write_event(Event::End(action_end))
    }
}

impl<'a> ActionResponse<InArgumentPayload<'a>> {
    pub fn read_xml(
        r: &mut quick_xml::Reader<&'a [u8]>,
        urn: URN,
        action_tag_name: quick_xml::name::QName<'_>,
    ) -> anyhow::Result<Self> {
        let mut arguments = Vec::new();

        while let Ok(event) = r.read_event() {
            match event {
                Event::Start(start) => {
                    let name = String::from_utf8(start.local_name().as_ref().to_vec())?;
                    let value = r.read_text(start.name())?;
                    arguments.push(InArgumentPayload { name, value });
                }
                Event::Empty(start) => {
                    let name = String::from_utf8(start.local_name().as_ref().to_vec())?;
                    arguments.push(InArgumentPayload {
                        name,
                        value: Cow::Borrowed(""),
                    });
                }
                Event::End(end) if end.name() == action_tag_name => {
                    break;
                }
                Event::Text(_) => {}
                e => {
                    anyhow::bail!("expected action end, got {:?}", e);
                }
            }
        }

        let action_name = std::str::from_utf8(action_tag_name.into_inner())
            .context("convert action tag name to string")?;
        let action_name = action_name
            .rsplit(':')
            .next()
            .expect("rsplit yields at least one element")
            .strip_suffix("Response")
            .context("strip Response suffix")?
            .to_owned();

        Ok(Self {
            action_name,
            service_urn: urn,
            args: arguments,
        })
    }
}

impl IntoResponse for ActionResponse<OutArgumentPayload> {
    fn into_response(self) -> axum::response::Response {
        SoapMessage::new(self).into_response()
    }
}

impl<'a> FromXml<'a> for Result<ActionResponse<InArgumentPayload<'a>>, ActionError> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let start = r.read_to_start()?;
        match start.local_name().as_ref() {
            b"Fault" => Ok(Err(ActionError::read_xml(r, start.name())?)),
            other if other.ends_with(b"Response") => {
                // the namespace the element is bound to, not just any
                // urn-looking attribute
                let urn = start
                    .attributes()
                    .flatten()
                    .filter(|attr| attr.key.as_ref().starts_with(b"xmlns"))
                    .filter_map(|attr| attr.unescape_value().ok())
                    .find_map(|attr| URN::from_str(&attr).ok());
                let urn = urn.context("response element namespace is not a service urn")?;
                ActionResponse::read_xml(r, urn, start.name()).map(Ok)
            }
            e => Err(anyhow::anyhow!("expected fault or response, got {:?}", e)),
        }
    }
}

/// Wire level UPnP error codes carried in Soap faults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionErrorCode {
    /// No action by that name at this service
    InvalidAction,
    /// Not enough in args, args in the wrong order, or args of the wrong type
    InvalidArgs,
    /// Current state of the service prevents invoking the action
    ActionFailed,
    /// No such object / invalid name
    NoSuchObject,
    /// Invalid InstanceID (RenderingControl)
    InvalidInstanceId,
    /// No such connection (ConnectionManager)
    NoSuchConnection,
    /// Invalid InstanceID (AVTransport)
    InvalidTransportInstanceId,
    /// Vendor internal error
    Internal,
    Other(u16),
}

impl ActionErrorCode {
    pub fn code(&self) -> u16 {
        match self {
            ActionErrorCode::InvalidAction => 401,
            ActionErrorCode::InvalidArgs => 402,
            ActionErrorCode::ActionFailed => 501,
            ActionErrorCode::NoSuchObject => 701,
            ActionErrorCode::InvalidInstanceId => 702,
            ActionErrorCode::NoSuchConnection => 706,
            ActionErrorCode::InvalidTransportInstanceId => 718,
            ActionErrorCode::Internal => 800,
            ActionErrorCode::Other(code) => *code,
        }
    }

    pub fn default_description(&self) -> &'static str {
        match self {
            ActionErrorCode::InvalidAction => "Invalid Action",
            ActionErrorCode::InvalidArgs => "Invalid Args",
            ActionErrorCode::ActionFailed => "Action Failed",
            ActionErrorCode::NoSuchObject => "No Such Object.",
            ActionErrorCode::InvalidInstanceId => "Invalid InstanceID",
            ActionErrorCode::NoSuchConnection => "No Such Connection",
            ActionErrorCode::InvalidTransportInstanceId => "Invalid InstanceID",
            ActionErrorCode::Internal => "Internal error",
            ActionErrorCode::Other(_) => "Error",
        }
    }
}

impl From<u16> for ActionErrorCode {
    fn from(value: u16) -> Self {
        match value {
            401 => ActionErrorCode::InvalidAction,
            402 => ActionErrorCode::InvalidArgs,
            501 => ActionErrorCode::ActionFailed,
            701 => ActionErrorCode::NoSuchObject,
            702 => ActionErrorCode::InvalidInstanceId,
            706 => ActionErrorCode::NoSuchConnection,
            718 => ActionErrorCode::InvalidTransportInstanceId,
            800 => ActionErrorCode::Internal,
            _ => ActionErrorCode::Other(value),
        }
    }
}

impl From<ActionErrorCode> for ActionError {
    fn from(code: ActionErrorCode) -> Self {
        Self {
            code,
            description: None,
        }
    }
}

#[derive(Debug)]
pub struct ActionError {
    pub code: ActionErrorCode,
    pub description: Option<String>,
}

impl ActionError {
    pub fn new(code: ActionErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: Some(description.into()),
        }
    }

    pub fn error_code(&self) -> u16 {
        self.code.code()
    }

    pub fn error_description(&self) -> &str {
        self.description
            .as_deref()
            .unwrap_or_else(|| self.code.default_description())
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            code: ActionErrorCode::ActionFailed,
            description: Some(err.to_string()),
        }
    }
}

impl Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.error_description())
    }
}
impl std::error::Error for ActionError {}

impl IntoXml for ActionError {
    fn write_xml(&self, w: &mut XmlWriter) -> quick_xml::Result<()> {
        let parent = BytesStart::new("s:Fault");
        let parent_end = parent.to_end().into_owned();
        w.write_event(Event::Start(parent.clone()))?;

        w.create_element("faultcode")
            .write_text_content(BytesText::new("s:Client"))?;
        w.create_element("faultstring")
            .write_text_content(BytesText::new("UPnPError"))?;
        let detail = BytesStart::new("detail");
        let detail_end = detail.to_end().into_owned();
        w.write_event(Event::Start(detail.clone()))?;

        w.create_element("UPnPError")
            .with_attribute(("xmlns", UPNP_CONTROL_NS))
            .write_inner_content(|w| {
                w.create_element("errorCode")
                    .write_text_content(BytesText::new(&self.code.code().to_string()))?;
                w.create_element("errorDescription")
                    .write_text_content(BytesText::new(self.error_description()))?;
                Ok::<(), quick_xml::Error>(())
            })?;

        w.write_event(Event::End(detail_end))?;
        w.write_event(Event::End(parent_end))
    }
}

impl ActionError {
    fn read_xml<'a>(
        r: &mut quick_xml::Reader<&'a [u8]>,
        end_tag: quick_xml::name::QName<'_>,
    ) -> anyhow::Result<Self> {
        let fault_code = r.read_to_start()?;
        anyhow::ensure!(fault_code.local_name().as_ref() == b"faultcode");
        r.read_to_end(fault_code.name())?;
        let fault_string = r.read_to_start()?;
        anyhow::ensure!(fault_string.local_name().as_ref() == b"faultstring");
        let fault_string_text = r.read_text(fault_string.name())?;
        anyhow::ensure!(fault_string_text == "UPnPError");
        let detail = r.read_to_start()?;
        anyhow::ensure!(detail.local_name().as_ref() == b"detail");
        let upnp_error = r.read_to_start()?;
        anyhow::ensure!(matches!(
            upnp_error.local_name().as_ref(),
            b"UPnPError" | b"upnp_error"
        ));
        let error_code = r.read_to_start()?;
        anyhow::ensure!(error_code.local_name().as_ref() == b"errorCode");
        let code = r.read_text(error_code.name())?;
        let code: u16 = code.trim().parse().context("parse error code")?;
        let mut description = None;

        while let Ok(event) = r.read_event() {
            match event {
                Event::Start(start) => {
                    anyhow::ensure!(start.local_name().as_ref() == b"errorDescription");
                    description = Some(r.read_text(start.name())?.to_string());
                    r.read_to_end(upnp_error.name())?;
                    break;
                }
                Event::End(end) => {
                    anyhow::ensure!(end == upnp_error.to_end());
                    break;
                }
                Event::Text(_) => {}
                e => Err(anyhow::anyhow!(
                    "expected description or fault end, got {:?}",
                    e
                ))?,
            }
        }

        r.read_to_end(detail.name())?;
        r.read_to_end(end_tag)?;

        Ok(Self {
            code: code.into(),
            description,
        })
    }
}

impl IntoResponse for ActionError {
    fn into_response(self) -> axum::response::Response {
        let status_code = StatusCode::INTERNAL_SERVER_ERROR;
        let body = SoapMessage::new(self);
        (status_code, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{ActionError, ActionErrorCode, ActionPayload, ActionResponse, InArgumentPayload, SoapMessage};

    #[test]
    fn parse_action_payload_xml() {
        let raw = br#"<?xml version="1.0"?>
<s:Envelope
xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"
s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:Browse xmlns:u="urn:schemas-upnp-org:service:ContentDirectory:1">
<ObjectID>0</ObjectID>
<BrowseFlag>BrowseDirectChildren</BrowseFlag>
</u:Browse>
</s:Body>
</s:Envelope>"#;
        let payload: SoapMessage<ActionPayload<InArgumentPayload>> =
            SoapMessage::from_xml(raw, true).unwrap();
        let payload = payload.into_inner();
        assert_eq!(payload.name, "Browse");
        assert_eq!(payload.arguments[0].name, "ObjectID");
        assert_eq!(payload.arguments[0].value, "0");
        assert_eq!(payload.arguments[1].value, "BrowseDirectChildren");
    }

    #[test]
    fn strict_envelope_rejects_missing_namespace() {
        let raw = br#"<?xml version="1.0"?>
<Envelope><Body>
<u:Browse xmlns:u="urn:schemas-upnp-org:service:ContentDirectory:1">
<ObjectID>0</ObjectID>
</u:Browse>
</Body></Envelope>"#;
        assert!(
            SoapMessage::<ActionPayload<InArgumentPayload>>::from_xml(raw, true).is_err()
        );
        assert!(
            SoapMessage::<ActionPayload<InArgumentPayload>>::from_xml(raw, false).is_ok()
        );
    }

    #[test]
    fn parse_fault_response() {
        let raw = br#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"
s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<s:Fault>
<faultcode>s:Client</faultcode>
<faultstring>UPnPError</faultstring>
<detail>
<UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
<errorCode>701</errorCode>
<errorDescription>No Such Object.</errorDescription>
</UPnPError>
</detail>
</s:Fault>
</s:Body>
</s:Envelope>"#;
        let parsed = SoapMessage::<Result<ActionResponse<InArgumentPayload>, ActionError>>::from_xml(
            raw, true,
        )
        .unwrap();
        let err = parsed.into_inner().unwrap_err();
        assert_eq!(err.error_code(), 701);
        assert_eq!(err.code, ActionErrorCode::NoSuchObject);
        assert_eq!(err.error_description(), "No Such Object.");
    }

    #[test]
    fn parse_action_response() {
        let raw = br#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"
s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:BrowseResponse xmlns:u="urn:schemas-upnp-org:service:ContentDirectory:1">
<Result>didl</Result>
<NumberReturned>1</NumberReturned>
<TotalMatches>1</TotalMatches>
<UpdateID>0</UpdateID>
</u:BrowseResponse>
</s:Body>
</s:Envelope>"#;
        let parsed = SoapMessage::<Result<ActionResponse<InArgumentPayload>, ActionError>>::from_xml(
            raw, true,
        )
        .unwrap();
        let response = parsed.into_inner().unwrap();
        assert_eq!(response.action_name, "Browse");
        assert_eq!(response.args.len(), 4);
        assert_eq!(response.args[0].name, "Result");
        assert_eq!(response.args[0].value, "didl");
    }

    #[test]
    fn response_verification_rejects_mismatches() {
        let raw = br#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"
s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:GetVolumeResponse xmlns:u="urn:schemas-upnp-org:service:RenderingControl:1">
<Result>didl</Result>
</u:GetVolumeResponse>
</s:Body>
</s:Envelope>"#;
        let parsed = SoapMessage::<Result<ActionResponse<InArgumentPayload>, ActionError>>::from_xml(
            raw, true,
        )
        .unwrap();
        let response = parsed.into_inner().unwrap();

        let rendering_control =
            crate::urn::URN::from_str("urn:schemas-upnp-org:service:RenderingControl:1").unwrap();
        let content_directory =
            crate::urn::URN::from_str("urn:schemas-upnp-org:service:ContentDirectory:1").unwrap();
        assert!(response.verify("GetVolume", &rendering_control).is_ok());
        // a GetVolumeResponse is no answer to a Browse call
        assert!(response.verify("Browse", &rendering_control).is_err());
        // nor is one claiming the wrong service type namespace
        assert!(response.verify("GetVolume", &content_directory).is_err());
    }

    #[test]
    fn response_namespace_must_be_a_service_urn() {
        let raw = br#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"
s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<BrowseResponse other="urn:schemas-upnp-org:service:ContentDirectory:1">
<Result>didl</Result>
</BrowseResponse>
</s:Body>
</s:Envelope>"#;
        assert!(
            SoapMessage::<Result<ActionResponse<InArgumentPayload>, ActionError>>::from_xml(
                raw, true,
            )
            .is_err()
        );
    }

    #[test]
    fn fault_roundtrip() {
        let error = ActionError::from(ActionErrorCode::InvalidAction);
        let raw = SoapMessage::new(error).into_xml().unwrap();
        let parsed = SoapMessage::<Result<ActionResponse<InArgumentPayload>, ActionError>>::from_xml(
            raw.as_bytes(),
            true,
        )
        .unwrap();
        let err = parsed.into_inner().unwrap_err();
        assert_eq!(err.error_code(), 401);
        assert_eq!(err.error_description(), "Invalid Action");
    }
}
