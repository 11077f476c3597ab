use core::str;
use std::time::{Duration, Instant};

use anyhow::Context;
use quick_xml::events::{BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};

use crate::{IntoXml, UpnpError, XmlReaderExt, XmlWriter};

/// Lexical UPnP data type of a state variable
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum DataType {
    Ui1,
    Ui2,
    Ui4,
    Ui8,
    I1,
    I2,
    I4,
    I8,
    Int,
    R4,
    R8,
    Number,
    Float,
    Fixed14_4,
    Char,
    #[default]
    String,
    Date,
    DateTime,
    DateTimeTz,
    Time,
    TimeTz,
    Boolean,
    BinBase64,
    BinHex,
    Uri,
    Uuid,
}

impl DataType {
    /// Full span of the declared integer type. Used as the allowed value
    /// range when the SCPD does not carry an explicit one.
    pub fn integer_span(&self) -> Option<(i64, i64)> {
        match self {
            DataType::Ui1 => Some((0, u8::MAX as i64)),
            DataType::Ui2 => Some((0, u16::MAX as i64)),
            DataType::Ui4 => Some((0, u32::MAX as i64)),
            DataType::I1 => Some((i8::MIN as i64, i8::MAX as i64)),
            DataType::I2 => Some((i16::MIN as i64, i16::MAX as i64)),
            DataType::I4 | DataType::Int => Some((i32::MIN as i64, i32::MAX as i64)),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Ui1 => "ui1",
            DataType::Ui2 => "ui2",
            DataType::Ui4 => "ui4",
            DataType::Ui8 => "ui8",
            DataType::I1 => "i1",
            DataType::I2 => "i2",
            DataType::I4 => "i4",
            DataType::I8 => "i8",
            DataType::Int => "int",
            DataType::R4 => "r4",
            DataType::R8 => "r8",
            DataType::Number => "number",
            DataType::Float => "float",
            DataType::Fixed14_4 => "fixed.14.4",
            DataType::Char => "char",
            DataType::String => "string",
            DataType::Date => "date",
            DataType::DateTime => "dateTime",
            DataType::DateTimeTz => "dateTime.tz",
            DataType::Time => "time",
            DataType::TimeTz => "time.tz",
            DataType::Boolean => "boolean",
            DataType::BinBase64 => "bin.base64",
            DataType::BinHex => "bin.hex",
            DataType::Uri => "uri",
            DataType::Uuid => "uuid",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for DataType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ui1" => Ok(DataType::Ui1),
            "ui2" => Ok(DataType::Ui2),
            "ui4" => Ok(DataType::Ui4),
            "ui8" => Ok(DataType::Ui8),
            "i1" => Ok(DataType::I1),
            "i2" => Ok(DataType::I2),
            "i4" => Ok(DataType::I4),
            "i8" => Ok(DataType::I8),
            "int" => Ok(DataType::Int),
            "r4" => Ok(DataType::R4),
            "r8" => Ok(DataType::R8),
            "number" => Ok(DataType::Number),
            "float" => Ok(DataType::Float),
            "fixed.14.4" => Ok(DataType::Fixed14_4),
            "char" => Ok(DataType::Char),
            "string" => Ok(DataType::String),
            "date" => Ok(DataType::Date),
            "dateTime" => Ok(DataType::DateTime),
            "dateTime.tz" => Ok(DataType::DateTimeTz),
            "time" => Ok(DataType::Time),
            "time.tz" => Ok(DataType::TimeTz),
            "boolean" => Ok(DataType::Boolean),
            "bin.base64" => Ok(DataType::BinBase64),
            "bin.hex" => Ok(DataType::BinHex),
            "uri" => Ok(DataType::Uri),
            "uuid" => Ok(DataType::Uuid),
            data_type => Err(anyhow::anyhow!("unrecognized data type: {data_type}")),
        }
    }
}

/// Allowed value range of a numeric state variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub min: i64,
    pub max: i64,
    pub step: Option<i64>,
}

impl IntoXml for Range {
    fn write_xml(&self, w: &mut XmlWriter) -> quick_xml::Result<()> {
        let parent = BytesStart::new("allowedValueRange");
        w.write_event(Event::Start(parent.clone()))?;
        w.create_element("minimum")
            .write_text_content(BytesText::new(&self.min.to_string()))?;
        w.create_element("maximum")
            .write_text_content(BytesText::new(&self.max.to_string()))?;
        if let Some(step) = self.step {
            w.create_element("step")
                .write_text_content(BytesText::new(&step.to_string()))?;
        }
        w.write_event(Event::End(parent.to_end()))
    }
}

impl Range {
    fn read_xml(r: &mut quick_xml::Reader<&[u8]>) -> anyhow::Result<Self> {
        let mut min = None;
        let mut max = None;
        let mut step = None;
        loop {
            match r.read_event_err_eof()? {
                Event::Start(start) => {
                    let end = start.name().to_owned();
                    match start.local_name().as_ref() {
                        b"minimum" => min = Some(r.read_text(end)?.trim().parse()?),
                        b"maximum" => max = Some(r.read_text(end)?.trim().parse()?),
                        b"step" => step = Some(r.read_text(end)?.trim().parse()?),
                        _ => {
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"allowedValueRange");
                    break;
                }
                _ => {}
            }
        }
        Ok(Self {
            min: min.context("range minimum")?,
            max: max.context("range maximum")?,
            step,
        })
    }
}

/// Runtime state variable of a service. Values are kept string encoded the
/// way they travel on the wire; validation happens against the declared data
/// type, allowed value list and range.
#[derive(Debug, Clone)]
pub struct StateVariable {
    name: String,
    data_type: DataType,
    default_value: Option<String>,
    value: String,
    send_events: bool,
    /// True iff the variable participates in a `LastChange` aggregator
    send_events_indirectly: bool,
    allowed_values: Option<Vec<String>>,
    allowed_range: Option<Range>,
    /// Minimum wall clock interval between notifications
    rate: Option<Duration>,
    last_event: Option<Instant>,
    pending_publish: bool,
    /// Extra serialization attributes, e.g. `channel="Master"` for volume
    extra_attributes: Vec<(String, String)>,
}

impl StateVariable {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            default_value: None,
            value: String::new(),
            send_events: false,
            send_events_indirectly: false,
            allowed_values: None,
            allowed_range: None,
            rate: None,
            last_event: None,
            pending_publish: false,
            extra_attributes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn default_value(&self) -> Option<&str> {
        self.default_value.as_deref()
    }

    pub fn sends_events(&self) -> bool {
        self.send_events
    }

    pub fn sends_events_indirectly(&self) -> bool {
        self.send_events_indirectly
    }

    /// Eventing through either path
    pub fn is_sendable(&self) -> bool {
        self.send_events || self.send_events_indirectly
    }

    pub fn allowed_values(&self) -> Option<&[String]> {
        self.allowed_values.as_deref()
    }

    pub fn allowed_range(&self) -> Option<Range> {
        self.allowed_range
    }

    pub fn extra_attributes(&self) -> &[(String, String)] {
        &self.extra_attributes
    }

    pub fn with_send_events(mut self, send_events: bool) -> Self {
        self.send_events = send_events;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        let default = default.into();
        self.value = default.clone();
        self.default_value = Some(default);
        self
    }

    pub fn with_allowed_values(mut self, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allowed_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_range(mut self, range: Range) -> Self {
        self.allowed_range = Some(range);
        self
    }

    pub(crate) fn set_send_events_indirectly(&mut self, indirectly: bool) {
        self.send_events_indirectly = indirectly;
    }

    pub(crate) fn set_rate(&mut self, rate: Option<Duration>) {
        self.rate = rate;
    }

    pub(crate) fn set_extra_attribute(&mut self, name: &str, value: &str) {
        match self.extra_attributes.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value.to_string(),
            None => self
                .extra_attributes
                .push((name.to_string(), value.to_string())),
        }
    }

    /// Checks `value` against the allowed value list or the numeric range.
    /// For string lists a comma separated value is accepted when every member
    /// is allowed (case insensitive).
    pub fn validate_value(&self, value: &str) -> Result<(), UpnpError> {
        if let Some(allowed) = &self.allowed_values {
            let all_allowed = value.split(',').all(|token| {
                let token = token.trim();
                allowed.iter().any(|a| a.eq_ignore_ascii_case(token))
            });
            if !all_allowed {
                return Err(UpnpError::InvalidParameters(format!(
                    "{value:?} is not in the allowed value list of {}",
                    self.name
                )));
            }
            return Ok(());
        }
        if let Some((span_min, span_max)) = self.data_type.integer_span() {
            let num: i64 = value.trim().parse().map_err(|_| {
                UpnpError::InvalidParameters(format!(
                    "{value:?} is not a valid {} value",
                    self.data_type
                ))
            })?;
            let (min, max) = match self.allowed_range {
                Some(range) => (range.min, range.max),
                None => (span_min, span_max),
            };
            if num < min || num > max {
                return Err(UpnpError::InvalidParameters(format!(
                    "{num} is out of range [{min}, {max}] of {}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Validates and stores the value. Returns whether the stored value changed.
    pub(crate) fn set_value(&mut self, value: &str) -> Result<bool, UpnpError> {
        self.validate_value(value)?;
        if self.value == value {
            return Ok(false);
        }
        self.value = value.to_string();
        Ok(true)
    }

    /// Stores a value bypassing validation. Used by the `LastChange`
    /// aggregator whose value is a generated XML document.
    pub(crate) fn set_value_unchecked(&mut self, value: String) {
        self.value = value;
    }

    pub(crate) fn mark_pending(&mut self) {
        self.pending_publish = true;
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending_publish = false;
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending_publish
    }

    /// The moderation rate permits publishing when the last notification is
    /// at least `rate` ago
    pub(crate) fn ready_to_publish(&self, now: Instant) -> bool {
        if !self.pending_publish {
            return false;
        }
        match (self.rate, self.last_event) {
            (Some(rate), Some(last)) => last + rate <= now,
            _ => true,
        }
    }

    pub(crate) fn mark_published(&mut self, now: Instant) {
        self.pending_publish = false;
        self.last_event = Some(now);
    }

    /// Parses the body of a `<stateVariable>` element. The caller has already
    /// consumed the start tag and extracted its `sendEvents` attribute.
    pub(crate) fn read_xml_body(
        send_events: bool,
        r: &mut quick_xml::Reader<&[u8]>,
    ) -> anyhow::Result<Self> {
        let mut name = None;
        let mut data_type = None;
        let mut default_value = None;
        let mut allowed_values: Option<Vec<String>> = None;
        let mut allowed_range = None;

        loop {
            match r.read_event_err_eof()? {
                Event::Start(start) => {
                    let end = start.name().to_owned();
                    match start.local_name().as_ref() {
                        b"name" => name = Some(r.read_text(end)?.trim().to_string()),
                        b"dataType" => data_type = Some(r.read_text(end)?.trim().parse()?),
                        b"defaultValue" => {
                            default_value = Some(r.read_text(end)?.to_string());
                        }
                        b"allowedValueList" => {
                            let mut values = Vec::new();
                            loop {
                                match r.read_event_err_eof()? {
                                    Event::Start(start) => {
                                        anyhow::ensure!(
                                            start.local_name().as_ref() == b"allowedValue"
                                        );
                                        values.push(r.read_text(start.name())?.to_string());
                                    }
                                    Event::End(end) => {
                                        anyhow::ensure!(
                                            end.local_name().as_ref() == b"allowedValueList"
                                        );
                                        break;
                                    }
                                    Event::Text(_) => {}
                                    e => anyhow::bail!(
                                        "expected allowedValue or list end, got {:?}",
                                        e
                                    ),
                                }
                            }
                            allowed_values = Some(values);
                        }
                        b"allowedValueRange" => {
                            allowed_range = Some(Range::read_xml(r)?);
                        }
                        _ => {
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"stateVariable");
                    break;
                }
                _ => {}
            }
        }

        let name = name.context("state variable name")?;
        let data_type = data_type.context("state variable data type")?;

        let mut variable = StateVariable::new(name, data_type).with_send_events(send_events);
        if let Some(default) = default_value {
            variable = variable.with_default(default);
        }
        variable.allowed_values = allowed_values;
        variable.allowed_range = allowed_range;
        Ok(variable)
    }
}

impl IntoXml for StateVariable {
    fn write_xml(&self, w: &mut XmlWriter) -> quick_xml::Result<()> {
        let send_events = match self.send_events {
            true => "yes",
            false => "no",
        };
        let parent =
            BytesStart::new("stateVariable").with_attributes([("sendEvents", send_events)]);
        w.write_event(Event::Start(parent.clone()))?;
        w.create_element("name")
            .write_text_content(BytesText::new(&self.name))?;
        w.create_element("dataType")
            .write_text_content(BytesText::new(&self.data_type.to_string()))?;
        if let Some(default_value) = &self.default_value {
            w.create_element("defaultValue")
                .write_text_content(BytesText::new(default_value))?;
        }
        if let Some(allowed_values) = &self.allowed_values {
            w.create_element("allowedValueList")
                .write_inner_content(|w| {
                    for val in allowed_values {
                        w.create_element("allowedValue")
                            .write_text_content(BytesText::new(val))?;
                    }
                    Ok::<(), quick_xml::Error>(())
                })?;
        };
        if let Some(range) = self.allowed_range {
            range.write_xml(w)?;
        }
        w.write_event(Event::End(parent.to_end()))
    }
}

#[cfg(test)]
mod tests {
    use super::{DataType, Range, StateVariable};

    #[test]
    fn allowed_list_accepts_comma_separated_subsets() {
        let var = StateVariable::new("CurrentPlayMode", DataType::String)
            .with_allowed_values(["NORMAL", "REPEAT_ALL", "SHUFFLE"]);
        assert!(var.validate_value("NORMAL").is_ok());
        assert!(var.validate_value("normal,shuffle").is_ok());
        assert!(var.validate_value("NORMAL,REPEAT_ONE").is_err());
        assert!(var.validate_value("DIRECT_1").is_err());
    }

    #[test]
    fn range_validation() {
        let var = StateVariable::new("Volume", DataType::Ui2).with_range(Range {
            min: 0,
            max: 100,
            step: Some(1),
        });
        assert!(var.validate_value("0").is_ok());
        assert!(var.validate_value("100").is_ok());
        assert!(var.validate_value("101").is_err());
        assert!(var.validate_value("-1").is_err());
        assert!(var.validate_value("loud").is_err());
    }

    #[test]
    fn range_defaults_to_full_type_span() {
        let var = StateVariable::new("Brightness", DataType::Ui1);
        assert!(var.validate_value("255").is_ok());
        assert!(var.validate_value("256").is_err());

        let var = StateVariable::new("Offset", DataType::I2);
        assert!(var.validate_value("-32768").is_ok());
        assert!(var.validate_value("-32769").is_err());
    }

    #[test]
    fn unchanged_value_is_not_a_change() {
        let mut var = StateVariable::new("SystemUpdateID", DataType::Ui4).with_default("0");
        assert!(!var.set_value("0").unwrap());
        assert!(var.set_value("7").unwrap());
        assert!(!var.set_value("7").unwrap());
    }

    #[test]
    fn lexical_data_type_names() {
        for name in ["ui4", "fixed.14.4", "dateTime.tz", "bin.base64", "time.tz"] {
            let parsed: DataType = name.parse().unwrap();
            assert_eq!(parsed.to_string(), name);
        }
    }
}
