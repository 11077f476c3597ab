use anyhow::Context;
use quick_xml::events::{BytesDecl, BytesStart, Event};

use crate::{
    action::{ActionDesc, ArgumentDesc},
    service_variables::StateVariable,
    FromXml, IntoXml, XmlReaderExt,
};

use super::SpecVersion;

pub const SCPD_NS: &str = "urn:schemas-upnp-org:service-1-0";

/// Service Control Protocol Description: the typed schema of a service.
/// State variables are populated before actions because arguments reference
/// them by name.
#[derive(Debug, Clone)]
pub struct Scpd {
    pub spec_version: SpecVersion,
    pub state_variables: Vec<StateVariable>,
    pub actions: Vec<ActionDesc>,
}

impl Scpd {
    pub fn new() -> Self {
        Self {
            spec_version: SpecVersion::upnp_v1(),
            state_variables: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_state_variable(mut self, variable: StateVariable) -> Self {
        self.state_variables.push(variable);
        self
    }

    pub fn with_action(mut self, action: ActionDesc) -> Self {
        self.actions.push(action);
        self
    }

    pub fn find_action(&self, name: &str) -> Option<&ActionDesc> {
        self.actions
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub fn find_state_variable(&self, name: &str) -> Option<&StateVariable> {
        self.state_variables
            .iter()
            .find(|v| v.name().eq_ignore_ascii_case(name))
    }

    pub(crate) fn find_state_variable_mut(&mut self, name: &str) -> Option<&mut StateVariable> {
        self.state_variables
            .iter_mut()
            .find(|v| v.name().eq_ignore_ascii_case(name))
    }

    /// Checks the rules a well formed schema must satisfy: every argument
    /// resolves to a declared state variable and an action carries at most
    /// one return value.
    fn verify(&self) -> anyhow::Result<()> {
        for action in &self.actions {
            for argument in &action.arguments {
                anyhow::ensure!(
                    self.find_state_variable(&argument.related_state_variable)
                        .is_some(),
                    "argument {} of action {} references unknown state variable {}",
                    argument.name,
                    action.name,
                    argument.related_state_variable,
                );
            }
            let retvals = action.arguments.iter().filter(|a| a.retval).count();
            anyhow::ensure!(
                retvals <= 1,
                "action {} has {retvals} return values",
                action.name
            );
        }
        Ok(())
    }

    pub fn into_xml(&self) -> anyhow::Result<String> {
        let mut w = quick_xml::Writer::new(Vec::new());
        w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let parent = BytesStart::new("scpd").with_attributes([("xmlns", SCPD_NS)]);
        let parent_end = parent.to_end().into_owned();
        w.write_event(Event::Start(parent))?;

        self.spec_version.write_xml(&mut w)?;

        let action_list = BytesStart::new("actionList");
        w.write_event(Event::Start(action_list.clone()))?;
        for action in &self.actions {
            action.write_xml(&mut w)?;
        }
        w.write_event(Event::End(action_list.to_end()))?;

        let service_state_table = BytesStart::new("serviceStateTable");
        w.write_event(Event::Start(service_state_table.clone()))?;
        for variable in &self.state_variables {
            variable.write_xml(&mut w)?;
        }
        w.write_event(Event::End(service_state_table.to_end()))?;

        w.write_event(Event::End(parent_end))?;
        Ok(String::from_utf8(w.into_inner())?)
    }
}

impl Default for Scpd {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> FromXml<'a> for Scpd {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let root = r.read_to_start()?;
        anyhow::ensure!(
            root.local_name().as_ref() == b"scpd",
            "expected scpd root tag"
        );

        let mut spec_version = None;
        let mut state_variables = Vec::new();
        let mut actions = Vec::new();

        loop {
            match r.read_event_err_eof()? {
                Event::Start(start) => {
                    let end = start.name().to_owned();
                    match start.local_name().as_ref() {
                        b"specVersion" => {
                            spec_version = Some(SpecVersion::read_xml_body(r)?);
                        }
                        b"actionList" => loop {
                            match r.read_event_err_eof()? {
                                Event::Start(start) => {
                                    anyhow::ensure!(start.local_name().as_ref() == b"action");
                                    actions.push(read_action(r)?);
                                }
                                Event::End(end) => {
                                    anyhow::ensure!(end.local_name().as_ref() == b"actionList");
                                    break;
                                }
                                Event::Text(_) => {}
                                e => anyhow::bail!("expected action or list end, got {:?}", e),
                            }
                        },
                        b"serviceStateTable" => loop {
                            match r.read_event_err_eof()? {
                                Event::Start(start) => {
                                    anyhow::ensure!(
                                        start.local_name().as_ref() == b"stateVariable"
                                    );
                                    let send_events = state_variable_send_events(&start)?;
                                    state_variables
                                        .push(StateVariable::read_xml_body(send_events, r)?);
                                }
                                Event::End(end) => {
                                    anyhow::ensure!(
                                        end.local_name().as_ref() == b"serviceStateTable"
                                    );
                                    break;
                                }
                                Event::Text(_) => {}
                                e => anyhow::bail!(
                                    "expected stateVariable or table end, got {:?}",
                                    e
                                ),
                            }
                        },
                        _ => {
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"scpd");
                    break;
                }
                _ => {}
            }
        }

        let scpd = Self {
            spec_version: spec_version.unwrap_or(SpecVersion::upnp_v1()),
            state_variables,
            actions,
        };
        scpd.verify()?;
        Ok(scpd)
    }
}

fn state_variable_send_events(start: &BytesStart<'_>) -> anyhow::Result<bool> {
    for attr in start.attributes().flatten() {
        if attr.key.local_name().as_ref() == b"sendEvents" {
            return match attr.unescape_value()?.as_ref() {
                "yes" => Ok(true),
                "no" => Ok(false),
                other => Err(anyhow::anyhow!("unexpected sendEvents value: {other}")),
            };
        }
    }
    // sendEvents defaults to yes per the device architecture
    Ok(true)
}

fn read_action(r: &mut quick_xml::Reader<&[u8]>) -> anyhow::Result<ActionDesc> {
    let mut name = None;
    let mut arguments = Vec::new();

    loop {
        match r.read_event_err_eof()? {
            Event::Start(start) => {
                let end = start.name().to_owned();
                match start.local_name().as_ref() {
                    b"name" => name = Some(r.read_text(end)?.trim().to_string()),
                    b"argumentList" => loop {
                        match r.read_event_err_eof()? {
                            Event::Start(start) => {
                                anyhow::ensure!(start.local_name().as_ref() == b"argument");
                                arguments.push(read_argument(r)?);
                            }
                            Event::End(end) => {
                                anyhow::ensure!(end.local_name().as_ref() == b"argumentList");
                                break;
                            }
                            Event::Text(_) => {}
                            e => anyhow::bail!("expected argument or list end, got {:?}", e),
                        }
                    },
                    _ => {
                        r.read_to_end(end)?;
                    }
                }
            }
            Event::End(end) => {
                anyhow::ensure!(end.local_name().as_ref() == b"action");
                break;
            }
            _ => {}
        }
    }

    Ok(ActionDesc {
        name: name.context("action name")?,
        arguments,
    })
}

fn read_argument(r: &mut quick_xml::Reader<&[u8]>) -> anyhow::Result<ArgumentDesc> {
    let mut name = None;
    let mut direction = None;
    let mut related_state_variable = None;
    let mut retval = false;

    loop {
        match r.read_event_err_eof()? {
            Event::Start(start) => {
                let end = start.name().to_owned();
                match start.local_name().as_ref() {
                    b"name" => name = Some(r.read_text(end)?.trim().to_string()),
                    b"direction" => direction = Some(r.read_text(end)?.trim().parse()?),
                    b"relatedStateVariable" => {
                        related_state_variable = Some(r.read_text(end)?.trim().to_string())
                    }
                    b"retval" => {
                        retval = true;
                        r.read_to_end(end)?;
                    }
                    _ => {
                        r.read_to_end(end)?;
                    }
                }
            }
            Event::Empty(start) => {
                if start.local_name().as_ref() == b"retval" {
                    retval = true;
                }
            }
            Event::End(end) => {
                anyhow::ensure!(end.local_name().as_ref() == b"argument");
                break;
            }
            _ => {}
        }
    }

    Ok(ArgumentDesc {
        name: name.context("argument name")?,
        direction: direction.context("argument direction")?,
        related_state_variable: related_state_variable.context("related state variable")?,
        retval,
    })
}

#[cfg(test)]
mod tests {
    use crate::{
        action::{ActionDesc, ArgumentDesc, ArgumentDirection},
        service_variables::{DataType, StateVariable},
        FromXml,
    };

    use super::Scpd;

    fn content_directory_stub() -> Scpd {
        Scpd::new()
            .with_state_variable(
                StateVariable::new("SystemUpdateID", DataType::Ui4)
                    .with_send_events(true)
                    .with_default("0"),
            )
            .with_state_variable(StateVariable::new("A_ARG_TYPE_ObjectID", DataType::String))
            .with_state_variable(StateVariable::new("A_ARG_TYPE_Result", DataType::String))
            .with_action(ActionDesc {
                name: "Browse".to_string(),
                arguments: vec![
                    ArgumentDesc {
                        name: "ObjectID".to_string(),
                        direction: ArgumentDirection::In,
                        related_state_variable: "A_ARG_TYPE_ObjectID".to_string(),
                        retval: false,
                    },
                    ArgumentDesc {
                        name: "Result".to_string(),
                        direction: ArgumentDirection::Out,
                        related_state_variable: "A_ARG_TYPE_Result".to_string(),
                        retval: true,
                    },
                ],
            })
    }

    #[test]
    fn emit_parse_roundtrip() {
        let scpd = content_directory_stub();
        let xml = scpd.into_xml().unwrap();
        let parsed = Scpd::read_xml(&mut quick_xml::Reader::from_str(&xml)).unwrap();

        assert_eq!(parsed.actions, scpd.actions);
        assert_eq!(parsed.state_variables.len(), scpd.state_variables.len());
        for (a, b) in parsed.state_variables.iter().zip(&scpd.state_variables) {
            assert_eq!(a.name(), b.name());
            assert_eq!(a.data_type(), b.data_type());
            assert_eq!(a.sends_events(), b.sends_events());
            assert_eq!(a.default_value(), b.default_value());
            assert_eq!(a.allowed_values(), b.allowed_values());
            assert_eq!(a.allowed_range(), b.allowed_range());
        }
        assert_eq!(parsed.spec_version.major, 1);
        assert_eq!(parsed.spec_version.minor, 0);
    }

    #[test]
    fn rejects_unknown_related_state_variable() {
        let raw = r#"<?xml version="1.0"?>
<scpd xmlns="urn:schemas-upnp-org:service-1-0">
<specVersion><major>1</major><minor>0</minor></specVersion>
<actionList>
<action><name>Browse</name><argumentList>
<argument><name>ObjectID</name><direction>in</direction><relatedStateVariable>Missing</relatedStateVariable></argument>
</argumentList></action>
</actionList>
<serviceStateTable>
<stateVariable sendEvents="no"><name>A_ARG_TYPE_ObjectID</name><dataType>string</dataType></stateVariable>
</serviceStateTable>
</scpd>"#;
        assert!(Scpd::read_xml(&mut quick_xml::Reader::from_str(raw)).is_err());
    }

    #[test]
    fn rejects_multiple_return_values() {
        let raw = r#"<?xml version="1.0"?>
<scpd xmlns="urn:schemas-upnp-org:service-1-0">
<actionList>
<action><name>Browse</name><argumentList>
<argument><name>A</name><direction>out</direction><retval/><relatedStateVariable>V</relatedStateVariable></argument>
<argument><name>B</name><direction>out</direction><retval/><relatedStateVariable>V</relatedStateVariable></argument>
</argumentList></action>
</actionList>
<serviceStateTable>
<stateVariable sendEvents="no"><name>V</name><dataType>string</dataType></stateVariable>
</serviceStateTable>
</scpd>"#;
        assert!(Scpd::read_xml(&mut quick_xml::Reader::from_str(raw)).is_err());
    }

    #[test]
    fn rejects_wrong_root_tag() {
        let raw = r#"<root xmlns="urn:schemas-upnp-org:device-1-0"></root>"#;
        assert!(Scpd::read_xml(&mut quick_xml::Reader::from_str(raw)).is_err());
    }

    #[test]
    fn state_variable_without_data_type_is_invalid() {
        let raw = r#"<scpd xmlns="urn:schemas-upnp-org:service-1-0">
<serviceStateTable>
<stateVariable sendEvents="no"><name>Broken</name></stateVariable>
</serviceStateTable>
</scpd>"#;
        assert!(Scpd::read_xml(&mut quick_xml::Reader::from_str(raw)).is_err());
    }

    #[test]
    fn case_insensitive_lookups() {
        let scpd = content_directory_stub();
        assert!(scpd.find_action("browse").is_some());
        assert!(scpd.find_state_variable("systemupdateid").is_some());
        assert!(scpd.find_action("Search").is_none());
    }
}
