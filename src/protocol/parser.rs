//! Streaming XML parser for Wayland protocol files.
//!
//! Grammar (spec.md §4.2): `<protocol name=>` containing optional
//! `<copyright>` and any number of `<interface name= version=>`; each
//! interface holds `<request>`/`<event>`/`<enum>` children, each of those
//! holding `<arg name= type= [interface=] [allow-null=]>` (and enums holding
//! `<entry name= value=>`).

use std::collections::HashMap;
use std::io::Read;
use std::rc::Rc;

use xml::reader::{EventReader, XmlEvent};

use super::{Arg, Enum, Event, Interface, Protocol, Request};
use crate::wire::ArgumentType;

/// Failure while loading a protocol XML document.
#[derive(thiserror::Error, Debug)]
pub enum CatalogueError {
    #[error("XML parse error: {0}")]
    Xml(#[from] xml::reader::Error),
    #[error("element <{element}> is missing required attribute `{attribute}`")]
    MissingAttribute { element: String, attribute: String },
    #[error("unknown argument type `{0}`")]
    UnknownArgType(String),
    #[error("interface `{0}` is already defined in the parent protocol")]
    DuplicateInterface(String),
    #[error("<{child}> outside of a <{expected_parent}>")]
    Unexpected { child: String, expected_parent: String },
    #[error("could not read protocol XML: {0}")]
    Io(#[from] std::io::Error),
}

fn attr<'a>(attrs: &'a [xml::attribute::OwnedAttribute], name: &str) -> Option<&'a str> {
    attrs.iter().find(|a| a.name.local_name == name).map(|a| a.value.as_str())
}

fn require_attr(
    attrs: &[xml::attribute::OwnedAttribute],
    element: &str,
    name: &str,
) -> Result<String, CatalogueError> {
    attr(attrs, name).map(str::to_owned).ok_or_else(|| CatalogueError::MissingAttribute {
        element: element.to_owned(),
        attribute: name.to_owned(),
    })
}

fn parse_arg_type(
    raw: &str,
    interface: Option<&str>,
    allow_null: bool,
) -> Result<ArgumentType, CatalogueError> {
    Ok(match raw {
        "int" => ArgumentType::Int,
        "uint" => ArgumentType::Uint,
        "fixed" => ArgumentType::Fixed,
        "string" => ArgumentType::Str { nullable: allow_null },
        "object" => ArgumentType::Object { nullable: allow_null },
        "new_id" => {
            if interface.is_some() {
                ArgumentType::NewId
            } else {
                ArgumentType::AnyNewId
            }
        }
        "array" => ArgumentType::Array,
        "fd" => ArgumentType::Fd,
        other => return Err(CatalogueError::UnknownArgType(other.to_owned())),
    })
}

struct RequestBuilder {
    name: String,
    since: u32,
    is_destructor: bool,
    args: Vec<Arg>,
}

struct EventBuilder {
    name: String,
    since: u32,
    args: Vec<Arg>,
}

struct EnumBuilder {
    name: String,
    entries: Vec<(String, i64)>,
}

struct InterfaceBuilder {
    name: String,
    version: u32,
    requests: Vec<RequestBuilder>,
    events: Vec<EventBuilder>,
    enums: Vec<EnumBuilder>,
}

enum Scope {
    Protocol,
    Interface(InterfaceBuilder),
    Request(InterfaceBuilder, RequestBuilder),
    Event(InterfaceBuilder, EventBuilder),
    Enum(InterfaceBuilder, EnumBuilder),
}

/// Parse `xml`, optionally layering the result on `parent`'s interface
/// mapping. On any error, `parent` is left untouched: interfaces are
/// accumulated in a local staging map and only merged into the final
/// `Protocol` once parsing succeeds in full.
pub(super) fn parse(xml: &str, parent: Option<&Protocol>) -> Result<Protocol, CatalogueError> {
    let mut reader = EventReader::new(xml.as_bytes());
    let mut protocol_name = String::new();
    let mut staged: HashMap<String, Rc<Interface>> = HashMap::new();
    let mut stack: Vec<Scope> = vec![Scope::Protocol];

    loop {
        let event = reader.next()?;
        match event {
            XmlEvent::StartElement { name, attributes, .. } => {
                let local = name.local_name.as_str();
                match (stack.last_mut().unwrap(), local) {
                    (Scope::Protocol, "protocol") => {
                        protocol_name = require_attr(&attributes, "protocol", "name")?;
                    }
                    (Scope::Protocol, "interface") => {
                        let name = require_attr(&attributes, "interface", "name")?;
                        if parent.map(|p| p.interfaces().contains_key(&name)).unwrap_or(false)
                            || staged.contains_key(&name)
                        {
                            return Err(CatalogueError::DuplicateInterface(name));
                        }
                        let version: u32 = attr(&attributes, "version")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(1);
                        stack.push(Scope::Interface(InterfaceBuilder {
                            name,
                            version,
                            requests: Vec::new(),
                            events: Vec::new(),
                            enums: Vec::new(),
                        }));
                    }
                    (Scope::Interface(iface), "request") => {
                        let name = require_attr(&attributes, "request", "name")?;
                        let since: u32 =
                            attr(&attributes, "since").and_then(|v| v.parse().ok()).unwrap_or(1);
                        let is_destructor = attr(&attributes, "type") == Some("destructor");
                        let iface = std::mem::replace(
                            iface,
                            InterfaceBuilder {
                                name: String::new(),
                                version: 0,
                                requests: Vec::new(),
                                events: Vec::new(),
                                enums: Vec::new(),
                            },
                        );
                        stack.push(Scope::Request(
                            iface,
                            RequestBuilder { name, since, is_destructor, args: Vec::new() },
                        ));
                    }
                    (Scope::Interface(iface), "event") => {
                        let name = require_attr(&attributes, "event", "name")?;
                        let since: u32 =
                            attr(&attributes, "since").and_then(|v| v.parse().ok()).unwrap_or(1);
                        let iface = std::mem::replace(
                            iface,
                            InterfaceBuilder {
                                name: String::new(),
                                version: 0,
                                requests: Vec::new(),
                                events: Vec::new(),
                                enums: Vec::new(),
                            },
                        );
                        stack.push(Scope::Event(iface, EventBuilder { name, since, args: Vec::new() }));
                    }
                    (Scope::Interface(iface), "enum") => {
                        let name = require_attr(&attributes, "enum", "name")?;
                        let iface = std::mem::replace(
                            iface,
                            InterfaceBuilder {
                                name: String::new(),
                                version: 0,
                                requests: Vec::new(),
                                events: Vec::new(),
                                enums: Vec::new(),
                            },
                        );
                        stack.push(Scope::Enum(iface, EnumBuilder { name, entries: Vec::new() }));
                    }
                    (Scope::Enum(_, eb), "entry") => {
                        let name = require_attr(&attributes, "entry", "name")?;
                        let raw_value = require_attr(&attributes, "entry", "value")?;
                        let value = parse_enum_value(&raw_value);
                        eb.entries.push((name, value));
                    }
                    (Scope::Request(_, rb), "arg") => {
                        rb.args.push(parse_arg(&attributes)?);
                    }
                    (Scope::Event(_, eb), "arg") => {
                        eb.args.push(parse_arg(&attributes)?);
                    }
                    // <description>, <copyright> and their text children are
                    // accepted and ignored: they carry no runtime semantics.
                    (_, "description") | (_, "copyright") => {}
                    (scope, other) => {
                        return Err(CatalogueError::Unexpected {
                            child: other.to_owned(),
                            expected_parent: scope_name(scope).to_owned(),
                        });
                    }
                }
            }
            XmlEvent::EndElement { name } => {
                let local = name.local_name.as_str();
                match local {
                    "request" => {
                        if let Scope::Request(mut iface, rb) = stack.pop().unwrap() {
                            iface.requests.push(rb);
                            stack.push(Scope::Interface(iface));
                        }
                    }
                    "event" => {
                        if let Scope::Event(mut iface, eb) = stack.pop().unwrap() {
                            iface.events.push(eb);
                            stack.push(Scope::Interface(iface));
                        }
                    }
                    "enum" => {
                        if let Scope::Enum(mut iface, eb) = stack.pop().unwrap() {
                            iface.enums.push(eb);
                            stack.push(Scope::Interface(iface));
                        }
                    }
                    "interface" => {
                        if let Scope::Interface(iface) = stack.pop().unwrap() {
                            let built = build_interface(iface);
                            staged.insert(built.name.clone(), Rc::new(built));
                        }
                    }
                    "protocol" => {}
                    _ => {}
                }
            }
            XmlEvent::EndDocument => break,
            _ => {}
        }
    }

    let mut interfaces = parent.map(|p| p.interfaces().clone()).unwrap_or_default();
    interfaces.extend(staged);
    Ok(Protocol { name: protocol_name, interfaces })
}

fn scope_name(scope: &Scope) -> &'static str {
    match scope {
        Scope::Protocol => "protocol",
        Scope::Interface(_) => "interface",
        Scope::Request(..) => "request",
        Scope::Event(..) => "event",
        Scope::Enum(..) => "enum",
    }
}

fn parse_enum_value(raw: &str) -> i64 {
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).unwrap_or(0)
    } else {
        raw.parse().unwrap_or(0)
    }
}

fn parse_arg(attributes: &[xml::attribute::OwnedAttribute]) -> Result<Arg, CatalogueError> {
    let name = require_attr(attributes, "arg", "name")?;
    let raw_ty = require_attr(attributes, "arg", "type")?;
    let interface = attr(attributes, "interface").map(str::to_owned);
    let allow_null = attr(attributes, "allow-null") == Some("true");
    let summary = attr(attributes, "summary").map(str::to_owned);
    let ty = parse_arg_type(&raw_ty, interface.as_deref(), allow_null)?;
    Ok(Arg { name, ty, interface, summary })
}

fn build_interface(iface: InterfaceBuilder) -> Interface {
    let mut requests = Vec::with_capacity(iface.requests.len());
    let mut requests_by_name = HashMap::new();
    for (opcode, rb) in iface.requests.into_iter().enumerate() {
        let creates = rb.args.iter().find_map(|a| {
            if matches!(a.ty, ArgumentType::NewId) {
                a.interface.clone()
            } else {
                None
            }
        });
        requests_by_name.insert(rb.name.clone(), opcode);
        requests.push(Request {
            name: rb.name,
            opcode: opcode as u16,
            since: rb.since,
            is_destructor: rb.is_destructor,
            args: rb.args,
            creates,
        });
    }

    let mut events = Vec::with_capacity(iface.events.len());
    let mut events_by_name = HashMap::new();
    for (opcode, eb) in iface.events.into_iter().enumerate() {
        events_by_name.insert(eb.name.clone(), opcode);
        events.push(Event { name: eb.name, opcode: opcode as u16, since: eb.since, args: eb.args });
    }

    let mut enums = HashMap::new();
    for eb in iface.enums {
        let mut e = Enum::new(eb.name.clone());
        for (name, value) in eb.entries {
            e.insert(name, value);
        }
        enums.insert(eb.name, e);
    }

    Interface {
        name: iface.name,
        version: iface.version,
        requests,
        events,
        enums,
        requests_by_name,
        events_by_name,
    }
}

/// Parse from anything implementing `Read`, for callers loading from a file.
pub fn load_from_reader<R: Read>(mut reader: R) -> Result<Protocol, CatalogueError> {
    let mut buf = String::new();
    reader.read_to_string(&mut buf)?;
    parse(&buf, None)
}
