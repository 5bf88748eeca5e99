//! Protocol catalogue: `Protocol` → `Interface` → {`Request`, `Event`, `Enum`},
//! built by parsing Wayland protocol XML into immutable, cross-referenced
//! data.

mod parser;

use std::collections::HashMap;
use std::rc::Rc;

pub use parser::CatalogueError;

use crate::wire::ArgumentType;

/// One argument of a request or event, as declared in the XML.
#[derive(Debug, Clone)]
pub struct Arg {
    pub name: String,
    pub ty: ArgumentType,
    /// For `new_id` args with a statically known target, the interface name
    /// (resolved to an `Rc<Interface>` once the owning `Interface` is built).
    pub interface: Option<String>,
    pub summary: Option<String>,
}

/// A single client → server message.
#[derive(Debug)]
pub struct Request {
    pub name: String,
    pub opcode: u16,
    pub since: u32,
    pub is_destructor: bool,
    pub args: Vec<Arg>,
    /// Set when exactly one arg is a fixed-interface `new_id`: the name of
    /// the interface the request constructs.
    pub creates: Option<String>,
}

/// A single server → client message.
#[derive(Debug)]
pub struct Event {
    pub name: String,
    pub opcode: u16,
    pub since: u32,
    pub args: Vec<Arg>,
}

/// A named integer enumeration with bidirectional lookup.
#[derive(Debug)]
pub struct Enum {
    pub name: String,
    by_name: HashMap<String, i64>,
    by_value: HashMap<i64, String>,
}

impl Enum {
    fn new(name: String) -> Self {
        Enum { name, by_name: HashMap::new(), by_value: HashMap::new() }
    }

    fn insert(&mut self, entry_name: String, value: i64) {
        self.by_name.insert(entry_name.clone(), value);
        self.by_value.entry(value).or_insert(entry_name);
    }

    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.by_value.get(&value).map(String::as_str)
    }
}

/// A versioned contract of requests and events.
#[derive(Debug)]
pub struct Interface {
    pub name: String,
    pub version: u32,
    pub requests: Vec<Request>,
    pub events: Vec<Event>,
    pub enums: HashMap<String, Enum>,
    requests_by_name: HashMap<String, usize>,
    events_by_name: HashMap<String, usize>,
}

impl Interface {
    pub fn request_by_name(&self, name: &str) -> Option<&Request> {
        self.requests_by_name.get(name).map(|&i| &self.requests[i])
    }

    pub fn event_by_opcode(&self, opcode: u16) -> Option<&Event> {
        self.events.get(opcode as usize)
    }

    pub fn event_by_name(&self, name: &str) -> Option<&Event> {
        self.events_by_name.get(name).map(|&i| &self.events[i])
    }
}

/// A named, immutable catalogue of interfaces, optionally layered on a
/// parent catalogue.
#[derive(Debug)]
pub struct Protocol {
    pub name: String,
    interfaces: HashMap<String, Rc<Interface>>,
}

impl Protocol {
    /// Parse `xml` as a standalone (parentless) protocol.
    pub fn load(xml: &str) -> Result<Protocol, CatalogueError> {
        parser::parse(xml, None)
    }

    /// Parse `xml` as a protocol layered on `parent`: the child's interface
    /// mapping starts as a copy of the parent's. A duplicate interface name
    /// fails atomically — `parent` itself is never mutated, and on error
    /// this call returns before any partial mapping is produced.
    pub fn load_child(xml: &str, parent: &Protocol) -> Result<Protocol, CatalogueError> {
        parser::parse(xml, Some(parent))
    }

    /// Parse a protocol document from any `Read` source (e.g. an open file).
    pub fn load_reader<R: std::io::Read>(reader: R) -> Result<Protocol, CatalogueError> {
        parser::load_from_reader(reader)
    }

    pub fn interface(&self, name: &str) -> Option<&Rc<Interface>> {
        self.interfaces.get(name)
    }

    pub(crate) fn interfaces(&self) -> &HashMap<String, Rc<Interface>> {
        &self.interfaces
    }
}
