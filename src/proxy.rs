//! The proxy model: a runtime handle to a server-side object, its request
//! invocation sequence, and its event dispatch.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use crate::connection::ConnectionHandle;
use crate::error::WireError;
use crate::protocol::Interface;
use crate::queue::Queue;
use crate::wire::Fixed;

/// A caller-supplied request argument, in declaration order. `new_id`
/// arguments carry no value from the caller — the runtime allocates the id
/// during marshalling (spec.md §4.1).
pub enum OutArg {
    Int(i32),
    Uint(u32),
    Fixed(Fixed),
    Str(Option<CString>),
    /// Object id; `None` is only legal when the declared arg allows null.
    Object(Option<u32>),
    Array(Vec<u8>),
    Fd(OwnedFd),
    /// Fixed-interface `new_id`: the runtime resolves the target interface
    /// from the request's `creates` field.
    NewId,
    /// Dynamic-interface `new_id` (e.g. `wl_registry.bind`): caller supplies
    /// the interface name and version explicitly.
    NewIdDynamic(Rc<Interface>, u32),
}

/// A resolved event argument, handed to dispatcher callbacks. Unlike the
/// wire-level `Argument`, object-carrying kinds are resolved to live
/// `Proxy` handles by the connection's decode step before the event is
/// queued.
pub enum EventArg {
    Int(i32),
    Uint(u32),
    Fixed(Fixed),
    Str(Option<CString>),
    Object(Option<Proxy>),
    NewId(Proxy),
    Array(Vec<u8>),
    Fd(OwnedFd),
}

type Handler = Box<dyn FnMut(&Proxy, Vec<EventArg>)>;

struct ObjectInner {
    id: Cell<u32>,
    interface: Rc<Interface>,
    version: Cell<u32>,
    destroyed: Cell<bool>,
    queue: RefCell<Queue>,
    dispatcher: RefCell<HashMap<String, Handler>>,
    silence: RefCell<HashSet<String>>,
}

/// A cheap, clonable reference to the bookkeeping state behind a proxy
/// (id, interface, queue, dispatcher table). Stored directly in the
/// [`Registry`](crate::registry::Registry), and held alongside a weak
/// connection back-reference by every [`Proxy`] handle.
#[derive(Clone)]
pub struct Object(Rc<ObjectInner>);

impl Object {
    pub fn new(id: u32, interface: Rc<Interface>, version: u32, queue: Queue) -> Object {
        let mut silence = HashSet::new();
        if interface.name == "wl_display" {
            // delete_id is always in the silence set by default (spec.md §3).
            silence.insert("delete_id".to_owned());
        }
        Object(Rc::new(ObjectInner {
            id: Cell::new(id),
            interface,
            version: Cell::new(version),
            destroyed: Cell::new(false),
            queue: RefCell::new(queue),
            dispatcher: RefCell::new(HashMap::new()),
            silence: RefCell::new(silence),
        }))
    }

    pub fn id(&self) -> u32 {
        self.0.id.get()
    }

    pub fn clear_id(&self) {
        self.0.id.set(0);
    }

    pub fn interface(&self) -> &Rc<Interface> {
        &self.0.interface
    }

    pub fn version(&self) -> u32 {
        self.0.version.get()
    }

    pub fn is_destroyed(&self) -> bool {
        self.0.destroyed.get()
    }

    fn mark_destroyed(&self) {
        self.0.destroyed.set(true);
    }

    pub fn queue(&self) -> Queue {
        self.0.queue.borrow().clone()
    }

    pub fn set_queue(&self, queue: Queue) {
        *self.0.queue.borrow_mut() = queue;
    }

    pub fn set_handler(&self, event_name: impl Into<String>, handler: Handler) {
        self.0.dispatcher.borrow_mut().insert(event_name.into(), handler);
    }

    pub fn set_silence(&self, event_name: impl Into<String>, silent: bool) {
        let name = event_name.into();
        if silent {
            self.0.silence.borrow_mut().insert(name);
        } else {
            self.0.silence.borrow_mut().remove(&name);
        }
    }

    /// Invoke the handler registered for `event_name`, if any. Drops the
    /// event silently if the object is destroyed, or if no handler is
    /// installed (optionally logging, unless the event is silenced).
    pub fn dispatch_event(&self, proxy: &Proxy, event_name: &str, args: Vec<EventArg>) {
        if self.is_destroyed() {
            return;
        }
        let mut dispatcher = self.0.dispatcher.borrow_mut();
        if let Some(handler) = dispatcher.get_mut(event_name) {
            handler(proxy, args);
        } else {
            drop(dispatcher);
            if !self.0.silence.borrow().contains(event_name) {
                log::debug!(
                    "{}@{} received unhandled event `{}`",
                    self.0.interface.name,
                    self.id(),
                    event_name
                );
            }
        }
    }
}

/// A client-side handle to a server-side object.
///
/// Cloning a `Proxy` is cheap and yields another handle to the same
/// underlying object; it does not create a new protocol object.
#[derive(Clone)]
pub struct Proxy {
    object: Object,
    connection: std::rc::Weak<dyn ConnectionHandle>,
}

impl Proxy {
    pub fn new(object: Object, connection: std::rc::Weak<dyn ConnectionHandle>) -> Proxy {
        Proxy { object, connection }
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    pub fn id(&self) -> u32 {
        self.object.id()
    }

    pub fn version(&self) -> u32 {
        self.object.version()
    }

    pub fn interface(&self) -> &Rc<Interface> {
        self.object.interface()
    }

    pub fn is_destroyed(&self) -> bool {
        self.object.is_destroyed()
    }

    pub fn set_queue(&self, queue: Queue) {
        self.object.set_queue(queue);
    }

    pub fn set_handler(&self, event_name: impl Into<String>, handler: Handler) {
        self.object.set_handler(event_name, handler);
    }

    pub fn set_silence(&self, event_name: impl Into<String>, silent: bool) {
        self.object.set_silence(event_name, silent);
    }

    /// Invoke the request named `request_name` with `args`, following the
    /// seven-step sequence of spec.md §4.3. Returns the freshly created
    /// child proxy if the request has a `new_id` argument.
    pub fn request(&self, request_name: &str, args: Vec<OutArg>) -> Result<Option<Proxy>, WireError> {
        // Step 1: deleted proxy.
        if self.object.id() == 0 {
            return Err(WireError::DeletedProxy);
        }
        // Step 2: already destroyed — log and no-op.
        if self.object.is_destroyed() {
            log::warn!(
                "{}@{}: request `{}` invoked after destructor, dropping",
                self.interface().name,
                self.id(),
                request_name
            );
            return Ok(None);
        }

        let request = self
            .interface()
            .request_by_name(request_name)
            .unwrap_or_else(|| panic!("no such request `{request_name}` on {}", self.interface().name));

        // Step 3: version gate — log and no-op.
        if self.version() < request.since {
            log::warn!(
                "{}@{}: request `{}` requires version {} but proxy is version {}, dropping",
                self.interface().name,
                self.id(),
                request_name,
                request.since,
                self.version()
            );
            return Ok(None);
        }

        let connection = self
            .connection
            .upgrade()
            .ok_or(WireError::DeletedProxy)?;

        // Step 4: marshal arguments, allocating any new_id along the way.
        let mut wire_args = smallvec::SmallVec::<[crate::wire::Argument; 4]>::new();
        let mut created: Option<Proxy> = None;

        for (i, out) in args.into_iter().enumerate() {
            let nullable_object = matches!(
                request.args.get(i).map(|a| &a.ty),
                Some(crate::wire::ArgumentType::Object { nullable: true })
            );
            let wire_arg = match out {
                OutArg::Int(v) => crate::wire::Argument::Int(v),
                OutArg::Uint(v) => crate::wire::Argument::Uint(v),
                OutArg::Fixed(v) => crate::wire::Argument::Fixed(v),
                OutArg::Str(v) => crate::wire::Argument::Str(v),
                OutArg::Object(Some(id)) => crate::wire::Argument::Object(id),
                OutArg::Object(None) if nullable_object => crate::wire::Argument::Object(0),
                OutArg::Object(None) => {
                    return Err(WireError::NullArgument);
                }
                OutArg::Array(v) => crate::wire::Argument::Array(v),
                OutArg::Fd(v) => crate::wire::Argument::Fd(v),
                OutArg::NewId => {
                    let iface_name = request.creates.as_deref().expect(
                        "request declares a fixed-interface new_id but has no `creates` target",
                    );
                    let iface = connection
                        .lookup_interface(iface_name)
                        .unwrap_or_else(|| panic!("unknown interface `{iface_name}`"));
                    let new_id = connection.allocate_id();
                    let child = connection.spawn_child(new_id, iface, self.version());
                    wire_args.push(crate::wire::Argument::NewId(new_id));
                    created = Some(child);
                    continue;
                }
                OutArg::NewIdDynamic(iface, version) => {
                    let new_id = connection.allocate_id();
                    let child = connection.spawn_child(new_id, iface.clone(), version);
                    let name = CString::new(iface.name.as_str()).unwrap();
                    wire_args.push(crate::wire::Argument::AnyNewId(name, version, new_id));
                    created = Some(child);
                    continue;
                }
            };
            wire_args.push(wire_arg);
        }

        let msg = crate::wire::Message { object_id: self.id(), opcode: request.opcode, args: wire_args };

        crate::debug::print_request(&self.interface().name, self.id(), request_name, &msg.args);

        // Step 5: enqueue on the transport send queue. The new proxy (if
        // any) was already inserted into the registry by spawn_child above,
        // before this frame is queued — satisfying testable property 5.
        connection.enqueue(&msg)?;

        // Step 6: destructor transition.
        if request.is_destructor {
            self.object.mark_destroyed();
        }

        // Step 7.
        Ok(created)
    }
}
