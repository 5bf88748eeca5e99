//! End-to-end scenarios driven over `UnixStream::pair()` stub compositors.
//!
//! Each stub plays the server side by hand: it has no wire parser of its
//! own, just enough byte-shuffling to reply the way a real compositor
//! would for the specific exchange under test.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use wayrs_rt::{Connection, EventArg, OutArg, Protocol};

fn frame_header(object_id: u32, opcode: u16, body_len: usize) -> Vec<u8> {
    let mut v = Vec::with_capacity(8);
    v.extend_from_slice(&object_id.to_ne_bytes());
    let size = (8 + body_len) as u32;
    v.extend_from_slice(&((size << 16) | u32::from(opcode)).to_ne_bytes());
    v
}

fn no_arg_frame(object_id: u32, opcode: u16) -> Vec<u8> {
    frame_header(object_id, opcode, 0)
}

fn uint_frame(object_id: u32, opcode: u16, value: u32) -> Vec<u8> {
    let mut v = frame_header(object_id, opcode, 4);
    v.extend_from_slice(&value.to_ne_bytes());
    v
}

fn string_arg_bytes(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let len = bytes.len() + 1;
    let mut v = Vec::new();
    v.extend_from_slice(&(len as u32).to_ne_bytes());
    v.extend_from_slice(bytes);
    v.push(0);
    while v.len() % 4 != 0 {
        v.push(0);
    }
    v
}

fn global_event_frame(registry_id: u32, name: u32, interface: &str, version: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&name.to_ne_bytes());
    body.extend_from_slice(&string_arg_bytes(interface));
    body.extend_from_slice(&version.to_ne_bytes());
    let mut v = frame_header(registry_id, 0, body.len());
    v.extend_from_slice(&body);
    v
}

fn error_event_frame(object_id: u32, code: u32, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&object_id.to_ne_bytes());
    body.extend_from_slice(&code.to_ne_bytes());
    body.extend_from_slice(&string_arg_bytes(message));
    let mut v = frame_header(1, 0, body.len());
    v.extend_from_slice(&body);
    v
}

/// Drain whatever the client has written so far without interpreting it —
/// the stub only needs to know the client sent *something* before it
/// replies.
fn drain_available(stream: &mut UnixStream) {
    std::thread::sleep(Duration::from_millis(20));
    let mut buf = [0u8; 4096];
    stream.set_nonblocking(true).unwrap();
    let _ = stream.read(&mut buf);
    stream.set_nonblocking(false).unwrap();
}

#[test]
fn s1_roundtrip_handshake() {
    let (client_sock, mut server_sock) = UnixStream::pair().unwrap();
    let conn = Connection::from_fd(client_sock.into()).unwrap();

    let server = std::thread::spawn(move || {
        drain_available(&mut server_sock);
        // sync's callback took client id 2 (1 is the display).
        let mut reply = no_arg_frame(2, 0); // wl_callback.done
        reply.extend_from_slice(&uint_frame(1, 1, 2)); // wl_display.delete_id(2)
        server_sock.write_all(&reply).unwrap();
    });

    conn.roundtrip().expect("roundtrip against a well-behaved stub must succeed");
    server.join().unwrap();
}

#[test]
fn s2_registry_global_discovery_and_bind() {
    let (client_sock, mut server_sock) = UnixStream::pair().unwrap();
    let conn = Connection::from_fd(client_sock.into()).unwrap();

    let server = std::thread::spawn(move || {
        drain_available(&mut server_sock); // get_registry + sync
        let mut reply = global_event_frame(2, 0, "wl_compositor", 5);
        reply.extend_from_slice(&global_event_frame(2, 1, "wl_shm", 1));
        reply.extend_from_slice(&no_arg_frame(3, 0)); // wl_callback.done (id 3 == sync's callback)
        reply.extend_from_slice(&uint_frame(1, 1, 3)); // delete_id(3)
        server_sock.write_all(&reply).unwrap();
    });

    let display = conn.display();
    let registry =
        display.request("get_registry", vec![OutArg::NewId]).unwrap().expect("creates a registry proxy");

    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_in_handler = seen.clone();
    registry.set_handler(
        "global",
        Box::new(move |_proxy, args| {
            let mut it = args.into_iter();
            if let (Some(EventArg::Uint(name)), Some(EventArg::Str(Some(interface))), Some(EventArg::Uint(v))) =
                (it.next(), it.next(), it.next())
            {
                seen_in_handler.borrow_mut().push((name, interface.to_string_lossy().into_owned(), v));
            }
        }),
    );

    conn.roundtrip().unwrap();
    server.join().unwrap();

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], (0, "wl_compositor".to_owned(), 5));
    assert_eq!(seen[1], (1, "wl_shm".to_owned(), 1));
}

#[test]
fn s3_id_recycling_after_destructor_and_delete_id() {
    let proto_xml = r#"<?xml version="1.0"?>
<protocol name="test">
  <interface name="test_destroyable" version="1">
    <request name="destroy" type="destructor"/>
  </interface>
</protocol>"#;
    let protocol = Protocol::load(proto_xml).unwrap();
    let iface = protocol.interface("test_destroyable").unwrap().clone();

    let (client_sock, mut server_sock) = UnixStream::pair().unwrap();
    let conn = Connection::from_fd(client_sock.into()).unwrap();
    conn.use_protocol(Rc::new(protocol));

    let display = conn.display();
    let registry =
        display.request("get_registry", vec![OutArg::NewId]).unwrap().expect("registry"); // id 2

    let first = registry
        .request("bind", vec![OutArg::Uint(0), OutArg::NewIdDynamic(iface.clone(), 1)])
        .unwrap()
        .expect("bind creates a proxy"); // id 3
    assert_eq!(first.id(), 3);
    first.request("destroy", vec![]).unwrap();

    let server = std::thread::spawn(move || {
        drain_available(&mut server_sock); // bind + destroy + sync
        let mut reply = uint_frame(1, 1, 3); // delete_id(3), freeing it before the callback fires
        reply.extend_from_slice(&no_arg_frame(4, 0)); // wl_callback.done (sync's callback got id 4)
        reply.extend_from_slice(&uint_frame(1, 1, 4)); // delete_id(4)
        server_sock.write_all(&reply).unwrap();
    });

    conn.roundtrip().unwrap();
    server.join().unwrap();

    // The roundtrip's own sync callback (id 4) was freed most recently, so
    // the LIFO reuse pile hands it back before the destroyed proxy's id 3 —
    // both are reused before the id space advances to 5.
    let second = registry
        .request("bind", vec![OutArg::Uint(1), OutArg::NewIdDynamic(iface.clone(), 1)])
        .unwrap()
        .expect("bind creates a proxy");
    assert_eq!(second.id(), 4, "the most recently freed id is reused first");

    let third = registry
        .request("bind", vec![OutArg::Uint(2), OutArg::NewIdDynamic(iface, 1)])
        .unwrap()
        .expect("bind creates a proxy");
    assert_eq!(third.id(), 3, "the destroyed proxy's id is reused next");
}

#[test]
fn s4_partial_send_does_not_block() {
    let (client_sock, server_sock) = UnixStream::pair().unwrap();
    let conn = Connection::from_fd(client_sock.into()).unwrap();

    // Fill the stub's receive buffer so the kernel send buffer on our side
    // eventually reports would-block instead of accepting more.
    server_sock.set_nonblocking(true).unwrap();

    let display = conn.display();
    for _ in 0..10_000 {
        let _ = display.request("sync", vec![OutArg::NewId]);
    }
    // Must return without blocking regardless of whether everything flushed.
    let _ = conn.flush();
}

#[test]
fn s5_fatal_display_error_surfaces_from_dispatch_pending() {
    let (client_sock, mut server_sock) = UnixStream::pair().unwrap();
    let conn = Connection::from_fd(client_sock.into()).unwrap();

    let server = std::thread::spawn(move || {
        drain_available(&mut server_sock);
        let frame = error_event_frame(1, 7, "no memory");
        server_sock.write_all(&frame).unwrap();
    });

    conn.flush().unwrap();
    let done = Cell::new(false);
    while !done.get() {
        match conn.dispatch() {
            Ok(_) => {}
            Err(wayrs_rt::WireError::Display { object_id, code, message, .. }) => {
                assert_eq!(object_id, 1);
                assert_eq!(code, 7);
                assert_eq!(message, "no memory");
                done.set(true);
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    server.join().unwrap();
}

#[test]
fn s5b_display_error_resolves_symbolic_code_name() {
    let proto_xml = r#"<?xml version="1.0"?>
<protocol name="test">
  <interface name="test_thing" version="1">
    <enum name="error">
      <entry name="bad_stuff" value="7"/>
    </enum>
  </interface>
</protocol>"#;
    let protocol = Protocol::load(proto_xml).unwrap();
    let iface = protocol.interface("test_thing").unwrap().clone();

    let (client_sock, mut server_sock) = UnixStream::pair().unwrap();
    let conn = Connection::from_fd(client_sock.into()).unwrap();
    conn.use_protocol(Rc::new(protocol));

    let display = conn.display();
    let registry =
        display.request("get_registry", vec![OutArg::NewId]).unwrap().expect("registry"); // id 2
    let thing = registry
        .request("bind", vec![OutArg::Uint(0), OutArg::NewIdDynamic(iface, 1)])
        .unwrap()
        .expect("bind creates a proxy"); // id 3
    let thing_id = thing.id();

    let server = std::thread::spawn(move || {
        drain_available(&mut server_sock);
        let frame = error_event_frame(thing_id, 7, "bad stuff happened");
        server_sock.write_all(&frame).unwrap();
    });

    conn.flush().unwrap();
    let done = Cell::new(false);
    while !done.get() {
        match conn.dispatch() {
            Ok(_) => {}
            Err(wayrs_rt::WireError::Display { object, code_name, .. }) => {
                assert_eq!(code_name.as_deref(), Some("bad_stuff"));
                assert_eq!(object.expect("offending object is still registered").interface().name, "test_thing");
                done.set(true);
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    server.join().unwrap();
}

#[test]
fn s6_child_protocol_duplicate_interface_is_atomic() {
    let parent_xml = r#"<?xml version="1.0"?>
<protocol name="parent">
  <interface name="shared_thing" version="1"/>
  <interface name="only_in_parent" version="1"/>
</protocol>"#;
    let child_xml = r#"<?xml version="1.0"?>
<protocol name="child">
  <interface name="shared_thing" version="1"/>
  <interface name="only_in_child" version="1"/>
</protocol>"#;

    let parent = Protocol::load(parent_xml).unwrap();
    let result = Protocol::load_child(child_xml, &parent);
    assert!(result.is_err(), "redefining shared_thing must fail");

    // The parent itself must be untouched, and `only_in_child` must not
    // have leaked in from the aborted merge.
    assert!(parent.interface("shared_thing").is_some());
    assert!(parent.interface("only_in_parent").is_some());
    assert!(parent.interface("only_in_child").is_none());
}
