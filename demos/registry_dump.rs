//! Connects to a running compositor, discovers the advertised globals via a
//! roundtrip, and prints them. A manual smoke test, not part of the crate's
//! public contract.

use std::rc::Rc;

use wayrs_rt::{Connection, OutArg, Protocol};

fn main() {
    env_logger::init();

    let conn = match Connection::connect_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("could not connect to a compositor: {e}");
            std::process::exit(1);
        }
    };

    let wayland_extra = Protocol::load(include_str!("protocols/wayland.xml"))
        .expect("demos/protocols/wayland.xml is well-formed");
    let xdg_shell = Protocol::load_child(include_str!("protocols/xdg-shell.xml"), &wayland_extra)
        .expect("demos/protocols/xdg-shell.xml is well-formed");
    conn.use_protocol(Rc::new(wayland_extra));
    conn.use_protocol(Rc::new(xdg_shell));

    let display = conn.display();
    let registry = display
        .request("get_registry", vec![OutArg::NewId])
        .expect("get_registry never fails on a live display")
        .expect("get_registry always creates a registry proxy");

    registry.set_handler(
        "global",
        Box::new(|_proxy, args| {
            use wayrs_rt::EventArg;
            let mut it = args.into_iter();
            let (Some(EventArg::Uint(name)), Some(EventArg::Str(Some(interface))), Some(EventArg::Uint(version))) =
                (it.next(), it.next(), it.next())
            else {
                return;
            };
            println!("global {name}: {} v{version}", interface.to_string_lossy());
        }),
    );

    conn.roundtrip().expect("roundtrip with a live compositor should not fail");
}
