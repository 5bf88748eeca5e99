//! `WAYLAND_DEBUG`-gated wire tracer.
//!
//! Mirrors the teacher's own convention: a dedicated environment variable,
//! not a `log` filter level, because wire traffic is extremely chatty and
//! callers who want it want it unconditionally and verbatim.

use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::proxy::EventArg;
use crate::wire::Argument;

thread_local! {
    static ENABLED: Cell<Option<bool>> = Cell::new(None);
}

pub fn enabled() -> bool {
    ENABLED.with(|cell| {
        if let Some(v) = cell.get() {
            return v;
        }
        let v = std::env::var_os("WAYLAND_DEBUG").is_some();
        cell.set(Some(v));
        v
    })
}

pub fn print_request(interface: &str, id: u32, name: &str, args: &[Argument]) {
    if !enabled() {
        return;
    }
    print_timestamp();
    eprint!(" -> {interface}@{id}.{name}(");
    print_args(args.iter().map(describe_wire_arg));
    eprintln!(")");
}

pub fn print_event(interface: &str, id: u32, name: &str, args: &[EventArg]) {
    if !enabled() {
        return;
    }
    print_timestamp();
    eprint!(" <- {interface}@{id}.{name}(");
    print_args(args.iter().map(describe_event_arg));
    eprintln!(")");
}

fn print_args(parts: impl Iterator<Item = String>) {
    let mut first = true;
    for p in parts {
        if !first {
            eprint!(", ");
        }
        eprint!("{p}");
        first = false;
    }
}

fn describe_wire_arg(arg: &Argument) -> String {
    match arg {
        Argument::Int(v) => v.to_string(),
        Argument::Uint(v) => v.to_string(),
        Argument::Fixed(v) => v.as_f64().to_string(),
        Argument::Str(Some(s)) => format!("{s:?}"),
        Argument::Str(None) => "nil".to_owned(),
        Argument::Object(o) => format!("object@{o}"),
        Argument::NewId(n) => format!("new_id@{n}"),
        Argument::AnyNewId(iface, version, id) => format!("{iface:?} v{version} new_id@{id}"),
        Argument::Array(a) => format!("array[{}]", a.len()),
        Argument::Fd(_) => "fd".to_owned(),
    }
}

fn describe_event_arg(arg: &EventArg) -> String {
    match arg {
        EventArg::Int(v) => v.to_string(),
        EventArg::Uint(v) => v.to_string(),
        EventArg::Fixed(v) => v.as_f64().to_string(),
        EventArg::Str(Some(s)) => format!("{s:?}"),
        EventArg::Str(None) => "nil".to_owned(),
        EventArg::Object(Some(p)) => format!("{}@{}", p.interface().name, p.id()),
        EventArg::Object(None) => "nil".to_owned(),
        EventArg::NewId(p) => format!("{}@{} (new)", p.interface().name, p.id()),
        EventArg::Array(a) => format!("array[{}]", a.len()),
        EventArg::Fd(_) => "fd".to_owned(),
    }
}

fn print_timestamp() {
    if let Ok(d) = SystemTime::now().duration_since(UNIX_EPOCH) {
        eprint!("[{}.{:06}]", d.as_secs(), d.subsec_micros());
    }
}
