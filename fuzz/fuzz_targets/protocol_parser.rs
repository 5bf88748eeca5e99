#![no_main]
#[macro_use]
extern crate libfuzzer_sys;

use wayrs_rt::Protocol;

fuzz_target!(|data: &[u8]| {
    if let Ok(xml) = std::str::from_utf8(data) {
        let _ = Protocol::load(xml);
    }
});
