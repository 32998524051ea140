#![no_main]

use ilweave::metadata::{method::MethodBody, signatures::parse_method_signature};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(body) = MethodBody::decompose(data) {
        let _ = body.exceptions.extra_section_bytes(0);
    }
    let _ = parse_method_signature(data);
});
