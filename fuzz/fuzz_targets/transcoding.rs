#![no_main]
use libfuzzer_sys::fuzz_target;
use pickle_graph::{value_from_slice, value_to_vec, DeOptions, SerOptions};

// Decoded graphs (possibly cyclic) are fed back to the encoder.
fuzz_target!(|data: &[u8]| {
    let value = match value_from_slice(data, DeOptions::new()) {
        Ok(value) => value,
        Err(_) => return,
    };
    for proto in 0..=5 {
        let _ = value_to_vec(&value, SerOptions::new().proto(proto));
    }
});
