#![no_main]

use libfuzzer_sys::fuzz_target;
use trellis_core::selector::Parameters;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let params = Parameters::from(text);
    for (k, _) in params.iter() {
        assert!(params.contains_key(k));
    }
    let _ = params.has_time_range();
    let _ = params.to_string();
});
