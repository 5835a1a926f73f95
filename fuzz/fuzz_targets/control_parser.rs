#![no_main]

use demora::control::TrackingMode;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Control directives arrive as raw bytes from userspace; parsing must
    // never panic, and anything that is accepted must be one of the three
    // documented modes.
    if let Ok(input) = std::str::from_utf8(data) {
        if let Ok(mode) = TrackingMode::parse(input) {
            assert!(matches!(
                mode,
                TrackingMode::Disabled | TrackingMode::Local | TrackingMode::Hierarchical
            ));
        }
    }
});
