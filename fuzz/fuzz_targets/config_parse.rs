//! Fuzz target for TOML config parsing.
//!
//! Malformed config files must be rejected with an error, never a panic,
//! and anything that parses must survive validation.

#![no_main]

use libfuzzer_sys::fuzz_target;
use reveille::Config;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = toml::from_str::<Config>(s) {
            let _ = config.validate();
            let _ = config.playback.sounds_dir();
        }
    }
});
