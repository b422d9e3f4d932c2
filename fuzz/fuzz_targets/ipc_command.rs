//! Fuzz target for IPC command parsing.
//!
//! The daemon parses whatever a local client writes to its socket.

#![no_main]

use libfuzzer_sys::fuzz_target;
use reveille::ipc::parse_command;

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        if let Ok(cmd) = parse_command(line) {
            // Anything accepted must serialize back to something accepted
            let json = serde_json::to_string(&cmd).unwrap_or_default();
            assert!(parse_command(&json).is_ok());
        }
    }
});
