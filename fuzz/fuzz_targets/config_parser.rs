#![no_main]

use forktrail::config::FileConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Parsing and duration resolution must reject bad input, never panic
        if let Ok(config) = FileConfig::parse(input) {
            let _ = config.writer_config();
        }
    }
});
