#![no_main]
use libfuzzer_sys::fuzz_target;
use pondfuse::modules::config::{MountConfig, MountOptions};
use std::path::PathBuf;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let mut fields = text.split(',');
        let mountpoint = PathBuf::from(fields.next().unwrap_or("/mnt/fuzz"));
        let pool = fields.next().map(str::to_string);
        let container = fields.next().map(str::to_string);
        let thread_count = fields.next().and_then(|f| f.parse().ok());

        let opts = MountOptions {
            mountpoint,
            pool,
            container,
            thread_count,
            singlethread: data.len() % 2 == 0,
            foreground: true,
            ..Default::default()
        };
        let _ = MountConfig::resolve(opts);
    }
});
