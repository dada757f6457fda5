#![no_main]
use libfuzzer_sys::fuzz_target;
use pondfuse::modules::storage::PathIdentity;

fuzz_target!(|data: &[u8]| {
    // The attribute payload comes from an untrusted xattr; parsing must
    // never panic, only succeed or return a malformed-payload error.
    let _ = PathIdentity::parse(data);
});
