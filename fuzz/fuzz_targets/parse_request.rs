//! Fuzz harness for `parse_request`.
//!
//! Request frames arrive from admitted but untrusted peers. The parser must
//! reject anything that is not a request without panicking, and whatever it
//! accepts must serialize back to a frame it accepts again.

#![no_main]
use battd_daemon::protocol::messages::{parse_request, serialize_request};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(request) = parse_request(data) else {
        return;
    };
    let bytes = serialize_request(&request).expect("parsed request must serialize");
    let reparsed = parse_request(&bytes).expect("serialized request must parse");
    assert_eq!(reparsed, request);
});
