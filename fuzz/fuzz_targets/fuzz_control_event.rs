//! Fuzz target for control-event decoding.
//!
//! This tests that `ControlEvent::decode` never panics on arbitrary
//! event types and payloads.

#![no_main]

use cascade_consumer::event::{ControlEvent, Event};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (ev_type, ev_data) = data;
    let event = Event::new(1, ev_type, ev_data);

    // Should never panic
    if let Ok(Some(decoded)) = ControlEvent::decode(&event) {
        let _ = decoded.payload();
    }
});
