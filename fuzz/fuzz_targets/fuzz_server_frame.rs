#![no_main]

use libfuzzer_sys::fuzz_target;
use rps_room_client::presence::{PhoenixPresence, PresenceReconciler};
use rps_room_client::protocol::{Frame, ServerEvent};

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = serde_json::from_slice::<Frame>(data) else {
        return;
    };
    let _ = frame.reply();

    // Presence payloads must fold without panicking whatever their shape.
    let mut presence = PhoenixPresence::new();
    match ServerEvent::from_frame(&frame) {
        Ok(ServerEvent::PresenceState(snapshot)) => {
            let _ = presence.reconcile_snapshot(snapshot);
        }
        Ok(ServerEvent::PresenceDiff(diff)) => {
            let _ = presence.reconcile_diff(diff);
        }
        _ => {}
    }
});
