use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

static TOOL_CALL_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default()
}

pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Id for a tool call the provider did not name: `call_<unix-millis>_<counter>`
pub fn tool_call_id() -> String {
    let n = TOOL_CALL_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("call_{}_{}", unix_millis(), n)
}

/// Fresh id for one outbound provider call
pub fn request_id() -> String {
    format!("agent-{}", Uuid::new_v4())
}

pub fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}
