pub mod sse;

pub use sse::{scan_signature, SseEvent, SseLine, SseLineBuffer};
