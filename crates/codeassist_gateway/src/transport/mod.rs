//! Provider calls: endpoint fallback, permission backoff, one re-auth per
//! call and stream relaying.

pub mod backoff;
pub mod orchestrator;
pub mod stream;

pub use backoff::BackoffPolicy;
pub use orchestrator::{
    build_http_client, is_permission_propagation, Gateway, GatewayRequest, GatewayResponse,
    RequestBody, ResponseBody,
};
pub use stream::{relay, ByteStream, SignatureSink, StreamMode};
