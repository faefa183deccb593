//! Trust gateway
//!
//! TLS-terminating reverse proxy that authorizes each request by mTLS peer
//! certificate or HTTP message signature before relaying it upstream.
//!
//! ```text
//! socket → [TLS] → Framer → Authorizer ─ deny → 403 Forbidden: <reason>
//!                                       └ allow → Relay → upstream → client
//! ```

pub mod authz;
pub mod framer;
pub mod registry;
pub mod relay;
pub mod response;
pub mod server;
pub mod trust_root;

pub use authz::{AuthorizationDecision, Authorizer, InboundRequest, Verdict};
pub use framer::{Framer, Headers, RequestHead};
pub use registry::{AgentRecord, AgentStatus, HttpRegistry, KeyRecord, KeyStatus, Registry};
pub use relay::Relay;
pub use server::Gateway;
pub use trust_root::TrustRoot;
