//! The orchestration layer: response hardening, the per-request security
//! pipeline, the allow-list management surface, and server assembly.

pub mod admin;
pub mod headers;
pub mod pipeline;
pub mod server;

pub use admin::allowlist_admin_router;
pub use pipeline::{security_gateway_middleware, SecurityGateway, SecurityGatewayBuilder};
pub use server::{GatewayComponents, GatewayServer};
