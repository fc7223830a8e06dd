//! Per-principal IP allow-listing: security-critical address validation,
//! the persistent entry store, and the privileged-route gate middleware.

pub mod gate;
pub mod store;
pub mod validation;

pub use gate::{ip_allowlist_gate, IpAllowlistGate};
pub use store::{AllowedIpEntry, AllowedIpPatch, AllowedIpStore, AllowlistStats};
pub use validation::validate_ip_address;
