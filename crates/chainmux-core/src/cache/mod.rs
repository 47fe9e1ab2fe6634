//! Store-backed side tables consulted directly by the request path.
//!
//! - [`PresenceCache`]: identifier → endpoints known to have observed it (affinity routing)
//! - [`ResultCache`]: allow-listed idempotent results, per method TTL
//!
//! Neither cache goes through the chain status hub, and neither ever fails a request.

pub mod presence;
pub mod result;

pub use presence::PresenceCache;
pub use result::{CachedResult, ResultCache};
