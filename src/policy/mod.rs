//! CONNECT admission: authentication, destination policy, host patterns

mod auth;
mod destination;
pub mod matcher;

pub use auth::{AllowAll, Authenticator, BasicAuth};
pub use destination::{DestinationPolicy, PolicyDecision};
pub use matcher::{PatternMatcher, PatternSet};
