mod action;
mod cache;
mod clock;
mod community;
mod dispatcher;
mod handlers;

#[cfg(test)]
pub(crate) mod harness;

pub use action::{RemovalReason, TunnelAction};
pub use cache::{CacheCategory, CacheEntry, RequestCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use community::{CircuitRequest, TunnelCommunity, TunnelStats};
pub use dispatcher::Dispatcher;

pub(crate) use community::end_to_end_direction;
pub(crate) use handlers::Role;
