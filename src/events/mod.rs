pub mod streams;
pub use streams::{EventStream, Subscriber};

/// Capacity of the broadcast channel behind the auth transition stream
pub const AUTH_EVENT_CAPACITY: usize = 256;
/// Capacity of the broadcast channel behind the profile event stream
pub const PROFILE_EVENT_CAPACITY: usize = 64;
