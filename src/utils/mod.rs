//! Common utilities shared by the relay and the client engine.

pub mod net;
pub mod throttle;

pub use net::bind_tcp_listener;
pub use throttle::LogThrottler;
