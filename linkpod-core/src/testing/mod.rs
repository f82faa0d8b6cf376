//! Test support: an in-memory bus that wires several session engines
//! together without a real transport.

pub mod bus;

pub use bus::SessionBus;
