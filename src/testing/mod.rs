//! Testing utilities and mock implementations
//!
//! Lets the session engine be exercised without a broker or registration
//! service: a scripted in-memory transport, a recording subscriber and a
//! canned registration client.

pub mod mocks;

pub use mocks::*;
