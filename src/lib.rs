//! A transparent proxy client.
//!
//! Frames captured on listen devices are matched against a set of filters;
//! matching packets get a translation port, are wrapped in an envelope,
//! encrypted and sent to a server as UDP from the upstream device. Replies
//! take the reverse path and are injected back on the device the flow came
//! from.

pub mod configfile;
pub mod crypto;
pub mod device;
pub mod encap;
pub mod error;
pub mod filter;
pub mod link;
pub mod logging;
pub mod nat;
pub mod packet;
pub mod relay;
pub mod workers;

pub use error::{Error, Result};
