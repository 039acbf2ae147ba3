//! Common vocabulary for the ccnd forwarding daemon.
//!
//! Everything the daemon and its tooling share lives here: the flat name
//! encoding, the TLV wire codec for Interests and ContentObjects, the
//! management request bodies, the wrapped-time clock, the error enum, and
//! the metrics aggregates.

pub mod error;
pub mod metrics;
pub mod mgmt;
pub mod name;
pub mod packet;
pub mod time;
pub mod tlv;

pub use error::Error;
pub use name::{FlatName, NameOrder};
pub use packet::{ContentObject, Interest, WireContentObject, WireInterest};
pub use time::WTime;
