//! # Domain Model
//!
//! Request/response payloads exchanged with the seven management capabilities.
//! Each capability speaks one `XxxRequest` enum and answers with the matching
//! `XxxResponse` enum; see [`crate::capabilities`] for the pairing.

pub mod asset;
pub mod batch;
pub mod device;
pub mod event;
pub mod schedule;
pub mod tenant;
pub mod user;

pub use asset::*;
pub use batch::*;
pub use device::*;
pub use event::*;
pub use schedule::*;
pub use tenant::*;
pub use user::*;
