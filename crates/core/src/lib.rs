//! Shared primitives for the PDF generation queue.
//!
//! Identifiers, time helpers and the validation error. No IO lives here.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{from_millis, millis_after, now_millis, to_millis};
pub use error::{CoreError, CoreResult};
pub use id::{JobId, LockToken};
