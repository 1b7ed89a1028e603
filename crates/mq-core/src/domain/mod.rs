//! Domain layer: value types with no I/O.
//!
//! - [`address`]: the `(host, port)` pair that identifies one end of a
//!   transport connection and keys every table the broker keeps.
//! - [`filter`]: the document filter language used by directory queries.

pub mod address;
pub mod filter;

pub use address::Address;
pub use filter::Filter;
