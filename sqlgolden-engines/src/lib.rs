//! Executor adapters for [`sqlgolden`].

mod external;
mod postgres;

pub use external::*;
pub use postgres::*;
