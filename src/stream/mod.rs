//! Stream combinators for published state

mod coalesce;

pub use coalesce::{Coalesce, CoalesceExt};
