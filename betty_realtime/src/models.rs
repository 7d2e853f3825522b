//! Data structures flowing through the realtime pipeline

pub mod change;
pub mod identity;
pub mod order;

pub mod prelude {
    pub use super::{change::*, identity::*, order::*};
}
