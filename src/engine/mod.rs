// Core engine components
pub mod barrier;
pub mod cache;
pub mod cursor;
pub mod executor;
pub mod federation;
pub mod join;
pub mod query_info;
pub mod scheduler;
pub mod source_selection;
pub mod strategy;
pub mod union;

pub use barrier::*;
pub use cache::*;
pub use cursor::*;
pub use executor::*;
pub use federation::*;
pub use join::*;
pub use query_info::*;
pub use scheduler::*;
pub use source_selection::*;
pub use strategy::*;
pub use union::*;
