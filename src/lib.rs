pub mod algebra;
pub mod endpoints;
pub mod engine;
pub mod optimizer;
pub mod utils;

pub use algebra::*;
pub use endpoints::*;
pub use engine::*;
pub use utils::*;
