// Query algebra and executable plan
pub mod pattern;
pub mod expr;
pub mod tuple_expr;
pub mod plan;

pub use pattern::*;
pub use expr::*;
pub use tuple_expr::*;
pub use plan::*;
