// Federation member endpoints
pub mod endpoint_trait;
pub mod memory_endpoint;
pub mod sparql_endpoint;
pub mod sparql_results;
pub mod query_string;

pub use endpoint_trait::*;
pub use memory_endpoint::*;
pub use sparql_endpoint::*;
pub use sparql_results::*;
