pub mod model;
pub mod registry;
pub mod resolver;

pub use model::*;
pub use registry::*;
pub use resolver::*;
