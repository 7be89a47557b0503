pub mod execution;
pub mod result;
pub mod route;
pub mod rule;
pub mod statement;
pub mod value;

pub use execution::*;
pub use result::*;
pub use route::*;
pub use rule::*;
pub use statement::*;
pub use value::*;
