mod batch_types;
mod scenario_types;
mod types;

pub use batch_types::*;
pub use scenario_types::*;
pub use types::*;
