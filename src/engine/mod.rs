pub mod assertion;
pub mod batch;
pub mod cancel;
pub mod condition;
pub mod env;
pub mod extract;
pub mod http;
pub mod jsonpath;
pub mod response;
pub mod scenario;
pub mod scripted;

pub use batch::{health_check_cases, BatchExecutor, BatchOptions};
pub use cancel::{CancelRegistry, CancelSignal};
pub use http::{HttpTransport, ReqwestTransport};
pub use scenario::{validate_scenario, ExecutionOptions, ScenarioExecutor};
pub use scripted::{ScriptedReply, ScriptedTransport};
