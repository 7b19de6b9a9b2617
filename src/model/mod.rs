//! Core data types shared by the graph, the scheduler and the wire protocol.

pub mod definition;
pub mod ids;
pub mod record;

pub use definition::{
    parse_test_definitions, DefinitionError, MachineShape, TestDefinition, BUILD_TEST_NAME,
};
pub use ids::{BranchId, CommitId, ParseIdError};
pub use record::{
    HeartbeatResponse, MachineResult, PerformanceSample, RunStatus, TestRunRecord,
    HEARTBEAT_TIMEOUT_SECS,
};
