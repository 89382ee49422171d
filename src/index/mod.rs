pub mod registry;
pub mod sequence;

pub use registry::{NewWorkspace, RegistryError, SaveOutcome, WorkspaceRegistry};
pub use sequence::{
    Change, SequenceHandle, SequenceId, SequenceIndex, SequenceRecord, SequenceService,
};
