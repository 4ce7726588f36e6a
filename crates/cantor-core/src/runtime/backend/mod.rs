pub mod admission;
pub mod command;
pub mod protocol;

pub use admission::{Admission, AdmissionGate, GateStats, Permit, Ticket};
pub use command::CommandBackend;
pub use protocol::{
    GeneratedAudio, GenerationJob, InferenceBackend, InferenceError, ProgressEvent, ProgressSink,
};
