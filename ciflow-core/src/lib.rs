pub mod labels;
pub mod reconciler;
pub mod recording;
pub mod refs;

pub use labels::*;
pub use reconciler::{RemoveOutcome, SyncOutcome, TagReconciler};
pub use recording::{
    CorrelationId, Direction, EventType, RecordedEvent, Sanitizer, CORRELATION_ID_HEADER,
    DELIVERY_ID_HEADER, SENSITIVE_HEADERS,
};
pub use refs::{GitRef, InMemoryRefStore, RefStore, RepoContext};
