//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod bookmark;
mod dead_letter;
mod execution;
mod lease;
mod lock;
mod schedule;
mod task;

pub use bookmark::{Bookmark, BookmarkHash, BookmarkInput};
pub use dead_letter::{DeadLetterEntry, DeadLetterQuery, DeadLetterReason};
pub use execution::{
    ExecutionFailure, ExecutionFailureKind, ExecutionOutcome, ExecutionRecord, ExecutionStatus,
};
pub use lease::{Lease, LeasedTask, ReceiptToken};
pub use lock::{DistributedLock, FencingToken, HolderId, LockAcquisition, ResourceName};
pub use schedule::{ScheduleDefinition, ScheduleDefinitionInput};
pub use task::{
    DedupKey, GroupKey, NewTask, PublishDisposition, PublishReceipt, TaskAttributes, TaskId,
    TaskMessage,
};
