//! Federation execution coordinator for the OHLA run-time infrastructure.
//!
//! The [`Rti`] owns the live federation executions. Each
//! [`FederationExecution`] tracks its joined federates, object instances and
//! attribute ownership, coordinates logical time, and runs federation save
//! and restore against a [`SaveStore`].
//!
//! Service calls return synchronously; everything a federate is told later
//! arrives as a [`Callback`] on the [`CallbackQueue`] it got when joining.

pub mod callback;
pub mod error;
pub mod execution;
pub mod ownership;
pub mod protocol;
pub mod proxy;
pub mod rti;
pub mod save;
pub mod save_file;
pub mod store;
pub mod sync;
pub mod time_manager;

pub use callback::{
    AttributeSet, AttributeValues, Callback, CallbackQueue, FederateRestoreStatus,
    FederateSaveStatus, ParameterValues,
};
pub use error::{
    DeclarationError, FederationError, ObjectError, OwnershipError, RestoreError, SaveError,
    SaveFileError, ServiceError, StoreError, SyncError, TimeError,
};
pub use execution::{FederationExecution, ResignAction};
pub use ownership::{AcquisitionOutcome, AttributeInstance, ObjectInstance, OwnershipState};
pub use protocol::{Request, Response, ResponsePayload};
pub use proxy::{Declarations, FederateProxy};
pub use rti::{JoinedFederate, Rti};
pub use save::{
    BufferedEntry, BufferedInteraction, BufferedMessage, BufferedUpdate, RestoreFailureReason,
    RestoreStatus, SaveFailureReason, SaveStatus,
};
pub use save_file::{
    encode_artifact, read_artifact, write_artifact, ExecutionSnapshot, FederateRecord,
    ObjectSnapshot, SaveArtifact, SaveHeader,
};
#[cfg(feature = "sqlite")]
pub use store::SqliteSaveStore;
pub use store::{FileSaveStore, MemorySaveStore, SaveSink, SaveStore};
pub use sync::SynchronizationPointFailureReason;
pub use time_manager::{AdvanceState, FederateTime, TimeCoordinator, TimeSnapshot};
