//! Error types for the federation execution services.
//!
//! Every synchronous failure a federate can observe is a variant of one of
//! the per-area enums below, named after the HLA exception it stands for.
//! [`ServiceError`] is their closed union and is what travels back in a
//! [`Response`](crate::protocol::Response).

use ohla_core::{
    AttributeHandle, FederateHandle, InteractionClassHandle, LogicalTime,
    LogicalTimeInterval, MessageRetractionHandle, ObjectClassHandle, ObjectInstanceHandle,
    ParameterHandle,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures shared by every service: membership and session state.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum FederationError {
    #[error("Federation execution already exists: {0}")]
    FederationExecutionAlreadyExists(String),

    #[error("Federation execution does not exist: {0}")]
    FederationExecutionDoesNotExist(String),

    #[error("Federates currently joined to {0}")]
    FederatesCurrentlyJoined(String),

    #[error("Federate name already in use: {0}")]
    FederateNameAlreadyInUse(String),

    #[error("Federate {0} is not an execution member")]
    FederateNotExecutionMember(FederateHandle),

    #[error("Federate {0} still owns attributes")]
    FederateOwnsAttributes(FederateHandle),

    #[error("Save in progress")]
    SaveInProgress,

    #[error("Restore in progress")]
    RestoreInProgress,
}

/// Publication and subscription failures.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeclarationError {
    #[error(transparent)]
    Federation(#[from] FederationError),

    #[error("Object class not defined: {0}")]
    ObjectClassNotDefined(ObjectClassHandle),

    #[error("Attribute not defined: {0}")]
    AttributeNotDefined(AttributeHandle),

    #[error("Interaction class not defined: {0}")]
    InteractionClassNotDefined(InteractionClassHandle),
}

/// Object registration, update, deletion and interaction failures.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectError {
    #[error(transparent)]
    Federation(#[from] FederationError),

    #[error("Object class not defined: {0}")]
    ObjectClassNotDefined(ObjectClassHandle),

    #[error("Object class not published: {0}")]
    ObjectClassNotPublished(ObjectClassHandle),

    #[error("Object instance not known: {0}")]
    ObjectInstanceNotKnown(ObjectInstanceHandle),

    #[error("Object instance name not known: {0}")]
    ObjectInstanceNameNotKnown(String),

    #[error("Object instance name not reserved: {0}")]
    ObjectInstanceNameNotReserved(String),

    #[error("Object instance name in use: {0}")]
    ObjectInstanceNameInUse(String),

    #[error("Illegal name: {0}")]
    IllegalName(String),

    #[error("Attribute not defined: {0}")]
    AttributeNotDefined(AttributeHandle),

    #[error("Attribute not owned: {0}")]
    AttributeNotOwned(AttributeHandle),

    #[error("Delete privilege not held for object instance {0}")]
    DeletePrivilegeNotHeld(ObjectInstanceHandle),

    #[error("Federate owns attributes of object instance {0}")]
    FederateOwnsAttributes(ObjectInstanceHandle),

    #[error("Interaction class not defined: {0}")]
    InteractionClassNotDefined(InteractionClassHandle),

    #[error("Interaction class not published: {0}")]
    InteractionClassNotPublished(InteractionClassHandle),

    #[error("Interaction parameter not defined: {0}")]
    InteractionParameterNotDefined(ParameterHandle),

    #[error("Invalid logical time: {0}")]
    InvalidLogicalTime(LogicalTime),
}

/// Attribute ownership management failures.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnershipError {
    #[error(transparent)]
    Federation(#[from] FederationError),

    #[error("Object instance not known: {0}")]
    ObjectInstanceNotKnown(ObjectInstanceHandle),

    #[error("Attribute not defined: {0}")]
    AttributeNotDefined(AttributeHandle),

    #[error("Attribute not owned: {0}")]
    AttributeNotOwned(AttributeHandle),

    #[error("Attribute not published: {0}")]
    AttributeNotPublished(AttributeHandle),

    #[error("Federate already owns attribute {0}")]
    FederateOwnsAttributes(AttributeHandle),

    #[error("Attribute already being divested: {0}")]
    AttributeAlreadyBeingDivested(AttributeHandle),

    #[error("Attribute divestiture was not requested: {0}")]
    AttributeDivestitureWasNotRequested(AttributeHandle),

    #[error("Attribute already being acquired: {0}")]
    AttributeAlreadyBeingAcquired(AttributeHandle),

    #[error("Attribute acquisition was not requested: {0}")]
    AttributeAcquisitionWasNotRequested(AttributeHandle),

    #[error("Attribute already owned: {0}")]
    AttributeAlreadyOwned(AttributeHandle),
}

/// Time management failures.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeError {
    #[error(transparent)]
    Federation(#[from] FederationError),

    #[error("Time regulation already enabled")]
    TimeRegulationAlreadyEnabled,

    #[error("Time regulation is not enabled")]
    TimeRegulationIsNotEnabled,

    #[error("Time constrained already enabled")]
    TimeConstrainedAlreadyEnabled,

    #[error("Time constrained is not enabled")]
    TimeConstrainedIsNotEnabled,

    #[error("Request for time constrained pending")]
    RequestForTimeConstrainedPending,

    #[error("Federate is in time advancing state")]
    InTimeAdvancingState,

    #[error("Invalid lookahead: {0}")]
    InvalidLookahead(LogicalTimeInterval),

    #[error("Logical time already passed: {0}")]
    LogicalTimeAlreadyPassed(LogicalTime),

    #[error("Invalid message retraction handle: {0}")]
    InvalidMessageRetractionHandle(MessageRetractionHandle),

    #[error("Message can no longer be retracted: {0}")]
    MessageCanNoLongerBeRetracted(MessageRetractionHandle),
}

/// Federation save failures.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveError {
    #[error(transparent)]
    Federation(#[from] FederationError),

    #[error("Save not initiated")]
    SaveNotInitiated,

    #[error("Federate has not begun save")]
    FederateHasNotBegunSave,

    #[error("Save not in progress")]
    SaveNotInProgress,

    #[error("Logical time already passed: {0}")]
    LogicalTimeAlreadyPassed(LogicalTime),
}

/// Federation restore failures.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreError {
    #[error(transparent)]
    Federation(#[from] FederationError),

    #[error("Restore not requested")]
    RestoreNotRequested,

    #[error("Restore not in progress")]
    RestoreNotInProgress,
}

/// Synchronization point failures.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncError {
    #[error(transparent)]
    Federation(#[from] FederationError),

    #[error("Synchronization point label not announced: {0}")]
    SynchronizationPointLabelNotAnnounced(String),
}

/// Closed union of every service failure.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceError {
    #[error(transparent)]
    Federation(#[from] FederationError),
    #[error(transparent)]
    Declaration(#[from] DeclarationError),
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error(transparent)]
    Ownership(#[from] OwnershipError),
    #[error(transparent)]
    Time(#[from] TimeError),
    #[error(transparent)]
    Save(#[from] SaveError),
    #[error(transparent)]
    Restore(#[from] RestoreError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Errors from reading or writing a save artifact.
#[derive(Debug, Error)]
pub enum SaveFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Not a save artifact")]
    BadMagic,

    #[error("Unsupported save format version {0}")]
    UnsupportedVersion(u16),

    #[error("Save artifact truncated")]
    Truncated,

    #[error("Save artifact checksum mismatch")]
    ChecksumMismatch,

    #[error("Record of {0} bytes exceeds the format limit")]
    RecordTooLarge(usize),

    #[error("Unknown buffered message type {0}")]
    UnknownMessageType(u8),

    #[error("{0} unexpected bytes after the message log")]
    TrailingData(usize),
}

/// Errors raised by save stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Save backend not available in this build: {0}")]
    BackendUnavailable(&'static str),
}
