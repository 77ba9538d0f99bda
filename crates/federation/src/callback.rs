//! Callbacks the RTI delivers to federates, and the per-federate queue they
//! are delivered through.
//!
//! Every joined federate owns one unbounded channel. The coordinator only
//! ever pushes into it; the federate drains it at its own callback-delivery
//! point ([`CallbackQueue::evoke_callback`] and friends). Pushes to one
//! channel are ordered, so a federate sees its notifications in the order
//! the state changes that caused them were made.

use crate::save::{RestoreFailureReason, RestoreStatus, SaveFailureReason, SaveStatus};
use crate::sync::SynchronizationPointFailureReason;
use ohla_core::{
    AttributeHandle, FederateHandle, InteractionClassHandle, LogicalTime,
    MessageRetractionHandle, ObjectClassHandle, ObjectInstanceHandle, OrderType, ParameterHandle,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;

/// Attribute values carried by an update or reflection.
pub type AttributeValues = BTreeMap<AttributeHandle, Vec<u8>>;

/// Parameter values carried by an interaction.
pub type ParameterValues = BTreeMap<ParameterHandle, Vec<u8>>;

/// A set of attributes of one object instance.
pub type AttributeSet = BTreeSet<AttributeHandle>;

/// Save status of one federate, as reported by a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederateSaveStatus {
    pub federate: FederateHandle,
    pub status: SaveStatus,
}

/// Restore status of one federate, as reported by a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederateRestoreStatus {
    pub federate: FederateHandle,
    pub status: RestoreStatus,
}

/// A notification delivered to a federate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Callback {
    ObjectInstanceNameReservationSucceeded(String),
    ObjectInstanceNameReservationFailed(String),
    DiscoverObjectInstance {
        object: ObjectInstanceHandle,
        class: ObjectClassHandle,
        name: String,
        producer: FederateHandle,
    },
    ReflectAttributeValues {
        object: ObjectInstanceHandle,
        values: AttributeValues,
        tag: Vec<u8>,
        time: Option<LogicalTime>,
        order: OrderType,
        retraction: Option<MessageRetractionHandle>,
        producer: FederateHandle,
    },
    ReceiveInteraction {
        class: InteractionClassHandle,
        parameters: ParameterValues,
        tag: Vec<u8>,
        time: Option<LogicalTime>,
        order: OrderType,
        retraction: Option<MessageRetractionHandle>,
        producer: FederateHandle,
    },
    RemoveObjectInstance {
        object: ObjectInstanceHandle,
        tag: Vec<u8>,
        time: Option<LogicalTime>,
        order: OrderType,
        retraction: Option<MessageRetractionHandle>,
        producer: FederateHandle,
    },
    RequestRetraction(MessageRetractionHandle),

    AttributeOwnershipAcquisitionNotification {
        object: ObjectInstanceHandle,
        attributes: AttributeSet,
        tag: Vec<u8>,
    },
    AttributeOwnershipUnavailable {
        object: ObjectInstanceHandle,
        attributes: AttributeSet,
    },
    RequestDivestitureConfirmation {
        object: ObjectInstanceHandle,
        attributes: AttributeSet,
    },
    RequestAttributeOwnershipRelease {
        object: ObjectInstanceHandle,
        attributes: AttributeSet,
        tag: Vec<u8>,
    },
    RequestAttributeOwnershipAssumption {
        object: ObjectInstanceHandle,
        attributes: AttributeSet,
        tag: Vec<u8>,
    },
    ConfirmAttributeOwnershipAcquisitionCancellation {
        object: ObjectInstanceHandle,
        attributes: AttributeSet,
    },
    InformAttributeOwnership {
        object: ObjectInstanceHandle,
        attribute: AttributeHandle,
        owner: FederateHandle,
    },
    AttributeIsNotOwned {
        object: ObjectInstanceHandle,
        attribute: AttributeHandle,
    },

    TimeRegulationEnabled(LogicalTime),
    TimeConstrainedEnabled(LogicalTime),
    TimeAdvanceGrant(LogicalTime),

    SynchronizationPointRegistrationSucceeded(String),
    SynchronizationPointRegistrationFailed {
        label: String,
        reason: SynchronizationPointFailureReason,
    },
    AnnounceSynchronizationPoint {
        label: String,
        tag: Vec<u8>,
    },
    FederationSynchronized {
        label: String,
        failed: BTreeSet<FederateHandle>,
    },

    InitiateFederateSave {
        label: String,
        time: Option<LogicalTime>,
    },
    FederationSaved,
    FederationNotSaved(SaveFailureReason),
    FederationSaveStatusResponse(Vec<FederateSaveStatus>),

    RequestFederationRestoreSucceeded(String),
    RequestFederationRestoreFailed(String),
    FederationRestoreBegun,
    InitiateFederateRestore {
        label: String,
        name: String,
        handle: FederateHandle,
        state: Vec<u8>,
    },
    FederationRestored,
    FederationNotRestored(RestoreFailureReason),
    FederationRestoreStatusResponse(Vec<FederateRestoreStatus>),
}

impl Callback {
    /// Downgrade a timestamp-ordered message to receive order, keeping its
    /// timestamp. Used for receivers that are not time constrained.
    pub(crate) fn into_receive_order(mut self) -> Callback {
        match &mut self {
            Callback::ReflectAttributeValues { order, .. }
            | Callback::ReceiveInteraction { order, .. }
            | Callback::RemoveObjectInstance { order, .. } => *order = OrderType::Receive,
            _ => {}
        }
        self
    }
}

/// Callbacks produced by one state transition, delivered after it completes.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    entries: Vec<(FederateHandle, Callback)>,
}

impl Outbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, federate: FederateHandle, callback: Callback) {
        self.entries.push((federate, callback));
    }

    pub(crate) fn append(&mut self, other: Outbox) {
        self.entries.extend(other.entries);
    }

    /// True if any federate was granted a time advance.
    pub(crate) fn has_grant(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, c)| matches!(c, Callback::TimeAdvanceGrant(_)))
    }

    pub(crate) fn into_entries(self) -> Vec<(FederateHandle, Callback)> {
        self.entries
    }

    #[cfg(test)]
    pub(crate) fn for_federate(&self, federate: FederateHandle) -> Vec<&Callback> {
        self.entries
            .iter()
            .filter(|(f, _)| *f == federate)
            .map(|(_, c)| c)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Sending half of a federate's callback channel.
pub(crate) type CallbackSender = mpsc::UnboundedSender<Callback>;

/// Create a callback channel for a newly joined federate.
pub(crate) fn callback_channel() -> (CallbackSender, CallbackQueue) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (sender, CallbackQueue { receiver })
}

/// The federate-side callback-delivery point.
#[derive(Debug)]
pub struct CallbackQueue {
    receiver: mpsc::UnboundedReceiver<Callback>,
}

impl CallbackQueue {
    /// Deliver one pending callback, if any.
    pub fn evoke_callback(&mut self) -> Option<Callback> {
        self.receiver.try_recv().ok()
    }

    /// Deliver every pending callback.
    pub fn evoke_multiple_callbacks(&mut self) -> Vec<Callback> {
        let mut callbacks = Vec::new();
        while let Ok(callback) = self.receiver.try_recv() {
            callbacks.push(callback);
        }
        callbacks
    }

    /// Wait for the next callback. Returns `None` once the federate has been
    /// removed from its federation and the queue is drained.
    pub async fn next_callback(&mut self) -> Option<Callback> {
        self.receiver.recv().await
    }
}
