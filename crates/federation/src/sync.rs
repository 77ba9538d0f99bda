//! Federation synchronization points.

use crate::callback::{Callback, Outbox};
use crate::error::SyncError;
use ohla_core::FederateHandle;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Why a synchronization point registration was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynchronizationPointFailureReason {
    SynchronizationPointLabelNotUnique,
    SynchronizationSetMemberNotJoined,
}

#[derive(Debug)]
struct SyncPoint {
    tag: Vec<u8>,
    /// No explicit set was given; late joiners are added.
    whole_federation: bool,
    members: BTreeSet<FederateHandle>,
    waiting: BTreeSet<FederateHandle>,
    failed: BTreeSet<FederateHandle>,
}

/// Announced synchronization points of one federation execution.
#[derive(Debug, Default)]
pub(crate) struct SyncPoints {
    points: BTreeMap<String, SyncPoint>,
}

impl SyncPoints {
    /// Register `label`. The outcome reaches the requester as a callback;
    /// members are sent the announcement.
    pub(crate) fn register(
        &mut self,
        requester: FederateHandle,
        label: &str,
        tag: Vec<u8>,
        set: Option<BTreeSet<FederateHandle>>,
        joined: &BTreeSet<FederateHandle>,
        out: &mut Outbox,
    ) {
        if self.points.contains_key(label) {
            out.push(
                requester,
                Callback::SynchronizationPointRegistrationFailed {
                    label: label.to_string(),
                    reason: SynchronizationPointFailureReason::SynchronizationPointLabelNotUnique,
                },
            );
            return;
        }

        let whole_federation = set.is_none();
        let members = set.unwrap_or_else(|| joined.clone());
        if !members.is_subset(joined) {
            out.push(
                requester,
                Callback::SynchronizationPointRegistrationFailed {
                    label: label.to_string(),
                    reason: SynchronizationPointFailureReason::SynchronizationSetMemberNotJoined,
                },
            );
            return;
        }

        out.push(
            requester,
            Callback::SynchronizationPointRegistrationSucceeded(label.to_string()),
        );
        for member in &members {
            out.push(
                *member,
                Callback::AnnounceSynchronizationPoint {
                    label: label.to_string(),
                    tag: tag.clone(),
                },
            );
        }

        info!(label = %label, members = members.len(), "Synchronization point registered");
        self.points.insert(
            label.to_string(),
            SyncPoint {
                tag,
                whole_federation,
                waiting: members.clone(),
                members,
                failed: BTreeSet::new(),
            },
        );
    }

    pub(crate) fn achieved(
        &mut self,
        federate: FederateHandle,
        label: &str,
        successful: bool,
        out: &mut Outbox,
    ) -> Result<(), SyncError> {
        let point = self
            .points
            .get_mut(label)
            .filter(|p| p.waiting.contains(&federate))
            .ok_or_else(|| SyncError::SynchronizationPointLabelNotAnnounced(label.to_string()))?;

        point.waiting.remove(&federate);
        if !successful {
            point.failed.insert(federate);
        }
        debug!(label = %label, federate = %federate, successful, "Synchronization point achieved");

        self.complete_if_ready(label, out);
        Ok(())
    }

    /// Announce whole-federation points to a late joiner.
    pub(crate) fn add_federate(&mut self, federate: FederateHandle, out: &mut Outbox) {
        for (label, point) in self.points.iter_mut().filter(|(_, p)| p.whole_federation) {
            point.members.insert(federate);
            point.waiting.insert(federate);
            out.push(
                federate,
                Callback::AnnounceSynchronizationPoint {
                    label: label.clone(),
                    tag: point.tag.clone(),
                },
            );
        }
    }

    pub(crate) fn remove_federate(&mut self, federate: FederateHandle, out: &mut Outbox) {
        let mut touched = Vec::new();
        for (label, point) in self.points.iter_mut() {
            if point.members.remove(&federate) {
                point.waiting.remove(&federate);
                point.failed.remove(&federate);
                touched.push(label.clone());
            }
        }
        for label in touched {
            self.complete_if_ready(&label, out);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.points.clear();
    }

    fn complete_if_ready(&mut self, label: &str, out: &mut Outbox) {
        let ready = self
            .points
            .get(label)
            .map(|p| p.waiting.is_empty())
            .unwrap_or(false);
        if !ready {
            return;
        }
        if let Some(point) = self.points.remove(label) {
            info!(label = %label, failed = point.failed.len(), "Federation synchronized");
            for member in &point.members {
                out.push(
                    *member,
                    Callback::FederationSynchronized {
                        label: label.to_string(),
                        failed: point.failed.clone(),
                    },
                );
            }
        }
    }
}
