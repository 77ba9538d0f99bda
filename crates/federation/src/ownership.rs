//! Attribute ownership tracking.
//!
//! Each object instance keeps one [`AttributeInstance`] per attribute of its
//! class. An attribute is owned by at most one federate; ownership moves only
//! through the operations on [`ObjectInstanceState`], which are always called
//! with the instance's write lock held so that a multi-attribute request is
//! applied atomically.
//!
//! Every operation validates all of its attributes before changing any of
//! them. A failed call leaves the instance untouched.

use crate::callback::{AttributeSet, Callback, Outbox};
use crate::error::OwnershipError;
use crate::proxy::Publications;
use ohla_core::{
    AttributeHandle, FederateHandle, ObjectClassHandle, ObjectInstanceHandle, RegionHandle,
    PRIVILEGE_TO_DELETE,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tokio::sync::RwLock;
use tracing::debug;

/// Externally visible ownership state of one attribute instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnershipState {
    Unowned,
    Owned(FederateHandle),
    OwnedDivestiturePending {
        owner: FederateHandle,
        tag: Vec<u8>,
    },
    OwnedAcquisitionPending {
        owner: FederateHandle,
        requesters: Vec<FederateHandle>,
        tag: Vec<u8>,
    },
}

/// Ownership bookkeeping for one attribute of one object instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeInstance {
    owner: Option<FederateHandle>,
    /// Tag of a negotiated divestiture in progress.
    divesting: Option<Vec<u8>>,
    /// Intrusive acquirers in arrival order.
    requesters: VecDeque<(FederateHandle, Vec<u8>)>,
    update_regions: BTreeSet<RegionHandle>,
    /// Associations made by federates that do not own the attribute yet.
    pending_regions: BTreeMap<FederateHandle, BTreeSet<RegionHandle>>,
}

impl AttributeInstance {
    fn owned_by(owner: Option<FederateHandle>) -> Self {
        Self {
            owner,
            ..Self::default()
        }
    }

    pub fn owner(&self) -> Option<FederateHandle> {
        self.owner
    }

    pub fn state(&self) -> OwnershipState {
        match (self.owner, &self.divesting, self.requesters.front()) {
            (None, _, _) => OwnershipState::Unowned,
            (Some(owner), _, Some((_, tag))) => OwnershipState::OwnedAcquisitionPending {
                owner,
                requesters: self.requesters.iter().map(|(r, _)| *r).collect(),
                tag: tag.clone(),
            },
            (Some(owner), Some(tag), None) => OwnershipState::OwnedDivestiturePending {
                owner,
                tag: tag.clone(),
            },
            (Some(owner), None, None) => OwnershipState::Owned(owner),
        }
    }

    pub fn update_regions(&self) -> &BTreeSet<RegionHandle> {
        &self.update_regions
    }

    fn is_requested_by(&self, federate: FederateHandle) -> bool {
        self.requesters.iter().any(|(r, _)| *r == federate)
    }

    fn give_to(&mut self, owner: FederateHandle) {
        self.owner = Some(owner);
        self.divesting = None;
        self.requesters.retain(|(r, _)| *r != owner);
        self.update_regions = self.pending_regions.remove(&owner).unwrap_or_default();
    }

    fn release(&mut self) {
        self.owner = None;
        self.divesting = None;
        self.update_regions.clear();
    }

    /// Hand the attribute to the longest-waiting acquirer, or leave it
    /// unowned when nobody is waiting.
    fn pass_on(&mut self) -> Option<(FederateHandle, Vec<u8>)> {
        match self.requesters.pop_front() {
            Some((next, tag)) => {
                self.give_to(next);
                Some((next, tag))
            }
            None => {
                self.release();
                None
            }
        }
    }

    fn forget(&mut self, federate: FederateHandle) {
        self.requesters.retain(|(r, _)| *r != federate);
        self.pending_regions.remove(&federate);
    }
}

/// Result of an `attributeOwnershipAcquisitionIfAvailable` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionOutcome {
    pub acquired: AttributeSet,
    pub unavailable: AttributeSet,
}

/// Ownership moves collected during one operation, reported per new owner.
#[derive(Default)]
struct Transfers {
    by_owner: BTreeMap<FederateHandle, (AttributeSet, Vec<u8>)>,
}

impl Transfers {
    fn record(&mut self, owner: FederateHandle, attribute: AttributeHandle, tag: Vec<u8>) {
        self.by_owner
            .entry(owner)
            .or_insert_with(|| (AttributeSet::new(), tag))
            .0
            .insert(attribute);
    }

    fn notify(self, object: ObjectInstanceHandle, out: &mut Outbox) {
        for (owner, (attributes, tag)) in self.by_owner {
            out.push(
                owner,
                Callback::AttributeOwnershipAcquisitionNotification {
                    object,
                    attributes,
                    tag,
                },
            );
        }
    }
}

fn push_grouped<F>(groups: BTreeMap<FederateHandle, AttributeSet>, out: &mut Outbox, make: F)
where
    F: Fn(AttributeSet) -> Callback,
{
    for (federate, attributes) in groups {
        if !attributes.is_empty() {
            out.push(federate, make(attributes));
        }
    }
}

/// Mutable state of an object instance, guarded by the instance lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInstanceState {
    object: ObjectInstanceHandle,
    class: ObjectClassHandle,
    attributes: BTreeMap<AttributeHandle, AttributeInstance>,
    /// Federates that registered or discovered the instance.
    known_by: BTreeSet<FederateHandle>,
    pending_deletion: bool,
}

impl ObjectInstanceState {
    /// State of a freshly registered instance. `initial_owner` decides the
    /// owner of each attribute of the class.
    pub(crate) fn new<F>(
        object: ObjectInstanceHandle,
        class: ObjectClassHandle,
        attributes: impl IntoIterator<Item = AttributeHandle>,
        registrar: FederateHandle,
        initial_owner: F,
    ) -> Self
    where
        F: Fn(AttributeHandle) -> Option<FederateHandle>,
    {
        Self {
            object,
            class,
            attributes: attributes
                .into_iter()
                .map(|a| (a, AttributeInstance::owned_by(initial_owner(a))))
                .collect(),
            known_by: BTreeSet::from([registrar]),
            pending_deletion: false,
        }
    }

    pub fn object(&self) -> ObjectInstanceHandle {
        self.object
    }

    pub fn class(&self) -> ObjectClassHandle {
        self.class
    }

    pub fn is_pending_deletion(&self) -> bool {
        self.pending_deletion
    }

    pub(crate) fn mark_pending_deletion(&mut self) {
        self.pending_deletion = true;
    }

    pub fn known_by(&self) -> &BTreeSet<FederateHandle> {
        &self.known_by
    }

    pub(crate) fn add_known(&mut self, federate: FederateHandle) -> bool {
        self.known_by.insert(federate)
    }

    pub(crate) fn remove_known(&mut self, federate: FederateHandle) {
        self.known_by.remove(&federate);
    }

    pub fn attribute(&self, attribute: AttributeHandle) -> Result<&AttributeInstance, OwnershipError> {
        self.attributes
            .get(&attribute)
            .ok_or(OwnershipError::AttributeNotDefined(attribute))
    }

    fn attribute_mut(
        &mut self,
        attribute: AttributeHandle,
    ) -> Result<&mut AttributeInstance, OwnershipError> {
        self.attributes
            .get_mut(&attribute)
            .ok_or(OwnershipError::AttributeNotDefined(attribute))
    }

    pub fn owner(&self, attribute: AttributeHandle) -> Option<FederateHandle> {
        self.attributes.get(&attribute).and_then(|a| a.owner)
    }

    pub fn owned_by(&self, federate: FederateHandle) -> AttributeSet {
        self.attributes
            .iter()
            .filter(|(_, a)| a.owner == Some(federate))
            .map(|(handle, _)| *handle)
            .collect()
    }

    pub fn holds_delete_privilege(&self, federate: FederateHandle) -> bool {
        self.owner(PRIVILEGE_TO_DELETE) == Some(federate)
    }

    fn require_owner(
        &self,
        federate: FederateHandle,
        attributes: &AttributeSet,
    ) -> Result<(), OwnershipError> {
        for attribute in attributes {
            if self.attribute(*attribute)?.owner != Some(federate) {
                return Err(OwnershipError::AttributeNotOwned(*attribute));
            }
        }
        Ok(())
    }

    fn require_acquirable(
        &self,
        federate: FederateHandle,
        attributes: &AttributeSet,
        publications: &dyn Publications,
    ) -> Result<(), OwnershipError> {
        for attribute in attributes {
            let instance = self.attribute(*attribute)?;
            if !publications.publishes(federate, self.class, *attribute) {
                return Err(OwnershipError::AttributeNotPublished(*attribute));
            }
            if instance.owner == Some(federate) {
                return Err(OwnershipError::FederateOwnsAttributes(*attribute));
            }
            if instance.is_requested_by(federate) {
                return Err(OwnershipError::AttributeAlreadyBeingAcquired(*attribute));
            }
        }
        Ok(())
    }

    /// Release `attributes` now. Each goes to its first pending acquirer if
    /// there is one, otherwise it becomes unowned.
    ///
    /// The delete privilege is no exception: released with nobody waiting,
    /// it is left unowned and the instance cannot be deleted until some
    /// federate acquires the privilege again.
    pub(crate) fn unconditional_divest(
        &mut self,
        federate: FederateHandle,
        attributes: &AttributeSet,
        out: &mut Outbox,
    ) -> Result<(), OwnershipError> {
        self.require_owner(federate, attributes)?;

        let mut transfers = Transfers::default();
        for attribute in attributes {
            if let Some((next, tag)) = self.attribute_mut(*attribute)?.pass_on() {
                transfers.record(next, *attribute, tag);
            }
        }
        debug!(
            object = %self.object,
            federate = %federate,
            count = attributes.len(),
            "Unconditional divestiture"
        );
        transfers.notify(self.object, out);
        Ok(())
    }

    /// Offer `attributes` for divestiture. Nothing is released until the
    /// owner confirms.
    pub(crate) fn negotiated_divest(
        &mut self,
        federate: FederateHandle,
        attributes: &AttributeSet,
        tag: &[u8],
        publications: &dyn Publications,
        out: &mut Outbox,
    ) -> Result<(), OwnershipError> {
        self.require_owner(federate, attributes)?;
        for attribute in attributes {
            if self.attribute(*attribute)?.divesting.is_some() {
                return Err(OwnershipError::AttributeAlreadyBeingDivested(*attribute));
            }
        }

        let mut confirm = AttributeSet::new();
        let mut offers: BTreeMap<FederateHandle, AttributeSet> = BTreeMap::new();
        for attribute in attributes {
            let class = self.class;
            let instance = self.attribute_mut(*attribute)?;
            instance.divesting = Some(tag.to_vec());
            if instance.requesters.is_empty() {
                for candidate in publications.publishers_of(class, *attribute) {
                    if candidate != federate {
                        offers.entry(candidate).or_default().insert(*attribute);
                    }
                }
            } else {
                confirm.insert(*attribute);
            }
        }

        let object = self.object;
        if !confirm.is_empty() {
            out.push(
                federate,
                Callback::RequestDivestitureConfirmation {
                    object,
                    attributes: confirm,
                },
            );
        }
        push_grouped(offers, out, |attributes| {
            Callback::RequestAttributeOwnershipAssumption {
                object,
                attributes,
                tag: tag.to_vec(),
            }
        });
        Ok(())
    }

    /// Complete a negotiated divestiture.
    pub(crate) fn confirm_divest(
        &mut self,
        federate: FederateHandle,
        attributes: &AttributeSet,
        out: &mut Outbox,
    ) -> Result<(), OwnershipError> {
        self.require_owner(federate, attributes)?;
        for attribute in attributes {
            if self.attribute(*attribute)?.divesting.is_none() {
                return Err(OwnershipError::AttributeDivestitureWasNotRequested(*attribute));
            }
        }

        let mut transfers = Transfers::default();
        for attribute in attributes {
            if let Some((next, tag)) = self.attribute_mut(*attribute)?.pass_on() {
                transfers.record(next, *attribute, tag);
            }
        }
        transfers.notify(self.object, out);
        Ok(())
    }

    pub(crate) fn cancel_divestiture(
        &mut self,
        federate: FederateHandle,
        attributes: &AttributeSet,
    ) -> Result<(), OwnershipError> {
        self.require_owner(federate, attributes)?;
        for attribute in attributes {
            if self.attribute(*attribute)?.divesting.is_none() {
                return Err(OwnershipError::AttributeDivestitureWasNotRequested(*attribute));
            }
        }
        for attribute in attributes {
            self.attribute_mut(*attribute)?.divesting = None;
        }
        Ok(())
    }

    /// Take every unowned attribute of `attributes`; report the rest as
    /// unavailable. Never queues the requester.
    pub(crate) fn acquire_if_available(
        &mut self,
        federate: FederateHandle,
        attributes: &AttributeSet,
        tag: &[u8],
        publications: &dyn Publications,
        out: &mut Outbox,
    ) -> Result<AcquisitionOutcome, OwnershipError> {
        self.require_acquirable(federate, attributes, publications)?;

        let mut outcome = AcquisitionOutcome::default();
        for attribute in attributes {
            let instance = self.attribute_mut(*attribute)?;
            if instance.owner.is_none() {
                instance.give_to(federate);
                outcome.acquired.insert(*attribute);
            } else {
                outcome.unavailable.insert(*attribute);
            }
        }

        if !outcome.acquired.is_empty() {
            out.push(
                federate,
                Callback::AttributeOwnershipAcquisitionNotification {
                    object: self.object,
                    attributes: outcome.acquired.clone(),
                    tag: tag.to_vec(),
                },
            );
        }
        if !outcome.unavailable.is_empty() {
            out.push(
                federate,
                Callback::AttributeOwnershipUnavailable {
                    object: self.object,
                    attributes: outcome.unavailable.clone(),
                },
            );
        }
        debug!(
            object = %self.object,
            federate = %federate,
            acquired = outcome.acquired.len(),
            unavailable = outcome.unavailable.len(),
            "Acquisition if available"
        );
        Ok(outcome)
    }

    /// Intrusive acquisition. Unowned attributes are taken immediately and
    /// returned; owned ones queue the requester and ask the owner to let go.
    pub(crate) fn acquire(
        &mut self,
        federate: FederateHandle,
        attributes: &AttributeSet,
        tag: &[u8],
        publications: &dyn Publications,
        out: &mut Outbox,
    ) -> Result<AttributeSet, OwnershipError> {
        self.require_acquirable(federate, attributes, publications)?;

        let mut acquired = AttributeSet::new();
        let mut confirm: BTreeMap<FederateHandle, AttributeSet> = BTreeMap::new();
        let mut release: BTreeMap<FederateHandle, AttributeSet> = BTreeMap::new();
        for attribute in attributes {
            let instance = self.attribute_mut(*attribute)?;
            match instance.owner {
                None => {
                    instance.give_to(federate);
                    acquired.insert(*attribute);
                }
                Some(owner) => {
                    instance.requesters.push_back((federate, tag.to_vec()));
                    let group = if instance.divesting.is_some() {
                        &mut confirm
                    } else {
                        &mut release
                    };
                    group.entry(owner).or_default().insert(*attribute);
                }
            }
        }

        let object = self.object;
        if !acquired.is_empty() {
            out.push(
                federate,
                Callback::AttributeOwnershipAcquisitionNotification {
                    object,
                    attributes: acquired.clone(),
                    tag: tag.to_vec(),
                },
            );
        }
        push_grouped(confirm, out, |attributes| {
            Callback::RequestDivestitureConfirmation { object, attributes }
        });
        push_grouped(release, out, |attributes| {
            Callback::RequestAttributeOwnershipRelease {
                object,
                attributes,
                tag: tag.to_vec(),
            }
        });
        Ok(acquired)
    }

    /// Release the subset of `attributes` somebody is waiting for.
    pub(crate) fn divestiture_if_wanted(
        &mut self,
        federate: FederateHandle,
        attributes: &AttributeSet,
        out: &mut Outbox,
    ) -> Result<AttributeSet, OwnershipError> {
        self.require_owner(federate, attributes)?;

        let mut released = AttributeSet::new();
        let mut transfers = Transfers::default();
        for attribute in attributes {
            let instance = self.attribute_mut(*attribute)?;
            if !instance.requesters.is_empty() {
                if let Some((next, tag)) = instance.pass_on() {
                    transfers.record(next, *attribute, tag);
                    released.insert(*attribute);
                }
            }
        }
        transfers.notify(self.object, out);
        Ok(released)
    }

    pub(crate) fn cancel_acquisition(
        &mut self,
        federate: FederateHandle,
        attributes: &AttributeSet,
        out: &mut Outbox,
    ) -> Result<(), OwnershipError> {
        for attribute in attributes {
            let instance = self.attribute(*attribute)?;
            if instance.owner == Some(federate) {
                return Err(OwnershipError::AttributeAlreadyOwned(*attribute));
            }
            if !instance.is_requested_by(federate) {
                return Err(OwnershipError::AttributeAcquisitionWasNotRequested(*attribute));
            }
        }
        for attribute in attributes {
            self.attribute_mut(*attribute)?
                .requesters
                .retain(|(r, _)| *r != federate);
        }
        out.push(
            federate,
            Callback::ConfirmAttributeOwnershipAcquisitionCancellation {
                object: self.object,
                attributes: attributes.clone(),
            },
        );
        Ok(())
    }

    /// Drop `federate`'s stake in `attributes`: owned ones are passed on,
    /// pending acquisitions are withdrawn. Used when it stops publishing.
    pub(crate) fn withdraw(
        &mut self,
        federate: FederateHandle,
        attributes: &AttributeSet,
        out: &mut Outbox,
    ) {
        let mut transfers = Transfers::default();
        for (handle, instance) in self
            .attributes
            .iter_mut()
            .filter(|(h, _)| attributes.contains(*h))
        {
            instance.forget(federate);
            if instance.owner == Some(federate) {
                if let Some((next, tag)) = instance.pass_on() {
                    transfers.record(next, *handle, tag);
                }
            }
        }
        transfers.notify(self.object, out);
    }

    /// Remove every trace of a resigning federate.
    pub(crate) fn release_federate(&mut self, federate: FederateHandle, out: &mut Outbox) {
        let all: AttributeSet = self.attributes.keys().copied().collect();
        self.withdraw(federate, &all, out);
        self.known_by.remove(&federate);
    }

    pub(crate) fn query_ownership(
        &self,
        requester: FederateHandle,
        attribute: AttributeHandle,
        out: &mut Outbox,
    ) -> Result<(), OwnershipError> {
        let callback = match self.attribute(attribute)?.owner {
            Some(owner) => Callback::InformAttributeOwnership {
                object: self.object,
                attribute,
                owner,
            },
            None => Callback::AttributeIsNotOwned {
                object: self.object,
                attribute,
            },
        };
        out.push(requester, callback);
        Ok(())
    }

    /// Associate update regions. Associations made by a non-owner wait until
    /// it acquires the attribute.
    pub(crate) fn associate_regions(
        &mut self,
        federate: FederateHandle,
        attributes: &AttributeSet,
        regions: &BTreeSet<RegionHandle>,
    ) -> Result<(), OwnershipError> {
        for attribute in attributes {
            self.attribute(*attribute)?;
        }
        for attribute in attributes {
            let instance = self.attribute_mut(*attribute)?;
            if instance.owner == Some(federate) {
                instance.update_regions.extend(regions.iter().copied());
            } else {
                instance
                    .pending_regions
                    .entry(federate)
                    .or_default()
                    .extend(regions.iter().copied());
            }
        }
        Ok(())
    }

    pub(crate) fn unassociate_regions(
        &mut self,
        federate: FederateHandle,
        attributes: &AttributeSet,
        regions: &BTreeSet<RegionHandle>,
    ) -> Result<(), OwnershipError> {
        for attribute in attributes {
            self.attribute(*attribute)?;
        }
        for attribute in attributes {
            let instance = self.attribute_mut(*attribute)?;
            if instance.owner == Some(federate) {
                instance.update_regions.retain(|r| !regions.contains(r));
            } else if let Some(pending) = instance.pending_regions.get_mut(&federate) {
                pending.retain(|r| !regions.contains(r));
                if pending.is_empty() {
                    instance.pending_regions.remove(&federate);
                }
            }
        }
        Ok(())
    }
}

/// A registered object instance. Identity is immutable; everything that
/// changes lives behind the instance lock.
#[derive(Debug)]
pub struct ObjectInstance {
    handle: ObjectInstanceHandle,
    class: ObjectClassHandle,
    name: String,
    producer: FederateHandle,
    pub(crate) state: RwLock<ObjectInstanceState>,
}

impl ObjectInstance {
    pub(crate) fn new(
        name: String,
        producer: FederateHandle,
        state: ObjectInstanceState,
    ) -> Self {
        Self {
            handle: state.object(),
            class: state.class(),
            name,
            producer,
            state: RwLock::new(state),
        }
    }

    pub fn handle(&self) -> ObjectInstanceHandle {
        self.handle
    }

    pub fn class(&self) -> ObjectClassHandle {
        self.class
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn producer(&self) -> FederateHandle {
        self.producer
    }
}
