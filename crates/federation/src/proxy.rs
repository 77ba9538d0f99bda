//! Server-side representation of joined federates.

use crate::callback::{AttributeSet, Callback, CallbackSender, Outbox};
use crate::error::FederationError;
use ohla_core::{
    AttributeHandle, FederateHandle, HandleAllocator, InteractionClassHandle, ObjectClassHandle,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// What a federate publishes and subscribes to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declarations {
    pub published_attributes: BTreeMap<ObjectClassHandle, AttributeSet>,
    pub subscribed_attributes: BTreeMap<ObjectClassHandle, AttributeSet>,
    pub published_interactions: BTreeSet<InteractionClassHandle>,
    pub subscribed_interactions: BTreeSet<InteractionClassHandle>,
}

impl Declarations {
    pub fn publishes_attribute(&self, class: ObjectClassHandle, attribute: AttributeHandle) -> bool {
        self.published_attributes
            .get(&class)
            .map(|attrs| attrs.contains(&attribute))
            .unwrap_or(false)
    }

    pub fn publishes_class(&self, class: ObjectClassHandle) -> bool {
        self.published_attributes
            .get(&class)
            .map(|attrs| !attrs.is_empty())
            .unwrap_or(false)
    }

    pub fn subscribed_attributes_of(&self, class: ObjectClassHandle) -> Option<&AttributeSet> {
        self.subscribed_attributes
            .get(&class)
            .filter(|attrs| !attrs.is_empty())
    }

    pub fn published_attributes_of(&self, class: ObjectClassHandle) -> Option<&AttributeSet> {
        self.published_attributes.get(&class)
    }

    pub(crate) fn publish_attributes(&mut self, class: ObjectClassHandle, attributes: &AttributeSet) {
        self.published_attributes
            .entry(class)
            .or_default()
            .extend(attributes.iter().copied());
    }

    /// Returns the attributes that were published before the call.
    pub(crate) fn unpublish_attributes(
        &mut self,
        class: ObjectClassHandle,
        attributes: &AttributeSet,
    ) -> AttributeSet {
        let mut removed = AttributeSet::new();
        if let Some(published) = self.published_attributes.get_mut(&class) {
            for attribute in attributes {
                if published.remove(attribute) {
                    removed.insert(*attribute);
                }
            }
            if published.is_empty() {
                self.published_attributes.remove(&class);
            }
        }
        removed
    }

    /// Returns the attributes that were not subscribed before the call.
    pub(crate) fn subscribe_attributes(
        &mut self,
        class: ObjectClassHandle,
        attributes: &AttributeSet,
    ) -> AttributeSet {
        let subscribed = self.subscribed_attributes.entry(class).or_default();
        attributes
            .iter()
            .copied()
            .filter(|a| subscribed.insert(*a))
            .collect()
    }

    pub(crate) fn unsubscribe_attributes(&mut self, class: ObjectClassHandle, attributes: &AttributeSet) {
        if let Some(subscribed) = self.subscribed_attributes.get_mut(&class) {
            for attribute in attributes {
                subscribed.remove(attribute);
            }
            if subscribed.is_empty() {
                self.subscribed_attributes.remove(&class);
            }
        }
    }
}

/// One joined federate.
#[derive(Debug)]
pub struct FederateProxy {
    pub handle: FederateHandle,
    pub name: String,
    pub federate_type: String,
    pub declarations: Declarations,
    channel: CallbackSender,
}

impl FederateProxy {
    pub(crate) fn new(
        handle: FederateHandle,
        name: String,
        federate_type: String,
        channel: CallbackSender,
    ) -> Self {
        Self {
            handle,
            name,
            federate_type,
            declarations: Declarations::default(),
            channel,
        }
    }

    /// Same federate under a different handle; used when a restore re-keys
    /// proxies to the handles recorded in the save.
    pub(crate) fn rekeyed(
        self,
        handle: FederateHandle,
        name: String,
        declarations: Declarations,
    ) -> Self {
        Self {
            handle,
            name,
            federate_type: self.federate_type,
            declarations,
            channel: self.channel,
        }
    }

    pub(crate) fn notify(&self, callback: Callback) {
        if self.channel.send(callback).is_err() {
            debug!(federate = %self.handle, "Callback queue closed, dropping callback");
        }
    }
}

/// Answers publication questions for the ownership tracker.
pub(crate) trait Publications {
    fn publishes(
        &self,
        federate: FederateHandle,
        class: ObjectClassHandle,
        attribute: AttributeHandle,
    ) -> bool;

    fn publishers_of(&self, class: ObjectClassHandle, attribute: AttributeHandle) -> Vec<FederateHandle>;
}

/// Joined federates of one execution and the handle allocator for them.
#[derive(Debug, Default)]
pub(crate) struct FederateRegistry {
    proxies: BTreeMap<FederateHandle, FederateProxy>,
    handles: HandleAllocator<FederateHandle>,
}

impl FederateRegistry {
    pub(crate) fn get(&self, federate: FederateHandle) -> Result<&FederateProxy, FederationError> {
        self.proxies
            .get(&federate)
            .ok_or(FederationError::FederateNotExecutionMember(federate))
    }

    pub(crate) fn get_mut(
        &mut self,
        federate: FederateHandle,
    ) -> Result<&mut FederateProxy, FederationError> {
        self.proxies
            .get_mut(&federate)
            .ok_or(FederationError::FederateNotExecutionMember(federate))
    }

    pub(crate) fn ensure_member(&self, federate: FederateHandle) -> Result<(), FederationError> {
        self.get(federate).map(|_| ())
    }

    pub(crate) fn name_in_use(&self, name: &str) -> bool {
        self.proxies.values().any(|p| p.name == name)
    }

    pub(crate) fn allocate(&mut self) -> FederateHandle {
        self.handles.allocate()
    }

    pub(crate) fn next_handle_value(&self) -> u64 {
        self.handles.next_value()
    }

    pub(crate) fn insert(&mut self, proxy: FederateProxy) {
        self.handles.advance_past(proxy.handle.value());
        self.proxies.insert(proxy.handle, proxy);
    }

    pub(crate) fn remove(&mut self, federate: FederateHandle) -> Option<FederateProxy> {
        self.proxies.remove(&federate)
    }

    pub(crate) fn drain(&mut self) -> Vec<FederateProxy> {
        std::mem::take(&mut self.proxies).into_values().collect()
    }

    pub(crate) fn advance_handles_past(&mut self, raw: u64) {
        self.handles.advance_past(raw);
    }

    pub(crate) fn handles(&self) -> BTreeSet<FederateHandle> {
        self.proxies.keys().copied().collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &FederateProxy> {
        self.proxies.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.proxies.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub(crate) fn notify(&self, federate: FederateHandle, callback: Callback) {
        if let Some(proxy) = self.proxies.get(&federate) {
            proxy.notify(callback);
        }
    }

    pub(crate) fn notify_all(&self, callback: &Callback) {
        for proxy in self.proxies.values() {
            proxy.notify(callback.clone());
        }
    }

    /// Push every queued callback to its federate's channel, in order.
    pub(crate) fn deliver(&self, out: Outbox) {
        for (federate, callback) in out.into_entries() {
            self.notify(federate, callback);
        }
    }
}

impl Publications for FederateRegistry {
    fn publishes(
        &self,
        federate: FederateHandle,
        class: ObjectClassHandle,
        attribute: AttributeHandle,
    ) -> bool {
        self.proxies
            .get(&federate)
            .map(|p| p.declarations.publishes_attribute(class, attribute))
            .unwrap_or(false)
    }

    fn publishers_of(&self, class: ObjectClassHandle, attribute: AttributeHandle) -> Vec<FederateHandle> {
        self.proxies
            .values()
            .filter(|p| p.declarations.publishes_attribute(class, attribute))
            .map(|p| p.handle)
            .collect()
    }
}
