//! One federation execution: the joined federates, their objects, time
//! management and the save/restore session.
//!
//! # Locking
//!
//! Locks are always taken in this order, and any prefix may be skipped:
//!
//! 1. `session` - read for the duration of every ordinary service, write for
//!    save/restore transitions and resignation
//! 2. `federates`
//! 3. `time` / `sync_points`
//! 4. `objects`
//! 5. the per-instance lock of an [`ObjectInstance`]
//!
//! Callbacks produced while the locks are held are collected in an
//! [`Outbox`] and pushed to the federates' channels before the federate
//! registry lock is released, so every federate sees notifications in the
//! order the state changes happened.

use crate::callback::{
    callback_channel, AttributeSet, AttributeValues, Callback, CallbackQueue,
    FederateRestoreStatus, FederateSaveStatus, Outbox, ParameterValues,
};
use crate::error::{
    DeclarationError, FederationError, ObjectError, OwnershipError, RestoreError, SaveError,
    SaveFileError, SyncError, TimeError,
};
use crate::ownership::{AcquisitionOutcome, ObjectInstance, ObjectInstanceState};
use crate::proxy::{FederateProxy, FederateRegistry};
use crate::save::{
    pair_by_type, BufferedEntry, BufferedInteraction, BufferedMessage, BufferedUpdate,
    RestoreFailureReason, RestoreSession, RestoreStatus, SaveFailureReason, SaveSession,
    SaveStatus,
};
use crate::save_file::{
    read_artifact, write_artifact, ExecutionSnapshot, FederateRecord, ObjectSnapshot,
    SaveArtifact, SaveHeader,
};
use crate::store::SaveStore;
use crate::sync::SyncPoints;
use crate::time_manager::{AdvanceState, TimeCoordinator};
use ohla_core::{
    AttributeHandle, Fdd, FederateHandle, HandleAllocator, InteractionClassHandle, LogicalTime,
    LogicalTimeInterval, MessageRetractionHandle, ObjectClass, ObjectClassHandle,
    ObjectInstanceHandle, OrderType, RegionHandle, PRIVILEGE_TO_DELETE,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

/// What happens to a resigning federate's objects and attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResignAction {
    UnconditionallyDivestAttributes,
    DeleteObjects,
    CancelPendingOwnershipAcquisitions,
    DeleteObjectsThenDivest,
    CancelThenDeleteThenDivest,
    NoAction,
}

impl ResignAction {
    fn deletes_objects(self) -> bool {
        matches!(
            self,
            ResignAction::DeleteObjects
                | ResignAction::DeleteObjectsThenDivest
                | ResignAction::CancelThenDeleteThenDivest
        )
    }

    fn divests(self) -> bool {
        matches!(
            self,
            ResignAction::UnconditionallyDivestAttributes
                | ResignAction::DeleteObjectsThenDivest
                | ResignAction::CancelThenDeleteThenDivest
        )
    }
}

#[derive(Debug)]
enum Session {
    Idle,
    Saving(SaveSession),
    Restoring(RestoreSession),
}

/// Registered object instances and the instance name space.
#[derive(Debug, Default)]
struct ObjectRegistry {
    instances: BTreeMap<ObjectInstanceHandle, Arc<ObjectInstance>>,
    names: HashMap<String, ObjectInstanceHandle>,
    /// Every name ever reserved or registered; names are never reused.
    used_names: BTreeSet<String>,
    reserved: BTreeMap<String, FederateHandle>,
    handles: HandleAllocator<ObjectInstanceHandle>,
}

impl ObjectRegistry {
    fn get(&self, object: ObjectInstanceHandle) -> Option<Arc<ObjectInstance>> {
        self.instances.get(&object).cloned()
    }

    fn instances(&self) -> impl Iterator<Item = &Arc<ObjectInstance>> {
        self.instances.values()
    }

    fn insert(&mut self, instance: ObjectInstance) {
        self.used_names.insert(instance.name().to_string());
        self.names.insert(instance.name().to_string(), instance.handle());
        self.instances.insert(instance.handle(), Arc::new(instance));
    }

    fn remove(&mut self, object: ObjectInstanceHandle) -> Option<Arc<ObjectInstance>> {
        let instance = self.instances.remove(&object)?;
        self.names.remove(instance.name());
        Some(instance)
    }

    fn forget_reservations(&mut self, federate: FederateHandle) {
        self.reserved.retain(|_, holder| *holder != federate);
    }

    async fn snapshot(&self) -> (Vec<ObjectSnapshot>, Vec<String>, Vec<(String, FederateHandle)>, u64) {
        let mut objects = Vec::with_capacity(self.instances.len());
        for instance in self.instances.values() {
            objects.push(ObjectSnapshot {
                name: instance.name().to_string(),
                producer: instance.producer(),
                state: instance.state.read().await.clone(),
            });
        }
        (
            objects,
            self.used_names.iter().cloned().collect(),
            self.reserved
                .iter()
                .map(|(name, holder)| (name.clone(), *holder))
                .collect(),
            self.handles.next_value(),
        )
    }

    fn from_snapshot(snapshot: &ExecutionSnapshot) -> Self {
        let mut registry = ObjectRegistry {
            used_names: snapshot.used_names.iter().cloned().collect(),
            reserved: snapshot.reserved_names.iter().cloned().collect(),
            handles: HandleAllocator::resume_from(snapshot.next_object_handle),
            ..ObjectRegistry::default()
        };
        for object in &snapshot.objects {
            registry.insert(ObjectInstance::new(
                object.name.clone(),
                object.producer,
                object.state.clone(),
            ));
        }
        registry
    }
}

/// Outcome of routing one message.
struct Sent {
    retraction: Option<MessageRetractionHandle>,
    granted: bool,
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Reject instance names that are empty or use the reserved `HLA` prefix.
fn check_instance_name(name: &str) -> Result<(), ObjectError> {
    if name.is_empty() || name.starts_with("HLA") {
        return Err(ObjectError::IllegalName(name.to_string()));
    }
    Ok(())
}

pub struct FederationExecution {
    name: String,
    fdd: Fdd,
    store: Arc<dyn SaveStore>,
    initial_time: LogicalTime,
    session: RwLock<Session>,
    federates: RwLock<FederateRegistry>,
    time: Mutex<TimeCoordinator>,
    sync_points: Mutex<SyncPoints>,
    objects: RwLock<ObjectRegistry>,
}

impl FederationExecution {
    pub(crate) fn new(
        name: String,
        fdd: Fdd,
        store: Arc<dyn SaveStore>,
        initial_time: LogicalTime,
    ) -> Self {
        Self {
            name,
            fdd,
            store,
            initial_time,
            session: RwLock::new(Session::Idle),
            federates: RwLock::new(FederateRegistry::default()),
            time: Mutex::new(TimeCoordinator::new(initial_time)),
            sync_points: Mutex::new(SyncPoints::default()),
            objects: RwLock::new(ObjectRegistry::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fdd(&self) -> &Fdd {
        &self.fdd
    }

    /// Hold the session open for an ordinary service call.
    async fn admit(
        &self,
        federate: FederateHandle,
    ) -> Result<RwLockReadGuard<'_, Session>, FederationError> {
        let session = self.session.read().await;
        match &*session {
            Session::Idle => Ok(session),
            Session::Saving(save) if save.is_awaiting_time(federate) => Ok(session),
            Session::Saving(_) => Err(FederationError::SaveInProgress),
            Session::Restoring(_) => Err(FederationError::RestoreInProgress),
        }
    }

    /// Deliver `out` and report whether it carried a time grant.
    fn flush(federates: &FederateRegistry, out: Outbox) -> bool {
        let granted = out.has_grant();
        federates.deliver(out);
        granted
    }

    async fn instance(&self, object: ObjectInstanceHandle) -> Option<Arc<ObjectInstance>> {
        self.objects.read().await.get(object)
    }

    fn object_class(&self, class: ObjectClassHandle) -> Option<&ObjectClass> {
        self.fdd.object_class(class).ok()
    }

    /// First handle in `attributes` the instance's class does not define.
    /// Reads only the catalog and the instance's fixed class, so it runs
    /// before the instance lock is taken.
    fn undefined_attribute<'a>(
        &self,
        instance: &ObjectInstance,
        attributes: impl IntoIterator<Item = &'a AttributeHandle>,
    ) -> Option<AttributeHandle> {
        let object_class = self.object_class(instance.class());
        attributes
            .into_iter()
            .copied()
            .find(|attribute| object_class.and_then(|c| c.attribute(*attribute)).is_none())
    }

    fn check_class_attributes(
        &self,
        class: ObjectClassHandle,
        attributes: &AttributeSet,
    ) -> Result<&ObjectClass, DeclarationError> {
        let object_class = self
            .object_class(class)
            .ok_or(DeclarationError::ObjectClassNotDefined(class))?;
        if let Some(missing) = attributes.iter().find(|a| object_class.attribute(**a).is_none()) {
            return Err(DeclarationError::AttributeNotDefined(*missing));
        }
        Ok(object_class)
    }

    fn check_interaction_class(&self, class: InteractionClassHandle) -> Result<(), DeclarationError> {
        self.fdd
            .interaction_class(class)
            .map(|_| ())
            .map_err(|_| DeclarationError::InteractionClassNotDefined(class))
    }

    // ----------------------------------------------------------------------
    // Federation management
    // ----------------------------------------------------------------------

    pub(crate) async fn join(
        &self,
        name: Option<&str>,
        federate_type: &str,
    ) -> Result<(FederateHandle, CallbackQueue), FederationError> {
        let session = self.session.read().await;
        match &*session {
            Session::Idle => {}
            Session::Saving(_) => return Err(FederationError::SaveInProgress),
            Session::Restoring(_) => return Err(FederationError::RestoreInProgress),
        }

        let mut federates = self.federates.write().await;
        if let Some(name) = name {
            if federates.name_in_use(name) {
                return Err(FederationError::FederateNameAlreadyInUse(name.to_string()));
            }
        }
        let handle = federates.allocate();
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("HLAfederate{handle}"));
        let (sender, queue) = callback_channel();
        federates.insert(FederateProxy::new(
            handle,
            name.clone(),
            federate_type.to_string(),
            sender,
        ));
        self.time.lock().await.add_federate(handle);

        let mut out = Outbox::new();
        self.sync_points.lock().await.add_federate(handle, &mut out);
        federates.deliver(out);

        info!(
            federation = %self.name,
            federate = %handle,
            name = %name,
            federate_type = %federate_type,
            "Federate joined"
        );
        Ok((handle, queue))
    }

    /// Remove `federate` from the execution. Pending acquisitions are always
    /// cancelled; `action` decides about objects and owned attributes.
    pub async fn resign(
        &self,
        federate: FederateHandle,
        action: ResignAction,
    ) -> Result<(), FederationError> {
        let mut session = self.session.write().await;

        let proxy = {
            let mut federates = self.federates.write().await;
            federates.ensure_member(federate)?;
            let mut time = self.time.lock().await;
            let mut objects = self.objects.write().await;

            let mut doomed = Vec::new();
            for instance in objects.instances() {
                let state = instance.state.read().await;
                if action.deletes_objects() && state.holds_delete_privilege(federate) {
                    doomed.push(instance.handle());
                } else if !action.divests() && !state.owned_by(federate).is_empty() {
                    return Err(FederationError::FederateOwnsAttributes(federate));
                }
            }

            let mut out = Outbox::new();
            for object in doomed {
                if let Some(instance) = objects.remove(object) {
                    let mut state = instance.state.write().await;
                    state.mark_pending_deletion();
                    for receiver in state.known_by().iter().filter(|f| **f != federate) {
                        out.push(
                            *receiver,
                            Callback::RemoveObjectInstance {
                                object,
                                tag: Vec::new(),
                                time: None,
                                order: OrderType::Receive,
                                retraction: None,
                                producer: federate,
                            },
                        );
                    }
                }
            }
            for instance in objects.instances() {
                instance.state.write().await.release_federate(federate, &mut out);
            }
            objects.forget_reservations(federate);
            drop(objects);

            time.remove_federate(federate, &mut out);
            drop(time);
            self.sync_points
                .lock()
                .await
                .remove_federate(federate, &mut out);

            let proxy = federates.remove(federate);
            federates.deliver(out);
            proxy
        };

        let in_session = match &mut *session {
            Session::Saving(save) => save.remove_federate(federate),
            Session::Restoring(restore) => restore.remove_federate(federate),
            Session::Idle => false,
        };
        if in_session {
            warn!(federation = %self.name, federate = %federate, "Federate resigned during save or restore");
        }
        self.instruct_timed_save(&mut session).await;
        self.conclude_if_finished(&mut session).await;

        info!(federation = %self.name, federate = %federate, action = ?action, "Federate resigned");
        drop(proxy);
        Ok(())
    }

    /// Forced resignation of a federate whose connection was lost.
    pub async fn disconnect(&self, federate: FederateHandle) -> Result<(), FederationError> {
        warn!(federation = %self.name, federate = %federate, "Federate disconnected");
        self.resign(federate, ResignAction::CancelThenDeleteThenDivest)
            .await
    }

    pub async fn federate_count(&self) -> usize {
        self.federates.read().await.len()
    }

    pub async fn federate_handles(&self) -> BTreeSet<FederateHandle> {
        self.federates.read().await.handles()
    }

    pub async fn federate_name(&self, federate: FederateHandle) -> Result<String, FederationError> {
        Ok(self.federates.read().await.get(federate)?.name.clone())
    }

    pub async fn federate_handle(&self, name: &str) -> Option<FederateHandle> {
        self.federates
            .read()
            .await
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.handle)
    }

    // ----------------------------------------------------------------------
    // Declaration management
    // ----------------------------------------------------------------------

    pub async fn publish_object_class_attributes(
        &self,
        federate: FederateHandle,
        class: ObjectClassHandle,
        attributes: &AttributeSet,
    ) -> Result<(), DeclarationError> {
        let _session = self.admit(federate).await?;
        self.check_class_attributes(class, attributes)?;
        let mut federates = self.federates.write().await;
        federates
            .get_mut(federate)?
            .declarations
            .publish_attributes(class, attributes);
        debug!(federate = %federate, class = %class, "Published object class attributes");
        Ok(())
    }

    /// Stop publishing `attributes`. Instances of them the federate owns are
    /// divested unconditionally and its pending acquisitions are dropped.
    pub async fn unpublish_object_class_attributes(
        &self,
        federate: FederateHandle,
        class: ObjectClassHandle,
        attributes: &AttributeSet,
    ) -> Result<(), DeclarationError> {
        let _session = self.admit(federate).await?;
        self.check_class_attributes(class, attributes)?;
        let mut federates = self.federates.write().await;
        let removed = federates
            .get_mut(federate)?
            .declarations
            .unpublish_attributes(class, attributes);

        let mut out = Outbox::new();
        if !removed.is_empty() {
            let objects = self.objects.read().await;
            for instance in objects.instances().filter(|i| i.class() == class) {
                instance
                    .state
                    .write()
                    .await
                    .withdraw(federate, &removed, &mut out);
            }
        }
        federates.deliver(out);
        Ok(())
    }

    /// Subscribe and discover every existing instance of `class`.
    pub async fn subscribe_object_class_attributes(
        &self,
        federate: FederateHandle,
        class: ObjectClassHandle,
        attributes: &AttributeSet,
    ) -> Result<(), DeclarationError> {
        let _session = self.admit(federate).await?;
        self.check_class_attributes(class, attributes)?;
        let mut federates = self.federates.write().await;
        federates
            .get_mut(federate)?
            .declarations
            .subscribe_attributes(class, attributes);

        let mut out = Outbox::new();
        if !attributes.is_empty() {
            let objects = self.objects.read().await;
            for instance in objects.instances().filter(|i| i.class() == class) {
                let mut state = instance.state.write().await;
                if !state.is_pending_deletion() && state.add_known(federate) {
                    out.push(
                        federate,
                        Callback::DiscoverObjectInstance {
                            object: instance.handle(),
                            class,
                            name: instance.name().to_string(),
                            producer: instance.producer(),
                        },
                    );
                }
            }
        }
        federates.deliver(out);
        Ok(())
    }

    pub async fn unsubscribe_object_class_attributes(
        &self,
        federate: FederateHandle,
        class: ObjectClassHandle,
        attributes: &AttributeSet,
    ) -> Result<(), DeclarationError> {
        let _session = self.admit(federate).await?;
        self.check_class_attributes(class, attributes)?;
        self.federates
            .write()
            .await
            .get_mut(federate)?
            .declarations
            .unsubscribe_attributes(class, attributes);
        Ok(())
    }

    async fn update_interaction_declarations<F>(
        &self,
        federate: FederateHandle,
        class: InteractionClassHandle,
        change: F,
    ) -> Result<(), DeclarationError>
    where
        F: FnOnce(&mut FederateProxy),
    {
        let _session = self.admit(federate).await?;
        self.check_interaction_class(class)?;
        change(self.federates.write().await.get_mut(federate)?);
        Ok(())
    }

    pub async fn publish_interaction_class(
        &self,
        federate: FederateHandle,
        class: InteractionClassHandle,
    ) -> Result<(), DeclarationError> {
        self.update_interaction_declarations(federate, class, |p| {
            p.declarations.published_interactions.insert(class);
        })
        .await
    }

    pub async fn unpublish_interaction_class(
        &self,
        federate: FederateHandle,
        class: InteractionClassHandle,
    ) -> Result<(), DeclarationError> {
        self.update_interaction_declarations(federate, class, |p| {
            p.declarations.published_interactions.remove(&class);
        })
        .await
    }

    pub async fn subscribe_interaction_class(
        &self,
        federate: FederateHandle,
        class: InteractionClassHandle,
    ) -> Result<(), DeclarationError> {
        self.update_interaction_declarations(federate, class, |p| {
            p.declarations.subscribed_interactions.insert(class);
        })
        .await
    }

    pub async fn unsubscribe_interaction_class(
        &self,
        federate: FederateHandle,
        class: InteractionClassHandle,
    ) -> Result<(), DeclarationError> {
        self.update_interaction_declarations(federate, class, |p| {
            p.declarations.subscribed_interactions.remove(&class);
        })
        .await
    }

    // ----------------------------------------------------------------------
    // Object management
    // ----------------------------------------------------------------------

    /// Reserve an instance name. The outcome arrives as a callback.
    pub async fn reserve_object_instance_name(
        &self,
        federate: FederateHandle,
        name: &str,
    ) -> Result<(), ObjectError> {
        check_instance_name(name)?;
        let _session = self.admit(federate).await?;
        let federates = self.federates.read().await;
        federates.ensure_member(federate)?;

        let mut objects = self.objects.write().await;
        let callback = if objects.used_names.insert(name.to_string()) {
            objects.reserved.insert(name.to_string(), federate);
            Callback::ObjectInstanceNameReservationSucceeded(name.to_string())
        } else {
            Callback::ObjectInstanceNameReservationFailed(name.to_string())
        };
        drop(objects);
        federates.notify(federate, callback);
        Ok(())
    }

    /// Register a new instance of `class`. A name must have been reserved by
    /// the caller; without one a name is generated.
    pub async fn register_object_instance(
        &self,
        federate: FederateHandle,
        class: ObjectClassHandle,
        name: Option<&str>,
    ) -> Result<ObjectInstanceHandle, ObjectError> {
        let _session = self.admit(federate).await?;
        let object_class = self
            .object_class(class)
            .ok_or(ObjectError::ObjectClassNotDefined(class))?;
        let federates = self.federates.read().await;
        let declarations = &federates.get(federate)?.declarations;
        if !declarations.publishes_class(class) {
            return Err(ObjectError::ObjectClassNotPublished(class));
        }

        let mut objects = self.objects.write().await;
        if let Some(name) = name {
            if objects.names.contains_key(name) {
                return Err(ObjectError::ObjectInstanceNameInUse(name.to_string()));
            }
            if objects.reserved.get(name) != Some(&federate) {
                return Err(ObjectError::ObjectInstanceNameNotReserved(name.to_string()));
            }
            objects.reserved.remove(name);
        }
        let object = objects.handles.allocate();
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("HLAobject{object}"));

        let mut state = ObjectInstanceState::new(
            object,
            class,
            object_class.attribute_handles(),
            federate,
            |attribute| {
                (attribute == PRIVILEGE_TO_DELETE
                    || declarations.publishes_attribute(class, attribute))
                .then_some(federate)
            },
        );

        let mut out = Outbox::new();
        for proxy in federates.iter().filter(|p| p.handle != federate) {
            if proxy.declarations.subscribed_attributes_of(class).is_some() {
                state.add_known(proxy.handle);
                out.push(
                    proxy.handle,
                    Callback::DiscoverObjectInstance {
                        object,
                        class,
                        name: name.clone(),
                        producer: federate,
                    },
                );
            }
        }
        objects.insert(ObjectInstance::new(name.clone(), federate, state));
        drop(objects);
        federates.deliver(out);

        debug!(federate = %federate, object = %object, name = %name, "Object instance registered");
        Ok(object)
    }

    /// Delete an instance the caller holds the delete privilege for.
    pub async fn delete_object_instance(
        &self,
        federate: FederateHandle,
        object: ObjectInstanceHandle,
        tag: &[u8],
        timestamp: Option<LogicalTime>,
    ) -> Result<Option<MessageRetractionHandle>, ObjectError> {
        let sent = {
            let _session = self.admit(federate).await?;
            let federates = self.federates.read().await;
            federates.ensure_member(federate)?;
            let mut time = self.time.lock().await;
            let mut objects = self.objects.write().await;

            let instance = objects
                .get(object)
                .ok_or(ObjectError::ObjectInstanceNotKnown(object))?;
            let mut state = instance.state.write().await;
            if !state.known_by().contains(&federate) {
                return Err(ObjectError::ObjectInstanceNotKnown(object));
            }
            if !state.holds_delete_privilege(federate) {
                return Err(ObjectError::DeletePrivilegeNotHeld(object));
            }
            let ordered = timestamp.filter(|_| time.is_regulating(federate));
            if let Some(at) = ordered {
                time.validate_send(federate, at)
                    .map_err(|_| ObjectError::InvalidLogicalTime(at))?;
            }

            state.mark_pending_deletion();
            let receivers: Vec<FederateHandle> = state
                .known_by()
                .iter()
                .copied()
                .filter(|f| *f != federate)
                .collect();
            drop(state);
            objects.remove(object);
            drop(objects);

            let mut out = Outbox::new();
            let retraction = match ordered {
                Some(at) => {
                    let handle = time.allocate_retraction();
                    let deliveries = receivers
                        .into_iter()
                        .map(|r| {
                            (
                                r,
                                Callback::RemoveObjectInstance {
                                    object,
                                    tag: tag.to_vec(),
                                    time: Some(at),
                                    order: OrderType::TimeStamp,
                                    retraction: Some(handle),
                                    producer: federate,
                                },
                            )
                        })
                        .collect();
                    time.enqueue(handle, federate, at, deliveries, &mut out);
                    Some(handle)
                }
                None => {
                    for receiver in receivers {
                        out.push(
                            receiver,
                            Callback::RemoveObjectInstance {
                                object,
                                tag: tag.to_vec(),
                                time: timestamp,
                                order: OrderType::Receive,
                                retraction: None,
                                producer: federate,
                            },
                        );
                    }
                    None
                }
            };
            drop(time);
            debug!(federate = %federate, object = %object, "Object instance deleted");
            Sent {
                retraction,
                granted: Self::flush(&federates, out),
            }
        };
        if sent.granted {
            self.check_timed_save().await;
        }
        Ok(sent.retraction)
    }

    /// Forget an instance for the caller only. It is rediscovered by the next
    /// update it subscribes to.
    pub async fn local_delete_object_instance(
        &self,
        federate: FederateHandle,
        object: ObjectInstanceHandle,
    ) -> Result<(), ObjectError> {
        let _session = self.admit(federate).await?;
        self.federates.read().await.ensure_member(federate)?;
        let instance = self
            .instance(object)
            .await
            .ok_or(ObjectError::ObjectInstanceNotKnown(object))?;
        let mut state = instance.state.write().await;
        if !state.known_by().contains(&federate) {
            return Err(ObjectError::ObjectInstanceNotKnown(object));
        }
        if !state.owned_by(federate).is_empty() {
            return Err(ObjectError::FederateOwnsAttributes(object));
        }
        state.remove_known(federate);
        Ok(())
    }

    /// Which session rules apply to a message from `federate`: `Ok(None)`
    /// sends it live, `Ok(Some(save))` buffers it into the save.
    fn message_session<'a>(
        session: &'a Session,
        federate: FederateHandle,
    ) -> Result<Option<&'a SaveSession>, FederationError> {
        match session {
            Session::Idle => Ok(None),
            Session::Saving(save) if save.is_awaiting_time(federate) => Ok(None),
            Session::Saving(save) if save.is_instructed(federate) => Ok(Some(save)),
            Session::Saving(_) => Err(FederationError::SaveInProgress),
            Session::Restoring(_) => Err(FederationError::RestoreInProgress),
        }
    }

    /// Update attributes the caller owns. Returns a retraction handle when
    /// part of the update is timestamp ordered.
    pub async fn update_attribute_values(
        &self,
        federate: FederateHandle,
        object: ObjectInstanceHandle,
        values: AttributeValues,
        tag: &[u8],
        timestamp: Option<LogicalTime>,
    ) -> Result<Option<MessageRetractionHandle>, ObjectError> {
        let sent = {
            let session = self.session.read().await;
            let buffer = Self::message_session(&session, federate)?;
            let update = BufferedUpdate {
                object,
                values,
                tag: tag.to_vec(),
                time: timestamp,
                retraction: None,
            };
            self.route_update(federate, update, buffer).await?
        };
        if sent.granted {
            self.check_timed_save().await;
        }
        Ok(sent.retraction)
    }

    async fn route_update(
        &self,
        sender: FederateHandle,
        update: BufferedUpdate,
        buffer: Option<&SaveSession>,
    ) -> Result<Sent, ObjectError> {
        let federates = self.federates.read().await;
        federates.ensure_member(sender)?;
        let mut time = self.time.lock().await;
        let instance = self
            .instance(update.object)
            .await
            .ok_or(ObjectError::ObjectInstanceNotKnown(update.object))?;
        let class = instance.class();
        let object_class = self
            .object_class(class)
            .ok_or(ObjectError::ObjectClassNotDefined(class))?;
        if let Some(attribute) = self.undefined_attribute(&instance, update.values.keys()) {
            return Err(ObjectError::AttributeNotDefined(attribute));
        }

        let mut state = instance.state.write().await;
        if !state.known_by().contains(&sender) {
            return Err(ObjectError::ObjectInstanceNotKnown(update.object));
        }
        for attribute in update.values.keys() {
            if state.owner(*attribute) != Some(sender) {
                return Err(ObjectError::AttributeNotOwned(*attribute));
            }
        }

        let is_timestamped = |attribute: &AttributeHandle| {
            object_class
                .attribute(*attribute)
                .map(|a| a.order == OrderType::TimeStamp)
                .unwrap_or(false)
        };
        let ordered = update
            .time
            .filter(|_| time.is_regulating(sender))
            .filter(|_| update.values.keys().any(|a| is_timestamped(a)));
        let retraction = match ordered {
            Some(at) => {
                if update.retraction.is_none() {
                    time.validate_send(sender, at)
                        .map_err(|_| ObjectError::InvalidLogicalTime(at))?;
                }
                Some(
                    update
                        .retraction
                        .unwrap_or_else(|| time.allocate_retraction()),
                )
            }
            None => None,
        };

        if let Some(save) = buffer {
            debug!(federate = %sender, object = %update.object, "Update buffered during save");
            save.buffer(BufferedEntry {
                sender,
                message: BufferedMessage::UpdateAttributeValues(BufferedUpdate {
                    retraction,
                    ..update
                }),
            })
            .await;
            return Ok(Sent {
                retraction,
                granted: false,
            });
        }

        let mut out = Outbox::new();
        let mut deliveries = Vec::new();
        for proxy in federates.iter().filter(|p| p.handle != sender) {
            let Some(subscribed) = proxy.declarations.subscribed_attributes_of(class) else {
                continue;
            };
            let mut timestamped = AttributeValues::new();
            let mut received = AttributeValues::new();
            for (attribute, value) in update.values.iter().filter(|(a, _)| subscribed.contains(*a)) {
                if ordered.is_some() && is_timestamped(attribute) {
                    timestamped.insert(*attribute, value.clone());
                } else {
                    received.insert(*attribute, value.clone());
                }
            }
            if timestamped.is_empty() && received.is_empty() {
                continue;
            }

            if state.add_known(proxy.handle) {
                out.push(
                    proxy.handle,
                    Callback::DiscoverObjectInstance {
                        object: update.object,
                        class,
                        name: instance.name().to_string(),
                        producer: instance.producer(),
                    },
                );
            }
            if !received.is_empty() {
                out.push(
                    proxy.handle,
                    Callback::ReflectAttributeValues {
                        object: update.object,
                        values: received,
                        tag: update.tag.clone(),
                        time: update.time,
                        order: OrderType::Receive,
                        retraction: None,
                        producer: sender,
                    },
                );
            }
            if !timestamped.is_empty() {
                deliveries.push((
                    proxy.handle,
                    Callback::ReflectAttributeValues {
                        object: update.object,
                        values: timestamped,
                        tag: update.tag.clone(),
                        time: update.time,
                        order: OrderType::TimeStamp,
                        retraction,
                        producer: sender,
                    },
                ));
            }
        }
        drop(state);

        if let (Some(handle), Some(at)) = (retraction, ordered) {
            time.enqueue(handle, sender, at, deliveries, &mut out);
        }
        drop(time);
        Ok(Sent {
            retraction,
            granted: Self::flush(&federates, out),
        })
    }

    /// Send an interaction of a class the caller publishes.
    pub async fn send_interaction(
        &self,
        federate: FederateHandle,
        class: InteractionClassHandle,
        parameters: ParameterValues,
        tag: &[u8],
        timestamp: Option<LogicalTime>,
    ) -> Result<Option<MessageRetractionHandle>, ObjectError> {
        let sent = {
            let session = self.session.read().await;
            let buffer = Self::message_session(&session, federate)?;
            let interaction = BufferedInteraction {
                class,
                parameters,
                tag: tag.to_vec(),
                time: timestamp,
                retraction: None,
            };
            self.route_interaction(federate, interaction, buffer).await?
        };
        if sent.granted {
            self.check_timed_save().await;
        }
        Ok(sent.retraction)
    }

    async fn route_interaction(
        &self,
        sender: FederateHandle,
        interaction: BufferedInteraction,
        buffer: Option<&SaveSession>,
    ) -> Result<Sent, ObjectError> {
        let class = interaction.class;
        let definition = self
            .fdd
            .interaction_class(class)
            .map_err(|_| ObjectError::InteractionClassNotDefined(class))?;
        if let Some(parameter) = interaction
            .parameters
            .keys()
            .find(|p| !definition.parameters.iter().any(|d| d.handle == **p))
        {
            return Err(ObjectError::InteractionParameterNotDefined(*parameter));
        }

        let federates = self.federates.read().await;
        if !federates
            .get(sender)?
            .declarations
            .published_interactions
            .contains(&class)
        {
            return Err(ObjectError::InteractionClassNotPublished(class));
        }

        let mut time = self.time.lock().await;
        let ordered = interaction
            .time
            .filter(|_| definition.order == OrderType::TimeStamp)
            .filter(|_| time.is_regulating(sender));
        let retraction = match ordered {
            Some(at) => {
                if interaction.retraction.is_none() {
                    time.validate_send(sender, at)
                        .map_err(|_| ObjectError::InvalidLogicalTime(at))?;
                }
                Some(
                    interaction
                        .retraction
                        .unwrap_or_else(|| time.allocate_retraction()),
                )
            }
            None => None,
        };

        if let Some(save) = buffer {
            debug!(federate = %sender, class = %class, "Interaction buffered during save");
            save.buffer(BufferedEntry {
                sender,
                message: BufferedMessage::SendInteraction(BufferedInteraction {
                    retraction,
                    ..interaction
                }),
            })
            .await;
            return Ok(Sent {
                retraction,
                granted: false,
            });
        }

        let mut out = Outbox::new();
        let mut deliveries = Vec::new();
        let receivers = federates
            .iter()
            .filter(|p| p.handle != sender && p.declarations.subscribed_interactions.contains(&class));
        for proxy in receivers {
            let callback = Callback::ReceiveInteraction {
                class,
                parameters: interaction.parameters.clone(),
                tag: interaction.tag.clone(),
                time: interaction.time,
                order: if ordered.is_some() {
                    OrderType::TimeStamp
                } else {
                    OrderType::Receive
                },
                retraction,
                producer: sender,
            };
            if ordered.is_some() {
                deliveries.push((proxy.handle, callback));
            } else {
                out.push(proxy.handle, callback);
            }
        }
        if let (Some(handle), Some(at)) = (retraction, ordered) {
            time.enqueue(handle, sender, at, deliveries, &mut out);
        }
        drop(time);
        Ok(Sent {
            retraction,
            granted: Self::flush(&federates, out),
        })
    }

    pub async fn object_instance_handle(&self, name: &str) -> Result<ObjectInstanceHandle, ObjectError> {
        self.objects
            .read()
            .await
            .names
            .get(name)
            .copied()
            .ok_or_else(|| ObjectError::ObjectInstanceNameNotKnown(name.to_string()))
    }

    pub async fn object_instance_name(&self, object: ObjectInstanceHandle) -> Result<String, ObjectError> {
        self.instance(object)
            .await
            .map(|i| i.name().to_string())
            .ok_or(ObjectError::ObjectInstanceNotKnown(object))
    }

    pub async fn object_instance_handles(&self) -> Vec<ObjectInstanceHandle> {
        self.objects.read().await.instances.keys().copied().collect()
    }

    /// Current owner of an attribute instance, if the instance exists and the
    /// attribute is owned.
    pub async fn attribute_owner(
        &self,
        object: ObjectInstanceHandle,
        attribute: AttributeHandle,
    ) -> Option<FederateHandle> {
        let instance = self.instance(object).await?;
        let owner = instance.state.read().await.owner(attribute);
        owner
    }

    // ----------------------------------------------------------------------
    // Ownership management
    // ----------------------------------------------------------------------

    /// Run an ownership operation on `attributes` under the instance's write
    /// lock. Undefined attributes are rejected before that lock is taken.
    async fn with_instance<T, F>(
        &self,
        federate: FederateHandle,
        object: ObjectInstanceHandle,
        attributes: &AttributeSet,
        op: F,
    ) -> Result<T, OwnershipError>
    where
        F: FnOnce(&mut ObjectInstanceState, &FederateRegistry, &mut Outbox) -> Result<T, OwnershipError>,
    {
        let _session = self.admit(federate).await?;
        let federates = self.federates.read().await;
        federates.ensure_member(federate)?;
        let instance = self
            .instance(object)
            .await
            .ok_or(OwnershipError::ObjectInstanceNotKnown(object))?;
        if let Some(attribute) = self.undefined_attribute(&instance, attributes) {
            return Err(OwnershipError::AttributeNotDefined(attribute));
        }

        let mut out = Outbox::new();
        let result = {
            let mut state = instance.state.write().await;
            if !state.known_by().contains(&federate) {
                return Err(OwnershipError::ObjectInstanceNotKnown(object));
            }
            op(&mut state, &federates, &mut out)?
        };
        federates.deliver(out);
        Ok(result)
    }

    pub async fn unconditional_attribute_ownership_divestiture(
        &self,
        federate: FederateHandle,
        object: ObjectInstanceHandle,
        attributes: &AttributeSet,
    ) -> Result<(), OwnershipError> {
        self.with_instance(federate, object, attributes, |state, _, out| {
            state.unconditional_divest(federate, attributes, out)
        })
        .await
    }

    pub async fn negotiated_attribute_ownership_divestiture(
        &self,
        federate: FederateHandle,
        object: ObjectInstanceHandle,
        attributes: &AttributeSet,
        tag: &[u8],
    ) -> Result<(), OwnershipError> {
        self.with_instance(federate, object, attributes, |state, federates, out| {
            state.negotiated_divest(federate, attributes, tag, federates, out)
        })
        .await
    }

    pub async fn confirm_divestiture(
        &self,
        federate: FederateHandle,
        object: ObjectInstanceHandle,
        attributes: &AttributeSet,
    ) -> Result<(), OwnershipError> {
        self.with_instance(federate, object, attributes, |state, _, out| {
            state.confirm_divest(federate, attributes, out)
        })
        .await
    }

    pub async fn cancel_negotiated_attribute_ownership_divestiture(
        &self,
        federate: FederateHandle,
        object: ObjectInstanceHandle,
        attributes: &AttributeSet,
    ) -> Result<(), OwnershipError> {
        self.with_instance(federate, object, attributes, |state, _, _| {
            state.cancel_divestiture(federate, attributes)
        })
        .await
    }

    /// Intrusive acquisition. Owners of the attributes are asked to release
    /// them; nothing forces them to.
    pub async fn attribute_ownership_acquisition(
        &self,
        federate: FederateHandle,
        object: ObjectInstanceHandle,
        attributes: &AttributeSet,
        tag: &[u8],
    ) -> Result<(), OwnershipError> {
        self.with_instance(federate, object, attributes, |state, federates, out| {
            state.acquire(federate, attributes, tag, federates, out)
        })
        .await
        .map(|_| ())
    }

    pub async fn attribute_ownership_acquisition_if_available(
        &self,
        federate: FederateHandle,
        object: ObjectInstanceHandle,
        attributes: &AttributeSet,
        tag: &[u8],
    ) -> Result<AcquisitionOutcome, OwnershipError> {
        self.with_instance(federate, object, attributes, |state, federates, out| {
            state.acquire_if_available(federate, attributes, tag, federates, out)
        })
        .await
    }

    pub async fn attribute_ownership_divestiture_if_wanted(
        &self,
        federate: FederateHandle,
        object: ObjectInstanceHandle,
        attributes: &AttributeSet,
    ) -> Result<AttributeSet, OwnershipError> {
        self.with_instance(federate, object, attributes, |state, _, out| {
            state.divestiture_if_wanted(federate, attributes, out)
        })
        .await
    }

    pub async fn cancel_attribute_ownership_acquisition(
        &self,
        federate: FederateHandle,
        object: ObjectInstanceHandle,
        attributes: &AttributeSet,
    ) -> Result<(), OwnershipError> {
        self.with_instance(federate, object, attributes, |state, _, out| {
            state.cancel_acquisition(federate, attributes, out)
        })
        .await
    }

    pub async fn query_attribute_ownership(
        &self,
        federate: FederateHandle,
        object: ObjectInstanceHandle,
        attribute: AttributeHandle,
    ) -> Result<(), OwnershipError> {
        self.with_instance(federate, object, &AttributeSet::from([attribute]), |state, _, out| {
            state.query_ownership(federate, attribute, out)
        })
        .await
    }

    pub async fn is_attribute_owned_by_federate(
        &self,
        federate: FederateHandle,
        object: ObjectInstanceHandle,
        attribute: AttributeHandle,
    ) -> Result<bool, OwnershipError> {
        self.with_instance(federate, object, &AttributeSet::from([attribute]), |state, _, _| {
            Ok(state.attribute(attribute)?.owner() == Some(federate))
        })
        .await
    }

    pub async fn associate_regions_for_updates(
        &self,
        federate: FederateHandle,
        object: ObjectInstanceHandle,
        attributes: &AttributeSet,
        regions: &BTreeSet<RegionHandle>,
    ) -> Result<(), OwnershipError> {
        self.with_instance(federate, object, attributes, |state, _, _| {
            state.associate_regions(federate, attributes, regions)
        })
        .await
    }

    pub async fn unassociate_regions_for_updates(
        &self,
        federate: FederateHandle,
        object: ObjectInstanceHandle,
        attributes: &AttributeSet,
        regions: &BTreeSet<RegionHandle>,
    ) -> Result<(), OwnershipError> {
        self.with_instance(federate, object, attributes, |state, _, _| {
            state.unassociate_regions(federate, attributes, regions)
        })
        .await
    }

    // ----------------------------------------------------------------------
    // Time management
    // ----------------------------------------------------------------------

    async fn with_time<T, F>(&self, federate: FederateHandle, op: F) -> Result<T, TimeError>
    where
        F: FnOnce(&mut TimeCoordinator, &mut Outbox) -> Result<T, TimeError>,
    {
        let (result, granted) = {
            let _session = self.admit(federate).await?;
            let federates = self.federates.read().await;
            federates.ensure_member(federate)?;
            let mut out = Outbox::new();
            let result = op(&mut *self.time.lock().await, &mut out)?;
            (result, Self::flush(&federates, out))
        };
        if granted {
            self.check_timed_save().await;
        }
        Ok(result)
    }

    /// Returns the federate's time after enabling, which may have been raised.
    pub async fn enable_time_regulation(
        &self,
        federate: FederateHandle,
        lookahead: LogicalTimeInterval,
    ) -> Result<LogicalTime, TimeError> {
        self.with_time(federate, |time, out| {
            time.enable_time_regulation(federate, lookahead, out)
        })
        .await
    }

    pub async fn disable_time_regulation(&self, federate: FederateHandle) -> Result<(), TimeError> {
        self.with_time(federate, |time, out| time.disable_time_regulation(federate, out))
            .await
    }

    pub async fn enable_time_constrained(&self, federate: FederateHandle) -> Result<(), TimeError> {
        self.with_time(federate, |time, out| time.enable_time_constrained(federate, out))
            .await
    }

    pub async fn disable_time_constrained(&self, federate: FederateHandle) -> Result<(), TimeError> {
        self.with_time(federate, |time, out| time.disable_time_constrained(federate, out))
            .await
    }

    pub async fn modify_lookahead(
        &self,
        federate: FederateHandle,
        lookahead: LogicalTimeInterval,
    ) -> Result<(), TimeError> {
        self.with_time(federate, |time, out| {
            time.modify_lookahead(federate, lookahead, out)
        })
        .await
    }

    async fn request_advance(
        &self,
        federate: FederateHandle,
        request: AdvanceState,
    ) -> Result<(), TimeError> {
        self.with_time(federate, |time, out| time.request_advance(federate, request, out))
            .await
    }

    pub async fn time_advance_request(
        &self,
        federate: FederateHandle,
        to: LogicalTime,
    ) -> Result<(), TimeError> {
        self.request_advance(federate, AdvanceState::TimeAdvanceRequested(to))
            .await
    }

    pub async fn time_advance_request_available(
        &self,
        federate: FederateHandle,
        to: LogicalTime,
    ) -> Result<(), TimeError> {
        self.request_advance(federate, AdvanceState::TimeAdvanceRequestedAvailable(to))
            .await
    }

    pub async fn next_message_request(
        &self,
        federate: FederateHandle,
        to: LogicalTime,
    ) -> Result<(), TimeError> {
        self.request_advance(federate, AdvanceState::NextMessageRequested(to))
            .await
    }

    pub async fn next_message_request_available(
        &self,
        federate: FederateHandle,
        to: LogicalTime,
    ) -> Result<(), TimeError> {
        self.request_advance(federate, AdvanceState::NextMessageRequestedAvailable(to))
            .await
    }

    pub async fn flush_queue_request(
        &self,
        federate: FederateHandle,
        to: LogicalTime,
    ) -> Result<(), TimeError> {
        self.request_advance(federate, AdvanceState::FlushQueueRequested(to))
            .await
    }

    pub async fn retract(
        &self,
        federate: FederateHandle,
        handle: MessageRetractionHandle,
    ) -> Result<(), TimeError> {
        self.with_time(federate, |time, out| time.retract(federate, handle, out))
            .await
    }

    async fn time_query<T, F>(&self, federate: FederateHandle, query: F) -> Result<T, TimeError>
    where
        F: FnOnce(&TimeCoordinator) -> Result<T, TimeError>,
    {
        self.federates.read().await.ensure_member(federate)?;
        query(&*self.time.lock().await)
    }

    /// `None` when no other federate is time regulating.
    pub async fn query_galt(&self, federate: FederateHandle) -> Result<Option<LogicalTime>, TimeError> {
        self.time_query(federate, |time| Ok(time.galt_for(federate)))
            .await
    }

    /// `None` when no timestamp-ordered message is pending.
    pub async fn query_lits(&self, federate: FederateHandle) -> Result<Option<LogicalTime>, TimeError> {
        self.time_query(federate, |time| Ok(time.lits_for(federate)))
            .await
    }

    pub async fn query_logical_time(&self, federate: FederateHandle) -> Result<LogicalTime, TimeError> {
        self.time_query(federate, |time| time.logical_time(federate))
            .await
    }

    pub async fn query_lookahead(
        &self,
        federate: FederateHandle,
    ) -> Result<LogicalTimeInterval, TimeError> {
        self.time_query(federate, |time| {
            if !time.is_regulating(federate) {
                return Err(TimeError::TimeRegulationIsNotEnabled);
            }
            time.lookahead(federate)
        })
        .await
    }

    // ----------------------------------------------------------------------
    // Synchronization points
    // ----------------------------------------------------------------------

    async fn admit_sync(&self) -> Result<RwLockReadGuard<'_, Session>, FederationError> {
        let session = self.session.read().await;
        if matches!(&*session, Session::Restoring(_)) {
            return Err(FederationError::RestoreInProgress);
        }
        Ok(session)
    }

    /// Register a synchronization point for `set`, or for the whole
    /// federation (late joiners included) when `set` is `None`.
    pub async fn register_federation_synchronization_point(
        &self,
        federate: FederateHandle,
        label: &str,
        tag: &[u8],
        set: Option<BTreeSet<FederateHandle>>,
    ) -> Result<(), SyncError> {
        let _session = self.admit_sync().await?;
        let federates = self.federates.read().await;
        federates.ensure_member(federate)?;
        let mut out = Outbox::new();
        self.sync_points.lock().await.register(
            federate,
            label,
            tag.to_vec(),
            set,
            &federates.handles(),
            &mut out,
        );
        federates.deliver(out);
        Ok(())
    }

    pub async fn synchronization_point_achieved(
        &self,
        federate: FederateHandle,
        label: &str,
        successful: bool,
    ) -> Result<(), SyncError> {
        let _session = self.admit_sync().await?;
        let federates = self.federates.read().await;
        federates.ensure_member(federate)?;
        let mut out = Outbox::new();
        self.sync_points
            .lock()
            .await
            .achieved(federate, label, successful, &mut out)?;
        federates.deliver(out);
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Save
    // ----------------------------------------------------------------------

    /// Start a federation save. With a save time, constrained federates are
    /// instructed once they have been granted that time.
    pub async fn request_federation_save(
        &self,
        federate: FederateHandle,
        label: &str,
        save_time: Option<LogicalTime>,
    ) -> Result<(), SaveError> {
        let mut session = self.session.write().await;
        match &*session {
            Session::Idle => {}
            Session::Saving(_) => return Err(FederationError::SaveInProgress.into()),
            Session::Restoring(_) => return Err(FederationError::RestoreInProgress.into()),
        }

        let federates = self.federates.read().await;
        federates.ensure_member(federate)?;
        let time = self.time.lock().await;
        if let Some(at) = save_time {
            let current = time.federate(federate).map(|s| s.time);
            if current.map(|t| at < t).unwrap_or(false) {
                return Err(SaveError::LogicalTimeAlreadyPassed(at));
            }
        }

        let mut instructed = BTreeSet::new();
        let mut awaiting = BTreeSet::new();
        let mut overshot = false;
        for handle in federates.handles() {
            let state = time.federate(handle);
            match (save_time, state) {
                (Some(at), Some(s)) if s.constrained && s.time < at => {
                    awaiting.insert(handle);
                }
                (Some(at), Some(s)) => {
                    overshot |= s.constrained && s.time > at;
                    instructed.insert(handle);
                }
                _ => {
                    instructed.insert(handle);
                }
            }
        }
        drop(time);

        let mut save = SaveSession::new(label.to_string(), save_time, instructed.clone(), awaiting);
        if overshot {
            save.fail(SaveFailureReason::SaveTimeCannotBeHonored);
        }
        for handle in instructed {
            federates.notify(
                handle,
                Callback::InitiateFederateSave {
                    label: label.to_string(),
                    time: save_time,
                },
            );
        }
        drop(federates);

        info!(federation = %self.name, label = %label, time = ?save_time, "Federation save requested");
        *session = Session::Saving(save);
        Ok(())
    }

    /// Instruct federates waiting for a timed save whose time has come.
    async fn check_timed_save(&self) {
        let timed = matches!(
            &*self.session.read().await,
            Session::Saving(save) if save.time().is_some()
        );
        if timed {
            let mut session = self.session.write().await;
            self.instruct_timed_save(&mut session).await;
            self.conclude_if_finished(&mut session).await;
        }
    }

    async fn instruct_timed_save(&self, session: &mut Session) {
        let Session::Saving(save) = session else {
            return;
        };
        let Some(at) = save.time() else {
            return;
        };
        let federates = self.federates.read().await;
        let time = self.time.lock().await;
        let due = save.instruct_due(|f| {
            time.federate(f)
                .map(|s| !s.constrained || s.time >= at)
                .unwrap_or(true)
        });
        if due
            .iter()
            .any(|f| time.federate(*f).map(|s| s.constrained && s.time > at).unwrap_or(false))
        {
            warn!(federation = %self.name, label = %save.label(), "Federate advanced past the save time");
            save.fail(SaveFailureReason::SaveTimeCannotBeHonored);
        }
        drop(time);
        for federate in due {
            federates.notify(
                federate,
                Callback::InitiateFederateSave {
                    label: save.label().to_string(),
                    time: Some(at),
                },
            );
        }
    }

    async fn with_save<F>(&self, federate: FederateHandle, missing: SaveError, op: F) -> Result<(), SaveError>
    where
        F: FnOnce(&mut SaveSession) -> Result<(), SaveError>,
    {
        let mut session = self.session.write().await;
        self.federates.read().await.ensure_member(federate)?;
        let Session::Saving(save) = &mut *session else {
            return Err(missing);
        };
        op(save)?;
        self.conclude_if_finished(&mut session).await;
        Ok(())
    }

    pub async fn federate_save_begun(&self, federate: FederateHandle) -> Result<(), SaveError> {
        self.with_save(federate, SaveError::SaveNotInitiated, |save| save.begun(federate))
            .await
    }

    /// The federate finished saving; `state` is stored with the save.
    pub async fn federate_save_complete(
        &self,
        federate: FederateHandle,
        state: Vec<u8>,
    ) -> Result<(), SaveError> {
        self.with_save(federate, SaveError::FederateHasNotBegunSave, |save| {
            save.complete(federate, state)
        })
        .await
    }

    pub async fn federate_save_not_complete(&self, federate: FederateHandle) -> Result<(), SaveError> {
        self.with_save(federate, SaveError::FederateHasNotBegunSave, |save| {
            warn!(federate = %federate, label = %save.label(), "Federate failed to save");
            save.not_complete(federate)
        })
        .await
    }

    pub async fn abort_federation_save(&self, federate: FederateHandle) -> Result<(), SaveError> {
        let mut session = self.session.write().await;
        self.federates.read().await.ensure_member(federate)?;
        if !matches!(&*session, Session::Saving(_)) {
            return Err(SaveError::SaveNotInProgress);
        }
        if let Session::Saving(mut save) = std::mem::replace(&mut *session, Session::Idle) {
            warn!(federation = %self.name, label = %save.label(), "Federation save aborted");
            self.federates
                .read()
                .await
                .notify_all(&Callback::FederationNotSaved(SaveFailureReason::SaveAborted));
            self.replay(save.take_buffered()).await;
        }
        Ok(())
    }

    /// Reply with a `FederationSaveStatusResponse` callback.
    pub async fn query_federation_save_status(&self, federate: FederateHandle) -> Result<(), SaveError> {
        let session = self.session.read().await;
        let federates = self.federates.read().await;
        federates.ensure_member(federate)?;
        let statuses = match &*session {
            Session::Saving(save) => save.statuses(federates.handles()),
            _ => federates
                .handles()
                .into_iter()
                .map(|federate| FederateSaveStatus {
                    federate,
                    status: SaveStatus::NoSaveInProgress,
                })
                .collect(),
        };
        federates.notify(federate, Callback::FederationSaveStatusResponse(statuses));
        Ok(())
    }

    async fn conclude_if_finished(&self, session: &mut Session) {
        let finished = match &*session {
            Session::Saving(save) => save.is_finished(),
            Session::Restoring(restore) => restore.is_finished(),
            Session::Idle => false,
        };
        if !finished {
            return;
        }
        match std::mem::replace(session, Session::Idle) {
            Session::Saving(save) => self.conclude_save(save).await,
            Session::Restoring(restore) => self.conclude_restore(restore).await,
            Session::Idle => {}
        }
    }

    async fn conclude_save(&self, mut save: SaveSession) {
        let failure = match save.failure() {
            Some(reason) => Some(reason),
            None => match self.write_save(&mut save).await {
                Ok(()) => {
                    info!(federation = %self.name, label = %save.label(), "Federation saved");
                    None
                }
                Err(e) => {
                    error!(federation = %self.name, label = %save.label(), error = %e, "Could not write save");
                    Some(SaveFailureReason::RtiUnableToSave)
                }
            },
        };
        let callback = match failure {
            None => Callback::FederationSaved,
            Some(reason) => {
                warn!(federation = %self.name, label = %save.label(), reason = ?reason, "Federation not saved");
                Callback::FederationNotSaved(reason)
            }
        };
        self.federates.read().await.notify_all(&callback);
        self.replay(save.take_buffered()).await;
    }

    /// Snapshot the execution and persist it under the save label.
    async fn write_save(&self, save: &mut SaveSession) -> Result<(), SaveFileError> {
        let states = save.take_states();
        let federates = self.federates.read().await;
        let records: Vec<FederateRecord> = federates
            .iter()
            .map(|proxy| FederateRecord {
                handle: proxy.handle,
                name: proxy.name.clone(),
                federate_type: proxy.federate_type.clone(),
                state: states.get(&proxy.handle).cloned().unwrap_or_default(),
                declarations: proxy.declarations.clone(),
            })
            .collect();
        let time = self.time.lock().await.snapshot();
        let (objects, used_names, reserved_names, next_object_handle) =
            self.objects.read().await.snapshot().await;
        let next_federate_handle = federates.next_handle_value();
        drop(federates);

        let artifact = SaveArtifact {
            header: SaveHeader {
                label: save.label().to_string(),
                federation_name: self.name.clone(),
                federate_count: records.len() as u32,
                save_time: save.time(),
                fdd: self.fdd.clone(),
                wall_clock_ms: wall_clock_ms(),
            },
            federates: records,
            execution: ExecutionSnapshot {
                objects,
                used_names,
                reserved_names,
                next_object_handle,
                next_federate_handle,
                time,
            },
            log: save.buffered().await,
        };

        let mut sink = self.store.create(save.label())?;
        write_artifact(&artifact, sink.as_mut())?;
        sink.finish()?;
        Ok(())
    }

    /// Apply messages held back during a save, in the order they were sent.
    async fn replay(&self, log: Vec<BufferedEntry>) {
        for entry in log {
            let sender = entry.sender;
            let result = match entry.message {
                BufferedMessage::UpdateAttributeValues(update) => {
                    self.route_update(sender, update, None).await.map(|_| ())
                }
                BufferedMessage::SendInteraction(interaction) => {
                    self.route_interaction(sender, interaction, None)
                        .await
                        .map(|_| ())
                }
            };
            if let Err(e) = result {
                warn!(federation = %self.name, federate = %sender, error = %e, "Dropped buffered message");
            }
        }
    }

    // ----------------------------------------------------------------------
    // Restore
    // ----------------------------------------------------------------------

    /// Load `label` and pair the joined federates with its records.
    fn load_restore(
        &self,
        label: &str,
        federates: &FederateRegistry,
    ) -> Result<(SaveArtifact, BTreeMap<FederateHandle, usize>), String> {
        let bytes = self
            .store
            .open(label)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "no save with this label".to_string())?;
        let artifact = read_artifact(&bytes).map_err(|e| e.to_string())?;
        if artifact.header.fdd != self.fdd {
            return Err("saved FDD differs from this federation's".to_string());
        }
        let joined: Vec<(FederateHandle, String)> = federates
            .iter()
            .map(|p| (p.handle, p.federate_type.clone()))
            .collect();
        let assignments = pair_by_type(&joined, &artifact.federates)
            .ok_or_else(|| "joined federate types do not match the save".to_string())?;
        Ok((artifact, assignments))
    }

    /// Start restoring the save `label`. Whether the request was accepted
    /// arrives as a callback.
    pub async fn request_federation_restore(
        &self,
        federate: FederateHandle,
        label: &str,
    ) -> Result<(), RestoreError> {
        let mut session = self.session.write().await;
        match &*session {
            Session::Idle => {}
            Session::Saving(_) => return Err(FederationError::SaveInProgress.into()),
            Session::Restoring(_) => return Err(FederationError::RestoreInProgress.into()),
        }
        let federates = self.federates.read().await;
        federates.ensure_member(federate)?;

        let (artifact, assignments) = match self.load_restore(label, &federates) {
            Ok(loaded) => loaded,
            Err(reason) => {
                warn!(federation = %self.name, label = %label, reason = %reason, "Federation restore request failed");
                federates.notify(
                    federate,
                    Callback::RequestFederationRestoreFailed(label.to_string()),
                );
                return Ok(());
            }
        };

        federates.notify(
            federate,
            Callback::RequestFederationRestoreSucceeded(label.to_string()),
        );
        federates.notify_all(&Callback::FederationRestoreBegun);
        let restore = RestoreSession::new(label.to_string(), artifact, assignments);
        for (handle, record) in restore.assignments() {
            federates.notify(
                handle,
                Callback::InitiateFederateRestore {
                    label: label.to_string(),
                    name: record.name.clone(),
                    handle: record.handle,
                    state: record.state.clone(),
                },
            );
        }
        drop(federates);

        info!(federation = %self.name, label = %label, "Federation restore begun");
        *session = Session::Restoring(restore);
        Ok(())
    }

    async fn with_restore<F>(&self, federate: FederateHandle, op: F) -> Result<(), RestoreError>
    where
        F: FnOnce(&mut RestoreSession) -> Result<(), RestoreError>,
    {
        let mut session = self.session.write().await;
        self.federates.read().await.ensure_member(federate)?;
        let Session::Restoring(restore) = &mut *session else {
            return Err(RestoreError::RestoreNotInProgress);
        };
        op(restore)?;
        self.conclude_if_finished(&mut session).await;
        Ok(())
    }

    /// The federate has loaded the state it was handed. Until the restore
    /// concludes it keeps using the handle it joined with.
    pub async fn federate_restore_complete(&self, federate: FederateHandle) -> Result<(), RestoreError> {
        self.with_restore(federate, |restore| restore.complete(federate))
            .await
    }

    pub async fn federate_restore_not_complete(
        &self,
        federate: FederateHandle,
    ) -> Result<(), RestoreError> {
        self.with_restore(federate, |restore| {
            warn!(federate = %federate, label = %restore.label(), "Federate failed to restore");
            restore.not_complete(federate)
        })
        .await
    }

    pub async fn abort_federation_restore(&self, federate: FederateHandle) -> Result<(), RestoreError> {
        let mut session = self.session.write().await;
        self.federates.read().await.ensure_member(federate)?;
        if !matches!(&*session, Session::Restoring(_)) {
            return Err(RestoreError::RestoreNotInProgress);
        }
        *session = Session::Idle;
        warn!(federation = %self.name, "Federation restore aborted");
        self.federates
            .read()
            .await
            .notify_all(&Callback::FederationNotRestored(RestoreFailureReason::RestoreAborted));
        Ok(())
    }

    /// Reply with a `FederationRestoreStatusResponse` callback.
    pub async fn query_federation_restore_status(
        &self,
        federate: FederateHandle,
    ) -> Result<(), RestoreError> {
        let session = self.session.read().await;
        let federates = self.federates.read().await;
        federates.ensure_member(federate)?;
        let statuses = match &*session {
            Session::Restoring(restore) => restore.statuses(federates.handles()),
            _ => federates
                .handles()
                .into_iter()
                .map(|federate| FederateRestoreStatus {
                    federate,
                    status: RestoreStatus::NoRestoreInProgress,
                })
                .collect(),
        };
        federates.notify(federate, Callback::FederationRestoreStatusResponse(statuses));
        Ok(())
    }

    async fn conclude_restore(&self, restore: RestoreSession) {
        if let Some(reason) = restore.failure() {
            warn!(federation = %self.name, label = %restore.label(), reason = ?reason, "Federation not restored");
            self.federates
                .read()
                .await
                .notify_all(&Callback::FederationNotRestored(reason));
            return;
        }

        let label = restore.label().to_string();
        let log = self.install(restore).await;
        self.federates
            .read()
            .await
            .notify_all(&Callback::FederationRestored);
        info!(federation = %self.name, label = %label, replayed = log.len(), "Federation restored");
        self.replay(log).await;
    }

    /// Replace the live state with the saved one. Returns the saved message
    /// log, still to be replayed.
    async fn install(&self, restore: RestoreSession) -> Vec<BufferedEntry> {
        let assignments: Vec<(FederateHandle, FederateRecord)> = restore
            .assignments()
            .map(|(handle, record)| (handle, record.clone()))
            .collect();
        let artifact = restore.into_artifact();

        let mut federates = self.federates.write().await;
        let mut proxies: BTreeMap<FederateHandle, FederateProxy> = federates
            .drain()
            .into_iter()
            .map(|p| (p.handle, p))
            .collect();
        for (current, record) in assignments {
            if let Some(proxy) = proxies.remove(&current) {
                debug!(from = %current, to = %record.handle, name = %record.name, "Federate re-keyed");
                federates.insert(proxy.rekeyed(record.handle, record.name, record.declarations));
            }
        }
        federates.advance_handles_past(artifact.execution.next_federate_handle.saturating_sub(1));

        let objects = ObjectRegistry::from_snapshot(&artifact.execution);
        let SaveArtifact { execution, log, .. } = artifact;
        *self.time.lock().await = TimeCoordinator::from_snapshot(self.initial_time, execution.time);
        self.sync_points.lock().await.clear();
        *self.objects.write().await = objects;
        drop(federates);

        log
    }
}
