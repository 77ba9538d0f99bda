//! Tagged request/response form of the federation services.
//!
//! A connection layer decodes a [`Request`] for a federate, hands it to
//! [`FederationExecution::dispatch`] and sends the [`Response`] back. Every
//! request is answered exactly once; asynchronous outcomes travel on the
//! federate's callback queue as usual.

use crate::callback::{AttributeSet, AttributeValues, ParameterValues};
use crate::error::ServiceError;
use crate::execution::{FederationExecution, ResignAction};
use crate::ownership::AcquisitionOutcome;
use ohla_core::{
    AttributeHandle, FederateHandle, InteractionClassHandle, LogicalTime, LogicalTimeInterval,
    MessageRetractionHandle, ObjectClassHandle, ObjectInstanceHandle, RegionHandle,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "service", rename_all = "snake_case")]
pub enum Request {
    ResignFederationExecution {
        action: ResignAction,
    },

    PublishObjectClassAttributes {
        class: ObjectClassHandle,
        attributes: AttributeSet,
    },
    UnpublishObjectClassAttributes {
        class: ObjectClassHandle,
        attributes: AttributeSet,
    },
    SubscribeObjectClassAttributes {
        class: ObjectClassHandle,
        attributes: AttributeSet,
    },
    UnsubscribeObjectClassAttributes {
        class: ObjectClassHandle,
        attributes: AttributeSet,
    },
    PublishInteractionClass {
        class: InteractionClassHandle,
    },
    UnpublishInteractionClass {
        class: InteractionClassHandle,
    },
    SubscribeInteractionClass {
        class: InteractionClassHandle,
    },
    UnsubscribeInteractionClass {
        class: InteractionClassHandle,
    },

    ReserveObjectInstanceName {
        name: String,
    },
    RegisterObjectInstance {
        class: ObjectClassHandle,
        name: Option<String>,
    },
    DeleteObjectInstance {
        object: ObjectInstanceHandle,
        tag: Vec<u8>,
        time: Option<LogicalTime>,
    },
    LocalDeleteObjectInstance {
        object: ObjectInstanceHandle,
    },
    UpdateAttributeValues {
        object: ObjectInstanceHandle,
        values: AttributeValues,
        tag: Vec<u8>,
        time: Option<LogicalTime>,
    },
    SendInteraction {
        class: InteractionClassHandle,
        parameters: ParameterValues,
        tag: Vec<u8>,
        time: Option<LogicalTime>,
    },
    GetObjectInstanceHandle {
        name: String,
    },
    GetObjectInstanceName {
        object: ObjectInstanceHandle,
    },
    AssociateRegionsForUpdates {
        object: ObjectInstanceHandle,
        attributes: AttributeSet,
        regions: BTreeSet<RegionHandle>,
    },
    UnassociateRegionsForUpdates {
        object: ObjectInstanceHandle,
        attributes: AttributeSet,
        regions: BTreeSet<RegionHandle>,
    },

    UnconditionalAttributeOwnershipDivestiture {
        object: ObjectInstanceHandle,
        attributes: AttributeSet,
    },
    NegotiatedAttributeOwnershipDivestiture {
        object: ObjectInstanceHandle,
        attributes: AttributeSet,
        tag: Vec<u8>,
    },
    ConfirmDivestiture {
        object: ObjectInstanceHandle,
        attributes: AttributeSet,
    },
    CancelNegotiatedAttributeOwnershipDivestiture {
        object: ObjectInstanceHandle,
        attributes: AttributeSet,
    },
    AttributeOwnershipAcquisition {
        object: ObjectInstanceHandle,
        attributes: AttributeSet,
        tag: Vec<u8>,
    },
    AttributeOwnershipAcquisitionIfAvailable {
        object: ObjectInstanceHandle,
        attributes: AttributeSet,
        tag: Vec<u8>,
    },
    AttributeOwnershipDivestitureIfWanted {
        object: ObjectInstanceHandle,
        attributes: AttributeSet,
    },
    CancelAttributeOwnershipAcquisition {
        object: ObjectInstanceHandle,
        attributes: AttributeSet,
    },
    QueryAttributeOwnership {
        object: ObjectInstanceHandle,
        attribute: AttributeHandle,
    },
    IsAttributeOwnedByFederate {
        object: ObjectInstanceHandle,
        attribute: AttributeHandle,
    },

    EnableTimeRegulation {
        lookahead: LogicalTimeInterval,
    },
    DisableTimeRegulation,
    EnableTimeConstrained,
    DisableTimeConstrained,
    ModifyLookahead {
        lookahead: LogicalTimeInterval,
    },
    TimeAdvanceRequest {
        time: LogicalTime,
    },
    TimeAdvanceRequestAvailable {
        time: LogicalTime,
    },
    NextMessageRequest {
        time: LogicalTime,
    },
    NextMessageRequestAvailable {
        time: LogicalTime,
    },
    FlushQueueRequest {
        time: LogicalTime,
    },
    Retract {
        handle: MessageRetractionHandle,
    },
    QueryGalt,
    QueryLits,
    QueryLogicalTime,
    QueryLookahead,

    RegisterFederationSynchronizationPoint {
        label: String,
        tag: Vec<u8>,
        set: Option<BTreeSet<FederateHandle>>,
    },
    SynchronizationPointAchieved {
        label: String,
        successful: bool,
    },

    RequestFederationSave {
        label: String,
        time: Option<LogicalTime>,
    },
    FederateSaveBegun,
    FederateSaveComplete {
        state: Vec<u8>,
    },
    FederateSaveNotComplete,
    AbortFederationSave,
    QueryFederationSaveStatus,

    RequestFederationRestore {
        label: String,
    },
    FederateRestoreComplete,
    FederateRestoreNotComplete,
    AbortFederationRestore,
    QueryFederationRestoreStatus,
}

/// Value carried by a successful response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResponsePayload {
    Unit,
    ObjectInstance(ObjectInstanceHandle),
    Name(String),
    Retraction(Option<MessageRetractionHandle>),
    Acquisition(AcquisitionOutcome),
    Attributes(AttributeSet),
    Bool(bool),
    Time(LogicalTime),
    OptionalTime(Option<LogicalTime>),
    Lookahead(LogicalTimeInterval),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok(ResponsePayload),
    Failed(ServiceError),
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}

fn respond<T, E>(result: Result<T, E>, payload: impl FnOnce(T) -> ResponsePayload) -> Response
where
    E: Into<ServiceError>,
{
    match result {
        Ok(value) => Response::Ok(payload(value)),
        Err(e) => Response::Failed(e.into()),
    }
}

fn unit<E: Into<ServiceError>>(result: Result<(), E>) -> Response {
    respond(result, |()| ResponsePayload::Unit)
}

impl FederationExecution {
    /// Run one request on behalf of `federate`.
    pub async fn dispatch(&self, federate: FederateHandle, request: Request) -> Response {
        debug!(federation = %self.name(), federate = %federate, request = ?request, "Dispatching request");
        match request {
            Request::ResignFederationExecution { action } => {
                unit(self.resign(federate, action).await)
            }

            Request::PublishObjectClassAttributes { class, attributes } => unit(
                self.publish_object_class_attributes(federate, class, &attributes)
                    .await,
            ),
            Request::UnpublishObjectClassAttributes { class, attributes } => unit(
                self.unpublish_object_class_attributes(federate, class, &attributes)
                    .await,
            ),
            Request::SubscribeObjectClassAttributes { class, attributes } => unit(
                self.subscribe_object_class_attributes(federate, class, &attributes)
                    .await,
            ),
            Request::UnsubscribeObjectClassAttributes { class, attributes } => unit(
                self.unsubscribe_object_class_attributes(federate, class, &attributes)
                    .await,
            ),
            Request::PublishInteractionClass { class } => {
                unit(self.publish_interaction_class(federate, class).await)
            }
            Request::UnpublishInteractionClass { class } => {
                unit(self.unpublish_interaction_class(federate, class).await)
            }
            Request::SubscribeInteractionClass { class } => {
                unit(self.subscribe_interaction_class(federate, class).await)
            }
            Request::UnsubscribeInteractionClass { class } => {
                unit(self.unsubscribe_interaction_class(federate, class).await)
            }

            Request::ReserveObjectInstanceName { name } => {
                unit(self.reserve_object_instance_name(federate, &name).await)
            }
            Request::RegisterObjectInstance { class, name } => respond(
                self.register_object_instance(federate, class, name.as_deref())
                    .await,
                ResponsePayload::ObjectInstance,
            ),
            Request::DeleteObjectInstance { object, tag, time } => respond(
                self.delete_object_instance(federate, object, &tag, time)
                    .await,
                ResponsePayload::Retraction,
            ),
            Request::LocalDeleteObjectInstance { object } => {
                unit(self.local_delete_object_instance(federate, object).await)
            }
            Request::UpdateAttributeValues {
                object,
                values,
                tag,
                time,
            } => respond(
                self.update_attribute_values(federate, object, values, &tag, time)
                    .await,
                ResponsePayload::Retraction,
            ),
            Request::SendInteraction {
                class,
                parameters,
                tag,
                time,
            } => respond(
                self.send_interaction(federate, class, parameters, &tag, time)
                    .await,
                ResponsePayload::Retraction,
            ),
            Request::GetObjectInstanceHandle { name } => respond(
                self.object_instance_handle(&name).await,
                ResponsePayload::ObjectInstance,
            ),
            Request::GetObjectInstanceName { object } => respond(
                self.object_instance_name(object).await,
                ResponsePayload::Name,
            ),
            Request::AssociateRegionsForUpdates {
                object,
                attributes,
                regions,
            } => unit(
                self.associate_regions_for_updates(federate, object, &attributes, &regions)
                    .await,
            ),
            Request::UnassociateRegionsForUpdates {
                object,
                attributes,
                regions,
            } => unit(
                self.unassociate_regions_for_updates(federate, object, &attributes, &regions)
                    .await,
            ),

            Request::UnconditionalAttributeOwnershipDivestiture { object, attributes } => unit(
                self.unconditional_attribute_ownership_divestiture(federate, object, &attributes)
                    .await,
            ),
            Request::NegotiatedAttributeOwnershipDivestiture {
                object,
                attributes,
                tag,
            } => unit(
                self.negotiated_attribute_ownership_divestiture(federate, object, &attributes, &tag)
                    .await,
            ),
            Request::ConfirmDivestiture { object, attributes } => unit(
                self.confirm_divestiture(federate, object, &attributes)
                    .await,
            ),
            Request::CancelNegotiatedAttributeOwnershipDivestiture { object, attributes } => unit(
                self.cancel_negotiated_attribute_ownership_divestiture(federate, object, &attributes)
                    .await,
            ),
            Request::AttributeOwnershipAcquisition {
                object,
                attributes,
                tag,
            } => unit(
                self.attribute_ownership_acquisition(federate, object, &attributes, &tag)
                    .await,
            ),
            Request::AttributeOwnershipAcquisitionIfAvailable {
                object,
                attributes,
                tag,
            } => respond(
                self.attribute_ownership_acquisition_if_available(federate, object, &attributes, &tag)
                    .await,
                ResponsePayload::Acquisition,
            ),
            Request::AttributeOwnershipDivestitureIfWanted { object, attributes } => respond(
                self.attribute_ownership_divestiture_if_wanted(federate, object, &attributes)
                    .await,
                ResponsePayload::Attributes,
            ),
            Request::CancelAttributeOwnershipAcquisition { object, attributes } => unit(
                self.cancel_attribute_ownership_acquisition(federate, object, &attributes)
                    .await,
            ),
            Request::QueryAttributeOwnership { object, attribute } => unit(
                self.query_attribute_ownership(federate, object, attribute)
                    .await,
            ),
            Request::IsAttributeOwnedByFederate { object, attribute } => respond(
                self.is_attribute_owned_by_federate(federate, object, attribute)
                    .await,
                ResponsePayload::Bool,
            ),

            Request::EnableTimeRegulation { lookahead } => respond(
                self.enable_time_regulation(federate, lookahead).await,
                ResponsePayload::Time,
            ),
            Request::DisableTimeRegulation => unit(self.disable_time_regulation(federate).await),
            Request::EnableTimeConstrained => unit(self.enable_time_constrained(federate).await),
            Request::DisableTimeConstrained => unit(self.disable_time_constrained(federate).await),
            Request::ModifyLookahead { lookahead } => {
                unit(self.modify_lookahead(federate, lookahead).await)
            }
            Request::TimeAdvanceRequest { time } => {
                unit(self.time_advance_request(federate, time).await)
            }
            Request::TimeAdvanceRequestAvailable { time } => {
                unit(self.time_advance_request_available(federate, time).await)
            }
            Request::NextMessageRequest { time } => {
                unit(self.next_message_request(federate, time).await)
            }
            Request::NextMessageRequestAvailable { time } => {
                unit(self.next_message_request_available(federate, time).await)
            }
            Request::FlushQueueRequest { time } => {
                unit(self.flush_queue_request(federate, time).await)
            }
            Request::Retract { handle } => unit(self.retract(federate, handle).await),
            Request::QueryGalt => respond(
                self.query_galt(federate).await,
                ResponsePayload::OptionalTime,
            ),
            Request::QueryLits => respond(
                self.query_lits(federate).await,
                ResponsePayload::OptionalTime,
            ),
            Request::QueryLogicalTime => respond(
                self.query_logical_time(federate).await,
                ResponsePayload::Time,
            ),
            Request::QueryLookahead => respond(
                self.query_lookahead(federate).await,
                ResponsePayload::Lookahead,
            ),

            Request::RegisterFederationSynchronizationPoint { label, tag, set } => unit(
                self.register_federation_synchronization_point(federate, &label, &tag, set)
                    .await,
            ),
            Request::SynchronizationPointAchieved { label, successful } => unit(
                self.synchronization_point_achieved(federate, &label, successful)
                    .await,
            ),

            Request::RequestFederationSave { label, time } => {
                unit(self.request_federation_save(federate, &label, time).await)
            }
            Request::FederateSaveBegun => unit(self.federate_save_begun(federate).await),
            Request::FederateSaveComplete { state } => {
                unit(self.federate_save_complete(federate, state).await)
            }
            Request::FederateSaveNotComplete => {
                unit(self.federate_save_not_complete(federate).await)
            }
            Request::AbortFederationSave => unit(self.abort_federation_save(federate).await),
            Request::QueryFederationSaveStatus => {
                unit(self.query_federation_save_status(federate).await)
            }

            Request::RequestFederationRestore { label } => {
                unit(self.request_federation_restore(federate, &label).await)
            }
            Request::FederateRestoreComplete => {
                unit(self.federate_restore_complete(federate).await)
            }
            Request::FederateRestoreNotComplete => {
                unit(self.federate_restore_not_complete(federate).await)
            }
            Request::AbortFederationRestore => unit(self.abort_federation_restore(federate).await),
            Request::QueryFederationRestoreStatus => {
                unit(self.query_federation_restore_status(federate).await)
            }
        }
    }
}
