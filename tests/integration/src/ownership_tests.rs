//! Attribute ownership scenarios across federates

use crate::test_utils::*;
use ohla_core::{FederateHandle, ObjectInstanceHandle, PRIVILEGE_TO_DELETE};
use ohla_federation::{AttributeValues, Callback, ObjectError, OwnershipError, ResignAction};
use proptest::prelude::*;

/// `owner` registers one vehicle publishing `published`; `other` publishes
/// and subscribes to every attribute and discovers it.
async fn vehicle_with(
    published: &[ohla_core::AttributeHandle],
) -> (TestFederate, TestFederate, ObjectInstanceHandle) {
    let rti = federation("ownership").await;
    let mut owner = TestFederate::join(&rti, "ownership", "owner", "tank").await;
    let mut other = TestFederate::join(&rti, "ownership", "other", "tank").await;
    let exec = owner.execution.clone();

    exec.publish_object_class_attributes(owner.handle, VEHICLE, &attrs(published))
        .await
        .unwrap();
    let all = attrs(&[POSITION, FUEL, HEADING]);
    exec.publish_object_class_attributes(other.handle, VEHICLE, &all)
        .await
        .unwrap();
    exec.subscribe_object_class_attributes(other.handle, VEHICLE, &all)
        .await
        .unwrap();
    let object = exec
        .register_object_instance(owner.handle, VEHICLE, None)
        .await
        .unwrap();
    owner.drain();
    other.drain();
    (owner, other, object)
}

#[tokio::test]
async fn test_acquire_if_available_takes_unowned_attribute() {
    let (owner, mut other, object) = vehicle_with(&[POSITION, FUEL]).await;
    let exec = owner.execution.clone();
    assert_eq!(exec.attribute_owner(object, HEADING).await, None);

    let outcome = exec
        .attribute_ownership_acquisition_if_available(other.handle, object, &attrs(&[HEADING]), b"mine")
        .await
        .unwrap();
    assert_eq!(outcome.acquired, attrs(&[HEADING]));
    assert!(outcome.unavailable.is_empty());
    assert_eq!(
        other.drain(),
        vec![Callback::AttributeOwnershipAcquisitionNotification {
            object,
            attributes: attrs(&[HEADING]),
            tag: b"mine".to_vec(),
        }]
    );

    assert_eq!(exec.attribute_owner(object, HEADING).await, Some(other.handle));
    assert_eq!(exec.attribute_owner(object, POSITION).await, Some(owner.handle));
    assert_eq!(exec.attribute_owner(object, FUEL).await, Some(owner.handle));
}

#[tokio::test]
async fn test_intrusive_acquisition_completes_on_divest() {
    let (mut owner, mut other, object) = vehicle_with(&[POSITION]).await;
    let exec = owner.execution.clone();

    exec.attribute_ownership_acquisition(other.handle, object, &attrs(&[POSITION]), b"please")
        .await
        .unwrap();
    assert_eq!(
        owner.drain(),
        vec![Callback::RequestAttributeOwnershipRelease {
            object,
            attributes: attrs(&[POSITION]),
            tag: b"please".to_vec(),
        }]
    );
    assert!(other.drain().is_empty());
    assert_eq!(exec.attribute_owner(object, POSITION).await, Some(owner.handle));

    exec.unconditional_attribute_ownership_divestiture(owner.handle, object, &attrs(&[POSITION]))
        .await
        .unwrap();
    assert_eq!(
        other.drain(),
        vec![Callback::AttributeOwnershipAcquisitionNotification {
            object,
            attributes: attrs(&[POSITION]),
            tag: b"please".to_vec(),
        }]
    );
    assert_eq!(exec.attribute_owner(object, POSITION).await, Some(other.handle));

    // The new owner updates; the old one no longer may.
    exec.update_attribute_values(other.handle, object, AttributeValues::from([(POSITION, vec![9])]), b"", None)
        .await
        .unwrap();
    assert!(exec
        .update_attribute_values(owner.handle, object, AttributeValues::from([(POSITION, vec![1])]), b"", None)
        .await
        .is_err());
}

#[tokio::test]
async fn test_unpublished_attributes_cannot_be_acquired() {
    let rti = federation("unpublished").await;
    let owner = TestFederate::join(&rti, "unpublished", "owner", "tank").await;
    let other = TestFederate::join(&rti, "unpublished", "other", "tank").await;
    let exec = owner.execution.clone();
    exec.publish_object_class_attributes(owner.handle, VEHICLE, &attrs(&[POSITION]))
        .await
        .unwrap();
    exec.subscribe_object_class_attributes(other.handle, VEHICLE, &attrs(&[POSITION]))
        .await
        .unwrap();
    let object = exec
        .register_object_instance(owner.handle, VEHICLE, None)
        .await
        .unwrap();

    assert_eq!(
        exec.attribute_ownership_acquisition_if_available(other.handle, object, &attrs(&[HEADING]), b"")
            .await,
        Err(OwnershipError::AttributeNotPublished(HEADING))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquisitions_have_one_winner() {
    let rti = federation("contention").await;
    let owner = TestFederate::join(&rti, "contention", "owner", "tank").await;
    let exec = owner.execution.clone();
    exec.publish_object_class_attributes(owner.handle, VEHICLE, &attrs(&[POSITION]))
        .await
        .unwrap();

    let mut contenders = Vec::new();
    for i in 0..8 {
        let federate = TestFederate::join(&rti, "contention", &format!("c{i}"), "tank").await;
        exec.publish_object_class_attributes(federate.handle, VEHICLE, &attrs(&[HEADING]))
            .await
            .unwrap();
        exec.subscribe_object_class_attributes(federate.handle, VEHICLE, &attrs(&[HEADING]))
            .await
            .unwrap();
        contenders.push(federate);
    }
    let object = exec
        .register_object_instance(owner.handle, VEHICLE, None)
        .await
        .unwrap();

    let tasks: Vec<_> = contenders
        .iter()
        .map(|c| {
            let exec = exec.clone();
            let handle = c.handle;
            tokio::spawn(async move {
                let outcome = exec
                    .attribute_ownership_acquisition_if_available(handle, object, &attrs(&[HEADING]), b"")
                    .await
                    .unwrap();
                (handle, outcome)
            })
        })
        .collect();

    let mut winners: Vec<FederateHandle> = Vec::new();
    for task in tasks {
        let (handle, outcome) = task.await.unwrap();
        if outcome.acquired.contains(&HEADING) {
            winners.push(handle);
        } else {
            assert_eq!(outcome.unavailable, attrs(&[HEADING]));
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(exec.attribute_owner(object, HEADING).await, Some(winners[0]));
}

#[tokio::test]
async fn test_resign_deletes_objects_and_notifies_subscribers() {
    let (owner, mut other, object) = vehicle_with(&[POSITION, FUEL]).await;
    let exec = owner.execution.clone();
    exec.resign(owner.handle, ResignAction::DeleteObjectsThenDivest)
        .await
        .unwrap();

    let callbacks = other.drain();
    assert!(callbacks.iter().any(|c| matches!(
        c,
        Callback::RemoveObjectInstance { object: o, .. } if *o == object
    )));
    assert!(exec.object_instance_name(object).await.is_err());
    assert_eq!(exec.federate_count().await, 1);
}

#[tokio::test]
async fn test_resign_divests_to_waiting_acquirer() {
    let (owner, mut other, object) = vehicle_with(&[POSITION]).await;
    let exec = owner.execution.clone();
    exec.attribute_ownership_acquisition(other.handle, object, &attrs(&[POSITION]), b"t")
        .await
        .unwrap();

    exec.resign(owner.handle, ResignAction::UnconditionallyDivestAttributes)
        .await
        .unwrap();
    assert_eq!(exec.attribute_owner(object, POSITION).await, Some(other.handle));
    // Nobody asked for the delete privilege; it is left unowned.
    assert_eq!(exec.attribute_owner(object, PRIVILEGE_TO_DELETE).await, None);
    assert!(other
        .drain()
        .iter()
        .any(|c| matches!(c, Callback::AttributeOwnershipAcquisitionNotification { .. })));
}

#[tokio::test]
async fn test_divested_delete_privilege_is_unowned_until_acquired() {
    let (owner, other, object) = vehicle_with(&[POSITION]).await;
    let exec = owner.execution.clone();
    let privilege = attrs(&[PRIVILEGE_TO_DELETE]);

    exec.unconditional_attribute_ownership_divestiture(owner.handle, object, &privilege)
        .await
        .unwrap();
    assert_eq!(exec.attribute_owner(object, PRIVILEGE_TO_DELETE).await, None);
    assert_eq!(
        exec.delete_object_instance(owner.handle, object, b"", None).await,
        Err(ObjectError::DeletePrivilegeNotHeld(object))
    );

    exec.publish_object_class_attributes(
        other.handle,
        VEHICLE,
        &attrs(&[POSITION, FUEL, HEADING, PRIVILEGE_TO_DELETE]),
    )
    .await
    .unwrap();
    let outcome = exec
        .attribute_ownership_acquisition_if_available(other.handle, object, &privilege, b"")
        .await
        .unwrap();
    assert_eq!(outcome.acquired, privilege);
    exec.delete_object_instance(other.handle, object, b"", None)
        .await
        .unwrap();
    assert!(exec.object_instance_name(object).await.is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn divested_attributes_are_always_available(mask in 1u8..8) {
        let chosen: Vec<_> = [POSITION, FUEL, HEADING]
            .into_iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, a)| a)
            .collect();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let (owner, other, object) = vehicle_with(&[POSITION, FUEL, HEADING]).await;
            let exec = owner.execution.clone();
            let set = attrs(&chosen);

            exec.unconditional_attribute_ownership_divestiture(owner.handle, object, &set)
                .await
                .unwrap();
            let outcome = exec
                .attribute_ownership_acquisition_if_available(other.handle, object, &set, b"")
                .await
                .unwrap();
            assert_eq!(outcome.acquired, set);
            assert!(outcome.unavailable.is_empty());
            for attribute in chosen {
                assert_eq!(exec.attribute_owner(object, attribute).await, Some(other.handle));
            }
        });
    }
}
