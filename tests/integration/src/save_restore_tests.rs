//! Federation save and restore, including round trips through a file store

use crate::test_utils::*;
use ohla_core::{FederateHandle, LogicalTime};
use ohla_federation::{
    AttributeValues, Callback, DeclarationError, FederationError, FileSaveStore, ParameterValues,
    ResignAction, RestoreFailureReason, Rti, SaveError, SaveFailureReason,
};
use std::sync::Arc;

fn chat(text: &str) -> ParameterValues {
    ParameterValues::from([(TEXT, text.as_bytes().to_vec())])
}

fn chat_texts(callbacks: &[Callback]) -> Vec<String> {
    callbacks
        .iter()
        .filter_map(|c| match c {
            Callback::ReceiveInteraction { class, parameters, .. } if *class == CHAT => parameters
                .get(&TEXT)
                .map(|t| String::from_utf8_lossy(t).into_owned()),
            _ => None,
        })
        .collect()
}

/// Handle, name and state from the `InitiateFederateRestore` callback.
fn restore_instruction(callbacks: &[Callback]) -> Option<(FederateHandle, String, Vec<u8>)> {
    callbacks.iter().find_map(|c| match c {
        Callback::InitiateFederateRestore { handle, name, state, .. } => {
            Some((*handle, name.clone(), state.clone()))
        }
        _ => None,
    })
}

async fn group(rti: &Rti, federation: &str, count: usize) -> Vec<TestFederate> {
    let mut federates = Vec::new();
    for i in 0..count {
        federates.push(TestFederate::join(rti, federation, &format!("f{i}"), "sim").await);
    }
    federates
}

#[tokio::test]
async fn test_messages_sent_before_save_begun_are_buffered_and_replayed() {
    let rti = federation("buffered").await;
    let mut listener = TestFederate::join(&rti, "buffered", "listener", "ear").await;
    let mut talker = TestFederate::join(&rti, "buffered", "talker", "mouth").await;
    let exec = listener.execution.clone();
    exec.subscribe_interaction_class(listener.handle, CHAT).await.unwrap();
    exec.publish_interaction_class(talker.handle, CHAT).await.unwrap();

    exec.request_federation_save(listener.handle, "S1", None).await.unwrap();
    listener.save(b"listener-state").await;

    // The talker has been told to save but has not begun.
    exec.send_interaction(talker.handle, CHAT, chat("one"), b"", None)
        .await
        .unwrap();
    exec.send_interaction(talker.handle, CHAT, chat("two"), b"", None)
        .await
        .unwrap();
    assert!(chat_texts(&listener.drain()).is_empty());

    talker.save(b"talker-state").await;
    let after_save = listener.drain();
    assert_eq!(TestFederate::count(&after_save, &Callback::FederationSaved), 1);
    assert_eq!(chat_texts(&after_save), vec!["one", "two"]);
    talker.drain();

    exec.request_federation_restore(listener.handle, "S1").await.unwrap();
    let begun = listener.drain();
    assert!(begun.contains(&Callback::RequestFederationRestoreSucceeded("S1".into())));
    assert!(begun.contains(&Callback::FederationRestoreBegun));
    assert!(begun.contains(&Callback::InitiateFederateRestore {
        label: "S1".into(),
        name: "listener".into(),
        handle: listener.handle,
        state: b"listener-state".to_vec(),
    }));

    exec.federate_restore_complete(listener.handle).await.unwrap();
    exec.federate_restore_complete(talker.handle).await.unwrap();
    let restored = listener.drain();
    let position = restored
        .iter()
        .position(|c| *c == Callback::FederationRestored)
        .unwrap();
    assert!(chat_texts(&restored[..position]).is_empty());
    assert_eq!(chat_texts(&restored[position..]), vec!["one", "two"]);
}

#[tokio::test]
async fn test_every_federate_is_told_saved_exactly_once() {
    let rti = federation("all-saved").await;
    let mut federates = group(&rti, "all-saved", 3).await;
    let exec = federates[0].execution.clone();

    exec.request_federation_save(federates[1].handle, "full", None)
        .await
        .unwrap();
    for federate in federates.iter_mut() {
        let callbacks = federate.drain();
        assert_eq!(
            callbacks,
            vec![Callback::InitiateFederateSave {
                label: "full".into(),
                time: None,
            }]
        );
    }
    for federate in federates.iter_mut() {
        federate.save(b"ok").await;
    }
    for federate in federates.iter_mut() {
        let callbacks = federate.drain();
        assert_eq!(TestFederate::count(&callbacks, &Callback::FederationSaved), 1);
        assert!(TestFederate::not_saved_reasons(&callbacks).is_empty());
    }

    // Back to normal service.
    exec.publish_interaction_class(federates[0].handle, CHAT)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_one_failure_fails_the_save_for_everyone() {
    let rti = federation("one-fails").await;
    let mut federates = group(&rti, "one-fails", 3).await;
    let exec = federates[0].execution.clone();

    exec.request_federation_save(federates[0].handle, "broken", None)
        .await
        .unwrap();
    federates[0].save(b"ok").await;
    exec.federate_save_begun(federates[1].handle).await.unwrap();
    exec.federate_save_not_complete(federates[1].handle)
        .await
        .unwrap();
    federates[2].save(b"ok").await;

    for federate in federates.iter_mut() {
        let callbacks = federate.drain();
        assert_eq!(
            TestFederate::not_saved_reasons(&callbacks),
            vec![SaveFailureReason::FederateReportedFailure]
        );
        assert_eq!(TestFederate::count(&callbacks, &Callback::FederationSaved), 0);
    }

    // Nothing was stored under the label.
    exec.request_federation_restore(federates[0].handle, "broken")
        .await
        .unwrap();
    assert_eq!(
        federates[0].drain(),
        vec![Callback::RequestFederationRestoreFailed("broken".into())]
    );
}

#[tokio::test]
async fn test_resigning_during_save_fails_it() {
    let rti = federation("resign-save").await;
    let mut stays = TestFederate::join(&rti, "resign-save", "stays", "sim").await;
    let leaves = TestFederate::join(&rti, "resign-save", "leaves", "sim").await;
    let exec = stays.execution.clone();

    exec.request_federation_save(stays.handle, "s", None).await.unwrap();
    stays.save(b"state").await;
    exec.resign(leaves.handle, ResignAction::DeleteObjectsThenDivest)
        .await
        .unwrap();

    assert_eq!(
        TestFederate::not_saved_reasons(&stays.drain()),
        vec![SaveFailureReason::FederateResigned]
    );
    assert_eq!(
        exec.federate_save_begun(stays.handle).await,
        Err(SaveError::SaveNotInitiated)
    );
}

#[tokio::test]
async fn test_timed_save_waits_for_the_grant() {
    let rti = federation("timed").await;
    let mut first = TestFederate::join(&rti, "timed", "first", "sim").await;
    let mut second = TestFederate::join(&rti, "timed", "second", "sim").await;
    first.enable_time(1).await;
    second.enable_time(1).await;
    first.drain();
    second.drain();
    let exec = first.execution.clone();

    exec.request_federation_save(first.handle, "at-ten", Some(LogicalTime(10)))
        .await
        .unwrap();
    assert!(first.drain().is_empty());
    assert!(second.drain().is_empty());

    // Federates still short of the save time keep advancing.
    exec.time_advance_request(first.handle, LogicalTime(10)).await.unwrap();
    exec.time_advance_request(second.handle, LogicalTime(10)).await.unwrap();

    let instruction = Callback::InitiateFederateSave {
        label: "at-ten".into(),
        time: Some(LogicalTime(10)),
    };
    for federate in [&mut first, &mut second] {
        let callbacks = federate.drain();
        assert_eq!(
            callbacks,
            vec![Callback::TimeAdvanceGrant(LogicalTime(10)), instruction.clone()]
        );
    }

    first.save(b"1").await;
    second.save(b"2").await;
    assert_eq!(TestFederate::count(&first.drain(), &Callback::FederationSaved), 1);
    assert_eq!(TestFederate::count(&second.drain(), &Callback::FederationSaved), 1);
}

#[tokio::test]
async fn test_aborted_save_reports_and_releases() {
    let rti = federation("abort").await;
    let mut federates = group(&rti, "abort", 2).await;
    let exec = federates[0].execution.clone();

    assert_eq!(
        exec.abort_federation_save(federates[0].handle).await,
        Err(SaveError::SaveNotInProgress)
    );
    exec.request_federation_save(federates[0].handle, "a", None)
        .await
        .unwrap();
    federates[0].save(b"x").await;
    exec.abort_federation_save(federates[1].handle).await.unwrap();

    for federate in federates.iter_mut() {
        assert_eq!(
            TestFederate::not_saved_reasons(&federate.drain()),
            vec![SaveFailureReason::SaveAborted]
        );
    }
    exec.publish_interaction_class(federates[1].handle, CHAT)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_restore_reports_federate_failure() {
    let rti = federation("restore-fail").await;
    let mut federates = group(&rti, "restore-fail", 2).await;
    let exec = federates[0].execution.clone();

    exec.request_federation_save(federates[0].handle, "base", None)
        .await
        .unwrap();
    for federate in federates.iter_mut() {
        federate.save(b"s").await;
        federate.drain();
    }

    exec.request_federation_restore(federates[1].handle, "base")
        .await
        .unwrap();
    assert_eq!(
        exec.publish_interaction_class(federates[0].handle, CHAT).await,
        Err(DeclarationError::Federation(FederationError::RestoreInProgress))
    );
    exec.federate_restore_complete(federates[0].handle)
        .await
        .unwrap();
    exec.federate_restore_not_complete(federates[1].handle)
        .await
        .unwrap();

    for federate in federates.iter_mut() {
        assert!(federate.drain().contains(&Callback::FederationNotRestored(
            RestoreFailureReason::FederateReportedFailure
        )));
    }
}

#[tokio::test]
async fn test_restore_of_unknown_label_is_refused() {
    let rti = federation("no-label").await;
    let mut federate = TestFederate::join(&rti, "no-label", "only", "sim").await;
    let exec = federate.execution.clone();

    exec.request_federation_restore(federate.handle, "missing")
        .await
        .unwrap();
    assert_eq!(
        federate.drain(),
        vec![Callback::RequestFederationRestoreFailed("missing".into())]
    );
    // The federation never left normal service.
    exec.request_federation_save(federate.handle, "fresh", None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_round_trip_into_a_fresh_execution() {
    init_tracing();
    let directory = tempfile::tempdir().unwrap();

    // Build up some state and save it.
    let (saved_owners, saved_names, alpha_handle, beta_handle) = {
        let store = Arc::new(FileSaveStore::new(directory.path()).unwrap());
        let rti = Rti::new(store, LogicalTime::INITIAL);
        rti.create_federation_execution("world", test_fdd()).await.unwrap();
        let mut alpha = TestFederate::join(&rti, "world", "alpha", "tank").await;
        let mut beta = TestFederate::join(&rti, "world", "beta", "radar").await;
        let exec = alpha.execution.clone();

        exec.publish_object_class_attributes(alpha.handle, VEHICLE, &attrs(&[POSITION, FUEL]))
            .await
            .unwrap();
        let everything = attrs(&[POSITION, FUEL, HEADING]);
        exec.publish_object_class_attributes(beta.handle, VEHICLE, &attrs(&[HEADING]))
            .await
            .unwrap();
        exec.subscribe_object_class_attributes(beta.handle, VEHICLE, &everything)
            .await
            .unwrap();
        exec.reserve_object_instance_name(alpha.handle, "Alpha-1")
            .await
            .unwrap();
        let named = exec
            .register_object_instance(alpha.handle, VEHICLE, Some("Alpha-1"))
            .await
            .unwrap();
        let unnamed = exec
            .register_object_instance(alpha.handle, VEHICLE, None)
            .await
            .unwrap();
        exec.attribute_ownership_acquisition_if_available(beta.handle, named, &attrs(&[HEADING]), b"")
            .await
            .unwrap();

        exec.request_federation_save(beta.handle, "snapshot", None)
            .await
            .unwrap();
        alpha.save(b"alpha-state").await;
        beta.save(b"beta-state").await;
        assert_eq!(TestFederate::count(&alpha.drain(), &Callback::FederationSaved), 1);
        beta.drain();

        let mut owners = Vec::new();
        let mut names = Vec::new();
        for object in [named, unnamed] {
            for attribute in [POSITION, FUEL, HEADING] {
                owners.push((object, attribute, exec.attribute_owner(object, attribute).await));
            }
            names.push((object, exec.object_instance_name(object).await.unwrap()));
        }
        (owners, names, alpha.handle, beta.handle)
    };

    // A fresh RTI over the same directory; the types join in reverse order.
    let store = Arc::new(FileSaveStore::new(directory.path()).unwrap());
    let rti = Rti::new(store, LogicalTime::INITIAL);
    rti.create_federation_execution("world", test_fdd()).await.unwrap();
    let mut radar = TestFederate::join(&rti, "world", "radar-new", "radar").await;
    let mut tank = TestFederate::join(&rti, "world", "tank-new", "tank").await;
    let exec = radar.execution.clone();
    assert!(exec.object_instance_handles().await.is_empty());

    exec.request_federation_restore(tank.handle, "snapshot")
        .await
        .unwrap();
    let (radar_to, radar_name, radar_state) = restore_instruction(&radar.drain()).unwrap();
    let (tank_to, tank_name, tank_state) = restore_instruction(&tank.drain()).unwrap();
    assert_eq!((radar_to, radar_name.as_str()), (beta_handle, "beta"));
    assert_eq!((tank_to, tank_name.as_str()), (alpha_handle, "alpha"));
    assert_eq!(radar_state, b"beta-state".to_vec());
    assert_eq!(tank_state, b"alpha-state".to_vec());

    // Old handles are used until the restore concludes.
    exec.federate_restore_complete(radar.handle).await.unwrap();
    exec.federate_restore_complete(tank.handle).await.unwrap();
    assert!(radar.drain().contains(&Callback::FederationRestored));
    assert!(tank.drain().contains(&Callback::FederationRestored));
    radar.handle = radar_to;
    tank.handle = tank_to;

    for (object, attribute, owner) in saved_owners {
        assert_eq!(exec.attribute_owner(object, attribute).await, owner);
    }
    for (object, name) in saved_names {
        assert_eq!(exec.object_instance_name(object).await.unwrap(), name);
        assert_eq!(exec.object_instance_handle(&name).await.unwrap(), object);
    }
    assert_eq!(exec.federate_handle("alpha").await, Some(alpha_handle));
    assert_eq!(exec.federate_handle("beta").await, Some(beta_handle));
    assert_eq!(exec.federate_handle("tank-new").await, None);

    // The restored owner keeps updating under its saved handle.
    let named = exec.object_instance_handle("Alpha-1").await.unwrap();
    exec.update_attribute_values(tank.handle, named, AttributeValues::from([(FUEL, vec![42])]), b"", None)
        .await
        .unwrap();
    assert!(radar.drain().iter().any(|c| matches!(
        c,
        Callback::ReflectAttributeValues { object, producer, .. }
            if *object == named && *producer == alpha_handle
    )));

    // New joiners never reuse a saved handle.
    let late = TestFederate::join(&rti, "world", "late", "radar").await;
    assert!(late.handle > FederateHandle(2));
}
