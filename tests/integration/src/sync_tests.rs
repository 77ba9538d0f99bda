//! Synchronization points and the request/response protocol

use crate::test_utils::*;
use ohla_core::{FederateHandle, LogicalTime};
use ohla_federation::{
    Callback, FederationError, Request, Response, ResponsePayload, ResignAction, ServiceError,
    SyncError, SynchronizationPointFailureReason,
};
use std::collections::BTreeSet;

fn synchronized(label: &str, failed: &[FederateHandle]) -> Callback {
    Callback::FederationSynchronized {
        label: label.into(),
        failed: failed.iter().copied().collect(),
    }
}

fn announced(label: &str, tag: &[u8]) -> Callback {
    Callback::AnnounceSynchronizationPoint {
        label: label.into(),
        tag: tag.to_vec(),
    }
}

#[tokio::test]
async fn test_whole_federation_point_includes_late_joiner() {
    let rti = federation("sync").await;
    let mut a = TestFederate::join(&rti, "sync", "a", "sim").await;
    let mut b = TestFederate::join(&rti, "sync", "b", "sim").await;
    let exec = a.execution.clone();

    exec.register_federation_synchronization_point(a.handle, "ready", b"go", None)
        .await
        .unwrap();
    assert_eq!(
        a.drain(),
        vec![
            Callback::SynchronizationPointRegistrationSucceeded("ready".into()),
            announced("ready", b"go"),
        ]
    );
    assert_eq!(b.drain(), vec![announced("ready", b"go")]);

    let mut late = TestFederate::join(&rti, "sync", "late", "sim").await;
    assert_eq!(late.drain(), vec![announced("ready", b"go")]);

    exec.synchronization_point_achieved(a.handle, "ready", true)
        .await
        .unwrap();
    exec.synchronization_point_achieved(b.handle, "ready", true)
        .await
        .unwrap();
    assert!(a.drain().is_empty());

    exec.synchronization_point_achieved(late.handle, "ready", false)
        .await
        .unwrap();
    let expected = synchronized("ready", &[late.handle]);
    for federate in [&mut a, &mut b, &mut late] {
        assert_eq!(federate.drain(), vec![expected.clone()]);
    }

    // The point is gone once synchronized.
    assert_eq!(
        exec.synchronization_point_achieved(a.handle, "ready", true).await,
        Err(SyncError::SynchronizationPointLabelNotAnnounced("ready".into()))
    );
}

#[tokio::test]
async fn test_registration_failures_are_reported_to_the_requester() {
    let rti = federation("sync-fail").await;
    let mut a = TestFederate::join(&rti, "sync-fail", "a", "sim").await;
    let mut b = TestFederate::join(&rti, "sync-fail", "b", "sim").await;
    let exec = a.execution.clone();

    let stranger = BTreeSet::from([a.handle, FederateHandle(99)]);
    exec.register_federation_synchronization_point(a.handle, "p", b"", Some(stranger))
        .await
        .unwrap();
    assert_eq!(
        a.drain(),
        vec![Callback::SynchronizationPointRegistrationFailed {
            label: "p".into(),
            reason: SynchronizationPointFailureReason::SynchronizationSetMemberNotJoined,
        }]
    );

    let only_a = BTreeSet::from([a.handle]);
    exec.register_federation_synchronization_point(a.handle, "p", b"", Some(only_a))
        .await
        .unwrap();
    exec.register_federation_synchronization_point(b.handle, "p", b"", None)
        .await
        .unwrap();
    assert_eq!(
        b.drain(),
        vec![Callback::SynchronizationPointRegistrationFailed {
            label: "p".into(),
            reason: SynchronizationPointFailureReason::SynchronizationPointLabelNotUnique,
        }]
    );
    // b is not part of the set.
    assert!(exec
        .synchronization_point_achieved(b.handle, "p", true)
        .await
        .is_err());
}

#[tokio::test]
async fn test_resigning_member_completes_the_point() {
    let rti = federation("sync-resign").await;
    let mut a = TestFederate::join(&rti, "sync-resign", "a", "sim").await;
    let b = TestFederate::join(&rti, "sync-resign", "b", "sim").await;
    let exec = a.execution.clone();

    exec.register_federation_synchronization_point(a.handle, "end", b"", None)
        .await
        .unwrap();
    exec.synchronization_point_achieved(a.handle, "end", true)
        .await
        .unwrap();
    a.drain();

    exec.resign(b.handle, ResignAction::NoAction).await.unwrap();
    assert_eq!(a.drain(), vec![synchronized("end", &[])]);
}

#[tokio::test]
async fn test_synchronization_is_allowed_during_save() {
    let rti = federation("sync-save").await;
    let mut a = TestFederate::join(&rti, "sync-save", "a", "sim").await;
    let exec = a.execution.clone();

    exec.request_federation_save(a.handle, "s", None).await.unwrap();
    a.drain();
    exec.register_federation_synchronization_point(a.handle, "mid-save", b"", None)
        .await
        .unwrap();
    assert!(a
        .drain()
        .contains(&Callback::SynchronizationPointRegistrationSucceeded("mid-save".into())));
}

#[tokio::test]
async fn test_json_requests_are_dispatched() {
    let rti = federation("wire").await;
    let mut sender = TestFederate::join(&rti, "wire", "sender", "sim").await;
    let mut receiver = TestFederate::join(&rti, "wire", "receiver", "sim").await;
    let exec = sender.execution.clone();

    let call = |json: serde_json::Value| -> Request {
        serde_json::from_value(json).unwrap()
    };

    let response = exec
        .dispatch(
            sender.handle,
            call(serde_json::json!({ "service": "publish_interaction_class", "class": 2 })),
        )
        .await;
    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        serde_json::json!({ "ok": { "kind": "unit" } })
    );
    exec.dispatch(
        receiver.handle,
        call(serde_json::json!({ "service": "subscribe_interaction_class", "class": 2 })),
    )
    .await;

    let response = exec
        .dispatch(
            sender.handle,
            call(serde_json::json!({
                "service": "send_interaction",
                "class": 2,
                "parameters": {},
                "tag": [104, 105],
                "time": null,
            })),
        )
        .await;
    assert_eq!(response, Response::Ok(ResponsePayload::Retraction(None)));
    assert!(receiver.drain().iter().any(|c| matches!(
        c,
        Callback::ReceiveInteraction { class, tag, producer, .. }
            if *class == CHAT && tag.as_slice() == b"hi" && *producer == sender.handle
    )));

    let response = exec
        .dispatch(
            receiver.handle,
            call(serde_json::json!({ "service": "query_logical_time" })),
        )
        .await;
    assert_eq!(response, Response::Ok(ResponsePayload::Time(LogicalTime(0))));

    // Failures travel back as typed errors.
    let response = exec
        .dispatch(
            receiver.handle,
            call(serde_json::json!({
                "service": "synchronization_point_achieved",
                "label": "never",
                "successful": true,
            })),
        )
        .await;
    let wire = serde_json::to_string(&response).unwrap();
    let decoded: Response = serde_json::from_str(&wire).unwrap();
    assert_eq!(
        decoded,
        Response::Failed(ServiceError::Sync(
            SyncError::SynchronizationPointLabelNotAnnounced("never".into())
        ))
    );

    let response = exec
        .dispatch(
            FederateHandle(77),
            call(serde_json::json!({ "service": "query_logical_time" })),
        )
        .await;
    assert!(matches!(
        response,
        Response::Failed(ServiceError::Time(ohla_federation::TimeError::Federation(
            FederationError::FederateNotExecutionMember(FederateHandle(77))
        )))
    ));
    sender.drain();
}
