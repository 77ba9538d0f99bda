//! Time management across joined federates

use crate::test_utils::*;
use ohla_core::{LogicalTime, LogicalTimeInterval, OrderType};
use ohla_federation::{AttributeValues, Callback, ParameterValues, TimeError};
use proptest::prelude::*;

fn fire_at(target: u8) -> ParameterValues {
    ParameterValues::from([(TARGET, vec![target])])
}

/// Two regulating and constrained federates, lookaheads 1 and 2. The first
/// publishes `Fire`, the second subscribes to it.
async fn shooter_and_target(name: &str) -> (TestFederate, TestFederate) {
    let rti = federation(name).await;
    let mut shooter = TestFederate::join(&rti, name, "shooter", "gun").await;
    let mut target = TestFederate::join(&rti, name, "target", "tank").await;
    shooter.enable_time(1).await;
    target.enable_time(2).await;

    let exec = shooter.execution.clone();
    exec.publish_interaction_class(shooter.handle, FIRE).await.unwrap();
    exec.subscribe_interaction_class(target.handle, FIRE).await.unwrap();
    shooter.drain();
    target.drain();
    (shooter, target)
}

#[tokio::test]
async fn test_next_message_request_grants_earliest_event_first() {
    let (mut shooter, mut target) = shooter_and_target("nmr").await;
    let exec = shooter.execution.clone();

    let retraction = exec
        .send_interaction(shooter.handle, FIRE, fire_at(7), b"bang", Some(LogicalTime(3)))
        .await
        .unwrap();
    assert!(retraction.is_some());
    assert!(target.drain().is_empty());

    exec.next_message_request(shooter.handle, LogicalTime(5)).await.unwrap();
    assert!(shooter.drain().is_empty());
    exec.next_message_request(target.handle, LogicalTime(5)).await.unwrap();

    assert_eq!(TestFederate::grants(&shooter.drain()), vec![LogicalTime(3)]);
    let callbacks = target.drain();
    assert_eq!(callbacks.len(), 2);
    assert!(matches!(
        &callbacks[0],
        Callback::ReceiveInteraction {
            class,
            time: Some(LogicalTime(3)),
            order: OrderType::TimeStamp,
            ..
        } if *class == FIRE
    ));
    assert_eq!(callbacks[1], Callback::TimeAdvanceGrant(LogicalTime(3)));

    exec.next_message_request(shooter.handle, LogicalTime(5)).await.unwrap();
    exec.next_message_request(target.handle, LogicalTime(5)).await.unwrap();
    assert_eq!(TestFederate::grants(&shooter.drain()), vec![LogicalTime(5)]);
    assert_eq!(TestFederate::grants(&target.drain()), vec![LogicalTime(5)]);
    assert_eq!(exec.query_logical_time(target.handle).await, Ok(LogicalTime(5)));
}

#[tokio::test]
async fn test_retracted_message_is_never_delivered() {
    let (mut shooter, mut target) = shooter_and_target("retract").await;
    let exec = shooter.execution.clone();

    let handle = exec
        .send_interaction(shooter.handle, FIRE, fire_at(1), b"", Some(LogicalTime(4)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exec.query_lits(target.handle).await, Ok(Some(LogicalTime(4))));

    assert_eq!(
        exec.retract(target.handle, handle).await,
        Err(TimeError::InvalidMessageRetractionHandle(handle))
    );
    exec.retract(shooter.handle, handle).await.unwrap();
    assert_eq!(exec.query_lits(target.handle).await, Ok(None));

    exec.time_advance_request(shooter.handle, LogicalTime(10)).await.unwrap();
    exec.time_advance_request(target.handle, LogicalTime(6)).await.unwrap();
    assert_eq!(target.drain(), vec![Callback::TimeAdvanceGrant(LogicalTime(6))]);
    shooter.drain();
}

#[tokio::test]
async fn test_lookahead_must_be_positive() {
    let rti = federation("lookahead").await;
    let federate = TestFederate::join(&rti, "lookahead", "f", "t").await;
    let exec = federate.execution.clone();

    assert_eq!(
        exec.enable_time_regulation(federate.handle, LogicalTimeInterval(0)).await,
        Err(TimeError::InvalidLookahead(LogicalTimeInterval(0)))
    );
    assert_eq!(
        exec.query_lookahead(federate.handle).await,
        Err(TimeError::TimeRegulationIsNotEnabled)
    );
    exec.enable_time_regulation(federate.handle, LogicalTimeInterval(3))
        .await
        .unwrap();
    assert_eq!(
        exec.modify_lookahead(federate.handle, LogicalTimeInterval(-1)).await,
        Err(TimeError::InvalidLookahead(LogicalTimeInterval(-1)))
    );
    assert_eq!(
        exec.query_lookahead(federate.handle).await,
        Ok(LogicalTimeInterval(3))
    );
}

#[tokio::test]
async fn test_update_splits_timestamped_and_receive_attributes() {
    let rti = federation("split").await;
    let mut owner = TestFederate::join(&rti, "split", "owner", "tank").await;
    let mut observer = TestFederate::join(&rti, "split", "observer", "radar").await;
    owner.enable_time(1).await;
    observer.enable_time(1).await;
    let exec = owner.execution.clone();

    let both = attrs(&[POSITION, FUEL]);
    exec.publish_object_class_attributes(owner.handle, VEHICLE, &both)
        .await
        .unwrap();
    exec.subscribe_object_class_attributes(observer.handle, VEHICLE, &both)
        .await
        .unwrap();
    let object = exec
        .register_object_instance(owner.handle, VEHICLE, None)
        .await
        .unwrap();
    owner.drain();
    observer.drain();

    let retraction = exec
        .update_attribute_values(
            owner.handle,
            object,
            AttributeValues::from([(POSITION, vec![1, 2]), (FUEL, vec![80])]),
            b"tick",
            Some(LogicalTime(5)),
        )
        .await
        .unwrap();
    assert!(retraction.is_some());

    // Fuel is receive ordered and arrives at once, still carrying its time.
    assert_eq!(
        observer.drain(),
        vec![Callback::ReflectAttributeValues {
            object,
            values: AttributeValues::from([(FUEL, vec![80])]),
            tag: b"tick".to_vec(),
            time: Some(LogicalTime(5)),
            order: OrderType::Receive,
            retraction: None,
            producer: owner.handle,
        }]
    );

    exec.time_advance_request(owner.handle, LogicalTime(10)).await.unwrap();
    exec.time_advance_request(observer.handle, LogicalTime(6)).await.unwrap();
    assert_eq!(
        observer.drain(),
        vec![
            Callback::ReflectAttributeValues {
                object,
                values: AttributeValues::from([(POSITION, vec![1, 2])]),
                tag: b"tick".to_vec(),
                time: Some(LogicalTime(5)),
                order: OrderType::TimeStamp,
                retraction,
                producer: owner.handle,
            },
            Callback::TimeAdvanceGrant(LogicalTime(6)),
        ]
    );
}

#[tokio::test]
async fn test_resigned_regulator_no_longer_holds_back_galt() {
    let (shooter, mut target) = shooter_and_target("resign-galt").await;
    let exec = shooter.execution.clone();

    exec.time_advance_request(target.handle, LogicalTime(20)).await.unwrap();
    assert!(target.drain().is_empty());
    assert_eq!(exec.query_galt(target.handle).await, Ok(Some(LogicalTime(1))));

    exec.resign(shooter.handle, ohla_federation::ResignAction::NoAction)
        .await
        .unwrap();
    assert_eq!(exec.query_galt(target.handle).await, Ok(None));
    assert_eq!(
        TestFederate::grants(&target.drain()),
        vec![LogicalTime(20)]
    );
}

#[derive(Debug, Clone)]
enum Step {
    Advance { federate: usize, kind: u8, by: i64 },
    Fire { federate: usize, after: i64 },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0usize..3, 0u8..4, 1i64..6).prop_map(|(federate, kind, by)| Step::Advance {
            federate,
            kind,
            by
        }),
        (0usize..3, 0i64..6).prop_map(|(federate, after)| Step::Fire { federate, after }),
    ]
}

/// Walk one federate's callbacks: grants never go backwards and every
/// timestamp-ordered message lies between the grant before it and the one
/// after it.
fn check_causal(callbacks: &[Callback], last_grant: &mut LogicalTime) -> Result<(), String> {
    let mut since_grant: Vec<LogicalTime> = Vec::new();
    for callback in callbacks {
        match callback {
            Callback::ReceiveInteraction {
                time: Some(at),
                order: OrderType::TimeStamp,
                ..
            } => {
                if *at < *last_grant {
                    return Err(format!("message at {at} after grant {last_grant}"));
                }
                since_grant.push(*at);
            }
            Callback::TimeAdvanceGrant(granted) => {
                if *granted < *last_grant {
                    return Err(format!("grant {granted} after grant {last_grant}"));
                }
                if let Some(late) = since_grant.iter().find(|at| **at > *granted) {
                    return Err(format!("message at {late} delivered before grant {granted}"));
                }
                since_grant.clear();
                *last_grant = *granted;
            }
            _ => {}
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn grants_and_deliveries_respect_causality(steps in prop::collection::vec(step(), 0..40)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let result: Result<(), String> = runtime.block_on(async {
            let rti = federation("causality").await;
            let mut federates = Vec::new();
            for (i, lookahead) in [1, 2, 3].into_iter().enumerate() {
                let mut federate =
                    TestFederate::join(&rti, "causality", &format!("f{i}"), "sim").await;
                federate.enable_time(lookahead).await;
                let exec = federate.execution.clone();
                exec.publish_interaction_class(federate.handle, FIRE).await.unwrap();
                exec.subscribe_interaction_class(federate.handle, FIRE).await.unwrap();
                federates.push(federate);
            }
            let exec = federates[0].execution.clone();
            let mut last_grants = vec![LogicalTime::INITIAL; federates.len()];
            let mut galts = vec![None; federates.len()];

            for step in steps {
                match step {
                    Step::Advance { federate, kind, by } => {
                        let handle = federates[federate].handle;
                        let now = exec.query_logical_time(handle).await.unwrap();
                        let to = now + LogicalTimeInterval(by);
                        let _ = match kind {
                            0 => exec.time_advance_request(handle, to).await,
                            1 => exec.time_advance_request_available(handle, to).await,
                            2 => exec.next_message_request(handle, to).await,
                            _ => exec.next_message_request_available(handle, to).await,
                        };
                    }
                    Step::Fire { federate, after } => {
                        let handle = federates[federate].handle;
                        let now = exec.query_logical_time(handle).await.unwrap();
                        let lookahead = exec.query_lookahead(handle).await.unwrap();
                        let at = now + lookahead + LogicalTimeInterval(after);
                        let _ = exec
                            .send_interaction(handle, FIRE, fire_at(0), b"", Some(at))
                            .await;
                    }
                }

                for (i, federate) in federates.iter_mut().enumerate() {
                    let callbacks = federate.drain();
                    check_causal(&callbacks, &mut last_grants[i])?;
                    let galt = exec.query_galt(federate.handle).await.unwrap();
                    if let (Some(previous), Some(current)) = (galts[i], galt) {
                        if current < previous {
                            return Err(format!("GALT fell from {previous} to {current}"));
                        }
                    }
                    if galt.is_some() {
                        galts[i] = galt;
                    }
                }
            }
            Ok::<(), String>(())
        });
        prop_assert!(result.is_ok(), "{:?}", result);
    }
}
