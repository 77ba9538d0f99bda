//! Test fixtures shared by the integration scenarios

use ohla_core::{
    AttributeHandle, Fdd, FederateHandle, InteractionClassHandle, LogicalTime, ObjectClassHandle,
    OrderType, ParameterHandle,
};
use ohla_federation::{
    AttributeSet, Callback, CallbackQueue, FederationExecution, Rti, SaveFailureReason,
};
use std::sync::Arc;

pub const VEHICLE: ObjectClassHandle = ObjectClassHandle(1);
/// Timestamp ordered.
pub const POSITION: AttributeHandle = AttributeHandle(2);
pub const FUEL: AttributeHandle = AttributeHandle(3);
pub const HEADING: AttributeHandle = AttributeHandle(4);

/// Timestamp ordered, one parameter.
pub const FIRE: InteractionClassHandle = InteractionClassHandle(1);
pub const TARGET: ParameterHandle = ParameterHandle(1);
/// Receive ordered, one parameter.
pub const CHAT: InteractionClassHandle = InteractionClassHandle(2);
pub const TEXT: ParameterHandle = ParameterHandle(1);

/// Initialize tracing only if not already initialized
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn test_fdd() -> Fdd {
    Fdd::builder()
        .object_class(
            "Vehicle",
            &[
                ("position", OrderType::TimeStamp),
                ("fuel", OrderType::Receive),
                ("heading", OrderType::Receive),
            ],
        )
        .interaction_class("Fire", OrderType::TimeStamp, &["target"])
        .interaction_class("Chat", OrderType::Receive, &["text"])
        .build()
        .expect("test FDD is valid")
}

pub fn attrs(handles: &[AttributeHandle]) -> AttributeSet {
    handles.iter().copied().collect()
}

/// A joined federate plus the callbacks it has drained so far.
pub struct TestFederate {
    pub handle: FederateHandle,
    pub execution: Arc<FederationExecution>,
    pub callbacks: CallbackQueue,
    pub received: Vec<Callback>,
}

impl TestFederate {
    pub async fn join(rti: &Rti, federation: &str, name: &str, federate_type: &str) -> Self {
        let joined = rti
            .join_federation_execution(federation, Some(name), federate_type)
            .await
            .expect("join succeeds");
        Self {
            handle: joined.handle,
            execution: joined.execution,
            callbacks: joined.callbacks,
            received: Vec::new(),
        }
    }

    /// Take everything queued since the last drain. Also kept in `received`.
    pub fn drain(&mut self) -> Vec<Callback> {
        let callbacks = self.callbacks.evoke_multiple_callbacks();
        self.received.extend(callbacks.iter().cloned());
        callbacks
    }

    pub fn grants(callbacks: &[Callback]) -> Vec<LogicalTime> {
        callbacks
            .iter()
            .filter_map(|c| match c {
                Callback::TimeAdvanceGrant(t) => Some(*t),
                _ => None,
            })
            .collect()
    }

    pub fn count(callbacks: &[Callback], wanted: &Callback) -> usize {
        callbacks.iter().filter(|c| *c == wanted).count()
    }

    pub fn not_saved_reasons(callbacks: &[Callback]) -> Vec<SaveFailureReason> {
        callbacks
            .iter()
            .filter_map(|c| match c {
                Callback::FederationNotSaved(reason) => Some(*reason),
                _ => None,
            })
            .collect()
    }

    /// Regulating with `lookahead` and constrained.
    pub async fn enable_time(&mut self, lookahead: i64) {
        self.execution
            .enable_time_regulation(self.handle, ohla_core::LogicalTimeInterval(lookahead))
            .await
            .expect("enable regulation");
        self.execution
            .enable_time_constrained(self.handle)
            .await
            .expect("enable constrained");
    }

    /// Go through the save protocol, reporting `state`.
    pub async fn save(&mut self, state: &[u8]) {
        self.execution
            .federate_save_begun(self.handle)
            .await
            .expect("save begun");
        self.execution
            .federate_save_complete(self.handle, state.to_vec())
            .await
            .expect("save complete");
    }
}

/// An in-memory RTI with one federation execution named `name`.
pub async fn federation(name: &str) -> Rti {
    init_tracing();
    let rti = Rti::in_memory();
    rti.create_federation_execution(name, test_fdd())
        .await
        .expect("create federation");
    tracing::debug!(federation = name, "Test federation created");
    rti
}
