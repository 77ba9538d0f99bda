//! Federation save and restore sessions.
//!
//! A save session moves every joined federate through
//! `instructed -> saving -> waiting`. Federates named in a timed save wait in
//! an extra `awaiting_time` set until their granted time reaches the save
//! time. The session concludes once nobody is left in the first three sets;
//! a single failure or resignation fails it for everyone.
//!
//! Updates and interactions sent by instructed federates are not applied;
//! they are appended to the session's buffered log, which is written into the
//! save artifact and applied to the live federation when the session ends.

use crate::callback::{
    AttributeValues, FederateRestoreStatus, FederateSaveStatus, ParameterValues,
};
use crate::error::{RestoreError, SaveError};
use crate::save_file::{FederateRecord, SaveArtifact};
use ohla_core::{
    FederateHandle, InteractionClassHandle, LogicalTime, MessageRetractionHandle,
    ObjectInstanceHandle,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveStatus {
    NoSaveInProgress,
    FederateInstructedToSave,
    FederateSaving,
    FederateWaitingForFederationToSave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreStatus {
    NoRestoreInProgress,
    FederateRestoring,
    FederateWaitingForFederationToRestore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveFailureReason {
    RtiUnableToSave,
    FederateReportedFailure,
    FederateResigned,
    RtiDetectedFailure,
    SaveTimeCannotBeHonored,
    SaveAborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreFailureReason {
    RtiUnableToRestore,
    FederateReportedFailure,
    FederateResigned,
    RtiDetectedFailure,
    RestoreAborted,
}

/// An attribute update held back while a save is in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedUpdate {
    pub object: ObjectInstanceHandle,
    pub values: AttributeValues,
    pub tag: Vec<u8>,
    pub time: Option<LogicalTime>,
    pub retraction: Option<MessageRetractionHandle>,
}

/// An interaction held back while a save is in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedInteraction {
    pub class: InteractionClassHandle,
    pub parameters: ParameterValues,
    pub tag: Vec<u8>,
    pub time: Option<LogicalTime>,
    pub retraction: Option<MessageRetractionHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferedMessage {
    UpdateAttributeValues(BufferedUpdate),
    SendInteraction(BufferedInteraction),
}

impl BufferedMessage {
    pub const UPDATE_ATTRIBUTE_VALUES: u8 = 1;
    pub const SEND_INTERACTION: u8 = 2;

    /// Type byte written ahead of the message in the save artifact.
    pub fn type_code(&self) -> u8 {
        match self {
            BufferedMessage::UpdateAttributeValues(_) => Self::UPDATE_ATTRIBUTE_VALUES,
            BufferedMessage::SendInteraction(_) => Self::SEND_INTERACTION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedEntry {
    pub sender: FederateHandle,
    pub message: BufferedMessage,
}

#[derive(Debug)]
pub(crate) struct SaveSession {
    label: String,
    time: Option<LogicalTime>,
    awaiting_time: BTreeSet<FederateHandle>,
    instructed: BTreeSet<FederateHandle>,
    saving: BTreeSet<FederateHandle>,
    waiting: BTreeSet<FederateHandle>,
    states: BTreeMap<FederateHandle, Vec<u8>>,
    failure: Option<SaveFailureReason>,
    buffered: Mutex<Vec<BufferedEntry>>,
}

impl SaveSession {
    pub(crate) fn new(
        label: String,
        time: Option<LogicalTime>,
        instructed: BTreeSet<FederateHandle>,
        awaiting_time: BTreeSet<FederateHandle>,
    ) -> Self {
        Self {
            label,
            time,
            awaiting_time,
            instructed,
            saving: BTreeSet::new(),
            waiting: BTreeSet::new(),
            states: BTreeMap::new(),
            failure: None,
            buffered: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn time(&self) -> Option<LogicalTime> {
        self.time
    }

    pub(crate) fn failure(&self) -> Option<SaveFailureReason> {
        self.failure
    }

    pub(crate) fn is_instructed(&self, federate: FederateHandle) -> bool {
        self.instructed.contains(&federate)
    }

    pub(crate) fn is_awaiting_time(&self, federate: FederateHandle) -> bool {
        self.awaiting_time.contains(&federate)
    }

    pub(crate) fn status_of(&self, federate: FederateHandle) -> SaveStatus {
        if self.instructed.contains(&federate) {
            SaveStatus::FederateInstructedToSave
        } else if self.saving.contains(&federate) {
            SaveStatus::FederateSaving
        } else if self.waiting.contains(&federate) {
            SaveStatus::FederateWaitingForFederationToSave
        } else {
            SaveStatus::NoSaveInProgress
        }
    }

    pub(crate) fn statuses(
        &self,
        federates: impl IntoIterator<Item = FederateHandle>,
    ) -> Vec<FederateSaveStatus> {
        federates
            .into_iter()
            .map(|federate| FederateSaveStatus {
                federate,
                status: self.status_of(federate),
            })
            .collect()
    }

    /// Move the federates `due` says are ready from the time wait into the
    /// instructed set and return them.
    pub(crate) fn instruct_due<F>(&mut self, due: F) -> Vec<FederateHandle>
    where
        F: Fn(FederateHandle) -> bool,
    {
        let ready: Vec<FederateHandle> = self
            .awaiting_time
            .iter()
            .copied()
            .filter(|f| due(*f))
            .collect();
        for federate in &ready {
            self.awaiting_time.remove(federate);
            self.instructed.insert(*federate);
        }
        ready
    }

    pub(crate) fn begun(&mut self, federate: FederateHandle) -> Result<(), SaveError> {
        if !self.instructed.remove(&federate) {
            return Err(SaveError::SaveNotInitiated);
        }
        self.saving.insert(federate);
        Ok(())
    }

    pub(crate) fn complete(&mut self, federate: FederateHandle, state: Vec<u8>) -> Result<(), SaveError> {
        if !self.saving.remove(&federate) {
            return Err(SaveError::FederateHasNotBegunSave);
        }
        self.states.insert(federate, state);
        self.waiting.insert(federate);
        Ok(())
    }

    pub(crate) fn not_complete(&mut self, federate: FederateHandle) -> Result<(), SaveError> {
        if !self.saving.remove(&federate) {
            return Err(SaveError::FederateHasNotBegunSave);
        }
        self.waiting.insert(federate);
        self.fail(SaveFailureReason::FederateReportedFailure);
        Ok(())
    }

    /// A participant resigned. Returns true if it was part of the session.
    pub(crate) fn remove_federate(&mut self, federate: FederateHandle) -> bool {
        let removed = self.awaiting_time.remove(&federate)
            | self.instructed.remove(&federate)
            | self.saving.remove(&federate)
            | self.waiting.remove(&federate);
        self.states.remove(&federate);
        if removed {
            self.fail(SaveFailureReason::FederateResigned);
        }
        removed
    }

    /// Record a failure. The first reason wins.
    pub(crate) fn fail(&mut self, reason: SaveFailureReason) {
        self.failure.get_or_insert(reason);
    }

    /// Every participant has reported. Federates still waiting for the save
    /// time no longer matter once the session has failed.
    pub(crate) fn is_finished(&self) -> bool {
        self.instructed.is_empty()
            && self.saving.is_empty()
            && (self.awaiting_time.is_empty() || self.failure.is_some())
    }

    pub(crate) fn take_states(&mut self) -> BTreeMap<FederateHandle, Vec<u8>> {
        std::mem::take(&mut self.states)
    }

    pub(crate) async fn buffer(&self, entry: BufferedEntry) {
        self.buffered.lock().await.push(entry);
    }

    pub(crate) async fn buffered(&self) -> Vec<BufferedEntry> {
        self.buffered.lock().await.clone()
    }

    pub(crate) fn take_buffered(&mut self) -> Vec<BufferedEntry> {
        std::mem::take(self.buffered.get_mut())
    }
}

#[derive(Debug)]
pub(crate) struct RestoreSession {
    label: String,
    artifact: SaveArtifact,
    /// Joined federate handle to the index of the record it restores.
    assignments: BTreeMap<FederateHandle, usize>,
    restoring: BTreeSet<FederateHandle>,
    waiting: BTreeSet<FederateHandle>,
    failure: Option<RestoreFailureReason>,
}

impl RestoreSession {
    pub(crate) fn new(
        label: String,
        artifact: SaveArtifact,
        assignments: BTreeMap<FederateHandle, usize>,
    ) -> Self {
        Self {
            label,
            restoring: assignments.keys().copied().collect(),
            artifact,
            assignments,
            waiting: BTreeSet::new(),
            failure: None,
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn artifact(&self) -> &SaveArtifact {
        &self.artifact
    }

    pub(crate) fn failure(&self) -> Option<RestoreFailureReason> {
        self.failure
    }

    /// Saved record each joined federate is restored from.
    pub(crate) fn assignments(&self) -> impl Iterator<Item = (FederateHandle, &FederateRecord)> {
        self.assignments
            .iter()
            .filter_map(|(f, i)| self.artifact.federates.get(*i).map(|r| (*f, r)))
    }

    pub(crate) fn into_artifact(self) -> SaveArtifact {
        self.artifact
    }

    pub(crate) fn status_of(&self, federate: FederateHandle) -> RestoreStatus {
        if self.restoring.contains(&federate) {
            RestoreStatus::FederateRestoring
        } else if self.waiting.contains(&federate) {
            RestoreStatus::FederateWaitingForFederationToRestore
        } else {
            RestoreStatus::NoRestoreInProgress
        }
    }

    pub(crate) fn statuses(
        &self,
        federates: impl IntoIterator<Item = FederateHandle>,
    ) -> Vec<FederateRestoreStatus> {
        federates
            .into_iter()
            .map(|federate| FederateRestoreStatus {
                federate,
                status: self.status_of(federate),
            })
            .collect()
    }

    pub(crate) fn complete(&mut self, federate: FederateHandle) -> Result<(), RestoreError> {
        if !self.restoring.remove(&federate) {
            return Err(RestoreError::RestoreNotRequested);
        }
        self.waiting.insert(federate);
        Ok(())
    }

    pub(crate) fn not_complete(&mut self, federate: FederateHandle) -> Result<(), RestoreError> {
        self.complete(federate)?;
        self.fail(RestoreFailureReason::FederateReportedFailure);
        Ok(())
    }

    pub(crate) fn remove_federate(&mut self, federate: FederateHandle) -> bool {
        let removed = self.restoring.remove(&federate) | self.waiting.remove(&federate);
        self.assignments.remove(&federate);
        if removed {
            self.fail(RestoreFailureReason::FederateResigned);
        }
        removed
    }

    pub(crate) fn fail(&mut self, reason: RestoreFailureReason) {
        self.failure.get_or_insert(reason);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.restoring.is_empty()
    }
}

/// Pair joined federates with saved records of the same federate type, in
/// ascending handle order on both sides. `None` if the type census differs.
pub(crate) fn pair_by_type(
    joined: &[(FederateHandle, String)],
    records: &[FederateRecord],
) -> Option<BTreeMap<FederateHandle, usize>> {
    if joined.len() != records.len() {
        return None;
    }

    let mut saved: BTreeMap<&str, Vec<(FederateHandle, usize)>> = BTreeMap::new();
    for (index, record) in records.iter().enumerate() {
        saved
            .entry(record.federate_type.as_str())
            .or_default()
            .push((record.handle, index));
    }
    let mut current: BTreeMap<&str, Vec<FederateHandle>> = BTreeMap::new();
    for (handle, federate_type) in joined {
        current.entry(federate_type.as_str()).or_default().push(*handle);
    }
    if saved.len() != current.len() {
        return None;
    }

    let mut assignments = BTreeMap::new();
    for (federate_type, mut handles) in current {
        let mut slots = saved.remove(federate_type)?;
        if slots.len() != handles.len() {
            return None;
        }
        handles.sort();
        slots.sort();
        for (handle, (_, index)) in handles.into_iter().zip(slots) {
            assignments.insert(handle, index);
        }
    }
    Some(assignments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Declarations;

    const A: FederateHandle = FederateHandle(1);
    const B: FederateHandle = FederateHandle(2);

    fn session() -> SaveSession {
        SaveSession::new("s1".into(), None, BTreeSet::from([A, B]), BTreeSet::new())
    }

    #[test]
    fn test_save_phases() {
        let mut save = session();
        assert_eq!(save.status_of(A), SaveStatus::FederateInstructedToSave);
        assert_eq!(save.complete(A, vec![]), Err(SaveError::FederateHasNotBegunSave));

        save.begun(A).unwrap();
        assert_eq!(save.begun(A), Err(SaveError::SaveNotInitiated));
        assert_eq!(save.status_of(A), SaveStatus::FederateSaving);
        save.complete(A, vec![1, 2]).unwrap();
        assert_eq!(save.status_of(A), SaveStatus::FederateWaitingForFederationToSave);
        assert!(!save.is_finished());

        save.begun(B).unwrap();
        save.complete(B, vec![3]).unwrap();
        assert!(save.is_finished());
        assert_eq!(save.failure(), None);
        assert_eq!(save.take_states().len(), 2);
    }

    #[test]
    fn test_failure_poisons_session() {
        let mut save = session();
        save.begun(A).unwrap();
        save.not_complete(A).unwrap();
        save.remove_federate(B);
        assert!(save.is_finished());
        assert_eq!(save.failure(), Some(SaveFailureReason::FederateReportedFailure));
    }

    #[test]
    fn test_resignation_fails_session() {
        let mut save = session();
        assert!(save.remove_federate(A));
        assert!(!save.remove_federate(FederateHandle(9)));
        assert_eq!(save.failure(), Some(SaveFailureReason::FederateResigned));
    }

    #[test]
    fn test_timed_save_instructs_when_due() {
        let mut save = SaveSession::new(
            "timed".into(),
            Some(LogicalTime(10)),
            BTreeSet::from([A]),
            BTreeSet::from([B]),
        );
        assert!(save.is_awaiting_time(B));
        assert_eq!(save.status_of(B), SaveStatus::NoSaveInProgress);
        assert!(save.instruct_due(|_| false).is_empty());
        assert_eq!(save.instruct_due(|f| f == B), vec![B]);
        assert!(save.is_instructed(B));
    }

    #[tokio::test]
    async fn test_buffered_log_keeps_order() {
        let mut save = session();
        for n in 0..3u8 {
            save.buffer(BufferedEntry {
                sender: A,
                message: BufferedMessage::SendInteraction(BufferedInteraction {
                    class: InteractionClassHandle(1),
                    parameters: ParameterValues::new(),
                    tag: vec![n],
                    time: None,
                    retraction: None,
                }),
            })
            .await;
        }
        let tags: Vec<u8> = save
            .take_buffered()
            .into_iter()
            .map(|e| match e.message {
                BufferedMessage::SendInteraction(i) => i.tag[0],
                BufferedMessage::UpdateAttributeValues(u) => u.tag[0],
            })
            .collect();
        assert_eq!(tags, vec![0, 1, 2]);
        assert!(save.buffered().await.is_empty());
    }

    fn record(handle: u64, federate_type: &str) -> FederateRecord {
        FederateRecord {
            handle: FederateHandle(handle),
            name: format!("f{handle}"),
            federate_type: federate_type.into(),
            state: vec![],
            declarations: Declarations::default(),
        }
    }

    #[test]
    fn test_pairing_by_type_in_handle_order() {
        let records = vec![record(7, "tank"), record(3, "tank"), record(5, "radar")];
        let joined = vec![
            (FederateHandle(1), "radar".to_string()),
            (FederateHandle(2), "tank".to_string()),
            (FederateHandle(4), "tank".to_string()),
        ];
        let pairs = pair_by_type(&joined, &records).unwrap();
        assert_eq!(pairs[&FederateHandle(1)], 2);
        assert_eq!(pairs[&FederateHandle(2)], 1);
        assert_eq!(pairs[&FederateHandle(4)], 0);

        let mismatched = vec![
            (FederateHandle(1), "radar".to_string()),
            (FederateHandle(2), "radar".to_string()),
            (FederateHandle(4), "tank".to_string()),
        ];
        assert!(pair_by_type(&mismatched, &records).is_none());
    }

    #[test]
    fn test_restore_phases() {
        let artifact = SaveArtifact::empty_for_tests(vec![record(1, "t")]);
        let mut restore = RestoreSession::new(
            "s1".into(),
            artifact,
            BTreeMap::from([(A, 0)]),
        );
        assert_eq!(restore.status_of(A), RestoreStatus::FederateRestoring);
        assert_eq!(restore.assignments().count(), 1);
        restore.complete(A).unwrap();
        assert_eq!(restore.complete(A), Err(RestoreError::RestoreNotRequested));
        assert!(restore.is_finished());
        assert_eq!(restore.failure(), None);
    }
}
