//! Time management coordinator.
//!
//! Tracks the logical time state of every joined federate and decides when
//! time advance requests may be granted.
//!
//! # Watermarks
//!
//! - **LOTS** (least outgoing time stamp) of a regulating federate is the
//!   smallest timestamp it may still send. It depends on the federate's
//!   advance state and never decreases.
//! - **GALT** seen by federate `f` is the minimum LOTS over the regulating
//!   federates other than `f`; nothing below it can still reach `f`. The
//!   federation-wide GALT (minimum over all regulators) never decreases.
//! - **LITS** seen by `f` is the earliest undelivered timestamp-ordered
//!   message in the federation that is later than `f`'s current time.
//!
//! # Grants
//!
//! | request | granted at | when |
//! |---------|-----------|------|
//! | TAR(t)  | t | GALT > t |
//! | TARA(t) | t | GALT ≥ t |
//! | NMR(t)  | min(t, LITS) | GALT > min(t, LITS) |
//! | NMRA(t) | min(t, LITS) | GALT ≥ min(t, LITS) |
//! | FQR(t)  | min(t, LITS, GALT) | immediately, every queued message released |
//!
//! Federates that are not time constrained are granted immediately.
//! Grant evaluation runs after every change that can move a watermark.

use crate::callback::{Callback, Outbox};
use crate::error::{FederationError, TimeError};
use ohla_core::{
    FederateHandle, HandleAllocator, LogicalTime, LogicalTimeInterval, MessageRetractionHandle,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use tracing::{debug, info};

/// Where a federate stands in the time advance protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvanceState {
    Granted,
    TimeAdvanceRequested(LogicalTime),
    TimeAdvanceRequestedAvailable(LogicalTime),
    NextMessageRequested(LogicalTime),
    NextMessageRequestedAvailable(LogicalTime),
    FlushQueueRequested(LogicalTime),
}

impl AdvanceState {
    pub fn is_advancing(&self) -> bool {
        !matches!(self, AdvanceState::Granted)
    }

    pub fn requested_time(&self) -> Option<LogicalTime> {
        match *self {
            AdvanceState::Granted => None,
            AdvanceState::TimeAdvanceRequested(t)
            | AdvanceState::TimeAdvanceRequestedAvailable(t)
            | AdvanceState::NextMessageRequested(t)
            | AdvanceState::NextMessageRequestedAvailable(t)
            | AdvanceState::FlushQueueRequested(t) => Some(t),
        }
    }

    fn is_next_message(&self) -> bool {
        matches!(
            self,
            AdvanceState::NextMessageRequested(_) | AdvanceState::NextMessageRequestedAvailable(_)
        )
    }
}

/// Time state of one federate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederateTime {
    pub time: LogicalTime,
    pub lookahead: LogicalTimeInterval,
    pub regulating: bool,
    pub constrained: bool,
    pub constrained_pending: bool,
    pub advance: AdvanceState,
    lots_floor: Option<LogicalTime>,
}

impl FederateTime {
    fn new(time: LogicalTime) -> Self {
        Self {
            time,
            lookahead: LogicalTimeInterval::ZERO,
            regulating: false,
            constrained: false,
            constrained_pending: false,
            advance: AdvanceState::Granted,
            lots_floor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub retraction: Option<MessageRetractionHandle>,
    pub callback: Callback,
}

/// Where the copies of one timestamp-ordered message went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retraction {
    pub sender: FederateHandle,
    pub time: LogicalTime,
    pub queued_for: BTreeSet<FederateHandle>,
    pub delivered_to: BTreeSet<FederateHandle>,
    /// Released early by a flush; no longer retractable.
    pub flushed: bool,
}

/// A queued message in a [`TimeSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedSnapshot {
    pub receiver: FederateHandle,
    pub time: LogicalTime,
    pub sequence: u64,
    pub message: QueuedMessage,
}

/// Serializable image of a [`TimeCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSnapshot {
    pub federates: Vec<(FederateHandle, FederateTime)>,
    pub queues: Vec<QueuedSnapshot>,
    pub retractions: Vec<(MessageRetractionHandle, Retraction)>,
    pub next_retraction: u64,
    pub sequence: u64,
    pub galt_high_water: Option<LogicalTime>,
}

type Queue = BTreeMap<(LogicalTime, u64), QueuedMessage>;

/// Per-federation time management state.
#[derive(Debug)]
pub struct TimeCoordinator {
    initial_time: LogicalTime,
    federates: BTreeMap<FederateHandle, FederateTime>,
    queues: BTreeMap<FederateHandle, Queue>,
    retractions: BTreeMap<MessageRetractionHandle, Retraction>,
    retraction_handles: HandleAllocator<MessageRetractionHandle>,
    sequence: u64,
    lots: BTreeMap<FederateHandle, LogicalTime>,
    galt_high_water: Option<LogicalTime>,
}

impl TimeCoordinator {
    pub fn new(initial_time: LogicalTime) -> Self {
        Self {
            initial_time,
            federates: BTreeMap::new(),
            queues: BTreeMap::new(),
            retractions: BTreeMap::new(),
            retraction_handles: HandleAllocator::new(),
            sequence: 0,
            lots: BTreeMap::new(),
            galt_high_water: None,
        }
    }

    pub(crate) fn add_federate(&mut self, federate: FederateHandle) {
        self.federates
            .insert(federate, FederateTime::new(self.initial_time));
    }

    pub(crate) fn remove_federate(&mut self, federate: FederateHandle, out: &mut Outbox) {
        self.federates.remove(&federate);
        self.queues.remove(&federate);
        self.lots.remove(&federate);
        for entry in self.retractions.values_mut() {
            entry.queued_for.remove(&federate);
            entry.delivered_to.remove(&federate);
        }
        self.evaluate(out);
    }

    fn state(&self, federate: FederateHandle) -> Result<&FederateTime, TimeError> {
        self.federates
            .get(&federate)
            .ok_or(TimeError::Federation(FederationError::FederateNotExecutionMember(federate)))
    }

    fn state_mut(&mut self, federate: FederateHandle) -> Result<&mut FederateTime, TimeError> {
        self.federates
            .get_mut(&federate)
            .ok_or(TimeError::Federation(FederationError::FederateNotExecutionMember(federate)))
    }

    fn not_advancing(&self, federate: FederateHandle) -> Result<&FederateTime, TimeError> {
        let state = self.state(federate)?;
        if state.advance.is_advancing() {
            return Err(TimeError::InTimeAdvancingState);
        }
        Ok(state)
    }

    pub fn federate(&self, federate: FederateHandle) -> Option<&FederateTime> {
        self.federates.get(&federate)
    }

    pub fn logical_time(&self, federate: FederateHandle) -> Result<LogicalTime, TimeError> {
        Ok(self.state(federate)?.time)
    }

    pub fn lookahead(&self, federate: FederateHandle) -> Result<LogicalTimeInterval, TimeError> {
        Ok(self.state(federate)?.lookahead)
    }

    pub fn is_regulating(&self, federate: FederateHandle) -> bool {
        self.federates.get(&federate).map(|s| s.regulating).unwrap_or(false)
    }

    pub fn is_constrained(&self, federate: FederateHandle) -> bool {
        self.federates.get(&federate).map(|s| s.constrained).unwrap_or(false)
    }

    /// Least outgoing time stamp of a regulating federate.
    pub fn lots(&self, federate: FederateHandle) -> Option<LogicalTime> {
        self.lots.get(&federate).copied()
    }

    /// Federation-wide GALT: minimum LOTS over all regulating federates.
    pub fn galt(&self) -> Option<LogicalTime> {
        self.lots.values().min().copied()
    }

    /// GALT as seen by `federate`. `None` means no other federate regulates.
    pub fn galt_for(&self, federate: FederateHandle) -> Option<LogicalTime> {
        Self::min_excluding(&self.lots, federate)
    }

    /// Earliest undelivered timestamp-ordered message later than the
    /// federate's current time.
    pub fn lits_for(&self, federate: FederateHandle) -> Option<LogicalTime> {
        let time = self.federates.get(&federate)?.time;
        self.lits_after(time)
    }

    fn lits_after(&self, time: LogicalTime) -> Option<LogicalTime> {
        self.queues
            .values()
            .filter_map(|queue| {
                queue
                    .range((Bound::Excluded((time, u64::MAX)), Bound::Unbounded))
                    .next()
                    .map(|((t, _), _)| *t)
            })
            .min()
    }

    fn min_excluding(
        lots: &BTreeMap<FederateHandle, LogicalTime>,
        federate: FederateHandle,
    ) -> Option<LogicalTime> {
        lots.iter()
            .filter(|(f, _)| **f != federate)
            .map(|(_, t)| *t)
            .min()
    }

    pub(crate) fn enable_time_regulation(
        &mut self,
        federate: FederateHandle,
        lookahead: LogicalTimeInterval,
        out: &mut Outbox,
    ) -> Result<LogicalTime, TimeError> {
        let state = self.not_advancing(federate)?;
        if state.regulating {
            return Err(TimeError::TimeRegulationAlreadyEnabled);
        }
        if !lookahead.is_positive() {
            return Err(TimeError::InvalidLookahead(lookahead));
        }

        // The new LOTS must not undercut the federation GALT nor reach into
        // the past of any constrained federate.
        let floor = self
            .federates
            .iter()
            .filter(|(f, s)| **f != federate && s.constrained)
            .map(|(_, s)| s.time.successor())
            .chain(self.galt_high_water)
            .max();
        let current = state.time;
        let time = match floor {
            Some(floor) => current.max(floor.saturating_sub(lookahead)),
            None => current,
        };

        let state = self.state_mut(federate)?;
        state.time = time;
        state.lookahead = lookahead;
        state.regulating = true;
        state.lots_floor = Some(time + lookahead);
        if time > current {
            self.deliver(federate, Some(time), false, out);
        }

        info!(federate = %federate, time = %time, lookahead = %lookahead, "Time regulation enabled");
        out.push(federate, Callback::TimeRegulationEnabled(time));
        self.evaluate(out);
        Ok(time)
    }

    pub(crate) fn disable_time_regulation(
        &mut self,
        federate: FederateHandle,
        out: &mut Outbox,
    ) -> Result<(), TimeError> {
        if !self.not_advancing(federate)?.regulating {
            return Err(TimeError::TimeRegulationIsNotEnabled);
        }
        self.state_mut(federate)?.regulating = false;
        self.lots.remove(&federate);
        info!(federate = %federate, "Time regulation disabled");
        self.evaluate(out);
        Ok(())
    }

    pub(crate) fn enable_time_constrained(
        &mut self,
        federate: FederateHandle,
        out: &mut Outbox,
    ) -> Result<(), TimeError> {
        let state = self.state(federate)?;
        if state.constrained {
            return Err(TimeError::TimeConstrainedAlreadyEnabled);
        }
        if state.constrained_pending {
            return Err(TimeError::RequestForTimeConstrainedPending);
        }
        if state.advance.is_advancing() {
            return Err(TimeError::InTimeAdvancingState);
        }
        self.state_mut(federate)?.constrained_pending = true;
        self.evaluate(out);
        Ok(())
    }

    pub(crate) fn disable_time_constrained(
        &mut self,
        federate: FederateHandle,
        out: &mut Outbox,
    ) -> Result<(), TimeError> {
        if !self.not_advancing(federate)?.constrained {
            return Err(TimeError::TimeConstrainedIsNotEnabled);
        }
        self.state_mut(federate)?.constrained = false;

        // Whatever was waiting is now receive order.
        let mut released = Outbox::new();
        self.deliver(federate, None, false, &mut released);
        for (receiver, callback) in released.into_entries() {
            out.push(receiver, callback.into_receive_order());
        }
        info!(federate = %federate, "Time constrained disabled");
        self.evaluate(out);
        Ok(())
    }

    pub(crate) fn modify_lookahead(
        &mut self,
        federate: FederateHandle,
        lookahead: LogicalTimeInterval,
        out: &mut Outbox,
    ) -> Result<(), TimeError> {
        if !self.not_advancing(federate)?.regulating {
            return Err(TimeError::TimeRegulationIsNotEnabled);
        }
        if !lookahead.is_positive() {
            return Err(TimeError::InvalidLookahead(lookahead));
        }
        self.state_mut(federate)?.lookahead = lookahead;
        self.evaluate(out);
        Ok(())
    }

    /// Enter one of the advancing states. Grants that become possible are
    /// issued before returning.
    pub(crate) fn request_advance(
        &mut self,
        federate: FederateHandle,
        request: AdvanceState,
        out: &mut Outbox,
    ) -> Result<(), TimeError> {
        let state = self.state(federate)?;
        if state.constrained_pending {
            return Err(TimeError::RequestForTimeConstrainedPending);
        }
        if state.advance.is_advancing() {
            return Err(TimeError::InTimeAdvancingState);
        }
        let Some(requested) = request.requested_time() else {
            return Ok(());
        };
        if requested <= state.time {
            return Err(TimeError::LogicalTimeAlreadyPassed(requested));
        }

        debug!(federate = %federate, request = ?request, "Time advance requested");
        self.state_mut(federate)?.advance = request;
        self.evaluate(out);
        Ok(())
    }

    /// Check a timestamp a regulating federate wants to send with. Returns
    /// the federate's LOTS when the timestamp is too early.
    pub(crate) fn validate_send(
        &self,
        federate: FederateHandle,
        time: LogicalTime,
    ) -> Result<(), LogicalTime> {
        match self.lots(federate) {
            Some(lots) if time < lots => Err(lots),
            _ => Ok(()),
        }
    }

    pub(crate) fn allocate_retraction(&mut self) -> MessageRetractionHandle {
        self.retraction_handles.allocate()
    }

    /// Route a timestamp-ordered message. Constrained receivers get it queued;
    /// everyone else gets it now in receive order.
    pub(crate) fn enqueue(
        &mut self,
        retraction: MessageRetractionHandle,
        sender: FederateHandle,
        time: LogicalTime,
        deliveries: Vec<(FederateHandle, Callback)>,
        out: &mut Outbox,
    ) {
        let mut entry = Retraction {
            sender,
            time,
            queued_for: BTreeSet::new(),
            delivered_to: BTreeSet::new(),
            flushed: false,
        };
        for (receiver, callback) in deliveries {
            if self.is_constrained(receiver) {
                self.sequence += 1;
                self.queues.entry(receiver).or_default().insert(
                    (time, self.sequence),
                    QueuedMessage {
                        retraction: Some(retraction),
                        callback,
                    },
                );
                entry.queued_for.insert(receiver);
            } else {
                out.push(receiver, callback.into_receive_order());
                entry.delivered_to.insert(receiver);
            }
        }
        self.retraction_handles.advance_past(retraction.value());
        self.retractions.insert(retraction, entry);
        self.evaluate(out);
    }

    pub(crate) fn retract(
        &mut self,
        federate: FederateHandle,
        handle: MessageRetractionHandle,
        out: &mut Outbox,
    ) -> Result<(), TimeError> {
        let sender_time = self.state(federate)?.time;
        let Some(entry) = self.retractions.get(&handle) else {
            return Err(if self.retraction_handles.has_issued(handle) {
                TimeError::MessageCanNoLongerBeRetracted(handle)
            } else {
                TimeError::InvalidMessageRetractionHandle(handle)
            });
        };
        if entry.sender != federate {
            return Err(TimeError::InvalidMessageRetractionHandle(handle));
        }
        let galt_passed = self.galt().map(|g| g > entry.time).unwrap_or(false);
        if entry.flushed || galt_passed || sender_time > entry.time {
            return Err(TimeError::MessageCanNoLongerBeRetracted(handle));
        }

        let Some(entry) = self.retractions.remove(&handle) else {
            return Err(TimeError::InvalidMessageRetractionHandle(handle));
        };
        for receiver in &entry.queued_for {
            if let Some(queue) = self.queues.get_mut(receiver) {
                queue.retain(|(t, _), m| *t != entry.time || m.retraction != Some(handle));
            }
        }
        for receiver in &entry.delivered_to {
            out.push(*receiver, Callback::RequestRetraction(handle));
        }
        debug!(federate = %federate, retraction = %handle, "Message retracted");
        self.evaluate(out);
        Ok(())
    }

    /// Hand `federate` its queued messages up to `up_to` (all when `None`),
    /// in timestamp then arrival order.
    fn deliver(
        &mut self,
        federate: FederateHandle,
        up_to: Option<LogicalTime>,
        flush: bool,
        out: &mut Outbox,
    ) {
        let Some(queue) = self.queues.get_mut(&federate) else {
            return;
        };
        let keys: Vec<(LogicalTime, u64)> = match up_to {
            Some(limit) => queue.range(..=(limit, u64::MAX)).map(|(k, _)| *k).collect(),
            None => queue.keys().copied().collect(),
        };
        for key in keys {
            if let Some(message) = queue.remove(&key) {
                if let Some(entry) = message
                    .retraction
                    .and_then(|h| self.retractions.get_mut(&h))
                {
                    entry.queued_for.remove(&federate);
                    entry.delivered_to.insert(federate);
                    entry.flushed |= flush;
                }
                out.push(federate, message.callback);
            }
        }
    }

    /// Recompute LOTS for every regulating federate.
    ///
    /// A federate waiting in a next-message state may be granted as early as
    /// the earliest message that can still reach it, which is bounded by the
    /// GALT it sees. That makes its LOTS depend on the others', so the values
    /// are relaxed from above until stable.
    fn refresh_lots(&mut self) {
        let mut lots: BTreeMap<FederateHandle, LogicalTime> = BTreeMap::new();
        for (federate, state) in self.federates.iter().filter(|(_, s)| s.regulating) {
            let base = match state.advance {
                AdvanceState::Granted | AdvanceState::FlushQueueRequested(_) => state.time,
                AdvanceState::TimeAdvanceRequested(t)
                | AdvanceState::TimeAdvanceRequestedAvailable(t) => t,
                AdvanceState::NextMessageRequested(t)
                | AdvanceState::NextMessageRequestedAvailable(t) => {
                    self.lits_after(state.time).map_or(t, |lits| t.min(lits))
                }
            };
            lots.insert(*federate, Self::floored(state, base + state.lookahead));
        }

        for _ in 0..=lots.len() {
            let mut changed = false;
            for (federate, state) in self
                .federates
                .iter()
                .filter(|(_, s)| s.regulating && s.advance.is_next_message())
            {
                let Some(target) = state.advance.requested_time() else {
                    continue;
                };
                let mut bound = target;
                if let Some(lits) = self.lits_after(state.time) {
                    bound = bound.min(lits);
                }
                if let Some(galt) = Self::min_excluding(&lots, *federate) {
                    bound = bound.min(galt);
                }
                let value = Self::floored(state, bound + state.lookahead);
                if lots.get(federate) != Some(&value) {
                    lots.insert(*federate, value);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        for (federate, value) in &lots {
            if let Some(state) = self.federates.get_mut(federate) {
                state.lots_floor = Some(*value);
            }
        }
        self.lots = lots;
    }

    fn floored(state: &FederateTime, value: LogicalTime) -> LogicalTime {
        state.lots_floor.map_or(value, |floor| value.max(floor))
    }

    /// Grant time for `federate`, if it can be granted now. The flag is set
    /// for flush grants.
    fn grant_for(&self, federate: FederateHandle, state: &FederateTime) -> Option<(LogicalTime, bool)> {
        let galt = self.galt_for(federate);
        let below = |t: LogicalTime| galt.map_or(true, |g| g > t);
        let at_or_below = |t: LogicalTime| galt.map_or(true, |g| g >= t);
        let next_message = |t: LogicalTime| self.lits_after(state.time).map_or(t, |lits| t.min(lits));

        match state.advance {
            AdvanceState::Granted => None,
            AdvanceState::FlushQueueRequested(t) => {
                if !state.constrained {
                    return Some((t, true));
                }
                let mut grant = next_message(t);
                if let Some(g) = galt {
                    grant = grant.min(g);
                }
                Some((grant.max(state.time), true))
            }
            _ if !state.constrained => state.advance.requested_time().map(|t| (t, false)),
            AdvanceState::TimeAdvanceRequested(t) => below(t).then_some((t, false)),
            AdvanceState::TimeAdvanceRequestedAvailable(t) => at_or_below(t).then_some((t, false)),
            AdvanceState::NextMessageRequested(t) => {
                let target = next_message(t);
                below(target).then_some((target, false))
            }
            AdvanceState::NextMessageRequestedAvailable(t) => {
                let target = next_message(t);
                at_or_below(target).then_some((target, false))
            }
        }
    }

    /// Issue every grant and constrained-enable that has become possible.
    pub(crate) fn evaluate(&mut self, out: &mut Outbox) {
        loop {
            self.refresh_lots();

            let mut enabled = Vec::new();
            let mut grants = Vec::new();
            for (federate, state) in &self.federates {
                if state.constrained_pending {
                    if self.galt_for(*federate).map_or(true, |g| g > state.time) {
                        enabled.push(*federate);
                    }
                    continue;
                }
                if let Some((time, flush)) = self.grant_for(*federate, state) {
                    grants.push((*federate, time, flush));
                }
            }
            if enabled.is_empty() && grants.is_empty() {
                break;
            }

            for federate in enabled {
                if let Some(state) = self.federates.get_mut(&federate) {
                    state.constrained = true;
                    state.constrained_pending = false;
                    info!(federate = %federate, time = %state.time, "Time constrained enabled");
                    out.push(federate, Callback::TimeConstrainedEnabled(state.time));
                }
            }
            for (federate, time, flush) in grants {
                self.deliver(federate, if flush { None } else { Some(time) }, flush, out);
                if let Some(state) = self.federates.get_mut(&federate) {
                    state.time = time;
                    state.advance = AdvanceState::Granted;
                }
                debug!(federate = %federate, time = %time, flush, "Time advance granted");
                out.push(federate, Callback::TimeAdvanceGrant(time));
            }
        }

        if let Some(galt) = self.galt() {
            if self.galt_high_water.map_or(true, |h| galt > h) {
                debug!(galt = %galt, "GALT advanced");
                self.galt_high_water = Some(galt);
            }
        }
        self.prune_retractions();
    }

    /// Forget messages that can no longer be retracted: flushed ones, those
    /// below GALT and those whose sender has advanced past them.
    fn prune_retractions(&mut self) {
        let galt = self.galt();
        let federates = &self.federates;
        self.retractions.retain(|_, entry| {
            let sender_passed = federates
                .get(&entry.sender)
                .map_or(true, |s| s.time > entry.time);
            let galt_passed = galt.map_or(false, |g| g > entry.time);
            !(entry.flushed || galt_passed || sender_passed)
        });
    }

    #[cfg(test)]
    fn pending_retractions(&self) -> usize {
        self.retractions.len()
    }

    pub fn snapshot(&self) -> TimeSnapshot {
        TimeSnapshot {
            federates: self
                .federates
                .iter()
                .map(|(f, s)| (*f, s.clone()))
                .collect(),
            queues: self
                .queues
                .iter()
                .flat_map(|(receiver, queue)| {
                    queue.iter().map(move |((time, sequence), message)| QueuedSnapshot {
                        receiver: *receiver,
                        time: *time,
                        sequence: *sequence,
                        message: message.clone(),
                    })
                })
                .collect(),
            retractions: self
                .retractions
                .iter()
                .map(|(h, r)| (*h, r.clone()))
                .collect(),
            next_retraction: self.retraction_handles.next_value(),
            sequence: self.sequence,
            galt_high_water: self.galt_high_water,
        }
    }

    pub fn from_snapshot(initial_time: LogicalTime, snapshot: TimeSnapshot) -> Self {
        let mut queues: BTreeMap<FederateHandle, Queue> = BTreeMap::new();
        for queued in snapshot.queues {
            queues
                .entry(queued.receiver)
                .or_default()
                .insert((queued.time, queued.sequence), queued.message);
        }
        let mut coordinator = Self {
            initial_time,
            federates: snapshot.federates.into_iter().collect(),
            queues,
            retractions: snapshot.retractions.into_iter().collect(),
            retraction_handles: HandleAllocator::resume_from(snapshot.next_retraction),
            sequence: snapshot.sequence,
            lots: BTreeMap::new(),
            galt_high_water: snapshot.galt_high_water,
        };
        coordinator.refresh_lots();
        coordinator
    }
}
