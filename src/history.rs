//! Append-only history of one execution.

use crate::entity::OperationRequest;
use crate::{Event, ParentLink, ScheduleKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("event id {actual} is out of order, expected {expected}")]
    OutOfOrder { expected: u64, actual: u64 },
    #[error("history must begin with ExecutionStarted, found {0}")]
    MissingStart(&'static str),
    #[error("execution already ended with {0}")]
    Closed(&'static str),
    #[error("only a failed execution can be rewound")]
    NotRewindable,
}

/// Start metadata of an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedInfo {
    pub name: String,
    pub input: String,
    pub parent: Option<ParentLink>,
    pub timestamp_ms: u64,
}

/// Ordered, append-only event log for one execution of an instance.
///
/// Ids are contiguous and start at 1. The only mutation is [`append`](Self::append);
/// rewinding is itself an appended marker that voids earlier failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryLog {
    events: Vec<Event>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted events, validating the id sequence.
    pub fn from_events(events: Vec<Event>) -> Result<Self, HistoryError> {
        let mut log = Self::new();
        for e in events {
            log.append(e)?;
        }
        Ok(log)
    }

    /// Append one event. An `event_id` of 0 is assigned the next id; any
    /// other id must be exactly the next one.
    pub fn append(&mut self, mut event: Event) -> Result<u64, HistoryError> {
        let expected = self.next_event_id();
        match event.event_id() {
            0 => event.set_event_id(expected),
            id if id != expected => return Err(HistoryError::OutOfOrder { expected, actual: id }),
            _ => {}
        }
        if self.events.is_empty() && !matches!(event, Event::ExecutionStarted { .. }) {
            return Err(HistoryError::MissingStart(event.kind()));
        }
        if let Some(end) = self.terminal() {
            match (&event, end) {
                (Event::ExecutionRewound { .. }, Event::ExecutionFailed { .. }) => {}
                (Event::ExecutionRewound { .. }, _) => return Err(HistoryError::NotRewindable),
                _ => return Err(HistoryError::Closed(end.kind())),
            }
        } else if matches!(event, Event::ExecutionRewound { .. }) {
            return Err(HistoryError::NotRewindable);
        }
        self.events.push(event);
        Ok(expected)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn next_event_id(&self) -> u64 {
        self.events.last().map(|e| e.event_id() + 1).unwrap_or(crate::INITIAL_EVENT_ID)
    }

    pub fn get(&self, event_id: u64) -> Option<&Event> {
        if event_id == 0 {
            return None;
        }
        self.events.get((event_id - 1) as usize)
    }

    pub fn started(&self) -> Option<StartedInfo> {
        match self.events.first() {
            Some(Event::ExecutionStarted {
                name,
                input,
                parent,
                timestamp_ms,
                ..
            }) => Some(StartedInfo {
                name: name.clone(),
                input: input.clone(),
                parent: parent.clone(),
                timestamp_ms: *timestamp_ms,
            }),
            _ => None,
        }
    }

    /// Scheduling events in the order they were recorded. The Nth entry is
    /// what the Nth scheduling call of a replay pass must match.
    pub fn scheduling_events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(|e| e.schedule_kind().is_some())
    }

    pub fn schedule_kind_of(&self, event_id: u64) -> Option<ScheduleKind> {
        self.get(event_id).and_then(|e| e.schedule_kind()).map(|(k, _)| k)
    }

    fn last_rewind_id(&self) -> Option<u64> {
        self.events
            .iter()
            .rev()
            .find(|e| matches!(e, Event::ExecutionRewound { .. }))
            .map(Event::event_id)
    }

    /// Failure events recorded before the latest rewind marker no longer count.
    pub fn is_voided(&self, event: &Event) -> bool {
        match self.last_rewind_id() {
            Some(rewind) => event.is_rewindable_failure() && event.event_id() < rewind,
            None => false,
        }
    }

    /// The event that ended the execution, if any.
    pub fn terminal(&self) -> Option<&Event> {
        self.events.iter().rev().find(|e| e.is_terminal() && !self.is_voided(e))
    }

    pub fn has_completion_for(&self, source_event_id: u64) -> bool {
        self.events
            .iter()
            .any(|e| e.source_event_id() == Some(source_event_id) && !self.is_voided(e))
    }

    /// Scheduling events whose only outcome was voided by the latest rewind.
    pub fn rewound_schedulings(&self) -> Vec<&Event> {
        let Some(rewind) = self.last_rewind_id() else {
            return Vec::new();
        };
        self.events
            .iter()
            .filter(|e| e.event_id() < rewind && e.schedule_kind().is_some())
            .filter(|e| {
                let id = e.event_id();
                let voided = self
                    .events
                    .iter()
                    .any(|c| c.source_event_id() == Some(id) && self.is_voided(c));
                voided && !self.has_completion_for(id)
            })
            .collect()
    }

    /// Operations of an entity batch that started but has not completed yet.
    pub fn open_entity_batch(&self) -> Option<&[OperationRequest]> {
        let mut open = None;
        for e in &self.events {
            match e {
                Event::EntityBatchStarted { operations, .. } => open = Some(operations.as_slice()),
                Event::EntityBatchCompleted { .. } => open = None,
                _ => {}
            }
        }
        open
    }
}
