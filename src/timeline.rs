use std::collections::HashMap;

use tracing::debug;

use crate::events::ProcessedEvent;

pub type Generation = u64;

/// Ordered activity rows for the turn currently in flight. Every append is
/// stamped with the generation issued by the owning reset, so rows from a
/// superseded turn can never leak into the next one even when the network
/// delivers them late.
#[derive(Debug, Default)]
pub struct ActivityTimeline {
    events: Vec<ProcessedEvent>,
    generation: Generation,
}

impl ActivityTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn events(&self) -> &[ProcessedEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Starts a new turn: clears the rows and issues the generation that
    /// subsequent appends must carry.
    pub fn reset(&mut self) -> Generation {
        self.generation += 1;
        self.events.clear();
        self.generation
    }

    pub fn append(&mut self, generation: Generation, event: ProcessedEvent) -> bool {
        if generation != self.generation {
            debug!(
                "dropping activity event from superseded turn {generation} (current {})",
                self.generation
            );
            return false;
        }
        self.events.push(event);
        true
    }

    /// Replaces the rows with a previously saved sequence, issuing a fresh
    /// generation so any still-running stream cannot append into it.
    pub fn restore(&mut self, events: Vec<ProcessedEvent>) -> Generation {
        self.generation += 1;
        self.events = events;
        self.generation
    }
}

/// Finalized activity sequences, keyed by the message id their turn produced.
#[derive(Debug, Default)]
pub struct HistoricalActivities {
    entries: HashMap<String, Vec<ProcessedEvent>>,
}

impl HistoricalActivities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&mut self, message_id: &str, events: &[ProcessedEvent]) {
        self.entries.insert(message_id.to_string(), events.to_vec());
    }

    pub fn get(&self, message_id: &str) -> Option<&[ProcessedEvent]> {
        self.entries.get(message_id).map(Vec::as_slice)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.entries.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{classify, EventTitle};
    use serde_json::json;

    fn query_event() -> ProcessedEvent {
        classify(&json!({"generate_query": {"search_query": ["AI là gì"]}}))
            .expect("classifiable event")
    }

    fn finalize_event() -> ProcessedEvent {
        classify(&json!({"finalize_answer": {}})).expect("classifiable event")
    }

    #[test]
    fn reset_clears_events_and_issues_new_generation() {
        let mut timeline = ActivityTimeline::new();
        let first = timeline.reset();
        assert!(timeline.append(first, query_event()));
        assert_eq!(timeline.events().len(), 1);

        let second = timeline.reset();
        assert!(second > first);
        assert!(timeline.is_empty());
    }

    #[test]
    fn stale_generation_appends_are_dropped() {
        let mut timeline = ActivityTimeline::new();
        let first = timeline.reset();
        assert!(timeline.append(first, query_event()));

        let second = timeline.reset();
        assert!(!timeline.append(first, finalize_event()));
        assert!(timeline.is_empty());

        assert!(timeline.append(second, finalize_event()));
        assert_eq!(timeline.events().len(), 1);
        assert_eq!(timeline.events()[0].title, EventTitle::FinalizingAnswer);
    }

    #[test]
    fn late_events_after_restore_are_dropped() {
        let mut timeline = ActivityTimeline::new();
        let live = timeline.reset();
        timeline.restore(vec![query_event()]);

        assert!(!timeline.append(live, finalize_event()));
        assert_eq!(timeline.events().len(), 1);
        assert_eq!(
            timeline.events()[0].title,
            EventTitle::GeneratingSearchQueries
        );
    }

    #[test]
    fn historical_commit_snapshots_the_sequence() {
        let mut timeline = ActivityTimeline::new();
        let generation = timeline.reset();
        timeline.append(generation, query_event());
        timeline.append(generation, finalize_event());

        let mut history = HistoricalActivities::new();
        history.commit("m1", timeline.events());

        timeline.reset();
        let saved = history.get("m1").expect("committed entry");
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].title, EventTitle::GeneratingSearchQueries);
        assert_eq!(saved[1].title, EventTitle::FinalizingAnswer);
        assert!(history.get("m2").is_none());
    }
}
