use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};
use todo_core::RelayMessage;

/// A view that has polled within this long counts as open. Views poll every
/// second or so.
pub const VIEW_FRESHNESS: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Queued(String),
    /// No open view; parked until one polls.
    Pending,
}

struct ViewSlot {
    last_seen: Instant,
    queue: VecDeque<RelayMessage>,
}

/// Routes relayed messages to open views. Nothing handed to the hub is dropped:
/// messages for a view that goes away return to the pending queue.
pub struct RelayHub {
    views: HashMap<String, ViewSlot>,
    pending: VecDeque<RelayMessage>,
    last_launch: Option<Instant>,
    freshness: Duration,
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new(VIEW_FRESHNESS)
    }
}

impl RelayHub {
    pub fn new(freshness: Duration) -> Self {
        Self {
            views: HashMap::new(),
            pending: VecDeque::new(),
            last_launch: None,
            freshness,
        }
    }

    /// Marks the view as open and hands it everything waiting for it.
    pub fn poll(&mut self, view_id: &str, now: Instant) -> Vec<RelayMessage> {
        self.prune(now);
        let slot = self.views.entry(view_id.to_string()).or_insert_with(|| ViewSlot {
            last_seen: now,
            queue: VecDeque::new(),
        });
        slot.last_seen = now;
        let mut out: Vec<RelayMessage> = self.pending.drain(..).collect();
        out.extend(slot.queue.drain(..));
        out
    }

    /// Queues for the most recently seen open view, or parks the message.
    pub fn deliver(&mut self, msg: RelayMessage, now: Instant) -> Delivery {
        self.prune(now);
        let target = self
            .views
            .iter()
            .max_by_key(|(_, slot)| slot.last_seen)
            .map(|(id, _)| id.clone());
        match target {
            Some(id) => {
                if let Some(slot) = self.views.get_mut(&id) {
                    slot.queue.push_back(msg);
                }
                Delivery::Queued(id)
            }
            None => {
                self.pending.push_back(msg);
                Delivery::Pending
            }
        }
    }

    pub fn has_live_view(&self, now: Instant) -> bool {
        self.views
            .values()
            .any(|slot| now.saturating_duration_since(slot.last_seen) <= self.freshness)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True at most once per freshness window, so a burst of clicks spawns one view.
    pub fn should_launch(&mut self, now: Instant) -> bool {
        let recent = self
            .last_launch
            .map(|at| now.saturating_duration_since(at) < self.freshness)
            .unwrap_or(false);
        if recent {
            return false;
        }
        self.last_launch = Some(now);
        true
    }

    fn prune(&mut self, now: Instant) {
        let freshness = self.freshness;
        let stale: Vec<String> = self
            .views
            .iter()
            .filter(|(_, slot)| now.saturating_duration_since(slot.last_seen) > freshness)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(slot) = self.views.remove(&id) {
                self.pending.extend(slot.queue);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use todo_core::TaskId;

    fn msg(id: i64) -> RelayMessage {
        RelayMessage::complete(TaskId(id))
    }

    #[test]
    fn no_view_parks_then_first_poll_drains() {
        let mut hub = RelayHub::default();
        let t0 = Instant::now();
        assert!(!hub.has_live_view(t0));
        assert_eq!(hub.deliver(msg(1), t0), Delivery::Pending);
        assert_eq!(hub.deliver(msg(2), t0), Delivery::Pending);
        assert_eq!(hub.pending_len(), 2);

        let got = hub.poll("view-a", t0 + Duration::from_secs(30));
        assert_eq!(got, vec![msg(1), msg(2)]);
        assert_eq!(hub.pending_len(), 0);
        assert!(hub.poll("view-a", t0 + Duration::from_secs(31)).is_empty());
    }

    #[test]
    fn live_view_gets_messages_directly() {
        let mut hub = RelayHub::default();
        let t0 = Instant::now();
        hub.poll("view-a", t0);
        assert_eq!(
            hub.deliver(msg(7), t0 + Duration::from_secs(1)),
            Delivery::Queued("view-a".to_string())
        );
        assert_eq!(hub.poll("view-a", t0 + Duration::from_secs(2)), vec![msg(7)]);
    }

    #[test]
    fn most_recent_view_wins() {
        let mut hub = RelayHub::default();
        let t0 = Instant::now();
        hub.poll("old", t0);
        hub.poll("new", t0 + Duration::from_secs(2));
        assert_eq!(
            hub.deliver(msg(1), t0 + Duration::from_secs(3)),
            Delivery::Queued("new".to_string())
        );
    }

    #[test]
    fn stale_view_messages_return_to_pending() {
        let mut hub = RelayHub::default();
        let t0 = Instant::now();
        hub.poll("gone", t0);
        hub.deliver(msg(5), t0);

        // "gone" never polls again; the next view still receives the action.
        let later = t0 + VIEW_FRESHNESS + Duration::from_secs(1);
        assert!(!hub.has_live_view(later));
        assert_eq!(hub.poll("fresh", later), vec![msg(5)]);
    }

    #[test]
    fn launch_is_debounced() {
        let mut hub = RelayHub::default();
        let t0 = Instant::now();
        assert!(hub.should_launch(t0));
        assert!(!hub.should_launch(t0 + Duration::from_secs(1)));
        assert!(hub.should_launch(t0 + VIEW_FRESHNESS + Duration::from_secs(1)));
    }
}
