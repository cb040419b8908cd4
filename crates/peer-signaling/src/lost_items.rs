//! Left-behind object detection: what is in the scene after a person
//! leaves that was not there before they arrived.

use std::collections::{HashMap, HashSet};

use crate::detection::DetectionFrame;

/// How repeated labels are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffPolicy {
    /// Every occurrence is a separate object; one `before` entry cancels
    /// one `after` entry.
    #[default]
    Multiset,
    /// Labels are classes; repeats collapse and output is de-duplicated.
    Distinct,
}

impl DiffPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "multiset" => Some(DiffPolicy::Multiset),
            "distinct" | "set" => Some(DiffPolicy::Distinct),
            _ => None,
        }
    }
}

/// Labels present in `after` but not in `before`, in `after` order.
pub fn lost_item_labels<'a>(before: &[String], after: &'a [String], policy: DiffPolicy) -> Vec<&'a str> {
    match policy {
        DiffPolicy::Multiset => {
            let mut budget: HashMap<&str, usize> = HashMap::new();
            for label in before {
                *budget.entry(label.as_str()).or_default() += 1;
            }
            after
                .iter()
                .filter(|label| match budget.get_mut(label.as_str()) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        false
                    }
                    _ => true,
                })
                .map(String::as_str)
                .collect()
        }
        DiffPolicy::Distinct => {
            let known: HashSet<&str> = before.iter().map(String::as_str).collect();
            let mut seen = HashSet::new();
            after
                .iter()
                .map(String::as_str)
                .filter(|label| !known.contains(label) && seen.insert(*label))
                .collect()
        }
    }
}

/// Space-joined leftovers; empty when nothing was left behind.
pub fn lost_items(before: &[String], after: &[String], policy: DiffPolicy) -> String {
    lost_item_labels(before, after, policy).join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostItemAlert {
    pub items: String,
}

/// Watches frames for the person label and reports what was left behind
/// once the person is gone.
#[derive(Debug)]
pub struct OccupancyMonitor {
    person_label: String,
    policy: DiffPolicy,
    monitoring: bool,
    occupied: bool,
    before: DetectionFrame,
}

impl OccupancyMonitor {
    pub fn new(person_label: impl Into<String>, policy: DiffPolicy) -> Self {
        Self {
            person_label: person_label.into(),
            policy,
            monitoring: true,
            occupied: false,
            before: DetectionFrame::empty(),
        }
    }

    pub fn set_monitoring(&mut self, enabled: bool) {
        self.monitoring = enabled;
    }

    pub fn is_occupied(&self) -> bool {
        self.occupied
    }

    pub fn observe(&mut self, frame: &DetectionFrame) -> Option<LostItemAlert> {
        let present = frame.contains(&self.person_label);
        if present {
            self.occupied = true;
            return None;
        }
        let departed = std::mem::replace(&mut self.occupied, false);
        let alert = if departed && self.monitoring {
            let items = lost_items(self.before.labels(), frame.labels(), self.policy);
            (!items.is_empty()).then_some(LostItemAlert { items })
        } else {
            None
        };
        self.before = frame.clone();
        alert
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn multiset_diff_is_order_insensitive() {
        let before = labels(&["a", "b"]);
        let after = labels(&["b", "c"]);
        assert_eq!(lost_items(&before, &after, DiffPolicy::Multiset), "c");
        assert_eq!(lost_items(&labels(&["b", "a"]), &labels(&["c", "b"]), DiffPolicy::Multiset), "c");
        assert_eq!(lost_items(&labels(&["a"]), &labels(&["a"]), DiffPolicy::Multiset), "");
    }

    #[test]
    fn multiset_keeps_repeated_objects() {
        let after = labels(&["cup", "cup"]);
        assert_eq!(lost_items(&[], &after, DiffPolicy::Multiset), "cup cup");
        assert_eq!(lost_items(&labels(&["cup"]), &after, DiffPolicy::Multiset), "cup");
    }

    #[test]
    fn distinct_collapses_repeats() {
        let after = labels(&["cup", "cup", "bag"]);
        assert_eq!(lost_items(&[], &after, DiffPolicy::Distinct), "cup bag");
        assert_eq!(lost_items(&labels(&["cup"]), &after, DiffPolicy::Distinct), "bag");
    }

    #[test]
    fn repeated_diff_gives_same_answer() {
        let before = labels(&["a"]);
        let after = labels(&["a", "x"]);
        let first = lost_items(&before, &after, DiffPolicy::Multiset);
        assert_eq!(first, lost_items(&before, &after, DiffPolicy::Multiset));
    }

    #[test]
    fn alert_fires_when_person_leaves_something_behind() {
        let mut monitor = OccupancyMonitor::new("person", DiffPolicy::Multiset);
        assert!(monitor.observe(&DetectionFrame::new(labels(&["chair"]))).is_none());
        assert!(monitor.observe(&DetectionFrame::new(labels(&["person", "chair"]))).is_none());
        assert!(monitor.is_occupied());
        let alert = monitor
            .observe(&DetectionFrame::new(labels(&["chair", "umbrella"])))
            .expect("alert");
        assert_eq!(alert.items, "umbrella");
        assert!(!monitor.is_occupied());
    }

    #[test]
    fn no_alert_for_clean_exit_or_when_paused() {
        let mut monitor = OccupancyMonitor::new("person", DiffPolicy::Multiset);
        monitor.observe(&DetectionFrame::new(labels(&["chair"])));
        monitor.observe(&DetectionFrame::new(labels(&["person"])));
        assert!(monitor.observe(&DetectionFrame::new(labels(&["chair"]))).is_none());

        monitor.set_monitoring(false);
        monitor.observe(&DetectionFrame::new(labels(&["person"])));
        assert!(monitor.observe(&DetectionFrame::new(labels(&["chair", "bag"]))).is_none());
    }
}
