use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// Some FIGs adapt their rate or contents depending on whether entries are
/// stable or currently undergoing a change. The handler keeps each entry in
/// one of three buckets: `new` (recently turned active, announced at the
/// fast rate), `repeated` (stably active) and `disabled` (recently turned
/// inactive, still announced so receivers see the transition).
#[derive(Debug, Default)]
pub struct TransitionHandler<K: Ord + Clone> {
    pub new: BTreeMap<K, Instant>,
    pub repeated: BTreeSet<K>,
    pub disabled: BTreeMap<K, Instant>,
}

impl<K: Ord + Clone> TransitionHandler<K> {
    pub fn new() -> Self {
        TransitionHandler {
            new: BTreeMap::new(),
            repeated: BTreeSet::new(),
            disabled: BTreeMap::new(),
        }
    }

    /// Move entries between buckets according to their current activity.
    /// `new` entries graduate to `repeated` after `timeout`, `disabled`
    /// entries are dropped after `timeout`.
    pub fn update_state<'a, I>(&mut self, timeout: Duration, now: Instant, entries: I)
    where
        I: IntoIterator<Item = (&'a K, bool)>,
        K: 'a,
    {
        for (key, is_active) in entries {
            if is_active {
                if self.repeated.contains(key) {
                    continue;
                }

                if let Some(&deadline) = self.new.get(key) {
                    if deadline <= now {
                        self.new.remove(key);
                        self.repeated.insert(key.clone());
                    }
                    continue;
                }

                // unlikely: re-activated while still being disabled
                self.disabled.remove(key);
                self.new.insert(key.clone(), now + timeout);
            } else {
                if let Some(&deadline) = self.disabled.get(key) {
                    if deadline <= now {
                        self.disabled.remove(key);
                    }
                    continue;
                }

                if self.repeated.remove(key) || self.new.remove(key).is_some() {
                    self.disabled.insert(key.clone(), now + timeout);
                }
            }
        }
    }

    /// True while any entry is in a transition bucket, which is when the
    /// owning FIG wants its fast repetition rate.
    pub fn has_transitions(&self) -> bool {
        !self.new.is_empty() || !self.disabled.is_empty()
    }
}
