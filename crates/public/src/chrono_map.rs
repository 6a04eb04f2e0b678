/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::hash::Hash;

use ahash::AHashMap;

// A hash map whose entries are also ordered by an attached time.
//
// Entries inserted at the same time are kept in insertion order, so
// forward_time visits them first-in first-out.
pub struct ChronoMap<T, K, V>
where
    T: Copy + Ord,
    K: Clone + Eq + Hash,
{
    entries: AHashMap<K, Node<T, V>>,
    timeline: BTreeMap<(T, u64), K>,
    next_seq: u64,
}

struct Node<T, V> {
    time: T,
    seq: u64,
    value: V,
}

impl<T, K, V> Default for ChronoMap<T, K, V>
where
    T: Copy + Ord,
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, K, V> ChronoMap<T, K, V>
where
    T: Copy + Ord,
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            entries: AHashMap::new(),
            timeline: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn with_capacity(entry_cap: usize) -> Self {
        Self {
            entries: AHashMap::with_capacity(entry_cap),
            timeline: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|n| &n.value)
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get_mut(key).map(|n| &mut n.value)
    }

    pub fn time_of<Q>(&self, key: &Q) -> Option<T>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|n| n.time)
    }

    pub fn oldest_time(&self) -> Option<T> {
        self.timeline.keys().next().map(|(t, _)| *t)
    }

    // Inserts or replaces the value for key, returning the replaced value.
    // The entry is always rescheduled to time.
    pub fn insert(&mut self, time: T, key: K, value: V) -> Option<V> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timeline.insert((time, seq), key.clone());
        let old = self.entries.insert(key, Node { time, seq, value })?;
        self.timeline.remove(&(old.time, old.seq));
        Some(old.value)
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let node = self.entries.remove(key)?;
        self.timeline.remove(&(node.time, node.seq));
        Some(node.value)
    }

    // remove the entry with the earliest time
    pub fn remove_oldest(&mut self) -> Option<(T, K, V)> {
        let ((time, _), key) = self.timeline.pop_first()?;
        let node = self.entries.remove(&key)?;
        Some((time, key, node.value))
    }

    pub fn move_to_time<Q>(&mut self, key: &Q, time: T)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let seq = self.next_seq;
        let Some(node) = self.entries.get_mut(key) else {
            return;
        };
        self.next_seq += 1;
        if let Some(k) = self.timeline.remove(&(node.time, node.seq)) {
            self.timeline.insert((time, seq), k);
        }
        node.time = time;
        node.seq = seq;
    }

    // push time window to T, handles all values with time <= T with F
    // if F returns Some(new_time) and new_time > T, the entry is moved to the new time,
    // otherwise, the entry is removed
    pub fn forward_time<F>(&mut self, time: T, mut callback: F)
    where
        F: FnMut(&K, &mut V) -> Option<T>,
    {
        while let Some(((t, seq), _)) = self.timeline.first_key_value() {
            if *t > time {
                break;
            }
            let slot = (*t, *seq);
            let Some(key) = self.timeline.remove(&slot) else {
                break;
            };
            let Some(node) = self.entries.get_mut(&key) else {
                continue;
            };
            match callback(&key, &mut node.value) {
                Some(nt) if nt > time => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    node.time = nt;
                    node.seq = seq;
                    self.timeline.insert((nt, seq), key);
                }
                _ => {
                    self.entries.remove(&key);
                }
            }
        }
    }

    // removes every entry, oldest first
    pub fn drain(&mut self) -> impl Iterator<Item = (T, K, V)> + '_ {
        std::iter::from_fn(move || self.remove_oldest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_operations() {
        let mut m = ChronoMap::new();
        assert_eq!(m.insert(42, "tcp", 10), None);
        assert_eq!(m.insert(42, "udp", 32), None);
        assert_eq!(m.get(&"tcp"), Some(&10));
        assert_eq!(m.len(), 2);

        assert_eq!(m.insert(50, "tcp", 11), Some(10));
        assert_eq!(m.time_of(&"tcp"), Some(50));
        assert_eq!(m.len(), 2);
        assert_eq!(m.oldest_time(), Some(42));

        *m.get_mut(&"udp").unwrap() += 1;
        assert_eq!(m.remove(&"udp"), Some(33));
        assert_eq!(m.remove(&"udp"), None);
        assert_eq!(m.oldest_time(), Some(50));
    }

    #[test]
    fn remove_oldest_is_fifo_within_same_time() {
        let mut m = ChronoMap::new();
        for i in 0..5 {
            m.insert(7, format!("key{}", i), i);
        }
        m.insert(3, "early".to_string(), 100);
        assert_eq!(m.remove_oldest(), Some((3, "early".to_string(), 100)));
        for i in 0..5 {
            assert_eq!(m.remove_oldest(), Some((7, format!("key{}", i), i)));
        }
        assert!(m.remove_oldest().is_none());
        assert!(m.is_empty());
    }

    #[test]
    fn forward_time() {
        let mut m = ChronoMap::new();
        for i in 0..10u64 {
            m.insert(i * 10, i, i);
        }
        let mut seen = vec![];
        m.forward_time(45, |k, _| {
            seen.push(*k);
            // keep odd keys alive a while longer
            if k % 2 == 1 {
                Some(100)
            } else {
                None
            }
        });
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(m.len(), 7);
        assert!(!m.contains_key(&0));
        assert_eq!(m.time_of(&3), Some(100));

        // callback returning a time not beyond the window removes the entry
        m.forward_time(60, |_, _| Some(60));
        assert_eq!(m.len(), 5);
        assert_eq!(m.oldest_time(), Some(70));
    }

    #[test]
    fn move_and_drain() {
        let mut m = ChronoMap::new();
        m.insert(1, "a", 1);
        m.insert(2, "b", 2);
        m.move_to_time(&"a", 3);
        let drained = m.drain().collect::<Vec<_>>();
        assert_eq!(drained, vec![(2, "b", 2), (3, "a", 1)]);
        assert!(m.is_empty());
    }
}
