//! Tree nodes and the weighted round-robin descent.

use crate::provider::InfoProvider;
use crate::EchelonError;
use std::collections::VecDeque;

/// Result of a descent.
pub(crate) enum DequeueOutcome<T> {
    Item { item: T, leaf_route: Vec<String> },
    Empty,
    NoSlots,
}

struct Child<T> {
    segment: String,
    /// Weighted round-robin credit. Cached scheduling state, never persisted.
    credit: f32,
    node: Node<T>,
}

/// One node of the echelon tree. Interior nodes have children; leaves have a
/// FIFO queue. `len` counts the items in the whole subtree.
pub(crate) struct Node<T> {
    children: Vec<Child<T>>,
    queue: VecDeque<T>,
    len: usize,
}

impl<T> Node<T> {
    pub fn interior() -> Self {
        Self {
            children: Vec::new(),
            queue: VecDeque::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Append an item at the leaf addressed by `route`, creating nodes along
    /// the way.
    pub fn push(&mut self, route: &[String], item: T) {
        self.len += 1;
        match route.split_first() {
            None => self.queue.push_back(item),
            Some((segment, rest)) => {
                let child = match self.children.iter().position(|c| &c.segment == segment) {
                    Some(pos) => &mut self.children[pos],
                    None => {
                        self.children.push(Child {
                            segment: segment.clone(),
                            credit: 0.0,
                            node: Node::interior(),
                        });
                        self.children.last_mut().unwrap()
                    }
                };
                child.node.push(rest, item);
            }
        }
    }

    /// Borrow the queue contents of the leaf addressed by `route`.
    pub fn leaf_items(&self, route: &[String]) -> Vec<&T> {
        match route.split_first() {
            None => self.queue.iter().collect(),
            Some((segment, rest)) => self
                .children
                .iter()
                .find(|c| &c.segment == segment)
                .map(|c| c.node.leaf_items(rest))
                .unwrap_or_default(),
        }
    }

    /// Drop empty nodes along `route`.
    pub fn prune(&mut self, route: &[String]) {
        if let Some((segment, rest)) = route.split_first() {
            if let Some(pos) = self.children.iter().position(|c| &c.segment == segment) {
                self.children[pos].node.prune(rest);
                if self.children[pos].node.len == 0 {
                    self.children.remove(pos);
                }
            }
        }
    }

    /// Depth-first weighted round-robin descent with slot gating.
    ///
    /// `path` holds the partial route down to (excluding) this node and is
    /// restored before returning at every level.
    pub fn dequeue<P: InfoProvider>(
        &mut self,
        path: &mut Vec<String>,
        provider: &P,
    ) -> Result<DequeueOutcome<T>, EchelonError> {
        // Leaf: pop the head.
        if !self.queue.is_empty() {
            let item = self.queue.pop_front().unwrap();
            self.len -= 1;
            return Ok(DequeueOutcome::Item {
                item,
                leaf_route: path.clone(),
            });
        }

        if self.len == 0 {
            return Ok(DequeueOutcome::Empty);
        }

        // Candidates: children with a non-empty subtree whose partial route
        // still has slots.
        let mut candidates = Vec::with_capacity(self.children.len());
        for (idx, child) in self.children.iter().enumerate() {
            if child.node.len == 0 {
                continue;
            }
            path.push(child.segment.clone());
            let open = provider.slots_available(path);
            path.pop();
            if open? {
                candidates.push(idx);
            }
        }

        while !candidates.is_empty() {
            // Advance the cursor on every visit, not only on successful
            // descent, so a branch blocked deeper down cannot starve the
            // siblings that come after it.
            let mut total = 0.0f32;
            for &idx in &candidates {
                let child = &self.children[idx];
                path.push(child.segment.clone());
                let weight = provider.weight(path).max(0.0);
                path.pop();
                self.children[idx].credit += weight;
                total += weight;
            }

            let mut pick = candidates[0];
            for &idx in &candidates[1..] {
                if self.children[idx].credit > self.children[pick].credit {
                    pick = idx;
                }
            }
            self.children[pick].credit -= total.max(f32::EPSILON);

            path.push(self.children[pick].segment.clone());
            let outcome = self.children[pick].node.dequeue(path, provider);
            path.pop();

            match outcome? {
                DequeueOutcome::Item { item, leaf_route } => {
                    self.len -= 1;
                    return Ok(DequeueOutcome::Item { item, leaf_route });
                }
                // The branch could not produce an item after all; drop it
                // from this round and try the next candidate.
                DequeueOutcome::NoSlots | DequeueOutcome::Empty => {
                    candidates.retain(|&c| c != pick);
                }
            }
        }

        Ok(DequeueOutcome::NoSlots)
    }
}
