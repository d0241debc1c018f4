//! Soft-event and pending-event bookkeeping.
//!
//! Soft events turn edge-triggered kernel notifications into resettable
//! level semantics and let one layer synthesize events for its siblings.
//! Per I/O object, each layer (plus one user slot) holds a bitset of
//! pending [`EventType`]s; the object's position in the queue is fixed by
//! its first event and delivery follows that order.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use crate::io::Io;

use super::{EventType, EVENT_TYPE_COUNT};

/// High bit of a pending slot: a *higher* layer still has events queued, so
/// delivery must keep scanning past this empty slot.
const PENDING_MORE_ABOVE: u16 = 0x8000;
const PENDING_TYPE_MASK: u16 = 0x7FFF;

pub(crate) type IoId = usize;

pub(crate) fn io_id(io: &Arc<Io>) -> IoId {
    Arc::as_ptr(io) as IoId
}

struct SoftEntry {
    io: Arc<Io>,
    /// One bitset per layer, plus the trailing user slot.
    bits: Vec<u16>,
}

/// Insertion-ordered queue of per-object soft-event bitsets.
#[derive(Default)]
pub(crate) struct SoftQueue {
    order: Vec<IoId>,
    entries: HashMap<IoId, SoftEntry>,
}

impl SoftQueue {
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn add(&mut self, io: &Arc<Io>, layer_id: usize, ty: EventType) {
        let num_slots = io.layer_count() + 1;
        if layer_id >= num_slots {
            return;
        }

        let id = io_id(io);
        let entry = match self.entries.entry(id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => {
                self.order.push(id);
                v.insert(SoftEntry { io: Arc::clone(io), bits: vec![0; num_slots] })
            }
        };
        if entry.bits.len() < num_slots {
            entry.bits.resize(num_slots, 0);
        }
        entry.bits[layer_id] |= ty.bit();
    }

    pub fn del(&mut self, io: &Arc<Io>, layer_id: usize, ty: EventType) {
        let id = io_id(io);
        if let Some(entry) = self.entries.get_mut(&id) {
            if let Some(slot) = entry.bits.get_mut(layer_id) {
                *slot &= !ty.bit();
            }
            if entry.bits.iter().all(|&b| b == 0) {
                self.remove(id);
            }
        }
    }

    /// Clear every queued soft event for an object. With `nonerror_only`,
    /// Disconnected and Error survive so a close in progress still reaches
    /// the upper layers.
    pub fn clear_io(&mut self, id: IoId, nonerror_only: bool) {
        let mut empty = true;
        if let Some(entry) = self.entries.get_mut(&id) {
            for slot in entry.bits.iter_mut() {
                if nonerror_only {
                    *slot &= EventType::Disconnected.bit() | EventType::Error.bit();
                } else {
                    *slot = 0;
                }
                if *slot != 0 {
                    empty = false;
                }
            }
        } else {
            return;
        }
        if empty {
            self.remove(id);
        }
    }

    fn remove(&mut self, id: IoId) {
        self.entries.remove(&id);
        self.order.retain(|&o| o != id);
    }

    /// Move every queued soft event into the pending queue, preserving
    /// per-object order. Additions made while the drain runs go to the
    /// (now empty) queue and are picked up by the next drain.
    pub fn drain_into(&mut self, pending: &mut PendingQueue) -> u64 {
        let order = std::mem::take(&mut self.order);
        let mut entries = std::mem::take(&mut self.entries);
        let mut moved = 0;

        for id in order {
            let entry = match entries.remove(&id) {
                Some(e) => e,
                None => continue,
            };
            for (layer_id, &bits) in entry.bits.iter().enumerate() {
                if bits == 0 {
                    continue;
                }
                for i in 0..EVENT_TYPE_COUNT {
                    if bits & (1 << i) != 0 {
                        let ty = EventType::from_index(i).unwrap_or(EventType::Other);
                        pending.queue(&entry.io, layer_id, ty);
                        moved += 1;
                    }
                }
            }
        }
        moved
    }
}

struct PendingEntry {
    io: Arc<Io>,
    bits: Vec<u16>,
}

/// Events collected for one dispatch pass, ordered by first arrival per
/// object.
#[derive(Default)]
pub(crate) struct PendingQueue {
    order: Vec<IoId>,
    entries: HashMap<IoId, PendingEntry>,
}

impl PendingQueue {
    pub fn queue(&mut self, io: &Arc<Io>, layer_id: usize, ty: EventType) {
        let num_slots = io.layer_count() + 1;
        if layer_id >= num_slots {
            return;
        }

        let id = io_id(io);
        let entry = match self.entries.entry(id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => {
                self.order.push(id);
                v.insert(PendingEntry { io: Arc::clone(io), bits: vec![0; num_slots] })
            }
        };
        if entry.bits.len() < num_slots {
            entry.bits.resize(num_slots, 0);
        }
        entry.bits[layer_id] |= ty.bit();

        // Tag every lower layer so the delivery scan knows to keep going
        // even if the lower slots themselves are empty.
        for slot in entry.bits[..layer_id].iter_mut() {
            *slot |= PENDING_MORE_ABOVE;
        }
    }

    /// The next undelivered event, scanning objects in arrival order and
    /// layers bottom-up. An all-zero slot means nothing is queued at or
    /// above it for that object.
    pub fn first_deliverable(&self) -> Option<(Arc<Io>, usize, EventType)> {
        for id in &self.order {
            let entry = match self.entries.get(id) {
                Some(e) => e,
                None => continue,
            };
            for (layer_id, &bits) in entry.bits.iter().enumerate() {
                if bits == 0 {
                    break;
                }
                let types = bits & PENDING_TYPE_MASK;
                if types == 0 {
                    continue;
                }
                for i in 0..EVENT_TYPE_COUNT {
                    if types & (1 << i) != 0 {
                        let ty = EventType::from_index(i).unwrap_or(EventType::Other);
                        return Some((Arc::clone(&entry.io), layer_id, ty));
                    }
                }
            }
        }
        None
    }

    /// Record that `ty` was presented to `layer_id` (dispatch visits each
    /// layer from the origin upward, clearing as it goes). Clears the
    /// more-above tags downward once the slot above has fully drained.
    pub fn mark_delivered(&mut self, id: IoId, ty: EventType, layer_id: usize) {
        let entry = match self.entries.get_mut(&id) {
            Some(e) => e,
            None => return,
        };
        if let Some(slot) = entry.bits.get_mut(layer_id) {
            *slot &= !ty.bit();
        }
        for i in (0..layer_id.min(entry.bits.len().saturating_sub(1))).rev() {
            if entry.bits[i + 1] != 0 {
                break;
            }
            entry.bits[i] &= !PENDING_MORE_ABOVE;
        }
    }

    /// Drop all queued events for an object without disturbing an ongoing
    /// enumeration.
    pub fn clear_io(&mut self, id: IoId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            for slot in entry.bits.iter_mut() {
                *slot = 0;
            }
        }
    }

    pub fn clear_all(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{IoKind, Layer};

    struct NullLayer;

    impl Layer for NullLayer {
        fn name(&self) -> &'static str {
            "NULL"
        }
        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    fn io_with_layers(n: usize) -> Arc<Io> {
        let io = Io::new(IoKind::Stream);
        for _ in 0..n {
            io.add_layer(Box::new(NullLayer));
        }
        io
    }

    #[test]
    fn first_event_fixes_object_position() {
        let a = io_with_layers(1);
        let b = io_with_layers(1);

        let mut q = SoftQueue::default();
        q.add(&a, 0, EventType::Read);
        q.add(&b, 0, EventType::Read);
        // A later event for `a` must not move it behind `b`.
        q.add(&a, 0, EventType::Write);

        let mut pending = PendingQueue::default();
        assert_eq!(q.drain_into(&mut pending), 3);
        assert!(q.is_empty());

        let (io, layer, ty) = pending.first_deliverable().unwrap();
        assert!(Arc::ptr_eq(&io, &a));
        assert_eq!((layer, ty), (0, EventType::Read));
    }

    #[test]
    fn delivery_scans_layers_bottom_up() {
        let io = io_with_layers(2);

        let mut pending = PendingQueue::default();
        pending.queue(&io, 1, EventType::Read);
        pending.queue(&io, 0, EventType::Read);

        let (_, layer, _) = pending.first_deliverable().unwrap();
        assert_eq!(layer, 0);
        pending.mark_delivered(io_id(&io), EventType::Read, 0);
        let (_, layer, _) = pending.first_deliverable().unwrap();
        assert_eq!(layer, 1);
    }

    #[test]
    fn more_above_tag_bridges_empty_slots() {
        // An event on layer 2 alone must still be reachable past the empty
        // lower slots, and the tags must unwind once it drains.
        let io = io_with_layers(3);

        let mut pending = PendingQueue::default();
        pending.queue(&io, 2, EventType::Write);

        let (_, layer, ty) = pending.first_deliverable().unwrap();
        assert_eq!((layer, ty), (2, EventType::Write));

        pending.mark_delivered(io_id(&io), EventType::Write, 2);
        assert!(pending.first_deliverable().is_none());
    }

    #[test]
    fn event_type_order_within_a_slot() {
        let io = io_with_layers(1);

        let mut pending = PendingQueue::default();
        pending.queue(&io, 0, EventType::Error);
        pending.queue(&io, 0, EventType::Read);

        // Numeric EventType order: Read before Error.
        let (_, _, ty) = pending.first_deliverable().unwrap();
        assert_eq!(ty, EventType::Read);
        pending.mark_delivered(io_id(&io), EventType::Read, 0);
        let (_, _, ty) = pending.first_deliverable().unwrap();
        assert_eq!(ty, EventType::Error);
    }

    #[test]
    fn del_removes_empty_node() {
        let io = io_with_layers(1);

        let mut q = SoftQueue::default();
        q.add(&io, 0, EventType::Read);
        q.del(&io, 0, EventType::Read);
        assert!(q.is_empty());
    }

    #[test]
    fn clear_io_can_preserve_terminal_events() {
        let io = io_with_layers(1);

        let mut q = SoftQueue::default();
        q.add(&io, 0, EventType::Read);
        q.add(&io, 0, EventType::Disconnected);
        q.clear_io(io_id(&io), true);
        assert!(!q.is_empty());

        let mut pending = PendingQueue::default();
        assert_eq!(q.drain_into(&mut pending), 1);
        let (_, _, ty) = pending.first_deliverable().unwrap();
        assert_eq!(ty, EventType::Disconnected);

        q.add(&io, 0, EventType::Read);
        q.clear_io(io_id(&io), false);
        assert!(q.is_empty());
    }
}
