//! Entry points a sound server drives iterators through. Each works on the slot holding the
//! current iterator, so iterators can replace themselves along the way.

use crate::{
    cleanup::CleanupIterator,
    iterator::{
        next_remapped, BoxedIterator, Delivery, IteratorFlags, IteratorSlot, Message, MessageBody,
        ReaderMask, SongIteratorId, Step,
    },
    pcm::PcmFeed,
    sci0::Sci0Iterator,
    sci1::Sci1Iterator,
    tee::TeeIterator,
};
use std::sync::Arc;

/// Shortest buffer accepted as a song resource.
pub const SONG_MIN_SIZE: usize = 22;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SongKind {
    Sci0,
    Sci1,
}

pub fn songit_new(
    data: impl Into<Arc<[u8]>>,
    kind: SongKind,
    id: SongIteratorId,
) -> IteratorSlot {
    let data = data.into();
    if data.len() < SONG_MIN_SIZE {
        log::warn!(
            "Refusing {kind:?} song {id:#x}: {} bytes is too short",
            data.len()
        );
        return None;
    }
    let it: BoxedIterator = match kind {
        SongKind::Sci0 => Box::new(Sci0Iterator::new(data, id)),
        SongKind::Sci1 => Box::new(Sci1Iterator::new(data, id)),
    };
    Some(it)
}

/// Advances the iterator in `slot` until it yields a step `mask` asks for, or finishes.
///
/// Morph requests are acknowledged here and the slot takes the replacement. With
/// [`ReaderMask::MAY_CLEAN`], a finished iterator that still owns channels is swapped for a
/// [`CleanupIterator`] first; with [`ReaderMask::MAY_FREE`], a finished iterator is dropped.
pub fn songit_next(slot: &mut IteratorSlot, mask: ReaderMask) -> Step {
    loop {
        let Some(it) = slot.as_deref_mut() else {
            return Step::Finished;
        };
        let kind = it.kind();
        match next_remapped(it) {
            Step::Morph => {
                let ack = Message::new(it.core().id, MessageBody::AckMorph);
                if !songit_handle_message(slot, &ack) {
                    log::error!("{kind} asked to morph but refused the acknowledgement");
                    *slot = None;
                    return Step::Finished;
                }
                log::debug!(
                    "{kind} morphed into {}",
                    slot.as_ref().map_or("nothing", |it| it.kind())
                );
            }
            Step::Finished => {
                if mask.contains(ReaderMask::MAY_CLEAN) && it.core().channel_mask != 0 {
                    log::debug!(
                        "{kind} finished, silencing channels {:04x}",
                        it.core().channel_mask
                    );
                    let cleanup = CleanupIterator::replacing(it);
                    *slot = Some(Box::new(cleanup));
                    continue;
                }
                if mask.contains(ReaderMask::MAY_FREE) {
                    *slot = None;
                }
                return Step::Finished;
            }
            step if mask.wants(&step) => return step,
            _ => {}
        }
    }
}

/// Delivers `msg` to the iterator in `slot`. Returns false when nothing in the chain took it.
pub fn songit_handle_message(slot: &mut IteratorSlot, msg: &Message) -> bool {
    let Some(it) = slot.take() else {
        return false;
    };
    match it.handle_message(msg) {
        Delivery::Rejected(it) => {
            *slot = Some(it);
            false
        }
        Delivery::Accepted(next) => {
            *slot = next;
            true
        }
        Delivery::Cloned { original, clone } => {
            log::debug!("Dropping unrequested clone of {}", clone.kind());
            *slot = Some(original);
            true
        }
    }
}

/// Copies the iterator in `slot`, shifting the copy's pending delay by `delta` ticks. The copy
/// starts without death listeners.
pub fn songit_clone(slot: &mut IteratorSlot, delta: i32) -> IteratorSlot {
    let it = slot.take()?;
    let msg = Message::new(it.core().id, MessageBody::Clone(delta));
    match it.handle_message(&msg) {
        Delivery::Cloned {
            original,
            mut clone,
        } => {
            *slot = Some(original);
            let core = clone.core_mut();
            core.clear_death_listeners();
            core.flags.insert(IteratorFlags::CLONE);
            Some(clone)
        }
        Delivery::Rejected(it) => {
            log::warn!("{} cannot be cloned", it.kind());
            *slot = Some(it);
            None
        }
        Delivery::Accepted(next) => {
            *slot = next;
            None
        }
    }
}

/// Releases an iterator, notifying its death listeners.
pub fn songit_free(slot: IteratorSlot) {
    if let Some(it) = slot {
        log::trace!("Freeing {} [{:08x}]", it.kind(), it.core().id);
    }
}

/// The sample announced by the last [`Step::Pcm`] from `slot`.
pub fn songit_pcm_feed(slot: &mut IteratorSlot) -> Option<PcmFeed> {
    slot.as_mut()?.pcm_feed()
}

/// Plays two optional iterators together.
pub fn sfx_iterator_combine(a: IteratorSlot, b: IteratorSlot) -> IteratorSlot {
    match (a, b) {
        (None, b) => b,
        (a, None) => a,
        (Some(a), Some(b)) => Some(Box::new(TeeIterator::new(a, b))),
    }
}
