use crate::{
    driver::{songit_handle_message, songit_next},
    iterator::{
        BoxedIterator, Delivery, IteratorCore, IteratorSlot, Message, MessageBody, ReaderMask,
        SongIterator, Step,
    },
    pcm::PcmFeed,
};

/// Silently plays `delta` ticks of another iterator, then morphs into it.
///
/// Events that take no time are still passed on so the delegate's state stays consistent with
/// what the caller has seen.
pub struct FastForwardIterator {
    delegate: IteratorSlot,
    /// Ticks still to skip; the overshoot once negative
    delta: i32,
    /// Silence surfaced before skipping starts
    lead_in: u32,
    core: IteratorCore,
}

impl FastForwardIterator {
    pub fn new(delegate: BoxedIterator, delta: i32) -> Self {
        let mut core = IteratorCore::new(delegate.core().id);
        core.channel_mask = delegate.core().channel_mask;
        core.priority = delegate.core().priority;
        Self {
            delegate: Some(delegate),
            delta,
            lead_in: 0,
            core,
        }
    }
    /// Waits `ticks` before the skipped part plays.
    pub fn after_delay(mut self, ticks: i32) -> Self {
        self.lead_in = ticks.max(0) as u32;
        self
    }
    #[inline]
    pub fn remaining(&self) -> i32 {
        self.delta.max(0)
    }
    #[inline]
    pub fn delegate(&self) -> Option<&dyn SongIterator> {
        self.delegate.as_deref()
    }
}

impl SongIterator for FastForwardIterator {
    fn kind(&self) -> &'static str {
        "FastForward"
    }
    fn next_command(&mut self) -> Step {
        if self.lead_in > 0 {
            return Step::Delay(std::mem::take(&mut self.lead_in));
        }
        if self.delta <= 0 {
            return Step::Morph;
        }
        loop {
            // morphs of the delegate resolve in our own slot
            match songit_next(&mut self.delegate, ReaderMask::ALL) {
                Step::Delay(ticks) => {
                    self.delta -= ticks as i32;
                    if self.delta < 0 {
                        return Step::Delay(self.delta.unsigned_abs());
                    }
                    if self.delta == 0 {
                        return Step::Morph;
                    }
                }
                step => return step,
            }
        }
    }
    fn handle_message(mut self: Box<Self>, msg: &Message) -> Delivery {
        match &msg.body {
            MessageBody::AckMorph => {
                if self.delta > 0 {
                    log::warn!(
                        "Morphing fast-forward with {} ticks left to skip",
                        self.delta
                    );
                    return Delivery::Accepted(Some(self));
                }
                let Some(mut delegate) = self.delegate.take() else {
                    return Delivery::Accepted(None);
                };
                delegate.core_mut().adopt_wrapper(&mut self.core);
                log::debug!("Fast-forward done, continuing with {}", delegate.kind());
                return Delivery::Accepted(Some(delegate));
            }
            MessageBody::Print(indent) => {
                let remaining = self.delta;
                self.core
                    .handle_common("FastForward", msg, format_args!("remaining={remaining}"));
                let print = Message::new(msg.id, MessageBody::Print(indent + 1));
                songit_handle_message(&mut self.delegate, &print);
            }
            MessageBody::Clone(delta) => {
                let clone = self.duplicate(*delta);
                return Delivery::Cloned {
                    original: self,
                    clone,
                };
            }
            MessageBody::SetFade(fade) => {
                self.core.fade = *fade;
                songit_handle_message(&mut self.delegate, msg);
            }
            _ => {
                if !songit_handle_message(&mut self.delegate, msg) {
                    return Delivery::Rejected(self);
                }
            }
        }
        Delivery::Accepted(Some(self))
    }
    fn time_position(&self) -> i32 {
        self.delegate.as_ref().map_or(0, |d| d.time_position())
    }
    fn pcm_feed(&mut self) -> Option<PcmFeed> {
        self.delegate.as_mut()?.pcm_feed()
    }
    fn duplicate(&self, delta: i32) -> BoxedIterator {
        Box::new(Self {
            delegate: self.delegate.as_ref().map(|d| d.duplicate(0)),
            delta: self.delta,
            lead_in: self.lead_in + delta.max(0) as u32,
            core: self.core.duplicate(),
        })
    }
    fn core(&self) -> &IteratorCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut IteratorCore {
        &mut self.core
    }
}
