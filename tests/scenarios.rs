use hex_literal::hex;
use songit::{
    device::{DeviceMask, PlayMask},
    fast_forward::FastForwardIterator,
    midi::{delta_time, MidiCommand},
    tee::TeeIterator,
    *,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

const CLEAN: ReaderMask = ReaderMask::ALL
    .union(ReaderMask::MAY_CLEAN)
    .union(ReaderMask::MAY_FREE);

/// SCI0 resource whose channel table puts `channels` on the MT-32.
fn sci0(format: u8, channels: &[u8], track: &[u8]) -> Vec<u8> {
    let mut data = vec![format];
    for ch in 0..16 {
        let devices = if channels.contains(&ch) { 0x01 } else { 0x00 };
        data.extend([1, devices]);
    }
    data.extend_from_slice(track);
    data
}

/// Single-device SCI1 resource, padded to the shortest accepted size.
fn sci1(device: u8, tracks: &[&[u8]]) -> Vec<u8> {
    let mut data = vec![device];
    let mut offset = 1 + 6 * tracks.len() + 2;
    for track in tracks {
        data.extend([0, 0]);
        data.extend((offset as u16).to_le_bytes());
        data.extend((track.len() as u16).to_le_bytes());
        offset += track.len();
    }
    data.extend([0xff, 0xff]);
    for track in tracks {
        data.extend_from_slice(track);
    }
    data.resize(data.len().max(SONG_MIN_SIZE), 0);
    data
}

fn send(slot: &mut IteratorSlot, body: MessageBody) {
    assert!(songit_handle_message(slot, &Message::new(1, body)));
}

/// SCI0 song limited to the MT-32 channels of its table.
fn mt32_song(channels: &[u8], track: &[u8]) -> IteratorSlot {
    let mut slot = songit_new(sci0(0, channels, track), SongKind::Sci0, 1);
    send(
        &mut slot,
        MessageBody::SetPlaymask(PlayMask::new(DeviceMask::MT32)),
    );
    slot
}

fn drain(slot: &mut IteratorSlot, mask: ReaderMask) -> Vec<Step> {
    let mut steps = Vec::new();
    loop {
        let step = songit_next(slot, mask);
        let done = step == Step::Finished;
        steps.push(step);
        if done || steps.len() > 512 {
            return steps;
        }
    }
}

fn midi(bytes: &[u8]) -> Step {
    Step::Midi(MidiCommand::from_bytes(bytes))
}

#[test]
fn time_expansion_prefixes_add_up() {
    assert_eq!(delta_time::<()>(&hex!("80 80 10")), Ok((&[][..], 496)));
    assert_eq!(delta_time::<()>(&hex!("7f")), Ok((&[][..], 127)));
}

#[test]
fn single_note_song() {
    let mut slot = mt32_song(&[0], &hex!("00 90 3c 7f 1e 80 3c 00 00 fc"));
    assert_eq!(
        drain(&mut slot, ReaderMask::ALL),
        [
            midi(&hex!("90 3c 7f")),
            Step::Delay(30),
            midi(&hex!("80 3c 00")),
            Step::Finished
        ]
    );
}

#[test]
fn three_passes_loop_twice() {
    let mut slot = mt32_song(&[0], &hex!("00 90 3c 7f 1e 80 3c 00 00 fc"));
    send(&mut slot, MessageBody::SetLoops(3));
    let steps = drain(&mut slot, ReaderMask::ALL);
    assert_eq!(steps.iter().filter(|s| **s == Step::Loop).count(), 2);
    let note_ons = steps
        .iter()
        .filter(|s| **s == midi(&hex!("90 3c 7f")))
        .count();
    assert_eq!(note_ons, 3);
    assert_eq!(steps.last(), Some(&Step::Finished));
}

#[test]
fn loop_count_is_passes_minus_one() {
    for passes in 1..6 {
        let mut slot = mt32_song(&[0], &hex!("00 90 3c 7f 05 80 3c 00 00 fc"));
        send(&mut slot, MessageBody::SetLoops(passes));
        let loops = drain(&mut slot, ReaderMask::LOOP).len() - 1;
        assert_eq!(loops, passes as usize - 1);
    }
}

#[test]
fn missing_sample_header_finishes_at_once() {
    let data = sci0(2, &[0], &hex!("00 90 3c 7f 00 fc 00 00 00 00 00 00"));
    let mut slot = songit_new(data, SongKind::Sci0, 1);
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), Step::Finished);
}

#[test]
fn finished_song_silences_its_channels() {
    let mut slot = mt32_song(&[0, 2], &hex!("00 fc"));
    assert_eq!(slot.as_ref().unwrap().core().channel_mask, 0b0101);
    assert_eq!(
        drain(&mut slot, CLEAN),
        [
            Step::Midi(MidiCommand::notes_off(0)),
            Step::Midi(MidiCommand::notes_off(2)),
            Step::Finished
        ]
    );
    assert!(slot.is_none());
}

#[test]
fn tee_surfaces_the_earlier_child_first() {
    let a = mt32_song(&[0], &hex!("0a 90 3c 7f 00 fc"));
    let b = mt32_song(&[0], &hex!("04 90 40 7f 00 fc"));
    let mut slot = sfx_iterator_combine(a, b);
    assert_eq!(slot.as_ref().unwrap().kind(), "Tee");
    assert_eq!(
        drain(&mut slot, CLEAN),
        [
            Step::Delay(4),
            midi(&hex!("91 40 7f")),
            Step::Midi(MidiCommand::notes_off(1)),
            Step::Delay(6),
            midi(&hex!("90 3c 7f")),
            Step::Midi(MidiCommand::notes_off(0)),
            Step::Finished
        ]
    );
}

#[test]
fn tee_moves_shared_channels_apart() {
    let left = mt32_song(&[0, 1, 2], &hex!("00 90 3c 7f 00 fc"));
    let mut right = mt32_song(
        &[1, 2, 3, 9],
        &hex!("00 91 3c 7f 00 92 3c 7f 00 93 3c 7f 00 99 3c 7f 00 fc"),
    );
    send(&mut right, MessageBody::SetRhythm(true));
    let tee = TeeIterator::new(left.unwrap(), right.unwrap());
    assert_eq!(tee.core().channel_mask, 0b10_0011_1111);

    let mut slot: IteratorSlot = Some(Box::new(tee));
    let mut notes: Vec<u8> = drain(&mut slot, CLEAN)
        .into_iter()
        .filter_map(|step| match step {
            Step::Midi(cmd) if cmd.status() & 0xf0 == 0x90 => Some(cmd.status()),
            _ => None,
        })
        .collect();
    notes.sort_unstable();
    assert_eq!(notes, [0x90, 0x93, 0x94, 0x95, 0x99]);
}

#[test]
fn fast_forward_to_a_delay_boundary() {
    let song = mt32_song(
        &[0],
        &hex!("00 90 3c 7f 04 90 3e 7f 06 90 40 7f 05 80 40 00 00 fc"),
    );
    let mut slot: IteratorSlot = Some(Box::new(FastForwardIterator::new(song.unwrap(), 10)));
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), midi(&hex!("90 3c 7f")));
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), midi(&hex!("90 3e 7f")));
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), midi(&hex!("90 40 7f")));
    assert_eq!(slot.as_ref().unwrap().kind(), "SCI0");
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), Step::Delay(5));
}

#[test]
fn fast_forward_overshoot_is_kept() {
    let song = mt32_song(&[0], &hex!("00 90 3c 7f 0a 90 3e 7f 00 fc"));
    let mut slot: IteratorSlot = Some(Box::new(FastForwardIterator::new(song.unwrap(), 4)));
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), midi(&hex!("90 3c 7f")));
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), Step::Delay(6));
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), midi(&hex!("90 3e 7f")));
}

#[test]
fn clone_continues_like_the_original() {
    let mut slot = mt32_song(&[0], &hex!("00 90 3c 7f 03 90 40 7f 07 80 3c 00 00 fc"));
    songit_next(&mut slot, ReaderMask::ALL);
    songit_next(&mut slot, ReaderMask::ALL);
    let mut copy = songit_clone(&mut slot, 0);
    assert!(copy.as_ref().unwrap().core().is_clone());
    assert_eq!(
        drain(&mut copy, ReaderMask::ALL),
        drain(&mut slot, ReaderMask::ALL)
    );
}

#[test]
fn stop_targets_one_song() {
    let mut slot = mt32_song(&[0], &hex!("00 90 3c 7f 00 fc"));
    let mut copy = songit_clone(&mut slot, 0);
    assert!(songit_handle_message(
        &mut slot,
        &Message::new(1, MessageBody::Stop)
    ));
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), Step::Finished);
    // clones keep the id, so only a different id leaves one running
    assert!(songit_handle_message(
        &mut copy,
        &Message::new(2, MessageBody::Stop)
    ));
    assert_eq!(songit_next(&mut copy, ReaderMask::ALL), midi(&hex!("90 3c 7f")));
}

#[test]
fn listeners_outlive_cleanup() {
    let fired = Arc::new(AtomicUsize::new(0));
    let mut slot = mt32_song(&[0], &hex!("00 90 3c 7f 00 fc"));
    let seen = fired.clone();
    slot.as_mut().unwrap().core_mut().add_death_listener(move |corpse| {
        assert_eq!(corpse.id, 1);
        seen.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(songit_next(&mut slot, CLEAN), midi(&hex!("90 3c 7f")));
    assert_eq!(
        songit_next(&mut slot, CLEAN),
        Step::Midi(MidiCommand::notes_off(0))
    );
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(songit_next(&mut slot, CLEAN), Step::Finished);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn sci1_device_switch_keeps_the_position() {
    let data = sci1(0x00, &[&hex!("00 00 00 90 3c 7f 0a 80 3c 00 00 fc")]);
    let mut slot = songit_new(data, SongKind::Sci1, 1);
    let adlib = MessageBody::SetPlaymask(PlayMask::new(DeviceMask::ADLIB));
    send(&mut slot, adlib.clone());
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), midi(&hex!("90 3c 7f")));
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), Step::Delay(10));

    send(&mut slot, adlib);
    assert_eq!(slot.as_ref().unwrap().kind(), "FastForward");
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), midi(&hex!("90 3c 7f")));
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), midi(&hex!("80 3c 00")));
    assert_eq!(slot.as_ref().unwrap().kind(), "SCI1");
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), Step::Finished);
}

#[test]
fn sci1_device_switch_during_a_fast_forward() {
    let data = sci1(
        0x00,
        &[&hex!("00 00 00 90 3c 7f 0a 90 3e 7f 0a 80 3c 00 0a 80 3e 00 00 fc")],
    );
    let mut slot = songit_new(data, SongKind::Sci1, 1);
    let adlib = MessageBody::SetPlaymask(PlayMask::new(DeviceMask::ADLIB));
    send(&mut slot, adlib.clone());
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), midi(&hex!("90 3c 7f")));
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), Step::Delay(10));
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), midi(&hex!("90 3e 7f")));
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), Step::Delay(10));

    send(&mut slot, adlib.clone());
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), midi(&hex!("90 3c 7f")));
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), midi(&hex!("90 3e 7f")));
    send(&mut slot, adlib);
    assert_eq!(slot.as_ref().unwrap().kind(), "FastForward");
    assert_eq!(
        drain(&mut slot, ReaderMask::ALL),
        [
            midi(&hex!("90 3c 7f")),
            midi(&hex!("90 3e 7f")),
            midi(&hex!("80 3c 00")),
            Step::Delay(10),
            midi(&hex!("80 3e 00")),
            Step::Finished
        ]
    );
    assert_eq!(slot.as_ref().unwrap().kind(), "SCI1");
}

#[test]
fn sci1_clone_delay_survives_a_device_switch() {
    let data = sci1(0x00, &[&hex!("00 00 00 90 3c 7f 0a 80 3c 00 00 fc")]);
    let mut slot = songit_new(data, SongKind::Sci1, 1);
    let mut copy = songit_clone(&mut slot, 7);
    send(
        &mut copy,
        MessageBody::SetPlaymask(PlayMask::new(DeviceMask::ADLIB)),
    );
    assert_eq!(songit_next(&mut copy, ReaderMask::ALL), Step::Delay(7));
    assert_eq!(songit_next(&mut copy, ReaderMask::ALL), midi(&hex!("90 3c 7f")));
}

#[test]
fn combined_songs_reject_what_neither_takes() {
    let a = mt32_song(&[0], &hex!("00 90 3c 7f 00 fc"));
    let b = mt32_song(&[1], &hex!("00 91 3c 7f 00 fc"));
    let mut slot = sfx_iterator_combine(a, b);
    assert!(!songit_handle_message(
        &mut slot,
        &Message::new(1, MessageBody::SetHold(3))
    ));
    assert!(songit_handle_message(
        &mut slot,
        &Message::new(1, MessageBody::SetLoops(2))
    ));
    assert_eq!(slot.as_ref().unwrap().kind(), "Tee");
}

#[test]
fn sci1_song_without_the_device_is_skipped() {
    let data = sci1(0x06, &[&hex!("00 00 00 90 3c 7f 00 fc")]);
    let mut slot = songit_new(data, SongKind::Sci1, 1);
    send(
        &mut slot,
        MessageBody::SetPlaymask(PlayMask::new(DeviceMask::TANDY)),
    );
    assert_eq!(songit_next(&mut slot, ReaderMask::ALL), Step::Finished);
}
