use crate::{
    device::DeviceMask,
    driver::{SongKind, SONG_MIN_SIZE},
    midi::MIDI_CHANNELS,
    sci0::{locate_pcm, Sci0Pcm, SCI0_MIDI_OFFSET},
    sci1::{Sci1Header, Sci1SampleHeader, SCI1_SAMPLE_MARKER},
};
use binrw::BinRead;
use std::{io::Cursor, path::Path, sync::Arc};

/// Leading bytes of a song exported as a patch file.
pub const SCI_PATCH_HEADER: [u8; 2] = hex_literal::hex!("84 00");

/// Reads a song resource, stripping the patch-file header unless `raw` is set.
pub fn load_song(path: &Path, raw: bool) -> std::io::Result<Arc<[u8]>> {
    let mut data = std::fs::read(path)?;
    if !raw {
        if !data.starts_with(&SCI_PATCH_HEADER) {
            return Err(crate::invalid_data(format_args!(
                "`{}` is not a song patch (header {:02x?}), use --raw for bare resources",
                path.display(),
                &data[..data.len().min(2)],
            )));
        }
        data.drain(..SCI_PATCH_HEADER.len());
    }
    if data.len() < SONG_MIN_SIZE {
        return Err(crate::invalid_data(format_args!(
            "`{}` holds {} bytes, songs are at least {SONG_MIN_SIZE}",
            path.display(),
            data.len()
        )));
    }
    Ok(data.into())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sci0Channel {
    /// Voices the channel asks for
    pub voices: u8,
    pub devices: DeviceMask,
}

/// SCI0 format byte, channel table and embedded sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sci0Summary {
    pub format: u8,
    pub channels: [Sci0Channel; MIDI_CHANNELS],
    pub pcm: Option<Sci0Pcm>,
}

impl Sci0Summary {
    pub fn read(data: &[u8]) -> std::io::Result<Self> {
        if data.len() <= SCI0_MIDI_OFFSET {
            return Err(crate::invalid_data("SCI0 song ends inside its channel table"));
        }
        let channels = std::array::from_fn(|ch| Sci0Channel {
            voices: data[1 + ch * 2],
            devices: DeviceMask::from_bits_truncate(data[2 + ch * 2]),
        });
        Ok(Self {
            format: data[0],
            channels,
            pcm: locate_pcm(data),
        })
    }
}

/// A sample track listed for an SCI1 device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sci1SampleInfo {
    pub track: usize,
    pub offset: usize,
    pub rate: i16,
    pub length: u16,
    pub begin: i16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sci1Summary {
    pub header: Sci1Header,
    /// Samples of each device, in device table order
    pub samples: Vec<(u8, Vec<Sci1SampleInfo>)>,
}

impl Sci1Summary {
    pub fn read(data: &[u8]) -> std::io::Result<Self> {
        let (_, header) = Sci1Header::parse::<nom::error::VerboseError<&[u8]>>(data)
            .map_err(|e| crate::invalid_data(crate::convert_error(data, e)))?;
        let samples = header
            .devices
            .iter()
            .map(|device| {
                let samples = device
                    .tracks
                    .iter()
                    .enumerate()
                    .filter_map(|(track, entry)| {
                        let offset = entry.offset as usize;
                        if data.get(offset) != Some(&SCI1_SAMPLE_MARKER) {
                            return None;
                        }
                        match Sci1SampleHeader::read(&mut Cursor::new(&data[offset..])) {
                            Ok(h) => Some(Sci1SampleInfo {
                                track,
                                offset,
                                rate: h.rate,
                                length: h.length,
                                begin: h.begin,
                            }),
                            Err(e) => {
                                log::warn!("Unreadable sample header at 0x{offset:x}: {e}");
                                None
                            }
                        }
                    })
                    .collect();
                (device.id, samples)
            })
            .collect();
        Ok(Self { header, samples })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SongSummary {
    Sci0(Sci0Summary),
    Sci1(Sci1Summary),
}

impl SongSummary {
    pub fn read(data: &[u8], kind: SongKind) -> std::io::Result<Self> {
        Ok(match kind {
            SongKind::Sci0 => Self::Sci0(Sci0Summary::read(data)?),
            SongKind::Sci1 => Self::Sci1(Sci1Summary::read(data)?),
        })
    }
}
