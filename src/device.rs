bitflags::bitflags! {
    /// Output devices a song may be played on, one bit per device.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DeviceMask: u8 {
        const MT32 = 0b00000001;
        const FB01 = 0b00000010;
        const ADLIB = 0b00000100;
        const MT540 = 0b00001000;
        const TANDY = 0b00010000;
        const PC_SPEAKER = 0b00100000;
    }
}

/// Device selection carried by a play mask message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlayMask {
    pub devices: DeviceMask,
    /// Digital sample output is available
    pub pcm: bool,
}

impl PlayMask {
    #[inline]
    pub fn new(devices: DeviceMask) -> Self {
        Self {
            devices,
            pcm: false,
        }
    }
    #[inline]
    pub fn with_pcm(mut self, pcm: bool) -> Self {
        self.pcm = pcm;
        self
    }
}

pub const SCI1_DEVICE_NONE: u8 = 0xff;

/// SCI1 hardware ID by device bit, without and with PCM output.
pub const SCI0_TO_SCI1_DEVICE_MAP: [[u8; 2]; 8] = [
    [0x06, 0x0c], // MT-32
    [0xff, 0xff], // FB-01
    [0x00, 0x00], // CMS, played as OPL2
    [0xff, 0xff], // MT-540
    [0x13, 0x13], // Tandy 3-voice
    [0x12, 0x12], // PC speaker
    [0xff, 0xff],
    [0xff, 0xff],
];

const SCI1_DEVICE_NAMES: phf::Map<u8, &'static str> = phf::phf_map! {
    0x00u8 => "AdLib",
    0x06u8 => "MT-32",
    0x07u8 => "General MIDI",
    0x08u8 => "FB-01",
    0x09u8 => "CMS",
    0x0cu8 => "MT-32 with PCM",
    0x12u8 => "PC speaker",
    0x13u8 => "Tandy 3-voice",
};

/// Picks the SCI1 hardware ID for the lowest selected device.
pub fn sci1_device_id(mask: PlayMask) -> u8 {
    let bits = mask.devices.bits();
    if bits == 0 {
        return SCI1_DEVICE_NONE;
    }
    SCI0_TO_SCI1_DEVICE_MAP[bits.trailing_zeros() as usize][mask.pcm as usize]
}

#[inline]
pub fn sci1_device_name(id: u8) -> &'static str {
    SCI1_DEVICE_NAMES.get(&id).copied().unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_device_bit_selects_hardware() {
        assert_eq!(sci1_device_id(PlayMask::new(DeviceMask::MT32)), 0x06);
        assert_eq!(
            sci1_device_id(PlayMask::new(DeviceMask::MT32).with_pcm(true)),
            0x0c
        );
        assert_eq!(
            sci1_device_id(PlayMask::new(DeviceMask::ADLIB | DeviceMask::TANDY)),
            0x00
        );
        assert_eq!(sci1_device_id(PlayMask::new(DeviceMask::FB01)), SCI1_DEVICE_NONE);
        assert_eq!(sci1_device_id(PlayMask::new(DeviceMask::empty())), SCI1_DEVICE_NONE);
        assert_eq!(sci1_device_name(0x13), "Tandy 3-voice");
        assert_eq!(sci1_device_name(0x42), "unknown");
    }
}
