//! MPEG-TS resynchronization for segments disguised behind an image header.

use bytes::Bytes;

pub const SYNC_BYTE: u8 = 0x47;
pub const PACKET_LEN: usize = 188;

const IMAGE_MAGICS: [&[u8]; 4] = [
    &[0xFF, 0xD8, 0xFF],       // JPEG
    &[0x89, 0x50, 0x4E, 0x47], // PNG
    &[0x47, 0x49, 0x46, 0x38], // GIF
    &[0x42, 0x4D],             // BMP
];

/// Strips a fake image header in front of a transport stream.
///
/// Best effort: anything that does not look like a disguised stream, or where
/// no aligned packet run can be found, is handed back untouched.
#[must_use]
pub fn repair(data: Bytes) -> Bytes {
    if !has_image_magic(&data) {
        return data;
    }

    match find_packet_start(&data) {
        Some(0) | None => data,
        Some(offset) => data.slice(offset..),
    }
}

fn has_image_magic(data: &[u8]) -> bool {
    IMAGE_MAGICS.iter().any(|magic| data.starts_with(magic))
}

/// Offset of the first sync byte followed by a well-formed packet and another
/// sync byte one packet later.
pub fn find_packet_start(data: &[u8]) -> Option<usize> {
    data.iter()
        .enumerate()
        .filter(|&(_, &b)| b == SYNC_BYTE)
        .map(|(offset, _)| offset)
        .find(|&offset| {
            data.get(offset + PACKET_LEN) == Some(&SYNC_BYTE)
                && PacketHeader::new(&data[offset..]).is_some_and(|h| h.is_valid())
        })
}

/// The four fixed bytes that open every transport stream packet.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader([u8; 4]);

impl PacketHeader {
    pub fn new(data: &[u8]) -> Option<Self> {
        data.get(..4)
            .and_then(|b| b.try_into().ok())
            .map(Self)
    }

    pub const fn sync_byte(self) -> u8 {
        self.0[0]
    }

    pub const fn scrambling_control(self) -> u8 {
        (self.0[3] & 0xC0) >> 6
    }

    pub const fn adaptation_field_control(self) -> u8 {
        (self.0[3] & 0x30) >> 4
    }

    /// Scrambling control `01` is reserved and adaptation field control `00`
    /// means the packet carries nothing.
    pub const fn is_valid(self) -> bool {
        self.sync_byte() == SYNC_BYTE
            && self.scrambling_control() != 1
            && self.adaptation_field_control() != 0
    }
}
