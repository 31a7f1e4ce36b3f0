//! Wire format of the BM857 optical interface.
//!
//! The meter answers an infrared pulse with [`FRAME_LEN`] symbol bytes. Every
//! symbol carries one payload nibble between fixed start and stop markers.
//! The first symbol only synchronizes the receiver; the remaining 34 nibbles
//! are packed high-nibble-first into the 17 byte [`Record`], which mirrors the
//! LCD segment and annunciator memory of the instrument. [`decode`] turns a
//! [`RawFrame`] into a [`DisplayState`] with named flags.

use std::fmt;

/// Serial bit rate of the optical link (128 µs per bit).
pub const BAUD_RATE: u32 = 1_000_000 / 128;
/// Number of symbol bytes sent per frame, including the sync symbol.
pub const FRAME_LEN: usize = 35;
/// Number of bytes in an unpacked record.
pub const RECORD_LEN: usize = 17;
/// Number of seven segment digit cells on the main display.
pub const DIGIT_COUNT: usize = 6;
/// Number of segments of the analog bargraph.
pub const BARGRAPH_SEGMENTS: u32 = 50;

// Start marker 01 in bits 6-7, stop marker 11 in bits 0-1. A bitfield
// declaration with `start:2` first places them mirrored (start == 1 in bits
// 0-1, stop == 3 in bits 6-7); symbols in that layout are rejected here.
const START_MASK: u8 = 0b1100_0000;
const START_MARK: u8 = 0b0100_0000;
const STOP_MASK: u8 = 0b0000_0011;
const STOP_MARK: u8 = 0b0000_0011;
const NIBBLE_SHIFT: u8 = 2;

// Record byte offsets.
const SWITCH_BYTE: usize = 0;
const RANGE_BYTE: usize = 1;
const MODE_BYTE: usize = 2;
const DIGITS_BYTE: usize = 3;
const BAR_LOW_BYTE: usize = 9;
const BAR_BYTES: std::ops::Range<usize> = 10..15;
const MIN_PERCENT_BYTE: usize = 15;
const MODIFIER_BYTE: usize = 16;

// Record byte 1.
const DBM: u8 = 0x01;
const MILLI: u8 = 0x02;
const MICRO: u8 = 0x04;
const VOLTS: u8 = 0x08;
const HZ: u8 = 0x10;
const OHMS: u8 = 0x20;
const KILO: u8 = 0x40;
const MEGA: u8 = 0x80;

// Record byte 2.
const AUTO: u8 = 0x01;
const HOLD: u8 = 0x02;
const DC: u8 = 0x04;
const AC: u8 = 0x08;
const NANO: u8 = 0x40;

// Record byte 9.
const BAR_LOW_MASK: u8 = 0x3F;
const BEEP: u8 = 0x40;

// Record byte 15.
const MIN: u8 = 0x02;
const PERCENT: u8 = 0x08;
const BAR_HIGH_SHIFT: u8 = 4;

// Record byte 16.
const PEAK_TO_PEAK: u8 = 0x10;
const MAX: u8 = 0x40;
const DELTA: u8 = 0x80;

/// Bits of every record byte whose meaning is not known.
///
/// They are kept in [`DisplayState::reserved_bits`] untouched so that they can
/// be studied without changing the decoder.
pub const RESERVED_MASK: [u8; RECORD_LEN] = [
    0x00, 0x00, 0xB0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x05, 0x2F,
];

/// Seven segment patterns known from the display, paired with their glyph.
pub const SEGMENT_CODEBOOK: [(u8, char); 15] = [
    (0x7D, '0'),
    (0x05, '1'),
    (0x5B, '2'),
    (0x1F, '3'),
    (0x27, '4'),
    (0x3E, '5'),
    (0x7E, '6'),
    (0x15, '7'),
    (0x7F, '8'),
    (0x3F, '9'),
    (0x7A, 'E'),
    (0x68, 'L'),
    (0x46, 'n'),
    (0x42, 'r'),
    (0x02, '-'),
];

/// Errors raised while validating or unpacking a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A symbol does not carry the `01` start and `11` stop markers.
    #[error("framing error in symbol {index}: {symbol:#04x}")]
    Framing { index: usize, symbol: u8 },

    /// A frame was built from a buffer of the wrong size.
    #[error("frame must be {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// One transport byte: start marker, payload nibble, stop marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol(u8);

impl Symbol {
    pub fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Builds a correctly framed symbol around `nibble` (upper bits ignored).
    pub fn from_nibble(nibble: u8) -> Self {
        Self(START_MARK | ((nibble & 0x0F) << NIBBLE_SHIFT) | STOP_MARK)
    }

    pub fn is_valid(self) -> bool {
        self.0 & START_MASK == START_MARK && self.0 & STOP_MASK == STOP_MARK
    }

    pub fn nibble(self) -> u8 {
        (self.0 >> NIBBLE_SHIFT) & 0x0F
    }

    pub fn raw(self) -> u8 {
        self.0
    }
}

/// The 35 symbol bytes of one meter response, exactly as received.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RawFrame([u8; FRAME_LEN]);

impl RawFrame {
    pub fn new(bytes: [u8; FRAME_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let bytes: [u8; FRAME_LEN] = bytes.try_into().map_err(|_| Error::Length {
            expected: FRAME_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(bytes))
    }

    /// Encodes a record the way the meter transmits it, with a zero sync nibble.
    pub fn from_record(record: &Record) -> Self {
        let mut bytes = [Symbol::from_nibble(0).raw(); FRAME_LEN];
        for (i, byte) in record.as_bytes().iter().enumerate() {
            bytes[1 + 2 * i] = Symbol::from_nibble(byte >> 4).raw();
            bytes[2 + 2 * i] = Symbol::from_nibble(byte & 0x0F).raw();
        }
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    pub fn symbols(&self) -> impl Iterator<Item = Symbol> + '_ {
        self.0.iter().copied().map(Symbol::new)
    }

    /// Checks the framing bits of all symbols, reporting the first bad one.
    pub fn validate(&self) -> Result<(), Error> {
        match self.symbols().position(|symbol| !symbol.is_valid()) {
            Some(index) => Err(Error::Framing {
                index,
                symbol: self.0[index],
            }),
            None => Ok(()),
        }
    }

    /// Validates the frame and packs its payload nibbles into a [`Record`].
    pub fn to_record(&self) -> Result<Record, Error> {
        self.validate()?;
        let nibbles: Vec<u8> = self.symbols().skip(1).map(Symbol::nibble).collect();
        Ok(Record::from_nibbles(&nibbles))
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawFrame({:02X?})", &self.0[..])
    }
}

/// The 17 packed bytes of a frame, byte 0 still in its inverted wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Record([u8; RECORD_LEN]);

impl Record {
    pub fn new(bytes: [u8; RECORD_LEN]) -> Self {
        Self(bytes)
    }

    /// Packs nibble pairs high-nibble-first. Missing nibbles read as zero.
    pub fn from_nibbles(nibbles: &[u8]) -> Self {
        let mut bytes = [0u8; RECORD_LEN];
        for (byte, pair) in bytes.iter_mut().zip(nibbles.chunks(2)) {
            let high = pair[0] & 0x0F;
            let low = pair.get(1).copied().unwrap_or(0) & 0x0F;
            *byte = (high << 4) | low;
        }
        Self(bytes)
    }

    pub fn nibbles(&self) -> Vec<u8> {
        self.0.iter().flat_map(|byte| [byte >> 4, byte & 0x0F]).collect()
    }

    pub fn as_bytes(&self) -> &[u8; RECORD_LEN] {
        &self.0
    }
}

/// One seven segment digit and the point (or minus, for the first cell) before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DigitCell {
    pub segments: u8,
    pub decimal_or_minus: bool,
}

impl DigitCell {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            segments: byte & 0x7F,
            decimal_or_minus: byte & 0x80 != 0,
        }
    }

    /// Encodes a glyph from [`SEGMENT_CODEBOOK`]; unknown glyphs give a blank cell.
    pub fn from_glyph(glyph: char, decimal_or_minus: bool) -> Self {
        let segments = SEGMENT_CODEBOOK
            .iter()
            .find(|(_, known)| *known == glyph)
            .map_or(0, |(pattern, _)| *pattern);
        Self {
            segments,
            decimal_or_minus,
        }
    }

    pub fn to_byte(self) -> u8 {
        (self.segments & 0x7F) | if self.decimal_or_minus { 0x80 } else { 0 }
    }

    pub fn is_blank(self) -> bool {
        self.segments == 0
    }

    /// Looks the segment pattern up in [`SEGMENT_CODEBOOK`].
    pub fn glyph(self) -> Option<char> {
        SEGMENT_CODEBOOK
            .iter()
            .find(|(pattern, _)| *pattern == self.segments)
            .map(|(_, glyph)| *glyph)
    }
}

/// Everything the LCD shows, as decoded from one [`Record`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisplayState {
    /// Rotary switch code after inversion: zero or a single set bit.
    pub switch_position: u8,

    pub dbm: bool,
    pub milli: bool,
    pub micro: bool,
    pub volts: bool,
    pub hz: bool,
    pub ohms: bool,
    pub kilo: bool,
    pub mega: bool,

    pub auto: bool,
    pub hold: bool,
    pub dc: bool,
    pub ac: bool,
    pub nano: bool,

    pub digits: [DigitCell; DIGIT_COUNT],

    pub beep: bool,
    /// Lit bargraph segments, bit `n` for segment `n`.
    pub bargraph: u64,

    pub min: bool,
    pub percent: bool,
    pub peak_to_peak: bool,
    pub max: bool,
    pub delta: bool,

    /// Unknown bits of the record, see [`RESERVED_MASK`].
    pub reserved_bits: [u8; RECORD_LEN],
}

impl DisplayState {
    pub fn from_record(record: &Record) -> Self {
        let bytes = record.as_bytes();
        let range = bytes[RANGE_BYTE];
        let mode = bytes[MODE_BYTE];

        let mut digits = [DigitCell::default(); DIGIT_COUNT];
        for (cell, byte) in digits.iter_mut().zip(&bytes[DIGITS_BYTE..]) {
            *cell = DigitCell::from_byte(*byte);
        }

        let mut bargraph = u64::from(bytes[BAR_LOW_BYTE] & BAR_LOW_MASK);
        for (i, byte) in bytes[BAR_BYTES].iter().enumerate() {
            bargraph |= u64::from(*byte) << (6 + 8 * i);
        }
        bargraph |= u64::from(bytes[MIN_PERCENT_BYTE] >> BAR_HIGH_SHIFT) << 46;

        let mut reserved_bits = [0u8; RECORD_LEN];
        for (reserved, (byte, mask)) in reserved_bits
            .iter_mut()
            .zip(bytes.iter().zip(RESERVED_MASK.iter()))
        {
            *reserved = byte & mask;
        }

        Self {
            switch_position: !bytes[SWITCH_BYTE],
            dbm: range & DBM != 0,
            milli: range & MILLI != 0,
            micro: range & MICRO != 0,
            volts: range & VOLTS != 0,
            hz: range & HZ != 0,
            ohms: range & OHMS != 0,
            kilo: range & KILO != 0,
            mega: range & MEGA != 0,
            auto: mode & AUTO != 0,
            hold: mode & HOLD != 0,
            dc: mode & DC != 0,
            ac: mode & AC != 0,
            nano: mode & NANO != 0,
            digits,
            beep: bytes[BAR_LOW_BYTE] & BEEP != 0,
            bargraph,
            min: bytes[MIN_PERCENT_BYTE] & MIN != 0,
            percent: bytes[MIN_PERCENT_BYTE] & PERCENT != 0,
            peak_to_peak: bytes[MODIFIER_BYTE] & PEAK_TO_PEAK != 0,
            max: bytes[MODIFIER_BYTE] & MAX != 0,
            delta: bytes[MODIFIER_BYTE] & DELTA != 0,
            reserved_bits,
        }
    }

    /// Rebuilds the wire record; the inverse of [`DisplayState::from_record`].
    pub fn to_record(&self) -> Record {
        let flag = |set: bool, bit: u8| if set { bit } else { 0 };
        let mut bytes = self.reserved_bits;
        for (byte, mask) in bytes.iter_mut().zip(RESERVED_MASK.iter()) {
            *byte &= mask;
        }

        bytes[SWITCH_BYTE] = !self.switch_position;
        bytes[RANGE_BYTE] |= flag(self.dbm, DBM)
            | flag(self.milli, MILLI)
            | flag(self.micro, MICRO)
            | flag(self.volts, VOLTS)
            | flag(self.hz, HZ)
            | flag(self.ohms, OHMS)
            | flag(self.kilo, KILO)
            | flag(self.mega, MEGA);
        bytes[MODE_BYTE] |= flag(self.auto, AUTO)
            | flag(self.hold, HOLD)
            | flag(self.dc, DC)
            | flag(self.ac, AC)
            | flag(self.nano, NANO);
        for (byte, cell) in bytes[DIGITS_BYTE..].iter_mut().zip(self.digits.iter()) {
            *byte = cell.to_byte();
        }
        bytes[BAR_LOW_BYTE] |= (self.bargraph as u8 & BAR_LOW_MASK) | flag(self.beep, BEEP);
        for (i, byte) in bytes[BAR_BYTES].iter_mut().enumerate() {
            *byte = (self.bargraph >> (6 + 8 * i)) as u8;
        }
        bytes[MIN_PERCENT_BYTE] |= (((self.bargraph >> 46) as u8 & 0x0F) << BAR_HIGH_SHIFT)
            | flag(self.min, MIN)
            | flag(self.percent, PERCENT);
        bytes[MODIFIER_BYTE] |= flag(self.peak_to_peak, PEAK_TO_PEAK)
            | flag(self.max, MAX)
            | flag(self.delta, DELTA);
        Record::new(bytes)
    }

    /// Number of lit bargraph segments.
    pub fn bargraph_level(&self) -> u32 {
        (self.bargraph & ((1u64 << BARGRAPH_SEGMENTS) - 1)).count_ones()
    }
}

/// Validates a frame and interprets it as display state.
///
/// Pure: the result depends on nothing but `frame`.
pub fn decode(frame: &RawFrame) -> Result<DisplayState, Error> {
    let record = frame.to_record()?;
    Ok(DisplayState::from_record(&record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn valid_frame() -> [u8; FRAME_LEN] {
        [Symbol::from_nibble(0xA).raw(); FRAME_LEN]
    }

    #[test]
    fn symbol_markers() {
        assert!(Symbol::new(0b0100_0011).is_valid());
        assert!(Symbol::new(0b0111_1111).is_valid());
        assert!(!Symbol::new(0b1100_0011).is_valid());
        assert!(!Symbol::new(0b0000_0011).is_valid());
        assert!(!Symbol::new(0b0100_0001).is_valid());
        assert!(!Symbol::new(0b0100_0010).is_valid());
        assert_eq!(Symbol::new(0b0110_1011).nibble(), 0b1010);
        assert_eq!(Symbol::from_nibble(0x5).raw(), 0b0101_0111);
    }

    #[test]
    fn any_corrupted_symbol_fails_the_frame() {
        assert!(RawFrame::new(valid_frame()).validate().is_ok());

        for index in 0..FRAME_LEN {
            for corruption in [0x80u8, 0x40, 0x01, 0x02] {
                let mut bytes = valid_frame();
                bytes[index] ^= corruption;
                let frame = RawFrame::new(bytes);
                assert_eq!(
                    frame.validate(),
                    Err(Error::Framing {
                        index,
                        symbol: bytes[index]
                    })
                );
                assert_matches!(decode(&frame), Err(Error::Framing { .. }));
            }
        }
    }

    #[test]
    fn first_violation_is_reported() {
        let mut bytes = valid_frame();
        bytes[7] = 0x00;
        bytes[3] = 0xFF;
        assert_matches!(
            RawFrame::new(bytes).validate(),
            Err(Error::Framing { index: 3, symbol: 0xFF })
        );
    }

    #[test]
    fn frame_length_is_checked() {
        assert_matches!(
            RawFrame::from_slice(&[0x43; 34]),
            Err(Error::Length {
                expected: 35,
                actual: 34
            })
        );
        assert!(RawFrame::from_slice(&[0x43; 35]).is_ok());
    }

    #[test]
    fn nibbles_pack_high_first_and_unpack_unchanged() {
        let nibbles: Vec<u8> = (0..34u8).map(|i| (i * 7 + 3) & 0x0F).collect();
        let record = Record::from_nibbles(&nibbles);
        assert_eq!(record.as_bytes()[0], (nibbles[0] << 4) | nibbles[1]);
        assert_eq!(record.as_bytes()[16], (nibbles[32] << 4) | nibbles[33]);
        assert_eq!(record.nibbles(), nibbles);
    }

    #[test]
    fn sync_symbol_is_discarded() {
        let mut bytes = valid_frame();
        bytes[0] = Symbol::from_nibble(0x3).raw();
        bytes[1] = Symbol::from_nibble(0x1).raw();
        bytes[2] = Symbol::from_nibble(0x2).raw();
        let record = RawFrame::new(bytes).to_record().unwrap();
        assert_eq!(record.as_bytes()[0], 0x12);
        assert_eq!(record.as_bytes()[1], 0xAA);
    }

    #[test]
    fn switch_code_is_inverted() {
        let mut bytes = [0u8; RECORD_LEN];
        bytes[0] = 0xFF;
        assert_eq!(DisplayState::from_record(&Record::new(bytes)).switch_position, 0);
        bytes[0] = !0b0001_0000;
        assert_eq!(
            DisplayState::from_record(&Record::new(bytes)).switch_position,
            0b0001_0000
        );
    }

    #[test]
    fn flags_follow_record_layout() {
        let mut bytes = [0u8; RECORD_LEN];
        bytes[0] = 0xFF;
        bytes[1] = VOLTS | MILLI;
        bytes[2] = AUTO | DC | NANO;
        bytes[3] = 0x80 | 0x05;
        bytes[9] = BEEP | 0x07;
        bytes[15] = MIN | PERCENT;
        bytes[16] = PEAK_TO_PEAK | DELTA;

        let state = DisplayState::from_record(&Record::new(bytes));
        assert!(state.volts && state.milli);
        assert!(!state.dbm && !state.micro && !state.kilo && !state.mega);
        assert!(state.auto && state.dc && state.nano);
        assert!(!state.hold && !state.ac);
        assert_eq!(
            state.digits[0],
            DigitCell {
                segments: 0x05,
                decimal_or_minus: true
            }
        );
        assert_eq!(state.digits[0].glyph(), Some('1'));
        assert!(state.digits[1].is_blank());
        assert!(state.beep);
        assert_eq!(state.bargraph, 0x07);
        assert_eq!(state.bargraph_level(), 3);
        assert!(state.min && state.percent);
        assert!(state.peak_to_peak && state.delta && !state.max);
        assert_eq!(state.reserved_bits, [0u8; RECORD_LEN]);
    }

    #[test]
    fn bargraph_spans_three_fields() {
        let mut bytes = [0u8; RECORD_LEN];
        bytes[9] = 0x3F;
        bytes[10] = 0x01;
        bytes[14] = 0x80;
        bytes[15] = 0xF0;
        let state = DisplayState::from_record(&Record::new(bytes));
        assert_eq!(state.bargraph, 0x3Fu64 | 1u64 << 6 | 1u64 << 45 | 0xFu64 << 46);
        assert_eq!(state.bargraph_level(), 6 + 1 + 1 + 4);
        assert!(!state.min && !state.percent);
    }

    #[test]
    fn reserved_bits_are_preserved() {
        let mut bytes = [0u8; RECORD_LEN];
        bytes[0] = 0xFF;
        bytes[2] = 0xFF;
        bytes[9] = 0x80;
        bytes[15] = 0x05;
        bytes[16] = 0x2F;
        let record = Record::new(bytes);
        let state = DisplayState::from_record(&record);
        assert_eq!(state.reserved_bits[2], 0xB0);
        assert_eq!(state.reserved_bits[9], 0x80);
        assert_eq!(state.reserved_bits[15], 0x05);
        assert_eq!(state.reserved_bits[16], 0x2F);
        assert!(!state.min && !state.percent && !state.max);
        assert_eq!(state.to_record(), record);
    }

    #[test]
    fn decode_is_repeatable() {
        let mut state = DisplayState {
            switch_position: 0x02,
            volts: true,
            dc: true,
            ..Default::default()
        };
        state.digits[0] = DigitCell::from_glyph('4', false);
        state.digits[1] = DigitCell::from_glyph('2', true);
        let frame = RawFrame::from_record(&state.to_record());

        assert_eq!(decode(&frame), Ok(state.clone()));
        assert_eq!(decode(&frame), Ok(state));
    }
}
