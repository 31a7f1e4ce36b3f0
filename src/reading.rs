//! Interpretation of a [`DisplayState`] as a measurement.
//!
//! Flags that should be mutually exclusive are checked in a fixed order and
//! the last one found wins, exactly as the display logic of the meter has
//! been observed to behave. The orders are:
//!
//! * scale prefix: nano, micro, milli, kilo, Mega
//! * modifier: Min, Max, PeakToPeak, Delta

use crate::protocol::{DisplayState, DIGIT_COUNT};
use std::fmt;

/// Units indexed by switch position; the last two are dBm and percent overrides.
pub const UNITS: [&str; 11] = ["V", "V", "V", "Hz", "V", "Ohm", "F", "A", "A", "dBm", "%"];

const DBM_INDEX: usize = 9;
const PERCENT_INDEX: usize = 10;

#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalePrefix {
    #[default]
    None,
    Nano,
    Micro,
    Milli,
    Kilo,
    Mega,
}

impl ScalePrefix {
    pub fn factor(self) -> f64 {
        match self {
            ScalePrefix::None => 1.0,
            ScalePrefix::Nano => 1e-9,
            ScalePrefix::Micro => 1e-6,
            ScalePrefix::Milli => 1e-3,
            ScalePrefix::Kilo => 1e3,
            ScalePrefix::Mega => 1e6,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            ScalePrefix::None => "",
            ScalePrefix::Nano => "n",
            ScalePrefix::Micro => "u",
            ScalePrefix::Milli => "m",
            ScalePrefix::Kilo => "k",
            ScalePrefix::Mega => "M",
        }
    }
}

impl fmt::Display for ScalePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcDc {
    #[default]
    None,
    Ac,
    Dc,
    AcDc,
}

impl fmt::Display for AcDc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AcDc::None => "",
            AcDc::Ac => "AC",
            AcDc::Dc => "DC",
            AcDc::AcDc => "AC+DC",
        })
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Modifier {
    #[default]
    None,
    Min,
    Max,
    PeakToPeak,
    Delta,
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Modifier::None => "",
            Modifier::Min => "Min",
            Modifier::Max => "Max",
            Modifier::PeakToPeak => "p-p",
            Modifier::Delta => "Delta",
        })
    }
}

/// A measurement as shown on the meter.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Displayed number multiplied by the scale prefix.
    pub value: f64,
    /// Digits as shown, e.g. `"-1.234"` or `"0L"`.
    pub text: String,
    pub prefix: ScalePrefix,
    pub unit: &'static str,
    pub acdc: AcDc,
    pub modifier: Modifier,
}

impl Reading {
    pub fn from_display_state(state: &DisplayState) -> Self {
        let text = display_text(state);
        let mut value = parse_display_number(&text);

        let mut prefix = ScalePrefix::None;
        if !state.dbm && !state.percent {
            for (set, candidate) in [
                (state.nano, ScalePrefix::Nano),
                (state.micro, ScalePrefix::Micro),
                (state.milli, ScalePrefix::Milli),
                (state.kilo, ScalePrefix::Kilo),
                (state.mega, ScalePrefix::Mega),
            ] {
                if set {
                    prefix = candidate;
                    value *= candidate.factor();
                }
            }
        }

        let unit_index = if state.dbm {
            DBM_INDEX
        } else if state.percent {
            PERCENT_INDEX
        } else {
            switch_index(state.switch_position)
        };

        let acdc = match (state.ac, state.dc) {
            (true, true) => AcDc::AcDc,
            (false, true) => AcDc::Dc,
            (true, false) => AcDc::Ac,
            (false, false) => AcDc::None,
        };

        let mut modifier = Modifier::None;
        for (set, candidate) in [
            (state.min, Modifier::Min),
            (state.max, Modifier::Max),
            (state.peak_to_peak, Modifier::PeakToPeak),
            (state.delta, Modifier::Delta),
        ] {
            if set {
                modifier = candidate;
            }
        }

        Self {
            value,
            text,
            prefix,
            unit: UNITS[unit_index],
            acdc,
            modifier,
        }
    }
}

impl From<&DisplayState> for Reading {
    fn from(state: &DisplayState) -> Self {
        Self::from_display_state(state)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}{}", self.text, self.prefix, self.unit)?;
        if self.acdc != AcDc::None {
            write!(f, " {}", self.acdc)?;
        }
        if self.modifier != Modifier::None {
            write!(f, " {}", self.modifier)?;
        }
        Ok(())
    }
}

/// Index into [`UNITS`] for an inverted switch code (zero or a single set bit).
pub fn switch_index(switch_position: u8) -> usize {
    if switch_position == 0 {
        return 0;
    }
    let msn = switch_position >> 4;
    let lsn = switch_position & 0x0F;
    if msn != 0 {
        5 - bit_position(msn)
    } else {
        4 + bit_position(lsn)
    }
}

// log2 of a single-bit value.
fn bit_position(value: u8) -> usize {
    value.trailing_zeros() as usize
}

/// Renders the digit cells into text, dropping segment patterns with no glyph.
pub fn display_text(state: &DisplayState) -> String {
    let mut text = String::with_capacity(2 * DIGIT_COUNT);
    for (index, cell) in state.digits.iter().enumerate() {
        if cell.decimal_or_minus {
            text.push(if index == 0 { '-' } else { '.' });
        }
        if !cell.is_blank() {
            match cell.glyph() {
                Some(glyph) => text.push(glyph),
                None => log::trace!(
                    "Unmapped segment pattern {:#04x} in digit {index}",
                    cell.segments
                ),
            }
        }
    }
    text
}

/// Parses the leading `-?digits[.digits]` part of `text`; anything else is 0.0.
pub fn parse_display_number(text: &str) -> f64 {
    let bytes = text.as_bytes();
    let mut end = 0;
    if bytes.first() == Some(&b'-') {
        end = 1;
    }
    let mut seen_point = false;
    while let Some(&byte) = bytes.get(end) {
        match byte {
            b'0'..=b'9' => end += 1,
            b'.' if !seen_point => {
                seen_point = true;
                end += 1;
            }
            _ => break,
        }
    }
    text[..end].parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DigitCell;

    fn state_showing(cells: [(char, bool); DIGIT_COUNT]) -> DisplayState {
        let mut state = DisplayState::default();
        for (cell, (glyph, point)) in state.digits.iter_mut().zip(cells) {
            *cell = DigitCell::from_glyph(glyph, point);
        }
        state
    }

    #[test]
    fn digits_with_decimal_point() {
        let state = state_showing([
            ('1', false),
            ('2', false),
            ('3', true),
            ('4', false),
            (' ', false),
            (' ', false),
        ]);
        assert_eq!(display_text(&state), "12.34");
        let reading = Reading::from_display_state(&state);
        assert_eq!(reading.value, 12.34);
        assert_eq!(reading.text, "12.34");
    }

    #[test]
    fn first_cell_flag_is_minus() {
        let state = state_showing([
            ('0', true),
            ('0', true),
            ('5', false),
            ('0', false),
            ('1', false),
            (' ', false),
        ]);
        assert_eq!(display_text(&state), "-0.0501");
        assert_eq!(Reading::from(&state).value, -0.0501);
    }

    #[test]
    fn unmapped_pattern_is_skipped() {
        let mut state = state_showing([
            ('7', false),
            (' ', false),
            ('1', false),
            (' ', false),
            (' ', false),
            (' ', false),
        ]);
        state.digits[1] = DigitCell {
            segments: 0x01,
            decimal_or_minus: false,
        };
        assert_eq!(display_text(&state), "71");
        assert_eq!(Reading::from(&state).value, 71.0);
    }

    #[test]
    fn non_numeric_display_parses_as_zero() {
        assert_eq!(parse_display_number(""), 0.0);
        assert_eq!(parse_display_number("-"), 0.0);
        assert_eq!(parse_display_number("."), 0.0);
        assert_eq!(parse_display_number("Err"), 0.0);
        assert_eq!(parse_display_number("0L"), 0.0);
        assert_eq!(parse_display_number("1.2.3"), 1.2);
        assert_eq!(parse_display_number("-4.5E"), -4.5);
        assert_eq!(parse_display_number(".5"), 0.5);
    }

    #[test]
    fn overload_keeps_its_text() {
        let state = state_showing([
            (' ', false),
            ('0', true),
            ('L', false),
            (' ', false),
            (' ', false),
            (' ', false),
        ]);
        let reading = Reading::from(&state);
        assert_eq!(reading.text, ".0L");
        assert_eq!(reading.value, 0.0);
    }

    #[test]
    fn kilo_scales_value() {
        let mut state = state_showing([
            ('5', false),
            (' ', false),
            (' ', false),
            (' ', false),
            (' ', false),
            (' ', false),
        ]);
        state.kilo = true;
        let reading = Reading::from(&state);
        assert_eq!(reading.value, 5000.0);
        assert_eq!(reading.prefix, ScalePrefix::Kilo);
    }

    #[test]
    fn last_scale_flag_wins_and_all_factors_apply() {
        let mut state = state_showing([
            ('2', false),
            (' ', false),
            (' ', false),
            (' ', false),
            (' ', false),
            (' ', false),
        ]);
        state.nano = true;
        state.milli = true;
        let reading = Reading::from(&state);
        assert_eq!(reading.prefix, ScalePrefix::Milli);
        assert!((reading.value - 2e-12).abs() < 1e-24);
    }

    #[test]
    fn dbm_and_percent_skip_scaling() {
        let mut state = state_showing([
            ('3', false),
            (' ', false),
            (' ', false),
            (' ', false),
            (' ', false),
            (' ', false),
        ]);
        state.milli = true;
        state.dbm = true;
        let reading = Reading::from(&state);
        assert_eq!(reading.value, 3.0);
        assert_eq!(reading.prefix, ScalePrefix::None);
        assert_eq!(reading.unit, "dBm");

        state.dbm = false;
        state.percent = true;
        let reading = Reading::from(&state);
        assert_eq!(reading.value, 3.0);
        assert_eq!(reading.unit, "%");
    }

    #[test]
    fn switch_positions() {
        assert_eq!(switch_index(0), 0);
        assert_eq!(switch_index(0b0000_0001), 4);
        assert_eq!(switch_index(0b0000_1000), 7);
        assert_eq!(switch_index(0b0001_0000), 5);
        assert_eq!(switch_index(0b1000_0000), 2);

        let mut state = DisplayState {
            switch_position: 0b0000_0001,
            ..Default::default()
        };
        assert_eq!(Reading::from(&state).unit, "V");
        state.switch_position = 0b0001_0000;
        assert_eq!(Reading::from(&state).unit, "Ohm");
        state.switch_position = 0;
        assert_eq!(Reading::from(&state).unit, "V");
        state.dbm = true;
        assert_eq!(Reading::from(&state).unit, "dBm");
        state.percent = true;
        assert_eq!(Reading::from(&state).unit, "dBm");
    }

    #[test]
    fn ac_dc_label() {
        let mut state = DisplayState::default();
        assert_eq!(Reading::from(&state).acdc, AcDc::None);
        state.ac = true;
        assert_eq!(Reading::from(&state).acdc, AcDc::Ac);
        state.dc = true;
        assert_eq!(Reading::from(&state).acdc, AcDc::AcDc);
        state.ac = false;
        assert_eq!(Reading::from(&state).acdc, AcDc::Dc);
    }

    #[test]
    fn modifier_precedence() {
        let mut state = DisplayState {
            min: true,
            delta: true,
            ..Default::default()
        };
        assert_eq!(Reading::from(&state).modifier, Modifier::Delta);
        state.delta = false;
        state.max = true;
        assert_eq!(Reading::from(&state).modifier, Modifier::Max);
        state.peak_to_peak = true;
        assert_eq!(Reading::from(&state).modifier, Modifier::PeakToPeak);
        state = DisplayState {
            min: true,
            ..Default::default()
        };
        assert_eq!(Reading::from(&state).modifier, Modifier::Min);
    }

    #[test]
    fn display_format() {
        let mut state = state_showing([
            ('0', true),
            ('1', false),
            ('2', true),
            ('5', false),
            (' ', false),
            (' ', false),
        ]);
        state.milli = true;
        state.dc = true;
        state.max = true;
        state.switch_position = 0b0000_0001;
        assert_eq!(Reading::from(&state).to_string(), "-01.25 mV DC Max");
    }
}
