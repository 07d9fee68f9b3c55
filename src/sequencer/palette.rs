//! Stimulus background colors
//!
//! One table maps each color label to the hex value drawn on screen. The
//! sequencer assigns colors from it; the alignment side only reads it, e.g.
//! to normalize a stimulus log that recorded hex values instead of labels.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PaletteColor {
    pub label: &'static str,
    pub hex: &'static str,
}

pub const PALETTE: [PaletteColor; 2] = [
    PaletteColor {
        label: "yellow",
        hex: "#F1E05C",
    },
    PaletteColor {
        label: "blue",
        hex: "#A6D5FF",
    },
];

/// Color for a trial: `PALETTE[trial mod len]`
pub fn color_for_trial(trial_index: usize) -> PaletteColor {
    PALETTE[trial_index % PALETTE.len()]
}

pub fn by_label(label: &str) -> Option<PaletteColor> {
    PALETTE
        .iter()
        .copied()
        .find(|c| c.label.eq_ignore_ascii_case(label))
}

pub fn by_hex(hex: &str) -> Option<PaletteColor> {
    PALETTE.iter().copied().find(|c| c.hex.eq_ignore_ascii_case(hex))
}

/// Accept either a label or a hex value and return the label
pub fn normalize(value: &str) -> Option<&'static str> {
    by_label(value).or_else(|| by_hex(value)).map(|c| c.label)
}
