//! Recognition probes shown after the trial loop
//!
//! Probes are pure presentation: they carry no marker id and publish
//! nothing, so they can never collide with acquisition markers.

use serde::Serialize;

use super::palette::{PaletteColor, PALETTE};
use super::surface::Response;

pub const SAMPLED_PROBES: usize = 15;

pub const FOIL_WORDS: [&str; 5] = ["cat", "boat", "shoe", "belt", "sock"];

/// A (word, color) pair shown during the trial loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedWord {
    pub word: String,
    pub color: PaletteColor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryProbe {
    pub word: String,
    pub color: PaletteColor,
}

/// One answered probe, as written to the results file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryResult {
    pub word: String,
    pub color: String,
    pub response: String,
    pub accuracy: String,
}

impl MemoryResult {
    pub fn is_correct(&self) -> bool {
        self.accuracy == "Correct"
    }
}

/// Build the shuffled probe list
///
/// Up to [`SAMPLED_PROBES`] presented pairs are drawn without replacement;
/// each keeps its true color with probability 1/2 and otherwise gets a
/// different palette color. The foil words follow with random colors.
pub fn generate_probes(presented: &[PresentedWord], rng: &mut fastrand::Rng) -> Vec<MemoryProbe> {
    let mut pool: Vec<&PresentedWord> = presented.iter().collect();
    rng.shuffle(&mut pool);

    let mut probes: Vec<MemoryProbe> = pool
        .into_iter()
        .take(SAMPLED_PROBES)
        .map(|item| {
            let color = if rng.bool() {
                item.color
            } else {
                let others: Vec<PaletteColor> =
                    PALETTE.iter().copied().filter(|c| *c != item.color).collect();
                if others.is_empty() {
                    item.color
                } else {
                    others[rng.usize(..others.len())]
                }
            };
            MemoryProbe {
                word: item.word.clone(),
                color,
            }
        })
        .collect();

    probes.extend(FOIL_WORDS.iter().map(|word| MemoryProbe {
        word: word.to_string(),
        color: PALETTE[rng.usize(..PALETTE.len())],
    }));

    rng.shuffle(&mut probes);
    probes
}

/// "Yes" is correct for a presented pair, "no" for anything else
pub fn score(probe: &MemoryProbe, response: Response, presented: &[PresentedWord]) -> MemoryResult {
    let was_presented = presented
        .iter()
        .any(|p| p.word == probe.word && p.color == probe.color);
    let correct = match response {
        Response::Yes => was_presented,
        Response::No => !was_presented,
        Response::Escape => false,
    };

    MemoryResult {
        word: probe.word.clone(),
        color: probe.color.label.to_string(),
        response: response.key().to_string(),
        accuracy: if correct { "Correct" } else { "Incorrect" }.to_string(),
    }
}
