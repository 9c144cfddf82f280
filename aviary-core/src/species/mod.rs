//! species — the fixed set of bird species and their display styles
//!
//! Box/background colors come from the project's labeling palette; the font
//! color is picked for contrast against that background.

use std::fmt;
use std::str::FromStr;

use crate::error::{CurationError, Result};

const WHITE: [u8; 3] = [255, 255, 255];
const BLACK: [u8; 3] = [0, 0, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Species {
    CanarioDoAmazonas,
    SanhacoDaAmazonia,
    SanhacoDoCoqueiro,
    Chupim,
    Rolinha,
}

/// Colors used when drawing a detection of one species.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Style {
    pub color: [u8; 3],
    pub font_color: [u8; 3],
}

impl Species {
    pub const ALL: [Species; 5] = [
        Species::CanarioDoAmazonas,
        Species::SanhacoDaAmazonia,
        Species::SanhacoDoCoqueiro,
        Species::Chupim,
        Species::Rolinha,
    ];

    /// Parse a detector/annotation label.
    pub fn from_label(label: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.label() == label)
            .ok_or_else(|| CurationError::UnknownLabel(label.to_string()))
    }

    pub fn label(self) -> &'static str {
        match self {
            Species::CanarioDoAmazonas => "canario_do_amazonas",
            Species::SanhacoDaAmazonia => "sanhaco_da_amazonia",
            Species::SanhacoDoCoqueiro => "sanhaco_do_coqueiro",
            Species::Chupim => "chupim",
            Species::Rolinha => "rolinha",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Species::CanarioDoAmazonas => "Canário-do-amazonas",
            Species::SanhacoDaAmazonia => "Sanhaço-da-amazônia",
            Species::SanhacoDoCoqueiro => "Sanhaço-do-coqueiro",
            Species::Chupim => "Chupim",
            Species::Rolinha => "Rolinha",
        }
    }

    pub fn color(self) -> [u8; 3] {
        match self {
            Species::CanarioDoAmazonas => [0xff, 0xc6, 0x00], // yellow
            Species::SanhacoDaAmazonia => [0x07, 0x2a, 0xc8], // blue
            Species::SanhacoDoCoqueiro => [0x2b, 0x93, 0x48], // green
            Species::Chupim => [0x9e, 0x43, 0x47],            // brown
            Species::Rolinha => [0x2d, 0x37, 0x52],           // grey
        }
    }

    pub fn font_color(self) -> [u8; 3] {
        // Only the yellow background is bright enough to need dark text.
        match self {
            Species::CanarioDoAmazonas => BLACK,
            _ => WHITE,
        }
    }

    pub fn style(self) -> Style {
        Style {
            color: self.color(),
            font_color: self.font_color(),
        }
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Species {
    type Err = CurationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_label(s)
    }
}

/// Parse a `#rrggbb` color string.
pub fn parse_hex_color(hex: &str) -> Option<[u8; 3]> {
    let digits = hex.strip_prefix('#').unwrap_or(hex);
    if digits.len() != 6 || !digits.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_label_round_trips() {
        for species in Species::ALL {
            assert_eq!(Species::from_label(species.label()).unwrap(), species);
            assert_eq!(species.to_string().parse::<Species>().unwrap(), species);
        }
    }

    #[test]
    fn unknown_label_is_rejected() {
        let err = Species::from_label("bem_te_vi").unwrap_err();
        assert!(matches!(err, CurationError::UnknownLabel(ref l) if l == "bem_te_vi"));
    }

    #[test]
    fn only_canario_uses_dark_text() {
        assert_eq!(Species::CanarioDoAmazonas.font_color(), BLACK);
        for species in Species::ALL.into_iter().skip(1) {
            assert_eq!(species.font_color(), WHITE, "{species}");
        }
    }

    #[test]
    fn palette_matches_hex_definitions() {
        let expected = [
            ("canario_do_amazonas", "#ffc600"),
            ("sanhaco_da_amazonia", "#072ac8"),
            ("sanhaco_do_coqueiro", "#2b9348"),
            ("chupim", "#9e4347"),
            ("rolinha", "#2d3752"),
        ];
        for (label, hex) in expected {
            let species = Species::from_label(label).unwrap();
            assert_eq!(Some(species.color()), parse_hex_color(hex));
        }
    }

    #[test]
    fn hex_parsing_rejects_garbage() {
        assert_eq!(parse_hex_color("#fff"), None);
        assert_eq!(parse_hex_color("#gg0000"), None);
        assert_eq!(parse_hex_color("00ff00"), Some([0, 255, 0]));
    }
}
