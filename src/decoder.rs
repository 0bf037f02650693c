use serde::{Deserialize, Serialize};

/// Ordering of either the two bytes inside a register or the two registers of
/// a 32-bit value.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Big,
    Little,
}

impl std::str::FromStr for Endian {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "big" => Ok(Endian::Big),
            "little" => Ok(Endian::Little),
            other => Err(format!("unknown endianness '{other}', expected big or little")),
        }
    }
}

impl std::fmt::Display for Endian {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endian::Big => f.write_str("big"),
            Endian::Little => f.write_str("little"),
        }
    }
}

/// Turns raw registers into unsigned scalars.
///
/// `byte_order` applies to each register on its own; `word_order` only matters
/// for two-register values, where `Little` means the low word comes first.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterDecoder {
    pub word_order: Endian,
    pub byte_order: Endian,
}

impl RegisterDecoder {
    pub fn new(word_order: Endian, byte_order: Endian) -> Self {
        Self { word_order, byte_order }
    }

    pub fn decode_u16(&self, word: u16) -> u16 {
        match self.byte_order {
            Endian::Big => word,
            Endian::Little => word.swap_bytes(),
        }
    }

    pub fn decode_u32(&self, first: u16, second: u16) -> u32 {
        let first = self.decode_u16(first);
        let second = self.decode_u16(second);
        let (high, low) = match self.word_order {
            Endian::Big => (first, second),
            Endian::Little => (second, first),
        };
        ((high as u32) << 16) | low as u32
    }

    /// Decodes `length` registers from the front of `words`.
    ///
    /// Returns `None` when fewer than `length` words are present or the length
    /// is not one or two.
    pub fn decode(&self, words: &[u16], length: u16) -> Option<u32> {
        match (length, words) {
            (1, [word, ..]) => Some(self.decode_u16(*word) as u32),
            (2, [first, second, ..]) => Some(self.decode_u32(*first, *second)),
            _ => None,
        }
    }

    /// Decodes and applies `value * scale + offset`.
    pub fn decode_scaled(&self, words: &[u16], length: u16, scale: f64, offset: f64) -> Option<f64> {
        self.decode(words, length).map(|raw| raw as f64 * scale + offset)
    }
}
