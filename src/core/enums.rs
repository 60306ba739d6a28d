//! Purpose: Host mirrors of the engine enumerations the binding marshals.
//! Exports: `EnumType`, `Direction`, `BandFormat`.
//! Invariants: Raw values and nicknames match the engine's enum registrations.
use serde::Serialize;

use super::sys;

/// A host enum with a registered engine enum type.
pub trait EnumType: Copy + Send + Sync + 'static {
    const TYPE_ID: u32;

    fn to_raw(self) -> i32;

    fn from_raw(raw: i32) -> Option<Self>;

    fn nick(self) -> &'static str;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Horizontal,
    Vertical,
}

impl EnumType for Direction {
    const TYPE_ID: u32 = sys::VX_TYPE_DIRECTION;

    fn to_raw(self) -> i32 {
        match self {
            Direction::Horizontal => 0,
            Direction::Vertical => 1,
        }
    }

    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Direction::Horizontal),
            1 => Some(Direction::Vertical),
            _ => None,
        }
    }

    fn nick(self) -> &'static str {
        match self {
            Direction::Horizontal => "horizontal",
            Direction::Vertical => "vertical",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BandFormat {
    Uchar,
    Char,
    Ushort,
    Short,
    Uint,
    Int,
    Float,
    Double,
}

impl BandFormat {
    /// Bytes per sample.
    pub fn size(self) -> usize {
        match self {
            BandFormat::Uchar | BandFormat::Char => 1,
            BandFormat::Ushort | BandFormat::Short => 2,
            BandFormat::Uint | BandFormat::Int | BandFormat::Float => 4,
            BandFormat::Double => 8,
        }
    }
}

impl EnumType for BandFormat {
    const TYPE_ID: u32 = sys::VX_TYPE_BAND_FORMAT;

    fn to_raw(self) -> i32 {
        match self {
            BandFormat::Uchar => 0,
            BandFormat::Char => 1,
            BandFormat::Ushort => 2,
            BandFormat::Short => 3,
            BandFormat::Uint => 4,
            BandFormat::Int => 5,
            BandFormat::Float => 6,
            BandFormat::Double => 8,
        }
    }

    fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => BandFormat::Uchar,
            1 => BandFormat::Char,
            2 => BandFormat::Ushort,
            3 => BandFormat::Short,
            4 => BandFormat::Uint,
            5 => BandFormat::Int,
            6 => BandFormat::Float,
            8 => BandFormat::Double,
            _ => return None,
        })
    }

    fn nick(self) -> &'static str {
        match self {
            BandFormat::Uchar => "uchar",
            BandFormat::Char => "char",
            BandFormat::Ushort => "ushort",
            BandFormat::Short => "short",
            BandFormat::Uint => "uint",
            BandFormat::Int => "int",
            BandFormat::Float => "float",
            BandFormat::Double => "double",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_format_raw_values_round_trip() {
        for raw in [0, 1, 2, 3, 4, 5, 6, 8] {
            let format = BandFormat::from_raw(raw).expect("known format");
            assert_eq!(format.to_raw(), raw);
        }
        assert_eq!(BandFormat::from_raw(7), None);
        assert_eq!(BandFormat::Ushort.nick(), "ushort");
        assert_eq!(Direction::from_raw(1), Some(Direction::Vertical));
    }
}
