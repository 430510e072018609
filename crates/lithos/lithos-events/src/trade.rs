#![forbid(unsafe_code)]

use crate::SymbolId;

/// Aggressor side of a print.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Side {
    #[default]
    Unknown = 0,
    Buy = 1,
    Sell = 2,
}

impl Side {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Side::Unknown),
            1 => Some(Side::Buy),
            2 => Some(Side::Sell),
            _ => None,
        }
    }
}

/// A single execution print.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Trade {
    pub ts_event_ns: u64,
    pub symbol_id: SymbolId,
    pub px_ticks: i64,
    pub qty_lots: i64,
    pub side: Side,
    pub trade_id: u64,
}

impl Trade {
    pub const WIRE_LEN: usize = 35;

    /// Little-endian wire form: ts | symbol | px | qty | side | trade id.
    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..8].copy_from_slice(&self.ts_event_ns.to_le_bytes());
        out[8..10].copy_from_slice(&self.symbol_id.0.to_le_bytes());
        out[10..18].copy_from_slice(&self.px_ticks.to_le_bytes());
        out[18..26].copy_from_slice(&self.qty_lots.to_le_bytes());
        out[26] = self.side as u8;
        out[27..35].copy_from_slice(&self.trade_id.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let b: &[u8; Self::WIRE_LEN] = bytes.try_into().ok()?;
        Some(Self {
            ts_event_ns: u64::from_le_bytes(b[0..8].try_into().ok()?),
            symbol_id: SymbolId(u16::from_le_bytes(b[8..10].try_into().ok()?)),
            px_ticks: i64::from_le_bytes(b[10..18].try_into().ok()?),
            qty_lots: i64::from_le_bytes(b[18..26].try_into().ok()?),
            side: Side::from_byte(b[26])?,
            trade_id: u64::from_le_bytes(b[27..35].try_into().ok()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_side_byte_is_rejected() {
        let mut bytes = Trade::default().encode();
        bytes[26] = 7;
        assert_eq!(Trade::decode(&bytes), None);
    }

    #[test]
    fn encodes_side_and_id() {
        let t = Trade {
            side: Side::Buy,
            trade_id: 0x0102_0304,
            ..Trade::default()
        };
        let bytes = t.encode();
        assert_eq!(bytes[26], 1);
        assert_eq!(&bytes[27..31], &[4, 3, 2, 1]);
        assert_eq!(Trade::decode(&bytes), Some(t));
    }
}
