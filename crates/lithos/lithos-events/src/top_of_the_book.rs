#![forbid(unsafe_code)]

// SymbolId is consistent and stable across all processes
// repr(transparent) -> ensures that the struct memory layout is same as its single field
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SymbolId(pub u16);

/// Best bid/ask snapshot for one symbol.
///
/// Prices are in ticks and quantities in lots so the wire form stays integral.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TopOfBook {
    pub ts_event_ns: u64,
    pub symbol_id: SymbolId,
    pub bid_px_ticks: i64,
    pub bid_qty_lots: i64,
    pub ask_px_ticks: i64,
    pub ask_qty_lots: i64,
}

impl TopOfBook {
    /// Encoded size in bytes.
    pub const WIRE_LEN: usize = 42;

    #[inline] // Function body is directly copied to call site
    pub fn mid_ticks(&self) -> i64 {
        (self.bid_px_ticks + self.ask_px_ticks) / 2
    }

    #[inline]
    pub fn spread_ticks(&self) -> i64 {
        self.ask_px_ticks - self.bid_px_ticks
    }

    /// Little-endian wire form: ts | symbol | bid px | bid qty | ask px | ask qty.
    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..8].copy_from_slice(&self.ts_event_ns.to_le_bytes());
        out[8..10].copy_from_slice(&self.symbol_id.0.to_le_bytes());
        out[10..18].copy_from_slice(&self.bid_px_ticks.to_le_bytes());
        out[18..26].copy_from_slice(&self.bid_qty_lots.to_le_bytes());
        out[26..34].copy_from_slice(&self.ask_px_ticks.to_le_bytes());
        out[34..42].copy_from_slice(&self.ask_qty_lots.to_le_bytes());
        out
    }

    /// Returns `None` unless `bytes` is exactly one encoded snapshot.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let b: &[u8; Self::WIRE_LEN] = bytes.try_into().ok()?;
        Some(Self {
            ts_event_ns: u64::from_le_bytes(b[0..8].try_into().ok()?),
            symbol_id: SymbolId(u16::from_le_bytes(b[8..10].try_into().ok()?)),
            bid_px_ticks: i64::from_le_bytes(b[10..18].try_into().ok()?),
            bid_qty_lots: i64::from_le_bytes(b[18..26].try_into().ok()?),
            ask_px_ticks: i64::from_le_bytes(b[26..34].try_into().ok()?),
            ask_qty_lots: i64::from_le_bytes(b[34..42].try_into().ok()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn symbol_id_is_pod() {
        assert_eq!(size_of::<SymbolId>(), 2);
    }

    #[test]
    fn wire_form_is_fixed_and_decodes() {
        let tob = TopOfBook {
            ts_event_ns: 1_700_000_000_000_000_000,
            symbol_id: SymbolId(42),
            bid_px_ticks: 9_998,
            bid_qty_lots: 3,
            ask_px_ticks: 10_002,
            ask_qty_lots: -1,
        };
        let bytes = tob.encode();
        assert_eq!(&bytes[8..10], &[42, 0]);
        assert_eq!(TopOfBook::decode(&bytes), Some(tob));
        assert_eq!(tob.mid_ticks(), 10_000);
        assert_eq!(tob.spread_ticks(), 4);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let bytes = TopOfBook::default().encode();
        assert_eq!(TopOfBook::decode(&bytes[..41]), None);
        assert_eq!(TopOfBook::decode(&[0u8; 43]), None);
    }
}
