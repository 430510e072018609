pub mod top_of_the_book;
pub mod trade;

pub use top_of_the_book::{SymbolId, TopOfBook};
pub use trade::{Side, Trade};

/// Application record kinds carried on the bus.
///
/// The discriminant is the record type code written into every record
/// header. `0xFFFF` is taken by the transport's heartbeat and never used here.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    TopOfBook = 1,
    Trade = 2,
}

impl EventKind {
    #[inline]
    pub const fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::TopOfBook),
            2 => Some(Self::Trade),
            _ => None,
        }
    }
}

/// Decoded application event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Event {
    TopOfBook(TopOfBook),
    Trade(Trade),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::TopOfBook(_) => EventKind::TopOfBook,
            Event::Trade(_) => EventKind::Trade,
        }
    }

    /// Decode a payload given the record type code it arrived with.
    pub fn decode(code: u16, payload: &[u8]) -> Option<Self> {
        match EventKind::from_code(code)? {
            EventKind::TopOfBook => TopOfBook::decode(payload).map(Event::TopOfBook),
            EventKind::Trade => Trade::decode(payload).map(Event::Trade),
        }
    }
}
