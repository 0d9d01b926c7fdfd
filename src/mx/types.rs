/// A mail exchanger with its relative preference. Lower priority sorts
/// first; ties keep source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub exchange: String,
    pub priority: u16,
}

impl MxRecord {
    /// Priority assumed when the record carries none.
    pub const UNKNOWN_PRIORITY: u16 = u16::MAX;

    pub fn new(exchange: impl Into<String>, priority: impl Into<Option<u16>>) -> Self {
        Self {
            exchange: exchange.into(),
            priority: priority.into().unwrap_or(Self::UNKNOWN_PRIORITY),
        }
    }
}
