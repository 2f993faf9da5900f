#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Aggregate interface statistics, accumulated into by
/// [`IfQueue::add_data`](crate::ifq::IfQueue::add_data) and
/// [`IfIqueue::add_data`](crate::ifiq::IfIqueue::add_data) and consumed by
/// reporting layers.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceStats {
    pub opackets: u64,
    pub obytes: u64,
    pub oqdrops: u64,
    pub oerrors: u64,
    pub omcasts: u64,
    pub ipackets: u64,
    pub ibytes: u64,
    pub iqdrops: u64,
}
