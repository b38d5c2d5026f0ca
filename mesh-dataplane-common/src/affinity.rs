use crate::Id;
use crate::service::FrontendKey;

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct AffinityKey {
    pub client_ip: u32,
    pub frontend: FrontendKey,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for AffinityKey {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AffinityValue {
    /// Monotonic timestamp of the last packet that used this entry
    pub ts_ns: u64,
    pub id: Id,
    pub ordinal: u32,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for AffinityValue {}
