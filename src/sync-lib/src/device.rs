use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEVICE_ID_LENGTH: usize = 32;

/// The device id the metadata store uses for "files we have locally",
/// independent of the real id of this device.
pub const LOCAL_DEVICE_ID: DeviceId = DeviceId([0xff; DEVICE_ID_LENGTH]);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub [u8; DEVICE_ID_LENGTH]);

/// The first 64 bits of a device id, the form used in version vectors.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ShortId(pub u64);

impl DeviceId {
    pub fn new(raw: [u8; DEVICE_ID_LENGTH]) -> Self {
        Self(raw)
    }

    pub fn short_id(&self) -> ShortId {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        ShortId(u64::from_be_bytes(head))
    }

    pub fn is_local(&self) -> bool {
        *self == LOCAL_DEVICE_ID
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.short_id())
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
