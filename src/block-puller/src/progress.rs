use serde::Serialize;

/// A momentary view of one file's pull.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullerProgress {
    pub total: usize,
    pub reused: usize,
    pub copied_from_origin: usize,
    pub copied_from_origin_shifted: usize,
    pub copied_from_elsewhere: usize,
    pub pulled: usize,
    pub pulling: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

/// Approximate byte count of `num` blocks of `size` bytes. The last block is
/// counted as half full since its real length is not tracked here.
pub fn blocks_to_size(size: u32, num: usize) -> u64 {
    if num < 2 {
        return (size / 2) as u64;
    }
    (num as u64 - 1) * size as u64 + (size / 2) as u64
}
