use strom_shared::{debug_info, AsDebugInfo, DebugInfo};

/// Rounds `value` up to the next multiple of `alignment` which must be a power of two.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    strom_shared::assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Host memory of a constant size that is filled front to back with the bytes of one batch.
pub struct StagingRegion {
    data: Vec<u8>,
    cursor: u64,
    alignment: u64,
    debug_info: DebugInfo,
}

impl StagingRegion {
    /// Creates a new [`StagingRegion`] with `capacity` bytes. Every push starts at a multiple of `alignment`.
    pub fn new(capacity: u64, alignment: u64) -> Self {
        assert!(alignment.is_power_of_two(), "alignment {alignment} is not a power of two");
        Self {
            data: vec![0; capacity as usize],
            cursor: 0,
            alignment,
            debug_info: debug_info!("StagingRegion"),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    /// Number of bytes that are used including the alignment padding
    pub fn len(&self) -> u64 {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Number of bytes that the next push can write
    pub fn remaining(&self) -> u64 {
        self.capacity().saturating_sub(align_up(self.cursor, self.alignment))
    }

    /// Copies the `bytes` to the aligned cursor and returns their offset. Returns `None` when they don't fit.
    pub fn push(&mut self, bytes: &[u8]) -> Option<u64> {
        let offset = align_up(self.cursor, self.alignment);
        let end = offset.checked_add(bytes.len() as u64)?;
        if end > self.capacity() {
            return None;
        }
        self.data[offset as usize..end as usize].copy_from_slice(bytes);
        self.cursor = end;
        Some(offset)
    }

    /// Starts a new batch. Must only be called when the device finished reading the previous one.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// The bytes that were written since the last reset
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.cursor as usize]
    }
}

impl AsDebugInfo for StagingRegion {
    fn as_debug_info(&self) -> &DebugInfo {
        &self.debug_info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 4), 20);
    }

    #[test]
    fn push() {
        let mut staging = StagingRegion::new(64, 16);
        assert!(staging.is_empty());
        assert_eq!(staging.push(&[1, 2, 3]), Some(0));
        assert_eq!(staging.len(), 3);
        assert_eq!(staging.remaining(), 48);
        assert_eq!(staging.push(&[4; 16]), Some(16));
        assert_eq!(staging.push(&[5; 33]), None);
        assert_eq!(staging.push(&[5; 32]), Some(32));
        assert_eq!(staging.remaining(), 0);
        assert_eq!(staging.as_slice().len(), 64);
        assert_eq!(&staging.as_slice()[..3], &[1, 2, 3]);
    }

    #[test]
    fn reset() {
        let mut staging = StagingRegion::new(8, 4);
        staging.push(&[1; 8]).unwrap();
        assert_eq!(staging.remaining(), 0);
        staging.reset();
        assert_eq!(staging.remaining(), 8);
        assert!(staging.as_slice().is_empty());
        assert_eq!(staging.as_debug_info().name(), "StagingRegion");
    }

    #[test]
    #[should_panic]
    fn alignment_not_power_of_two() {
        StagingRegion::new(8, 3);
    }
}
