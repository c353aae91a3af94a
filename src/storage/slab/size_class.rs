//! Size class management for slab allocator

use crate::error::{Error, Result};

/// Quantized value-size buckets
///
/// Classes are multiples of `step`: with a 16-byte step a 5-byte value lands
/// in the 16-byte class and a 200-byte value in the 208-byte class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClasses {
    step: usize,
    max_value_size: usize,
    count: usize,
}

impl SizeClasses {
    /// Create classes covering `1..=max_value_size` in `step`-byte increments
    pub fn new(step: usize, max_value_size: usize) -> Self {
        let count = max_value_size.max(1).div_ceil(step);
        Self {
            step,
            max_value_size,
            count,
        }
    }

    /// Number of classes
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn max_value_size(&self) -> usize {
        self.max_value_size
    }

    /// Index of the smallest class that fits `size` bytes
    ///
    /// Empty values still occupy the smallest class.
    pub fn index_for(&self, size: usize) -> Result<usize> {
        if size > self.max_value_size {
            return Err(Error::InvalidArgument(format!(
                "value of {} bytes exceeds maximum of {} bytes",
                size, self.max_value_size
            )));
        }
        Ok(size.max(1).div_ceil(self.step) - 1)
    }

    /// Slot size of class `index`
    pub fn slot_size(&self, index: usize) -> usize {
        (index + 1) * self.step
    }

    /// Index of the class whose slots are exactly `slot_size` bytes
    pub fn index_of_slot_size(&self, slot_size: usize) -> Option<usize> {
        (slot_size > 0 && slot_size % self.step == 0 && slot_size / self.step <= self.count)
            .then(|| slot_size / self.step - 1)
    }

    /// Check if a value of `size` bytes fits a slot of `slot_size` bytes
    pub fn can_fit(&self, size: usize, slot_size: usize) -> bool {
        size.max(1) <= slot_size
    }
}

/// List every slot size: [16, 32, 48, ...] up to the class holding `max_value_size`
pub fn calculate_size_classes(step: usize, max_value_size: usize) -> Vec<usize> {
    let classes = SizeClasses::new(step, max_value_size);
    (0..classes.count()).map(|i| classes.slot_size(i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_for_rounds_up() -> Result<()> {
        let classes = SizeClasses::new(16, 1024);
        assert_eq!(classes.index_for(0)?, 0);
        assert_eq!(classes.index_for(1)?, 0);
        assert_eq!(classes.index_for(16)?, 0);
        assert_eq!(classes.index_for(17)?, 1);
        assert_eq!(classes.index_for(200)?, 12);
        assert_eq!(classes.slot_size(12), 208);
        assert_eq!(classes.index_for(1024)?, 63);
        Ok(())
    }

    #[test]
    fn test_rejects_oversized_values() {
        let classes = SizeClasses::new(16, 100);
        assert!(matches!(classes.index_for(101), Err(Error::InvalidArgument(_))));
        // The last class is rounded up to a whole step
        assert_eq!(classes.count(), 7);
        assert_eq!(classes.slot_size(6), 112);
    }

    #[test]
    fn test_calculate_size_classes() {
        let sizes = calculate_size_classes(16, 100);
        assert_eq!(sizes, vec![16, 32, 48, 64, 80, 96, 112]);
        for pair in sizes.windows(2) {
            assert_eq!(pair[1] - pair[0], 16);
        }
    }

    #[test]
    fn test_can_fit_and_lookup() {
        let classes = SizeClasses::new(16, 1024);
        assert!(classes.can_fit(128, 128));
        assert!(!classes.can_fit(129, 128));
        assert!(classes.can_fit(0, 16));
        assert_eq!(classes.index_of_slot_size(128), Some(7));
        assert_eq!(classes.index_of_slot_size(100), None);
        assert_eq!(classes.index_of_slot_size(2048), None);
    }
}
