use crate::arena::{CELL_SIZE, USABLE_CELLS};
use crate::error::ConfigError;

/// Tuning parameters of a [`Heap`](crate::Heap).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GcConfig {
    /// Percentage of the live size after a cycle at which the next cycle
    /// starts. `200` waits until the heap has doubled.
    pub pause: usize,
    /// Percentage applied to `step_size` to get the work budget of one
    /// [`Heap::step`](crate::Heap::step).
    pub step_multiplier: usize,
    /// Bytes of allocation between incremental steps.
    pub step_size: usize,
    /// Entries the store buffer holds before it is drained.
    pub store_buffer_len: usize,
    /// Objects traversed per propagate step.
    pub grey_batch: usize,
    /// String table buckets swept per step.
    pub strings_per_step: usize,
    /// Total sizes (header included) above this many bytes are allocated as
    /// huge blocks.
    pub huge_threshold: usize,
    /// Empty arenas kept for reuse instead of being released.
    pub spare_arenas: usize,
}

impl GcConfig {
    /// The largest allowed `huge_threshold`.
    pub const MAX_HUGE_THRESHOLD: usize = USABLE_CELLS as usize * CELL_SIZE;

    /// Checks that every setting is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("pause", self.pause),
            ("step_multiplier", self.step_multiplier),
            ("step_size", self.step_size),
            ("store_buffer_len", self.store_buffer_len),
            ("grey_batch", self.grey_batch),
            ("strings_per_step", self.strings_per_step),
            ("huge_threshold", self.huge_threshold),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.huge_threshold > Self::MAX_HUGE_THRESHOLD {
            return Err(ConfigError::HugeThreshold {
                threshold: self.huge_threshold,
                max: Self::MAX_HUGE_THRESHOLD,
            });
        }
        Ok(())
    }

    /// Work budget of one incremental step.
    #[must_use]
    pub fn step_budget(&self) -> usize {
        self.step_size.saturating_mul(self.step_multiplier) / 100
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            pause: 200,
            step_multiplier: 200,
            step_size: 1024,
            store_buffer_len: 128,
            grey_batch: 32,
            strings_per_step: 40,
            huge_threshold: 64 * 1024,
            spare_arenas: 1,
        }
    }
}

#[test]
fn validation() {
    assert_eq!(GcConfig::default().validate(), Ok(()));
    assert_eq!(GcConfig::default().step_budget(), 2048);
    let config = GcConfig {
        grey_batch: 0,
        ..GcConfig::default()
    };
    assert_eq!(config.validate(), Err(ConfigError::Zero("grey_batch")));
    let config = GcConfig {
        huge_threshold: GcConfig::MAX_HUGE_THRESHOLD + 16,
        ..GcConfig::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::HugeThreshold { .. })
    ));
}
