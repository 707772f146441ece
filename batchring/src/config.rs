//! Mailbox capacity configuration.

use crate::error::ConfigError;

/// Slots provisioned per logical CPU when no explicit size is given.
pub const SLOTS_PER_CPU: usize = 32;

/// Largest accepted size exponent (2^30 slots).
pub const MAX_SIZE_EXP: u32 = 30;

/// Largest accepted slot count.
pub const MAX_SLOTS: usize = 1 << MAX_SIZE_EXP;

/// Ring capacity, always a power of two.
///
/// # Example
///
/// ```
/// use batchring::Config;
///
/// assert_eq!(Config::from_exponent(4).unwrap().capacity(), 16);
/// assert_eq!(Config::with_slots(100).unwrap().capacity(), 128);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    capacity: usize,
}

impl Config {
    /// Capacity of `2^exp` slots.
    ///
    /// An exponent of zero selects [`Config::default`], sized to the
    /// machine's parallelism.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ExponentTooLarge`] above [`MAX_SIZE_EXP`].
    pub fn from_exponent(exp: u32) -> Result<Self, ConfigError> {
        if exp == 0 {
            return Ok(Self::default());
        }
        if exp > MAX_SIZE_EXP {
            return Err(ConfigError::ExponentTooLarge {
                exponent: exp,
                max: MAX_SIZE_EXP,
            });
        }
        Ok(Self { capacity: 1 << exp })
    }

    /// Capacity of at least `slots`, rounded up to a power of two.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroSlots`] for zero and
    /// [`ConfigError::TooManySlots`] above [`MAX_SLOTS`].
    pub fn with_slots(slots: usize) -> Result<Self, ConfigError> {
        if slots == 0 {
            return Err(ConfigError::ZeroSlots);
        }
        if slots > MAX_SLOTS {
            return Err(ConfigError::TooManySlots {
                slots,
                max: MAX_SLOTS,
            });
        }
        Ok(Self {
            capacity: slots.next_power_of_two(),
        })
    }

    /// Number of slots in the ring.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for Config {
    fn default() -> Self {
        let wanted = num_cpus::get().max(1) * SLOTS_PER_CPU;
        Self {
            capacity: wanted.next_power_of_two().min(MAX_SLOTS),
        }
    }
}
