use crate::error::{Error, Result};

pub(crate) const MAXIMUM_CAPACITY: usize = 1 << 30;

/// Construction parameters for a map.
///
/// All three values only influence the size of the first table. None of
/// them is a promise about sharding: the map always locks per bin and resizes
/// at three quarters of its capacity, whatever `load_factor` says.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapConfig {
    /// Number of mappings the map should hold without resizing.
    pub initial_capacity: usize,
    /// Table density used to size the first table.
    pub load_factor: f32,
    /// Estimated number of concurrently updating threads.
    pub concurrency_level: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            initial_capacity: 0,
            load_factor: 0.75,
            concurrency_level: 1,
        }
    }
}

impl MapConfig {
    pub fn with_capacity(initial_capacity: usize) -> Self {
        MapConfig {
            initial_capacity,
            ..Default::default()
        }
    }

    pub fn load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor;
        self
    }

    pub fn concurrency_level(mut self, concurrency_level: usize) -> Self {
        self.concurrency_level = concurrency_level;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.load_factor > 0.0) || !self.load_factor.is_finite() {
            return Err(Error::InvalidConfig {
                reason: "load factor must be a positive number",
            });
        }
        if self.concurrency_level == 0 {
            return Err(Error::InvalidConfig {
                reason: "concurrency level must be at least one",
            });
        }
        Ok(())
    }

    /// Number of bins of the first table, or 0 for the default.
    pub(crate) fn table_size(&self) -> Result<usize> {
        self.validate()?;
        if self.initial_capacity == 0 && self.concurrency_level == 1 {
            return Ok(0);
        }
        // use at least as many bins as estimated threads
        let capacity = self.initial_capacity.max(self.concurrency_level);
        let size = 1.0 + capacity as f64 / f64::from(self.load_factor);
        Ok(if size >= MAXIMUM_CAPACITY as f64 {
            MAXIMUM_CAPACITY
        } else {
            table_size_for(size as usize)
        })
    }
}

/// Power of two table size for the given desired capacity.
pub(crate) fn table_size_for(c: usize) -> usize {
    if c >= MAXIMUM_CAPACITY {
        MAXIMUM_CAPACITY
    } else {
        c.max(1).next_power_of_two()
    }
}

/// Table size that holds `capacity` mappings without resizing.
pub(crate) fn table_size_for_capacity(capacity: usize) -> usize {
    if capacity >= MAXIMUM_CAPACITY >> 1 {
        MAXIMUM_CAPACITY
    } else {
        table_size_for(capacity + (capacity >> 1) + 1)
    }
}
