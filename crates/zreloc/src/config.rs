//! Configuration Module - Relocation Tuning Parameters
//!
//! Manages the parameters that shape relocation set selection and the
//! relocation phase. Page geometry also fixes the object size limits and the
//! object alignment used to index forwarding tables.

use crate::heap::PageType;

/// Main configuration for the relocation engine
///
/// # Examples
///
/// ```rust
/// use zreloc::RelocationConfig;
///
/// // Use default configuration
/// let config = RelocationConfig::default();
///
/// // Be more aggressive about compaction
/// let config = RelocationConfig {
///     fragmentation_limit: 10.0,
///     relocation_workers: Some(4),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct RelocationConfig {
    /// Small page size in bytes
    ///
    /// Must be a power of two between 64KB and 2MB.
    /// Default: 2MB
    pub small_page_size: usize,

    /// Medium page size in bytes
    ///
    /// Must be a power of two larger than `small_page_size`.
    /// Default: 32MB
    pub medium_page_size: usize,

    /// Fragmentation limit in percent (0.0 - 100.0)
    ///
    /// Garbage a page may hold before it becomes a relocation candidate, and
    /// the minimum relative defragmentation gain required to grow the
    /// selected set.
    ///
    /// Default: 25.0
    pub fragmentation_limit: f64,

    /// Survivor age at which pages are promoted to the old generation
    ///
    /// Pages reaching this age relocate into old pages; pages that are not
    /// selected for relocation are flip-promoted in place.
    ///
    /// Default: 4
    pub tenuring_threshold: u8,

    /// Number of relocation worker threads
    ///
    /// If None, auto-detects based on CPU cores: min(8, num_cpus / 2)
    ///
    /// Default: Auto-detect
    pub relocation_workers: Option<usize>,

    /// Enable verbose relocation logging
    ///
    /// Sends selection and relocation events to the global event logger.
    /// Default: false
    pub verbose: bool,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        RelocationConfig {
            small_page_size: 2 * MB,
            medium_page_size: 32 * MB,
            fragmentation_limit: 25.0,
            tenuring_threshold: 4,
            relocation_workers: None,
            verbose: false,
        }
    }
}

impl RelocationConfig {
    /// Validate configuration
    ///
    /// ```rust
    /// use zreloc::RelocationConfig;
    ///
    /// let config = RelocationConfig {
    ///     fragmentation_limit: 120.0,  // Invalid!
    ///     ..Default::default()
    /// };
    ///
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.small_page_size.is_power_of_two()
            || self.small_page_size < MIN_SMALL_PAGE_SIZE
            || self.small_page_size > MAX_SMALL_PAGE_SIZE
        {
            return Err(ConfigError::InvalidPageSize(format!(
                "small_page_size must be a power of two between {} and {} bytes, got {}",
                MIN_SMALL_PAGE_SIZE, MAX_SMALL_PAGE_SIZE, self.small_page_size
            )));
        }

        if !self.medium_page_size.is_power_of_two()
            || self.medium_page_size <= self.small_page_size
        {
            return Err(ConfigError::InvalidPageSize(format!(
                "medium_page_size must be a power of two larger than small_page_size, got {}",
                self.medium_page_size
            )));
        }

        if !(self.fragmentation_limit > 0.0 && self.fragmentation_limit < 100.0) {
            return Err(ConfigError::InvalidFragmentationLimit(format!(
                "fragmentation_limit must be in (0, 100), got {}",
                self.fragmentation_limit
            )));
        }

        if self.tenuring_threshold > MAX_TENURING_THRESHOLD {
            return Err(ConfigError::InvalidTenuringThreshold(format!(
                "tenuring_threshold must be <= {}, got {}",
                MAX_TENURING_THRESHOLD, self.tenuring_threshold
            )));
        }

        if let Some(workers) = self.relocation_workers {
            if workers == 0 {
                return Err(ConfigError::InvalidWorkers(
                    "relocation_workers must be > 0".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - ZRELOC_FRAGMENTATION_LIMIT
    /// - ZRELOC_WORKERS
    /// - ZRELOC_TENURING_THRESHOLD
    /// - ZRELOC_VERBOSE
    ///
    /// ```bash
    /// export ZRELOC_FRAGMENTATION_LIMIT=10
    /// export ZRELOC_WORKERS=4
    /// export ZRELOC_VERBOSE=1
    /// ```
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("ZRELOC_FRAGMENTATION_LIMIT") {
            if let Ok(limit) = val.parse::<f64>() {
                config.fragmentation_limit = limit;
            }
        }

        if let Ok(val) = std::env::var("ZRELOC_WORKERS") {
            if let Ok(workers) = val.parse::<usize>() {
                config.relocation_workers = Some(workers);
            }
        }

        if let Ok(val) = std::env::var("ZRELOC_TENURING_THRESHOLD") {
            if let Ok(threshold) = val.parse::<u8>() {
                config.tenuring_threshold = threshold;
            }
        }

        if let Ok(val) = std::env::var("ZRELOC_VERBOSE") {
            config.verbose = val == "1" || val.eq_ignore_ascii_case("true");
        }

        config
    }

    /// Resolved number of relocation workers
    pub fn worker_count(&self) -> usize {
        self.relocation_workers
            .unwrap_or_else(|| (num_cpus::get() / 2).clamp(1, 8))
    }

    /// Page size for a relocatable page type
    ///
    /// Large pages have no fixed size; `None` is returned for them.
    pub fn page_size(&self, page_type: PageType) -> Option<usize> {
        match page_type {
            PageType::Small => Some(self.small_page_size),
            PageType::Medium => Some(self.medium_page_size),
            PageType::Large => None,
        }
    }

    /// Largest object allocated in pages of this type
    ///
    /// One eighth of the page size, which bounds the waste at the end of a
    /// relocation target page.
    pub fn object_size_limit(&self, page_type: PageType) -> usize {
        match page_type {
            PageType::Small => self.small_page_size / 8,
            PageType::Medium => self.medium_page_size / 8,
            PageType::Large => usize::MAX,
        }
    }

    /// log2 of the object alignment for pages of this type
    pub fn object_alignment_shift(&self, page_type: PageType) -> u32 {
        match page_type {
            PageType::Small => SMALL_OBJECT_ALIGNMENT_SHIFT,
            PageType::Medium | PageType::Large => {
                self.medium_page_size.trailing_zeros() - MEDIUM_OBJECTS_PER_PAGE_SHIFT
            }
        }
    }

    /// Garbage bytes a page of `page_size` may hold before it is a candidate
    pub fn fragmentation_limit_bytes(&self, page_size: usize) -> usize {
        (page_size as f64 * (self.fragmentation_limit / 100.0)) as usize
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid page size: {0}")]
    InvalidPageSize(String),

    #[error("Invalid fragmentation limit: {0}")]
    InvalidFragmentationLimit(String),

    #[error("Invalid tenuring threshold: {0}")]
    InvalidTenuringThreshold(String),

    #[error("Invalid relocation workers: {0}")]
    InvalidWorkers(String),
}

// ============================================================================
// CONSTANTS
// ============================================================================

pub(crate) const KB: usize = 1024;
pub(crate) const MB: usize = 1024 * 1024;

const MIN_SMALL_PAGE_SIZE: usize = 64 * KB;

/// Small page object indices must fit the 18-bit from-index field
const MAX_SMALL_PAGE_SIZE: usize = 2 * MB;

const SMALL_OBJECT_ALIGNMENT_SHIFT: u32 = 3;

/// Medium pages hold at most 2^13 aligned objects
const MEDIUM_OBJECTS_PER_PAGE_SHIFT: u32 = 13;

/// Survivor ages are stored in four bits next to the Eden and Old markers
pub(crate) const MAX_TENURING_THRESHOLD: u8 = 14;
