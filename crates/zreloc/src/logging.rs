//! Relocation Event Logging
//!
//! Structured events for relocation set selection and the relocation phase,
//! useful for:
//! - Tuning the fragmentation limit
//! - Debugging stalls and in-place relocation
//!
//! Diagnostics inside the engine go through the `log` facade. Events are
//! emitted in addition when `RelocationConfig::verbose` is set.
//!
//! Log Levels:
//! - WARN: Mutator stalls
//! - INFO: Selection results, phase start and end
//! - DEBUG: Per-page relocation, in-place fallbacks

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Log level for relocation events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

/// Relocation event types
#[derive(Debug, Clone)]
pub enum RelocEvent {
    /// Relocation set selected
    SelectionComplete {
        small_selected: usize,
        medium_selected: usize,
        relocating_bytes: usize,
        fragmentation_bytes: usize,
    },

    /// Relocation phase started
    RelocationStart { pages: usize, workers: usize },

    /// A page was evacuated
    PageRelocated {
        page: usize,
        objects: usize,
        bytes: usize,
        in_place: bool,
    },

    /// No target memory; a page is compacted into itself
    InPlaceFallback { page: usize, watermark: usize },

    /// A mutator waited for a worker
    MutatorStall { page: usize },

    /// Relocation phase completed
    RelocationEnd {
        pages: usize,
        bytes: usize,
        duration_ms: f64,
    },
}

/// Relocation logger configuration
#[derive(Debug, Clone)]
pub struct RelocLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Enable console output
    pub console: bool,

    /// Enable JSON format
    pub json: bool,

    /// Enable timestamps
    pub timestamps: bool,
}

impl Default for RelocLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: false,
            json: false,
            timestamps: true,
        }
    }
}

/// Relocation logger - collects events and optionally prints them
pub struct RelocLogger {
    config: RelocLoggerConfig,
    events: Mutex<Vec<(Instant, RelocEvent)>>,
    enabled: AtomicBool,
}

impl RelocLogger {
    pub fn new(config: RelocLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log a relocation event
    pub fn log(&self, event: RelocEvent) {
        if !self.is_enabled() {
            return;
        }

        if Self::event_level(&event) > self.config.level {
            return;
        }

        if self.config.console {
            self.output_console(&event);
        }

        self.events.lock().push((Instant::now(), event));
    }

    fn event_level(event: &RelocEvent) -> LogLevel {
        match event {
            RelocEvent::MutatorStall { .. } => LogLevel::Warn,
            RelocEvent::SelectionComplete { .. }
            | RelocEvent::RelocationStart { .. }
            | RelocEvent::RelocationEnd { .. } => LogLevel::Info,
            RelocEvent::PageRelocated { .. } | RelocEvent::InPlaceFallback { .. } => {
                LogLevel::Debug
            },
        }
    }

    fn output_console(&self, event: &RelocEvent) {
        let prefix = if self.config.timestamps {
            format!("[{}] ", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        } else {
            String::new()
        };

        if self.config.json {
            if let Ok(json) = serde_json::to_string(&Self::to_json(event)) {
                println!("{}{}", prefix, json);
            }
        } else {
            println!("{}{}", prefix, Self::to_human(event));
        }
    }

    fn to_human(event: &RelocEvent) -> String {
        match event {
            RelocEvent::SelectionComplete {
                small_selected,
                medium_selected,
                relocating_bytes,
                fragmentation_bytes,
            } => format!(
                "[Reloc] Selected {} medium, {} small pages ({} bytes relocating, {} bytes fragmentation)",
                medium_selected, small_selected, relocating_bytes, fragmentation_bytes
            ),
            RelocEvent::RelocationStart { pages, workers } => {
                format!("[Reloc] Relocating {} pages with {} workers", pages, workers)
            },
            RelocEvent::PageRelocated {
                page,
                objects,
                bytes,
                in_place,
            } => format!(
                "[Reloc] Page {:#x}: {} objects, {} bytes{}",
                page,
                objects,
                bytes,
                if *in_place { " (in-place)" } else { "" }
            ),
            RelocEvent::InPlaceFallback { page, watermark } => format!(
                "[Reloc] Page {:#x}: in-place relocation from {:#x}",
                page, watermark
            ),
            RelocEvent::MutatorStall { page } => {
                format!("[Reloc] Mutator stalled on page {:#x}", page)
            },
            RelocEvent::RelocationEnd {
                pages,
                bytes,
                duration_ms,
            } => format!(
                "[Reloc] Relocated {} pages ({} bytes) in {:.2}ms",
                pages, bytes, duration_ms
            ),
        }
    }

    fn to_json(event: &RelocEvent) -> serde_json::Value {
        match event {
            RelocEvent::SelectionComplete {
                small_selected,
                medium_selected,
                relocating_bytes,
                fragmentation_bytes,
            } => serde_json::json!({
                "type": "selection_complete",
                "small_selected": small_selected,
                "medium_selected": medium_selected,
                "relocating_bytes": relocating_bytes,
                "fragmentation_bytes": fragmentation_bytes
            }),
            RelocEvent::RelocationStart { pages, workers } => serde_json::json!({
                "type": "relocation_start",
                "pages": pages,
                "workers": workers
            }),
            RelocEvent::PageRelocated {
                page,
                objects,
                bytes,
                in_place,
            } => serde_json::json!({
                "type": "page_relocated",
                "page": page,
                "objects": objects,
                "bytes": bytes,
                "in_place": in_place
            }),
            RelocEvent::InPlaceFallback { page, watermark } => serde_json::json!({
                "type": "in_place_fallback",
                "page": page,
                "watermark": watermark
            }),
            RelocEvent::MutatorStall { page } => serde_json::json!({
                "type": "mutator_stall",
                "page": page
            }),
            RelocEvent::RelocationEnd {
                pages,
                bytes,
                duration_ms,
            } => serde_json::json!({
                "type": "relocation_end",
                "pages": pages,
                "bytes": bytes,
                "duration_ms": duration_ms
            }),
        }
    }

    pub fn events(&self) -> Vec<(Instant, RelocEvent)> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }
}

impl Default for RelocLogger {
    fn default() -> Self {
        Self::new(RelocLoggerConfig::default())
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_LOGGER: Mutex<RelocLogger> = Mutex::new(RelocLogger::default());
}

/// Log an event to the global logger
pub fn log_event(event: RelocEvent) {
    GLOBAL_LOGGER.lock().log(event);
}

/// Replace the global logger configuration
pub fn configure_logger(config: RelocLoggerConfig) {
    *GLOBAL_LOGGER.lock() = RelocLogger::new(config);
}

/// Number of events held by the global logger
pub fn get_event_count() -> usize {
    GLOBAL_LOGGER.lock().event_count()
}
