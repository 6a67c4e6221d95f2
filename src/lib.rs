//! Accelerator queue-context resource core for NexaOS
//!
//! This crate implements the device-independent resource-management core of
//! the accelerator character driver: hardware queue contexts (isolated
//! execution lanes with dedicated DRAM chunks, page tables and interrupt
//! lines) handed out to multiple unprivileged processes, plus an "overseer"
//! supervisory mode that partitions one physical device into subcontainer
//! sub-devices with their own resource quotas.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  Control requests (ioctl)                │
//! └───────────────┬──────────────────────────────────────────┘
//!                 │ permission check (role: plain/sub/overseer)
//! ┌───────────────┴──────────────────────────────────────────┐
//! │  queue ctx state machine   │  overseer / subcontainers   │
//! │  direct mappings           │  per-process open tracking  │
//! └───────┬──────────┬─────────┴──────────┬──────────────────┘
//!         │          │                    │
//! ┌───────┴───┐ ┌────┴──────┐      ┌──────┴───────┐
//! │ DRAM chunk│ │ RID filter│      │ BarIo /      │
//! │ handshake │ │ table     │      │ Platform     │
//! └───────────┘ └───────────┘      └──────────────┘
//! ```
//!
//! The hardware access path (`BarIo`), page tables, address-space unmapping,
//! process termination and PCI config access are collaborator traits in
//! [`framework`]; one [`device::VariantOps`] implementation exists per
//! hardware variant (the in-tree [`sim`] variant models virtual hardware).
//!
//! # Locking
//!
//! Locks nest in one global order; no path acquires them against it:
//!
//! 1. subcontainer set (serializes overseer mode transitions)
//! 2. device state (client table, mode, reservation bookkeeping)
//! 3. per-queue context state
//! 4. DRAM pool (chunk map; shared with the parent device by clones, so
//!    DRAM reconfiguration is serialized across a whole container family)
//! 5. per-queue direct-mapping list
//! 6. RID filter table (shared with the parent by clones)
//!
//! Ledger counters read outside their guarding lock are atomics.

#![no_std]

extern crate alloc;

pub mod attrs;
pub mod clients;
pub mod device;
pub mod error;
pub mod framework;
pub mod ioctl;
pub mod logger;
pub mod mapping;
pub mod overseer;
pub mod queue;
pub mod regs;
pub mod rid_filter;
pub mod shared_buf;
pub mod sim;

pub use error::{AccelError, Result};

/// Maximum length of a queue context name.
pub const QUEUE_NAME_MAX: usize = 64;

/// DRAM chunk granularity: allocations, mappings and windows are multiples
/// of this.
pub const DRAM_CHUNK_BYTES: u64 = 2 << 20;

/// Upper bound on queue contexts per device; sizes the per-process
/// enabled-queue bitmaps.
pub const MAX_QUEUE_CTXS: usize = 128;

/// Number of subcontainer clone devices created when entering overseer mode.
pub const MAX_SUBCONTAINERS: usize = 2;

/// BAR slots a device descriptor may reference.
pub const NUM_BARS: usize = 6;

/// Firmware API version this core speaks. Device enable fails on mismatch.
pub const DRIVER_FIRMWARE_API_VERSION: u64 = 1;

// =============================================================================
// Log macros
// =============================================================================
// Leveled logging over the `logger` module. Call sites prefix messages with
// their subsystem ("ACCEL/Queue:", "ACCEL/Overseer:", ...).

#[macro_export]
macro_rules! alog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::logger::log($level, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! aerror {
    ($($arg:tt)*) => {{
        $crate::alog!($crate::logger::LogLevel::ERROR, $($arg)*);
    }};
}

#[macro_export]
macro_rules! awarn {
    ($($arg:tt)*) => {{
        $crate::alog!($crate::logger::LogLevel::WARN, $($arg)*);
    }};
}

#[macro_export]
macro_rules! ainfo {
    ($($arg:tt)*) => {{
        $crate::alog!($crate::logger::LogLevel::INFO, $($arg)*);
    }};
}

#[macro_export]
macro_rules! adebug {
    ($($arg:tt)*) => {{
        $crate::alog!($crate::logger::LogLevel::DEBUG, $($arg)*);
    }};
}

#[macro_export]
macro_rules! atrace {
    ($($arg:tt)*) => {{
        $crate::alog!($crate::logger::LogLevel::TRACE, $($arg)*);
    }};
}
