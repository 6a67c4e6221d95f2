//! Typed register-field descriptors.
//!
//! Hardware variants differ only in where their fields live and how they are
//! packed. A [`RegisterField`] captures one field: a location (fixed, or
//! computed per queue/window index) plus a shift and mask. The handshake and
//! response-evaluation algorithms stay generic over these descriptors instead
//! of hand-inlining shifts.

use crate::framework::BarIo;

/// Where a field's backing register lives.
#[derive(Clone, Copy)]
pub enum FieldLocation {
    /// One global register.
    Fixed(u64),
    /// One register per index (queue slot, filter window, ...).
    PerIndex(fn(usize) -> u64),
}

/// One register field: location, bit position and mask.
/// A zero mask means "the whole register".
#[derive(Clone, Copy)]
pub struct RegisterField {
    pub location: FieldLocation,
    pub shift: u32,
    pub mask: u64,
}

impl RegisterField {
    pub const fn fixed(offset: u64, shift: u32, mask: u64) -> Self {
        RegisterField {
            location: FieldLocation::Fixed(offset),
            shift,
            mask,
        }
    }

    pub const fn per_index(get: fn(usize) -> u64, shift: u32, mask: u64) -> Self {
        RegisterField {
            location: FieldLocation::PerIndex(get),
            shift,
            mask,
        }
    }

    /// Byte offset of this field's register for `index`. Fields at a fixed
    /// location only accept index 0.
    pub fn offset(&self, index: usize) -> u64 {
        match self.location {
            FieldLocation::Fixed(offset) => {
                debug_assert!(index == 0, "indexed access to a fixed register");
                offset
            }
            FieldLocation::PerIndex(get) => get(index),
        }
    }
}

/// Read and decode one field.
pub fn read_field(io: &dyn BarIo, bar: usize, field: &RegisterField, index: usize) -> u64 {
    let value = io.read_64(bar, field.offset(index));
    if field.mask != 0 {
        (value & field.mask) >> field.shift
    } else {
        value
    }
}

/// Encode and write one field. Masked fields read-modify-write their
/// register; whole-register fields overwrite it.
pub fn write_field(io: &dyn BarIo, bar: usize, field: &RegisterField, index: usize, value: u64) {
    let offset = field.offset(index);
    let raw = if field.mask != 0 {
        let current = io.read_64(bar, offset);
        (current & !field.mask) | ((value << field.shift) & field.mask)
    } else {
        value
    };
    io.write_64(bar, offset, raw);
}

/// Read-modify-write `width_bits` of a register at an arbitrary shift.
/// Used for packed per-priority configuration lanes.
pub fn read_modify_write(
    io: &dyn BarIo,
    bar: usize,
    offset: u64,
    value: u64,
    width_bits: u32,
    shift: u32,
) {
    let mask = if width_bits >= 64 {
        u64::MAX
    } else {
        ((1u64 << width_bits) - 1) << shift
    };
    let current = io.read_64(bar, offset);
    io.write_64(bar, offset, (current & !mask) | ((value << shift) & mask));
}
