//! Step-count characteristic parsing.
//!
//! The vendor step characteristic carries the day's step total as an unsigned
//! little-endian integer at a fixed offset. The byte layout is inferred from
//! observed payloads (a one-byte header followed by a 32-bit count), so it is
//! kept configurable through [`StepLayout`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{require_len, DecodeFailure, Decoded};

/// Position and width of the step counter within the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepLayout {
    /// Byte offset of the counter.
    pub offset: usize,
    /// Counter width in bytes (1 to 4).
    pub width: usize,
}

impl StepLayout {
    /// Maximum supported counter width.
    pub const MAX_WIDTH: usize = 4;

    /// Create a new layout.
    pub fn new(offset: usize, width: usize) -> Self {
        Self { offset, width }
    }

    /// Check the layout describes a decodable field.
    pub fn validate(&self) -> Result<(), DecodeFailure> {
        if self.width == 0 || self.width > Self::MAX_WIDTH {
            return Err(DecodeFailure::InvalidLayout(format!(
                "width {} not in 1..={}",
                self.width,
                Self::MAX_WIDTH
            )));
        }
        Ok(())
    }

    /// Minimum payload length for this layout.
    pub fn required_len(&self) -> usize {
        self.offset.saturating_add(self.width)
    }
}

impl Default for StepLayout {
    fn default() -> Self {
        Self {
            offset: 1,
            width: 4,
        }
    }
}

/// Decode a step-count payload using `layout`.
pub fn decode_step_count(data: &[u8], layout: &StepLayout) -> Decoded<u32> {
    match parse(data, layout) {
        Ok(steps) => Decoded::Value(steps),
        Err(failure) => {
            debug!(
                "Undecodable step payload {:02X?} with {:?}: {}",
                &data[..data.len().min(20)],
                layout,
                failure
            );
            Decoded::Undecodable(failure)
        }
    }
}

fn parse(data: &[u8], layout: &StepLayout) -> Result<u32, DecodeFailure> {
    layout.validate()?;
    require_len(data, layout.required_len())?;

    let field = &data[layout.offset..layout.offset + layout.width];
    let mut raw = [0u8; 4];
    raw[..layout.width].copy_from_slice(field);
    Ok(u32::from_le_bytes(raw))
}
