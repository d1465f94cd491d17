//! Channel negotiation and logical-to-physical slot mapping.
//!
//! Negotiation runs once at open time. It first decides which physical
//! channels to request, then, after the driver grants the slots, resolves
//! each logical channel to a granted slot by the STAMPED physical channel
//! number. Grants are not trusted to preserve request order.

use crate::device::{Direction, GrantedSlot};
use crate::error::{Error, Result};

/// A caller's request for one direction.
#[derive(Debug, Clone, Default)]
pub struct ChannelRequest {
    pub channels: usize,
    /// Explicit physical channel numbers, one per logical channel, in order.
    pub selectors: Option<Vec<u32>>,
}

impl ChannelRequest {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            selectors: None,
        }
    }

    pub fn with_selectors(selectors: Vec<u32>) -> Self {
        Self {
            channels: selectors.len(),
            selectors: Some(selectors),
        }
    }
}

/// The physical channels to submit for one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedPlan {
    /// Physical channel numbers in slot-request order.
    pub channels: Vec<u32>,
    /// Leading slots allocated only to pin the audible range; they are kept
    /// silent and receive no processor data.
    pub silent: usize,
}

impl NegotiatedPlan {
    pub fn audible(&self) -> &[u32] {
        &self.channels[self.silent..]
    }
}

/// Compute the slot request for one direction.
///
/// Explicit selectors are validated and used verbatim. Otherwise outputs may
/// be routed through a contiguous-offset policy: request `[0, offset + n)`
/// with the first `offset` designated silent, so the audible channels land
/// on `[offset, offset + n)` whether or not the driver honors stamped
/// channel numbers. The offset is dropped when the device is too small for
/// it, never clamped into range.
pub fn negotiate(
    direction: Direction,
    request: &ChannelRequest,
    device_channels: usize,
    output_offset: usize,
) -> Result<NegotiatedPlan> {
    if request.channels == 0 || request.channels > device_channels {
        return Err(Error::InvalidChannelCount {
            direction,
            requested: request.channels,
            available: device_channels,
        });
    }

    if let Some(selectors) = &request.selectors {
        if selectors.len() != request.channels {
            return Err(Error::InvalidChannelCount {
                direction,
                requested: selectors.len(),
                available: device_channels,
            });
        }
        for &selector in selectors {
            if selector as usize >= device_channels {
                return Err(Error::InvalidChannelSelector {
                    direction,
                    selector,
                    available: device_channels,
                });
            }
        }
        return Ok(NegotiatedPlan {
            channels: selectors.clone(),
            silent: 0,
        });
    }

    let offset = match direction {
        Direction::Output => output_offset,
        Direction::Input => 0,
    };
    let fits = offset
        .checked_add(request.channels)
        .is_some_and(|total| total <= device_channels);
    if offset > 0 && fits {
        Ok(NegotiatedPlan {
            channels: (0..(offset + request.channels) as u32).collect(),
            silent: offset,
        })
    } else {
        Ok(NegotiatedPlan {
            channels: (0..request.channels as u32).collect(),
            silent: 0,
        })
    }
}

/// Resolve requested physical channels against the granted slots.
///
/// Every requested channel must find a granted slot of the same direction
/// whose stamped channel number matches; the returned vector holds slot
/// indices in logical-channel order. Matching is never positional unless the
/// caller explicitly enables the fallback, which restores the legacy
/// behavior for drivers known to misstamp their grants.
pub fn build_channel_map(
    direction: Direction,
    requested: &[u32],
    slots: &[GrantedSlot],
    positional_fallback: bool,
) -> Result<Vec<usize>> {
    let mut map = Vec::with_capacity(requested.len());
    for (logical, &channel) in requested.iter().enumerate() {
        let found = slots
            .iter()
            .position(|slot| slot.direction == direction && slot.channel == channel);
        match found {
            Some(index) => map.push(index),
            None if positional_fallback => {
                let index = slots
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| slot.direction == direction)
                    .map(|(index, _)| index)
                    .nth(logical)
                    .ok_or(Error::ChannelMapMismatch { direction, channel })?;
                tracing::warn!(
                    "no {direction} slot stamped {channel}; positional fallback to slot {index}"
                );
                map.push(index);
            }
            None => return Err(Error::ChannelMapMismatch { direction, channel }),
        }
    }
    Ok(map)
}
