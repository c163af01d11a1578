use tracing::debug;

use crate::destination::{Capacity, Destination};
use crate::error::{FatalError, Result};

/// Refuse a write of `required` bytes unless the destination can prove it has room.
///
/// Advisory only: nothing is reserved, so it holds only while this run is the sole writer.
pub fn ensure_capacity(destination: &dyn Destination, required: u64) -> Result<()> {
    let target = destination.describe();
    let capacity = destination.capacity().map_err(|e| FatalError::CapacityUnknown {
        destination: target.clone(),
        reason: e.to_string(),
    })?;

    let available = match capacity {
        Capacity::FreeSpace(Some(free)) => free,
        Capacity::FreeSpace(None) => {
            return Err(FatalError::CapacityUnknown {
                destination: target,
                reason: "no mounted disk holds the target directory".to_string(),
            })
        }
        Capacity::Quota { limit: None, .. } => {
            return Err(FatalError::CapacityUnknown {
                destination: target,
                reason: "account reports no storage limit".to_string(),
            })
        }
        Capacity::Quota {
            usage,
            limit: Some(limit),
        } => limit.saturating_sub(usage),
    };

    if available < required {
        return Err(FatalError::InsufficientSpace {
            destination: target,
            required,
            available,
        });
    }
    debug!(destination = %target, required, available, "capacity ok");
    Ok(())
}
