//! Car status transition table.
//!
//! Any status may additionally transition to `blocked`, and `blocked`
//! recovers to `open` or `ready`. Everything else follows the table in
//! `allowed_from`.

use crate::error::RailyardError;
use crate::models::CarStatus;

/// Targets reachable from `from`, excluding the universal `-> blocked` edge.
pub fn allowed_from(from: CarStatus) -> &'static [CarStatus] {
    use CarStatus::*;
    match from {
        Open => &[Ready, Cancelled],
        Ready => &[Claimed],
        Claimed => &[InProgress],
        InProgress => &[Done],
        Done => &[Merged, MergeFailed],
        MergeFailed => &[InProgress, Cancelled],
        Blocked => &[Open, Ready],
        Cancelled => &[],
        Merged => &[],
    }
}

pub fn is_allowed(from: CarStatus, to: CarStatus) -> bool {
    if to == CarStatus::Blocked {
        return from != CarStatus::Blocked;
    }
    allowed_from(from).contains(&to)
}

/// Full allowed set from `from`, for error reporting.
pub fn allowed_set(from: CarStatus) -> Vec<CarStatus> {
    let mut set: Vec<CarStatus> = allowed_from(from).to_vec();
    if from != CarStatus::Blocked {
        set.push(CarStatus::Blocked);
    }
    set
}

pub fn validate(car: &str, from: CarStatus, to: CarStatus) -> Result<(), RailyardError> {
    if is_allowed(from, to) {
        return Ok(());
    }
    Err(RailyardError::Transition {
        car: car.to_string(),
        from: from.as_str().to_string(),
        to: to.as_str().to_string(),
        allowed: allowed_set(from)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect(),
    })
}
