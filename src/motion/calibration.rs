//! SET-mode coordinate remapping: while an axis is in calibration mode,
//! position writes recalibrate the user/dial/raw mapping instead of
//! commanding motion. The changed field is found by diffing the PV
//! snapshot against the model in a fixed priority order; the offset-freeze
//! switch picks between sliding the coordinate system (variable offset)
//! and rewriting the device's position register (fixed offset).

use anyhow::Result;
use tracing::{info, warn};

use crate::axis::AxisModel;
use crate::board::axis_driver::AxisDriver;
use crate::pv::{MotorFields, OffsetFreeze};

/// Relative tolerance for spotting an externally-edited field.
const FIELD_RTOL: f64 = 1e-5;
/// Absolute tolerance for raw-step comparisons.
const RAW_ATOL: f64 = 1.5;

/// Priority order for the snapshot diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationField {
    Value,
    RelativeValue,
    DialValue,
    RawValue,
    Offset,
}

/// What a calibration write should do to the model and the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationPlan {
    /// Variable offset: slide offset, limits, and readbacks by `delta`;
    /// the device's raw position is untouched.
    SlideCoordinates { delta: f64 },
    /// Variable offset with a dial/raw edit: keep the user value fixed by
    /// moving the offset, then rewrite the device's position register to
    /// match.
    RebaseRaw { offset_delta: f64 },
    /// Fixed offset: tell the device it is physically elsewhere.
    WriteActualPosition { user_delta: f64 },
    /// Fixed offset with a raw edit: nudge the raw register directly.
    NudgeRawRegister { raw_delta: i64 },
}

fn differs(delta: f64, reference: f64, atol: f64) -> bool {
    delta.abs() > atol + FIELD_RTOL * reference.abs()
}

/// Diff the PV snapshot against the model in priority order: value,
/// relative value, dial value, raw value, offset. The first mismatch wins.
pub fn find_mismatched_field(
    model: &AxisModel,
    fields: &MotorFields,
) -> Option<(CalibrationField, f64)> {
    let delta = fields.value - model.actual_coordinate_rbv;
    if differs(delta, model.actual_coordinate_rbv, 1e-9) {
        return Some((CalibrationField::Value, delta));
    }

    if differs(fields.relative_value, 0.0, 1e-9) {
        return Some((CalibrationField::RelativeValue, fields.relative_value));
    }

    let dial_actual = model.user_to_dial(model.actual_coordinate_rbv);
    let delta = fields.dial_value - dial_actual;
    if differs(delta, dial_actual, 1e-9) {
        return Some((CalibrationField::DialValue, delta));
    }

    let raw_actual = model.user_to_raw(model.actual_coordinate_rbv);
    let delta = (fields.raw_value - raw_actual) as f64;
    if differs(delta, 0.0, RAW_ATOL) {
        return Some((CalibrationField::RawValue, delta));
    }

    let delta = fields.offset - model.user_offset;
    if differs(delta, model.user_offset, 1e-9) {
        return Some((CalibrationField::Offset, delta));
    }

    None
}

/// Turn a calibration-mode snapshot into a plan. `None` means nothing
/// differs (reported, not fatal) or the combination is unsupported.
pub fn plan(model: &AxisModel, fields: &MotorFields) -> Option<CalibrationPlan> {
    let (field, delta) = match find_mismatched_field(model, fields) {
        Some(hit) => hit,
        None => {
            warn!(
                axis = model.axis_number,
                "calibration requested but no field differs from the model"
            );
            return None;
        }
    };
    info!(
        axis = model.axis_number,
        ?field,
        delta,
        freeze = ?fields.offset_freeze,
        "calibration change requested"
    );

    let direction = model.direction();
    match fields.offset_freeze {
        OffsetFreeze::Variable => match field {
            CalibrationField::Value | CalibrationField::RelativeValue | CalibrationField::Offset => {
                Some(CalibrationPlan::SlideCoordinates { delta })
            }
            CalibrationField::DialValue => Some(CalibrationPlan::RebaseRaw {
                offset_delta: -direction * delta,
            }),
            CalibrationField::RawValue => Some(CalibrationPlan::RebaseRaw {
                offset_delta: -direction * (delta / model.conversion()),
            }),
        },
        OffsetFreeze::Fixed => match field {
            CalibrationField::Value | CalibrationField::RelativeValue => {
                Some(CalibrationPlan::WriteActualPosition { user_delta: delta })
            }
            CalibrationField::DialValue => Some(CalibrationPlan::WriteActualPosition {
                user_delta: direction * delta,
            }),
            CalibrationField::RawValue => Some(CalibrationPlan::NudgeRawRegister {
                raw_delta: delta.round() as i64,
            }),
            CalibrationField::Offset => {
                warn!(
                    axis = model.axis_number,
                    "offset edits with a fixed offset are not supported"
                );
                None
            }
        },
    }
}

/// Apply a calibration plan to the model and, where required, the device,
/// then refresh the model so readbacks reflect the new mapping.
pub async fn apply(
    driver: &AxisDriver,
    model: &mut AxisModel,
    plan: CalibrationPlan,
) -> Result<()> {
    match plan {
        CalibrationPlan::SlideCoordinates { delta } => {
            model.shift_user_coordinates(delta, true);
            info!(
                axis = model.axis_number,
                offset = model.user_offset,
                "coordinate system slid under the motor"
            );
        }
        CalibrationPlan::RebaseRaw { offset_delta } => {
            model.user_offset += offset_delta;
            let raw = model.user_to_raw(model.actual_coordinate_rbv);
            driver.set_actual_position_raw(raw).await?;
        }
        CalibrationPlan::WriteActualPosition { user_delta } => {
            let raw = model.user_to_raw(model.actual_coordinate_rbv + user_delta);
            driver.set_actual_position_raw(raw).await?;
        }
        CalibrationPlan::NudgeRawRegister { raw_delta } => {
            let raw = model.user_to_raw(model.actual_coordinate_rbv) + raw_delta;
            driver.set_actual_position_raw(raw).await?;
        }
    }
    driver.refresh(model).await?;
    Ok(())
}
