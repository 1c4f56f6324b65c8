//! The motor-record process-variable surface shared with the external PV
//! server: one `MotorFields` per axis behind a `PvHandle`. The supervisor
//! publishes readbacks into it and reconciles externally-written settable
//! fields back into its `AxisModel`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::axis::AxisModel;

/// Stop/Pause/Move/Go motion-enable flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Spmg {
    Stop,
    Pause,
    Move,
    #[default]
    Go,
}

/// Calibration switch: `Set` remaps coordinates, `Use` commands motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SetUse {
    Set,
    #[default]
    Use,
}

/// Whether calibration writes preserve the device's raw position
/// (`Variable`) or the user-visible offset (`Fixed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OffsetFreeze {
    #[default]
    Variable,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UserDirection {
    #[default]
    Pos,
    Neg,
}

/// Motor-record field set for one axis. Settable fields are written by the
/// external PV server; readback fields are published by the supervisor.
/// All positions and distances are in `engineering_units`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorFields {
    // demand and readback
    pub value: f64,
    pub readback: f64,
    pub dial_value: f64,
    pub dial_readback: f64,
    pub raw_value: i64,
    pub raw_readback: i64,
    pub relative_value: f64,

    // calibration and geometry
    pub offset: f64,
    pub direction: UserDirection,
    /// Steps per engineering unit.
    pub resolution: f64,
    pub engineering_units: String,

    // motion profile
    pub velocity: f64,
    pub acceleration_time: f64,
    pub backlash_distance: f64,
    pub backlash_velocity: f64,

    // soft limits
    pub user_low_limit: f64,
    pub user_high_limit: f64,
    pub dial_low_limit: f64,
    pub dial_high_limit: f64,

    // state flags
    pub moving: bool,
    pub done_moving: bool,
    pub homed: bool,
    pub stop: bool,
    pub spmg: Spmg,
    pub set_use: SetUse,
    pub offset_freeze: OffsetFreeze,
    pub home_forward: bool,
    pub home_reverse: bool,
    pub low_limit_switch: bool,
    pub high_limit_switch: bool,
}

impl Default for MotorFields {
    fn default() -> Self {
        Self {
            value: 0.0,
            readback: 0.0,
            dial_value: 0.0,
            dial_readback: 0.0,
            raw_value: 0,
            raw_readback: 0,
            relative_value: 0.0,
            offset: 0.0,
            direction: UserDirection::Pos,
            resolution: 1.0,
            engineering_units: "mm".to_string(),
            velocity: 1.0,
            acceleration_time: 1.0,
            backlash_distance: 0.0,
            backlash_velocity: 1.0,
            user_low_limit: -100.0,
            user_high_limit: 100.0,
            dial_low_limit: -100.0,
            dial_high_limit: 100.0,
            moving: false,
            done_moving: true,
            homed: false,
            stop: false,
            spmg: Spmg::Go,
            set_use: SetUse::Use,
            offset_freeze: OffsetFreeze::Variable,
            home_forward: false,
            home_reverse: false,
            low_limit_switch: false,
            high_limit_switch: false,
        }
    }
}

impl MotorFields {
    /// Seed the record from a freshly configured model, with the demand
    /// value pinned to the current position so nothing moves at startup.
    pub fn from_model(model: &AxisModel) -> Self {
        let mut fields = MotorFields {
            value: model.actual_coordinate_rbv,
            relative_value: 0.0,
            set_use: SetUse::Use,
            spmg: Spmg::Go,
            ..MotorFields::default()
        };
        copy_settables(&mut fields, model);
        copy_readbacks(&mut fields, model);
        fields.dial_value = model.user_to_dial(model.actual_coordinate_rbv);
        fields.raw_value = model.user_to_raw(model.actual_coordinate_rbv);
        fields
    }
}

/// Shared handle on one axis record; cheap to clone across tasks.
#[derive(Clone)]
pub struct PvHandle {
    inner: Arc<RwLock<MotorFields>>,
}

impl PvHandle {
    pub fn new(fields: MotorFields) -> Self {
        Self {
            inner: Arc::new(RwLock::new(fields)),
        }
    }

    pub async fn read(&self) -> MotorFields {
        self.inner.read().await.clone()
    }

    pub async fn update<F: FnOnce(&mut MotorFields)>(&self, apply: F) {
        apply(&mut *self.inner.write().await);
    }
}

fn copy_settables(fields: &mut MotorFields, model: &AxisModel) {
    fields.offset = model.user_offset;
    fields.direction = if model.invert_axis_direction {
        UserDirection::Neg
    } else {
        UserDirection::Pos
    };
    fields.resolution = model.conversion();
    fields.engineering_units = model.base_unit.clone();
    fields.velocity = model.velocity();
    fields.acceleration_time = model.acceleration_duration();
    fields.backlash_distance = model.backlash();
    fields.backlash_velocity = model.backlash_velocity();
    fields.user_low_limit = model.negative_user_limit();
    fields.user_high_limit = model.positive_user_limit();
    let a = model.user_to_dial(model.negative_user_limit());
    let b = model.user_to_dial(model.positive_user_limit());
    fields.dial_low_limit = a.min(b);
    fields.dial_high_limit = a.max(b);
}

fn copy_readbacks(fields: &mut MotorFields, model: &AxisModel) {
    fields.readback = model.actual_coordinate_rbv;
    fields.dial_readback = model.user_to_dial(model.actual_coordinate_rbv);
    fields.raw_readback = model.actual_raw_rbv;
    fields.moving = model.is_moving_rbv;
    fields.done_moving = !model.is_moving_rbv;
    fields.homed = model.is_homed_rbv;
    fields.low_limit_switch = model.limit_switches.has_lower();
    fields.high_limit_switch = model.limit_switches.has_upper();
}

/// Publish position readbacks and motion flags; called every poll tick.
pub async fn publish_readbacks(pv: &PvHandle, model: &AxisModel) {
    pv.update(|fields| copy_readbacks(fields, model)).await;
}

/// Publish the full model-derived view: settable mirrors and readbacks.
/// The demand `value` is left alone, it belongs to the PV server.
pub async fn publish_all(pv: &PvHandle, model: &AxisModel) {
    pv.update(|fields| {
        copy_settables(fields, model);
        copy_readbacks(fields, model);
    })
    .await;
}

/// Mirror an accepted move target into the desired-value fields.
pub async fn publish_move_target(pv: &PvHandle, model: &AxisModel) {
    pv.update(|fields| {
        fields.dial_value = model.user_to_dial(model.target_coordinate);
        fields.raw_value = model.user_to_raw(model.target_coordinate);
        fields.moving = true;
        fields.done_moving = false;
    })
    .await;
}
