use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use super::params::{axis_param, global_param};
use super::BoardDriver;
use crate::axis::{limit_switches::LimitSwitches, AxisModel};

/// Per-axis façade over the shared board driver: pulls raw board state
/// into an `AxisModel`, pushes configuration down, detects board resets.
#[derive(Clone)]
pub struct AxisDriver {
    board: Arc<dyn BoardDriver>,
    axis: u8,
}

impl AxisDriver {
    pub fn new(board: Arc<dyn BoardDriver>, axis: u8) -> Self {
        Self { board, axis }
    }

    pub fn axis_number(&self) -> u8 {
        self.axis
    }

    /// Pull the current device state into the model.
    pub async fn refresh(&self, model: &mut AxisModel) -> Result<()> {
        let status = self.board.read_axis_status(self.axis).await?;
        model.actual_raw_rbv = status.actual_raw;
        model.target_raw_rbv = status.target_raw;
        model.actual_coordinate_rbv = model.raw_to_user(status.actual_raw);
        model.is_moving_rbv = status.velocity_nonzero;
        // a moving axis has by definition not reached its position
        model.is_position_reached_rbv = status.position_reached && !status.velocity_nonzero;
        model.limit_switches = LimitSwitches::from_flags(
            status.left_switch,
            status.right_switch,
            model.invert_limit_values,
        );
        Ok(())
    }

    pub async fn move_raw(&self, raw_target: i64) -> Result<()> {
        debug!(axis = self.axis, raw_target, "issuing move");
        self.board.move_to(self.axis, raw_target).await
    }

    pub async fn stop(&self) -> Result<()> {
        debug!(axis = self.axis, "issuing stop");
        self.board.stop(self.axis).await
    }

    pub async fn home(&self) -> Result<()> {
        debug!(axis = self.axis, "starting reference search");
        self.board.home(self.axis).await
    }

    /// End-to-end travel in raw steps, valid after a reference search.
    pub async fn end_switch_distance(&self) -> Result<i64> {
        self.board
            .get_axis_parameter(self.axis, axis_param::RIGHT_LIMIT_SWITCH_POSITION)
            .await
    }

    /// Rewrite the device's actual-position register without moving.
    pub async fn set_actual_position_raw(&self, raw: i64) -> Result<()> {
        debug!(axis = self.axis, raw, "rewriting actual position register");
        self.board
            .set_axis_parameter(self.axis, axis_param::ACTUAL_POSITION, raw)
            .await
    }

    /// Push a maximum velocity to the device, raw steps per second.
    pub async fn push_max_velocity(&self, raw_velocity: f64) -> Result<()> {
        let velocity_raw = raw_velocity.round().max(1.0) as i64;
        self.board
            .set_axis_parameter(self.axis, axis_param::MAX_VELOCITY, velocity_raw)
            .await
    }

    /// Push velocity and acceleration to the device in raw units.
    pub async fn push_motion_profile(&self, model: &AxisModel) -> Result<()> {
        self.push_max_velocity(model.velocity_raw()).await?;
        let acceleration_raw = model.acceleration_raw().round().max(1.0) as i64;
        self.board
            .set_axis_parameter(self.axis, axis_param::MAX_ACCELERATION, acceleration_raw)
            .await?;
        Ok(())
    }

    /// Apply the axis configuration map verbatim, then the motion profile.
    pub async fn initialize(&self, model: &AxisModel) -> Result<()> {
        for (&key, &value) in &model.configurable_parameters {
            self.board.set_axis_parameter(self.axis, key, value).await?;
        }
        self.push_motion_profile(model).await
    }

    /// Sample the board's tick timer; true means the board restarted.
    pub async fn detect_power_cycle(&self, watch: &mut TickWatch) -> Result<bool> {
        let tick = self
            .board
            .get_global_parameter(global_param::TICK_TIMER)
            .await?;
        Ok(watch.observe(tick))
    }
}

/// Watches the board's monotonic tick counter for evidence of a power
/// cycle: a counter that runs backward restarted; one that fails to
/// advance twice in a row is treated the same, two samples rejecting a
/// single noisy read.
#[derive(Debug, Default)]
pub struct TickWatch {
    last: Option<i64>,
    stalled: u8,
}

impl TickWatch {
    pub fn observe(&mut self, tick: i64) -> bool {
        let reset = match self.last {
            Some(prev) if tick < prev => true,
            Some(prev) if tick == prev => {
                self.stalled += 1;
                self.stalled >= 2
            }
            _ => {
                self.stalled = 0;
                false
            }
        };
        if reset {
            self.stalled = 0;
        }
        self.last = Some(tick);
        reset
    }
}
