pub mod calibration;

use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::axis::AxisModel;
use crate::board::axis_driver::AxisDriver;
use crate::pv::{self, PvHandle, Spmg};

/// Raw-step tolerance when comparing positions; covers integer rounding.
pub const RAW_TOLERANCE: f64 = 1.5;

/// Stateless motion algorithms for one axis: coordinate-aware move
/// sequencing, backlash, homing. The supervisor owns the model and calls
/// in here; this type owns only the device façade.
pub struct MotionController {
    driver: AxisDriver,
}

impl MotionController {
    pub fn new(driver: AxisDriver) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &AxisDriver {
        &self.driver
    }

    /// Raise the interrupt flag when the PV layer asks us to stop.
    pub async fn check_for_move_interrupt(&self, model: &mut AxisModel, pv: &PvHandle) {
        let fields = pv.read().await;
        if fields.stop || fields.spmg == Spmg::Stop {
            error!(
                axis = model.axis_number,
                stop = fields.stop,
                spmg = ?fields.spmg,
                "motion interrupted by stop request"
            );
            model.is_move_interrupted = true;
        }
    }

    /// Overshoot the target when approaching along the backlash direction,
    /// so the final leg always comes from the same side.
    pub fn backlash_adjusted_target(model: &AxisModel, target_user: f64) -> f64 {
        let approach = target_user - model.actual_coordinate_rbv;
        if f64::from(model.backlash_direction()) * approach > 0.0 {
            target_user + model.backlash() * f64::from(model.backlash_direction())
        } else {
            target_user
        }
    }

    pub fn target_outside_limits(model: &AxisModel, target_user: f64) -> bool {
        !model.within_user_limits(target_user)
    }

    /// Within `RAW_TOLERANCE` steps of the target, after a fresh poll.
    pub async fn are_we_there_yet(&self, model: &mut AxisModel, target_user: f64) -> Result<bool> {
        self.driver.refresh(model).await?;
        let target_raw = model.user_to_raw(target_user);
        Ok(((target_raw - model.actual_raw_rbv) as f64).abs() <= RAW_TOLERANCE)
    }

    /// Issue a move toward `target_user`, backlash-adjusted when asked.
    /// The final (post-backlash) target must lie within the user limits;
    /// a violation raises the interrupt flag and issues nothing. Returns
    /// without commanding when the interrupt flag is already set.
    pub async fn kickoff_move(
        &self,
        model: &mut AxisModel,
        target_user: f64,
        include_backlash: bool,
        pv: &PvHandle,
    ) -> Result<()> {
        self.driver.refresh(model).await?;
        let adjusted = if include_backlash {
            Self::backlash_adjusted_target(model, target_user)
        } else {
            target_user
        };
        if Self::target_outside_limits(model, adjusted) {
            error!(
                axis = model.axis_number,
                target_user,
                adjusted,
                low = model.negative_user_limit(),
                high = model.positive_user_limit(),
                backlash = model.backlash(),
                "target outside the user motion limits"
            );
            model.is_move_interrupted = true;
        }
        // advisory checks, not safety checks
        if !model.is_homed_rbv {
            warn!(axis = model.axis_number, "axis should ideally be homed before moving");
        }
        if model.is_moving_rbv {
            error!(axis = model.axis_number, "axis should ideally be stopped before moving");
        }
        self.check_for_move_interrupt(model, pv).await;
        if model.is_move_interrupted {
            error!(axis = model.axis_number, "move not issued, interrupt flag is set");
            return Ok(());
        }
        model.target_coordinate = target_user;
        let raw_target = model.user_to_raw(adjusted);
        self.driver.move_raw(raw_target).await
    }

    /// Poll at the moving cadence until two consecutive "not moving"
    /// samples (one noisy sample is not trusted). An interrupt showing up
    /// mid-move stops the axis immediately before anything else happens.
    pub async fn await_move_completion(&self, model: &mut AxisModel, pv: &PvHandle) -> Result<()> {
        let mut settled = 0u8;
        while settled < 2 {
            tokio::time::sleep(Duration::from_secs_f64(model.update_interval_moving())).await;
            self.driver.refresh(model).await?;
            self.check_for_move_interrupt(model, pv).await;
            if model.is_moving_rbv && model.limit_switches.any_active() {
                error!(
                    axis = model.axis_number,
                    switches = ?model.limit_switches,
                    "limit switch asserted mid-move"
                );
                model.is_move_interrupted = true;
            }
            if model.is_move_interrupted {
                self.driver.stop().await?;
                return Ok(());
            }
            if model.is_moving_rbv {
                settled = 0;
            } else {
                settled += 1;
            }
            pv::publish_readbacks(pv, model).await;
        }
        Ok(())
    }

    /// After the primary move has landed, run corrective legs (without
    /// further backlash) until the target is reached or we get stopped.
    /// Legs run at the backlash velocity; the normal profile is restored
    /// once done.
    pub async fn apply_backlash_if_needed(
        &self,
        model: &mut AxisModel,
        target_user: f64,
        pv: &PvHandle,
    ) -> Result<()> {
        let mut slowed = false;
        while !self.are_we_there_yet(model, target_user).await? && !model.is_move_interrupted {
            info!(axis = model.axis_number, target_user, "running backlash leg");
            if !slowed && model.backlash_velocity() != model.velocity() {
                self.driver
                    .push_max_velocity(model.backlash_velocity_raw())
                    .await?;
                slowed = true;
            }
            self.kickoff_move(model, target_user, false, pv).await?;
            self.await_move_completion(model, pv).await?;
        }
        if slowed {
            self.driver.push_motion_profile(model).await?;
        }
        Ok(())
    }

    /// Reference search, travel measurement, limit re-validation, and a
    /// centering move. Any interruption exits early with the axis left
    /// un-homed; the sequence must then be restarted from scratch.
    pub async fn home_and_set_limits(&self, model: &mut AxisModel, pv: &PvHandle) -> Result<()> {
        model.is_homed_rbv = false;
        model.is_move_interrupted = false;
        self.check_for_move_interrupt(model, pv).await;
        if model.is_move_interrupted {
            info!(axis = model.axis_number, "homing aborted before start");
            return Ok(());
        }

        info!(axis = model.axis_number, "homing axis");
        self.driver.home().await?;
        self.await_move_completion(model, pv).await?;
        if model.is_move_interrupted {
            info!(axis = model.axis_number, "homing interrupted");
            return Ok(());
        }

        let range_steps = self.driver.end_switch_distance().await?;
        let range = model.raw_to_dial(range_steps);
        model.stage_motion_limit = range;
        let (low, high) = (model.negative_user_limit(), model.positive_user_limit());
        if let Err(e) = model.set_user_limits(low, high) {
            let (new_low, new_high) = model.clamp_user_limits_to_stage();
            warn!(
                axis = model.axis_number,
                error = %e,
                new_low,
                new_high,
                "user limits clamped to the measured travel"
            );
        }

        info!(axis = model.axis_number, range, "stage travel measured, centering");
        self.driver.move_raw(range_steps / 2).await?;
        self.await_move_completion(model, pv).await?;
        if model.is_move_interrupted {
            info!(axis = model.axis_number, "homing interrupted during centering");
            return Ok(());
        }

        model.is_homed_rbv = true;
        info!(axis = model.axis_number, "homing complete");
        Ok(())
    }
}
