pub mod board;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::axis::AxisModel;
use crate::board::axis_driver::TickWatch;
use crate::motion::{calibration, MotionController};
use crate::pv::{self, MotorFields, PvHandle, SetUse, Spmg, UserDirection};
use board::BoardInitializer;

/// Motion state of the supervisor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisState {
    Idle,
    Moving,
    Backlashing,
}

/// Long-running control loop for one axis: keeps the PV record, the
/// `AxisModel`, and the physical device mutually consistent. Owns its
/// model exclusively; everything it does is strictly sequential.
pub struct AxisSupervisor {
    model: AxisModel,
    motion: MotionController,
    pv: PvHandle,
    board_init: Arc<BoardInitializer>,
    last_pv: MotorFields,
    ticks: TickWatch,
    state: AxisState,
    reinit_pending: bool,
}

impl AxisSupervisor {
    pub fn new(
        model: AxisModel,
        motion: MotionController,
        pv: PvHandle,
        board_init: Arc<BoardInitializer>,
    ) -> Self {
        let last_pv = MotorFields::from_model(&model);
        Self {
            model,
            motion,
            pv,
            board_init,
            last_pv,
            ticks: TickWatch::default(),
            state: AxisState::Idle,
            reinit_pending: false,
        }
    }

    pub fn state(&self) -> AxisState {
        self.state
    }

    pub fn model(&self) -> &AxisModel {
        &self.model
    }

    /// Run until the shutdown broadcast fires. Transport errors are
    /// logged and retried on the next poll; they never kill the task.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        if let Err(e) = self.startup().await {
            warn!(axis = self.model.axis_number, error = %e, "axis startup incomplete, continuing");
        }
        loop {
            let dwell = Duration::from_secs_f64(self.model.update_interval_idle());
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(axis = self.model.axis_number, "axis supervisor shutting down");
                    if let Err(e) = self.motion.driver().stop().await {
                        warn!(axis = self.model.axis_number, error = %e, "stop on shutdown failed");
                    }
                    break;
                }
                _ = tokio::time::sleep(dwell) => {}
            }
            if let Err(e) = self.idle_cycle().await {
                warn!(axis = self.model.axis_number, error = %e, "poll cycle failed, retrying next poll");
            }
        }
    }

    /// First contact with the device: seed the PV record from reality.
    pub async fn startup(&mut self) -> Result<()> {
        self.motion.driver().refresh(&mut self.model).await?;
        pv::publish_all(&self.pv, &self.model).await;
        let actual = self.model.actual_coordinate_rbv;
        self.pv.update(|fields| fields.value = actual).await;
        self.last_pv = self.pv.read().await;
        Ok(())
    }

    /// One Idle-state pass: poll the device, detect a power cycle,
    /// reconcile externally-changed fields, run any requested calibration,
    /// homing, or move, then publish readbacks.
    pub async fn idle_cycle(&mut self) -> Result<()> {
        self.motion.driver().refresh(&mut self.model).await?;

        if self.motion.driver().detect_power_cycle(&mut self.ticks).await? {
            error!(
                axis = self.model.axis_number,
                "board power cycle detected, re-initializing"
            );
            // the tick watch only yields this evidence once, so latch it
            // until re-initialization actually goes through
            self.reinit_pending = true;
        }
        if self.reinit_pending {
            self.board_init.reapply().await?;
            self.motion.driver().initialize(&self.model).await?;
            self.reinit_pending = false;
        }

        let snap = self.pv.read().await;

        if snap.stop {
            // momentary flag: stop, acknowledge, clear
            self.motion.driver().stop().await?;
            self.pv.update(|fields| fields.stop = false).await;
        }

        let mut deferred_target = false;
        if snap.set_use == SetUse::Set {
            self.calibrate(&snap).await?;
        } else {
            self.reconcile(&snap).await?;
            deferred_target = self.dispatch_motion(&snap).await?;
        }

        pv::publish_all(&self.pv, &self.model).await;
        self.refresh_snapshot(deferred_target).await;
        Ok(())
    }

    /// Handle homing triggers and new move targets. Returns true when a
    /// pending target was deferred (SPMG = Pause) and must stay pending.
    async fn dispatch_motion(&mut self, snap: &MotorFields) -> Result<bool> {
        if snap.home_forward || snap.home_reverse {
            self.pv
                .update(|fields| {
                    fields.home_forward = false;
                    fields.home_reverse = false;
                })
                .await;
            info!(
                axis = self.model.axis_number,
                forward = snap.home_forward,
                "homing requested"
            );
            self.motion.home_and_set_limits(&mut self.model, &self.pv).await?;
            // pin the demand to the post-homing position so the stale
            // pre-homing value does not fire as a move next cycle
            let actual = self.model.actual_coordinate_rbv;
            self.pv.update(|fields| fields.value = actual).await;
            return Ok(false);
        }

        let target = match self.pending_target(snap) {
            Some(target) => target,
            None => return Ok(false),
        };
        match snap.spmg {
            Spmg::Stop => {
                debug!(axis = self.model.axis_number, target, "target dropped, SPMG is Stop");
                self.pv.update(|fields| fields.relative_value = 0.0).await;
                Ok(false)
            }
            Spmg::Pause => {
                debug!(axis = self.model.axis_number, target, "target deferred, SPMG is Pause");
                Ok(true)
            }
            Spmg::Move | Spmg::Go => {
                if snap.stop {
                    debug!(axis = self.model.axis_number, "target ignored, stop is asserted");
                    return Ok(false);
                }
                self.model.is_move_interrupted = false;
                self.execute_move(target).await?;
                Ok(false)
            }
        }
    }

    fn pending_target(&self, snap: &MotorFields) -> Option<f64> {
        if snap.relative_value != 0.0 {
            return Some(self.model.actual_coordinate_rbv + snap.relative_value);
        }
        if value_changed(snap.value, self.last_pv.value) {
            return Some(snap.value);
        }
        None
    }

    /// Full move sequence: Idle -> Moving -> (Backlashing ->)* Idle.
    async fn execute_move(&mut self, target_user: f64) -> Result<()> {
        info!(axis = self.model.axis_number, target_user, "move requested");
        self.pv
            .update(|fields| {
                fields.value = target_user;
                fields.relative_value = 0.0;
            })
            .await;

        self.state = AxisState::Moving;
        self.model.target_coordinate = target_user;
        pv::publish_move_target(&self.pv, &self.model).await;

        self.motion
            .kickoff_move(&mut self.model, target_user, true, &self.pv)
            .await?;
        if !self.model.is_move_interrupted {
            self.motion.await_move_completion(&mut self.model, &self.pv).await?;
        }
        if !self.model.is_move_interrupted {
            self.state = AxisState::Backlashing;
            self.motion
                .apply_backlash_if_needed(&mut self.model, target_user, &self.pv)
                .await?;
        }
        if self.model.is_move_interrupted {
            warn!(axis = self.model.axis_number, target_user, "move ended interrupted");
        }

        self.state = AxisState::Idle;
        pv::publish_readbacks(&self.pv, &self.model).await;
        Ok(())
    }

    /// Pull externally-edited settable fields into the model, pushing the
    /// motion profile to the device only when it actually changed.
    async fn reconcile(&mut self, snap: &MotorFields) -> Result<()> {
        let last = &self.last_pv;
        let mut profile_changed = false;

        if value_changed(snap.velocity, last.velocity) {
            match self.model.set_velocity(snap.velocity) {
                Ok(()) => profile_changed = true,
                Err(e) => warn!(axis = self.model.axis_number, error = %e, "rejected velocity"),
            }
        }
        if value_changed(snap.acceleration_time, last.acceleration_time) {
            match self.model.set_acceleration_duration(snap.acceleration_time) {
                Ok(()) => profile_changed = true,
                Err(e) => {
                    warn!(axis = self.model.axis_number, error = %e, "rejected acceleration time")
                }
            }
        }
        if value_changed(snap.backlash_distance, last.backlash_distance) {
            if let Err(e) = self.model.set_backlash(snap.backlash_distance) {
                warn!(axis = self.model.axis_number, error = %e, "rejected backlash distance");
            }
        }
        if value_changed(snap.backlash_velocity, last.backlash_velocity) {
            if let Err(e) = self.model.set_backlash_velocity(snap.backlash_velocity) {
                warn!(axis = self.model.axis_number, error = %e, "rejected backlash velocity");
            }
        }
        let mut geometry_changed = false;
        if value_changed(snap.resolution, last.resolution) {
            match self.model.set_conversion(snap.resolution) {
                Ok(()) => {
                    profile_changed = true;
                    geometry_changed = true;
                }
                Err(e) => warn!(axis = self.model.axis_number, error = %e, "rejected resolution"),
            }
        }
        if snap.direction != last.direction {
            self.model.invert_axis_direction = snap.direction == UserDirection::Neg;
            geometry_changed = true;
            info!(axis = self.model.axis_number, direction = ?snap.direction, "direction changed");
        }
        if value_changed(snap.offset, last.offset) {
            // the PV layer maintains its own limit fields on offset writes
            let delta = snap.offset - self.model.user_offset;
            self.model.shift_user_coordinates(delta, false);
            geometry_changed = true;
            info!(
                axis = self.model.axis_number,
                offset = self.model.user_offset,
                "user offset changed"
            );
        }
        if value_changed(snap.user_low_limit, last.user_low_limit)
            || value_changed(snap.user_high_limit, last.user_high_limit)
        {
            if let Err(e) = self
                .model
                .set_user_limits(snap.user_low_limit, snap.user_high_limit)
            {
                warn!(axis = self.model.axis_number, error = %e, "rejected user limits");
            }
        }
        if geometry_changed {
            self.revalidate_limits();
        }

        if profile_changed {
            self.motion.driver().push_motion_profile(&self.model).await?;
        }
        Ok(())
    }

    /// A direction, resolution, or offset change moves the dial images of
    /// the stored user limits; re-check them against the measured travel
    /// and clamp-and-warn when they no longer fit.
    fn revalidate_limits(&mut self) {
        let (low, high) = (
            self.model.negative_user_limit(),
            self.model.positive_user_limit(),
        );
        if let Err(e) = self.model.set_user_limits(low, high) {
            let (new_low, new_high) = self.model.clamp_user_limits_to_stage();
            warn!(
                axis = self.model.axis_number,
                error = %e,
                new_low,
                new_high,
                "user limits clamped after a coordinate geometry change"
            );
        }
    }

    /// Calibration mode: remap coordinates without moving the motor, then
    /// pin the demand fields to the (possibly re-labelled) position.
    async fn calibrate(&mut self, snap: &MotorFields) -> Result<()> {
        // quiet polls while SET mode stays latched are not writes
        if calibration::find_mismatched_field(&self.model, snap).is_none() {
            return Ok(());
        }
        if let Some(plan) = calibration::plan(&self.model, snap) {
            calibration::apply(self.motion.driver(), &mut self.model, plan).await?;
        }
        let value = self.model.actual_coordinate_rbv;
        let dial = self.model.user_to_dial(value);
        let raw = self.model.user_to_raw(value);
        self.pv
            .update(|fields| {
                fields.value = value;
                fields.dial_value = dial;
                fields.raw_value = raw;
                fields.relative_value = 0.0;
            })
            .await;
        Ok(())
    }

    /// Take the post-publish snapshot the next diff will run against. A
    /// deferred target keeps its previous baseline so it fires once SPMG
    /// allows it.
    async fn refresh_snapshot(&mut self, deferred_target: bool) {
        let mut now = self.pv.read().await;
        if deferred_target {
            now.value = self.last_pv.value;
            now.relative_value = self.last_pv.relative_value;
        }
        self.last_pv = now;
    }
}

fn value_changed(new: f64, old: f64) -> bool {
    (new - old).abs() > 1e-9 * old.abs().max(1.0)
}
