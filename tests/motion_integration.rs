//! End-to-end motion tests against the in-memory board simulator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use softmotor::axis::AxisModel;
use softmotor::board::axis_driver::AxisDriver;
use softmotor::board::params::axis_param;
use softmotor::board::sim::{SimBoard, SimCommand};
use softmotor::board::{AxisStatus, BoardDriver, BoardModel};
use softmotor::motion::MotionController;
use softmotor::pv::{MotorFields, OffsetFreeze, PvHandle, SetUse, Spmg, UserDirection};
use softmotor::supervisor::board::{BoardInitializer, BoardSupervisor};
use softmotor::supervisor::{AxisState, AxisSupervisor};

fn test_model() -> AxisModel {
    let mut model = AxisModel::default();
    model.set_conversion(1000.0).unwrap();
    model.set_backlash(2.0).unwrap();
    model.set_backlash_direction(1).unwrap();
    model.set_user_limits(-50.0, 250.0).unwrap();
    model.set_update_interval_moving(0.005).unwrap();
    model.set_update_interval_idle(0.005).unwrap();
    model
}

struct Rig {
    sim: Arc<SimBoard>,
    motion: MotionController,
    pv: PvHandle,
    model: AxisModel,
}

fn rig() -> Rig {
    let sim = Arc::new(SimBoard::new(1));
    let driver = AxisDriver::new(Arc::clone(&sim) as Arc<dyn BoardDriver>, 0);
    let model = test_model();
    let pv = PvHandle::new(MotorFields::from_model(&model));
    Rig {
        sim,
        motion: MotionController::new(driver),
        pv,
        model,
    }
}

fn move_targets(log: &[SimCommand]) -> Vec<i64> {
    log.iter()
        .filter_map(|cmd| match cmd {
            SimCommand::MoveTo { target, .. } => Some(*target),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn forward_move_overshoots_then_corrects() {
    let mut r = rig();

    r.motion
        .kickoff_move(&mut r.model, 10.0, true, &r.pv)
        .await
        .unwrap();
    r.motion
        .await_move_completion(&mut r.model, &r.pv)
        .await
        .unwrap();
    r.motion
        .apply_backlash_if_needed(&mut r.model, 10.0, &r.pv)
        .await
        .unwrap();

    assert_eq!(move_targets(&r.sim.command_log().await), vec![12_000, 10_000]);
    assert_eq!(r.sim.actual_position(0).await.unwrap(), 10_000);
    assert!(!r.model.is_move_interrupted);
    assert!((r.model.actual_coordinate_rbv - 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn opposing_move_needs_no_backlash_leg() {
    let mut r = rig();
    // park the axis above the target first
    r.motion
        .kickoff_move(&mut r.model, 10.0, true, &r.pv)
        .await
        .unwrap();
    r.motion
        .await_move_completion(&mut r.model, &r.pv)
        .await
        .unwrap();
    r.motion
        .apply_backlash_if_needed(&mut r.model, 10.0, &r.pv)
        .await
        .unwrap();
    r.sim.clear_command_log().await;

    r.motion
        .kickoff_move(&mut r.model, 4.0, true, &r.pv)
        .await
        .unwrap();
    r.motion
        .await_move_completion(&mut r.model, &r.pv)
        .await
        .unwrap();
    r.motion
        .apply_backlash_if_needed(&mut r.model, 4.0, &r.pv)
        .await
        .unwrap();

    // approach opposes the backlash direction: one command, no overshoot
    assert_eq!(move_targets(&r.sim.command_log().await), vec![4_000]);
    assert_eq!(r.sim.actual_position(0).await.unwrap(), 4_000);
}

#[tokio::test]
async fn out_of_limit_target_is_never_commanded() {
    let mut r = rig();
    // backlash pushes 249.5 to 251.5, past the 250.0 limit
    r.motion
        .kickoff_move(&mut r.model, 249.5, true, &r.pv)
        .await
        .unwrap();

    assert!(r.model.is_move_interrupted);
    assert!(move_targets(&r.sim.command_log().await).is_empty());
    assert_eq!(r.sim.actual_position(0).await.unwrap(), 0);
}

#[tokio::test]
async fn stop_request_preempts_a_pending_move() {
    let mut r = rig();
    r.pv.update(|f| f.stop = true).await;

    r.motion
        .kickoff_move(&mut r.model, 10.0, true, &r.pv)
        .await
        .unwrap();

    assert!(r.model.is_move_interrupted);
    assert!(move_targets(&r.sim.command_log().await).is_empty());
}

#[tokio::test]
async fn mid_move_stop_halts_before_any_backlash_leg() {
    let mut r = rig();
    r.motion
        .kickoff_move(&mut r.model, 10.0, true, &r.pv)
        .await
        .unwrap();
    r.pv.update(|f| f.stop = true).await;

    r.motion
        .await_move_completion(&mut r.model, &r.pv)
        .await
        .unwrap();
    r.motion
        .apply_backlash_if_needed(&mut r.model, 10.0, &r.pv)
        .await
        .unwrap();

    assert!(r.model.is_move_interrupted);
    let log = r.sim.command_log().await;
    // the device stop goes out and no corrective move follows it
    assert_eq!(move_targets(&log), vec![12_000]);
    let stop_at = log
        .iter()
        .position(|c| matches!(c, SimCommand::Stop { .. }))
        .unwrap();
    assert_eq!(stop_at, log.len() - 1);
}

#[tokio::test]
async fn spmg_stop_blocks_motion_like_the_stop_flag() {
    let mut r = rig();
    r.pv.update(|f| f.spmg = Spmg::Stop).await;

    r.motion
        .kickoff_move(&mut r.model, 10.0, true, &r.pv)
        .await
        .unwrap();

    assert!(r.model.is_move_interrupted);
    assert!(move_targets(&r.sim.command_log().await).is_empty());
}

#[tokio::test]
async fn homing_measures_travel_and_centers() {
    let mut r = rig();
    r.sim.set_end_switch_distance(0, 200_000).await.unwrap();

    r.motion
        .home_and_set_limits(&mut r.model, &r.pv)
        .await
        .unwrap();

    assert!(r.model.is_homed_rbv);
    assert!((r.model.stage_motion_limit - 200.0).abs() < 1e-9);
    // configured limits (-50, 250) cannot fit the 200 mm stage
    assert_eq!(r.model.negative_user_limit(), 0.0);
    assert_eq!(r.model.positive_user_limit(), 200.0);
    assert_eq!(r.sim.actual_position(0).await.unwrap(), 100_000);
    assert!((r.model.actual_coordinate_rbv - 100.0).abs() < 1e-9);
}

#[tokio::test]
async fn interrupted_homing_leaves_axis_unhomed() {
    let mut r = rig();
    r.pv.update(|f| f.stop = true).await;

    r.motion
        .home_and_set_limits(&mut r.model, &r.pv)
        .await
        .unwrap();

    assert!(!r.model.is_homed_rbv);
    let log = r.sim.command_log().await;
    assert!(!log.iter().any(|c| matches!(c, SimCommand::Home { .. })));
}

fn supervisor_rig() -> (Arc<SimBoard>, AxisSupervisor, PvHandle) {
    let sim = Arc::new(SimBoard::new(1));
    let driver_arc = Arc::clone(&sim) as Arc<dyn BoardDriver>;
    let model = test_model();
    let pv = PvHandle::new(MotorFields::from_model(&model));
    let board_init = Arc::new(BoardInitializer::new(
        Arc::clone(&driver_arc),
        HashMap::from([(77u16, 1i64)]),
    ));
    let supervisor = AxisSupervisor::new(
        model,
        MotionController::new(AxisDriver::new(driver_arc, 0)),
        pv.clone(),
        board_init,
    );
    (sim, supervisor, pv)
}

#[tokio::test]
async fn quiet_poll_cycles_issue_no_commands() {
    let (sim, mut supervisor, _pv) = supervisor_rig();
    supervisor.startup().await.unwrap();
    sim.clear_command_log().await;

    supervisor.idle_cycle().await.unwrap();
    supervisor.idle_cycle().await.unwrap();

    assert!(sim.command_log().await.is_empty());
}

#[tokio::test]
async fn external_demand_value_drives_a_move() {
    let (sim, mut supervisor, pv) = supervisor_rig();
    supervisor.startup().await.unwrap();
    sim.clear_command_log().await;

    pv.update(|f| f.value = 5.0).await;
    supervisor.idle_cycle().await.unwrap();

    assert_eq!(move_targets(&sim.command_log().await), vec![7_000, 5_000]);
    assert_eq!(sim.actual_position(0).await.unwrap(), 5_000);
    assert_eq!(supervisor.state(), AxisState::Idle);
    let fields = pv.read().await;
    assert!((fields.readback - 5.0).abs() < 1e-9);
    assert!(fields.done_moving);

    // same demand again: already satisfied, nothing new goes out
    sim.clear_command_log().await;
    supervisor.idle_cycle().await.unwrap();
    assert!(sim.command_log().await.is_empty());
}

#[tokio::test]
async fn relative_move_targets_current_position_plus_delta() {
    let (sim, mut supervisor, pv) = supervisor_rig();
    supervisor.startup().await.unwrap();
    sim.clear_command_log().await;

    pv.update(|f| f.relative_value = 3.0).await;
    supervisor.idle_cycle().await.unwrap();

    assert_eq!(move_targets(&sim.command_log().await), vec![5_000, 3_000]);
    assert_eq!(pv.read().await.relative_value, 0.0);
}

#[tokio::test]
async fn paused_demand_fires_once_spmg_allows() {
    let (sim, mut supervisor, pv) = supervisor_rig();
    supervisor.startup().await.unwrap();
    sim.clear_command_log().await;

    pv.update(|f| {
        f.spmg = Spmg::Pause;
        f.value = 5.0;
    })
    .await;
    supervisor.idle_cycle().await.unwrap();
    assert!(move_targets(&sim.command_log().await).is_empty());

    pv.update(|f| f.spmg = Spmg::Go).await;
    supervisor.idle_cycle().await.unwrap();
    assert_eq!(move_targets(&sim.command_log().await), vec![7_000, 5_000]);
}

#[tokio::test]
async fn set_mode_value_write_slides_coordinates_without_motion() {
    let (sim, mut supervisor, pv) = supervisor_rig();
    supervisor.startup().await.unwrap();
    sim.clear_command_log().await;

    pv.update(|f| {
        f.set_use = SetUse::Set;
        f.value = 5.0;
    })
    .await;
    supervisor.idle_cycle().await.unwrap();

    // raw position untouched, the user coordinate system slid instead
    assert!(move_targets(&sim.command_log().await).is_empty());
    assert_eq!(sim.actual_position(0).await.unwrap(), 0);
    assert_eq!(supervisor.model().user_offset, 5.0);
    let fields = pv.read().await;
    assert!((fields.value - 5.0).abs() < 1e-9);
    assert!((fields.readback - 5.0).abs() < 1e-9);
    assert!((fields.offset - 5.0).abs() < 1e-9);

    // leaving SET mode keeps everything where it is
    pv.update(|f| f.set_use = SetUse::Use).await;
    sim.clear_command_log().await;
    supervisor.idle_cycle().await.unwrap();
    assert!(sim.command_log().await.is_empty());
}

#[tokio::test]
async fn homing_request_runs_the_full_sequence() {
    let (sim, mut supervisor, pv) = supervisor_rig();
    supervisor.startup().await.unwrap();
    sim.clear_command_log().await;

    pv.update(|f| f.home_forward = true).await;
    supervisor.idle_cycle().await.unwrap();

    let log = sim.command_log().await;
    assert!(log.iter().any(|c| matches!(c, SimCommand::Home { axis: 0 })));
    let fields = pv.read().await;
    assert!(fields.homed);
    assert!(!fields.home_forward);
    assert_eq!(fields.user_low_limit, 0.0);
    assert_eq!(fields.user_high_limit, 200.0);
}

#[tokio::test]
async fn backlash_legs_run_at_the_backlash_velocity() {
    let (sim, mut supervisor, pv) = supervisor_rig();
    supervisor.startup().await.unwrap();
    sim.clear_command_log().await;

    pv.update(|f| {
        f.backlash_velocity = 2.0;
        f.value = 5.0;
    })
    .await;
    supervisor.idle_cycle().await.unwrap();

    assert_eq!(supervisor.model().backlash_velocity(), 2.0);
    let log = sim.command_log().await;
    let first = log
        .iter()
        .position(|c| matches!(c, SimCommand::MoveTo { target: 7_000, .. }))
        .unwrap();
    let second = log
        .iter()
        .position(|c| matches!(c, SimCommand::MoveTo { target: 5_000, .. }))
        .unwrap();
    // slow down for the corrective leg, restore the profile afterwards
    let slow = log
        .iter()
        .position(|c| {
            matches!(
                c,
                SimCommand::SetAxisParameter {
                    key: axis_param::MAX_VELOCITY,
                    value: 2_000,
                    ..
                }
            )
        })
        .unwrap();
    let restore = log
        .iter()
        .rposition(|c| {
            matches!(
                c,
                SimCommand::SetAxisParameter {
                    key: axis_param::MAX_VELOCITY,
                    value: 10_000,
                    ..
                }
            )
        })
        .unwrap();
    assert!(first < slow && slow < second && second < restore);
}

#[tokio::test]
async fn direction_flip_revalidates_limits_against_the_stage() {
    let (sim, mut supervisor, pv) = supervisor_rig();
    supervisor.startup().await.unwrap();

    pv.update(|f| f.home_forward = true).await;
    supervisor.idle_cycle().await.unwrap();
    assert_eq!(supervisor.model().negative_user_limit(), 0.0);
    assert_eq!(supervisor.model().positive_user_limit(), 200.0);
    sim.clear_command_log().await;

    pv.update(|f| f.direction = UserDirection::Neg).await;
    supervisor.idle_cycle().await.unwrap();

    // the old limits' dial images fell outside [0, stage]; clamped
    let model = supervisor.model();
    assert_eq!(model.negative_user_limit(), -200.0);
    assert_eq!(model.positive_user_limit(), 0.0);
    let a = model.user_to_dial(model.negative_user_limit());
    let b = model.user_to_dial(model.positive_user_limit());
    assert!(a.min(b) >= 0.0 && a.max(b) <= model.stage_motion_limit);
    assert!(move_targets(&sim.command_log().await).is_empty());
}

#[tokio::test]
async fn fixed_offset_calibration_rewrites_the_position_register() {
    let (sim, mut supervisor, pv) = supervisor_rig();
    supervisor.startup().await.unwrap();
    sim.clear_command_log().await;

    pv.update(|f| {
        f.set_use = SetUse::Set;
        f.offset_freeze = OffsetFreeze::Fixed;
        f.value = 5.0;
    })
    .await;
    supervisor.idle_cycle().await.unwrap();

    // the motor is told it is physically elsewhere; the offset stays put
    assert!(move_targets(&sim.command_log().await).is_empty());
    assert_eq!(sim.actual_position(0).await.unwrap(), 5_000);
    assert_eq!(supervisor.model().user_offset, 0.0);
    let fields = pv.read().await;
    assert!((fields.value - 5.0).abs() < 1e-9);
    assert!((fields.readback - 5.0).abs() < 1e-9);
}

struct FlakyBoard {
    inner: Arc<SimBoard>,
    fail_global_writes: AtomicBool,
}

#[async_trait::async_trait]
impl BoardDriver for FlakyBoard {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn move_to(&self, axis: u8, raw_target: i64) -> anyhow::Result<()> {
        self.inner.move_to(axis, raw_target).await
    }

    async fn stop(&self, axis: u8) -> anyhow::Result<()> {
        self.inner.stop(axis).await
    }

    async fn stop_all(&self) -> anyhow::Result<()> {
        self.inner.stop_all().await
    }

    async fn home(&self, axis: u8) -> anyhow::Result<()> {
        self.inner.home(axis).await
    }

    async fn get_axis_parameter(&self, axis: u8, key: u16) -> anyhow::Result<i64> {
        self.inner.get_axis_parameter(axis, key).await
    }

    async fn set_axis_parameter(&self, axis: u8, key: u16, value: i64) -> anyhow::Result<()> {
        self.inner.set_axis_parameter(axis, key, value).await
    }

    async fn get_global_parameter(&self, key: u16) -> anyhow::Result<i64> {
        self.inner.get_global_parameter(key).await
    }

    async fn set_global_parameter(&self, key: u16, value: i64) -> anyhow::Result<()> {
        if self.fail_global_writes.load(Ordering::SeqCst) {
            anyhow::bail!("transport dropped");
        }
        self.inner.set_global_parameter(key, value).await
    }

    async fn read_axis_status(&self, axis: u8) -> anyhow::Result<AxisStatus> {
        self.inner.read_axis_status(axis).await
    }
}

#[tokio::test]
async fn reinit_is_retried_after_a_failed_recovery_push() {
    let sim = Arc::new(SimBoard::new(1));
    let flaky = Arc::new(FlakyBoard {
        inner: Arc::clone(&sim),
        fail_global_writes: AtomicBool::new(false),
    });
    let driver_arc = Arc::clone(&flaky) as Arc<dyn BoardDriver>;
    let mut model = test_model();
    model.configurable_parameters.insert(200, 42);
    let pv = PvHandle::new(MotorFields::from_model(&model));
    let board_init = Arc::new(BoardInitializer::new(
        Arc::clone(&driver_arc),
        HashMap::from([(77u16, 1i64)]),
    ));
    let mut supervisor = AxisSupervisor::new(
        model,
        MotionController::new(AxisDriver::new(driver_arc, 0)),
        pv.clone(),
        board_init,
    );
    supervisor.startup().await.unwrap();
    supervisor.idle_cycle().await.unwrap();
    supervisor.idle_cycle().await.unwrap();

    sim.simulate_power_cycle().await;
    flaky.fail_global_writes.store(true, Ordering::SeqCst);
    assert!(supervisor.idle_cycle().await.is_err());

    // the tick counter advances normally again, but the evidence of the
    // reset must survive until the push actually succeeds
    sim.clear_command_log().await;
    flaky.fail_global_writes.store(false, Ordering::SeqCst);
    supervisor.idle_cycle().await.unwrap();

    let log = sim.command_log().await;
    assert!(log.contains(&SimCommand::SetGlobalParameter { key: 77, value: 1 }));
    assert!(log.contains(&SimCommand::SetAxisParameter {
        axis: 0,
        key: 200,
        value: 42
    }));
    assert_eq!(sim.global_parameter(77).await, Some(1));

    // once re-initialized, later cycles stay quiet
    sim.clear_command_log().await;
    supervisor.idle_cycle().await.unwrap();
    assert!(sim.command_log().await.is_empty());
}

#[tokio::test]
async fn power_cycle_reapplies_board_and_axis_configuration() {
    let sim = Arc::new(SimBoard::new(1));
    let driver_arc = Arc::clone(&sim) as Arc<dyn BoardDriver>;
    let mut model = test_model();
    model.configurable_parameters.insert(200, 42);
    let pv = PvHandle::new(MotorFields::from_model(&model));
    let board_init = Arc::new(BoardInitializer::new(
        Arc::clone(&driver_arc),
        HashMap::from([(77u16, 1i64)]),
    ));
    let mut supervisor = AxisSupervisor::new(
        model,
        MotionController::new(AxisDriver::new(driver_arc, 0)),
        pv.clone(),
        board_init,
    );
    supervisor.startup().await.unwrap();

    // establish a healthy tick history first
    supervisor.idle_cycle().await.unwrap();
    supervisor.idle_cycle().await.unwrap();
    sim.clear_command_log().await;

    sim.simulate_power_cycle().await;
    supervisor.idle_cycle().await.unwrap();

    let log = sim.command_log().await;
    assert!(log.contains(&SimCommand::SetGlobalParameter { key: 77, value: 1 }));
    assert!(log.contains(&SimCommand::SetAxisParameter {
        axis: 0,
        key: 200,
        value: 42
    }));
    assert!(log.iter().any(|c| matches!(
        c,
        SimCommand::SetAxisParameter {
            key: axis_param::MAX_VELOCITY,
            ..
        }
    )));
    assert_eq!(sim.global_parameter(77).await, Some(1));
    assert_eq!(sim.axis_parameter(0, 200).await.unwrap(), Some(42));
}

#[tokio::test]
async fn board_supervisor_runs_axes_end_to_end() {
    let sim = Arc::new(SimBoard::new(1));
    let board_model = BoardModel {
        module_address: 1,
        host: "sim".to_string(),
        port: 4001,
        configurable_parameters: HashMap::from([(77u16, 1i64)]),
        axes: vec![test_model()],
    };
    let mut board = BoardSupervisor::new(Arc::clone(&sim) as Arc<dyn BoardDriver>, board_model);
    board.initialize().await.unwrap();
    let axes = board.spawn_axes();
    assert_eq!(axes.len(), 1);

    // let the axis task finish its startup pass before writing a demand
    tokio::time::sleep(Duration::from_millis(50)).await;
    axes[0].pv.update(|f| f.value = 5.0).await;
    let mut settled = false;
    for _ in 0..400 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if sim.actual_position(0).await.unwrap() == 5_000 {
            settled = true;
            break;
        }
    }
    assert!(settled, "axis never reached the demanded position");

    board.shutdown().await.unwrap();
    for axis in axes {
        axis.handle.await.unwrap();
    }
    assert!(sim
        .command_log()
        .await
        .contains(&SimCommand::StopAll));
}
