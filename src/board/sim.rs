//! In-memory board used by the integration tests and the demo daemon.
//! Moves complete after a fixed number of status polls; state-changing
//! calls are recorded so tests can assert exact command sequences.

use std::collections::HashMap;

use anyhow::{bail, Result};
use tokio::sync::RwLock;

use super::params::{axis_param, global_param};
use super::{AxisStatus, BoardDriver};

/// Every state-changing call the simulator has received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCommand {
    MoveTo { axis: u8, target: i64 },
    Stop { axis: u8 },
    StopAll,
    Home { axis: u8 },
    SetAxisParameter { axis: u8, key: u16, value: i64 },
    SetGlobalParameter { key: u16, value: i64 },
}

#[derive(Debug, Clone)]
struct SimAxis {
    actual: i64,
    target: i64,
    moving_polls: u8,
    homing: bool,
    end_switch_distance: i64,
    left_switch: bool,
    right_switch: bool,
    parameters: HashMap<u16, i64>,
}

impl Default for SimAxis {
    fn default() -> Self {
        Self {
            actual: 0,
            target: 0,
            moving_polls: 0,
            homing: false,
            end_switch_distance: 200_000,
            left_switch: false,
            right_switch: false,
            parameters: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct SimState {
    axes: Vec<SimAxis>,
    globals: HashMap<u16, i64>,
    tick: i64,
    log: Vec<SimCommand>,
}

impl SimState {
    fn axis(&self, axis: u8) -> Result<&SimAxis> {
        match self.axes.get(axis as usize) {
            Some(ax) => Ok(ax),
            None => bail!("axis {} out of range, board has {} axes", axis, self.axes.len()),
        }
    }

    fn axis_mut(&mut self, axis: u8) -> Result<&mut SimAxis> {
        let count = self.axes.len();
        match self.axes.get_mut(axis as usize) {
            Some(ax) => Ok(ax),
            None => bail!("axis {} out of range, board has {} axes", axis, count),
        }
    }
}

pub struct SimBoard {
    state: RwLock<SimState>,
    /// Status polls a commanded move reports "moving" before it lands.
    settle_polls: u8,
}

impl SimBoard {
    pub fn new(axis_count: usize) -> Self {
        Self {
            state: RwLock::new(SimState {
                axes: vec![SimAxis::default(); axis_count],
                globals: HashMap::new(),
                tick: 0,
                log: Vec::new(),
            }),
            settle_polls: 2,
        }
    }

    pub async fn command_log(&self) -> Vec<SimCommand> {
        self.state.read().await.log.clone()
    }

    pub async fn clear_command_log(&self) {
        self.state.write().await.log.clear();
    }

    pub async fn actual_position(&self, axis: u8) -> Result<i64> {
        Ok(self.state.read().await.axis(axis)?.actual)
    }

    pub async fn axis_parameter(&self, axis: u8, key: u16) -> Result<Option<i64>> {
        Ok(self
            .state
            .read()
            .await
            .axis(axis)?
            .parameters
            .get(&key)
            .copied())
    }

    pub async fn global_parameter(&self, key: u16) -> Option<i64> {
        self.state.read().await.globals.get(&key).copied()
    }

    pub async fn set_end_switch_distance(&self, axis: u8, steps: i64) -> Result<()> {
        self.state.write().await.axis_mut(axis)?.end_switch_distance = steps;
        Ok(())
    }

    pub async fn set_limit_switches(&self, axis: u8, left: bool, right: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let ax = state.axis_mut(axis)?;
        ax.left_switch = left;
        ax.right_switch = right;
        Ok(())
    }

    /// Wipe volatile board state as a real power cycle would: tick timer
    /// restarts, configured parameters and positions are lost.
    pub async fn simulate_power_cycle(&self) {
        let mut state = self.state.write().await;
        state.tick = 0;
        state.globals.clear();
        for ax in &mut state.axes {
            ax.parameters.clear();
            ax.actual = 0;
            ax.target = 0;
            ax.moving_polls = 0;
            ax.homing = false;
        }
    }
}

#[async_trait::async_trait]
impl BoardDriver for SimBoard {
    fn name(&self) -> &str {
        "sim"
    }

    async fn move_to(&self, axis: u8, raw_target: i64) -> Result<()> {
        let settle = self.settle_polls;
        let mut state = self.state.write().await;
        state.log.push(SimCommand::MoveTo { axis, target: raw_target });
        let ax = state.axis_mut(axis)?;
        ax.target = raw_target;
        ax.moving_polls = settle;
        Ok(())
    }

    async fn stop(&self, axis: u8) -> Result<()> {
        let mut state = self.state.write().await;
        state.log.push(SimCommand::Stop { axis });
        let ax = state.axis_mut(axis)?;
        ax.moving_polls = 0;
        ax.homing = false;
        ax.target = ax.actual;
        Ok(())
    }

    async fn stop_all(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.log.push(SimCommand::StopAll);
        for ax in &mut state.axes {
            ax.moving_polls = 0;
            ax.homing = false;
            ax.target = ax.actual;
        }
        Ok(())
    }

    async fn home(&self, axis: u8) -> Result<()> {
        let settle = self.settle_polls;
        let mut state = self.state.write().await;
        state.log.push(SimCommand::Home { axis });
        let ax = state.axis_mut(axis)?;
        ax.homing = true;
        ax.target = 0;
        ax.moving_polls = settle;
        Ok(())
    }

    async fn get_axis_parameter(&self, axis: u8, key: u16) -> Result<i64> {
        let mut state = self.state.write().await;
        let ax = state.axis_mut(axis)?;
        let value = match key {
            axis_param::TARGET_POSITION => ax.target,
            axis_param::ACTUAL_POSITION => ax.actual,
            axis_param::ACTUAL_VELOCITY => i64::from(ax.moving_polls > 0),
            axis_param::POSITION_REACHED_FLAG => {
                i64::from(ax.moving_polls == 0 && ax.actual == ax.target)
            }
            _ => ax.parameters.get(&key).copied().unwrap_or(0),
        };
        Ok(value)
    }

    async fn set_axis_parameter(&self, axis: u8, key: u16, value: i64) -> Result<()> {
        let mut state = self.state.write().await;
        state.log.push(SimCommand::SetAxisParameter { axis, key, value });
        let ax = state.axis_mut(axis)?;
        if key == axis_param::ACTUAL_POSITION {
            // position register rewrite: the motor does not move
            ax.actual = value;
            ax.target = value;
        } else {
            ax.parameters.insert(key, value);
        }
        Ok(())
    }

    async fn get_global_parameter(&self, key: u16) -> Result<i64> {
        let mut state = self.state.write().await;
        if key == global_param::TICK_TIMER {
            state.tick += 7;
            return Ok(state.tick);
        }
        Ok(state.globals.get(&key).copied().unwrap_or(0))
    }

    async fn set_global_parameter(&self, key: u16, value: i64) -> Result<()> {
        let mut state = self.state.write().await;
        state.log.push(SimCommand::SetGlobalParameter { key, value });
        state.globals.insert(key, value);
        Ok(())
    }

    async fn read_axis_status(&self, axis: u8) -> Result<AxisStatus> {
        let mut state = self.state.write().await;
        let ax = state.axis_mut(axis)?;
        if ax.moving_polls > 0 {
            ax.moving_polls -= 1;
            if ax.moving_polls == 0 {
                ax.actual = ax.target;
                if ax.homing {
                    ax.actual = 0;
                    ax.target = 0;
                    ax.homing = false;
                    let distance = ax.end_switch_distance;
                    ax.parameters
                        .insert(axis_param::RIGHT_LIMIT_SWITCH_POSITION, distance);
                }
            }
        }
        Ok(AxisStatus {
            actual_raw: ax.actual,
            target_raw: ax.target,
            velocity_nonzero: ax.moving_polls > 0,
            position_reached: ax.moving_polls == 0 && ax.actual == ax.target,
            left_switch: ax.left_switch,
            right_switch: ax.right_switch,
        })
    }
}
