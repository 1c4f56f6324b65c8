use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::board::axis_driver::AxisDriver;
use crate::board::{BoardDriver, BoardModel};
use crate::motion::MotionController;
use crate::pv::{MotorFields, PvHandle};
use crate::supervisor::AxisSupervisor;

/// Writes the board-global parameter set. Shared between the board
/// supervisor (startup) and every axis loop (power-cycle recovery),
/// debounced so sibling axes noticing the same reset reapply it once.
pub struct BoardInitializer {
    driver: Arc<dyn BoardDriver>,
    globals: HashMap<u16, i64>,
    state: Mutex<ReinitState>,
}

#[derive(Default)]
struct ReinitState {
    last_applied: Option<Instant>,
    last_reset: Option<DateTime<Utc>>,
}

const REAPPLY_DEBOUNCE: Duration = Duration::from_secs(2);

impl BoardInitializer {
    pub fn new(driver: Arc<dyn BoardDriver>, globals: HashMap<u16, i64>) -> Self {
        Self {
            driver,
            globals,
            state: Mutex::new(ReinitState::default()),
        }
    }

    pub async fn apply(&self) -> Result<()> {
        for (&number, &value) in &self.globals {
            self.driver.set_global_parameter(number, value).await?;
        }
        self.state.lock().await.last_applied = Some(Instant::now());
        Ok(())
    }

    /// Re-push the globals after a detected power cycle, unless another
    /// axis already did within the debounce window. The debounce stamp is
    /// taken only after a successful push, so a failed push leaves every
    /// axis free to retry.
    pub async fn reapply(&self) -> Result<()> {
        {
            let state = self.state.lock().await;
            if let Some(applied) = state.last_applied {
                if applied.elapsed() < REAPPLY_DEBOUNCE {
                    return Ok(());
                }
            }
        }
        warn!(board = %self.driver.name(), "re-applying board globals after reset");
        for (&number, &value) in &self.globals {
            self.driver.set_global_parameter(number, value).await?;
        }
        let mut state = self.state.lock().await;
        state.last_reset = Some(Utc::now());
        state.last_applied = Some(Instant::now());
        Ok(())
    }

    pub async fn last_reset(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_reset
    }
}

/// One spawned axis loop with the handles the service needs to talk to it.
pub struct SpawnedAxis {
    pub short_id: String,
    pub pv: PvHandle,
    pub handle: JoinHandle<()>,
}

/// Owns the driver for one physical board and the supervisors of its axes.
pub struct BoardSupervisor {
    driver: Arc<dyn BoardDriver>,
    model: BoardModel,
    initializer: Arc<BoardInitializer>,
    shutdown: broadcast::Sender<()>,
}

impl BoardSupervisor {
    pub fn new(driver: Arc<dyn BoardDriver>, model: BoardModel) -> Self {
        let initializer = Arc::new(BoardInitializer::new(
            Arc::clone(&driver),
            model.configurable_parameters.clone(),
        ));
        let (shutdown, _) = broadcast::channel(1);
        Self {
            driver,
            model,
            initializer,
            shutdown,
        }
    }

    pub fn initializer(&self) -> Arc<BoardInitializer> {
        Arc::clone(&self.initializer)
    }

    /// Push board globals and each axis' parameters and motion profile.
    pub async fn initialize(&self) -> Result<()> {
        info!(board = %self.driver.name(), axes = self.model.axes.len(), "initializing board");
        self.initializer.apply().await?;
        for axis in &self.model.axes {
            let driver = AxisDriver::new(Arc::clone(&self.driver), axis.axis_number);
            driver.initialize(axis).await?;
        }
        Ok(())
    }

    /// Move the axis models into their supervisor tasks and start them.
    pub fn spawn_axes(&mut self) -> Vec<SpawnedAxis> {
        let axes = mem::take(&mut self.model.axes);
        let mut spawned = Vec::with_capacity(axes.len());
        for model in axes {
            let short_id = model.short_id.clone();
            let pv = PvHandle::new(MotorFields::from_model(&model));
            let driver = AxisDriver::new(Arc::clone(&self.driver), model.axis_number);
            let supervisor = AxisSupervisor::new(
                model,
                MotionController::new(driver),
                pv.clone(),
                self.initializer(),
            );
            let handle = tokio::spawn(supervisor.run(self.shutdown.subscribe()));
            spawned.push(SpawnedAxis { short_id, pv, handle });
        }
        spawned
    }

    /// Signal every axis loop to stop, then halt all motors.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.driver.stop_all().await
    }
}
