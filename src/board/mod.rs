pub mod axis_driver;
pub mod params;
pub mod sim;

use std::collections::HashMap;

use crate::axis::AxisModel;

/// Raw device-side view of one axis, as returned by a single status poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AxisStatus {
    pub actual_raw: i64,
    pub target_raw: i64,
    pub velocity_nonzero: bool,
    pub position_reached: bool,
    pub left_switch: bool,
    pub right_switch: bool,
}

/// Command surface of one physical motion-controller board.
///
/// Implementations talk to the hardware over a point-to-point connection
/// (host, port, module address) with a fixed-format binary request/reply
/// protocol; every method is exactly one scoped round trip, so concurrent
/// axis tasks serialize naturally on the transport.
#[async_trait::async_trait]
pub trait BoardDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn move_to(&self, axis: u8, raw_target: i64) -> anyhow::Result<()>;
    async fn stop(&self, axis: u8) -> anyhow::Result<()>;
    async fn stop_all(&self) -> anyhow::Result<()>;
    async fn home(&self, axis: u8) -> anyhow::Result<()>;

    async fn get_axis_parameter(&self, axis: u8, key: u16) -> anyhow::Result<i64>;
    async fn set_axis_parameter(&self, axis: u8, key: u16, value: i64) -> anyhow::Result<()>;
    async fn get_global_parameter(&self, key: u16) -> anyhow::Result<i64>;
    async fn set_global_parameter(&self, key: u16, value: i64) -> anyhow::Result<()>;

    async fn read_axis_status(&self, axis: u8) -> anyhow::Result<AxisStatus>;
}

/// One physical board: transport endpoint, board-level parameters, and the
/// axes it carries. Owns the `AxisModel`s until the supervisor takes them.
#[derive(Debug, Clone)]
pub struct BoardModel {
    pub module_address: u8,
    pub host: String,
    pub port: u16,
    pub configurable_parameters: HashMap<u16, i64>,
    pub axes: Vec<AxisModel>,
}
