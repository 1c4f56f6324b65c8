use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::axis::error::AxisError;
use crate::axis::AxisModel;
use crate::board::BoardModel;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_yaml::Error),
    NoAxes,
    DuplicateAxis(u8),
    InvalidAxis { axis: u8, source: AxisError },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read configuration: {}", e),
            ConfigError::Parse(e) => write!(f, "malformed configuration: {}", e),
            ConfigError::NoAxes => write!(f, "configuration declares no axes"),
            ConfigError::DuplicateAxis(n) => {
                write!(f, "axis number {} declared more than once", n)
            }
            ConfigError::InvalidAxis { axis, source } => {
                write!(f, "axis {}: {}", axis, source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::InvalidAxis { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Parse(e)
    }
}

fn default_port() -> u16 {
    4001
}

fn default_conversion() -> f64 {
    1000.0
}

fn default_unit() -> String {
    "mm".to_string()
}

fn default_velocity() -> f64 {
    10.0
}

fn default_acceleration() -> f64 {
    1.0
}

fn default_backlash() -> f64 {
    1.0
}

fn default_backlash_direction() -> i8 {
    1
}

fn default_interval_moving() -> f64 {
    0.1
}

fn default_interval_idle() -> f64 {
    1.0
}

/// On-disk shape of one board and its axes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub board: BoardSection,
    pub axes: Vec<AxisSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardSection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub module_address: u8,
    /// Board-global device parameters, applied verbatim at startup.
    #[serde(default)]
    pub parameters: HashMap<u16, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisSection {
    pub axis_number: u8,
    pub short_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_conversion")]
    pub steps_per_unit: f64,
    #[serde(default = "default_unit")]
    pub base_unit: String,
    #[serde(default)]
    pub invert_direction: bool,
    #[serde(default)]
    pub invert_limit_values: bool,
    #[serde(default)]
    pub user_offset: f64,
    pub user_low_limit: f64,
    pub user_high_limit: f64,
    #[serde(default = "default_velocity")]
    pub velocity: f64,
    #[serde(default = "default_acceleration")]
    pub acceleration_duration: f64,
    #[serde(default = "default_backlash")]
    pub backlash: f64,
    /// Speed for backlash-takeout legs; defaults to the main velocity.
    #[serde(default)]
    pub backlash_velocity: Option<f64>,
    #[serde(default = "default_backlash_direction")]
    pub backlash_direction: i8,
    #[serde(default = "default_interval_moving")]
    pub update_interval_moving: f64,
    #[serde(default = "default_interval_idle")]
    pub update_interval_idle: f64,
    /// Per-axis device parameters, applied verbatim at axis init.
    #[serde(default)]
    pub parameters: HashMap<u16, i64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::parse(&text)?;
        info!(path = %path.display(), axes = config.axes.len(), "configuration loaded");
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: FileConfig = serde_yaml::from_str(text)?;
        if config.axes.is_empty() {
            return Err(ConfigError::NoAxes);
        }
        let mut seen = std::collections::HashSet::new();
        for axis in &config.axes {
            if !seen.insert(axis.axis_number) {
                return Err(ConfigError::DuplicateAxis(axis.axis_number));
            }
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = serde_yaml::to_string(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Build the runtime board model, validating every axis field that
    /// carries an invariant.
    pub fn build(&self) -> Result<BoardModel, ConfigError> {
        let mut axes = Vec::with_capacity(self.axes.len());
        for section in &self.axes {
            axes.push(section.build()?);
        }
        Ok(BoardModel {
            module_address: self.board.module_address,
            host: self.board.host.clone(),
            port: self.board.port,
            configurable_parameters: self.board.parameters.clone(),
            axes,
        })
    }
}

impl AxisSection {
    fn build(&self) -> Result<AxisModel, ConfigError> {
        let invalid = |source| ConfigError::InvalidAxis {
            axis: self.axis_number,
            source,
        };
        let mut model = AxisModel::default();
        model.axis_number = self.axis_number;
        model.short_id = self.short_id.clone();
        model.description = self.description.clone();
        model.base_unit = self.base_unit.clone();
        model.invert_axis_direction = self.invert_direction;
        model.invert_limit_values = self.invert_limit_values;
        model.user_offset = self.user_offset;
        model.configurable_parameters = self.parameters.clone();
        model.set_conversion(self.steps_per_unit).map_err(invalid)?;
        model
            .set_user_limits(self.user_low_limit, self.user_high_limit)
            .map_err(invalid)?;
        model.set_velocity(self.velocity).map_err(invalid)?;
        model
            .set_acceleration_duration(self.acceleration_duration)
            .map_err(invalid)?;
        model.set_backlash(self.backlash).map_err(invalid)?;
        model
            .set_backlash_velocity(self.backlash_velocity.unwrap_or(self.velocity))
            .map_err(invalid)?;
        model
            .set_backlash_direction(self.backlash_direction)
            .map_err(invalid)?;
        model
            .set_update_interval_moving(self.update_interval_moving)
            .map_err(invalid)?;
        model
            .set_update_interval_idle(self.update_interval_idle)
            .map_err(invalid)?;
        Ok(model)
    }
}
