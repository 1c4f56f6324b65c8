/// Validation failure from one of the `AxisModel` setters.
#[derive(Debug)]
pub enum AxisError {
    NonPositive { field: &'static str, value: f64 },
    BacklashDirection(i8),
    LimitOrder { low: f64, high: f64 },
    LimitOutsideStage { dial_low: f64, dial_high: f64, stage: f64 },
}

impl std::fmt::Display for AxisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AxisError::NonPositive { field, value } => {
                write!(f, "{} must be a positive finite number, got {}", field, value)
            }
            AxisError::BacklashDirection(value) => {
                write!(f, "backlash direction must be -1 or 1, got {}", value)
            }
            AxisError::LimitOrder { low, high } => {
                write!(f, "user limits must satisfy low < high, got {} and {}", low, high)
            }
            AxisError::LimitOutsideStage { dial_low, dial_high, stage } => {
                write!(
                    f,
                    "user limits map to dial range [{}, {}], outside the measured travel [0, {}]",
                    dial_low, dial_high, stage
                )
            }
        }
    }
}

impl std::error::Error for AxisError {}
