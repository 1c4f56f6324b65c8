pub mod error;
pub mod limit_switches;

use std::collections::HashMap;

use error::AxisError;
use limit_switches::LimitSwitches;

/// Value of `stage_motion_limit` before the first homing run has measured
/// the real travel range.
pub const STAGE_LIMIT_PLACEHOLDER: f64 = 1.0e12;

/// Coordinate and state record for one physical axis.
///
/// Owned exclusively by its supervisor task; nothing here does I/O.
/// Coordinates follow the motor-record convention:
/// `user = dial * direction + user_offset`, `dial = raw / conversion`,
/// with raw being the integer device step count.
///
/// Fields whose values carry invariants (conversion factor, limits,
/// backlash direction, motion profile, poll intervals) are private and go
/// through validated setters, so configuration loads can fill many fields
/// and validate each once.
#[derive(Debug, Clone)]
pub struct AxisModel {
    pub axis_number: u8,
    pub short_id: String,
    pub description: String,

    conversion: f64,
    pub base_unit: String,
    pub invert_axis_direction: bool,
    pub invert_limit_values: bool,

    pub user_offset: f64,
    negative_user_limit: f64,
    positive_user_limit: f64,
    pub stage_motion_limit: f64,

    backlash: f64,
    backlash_direction: i8,
    velocity: f64,
    backlash_velocity: f64,
    acceleration_duration: f64,

    pub actual_coordinate_rbv: f64,
    pub target_coordinate: f64,
    pub actual_raw_rbv: i64,
    pub target_raw_rbv: i64,

    pub is_moving_rbv: bool,
    pub is_position_reached_rbv: bool,
    pub is_homed_rbv: bool,
    pub is_move_interrupted: bool,
    pub limit_switches: LimitSwitches,

    update_interval_moving: f64,
    update_interval_idle: f64,

    /// Device parameter key/value pairs applied verbatim at axis init.
    pub configurable_parameters: HashMap<u16, i64>,
}

impl Default for AxisModel {
    fn default() -> Self {
        Self {
            axis_number: 0,
            short_id: "motor0".to_string(),
            description: "stepper axis".to_string(),
            conversion: 1000.0,
            base_unit: "mm".to_string(),
            invert_axis_direction: false,
            invert_limit_values: false,
            user_offset: 0.0,
            negative_user_limit: -100.0,
            positive_user_limit: 100.0,
            stage_motion_limit: STAGE_LIMIT_PLACEHOLDER,
            backlash: 1.0,
            backlash_direction: 1,
            velocity: 10.0,
            backlash_velocity: 10.0,
            acceleration_duration: 1.0,
            actual_coordinate_rbv: 0.0,
            target_coordinate: 0.0,
            actual_raw_rbv: 0,
            target_raw_rbv: 0,
            is_moving_rbv: false,
            is_position_reached_rbv: false,
            is_homed_rbv: false,
            is_move_interrupted: false,
            limit_switches: LimitSwitches::None,
            update_interval_moving: 0.1,
            update_interval_idle: 1.0,
            configurable_parameters: HashMap::new(),
        }
    }
}

impl AxisModel {
    /// +1.0 normal, -1.0 inverted. Derived, never stored.
    pub fn direction(&self) -> f64 {
        if self.invert_axis_direction {
            -1.0
        } else {
            1.0
        }
    }

    pub fn user_to_dial(&self, user: f64) -> f64 {
        (user - self.user_offset) / self.direction()
    }

    pub fn dial_to_user(&self, dial: f64) -> f64 {
        dial * self.direction() + self.user_offset
    }

    pub fn dial_to_raw(&self, dial: f64) -> i64 {
        (dial * self.conversion).round() as i64
    }

    pub fn raw_to_dial(&self, raw: i64) -> f64 {
        raw as f64 / self.conversion
    }

    pub fn user_to_raw(&self, user: f64) -> i64 {
        self.dial_to_raw(self.user_to_dial(user))
    }

    pub fn raw_to_user(&self, raw: i64) -> f64 {
        self.dial_to_user(self.raw_to_dial(raw))
    }

    /// Velocity in raw steps per second.
    pub fn velocity_raw(&self) -> f64 {
        self.velocity * self.conversion
    }

    /// Acceleration in raw steps per second squared.
    pub fn acceleration_raw(&self) -> f64 {
        self.velocity_raw() / self.acceleration_duration
    }

    pub fn conversion(&self) -> f64 {
        self.conversion
    }

    pub fn backlash(&self) -> f64 {
        self.backlash
    }

    pub fn backlash_direction(&self) -> i8 {
        self.backlash_direction
    }

    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    /// Speed used for backlash-takeout legs, user units per second.
    pub fn backlash_velocity(&self) -> f64 {
        self.backlash_velocity
    }

    pub fn backlash_velocity_raw(&self) -> f64 {
        self.backlash_velocity * self.conversion
    }

    pub fn acceleration_duration(&self) -> f64 {
        self.acceleration_duration
    }

    pub fn negative_user_limit(&self) -> f64 {
        self.negative_user_limit
    }

    pub fn positive_user_limit(&self) -> f64 {
        self.positive_user_limit
    }

    pub fn update_interval_moving(&self) -> f64 {
        self.update_interval_moving
    }

    pub fn update_interval_idle(&self) -> f64 {
        self.update_interval_idle
    }

    /// True once homing has replaced the placeholder travel range.
    pub fn stage_range_measured(&self) -> bool {
        self.stage_motion_limit < STAGE_LIMIT_PLACEHOLDER
    }

    pub fn within_user_limits(&self, user: f64) -> bool {
        self.negative_user_limit <= user && user <= self.positive_user_limit
    }

    pub fn set_conversion(&mut self, steps_per_unit: f64) -> Result<(), AxisError> {
        ensure_positive("conversion", steps_per_unit)?;
        self.conversion = steps_per_unit;
        Ok(())
    }

    pub fn set_velocity(&mut self, velocity: f64) -> Result<(), AxisError> {
        ensure_positive("velocity", velocity)?;
        self.velocity = velocity;
        Ok(())
    }

    pub fn set_backlash_velocity(&mut self, velocity: f64) -> Result<(), AxisError> {
        ensure_positive("backlash_velocity", velocity)?;
        self.backlash_velocity = velocity;
        Ok(())
    }

    pub fn set_acceleration_duration(&mut self, seconds: f64) -> Result<(), AxisError> {
        ensure_positive("acceleration_duration", seconds)?;
        self.acceleration_duration = seconds;
        Ok(())
    }

    pub fn set_update_interval_moving(&mut self, seconds: f64) -> Result<(), AxisError> {
        ensure_positive("update_interval_moving", seconds)?;
        self.update_interval_moving = seconds;
        Ok(())
    }

    pub fn set_update_interval_idle(&mut self, seconds: f64) -> Result<(), AxisError> {
        ensure_positive("update_interval_idle", seconds)?;
        self.update_interval_idle = seconds;
        Ok(())
    }

    pub fn set_backlash(&mut self, distance: f64) -> Result<(), AxisError> {
        if !distance.is_finite() || distance < 0.0 {
            return Err(AxisError::NonPositive {
                field: "backlash",
                value: distance,
            });
        }
        self.backlash = distance;
        Ok(())
    }

    pub fn set_backlash_direction(&mut self, direction: i8) -> Result<(), AxisError> {
        if direction != 1 && direction != -1 {
            return Err(AxisError::BacklashDirection(direction));
        }
        self.backlash_direction = direction;
        Ok(())
    }

    /// Set both soft limits at once. Ordering is always checked; the
    /// dial-space bound against the measured travel only applies once a
    /// homing run has replaced the placeholder range.
    pub fn set_user_limits(&mut self, low: f64, high: f64) -> Result<(), AxisError> {
        if !(low < high) || !low.is_finite() || !high.is_finite() {
            return Err(AxisError::LimitOrder { low, high });
        }
        if self.stage_range_measured() {
            let (a, b) = (self.user_to_dial(low), self.user_to_dial(high));
            let (dial_low, dial_high) = if a <= b { (a, b) } else { (b, a) };
            const SLACK: f64 = 1e-9;
            if dial_low < -SLACK || dial_high > self.stage_motion_limit + SLACK {
                return Err(AxisError::LimitOutsideStage {
                    dial_low,
                    dial_high,
                    stage: self.stage_motion_limit,
                });
            }
        }
        self.negative_user_limit = low;
        self.positive_user_limit = high;
        Ok(())
    }

    /// Slide the user coordinate system by `delta` without moving the
    /// motor: the raw position stays put, offset and readbacks shift.
    pub fn shift_user_coordinates(&mut self, delta: f64, shift_limits: bool) {
        self.user_offset += delta;
        self.actual_coordinate_rbv += delta;
        self.target_coordinate += delta;
        if shift_limits {
            self.negative_user_limit += delta;
            self.positive_user_limit += delta;
        }
    }

    /// Clamp both user limits into the measured travel range; used after
    /// homing when the pre-homing limits turn out to be out of bounds.
    /// Returns the limits actually applied.
    pub fn clamp_user_limits_to_stage(&mut self) -> (f64, f64) {
        let a = self.dial_to_user(0.0);
        let b = self.dial_to_user(self.stage_motion_limit);
        let (user_low, user_high) = if a <= b { (a, b) } else { (b, a) };
        let mut low = self.negative_user_limit.max(user_low);
        let mut high = self.positive_user_limit.min(user_high);
        if !(low < high) {
            low = user_low;
            high = user_high;
        }
        self.negative_user_limit = low;
        self.positive_user_limit = high;
        (low, high)
    }
}

fn ensure_positive(field: &'static str, value: f64) -> Result<(), AxisError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(AxisError::NonPositive { field, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> AxisModel {
        let mut m = AxisModel::default();
        m.set_conversion(12345.0).unwrap();
        m.user_offset = 3.25;
        m
    }

    #[test]
    fn raw_round_trip_is_exact() {
        let m = model();
        for raw in [-1_000_000, -1, 0, 1, 54_321, 2_000_000] {
            assert_eq!(m.user_to_raw(m.raw_to_user(raw)), raw);
        }
    }

    #[test]
    fn raw_round_trip_survives_inverted_direction() {
        let mut m = model();
        m.invert_axis_direction = true;
        for raw in [-99_999, 0, 7, 123_456] {
            assert_eq!(m.user_to_raw(m.raw_to_user(raw)), raw);
        }
    }

    #[test]
    fn user_dial_round_trip_is_algebraic() {
        for invert in [false, true] {
            let mut m = model();
            m.invert_axis_direction = invert;
            for user in [-42.5, 0.0, 3.25, 199.75] {
                let back = m.dial_to_user(m.user_to_dial(user));
                assert!((back - user).abs() < 1e-12, "{user} -> {back}");
            }
        }
    }

    #[test]
    fn dial_rounds_to_nearest_step() {
        let mut m = AxisModel::default();
        m.set_conversion(1000.0).unwrap();
        assert_eq!(m.dial_to_raw(0.0004), 0);
        assert_eq!(m.dial_to_raw(0.0006), 1);
        assert_eq!(m.dial_to_raw(-0.0006), -1);
    }

    #[test]
    fn motion_profile_converts_to_device_units() {
        let mut m = AxisModel::default();
        m.set_conversion(1000.0).unwrap();
        m.set_velocity(5.0).unwrap();
        m.set_acceleration_duration(2.0).unwrap();
        assert!((m.velocity_raw() - 5000.0).abs() < 1e-9);
        assert!((m.acceleration_raw() - 2500.0).abs() < 1e-9);
    }

    #[test]
    fn setters_reject_invalid_values() {
        let mut m = AxisModel::default();
        assert!(m.set_conversion(0.0).is_err());
        assert!(m.set_conversion(-3.0).is_err());
        assert!(m.set_velocity(0.0).is_err());
        assert!(m.set_acceleration_duration(-1.0).is_err());
        assert!(m.set_backlash(-0.5).is_err());
        assert!(m.set_backlash_direction(0).is_err());
        assert!(m.set_backlash_direction(2).is_err());
        assert!(m.set_user_limits(10.0, 10.0).is_err());
        assert!(m.set_user_limits(10.0, -10.0).is_err());
    }

    #[test]
    fn limit_stage_bound_only_applies_once_measured() {
        let mut m = AxisModel::default();
        m.user_offset = 50.0;
        // placeholder travel range: dial image of -40 is negative, still fine
        assert!(m.set_user_limits(-40.0, 150.0).is_ok());

        m.stage_motion_limit = 200.0;
        assert!(m.set_user_limits(-40.0, 150.0).is_err());
        assert!(m.set_user_limits(60.0, 240.0).is_ok());
    }

    #[test]
    fn clamping_limits_to_stage_keeps_ordering() {
        let mut m = AxisModel::default();
        m.set_user_limits(-50.0, 250.0).unwrap();
        m.stage_motion_limit = 200.0;
        let (low, high) = m.clamp_user_limits_to_stage();
        assert_eq!((low, high), (0.0, 200.0));
        assert_eq!(m.negative_user_limit(), 0.0);
        assert_eq!(m.positive_user_limit(), 200.0);
    }

    #[test]
    fn shifting_coordinates_moves_offset_and_limits_together() {
        let mut m = AxisModel::default();
        m.set_user_limits(-10.0, 10.0).unwrap();
        m.actual_coordinate_rbv = 2.0;
        m.shift_user_coordinates(5.0, true);
        assert_eq!(m.user_offset, 5.0);
        assert_eq!(m.actual_coordinate_rbv, 7.0);
        assert_eq!(m.negative_user_limit(), -5.0);
        assert_eq!(m.positive_user_limit(), 15.0);
    }
}
