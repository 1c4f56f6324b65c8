//! TMCL-style parameter keys the façade relies on. Anything else the
//! hardware understands goes through the verbatim `configurable_parameters`
//! maps in the configuration file.

pub mod axis_param {
    pub const TARGET_POSITION: u16 = 0;
    pub const ACTUAL_POSITION: u16 = 1;
    pub const TARGET_VELOCITY: u16 = 2;
    pub const ACTUAL_VELOCITY: u16 = 3;
    pub const MAX_VELOCITY: u16 = 4;
    pub const MAX_ACCELERATION: u16 = 5;
    pub const POSITION_REACHED_FLAG: u16 = 8;
    pub const RIGHT_LIMIT_SWITCH_STATE: u16 = 10;
    pub const LEFT_LIMIT_SWITCH_STATE: u16 = 11;
    /// Distance between the end switches, measured by a reference search.
    pub const RIGHT_LIMIT_SWITCH_POSITION: u16 = 196;
}

pub mod global_param {
    /// Millisecond tick timer; restarts from zero on a power cycle.
    pub const TICK_TIMER: u16 = 132;
}
