pub mod axis;
pub mod board;
pub mod config;
pub mod motion;
pub mod pv;
pub mod supervisor;
