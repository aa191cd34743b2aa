pub mod constants;
pub mod geodesy;
pub mod ranges;
pub mod normalize;
pub mod clocktrack;
pub mod chart;
pub mod orientation;
pub mod eventlog;
pub mod net;
pub mod session;
pub mod output;
pub mod config;
