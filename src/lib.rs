pub mod timestamp;
pub mod traits;
pub mod config;
pub mod fusion;
pub mod drift;
pub mod calibrator;
pub mod servo;
pub mod holdover;
pub mod state;
pub mod status;
pub mod controller;
pub mod sim;
pub mod clock;
pub mod rtc;
