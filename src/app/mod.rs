pub mod adb;
pub mod apk;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod models;
pub mod ports;
pub mod protocol;
