// Rates, topics, and runtime parameters
use std::time::Duration;

use clap::Parser;

use crate::base::kinematics::{RobotGeometry, WHEEL_RADIUS, WHEEL_SEPARATION};
use crate::base::link::{DEFAULT_BAUDRATE, DEFAULT_PORT, DEFAULT_TIMEOUT_MS};
use crate::base::odometry::Covariance;

// Activity rates
pub const DEFAULT_ODOM_HZ: f64 = 50.0;
pub const CMD_HZ: f64 = 10.0; // keep-alive command cadence
pub const BATTERY_HZ: f64 = 2.0;

// Zenoh topics
pub const TOPIC_CMD_VEL: &str = "diffbot/cmd/vel"; // velocity commands
pub const DEFAULT_TOPIC_ODOM: &str = "diffbot/state/odom"; // pose + twist
pub const TOPIC_BATTERY: &str = "diffbot/state/battery"; // battery voltage
pub const TOPIC_TF: &str = "diffbot/tf"; // odom -> base transform

// Coordinate frame ids
pub const DEFAULT_BASE_ID: &str = "base_footprint";
pub const DEFAULT_ODOM_ID: &str = "odom";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a positive finite number, got {value}")]
    NotPositive { name: &'static str, value: f64 },

    #[error("{name} must be a non-negative finite number, got {value}")]
    Negative { name: &'static str, value: f64 },
}

/// Command-line parameters of the bridge
#[derive(Debug, Clone, Parser)]
#[command(version, about = "Serial bridge between zenoh velocity commands and a differential-drive base")]
pub struct BridgeArgs {
    /// Serial port of the base controller
    #[arg(long, default_value = DEFAULT_PORT)]
    pub port: String,

    #[arg(long, default_value_t = DEFAULT_BAUDRATE)]
    pub baudrate: u32,

    /// Read timeout on the serial port (ms)
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    pub read_timeout_ms: u64,

    /// Odometry publish rate (Hz)
    #[arg(long, default_value_t = DEFAULT_ODOM_HZ)]
    pub odom_freq: f64,

    /// Distance between the wheels (m)
    #[arg(long, default_value_t = WHEEL_SEPARATION)]
    pub wheel_separation: f64,

    /// Wheel radius (m)
    #[arg(long, default_value_t = WHEEL_RADIUS)]
    pub wheel_radius: f64,

    /// Variance reported for the linear-x measurement
    #[arg(long, default_value_t = 1.0)]
    pub vx_cov: f64,

    /// Variance reported for the yaw-rate measurement
    #[arg(long, default_value_t = 1.0)]
    pub vyaw_cov: f64,

    #[arg(long, default_value = DEFAULT_TOPIC_ODOM)]
    pub odom_topic: String,

    #[arg(long, default_value = DEFAULT_BASE_ID)]
    pub base_id: String,

    #[arg(long, default_value = DEFAULT_ODOM_ID)]
    pub odom_id: String,

    /// Publish the odom -> base transform
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub pub_tf: bool,

    /// Log raw telemetry frames on every odometry tick
    #[arg(long)]
    pub debug_mode: bool,
}

/// Validated, immutable runtime configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub port: String,
    pub baudrate: u32,
    pub read_timeout: Duration,
    pub odom_period: Duration,
    pub geometry: RobotGeometry,
    pub covariance: Covariance,
    pub odom_topic: String,
    pub base_id: String,
    pub odom_id: String,
    pub pub_tf: bool,
    pub debug_mode: bool,
}

impl BridgeArgs {
    pub fn into_config(self) -> Result<BridgeConfig, ConfigError> {
        let odom_freq = positive("odom_freq", self.odom_freq)?;
        let geometry = RobotGeometry {
            wheel_separation: positive("wheel_separation", self.wheel_separation)?,
            wheel_radius: positive("wheel_radius", self.wheel_radius)?,
        };
        let covariance = Covariance {
            vx: non_negative("vx_cov", self.vx_cov)?,
            vyaw: non_negative("vyaw_cov", self.vyaw_cov)?,
        };

        Ok(BridgeConfig {
            port: self.port,
            baudrate: self.baudrate,
            read_timeout: Duration::from_millis(self.read_timeout_ms.max(1)),
            odom_period: period(odom_freq),
            geometry,
            covariance,
            odom_topic: self.odom_topic,
            base_id: self.base_id,
            odom_id: self.odom_id,
            pub_tf: self.pub_tf,
            debug_mode: self.debug_mode,
        })
    }
}

/// Period of a rate given in Hz
pub fn period(hz: f64) -> Duration {
    Duration::from_nanos(((1e9 / hz).round() as u64).max(1))
}

fn positive(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::NotPositive { name, value })
    }
}

fn non_negative(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::Negative { name, value })
    }
}
