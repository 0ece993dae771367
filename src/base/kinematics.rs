// Differential-drive kinematics for a two-wheel base
// Forward: wheel angular velocities -> body twist
// Inverse: body twist -> wheel angular velocities

use serde::{Deserialize, Serialize};

/// Default wheel configuration
pub const WHEEL_SEPARATION: f64 = 0.158; // meters, between wheel contact points
pub const WHEEL_RADIUS: f64 = 0.032; // meters

/// Wheel angular velocities (rad/s)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WheelState {
    pub left: f64,
    pub right: f64,
}

/// Planar body velocity: forward speed (m/s) and yaw rate (rad/s)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Twist2D {
    pub linear_x: f64,
    pub angular_z: f64,
}

impl Twist2D {
    pub fn new(linear_x: f64, angular_z: f64) -> Self {
        Self {
            linear_x,
            angular_z,
        }
    }
}

/// Robot geometry, fixed for the lifetime of the process.
///
/// The same instance serves both directions so that inverse followed by
/// forward reproduces the original twist.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobotGeometry {
    pub wheel_separation: f64,
    pub wheel_radius: f64,
}

impl Default for RobotGeometry {
    fn default() -> Self {
        Self {
            wheel_separation: WHEEL_SEPARATION,
            wheel_radius: WHEEL_RADIUS,
        }
    }
}

impl RobotGeometry {
    /// Body twist from measured wheel angular velocities
    pub fn forward(&self, wheels: WheelState) -> Twist2D {
        let v_left = wheels.left * self.wheel_radius;
        let v_right = wheels.right * self.wheel_radius;
        Twist2D {
            linear_x: (v_right + v_left) / 2.0,
            angular_z: (v_right - v_left) / self.wheel_separation,
        }
    }

    /// Wheel angular velocities needed to realise a body twist
    pub fn inverse(&self, twist: Twist2D) -> WheelState {
        let half_track = self.wheel_separation / 2.0 * twist.angular_z;
        WheelState {
            left: (twist.linear_x - half_track) / self.wheel_radius,
            right: (twist.linear_x + half_track) / self.wheel_radius,
        }
    }
}
