// Dead-reckoning pose integration
//
// First-order Euler integration of a unicycle model. There is no arc
// correction, so accuracy degrades with large time steps or high yaw rates.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::kinematics::Twist2D;

/// Size of a row-major 6x6 covariance matrix (x, y, z, roll, pitch, yaw)
pub const COVARIANCE_LEN: usize = 36;

/// Planar pose in the odometry frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
}

impl Pose2D {
    /// Orientation as a unit quaternion (roll = pitch = 0)
    pub fn orientation(&self) -> Quaternion {
        Quaternion::from_yaw(self.yaw)
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.yaw.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Quaternion {
    pub fn from_yaw(yaw: f64) -> Self {
        let half = yaw / 2.0;
        Self {
            x: 0.0,
            y: 0.0,
            z: half.sin(),
            w: half.cos(),
        }
    }
}

/// Static diagonal covariance: only linear-x and yaw-rate variances are set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Covariance {
    pub vx: f64,
    pub vyaw: f64,
}

impl Default for Covariance {
    fn default() -> Self {
        Self { vx: 1.0, vyaw: 1.0 }
    }
}

impl Covariance {
    /// Full 6x6 matrix, all entries zero except [0] and [35]
    pub fn matrix(&self) -> Vec<f64> {
        let mut m = vec![0.0; COVARIANCE_LEN];
        m[0] = self.vx;
        m[COVARIANCE_LEN - 1] = self.vyaw;
        m
    }
}

/// Integration step rejected because it would leave the pose non-finite
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("Non-finite odometry step (twist={twist:?}, dt={dt})")]
pub struct NonFiniteStep {
    pub twist: Twist2D,
    pub dt: f64,
}

/// Owns the accumulated pose; the only place the pose is mutated.
///
/// The pose starts at the origin when the integrator is constructed and is
/// never reset. The first `dt` is measured from construction time.
#[derive(Debug)]
pub struct OdometryIntegrator {
    pose: Pose2D,
    last_tick: Instant,
}

impl OdometryIntegrator {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        Self {
            pose: Pose2D::default(),
            last_tick: start,
        }
    }

    pub fn pose(&self) -> Pose2D {
        self.pose
    }

    /// Integrate `twist` over the wall-clock time since the previous tick.
    ///
    /// A rejected step leaves both pose and tick time untouched, so the next
    /// successful tick covers the skipped interval.
    pub fn tick(&mut self, twist: Twist2D, now: Instant) -> Result<Pose2D, NonFiniteStep> {
        let dt = now.saturating_duration_since(self.last_tick).as_secs_f64();
        let pose = self.step(twist, dt)?;
        self.last_tick = now;
        Ok(pose)
    }

    /// Integrate `twist` over an explicit time step (seconds)
    pub fn step(&mut self, twist: Twist2D, dt: f64) -> Result<Pose2D, NonFiniteStep> {
        let yaw = self.pose.yaw;
        let next = Pose2D {
            x: self.pose.x + twist.linear_x * yaw.cos() * dt,
            y: self.pose.y + twist.linear_x * yaw.sin() * dt,
            yaw: yaw + twist.angular_z * dt,
        };
        if !next.is_finite() {
            return Err(NonFiniteStep { twist, dt });
        }
        self.pose = next;
        Ok(next)
    }
}

impl Default for OdometryIntegrator {
    fn default() -> Self {
        Self::new()
    }
}
