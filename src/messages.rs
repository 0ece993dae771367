// Define message types exchanged over zenoh

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::base::kinematics::Twist2D;
use crate::base::odometry::{Covariance, Pose2D, Quaternion};

/// Seconds since the unix epoch, used to stamp outgoing messages
pub fn now_stamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

// Command from teleop/planner -> bridge
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VelocityCommand {
    pub linear_x: f64,
    pub angular_z: f64,
}

impl From<VelocityCommand> for Twist2D {
    fn from(cmd: VelocityCommand) -> Self {
        Twist2D::new(cmd.linear_x, cmd.angular_z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Odometry published at the odometry rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdometryMsg {
    pub stamp: f64,
    pub frame_id: String,
    pub child_frame_id: String,
    pub position: Position,
    pub orientation: Quaternion,
    pub twist: Twist2D,
    pub pose_covariance: Vec<f64>,
    pub twist_covariance: Vec<f64>,
}

impl OdometryMsg {
    pub fn new(
        stamp: f64,
        frame_id: &str,
        child_frame_id: &str,
        pose: Pose2D,
        twist: Twist2D,
        covariance: Covariance,
    ) -> Self {
        // pose covariance mirrors the twist covariance
        let matrix = covariance.matrix();
        Self {
            stamp,
            frame_id: frame_id.to_string(),
            child_frame_id: child_frame_id.to_string(),
            position: Position {
                x: pose.x,
                y: pose.y,
                z: 0.0,
            },
            orientation: pose.orientation(),
            twist,
            pose_covariance: matrix.clone(),
            twist_covariance: matrix,
        }
    }
}

/// Transform from the odometry frame to the robot base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformMsg {
    pub stamp: f64,
    pub parent_frame_id: String,
    pub child_frame_id: String,
    pub translation: Position,
    pub rotation: Quaternion,
}

impl From<&OdometryMsg> for TransformMsg {
    fn from(odom: &OdometryMsg) -> Self {
        Self {
            stamp: odom.stamp,
            parent_frame_id: odom.frame_id.clone(),
            child_frame_id: odom.child_frame_id.clone(),
            translation: odom.position,
            rotation: odom.orientation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryStateMsg {
    pub stamp: f64,
    pub voltage: f64,
}
