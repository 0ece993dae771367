// Differential-drive base: wire protocol, serial link, kinematics, odometry
//
// Provides:
// - Frame synchronisation, telemetry decoding and command encoding
// - Serial link setup and the frame acquisition thread
// - Forward/inverse differential-drive kinematics
// - Dead-reckoning pose integration

pub mod kinematics;
pub mod link;
pub mod odometry;
pub mod protocol;

pub use kinematics::{RobotGeometry, Twist2D, WheelState};
pub use link::{LinkError, SerialLink};
pub use odometry::{Covariance, OdometryIntegrator, Pose2D, Quaternion};
pub use protocol::{Frame, FrameSynchronizer, WheelCommand};
