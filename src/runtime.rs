// Scheduler: frame acquisition thread plus three independently clocked activities
//
// - odometry (configurable, default 50 Hz): measured twist -> pose -> publish
// - command (10 Hz): commanded twist -> wheel command -> serial write (keep-alive)
// - battery (2 Hz): latest frame -> voltage -> publish
//
// Activities only share snapshot cells. No lock is held across I/O and no
// activity waits on another or on the acquisition thread. Serial reads and
// writes run on their own threads, never on tokio workers.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::base::kinematics::{RobotGeometry, Twist2D};
use crate::base::link::{PortWorker, SerialLink, spawn_acquisition};
use crate::base::odometry::{Covariance, NonFiniteStep, OdometryIntegrator, Pose2D};
use crate::base::protocol::{self, COMMAND_LEN, Frame, WheelCommand};
use crate::config::{BATTERY_HZ, BridgeConfig, CMD_HZ, TOPIC_BATTERY, TOPIC_CMD_VEL, TOPIC_TF, period};
use crate::messages::{BatteryStateMsg, OdometryMsg, TransformMsg, VelocityCommand, now_stamp};
use crate::shared::Snapshot;

/// Outgoing message buffer per activity; a full buffer drops, never blocks
const OUTBOX_CAPACITY: usize = 8;

/// Why a periodic tick produced no output.
///
/// A skipped tick publishes nothing and leaves the activity's state as it
/// was, so consumers keep the previously published value.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum SkipTick {
    #[error("no telemetry frame received yet")]
    NoTelemetry,

    #[error(transparent)]
    NonFinite(#[from] NonFiniteStep),
}

/// Cells shared between the acquisition thread and the activities.
/// Each has exactly one writer.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    /// Written by frame acquisition
    pub frame: Snapshot<Option<Frame>>,
    /// Written by the velocity command listener
    pub commanded: Snapshot<Twist2D>,
}

/// Integrates the latest measured twist and builds odometry messages
pub struct OdometryActivity {
    frame: Snapshot<Option<Frame>>,
    integrator: OdometryIntegrator,
    geometry: RobotGeometry,
    covariance: Covariance,
    odom_id: String,
    base_id: String,
    debug_mode: bool,
}

impl OdometryActivity {
    /// `start` is the reference for the first integration step
    pub fn new(shared: &SharedState, config: &BridgeConfig, start: Instant) -> Self {
        Self {
            frame: shared.frame.clone(),
            integrator: OdometryIntegrator::starting_at(start),
            geometry: config.geometry,
            covariance: config.covariance,
            odom_id: config.odom_id.clone(),
            base_id: config.base_id.clone(),
            debug_mode: config.debug_mode,
        }
    }

    pub fn tick(&mut self, now: Instant) -> Result<OdometryMsg, SkipTick> {
        let frame = (*self.frame.load()).ok_or(SkipTick::NoTelemetry)?;
        let twist = self.geometry.forward(protocol::decode_wheel_state(&frame));
        let pose = self.integrator.tick(twist, now)?;

        if self.debug_mode {
            let b = frame.as_bytes();
            info!(
                "[Debug] header: {:3} {:3}, left: {:5}, right: {:5}, volt: {:5}",
                b[0],
                b[1],
                frame.left_speed_raw(),
                frame.right_speed_raw(),
                frame.voltage_raw()
            );
        }

        Ok(OdometryMsg::new(
            now_stamp(),
            &self.odom_id,
            &self.base_id,
            pose,
            twist,
            self.covariance,
        ))
    }

    pub fn pose(&self) -> Pose2D {
        self.integrator.pose()
    }
}

/// Turns the latest commanded twist into a wheel command frame
pub struct CommandActivity {
    commanded: Snapshot<Twist2D>,
    geometry: RobotGeometry,
}

impl CommandActivity {
    pub fn new(shared: &SharedState, geometry: RobotGeometry) -> Self {
        Self {
            commanded: shared.commanded.clone(),
            geometry,
        }
    }

    /// Always produces a frame; with no command ever received it is the zero command
    pub fn tick(&self) -> [u8; COMMAND_LEN] {
        let twist = *self.commanded.load();
        WheelCommand::from_wheel_state(self.geometry.inverse(twist)).to_bytes()
    }
}

/// Decodes battery voltage from the latest frame
pub struct BatteryActivity {
    frame: Snapshot<Option<Frame>>,
}

impl BatteryActivity {
    pub fn new(shared: &SharedState) -> Self {
        Self {
            frame: shared.frame.clone(),
        }
    }

    pub fn tick(&self) -> Result<BatteryStateMsg, SkipTick> {
        let frame = (*self.frame.load()).ok_or(SkipTick::NoTelemetry)?;
        Ok(BatteryStateMsg {
            stamp: now_stamp(),
            voltage: protocol::decode_voltage(&frame),
        })
    }
}

fn periodic(every: Duration) -> tokio::time::Interval {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick
}

/// Hand a message to the publisher without waiting for it
fn offer<T>(outbox: &mpsc::Sender<T>, msg: T, what: &str) -> bool {
    match outbox.try_send(msg) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("{} publisher is behind, dropping message", what);
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

pub async fn odometry_loop(
    mut activity: OdometryActivity,
    every: Duration,
    outbox: mpsc::Sender<OdometryMsg>,
) {
    let mut tick = periodic(every);
    loop {
        tick.tick().await;
        // actual time, not the scheduled deadline: a late tick covers the real gap
        let now = tokio::time::Instant::now().into_std();
        match activity.tick(now) {
            Ok(msg) => {
                if !offer(&outbox, msg, "Odometry") {
                    break;
                }
            }
            Err(skip) => debug!("Skipping odometry tick: {}", skip),
        }
    }
}

pub async fn battery_loop(
    activity: BatteryActivity,
    every: Duration,
    outbox: mpsc::Sender<BatteryStateMsg>,
) {
    let mut tick = periodic(every);
    loop {
        tick.tick().await;
        match activity.tick() {
            Ok(msg) => {
                if !offer(&outbox, msg, "Battery") {
                    break;
                }
            }
            Err(skip) => debug!("Skipping battery tick: {}", skip),
        }
    }
}

/// Send the current command every `every` until `shutdown` is set.
///
/// Write errors are logged, never fatal. A write that overruns its slot
/// pushes the next send one full period out rather than bursting.
pub fn run_command_sender<W: Write + ?Sized>(
    activity: &CommandActivity,
    every: Duration,
    port: &mut W,
    shutdown: &AtomicBool,
) {
    let mut next = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        let bytes = activity.tick();
        if let Err(e) = port.write_all(&bytes).and_then(|_| port.flush()) {
            warn!("Failed to send wheel command {:?}: {}", bytes, e);
        }

        next += every;
        let now = Instant::now();
        if next <= now {
            next = now + every;
        }
        thread::sleep(next - now);
    }
}

/// Start the keep-alive command sender on a dedicated thread that owns `port`
pub fn spawn_command_sender<W>(
    activity: CommandActivity,
    every: Duration,
    mut port: W,
) -> std::io::Result<PortWorker>
where
    W: Write + Send + 'static,
{
    PortWorker::spawn("command-sender", move |shutdown| {
        run_command_sender(&activity, every, &mut port, shutdown);
    })
}

async fn put_json<T: Serialize>(publisher: &zenoh::pubsub::Publisher<'_>, msg: &T) {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialise message: {}", e);
            return;
        }
    };
    if let Err(e) = publisher.put(json).await {
        warn!("Failed to publish on {}: {}", publisher.key_expr(), e);
    }
}

pub async fn run(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Serial open failure is fatal: no retry
    let link = SerialLink::open(&config.port, config.baudrate, config.read_timeout)?;
    let link = tokio::task::spawn_blocking(move || {
        let mut link = link;
        link.flush_startup();
        link
    })
    .await?;
    info!("Communication established");

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_VEL).await?;
    let pub_odom = session.declare_publisher(config.odom_topic.clone()).await?;
    let pub_tf = if config.pub_tf {
        Some(session.declare_publisher(TOPIC_TF).await?)
    } else {
        None
    };
    let pub_battery = session.declare_publisher(TOPIC_BATTERY).await?;

    // Port workers join on drop, so an early return below still releases both halves
    let shared = SharedState::default();
    let (reader, writer) = link.split()?;
    let acquisition = spawn_acquisition(reader, shared.frame.clone())?;
    let sender = spawn_command_sender(
        CommandActivity::new(&shared, config.geometry),
        period(CMD_HZ),
        writer,
    )?;

    let (odom_tx, mut odom_rx) = mpsc::channel::<OdometryMsg>(OUTBOX_CAPACITY);
    let (battery_tx, mut battery_rx) = mpsc::channel::<BatteryStateMsg>(OUTBOX_CAPACITY);

    let mut tasks = JoinSet::new();

    // Velocity command listener: sole writer of the commanded twist
    let commanded = shared.commanded.clone();
    tasks.spawn(async move {
        while let Ok(sample) = subscriber.recv_async().await {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<VelocityCommand>(&payload) {
                Ok(cmd) => {
                    debug!("Received command: {:?}", cmd);
                    commanded.publish(cmd.into());
                }
                Err(e) => warn!("Failed to parse command: {}", e),
            }
        }
    });

    tasks.spawn(odometry_loop(
        OdometryActivity::new(&shared, &config, Instant::now()),
        config.odom_period,
        odom_tx,
    ));
    tasks.spawn(battery_loop(
        BatteryActivity::new(&shared),
        period(BATTERY_HZ),
        battery_tx,
    ));

    tasks.spawn(async move {
        while let Some(msg) = odom_rx.recv().await {
            put_json(&pub_odom, &msg).await;
            if let Some(pub_tf) = &pub_tf {
                put_json(pub_tf, &TransformMsg::from(&msg)).await;
            }
        }
    });
    tasks.spawn(async move {
        while let Some(msg) = battery_rx.recv().await {
            put_json(&pub_battery, &msg).await;
        }
    });

    info!(
        "Bridge started: odom every {:?}, cmd {}Hz, battery {}Hz",
        config.odom_period, CMD_HZ, BATTERY_HZ
    );
    info!("Subscribed to: {}", TOPIC_CMD_VEL);
    let mut topics = vec![config.odom_topic.as_str(), TOPIC_BATTERY];
    if config.pub_tf {
        topics.push(TOPIC_TF);
    }
    info!("Publishing to: {}", topics.join(", "));

    let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            signal.map_err(Into::into)
        }
        Some(exited) = tasks.join_next() => {
            error!("Activity exited unexpectedly: {:?}", exited);
            Err("activity exited unexpectedly".into())
        }
    };

    tasks.shutdown().await;
    tokio::task::spawn_blocking(move || {
        sender.stop();
        acquisition.stop();
    })
    .await?;
    drop(session);

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::protocol::FRAME_LEN;
    use crate::config::BridgeArgs;
    use clap::Parser;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    fn config() -> BridgeConfig {
        BridgeArgs::parse_from(["diffbot-zenoh-bridge"])
            .into_config()
            .unwrap()
    }

    /// 524 ticks on both wheels (straight ahead), 12.00 V
    fn forward_frame() -> Frame {
        let bytes: [u8; FRAME_LEN] = [0xFF, 0xFE, 0x02, 0x0C, 0x02, 0x0C, 0x04, 0xB0];
        Frame::try_from(&bytes[..]).unwrap()
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Rejects every write, counting the attempts
    #[derive(Clone, Default)]
    struct FailingPort(Arc<AtomicUsize>);

    impl Write for FailingPort {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// A port whose every write stalls, like a wedged USB adapter
    struct SlowPort(Duration);

    impl Write for SlowPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            std::thread::sleep(self.0);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_no_telemetry_skips_ticks() {
        let shared = SharedState::default();
        let start = Instant::now();
        let mut odom = OdometryActivity::new(&shared, &config(), start);
        let battery = BatteryActivity::new(&shared);

        assert_eq!(
            odom.tick(start + Duration::from_millis(20)).unwrap_err(),
            SkipTick::NoTelemetry
        );
        assert_eq!(battery.tick().unwrap_err(), SkipTick::NoTelemetry);
        assert_eq!(odom.pose(), Pose2D::default());
    }

    #[test]
    fn test_first_step_measured_from_construction() {
        let shared = SharedState::default();
        let start = Instant::now();
        let mut odom = OdometryActivity::new(&shared, &config(), start);

        // Ticks before the first frame are skipped and do not advance the clock
        assert!(odom.tick(start + Duration::from_millis(500)).is_err());

        shared.frame.publish(Some(forward_frame()));
        let msg = odom.tick(start + Duration::from_secs(1)).unwrap();
        let expected_vx = msg.twist.linear_x;
        assert!(expected_vx > 0.0);
        assert!((msg.position.x - expected_vx * 1.0).abs() < 1e-9);
        assert_eq!(odom.pose().x, msg.position.x);
    }

    #[test]
    fn test_stale_frame_keeps_producing() {
        let shared = SharedState::default();
        shared.frame.publish(Some(forward_frame()));
        let start = Instant::now();
        let mut odom = OdometryActivity::new(&shared, &config(), start);
        let battery = BatteryActivity::new(&shared);

        let mut last_x = 0.0;
        for k in 1..=25u64 {
            let msg = odom.tick(start + Duration::from_millis(20 * k)).unwrap();
            assert!(msg.position.x > last_x);
            last_x = msg.position.x;
            assert!((battery.tick().unwrap().voltage - 12.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_command_defaults_to_zero() {
        let shared = SharedState::default();
        let cmd = CommandActivity::new(&shared, RobotGeometry::default());
        assert_eq!(cmd.tick(), [0xFF, 0xFE, 0, 1, 0, 1]);
    }

    #[test]
    fn test_command_follows_latest_twist() {
        let shared = SharedState::default();
        let cmd = CommandActivity::new(&shared, RobotGeometry::default());

        shared.commanded.publish(Twist2D::new(0.0, 2.0));
        let spin = cmd.tick();
        assert_eq!(spin[3], 0, "left wheel reverses");
        assert_eq!(spin[5], 1, "right wheel forward");
        assert_eq!(spin[2], spin[4]);

        shared.commanded.publish(Twist2D::new(100.0, 0.0));
        assert_eq!(cmd.tick(), [0xFF, 0xFE, 255, 1, 255, 1]);
    }

    #[test]
    fn test_command_keep_alive() {
        let shared = SharedState::default();
        let port = SharedBuf::default();
        let sent = port.0.clone();
        let sender = spawn_command_sender(
            CommandActivity::new(&shared, RobotGeometry::default()),
            Duration::from_millis(10),
            port,
        )
        .unwrap();

        thread::sleep(Duration::from_millis(300));
        sender.stop();

        let sent = sent.lock().unwrap().clone();
        assert_eq!(sent.len() % COMMAND_LEN, 0);
        let frames = sent.len() / COMMAND_LEN;
        assert!(frames >= 10, "only {} frames sent", frames);
        assert!(
            sent.chunks(COMMAND_LEN)
                .all(|chunk| chunk == [0xFF, 0xFE, 0, 1, 0, 1])
        );
    }

    #[test]
    fn test_command_write_failure_is_not_fatal() {
        let shared = SharedState::default();
        let port = FailingPort::default();
        let attempts = port.0.clone();
        let sender = spawn_command_sender(
            CommandActivity::new(&shared, RobotGeometry::default()),
            Duration::from_millis(10),
            port,
        )
        .unwrap();

        thread::sleep(Duration::from_millis(200));
        assert!(!sender.is_finished());
        sender.stop();
        assert!(attempts.load(Ordering::Relaxed) >= 5);
    }

    #[test]
    fn test_command_sender_stops_promptly() {
        let shared = SharedState::default();
        let sender = spawn_command_sender(
            CommandActivity::new(&shared, RobotGeometry::default()),
            period(CMD_HZ),
            SharedBuf::default(),
        )
        .unwrap();

        let asked = Instant::now();
        sender.stop();
        assert!(asked.elapsed() < Duration::from_millis(500));
    }

    // One tokio worker: any blocking call on the executor would stall odometry
    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_slow_serial_write_does_not_starve_odometry() {
        let shared = SharedState::default();
        shared.frame.publish(Some(forward_frame()));

        let sender = spawn_command_sender(
            CommandActivity::new(&shared, RobotGeometry::default()),
            period(CMD_HZ),
            SlowPort(Duration::from_millis(300)),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(128);
        let odom = tokio::spawn(odometry_loop(
            OdometryActivity::new(&shared, &config(), Instant::now()),
            Duration::from_millis(20),
            tx,
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        odom.abort();

        let mut published = 0;
        while rx.try_recv().is_ok() {
            published += 1;
        }
        assert!(published >= 35, "only {} odometry messages in 1 s", published);

        tokio::task::spawn_blocking(move || sender.stop())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_late_tick_integrates_actual_elapsed_time() {
        let shared = SharedState::default();
        shared.frame.publish(Some(forward_frame()));

        let (tx, mut rx) = mpsc::channel(8);
        let odom = tokio::spawn(odometry_loop(
            OdometryActivity::new(&shared, &config(), Instant::now()),
            Duration::from_millis(100),
            tx,
        ));

        // the interval fires immediately, so this step covers ~0 s
        let first = rx.recv().await.unwrap();

        // hog the only worker past the next deadline
        tokio::spawn(async { std::thread::sleep(Duration::from_millis(150)) });

        let second = rx.recv().await.unwrap();
        odom.abort();

        let vx = second.twist.linear_x;
        assert!(vx > 0.0);
        let covered = (second.position.x - first.position.x) / vx;
        assert!(covered >= 0.14, "second step covered only {:.3} s", covered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_odometry_loop_survives_stale_telemetry() {
        let shared = SharedState::default();
        shared.frame.publish(Some(forward_frame()));

        let start = tokio::time::Instant::now().into_std();
        let activity = OdometryActivity::new(&shared, &config(), start);
        let (tx, mut rx) = mpsc::channel(64);
        let task = tokio::spawn(odometry_loop(activity, Duration::from_millis(20), tx));

        // No new frame ever arrives
        let mut received = Vec::new();
        for _ in 0..10 {
            received.push(rx.recv().await.unwrap());
        }
        task.abort();

        assert!(
            received
                .windows(2)
                .all(|w| w[1].position.x >= w[0].position.x)
        );
        let last = received.last().unwrap();
        assert!(last.position.x > 0.0);
        assert_eq!(last.frame_id, "odom");
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_loop_waits_for_telemetry() {
        let shared = SharedState::default();
        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(battery_loop(
            BatteryActivity::new(&shared),
            period(BATTERY_HZ),
            tx,
        ));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(rx.try_recv().is_err());

        shared.frame.publish(Some(forward_frame()));
        let msg = rx.recv().await.unwrap();
        assert!((msg.voltage - 12.0).abs() < 1e-12);
        task.abort();
    }
}
