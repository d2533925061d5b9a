//! FIFO motion queue.
//!
//! All axes of one controller share a single queue. A supervisor task takes
//! one request at a time, starts the motion and polls the controller until
//! the axis is idle again before taking the next. Submitting never fails
//! because another axis is moving: the request simply waits its turn.
//!
//! ```text
//! submit(axis 0) ──┐
//! submit(axis 1) ──┼──► [ FIFO ] ──► supervisor ──► start ─► poll is_idle ─► done
//! submit(axis 0) ──┘
//! ```
//!
//! A request submitted with a [`TargetCheck`] is resolved when its turn comes:
//! a relative move is turned into an absolute one from the axis position at
//! that moment, and the target is checked before anything is sent. Moves
//! queued ahead of it have finished by then, so the check sees where the axis
//! really is.
//!
//! [`MotionQueue::cancel_axis`] and [`MotionQueue::cancel_all`] fail queued
//! requests; a motion already running is only ended by stopping the axis.

use async_trait::async_trait;
use parking_lot::Mutex;
use saxs_core::{CoreError, CoreResult};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// One motion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Motion {
    /// Move to an absolute position.
    Absolute(i32),
    /// Move by a distance.
    Relative(i32),
    /// Rotate right until stopped.
    RotateRight(i32),
    /// Rotate left until stopped.
    RotateLeft(i32),
}

impl fmt::Display for Motion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Motion::Absolute(p) => write!(f, "move to {p}"),
            Motion::Relative(d) => write!(f, "move by {d}"),
            Motion::RotateRight(v) => write!(f, "rotate right at {v}"),
            Motion::RotateLeft(v) => write!(f, "rotate left at {v}"),
        }
    }
}

/// What the supervisor needs from a controller.
#[async_trait]
pub trait MotionControl: Send + Sync + 'static {
    /// Instrument name for errors and logs.
    fn instrument(&self) -> &str;

    /// Actual position of `axis`.
    async fn position(&self, axis: u8) -> CoreResult<i32>;

    /// Issue the motion.
    async fn start(&self, axis: u8, motion: Motion) -> CoreResult<()>;

    /// Whether `axis` has finished `motion`.
    async fn is_idle(&self, axis: u8, motion: Motion) -> CoreResult<bool>;

    /// Stop `axis` immediately.
    async fn stop(&self, axis: u8) -> CoreResult<()>;
}

/// Validates a resolved absolute target, returning it as the position to send.
pub type TargetCheck = Box<dyn Fn(i64) -> CoreResult<i32> + Send + Sync>;

struct Request {
    axis: u8,
    motion: Motion,
    check: Option<TargetCheck>,
    done: oneshot::Sender<CoreResult<()>>,
}

struct QueueInner {
    requests: Mutex<VecDeque<Request>>,
    moving: Mutex<Option<(u8, Motion)>>,
    wake: Notify,
    closed: AtomicBool,
    poll_interval: Duration,
    motion_timeout: Duration,
}

/// Handle to a submitted request.
#[derive(Debug)]
pub struct MotionTicket {
    axis: u8,
    done: oneshot::Receiver<CoreResult<()>>,
}

impl MotionTicket {
    /// Axis the request moves.
    pub fn axis(&self) -> u8 {
        self.axis
    }

    /// Wait until the motion finished (or failed, or was cancelled).
    pub async fn finished(self) -> CoreResult<()> {
        self.done.await.unwrap_or_else(|_| {
            Err(CoreError::InvalidArgument(
                "motion queue shut down before the request ran".into(),
            ))
        })
    }
}

/// One controller's motion queue and its supervisor task.
pub struct MotionQueue {
    inner: Arc<QueueInner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for MotionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MotionQueue")
            .field("moving", &self.moving())
            .field("queued", &self.queued().len())
            .finish()
    }
}

impl MotionQueue {
    /// Start the supervisor for `control`. Must be called inside a runtime.
    pub fn spawn(
        control: Arc<dyn MotionControl>,
        poll_interval: Duration,
        motion_timeout: Duration,
    ) -> Self {
        let inner = Arc::new(QueueInner {
            requests: Mutex::new(VecDeque::new()),
            moving: Mutex::new(None),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            poll_interval,
            motion_timeout,
        });
        let supervisor = tokio::spawn(supervise(inner.clone(), control));
        Self {
            inner,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    /// Queue a motion. Never rejected because another axis is moving.
    pub fn submit(&self, axis: u8, motion: Motion) -> MotionTicket {
        self.enqueue(axis, motion, None)
    }

    /// Queue a positioning move whose target is checked when it starts.
    /// A relative move is sent as the absolute position it resolves to.
    pub fn submit_checked(&self, axis: u8, motion: Motion, check: TargetCheck) -> MotionTicket {
        self.enqueue(axis, motion, Some(check))
    }

    fn enqueue(&self, axis: u8, motion: Motion, check: Option<TargetCheck>) -> MotionTicket {
        let (done, rx) = oneshot::channel();
        if self.inner.closed.load(Ordering::SeqCst) {
            let _ = done.send(Err(CoreError::InvalidArgument(
                "motion queue is shut down".into(),
            )));
        } else {
            let mut requests = self.inner.requests.lock();
            requests.push_back(Request {
                axis,
                motion,
                check,
                done,
            });
            tracing::debug!(axis, %motion, queued = requests.len(), "Motion queued");
            self.inner.wake.notify_one();
        }
        MotionTicket { axis, done: rx }
    }

    /// Queue a motion and wait for it to finish.
    pub async fn run(&self, axis: u8, motion: Motion) -> CoreResult<()> {
        self.submit(axis, motion).finished().await
    }

    /// Axis and motion currently executing.
    pub fn moving(&self) -> Option<(u8, Motion)> {
        *self.inner.moving.lock()
    }

    /// Queued requests in execution order, excluding the running one.
    pub fn queued(&self) -> Vec<(u8, Motion)> {
        self.inner
            .requests
            .lock()
            .iter()
            .map(|r| (r.axis, r.motion))
            .collect()
    }

    /// Fail every queued request for `axis`. Returns how many were dropped.
    pub fn cancel_axis(&self, axis: u8) -> usize {
        self.cancel_where(|r| r.axis == axis)
    }

    /// Fail every queued request.
    pub fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true)
    }

    fn cancel_where(&self, predicate: impl Fn(&Request) -> bool) -> usize {
        let cancelled: Vec<Request> = {
            let mut requests = self.inner.requests.lock();
            let (cancelled, kept): (VecDeque<Request>, VecDeque<Request>) =
                requests.drain(..).partition(|r| predicate(r));
            *requests = kept;
            cancelled.into()
        };
        let count = cancelled.len();
        for request in cancelled {
            let _ = request.done.send(Err(CoreError::InvalidArgument(format!(
                "{} on axis {} cancelled",
                request.motion, request.axis
            ))));
        }
        count
    }

    /// Cancel queued requests and stop the supervisor once the running
    /// motion (if any) has finished.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.cancel_all();
        self.inner.wake.notify_one();
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Motion supervisor ended abnormally");
            }
        }
    }
}

impl Drop for MotionQueue {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }
}

async fn supervise(inner: Arc<QueueInner>, control: Arc<dyn MotionControl>) {
    tracing::debug!(instrument = %control.instrument(), "Motion supervisor started");
    loop {
        let next = {
            let mut requests = inner.requests.lock();
            let next = requests.pop_front();
            if let Some(request) = &next {
                *inner.moving.lock() = Some((request.axis, request.motion));
            }
            next
        };
        let Some(request) = next else {
            if inner.closed.load(Ordering::SeqCst) {
                break;
            }
            inner.wake.notified().await;
            continue;
        };

        let result = drive(
            &inner,
            control.as_ref(),
            request.axis,
            request.motion,
            request.check.as_ref(),
        )
        .await;
        *inner.moving.lock() = None;
        if let Err(e) = &result {
            tracing::warn!(
                instrument = %control.instrument(),
                axis = request.axis,
                motion = %request.motion,
                error = %e,
                "Motion failed"
            );
        }
        let _ = request.done.send(result);
    }
    tracing::debug!(instrument = %control.instrument(), "Motion supervisor stopped");
}

async fn drive(
    inner: &QueueInner,
    control: &dyn MotionControl,
    axis: u8,
    motion: Motion,
    check: Option<&TargetCheck>,
) -> CoreResult<()> {
    let motion = resolve(control, axis, motion, check).await?;
    *inner.moving.lock() = Some((axis, motion));
    control.start(axis, motion).await?;
    tracing::info!(instrument = %control.instrument(), axis, %motion, "Motion started");
    let deadline = Instant::now() + inner.motion_timeout;
    loop {
        tokio::time::sleep(inner.poll_interval).await;
        if control.is_idle(axis, motion).await? {
            tracing::info!(instrument = %control.instrument(), axis, "Motion finished");
            return Ok(());
        }
        if Instant::now() >= deadline {
            if let Err(e) = control.stop(axis).await {
                tracing::error!(axis, error = %e, "Cannot stop axis after motion timeout");
            }
            return Err(CoreError::timeout(
                control.instrument(),
                format!("axis {axis} to {motion}"),
                inner.motion_timeout,
            ));
        }
    }
}

async fn resolve(
    control: &dyn MotionControl,
    axis: u8,
    motion: Motion,
    check: Option<&TargetCheck>,
) -> CoreResult<Motion> {
    let Some(check) = check else {
        return Ok(motion);
    };
    match motion {
        Motion::Absolute(target) => check(i64::from(target)).map(Motion::Absolute),
        Motion::Relative(distance) => {
            let from = control.position(axis).await?;
            let target = check(i64::from(from) + i64::from(distance))?;
            tracing::debug!(axis, from, target, "Relative move resolved");
            Ok(Motion::Absolute(target))
        }
        Motion::RotateRight(_) | Motion::RotateLeft(_) => Ok(motion),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Controller whose moves take a fixed number of polls.
    struct FakeController {
        polls_per_move: usize,
        remaining: Mutex<Option<(u8, usize)>>,
        started: Mutex<Vec<(u8, Motion)>>,
        positions: Mutex<[i32; 4]>,
        overlaps: AtomicUsize,
        stopped: Mutex<Vec<u8>>,
    }

    impl FakeController {
        fn new(polls_per_move: usize) -> Arc<Self> {
            Arc::new(Self {
                polls_per_move,
                remaining: Mutex::new(None),
                started: Mutex::new(Vec::new()),
                positions: Mutex::new([0; 4]),
                overlaps: AtomicUsize::new(0),
                stopped: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MotionControl for FakeController {
        fn instrument(&self) -> &str {
            "fake"
        }

        async fn start(&self, axis: u8, motion: Motion) -> CoreResult<()> {
            let mut remaining = self.remaining.lock();
            if remaining.is_some() {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            if let Motion::Absolute(p) = motion {
                if p < 0 {
                    return Err(CoreError::rejected("fake", "invalid value"));
                }
            }
            *remaining = Some((axis, self.polls_per_move));
            self.started.lock().push((axis, motion));
            let mut positions = self.positions.lock();
            match motion {
                Motion::Absolute(p) => positions[usize::from(axis)] = p,
                Motion::Relative(d) => positions[usize::from(axis)] += d,
                _ => {}
            }
            Ok(())
        }

        async fn position(&self, axis: u8) -> CoreResult<i32> {
            Ok(self.positions.lock()[usize::from(axis)])
        }

        async fn is_idle(&self, axis: u8, _motion: Motion) -> CoreResult<bool> {
            let mut remaining = self.remaining.lock();
            match remaining.as_mut() {
                Some((moving, polls)) if *moving == axis => {
                    if *polls == 0 {
                        *remaining = None;
                        Ok(true)
                    } else {
                        *polls -= 1;
                        Ok(false)
                    }
                }
                _ => Ok(true),
            }
        }

        async fn stop(&self, axis: u8) -> CoreResult<()> {
            self.stopped.lock().push(axis);
            *self.remaining.lock() = None;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_requests_run_one_at_a_time_in_order() {
        let controller = FakeController::new(3);
        let queue = MotionQueue::spawn(
            controller.clone(),
            Duration::from_millis(5),
            Duration::from_secs(5),
        );

        let first = queue.submit(0, Motion::Absolute(100));
        let second = queue.submit(1, Motion::Relative(-20));
        let third = queue.submit(0, Motion::Absolute(0));
        assert_eq!(first.axis(), 0);

        first.finished().await.unwrap();
        second.finished().await.unwrap();
        third.finished().await.unwrap();

        assert_eq!(
            controller.started.lock().clone(),
            vec![
                (0, Motion::Absolute(100)),
                (1, Motion::Relative(-20)),
                (0, Motion::Absolute(0)),
            ]
        );
        assert_eq!(controller.overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(queue.moving(), None);
        queue.shutdown().await;
    }

    fn at_most(limit: i64) -> TargetCheck {
        Box::new(move |target| {
            if target > limit {
                Err(CoreError::InvalidArgument(format!("{target} above {limit}")))
            } else {
                Ok(i32::try_from(target).unwrap_or(i32::MAX))
            }
        })
    }

    #[tokio::test]
    async fn test_checked_relative_move_resolved_after_queued_moves() {
        let controller = FakeController::new(2);
        let queue = MotionQueue::spawn(
            controller.clone(),
            Duration::from_millis(5),
            Duration::from_secs(5),
        );

        let first = queue.submit_checked(0, Motion::Absolute(1000), at_most(1000));
        let too_far = queue.submit_checked(0, Motion::Relative(500), at_most(1000));
        let back = queue.submit_checked(0, Motion::Relative(-200), at_most(1000));

        first.finished().await.unwrap();
        let err = too_far.finished().await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
        back.finished().await.unwrap();

        assert_eq!(
            controller.started.lock().clone(),
            vec![(0, Motion::Absolute(1000)), (0, Motion::Absolute(800))]
        );
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_axis_waits_while_first_moves() {
        let controller = FakeController::new(20);
        let queue = MotionQueue::spawn(
            controller.clone(),
            Duration::from_millis(5),
            Duration::from_secs(5),
        );

        let first = queue.submit(0, Motion::Absolute(500));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = queue.submit(1, Motion::Absolute(10));

        assert_eq!(queue.moving(), Some((0, Motion::Absolute(500))));
        assert_eq!(queue.queued(), vec![(1, Motion::Absolute(10))]);

        first.finished().await.unwrap();
        second.finished().await.unwrap();
        assert_eq!(controller.overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_axis_fails_only_its_requests() {
        let controller = FakeController::new(20);
        let queue = MotionQueue::spawn(
            controller.clone(),
            Duration::from_millis(5),
            Duration::from_secs(5),
        );

        let running = queue.submit(0, Motion::Absolute(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let cancelled = queue.submit(1, Motion::Absolute(2));
        let kept = queue.submit(0, Motion::Absolute(3));

        assert_eq!(queue.cancel_axis(1), 1);
        assert!(cancelled.finished().await.is_err());
        running.finished().await.unwrap();
        kept.finished().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_does_not_block_the_queue() {
        let controller = FakeController::new(1);
        let queue = MotionQueue::spawn(
            controller.clone(),
            Duration::from_millis(5),
            Duration::from_secs(5),
        );

        let bad = queue.submit(0, Motion::Absolute(-1));
        let good = queue.submit(0, Motion::Absolute(1));
        let err = bad.finished().await.unwrap_err();
        assert!(matches!(err, CoreError::DeviceRejected { .. }));
        good.finished().await.unwrap();
    }

    #[tokio::test]
    async fn test_motion_timeout_stops_the_axis() {
        let controller = FakeController::new(usize::MAX);
        let queue = MotionQueue::spawn(
            controller.clone(),
            Duration::from_millis(5),
            Duration::from_millis(40),
        );

        let err = queue.run(2, Motion::RotateRight(1000)).await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
        assert_eq!(controller.stopped.lock().clone(), vec![2]);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_requests() {
        let controller = FakeController::new(1);
        let queue = MotionQueue::spawn(controller, Duration::from_millis(5), Duration::from_secs(1));
        queue.shutdown().await;
        assert!(queue.run(0, Motion::Absolute(1)).await.is_err());
    }
}
