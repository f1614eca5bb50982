use chrono::{DateTime, Duration, Local};

/// Full property reports are requested this often once the serial is known.
pub const REQUEST_ALL_INTERVAL_SECS: i64 = 30 * 60;
/// Retry interval while the device has not told us its serial.
pub const SERIAL_RETRY_SECS: i64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timer {
    Control,
    RequestAll,
}

/// Wall-clock deadlines of the event loop.
#[derive(Debug)]
pub struct Scheduler {
    loop_period: Duration,
    next_control: Option<DateTime<Local>>,
    boundary: Option<DateTime<Local>>,
    next_request_all: Option<DateTime<Local>>,
}

impl Scheduler {
    pub fn new(loop_period: Duration) -> Self {
        Self {
            loop_period,
            next_control: None,
            boundary: None,
            next_request_all: None,
        }
    }

    pub fn start(&mut self, now: DateTime<Local>, serial_known: bool) {
        self.next_control = Some(now + self.loop_period);
        self.schedule_request_all(now, serial_known);
    }

    pub fn schedule_request_all(&mut self, now: DateTime<Local>, serial_known: bool) {
        let delay = if serial_known {
            REQUEST_ALL_INTERVAL_SECS
        } else {
            SERIAL_RETRY_SECS
        };
        self.next_request_all = Some(now + Duration::seconds(delay));
    }

    /// Extra control tick at a policy boundary, so phase changes do not wait for the
    /// next periodic tick.
    pub fn set_boundary(&mut self, boundary: Option<DateTime<Local>>) {
        self.boundary = boundary;
    }

    /// Returns the timers that fired at or before `now`. A control tick restarts the
    /// periodic schedule; a full-report request has to be rescheduled by the caller.
    pub fn due(&mut self, now: DateTime<Local>) -> Vec<Timer> {
        let mut due = Vec::new();
        let periodic = self.next_control.is_some_and(|at| at <= now);
        let boundary = self.boundary.is_some_and(|at| at <= now);
        if periodic || boundary {
            due.push(Timer::Control);
            self.boundary = None;
            if periodic || self.next_control.is_none() {
                self.next_control = Some(now + self.loop_period);
            }
        }
        if self.next_request_all.is_some_and(|at| at <= now) {
            due.push(Timer::RequestAll);
            self.next_request_all = None;
        }
        due
    }

    pub fn next_deadline(&self) -> Option<DateTime<Local>> {
        [self.next_control, self.boundary, self.next_request_all]
            .into_iter()
            .flatten()
            .min()
    }
}
