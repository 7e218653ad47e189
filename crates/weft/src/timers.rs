use bitflags::bitflags;

use crate::Manager;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TimerFlags: u8 {
        /// Rearm after firing.
        const REPEAT     = 1 << 0;
        /// Fire once on the first poll even if not yet due.
        const RUN_NOW    = 1 << 1;
        /// Set after the first invocation.
        const CALLED     = 1 << 2;
        /// Remove the timer once it has fired (one-shots).
        const AUTODELETE = 1 << 3;
    }
}

pub(crate) struct Timer {
    pub id: u64,
    pub period_ms: u64,
    pub expire_ms: u64,
    pub flags: TimerFlags,
    pub cb: Option<Box<dyn FnMut(&mut Manager)>>,
}

#[derive(Default)]
pub(crate) struct Timers {
    pub list: Vec<Timer>,
    pub next_id: u64,
}

/// Deadline arithmetic shared by the wheel and the TCP timers.
///
/// First call arms `expire = now + period`; a clock wrap resets it. On
/// expiry the deadline advances by one period, or snaps to `now + period`
/// when more than one whole period behind (catch-up is capped at one).
pub fn timer_expired(expire: &mut u64, period: u64, now: u64) -> bool {
    if now + period < *expire {
        *expire = 0;
    }
    if *expire == 0 {
        *expire = now + period;
    }
    if *expire > now {
        return false;
    }
    *expire = if now - *expire > period { now + period } else { *expire + period };
    true
}

impl Timers {
    pub fn add(&mut self, period_ms: u64, flags: TimerFlags, cb: Box<dyn FnMut(&mut Manager)>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.list.push(Timer { id, period_ms, expire_ms: 0, flags, cb: Some(cb) });
        id
    }

    pub fn del(&mut self, id: u64) {
        self.list.retain(|t| t.id != id);
    }

    /// Nearest deadline, for bounding the poll wait.
    pub fn next_deadline(&self, now: u64) -> Option<u64> {
        self.list
            .iter()
            .filter(|t| t.flags.contains(TimerFlags::REPEAT) || !t.flags.contains(TimerFlags::CALLED))
            .map(|t| if t.expire_ms == 0 { now } else { t.expire_ms })
            .min()
    }
}

impl Manager {
    /// Registers a timer; the callback runs at the top of `poll`.
    /// Callbacks may add or delete timers.
    pub fn add_timer<F>(&mut self, period_ms: u64, flags: TimerFlags, cb: F) -> u64
    where
        F: FnMut(&mut Manager) + 'static,
    {
        self.timers.add(period_ms, flags, Box::new(cb))
    }

    pub fn del_timer(&mut self, id: u64) {
        self.timers.del(id);
    }

    pub(crate) fn run_timers(&mut self, now: u64) {
        // Entries added by callbacks run next cycle; index walk tolerates
        // deletion (only the current slot's cb is detached at a time).
        let mut i = 0;
        while i < self.timers.list.len() {
            let t = &mut self.timers.list[i];
            let due = (t.flags.contains(TimerFlags::RUN_NOW) && !t.flags.contains(TimerFlags::CALLED))
                || timer_expired(&mut t.expire_ms, t.period_ms, now);
            let fire = due && (t.flags.contains(TimerFlags::REPEAT) || !t.flags.contains(TimerFlags::CALLED));
            if fire {
                t.flags.insert(TimerFlags::CALLED);
                let id = t.id;
                let mut cb = t.cb.take();
                if let Some(f) = &mut cb {
                    f(self);
                }
                // The callback may have deleted (or added) timers; find
                // the slot again before restoring.
                if let Some(t) = self.timers.list.iter_mut().find(|t| t.id == id) {
                    t.cb = cb;
                    if t.flags.contains(TimerFlags::AUTODELETE) && !t.flags.contains(TimerFlags::REPEAT)
                    {
                        self.timers.del(id);
                        continue; // slot replaced, do not advance
                    }
                }
            }
            i += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_poll_arms() {
        let mut exp = 0;
        assert!(!timer_expired(&mut exp, 100, 1000));
        assert_eq!(exp, 1100);
    }

    #[test]
    fn fires_and_rearms() {
        let mut exp = 0;
        assert!(!timer_expired(&mut exp, 100, 0));
        assert!(timer_expired(&mut exp, 100, 100));
        assert_eq!(exp, 200);
    }

    #[test]
    fn catches_up_at_most_one_period() {
        let mut exp = 200;
        // Way behind schedule: snap to now + period instead of stepping
        assert!(timer_expired(&mut exp, 100, 1000));
        assert_eq!(exp, 1100);
    }

    #[test]
    fn clock_wrap_resets() {
        let mut exp = u64::MAX - 10;
        assert!(timer_expired(&mut exp, 100, 5));
        assert_eq!(exp, 105);
    }
}
