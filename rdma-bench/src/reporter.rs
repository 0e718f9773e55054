use crate::Result;
use crate::stats::{Collector, StopFlag};
use chrono::{DateTime, Local};
use std::hint;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, trace};

/// Wake-ups later than this past the boundary are logged.
const WAKE_SLACK: Duration = Duration::from_millis(1);

/// Prints one line per wall-clock second for `ticks` seconds, then raises the
/// stop flag.
pub struct Reporter<C, W> {
    collector: Arc<C>,
    ticks: u64,
    stop: StopFlag,
    out: W,
}

impl<C: Collector, W: Write> Reporter<C, W> {
    pub fn new(collector: Arc<C>, ticks: u64, stop: StopFlag, out: W) -> Self {
        Self {
            collector,
            ticks,
            stop,
            out,
        }
    }

    /// Returns the number of lines printed. The stop flag is raised on every
    /// exit path; an already raised flag ends the run early.
    #[instrument(skip_all, name = "Reporter::run", err, fields(ticks = self.ticks))]
    pub fn run(mut self) -> Result<u64> {
        let result = self.report();
        self.stop.raise();
        result
    }

    fn report(&mut self) -> Result<u64> {
        let mut second = unix_seconds(SystemTime::now());
        let mut printed = 0;
        while printed < self.ticks {
            let Some(now) = wait_for_second(&mut second, &self.stop) else {
                debug!(printed, "stopped before the last tick");
                break;
            };
            let snapshot = self.collector.snapshot();
            writeln!(self.out, "{}\t{snapshot}", format_timestamp(now))?;
            self.out.flush()?;
            printed += 1;
        }
        Ok(printed)
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Spins until the clock crosses into a second other than `second`, updating
/// it. Returns `None` once `stop` is raised.
fn wait_for_second(second: &mut u64, stop: &StopFlag) -> Option<SystemTime> {
    loop {
        if stop.is_raised() {
            return None;
        }
        let now = SystemTime::now();
        let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
        if since_epoch.as_secs() != *second {
            if since_epoch.subsec_nanos() >= WAKE_SLACK.as_nanos() as u32 {
                trace!(late_ns = since_epoch.subsec_nanos(), "late wake-up");
            }
            *second = since_epoch.as_secs();
            return Some(now);
        }
        hint::spin_loop();
    }
}

/// `dd.mm.yy HH:MM:SS.nnnnnnnnn` in local time.
pub fn format_timestamp(time: SystemTime) -> String {
    let local: DateTime<Local> = time.into();
    let nanos = time.duration_since(UNIX_EPOCH).unwrap_or_default().subsec_nanos();
    format!("{}.{nanos:09}", local.format("%d.%m.%y %X"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{LatencySamples, ThroughputCounter};

    #[test]
    fn timestamp_has_nanosecond_suffix() {
        let time = UNIX_EPOCH + Duration::new(1_700_000_000, 1_234);
        let stamp = format_timestamp(time);
        let (date_time, nanos) = stamp.rsplit_once('.').unwrap();
        assert_eq!(nanos, "000001234");
        // dd.mm.yy HH:MM:SS
        assert_eq!(date_time.len(), 17);
        assert_eq!(&date_time[2..3], ".");
        assert_eq!(&date_time[8..9], " ");
        assert_eq!(&date_time[11..12], ":");
    }

    #[test]
    fn one_tick_then_stop() {
        let counter = Arc::new(ThroughputCounter::new());
        counter.add(5);
        let stop = StopFlag::new();
        let mut out = Vec::new();

        let printed = Reporter::new(counter.clone(), 1, stop.clone(), &mut out).run().unwrap();

        assert_eq!(printed, 1);
        assert!(stop.is_raised());
        let out = String::from_utf8(out).unwrap();
        assert!(out.ends_with("\t5 ops/sec\n"), "{out:?}");
        assert_eq!(out.lines().count(), 1);
        assert_eq!(counter.take(), 0);
    }

    #[test]
    fn wakes_on_distinct_seconds() {
        let samples = Arc::new(LatencySamples::with_cap(16));
        samples.push(100);
        let mut out = Vec::new();

        Reporter::new(samples, 2, StopFlag::new(), &mut out).run().unwrap();

        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("\t100 ns median\t100.0 ns mean\t1 samples"), "{lines:?}");
        assert!(lines[1].ends_with("\tno samples"), "{lines:?}");
        let seconds: Vec<&str> = lines.iter().map(|l| &l[..17]).collect();
        assert_ne!(seconds[0], seconds[1]);
    }

    #[test]
    fn raised_flag_ends_early() {
        let stop = StopFlag::new();
        stop.raise();
        let mut out = Vec::new();
        let printed = Reporter::new(Arc::new(ThroughputCounter::new()), 10, stop, &mut out)
            .run()
            .unwrap();
        assert_eq!(printed, 0);
        assert!(out.is_empty());
    }
}
