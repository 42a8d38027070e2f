//! Windowed event-rate counters, printed periodically by the dispatcher.

use std::collections::HashMap;

use log::info;

const EVENT_COUNT_WINDOW_S: u64 = 5;

#[derive(Debug, Default)]
pub struct TracerStats {
    pub event_count_begin_ns: u64,
    pub sched_switch_count: u64,
    pub sample_count: u64,
    pub uprobes_count: u64,
    pub gpu_events_count: u64,
    pub lost_count: u64,
    pub lost_count_per_buffer: HashMap<String, u64>,
}

impl TracerStats {
    pub fn reset(&mut self, now_ns: u64) {
        *self = TracerStats {
            event_count_begin_ns: now_ns,
            ..TracerStats::default()
        };
    }

    pub fn record_lost(&mut self, buffer_name: &str, lost: u64) {
        self.lost_count += lost;
        *self
            .lost_count_per_buffer
            .entry(buffer_name.to_string())
            .or_default() += lost;
    }

    /// Print rates and reset once the reporting window has elapsed.
    pub fn print_if_window_elapsed(&mut self, now_ns: u64) {
        if self.event_count_begin_ns + EVENT_COUNT_WINDOW_S * 1_000_000_000 >= now_ns {
            return;
        }
        let window_s = (now_ns - self.event_count_begin_ns) as f64 / 1e9;
        info!("Events per second (last {window_s:.1} s):");
        info!("  sched switches: {:.0}", self.sched_switch_count as f64 / window_s);
        info!("  samples: {:.0}", self.sample_count as f64 / window_s);
        info!("  u(ret)probes: {:.0}", self.uprobes_count as f64 / window_s);
        info!("  gpu events: {:.0}", self.gpu_events_count as f64 / window_s);
        info!("  lost: {:.0}, of which:", self.lost_count as f64 / window_s);
        for (name, lost) in &self.lost_count_per_buffer {
            info!("    from {name}: {:.0}", *lost as f64 / window_s);
        }
        self.reset(now_ns);
    }
}
