//! Cumulative timing and transfer counters of one scan.
//!
//! Host-side times are measured around the calls that spend them; device
//! phase times come from the events each task records on its stream when
//! `ScanConfig::perfmon` is on.

use std::time::Duration;

use crate::scan::orchestrator::Submission;
use crate::scan::task::TaskTimings;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerfMon {
    pub num_tasks: u64,
    /// Reading chunks from the store.
    pub time_outer_load: Duration,
    /// Turning result chunks into rows.
    pub time_materialize: Duration,
    pub time_dma_send: Duration,
    pub time_kern_exec: Duration,
    pub time_dma_recv: Duration,
    pub bytes_dma_send: u64,
    pub bytes_dma_recv: u64,
    pub num_dma_send: u64,
    pub num_dma_recv: u64,
    pub num_kern_qual: u64,
    pub num_kern_proj: u64,
    /// Evaluating chunks on the host after a recheck request or a lost device.
    pub time_host_recheck: Duration,
}

fn ms(d: Duration) -> String {
    format!("{:.3} ms", d.as_secs_f64() * 1e3)
}

fn bytes(n: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

impl PerfMon {
    pub(crate) fn record_submission(&mut self, sub: &Submission) {
        self.num_tasks += 1;
        self.bytes_dma_send += sub.bytes_sent as u64;
        self.bytes_dma_recv += sub.bytes_recv as u64;
        self.num_dma_send += sub.num_sent as u64;
        self.num_dma_recv += sub.num_recv as u64;
        self.num_kern_qual += sub.quals_kernel as u64;
        self.num_kern_proj += sub.projection_kernel as u64;
    }

    pub(crate) fn record_timings(&mut self, t: &TaskTimings) {
        self.time_dma_send += t.dma_send;
        self.time_kern_exec += t.kern_exec;
        self.time_dma_recv += t.dma_recv;
    }

    /// EXPLAIN lines, without indentation.
    pub fn lines(&self) -> Vec<String> {
        vec![
            format!("Perfmon: tasks={}", self.num_tasks),
            format!("Time of outer load: {}", ms(self.time_outer_load)),
            format!("Time of materialize: {}", ms(self.time_materialize)),
            format!(
                "DMA send: {} calls, {}, {}",
                self.num_dma_send,
                bytes(self.bytes_dma_send),
                ms(self.time_dma_send)
            ),
            format!(
                "DMA recv: {} calls, {}, {}",
                self.num_dma_recv,
                bytes(self.bytes_dma_recv),
                ms(self.time_dma_recv)
            ),
            format!(
                "Kernel exec: quals {}, projection {}, {}",
                self.num_kern_qual,
                self.num_kern_proj,
                ms(self.time_kern_exec)
            ),
            format!("Time of host recheck: {}", ms(self.time_host_recheck)),
        ]
    }
}
