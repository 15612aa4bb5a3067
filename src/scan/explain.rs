//! EXPLAIN output for a scan.

use std::fmt::Write as _;

use crate::scan::GpuScan;
use crate::transpiler::Expr;
use crate::types::Schema;

fn join(exprs: &[Expr], schema: &Schema, sep: &str) -> String {
    exprs
        .iter()
        .map(|e| e.display(schema).to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

impl GpuScan {
    /// Describe the scan: where each qual and target runs, what the filters
    /// removed so far, and with `verbose` the generated kernel source.
    pub fn explain(&self, verbose: bool) -> String {
        let plan = &self.plan;
        let input = plan.input_schema();
        let mut lines = Vec::new();

        let columns: Vec<&str> = input.fields().iter().map(|f| f.name.as_str()).collect();
        lines.push(format!("{} on ({})", plan.variant(), columns.join(", ")));
        let device = match &self.orchestrator {
            Some(o) => o.context().device.name(),
            None if !self.config.enable_device => "disabled".to_string(),
            None => "host only".to_string(),
        };
        lines.push(format!("Device: {device}"));
        if !plan.device_quals().is_empty() {
            lines.push(format!("Device Filter: {}", join(plan.device_quals(), input, " AND ")));
        }
        if !plan.host_quals().is_empty() {
            lines.push(format!("Host Filter: {}", join(plan.host_quals(), plan.scan_schema(), " AND ")));
        }
        if let Some(p) = plan.projection() {
            lines.push(format!("Device Projection: {}", join(&p.scan_tlist, input, ", ")));
            lines.push(format!("Output: {}", join(&p.final_tlist, &p.scan_schema, ", ")));
        }
        let stats = self.stats();
        if !plan.device_quals().is_empty() {
            lines.push(format!("Rows Removed by Device Filter: {}", stats.rows_removed_by_device_filter));
        }
        if !plan.host_quals().is_empty() {
            lines.push(format!("Rows Removed by Host Filter: {}", stats.rows_removed_by_host_filter));
        }
        if stats.rows_rechecked > 0 {
            lines.push(format!("Rows Rechecked: {}", stats.rows_rechecked));
        }
        let program = plan.program();
        lines.push(format!("Extra: {}", program.extra_flags()));
        if verbose {
            match &self.orchestrator {
                Some(o) => lines.push(format!("Program: {:016x} (loaded)", o.signature())),
                None => lines.push(format!("Program: {:016x}", program.signature())),
            }
        }
        if self.config.perfmon {
            lines.extend(self.perf.lines());
        }

        let mut out = String::new();
        for (i, line) in lines.iter().enumerate() {
            let indent = if i == 0 { "" } else { "  " };
            let _ = writeln!(out, "{indent}{line}");
        }
        if verbose {
            out.push_str("  Kernel Source:\n");
            for line in program.full_source().lines() {
                let _ = writeln!(out, "    {line}");
            }
        }
        out
    }
}
