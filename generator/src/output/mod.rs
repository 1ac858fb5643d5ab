//! Interval and summary status output.
//!
//! The TCP and UDP status views differ only in columns and labels, so they
//! are a sum type over one rendering routine rather than two printers. The
//! writer samples the engine counters and prints per-interval deltas; the
//! summary prints the historic totals at exit.

pub mod format;

use std::time::Instant;

use engine::metrics;
use engine::settings::Protocol;

use crate::config::OutputFormat;
use format::{format_bits, format_bytes, format_rate, pad};

const COL_WIDTH: usize = 10;

/// Which column set to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusColumns {
    Tcp,
    Udp,
}

impl StatusColumns {
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => StatusColumns::Tcp,
            Protocol::Udp => StatusColumns::Udp,
        }
    }

    fn headers(self) -> &'static [&'static str] {
        match self {
            StatusColumns::Tcp => &[
                "TimeSlice", "SendBps", "RecvBps", "In-Flight", "Completed", "NetError",
                "DataError",
            ],
            StatusColumns::Udp => &[
                "TimeSlice", "Bits/Sec", "Streams", "Completed", "Dropped", "Repeated", "Errors",
            ],
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Snapshot {
    bytes_sent: u64,
    bytes_recv: u64,
    completed: u64,
    net_errors: u64,
    proto_errors: u64,
    frames_successful: u64,
    frames_dropped: u64,
    frames_duplicate: u64,
    frames_error: u64,
}

fn snapshot() -> Snapshot {
    Snapshot {
        bytes_sent: metrics::BYTES_SENT.value(),
        bytes_recv: metrics::BYTES_RECV.value(),
        completed: metrics::CONNECTIONS_COMPLETED.value(),
        net_errors: metrics::CONNECTION_ERRORS.value(),
        proto_errors: metrics::PROTOCOL_ERRORS.value(),
        frames_successful: metrics::FRAMES_SUCCESSFUL.value(),
        frames_dropped: metrics::FRAMES_DROPPED.value(),
        frames_duplicate: metrics::FRAMES_DUPLICATE.value(),
        frames_error: metrics::FRAMES_ERROR.value(),
    }
}

pub struct StatusWriter {
    columns: StatusColumns,
    format: OutputFormat,
    start: Instant,
    last: Snapshot,
    last_time: Instant,
}

impl StatusWriter {
    pub fn new(columns: StatusColumns, format: OutputFormat) -> Self {
        let now = Instant::now();
        Self {
            columns,
            format,
            start: now,
            last: snapshot(),
            last_time: now,
        }
    }

    /// Describe the columns once at startup. CSV output skips the legend.
    pub fn print_legend(&self) {
        if self.format == OutputFormat::Csv {
            return;
        }
        match self.columns {
            StatusColumns::Tcp => {
                println!("Legend: rates are bytes/sec over the interval; errors are per-interval counts");
            }
            StatusColumns::Udp => {
                println!("Legend: Bits/Sec over the interval; frame counts are per-interval");
            }
        }
    }

    pub fn print_header(&self) {
        let headers = self.columns.headers();
        match self.format {
            OutputFormat::Csv => println!("{}", headers.join(",")),
            OutputFormat::Console => {
                let row: Vec<String> = headers.iter().map(|h| pad(h, COL_WIDTH)).collect();
                println!("{}", row.join(" "));
            }
        }
    }

    /// Print one interval row from the counter deltas since the last call.
    pub fn print_interval(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_time).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let current = snapshot();
        let time_slice = now.duration_since(self.start).as_secs_f64();

        let cells: Vec<String> = match self.columns {
            StatusColumns::Tcp => {
                let send_rate = (current.bytes_sent - self.last.bytes_sent) as f64 / elapsed;
                let recv_rate = (current.bytes_recv - self.last.bytes_recv) as f64 / elapsed;
                let in_flight = metrics::CONNECTIONS_ACTIVE.value().max(0);
                vec![
                    format!("{time_slice:.3}"),
                    format_rate(send_rate),
                    format_rate(recv_rate),
                    in_flight.to_string(),
                    (current.completed - self.last.completed).to_string(),
                    (current.net_errors - self.last.net_errors).to_string(),
                    (current.proto_errors - self.last.proto_errors).to_string(),
                ]
            }
            StatusColumns::Udp => {
                let bits = (current.bytes_recv + current.bytes_sent
                    - self.last.bytes_recv
                    - self.last.bytes_sent) as f64
                    * 8.0
                    / elapsed;
                let streams = metrics::CONNECTIONS_ACTIVE.value().max(0);
                vec![
                    format!("{time_slice:.3}"),
                    format_bits(bits),
                    streams.to_string(),
                    (current.frames_successful - self.last.frames_successful).to_string(),
                    (current.frames_dropped - self.last.frames_dropped).to_string(),
                    (current.frames_duplicate - self.last.frames_duplicate).to_string(),
                    (current.frames_error - self.last.frames_error).to_string(),
                ]
            }
        };

        match self.format {
            OutputFormat::Csv => println!("{}", cells.join(",")),
            OutputFormat::Console => {
                let row: Vec<String> = cells.iter().map(|c| pad(c, COL_WIDTH)).collect();
                println!("{}", row.join(" "));
            }
        }

        self.last = current;
        self.last_time = now;
    }
}

/// Print the historic totals for the whole run.
pub fn print_summary(protocol: Protocol, elapsed_ms: u128) {
    let totals = snapshot();
    println!();
    println!("  Historic Connection Statistics (all connections over the complete lifetime)");
    println!("-------------------------------------------------------------------------------");
    println!(
        "  SuccessfulConnections [{}]   NetworkErrors [{}]   ProtocolErrors [{}]",
        totals.completed, totals.net_errors, totals.proto_errors
    );
    match protocol {
        Protocol::Tcp => {
            println!();
            println!("  Total Bytes Recv : {}", format_bytes(totals.bytes_recv));
            println!("  Total Bytes Sent : {}", format_bytes(totals.bytes_sent));
        }
        Protocol::Udp => {
            let frames = totals.frames_successful
                + totals.frames_dropped
                + totals.frames_duplicate
                + totals.frames_error;
            let pct = |n: u64| {
                if frames > 0 {
                    n as f64 / frames as f64 * 100.0
                } else {
                    0.0
                }
            };
            println!();
            println!("  Total Bytes Recv : {}", format_bytes(totals.bytes_recv));
            println!(
                "  Total Successful Frames : {} ({:.3})",
                totals.frames_successful,
                pct(totals.frames_successful)
            );
            println!(
                "  Total Dropped Frames : {} ({:.3})",
                totals.frames_dropped,
                pct(totals.frames_dropped)
            );
            println!(
                "  Total Duplicate Frames : {} ({:.3})",
                totals.frames_duplicate,
                pct(totals.frames_duplicate)
            );
            println!(
                "  Total Error Frames : {} ({:.3})",
                totals.frames_error,
                pct(totals.frames_error)
            );
        }
    }
    println!("  Total Time : {elapsed_ms} ms.");
}

/// The process exit code: the error count, saturated to the int range.
pub fn exit_code() -> i32 {
    let errors = metrics::CONNECTION_ERRORS.value() + metrics::PROTOCOL_ERRORS.value();
    errors.min(i32::MAX as u64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_sets_match_protocol() {
        assert_eq!(
            StatusColumns::for_protocol(Protocol::Tcp),
            StatusColumns::Tcp
        );
        assert_eq!(
            StatusColumns::for_protocol(Protocol::Udp),
            StatusColumns::Udp
        );
    }

    #[test]
    fn tcp_and_udp_render_the_same_column_count() {
        assert_eq!(
            StatusColumns::Tcp.headers().len(),
            StatusColumns::Udp.headers().len()
        );
    }
}
