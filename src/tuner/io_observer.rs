//! I/O state observer
//!
//! Samples the data device with `iostat -x 1` for up to a minute, derives
//! the current and inferred-maximum I/O rate, and publishes the result on
//! a watch channel. Consumers keep their own copy; delivery is
//! latest-value-wins per listener.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::TunerService;
use crate::error::{Error, Result};

/// How long one iostat invocation samples the device
const IOSTAT_RUN_SECS: u64 = 60;

/// How many of the busiest samples feed the maximum-speed estimate
const MAX_SPEED_SAMPLES: usize = 10;

/// Summarised device I/O rates in operations per second
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IoState {
    pub current_io_speed: f64,
    pub max_io_speed: f64,
}

/// One parsed `iostat -x` device line
#[derive(Debug, Clone, Copy, PartialEq)]
struct IoSample {
    rs: f64,
    ws: f64,
    util: f64,
}

impl TunerService {
    /// Run one observation cycle and broadcast the result on success
    pub(crate) async fn infer_io_state(&self, token: &CancellationToken) {
        let Some(device) = &self.device else {
            return;
        };

        let output = match run_iostat(&device.kernel_name, token).await {
            Ok(Some(output)) => output,
            Ok(None) => return,
            Err(err) => {
                tracing::error!(error = %err, "observing device i/o failed");
                return;
            }
        };

        let samples = parse_samples(&output, &device.kernel_name);
        let Some(state) = derive_io_state(samples) else {
            return;
        };

        tracing::debug!(
            current_io_speed = state.current_io_speed,
            max_io_speed = state.max_io_speed,
            "device i/o state updated"
        );
        self.io_tx.send_replace(Some(state));
    }
}

/// Capture `iostat -x 1 <device>` output; the process is killed after
/// `IOSTAT_RUN_SECS` and whatever was captured is returned. Returns
/// `None` on cancellation.
async fn run_iostat(device: &str, token: &CancellationToken) -> Result<Option<String>> {
    let mut child = Command::new("iostat")
        .args(["-x", "1", device])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| Error::Subprocess(format!("starting iostat failed: {err}")))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Subprocess("iostat stdout unavailable".to_string()))?;
    let reader = tokio::spawn(async move {
        let mut buf = String::new();
        let _ = stdout.read_to_string(&mut buf).await;
        buf
    });

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(IOSTAT_RUN_SECS)) => {
            if let Err(err) = child.kill().await {
                tracing::warn!(error = %err, "killing timed-out iostat failed");
            }
        }
        _ = token.cancelled() => {
            let _ = child.kill().await;
            return Ok(None);
        }
        status = child.wait() => {
            match status {
                // A clean early exit still carries usable samples.
                Ok(status) if status.success() => {}
                Ok(status) => {
                    return Err(Error::Subprocess(format!(
                        "iostat exited before the sampling window: {status}"
                    )));
                }
                Err(err) => {
                    return Err(Error::Subprocess(format!("waiting for iostat failed: {err}")));
                }
            }
        }
    }

    Ok(Some(reader.await.unwrap_or_default()))
}

/// Extract the device's sample lines. An `iostat -x` device line carries
/// 16 whitespace-separated fields: r/s is field 1, w/s field 2 and %util
/// the last.
fn parse_samples(output: &str, device: &str) -> Vec<IoSample> {
    let mut samples = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if !line.starts_with(device) {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 16 {
            continue;
        }

        let (rs, ws, util) = match (
            parts[1].parse::<f64>(),
            parts[2].parse::<f64>(),
            parts[15].parse::<f64>(),
        ) {
            (Ok(rs), Ok(ws), Ok(util)) => (rs, ws, util),
            _ => {
                tracing::warn!(line, "parsing iostat output failed");
                continue;
            }
        };

        samples.push(IoSample { rs, ws, util });
    }

    samples
}

/// Current speed comes from the newest sample; maximum speed is the
/// utilisation-weighted extrapolation of the busiest samples.
fn derive_io_state(mut samples: Vec<IoSample>) -> Option<IoState> {
    let last = samples.last()?;
    let current_io_speed = last.rs + last.ws;

    samples.sort_by(|a, b| {
        b.util
            .partial_cmp(&a.util)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut total_speed = 0.0;
    let mut total_util = 0.0;
    for sample in samples.iter().take(MAX_SPEED_SAMPLES) {
        total_speed += sample.rs + sample.ws;
        total_util += sample.util;
    }

    if total_util == 0.0 || total_speed == 0.0 {
        return None;
    }

    Some(IoState {
        current_io_speed,
        max_io_speed: total_speed / total_util * 100.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_line(device: &str, rs: f64, ws: f64, util: f64) -> String {
        format!(
            "{device} {rs:.2} {ws:.2} 512.00 128.00 0.00 0.00 0.00 0.00 0.40 \
             0.30 0.01 12.00 4.00 0.20 {util:.2}"
        )
    }

    #[test]
    fn test_parse_samples() {
        let output = format!(
            "Linux 6.1.0 (db1)\n\n\
             Device r/s w/s rkB/s wkB/s rrqm/s wrqm/s %rrqm %wrqm r_await w_await aqu-sz rareq-sz wareq-sz svctm %util\n\
             {}\n\
             nvme1n1 1.00 1.00 4.00 4.00 0.00 0.00 0.00 0.00 0.10 0.10 0.00 4.00 4.00 0.10 1.00\n\
             {}\n",
            device_line("nvme0n1", 100.0, 50.0, 40.0),
            device_line("nvme0n1", 200.0, 100.0, 80.0),
        );

        let samples = parse_samples(&output, "nvme0n1");
        assert_eq!(
            samples,
            vec![
                IoSample { rs: 100.0, ws: 50.0, util: 40.0 },
                IoSample { rs: 200.0, ws: 100.0, util: 80.0 },
            ]
        );
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        // Too few fields, then sixteen fields with a non-numeric column.
        let output = "sda 1.00 2.00\nsda x y 0 0 0 0 0 0 0 0 0 0 0 0 0\n";
        assert!(parse_samples(output, "sda").is_empty());
    }

    #[test]
    fn test_derive_io_state() {
        let samples = vec![
            IoSample { rs: 100.0, ws: 50.0, util: 40.0 },
            IoSample { rs: 200.0, ws: 100.0, util: 80.0 },
            IoSample { rs: 10.0, ws: 10.0, util: 5.0 },
        ];

        let state = derive_io_state(samples).unwrap();
        assert_eq!(state.current_io_speed, 20.0);
        // (300 + 150 + 20) / (80 + 40 + 5) * 100
        let want = 470.0 / 125.0 * 100.0;
        assert!((state.max_io_speed - want).abs() < 1e-9);
        assert!(state.max_io_speed >= state.current_io_speed);
    }

    #[test]
    fn test_derive_empty_or_idle() {
        assert_eq!(derive_io_state(Vec::new()), None);

        let idle = vec![IoSample { rs: 0.0, ws: 0.0, util: 0.0 }];
        assert_eq!(derive_io_state(idle), None);
    }
}
