//! Shared utilities for the cxmctl tool.
//!
//! Connection to the local daemon socket, request framing and formatting
//! helpers used by every subcommand.

use std::path::Path;

use cxm_core::net::{call, connect_local};
use cxm_proto::error::CxmResult;
use cxm_proto::rpc::{LocalRequest, Response};

/// Send one request to the local daemon and turn an error reply into `Err`.
pub async fn request(socket: &Path, req: LocalRequest) -> CxmResult<Response> {
    let mut stream = connect_local(socket).await?;
    tracing::debug!("sending {:?} to {}", req, socket.display());
    call(&mut stream, &req).await?.into_result()
}

/// Print an error message and exit.
pub fn exit_error(msg: &str) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}

/// Format a unix timestamp as `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn format_time(epoch_secs: i64) -> String {
    if epoch_secs <= 0 {
        return "-".to_string();
    }
    let epoch_secs = epoch_secs as u64;
    let days = epoch_secs / 86400;
    let remainder = epoch_secs % 86400;
    let (year, month, day) = days_to_date(days);

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        year,
        month,
        day,
        remainder / 3600,
        (remainder % 3600) / 60,
        remainder % 60
    )
}

/// Convert days since Unix epoch to (year, month, day).
fn days_to_date(days: u64) -> (u64, u64, u64) {
    let z = days + 719468;
    let era = z / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

/// Seconds elapsed since `ts`, as shown in tables.
pub fn format_age(now: i64, ts: i64) -> String {
    if ts <= 0 {
        return "never".to_string();
    }
    format!("{}s ago", (now - ts).max(0))
}
