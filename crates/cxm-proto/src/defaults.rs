//! Timer constants and tunable operational defaults.
//!
//! The timer values drive the election and failure detection protocol and
//! are shared by every node of a cluster. The remaining values are defaults
//! for the daemon command line flags.

use std::time::Duration;

// ─── Protocol Timers ────────────────────────────────────────────────────────

/// Period of both leader and follower heartbeat emission.
pub const TM_HEARTBEAT: Duration = Duration::from_secs(1);

/// Vote collection window of an election.
pub const TM_TALLY: Duration = Duration::from_secs(1);

/// Watchdog tick, for both the leader and the follower watchdogs.
pub const TM_WATCHDOG: Duration = Duration::from_secs(3);

/// A follower without leader heartbeat for this long starts an election.
pub const TM_MASTER: Duration = Duration::from_secs(2 * 3);

/// A member without heartbeat for this long is considered failed.
pub const TM_SLAVE: Duration = Duration::from_secs(3 * 3);

/// Time spent listening for an existing leader before joining.
pub const TM_JOIN_WAIT: Duration = Duration::from_secs(2);

/// Upper bound of any RPC exchange with the leader or the local daemon.
pub const TM_RPC: Duration = Duration::from_secs(5);

// ─── Heartbeat Transport ────────────────────────────────────────────────────

/// Retries of a failed heartbeat send before escalating.
pub const DEFAULT_SEND_RETRIES: u32 = 2;

/// Pause between two heartbeat send attempts.
pub const DEFAULT_SEND_BACKOFF: Duration = Duration::from_millis(100);

/// Largest datagram accepted by the heartbeat listener.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Maximum size of a single RPC frame (bytes).
pub const MAX_RPC_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Channel buffer size of the coordinator input queue.
pub const DEFAULT_INPUT_CHANNEL_SIZE: usize = 1024;

// ─── Network / Path Defaults ────────────────────────────────────────────────

/// UDP port of the heartbeat transport.
pub const DEFAULT_UDP_PORT: u16 = 6666;

/// TCP port of the leader's remote RPC service.
pub const DEFAULT_RPC_PORT: u16 = 8800;

/// Unix socket of the local operator RPC service.
pub const DEFAULT_LOCAL_SOCKET: &str = "/var/run/cxmd.socket";

/// Default shared heartbeat device.
pub const DEFAULT_HB_DISK: &str = "/dev/xen3/heartbeat";

// ─── Resolver ───────────────────────────────────────────────────────────────

/// Lifetime of a cached name resolution.
pub const DEFAULT_RESOLVER_TTL: Duration = Duration::from_secs(300);

// ─── Load Balancer ──────────────────────────────────────────────────────────

/// Hard limit of VMs hosted by a single node.
pub const DEFAULT_LB_MAX_VMS_PER_NODE: usize = 20;

/// Maximum number of migrations searched for.
pub const DEFAULT_LB_MAX_LAYERS: usize = 5;

/// Minimum score improvement, in percent, for a plan to be accepted.
pub const DEFAULT_LB_MIN_GAIN: f64 = 10.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_ratios() {
        assert_eq!(TM_MASTER, TM_WATCHDOG * 2);
        assert_eq!(TM_SLAVE, TM_WATCHDOG * 3);
        assert!(TM_TALLY < TM_MASTER);
    }
}
