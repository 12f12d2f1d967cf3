//! Offline maintenance of the heartbeat device.

use std::path::Path;

use cxm_core::diskheartbeat::DiskHeartbeat;
use cxm_proto::error::{CxmError, CxmResult};

/// Write a fresh header on the device, erasing every slot.
///
/// A device with slots in use probably belongs to a running cluster and is
/// only formatted with `force`.
pub fn format(device: &Path, force: bool) -> CxmResult<()> {
    if DiskHeartbeat::is_in_use(device) {
        if !force {
            return Err(CxmError::InvalidParms(format!(
                "{} has slots in use, a cluster may be running; use --force",
                device.display()
            )));
        }
        eprintln!("Warning: formatting {} while slots are in use", device.display());
    }
    DiskHeartbeat::format(device)?;
    println!("{} formatted", device.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_refuses_used_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hbdisk");

        format(&path, false).unwrap();
        DiskHeartbeat::open(&path).unwrap().make_slot("n1").unwrap();

        assert!(matches!(format(&path, false), Err(CxmError::InvalidParms(_))));
        assert_eq!(DiskHeartbeat::open(&path).unwrap().nr_nodes().unwrap(), 1);

        format(&path, true).unwrap();
        assert_eq!(DiskHeartbeat::open(&path).unwrap().nr_nodes().unwrap(), 0);
    }
}
