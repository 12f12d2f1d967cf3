//! Liveness slots on a shared block device.
//!
//! The disk heartbeat is a second liveness channel, independent of the
//! network: every member refreshes a timestamp in its own slot and the
//! active leader reads all slots during failure detection.
//!
//! ## Device layout
//!
//! All records are one block (`BS` = 4096 bytes) long.
//!
//! ```text
//! block 0        magic "CXMHBv1-4096-16", zero padded
//! block 1        number of used slots, right-justified ASCII decimal ("000..03")
//! block 2 + 2i   slot i name, zero padded (all zeros when free)
//! block 3 + 2i   slot i timestamp, right-justified ASCII decimal
//! ```
//!
//! with `i` in `0..MAX_SLOTS`. The device must be at least
//! `(MAX_SLOTS + 1) * 2 * BS` bytes long.
//!
//! Every operation opens the device, checks the magic, uses positional
//! reads/writes and `fsync`s before closing, so the store stays a reliable
//! witness even if the process dies right after a write.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cxm_proto::error::{CxmError, CxmResult};
use tracing::{debug, error, info};

/// Block size.
pub const BS: usize = 4096;

/// Maximum number of slots on a device.
pub const MAX_SLOTS: usize = 16;

/// Versioned magic string of block 0.
pub const MAGIC: &str = "CXMHBv1-4096-16";

/// Minimum device size.
pub const DEVICE_SIZE: u64 = ((MAX_SLOTS + 1) * 2 * BS) as u64;

/// Offset of the slot count block.
const NR_NODE_OFFSET: u64 = BS as u64;

/// Offset of the first slot.
const TABLE_OFFSET: u64 = 2 * BS as u64;

fn name_offset(slot: usize) -> u64 {
    TABLE_OFFSET + (slot * 2 * BS) as u64
}

fn timestamp_offset(slot: usize) -> u64 {
    name_offset(slot) + BS as u64
}

/// Encode an integer as a right-justified, zero-filled decimal block.
fn encode_number(value: i64) -> Vec<u8> {
    format!("{:0width$}", value, width = BS).into_bytes()
}

/// Decode a decimal block, ignoring the zero-byte padding.
fn decode_number(block: &[u8]) -> CxmResult<i64> {
    let text = std::str::from_utf8(trim_nul(block))
        .map_err(|_| CxmError::Inconsistent("non ascii number block".into()))?;
    if text.is_empty() {
        return Ok(0);
    }
    text.parse::<i64>()
        .map_err(|e| CxmError::Inconsistent(format!("bad number block: {}", e)))
}

fn trim_nul(block: &[u8]) -> &[u8] {
    let start = block.iter().position(|&b| b != 0).unwrap_or(block.len());
    let end = block.iter().rposition(|&b| b != 0).map_or(start, |p| p + 1);
    &block[start..end]
}

fn encode_name(name: &str) -> Vec<u8> {
    let mut block = vec![0u8; BS];
    block[..name.len()].copy_from_slice(name.as_bytes());
    block
}

/// Handle on a formatted heartbeat device.
pub struct DiskHeartbeat {
    path: PathBuf,
    /// Serializes read-modify-write sequences issued from this process.
    lock: Mutex<()>,
}

impl DiskHeartbeat {
    /// Open a heartbeat device, checking its magic string.
    pub fn open(path: impl AsRef<Path>) -> CxmResult<Self> {
        let hb = Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        };
        let file = hb.open_checked()?;
        file.sync_all()?;
        Ok(hb)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Erase the device and write a fresh header with zero slots used.
    ///
    /// This is destructive: every slot of every node is lost.
    pub fn format(path: impl AsRef<Path>) -> CxmResult<()> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| {
                error!("diskheartbeat: cannot open {} for format: {}", path.display(), e);
                CxmError::from(e)
            })?;

        let zero = vec![0u8; BS];
        let zero_ts = encode_number(0);
        file.write_all_at(&zero, 0)?;
        file.write_all_at(&encode_number(0), NR_NODE_OFFSET)?;
        for slot in 0..MAX_SLOTS {
            file.write_all_at(&zero, name_offset(slot))?;
            file.write_all_at(&zero_ts, timestamp_offset(slot))?;
        }
        file.write_all_at(&encode_name(MAGIC), 0)?;
        file.sync_all()?;

        info!("diskheartbeat: formatted {}", path.display());
        Ok(())
    }

    /// Pre-flight check before bootstrapping a new cluster: true when the
    /// device is a valid heartbeat disk with at least one slot in use.
    pub fn is_in_use(path: impl AsRef<Path>) -> bool {
        match Self::open(path).and_then(|hb| hb.nr_nodes()) {
            Ok(nr) => nr != 0,
            Err(_) => false,
        }
    }

    /// Number of used slots, from the header.
    pub fn nr_nodes(&self) -> CxmResult<usize> {
        let _guard = self.guard();
        let file = self.open_checked()?;
        let nr = self.read_nr_nodes(&file)?;
        Ok(nr)
    }

    /// Reserve a slot for `name`.
    pub fn make_slot(&self, name: &str) -> CxmResult<()> {
        if name.is_empty() {
            return Err(CxmError::InvalidParms("empty slot name".into()));
        }
        if name.len() >= BS {
            return Err(CxmError::NameTooLong(name.to_string()));
        }

        let _guard = self.guard();
        let file = self.open_checked()?;

        if self.find_slot(&file, name)?.is_some() {
            return Err(CxmError::SlotExists(name.to_string()));
        }

        let nr = self.read_nr_nodes(&file)?;
        if nr >= MAX_SLOTS {
            return Err(CxmError::SlotsExhausted);
        }

        let mut free = None;
        for slot in 0..MAX_SLOTS {
            if self.read_block(&file, name_offset(slot))?.iter().all(|&b| b == 0) {
                free = Some(slot);
                break;
            }
        }
        let slot = free.ok_or(CxmError::SlotsExhausted)?;

        file.write_all_at(&encode_number(nr as i64 + 1), NR_NODE_OFFSET)?;
        file.write_all_at(&encode_name(name), name_offset(slot))?;
        file.sync_all()?;

        debug!("diskheartbeat: slot {} reserved for {}", slot, name);
        Ok(())
    }

    /// Release the slot of `name`.
    pub fn erase_slot(&self, name: &str) -> CxmResult<()> {
        let _guard = self.guard();
        let file = self.open_checked()?;

        let slot = self
            .find_slot(&file, name)?
            .ok_or_else(|| CxmError::SlotNotFound(name.to_string()))?;

        file.write_all_at(&vec![0u8; BS], name_offset(slot))?;
        file.write_all_at(&encode_number(0), timestamp_offset(slot))?;

        let nr = self.read_nr_nodes(&file)?;
        file.write_all_at(&encode_number(nr.saturating_sub(1) as i64), NR_NODE_OFFSET)?;
        file.sync_all()?;

        debug!("diskheartbeat: slot {} of {} erased", slot, name);
        Ok(())
    }

    /// Store `timestamp` in the slot of `name`.
    pub fn write_timestamp(&self, name: &str, timestamp: i64) -> CxmResult<()> {
        let _guard = self.guard();
        let file = self.open_checked()?;

        let slot = self
            .find_slot(&file, name)?
            .ok_or_else(|| CxmError::SlotNotFound(name.to_string()))?;

        file.write_all_at(&encode_number(timestamp), timestamp_offset(slot))?;
        file.sync_all()?;
        Ok(())
    }

    /// Read the timestamp in the slot of `name`. A fresh slot reads 0.
    pub fn read_timestamp(&self, name: &str) -> CxmResult<i64> {
        let _guard = self.guard();
        let file = self.open_checked()?;

        let slot = self
            .find_slot(&file, name)?
            .ok_or_else(|| CxmError::SlotNotFound(name.to_string()))?;

        decode_number(&self.read_block(&file, timestamp_offset(slot))?)
    }

    /// Read the timestamps of every used slot, keyed by slot name.
    pub fn read_all_timestamps(&self) -> CxmResult<BTreeMap<String, i64>> {
        let _guard = self.guard();
        let file = self.open_checked()?;

        let mut all = BTreeMap::new();
        for slot in 0..MAX_SLOTS {
            let block = self.read_block(&file, name_offset(slot))?;
            let name = trim_nul(&block);
            if name.is_empty() {
                continue;
            }
            let name = String::from_utf8_lossy(name).into_owned();
            let ts = decode_number(&self.read_block(&file, timestamp_offset(slot))?)?;
            all.insert(name, ts);
        }
        Ok(all)
    }

    // -------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        // A poisoned lock only means another operation panicked; the device
        // itself is re-validated on every open.
        self.lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn open_checked(&self) -> CxmResult<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| {
                error!("diskheartbeat: cannot open {}: {}", self.path.display(), e);
                CxmError::from(e)
            })?;

        let header = self.read_block(&file, 0).map_err(|_| self.not_a_disk())?;
        if trim_nul(&header) != MAGIC.as_bytes() {
            return Err(self.not_a_disk());
        }
        Ok(file)
    }

    fn not_a_disk(&self) -> CxmError {
        CxmError::NotAHeartbeatDisk(self.path.display().to_string())
    }

    fn read_block(&self, file: &File, offset: u64) -> CxmResult<Vec<u8>> {
        let mut block = vec![0u8; BS];
        file.read_exact_at(&mut block, offset)?;
        Ok(block)
    }

    fn read_nr_nodes(&self, file: &File) -> CxmResult<usize> {
        let nr = decode_number(&self.read_block(file, NR_NODE_OFFSET)?)?;
        Ok(nr.max(0) as usize)
    }

    fn find_slot(&self, file: &File, name: &str) -> CxmResult<Option<usize>> {
        for slot in 0..MAX_SLOTS {
            let block = self.read_block(file, name_offset(slot))?;
            if trim_nul(&block) == name.as_bytes() {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formatted() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hbdisk");
        DiskHeartbeat::format(&path).unwrap();
        (dir, path)
    }

    #[test]
    fn test_format_layout() {
        let (_dir, path) = formatted();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len() as u64, DEVICE_SIZE);
        assert_eq!(&data[..MAGIC.len()], MAGIC.as_bytes());
        assert!(data[MAGIC.len()..BS].iter().all(|&b| b == 0));
        assert!(data[BS..2 * BS].iter().all(|&b| b == b'0'));
        // First slot: empty name, "0" timestamp
        assert!(data[2 * BS..3 * BS].iter().all(|&b| b == 0));
        assert!(data[3 * BS..4 * BS].iter().all(|&b| b == b'0'));
    }

    #[test]
    fn test_open_rejects_foreign_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage");
        std::fs::write(&path, vec![b'x'; DEVICE_SIZE as usize]).unwrap();
        assert!(matches!(
            DiskHeartbeat::open(&path),
            Err(CxmError::NotAHeartbeatDisk(_))
        ));
        assert!(!DiskHeartbeat::is_in_use(&path));
        assert!(DiskHeartbeat::open(dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_fresh_slot_reads_zero_then_written_value() {
        let (_dir, path) = formatted();
        let hb = DiskHeartbeat::open(&path).unwrap();
        hb.make_slot("node1").unwrap();
        assert_eq!(hb.read_timestamp("node1").unwrap(), 0);

        hb.write_timestamp("node1", 1325845000).unwrap();
        assert_eq!(hb.read_timestamp("node1").unwrap(), 1325845000);
    }

    #[test]
    fn test_duplicate_slot_refused_until_erased() {
        let (_dir, path) = formatted();
        let hb = DiskHeartbeat::open(&path).unwrap();
        hb.make_slot("node1").unwrap();
        assert_eq!(
            hb.make_slot("node1"),
            Err(CxmError::SlotExists("node1".into()))
        );
        hb.erase_slot("node1").unwrap();
        hb.make_slot("node1").unwrap();
        assert_eq!(hb.nr_nodes().unwrap(), 1);
    }

    #[test]
    fn test_seventeenth_slot_refused() {
        let (_dir, path) = formatted();
        let hb = DiskHeartbeat::open(&path).unwrap();
        for i in 0..MAX_SLOTS {
            hb.make_slot(&format!("node{:02}", i)).unwrap();
        }
        assert_eq!(hb.nr_nodes().unwrap(), MAX_SLOTS);
        assert_eq!(hb.make_slot("node16"), Err(CxmError::SlotsExhausted));
    }

    #[test]
    fn test_erase_frees_slot_for_reuse() {
        let (_dir, path) = formatted();
        let hb = DiskHeartbeat::open(&path).unwrap();
        hb.make_slot("node1").unwrap();
        hb.make_slot("node2").unwrap();
        hb.write_timestamp("node1", 42).unwrap();
        hb.erase_slot("node1").unwrap();

        assert_eq!(hb.nr_nodes().unwrap(), 1);
        assert_eq!(
            hb.read_timestamp("node1"),
            Err(CxmError::SlotNotFound("node1".into()))
        );

        // The freed first slot is reused, with a zeroed timestamp.
        hb.make_slot("node3").unwrap();
        assert_eq!(hb.read_timestamp("node3").unwrap(), 0);
        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[2 * BS..2 * BS + 5], b"node3");
    }

    #[test]
    fn test_read_all_timestamps() {
        let (_dir, path) = formatted();
        let hb = DiskHeartbeat::open(&path).unwrap();
        hb.make_slot("node1").unwrap();
        hb.make_slot("node2").unwrap();
        hb.write_timestamp("node2", 1000).unwrap();

        let all = hb.read_all_timestamps().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["node1"], 0);
        assert_eq!(all["node2"], 1000);
    }

    #[test]
    fn test_is_in_use() {
        let (_dir, path) = formatted();
        assert!(!DiskHeartbeat::is_in_use(&path));
        DiskHeartbeat::open(&path).unwrap().make_slot("node1").unwrap();
        assert!(DiskHeartbeat::is_in_use(&path));
    }

    #[test]
    fn test_slot_name_validation() {
        let (_dir, path) = formatted();
        let hb = DiskHeartbeat::open(&path).unwrap();
        let long = "x".repeat(BS);
        assert_eq!(hb.make_slot(&long), Err(CxmError::NameTooLong(long.clone())));
        assert!(matches!(hb.make_slot(""), Err(CxmError::InvalidParms(_))));
        assert_eq!(
            hb.write_timestamp("ghost", 1),
            Err(CxmError::SlotNotFound("ghost".into()))
        );
        assert_eq!(
            hb.erase_slot("ghost"),
            Err(CxmError::SlotNotFound("ghost".into()))
        );
    }

    #[test]
    fn test_number_codec() {
        let block = encode_number(3);
        assert_eq!(block.len(), BS);
        assert_eq!(&block[BS - 2..], b"03");
        assert_eq!(decode_number(&block).unwrap(), 3);
        assert_eq!(decode_number(&[0u8; BS]).unwrap(), 0);
    }
}
