//! Segment identity, creation and the open handshake.
//!
//! The creator sizes the file, fills the identity line and publishes `magic`
//! last. Openers map the file and wait (bounded) until the magic shows up,
//! then validate the identity against what they expect.

use crate::error::SegmentError;
use crate::region::Region;
use crate::ring::{OverflowPolicy, RingOptions};
use crate::shm_layout::{
    DATA_OFFSET, LayoutFault, MAX_READERS, RING_MAGIC, RING_VERSION, STATE_DESTROYED,
    bytes_for_segment,
};
use lithos_config::TransportConfig;
use lithos_mmap::{ShmFile, ShmNamespace};
use std::fmt;
use std::io;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long an opener waits for a concurrent creator to finish initialising.
const INIT_WAIT: Duration = Duration::from_secs(1);
const INIT_POLL: Duration = Duration::from_millis(1);

/// Where a segment lives: a namespace directory plus a name inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentIdent {
    pub namespace: ShmNamespace,
    pub name: String,
}

impl SegmentIdent {
    pub fn new(namespace: ShmNamespace, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    /// `name` in the host's shared-memory namespace.
    pub fn system(name: impl Into<String>) -> Self {
        Self::new(ShmNamespace::system(), name)
    }

    pub fn from_config(cfg: &TransportConfig) -> Self {
        let namespace = match &cfg.shm_dir {
            Some(dir) => ShmNamespace::new(dir),
            None => ShmNamespace::system(),
        };
        Self::new(namespace, cfg.ring_name.clone())
    }
}

impl fmt::Display for SegmentIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.namespace.dir().join(&self.name).display())
    }
}

/// How a producer handle finds its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail if the segment already exists.
    CreateNew,
    /// Fail if the segment does not exist.
    OpenExisting,
    /// Join a live segment, or create it.
    CreateOrOpen,
}

/// Create and initialise a fresh segment with one producer reference.
pub(crate) fn create(ident: &SegmentIdent, options: &RingOptions) -> Result<Region, SegmentError> {
    let len = bytes_for_segment(options.capacity as usize);
    let file = ShmFile::create_new(&ident.namespace, &ident.name, len as u64)
        .map_err(|e| SegmentError::io(&ident.name, e))?;
    let region = Region::from_shm(file, ident.clone()).ok_or_else(|| SegmentError::Layout {
        name: ident.name.clone(),
        fault: LayoutFault::Length {
            needed: len as u64,
            actual: 0,
        },
    })?;
    init_header(&region, options);
    info!(
        segment = %ident,
        capacity = options.capacity,
        policy = ?options.policy,
        "created ring segment"
    );
    Ok(region)
}

/// Heap-backed region for in-process use.
pub(crate) fn in_memory(options: &RingOptions) -> Result<Region, SegmentError> {
    let len = bytes_for_segment(options.capacity as usize);
    let region = Region::heap(len).ok_or(SegmentError::InvalidCapacity(options.capacity))?;
    init_header(&region, options);
    Ok(region)
}

fn init_header(region: &Region, options: &RingOptions) {
    let h = region.header();
    let id = &h.identity;
    id.version.store(RING_VERSION, Ordering::Relaxed);
    id.policy.store(options.policy.code(), Ordering::Relaxed);
    id.capacity.store(options.capacity, Ordering::Relaxed);
    id.data_offset.store(DATA_OFFSET as u64, Ordering::Relaxed);
    id.segment_len.store(region.len() as u64, Ordering::Relaxed);
    id.max_readers.store(MAX_READERS as u32, Ordering::Relaxed);
    h.lifecycle.open_count.store(1, Ordering::Relaxed);
    id.magic.store(RING_MAGIC, Ordering::Release);
}

/// Map an existing segment and wait until its creator has published it.
pub(crate) fn map_existing(ident: &SegmentIdent) -> Result<Region, SegmentError> {
    let deadline = Instant::now() + INIT_WAIT;
    loop {
        match try_map(ident) {
            Ok(Some(region)) => {
                debug!(segment = %ident, "mapped existing segment");
                return Ok(region);
            }
            Ok(None) if Instant::now() < deadline => std::thread::sleep(INIT_POLL),
            Ok(None) => {
                return Err(SegmentError::NotInitialized {
                    name: ident.name.clone(),
                });
            }
            Err(e) => return Err(e),
        }
    }
}

/// `Ok(None)` while the creator is still sizing or initialising the file.
fn try_map(ident: &SegmentIdent) -> Result<Option<Region>, SegmentError> {
    let file = match ShmFile::open(&ident.namespace, &ident.name) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::InvalidData => return Ok(None),
        Err(e) => return Err(SegmentError::io(&ident.name, e)),
    };
    let actual = file.len() as u64;
    let region = Region::from_shm(file, ident.clone()).ok_or_else(|| SegmentError::Layout {
        name: ident.name.clone(),
        fault: LayoutFault::Length {
            needed: DATA_OFFSET as u64,
            actual,
        },
    })?;
    match region.header().validate(region.len()) {
        Ok(()) => Ok(Some(region)),
        Err(LayoutFault::Uninitialised) => Ok(None),
        Err(fault) => Err(SegmentError::Layout {
            name: ident.name.clone(),
            fault,
        }),
    }
}

/// Check that an existing segment matches what a producer asked for.
pub(crate) fn check_compatible(region: &Region, options: &RingOptions) -> Result<(), SegmentError> {
    let name = region.ident().map(|i| i.name.clone()).unwrap_or_default();
    let existing = region.header().capacity();
    if existing != options.capacity {
        return Err(SegmentError::CapacityMismatch {
            name,
            existing,
            requested: options.capacity,
        });
    }
    if OverflowPolicy::from_code(region.header().policy_code()) != options.policy {
        return Err(SegmentError::PolicyMismatch { name });
    }
    Ok(())
}

/// Take a producer reference on a live segment. Never revives a segment whose
/// count already dropped to zero.
pub(crate) fn join_producer(region: &Region) -> Result<u32, SegmentError> {
    let lc = &region.header().lifecycle;
    let mut cur = lc.open_count.load(Ordering::Acquire);
    loop {
        if cur == 0 || lc.state.load(Ordering::Acquire) & STATE_DESTROYED != 0 {
            return Err(SegmentError::Destroyed);
        }
        match lc.open_count.compare_exchange_weak(
            cur,
            cur + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return Ok(cur + 1),
            Err(actual) => cur = actual,
        }
    }
}

/// Drop a producer reference. Returns true when this was the last one; the
/// caller then owns the teardown.
pub(crate) fn leave_producer(region: &Region) -> bool {
    let lc = &region.header().lifecycle;
    let mut cur = lc.open_count.load(Ordering::Acquire);
    loop {
        if cur == 0 {
            return false;
        }
        match lc.open_count.compare_exchange_weak(
            cur,
            cur - 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return cur == 1,
            Err(actual) => cur = actual,
        }
    }
}

pub(crate) fn is_destroyed(region: &Region) -> bool {
    region.header().state() & STATE_DESTROYED != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(tag: &str) -> SegmentIdent {
        let dir = std::env::temp_dir().join(format!("lithos_seg_{tag}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        SegmentIdent::new(ShmNamespace::new(dir), "ring")
    }

    #[test]
    fn creator_publishes_a_valid_header() {
        let ident = scratch("create");
        let region = create(&ident, &RingOptions::new(1024)).unwrap();
        assert_eq!(region.header().validate(region.len()), Ok(()));
        assert_eq!(region.header().lifecycle.open_count.load(Ordering::Relaxed), 1);

        let other = map_existing(&ident).unwrap();
        assert_eq!(other.header().capacity(), 1024);
        let _ = std::fs::remove_dir_all(ident.namespace.dir());
    }

    #[test]
    fn opener_rejects_a_foreign_file() {
        let ident = scratch("foreign");
        std::fs::write(ident.namespace.dir().join("ring"), vec![0xEEu8; DATA_OFFSET + 64]).unwrap();
        let err = map_existing(&ident).err().unwrap();
        assert!(matches!(
            err,
            SegmentError::Layout {
                fault: LayoutFault::BadMagic,
                ..
            }
        ));
        let _ = std::fs::remove_dir_all(ident.namespace.dir());
    }

    #[test]
    fn opener_gives_up_on_a_never_initialised_file() {
        let ident = scratch("uninit");
        std::fs::write(ident.namespace.dir().join("ring"), vec![0u8; DATA_OFFSET + 64]).unwrap();
        let err = map_existing(&ident).err().unwrap();
        assert!(matches!(err, SegmentError::NotInitialized { .. }));
        let _ = std::fs::remove_dir_all(ident.namespace.dir());
    }

    #[test]
    fn compatibility_checks_capacity_and_policy() {
        let region = in_memory(&RingOptions::new(1024)).unwrap();
        assert!(check_compatible(&region, &RingOptions::new(1024)).is_ok());
        assert!(matches!(
            check_compatible(&region, &RingOptions::new(2048)),
            Err(SegmentError::CapacityMismatch { existing: 1024, .. })
        ));
        assert!(matches!(
            check_compatible(
                &region,
                &RingOptions::new(1024).with_policy(OverflowPolicy::Overwrite)
            ),
            Err(SegmentError::PolicyMismatch { .. })
        ));
    }

    #[test]
    fn producer_references_never_revive_a_dead_segment() {
        let region = in_memory(&RingOptions::new(64)).unwrap();
        assert_eq!(join_producer(&region).unwrap(), 2);
        assert!(!leave_producer(&region));
        assert!(leave_producer(&region));
        assert!(matches!(join_producer(&region), Err(SegmentError::Destroyed)));
        assert!(!leave_producer(&region));
    }

    #[test]
    fn ident_from_config_uses_shm_dir() {
        let cfg = TransportConfig {
            ring_name: "bus".into(),
            shm_dir: Some("/tmp/lithos".into()),
            ..TransportConfig::default()
        };
        let ident = SegmentIdent::from_config(&cfg);
        assert_eq!(ident.name, "bus");
        assert_eq!(ident.to_string(), "/tmp/lithos/bus");
    }
}
