use crate::model::ScanHeadModel;
use crate::profile::RawProfile;
use crate::types::{Camera, Laser, SCAN_HEAD_PROFILES_MAX};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

/// How the pool is partitioned for a scanning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// All profiles flow through one free/ready ring; used when the caller
    /// drains the head directly.
    Single,
    /// One free/ready ring per scheduled camera/laser pair; used for frame
    /// scanning.
    Multi,
}

/// Aggregate view over the ready side of the configured valid pairs, used
/// by the frame readiness check.
#[derive(Debug, Clone, Copy, Default)]
pub struct Report {
    pub size_min: u32,
    pub size_max: u32,
    pub sequence_min: u32,
    pub sequence_max: u32,
}

struct Ring {
    capacity: usize,
    free_tx: Sender<Box<RawProfile>>,
    free_rx: Receiver<Box<RawProfile>>,
    ready_tx: Sender<Box<RawProfile>>,
    ready_rx: Receiver<Box<RawProfile>>,
    last_sequence: AtomicU32,
    /// Consumer-side staging slot backing `ready_peek_sequence`; only the
    /// single consumer thread touches it, so the mutex is uncontended.
    peeked: Mutex<Option<Box<RawProfile>>>,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        let (free_tx, free_rx) = bounded(capacity);
        let (ready_tx, ready_rx) = bounded(capacity);
        Self {
            capacity,
            free_tx,
            free_rx,
            ready_tx,
            ready_rx,
            last_sequence: AtomicU32::new(0),
            peeked: Mutex::new(None),
        }
    }

    fn drain(&self) {
        while self.ready_rx.try_recv().is_ok() {}
        while self.free_rx.try_recv().is_ok() {}
        if let Ok(mut slot) = self.peeked.lock() {
            *slot = None;
        }
    }

    fn refill(&self) {
        for _ in 0..self.capacity {
            let mut profile = Box::new(RawProfile::new());
            profile.init();
            if self.free_tx.try_send(profile).is_err() {
                break;
            }
        }
    }

    fn ready_size(&self) -> u32 {
        let staged = self
            .peeked
            .lock()
            .map(|slot| usize::from(slot.is_some()))
            .unwrap_or(0);
        (self.ready_rx.len() + staged) as u32
    }

    fn dequeue_ready(&self) -> Option<Box<RawProfile>> {
        if let Ok(mut slot) = self.peeked.lock() {
            if let Some(profile) = slot.take() {
                return Some(profile);
            }
        }
        self.ready_rx.try_recv().ok()
    }

    fn peek_sequence(&self) -> Option<u32> {
        let mut slot = self.peeked.lock().ok()?;
        if slot.is_none() {
            *slot = self.ready_rx.try_recv().ok();
        }
        slot.as_ref().map(|p| p.sequence_number)
    }
}

/// Preallocated profile records for one scan head, partitioned into
/// lock-free free/ready rings.
///
/// The receive thread is the only producer and the foreground reader (or
/// frame assembler) the only consumer of each ring. A profile record flows
/// free -> ready -> free; when the free side is empty the producer drops
/// the incoming profile, which is the intended backpressure policy.
pub struct ProfileQueue {
    pairs: Vec<(Camera, Laser)>,
    element_rings: BTreeMap<(Camera, Laser), Ring>,
    single_ring: Ring,
    valid_pairs: Mutex<Vec<(Camera, Laser)>>,
    is_single: AtomicBool,
}

impl ProfileQueue {
    pub fn new(model: &ScanHeadModel) -> Self {
        let pairs = model.pairs();
        let per_pair = SCAN_HEAD_PROFILES_MAX / pairs.len().max(1);

        let mut element_rings = BTreeMap::new();
        for &pair in &pairs {
            element_rings.insert(pair, Ring::new(per_pair));
        }

        Self {
            pairs,
            element_rings,
            single_ring: Ring::new(SCAN_HEAD_PROFILES_MAX),
            valid_pairs: Mutex::new(Vec::new()),
            is_single: AtomicBool::new(true),
        }
    }

    /// Drain every ring and republish the whole pool into the free side
    /// selected by `mode`. Called at scan start and when flushing stale
    /// data.
    pub fn reset(&self, mode: QueueMode) {
        self.single_ring.drain();
        for ring in self.element_rings.values() {
            ring.drain();
        }

        match mode {
            QueueMode::Single => {
                self.is_single.store(true, Ordering::Release);
                self.single_ring.last_sequence.store(0, Ordering::Relaxed);
                self.single_ring.refill();
            }
            QueueMode::Multi => {
                self.is_single.store(false, Ordering::Release);
                for ring in self.element_rings.values() {
                    ring.last_sequence.store(0, Ordering::Relaxed);
                    ring.refill();
                }
            }
        }
    }

    fn ring(&self, camera: Camera, laser: Laser) -> Option<&Ring> {
        self.element_rings.get(&(camera, laser))
    }

    pub fn dequeue_free(&self) -> Option<Box<RawProfile>> {
        self.single_ring.free_rx.try_recv().ok()
    }

    pub fn dequeue_free_pair(&self, camera: Camera, laser: Laser) -> Option<Box<RawProfile>> {
        self.ring(camera, laser)?.free_rx.try_recv().ok()
    }

    /// Return a record to the shared free ring; the record is dropped if
    /// the ring is somehow full.
    pub fn enqueue_free(&self, profile: Box<RawProfile>) {
        let _ = self.single_ring.free_tx.try_send(profile);
    }

    pub fn enqueue_free_pair(&self, camera: Camera, laser: Laser, profile: Box<RawProfile>) {
        if let Some(ring) = self.ring(camera, laser) {
            let _ = ring.free_tx.try_send(profile);
        }
    }

    /// Publish a filled record; tracks the highest sequence number seen on
    /// the ready side. Returns the record on failure so the producer can
    /// recycle it.
    pub fn enqueue_ready(&self, profile: Box<RawProfile>) -> Result<(), Box<RawProfile>> {
        let sequence = profile.sequence_number;
        match self.single_ring.ready_tx.try_send(profile) {
            Ok(()) => {
                self.single_ring
                    .last_sequence
                    .fetch_max(sequence, Ordering::AcqRel);
                Ok(())
            }
            Err(crossbeam_channel::TrySendError::Full(p))
            | Err(crossbeam_channel::TrySendError::Disconnected(p)) => Err(p),
        }
    }

    pub fn enqueue_ready_pair(
        &self,
        camera: Camera,
        laser: Laser,
        profile: Box<RawProfile>,
    ) -> Result<(), Box<RawProfile>> {
        let ring = match self.ring(camera, laser) {
            Some(r) => r,
            None => return Err(profile),
        };

        let sequence = profile.sequence_number;
        match ring.ready_tx.try_send(profile) {
            Ok(()) => {
                ring.last_sequence.fetch_max(sequence, Ordering::AcqRel);
                Ok(())
            }
            Err(crossbeam_channel::TrySendError::Full(p))
            | Err(crossbeam_channel::TrySendError::Disconnected(p)) => Err(p),
        }
    }

    pub fn dequeue_ready(&self) -> Option<Box<RawProfile>> {
        self.single_ring.dequeue_ready()
    }

    pub fn dequeue_ready_pair(&self, camera: Camera, laser: Laser) -> Option<Box<RawProfile>> {
        self.ring(camera, laser)?.dequeue_ready()
    }

    /// Sequence number at the head of a pair's ready ring without
    /// consuming it.
    pub fn ready_peek_sequence(&self, camera: Camera, laser: Laser) -> Option<u32> {
        self.ring(camera, laser)?.peek_sequence()
    }

    pub fn size_free(&self) -> u32 {
        self.single_ring.free_rx.len() as u32
    }

    pub fn size_free_pair(&self, camera: Camera, laser: Laser) -> u32 {
        self.ring(camera, laser)
            .map(|r| r.free_rx.len() as u32)
            .unwrap_or(0)
    }

    pub fn size_ready(&self) -> u32 {
        self.single_ring.ready_size()
    }

    pub fn size_ready_pair(&self, camera: Camera, laser: Laser) -> u32 {
        self.ring(camera, laser).map(|r| r.ready_size()).unwrap_or(0)
    }

    /// Restrict the report to the pairs actually scheduled for scanning.
    pub fn set_valid_pairs(&self, pairs: Vec<(Camera, Laser)>) {
        if let Ok(mut valid) = self.valid_pairs.lock() {
            *valid = pairs;
        }
    }

    pub fn report(&self) -> Report {
        if self.is_single.load(Ordering::Acquire) {
            let sequence = self.single_ring.last_sequence.load(Ordering::Acquire);
            let size = self.single_ring.ready_size();
            return Report {
                size_min: size,
                size_max: size,
                sequence_min: sequence,
                sequence_max: sequence,
            };
        }

        let valid = match self.valid_pairs.lock() {
            Ok(v) => v.clone(),
            Err(_) => Vec::new(),
        };

        let mut report = Report::default();
        let mut first = true;
        for pair in valid {
            let ring = match self.element_rings.get(&pair) {
                Some(r) => r,
                None => continue,
            };
            let sequence = ring.last_sequence.load(Ordering::Acquire);
            let size = ring.ready_size();

            if first {
                report = Report {
                    size_min: size,
                    size_max: size,
                    sequence_min: sequence,
                    sequence_max: sequence,
                };
                first = false;
            } else {
                report.size_min = report.size_min.min(size);
                report.size_max = report.size_max.max(size);
                report.sequence_min = report.sequence_min.min(sequence);
                report.sequence_max = report.sequence_max.max(sequence);
            }
        }

        report
    }

    pub fn pairs(&self) -> &[(Camera, Laser)] {
        &self.pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScanHeadType;

    fn model(t: ScanHeadType) -> ScanHeadModel {
        ScanHeadModel::new(t, 1000, 0).unwrap()
    }

    fn filled(sequence: u32) -> Box<RawProfile> {
        let mut p = Box::new(RawProfile::new());
        p.sequence_number = sequence;
        p
    }

    #[test]
    fn single_mode_conservation() {
        let queue = ProfileQueue::new(&model(ScanHeadType::Js50Wsc));
        queue.reset(QueueMode::Single);

        assert_eq!(queue.size_free(), SCAN_HEAD_PROFILES_MAX as u32);
        assert_eq!(queue.size_ready(), 0);

        // Cycle a handful of profiles through free -> ready -> free.
        for seq in 1..=10u32 {
            let mut p = queue.dequeue_free().unwrap();
            p.sequence_number = seq;
            queue.enqueue_ready(p).unwrap();
        }
        assert_eq!(queue.size_free(), (SCAN_HEAD_PROFILES_MAX - 10) as u32);
        assert_eq!(queue.size_ready(), 10);

        while let Some(p) = queue.dequeue_ready() {
            queue.enqueue_free(p);
        }
        assert_eq!(queue.size_free(), SCAN_HEAD_PROFILES_MAX as u32);
        assert_eq!(queue.size_ready(), 0);
    }

    #[test]
    fn multi_mode_partitions_pool_across_pairs() {
        let m = model(ScanHeadType::Js50X6b20);
        let queue = ProfileQueue::new(&m);
        queue.reset(QueueMode::Multi);

        let per_pair = (SCAN_HEAD_PROFILES_MAX / m.pairs().len()) as u32;
        for (camera, laser) in m.pairs() {
            assert_eq!(queue.size_free_pair(camera, laser), per_pair);
            assert_eq!(queue.size_ready_pair(camera, laser), 0);
        }
    }

    #[test]
    fn reset_is_idempotent() {
        let queue = ProfileQueue::new(&model(ScanHeadType::Js50Wx));
        queue.reset(QueueMode::Multi);

        let mut p = queue.dequeue_free_pair(Camera::A, Laser::L1).unwrap();
        p.sequence_number = 5;
        queue.enqueue_ready_pair(Camera::A, Laser::L1, p).unwrap();

        queue.reset(QueueMode::Multi);
        queue.reset(QueueMode::Multi);

        assert_eq!(queue.size_ready_pair(Camera::A, Laser::L1), 0);
        assert_eq!(
            queue.size_free_pair(Camera::A, Laser::L1),
            (SCAN_HEAD_PROFILES_MAX / 2) as u32
        );
    }

    #[test]
    fn peek_does_not_consume() {
        let queue = ProfileQueue::new(&model(ScanHeadType::Js50Wsc));
        queue.reset(QueueMode::Multi);

        assert_eq!(queue.ready_peek_sequence(Camera::A, Laser::L1), None);

        let mut p = queue.dequeue_free_pair(Camera::A, Laser::L1).unwrap();
        p.sequence_number = 7;
        queue.enqueue_ready_pair(Camera::A, Laser::L1, p).unwrap();

        assert_eq!(queue.ready_peek_sequence(Camera::A, Laser::L1), Some(7));
        assert_eq!(queue.ready_peek_sequence(Camera::A, Laser::L1), Some(7));
        assert_eq!(queue.size_ready_pair(Camera::A, Laser::L1), 1);

        let p = queue.dequeue_ready_pair(Camera::A, Laser::L1).unwrap();
        assert_eq!(p.sequence_number, 7);
        assert_eq!(queue.ready_peek_sequence(Camera::A, Laser::L1), None);
    }

    #[test]
    fn drop_when_free_exhausted() {
        let queue = ProfileQueue::new(&model(ScanHeadType::Js50Wsc));
        queue.reset(QueueMode::Single);

        let mut held = Vec::new();
        while let Some(p) = queue.dequeue_free() {
            held.push(p);
        }
        assert!(queue.dequeue_free().is_none());

        // Ready ring full: publishing returns the record to the producer.
        for p in held {
            let _ = queue.enqueue_ready(p);
        }
        let overflow = filled(9999);
        assert!(queue.enqueue_ready(overflow).is_err());
    }

    #[test]
    fn report_tracks_valid_pairs_only() {
        let m = model(ScanHeadType::Js50X6b20);
        let queue = ProfileQueue::new(&m);
        queue.reset(QueueMode::Multi);
        queue.set_valid_pairs(vec![(Camera::B, Laser::L1), (Camera::A, Laser::L4)]);

        let mut p = queue.dequeue_free_pair(Camera::B, Laser::L1).unwrap();
        p.sequence_number = 9;
        queue.enqueue_ready_pair(Camera::B, Laser::L1, p).unwrap();

        let report = queue.report();
        assert_eq!(report.sequence_min, 0);
        assert_eq!(report.sequence_max, 9);
        assert_eq!(report.size_min, 0);
        assert_eq!(report.size_max, 1);
    }
}
