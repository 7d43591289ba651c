use crate::error::Error;
use crate::scan_head::ScanHead;
use crate::types::{Camera, Laser, ScanHeadConfiguration};
use crate::Result;
use std::collections::BTreeMap;

/// Floor on effective time per scheduled element: no camera/laser pair may
/// be driven faster than 4 kHz.
const MIN_ELEMENT_DURATION_US: u32 = 250;

/// Overhead between two firings of the same camera, for data drain:
/// 3.210 us row time over 4 + 42 + 3 rows, rounded up.
const FRAME_OVERHEAD_TIME_US: u32 = 158;

/// Cameras begin exposing this far before their laser fires; charged once
/// against the whole cycle.
const CAMERA_EARLY_OFFSET_US: u32 = 10;

#[derive(Debug, Clone)]
struct PhasedElement {
    head_id: u32,
    camera: Camera,
    laser: Laser,
    /// `Some` when the user supplied a configuration at insertion time;
    /// otherwise the head's current configuration is pulled at compile
    /// time.
    cfg: Option<ScanHeadConfiguration>,
}

/// One compiled element with its effective configuration.
#[derive(Debug, Clone)]
pub struct CalculatedElement {
    pub head_id: u32,
    pub camera: Camera,
    pub laser: Laser,
    pub cfg: ScanHeadConfiguration,
}

/// One compiled phase with its wall-clock duration.
#[derive(Debug, Clone, Default)]
pub struct CalculatedPhase {
    pub duration_us: u32,
    pub elements: Vec<CalculatedElement>,
}

/// Output of phase table compilation.
#[derive(Debug, Clone, Default)]
pub struct CalculatedPhaseTable {
    pub phases: Vec<CalculatedPhase>,
    pub total_duration_us: u32,
    pub camera_early_offset_us: u32,
}

/// Ordered cycle of phases scheduling camera/laser firings across heads.
#[derive(Debug, Default)]
pub struct PhaseTable {
    table: Vec<Vec<PhasedElement>>,
    head_count: BTreeMap<u32, u32>,
    has_duplicate_elements: bool,
    is_dirty: bool,
}

impl PhaseTable {
    pub fn new() -> Self {
        Self {
            table: Vec::new(),
            head_count: BTreeMap::new(),
            has_duplicate_elements: false,
            is_dirty: true,
        }
    }

    pub fn reset(&mut self) {
        self.table.clear();
        self.head_count.clear();
        self.has_duplicate_elements = false;
        self.is_dirty = true;
    }

    pub fn create_phase(&mut self) {
        self.table.push(Vec::new());
        self.is_dirty = true;
    }

    pub fn number_of_phases(&self) -> u32 {
        self.table.len() as u32
    }

    pub fn has_duplicate_elements(&self) -> bool {
        self.has_duplicate_elements
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn clear_dirty(&mut self) {
        self.is_dirty = false;
    }

    /// Camera/laser pairs scheduled per head, in phase order.
    pub fn scheduled_pairs_per_head(&self) -> BTreeMap<u32, Vec<(Camera, Laser)>> {
        let mut pairs: BTreeMap<u32, Vec<(Camera, Laser)>> = BTreeMap::new();
        for phase in &self.table {
            for el in phase {
                pairs
                    .entry(el.head_id)
                    .or_default()
                    .push((el.camera, el.laser));
            }
        }
        pairs
    }

    /// Append an element to the most recently created phase.
    pub fn add_to_last_phase(
        &mut self,
        head: &ScanHead,
        camera: Camera,
        laser: Laser,
        cfg: Option<ScanHeadConfiguration>,
    ) -> Result<()> {
        if self.table.is_empty() {
            return Err(Error::InvalidArgument(
                "no phase created in phase table".into(),
            ));
        }

        let head_id = head.id();

        if let Some(&count) = self.head_count.get(&head_id) {
            if count >= head.max_scan_pairs() {
                return Err(Error::NoMoreRoom);
            }

            // Same tuple in two phases is allowed but poisons frame mode.
            'outer: for phase in &self.table {
                for el in phase {
                    if el.head_id == head_id && el.camera == camera && el.laser == laser {
                        self.has_duplicate_elements = true;
                        break 'outer;
                    }
                }
            }
        } else {
            self.head_count.insert(head_id, 0);
        }

        let last = self.table.len() - 1;
        for el in &self.table[last] {
            if el.head_id == head_id && el.camera == camera {
                return Err(Error::InvalidArgument(format!(
                    "camera {:?} of scan head {} already in phase",
                    camera, head_id
                )));
            }
        }

        if let Some(cfg) = &cfg {
            if !head.is_configuration_valid(cfg) {
                return Err(Error::InvalidArgument(
                    "phase element configuration out of device bounds".into(),
                ));
            }
        }

        *self.head_count.entry(head_id).or_insert(0) += 1;
        self.table[last].push(PhasedElement {
            head_id,
            camera,
            laser,
            cfg,
        });
        self.is_dirty = true;

        Ok(())
    }

    /// Compile the table into wall-clock phase durations.
    ///
    /// The duration of each phase starts as its longest laser-on time and
    /// is then stretched so that every reuse of a camera leaves room for
    /// the camera's window-dependent readout (its advertised minimum scan
    /// period) and the fixed inter-use overhead. Two passes over the cycle
    /// propagate constraints that wrap past the end of the table back to
    /// the beginning.
    pub fn calculate(&self, heads: &BTreeMap<u32, &ScanHead>) -> Result<CalculatedPhaseTable> {
        let mut calculated = CalculatedPhaseTable::default();

        if self.table.is_empty() {
            return Ok(calculated);
        }

        for phase in &self.table {
            let mut entry = CalculatedPhase::default();
            for el in phase {
                let head = heads
                    .get(&el.head_id)
                    .ok_or_else(|| Error::Internal(format!("unknown head id {}", el.head_id)))?;

                // Load the configuration dynamically for elements without an
                // override; the user may have changed it since insertion.
                let cfg = match el.cfg {
                    Some(cfg) => cfg,
                    None => head.configuration(),
                };

                if cfg.laser_on_time_max_us > entry.duration_us {
                    entry.duration_us = cfg.laser_on_time_max_us;
                }
                entry.elements.push(CalculatedElement {
                    head_id: el.head_id,
                    camera: el.camera,
                    laser: el.laser,
                    cfg,
                });
            }
            calculated.phases.push(entry);
        }

        // Time since each camera was last seen, advanced phase by phase.
        let mut accum: BTreeMap<(u32, Camera), u32> = BTreeMap::new();

        for _ in 0..2 {
            for phase in calculated.phases.iter_mut() {
                for last_seen in accum.values_mut() {
                    *last_seen += phase.duration_us;
                }

                for n in 0..phase.elements.len() {
                    let head_id = phase.elements[n].head_id;
                    let camera = phase.elements[n].camera;
                    let laser_on_max_us = phase.elements[n].cfg.laser_on_time_max_us as i64;
                    let key = (head_id, camera);

                    if let Some(&last_seen_us) = accum.get(&key) {
                        let head = heads
                            .get(&head_id)
                            .ok_or_else(|| Error::Internal(format!("unknown head id {}", head_id)))?;
                        let min_scan_period_us = head.min_scan_period() as i64;
                        let last_seen_us = last_seen_us as i64;

                        // Camera readout, affected by the scan window.
                        let adj_min_period_us = min_scan_period_us - last_seen_us;
                        // Fixed overhead between scans on the same camera.
                        let adj_fot_us =
                            FRAME_OVERHEAD_TIME_US as i64 - (last_seen_us - laser_on_max_us);

                        let adj = adj_min_period_us.max(adj_fot_us);
                        if adj > 0 {
                            let adj = adj as u32;
                            phase.duration_us += adj;
                            for last_seen in accum.values_mut() {
                                *last_seen += adj;
                            }
                        }
                    }

                    accum.insert(key, 0);
                }
            }
        }

        calculated.total_duration_us = calculated.phases.iter().map(|p| p.duration_us).sum();
        calculated.camera_early_offset_us = CAMERA_EARLY_OFFSET_US;

        // Per-element floor: the most heavily scheduled head bounds how fast
        // the cycle may spin; distribute any deficit evenly.
        let max_head_elements = self.head_count.values().copied().max().unwrap_or(0);
        let min_duration_us = max_head_elements * MIN_ELEMENT_DURATION_US;
        let total_duration_us = calculated.camera_early_offset_us + calculated.total_duration_us;

        if total_duration_us < min_duration_us {
            let delta = min_duration_us - total_duration_us;
            let size = calculated.phases.len() as u32;
            let offset = (delta + (size - 1)) / size;

            calculated.total_duration_us = 0;
            for phase in calculated.phases.iter_mut() {
                phase.duration_us += offset;
                calculated.total_duration_us += phase.duration_us;
            }
        }

        Ok(calculated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan_head::test_support::offline_head;
    use crate::types::ScanHeadType;

    fn heads_map<'a>(heads: &'a [&'a ScanHead]) -> BTreeMap<u32, &'a ScanHead> {
        heads.iter().map(|h| (h.id(), *h)).collect()
    }

    #[test]
    fn wsc_single_element_compilation() {
        let head = offline_head(ScanHeadType::Js50Wsc, 12345, 0);
        head.set_cached_min_scan_period(1500);

        let mut cfg = head.configuration();
        cfg.laser_on_time_max_us = 1000;
        head.set_configuration(&cfg).unwrap();

        let mut table = PhaseTable::new();
        table.create_phase();
        table
            .add_to_last_phase(&head, Camera::A, Laser::L1, None)
            .unwrap();

        let calculated = table.calculate(&heads_map(&[&head])).unwrap();
        assert_eq!(calculated.phases.len(), 1);
        assert!(calculated.phases[0].duration_us >= 1000);
        // Second pass raises the phase to the camera readout floor.
        assert_eq!(calculated.phases[0].duration_us, 1500);
        assert_eq!(calculated.camera_early_offset_us, 10);
        assert!(calculated.total_duration_us + calculated.camera_early_offset_us >= 250);
    }

    #[test]
    fn x6b_interleaved_compilation_respects_camera_readout() {
        let head = offline_head(ScanHeadType::Js50X6b20, 2000, 0);
        head.set_cached_min_scan_period(2000);

        let mut cfg = head.configuration();
        cfg.laser_on_time_max_us = 500;
        head.set_configuration(&cfg).unwrap();

        let lasers = [Laser::L1, Laser::L4, Laser::L2, Laser::L5, Laser::L3, Laser::L6];
        let mut table = PhaseTable::new();
        for laser in lasers {
            let camera = head.paired_camera(laser);
            assert_ne!(camera, Camera::Invalid);
            table.create_phase();
            table.add_to_last_phase(&head, camera, laser, None).unwrap();
        }

        let calculated = table.calculate(&heads_map(&[&head])).unwrap();
        assert_eq!(calculated.phases.len(), 6);
        // Each camera is reused no sooner than 2 ms after its last use.
        assert!(calculated.total_duration_us >= 2 * 2000);
        assert_eq!(calculated.total_duration_us, 7000);
    }

    #[test]
    fn extension_never_shrinks_min_period() {
        let head = offline_head(ScanHeadType::Js50X6b20, 2000, 0);
        head.set_cached_min_scan_period(2000);

        let mut table = PhaseTable::new();
        table.create_phase();
        table
            .add_to_last_phase(&head, head.paired_camera(Laser::L1), Laser::L1, None)
            .unwrap();
        let base = table.calculate(&heads_map(&[&head])).unwrap();

        table.create_phase();
        table
            .add_to_last_phase(&head, head.paired_camera(Laser::L4), Laser::L4, None)
            .unwrap();
        let extended = table.calculate(&heads_map(&[&head])).unwrap();

        assert!(
            extended.total_duration_us + extended.camera_early_offset_us
                >= base.total_duration_us + base.camera_early_offset_us
        );
    }

    #[test]
    fn minimum_element_floor_is_distributed() {
        let head = offline_head(ScanHeadType::Js50Wx, 3000, 0);

        let mut cfg = head.configuration();
        cfg.laser_on_time_min_us = 15;
        cfg.laser_on_time_def_us = 15;
        cfg.laser_on_time_max_us = 20;
        head.set_configuration(&cfg).unwrap();

        let mut table = PhaseTable::new();
        table.create_phase();
        table
            .add_to_last_phase(&head, Camera::A, Laser::L1, None)
            .unwrap();
        table
            .add_to_last_phase(&head, Camera::B, Laser::L1, None)
            .unwrap();

        let calculated = table.calculate(&heads_map(&[&head])).unwrap();
        assert!(
            calculated.total_duration_us + calculated.camera_early_offset_us
                >= 2 * MIN_ELEMENT_DURATION_US
        );
    }

    #[test]
    fn same_camera_twice_in_phase_is_rejected() {
        let head = offline_head(ScanHeadType::Js50Wx, 4000, 0);
        let mut table = PhaseTable::new();
        table.create_phase();
        table
            .add_to_last_phase(&head, Camera::A, Laser::L1, None)
            .unwrap();
        let err = table
            .add_to_last_phase(&head, Camera::A, Laser::L1, None)
            .unwrap_err();
        assert_eq!(err.code(), -3);
    }

    #[test]
    fn duplicate_across_phases_sets_flag() {
        let head = offline_head(ScanHeadType::Js50Wx, 4000, 0);
        let mut table = PhaseTable::new();
        table.create_phase();
        table
            .add_to_last_phase(&head, Camera::A, Laser::L1, None)
            .unwrap();
        assert!(!table.has_duplicate_elements());

        table.create_phase();
        table
            .add_to_last_phase(&head, Camera::A, Laser::L1, None)
            .unwrap();
        assert!(table.has_duplicate_elements());
    }

    #[test]
    fn per_head_element_budget_is_enforced() {
        let head = offline_head(ScanHeadType::Js50Wsc, 5000, 0);
        let mut table = PhaseTable::new();

        // WSC allows at most 4 scheduled elements.
        for _ in 0..4 {
            table.create_phase();
            table
                .add_to_last_phase(&head, Camera::A, Laser::L1, None)
                .unwrap();
        }
        table.create_phase();
        let err = table
            .add_to_last_phase(&head, Camera::A, Laser::L1, None)
            .unwrap_err();
        assert_eq!(err.code(), -10);
    }

    #[test]
    fn insert_without_phase_is_rejected() {
        let head = offline_head(ScanHeadType::Js50Wsc, 5000, 0);
        let mut table = PhaseTable::new();
        assert!(table
            .add_to_last_phase(&head, Camera::A, Laser::L1, None)
            .is_err());
    }

    #[test]
    fn empty_table_compiles_to_nothing() {
        let table = PhaseTable::new();
        let calculated = table.calculate(&BTreeMap::new()).unwrap();
        assert!(calculated.phases.is_empty());
        assert_eq!(calculated.total_duration_us, 0);
    }
}
