//! Static flying-machine data consumed by the tooling around the optimizer.
//! The optimizer core itself never reads these tables; they describe the
//! hardware that eventually fires the projections the solver picks.

use std::collections::BTreeMap;

/// The axes a machine can be built to travel along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineAxis {
    Horizontal,
    Vertical,
}

/// One flying-machine design, as a flat record. Footprint grids are
/// row-major boolean masks; block counts and footprints are keyed by
/// sub-machine index.
#[derive(Debug, Clone)]
pub struct FlyingMachine {
    pub name: &'static str,
    pub axes: &'static [MachineAxis],
    /// Whether the design relies on quasi-connectivity redirection.
    pub uses_redirection: bool,
    pub tileable: bool,
    pub length: u32,
    /// Game ticks, not redstone ticks.
    pub trigger_delay: u32,
    pub engine_footprint: Vec<Vec<bool>>,
    pub pushed_blocks: BTreeMap<u32, u32>,
    pub attached_blocks: BTreeMap<u32, u32>,
    pub pulled_blocks: BTreeMap<u32, u32>,
    pub pushed_footprints: BTreeMap<u32, Vec<Vec<bool>>>,
    pub attached_footprints: BTreeMap<u32, Vec<Vec<bool>>>,
    pub pulled_footprints: BTreeMap<u32, Vec<Vec<bool>>>,
}

impl FlyingMachine {
    fn new(
        name: &'static str,
        axes: &'static [MachineAxis],
        uses_redirection: bool,
        tileable: bool,
        length: u32,
        trigger_delay: u32,
        engine_footprint: Vec<Vec<bool>>,
    ) -> Self {
        FlyingMachine {
            name,
            axes,
            uses_redirection,
            tileable,
            length,
            trigger_delay,
            engine_footprint,
            pushed_blocks: BTreeMap::new(),
            attached_blocks: BTreeMap::new(),
            pulled_blocks: BTreeMap::new(),
            pushed_footprints: BTreeMap::new(),
            attached_footprints: BTreeMap::new(),
            pulled_footprints: BTreeMap::new(),
        }
    }
}

const BOTH_AXES: &[MachineAxis] = &[MachineAxis::Horizontal, MachineAxis::Vertical];
const HORIZONTAL_ONLY: &[MachineAxis] = &[MachineAxis::Horizontal];

fn counts(entries: &[(u32, u32)]) -> BTreeMap<u32, u32> {
    entries.iter().copied().collect()
}

fn footprints(entries: &[(u32, &[&[bool]])]) -> BTreeMap<u32, Vec<Vec<bool>>> {
    entries
        .iter()
        .map(|&(index, rows)| (index, rows.iter().map(|row| row.to_vec()).collect()))
        .collect()
}

/// Every known machine design, in the order they were measured.
pub fn flying_machines() -> Vec<FlyingMachine> {
    let mango = FlyingMachine {
        pushed_blocks: counts(&[(1, 2)]),
        pushed_footprints: footprints(&[(1, &[&[true, true]])]),
        attached_blocks: counts(&[(1, 6)]),
        attached_footprints: footprints(&[(1, &[&[false, true]])]),
        ..FlyingMachine::new(
            "MangoMachine",
            BOTH_AXES,
            false,
            true,
            8,
            0,
            vec![vec![true, true]],
        )
    };

    let mango_attached = FlyingMachine {
        attached_blocks: counts(&[(1, 2), (2, 6)]),
        attached_footprints: footprints(&[
            (1, &[&[true, false]]),
            (2, &[&[false, true]]),
        ]),
        ..FlyingMachine::new(
            "MangoMachineAttached",
            BOTH_AXES,
            false,
            true,
            8,
            0,
            vec![vec![true, true]],
        )
    };

    let l_shape_double_pusher = FlyingMachine {
        pushed_blocks: counts(&[(1, 11), (2, 11)]),
        pushed_footprints: footprints(&[
            (1, &[&[false, true], &[false, false]]),
            (2, &[&[false, false], &[false, true]]),
        ]),
        attached_blocks: counts(&[(1, 6), (2, 1)]),
        attached_footprints: footprints(&[
            (1, &[&[true, false], &[false, false]]),
            (2, &[&[false, true], &[false, true]]),
        ]),
        ..FlyingMachine::new(
            "LShapeDoublePusher",
            BOTH_AXES,
            true,
            false,
            9,
            0,
            vec![vec![true, true], vec![false, true]],
        )
    };

    // Tileable in principle, but never worth it for this design.
    let single_column_pusher = FlyingMachine {
        attached_blocks: counts(&[(1, 2)]),
        attached_footprints: footprints(&[(
            1,
            &[&[true], &[false], &[false], &[false]],
        )]),
        ..FlyingMachine::new(
            "SingleColumnPusher",
            HORIZONTAL_ONLY,
            true,
            false,
            10,
            6,
            vec![vec![true], vec![true], vec![false], vec![true]],
        )
    };

    // The mirrored variant tiles usefully in some arrangements.
    let single_column_pusher_sideways = FlyingMachine {
        attached_blocks: counts(&[(1, 2)]),
        attached_footprints: footprints(&[(
            1,
            &[&[false, false, true], &[false, false, false]],
        )]),
        ..FlyingMachine::new(
            "SingleColumnPusherSideways",
            HORIZONTAL_ONLY,
            true,
            true,
            10,
            6,
            vec![vec![false, true, true], vec![true, false, false]],
        )
    };

    vec![
        mango,
        mango_attached,
        l_shape_double_pusher,
        single_column_pusher,
        single_column_pusher_sideways,
    ]
}
