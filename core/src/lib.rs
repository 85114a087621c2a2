use anyhow::Context as _;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use varisat::{CnfFormula, ExtendFormula, Lit, Solver, Var};

pub mod machines;

/// Represents a 3D lattice position inside the geode bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Coord {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Coord { x, y, z }
    }

    pub fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Coord::new(self.x + dx, self.y + dy, self.z + dz)
    }

    /// The 6 axis-adjacent positions.
    pub fn neighbours(self) -> [Coord; 6] {
        [
            self.offset(0, 0, 1),
            self.offset(0, 1, 0),
            self.offset(1, 0, 0),
            self.offset(0, 0, -1),
            self.offset(0, -1, 0),
            self.offset(-1, 0, 0),
        ]
    }
}

/// The axis a projection travels along. `Y` is the vertical axis; only the
/// horizontal `X`/`Z` axes have alternate power-delivery paths for holes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Plane {
    X,
    Y,
    Z,
}

pub const PLANES: [Plane; 3] = [Plane::X, Plane::Y, Plane::Z];

impl Plane {
    pub fn is_vertical(self) -> bool {
        matches!(self, Plane::Y)
    }

    /// Drops the component parallel to this plane's axis, keeping the two
    /// orthogonal components in a fixed order.
    pub fn to_coord_2d(self, coord: Coord) -> (i32, i32) {
        match self {
            Plane::X => (coord.y, coord.z),
            Plane::Y => (coord.x, coord.z),
            Plane::Z => (coord.x, coord.y),
        }
    }

    /// The slice along this plane's axis that passes through `coord`.
    pub fn to_slice(self, coord: Coord) -> SliceKey {
        let (a, b) = self.to_coord_2d(coord);
        SliceKey { plane: self, a, b }
    }
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plane::X => write!(f, "X"),
            Plane::Y => write!(f, "Y"),
            Plane::Z => write!(f, "Z"),
        }
    }
}

/// Identifies a full line through the lattice parallel to `plane`'s axis, at
/// fixed orthogonal coordinates `(a, b)`. Firing a projection along a slice
/// breaks every budding amethyst the line passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceKey {
    pub plane: Plane,
    pub a: i32,
    pub b: i32,
}

impl SliceKey {
    pub fn offset(self, da: i32, db: i32) -> Self {
        SliceKey {
            plane: self.plane,
            a: self.a + da,
            b: self.b + db,
        }
    }

    /// The 4 in-plane adjacent slices.
    pub fn neighbours(self) -> [SliceKey; 4] {
        [
            self.offset(0, 1),
            self.offset(1, 0),
            self.offset(0, -1),
            self.offset(-1, 0),
        ]
    }
}

// --- Layout decoding ---

/// Compact geode description: layer height mapped to the `(a, b)` offsets of
/// the budding amethysts in that layer. The layer height becomes the `x`
/// component of the decoded coordinate, the offsets become `(y, z)`.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct GeodeLayout(pub BTreeMap<i32, Vec<(i32, i32)>>);

/// Rejected layout input. Raised before any solver variable is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    NegativeLayer(i32),
    NegativeOffset { layer: i32, offset: (i32, i32) },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::NegativeLayer(layer) => {
                write!(f, "layer height {} is negative", layer)
            }
            LayoutError::NegativeOffset { layer, offset } => {
                write!(
                    f,
                    "offset ({}, {}) in layer {} is outside the geode's local frame",
                    offset.0, offset.1, layer
                )
            }
        }
    }
}

impl std::error::Error for LayoutError {}

/// The coordinate sets the whole constraint system is derived from.
#[derive(Debug, Clone)]
pub struct DecodedLayout {
    /// Every position that starts out with a budding amethyst.
    pub buds: HashSet<Coord>,
    /// Every position that could hold an amethyst cluster: the union of the
    /// 6-neighbourhoods of all buds.
    pub clusters: HashSet<Coord>,
}

impl GeodeLayout {
    /// Expands the compact per-layer description into absolute coordinates.
    ///
    /// Positions that already hold a bud are intentionally kept in the
    /// cluster candidate set: the solver may break a bud and grow a cluster
    /// in its place, so both roles stay open until the search decides.
    pub fn decode(&self) -> Result<DecodedLayout, LayoutError> {
        for (&layer, offsets) in &self.0 {
            if layer < 0 {
                return Err(LayoutError::NegativeLayer(layer));
            }
            for &(a, b) in offsets {
                if a < 0 || b < 0 {
                    return Err(LayoutError::NegativeOffset {
                        layer,
                        offset: (a, b),
                    });
                }
            }
        }

        let buds: HashSet<Coord> = self
            .0
            .iter()
            .flat_map(|(&layer, offsets)| {
                offsets.iter().map(move |&(a, b)| Coord::new(layer, a, b))
            })
            .collect();

        let clusters: HashSet<Coord> = buds.iter().flat_map(|bud| bud.neighbours()).collect();

        Ok(DecodedLayout { buds, clusters })
    }
}

/// The measured geode this tool was written for: 82 budding amethysts spread
/// over 16 layers.
pub fn sample_geode() -> GeodeLayout {
    let layers: [(i32, &[(i32, i32)]); 16] = [
        (0, &[]),
        (1, &[(10, 9), (7, 6)]),
        (
            2,
            &[
                (13, 8),
                (12, 4),
                (11, 9),
                (9, 9),
                (8, 11),
                (8, 9),
                (7, 9),
                (7, 6),
                (6, 9),
                (5, 4),
            ],
        ),
        (
            3,
            &[
                (14, 8),
                (11, 3),
                (10, 12),
                (9, 11),
                (9, 4),
                (9, 2),
                (7, 12),
                (7, 10),
                (6, 12),
                (6, 5),
                (5, 8),
                (4, 9),
                (3, 8),
            ],
        ),
        (4, &[(13, 4), (9, 2), (5, 12), (3, 5), (2, 4)]),
        (5, &[(14, 11), (13, 11), (5, 11), (5, 3), (4, 10), (3, 4)]),
        (
            6,
            &[
                (15, 11),
                (13, 12),
                (11, 1),
                (9, 14),
                (6, 0),
                (3, 7),
                (3, 3),
                (2, 9),
            ],
        ),
        (7, &[(13, 13), (13, 12), (13, 2), (7, 14), (4, 10), (1, 5)]),
        (8, &[(16, 10), (1, 6), (1, 5)]),
        (9, &[(15, 9), (15, 5), (15, 4), (14, 4), (3, 6), (1, 3)]),
        (10, &[(15, 8), (15, 4), (14, 6), (13, 12), (10, 2), (5, 13)]),
        (
            11,
            &[
                (15, 8),
                (14, 10),
                (14, 7),
                (14, 5),
                (14, 4),
                (12, 11),
                (4, 11),
                (4, 9),
            ],
        ),
        (12, &[(12, 11), (6, 11), (4, 6)]),
        (13, &[(12, 6), (8, 8), (8, 6), (7, 8), (5, 7)]),
        (14, &[(9, 7)]),
        (15, &[]),
    ];

    GeodeLayout(
        layers
            .iter()
            .map(|&(layer, offsets)| (layer, offsets.to_vec()))
            .collect(),
    )
}

// --- Variable registry ---

fn fresh_var(next: &mut usize) -> Var {
    let var = Var::from_index(*next);
    *next += 1;
    var
}

/// One solver variable per decision, plus the bidirectional index between
/// coordinates and the slices passing through them. Built once per layout
/// and never touched again after `build_constraints` has claimed its
/// auxiliary variables.
#[derive(Debug, Clone)]
pub struct Variables {
    /// True means the budding amethyst at this position is kept intact.
    pub buds: BTreeMap<Coord, Var>,
    /// True means the position holds a live amethyst cluster.
    pub clusters: BTreeMap<Coord, Var>,
    /// True means a projection is fired along this slice.
    pub slices: BTreeMap<SliceKey, Var>,
    /// True means the cluster at this position is live *and* some active
    /// slice passes through it. These are the literals the score counts.
    pub harvested: BTreeMap<Coord, Var>,
    /// Every slice passing through a coordinate of interest (at most 3).
    pub coord_to_slices: BTreeMap<Coord, Vec<SliceKey>>,
    /// Every coordinate of interest a slice passes through.
    pub slice_to_coords: BTreeMap<SliceKey, Vec<Coord>>,
    var_count: usize,
}

impl Variables {
    pub fn new(layout: &DecodedLayout) -> Self {
        let mut next = 0usize;

        let buds: BTreeMap<Coord, Var> = layout
            .buds
            .iter()
            .sorted()
            .map(|&coord| (coord, fresh_var(&mut next)))
            .collect();
        let clusters: BTreeMap<Coord, Var> = layout
            .clusters
            .iter()
            .sorted()
            .map(|&coord| (coord, fresh_var(&mut next)))
            .collect();

        // Index every bud-or-cluster coordinate against the slices through it.
        let all_coords: BTreeSet<Coord> = layout
            .buds
            .iter()
            .chain(layout.clusters.iter())
            .copied()
            .collect();
        let mut coord_to_slices: BTreeMap<Coord, Vec<SliceKey>> = BTreeMap::new();
        let mut slice_to_coords: BTreeMap<SliceKey, Vec<Coord>> = BTreeMap::new();
        for plane in PLANES {
            for &coord in &all_coords {
                let slice = plane.to_slice(coord);
                coord_to_slices.entry(coord).or_default().push(slice);
                slice_to_coords.entry(slice).or_default().push(coord);
            }
        }

        let slices: BTreeMap<SliceKey, Var> = slice_to_coords
            .keys()
            .map(|&slice| (slice, fresh_var(&mut next)))
            .collect();
        let harvested: BTreeMap<Coord, Var> = clusters
            .keys()
            .map(|&coord| (coord, fresh_var(&mut next)))
            .collect();

        Variables {
            buds,
            clusters,
            slices,
            harvested,
            coord_to_slices,
            slice_to_coords,
            var_count: next,
        }
    }

    /// Total number of variables allocated so far, auxiliaries included.
    pub fn var_count(&self) -> usize {
        self.var_count
    }

    pub(crate) fn fresh_var(&mut self) -> Var {
        fresh_var(&mut self.var_count)
    }
}

// --- Hole guard ---

/// Offsets of the three projection groups that can still deliver power to a
/// horizontal 1x1 hole, relative to the hole's slice key:
///
/// ```text
///     B
///     B
///   AA#CC
///    #H#
///     #
/// ```
///
/// `H` is the hole, `#` are the blocked-in neighbours, and at least one of
/// the `A`, `B`, `C` pairs must be fully open for the hole to be reachable.
pub const POWER_GROUP_OFFSETS: [[(i32, i32); 2]; 3] =
    [[(-2, 1), (-1, 1)], [(0, 2), (0, 3)], [(1, 1), (1, 2)]];

/// Slices that would form unreachable 1x1 openings if fired alone.
#[derive(Debug, Clone)]
pub struct HoleGuard {
    /// Slices all of whose 4 in-plane neighbours are also valid slices.
    pub potential_holes: BTreeSet<SliceKey>,
    /// For horizontal holes only: the alternate power groups, filtered to
    /// slices that actually exist. Vertical holes have no alternate path.
    pub power_groups: BTreeMap<SliceKey, Vec<Vec<SliceKey>>>,
}

impl HoleGuard {
    pub fn new(vars: &Variables) -> Self {
        let potential_holes: BTreeSet<SliceKey> = vars
            .slices
            .keys()
            .filter(|slice| {
                slice
                    .neighbours()
                    .iter()
                    .all(|neighbour| vars.slices.contains_key(neighbour))
            })
            .copied()
            .collect();

        let mut power_groups = BTreeMap::new();
        for &hole in &potential_holes {
            if hole.plane.is_vertical() {
                continue;
            }
            let groups: Vec<Vec<SliceKey>> = POWER_GROUP_OFFSETS
                .iter()
                .map(|offsets| {
                    offsets
                        .iter()
                        .map(|&(da, db)| hole.offset(da, db))
                        .filter(|slice| vars.slices.contains_key(slice))
                        .collect()
                })
                .collect();
            power_groups.insert(hole, groups);
        }

        HoleGuard {
            potential_holes,
            power_groups,
        }
    }
}

// --- Constraint building ---

/// Assembles the full clause set relating buds, clusters, and slices.
///
/// The relations, in order:
/// 1. A live cluster needs a neighbouring live bud to have grown from.
/// 2. A live bud means every neighbour hosts a bud or a cluster (a cluster
///    for certain where no bud can exist).
/// 3. A position that could hold either role holds exactly one of the two.
/// 4. An active slice breaks every bud it passes through, and a live bud
///    rules out every slice through it (one clause covers both directions).
/// 5. A vertical 1x1 hole must widen itself by activating a neighbour.
/// 6. A horizontal 1x1 hole that is blocked in on all four sides needs one
///    of its alternate power groups fully active.
/// 7. A cluster counts as harvested exactly when it is live and some slice
///    through it is active.
pub fn build_constraints(vars: &mut Variables, guard: &HoleGuard) -> CnfFormula {
    let mut formula = CnfFormula::new();
    let pos = |var: Var| Lit::from_var(var, true);

    // Relation 1: cluster -> at least one neighbouring bud.
    for (&coord, &cluster) in &vars.clusters {
        let mut clause = vec![!pos(cluster)];
        for neighbour in coord.neighbours() {
            if let Some(&bud) = vars.buds.get(&neighbour) {
                clause.push(pos(bud));
            }
        }
        formula.add_clause(&clause);
    }

    // Relation 2: bud -> every neighbour hosts a bud or a cluster. The
    // cluster set contains every bud neighbour by construction.
    for (&coord, &bud) in &vars.buds {
        for neighbour in coord.neighbours() {
            let cluster = pos(vars.clusters[&neighbour]);
            match vars.buds.get(&neighbour) {
                Some(&neighbour_bud) => {
                    formula.add_clause(&[!pos(bud), pos(neighbour_bud), cluster])
                }
                None => formula.add_clause(&[!pos(bud), cluster]),
            }
        }
    }

    // Relation 3: bud xor cluster wherever both are possible.
    for (&coord, &bud) in &vars.buds {
        if let Some(&cluster) = vars.clusters.get(&coord) {
            formula.add_clause(&[pos(bud), pos(cluster)]);
            formula.add_clause(&[!pos(bud), !pos(cluster)]);
        }
    }

    // Relation 4: a live bud and an intersecting slice exclude each other.
    for (&coord, &bud) in &vars.buds {
        for slice in &vars.coord_to_slices[&coord] {
            formula.add_clause(&[!pos(bud), !pos(vars.slices[slice])]);
        }
    }

    // Relation 5: a vertical hole is only allowed when widened to 2x1.
    for &hole in &guard.potential_holes {
        if !hole.plane.is_vertical() {
            continue;
        }
        let mut clause = vec![!pos(vars.slices[&hole])];
        for neighbour in hole.neighbours() {
            clause.push(pos(vars.slices[&neighbour]));
        }
        formula.add_clause(&clause);
    }

    // Relation 6: a blocked-in horizontal hole needs a full power group. An
    // empty group lies entirely outside the slice set and is an empty
    // conjunction, so the hole is already reachable and no clause is needed.
    for (&hole, groups) in &guard.power_groups {
        if groups.iter().any(|group| group.is_empty()) {
            continue;
        }
        let mut clause = vec![!pos(vars.slices[&hole])];
        for neighbour in hole.neighbours() {
            clause.push(!pos(vars.slices[&neighbour]));
        }
        for group in groups {
            let active = pos(vars.fresh_var());
            for member in group {
                formula.add_clause(&[!active, pos(vars.slices[member])]);
            }
            clause.push(active);
        }
        formula.add_clause(&clause);
    }

    // Relation 7: harvested <-> cluster live and some slice through it.
    for (&coord, &harvested) in &vars.harvested {
        let cluster = pos(vars.clusters[&coord]);
        let slice_lits: Vec<Lit> = vars.coord_to_slices[&coord]
            .iter()
            .map(|slice| pos(vars.slices[slice]))
            .collect();

        formula.add_clause(&[!pos(harvested), cluster]);
        let mut any_slice = vec![!pos(harvested)];
        any_slice.extend(&slice_lits);
        formula.add_clause(&any_slice);
        for &slice in &slice_lits {
            formula.add_clause(&[!cluster, !slice, pos(harvested)]);
        }
    }

    formula
}

// --- Immutable per-layout context ---

/// Everything the optimizer needs, derived once from a single layout.
/// Keeping this explicit (rather than process-wide state) lets independent
/// layouts run in the same process.
pub struct GeodeContext {
    pub layout: DecodedLayout,
    pub vars: Variables,
    pub holes: HoleGuard,
    pub formula: CnfFormula,
}

impl GeodeContext {
    pub fn build(layout: &GeodeLayout) -> Result<GeodeContext, LayoutError> {
        let decoded = layout.decode()?;
        let mut vars = Variables::new(&decoded);
        let holes = HoleGuard::new(&vars);
        let formula = build_constraints(&mut vars, &holes);
        Ok(GeodeContext {
            layout: decoded,
            vars,
            holes,
            formula,
        })
    }
}

// --- Optimizer loop ---

/// A satisfying assignment, keyed back to the domain objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub buds: BTreeMap<Coord, bool>,
    pub clusters: BTreeMap<Coord, bool>,
    pub slices: BTreeMap<SliceKey, bool>,
}

impl Assignment {
    /// Flattens the assignment into a variable-name-to-value mapping.
    pub fn named(&self) -> BTreeMap<String, bool> {
        let mut named = BTreeMap::new();
        for (coord, &value) in &self.buds {
            named.insert(
                format!("budding_amethyst__{}__{}__{}", coord.x, coord.y, coord.z),
                value,
            );
        }
        for (coord, &value) in &self.clusters {
            named.insert(
                format!("amethyst_cluster__{}__{}__{}", coord.x, coord.y, coord.z),
                value,
            );
        }
        for (slice, &value) in &self.slices {
            named.insert(
                format!("slice__{}__{}__{}", slice.plane, slice.a, slice.b),
                value,
            );
        }
        named
    }
}

/// One improving iteration of the search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Improvement {
    /// Number of live clusters harvested by at least one active slice,
    /// recounted from the model rather than read off an aggregate.
    pub score: usize,
    /// Number of active slices in the same model.
    pub projections: usize,
    pub assignment: Assignment,
}

/// The observable state of the lower-bound tightening search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchState {
    /// No solver call has completed yet.
    Searching,
    /// The last solver call found an assignment at or above the bound.
    Improved(Improvement),
    /// No assignment reaches the current bound; the search is over.
    Exhausted,
}

/// The finished search: every improving iteration in order, and the best
/// one. `best` is `None` when not even the floor was feasible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOutcome {
    pub improvements: Vec<Improvement>,
    pub best: Option<Improvement>,
}

/// Repeatedly asks the solver for an assignment scoring at least the current
/// bound, raising the bound past each score found. Every iteration is an
/// independent solver instance over the same immutable clause set, so the
/// bound predicate is never permanently asserted. The bound only ever grows,
/// which caps the number of iterations at the cluster count.
pub struct Optimizer {
    ctx: GeodeContext,
    bound: usize,
    state: SearchState,
    best: Option<Improvement>,
}

impl Optimizer {
    /// `floor` is the lowest score the search will accept at all.
    pub fn new(ctx: GeodeContext, floor: usize) -> Self {
        Optimizer {
            ctx,
            bound: floor,
            state: SearchState::Searching,
            best: None,
        }
    }

    pub fn context(&self) -> &GeodeContext {
        &self.ctx
    }

    pub fn state(&self) -> &SearchState {
        &self.state
    }

    /// Best satisfying assignment found so far. Still available after a
    /// failed `step`, since a solver crash does not invalidate older models.
    pub fn best(&self) -> Option<&Improvement> {
        self.best.as_ref()
    }

    /// Runs one solver call. Returns `Exhausted` (and keeps returning it)
    /// once no assignment reaches the bound; any solver failure other than
    /// unsatisfiability is fatal and propagated.
    pub fn step(&mut self) -> anyhow::Result<SearchState> {
        if matches!(self.state, SearchState::Exhausted) {
            return Ok(SearchState::Exhausted);
        }

        let mut solver = Solver::new();
        solver.add_formula(&self.ctx.formula);

        // The ad-hoc bound predicate: at least `bound` harvested literals.
        let harvest_lits: Vec<Lit> = self
            .ctx
            .vars
            .harvested
            .values()
            .map(|&var| Lit::from_var(var, true))
            .collect();
        let mut bound_clauses = CnfFormula::new();
        let mut next_var = self.ctx.vars.var_count();
        encode_at_least_k(&mut bound_clauses, &mut next_var, &harvest_lits, self.bound);
        solver.add_formula(&bound_clauses);

        let satisfiable = solver
            .solve()
            .context("solver failed while checking the score bound")?;
        if !satisfiable {
            self.state = SearchState::Exhausted;
            return Ok(SearchState::Exhausted);
        }

        let model: HashSet<Lit> = solver
            .model()
            .context("satisfiable check returned no model")?
            .into_iter()
            .collect();
        let improvement = self.read_model(&model);

        self.bound = improvement.score + 1;
        self.best = Some(improvement.clone());
        self.state = SearchState::Improved(improvement.clone());
        Ok(SearchState::Improved(improvement))
    }

    /// Drives `step` until the bound is no longer reachable.
    pub fn run(&mut self) -> anyhow::Result<SearchOutcome> {
        let mut improvements = Vec::new();
        loop {
            match self.step()? {
                SearchState::Improved(improvement) => improvements.push(improvement),
                SearchState::Exhausted => break,
                SearchState::Searching => {}
            }
        }
        Ok(SearchOutcome {
            improvements,
            best: self.best.clone(),
        })
    }

    fn read_model(&self, model: &HashSet<Lit>) -> Improvement {
        let truthy = |var: Var| model.contains(&Lit::from_var(var, true));

        let assignment = Assignment {
            buds: self
                .ctx
                .vars
                .buds
                .iter()
                .map(|(&coord, &var)| (coord, truthy(var)))
                .collect(),
            clusters: self
                .ctx
                .vars
                .clusters
                .iter()
                .map(|(&coord, &var)| (coord, truthy(var)))
                .collect(),
            slices: self
                .ctx
                .vars
                .slices
                .iter()
                .map(|(&slice, &var)| (slice, truthy(var)))
                .collect(),
        };

        let mut score = 0;
        for (coord, &var) in &self.ctx.vars.clusters {
            if truthy(var)
                && self.ctx.vars.coord_to_slices[coord]
                    .iter()
                    .any(|slice| truthy(self.ctx.vars.slices[slice]))
            {
                score += 1;
            }
        }
        let projections = assignment.slices.values().filter(|&&active| active).count();

        Improvement {
            score,
            projections,
            assignment,
        }
    }
}

// --- Cardinality encoding ---

/// Naive clause expansion is only worth it below this many literals.
const NAIVE_AT_LEAST_LIMIT: usize = 10;

/// Encodes "at least `k` of `lits` are true", allocating auxiliary variables
/// from `next_var` onwards.
pub fn encode_at_least_k(
    formula: &mut CnfFormula,
    next_var: &mut usize,
    lits: &[Lit],
    k: usize,
) {
    if k == 0 {
        return; // Always satisfied.
    }
    if k > lits.len() {
        // Unsatisfiable - add empty clause.
        formula.add_clause(&[]);
        return;
    }

    if lits.len() <= NAIVE_AT_LEAST_LIMIT {
        // Every (n - k + 1)-subset must contain a true literal.
        for combo in lits.iter().copied().combinations(lits.len() - k + 1) {
            formula.add_clause(&combo);
        }
    } else {
        encode_counter_at_least_k(formula, next_var, lits, k);
    }
}

/// Sequential counter encoding for "at least k", sized O(n * k).
fn encode_counter_at_least_k(
    formula: &mut CnfFormula,
    next_var: &mut usize,
    lits: &[Lit],
    k: usize,
) {
    let n = lits.len();

    // register[i][j - 1] means "at least j of the first i + 1 literals hold".
    let mut register: Vec<Vec<Lit>> = Vec::with_capacity(n);
    for i in 0..n {
        let width = k.min(i + 1);
        register.push(
            (0..width)
                .map(|_| Lit::from_var(fresh_var(next_var), true))
                .collect(),
        );
    }

    // Base case: one-of-one requires the first literal itself.
    formula.add_clause(&[!register[0][0], lits[0]]);

    for i in 1..n {
        for j in 1..=register[i].len() {
            let here = register[i][j - 1];
            // "at least j" already held without the current literal.
            let carry = register[i - 1].get(j - 1).copied();
            // "at least j - 1" held without the current literal.
            let partial = if j >= 2 {
                register[i - 1].get(j - 2).copied()
            } else {
                None
            };

            match (carry, partial) {
                (Some(carry), Some(partial)) => {
                    formula.add_clause(&[!here, carry, lits[i]]);
                    formula.add_clause(&[!here, carry, partial]);
                }
                (Some(carry), None) => {
                    // j == 1: "at least 0 beforehand" is vacuous.
                    formula.add_clause(&[!here, carry, lits[i]]);
                }
                (None, Some(partial)) => {
                    // j == i + 1: every literal so far must hold.
                    formula.add_clause(&[!here, lits[i]]);
                    formula.add_clause(&[!here, partial]);
                }
                (None, None) => {
                    formula.add_clause(&[!here, lits[i]]);
                }
            }
        }
    }

    formula.add_clause(&[register[n - 1][k - 1]]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout_of(layers: &[(i32, &[(i32, i32)])]) -> GeodeLayout {
        GeodeLayout(
            layers
                .iter()
                .map(|&(layer, offsets)| (layer, offsets.to_vec()))
                .collect(),
        )
    }

    /// Recomputes the harvested-cluster count straight from an assignment,
    /// independent of anything the optimizer tracked.
    fn recomputed_score(ctx: &GeodeContext, assignment: &Assignment) -> usize {
        let mut score = 0;
        for (coord, &live) in &assignment.clusters {
            if live
                && ctx.vars.coord_to_slices[coord]
                    .iter()
                    .any(|slice| assignment.slices[slice])
            {
                score += 1;
            }
        }
        score
    }

    #[test]
    fn test_coord_neighbours_are_axis_steps() {
        let coord = Coord::new(3, -1, 7);
        let neighbours = coord.neighbours();
        assert_eq!(neighbours.len(), 6);
        for neighbour in neighbours {
            let distance = (neighbour.x - coord.x).abs()
                + (neighbour.y - coord.y).abs()
                + (neighbour.z - coord.z).abs();
            assert_eq!(distance, 1);
        }
        // All distinct.
        let unique: HashSet<Coord> = neighbours.into_iter().collect();
        assert_eq!(unique.len(), 6);
    }

    #[test]
    fn test_plane_projection() {
        let coord = Coord::new(1, 2, 3);
        assert_eq!(
            Plane::X.to_slice(coord),
            SliceKey { plane: Plane::X, a: 2, b: 3 }
        );
        assert_eq!(
            Plane::Y.to_slice(coord),
            SliceKey { plane: Plane::Y, a: 1, b: 3 }
        );
        assert_eq!(
            Plane::Z.to_slice(coord),
            SliceKey { plane: Plane::Z, a: 1, b: 2 }
        );
    }

    #[test]
    fn test_slice_neighbours_stay_in_plane() {
        let slice = SliceKey { plane: Plane::Z, a: 4, b: 4 };
        let neighbours = slice.neighbours();
        assert_eq!(neighbours.len(), 4);
        for neighbour in neighbours {
            assert_eq!(neighbour.plane, Plane::Z);
            let distance = (neighbour.a - slice.a).abs() + (neighbour.b - slice.b).abs();
            assert_eq!(distance, 1);
        }
    }

    #[test]
    fn test_decode_empty_layout() {
        let decoded = GeodeLayout::default().decode().unwrap();
        assert!(decoded.buds.is_empty());
        assert!(decoded.clusters.is_empty());
    }

    #[test]
    fn test_decode_single_bud() {
        let decoded = layout_of(&[(10, &[(9, 9)])]).decode().unwrap();
        assert_eq!(decoded.buds.len(), 1);
        assert!(decoded.buds.contains(&Coord::new(10, 9, 9)));
        // Exactly the 6 neighbours, none of which is the bud itself.
        assert_eq!(decoded.clusters.len(), 6);
        assert!(!decoded.clusters.contains(&Coord::new(10, 9, 9)));
    }

    #[test]
    fn test_decode_sample_geode() {
        let decoded = sample_geode().decode().unwrap();
        assert_eq!(decoded.buds.len(), 82);
        // Every cluster candidate is adjacent to at least one bud.
        for cluster in &decoded.clusters {
            assert!(
                cluster
                    .neighbours()
                    .iter()
                    .any(|neighbour| decoded.buds.contains(neighbour))
            );
        }
        // Adjacent buds keep their positions in the cluster candidate set.
        assert!(decoded.buds.contains(&Coord::new(7, 13, 12)));
        assert!(decoded.clusters.contains(&Coord::new(7, 13, 12)));
    }

    #[test]
    fn test_decode_rejects_negative_layer() {
        let err = layout_of(&[(-1, &[(0, 0)])]).decode().unwrap_err();
        assert_eq!(err, LayoutError::NegativeLayer(-1));
    }

    #[test]
    fn test_decode_rejects_negative_offset() {
        let err = layout_of(&[(3, &[(2, -5)])]).decode().unwrap_err();
        assert_eq!(
            err,
            LayoutError::NegativeOffset {
                layer: 3,
                offset: (2, -5),
            }
        );
    }

    #[test]
    fn test_registry_allocates_distinct_vars() {
        let decoded = layout_of(&[(10, &[(9, 9)])]).decode().unwrap();
        let vars = Variables::new(&decoded);

        let mut indices: Vec<usize> = vars
            .buds
            .values()
            .chain(vars.clusters.values())
            .chain(vars.slices.values())
            .chain(vars.harvested.values())
            .map(|var| var.index())
            .collect();
        let total = indices.len();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), total);
        assert_eq!(vars.var_count(), total);

        // One harvested literal per cluster candidate.
        assert_eq!(vars.harvested.len(), vars.clusters.len());
    }

    #[test]
    fn test_harvest_index_is_bidirectional() {
        let decoded = layout_of(&[(5, &[(3, 3), (3, 4)])]).decode().unwrap();
        let vars = Variables::new(&decoded);

        for (coord, slices) in &vars.coord_to_slices {
            // One slice per plane.
            assert_eq!(slices.len(), 3);
            for slice in slices {
                assert!(vars.slice_to_coords[slice].contains(coord));
            }
        }
        for (slice, coords) in &vars.slice_to_coords {
            for coord in coords {
                assert!(vars.coord_to_slices[coord].contains(slice));
            }
        }
    }

    #[test]
    fn test_vertical_hole_detection() {
        // Buds in three consecutive layers arranged so their Y-slice keys
        // (x, z) form a plus shape around (10, 10).
        let layout = layout_of(&[
            (9, &[(0, 10)]),
            (10, &[(0, 9), (0, 10), (0, 11)]),
            (11, &[(0, 10)]),
        ]);
        let decoded = layout.decode().unwrap();
        let vars = Variables::new(&decoded);
        let guard = HoleGuard::new(&vars);

        let centre = SliceKey { plane: Plane::Y, a: 10, b: 10 };
        assert!(guard.potential_holes.contains(&centre));
        // Vertical holes never get alternate power groups.
        assert!(!guard.power_groups.contains_key(&centre));
    }

    #[test]
    fn test_horizontal_hole_power_groups() {
        // A plus shape of buds within one layer surrounds the X-slice (9, 9)
        // with valid slices on all four sides.
        let layout = layout_of(&[(5, &[(9, 9), (8, 9), (10, 9), (9, 8), (9, 10)])]);
        let decoded = layout.decode().unwrap();
        let vars = Variables::new(&decoded);
        let guard = HoleGuard::new(&vars);

        let centre = SliceKey { plane: Plane::X, a: 9, b: 9 };
        assert!(guard.potential_holes.contains(&centre));

        // Only the group members that landed inside the slice set survive.
        let groups = &guard.power_groups[&centre];
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], vec![SliceKey { plane: Plane::X, a: 8, b: 10 }]);
        assert_eq!(groups[1], vec![SliceKey { plane: Plane::X, a: 9, b: 11 }]);
        assert_eq!(groups[2], vec![SliceKey { plane: Plane::X, a: 10, b: 10 }]);
    }

    #[test]
    fn test_at_least_k_naive_bounds() {
        // 3 free variables, at least 2 true: satisfiable.
        let mut formula = CnfFormula::new();
        let mut next = 0usize;
        let lits: Vec<Lit> = (0..3)
            .map(|_| Lit::from_var(fresh_var(&mut next), true))
            .collect();
        encode_at_least_k(&mut formula, &mut next, &lits, 2);

        let mut solver = Solver::new();
        solver.add_formula(&formula);
        assert!(solver.solve().unwrap());
        let model: HashSet<Lit> = solver.model().unwrap().into_iter().collect();
        let true_count = lits.iter().filter(|lit| model.contains(lit)).count();
        assert!(true_count >= 2);

        // Forcing two of the three false makes it unsatisfiable.
        let mut formula = CnfFormula::new();
        let mut next = 3usize;
        encode_at_least_k(&mut formula, &mut next, &lits, 2);
        formula.add_clause(&[!lits[0]]);
        formula.add_clause(&[!lits[1]]);
        let mut solver = Solver::new();
        solver.add_formula(&formula);
        assert!(!solver.solve().unwrap());
    }

    #[test]
    fn test_at_least_k_counter_bounds() {
        // 12 literals exercises the sequential counter path.
        let build = |forced_false: usize| {
            let mut formula = CnfFormula::new();
            let mut next = 0usize;
            let lits: Vec<Lit> = (0..12)
                .map(|_| Lit::from_var(fresh_var(&mut next), true))
                .collect();
            encode_at_least_k(&mut formula, &mut next, &lits, 5);
            for lit in lits.iter().take(forced_false) {
                formula.add_clause(&[!*lit]);
            }
            let mut solver = Solver::new();
            solver.add_formula(&formula);
            solver.solve().unwrap()
        };

        // 7 literals forced false leaves exactly 5: still satisfiable.
        assert!(build(7));
        // 8 forced false leaves only 4: unsatisfiable.
        assert!(!build(8));
    }

    #[test]
    fn test_at_least_zero_and_overcommit() {
        let mut formula = CnfFormula::new();
        let mut next = 0usize;
        let lits: Vec<Lit> = (0..2)
            .map(|_| Lit::from_var(fresh_var(&mut next), true))
            .collect();

        // At least 0 adds nothing.
        encode_at_least_k(&mut formula, &mut next, &lits, 0);
        assert_eq!(formula.len(), 0);

        // Asking for more than exists is a contradiction.
        encode_at_least_k(&mut formula, &mut next, &lits, 3);
        let mut solver = Solver::new();
        solver.add_formula(&formula);
        assert!(!solver.solve().unwrap());
    }

    #[test]
    fn test_optimizer_empty_layout() {
        let ctx = GeodeContext::build(&layout_of(&[])).unwrap();
        let mut optimizer = Optimizer::new(ctx, 0);
        let outcome = optimizer.run().unwrap();

        let best = outcome.best.unwrap();
        assert_eq!(best.score, 0);
        assert_eq!(best.projections, 0);
        assert!(best.assignment.buds.is_empty());
        // The degenerate instance is settled in a single improving iteration.
        assert_eq!(outcome.improvements.len(), 1);
    }

    #[test]
    fn test_optimizer_stays_exhausted() {
        let ctx = GeodeContext::build(&layout_of(&[])).unwrap();
        let mut optimizer = Optimizer::new(ctx, 0);
        optimizer.run().unwrap();

        assert_eq!(*optimizer.state(), SearchState::Exhausted);
        // Further steps are no-ops, not fresh solver calls.
        assert_eq!(optimizer.step().unwrap(), SearchState::Exhausted);
    }

    #[test]
    fn test_optimizer_single_bud() {
        let ctx = GeodeContext::build(&layout_of(&[(10, &[(9, 9)])])).unwrap();
        assert_eq!(ctx.layout.buds.len(), 1);
        assert_eq!(ctx.layout.clusters.len(), 6);

        let mut optimizer = Optimizer::new(ctx, 0);
        let outcome = optimizer.run().unwrap();
        let best = outcome.best.unwrap();

        // All six neighbours can be grown and harvested by slices that avoid
        // the bud, so the optimum is the full cluster set.
        assert_eq!(best.score, 6);
        assert!(best.assignment.buds[&Coord::new(10, 9, 9)]);
        assert!(best.assignment.clusters.values().all(|&live| live));

        // Improvement scores are strictly increasing.
        let scores: Vec<usize> = outcome
            .improvements
            .iter()
            .map(|improvement| improvement.score)
            .collect();
        assert!(scores.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(scores.last(), Some(&6));
    }

    #[test]
    fn test_optimizer_two_disjoint_components() {
        // Two buds far enough apart to share no coordinates and no slices;
        // the optimum is the sum of the per-component optima.
        let ctx =
            GeodeContext::build(&layout_of(&[(0, &[(5, 5)]), (40, &[(30, 30)])])).unwrap();
        let mut optimizer = Optimizer::new(ctx, 0);
        let outcome = optimizer.run().unwrap();
        assert_eq!(outcome.best.unwrap().score, 12);
    }

    #[test]
    fn test_model_respects_exclusions() {
        // Two buds adjacent along x, so each sits in the other's cluster
        // candidate set.
        let ctx =
            GeodeContext::build(&layout_of(&[(5, &[(9, 9)]), (6, &[(9, 9)])])).unwrap();
        let overlap: Vec<Coord> = ctx
            .vars
            .buds
            .keys()
            .filter(|coord| ctx.vars.clusters.contains_key(*coord))
            .copied()
            .collect();
        assert_eq!(overlap.len(), 2);

        let mut optimizer = Optimizer::new(ctx, 0);
        let outcome = optimizer.run().unwrap();
        let best = outcome.best.unwrap();
        let ctx = optimizer.context();

        // Exactly one of bud/cluster holds wherever both are possible.
        for coord in &overlap {
            let bud = best.assignment.buds[coord];
            let cluster = best.assignment.clusters[coord];
            assert!(bud ^ cluster, "coordinate {:?} must settle on one role", coord);
        }

        // An active slice never crosses a live bud, in either direction.
        for (coord, &live) in &best.assignment.buds {
            for slice in &ctx.vars.coord_to_slices[coord] {
                if best.assignment.slices[slice] {
                    assert!(!live);
                }
            }
        }

        // The reported score matches an independent recount.
        assert_eq!(best.score, recomputed_score(ctx, &best.assignment));
    }

    #[test]
    fn test_vertical_holes_never_isolated() {
        // The plus-shaped arrangement that produces a vertical potential
        // hole at (10, 10).
        let layout = layout_of(&[
            (9, &[(0, 10)]),
            (10, &[(0, 9), (0, 10), (0, 11)]),
            (11, &[(0, 10)]),
        ]);
        let ctx = GeodeContext::build(&layout).unwrap();
        let mut optimizer = Optimizer::new(ctx, 0);
        let outcome = optimizer.run().unwrap();
        let best = outcome.best.unwrap();
        let ctx = optimizer.context();

        for &hole in &ctx.holes.potential_holes {
            if !hole.plane.is_vertical() || !best.assignment.slices[&hole] {
                continue;
            }
            let widened = hole
                .neighbours()
                .iter()
                .any(|neighbour| best.assignment.slices[neighbour]);
            assert!(
                widened,
                "vertical slice {:?} fired as an isolated 1x1 hole",
                hole
            );
        }
    }

    #[test]
    fn test_horizontal_hole_requires_full_power_group() {
        // Four isolated buds whose X-slice neighbourhoods make (9, 9) a
        // potential hole with every power group fully present. The buds sit
        // on separate layers so breaking one never strands a cluster.
        let layout = layout_of(&[
            (10, &[(9, 9)]),
            (20, &[(8, 10)]),
            (30, &[(9, 11)]),
            (40, &[(10, 10)]),
        ]);
        let ctx = GeodeContext::build(&layout).unwrap();

        let hole = SliceKey { plane: Plane::X, a: 9, b: 9 };
        assert!(ctx.holes.potential_holes.contains(&hole));
        let groups = ctx.holes.power_groups[&hole].clone();
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(|group| group.len() == 2));

        // Fires the hole and all four in-plane neighbours, pins every group
        // member false except the freed group's, and asks for a model.
        let solve_with = |freed_group: Option<usize>| {
            let mut forced = CnfFormula::new();
            forced.add_clause(&[Lit::from_var(ctx.vars.slices[&hole], true)]);
            for neighbour in hole.neighbours() {
                forced.add_clause(&[Lit::from_var(ctx.vars.slices[&neighbour], true)]);
            }
            for (index, group) in groups.iter().enumerate() {
                let polarity = freed_group == Some(index);
                for member in group {
                    forced.add_clause(&[Lit::from_var(ctx.vars.slices[member], polarity)]);
                }
            }
            let mut solver = Solver::new();
            solver.add_formula(&ctx.formula);
            solver.add_formula(&forced);
            solver.solve().unwrap()
        };

        // With every power group silenced the hole cannot be reached.
        assert!(!solve_with(None));
        // Any single fully-active group restores reachability.
        for index in 0..groups.len() {
            assert!(solve_with(Some(index)), "group {} should power the hole", index);
        }
    }

    #[test]
    fn test_floor_above_optimum_is_infeasible() {
        // A single bud tops out at 6 harvested clusters; a floor of 7 must
        // come back empty-handed.
        let ctx = GeodeContext::build(&layout_of(&[(10, &[(9, 9)])])).unwrap();
        let mut optimizer = Optimizer::new(ctx, 7);
        let outcome = optimizer.run().unwrap();
        assert!(outcome.best.is_none());
        assert!(outcome.improvements.is_empty());
    }

    #[test]
    fn test_named_assignment_uses_stable_scheme() {
        let ctx = GeodeContext::build(&layout_of(&[(10, &[(9, 9)])])).unwrap();
        let mut optimizer = Optimizer::new(ctx, 0);
        let outcome = optimizer.run().unwrap();
        let named = outcome.best.unwrap().assignment.named();

        assert_eq!(named.get("budding_amethyst__10__9__9"), Some(&true));
        assert!(named.contains_key("amethyst_cluster__11__9__9"));
        assert!(named.contains_key("slice__X__9__9"));
    }
}
