//! # SPARSITY-RS
//!
//! Jacobian sparsity analysis and species reordering for the Kinetic
//! PreProcessor revival.
//!
//! ## Background
//!
//! The generated ODE solvers factor the Jacobian with a sparse LU that has no
//! pivoting, so the order of the variable species decides how many entries
//! the factorization touches. KPP derives the nonzero pattern from the
//! stoichiometry alone and searches for an ordering with little fill-in before
//! any code is written. A bad ordering never breaks the simulation, it only
//! makes it slower.
//!
//! ## Pipeline
//!
//! 1. **Classification**: variable, fixed, dummy blocks
//! 2. **Sparsity pattern**: `J[i][j]` set when `i` depends on `j`
//! 3. **Symbolic LU**: boolean elimination counting the fill
//! 4. **Orderings**: row degree, column degree, greedy minimum fill
//! 5. **Permutation**: stoichiometry rows and position map relabelled

use kpp_core::{
    KineticModel, KppError, ModelState, OrderingStrategy, ReorderConfig, Result, SpeciesCode,
    SpeciesCounts, SpeciesRole, StoichiometryStore,
};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, trace};

// =============================================================================
// SPARSITY PATTERN
// =============================================================================

/// Boolean Jacobian structure over the variable species (`structJ`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SparsityPattern {
    cells: Array2<bool>,
}

impl SparsityPattern {
    /// Diagonal-only pattern
    pub fn identity(n: usize) -> Self {
        let mut cells = Array2::from_elem((n, n), false);
        cells.diag_mut().fill(true);
        Self { cells }
    }

    /// Diagonal plus the listed `(row, column)` entries
    pub fn from_entries(n: usize, entries: &[(usize, usize)]) -> Self {
        let mut pattern = Self::identity(n);
        for &(i, j) in entries {
            pattern.cells[[i, j]] = true;
        }
        pattern
    }

    /// Structure of the Jacobian of the first `n_var` rows.
    ///
    /// `J[i][j]` is set when some reaction changes species `i` and consumes
    /// species `j`. Only the sign pattern matters, not the magnitudes.
    pub fn from_stoichiometry(store: &StoichiometryStore, n_var: usize) -> Self {
        let mut pattern = Self::identity(n_var);
        let net = store.net();
        let left = store.left();

        for k in 0..store.n_reactions() {
            let changed: Vec<usize> = (0..n_var).filter(|&i| net[[i, k]] != 0.0).collect();
            if changed.is_empty() {
                continue;
            }
            let consumed: Vec<usize> = (0..n_var).filter(|&j| left[[j, k]] != 0.0).collect();
            for &i in &changed {
                for &j in &consumed {
                    pattern.cells[[i, j]] = true;
                }
            }
        }
        pattern
    }

    pub fn dim(&self) -> usize {
        self.cells.nrows()
    }

    pub fn get(&self, i: usize, j: usize) -> bool {
        self.cells[[i, j]]
    }

    pub fn cells(&self) -> &Array2<bool> {
        &self.cells
    }

    pub fn nonzeros(&self) -> usize {
        self.cells.iter().filter(|&&c| c).count()
    }

    /// Entries set in row `i`
    pub fn row_degree(&self, i: usize) -> usize {
        self.cells.row(i).iter().filter(|&&c| c).count()
    }

    /// Entries set in column `j`
    pub fn column_degree(&self, j: usize) -> usize {
        self.cells.column(j).iter().filter(|&&c| c).count()
    }

    /// Symmetric relabelling: entry `(i, j)` of the result is
    /// `(order[i], order[j])` of `self`
    pub fn permuted(&self, order: &[usize]) -> Self {
        let n = order.len();
        let cells = Array2::from_shape_fn((n, n), |(i, j)| self.cells[[order[i], order[j]]]);
        Self { cells }
    }
}

// =============================================================================
// SYMBOLIC LU
// =============================================================================

/// Nonzeros of an LU factor, split at the diagonal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillCount {
    /// Strictly below the diagonal
    pub lower: usize,
    /// On or above the diagonal
    pub upper: usize,
}

impl FillCount {
    pub fn total(&self) -> usize {
        self.lower + self.upper
    }
}

/// Pivot-free symbolic Gaussian elimination, in place.
///
/// Row `i` absorbs the structure of pivot row `j` whenever `(i, j)` is set.
/// No cancellation is modelled, so the count may exceed the numeric
/// nonzeros but never falls below them.
pub fn symbolic_elimination(cells: &mut Array2<bool>) -> FillCount {
    let n = cells.nrows();
    for j in 0..n.saturating_sub(1) {
        for i in j + 1..n {
            if cells[[i, j]] {
                for k in j..n {
                    if cells[[j, k]] {
                        cells[[i, k]] = true;
                    }
                }
            }
        }
    }
    count_triangles(cells)
}

fn count_triangles(cells: &Array2<bool>) -> FillCount {
    let mut count = FillCount::default();
    for ((i, j), &set) in cells.indexed_iter() {
        if set {
            if i > j {
                count.lower += 1;
            } else {
                count.upper += 1;
            }
        }
    }
    count
}

/// LU structure of a sparsity pattern under its current ordering (`LUstructJ`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FillPattern {
    cells: Array2<bool>,
    count: FillCount,
}

impl FillPattern {
    pub fn from_pattern(pattern: &SparsityPattern) -> Self {
        let mut cells = pattern.cells().clone();
        let count = symbolic_elimination(&mut cells);
        Self { cells, count }
    }

    pub fn get(&self, i: usize, j: usize) -> bool {
        self.cells[[i, j]]
    }

    pub fn cells(&self) -> &Array2<bool> {
        &self.cells
    }

    pub fn count(&self) -> FillCount {
        self.count
    }

    pub fn nonzeros(&self) -> usize {
        self.count.total()
    }

    /// Every entry of `pattern` is also set here
    pub fn covers(&self, pattern: &SparsityPattern) -> bool {
        self.cells.dim() == pattern.cells().dim()
            && self
                .cells
                .iter()
                .zip(pattern.cells().iter())
                .all(|(&lu, &j)| lu || !j)
    }
}

/// Predicted LU nonzeros of `pattern` relabelled by `order`
pub fn predicted_nonzeros(pattern: &SparsityPattern, order: &[usize]) -> usize {
    FillPattern::from_pattern(&pattern.permuted(order)).nonzeros()
}

// =============================================================================
// SPARSE LAYOUT
// =============================================================================

/// Row-compressed coordinates of a boolean pattern, as consumed by the
/// emitted sparse routines
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseLayout {
    /// Row of each nonzero, row-major
    pub irow: Vec<usize>,
    /// Column of each nonzero
    pub icol: Vec<usize>,
    /// Offset of each row's first nonzero; `n + 1` entries
    pub crow: Vec<usize>,
    /// Offset of each row's diagonal entry
    pub diag: Vec<usize>,
}

impl SparseLayout {
    pub fn from_cells(cells: &Array2<bool>) -> Self {
        let n = cells.nrows();
        let mut layout = Self {
            crow: Vec::with_capacity(n + 1),
            diag: vec![0; n],
            ..Self::default()
        };
        for i in 0..n {
            layout.crow.push(layout.irow.len());
            for j in 0..cells.ncols() {
                if cells[[i, j]] {
                    if i == j {
                        layout.diag[i] = layout.irow.len();
                    }
                    layout.irow.push(i);
                    layout.icol.push(j);
                }
            }
        }
        layout.crow.push(layout.irow.len());
        layout
    }

    pub fn nonzeros(&self) -> usize {
        self.irow.len()
    }
}

// =============================================================================
// ORDERING HEURISTICS
// =============================================================================

/// A permutation of the variable species and its predicted LU nonzeros
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub strategy: OrderingStrategy,
    /// Species codes in proposed position order
    pub order: Vec<SpeciesCode>,
    pub nonzeros: usize,
}

impl Candidate {
    fn evaluate(
        strategy: OrderingStrategy,
        pattern: &SparsityPattern,
        variables: &[SpeciesCode],
        permutation: Vec<usize>,
    ) -> Self {
        let nonzeros = predicted_nonzeros(pattern, &permutation);
        let order = permutation.into_iter().map(|p| variables[p]).collect();
        debug!(%strategy, nonzeros, "evaluated candidate ordering");
        Self {
            strategy,
            order,
            nonzeros,
        }
    }
}

/// Row degree of every variable
pub fn row_degrees(pattern: &SparsityPattern) -> Vec<usize> {
    (0..pattern.dim()).map(|i| pattern.row_degree(i)).collect()
}

/// Column degree weighted by row degree
pub fn column_degree_keys(pattern: &SparsityPattern) -> Vec<usize> {
    (0..pattern.dim())
        .map(|i| pattern.column_degree(i) * pattern.row_degree(i))
        .collect()
}

/// Positions sorted by ascending key; equal keys put the higher code first
fn sort_positions(keys: &[usize], variables: &[SpeciesCode]) -> Vec<usize> {
    let mut positions: Vec<usize> = (0..keys.len()).collect();
    positions.sort_by(|&a, &b| {
        keys[a]
            .cmp(&keys[b])
            .then_with(|| variables[b].cmp(&variables[a]))
    });
    positions
}

/// Keep the current order
pub fn unsorted_ordering(pattern: &SparsityPattern, variables: &[SpeciesCode]) -> Candidate {
    let identity = (0..pattern.dim()).collect();
    Candidate::evaluate(OrderingStrategy::Unsorted, pattern, variables, identity)
}

/// Sort by ascending number of dependencies
pub fn row_degree_ordering(pattern: &SparsityPattern, variables: &[SpeciesCode]) -> Candidate {
    let permutation = sort_positions(&row_degrees(pattern), variables);
    Candidate::evaluate(OrderingStrategy::RowDegree, pattern, variables, permutation)
}

/// Sort by ascending in-degree times out-degree
pub fn column_degree_ordering(pattern: &SparsityPattern, variables: &[SpeciesCode]) -> Candidate {
    let permutation = sort_positions(&column_degree_keys(pattern), variables);
    Candidate::evaluate(OrderingStrategy::ColumnDegree, pattern, variables, permutation)
}

/// The cheaper of the two degree orderings; ties keep the row-degree one
pub fn cheapest_degree_ordering(
    pattern: &SparsityPattern,
    variables: &[SpeciesCode],
) -> Candidate {
    let (row, column) = rayon::join(
        || row_degree_ordering(pattern, variables),
        || column_degree_ordering(pattern, variables),
    );
    if row.nonzeros <= column.nonzeros {
        row
    } else {
        column
    }
}

/// Markowitz-style greedy minimum-fill ordering.
///
/// At step `s` the remaining index with the smallest
/// `(row nonzeros - 1) * (column nonzeros - 1)` over the trailing submatrix
/// is swapped into position `s`, then one elimination step is applied. The
/// returned cost comes from a full symbolic LU under the final order.
pub fn greedy_min_fill_ordering(
    pattern: &SparsityPattern,
    variables: &[SpeciesCode],
) -> Candidate {
    let n = pattern.dim();
    let mut work = pattern.cells().clone();
    let mut permutation: Vec<usize> = (0..n).collect();

    for s in 0..n.saturating_sub(1) {
        let mut best = usize::MAX;
        let mut best_i = s;
        for i in s..n {
            let row = (s..n).filter(|&j| work[[i, j]]).count();
            let col = (s..n).filter(|&j| work[[j, i]]).count();
            let score = row.saturating_sub(1) * col.saturating_sub(1);
            if score < best {
                best = score;
                best_i = i;
            }
        }
        trace!(step = s, pivot = variables[permutation[best_i]], score = best, "greedy pivot");

        if best_i != s {
            for k in 0..n {
                work.swap([s, k], [best_i, k]);
            }
            for k in 0..n {
                work.swap([k, s], [k, best_i]);
            }
            permutation.swap(s, best_i);
        }

        for i in s + 1..n {
            if work[[i, s]] {
                for k in s..n {
                    if work[[s, k]] {
                        work[[i, k]] = true;
                    }
                }
            }
        }
    }

    Candidate::evaluate(OrderingStrategy::GreedyMinFill, pattern, variables, permutation)
}

/// Run one strategy
pub fn ordering_for(
    strategy: OrderingStrategy,
    pattern: &SparsityPattern,
    variables: &[SpeciesCode],
) -> Candidate {
    match strategy {
        OrderingStrategy::Unsorted => unsorted_ordering(pattern, variables),
        OrderingStrategy::RowDegree => row_degree_ordering(pattern, variables),
        OrderingStrategy::ColumnDegree => column_degree_ordering(pattern, variables),
        OrderingStrategy::GreedyMinFill => greedy_min_fill_ordering(pattern, variables),
    }
}

/// Every strategy evaluated against the same pattern
pub fn candidate_orderings(pattern: &SparsityPattern, variables: &[SpeciesCode]) -> Vec<Candidate> {
    OrderingStrategy::ALL
        .iter()
        .map(|&strategy| ordering_for(strategy, pattern, variables))
        .collect()
}

/// Lowest predicted cost; the earliest candidate wins ties
pub fn cheapest(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().reduce(|best, c| if c.nonzeros < best.nonzeros { c } else { best })
}

// =============================================================================
// REORDERING DRIVER
// =============================================================================

/// How the variable block is ordered during classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableOrder {
    /// Ascending species code
    ByCode,
    /// Reactive species first, then ascending code
    ReactiveFirst,
    /// Verbatim, e.g. a candidate's order
    Explicit(Vec<SpeciesCode>),
}

/// Partition species into variable, fixed and dummy blocks and permute the
/// stoichiometry into that layout. Fixed and dummy species are always sorted
/// by code.
pub fn reorder_species(model: &mut KineticModel, order: &VariableOrder) -> Result<()> {
    let mut var = Vec::new();
    let mut fix = Vec::new();
    let mut dummy = Vec::new();
    for &code in model.positions().codes() {
        match model.species()[code].role {
            SpeciesRole::Variable => var.push(code),
            SpeciesRole::Fixed => fix.push(code),
            SpeciesRole::Dummy => dummy.push(code),
        }
    }

    match order {
        VariableOrder::ByCode => var.sort_unstable(),
        VariableOrder::ReactiveFirst => {
            let species = model.species();
            var.sort_by(|&a, &b| {
                species[b]
                    .reactive
                    .cmp(&species[a].reactive)
                    .then(a.cmp(&b))
            });
        }
        VariableOrder::Explicit(codes) => {
            let expected: HashSet<SpeciesCode> = var.iter().copied().collect();
            let given: HashSet<SpeciesCode> = codes.iter().copied().collect();
            if codes.len() != var.len() || given != expected {
                return Err(KppError::InternalConsistency(format!(
                    "explicit order lists {} codes but the model has {} variable species",
                    codes.len(),
                    var.len()
                )));
            }
            var.clone_from(codes);
        }
    }
    fix.sort_unstable();
    dummy.sort_unstable();

    let layout: Vec<SpeciesCode> = var.into_iter().chain(fix).chain(dummy).collect();
    model.apply_layout(layout)?;

    let next = if model.state() < ModelState::Classified {
        ModelState::Classified
    } else {
        ModelState::Reordered
    };
    model.advance_to(next);

    let counts = model.counts();
    debug!(
        variable = counts.variable,
        reactive = counts.reactive_variable,
        fixed = counts.fixed,
        dummy = counts.dummy,
        "species classified"
    );
    Ok(())
}

/// Jacobian pattern of the model's current variable block
pub fn sparsity_pattern(model: &KineticModel) -> SparsityPattern {
    SparsityPattern::from_stoichiometry(model.stoichiometry(), model.counts().variable)
}

/// Layout and sizes handed to the code emitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorderReport {
    pub model: String,
    pub strategy: OrderingStrategy,
    pub counts: SpeciesCounts,
    pub reactions: usize,
    /// Species codes by position, dummies last
    pub codes: Vec<SpeciesCode>,
    /// Species names by position
    pub names: Vec<String>,
    pub jacobian_nonzeros: usize,
    pub lu_nonzeros: usize,
    pub lu_count: FillCount,
    pub jacobian: SparseLayout,
    pub lu: SparseLayout,
}

/// Rebuild both patterns under the final layout
pub fn finalize(model: &mut KineticModel, strategy: OrderingStrategy) -> ReorderReport {
    let pattern = sparsity_pattern(model);
    let fill = FillPattern::from_pattern(&pattern);
    model.advance_to(ModelState::Finalized);

    let codes = model.positions().codes().to_vec();
    let names = codes.iter().map(|&c| model.species()[c].name.clone()).collect();

    ReorderReport {
        model: model.name.clone(),
        strategy,
        counts: model.counts(),
        reactions: model.n_reactions(),
        codes,
        names,
        jacobian_nonzeros: pattern.nonzeros(),
        lu_nonzeros: fill.nonzeros(),
        lu_count: fill.count(),
        jacobian: SparseLayout::from_cells(pattern.cells()),
        lu: SparseLayout::from_cells(fill.cells()),
    }
}

/// Classify, optionally reorder by the configured strategy, and finalize
pub fn compile(model: &mut KineticModel, config: &ReorderConfig) -> Result<ReorderReport> {
    let initial = if config.use_jacobian {
        VariableOrder::ReactiveFirst
    } else {
        VariableOrder::ByCode
    };
    reorder_species(model, &initial)?;

    let mut applied = OrderingStrategy::Unsorted;
    if config.use_jacobian && config.strategy != OrderingStrategy::Unsorted {
        let pattern = sparsity_pattern(model);
        model.advance_to(ModelState::SparsityAnalyzed);
        let candidate = ordering_for(config.strategy, &pattern, model.variable_codes());
        info!(
            strategy = %candidate.strategy,
            nonzeros = candidate.nonzeros,
            "optimized variable ordering for sparsity"
        );
        reorder_species(model, &VariableOrder::Explicit(candidate.order))?;
        applied = config.strategy;
    }

    let report = finalize(model, applied);
    info!(
        jacobian = report.jacobian_nonzeros,
        lu = report.lu_nonzeros,
        "sparsity structure finalized"
    );
    Ok(report)
}

fn classified_pattern(model: &KineticModel) -> Result<(SparsityPattern, Vec<SpeciesCode>)> {
    let mut scratch = model.clone();
    reorder_species(&mut scratch, &VariableOrder::ReactiveFirst)?;
    Ok((sparsity_pattern(&scratch), scratch.variable_codes().to_vec()))
}

/// Evaluate every strategy on a classified copy of `model`
pub fn compare_strategies(model: &KineticModel) -> Result<Vec<Candidate>> {
    let (pattern, variables) = classified_pattern(model)?;
    Ok(candidate_orderings(&pattern, &variables))
}

/// Row-degree versus column-degree pick on a classified copy of `model`
pub fn degree_choice(model: &KineticModel) -> Result<Candidate> {
    let (pattern, variables) = classified_pattern(model)?;
    let choice = cheapest_degree_ordering(&pattern, &variables);
    info!(strategy = %choice.strategy, nonzeros = choice.nonzeros, "degree ordering selected");
    Ok(choice)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kpp_core::{Capacity, ModelBuilder};

    fn build(b: ModelBuilder) -> KineticModel {
        b.build(&Capacity::default()).unwrap()
    }

    /// A + B -> C with C fixed
    fn two_variable_model() -> KineticModel {
        let mut b = ModelBuilder::new("scenario1");
        let a = b.add_species("A", SpeciesRole::Variable);
        let bb = b.add_species("B", SpeciesRole::Variable);
        let c = b.add_species("C", SpeciesRole::Fixed);
        b.add_reaction(&[(a, 1.0), (bb, 1.0)], &[(c, 1.0)]);
        build(b)
    }

    /// X0 -> X1 -> ... -> X(n-1)
    fn chain_model(n: usize) -> KineticModel {
        let mut b = ModelBuilder::new("chain");
        let codes: Vec<_> = (0..n)
            .map(|i| b.add_species(&format!("X{i}"), SpeciesRole::Variable))
            .collect();
        for w in codes.windows(2) {
            b.add_reaction(&[(w[0], 1.0)], &[(w[1], 1.0)]);
        }
        build(b)
    }

    /// Mixed roles with declaration order interleaving them
    fn mixed_model() -> KineticModel {
        let mut b = ModelBuilder::new("mixed");
        let m = b.add_species("M", SpeciesRole::Fixed);
        let no = b.add_species("NO", SpeciesRole::Variable);
        let hv = b.add_species("hv", SpeciesRole::Dummy);
        let no2 = b.add_species("NO2", SpeciesRole::Variable);
        let o3 = b.add_species("O3", SpeciesRole::Variable);
        let o2 = b.add_species("O2", SpeciesRole::Fixed);
        let o = b.add_species("O", SpeciesRole::Variable);
        let prod = b.add_species("PROD", SpeciesRole::Variable);
        b.add_reaction(&[(no2, 1.0), (hv, 1.0)], &[(no, 1.0), (o, 1.0)]);
        b.add_reaction(&[(o, 1.0), (o2, 1.0), (m, 1.0)], &[(o3, 1.0), (m, 1.0)]);
        b.add_reaction(&[(o3, 1.0), (no, 1.0)], &[(no2, 1.0), (o2, 1.0)]);
        b.add_reaction(&[(no2, 1.0)], &[(prod, 1.0)]);
        build(b)
    }

    /// Star: a hub coupled both ways to every leaf
    fn star_pattern(n: usize) -> SparsityPattern {
        let mut entries = Vec::new();
        for leaf in 1..n {
            entries.push((0, leaf));
            entries.push((leaf, 0));
        }
        SparsityPattern::from_entries(n, &entries)
    }

    fn assert_partitioned(model: &KineticModel) {
        let counts = model.counts();
        for position in 0..model.positions().len() {
            let role = model.species_at(position).role;
            let expected = if position < counts.variable {
                SpeciesRole::Variable
            } else if position < counts.variable + counts.fixed {
                SpeciesRole::Fixed
            } else {
                SpeciesRole::Dummy
            };
            assert_eq!(role, expected, "position {position}");
        }
        assert_eq!(counts.total, counts.variable + counts.fixed);
    }

    #[test]
    fn test_scenario_shared_reaction_full_pattern() {
        let mut model = two_variable_model();
        reorder_species(&mut model, &VariableOrder::ReactiveFirst).unwrap();
        let pattern = sparsity_pattern(&model);
        assert_eq!(pattern.dim(), 2);
        assert!(pattern.get(0, 0) && pattern.get(1, 1));
        assert!(pattern.get(0, 1) && pattern.get(1, 0));
        assert_eq!(pattern.nonzeros(), 4);
        assert_eq!(FillPattern::from_pattern(&pattern).nonzeros(), 4);
    }

    #[test]
    fn test_scenario_diagonal_system_has_no_fill() {
        let mut b = ModelBuilder::new("diagonal");
        let sink = b.add_species("SINK", SpeciesRole::Fixed);
        let vars: Vec<_> = (0..5)
            .map(|i| b.add_species(&format!("V{i}"), SpeciesRole::Variable))
            .collect();
        for &v in &vars {
            b.add_reaction(&[(v, 1.0)], &[(sink, 1.0)]);
        }
        let mut model = build(b);
        reorder_species(&mut model, &VariableOrder::ByCode).unwrap();

        let pattern = sparsity_pattern(&model);
        assert_eq!(pattern, SparsityPattern::identity(5));
        for order in [vec![0, 1, 2, 3, 4], vec![4, 3, 2, 1, 0], vec![2, 0, 4, 1, 3]] {
            assert_eq!(predicted_nonzeros(&pattern, &order), 5);
        }
    }

    #[test]
    fn test_scenario_chain_keeps_natural_order() {
        let mut model = chain_model(6);
        reorder_species(&mut model, &VariableOrder::ByCode).unwrap();
        let pattern = sparsity_pattern(&model);
        // lower bidiagonal
        assert_eq!(pattern.nonzeros(), 6 + 5);
        assert!(pattern.get(3, 2) && !pattern.get(2, 3));

        let greedy = greedy_min_fill_ordering(&pattern, model.variable_codes());
        assert_eq!(greedy.order, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(greedy.nonzeros, pattern.nonzeros());

        // pivoting on an interior link first couples its two neighbours
        let interior_first = [2, 0, 1, 3, 4, 5];
        assert!(predicted_nonzeros(&pattern, &interior_first) > pattern.nonzeros());
    }

    #[test]
    fn test_star_hub_last_avoids_fill() {
        let pattern = star_pattern(5);
        let variables: Vec<SpeciesCode> = (0..5).collect();
        // hub first fills the whole matrix
        assert_eq!(predicted_nonzeros(&pattern, &[0, 1, 2, 3, 4]), 25);

        // leaves are eliminated before the hub; the hub only needs to
        // precede the last leaf
        let greedy = greedy_min_fill_ordering(&pattern, &variables);
        assert_eq!(greedy.order, vec![1, 2, 3, 0, 4]);
        assert_eq!(greedy.nonzeros, pattern.nonzeros());
    }

    #[test]
    fn test_symbolic_elimination_counts() {
        // hub at index 0 spreads to every row
        let mut cells = star_pattern(4).cells().clone();
        let count = symbolic_elimination(&mut cells);
        assert_eq!(count.lower, 6);
        assert_eq!(count.upper, 10);
        assert_eq!(count.total(), 16);
        assert!(cells.iter().all(|&c| c));
    }

    #[test]
    fn test_fill_superset_and_diagonal_for_every_strategy() {
        let mut model = mixed_model();
        reorder_species(&mut model, &VariableOrder::ReactiveFirst).unwrap();
        let pattern = sparsity_pattern(&model);
        let variables = model.variable_codes().to_vec();

        for candidate in candidate_orderings(&pattern, &variables) {
            let permutation: Vec<usize> = candidate
                .order
                .iter()
                .map(|code| variables.iter().position(|v| v == code).unwrap())
                .collect();
            let permuted = pattern.permuted(&permutation);
            let fill = FillPattern::from_pattern(&permuted);

            for i in 0..permuted.dim() {
                assert!(permuted.get(i, i), "{}: diagonal {i}", candidate.strategy);
            }
            assert!(fill.covers(&permuted), "{}", candidate.strategy);
            assert!(fill.nonzeros() >= permuted.nonzeros());
            assert_eq!(fill.nonzeros(), candidate.nonzeros);
        }
    }

    #[test]
    fn test_pattern_ignores_magnitudes_and_catalysts() {
        // 2 A + K -> B + K : K is a catalyst with zero net change
        let mut b = ModelBuilder::new("catalyst");
        let a = b.add_species("A", SpeciesRole::Variable);
        let bb = b.add_species("B", SpeciesRole::Variable);
        let k = b.add_species("K", SpeciesRole::Variable);
        b.add_reaction(&[(a, 2.0), (k, 1.0)], &[(bb, 1.0), (k, 1.0)]);
        let mut model = build(b);
        reorder_species(&mut model, &VariableOrder::ByCode).unwrap();
        let pattern = sparsity_pattern(&model);

        assert!(pattern.get(0, 2) && pattern.get(1, 2));
        // K itself never changes, so its row is only the diagonal
        assert_eq!(pattern.row_degree(2), 1);
        // B is not consumed, so its column is only the diagonal
        assert_eq!(pattern.column_degree(1), 1);
    }

    #[test]
    fn test_degree_orderings_and_tie_break() {
        // row degrees: [2, 1, 3, 1]
        let pattern = SparsityPattern::from_entries(4, &[(0, 2), (2, 0), (2, 1)]);
        let variables = vec![10, 11, 12, 13];
        assert_eq!(row_degrees(&pattern), vec![2, 1, 3, 1]);

        let row = row_degree_ordering(&pattern, &variables);
        // ties on degree 1 put the higher code first
        assert_eq!(row.order, vec![13, 11, 10, 12]);

        // column degrees [2, 2, 2, 1] times row degrees
        assert_eq!(column_degree_keys(&pattern), vec![4, 2, 6, 1]);
        let column = column_degree_ordering(&pattern, &variables);
        assert_eq!(column.order, vec![13, 11, 10, 12]);
    }

    #[test]
    fn test_degree_selection_is_monotone() {
        let patterns = [
            star_pattern(6),
            SparsityPattern::from_entries(4, &[(0, 2), (2, 0), (2, 1)]),
            SparsityPattern::from_entries(5, &[(0, 4), (1, 4), (4, 2), (3, 0), (2, 3)]),
        ];
        for pattern in &patterns {
            let variables: Vec<SpeciesCode> = (0..pattern.dim()).collect();
            let chosen = cheapest_degree_ordering(pattern, &variables);
            let row = row_degree_ordering(pattern, &variables);
            let column = column_degree_ordering(pattern, &variables);
            assert!(chosen.nonzeros <= row.nonzeros);
            assert!(chosen.nonzeros <= column.nonzeros);
            if row.nonzeros == column.nonzeros {
                assert_eq!(chosen.strategy, OrderingStrategy::RowDegree);
            }
        }
    }

    #[test]
    fn test_cheapest_prefers_earliest_on_ties() {
        let pattern = SparsityPattern::identity(3);
        let variables = vec![0, 1, 2];
        let candidates = candidate_orderings(&pattern, &variables);
        assert_eq!(candidates.len(), 4);
        let best = cheapest(&candidates).unwrap();
        assert_eq!(best.strategy, OrderingStrategy::Unsorted);
        assert!(cheapest(&[]).is_none());
    }

    #[test]
    fn test_reorder_partition_and_permutation_invariants() {
        for strategy in OrderingStrategy::ALL {
            let mut model = mixed_model();
            let config = ReorderConfig {
                strategy,
                ..ReorderConfig::default()
            };
            let report = compile(&mut model, &config).unwrap();

            assert_partitioned(&model);
            let positions = model.positions();
            assert!(positions.is_consistent());
            for code in 0..model.species().len() {
                assert_eq!(positions.code_at(positions.position_of(code)), code);
            }
            assert_eq!(report.counts.variable, 5);
            assert_eq!(report.counts.fixed, 2);
            assert_eq!(report.counts.dummy, 1);
            assert_eq!(report.counts.total, 7);
            // fixed block sorted by code, dummy stored last
            assert_eq!(&report.codes[5..], &[0, 5, 2]);
            assert_eq!(model.state(), ModelState::Finalized);
        }
    }

    #[test]
    fn test_unsorted_puts_reactive_variables_first() {
        let mut model = mixed_model();
        reorder_species(&mut model, &VariableOrder::ReactiveFirst).unwrap();
        // PROD (code 7) is the only inert variable
        assert_eq!(model.variable_codes(), &[1, 3, 4, 6, 7]);
        assert_eq!(model.counts().reactive_variable, 4);
        assert_eq!(model.state(), ModelState::Classified);
    }

    #[test]
    fn test_stoichiometry_follows_species() {
        let original = mixed_model();
        let mut model = original.clone();
        compile(&mut model, &ReorderConfig::default()).unwrap();

        let before = original.stoichiometry();
        let after = model.stoichiometry();
        for code in 0..model.species().len() {
            let p = model.positions().position_of(code);
            assert_eq!(after.left().row(p), before.left().row(code));
            assert_eq!(after.right().row(p), before.right().row(code));
            assert_eq!(after.net().row(p), before.net().row(code));
        }
    }

    #[test]
    fn test_unsorted_is_idempotent() {
        let mut model = mixed_model();
        reorder_species(&mut model, &VariableOrder::ReactiveFirst).unwrap();
        let store = model.stoichiometry().clone();
        let codes = model.positions().codes().to_vec();

        reorder_species(&mut model, &VariableOrder::ReactiveFirst).unwrap();
        assert_eq!(model.stoichiometry(), &store);
        assert_eq!(model.positions().codes(), codes.as_slice());
    }

    #[test]
    fn test_greedy_order_applied_verbatim() {
        let mut model = mixed_model();
        let candidates = compare_strategies(&model).unwrap();
        let greedy = candidates
            .iter()
            .find(|c| c.strategy == OrderingStrategy::GreedyMinFill)
            .unwrap()
            .clone();

        let report = compile(&mut model, &ReorderConfig::default()).unwrap();
        assert_eq!(report.strategy, OrderingStrategy::GreedyMinFill);
        assert_eq!(model.variable_codes(), greedy.order.as_slice());
        assert_eq!(report.lu_nonzeros, greedy.nonzeros);
        assert_eq!(report.jacobian_nonzeros, sparsity_pattern(&model).nonzeros());
    }

    #[test]
    fn test_degree_choice_matches_strategy_table() {
        for model in [mixed_model(), chain_model(5), two_variable_model()] {
            let candidates = compare_strategies(&model).unwrap();
            let cost = |strategy: OrderingStrategy| {
                candidates
                    .iter()
                    .find(|c| c.strategy == strategy)
                    .map(|c| c.nonzeros)
                    .unwrap()
            };
            let row = cost(OrderingStrategy::RowDegree);
            let column = cost(OrderingStrategy::ColumnDegree);

            let choice = degree_choice(&model).unwrap();
            assert_eq!(choice.nonzeros, row.min(column));
            let expected = if row <= column {
                OrderingStrategy::RowDegree
            } else {
                OrderingStrategy::ColumnDegree
            };
            assert_eq!(choice.strategy, expected);
        }
    }

    #[test]
    fn test_without_jacobian_orders_by_code() {
        let mut model = mixed_model();
        let config = ReorderConfig {
            use_jacobian: false,
            ..ReorderConfig::default()
        };
        let report = compile(&mut model, &config).unwrap();
        assert_eq!(report.strategy, OrderingStrategy::Unsorted);
        assert_eq!(model.variable_codes(), &[1, 3, 4, 6, 7]);
        assert_eq!(model.state(), ModelState::Finalized);
    }

    #[test]
    fn test_explicit_order_must_cover_variables() {
        let mut model = mixed_model();
        reorder_species(&mut model, &VariableOrder::ByCode).unwrap();
        let err = reorder_species(&mut model, &VariableOrder::Explicit(vec![1, 3, 4, 6]))
            .unwrap_err();
        assert!(matches!(err, KppError::InternalConsistency(_)));
        let err = reorder_species(&mut model, &VariableOrder::Explicit(vec![1, 3, 4, 6, 0]))
            .unwrap_err();
        assert!(matches!(err, KppError::InternalConsistency(_)));
    }

    #[test]
    fn test_sparse_layout_offsets() {
        let pattern = SparsityPattern::from_entries(3, &[(0, 2), (2, 1)]);
        let layout = SparseLayout::from_cells(pattern.cells());
        assert_eq!(layout.nonzeros(), 5);
        assert_eq!(layout.irow, vec![0, 0, 1, 2, 2]);
        assert_eq!(layout.icol, vec![0, 2, 1, 1, 2]);
        assert_eq!(layout.crow, vec![0, 2, 3, 5]);
        assert_eq!(layout.diag, vec![0, 2, 4]);
    }

    #[test]
    fn test_report_layouts_match_counts() {
        let mut model = mixed_model();
        let report = compile(&mut model, &ReorderConfig::default()).unwrap();
        assert_eq!(report.jacobian.nonzeros(), report.jacobian_nonzeros);
        assert_eq!(report.lu.nonzeros(), report.lu_nonzeros);
        assert_eq!(report.lu_count.total(), report.lu_nonzeros);
        assert!(report.lu_nonzeros >= report.jacobian_nonzeros);
        assert_eq!(report.jacobian.crow.len(), report.counts.variable + 1);

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"strategy\":\"greedy-min-fill\""));
    }
}
