//! # KPP Core
//!
//! Shared types for the Kinetic PreProcessor revival.
//!
//! ## History
//!
//! KPP was written by Valeriu Damian and Adrian Sandu (1995-2005). It turns a
//! list of chemical reactions into simulation code: ODE right-hand side,
//! Jacobian and sparse LU routines. Its C core kept every per-species table in
//! fixed-size global arrays and selected the active variable ordering by
//! comparing pointers.
//!
//! This crate keeps the data model and replaces the globals with owned,
//! dynamically sized containers whose invariants are checked on construction:
//!
//! 1. **Species table**: stable codes, roles and reactivity
//! 2. **Stoichiometry store**: left, right and net coefficient matrices
//! 3. **Position mapping**: species code <-> current row, always a bijection
//! 4. **Configuration**: the Jacobian toggle and ordering strategy

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Stable species identifier assigned in declaration order
pub type SpeciesCode = usize;

/// Stoichiometric coefficient
pub type Coefficient = f64;

/// Default species table size
pub const DEFAULT_MAX_SPECIES: usize = 8000;

/// Default reaction table size
pub const DEFAULT_MAX_REACTIONS: usize = 16000;

// =============================================================================
// ERRORS
// =============================================================================

/// Common errors
#[derive(Debug, Error)]
pub enum KppError {
    #[error("Capacity exceeded: {count} {table} (limit {limit})")]
    Capacity {
        table: &'static str,
        count: usize,
        limit: usize,
    },

    #[error("Unknown species: {0}")]
    UnknownSpecies(String),

    #[error("Duplicate species: {0}")]
    DuplicateSpecies(String),

    #[error("Internal consistency fault: {0}")]
    InternalConsistency(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KppError>;

// =============================================================================
// SPECIES
// =============================================================================

/// Species role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeciesRole {
    /// Concentration is integrated
    Variable,
    /// Concentration is held constant
    Fixed,
    /// Placeholder, ignored by the solver
    Dummy,
}

/// Species table entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Species {
    pub code: SpeciesCode,
    pub name: String,
    pub role: SpeciesRole,
    /// Appears as a reactant somewhere
    pub reactive: bool,
}

/// Species counts handed to the code emitter.
///
/// `total` excludes dummy species; they stay in storage after the fixed
/// block but take no further part in the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeciesCounts {
    pub total: usize,
    pub variable: usize,
    pub reactive_variable: usize,
    pub fixed: usize,
    pub dummy: usize,
}

impl SpeciesCounts {
    fn from_species(species: &[Species]) -> Self {
        let mut counts = Self::default();
        for s in species {
            match s.role {
                SpeciesRole::Variable => {
                    counts.variable += 1;
                    if s.reactive {
                        counts.reactive_variable += 1;
                    }
                }
                SpeciesRole::Fixed => counts.fixed += 1,
                SpeciesRole::Dummy => counts.dummy += 1,
            }
        }
        counts.total = counts.variable + counts.fixed;
        counts
    }
}

// =============================================================================
// CAPACITY
// =============================================================================

/// Table limits enforced when a model is allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub max_species: usize,
    pub max_reactions: usize,
}

impl Default for Capacity {
    fn default() -> Self {
        Self {
            max_species: DEFAULT_MAX_SPECIES,
            max_reactions: DEFAULT_MAX_REACTIONS,
        }
    }
}

impl Capacity {
    /// Check species and reaction counts against the limits
    pub fn check(&self, n_species: usize, n_reactions: usize) -> Result<()> {
        if n_species > self.max_species {
            return Err(KppError::Capacity {
                table: "species",
                count: n_species,
                limit: self.max_species,
            });
        }
        if n_reactions > self.max_reactions {
            return Err(KppError::Capacity {
                table: "reactions",
                count: n_reactions,
                limit: self.max_reactions,
            });
        }
        Ok(())
    }
}

// =============================================================================
// STOICHIOMETRY STORE
// =============================================================================

/// Left, right and net stoichiometry, indexed `[position, reaction]`.
///
/// The three matrices always share one shape and are permuted together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoichiometryTables")]
pub struct StoichiometryStore {
    left: Array2<Coefficient>,
    right: Array2<Coefficient>,
    net: Array2<Coefficient>,
}

/// Unchecked serialized form of a store
#[derive(Deserialize)]
struct StoichiometryTables {
    left: Array2<Coefficient>,
    right: Array2<Coefficient>,
    net: Array2<Coefficient>,
}

impl TryFrom<StoichiometryTables> for StoichiometryStore {
    type Error = KppError;

    fn try_from(tables: StoichiometryTables) -> Result<Self> {
        let store = Self::from_sides(tables.left, tables.right)?;
        if store.net != tables.net {
            return Err(KppError::InternalConsistency(
                "net stoichiometry differs from right - left".into(),
            ));
        }
        Ok(store)
    }
}

impl StoichiometryStore {
    pub fn zeros(n_species: usize, n_reactions: usize) -> Self {
        Self {
            left: Array2::zeros((n_species, n_reactions)),
            right: Array2::zeros((n_species, n_reactions)),
            net: Array2::zeros((n_species, n_reactions)),
        }
    }

    /// Build from reactant and product matrices; `net = right - left`
    pub fn from_sides(left: Array2<Coefficient>, right: Array2<Coefficient>) -> Result<Self> {
        if left.dim() != right.dim() {
            return Err(KppError::InternalConsistency(format!(
                "left stoichiometry is {:?} but right is {:?}",
                left.dim(),
                right.dim()
            )));
        }
        let net = &right - &left;
        Ok(Self { left, right, net })
    }

    pub fn n_species(&self) -> usize {
        self.left.nrows()
    }

    pub fn n_reactions(&self) -> usize {
        self.left.ncols()
    }

    pub fn left(&self) -> &Array2<Coefficient> {
        &self.left
    }

    pub fn right(&self) -> &Array2<Coefficient> {
        &self.right
    }

    pub fn net(&self) -> &Array2<Coefficient> {
        &self.net
    }

    /// Accumulate a reactant coefficient
    pub fn add_reactant(&mut self, row: usize, reaction: usize, coefficient: Coefficient) {
        self.left[[row, reaction]] += coefficient;
        self.net[[row, reaction]] -= coefficient;
    }

    /// Accumulate a product coefficient
    pub fn add_product(&mut self, row: usize, reaction: usize, coefficient: Coefficient) {
        self.right[[row, reaction]] += coefficient;
        self.net[[row, reaction]] += coefficient;
    }

    /// Relabel rows: row `i` of the result is row `source[i]` of `self`
    pub fn permuted(&self, source: &[usize]) -> Self {
        Self {
            left: self.left.select(Axis(0), source),
            right: self.right.select(Axis(0), source),
            net: self.net.select(Axis(0), source),
        }
    }
}

// =============================================================================
// POSITION MAPPING
// =============================================================================

/// Bijection between species codes and storage positions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PositionCodes")]
pub struct PositionMap {
    code_at: Vec<SpeciesCode>,
    position_of: Vec<usize>,
}

/// Serialized form: codes in position order; the inverse is rebuilt
#[derive(Deserialize)]
struct PositionCodes {
    code_at: Vec<SpeciesCode>,
}

impl TryFrom<PositionCodes> for PositionMap {
    type Error = KppError;

    fn try_from(codes: PositionCodes) -> Result<Self> {
        Self::from_codes(codes.code_at)
    }
}

impl PositionMap {
    /// Position `i` holds species code `i`
    pub fn identity(n: usize) -> Self {
        Self {
            code_at: (0..n).collect(),
            position_of: (0..n).collect(),
        }
    }

    /// Build from the codes in position order, rebuilding the inverse
    pub fn from_codes(code_at: Vec<SpeciesCode>) -> Result<Self> {
        let n = code_at.len();
        let mut position_of = vec![usize::MAX; n];
        for (position, &code) in code_at.iter().enumerate() {
            if code >= n || position_of[code] != usize::MAX {
                return Err(KppError::InternalConsistency(format!(
                    "position mapping is not a permutation of [0, {n}): code {code} at position {position}"
                )));
            }
            position_of[code] = position;
        }
        Ok(Self {
            code_at,
            position_of,
        })
    }

    pub fn len(&self) -> usize {
        self.code_at.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code_at.is_empty()
    }

    pub fn code_at(&self, position: usize) -> SpeciesCode {
        self.code_at[position]
    }

    pub fn position_of(&self, code: SpeciesCode) -> usize {
        self.position_of[code]
    }

    /// Codes in position order
    pub fn codes(&self) -> &[SpeciesCode] {
        &self.code_at
    }

    /// Both directions agree for every species
    pub fn is_consistent(&self) -> bool {
        self.code_at.len() == self.position_of.len()
            && self
                .code_at
                .iter()
                .enumerate()
                .all(|(position, &code)| self.position_of.get(code) == Some(&position))
    }
}

// =============================================================================
// MODEL
// =============================================================================

/// Compilation state; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModelState {
    Parsed,
    Classified,
    SparsityAnalyzed,
    Reordered,
    Finalized,
}

/// A parsed kinetic model: species table, stoichiometry and layout.
///
/// Only constructed through `ModelBuilder` or `ModelDescription`, so it has
/// no `Deserialize`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KineticModel {
    pub name: String,
    /// Indexed by species code
    species: Vec<Species>,
    /// Rows indexed by position
    stoichiometry: StoichiometryStore,
    positions: PositionMap,
    counts: SpeciesCounts,
    state: ModelState,
}

impl KineticModel {
    pub fn species(&self) -> &[Species] {
        &self.species
    }

    /// Species stored at `position`
    pub fn species_at(&self, position: usize) -> &Species {
        &self.species[self.positions.code_at(position)]
    }

    pub fn stoichiometry(&self) -> &StoichiometryStore {
        &self.stoichiometry
    }

    pub fn positions(&self) -> &PositionMap {
        &self.positions
    }

    pub fn counts(&self) -> SpeciesCounts {
        self.counts
    }

    pub fn n_reactions(&self) -> usize {
        self.stoichiometry.n_reactions()
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    /// Move to `state` unless the model is already past it
    pub fn advance_to(&mut self, state: ModelState) {
        self.state = self.state.max(state);
    }

    /// Codes of the variable block, in position order
    pub fn variable_codes(&self) -> &[SpeciesCode] {
        &self.positions.codes()[..self.counts.variable]
    }

    /// Physically permute every per-species row into `layout`.
    ///
    /// `layout` lists species codes by new position and must put the
    /// variable block first, then fixed, then dummy species.
    pub fn apply_layout(&mut self, layout: Vec<SpeciesCode>) -> Result<()> {
        if layout.len() != self.species.len() {
            return Err(KppError::InternalConsistency(format!(
                "layout covers {} of {} species",
                layout.len(),
                self.species.len()
            )));
        }
        let positions = PositionMap::from_codes(layout)?;
        self.check_partition(&positions)?;

        let source: Vec<usize> = positions
            .codes()
            .iter()
            .map(|&code| self.positions.position_of(code))
            .collect();
        self.stoichiometry = self.stoichiometry.permuted(&source);
        self.positions = positions;
        self.counts = SpeciesCounts::from_species(&self.species);
        Ok(())
    }

    fn check_partition(&self, positions: &PositionMap) -> Result<()> {
        let mut expected = SpeciesRole::Variable;
        for (position, &code) in positions.codes().iter().enumerate() {
            let role = self.species[code].role;
            let ok = match (expected, role) {
                (SpeciesRole::Variable, _) => true,
                (SpeciesRole::Fixed, SpeciesRole::Variable) => false,
                (SpeciesRole::Fixed, _) => true,
                (SpeciesRole::Dummy, r) => r == SpeciesRole::Dummy,
            };
            if !ok {
                return Err(KppError::InternalConsistency(format!(
                    "{:?} species '{}' at position {} follows a {:?} block",
                    role, self.species[code].name, position, expected
                )));
            }
            expected = role;
        }
        Ok(())
    }
}

// =============================================================================
// MODEL BUILDER
// =============================================================================

/// Incremental model construction, standing in for the equation parser
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    name: String,
    species: Vec<(String, SpeciesRole, Option<bool>)>,
    reactions: Vec<Reaction>,
}

#[derive(Debug, Clone, Default)]
struct Reaction {
    reactants: Vec<(SpeciesCode, Coefficient)>,
    products: Vec<(SpeciesCode, Coefficient)>,
}

impl ModelBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Declare a species; reactivity is derived from the reactions
    pub fn add_species(&mut self, name: &str, role: SpeciesRole) -> SpeciesCode {
        self.species.push((name.to_string(), role, None));
        self.species.len() - 1
    }

    /// Declare a species with explicit reactivity
    pub fn add_species_with_reactivity(
        &mut self,
        name: &str,
        role: SpeciesRole,
        reactive: bool,
    ) -> SpeciesCode {
        self.species.push((name.to_string(), role, Some(reactive)));
        self.species.len() - 1
    }

    /// Add a reaction and return its index
    pub fn add_reaction(
        &mut self,
        reactants: &[(SpeciesCode, Coefficient)],
        products: &[(SpeciesCode, Coefficient)],
    ) -> usize {
        self.reactions.push(Reaction {
            reactants: reactants.to_vec(),
            products: products.to_vec(),
        });
        self.reactions.len() - 1
    }

    /// Allocate the tables and fill the stoichiometry store
    pub fn build(self, capacity: &Capacity) -> Result<KineticModel> {
        let n_species = self.species.len();
        let n_reactions = self.reactions.len();
        capacity.check(n_species, n_reactions)?;

        let mut stoichiometry = StoichiometryStore::zeros(n_species, n_reactions);
        for (k, reaction) in self.reactions.iter().enumerate() {
            for &(code, coefficient) in &reaction.reactants {
                check_code(code, n_species)?;
                stoichiometry.add_reactant(code, k, coefficient);
            }
            for &(code, coefficient) in &reaction.products {
                check_code(code, n_species)?;
                stoichiometry.add_product(code, k, coefficient);
            }
        }

        let species: Vec<Species> = self
            .species
            .into_iter()
            .enumerate()
            .map(|(code, (name, role, reactive))| {
                let reactive = reactive.unwrap_or_else(|| {
                    stoichiometry.left().row(code).iter().any(|&c| c != 0.0)
                });
                Species {
                    code,
                    name,
                    role,
                    reactive,
                }
            })
            .collect();

        let counts = SpeciesCounts::from_species(&species);
        debug!(
            model = %self.name,
            species = n_species,
            reactions = n_reactions,
            "allocated stoichiometry tables"
        );

        Ok(KineticModel {
            name: self.name,
            species,
            stoichiometry,
            positions: PositionMap::identity(n_species),
            counts,
            state: ModelState::Parsed,
        })
    }
}

fn check_code(code: SpeciesCode, n_species: usize) -> Result<()> {
    if code >= n_species {
        return Err(KppError::UnknownSpecies(format!("code {code}")));
    }
    Ok(())
}

// =============================================================================
// MODEL DESCRIPTION (JSON)
// =============================================================================

/// Species entry of a model description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeciesDescription {
    pub name: String,
    pub role: SpeciesRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactive: Option<bool>,
}

/// Reaction entry: `[name, coefficient]` pairs on each side.
///
/// A species listed twice on one side has its coefficients summed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReactionDescription {
    #[serde(default)]
    pub reactants: Vec<(String, Coefficient)>,
    #[serde(default)]
    pub products: Vec<(String, Coefficient)>,
}

/// Serialized model, as produced by an external equation parser
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelDescription {
    #[serde(default)]
    pub name: String,
    pub species: Vec<SpeciesDescription>,
    #[serde(default)]
    pub reactions: Vec<ReactionDescription>,
}

impl ModelDescription {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Resolve species names and build the model
    pub fn into_model(self, capacity: &Capacity) -> Result<KineticModel> {
        let mut builder = ModelBuilder::new(&self.name);
        let mut codes: HashMap<String, SpeciesCode> = HashMap::new();

        for s in &self.species {
            if codes.contains_key(&s.name) {
                return Err(KppError::DuplicateSpecies(s.name.clone()));
            }
            let code = match s.reactive {
                Some(reactive) => builder.add_species_with_reactivity(&s.name, s.role, reactive),
                None => builder.add_species(&s.name, s.role),
            };
            codes.insert(s.name.clone(), code);
        }

        let resolve = |side: &[(String, Coefficient)]| -> Result<Vec<(SpeciesCode, Coefficient)>> {
            side.iter()
                .map(|(name, c)| {
                    codes
                        .get(name)
                        .map(|&code| (code, *c))
                        .ok_or_else(|| KppError::UnknownSpecies(name.clone()))
                })
                .collect()
        };

        for r in &self.reactions {
            let reactants = resolve(r.reactants.as_slice())?;
            let products = resolve(r.products.as_slice())?;
            builder.add_reaction(&reactants, &products);
        }

        builder.build(capacity)
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Variable ordering strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderingStrategy {
    /// Reactive variables first, then by code
    Unsorted,
    /// Ascending row degree of the Jacobian pattern
    RowDegree,
    /// Ascending column degree times row degree
    ColumnDegree,
    /// Markowitz-style greedy elimination
    GreedyMinFill,
}

impl OrderingStrategy {
    pub const ALL: [OrderingStrategy; 4] = [
        Self::Unsorted,
        Self::RowDegree,
        Self::ColumnDegree,
        Self::GreedyMinFill,
    ];
}

impl fmt::Display for OrderingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unsorted => "unsorted",
            Self::RowDegree => "row-degree",
            Self::ColumnDegree => "column-degree",
            Self::GreedyMinFill => "greedy-min-fill",
        };
        f.write_str(name)
    }
}

/// Reordering parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReorderConfig {
    /// Run the Jacobian sparsity analysis at all
    pub use_jacobian: bool,
    /// Strategy applied when `use_jacobian` is set
    pub strategy: OrderingStrategy,
    /// Table limits
    pub capacity: Capacity,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            use_jacobian: true,
            strategy: OrderingStrategy::GreedyMinFill,
            capacity: Capacity::default(),
        }
    }
}

impl ReorderConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// =============================================================================
// TESTS
// =============================================================================
