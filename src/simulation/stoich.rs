//! Stoichiometry matrix derivation and moiety conservation analysis.
//!
//! The stoichiometry matrix N relates reactions to species: rows are species,
//! columns are reactions, substrates carry negative and products positive
//! coefficients. Linear dependencies among its rows are conserved moieties:
//! combinations of concentrations invariant under the reaction fluxes. The
//! analysis splits species into an independent set (integrated) and a
//! dependent set (reconstructed algebraically), reducing the dimension of the
//! ODE system.

use nalgebra::{DMatrix, DVector};

use crate::model::Reaction;

/// Stoichiometry matrix over a fixed species row order.
#[derive(Debug, Clone)]
pub struct Stoichiometry {
    /// Species × reactions coefficient matrix.
    pub matrix: DMatrix<f64>,
    /// Row order: species ids.
    pub species: Vec<String>,
    /// Column order: reaction ids.
    pub reactions: Vec<String>,
}

/// Derives the stoichiometry matrix for the given species rows.
///
/// Species participating in a reaction but not listed in `species` (fixed or
/// assignment-determined concentrations) simply contribute no row; their
/// consumption/production does not feed back into the integrated state.
pub fn derive_stoichiometry(reactions: &[Reaction], species: &[String]) -> Stoichiometry {
    let n_species = species.len();
    let n_reactions = reactions.len();
    let mut matrix = DMatrix::zeros(n_species, n_reactions);

    let index_of = |id: &str| species.iter().position(|s| s == id);

    for (j, reaction) in reactions.iter().enumerate() {
        for substrate in &reaction.substrates {
            if let Some(i) = index_of(&substrate.species_id) {
                matrix[(i, j)] -= substrate.stoichiometry;
            }
        }
        for product in &reaction.products {
            if let Some(i) = index_of(&product.species_id) {
                matrix[(i, j)] += product.stoichiometry;
            }
        }
    }

    Stoichiometry {
        matrix,
        species: species.to_vec(),
        reactions: reactions.iter().map(|r| r.id.clone()).collect(),
    }
}

/// Result of the moiety conservation analysis over a stoichiometry matrix.
///
/// With the species rows partitioned into independent (R) and dependent (D)
/// rows such that `N_D = L0 · N_R`, the combinations `y_D − L0 · y_R` are
/// constant along every trajectory. The reduced system integrates only the
/// independent rows and reconstructs the dependent ones from the conserved
/// totals.
#[derive(Debug, Clone)]
pub struct ConservationAnalysis {
    /// Indices (into the stoichiometry row order) of independent species.
    pub independent: Vec<usize>,
    /// Indices of dependent species.
    pub dependent: Vec<usize>,
    /// Link matrix L0 (dependent × independent).
    pub link: DMatrix<f64>,
}

const RANK_EPS: f64 = 1e-9;

impl ConservationAnalysis {
    /// Analyzes the row space of the stoichiometry matrix.
    ///
    /// Rows are scanned in order; a row already representable as a linear
    /// combination of the accepted rows becomes dependent, with its
    /// combination coefficients forming one row of the link matrix.
    pub fn analyze(stoich: &Stoichiometry) -> Self {
        let n_species = stoich.matrix.nrows();
        let mut independent: Vec<usize> = Vec::new();
        let mut dependent: Vec<usize> = Vec::new();
        let mut link_rows: Vec<Vec<f64>> = Vec::new();

        for row in 0..n_species {
            let candidate: DVector<f64> = stoich.matrix.row(row).transpose().into();

            if candidate.norm() <= RANK_EPS {
                // A species untouched by every reaction is trivially conserved.
                dependent.push(row);
                link_rows.push(vec![0.0; independent.len()]);
                continue;
            }

            if independent.is_empty() {
                independent.push(row);
                continue;
            }

            // Solve basisᵀ · x = candidate in the least-squares sense and
            // check the residual to decide membership in the row span.
            let basis = DMatrix::from_fn(stoich.matrix.ncols(), independent.len(), |i, j| {
                stoich.matrix[(independent[j], i)]
            });

            let svd = basis.clone().svd(true, true);
            match svd.solve(&candidate, RANK_EPS) {
                Ok(coefficients) => {
                    let residual = (&basis * &coefficients) - &candidate;
                    if residual.norm() <= RANK_EPS * candidate.norm().max(1.0) {
                        dependent.push(row);
                        link_rows.push(coefficients.iter().copied().collect());
                    } else {
                        independent.push(row);
                    }
                }
                Err(_) => independent.push(row),
            }
        }

        // Earlier dependent rows may have shorter coefficient vectors than
        // the final independent count; pad them with zeros.
        let n_ind = independent.len();
        let link = DMatrix::from_fn(dependent.len(), n_ind, |i, j| {
            link_rows[i].get(j).copied().unwrap_or(0.0)
        });

        Self {
            independent,
            dependent,
            link,
        }
    }

    /// True when every species is independent and no reduction is possible.
    pub fn is_trivial(&self) -> bool {
        self.dependent.is_empty()
    }

    /// Conserved totals `T = y_D − L0 · y_R` for a full initial state over
    /// the stoichiometry row order.
    pub fn totals(&self, y0: &[f64]) -> Vec<f64> {
        self.dependent
            .iter()
            .enumerate()
            .map(|(d, &row)| {
                let mut total = y0[row];
                for (j, &ind_row) in self.independent.iter().enumerate() {
                    total -= self.link[(d, j)] * y0[ind_row];
                }
                total
            })
            .collect()
    }

    /// Reconstructs the full state (stoichiometry row order) from independent
    /// values and conserved totals.
    pub fn reconstruct(&self, y_independent: &[f64], totals: &[f64], full: &mut [f64]) {
        for (j, &row) in self.independent.iter().enumerate() {
            full[row] = y_independent[j];
        }
        for (d, &row) in self.dependent.iter().enumerate() {
            let mut value = totals[d];
            for (j, _) in self.independent.iter().enumerate() {
                value += self.link[(d, j)] * y_independent[j];
            }
            full[row] = value;
        }
    }
}
