//! Percentile-to-member reordering
//!
//! Calibrated percentiles carry no member identity. Reordering hands them back
//! to ensemble members so that each member keeps the rank it held in the raw
//! ensemble at every grid point (the Schaake shuffle), which restores the
//! spatial structure of the raw members. With random ordering the ranks are a
//! seeded random permutation instead.
//!
//! # References
//! - Clark, M. et al. (2004). "The Schaake Shuffle: A method for
//!   reconstructing space-time variability in forecasted precipitation and
//!   temperature fields." Journal of Hydrometeorology, 5(1), 243-262.

use crate::error::{Error, Result};
use crate::field::{DimCoord, Field, PERCENTILE, REALIZATION};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info};

/// Spreads per-point seeds across the 64-bit space
const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Generator for one grid point, independent of evaluation order
fn point_rng(base_seed: u64, point: usize) -> StdRng {
    StdRng::seed_from_u64(base_seed.wrapping_add((point as u64).wrapping_mul(SEED_STRIDE)))
}

/// Rank of each member: ascending by value, ties broken by member index.
fn member_ranks(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]).then(a.cmp(&b)));
    let mut ranks = vec![0; values.len()];
    for (rank, member) in order.into_iter().enumerate() {
        ranks[member] = rank;
    }
    ranks
}

/// Reorder `percentiles` into ensemble members.
///
/// The output has as many members as there are percentiles. When the raw
/// ensemble has fewer members they are recycled cyclically; when it has more,
/// only the first `N` are used. `random_seed` makes random ordering
/// reproducible; without it one draw of OS entropy seeds the call.
pub fn reorder(
    percentiles: &Field,
    raw_ensemble: &Field,
    random_ordering: bool,
    random_seed: Option<u64>,
) -> Result<Field> {
    let levels = percentiles
        .coord(PERCENTILE)
        .ok_or_else(|| Error::missing_dimension(percentiles.name(), PERCENTILE))?;
    let members = raw_ensemble
        .coord(REALIZATION)
        .ok_or_else(|| Error::missing_dimension(raw_ensemble.name(), REALIZATION))?;
    percentiles.check_same_grid(raw_ensemble, &[PERCENTILE, REALIZATION])?;

    if levels.is_empty() {
        return Err(Error::invalid("percentiles", "no percentile levels to reorder"));
    }
    if members.is_empty() {
        return Err(Error::invalid("raw_ensemble", "no members to take ranks from"));
    }
    let n = levels.len();
    let raw_members = members.len();

    let percentile_rows = percentiles.flatten_trailing(&[PERCENTILE])?.into_raw_vec();
    let raw_rows = raw_ensemble.flatten_trailing(&[REALIZATION])?.into_raw_vec();
    let points = percentile_rows.len() / n;

    let base_seed = random_seed.unwrap_or_else(|| rand::rng().random());
    info!(
        points,
        members = n,
        raw_members,
        random_ordering,
        "Reordering percentiles into ensemble members"
    );
    if raw_members != n {
        debug!(
            raw_members,
            members = n,
            "Raw member count differs from output count; recycling or truncating"
        );
    }

    let values: Vec<f64> = percentile_rows
        .par_chunks(n)
        .zip(raw_rows.par_chunks(raw_members))
        .enumerate()
        .flat_map_iter(|(point, (row, raw))| {
            let mut sorted = row.to_vec();
            sorted.sort_by(f64::total_cmp);

            let ranks = if random_ordering {
                let mut ranks: Vec<usize> = (0..n).collect();
                ranks.shuffle(&mut point_rng(base_seed, point));
                ranks
            } else {
                let members: Vec<f64> = (0..n).map(|j| raw[j % raw_members]).collect();
                member_ranks(&members)
            };
            ranks.into_iter().map(move |rank| sorted[rank])
        })
        .collect();

    let table = Array2::from_shape_vec((points, n), values).map_err(|e| Error::ShapeMismatch {
        field: percentiles.name().to_string(),
        detail: e.to_string(),
    })?;
    Field::from_point_table(
        percentiles.name(),
        percentiles.units(),
        DimCoord::index(REALIZATION, n),
        percentiles.leading_coords(&[PERCENTILE]),
        &table,
    )
}
