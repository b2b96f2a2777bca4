// meridian_core/src/estimation/outlier.rs

use crate::types::{CovMatrix, DifVector};
use log::debug;
use nalgebra::Cholesky;
use serde::{Deserialize, Serialize};

/// One contiguous group of measurement channels gated together.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutlierGroup {
    /// First residual index covered by this group.
    pub start: usize,
    /// Number of residual channels in the group.
    pub dim: usize,
    /// Squared-Mahalanobis rejection threshold.
    pub mahalanobis_threshold: f64,
    pub enabled: bool,
}

impl OutlierGroup {
    /// Declaring a group opts it in; use `enabled` or
    /// [`OutlierDetection::set_enabled_all`] to turn gating off.
    pub fn new(start: usize, dim: usize, mahalanobis_threshold: f64) -> Self {
        Self {
            start,
            dim,
            mahalanobis_threshold,
            enabled: true,
        }
    }
}

/// Per-channel-group outlier gating. Each call is stateless given its inputs,
/// so one detector serves any number of filter states.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutlierDetection {
    pub groups: Vec<OutlierGroup>,
}

impl OutlierDetection {
    pub fn new(groups: Vec<OutlierGroup>) -> Self {
        Self { groups }
    }

    pub fn set_enabled_all(&mut self, enabled: bool) {
        for group in &mut self.groups {
            group.enabled = enabled;
        }
    }

    /// Scores every enabled group against its marginal innovation-covariance
    /// block and suppresses rejected groups before gain computation: the
    /// residual segment is zeroed, the group's rows and columns of `py` are
    /// decoupled (the marginal block is kept so `py` stays positive
    /// definite), and the group's rows of the Jacobian or cross-covariance
    /// are zeroed. The filter's stored covariance is never touched here.
    ///
    /// Returns the per-group rejection decisions.
    pub fn process(
        &self,
        residual: &mut DifVector,
        py: &mut CovMatrix,
        sensitivity: &mut CovMatrix,
    ) -> Vec<bool> {
        let mut rejected = vec![false; self.groups.len()];
        for (g, group) in self.groups.iter().enumerate() {
            if !group.enabled {
                continue;
            }
            let seg = residual.rows(group.start, group.dim).into_owned();
            let block = py
                .view((group.start, group.start), (group.dim, group.dim))
                .into_owned();
            // A group whose marginal block cannot be factorized cannot be
            // scored; treat it as rejected.
            let dist2 = match Cholesky::new(block) {
                Some(chol) => seg.dot(&chol.solve(&seg)),
                None => f64::INFINITY,
            };
            if dist2 > group.mahalanobis_threshold {
                rejected[g] = true;
                debug!(
                    "outlier group {} rejected (d² = {:.3e} > {:.3e})",
                    g, dist2, group.mahalanobis_threshold
                );
                residual.rows_mut(group.start, group.dim).fill(0.0);
                let dy = py.nrows();
                for r in group.start..group.start + group.dim {
                    for c in 0..dy {
                        if c < group.start || c >= group.start + group.dim {
                            py[(r, c)] = 0.0;
                            py[(c, r)] = 0.0;
                        }
                    }
                }
                sensitivity.rows_mut(group.start, group.dim).fill(0.0);
            }
        }
        rejected
    }
}
