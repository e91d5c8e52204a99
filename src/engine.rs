// Aglogen Assistant — Fractal engine boundary
//
// Numerical analyses live behind `FractalEngine`. `SampledBoxCounter` is a
// small in-process estimator used when no native engine is wired in.

use std::collections::HashSet;
use std::time::Instant;

use crate::store::GeometryRow;

#[derive(Debug, Clone, PartialEq)]
pub struct BoxCountingResult {
    pub dimension: f64,
    pub r_squared: f64,
    pub std_error: f64,
    pub confidence_interval: [f64; 2],
    pub log_scales: Vec<f64>,
    pub log_values: Vec<f64>,
    pub execution_time_ms: u64,
}

pub trait FractalEngine: Send + Sync {
    fn name(&self) -> &str;

    fn box_counting(
        &self,
        geometry: &[GeometryRow],
        points_per_sphere: u32,
        precision: u32,
    ) -> anyhow::Result<BoxCountingResult>;
}

/// Box counting over points sampled on each sphere surface.
#[derive(Debug, Default, Clone)]
pub struct SampledBoxCounter;

impl FractalEngine for SampledBoxCounter {
    fn name(&self) -> &str {
        "sampled-box-counter"
    }

    fn box_counting(
        &self,
        geometry: &[GeometryRow],
        points_per_sphere: u32,
        precision: u32,
    ) -> anyhow::Result<BoxCountingResult> {
        let start = Instant::now();
        if geometry.len() < 2 {
            anyhow::bail!("box counting needs at least 2 particles");
        }
        if precision < 3 {
            anyhow::bail!("precision must be at least 3");
        }

        let points = sample_surfaces(geometry, points_per_sphere.max(1) as usize);
        let (min, extent) = bounding_box(&points);
        if extent <= 0.0 {
            anyhow::bail!("geometry has zero extent");
        }

        // Box sizes from the full extent down to a fraction of the smallest radius.
        let r_min = geometry
            .iter()
            .map(|g| g[3])
            .fold(f64::INFINITY, f64::min)
            .max(extent * 1e-4);
        let largest = extent;
        let smallest = r_min.min(largest / 2.0);
        let ratio = (smallest / largest).powf(1.0 / (precision - 1) as f64);

        let mut log_scales = Vec::with_capacity(precision as usize);
        let mut log_values = Vec::with_capacity(precision as usize);
        let mut size = largest;
        for _ in 0..precision {
            let mut boxes: HashSet<(i64, i64, i64)> = HashSet::new();
            for p in &points {
                boxes.insert((
                    ((p[0] - min[0]) / size).floor() as i64,
                    ((p[1] - min[1]) / size).floor() as i64,
                    ((p[2] - min[2]) / size).floor() as i64,
                ));
            }
            log_scales.push((1.0 / size).ln());
            log_values.push((boxes.len() as f64).ln());
            size *= ratio;
        }

        let fit = linear_fit(&log_scales, &log_values);
        let margin = 1.96 * fit.std_error;
        Ok(BoxCountingResult {
            dimension: fit.slope,
            r_squared: fit.r_squared,
            std_error: fit.std_error,
            confidence_interval: [fit.slope - margin, fit.slope + margin],
            log_scales,
            log_values,
            execution_time_ms: start.elapsed().as_millis() as u64,
        })
    }
}

fn sample_surfaces(geometry: &[GeometryRow], per_sphere: usize) -> Vec<[f64; 3]> {
    let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    let mut points = Vec::with_capacity(geometry.len() * per_sphere);
    for g in geometry {
        for i in 0..per_sphere {
            let y = if per_sphere == 1 {
                0.0
            } else {
                1.0 - 2.0 * i as f64 / (per_sphere - 1) as f64
            };
            let r = (1.0 - y * y).max(0.0).sqrt();
            let theta = golden * i as f64;
            points.push([
                g[0] + g[3] * r * theta.cos(),
                g[1] + g[3] * y,
                g[2] + g[3] * r * theta.sin(),
            ]);
        }
    }
    points
}

fn bounding_box(points: &[[f64; 3]]) -> ([f64; 3], f64) {
    let mut min = [f64::INFINITY; 3];
    let mut max = [f64::NEG_INFINITY; 3];
    for p in points {
        for k in 0..3 {
            min[k] = min[k].min(p[k]);
            max[k] = max[k].max(p[k]);
        }
    }
    let extent = (0..3).map(|k| max[k] - min[k]).fold(0.0, f64::max);
    (min, extent)
}

struct Fit {
    slope: f64,
    r_squared: f64,
    std_error: f64,
}

/// Ordinary least squares.
fn linear_fit(x: &[f64], y: &[f64]) -> Fit {
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let sxx: f64 = x.iter().map(|v| (v - mean_x).powi(2)).sum();
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| (a - mean_x) * (b - mean_y)).sum();
    let syy: f64 = y.iter().map(|v| (v - mean_y).powi(2)).sum();
    if sxx == 0.0 {
        return Fit {
            slope: 0.0,
            r_squared: 0.0,
            std_error: 0.0,
        };
    }
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let ss_res: f64 = x
        .iter()
        .zip(y)
        .map(|(a, b)| (b - (intercept + slope * a)).powi(2))
        .sum();
    let r_squared = if syy == 0.0 { 1.0 } else { 1.0 - ss_res / syy };
    let std_error = if n > 2.0 {
        (ss_res / (n - 2.0) / sxx).sqrt()
    } else {
        0.0
    };
    Fit {
        slope,
        r_squared,
        std_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_fit_exact() {
        let fit = linear_fit(&[0.0, 1.0, 2.0, 3.0], &[1.0, 3.0, 5.0, 7.0]);
        assert!((fit.slope - 2.0).abs() < 1e-12);
        assert!((fit.r_squared - 1.0).abs() < 1e-12);
        assert!(fit.std_error.abs() < 1e-9);
    }

    #[test]
    fn test_chain_is_roughly_one_dimensional() {
        let chain: Vec<GeometryRow> = (0..200).map(|i| [i as f64 * 2.0, 0.0, 0.0, 1.0]).collect();
        let result = SampledBoxCounter.box_counting(&chain, 20, 10).unwrap();
        assert!(result.dimension > 0.8 && result.dimension < 1.6, "{}", result.dimension);
        assert_eq!(result.log_scales.len(), 10);
        assert!(result.confidence_interval[0] <= result.dimension);
    }

    #[test]
    fn test_rejects_tiny_input() {
        assert!(SampledBoxCounter.box_counting(&[[0.0, 0.0, 0.0, 1.0]], 10, 10).is_err());
        let pair = [[0.0, 0.0, 0.0, 1.0], [2.0, 0.0, 0.0, 1.0]];
        assert!(SampledBoxCounter.box_counting(&pair, 10, 2).is_err());
    }
}
