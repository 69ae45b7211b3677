//! Noise primitives shared by the processors: Laplace sampling by inverse
//! CDF (optionally conditioned on exceeding a threshold) and binomial draws
//! for the unobserved-cell count of truncated histograms.

use rand::Rng;
use rand_distr::{Binomial, Distribution};

/// Inverse CDF of Laplace(location, scale) at `u` in (0, 1).
fn laplace_inv_cdf(u: f64, scale: f64, location: f64) -> f64 {
    if u >= 0.5 {
        location - scale * (2.0 * (1.0 - u)).ln()
    } else {
        location + scale * (2.0 * u).ln()
    }
}

/// One draw from Laplace(location, scale), `scale > 0`.
pub fn sample_laplace<R: Rng + ?Sized>(rng: &mut R, scale: f64, location: f64) -> f64 {
    debug_assert!(scale > 0.0);
    let u = rng.gen_range(f64::MIN_POSITIVE..1.0);
    laplace_inv_cdf(u, scale, location)
}

/// One draw from Laplace(0, scale) conditioned on the CDF exceeding
/// `lower_cdf`; with `lower_cdf = laplace_cdf(tau, 0, scale)` this samples
/// the distribution truncated below at `tau`.
pub fn sample_laplace_above<R: Rng + ?Sized>(rng: &mut R, scale: f64, lower_cdf: f64) -> f64 {
    debug_assert!(scale > 0.0);
    debug_assert!((0.0..1.0).contains(&lower_cdf));
    let lo = lower_cdf.max(f64::MIN_POSITIVE);
    let u = rng.gen_range(lo..1.0);
    laplace_inv_cdf(u, scale, 0.0)
}

/// CDF of Laplace(location, scale) at `q`.
pub fn laplace_cdf(q: f64, location: f64, scale: f64) -> f64 {
    let z = (q - location) / scale;
    if q < location {
        0.5 * z.exp()
    } else {
        1.0 - 0.5 * (-z).exp()
    }
}

/// One draw from Binomial(n, p).
pub fn sample_binomial<R: Rng + ?Sized>(rng: &mut R, n: u64, p: f64) -> u64 {
    let p = p.clamp(0.0, 1.0);
    match Binomial::new(n, p) {
        Ok(dist) => dist.sample(rng),
        // Unreachable after clamping; fall back to the p=0 draw.
        Err(_) => 0,
    }
}
