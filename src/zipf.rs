//! Zipfian key-index sampler.
//!
//! Rejection-inversion sampling for the discrete power-law distribution
//! `P(k) ∝ 1 / (v + k)^s` over `k ∈ [0, imax]`, after Hörmann and
//! Derflinger's "Rejection-inversion to generate variates from monotone
//! discrete distributions". `s > 1` controls how hard the mass is pulled
//! toward low indexes; `v >= 1` shifts where the head of the curve sits.
//!
//! The ecosystem samplers only expose the exponent, not the `v` offset this
//! workload model is parameterized by, so the sampler lives here.

use rand::Rng;

#[derive(Debug, Clone)]
pub struct ZipfSampler {
    imax: f64,
    v: f64,
    q: f64,
    threshold: f64,
    one_minus_q: f64,
    one_minus_q_inv: f64,
    hxm: f64,
    hx0_minus_hxm: f64,
}

impl ZipfSampler {
    /// Build a sampler for `P(k) ∝ 1/(v+k)^s` over `[0, imax]`.
    ///
    /// Returns `None` when the parameters are outside the method's domain
    /// (`s <= 1` or `v < 1`).
    pub fn new(s: f64, v: f64, imax: u64) -> Option<ZipfSampler> {
        if s <= 1.0 || v < 1.0 {
            return None;
        }
        let one_minus_q = 1.0 - s;
        let one_minus_q_inv = 1.0 / one_minus_q;
        let mut z = ZipfSampler {
            imax: imax as f64,
            v,
            q: s,
            threshold: 0.0,
            one_minus_q,
            one_minus_q_inv,
            hxm: 0.0,
            hx0_minus_hxm: 0.0,
        };
        z.hxm = z.h(z.imax + 0.5);
        z.hx0_minus_hxm = z.h(0.5) - (v.ln() * -z.q).exp() - z.hxm;
        z.threshold = 1.0 - z.hinv(z.h(1.5) - (-z.q * (v + 1.0).ln()).exp());
        Some(z)
    }

    // H(x), the integral of the normalized density's hat function.
    fn h(&self, x: f64) -> f64 {
        (self.one_minus_q * (self.v + x).ln()).exp() * self.one_minus_q_inv
    }

    fn hinv(&self, x: f64) -> f64 {
        (self.one_minus_q_inv * (self.one_minus_q * x).ln()).exp() - self.v
    }

    /// Draw one index in `[0, imax]`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        loop {
            let r: f64 = rng.gen();
            let ur = self.hxm + r * self.hx0_minus_hxm;
            let x = self.hinv(ur);
            let k = (x + 0.5).floor();
            if k - x <= self.threshold {
                return k as u64;
            }
            if ur >= self.h(k + 0.5) - (-(k + self.v).ln() * self.q).exp() {
                return k as u64;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn rejects_out_of_domain_parameters() {
        assert!(ZipfSampler::new(1.0, 1.0, 100).is_none());
        assert!(ZipfSampler::new(0.5, 1.0, 100).is_none());
        assert!(ZipfSampler::new(1.5, 0.0, 100).is_none());
        assert!(ZipfSampler::new(1.01, 1.0, 100).is_some());
    }

    #[test]
    fn samples_stay_in_range() {
        let z = ZipfSampler::new(1.2, 1.0, 99).unwrap();
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..10_000 {
            assert!(z.sample(&mut rng) <= 99);
        }
    }

    #[test]
    fn low_indexes_dominate() {
        let z = ZipfSampler::new(2.0, 1.0, 999).unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        let mut counts = vec![0u64; 1000];
        for _ in 0..200_000 {
            counts[z.sample(&mut rng) as usize] += 1;
        }
        // P(0)/P(9) = (10/1)^2 = 100; leave a wide statistical margin.
        assert!(counts[0] > counts[9] * 20);
        let head: u64 = counts[..10].iter().sum();
        let tail: u64 = counts[500..510].iter().sum();
        assert!(head > tail * 50);
    }

    #[test]
    fn skew_follows_the_exponent() {
        // A larger s concentrates strictly more mass on index zero.
        let mut rng = SmallRng::seed_from_u64(11);
        let mut share = |s: f64| {
            let z = ZipfSampler::new(s, 1.0, 999).unwrap();
            (0..100_000).filter(|_| z.sample(&mut rng) == 0).count()
        };
        let gentle = share(1.1);
        let steep = share(3.0);
        assert!(steep > gentle);
    }
}
