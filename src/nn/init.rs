//! Parameter initializers.

use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    /// `U(-l, l)` with `l = sqrt(6 / (fan_in + fan_out))`.
    GlorotUniform,
    Zeros,
}

impl Initializer {
    pub fn sample<R: Rng>(&self, shape: &[usize], rng: &mut R) -> ArrayD<f32> {
        match self {
            Initializer::Zeros => ArrayD::zeros(IxDyn(shape)),
            Initializer::GlorotUniform => {
                let (fan_in, fan_out) = fans(shape);
                let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
                ArrayD::random_using(IxDyn(shape), Uniform::new_inclusive(-limit, limit), rng)
            }
        }
    }
}

fn fans(shape: &[usize]) -> (usize, usize) {
    match shape {
        [] => (1, 1),
        [n] => (*n, *n),
        [fan_in, fan_out] => (*fan_in, *fan_out),
        [.., fan_in, fan_out] => {
            let receptive: usize = shape[..shape.len() - 2].iter().product();
            (fan_in * receptive, fan_out * receptive)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn glorot_stays_within_limit_and_is_seeded() {
        let mut rng = StdRng::seed_from_u64(3);
        let w = Initializer::GlorotUniform.sample(&[10, 5], &mut rng);
        let limit = (6.0f32 / 15.0).sqrt();
        assert!(w.iter().all(|v| v.abs() <= limit));

        let mut again = StdRng::seed_from_u64(3);
        assert_eq!(w, Initializer::GlorotUniform.sample(&[10, 5], &mut again));
    }

    #[test]
    fn zeros_has_requested_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let b = Initializer::Zeros.sample(&[4], &mut rng);
        assert_eq!(b.shape(), &[4]);
        assert!(b.iter().all(|&v| v == 0.0));
    }
}
