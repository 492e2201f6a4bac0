use rand::Rng;
use rand_distr::{Zipf, ZipfError};

/// Skewed id sampler: a few hot posts take most of the reads, which is the
/// traffic shape a read-through cache pays off on.
pub struct ZipfianGenerator {
    dist: Zipf<f64>,
}

impl ZipfianGenerator {
    pub fn new(num_items: u64, alpha: f64) -> Result<Self, ZipfError> {
        Ok(Self {
            dist: Zipf::new(num_items, alpha)?,
        })
    }

    /// Next id in `1..=num_items`.
    pub fn next_id<R: Rng>(&self, rng: &mut R) -> u64 {
        rng.sample(&self.dist) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn ids_stay_in_range() {
        let gen = ZipfianGenerator::new(50, 1.1).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10_000 {
            let id = gen.next_id(&mut rng);
            assert!((1..=50).contains(&id), "{id}");
        }
    }

    #[test]
    fn low_ids_are_hot() {
        let gen = ZipfianGenerator::new(100, 1.2).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let hot = (0..10_000).filter(|_| gen.next_id(&mut rng) <= 10).count();
        assert!(hot > 5_000, "only {hot} samples in the top 10");
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(ZipfianGenerator::new(0, 1.0).is_err());
        assert!(ZipfianGenerator::new(10, -1.0).is_err());
    }
}
