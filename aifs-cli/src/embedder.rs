//! Deterministic hash-based text embedder.
//!
//! Turns text into a fixed-dimension unit vector so local search works
//! without an external model. Not a semantic embedding; a stand-in with a
//! stable, reproducible mapping.

pub struct TextEmbedder {
    dimension: usize,
}

impl TextEmbedder {
    pub fn new(dimension: usize) -> Self {
        TextEmbedder { dimension }
    }

    /// Embeds text into a normalized vector of the configured dimension.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut raw = vec![0u8; self.dimension];
        let mut hasher = blake3::Hasher::new();
        hasher.update(text.as_bytes());
        hasher.finalize_xof().fill(&mut raw);

        let mut vector: Vec<f32> =
            raw.into_iter().map(|byte| (byte as f32 / 128.0) - 1.0).collect();
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_and_normalized() {
        let embedder = TextEmbedder::new(64);
        let a = embedder.embed("the quick brown fox");
        let b = embedder.embed("the quick brown fox");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let norm = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);

        let c = embedder.embed("a different sentence");
        assert_ne!(a, c);
    }
}
