use candle_core::{Result, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

/// Row indexes of a data set, reshuffled into minibatches every epoch
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn new(samples: Vec<usize>) -> Self {
        Self {
            samples,
            chunks: vec![],
        }
    }

    /// Shuffle the samples and cut them into chunks of `batch_size`;
    /// the last chunk takes the remainder.
    pub fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut impl Rng) {
        let batch_size = batch_size.max(1);
        self.samples.shuffle(rng);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn num_minibatch(&self) -> usize {
        self.chunks.len()
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

/// Gather rows `rows` of `x_nd`
pub fn select_rows(x_nd: &Tensor, rows: &[usize]) -> Result<Tensor> {
    let idx = Tensor::from_iter(rows.iter().map(|&r| r as u32), x_nd.device())?;
    x_nd.index_select(&idx, 0)
}
