//! Batch data structure

use ndarray::{s, Array2};

/// A training batch containing inputs and targets
///
/// Rows are samples (or time steps for sequence models); the default
/// truncated-BPTT split chunks along the row axis.
#[derive(Clone, Debug)]
pub struct Batch {
    /// Input features
    pub inputs: Array2<f32>,
    /// Target labels/values
    pub targets: Array2<f32>,
}

impl Batch {
    /// Create a new batch
    pub fn new(inputs: Array2<f32>, targets: Array2<f32>) -> Self {
        Self { inputs, targets }
    }

    /// Get batch size (number of rows)
    pub fn size(&self) -> usize {
        self.inputs.nrows()
    }

    /// Split the batch into chunks of `steps` rows each
    ///
    /// With `steps == 0` the batch is returned as a single identity split.
    /// The last chunk may be shorter. Always yields at least one split.
    pub fn split_rows(&self, steps: usize) -> Vec<Batch> {
        let rows = self.size();
        if steps == 0 || rows == 0 {
            return vec![self.clone()];
        }
        let mut splits = Vec::with_capacity(rows.div_ceil(steps));
        let mut start = 0;
        while start < rows {
            let end = (start + steps).min(rows);
            splits.push(Batch {
                inputs: self.inputs.slice(s![start..end, ..]).to_owned(),
                targets: self.targets.slice(s![start..end, ..]).to_owned(),
            });
            start = end;
        }
        splits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn batch_of(rows: usize) -> Batch {
        Batch::new(Array2::zeros((rows, 3)), Array2::zeros((rows, 1)))
    }

    #[test]
    fn test_batch_size() {
        assert_eq!(batch_of(5).size(), 5);
    }

    #[test]
    fn test_split_rows_zero_steps_is_identity() {
        let batch = batch_of(6);
        let splits = batch.split_rows(0);
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].size(), 6);
        assert_eq!(splits[0].inputs, batch.inputs);
    }

    #[test]
    fn test_split_rows_even() {
        let splits = batch_of(6).split_rows(2);
        assert_eq!(splits.len(), 3);
        assert!(splits.iter().all(|s| s.size() == 2));
    }

    #[test]
    fn test_split_rows_uneven_last_chunk() {
        let splits = batch_of(7).split_rows(3);
        assert_eq!(splits.len(), 3);
        assert_eq!(splits[2].size(), 1);
    }

    #[test]
    fn test_split_rows_steps_larger_than_batch() {
        let splits = batch_of(4).split_rows(10);
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].size(), 4);
    }

    #[test]
    fn test_split_rows_preserves_values() {
        let inputs =
            Array2::from_shape_vec((4, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let targets = inputs.clone();
        let splits = Batch::new(inputs, targets).split_rows(2);
        assert_eq!(splits[0].inputs[[0, 0]], 1.0);
        assert_eq!(splits[1].inputs[[1, 0]], 4.0);
    }
}
