use crate::dataset::TileSource;
use crate::tensor::Tensor;
use crate::EmbedError;
use crossbeam_channel::{bounded, Receiver};
use std::thread;

/// Batches each loader thread may have ready ahead of the consumer.
const PREFETCH_FACTOR: usize = 2;

/// A batch of tiles with the dataset indices they came from.
#[derive(Debug)]
pub struct Batch {
    pub indices: Vec<u64>,
    pub tiles: Tensor,
}

fn load_batch(source: &dyn TileSource, indices: &[u64]) -> Result<Batch, EmbedError> {
    let tiles = indices
        .iter()
        .map(|&i| source.tile(i as usize))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Batch {
        indices: indices.to_vec(),
        tiles: Tensor::stack(&tiles)?,
    })
}

/// Feed `indices` to `consume` in order, `batch_size` at a time.
///
/// Batch `b` is loaded by loader thread `b % num_workers` into that thread's own
/// bounded channel, and the consumer visits the channels round-robin, so batches
/// arrive in order and each index is delivered exactly once. With `num_workers == 0`
/// batches are loaded on the calling thread. If `consume` fails the loaders stop.
pub fn for_each_batch<F>(
    source: &dyn TileSource,
    indices: &[u64],
    batch_size: usize,
    num_workers: usize,
    mut consume: F,
) -> Result<(), EmbedError>
where
    F: FnMut(Batch) -> Result<(), EmbedError>,
{
    if batch_size == 0 {
        return Err(EmbedError::Config("batch size must be at least 1".to_string()));
    }
    let batches: Vec<&[u64]> = indices.chunks(batch_size).collect();

    if num_workers == 0 {
        for chunk in batches {
            consume(load_batch(source, chunk)?)?;
        }
        return Ok(());
    }

    let workers = num_workers.min(batches.len()).max(1);
    thread::scope(|s| {
        let mut receivers: Vec<Receiver<Result<Batch, EmbedError>>> = Vec::with_capacity(workers);
        for w in 0..workers {
            let (tx, rx) = bounded(PREFETCH_FACTOR);
            receivers.push(rx);
            let mine: Vec<&[u64]> = batches.iter().skip(w).step_by(workers).copied().collect();
            s.spawn(move || {
                for chunk in mine {
                    let loaded = load_batch(source, chunk);
                    let failed = loaded.is_err();
                    // Consumer hung up: stop quietly.
                    if tx.send(loaded).is_err() || failed {
                        break;
                    }
                }
            });
        }

        let result = (0..batches.len()).try_for_each(|b| {
            let batch = receivers[b % workers]
                .recv()
                .map_err(|_| EmbedError::Other(format!("loader thread for batch {} exited early", b)))??;
            consume(batch)
        });
        drop(receivers);
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::shape_of;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Tile i is a 1x1x1 tensor holding i.
    struct Counting {
        len: usize,
        fail_at: Option<usize>,
        reads: AtomicUsize,
        coords: Vec<[i64; 2]>,
    }

    impl Counting {
        fn new(len: usize) -> Self {
            Self { len, fail_at: None, reads: AtomicUsize::new(0), coords: vec![[0, 0]; len] }
        }
    }

    impl TileSource for Counting {
        fn len(&self) -> usize {
            self.len
        }

        fn tile(&self, index: usize) -> Result<Tensor, EmbedError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if Some(index) == self.fail_at {
                return Err(EmbedError::Other(format!("cannot decode tile {}", index)));
            }
            Tensor::new(shape_of(&[1, 1, 1]), vec![index as f32])
        }

        fn coordinates(&self) -> &[[i64; 2]] {
            &self.coords
        }

        fn scaled_coordinates(&self) -> &[[i64; 2]] {
            &self.coords
        }

        fn tile_size_lv0(&self) -> u32 {
            1
        }
    }

    fn collect(source: &Counting, indices: &[u64], batch_size: usize, workers: usize) -> Vec<Vec<u64>> {
        let mut seen = Vec::new();
        for_each_batch(source, indices, batch_size, workers, |batch| {
            let values: Vec<u64> = batch.tiles.data().iter().map(|&v| v as u64).collect();
            assert_eq!(values, batch.indices);
            seen.push(batch.indices);
            Ok(())
        })
        .unwrap();
        seen
    }

    #[test]
    fn test_batches_arrive_in_order_with_workers() {
        let source = Counting::new(10);
        let indices: Vec<u64> = (0..10).rev().collect();
        let seen = collect(&source, &indices, 3, 4);
        assert_eq!(seen, vec![vec![9, 8, 7], vec![6, 5, 4], vec![3, 2, 1], vec![0]]);
        assert_eq!(source.reads.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_inline_loading_matches_threaded() {
        let source = Counting::new(7);
        let indices: Vec<u64> = vec![2, 0, 4, 1, 3, 6, 5];
        assert_eq!(collect(&source, &indices, 2, 0), collect(&source, &indices, 2, 3));
    }

    #[test]
    fn test_batch_shape_has_leading_batch_dim() {
        let source = Counting::new(4);
        for_each_batch(&source, &[0, 1, 2, 3], 4, 2, |batch| {
            assert_eq!(batch.tiles.shape(), &[4, 1, 1, 1]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_load_error_propagates() {
        let mut source = Counting::new(6);
        source.fail_at = Some(4);
        let indices: Vec<u64> = (0..6).collect();
        let err = for_each_batch(&source, &indices, 2, 2, |_| Ok(())).unwrap_err();
        assert!(err.to_string().contains("cannot decode tile 4"));
    }

    #[test]
    fn test_consumer_error_stops_loading() {
        let source = Counting::new(100);
        let indices: Vec<u64> = (0..100).collect();
        let mut calls = 0;
        let result = for_each_batch(&source, &indices, 1, 2, |_| {
            calls += 1;
            if calls == 3 { Err(EmbedError::Model("out of memory".into())) } else { Ok(()) }
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
        assert!(source.reads.load(Ordering::SeqCst) < 100);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let source = Counting::new(1);
        assert!(for_each_batch(&source, &[0], 0, 0, |_| Ok(())).is_err());
    }
}
