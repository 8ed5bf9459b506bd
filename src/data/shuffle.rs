use rand::Rng;

/// Streaming shuffle over a bounded buffer.
///
/// The buffer is filled from `source` up to `capacity`; each `next` emits a
/// uniformly chosen buffered element and refills its slot. A capacity at
/// least as large as the source gives a full uniform shuffle.
pub struct ShuffleBuffer<I: Iterator, R> {
    source: I,
    buffer: Vec<I::Item>,
    capacity: usize,
    rng: R,
}

impl<I: Iterator, R: Rng> ShuffleBuffer<I, R> {
    pub fn new(source: I, capacity: usize, rng: R) -> Self {
        let capacity = capacity.max(1);
        Self {
            source,
            buffer: Vec::with_capacity(capacity),
            capacity,
            rng,
        }
    }
}

impl<I: Iterator, R: Rng> Iterator for ShuffleBuffer<I, R> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.len() < self.capacity {
            match self.source.next() {
                Some(item) => self.buffer.push(item),
                None => break,
            }
        }
        if self.buffer.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..self.buffer.len());
        Some(self.buffer.swap_remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn emits_every_element_once() {
        let rng = StdRng::seed_from_u64(3);
        let mut out: Vec<u32> = ShuffleBuffer::new(0..100u32, 10, rng).collect();
        out.sort();
        assert_eq!(out, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn capacity_one_keeps_order() {
        let rng = StdRng::seed_from_u64(3);
        let out: Vec<u32> = ShuffleBuffer::new(0..20u32, 1, rng).collect();
        assert_eq!(out, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn same_seed_same_order() {
        let a: Vec<u32> = ShuffleBuffer::new(0..50u32, 1000, StdRng::seed_from_u64(9)).collect();
        let b: Vec<u32> = ShuffleBuffer::new(0..50u32, 1000, StdRng::seed_from_u64(9)).collect();
        assert_eq!(a, b);
        assert_ne!(a, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn small_buffer_bounds_displacement() {
        // an element can only be emitted after it entered the buffer
        let rng = StdRng::seed_from_u64(11);
        let out: Vec<usize> = ShuffleBuffer::new(0..200usize, 4, rng).collect();
        for (pos, &v) in out.iter().enumerate() {
            assert!(v < pos + 4);
        }
    }
}
