//! Lock-free SPSC rings for event and audio hand-off between threads.
//!
//! Thin wrappers around `ringbuf` pairing a producer owned by one thread
//! with a consumer owned by another. The consumer adds a one-slot lookahead
//! so a reader can peek at the next element, or put one element back after
//! popping it, without the producer ever observing the difference. That is
//! exactly what fragment-bounded draining needs: read events until the
//! first one past the fragment end, then leave that one for the next cycle.

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};

/// Create a connected producer/consumer pair with the given capacity.
pub fn ring_buffer<T>(capacity: usize) -> (RingProducer<T>, RingConsumer<T>) {
    let rb = HeapRb::<T>::new(capacity.max(1));
    let (prod, cons) = rb.split();
    (
        RingProducer { prod },
        RingConsumer {
            cons,
            lookahead: None,
        },
    )
}

/// Writer half. Single producer; the write index is published with release
/// ordering by the underlying ring.
pub struct RingProducer<T> {
    prod: HeapProd<T>,
}

impl<T> RingProducer<T> {
    pub fn capacity(&self) -> usize {
        self.prod.capacity().get()
    }

    pub fn write_space(&self) -> usize {
        self.prod.vacant_len()
    }

    /// Push one element; hands it back when the ring is full.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        self.prod.try_push(value)
    }

    pub fn push_slice(&mut self, values: &[T]) -> usize
    where
        T: Copy,
    {
        let mut written = 0;
        for &value in values {
            if self.prod.try_push(value).is_ok() {
                written += 1;
            } else {
                break;
            }
        }
        written
    }
}

/// Reader half with one slot of lookahead.
pub struct RingConsumer<T> {
    cons: HeapCons<T>,
    lookahead: Option<T>,
}

impl<T> RingConsumer<T> {
    pub fn read_space(&self) -> usize {
        self.cons.occupied_len() + usize::from(self.lookahead.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.lookahead.is_none() && self.cons.is_empty()
    }

    pub fn pop(&mut self) -> Option<T> {
        if let Some(value) = self.lookahead.take() {
            return Some(value);
        }
        self.cons.try_pop()
    }

    /// Next element without consuming it.
    pub fn peek(&mut self) -> Option<&T> {
        if self.lookahead.is_none() {
            self.lookahead = self.cons.try_pop();
        }
        self.lookahead.as_ref()
    }

    /// Put a popped element back; it becomes the next `pop`/`peek` result.
    /// At most one element can be parked at a time.
    pub fn unpop(&mut self, value: T) {
        debug_assert!(self.lookahead.is_none(), "only one element may be parked");
        self.lookahead = Some(value);
    }

    pub fn pop_slice(&mut self, out: &mut [T]) -> usize {
        let mut read = 0;
        for slot in out.iter_mut() {
            match self.pop() {
                Some(value) => {
                    *slot = value;
                    read += 1;
                }
                None => break,
            }
        }
        read
    }

    /// Drop all buffered elements.
    pub fn clear(&mut self) {
        self.lookahead = None;
        while self.cons.try_pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_in_order() {
        let (mut prod, mut cons) = ring_buffer::<u32>(8);
        for i in 0..5 {
            prod.push(i).unwrap();
        }
        assert_eq!(cons.read_space(), 5);
        for i in 0..5 {
            assert_eq!(cons.pop(), Some(i));
        }
        assert!(cons.is_empty());
    }

    #[test]
    fn test_full_ring_rejects_push() {
        let (mut prod, _cons) = ring_buffer::<u32>(2);
        assert!(prod.push(1).is_ok());
        assert!(prod.push(2).is_ok());
        assert_eq!(prod.push(3), Err(3));
        assert_eq!(prod.write_space(), 0);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (mut prod, mut cons) = ring_buffer::<u32>(4);
        prod.push(7).unwrap();
        assert_eq!(cons.peek(), Some(&7));
        assert_eq!(cons.read_space(), 1);
        assert_eq!(cons.pop(), Some(7));
        assert_eq!(cons.peek(), None);
    }

    #[test]
    fn test_unpop_rewinds_one_element() {
        let (mut prod, mut cons) = ring_buffer::<u32>(4);
        prod.push(1).unwrap();
        prod.push(2).unwrap();
        let first = cons.pop().unwrap();
        cons.unpop(first);
        assert_eq!(cons.pop(), Some(1));
        assert_eq!(cons.pop(), Some(2));
    }

    #[test]
    fn test_producer_advance_invisible_past_lookahead() {
        let (mut prod, mut cons) = ring_buffer::<u32>(4);
        prod.push(1).unwrap();
        assert_eq!(cons.peek(), Some(&1));
        // producer keeps writing; parked element still comes out first
        prod.push(2).unwrap();
        assert_eq!(cons.pop(), Some(1));
        assert_eq!(cons.pop(), Some(2));
    }

    #[test]
    fn test_slices() {
        let (mut prod, mut cons) = ring_buffer::<f32>(8);
        let written = prod.push_slice(&[0.1, 0.2, 0.3]);
        assert_eq!(written, 3);
        let mut out = [0.0f32; 8];
        let read = cons.pop_slice(&mut out);
        assert_eq!(read, 3);
        assert_eq!(&out[..3], &[0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_cross_thread_transfer() {
        let (mut prod, mut cons) = ring_buffer::<u64>(1024);
        let writer = std::thread::spawn(move || {
            for i in 0..1000u64 {
                loop {
                    match prod.push(i) {
                        Ok(()) => break,
                        Err(_) => std::thread::yield_now(),
                    }
                }
            }
        });
        let mut expected = 0u64;
        while expected < 1000 {
            if let Some(value) = cons.pop() {
                assert_eq!(value, expected);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }
        writer.join().unwrap();
    }
}
