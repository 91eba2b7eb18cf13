use hibitset::{BitSet, BitSetLike};
use thiserror::Error;

/// Index into the shared pool of radio channels.
pub type ChannelId = u8;

/// Most radios cannot hold more simultaneous links than this.
pub const DEFAULT_POOL_SIZE: u8 = 7;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapacityError {
    #[error("Every channel in the pool is in use.")]
    PoolExhausted,
    #[error("Already at the limit of {limit} connections.")]
    ConnectionLimit { limit: usize },
    #[error("Limit of {requested} connections exceeds the pool of {pool} channels.")]
    ExceedsPool { requested: usize, pool: usize },
    #[error("Message of {length} bytes needs more than {max_fragments} fragments.")]
    MessageTooLarge { length: usize, max_fragments: usize },
}

/// Tracks which channel ids are held by established connections.
#[derive(Debug, Clone)]
pub struct ChannelPool {
    size: u8,
    in_use: BitSet,
}

impl ChannelPool {
    pub fn new(size: u8) -> Self {
        Self {
            size,
            in_use: BitSet::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn is_in_use(&self, channel: ChannelId) -> bool {
        self.in_use.contains(channel as u32)
    }

    pub fn in_use(&self) -> usize {
        (&self.in_use).iter().count()
    }

    /// Free channels in ascending order, the order both peers walk during negotiation.
    pub fn available(&self) -> Vec<ChannelId> {
        (0..self.size)
            .filter(|channel| !self.is_in_use(*channel))
            .collect()
    }

    /// Mark `channel` as taken. Returns false if it is outside the pool or already taken.
    pub fn acquire(&mut self, channel: ChannelId) -> bool {
        if channel >= self.size {
            return false;
        }
        !self.in_use.add(channel as u32)
    }

    pub fn release(&mut self, channel: ChannelId) {
        self.in_use.remove(channel as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let mut pool = ChannelPool::new(3);
        assert_eq!(pool.available(), vec![0, 1, 2]);

        assert!(pool.acquire(1));
        assert!(!pool.acquire(1));
        assert!(!pool.acquire(3));
        assert_eq!(pool.available(), vec![0, 2]);
        assert_eq!(pool.in_use(), 1);

        pool.release(1);
        assert!(!pool.is_in_use(1));
        assert_eq!(pool.available().len(), pool.size());
    }

    #[test]
    fn exhausted_pool_has_nothing_available() {
        let mut pool = ChannelPool::new(DEFAULT_POOL_SIZE);
        for channel in 0..DEFAULT_POOL_SIZE {
            assert!(pool.acquire(channel));
        }
        assert!(pool.available().is_empty());
    }
}
