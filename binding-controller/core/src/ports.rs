use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::ops::RangeInclusive;

/// Hands out exclusive local ports from an inclusive range.
///
/// The allocator is a cache of the ports recorded on live BoundEndpoints; it
/// is rebuilt from cluster state at the start of every poll and is never
/// persisted. All operations take a single lock.
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    bits: Mutex<Bitmap>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("port {port} is outside of the allocatable range {min}-{max}")]
    OutOfRange { port: u16, min: u16, max: u16 },

    #[error("port {0} is already allocated")]
    AlreadySet(u16),

    #[error("no free ports in range {min}-{max}")]
    Exhausted { min: u16, max: u16 },

    #[error("invalid port range {min}-{max}")]
    InvalidRange { min: u16, max: u16 },
}

#[derive(Debug)]
struct Bitmap {
    words: Vec<u64>,
    len: usize,
    set: usize,
}

// === impl PortAllocator ===

impl PortAllocator {
    /// Fails if the range is empty or includes port 0, which marks a
    /// binding without a port.
    pub fn new(range: RangeInclusive<u16>) -> Result<Self, AllocError> {
        let (min, max) = range.into_inner();
        if min == 0 || min > max {
            return Err(AllocError::InvalidRange { min, max });
        }
        let len = usize::from(max - min) + 1;
        Ok(Self {
            min,
            max,
            bits: Mutex::new(Bitmap::new(len)),
        })
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.min..=self.max
    }

    /// Marks `port` as allocated. Fails without changing state if the port is
    /// out of range or already set.
    pub fn set(&self, port: u16) -> Result<(), AllocError> {
        let offset = self.offset(port)?;
        let mut bits = self.bits.lock();
        if bits.get(offset) {
            return Err(AllocError::AlreadySet(port));
        }
        bits.insert(offset);
        Ok(())
    }

    /// Allocates the lowest free port.
    pub fn set_any(&self) -> Result<u16, AllocError> {
        let mut bits = self.bits.lock();
        let offset = bits.first_free().ok_or(AllocError::Exhausted {
            min: self.min,
            max: self.max,
        })?;
        bits.insert(offset);
        Ok(self.min + offset as u16)
    }

    /// Releases `port`. Releasing a free or out-of-range port does nothing.
    pub fn unset(&self, port: u16) {
        if let Ok(offset) = self.offset(port) {
            self.bits.lock().remove(offset);
        }
    }

    pub fn is_set(&self, port: u16) -> bool {
        match self.offset(port) {
            Ok(offset) => self.bits.lock().get(offset),
            Err(_) => false,
        }
    }

    /// The number of allocated ports.
    pub fn allocated(&self) -> usize {
        self.bits.lock().set
    }

    /// Replaces all allocations with `ports`.
    ///
    /// Fails on the first port that is out of range or listed twice; the
    /// allocator then holds only the ports before it.
    pub fn rebuild(&self, ports: impl IntoIterator<Item = u16>) -> Result<(), AllocError> {
        let mut bits = self.bits.lock();
        bits.clear();
        for port in ports {
            let offset = self.offset(port)?;
            if bits.get(offset) {
                return Err(AllocError::AlreadySet(port));
            }
            bits.insert(offset);
        }
        Ok(())
    }

    fn offset(&self, port: u16) -> Result<usize, AllocError> {
        if port < self.min || port > self.max {
            return Err(AllocError::OutOfRange {
                port,
                min: self.min,
                max: self.max,
            });
        }
        Ok(usize::from(port - self.min))
    }
}

// === impl Bitmap ===

impl Bitmap {
    fn new(len: usize) -> Self {
        let mut words = vec![0u64; len.div_ceil(64)];
        // Pre-set the bits past the end of the range so they're never handed out.
        let tail = len % 64;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = !0u64 << tail;
            }
        }
        Self { words, len, set: 0 }
    }

    #[inline]
    fn get(&self, offset: usize) -> bool {
        self.words[offset / 64] & (1 << (offset % 64)) != 0
    }

    fn insert(&mut self, offset: usize) {
        if !self.get(offset) {
            self.words[offset / 64] |= 1 << (offset % 64);
            self.set += 1;
        }
    }

    fn remove(&mut self, offset: usize) {
        if self.get(offset) {
            self.words[offset / 64] &= !(1 << (offset % 64));
            self.set -= 1;
        }
    }

    fn first_free(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != !0u64)
            .map(|(i, w)| i * 64 + w.trailing_ones() as usize)
    }

    fn clear(&mut self) {
        *self = Self::new(self.len);
    }
}

/// Parses an inclusive `min-max` port range, e.g. `10000-65535`.
pub fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>> {
    let (min, max) = match s.split_once('-') {
        Some(bounds) => bounds,
        None => bail!("port range must be of the form <min>-<max>"),
    };
    let min = min.trim().parse::<u16>().context("parsing port")?;
    let max = max.trim().parse::<u16>().context("parsing port")?;
    if min == 0 {
        bail!("port range must not include port 0");
    }
    if min > max {
        bail!("port range must be increasing");
    }
    Ok(min..=max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_exclusive() {
        let ports = PortAllocator::new(10000..=10002).unwrap();
        assert_eq!(ports.set(10001), Ok(()));
        assert_eq!(ports.set(10001), Err(AllocError::AlreadySet(10001)));
        assert!(ports.is_set(10001));
        assert_eq!(ports.allocated(), 1);

        assert_eq!(
            ports.set(9999),
            Err(AllocError::OutOfRange {
                port: 9999,
                min: 10000,
                max: 10002
            })
        );
        assert_eq!(ports.allocated(), 1);
    }

    #[test]
    fn set_any_fills_then_exhausts() {
        let ports = PortAllocator::new(10000..=10002).unwrap();
        ports.set(10001).unwrap();
        assert_eq!(ports.set_any(), Ok(10000));
        assert_eq!(ports.set_any(), Ok(10002));
        assert_eq!(
            ports.set_any(),
            Err(AllocError::Exhausted {
                min: 10000,
                max: 10002
            })
        );

        ports.unset(10001);
        assert!(!ports.is_set(10001));
        assert_eq!(ports.set_any(), Ok(10001));
        assert_eq!(ports.allocated(), 3);
    }

    #[test]
    fn unset_is_forgiving() {
        let ports = PortAllocator::new(10000..=10010).unwrap();
        ports.unset(10005);
        ports.unset(1);
        assert_eq!(ports.allocated(), 0);
        assert!(!ports.is_set(1));
    }

    #[test]
    fn spans_words() {
        let ports = PortAllocator::new(1..=200).unwrap();
        for expected in 1..=200 {
            assert_eq!(ports.set_any(), Ok(expected));
        }
        assert!(ports.set_any().is_err());
        ports.unset(130);
        assert_eq!(ports.set_any(), Ok(130));
    }

    #[test]
    fn full_range() {
        let ports = PortAllocator::new(1..=u16::MAX).unwrap();
        ports.set(u16::MAX).unwrap();
        assert!(ports.is_set(u16::MAX));
        assert_eq!(ports.set_any(), Ok(1));
    }

    #[test]
    fn rebuild_replaces_state() {
        let ports = PortAllocator::new(10000..=10100).unwrap();
        ports.set(10050).unwrap();

        ports.rebuild([10000, 10002]).unwrap();
        assert!(!ports.is_set(10050));
        assert!(ports.is_set(10000));
        assert!(ports.is_set(10002));
        assert_eq!(ports.set_any(), Ok(10001));

        assert_eq!(
            ports.rebuild([10000, 10000]),
            Err(AllocError::AlreadySet(10000))
        );
        assert!(matches!(
            ports.rebuild([20000]),
            Err(AllocError::OutOfRange { port: 20000, .. })
        ));
    }

    #[test]
    fn exclusive_under_contention() {
        use std::{collections::HashSet, sync::Arc};

        let ports = Arc::new(PortAllocator::new(20000..=20999).unwrap());
        let handles = (0..8)
            .map(|_| {
                let ports = ports.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| ports.set_any().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(seen.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(ports.allocated(), 800);
    }

    #[test]
    fn rejects_invalid_ranges() {
        assert_eq!(
            PortAllocator::new(0..=10).err(),
            Some(AllocError::InvalidRange { min: 0, max: 10 })
        );
        #[allow(clippy::reversed_empty_ranges)]
        let reversed = 20..=10;
        assert_eq!(
            PortAllocator::new(reversed).err(),
            Some(AllocError::InvalidRange { min: 20, max: 10 })
        );
        assert!(PortAllocator::new(7..=7).is_ok());
    }

    #[test]
    fn parse_range() {
        assert_eq!(parse_port_range("10000-65535").unwrap(), 10000..=65535);
        assert_eq!(parse_port_range(" 1 - 1 ").unwrap(), 1..=1);
        assert!(parse_port_range("").is_err());
        assert!(parse_port_range("10").is_err());
        assert!(parse_port_range("0-10").is_err());
        assert!(parse_port_range("20-10").is_err());
        assert!(parse_port_range("1-65536").is_err());
    }
}
