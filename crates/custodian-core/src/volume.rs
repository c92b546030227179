//! Reserved-bytes accounting for the staging volume.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Error;

/// A reservation counter over one staging directory.
///
/// This counter is the only thing standing between concurrent fetches and
/// a full disk: fetch reserves `2 × tar_size` (tar plus its unpacked form)
/// before the first byte lands, cleanup releases the same amount. All
/// updates go through one mutex.
#[derive(Debug)]
pub struct DiskVolume {
    path: PathBuf,
    capacity: u64,
    reserved: Mutex<u64>,
}

impl DiskVolume {
    pub fn new(path: &Path, capacity: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            capacity,
            reserved: Mutex::new(0),
        }
    }

    /// Claim `bytes` of the volume.
    pub fn reserve(&self, bytes: u64) -> Result<(), Error> {
        let mut reserved = self.reserved.lock().unwrap();
        let available = self.capacity - *reserved;
        if bytes > available {
            return Err(Error::InsufficientSpace {
                volume: self.path.display().to_string(),
                requested: bytes,
                available,
            });
        }
        *reserved += bytes;
        tracing::debug!(bytes, reserved = *reserved, "Reserved staging space");
        Ok(())
    }

    /// Return `bytes` to the pool. Clamps at zero; releasing more than was
    /// reserved is a caller bug but must not poison the counter.
    pub fn release(&self, bytes: u64) {
        let mut reserved = self.reserved.lock().unwrap();
        *reserved = reserved.saturating_sub(bytes);
        tracing::debug!(bytes, reserved = *reserved, "Released staging space");
    }

    pub fn reserved(&self) -> u64 {
        *self.reserved.lock().unwrap()
    }

    pub fn available(&self) -> u64 {
        self.capacity - self.reserved()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_until_full() {
        let vol = DiskVolume::new(Path::new("/mnt/staging"), 1000);
        vol.reserve(400).unwrap();
        vol.reserve(600).unwrap();
        let err = vol.reserve(1).unwrap_err();
        assert!(matches!(err, Error::InsufficientSpace { available: 0, .. }));

        vol.release(600);
        vol.reserve(500).unwrap();
        assert_eq!(vol.reserved(), 900);
    }

    #[test]
    fn test_release_clamps_at_zero() {
        let vol = DiskVolume::new(Path::new("/mnt/staging"), 100);
        vol.reserve(40).unwrap();
        vol.release(1000);
        assert_eq!(vol.reserved(), 0);
        assert_eq!(vol.available(), 100);
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_capacity() {
        use std::sync::Arc;
        let vol = Arc::new(DiskVolume::new(Path::new("/mnt/staging"), 1000));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let vol = vol.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    if vol.reserve(100).is_ok() {
                        assert!(vol.reserved() <= 1000);
                        vol.release(100);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(vol.reserved(), 0);
    }
}
