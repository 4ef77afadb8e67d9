//! Initial sequence number selection, RFC 6528.

use super::ConnectionId;
use rand::{rngs::SmallRng, Rng};
use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash, Hasher},
};
use tokio::time::Instant;

/// Generates `ISN = M + F(localip, localport, remoteip, remoteport, secretkey)`
/// where `M` is a clock ticking every 4 microseconds and `F` a keyed hash.
#[derive(Debug, Clone)]
pub struct IsnGenerator {
    /// 512 bits of per-instance secret
    secret: [u32; 16],
    hasher: RandomState,
    epoch: Instant,
}

impl IsnGenerator {
    pub fn new(rng: &mut SmallRng, epoch: Instant) -> Self {
        Self {
            secret: rng.gen(),
            hasher: RandomState::new(),
            epoch,
        }
    }

    pub fn generate(&self, id: ConnectionId, now: Instant) -> u32 {
        let mut hasher = self.hasher.build_hasher();
        id.local.address.to_u32().hash(&mut hasher);
        id.remote.address.to_u32().hash(&mut hasher);
        ((id.local.port as u32) << 16 | id.remote.port as u32).hash(&mut hasher);
        self.secret.hash(&mut hasher);
        let f = hasher.finish() as u32;
        let m = (now.saturating_duration_since(self.epoch).as_micros() / 4) as u32;
        f.wrapping_add(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipv4_address::{Endpoint, Ipv4Address};
    use rand::SeedableRng;
    use std::time::Duration;

    const ID: ConnectionId = ConnectionId {
        local: Endpoint::new(Ipv4Address::new([10, 0, 0, 1]), 41952),
        remote: Endpoint::new(Ipv4Address::new([10, 0, 0, 2]), 80),
    };

    #[test]
    fn advances_with_the_clock() {
        let epoch = Instant::now();
        let isn = IsnGenerator::new(&mut SmallRng::seed_from_u64(1), epoch);
        let first = isn.generate(ID, epoch);
        assert_eq!(isn.generate(ID, epoch), first);
        let later = isn.generate(ID, epoch + Duration::from_micros(400));
        assert_eq!(later.wrapping_sub(first), 100);
    }

    #[test]
    fn differs_per_connection() {
        let epoch = Instant::now();
        let isn = IsnGenerator::new(&mut SmallRng::seed_from_u64(1), epoch);
        let other = ConnectionId {
            local: Endpoint::new(ID.local.address, 41953),
            ..ID
        };
        assert_ne!(isn.generate(ID, epoch), isn.generate(other, epoch));
    }
}
