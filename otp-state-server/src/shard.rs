/*
    This file is part of otpd.

    Copyright © 2024 otpd Authors.

    otpd is free software; you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License,
    as published by the Free Software Foundation, either version 3
    of the License, or (at your option) any later version.

    otpd is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public
    License along with otpd. If not, see <https://www.gnu.org/licenses/>.
*/

//! Registry of AI servers and the districts they run.

use log::debug;
use otp_core::globals::{Channel, DoId};
use std::collections::HashMap;

/// An AI registration. Objects assigned to the shard's channel live
/// and die with it; owned objects are parented under its district.
#[derive(Debug, Clone)]
pub struct Shard {
    pub channel: Channel,
    pub district_id: DoId,
    pub name: String,
}

#[derive(Default)]
pub struct ShardManager {
    shards: HashMap<Channel, Shard>,
}

impl ShardManager {
    pub fn has_shard(&self, channel: Channel) -> bool {
        self.shards.contains_key(&channel)
    }

    pub fn add_shard(&mut self, channel: Channel, district_id: DoId, name: String) {
        if self.has_shard(channel) {
            debug!(
                "Failed to add shard with channel: {}, shard already exists!",
                channel
            );
            return;
        }
        self.shards.insert(
            channel,
            Shard {
                channel,
                district_id,
                name,
            },
        );
    }

    pub fn get_shard(&self, channel: Channel) -> Option<&Shard> {
        self.shards.get(&channel)
    }

    pub fn remove_shard(&mut self, channel: Channel) -> Option<Shard> {
        self.shards.remove(&channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_lifecycle() {
        let mut shards: ShardManager = ShardManager::default();

        shards.add_shard(10001, 20001, "Welcome Valley".to_owned());
        assert!(shards.has_shard(10001));

        let shard: &Shard = shards.get_shard(10001).expect("registered");
        assert_eq!(shard.district_id, 20001);
        assert_eq!(shard.name, "Welcome Valley");

        // a duplicate registration does not replace the first
        shards.add_shard(10001, 30001, "Imposter".to_owned());
        assert_eq!(shards.get_shard(10001).map(|s| s.district_id), Some(20001));

        let removed: Shard = shards.remove_shard(10001).expect("registered");
        assert_eq!(removed.name, "Welcome Valley");
        assert!(!shards.has_shard(10001));
        assert!(shards.remove_shard(10001).is_none());
    }
}
