// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

const KEY_HASH_SEED: u64 = 0xcbf29ce484222325;

pub(crate) fn combine_hash(acc: u64, value_hash: u64) -> u64 {
    acc ^ value_hash
        .wrapping_add(0x9e3779b97f4a7c15)
        .wrapping_add(acc << 6)
        .wrapping_add(acc >> 2)
}

pub(crate) fn hash_u64_with_seed(seed: u64, value: u64) -> u64 {
    mix_u64(seed ^ value)
}

/// Hash of a composite group key; the open-addressing tables mod this by
/// their entry count to pick the probe start.
pub(crate) fn key_hash(components: &[i64]) -> u64 {
    let mut acc = KEY_HASH_SEED;
    for component in components {
        acc = combine_hash(acc, hash_u64_with_seed(KEY_HASH_SEED, *component as u64));
    }
    acc
}

fn mix_u64(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9e3779b97f4a7c15);
    value = (value ^ (value >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94d049bb133111eb);
    value ^ (value >> 31)
}

#[cfg(test)]
mod tests {
    use super::key_hash;

    #[test]
    fn test_key_hash_component_order_matters() {
        assert_ne!(key_hash(&[1, 2]), key_hash(&[2, 1]));
        assert_eq!(key_hash(&[1, 2]), key_hash(&[1, 2]));
    }
}
