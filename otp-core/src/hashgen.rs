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

//! Legacy prime-multiplier hash, used to compute the 32-bit schema
//! hash that clients present during the handshake.

use crate::globals::DCFileHash;

pub static MAX_PRIME_NUMBERS: u16 = 1000;

pub struct PrimeNumberGenerator {
    primes: Vec<u32>,
}

impl Default for PrimeNumberGenerator {
    fn default() -> Self {
        Self { primes: vec![2_u32] }
    }
}

impl PrimeNumberGenerator {
    /// Returns the nth prime number. this[0] returns 2, this[1]
    /// returns 3; successively larger values of n return larger
    /// prime numbers.
    pub fn get_prime(&mut self, n: u16) -> u32 {
        let mut candidate: u32 = self.primes.last().copied().unwrap_or(2) + 1;

        while self.primes.len() <= usize::from(n) {
            // Candidate is prime iff no already-found prime
            // up to its square root divides it evenly.
            let mut maybe_prime: bool = true;
            let mut j: usize = 0;

            while maybe_prime && self.primes[j] * self.primes[j] <= candidate {
                if candidate % self.primes[j] == 0 {
                    maybe_prime = false;
                }
                j += 1;
            }
            if maybe_prime {
                self.primes.push(candidate);
            }
            candidate += 1;
        }
        self.primes[usize::from(n)]
    }
}

#[derive(Default)]
pub struct DCHashGenerator {
    hash: u32,
    index: u16,
    primes: PrimeNumberGenerator,
}

/// Implemented by every DC element that participates
/// in the legacy schema hash.
pub trait LegacyDCHash {
    fn generate_hash(&self, hashgen: &mut DCHashGenerator);
}

impl DCHashGenerator {
    /// Adds another integer to the hash so far.
    pub fn add_int(&mut self, number: u32) {
        self.hash = self
            .hash
            .wrapping_add(self.primes.get_prime(self.index).wrapping_mul(number));
        self.index = (self.index + 1) % MAX_PRIME_NUMBERS;
    }

    /// Adds a blob to the hash, by breaking it down into a sequence of integers.
    pub fn add_blob(&mut self, blob: &[u8]) {
        self.add_int(blob.len() as u32);

        for byte in blob {
            self.add_int(u32::from(*byte));
        }
    }

    /// Adds a string to the hash, by breaking it down into a sequence of integers.
    pub fn add_string(&mut self, string: &str) {
        self.add_blob(string.as_bytes());
    }

    pub const fn get_hash(&self) -> DCFileHash {
        self.hash
    }
}

#[cfg(test)]
mod unit_testing {
    use super::*;

    #[test]
    fn prime_number_sequence() {
        let mut primes: PrimeNumberGenerator = PrimeNumberGenerator::default();
        let expected: [u32; 10] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29];

        for (n, prime) in expected.iter().enumerate() {
            assert_eq!(primes.get_prime(n as u16), *prime);
        }
        // Ask again out of order; the generator memoizes.
        assert_eq!(primes.get_prime(3), 7);
        assert_eq!(primes.get_prime(0), 2);
    }

    #[test]
    fn hash_is_deterministic() {
        let mut gen_a: DCHashGenerator = DCHashGenerator::default();
        let mut gen_b: DCHashGenerator = DCHashGenerator::default();

        gen_a.add_string("DistributedAvatar");
        gen_a.add_int(3);
        gen_b.add_string("DistributedAvatar");
        gen_b.add_int(3);

        assert_eq!(gen_a.get_hash(), gen_b.get_hash());
    }

    #[test]
    fn hash_reflects_input_changes() {
        let mut gen_a: DCHashGenerator = DCHashGenerator::default();
        let mut gen_b: DCHashGenerator = DCHashGenerator::default();

        gen_a.add_string("setName");
        gen_b.add_string("setColor");

        assert_ne!(gen_a.get_hash(), gen_b.get_hash());
    }
}
