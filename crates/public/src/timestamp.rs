/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

// Packet timestamps, stored as nanoseconds since the unix epoch in 8 bytes.
// Arithmetic never panics: differences saturate at zero.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    const NANOS_IN_SECOND: u64 = 1_000_000_000;
    const NANOS_IN_MILLIS: u64 = 1_000_000;
    const NANOS_IN_MICROS: u64 = 1_000;

    pub const ZERO: Self = Self(0);

    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(Self::from)
            .unwrap_or_default()
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros * Self::NANOS_IN_MICROS)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * Self::NANOS_IN_MILLIS)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * Self::NANOS_IN_SECOND)
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    pub const fn as_micros(&self) -> u64 {
        self.0 / Self::NANOS_IN_MICROS
    }

    pub const fn as_millis(&self) -> u64 {
        self.0 / Self::NANOS_IN_MILLIS
    }

    pub const fn as_secs(&self) -> u64 {
        self.0 / Self::NANOS_IN_SECOND
    }

    pub const fn subsec_nanos(&self) -> u32 {
        (self.0 % Self::NANOS_IN_SECOND) as u32
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Duration> {
        self.0.checked_sub(rhs.0).map(Duration::from_nanos)
    }

    pub fn saturating_sub(self, rhs: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(rhs.0))
    }
}

impl From<Duration> for Timestamp {
    fn from(d: Duration) -> Self {
        Self(d.as_nanos() as u64)
    }
}

impl From<Timestamp> for Duration {
    fn from(t: Timestamp) -> Self {
        Duration::from_nanos(t.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Duration::from(*self).fmt(f)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.as_secs(), self.subsec_nanos())
    }
}

impl Add<Duration> for Timestamp {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(rhs.as_nanos() as u64))
    }
}

impl AddAssign<Duration> for Timestamp {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Self::Output {
        self.saturating_sub(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion() {
        let d = Duration::from_millis(1500);
        assert_eq!(d, Duration::from(Timestamp::from(d)));
        assert_eq!(Timestamp::from_secs(3).as_millis(), 3000);
        assert_eq!(Timestamp::from_micros(2_500).as_millis(), 2);
        assert_eq!(Timestamp::from_millis(1500).to_string(), "1.500000000");
    }

    #[test]
    fn arithmetic() {
        let t0 = Timestamp::from_millis(100);
        let t1 = t0 + Duration::from_millis(120);
        assert_eq!(t1 - t0, Duration::from_millis(120));
        assert_eq!(t0 - t1, Duration::ZERO);
        assert_eq!(t0.checked_sub(t1), None);

        let mut t = Timestamp::ZERO;
        t += Duration::from_secs(1);
        assert_eq!(t, Timestamp::from_secs(1));
        assert!(t > t0);
    }
}
