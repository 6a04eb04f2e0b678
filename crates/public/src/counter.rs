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

use std::fmt;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterType {
    Counted,
    Gauged,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CounterValue {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

impl fmt::Display for CounterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterValue::Signed(v) => write!(f, "{}", v),
            CounterValue::Unsigned(v) => write!(f, "{}", v),
            CounterValue::Float(v) => write!(f, "{:.3}", v),
        }
    }
}

pub type Counter = (&'static str, CounterType, CounterValue);

pub trait RefCountable: Send + Sync {
    fn get_counters(&self) -> Vec<Counter>;
}

// Renders counters as "module: a=1 b=2" for log lines.
pub fn format_counters(module: &str, counters: &[Counter]) -> String {
    let mut s = String::from(module);
    s.push(':');
    for (name, _, value) in counters {
        s.push_str(&format!(" {}={}", name, value));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format() {
        let counters = vec![
            ("requests", CounterType::Counted, CounterValue::Unsigned(3)),
            ("pending", CounterType::Gauged, CounterValue::Signed(-1)),
        ];
        assert_eq!(
            format_counters("http", &counters),
            "http: requests=3 pending=-1"
        );
    }
}
