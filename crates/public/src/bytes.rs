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

// ASCII helpers for text protocols. None of these allocate.

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub fn find_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

// trims spaces and horizontal tabs
pub fn trim_sp_ht(mut bs: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bs {
        bs = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bs {
        bs = rest;
    }
    bs
}

// Parses a non-empty run of ASCII decimal digits. Anything else,
// including signs, whitespace and overflow, is rejected.
pub fn parse_dec(bs: &[u8]) -> Option<usize> {
    if bs.is_empty() {
        return None;
    }
    let mut n: usize = 0;
    for b in bs {
        if !b.is_ascii_digit() {
            return None;
        }
        n = n.checked_mul(10)?.checked_add((b - b'0') as usize)?;
    }
    Some(n)
}

pub fn parse_hex(bs: &[u8]) -> Option<usize> {
    if bs.is_empty() {
        return None;
    }
    let mut n: usize = 0;
    for b in bs {
        let d = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return None,
        };
        n = n.checked_mul(16)?.checked_add(d as usize)?;
    }
    Some(n)
}
