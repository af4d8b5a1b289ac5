/*
 * Copyright (C) 2025 Filament Contributors
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

use std::collections::HashMap;

fn hex_to_byte(c: u8) -> u8 {
    match c {
        b'a'..=b'z' => c - b'a' + 10,
        b'A'..=b'Z' => c - b'A' + 10,
        _ => c.wrapping_sub(b'0'),
    }
}

// decode %XX escapes and '+' (as space). output never exceeds the input in
// length. fails only on a truncated escape at the end of input
pub fn percent_decode(input: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());

    let mut i = 0;

    while i < input.len() {
        match input[i] {
            b'%' => {
                if i + 3 > input.len() {
                    return None;
                }

                out.push(hex_to_byte(input[i + 1]) * 16 + hex_to_byte(input[i + 2]));
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    Some(out)
}

fn decode_param(input: &str) -> Option<String> {
    let decoded = percent_decode(input.as_bytes())?;

    String::from_utf8(decoded).ok()
}

fn add_param(params: &mut HashMap<String, String>, part: &str) {
    let (key, value) = match part.find('=') {
        Some(pos) if pos < part.len() - 1 => (&part[..pos], Some(&part[(pos + 1)..])),
        Some(pos) => (&part[..pos], None),
        None => (part, None),
    };

    let key = match decode_param(key) {
        Some(key) => key,
        None => return,
    };

    let value = match value {
        Some(value) => match decode_param(value) {
            Some(value) => value,
            None => return,
        },
        None => String::new(),
    };

    // duplicate keys: last write wins
    params.insert(key, value);
}

// split a request target into its path and decoded query parameters
pub fn split_query(url: &str) -> (&str, HashMap<String, String>) {
    let mut params = HashMap::new();

    let pos = match url.find('?') {
        Some(pos) => pos,
        None => return (url, params),
    };

    for part in url[(pos + 1)..].split('&') {
        add_param(&mut params, part);
    }

    (&url[..pos], params)
}
