//! Punycode (RFC 3492) and IDNA hostname encoding.
//!
//! Resolver queries are ASCII-only; each non-ASCII label of a hostname is
//! punycode-encoded and prefixed with `xn--`. Pure-ASCII labels pass
//! through untouched.

const BASE: u32 = 36;
const TMIN: u32 = 1;
const TMAX: u32 = 26;
const SKEW: u32 = 38;
const DAMP: u32 = 700;
const INITIAL_BIAS: u32 = 72;
const INITIAL_N: u32 = 128;
const DELIMITER: char = '-';

fn adapt(mut delta: u32, numpoints: u32, firsttime: bool) -> u32 {
    delta /= if firsttime { DAMP } else { 2 };
    delta += delta / numpoints;
    let mut k = 0;
    while delta > ((BASE - TMIN) * TMAX) / 2 {
        delta /= BASE - TMIN;
        k += BASE;
    }
    k + (((BASE - TMIN + 1) * delta) / (delta + SKEW))
}

fn encode_digit(d: u32) -> char {
    // 0..25 → a..z, 26..35 → 0..9
    if d < 26 {
        char::from(b'a' + d as u8)
    } else {
        char::from(b'0' + (d - 26) as u8)
    }
}

fn decode_digit(c: char) -> Option<u32> {
    match c {
        'a'..='z' => Some(c as u32 - 'a' as u32),
        'A'..='Z' => Some(c as u32 - 'A' as u32),
        '0'..='9' => Some(c as u32 - '0' as u32 + 26),
        _ => None,
    }
}

/// Encode one label. ASCII input is returned unchanged (no `xn--` prefix
/// is added here).
pub fn encode(input: &str) -> Option<String> {
    if input.is_ascii() {
        return Some(input.to_string());
    }

    let mut output = String::new();
    let basic: Vec<char> = input.chars().filter(|c| c.is_ascii()).collect();
    for &c in &basic {
        output.push(c);
    }
    let mut handled = basic.len() as u32;
    let basic_len = handled;
    if basic_len > 0 {
        output.push(DELIMITER);
    }

    let input_len = input.chars().count() as u32;
    let mut n = INITIAL_N;
    let mut delta: u32 = 0;
    let mut bias = INITIAL_BIAS;

    while handled < input_len {
        let m = input
            .chars()
            .map(|c| c as u32)
            .filter(|&c| c >= n)
            .min()?;
        delta = delta.checked_add((m - n).checked_mul(handled + 1)?)?;
        n = m;

        for c in input.chars().map(|c| c as u32) {
            if c < n {
                delta = delta.checked_add(1)?;
            } else if c == n {
                let mut q = delta;
                let mut k = BASE;
                loop {
                    let t = if k <= bias {
                        TMIN
                    } else if k >= bias + TMAX {
                        TMAX
                    } else {
                        k - bias
                    };
                    if q < t {
                        break;
                    }
                    output.push(encode_digit(t + ((q - t) % (BASE - t))));
                    q = (q - t) / (BASE - t);
                    k += BASE;
                }
                output.push(encode_digit(q));
                bias = adapt(delta, handled + 1, handled == basic_len);
                delta = 0;
                handled += 1;
            }
        }
        delta = delta.checked_add(1)?;
        n = n.checked_add(1)?;
    }

    Some(output)
}

/// Decode one punycode label (without the `xn--` prefix).
pub fn decode(input: &str) -> Option<String> {
    let mut output: Vec<char> = Vec::new();

    let (basic, extended) = match input.rfind(DELIMITER) {
        Some(pos) => (&input[..pos], &input[pos + 1..]),
        None => ("", input),
    };
    if !basic.is_ascii() {
        return None;
    }
    output.extend(basic.chars());

    let mut n = INITIAL_N;
    let mut i: u32 = 0;
    let mut bias = INITIAL_BIAS;

    let mut chars = extended.chars().peekable();
    while chars.peek().is_some() {
        let oldi = i;
        let mut w: u32 = 1;
        let mut k = BASE;
        loop {
            let digit = decode_digit(chars.next()?)?;
            i = i.checked_add(digit.checked_mul(w)?)?;
            let t = if k <= bias {
                TMIN
            } else if k >= bias + TMAX {
                TMAX
            } else {
                k - bias
            };
            if digit < t {
                break;
            }
            w = w.checked_mul(BASE - t)?;
            k += BASE;
        }

        let out_len = output.len() as u32 + 1;
        bias = adapt(i - oldi, out_len, oldi == 0);
        n = n.checked_add(i / out_len)?;
        i %= out_len;

        let c = char::from_u32(n)?;
        output.insert(i as usize, c);
        i += 1;
    }

    Some(output.into_iter().collect())
}

/// IDNA-encode a hostname label by label. Labels that were not pure ASCII
/// get the `xn--` prefix.
pub fn idna_hostname(hostname: &str) -> Option<String> {
    if hostname.is_ascii() {
        return Some(hostname.to_string());
    }

    let mut parts = Vec::new();
    for label in hostname.split('.') {
        if label.is_ascii() {
            parts.push(label.to_string());
        } else {
            let encoded = encode(label)?;
            parts.push(format!("xn--{}", encoded));
        }
    }
    Some(parts.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passthrough() {
        assert_eq!(encode("example").as_deref(), Some("example"));
        assert_eq!(idna_hostname("example.com").as_deref(), Some("example.com"));
    }

    #[test]
    fn rfc3492_samples() {
        // bücher
        assert_eq!(encode("bücher").as_deref(), Some("bcher-kva"));
        assert_eq!(decode("bcher-kva").as_deref(), Some("bücher"));
        // München
        assert_eq!(encode("München").as_deref(), Some("Mnchen-3ya"));
        assert_eq!(decode("Mnchen-3ya").as_deref(), Some("München"));
    }

    #[test]
    fn round_trip_unicode_labels() {
        for label in ["日本語", "münchen", "ëxämplé", "παράδειγμα", "пример"] {
            let enc = encode(label).unwrap();
            assert!(enc.is_ascii());
            assert_eq!(decode(&enc).unwrap(), label);
        }
    }

    #[test]
    fn hostname_labels_encoded_individually() {
        let out = idna_hostname("bücher.example.com").unwrap();
        assert_eq!(out, "xn--bcher-kva.example.com");
    }
}
