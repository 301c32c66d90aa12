//! Byte filter that strips the control characters XML 1.0 forbids.
//!
//! Raw bytes `0x00-0x08`, `0x0B`, `0x0C` and `0x0E-0x1F` are dropped, as are
//! character references (`&#N;` / `&#xH;`, leading zeros allowed) that name
//! one of those same code points. Tab, LF and CR survive in both forms. Every
//! other byte passes through untouched, so multi-byte UTF-8 is never split or
//! rewritten.

use std::io::{self, Read};

const READ_CHUNK: usize = 64 * 1024;

/// Digits looked at in one reference, leading zeros included.
const MAX_REF_DIGITS: usize = 8;

/// `&#x` + digits + `;`, the longest reference the filter removes.
const MAX_REF_LEN: usize = MAX_REF_DIGITS + 4;

#[inline]
fn is_forbidden_control(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0C | 0x0E..=0x1F)
}

/// Length of the forbidden character reference starting at `bytes[0]`.
fn forbidden_ref_len(bytes: &[u8]) -> Option<usize> {
    let rest = bytes.strip_prefix(b"&#")?;
    let (radix, body) = match rest.strip_prefix(b"x") {
        Some(hex) => (16, hex),
        None => (10, rest),
    };
    let digits = body
        .iter()
        .take(MAX_REF_DIGITS + 1)
        .take_while(|&&b| (b as char).is_digit(radix))
        .count();
    if !(1..=MAX_REF_DIGITS).contains(&digits) || body.get(digits) != Some(&b';') {
        return None;
    }
    let text = std::str::from_utf8(&body[..digits]).ok()?;
    let value = u32::from_str_radix(text, radix).ok()?;
    let consumed = bytes.len() - body.len() + digits + 1;
    u8::try_from(value)
        .is_ok_and(is_forbidden_control)
        .then_some(consumed)
}

/// Appends the filtered form of `input` to `out`.
pub fn sanitize_into(input: &[u8], out: &mut Vec<u8>) {
    out.reserve(input.len());
    let mut i = 0;
    while i < input.len() {
        let b = input[i];
        if is_forbidden_control(b) {
            i += 1;
            continue;
        }
        if b == b'&' {
            if let Some(len) = forbidden_ref_len(&input[i..]) {
                i += len;
                continue;
            }
        }
        out.push(b);
        i += 1;
    }
}

pub fn sanitize_bytes(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    sanitize_into(input, &mut out);
    out
}

/// Number of trailing bytes that could still grow into a forbidden
/// reference once more input arrives.
fn undecided_tail(buf: &[u8]) -> usize {
    let window = buf.len().saturating_sub(MAX_REF_LEN - 1);
    match buf[window..].iter().rposition(|&b| b == b'&') {
        Some(p) if !buf[window + p..].contains(&b';') => buf.len() - (window + p),
        _ => 0,
    }
}

/// [`Read`] adapter applying [`sanitize_into`] to everything read from `inner`.
///
/// Reads never fail because of content, only when `inner` does. A reference
/// cut in half by an inner read is held back until the rest of it arrives.
pub struct SanitizingReader<R> {
    inner: R,
    pending: Vec<u8>,
    ready: Vec<u8>,
    cursor: usize,
    eof: bool,
}

impl<R: Read> SanitizingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::with_capacity(READ_CHUNK + MAX_REF_LEN),
            ready: Vec::with_capacity(READ_CHUNK),
            cursor: 0,
            eof: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn refill(&mut self) -> io::Result<()> {
        let start = self.pending.len();
        self.pending.resize(start + READ_CHUNK, 0);
        let read = loop {
            match self.inner.read(&mut self.pending[start..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.pending.truncate(start);
                    return Err(e);
                }
            }
        };
        self.pending.truncate(start + read);
        if read == 0 {
            self.eof = true;
        }

        let hold = if self.eof {
            0
        } else {
            undecided_tail(&self.pending)
        };
        let decided = self.pending.len() - hold;

        self.ready.clear();
        self.cursor = 0;
        sanitize_into(&self.pending[..decided], &mut self.ready);
        self.pending.drain(..decided);
        Ok(())
    }
}

impl<R: Read> Read for SanitizingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.cursor == self.ready.len() {
            if self.eof {
                return Ok(0);
            }
            self.refill()?;
        }
        let n = (self.ready.len() - self.cursor).min(buf.len());
        buf[..n].copy_from_slice(&self.ready[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out at most `step` bytes per read.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    fn read_all<R: Read>(mut r: R) -> Vec<u8> {
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn drops_raw_control_bytes_but_keeps_whitespace() {
        let input = b"a\x00b\x08c\td\ne\rf\x0bg\x0ch\x0ei\x1fj";
        assert_eq!(sanitize_bytes(input), b"abc\td\ne\rfghij");
    }

    #[test]
    fn drops_forbidden_decimal_references() {
        assert_eq!(sanitize_bytes(b"x&#0;y&#8;z"), b"xyz");
        assert_eq!(sanitize_bytes(b"&#11;&#12;&#14;&#31;"), b"");
        assert_eq!(sanitize_bytes(b"&#9;&#10;&#13;"), b"&#9;&#10;&#13;");
        assert_eq!(sanitize_bytes(b"&#32;&#65;&#127;"), b"&#32;&#65;&#127;");
    }

    #[test]
    fn drops_forbidden_hex_references() {
        assert_eq!(sanitize_bytes(b"&#x0;&#x8;&#xb;&#xC;&#x1F;&#x1a;"), b"");
        assert_eq!(sanitize_bytes(b"&#x9;&#xA;&#xd;"), b"&#x9;&#xA;&#xd;");
        assert_eq!(sanitize_bytes(b"&#x20;&#xbc;&#xef;"), b"&#x20;&#xbc;&#xef;");
    }

    #[test]
    fn leaves_lookalikes_and_entities_alone() {
        let input = b"&amp; &lt; &#; &#x; &#123; &#1 &#x1G; & #1;";
        assert_eq!(sanitize_bytes(input), input.to_vec());
    }

    #[test]
    fn passes_multibyte_utf8_through() {
        let input = "Società € 日本 😀".as_bytes();
        assert_eq!(sanitize_bytes(input), input);
    }

    #[test]
    fn reference_split_across_reads_is_still_removed() {
        let input = b"<CAR>12&#x1F;34&#5;56\x01</CAR>";
        for step in 1..=input.len() {
            let out = read_all(SanitizingReader::new(Trickle { data: input, step }));
            assert_eq!(out, b"<CAR>123456</CAR>", "step {step}");
        }
    }

    #[test]
    fn trailing_partial_reference_is_flushed_at_eof() {
        let input = b"abc&#1";
        let out = read_all(SanitizingReader::new(Trickle { data: input, step: 2 }));
        assert_eq!(out, input);
    }

    #[test]
    fn undecided_tail_only_holds_back_open_references() {
        assert_eq!(undecided_tail(b"hello"), 0);
        assert_eq!(undecided_tail(b"hello&#x1"), 4);
        assert_eq!(undecided_tail(b"hello&#1;"), 0);
        assert_eq!(undecided_tail(b"&#x0000001"), 10);
        assert_eq!(undecided_tail(b"&abcdefghijklmn"), 0);
    }

    #[test]
    fn leading_zeros_do_not_hide_a_forbidden_reference() {
        assert_eq!(sanitize_bytes(b"&#x01F;z&#001;&#00000008;"), b"z");
        assert_eq!(sanitize_bytes(b"&#x0041;&#0010;&#000000000001;"), b"&#x0041;&#0010;&#000000000001;");
        let input = b"<COR>&#x0001F;z</COR>";
        for step in 1..=input.len() {
            let out = read_all(SanitizingReader::new(Trickle { data: input, step }));
            assert_eq!(out, b"<COR>z</COR>", "step {step}");
        }
    }
}
