//! Dot stuffing for DATA content (RFC 5321 §4.5.2).
//!
//! Inside DATA, any line whose first byte is `.` gets an extra `.`
//! prepended so the server cannot mistake it for the end-of-data marker.
//! The filter treats `\n` as the line boundary; a lone CR does not start a
//! new line until its LF arrives.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineState {
    /// At the beginning of a line (initial state, or just past a newline).
    Start,
    /// Somewhere inside a line.
    Mid,
    /// Saw CR; the next LF completes the line.
    Cr,
}

impl LineState {
    fn advance(self, byte: u8) -> LineState {
        match byte {
            b'\n' => LineState::Start,
            b'\r' => LineState::Cr,
            _ => LineState::Mid,
        }
    }
}

/// Escapes leading dots in DATA content and emits the end-of-data marker.
///
/// Feed the message through [`process`](DotStuffer::process) in arbitrary
/// chunks, then call [`finish`](DotStuffer::finish) exactly once. `finish`
/// guarantees a terminal CRLF before the `.` marker even when the message
/// does not end with one.
#[derive(Debug)]
pub struct DotStuffer {
    state: LineState,
    wrote: bool,
}

impl Default for DotStuffer {
    fn default() -> Self {
        Self { state: LineState::Start, wrote: false }
    }
}

impl DotStuffer {
    /// Creates a fresh filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Escapes one chunk into `out`.
    pub fn process(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        for &byte in chunk {
            if self.state == LineState::Start && byte == b'.' {
                out.push(b'.');
            }
            self.state = self.state.advance(byte);
            out.push(byte);
            self.wrote = true;
        }
    }

    /// Emits the end-of-data marker into `out` and resets the filter.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        match self.state {
            LineState::Start if self.wrote => out.extend_from_slice(b".\r\n"),
            LineState::Cr => out.extend_from_slice(b"\n.\r\n"),
            _ => out.extend_from_slice(b"\r\n.\r\n"),
        }
        self.state = LineState::Start;
        self.wrote = false;
    }
}

/// Reverses [`DotStuffer`]: strips one leading `.` from every line that has
/// one. Left inverse of the escaping filter for CRLF-terminated content.
#[derive(Debug)]
pub struct DotUnstuffer {
    state: LineState,
}

impl Default for DotUnstuffer {
    fn default() -> Self {
        Self { state: LineState::Start }
    }
}

impl DotUnstuffer {
    /// Creates a fresh filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Unescapes one chunk into `out`.
    pub fn process(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        for &byte in chunk {
            if self.state == LineState::Start && byte == b'.' {
                // Swallow the stuffing dot; the rest of the line follows.
                self.state = LineState::Mid;
                continue;
            }
            self.state = self.state.advance(byte);
            out.push(byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stuff(input: &[u8]) -> Vec<u8> {
        let mut filter = DotStuffer::new();
        let mut out = Vec::new();
        filter.process(input, &mut out);
        out
    }

    fn stuff_and_finish(input: &[u8]) -> Vec<u8> {
        let mut filter = DotStuffer::new();
        let mut out = Vec::new();
        filter.process(input, &mut out);
        filter.finish(&mut out);
        out
    }

    fn unstuff(input: &[u8]) -> Vec<u8> {
        let mut filter = DotUnstuffer::new();
        let mut out = Vec::new();
        filter.process(input, &mut out);
        out
    }

    #[test]
    fn test_leading_dot_doubled() {
        assert_eq!(stuff(b".\r\n"), b"..\r\n");
        assert_eq!(stuff(b".hidden\r\n"), b"..hidden\r\n");
        assert_eq!(stuff(b"...\r\n"), b"....\r\n");
    }

    #[test]
    fn test_interior_dots_untouched() {
        assert_eq!(stuff(b"a.b\r\nc.d\r\n"), b"a.b\r\nc.d\r\n");
    }

    #[test]
    fn test_bare_lf_starts_a_line() {
        assert_eq!(stuff(b"a\n.b\r\n"), b"a\n..b\r\n");
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let mut filter = DotStuffer::new();
        let mut out = Vec::new();
        filter.process(b"Hi\r", &mut out);
        filter.process(b"\n.bye\r\n", &mut out);
        assert_eq!(out, b"Hi\r\n..bye\r\n");
    }

    #[test]
    fn test_finish_terminator() {
        assert_eq!(stuff_and_finish(b""), b"\r\n.\r\n");
        assert_eq!(stuff_and_finish(b"Hi\r\n"), b"Hi\r\n.\r\n");
        assert_eq!(stuff_and_finish(b"Hi"), b"Hi\r\n.\r\n");
        assert_eq!(stuff_and_finish(b"Hi\r"), b"Hi\r\n.\r\n");
    }

    #[test]
    fn test_message_body_ends_with_single_marker() {
        assert_eq!(stuff_and_finish(b".\r\n"), b"..\r\n.\r\n");
    }

    #[test]
    fn test_unstuff_reverses_stuff() {
        let cases: &[&[u8]] = &[
            b"",
            b"plain\r\n",
            b".\r\n",
            b"..\r\n",
            b".leading\r\nmiddle.\r\n...\r\n",
            b"no trailing newline",
            b"a\n.bare lf\r\n",
            b"\r\n.\r\n",
        ];
        for &case in cases {
            assert_eq!(
                unstuff(&stuff(case)),
                case,
                "round trip failed for {:?}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn test_stuffing_is_single_application() {
        // Stuffing already-stuffed content doubles dots again: the filter
        // must be applied exactly once per message.
        let once = stuff(b".\r\n");
        let twice = stuff(&once);
        assert_eq!(twice, b"...\r\n");
    }
}
