//! The backtracking pattern matcher used by the string library
//!
//! Patterns are Lua-style, not regular expressions: classes like `%a`/`%d`,
//! bracket sets with ranges, the `* + - ?` quantifiers, `^`/`$` anchors,
//! balanced matches (`%b`), frontiers (`%f`), and captures including empty
//! position captures. Matching operates on bytes.

use thiserror::Error;

/// The maximum number of captures a pattern may define
pub const MAX_CAPTURES: usize = 32;

// Backtracking depth guard for pathological patterns
const MAX_DEPTH: usize = 220;

const L_ESC: u8 = b'%';

const CAP_UNFINISHED: isize = -1;
const CAP_POSITION: isize = -2;

/// An error thrown while compiling or running a pattern
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PatternError {
    #[error("malformed pattern (ends with '%')")]
    EndsWithEscape,
    #[error("malformed pattern (missing ']')")]
    MissingBracket,
    #[error("missing '[' after '%f' in pattern")]
    MissingFrontierSet,
    #[error("malformed pattern (missing arguments to '%b')")]
    MissingBalanceArgs,
    #[error("invalid capture index")]
    InvalidCaptureIndex,
    #[error("invalid pattern capture")]
    InvalidPatternCapture,
    #[error("unfinished capture")]
    UnfinishedCapture,
    #[error("too many captures")]
    TooManyCaptures,
    #[error("pattern too complex")]
    TooComplex,
}

/// One captured region of a match
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CaptureSpan {
    /// A span of the subject, as byte offsets `[start, end)`
    Span {
        /// The span's starting byte offset
        start: usize,
        /// The offset one past the span's last byte
        end: usize,
    },
    /// An empty capture recording a 1-based byte position
    Position(usize),
}

/// One match of a pattern against a subject
#[derive(Clone, Debug, PartialEq)]
pub struct MatchData {
    /// The byte offset where the match starts
    pub start: usize,
    /// The byte offset one past the match's end
    pub end: usize,
    captures: Vec<CaptureSpan>,
}

impl MatchData {
    /// The number of explicit captures in the match
    pub fn capture_count(&self) -> usize {
        self.captures.len()
    }

    /// The capture at the given index
    pub fn capture(&self, index: usize) -> Option<CaptureSpan> {
        self.captures.get(index).copied()
    }

    /// The explicit captures, or the whole match span when the pattern has none
    pub fn captures_or_whole(&self) -> Vec<CaptureSpan> {
        if self.captures.is_empty() {
            vec![CaptureSpan::Span {
                start: self.start,
                end: self.end,
            }]
        } else {
            self.captures.clone()
        }
    }
}

struct CapInfo {
    init: usize,
    len: isize,
}

struct MatchState<'a> {
    src: &'a [u8],
    pat: &'a [u8],
    capture: Vec<CapInfo>,
    depth: usize,
}

fn match_class(c: u8, class: u8) -> bool {
    let result = match class.to_ascii_lowercase() {
        b'a' => c.is_ascii_alphabetic(),
        b'c' => c.is_ascii_control(),
        b'd' => c.is_ascii_digit(),
        b'l' => c.is_ascii_lowercase(),
        b'p' => c.is_ascii_punctuation(),
        b's' => matches!(c, b' ' | 0x09..=0x0d),
        b'u' => c.is_ascii_uppercase(),
        b'w' => c.is_ascii_alphanumeric(),
        b'x' => c.is_ascii_hexdigit(),
        _ => return class == c,
    };
    if class.is_ascii_uppercase() {
        !result
    } else {
        result
    }
}

impl<'a> MatchState<'a> {
    fn new(pat: &'a [u8], src: &'a [u8]) -> Self {
        Self {
            src,
            pat,
            capture: Vec::new(),
            depth: 0,
        }
    }

    // The position just past the class starting at p
    fn class_end(&self, p: usize) -> Result<usize, PatternError> {
        match self.pat[p] {
            L_ESC => {
                if p + 1 >= self.pat.len() {
                    Err(PatternError::EndsWithEscape)
                } else {
                    Ok(p + 2)
                }
            }
            b'[' => {
                let mut p = p + 1;
                if self.pat.get(p) == Some(&b'^') {
                    p += 1;
                }
                // the first set entry may be ']' itself
                loop {
                    if p >= self.pat.len() {
                        return Err(PatternError::MissingBracket);
                    }
                    let c = self.pat[p];
                    p += 1;
                    if c == L_ESC {
                        if p >= self.pat.len() {
                            return Err(PatternError::MissingBracket);
                        }
                        p += 1;
                    }
                    if self.pat.get(p) == Some(&b']') {
                        return Ok(p + 1);
                    }
                }
            }
            _ => Ok(p + 1),
        }
    }

    // Set membership: p points at '[', ec at the closing ']'
    fn match_bracket(&self, c: u8, p: usize, ec: usize) -> bool {
        let mut sig = true;
        let mut p = p;
        if self.pat[p + 1] == b'^' {
            sig = false;
            p += 1;
        }
        p += 1;
        while p < ec {
            if self.pat[p] == L_ESC {
                p += 1;
                if match_class(c, self.pat[p]) {
                    return sig;
                }
            } else if self.pat[p + 1] == b'-' && p + 2 < ec {
                p += 2;
                if self.pat[p - 2] <= c && c <= self.pat[p] {
                    return sig;
                }
            } else if self.pat[p] == c {
                return sig;
            }
            p += 1;
        }
        !sig
    }

    fn single_match(&self, s: usize, p: usize, ep: usize) -> bool {
        let Some(&c) = self.src.get(s) else {
            return false;
        };
        match self.pat[p] {
            b'.' => true,
            L_ESC => match_class(c, self.pat[p + 1]),
            b'[' => self.match_bracket(c, p, ep - 1),
            literal => literal == c,
        }
    }

    fn match_balance(&mut self, s: usize, p: usize) -> Result<Option<usize>, PatternError> {
        if p + 1 >= self.pat.len() {
            return Err(PatternError::MissingBalanceArgs);
        }
        if s >= self.src.len() || self.src[s] != self.pat[p] {
            return Ok(None);
        }

        let open = self.pat[p];
        let close = self.pat[p + 1];
        let mut balance = 1;
        let mut i = s + 1;
        while i < self.src.len() {
            if self.src[i] == close {
                balance -= 1;
                if balance == 0 {
                    return Ok(Some(i + 1));
                }
            } else if self.src[i] == open {
                balance += 1;
            }
            i += 1;
        }
        Ok(None)
    }

    fn match_capture(&mut self, s: usize, index: u8) -> Result<Option<usize>, PatternError> {
        let l = index.wrapping_sub(b'1') as usize;
        let cap = match self.capture.get(l) {
            Some(cap) if cap.len != CAP_UNFINISHED && cap.len != CAP_POSITION => cap,
            _ => return Err(PatternError::InvalidCaptureIndex),
        };
        let len = cap.len as usize;
        if self.src.len() - s >= len
            && self.src[cap.init..cap.init + len] == self.src[s..s + len]
        {
            Ok(Some(s + len))
        } else {
            Ok(None)
        }
    }

    fn start_capture(
        &mut self,
        s: usize,
        p: usize,
        what: isize,
    ) -> Result<Option<usize>, PatternError> {
        if self.capture.len() >= MAX_CAPTURES {
            return Err(PatternError::TooManyCaptures);
        }
        self.capture.push(CapInfo { init: s, len: what });
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.capture.pop();
        }
        Ok(result)
    }

    fn end_capture(&mut self, s: usize, p: usize) -> Result<Option<usize>, PatternError> {
        let index = self
            .capture
            .iter()
            .rposition(|cap| cap.len == CAP_UNFINISHED)
            .ok_or(PatternError::InvalidPatternCapture)?;
        self.capture[index].len = (s - self.capture[index].init) as isize;
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.capture[index].len = CAP_UNFINISHED;
        }
        Ok(result)
    }

    fn max_expand(
        &mut self,
        s: usize,
        p: usize,
        ep: usize,
    ) -> Result<Option<usize>, PatternError> {
        let mut i = 0;
        while self.single_match(s + i, p, ep) {
            i += 1;
        }
        // longest first, giving back one byte at a time
        loop {
            if let Some(result) = self.do_match(s + i, ep + 1)? {
                return Ok(Some(result));
            }
            if i == 0 {
                return Ok(None);
            }
            i -= 1;
        }
    }

    fn min_expand(
        &mut self,
        s: usize,
        p: usize,
        ep: usize,
    ) -> Result<Option<usize>, PatternError> {
        let mut s = s;
        loop {
            if let Some(result) = self.do_match(s, ep + 1)? {
                return Ok(Some(result));
            }
            if self.single_match(s, p, ep) {
                s += 1;
            } else {
                return Ok(None);
            }
        }
    }

    fn do_match(&mut self, s: usize, p: usize) -> Result<Option<usize>, PatternError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(PatternError::TooComplex);
        }
        let result = self.do_match_inner(s, p);
        self.depth -= 1;
        result
    }

    fn do_match_inner(&mut self, s: usize, p: usize) -> Result<Option<usize>, PatternError> {
        let mut s = s;
        let mut p = p;
        loop {
            if p >= self.pat.len() {
                return Ok(Some(s));
            }
            match self.pat[p] {
                b'(' => {
                    return if self.pat.get(p + 1) == Some(&b')') {
                        // an empty capture records the current position
                        self.start_capture(s, p + 2, CAP_POSITION)
                    } else {
                        self.start_capture(s, p + 1, CAP_UNFINISHED)
                    };
                }
                b')' => return self.end_capture(s, p + 1),
                b'$' if p + 1 == self.pat.len() => {
                    return Ok((s == self.src.len()).then_some(s));
                }
                L_ESC => match self.pat.get(p + 1) {
                    Some(b'b') => match self.match_balance(s, p + 2)? {
                        Some(next) => {
                            s = next;
                            p += 4;
                            continue;
                        }
                        None => return Ok(None),
                    },
                    Some(b'f') => {
                        p += 2;
                        if self.pat.get(p) != Some(&b'[') {
                            return Err(PatternError::MissingFrontierSet);
                        }
                        let ep = self.class_end(p)?;
                        let previous = if s == 0 { 0 } else { self.src[s - 1] };
                        let current = self.src.get(s).copied().unwrap_or(0);
                        if !self.match_bracket(previous, p, ep - 1)
                            && self.match_bracket(current, p, ep - 1)
                        {
                            p = ep;
                            continue;
                        }
                        return Ok(None);
                    }
                    Some(digit) if digit.is_ascii_digit() => {
                        match self.match_capture(s, *digit)? {
                            Some(next) => {
                                s = next;
                                p += 2;
                                continue;
                            }
                            None => return Ok(None),
                        }
                    }
                    None => return Err(PatternError::EndsWithEscape),
                    _ => {}
                },
                _ => {}
            }

            // a single class, possibly quantified
            let ep = self.class_end(p)?;
            let matched = self.single_match(s, p, ep);
            match self.pat.get(ep) {
                Some(b'?') => {
                    if matched {
                        if let Some(result) = self.do_match(s + 1, ep + 1)? {
                            return Ok(Some(result));
                        }
                    }
                    p = ep + 1;
                }
                Some(b'+') => {
                    return if matched {
                        self.max_expand(s + 1, p, ep)
                    } else {
                        Ok(None)
                    };
                }
                Some(b'*') => return self.max_expand(s, p, ep),
                Some(b'-') => return self.min_expand(s, p, ep),
                _ => {
                    if !matched {
                        return Ok(None);
                    }
                    s += 1;
                    p = ep;
                }
            }
        }
    }

    fn to_match_data(&self, start: usize, end: usize) -> Result<MatchData, PatternError> {
        let mut captures = Vec::with_capacity(self.capture.len());
        for cap in &self.capture {
            match cap.len {
                CAP_POSITION => captures.push(CaptureSpan::Position(cap.init + 1)),
                CAP_UNFINISHED => return Err(PatternError::UnfinishedCapture),
                len => captures.push(CaptureSpan::Span {
                    start: cap.init,
                    end: cap.init + len as usize,
                }),
            }
        }
        Ok(MatchData {
            start,
            end,
            captures,
        })
    }
}

/// Finds up to `limit` non-overlapping matches of `pattern` in `subject`
///
/// `init` is the byte offset matching starts from, and a negative `limit` means
/// "all matches". An empty match advances the search by one byte so that
/// iteration always terminates.
pub fn find_all(
    pattern: &[u8],
    subject: &[u8],
    init: usize,
    limit: i64,
) -> Result<Vec<MatchData>, PatternError> {
    let anchored = pattern.first() == Some(&b'^');
    let pat_start = usize::from(anchored);

    let mut results = Vec::new();
    let mut s = init.min(subject.len());

    while s <= subject.len() {
        if limit >= 0 && results.len() as i64 >= limit {
            break;
        }

        let mut state = MatchState::new(pattern, subject);
        match state.do_match(s, pat_start)? {
            Some(end) => {
                results.push(state.to_match_data(s, end)?);
                s = if end > s { end } else { s + 1 };
            }
            None => s += 1,
        }

        if anchored {
            break;
        }
    }

    Ok(results)
}
