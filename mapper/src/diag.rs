// diag.rs — Unified diagnostics model
//
// Shared diagnostic types used across all mapper passes, plus the
// accumulating sink with the hard error cap: a pass may keep reporting past
// the first recoverable error, but after `MAX_ERRORS` errors the sink stops
// accepting more so output stays bounded.

use std::fmt;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0108`, `W0301`).
///
/// Codes are `&'static str` constants defined in the `codes` module. Once
/// assigned, a code must never be reassigned to a different semantic
/// meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    // specification errors
    pub const E0100: DiagCode = DiagCode("E0100"); // unknown kernel
    pub const E0101: DiagCode = DiagCode("E0101"); // wrong argument count
    pub const E0102: DiagCode = DiagCode("E0102"); // incompatible base type
    pub const E0103: DiagCode = DiagCode("E0103"); // incompatible access type
    pub const E0104: DiagCode = DiagCode("E0104"); // out-of-bounds sub-array index
    pub const E0105: DiagCode = DiagCode("E0105"); // zero-sized index range
    pub const E0106: DiagCode = DiagCode("E0106"); // too many indexing operations
    pub const E0107: DiagCode = DiagCode("E0107"); // incompatible block size
    pub const E0108: DiagCode = DiagCode("E0108"); // uninitialized read
    pub const E0109: DiagCode = DiagCode("E0109"); // output left unspecified
    pub const E0110: DiagCode = DiagCode("E0110"); // overlapping writers
    pub const E0111: DiagCode = DiagCode("E0111"); // unresolved false dependency
    pub const E0112: DiagCode = DiagCode("E0112"); // write to a program output
    pub const E0113: DiagCode = DiagCode("E0113"); // unconnected input interface
    pub const E0114: DiagCode = DiagCode("E0114"); // incompatible dependency anchors
    pub const E0115: DiagCode = DiagCode("E0115"); // buffer spans task divisions

    // topology errors
    pub const E0200: DiagCode = DiagCode("E0200"); // cyclic task dependencies

    // resource errors
    pub const E0300: DiagCode = DiagCode("E0300"); // buffer too large for any bank
    pub const E0301: DiagCode = DiagCode("E0301"); // platform memory exhausted
    pub const E0302: DiagCode = DiagCode("E0302"); // bank assignment gave up
    pub const E0303: DiagCode = DiagCode("E0303"); // buffer without a valid bank

    // mapping errors
    pub const E0400: DiagCode = DiagCode("E0400"); // unknown task in mapping
    pub const E0401: DiagCode = DiagCode("E0401"); // unknown core in mapping
    pub const E0402: DiagCode = DiagCode("E0402"); // group without members
    pub const E0403: DiagCode = DiagCode("E0403"); // group in two divisions
    pub const E0404: DiagCode = DiagCode("E0404"); // unreachable memory

    // pass sequencing
    pub const E0500: DiagCode = DiagCode("E0500"); // required pass missing

    // scheduling
    pub const E0600: DiagCode = DiagCode("E0600"); // list scheduling failed

    // sink itself
    pub const E0900: DiagCode = DiagCode("E0900"); // error cap reached

    pub const W0100: DiagCode = DiagCode("W0100"); // ambiguous task name
    pub const W0300: DiagCode = DiagCode("W0300"); // memory pressure over 90%
    pub const W0301: DiagCode = DiagCode("W0301"); // cache conflicts exceed associativity
    pub const W0302: DiagCode = DiagCode("W0302"); // cache index distance reduced
    pub const W0303: DiagCode = DiagCode("W0303"); // cache behaviour not guaranteed
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Source location ──────────────────────────────────────────────────────

/// A source-location hint handed over by the front-end. The mapper never
/// sees source text, only these records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrcLoc {
    pub file: String,
    pub line: u32,
}

impl SrcLoc {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        SrcLoc {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for SrcLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A diagnostic emitted by any pass.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub loc: Option<SrcLoc>,
    pub message: String,
    pub hint: Option<String>,
    pub related: Vec<(Option<SrcLoc>, String)>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Diagnostic {
            code: None,
            level,
            loc: None,
            message: message.into(),
            hint: None,
            related: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, message)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a source-location hint.
    pub fn with_loc(mut self, loc: SrcLoc) -> Self {
        self.loc = Some(loc);
        self
    }

    pub fn with_loc_opt(mut self, loc: Option<SrcLoc>) -> Self {
        self.loc = loc;
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a related item (e.g. the second writer of a conflict).
    pub fn with_related(mut self, loc: Option<SrcLoc>, label: impl Into<String>) -> Self {
        self.related.push((loc, label.into()));
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(loc) = &self.loc {
            write!(f, "\n  at {}", loc)?;
        }
        for (loc, label) in &self.related {
            match loc {
                Some(l) => write!(f, "\n  * {} ({})", label, l)?,
                None => write!(f, "\n  * {}", label)?,
            }
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

// ── Sink ─────────────────────────────────────────────────────────────────

/// Hard cap on accumulated errors; one final `E0900` marks the cut-off.
pub const MAX_ERRORS: usize = 100;

/// Accumulates diagnostics across a pass run.
#[derive(Debug, Default)]
pub struct DiagSink {
    diags: Vec<Diagnostic>,
    errors: usize,
    capped: bool,
}

impl DiagSink {
    pub fn new() -> Self {
        DiagSink::default()
    }

    pub fn report(&mut self, diag: Diagnostic) {
        if diag.level == DiagLevel::Error {
            if self.capped {
                return;
            }
            self.errors += 1;
            if self.errors > MAX_ERRORS {
                self.capped = true;
                self.diags.push(
                    Diagnostic::error(format!(
                        "more than {} errors; further errors suppressed",
                        MAX_ERRORS
                    ))
                    .with_code(codes::E0900),
                );
                return;
            }
        }
        self.diags.push(diag);
    }

    pub fn error(&mut self, code: DiagCode, message: impl Into<String>) {
        self.report(Diagnostic::error(message).with_code(code));
    }

    pub fn warning(&mut self, code: DiagCode, message: impl Into<String>) {
        self.report(Diagnostic::warning(message).with_code(code));
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn capped(&self) -> bool {
        self.capped
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diags
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        self.diags
    }

    /// Splits off everything reported since `mark` (see [`DiagSink::mark`]).
    pub fn mark(&self) -> usize {
        self.diags.len()
    }

    pub fn since(&self, mark: usize) -> &[Diagnostic] {
        &self.diags[mark..]
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
