// Copyright (c) The disttest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{aggregator::synthesized, helpers::truncate_text};
use disttest_wire::FailureSummary;
use std::{
    any::{Any, type_name},
    backtrace::{Backtrace, BacktraceStatus},
    error,
    fmt::{self, Write as _},
};

/// A traceback that can be rendered to text.
pub trait Traceback {
    /// Renders the traceback. Rendering nothing is allowed.
    fn render(&self, out: &mut dyn fmt::Write) -> fmt::Result;
}

impl Traceback for Backtrace {
    fn render(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        match self.status() {
            BacktraceStatus::Captured => write!(out, "{self}"),
            // Disabled or unsupported backtraces have nothing useful to say.
            _ => Ok(()),
        }
    }
}

/// A failure object produced by a test framework.
///
/// The framework knows how to name and render its own failures, and both
/// accessors are used as is.
pub trait StructuredFailure {
    /// Returns the fully-qualified class name of the failure.
    fn class_name(&self) -> &str;

    /// Renders the failure's message along with its traceback, if any.
    fn render_traceback(&self, out: &mut dyn fmt::Write) -> fmt::Result;
}

/// A [`StructuredFailure`] captured from a Rust error.
///
/// Everything is rendered when the failure is captured, so a
/// `CapturedFailure` can outlive the error it was made from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedFailure {
    class_name: String,
    message: String,
    traceback: String,
}

impl CapturedFailure {
    /// Creates a failure from its parts.
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
            traceback: String::new(),
        }
    }

    /// Captures `error`, named after its Rust type.
    ///
    /// A backtrace is captured as well if `RUST_BACKTRACE` or
    /// `RUST_LIB_BACKTRACE` enable it.
    pub fn capture<E: error::Error + 'static>(error: &E) -> Self {
        Self::capture_with_traceback(error, &Backtrace::capture())
    }

    /// Captures `error` along with the given traceback.
    pub fn capture_with_traceback<E: error::Error + 'static>(
        error: &E,
        traceback: &dyn Traceback,
    ) -> Self {
        let class_name = type_name::<E>();
        let mut message = String::new();
        if let Err(fmt_error) = write!(message, "{error}") {
            message = render_fallback(class_name, fmt_error);
        }
        let mut rendered = String::new();
        if traceback.render(&mut rendered).is_err() {
            rendered.clear();
        }
        Self {
            class_name: class_name.to_owned(),
            message,
            traceback: rendered,
        }
    }

    /// Attaches a rendered traceback.
    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = traceback.into();
        self
    }

    /// Returns the failure's message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl StructuredFailure for CapturedFailure {
    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn render_traceback(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        out.write_str(&self.message)?;
        write_traceback_section(out, &self.traceback)
    }
}

/// A failure given as its three parts: type name, value, and traceback.
#[derive(Clone, Copy)]
pub struct RawExcInfo<'a> {
    /// The fully-qualified name of the failure's type.
    pub type_name: &'a str,

    /// The failure value.
    pub value: &'a dyn fmt::Display,

    /// The traceback, if one was captured.
    pub traceback: Option<&'a dyn Traceback>,
}

impl<'a> RawExcInfo<'a> {
    /// Creates a new `RawExcInfo` from its parts.
    pub fn new(
        type_name: &'a str,
        value: &'a dyn fmt::Display,
        traceback: Option<&'a dyn Traceback>,
    ) -> Self {
        Self {
            type_name,
            value,
            traceback,
        }
    }

    /// Creates a `RawExcInfo` for a Rust error, named after its type.
    pub fn from_error<E: error::Error + 'static>(error: &'a E) -> Self {
        Self::new(type_name::<E>(), error, None)
    }

    /// Creates a `RawExcInfo` for a panic payload.
    ///
    /// `&str` and `String` payloads are named after their type. Anything
    /// else becomes a `disttest::Panic` with a generic message.
    pub fn from_panic(payload: &'a (dyn Any + Send)) -> Self {
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            Self::new(type_name::<&'static str>(), message, None)
        } else if let Some(message) = payload.downcast_ref::<String>() {
            Self::new(type_name::<String>(), message, None)
        } else {
            Self::new(synthesized::PANIC, &"panicked with a non-string payload", None)
        }
    }

    /// Attaches a traceback.
    pub fn with_traceback(mut self, traceback: &'a dyn Traceback) -> Self {
        self.traceback = Some(traceback);
        self
    }
}

impl fmt::Debug for RawExcInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawExcInfo")
            .field("type_name", &self.type_name)
            .field("value", &format_args!("{}", self.value))
            .field("has_traceback", &self.traceback.is_some())
            .finish()
    }
}

/// Failure information passed to an
/// [`OutcomeReporter`](super::OutcomeReporter), in either supported shape.
#[derive(Clone, Copy)]
pub enum ExcInfo<'a> {
    /// A framework-native failure object.
    Structured(&'a dyn StructuredFailure),

    /// A raw type name, value, and traceback.
    Raw(RawExcInfo<'a>),
}

impl<'a> ExcInfo<'a> {
    /// Returns the class name that will be reported.
    pub fn class_name(&self) -> &str {
        match self {
            Self::Structured(failure) => failure.class_name(),
            Self::Raw(raw) => raw.type_name,
        }
    }

    /// Renders this failure into the form sent over the wire.
    ///
    /// Never fails: if rendering fails, the text names the class and the
    /// render error instead. Text longer than `max_text_bytes` is truncated.
    pub fn summarize(&self, max_text_bytes: usize) -> FailureSummary {
        let class_name = self.class_name();
        let mut text = String::new();
        let res = match self {
            Self::Structured(failure) => failure.render_traceback(&mut text),
            Self::Raw(raw) => render_raw(raw, &mut text),
        };
        if let Err(error) = res {
            text = render_fallback(class_name, error);
        }
        FailureSummary::new(class_name, truncate_text(text, max_text_bytes))
    }
}

impl<'a> From<&'a CapturedFailure> for ExcInfo<'a> {
    fn from(failure: &'a CapturedFailure) -> Self {
        Self::Structured(failure)
    }
}

impl<'a> From<RawExcInfo<'a>> for ExcInfo<'a> {
    fn from(raw: RawExcInfo<'a>) -> Self {
        Self::Raw(raw)
    }
}

impl fmt::Debug for ExcInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structured(failure) => f
                .debug_tuple("Structured")
                .field(&failure.class_name())
                .finish(),
            Self::Raw(raw) => f.debug_tuple("Raw").field(raw).finish(),
        }
    }
}

fn render_raw(raw: &RawExcInfo<'_>, out: &mut String) -> fmt::Result {
    write!(out, "{}", raw.value)?;
    if let Some(traceback) = raw.traceback {
        let mut rendered = String::new();
        traceback.render(&mut rendered)?;
        write_traceback_section(out, &rendered)?;
    }
    Ok(())
}

fn write_traceback_section(out: &mut dyn fmt::Write, traceback: &str) -> fmt::Result {
    if traceback.is_empty() {
        return Ok(());
    }
    write!(out, "\n\nstack backtrace:\n{traceback}")
}

fn render_fallback(class_name: &str, error: fmt::Error) -> String {
    format!("<failed to render failure of class {class_name}: {error}>")
}
