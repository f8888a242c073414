//! Call-stack snapshots.
//!
//! A [`StackSnapshot`] is an immutable list of [`Frame`]s captured once,
//! at the point a fault is classified or a panic is intercepted. Frames are
//! read from [`std::backtrace::Backtrace`]; when the host cannot produce a
//! backtrace the snapshot is simply empty.
//!
//! Two renderings are supported:
//! - `{}` produces a single line: `f (file:line) <- g (file:line)`
//! - `{:#}` produces the full multi-line form, one function per line with
//!   its location indented underneath

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;

use serde::Serialize;

use crate::settings;

/// Frames that belong to taking the snapshot itself.
const CAPTURE_MACHINERY: &[&str] = &[
    "std::backtrace",
    concat!(module_path!(), "::raw_frames"),
    concat!(module_path!(), "::StackSnapshot::capture"),
];

/// Frames through which a panic enters the runtime. The frame right below
/// the last of them (after any other runtime frames) is the panic site.
const PANIC_ENTRY: &[&str] = &[
    "core::panicking::",
    "rust_begin_unwind",
    "__rustc::rust_begin_unwind",
    "std::panicking::begin_panic",
    "std::panic::panic_any",
];

/// Runtime and standard library frames between the panic entry and the
/// code that faulted.
const PANIC_RUNTIME: &[&str] = &[
    "core::panicking::",
    "rust_begin_unwind",
    "__rustc::",
    "std::panicking::",
    "std::panic::panic_any",
    "std::sys::backtrace::",
    "std::sys_common::backtrace::",
    "core::option::expect_failed",
    "core::option::unwrap_failed",
    "core::result::unwrap_failed",
    "core::slice::index::",
    "<usize as core::slice::index::SliceIndex",
];

/// A single frame of a captured stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    /// Demangled function name, `<unknown>` when unresolved.
    pub function: String,
    /// Source file, when debug info is available.
    pub file: Option<String>,
    /// Source line, when debug info is available.
    pub line: Option<u32>,
}

impl Frame {
    fn location(&self) -> Option<String> {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => Some(format!("{}:{}", file, line)),
            (Some(file), None) => Some(file.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location() {
            Some(location) => write!(f, "{} ({})", self.function, location),
            None => f.write_str(&self.function),
        }
    }
}

/// An ordered, immutable call-stack snapshot. The first frame is the
/// innermost one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StackSnapshot {
    frames: Vec<Frame>,
}

impl StackSnapshot {
    /// Captures the current stack, skipping `skip` frames above the caller.
    ///
    /// With `skip == 0` the first frame is the function that called
    /// `capture`. Returns an empty snapshot when stack capture is disabled
    /// in the installed [`Settings`](crate::settings::Settings) or
    /// unsupported on this platform.
    #[inline(never)]
    pub fn capture(skip: usize) -> Self {
        let frames = raw_frames();
        let start = frames
            .iter()
            .position(|frame| !is_capture_machinery(&frame.function))
            .unwrap_or(frames.len());
        Self::bounded(frames.into_iter().skip(start).skip(skip))
    }

    /// Captures the stack from inside a panic hook, starting at the frame
    /// that raised the panic rather than inside the panic runtime.
    #[inline(never)]
    pub fn capture_panic_site() -> Self {
        let frames = raw_frames();
        let start = panic_site(&frames);
        Self::bounded(frames.into_iter().skip(start))
    }

    /// Builds a snapshot from already resolved frames.
    pub fn from_frames(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    fn bounded(frames: impl Iterator<Item = Frame>) -> Self {
        Self {
            frames: frames.take(settings::current().max_frames).collect(),
        }
    }

    /// The captured frames, innermost first.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

impl fmt::Display for StackSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            for frame in &self.frames {
                writeln!(f, "{}", frame.function)?;
                if let Some(location) = frame.location() {
                    writeln!(f, "\t{}", location)?;
                }
            }
            return Ok(());
        }
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                f.write_str(" <- ")?;
            }
            write!(f, "{}", frame)?;
        }
        Ok(())
    }
}

fn is_capture_machinery(function: &str) -> bool {
    CAPTURE_MACHINERY
        .iter()
        .any(|prefix| function.starts_with(prefix))
}

fn is_panic_entry(function: &str) -> bool {
    PANIC_ENTRY.iter().any(|prefix| function.starts_with(prefix))
}

fn is_panic_runtime(function: &str) -> bool {
    if PANIC_RUNTIME
        .iter()
        .any(|prefix| function.starts_with(prefix))
    {
        return true;
    }
    // `Option::expect`, `Result::unwrap` and friends, and `Vec` indexing
    let checked_access = function.starts_with("core::option::Option<")
        || function.starts_with("core::result::Result<");
    (checked_access && (function.contains(">::expect") || function.contains(">::unwrap")))
        || (function.starts_with("<alloc::vec::Vec<")
            && function.contains("as core::ops::index::Index"))
}

/// Index of the first frame below the panic runtime.
///
/// The hook runs on top of the runtime frames, so everything up to the
/// first entry frame is the hook itself. Past the entry, runtime frames
/// are skipped until the code that panicked. Deeper runtime frames, such
/// as the `catch_unwind` of the enclosing protected call, are kept.
fn panic_site(frames: &[Frame]) -> usize {
    let Some(entry) = frames
        .iter()
        .position(|frame| is_panic_entry(&frame.function))
    else {
        return frames
            .iter()
            .position(|frame| !is_capture_machinery(&frame.function))
            .unwrap_or(0);
    };
    frames[entry..]
        .iter()
        .position(|frame| !is_panic_runtime(&frame.function))
        .map_or(frames.len(), |offset| entry + offset)
}

fn raw_frames() -> Vec<Frame> {
    if !settings::current().capture_stacks {
        return Vec::new();
    }
    let backtrace = Backtrace::force_capture();
    if backtrace.status() != BacktraceStatus::Captured {
        return Vec::new();
    }
    parse_backtrace(&backtrace.to_string())
}

/// Parses the rendering of a [`Backtrace`]:
///
/// ```text
///    0: my_crate::handler
///              at ./src/handler.rs:12:5
///    1: <unknown>
/// ```
fn parse_backtrace(rendered: &str) -> Vec<Frame> {
    let mut frames: Vec<Frame> = Vec::new();
    for line in rendered.lines() {
        let line = line.trim();
        if let Some(location) = line.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut() {
                let (file, line) = split_location(location);
                frame.file = Some(file);
                frame.line = line;
            }
            continue;
        }
        if let Some((index, function)) = line.split_once(": ") {
            if !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) {
                frames.push(Frame {
                    function: function.trim().to_string(),
                    file: None,
                    line: None,
                });
            }
        }
    }
    frames
}

/// Splits `file:line:column` (column optional) from the right, so drive
/// letters and colons inside the path survive.
fn split_location(location: &str) -> (String, Option<u32>) {
    let mut parts = location.rsplitn(3, ':');
    let last = parts.next().unwrap_or_default();
    let middle = parts.next();
    let rest = parts.next();
    match (middle, rest) {
        (Some(line), Some(file)) if line.parse::<u32>().is_ok() && last.parse::<u32>().is_ok() => {
            (file.to_string(), line.parse().ok())
        }
        (Some(file), _) if last.parse::<u32>().is_ok() => {
            let file = match rest {
                Some(prefix) => format!("{}:{}", prefix, file),
                None => file.to_string(),
            };
            (file, last.parse().ok())
        }
        _ => (location.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RENDERED: &str = "   0: demo::inner
             at ./src/inner.rs:10:5
   1: demo::outer::{{closure}}
             at ./src/outer.rs:42:9
   2: <unknown>
   3: std::rt::lang_start
             at /rustc/abc/library/std/src/rt.rs:199:17
";

    #[test]
    fn test_parse_backtrace_frames() {
        let frames = parse_backtrace(RENDERED);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].function, "demo::inner");
        assert_eq!(frames[0].file.as_deref(), Some("./src/inner.rs"));
        assert_eq!(frames[0].line, Some(10));
        assert_eq!(frames[1].function, "demo::outer::{{closure}}");
        assert_eq!(frames[2].function, "<unknown>");
        assert!(frames[2].file.is_none());
        assert_eq!(frames[3].line, Some(199));
    }

    #[test]
    fn test_parse_ignores_unsupported_rendering() {
        assert!(parse_backtrace("unsupported backtrace").is_empty());
        assert!(parse_backtrace("disabled backtrace").is_empty());
    }

    #[test]
    fn test_split_location_variants() {
        assert_eq!(
            split_location("./src/lib.rs:12:5"),
            ("./src/lib.rs".to_string(), Some(12))
        );
        assert_eq!(
            split_location("C:\\src\\lib.rs:7:1"),
            ("C:\\src\\lib.rs".to_string(), Some(7))
        );
        assert_eq!(
            split_location("./src/lib.rs:12"),
            ("./src/lib.rs".to_string(), Some(12))
        );
        assert_eq!(split_location("weird"), ("weird".to_string(), None));
    }

    #[test]
    fn test_renderings() {
        let snapshot = StackSnapshot::from_frames(parse_backtrace(RENDERED));

        let short = snapshot.to_string();
        assert!(!short.contains('\n'));
        assert!(short.starts_with("demo::inner (./src/inner.rs:10) <- "));

        let full = format!("{:#}", snapshot);
        assert!(full.contains("demo::inner\n\t./src/inner.rs:10\n"));
        assert!(full.contains("<unknown>\nstd::rt::lang_start\n"));
    }

    fn frames(names: &[&str]) -> Vec<Frame> {
        names
            .iter()
            .map(|name| Frame {
                function: name.to_string(),
                file: None,
                line: None,
            })
            .collect()
    }

    #[test]
    fn test_panic_site_skips_hook_and_runtime() {
        let frames = frames(&[
            "panic_recovery::stack::StackSnapshot::capture_panic_site",
            "panic_recovery::hook::install::{{closure}}",
            "<alloc::boxed::Box<dyn for<'a, 'b> core::ops::function::Fn<(&'a std::panic::PanicHookInfo<'b>,)>+Output = ()+core::marker::Send+core::marker::Sync> as core::ops::function::Fn<(&std::panic::PanicHookInfo,)>>::call",
            "std::panicking::panic_with_hook",
            "std::panicking::panic_handler::{{closure}}",
            "std::sys::backtrace::__rust_end_short_backtrace",
            "__rustc::rust_begin_unwind",
            "core::panicking::panic_fmt",
            "demo::faulty",
            "demo::faulty::{{closure}}",
            "std::panicking::catch_unwind::do_call",
            "std::panicking::catch_unwind",
        ]);
        let start = panic_site(&frames);
        assert_eq!(frames[start].function, "demo::faulty");
        assert!(frames[..start]
            .iter()
            .any(|frame| frame.function.starts_with("core::panicking")));
        // the enclosing catch_unwind stays part of the snapshot
        assert_eq!(frames.len() - start, 4);
    }

    #[test]
    fn test_panic_site_skips_panic_any_and_expect() {
        let frames = frames(&[
            "panic_recovery::hook::install::{{closure}}",
            "std::panicking::rust_panic_with_hook",
            "std::panicking::begin_panic::{{closure}}",
            "std::sys::backtrace::__rust_end_short_backtrace",
            "std::panicking::begin_panic",
            "std::panic::panic_any",
            "demo::raise",
        ]);
        assert_eq!(frames[panic_site(&frames)].function, "demo::raise");

        let frames = frames_for_expect();
        assert_eq!(frames[panic_site(&frames)].function, "demo::lookup");
    }

    fn frames_for_expect() -> Vec<Frame> {
        frames(&[
            "panic_recovery::hook::install::{{closure}}",
            "std::panicking::panic_with_hook",
            "__rustc::rust_begin_unwind",
            "core::panicking::panic_fmt",
            "core::panicking::panic_display",
            "core::option::expect_failed",
            "core::option::Option<T>::expect",
            "demo::lookup",
        ])
    }

    #[test]
    fn test_panic_site_without_runtime_frames() {
        let frames = frames(&["std::backtrace::Backtrace::force_capture", "demo::only"]);
        assert_eq!(panic_site(&frames), 1);
    }

    #[test]
    fn test_frame_classification() {
        assert!(is_panic_entry("core::panicking::panic_bounds_check"));
        assert!(is_panic_entry("std::panicking::begin_panic::{{closure}}"));
        assert!(!is_panic_entry("std::panicking::catch_unwind"));
        assert!(is_panic_runtime("<usize as core::slice::index::SliceIndex<[T]>>::index"));
        assert!(is_panic_runtime(
            "<alloc::vec::Vec<T,A> as core::ops::index::Index<I>>::index"
        ));
        assert!(!is_panic_runtime("my_app::handler"));
        assert!(is_capture_machinery("panic_recovery::stack::raw_frames"));
        assert!(!is_capture_machinery("panic_recovery::stack::tests::caller"));
    }

    #[inline(never)]
    fn capture_here() -> StackSnapshot {
        StackSnapshot::capture(0)
    }

    #[test]
    fn test_capture_starts_at_caller() {
        let snapshot = capture_here();
        if let Some(first) = snapshot.frames().first() {
            assert!(
                first.function.ends_with("capture_here"),
                "first frame was {}",
                first.function
            );
        }
    }

    #[test]
    fn test_capture_is_bounded() {
        let snapshot = StackSnapshot::capture(0);
        assert!(snapshot.len() <= settings::current().max_frames);
    }

    #[test]
    fn test_capture_from_other_thread() {
        let handle = std::thread::spawn(|| StackSnapshot::capture(0));
        let snapshot = handle.join().expect("capture thread panicked");
        assert!(snapshot.len() <= settings::current().max_frames);
    }

    #[inline(never)]
    fn capture_above_caller() -> StackSnapshot {
        StackSnapshot::capture(1)
    }

    #[inline(never)]
    fn calls_capture_above() -> StackSnapshot {
        capture_above_caller()
    }

    #[test]
    fn test_capture_skips_requested_frames() {
        let snapshot = calls_capture_above();
        if let Some(first) = snapshot.frames().first() {
            assert!(
                first.function.ends_with("calls_capture_above"),
                "first frame was {}",
                first.function
            );
        }
    }
}
