//! Ambient logging for relay-core: a small callback trait rather than a
//! `log`/`tracing` facade, since embedders of a library bus usually want to
//! route these lines through their own process's logger, not have one
//! bundled in.

/// Minimal structured-ish logging sink. Mutable receiver so a CLI can
/// buffer lines for a progress bar.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Reporter that writes to stderr with a level prefix, for embedders that
/// don't need anything fancier.
#[derive(Debug, Default)]
pub struct StderrReporter;

impl Reporter for StderrReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

/// Reporter that discards everything; useful in tests.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}
