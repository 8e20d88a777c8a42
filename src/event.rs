//! Structured progress events and the sinks that consume them.
//!
//! Event rendering is explicitly out of scope for the core (spec.md §1:
//! "progress-rendering formatters" are an external collaborator), but the
//! core still has to emit *something* for every image/tag/layer operation
//! (spec.md §7 "User-visible behavior"). This module is the seam: the
//! core only ever calls [`EventSink::emit`], never `println!` directly.
//! [`ConsoleSink`] reproduces the teacher crate's `OutputManager` emoji
//! style for interactive use; [`CapturingSink`] is for tests that assert
//! on the event sequence instead of scraping stdout.

use std::sync::Mutex;

/// One structured progress record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A pull of `repository:reference` has started against `endpoint`.
    Pulling { repository: String, reference: String, endpoint: String },
    /// A push of `repository:reference` has started against `endpoint`.
    Pushing { repository: String, reference: String, endpoint: String },
    /// A layer's signature or digest is being checked.
    Verifying { layer: String },
    /// A layer already exists locally or remotely; no transfer needed.
    AlreadyExists { layer: String },
    /// A layer finished downloading.
    DownloadComplete { layer: String, bytes: u64 },
    /// A layer finished uploading.
    Pushed { layer: String, bytes: u64 },
    /// A tag was created or moved.
    Tagging { repository: String, reference: String, image_id: String },
    /// A recoverable problem on one endpoint; the loop will try the next.
    EndpointFallback { endpoint: String, message: String },
    /// A terminal failure for the layer/image named.
    Error { subject: String, message: String },
    /// Two or more concurrent callers are transferring the same key.
    AlreadyInProgress { kind: &'static str, key: String },
}

/// A narrow sink for [`Event`]s. Implementors decide how (or whether) to
/// render them; the core never assumes a terminal exists.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Reproduces the teacher crate's verbosity-gated console style.
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    pub verbose: bool,
    pub quiet: bool,
}

impl ConsoleSink {
    pub fn new(verbose: bool) -> Self {
        Self { verbose, quiet: false }
    }

    pub fn quiet() -> Self {
        Self { verbose: false, quiet: true }
    }
}

impl EventSink for ConsoleSink {
    fn emit(&self, event: Event) {
        if self.quiet {
            if let Event::Error { subject, message } = &event {
                eprintln!("\u{274c} {subject}: {message}");
            }
            return;
        }
        match event {
            Event::Pulling { repository, reference, endpoint } => {
                println!("\u{23f3} Pulling {repository}:{reference} from {endpoint}");
            }
            Event::Pushing { repository, reference, endpoint } => {
                println!("\u{23f3} Pushing {repository}:{reference} to {endpoint}");
            }
            Event::Verifying { layer } => {
                if self.verbose {
                    println!("\u{1f50d} Verifying checksum for {layer}");
                }
            }
            Event::AlreadyExists { layer } => println!("\u{2705} {layer}: already exists"),
            Event::DownloadComplete { layer, bytes } => {
                println!("\u{2705} {layer}: download complete ({bytes} bytes)")
            }
            Event::Pushed { layer, bytes } => println!("\u{2705} {layer}: pushed ({bytes} bytes)"),
            Event::Tagging { repository, reference, image_id } => {
                println!("\u{1f4cc} {repository}:{reference} -> {image_id}")
            }
            Event::EndpointFallback { endpoint, message } => {
                if self.verbose {
                    println!("\u{26a0}\u{fe0f}  {endpoint} unusable, trying next endpoint: {message}");
                }
            }
            Event::Error { subject, message } => eprintln!("\u{274c} {subject}: {message}"),
            Event::AlreadyInProgress { kind, key } => {
                println!("{key} is already being {kind}ed by another caller, waiting...")
            }
        }
    }
}

/// Collects every emitted event in order, for assertions in tests.
#[derive(Default)]
pub struct CapturingSink {
    events: Mutex<Vec<Event>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for CapturingSink {
    fn emit(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// An [`EventSink`] that discards everything; the default for contexts
/// that don't care about progress output (e.g. library callers that only
/// want the final `Result`).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}
