//! Progress notifications of a flashing session.
use std::path::PathBuf;

use indicatif::ProgressStyle;

/// Snapshot sent after every confirmed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// 1-based index of the page just written
    pub page: usize,
    pub total_pages: usize,
    /// Byte address of that page
    pub address: u32,
    /// Bytes sent on the wire so far, gap filling included
    pub bytes_written: usize,
    /// Image bytes covered so far
    pub image_bytes_done: usize,
    pub image_bytes_total: usize,
}

impl Progress {
    pub fn percentage(&self) -> u8 {
        if self.image_bytes_total == 0 {
            return 100;
        }
        (self.image_bytes_done * 100 / self.image_bytes_total).min(100) as u8
    }
}

pub trait ProgressObserver {
    fn on_progress(&mut self, progress: &Progress);
}

/// Ignores every notification.
#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_progress(&mut self, _progress: &Progress) {}
}

/// Rewrites `path` with the completion percentage, for external monitors.
#[derive(Debug)]
pub struct ProgressFile {
    path: PathBuf,
}

impl ProgressFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        ProgressFile { path: path.into() }
    }
}

impl ProgressObserver for ProgressFile {
    fn on_progress(&mut self, progress: &Progress) {
        let text = progress.percentage().to_string();
        if let Err(e) = std::fs::write(&self.path, text) {
            log::warn!("Failed to write progress to {}: {}", self.path.display(), e);
        }
    }
}

/// Terminal progress bar over the image bytes.
#[derive(Default)]
pub struct ProgressBar {
    bar: Option<indicatif::ProgressBar>,
}

impl ProgressBar {
    pub fn new() -> Self {
        Self::default()
    }

    fn bar(&mut self, total: u64) -> &indicatif::ProgressBar {
        self.bar.get_or_insert_with(|| {
            let pb = indicatif::ProgressBar::new(total);
            let style = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({msg})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-");
            pb.set_style(style);
            pb
        })
    }
}

impl ProgressObserver for ProgressBar {
    fn on_progress(&mut self, progress: &Progress) {
        let pb = self.bar(progress.image_bytes_total as u64);
        pb.set_position(progress.image_bytes_done as u64);
        pb.set_message(format!("page {}/{}", progress.page, progress.total_pages));
        if progress.page == progress.total_pages {
            pb.finish_with_message("Flash complete");
        }
    }
}

/// Forwards every notification to all observers.
#[derive(Default)]
pub struct Fanout {
    observers: Vec<Box<dyn ProgressObserver>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<O: ProgressObserver + 'static>(mut self, observer: O) -> Self {
        self.observers.push(Box::new(observer));
        self
    }
}

impl ProgressObserver for Fanout {
    fn on_progress(&mut self, progress: &Progress) {
        for observer in self.observers.iter_mut() {
            observer.on_progress(progress);
        }
    }
}
